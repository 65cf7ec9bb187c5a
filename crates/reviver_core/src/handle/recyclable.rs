//! Values that hand themselves back when dropped.

use std::fmt;
use std::ops::{Deref, DerefMut};

type Recycler<T> = Box<dyn FnOnce(T) + Send>;

/// Owns a `T` and passes it to a recycler on drop.
pub struct Recyclable<T> {
    value: Option<T>,
    recycler: Option<Recycler<T>>,
}

impl<T> Recyclable<T> {
    /// Wraps `value`; `recycler` receives it back on drop.
    pub fn new(value: T, recycler: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            value: Some(value),
            recycler: Some(Box::new(recycler)),
        }
    }

    /// Takes the value out without recycling it.
    #[must_use]
    pub fn detach(mut self) -> Option<T> {
        self.recycler = None;
        self.value.take()
    }

    fn get(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("value is present until drop or detach"),
        }
    }

    fn get_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("value is present until drop or detach"),
        }
    }
}

impl<T> Deref for Recyclable<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T> DerefMut for Recyclable<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.get_mut()
    }
}

impl<T> Drop for Recyclable<T> {
    fn drop(&mut self) {
        if let (Some(value), Some(recycler)) = (self.value.take(), self.recycler.take()) {
            recycler(value);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Recyclable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Recyclable").field(&self.value).finish()
    }
}
