//! Handles that remember the configuration chain applied to them.

use crate::error::{CoreError, CoreResult};
use crate::handle::config::Configs;
use crate::handle::connection::Handle;
use std::ops::Deref;
use tracing::{debug, warn};

/// A [`Handle`] together with the [`Configs`] it currently runs with.
///
/// A handle whose reconfiguration failed halfway is left unconfigured:
/// its state is unknown, so it refuses further reconfiguration and the
/// pool closes it instead of recycling it.
#[derive(Debug)]
pub struct ConfiguredHandle {
    handle: Handle,
    configs: Option<Configs>,
}

impl ConfiguredHandle {
    /// Wraps a freshly opened handle, configured with the empty chain.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            configs: Some(Configs::new()),
        }
    }

    /// Returns the chain currently applied, or `None` if unconfigured.
    #[must_use]
    pub fn configs(&self) -> Option<&Configs> {
        self.configs.as_ref()
    }

    /// Returns true unless a reconfiguration failed.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.configs.is_some()
    }

    /// Makes `configs` the applied chain.
    ///
    /// Does nothing and returns false when the chain is already applied.
    /// Otherwise the current chain is undone in reverse order and the new
    /// one invoked in order; returns true.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's config error. The handle is then
    /// unconfigured.
    pub fn reconfigure(&mut self, configs: &Configs) -> CoreResult<bool> {
        let Some(current) = self.configs.take() else {
            return Err(CoreError::invalid_operation(
                "handle lost its configuration and must be closed",
            ));
        };
        if &current == configs {
            self.configs = Some(current);
            return Ok(false);
        }

        for config in current.iter().rev() {
            if let Err(error) = config.uninvoke(&self.handle) {
                warn!(path = %self.handle.path().display(), error = %error, "uninvoking config failed");
                return Err(error);
            }
        }
        for config in configs.iter() {
            if let Err(error) = config.invoke(&self.handle) {
                warn!(path = %self.handle.path().display(), error = %error, "invoking config failed");
                return Err(error);
            }
        }
        debug!(path = %self.handle.path().display(), steps = configs.len(), "handle reconfigured");
        self.configs = Some(configs.clone());
        Ok(true)
    }

    /// Unwraps the handle.
    #[must_use]
    pub fn into_handle(self) -> Handle {
        self.handle
    }
}

impl Deref for ConfiguredHandle {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}
