//! Change tracking between consecutive backups.
//!
//! Within one WAL generation frames are only appended, so every page
//! written since a backup is held by a committed frame of the WAL the next
//! backup sees, as long as the generation (the WAL salts) is unchanged. A
//! backup in the same generation as its predecessor re-reads only those
//! pages and copies the recorded hashes of every other leaf.
//!
//! A new generation, a database without WAL, a different page size, or too
//! many changed pages make the next backup a full one.

use crate::repair::material::Material;

/// Incremental backups allowed in a row before a full one is forced.
pub const MAX_INCREMENTAL_BACKUPS: u32 = 32;

/// Changed pages above which a backup starts over from scratch.
pub const MAX_INCREMENTAL_PAGES: usize = 4096;

/// What one backup leaves for the next backup of the same database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncrementalMaterial {
    /// Salts of the WAL the backup read, zero without WAL.
    pub wal_salt: (u32, u32),
    /// Incremental backups since the last full one.
    pub incremental_backups: u32,
    /// Leaf hashes the backup copied from the previous material.
    pub reused_pages: usize,
}

impl IncrementalMaterial {
    /// Returns true if the backup that produced this state extended an
    /// older material.
    #[must_use]
    pub const fn is_incremental(&self) -> bool {
        self.incremental_backups > 0
    }

    /// Returns true if `previous` may be extended by a backup reading a WAL
    /// with `salt` and `changed_pages` committed pages.
    #[must_use]
    pub fn accepts(
        &self,
        previous: &Material,
        salt: Option<(u32, u32)>,
        page_size: u32,
        changed_pages: usize,
    ) -> bool {
        let Some(salt) = salt else {
            return false;
        };
        salt != (0, 0)
            && self.wal_salt == salt
            && previous.info.wal_salt == salt
            && previous.info.page_size == page_size
            && self.incremental_backups < MAX_INCREMENTAL_BACKUPS
            && changed_pages <= MAX_INCREMENTAL_PAGES
    }
}
