//! Ban list
//!
//! Identities that misbehaved are refused until their ban expires. Expired
//! entries are dropped lazily on lookup.

use crate::network::peer::PeerId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default ban duration
pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(60);

/// Banned identities and their expiry
#[derive(Debug, Default)]
pub struct BanList {
    entries: Mutex<HashMap<PeerId, Instant>>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PeerId, Instant>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ban `id` for `duration`. A longer existing ban is kept.
    pub fn ban(&self, id: PeerId, duration: Duration) -> Instant {
        let expiry = Instant::now() + duration;
        let mut entries = self.entries();
        let entry = entries.entry(id).or_insert(expiry);
        if *entry < expiry {
            *entry = expiry;
        }
        *entry
    }

    /// True while `id` has an unexpired ban
    pub fn is_banned(&self, id: &PeerId) -> bool {
        let mut entries = self.entries();
        match entries.get(id) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                entries.remove(id);
                false
            }
            None => false,
        }
    }

    pub fn unban(&self, id: &PeerId) -> bool {
        self.entries().remove(id).is_some()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, expiry| *expiry > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
