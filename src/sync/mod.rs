//! Chain synchronization
//!
//! The [`Synchronizer`] decides who to sync with and when; a
//! [`BlockFetcher`] moves one block range from one peer into the chain.

pub mod fetcher;
pub mod synchronizer;

pub use fetcher::{BlockFetcher, FetchError, FetcherConfig};
pub use synchronizer::{SyncConfig, SyncError, Synchronizer, FORCE_SYNC_INTERVALS};
