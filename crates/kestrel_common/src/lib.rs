//! Shared foundation for the kestrel KvStore: error taxonomy, configuration,
//! exponential backoff, and protocol-wide constants.

pub mod backoff;
pub mod config;
pub mod constants;
pub mod error;

pub use backoff::ExponentialBackoff;
pub use config::{FilterConfig, FloodRate, KvStoreConfig, SyncConfig};
pub use error::{ErrorClass, KvStoreError, KvStoreResult};
