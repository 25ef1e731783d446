use crate::cache::CacheError;
use crate::cache_manager::CacheManagerError;
use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::provider::ProviderError;
use crate::state::StateError;
use crate::subsonic::SubsonicError;
use crate::sync::SyncError;

/// Top-level error composing every subsystem's error enum.
///
/// Individual subsystems return their own error type; this exists for callers
/// (the Scheduler, an embedding binary) that want a single type to match on.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("subsonic error: {0}")]
    Subsonic(#[from] SubsonicError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("cache manager error: {0}")]
    CacheManager(#[from] CacheManagerError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}
