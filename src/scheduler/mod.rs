//! Cooperative periodic task runner: one job per Synchronizer trigger plus
//! the Cache Manager's expire/clean passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache_manager::CacheManager;
use crate::config::SynchronizationMode;
use crate::sync::{Synchronizer, SyncError};

const CACHE_EXPIRE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CACHE_CLEAN_INTERVAL: Duration = Duration::from_secs(30 * 60);
const STARTUP_DELAY: Duration = Duration::from_secs(1);

/// Spawns and owns the bridge's background jobs. `max_instances = 1` per job
/// is realized with a per-job `Mutex` that a tick's spawned worker
/// `try_lock`s: if a previous tick's worker is still running, the new one
/// logs and returns immediately rather than queuing behind it.
pub struct Scheduler {
    cache_manager: Arc<CacheManager>,
    synchronizers: Vec<Arc<Synchronizer>>,
}

impl Scheduler {
    pub fn new(cache_manager: Arc<CacheManager>, synchronizers: Vec<Arc<Synchronizer>>) -> Self {
        Self {
            cache_manager,
            synchronizers,
        }
    }

    /// Spawns the startup-sync job, one interval-sync job per `Interval`
    /// origin, and the cache expire/clean jobs. Callers that want a clean
    /// shutdown must `abort()` each returned handle themselves.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.spawn_startup_sync()];

        for synchronizer in &self.synchronizers {
            if synchronizer.mode() == SynchronizationMode::Interval {
                handles.push(self.spawn_interval_sync(Arc::clone(synchronizer)));
            }
        }

        handles.push(self.spawn_cache_expire());
        handles.push(self.spawn_cache_clean());

        handles
    }

    /// Runs once, after a short settling delay, for every origin configured
    /// with `synchronization = startup` that has never completed an initial
    /// sync. Does not reschedule itself.
    fn spawn_startup_sync(&self) -> JoinHandle<()> {
        let synchronizers: Vec<Arc<Synchronizer>> = self
            .synchronizers
            .iter()
            .filter(|s| s.mode() == SynchronizationMode::Startup)
            .cloned()
            .collect();

        tokio::spawn(async move {
            tokio::time::sleep(STARTUP_DELAY).await;

            for synchronizer in synchronizers {
                if synchronizer.has_completed_initial_sync().await {
                    continue;
                }
                run_synchronize(&synchronizer).await;
            }
        })
    }

    fn spawn_interval_sync(&self, synchronizer: Arc<Synchronizer>) -> JoinHandle<()> {
        let period = Duration::from_secs(synchronizer.interval_minutes().unwrap_or(60) * 60);
        let running = Arc::new(Mutex::new(()));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                interval.tick().await;
                let synchronizer = Arc::clone(&synchronizer);
                let running = Arc::clone(&running);

                tokio::spawn(async move {
                    let Ok(_guard) = running.try_lock() else {
                        log::warn!(
                            "{}: previous interval sync still running, skipping this tick",
                            synchronizer.label()
                        );
                        return;
                    };
                    run_synchronize(&synchronizer).await;
                });
            }
        })
    }

    fn spawn_cache_expire(&self) -> JoinHandle<()> {
        let cache_manager = Arc::clone(&self.cache_manager);
        let running = Arc::new(Mutex::new(()));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_EXPIRE_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                interval.tick().await;
                let cache_manager = Arc::clone(&cache_manager);
                let running = Arc::clone(&running);

                tokio::spawn(async move {
                    let Ok(_guard) = running.try_lock() else {
                        log::warn!("cache manager: previous expire pass still running, skipping this tick");
                        return;
                    };
                    if let Err(err) = cache_manager.expire().await {
                        log::error!("cache manager: expire pass failed: {err}");
                    }
                });
            }
        })
    }

    fn spawn_cache_clean(&self) -> JoinHandle<()> {
        let cache_manager = Arc::clone(&self.cache_manager);
        let running = Arc::new(Mutex::new(()));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_CLEAN_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                interval.tick().await;
                let cache_manager = Arc::clone(&cache_manager);
                let running = Arc::clone(&running);

                tokio::spawn(async move {
                    let Ok(_guard) = running.try_lock() else {
                        log::warn!("cache manager: previous clean pass still running, skipping this tick");
                        return;
                    };
                    if let Err(err) = cache_manager.clean(false).await {
                        log::error!("cache manager: clean pass failed: {err}");
                    }
                });
            }
        })
    }
}

/// Periodic-sync error recovery: transient remote failures are logged and
/// leave the stored version untouched so the next tick retries; anything
/// else is an error worth surfacing loudly but still doesn't stop the
/// scheduler.
async fn run_synchronize(synchronizer: &Arc<Synchronizer>) {
    match synchronizer.synchronize().await {
        Ok(report) => {
            log::info!(
                "{}: sync complete (items_changed={}, containers_changed={}, skipped={})",
                synchronizer.label(),
                report.items_changed,
                report.containers_changed,
                report.skipped
            );
        }
        Err(SyncError::RemoteUnavailable(msg)) => {
            log::warn!(
                "{}: remote unavailable during sync, will retry next tick: {msg}",
                synchronizer.label()
            );
        }
        Err(SyncError::RemoteProtocol(msg)) => {
            log::warn!(
                "{}: unparseable response from remote during sync, will retry next tick: {msg}",
                synchronizer.label()
            );
        }
        Err(err) => {
            log::error!("{}: sync failed: {err}", synchronizer.label());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogStore;
    use crate::config::{OriginConfig, TranscodeMode};
    use crate::provider::Provider;
    use crate::state::StateStore;
    use crate::subsonic::Client;
    use httpmock::prelude::*;
    use std::collections::HashMap;

    fn origin_config(base_url: &str, mode: SynchronizationMode) -> OriginConfig {
        OriginConfig {
            url: base_url.to_string(),
            username: "alice".to_string(),
            password: "hunter2".to_string(),
            synchronization: mode,
            synchronization_interval_minutes: None,
            transcode: TranscodeMode::No,
            transcode_unsupported: Default::default(),
        }
    }

    async fn new_cache_manager(catalog: Arc<CatalogStore>) -> Arc<CacheManager> {
        let dir = tempfile::tempdir().unwrap();
        let item_cache = Arc::new(
            crate::cache::FileCache::new(crate::cache::CacheKind::Item, dir.path().join("items"), 0, 0.2)
                .unwrap(),
        );
        let artwork_cache = Arc::new(
            crate::cache::FileCache::new(crate::cache::CacheKind::Artwork, dir.path().join("art"), 0, 0.2)
                .unwrap(),
        );
        Arc::new(CacheManager::new(item_cache, artwork_cache, catalog, HashMap::new()))
    }

    #[tokio::test]
    async fn startup_job_runs_once_for_never_synced_startup_origins() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/rest/getIndexes");
            then.status(200).json_body(serde_json::json!({
                "subsonic-response": {"status": "ok", "indexes": {"index": [], "child": []}}
            }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/rest/getPlaylists");
            then.status(200).json_body(serde_json::json!({
                "subsonic-response": {"status": "ok", "playlists": {"playlist": []}}
            }));
        });

        let origin = origin_config(&server.base_url(), SynchronizationMode::Startup);
        let client = Arc::new(Client::new(&origin));
        let catalog = Arc::new(CatalogStore::in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateStore::load(dir.path().join("state.json")).await.unwrap());
        let item_cache = Arc::new(
            crate::cache::FileCache::new(crate::cache::CacheKind::Item, dir.path().join("items"), 0, 0.2)
                .unwrap(),
        );
        let artwork_cache = Arc::new(
            crate::cache::FileCache::new(crate::cache::CacheKind::Artwork, dir.path().join("art"), 0, 0.2)
                .unwrap(),
        );
        let provider = Arc::new(Provider::new(item_cache, artwork_cache));

        let synchronizer = Arc::new(Synchronizer::new(0, origin, client, Arc::clone(&catalog), Arc::clone(&state), provider));
        let cache_manager = new_cache_manager(Arc::clone(&catalog)).await;

        let scheduler = Scheduler::new(cache_manager, vec![Arc::clone(&synchronizer)]);
        let handles = scheduler.start();

        // Give the startup job (1s settling delay + its own sync pass) room
        // to complete, then tear every spawned job down.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        for handle in handles {
            handle.abort();
        }

        assert!(synchronizer.has_completed_initial_sync().await);
    }
}
