use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;

use subdaap_bridge::cache::{CacheKind, FileCache};
use subdaap_bridge::cache_manager::CacheManager;
use subdaap_bridge::catalog::CatalogStore;
use subdaap_bridge::cli::{Cli, Command};
use subdaap_bridge::config::Config;
use subdaap_bridge::provider::Provider;
use subdaap_bridge::scheduler::Scheduler;
use subdaap_bridge::state::StateStore;
use subdaap_bridge::subsonic::{Client, TranscodePolicy};
use subdaap_bridge::sync::Synchronizer;

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!("failed to load config at {}: {err}", cli.config.display());
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config, cli.command).await {
        log::error!("fatal: {err}");
        std::process::exit(1);
    }
}

async fn run(config: Config, command: Command) -> Result<(), subdaap_bridge::BridgeError> {
    let catalog = Arc::new(CatalogStore::open(&config.provider.database_path).await?);
    let state = Arc::new(StateStore::load(config.provider.state_path.clone()).await?);

    let item_cache = Arc::new(FileCache::new(
        CacheKind::Item,
        config.provider.item_cache_dir.clone(),
        config.provider.item_cache_size_mb * 1024 * 1024,
        config.provider.item_cache_prune_threshold,
    )?);
    let artwork_cache = Arc::new(FileCache::new(
        CacheKind::Artwork,
        config.provider.artwork_cache_dir.clone(),
        config.provider.artwork_cache_size_mb * 1024 * 1024,
        config.provider.artwork_cache_prune_threshold,
    )?);

    let provider = Arc::new(Provider::new(Arc::clone(&item_cache), Arc::clone(&artwork_cache)));

    let mut synchronizers = Vec::with_capacity(config.origins.len());
    let mut clients_by_database = HashMap::new();

    for (origin_index, origin) in config.origins.iter().enumerate() {
        let client = Arc::new(Client::new(origin));
        let synchronizer = Arc::new(Synchronizer::new(
            origin_index,
            origin.clone(),
            Arc::clone(&client),
            Arc::clone(&catalog),
            Arc::clone(&state),
            Arc::clone(&provider),
        ));

        // Upsert this origin's `database` row up front so the Provider can
        // resolve it to a Subsonic client before the first `synchronize()`
        // pass has necessarily run (e.g. a `cache` item resolved from a
        // catalog snapshot left over from a previous run).
        let database = synchronizer.ensure_database().await?;
        let policy = TranscodePolicy::from_origin(origin);
        provider.register_origin(database.id, Arc::clone(&client), policy);
        clients_by_database.insert(database.id, Arc::clone(&client));

        synchronizers.push(synchronizer);
    }

    let cache_manager = Arc::new(CacheManager::new(
        Arc::clone(&item_cache),
        Arc::clone(&artwork_cache),
        Arc::clone(&catalog),
        clients_by_database,
    ));

    match command {
        Command::Sync => {
            for synchronizer in &synchronizers {
                let report = synchronizer.synchronize().await?;
                log::info!(
                    "{}: sync complete (items_changed={}, containers_changed={}, skipped={})",
                    synchronizer.label(),
                    report.items_changed,
                    report.containers_changed,
                    report.skipped
                );
            }
            cache_manager.cache().await?;
        }
        Command::Cache => {
            cache_manager.cache().await?;
        }
        Command::Serve => {
            for synchronizer in &synchronizers {
                let _ = synchronizer.synchronize().await;
            }
            cache_manager.cache().await?;

            let scheduler = Scheduler::new(Arc::clone(&cache_manager), synchronizers);
            let handles = scheduler.start();

            log::info!("subdaap-bridge: scheduler started, serving {} origin(s)", config.origins.len());
            tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
            log::info!("shutting down");

            for handle in handles {
                handle.abort();
            }
        }
    }

    Ok(())
}
