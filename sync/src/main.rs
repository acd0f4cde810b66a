//! Stash Sync - one lock-guarded sync of a local store with a shared
//! directory.

use stash_engine::Store;
use stash_sync::{FsRemote, Resumption, SyncConfig, SyncCoordinator, SyncOptions};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stash_sync=debug,stash_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = SyncConfig::from_env()?;
    let schema = config.load_schema()?;

    tracing::info!(
        db = %config.db_path.display(),
        remote = %config.remote_dir.display(),
        source = %config.source_id,
        "Starting Stash Sync"
    );

    // Open the local store
    let db_path = config.db_path.clone();
    let store = tokio::task::spawn_blocking(move || Store::load(&db_path, schema)).await??;
    tracing::info!(records = store.len(), dialect = %store.dialect(), "Local store loaded");

    let remote = Arc::new(FsRemote::new(&config.remote_dir));
    let options = SyncOptions {
        force: config.force,
    };
    let coordinator = Arc::new(SyncCoordinator::new(Arc::new(store), remote, config));

    // Ctrl-C cancels the attempt; an acquired lock is still released.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling sync");
            on_signal.cancel();
        }
    });

    match coordinator.spawn(options, cancel).await? {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(failure) => {
            for path in &failure.resumptions {
                match path {
                    Resumption::Retry => tracing::info!("Run again to retry"),
                    Resumption::Force => tracing::warn!(
                        "Set STASH_FORCE=true to sync over the lock. \
                         Changes made by the lock holder may be lost"
                    ),
                }
            }
            if failure.lock_left_behind {
                tracing::error!("The remote lock marker must be removed by hand");
            }
            Err(failure.into())
        }
    }
}
