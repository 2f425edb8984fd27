use std::sync::Arc;

use relaydrop::blob_store::{BlobStore, FsBlobStore, MemoryBlobStore};
use relaydrop::config::RelayServerConfig;
use relaydrop::relay::{app, RelayState};
use relaydrop::{logging, rlog};

#[tokio::main]
async fn main() {
    logging::init();
    let config = RelayServerConfig::from_env();

    let blobs: Arc<dyn BlobStore> = match &config.data_dir {
        Some(dir) => Arc::new(
            FsBlobStore::open(dir.clone())
                .unwrap_or_else(|error| panic!("failed to open {}: {error}", dir.display())),
        ),
        None => Arc::new(MemoryBlobStore::new()),
    };
    let state = RelayState::new(config.relay, blobs);

    let (stats_tx, stats_rx) = tokio::sync::oneshot::channel();
    state.start_stats_log_task(stats_rx);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap_or_else(|error| panic!("failed to bind {}: {error}", config.bind_addr));
    rlog!("relay: listening on {}", config.bind_addr);

    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .unwrap_or_else(|error| panic!("server error: {error}"));

    let _ = stats_tx.send(());
    state.shutdown().await;
}
