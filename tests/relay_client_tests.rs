use std::time::Duration;

use axum::Router;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use relaydrop::protocol::FileDescriptor;
use relaydrop::queue::Outcome;
use relaydrop::relay::{app, RelayConfig, RelayState};
use relaydrop::relay_client::{ClientError, RelayClient, RelayClientConfig, RetryPolicy};

async fn start_relay() -> (String, RelayState, oneshot::Sender<()>) {
    let state = RelayState::in_memory(RelayConfig {
        rate_limit_bps: 0,
        ..RelayConfig::default()
    });
    let app: Router = app(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("http://{}", addr), state, shutdown_tx)
}

fn client_with(base_url: &str, peer_id: &str, max_concurrent: usize, retry: RetryPolicy) -> RelayClient {
    let mut config = RelayClientConfig::new(base_url, peer_id);
    config.rate_limit_bps = 0;
    config.max_concurrent = max_concurrent;
    config.retry = retry;
    RelayClient::new(config).expect("client")
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(20),
        factor: 1.2,
        max_delay: Duration::from_millis(50),
    }
}

fn three_chunk_file() -> FileDescriptor {
    FileDescriptor {
        file_id: "f".into(),
        file_name: "a.bin".into(),
        file_size: 12,
        total_chunks: 3,
    }
}

/// Alice stages chunks 0 and 1 of a three-chunk file; bob registers it.
async fn staged_pair(base_url: &str, bob: &RelayClient) -> RelayClient {
    let alice = client_with(base_url, "alice", 3, RetryPolicy::default());
    alice.start_session().await.unwrap();
    alice.register_file(&three_chunk_file()).await.unwrap();
    let scope = CancellationToken::new();
    alice.upload_chunk("f", 0, b"aaaa", &scope).await.unwrap();
    alice.upload_chunk("f", 1, b"bbbb", &scope).await.unwrap();

    bob.start_session().await.unwrap();
    bob.register_file(&three_chunk_file()).await.unwrap();
    alice
}

#[tokio::test]
async fn download_waits_for_a_late_upload() {
    let (base_url, _state, shutdown_tx) = start_relay().await;
    let bob = client_with(&base_url, "bob", 3, fast_retry(50));
    let alice = staged_pair(&base_url, &bob).await;

    let scope = CancellationToken::new();
    let (downloaded, uploaded) = tokio::join!(bob.download_chunk("f", 2, &scope), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        alice.upload_chunk("f", 2, b"cc", &scope).await
    });
    assert!(matches!(uploaded, Ok(Outcome::Done(_))));
    let chunk = downloaded.unwrap().done().unwrap();
    assert_eq!(chunk.bytes, b"cc");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn exhausted_retries_report_the_last_error() {
    let (base_url, _state, shutdown_tx) = start_relay().await;
    let bob = client_with(&base_url, "bob", 3, fast_retry(3));
    let _alice = staged_pair(&base_url, &bob).await;

    let error = bob
        .download_chunk("f", 2, &CancellationToken::new())
        .await
        .unwrap_err();
    match error {
        ClientError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(
                *last,
                ClientError::ChunkNotYetUploaded { index: 2, .. }
            ));
        }
        other => panic!("unexpected error: {other}"),
    }

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn abort_drops_queued_downloads() {
    let (base_url, state, shutdown_tx) = start_relay().await;
    let bob = client_with(&base_url, "bob", 1, fast_retry(1000));
    let _alice = staged_pair(&base_url, &bob).await;

    let scope = CancellationToken::new();
    let (stuck, first, second, queued) = tokio::join!(
        bob.download_chunk("f", 2, &scope),
        bob.download_chunk("f", 0, &scope),
        bob.download_chunk("f", 1, &scope),
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let queued = bob.download_queue().pending();
            bob.abort_all();
            queued
        }
    );
    assert_eq!(queued, 2);
    assert!(stuck.unwrap().is_aborted());
    assert!(first.unwrap().is_aborted());
    assert!(second.unwrap().is_aborted());

    // queued jobs never reached the relay
    let status = state
        .store()
        .file_status(&bob.session_id().unwrap(), "f")
        .await
        .unwrap();
    assert!(status.downloaded_chunks.get("bob").is_none());

    // a fresh generation proceeds
    let chunk = bob.download_chunk("f", 0, &scope).await.unwrap().done().unwrap();
    assert_eq!(chunk.bytes, b"aaaa");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn cancelled_scope_interrupts_backoff() {
    let (base_url, _state, shutdown_tx) = start_relay().await;
    let bob = client_with(&base_url, "bob", 3, fast_retry(1000));
    let _alice = staged_pair(&base_url, &bob).await;

    let scope = CancellationToken::new();
    let other = CancellationToken::new();
    let (waiting, unaffected, _) = tokio::join!(
        bob.download_chunk("f", 2, &scope),
        bob.download_chunk("f", 1, &other),
        async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            scope.cancel();
        }
    );
    assert!(waiting.unwrap().is_aborted());
    assert_eq!(unaffected.unwrap().done().unwrap().bytes, b"bbbb");

    assert!(bob
        .download_chunk("f", 0, &scope)
        .await
        .unwrap()
        .is_aborted());

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn unreachable_relay_is_reported() {
    let client = client_with("http://127.0.0.1:1", "alice", 3, fast_retry(2));
    assert!(!client.check_server().await);
    assert!(matches!(
        client.start_session().await,
        Err(ClientError::Http(_))
    ));
}
