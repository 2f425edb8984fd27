use std::io::{Read, Write};
use std::sync::Arc;

use axum::Router;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use relaydrop::protocol::FileDescriptor;
use relaydrop::recovery::missing_chunks;
use relaydrop::relay::{app, RelayConfig, RelayState};
use relaydrop::relay_client::{ClientError, RelayClient, RelayClientConfig};

async fn start_relay(config: RelayConfig) -> (String, RelayState, oneshot::Sender<()>) {
    let state = RelayState::in_memory(config);
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

fn unlimited() -> RelayConfig {
    RelayConfig {
        rate_limit_bps: 0,
        ..RelayConfig::default()
    }
}

fn client(base_url: &str, peer_id: &str) -> RelayClient {
    let mut config = RelayClientConfig::new(base_url, peer_id);
    config.rate_limit_bps = 0;
    RelayClient::new(config).expect("client")
}

fn parts(result: Result<ureq::Response, ureq::Error>) -> (u16, Value) {
    match result {
        Ok(response) => (response.status(), response.into_json().unwrap_or(Value::Null)),
        Err(ureq::Error::Status(status, response)) => {
            (status, response.into_json().unwrap_or(Value::Null))
        }
        Err(error) => panic!("relay unreachable: {error}"),
    }
}

fn get_json(url: &str) -> (u16, Value) {
    parts(ureq::get(url).call())
}

fn post_json(url: &str, body: Value) -> (u16, Value) {
    parts(ureq::post(url).send_json(body))
}

fn delete_json(url: &str, body: Value) -> (u16, Value) {
    parts(ureq::delete(url).send_json(body))
}

fn multipart(session_id: Option<&str>, chunk: Option<&[u8]>) -> (String, Vec<u8>) {
    let boundary = "relaydrop-test-boundary";
    let mut body = Vec::new();
    if let Some(session_id) = session_id {
        write!(
            body,
            "--{boundary}\r\nContent-Disposition: form-data; name=\"sessionId\"\r\n\r\n{session_id}\r\n"
        )
        .unwrap();
    }
    if let Some(chunk) = chunk {
        write!(
            body,
            "--{boundary}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"chunk\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .unwrap();
        body.extend_from_slice(chunk);
        body.extend_from_slice(b"\r\n");
    }
    write!(body, "--{boundary}--\r\n").unwrap();
    (format!("multipart/form-data; boundary={boundary}"), body)
}

fn upload(base_url: &str, session_id: Option<&str>, file_id: &str, index: &str, chunk: Option<&[u8]>) -> (u16, Value) {
    let (content_type, body) = multipart(session_id, chunk);
    parts(
        ureq::post(&format!("{base_url}/relay/file/{file_id}/chunk/{index}"))
            .set("Content-Type", &content_type)
            .send_bytes(&body),
    )
}

fn start_session(base_url: &str, peer_id: &str) -> String {
    let (status, body) = post_json(
        &format!("{base_url}/relay/session/start"),
        json!({ "peerId": peer_id }),
    );
    assert_eq!(status, 200, "{body}");
    body["sessionId"].as_str().expect("session id").to_string()
}

fn register(base_url: &str, session_id: &str, file_id: &str, file_size: u64, total_chunks: u32) {
    let (status, body) = post_json(
        &format!("{base_url}/relay/file/register"),
        json!({
            "sessionId": session_id,
            "fileId": file_id,
            "fileName": "a.bin",
            "fileSize": file_size,
            "totalChunks": total_chunks,
        }),
    );
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn status_reports_online_sessions() {
    let (base_url, _state, shutdown_tx) = start_relay(unlimited()).await;

    tokio::task::spawn_blocking(move || {
        let (status, body) = get_json(&format!("{base_url}/relay/status"));
        assert_eq!(status, 200);
        assert_eq!(body["status"], "online");
        assert_eq!(body["sessions"], 0);
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));

        start_session(&base_url, "alice");
        let (_, body) = get_json(&format!("{base_url}/relay/status"));
        assert_eq!(body["sessions"], 1);
    })
    .await
    .expect("blocking task");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn missing_chunk_is_detected_then_filled() {
    let (base_url, _state, shutdown_tx) = start_relay(unlimited()).await;

    tokio::task::spawn_blocking(move || {
        let session_id = start_session(&base_url, "alice");
        register(&base_url, &session_id, "f1", 40, 4);

        for index in ["0", "1", "3"] {
            let (status, ack) = upload(&base_url, Some(&session_id), "f1", index, Some(&[7u8; 10]));
            assert_eq!(status, 200, "{ack}");
        }
        let status_url = format!("{base_url}/relay/file/f1/status?sessionId={session_id}");
        let (status, body) = get_json(&status_url);
        assert_eq!(status, 200);
        assert_eq!(body["uploadedChunks"], json!([0, 1, 3]));
        assert_eq!(body["completed"], false);

        let uploaded: Vec<u32> = serde_json::from_value(body["uploadedChunks"].clone()).unwrap();
        assert_eq!(missing_chunks(4, &uploaded), vec![2]);

        let (_, ack) = upload(&base_url, Some(&session_id), "f1", "2", Some(&[7u8; 10]));
        assert_eq!(ack["uploadedChunks"], 4);
        assert_eq!(ack["progress"], 100);
        let (_, body) = get_json(&status_url);
        assert_eq!(body["completed"], true);
    })
    .await
    .expect("blocking task");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn upload_ack_reports_progress() {
    let (base_url, _state, shutdown_tx) = start_relay(unlimited()).await;

    tokio::task::spawn_blocking(move || {
        let session_id = start_session(&base_url, "alice");
        register(&base_url, &session_id, "f1", 30, 3);
        let (status, ack) = upload(&base_url, Some(&session_id), "f1", "1", Some(b"0123456789"));
        assert_eq!(status, 200);
        assert_eq!(
            ack,
            json!({
                "success": true,
                "fileId": "f1",
                "chunkIndex": 1,
                "uploadedChunks": 1,
                "totalChunks": 3,
                "progress": 33,
            })
        );

        let response = ureq::get(&format!(
            "{base_url}/relay/file/f1/chunk/1?sessionId={session_id}&peerId=bob"
        ))
        .call()
        .expect("download");
        assert_eq!(response.header("x-chunk-index"), Some("1"));
        assert_eq!(response.header("x-total-chunks"), Some("3"));
        assert_eq!(response.header("x-file-id"), Some("f1"));
        assert_eq!(response.content_type(), "application/octet-stream");
        let mut bytes = Vec::new();
        response.into_reader().read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"0123456789");

        let (_, body) = get_json(&format!(
            "{base_url}/relay/file/f1/status?sessionId={session_id}"
        ));
        assert_eq!(body["downloadedChunks"], json!({ "bob": [1] }));
    })
    .await
    .expect("blocking task");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn errors_carry_status_and_code() {
    let (base_url, _state, shutdown_tx) = start_relay(unlimited()).await;

    tokio::task::spawn_blocking(move || {
        let (status, body) = post_json(&format!("{base_url}/relay/session/start"), json!({}));
        assert_eq!((status, body["code"].as_str()), (400, Some("missing_peer_id")));

        let (status, body) = post_json(
            &format!("{base_url}/relay/file/register"),
            json!({ "sessionId": "session_0_nope", "fileId": "f", "fileName": "n", "fileSize": 1, "totalChunks": 1 }),
        );
        assert_eq!((status, body["code"].as_str()), (404, Some("session_not_found")));

        let session_id = start_session(&base_url, "alice");
        let (status, body) = post_json(
            &format!("{base_url}/relay/file/register"),
            json!({ "sessionId": session_id, "fileId": "f" }),
        );
        assert_eq!((status, body["code"].as_str()), (400, Some("invalid_file_metadata")));

        let (status, body) = post_json(
            &format!("{base_url}/relay/file/register"),
            json!({ "sessionId": session_id, "fileId": "f", "fileName": "n", "fileSize": "x", "totalChunks": 1 }),
        );
        assert_eq!((status, body["code"].as_str()), (400, Some("invalid_file_metadata")));

        let (status, body) = post_json(
            &format!("{base_url}/relay/file/register"),
            json!({ "sessionId": "session_0_nope", "fileId": "f", "fileName": "n", "fileSize": "x", "totalChunks": 1 }),
        );
        assert_eq!((status, body["code"].as_str()), (404, Some("session_not_found")));

        register(&base_url, &session_id, "f", 20, 2);
        let chunk_url = |index: &str| {
            format!("{base_url}/relay/file/f/chunk/{index}?sessionId={session_id}")
        };

        let (status, body) = get_json(&chunk_url("0"));
        assert_eq!((status, body["code"].as_str()), (404, Some("chunk_not_yet_uploaded")));
        assert_eq!(body["waiting"], true);

        let (status, body) = get_json(&chunk_url("5"));
        assert_eq!((status, body["code"].as_str()), (400, Some("chunk_out_of_range")));

        let (status, body) = get_json(&chunk_url("abc"));
        assert_eq!((status, body["code"].as_str()), (400, Some("invalid_chunk_index")));

        let (status, body) = get_json(&format!(
            "{base_url}/relay/file/other/chunk/0?sessionId={session_id}"
        ));
        assert_eq!((status, body["code"].as_str()), (404, Some("file_not_found")));

        let (status, body) = upload(&base_url, Some(&session_id), "f", "5", Some(b"x"));
        assert_eq!((status, body["code"].as_str()), (400, Some("chunk_out_of_range")));

        let (status, body) = upload(&base_url, Some(&session_id), "f", "0", None);
        assert_eq!((status, body["code"].as_str()), (400, Some("payload_missing")));

        let (status, body) = upload(&base_url, None, "f", "0", Some(b"x"));
        assert_eq!((status, body["code"].as_str()), (404, Some("session_not_found")));

        let (status, body) = delete_json(
            &format!("{base_url}/relay/file/f/chunk/1"),
            json!({ "sessionId": session_id }),
        );
        assert_eq!((status, body["code"].as_str()), (404, Some("chunk_not_found")));

        let (status, body) = parts(ureq::delete(&format!("{base_url}/relay/session/session_0_nope")).call());
        assert_eq!((status, body["code"].as_str()), (404, Some("session_not_found")));
    })
    .await
    .expect("blocking task");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn deleting_a_chunk_frees_storage() {
    let (base_url, state, shutdown_tx) = start_relay(unlimited()).await;

    let session_id = tokio::task::spawn_blocking({
        let base_url = base_url.clone();
        move || {
            let session_id = start_session(&base_url, "alice");
            register(&base_url, &session_id, "f", 20, 2);
            upload(&base_url, Some(&session_id), "f", "0", Some(&[1u8; 10]));
            upload(&base_url, Some(&session_id), "f", "1", Some(&[1u8; 8]));
            let (status, body) = delete_json(
                &format!("{base_url}/relay/file/f/chunk/0"),
                json!({ "sessionId": session_id }),
            );
            assert_eq!((status, body["success"].as_bool()), (200, Some(true)));
            session_id
        }
    })
    .await
    .expect("blocking task");

    let info = state.store().session_info(&session_id).await.unwrap();
    assert_eq!(info.storage_used, 8);
    let status = state.store().file_status(&session_id, "f").await.unwrap();
    assert_eq!(status.uploaded_chunks, vec![1]);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn concurrent_duplicate_uploads_count_once() {
    let (base_url, state, shutdown_tx) = start_relay(unlimited()).await;
    let alice = client(&base_url, "alice");
    let session = alice.start_session().await.unwrap();
    let file = FileDescriptor {
        file_id: "f".into(),
        file_name: "a.bin".into(),
        file_size: 12,
        total_chunks: 2,
    };
    alice.register_file(&file).await.unwrap();

    let scope = CancellationToken::new();
    let (a, b) = tokio::join!(
        alice.upload_chunk("f", 0, b"first-bytes!", &scope),
        alice.upload_chunk("f", 0, b"second-bytes", &scope),
    );
    let a = a.unwrap().done().unwrap();
    let b = b.unwrap().done().unwrap();
    assert_eq!((a.uploaded_chunks, b.uploaded_chunks), (1, 1));

    let info = state.store().session_info(&session.session_id).await.unwrap();
    assert_eq!(info.storage_used, 12);
    let status = alice.file_status("f").await.unwrap();
    assert_eq!(status.uploaded_chunks, vec![0]);
    assert!(!status.completed);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn receiver_reads_across_sessions() {
    let (base_url, _state, shutdown_tx) = start_relay(unlimited()).await;
    let alice = client(&base_url, "alice");
    let bob = client(&base_url, "bob");
    let file = FileDescriptor {
        file_id: "shared".into(),
        file_name: "a.bin".into(),
        file_size: 5,
        total_chunks: 1,
    };
    let alice_session = alice.start_session().await.unwrap();
    alice.register_file(&file).await.unwrap();
    let scope = CancellationToken::new();
    alice.upload_chunk("shared", 0, b"hello", &scope).await.unwrap();

    bob.start_session().await.unwrap();
    bob.register_file(&file).await.unwrap();
    let chunk = bob
        .download_chunk("shared", 0, &scope)
        .await
        .unwrap()
        .done()
        .unwrap();
    assert_eq!(chunk.bytes, b"hello");
    assert_eq!(chunk.total_chunks, Some(1));

    let in_bob = bob.file_status("shared").await.unwrap();
    assert_eq!(in_bob.downloaded_chunks.get("bob"), Some(&vec![0]));
    assert!(in_bob.uploaded_chunks.is_empty());
    let in_alice = bob
        .file_status_in(&alice_session.session_id, "shared")
        .await
        .unwrap();
    assert!(in_alice.completed);

    let bob_session = bob.session_id().unwrap();
    let (status, body) = tokio::task::spawn_blocking(move || {
        get_json(&format!(
            "{base_url}/relay/file/shared/chunk/0?sessionId={bob_session}"
        ))
    })
    .await
    .unwrap();
    assert_eq!((status, body["code"].as_str()), (404, Some("chunk_not_yet_uploaded")));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn quota_is_enforced_without_retries() {
    let (base_url, _state, shutdown_tx) = start_relay(RelayConfig {
        storage_limit: 16,
        ..unlimited()
    })
    .await;
    let alice = client(&base_url, "alice");
    alice.start_session().await.unwrap();
    alice
        .register_file(&FileDescriptor {
            file_id: "big".into(),
            file_name: "big.bin".into(),
            file_size: 20,
            total_chunks: 2,
        })
        .await
        .unwrap();

    let scope = CancellationToken::new();
    assert!(alice.upload_chunk("big", 0, &[0u8; 10], &scope).await.is_ok());
    let error = alice
        .upload_chunk("big", 1, &[0u8; 10], &scope)
        .await
        .unwrap_err();
    assert!(
        matches!(&error, ClientError::Status { status: 413, code, .. } if code == "quota_exceeded"),
        "{error}"
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn ending_sessions_and_shutdown_free_everything() {
    let (base_url, state, shutdown_tx) = start_relay(unlimited()).await;
    let alice = Arc::new(client(&base_url, "alice"));
    let first = alice.start_session().await.unwrap();
    let second = alice.start_session().await.unwrap();
    assert_ne!(first.session_id, second.session_id);
    assert!(state.store().session_info(&first.session_id).await.is_err());

    assert!(alice.end_session().await);
    assert!(alice.session().is_none());
    assert_eq!(state.store().session_count().await, 0);

    let bob = client(&base_url, "bob");
    bob.start_session().await.unwrap();
    alice.start_session().await.unwrap();
    assert_eq!(state.shutdown().await, 2);
    assert_eq!(state.store().session_count().await, 0);

    // an already-gone session still counts as ended
    assert!(bob.end_session().await);

    let scope = CancellationToken::new();
    let outcome = alice.upload_chunk("f", 0, b"x", &scope).await;
    assert!(matches!(
        outcome,
        Err(ClientError::Status { status: 404, .. })
    ));

    let _ = shutdown_tx.send(());
}
