use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use relaydrop::channel::{DirectChannel, FrameReceiver, MemoryChannel};
use relaydrop::direct::{track_events, DirectReceiver};
use relaydrop::liveness::{
    answer_ping, is_pong, LivenessConfig, LivenessMonitor, PeerUnreachable, PongRecorder,
    UnreachableReason,
};
use relaydrop::protocol::{ChannelMessage, FileFrame, MESSAGE_META, META_CHUNK_INDEX};
use relaydrop::rate_limit::{Direction, DEFAULT_RATE_CAP};
use relaydrop::recovery::SourceRegistry;
use relaydrop::relay_client::{RelayClient, RelayClientConfig};
use relaydrop::relay_transfer::{teardown_peer, Teardown};
use relaydrop::transfer::{SpeedSampler, TransferRegistry, TransferState, TransferStatus};

fn relay_download(file_id: &str, peer: &str) -> TransferState {
    TransferState::new(
        file_id,
        peer,
        "a.bin",
        10,
        Direction::Download,
        SpeedSampler::relay(DEFAULT_RATE_CAP),
    )
}

fn direct_upload(file_id: &str, peer: &str) -> TransferState {
    TransferState::new(file_id, peer, "b.bin", 10, Direction::Upload, SpeedSampler::direct())
}

/// Answer every ping arriving on `rx` from `channel`, counting them.
fn spawn_responder(channel: MemoryChannel, mut rx: FrameReceiver, pings: Arc<AtomicUsize>) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(message) = ChannelMessage::decode(&frame) else {
                continue;
            };
            if answer_ping(&channel, "bob", &message).unwrap_or(false) {
                pings.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
}

/// Route pongs arriving on `rx` to the monitor.
fn spawn_dispatcher(mut rx: FrameReceiver, pongs: PongRecorder) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Ok(message) = ChannelMessage::decode(&frame) {
                if is_pong(&message) {
                    pongs.record();
                }
            }
        }
    });
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_declared_unreachable() {
    let ((alice, _alice_rx), (_bob, mut bob_rx)) = MemoryChannel::pair("alice", "bob");
    let registry = Arc::new(TransferRegistry::new());
    let relay_key = relay_download("f1", "bob").key();
    let relay_scope = registry.begin(relay_download("f1", "bob"));
    registry.transition(&relay_key, TransferStatus::Transferring).unwrap();
    let direct_key = direct_upload("f2", "bob").key();
    registry.begin(direct_upload("f2", "bob"));
    registry.transition(&direct_key, TransferStatus::Transferring).unwrap();

    let client = Arc::new(
        RelayClient::new(RelayClientConfig::new("http://127.0.0.1:9", "alice")).unwrap(),
    );
    let sources = Arc::new(SourceRegistry::new());
    sources.insert("f3", Arc::new(vec![0; 4]), 4, ["bob"]);

    let (teardown_tx, teardown_rx) = oneshot::channel();
    let monitor = {
        let registry = registry.clone();
        LivenessMonitor::spawn(
            Arc::new(alice),
            "alice",
            LivenessConfig::default(),
            registry.clone(),
            move |event: PeerUnreachable| async move {
                let teardown = teardown_peer(&client, &registry, &sources, &event.peer_id).await;
                let _ = teardown_tx.send((teardown, sources.is_empty()));
            },
        )
    };

    let event = monitor.join().await.expect("peer declared unreachable");
    assert_eq!(
        event,
        PeerUnreachable {
            peer_id: "bob".into(),
            reason: UnreachableReason::Timeout,
        }
    );
    assert_eq!(
        teardown_rx.await.unwrap(),
        (Teardown::Full { stopped: 0 }, true)
    );

    assert!(relay_scope.is_cancelled());
    assert_eq!(
        registry.snapshot(&relay_key).unwrap().status(),
        TransferStatus::Stopped
    );
    // direct transfers are left to the channel owner
    assert_eq!(
        registry.snapshot(&direct_key).unwrap().status(),
        TransferStatus::Transferring
    );

    let ping = ChannelMessage::decode(&bob_rx.try_recv().unwrap()).unwrap();
    assert_eq!(ping, ChannelMessage::ping("alice"));
    assert!(bob_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn responsive_peer_stays_connected() {
    let ((alice, alice_rx), (bob, bob_rx)) = MemoryChannel::pair("alice", "bob");
    let registry = Arc::new(TransferRegistry::new());
    let key = relay_download("f1", "bob").key();
    let scope = registry.begin(relay_download("f1", "bob"));
    registry.transition(&key, TransferStatus::Transferring).unwrap();

    let pings = Arc::new(AtomicUsize::new(0));
    spawn_responder(bob, bob_rx, pings.clone());

    let fired = Arc::new(AtomicUsize::new(0));
    let monitor = {
        let fired = fired.clone();
        LivenessMonitor::spawn(
            Arc::new(alice),
            "alice",
            LivenessConfig::default(),
            registry.clone(),
            move |_| async move {
                fired.fetch_add(1, Ordering::SeqCst);
            },
        )
    };
    spawn_dispatcher(alice_rx, monitor.pong_recorder());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(pings.load(Ordering::SeqCst) >= 6);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(!scope.is_cancelled());
    assert_eq!(monitor.remote_peer(), "bob");

    monitor.stop();
}

#[tokio::test(start_paused = true)]
async fn closed_channel_fails_the_ping() {
    let ((alice, _alice_rx), (bob, _bob_rx)) = MemoryChannel::pair("alice", "bob");
    let registry = Arc::new(TransferRegistry::new());
    let key = relay_download("f1", "bob").key();
    registry.begin(relay_download("f1", "bob"));
    registry.transition(&key, TransferStatus::Transferring).unwrap();
    bob.close();
    assert!(!alice.is_open());

    let monitor = LivenessMonitor::spawn(
        Arc::new(alice),
        "alice",
        LivenessConfig::default(),
        registry.clone(),
        |_| async {},
    );
    let event = monitor.join().await.expect("peer declared unreachable");
    assert_eq!(event.reason, UnreachableReason::SendFailed);
    assert_eq!(
        registry.snapshot(&key).unwrap().status(),
        TransferStatus::Stopped
    );
}

#[tokio::test(start_paused = true)]
async fn pings_stop_once_transfers_finish() {
    let ((alice, _alice_rx), (_bob, mut bob_rx)) = MemoryChannel::pair("alice", "bob");
    let registry = Arc::new(TransferRegistry::new());
    let key = relay_download("f1", "bob").key();
    registry.begin(relay_download("f1", "bob"));
    registry.transition(&key, TransferStatus::Transferring).unwrap();
    registry.transition(&key, TransferStatus::Complete).unwrap();

    let monitor = LivenessMonitor::spawn(
        Arc::new(alice),
        "alice",
        LivenessConfig::default(),
        registry,
        |_| async {},
    );
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(bob_rx.try_recv().is_err());
    monitor.stop();
}

#[tokio::test(start_paused = true)]
async fn direct_only_transfers_are_monitored() {
    let ((alice, mut alice_rx), (bob, mut bob_rx)) = MemoryChannel::pair("alice", "bob");
    let registry = Arc::new(TransferRegistry::new());

    // bob announces a direct file and then goes silent
    bob.send_message(&ChannelMessage::File(FileFrame {
        file_id: "f1".into(),
        file_name: "b.bin".into(),
        file_type: String::new(),
        file_size: 10,
        chunk_index: META_CHUNK_INDEX,
        total_chunks: 1,
        chunk_size: 16384,
        message: Some(MESSAGE_META.into()),
        data: None,
    }))
    .unwrap();
    let frame = alice_rx.try_recv().unwrap();
    let mut receiver = DirectReceiver::new();
    let events = receiver.pump(&alice, &frame).unwrap();
    track_events(&registry, alice.remote_peer(), &events);
    assert!(registry.has_outstanding("bob"));

    let monitor = LivenessMonitor::spawn(
        Arc::new(alice),
        "alice",
        LivenessConfig::default(),
        registry.clone(),
        |_| async {},
    );
    let event = monitor.join().await.expect("peer declared unreachable");
    assert_eq!(event.reason, UnreachableReason::Timeout);
    let ping = ChannelMessage::decode(&bob_rx.try_recv().unwrap()).unwrap();
    assert_eq!(ping, ChannelMessage::ping("alice"));
}
