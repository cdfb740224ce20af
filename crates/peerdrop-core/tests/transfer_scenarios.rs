//! 集成测试 - 完整传输流程
//!
//! 发送端和接收端状态机在同一个任务里并发运行，通过进程内信令服务和
//! 回环网络互相连接。所有测试使用暂停的时钟，计时器按虚拟时间推进。

use peerdrop_core::rendezvous::SignalChannel;
use peerdrop_core::transfer::ControlMessage;
use peerdrop_core::transport::{
    Fault, Frame, LinkEvent, NegotiationStep, Negotiator, Role, SignalInbox,
};
use peerdrop_core::{
    ChannelObserver, FailureContext, FallbackRequest, FileMetadata, FileReady, MemoryNetwork,
    MemoryRendezvous, OutgoingFile, RendezvousClient, TransferConfig, TransferError,
    TransferEvent, TransferMachine, TransferOutcome, TransferState, TransportConfig,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

const FIVE_MIB: usize = 5_242_880;

struct Harness {
    api: MemoryRendezvous,
    network: MemoryNetwork,
}

impl Harness {
    fn new() -> Self {
        Self {
            api: MemoryRendezvous::default(),
            network: MemoryNetwork::new(),
        }
    }

    fn machine(&self) -> (TransferMachine, UnboundedReceiver<TransferEvent>) {
        let (observer, events) = ChannelObserver::new();
        let machine = TransferMachine::new(
            Arc::new(self.api.clone()),
            Arc::new(self.network.clone()),
            TransferConfig::default(),
            Arc::new(observer),
        );
        (machine, events)
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// 读取发送端事件直到拿到会话码，读过的事件一并返回
async fn session_code(events: &mut UnboundedReceiver<TransferEvent>) -> (String, Vec<TransferEvent>) {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let code = match &event {
            TransferEvent::State {
                state: TransferState::WaitingForPeer,
                context,
            } => context.session_code.clone(),
            _ => None,
        };
        seen.push(event);
        if let Some(code) = code {
            return (code, seen);
        }
    }
    panic!("sender stopped before publishing a session code");
}

fn drain(events: &mut UnboundedReceiver<TransferEvent>, mut seen: Vec<TransferEvent>) -> Vec<TransferEvent> {
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn states(events: &[TransferEvent]) -> Vec<TransferState> {
    events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::State { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

fn percents(events: &[TransferEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::Progress(p) => Some(p.percent),
            _ => None,
        })
        .collect()
}

fn file_ready(events: &[TransferEvent]) -> Vec<&FileReady> {
    events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::FileReady(ready) => Some(ready),
            _ => None,
        })
        .collect()
}

/// 场景 A：5 MiB 文件完整送达
#[tokio::test(start_paused = true)]
async fn test_five_mebibyte_round_trip() {
    let harness = Harness::new();
    let (mut sender, mut sender_events) = harness.machine();
    let (mut receiver, mut receiver_events) = harness.machine();

    let data = pattern(FIVE_MIB);
    let file = OutgoingFile::from_bytes("video.mp4", data.clone());

    let (sent, (received, early)) = tokio::join!(sender.create_session(file), async {
        let (code, early) = session_code(&mut sender_events).await;
        (receiver.join_session(&code).await, early)
    });

    assert_eq!(sent.unwrap(), TransferOutcome::Completed(None));
    let TransferOutcome::Completed(Some(received)) = received.unwrap() else {
        panic!("receiver should complete with a file");
    };
    assert_eq!(received.metadata.name, "video.mp4");
    assert_eq!(received.metadata.mime_type, "video/mp4");
    assert_eq!(received.data.len(), FIVE_MIB);
    assert!(received.data == data);

    let sender_events = drain(&mut sender_events, early);
    assert_eq!(
        states(&sender_events),
        vec![
            TransferState::CreatingRoom,
            TransferState::WaitingForPeer,
            TransferState::Connecting,
            TransferState::Transferring,
            TransferState::Verifying,
            TransferState::Completed,
        ]
    );
    // 发送端完成时没有文件交给调用方
    assert!(file_ready(&sender_events).is_empty());

    let sender_progress = percents(&sender_events);
    assert_eq!(sender_progress.len(), 320);
    assert!(sender_progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(sender_progress.last(), Some(&100));

    let receiver_events = drain(&mut receiver_events, Vec::new());
    assert_eq!(states(&receiver_events).last(), Some(&TransferState::Completed));
    let receiver_progress = percents(&receiver_events);
    assert!(receiver_progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(receiver_progress.iter().all(|p| *p <= 100));
    assert_eq!(receiver_progress.last(), Some(&100));
    assert!(matches!(
        file_ready(&receiver_events).as_slice(),
        [FileReady::Received(f)] if f.data.len() == FIVE_MIB
    ));

    assert_eq!(sender.retry_count(), 0);
    assert_eq!(harness.api.session_count(), 0);
    assert_eq!(harness.network.established(), 1);
}

/// 场景 B：连续三次连接失败后只回退一次
#[tokio::test(start_paused = true)]
async fn test_three_failures_fall_back_once() {
    let harness = Harness::new();
    for _ in 0..3 {
        harness.network.inject(Fault::Fail);
    }

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let (sender, mut sender_events) = harness.machine();
    let mut sender = sender.with_fallback_handler(Arc::new(move |_: &FallbackRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let (mut receiver, mut receiver_events) = harness.machine();

    let file = OutgoingFile::from_bytes("report.pdf", pattern(100_000));
    let (sent, (received, early)) = tokio::join!(sender.create_session(file.clone()), async {
        let (code, early) = session_code(&mut sender_events).await;
        (receiver.join_session(&code).await, early)
    });

    let TransferOutcome::Fallback(request) = sent.unwrap() else {
        panic!("sender should fall back");
    };
    assert_eq!(request.metadata(), file.metadata());
    assert_eq!(request.file, file);
    assert_eq!(request.retries, 3);
    assert_eq!(sender.retry_count(), 3);
    assert_eq!(handled.load(Ordering::SeqCst), 1);

    let sender_events = drain(&mut sender_events, early);
    let sender_states = states(&sender_events);
    assert_eq!(
        sender_states
            .iter()
            .filter(|s| **s == TransferState::Fallback)
            .count(),
        1
    );
    assert_eq!(sender_states.last(), Some(&TransferState::Fallback));
    assert!(!sender_states.contains(&TransferState::Transferring));
    assert_eq!(file_ready(&sender_events).len(), 1);

    // 接收端没有文件可以回退，用完重试后失败
    let err = received.unwrap_err();
    assert!(err.is_connectivity());
    let receiver_events = drain(&mut receiver_events, Vec::new());
    match receiver_events.last() {
        Some(TransferEvent::State {
            state: TransferState::Failed,
            context,
        }) => assert_eq!(context.failure, Some(FailureContext::Connect)),
        other => panic!("unexpected final receiver event: {:?}", other),
    }
    assert!(file_ready(&receiver_events).is_empty());
    assert_eq!(harness.network.established(), 0);
}

/// 在会话里声明 `declared`，返回会话码和信令端
async fn open_session(harness: &Harness, declared: &FileMetadata) -> (String, SignalChannel) {
    let mut client = RendezvousClient::new(Arc::new(harness.api.clone()), Duration::from_secs(1));
    let code = client.create_session(declared).await.unwrap();
    (code, client.channel().unwrap())
}

/// 手工驱动的发送端：宣告 `announced`，发出 `payload` 字节后声明完成，
/// 返回接收端的回复
async fn manual_sender(
    network: MemoryNetwork,
    signals: SignalChannel,
    announced: FileMetadata,
    payload: usize,
) -> Option<ControlMessage> {
    let mut inbox = SignalInbox::new(&signals);
    let mut negotiator = Negotiator::start(
        &network,
        &TransportConfig::default(),
        signals,
        Role::Initiator,
        0,
    )
    .await
    .unwrap();
    let mut connection = loop {
        match negotiator.next_step(&mut inbox).await.unwrap() {
            NegotiationStep::Connected(connection) => break connection,
            NegotiationStep::PeerSeen => {}
        }
    };

    let channel = connection.channel.clone();
    channel
        .send(ControlMessage::Metadata(announced).to_frame())
        .await
        .unwrap();
    let mut sent = 0;
    let mut chunks = 0;
    while sent < payload {
        let n = (payload - sent).min(16_384);
        channel.send(Frame::Binary(vec![0u8; n].into())).await.unwrap();
        sent += n;
        chunks += 1;
    }
    channel
        .send(
            ControlMessage::Complete {
                total_chunks: chunks,
            }
            .to_frame(),
        )
        .await
        .unwrap();

    while let Some(event) = connection.events.recv().await {
        if let LinkEvent::Frame(Frame::Text(text)) = event {
            return ControlMessage::parse(&text);
        }
    }
    None
}

fn assert_failed_with(events: &[TransferEvent], failure: FailureContext) {
    match events.last() {
        Some(TransferEvent::State {
            state: TransferState::Failed,
            context,
        }) => assert_eq!(context.failure, Some(failure)),
        other => panic!("unexpected final event: {:?}", other),
    }
}

/// 场景 C：声明 5,242,880 字节但只收到 5,000,000 字节
#[tokio::test(start_paused = true)]
async fn test_truncated_transfer_is_rejected() {
    let harness = Harness::new();
    let (mut receiver, mut receiver_events) = harness.machine();

    let declared = FileMetadata::new("movie.mp4", FIVE_MIB as u64, "video/mp4");
    let (code, signals) = open_session(&harness, &declared).await;

    let (reply, received) = tokio::join!(
        manual_sender(harness.network.clone(), signals, declared.clone(), 5_000_000),
        receiver.join_session(&code)
    );

    assert!(matches!(reply, Some(ControlMessage::Error { .. })));
    assert!(matches!(
        received,
        Err(TransferError::Integrity {
            expected: 5_242_880,
            received: 5_000_000
        })
    ));
    assert_eq!(receiver.retry_count(), 0);

    let events = drain(&mut receiver_events, Vec::new());
    assert!(file_ready(&events).is_empty());
    assert_failed_with(&events, FailureContext::Verify);
}

/// 数据通道里宣告的大小与会话声明不符时，以会话为准拒收
#[tokio::test(start_paused = true)]
async fn test_announced_size_must_match_session() {
    let harness = Harness::new();
    let (mut receiver, mut receiver_events) = harness.machine();

    let declared = FileMetadata::new("notes.txt", 100, "text/plain");
    let (code, signals) = open_session(&harness, &declared).await;

    // 宣告 50 字节并完整发送 50 字节，自身是一致的
    let announced = FileMetadata::new("notes.txt", 50, "text/plain");
    let (reply, received) = tokio::join!(
        manual_sender(harness.network.clone(), signals, announced, 50),
        receiver.join_session(&code)
    );

    assert!(matches!(reply, Some(ControlMessage::Error { .. })));
    assert!(matches!(
        received,
        Err(TransferError::Integrity {
            expected: 100,
            received: 50
        })
    ));

    let events = drain(&mut receiver_events, Vec::new());
    assert!(file_ready(&events).is_empty());
    assert_failed_with(&events, FailureContext::Verify);
}

/// 场景 D：30 秒内无人连接，重试计数变为 1
#[tokio::test(start_paused = true)]
async fn test_connection_timeout_counts_as_retry() {
    let harness = Harness::new();
    let (mut sender, mut sender_events) = harness.machine();
    let file = OutgoingFile::from_bytes("notes.txt", "no one is listening");

    let started = Instant::now();
    let (outcome, first_retry) = tokio::join!(sender.create_session(file), async {
        while let Some(event) = sender_events.recv().await {
            if let TransferEvent::State {
                state: TransferState::CreatingRoom,
                context,
            } = event
                && context.retry_count == 1
            {
                return (started.elapsed(), context);
            }
        }
        panic!("sender never retried");
    });

    let (elapsed, context) = first_retry;
    assert!(elapsed >= Duration::from_secs(30));
    assert!(elapsed < Duration::from_secs(31));
    assert!(context.message.unwrap().contains("timed out"));

    // 三次超时之后回退
    assert!(matches!(outcome.unwrap(), TransferOutcome::Fallback(_)));
    assert!(started.elapsed() >= Duration::from_secs(90));
}

/// 第一次连接卡住，超时后第二次成功
#[tokio::test(start_paused = true)]
async fn test_stalled_connection_recovers_on_retry() {
    let harness = Harness::new();
    harness.network.inject(Fault::Stall);
    let (mut sender, mut sender_events) = harness.machine();
    let (mut receiver, _receiver_events) = harness.machine();

    let data = pattern(200_000);
    let file = OutgoingFile::from_bytes("photo.jpg", data.clone());
    let (sent, received) = tokio::join!(sender.create_session(file), async {
        let (code, _) = session_code(&mut sender_events).await;
        receiver.join_session(&code).await
    });

    assert_eq!(sent.unwrap(), TransferOutcome::Completed(None));
    assert_eq!(sender.retry_count(), 1);
    let TransferOutcome::Completed(Some(received)) = received.unwrap() else {
        panic!("receiver should complete with a file");
    };
    assert!(received.data == data);
    assert_eq!(harness.network.established(), 1);
}

/// 连通后中途断开会重试，且不计入连续失败次数
#[tokio::test(start_paused = true)]
async fn test_mid_transfer_disconnect_retries() {
    let harness = Harness::new();
    harness.network.inject(Fault::DisconnectAfter(40));
    let (mut sender, mut sender_events) = harness.machine();
    let (mut receiver, _receiver_events) = harness.machine();

    let data = pattern(1_000_000);
    let file = OutgoingFile::from_bytes("archive.zip", data.clone());
    let (sent, received) = tokio::join!(sender.create_session(file), async {
        let (code, _) = session_code(&mut sender_events).await;
        receiver.join_session(&code).await
    });

    assert_eq!(sent.unwrap(), TransferOutcome::Completed(None));
    assert_eq!(sender.retry_count(), 0);
    assert_eq!(receiver.retry_count(), 0);
    let TransferOutcome::Completed(Some(received)) = received.unwrap() else {
        panic!("receiver should complete with a file");
    };
    assert_eq!(received.data.len(), 1_000_000);
    assert!(received.data == data);
    assert_eq!(harness.network.established(), 2);
}

/// 失败、连通后断开、再失败：连续失败被打断，不会回退
#[tokio::test(start_paused = true)]
async fn test_connected_attempt_breaks_failure_streak() {
    let harness = Harness::new();
    harness.network.inject(Fault::Fail);
    harness.network.inject(Fault::DisconnectAfter(10));
    harness.network.inject(Fault::Fail);
    let (mut sender, mut sender_events) = harness.machine();
    let (mut receiver, _receiver_events) = harness.machine();

    let data = pattern(500_000);
    let file = OutgoingFile::from_bytes("slides.pdf", data.clone());
    let (sent, (received, early)) = tokio::join!(sender.create_session(file), async {
        let (code, early) = session_code(&mut sender_events).await;
        (receiver.join_session(&code).await, early)
    });

    assert_eq!(sent.unwrap(), TransferOutcome::Completed(None));
    let TransferOutcome::Completed(Some(received)) = received.unwrap() else {
        panic!("receiver should complete with a file");
    };
    assert!(received.data == data);

    // 断开清零计数，之后只有一次失败
    assert_eq!(sender.retry_count(), 1);
    assert_eq!(receiver.retry_count(), 1);

    let sender_events = drain(&mut sender_events, early);
    let sender_states = states(&sender_events);
    assert!(!sender_states.contains(&TransferState::Fallback));
    assert_eq!(
        sender_states
            .iter()
            .filter(|s| **s == TransferState::Transferring)
            .count(),
        2
    );
    assert_eq!(sender_states.last(), Some(&TransferState::Completed));
    assert!(file_ready(&sender_events).is_empty());
    assert_eq!(harness.network.established(), 2);
}

/// 发送端取消并关闭会话后，接收端在下一次轮询时结束
#[tokio::test(start_paused = true)]
async fn test_receiver_stops_when_sender_closes_session() {
    let harness = Harness::new();
    harness.network.inject(Fault::Stall);
    let (mut sender, mut sender_events) = harness.machine();
    let (mut receiver, mut receiver_events) = harness.machine();
    let handle = sender.cancel_handle();
    let file = OutgoingFile::from_bytes("draft.txt", "never delivered");

    let started = Instant::now();
    let (sent, (received, stopped_after)) = tokio::join!(sender.create_session(file), async {
        let (code, _) = session_code(&mut sender_events).await;
        let receiving = receiver.join_session(&code);
        let cancelling = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            handle.cancel();
        };
        let (received, ()) = tokio::join!(receiving, cancelling);
        (received, started.elapsed())
    });

    assert_eq!(sent.unwrap(), TransferOutcome::Cancelled);
    assert!(matches!(received, Err(TransferError::SessionNotFound(_))));
    // 不用等 30 秒的连接计时器
    assert!(stopped_after < Duration::from_secs(8));
    assert_eq!(receiver.retry_count(), 0);

    let events = drain(&mut receiver_events, Vec::new());
    assert_failed_with(&events, FailureContext::Session);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_is_idempotent() {
    let harness = Harness::new();
    let (mut sender, mut sender_events) = harness.machine();
    let handle = sender.cancel_handle();
    let file = OutgoingFile::from_bytes("draft.txt", "hello");

    let (outcome, ()) = tokio::join!(sender.create_session(file), async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.cancel();
        handle.cancel();
    });

    assert_eq!(outcome.unwrap(), TransferOutcome::Cancelled);
    assert_eq!(sender.state(), TransferState::Idle);
    assert_eq!(harness.api.session_count(), 0);

    sender.cancel();
    assert_eq!(sender.state(), TransferState::Idle);

    let events = drain(&mut sender_events, Vec::new());
    let idle = states(&events)
        .into_iter()
        .filter(|s| *s == TransferState::Idle)
        .count();
    assert_eq!(idle, 1);
    assert!(file_ready(&events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_code_fails_without_retry() {
    let harness = Harness::new();
    let (mut receiver, mut receiver_events) = harness.machine();

    let err = receiver.join_session("ZZZZZZ").await.unwrap_err();
    assert!(matches!(err, TransferError::SessionNotFound(_)));
    assert_eq!(receiver.state(), TransferState::Failed);
    assert_eq!(receiver.retry_count(), 0);

    let events = drain(&mut receiver_events, Vec::new());
    assert_eq!(
        states(&events),
        vec![TransferState::CreatingRoom, TransferState::Failed]
    );
}

#[tokio::test(start_paused = true)]
async fn test_empty_file_cannot_open_session() {
    let harness = Harness::new();
    let (mut sender, _events) = harness.machine();
    let err = sender
        .create_session(OutgoingFile::from_bytes("empty.bin", Vec::<u8>::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::SessionCreate(_)));
    assert_eq!(harness.api.session_count(), 0);
}
