//! Multiplexer behavior over in-memory pipes.

use std::time::Duration;

use kled_protocol::{
    channels, relay, AgentRequest, AgentResponse, Channel, MessageChannel, Mux, MuxError, Role,
    INITIAL_WINDOW,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn pair() -> ((Mux, Channel), (Mux, Channel)) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (
        Mux::new(a_read, a_write, Role::Initiator),
        Mux::new(b_read, b_write, Role::Acceptor),
    )
}

async fn read_exactly(channel: &mut Channel, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        let chunk = timeout(WAIT, channel.read())
            .await
            .expect("read timed out")
            .expect("channel closed early");
        out.extend_from_slice(&chunk);
    }
    out
}

#[tokio::test]
async fn test_control_channel_messages() {
    let ((_mux_a, control_a), (_mux_b, control_b)) = pair();
    let mut upstream = MessageChannel::new(control_a);
    let mut downstream = MessageChannel::new(control_b);

    upstream.send(&AgentRequest::Ping).await.unwrap();
    let req: AgentRequest = downstream.recv().await.unwrap().unwrap();
    assert_eq!(req, AgentRequest::Ping);

    downstream
        .send(&AgentResponse::progress("hooks", "running postCreateCommand"))
        .await
        .unwrap();
    downstream
        .send(&AgentResponse::Pong { version: 1 })
        .await
        .unwrap();

    let first: AgentResponse = upstream.recv().await.unwrap().unwrap();
    assert!(matches!(first, AgentResponse::Progress { .. }));
    let second: AgentResponse = upstream.recv().await.unwrap().unwrap();
    assert_eq!(second, AgentResponse::Pong { version: 1 });
}

#[tokio::test]
async fn test_channel_ids_do_not_collide() {
    let ((mux_a, _), (mux_b, _)) = pair();

    let a1 = mux_a.open(channels::SSH).await.unwrap();
    let a2 = mux_a.open(channels::SSH).await.unwrap();
    let b1 = mux_b.open(channels::CREDENTIALS).await.unwrap();

    assert_eq!(a1.id(), 1);
    assert_eq!(a2.id(), 3);
    assert_eq!(b1.id(), 2);

    let accepted = timeout(WAIT, mux_a.accept()).await.unwrap().unwrap();
    assert_eq!(accepted.id(), 2);
    assert_eq!(accepted.kind(), channels::CREDENTIALS);
}

#[tokio::test]
async fn test_in_order_delivery_within_channel() {
    let ((mux_a, _), (mux_b, _)) = pair();

    let sender = mux_a.open(channels::SSH).await.unwrap();
    let mut receiver = timeout(WAIT, mux_b.accept()).await.unwrap().unwrap();

    let mut expected = Vec::new();
    for i in 0..200 {
        let msg = format!("line-{}\n", i);
        expected.extend_from_slice(msg.as_bytes());
        sender.write(msg.as_bytes()).await.unwrap();
    }

    let received = read_exactly(&mut receiver, expected.len()).await;
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_stalled_channel_does_not_block_others() {
    let ((mux_a, _), (mux_b, _)) = pair();

    let bulk = mux_a.open(channels::SSH).await.unwrap();
    let mut bulk_peer = timeout(WAIT, mux_b.accept()).await.unwrap().unwrap();
    let small = mux_a.open(channels::CREDENTIALS).await.unwrap();
    let mut small_peer = timeout(WAIT, mux_b.accept()).await.unwrap().unwrap();

    // exhaust the bulk channel's window without the peer reading
    let window = INITIAL_WINDOW as usize;
    timeout(WAIT, bulk.write(&vec![7u8; window]))
        .await
        .expect("window-sized write should not block")
        .unwrap();
    let stalled = timeout(Duration::from_millis(200), bulk.write(b"more")).await;
    assert!(stalled.is_err(), "write past the window must wait");

    // the other channel still flows
    small.write(b"ping").await.unwrap();
    assert_eq!(read_exactly(&mut small_peer, 4).await, b"ping");

    // consuming the bulk data reopens the window
    let drained = read_exactly(&mut bulk_peer, window).await;
    assert!(drained.iter().all(|b| *b == 7));
    timeout(WAIT, bulk.write(b"more"))
        .await
        .expect("window should have been granted back")
        .unwrap();
    assert_eq!(read_exactly(&mut bulk_peer, 4).await, b"more");
}

#[tokio::test]
async fn test_close_delivers_pending_data_then_eof() {
    let ((mux_a, _), (mux_b, _)) = pair();

    let sender = mux_a.open(channels::SSH).await.unwrap();
    let mut receiver = timeout(WAIT, mux_b.accept()).await.unwrap().unwrap();

    sender.write(b"bye").await.unwrap();
    sender.close().await;
    sender.close().await;

    assert_eq!(read_exactly(&mut receiver, 3).await, b"bye");
    assert!(timeout(WAIT, receiver.read()).await.unwrap().is_none());

    // writes to a channel the peer closed fail
    let err = timeout(WAIT, async {
        loop {
            if let Err(e) = receiver.write(b"x").await {
                return e;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(err, MuxError::ChannelClosed(_)));
}

#[tokio::test]
async fn test_transport_close_ends_every_channel() {
    let ((mux_a, _control_a), (mux_b, control_b)) = pair();

    let _open = mux_a.open(channels::SSH).await.unwrap();
    let mut peer = timeout(WAIT, mux_b.accept()).await.unwrap().unwrap();
    let mut control = MessageChannel::new(control_b);

    mux_a.shutdown();

    timeout(WAIT, mux_b.closed()).await.unwrap();
    assert!(mux_b.is_closed());
    assert!(timeout(WAIT, peer.read()).await.unwrap().is_none());

    let pending: Option<AgentRequest> = timeout(WAIT, control.recv()).await.unwrap().unwrap();
    assert!(pending.is_none());

    assert!(matches!(
        mux_b.open(channels::SSH).await,
        Err(MuxError::TransportClosed)
    ));
    assert!(timeout(WAIT, mux_b.accept()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_relay_across_two_hops() {
    // client <-> host and host <-> container
    let ((client, _), (host_up, _)) = pair();
    let ((host_down, _), (container, _)) = pair();

    let from_client = client.open(channels::SSH).await.unwrap();
    let at_host = timeout(WAIT, host_up.accept()).await.unwrap().unwrap();
    let to_container = host_down.open(at_host.kind()).await.unwrap();
    let mut at_container = timeout(WAIT, container.accept()).await.unwrap().unwrap();
    assert_eq!(at_container.kind(), channels::SSH);

    let relay_task = tokio::spawn(relay(at_host, to_container));

    from_client.write(b"hello").await.unwrap();
    assert_eq!(read_exactly(&mut at_container, 5).await, b"hello");

    at_container.write(b"world").await.unwrap();
    drop(at_container);

    let (mut client_rx, _client_tx) = from_client.split();
    let mut got = Vec::new();
    while let Some(chunk) = timeout(WAIT, client_rx.read()).await.unwrap() {
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, b"world");

    timeout(WAIT, relay_task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_finish_flushes_queued_messages() {
    let ((mux_a, control_a), (_mux_b, control_b)) = pair();
    let sender = MessageChannel::new(control_a);
    let mut receiver = MessageChannel::new(control_b);

    sender
        .send(&AgentResponse::error("BOOTSTRAP_FAILED", "docker not found"))
        .await
        .unwrap();
    timeout(WAIT, mux_a.finish()).await.unwrap();
    assert!(mux_a.is_closed());

    let last: AgentResponse = timeout(WAIT, receiver.recv()).await.unwrap().unwrap().unwrap();
    assert!(matches!(last, AgentResponse::Error { message, .. } if message == "docker not found"));
    let end: Option<AgentResponse> = timeout(WAIT, receiver.recv()).await.unwrap().unwrap();
    assert!(end.is_none());
}
