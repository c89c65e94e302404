//! Broker behaviour against a scripted agent on a real control channel

use backhaul_proto::{Frame, RequestId, Tunnel};
use backhaul_server::{BrokerConfig, TunnelBroker};
use backhaul_transport_websocket::{
    ControlChannel, ControlReceiver, WebSocketConfig, WebSocketConnector,
};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn local_config() -> BrokerConfig {
    BrokerConfig {
        bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ..BrokerConfig::default()
    }
}

async fn start_broker(config: BrokerConfig) -> TunnelBroker {
    TunnelBroker::start(Tunnel::new("test", 0, 0), config)
        .await
        .unwrap()
}

async fn connect_agent(broker: &TunnelBroker) -> (ControlChannel, ControlReceiver) {
    let connector = WebSocketConnector::new(Arc::new(WebSocketConfig::default())).unwrap();
    connector
        .connect("127.0.0.1", broker.control_addr().port())
        .await
        .unwrap()
}

async fn wait_for_agent(broker: &TunnelBroker) {
    timeout(WAIT, async {
        while !broker.status().await.agent_connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent never registered");
}

async fn wait_for_pending(broker: &TunnelBroker, expected: usize) {
    timeout(WAIT, async {
        while broker.status().await.pending_requests != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pending request count never settled");
}

async fn next_frame(receiver: &mut ControlReceiver) -> Frame {
    let message = timeout(WAIT, receiver.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("control channel closed");
    Frame::decode(message).unwrap()
}

async fn expect_connect(receiver: &mut ControlReceiver) -> RequestId {
    match next_frame(receiver).await {
        Frame::Connect { request_id } => request_id,
        other => panic!("expected CONNECT, got {:?}", other),
    }
}

async fn expect_eof(client: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let n = timeout(WAIT, client.read(&mut buf))
        .await
        .expect("client was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_public_connection_fails_fast_without_agent() {
    let broker = start_broker(local_config()).await;

    let mut client = TcpStream::connect(broker.public_addr()).await.unwrap();
    expect_eof(&mut client).await;

    let status = broker.status().await;
    assert!(!status.agent_connected);
    assert_eq!(status.pending_requests, 0);

    // An agent arriving later never hears about the rejected client.
    let (_agent, mut agent_rx) = connect_agent(&broker).await;
    wait_for_agent(&broker).await;
    assert!(timeout(Duration::from_millis(200), agent_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_ping_pong_through_broker() {
    let broker = start_broker(local_config()).await;
    let (agent, mut agent_rx) = connect_agent(&broker).await;
    wait_for_agent(&broker).await;

    let mut client = TcpStream::connect(broker.public_addr()).await.unwrap();
    let request_id = expect_connect(&mut agent_rx).await;

    client.write_all(b"ping").await.unwrap();
    match next_frame(&mut agent_rx).await {
        Frame::Data {
            request_id: id,
            payload,
        } => {
            assert_eq!(id, request_id);
            assert_eq!(payload.as_ref(), b"ping");
        }
        other => panic!("expected DATA, got {:?}", other),
    }

    agent
        .send_frame(Frame::data(request_id, Bytes::from_static(b"pong")).encode())
        .unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"pong");

    assert_eq!(broker.status().await.pending_requests, 1);
}

#[tokio::test]
async fn test_agent_close_is_idempotent() {
    let broker = start_broker(local_config()).await;
    let (agent, mut agent_rx) = connect_agent(&broker).await;
    wait_for_agent(&broker).await;

    let mut client = TcpStream::connect(broker.public_addr()).await.unwrap();
    let request_id = expect_connect(&mut agent_rx).await;

    agent.send_frame(Frame::close(request_id).encode()).unwrap();
    agent.send_frame(Frame::close(request_id).encode()).unwrap();

    expect_eof(&mut client).await;
    wait_for_pending(&broker, 0).await;

    // The channel survives and keeps routing.
    let _second = TcpStream::connect(broker.public_addr()).await.unwrap();
    let second_id = expect_connect(&mut agent_rx).await;
    assert_ne!(second_id, request_id);
    assert!(broker.status().await.agent_connected);
}

#[tokio::test]
async fn test_client_close_sends_close_frame() {
    let broker = start_broker(local_config()).await;
    let (_agent, mut agent_rx) = connect_agent(&broker).await;
    wait_for_agent(&broker).await;

    let client = TcpStream::connect(broker.public_addr()).await.unwrap();
    let request_id = expect_connect(&mut agent_rx).await;
    drop(client);

    match next_frame(&mut agent_rx).await {
        Frame::Close { request_id: id } => assert_eq!(id, request_id),
        other => panic!("expected CLOSE, got {:?}", other),
    }
    wait_for_pending(&broker, 0).await;
}

#[tokio::test]
async fn test_large_client_write_is_chunked() {
    let broker = start_broker(local_config()).await;
    let (_agent, mut agent_rx) = connect_agent(&broker).await;
    wait_for_agent(&broker).await;

    let mut client = TcpStream::connect(broker.public_addr()).await.unwrap();
    let request_id = expect_connect(&mut agent_rx).await;

    let payload: Vec<u8> = (0..70000u32).map(|i| (i % 251) as u8).collect();
    client.write_all(&payload).await.unwrap();

    let mut reassembled = Vec::new();
    while reassembled.len() < payload.len() {
        match next_frame(&mut agent_rx).await {
            Frame::Data {
                request_id: id,
                payload,
            } => {
                assert_eq!(id, request_id);
                assert!(payload.len() + 17 <= 65536);
                reassembled.extend_from_slice(&payload);
            }
            other => panic!("expected DATA, got {:?}", other),
        }
    }
    assert_eq!(reassembled, payload);
}

#[tokio::test]
async fn test_newest_agent_wins() {
    let broker = start_broker(local_config()).await;

    let (first, mut first_rx) = connect_agent(&broker).await;
    wait_for_agent(&broker).await;
    let mut stranded = TcpStream::connect(broker.public_addr()).await.unwrap();
    expect_connect(&mut first_rx).await;

    let (_second, mut second_rx) = connect_agent(&broker).await;

    // The first channel is closed by the server and its request torn down.
    let ended = timeout(WAIT, async {
        while first_rx.recv().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok());
    expect_eof(&mut stranded).await;
    timeout(WAIT, first.closed()).await.unwrap();

    let _client = TcpStream::connect(broker.public_addr()).await.unwrap();
    expect_connect(&mut second_rx).await;
    assert_eq!(broker.status().await.pending_requests, 1);
}

#[tokio::test]
async fn test_agent_loss_closes_public_connections() {
    let broker = start_broker(local_config()).await;
    let (agent, mut agent_rx) = connect_agent(&broker).await;
    wait_for_agent(&broker).await;

    let mut client = TcpStream::connect(broker.public_addr()).await.unwrap();
    expect_connect(&mut agent_rx).await;

    agent.close();
    expect_eof(&mut client).await;

    timeout(WAIT, async {
        while broker.status().await.agent_connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(broker.status().await.pending_requests, 0);

    let mut late = TcpStream::connect(broker.public_addr()).await.unwrap();
    expect_eof(&mut late).await;
}

#[tokio::test]
async fn test_request_deadline_evicts_and_notifies_agent() {
    let config = BrokerConfig {
        request_timeout: Duration::from_millis(300),
        ..local_config()
    };
    let broker = start_broker(config).await;
    let (agent, mut agent_rx) = connect_agent(&broker).await;
    wait_for_agent(&broker).await;

    let mut client = TcpStream::connect(broker.public_addr()).await.unwrap();
    let request_id = expect_connect(&mut agent_rx).await;

    expect_eof(&mut client).await;
    match next_frame(&mut agent_rx).await {
        Frame::Close { request_id: id } => assert_eq!(id, request_id),
        other => panic!("expected CLOSE, got {:?}", other),
    }
    assert_eq!(broker.status().await.pending_requests, 0);

    // Late DATA for the evicted request is dropped without side effects.
    agent
        .send_frame(Frame::data(request_id, Bytes::from_static(b"late")).encode())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(broker.status().await.agent_connected);
}

#[tokio::test]
async fn test_malformed_and_stale_frames_keep_channel_open() {
    let broker = start_broker(local_config()).await;
    let (agent, mut agent_rx) = connect_agent(&broker).await;
    wait_for_agent(&broker).await;

    let mut unknown_opcode = vec![0x09u8];
    unknown_opcode.extend_from_slice(RequestId::new_v4().as_bytes());
    agent.send_frame(Bytes::from_static(&[0x02, 0x00, 0x01])).unwrap();
    agent.send_frame(Bytes::from(unknown_opcode)).unwrap();
    agent
        .send_frame(Frame::data(RequestId::new_v4(), Bytes::from_static(b"stale")).encode())
        .unwrap();
    agent.send_frame(Frame::close(RequestId::new_v4()).encode()).unwrap();
    agent.send_frame(Frame::connect(RequestId::new_v4()).encode()).unwrap();

    let _client = TcpStream::connect(broker.public_addr()).await.unwrap();
    expect_connect(&mut agent_rx).await;
    assert!(broker.status().await.agent_connected);
    assert!(!agent.is_closed());
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let broker = start_broker(local_config()).await;
    let (agent, mut agent_rx) = connect_agent(&broker).await;
    wait_for_agent(&broker).await;

    let mut client = TcpStream::connect(broker.public_addr()).await.unwrap();
    expect_connect(&mut agent_rx).await;

    broker.shutdown().await;

    expect_eof(&mut client).await;
    timeout(WAIT, agent.closed()).await.unwrap();
    let status = broker.status().await;
    assert!(!status.agent_connected);
    assert_eq!(status.pending_requests, 0);
}
