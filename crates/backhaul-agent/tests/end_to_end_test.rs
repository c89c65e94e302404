//! Public client -> server broker -> agent linker -> target service

use backhaul_agent::{AgentLinker, LinkState, LinkerConfig};
use backhaul_proto::{Agent, Tunnel};
use backhaul_server::{BrokerConfig, TunnelBroker};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

async fn start_broker() -> TunnelBroker {
    let config = BrokerConfig {
        bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ..BrokerConfig::default()
    };
    TunnelBroker::start(Tunnel::new("e2e", 0, 0), config)
        .await
        .unwrap()
}

async fn start_linker(broker: &TunnelBroker, target_port: u16) -> AgentLinker {
    let agent = Agent {
        remote_control_host: "127.0.0.1".to_string(),
        remote_control_port: broker.control_addr().port(),
        target_host: "127.0.0.1".to_string(),
        target_port,
    };
    let config = LinkerConfig {
        liveness_interval: Duration::from_millis(100),
        ..LinkerConfig::default()
    };
    let linker = AgentLinker::start(agent, config).unwrap();

    timeout(WAIT, linker.wait_for_state(LinkState::Connected))
        .await
        .unwrap();
    timeout(WAIT, async {
        while !broker.status().await.agent_connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    linker
}

/// Target that answers every "ping" with "pong"
async fn pong_target() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                while stream.read_exact(&mut buf).await.is_ok() {
                    if &buf == b"ping" && stream.write_all(b"pong").await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

/// Target that echoes everything back
async fn echo_target() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
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
async fn test_ping_pong_end_to_end() {
    let broker = start_broker().await;
    let linker = start_linker(&broker, pong_target().await).await;

    let mut client = TcpStream::connect(broker.public_addr()).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 4];
    timeout(WAIT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"pong");

    assert_eq!(broker.status().await.pending_requests, 1);
    assert_eq!(linker.pending_requests(), 1);

    drop(client);
    timeout(WAIT, async {
        while broker.status().await.pending_requests > 0 || linker.pending_requests() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_large_payload_round_trip() {
    let broker = start_broker().await;
    let _linker = start_linker(&broker, echo_target().await).await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
    let client = TcpStream::connect(broker.public_addr()).await.unwrap();
    let (mut reader, mut writer) = client.into_split();

    let expected = payload.clone();
    let writer_task = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut received = vec![0u8; expected.len()];
    timeout(WAIT, reader.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, expected);
    let _writer = writer_task.await.unwrap();
}

#[tokio::test]
async fn test_concurrent_clients_stay_separate() {
    let broker = start_broker().await;
    let _linker = start_linker(&broker, echo_target().await).await;

    let mut handles = Vec::new();
    for i in 0..8u8 {
        let addr = broker.public_addr();
        handles.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let message = vec![i; 1024];
            client.write_all(&message).await.unwrap();
            let mut received = vec![0u8; message.len()];
            client.read_exact(&mut received).await.unwrap();
            assert_eq!(received, message);
        }));
    }

    for handle in handles {
        timeout(WAIT, handle).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_unreachable_target_closes_client() {
    let broker = start_broker().await;
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);
    let _linker = start_linker(&broker, dead_port).await;

    let mut client = TcpStream::connect(broker.public_addr()).await.unwrap();
    expect_eof(&mut client).await;
    assert!(broker.status().await.agent_connected);
}

#[tokio::test]
async fn test_agent_restart_recovers_tunnel() {
    let broker = start_broker().await;
    let target_port = pong_target().await;
    let linker = start_linker(&broker, target_port).await;

    let mut client = TcpStream::connect(broker.public_addr()).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();

    linker.shutdown().await;
    expect_eof(&mut client).await;

    // Until a new agent arrives, public connections fail fast.
    let mut rejected = TcpStream::connect(broker.public_addr()).await.unwrap();
    expect_eof(&mut rejected).await;

    let _replacement = start_linker(&broker, target_port).await;
    let mut client = TcpStream::connect(broker.public_addr()).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"pong");
}
