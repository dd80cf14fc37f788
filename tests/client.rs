//! The client against a live server.

mod common;

use bytes::Bytes;
use futures::StreamExt;
use tokio::net::TcpListener;

use common::{start_server, within};
use duplex_chat::{
    ChannelSink, ChannelSource, Client, ClientConfig, ClientError, CloseReason, Liveness,
    ShutdownPolicy,
};

fn config_for(addr: std::net::SocketAddr) -> ClientConfig {
    ClientConfig {
        address: addr.ip(),
        port: addr.port(),
    }
}

#[test]
fn default_target_is_local_9999() {
    let config = ClientConfig::default();
    assert_eq!(config.addr(), "127.0.0.1:9999".parse().unwrap());
}

#[tokio::test]
async fn connect_failure_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    match Client::connect(&config_for(addr)).await {
        Err(ClientError::Connect { addr: failed, .. }) => assert_eq!(failed, addr),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("connected to a closed port"),
    }
}

#[tokio::test]
async fn talks_both_ways_and_quits() {
    let mut harness = start_server(ShutdownPolicy::Detach).await;
    let mut client = Client::connect(&config_for(harness.addr)).await.unwrap();
    harness.wait_for_sessions(1).await;

    let (outgoing, source) = ChannelSource::new();
    let (sink, mut incoming) = ChannelSink::new();
    let session = tokio::spawn(async move {
        let reason = client.communicate(source, &sink).await;
        (client, reason)
    });

    outgoing.unbounded_send(Bytes::from_static(b"hello")).unwrap();
    assert_eq!(&harness.next_delivery().await.payload[..], b"hello");

    harness
        .input
        .unbounded_send(Bytes::from_static(b"welcome"))
        .unwrap();
    let got = within("client delivery", incoming.next()).await.unwrap();
    assert_eq!(&got.payload[..], b"welcome");

    outgoing.unbounded_send(Bytes::from_static(b"quit()")).unwrap();
    let (mut client, reason) = within("client exit", session).await.unwrap();
    assert_eq!(reason.unwrap(), CloseReason::LocalTerminator);
    assert_eq!(&harness.next_delivery().await.payload[..], b"quit()");
    harness.wait_for_sessions(0).await;

    assert_eq!(client.state().liveness(), Liveness::Closing);
    assert!(client.close().await);
    assert!(!client.close().await);
    assert_eq!(client.state().liveness(), Liveness::Closed);

    let (_tx, source) = ChannelSource::new();
    let (sink, _rx) = ChannelSink::new();
    assert!(matches!(
        client.communicate(source, &sink).await,
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn server_side_close_ends_client_session() {
    let harness = start_server(ShutdownPolicy::Detach).await;
    let mut client = Client::connect(&config_for(harness.addr)).await.unwrap();
    harness.wait_for_sessions(1).await;

    let (_outgoing, source) = ChannelSource::new();
    let (sink, mut incoming) = ChannelSink::new();
    let session = tokio::spawn(async move {
        let reason = client.communicate(source, &sink).await;
        (client, reason)
    });

    harness
        .input
        .unbounded_send(Bytes::from_static(b"quit()"))
        .unwrap();
    let got = within("client delivery", incoming.next()).await.unwrap();
    assert_eq!(&got.payload[..], b"quit()");

    let (mut client, reason) = within("client exit", session).await.unwrap();
    assert_eq!(reason.unwrap(), CloseReason::PeerEof);
    assert!(client.close().await);
}

#[tokio::test]
async fn client_input_ending_disconnects() {
    let harness = start_server(ShutdownPolicy::Detach).await;
    let mut client = Client::connect(&config_for(harness.addr)).await.unwrap();
    harness.wait_for_sessions(1).await;

    let (outgoing, source) = ChannelSource::new();
    let (sink, _incoming) = ChannelSink::new();
    drop(outgoing);

    let reason = within("client exit", client.communicate(source, &sink))
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::InputClosed);
    client.close().await;
    harness.wait_for_sessions(0).await;
}
