// tests/lifecycle.rs

//! Client and server connection lifecycle behavior.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time;

use exchange_rpc::{
    //
    transport::memory::{MemoryHub, MemoryTransporter},
    Channel,
    ChannelHandler,
    ChannelPtr,
    ClientState,
    Error,
    ExchangeClient,
    ExchangeServer,
    Message,
    Response,
    Result,
    Status,
    Url,
};

struct EchoHandler;

#[async_trait]
impl ChannelHandler for EchoHandler {
    // ---
    async fn received(&self, channel: ChannelPtr, message: Message) -> Result<()> {
        if let Message::Request(req) = message {
            if req.two_way {
                let reply = Message::Response(Response::ok(req.id, req.payload));
                channel.send(reply, false).await?;
            }
        }
        Ok(())
    }
}

struct NoopHandler;

#[async_trait]
impl ChannelHandler for NoopHandler {}

fn transporter(hub: &Arc<MemoryHub>) -> Arc<MemoryTransporter> {
    Arc::new(MemoryTransporter::with_hub(hub.clone()))
}

#[tokio::test(start_paused = true)]
async fn test_client_reconnects_after_connection_loss() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let url = Url::parse("mem://svc:1?reconnect=100")?;

    let server = ExchangeServer::bind(url.clone(), transporter(&hub), Arc::new(EchoHandler)).await?;
    let client = ExchangeClient::connect(url, transporter(&hub), Arc::new(NoopHandler)).await?;
    assert_eq!(client.state(), ClientState::Connected);

    // Kill the live channel out from under the client.
    let channel = client.channel().ok_or(Error::ChannelClosed)?;
    channel.close().await;
    time::sleep(Duration::from_millis(20)).await;
    assert!(!client.is_connected());

    // The periodic check brings the connection back without caller help.
    time::sleep(Duration::from_millis(500)).await;
    assert!(client.is_connected());
    assert_eq!(client.state(), ClientState::Connected);

    // And the restored connection actually works.
    let response = client.request(Bytes::from_static(b"back")).await.wait().await?;
    assert_eq!(response.status, Status::Ok);

    client.close(Duration::from_millis(100)).await;
    server.close(Duration::from_millis(100)).await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_client_stays_down_without_reconnect() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let url = Url::parse("mem://svc:2?reconnect=false")?;

    let server = ExchangeServer::bind(url.clone(), transporter(&hub), Arc::new(EchoHandler)).await?;
    let client = ExchangeClient::connect(url, transporter(&hub), Arc::new(NoopHandler)).await?;

    client.disconnect().await;
    assert_eq!(client.state(), ClientState::Disconnected);

    time::sleep(Duration::from_secs(10)).await;
    assert!(!client.is_connected());

    // An explicit reconnect still works.
    client.reconnect().await?;
    assert!(client.is_connected());

    client.close(Duration::from_millis(100)).await;
    server.close(Duration::from_millis(100)).await;
    Ok(())
}

#[tokio::test]
async fn test_accept_limit_refuses_excess_connections() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let url = Url::parse("mem://svc:3?accepts=1&reconnect=false&check=false")?;

    let server = ExchangeServer::bind(url.clone(), transporter(&hub), Arc::new(EchoHandler)).await?;

    let first =
        ExchangeClient::connect(url.clone(), transporter(&hub), Arc::new(NoopHandler)).await?;
    time::sleep(Duration::from_millis(20)).await;
    assert!(first.is_connected());
    assert_eq!(server.channel_count(), 1);

    // The second connection is accepted by the fabric but refused by the
    // server, which closes it before business dispatch.
    let second = ExchangeClient::connect(url, transporter(&hub), Arc::new(NoopHandler)).await?;
    time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_connected());
    assert_eq!(server.channel_count(), 1);

    // The first client is unaffected.
    let response = first.request(Bytes::from_static(b"still here")).await.wait().await?;
    assert_eq!(response.status, Status::Ok);

    first.close(Duration::from_millis(100)).await;
    second.close(Duration::from_millis(100)).await;
    server.close(Duration::from_millis(100)).await;
    Ok(())
}

#[tokio::test]
async fn test_server_close_disconnects_clients() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let url = Url::parse("mem://svc:4?reconnect=false")?;

    let server = ExchangeServer::bind(url.clone(), transporter(&hub), Arc::new(EchoHandler)).await?;
    let client = ExchangeClient::connect(url, transporter(&hub), Arc::new(NoopHandler)).await?;

    server.close(Duration::from_millis(200)).await;
    time::sleep(Duration::from_millis(50)).await;

    assert!(!client.is_connected());
    assert!(!server.is_bound());

    client.close(Duration::from_millis(100)).await;
    Ok(())
}

#[tokio::test]
async fn test_close_is_idempotent_and_terminal() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let url = Url::parse("mem://svc:5")?;

    let server = ExchangeServer::bind(url.clone(), transporter(&hub), Arc::new(EchoHandler)).await?;
    let client = ExchangeClient::connect(url, transporter(&hub), Arc::new(NoopHandler)).await?;

    client.close(Duration::from_millis(100)).await;
    client.close(Duration::from_millis(100)).await;
    assert_eq!(client.state(), ClientState::Closed);

    // A closed client refuses to come back.
    assert!(client.reconnect().await.is_err());

    server.close(Duration::from_millis(100)).await;
    server.close(Duration::from_millis(100)).await;
    assert!(!server.is_bound());
    Ok(())
}

#[tokio::test]
async fn test_heartbeat_options_validated_up_front() {
    // ---
    let hub = MemoryHub::new();
    // timeout below twice the interval must be rejected before any I/O.
    let url = Url::parse("mem://svc:6?heartbeat=60000&heartbeat.timeout=100000").unwrap();

    let client =
        ExchangeClient::connect(url.clone(), transporter(&hub), Arc::new(NoopHandler)).await;
    assert!(matches!(client, Err(Error::Config(_))));

    let server = ExchangeServer::bind(url, transporter(&hub), Arc::new(EchoHandler)).await;
    assert!(matches!(server, Err(Error::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_probes_keep_idle_connection_alive() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    // Server side stays heartbeat-free so only the client sweeps.
    let server_url = Url::parse("mem://svc:7")?;
    let client_url = Url::parse("mem://svc:7?heartbeat=1000&reconnect=false")?;

    let server =
        ExchangeServer::bind(server_url, transporter(&hub), Arc::new(EchoHandler)).await?;
    let client = ExchangeClient::connect(client_url, transporter(&hub), Arc::new(NoopHandler)).await?;

    let original = client.channel().ok_or(Error::ChannelClosed)?;

    // Several heartbeat timeouts' worth of wall-clock idleness. Probes keep
    // the read timestamps fresh, so the idle action never fires and the
    // original channel survives untouched.
    time::sleep(Duration::from_millis(7500)).await;

    assert!(client.is_connected());
    let current = client.channel().ok_or(Error::ChannelClosed)?;
    assert!(Arc::ptr_eq(&original, &current));
    // Probe replies are consumed at the exchange layer, never correlated.
    assert_eq!(client.pending_calls(), 0);

    client.close(Duration::from_millis(100)).await;
    server.close(Duration::from_millis(100)).await;
    Ok(())
}
