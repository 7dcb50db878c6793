//! Minimal pub/sub over the TCP path: one publisher, one subscriber, both in
//!  this process. Run with `cargo run --example tcp_pubsub`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{info, Level};

use transport::config::TcpTransportConfig;
use transport::tcp::publisher::Publisher;
use transport::tcp::subscriber::{PayloadHandler, Subscriber};

struct PrintingHandler;

#[async_trait]
impl PayloadHandler for PrintingHandler {
    async fn on_payload(&self, payload: &[u8]) {
        info!("received payload: {:?}", String::from_utf8_lossy(payload));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    let config = Arc::new(TcpTransportConfig::default_local());

    let publisher = Publisher::bind(SocketAddr::from(([127, 0, 0, 1], 0)), config.clone()).await?;
    info!("publisher listening on {}", publisher.local_addr());

    let subscriber = Subscriber::new(config, Arc::new(PrintingHandler))?;
    subscriber.connect_to("127.0.0.1", publisher.local_addr().port());

    while publisher.subscriber_count() == 0 {
        sleep(Duration::from_millis(10)).await;
    }

    for i in 0..10 {
        publisher.send(format!("sample #{}", i).as_bytes());
        sleep(Duration::from_millis(100)).await;
    }

    sleep(Duration::from_millis(200)).await;
    subscriber.cancel();
    publisher.cancel();
    Ok(())
}
