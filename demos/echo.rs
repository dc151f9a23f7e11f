//! An echo node: answers every received message with the same data.
//!
//! Run with `cargo run --example echo -- [port]` (default 2998), then point the `send`
//!  example at it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, Level};

use chirp::{Chirp, Config, MessageHandler, ReceivedMessage};

struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn on_message(&self, chirp: &Chirp, msg: ReceivedMessage) {
        info!(
            "received {} bytes from {:?}, echoing",
            msg.data().len(),
            msg.addr()
        );
        let reply = msg.reply().with_data(msg.data().to_vec());
        let chirp = chirp.clone();
        tokio::spawn(async move {
            if let Err(e) = chirp.send(reply).await {
                info!("echo failed: {}", e);
            }
        });
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    init_logging();

    let port = std::env::args()
        .nth(1)
        .map(|p| p.parse())
        .transpose()?
        .unwrap_or(2998);

    let config = Config {
        port,
        synchronous: true,
        disable_encryption: true,
        ..Config::default()
    };
    let chirp = Chirp::start(config, Arc::new(Echo)).await?;
    info!("echo node {:?} listening on port {}", chirp.identity(), port);

    // runs until SIGINT / SIGTERM
    std::future::pending::<()>().await;
    Ok(())
}
