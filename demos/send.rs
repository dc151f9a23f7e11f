//! Sends one message to an echo node and waits for the answer.
//!
//! Run with `cargo run --example send -- [target] [message]`, default target
//!  `127.0.0.1:2998`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, Level};

use chirp::{Chirp, Config, Message, MessageHandler, ReceivedMessage};

struct Collect {
    tx: mpsc::UnboundedSender<ReceivedMessage>,
}

#[async_trait]
impl MessageHandler for Collect {
    async fn on_message(&self, _chirp: &Chirp, msg: ReceivedMessage) {
        let _ = self.tx.send(msg);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();

    let target: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:2998".to_string())
        .parse()?;
    let text = std::env::args().nth(2).unwrap_or_else(|| "hello".to_string());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = Config {
        port: 2999,
        synchronous: true,
        disable_encryption: true,
        ..Config::default()
    };
    let chirp = Chirp::start(config, Arc::new(Collect { tx })).await?;

    let msg = Message::new(target).with_data(text.clone().into_bytes());
    info!("sending {:?} to {:?}", text, target);
    chirp.send(msg).await?;
    info!("sent and acknowledged");

    let answer = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .expect("handler channel closed");
    info!("answer: {:?}", String::from_utf8_lossy(answer.data()));
    answer.release();

    chirp.close().await?;
    Ok(())
}
