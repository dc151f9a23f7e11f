//! The user-facing handle: lifecycle, sending and slot release.

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::ChirpError;
use crate::handler::MessageHandler;
use crate::identity::Identity;
use crate::message::{Message, ReceivedMessage};
use crate::protocol::Protocol;

/// A running chirp instance.
///
/// The handle is cheap to clone and can be used from any thread or task; sends are
///  serialised per remote internally. Dropping all handles does *not* stop the
///  instance; call [`close`](Chirp::close).
#[derive(Clone)]
pub struct Chirp {
    proto: Arc<Protocol>,
}

impl Chirp {
    /// Validate the configuration, bind the listening sockets and start the engine.
    ///  The returned future resolves once the instance accepts connections.
    pub async fn start(
        config: Config,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Chirp, ChirpError> {
        let disable_signals = config.disable_signals;
        let proto = Protocol::start(config, handler).await?;
        if !disable_signals {
            spawn_signal_task(&proto);
        }
        Ok(Chirp { proto })
    }

    pub(crate) fn from_proto(proto: Arc<Protocol>) -> Chirp {
        Chirp { proto }
    }

    /// This node's identity as published to peers in the handshake.
    pub fn identity(&self) -> Identity {
        self.proto.identity()
    }

    /// The port this node advertises to peers in the handshake: the `public_port`
    ///  override for nodes behind a NAT, otherwise the listening port.
    pub fn public_port(&self) -> u16 {
        self.proto.advertised_port()
    }

    /// Send a message and resolve with its outcome.
    ///
    /// Messages to the same remote are sent in the order they were submitted; in
    ///  synchronous mode each message additionally waits for the peer's acknowledge
    ///  before the next data message goes out. There is no ordering between distinct
    ///  remotes. The outcome is delivered exactly once: `Ok` on success, or the error
    ///  kind the message failed with.
    pub async fn send(&self, msg: Message) -> Result<(), ChirpError> {
        if msg.header.len() > u16::MAX as usize {
            return Err(ChirpError::value(format!(
                "header of {} bytes exceeds the wire format limit of {}",
                msg.header.len(),
                u16::MAX
            )));
        }
        let total = msg.header.len() as u64 + msg.data.len() as u64;
        if total > self.proto.config().max_msg_size as u64 {
            return Err(ChirpError::value(format!(
                "message of {} bytes exceeds max_msg_size of {}",
                total,
                self.proto.config().max_msg_size
            )));
        }

        let remote = self.proto.get_or_create_remote(msg.addr)?;
        remote.maybe_enqueue_noop(self.proto.config().effective_reuse_time());

        let (completion, outcome) = tokio::sync::oneshot::channel();
        remote.enqueue_data(msg, completion);
        outcome.await.map_err(|_| ChirpError::Shutdown)?
    }

    /// Release the slot of a received message, acknowledging it if the sender asked
    ///  for an acknowledge. Equivalent to dropping the message; provided for making
    ///  the release explicit at call sites.
    pub fn release_msg_slot(&self, msg: ReceivedMessage) {
        msg.release();
    }

    /// Shut down: all connections are closed, every queued and in-flight message
    ///  fails with [`ChirpError::Shutdown`], and the future resolves once every task
    ///  of this instance is gone. Idempotent.
    pub async fn close(&self) -> Result<(), ChirpError> {
        self.proto.close();
        self.proto.gate().closed().await;
        info!("chirp instance closed");
        Ok(())
    }
}

impl std::fmt::Debug for Chirp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chirp")
            .field("identity", &self.identity())
            .field("port", &self.public_port())
            .finish()
    }
}

fn spawn_signal_task(proto: &Arc<Protocol>) {
    let weak = Arc::downgrade(proto);
    let handle = tokio::spawn(async move {
        wait_for_signal().await;
        if let Some(proto) = weak.upgrade() {
            info!("termination signal received, closing");
            let chirp = Chirp::from_proto(proto);
            // close on a separate task: this one is aborted as part of closing
            tokio::spawn(async move {
                let _ = chirp.close().await;
            });
        }
    });
    proto.add_service_task(handle);
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct ChannelHandler {
        tx: mpsc::UnboundedSender<ReceivedMessage>,
    }

    #[async_trait]
    impl MessageHandler for ChannelHandler {
        async fn on_message(&self, _chirp: &Chirp, msg: ReceivedMessage) {
            let _ = self.tx.send(msg);
        }
    }

    fn test_config(port: u16, synchronous: bool) -> Config {
        Config {
            port,
            synchronous,
            timeout: Duration::from_secs(1),
            disable_encryption: true,
            disable_signals: true,
            ..Config::default()
        }
    }

    async fn start_node(config: Config) -> (Chirp, mpsc::UnboundedReceiver<ReceivedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let chirp = Chirp::start(config, Arc::new(ChannelHandler { tx }))
            .await
            .unwrap();
        (chirp, rx)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new([127, 0, 0, 1].into(), port)
    }

    async fn recv(
        rx: &mut mpsc::UnboundedReceiver<ReceivedMessage>,
    ) -> ReceivedMessage {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no message within 5s")
            .expect("channel closed")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_echo_async_cleartext() {
        let (server, mut srx) = start_node(test_config(29311, false)).await;
        let (client, mut crx) = start_node(test_config(29312, false)).await;

        let msg = Message::new(addr(29311)).with_data(Bytes::from_static(b"hello"));
        let identity = msg.identity();
        client.send(msg).await.unwrap();

        let received = recv(&mut srx).await;
        assert_eq!(received.data(), b"hello");
        assert_eq!(received.header(), b"");
        assert_eq!(received.identity(), identity);
        assert_eq!(received.remote_identity(), client.identity());
        assert_eq!(received.addr(), addr(29312));

        server
            .send(received.reply().with_data(Bytes::from_static(b"world")))
            .await
            .unwrap();
        let back = recv(&mut crx).await;
        assert_eq!(back.identity(), identity);
        assert_eq!(back.data(), b"world");

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_request_reply() {
        let (server, mut srx) = start_node(test_config(29321, true)).await;
        let (client, mut crx) = start_node(test_config(29322, true)).await;

        let ping = Message::new(addr(29321)).with_data(Bytes::from_static(b"ping"));
        let identity = ping.identity();
        let send = tokio::spawn({
            let client = client.clone();
            async move { client.send(ping).await }
        });

        let request = recv(&mut srx).await;
        assert_eq!(request.data(), b"ping");
        let reply = request.reply().with_data(Bytes::from_static(b"pong"));
        // releasing the slot acknowledges the ping, completing the client's send
        request.release();
        send.await.unwrap().unwrap();

        let reply_send = tokio::spawn({
            let server = server.clone();
            async move { server.send(reply).await }
        });
        let response = recv(&mut crx).await;
        assert_eq!(response.identity(), identity);
        assert_eq!(response.data(), b"pong");
        response.release();
        reply_send.await.unwrap().unwrap();

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_serials_increase_per_remote() {
        let (server, mut srx) = start_node(test_config(29331, true)).await;
        let (client, _crx) = start_node(test_config(29332, true)).await;

        let mut sends = Vec::new();
        for i in 0..10u8 {
            let client = client.clone();
            sends.push(tokio::spawn(async move {
                client.send(Message::new(addr(29331)).with_data(vec![i])).await
            }));
        }

        let mut serials = Vec::new();
        for _ in 0..10 {
            let msg = recv(&mut srx).await;
            serials.push(msg.serial());
            msg.release();
        }
        for send in sends {
            send.await.unwrap().unwrap();
        }

        for pair in serials.windows(2) {
            assert!(
                pair[1].wrapping_sub(pair[0]) >= 1 && pair[1].wrapping_sub(pair[0]) < 1000,
                "serials not increasing: {:?}",
                serials
            );
        }

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slot_exhaustion_back_pressure() {
        let mut server_config = test_config(29341, false);
        server_config.max_slots = 1;
        let (server, mut srx) = start_node(server_config).await;
        let (client, _crx) = start_node(test_config(29342, false)).await;

        client
            .send(Message::new(addr(29341)).with_data(Bytes::from_static(b"one")))
            .await
            .unwrap();
        let first = recv(&mut srx).await;
        assert_eq!(first.data(), b"one");

        // the second send completes (bytes written), but the server has no free slot
        client
            .send(Message::new(addr(29341)).with_data(Bytes::from_static(b"two")))
            .await
            .unwrap();
        assert!(
            timeout(Duration::from_millis(300), srx.recv()).await.is_err(),
            "second message delivered while the only slot was held"
        );

        first.release();
        let second = recv(&mut srx).await;
        assert_eq!(second.data(), b"two");

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_failure_fails_send_and_remote_survives() {
        let (client, _crx) = start_node(test_config(29351, true)).await;

        // nothing listens on this port
        let outcome = timeout(
            Duration::from_secs(5),
            client.send(Message::new(addr(29352)).with_data(Bytes::from_static(b"x"))),
        )
        .await
        .expect("send did not resolve");
        assert!(
            matches!(
                outcome,
                Err(ChirpError::CannotConnect) | Err(ChirpError::Timeout)
            ),
            "unexpected outcome: {:?}",
            outcome
        );

        // the remote survives the failure and accepts further sends
        assert_eq!(client.proto.remote_count(), 1);
        let outcome = timeout(
            Duration::from_secs(5),
            client.send(Message::new(addr(29352)).with_data(Bytes::from_static(b"y"))),
        )
        .await
        .expect("second send did not resolve");
        assert!(outcome.is_err());

        client.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_oversize_message_shuts_receiving_connection() {
        let mut server_config = test_config(29361, false);
        server_config.max_msg_size = 1024;
        let (server, mut srx) = start_node(server_config).await;
        let (client, _crx) = start_node(test_config(29362, true)).await;

        let outcome = timeout(
            Duration::from_secs(5),
            client.send(Message::new(addr(29361)).with_data(vec![0u8; 2000])),
        )
        .await
        .expect("send did not resolve");
        assert!(
            matches!(
                outcome,
                Err(ChirpError::WriteError)
                    | Err(ChirpError::ProtocolError(_))
                    | Err(ChirpError::Timeout)
                    | Err(ChirpError::Shutdown)
            ),
            "unexpected outcome: {:?}",
            outcome
        );
        assert!(srx.try_recv().is_err(), "oversize message was delivered");

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_idle_remotes_are_garbage_collected() {
        let mut server_config = test_config(29371, false);
        server_config.timeout = Duration::from_millis(300);
        server_config.reuse_time = Duration::from_secs(1);
        let mut client_config = test_config(29372, false);
        client_config.timeout = Duration::from_millis(300);
        client_config.reuse_time = Duration::from_secs(1);

        let (server, mut srx) = start_node(server_config).await;
        let (client, _crx) = start_node(client_config).await;

        client
            .send(Message::new(addr(29371)).with_data(Bytes::from_static(b"hi")))
            .await
            .unwrap();
        recv(&mut srx).await.release();
        assert_eq!(client.proto.remote_count(), 1);
        assert_eq!(server.proto.remote_count(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(client.proto.remote_count(), 0);
        assert_eq!(server.proto.remote_count(), 0);
        assert!(client.proto.stats().remotes_collected() >= 1);

        // a fresh send builds a fresh connection
        client
            .send(Message::new(addr(29371)).with_data(Bytes::from_static(b"again")))
            .await
            .unwrap();
        assert_eq!(recv(&mut srx).await.data(), b"again");

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_noop_probe_before_send_on_idle_remote() {
        let mut server_config = test_config(29381, false);
        server_config.timeout = Duration::from_millis(500);
        server_config.reuse_time = Duration::from_secs(2);
        let mut client_config = test_config(29382, false);
        client_config.timeout = Duration::from_millis(500);
        client_config.reuse_time = Duration::from_secs(2);

        let (server, mut srx) = start_node(server_config).await;
        let (client, _crx) = start_node(client_config).await;

        client
            .send(Message::new(addr(29381)).with_data(Bytes::from_static(b"first")))
            .await
            .unwrap();
        recv(&mut srx).await.release();
        assert_eq!(client.proto.stats().noops_enqueued(), 0);

        // idle past 3/4 of the reuse time, still before collection
        tokio::time::sleep(Duration::from_millis(1600)).await;
        client
            .send(Message::new(addr(29381)).with_data(Bytes::from_static(b"second")))
            .await
            .unwrap();
        assert_eq!(recv(&mut srx).await.data(), b"second");
        assert!(client.proto.stats().noops_enqueued() >= 1);

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_simultaneous_dial_race() {
        let (a, mut arx) = start_node(test_config(29391, true)).await;
        let (b, mut brx) = start_node(test_config(29392, true)).await;

        let recv_a = tokio::spawn(async move { recv(&mut arx).await.data().to_vec() });
        let recv_b = tokio::spawn(async move { recv(&mut brx).await.data().to_vec() });

        let (to_b, to_a) = tokio::join!(
            a.send(Message::new(addr(29392)).with_data(Bytes::from_static(b"from a"))),
            b.send(Message::new(addr(29391)).with_data(Bytes::from_static(b"from b"))),
        );
        to_b.unwrap();
        to_a.unwrap();

        assert_eq!(recv_a.await.unwrap(), b"from b");
        assert_eq!(recv_b.await.unwrap(), b"from a");

        // exactly one authoritative connection per peer on each side; a superseded
        //  dial at most lingers in the old set until collection
        assert_eq!(a.proto.remote_count(), 1);
        assert_eq!(b.proto.remote_count(), 1);
        assert!(a.proto.old_connection_count() <= 1);
        assert!(b.proto.old_connection_count() <= 1);

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_is_idempotent_and_rejects_sends() {
        let (node, _rx) = start_node(test_config(29401, true)).await;
        node.close().await.unwrap();
        node.close().await.unwrap();

        let outcome = node.send(Message::new(addr(29402))).await;
        assert_eq!(outcome, Err(ChirpError::Shutdown));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_send_rejects_messages_over_own_limit() {
        let mut config = test_config(29405, true);
        config.max_msg_size = 100;
        let (node, _rx) = start_node(config).await;

        let outcome = node
            .send(Message::new(addr(29406)).with_data(vec![0u8; 200]))
            .await;
        assert!(matches!(outcome, Err(ChirpError::ValueError(_))));

        node.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_port_collision_is_addr_in_use() {
        let (node, _rx) = start_node(test_config(29411, true)).await;

        let (tx, _rx2) = mpsc::unbounded_channel();
        let second = Chirp::start(
            test_config(29411, true),
            Arc::new(ChannelHandler { tx }),
        )
        .await;
        assert!(matches!(second, Err(ChirpError::AddrInUse)));

        node.close().await.unwrap();
    }
}
