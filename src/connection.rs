//! A single TCP stream (optionally TLS-wrapped) serving a remote.
//!
//! A connection is established in three steps: transport setup (TCP options, TLS
//!  handshake where applicable), the 18-byte chirp handshake exchange, and registration
//!  with the remote keyed by the peer's advertised endpoint. Only then are the two I/O
//!  tasks spawned: the read task feeds the reader state machine and delivers messages,
//!  the write task serialises jobs handed over by the remote's dispatcher.
//!
//! Shutdown is idempotent. The first caller wins, publishes the reason through a watch
//!  channel both tasks select on, and detaches the connection from its remote; the
//!  in-flight message (if any) is failed by the write task itself, so every send
//!  completes exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use anyhow::Context;
use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace, warn, Instrument, Level};

use crate::buffer_pool::BufferPool;
use crate::config::TCP_KEEPALIVE;
use crate::error::ChirpError;
use crate::identity::Identity;
use crate::message::ReceivedMessage;
use crate::protocol::Protocol;
use crate::reader::{ReadAction, Reader};
use crate::remote::Remote;
use crate::tls::should_encrypt;
use crate::transport::Transport;
use crate::wire::Handshake;
use crate::writer::{write_message, WriteJob};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Incoming,
    Outgoing,
}

pub(crate) struct Connection {
    pub id: u64,
    pub direction: Direction,
    /// The peer's endpoint as a remote key: its IP plus its *advertised* port.
    pub peer_addr: SocketAddr,
    pub remote_identity: Identity,
    pub encrypted: bool,
    pub pool: Arc<BufferPool>,
    proto: Weak<Protocol>,
    remote: Mutex<Weak<Remote>>,
    write_tx: mpsc::Sender<WriteJob>,
    writer_busy: AtomicBool,
    shut: AtomicBool,
    closed_tx: watch::Sender<Option<ChirpError>>,
    last_activity: Mutex<Instant>,
}

impl Connection {
    pub fn is_shutting_down(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }

    /// Claim the writer for one job; returns false if a job is already in flight.
    pub fn claim_writer(&self) -> bool {
        !self.writer_busy.swap(true, Ordering::AcqRel)
    }

    pub fn release_writer(&self) {
        self.writer_busy.store(false, Ordering::Release);
    }

    pub fn writer_busy(&self) -> bool {
        self.writer_busy.load(Ordering::Acquire)
    }

    /// Hand a job to the write task. Only valid after a successful
    ///  [`claim_writer`](Connection::claim_writer).
    pub fn submit(&self, job: WriteJob) -> Result<(), mpsc::error::TrySendError<WriteJob>> {
        self.write_tx.try_send(job)
    }

    pub fn refresh_activity(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }

    fn remote(&self) -> Option<Arc<Remote>> {
        self.remote.lock().expect("remote lock poisoned").upgrade()
    }

    fn close_reason(&self) -> ChirpError {
        self.closed_tx
            .borrow()
            .clone()
            .unwrap_or(ChirpError::Shutdown)
    }

    /// Shut the connection down. Idempotent; the first reason sticks.
    pub fn shutdown(self: &Arc<Self>, reason: ChirpError) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            "shutting down connection {} to {:?}: {}",
            self.id, self.peer_addr, reason
        );
        let _ = self.closed_tx.send(Some(reason.clone()));

        if let Some(proto) = self.proto.upgrade() {
            proto.forget_old_connection(self.id);
            if let Some(remote) = self.remote() {
                remote.on_conn_shutdown(self, reason, &proto);
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("direction", &self.direction)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

/// Take a fresh TCP stream through transport setup, the handshake exchange and
///  registration, and start its I/O tasks. The caller bounds this with the connect
///  timeout, which doubles as the stalled-handshake guard for accepted connections.
pub(crate) async fn establish(
    proto: Arc<Protocol>,
    stream: TcpStream,
    direction: Direction,
) -> anyhow::Result<()> {
    let peer_ip = stream.peer_addr().context("peer has no address")?.ip();
    let dialed_addr = stream.peer_addr()?;
    configure_stream(&stream)?;

    let encrypt = should_encrypt(proto.config(), peer_ip);
    let mut transport = if encrypt {
        let tls = proto
            .tls()
            .ok_or_else(|| anyhow::anyhow!("encryption required but TLS is not set up"))?;
        match direction {
            Direction::Outgoing => Transport::Tls(tls.connect(stream).await?),
            Direction::Incoming => Transport::Tls(tls.accept(stream).await?),
        }
    } else {
        Transport::Plain(stream)
    };

    // both sides send their handshake immediately on connection establishment
    let own = Handshake {
        port: proto.advertised_port(),
        identity: proto.identity(),
    };
    let mut hs_buf = BytesMut::with_capacity(Handshake::SERIALIZED_LEN);
    own.ser(&mut hs_buf);
    transport.write_all(&hs_buf).await?;
    transport.flush().await?;

    let mut peer_buf = [0u8; Handshake::SERIALIZED_LEN];
    transport.read_exact(&mut peer_buf).await?;
    let peer = Handshake::deser(&mut &peer_buf[..])?;

    let peer_addr = match direction {
        // we dialed the peer's listening endpoint, keep it as the key
        Direction::Outgoing => dialed_addr,
        // key by the port the peer listens on, not its ephemeral port
        Direction::Incoming => SocketAddr::new(peer_ip, peer.port),
    };

    let (write_tx, write_rx) = mpsc::channel(1);
    let (closed_tx, _) = watch::channel(None);
    let closed_rx_reader = closed_tx.subscribe();
    let closed_rx_writer = closed_tx.subscribe();

    let conn = Arc::new(Connection {
        id: proto.next_conn_id(),
        direction,
        peer_addr,
        remote_identity: peer.identity,
        encrypted: transport.is_encrypted(),
        pool: Arc::new(BufferPool::new(proto.config().effective_max_slots())),
        proto: Arc::downgrade(&proto),
        remote: Mutex::new(Weak::new()),
        write_tx,
        writer_busy: AtomicBool::new(false),
        shut: AtomicBool::new(false),
        closed_tx,
        last_activity: Mutex::new(Instant::now()),
    });
    debug!(
        "connection {} to {:?} established ({:?}, encrypted: {})",
        conn.id, peer_addr, direction, conn.encrypted
    );

    let remote = proto.register_connection(&conn)?;
    *conn.remote.lock().expect("remote lock poisoned") = Arc::downgrade(&remote);

    let (read_half, write_half) = tokio::io::split(transport);
    let span = tracing::span!(Level::DEBUG, "connection", id = conn.id, peer = ?peer_addr);
    proto.spawn_task(
        read_task(conn.clone(), read_half, closed_rx_reader).instrument(span.clone()),
    );
    proto.spawn_task(
        write_task(conn.clone(), write_half, write_rx, closed_rx_writer).instrument(span),
    );

    remote.process_queues();
    Ok(())
}

fn configure_stream(stream: &TcpStream) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(TCP_KEEPALIVE))?;
    Ok(())
}

async fn read_task(
    conn: Arc<Connection>,
    mut read_half: ReadHalf<Transport>,
    mut closed: watch::Receiver<Option<ChirpError>>,
) {
    let Some(proto) = conn.proto.upgrade() else {
        return;
    };
    let mut reader = Reader::new(proto.config().max_msg_size);
    let mut buf = vec![0u8; proto.config().effective_buffer_size()];

    let reason = 'conn: loop {
        let n = tokio::select! {
            _ = closed.changed() => break 'conn None,
            res = read_half.read(&mut buf) => match res {
                Ok(0) => {
                    trace!("peer closed the stream");
                    break 'conn Some(ChirpError::WriteError);
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("read failed: {}", e);
                    break 'conn Some(match e.kind() {
                        std::io::ErrorKind::ConnectionReset => ChirpError::WriteError,
                        _ => ChirpError::from(e),
                    });
                }
            }
        };

        let mut pos = 0;
        while pos < n {
            let (consumed, action) = match reader.consume(&buf[pos..n], &conn.pool) {
                Ok(r) => r,
                Err(e) => {
                    warn!("protocol violation from {:?}: {:#}", conn.peer_addr, e);
                    break 'conn Some(ChirpError::protocol(format!("{:#}", e)));
                }
            };
            pos += consumed;
            match action {
                None => {}
                Some(ReadAction::Deliver(slot, header)) => {
                    let Some(remote) = conn.remote() else {
                        break 'conn None;
                    };
                    conn.refresh_activity();
                    remote.refresh_timestamp();
                    let msg = ReceivedMessage {
                        identity: header.identity,
                        serial: header.serial,
                        addr: conn.peer_addr,
                        remote_identity: conn.remote_identity,
                        send_ack: header.wants_ack(),
                        slot: Some(slot),
                        pool: conn.pool.clone(),
                        remote: Arc::downgrade(&remote),
                    };
                    trace!("delivering message {:?}", msg.identity());
                    proto.deliver(msg).await;
                }
                Some(ReadAction::AckReceived(identity)) => {
                    conn.refresh_activity();
                    if let Some(remote) = conn.remote() {
                        remote.on_ack(identity);
                    }
                }
                Some(ReadAction::NoopSeen) => {
                    trace!("liveness probe from {:?}", conn.peer_addr);
                    conn.refresh_activity();
                    if let Some(remote) = conn.remote() {
                        remote.refresh_timestamp();
                    }
                }
                Some(ReadAction::NeedSlot) => {
                    // sole back-pressure mechanism: the stream is stopped right here,
                    //  so the peer's TCP window eventually closes; a slot release
                    //  resumes consumption at the exact stashed position
                    tokio::select! {
                        _ = closed.changed() => break 'conn None,
                        _ = conn.pool.slot_released() => {}
                    }
                }
            }
        }
    };

    reader.abort(&conn.pool);
    if let Some(reason) = reason {
        conn.shutdown(reason);
    }
}

async fn write_task(
    conn: Arc<Connection>,
    mut write_half: WriteHalf<Transport>,
    mut write_rx: mpsc::Receiver<WriteJob>,
    mut closed: watch::Receiver<Option<ChirpError>>,
) {
    let send_timeout = match conn.proto.upgrade() {
        Some(proto) => proto.config().timeout,
        None => return,
    };
    let mut scratch = BytesMut::with_capacity(crate::wire::WireHeader::SERIALIZED_LEN);

    loop {
        let mut job = tokio::select! {
            _ = closed.changed() => break,
            job = write_rx.recv() => match job {
                None => break,
                Some(job) => job,
            }
        };

        let Some(remote) = conn.remote() else {
            conn.release_writer();
            let _ = job
                .completion
                .take()
                .map(|c| c.send(Err(ChirpError::Shutdown)));
            break;
        };

        // the serial goes out before the first byte of the message
        let serial = remote.next_serial();
        trace!("writing {:?} message with serial {}", job.kind, serial);

        let outcome = tokio::select! {
            _ = closed.changed() => Err(conn.close_reason()),
            res = timeout(send_timeout, write_message(&mut write_half, &mut scratch, serial, &job)) => {
                match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(ChirpError::Timeout),
                }
            }
        };

        let failure = outcome.clone().err();
        conn.release_writer();
        remote.on_send_complete(job.kind, job.awaits_ack(), job.completion.take(), outcome);

        if let Some(reason) = failure {
            // a send timeout or write failure invalidates the whole connection; the
            //  remote retries queued messages on a fresh one after the debounce
            conn.shutdown(reason);
            break;
        }
    }

    // fail whatever the dispatcher managed to hand over but was never written
    while let Ok(mut job) = write_rx.try_recv() {
        let reason = conn.close_reason();
        conn.release_writer();
        if let Some(remote) = conn.remote() {
            remote.on_send_complete(job.kind, job.awaits_ack(), job.completion.take(), Err(reason));
        } else if let Some(completion) = job.completion.take() {
            let _ = completion.send(Err(reason));
        }
    }
}
