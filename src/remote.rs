//! The long-lived per-peer record.
//!
//! A `Remote` is keyed by the peer's endpoint and outlives any single connection to
//!  that peer: it holds the send queues, the serial counter and the ack bookkeeping,
//!  while connections come and go underneath it. The dispatcher
//!  ([`process_queues`](Remote::process_queues)) is the only place that hands messages
//!  to a connection's writer; it runs whenever a message is enqueued, a write completes,
//!  an ack arrives or the reconnect debounce fires.
//!
//! In synchronous mode the data message currently awaiting its ack is parked in
//!  `wait_ack`, which frees the writer for control messages: two peers sending to each
//!  other concurrently can still exchange the acks both are waiting for.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::error::ChirpError;
use crate::identity::Identity;
use crate::message::Message;
use crate::protocol::Protocol;
use crate::wire::msg_type;
use crate::writer::{JobKind, WriteJob};

/// A user message waiting in the data queue. It becomes a [`WriteJob`] the moment the
///  dispatcher hands it to a writer; only then is the wire type decided and, in
///  synchronous mode, the send timeout armed.
struct QueuedMessage {
    identity: Identity,
    header: Bytes,
    data: Bytes,
    completion: oneshot::Sender<Result<(), ChirpError>>,
}

/// The one data message awaiting its ack (synchronous mode). Completed by the ack,
///  by the send timeout, or by the connection going down, whichever comes first.
struct WaitAck {
    identity: Identity,
    completion: oneshot::Sender<Result<(), ChirpError>>,
    timeout_task: JoinHandle<()>,
}

impl WaitAck {
    fn complete(self, outcome: Result<(), ChirpError>) {
        self.timeout_task.abort();
        let _ = self.completion.send(outcome);
    }
}

struct RemoteInner {
    /// The currently authoritative connection, if any.
    conn: Option<Arc<Connection>>,
    msg_queue: VecDeque<QueuedMessage>,
    /// Control messages (acks, noops) overtake the data queue.
    cntl_queue: VecDeque<WriteJob>,
    wait_ack: Option<WaitAck>,
    /// Reconnect debounce is in effect; no connect attempts until the timer fires.
    conn_blocked: bool,
    /// An outbound connect attempt is running.
    connecting: bool,
    noop_queued: bool,
    /// Monotonic time of the last send or receive on this remote.
    timestamp: Instant,
}

pub(crate) struct Remote {
    key: SocketAddr,
    proto: Weak<Protocol>,
    serial: AtomicU32,
    inner: Mutex<RemoteInner>,
}

impl Remote {
    pub fn new(key: SocketAddr, proto: Weak<Protocol>) -> Remote {
        Remote {
            key,
            proto,
            serial: AtomicU32::new(0),
            inner: Mutex::new(RemoteInner {
                conn: None,
                msg_queue: VecDeque::new(),
                cntl_queue: VecDeque::new(),
                wait_ack: None,
                conn_blocked: false,
                connecting: false,
                noop_queued: false,
                timestamp: Instant::now(),
            }),
        }
    }

    pub fn key(&self) -> SocketAddr {
        self.key
    }

    fn lock(&self) -> MutexGuard<'_, RemoteInner> {
        self.inner.lock().expect("remote lock poisoned")
    }

    /// The next outbound serial, assigned at transmit time. Wraps; ordering within a
    ///  remote is `(a - b) mod 2^32`.
    pub fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn timestamp(&self) -> Instant {
        self.lock().timestamp
    }

    pub fn refresh_timestamp(&self) {
        self.lock().timestamp = Instant::now();
    }

    pub fn is_blocked(&self) -> bool {
        self.lock().conn_blocked
    }

    pub fn is_connecting(&self) -> bool {
        self.lock().connecting
    }

    /// Install a freshly handshaken connection as the authoritative one, returning the
    ///  connection it supersedes (if any). The latest completed handshake always wins;
    ///  this is what resolves two peers dialling each other simultaneously.
    pub fn install_conn(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut inner = self.lock();
        inner.timestamp = Instant::now();
        inner.conn.replace(conn)
    }

    pub fn take_conn(&self) -> Option<Arc<Connection>> {
        self.lock().conn.take()
    }

    /// Queue a user message. The completion fires exactly once with the outcome.
    pub fn enqueue_data(
        self: &Arc<Self>,
        msg: Message,
        completion: oneshot::Sender<Result<(), ChirpError>>,
    ) {
        self.lock().msg_queue.push_back(QueuedMessage {
            identity: msg.identity,
            header: msg.header,
            data: msg.data,
            completion,
        });
        self.process_queues();
    }

    /// Queue an acknowledge for a received message. Control messages overtake data.
    pub fn enqueue_ack(self: &Arc<Self>, identity: Identity) {
        self.lock().cntl_queue.push_back(WriteJob {
            kind: JobKind::Ack,
            identity,
            msg_type: msg_type::ACK,
            header: Bytes::new(),
            data: Bytes::new(),
            completion: None,
        });
        if let Some(proto) = self.proto.upgrade() {
            proto.stats().count_ack_enqueued();
        }
        self.process_queues();
    }

    /// Probe the connection before a user send if the remote has been idle for more
    ///  than 3/4 of the reuse time: if the peer is about to collect the idle
    ///  connection, the noop fails first and the user message retries on a fresh one.
    pub fn maybe_enqueue_noop(self: &Arc<Self>, reuse_time: Duration) {
        let mut inner = self.lock();
        if inner.conn.is_none() || inner.noop_queued {
            return;
        }
        if inner.timestamp.elapsed() <= reuse_time.mul_f64(0.75) {
            return;
        }
        trace!("remote {:?} idle, queueing liveness probe", self.key);
        inner.noop_queued = true;
        inner.cntl_queue.push_back(WriteJob {
            kind: JobKind::Noop,
            identity: Identity::ZERO,
            msg_type: msg_type::NOOP,
            header: Bytes::new(),
            data: Bytes::new(),
            completion: None,
        });
        drop(inner);
        if let Some(proto) = self.proto.upgrade() {
            proto.stats().count_noop_enqueued();
        }
    }

    /// The dispatcher. Hands at most one message to the connection's writer, creating
    ///  the connection first if none exists.
    pub fn process_queues(self: &Arc<Self>) {
        let Some(proto) = self.proto.upgrade() else {
            return;
        };
        if proto.is_closing() {
            // nothing will ever drain the queues again, fail what is left
            self.abort_all(ChirpError::Shutdown);
            return;
        }

        let mut inner = self.lock();
        let conn = match &inner.conn {
            None => {
                if inner.conn_blocked || inner.connecting {
                    return;
                }
                if inner.cntl_queue.is_empty() && inner.msg_queue.is_empty() {
                    return;
                }
                inner.connecting = true;
                drop(inner);
                proto.spawn_connect(self.clone());
                return;
            }
            Some(conn) => conn.clone(),
        };

        if conn.is_shutting_down() {
            return;
        }
        if !conn.claim_writer() {
            return;
        }

        let job = if let Some(job) = inner.cntl_queue.pop_front() {
            job
        } else {
            let synchronous = proto.config().synchronous;
            if synchronous && inner.wait_ack.is_some() {
                conn.release_writer();
                return;
            }
            match inner.msg_queue.pop_front() {
                None => {
                    conn.release_writer();
                    return;
                }
                Some(queued) => {
                    let (msg_type, completion) = if synchronous {
                        // the send timeout spans the write and the ack wait
                        let timeout_task = spawn_ack_timeout(
                            &proto,
                            self.clone(),
                            queued.identity,
                            proto.config().timeout,
                        );
                        inner.wait_ack = Some(WaitAck {
                            identity: queued.identity,
                            completion: queued.completion,
                            timeout_task,
                        });
                        (msg_type::REQ_ACK, None)
                    } else {
                        (0, Some(queued.completion))
                    };
                    WriteJob {
                        kind: JobKind::Data,
                        identity: queued.identity,
                        msg_type,
                        header: queued.header,
                        data: queued.data,
                        completion,
                    }
                }
            }
        };
        drop(inner);

        if let Err(send_err) = conn.submit(job) {
            // the connection went down between the claim and the hand-over; put the
            //  message back where it came from and let the shutdown path retry
            self.requeue_front(send_err.into_inner());
            conn.release_writer();
        }
    }

    fn requeue_front(&self, job: WriteJob) {
        let mut inner = self.lock();
        match job.kind {
            JobKind::Data => {
                let completion = match job.completion {
                    Some(completion) => completion,
                    // ack-awaited message, reclaim its completion from wait_ack
                    None => match inner.wait_ack.take() {
                        Some(wait) => {
                            wait.timeout_task.abort();
                            wait.completion
                        }
                        None => return,
                    },
                };
                inner.msg_queue.push_front(QueuedMessage {
                    identity: job.identity,
                    header: job.header,
                    data: job.data,
                    completion,
                });
            }
            JobKind::Ack | JobKind::Noop => {
                if job.kind == JobKind::Noop {
                    inner.noop_queued = true;
                }
                inner.cntl_queue.push_front(job);
            }
        }
    }

    /// An ack arrived on one of this remote's connections. Acks for unknown identities
    ///  are ignored; they may reference a message sent on a prior connection.
    pub fn on_ack(self: &Arc<Self>, identity: Identity) {
        let wait = {
            let mut inner = self.lock();
            match &inner.wait_ack {
                Some(wait) if wait.identity == identity => {
                    inner.timestamp = Instant::now();
                    inner.wait_ack.take()
                }
                _ => {
                    debug!("ignoring ack for unknown identity {:?}", identity);
                    return;
                }
            }
        };
        if let Some(wait) = wait {
            wait.complete(Ok(()));
        }
        self.process_queues();
    }

    /// The send timeout of an ack-awaited message expired: the message fails and the
    ///  connection it was sent on is shut down.
    fn on_ack_timeout(self: &Arc<Self>, identity: Identity) {
        let (wait, conn) = {
            let mut inner = self.lock();
            match &inner.wait_ack {
                Some(wait) if wait.identity == identity => {
                    (inner.wait_ack.take(), inner.conn.clone())
                }
                _ => return,
            }
        };
        debug!("ack for {:?} timed out", identity);
        if let Some(wait) = wait {
            wait.complete(Err(ChirpError::Timeout));
        }
        if let Some(conn) = conn {
            conn.shutdown(ChirpError::Timeout);
        }
    }

    /// Called by the connection's write task once a job's write outcome is known. For
    ///  an ack-awaited message a successful write keeps the message parked; everything
    ///  else completes here.
    pub fn on_send_complete(
        self: &Arc<Self>,
        kind: JobKind,
        awaits_ack: bool,
        completion: Option<oneshot::Sender<Result<(), ChirpError>>>,
        outcome: Result<(), ChirpError>,
    ) {
        let failed_wait = {
            let mut inner = self.lock();
            if kind == JobKind::Noop {
                inner.noop_queued = false;
            }
            if outcome.is_ok() {
                inner.timestamp = Instant::now();
            }
            if awaits_ack && outcome.is_err() {
                inner.wait_ack.take()
            } else {
                None
            }
        };
        if let Some(wait) = failed_wait {
            wait.complete(outcome.clone());
        }
        if let Some(completion) = completion {
            let _ = completion.send(outcome);
        }
        self.process_queues();
    }

    /// A connection serving this remote shut down. Clears the authoritative pointer if
    ///  it still points there, fails the parked wait-ack message and the queue head if
    ///  nothing was in flight (the write task fails the in-flight message itself), and
    ///  arms the reconnect debounce.
    pub fn on_conn_shutdown(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        reason: ChirpError,
        proto: &Arc<Protocol>,
    ) {
        let (failed_wait, failed_head) = {
            let mut inner = self.lock();
            let was_current = matches!(&inner.conn, Some(c) if Arc::ptr_eq(c, conn));
            if !was_current {
                return;
            }
            inner.conn = None;
            // queued control messages reference the dead connection's messages
            inner.cntl_queue.clear();
            inner.noop_queued = false;
            inner.conn_blocked = true;

            let failed_wait = inner.wait_ack.take();
            let failed_head = if conn.writer_busy() {
                None
            } else {
                inner.msg_queue.pop_front()
            };
            (failed_wait, failed_head)
        };
        if let Some(wait) = failed_wait {
            wait.complete(Err(reason.clone()));
        }
        if let Some(queued) = failed_head {
            let _ = queued.completion.send(Err(reason));
        }
        proto.debounce_remote(self.clone());
    }

    /// An outbound connect attempt failed before a connection existed.
    pub fn on_connect_failed(self: &Arc<Self>, reason: ChirpError, proto: &Arc<Protocol>) {
        debug!("connect to {:?} failed: {}", self.key, reason);
        let failed_head = {
            let mut inner = self.lock();
            inner.connecting = false;
            inner.conn_blocked = true;
            inner.cntl_queue.clear();
            inner.noop_queued = false;
            inner.msg_queue.pop_front()
        };
        if let Some(queued) = failed_head {
            let _ = queued.completion.send(Err(reason));
        }
        proto.debounce_remote(self.clone());
    }

    /// An outbound connect attempt completed; the connection registered itself already.
    pub fn on_connect_done(self: &Arc<Self>) {
        self.lock().connecting = false;
        self.process_queues();
    }

    /// The reconnect debounce fired.
    pub fn unblock_and_kick(self: &Arc<Self>) {
        self.lock().conn_blocked = false;
        self.process_queues();
    }

    /// Fail every queued and parked message, e.g. on garbage collection or instance
    ///  close.
    pub fn abort_all(&self, reason: ChirpError) {
        let (failed_wait, drained) = {
            let mut inner = self.lock();
            inner.cntl_queue.clear();
            inner.noop_queued = false;
            let wait = inner.wait_ack.take();
            (wait, std::mem::take(&mut inner.msg_queue))
        };
        if let Some(wait) = failed_wait {
            wait.complete(Err(reason.clone()));
        }
        for queued in drained {
            let _ = queued.completion.send(Err(reason.clone()));
        }
    }

    /// Queue depth across both queues, for diagnostics.
    #[allow(dead_code)]
    pub fn queued_messages(&self) -> usize {
        let inner = self.lock();
        inner.msg_queue.len() + inner.cntl_queue.len()
    }
}

fn spawn_ack_timeout(
    proto: &Arc<Protocol>,
    remote: Arc<Remote>,
    identity: Identity,
    after: Duration,
) -> JoinHandle<()> {
    proto.runtime().spawn(async move {
        tokio::time::sleep(after).await;
        remote.on_ack_timeout(identity);
    })
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Remote({:?})", self.key)
    }
}
