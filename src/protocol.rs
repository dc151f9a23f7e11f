//! The per-instance engine: listening sockets, the remote set, connection registries
//!  and the two housekeeping loops (garbage collection and reconnect debounce).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use rustc_hash::FxHashMap;
use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument, Level};
use uuid::Uuid;

use crate::chirp::Chirp;
use crate::config::Config;
use crate::connection::{establish, Connection, Direction};
use crate::error::ChirpError;
use crate::handler::MessageHandler;
use crate::identity::Identity;
use crate::message::ReceivedMessage;
use crate::remote::Remote;
use crate::task_gate::TaskGate;
use crate::tls::TlsEnv;

/// Internal counters, mostly interesting to tests and diagnostics.
#[derive(Default)]
pub(crate) struct Stats {
    noops_enqueued: AtomicU64,
    acks_enqueued: AtomicU64,
    connections_collected: AtomicU64,
    remotes_collected: AtomicU64,
}

impl Stats {
    pub fn count_noop_enqueued(&self) {
        self.noops_enqueued.fetch_add(1, Ordering::Relaxed);
    }
    pub fn count_ack_enqueued(&self) {
        self.acks_enqueued.fetch_add(1, Ordering::Relaxed);
    }
    pub fn noops_enqueued(&self) -> u64 {
        self.noops_enqueued.load(Ordering::Relaxed)
    }
    #[allow(dead_code)]
    pub fn acks_enqueued(&self) -> u64 {
        self.acks_enqueued.load(Ordering::Relaxed)
    }
    pub fn remotes_collected(&self) -> u64 {
        self.remotes_collected.load(Ordering::Relaxed)
    }
    #[allow(dead_code)]
    pub fn connections_collected(&self) -> u64 {
        self.connections_collected.load(Ordering::Relaxed)
    }
}

pub(crate) struct Protocol {
    config: Config,
    identity: Identity,
    tls: Option<TlsEnv>,
    handler: Arc<dyn MessageHandler>,
    runtime: tokio::runtime::Handle,
    remotes: Mutex<FxHashMap<SocketAddr, Arc<Remote>>>,
    /// Connections superseded by a newer handshake, drained until GC closes them.
    old_connections: Mutex<FxHashMap<u64, Arc<Connection>>>,
    /// Establish tasks whose handshake has not completed yet.
    handshake_tasks: Mutex<FxHashMap<u64, AbortHandle>>,
    reconnect_remotes: Mutex<Vec<Arc<Remote>>>,
    reconnect_notify: Notify,
    service_tasks: Mutex<Vec<JoinHandle<()>>>,
    gate: Arc<TaskGate>,
    closing: AtomicBool,
    ids: AtomicU64,
    stats: Stats,
}

impl Protocol {
    pub async fn start(
        config: Config,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<Protocol>, ChirpError> {
        config.validate()?;

        let identity = if config.identity.is_zero() {
            Identity::random()
        } else {
            config.identity
        };
        let tls = if config.disable_encryption {
            None
        } else {
            Some(TlsEnv::new(&config)?)
        };

        let listener_v4 = bind_listener(
            SocketAddr::new(config.bind_v4.into(), config.port),
            config.backlog,
        )?;
        let listener_v6 = bind_listener(
            SocketAddr::new(config.bind_v6.into(), config.port),
            config.backlog,
        )?;
        info!(
            "listening on port {} (v4 and v6), identity {:?}",
            config.port, identity
        );

        let proto = Arc::new(Protocol {
            config,
            identity,
            tls,
            handler,
            runtime: tokio::runtime::Handle::current(),
            remotes: Mutex::new(FxHashMap::default()),
            old_connections: Mutex::new(FxHashMap::default()),
            handshake_tasks: Mutex::new(FxHashMap::default()),
            reconnect_remotes: Mutex::new(Vec::new()),
            reconnect_notify: Notify::new(),
            service_tasks: Mutex::new(Vec::new()),
            gate: TaskGate::new(),
            closing: AtomicBool::new(false),
            ids: AtomicU64::new(0),
            stats: Stats::default(),
        });

        let mut services = vec![
            proto.spawn_task(accept_loop(proto.clone(), listener_v4)),
            proto.spawn_task(accept_loop(proto.clone(), listener_v6)),
            proto.spawn_task(gc_loop(proto.clone())),
            proto.spawn_task(reconnect_loop(proto.clone())),
        ];
        proto
            .service_tasks
            .lock()
            .expect("service task lock poisoned")
            .append(&mut services);

        Ok(proto)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn advertised_port(&self) -> u16 {
        self.config.advertised_port()
    }

    pub fn tls(&self) -> Option<&TlsEnv> {
        self.tls.as_ref()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn gate(&self) -> &Arc<TaskGate> {
        &self.gate
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn next_conn_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }

    /// Spawn a task that the close gate accounts for.
    pub fn spawn_task(
        self: &Arc<Self>,
        fut: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> JoinHandle<()> {
        let guard = self.gate.enter();
        self.runtime.spawn(async move {
            let _guard = guard;
            fut.await;
        })
    }

    /// Track a task that close must abort.
    pub fn add_service_task(&self, task: JoinHandle<()>) {
        self.service_tasks
            .lock()
            .expect("service task lock poisoned")
            .push(task);
    }

    /// Hand a received message to the application.
    pub async fn deliver(self: &Arc<Self>, msg: ReceivedMessage) {
        let chirp = Chirp::from_proto(self.clone());
        self.handler.on_message(&chirp, msg).await;
    }

    pub fn get_or_create_remote(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<Arc<Remote>, ChirpError> {
        let mut remotes = self.remotes.lock().expect("remotes lock poisoned");
        if self.is_closing() {
            return Err(ChirpError::Shutdown);
        }
        Ok(remotes
            .entry(addr)
            .or_insert_with(|| {
                debug!("creating remote for {:?}", addr);
                Arc::new(Remote::new(addr, Arc::downgrade(self)))
            })
            .clone())
    }

    /// Associate a freshly handshaken connection with its remote, demoting a prior
    ///  authoritative connection to the old set (graceful drain until GC).
    pub fn register_connection(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
    ) -> Result<Arc<Remote>, ChirpError> {
        let remote = self.get_or_create_remote(conn.peer_addr)?;
        if let Some(prior) = remote.install_conn(conn.clone()) {
            if !Arc::ptr_eq(&prior, conn) {
                debug!(
                    "connection {} supersedes connection {} for {:?}",
                    conn.id, prior.id, conn.peer_addr
                );
                self.old_connections
                    .lock()
                    .expect("old connection lock poisoned")
                    .insert(prior.id, prior);
            }
        }
        Ok(remote)
    }

    pub fn forget_old_connection(&self, id: u64) {
        self.old_connections
            .lock()
            .expect("old connection lock poisoned")
            .remove(&id);
    }

    /// Start an outbound connect attempt for a remote that has queued messages.
    pub fn spawn_connect(self: &Arc<Self>, remote: Arc<Remote>) {
        let proto = self.clone();
        self.spawn_task(async move {
            let addr = remote.key();
            debug!("connecting to {:?}", addr);
            let connect_timeout = proto.config.connect_timeout();
            let res = timeout(connect_timeout, async {
                let stream = tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(ChirpError::from)?;
                establish(proto.clone(), stream, Direction::Outgoing)
                    .await
                    .map_err(|e| classify(&e))
            })
            .await
            .unwrap_or(Err(ChirpError::Timeout));

            match res {
                Ok(()) => remote.on_connect_done(),
                Err(reason) => remote.on_connect_failed(reason, &proto),
            }
        });
    }

    /// Arm the reconnect debounce for a remote whose connection went away.
    pub fn debounce_remote(&self, remote: Arc<Remote>) {
        if self.is_closing() {
            return;
        }
        self.reconnect_remotes
            .lock()
            .expect("reconnect lock poisoned")
            .push(remote);
        self.reconnect_notify.notify_one();
    }

    fn collect_garbage(self: &Arc<Self>) {
        let reuse = self.config.effective_reuse_time();

        let expired: Vec<Arc<Connection>> = {
            let old = self
                .old_connections
                .lock()
                .expect("old connection lock poisoned");
            old.values()
                .filter(|c| c.idle_for() > reuse)
                .cloned()
                .collect()
        };
        for conn in expired {
            debug!("collecting old connection {}", conn.id);
            self.stats
                .connections_collected
                .fetch_add(1, Ordering::Relaxed);
            conn.shutdown(ChirpError::Shutdown);
        }

        let idle: Vec<Arc<Remote>> = {
            let remotes = self.remotes.lock().expect("remotes lock poisoned");
            remotes
                .values()
                .filter(|r| {
                    r.timestamp().elapsed() > reuse && !r.is_blocked() && !r.is_connecting()
                })
                .cloned()
                .collect()
        };
        for remote in idle {
            debug!("collecting idle remote {:?}", remote.key());
            self.remotes
                .lock()
                .expect("remotes lock poisoned")
                .remove(&remote.key());
            self.stats.remotes_collected.fetch_add(1, Ordering::Relaxed);
            remote.abort_all(ChirpError::Shutdown);
            if let Some(conn) = remote.take_conn() {
                conn.shutdown(ChirpError::Shutdown);
            }
        }
    }

    /// Stop everything. Safe to call more than once; the close gate reaches zero
    ///  exactly once.
    pub fn close(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing chirp instance {:?}", self.identity);

        for task in self
            .service_tasks
            .lock()
            .expect("service task lock poisoned")
            .drain(..)
        {
            task.abort();
        }
        for (_, task) in self
            .handshake_tasks
            .lock()
            .expect("handshake task lock poisoned")
            .drain()
        {
            task.abort();
        }

        let old: Vec<Arc<Connection>> = self
            .old_connections
            .lock()
            .expect("old connection lock poisoned")
            .drain()
            .map(|(_, c)| c)
            .collect();
        for conn in old {
            conn.shutdown(ChirpError::Shutdown);
        }

        let remotes: Vec<Arc<Remote>> = self
            .remotes
            .lock()
            .expect("remotes lock poisoned")
            .drain()
            .map(|(_, r)| r)
            .collect();
        for remote in remotes {
            remote.abort_all(ChirpError::Shutdown);
            if let Some(conn) = remote.take_conn() {
                conn.shutdown(ChirpError::Shutdown);
            }
        }
    }

    #[cfg(test)]
    pub fn remote_count(&self) -> usize {
        self.remotes.lock().expect("remotes lock poisoned").len()
    }

    #[cfg(test)]
    pub fn old_connection_count(&self) -> usize {
        self.old_connections
            .lock()
            .expect("old connection lock poisoned")
            .len()
    }
}

/// Map an establish failure to the error kind reported to the send that triggered it.
fn classify(e: &anyhow::Error) -> ChirpError {
    if let Some(chirp) = e.downcast_ref::<ChirpError>() {
        return chirp.clone();
    }
    if let Some(io) = e.downcast_ref::<std::io::Error>() {
        return match io.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof => ChirpError::CannotConnect,
            std::io::ErrorKind::TimedOut => ChirpError::Timeout,
            _ => ChirpError::IoError(io.to_string()),
        };
    }
    ChirpError::protocol(format!("{:#}", e))
}

fn bind_listener(addr: SocketAddr, backlog: u8) -> Result<TcpListener, ChirpError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))?;
    if addr.is_ipv6() {
        // both listeners share the port; the v6 socket must not capture v4 traffic
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    Ok(TcpListener::from_std(socket.into())?)
}

async fn accept_loop(proto: Arc<Protocol>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if proto.is_closing() {
            return;
        }
        debug!("accepted connection from {:?}", peer);
        spawn_handshake(&proto, stream);
    }
}

/// Run the handshake of an accepted connection under the connect timeout, tracked so a
///  stalled handshake gets shut down and close can abort it.
fn spawn_handshake(proto: &Arc<Protocol>, stream: tokio::net::TcpStream) {
    let id = proto.next_conn_id();
    let proto_for_task = proto.clone();
    let handle = proto.spawn_task(async move {
        let proto = proto_for_task;
        let correlation_id = Uuid::new_v4();
        let span = tracing::span!(Level::DEBUG, "accepted_connection", ?correlation_id);
        let res = timeout(
            proto.config.connect_timeout(),
            establish(proto.clone(), stream, Direction::Incoming),
        )
        .instrument(span)
        .await;
        match res {
            Err(_) => debug!("handshake of accepted connection stalled, dropping it"),
            Ok(Err(e)) => debug!("handshake of accepted connection failed: {:#}", e),
            Ok(Ok(())) => {}
        }
        proto
            .handshake_tasks
            .lock()
            .expect("handshake task lock poisoned")
            .remove(&id);
    });
    proto
        .handshake_tasks
        .lock()
        .expect("handshake task lock poisoned")
        .insert(id, handle.abort_handle());
    // the task removes its own entry; if it won that race, clean up after it
    if handle.is_finished() {
        proto
            .handshake_tasks
            .lock()
            .expect("handshake task lock poisoned")
            .remove(&id);
    }
}

/// Garbage collection: fires every `reuse_time * 0.5 .. 1.0` (randomised so meshes of
///  nodes with identical configs do not collect in lockstep).
async fn gc_loop(proto: Arc<Protocol>) {
    loop {
        let reuse = proto.config.effective_reuse_time();
        let half_ms = (reuse.as_millis() / 2) as u64;
        let jitter = rand::thread_rng().gen_range(0..=half_ms);
        tokio::time::sleep(Duration::from_millis(half_ms + jitter)).await;
        proto.collect_garbage();
    }
}

/// Reconnect debounce: remotes whose connection failed stay blocked for a randomised
///  50-550ms, breaking the tight loop two nodes dialling each other would otherwise
///  enter.
async fn reconnect_loop(proto: Arc<Protocol>) {
    loop {
        proto.reconnect_notify.notified().await;
        let delay = Duration::from_millis(rand::thread_rng().gen_range(50..=550));
        tokio::time::sleep(delay).await;

        let drained: Vec<Arc<Remote>> = std::mem::take(
            &mut *proto
                .reconnect_remotes
                .lock()
                .expect("reconnect lock poisoned"),
        );
        debug!("reconnect debounce over, unblocking {} remotes", drained.len());
        for remote in drained {
            remote.unblock_and_kick();
        }
    }
}
