//! Connection state machine, outbound publish buffer, and the client handle.
//!
//! A single driver task per connection owns the transport session, the server
//! pool, the protocol parser, and the subscription registry; it is the one
//! reconnect/read loop. Application handles communicate with it through a
//! command channel and a shared outbound buffer, so state transitions stay
//! atomic within one mutual-exclusion domain. Lifecycle notifications are
//! posted as events to a dedicated dispatch task which invokes the user
//! callbacks, never from the transport read path.

use crate::error::{ClientError, Result};
use crate::message::{HeaderMap, Message};
use crate::options::ConnectOptions;
use crate::protocol::{
    encode_connect, encode_ping, encode_pong, encode_pub, encode_sub, encode_unsub, ConnectInfo,
    Parser, ServerInfo, ServerOp,
};
use crate::server_pool::{ServerPool, ServerUrl};
use crate::subscription::{
    spawn_dedicated_worker, validate_pattern, validate_queue_group, validate_subject,
    DeliveryPool, DispatchOutcome, DispatchTarget, HandlerFuture, HandlerSubscription,
    MessageHandler, SubscriptionEntry, SubscriptionShared, Subscriber,
};
use crate::transport::Session;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Connection lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// No connection attempt has been made yet
    Disconnected = 0,
    /// Initial connection is being established
    Connecting = 1,
    /// Connected and fully operational
    Connected = 2,
    /// Transport failed; trying alternate servers
    Reconnecting = 3,
    /// Draining: unsubscribing while delivering already-queued messages
    DrainingSubs = 4,
    /// Draining: flushing remaining outbound data before closing
    DrainingPubs = 5,
    /// Terminal: all operations fail fast
    Closed = 6,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            4 => Self::DrainingSubs,
            5 => Self::DrainingPubs,
            6 => Self::Closed,
            _ => Self::Disconnected,
        }
    }
}

/// Snapshot of connection statistics counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Messages received
    pub in_msgs: u64,
    /// Messages published
    pub out_msgs: u64,
    /// Payload bytes received
    pub in_bytes: u64,
    /// Payload bytes published
    pub out_bytes: u64,
    /// Successful reconnects
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    in_msgs: AtomicU64,
    out_msgs: AtomicU64,
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
    reconnects: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> ClientStats {
        ClientStats {
            in_msgs: self.in_msgs.load(Ordering::Acquire),
            out_msgs: self.out_msgs.load(Ordering::Acquire),
            in_bytes: self.in_bytes.load(Ordering::Acquire),
            out_bytes: self.out_bytes.load(Ordering::Acquire),
            reconnects: self.reconnects.load(Ordering::Acquire),
        }
    }
}

/// Status plus the outbound publish buffer, guarded together so state
/// transitions and buffer appends are atomic with respect to each other
#[derive(Debug)]
struct CoreState {
    status: Status,
    buf: BytesMut,
    /// Bound applied to buffer appends while not connected
    pending_limit: Option<usize>,
}

/// State shared between application handles and the driver task
pub(crate) struct SharedState {
    core: Mutex<CoreState>,
    notify: Notify,
    server_info: RwLock<ServerInfo>,
    stats: StatsInner,
    status_flag: AtomicU8,
    next_sid: AtomicU64,
    options: Arc<ConnectOptions>,
}

impl SharedState {
    fn new(options: Arc<ConnectOptions>) -> Self {
        Self {
            core: Mutex::new(CoreState {
                status: Status::Disconnected,
                buf: BytesMut::with_capacity(32 * 1024),
                pending_limit: None,
            }),
            notify: Notify::new(),
            server_info: RwLock::new(ServerInfo::default()),
            stats: StatsInner::default(),
            status_flag: AtomicU8::new(Status::Disconnected as u8),
            next_sid: AtomicU64::new(1),
            options,
        }
    }
}

/// How a new subscription wants its messages delivered
pub(crate) enum SubscribeHow {
    /// Application polls a queue through a [`Subscriber`]
    Queue(mpsc::UnboundedSender<Message>),
    /// Library-driven delivery through a message handler
    Handler {
        handler: MessageHandler,
        idle_timeout: Option<Duration>,
    },
}

/// Requests from application handles to the connection driver
pub(crate) enum Command {
    Subscribe {
        shared: Arc<SubscriptionShared>,
        how: SubscribeHow,
        reply: oneshot::Sender<Result<Option<JoinHandle<()>>>>,
    },
    Unsubscribe {
        sid: u64,
        max: Option<u64>,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
    Drain {
        deadline: Duration,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Lifecycle notifications posted to the event dispatch task
enum ConnectionEvent {
    Connected,
    Disconnected,
    Reconnected,
    Closed,
    DiscoveredServers(Vec<String>),
    AsyncError(ClientError),
}

fn spawn_event_dispatcher(
    options: Arc<ConnectOptions>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected => {
                    if let Some(cb) = &options.connected_callback {
                        cb();
                    }
                }
                ConnectionEvent::Disconnected => {
                    if let Some(cb) = &options.disconnected_callback {
                        cb();
                    }
                }
                ConnectionEvent::Reconnected => {
                    if let Some(cb) = &options.reconnected_callback {
                        cb();
                    }
                }
                ConnectionEvent::Closed => {
                    if let Some(cb) = &options.closed_callback {
                        cb();
                    }
                }
                ConnectionEvent::DiscoveredServers(urls) => {
                    if let Some(cb) = &options.discovered_servers_callback {
                        cb(urls);
                    }
                }
                ConnectionEvent::AsyncError(err) => {
                    if let Some(cb) = &options.error_callback {
                        cb(err);
                    } else {
                        warn!(error = %err, "asynchronous connection error");
                    }
                }
            }
        }
    });
}

/// A handle to a broker connection.
///
/// Handles are cheap to clone and share; the connection itself lives until
/// [`Client::close`] is called or every handle and subscription is dropped.
#[derive(Clone)]
pub struct Client {
    shared: Arc<SharedState>,
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Current connection status
    pub fn status(&self) -> Status {
        Status::from_u8(self.shared.status_flag.load(Ordering::Acquire))
    }

    /// Whether the connection is currently established
    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    /// Snapshot of the connection statistics counters
    pub fn stats(&self) -> ClientStats {
        self.shared.stats.snapshot()
    }

    /// Most recently received server information
    pub async fn server_info(&self) -> ServerInfo {
        self.shared.server_info.read().await.clone()
    }

    /// Publish a message to a subject
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_frame(subject, None, None, &payload.into()).await
    }

    /// Publish a message carrying a reply subject
    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.publish_frame(subject, Some(reply), None, &payload.into())
            .await
    }

    /// Publish a message with headers
    pub async fn publish_with_headers(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.publish_frame(subject, None, Some(headers), &payload.into())
            .await
    }

    async fn publish_frame(
        &self,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&HeaderMap>,
        payload: &Bytes,
    ) -> Result<()> {
        validate_subject(subject)?;
        if let Some(reply) = reply {
            validate_subject(reply)?;
        }
        let max_payload = self.shared.server_info.read().await.max_payload;
        if max_payload > 0 && payload.len() > max_payload {
            return Err(ClientError::MaxPayload {
                size: payload.len(),
                max: max_payload,
            });
        }

        {
            let mut core = self.shared.core.lock().await;
            match core.status {
                Status::Closed => return Err(ClientError::Closed),
                Status::DrainingSubs | Status::DrainingPubs => return Err(ClientError::Draining),
                _ => {}
            }
            let before = core.buf.len();
            encode_pub(&mut core.buf, subject, reply, headers, payload);
            if let Some(limit) = core.pending_limit {
                if core.buf.len() > limit {
                    core.buf.truncate(before);
                    return Err(ClientError::buffer_capacity(format!(
                        "reconnect buffer limit of {limit} bytes reached"
                    )));
                }
            }
        }
        self.shared.stats.out_msgs.fetch_add(1, Ordering::AcqRel);
        self.shared
            .stats
            .out_bytes
            .fetch_add(payload.len() as u64, Ordering::AcqRel);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Subscribe to a subject pattern with the connection's default pending
    /// limits
    pub async fn subscribe(&self, subject: impl Into<String>) -> Result<Subscriber> {
        let options = &self.shared.options;
        self.do_subscribe(
            subject.into(),
            None,
            options.max_pending_msgs,
            options.max_pending_bytes,
        )
        .await
    }

    /// Subscribe as a member of a queue group; the server delivers each
    /// message to exactly one member
    pub async fn queue_subscribe(
        &self,
        subject: impl Into<String>,
        queue_group: impl Into<String>,
    ) -> Result<Subscriber> {
        let options = &self.shared.options;
        self.do_subscribe(
            subject.into(),
            Some(queue_group.into()),
            options.max_pending_msgs,
            options.max_pending_bytes,
        )
        .await
    }

    /// Subscribe with explicit pending limits (0 disables a limit)
    pub async fn subscribe_with_limits(
        &self,
        subject: impl Into<String>,
        max_pending_msgs: usize,
        max_pending_bytes: usize,
    ) -> Result<Subscriber> {
        self.do_subscribe(subject.into(), None, max_pending_msgs, max_pending_bytes)
            .await
    }

    async fn do_subscribe(
        &self,
        subject: String,
        queue_group: Option<String>,
        max_pending_msgs: usize,
        max_pending_bytes: usize,
    ) -> Result<Subscriber> {
        validate_pattern(&subject)?;
        if let Some(group) = &queue_group {
            validate_queue_group(group)?;
        }
        let sid = self.shared.next_sid.fetch_add(1, Ordering::AcqRel);
        let shared = Arc::new(SubscriptionShared::new(
            sid,
            subject,
            queue_group,
            max_pending_msgs,
            max_pending_bytes,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                shared: Arc::clone(&shared),
                how: SubscribeHow::Queue(tx),
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::Closed)?;
        reply_rx.await.map_err(|_| ClientError::Closed)??;
        Ok(Subscriber::new(rx, shared, self.commands.clone()))
    }

    /// Subscribe with an asynchronous message handler.
    ///
    /// By default each handler subscription gets a dedicated delivery worker,
    /// so a slow handler never stalls delivery to other subscriptions; with
    /// [`crate::ConnectOptions::delivery_pool_size`] configured, workers are
    /// shared and assigned by subscription identifier. Either way messages
    /// for one subscription are handled strictly in arrival order.
    pub async fn subscribe_with_handler<F, Fut>(
        &self,
        subject: impl Into<String>,
        mut handler: F,
    ) -> Result<HandlerSubscription>
    where
        F: FnMut(Message) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: MessageHandler = Box::new(move |msg| match msg {
            Some(msg) => Box::pin(handler(msg)) as HandlerFuture,
            None => Box::pin(async {}) as HandlerFuture,
        });
        self.do_subscribe_handler(subject.into(), None, wrapped, None)
            .await
    }

    /// Subscribe with a handler that is also invoked with `None` whenever no
    /// message arrives within `idle_timeout`, then the window re-arms.
    ///
    /// Idle-timeout subscriptions always use a dedicated delivery worker.
    pub async fn subscribe_with_idle_handler<F, Fut>(
        &self,
        subject: impl Into<String>,
        idle_timeout: Duration,
        mut handler: F,
    ) -> Result<HandlerSubscription>
    where
        F: FnMut(Option<Message>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: MessageHandler = Box::new(move |msg| Box::pin(handler(msg)) as HandlerFuture);
        self.do_subscribe_handler(subject.into(), None, wrapped, Some(idle_timeout))
            .await
    }

    async fn do_subscribe_handler(
        &self,
        subject: String,
        queue_group: Option<String>,
        handler: MessageHandler,
        idle_timeout: Option<Duration>,
    ) -> Result<HandlerSubscription> {
        validate_pattern(&subject)?;
        if let Some(group) = &queue_group {
            validate_queue_group(group)?;
        }
        let options = &self.shared.options;
        let sid = self.shared.next_sid.fetch_add(1, Ordering::AcqRel);
        let shared = Arc::new(SubscriptionShared::new(
            sid,
            subject,
            queue_group,
            options.max_pending_msgs,
            options.max_pending_bytes,
        ));
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                shared: Arc::clone(&shared),
                how: SubscribeHow::Handler {
                    handler,
                    idle_timeout,
                },
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::Closed)?;
        let worker = reply_rx.await.map_err(|_| ClientError::Closed)??;
        Ok(HandlerSubscription::new(
            shared,
            self.commands.clone(),
            worker,
        ))
    }

    /// Publish a request and await a single reply on a private inbox.
    ///
    /// Returns [`ClientError::NoResponders`] when the broker signals that
    /// nothing is subscribed to the subject, distinct from
    /// [`ClientError::Timeout`].
    pub async fn request(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let mut sub = self.subscribe(inbox.clone()).await?;
        sub.unsubscribe_after(1).await?;
        self.publish_frame(subject, Some(&inbox), None, &payload.into())
            .await?;
        match sub.next_timeout(timeout).await {
            Ok(msg) if msg.is_no_responders() => Err(ClientError::NoResponders),
            Ok(msg) => Ok(msg),
            Err(ClientError::SubscriptionClosed) => Err(ClientError::Closed),
            Err(e) => Err(e),
        }
    }

    /// Send a PING and block until the corresponding PONG is observed, the
    /// timeout elapses, or the connection closes; the three outcomes are
    /// distinct
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush { reply: tx })
            .await
            .map_err(|_| ClientError::Closed)?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(ClientError::Timeout),
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Closed),
        }
    }

    /// Gracefully drain the connection: stop accepting new publishes,
    /// unsubscribe everything server-side, deliver already-queued messages
    /// until queues empty or `deadline` elapses, then close
    pub async fn drain(&self, deadline: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Drain {
                deadline,
                reply: Some(tx),
            })
            .await
            .map_err(|_| ClientError::Closed)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Closed),
        }
    }

    /// Start a drain without waiting for it to complete
    pub async fn drain_begin(&self, deadline: Duration) -> Result<()> {
        self.commands
            .send(Command::Drain {
                deadline,
                reply: None,
            })
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Close the connection, waking every blocked flush and `next()` caller.
    ///
    /// Idempotent; subscriptions become invalid but their handles remain
    /// usable for draining already-queued messages.
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Close { reply: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}

/// Establish a connection per the configured options
pub(crate) async fn connect(options: Arc<ConnectOptions>, servers: Vec<String>) -> Result<Client> {
    let pool = ServerPool::new(&servers, !options.no_randomize)?;
    let shared = Arc::new(SharedState::new(Arc::clone(&options)));
    let (command_tx, command_rx) = mpsc::channel(128);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    spawn_event_dispatcher(Arc::clone(&options), event_rx);

    let delivery_pool = if options.delivery_pool_size > 0 {
        Some(DeliveryPool::new(options.delivery_pool_size))
    } else {
        None
    };

    let mut driver = ConnectionDriver {
        shared: Arc::clone(&shared),
        options: Arc::clone(&options),
        commands: command_rx,
        events: event_tx,
        pool,
        current: None,
        session: None,
        parser: Parser::new(),
        read_buf: BytesMut::with_capacity(64 * 1024),
        subs: HashMap::new(),
        sub_order: Vec::new(),
        delivery_pool,
        pings_out: 0,
        pings_sent: 0,
        pongs_received: 0,
        pong_waiters: VecDeque::new(),
        drain: None,
        established_once: false,
        closed: false,
    };

    let client = Client {
        shared,
        commands: command_tx,
    };

    if options.retry_on_failed_connect {
        driver.set_status(Status::Connecting).await;
        tokio::spawn(driver.run());
        return Ok(client);
    }

    driver.set_status(Status::Connecting).await;
    if let Err(e) = driver.initial_connect().await {
        driver.set_status(Status::Disconnected).await;
        return Err(e);
    }
    tokio::spawn(driver.run());
    Ok(client)
}

enum Flow {
    Continue,
    Exit,
}

struct DrainState {
    deadline: Instant,
    reply: Option<oneshot::Sender<Result<()>>>,
}

/// The single background task driving one connection
struct ConnectionDriver {
    shared: Arc<SharedState>,
    options: Arc<ConnectOptions>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    pool: ServerPool,
    current: Option<ServerUrl>,
    session: Option<Session>,
    parser: Parser,
    read_buf: BytesMut,
    subs: HashMap<u64, SubscriptionEntry>,
    /// Registration order, preserved for re-subscription after reconnects
    sub_order: Vec<u64>,
    delivery_pool: Option<DeliveryPool>,
    /// Keepalive pings awaiting a PONG on the current session
    pings_out: u32,
    pings_sent: u64,
    pongs_received: u64,
    /// Flush waiters keyed by the ping sequence whose PONG completes them;
    /// sequence 0 means "pin to the first ping after the next resync"
    pong_waiters: VecDeque<(u64, oneshot::Sender<Result<()>>)>,
    drain: Option<DrainState>,
    established_once: bool,
    closed: bool,
}

impl ConnectionDriver {
    async fn run(mut self) {
        loop {
            if self.closed {
                break;
            }
            let flow = if self.session.is_some() {
                self.run_connected().await
            } else {
                self.run_reconnect().await
            };
            if matches!(flow, Flow::Exit) {
                break;
            }
        }
        debug!("connection driver terminated");
    }

    async fn set_status(&self, status: Status) {
        let mut core = self.shared.core.lock().await;
        core.status = status;
        core.pending_limit = match status {
            Status::Connecting | Status::Reconnecting => Some(self.options.reconnect_buf_size),
            _ => None,
        };
        self.shared
            .status_flag
            .store(status as u8, Ordering::Release);
    }

    fn send_event(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    async fn take_outbound(&self) -> Option<BytesMut> {
        let mut core = self.shared.core.lock().await;
        if core.buf.is_empty() {
            None
        } else {
            Some(core.buf.split())
        }
    }

    /// Append control bytes to the outbound buffer, bypassing the pending
    /// limit (protocol traffic must never be rejected)
    async fn queue_control(&self, frame: impl FnOnce(&mut BytesMut)) {
        let mut core = self.shared.core.lock().await;
        frame(&mut core.buf);
        drop(core);
        self.shared.notify.notify_one();
    }

    // ---- connected operation ----------------------------------------------

    async fn run_connected(&mut self) -> Flow {
        let Some(mut session) = self.session.take() else {
            return Flow::Continue;
        };
        let mut ping_timer = tokio::time::interval_at(
            Instant::now() + self.options.ping_interval,
            self.options.ping_interval,
        );
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut drain_timer = tokio::time::interval(Duration::from_millis(25));
        drain_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(bytes) = self.take_outbound().await {
                if let Err(e) = session.write_all(&bytes).await {
                    warn!(error = %e, "transport write failed");
                    return self.handle_transport_failure(session).await;
                }
            }
            if self.drain.is_some() {
                if let Some(flow) = self.check_drain_progress(&mut session).await {
                    return flow;
                }
            }

            tokio::select! {
                read = session.read_into(&mut self.read_buf) => match read {
                    Ok(0) => {
                        info!("server closed the connection");
                        return self.handle_transport_failure(session).await;
                    }
                    Ok(_) => {
                        if let Err(e) = self.process_read_buffer().await {
                            self.send_event(ConnectionEvent::AsyncError(e));
                            return self.handle_transport_failure(session).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "transport read failed");
                        return self.handle_transport_failure(session).await;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Close { reply }) => {
                        self.flush_and_shutdown(&mut session).await;
                        self.do_close().await;
                        let _ = reply.send(());
                        return Flow::Exit;
                    }
                    Some(command) => {
                        if let Flow::Exit = self.handle_command(command).await {
                            return Flow::Exit;
                        }
                    }
                    None => {
                        // every handle and subscription is gone
                        self.flush_and_shutdown(&mut session).await;
                        self.do_close().await;
                        return Flow::Exit;
                    }
                },
                _ = self.shared.notify.notified() => {}
                _ = ping_timer.tick() => {
                    if !self.send_keepalive_ping().await {
                        self.send_event(ConnectionEvent::AsyncError(
                            ClientError::StaleConnection(self.pings_out),
                        ));
                        return self.handle_transport_failure(session).await;
                    }
                }
                _ = drain_timer.tick(), if self.drain.is_some() => {}
            }
        }
    }

    /// Keepalive tick: send a PING unless too many are already outstanding
    async fn send_keepalive_ping(&mut self) -> bool {
        self.pings_out += 1;
        if self.pings_out > self.options.max_pings_out {
            warn!(
                outstanding = self.pings_out,
                "stale connection detected, forcing reconnect"
            );
            return false;
        }
        self.pings_sent += 1;
        self.queue_control(encode_ping).await;
        true
    }

    async fn process_read_buffer(&mut self) -> Result<()> {
        while let Some(op) = self.parser.next_op(&mut self.read_buf)? {
            match op {
                ServerOp::Ping => self.queue_control(encode_pong).await,
                ServerOp::Pong => {
                    self.pings_out = 0;
                    self.pongs_received += 1;
                    self.complete_pong_waiters();
                }
                ServerOp::Ok => {}
                ServerOp::Err(text) => {
                    let err = classify_server_error(&text);
                    warn!(error = %err, "server reported an error");
                    return Err(err);
                }
                ServerOp::Info(info) => self.apply_server_info(*info).await,
                ServerOp::Msg {
                    subject,
                    sid,
                    reply,
                    headers,
                    payload,
                } => self.dispatch_msg(subject, sid, reply, headers, payload).await,
            }
        }
        Ok(())
    }

    async fn dispatch_msg(
        &mut self,
        subject: String,
        sid: u64,
        reply: Option<String>,
        raw_headers: Option<Bytes>,
        payload: Bytes,
    ) {
        self.shared.stats.in_msgs.fetch_add(1, Ordering::AcqRel);
        self.shared
            .stats
            .in_bytes
            .fetch_add(payload.len() as u64, Ordering::AcqRel);

        let (headers, status, description) = match raw_headers {
            Some(raw) => match HeaderMap::parse(&raw) {
                Ok((headers, status, description)) => (Some(headers), status, description),
                Err(e) => {
                    self.send_event(ConnectionEvent::AsyncError(e));
                    return;
                }
            },
            None => (None, None, None),
        };
        let msg = Message {
            subject,
            reply,
            headers,
            payload,
            status,
            description,
        };

        // the server is authoritative for subject matching; unknown sids are
        // unsubscribe races and dropped silently
        let Some(entry) = self.subs.get_mut(&sid) else {
            trace!(sid, "message for unknown subscription dropped");
            return;
        };
        match entry.dispatch(msg) {
            DispatchOutcome::Delivered => {}
            DispatchOutcome::Dropped { first_of_episode } => {
                if first_of_episode {
                    let dropped = entry.shared.dropped.load(Ordering::Acquire);
                    warn!(sid, dropped, "slow consumer, message dropped");
                    self.send_event(ConnectionEvent::AsyncError(ClientError::SlowConsumer {
                        sid,
                        dropped,
                    }));
                }
            }
            DispatchOutcome::Completed => self.remove_subscription(sid).await,
        }
    }

    async fn remove_subscription(&mut self, sid: u64) {
        if self.subs.remove(&sid).is_some() {
            self.sub_order.retain(|s| *s != sid);
            self.queue_control(|buf| encode_unsub(buf, sid, None)).await;
        }
    }

    async fn apply_server_info(&mut self, info: ServerInfo) {
        if !info.connect_urls.is_empty() {
            let added = self
                .pool
                .merge_discovered(self.current.as_ref(), &info.connect_urls);
            if !added.is_empty() {
                info!(servers = ?added, "discovered new servers via gossip");
                self.send_event(ConnectionEvent::DiscoveredServers(added));
            }
        }
        *self.shared.server_info.write().await = info;
    }

    fn complete_pong_waiters(&mut self) {
        while let Some((seq, _)) = self.pong_waiters.front() {
            if *seq == 0 || *seq > self.pongs_received {
                break;
            }
            if let Some((_, waiter)) = self.pong_waiters.pop_front() {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    // ---- command handling -------------------------------------------------

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Subscribe { shared, how, reply } => {
                if self.drain.is_some() {
                    let _ = reply.send(Err(ClientError::Draining));
                    return Flow::Continue;
                }
                let sid = shared.sid;
                let subject = shared.subject.clone();
                let queue_group = shared.queue_group.clone();
                let worker = self.register_subscription(shared, how);
                self.queue_control(|buf| {
                    encode_sub(buf, &subject, queue_group.as_deref(), sid)
                })
                .await;
                debug!(sid, subject = %subject, "subscribed");
                let _ = reply.send(Ok(worker));
            }
            Command::Unsubscribe { sid, max, reply } => {
                let result = self.handle_unsubscribe(sid, max).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::Flush { reply } => {
                // flush pings never count toward staleness; only timer-driven
                // pings do
                self.pings_sent += 1;
                self.pong_waiters.push_back((self.pings_sent, reply));
                self.queue_control(encode_ping).await;
            }
            Command::Drain { deadline, reply } => {
                if self.drain.is_some() {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(ClientError::Draining));
                    }
                    return Flow::Continue;
                }
                info!("draining connection");
                self.set_status(Status::DrainingSubs).await;
                let sids: Vec<u64> = self.sub_order.clone();
                self.queue_control(move |buf| {
                    for sid in sids {
                        encode_unsub(buf, sid, None);
                    }
                })
                .await;
                self.drain = Some(DrainState {
                    deadline: Instant::now() + deadline,
                    reply,
                });
            }
            Command::Close { reply } => {
                self.do_close().await;
                let _ = reply.send(());
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    fn register_subscription(
        &mut self,
        shared: Arc<SubscriptionShared>,
        how: SubscribeHow,
    ) -> Option<JoinHandle<()>> {
        let sid = shared.sid;
        let (target, worker) = match how {
            SubscribeHow::Queue(tx) => (DispatchTarget::Queue(tx), None),
            SubscribeHow::Handler {
                handler,
                idle_timeout,
            } => match (&self.delivery_pool, idle_timeout) {
                (Some(pool), None) => {
                    let handler = Arc::new(tokio::sync::Mutex::new(handler));
                    (
                        DispatchTarget::Pool {
                            worker: pool.worker_for(sid),
                            handler,
                        },
                        None,
                    )
                }
                (_, idle_timeout) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let worker =
                        spawn_dedicated_worker(rx, Arc::clone(&shared), handler, idle_timeout);
                    (DispatchTarget::Queue(tx), Some(worker))
                }
            },
        };
        self.subs.insert(sid, SubscriptionEntry::new(shared, target));
        self.sub_order.push(sid);
        worker
    }

    async fn handle_unsubscribe(&mut self, sid: u64, max: Option<u64>) -> Result<()> {
        let Some(entry) = self.subs.get_mut(&sid) else {
            return Err(ClientError::SubscriptionClosed);
        };
        match max {
            None => {
                self.subs.remove(&sid);
                self.sub_order.retain(|s| *s != sid);
                self.queue_control(|buf| encode_unsub(buf, sid, None)).await;
                debug!(sid, "unsubscribed");
            }
            Some(max) => {
                if entry.received >= max {
                    self.subs.remove(&sid);
                    self.sub_order.retain(|s| *s != sid);
                    self.queue_control(|buf| encode_unsub(buf, sid, None)).await;
                } else {
                    entry.max_msgs = Some(max);
                    self.queue_control(|buf| encode_unsub(buf, sid, Some(max)))
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Best-effort final write of buffered outbound bytes before a close
    async fn flush_and_shutdown(&mut self, session: &mut Session) {
        if let Some(bytes) = self.take_outbound().await {
            let _ = session.write_all(&bytes).await;
        }
        session.shutdown().await;
    }

    /// Check whether a drain in progress has delivered everything or run out
    /// of time; returns a flow decision when the connection was closed
    async fn check_drain_progress(&mut self, session: &mut Session) -> Option<Flow> {
        let deadline = self.drain.as_ref()?.deadline;
        let drained = self
            .subs
            .values()
            .all(|entry| entry.shared.pending_msgs.load(Ordering::Acquire) == 0);
        if drained {
            self.set_status(Status::DrainingPubs).await;
            self.flush_and_shutdown(session).await;
            let state = self.drain.take();
            info!("drain complete");
            self.do_close().await;
            if let Some(reply) = state.and_then(|s| s.reply) {
                let _ = reply.send(Ok(()));
            }
            return Some(Flow::Exit);
        }
        if Instant::now() >= deadline {
            self.flush_and_shutdown(session).await;
            let state = self.drain.take();
            warn!("drain deadline elapsed before queues emptied");
            self.do_close().await;
            if let Some(reply) = state.and_then(|s| s.reply) {
                let _ = reply.send(Err(ClientError::Timeout));
            }
            return Some(Flow::Exit);
        }
        None
    }

    // ---- disconnect and reconnect -----------------------------------------

    async fn handle_transport_failure(&mut self, mut session: Session) -> Flow {
        session.shutdown().await;
        self.pings_out = 0;
        // pings lost with the session are never answered
        self.pongs_received = self.pings_sent;
        for waiter in &mut self.pong_waiters {
            waiter.0 = 0;
        }

        if self.drain.is_some() || !self.options.allow_reconnect {
            self.do_close().await;
            return Flow::Exit;
        }

        info!("connection lost, entering reconnect loop");
        self.set_status(Status::Reconnecting).await;
        self.send_event(ConnectionEvent::Disconnected);
        Flow::Continue
    }

    async fn run_reconnect(&mut self) -> Flow {
        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts: usize = 0;

        loop {
            let candidate = match self.current.take() {
                Some(current) => self.pool.advance(&current, self.options.max_reconnect),
                None => self.pool.first(),
            };
            let Some(url) = candidate else {
                warn!("server pool exhausted, giving up");
                self.do_close_with_error().await;
                return Flow::Exit;
            };

            // wait once per full pass over the pool, before retrying a
            // server already attempted this episode
            if tried.contains(&url.key()) {
                attempts += 1;
                let delay = self.reconnect_delay(attempts, url.is_tls());
                debug!(delay_ms = delay.as_millis() as u64, "waiting before next reconnect pass");
                if !self.sleep_serving_commands(delay).await {
                    return Flow::Exit;
                }
                tried.clear();
            }
            tried.insert(url.key());

            self.pool.record_attempt(&url);
            self.current = Some(url.clone());
            match self.establish(&url).await {
                Ok(mut session) => match self.resync(&mut session).await {
                    Ok(()) => {
                        self.finish_connect(url, session).await;
                        return Flow::Continue;
                    }
                    Err(e) => {
                        warn!(server = %url.addr(), error = %e, "resync after reconnect failed");
                        session.shutdown().await;
                    }
                },
                Err(e) => {
                    if matches!(e, ClientError::Authorization(_)) {
                        self.send_event(ConnectionEvent::AsyncError(e));
                    } else {
                        debug!(server = %url.addr(), error = %e, "reconnect attempt failed");
                    }
                }
            }
        }
    }

    fn reconnect_delay(&self, attempts: usize, tls: bool) -> Duration {
        if let Some(cb) = &self.options.reconnect_delay_callback {
            return cb(attempts);
        }
        let jitter_range = if tls {
            self.options.reconnect_jitter_tls
        } else {
            self.options.reconnect_jitter
        };
        let jitter = if jitter_range.is_zero() {
            Duration::ZERO
        } else {
            use rand::Rng;
            let max = jitter_range.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=max))
        };
        self.options.reconnect_wait + jitter
    }

    /// Sleep while still serving application commands; returns false when
    /// the connection was closed in the meantime
    async fn sleep_serving_commands(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Flow::Exit = self.handle_command_disconnected(command).await {
                            return false;
                        }
                    }
                    None => {
                        self.do_close().await;
                        return false;
                    }
                },
            }
        }
    }

    /// Command handling while no session is live: registrations are local
    /// and replayed on the next successful connect
    async fn handle_command_disconnected(&mut self, command: Command) -> Flow {
        match command {
            Command::Subscribe { shared, how, reply } => {
                let sid = shared.sid;
                let worker = self.register_subscription(shared, how);
                debug!(sid, "subscription registered while disconnected");
                let _ = reply.send(Ok(worker));
            }
            Command::Unsubscribe { sid, max, reply } => {
                let result = match self.subs.get_mut(&sid) {
                    Some(entry) => {
                        match max {
                            Some(max) if entry.received < max => entry.max_msgs = Some(max),
                            _ => {
                                self.subs.remove(&sid);
                                self.sub_order.retain(|s| *s != sid);
                            }
                        }
                        Ok(())
                    }
                    None => Err(ClientError::SubscriptionClosed),
                };
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::Flush { reply } => {
                // pinned to the first ping after the next resync
                self.pong_waiters.push_back((0, reply));
            }
            Command::Drain { reply, .. } => {
                // nothing new can arrive while disconnected; close out
                self.do_close().await;
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                return Flow::Exit;
            }
            Command::Close { reply } => {
                self.do_close().await;
                let _ = reply.send(());
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    /// Try each pool entry once for the synchronous initial connect
    async fn initial_connect(&mut self) -> Result<()> {
        let mut last_err = ClientError::NoServers;
        for _ in 0..self.pool.len() {
            let Some(url) = self.pool.first() else { break };
            self.pool.record_attempt(&url);
            match self.establish(&url).await {
                Ok(session) => {
                    self.finish_connect(url, session).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(server = %url.addr(), error = %e, "connect attempt failed");
                    last_err = e;
                    self.pool.advance(&url, self.options.max_reconnect);
                }
            }
        }
        Err(last_err)
    }

    /// Open a fresh transport session and run the CONNECT handshake
    async fn establish(&mut self, url: &ServerUrl) -> Result<Session> {
        let mut session = Session::connect(url, self.options.connect_timeout).await?;
        let connect_timeout = self.options.connect_timeout;
        let handshake = self.handshake(&mut session, url);
        match tokio::time::timeout(connect_timeout, handshake).await {
            Ok(Ok(())) => Ok(session),
            Ok(Err(e)) => {
                session.shutdown().await;
                Err(e)
            }
            Err(_) => {
                session.shutdown().await;
                Err(ClientError::transport(format!(
                    "handshake with {} timed out",
                    url.addr()
                )))
            }
        }
    }

    async fn handshake(&mut self, session: &mut Session, url: &ServerUrl) -> Result<()> {
        self.parser = Parser::new();
        self.read_buf.clear();

        // the server speaks first with INFO
        let info = loop {
            if let Some(op) = self.parser.next_op(&mut self.read_buf)? {
                match op {
                    ServerOp::Info(info) => break *info,
                    other => {
                        return Err(ClientError::protocol(format!(
                            "expected INFO during handshake, received {other:?}"
                        )))
                    }
                }
            } else if session.read_into(&mut self.read_buf).await? == 0 {
                return Err(ClientError::transport("connection closed during handshake"));
            }
        };
        self.apply_server_info(info).await;

        let connect = self.connect_info(url);
        let mut buf = BytesMut::new();
        encode_connect(&mut buf, &connect)?;
        encode_ping(&mut buf);
        session.write_all(&buf).await?;
        self.pings_sent += 1;

        // await the PONG that confirms the server accepted CONNECT
        loop {
            if let Some(op) = self.parser.next_op(&mut self.read_buf)? {
                match op {
                    ServerOp::Pong => {
                        self.pongs_received += 1;
                        self.complete_pong_waiters();
                        return Ok(());
                    }
                    ServerOp::Err(text) => return Err(classify_server_error(&text)),
                    ServerOp::Ok => {}
                    ServerOp::Info(info) => self.apply_server_info(*info).await,
                    ServerOp::Ping => {
                        let mut pong = BytesMut::new();
                        encode_pong(&mut pong);
                        session.write_all(&pong).await?;
                    }
                    other => {
                        return Err(ClientError::protocol(format!(
                            "unexpected operation during handshake: {other:?}"
                        )))
                    }
                }
            } else if session.read_into(&mut self.read_buf).await? == 0 {
                return Err(ClientError::transport("connection closed during handshake"));
            }
        }
    }

    fn connect_info(&self, url: &ServerUrl) -> ConnectInfo {
        // credentials embedded in the URL take precedence; a lone username
        // is treated as a token
        let (user, pass, token) = match (&url.username, &url.password) {
            (Some(user), Some(pass)) => (Some(user.clone()), Some(pass.clone()), None),
            (Some(token), None) => (None, None, Some(token.clone())),
            _ => (
                self.options.user.clone(),
                self.options.password.clone(),
                self.options.token.clone(),
            ),
        };
        ConnectInfo {
            verbose: self.options.verbose,
            pedantic: self.options.pedantic,
            tls_required: url.is_tls(),
            auth_token: token,
            user,
            pass,
            name: self.options.name.clone(),
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: 1,
            echo: self.options.echo,
            headers: true,
            no_responders: true,
        }
    }

    /// Replay subscription state and drain the pending publish buffer onto a
    /// freshly established session
    async fn resync(&mut self, session: &mut Session) -> Result<()> {
        let mut buf = BytesMut::new();
        for sid in &self.sub_order {
            if let Some(entry) = self.subs.get(sid) {
                encode_sub(
                    &mut buf,
                    &entry.shared.subject,
                    entry.shared.queue_group.as_deref(),
                    *sid,
                );
                if let Some(remaining) = entry.remaining_max() {
                    encode_unsub(&mut buf, *sid, Some(remaining));
                }
            }
        }
        if !buf.is_empty() {
            session.write_all(&buf).await?;
        }

        if let Some(pending) = self.take_outbound().await {
            session.write_all(&pending).await?;
        }

        // flushes issued during the outage complete once the new session
        // acknowledges everything replayed above
        if self.pong_waiters.iter().any(|(seq, _)| *seq == 0) {
            self.pings_sent += 1;
            let seq = self.pings_sent;
            for waiter in &mut self.pong_waiters {
                if waiter.0 == 0 {
                    waiter.0 = seq;
                }
            }
            let mut ping = BytesMut::new();
            encode_ping(&mut ping);
            session.write_all(&ping).await?;
        }
        Ok(())
    }

    async fn finish_connect(&mut self, url: ServerUrl, session: Session) {
        info!(server = %url.addr(), "connected");
        self.pool.reset_reconnects(&url);
        self.current = Some(url);
        self.session = Some(session);
        self.pings_out = 0;
        self.set_status(Status::Connected).await;
        if self.established_once {
            self.shared.stats.reconnects.fetch_add(1, Ordering::AcqRel);
            self.send_event(ConnectionEvent::Reconnected);
        } else {
            self.established_once = true;
            self.send_event(ConnectionEvent::Connected);
        }
    }

    // ---- shutdown ---------------------------------------------------------

    async fn do_close_with_error(&mut self) {
        self.send_event(ConnectionEvent::AsyncError(ClientError::NoServers));
        self.do_close().await;
    }

    async fn do_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(mut session) = self.session.take() {
            if let Some(bytes) = self.take_outbound().await {
                let _ = session.write_all(&bytes).await;
            }
            session.shutdown().await;
        }
        self.set_status(Status::Closed).await;

        for (_, waiter) in self.pong_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Closed));
        }
        if let Some(state) = self.drain.take() {
            if let Some(reply) = state.reply {
                let _ = reply.send(Err(ClientError::Closed));
            }
        }
        // dropping the registry closes every subscription queue; receivers
        // finish whatever is already queued, then observe the closed state
        self.subs.clear();
        self.sub_order.clear();

        info!("connection closed");
        self.send_event(ConnectionEvent::Closed);
    }
}

fn classify_server_error(text: &str) -> ClientError {
    let lowered = text.to_ascii_lowercase();
    if lowered.contains("authorization") || lowered.contains("authentication") {
        ClientError::authorization(text.to_string())
    } else {
        ClientError::protocol(text.to_string())
    }
}
