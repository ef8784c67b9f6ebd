//! Subscription state, dispatch accounting, and delivery workers.
//!
//! Each subscription owns a pending queue with its own synchronization
//! domain, so one slow subscription never blocks publishes or delivery to
//! other subscriptions. Enqueuing past the configured pending limits drops
//! the message and raises a slow-consumer notification once per episode
//! rather than applying backpressure to the publisher.

use crate::connection::Command;
use crate::error::{ClientError, Result};
use crate::message::Message;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// Counters and limits shared between the connection driver, the delivery
/// side, and the application handle
#[derive(Debug)]
pub(crate) struct SubscriptionShared {
    pub sid: u64,
    pub subject: String,
    pub queue_group: Option<String>,
    pub max_pending_msgs: usize,
    pub max_pending_bytes: usize,
    pub pending_msgs: AtomicUsize,
    pub pending_bytes: AtomicUsize,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    /// Set while inside a slow-consumer episode; cleared on the next
    /// successful enqueue so each episode notifies exactly once
    slow: AtomicBool,
}

impl SubscriptionShared {
    pub fn new(
        sid: u64,
        subject: String,
        queue_group: Option<String>,
        max_pending_msgs: usize,
        max_pending_bytes: usize,
    ) -> Self {
        Self {
            sid,
            subject,
            queue_group,
            max_pending_msgs,
            max_pending_bytes,
            pending_msgs: AtomicUsize::new(0),
            pending_bytes: AtomicUsize::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            slow: AtomicBool::new(false),
        }
    }

    /// Bookkeeping when a message leaves the pending queue for the handler
    /// or a `next()` caller
    pub fn note_delivered(&self, payload_len: usize) {
        self.pending_msgs.fetch_sub(1, Ordering::AcqRel);
        self.pending_bytes.fetch_sub(payload_len, Ordering::AcqRel);
        self.delivered.fetch_add(1, Ordering::AcqRel);
    }
}

/// Boxed future returned by message handlers
pub(crate) type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
/// Type-erased message handler; `None` is the idle-timeout sentinel
pub(crate) type MessageHandler = Box<dyn FnMut(Option<Message>) -> HandlerFuture + Send>;
/// Handler slot shared with a pooled delivery worker
pub(crate) type PoolHandler = Arc<tokio::sync::Mutex<MessageHandler>>;

/// A unit of work for a pooled delivery worker
pub(crate) struct PoolJob {
    pub shared: Arc<SubscriptionShared>,
    pub handler: PoolHandler,
    pub msg: Message,
}

/// Where dispatched messages for a subscription go
pub(crate) enum DispatchTarget {
    /// Pending queue drained by a `Subscriber` or a dedicated worker
    Queue(mpsc::UnboundedSender<Message>),
    /// Shared pool worker assigned by subscription identifier
    Pool {
        worker: mpsc::UnboundedSender<PoolJob>,
        handler: PoolHandler,
    },
}

/// Outcome of dispatching one inbound message to a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// Enqueued for delivery
    Delivered,
    /// Dropped due to pending limits; `first_of_episode` selects whether to
    /// raise the slow-consumer notification
    Dropped { first_of_episode: bool },
    /// The subscription reached its auto-unsubscribe threshold or its
    /// receiver is gone; remove it from the registry
    Completed,
}

/// Registry entry owned by the connection driver
pub(crate) struct SubscriptionEntry {
    pub shared: Arc<SubscriptionShared>,
    pub target: DispatchTarget,
    /// Auto-unsubscribe threshold, counted from subscription creation
    pub max_msgs: Option<u64>,
    /// Messages enqueued so far, for client-side threshold enforcement
    pub received: u64,
}

impl SubscriptionEntry {
    pub fn new(shared: Arc<SubscriptionShared>, target: DispatchTarget) -> Self {
        Self {
            shared,
            target,
            max_msgs: None,
            received: 0,
        }
    }

    /// Enqueue an inbound message, enforcing pending limits without blocking
    pub fn dispatch(&mut self, msg: Message) -> DispatchOutcome {
        let len = msg.payload.len();
        let s = &self.shared;

        let over_msgs =
            s.max_pending_msgs > 0 && s.pending_msgs.load(Ordering::Acquire) >= s.max_pending_msgs;
        let over_bytes = s.max_pending_bytes > 0
            && s.pending_bytes.load(Ordering::Acquire) + len > s.max_pending_bytes;
        if over_msgs || over_bytes {
            s.dropped.fetch_add(1, Ordering::AcqRel);
            let first_of_episode = !s.slow.swap(true, Ordering::AcqRel);
            return DispatchOutcome::Dropped { first_of_episode };
        }
        s.slow.store(false, Ordering::Release);

        s.pending_msgs.fetch_add(1, Ordering::AcqRel);
        s.pending_bytes.fetch_add(len, Ordering::AcqRel);
        let sent = match &self.target {
            DispatchTarget::Queue(tx) => tx.send(msg).is_ok(),
            DispatchTarget::Pool { worker, handler } => worker
                .send(PoolJob {
                    shared: Arc::clone(s),
                    handler: Arc::clone(handler),
                    msg,
                })
                .is_ok(),
        };
        if !sent {
            s.pending_msgs.fetch_sub(1, Ordering::AcqRel);
            s.pending_bytes.fetch_sub(len, Ordering::AcqRel);
            return DispatchOutcome::Completed;
        }

        self.received += 1;
        if let Some(max) = self.max_msgs {
            if self.received >= max {
                return DispatchOutcome::Completed;
            }
        }
        DispatchOutcome::Delivered
    }

    /// Remaining auto-unsubscribe allowance to re-send after a reconnect
    pub fn remaining_max(&self) -> Option<u64> {
        self.max_msgs.map(|max| max.saturating_sub(self.received))
    }
}

/// A synchronous-poll subscription handle.
///
/// Messages arrive strictly in server-send order. Dropping the handle
/// unsubscribes on a best-effort basis; call
/// [`Subscriber::unsubscribe`] for confirmation.
#[derive(Debug)]
pub struct Subscriber {
    rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<SubscriptionShared>,
    commands: mpsc::Sender<Command>,
    unsubscribed: bool,
}

impl Subscriber {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Message>,
        shared: Arc<SubscriptionShared>,
        commands: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            rx,
            shared,
            commands,
            unsubscribed: false,
        }
    }

    /// Await the next message.
    ///
    /// Returns [`ClientError::SubscriptionClosed`] once the subscription is
    /// invalidated and its queue has drained.
    pub async fn next(&mut self) -> Result<Message> {
        match self.rx.recv().await {
            Some(msg) => {
                self.shared.note_delivered(msg.payload.len());
                Ok(msg)
            }
            None => Err(ClientError::SubscriptionClosed),
        }
    }

    /// Await the next message with a deadline.
    ///
    /// A [`ClientError::Timeout`] outcome is normal and leaves the
    /// subscription valid, distinct from the closed outcome.
    pub async fn next_timeout(&mut self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Err(ClientError::Timeout),
            Ok(Some(msg)) => {
                self.shared.note_delivered(msg.payload.len());
                Ok(msg)
            }
            Ok(None) => Err(ClientError::SubscriptionClosed),
        }
    }

    /// Remove this subscription from the server and the registry.
    ///
    /// Messages already queued remain readable until the queue drains.
    pub async fn unsubscribe(&mut self) -> Result<()> {
        self.unsubscribed = true;
        send_unsubscribe(&self.commands, self.shared.sid, None).await
    }

    /// Ask the server and the client to stop after `max` total messages
    /// have been received by this subscription
    pub async fn unsubscribe_after(&mut self, max: u64) -> Result<()> {
        send_unsubscribe(&self.commands, self.shared.sid, Some(max)).await
    }

    /// Subscription identifier
    pub fn sid(&self) -> u64 {
        self.shared.sid
    }

    /// Subject pattern this subscription was created with
    pub fn subject(&self) -> &str {
        &self.shared.subject
    }

    /// Queue group, when part of one
    pub fn queue_group(&self) -> Option<&str> {
        self.shared.queue_group.as_deref()
    }

    /// Messages handed to the application so far
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Acquire)
    }

    /// Messages dropped due to pending limits
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Acquire)
    }

    /// Messages currently queued awaiting delivery
    pub fn pending_msgs(&self) -> usize {
        self.shared.pending_msgs.load(Ordering::Acquire)
    }

    /// Bytes currently queued awaiting delivery
    pub fn pending_bytes(&self) -> usize {
        self.shared.pending_bytes.load(Ordering::Acquire)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if !self.unsubscribed {
            let _ = self.commands.try_send(Command::Unsubscribe {
                sid: self.shared.sid,
                max: None,
                reply: None,
            });
        }
    }
}

/// Handle for a subscription delivered through a message handler
#[derive(Debug)]
pub struct HandlerSubscription {
    shared: Arc<SubscriptionShared>,
    commands: mpsc::Sender<Command>,
    worker: Option<JoinHandle<()>>,
    unsubscribed: bool,
}

impl HandlerSubscription {
    pub(crate) fn new(
        shared: Arc<SubscriptionShared>,
        commands: mpsc::Sender<Command>,
        worker: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            shared,
            commands,
            worker,
            unsubscribed: false,
        }
    }

    /// Remove this subscription; the handler keeps running for messages
    /// already queued
    pub async fn unsubscribe(&mut self) -> Result<()> {
        self.unsubscribed = true;
        send_unsubscribe(&self.commands, self.shared.sid, None).await
    }

    /// Unsubscribe and wait for the delivery worker to finish its queued
    /// messages and any in-flight handler invocation
    pub async fn stop(mut self) -> Result<()> {
        let result = self.unsubscribe().await;
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        result
    }

    /// Subscription identifier
    pub fn sid(&self) -> u64 {
        self.shared.sid
    }

    /// Subject pattern this subscription was created with
    pub fn subject(&self) -> &str {
        &self.shared.subject
    }

    /// Messages handed to the handler so far
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Acquire)
    }

    /// Messages dropped due to pending limits
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Acquire)
    }
}

impl Drop for HandlerSubscription {
    fn drop(&mut self) {
        if !self.unsubscribed {
            let _ = self.commands.try_send(Command::Unsubscribe {
                sid: self.shared.sid,
                max: None,
                reply: None,
            });
        }
    }
}

async fn send_unsubscribe(
    commands: &mpsc::Sender<Command>,
    sid: u64,
    max: Option<u64>,
) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    commands
        .send(Command::Unsubscribe {
            sid,
            max,
            reply: Some(tx),
        })
        .await
        .map_err(|_| ClientError::Closed)?;
    rx.await.map_err(|_| ClientError::Closed)?
}

/// Spawn the dedicated delivery worker for one handler subscription.
///
/// The 1:1 binding guarantees FIFO delivery for the subscription and that a
/// slow handler cannot stall delivery to any other subscription. When an
/// idle timeout is configured the handler is invoked with `None` whenever
/// the window elapses without a message, then the window re-arms.
pub(crate) fn spawn_dedicated_worker(
    mut rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<SubscriptionShared>,
    mut handler: MessageHandler,
    idle_timeout: Option<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let msg = match idle_timeout {
                Some(window) => match tokio::time::timeout(window, rx.recv()).await {
                    Err(_) => {
                        handler(None).await;
                        continue;
                    }
                    Ok(msg) => msg,
                },
                None => rx.recv().await,
            };
            match msg {
                Some(msg) => {
                    shared.note_delivered(msg.payload.len());
                    handler(Some(msg)).await;
                }
                None => break,
            }
        }
        debug!(sid = shared.sid, "delivery worker finished");
    })
}

/// Fixed-size pool of shared delivery workers.
///
/// Subscriptions are assigned by `sid % pool_size`; jobs for the same
/// subscription land on the same worker in dispatch order, preserving
/// per-subscription FIFO while bounding the number of delivery tasks.
pub(crate) struct DeliveryPool {
    workers: Vec<mpsc::UnboundedSender<PoolJob>>,
}

impl DeliveryPool {
    pub fn new(size: usize) -> Self {
        let workers = (0..size)
            .map(|index| {
                let (tx, mut rx) = mpsc::unbounded_channel::<PoolJob>();
                tokio::spawn(async move {
                    while let Some(job) = rx.recv().await {
                        job.shared.note_delivered(job.msg.payload.len());
                        let mut handler = job.handler.lock().await;
                        handler(Some(job.msg)).await;
                    }
                    debug!(worker = index, "pooled delivery worker finished");
                });
                tx
            })
            .collect();
        Self { workers }
    }

    pub fn worker_for(&self, sid: u64) -> mpsc::UnboundedSender<PoolJob> {
        self.workers[(sid as usize) % self.workers.len()].clone()
    }
}

/// Validate a publish subject: dot-separated non-empty tokens, wildcards
/// not allowed
pub(crate) fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty() {
        return Err(ClientError::configuration("subject cannot be empty"));
    }
    for token in subject.split('.') {
        if token.is_empty() {
            return Err(ClientError::configuration(format!(
                "subject contains empty token: {subject}"
            )));
        }
        if token.contains(char::is_whitespace) {
            return Err(ClientError::configuration(format!(
                "subject contains whitespace: {subject}"
            )));
        }
        if token.contains('*') || token.contains('>') {
            return Err(ClientError::configuration(format!(
                "wildcards are not allowed in publish subjects: {subject}"
            )));
        }
    }
    Ok(())
}

/// Validate a subscription pattern: `*` matches exactly one token, `>`
/// matches one or more trailing tokens and must be the last token
pub(crate) fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(ClientError::configuration("subject cannot be empty"));
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(ClientError::configuration(format!(
                "subject contains empty token: {pattern}"
            )));
        }
        if token.contains(char::is_whitespace) {
            return Err(ClientError::configuration(format!(
                "subject contains whitespace: {pattern}"
            )));
        }
        match *token {
            "*" => {}
            ">" => {
                if i != last {
                    return Err(ClientError::configuration(format!(
                        "'>' must be the last token: {pattern}"
                    )));
                }
            }
            t if t.contains('*') || t.contains('>') => {
                return Err(ClientError::configuration(format!(
                    "wildcard must be a whole token: {pattern}"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Validate a queue group name
pub(crate) fn validate_queue_group(group: &str) -> Result<()> {
    if group.is_empty() {
        return Err(ClientError::configuration("queue group cannot be empty"));
    }
    if group.contains(char::is_whitespace) {
        return Err(ClientError::configuration(format!(
            "queue group contains whitespace: {group}"
        )));
    }
    Ok(())
}
