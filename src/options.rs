//! Connection configuration surface and notification hooks

use crate::connection::{self, Client};
use crate::error::{ClientError, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default endpoint when no servers are configured
pub const DEFAULT_URL: &str = "nats://localhost:4222";

/// Default maximum reconnect attempts per server before eviction
pub const DEFAULT_MAX_RECONNECT: usize = 60;
/// Default wait between full passes over the server pool
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
/// Default per-endpoint connect attempt deadline
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Default keepalive ping interval
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
/// Default maximum unanswered pings before the connection is considered stale
pub const DEFAULT_MAX_PINGS_OUT: u32 = 2;
/// Default per-subscription pending message limit
pub const DEFAULT_MAX_PENDING_MSGS: usize = 65536;
/// Default per-subscription pending byte limit
pub const DEFAULT_MAX_PENDING_BYTES: usize = 64 * 1024 * 1024;
/// Default random jitter added to the reconnect wait for plain connections
pub const DEFAULT_RECONNECT_JITTER: Duration = Duration::from_millis(100);
/// Default random jitter added to the reconnect wait for TLS connections
pub const DEFAULT_RECONNECT_JITTER_TLS: Duration = Duration::from_secs(1);
/// Default bound of the pending publish buffer while reconnecting
pub const DEFAULT_RECONNECT_BUF_SIZE: usize = 8 * 1024 * 1024;

pub(crate) type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;
pub(crate) type ErrorCallback = Arc<dyn Fn(ClientError) + Send + Sync>;
pub(crate) type ServersCallback = Arc<dyn Fn(Vec<String>) + Send + Sync>;
pub(crate) type ReconnectDelayCallback = Arc<dyn Fn(usize) -> Duration + Send + Sync>;

/// Configuration for establishing a [`Client`] connection.
///
/// Lifecycle callbacks are never invoked inline from the transport read path;
/// background tasks post structured events onto an internal channel drained by
/// a dedicated dispatch task that invokes the hooks.
#[derive(Clone)]
pub struct ConnectOptions {
    pub(crate) servers: Vec<String>,
    pub(crate) no_randomize: bool,
    pub(crate) allow_reconnect: bool,
    /// `None` means retry a server indefinitely
    pub(crate) max_reconnect: Option<usize>,
    pub(crate) reconnect_wait: Duration,
    pub(crate) reconnect_jitter: Duration,
    pub(crate) reconnect_jitter_tls: Duration,
    pub(crate) reconnect_buf_size: usize,
    pub(crate) connect_timeout: Duration,
    pub(crate) retry_on_failed_connect: bool,
    pub(crate) ping_interval: Duration,
    pub(crate) max_pings_out: u32,
    pub(crate) max_pending_msgs: usize,
    pub(crate) max_pending_bytes: usize,
    /// 0 means one dedicated delivery worker per handler subscription
    pub(crate) delivery_pool_size: usize,
    pub(crate) name: Option<String>,
    pub(crate) token: Option<String>,
    pub(crate) user: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) echo: bool,
    pub(crate) verbose: bool,
    pub(crate) pedantic: bool,
    pub(crate) connected_callback: Option<LifecycleCallback>,
    pub(crate) disconnected_callback: Option<LifecycleCallback>,
    pub(crate) reconnected_callback: Option<LifecycleCallback>,
    pub(crate) closed_callback: Option<LifecycleCallback>,
    pub(crate) discovered_servers_callback: Option<ServersCallback>,
    pub(crate) error_callback: Option<ErrorCallback>,
    pub(crate) reconnect_delay_callback: Option<ReconnectDelayCallback>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            no_randomize: false,
            allow_reconnect: true,
            max_reconnect: Some(DEFAULT_MAX_RECONNECT),
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            reconnect_jitter: DEFAULT_RECONNECT_JITTER,
            reconnect_jitter_tls: DEFAULT_RECONNECT_JITTER_TLS,
            reconnect_buf_size: DEFAULT_RECONNECT_BUF_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_on_failed_connect: false,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_pings_out: DEFAULT_MAX_PINGS_OUT,
            max_pending_msgs: DEFAULT_MAX_PENDING_MSGS,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
            delivery_pool_size: 0,
            name: None,
            token: None,
            user: None,
            password: None,
            echo: true,
            verbose: false,
            pedantic: false,
            connected_callback: None,
            disconnected_callback: None,
            reconnected_callback: None,
            closed_callback: None,
            discovered_servers_callback: None,
            error_callback: None,
            reconnect_delay_callback: None,
        }
    }
}

impl ConnectOptions {
    /// Create options with library defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidate broker endpoints, in addition to any passed to `connect`
    pub fn servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Disable shuffling of the server pool
    pub fn no_randomize(mut self, no_randomize: bool) -> Self {
        self.no_randomize = no_randomize;
        self
    }

    /// Enable or disable automatic reconnection
    pub fn allow_reconnect(mut self, allow: bool) -> Self {
        self.allow_reconnect = allow;
        self
    }

    /// Maximum reconnect attempts per server before it is evicted from the
    /// pool; `None` retries indefinitely
    pub fn max_reconnect(mut self, max: Option<usize>) -> Self {
        self.max_reconnect = max;
        self
    }

    /// Base wait between full passes over the server pool while reconnecting
    pub fn reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    /// Random jitter ranges added to the reconnect wait for plain and TLS
    /// connections respectively
    pub fn reconnect_jitter(mut self, jitter: Duration, jitter_tls: Duration) -> Self {
        self.reconnect_jitter = jitter;
        self.reconnect_jitter_tls = jitter_tls;
        self
    }

    /// Bound of the pending publish buffer used while reconnecting
    pub fn reconnect_buffer_size(mut self, bytes: usize) -> Self {
        self.reconnect_buf_size = bytes;
        self
    }

    /// Per-endpoint connect attempt deadline
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Return immediately from the initial connect and keep retrying in the
    /// background; pair with [`ConnectOptions::connected_callback`]
    pub fn retry_on_failed_connect(mut self, retry: bool) -> Self {
        self.retry_on_failed_connect = retry;
        self
    }

    /// Keepalive ping interval
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Maximum unanswered pings before the connection is treated as stale
    pub fn max_pings_out(mut self, max: u32) -> Self {
        self.max_pings_out = max;
        self
    }

    /// Default per-subscription pending limits
    pub fn pending_limits(mut self, max_msgs: usize, max_bytes: usize) -> Self {
        self.max_pending_msgs = max_msgs;
        self.max_pending_bytes = max_bytes;
        self
    }

    /// Use a fixed-size shared pool of delivery workers for handler
    /// subscriptions instead of one dedicated worker per subscription.
    ///
    /// Subscriptions are assigned to workers by their identifier; FIFO order
    /// is preserved within each subscription but not across subscriptions on
    /// different workers.
    pub fn delivery_pool_size(mut self, workers: usize) -> Self {
        self.delivery_pool_size = workers;
        self
    }

    /// Client name reported to the server
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Authenticate with a token
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Authenticate with a username and password
    pub fn user_and_password(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Whether the server should echo this client's own publishes back
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Request +OK acknowledgments from the server
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Request strict subject checking on the server
    pub fn pedantic(mut self, pedantic: bool) -> Self {
        self.pedantic = pedantic;
        self
    }

    /// Invoked once when a background initial connect succeeds
    /// (see [`ConnectOptions::retry_on_failed_connect`])
    pub fn connected_callback<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.connected_callback = Some(Arc::new(f));
        self
    }

    /// Invoked once per disconnect episode when the transport fails
    pub fn disconnected_callback<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.disconnected_callback = Some(Arc::new(f));
        self
    }

    /// Invoked once per disconnect episode after a successful reconnect
    pub fn reconnected_callback<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reconnected_callback = Some(Arc::new(f));
        self
    }

    /// Invoked exactly once when the connection transitions to closed
    pub fn closed_callback<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.closed_callback = Some(Arc::new(f));
        self
    }

    /// Invoked when server gossip announces endpoints never seen before
    pub fn discovered_servers_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<String>) + Send + Sync + 'static,
    {
        self.discovered_servers_callback = Some(Arc::new(f));
        self
    }

    /// Invoked for asynchronous errors: slow consumers, protocol errors, and
    /// stale connections detected on background tasks
    pub fn error_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(ClientError) + Send + Sync + 'static,
    {
        self.error_callback = Some(Arc::new(f));
        self
    }

    /// Supply the delay before each reconnect pass; when set, the base wait
    /// and jitter are ignored and this callback's value is used verbatim
    pub fn custom_reconnect_delay<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        self.reconnect_delay_callback = Some(Arc::new(f));
        self
    }

    /// Connect to the given comma-separated server URLs.
    ///
    /// URLs passed here are combined with any configured via
    /// [`ConnectOptions::servers`]; when both are empty the default URL is
    /// used.
    pub async fn connect(self, urls: impl AsRef<str>) -> Result<Client> {
        let mut servers: Vec<String> = urls
            .as_ref()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        servers.extend(self.servers.iter().cloned());
        connection::connect(Arc::new(self), servers).await
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("servers", &self.servers)
            .field("no_randomize", &self.no_randomize)
            .field("allow_reconnect", &self.allow_reconnect)
            .field("max_reconnect", &self.max_reconnect)
            .field("reconnect_wait", &self.reconnect_wait)
            .field("connect_timeout", &self.connect_timeout)
            .field("retry_on_failed_connect", &self.retry_on_failed_connect)
            .field("ping_interval", &self.ping_interval)
            .field("max_pings_out", &self.max_pings_out)
            .field("max_pending_msgs", &self.max_pending_msgs)
            .field("max_pending_bytes", &self.max_pending_bytes)
            .field("delivery_pool_size", &self.delivery_pool_size)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
