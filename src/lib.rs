//! Asynchronous client engine for a NATS-style publish/subscribe broker.
//!
//! `wirebus` maintains a resilient connection to a pool of broker endpoints
//! and exposes publish, subscribe, and request/reply operations over the
//! text-based wire protocol. The library survives broker failures by
//! reconnecting through the pool, replaying subscription state, and buffering
//! publishes issued during the outage, all without the application having to
//! participate.
//!
//! # Architecture
//!
//! A single background driver task per connection owns the transport session,
//! the server pool, the protocol parser, and the subscription registry.
//! Application handles are cheap clones that talk to the driver through a
//! command channel and a shared outbound buffer, so no application call ever
//! blocks on socket I/O. Each subscription has its own pending queue and its
//! own delivery worker; a slow consumer drops messages past its configured
//! limits instead of exerting backpressure on the connection.
//!
//! # Example
//!
//! ```no_run
//! use wirebus::ConnectOptions;
//! use std::time::Duration;
//!
//! # async fn run() -> wirebus::Result<()> {
//! let client = ConnectOptions::new()
//!     .name("orders-worker")
//!     .connect("nats://localhost:4222")
//!     .await?;
//!
//! let mut sub = client.subscribe("orders.>").await?;
//! client.publish("orders.created", &b"hello"[..]).await?;
//! client.flush(Duration::from_secs(1)).await?;
//!
//! let msg = sub.next().await?;
//! println!("received on {}: {} bytes", msg.subject, msg.payload.len());
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod error;
mod message;
mod options;
mod protocol;
mod server_pool;
mod subscription;
mod transport;

pub use connection::{Client, ClientStats, Status};
pub use error::{ClientError, Result};
pub use message::{HeaderMap, Message};
pub use options::ConnectOptions;
pub use protocol::ServerInfo;
pub use subscription::{HandlerSubscription, Subscriber};

/// Connect with default options to the given comma-separated server URLs
pub async fn connect(urls: impl AsRef<str>) -> Result<Client> {
    ConnectOptions::new().connect(urls).await
}
