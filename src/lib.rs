//! duramq - resilient MQTT 3.1.1 client sessions
//!
//! A session manager for MQTT 3.1.1 that keeps working across broker
//! outages:
//!
//! - Connection lifecycle with automatic reconnection (exponential backoff,
//!   jitter, stability-window reset)
//! - Offline queueing of publishes while disconnected, with unbounded and
//!   bounded (reject-new / drop-oldest) capacity policies
//! - QoS 1/2 acknowledgment tracking with per-operation timeouts and DUP
//!   retransmission after reconnect
//! - Wildcard subscriptions dispatched to per-filter handlers through a
//!   bounded queue, so slow handlers never stall the protocol reader
//! - Byte-exact MQTT 3.1.1 framing over TCP, TLS (caller-built rustls
//!   config), or any `AsyncRead + AsyncWrite` stream
//!
//! # Quick start
//!
//! ```rust,no_run
//! use duramq::{QoS, Session, SessionConfig};
//!
//! # tokio_test::block_on(async {
//! let config = SessionConfig::for_url("mqtt://broker.example.com:1883");
//! let session = Session::new(config)?;
//! session.connect().await?;
//!
//! // Delivery handles resolve on the broker acknowledgment.
//! session
//!     .publish("greetings", "hello", QoS::AtLeastOnce, false)
//!     .await?
//!     .await?;
//!
//! // Watch connection-state transitions (reconnects, outages).
//! let mut states = session.state_changes();
//! tokio::spawn(async move {
//!     while states.changed().await.is_ok() {
//!         println!("state: {:?}", *states.borrow());
//!     }
//! });
//! # Ok::<(), duramq::SessionError>(())
//! # });
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::{QueuePolicy, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use protocol::packet::QoS;
pub use session::{ConnectionState, Delivery, Publication, Session};
pub use transport::{Connector, Endpoint, TcpConnector, TlsConnector};
