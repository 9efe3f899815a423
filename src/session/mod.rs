//! Resilient session layer.
//!
//! This module is split into focused sub-modules, pure logic separated from
//! the I/O-driving task:
//!
//! - [`backoff`] - pure reconnect delay policy
//! - [`queue`] - pure FIFO offline queue with capacity policies
//! - [`tracker`] - pure in-flight operation table keyed by packet id
//! - [`dispatch`] - subscription table and bounded handler dispatch
//! - [`manager`] - the session task and the public [`Session`] handle
//!
//! # Usage
//!
//! ```rust,no_run
//! use duramq::{QoS, Session, SessionConfig};
//!
//! # tokio_test::block_on(async {
//! let config = SessionConfig::for_url("mqtt://localhost:1883");
//! let session = Session::new(config)?;
//! session.connect().await?;
//!
//! session
//!     .subscribe("sensors/#", QoS::AtLeastOnce, |message| {
//!         println!("{}: {:?}", message.topic, message.payload);
//!     })
//!     .await?
//!     .await?;
//!
//! session
//!     .publish("sensors/kitchen/temp", "21.5", QoS::AtLeastOnce, false)
//!     .await?
//!     .await?;
//!
//! session.shutdown().await?;
//! # Ok::<(), duramq::SessionError>(())
//! # });
//! ```

pub mod backoff;
pub mod dispatch;
pub mod manager;
pub mod queue;
pub mod tracker;

pub use backoff::BackoffController;
pub use dispatch::{MessageHandler, Publication};
pub use manager::{ConnectionState, Delivery, Session};
pub use queue::{EnqueueOutcome, OfflineQueue, QueuePolicy, QueuedMessage};
pub use tracker::{OperationKind, OperationTracker, PendingOperation};
