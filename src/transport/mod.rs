//! Transport layer: byte-stream connectors and packet framing.
//!
//! The session manager is the only writer on a connection; connectors exist
//! so the dial step (TCP, TLS, in-process test streams, tunneled byte
//! streams) can be swapped without touching session logic.

pub mod connector;
pub mod framing;

pub use connector::{ByteStream, Connector, Endpoint, TcpConnector, TlsConnector};
pub use framing::{split, FramedReader, FramedWriter, ReadError};

// Callers build the TLS client configuration themselves; re-exported so they
// do not need their own tokio-rustls dependency for the types.
pub use tokio_rustls::rustls;
