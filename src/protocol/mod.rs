//! MQTT 3.1.1 wire protocol.
//!
//! Split into three focused sub-modules:
//!
//! - [`packet`] - control packet data types
//! - [`codec`] - byte-exact encoding and incremental decoding
//! - [`topics`] - topic validation and wildcard matching
//!
//! Everything here is pure: no I/O, no timers, no session state.

pub mod codec;
pub mod packet;
pub mod topics;

pub use codec::{decode, encode, DecodeError, EncodeError, MAX_REMAINING_LENGTH};
pub use packet::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe, Will,
};
pub use topics::{filter_matches, validate_filter, validate_publish_topic};
