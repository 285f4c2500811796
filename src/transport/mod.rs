//! Messaging plumbing shared by every role: endpoint resolution, EINTR-safe
//! calls and payload helpers.

pub mod endpoint;
pub mod message;
pub mod retry;

pub use endpoint::{
    BIND_ANY, DEFAULT_MAX_RETRIES, EndpointSpec, LOCALHOST, apply_hwm, bind_endpoint,
    connect_endpoint, resolve_endpoint,
};
pub use message::{SYNC_ACK, SYNC_MARKER, recv_bytes, recv_json, send_bytes, send_json};
pub use retry::{Interruptible, uninterruptible};
