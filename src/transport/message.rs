//! Wire payloads exchanged between roles.
//!
//! Work items and results are opaque to the framework; roles choose their
//! own encoding. [`send_json`] and [`recv_json`] cover the common case of one
//! JSON document per message. The synchronization marker is not valid JSON,
//! so it can never be mistaken for a JSON-encoded result.

use super::retry::uninterruptible;
use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Sent once by the ventilator to the sink before any work is dispatched.
pub const SYNC_MARKER: &[u8] = b"HELLO";

/// Sent back by the sink in handshake mode once the marker was consumed.
pub const SYNC_ACK: &[u8] = b"READY";

/// Serialize `value` as JSON and send it as a single message.
pub fn send_json<T: Serialize + ?Sized>(socket: &zmq::Socket, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    uninterruptible(|| socket.send(payload.as_slice(), 0))?;
    Ok(())
}

/// Receive one message and deserialize it from JSON.
pub fn recv_json<T: DeserializeOwned>(socket: &zmq::Socket) -> Result<T> {
    let payload = recv_bytes(socket)?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Blocking receive of one raw message.
pub fn recv_bytes(socket: &zmq::Socket) -> Result<Vec<u8>> {
    Ok(uninterruptible(|| socket.recv_bytes(0))?)
}

/// Blocking send of one raw message.
pub fn send_bytes(socket: &zmq::Socket, payload: &[u8]) -> Result<()> {
    uninterruptible(|| socket.send(payload, 0))?;
    Ok(())
}

/// Describe an unexpected payload for protocol-violation messages.
pub(crate) fn describe_payload(payload: &[u8]) -> String {
    const PREVIEW: usize = 32;
    let shown = &payload[..payload.len().min(PREVIEW)];
    let suffix = if payload.len() > PREVIEW { "..." } else { "" };
    format!("{:?}{}", String::from_utf8_lossy(shown), suffix)
}
