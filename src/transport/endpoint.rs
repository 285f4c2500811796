//! Endpoint specifications and socket binding helpers.
//!
//! Every role accepts its addresses as an [`EndpointSpec`]: a fully-qualified
//! address (`tcp://somehost:5932`), a bare port that is combined with a
//! role-specific default prefix, or an inclusive port range from which a free
//! port is picked at bind time.

use super::retry::uninterruptible;
use crate::error::{Result, TaskventError};
use rand::Rng;
use std::fmt;
use std::str::FromStr;

/// Default prefix for sockets that bind (listen on every interface).
pub const BIND_ANY: &str = "tcp://*";

/// Default prefix for sockets that connect to a peer on this host.
pub const LOCALHOST: &str = "tcp://localhost";

/// Bind attempts made when picking a random port from a range.
pub const DEFAULT_MAX_RETRIES: usize = 100;

/// Where a socket should bind or connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointSpec {
    /// Fully-qualified address, used unchanged.
    Address(String),
    /// Port number, combined with a default address prefix.
    Port(u16),
    /// Inclusive port range; only valid for binding.
    Range { min: u16, max: u16 },
}

impl EndpointSpec {
    /// Create a range spec, rejecting an empty interval.
    pub fn range(min: u16, max: u16) -> Result<Self> {
        if min > max {
            return Err(TaskventError::InvalidEndpoint(format!(
                "port range {}-{} is empty",
                min, max
            )));
        }
        Ok(Self::Range { min, max })
    }
}

impl From<u16> for EndpointSpec {
    fn from(port: u16) -> Self {
        Self::Port(port)
    }
}

impl From<&str> for EndpointSpec {
    fn from(address: &str) -> Self {
        Self::Address(address.to_string())
    }
}

impl From<String> for EndpointSpec {
    fn from(address: String) -> Self {
        Self::Address(address)
    }
}

impl From<(u16, u16)> for EndpointSpec {
    fn from((min, max): (u16, u16)) -> Self {
        Self::Range { min, max }
    }
}

impl FromStr for EndpointSpec {
    type Err = TaskventError;

    /// Parses `tcp://host:port`, `port` or `min-max`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.contains("://") {
            return Ok(Self::Address(s.to_string()));
        }
        if let Some((min, max)) = s.split_once('-') {
            let min = parse_port(min)?;
            let max = parse_port(max)?;
            return Self::range(min, max);
        }
        parse_port(s).map(Self::Port)
    }
}

impl fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "{}", address),
            Self::Port(port) => write!(f, "{}", port),
            Self::Range { min, max } => write!(f, "{}-{}", min, max),
        }
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.trim()
        .parse()
        .map_err(|_| TaskventError::InvalidEndpoint(format!("'{}' is not a port number", s)))
}

/// Resolve an address or port into a full address string.
///
/// Addresses come back unchanged; ports are appended to `default_prefix`.
/// Ranges cannot be resolved without binding and are rejected.
pub fn resolve_endpoint(spec: &EndpointSpec, default_prefix: &str) -> Result<String> {
    match spec {
        EndpointSpec::Address(address) => Ok(address.clone()),
        EndpointSpec::Port(port) => Ok(format!("{}:{}", default_prefix, port)),
        EndpointSpec::Range { min, max } => Err(TaskventError::InvalidEndpoint(format!(
            "port range {}-{} can only be used for binding",
            min, max
        ))),
    }
}

/// Bind `socket` according to `spec` and return the port actually bound.
///
/// For a range, ports are drawn at random from `min..=max` until a bind
/// succeeds; address-in-use conflicts are retried up to `max_retries` times
/// before giving up with [`TaskventError::Bind`].
pub fn bind_endpoint(
    socket: &zmq::Socket,
    spec: &EndpointSpec,
    default_prefix: &str,
    max_retries: usize,
) -> Result<u16> {
    match spec {
        EndpointSpec::Range { min, max } => {
            bind_to_random_port(socket, default_prefix, *min, *max, max_retries)
        }
        EndpointSpec::Address(address) => {
            let port = port_of(address)?;
            uninterruptible(|| socket.bind(address))?;
            Ok(port)
        }
        EndpointSpec::Port(port) => {
            let address = resolve_endpoint(spec, default_prefix)?;
            uninterruptible(|| socket.bind(&address))?;
            Ok(*port)
        }
    }
}

/// Connect `socket` to the resolved address and return that address.
pub fn connect_endpoint(
    socket: &zmq::Socket,
    spec: &EndpointSpec,
    default_prefix: &str,
) -> Result<String> {
    let address = resolve_endpoint(spec, default_prefix)?;
    uninterruptible(|| socket.connect(&address))?;
    Ok(address)
}

/// Apply an optional high-water mark to both directions of `socket`.
///
/// Must happen before the socket is bound or connected to take effect.
pub fn apply_hwm(socket: &zmq::Socket, hwm: Option<i32>) -> Result<()> {
    let Some(hwm) = hwm else {
        return Ok(());
    };
    if hwm <= 0 {
        return Err(TaskventError::InvalidHwm(hwm));
    }
    socket.set_sndhwm(hwm)?;
    socket.set_rcvhwm(hwm)?;
    Ok(())
}

fn bind_to_random_port(
    socket: &zmq::Socket,
    prefix: &str,
    min: u16,
    max: u16,
    max_retries: usize,
) -> Result<u16> {
    if min > max {
        return Err(TaskventError::InvalidEndpoint(format!(
            "port range {}-{} is empty",
            min, max
        )));
    }
    let mut rng = rand::thread_rng();
    for _ in 0..max_retries {
        let port = rng.gen_range(min..=max);
        let address = format!("{}:{}", prefix, port);
        match uninterruptible(|| socket.bind(&address)) {
            Ok(()) => return Ok(port),
            Err(zmq::Error::EADDRINUSE) | Err(zmq::Error::EACCES) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(TaskventError::Bind {
        min,
        max,
        attempts: max_retries,
    })
}

/// Extract the trailing `:port` of a fully-qualified address.
fn port_of(address: &str) -> Result<u16> {
    address
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| {
            TaskventError::InvalidEndpoint(format!("'{}' does not end in a port number", address))
        })
}
