#![deny(warnings)]

//! Resolve a host, connect to the first candidate address that accepts, and
//! trade a fixed greeting for a single reply.

use {
    std::{
        error,
        fmt,
        io::{self, Read, Write},
        net::{IpAddr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs},
        str::FromStr,
    },
    tracing::log,
};

/// Bytes sent to the peer once a connection is established.
pub const GREETING: &[u8] = b"Hi from client!";

/// Upper bound on the single read performed after sending [`GREETING`].
pub const RESPONSE_BUFFER_SIZE: usize = 1024;

#[derive(Debug)]
pub enum Error {
    InvalidPort,
    NoReachableAddress(Target),
    Exchange(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidPort => write!(f, "port must be in the range 1-65535"),
            Error::NoReachableAddress(target) => write!(f, "no reachable address for {target}"),
            Error::Exchange(e) => write!(f, "exchange failed: {e}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Exchange(e) => Some(e),
            _ => None,
        }
    }
}

/// Destination of a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, Error> {
        if port == 0 {
            return Err(Error::InvalidPort);
        }

        Ok(Self {
            host: host.into(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Default for Target {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 8080,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if Ipv6Addr::from_str(&self.host).is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
}

/// One resolved address for a [`Target`].
///
/// `canonical_name` is only populated when the resolver reports one, which
/// the system lookup used by [`resolve`] never does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub family: AddressFamily,
    pub socket_type: SocketType,
    pub protocol: Protocol,
    pub canonical_name: Option<String>,
    pub address: SocketAddr,
}

impl From<SocketAddr> for Candidate {
    fn from(address: SocketAddr) -> Self {
        Self {
            family: match address.ip() {
                IpAddr::V4(_) => AddressFamily::Ipv4,
                IpAddr::V6(_) => AddressFamily::Ipv6,
            },
            socket_type: SocketType::Stream,
            protocol: Protocol::Tcp,
            canonical_name: None,
            address,
        }
    }
}

/// A failed connection attempt against a single [`Candidate`].
#[derive(Debug)]
pub struct AttemptError {
    pub candidate: Candidate,
    pub source: io::Error,
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unable to connect to {}: {}", self.candidate.address, self.source)
    }
}

impl error::Error for AttemptError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.source)
    }
}

/// An open stream to the candidate that accepted it.  Dropping it closes the
/// socket.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    candidate: Candidate,
}

impl Connection {
    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

/// Look up stream-capable addresses of either family for `target`, in the
/// order the system resolver returns them.
pub fn resolve(target: &Target) -> io::Result<impl Iterator<Item = Candidate>> {
    Ok((target.host.as_str(), target.port)
        .to_socket_addrs()?
        .map(Candidate::from))
}

fn attempt(candidate: Candidate) -> Result<Connection, AttemptError> {
    match TcpStream::connect(candidate.address) {
        Ok(stream) => Ok(Connection { stream, candidate }),
        Err(source) => Err(AttemptError { candidate, source }),
    }
}

/// Try each resolved candidate in turn and return the first connection that
/// succeeds.
///
/// Failed attempts are logged and skipped.  A failed lookup is handled the
/// same way as running out of candidates.
pub fn connect(target: &Target) -> Result<Connection, Error> {
    let candidates = match resolve(target) {
        Ok(candidates) => candidates,
        Err(e) => {
            log::warn!("unable to resolve {target}: {e}");
            return Err(Error::NoReachableAddress(target.clone()));
        }
    };

    connect_candidates(target, candidates)
}

fn connect_candidates(
    target: &Target,
    candidates: impl IntoIterator<Item = Candidate>,
) -> Result<Connection, Error> {
    for candidate in candidates {
        log::debug!("trying {} ({:?})", candidate.address, candidate.family);

        match attempt(candidate) {
            Ok(connection) => return Ok(connection),
            Err(e) => log::warn!("{e}"),
        }
    }

    Err(Error::NoReachableAddress(target.clone()))
}

/// Send [`GREETING`] and read the reply once.  The returned bytes are empty if
/// the peer closed without answering.
pub fn exchange(mut connection: Connection) -> Result<Vec<u8>, Error> {
    connection
        .stream
        .write_all(GREETING)
        .map_err(Error::Exchange)?;

    let mut buffer = vec![0; RESPONSE_BUFFER_SIZE];
    let count = connection
        .stream
        .read(&mut buffer)
        .map_err(Error::Exchange)?;

    buffer.truncate(count);

    Ok(buffer)
}
