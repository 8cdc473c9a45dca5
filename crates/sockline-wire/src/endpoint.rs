//! Service endpoints.
//!
//! A service is designated by an optional host plus a service string. A
//! service string containing a path separator names a filesystem socket
//! (on systems that have them); anything else must be a decimal port.

#[cfg(unix)]
use std::path::PathBuf;

/// A service name that is neither a decimal port nor a socket path.
#[derive(Debug, thiserror::Error)]
#[error("invalid service name {service:?}: expected a decimal port or a socket path")]
pub struct InvalidService {
    /// The offending service string.
    pub service: String,
}

/// Where a server listens or a client connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// An internet endpoint. Servers bind all interfaces when `host` is
    /// absent; clients default to the local host.
    Tcp { host: Option<String>, port: u16 },
    /// A filesystem socket.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Endpoint {
    /// Resolves a host/service pair into an endpoint.
    ///
    /// On Unix a service string containing `/` designates a filesystem
    /// socket and the host is ignored. Elsewhere, and for plain service
    /// strings, the service must parse as a decimal port.
    pub fn resolve(host: Option<&str>, service: &str) -> Result<Endpoint, InvalidService> {
        #[cfg(unix)]
        if service.contains(std::path::MAIN_SEPARATOR) {
            return Ok(Endpoint::Unix(PathBuf::from(service)));
        }

        let port: u16 = service.parse().map_err(|_| InvalidService {
            service: service.to_owned(),
        })?;
        Ok(Endpoint::Tcp {
            host: host.filter(|h| !h.is_empty()).map(str::to_owned),
            port,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => match host {
                Some(host) => write!(f, "{host}:{port}"),
                None => write!(f, "*:{port}"),
            },
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}
