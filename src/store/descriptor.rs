//! Backend connection descriptors
//!
//! Accepted forms:
//!
//! | Form | Meaning |
//! |---|---|
//! | `redis://host:port[/db]` | RESP over TCP |
//! | `tcp://host:port[/db]` | RESP over TCP |
//! | `host:port[/db]` or `host` | RESP over TCP (port defaults to 6379) |
//! | `unix:///path/to.sock` | RESP over a Unix-domain socket |
//! | `memory://name` | in-process backend |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::StoreError;
use crate::types::Port;

/// Where a backend lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendDescriptor {
    Tcp {
        host: String,
        port: u16,
        db: Option<u32>,
    },
    Unix {
        path: PathBuf,
    },
    Memory {
        name: String,
    },
}

impl BackendDescriptor {
    /// In-process backend descriptor
    #[must_use]
    pub fn memory(name: impl Into<String>) -> Self {
        Self::Memory { name: name.into() }
    }

    /// TCP backend descriptor on database 0
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
            db: None,
        }
    }

    fn invalid(descriptor: &str, reason: impl Into<String>) -> StoreError {
        StoreError::InvalidDescriptor {
            descriptor: descriptor.to_string(),
            reason: reason.into(),
        }
    }

    fn parse_tcp(original: &str, rest: &str) -> Result<Self, StoreError> {
        let (address, db) = match rest.split_once('/') {
            Some((address, "")) => (address, None),
            Some((address, db)) => {
                let db = db
                    .parse::<u32>()
                    .map_err(|_| Self::invalid(original, format!("invalid database {db:?}")))?;
                (address, Some(db))
            }
            None => (rest, None),
        };

        let (host, port) = if let Some(bracketed) = address.strip_prefix('[') {
            // [v6addr]:port
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| Self::invalid(original, "unterminated IPv6 address"))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(Self::invalid(original, "garbage after IPv6 address")),
            }
        } else {
            match address.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (address, None),
            }
        };

        if host.is_empty() {
            return Err(Self::invalid(original, "missing host"));
        }

        let port = match port {
            Some(port) => Port::from_str(port)
                .map_err(|e| Self::invalid(original, e.to_string()))?
                .get(),
            None => Port::REDIS.get(),
        };

        Ok(Self::Tcp {
            host: host.to_string(),
            port,
            db,
        })
    }
}

impl FromStr for BackendDescriptor {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Self::invalid(s, "empty descriptor"));
        }

        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(Self::invalid(s, "missing socket path"));
            }
            return Ok(Self::Unix {
                path: PathBuf::from(path),
            });
        }

        if let Some(name) = s.strip_prefix("memory://") {
            if name.is_empty() {
                return Err(Self::invalid(s, "missing backend name"));
            }
            return Ok(Self::memory(name));
        }

        let rest = s
            .strip_prefix("redis://")
            .or_else(|| s.strip_prefix("tcp://"))
            .unwrap_or(s);

        if rest.contains("://") {
            return Err(Self::invalid(s, "unknown scheme"));
        }

        Self::parse_tcp(s, rest)
    }
}

impl fmt::Display for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port, db } => {
                if host.contains(':') {
                    write!(f, "tcp://[{host}]:{port}")?;
                } else {
                    write!(f, "tcp://{host}:{port}")?;
                }
                if let Some(db) = db {
                    write!(f, "/{db}")?;
                }
                Ok(())
            }
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
            Self::Memory { name } => write!(f, "memory://{name}"),
        }
    }
}

impl TryFrom<String> for BackendDescriptor {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendDescriptor> for String {
    fn from(descriptor: BackendDescriptor) -> Self {
        descriptor.to_string()
    }
}
