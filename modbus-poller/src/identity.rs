//! Endpoint identities and the pooling keys derived from them.
//!
//! A key has the shape `host:port:unit_id`. IPv6 hosts are bracketed
//! (`[fe80::1]:502:1`) so a key always splits back into exactly one identity.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::Ipv6Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Default Modbus TCP port.
pub const DEFAULT_PORT: u16 = 502;
/// Default unit identifier.
pub const DEFAULT_UNIT_ID: u8 = 1;
/// Lowest addressable unit identifier.
pub const MIN_UNIT_ID: u8 = 1;
/// Highest addressable unit identifier.
pub const MAX_UNIT_ID: u8 = 247;

const MAX_HOST_LEN: usize = 253;

/// Identifies one logical Modbus device: a unit behind a TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointIdentity {
    host: String,
    port: u16,
    unit_id: u8,
}

impl EndpointIdentity {
    /// Create a validated identity.
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Result<Self, ValidationError> {
        let host = host.into();
        validate_host(&host)?;
        if port == 0 {
            return Err(ValidationError::out_of_range("port", 0, 1, u16::MAX.into()));
        }
        if !(MIN_UNIT_ID..=MAX_UNIT_ID).contains(&unit_id) {
            return Err(ValidationError::out_of_range(
                "unit_id",
                unit_id.into(),
                MIN_UNIT_ID.into(),
                MAX_UNIT_ID.into(),
            ));
        }
        Ok(Self {
            host,
            port,
            unit_id,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Pooling key for this identity.
    pub fn key(&self) -> DeviceKey {
        let key = if self.host.contains(':') {
            format!("[{}]:{}:{}", self.host, self.port, self.unit_id)
        } else {
            format!("{}:{}:{}", self.host, self.port, self.unit_id)
        };
        DeviceKey {
            key,
            identity: self.clone(),
        }
    }
}

impl fmt::Display for EndpointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

fn validate_host(host: &str) -> Result<(), ValidationError> {
    let invalid = host.is_empty()
        || host.len() > MAX_HOST_LEN
        || host
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '[' | ']'))
        || (host.contains(':') && host.parse::<Ipv6Addr>().is_err());
    if invalid {
        return Err(ValidationError::InvalidHost(host.to_string()));
    }
    Ok(())
}

/// Pool key derived from an [`EndpointIdentity`].
///
/// Equality, ordering and hashing only look at the encoded string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceKey {
    key: String,
    identity: EndpointIdentity,
}

impl DeviceKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The identity encoded in the key.
    pub fn identity(&self) -> &EndpointIdentity {
        &self.identity
    }
}

impl PartialEq for DeviceKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for DeviceKey {}

impl Hash for DeviceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for DeviceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeviceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl FromStr for DeviceKey {
    type Err = ValidationError;

    /// Parse `host`, `host:port` or `host:port:unit_id`; omitted parts take
    /// their defaults, so the result is always in canonical form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_identity(s).map(|id| id.key())
    }
}

impl TryFrom<String> for DeviceKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceKey> for String {
    fn from(key: DeviceKey) -> Self {
        key.key
    }
}

impl From<&EndpointIdentity> for DeviceKey {
    fn from(id: &EndpointIdentity) -> Self {
        id.key()
    }
}

fn parse_identity(s: &str) -> Result<EndpointIdentity, ValidationError> {
    let invalid = || ValidationError::InvalidKey(s.to_string());

    let (host, rest) = if let Some(bracketed) = s.strip_prefix('[') {
        let (host, rest) = bracketed.split_once(']').ok_or_else(invalid)?;
        let rest = match rest {
            "" => None,
            rest => Some(rest.strip_prefix(':').ok_or_else(invalid)?),
        };
        (host, rest)
    } else {
        match s.split_once(':') {
            Some((host, rest)) => (host, Some(rest)),
            None => (s, None),
        }
    };

    let mut parts = rest.map(|rest| rest.split(':')).into_iter().flatten();
    let port = match parts.next() {
        Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
        None => DEFAULT_PORT,
    };
    let unit_id = match parts.next() {
        Some(unit) => unit.parse::<u8>().map_err(|_| invalid())?,
        None => DEFAULT_UNIT_ID,
    };
    if parts.next().is_some() {
        return Err(invalid());
    }

    EndpointIdentity::new(host, port, unit_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn id(host: &str, port: u16, unit: u8) -> EndpointIdentity {
        EndpointIdentity::new(host, port, unit).unwrap()
    }

    #[test]
    fn key_has_canonical_shape() {
        assert_eq!(id("10.0.0.5", 502, 1).key().as_str(), "10.0.0.5:502:1");
        assert_eq!(id("::1", 1502, 7).key().as_str(), "[::1]:1502:7");
    }

    #[test]
    fn keys_are_injective() {
        let hosts = ["10.0.0.1", "10.0.0.12", "plc-a", "::1", "fe80::1:502"];
        let ports = [1, 12, 502, 5020];
        let units = [1, 2, 50, 247];

        let mut seen = HashSet::new();
        let mut total = 0;
        for host in hosts {
            for port in ports {
                for unit in units {
                    total += 1;
                    assert!(seen.insert(id(host, port, unit).key()));
                }
            }
        }
        assert_eq!(seen.len(), total);
        assert_eq!(id("plc-a", 502, 3).key(), id("plc-a", 502, 3).key());
    }

    #[test]
    fn key_round_trips_through_identity() {
        for identity in [id("192.168.1.20", 502, 1), id("fe80::2", 8502, 247)] {
            assert_eq!(identity.key().identity(), &identity);
            assert_eq!(identity.key().as_str().parse::<DeviceKey>().unwrap(), identity.key());
        }
    }

    #[test]
    fn parse_applies_defaults() {
        let key: DeviceKey = "192.168.1.20".parse().unwrap();
        assert_eq!(key.as_str(), "192.168.1.20:502:1");
        let key: DeviceKey = "192.168.1.20:1502".parse().unwrap();
        assert_eq!(key.as_str(), "192.168.1.20:1502:1");
        let key: DeviceKey = "[::1]".parse().unwrap();
        assert_eq!(key.as_str(), "[::1]:502:1");
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        for bad in ["", "host:abc", "host:502:1:9", "host:502:0", "host:502:248", "[::1", "::1:502:1", "host:0:1"] {
            assert!(bad.parse::<DeviceKey>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn identity_rejects_bad_hosts() {
        assert!(EndpointIdentity::new("", 502, 1).is_err());
        assert!(EndpointIdentity::new("bad host", 502, 1).is_err());
        assert!(EndpointIdentity::new("a]b", 502, 1).is_err());
        assert!(EndpointIdentity::new("not:ipv6", 502, 1).is_err());
        assert!(EndpointIdentity::new("x".repeat(254), 502, 1).is_err());
    }

    #[test]
    fn identity_enforces_unit_range() {
        assert!(EndpointIdentity::new("plc", 502, 0).is_err());
        assert!(EndpointIdentity::new("plc", 502, 248).is_err());
        assert!(EndpointIdentity::new("plc", 502, 247).is_ok());
    }
}
