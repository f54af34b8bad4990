//! # Multiaddresses
//!
//! Self-describing layered network addresses. A [`Multiaddr`] is an ordered
//! sequence of typed [`Protocol`] components, written as `/`-separated
//! segments: `/ip4/10.0.0.1/tcp/4001/ws`, `/dns4/node.example/tcp/443`,
//! `/memory/abc/p2p/<peer id>`.
//!
//! ## Operations
//!
//! - **encapsulate**: append further components (`/ip4/x/tcp/1` + `/ws`)
//! - **decapsulate**: drop the suffix starting at the last component of a
//!   given kind
//! - **peer id handling**: extract or append a trailing `/p2p/<id>`
//! - **path form**: addresses containing a `unix` component name a filesystem
//!   endpoint and must never be augmented with a trailing peer id
//!
//! The wire rendering of an address is its UTF-8 string form.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::identity::PeerId;

// ============================================================================
// Protocol components
// ============================================================================

/// One typed component of a multiaddress.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Tcp(u16),
    Udp(u16),
    Dns4(String),
    Dns6(String),
    Dnsaddr(String),
    Ws,
    Wss,
    Quic,
    Memory(String),
    P2p(PeerId),
    P2pCircuit,
    Unix(String),
}

impl Protocol {
    /// The protocol tag as it appears in the string form.
    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Ip4(_) => "ip4",
            Protocol::Ip6(_) => "ip6",
            Protocol::Tcp(_) => "tcp",
            Protocol::Udp(_) => "udp",
            Protocol::Dns4(_) => "dns4",
            Protocol::Dns6(_) => "dns6",
            Protocol::Dnsaddr(_) => "dnsaddr",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
            Protocol::Quic => "quic",
            Protocol::Memory(_) => "memory",
            Protocol::P2p(_) => "p2p",
            Protocol::P2pCircuit => "p2p-circuit",
            Protocol::Unix(_) => "unix",
        }
    }

    fn has_argument(&self) -> bool {
        !matches!(self, Protocol::Ws | Protocol::Wss | Protocol::Quic | Protocol::P2pCircuit)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ip4(ip) => write!(f, "/ip4/{ip}"),
            Protocol::Ip6(ip) => write!(f, "/ip6/{ip}"),
            Protocol::Tcp(port) => write!(f, "/tcp/{port}"),
            Protocol::Udp(port) => write!(f, "/udp/{port}"),
            Protocol::Dns4(host) => write!(f, "/dns4/{host}"),
            Protocol::Dns6(host) => write!(f, "/dns6/{host}"),
            Protocol::Dnsaddr(host) => write!(f, "/dnsaddr/{host}"),
            Protocol::Ws => write!(f, "/ws"),
            Protocol::Wss => write!(f, "/wss"),
            Protocol::Quic => write!(f, "/quic"),
            Protocol::Memory(name) => write!(f, "/memory/{name}"),
            Protocol::P2p(id) => write!(f, "/p2p/{id}"),
            Protocol::P2pCircuit => write!(f, "/p2p-circuit"),
            Protocol::Unix(path) => write!(f, "/unix/{path}"),
        }
    }
}

// ============================================================================
// Multiaddr
// ============================================================================

/// An ordered sequence of protocol components.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Multiaddr {
    components: Vec<Protocol>,
}

impl Multiaddr {
    /// The empty address.
    pub fn empty() -> Self {
        Self { components: Vec::new() }
    }

    /// Components in order.
    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.components.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Append a single component.
    pub fn push(&mut self, p: Protocol) {
        self.components.push(p);
    }

    /// Return a new address with `suffix` appended.
    pub fn encapsulate(&self, suffix: &Multiaddr) -> Multiaddr {
        let mut components = self.components.clone();
        components.extend(suffix.components.iter().cloned());
        Multiaddr { components }
    }

    /// Return a new address with the suffix starting at the *last* component
    /// matching `tag` removed. Returns the address unchanged when no
    /// component matches.
    pub fn decapsulate(&self, tag: &str) -> Multiaddr {
        match self.components.iter().rposition(|c| c.tag() == tag) {
            Some(idx) => Multiaddr { components: self.components[..idx].to_vec() },
            None => self.clone(),
        }
    }

    /// The peer id of a trailing `/p2p` component, if present.
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self.components.last() {
            Some(Protocol::P2p(id)) => Some(id),
            _ => None,
        }
    }

    /// True when this address names a filesystem endpoint (`unix` component).
    /// Path-form addresses must not be augmented with a trailing peer id.
    pub fn is_path_form(&self) -> bool {
        self.components.iter().any(|c| matches!(c, Protocol::Unix(_)))
    }

    /// Return this address with a trailing `/p2p/<peer>` appended.
    ///
    /// Leaves the address untouched when it already ends with the same peer
    /// id or is in path form.
    ///
    /// # Errors
    /// `ErrInvalidParameters` when the address already carries a *different*
    /// trailing peer id.
    pub fn with_peer_id(&self, peer: &PeerId) -> Result<Multiaddr> {
        if self.is_path_form() {
            return Ok(self.clone());
        }
        match self.peer_id() {
            Some(existing) if existing == peer => Ok(self.clone()),
            Some(existing) => Err(Error::invalid_parameters(format!(
                "address carries peer id {} but {} was expected",
                existing.short(),
                peer.short()
            ))),
            None => {
                let mut out = self.clone();
                out.push(Protocol::P2p(peer.clone()));
                Ok(out)
            }
        }
    }

    /// First IP component, if any.
    fn ip(&self) -> Option<IpAddr> {
        self.components.iter().find_map(|c| match c {
            Protocol::Ip4(ip) => Some(IpAddr::V4(*ip)),
            Protocol::Ip6(ip) => Some(IpAddr::V6(*ip)),
            _ => None,
        })
    }

    /// Heuristic publicness used by the default dial-address sorter: DNS
    /// names count as public, IPs are public unless loopback/private/link
    /// local, everything else (memory, unix, circuit) is non-public.
    pub fn is_public(&self) -> bool {
        if self
            .components
            .iter()
            .any(|c| matches!(c, Protocol::Dns4(_) | Protocol::Dns6(_) | Protocol::Dnsaddr(_)))
        {
            return true;
        }
        match self.ip() {
            Some(IpAddr::V4(ip)) => {
                !(ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified())
            }
            Some(IpAddr::V6(ip)) => !(ip.is_loopback() || ip.is_unspecified()),
            None => false,
        }
    }

    /// True when the first component is a `dnsaddr` that a resolver table
    /// may expand recursively.
    pub fn is_dnsaddr(&self) -> bool {
        matches!(self.components.first(), Some(Protocol::Dnsaddr(_)))
    }

    /// Hostname of a leading `dnsaddr` component.
    pub fn dnsaddr_host(&self) -> Option<&str> {
        match self.components.first() {
            Some(Protocol::Dnsaddr(host)) => Some(host),
            _ => None,
        }
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.components {
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiaddr({self})")
    }
}

impl FromStr for Multiaddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Multiaddr> {
        if s.is_empty() {
            return Ok(Multiaddr::empty());
        }
        if !s.starts_with('/') {
            return Err(Error::invalid_parameters("multiaddr must start with '/'"));
        }
        let mut parts = s.split('/').skip(1).peekable();
        let mut components = Vec::new();
        while let Some(tag) = parts.next() {
            if tag.is_empty() {
                return Err(Error::invalid_parameters("empty multiaddr component"));
            }
            let mut arg = || -> Result<&str> {
                parts
                    .next()
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| Error::invalid_parameters(format!("'{tag}' requires an argument")))
            };
            let component = match tag {
                "ip4" => Protocol::Ip4(
                    arg()?.parse().map_err(|_| Error::invalid_parameters("bad ip4 address"))?,
                ),
                "ip6" => Protocol::Ip6(
                    arg()?.parse().map_err(|_| Error::invalid_parameters("bad ip6 address"))?,
                ),
                "tcp" => Protocol::Tcp(
                    arg()?.parse().map_err(|_| Error::invalid_parameters("bad tcp port"))?,
                ),
                "udp" => Protocol::Udp(
                    arg()?.parse().map_err(|_| Error::invalid_parameters("bad udp port"))?,
                ),
                "dns4" => Protocol::Dns4(arg()?.to_string()),
                "dns6" => Protocol::Dns6(arg()?.to_string()),
                "dnsaddr" => Protocol::Dnsaddr(arg()?.to_string()),
                "ws" => Protocol::Ws,
                "wss" => Protocol::Wss,
                "quic" => Protocol::Quic,
                "memory" => Protocol::Memory(arg()?.to_string()),
                "p2p" => Protocol::P2p(arg()?.parse()?),
                "p2p-circuit" => Protocol::P2pCircuit,
                // A unix path swallows the rest of the string.
                "unix" => {
                    let mut path = String::new();
                    for part in parts.by_ref() {
                        if !path.is_empty() {
                            path.push('/');
                        }
                        path.push_str(part);
                    }
                    if path.is_empty() {
                        return Err(Error::invalid_parameters("'unix' requires a path"));
                    }
                    Protocol::Unix(path)
                }
                other => {
                    return Err(Error::invalid_parameters(format!(
                        "unknown multiaddr protocol '{other}'"
                    )));
                }
            };
            debug_assert!(component.has_argument() || component.tag() == tag);
            components.push(component);
        }
        Ok(Multiaddr { components })
    }
}

impl From<Protocol> for Multiaddr {
    fn from(p: Protocol) -> Self {
        Multiaddr { components: vec![p] }
    }
}

impl FromIterator<Protocol> for Multiaddr {
    fn from_iter<T: IntoIterator<Item = Protocol>>(iter: T) -> Self {
        Multiaddr { components: iter.into_iter().collect() }
    }
}

impl Serialize for Multiaddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Multiaddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn parse_and_display_round_trip() {
        for s in [
            "/ip4/127.0.0.1/tcp/4001",
            "/ip6/::1/tcp/4001/ws",
            "/dns4/node.example/tcp/443/wss",
            "/dnsaddr/bootstrap.example",
            "/memory/abc",
            "/ip4/1.2.3.4/udp/4001/quic",
            "/unix/var/run/node.sock",
        ] {
            let addr: Multiaddr = s.parse().expect(s);
            assert_eq!(addr.to_string(), s);
        }
    }

    #[test]
    fn rejects_malformed() {
        assert!("ip4/1.2.3.4".parse::<Multiaddr>().is_err(), "missing leading slash");
        assert!("/ip4".parse::<Multiaddr>().is_err(), "missing argument");
        assert!("/ip4/999.0.0.1".parse::<Multiaddr>().is_err(), "bad ip");
        assert!("/tcp/99999".parse::<Multiaddr>().is_err(), "bad port");
        assert!("/teleport/now".parse::<Multiaddr>().is_err(), "unknown protocol");
    }

    #[test]
    fn encapsulate_and_decapsulate() {
        let base: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        let ws = base.encapsulate(&Multiaddr::from(Protocol::Ws));
        assert_eq!(ws.to_string(), "/ip4/10.0.0.1/tcp/4001/ws");

        assert_eq!(ws.decapsulate("ws"), base);
        assert_eq!(ws.decapsulate("tcp").to_string(), "/ip4/10.0.0.1");
        // No matching component leaves the address unchanged.
        assert_eq!(ws.decapsulate("udp"), ws);
    }

    #[test]
    fn peer_id_append_and_extract() {
        let peer = Keypair::generate().peer_id();
        let addr: Multiaddr = "/memory/abc".parse().unwrap();

        let with = addr.with_peer_id(&peer).unwrap();
        assert_eq!(with.peer_id(), Some(&peer));
        // Idempotent for the same peer.
        assert_eq!(with.with_peer_id(&peer).unwrap(), with);

        // A different trailing peer id is an error.
        let other = Keypair::generate().peer_id();
        assert!(with.with_peer_id(&other).is_err());
    }

    #[test]
    fn path_form_is_never_augmented() {
        let peer = Keypair::generate().peer_id();
        let addr: Multiaddr = "/unix/var/run/node.sock".parse().unwrap();
        assert!(addr.is_path_form());
        assert_eq!(addr.with_peer_id(&peer).unwrap(), addr);
    }

    #[test]
    fn publicness_heuristic() {
        let public: Multiaddr = "/ip4/93.184.216.34/tcp/443".parse().unwrap();
        let private: Multiaddr = "/ip4/192.168.1.10/tcp/4001".parse().unwrap();
        let loopback: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        let dns: Multiaddr = "/dns4/node.example/tcp/443".parse().unwrap();
        let memory: Multiaddr = "/memory/abc".parse().unwrap();

        assert!(public.is_public());
        assert!(dns.is_public());
        assert!(!private.is_public());
        assert!(!loopback.is_public());
        assert!(!memory.is_public());
    }

    #[test]
    fn serde_round_trip() {
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/4001/ws".parse().unwrap();
        let encoded = bincode::serialize(&addr).unwrap();
        let decoded: Multiaddr = bincode::deserialize(&encoded).unwrap();
        assert_eq!(addr, decoded);
    }
}
