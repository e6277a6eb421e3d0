//! Channel kinds and the direct-tcpip open payload

use std::fmt;

use crate::error::ProtocolError;

/// Kind of a channel-open request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Interactive shell, exec or subsystem
    Session,
    /// Client-requested TCP tunnel
    DirectTcpip,
    /// Anything the server does not serve (x11, forwarded-tcpip, ...)
    Unknown,
}

impl ChannelKind {
    /// Classify a channel type name
    pub fn classify(name: &str) -> Self {
        match name {
            "session" => Self::Session,
            "direct-tcpip" => Self::DirectTcpip,
            _ => Self::Unknown,
        }
    }
}

/// Destination and originator of a direct-tcpip channel (RFC 4254 §7.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
    pub originator_host: String,
    pub originator_port: u32,
}

impl ForwardTarget {
    /// Build from already-parsed fields
    pub fn new(
        host: impl Into<String>,
        port: u32,
        originator_host: impl Into<String>,
        originator_port: u32,
    ) -> Result<Self, ProtocolError> {
        let port = u16::try_from(port).map_err(|_| ProtocolError::InvalidPort(port))?;
        Ok(Self {
            host: host.into(),
            port,
            originator_host: originator_host.into(),
            originator_port,
        })
    }

    /// `host:port` form for dialing (IPv6 literals are bracketed)
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (from {}:{})",
            self.address(),
            self.originator_host,
            self.originator_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(ChannelKind::classify("session"), ChannelKind::Session);
        assert_eq!(ChannelKind::classify("direct-tcpip"), ChannelKind::DirectTcpip);
        assert_eq!(ChannelKind::classify("x11"), ChannelKind::Unknown);
        assert_eq!(ChannelKind::classify("forwarded-tcpip"), ChannelKind::Unknown);
    }

    #[test]
    fn test_direct_tcpip_target() {
        let target = ForwardTarget::new("example.com", 443, "127.0.0.1", 50022).unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
        assert_eq!(target.originator_host, "127.0.0.1");
        assert_eq!(target.originator_port, 50022);
        assert_eq!(target.address(), "example.com:443");
    }

    #[test]
    fn test_port_out_of_range() {
        assert_eq!(
            ForwardTarget::new("example.com", 70000, "127.0.0.1", 50022),
            Err(ProtocolError::InvalidPort(70000))
        );
    }

    #[test]
    fn test_ipv6_address_is_bracketed() {
        let target = ForwardTarget::new("::1", 8080, "::1", 1).unwrap();
        assert_eq!(target.address(), "[::1]:8080");
    }
}
