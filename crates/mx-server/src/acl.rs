//! Connection access control.
//!
//! An ACL file lists the peers allowed to connect, one per line. Each entry
//! is an IP address or `*` for any host. Blank lines and `#` comments are
//! ignored. Local (Unix domain) connections are not subject to the list.
//!
//! ```text
//! # control room
//! 192.168.1.20
//! ::1
//! 127.0.0.1
//! ```

use mx_core::{MxError, MxResult};
use std::net::IpAddr;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
enum AclEntry {
    Any,
    Host(IpAddr),
}

/// Allow-list of peer addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAcl {
    entries: Option<Vec<AclEntry>>,
}

impl ConnectionAcl {
    /// An ACL that admits every peer (no ACL file configured).
    pub fn allow_all() -> Self {
        Self { entries: None }
    }

    /// Parse ACL text.
    pub fn parse(text: &str) -> MxResult<Self> {
        let mut entries = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = match line.split_once('#') {
                Some((before, _)) => before,
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let entry = if line == "*" {
                AclEntry::Any
            } else {
                let addr = line.parse::<IpAddr>().map_err(|_| {
                    MxError::IllegalArgument(format!(
                        "ACL line {}: '{}' is not an IP address or '*'",
                        number + 1,
                        line
                    ))
                })?;
                AclEntry::Host(addr)
            };
            entries.push(entry);
        }
        Ok(Self {
            entries: Some(entries),
        })
    }

    /// Read and parse an ACL file.
    pub fn load(path: &Path) -> MxResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MxError::OperatingSystem(format!("cannot read ACL file {}: {}", path.display(), e))
        })?;
        let acl = Self::parse(&text)?;
        debug!(path = %path.display(), entries = acl.len(), "Loaded connection ACL");
        Ok(acl)
    }

    /// True if `peer` may connect.
    ///
    /// An ACL file with no entries admits nobody over TCP.
    pub fn permits(&self, peer: IpAddr) -> bool {
        match &self.entries {
            None => true,
            Some(entries) => entries.iter().any(|entry| match entry {
                AclEntry::Any => true,
                AclEntry::Host(addr) => *addr == peer || mapped(peer) == Some(*addr),
            }),
        }
    }

    /// Number of entries (0 when every peer is admitted without a list).
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, Vec::len)
    }

    /// True when no list is configured or the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionAcl {
    fn default() -> Self {
        Self::allow_all()
    }
}

// IPv4 peers accepted on a dual-stack socket show up as ::ffff:a.b.c.d.
fn mapped(peer: IpAddr) -> Option<IpAddr> {
    match peer {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
        IpAddr::V4(_) => None,
    }
}
