//! Longest-prefix-match table over mixed IPv4/IPv6 CIDRs.
//!
//! [`MatchTable`] is an immutable binary radix trie keyed on the 128-bit
//! canonical form of an address. IPv4 prefixes are stored in their
//! IPv4-mapped-IPv6 form (`::ffff:a.b.c.d/(96+n)`) and lookups normalise
//! IPv4 inputs the same way, so a client presenting either form of the
//! same address gets the same answer. Updates replace the whole table;
//! there is no in-place mutation.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

/// A blocklist entry that failed to parse. Reported to the caller for
/// logging; never fatal to table construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidEntry {
    pub entry: String,
    pub reason: String,
}

impl std::fmt::Display for InvalidEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid CIDR {:?}: {}", self.entry, self.reason)
    }
}

/// Parse a blocklist entry as either a CIDR or a bare IP address.
///
/// Bare IPv4 addresses become `/32` prefixes, bare IPv6 addresses `/128`.
/// The returned network is masked (host bits zeroed).
pub fn parse_ip_or_cidr(entry: &str) -> Result<IpNet, InvalidEntry> {
    let entry = entry.trim();
    if let Ok(net) = IpNet::from_str(entry) {
        return Ok(net.trunc());
    }
    if let Ok(addr) = entry.parse::<IpAddr>() {
        // A bare address is a host prefix.
        return Ok(IpNet::from(addr));
    }
    Err(InvalidEntry {
        entry: entry.to_string(),
        reason: "not an IP address or CIDR range".to_string(),
    })
}

/// The 128-bit canonical form of an address: IPv6 bits as-is, IPv4 mapped
/// into `::ffff:0:0/96`.
fn canonical_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Canonical prefix of a parsed network: the mapped bits plus the adjusted
/// prefix length (`96 + n` for IPv4 networks).
fn canonical_prefix(net: &IpNet) -> (u128, u8) {
    match net {
        IpNet::V4(v4) => (
            u128::from(v4.network().to_ipv6_mapped()),
            96 + v4.prefix_len(),
        ),
        IpNet::V6(v6) => (u128::from(v6.network()), v6.prefix_len()),
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Node {
    // Child indices into the arena; 0 means "no child" (the root is never
    // a child of anything).
    children: [u32; 2],
    terminal: bool,
}

/// Immutable longest-prefix-match set of IP prefixes.
#[derive(Debug, Clone)]
pub struct MatchTable {
    nodes: Vec<Node>,
    prefixes: usize,
}

impl MatchTable {
    /// Build a table from a list of CIDR/IP strings.
    ///
    /// Malformed entries are skipped and returned for warning-level
    /// logging; construction always succeeds.
    pub fn build<S: AsRef<str>>(entries: &[S]) -> (MatchTable, Vec<InvalidEntry>) {
        let mut table = MatchTable {
            nodes: vec![Node::default()],
            prefixes: 0,
        };
        let mut invalid = Vec::new();
        for entry in entries {
            match parse_ip_or_cidr(entry.as_ref()) {
                Ok(net) => table.insert(&net),
                Err(err) => invalid.push(err),
            }
        }
        (table, invalid)
    }

    /// Number of prefixes stored (distinct masked prefixes, after IPv4
    /// normalisation).
    pub fn len(&self) -> usize {
        self.prefixes
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes == 0
    }

    fn insert(&mut self, net: &IpNet) {
        let (bits, prefix_len) = canonical_prefix(net);
        let mut idx = 0usize;
        for depth in 0..prefix_len {
            let bit = ((bits >> (127 - depth as u32)) & 1) as usize;
            let child = self.nodes[idx].children[bit];
            idx = if child == 0 {
                self.nodes.push(Node::default());
                let new = (self.nodes.len() - 1) as u32;
                self.nodes[idx].children[bit] = new;
                new as usize
            } else {
                child as usize
            };
        }
        if !self.nodes[idx].terminal {
            self.nodes[idx].terminal = true;
            self.prefixes += 1;
        }
    }

    /// Whether any stored prefix covers `addr`.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let bits = canonical_bits(addr);
        let mut idx = 0usize;
        for depth in 0..128u32 {
            if self.nodes[idx].terminal {
                return true;
            }
            let bit = ((bits >> (127 - depth)) & 1) as usize;
            let child = self.nodes[idx].children[bit];
            if child == 0 {
                return false;
            }
            idx = child as usize;
        }
        self.nodes[idx].terminal
    }
}
