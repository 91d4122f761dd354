//! Allow-list of literal addresses and CIDRs.
//!
//! Whitelisted clients bypass the blocklist entirely, whatever the
//! composed rule set says.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::matcher::{parse_ip_or_cidr, InvalidEntry};

/// Small allow set consulted before the blocklist.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    nets: Vec<IpNet>,
}

impl Whitelist {
    /// Parse whitelist entries (bare IPs or CIDRs).
    ///
    /// Unparseable entries are skipped and returned so the caller can log
    /// them; a bad entry never disables the rest of the whitelist.
    pub fn new<S: AsRef<str>>(entries: &[S]) -> (Whitelist, Vec<InvalidEntry>) {
        let mut nets = Vec::new();
        let mut invalid = Vec::new();
        for entry in entries {
            match parse_ip_or_cidr(entry.as_ref()) {
                Ok(net) => nets.push(net),
                Err(err) => invalid.push(err),
            }
        }
        (Whitelist { nets }, invalid)
    }

    /// Whether `addr` is whitelisted. IPv4-mapped IPv6 clients match
    /// whitelist entries written as plain IPv4 and vice versa.
    pub fn contains(&self, addr: IpAddr) -> bool {
        if self.nets.is_empty() {
            return false;
        }
        let unmapped = unmap(addr);
        self.nets
            .iter()
            .any(|net| net.contains(&addr) || net.contains(&unmapped))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }
}

/// Reduce an IPv4-mapped IPv6 address to its IPv4 form; other addresses
/// pass through unchanged.
fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelist(entries: &[&str]) -> Whitelist {
        let entries: Vec<String> = entries.iter().map(|s| s.to_string()).collect();
        let (wl, invalid) = Whitelist::new(&entries);
        assert!(invalid.is_empty(), "unexpected parse errors: {invalid:?}");
        wl
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn literal_and_cidr_entries() {
        let wl = whitelist(&["203.0.113.7", "10.0.0.0/8", "2001:db8::/32"]);
        assert!(wl.contains(addr("203.0.113.7")));
        assert!(!wl.contains(addr("203.0.113.8")));
        assert!(wl.contains(addr("10.55.0.1")));
        assert!(wl.contains(addr("2001:db8:1::9")));
        assert!(!wl.contains(addr("2001:db9::9")));
    }

    #[test]
    fn mapped_client_matches_v4_entry() {
        let wl = whitelist(&["192.168.1.0/24"]);
        assert!(wl.contains(addr("::ffff:192.168.1.10")));
    }

    #[test]
    fn invalid_entries_skipped() {
        let entries = vec!["not-an-ip".to_string(), "10.0.0.1".to_string()];
        let (wl, invalid) = Whitelist::new(&entries);
        assert_eq!(invalid.len(), 1);
        assert_eq!(wl.len(), 1);
        assert!(wl.contains(addr("10.0.0.1")));
    }

    #[test]
    fn empty_whitelist_matches_nothing() {
        let wl = Whitelist::default();
        assert!(!wl.contains(addr("127.0.0.1")));
    }
}
