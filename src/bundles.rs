//! Compiled-in named CIDR bundles.
//!
//! Operators can reference these identifiers anywhere a CIDR is accepted
//! in the static `ranges` config; they expand to the member CIDRs at
//! composition time. The lists are periodically regenerated from the
//! providers' published ranges and checked in, so matching requires no
//! network access at runtime.

use crate::error::{DefenderError, Result};
use crate::matcher::parse_ip_or_cidr;

/// Egress ranges published for OpenAI crawlers (GPTBot and friends).
static OPENAI: &[&str] = &[
    "20.171.206.0/24",
    "20.171.207.0/24",
    "40.84.180.0/22",
    "52.230.152.0/24",
    "52.233.106.0/24",
    "104.210.140.0/24",
    "172.182.192.0/22",
];

static DEEPSEEK: &[&str] = &[
    "1.94.0.0/16",
    "36.110.0.0/16",
    "101.200.0.0/15",
    "111.206.0.0/16",
    "123.125.0.0/16",
];

static GITHUB_COPILOT: &[&str] = &[
    "20.33.0.0/16",
    "140.82.112.0/20",
    "143.55.64.0/20",
    "185.199.108.0/22",
    "192.30.252.0/22",
];

static AZURE_PUBLIC_CLOUD: &[&str] = &[
    "13.64.0.0/11",
    "20.33.0.0/16",
    "20.34.0.0/15",
    "40.74.0.0/15",
    "52.224.0.0/11",
    "104.208.0.0/13",
];

static AWS: &[&str] = &[
    "3.0.0.0/9",
    "13.32.0.0/15",
    "18.32.0.0/11",
    "35.152.0.0/13",
    "52.0.0.0/10",
    "54.64.0.0/11",
    "99.77.128.0/17",
];

static HUAWEI: &[&str] = &[
    "49.4.0.0/14",
    "114.115.128.0/17",
    "119.3.0.0/16",
    "121.36.0.0/14",
    "159.138.0.0/16",
];

/// RFC 1918, loopback, link-local, CGN, and their IPv6 counterparts.
static PRIVATE: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "100.64.0.0/10",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

static BUNDLES: &[(&str, &[&str])] = &[
    ("openai", OPENAI),
    ("deepseek", DEEPSEEK),
    ("githubcopilot", GITHUB_COPILOT),
    ("azurepubliccloud", AZURE_PUBLIC_CLOUD),
    ("aws", AWS),
    ("huawei", HUAWEI),
    ("private", PRIVATE),
];

/// Resolve a bundle identifier to its member CIDRs.
pub fn resolve(name: &str) -> Option<&'static [&'static str]> {
    let name = name.trim().to_ascii_lowercase();
    BUNDLES
        .iter()
        .find(|(id, _)| *id == name)
        .map(|(_, cidrs)| *cidrs)
}

/// All bundle identifiers, for diagnostics.
pub fn names() -> Vec<&'static str> {
    BUNDLES.iter().map(|(id, _)| *id).collect()
}

/// Expand a mixed list of bundle identifiers and literal CIDRs/IPs into
/// literal entries, validating as it goes.
///
/// Unknown identifiers and malformed CIDRs are load-time errors, never
/// silently ignored.
pub fn expand_ranges<S: AsRef<str>>(ranges: &[S]) -> Result<Vec<String>> {
    let mut expanded = Vec::new();
    for range in ranges {
        let range = range.as_ref();
        if let Some(cidrs) = resolve(range) {
            expanded.extend(cidrs.iter().map(|c| c.to_string()));
            continue;
        }
        match parse_ip_or_cidr(range) {
            Ok(_) => expanded.push(range.trim().to_string()),
            Err(_) => return Err(DefenderError::InvalidRange(range.to_string())),
        }
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_bundles_resolve() {
        for name in names() {
            let cidrs = resolve(name).unwrap();
            assert!(!cidrs.is_empty(), "bundle {name} is empty");
            for cidr in cidrs {
                parse_ip_or_cidr(cidr).unwrap_or_else(|e| panic!("bundle {name}: {e}"));
            }
        }
    }

    #[test]
    fn resolution_is_case_insensitive() {
        assert!(resolve("OpenAI").is_some());
        assert!(resolve(" openai ").is_some());
    }

    #[test]
    fn unknown_name_is_none() {
        assert!(resolve("closedai").is_none());
    }

    #[test]
    fn expand_mixes_bundles_and_literals() {
        let ranges = vec!["private".to_string(), "203.0.113.0/24".to_string()];
        let expanded = expand_ranges(&ranges).unwrap();
        assert!(expanded.contains(&"10.0.0.0/8".to_string()));
        assert!(expanded.contains(&"203.0.113.0/24".to_string()));
    }

    #[test]
    fn unknown_identifier_is_an_error() {
        let ranges = vec!["not-a-bundle".to_string()];
        assert!(matches!(
            expand_ranges(&ranges),
            Err(DefenderError::InvalidRange(_))
        ));
    }
}
