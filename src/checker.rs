//! IP admission checks: match table + decision cache + whitelist.
//!
//! [`IpChecker`] answers, per client address, whether the request may
//! proceed. Lookups are memoised in a [`DecisionCache`] keyed by the
//! normalised address string. Rule-set rebuilds swap in a fresh table and
//! a fresh cache together behind one atomic pointer, so concurrent
//! readers never block and never see a cached decision from a previous
//! table after `rebuild` returns.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

use crate::cache::DecisionCache;
use crate::matcher::MatchTable;
use crate::whitelist::Whitelist;

/// Table and cache replaced as one unit on rebuild.
#[derive(Debug)]
struct CheckerState {
    table: MatchTable,
    cache: DecisionCache,
}

/// Thread-safe admission checker over the composed blocklist.
#[derive(Debug)]
pub struct IpChecker {
    state: ArcSwap<CheckerState>,
    whitelist: Whitelist,
}

impl IpChecker {
    /// Build a checker from blocked CIDRs and whitelist entries.
    ///
    /// Malformed entries on either list are logged and skipped, matching
    /// the lenient load behaviour of the blocklist file format.
    pub fn new<S: AsRef<str>>(cidrs: &[S], whitelist_entries: &[S]) -> IpChecker {
        let (whitelist, invalid) = Whitelist::new(whitelist_entries);
        for err in &invalid {
            warn!(entry = %err.entry, reason = %err.reason, "invalid whitelist entry");
        }
        IpChecker {
            state: ArcSwap::from_pointee(build_state(cidrs)),
            whitelist,
        }
    }

    /// Whether a request from `addr` may proceed to the next handler.
    ///
    /// Whitelist dominates: a whitelisted address is allowed no matter
    /// what the blocklist says.
    pub fn allowed(&self, addr: IpAddr) -> bool {
        if self.whitelist.contains(addr) {
            debug!(ip = %addr, "client is whitelisted");
            return true;
        }
        !self.in_ranges(addr)
    }

    /// Whether `addr` falls inside any blocked range, consulting the
    /// decision cache first.
    pub fn in_ranges(&self, addr: IpAddr) -> bool {
        let key = normalised_key(addr);
        let state = self.state.load();
        if let Some(decision) = state.cache.get(&key) {
            return decision;
        }
        let decision = state.table.contains(addr);
        state.cache.insert(&key, decision);
        decision
    }

    /// Atomically replace the match table and discard all cached
    /// decisions. In-flight readers keep the state they already loaded;
    /// every read starting after this returns sees only the new table.
    pub fn rebuild<S: AsRef<str>>(&self, cidrs: &[S]) {
        let old = self.state.swap(Arc::new(build_state(cidrs)));
        let dropped = old.cache.stats();
        info!(
            range_count = cidrs.len(),
            dropped_cache_entries = dropped.entries,
            "IP ranges updated"
        );
    }

    /// Number of prefixes in the current table.
    pub fn prefix_count(&self) -> usize {
        self.state.load().table.len()
    }
}

fn build_state<S: AsRef<str>>(cidrs: &[S]) -> CheckerState {
    let (table, invalid) = MatchTable::build(cidrs);
    for err in &invalid {
        warn!(entry = %err.entry, reason = %err.reason, "invalid CIDR specification");
    }
    CheckerState {
        table,
        cache: DecisionCache::default(),
    }
}

/// Cache key: the string form of the canonical (IPv4-mapped) address.
fn normalised_key(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().to_string(),
        IpAddr::V6(v6) => v6.to_string(),
    }
}
