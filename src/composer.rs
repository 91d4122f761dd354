//! Composition of the effective blocklist from its sources.
//!
//! [`BlocklistComposer`] maintains the union of the static config ranges,
//! the watched blocklist file, and the dynamic admin-mutated set. On any
//! source change it pulls a fresh snapshot from every source, recomputes
//! the union, and rebuilds the shared [`IpChecker`]. Rebuilds are
//! serialised through a mutex so at most one runs at a time; whichever
//! rebuild runs last sees the latest snapshot of every source.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::checker::IpChecker;
use crate::sources::dynamic::DynamicBlocklist;
use crate::sources::file::FileFetcher;

/// Per-source entry counts for the admin stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceCounts {
    pub configured_ranges: usize,
    pub file_ranges: usize,
    pub dynamic_ranges: usize,
}

impl SourceCounts {
    pub fn total(&self) -> usize {
        self.configured_ranges + self.file_ranges + self.dynamic_ranges
    }
}

/// Merges blocklist sources and pushes the union into the checker.
pub struct BlocklistComposer {
    static_ranges: Vec<String>,
    file: Option<Arc<FileFetcher>>,
    dynamic: Option<Arc<DynamicBlocklist>>,
    checker: Arc<IpChecker>,
    rebuild_lock: Mutex<()>,
}

impl BlocklistComposer {
    /// Build a composer over pre-expanded static ranges and the optional
    /// file/dynamic sources, and perform the initial rebuild.
    pub fn new(
        static_ranges: Vec<String>,
        file: Option<Arc<FileFetcher>>,
        dynamic: Option<Arc<DynamicBlocklist>>,
        checker: Arc<IpChecker>,
    ) -> Arc<BlocklistComposer> {
        let composer = Arc::new(BlocklistComposer {
            static_ranges,
            file,
            dynamic,
            checker,
            rebuild_lock: Mutex::new(()),
        });
        composer.on_source_change();
        composer
    }

    /// Recompute the union from fresh source snapshots and rebuild the
    /// checker. Called by every source after it has updated its own
    /// state, and safe to call from any thread.
    pub fn on_source_change(&self) {
        let _guard = self.rebuild_lock.lock().expect("rebuild lock poisoned");
        let union = self.union();
        debug!(total = union.len(), "recomposing effective blocklist");
        self.checker.rebuild(&union);
    }

    /// The current effective CIDR list (multiset union; the match table
    /// coalesces overlapping coverage).
    pub fn current(&self) -> Vec<String> {
        self.union()
    }

    pub fn counts(&self) -> SourceCounts {
        SourceCounts {
            configured_ranges: self.static_ranges.len(),
            file_ranges: self.file.as_ref().map_or(0, |f| f.snapshot().len()),
            dynamic_ranges: self.dynamic.as_ref().map_or(0, |d| d.len()),
        }
    }

    fn union(&self) -> Vec<String> {
        let mut union = self.static_ranges.clone();
        if let Some(file) = &self.file {
            union.extend(file.snapshot());
        }
        if let Some(dynamic) = &self.dynamic {
            union.extend(dynamic.list());
        }
        union
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::net::IpAddr;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn checker() -> Arc<IpChecker> {
        Arc::new(IpChecker::new::<String>(&[], &[]))
    }

    #[test]
    fn static_only_union() {
        let checker = checker();
        let composer = BlocklistComposer::new(
            vec!["10.0.0.0/8".to_string()],
            None,
            None,
            Arc::clone(&checker),
        );

        assert_eq!(composer.current(), vec!["10.0.0.0/8"]);
        assert!(!checker.allowed(addr("10.1.2.3")));
        assert!(checker.allowed(addr("11.0.0.1")));
    }

    #[test]
    fn dynamic_mutation_becomes_visible_after_notify() {
        let checker = checker();
        let dynamic = Arc::new(DynamicBlocklist::new());
        let composer = BlocklistComposer::new(
            Vec::new(),
            None,
            Some(Arc::clone(&dynamic)),
            Arc::clone(&checker),
        );

        assert!(checker.allowed(addr("203.0.113.10")));
        dynamic.add(&["203.0.113.0/24"]).unwrap();
        composer.on_source_change();
        assert!(!checker.allowed(addr("203.0.113.10")));

        dynamic.remove("203.0.113.0/24").unwrap();
        composer.on_source_change();
        assert!(checker.allowed(addr("203.0.113.10")));
    }

    #[test]
    fn union_spans_all_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocklist.txt");
        fs::write(&path, "192.168.1.1\n").unwrap();

        let checker = checker();
        let file = FileFetcher::new(&path).unwrap();
        let dynamic = Arc::new(DynamicBlocklist::new());
        dynamic.add(&["203.0.113.0/24"]).unwrap();

        let composer = BlocklistComposer::new(
            vec!["10.0.0.0/8".to_string()],
            Some(file),
            Some(dynamic),
            Arc::clone(&checker),
        );

        let counts = composer.counts();
        assert_eq!(counts.configured_ranges, 1);
        assert_eq!(counts.file_ranges, 1);
        assert_eq!(counts.dynamic_ranges, 1);
        assert_eq!(counts.total(), 3);

        assert!(!checker.allowed(addr("10.1.2.3")));
        assert!(!checker.allowed(addr("192.168.1.1")));
        assert!(!checker.allowed(addr("203.0.113.10")));
        assert!(checker.allowed(addr("8.8.8.8")));
    }
}
