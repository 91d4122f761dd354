//! Runtime-mutated blocklist backing the admin API.
//!
//! [`DynamicBlocklist`] is an in-memory set of CIDR strings, keyed
//! exactly (prefix containment is the match table's job). Entries carry
//! first/last observation timestamps. Mutations can optionally be
//! mirrored to a flat file on disk so they survive restarts; the file is
//! the plain union of operator-maintained lines and the dynamic set, one
//! CIDR per line, readable by a `FileFetcher` in another instance.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{DefenderError, Result};

/// Observation timestamps for one dynamic entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicEntry {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PersistState {
    path: PathBuf,
    // Non-comment lines present on disk when persistence was enabled.
    // Always rewritten, so operator-managed content is never lost to an
    // API delete.
    operator_lines: Vec<String>,
}

/// Thread-safe set of CIDR strings mutated at runtime.
#[derive(Debug, Default)]
pub struct DynamicBlocklist {
    entries: RwLock<HashMap<String, DynamicEntry>>,
    persist: RwLock<Option<PersistState>>,
}

impl DynamicBlocklist {
    pub fn new() -> DynamicBlocklist {
        DynamicBlocklist::default()
    }

    /// Mirror every mutation to `path` and seed the in-memory set from
    /// its current CIDR-form lines.
    pub fn enable_file_persistence(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let mut operator_lines = Vec::new();

        if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|source| DefenderError::ReadFailed {
                path: path.clone(),
                source,
            })?;
            let mut entries = self.entries.write().expect("dynamic blocklist lock poisoned");
            let now = Utc::now();
            for raw in contents.lines() {
                let line = raw.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                operator_lines.push(line.to_string());
                // Only CIDR-form lines are API-manageable; bare IPs stay
                // operator-owned.
                if line.contains('/') {
                    entries.entry(line.to_string()).or_insert(DynamicEntry {
                        first_seen: now,
                        last_seen: now,
                    });
                }
            }
            info!(
                file = %path.display(),
                seeded = entries.len(),
                "loaded dynamic blocklist from file"
            );
        }

        *self.persist.write().expect("persist lock poisoned") = Some(PersistState {
            path,
            operator_lines,
        });
        Ok(())
    }

    /// Insert CIDRs. Idempotent per string: re-adding refreshes the
    /// last-seen timestamp. Every input must be in CIDR form.
    ///
    /// On a persistence failure the entries are still present in memory
    /// and the error is returned to the caller.
    pub fn add<S: AsRef<str>>(&self, cidrs: &[S]) -> Result<()> {
        for cidr in cidrs {
            let cidr = cidr.as_ref();
            if !cidr.contains('/') {
                return Err(DefenderError::NotCidr(cidr.to_string()));
            }
        }

        {
            let mut entries = self.entries.write().expect("dynamic blocklist lock poisoned");
            let now = Utc::now();
            for cidr in cidrs {
                entries
                    .entry(cidr.as_ref().to_string())
                    .and_modify(|e| e.last_seen = now)
                    .or_insert(DynamicEntry {
                        first_seen: now,
                        last_seen: now,
                    });
            }
        }
        debug!(count = cidrs.len(), "added CIDRs to dynamic blocklist");
        self.save_to_file()
    }

    /// Remove one CIDR; returns whether it was present.
    ///
    /// As with [`DynamicBlocklist::add`], a persistence failure leaves
    /// the in-memory removal in place; the error then implies the entry
    /// was present and removed.
    pub fn remove(&self, cidr: &str) -> Result<bool> {
        let removed = self
            .entries
            .write()
            .expect("dynamic blocklist lock poisoned")
            .remove(cidr)
            .is_some();
        if !removed {
            return Ok(false);
        }
        info!(cidr, "removed CIDR from dynamic blocklist");
        self.save_to_file()?;
        Ok(true)
    }

    /// Snapshot of the current CIDR strings. Order unspecified.
    pub fn list(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("dynamic blocklist lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Exact-string membership.
    pub fn contains(&self, cidr: &str) -> bool {
        self.entries
            .read()
            .expect("dynamic blocklist lock poisoned")
            .contains_key(cidr)
    }

    /// Observation timestamps for one entry.
    pub fn entry(&self, cidr: &str) -> Option<DynamicEntry> {
        self.entries
            .read()
            .expect("dynamic blocklist lock poisoned")
            .get(cidr)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("dynamic blocklist lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the persistence file atomically (write to a temp file in
    /// the same directory, then rename over the target).
    fn save_to_file(&self) -> Result<()> {
        let persist = self.persist.read().expect("persist lock poisoned");
        let Some(state) = persist.as_ref() else {
            return Ok(());
        };

        let mut lines = state.operator_lines.clone();
        let mut dynamic: Vec<String> = self
            .list()
            .into_iter()
            .filter(|cidr| !state.operator_lines.contains(cidr))
            .collect();
        dynamic.sort();
        lines.extend(dynamic);

        write_atomically(&state.path, &lines).map_err(|source| {
            warn!(file = %state.path.display(), error = %source,
                "failed to persist dynamic blocklist");
            DefenderError::PersistFailed {
                path: state.path.clone(),
                source,
            }
        })
    }
}

fn write_atomically(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    for line in lines {
        writeln!(tmp, "{line}")?;
    }
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
