//! Middleware configuration and load-time validation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bundles;
use crate::error::{DefenderError, Result};
use crate::responders::tarpit::TarpitConfig;

/// Configuration for one defender instance.
///
/// `ranges` mixes literal CIDRs/IPs with named bundle identifiers (see
/// [`crate::bundles`]). `blocklist_file` points at a watched text file of
/// additional entries. At least one of the two must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefenderConfig {
    #[serde(default)]
    pub ranges: Vec<String>,

    #[serde(default)]
    pub blocklist_file: Option<PathBuf>,

    /// Addresses and CIDRs that are always allowed through.
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Whether the admin API may mutate a runtime blocklist.
    #[serde(default = "default_true")]
    pub dynamic_blocklist: bool,

    /// When set, dynamic mutations are mirrored to this file and reloaded
    /// from it on startup.
    #[serde(default)]
    pub persist_dynamic_to: Option<PathBuf>,

    pub responder: ResponderConfig,
}

/// Which responder handles diverted requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResponderConfig {
    /// 403 with a fixed denial body.
    Block,
    /// Fixed message with a configurable status code (200 when unset).
    Custom {
        message: String,
        #[serde(default = "default_custom_status")]
        status: u16,
    },
    /// Slow-stream content to occupy the client.
    Tarpit(TarpitConfig),
}

fn default_true() -> bool {
    true
}

fn default_custom_status() -> u16 {
    200
}

impl DefenderConfig {
    /// Validate the configuration and expand bundle identifiers.
    ///
    /// Returns the expanded static ranges. All failures here abort
    /// startup: an unknown bundle name, a malformed CIDR, or no range
    /// source at all.
    pub fn validate(&self) -> Result<Vec<String>> {
        if self.ranges.is_empty() && self.blocklist_file.is_none() {
            return Err(DefenderError::InvalidRange(
                "either `ranges` or `blocklist_file` must be configured".to_string(),
            ));
        }
        if let Some(path) = &self.blocklist_file {
            if path.as_os_str().is_empty() {
                return Err(DefenderError::EmptyPath);
            }
        }
        if let ResponderConfig::Tarpit(tarpit) = &self.responder {
            tarpit.validate()?;
        }
        bundles::expand_ranges(&self.ranges)
    }
}
