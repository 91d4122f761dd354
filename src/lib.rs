//! IP-based HTTP middleware for blocking or diverting unwelcome clients.
//!
//! This crate provides:
//! - A longest-prefix-match engine over mixed IPv4/IPv6 CIDRs with a
//!   sharded decision cache and lock-free rule-set swaps
//! - Blocklist composition from static config ranges (including named
//!   bundles for well-known cloud/AI address space), a live-reloaded
//!   file on disk, and a runtime-mutable dynamic set
//! - An admin HTTP API for inspecting and mutating the blocklist
//! - Responders for diverted traffic, including a tarpit that slow-feeds
//!   content to occupy the client
//!
//! The typical host embeds a [`Defender`] in front of its handler chain
//! and mounts [`admin::handle_admin`] (or [`admin::run_admin_server`]) on
//! an operator listener.

pub mod admin;
pub mod bundles;
pub mod cache;
pub mod checker;
pub mod composer;
pub mod config;
pub mod error;
pub mod matcher;
pub mod middleware;
pub mod responders;
pub mod sources;
pub mod whitelist;

// Re-exports for convenience.
pub use checker::IpChecker;
pub use composer::BlocklistComposer;
pub use config::{DefenderConfig, ResponderConfig};
pub use error::{DefenderError, Result};
pub use matcher::MatchTable;
pub use middleware::{Decision, Defender};
pub use responders::{BoxBody, Responder};
pub use sources::dynamic::DynamicBlocklist;
pub use sources::file::FileFetcher;
