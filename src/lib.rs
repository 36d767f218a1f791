//! appwarden - application firewall core
//!
//! Intercepts new connections through a netfilter queue, attributes them to
//! the owning process, evaluates user rules, asks the UI when nothing
//! matched, and pins durable verdicts as nftables rules.

pub mod backend;
pub mod broker;
pub mod cache;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod enforcer;
pub mod error;
pub mod firewall;
pub mod interceptor;
pub mod proc_parser;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod rules;
pub mod ui;
pub mod verdict;

pub use error::{FirewallError, Result};
