//! Configuration management
//!
//! Read once at startup; immutable afterwards.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broker::BrokerSettings;
use crate::cache::{default_fingerprint_fields, FingerprintField};
use crate::registry::InterceptionSpec;
use crate::verdict::{Action, PacketVerdict};

pub const CONFIG_PATH: &str = "/etc/appwarden/config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Outbound queue; the inbound queue is the next number up.
    #[serde(default = "default_queue_num")]
    pub queue_num: u16,

    #[serde(default)]
    pub intercept_inbound: bool,

    #[serde(default = "default_true")]
    pub intercept_dns: bool,

    /// Applied on timeout, UI disconnect and shutdown.
    #[serde(default = "default_action")]
    pub default_action: Action,

    /// Let the kernel accept packets while nobody listens on the queue.
    #[serde(default)]
    pub fail_open: bool,

    #[serde(default = "default_prompt_timeout_secs")]
    pub prompt_timeout_secs: u64,

    #[serde(default = "default_max_hold_ms")]
    pub max_hold_ms: u64,

    #[serde(default = "default_verdict_ttl_secs")]
    pub default_verdict_ttl_secs: u64,

    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,

    #[serde(default = "default_fingerprint_fields")]
    pub fingerprint: Vec<FingerprintField>,

    #[serde(default = "default_ui_socket")]
    pub ui_socket: PathBuf,

    #[serde(default = "default_rules_path")]
    pub rules_path: PathBuf,

    #[serde(default = "default_mangle_table")]
    pub mangle_table: String,

    #[serde(default = "default_filter_table")]
    pub filter_table: String,
}

fn default_queue_num() -> u16 { 1 }
fn default_true() -> bool { true }
fn default_action() -> Action { Action::Deny }
fn default_prompt_timeout_secs() -> u64 { 30 }
fn default_max_hold_ms() -> u64 { 35_000 }
fn default_verdict_ttl_secs() -> u64 { 5 }
fn default_commit_timeout_ms() -> u64 { 2_000 }
fn default_ui_socket() -> PathBuf { PathBuf::from("/var/run/appwarden/appwarden.sock") }
fn default_rules_path() -> PathBuf { PathBuf::from("/etc/appwarden/rules.json") }
fn default_mangle_table() -> String { "mangle".to_string() }
fn default_filter_table() -> String { "filter".to_string() }

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_num: default_queue_num(),
            intercept_inbound: false,
            intercept_dns: true,
            default_action: default_action(),
            fail_open: false,
            prompt_timeout_secs: default_prompt_timeout_secs(),
            max_hold_ms: default_max_hold_ms(),
            default_verdict_ttl_secs: default_verdict_ttl_secs(),
            commit_timeout_ms: default_commit_timeout_ms(),
            fingerprint: default_fingerprint_fields(),
            ui_socket: default_ui_socket(),
            rules_path: default_rules_path(),
            mangle_table: default_mangle_table(),
            filter_table: default_filter_table(),
        }
    }
}

impl Config {
    /// Load from `path`. Anything wrong with the file means defaults.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Self::default();
        }

        // Reject symlinked config files
        if let Ok(metadata) = fs::symlink_metadata(path) {
            if metadata.file_type().is_symlink() {
                warn!("Config file at {} is a symlink, rejecting for security", path.display());
                return Self::default();
            }
        }

        let config = match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => {
                    info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config: {}, using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read config: {}, using defaults", e);
                Self::default()
            }
        };
        config.checked()
    }

    fn checked(mut self) -> Self {
        if self.fingerprint.is_empty() {
            warn!("Empty fingerprint field list, using the default");
            self.fingerprint = default_fingerprint_fields();
        }
        if self.max_hold() < self.prompt_timeout() {
            warn!(
                "max_hold_ms ({:?}) is shorter than the prompt timeout ({:?}); packets will be released before the user answers",
                self.max_hold(),
                self.prompt_timeout()
            );
        }
        if self.fail_open {
            warn!("fail_open is set: traffic passes unfiltered whenever the daemon is not listening");
        }
        self
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    pub fn max_hold(&self) -> Duration {
        Duration::from_millis(self.max_hold_ms)
    }

    pub fn default_verdict_ttl(&self) -> Duration {
        Duration::from_secs(self.default_verdict_ttl_secs)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    /// Verdict for packets still held when `max_hold` runs out.
    pub fn default_packet_verdict(&self) -> PacketVerdict {
        if self.default_action.is_allow() {
            PacketVerdict::Accept
        } else {
            PacketVerdict::Drop
        }
    }

    pub fn interception(&self) -> InterceptionSpec {
        InterceptionSpec {
            mangle_table: self.mangle_table.clone(),
            filter_table: self.filter_table.clone(),
            queue_num: self.queue_num,
            intercept_inbound: self.intercept_inbound,
            intercept_dns: self.intercept_dns,
            fail_open: self.fail_open,
        }
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            prompt_timeout: self.prompt_timeout(),
            default_action: self.default_action,
        }
    }
}
