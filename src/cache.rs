//! Verdict cache and connection fingerprints.

use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::RuleHandle;
use crate::connection::ConnectionDescriptor;
use crate::verdict::{Scope, Verdict};

/// Descriptor fields a fingerprint can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintField {
    ProcessPath,
    UserId,
    Protocol,
    DestIp,
    DestHost,
    DestPort,
    Direction,
}

pub fn default_fingerprint_fields() -> Vec<FingerprintField> {
    vec![
        FingerprintField::ProcessPath,
        FingerprintField::Protocol,
        FingerprintField::DestIp,
        FingerprintField::DestPort,
    ]
}

/// Key summarising the attributes decisions are shared across.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Fingerprinter {
    fields: Vec<FingerprintField>,
}

impl Fingerprinter {
    pub fn new(fields: Vec<FingerprintField>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FingerprintField] {
        &self.fields
    }

    /// Fields that need a process are recorded as `?` when attribution
    /// failed, so unattributed traffic groups by network attributes alone.
    pub fn fingerprint(&self, desc: &ConnectionDescriptor) -> Fingerprint {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|field| match field {
                FingerprintField::ProcessPath => desc.process_path().unwrap_or("?").to_string(),
                FingerprintField::UserId => desc
                    .process
                    .as_ref()
                    .map_or_else(|| "?".to_string(), |p| p.uid.to_string()),
                FingerprintField::Protocol => desc.protocol.to_string(),
                FingerprintField::DestIp => desc.remote().0.to_string(),
                FingerprintField::DestHost => desc.dst_host.clone().unwrap_or_default(),
                FingerprintField::DestPort => desc.dst_port.to_string(),
                FingerprintField::Direction => format!("{:?}", desc.direction).to_lowercase(),
            })
            .collect();
        Fingerprint(parts.join("|"))
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(default_fingerprint_fields())
    }
}

/// Where a cached verdict came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    User,
    Rule(String),
    /// Timeout or UI disconnect: not the user's choice.
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelRule {
    None,
    /// An install has been claimed and is in progress.
    Pending,
    Installed(RuleHandle),
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub verdict: Verdict,
    pub origin: Origin,
    pub created: Instant,
    /// `None` never expires.
    pub expires_at: Option<Instant>,
    pub descriptor: Arc<ConnectionDescriptor>,
    pub kernel: KernelRule,
}

impl CacheEntry {
    pub fn scope(&self) -> Scope {
        self.verdict.scope
    }

    pub fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

pub struct VerdictCache {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
    default_ttl: Duration,
}

impl VerdictCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Record a verdict. A `once` entry is kept for bookkeeping but never
    /// served; session and always entries do not expire.
    ///
    /// Re-recording the same durable verdict keeps the entry (and its kernel
    /// rule). Otherwise a kernel rule of the replaced entry is returned for
    /// removal.
    pub fn insert(
        &self,
        key: Fingerprint,
        verdict: Verdict,
        origin: Origin,
        descriptor: Arc<ConnectionDescriptor>,
    ) -> Option<RuleHandle> {
        let now = Instant::now();
        let expires_at = match (&origin, verdict.scope) {
            (Origin::Default, _) => Some(now + self.default_ttl),
            (_, Scope::Once) => Some(now),
            _ => None,
        };

        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            if existing.verdict == verdict && existing.origin == origin && expires_at.is_none() {
                return None;
            }
        }
        debug!("Cache {} -> {} (expires: {:?})", key, verdict, expires_at.map(|e| e - now));
        let replaced = entries.insert(
            key,
            CacheEntry {
                verdict,
                origin,
                created: now,
                expires_at,
                descriptor,
                kernel: KernelRule::None,
            },
        );
        match replaced.map(|e| e.kernel) {
            Some(KernelRule::Installed(handle)) => Some(handle),
            _ => None,
        }
    }

    pub fn lookup(&self, key: &Fingerprint) -> Option<Verdict> {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.verdict)
    }

    pub fn entry(&self, key: &Fingerprint) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Take the right to install the kernel rule for a durable entry. Only
    /// the first caller wins.
    pub fn claim_kernel_install(&self, key: &Fingerprint) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(e) if e.scope().is_durable() && e.kernel == KernelRule::None => {
                e.kernel = KernelRule::Pending;
                true
            }
            _ => false,
        }
    }

    /// Record an installed rule. If the entry vanished meanwhile the handle
    /// is handed back so the caller can remove the now orphaned rule.
    pub fn attach_kernel_rule(&self, key: &Fingerprint, handle: RuleHandle) -> Option<RuleHandle> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(e) if e.kernel == KernelRule::Pending => {
                e.kernel = KernelRule::Installed(handle);
                None
            }
            _ => Some(handle),
        }
    }

    /// The kernel rule for this entry could not be installed: serve it no
    /// longer than a single decision.
    pub fn downgrade(&self, key: &Fingerprint) {
        if let Some(e) = self.entries.write().get_mut(key) {
            e.verdict.scope = Scope::Once;
            e.expires_at = Some(Instant::now());
            e.kernel = KernelRule::None;
        }
    }

    /// Drop entries produced by the named rule. Returns their kernel rules.
    pub fn invalidate_rule(&self, name: &str) -> Vec<RuleHandle> {
        self.invalidate_where(|e| matches!(&e.origin, Origin::Rule(r) if r == name))
    }

    /// Drop every entry produced by a rule, whichever rule it was.
    pub fn invalidate_rule_derived(&self) -> Vec<RuleHandle> {
        self.invalidate_where(|e| matches!(e.origin, Origin::Rule(_)))
    }

    /// Drop entries whose recorded connection satisfies `pred`.
    pub fn invalidate_matching(&self, pred: impl Fn(&ConnectionDescriptor) -> bool) -> Vec<RuleHandle> {
        self.invalidate_where(|e| pred(&e.descriptor))
    }

    pub fn flush(&self) -> Vec<RuleHandle> {
        self.invalidate_where(|_| true)
    }

    /// Forget expired entries.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now) || matches!(e.kernel, KernelRule::Installed(_)));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn invalidate_where(&self, pred: impl Fn(&CacheEntry) -> bool) -> Vec<RuleHandle> {
        let mut removed = Vec::new();
        self.entries.write().retain(|key, e| {
            if !pred(e) {
                return true;
            }
            debug!("Invalidated cached verdict for {}", key);
            if let KernelRule::Installed(handle) = &e.kernel {
                removed.push(handle.clone());
            }
            false
        });
        removed
    }
}
