//! Verdict enforcement: the packet verdict goes back at once; durable
//! verdicts are additionally pinned as kernel rules so matching traffic no
//! longer reaches the queue.
//!
//! A kernel rule must match exactly the traffic its fingerprint covers. When
//! the fingerprint holds a field nft cannot match on, or the process is
//! unknown, the verdict is served from the cache only.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::backend::{MatchSpec, RuleAction, RuleHandle};
use crate::cache::{Fingerprint, Fingerprinter, VerdictCache};
use crate::connection::ConnectionDescriptor;
use crate::error::FirewallError;
use crate::registry::TableRegistry;
use crate::verdict::{PacketVerdict, Verdict};

pub struct Enforcement {
    pub packet: PacketVerdict,
    /// Kernel rule installation running in the background, if one was
    /// started for this verdict.
    pub install: Option<JoinHandle<()>>,
}

pub struct VerdictEnforcer {
    registry: Arc<TableRegistry>,
    cache: Arc<VerdictCache>,
    fingerprinter: Fingerprinter,
    installed: AtomicU64,
    failures: AtomicU64,
}

impl VerdictEnforcer {
    pub fn new(
        registry: Arc<TableRegistry>,
        cache: Arc<VerdictCache>,
        fingerprinter: Fingerprinter,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cache,
            fingerprinter,
            installed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    /// Release verdict for the held packet. For session/always verdicts the
    /// first caller for `key` also starts installing the kernel rule; a
    /// failed install downgrades the cache entry to `once`.
    pub fn enforce(
        self: &Arc<Self>,
        key: &Fingerprint,
        desc: &Arc<ConnectionDescriptor>,
        verdict: Verdict,
    ) -> Enforcement {
        let packet = verdict.packet_verdict();
        if !verdict.scope.is_durable() {
            return Enforcement { packet, install: None };
        }
        let Some(spec) = MatchSpec::for_fingerprint(self.fingerprinter.fields(), desc) else {
            debug!("{} stays in the cache only: no exact kernel match for {}", verdict, key);
            return Enforcement { packet, install: None };
        };
        if !self.cache.claim_kernel_install(key) {
            return Enforcement { packet, install: None };
        }

        let this = Arc::clone(self);
        let key = key.clone();
        let desc = Arc::clone(desc);
        let install = tokio::spawn(async move { this.install(key, desc, spec, verdict).await });
        Enforcement {
            packet,
            install: Some(install),
        }
    }

    async fn install(
        &self,
        key: Fingerprint,
        desc: Arc<ConnectionDescriptor>,
        spec: MatchSpec,
        verdict: Verdict,
    ) {
        let registry = Arc::clone(&self.registry);
        let action = RuleAction::from(verdict.action);
        let direction = desc.direction;

        let result = tokio::task::spawn_blocking(move || {
            registry
                .adapter()
                .with_retry(|_| registry.add_verdict_rule(direction, spec.clone(), action))
        })
        .await
        .unwrap_or_else(|e| Err(FirewallError::commit_failed("verdict rule", e)));

        match result {
            Ok(handle) => {
                self.installed.fetch_add(1, Ordering::Relaxed);
                debug!("Kernel rule {} enforces {} for {}", handle, verdict, desc);
                if let Some(orphan) = self.cache.attach_kernel_rule(&key, handle) {
                    self.remove_rules(vec![orphan]).await;
                }
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Could not install kernel rule for {} ({}); verdict downgraded to once",
                    desc, e
                );
                self.cache.downgrade(&key);
            }
        }
    }

    /// Remove kernel rules whose cache entries were invalidated.
    pub async fn remove_rules(&self, handles: Vec<RuleHandle>) {
        if handles.is_empty() {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let result = tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            for handle in &handles {
                match registry.remove_rule(handle) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to remove kernel rule {}: {}", handle, e),
                }
            }
            removed
        })
        .await;
        match result {
            Ok(removed) => info!("Removed {} kernel rule(s)", removed),
            Err(e) => warn!("Kernel rule removal task failed: {}", e),
        }
    }

    pub fn installed(&self) -> u64 {
        self.installed.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
