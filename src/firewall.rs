//! The daemon's top-level context: one packet in, one verdict out.
//!
//! Owns the shared state (rules, verdict cache, DNS names, pending
//! decisions) and runs each queued packet through parse, attribution, rule
//! evaluation, the decision broker and enforcement.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::broker::{DecisionBroker, DecisionSource};
use crate::cache::{Fingerprinter, Origin, VerdictCache};
use crate::connection::{ConnectionDescriptor, Direction, ProcessInfo, Protocol};
use crate::enforcer::VerdictEnforcer;
use crate::error::Result;
use crate::interceptor::{packet, DnsCache, PacketHandler};
use crate::process::Attributor;
use crate::protocol::{ConnectionEvent, StatsData};
use crate::rules::{Evaluation, RuleEngine, UserRule};
use crate::verdict::{PacketVerdict, Verdict};

const DNS_PORT: u16 = 53;
const EVENT_BUFFER: usize = 256;

/// Outcome of one packet.
pub struct Handled {
    pub verdict: PacketVerdict,
    pub install: Option<JoinHandle<()>>,
}

impl Handled {
    fn accept() -> Self {
        Self {
            verdict: PacketVerdict::Accept,
            install: None,
        }
    }
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
}

pub struct Firewall {
    rules: Arc<RuleEngine>,
    cache: Arc<VerdictCache>,
    fingerprinter: Fingerprinter,
    dns: Arc<DnsCache>,
    attributor: Arc<dyn Attributor>,
    broker: Arc<DecisionBroker>,
    enforcer: Arc<VerdictEnforcer>,
    counters: Counters,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Firewall {
    pub fn new(
        rules: Arc<RuleEngine>,
        cache: Arc<VerdictCache>,
        fingerprinter: Fingerprinter,
        dns: Arc<DnsCache>,
        attributor: Arc<dyn Attributor>,
        broker: Arc<DecisionBroker>,
        enforcer: Arc<VerdictEnforcer>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            rules,
            cache,
            fingerprinter,
            dns,
            attributor,
            broker,
            enforcer,
            counters: Counters::default(),
            events,
        }
    }

    pub async fn process(&self, direction: Direction, payload: &[u8]) -> Handled {
        let Some(parsed) = packet::parse(payload, direction) else {
            // Not TCP/UDP (or not IP at all): nothing to attribute.
            return Handled::accept();
        };
        let mut desc = parsed.descriptor;

        if direction == Direction::Inbound && desc.protocol == Protocol::Udp && desc.src_port == DNS_PORT {
            let names = self.dns.record_response(parsed.transport_payload);
            if names > 0 {
                debug!("Learned {} address(es) from DNS response", names);
            }
            return Handled::accept();
        }

        let host = self.dns.lookup(&desc.remote().0);
        desc = desc.with_host(host);
        let process = self.attribute(&desc).await;
        let desc = Arc::new(desc.with_process(process));
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let key = self.fingerprinter.fingerprint(&desc);
        let (verdict, decided_by) = match self.rules.evaluate(&desc) {
            Evaluation::Match { rule, verdict } => {
                if verdict.scope.is_durable() {
                    let displaced = self.cache.insert(
                        key.clone(),
                        verdict,
                        Origin::Rule(rule.clone()),
                        Arc::clone(&desc),
                    );
                    if let Some(handle) = displaced {
                        self.enforcer.remove_rules(vec![handle]).await;
                    }
                }
                (verdict, format!("rule:{}", rule))
            }
            Evaluation::NoMatch => {
                let decision = self.broker.decide(key.clone(), Arc::clone(&desc)).await;
                let by = match decision.source {
                    DecisionSource::Cache => "cache",
                    DecisionSource::User => "user",
                    DecisionSource::Default => "default",
                };
                (decision.verdict, by.to_string())
            }
        };

        let enforcement = self.enforcer.enforce(&key, &desc, verdict);
        self.record(&desc, verdict, decided_by);
        Handled {
            verdict: enforcement.packet,
            install: enforcement.install,
        }
    }

    async fn attribute(&self, desc: &ConnectionDescriptor) -> Option<ProcessInfo> {
        let attributor = Arc::clone(&self.attributor);
        let lookup = desc.clone();
        match tokio::task::spawn_blocking(move || attributor.attribute(&lookup)).await {
            Ok(Ok(info)) => Some(info),
            Ok(Err(e)) => {
                debug!("{}: {}", desc, e);
                None
            }
            Err(e) => {
                warn!("Attribution task failed: {}", e);
                None
            }
        }
    }

    fn record(&self, desc: &ConnectionDescriptor, verdict: Verdict, decided_by: String) {
        if verdict.action.is_allow() {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.blocked.fetch_add(1, Ordering::Relaxed);
        }
        debug!("{} -> {} ({})", desc, verdict, decided_by);
        // Nobody listening is fine.
        let _ = self.events.send(ConnectionEvent {
            connection: desc.clone(),
            verdict,
            decided_by,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> StatsData {
        StatsData {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            allowed_connections: self.counters.allowed.load(Ordering::Relaxed),
            blocked_connections: self.counters.blocked.load(Ordering::Relaxed),
            prompted_connections: self.broker.prompts_sent(),
            pending_decisions: self.broker.pending_count() as u64,
            cached_verdicts: self.cache.len() as u64,
            enforcement_failures: self.enforcer.failures(),
        }
    }

    pub fn broker(&self) -> &Arc<DecisionBroker> {
        &self.broker
    }

    pub fn dns(&self) -> &Arc<DnsCache> {
        &self.dns
    }

    pub fn cache(&self) -> &Arc<VerdictCache> {
        &self.cache
    }

    // Rule management. Every mutation drops the cached verdicts it could
    // change, together with their kernel rules.

    pub fn list_rules(&self) -> Vec<UserRule> {
        self.rules.list()
    }

    pub async fn add_rule(&self, rule: UserRule) -> Result<()> {
        self.broker.add_rule(rule).await
    }

    pub async fn update_rule(&self, rule: UserRule) -> Result<()> {
        let operator = rule.operator.clone();
        let old = self.rules.update(rule)?;
        let mut stale = self.cache.invalidate_rule(&old.name);
        stale.extend(self.cache.invalidate_matching(|d| operator.matches(d)));
        info!("Rule {} updated", old.name);
        self.enforcer.remove_rules(stale).await;
        Ok(())
    }

    pub async fn delete_rule(&self, name: &str) -> Result<()> {
        self.rules.remove(name)?;
        let stale = self.cache.invalidate_rule(name);
        info!("Rule {} deleted", name);
        self.enforcer.remove_rules(stale).await;
        Ok(())
    }

    /// A priority change can alter which rule wins for any connection a
    /// rule decided, so all rule-derived verdicts go.
    pub async fn reorder_rule(&self, name: &str, priority: i32) -> Result<()> {
        self.rules.reorder(name, priority)?;
        let stale = self.cache.invalidate_rule_derived();
        info!("Rule {} moved to priority {}", name, priority);
        self.enforcer.remove_rules(stale).await;
        Ok(())
    }

    pub async fn flush_cache(&self) {
        let stale = self.cache.flush();
        info!("Verdict cache flushed");
        self.enforcer.remove_rules(stale).await;
    }
}

#[async_trait]
impl PacketHandler for Firewall {
    async fn handle(&self, direction: Direction, payload: Vec<u8>) -> PacketVerdict {
        // Kernel rule installation carries on in the background.
        self.process(direction, &payload).await.verdict
    }
}
