//! Decision broker
//!
//! Turns "no rule matched" into at most one outstanding prompt per
//! fingerprint. Every caller for a fingerprint waits on its own one-shot
//! channel; the prompt task resolves them all together, writes the cache,
//! and removes the pending entry while holding the pending-map lock, so a
//! caller either finds the cached verdict or joins the pending entry.
//!
//! Rules enter the engine through [`DecisionBroker::add_rule`], whether they
//! come with a prompt answer or from a UI command, so the cached verdicts a
//! new rule overrides are always dropped along with their kernel rules.

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::cache::{Fingerprint, Origin, VerdictCache};
use crate::connection::ConnectionDescriptor;
use crate::enforcer::VerdictEnforcer;
use crate::error::{FirewallError, Result};
use crate::protocol::{PromptRequest, PromptResponse};
use crate::rules::{RuleEngine, UserRule};
use crate::verdict::{Action, Verdict};

/// The external decision-maker.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Ask about one connection. An error means the UI is unreachable or
    /// went away before answering.
    async fn ask(&self, request: PromptRequest) -> Result<PromptResponse>;

    /// The daemon stopped waiting for `request_id`.
    async fn cancel(&self, request_id: u64);
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub prompt_timeout: Duration,
    pub default_action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Cache,
    User,
    /// Timeout, UI disconnect or shutdown.
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub source: DecisionSource,
}

struct PendingDecision {
    request_id: u64,
    created: Instant,
    deadline: Instant,
    waiters: Vec<oneshot::Sender<Decision>>,
    task: Option<JoinHandle<()>>,
}

pub struct DecisionBroker {
    prompter: Arc<dyn Prompter>,
    cache: Arc<VerdictCache>,
    rules: Arc<RuleEngine>,
    enforcer: Arc<VerdictEnforcer>,
    settings: BrokerSettings,
    pending: Mutex<HashMap<Fingerprint, PendingDecision>>,
    next_request: AtomicU64,
    prompts_sent: AtomicU64,
    shutting_down: AtomicBool,
}

impl DecisionBroker {
    pub fn new(
        prompter: Arc<dyn Prompter>,
        cache: Arc<VerdictCache>,
        rules: Arc<RuleEngine>,
        enforcer: Arc<VerdictEnforcer>,
        settings: BrokerSettings,
    ) -> Self {
        Self {
            prompter,
            cache,
            rules,
            enforcer,
            settings,
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            prompts_sent: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn default_decision(&self) -> Decision {
        Decision {
            verdict: Verdict::once(self.settings.default_action),
            source: DecisionSource::Default,
        }
    }

    /// Resolve a connection no rule matched.
    pub async fn decide(self: &Arc<Self>, key: Fingerprint, desc: Arc<ConnectionDescriptor>) -> Decision {
        if self.shutting_down.load(Ordering::Acquire) {
            return self.default_decision();
        }
        if let Some(verdict) = self.cache.lookup(&key) {
            return Decision {
                verdict,
                source: DecisionSource::Cache,
            };
        }

        let rx = {
            let mut pending = self.pending.lock();
            // `shutdown` sets the flag before draining under this lock.
            if self.shutting_down.load(Ordering::Acquire) {
                return self.default_decision();
            }
            // A resolution may have landed between the lookup and the lock.
            if let Some(verdict) = self.cache.lookup(&key) {
                return Decision {
                    verdict,
                    source: DecisionSource::Cache,
                };
            }
            let (tx, rx) = oneshot::channel();
            match pending.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    debug!("Joining pending decision {} for {}", entry.get().request_id, key);
                    entry.get_mut().waiters.push(tx);
                }
                Entry::Vacant(entry) => {
                    let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
                    let now = Instant::now();
                    let task = tokio::spawn(Arc::clone(self).prompt(request_id, key, desc));
                    entry.insert(PendingDecision {
                        request_id,
                        created: now,
                        deadline: now + self.settings.prompt_timeout,
                        waiters: vec![tx],
                        task: Some(task),
                    });
                }
            }
            rx
        };

        rx.await.unwrap_or_else(|_| self.default_decision())
    }

    async fn prompt(self: Arc<Self>, request_id: u64, key: Fingerprint, desc: Arc<ConnectionDescriptor>) {
        let request = PromptRequest {
            request_id,
            connection: desc.as_ref().clone(),
            suggested_rule: UserRule::suggested(&desc, Action::Allow),
            timeout_secs: self.settings.prompt_timeout.as_secs(),
        };
        self.prompts_sent.fetch_add(1, Ordering::Relaxed);
        info!("Prompting for {} (request {})", desc, request_id);

        let answer = tokio::time::timeout(self.settings.prompt_timeout, self.prompter.ask(request))
            .await
            .unwrap_or(Err(FirewallError::DecisionTimeout(self.settings.prompt_timeout)));
        match answer {
            Ok(response) => self.resolve_user(&key, desc, response).await,
            Err(e @ FirewallError::DecisionTimeout(_)) => {
                info!("Request {}: {}, applying {}", request_id, e, self.settings.default_action);
                self.prompter.cancel(request_id).await;
                self.resolve_default(&key, desc).await;
            }
            Err(e) => {
                info!("No answer for request {}: {}", request_id, e);
                self.resolve_default(&key, desc).await;
            }
        }
    }

    async fn resolve_user(
        &self,
        key: &Fingerprint,
        desc: Arc<ConnectionDescriptor>,
        response: PromptResponse,
    ) {
        let verdict = Verdict::new(response.action, response.scope);
        if let Some(rule) = response.rule {
            if let Err(e) = self.add_rule(rule).await {
                warn!("Rule from prompt not added: {}", e);
            }
        }
        self.resolve(
            key,
            desc,
            Origin::User,
            Decision {
                verdict,
                source: DecisionSource::User,
            },
        )
        .await;
    }

    async fn resolve_default(&self, key: &Fingerprint, desc: Arc<ConnectionDescriptor>) {
        self.resolve(key, desc, Origin::Default, self.default_decision()).await;
    }

    async fn resolve(
        &self,
        key: &Fingerprint,
        desc: Arc<ConnectionDescriptor>,
        origin: Origin,
        decision: Decision,
    ) {
        let (pending, displaced) = {
            let mut pending = self.pending.lock();
            let displaced = self.cache.insert(key.clone(), decision.verdict, origin, desc);
            (pending.remove(key), displaced)
        };
        if let Some(handle) = displaced {
            self.enforcer.remove_rules(vec![handle]).await;
        }
        let Some(pending) = pending else {
            return;
        };
        debug!(
            "Decision {} for {} after {:?}: {} ({} waiter(s))",
            pending.request_id,
            key,
            pending.created.elapsed(),
            decision.verdict,
            pending.waiters.len()
        );
        for waiter in pending.waiters {
            let _ = waiter.send(decision);
        }
    }

    /// Add a rule, dropping the cached verdicts it now decides together
    /// with their kernel rules.
    pub async fn add_rule(&self, rule: UserRule) -> Result<()> {
        let operator = rule.operator.clone();
        let name = rule.name.clone();
        self.rules.add(rule)?;
        let stale = self.cache.invalidate_matching(|d| operator.matches(d));
        info!("Rule {} added ({} kernel rule(s) to drop)", name, stale.len());
        self.enforcer.remove_rules(stale).await;
        Ok(())
    }

    /// Resolve everything outstanding with the default verdict. New calls
    /// get the default without prompting.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            info!("Resolving {} pending decision(s) with the default", drained.len());
        }
        let decision = self.default_decision();
        for (_, pending) in drained {
            if let Some(task) = pending.task {
                task.abort();
            }
            for waiter in pending.waiters {
                let _ = waiter.send(decision);
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Deadline of the pending decision for `key`, if one is outstanding.
    pub fn deadline(&self, key: &Fingerprint) -> Option<Instant> {
        self.pending.lock().get(key).map(|p| p.deadline)
    }

    pub fn prompts_sent(&self) -> u64 {
        self.prompts_sent.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{Hook, MatchSpec, MemoryBackend, RuleAction};
    use crate::cache::Fingerprinter;
    use crate::connection::{sample, sample_process, Direction};
    use crate::registry::tests::installed_registry;
    use crate::registry::TableRegistry;
    use crate::rules::operator::{Operator, PortRange};
    use crate::verdict::Scope;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Copy)]
    pub(crate) enum Behaviour {
        Answer(Action, Scope, Duration),
        Never,
        Disconnect,
    }

    pub(crate) struct FakePrompter {
        pub behaviour: Mutex<Behaviour>,
        pub asks: AtomicUsize,
        pub cancels: AtomicUsize,
        pub with_rule: Mutex<Option<UserRule>>,
    }

    impl FakePrompter {
        pub(crate) fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour: Mutex::new(behaviour),
                asks: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
                with_rule: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl Prompter for FakePrompter {
        async fn ask(&self, request: PromptRequest) -> Result<PromptResponse> {
            self.asks.fetch_add(1, Ordering::SeqCst);
            let behaviour = *self.behaviour.lock();
            match behaviour {
                Behaviour::Answer(action, scope, delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(PromptResponse {
                        request_id: request.request_id,
                        action,
                        scope,
                        rule: self.with_rule.lock().take(),
                    })
                }
                Behaviour::Never => std::future::pending().await,
                Behaviour::Disconnect => Err(FirewallError::Prompt("UI disconnected".into())),
            }
        }

        async fn cancel(&self, _request_id: u64) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        broker: Arc<DecisionBroker>,
        cache: Arc<VerdictCache>,
        rules: Arc<RuleEngine>,
        backend: Arc<MemoryBackend>,
        registry: Arc<TableRegistry>,
    }

    fn harness(prompter: Arc<FakePrompter>) -> Harness {
        let (backend, registry) = installed_registry();
        let cache = Arc::new(VerdictCache::new(Duration::from_secs(5)));
        let rules = Arc::new(RuleEngine::new());
        let enforcer = VerdictEnforcer::new(registry.clone(), cache.clone(), Fingerprinter::default());
        let broker = Arc::new(DecisionBroker::new(
            prompter,
            cache.clone(),
            rules.clone(),
            enforcer,
            BrokerSettings {
                prompt_timeout: Duration::from_secs(30),
                default_action: Action::Deny,
            },
        ));
        Harness {
            broker,
            cache,
            rules,
            backend,
            registry,
        }
    }

    fn broker(prompter: Arc<FakePrompter>) -> (Arc<DecisionBroker>, Arc<VerdictCache>, Arc<RuleEngine>) {
        let h = harness(prompter);
        (h.broker, h.cache, h.rules)
    }

    fn key_of(port: u16) -> (Fingerprint, Arc<ConnectionDescriptor>) {
        let desc = sample(port);
        (Fingerprinter::default().fingerprint(&desc), Arc::new(desc))
    }

    fn curl_key(port: u16) -> (Fingerprint, Arc<ConnectionDescriptor>) {
        let desc = sample(port).with_process(Some(sample_process("/usr/bin/curl")));
        (Fingerprinter::default().fingerprint(&desc), Arc::new(desc))
    }

    /// Cache `verdict` for `desc` with a kernel rule behind it.
    fn pin(h: &Harness, key: &Fingerprint, desc: &Arc<ConnectionDescriptor>, verdict: Verdict) {
        h.cache.insert(key.clone(), verdict, Origin::User, desc.clone());
        assert!(h.cache.claim_kernel_install(key));
        let spec = MatchSpec {
            protocol: Some(desc.protocol),
            dst_addr: Some(desc.dst_ip),
            dst_port: Some(desc.dst_port),
            uid: desc.process.as_ref().map(|p| p.uid),
            ..Default::default()
        };
        let handle = h
            .registry
            .add_verdict_rule(Direction::Outbound, spec, RuleAction::from(verdict.action))
            .unwrap();
        assert_eq!(h.cache.attach_kernel_rule(key, handle), None);
    }

    fn queued(action: Option<RuleAction>) -> bool {
        matches!(action, Some(RuleAction::Queue { .. }))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_prompt() {
        let prompter = FakePrompter::new(Behaviour::Answer(
            Action::Allow,
            Scope::Session,
            Duration::from_millis(50),
        ));
        let (broker, cache, _) = broker(prompter.clone());
        let (key, desc) = key_of(443);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let broker = broker.clone();
            let key = key.clone();
            let desc = desc.clone();
            handles.push(tokio::spawn(async move { broker.decide(key, desc).await }));
        }
        for handle in handles {
            let decision = handle.await.unwrap();
            assert_eq!(decision.verdict, Verdict::new(Action::Allow, Scope::Session));
            assert_eq!(decision.source, DecisionSource::User);
        }

        assert_eq!(prompter.asks.load(Ordering::SeqCst), 1);
        assert_eq!(broker.pending_count(), 0);
        assert!(cache.lookup(&key).is_some());

        let again = broker.decide(key, desc).await;
        assert_eq!(again.source, DecisionSource::Cache);
        assert_eq!(prompter.asks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_applies_default_to_every_waiter() {
        let prompter = FakePrompter::new(Behaviour::Never);
        let (broker, cache, _) = broker(prompter.clone());
        let (key, desc) = key_of(22);

        let a = tokio::spawn({
            let (broker, key, desc) = (broker.clone(), key.clone(), desc.clone());
            async move { broker.decide(key, desc).await }
        });
        let b = tokio::spawn({
            let (broker, key, desc) = (broker.clone(), key.clone(), desc.clone());
            async move { broker.decide(key, desc).await }
        });
        let expected = Decision {
            verdict: Verdict::once(Action::Deny),
            source: DecisionSource::Default,
        };
        assert_eq!(a.await.unwrap(), expected);
        assert_eq!(b.await.unwrap(), expected);

        assert_eq!(broker.pending_count(), 0);
        assert_eq!(prompter.asks.load(Ordering::SeqCst), 1);
        assert_eq!(prompter.cancels.load(Ordering::SeqCst), 1);
        // Short-lived: a retry burst does not re-prompt right away.
        assert_eq!(cache.lookup(&key), Some(Verdict::once(Action::Deny)));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_treated_like_a_timeout() {
        let prompter = FakePrompter::new(Behaviour::Disconnect);
        let (broker, _, _) = broker(prompter.clone());
        let (key, desc) = key_of(22);

        let decision = broker.decide(key, desc).await;
        assert_eq!(decision.source, DecisionSource::Default);
        assert_eq!(decision.verdict.action, Action::Deny);
        assert_eq!(prompter.cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deny_once_prompts_again_next_time() {
        let prompter = FakePrompter::new(Behaviour::Answer(Action::Deny, Scope::Once, Duration::ZERO));
        let (broker, cache, _) = broker(prompter.clone());
        let (key, desc) = key_of(22);

        let first = broker.decide(key.clone(), desc.clone()).await;
        assert_eq!(first.verdict, Verdict::once(Action::Deny));
        assert_eq!(cache.entry(&key).unwrap().scope(), Scope::Once);

        broker.decide(key, desc).await;
        assert_eq!(prompter.asks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_waiters_with_the_default() {
        let prompter = FakePrompter::new(Behaviour::Never);
        let (broker, _, _) = broker(prompter.clone());
        let (key, desc) = key_of(22);

        let waiting = tokio::spawn({
            let broker = broker.clone();
            async move { broker.decide(key, desc).await }
        });
        while prompter.asks.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        broker.shutdown();

        assert_eq!(waiting.await.unwrap().source, DecisionSource::Default);
        assert_eq!(broker.pending_count(), 0);
        let (key, desc) = key_of(80);
        assert_eq!(broker.decide(key, desc).await.source, DecisionSource::Default);
        assert_eq!(prompter.asks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rule_sent_with_the_answer_is_added() {
        let prompter = FakePrompter::new(Behaviour::Answer(Action::Allow, Scope::Always, Duration::ZERO));
        let (key, desc) = key_of(443);
        *prompter.with_rule.lock() = Some(UserRule::suggested(&desc, Action::Allow));
        let (broker, _, rules) = broker(prompter);

        broker.decide(key, desc).await;
        assert_eq!(rules.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rule_from_an_answer_overrides_remembered_verdicts() {
        let prompter = FakePrompter::new(Behaviour::Answer(Action::Deny, Scope::Once, Duration::ZERO));
        let h = harness(prompter.clone());
        let (earlier_key, earlier) = curl_key(8443);
        pin(&h, &earlier_key, &earlier, Verdict::new(Action::Allow, Scope::Always));
        assert_eq!(h.backend.classify(Hook::Output, &earlier), Some(RuleAction::Accept));

        *prompter.with_rule.lock() = Some(UserRule::new(
            "no-8443",
            0,
            Operator::DestPort(PortRange::single(8443)),
            Action::Deny,
        ));
        let (key, desc) = key_of(8443);
        h.broker.decide(key, desc).await;

        assert_eq!(h.rules.len(), 1);
        assert!(h.cache.entry(&earlier_key).is_none());
        assert!(queued(h.backend.classify(Hook::Output, &earlier)));
    }

    #[tokio::test(start_paused = true)]
    async fn displaced_kernel_rule_is_removed() {
        let prompter = FakePrompter::new(Behaviour::Answer(
            Action::Deny,
            Scope::Session,
            Duration::from_millis(50),
        ));
        let h = harness(prompter.clone());
        let baseline = h.registry.owned_rule_count();
        let (key, desc) = curl_key(8443);

        let deciding = tokio::spawn({
            let (broker, key, desc) = (h.broker.clone(), key.clone(), desc.clone());
            async move { broker.decide(key, desc).await }
        });
        while prompter.asks.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        // A verdict for the same fingerprint lands while the prompt is open.
        pin(&h, &key, &desc, Verdict::new(Action::Allow, Scope::Always));
        assert_eq!(h.registry.owned_rule_count(), baseline + 1);

        let decision = deciding.await.unwrap();
        assert_eq!(decision.verdict, Verdict::new(Action::Deny, Scope::Session));
        assert_eq!(h.registry.owned_rule_count(), baseline);
        assert!(queued(h.backend.classify(Hook::Output, &desc)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_racing_new_decisions_leaves_nothing_pending() {
        let prompter = FakePrompter::new(Behaviour::Never);
        let (broker, _, _) = broker(prompter);

        let mut handles = Vec::new();
        for port in 1000..1200 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                let (key, desc) = key_of(port);
                broker.decide(key, desc).await
            }));
        }
        broker.shutdown();

        for handle in handles {
            let decision = tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("decision left pending after shutdown")
                .unwrap();
            assert_eq!(decision.source, DecisionSource::Default);
        }
        assert_eq!(broker.pending_count(), 0);
    }
}
