//! Serialised stage-then-commit access to a filter backend.

use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{
    Batch, ChainRef, ChainSpec, Family, FilterBackend, MatchSpec, OpOutcome, Position,
    RuleAction, RuleHandle, RuleRecord, StagedOp, StagedRule, StagedRuleId, StagedTableId,
    TableHandle, TableKey,
};
use crate::error::{FirewallError, Result};

pub const RULE_TAG_PREFIX: &str = "appwarden";

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

type CommitResult = Result<Vec<OpOutcome>>;

/// Comment prefix of every rule this process stages.
pub fn own_tag_prefix() -> String {
    format!("{}:{}:", RULE_TAG_PREFIX, std::process::id())
}

pub fn is_own_tag(comment: &str) -> bool {
    comment.starts_with(&own_tag_prefix())
}

#[derive(Default)]
struct AdapterState {
    /// A commit that outlived its timeout. The next transaction waits for it
    /// so two batches never reach the kernel interleaved.
    in_flight: Option<Receiver<CommitResult>>,
}

pub struct FilterAdapter {
    backend: Arc<dyn FilterBackend>,
    commit_timeout: Duration,
    state: Mutex<AdapterState>,
    next_tag: AtomicU64,
}

impl FilterAdapter {
    pub fn new(backend: Arc<dyn FilterBackend>, commit_timeout: Duration) -> Self {
        Self {
            backend,
            commit_timeout,
            state: Mutex::new(AdapterState::default()),
            next_tag: AtomicU64::new(1),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Start a transaction. Holds the adapter lock until committed or dropped.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        let mut guard = self.state.lock();
        self.settle_in_flight(&mut guard)?;
        Ok(Transaction {
            adapter: self,
            guard,
            batch: Batch::new(),
        })
    }

    /// Create a table, or attach to it if it already exists with the same
    /// name and family.
    pub fn create_table(&self, name: &str, family: Family) -> Result<TableHandle> {
        let key = TableKey::new(name, family);
        let mut tx = self.begin()?;
        if let Some(existing) = self.find_table_unlocked(&key)? {
            debug!("Attached to existing table {}", key);
            return Ok(existing);
        }
        let staged = tx.create_table(key.clone());
        let receipt = tx.commit()?;
        receipt
            .table(staged)
            .cloned()
            .ok_or_else(|| FirewallError::commit_failed(key.to_string(), "no handle returned"))
    }

    pub fn delete_table(&self, table: &TableHandle) -> Result<()> {
        let mut tx = self.begin()?;
        tx.delete_table(table.key.clone());
        tx.commit().map(|_| ())
    }

    pub fn find_table(&self, key: &TableKey) -> Result<Option<TableHandle>> {
        let _guard = self.state.lock();
        self.find_table_unlocked(key)
    }

    pub fn list_rules_of(&self, table: &TableKey) -> Result<Vec<RuleRecord>> {
        self.backend.list_rules(table)
    }

    pub fn add_rule(
        &self,
        chain: &ChainRef,
        spec: MatchSpec,
        action: RuleAction,
        position: Position,
    ) -> Result<RuleHandle> {
        let mut tx = self.begin()?;
        let staged = tx.add_rule(chain.clone(), spec, action, position);
        let receipt = tx.commit()?;
        receipt
            .rule(staged)
            .cloned()
            .ok_or_else(|| FirewallError::commit_failed(chain.to_string(), "no handle returned"))
    }

    pub fn delete_rule(&self, handle: &RuleHandle) -> Result<()> {
        let mut tx = self.begin()?;
        tx.delete_rule(handle.clone());
        tx.commit().map(|_| ())
    }

    /// Run `op`, retrying with exponential backoff while the backend is
    /// unavailable. Any other error returns immediately.
    pub fn with_retry<T>(&self, mut op: impl FnMut(&Self) -> Result<T>) -> Result<T> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match op(self) {
                Err(e) if e.is_retryable() && attempt < RETRY_ATTEMPTS => {
                    debug!("Backend unavailable (attempt {}), retrying in {:?}", attempt, delay);
                    thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn find_table_unlocked(&self, key: &TableKey) -> Result<Option<TableHandle>> {
        Ok(self
            .backend
            .list_tables()?
            .into_iter()
            .find(|t| &t.key == key))
    }

    fn next_tag(&self) -> String {
        let seq = self.next_tag.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", own_tag_prefix(), seq)
    }

    /// Wait for a commit that outlived its timeout. Its caller was told it
    /// failed, so whatever it created after all is deleted again.
    fn settle_in_flight(&self, state: &mut AdapterState) -> Result<()> {
        let Some(rx) = state.in_flight.take() else {
            return Ok(());
        };
        match rx.recv_timeout(self.commit_timeout) {
            Ok(Ok(outcomes)) => {
                self.roll_back_late(state, outcomes);
                if state.in_flight.is_some() {
                    return Err(FirewallError::BackendUnavailable(
                        "rollback still in flight".to_string(),
                    ));
                }
                Ok(())
            }
            Ok(Err(e)) => {
                debug!("Timed-out commit finished with error: {}", e);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                state.in_flight = Some(rx);
                Err(FirewallError::BackendUnavailable(
                    "previous commit still in flight".to_string(),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => Ok(()),
        }
    }

    fn roll_back_late(&self, state: &mut AdapterState, outcomes: Vec<OpOutcome>) {
        let mut rules = Vec::new();
        let mut tables = Vec::new();
        for outcome in outcomes {
            match outcome {
                OpOutcome::Rule(handle) => rules.push(StagedOp::DeleteRule(handle)),
                OpOutcome::Table(table) => tables.push(StagedOp::DeleteTable(table.key)),
                OpOutcome::Chain(_) | OpOutcome::Removed => {}
            }
        }
        rules.append(&mut tables);
        if rules.is_empty() {
            return;
        }
        let count = rules.len();
        match self.run_commit(state, rules) {
            Ok(_) => info!("Rolled back {} object(s) of a commit that applied late", count),
            Err(e) => warn!("Could not roll back a commit that applied late: {}", e),
        }
    }

    fn run_commit(&self, state: &mut AdapterState, ops: Vec<StagedOp>) -> CommitResult {
        let (tx, rx) = mpsc::channel();
        let backend = Arc::clone(&self.backend);
        thread::Builder::new()
            .name("appwarden-commit".to_string())
            .spawn(move || {
                let _ = tx.send(backend.commit(&ops));
            })
            .map_err(|e| FirewallError::BackendUnavailable(format!("spawn commit: {}", e)))?;

        match rx.recv_timeout(self.commit_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                state.in_flight = Some(rx);
                Err(FirewallError::commit_failed(
                    "batch",
                    format!("timed out after {:?}", self.commit_timeout),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(FirewallError::commit_failed("batch", "commit worker exited"))
            }
        }
    }
}

/// A batch being staged under the adapter lock.
pub struct Transaction<'a> {
    adapter: &'a FilterAdapter,
    guard: MutexGuard<'a, AdapterState>,
    batch: Batch,
}

impl<'a> Transaction<'a> {
    pub fn create_table(&mut self, key: TableKey) -> StagedTableId {
        self.batch.create_table(key)
    }

    pub fn create_chain(&mut self, spec: ChainSpec) {
        self.batch.create_chain(spec)
    }

    pub fn add_rule(
        &mut self,
        chain: ChainRef,
        spec: MatchSpec,
        action: RuleAction,
        position: Position,
    ) -> StagedRuleId {
        let tag = self.adapter.next_tag();
        self.batch.add_rule(StagedRule {
            chain,
            spec,
            action,
            position,
            tag,
        })
    }

    pub fn delete_rule(&mut self, handle: RuleHandle) {
        self.batch.delete_rule(handle)
    }

    pub fn delete_table(&mut self, key: TableKey) {
        self.batch.delete_table(key)
    }

    pub fn staged(&self) -> &[StagedOp] {
        self.batch.ops()
    }

    /// Apply everything staged. On error nothing in the batch is in effect.
    pub fn commit(mut self) -> Result<CommitReceipt> {
        if self.batch.is_empty() {
            return Ok(CommitReceipt::default());
        }
        let ops = std::mem::take(&mut self.batch).into_ops();
        let expected = ops.len();
        let outcomes = self.adapter.run_commit(&mut self.guard, ops)?;
        if outcomes.len() != expected {
            return Err(FirewallError::commit_failed(
                "batch",
                format!("{} outcomes for {} operations", outcomes.len(), expected),
            ));
        }
        Ok(CommitReceipt { outcomes })
    }
}

/// Proof that a batch applied, with the kernel handles it produced.
#[derive(Debug, Default)]
pub struct CommitReceipt {
    outcomes: Vec<OpOutcome>,
}

impl CommitReceipt {
    pub fn table(&self, id: StagedTableId) -> Option<&TableHandle> {
        match self.outcomes.get(id.0) {
            Some(OpOutcome::Table(handle)) => Some(handle),
            _ => None,
        }
    }

    pub fn rule(&self, id: StagedRuleId) -> Option<&RuleHandle> {
        match self.outcomes.get(id.0) {
            Some(OpOutcome::Rule(handle)) => Some(handle),
            _ => None,
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = &RuleHandle> {
        self.outcomes.iter().filter_map(|o| match o {
            OpOutcome::Rule(handle) => Some(handle),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Hook, MemoryBackend};

    fn adapter(backend: &Arc<MemoryBackend>) -> FilterAdapter {
        FilterAdapter::new(backend.clone(), Duration::from_secs(2))
    }

    #[test]
    fn create_table_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let adapter = adapter(&backend);

        let first = adapter.create_table("filter", Family::Inet).unwrap();
        let second = adapter.create_table("filter", Family::Inet).unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.table_count(), 1);
        assert_eq!(backend.commit_count(), 1);
    }

    #[test]
    fn same_name_other_family_is_another_table() {
        let backend = Arc::new(MemoryBackend::new());
        let adapter = adapter(&backend);

        let inet = adapter.create_table("filter", Family::Inet).unwrap();
        let ip6 = adapter.create_table("filter", Family::Ip6).unwrap();
        assert_ne!(inet.handle, ip6.handle);
        assert_eq!(backend.table_count(), 2);
    }

    #[test]
    fn failed_commit_applies_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let adapter = adapter(&backend);
        let table = TableKey::new("filter", Family::Inet);
        let chain = ChainRef::new(table.clone(), "appwarden_input");

        backend.fail_next_commits(1);
        let mut tx = adapter.begin().unwrap();
        tx.create_table(table.clone());
        tx.create_chain(ChainSpec {
            chain: chain.clone(),
            hook: Hook::Input,
            priority: 0,
        });
        tx.add_rule(chain, MatchSpec::default(), RuleAction::Accept, Position::Append);
        assert!(matches!(
            tx.commit(),
            Err(FirewallError::CommitFailed { .. })
        ));

        assert_eq!(backend.table_count(), 0);
        assert!(adapter.find_table(&table).unwrap().is_none());
    }

    #[test]
    fn rule_handles_come_back_in_the_receipt() {
        let backend = Arc::new(MemoryBackend::new());
        let adapter = adapter(&backend);
        let table = TableKey::new("mangle", Family::Inet);
        let chain = ChainRef::new(table.clone(), "appwarden_output");

        let mut tx = adapter.begin().unwrap();
        tx.create_table(table.clone());
        tx.create_chain(ChainSpec {
            chain: chain.clone(),
            hook: Hook::Output,
            priority: -150,
        });
        let r1 = tx.add_rule(chain.clone(), MatchSpec::default(), RuleAction::Drop, Position::Append);
        let r2 = tx.add_rule(chain.clone(), MatchSpec::default(), RuleAction::Accept, Position::Head);
        let receipt = tx.commit().unwrap();

        let h1 = receipt.rule(r1).unwrap().clone();
        let h2 = receipt.rule(r2).unwrap().clone();
        assert_ne!(h1, h2);
        assert_eq!(receipt.rules().count(), 2);

        adapter.delete_rule(&h1).unwrap();
        let listed = adapter.list_rules_of(&table).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].handle, h2);
    }

    #[test]
    fn retry_gives_up_after_three_attempts() {
        let backend = Arc::new(MemoryBackend::new());
        let adapter = adapter(&backend);
        let mut calls = 0;
        let result: Result<()> = adapter.with_retry(|_| {
            calls += 1;
            Err(FirewallError::BackendUnavailable("down".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_does_not_repeat_commit_failures() {
        let backend = Arc::new(MemoryBackend::new());
        let adapter = adapter(&backend);
        let mut calls = 0;
        let result: Result<()> = adapter.with_retry(|_| {
            calls += 1;
            Err(FirewallError::commit_failed("x", "y"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn slow_commit_times_out_and_blocks_next_transaction() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_commit_delay(Some(Duration::from_millis(300)));
        let adapter = FilterAdapter::new(backend.clone(), Duration::from_millis(50));

        let err = adapter.create_table("filter", Family::Inet).unwrap_err();
        assert!(matches!(err, FirewallError::CommitFailed { .. }));

        // Still running: the next transaction may not stage yet.
        assert!(matches!(
            adapter.begin().err(),
            Some(FirewallError::BackendUnavailable(_))
        ));

        std::thread::sleep(Duration::from_millis(400));
        backend.set_commit_delay(None);
        assert!(adapter.begin().is_ok());
    }

    #[test]
    fn late_commit_is_rolled_back() {
        let backend = Arc::new(MemoryBackend::new());
        let adapter = FilterAdapter::new(backend.clone(), Duration::from_millis(50));
        let table = TableKey::new("mangle", Family::Inet);
        let chain = ChainRef::new(table.clone(), "appwarden_output");
        let mut tx = adapter.begin().unwrap();
        tx.create_table(table.clone());
        tx.create_chain(ChainSpec {
            chain: chain.clone(),
            hook: Hook::Output,
            priority: -150,
        });
        tx.commit().unwrap();

        backend.set_commit_delay(Some(Duration::from_millis(150)));
        assert!(adapter
            .add_rule(&chain, MatchSpec::default(), RuleAction::Drop, Position::Head)
            .is_err());
        std::thread::sleep(Duration::from_millis(250));
        backend.set_commit_delay(None);

        let late = backend.rules_in(&chain);
        assert_eq!(late.len(), 1);
        assert!(is_own_tag(late[0].comment.as_deref().unwrap()));

        drop(adapter.begin().unwrap());
        assert!(backend.rules_in(&chain).is_empty());
        assert!(backend.has_table(&table));
    }

    #[test]
    fn tags_carry_the_process_id() {
        assert!(is_own_tag(&format!("appwarden:{}:7", std::process::id())));
        assert!(!is_own_tag(&format!("appwarden:{}:7", std::process::id() + 1)));
        assert!(!is_own_tag("user rule"));
    }
}
