//! In-memory kernel ruleset.
//!
//! Backs `--dry-run` and the test suite. Batches apply atomically, listings
//! and commits can be made to fail, and rules from "other actors" can be
//! planted to exercise the foreign-rule paths.

use log::debug;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use super::{
    ChainRef, ChainSpec, FilterBackend, Hook, MatchSpec, OpOutcome, Position, RuleAction,
    RuleHandle, RuleRecord, StagedOp, TableHandle, TableKey,
};
use crate::connection::ConnectionDescriptor;
use crate::error::{FirewallError, Result};

#[derive(Debug, Clone)]
pub struct MemoryRule {
    pub handle: u64,
    pub spec: MatchSpec,
    pub action: RuleAction,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
struct MemoryChain {
    hook: Option<(Hook, i32)>,
    rules: Vec<MemoryRule>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    handle: u64,
    chains: BTreeMap<String, MemoryChain>,
}

#[derive(Debug, Clone, Default)]
struct Ruleset {
    next_handle: u64,
    tables: BTreeMap<TableKey, MemoryTable>,
}

impl Ruleset {
    fn alloc(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn apply(&mut self, op: &StagedOp) -> Result<OpOutcome> {
        match op {
            StagedOp::CreateTable(key) => {
                let handle = match self.tables.get(key) {
                    Some(table) => table.handle,
                    None => {
                        let handle = self.alloc();
                        self.tables.insert(
                            key.clone(),
                            MemoryTable {
                                handle,
                                chains: BTreeMap::new(),
                            },
                        );
                        handle
                    }
                };
                Ok(OpOutcome::Table(TableHandle {
                    key: key.clone(),
                    handle,
                }))
            }
            StagedOp::CreateChain(ChainSpec {
                chain,
                hook,
                priority,
            }) => {
                let table = self.table_mut(&chain.table, op)?;
                table
                    .chains
                    .entry(chain.name.clone())
                    .or_insert_with(|| MemoryChain {
                        hook: Some((*hook, *priority)),
                        rules: Vec::new(),
                    });
                Ok(OpOutcome::Chain(chain.clone()))
            }
            StagedOp::AddRule(staged) => {
                let handle = self.alloc();
                let chain = self.chain_mut(&staged.chain, op)?;
                let rule = MemoryRule {
                    handle,
                    spec: staged.spec.clone(),
                    action: staged.action,
                    comment: Some(staged.tag.clone()),
                };
                match staged.position {
                    Position::Append => chain.rules.push(rule),
                    Position::Head => chain.rules.insert(0, rule),
                }
                Ok(OpOutcome::Rule(RuleHandle {
                    chain: staged.chain.clone(),
                    handle,
                }))
            }
            StagedOp::DeleteRule(handle) => {
                let chain = self.chain_mut(&handle.chain, op)?;
                let before = chain.rules.len();
                chain.rules.retain(|r| r.handle != handle.handle);
                if chain.rules.len() == before {
                    return Err(FirewallError::commit_failed(op.describe(), "no such rule"));
                }
                Ok(OpOutcome::Removed)
            }
            StagedOp::DeleteTable(key) => {
                self.tables
                    .remove(key)
                    .ok_or_else(|| FirewallError::commit_failed(op.describe(), "no such table"))?;
                Ok(OpOutcome::Removed)
            }
        }
    }

    fn table_mut(&mut self, key: &TableKey, op: &StagedOp) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(key)
            .ok_or_else(|| FirewallError::commit_failed(op.describe(), "no such table"))
    }

    fn chain_mut(&mut self, chain: &ChainRef, op: &StagedOp) -> Result<&mut MemoryChain> {
        self.table_mut(&chain.table, op)?
            .chains
            .get_mut(&chain.name)
            .ok_or_else(|| FirewallError::commit_failed(op.describe(), "no such chain"))
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_commits: usize,
    /// Commits still allowed through before one fails.
    fail_after: Option<usize>,
    listing_fails: bool,
    unavailable: bool,
    commit_delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    ruleset: Mutex<Ruleset>,
    faults: Mutex<Faults>,
    commits: Mutex<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail without applying anything.
    pub fn fail_next_commits(&self, n: usize) {
        self.faults.lock().failing_commits = n;
    }

    /// Let `successes` commits apply, then fail the one after.
    pub fn fail_commit_after(&self, successes: usize) {
        self.faults.lock().fail_after = Some(successes);
    }

    pub fn set_listing_failure(&self, fails: bool) {
        self.faults.lock().listing_fails = fails;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        self.faults.lock().commit_delay = delay;
    }

    /// Plant a rule this daemon did not create, creating the table and chain
    /// if needed.
    pub fn insert_foreign_rule(&self, table: &TableKey, chain: &str) -> u64 {
        let mut ruleset = self.ruleset.lock();
        let handle = ruleset.alloc();
        let table_handle = ruleset.alloc();
        let table = ruleset
            .tables
            .entry(table.clone())
            .or_insert_with(|| MemoryTable {
                handle: table_handle,
                chains: BTreeMap::new(),
            });
        table
            .chains
            .entry(chain.to_string())
            .or_insert_with(|| MemoryChain {
                hook: None,
                rules: Vec::new(),
            })
            .rules
            .push(MemoryRule {
                handle,
                spec: MatchSpec::default(),
                action: RuleAction::Accept,
                comment: None,
            });
        handle
    }

    pub fn table_count(&self) -> usize {
        self.ruleset.lock().tables.len()
    }

    pub fn has_table(&self, key: &TableKey) -> bool {
        self.ruleset.lock().tables.contains_key(key)
    }

    pub fn commit_count(&self) -> usize {
        *self.commits.lock()
    }

    pub fn rules_in(&self, chain: &ChainRef) -> Vec<MemoryRule> {
        self.ruleset
            .lock()
            .tables
            .get(&chain.table)
            .and_then(|t| t.chains.get(&chain.name))
            .map(|c| c.rules.clone())
            .unwrap_or_default()
    }

    /// What the simulated kernel does with the first packet of `desc` on
    /// `hook`: the action of the first matching rule, walking base chains in
    /// priority order. `None` means the chain policy (accept) applies.
    pub fn classify(&self, hook: Hook, desc: &ConnectionDescriptor) -> Option<RuleAction> {
        let ruleset = self.ruleset.lock();
        let mut chains: Vec<(i32, &MemoryChain)> = ruleset
            .tables
            .values()
            .flat_map(|t| t.chains.values())
            .filter_map(|c| match c.hook {
                Some((h, prio)) if h == hook => Some((prio, c)),
                _ => None,
            })
            .collect();
        chains.sort_by_key(|(prio, _)| *prio);
        chains
            .into_iter()
            .flat_map(|(_, c)| c.rules.iter())
            .find(|r| r.spec.matches(desc))
            .map(|r| r.action)
    }
}

impl FilterBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn list_tables(&self) -> Result<Vec<TableHandle>> {
        if self.faults.lock().listing_fails {
            return Err(FirewallError::EnumerationFailed("listing disabled".to_string()));
        }
        Ok(self
            .ruleset
            .lock()
            .tables
            .iter()
            .map(|(key, t)| TableHandle {
                key: key.clone(),
                handle: t.handle,
            })
            .collect())
    }

    fn list_rules(&self, table: &TableKey) -> Result<Vec<RuleRecord>> {
        if self.faults.lock().listing_fails {
            return Err(FirewallError::EnumerationFailed("listing disabled".to_string()));
        }
        let ruleset = self.ruleset.lock();
        let Some(t) = ruleset.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(t.chains
            .iter()
            .flat_map(|(name, chain)| {
                chain.rules.iter().map(move |r| RuleRecord {
                    handle: RuleHandle {
                        chain: ChainRef::new(table.clone(), name.clone()),
                        handle: r.handle,
                    },
                    comment: r.comment.clone(),
                })
            })
            .collect())
    }

    fn commit(&self, ops: &[StagedOp]) -> Result<Vec<OpOutcome>> {
        let delay = {
            let mut faults = self.faults.lock();
            if faults.unavailable {
                return Err(FirewallError::BackendUnavailable("simulated".to_string()));
            }
            let scheduled = match faults.fail_after {
                Some(0) => {
                    faults.fail_after = None;
                    true
                }
                Some(n) => {
                    faults.fail_after = Some(n - 1);
                    false
                }
                None => false,
            };
            if !scheduled && faults.failing_commits > 0 {
                faults.failing_commits -= 1;
                return Err(FirewallError::commit_failed(
                    ops.first().map(|o| o.describe()).unwrap_or_default(),
                    "simulated failure",
                ));
            }
            if scheduled {
                let object = ops.first().map(|o| o.describe()).unwrap_or_default();
                return Err(FirewallError::commit_failed(object, "simulated failure"));
            }
            faults.commit_delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut ruleset = self.ruleset.lock();
        let mut next = ruleset.clone();
        let outcomes = ops
            .iter()
            .map(|op| next.apply(op))
            .collect::<Result<Vec<_>>>()?;
        *ruleset = next;
        *self.commits.lock() += 1;
        debug!("[memory] committed {} operation(s)", ops.len());
        Ok(outcomes)
    }
}
