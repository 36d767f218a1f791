//! Table registry
//!
//! The daemon's record of the tables, chains and rules it created itself.
//! Anything else found in the kernel belongs to another actor and is never
//! mutated or deleted. Rules carrying this process's comment tag are ours
//! even when their handle was never recorded (a commit that applied after
//! its timeout, or whose handles could not be read back).

use log::{error, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::backend::adapter::is_own_tag;
use crate::backend::{
    ChainRef, ChainSpec, Family, FilterAdapter, Hook, MatchSpec, Position, RuleAction,
    RuleHandle, RuleRecord, TableHandle, TableKey,
};
use crate::connection::{Direction, Protocol};
use crate::error::{FirewallError, Result};

pub const OUTPUT_CHAIN: &str = "appwarden_output";
pub const INPUT_CHAIN: &str = "appwarden_input";

const OUTPUT_PRIORITY: i32 = -150;
const INPUT_PRIORITY: i32 = 0;

/// What needs intercepting, taken from the configuration at startup.
#[derive(Debug, Clone)]
pub struct InterceptionSpec {
    pub mangle_table: String,
    pub filter_table: String,
    pub queue_num: u16,
    pub intercept_inbound: bool,
    pub intercept_dns: bool,
    /// Queue rules let packets through when no reader is attached.
    pub fail_open: bool,
}

impl InterceptionSpec {
    pub fn inbound_queue(&self) -> u16 {
        self.queue_num.wrapping_add(1)
    }

    fn uses_input_chain(&self) -> bool {
        self.intercept_inbound || self.intercept_dns
    }
}

#[derive(Debug, Clone)]
pub struct FilterTable {
    pub key: TableKey,
    pub handle: u64,
    pub chains: Vec<ChainRef>,
}

/// Result of tearing one table down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    Deleted,
    /// Left in place: the table holds rules this daemon did not create.
    ForeignResourcePreserved { foreign_rules: usize },
    /// Foreign rules could not be counted, so the table was left alone.
    EnumerationFailed(String),
    /// The delete did not commit; the table is still registered.
    DeleteFailed(String),
}

#[derive(Default)]
struct RegistryState {
    tables: HashMap<TableKey, FilterTable>,
    owned_rules: BTreeSet<RuleHandle>,
    output_chain: Option<ChainRef>,
    input_chain: Option<ChainRef>,
}

pub struct TableRegistry {
    adapter: Arc<FilterAdapter>,
    state: Mutex<RegistryState>,
}

impl TableRegistry {
    pub fn new(adapter: Arc<FilterAdapter>) -> Self {
        Self {
            adapter,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn adapter(&self) -> &Arc<FilterAdapter> {
        &self.adapter
    }

    /// Create (or attach to) the interception tables, then install the
    /// daemon's chains and queue rules in one batch. Any error here means the
    /// daemon has nothing to anchor interception to. Tables are registered
    /// as soon as they exist, so a later failure still leaves them to
    /// `teardown`.
    pub fn ensure_system_tables(&self, spec: &InterceptionSpec) -> Result<()> {
        let mangle = self.adapter.create_table(&spec.mangle_table, Family::Inet)?;
        self.register_table(&mangle);
        let filter = if spec.uses_input_chain() {
            let filter = self.adapter.create_table(&spec.filter_table, Family::Inet)?;
            self.register_table(&filter);
            Some(filter)
        } else {
            None
        };

        let output = ChainRef::new(mangle.key.clone(), OUTPUT_CHAIN);
        let input = filter
            .as_ref()
            .map(|f| ChainRef::new(f.key.clone(), INPUT_CHAIN));

        let mut tx = self.adapter.begin()?;
        tx.create_chain(ChainSpec {
            chain: output.clone(),
            hook: Hook::Output,
            priority: OUTPUT_PRIORITY,
        });
        tx.add_rule(
            output.clone(),
            MatchSpec {
                ct_new: true,
                ..Default::default()
            },
            RuleAction::Queue {
                num: spec.queue_num,
                bypass: spec.fail_open,
            },
            Position::Append,
        );

        if let Some(input) = &input {
            tx.create_chain(ChainSpec {
                chain: input.clone(),
                hook: Hook::Input,
                priority: INPUT_PRIORITY,
            });
            let inbound = RuleAction::Queue {
                num: spec.inbound_queue(),
                bypass: spec.fail_open,
            };
            if spec.intercept_dns {
                tx.add_rule(
                    input.clone(),
                    MatchSpec {
                        protocol: Some(Protocol::Udp),
                        src_port: Some(53),
                        ..Default::default()
                    },
                    inbound,
                    Position::Append,
                );
            }
            if spec.intercept_inbound {
                tx.add_rule(
                    input.clone(),
                    MatchSpec {
                        ct_new: true,
                        ..Default::default()
                    },
                    inbound,
                    Position::Append,
                );
            }
        }

        let receipt = tx.commit()?;

        let mut state = self.state.lock();
        state.owned_rules.extend(receipt.rules().cloned());
        if let Some(table) = state.tables.get_mut(&mangle.key) {
            table.chains.push(output.clone());
        }
        if let Some(input) = &input {
            if let Some(table) = state.tables.get_mut(&input.table) {
                table.chains.push(input.clone());
            }
        }
        state.output_chain = Some(output);
        state.input_chain = input;
        drop(state);

        info!(
            "Interception installed: outbound -> queue {}{}",
            spec.queue_num,
            if spec.uses_input_chain() {
                format!(", inbound -> queue {}", spec.inbound_queue())
            } else {
                String::new()
            }
        );
        Ok(())
    }

    fn register_table(&self, handle: &TableHandle) {
        self.state
            .lock()
            .tables
            .entry(handle.key.clone())
            .or_insert_with(|| FilterTable {
                key: handle.key.clone(),
                handle: handle.handle,
                chains: Vec::new(),
            });
    }

    /// Rules in the table that this daemon did not create. Only chains of
    /// the table with the same name *and* family are considered.
    pub fn count_foreign_rules(&self, key: &TableKey) -> Result<usize> {
        let listed = self.adapter.list_rules_of(key)?;
        let state = self.state.lock();
        Ok(listed
            .iter()
            .filter(|r| r.handle.chain.table == *key)
            .filter(|r| !is_ours(&state, r))
            .count())
    }

    /// Install a verdict rule ahead of the queue rule for `direction`.
    pub fn add_verdict_rule(
        &self,
        direction: Direction,
        spec: MatchSpec,
        action: RuleAction,
    ) -> Result<RuleHandle> {
        let chain = self.chain_for(direction).ok_or_else(|| {
            FirewallError::commit_failed(
                format!("{:?} chain", direction),
                "no interception chain for this direction",
            )
        })?;
        let handle = self.adapter.add_rule(&chain, spec, action, Position::Head)?;
        self.state.lock().owned_rules.insert(handle.clone());
        Ok(handle)
    }

    pub fn remove_rule(&self, handle: &RuleHandle) -> Result<()> {
        if !self.state.lock().owned_rules.contains(handle) {
            return Err(FirewallError::commit_failed(
                handle.to_string(),
                "not created by this daemon",
            ));
        }
        self.adapter.delete_rule(handle)?;
        self.state.lock().owned_rules.remove(handle);
        Ok(())
    }

    pub fn table(&self, key: &TableKey) -> Option<FilterTable> {
        self.state.lock().tables.get(key).cloned()
    }

    pub fn tables(&self) -> Vec<TableKey> {
        let mut keys: Vec<_> = self.state.lock().tables.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn owned_rule_count(&self) -> usize {
        self.state.lock().owned_rules.len()
    }

    fn chain_for(&self, direction: Direction) -> Option<ChainRef> {
        let state = self.state.lock();
        match direction {
            Direction::Outbound => state.output_chain.clone(),
            Direction::Inbound => state.input_chain.clone(),
        }
    }

    /// Delete every registered table that holds no foreign rules. Tables
    /// that cannot be deleted stay registered so a later call retries them.
    pub fn teardown(&self) -> Vec<(TableKey, TeardownOutcome)> {
        let mut outcomes = Vec::new();
        for key in self.tables() {
            let outcome = match self.count_foreign_rules(&key) {
                Ok(0) => self.delete_table(&key),
                Ok(foreign) => {
                    warn!(
                        "Preserving table {}: {} rule(s) not created by appwarden",
                        key, foreign
                    );
                    self.remove_own_rules(&key);
                    TeardownOutcome::ForeignResourcePreserved {
                        foreign_rules: foreign,
                    }
                }
                Err(e) => {
                    error!("Cannot count foreign rules in {}, leaving it: {}", key, e);
                    TeardownOutcome::EnumerationFailed(e.to_string())
                }
            };
            outcomes.push((key, outcome));
        }
        outcomes
    }

    fn delete_table(&self, key: &TableKey) -> TeardownOutcome {
        let Some(table) = self.table(key) else {
            return TeardownOutcome::Deleted;
        };
        let handle = TableHandle {
            key: key.clone(),
            handle: table.handle,
        };
        match self.adapter.delete_table(&handle) {
            Ok(()) => {
                let mut state = self.state.lock();
                state.tables.remove(key);
                state.owned_rules.retain(|r| &r.chain.table != key);
                if state.output_chain.as_ref().map(|c| &c.table) == Some(key) {
                    state.output_chain = None;
                }
                if state.input_chain.as_ref().map(|c| &c.table) == Some(key) {
                    state.input_chain = None;
                }
                info!("Deleted table {}", key);
                TeardownOutcome::Deleted
            }
            Err(e) => {
                error!("Failed to delete table {}, keeping it registered: {}", key, e);
                TeardownOutcome::DeleteFailed(e.to_string())
            }
        }
    }

    /// Best effort: drop our own rules from a table we must leave behind.
    /// Chains stay, since foreign rules may sit in or jump to them.
    fn remove_own_rules(&self, key: &TableKey) {
        let listed = self.adapter.list_rules_of(key);
        let own: Vec<RuleHandle> = {
            let state = self.state.lock();
            match listed {
                Ok(listed) => listed
                    .iter()
                    .filter(|r| r.handle.chain.table == *key && is_ours(&state, r))
                    .map(|r| r.handle.clone())
                    .collect(),
                Err(_) => state
                    .owned_rules
                    .iter()
                    .filter(|r| &r.chain.table == key)
                    .cloned()
                    .collect(),
            }
        };
        if own.is_empty() {
            return;
        }
        let result = self.adapter.begin().and_then(|mut tx| {
            for handle in &own {
                tx.delete_rule(handle.clone());
            }
            tx.commit()
        });
        match result {
            Ok(_) => {
                let mut state = self.state.lock();
                for handle in &own {
                    state.owned_rules.remove(handle);
                }
            }
            Err(e) => warn!("Could not remove own rules from {}: {}", key, e),
        }
    }
}

fn is_ours(state: &RegistryState, rule: &RuleRecord) -> bool {
    state.owned_rules.contains(&rule.handle) || rule.comment.as_deref().map_or(false, is_own_tag)
}
