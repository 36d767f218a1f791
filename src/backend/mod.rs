//! Filter backend: kernel tables, chains and rules behind one contract.
//!
//! Every mutation is staged into a [`Batch`] first. Nothing reaches the
//! kernel until the batch is committed through the [`FilterAdapter`], and a
//! failed commit means no staged operation took effect.

pub mod adapter;
pub mod memory;
pub mod nft;

pub use adapter::{CommitReceipt, FilterAdapter, Transaction};
pub use memory::MemoryBackend;
pub use nft::NftBackend;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use crate::cache::FingerprintField;
use crate::connection::{ConnectionDescriptor, Direction, Protocol};
use crate::error::Result;
use crate::verdict::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Inet,
    Ip,
    Ip6,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Family::Inet => "inet",
            Family::Ip => "ip",
            Family::Ip6 => "ip6",
        })
    }
}

/// A table is identified by name and family; the same name may exist once
/// per family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableKey {
    pub name: String,
    pub family: Family,
}

impl TableKey {
    pub fn new(name: impl Into<String>, family: Family) -> Self {
        Self {
            name: name.into(),
            family,
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableHandle {
    pub key: TableKey,
    pub handle: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainRef {
    pub table: TableKey,
    pub name: String,
}

impl ChainRef {
    pub fn new(table: TableKey, name: impl Into<String>) -> Self {
        Self {
            table,
            name: name.into(),
        }
    }
}

impl fmt::Display for ChainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.table, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Input,
    Output,
}

impl From<Direction> for Hook {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Outbound => Hook::Output,
            Direction::Inbound => Hook::Input,
        }
    }
}

/// A base chain: hooked into the stack with a priority, policy accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    pub chain: ChainRef,
    pub hook: Hook,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleHandle {
    pub chain: ChainRef,
    pub handle: u64,
}

impl fmt::Display for RuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} handle {}", self.chain, self.handle)
    }
}

/// Match half of a kernel rule. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSpec {
    pub protocol: Option<Protocol>,
    pub src_addr: Option<IpAddr>,
    pub dst_addr: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub uid: Option<u32>,
    /// Only the first packet of a connection (`ct state new`).
    pub ct_new: bool,
}

impl MatchSpec {
    /// The kernel match for a durable verdict keyed by `fields`. `None` when
    /// the kernel cannot express the fingerprint: process paths and host
    /// names have no nft counterpart, the owning uid is only known on
    /// outbound traffic, and nothing is pinned for an unattributed flow.
    pub fn for_fingerprint(
        fields: &[FingerprintField],
        desc: &ConnectionDescriptor,
    ) -> Option<Self> {
        let process = desc.process.as_ref()?;
        let mut spec = MatchSpec::default();
        for field in fields {
            match field {
                FingerprintField::Protocol => spec.protocol = Some(desc.protocol),
                FingerprintField::DestIp => match desc.direction {
                    Direction::Outbound => spec.dst_addr = Some(desc.dst_ip),
                    Direction::Inbound => spec.src_addr = Some(desc.src_ip),
                },
                FingerprintField::DestPort => spec.dst_port = Some(desc.dst_port),
                FingerprintField::UserId if desc.direction == Direction::Outbound => {
                    spec.uid = Some(process.uid)
                }
                FingerprintField::Direction => {}
                FingerprintField::UserId
                | FingerprintField::ProcessPath
                | FingerprintField::DestHost => return None,
            }
        }
        // nft needs the protocol to match a port.
        if spec.dst_port.is_some() {
            spec.protocol = Some(desc.protocol);
        }
        Some(spec)
    }

    pub fn matches(&self, desc: &ConnectionDescriptor) -> bool {
        self.protocol.map_or(true, |p| p == desc.protocol)
            && self.src_addr.map_or(true, |a| a == desc.src_ip)
            && self.dst_addr.map_or(true, |a| a == desc.dst_ip)
            && self.src_port.map_or(true, |p| p == desc.src_port)
            && self.dst_port.map_or(true, |p| p == desc.dst_port)
            && self
                .uid
                .map_or(true, |uid| desc.process.as_ref().map(|p| p.uid) == Some(uid))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Accept,
    Drop,
    Reject,
    /// Hand the packet to userspace. With `bypass`, packets are accepted
    /// when nobody listens on the queue (fail-open).
    Queue { num: u16, bypass: bool },
}

impl From<Action> for RuleAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Allow => RuleAction::Accept,
            Action::Deny => RuleAction::Drop,
            Action::Reject => RuleAction::Reject,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Append,
    /// Inserted before every existing rule in the chain.
    Head,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRule {
    pub chain: ChainRef,
    pub spec: MatchSpec,
    pub action: RuleAction,
    pub position: Position,
    /// Unique comment used to find the kernel handle after commit.
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedOp {
    CreateTable(TableKey),
    CreateChain(ChainSpec),
    AddRule(StagedRule),
    DeleteRule(RuleHandle),
    DeleteTable(TableKey),
}

impl StagedOp {
    pub fn describe(&self) -> String {
        match self {
            StagedOp::CreateTable(key) => format!("table {}", key),
            StagedOp::CreateChain(spec) => format!("chain {}", spec.chain),
            StagedOp::AddRule(rule) => format!("rule in {}", rule.chain),
            StagedOp::DeleteRule(handle) => format!("rule {}", handle),
            StagedOp::DeleteTable(key) => format!("table {}", key),
        }
    }
}

/// What one committed operation produced, index-aligned with the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    Table(TableHandle),
    Chain(ChainRef),
    Rule(RuleHandle),
    Removed,
}

/// A rule as listed from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRecord {
    pub handle: RuleHandle,
    pub comment: Option<String>,
}

/// The kernel side of the adapter. Implementations apply a whole batch or
/// nothing.
pub trait FilterBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn list_tables(&self) -> Result<Vec<TableHandle>>;

    /// Every rule in every chain of exactly this (name, family) table.
    fn list_rules(&self, table: &TableKey) -> Result<Vec<RuleRecord>>;

    fn commit(&self, ops: &[StagedOp]) -> Result<Vec<OpOutcome>>;
}

/// Index of a staged table creation inside its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedTableId(pub(crate) usize);

/// Index of a staged rule inside its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedRuleId(pub(crate) usize);

/// Operations accumulated for one commit.
#[derive(Debug, Default)]
pub struct Batch {
    ops: Vec<StagedOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&mut self, key: TableKey) -> StagedTableId {
        self.ops.push(StagedOp::CreateTable(key));
        StagedTableId(self.ops.len() - 1)
    }

    pub fn create_chain(&mut self, spec: ChainSpec) {
        self.ops.push(StagedOp::CreateChain(spec));
    }

    pub fn add_rule(&mut self, rule: StagedRule) -> StagedRuleId {
        self.ops.push(StagedOp::AddRule(rule));
        StagedRuleId(self.ops.len() - 1)
    }

    pub fn delete_rule(&mut self, handle: RuleHandle) {
        self.ops.push(StagedOp::DeleteRule(handle));
    }

    pub fn delete_table(&mut self, key: TableKey) {
        self.ops.push(StagedOp::DeleteTable(key));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[StagedOp] {
        &self.ops
    }

    pub(crate) fn into_ops(self) -> Vec<StagedOp> {
        self.ops
    }
}
