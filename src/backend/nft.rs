//! nftables backend over the JSON API (`nft -j`).

use log::{debug, warn};
use nftables::{
    batch::Batch as NftBatch,
    expr::{Expression, Meta, MetaKey, NamedExpression, Payload, PayloadField, CT},
    helper::{apply_ruleset, get_current_ruleset},
    schema::{Chain, NfCmd, NfListObject, NfObject, Nftables, Rule, Table},
    stmt::{Match, Operator, Queue, QueueFlag, Statement},
    types::{NfChainPolicy, NfChainType, NfFamily, NfHook},
};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use super::{
    ChainRef, Family, FilterBackend, Hook, MatchSpec, OpOutcome, Position, RuleAction,
    RuleHandle, RuleRecord, StagedOp, TableHandle, TableKey,
};
use crate::error::{FirewallError, Result};

#[derive(Debug, Default)]
pub struct NftBackend;

impl NftBackend {
    pub fn new() -> Self {
        NftBackend
    }

    fn ruleset(&self) -> Result<Nftables<'static>> {
        get_current_ruleset().map_err(|e| FirewallError::EnumerationFailed(e.to_string()))
    }
}

fn nf_family(family: Family) -> NfFamily {
    match family {
        Family::Inet => NfFamily::INet,
        Family::Ip => NfFamily::IP,
        Family::Ip6 => NfFamily::IP6,
    }
}

fn family_of(family: &NfFamily) -> Option<Family> {
    match family {
        NfFamily::INet => Some(Family::Inet),
        NfFamily::IP => Some(Family::Ip),
        NfFamily::IP6 => Some(Family::Ip6),
        _ => None,
    }
}

fn nf_hook(hook: Hook) -> NfHook {
    match hook {
        Hook::Input => NfHook::Input,
        Hook::Output => NfHook::Output,
    }
}

fn table_object(key: &TableKey) -> NfListObject<'static> {
    NfListObject::Table(Table {
        family: nf_family(key.family),
        name: Cow::Owned(key.name.clone()),
        handle: None,
    })
}

fn payload(protocol: &'static str, field: &'static str) -> Expression<'static> {
    Expression::Named(NamedExpression::Payload(Payload::PayloadField(PayloadField {
        protocol: Cow::Borrowed(protocol),
        field: Cow::Borrowed(field),
    })))
}

fn meta(key: MetaKey) -> Expression<'static> {
    Expression::Named(NamedExpression::Meta(Meta { key }))
}

fn matches(
    left: Expression<'static>,
    right: Expression<'static>,
    op: Operator,
) -> Statement<'static> {
    Statement::Match(Match { left, right, op })
}

fn addr_match(field: &'static str, addr: IpAddr) -> Statement<'static> {
    let proto = if addr.is_ipv6() { "ip6" } else { "ip" };
    matches(
        payload(proto, field),
        Expression::String(Cow::Owned(addr.to_string())),
        Operator::EQ,
    )
}

/// Translate a match spec and action into nft statements.
pub(crate) fn statements(spec: &MatchSpec, action: RuleAction) -> Vec<Statement<'static>> {
    let mut stmts = Vec::new();

    if spec.ct_new {
        let ct_state = Expression::Named(NamedExpression::CT(CT {
            key: Cow::Borrowed("state"),
            family: None,
            dir: None,
        }));
        stmts.push(matches(
            ct_state,
            Expression::String(Cow::Borrowed("new")),
            Operator::IN,
        ));
    }
    if let Some(uid) = spec.uid {
        stmts.push(matches(meta(MetaKey::Skuid), Expression::Number(uid), Operator::EQ));
    }
    if let Some(addr) = spec.src_addr {
        stmts.push(addr_match("saddr", addr));
    }
    if let Some(addr) = spec.dst_addr {
        stmts.push(addr_match("daddr", addr));
    }
    if let Some(proto) = spec.protocol {
        stmts.push(matches(
            meta(MetaKey::L4proto),
            Expression::String(Cow::Borrowed(proto.as_str())),
            Operator::EQ,
        ));
        if let Some(port) = spec.src_port {
            stmts.push(matches(
                payload(proto.as_str(), "sport"),
                Expression::Number(port as u32),
                Operator::EQ,
            ));
        }
        if let Some(port) = spec.dst_port {
            stmts.push(matches(
                payload(proto.as_str(), "dport"),
                Expression::Number(port as u32),
                Operator::EQ,
            ));
        }
    }

    stmts.push(match action {
        RuleAction::Accept => Statement::Accept(None),
        RuleAction::Drop => Statement::Drop(None),
        RuleAction::Reject => Statement::Reject(None),
        RuleAction::Queue { num, bypass } => {
            let flags = bypass.then(|| {
                let mut flags = HashSet::new();
                flags.insert(QueueFlag::Bypass);
                flags
            });
            Statement::Queue(Queue {
                num: Expression::Number(num as u32),
                flags,
            })
        }
    });
    stmts
}

fn rule_object(
    chain: &ChainRef,
    handle: Option<u32>,
    expr: Vec<Statement<'static>>,
    comment: Option<String>,
) -> NfListObject<'static> {
    NfListObject::Rule(Rule {
        family: nf_family(chain.table.family),
        table: Cow::Owned(chain.table.name.clone()),
        chain: Cow::Owned(chain.name.clone()),
        expr: Cow::Owned(expr),
        handle,
        index: None,
        comment: comment.map(Cow::Owned),
    })
}

impl FilterBackend for NftBackend {
    fn name(&self) -> &'static str {
        "nftables"
    }

    fn list_tables(&self) -> Result<Vec<TableHandle>> {
        let ruleset = self.ruleset()?;
        Ok(ruleset
            .objects
            .iter()
            .filter_map(|obj| match obj {
                NfObject::ListObject(NfListObject::Table(table)) => {
                    family_of(&table.family).map(|family| TableHandle {
                        key: TableKey::new(table.name.to_string(), family),
                        handle: table.handle.unwrap_or(0) as u64,
                    })
                }
                _ => None,
            })
            .collect())
    }

    fn list_rules(&self, table: &TableKey) -> Result<Vec<RuleRecord>> {
        let ruleset = self.ruleset()?;
        let family = nf_family(table.family);
        Ok(ruleset
            .objects
            .iter()
            .filter_map(|obj| match obj {
                // Both name and family must match: a table of the same name
                // in another family is a different table.
                NfObject::ListObject(NfListObject::Rule(rule))
                    if rule.table == table.name.as_str() && rule.family == family =>
                {
                    Some(RuleRecord {
                        handle: RuleHandle {
                            chain: ChainRef::new(table.clone(), rule.chain.to_string()),
                            handle: rule.handle.unwrap_or(0) as u64,
                        },
                        comment: rule.comment.as_ref().map(|c| c.to_string()),
                    })
                }
                _ => None,
            })
            .collect())
    }

    fn commit(&self, ops: &[StagedOp]) -> Result<Vec<OpOutcome>> {
        let mut batch = NftBatch::new();
        for op in ops {
            match op {
                StagedOp::CreateTable(key) => batch.add(table_object(key)),
                StagedOp::CreateChain(spec) => batch.add(NfListObject::Chain(Chain {
                    family: nf_family(spec.chain.table.family),
                    table: Cow::Owned(spec.chain.table.name.clone()),
                    name: Cow::Owned(spec.chain.name.clone()),
                    newname: None,
                    handle: None,
                    _type: Some(NfChainType::Filter),
                    hook: Some(nf_hook(spec.hook)),
                    prio: Some(spec.priority),
                    dev: None,
                    policy: Some(NfChainPolicy::Accept),
                })),
                StagedOp::AddRule(staged) => {
                    let rule = rule_object(
                        &staged.chain,
                        None,
                        statements(&staged.spec, staged.action),
                        Some(staged.tag.clone()),
                    );
                    match staged.position {
                        Position::Append => batch.add(rule),
                        Position::Head => batch.add_cmd(NfCmd::Insert(rule)),
                    }
                }
                StagedOp::DeleteRule(handle) => batch.add_cmd(NfCmd::Delete(rule_object(
                    &handle.chain,
                    Some(handle.handle as u32),
                    Vec::new(),
                    None,
                ))),
                StagedOp::DeleteTable(key) => batch.add_cmd(NfCmd::Delete(table_object(key))),
            }
        }

        let object = ops.first().map(|o| o.describe()).unwrap_or_default();
        apply_ruleset(&batch.to_nftables())
            .map_err(|e| FirewallError::commit_failed(object, e))?;
        debug!("nft: applied {} operation(s)", ops.len());

        self.resolve_outcomes(ops)
    }
}

impl NftBackend {
    /// Map each applied operation to its kernel object. Rules are found by
    /// the unique comment they were tagged with.
    fn resolve_outcomes(&self, ops: &[StagedOp]) -> Result<Vec<OpOutcome>> {
        let needs_lookup = ops
            .iter()
            .any(|op| matches!(op, StagedOp::CreateTable(_) | StagedOp::AddRule(_)));
        let (tables, tagged) = if needs_lookup {
            let ruleset = self.ruleset().map_err(|e| {
                warn!(
                    "nft: batch applied but handles could not be read back; \
                     its rules stay tagged for teardown"
                );
                e
            })?;
            let mut tables = HashMap::new();
            let mut tagged = HashMap::new();
            for obj in ruleset.objects.iter() {
                match obj {
                    NfObject::ListObject(NfListObject::Table(t)) => {
                        if let Some(family) = family_of(&t.family) {
                            tables.insert(
                                TableKey::new(t.name.to_string(), family),
                                t.handle.unwrap_or(0) as u64,
                            );
                        }
                    }
                    NfObject::ListObject(NfListObject::Rule(r)) => {
                        if let (Some(comment), Some(handle)) = (&r.comment, r.handle) {
                            tagged.insert(comment.to_string(), handle as u64);
                        }
                    }
                    _ => {}
                }
            }
            (tables, tagged)
        } else {
            (HashMap::new(), HashMap::new())
        };

        ops.iter()
            .map(|op| match op {
                StagedOp::CreateTable(key) => tables
                    .get(key)
                    .map(|handle| {
                        OpOutcome::Table(TableHandle {
                            key: key.clone(),
                            handle: *handle,
                        })
                    })
                    .ok_or_else(|| {
                        FirewallError::EnumerationFailed(format!("table {} missing after commit", key))
                    }),
                StagedOp::CreateChain(spec) => Ok(OpOutcome::Chain(spec.chain.clone())),
                StagedOp::AddRule(staged) => tagged
                    .get(&staged.tag)
                    .map(|handle| {
                        OpOutcome::Rule(RuleHandle {
                            chain: staged.chain.clone(),
                            handle: *handle,
                        })
                    })
                    .ok_or_else(|| {
                        FirewallError::EnumerationFailed(format!(
                            "rule {} missing after commit",
                            staged.tag
                        ))
                    }),
                StagedOp::DeleteRule(_) | StagedOp::DeleteTable(_) => Ok(OpOutcome::Removed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Protocol;

    #[test]
    fn queue_rule_has_ct_state_and_no_bypass_by_default() {
        let spec = MatchSpec {
            ct_new: true,
            ..Default::default()
        };
        let stmts = statements(&spec, RuleAction::Queue { num: 0, bypass: false });
        assert_eq!(stmts.len(), 2);
        match &stmts[1] {
            Statement::Queue(q) => assert!(q.flags.is_none()),
            other => panic!("expected queue, got {:?}", other),
        }
    }

    #[test]
    fn bypass_only_when_asked() {
        let stmts = statements(&MatchSpec::default(), RuleAction::Queue { num: 1, bypass: true });
        match &stmts[0] {
            Statement::Queue(q) => assert!(q.flags.as_ref().unwrap().contains(&QueueFlag::Bypass)),
            other => panic!("expected queue, got {:?}", other),
        }
    }

    #[test]
    fn connection_rule_matches_each_field_then_verdict() {
        let spec = MatchSpec {
            protocol: Some(Protocol::Tcp),
            dst_addr: Some("2606:4700::1111".parse().unwrap()),
            dst_port: Some(443),
            uid: Some(1000),
            ..Default::default()
        };
        let stmts = statements(&spec, RuleAction::Reject);
        // skuid, daddr, l4proto, dport, verdict
        assert_eq!(stmts.len(), 5);
        assert!(matches!(stmts.last(), Some(Statement::Reject(None))));
    }

    #[test]
    fn ports_without_protocol_are_not_emitted() {
        let spec = MatchSpec {
            dst_port: Some(53),
            ..Default::default()
        };
        assert_eq!(statements(&spec, RuleAction::Accept).len(), 1);
    }
}
