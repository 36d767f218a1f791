//! Rules management module
//!
//! Holds the ordered user rule set and evaluates connections against it.
//! Rules are kept sorted by (priority, insertion order); every evaluation
//! works on an immutable snapshot, so edits never produce a torn read.

pub mod operator;

pub use operator::{Glob, Operator, Pattern, PortRange};

use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::connection::ConnectionDescriptor;
use crate::error::{FirewallError, Result};
use crate::verdict::{Action, Scope, Verdict};

fn default_enabled() -> bool {
    true
}

fn default_duration() -> Scope {
    Scope::Always
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRule {
    pub name: String,
    /// Lower evaluates first. Need not be unique.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub operator: Operator,
    pub action: Action,
    #[serde(default = "default_duration")]
    pub duration: Scope,
    /// Insertion order, the tie-break between equal priorities.
    #[serde(skip)]
    seq: u64,
}

impl UserRule {
    pub fn new(name: impl Into<String>, priority: i32, operator: Operator, action: Action) -> Self {
        Self {
            name: name.into(),
            priority,
            enabled: true,
            operator,
            action,
            duration: Scope::Always,
            seq: 0,
        }
    }

    pub fn with_duration(mut self, duration: Scope) -> Self {
        self.duration = duration;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn verdict(&self) -> Verdict {
        Verdict::new(self.action, self.duration)
    }

    /// The rule a prompt proposes for `desc`: this program (when known) to
    /// this destination host or address on this port.
    pub fn suggested(desc: &ConnectionDescriptor, action: Action) -> Self {
        let mut ops = Vec::new();
        if let Some(path) = desc.process_path() {
            if let Ok(glob) = Glob::new(path) {
                ops.push(Operator::ProcessPath(glob));
            }
        }
        let (remote_ip, _) = desc.remote();
        match &desc.dst_host {
            Some(host) => ops.push(Operator::DestHost(host.clone())),
            None => ops.push(Operator::DestIp(remote_ip)),
        }
        ops.push(Operator::Protocol(desc.protocol));
        ops.push(Operator::DestPort(PortRange::single(desc.dst_port)));

        let app = desc
            .process
            .as_ref()
            .map(|p| p.name.as_str())
            .filter(|n| !n.is_empty())
            .unwrap_or("any");
        let target = desc.dst_host.clone().unwrap_or_else(|| remote_ip.to_string());
        Self::new(
            format!("{}-{}-{}-{}", action, app, target, desc.dst_port),
            0,
            Operator::And(ops),
            action,
        )
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FirewallError::InvalidRule("rule name is empty".to_string()));
        }
        Ok(())
    }
}

/// Outcome of evaluating one connection. `NoMatch` is not a verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Match { rule: String, verdict: Verdict },
    NoMatch,
}

pub struct RuleEngine {
    rules: RwLock<Arc<Vec<UserRule>>>,
    next_seq: RwLock<u64>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
            next_seq: RwLock::new(0),
        }
    }

    /// The current rule set, in evaluation order.
    pub fn snapshot(&self) -> Arc<Vec<UserRule>> {
        self.rules.read().clone()
    }

    pub fn evaluate(&self, desc: &ConnectionDescriptor) -> Evaluation {
        let rules = self.snapshot();
        match rules
            .iter()
            .filter(|r| r.enabled)
            .find(|r| r.operator.matches(desc))
        {
            Some(rule) => {
                debug!("Rule {} matched {}", rule.name, desc);
                Evaluation::Match {
                    rule: rule.name.clone(),
                    verdict: rule.verdict(),
                }
            }
            None => Evaluation::NoMatch,
        }
    }

    pub fn add(&self, rule: UserRule) -> Result<()> {
        rule.validate()?;
        self.mutate(|rules, seq| {
            if rules.iter().any(|r| r.name == rule.name) {
                return Err(FirewallError::DuplicateRule(rule.name.clone()));
            }
            let mut rule = rule;
            rule.seq = seq;
            rules.push(rule);
            Ok(())
        })
    }

    pub fn remove(&self, name: &str) -> Result<UserRule> {
        self.mutate(|rules, _| {
            let idx = position(rules, name)?;
            Ok(rules.remove(idx))
        })
    }

    /// Replace the rule with the same name. Its place among equal
    /// priorities is kept. Returns the previous version.
    pub fn update(&self, rule: UserRule) -> Result<UserRule> {
        rule.validate()?;
        self.mutate(|rules, _| {
            let idx = position(rules, &rule.name)?;
            let mut rule = rule;
            rule.seq = rules[idx].seq;
            Ok(std::mem::replace(&mut rules[idx], rule))
        })
    }

    pub fn reorder(&self, name: &str, priority: i32) -> Result<()> {
        self.mutate(|rules, _| {
            let idx = position(rules, name)?;
            rules[idx].priority = priority;
            Ok(())
        })
    }

    pub fn list(&self) -> Vec<UserRule> {
        self.snapshot().as_ref().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load a JSON array of rules, in file order, into the engine. A missing
    /// file is an empty rule set.
    pub fn load_from_file(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            info!("No rules file at {}, starting with empty rules", path.display());
            return Ok(0);
        }
        let content = fs::read_to_string(path)?;
        let rules: Vec<UserRule> = serde_json::from_str(&content)
            .map_err(|e| FirewallError::InvalidRule(format!("{}: {}", path.display(), e)))?;
        let count = rules.len();
        for rule in rules {
            self.add(rule)?;
        }
        info!("Loaded {} rules from {}", count, path.display());
        Ok(count)
    }

    /// Copy, edit, re-sort, publish. Readers keep whatever snapshot they
    /// already hold.
    fn mutate<T>(&self, edit: impl FnOnce(&mut Vec<UserRule>, u64) -> Result<T>) -> Result<T> {
        let mut published = self.rules.write();
        let mut seq_guard = self.next_seq.write();
        let mut next = published.as_ref().clone();
        let out = edit(&mut next, *seq_guard)?;
        *seq_guard += 1;
        next.sort_by_key(|r| (r.priority, r.seq));
        *published = Arc::new(next);
        Ok(out)
    }
}

fn position(rules: &[UserRule], name: &str) -> Result<usize> {
    rules
        .iter()
        .position(|r| r.name == name)
        .ok_or_else(|| FirewallError::UnknownRule(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{sample, sample_process};
    use std::io::Write;
    use std::thread;

    fn port(p: u16) -> Operator {
        Operator::DestPort(PortRange::single(p))
    }

    fn matched(eval: Evaluation) -> String {
        match eval {
            Evaluation::Match { rule, .. } => rule,
            Evaluation::NoMatch => panic!("expected a match"),
        }
    }

    #[test]
    fn lower_priority_wins_regardless_of_insertion() {
        let engine = RuleEngine::new();
        engine.add(UserRule::new("late", 20, port(443), Action::Deny)).unwrap();
        engine.add(UserRule::new("early", 10, port(443), Action::Allow)).unwrap();
        assert_eq!(matched(engine.evaluate(&sample(443))), "early");
    }

    #[test]
    fn equal_priorities_fall_back_to_insertion_order() {
        let engine = RuleEngine::new();
        engine.add(UserRule::new("first", 5, port(443), Action::Allow)).unwrap();
        engine.add(UserRule::new("second", 5, port(443), Action::Deny)).unwrap();
        assert_eq!(matched(engine.evaluate(&sample(443))), "first");

        // An update must not move a rule behind its peers.
        engine
            .update(UserRule::new("first", 5, port(443), Action::Reject))
            .unwrap();
        match engine.evaluate(&sample(443)) {
            Evaluation::Match { rule, verdict } => {
                assert_eq!(rule, "first");
                assert_eq!(verdict.action, Action::Reject);
            }
            Evaluation::NoMatch => panic!("expected a match"),
        }
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let engine = RuleEngine::new();
        engine
            .add(UserRule::new("off", 0, port(443), Action::Deny).disabled())
            .unwrap();
        assert_eq!(engine.evaluate(&sample(443)), Evaluation::NoMatch);
        engine.add(UserRule::new("on", 1, port(443), Action::Allow)).unwrap();
        assert_eq!(matched(engine.evaluate(&sample(443))), "on");
    }

    #[test]
    fn no_match_is_not_a_verdict() {
        let engine = RuleEngine::new();
        engine.add(UserRule::new("ssh", 0, port(22), Action::Allow)).unwrap();
        assert_eq!(engine.evaluate(&sample(443)), Evaluation::NoMatch);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let engine = RuleEngine::new();
        for i in 0..20 {
            engine
                .add(UserRule::new(format!("r{}", i), i % 3, port(443), Action::Allow))
                .unwrap();
        }
        let first = engine.evaluate(&sample(443));
        for _ in 0..50 {
            assert_eq!(engine.evaluate(&sample(443)), first);
        }
        assert_eq!(matched(first), "r0");
    }

    #[test]
    fn names_are_unique_and_must_exist() {
        let engine = RuleEngine::new();
        engine.add(UserRule::new("a", 0, port(1), Action::Allow)).unwrap();
        assert!(matches!(
            engine.add(UserRule::new("a", 0, port(2), Action::Allow)),
            Err(FirewallError::DuplicateRule(_))
        ));
        assert!(matches!(engine.remove("b"), Err(FirewallError::UnknownRule(_))));
        assert!(matches!(engine.reorder("b", 1), Err(FirewallError::UnknownRule(_))));
        assert!(matches!(
            engine.add(UserRule::new(" ", 0, port(2), Action::Allow)),
            Err(FirewallError::InvalidRule(_))
        ));
    }

    #[test]
    fn reorder_changes_the_winner() {
        let engine = RuleEngine::new();
        engine.add(UserRule::new("allow", 1, port(443), Action::Allow)).unwrap();
        engine.add(UserRule::new("deny", 2, port(443), Action::Deny)).unwrap();
        engine.reorder("deny", 0).unwrap();
        assert_eq!(matched(engine.evaluate(&sample(443))), "deny");
        let names: Vec<_> = engine.list().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["deny", "allow"]);
    }

    #[test]
    fn evaluations_never_see_a_half_applied_reorder() {
        let engine = Arc::new(RuleEngine::new());
        engine.add(UserRule::new("a", 1, port(443), Action::Allow)).unwrap();
        engine.add(UserRule::new("b", 2, port(443), Action::Deny)).unwrap();

        let writer = {
            let engine = engine.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    let (a, b) = if i % 2 == 0 { (2, 1) } else { (1, 2) };
                    engine.reorder("a", a).unwrap();
                    engine.reorder("b", b).unwrap();
                }
            })
        };
        for _ in 0..2000 {
            let snapshot = engine.snapshot();
            assert_eq!(snapshot.len(), 2);
            assert!(snapshot[0].priority <= snapshot[1].priority);
            assert!(matches!(engine.evaluate(&sample(443)), Evaluation::Match { .. }));
        }
        writer.join().unwrap();
    }

    #[test]
    fn rules_load_from_json_in_file_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
              {{"name":"web","priority":10,"operator":{{"type":"dest_port","value":443}},"action":"allow","duration":"always"}},
              {{"name":"curl","priority":10,"operator":{{"type":"process_path","value":"/usr/bin/curl"}},"action":"deny"}}
            ]"#
        )
        .unwrap();

        let engine = RuleEngine::new();
        assert_eq!(engine.load_from_file(file.path()).unwrap(), 2);
        let desc = sample(443).with_process(Some(sample_process("/usr/bin/curl")));
        assert_eq!(matched(engine.evaluate(&desc)), "web");
        assert!(engine.list()[1].enabled);

        let missing = file.path().with_extension("missing");
        assert_eq!(RuleEngine::new().load_from_file(&missing).unwrap(), 0);
    }

    #[test]
    fn suggested_rule_matches_its_connection() {
        let desc = sample(443)
            .with_host(Some("example.com".into()))
            .with_process(Some(sample_process("/usr/bin/firefox")));
        let rule = UserRule::suggested(&desc, Action::Allow);
        assert!(rule.operator.matches(&desc));
        assert!(!rule.operator.matches(&sample(443)));
        assert_eq!(rule.name, "allow-firefox-example.com-443");
    }
}
