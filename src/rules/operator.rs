//! Operator trees: leaf predicates over a connection, combined with
//! and/or/not.

use ipnetwork::IpNetwork;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::connection::{ConnectionDescriptor, Direction, Protocol};
use crate::error::FirewallError;

/// Inclusive port range; a single port is a range of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PortSpec", into = "PortSpec")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

impl FromStr for PortRange {
    type Err = FirewallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FirewallError::InvalidRule(format!("bad port range {:?}", s));
        let (start, end) = match s.split_once('-') {
            Some((a, b)) => (
                a.trim().parse().map_err(|_| invalid())?,
                b.trim().parse().map_err(|_| invalid())?,
            ),
            None => {
                let port = s.trim().parse().map_err(|_| invalid())?;
                (port, port)
            }
        };
        if start > end {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Ports are written either as a number or as "a-b".
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PortSpec {
    Number(u16),
    Text(String),
}

impl TryFrom<PortSpec> for PortRange {
    type Error = FirewallError;

    fn try_from(spec: PortSpec) -> Result<Self, Self::Error> {
        match spec {
            PortSpec::Number(port) => Ok(PortRange::single(port)),
            PortSpec::Text(text) => text.parse(),
        }
    }
}

impl From<PortRange> for PortSpec {
    fn from(range: PortRange) -> Self {
        if range.start == range.end {
            PortSpec::Number(range.start)
        } else {
            PortSpec::Text(range.to_string())
        }
    }
}

/// A compiled regex that (de)serialises as its source text.
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(source: &str) -> Result<Self, FirewallError> {
        Regex::new(source)
            .map(Pattern)
            .map_err(|e| FirewallError::InvalidRule(format!("regex {:?}: {}", source, e)))
    }

    /// Shell-style glob: `*` matches any run of characters, `?` exactly one.
    pub fn glob(glob: &str) -> Result<Self, FirewallError> {
        let mut source = String::with_capacity(glob.len() + 8);
        source.push('^');
        for c in glob.chars() {
            match c {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                c => source.push_str(&regex::escape(&c.to_string())),
            }
        }
        source.push('$');
        Self::new(&source)
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Pattern::new(&source).map_err(serde::de::Error::custom)
    }
}

/// A glob kept in its written form, matched through a compiled pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct Glob {
    text: String,
    pattern: Pattern,
}

impl Glob {
    pub fn new(text: &str) -> Result<Self, FirewallError> {
        Ok(Self {
            text: text.to_string(),
            pattern: Pattern::glob(text)?,
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }
}

impl Serialize for Glob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Glob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Glob::new(&text).map_err(serde::de::Error::custom)
    }
}

/// Match tree of a user rule.
///
/// Leaves test one attribute of the connection. Process leaves never match
/// a connection whose process could not be attributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Operator {
    Protocol(Protocol),
    DestPort(PortRange),
    SourcePort(PortRange),
    DestIp(IpAddr),
    DestNetwork(IpNetwork),
    SourceNetwork(IpNetwork),
    /// Exact name, or `*.example.com` for any subdomain. Case-insensitive.
    DestHost(String),
    DestHostRegex(Pattern),
    ProcessPath(Glob),
    ProcessPathRegex(Pattern),
    /// Matches if any ancestor executable matches.
    ProcessParentPath(Glob),
    CommandLine(Pattern),
    ProcessId(u32),
    UserId(u32),
    Direction(Direction),
    And(Vec<Operator>),
    Or(Vec<Operator>),
    Not(Box<Operator>),
}

impl Operator {
    pub fn matches(&self, desc: &ConnectionDescriptor) -> bool {
        let process = desc.process.as_ref();
        match self {
            Operator::Protocol(p) => desc.protocol == *p,
            Operator::DestPort(range) => range.contains(desc.dst_port),
            Operator::SourcePort(range) => range.contains(desc.src_port),
            Operator::DestIp(ip) => desc.dst_ip == *ip,
            Operator::DestNetwork(net) => net.contains(desc.dst_ip),
            Operator::SourceNetwork(net) => net.contains(desc.src_ip),
            Operator::DestHost(name) => desc
                .dst_host
                .as_deref()
                .map_or(false, |host| host_matches(name, host)),
            Operator::DestHostRegex(re) => desc.dst_host.as_deref().map_or(false, |h| re.is_match(h)),
            Operator::ProcessPath(glob) => desc.process_path().map_or(false, |p| glob.is_match(p)),
            Operator::ProcessPathRegex(re) => desc.process_path().map_or(false, |p| re.is_match(p)),
            Operator::ProcessParentPath(glob) => {
                process.map_or(false, |p| p.parent_paths.iter().any(|pp| glob.is_match(pp)))
            }
            Operator::CommandLine(re) => process.map_or(false, |p| re.is_match(&p.command_line())),
            Operator::ProcessId(pid) => process.map_or(false, |p| p.pid == *pid),
            Operator::UserId(uid) => process.map_or(false, |p| p.uid == *uid),
            Operator::Direction(d) => desc.direction == *d,
            Operator::And(ops) => ops.iter().all(|op| op.matches(desc)),
            Operator::Or(ops) => ops.iter().any(|op| op.matches(desc)),
            Operator::Not(op) => !op.matches(desc),
        }
    }

    /// The process a rule is keyed on, for cache invalidation and prompts.
    pub fn process_path(&self) -> Option<String> {
        match self {
            Operator::ProcessPath(glob) => Some(glob.text.clone()),
            Operator::And(ops) => ops.iter().find_map(|op| op.process_path()),
            _ => None,
        }
    }
}

fn host_matches(rule: &str, host: &str) -> bool {
    let host = host.trim_end_matches('.');
    match rule.strip_prefix("*.") {
        Some(suffix) if host.len() > suffix.len() => {
            let split = host.len() - suffix.len();
            host.as_bytes()[split - 1] == b'.'
                && host
                    .get(split..)
                    .map_or(false, |tail| tail.eq_ignore_ascii_case(suffix))
        }
        Some(_) => false,
        None => rule.eq_ignore_ascii_case(host),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{sample, sample_process};

    #[test]
    fn port_ranges_parse() {
        assert_eq!("443".parse::<PortRange>().unwrap(), PortRange::single(443));
        let r: PortRange = "1000-2000".parse().unwrap();
        assert!(r.contains(1500) && !r.contains(2001));
        assert!("2000-1000".parse::<PortRange>().is_err());
        assert!("http".parse::<PortRange>().is_err());
    }

    #[test]
    fn operators_deserialize_from_json() {
        let json = r#"{"type":"and","value":[
            {"type":"dest_port","value":"440-450"},
            {"type":"process_path","value":"/usr/bin/*"},
            {"type":"not","value":{"type":"dest_network","value":"10.0.0.0/8"}}
        ]}"#;
        let op: Operator = serde_json::from_str(json).unwrap();
        let desc = sample(443).with_process(Some(sample_process("/usr/bin/curl")));
        assert!(op.matches(&desc));

        let back = serde_json::to_string(&op).unwrap();
        assert_eq!(serde_json::from_str::<Operator>(&back).unwrap(), op);
    }

    #[test]
    fn bad_regex_is_rejected_on_load() {
        let json = r#"{"type":"command_line","value":"(unclosed"}"#;
        assert!(serde_json::from_str::<Operator>(json).is_err());
    }

    #[test]
    fn globs_anchor_the_whole_path() {
        let glob = Glob::new("/usr/bin/python3.?").unwrap();
        assert!(glob.is_match("/usr/bin/python3.9"));
        assert!(!glob.is_match("/usr/bin/python3.10"));
        assert!(!glob.is_match("/opt/usr/bin/python3.9"));
    }

    #[test]
    fn host_wildcards_need_a_label_boundary() {
        assert!(host_matches("*.example.com", "www.EXAMPLE.com."));
        assert!(!host_matches("*.example.com", "example.com"));
        assert!(!host_matches("*.example.com", "badexample.com"));
        assert!(host_matches("Example.com", "example.com"));
    }

    #[test]
    fn process_leaves_fail_without_a_process() {
        let desc = sample(443);
        assert!(!Operator::UserId(1000).matches(&desc));
        assert!(!Operator::ProcessPath(Glob::new("*").unwrap()).matches(&desc));
        assert!(Operator::Not(Box::new(Operator::UserId(1000))).matches(&desc));
        assert!(Operator::DestPort(PortRange::single(443)).matches(&desc));
    }

    #[test]
    fn parent_path_checks_every_ancestor() {
        let mut proc = sample_process("/usr/bin/curl");
        proc.parent_paths = vec!["/usr/bin/bash".into(), "/usr/sbin/sshd".into()];
        let desc = sample(443).with_process(Some(proc));
        assert!(Operator::ProcessParentPath(Glob::new("/usr/sbin/sshd").unwrap()).matches(&desc));
    }
}
