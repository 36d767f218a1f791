use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
    Reject,
}

impl Action {
    pub fn is_allow(self) -> bool {
        self == Action::Allow
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Allow => "allow",
            Action::Deny => "deny",
            Action::Reject => "reject",
        })
    }
}

/// How long a verdict outlives the connection that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Once,
    #[serde(alias = "until-restart", alias = "until_restart")]
    Session,
    Always,
}

impl Scope {
    /// Session and always verdicts are worth a kernel rule.
    pub fn is_durable(self) -> bool {
        !matches!(self, Scope::Once)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Once => "once",
            Scope::Session => "session",
            Scope::Always => "always",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub action: Action,
    pub scope: Scope,
}

impl Verdict {
    pub fn new(action: Action, scope: Scope) -> Self {
        Self { action, scope }
    }

    pub fn once(action: Action) -> Self {
        Self::new(action, Scope::Once)
    }

    pub fn packet_verdict(&self) -> PacketVerdict {
        match self.action {
            Action::Allow => PacketVerdict::Accept,
            Action::Deny | Action::Reject => PacketVerdict::Drop,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.action, self.scope)
    }
}

/// What happens to a held packet. The queue can only accept or drop; a
/// reject is a drop here and a reject statement in a kernel rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketVerdict {
    Accept,
    Drop,
}
