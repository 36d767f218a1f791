//! Messages exchanged with the UI over the local socket, one JSON object
//! per line, tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionDescriptor;
use crate::rules::UserRule;
use crate::verdict::{Action, Scope, Verdict};

/// Daemon → UI
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    Prompt(PromptRequest),
    CancelPrompt { request_id: u64 },
    RulesList { rules: Vec<UserRule> },
    Ack(Ack),
    StatsUpdate { stats: StatsData },
    ConnectionEvent(ConnectionEvent),
}

/// UI → daemon
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiCommand {
    PromptResponse(PromptResponse),
    AddRule { rule: UserRule },
    UpdateRule { rule: UserRule },
    DeleteRule { name: String },
    ReorderRule { name: String, priority: i32 },
    ListRules,
    FlushCache,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PromptRequest {
    pub request_id: u64,
    pub connection: ConnectionDescriptor,
    /// Rule the UI can offer to save along with the answer.
    pub suggested_rule: UserRule,
    pub timeout_secs: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PromptResponse {
    pub request_id: u64,
    pub action: Action,
    #[serde(default = "default_scope")]
    pub scope: Scope,
    /// Rule to add to the rule set.
    #[serde(default)]
    pub rule: Option<UserRule>,
}

fn default_scope() -> Scope {
    Scope::Once
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn from_result<T, E: std::fmt::Display>(command: &str, result: &Result<T, E>) -> Self {
        Self {
            command: command.to_string(),
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsData {
    pub total_connections: u64,
    pub allowed_connections: u64,
    pub blocked_connections: u64,
    pub prompted_connections: u64,
    pub pending_decisions: u64,
    pub cached_verdicts: u64,
    pub enforcement_failures: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionEvent {
    pub connection: ConnectionDescriptor,
    pub verdict: Verdict,
    /// `rule:<name>`, `cache`, `user` or `default`.
    pub decided_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_response_defaults_to_once() {
        let cmd: UiCommand =
            serde_json::from_str(r#"{"type":"prompt_response","request_id":3,"action":"deny"}"#).unwrap();
        match cmd {
            UiCommand::PromptResponse(r) => {
                assert_eq!(r.request_id, 3);
                assert_eq!(r.action, Action::Deny);
                assert_eq!(r.scope, Scope::Once);
                assert!(r.rule.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unit_commands_and_tagging() {
        let cmd: UiCommand = serde_json::from_str(r#"{"type":"list_rules"}"#).unwrap();
        assert!(matches!(cmd, UiCommand::ListRules));

        let cmd: UiCommand =
            serde_json::from_str(r#"{"type":"reorder_rule","name":"web","priority":-1}"#).unwrap();
        assert!(matches!(cmd, UiCommand::ReorderRule { priority: -1, .. }));

        let json = serde_json::to_string(&DaemonMessage::CancelPrompt { request_id: 9 }).unwrap();
        assert_eq!(json, r#"{"type":"cancel_prompt","request_id":9}"#);
    }

    #[test]
    fn until_restart_is_a_session_scope() {
        let r: PromptResponse = serde_json::from_str(
            r#"{"request_id":1,"action":"allow","scope":"until-restart"}"#,
        )
        .unwrap();
        assert_eq!(r.scope, Scope::Session);
    }
}
