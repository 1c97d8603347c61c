//! Message schema spoken with the injected consent script.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ca_core::models::ConsentMode;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeuristicState {
    pub heuristic_patterns: Vec<String>,
    pub heuristic_snippets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Inbound {
    Init,
    CmpDetected {
        cmp: String,
    },
    PopupFound {
        cmp: String,
    },
    #[serde(rename_all = "camelCase")]
    OptInResult {
        #[serde(default)]
        cmp: String,
        #[serde(alias = "succeeded", default)]
        result: bool,
        #[serde(default)]
        schedule_self_test: bool,
    },
    #[serde(rename_all = "camelCase")]
    OptOutResult {
        #[serde(default)]
        cmp: String,
        #[serde(alias = "succeeded", default)]
        result: bool,
        #[serde(default)]
        schedule_self_test: bool,
    },
    AutoconsentDone {
        #[serde(default)]
        cmp: String,
    },
    SelfTestResult {
        #[serde(default)]
        result: bool,
    },
    Eval {
        id: Value,
        code: String,
    },
    Report {
        #[serde(default)]
        state: HeuristicState,
    },
    AutoconsentError {
        #[serde(default)]
        details: Value,
    },
    #[serde(other)]
    Unknown,
}

impl Inbound {
    /// Parse a raw binding message. Messages that don't fit the schema
    /// (missing fields, wrong types) come back as `Unknown`.
    pub fn parse(raw: &Value) -> Self {
        serde_json::from_value(raw.clone()).unwrap_or(Self::Unknown)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::CmpDetected { .. } => "cmpDetected",
            Self::PopupFound { .. } => "popupFound",
            Self::OptInResult { .. } => "optInResult",
            Self::OptOutResult { .. } => "optOutResult",
            Self::AutoconsentDone { .. } => "autoconsentDone",
            Self::SelfTestResult { .. } => "selfTestResult",
            Self::Eval { .. } => "eval",
            Self::Report { .. } => "report",
            Self::AutoconsentError { .. } => "autoconsentError",
            Self::Unknown => "unknown",
        }
    }

    /// Result message that answers `mode`'s action, as `(cmp, succeeded, schedule_self_test)`.
    pub fn action_result(&self, mode: ConsentMode) -> Option<(&str, bool, bool)> {
        match (self, mode) {
            (
                Self::OptInResult {
                    cmp,
                    result,
                    schedule_self_test,
                },
                ConsentMode::OptIn,
            )
            | (
                Self::OptOutResult {
                    cmp,
                    result,
                    schedule_self_test,
                },
                ConsentMode::OptOut,
            ) => Some((cmp.as_str(), *result, *schedule_self_test)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConfig {
    pub enabled: bool,
    pub auto_action: Option<String>,
    pub disabled_cmps: Vec<String>,
    pub enable_prehide: bool,
    pub enable_cosmetic_rules: bool,
    pub enable_filter_list: bool,
    pub enable_heuristic_detection: bool,
    pub detect_retries: u32,
    pub is_main_world: bool,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_action: None,
            disabled_cmps: Vec::new(),
            enable_prehide: false,
            enable_cosmetic_rules: true,
            enable_filter_list: true,
            enable_heuristic_detection: true,
            detect_retries: 20,
            is_main_world: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Outbound {
    InitResp { config: InitConfig },
    OptIn,
    OptOut,
    SelfTest,
    EvalResp { id: Value, result: bool },
}

impl Outbound {
    pub fn action(mode: ConsentMode) -> Self {
        match mode {
            ConsentMode::OptIn => Self::OptIn,
            ConsentMode::OptOut => Self::OptOut,
        }
    }

    /// Expression that hands this message to the script's receiver.
    pub fn to_expression(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("autoconsentReceiveMessage({json})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_accepts_succeeded_alias() {
        let msg = Inbound::parse(&json!({
            "type": "optOutResult",
            "cmp": "Acme",
            "succeeded": true,
            "scheduleSelfTest": true
        }));
        assert_eq!(msg.action_result(ConsentMode::OptOut), Some(("Acme", true, true)));
        assert_eq!(msg.action_result(ConsentMode::OptIn), None);
    }

    #[test]
    fn unknown_and_malformed_messages_degrade() {
        assert_eq!(Inbound::parse(&json!({"type": "visible"})), Inbound::Unknown);
        assert_eq!(Inbound::parse(&json!({"type": "cmpDetected"})), Inbound::Unknown);
        assert_eq!(Inbound::parse(&json!("init")), Inbound::Unknown);
    }

    #[test]
    fn report_state_is_optional() {
        let msg = Inbound::parse(&json!({
            "type": "report",
            "state": {"heuristicPatterns": ["reject all"]}
        }));
        match msg {
            Inbound::Report { state } => {
                assert_eq!(state.heuristic_patterns, vec!["reject all"]);
                assert!(state.heuristic_snippets.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn init_reply_disables_auto_action() {
        let expr = Outbound::InitResp {
            config: InitConfig::default(),
        }
        .to_expression();
        assert!(expr.starts_with("autoconsentReceiveMessage({\"type\":\"initResp\""));
        assert!(expr.contains("\"autoAction\":null"));
        assert!(expr.contains("\"enablePrehide\":false"));
        assert!(expr.contains("\"detectRetries\":20"));
        assert!(expr.contains("\"isMainWorld\":false"));
    }

    #[test]
    fn eval_reply_carries_the_request_id() {
        let expr = Outbound::EvalResp {
            id: json!(7),
            result: true,
        }
        .to_expression();
        assert_eq!(
            expr,
            "autoconsentReceiveMessage({\"type\":\"evalResp\",\"id\":7,\"result\":true})"
        );
    }
}
