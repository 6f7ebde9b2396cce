use serde::{Deserialize, Serialize};

use crate::config::{ChatSettings, McpSettings, ReportStyle};
use crate::events::Role;
use crate::message::Resource;

/// Per-turn inputs supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOptions {
    /// Value of the interrupt option the user picked
    pub interrupt_feedback: Option<String>,
    pub resources: Vec<Resource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub role: Role,
    pub content: String,
}

/// JSON body of a chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<RequestMessage>,
    pub thread_id: String,
    pub resources: Vec<Resource>,
    pub auto_accepted_plan: bool,
    pub max_plan_iterations: u32,
    pub max_step_num: u32,
    pub max_search_results: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt_feedback: Option<String>,
    pub enable_background_investigation: bool,
    pub report_style: ReportStyle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_settings: Option<McpSettings>,
}

impl ChatRequest {
    pub fn new(
        thread_id: &str,
        text: Option<&str>,
        options: &TurnOptions,
        settings: &ChatSettings,
        mcp_settings: Option<McpSettings>,
    ) -> Self {
        let messages = text
            .map(|text| RequestMessage {
                role: Role::User,
                content: text.to_string(),
            })
            .into_iter()
            .collect();

        Self {
            messages,
            thread_id: thread_id.to_string(),
            resources: options.resources.clone(),
            auto_accepted_plan: settings.auto_accepted_plan,
            max_plan_iterations: settings.max_plan_iterations,
            max_step_num: settings.max_step_num,
            max_search_results: settings.max_search_results,
            interrupt_feedback: options.interrupt_feedback.clone(),
            enable_background_investigation: settings.enable_background_investigation,
            report_style: settings.report_style,
            mcp_settings,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_body_shape() {
        let options = TurnOptions {
            interrupt_feedback: Some("accepted".to_string()),
            resources: vec![Resource {
                uri: "rag://dataset/1".to_string(),
                title: "Notes".to_string(),
            }],
        };
        let request = ChatRequest::new(
            "thread-1",
            Some("Start research"),
            &options,
            &ChatSettings::default(),
            None,
        );

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "messages": [{"role": "user", "content": "Start research"}],
                "thread_id": "thread-1",
                "resources": [{"uri": "rag://dataset/1", "title": "Notes"}],
                "auto_accepted_plan": false,
                "max_plan_iterations": 1,
                "max_step_num": 3,
                "max_search_results": 3,
                "interrupt_feedback": "accepted",
                "enable_background_investigation": false,
                "report_style": "academic",
            })
        );
    }

    #[test]
    fn test_request_without_text_has_no_messages() {
        let request = ChatRequest::new(
            "thread-1",
            None,
            &TurnOptions::default(),
            &ChatSettings::default(),
            None,
        );
        assert!(request.messages.is_empty());

        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("interrupt_feedback").is_none());
        assert!(body.get("mcp_settings").is_none());
    }
}
