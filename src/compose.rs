//! # Prompt composer
//!
//! Merges role framing, context, sanitized data, and output-format
//! instructions into the literal text sent to the model. Section ordering is
//! fixed: framing line, context block, data block, conversation window,
//! request block, format instructions. Missing optional sections are omitted
//! entirely, never left as empty placeholders, and variables render in
//! sorted key order, so identical inputs always produce byte-identical
//! prompts. Cache fingerprinting and reproducible tests both rely on that.
//!
//! The recognized context fields are an explicit record, [ComposeContext],
//! rather than an open-ended dictionary.

use std::collections::BTreeMap;

use crate::conversation::{Message, MessageRole};
use crate::intent::Intent;
use crate::sanitize::{sanitize_with, SanitizePolicy};
use crate::utils::JsonMap;

/// The context block fields the composer understands.
#[derive(Debug, Clone, Default)]
pub struct ComposeContext {
    /// One-line summary of the resources in scope.
    pub resource_summary: Option<String>,
    /// Names of alerts currently firing.
    pub active_alerts: Vec<String>,
    /// Time range the question concerns, e.g. `last 24h`.
    pub time_range: Option<String>,
    /// Deployment environment, e.g. `production`.
    pub environment: Option<String>,
    /// Free-form operator notes; sanitized before inclusion.
    pub notes: Option<String>,
}

impl ComposeContext {
    fn is_empty(&self) -> bool {
        self.resource_summary.is_none()
            && self.active_alerts.is_empty()
            && self.time_range.is_none()
            && self.environment.is_none()
            && self.notes.is_none()
    }
}

/// Builds prompts with a fixed, deterministic section layout.
#[derive(Debug, Clone, Default)]
pub struct PromptComposer {
    policy: SanitizePolicy,
}

impl PromptComposer {
    pub fn new(policy: SanitizePolicy) -> Self {
        Self { policy }
    }

    /// Compose the final prompt. Pure: no clocks, no randomness, no state.
    ///
    /// `task` is what the model is asked to do: the rendered diagnostic
    /// template for templated queries, or the operator's own text for free
    /// chat. It is sanitized like everything else.
    pub fn compose(
        &self,
        intent: Option<Intent>,
        task: &str,
        variables: Option<&JsonMap>,
        context: &ComposeContext,
        history: &[Message],
    ) -> String {
        let mut prompt = String::new();

        prompt.push_str(framing_line(intent));
        prompt.push('\n');

        if !context.is_empty() {
            prompt.push_str("\n## Context\n");
            if let Some(environment) = &context.environment {
                prompt.push_str(&format!("Environment: {}\n", environment));
            }
            if let Some(summary) = &context.resource_summary {
                prompt.push_str(&format!("Resources: {}\n", summary));
            }
            if !context.active_alerts.is_empty() {
                prompt.push_str(&format!(
                    "Active alerts: {}\n",
                    context.active_alerts.join(", ")
                ));
            }
            if let Some(time_range) = &context.time_range {
                prompt.push_str(&format!("Time range: {}\n", time_range));
            }
            if let Some(notes) = &context.notes {
                prompt.push_str(&format!(
                    "Notes: {}\n",
                    sanitize_with(notes, &self.policy)
                ));
            }
        }

        if let Some(variables) = variables {
            if !variables.is_empty() {
                prompt.push_str("\n## Data\n");
                // BTreeMap gives sorted, deterministic key order.
                let sorted: BTreeMap<&String, &serde_json::Value> = variables.iter().collect();
                for (key, value) in sorted {
                    let rendered = crate::prompt::render_value(value);
                    prompt.push_str(&format!(
                        "{}: {}\n",
                        key,
                        sanitize_with(&rendered, &self.policy)
                    ));
                }
            }
        }

        if !history.is_empty() {
            prompt.push_str("\n## Conversation so far\n");
            for message in history {
                prompt.push_str(&format!(
                    "{}: {}\n",
                    role_label(message.role),
                    sanitize_with(&message.content, &self.policy)
                ));
            }
        }

        if !task.is_empty() {
            prompt.push_str("\n## Request\n");
            prompt.push_str(&sanitize_with(task, &self.policy));
            prompt.push('\n');
        }

        prompt.push_str("\n## Output format\n");
        prompt.push_str(format_instructions(intent));
        prompt.push('\n');

        prompt
    }
}

fn role_label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "operator",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    }
}

fn framing_line(intent: Option<Intent>) -> &'static str {
    match intent {
        Some(Intent::CostOptimization) => {
            "You are an expert cloud cost analyst for an OCI operations team."
        }
        Some(Intent::Troubleshooting) | Some(Intent::RemediationRequest) => {
            "You are a senior cloud reliability engineer diagnosing production incidents."
        }
        Some(Intent::MonitoringAlert) => {
            "You are an on-call cloud operations engineer triaging monitoring alerts."
        }
        Some(Intent::ResourceAnalysis) | Some(Intent::InfrastructureQuery) => {
            "You are an expert cloud infrastructure analyst for an OCI tenancy."
        }
        Some(Intent::HelpRequest) | Some(Intent::GeneralChat) | None => {
            "You are a helpful cloud operations assistant."
        }
    }
}

fn format_instructions(intent: Option<Intent>) -> &'static str {
    match intent {
        Some(Intent::Troubleshooting) | Some(Intent::RemediationRequest) | Some(Intent::MonitoringAlert) => {
            "Respond with: 1. a numbered diagnosis, 2. recommended remediation steps, 3. escalation criteria. Use **bold** section headers."
        }
        Some(Intent::CostOptimization) | Some(Intent::ResourceAnalysis) => {
            "Respond with a short summary, a bullet list of findings, and a numbered list of recommendations with estimated impact."
        }
        _ => "Respond concisely in markdown. Use bullet points for any list of items.",
    }
}

#[cfg(test)]
mod compose_tests {
    use super::*;
    use serde_json::json;

    fn variables() -> JsonMap {
        let mut vars = JsonMap::new();
        vars.insert("cost_data".into(), json!("$500 on compute"));
        vars.insert("billing_period".into(), json!("2026-07"));
        vars
    }

    #[test]
    fn test_section_ordering_is_fixed() {
        let composer = PromptComposer::default();
        let context = ComposeContext {
            environment: Some("production".into()),
            ..Default::default()
        };
        let vars = variables();
        let prompt = composer.compose(
            Some(Intent::CostOptimization),
            "Analyze July spend.",
            Some(&vars),
            &context,
            &[],
        );

        let framing = prompt.find("cloud cost analyst").unwrap();
        let ctx = prompt.find("## Context").unwrap();
        let data = prompt.find("## Data").unwrap();
        let request = prompt.find("## Request").unwrap();
        let format = prompt.find("## Output format").unwrap();
        assert!(framing < ctx && ctx < data && data < request && request < format);
    }

    #[test]
    fn test_byte_identical_for_identical_inputs() {
        let composer = PromptComposer::default();
        let context = ComposeContext {
            time_range: Some("last 24h".into()),
            active_alerts: vec!["cpu-high".into()],
            ..Default::default()
        };
        let vars = variables();
        let a = composer.compose(Some(Intent::ResourceAnalysis), "review capacity", Some(&vars), &context, &[]);
        let b = composer.compose(Some(Intent::ResourceAnalysis), "review capacity", Some(&vars), &context, &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_sections_are_omitted() {
        let composer = PromptComposer::default();
        let prompt = composer.compose(None, "", None, &ComposeContext::default(), &[]);
        assert!(!prompt.contains("## Context"));
        assert!(!prompt.contains("## Data"));
        assert!(!prompt.contains("## Conversation so far"));
        assert!(!prompt.contains("## Request"));
        assert!(prompt.contains("## Output format"));
    }

    #[test]
    fn test_task_and_data_blocks_are_sanitized() {
        let composer = PromptComposer::default();
        let mut vars = JsonMap::new();
        vars.insert("owner".into(), json!("ops@example.com"));
        let prompt = composer.compose(
            None,
            "ping 10.0.3.12 and report",
            Some(&vars),
            &ComposeContext::default(),
            &[],
        );
        assert!(prompt.contains("[REDACTED:EMAIL]"));
        assert!(prompt.contains("[REDACTED:IP]"));
        assert!(!prompt.contains("ops@example.com"));
        assert!(!prompt.contains("10.0.3.12"));
    }

    #[test]
    fn test_variables_render_in_sorted_key_order() {
        let composer = PromptComposer::default();
        let vars = variables();
        let prompt = composer.compose(None, "task", Some(&vars), &ComposeContext::default(), &[]);
        let billing = prompt.find("billing_period:").unwrap();
        let cost = prompt.find("cost_data:").unwrap();
        assert!(billing < cost);
    }
}
