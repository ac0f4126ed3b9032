//! # Intent classifier
//!
//! Maps raw operator text to one of a fixed set of intents, with a confidence
//! score and any entities it can pull out of the text (resource names, OCIDs,
//! IP addresses).
//!
//! Classification is total and pure: every input maps to exactly one intent,
//! falling back to [Intent::GeneralChat] with low confidence when no stronger
//! signal exists, and it never fails. The signal rules are an ordered table of
//! keyword lists evaluated deterministically; confidence grows with the number
//! of matched keywords.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::JsonMap;

/// The closed set of intents the engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    GeneralChat,
    InfrastructureQuery,
    Troubleshooting,
    ResourceAnalysis,
    CostOptimization,
    MonitoringAlert,
    RemediationRequest,
    HelpRequest,
}

impl Intent {
    /// The stable wire name of this intent, e.g. `cost_optimization`.
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::GeneralChat => "general_chat",
            Intent::InfrastructureQuery => "infrastructure_query",
            Intent::Troubleshooting => "troubleshooting",
            Intent::ResourceAnalysis => "resource_analysis",
            Intent::CostOptimization => "cost_optimization",
            Intent::MonitoringAlert => "monitoring_alert",
            Intent::RemediationRequest => "remediation_request",
            Intent::HelpRequest => "help_request",
        }
    }
}

/// The outcome of classifying one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: Intent,
    /// Confidence in `[0, 1]`, monotone in the number of matched signals.
    pub confidence: f64,
    /// Entities extracted from the text, e.g. `resource_name`.
    pub entities: JsonMap,
}

/// Prior-conversation signal the classifier may consult.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyContext {
    /// Intent of the previous message in the conversation, if any.
    pub prior_intent: Option<Intent>,
}

struct IntentRule {
    intent: Intent,
    keywords: &'static [&'static str],
}

/// Confidence of the no-signal fallback.
const FALLBACK_CONFIDENCE: f64 = 0.35;
/// Confidence of a single matched keyword.
const BASE_CONFIDENCE: f64 = 0.55;
/// Added per matched keyword beyond the first.
const PER_SIGNAL_BOOST: f64 = 0.1;
/// Added when the prior message had the same intent.
const CONTINUITY_BOOST: f64 = 0.05;
/// Confidence never exceeds this.
const MAX_CONFIDENCE: f64 = 0.95;

/// Ordered rule table. Earlier rules win ties, so the more specific
/// operational intents come before the broad ones.
static INTENT_RULES: &[IntentRule] = &[
    IntentRule {
        intent: Intent::MonitoringAlert,
        keywords: &["alert", "alarm", "threshold", "firing", "paging", "notification"],
    },
    IntentRule {
        intent: Intent::RemediationRequest,
        keywords: &["restart", "reboot", "scale up", "scale down", "resize", "remediate", "rollback", "failover"],
    },
    IntentRule {
        intent: Intent::Troubleshooting,
        keywords: &["error", "failing", "failure", "broken", "crash", "timeout", "unreachable", "debug", "diagnose", "not working"],
    },
    IntentRule {
        intent: Intent::CostOptimization,
        keywords: &["cost", "spend", "spending", "billing", "budget", "cheaper", "savings", "expensive", "invoice"],
    },
    IntentRule {
        intent: Intent::ResourceAnalysis,
        keywords: &["utilization", "usage", "capacity", "trend", "analyze", "analysis", "performance", "bottleneck"],
    },
    IntentRule {
        intent: Intent::InfrastructureQuery,
        keywords: &["instance", "instances", "compute", "database", "bucket", "vcn", "subnet", "load balancer", "list", "show me", "status of"],
    },
    IntentRule {
        intent: Intent::HelpRequest,
        keywords: &["help", "how do i", "how to", "what can you", "explain", "guide"],
    },
];

lazy_static! {
    /// Entity extractors, run on the raw (pre-sanitization) text.
    static ref ENTITY_PATTERNS: Vec<(&'static str, Regex)> = vec![
        (
            "ocid",
            Regex::new(r"ocid1\.[a-z0-9]+\.[a-z0-9.\-]*[a-z0-9]").unwrap(),
        ),
        (
            "resource_name",
            Regex::new(r"(?i)\b(?:instance|host|server|database|bucket|vm)\s+([A-Za-z0-9][A-Za-z0-9._\-]+)").unwrap(),
        ),
        (
            "ip_address",
            Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap(),
        ),
    ];
}

fn extract_entities(text: &str) -> JsonMap {
    let mut entities = JsonMap::new();
    for (name, pattern) in ENTITY_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(text) {
            let matched = captures
                .get(1)
                .unwrap_or_else(|| captures.get(0).unwrap())
                .as_str();
            entities.insert((*name).to_string(), Value::String(matched.to_string()));
        }
    }
    entities
}

/// Classify operator text into exactly one intent. Never fails; absence of
/// signal is a valid low-confidence [Intent::GeneralChat] result.
pub fn classify(text: &str, context: &ClassifyContext) -> IntentResult {
    let lowered = text.to_lowercase();

    let mut best: Option<(&IntentRule, usize)> = None;
    for rule in INTENT_RULES {
        let hits = rule.keywords.iter().filter(|k| lowered.contains(*k)).count();
        if hits > 0 && best.map_or(true, |(_, best_hits)| hits > best_hits) {
            best = Some((rule, hits));
        }
    }

    let entities = extract_entities(text);
    match best {
        Some((rule, hits)) => {
            let mut confidence = BASE_CONFIDENCE + PER_SIGNAL_BOOST * (hits as f64 - 1.0);
            if context.prior_intent == Some(rule.intent) {
                confidence += CONTINUITY_BOOST;
            }
            IntentResult {
                intent: rule.intent,
                confidence: confidence.min(MAX_CONFIDENCE),
                entities,
            }
        }
        None => IntentResult {
            intent: Intent::GeneralChat,
            confidence: FALLBACK_CONFIDENCE,
            entities,
        },
    }
}

#[cfg(test)]
mod intent_tests {
    use super::*;

    #[test]
    fn test_neutral_text_falls_back_to_general_chat() {
        let result = classify("good morning!", &ClassifyContext::default());
        assert_eq!(Intent::GeneralChat, result.intent);
        assert!(result.confidence < 0.5);
    }

    #[test]
    fn test_cost_text_classifies_as_cost_optimization() {
        let result = classify(
            "why is my compute spend so expensive this billing cycle?",
            &ClassifyContext::default(),
        );
        assert_eq!(Intent::CostOptimization, result.intent);
        assert!(result.confidence > 0.6);
    }

    #[test]
    fn test_confidence_monotone_in_matched_keywords() {
        let ctx = ClassifyContext::default();
        let one = classify("there is an error", &ctx);
        let three = classify("there is an error, a timeout, and the host is unreachable", &ctx);
        assert_eq!(Intent::Troubleshooting, one.intent);
        assert_eq!(Intent::Troubleshooting, three.intent);
        assert!(three.confidence > one.confidence);
    }

    #[test]
    fn test_prior_intent_adds_continuity_boost() {
        let plain = classify("the alert is firing", &ClassifyContext::default());
        let continued = classify(
            "the alert is firing",
            &ClassifyContext { prior_intent: Some(Intent::MonitoringAlert) },
        );
        assert!(continued.confidence > plain.confidence);
    }

    #[test]
    fn test_extracts_resource_name_and_ocid() {
        let result = classify(
            "diagnose instance web-frontend-3 ocid1.instance.oc1.phx.abc123",
            &ClassifyContext::default(),
        );
        assert_eq!(
            Some("web-frontend-3"),
            result.entities.get("resource_name").and_then(|v| v.as_str())
        );
        assert!(result.entities.contains_key("ocid"));
    }

    #[test]
    fn test_confidence_stays_in_unit_interval() {
        let spam = "alert alarm threshold firing paging notification alert";
        let result = classify(spam, &ClassifyContext::default());
        assert!(result.confidence <= 1.0);
        assert!(result.confidence >= 0.0);
    }
}
