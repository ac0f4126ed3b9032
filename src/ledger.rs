//! # Version ledger and promotion quality gate
//!
//! Tracks template revisions and where each environment points. Every edit
//! appends a new version in `Draft` status. Promotion to `Staging` or
//! `Production` is gated: the candidate version is run against a fixed
//! battery of test cases, each case is scored by the quality assessor, and a
//! case passes only when every dimension meets the environment minimums
//! (staging thresholds sit below production's). Promotion requires a pass
//! rate of at least 0.8.
//!
//! A failed gate leaves the version in `Draft` and the environment pointer
//! untouched (there is no implicit rollback), but the gate run is kept in
//! the version's history either way.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::quality::{QualityAssessor, QualityScore};

/// Pass rate a battery must reach for promotion.
const REQUIRED_PASS_RATE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Staging,
    Production,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Production
    }
}

impl Environment {
    /// Per-dimension minimum scores a case must meet in this environment.
    pub fn thresholds(self) -> DimensionThresholds {
        match self {
            Environment::Staging => DimensionThresholds {
                completeness: 0.5,
                structure: 0.25,
                actionability: 0.4,
                technical_depth: 0.2,
            },
            Environment::Production => DimensionThresholds {
                completeness: 0.7,
                structure: 0.5,
                actionability: 0.6,
                technical_depth: 0.4,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DimensionThresholds {
    pub completeness: f64,
    pub structure: f64,
    pub actionability: f64,
    pub technical_depth: f64,
}

impl DimensionThresholds {
    fn met_by(&self, score: &QualityScore) -> bool {
        score.completeness >= self.completeness
            && score.structure >= self.structure
            && score.actionability >= self.actionability
            && score.technical_depth >= self.technical_depth
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Draft,
    Staging,
    Production,
}

/// One case of a promotion battery: a recorded rendering of the candidate
/// template and the elements its response must contain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCase {
    pub response: String,
    pub expected_elements: Vec<String>,
    pub latency: std::time::Duration,
}

/// Result of running the battery once against one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRun {
    pub environment: Environment,
    pub case_count: usize,
    pub passed_cases: usize,
    pub pass_rate: f64,
    pub passed: bool,
    pub at: DateTime<Utc>,
}

/// A single revision of a template's text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub version: u32,
    pub text: String,
    pub author: String,
    pub status: VersionStatus,
    pub created_at: DateTime<Utc>,
    pub gate_history: Vec<GateRun>,
}

#[derive(Debug, Clone, Default)]
struct LedgerEntry {
    versions: Vec<TemplateVersion>,
    pointers: HashMap<Environment, u32>,
}

/// Shared revision store for all templates.
pub struct VersionLedger {
    entries: RwLock<HashMap<String, LedgerEntry>>,
}

impl VersionLedger {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// A ledger pre-populated with existing versions, used when seeding a
    /// template library whose entries already carry version numbers.
    pub fn seeded(initial: impl IntoIterator<Item = (String, TemplateVersion)>) -> Self {
        let mut entries: HashMap<String, LedgerEntry> = HashMap::new();
        for (template_id, version) in initial {
            entries.entry(template_id).or_default().versions.push(version);
        }
        Self { entries: RwLock::new(entries) }
    }

    /// Record an edit: appends a new `Draft` version and returns its number.
    pub async fn record_edit(
        &self,
        template_id: &str,
        text: impl Into<String>,
        author: impl Into<String>,
    ) -> u32 {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(template_id.to_string()).or_default();
        let version = entry.versions.last().map_or(1, |v| v.version + 1);
        entry.versions.push(TemplateVersion {
            version,
            text: text.into(),
            author: author.into(),
            status: VersionStatus::Draft,
            created_at: Utc::now(),
            gate_history: Vec::new(),
        });
        version
    }

    /// Run the promotion gate for a version. On success the environment
    /// pointer moves to it; on failure the version stays `Draft`. The gate
    /// run is recorded in the version history either way.
    pub async fn promote(
        &self,
        template_id: &str,
        version: u32,
        environment: Environment,
        battery: &[GateCase],
        assessor: &QualityAssessor,
    ) -> Result<GateRun, errors::LedgerError> {
        let thresholds = environment.thresholds();
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(template_id)
            .ok_or_else(|| errors::LedgerError::UnknownTemplate { id: template_id.to_string() })?;
        let record = entry
            .versions
            .iter_mut()
            .find(|v| v.version == version)
            .ok_or(errors::LedgerError::UnknownVersion { id: template_id.to_string(), version })?;

        let passed_cases = battery
            .iter()
            .filter(|case| {
                let score = assessor.score(&case.response, &case.expected_elements, case.latency);
                thresholds.met_by(&score)
            })
            .count();
        let pass_rate = if battery.is_empty() {
            0.0
        } else {
            passed_cases as f64 / battery.len() as f64
        };
        let passed = pass_rate >= REQUIRED_PASS_RATE;

        let run = GateRun {
            environment,
            case_count: battery.len(),
            passed_cases,
            pass_rate,
            passed,
            at: Utc::now(),
        };
        record.gate_history.push(run.clone());

        if passed {
            record.status = match environment {
                Environment::Staging => VersionStatus::Staging,
                Environment::Production => VersionStatus::Production,
            };
            entry.pointers.insert(environment, version);
            info!(
                "promoted {} v{} to {:?} (pass rate {:.2})",
                template_id, version, environment, pass_rate
            );
        }
        Ok(run)
    }

    /// The recorded text of one version, if it exists.
    pub async fn version_text(&self, template_id: &str, version: u32) -> Option<String> {
        let entries = self.entries.read().await;
        entries
            .get(template_id)?
            .versions
            .iter()
            .find(|v| v.version == version)
            .map(|v| v.text.clone())
    }

    /// The version an environment currently points at, if any.
    pub async fn active_version(&self, template_id: &str, environment: Environment) -> Option<u32> {
        let entries = self.entries.read().await;
        entries
            .get(template_id)
            .and_then(|entry| entry.pointers.get(&environment).copied())
    }

    /// Snapshot of a template's revision history.
    pub async fn versions(&self, template_id: &str) -> Vec<TemplateVersion> {
        let entries = self.entries.read().await;
        entries
            .get(template_id)
            .map(|entry| entry.versions.clone())
            .unwrap_or_default()
    }
}

impl Default for VersionLedger {
    fn default() -> Self {
        Self::new()
    }
}

pub mod errors {
    use std::error::Error;
    use std::fmt;
    use std::fmt::Formatter;

    #[derive(Debug)]
    pub enum LedgerError {
        UnknownTemplate { id: String },
        UnknownVersion { id: String, version: u32 },
    }

    impl fmt::Display for LedgerError {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            match self {
                LedgerError::UnknownTemplate { id } => write!(f, "UnknownTemplate: {}", id),
                LedgerError::UnknownVersion { id, version } => {
                    write!(f, "UnknownVersion: {} has no version {}", id, version)
                }
            }
        }
    }

    impl Error for LedgerError {}
}

#[cfg(test)]
mod ledger_tests {
    use super::*;
    use std::time::Duration;

    fn strong_case() -> GateCase {
        GateCase {
            response: "## Findings\n1. CPU utilization is saturated; memory headroom is low.\n\
                       - You should resize the instance and enable autoscaling.\n\
                       - Review the load balancer latency metric and configure alarms.\n\
                       **Summary**: scale the fleet and migrate the database tier."
                .to_string(),
            expected_elements: vec!["cpu".to_string(), "memory".to_string()],
            latency: Duration::from_millis(200),
        }
    }

    fn weak_case() -> GateCase {
        GateCase {
            response: "Looks fine to me.".to_string(),
            expected_elements: vec!["cpu".to_string(), "memory".to_string()],
            latency: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_edit_appends_draft_versions() {
        let ledger = VersionLedger::new();
        assert_eq!(1, ledger.record_edit("cost_analysis", "v1 text", "ana").await);
        assert_eq!(2, ledger.record_edit("cost_analysis", "v2 text", "ana").await);
        let versions = ledger.versions("cost_analysis").await;
        assert_eq!(2, versions.len());
        assert!(versions.iter().all(|v| v.status == VersionStatus::Draft));
    }

    #[tokio::test]
    async fn test_promotion_passes_with_strong_battery() {
        let ledger = VersionLedger::new();
        let assessor = QualityAssessor::with_defaults();
        let version = ledger.record_edit("cost_analysis", "text", "ana").await;
        let battery: Vec<GateCase> = (0..5).map(|_| strong_case()).collect();

        let run = ledger
            .promote("cost_analysis", version, Environment::Staging, &battery, &assessor)
            .await
            .unwrap();
        assert!(run.passed, "pass rate {}", run.pass_rate);
        assert_eq!(Some(version), ledger.active_version("cost_analysis", Environment::Staging).await);
        let versions = ledger.versions("cost_analysis").await;
        assert_eq!(VersionStatus::Staging, versions[0].status);
    }

    #[tokio::test]
    async fn test_failed_gate_leaves_draft_and_keeps_history() {
        let ledger = VersionLedger::new();
        let assessor = QualityAssessor::with_defaults();
        let version = ledger.record_edit("cost_analysis", "text", "ana").await;
        // Two weak cases out of five: pass rate 0.6 < 0.8.
        let battery = vec![strong_case(), strong_case(), strong_case(), weak_case(), weak_case()];

        let run = ledger
            .promote("cost_analysis", version, Environment::Production, &battery, &assessor)
            .await
            .unwrap();
        assert!(!run.passed);
        assert_eq!(None, ledger.active_version("cost_analysis", Environment::Production).await);
        let versions = ledger.versions("cost_analysis").await;
        assert_eq!(VersionStatus::Draft, versions[0].status);
        assert_eq!(1, versions[0].gate_history.len());
    }

    #[tokio::test]
    async fn test_staging_thresholds_below_production() {
        let staging = Environment::Staging.thresholds();
        let production = Environment::Production.thresholds();
        assert!(staging.completeness < production.completeness);
        assert!(staging.structure < production.structure);
        assert!(staging.actionability < production.actionability);
        assert!(staging.technical_depth < production.technical_depth);
    }

    #[tokio::test]
    async fn test_promote_unknown_version_fails() {
        let ledger = VersionLedger::new();
        let assessor = QualityAssessor::with_defaults();
        ledger.record_edit("cost_analysis", "text", "ana").await;
        let err = ledger
            .promote("cost_analysis", 9, Environment::Staging, &[], &assessor)
            .await
            .unwrap_err();
        assert!(matches!(err, errors::LedgerError::UnknownVersion { version: 9, .. }));
    }
}
