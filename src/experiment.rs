//! # A/B experiments over prompt variants
//!
//! Each test compares two prompt variants under a hypothesis. Assignment is a
//! deterministic hash of `(test_id, user_id)` mapped onto the traffic-split
//! boundaries: the same pair lands on the same variant for the lifetime of
//! the test, across process restarts, with nothing remembered per user.
//!
//! Outcome recording is additive only: aggregates are updated under a write
//! lock and prior samples are never overwritten. Evaluation runs a standard
//! two-proportion z-test, implemented as a pure numeric function so it can be
//! unit-tested without the rest of the engine. Until both variants reach the
//! configured minimum sample size, evaluation reports insufficient data
//! instead of a false conclusion; that is a qualified result, not an error.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::utils::hashing::stable_unit_interval;

/// Significance threshold used for the recommendation.
const SIGNIFICANCE_ALPHA: f64 = 0.05;
/// Tolerance when validating that a traffic split sums to 1.0.
const SPLIT_EPSILON: f64 = 1e-6;

/// One treatment arm: a variant name bound to a template version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantArm {
    pub name: String,
    pub template_id: String,
    pub template_version: u32,
}

/// Accumulated per-variant outcome aggregates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantMetrics {
    pub samples: u64,
    pub successes: u64,
    pub total_latency: Duration,
}

impl VariantMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.successes as f64 / self.samples as f64
        }
    }

    pub fn mean_latency(&self) -> Duration {
        if self.samples == 0 {
            Duration::ZERO
        } else {
            self.total_latency / self.samples as u32
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Draft,
    Running,
    Concluded,
}

/// An A/B test over two prompt variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTest {
    pub id: String,
    pub hypothesis: String,
    pub variants: Vec<VariantArm>,
    /// Traffic share per variant, same order as `variants`; sums to 1.0.
    pub traffic_split: Vec<f64>,
    pub min_sample_size: u64,
    pub status: TestStatus,
    pub metrics: HashMap<String, VariantMetrics>,
}

impl AbTest {
    pub fn new(
        id: impl Into<String>,
        hypothesis: impl Into<String>,
        variants: Vec<VariantArm>,
        traffic_split: Vec<f64>,
        min_sample_size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            hypothesis: hypothesis.into(),
            variants,
            traffic_split,
            min_sample_size,
            status: TestStatus::Draft,
            metrics: HashMap::new(),
        }
    }
}

/// The outcome of evaluating a test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Evaluation {
    /// One or both variants have not reached the minimum sample size. A valid
    /// qualified result, not an error.
    InsufficientData {
        required: u64,
        counts: Vec<(String, u64)>,
    },
    Report(SignificanceReport),
}

/// Two-variant comparison via a two-proportion z-test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignificanceReport {
    pub variant_a: String,
    pub variant_b: String,
    pub rate_a: f64,
    pub rate_b: f64,
    pub z_score: f64,
    pub p_value: f64,
    pub significant: bool,
    pub recommendation: String,
}

/// Shared experiment store, safe for concurrent assignment and recording
/// from many conversations.
pub struct AbEngine {
    tests: RwLock<HashMap<String, AbTest>>,
}

impl AbEngine {
    pub fn new() -> Self {
        Self { tests: RwLock::new(HashMap::new()) }
    }

    /// Register a draft test.
    pub async fn create_test(&self, test: AbTest) -> Result<(), errors::ExperimentError> {
        let mut tests = self.tests.write().await;
        if tests.contains_key(&test.id) {
            return Err(errors::ExperimentError::DuplicateTest { id: test.id });
        }
        tests.insert(test.id.clone(), test);
        Ok(())
    }

    /// Transition a draft test to running. Requires exactly two variants and
    /// a traffic split that covers them and sums to 1.0.
    pub async fn start(&self, test_id: &str) -> Result<(), errors::ExperimentError> {
        let mut tests = self.tests.write().await;
        let test = tests
            .get_mut(test_id)
            .ok_or_else(|| errors::ExperimentError::UnknownTest { id: test_id.to_string() })?;
        if test.status != TestStatus::Draft {
            return Err(errors::ExperimentError::InvalidTransition {
                id: test_id.to_string(),
                from: test.status,
            });
        }
        if test.variants.len() != 2 || test.traffic_split.len() != 2 {
            return Err(errors::ExperimentError::MalformedTest {
                id: test_id.to_string(),
                reason: "a test compares exactly two variants".to_string(),
            });
        }
        let split_sum: f64 = test.traffic_split.iter().sum();
        if (split_sum - 1.0).abs() > SPLIT_EPSILON {
            return Err(errors::ExperimentError::MalformedTest {
                id: test_id.to_string(),
                reason: format!("traffic split sums to {}, expected 1.0", split_sum),
            });
        }
        test.status = TestStatus::Running;
        Ok(())
    }

    /// Conclude a running test. Assignment and recording stop; evaluation
    /// stays available.
    pub async fn conclude(&self, test_id: &str) -> Result<(), errors::ExperimentError> {
        let mut tests = self.tests.write().await;
        let test = tests
            .get_mut(test_id)
            .ok_or_else(|| errors::ExperimentError::UnknownTest { id: test_id.to_string() })?;
        if test.status != TestStatus::Running {
            return Err(errors::ExperimentError::InvalidTransition {
                id: test_id.to_string(),
                from: test.status,
            });
        }
        test.status = TestStatus::Concluded;
        Ok(())
    }

    /// Deterministically assign a user to a variant of a running test,
    /// returning the full arm so the caller knows which template and version
    /// the variant binds.
    pub async fn assign_arm(
        &self,
        test_id: &str,
        user_id: &str,
    ) -> Result<VariantArm, errors::ExperimentError> {
        let tests = self.tests.read().await;
        let test = tests
            .get(test_id)
            .ok_or_else(|| errors::ExperimentError::UnknownTest { id: test_id.to_string() })?;
        if test.status != TestStatus::Running {
            return Err(errors::ExperimentError::NotRunning {
                id: test_id.to_string(),
                status: test.status,
            });
        }
        let point = stable_unit_interval(&[test_id, user_id]);
        let mut boundary = 0.0;
        for (arm, share) in test.variants.iter().zip(&test.traffic_split) {
            boundary += share;
            if point < boundary {
                debug!("assign {}/{} -> {}", test_id, user_id, arm.name);
                return Ok(arm.clone());
            }
        }
        // Rounding in the split can leave the last sliver uncovered.
        Ok(test.variants[test.variants.len() - 1].clone())
    }

    /// Deterministically assign a user to a variant; name only.
    pub async fn assign(
        &self,
        test_id: &str,
        user_id: &str,
    ) -> Result<String, errors::ExperimentError> {
        self.assign_arm(test_id, user_id).await.map(|arm| arm.name)
    }

    /// Record one outcome for a variant. Additive only.
    pub async fn record_outcome(
        &self,
        test_id: &str,
        variant: &str,
        success: bool,
        latency: Duration,
    ) -> Result<(), errors::ExperimentError> {
        let mut tests = self.tests.write().await;
        let test = tests
            .get_mut(test_id)
            .ok_or_else(|| errors::ExperimentError::UnknownTest { id: test_id.to_string() })?;
        if test.status != TestStatus::Running {
            return Err(errors::ExperimentError::NotRunning {
                id: test_id.to_string(),
                status: test.status,
            });
        }
        if !test.variants.iter().any(|arm| arm.name == variant) {
            return Err(errors::ExperimentError::UnknownVariant {
                id: test_id.to_string(),
                variant: variant.to_string(),
            });
        }
        let metrics = test.metrics.entry(variant.to_string()).or_default();
        metrics.samples += 1;
        if success {
            metrics.successes += 1;
        }
        metrics.total_latency += latency;
        Ok(())
    }

    /// Evaluate a test. Reports insufficient data unless both variants have
    /// reached the minimum sample size.
    pub async fn evaluate(&self, test_id: &str) -> Result<Evaluation, errors::ExperimentError> {
        let tests = self.tests.read().await;
        let test = tests
            .get(test_id)
            .ok_or_else(|| errors::ExperimentError::UnknownTest { id: test_id.to_string() })?;
        if test.variants.len() != 2 {
            return Err(errors::ExperimentError::MalformedTest {
                id: test_id.to_string(),
                reason: "evaluation requires exactly two variants".to_string(),
            });
        }

        let arm_a = &test.variants[0];
        let arm_b = &test.variants[1];
        let metrics_a = test.metrics.get(&arm_a.name).cloned().unwrap_or_default();
        let metrics_b = test.metrics.get(&arm_b.name).cloned().unwrap_or_default();

        if metrics_a.samples < test.min_sample_size || metrics_b.samples < test.min_sample_size {
            return Ok(Evaluation::InsufficientData {
                required: test.min_sample_size,
                counts: vec![
                    (arm_a.name.clone(), metrics_a.samples),
                    (arm_b.name.clone(), metrics_b.samples),
                ],
            });
        }

        let (z_score, p_value) = two_proportion_z_test(
            metrics_a.successes,
            metrics_a.samples,
            metrics_b.successes,
            metrics_b.samples,
        );
        let rate_a = metrics_a.success_rate();
        let rate_b = metrics_b.success_rate();
        let significant = p_value < SIGNIFICANCE_ALPHA;
        let recommendation = if !significant {
            format!(
                "No significant difference between {} and {} (p = {:.4}); keep collecting data or conclude with the current default.",
                arm_a.name, arm_b.name, p_value
            )
        } else if rate_a > rate_b {
            format!("Promote {} (p = {:.4}).", arm_a.name, p_value)
        } else {
            format!("Promote {} (p = {:.4}).", arm_b.name, p_value)
        };

        Ok(Evaluation::Report(SignificanceReport {
            variant_a: arm_a.name.clone(),
            variant_b: arm_b.name.clone(),
            rate_a,
            rate_b,
            z_score,
            p_value,
            significant,
            recommendation,
        }))
    }

    /// Snapshot of a test for inspection.
    pub async fn get(&self, test_id: &str) -> Option<AbTest> {
        self.tests.read().await.get(test_id).cloned()
    }
}

impl Default for AbEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Two-proportion z-test over `(successes, trials)` pairs, using the pooled
/// success rate. Returns `(z, two-tailed p)`. Degenerate inputs (zero trials
/// or zero pooled variance) yield `(0.0, 1.0)`.
pub fn two_proportion_z_test(
    successes_a: u64,
    trials_a: u64,
    successes_b: u64,
    trials_b: u64,
) -> (f64, f64) {
    if trials_a == 0 || trials_b == 0 {
        return (0.0, 1.0);
    }
    let n_a = trials_a as f64;
    let n_b = trials_b as f64;
    let p_a = successes_a as f64 / n_a;
    let p_b = successes_b as f64 / n_b;
    let pooled = (successes_a + successes_b) as f64 / (n_a + n_b);
    let variance = pooled * (1.0 - pooled) * (1.0 / n_a + 1.0 / n_b);
    if variance <= 0.0 {
        return (0.0, 1.0);
    }
    let z = (p_a - p_b) / variance.sqrt();
    let p_value = 2.0 * (1.0 - standard_normal_cdf(z.abs()));
    (z, p_value.clamp(0.0, 1.0))
}

/// Standard normal CDF, Abramowitz & Stegun 26.2.17 approximation.
fn standard_normal_cdf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.231_641_9 * x.abs());
    let poly = t
        * (0.319_381_530
            + t * (-0.356_563_782 + t * (1.781_477_937 + t * (-1.821_255_978 + t * 1.330_274_429))));
    let tail = (-(x * x) / 2.0).exp() / (2.0 * std::f64::consts::PI).sqrt() * poly;
    if x >= 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

pub mod errors {
    use std::error::Error;
    use std::fmt;
    use std::fmt::Formatter;

    use super::TestStatus;

    #[derive(Debug)]
    pub enum ExperimentError {
        UnknownTest { id: String },
        DuplicateTest { id: String },
        UnknownVariant { id: String, variant: String },
        NotRunning { id: String, status: TestStatus },
        InvalidTransition { id: String, from: TestStatus },
        MalformedTest { id: String, reason: String },
    }

    impl fmt::Display for ExperimentError {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            match self {
                ExperimentError::UnknownTest { id } => write!(f, "UnknownTest: {}", id),
                ExperimentError::DuplicateTest { id } => write!(f, "DuplicateTest: {}", id),
                ExperimentError::UnknownVariant { id, variant } => {
                    write!(f, "UnknownVariant: test {} has no variant {}", id, variant)
                }
                ExperimentError::NotRunning { id, status } => {
                    write!(f, "NotRunning: test {} is {:?}", id, status)
                }
                ExperimentError::InvalidTransition { id, from } => {
                    write!(f, "InvalidTransition: test {} cannot leave {:?} this way", id, from)
                }
                ExperimentError::MalformedTest { id, reason } => {
                    write!(f, "MalformedTest: {}: {}", id, reason)
                }
            }
        }
    }

    impl Error for ExperimentError {}
}
