//! # Response quality assessor
//!
//! Scores a generated response across four independent dimensions and folds
//! them into a weighted overall score:
//!
//! * **completeness**: expected elements found in the response, case-insensitively
//! * **structure**: presence of numbered lists, bold headers, bullet points, section labels
//! * **actionability**: density of actionable keywords, saturating at five hits
//! * **technical depth**: density of technical keywords, saturating at five hits
//!
//! The weights and keyword lists are configuration, not hidden constants. A
//! weight set that does not sum to 1.0 (± 1e-6) is rejected when the assessor
//! is constructed, so a misconfigured deployment fails at startup rather than
//! producing skewed scores. Scoring is advisory at generation time; the only
//! hard gate is template promotion in the version ledger.

use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// How many keyword hits saturate the actionability and depth dimensions.
const KEYWORD_SATURATION: usize = 5;
/// Tolerance when checking that weights sum to 1.0.
const WEIGHT_EPSILON: f64 = 1e-6;

/// Per-dimension weights for the overall score. Must sum to 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityWeights {
    pub completeness: f64,
    pub structure: f64,
    pub actionability: f64,
    pub technical_depth: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            completeness: 0.3,
            structure: 0.2,
            actionability: 0.3,
            technical_depth: 0.2,
        }
    }
}

impl QualityWeights {
    fn sum(&self) -> f64 {
        self.completeness + self.structure + self.actionability + self.technical_depth
    }
}

/// Assessor configuration: weights plus the keyword lists behind the
/// actionability and technical-depth dimensions. The defaults are
/// illustrative, not a contract; override them per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    pub weights: QualityWeights,
    pub actionability_keywords: Vec<String>,
    pub technical_keywords: Vec<String>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        let actionability = [
            "recommend", "should", "configure", "enable", "disable", "scale",
            "resize", "restart", "migrate", "upgrade", "review", "reduce",
        ];
        let technical = [
            "cpu", "memory", "throughput", "latency", "iops", "bandwidth",
            "vcn", "subnet", "load balancer", "autoscaling", "oci", "metric",
            "utilization", "instance",
        ];
        Self {
            weights: QualityWeights::default(),
            actionability_keywords: actionability.iter().map(|s| s.to_string()).collect(),
            technical_keywords: technical.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl QualityConfig {
    /// Load a configuration from JSON, e.g. a deployment config file.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config)
    }
}

/// An immutable quality snapshot for one response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityScore {
    pub completeness: f64,
    pub structure: f64,
    pub actionability: f64,
    pub technical_depth: f64,
    /// Weighted sum of the four dimensions.
    pub overall: f64,
    /// Latency of the generation that produced the response, for reporting.
    pub latency: Duration,
}

impl QualityScore {
    /// Dimension scores as `(name, value)` pairs, in a fixed order.
    pub fn dimensions(&self) -> [(&'static str, f64); 4] {
        [
            ("completeness", self.completeness),
            ("structure", self.structure),
            ("actionability", self.actionability),
            ("technical_depth", self.technical_depth),
        ]
    }
}

lazy_static! {
    /// The four structural signals, each worth a quarter of the structure
    /// dimension.
    static ref STRUCTURE_SIGNALS: Vec<Regex> = vec![
        Regex::new(r"(?m)^\s*\d+[.)]\s").unwrap(),      // numbered list
        Regex::new(r"\*\*[^*\n]+\*\*").unwrap(),        // bold header
        Regex::new(r"(?m)^\s*[-*]\s").unwrap(),         // bullet point
        Regex::new(r"(?m)^#{1,6}\s|^[A-Z][A-Za-z ]{2,40}:\s*$").unwrap(), // section label
    ];
}

/// Scores responses under a validated [QualityConfig].
#[derive(Debug, Clone)]
pub struct QualityAssessor {
    config: QualityConfig,
}

impl QualityAssessor {
    /// Build an assessor, validating the weight configuration. This is the
    /// fail-fast point for misconfigured weights.
    pub fn new(config: QualityConfig) -> Result<Self, errors::InvalidWeights> {
        let sum = config.weights.sum();
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(errors::InvalidWeights { sum });
        }
        Ok(Self { config })
    }

    /// Assessor with the default illustrative configuration.
    pub fn with_defaults() -> Self {
        // Default weights sum to exactly 1.0.
        Self::new(QualityConfig::default()).unwrap_or_else(|_| unreachable!())
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Score a response. `expected_elements` come from the template or query;
    /// an empty set means completeness is trivially 1.0.
    pub fn score(
        &self,
        response: &str,
        expected_elements: &[String],
        latency: Duration,
    ) -> QualityScore {
        let lowered = response.to_lowercase();

        let completeness = if expected_elements.is_empty() {
            1.0
        } else {
            let found = expected_elements
                .iter()
                .filter(|e| lowered.contains(&e.to_lowercase()))
                .count();
            (found as f64 / expected_elements.len() as f64).clamp(0.0, 1.0)
        };

        let structure = STRUCTURE_SIGNALS
            .iter()
            .filter(|signal| signal.is_match(response))
            .count() as f64
            * 0.25;
        let structure = structure.min(1.0);

        let actionability = keyword_density(&lowered, &self.config.actionability_keywords);
        let technical_depth = keyword_density(&lowered, &self.config.technical_keywords);

        let w = &self.config.weights;
        let overall = completeness * w.completeness
            + structure * w.structure
            + actionability * w.actionability
            + technical_depth * w.technical_depth;

        QualityScore {
            completeness,
            structure,
            actionability,
            technical_depth,
            overall,
            latency,
        }
    }
}

fn keyword_density(lowered_text: &str, keywords: &[String]) -> f64 {
    let hits = keywords
        .iter()
        .filter(|k| lowered_text.contains(k.as_str()))
        .count();
    (hits as f64 / KEYWORD_SATURATION as f64).min(1.0)
}

pub mod errors {
    use std::error::Error;
    use std::fmt;
    use std::fmt::Formatter;

    /// Error when the configured quality weights do not sum to 1.0.
    #[derive(Debug)]
    pub struct InvalidWeights {
        pub sum: f64,
    }

    impl fmt::Display for InvalidWeights {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "InvalidWeights: quality weights must sum to 1.0, got {}",
                self.sum
            )
        }
    }

    impl Error for InvalidWeights {}
}
