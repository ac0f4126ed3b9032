//! # promptops
//!
//! Prompt-centric engine for conversational cloud-operations assistants.
//!
//! `promptops` turns a free-text operator query into a well-formed prompt for
//! an LLM backend, decides between free chat and a templated diagnostic
//! query, tracks the quality and cost of every exchange, and improves the
//! prompt library through controlled experiments. It deliberately stops at
//! the engine boundary: HTTP routing, authentication, telemetry polling, and
//! the model call itself belong to the host application.
//!
//! ## Concepts and design
//!
//! The API follows data-driven design: every step that composes a prompt is
//! explicit and trackable, and the hierarchy stays as flat as possible.
//! Shared state (templates, experiments, the cache) lives in explicit store
//! objects handed to the engine at construction; there is no ambient global
//! state.
//!
//! ### Prompt template and placeholder
//!
//! A template is a string with named placeholders in the `{[name]}` format:
//!
//! ```text
//! Analyze the following spend data for billing period {[billing_period]}:
//! {[cost_data]}
//! ```
//!
//! Templates live in the [registry](crate::registry) with a declared variable
//! schema (required flag, type, default), a minimum caller role, and a
//! version number. [validate_and_bind](crate::registry::validate_and_bind)
//! checks caller-supplied variables against the schema before anything
//! reaches the model.
//!
//! ### The pipeline
//!
//! For each inbound message the [engine](crate::engine::PromptEngine) runs:
//!
//! 1. [intent classification](crate::intent::classify), total and pure;
//!    neutral text is a valid low-confidence `general_chat` result
//! 2. template lookup and parameter binding, when a template is requested
//! 3. [sanitization](crate::sanitize) of all data entering the prompt
//! 4. [composition](crate::compose::PromptComposer) with fixed section
//!    ordering, byte-identical output for identical inputs
//! 5. the [adaptive cache](crate::cache::AdaptiveCache): fingerprint
//!    lookup with single-flight generation on a miss
//! 6. [quality scoring](crate::quality::QualityAssessor) of the response
//! 7. [experiment](crate::experiment::AbEngine) outcome recording
//!
//! ### Experiments and promotion
//!
//! Prompt variants compete in A/B tests with hash-stable user assignment and
//! a two-proportion significance test that refuses to conclude before both
//! arms reach their minimum sample size. Template revisions move from draft
//! to staging to production only through the
//! [version ledger](crate::ledger::VersionLedger)'s quality gate.
//!
//! ## Endpoint or LLM
//!
//! The endpoint of the pipeline is the model, reached through the
//! [GenerateText](crate::llm::GenerateText) trait: prompt in, generated text
//! plus token count and latency out. The engine surfaces backend failures
//! unchanged and never falls back to mock content.

pub mod cache;
pub mod compose;
pub mod conversation;
pub mod engine;
pub mod experiment;
pub mod intent;
pub mod ledger;
pub mod llm;
pub mod prompt;
pub mod quality;
pub mod registry;
pub mod sanitize;
pub mod utils;
