//! # Prompt templates
//!
//! A prompt sent to the model is simply a string. Before it becomes one, it
//! lives here as a [PromptTemplate]: a string with named placeholders in the
//! format `{[name]}`, plus optional JSON metadata.
//!
//! A [PartialPrompt] is a template with some placeholders filled. It can only
//! be constructed via [PromptTemplate::construct_prompt]. Placeholders are
//! filled with [PartialPrompt::try_fill] (strings) or
//! [PartialPrompt::try_fill_value] (any JSON value, rendered with
//! [render_value]). When every placeholder is filled, [PartialPrompt::complete]
//! produces the literal prompt text.
//!
//! Completion is deterministic: the same template filled with the same values
//! always yields a byte-identical string, which the cache fingerprinting
//! relies on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lazy_static::lazy_static;
use log::warn;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::prompt::errors::{PlaceholderNotExist, UnfilledPlaceholders};
use crate::utils::JsonMap;

lazy_static! {
    static ref PLACEHOLDER_MATCH_RE: Regex = Regex::new(r"\{\[.*?\]\}").unwrap();
}

/// Strips `{[` and `]}` from a matched placeholder. The caller must pass a
/// full regex match, which is always at least four bytes long.
#[inline]
fn strip_format(key: &str) -> &str {
    &key[2..key.len() - 2]
}

/// Collect the set of placeholder names appearing in a template string.
pub fn get_placeholders(string: &str) -> HashSet<String> {
    PLACEHOLDER_MATCH_RE
        .captures_iter(string)
        .map(|captures| strip_format(&captures[0]).to_string())
        .collect()
}

/// Render a JSON value into the text form used inside a prompt. Strings are
/// inserted verbatim (no surrounding quotes); everything else uses the
/// compact JSON encoding.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn replace_all_placeholders(original: &str, mapping: &HashMap<String, Option<String>>) -> String {
    PLACEHOLDER_MATCH_RE
        .replace_all(original, |captures: &Captures| {
            let key = strip_format(&captures[0]);
            mapping
                .get(key)
                .and_then(|v| v.as_deref())
                .unwrap_or("")
                .to_string()
        })
        .to_string()
}

/// A prompt template with `{[name]}` placeholders and optional JSON metadata.
#[derive(Debug, Clone)]
#[readonly::make]
pub struct PromptTemplate {
    /// The raw template text, immutable.
    template: Arc<String>,

    /// The placeholder names found in the template, readonly.
    pub placeholders: HashSet<String>,

    /// Metadata attached to the template, readonly.
    pub meta_data: Arc<JsonMap>,
}

impl PromptTemplate {
    /// Create a prompt template without metadata.
    pub fn new(template: impl Into<String>) -> Self {
        Self::with_metadata(template, JsonMap::new())
    }

    /// Create a prompt template with metadata. Warns if the template has no
    /// placeholder at all, which usually means a typo in the `{[name]}` syntax.
    pub fn with_metadata(template: impl Into<String>, metadata: JsonMap) -> Self {
        let template = template.into();
        let placeholders = get_placeholders(&template);
        if placeholders.is_empty() {
            warn!(
                "Prompt template has no placeholder. If this is intended, ignore this message. \
                 Otherwise, check the placeholder syntax.\nGot template:\n{}",
                template
            );
        }
        Self {
            template: Arc::new(template),
            placeholders,
            meta_data: Arc::new(metadata),
        }
    }

    /// The template text as a string.
    #[inline]
    pub fn str(&self) -> &str {
        &self.template
    }

    /// Fill placeholders from a variable mapping (keys the template does not
    /// use are ignored) and complete in one step. Errors if the mapping left
    /// any placeholder unfilled.
    pub fn render(&self, vars: &JsonMap) -> Result<String, UnfilledPlaceholders> {
        let mut partial = self.construct_prompt();
        for (name, value) in vars {
            if partial.placeholder_to_vals.contains_key(name) {
                partial.unfilled_placeholders.remove(name);
                partial
                    .placeholder_to_vals
                    .insert(name.clone(), Some(render_value(value)));
            }
        }
        partial.complete()
    }

    /// Begin filling this template.
    pub fn construct_prompt(&self) -> PartialPrompt {
        PartialPrompt {
            template: self.clone(),
            placeholder_to_vals: self.placeholders.iter().map(|p| (p.clone(), None)).collect(),
            unfilled_placeholders: self.placeholders.clone(),
        }
    }
}

/// A template with some placeholders filled. Constructed only via
/// [PromptTemplate::construct_prompt].
#[derive(Debug, Clone)]
#[readonly::make]
pub struct PartialPrompt {
    /// The template this partial prompt came from, readonly.
    pub template: PromptTemplate,

    pub(crate) placeholder_to_vals: HashMap<String, Option<String>>,
    pub(crate) unfilled_placeholders: HashSet<String>,
}

impl PartialPrompt {
    /// Fill a placeholder with a string value, replacing any previous value.
    /// Returns an error if the placeholder does not exist in the template.
    pub fn try_fill(
        &mut self,
        placeholder: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self, PlaceholderNotExist> {
        let placeholder = placeholder.into();
        if self.placeholder_to_vals.contains_key(&placeholder) {
            self.unfilled_placeholders.remove(&placeholder);
            self.placeholder_to_vals.insert(placeholder, Some(value.into()));
            Ok(self)
        } else {
            Err(PlaceholderNotExist::new(
                placeholder,
                value,
                &self.template.placeholders,
            ))
        }
    }

    /// Fill a placeholder with a JSON value, rendered via [render_value].
    pub fn try_fill_value(
        &mut self,
        placeholder: impl Into<String>,
        value: &Value,
    ) -> Result<&mut Self, PlaceholderNotExist> {
        self.try_fill(placeholder, render_value(value))
    }

    /// Fill every placeholder named in the mapping. Stops at the first
    /// unknown placeholder.
    pub fn try_fill_all(&mut self, mapping: &JsonMap) -> Result<&mut Self, PlaceholderNotExist> {
        for (name, value) in mapping {
            self.try_fill_value(name, value)?;
        }
        Ok(self)
    }

    /// Placeholder names still waiting for a value.
    pub fn unfilled(&self) -> impl Iterator<Item = &str> {
        self.unfilled_placeholders.iter().map(String::as_str)
    }

    /// Complete the prompt. Returns an error naming the unfilled placeholders
    /// if any remain.
    pub fn complete(&self) -> Result<String, UnfilledPlaceholders> {
        if self.unfilled_placeholders.is_empty() {
            Ok(replace_all_placeholders(
                self.template.str(),
                &self.placeholder_to_vals,
            ))
        } else {
            Err(UnfilledPlaceholders {
                all_placeholders: self.template.placeholders.iter().cloned().collect(),
                unfilled_placeholders: self.unfilled_placeholders.iter().cloned().collect(),
            })
        }
    }
}

pub mod errors {
    use std::collections::HashSet;
    use std::error::Error;
    use std::fmt;
    use std::fmt::Formatter;

    /// Error when completing a partial prompt that still has unfilled
    /// placeholders.
    #[derive(Debug)]
    pub struct UnfilledPlaceholders {
        pub unfilled_placeholders: Vec<String>,
        pub all_placeholders: Vec<String>,
    }

    impl fmt::Display for UnfilledPlaceholders {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "UnfilledPlaceholders: to complete the prompt,\n  Required placeholders: {:?}\n  Unfilled placeholders: {:?}",
                self.all_placeholders, self.unfilled_placeholders
            )
        }
    }

    impl Error for UnfilledPlaceholders {}

    /// Error when filling a placeholder that does not exist in the template.
    #[derive(Debug)]
    pub struct PlaceholderNotExist {
        pub try_fill_placeholder: String,
        pub value: String,
        pub available_placeholders: Vec<String>,
    }

    impl PlaceholderNotExist {
        pub(crate) fn new(
            try_fill_placeholder: impl Into<String>,
            value: impl Into<String>,
            available_placeholders: &HashSet<String>,
        ) -> Self {
            PlaceholderNotExist {
                try_fill_placeholder: try_fill_placeholder.into(),
                value: value.into(),
                available_placeholders: available_placeholders.iter().cloned().collect(),
            }
        }
    }

    impl fmt::Display for PlaceholderNotExist {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "PlaceholderNotExist: tried to fill placeholder = {} with value = {}, but available placeholders are {:?}",
                self.try_fill_placeholder, self.value, self.available_placeholders
            )
        }
    }

    impl Error for PlaceholderNotExist {}
}

#[cfg(test)]
mod prompt_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_placeholders() {
        let keys = get_placeholders("{[a]}");
        assert_eq!(HashSet::from(["a".to_string()]), keys);

        // Line breaks are not allowed inside a placeholder name.
        assert_eq!(0, get_placeholders("{[a\n]}").len());

        let keys = get_placeholders("{[a]}    {[b]}");
        assert_eq!(HashSet::from(["a".to_string(), "b".to_string()]), keys);
    }

    #[test]
    fn test_fill_and_complete() {
        let template = PromptTemplate::new("{[who]} and {[what]} and {[who]}");
        let mut partial = template.construct_prompt();
        partial.try_fill("who", "alice").unwrap();
        assert!(partial.complete().is_err());
        partial.try_fill("what", "bob").unwrap();
        assert_eq!("alice and bob and alice", partial.complete().unwrap());
    }

    #[test]
    fn test_fill_unknown_placeholder() {
        let template = PromptTemplate::new("{[a]}");
        let mut partial = template.construct_prompt();
        let err = partial.try_fill("nope", "x").unwrap_err();
        assert_eq!("nope", err.try_fill_placeholder);
        assert_eq!(vec!["a".to_string()], err.available_placeholders);
    }

    #[test]
    fn test_render_value() {
        assert_eq!("plain", render_value(&json!("plain")));
        assert_eq!("42", render_value(&json!(42)));
        assert_eq!("[1,2]", render_value(&json!([1, 2])));
    }

    #[test]
    fn test_fill_all_from_json_map() {
        let template = PromptTemplate::new("Spent {[cost_data]} in {[billing_period]}");
        let mut mapping = JsonMap::new();
        mapping.insert("cost_data".into(), json!("$500"));
        mapping.insert("billing_period".into(), json!("2026-07"));
        let mut partial = template.construct_prompt();
        partial.try_fill_all(&mapping).unwrap();
        assert_eq!("Spent $500 in 2026-07", partial.complete().unwrap());
    }

    #[test]
    fn test_render_ignores_extra_keys_and_reports_unfilled() {
        let template = PromptTemplate::new("{[a]} {[b]}");
        let mut vars = JsonMap::new();
        vars.insert("a".into(), json!("x"));
        vars.insert("unused".into(), json!("y"));
        let err = template.render(&vars).unwrap_err();
        assert_eq!(vec!["b".to_string()], err.unfilled_placeholders);

        vars.insert("b".into(), json!("z"));
        assert_eq!("x z", template.render(&vars).unwrap());
    }

    #[test]
    fn test_completion_is_deterministic() {
        let template = PromptTemplate::new("{[x]} / {[y]}");
        let render = || {
            let mut partial = template.construct_prompt();
            partial.try_fill("x", "1").unwrap().try_fill("y", "2").unwrap();
            partial.complete().unwrap()
        };
        assert_eq!(render(), render());
    }
}
