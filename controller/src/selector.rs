//! Priority-ordered selector evaluation against an immutable, compiled
//! rule set. A new set is built wholesale on every reconciliation and
//! swapped in atomically; classification never observes a partial mix.

use model::query::QuerySubmission;
use model::selector::SelectorSpec;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("Selector {id} has an invalid pattern '{pattern}': {source}")]
pub struct SelectorCompileError {
    pub id: i64,
    pub pattern: String,
    #[source]
    source: regex::Error,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("Query did not match any selector")]
    NoMatch,
}

#[derive(Debug)]
struct CompiledSelector {
    spec: SelectorSpec,
    user_regex: Option<Regex>,
    source_regex: Option<Regex>,
    schema_regex: Option<Regex>,
}

impl CompiledSelector {
    fn matches(&self, submission: &QuerySubmission) -> bool {
        if let Some(regex) = &self.user_regex {
            if !regex.is_match(&submission.user) {
                return false;
            }
        }
        if let Some(regex) = &self.source_regex {
            match &submission.source {
                Some(source) if regex.is_match(source) => {}
                _ => return false,
            }
        }
        if let Some(required) = self.spec.query_type {
            if submission.query_type != Some(required) {
                return false;
            }
        }
        if !self
            .spec
            .client_tags
            .iter()
            .all(|tag| submission.client_tags.contains(tag))
        {
            return false;
        }
        if let Some(regex) = &self.schema_regex {
            match &submission.schema {
                Some(schema) if regex.is_match(schema) => {}
                _ => return false,
            }
        }
        true
    }
}

/// One immutable generation of the selector rule set.
#[derive(Debug)]
pub struct SelectorIndex {
    selectors: Vec<CompiledSelector>,
}

impl SelectorIndex {
    pub fn empty() -> Self {
        Self {
            selectors: Vec::new(),
        }
    }

    /// Compile every pattern up front; one bad pattern rejects the
    /// whole set so the previous generation stays in effect.
    pub fn compile(specs: &[SelectorSpec]) -> Result<Self, SelectorCompileError> {
        let mut selectors = Vec::with_capacity(specs.len());
        for spec in specs {
            let compile = |pattern: &Option<String>| {
                pattern
                    .as_deref()
                    .map(|pattern| {
                        // Patterns match the whole value, not a substring.
                        // Case sensitivity stays per pattern via `(?i)`.
                        Regex::new(&format!(r"\A(?:{pattern})\z")).map_err(|source| {
                            SelectorCompileError {
                                id: spec.id,
                                pattern: pattern.to_owned(),
                                source,
                            }
                        })
                    })
                    .transpose()
            };
            selectors.push(CompiledSelector {
                user_regex: compile(&spec.user_regex)?,
                source_regex: compile(&spec.source_regex)?,
                schema_regex: compile(&spec.schema_regex)?,
                spec: spec.clone(),
            });
        }
        // Evaluation order: priority descending, insertion order on ties.
        selectors.sort_by(|a, b| {
            b.spec
                .priority
                .cmp(&a.spec.priority)
                .then(a.spec.id.cmp(&b.spec.id))
        });
        Ok(Self { selectors })
    }

    /// First matching selector wins. Deterministic and side-effect
    /// free; the caller interprets the selector's action.
    pub fn classify(
        &self,
        submission: &QuerySubmission,
    ) -> Result<&SelectorSpec, ClassificationError> {
        self.selectors
            .iter()
            .find(|selector| selector.matches(submission))
            .map(|selector| &selector.spec)
            .ok_or(ClassificationError::NoMatch)
    }

    pub fn len(&self) -> usize {
        self.selectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }
}
