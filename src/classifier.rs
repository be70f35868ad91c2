// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Classification
//!
//! Maps a handler failure to a `FailureKind`. Handlers that already know the kind
//! of their failure return `ProcessingError::Transient` or `ProcessingError::Permanent`
//! and are taken at their word. Unqualified errors are matched against an ordered
//! list of rules; the first rule that matches wins, and an error no rule matches
//! is classified as `Unknown`.

use crate::{
    errors::ProcessingError,
    outcome::{FailureKind, Outcome},
};
use std::{fmt, sync::Arc};

/// Default message fragments treated as transient failures.
pub const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "service unavailable",
    "service_unavailable",
    "temporarily unavailable",
];

/// Default message fragments treated as permanent failures.
pub const PERMANENT_PATTERNS: &[&str] = &["invalid", "malformed", "validation", "parse error"];

type ErrorPredicate = Arc<dyn Fn(&ProcessingError) -> bool + Send + Sync>;

/// A single classification rule: a predicate and the kind it assigns.
#[derive(Clone)]
pub struct ClassifierRule {
    name: String,
    kind: FailureKind,
    predicate: ErrorPredicate,
}

impl ClassifierRule {
    /// Creates a rule from an arbitrary predicate.
    pub fn new<P>(name: &str, kind: FailureKind, predicate: P) -> ClassifierRule
    where
        P: Fn(&ProcessingError) -> bool + Send + Sync + 'static,
    {
        ClassifierRule {
            name: name.to_owned(),
            kind,
            predicate: Arc::new(predicate),
        }
    }

    /// Creates a rule matching errors whose message contains any of `patterns`,
    /// ignoring ASCII case.
    pub fn message_contains(name: &str, kind: FailureKind, patterns: &[&str]) -> ClassifierRule {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_ascii_lowercase()).collect();

        ClassifierRule::new(name, kind, move |err| {
            let msg = err.message().to_ascii_lowercase();
            patterns.iter().any(|p| msg.contains(p.as_str()))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    fn matches(&self, err: &ProcessingError) -> bool {
        (self.predicate)(err)
    }
}

impl fmt::Debug for ClassifierRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierRule")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Ordered rule set turning handler errors into failure outcomes.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassifierRule>,
}

impl Default for ErrorClassifier {
    /// Network and availability errors are transient, validation errors are permanent.
    fn default() -> Self {
        ErrorClassifier::empty()
            .rule(ClassifierRule::message_contains(
                "transient-io",
                FailureKind::Transient,
                TRANSIENT_PATTERNS,
            ))
            .rule(ClassifierRule::message_contains(
                "invalid-data",
                FailureKind::Permanent,
                PERMANENT_PATTERNS,
            ))
    }
}

impl ErrorClassifier {
    /// A classifier without rules: every unqualified error is `Unknown`.
    pub fn empty() -> ErrorClassifier {
        ErrorClassifier { rules: vec![] }
    }

    /// Appends a rule; rules are evaluated in insertion order.
    pub fn rule(mut self, rule: ClassifierRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[ClassifierRule] {
        &self.rules
    }

    /// Classifies a handler error. Deterministic and free of side effects.
    pub fn classify(&self, err: &ProcessingError) -> Outcome {
        let kind = match err {
            ProcessingError::Transient(_) => FailureKind::Transient,
            ProcessingError::Permanent(_) => FailureKind::Permanent,
            ProcessingError::Other(_) => self
                .rules
                .iter()
                .find(|rule| rule.matches(err))
                .map(|rule| rule.kind)
                .unwrap_or(FailureKind::Unknown),
        };

        Outcome::failure(kind, err.message())
    }

    /// Outcome for a handler that panicked instead of returning.
    pub fn poison(detail: &str) -> Outcome {
        Outcome::failure(FailureKind::Poison, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(classifier: &ErrorClassifier, err: ProcessingError) -> FailureKind {
        classifier.classify(&err).kind().unwrap()
    }

    #[test]
    fn declared_kinds_win_over_rules() {
        let classifier = ErrorClassifier::default();

        // message would match the permanent rule, declared kind still wins
        assert_eq!(
            kind_of(&classifier, ProcessingError::Transient("invalid token".into())),
            FailureKind::Transient
        );
        assert_eq!(
            kind_of(&classifier, ProcessingError::Permanent("timeout".into())),
            FailureKind::Permanent
        );
    }

    #[test]
    fn default_rules_classify_unqualified_errors() {
        let classifier = ErrorClassifier::default();

        assert_eq!(
            kind_of(&classifier, ProcessingError::Other("network_timeout".into())),
            FailureKind::Transient
        );
        assert_eq!(
            kind_of(&classifier, ProcessingError::Other("Service Unavailable".into())),
            FailureKind::Transient
        );
        assert_eq!(
            kind_of(&classifier, ProcessingError::Other("invalid_data".into())),
            FailureKind::Permanent
        );
        assert_eq!(
            kind_of(&classifier, ProcessingError::Other("database_error".into())),
            FailureKind::Unknown
        );
    }

    #[test]
    fn first_matching_rule_wins() {
        let classifier = ErrorClassifier::empty()
            .rule(ClassifierRule::message_contains(
                "db",
                FailureKind::Permanent,
                &["database"],
            ))
            .rule(ClassifierRule::message_contains(
                "db-retry",
                FailureKind::Transient,
                &["database"],
            ));

        assert_eq!(
            kind_of(&classifier, ProcessingError::Other("database_error".into())),
            FailureKind::Permanent
        );
    }

    #[test]
    fn classification_is_deterministic_and_keeps_detail() {
        let classifier = ErrorClassifier::default();
        let err = ProcessingError::Other("connection refused by upstream".into());

        let first = classifier.classify(&err);
        let second = classifier.classify(&err);

        assert_eq!(first, second);
        assert_eq!(
            first,
            Outcome::failure(FailureKind::Transient, "connection refused by upstream")
        );
    }

    #[test]
    fn empty_classifier_falls_back_to_unknown() {
        let classifier = ErrorClassifier::empty();

        assert_eq!(
            kind_of(&classifier, ProcessingError::Other("timeout".into())),
            FailureKind::Unknown
        );
        assert_eq!(ErrorClassifier::poison("panic").kind(), Some(FailureKind::Poison));
    }
}
