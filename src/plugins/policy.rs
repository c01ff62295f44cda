//! Tag linkage policy.
//!
//! Decides whether a proposed file content carries the traceability tags it
//! needs, given a snapshot of the tag index. Exemptions are path patterns and
//! are checked first; a file that is neither exempt nor governed is ignored.
//!
//! Rules:
//! - `missing-tag` (CRITICAL): governed source without any tag
//! - `missing-test-tag` (HIGH): governed test file without any tag
//! - `unlinked-tag` (HIGH, strict linkage only): a code or test tag, or a
//!   chain target, that no other file has indexed yet
//! - `duplicate-tag` (MEDIUM, `duplicates = "reject"` only): spec_id + verb
//!   already indexed from another governed file. Declarations in spec
//!   documents (ungoverned paths) are what code links to, not duplicates.

use crate::core::config::{DuplicatePolicy, PolicyConfig};
use crate::core::error::SpectrailError;
use crate::core::index::IndexDocument;
use crate::core::tags::{self, Category, TagMatch};
use globset::{Glob, GlobSet, GlobSetBuilder};
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::fmt;

pub const RULE_MISSING_TAG: &str = "missing-tag";
pub const RULE_MISSING_TEST_TAG: &str = "missing-test-tag";
pub const RULE_UNLINKED_TAG: &str = "unlinked-tag";
pub const RULE_DUPLICATE_TAG: &str = "duplicate-tag";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub rule: &'static str,
    pub file: String,
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_id: Option<String>,
}

/// True when any violation must block the edit.
pub fn blocking(violations: &[Violation]) -> bool {
    violations.iter().any(|v| v.severity == Severity::Critical)
}

pub struct PolicyValidator {
    exempt: GlobSet,
    governed: GlobSet,
    tests: GlobSet,
    strict_linkage: bool,
    duplicates: DuplicatePolicy,
    index: IndexDocument,
}

fn build_set(patterns: &[String]) -> Result<GlobSet, SpectrailError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

impl PolicyValidator {
    pub fn new(config: &PolicyConfig, index: IndexDocument) -> Result<Self, SpectrailError> {
        Ok(Self {
            exempt: build_set(&config.exempt)?,
            governed: build_set(&config.governed)?,
            tests: build_set(&config.test_patterns)?,
            strict_linkage: config.strict_linkage,
            duplicates: config.duplicates,
            index,
        })
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt.is_match(normalize(path))
    }

    pub fn is_governed(&self, path: &str) -> bool {
        let path = normalize(path);
        !self.exempt.is_match(path) && self.governed.is_match(path)
    }

    pub fn is_test(&self, path: &str) -> bool {
        self.tests.is_match(normalize(path))
    }

    /// Violations for `content` proposed at repo-relative `path`.
    pub fn validate(&self, path: &str, content: &str) -> Vec<Violation> {
        let path = normalize(path);
        if !self.is_governed(path) {
            return Vec::new();
        }

        let found = tags::extract(content, path);
        if found.is_empty() {
            let (rule, severity, what) = if self.is_test(path) {
                (RULE_MISSING_TEST_TAG, Severity::High, "test file")
            } else {
                (RULE_MISSING_TAG, Severity::Critical, "source file")
            };
            return vec![Violation {
                rule,
                file: path.to_string(),
                message: format!(
                    "{what} has no traceability tag; add e.g. `// @TASK <DOMAIN>-<NNN>` linking it to a spec"
                ),
                severity,
                line: None,
                spec_id: None,
            }];
        }

        let mut violations = Vec::new();
        if self.strict_linkage {
            self.check_linkage(path, &found, &mut violations);
        }
        if self.duplicates == DuplicatePolicy::Reject {
            self.check_duplicates(path, &found, &mut violations);
        }
        violations
    }

    fn indexed_elsewhere(&self, spec_id: &str, path: &str) -> bool {
        self.index
            .query(spec_id)
            .is_some_and(|r| r.entry.locations.iter().any(|l| l.file != path))
    }

    fn check_linkage(&self, path: &str, found: &[TagMatch], out: &mut Vec<Violation>) {
        let mut reported: FxHashSet<&str> = FxHashSet::default();
        for m in found {
            let code_tag = matches!(
                m.category(),
                Some(Category::Implementation | Category::Quality)
            );
            if code_tag
                && !self.indexed_elsewhere(&m.spec_id, path)
                && reported.insert(m.spec_id.as_str())
            {
                out.push(Violation {
                    rule: RULE_UNLINKED_TAG,
                    file: path.to_string(),
                    message: format!(
                        "{} is not declared by any spec file in the index",
                        m.spec_id
                    ),
                    severity: Severity::High,
                    line: Some(m.line),
                    spec_id: Some(m.spec_id.clone()),
                });
            }
            if let Some(target) = &m.target
                && !self.indexed_elsewhere(target, path)
                && reported.insert(target.as_str())
            {
                out.push(Violation {
                    rule: RULE_UNLINKED_TAG,
                    file: path.to_string(),
                    message: format!(
                        "{} {} {} which is not in the index",
                        m.spec_id, m.verb, target
                    ),
                    severity: Severity::High,
                    line: Some(m.line),
                    spec_id: Some(target.clone()),
                });
            }
        }
    }

    fn check_duplicates(&self, path: &str, found: &[TagMatch], out: &mut Vec<Violation>) {
        let mut reported: FxHashSet<(&str, &str)> = FxHashSet::default();
        for m in found {
            let Some(record) = self.index.query(&m.spec_id) else {
                continue;
            };
            let Some(other) = record
                .entry
                .locations
                .iter()
                .find(|l| l.file != path && l.verb == m.verb && self.is_governed(&l.file))
            else {
                continue;
            };
            if !reported.insert((m.spec_id.as_str(), m.verb.as_str())) {
                continue;
            }
            out.push(Violation {
                rule: RULE_DUPLICATE_TAG,
                file: path.to_string(),
                message: format!(
                    "{} {} is already declared at {}:{}",
                    m.spec_id, m.verb, other.file, other.line
                ),
                severity: Severity::Medium,
                line: Some(m.line),
                spec_id: Some(m.spec_id.clone()),
            });
        }
    }
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches("./")
}
