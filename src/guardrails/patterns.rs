//! Sensitive-action patterns. Plain data: a built-in default set, or a JSON
//! list of `{pattern, severity, label?}` supplied by the host.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::CuaError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Needs a human at strict level.
    Confirm,
    /// Never done autonomously.
    Block,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensitivePattern {
    pub pattern: String,
    pub severity: Severity,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternMatch {
    pub severity: Severity,
    pub label: String,
}

#[derive(Clone, Debug)]
pub struct PatternSet {
    rules: Vec<(Regex, Severity, String)>,
}

const DEFAULT_CONFIRM: &[(&str, &str)] = &[
    (r"passw(or)?d", "password"),
    (r"credit\s*card|card\s*number|\bcvv\b|\bcvc\b", "payment card"),
    (r"\bssn\b|social\s+security", "social security number"),
    (r"\bdelete\b|\bremove\s+account\b", "delete"),
    (r"\bpurchase\b|\bbuy\b|\bcheckout\b|place\s+order", "purchase"),
    (r"\bpay\b|\bpayment\b", "payment"),
    (r"\bbank\b|\biban\b|routing\s+number", "banking"),
];

const DEFAULT_BLOCK: &[(&str, &str)] = &[
    (r"rm\s+-rf\s+/", "recursive delete of root"),
    (r"\bmkfs\b|format\s+(disk|drive|c:)", "disk format"),
    (r"drop\s+(table|database)", "database drop"),
    (r"wire\s+transfer", "wire transfer"),
    (r"sudo\s+rm\b", "privileged delete"),
    (r":\(\)\s*\{\s*:\|:&\s*\};:", "fork bomb"),
];

impl PatternSet {
    pub fn new(patterns: &[SensitivePattern]) -> Result<Self, CuaError> {
        let mut rules = Vec::with_capacity(patterns.len());
        for p in patterns {
            let re = RegexBuilder::new(&p.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    CuaError::Config(format!("bad sensitive pattern {:?}: {e}", p.pattern))
                })?;
            let label = p.label.clone().unwrap_or_else(|| p.pattern.clone());
            rules.push((re, p.severity, label));
        }
        Ok(Self { rules })
    }

    pub fn from_json(json: &str) -> Result<Self, CuaError> {
        let patterns: Vec<SensitivePattern> =
            serde_json::from_str(json).map_err(|e| CuaError::Config(format!("pattern list: {e}")))?;
        Self::new(&patterns)
    }

    pub fn from_file(path: &Path) -> Result<Self, CuaError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| CuaError::Config(format!("pattern file {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn default_patterns() -> Vec<SensitivePattern> {
        fn mk(
            list: &'static [(&'static str, &'static str)],
            severity: Severity,
        ) -> impl Iterator<Item = SensitivePattern> {
            list.iter().map(move |(pattern, label)| SensitivePattern {
                pattern: pattern.to_string(),
                severity,
                label: Some(label.to_string()),
            })
        }
        mk(DEFAULT_CONFIRM, Severity::Confirm).chain(mk(DEFAULT_BLOCK, Severity::Block)).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Highest-severity match over all the given texts.
    pub fn highest(&self, texts: &[&str]) -> Option<PatternMatch> {
        let mut best: Option<PatternMatch> = None;
        for (re, severity, label) in &self.rules {
            if !texts.iter().any(|t| re.is_match(t)) {
                continue;
            }
            if best.as_ref().map_or(true, |b| *severity > b.severity) {
                best = Some(PatternMatch { severity: *severity, label: label.clone() });
            }
        }
        best
    }
}

impl Default for PatternSet {
    fn default() -> Self {
        let rules = Self::default_patterns()
            .into_iter()
            .filter_map(|p| {
                RegexBuilder::new(&p.pattern)
                    .case_insensitive(true)
                    .build()
                    .ok()
                    .map(|re| (re, p.severity, p.label.unwrap_or(p.pattern)))
            })
            .collect();
        Self { rules }
    }
}
