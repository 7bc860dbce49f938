//! Per-procedure rate-limit rules matched with dotted glob patterns.
//!
//! `*` matches exactly one name segment, `**` matches any number of
//! segments (including none). Segments are separated by `.`.

use std::time::Duration;

/// One rule: a pattern over procedure names plus its limit.
#[derive(Clone, Debug)]
pub struct RateRule {
    pub pattern: String,
    pub limit: u64,
    pub window: Duration,
}

impl RateRule {
    pub fn new(pattern: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self {
            pattern: pattern.into(),
            limit,
            window,
        }
    }
}

/// An ordered rule list; the first matching rule wins.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    rules: Vec<RateRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, pattern: impl Into<String>, limit: u64, window: Duration) -> Self {
        self.rules.push(RateRule::new(pattern, limit, window));
        self
    }

    pub fn resolve(&self, procedure: &str) -> Option<&RateRule> {
        self.rules.iter().find(|r| matches_pattern(&r.pattern, procedure))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Match a dotted glob pattern against a procedure name.
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let name: Vec<&str> = name.split('.').collect();
    match_segments(&pattern, &name)
}

fn match_segments(pattern: &[&str], name: &[&str]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((&"**", rest)) => {
            // `**` swallows zero or more segments.
            (0..=name.len()).any(|skip| match_segments(rest, &name[skip..]))
        }
        Some((&"*", rest)) => match name.split_first() {
            Some((_, name_rest)) => match_segments(rest, name_rest),
            None => false,
        },
        Some((segment, rest)) => match name.split_first() {
            Some((head, name_rest)) => segment == head && match_segments(rest, name_rest),
            None => false,
        },
    }
}
