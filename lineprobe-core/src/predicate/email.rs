//! Illustrative "contains an email address" test.
//!
//! This is a loose pattern used to demonstrate line scanning; it is not an
//! address validator.

use std::time::Duration;

use regex::Regex;

use crate::predicate::adapter::{self, CallbackPredicate, Completion, RawTest};

/// Matches `local@domain.tld` anywhere in a line.
pub const DEFAULT_EMAIL_PATTERN: &str = r"[^\s@]+@[^\s@]+\.[^\s@]+";

/// Raw callback-style test for an email-looking token in a line of text.
#[derive(Clone, Debug)]
pub struct EmailPattern {
    regex: Regex,
}

impl Default for EmailPattern {
    fn default() -> Self {
        Self {
            regex: Regex::new(DEFAULT_EMAIL_PATTERN).expect("default email pattern compiles"),
        }
    }
}

impl EmailPattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a caller supplied pattern instead of [`DEFAULT_EMAIL_PATTERN`].
    pub fn with_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn matches(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }

    /// Normalizes this test into a latency-bound [`crate::predicate::Predicate`]
    /// over line text.
    pub fn into_predicate(self, delay: Duration) -> CallbackPredicate<String, Self> {
        adapter::wrap(self, delay)
    }
}

impl RawTest<String> for EmailPattern {
    fn run(&self, line: &String, done: Completion) {
        done(Ok(self.matches(line)));
    }
}

impl RawTest<str> for EmailPattern {
    fn run(&self, line: &str, done: Completion) {
        done(Ok(self.matches(line)));
    }
}
