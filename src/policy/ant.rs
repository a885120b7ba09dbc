//! Ant-style path patterns.
//!
//! `?` matches one character, `*` matches zero or more characters within a
//! path segment and `**` matches zero or more whole segments. Matching is
//! case-insensitive.

use regex::{Regex, RegexBuilder};

use crate::error::{RatewardenError, Result};

/// A compiled Ant-style path pattern.
#[derive(Debug, Clone)]
pub struct AntPattern {
    source: String,
    regex: Regex,
}

impl AntPattern {
    /// Compile a pattern.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(&Self::to_regex(pattern))
            .case_insensitive(true)
            .build()
            .map_err(|e| {
                RatewardenError::Config(format!("Invalid URL pattern '{}': {}", pattern, e))
            })?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// The pattern as configured.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Check whether `path` matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    fn to_regex(pattern: &str) -> String {
        let segments: Vec<&str> = pattern.split('/').collect();
        let mut out = String::from("^");
        let mut skip_separator = false;

        for (index, segment) in segments.iter().enumerate() {
            let separator = index > 0 && !skip_separator;
            skip_separator = false;

            if *segment == "**" {
                if index == 0 {
                    if segments.len() == 1 {
                        out.push_str(".*");
                    } else {
                        // "**/rest": any leading segments, each ending in a slash
                        out.push_str("(?:.*/)?");
                        skip_separator = true;
                    }
                } else {
                    out.push_str("(?:/.*)?");
                }
                continue;
            }

            if separator {
                out.push('/');
            }
            for ch in segment.chars() {
                match ch {
                    '*' => out.push_str("[^/]*"),
                    '?' => out.push_str("[^/]"),
                    other => out.push_str(&regex::escape(&other.to_string())),
                }
            }
        }

        out.push('$');
        out
    }
}

impl PartialEq for AntPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for AntPattern {}
