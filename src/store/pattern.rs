//! Glob-style channel and key patterns (`*` and `?`), compiled to anchored regexes.

use regex::Regex;

use crate::error::{OrchBusError, OrchBusResult};

/// A compiled glob pattern
#[derive(Debug, Clone)]
pub struct ChannelPattern {
    glob: String,
    regex: Regex,
}

impl ChannelPattern {
    pub fn new(glob: impl Into<String>) -> OrchBusResult<Self> {
        let glob = glob.into();
        let mut expr = String::with_capacity(glob.len() + 8);
        expr.push('^');
        for ch in glob.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| OrchBusError::InvalidPattern {
            pattern: glob.clone(),
            message: e.to_string(),
        })?;
        Ok(Self { glob, regex })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }

    /// Literal text before the first wildcard, used to narrow store scans
    pub fn literal_prefix(&self) -> &str {
        let end = self
            .glob
            .find(['*', '?'])
            .unwrap_or(self.glob.len());
        &self.glob[..end]
    }
}
