use glob::{MatchOptions, Pattern as GlobPattern};
use thiserror::Error;
use tracing::warn;

/// Errors that can occur while compiling exclusion patterns
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Invalid glob pattern '{pattern}': {source}")]
    InvalidGlob {
        pattern: String,
        source: glob::PatternError,
    },
}

/// Shell-glob semantics: `*`, `?`, `[seq]`, `[!seq]`, case-sensitive,
/// leading dots not special.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A compiled exclusion pattern
#[derive(Debug, Clone)]
pub struct ExclusionPattern {
    source: String,
    compiled: GlobPattern,
}

impl ExclusionPattern {
    pub fn new(pattern: &str) -> Result<Self, FilterError> {
        let compiled = GlobPattern::new(pattern).map_err(|e| FilterError::InvalidGlob {
            pattern: pattern.to_string(),
            source: e,
        })?;
        Ok(Self {
            source: pattern.to_string(),
            compiled,
        })
    }

    /// Check if this pattern matches a bare file name
    pub fn matches(&self, file_name: &str) -> bool {
        self.compiled.matches_with(file_name, MATCH_OPTIONS)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Decides whether a discovered file is eligible for inclusion.
///
/// Patterns are compiled once. A malformed pattern is reported and then
/// behaves as a pattern that never matches.
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    patterns: Vec<ExclusionPattern>,
    rejected: Vec<String>,
}

impl ExclusionFilter {
    /// Compile a set of exclusion patterns
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut filter = ExclusionFilter::default();
        for pattern in patterns {
            match ExclusionPattern::new(pattern.as_ref()) {
                Ok(compiled) => filter.patterns.push(compiled),
                Err(e) => {
                    warn!("{}; pattern ignored", e);
                    filter.rejected.push(pattern.as_ref().to_string());
                }
            }
        }
        filter
    }

    /// Return the first pattern matching `file_name`, if any
    pub fn matching_pattern(&self, file_name: &str) -> Option<&ExclusionPattern> {
        self.patterns.iter().find(|p| p.matches(file_name))
    }

    /// Check if a bare file name is excluded
    pub fn is_excluded(&self, file_name: &str) -> bool {
        self.matching_pattern(file_name).is_some()
    }

    /// Patterns that failed to compile
    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Check a bare file name against a list of glob patterns.
///
/// Returns true on the first match and false when `patterns` is empty.
/// Malformed patterns never match.
pub fn is_excluded<S: AsRef<str>>(file_name: &str, patterns: &[S]) -> bool {
    patterns.iter().any(|pattern| {
        GlobPattern::new(pattern.as_ref())
            .map(|p| p.matches_with(file_name, MATCH_OPTIONS))
            .unwrap_or(false)
    })
}
