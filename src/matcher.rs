//! Pattern matching against public identifiers

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where in the identifier the pattern must appear
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// Match at the beginning of the identifier
    #[default]
    Prefix,
    /// Match at the end of the identifier
    Suffix,
}

impl PatternType {
    /// Canonical case for this pattern type: upper for prefixes, lower for suffixes
    pub fn canonicalize(self, value: &str) -> String {
        match self {
            PatternType::Prefix => value.to_ascii_uppercase(),
            PatternType::Suffix => value.to_ascii_lowercase(),
        }
    }
}

impl FromStr for PatternType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "prefix" | "start" => Ok(PatternType::Prefix),
            "suffix" | "end" => Ok(PatternType::Suffix),
            _ => Err(Error::invalid_pattern(format!("Unknown pattern type: {}", s))),
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternType::Prefix => write!(f, "prefix"),
            PatternType::Suffix => write!(f, "suffix"),
        }
    }
}

/// A validated, case-canonicalized pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatcher {
    pattern: String,
    pattern_type: PatternType,
}

impl PatternMatcher {
    /// Validate and canonicalize `pattern`.
    ///
    /// Surrounding whitespace is ignored; anything other than ASCII letters and
    /// digits is rejected.
    pub fn new(pattern: &str, pattern_type: PatternType) -> Result<Self> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_pattern("pattern must not be empty"));
        }
        if let Some(c) = trimmed.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(Error::invalid_pattern(format!(
                "unsupported character {:?} in pattern {:?}",
                c, trimmed
            )));
        }

        Ok(Self {
            pattern: pattern_type.canonicalize(trimmed),
            pattern_type,
        })
    }

    /// The canonicalized pattern
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn pattern_type(&self) -> PatternType {
        self.pattern_type
    }

    /// Test a candidate identifier.
    ///
    /// The candidate is brought to the pattern's canonical case before
    /// comparing, which for ASCII identifiers is a case-insensitive compare of
    /// the relevant end.
    #[inline]
    pub fn matches(&self, candidate: &str) -> bool {
        let pattern = self.pattern.as_bytes();
        let candidate = candidate.as_bytes();
        if candidate.len() < pattern.len() {
            return false;
        }

        let window = match self.pattern_type {
            PatternType::Prefix => &candidate[..pattern.len()],
            PatternType::Suffix => &candidate[candidate.len() - pattern.len()..],
        };
        window.eq_ignore_ascii_case(pattern)
    }

    /// Expected number of attempts to hit this pattern, `alphabet_size ^ len`
    pub fn estimated_attempts(&self, alphabet_size: u32) -> f64 {
        f64::from(alphabet_size).powi(self.pattern.len() as i32)
    }

    /// Returns a human-readable difficulty estimate.
    pub fn difficulty_description(&self, alphabet_size: u32) -> &'static str {
        match self.estimated_attempts(alphabet_size) {
            d if d <= 1e3 => "Very Easy (< 1 second)",
            d if d <= 1e5 => "Easy (seconds)",
            d if d <= 1e7 => "Medium (minutes)",
            d if d <= 1e9 => "Hard (hours)",
            _ => "Very Hard (days or more)",
        }
    }
}

impl fmt::Display for PatternMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.pattern_type, self.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn test_prefix_is_canonicalized_upper() {
        let matcher = PatternMatcher::new("ab", PatternType::Prefix).unwrap();
        assert_eq!(matcher.pattern(), "AB");
        assert!(matcher.matches("ABCDEF"));
        assert!(matcher.matches("abcdef"));
        assert!(!matcher.matches("BACDEF"));
    }

    #[test]
    fn test_suffix_is_canonicalized_lower() {
        let matcher = PatternMatcher::new("XyZ", PatternType::Suffix).unwrap();
        assert_eq!(matcher.pattern(), "xyz");
        assert!(matcher.matches("QQQXYZ"));
        assert!(matcher.matches("qqqxyz"));
        assert!(!matcher.matches("XYZQQQ"));
    }

    #[test]
    fn test_candidate_shorter_than_pattern() {
        let matcher = PatternMatcher::new("ABCD", PatternType::Prefix).unwrap();
        assert!(!matcher.matches("ABC"));
        assert!(!matcher.matches(""));
    }

    #[test]
    fn test_invalid_patterns() {
        assert_matches!(
            PatternMatcher::new("", PatternType::Prefix),
            Err(Error::InvalidPattern { .. })
        );
        assert_matches!(
            PatternMatcher::new("   ", PatternType::Prefix),
            Err(Error::InvalidPattern { .. })
        );
        assert_matches!(
            PatternMatcher::new("a-b", PatternType::Suffix),
            Err(Error::InvalidPattern { .. })
        );
        assert_matches!(
            PatternMatcher::new("äb", PatternType::Prefix),
            Err(Error::InvalidPattern { .. })
        );
    }

    #[test]
    fn test_surrounding_whitespace_is_trimmed() {
        let matcher = PatternMatcher::new("  cat ", PatternType::Prefix).unwrap();
        assert_eq!(matcher.pattern(), "CAT");
    }

    #[test]
    fn test_pattern_type_parsing() {
        assert_eq!("prefix".parse::<PatternType>().unwrap(), PatternType::Prefix);
        assert_eq!("END".parse::<PatternType>().unwrap(), PatternType::Suffix);
        assert!("middle".parse::<PatternType>().is_err());
        assert_eq!(PatternType::Suffix.to_string(), "suffix");
    }

    #[test]
    fn test_estimated_attempts() {
        let matcher = PatternMatcher::new("ABC", PatternType::Prefix).unwrap();
        assert_eq!(matcher.estimated_attempts(32), 32768.0);
        assert_eq!(matcher.difficulty_description(32), "Easy (seconds)");

        // 32^4 = 1_048_576
        let matcher = PatternMatcher::new("ABCD", PatternType::Prefix).unwrap();
        assert_eq!(matcher.difficulty_description(32), "Medium (minutes)");

        let matcher = PatternMatcher::new("A", PatternType::Prefix).unwrap();
        assert_eq!(matcher.difficulty_description(32), "Very Easy (< 1 second)");
    }

    proptest! {
        #[test]
        fn prop_prefix_matches_any_tail(pattern in "[a-zA-Z0-9]{1,8}", tail in "[A-Z2-7]{0,40}") {
            let matcher = PatternMatcher::new(&pattern, PatternType::Prefix).unwrap();
            let candidate = format!("{}{}", pattern.to_ascii_uppercase(), tail);
            prop_assert!(matcher.matches(&candidate));
        }

        #[test]
        fn prop_suffix_matches_any_head(pattern in "[a-zA-Z0-9]{1,8}", head in "[a-z2-7]{0,40}") {
            let matcher = PatternMatcher::new(&pattern, PatternType::Suffix).unwrap();
            let candidate = format!("{}{}", head, pattern.to_ascii_lowercase());
            prop_assert!(matcher.matches(&candidate));
        }

        #[test]
        fn prop_match_agrees_with_normalized_starts_with(pattern in "[a-z]{1,4}", candidate in "[A-Za-z]{0,12}") {
            let matcher = PatternMatcher::new(&pattern, PatternType::Prefix).unwrap();
            let expected = candidate.to_ascii_uppercase().starts_with(matcher.pattern());
            prop_assert_eq!(matcher.matches(&candidate), expected);
        }
    }
}
