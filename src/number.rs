//! Release numbering
//!
//! Release numbers look like `r2.4.5`. The sentinel `current` names the
//! always-open working release and sorts after every numbered release.
//!
//! Author: Moroya Sakamoto

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ReleaseError;

/// Number of the sentinel working release
pub const CURRENT_RELEASE: &str = "current";

/// Produces the number of a release derived from another one.
pub trait NumberPolicy {
    /// Number for a release created from a release numbered `old`
    fn bump(&self, old: &str) -> String;
}

/// Standard policies: bump one segment, drop everything after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseBump {
    /// `r1.5.3` → `r2`
    Major,
    /// `r1.5.3` → `r1.6`
    Minor,
    /// `r1.5` → `r1.5.1`
    Bugfix,
}

impl ReleaseBump {
    /// Index of the segment this policy increments
    pub fn position(self) -> usize {
        match self {
            ReleaseBump::Major => 0,
            ReleaseBump::Minor => 1,
            ReleaseBump::Bugfix => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseBump::Major => "major",
            ReleaseBump::Minor => "minor",
            ReleaseBump::Bugfix => "bugfix",
        }
    }
}

impl NumberPolicy for ReleaseBump {
    fn bump(&self, old: &str) -> String {
        if old.trim().is_empty() {
            return String::from("r0");
        }
        let pos = self.position();
        let mut segments: Vec<u64> = old
            .split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().unwrap_or(u64::MAX))
            .collect();
        segments.truncate(pos + 1);
        segments.resize(pos + 1, 0);
        segments[pos] = segments[pos].saturating_add(1);
        let joined: Vec<String> = segments.iter().map(u64::to_string).collect();
        format!("r{}", joined.join("."))
    }
}

impl FromStr for ReleaseBump {
    type Err = ReleaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "major" => Ok(ReleaseBump::Major),
            "minor" => Ok(ReleaseBump::Minor),
            "bugfix" => Ok(ReleaseBump::Bugfix),
            other => Err(ReleaseError::validation(format!(
                "unknown release bump {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ReleaseBump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Total order over release numbers.
///
/// `current` is greatest. Otherwise numbers are split at digit/non-digit
/// boundaries and compared segment by segment, numerically where both
/// segments are digits. If one number is a prefix of the other, the
/// longer one is greater.
pub fn compare_numbers(a: &str, b: &str) -> Ordering {
    match (a == CURRENT_RELEASE, b == CURRENT_RELEASE) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }
    let sa = split_segments(a);
    let sb = split_segments(b);
    for (x, y) in sa.iter().zip(sb.iter()) {
        let ord = compare_segment(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    sa.len().cmp(&sb.len())
}

fn compare_segment(x: &str, y: &str) -> Ordering {
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if numeric(x) && numeric(y) {
        let tx = x.trim_start_matches('0');
        let ty = y.trim_start_matches('0');
        tx.len().cmp(&ty.len()).then_with(|| tx.cmp(ty))
    } else {
        x.cmp(y)
    }
}

fn split_segments(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut prev: Option<bool> = None;
    for (i, c) in s.char_indices() {
        let digit = c.is_ascii_digit();
        if prev.is_some_and(|p| p != digit) {
            out.push(&s[start..i]);
            start = i;
        }
        prev = Some(digit);
    }
    if start < s.len() {
        out.push(&s[start..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_major() {
        assert_eq!(ReleaseBump::Major.bump("r1.5.3"), "r2");
        assert_eq!(ReleaseBump::Major.bump(CURRENT_RELEASE), "r1");
    }

    #[test]
    fn test_bump_minor_and_bugfix() {
        assert_eq!(ReleaseBump::Minor.bump("r1.5"), "r1.6");
        assert_eq!(ReleaseBump::Minor.bump("r1.5.3"), "r1.6");
        assert_eq!(ReleaseBump::Bugfix.bump("r3"), "r3.0.1");
        assert_eq!(ReleaseBump::Bugfix.bump("r3.1.1"), "r3.1.2");
    }

    #[test]
    fn test_bump_blank() {
        assert_eq!(ReleaseBump::Minor.bump(""), "r0");
        assert_eq!(ReleaseBump::Major.bump("  "), "r0");
    }

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("MAJOR".parse::<ReleaseBump>().unwrap(), ReleaseBump::Major);
        assert_eq!("Bugfix".parse::<ReleaseBump>().unwrap(), ReleaseBump::Bugfix);
        assert!("patch".parse::<ReleaseBump>().is_err());
    }

    #[test]
    fn test_compare_numeric_segments() {
        assert_eq!(compare_numbers("r2", "r10"), Ordering::Less);
        assert_eq!(compare_numbers("r1.10", "r1.9"), Ordering::Greater);
        assert_eq!(compare_numbers("r1.5", "r1.5"), Ordering::Equal);
        assert_eq!(compare_numbers("r1", "r1.0"), Ordering::Less);
    }

    #[test]
    fn test_current_sorts_last() {
        let mut numbers = vec!["current", "r10", "r2.1", "r2"];
        numbers.sort_by(|a, b| compare_numbers(a, b));
        assert_eq!(numbers, vec!["r2", "r2.1", "r10", "current"]);
    }

    #[test]
    fn test_split_segments() {
        assert_eq!(split_segments("r12.3"), vec!["r", "12", ".", "3"]);
        assert!(split_segments("").is_empty());
    }
}
