//! Vulnerability status values and their merge semantics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The vulnerability status of a manifest.
///
/// Severity values form a total order from `Clean` up to `Defcon1`. The
/// three special values `Error`, `Unsupported` and `Pending` are not
/// ordered with the severities; they override any severity when statuses
/// are merged (see [`VulnerabilityStatus::merge_all`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VulnerabilityStatus {
    Error,
    Pending,
    Unsupported,
    Clean,
    Unknown,
    Negligible,
    Low,
    Medium,
    High,
    Critical,
    Defcon1,
}

impl VulnerabilityStatus {
    /// Severity rank; 0 for the special values that carry no severity.
    fn rank(self) -> u8 {
        match self {
            Self::Error | Self::Pending | Self::Unsupported => 0,
            Self::Clean => 1,
            Self::Unknown => 2,
            Self::Negligible => 3,
            Self::Low => 4,
            Self::Medium => 5,
            Self::High => 6,
            Self::Critical => 7,
            Self::Defcon1 => 8,
        }
    }

    /// Whether a manifest with this status has a vulnerability report
    /// available (i.e. scanning has concluded).
    pub fn has_report(self) -> bool {
        self.rank() > 0
    }

    /// Combine any number of statuses into one:
    ///
    /// 1. any `Error` input yields `Error`,
    /// 2. otherwise any `Unsupported` input yields `Unsupported`,
    /// 3. otherwise any `Pending` input yields `Pending`,
    /// 4. otherwise the highest severity wins; no inputs yield `Clean`.
    pub fn merge_all(statuses: impl IntoIterator<Item = VulnerabilityStatus>) -> Self {
        let mut has_error = false;
        let mut has_unsupported = false;
        let mut has_pending = false;
        let mut result = Self::Clean;
        for status in statuses {
            match status {
                Self::Error => has_error = true,
                Self::Unsupported => has_unsupported = true,
                Self::Pending => has_pending = true,
                other if other.rank() > result.rank() => result = other,
                _ => {}
            }
        }
        if has_error {
            Self::Error
        } else if has_unsupported {
            Self::Unsupported
        } else if has_pending {
            Self::Pending
        } else {
            result
        }
    }

    /// Merge two statuses. Equivalent to `merge_all([self, other])`.
    pub fn merge(self, other: Self) -> Self {
        Self::merge_all([self, other])
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::Pending => "Pending",
            Self::Unsupported => "Unsupported",
            Self::Clean => "Clean",
            Self::Unknown => "Unknown",
            Self::Negligible => "Negligible",
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
            Self::Defcon1 => "Defcon1",
        }
    }
}

impl fmt::Display for VulnerabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VulnerabilityStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Error" => Ok(Self::Error),
            "Pending" => Ok(Self::Pending),
            "Unsupported" => Ok(Self::Unsupported),
            "Clean" => Ok(Self::Clean),
            "Unknown" => Ok(Self::Unknown),
            "Negligible" => Ok(Self::Negligible),
            "Low" => Ok(Self::Low),
            "Medium" => Ok(Self::Medium),
            "High" => Ok(Self::High),
            "Critical" => Ok(Self::Critical),
            "Defcon1" => Ok(Self::Defcon1),
            other => Err(crate::error::Error::Serialization(format!(
                "unknown vulnerability status: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VulnerabilityStatus::*;

    const ALL: [VulnerabilityStatus; 11] = [
        Error, Pending, Unsupported, Clean, Unknown, Negligible, Low, Medium, High, Critical,
        Defcon1,
    ];

    #[test]
    fn test_merge_severity_order() {
        assert_eq!(VulnerabilityStatus::merge_all([Clean, High, Low]), High);
        assert_eq!(VulnerabilityStatus::merge_all([Negligible, Unknown]), Negligible);
        assert_eq!(VulnerabilityStatus::merge_all([Defcon1, Critical]), Defcon1);
    }

    #[test]
    fn test_merge_overrides() {
        assert_eq!(VulnerabilityStatus::merge_all([Clean, High, Pending]), Pending);
        assert_eq!(
            VulnerabilityStatus::merge_all([Clean, High, Pending, Error]),
            Error
        );
        assert_eq!(
            VulnerabilityStatus::merge_all([Pending, Unsupported, Defcon1]),
            Unsupported
        );
    }

    #[test]
    fn test_merge_empty_is_clean() {
        assert_eq!(VulnerabilityStatus::merge_all([]), Clean);
    }

    #[test]
    fn test_merge_commutative_and_idempotent() {
        for a in ALL {
            assert_eq!(a.merge(a), a, "merge not idempotent for {a}");
            for b in ALL {
                assert_eq!(a.merge(b), b.merge(a), "merge not commutative for {a}, {b}");
                for c in ALL {
                    assert_eq!(
                        a.merge(b).merge(c),
                        a.merge(b.merge(c)),
                        "merge not associative for {a}, {b}, {c}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_string_roundtrip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<VulnerabilityStatus>().unwrap(), status);
        }
    }
}
