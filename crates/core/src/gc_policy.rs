//! Garbage collection policies for manifests.
//!
//! An account carries an ordered list of policies. During a GC pass each
//! manifest is checked against the policies in order; the first matching
//! policy decides its fate. A `protect` policy short-circuits, shielding
//! the manifest from any later `delete` policy.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};

/// What a matching policy does with the manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcStrategy {
    /// Delete manifests that no tag points at.
    DeleteUntagged,
    /// Delete manifests whose time constraint matched.
    DeleteIfOlderThan,
    /// Delete manifests with fewer than `newer_tags` tags newer than them.
    DeleteIfFewerTagsNewer,
    /// Shield the manifest from all later policies.
    Protect,
}

/// Which timestamp a time constraint applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeField {
    PushedAt,
    LastPulledAt,
}

/// Age-based constraint. Durations are given in seconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeConstraint {
    pub on: TimeField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub older_than: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newer_than: Option<u64>,
}

impl TimeConstraint {
    fn is_satisfied(&self, facts: &ManifestFacts<'_>, now: OffsetDateTime) -> bool {
        // A manifest that was never pulled counts as infinitely old for
        // last_pulled_at constraints.
        let value = match self.on {
            TimeField::PushedAt => Some(facts.pushed_at),
            TimeField::LastPulledAt => facts.last_pulled_at,
        };
        if let Some(secs) = self.older_than {
            let cutoff = now - Duration::seconds(secs as i64);
            match value {
                Some(ts) if ts >= cutoff => return false,
                _ => {}
            }
        }
        if let Some(secs) = self.newer_than {
            let cutoff = now - Duration::seconds(secs as i64);
            match value {
                Some(ts) if ts > cutoff => {}
                _ => return false,
            }
        }
        true
    }
}

/// A single GC policy as stored in the account's `gc_policies_json`.
///
/// Unknown keys are rejected at parse time; a typo in a stored policy must
/// fail loudly rather than silently widen or narrow the policy's reach.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcPolicy {
    /// Anchored regex on the repository name (without the account prefix).
    pub match_repository: String,
    /// Anchored regex; repositories matching it are excluded even when
    /// `match_repository` matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_repository: Option<String>,
    /// Anchored regex; the manifest matches if any of its tags match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_tag: Option<String>,
    /// Anchored regex; the manifest is excluded if any of its tags match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_tag: Option<String>,
    /// Restrict the policy to manifests that no tag points at.
    #[serde(default, skip_serializing_if = "is_false")]
    pub only_untagged: bool,
    /// Label selector, either `key` (presence) or `key=value`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_constraint: Option<TimeConstraint>,
    /// Parameter for `delete_if_fewer_tags_newer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newer_tags: Option<u32>,
    pub strategy: GcStrategy,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// What evaluation decided for one manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcDecision {
    Delete,
    Protect,
}

/// Everything about a manifest that policy evaluation looks at.
#[derive(Clone, Debug)]
pub struct ManifestFacts<'a> {
    pub digest: &'a str,
    pub pushed_at: OffsetDateTime,
    pub last_pulled_at: Option<OffsetDateTime>,
    pub tag_names: Vec<&'a str>,
    pub labels: &'a HashMap<String, String>,
    /// Number of tags in the repository pointing at manifests pushed after
    /// this one. Precomputed by the caller from the full tag list.
    pub newer_tag_count: u32,
}

fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| Error::InvalidGcPolicy(format!("bad regex {pattern:?}: {e}")))
}

fn label_matches(selector: &str, labels: &HashMap<String, String>) -> bool {
    match selector.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(selector),
    }
}

impl GcPolicy {
    /// Validate regexes and strategy parameters. Called when an account's
    /// policy list is parsed, so that GC passes never see broken policies.
    pub fn validate(&self) -> Result<()> {
        anchored(&self.match_repository)?;
        for pattern in [&self.except_repository, &self.match_tag, &self.except_tag]
            .into_iter()
            .flatten()
        {
            anchored(pattern)?;
        }
        match self.strategy {
            GcStrategy::DeleteIfOlderThan => {
                let has_older_than = self
                    .time_constraint
                    .as_ref()
                    .is_some_and(|tc| tc.older_than.is_some());
                if !has_older_than {
                    return Err(Error::InvalidGcPolicy(
                        "delete_if_older_than requires a time_constraint with older_than".into(),
                    ));
                }
            }
            GcStrategy::DeleteIfFewerTagsNewer => {
                if self.newer_tags.is_none() {
                    return Err(Error::InvalidGcPolicy(
                        "delete_if_fewer_tags_newer requires newer_tags".into(),
                    ));
                }
            }
            GcStrategy::DeleteUntagged | GcStrategy::Protect => {}
        }
        Ok(())
    }

    /// Whether the policy applies to this repository at all:
    /// `match_repository` must match and `except_repository` must not.
    pub fn matches_repository(&self, repo_name: &str) -> bool {
        let matched = anchored(&self.match_repository)
            .map(|rx| rx.is_match(repo_name))
            .unwrap_or(false);
        if !matched {
            return false;
        }
        match &self.except_repository {
            Some(pattern) => anchored(pattern)
                .map(|rx| !rx.is_match(repo_name))
                .unwrap_or(false),
            None => true,
        }
    }

    /// Check this policy against one manifest. Returns `None` when the
    /// policy does not apply.
    pub fn check(
        &self,
        repo_name: &str,
        facts: &ManifestFacts<'_>,
        now: OffsetDateTime,
    ) -> Option<GcDecision> {
        if !self.matches_repository(repo_name) {
            return None;
        }
        if self.only_untagged && !facts.tag_names.is_empty() {
            return None;
        }
        if let Some(pattern) = &self.match_tag {
            let rx = anchored(pattern).ok()?;
            if !facts.tag_names.iter().any(|t| rx.is_match(t)) {
                return None;
            }
        }
        if let Some(pattern) = &self.except_tag {
            let rx = anchored(pattern).ok()?;
            if facts.tag_names.iter().any(|t| rx.is_match(t)) {
                return None;
            }
        }
        if let Some(selector) = &self.match_label {
            if !label_matches(selector, facts.labels) {
                return None;
            }
        }
        if let Some(tc) = &self.time_constraint {
            if !tc.is_satisfied(facts, now) {
                return None;
            }
        }
        match self.strategy {
            GcStrategy::Protect => Some(GcDecision::Protect),
            GcStrategy::DeleteUntagged => facts.tag_names.is_empty().then_some(GcDecision::Delete),
            GcStrategy::DeleteIfOlderThan => Some(GcDecision::Delete),
            GcStrategy::DeleteIfFewerTagsNewer => {
                (facts.newer_tag_count < self.newer_tags.unwrap_or(0)).then_some(GcDecision::Delete)
            }
        }
    }
}

/// Parse and validate an account's `gc_policies_json` column.
pub fn parse_policies(json: &str) -> Result<Vec<GcPolicy>> {
    if json.is_empty() {
        return Ok(Vec::new());
    }
    let policies: Vec<GcPolicy> =
        serde_json::from_str(json).map_err(|e| Error::InvalidGcPolicy(e.to_string()))?;
    for policy in &policies {
        policy.validate()?;
    }
    Ok(policies)
}

/// Evaluate an ordered policy list against one manifest. Returns the first
/// matching policy and its decision.
pub fn evaluate_policies<'p>(
    policies: &'p [GcPolicy],
    repo_name: &str,
    facts: &ManifestFacts<'_>,
    now: OffsetDateTime,
) -> Option<(&'p GcPolicy, GcDecision)> {
    policies
        .iter()
        .find_map(|p| p.check(repo_name, facts, now).map(|d| (p, d)))
}

/// The `gc_status_json` recorded on surviving manifests, for operators to
/// see why a manifest is still there.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GcStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protected_by_policy: Option<GcPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relevant_policies: Vec<GcPolicy>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn facts<'a>(
        tag_names: Vec<&'a str>,
        labels: &'a HashMap<String, String>,
        pushed_at: OffsetDateTime,
    ) -> ManifestFacts<'a> {
        ManifestFacts {
            digest: "sha256:dummy",
            pushed_at,
            last_pulled_at: None,
            tag_names,
            labels,
            newer_tag_count: 0,
        }
    }

    #[test]
    fn test_parse_and_validate() {
        let json = r#"[
            {"match_repository": "library/.*", "strategy": "protect", "match_tag": "v.*"},
            {"match_repository": ".*", "strategy": "delete_untagged"}
        ]"#;
        let policies = parse_policies(json).unwrap();
        assert_eq!(policies.len(), 2);

        assert!(parse_policies(r#"[{"match_repository": "(", "strategy": "protect"}]"#).is_err());
        assert!(
            parse_policies(r#"[{"match_repository": ".*", "except_tag": "(", "strategy": "protect"}]"#)
                .is_err()
        );
        assert!(
            parse_policies(r#"[{"match_repository": ".*", "strategy": "delete_if_older_than"}]"#)
                .is_err()
        );
        assert!(parse_policies("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_unknown_keys() {
        let err = parse_policies(
            r#"[{"match_repository": ".*", "strategy": "delete_untagged", "match_tags": "v.*"}]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("match_tags"));

        assert!(parse_policies(
            r#"[{"match_repository": ".*", "strategy": "delete_if_older_than",
                 "time_constraint": {"on": "pushed_at", "older_than": 60, "oldest": true}}]"#,
        )
        .is_err());
    }

    #[test]
    fn test_protect_shortcircuits_delete() {
        let policies = parse_policies(
            r#"[
            {"match_repository": ".*", "match_tag": "release-.*", "strategy": "protect"},
            {"match_repository": ".*", "strategy": "delete_untagged"},
            {"match_repository": ".*", "time_constraint": {"on": "pushed_at", "older_than": 3600},
             "strategy": "delete_if_older_than"}
        ]"#,
        )
        .unwrap();
        let now = datetime!(2024-06-01 12:00 UTC);
        let labels = HashMap::new();

        // tagged release-1: protected even though old
        let protected = facts(vec!["release-1"], &labels, now - Duration::hours(48));
        let (policy, decision) = evaluate_policies(&policies, "library/app", &protected, now).unwrap();
        assert_eq!(decision, GcDecision::Protect);
        assert_eq!(policy.strategy, GcStrategy::Protect);

        // old and tagged differently: falls through to delete_if_older_than
        let stale = facts(vec!["nightly"], &labels, now - Duration::hours(48));
        let (_, decision) = evaluate_policies(&policies, "library/app", &stale, now).unwrap();
        assert_eq!(decision, GcDecision::Delete);

        // fresh and untagged: delete_untagged matches first
        let untagged = facts(vec![], &labels, now - Duration::minutes(5));
        let (policy, decision) = evaluate_policies(&policies, "library/app", &untagged, now).unwrap();
        assert_eq!(decision, GcDecision::Delete);
        assert_eq!(policy.strategy, GcStrategy::DeleteUntagged);
    }

    #[test]
    fn test_repository_match_is_anchored() {
        let policies =
            parse_policies(r#"[{"match_repository": "app", "strategy": "delete_untagged"}]"#)
                .unwrap();
        let labels = HashMap::new();
        let now = datetime!(2024-06-01 12:00 UTC);
        let m = facts(vec![], &labels, now - Duration::hours(1));
        assert!(evaluate_policies(&policies, "app", &m, now).is_some());
        assert!(evaluate_policies(&policies, "app/sub", &m, now).is_none());
        assert!(evaluate_policies(&policies, "myapp", &m, now).is_none());
    }

    #[test]
    fn test_except_repository_excludes() {
        let policies = parse_policies(
            r#"[{"match_repository": ".*", "except_repository": "library/.*",
                 "strategy": "delete_untagged"}]"#,
        )
        .unwrap();
        let labels = HashMap::new();
        let now = datetime!(2024-06-01 12:00 UTC);
        let m = facts(vec![], &labels, now - Duration::hours(1));
        assert!(evaluate_policies(&policies, "scratch/app", &m, now).is_some());
        assert!(evaluate_policies(&policies, "library/app", &m, now).is_none());
        assert!(!policies[0].matches_repository("library/app"));
    }

    #[test]
    fn test_except_tag_and_only_untagged() {
        let policies = parse_policies(
            r#"[{"match_repository": ".*", "except_tag": "pinned-.*",
                 "time_constraint": {"on": "pushed_at", "older_than": 3600},
                 "strategy": "delete_if_older_than"}]"#,
        )
        .unwrap();
        let labels = HashMap::new();
        let now = datetime!(2024-06-01 12:00 UTC);
        let pinned = facts(vec!["pinned-1", "other"], &labels, now - Duration::hours(2));
        assert!(evaluate_policies(&policies, "repo", &pinned, now).is_none());
        let plain = facts(vec!["other"], &labels, now - Duration::hours(2));
        assert!(evaluate_policies(&policies, "repo", &plain, now).is_some());

        let policies = parse_policies(
            r#"[{"match_repository": ".*", "only_untagged": true,
                 "time_constraint": {"on": "pushed_at", "older_than": 3600},
                 "strategy": "delete_if_older_than"}]"#,
        )
        .unwrap();
        let tagged = facts(vec!["v1"], &labels, now - Duration::hours(2));
        assert!(evaluate_policies(&policies, "repo", &tagged, now).is_none());
        let untagged = facts(vec![], &labels, now - Duration::hours(2));
        assert!(evaluate_policies(&policies, "repo", &untagged, now).is_some());
    }

    #[test]
    fn test_label_selector() {
        let labels: HashMap<String, String> =
            [("stage".to_string(), "prod".to_string())].into_iter().collect();
        assert!(label_matches("stage", &labels));
        assert!(label_matches("stage=prod", &labels));
        assert!(!label_matches("stage=dev", &labels));
        assert!(!label_matches("owner", &labels));
    }

    #[test]
    fn test_fewer_tags_newer() {
        let policies = parse_policies(
            r#"[{"match_repository": ".*", "newer_tags": 3, "strategy": "delete_if_fewer_tags_newer"}]"#,
        )
        .unwrap();
        let labels = HashMap::new();
        let now = datetime!(2024-06-01 12:00 UTC);
        let mut m = facts(vec!["v1"], &labels, now - Duration::hours(1));
        m.newer_tag_count = 2;
        assert_eq!(
            evaluate_policies(&policies, "repo", &m, now).map(|(_, d)| d),
            Some(GcDecision::Delete)
        );
        m.newer_tag_count = 3;
        assert!(evaluate_policies(&policies, "repo", &m, now).is_none());
    }

    #[test]
    fn test_last_pulled_constraint_treats_never_pulled_as_old() {
        let policies = parse_policies(
            r#"[{"match_repository": ".*",
                 "time_constraint": {"on": "last_pulled_at", "older_than": 3600},
                 "strategy": "delete_if_older_than"}]"#,
        )
        .unwrap();
        let labels = HashMap::new();
        let now = datetime!(2024-06-01 12:00 UTC);
        let mut m = facts(vec![], &labels, now - Duration::hours(10));
        assert!(evaluate_policies(&policies, "repo", &m, now).is_some());
        m.last_pulled_at = Some(now - Duration::minutes(5));
        assert!(evaluate_policies(&policies, "repo", &m, now).is_none());
    }
}
