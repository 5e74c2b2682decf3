//! Deterministic route-decision matching.
//!
//! The LLM's reply is matched against the branch table with a strict,
//! stable four-tier rule. Substring tiers pick the match whose position in
//! the reply is earliest, so the decision is a pure function of the reply
//! and the branch table even when several keys appear in one sentence.

use std::collections::BTreeMap;

use crate::agent::{DEFAULT_BRANCH, END_TARGET, is_reserved_branch_key};

/// Outcome of resolving a route reply against the branch table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// A branch was chosen; carries `(key, target agent)`.
    Branch {
        /// The branch key that matched (or `_default`).
        key: String,
        /// The target agent name.
        target: String,
    },
    /// The route terminates without pushing a frame.
    End,
    /// Nothing matched and no `_default` exists.
    NoMatch,
}

/// Build the prompt presented to the LLM for a route decision.
///
/// Reserved keys are excluded from the option list; the remaining keys are
/// enumerated in lexical order so the presentation is deterministic.
#[must_use]
pub fn build_route_prompt(prompt: &str, branches: &BTreeMap<String, String>) -> String {
    let options: Vec<&str> = branches
        .keys()
        .filter(|k| !is_reserved_branch_key(k))
        .map(String::as_str)
        .collect();
    format!(
        "{prompt}\n\nAnswer with exactly one of the following options, and nothing else: {}",
        options.join(", ")
    )
}

/// Earliest-position case-insensitive substring match over `candidates`.
///
/// Returns the index of the winning candidate. Ties on position resolve to
/// the earlier candidate, which is stable because callers iterate the
/// ordered branch table.
fn earliest_match(reply_lower: &str, candidates: &[(usize, String)]) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (idx, needle) in candidates {
        if needle.is_empty() {
            continue;
        }
        if let Some(pos) = reply_lower.find(needle.as_str()) {
            match best {
                Some((best_pos, _)) if best_pos <= pos => {}
                _ => best = Some((pos, *idx)),
            }
        }
    }
    best.map(|(_, idx)| idx)
}

/// Resolve a route reply to a target using the four-tier rule:
///
/// 1. case-insensitive exact match against non-reserved branch keys;
/// 2. earliest-position substring match against non-reserved branch keys;
/// 3. case-insensitive exact match against branch target values;
/// 4. earliest-position substring match against branch target values.
///
/// Falls back to `_default` when nothing matches.
#[must_use]
pub fn resolve_route(reply: &str, branches: &BTreeMap<String, String>) -> RouteTarget {
    let reply_trimmed = reply.trim();
    let reply_lower = reply_trimmed.to_lowercase();

    let entries: Vec<(&String, &String)> = branches
        .iter()
        .filter(|(k, _)| !is_reserved_branch_key(k))
        .collect();

    // Tier 1: exact key.
    for (key, target) in &entries {
        if key.to_lowercase() == reply_lower {
            return branch_or_end(key, target);
        }
    }

    // Tier 2: substring key, earliest position wins.
    let key_needles: Vec<(usize, String)> = entries
        .iter()
        .enumerate()
        .map(|(i, (k, _))| (i, k.to_lowercase()))
        .collect();
    if let Some(i) = earliest_match(&reply_lower, &key_needles) {
        let (key, target) = entries[i];
        return branch_or_end(key, target);
    }

    // Tier 3: exact target value.
    for (key, target) in &entries {
        if target.to_lowercase() == reply_lower {
            return branch_or_end(key, target);
        }
    }

    // Tier 4: substring target value, earliest position wins.
    let target_needles: Vec<(usize, String)> = entries
        .iter()
        .enumerate()
        .map(|(i, (_, t))| (i, t.to_lowercase()))
        .collect();
    if let Some(i) = earliest_match(&reply_lower, &target_needles) {
        let (key, target) = entries[i];
        return branch_or_end(key, target);
    }

    // Fallback: _default.
    if let Some(target) = branches.get(DEFAULT_BRANCH) {
        return branch_or_end(DEFAULT_BRANCH, target);
    }

    RouteTarget::NoMatch
}

fn branch_or_end(key: &str, target: &str) -> RouteTarget {
    if target == END_TARGET {
        RouteTarget::End
    } else {
        RouteTarget::Branch {
            key: key.to_string(),
            target: target.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branches(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn exact_key_match_is_case_insensitive() {
        let b = branches(&[("Continue", "looper"), ("stop", "finalizer")]);
        let got = resolve_route("  CONTINUE ", &b);
        assert_eq!(
            got,
            RouteTarget::Branch {
                key: "Continue".to_string(),
                target: "looper".to_string()
            }
        );
    }

    #[test]
    fn earliest_position_wins_when_multiple_keys_appear() {
        let b = branches(&[
            ("贵宾", "A"),
            ("拉布拉多", "B"),
            ("柯基", "C"),
            ("金毛", "D"),
            ("_default", "D"),
        ]);
        let reply = "主持人提到了贵宾，请拉布拉多和柯基稍后发言";
        for _ in 0..32 {
            let got = resolve_route(reply, &b);
            assert_eq!(
                got,
                RouteTarget::Branch {
                    key: "贵宾".to_string(),
                    target: "A".to_string()
                }
            );
        }
    }

    #[test]
    fn target_value_matches_when_keys_do_not() {
        let b = branches(&[("yes", "approver"), ("no", "rejector")]);
        let got = resolve_route("approver", &b);
        assert_eq!(
            got,
            RouteTarget::Branch {
                key: "yes".to_string(),
                target: "approver".to_string()
            }
        );
    }

    #[test]
    fn falls_back_to_default_then_no_match() {
        let with_default = branches(&[("a", "alpha"), ("_default", "omega")]);
        assert_eq!(
            resolve_route("nothing relevant", &with_default),
            RouteTarget::Branch {
                key: DEFAULT_BRANCH.to_string(),
                target: "omega".to_string()
            }
        );

        let without_default = branches(&[("a", "alpha")]);
        assert_eq!(
            resolve_route("nothing relevant", &without_default),
            RouteTarget::NoMatch
        );
    }

    #[test]
    fn end_sentinel_terminates() {
        let b = branches(&[("done", "_end"), ("_default", "_end")]);
        assert_eq!(resolve_route("done", &b), RouteTarget::End);
        assert_eq!(resolve_route("???", &b), RouteTarget::End);
    }

    #[test]
    fn reserved_keys_are_not_options() {
        let b = branches(&[("go", "alpha"), ("_default", "omega"), ("_new_topic", "x")]);
        let prompt = build_route_prompt("Pick.", &b);
        assert!(prompt.contains("go"));
        assert!(!prompt.contains("_default"));
        assert!(!prompt.contains("_new_topic"));
    }
}
