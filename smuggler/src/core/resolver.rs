//! Build rule resolution: branch or explicit tag to the active rule.
//!
//! Evaluation order is fixed: exact key, then every key compiled as a regular
//! expression (lexicographic key order, first match wins), then the literal
//! `default` key. Pattern matching is unanchored, so `feature/` matches
//! `feature/login` and `hotfix/feature/x` alike.

use std::collections::BTreeMap;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::types::BuildRule;

/// Key of the fallback rule.
pub const DEFAULT_RULE: &str = "default";

/// What the caller wants to resolve against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector<'a> {
    /// Tag given on the command line. Never falls back to `default`.
    Explicit(&'a str),
    /// Current VCS branch (empty on a detached HEAD).
    Branch(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no build rule matches branch '{branch}' and no default rule exists")]
    BuildRuleNotFound { branch: String },
    #[error("no build rule matches explicit tag '{tag}'")]
    ExplicitTagNotFound { tag: String },
}

/// Resolve the active build rule, returning its key and a reference to it.
pub fn resolve<'r>(
    selector: Selector<'_>,
    rules: &'r BTreeMap<String, BuildRule>,
) -> Result<(&'r str, &'r BuildRule), ResolveError> {
    let value = match selector {
        Selector::Explicit(tag) => tag,
        Selector::Branch(branch) => branch,
    };

    if !value.is_empty() {
        if let Some((key, rule)) = rules.get_key_value(value) {
            debug!(rule = %key, "exact rule match");
            return Ok((key.as_str(), rule));
        }
        if let Some(found) = match_pattern(value, rules) {
            return Ok(found);
        }
    }

    match selector {
        Selector::Explicit(tag) => Err(ResolveError::ExplicitTagNotFound {
            tag: tag.to_string(),
        }),
        Selector::Branch(branch) => rules
            .get_key_value(DEFAULT_RULE)
            .map(|(key, rule)| {
                debug!(branch, "falling back to default rule");
                (key.as_str(), rule)
            })
            .ok_or_else(|| ResolveError::BuildRuleNotFound {
                branch: branch.to_string(),
            }),
    }
}

fn match_pattern<'r>(
    value: &str,
    rules: &'r BTreeMap<String, BuildRule>,
) -> Option<(&'r str, &'r BuildRule)> {
    for (key, rule) in rules {
        if key == DEFAULT_RULE {
            continue;
        }
        let pattern = match Regex::new(key) {
            Ok(pattern) => pattern,
            Err(err) => {
                warn!(rule = %key, err = %err, "rule key is not a valid pattern, skipping");
                continue;
            }
        };
        if pattern.is_match(value) {
            debug!(rule = %key, value, "pattern rule match");
            return Some((key.as_str(), rule));
        }
    }
    None
}
