//! Host access policy.
//!
//! When `SSH_ALLOWED_HOSTS` is set, every connection target must match at
//! least one of its comma-separated patterns. Patterns are compiled once at
//! construction into segment lists so each check is a simple walk instead of
//! re-parsing the pattern string.

use crate::mcp::error::SshMcpError;

/// A single compiled pattern, split on `*` wildcards.
///
/// `literals` holds the fixed text between wildcards. For `*.example.com`
/// that is `["", ".example.com"]`: an empty leading literal means the
/// pattern starts with a wildcard, an empty trailing literal means it ends
/// with one.
#[derive(Debug, Clone)]
struct CompiledPattern {
    source: String,
    literals: Vec<String>,
}

impl CompiledPattern {
    fn compile(pattern: &str) -> Self {
        Self {
            source: pattern.to_string(),
            literals: pattern.split('*').map(str::to_string).collect(),
        }
    }

    fn matches(&self, host: &str) -> bool {
        // No wildcard: exact, case-insensitive comparison.
        if self.literals.len() == 1 {
            return self.literals[0].eq_ignore_ascii_case(host);
        }

        let host = host.to_ascii_lowercase();
        let mut remainder = host.as_str();

        for (index, literal) in self.literals.iter().enumerate() {
            let literal = literal.to_ascii_lowercase();
            if index == 0 {
                // Leading literal must anchor at the start.
                match remainder.strip_prefix(literal.as_str()) {
                    Some(rest) => remainder = rest,
                    None => return false,
                }
            } else if index == self.literals.len() - 1 {
                // Trailing literal must anchor at the end.
                return remainder.ends_with(literal.as_str());
            } else if literal.is_empty() {
                // Adjacent wildcards collapse.
                continue;
            } else {
                // Interior literal floats: take the first occurrence.
                match remainder.find(literal.as_str()) {
                    Some(pos) => remainder = &remainder[pos + literal.len()..],
                    None => return false,
                }
            }
        }

        true
    }
}

/// Compiled host allow-list. An empty policy permits every host.
#[derive(Debug, Clone, Default)]
pub struct HostPolicy {
    patterns: Vec<CompiledPattern>,
}

impl HostPolicy {
    /// Compile a policy from a comma-separated pattern list, as carried by
    /// `SSH_ALLOWED_HOSTS`. Whitespace around entries is ignored and empty
    /// entries are skipped.
    pub fn from_patterns(raw: &str) -> Self {
        Self {
            patterns: raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(CompiledPattern::compile)
                .collect(),
        }
    }

    /// Compile from an optional raw list; `None` yields the permit-all policy.
    pub fn from_optional(raw: Option<&str>) -> Self {
        raw.map(Self::from_patterns).unwrap_or_default()
    }

    /// Check whether `host` is permitted. The policy is consulted before any
    /// network activity occurs.
    pub fn check(&self, host: &str) -> Result<(), SshMcpError> {
        if self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(host)) {
            return Ok(());
        }

        Err(SshMcpError::HostPolicyViolation {
            host: host.to_string(),
            patterns: self
                .patterns
                .iter()
                .map(|p| p.source.clone())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Whether the policy restricts hosts at all.
    pub fn is_restricted(&self) -> bool {
        !self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod exact_patterns {
        use super::*;

        #[test]
        fn test_exact_match_permits() {
            let policy = HostPolicy::from_patterns("db.internal");
            assert!(policy.check("db.internal").is_ok());
        }

        #[test]
        fn test_exact_match_is_case_insensitive() {
            let policy = HostPolicy::from_patterns("DB.Internal");
            assert!(policy.check("db.internal").is_ok());
        }

        #[test]
        fn test_non_matching_host_is_rejected() {
            let policy = HostPolicy::from_patterns("db.internal");
            let err = policy.check("web.internal").unwrap_err();
            assert!(matches!(err, SshMcpError::HostPolicyViolation { .. }));
        }

        #[test]
        fn test_partial_match_is_not_enough() {
            let policy = HostPolicy::from_patterns("db.internal");
            assert!(policy.check("db.internal.example.com").is_err());
            assert!(policy.check("prod-db.internal").is_err());
        }
    }

    mod wildcard_patterns {
        use super::*;

        #[test]
        fn test_suffix_wildcard() {
            let policy = HostPolicy::from_patterns("*.example.com");
            assert!(policy.check("web1.example.com").is_ok());
            assert!(policy.check("a.b.example.com").is_ok());
            assert!(policy.check("example.com").is_err());
            assert!(policy.check("web1.example.org").is_err());
        }

        #[test]
        fn test_prefix_wildcard() {
            let policy = HostPolicy::from_patterns("10.0.*");
            assert!(policy.check("10.0.1.5").is_ok());
            assert!(policy.check("10.0.").is_ok());
            assert!(policy.check("10.1.0.5").is_err());
        }

        #[test]
        fn test_interior_wildcard() {
            let policy = HostPolicy::from_patterns("web-*.prod");
            assert!(policy.check("web-01.prod").is_ok());
            assert!(policy.check("web-.prod").is_ok());
            assert!(policy.check("web-01.staging").is_err());
            assert!(policy.check("db-01.prod").is_err());
        }

        #[test]
        fn test_lone_wildcard_permits_everything() {
            let policy = HostPolicy::from_patterns("*");
            assert!(policy.check("anything.at.all").is_ok());
            assert!(policy.check("10.20.30.40").is_ok());
        }

        #[test]
        fn test_multiple_wildcards() {
            let policy = HostPolicy::from_patterns("*.db.*.internal");
            assert!(policy.check("a.db.east.internal").is_ok());
            assert!(policy.check("a.web.east.internal").is_err());
        }
    }

    mod pattern_lists {
        use super::*;

        #[test]
        fn test_any_pattern_suffices() {
            let policy = HostPolicy::from_patterns("db.internal, *.example.com");
            assert!(policy.check("db.internal").is_ok());
            assert!(policy.check("web.example.com").is_ok());
            assert!(policy.check("other.host").is_err());
        }

        #[test]
        fn test_whitespace_and_empty_entries_are_skipped() {
            let policy = HostPolicy::from_patterns(" db.internal , ,, web.internal ");
            assert!(policy.check("db.internal").is_ok());
            assert!(policy.check("web.internal").is_ok());
            assert!(policy.is_restricted());
        }

        #[test]
        fn test_empty_policy_permits_all() {
            let policy = HostPolicy::from_optional(None);
            assert!(policy.check("anywhere").is_ok());
            assert!(!policy.is_restricted());
        }

        #[test]
        fn test_all_empty_entries_permit_all() {
            let policy = HostPolicy::from_patterns(" , ,");
            assert!(policy.check("anywhere").is_ok());
            assert!(!policy.is_restricted());
        }
    }

    mod violation_message {
        use super::*;

        #[test]
        fn test_violation_names_host_and_patterns() {
            let policy = HostPolicy::from_patterns("db.internal,*.example.com");
            let err = policy.check("evil.host").unwrap_err();
            let message = err.to_string();
            assert!(message.contains("evil.host"));
            assert!(message.contains("db.internal"));
            assert!(message.contains("*.example.com"));
        }
    }
}
