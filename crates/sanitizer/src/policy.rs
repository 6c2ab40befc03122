//! Masking policy: the set of rules and field names the sanitizer applies,
//! and the development/production + enabled/disabled gates ahead of them.

use std::collections::HashSet;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SanitizerError {
    #[error("invalid regex in rule {name:?}: {source}")]
    InvalidRegex { name: String, #[source] source: regex::Error },
    #[error("duplicate rule name {0:?}")]
    DuplicateRuleName(String),
    #[error(
        "rule {later:?}'s pattern matches rule {earlier:?}'s replacement text; \
         built-in replacements must not be re-matched by a later rule"
    )]
    RuleConflict { earlier: String, later: String },
    #[error("unknown mode {0:?}, expected \"development\" or \"production\"")]
    UnknownMode(String),
}

/// `MaskingPolicy::mode`. Constructed from a single string the embedder
/// passes in (the core never reads the process environment itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Development,
    Production,
}

impl FromStr for Mode {
    type Err = SanitizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" | "dev" => Ok(Mode::Development),
            "production" | "prod" => Ok(Mode::Production),
            other => Err(SanitizerError::UnknownMode(other.to_string())),
        }
    }
}

/// A single find-and-replace rule applied during string sanitization.
#[derive(Clone)]
pub struct MaskingRule {
    pub name: String,
    pattern: Regex,
    /// Whether `pattern` originated as a user regex (`true`) or a literal
    /// substring compiled into a case-insensitive sweep (`false`); purely
    /// informational, matching behaves identically either way.
    is_literal: bool,
    pub replacement: String,
    pub enabled: bool,
    pub description: Option<String>,
}

impl std::fmt::Debug for MaskingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskingRule")
            .field("name", &self.name)
            .field("pattern", &self.pattern.as_str())
            .field("replacement", &self.replacement)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl MaskingRule {
    pub fn regex(
        name: impl Into<String>,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self, SanitizerError> {
        let name = name.into();
        let compiled = Regex::new(pattern).map_err(|source| SanitizerError::InvalidRegex {
            name: name.clone(),
            source,
        })?;
        Ok(Self {
            name,
            pattern: compiled,
            is_literal: false,
            replacement: replacement.into(),
            enabled: true,
            description: None,
        })
    }

    pub fn literal(
        name: impl Into<String>,
        substring: &str,
        replacement: impl Into<String>,
    ) -> Result<Self, SanitizerError> {
        let name = name.into();
        let compiled = Regex::new(&format!("(?i){}", regex::escape(substring))).map_err(|source| {
            SanitizerError::InvalidRegex { name: name.clone(), source }
        })?;
        Ok(Self {
            name,
            pattern: compiled,
            is_literal: true,
            replacement: replacement.into(),
            enabled: true,
            description: None,
        })
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_literal(&self) -> bool {
        self.is_literal
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    pub fn apply(&self, text: &str) -> String {
        self.pattern.replace_all(text, regex::NoExpand(&self.replacement)).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct MaskingPolicy {
    pub mode: Mode,
    pub enabled: bool,
    pub strict_mode: bool,
    pub max_depth: usize,
    rules: Vec<MaskingRule>,
    custom_rules: Vec<MaskingRule>,
    pub sensitive_field_names: HashSet<String>,
}

const DEFAULT_MAX_DEPTH: usize = 50;

impl MaskingPolicy {
    /// Construct the default policy for `mode`, validated at construction
    /// time (see [`MaskingPolicy::validate`]).
    pub fn new(mode: Mode) -> Result<Self, SanitizerError> {
        let rules = default_rules()?;
        let policy = Self {
            mode,
            enabled: true,
            strict_mode: false,
            max_depth: DEFAULT_MAX_DEPTH,
            rules,
            custom_rules: Vec::new(),
            sensitive_field_names: default_sensitive_field_names(),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// All enabled rules in application order: built-ins, then custom.
    pub fn active_rules(&self) -> impl Iterator<Item = &MaskingRule> {
        self.rules.iter().chain(self.custom_rules.iter()).filter(|r| r.enabled)
    }

    /// Built-ins then custom, enabled or not — used by admin ops that need
    /// to find a rule by name regardless of its current enabled state.
    pub fn all_rules(&self) -> impl Iterator<Item = &MaskingRule> {
        self.rules.iter().chain(self.custom_rules.iter())
    }

    pub fn add_custom_rule(&mut self, rule: MaskingRule) -> Result<(), SanitizerError> {
        if self.all_rules().any(|r| r.name == rule.name) {
            return Err(SanitizerError::DuplicateRuleName(rule.name));
        }
        self.custom_rules.push(rule);
        self.validate()
    }

    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.custom_rules.len();
        self.custom_rules.retain(|r| r.name != name);
        if self.custom_rules.len() != before {
            return true;
        }
        // Built-ins are disabled rather than removed: rule names stay
        // unique for the lifetime of the policy and disabled rules are
        // preserved, per the data-model invariant.
        if let Some(r) = self.rules.iter_mut().find(|r| r.name == name) {
            r.enabled = false;
            return true;
        }
        false
    }

    pub fn toggle_rule(&mut self, name: &str, enabled: bool) -> bool {
        for r in self.rules.iter_mut().chain(self.custom_rules.iter_mut()) {
            if r.name == name {
                r.enabled = enabled;
                return true;
            }
        }
        false
    }

    /// Policy-lint step mandated by `spec.md` §9's "regex composition" open
    /// question: no enabled rule's replacement text may itself be matched
    /// by a later enabled rule, since rules apply left-to-right over the
    /// running string and a later match on an earlier replacement would
    /// break idempotence (property 1 in §8).
    pub fn validate(&self) -> Result<(), SanitizerError> {
        let active: Vec<&MaskingRule> = self.rules.iter().chain(self.custom_rules.iter()).collect();
        for (i, earlier) in active.iter().enumerate() {
            if !earlier.enabled {
                continue;
            }
            for later in active.iter().skip(i + 1) {
                if later.enabled && later.is_match(&earlier.replacement) {
                    return Err(SanitizerError::RuleConflict {
                        earlier: earlier.name.clone(),
                        later: later.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// §4.2 policy gate: sanitization is the identity function whenever the
    /// policy is disabled or in development mode.
    pub fn is_identity(&self) -> bool {
        !self.enabled || self.mode == Mode::Development
    }
}

fn default_sensitive_field_names() -> HashSet<String> {
    [
        "password",
        "passwd",
        "secret",
        "token",
        "apikey",
        "api_key",
        "ssn",
        "creditcard",
        "credit_card",
        "cvv",
        "pin",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_rules() -> Result<Vec<MaskingRule>, SanitizerError> {
    Ok(vec![
        MaskingRule::regex(
            "email",
            r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}",
            "***@***.***",
        )?
        .with_description("email address"),
        MaskingRule::regex("phone", r"(?:\+?\d[\s.\-]?){9,}\d", "[PHONE]")?
            .with_description("phone number, 10+ digits"),
        MaskingRule::regex("credit_card", r"\b(?:\d[ \-]?){16}\b", "[CREDIT_CARD]")?
            .with_description("16-digit card number"),
        MaskingRule::regex("ssn", r"\b\d{3}-\d{2}-\d{4}\b", "[SSN]")?
            .with_description("US social security number"),
        MaskingRule::literal("password_literal", "password", "[REDACTED]")?
            .with_description("literal substring \"password\""),
        MaskingRule::regex("api_key", r"\b[A-Za-z0-9_\-]{32,}\b", "[API_KEY]")?
            .with_description("API-key-like token, 32+ alphanumeric/underscore/dash chars"),
        MaskingRule::regex(
            "jwt",
            r"\b[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+\b",
            "[JWT]",
        )?
        .with_description("three-segment base64url JWT"),
        MaskingRule::regex("national_id", r"\b\d{9,12}\b", "[NATIONAL_ID]")?
            .with_description("national id, 9-12 digits"),
        MaskingRule::regex("bank_account", r"\b\d{10,20}\b", "[BANK_ACCOUNT]")?
            .with_description("bank account, 10-20 digits"),
        MaskingRule::regex("ipv4", r"\b(?:\d{1,3}\.){3}\d{1,3}\b", "[IP_ADDRESS]")?
            .with_enabled(false)
            .with_description("IPv4 address; disabled by default, see spec.md §4.2"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_validates() {
        MaskingPolicy::new(Mode::Production).unwrap();
    }

    #[test]
    fn unknown_mode_string_errs() {
        assert!("loud".parse::<Mode>().is_err());
    }

    #[test]
    fn dev_mode_and_disabled_are_identity() {
        let mut p = MaskingPolicy::new(Mode::Development).unwrap();
        assert!(p.is_identity());
        p.mode = Mode::Production;
        assert!(!p.is_identity());
        p.enabled = false;
        assert!(p.is_identity());
    }

    #[test]
    fn duplicate_custom_rule_name_rejected() {
        let mut p = MaskingPolicy::new(Mode::Production).unwrap();
        let err = p.add_custom_rule(MaskingRule::literal("email", "x", "y").unwrap());
        assert!(matches!(err, Err(SanitizerError::DuplicateRuleName(_))));
    }

    #[test]
    fn conflicting_custom_rule_rejected() {
        let mut p = MaskingPolicy::new(Mode::Production).unwrap();
        // This rule's pattern matches the literal text the ssn rule (which
        // runs earlier) replaces matches with.
        let bad = MaskingRule::literal("matches_ssn_marker", "[SSN]", "boom").unwrap();
        assert!(matches!(p.add_custom_rule(bad), Err(SanitizerError::RuleConflict { .. })));
    }

    #[test]
    fn toggle_and_remove_builtin_preserves_name() {
        let mut p = MaskingPolicy::new(Mode::Production).unwrap();
        assert!(p.toggle_rule("email", false));
        assert!(!p.all_rules().find(|r| r.name == "email").unwrap().enabled);
        assert!(p.remove_rule("email"));
        assert!(p.all_rules().any(|r| r.name == "email"));
    }
}
