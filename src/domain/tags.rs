//! Tag recognition and investigation allowlists.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Prefixes of tags that the agent manager hands out.
pub const KNOWN_TAG_PREFIXES: [&str; 4] = ["ecosystem-", "test-genie-", "agent-manager-", "run-"];

/// Tag prefix used for investigation runs.
pub const INVESTIGATION_TAG_PREFIX: &str = "agent-manager-investigation";

pub fn investigation_tag(investigation_id: &str) -> String {
    format!("{}-{}", INVESTIGATION_TAG_PREFIX, investigation_id)
}

/// One allowlist entry as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllowlistRule {
    pub pattern: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub case_sensitive: bool,
}

impl AllowlistRule {
    pub fn literal(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            is_regex: false,
            case_sensitive: false,
        }
    }

    pub fn regex(pattern: &str, case_sensitive: bool) -> Self {
        Self {
            pattern: pattern.to_string(),
            is_regex: true,
            case_sensitive,
        }
    }
}

#[derive(Debug, Clone)]
enum CompiledRule {
    /// Lowercased when the rule is case-insensitive.
    Prefix { pattern: String, case_sensitive: bool },
    Regex(Regex),
}

impl CompiledRule {
    fn matches(&self, tag: &str) -> bool {
        match self {
            Self::Prefix {
                pattern,
                case_sensitive: true,
            } => tag.starts_with(pattern.as_str()),
            Self::Prefix { pattern, .. } => tag.to_lowercase().starts_with(pattern.as_str()),
            Self::Regex(re) => re.is_match(tag),
        }
    }
}

/// Compiled set of allowlist rules. A tag is allowed if any rule matches.
///
/// Literal rules match as prefixes so that
/// `agent-manager-investigation` also admits
/// `agent-manager-investigation-<id>`.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    rules: Vec<CompiledRule>,
}

impl Allowlist {
    /// Compile rules. Invalid regexes are returned as errors.
    pub fn compile(rules: &[AllowlistRule]) -> Result<Self, regex::Error> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.is_regex {
                let re = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(!rule.case_sensitive)
                    .build()?;
                compiled.push(CompiledRule::Regex(re));
            } else if rule.case_sensitive {
                compiled.push(CompiledRule::Prefix {
                    pattern: rule.pattern.clone(),
                    case_sensitive: true,
                });
            } else {
                compiled.push(CompiledRule::Prefix {
                    pattern: rule.pattern.to_lowercase(),
                    case_sensitive: false,
                });
            }
        }
        Ok(Self { rules: compiled })
    }

    /// Compile rules, dropping any that fail to compile.
    pub fn compile_lossy(rules: &[AllowlistRule]) -> Self {
        let mut list = Self::default();
        for rule in rules {
            match Self::compile(std::slice::from_ref(rule)) {
                Ok(single) => list.rules.extend(single.rules),
                Err(e) => tracing::warn!(pattern = %rule.pattern, error = %e, "Ignoring invalid allowlist rule"),
            }
        }
        list
    }

    pub fn default_investigation() -> Self {
        Self::compile_lossy(&[AllowlistRule::literal(INVESTIGATION_TAG_PREFIX)])
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn matches(&self, tag: &str) -> bool {
        self.rules.iter().any(|rule| rule.matches(tag))
    }
}

/// True if the tag looks like one the agent manager issued.
pub fn is_agent_manager_tag(tag: &str, allowlist: &Allowlist) -> bool {
    if tag.is_empty() {
        return false;
    }
    if uuid::Uuid::parse_str(tag).is_ok() {
        return true;
    }
    if KNOWN_TAG_PREFIXES.iter().any(|p| tag.starts_with(p)) {
        return true;
    }
    allowlist.matches(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_tags_are_recognized() {
        let tag = uuid::Uuid::new_v4().to_string();
        assert!(is_agent_manager_tag(&tag, &Allowlist::default()));
    }

    #[test]
    fn test_known_prefixes_are_recognized() {
        let list = Allowlist::default();
        assert!(is_agent_manager_tag("ecosystem-build-42", &list));
        assert!(is_agent_manager_tag("test-genie-suite", &list));
        assert!(is_agent_manager_tag("run-7", &list));
        assert!(!is_agent_manager_tag("my-own-session", &list));
        assert!(!is_agent_manager_tag("", &list));
    }

    #[test]
    fn test_allowlist_extends_recognition() {
        let list = Allowlist::compile(&[AllowlistRule::literal("special-investigation")]).unwrap();
        assert!(is_agent_manager_tag("special-investigation", &list));
    }

    #[test]
    fn test_literal_rule_is_case_insensitive_prefix() {
        let list = Allowlist::compile(&[AllowlistRule::literal("Special-Investigation")]).unwrap();
        assert!(list.matches("special-investigation"));
        assert!(list.matches("SPECIAL-INVESTIGATION-123"));
        assert!(!list.matches("agent-manager-investigation"));
    }

    #[test]
    fn test_literal_rule_case_sensitive() {
        let rule = AllowlistRule {
            pattern: "Deep".into(),
            is_regex: false,
            case_sensitive: true,
        };
        let list = Allowlist::compile(&[rule]).unwrap();
        assert!(list.matches("Deep-dive"));
        assert!(!list.matches("deep-dive"));
    }

    #[test]
    fn test_regex_rule() {
        let list = Allowlist::compile(&[AllowlistRule::regex(r"^inv-\d+$", false)]).unwrap();
        assert!(list.matches("INV-12"));
        assert!(!list.matches("inv-12-extra"));
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        assert!(Allowlist::compile(&[AllowlistRule::regex("(unclosed", true)]).is_err());
        let lossy = Allowlist::compile_lossy(&[
            AllowlistRule::regex("(unclosed", true),
            AllowlistRule::literal("ok"),
        ]);
        assert!(lossy.matches("ok-1"));
    }

    #[test]
    fn test_default_investigation_allowlist() {
        let list = Allowlist::default_investigation();
        assert!(list.matches("agent-manager-investigation"));
        assert!(list.matches(&investigation_tag("abc")));
        assert!(!list.matches("special-investigation"));
    }
}
