//! Rule model: filter predicates and text replacement rules.
//!
//! Rules are validated once when the configuration is loaded and are
//! immutable afterwards. Evaluation code never has to deal with a blank
//! keyword or an empty pattern.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Which sources a rule applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SourceScope {
    #[default]
    All,
    Only(Vec<String>),
}

impl SourceScope {
    /// Build a scope from an optional list of source ids (`None` = all).
    pub fn from_ids(ids: Option<Vec<String>>) -> Self {
        match ids {
            Some(ids) => Self::Only(ids),
            None => Self::All,
        }
    }

    pub fn includes(&self, source_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(ids) => ids.iter().any(|id| id == source_id),
        }
    }

    pub fn source_ids(&self) -> &[String] {
        match self {
            Self::All => &[],
            Self::Only(ids) => ids,
        }
    }
}

/// How a filter rule combines its keyword groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// At least one group must be satisfied.
    #[default]
    Any,
    /// Every group must be satisfied.
    All,
}

// ── Filter rules ────────────────────────────────────────────────────

/// A named interest predicate over message text.
///
/// A group is satisfied when at least one of its keywords occurs in the
/// (normalized) text as a substring.
#[derive(Debug, Clone)]
pub struct FilterRule {
    name: String,
    /// Keyword groups, already lowercased when the rule is case-insensitive.
    groups: Vec<Vec<String>>,
    mode: MatchMode,
    case_sensitive: bool,
    ignore_emoji: bool,
    scope: SourceScope,
}

impl FilterRule {
    pub fn new(
        name: impl Into<String>,
        groups: Vec<Vec<String>>,
        mode: MatchMode,
        case_sensitive: bool,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let key = format!("filters.rules[{name}]");

        if groups.is_empty() {
            return Err(ConfigError::invalid(key, "rule has no keyword groups"));
        }

        let mut normalized = Vec::with_capacity(groups.len());
        for (i, group) in groups.into_iter().enumerate() {
            if group.is_empty() {
                return Err(ConfigError::invalid(
                    &key,
                    format!("keyword group {i} is empty"),
                ));
            }
            let mut keywords = Vec::with_capacity(group.len());
            for keyword in group {
                if keyword.trim().is_empty() {
                    return Err(ConfigError::invalid(
                        &key,
                        format!("keyword group {i} contains a blank keyword"),
                    ));
                }
                keywords.push(if case_sensitive {
                    keyword
                } else {
                    keyword.to_lowercase()
                });
            }
            normalized.push(keywords);
        }

        Ok(Self {
            name,
            groups: normalized,
            mode,
            case_sensitive,
            ignore_emoji: false,
            scope: SourceScope::All,
        })
    }

    /// Restrict the rule to the given sources.
    pub fn scoped_to(mut self, scope: SourceScope) -> Self {
        self.scope = scope;
        self
    }

    /// Strip emoji from the text before matching.
    pub fn ignoring_emoji(mut self, ignore: bool) -> Self {
        self.ignore_emoji = ignore;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn scope(&self) -> &SourceScope {
        &self.scope
    }

    pub fn groups(&self) -> &[Vec<String>] {
        &self.groups
    }

    /// Apply this rule's normalization to raw message text.
    pub fn normalize(&self, text: &str) -> String {
        let text = if self.ignore_emoji {
            strip_emoji(text)
        } else {
            text.to_string()
        };
        if self.case_sensitive {
            text
        } else {
            text.to_lowercase()
        }
    }

    /// Test already-normalized text against the keyword groups.
    pub fn matches_normalized(&self, normalized: &str) -> bool {
        if normalized.is_empty() {
            return false;
        }
        let satisfied = |group: &Vec<String>| group.iter().any(|kw| normalized.contains(kw.as_str()));
        match self.mode {
            MatchMode::Any => self.groups.iter().any(satisfied),
            MatchMode::All => self.groups.iter().all(satisfied),
        }
    }
}

// ── Replacement rules ───────────────────────────────────────────────

/// A literal (pattern → replacement) substitution with an order index.
#[derive(Debug, Clone)]
pub struct ReplacementRule {
    pattern: String,
    replacement: String,
    order: i32,
    case_sensitive: bool,
    scope: SourceScope,
    /// Escaped case-insensitive matcher; `None` for case-sensitive rules.
    matcher: Option<Regex>,
}

impl ReplacementRule {
    pub fn new(
        pattern: impl Into<String>,
        replacement: impl Into<String>,
        order: i32,
    ) -> Result<Self, ConfigError> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(ConfigError::invalid(
                format!("replacements[{order}].pattern"),
                "pattern must not be empty",
            ));
        }
        Ok(Self {
            pattern,
            replacement: replacement.into(),
            order,
            case_sensitive: true,
            scope: SourceScope::All,
            matcher: None,
        })
    }

    /// Match the pattern without regard to case (still a literal match).
    pub fn case_insensitive(mut self) -> Result<Self, ConfigError> {
        let matcher = RegexBuilder::new(&regex::escape(&self.pattern))
            .case_insensitive(true)
            .build()
            .map_err(|e| {
                ConfigError::invalid(format!("replacements[{}].pattern", self.order), e.to_string())
            })?;
        self.case_sensitive = false;
        self.matcher = Some(matcher);
        Ok(self)
    }

    pub fn scoped_to(mut self, scope: SourceScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn scope(&self) -> &SourceScope {
        &self.scope
    }

    /// Replace every occurrence of the pattern in `text`.
    pub fn apply(&self, text: &str) -> String {
        match &self.matcher {
            Some(re) => re
                .replace_all(text, regex::NoExpand(&self.replacement))
                .into_owned(),
            None => text.replace(&self.pattern, &self.replacement),
        }
    }

    /// Whether the pattern occurs in `text`.
    pub fn is_match(&self, text: &str) -> bool {
        match &self.matcher {
            Some(re) => re.is_match(text),
            None => text.contains(&self.pattern),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Remove emoji and pictographic symbols, keeping all other text.
pub fn strip_emoji(text: &str) -> String {
    text.chars().filter(|c| !is_emoji(*c)).collect()
}

fn is_emoji(c: char) -> bool {
    matches!(
        c as u32,
        0x1F000..=0x1FAFF // pictographs, emoticons, flags, transport
            | 0x2600..=0x27BF // misc symbols, dingbats
            | 0xFE0E..=0xFE0F // variation selectors
            | 0x200D          // zero-width joiner
            | 0x2B00..=0x2BFF // arrows and stars
    )
}
