//! Filter engine: decides whether an inbound message is of interest.
//!
//! Rules are evaluated in their declared configuration order and the first
//! satisfied rule wins. Evaluation is a pure function of the message and the
//! rule set.

use tracing::debug;

use crate::pipeline::rules::FilterRule;
use crate::pipeline::types::InboundMessage;

/// Result of evaluating one message.
#[derive(Debug, Clone, Copy)]
pub enum FilterVerdict<'a> {
    /// The cited rule matched.
    Matched(&'a FilterRule),
    /// Filtering is disabled and the message has text.
    PassThrough,
    /// No rule matched (or the text is empty).
    Rejected,
}

impl<'a> FilterVerdict<'a> {
    pub fn is_match(&self) -> bool {
        !matches!(self, Self::Rejected)
    }

    /// The rule that matched, if any.
    pub fn rule(&self) -> Option<&'a FilterRule> {
        match *self {
            Self::Matched(rule) => Some(rule),
            _ => None,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &str {
        match self {
            Self::Matched(rule) => rule.name(),
            Self::PassThrough => "pass_through",
            Self::Rejected => "rejected",
        }
    }
}

/// Evaluates messages against the ordered filter rules.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    rules: Vec<FilterRule>,
    enabled: bool,
}

impl FilterEngine {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self {
            rules,
            enabled: true,
        }
    }

    /// An engine that lets every non-empty message through.
    pub fn pass_through() -> Self {
        Self {
            rules: Vec::new(),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// Evaluate a message against all rules in declared order.
    pub fn evaluate(&self, message: &InboundMessage) -> FilterVerdict<'_> {
        if message.text.trim().is_empty() {
            debug!(
                source = %message.source_id,
                id = %message.message_id,
                "Empty message text, not matching"
            );
            return FilterVerdict::Rejected;
        }

        if !self.enabled {
            return FilterVerdict::PassThrough;
        }

        for rule in &self.rules {
            if !rule.scope().includes(&message.source_id) {
                continue;
            }

            let normalized = rule.normalize(&message.text);
            if rule.matches_normalized(&normalized) {
                debug!(
                    source = %message.source_id,
                    id = %message.message_id,
                    rule = %rule.name(),
                    "Message matched filter rule"
                );
                return FilterVerdict::Matched(rule);
            }
        }

        debug!(
            source = %message.source_id,
            id = %message.message_id,
            "Message matched no filter rule"
        );
        FilterVerdict::Rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::rules::{MatchMode, SourceScope};

    fn groups(gs: &[&[&str]]) -> Vec<Vec<String>> {
        gs.iter()
            .map(|g| g.iter().map(|w| w.to_string()).collect())
            .collect()
    }

    fn msg(source: &str, text: &str) -> InboundMessage {
        InboundMessage::new(source, "1", text)
    }

    #[test]
    fn any_mode_matches_single_group_keyword() {
        let rule = FilterRule::new("rain", groups(&[&["rain in india"]]), MatchMode::Any, false)
            .unwrap();
        let engine = FilterEngine::new(vec![rule]);

        let verdict = engine.evaluate(&msg("group-A", "Rain in India, heavy flooding reported"));
        assert!(verdict.is_match());
        assert_eq!(verdict.rule().map(FilterRule::name), Some("rain"));
    }

    #[test]
    fn any_mode_one_of_several_groups_is_enough() {
        let rule = FilterRule::new(
            "weather",
            groups(&[&["cyclone"], &["heavy rain", "downpour"]]),
            MatchMode::Any,
            false,
        )
        .unwrap();
        let engine = FilterEngine::new(vec![rule]);
        assert!(engine.evaluate(&msg("a", "Sudden downpour in Pune")).is_match());
        assert!(!engine.evaluate(&msg("a", "Sunny all week")).is_match());
    }

    #[test]
    fn all_mode_requires_every_group() {
        let rule = FilterRule::new(
            "mumbai-rain",
            groups(&[&["rain", "storm"], &["mumbai", "bombay"]]),
            MatchMode::All,
            false,
        )
        .unwrap();
        let engine = FilterEngine::new(vec![rule]);

        assert!(engine.evaluate(&msg("a", "Storm warning for Mumbai")).is_match());
        assert!(!engine.evaluate(&msg("a", "Storm warning for Delhi")).is_match());
        assert!(!engine.evaluate(&msg("a", "Traffic update")).is_match());
    }

    #[test]
    fn single_occurrence_can_satisfy_multiple_groups() {
        let rule = FilterRule::new(
            "overlap",
            groups(&[&["rain"], &["rain in india"]]),
            MatchMode::All,
            false,
        )
        .unwrap();
        let engine = FilterEngine::new(vec![rule]);
        assert!(engine.evaluate(&msg("a", "rain in india")).is_match());
    }

    #[test]
    fn empty_text_never_matches() {
        let rule = FilterRule::new("r", groups(&[&["rain"]]), MatchMode::Any, false).unwrap();
        let engine = FilterEngine::new(vec![rule]);
        assert!(!engine.evaluate(&msg("a", "")).is_match());
        assert!(!engine.evaluate(&msg("a", "   ")).is_match());
        assert!(!FilterEngine::pass_through().evaluate(&msg("a", "")).is_match());
    }

    #[test]
    fn first_matching_rule_wins() {
        let first = FilterRule::new("first", groups(&[&["rain"]]), MatchMode::Any, false).unwrap();
        let second = FilterRule::new("second", groups(&[&["flood"]]), MatchMode::Any, false)
            .unwrap();
        let engine = FilterEngine::new(vec![first, second]);

        let verdict = engine.evaluate(&msg("a", "Rain and flood"));
        assert_eq!(verdict.label(), "first");
    }

    #[test]
    fn scoped_rule_skips_other_sources() {
        let scoped = FilterRule::new("scoped", groups(&[&["rain"]]), MatchMode::Any, false)
            .unwrap()
            .scoped_to(SourceScope::Only(vec!["group-B".into()]));
        let engine = FilterEngine::new(vec![scoped]);

        assert!(!engine.evaluate(&msg("group-A", "rain")).is_match());
        assert!(engine.evaluate(&msg("group-B", "rain")).is_match());
    }

    #[test]
    fn pass_through_engine_accepts_text() {
        let engine = FilterEngine::pass_through();
        let verdict = engine.evaluate(&msg("a", "anything at all"));
        assert!(matches!(verdict, FilterVerdict::PassThrough));
        assert!(verdict.rule().is_none());
    }

    #[test]
    fn no_rules_rejects_everything_when_enabled() {
        let engine = FilterEngine::new(vec![]);
        assert!(!engine.evaluate(&msg("a", "rain")).is_match());
    }
}
