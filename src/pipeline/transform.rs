//! Text transformer: ordered literal substitutions over matched messages.

use tracing::debug;

use crate::pipeline::rules::ReplacementRule;
use crate::pipeline::types::{Destination, InboundMessage, OutboundMessage};

/// Apply `rules` to `text` cumulatively, in the order given.
///
/// Each rule replaces every occurrence of its pattern in the output of the
/// previous rule. A pattern that does not occur is a no-op.
pub fn apply<'r, I>(text: &str, rules: I) -> String
where
    I: IntoIterator<Item = &'r ReplacementRule>,
{
    rules
        .into_iter()
        .fold(text.to_string(), |current, rule| rule.apply(&current))
}

/// Holds the replacement rules sorted by order index.
#[derive(Debug, Clone, Default)]
pub struct TextTransformer {
    rules: Vec<ReplacementRule>,
}

impl TextTransformer {
    /// Sort rules by ascending order index. Ties keep declaration order.
    pub fn new(mut rules: Vec<ReplacementRule>) -> Self {
        rules.sort_by_key(ReplacementRule::order);
        Self { rules }
    }

    pub fn rules(&self) -> &[ReplacementRule] {
        &self.rules
    }

    /// Rules that apply to messages from `source_id`, in application order.
    pub fn rules_for<'a>(&'a self, source_id: &'a str) -> impl Iterator<Item = &'a ReplacementRule> {
        self.rules
            .iter()
            .filter(move |rule| rule.scope().includes(source_id))
    }

    /// Rewrite a message's text for the given source.
    pub fn rewrite(&self, source_id: &str, text: &str) -> String {
        apply(text, self.rules_for(source_id))
    }

    /// Build the outbound message for an inbound one.
    pub fn transform(&self, message: &InboundMessage, destination: &Destination) -> OutboundMessage {
        let text = self.rewrite(&message.source_id, &message.text);
        if text != message.text {
            debug!(
                source = %message.source_id,
                id = %message.message_id,
                "Replacement rules rewrote message text"
            );
        }
        OutboundMessage {
            destination: destination.clone(),
            text,
            origin: message.message_ref(),
        }
    }
}
