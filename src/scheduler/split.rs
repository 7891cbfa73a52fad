//! Sentence-level units of scheduling work.

use std::time::Duration;

use crate::error::DecoderError;
use crate::model::{Sentence, Suggestion, Translation};

/// Where the time of one split went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitTiming {
    /// Wait for the worker shared by the whole schedule call.
    pub queue_wait: Duration,
    /// Time spent producing this split's output.
    pub decode_time: Duration,
}

/// One sentence to translate, its suggestions, and the slot the scheduler
/// fills in.
#[derive(Debug, Clone)]
pub struct TranslationSplit {
    pub sentence: Sentence,
    /// Ranked best first.
    pub suggestions: Vec<Suggestion>,
    pub output: Option<Result<Translation, DecoderError>>,
    pub timing: SplitTiming,
}

impl TranslationSplit {
    pub fn new(sentence: Sentence) -> Self {
        Self {
            sentence,
            suggestions: Vec::new(),
            output: None,
            timing: SplitTiming::default(),
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<Suggestion>) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn top_suggestion(&self) -> Option<&Suggestion> {
        self.suggestions.first()
    }

    /// Whether the scheduler has already produced an output.
    pub fn is_dispatched(&self) -> bool {
        self.output.is_some()
    }

    /// The produced translation, if the split succeeded.
    pub fn translation(&self) -> Option<&Translation> {
        self.output.as_ref().and_then(|o| o.as_ref().ok())
    }

    /// Moves the output out, leaving the split undispatched.
    pub fn take_output(&mut self) -> Option<Result<Translation, DecoderError>> {
        self.output.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LanguageDirection;

    #[test]
    fn test_split_accessors() {
        let direction = LanguageDirection::new("en", "it");
        let mut split = TranslationSplit::new(Sentence::from_text("hello"))
            .with_suggestions(vec![Suggestion::new(direction, "hello", "ciao", 0.8)]);

        assert_eq!(split.top_suggestion().map(|s| s.score), Some(0.8));
        assert!(!split.is_dispatched());
        assert!(split.translation().is_none());

        split.output = Some(Ok(Translation::from_tokens(&["ciao"])));
        assert_eq!(split.translation().map(|t| t.text()), Some("ciao".to_string()));

        assert!(split.take_output().is_some());
        assert!(!split.is_dispatched());
    }
}
