//! Data types read by the pool and the scheduler.
//!
//! Only the fields the execution layer needs are modelled here: the
//! language direction that selects a checkpoint, the tokenized sentence,
//! the ranked suggestions supplied by the translation memory, and the
//! translation produced by a worker.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Source/target language pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LanguageDirection {
    pub source: String,
    pub target: String,
}

impl LanguageDirection {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for LanguageDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.source, self.target)
    }
}

impl FromStr for LanguageDirection {
    type Err = String;

    /// Parses `en-it` or `en>it`. Region subtags must use `_` when the
    /// `-` separator is used (`en_US-it`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, target) = s
            .split_once('>')
            .or_else(|| s.split_once('-'))
            .ok_or_else(|| format!("Invalid language direction: '{}'", s))?;

        let source = source.trim();
        let target = target.trim();
        if source.is_empty() || target.is_empty() {
            return Err(format!("Invalid language direction: '{}'", s));
        }

        Ok(Self::new(source, target))
    }
}

/// Identifier of a trained model snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(PathBuf);

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Physical placement of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl Device {
    /// Value exported as `CUDA_VISIBLE_DEVICES`; `-1` hides every GPU.
    pub fn visible_devices(&self) -> String {
        match self {
            Device::Cpu => "-1".to_string(),
            Device::Gpu(id) => id.to_string(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(id) => write!(f, "gpu:{}", id),
        }
    }
}

/// A token together with its trailing whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub right_space: bool,
}

impl Word {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            right_space: true,
        }
    }
}

/// A tokenized source sentence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentence {
    pub words: Vec<Word>,
}

impl Sentence {
    pub fn new(words: Vec<Word>) -> Self {
        Self { words }
    }

    /// Splits on whitespace; used by the CLI and by tests.
    pub fn from_text(text: &str) -> Self {
        Self::new(text.split_whitespace().map(Word::new).collect())
    }

    pub fn has_words(&self) -> bool {
        !self.words.is_empty()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.words.iter().map(|w| w.text.clone()).collect()
    }

    /// Tokens joined by a single space, as sent to the worker.
    pub fn serialize(&self) -> String {
        self.words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A ranked fuzzy match from the translation memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub direction: LanguageDirection,
    pub source: Vec<String>,
    pub translation: Vec<String>,
    /// Similarity in `[0, 1]`; `1.0` is a perfect match.
    pub score: f32,
}

impl Suggestion {
    pub fn new(
        direction: LanguageDirection,
        source: impl Into<String>,
        translation: impl Into<String>,
        score: f32,
    ) -> Self {
        let split = |s: String| s.split_whitespace().map(str::to_string).collect();
        Self {
            direction,
            source: split(source.into()),
            translation: split(translation.into()),
            score,
        }
    }

    pub fn is_perfect_match(&self) -> bool {
        self.score == 1.0
    }
}

/// Word alignment as parallel source/target index vectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alignment {
    pub source: Vec<usize>,
    pub target: Vec<usize>,
}

impl Alignment {
    pub fn new(source: Vec<usize>, target: Vec<usize>) -> Self {
        Self { source, target }
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }
}

/// Output of one split.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub words: Vec<Word>,
    #[serde(default)]
    pub alignment: Option<Alignment>,
}

impl Translation {
    pub fn new(words: Vec<Word>, alignment: Option<Alignment>) -> Self {
        Self { words, alignment }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> Self {
        Self::new(tokens.iter().map(|t| Word::new(t.as_ref())).collect(), None)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn has_alignment(&self) -> bool {
        self.alignment.is_some()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.words.iter().map(|w| w.text.clone()).collect()
    }

    pub fn text(&self) -> String {
        let mut out = String::new();
        for (i, word) in self.words.iter().enumerate() {
            out.push_str(&word.text);
            if word.right_space && i + 1 < self.words.len() {
                out.push(' ');
            }
        }
        out
    }
}
