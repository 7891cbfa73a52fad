//! Maps a batch of translation splits onto one acquired worker.
//!
//! Dispatch policy per split, in order:
//!
//! 1. no tokens: empty translation, no worker call
//! 2. no pool: copy the top suggestion, or the source tokens
//! 3. top suggestion scores exactly `1.0`: alignment-only call against it
//! 4. suggestions present: translate with them as hints
//! 5. otherwise: plain translate
//!
//! Splits run one after the other on the same worker. A failure specific
//! to one split is stored in that split and the walk goes on; a dead
//! worker ends the walk and the error is returned after release.

pub mod split;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics::{DispatchMode, MetricsCollector};
use crate::model::{Alignment, LanguageDirection, Sentence, Translation, Word};
use crate::pool::{DecoderPool, WorkerHandle};

pub use split::{SplitTiming, TranslationSplit};

/// Dispatches splits to the decoder pool, or answers them by pass-through
/// when no pool is configured.
pub struct Scheduler {
    pool: Option<Arc<DecoderPool>>,
    acquire_timeout: Option<Duration>,
    metrics: MetricsCollector,
}

impl Scheduler {
    pub fn new(pool: Option<Arc<DecoderPool>>) -> Self {
        Self {
            pool,
            acquire_timeout: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Bounds the wait for a worker; the pool's own setting applies when
    /// unset.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn is_passthrough(&self) -> bool {
        self.pool.is_none()
    }

    pub fn pool(&self) -> Option<&Arc<DecoderPool>> {
        self.pool.as_ref()
    }

    /// Fills the output of every split.
    ///
    /// # Errors
    ///
    /// Returns the acquisition error if no worker could be obtained, or the
    /// unavailability error of a worker that died mid-walk. Splits after the
    /// failing one are left without output.
    pub async fn schedule(
        &self,
        direction: &LanguageDirection,
        splits: &mut [TranslationSplit],
    ) -> Result<()> {
        let needs_worker = splits.iter().any(|s| s.sentence.has_words());

        let lease = match &self.pool {
            Some(pool) if needs_worker => {
                let begin = Instant::now();
                let handle = pool.acquire(direction, self.acquire_timeout).await?;
                Some((Lease::new(pool, handle), begin.elapsed()))
            }
            _ => None,
        };

        let worker = lease
            .as_ref()
            .and_then(|(lease, wait)| lease.worker().map(|handle| (handle, *wait)));
        let result = self.walk(direction, splits, worker).await;

        drop(lease);
        result
    }

    async fn walk(
        &self,
        direction: &LanguageDirection,
        splits: &mut [TranslationSplit],
        worker: Option<(&WorkerHandle, Duration)>,
    ) -> Result<()> {
        for (index, split) in splits.iter_mut().enumerate() {
            let begin = Instant::now();
            let (mode, output) = self.dispatch(direction, split, worker.map(|(h, _)| h)).await;

            split.timing = SplitTiming {
                queue_wait: worker.map(|(_, wait)| wait).unwrap_or_default(),
                decode_time: begin.elapsed(),
            };
            self.metrics.record_dispatch(mode);
            debug!(
                direction = %direction,
                split = index,
                mode = mode.as_str(),
                elapsed_ms = split.timing.decode_time.as_millis() as u64,
                "Split dispatched"
            );

            match output {
                Err(e) if e.is_unavailable() => {
                    warn!(direction = %direction, split = index, error = %e, "Worker lost during schedule");
                    split.output = Some(Err(e.clone()));
                    return Err(e);
                }
                output => split.output = Some(output),
            }
        }

        Ok(())
    }

    async fn dispatch(
        &self,
        direction: &LanguageDirection,
        split: &TranslationSplit,
        worker: Option<&WorkerHandle>,
    ) -> (DispatchMode, Result<Translation>) {
        if !split.sentence.has_words() {
            return (DispatchMode::Empty, Ok(Translation::empty()));
        }

        let Some(worker) = worker else {
            return match split.top_suggestion() {
                Some(top) => (
                    DispatchMode::Suggestion,
                    Ok(Translation::from_tokens(&top.translation)),
                ),
                None => (DispatchMode::Passthrough, Ok(copy_source(&split.sentence))),
            };
        };

        match split.top_suggestion() {
            Some(top) if top.is_perfect_match() => {
                let aligned = worker
                    .align(direction, &split.sentence, &top.translation)
                    .await
                    .map(|t| Translation::new(words(&top.translation), t.alignment));
                (DispatchMode::Align, aligned)
            }
            Some(_) => (
                DispatchMode::Hinted,
                worker
                    .translate(direction, &split.sentence, &split.suggestions)
                    .await,
            ),
            None => (
                DispatchMode::Plain,
                worker.translate(direction, &split.sentence, &[]).await,
            ),
        }
    }
}

/// An acquired worker, handed back to the pool on drop. Covers a walk
/// that panics or a `schedule` future dropped before completion.
struct Lease<'a> {
    pool: &'a DecoderPool,
    handle: Option<Arc<WorkerHandle>>,
}

impl<'a> Lease<'a> {
    fn new(pool: &'a DecoderPool, handle: Arc<WorkerHandle>) -> Self {
        Self {
            pool,
            handle: Some(handle),
        }
    }

    fn worker(&self) -> Option<&WorkerHandle> {
        self.handle.as_deref()
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

fn words(tokens: &[String]) -> Vec<Word> {
    tokens.iter().map(Word::new).collect()
}

/// Identity translation: source tokens with a one-to-one alignment.
fn copy_source(sentence: &Sentence) -> Translation {
    let indexes: Vec<usize> = (0..sentence.words.len()).collect();
    Translation::new(
        sentence.words.clone(),
        Some(Alignment::new(indexes.clone(), indexes)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Suggestion;

    fn en_it() -> LanguageDirection {
        LanguageDirection::new("en", "it")
    }

    #[tokio::test]
    async fn test_passthrough_copies_source() {
        let scheduler = Scheduler::new(None);
        assert!(scheduler.is_passthrough());

        let mut splits = vec![TranslationSplit::new(Sentence::from_text("hello world"))];
        scheduler.schedule(&en_it(), &mut splits).await.unwrap();

        let translation = splits[0].translation().unwrap();
        assert_eq!(translation.text(), "hello world");
        assert_eq!(translation.alignment.as_ref().map(|a| a.len()), Some(2));
    }

    #[tokio::test]
    async fn test_passthrough_prefers_top_suggestion() {
        let scheduler = Scheduler::new(None);
        let mut splits = vec![TranslationSplit::new(Sentence::from_text("hello world"))
            .with_suggestions(vec![
                Suggestion::new(en_it(), "hello world", "ciao mondo", 0.6),
                Suggestion::new(en_it(), "hello", "salve", 0.4),
            ])];

        scheduler.schedule(&en_it(), &mut splits).await.unwrap();
        assert_eq!(splits[0].translation().unwrap().text(), "ciao mondo");
    }

    #[tokio::test]
    async fn test_empty_sentence() {
        let scheduler = Scheduler::new(None);
        let mut splits = vec![TranslationSplit::new(Sentence::default())];

        scheduler.schedule(&en_it(), &mut splits).await.unwrap();
        assert!(splits[0].translation().unwrap().is_empty());
    }

    #[test]
    fn test_copy_source_alignment() {
        let t = copy_source(&Sentence::from_text("a b c"));
        let alignment = t.alignment.unwrap();
        assert_eq!(alignment.source, vec![0, 1, 2]);
        assert_eq!(alignment.target, vec![0, 1, 2]);
    }
}
