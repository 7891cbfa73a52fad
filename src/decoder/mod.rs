//! Neural decoder facade.
//!
//! Owns the pool and the scheduler for one engine, checks the requested
//! direction against the configured checkpoints and caps the number of
//! suggestions forwarded to the workers.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::config::DecoderConfig;
use crate::error::{DecoderError, Result};
use crate::model::{LanguageDirection, Sentence, Suggestion, Translation};
use crate::pool::{AvailabilityListener, DecoderPool};
use crate::process::ProcessLauncher;
use crate::scheduler::{Scheduler, TranslationSplit};

/// Entry point for translating sentences with a pool of decoder workers.
pub struct NeuralDecoder {
    pool: Option<Arc<DecoderPool>>,
    scheduler: Scheduler,
    directions: HashSet<LanguageDirection>,
    suggestions_limit: usize,
    echo: bool,
}

impl NeuralDecoder {
    /// Validates `config` and brings up the pool. In echo mode no worker is
    /// started and every split is answered by pass-through.
    ///
    /// # Errors
    ///
    /// Configuration errors, or [`DecoderError::Initialization`] if the
    /// pool could not start.
    pub async fn new(config: &DecoderConfig, launcher: Arc<dyn ProcessLauncher>) -> Result<Self> {
        config.validate()?;
        let checkpoints = config.checkpoint_map()?;
        let directions = checkpoints.keys().cloned().collect();

        let pool = if config.echo {
            info!("Echo mode: decoder workers disabled");
            None
        } else {
            Some(Arc::new(
                DecoderPool::initialize(config, launcher, checkpoints).await?,
            ))
        };

        Ok(Self::from_parts(pool, directions, config.suggestions_limit, config.echo))
    }

    /// Assembles a decoder around an existing pool.
    pub fn from_parts(
        pool: Option<Arc<DecoderPool>>,
        directions: HashSet<LanguageDirection>,
        suggestions_limit: usize,
        echo: bool,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(pool.clone()),
            pool,
            directions,
            suggestions_limit,
            echo,
        }
    }

    /// Directions with a configured checkpoint.
    pub fn directions(&self) -> &HashSet<LanguageDirection> {
        &self.directions
    }

    /// Echo mode without checkpoints accepts any direction.
    pub fn supports(&self, direction: &LanguageDirection) -> bool {
        self.directions.contains(direction) || (self.echo && self.directions.is_empty())
    }

    /// `(alive, capacity)` of the pool; `None` without one.
    pub fn availability(&self) -> Option<(usize, usize)> {
        self.pool
            .as_ref()
            .map(|pool| (pool.availability(), pool.capacity()))
    }

    pub fn set_availability_listener(&self, listener: Arc<dyn AvailabilityListener>) {
        if let Some(pool) = &self.pool {
            pool.set_availability_listener(listener);
        }
    }

    /// Translates one sentence.
    pub async fn translate(
        &self,
        direction: &LanguageDirection,
        sentence: Sentence,
        suggestions: Vec<Suggestion>,
    ) -> Result<Translation> {
        let mut splits = [TranslationSplit::new(sentence).with_suggestions(suggestions)];
        self.translate_splits(direction, &mut splits).await?;

        let [mut split] = splits;
        split
            .take_output()
            .unwrap_or_else(|| Ok(Translation::empty()))
    }

    /// Translates a batch of splits on one worker.
    pub async fn translate_splits(
        &self,
        direction: &LanguageDirection,
        splits: &mut [TranslationSplit],
    ) -> Result<()> {
        if !self.supports(direction) {
            return Err(DecoderError::UnsupportedDirection(direction.clone()));
        }

        for split in splits.iter_mut() {
            split.suggestions.truncate(self.suggestions_limit);
        }

        self.scheduler.schedule(direction, splits).await
    }

    /// Shuts the pool down.
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Device;
    use crate::process::DecoderProcess;
    use async_trait::async_trait;

    struct NoLauncher;

    #[async_trait]
    impl ProcessLauncher for NoLauncher {
        async fn launch(&self, device: Device) -> Result<Box<dyn DecoderProcess>> {
            Err(DecoderError::WorkerUnavailable(format!("cannot start on {}", device)))
        }
    }

    fn en_it() -> LanguageDirection {
        LanguageDirection::new("en", "it")
    }

    #[tokio::test]
    async fn test_echo_mode_needs_no_workers() {
        let config = DecoderConfig::cpu(0).with_echo(true);
        let decoder = NeuralDecoder::new(&config, Arc::new(NoLauncher)).await.unwrap();

        assert!(decoder.availability().is_none());
        let out = decoder
            .translate(&en_it(), Sentence::from_text("hello"), Vec::new())
            .await
            .unwrap();
        assert_eq!(out.text(), "hello");
        decoder.close().await;
    }

    #[tokio::test]
    async fn test_unsupported_direction() {
        let mut directions = HashSet::new();
        directions.insert(en_it());
        let decoder = NeuralDecoder::from_parts(None, directions, 4, false);

        let err = decoder
            .translate(
                &LanguageDirection::new("en", "de"),
                Sentence::from_text("hello"),
                Vec::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DecoderError::UnsupportedDirection(_)));
    }

    #[tokio::test]
    async fn test_suggestions_truncated() {
        let mut directions = HashSet::new();
        directions.insert(en_it());
        let decoder = NeuralDecoder::from_parts(None, directions, 1, false);

        let mut splits = [TranslationSplit::new(Sentence::from_text("hello"))
            .with_suggestions(vec![
                Suggestion::new(en_it(), "hello", "ciao", 0.9),
                Suggestion::new(en_it(), "hello", "salve", 0.5),
            ])];
        decoder.translate_splits(&en_it(), &mut splits).await.unwrap();

        assert_eq!(splits[0].suggestions.len(), 1);
        assert_eq!(splits[0].translation().unwrap().text(), "ciao");
    }

    #[tokio::test]
    async fn test_initialization_failure_propagates() {
        let config = DecoderConfig::cpu(2);
        let result = NeuralDecoder::new(&config, Arc::new(NoLauncher)).await;
        assert!(matches!(result, Err(DecoderError::Initialization(_))));
    }
}
