use std::fs;
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use serde_json::json;
use smartvision_contracts::events::{EventPayload, EventSink, LogLevel};
use smartvision_contracts::{
    BatchRequest, BatchStats, CommitError, CommitOutcome, CommitStrategy, DescriptionResult,
    Emitter, FatalError, ImageTask, ItemError, ParseError,
};
use uuid::Uuid;

use crate::caption::CaptionExtractor;
use crate::client::{ClientError, DescriptionClient, DescriptionRequest};
use crate::commit::{EmbedCommitter, LedgerCommitter, MetadataCommitter};
use crate::config::EngineConfig;
use crate::discovery::discover_images;
use crate::lock::{default_probe, normalize_path, HolderProbe, LockReleaser};
use crate::parser::ResponseParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Discovering,
    Processing,
    Reporting,
    Done,
    FatalAbort,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Idle => "idle",
            BatchState::Discovering => "discovering",
            BatchState::Processing => "processing",
            BatchState::Reporting => "reporting",
            BatchState::Done => "done",
            BatchState::FatalAbort => "fatal_abort",
        }
    }
}

enum StepError {
    Fatal(FatalError),
    Item(ItemError),
}

impl From<ItemError> for StepError {
    fn from(err: ItemError) -> Self {
        StepError::Item(err)
    }
}

impl From<ParseError> for StepError {
    fn from(err: ParseError) -> Self {
        StepError::Item(err.into())
    }
}

impl From<CommitError> for StepError {
    fn from(err: CommitError) -> Self {
        StepError::Item(err.into())
    }
}

/// Drives one batch: discovery, then caption, describe, parse and commit per item.
///
/// Per-item failures are counted and the loop moves on. Fatal conditions stop the batch
/// before any further item is touched and come back as the `Err` of [`run`](Self::run).
pub struct BatchOrchestrator {
    request: BatchRequest,
    config: EngineConfig,
    client: Arc<dyn DescriptionClient>,
    probe: Option<Box<dyn HolderProbe>>,
    events: Emitter,
    state: BatchState,
}

impl BatchOrchestrator {
    pub fn new(
        request: BatchRequest,
        config: EngineConfig,
        client: Arc<dyn DescriptionClient>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let batch_id = format!("batch-{}", Uuid::new_v4());
        Self {
            request,
            config,
            client,
            probe: None,
            events: Emitter::new(sink, batch_id),
            state: BatchState::Idle,
        }
    }

    /// Replaces the platform lock probe.
    pub fn with_holder_probe(mut self, probe: Box<dyn HolderProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn batch_id(&self) -> &str {
        self.events.batch_id()
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn run(&mut self) -> Result<BatchStats, FatalError> {
        let started = Instant::now();
        let started_at = Local::now();
        self.transition(BatchState::Discovering);

        let mut fields = EventPayload::new();
        fields.insert("strategy".to_string(), json!(self.request.strategy.as_str()));
        fields.insert(
            "source".to_string(),
            json!(self.request.source_directory.display().to_string()),
        );
        fields.insert(
            "destination".to_string(),
            json!(self.request.destination().display().to_string()),
        );
        self.events.log(
            LogLevel::Info,
            "batch_started",
            format!(
                "Processing images from {}",
                self.request.source_directory.display()
            ),
            fields,
        );

        if let Err(err) = self.request.validate() {
            return Err(self.abort(err));
        }
        self.warn_if_rewriting_in_place();

        let tasks = match discover_images(
            &self.request.source_directory,
            self.request.destination(),
            &self.config.extensions,
        ) {
            Ok(tasks) => tasks,
            Err(err) => {
                return Err(self.abort(FatalError::InvalidRequest {
                    reason: format!("{err:#}"),
                }))
            }
        };
        let mut fields = EventPayload::new();
        fields.insert("count".to_string(), json!(tasks.len()));
        self.events.log(
            LogLevel::Info,
            "discovery_finished",
            format!("Found {} image file(s)", tasks.len()),
            fields,
        );
        if tasks.is_empty() {
            return Err(self.abort(FatalError::EmptyDiscovery {
                dir: self.request.source_directory.clone(),
            }));
        }

        if let Err(err) = self.client.ensure_ready() {
            return Err(self.abort(err));
        }
        let mut committer = self.build_committer(started_at);
        if let Err(err) = committer.begin() {
            return Err(self.abort(err));
        }

        self.transition(BatchState::Processing);
        let extractor = CaptionExtractor::new(self.config.exiftool.clone(), self.events.clone());
        let parser = ResponseParser::new(self.request.keyword_policy);
        let mut stats = BatchStats::new(tasks.len() as u64);
        for task in &tasks {
            let outcome = match self.process_item(task, &extractor, &parser, committer.as_mut()) {
                Ok(result) => {
                    self.item_committed(task, &result, committer.strategy());
                    CommitOutcome::Success
                }
                Err(StepError::Item(err)) => {
                    self.item_failed(task, &err);
                    CommitOutcome::Failure(err.to_string())
                }
                Err(StepError::Fatal(err)) => return Err(self.abort(err)),
            };
            stats.record(&outcome);
        }

        self.transition(BatchState::Reporting);
        stats.elapsed = started.elapsed();
        let mut fields = EventPayload::new();
        fields.insert("total".to_string(), json!(stats.total));
        fields.insert("processed_count".to_string(), json!(stats.processed_count));
        fields.insert("unprocessed_count".to_string(), json!(stats.unprocessed_count));
        fields.insert("elapsed_s".to_string(), json!(stats.elapsed.as_secs_f64()));
        self.events
            .log(LogLevel::Info, "batch_finished", stats.summary_line(), fields);
        self.transition(BatchState::Done);
        Ok(stats)
    }

    fn process_item(
        &self,
        task: &ImageTask,
        extractor: &CaptionExtractor,
        parser: &ResponseParser,
        committer: &mut dyn MetadataCommitter,
    ) -> Result<DescriptionResult, StepError> {
        let caption = extractor.extract(task.source_path());
        if caption.is_none() {
            self.events.info(
                "caption_missing",
                format!(
                    "No caption found for {}. Title, description, and keywords will be generated without context.",
                    task.name()
                ),
            );
        }

        let bytes = fs::read(task.source_path()).map_err(|source| ItemError::ImageRead {
            path: task.source_path().to_path_buf(),
            source,
        })?;
        let request = DescriptionRequest {
            image_bytes: &bytes,
            prompt: &self.request.prompt,
            caption: caption.as_deref(),
        };
        let response = self.client.describe(&request).map_err(|err| match err {
            ClientError::Fatal(err) => StepError::Fatal(err),
            ClientError::Service(message) => StepError::Item(ItemError::Service(message)),
        })?;
        let result = parser.parse(&response)?;
        committer.commit(task, &result)?;
        Ok(result)
    }

    fn build_committer(&mut self, started_at: chrono::DateTime<Local>) -> Box<dyn MetadataCommitter> {
        match self.request.strategy {
            CommitStrategy::Embed => {
                let probe = self.probe.take().unwrap_or_else(default_probe);
                let releaser =
                    LockReleaser::new(probe, self.config.lock_settle, self.events.clone());
                Box::new(EmbedCommitter::new(
                    self.request.author().map(str::to_string),
                    releaser,
                    self.events.clone(),
                ))
            }
            CommitStrategy::Ledger => Box::new(LedgerCommitter::new(
                self.request.destination(),
                started_at,
                self.events.clone(),
            )),
        }
    }

    fn warn_if_rewriting_in_place(&self) {
        if self.request.strategy != CommitStrategy::Embed {
            return;
        }
        if normalize_path(&self.request.source_directory) == normalize_path(self.request.destination())
        {
            self.events.warning(
                "in_place_rewrite",
                "Source and destination folders are the same; images will be rewritten in place",
            );
        }
    }

    fn item_committed(&self, task: &ImageTask, result: &DescriptionResult, strategy: CommitStrategy) {
        let mut fields = EventPayload::new();
        fields.insert("image".to_string(), json!(task.name()));
        fields.insert("title".to_string(), json!(result.title()));
        fields.insert("strategy".to_string(), json!(strategy.as_str()));
        let message = match strategy {
            CommitStrategy::Embed => format!(
                "Metadata of {} has been successfully added: {}",
                task.name(),
                task.destination_path().display()
            ),
            CommitStrategy::Ledger => format!(
                "Image name, title, description, and keywords of {} have been written to the CSV file",
                task.name()
            ),
        };
        self.events
            .log(LogLevel::Info, "item_committed", message, fields);
    }

    fn item_failed(&self, task: &ImageTask, err: &ItemError) {
        let mut fields = EventPayload::new();
        fields.insert("image".to_string(), json!(task.name()));
        fields.insert(
            "path".to_string(),
            json!(task.source_path().display().to_string()),
        );
        fields.insert("error_kind".to_string(), json!(err.kind()));
        self.events.log(
            LogLevel::Error,
            "item_failed",
            format!("Error processing {}: {err}", task.name()),
            fields,
        );
    }

    fn abort(&mut self, err: FatalError) -> FatalError {
        self.transition(BatchState::FatalAbort);
        let mut fields = EventPayload::new();
        fields.insert("error_kind".to_string(), json!(err.kind()));
        fields.insert("exit_code".to_string(), json!(err.exit_code()));
        self.events
            .log(LogLevel::Critical, "batch_fatal", err.to_string(), fields);
        err
    }

    fn transition(&mut self, next: BatchState) {
        let previous = self.state;
        self.state = next;
        let mut fields = EventPayload::new();
        fields.insert("from".to_string(), json!(previous.as_str()));
        fields.insert("to".to_string(), json!(next.as_str()));
        self.events.log(
            LogLevel::Debug,
            "state_changed",
            format!("{} -> {}", previous.as_str(), next.as_str()),
            fields,
        );
    }
}
