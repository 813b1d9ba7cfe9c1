//! Per-screenshot analysis: OCR and description, then LLM structuring, then
//! a write back to the catalog. Batches run a few records at a time with a
//! cooldown in between so the device is not saturated.

use futures::stream::{FuturesUnordered, StreamExt};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, ImageRecord};
use crate::error::{Error, Result};
use crate::events::{AnalysisStatusEvent, BatchProgress, EventSink, PipelineEvent, TracingSink};
use crate::llm::LlmSession;
use crate::ml::{Description, ImageDescriber, TextRecognizer};
use crate::prompt::{
    fallback_content, multimodal_prompt, parse_structured, sanitize_ocr_text, structuring_prompt,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisState {
    Scanned,
    OcrPending,
    Describing,
    LlmPending,
    Structured,
    Fallback,
    Failed,
}

impl AnalysisState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AnalysisState::Structured | AnalysisState::Fallback | AnalysisState::Failed
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    /// OCR text and caption are structured by the LLM.
    #[default]
    Smart,
    /// The image goes to the LLM directly. Needs a multimodal model; without
    /// one the smart route is used.
    Multimodal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub batch_size: usize,
    #[serde(with = "millis")]
    pub cooldown: Duration,
    pub mode: AnalysisMode,
    /// Longest edge of images handed to a multimodal model.
    pub max_image_edge: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_size: 5,
            cooldown: Duration::from_secs(2),
            mode: AnalysisMode::Smart,
            max_image_edge: 1024,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnalysisOutcome {
    pub uri: String,
    pub state: AnalysisState,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub structured: usize,
    pub fallback: usize,
    pub failed: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: &AnalysisOutcome) {
        match outcome.state {
            AnalysisState::Structured => self.structured += 1,
            AnalysisState::Fallback => self.fallback += 1,
            _ => self.failed += 1,
        }
    }
}

/// Maps a catalog URI to the location handed to the ML collaborators.
pub fn image_path(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}

fn join_failed(error: task::JoinError) -> Error {
    Error::Inference(format!("analysis task failed: {error}"))
}

fn load_for_model(path: &Path, max_edge: u32) -> Result<DynamicImage> {
    let image = image::open(path)?;
    if image.width() > max_edge || image.height() > max_edge {
        Ok(image.thumbnail(max_edge, max_edge))
    } else {
        Ok(image)
    }
}

pub struct AnalysisPipeline {
    catalog: Arc<Catalog>,
    recognizer: Arc<dyn TextRecognizer>,
    describer: Option<Arc<dyn ImageDescriber>>,
    llm: Arc<LlmSession>,
    events: Arc<dyn EventSink>,
    options: PipelineOptions,
}

impl AnalysisPipeline {
    pub fn new(
        catalog: Arc<Catalog>,
        recognizer: Arc<dyn TextRecognizer>,
        llm: Arc<LlmSession>,
    ) -> Self {
        Self {
            catalog,
            recognizer,
            describer: None,
            llm,
            events: Arc::new(TracingSink),
            options: PipelineOptions::default(),
        }
    }

    pub fn with_describer(mut self, describer: Arc<dyn ImageDescriber>) -> Self {
        self.describer = Some(describer);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    fn emit_state(&self, uri: &str, state: AnalysisState, error: Option<String>) {
        self.events
            .emit(PipelineEvent::AnalysisStatus(AnalysisStatusEvent {
                uri: uri.to_string(),
                state,
                error,
            }));
    }

    /// Runs one analysis pass. Failures are reported in the outcome and never
    /// touch the record.
    pub async fn analyze_record(&self, record: &ImageRecord) -> AnalysisOutcome {
        let uri = record.uri.as_str();
        self.emit_state(uri, AnalysisState::Scanned, None);

        match self.run_stages(uri).await {
            Ok(state) => {
                self.emit_state(uri, state, None);
                AnalysisOutcome {
                    uri: uri.to_string(),
                    state,
                    error: None,
                }
            }
            Err(error) => {
                warn!("analysis failed for {uri}: {error}");
                let message = error.to_string();
                self.emit_state(uri, AnalysisState::Failed, Some(message.clone()));
                AnalysisOutcome {
                    uri: uri.to_string(),
                    state: AnalysisState::Failed,
                    error: Some(message),
                }
            }
        }
    }

    /// Analyzes one catalog entry whatever its current status.
    pub async fn reanalyze(&self, uri: &str) -> Result<AnalysisOutcome> {
        let record = self
            .catalog
            .get(uri)?
            .ok_or_else(|| Error::NotFound(format!("image {uri}")))?;
        Ok(self.analyze_record(&record).await)
    }

    /// Processes every unanalyzed record. Fallback results are retried when
    /// an LLM is ready to upgrade them.
    pub async fn run_pending(&self) -> Result<BatchReport> {
        let pending = self.catalog.list_unanalyzed(self.llm.is_ready())?;
        info!("{} screenshots waiting for analysis", pending.len());
        Ok(self.run_batch(pending).await)
    }

    pub async fn run_batch(&self, records: Vec<ImageRecord>) -> BatchReport {
        let total = records.len();
        let mut report = BatchReport {
            total,
            ..BatchReport::default()
        };
        self.events
            .emit(PipelineEvent::BatchProgress(BatchProgress::started(total)));
        if total == 0 {
            return report;
        }

        let started = Instant::now();
        let mut completed = 0usize;
        for (index, chunk) in records.chunks(self.options.batch_size.max(1)).enumerate() {
            if index > 0 && !self.options.cooldown.is_zero() {
                debug!("cooling down for {:?}", self.options.cooldown);
                tokio::time::sleep(self.options.cooldown).await;
            }

            let mut in_flight: FuturesUnordered<_> =
                chunk.iter().map(|record| self.analyze_record(record)).collect();
            while let Some(outcome) = in_flight.next().await {
                report.record(&outcome);
                completed += 1;
                self.events.emit(PipelineEvent::BatchProgress(BatchProgress::after(
                    total,
                    completed,
                    started.elapsed(),
                )));
            }
        }

        info!(
            "batch done: {} structured, {} fallback, {} failed",
            report.structured, report.fallback, report.failed
        );
        report
    }

    async fn run_stages(&self, uri: &str) -> Result<AnalysisState> {
        let path = image_path(uri);

        if self.options.mode == AnalysisMode::Multimodal && self.llm.accepts_images() {
            self.emit_state(uri, AnalysisState::LlmPending, None);
            let max_edge = self.options.max_image_edge;
            let image = task::spawn_blocking(move || load_for_model(&path, max_edge))
                .await
                .map_err(join_failed)??;
            let reply = self.generate(multimodal_prompt(), vec![image]).await?;
            let analysis = parse_structured(&reply)?;
            self.catalog.apply_structured(uri, &analysis)?;
            return Ok(AnalysisState::Structured);
        }

        let (text, caption) = self.extract(uri, path).await?;
        if text.is_none() && caption.is_none() {
            return Err(Error::Inference(
                "no text or description could be extracted".to_string(),
            ));
        }

        if self.llm.is_ready() {
            self.emit_state(uri, AnalysisState::LlmPending, None);
            let prompt = structuring_prompt(text.as_deref(), caption.as_deref());
            match self.generate(prompt, Vec::new()).await {
                Ok(reply) => {
                    let analysis = parse_structured(&reply)?;
                    self.catalog.apply_structured(uri, &analysis)?;
                    return Ok(AnalysisState::Structured);
                }
                Err(Error::CapabilityUnavailable(what)) => {
                    debug!("{what} went away mid-pass, keeping raw text for {uri}");
                }
                Err(error) => return Err(error),
            }
        }

        let content = fallback_content(text.as_deref(), caption.as_deref()).unwrap_or_default();
        if !self.catalog.apply_fallback(uri, &content)? {
            debug!("{uri} already has a structured result, fallback text not stored");
        }
        Ok(AnalysisState::Fallback)
    }

    /// OCR and description run side by side; both must finish before the
    /// LLM stage.
    async fn extract(&self, uri: &str, path: PathBuf) -> Result<(Option<String>, Option<String>)> {
        self.emit_state(uri, AnalysisState::OcrPending, None);
        let recognizer = Arc::clone(&self.recognizer);
        let ocr_path = path.clone();
        let ocr = task::spawn_blocking(move || recognizer.recognize(&ocr_path));

        let describer = self.describer.as_ref().map(Arc::clone);
        let describe = async move {
            let Some(describer) = describer else {
                return Ok(None);
            };
            self.emit_state(uri, AnalysisState::Describing, None);
            match task::spawn_blocking(move || describer.describe(&path)).await {
                Ok(result) => result.map(Some),
                Err(error) => Err(join_failed(error)),
            }
        };

        let (ocr, description) = tokio::join!(ocr, describe);

        let raw_text = ocr.map_err(join_failed)?;
        let text = sanitize_ocr_text(&raw_text);
        if text.is_none() && !raw_text.trim().is_empty() {
            debug!("discarding OCR output for {uri}: {}", raw_text.trim());
        }

        let caption = match description {
            Ok(Some(Description::Caption(caption))) => {
                Some(caption.trim().to_string()).filter(|c| !c.is_empty())
            }
            Ok(Some(Description::Downloading)) => {
                self.events.emit(PipelineEvent::CapabilityDownloading {
                    capability: "image description".to_string(),
                });
                None
            }
            Ok(None) => None,
            Err(Error::CapabilityUnavailable(what)) => {
                debug!("{what} unavailable for {uri}");
                None
            }
            Err(error) => return Err(error),
        };

        Ok((text, caption))
    }

    async fn generate(&self, prompt: String, images: Vec<DynamicImage>) -> Result<String> {
        let llm = Arc::clone(&self.llm);
        task::spawn_blocking(move || llm.generate_fresh(&prompt, &images))
            .await
            .map_err(join_failed)?
    }
}
