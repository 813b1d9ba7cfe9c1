use std::{path::Path, sync::Arc};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::config::Config;
use crate::download::DownloadManager;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::llm::{LlmBackend, LlmEngine, LlmSession, OpenAiCompatibleBackend};
use crate::ml::{ImageDescriber, TextRecognizer};
use crate::models::{ModelDescriptor, ModelRegistry};
use crate::pipeline::{AnalysisPipeline, BatchReport};
use crate::scanner::{scan, DirectoryMediaIndex, MediaIndex, ScanReport};

/// Backend used when no inference server is configured.
struct NoBackend;

impl LlmBackend for NoBackend {
    fn load(&self, _model: &ModelDescriptor, _weights: &Path) -> Result<Box<dyn LlmEngine>> {
        Err(Error::CapabilityUnavailable(format!(
            "local LLM server (set {})",
            crate::config::ENV_LLM_URL
        )))
    }
}

#[cfg(feature = "tesseract")]
pub fn default_recognizer() -> Arc<dyn TextRecognizer> {
    Arc::new(crate::ml::TesseractRecognizer::default())
}

#[cfg(not(feature = "tesseract"))]
pub fn default_recognizer() -> Arc<dyn TextRecognizer> {
    Arc::new(crate::ml::UnavailableRecognizer)
}

/// The wired-up core: catalog, models and the LLM session.
///
/// No captioning engine ships with the crate. Embedders that have one attach
/// it with [`App::with_describer`]; without it the pipeline works from OCR
/// text alone.
pub struct App {
    pub config: Config,
    pub catalog: Arc<Catalog>,
    pub registry: ModelRegistry,
    pub llm: Arc<LlmSession>,
    describer: Option<Arc<dyn ImageDescriber>>,
}

impl App {
    pub fn open(config: Config) -> Result<Self> {
        let catalog = Arc::new(Catalog::open(&config.db_path)?);
        let registry = config.registry();

        let backend: Arc<dyn LlmBackend> = match &config.llm_server_url {
            Some(url) => Arc::new(OpenAiCompatibleBackend::new(url.clone(), None)?),
            None => Arc::new(NoBackend),
        };

        Ok(Self {
            catalog,
            registry,
            llm: Arc::new(LlmSession::new(backend)),
            config,
            describer: None,
        })
    }

    pub fn with_describer(mut self, describer: Arc<dyn ImageDescriber>) -> Self {
        self.describer = Some(describer);
        self
    }

    pub fn download_manager(&self) -> Result<DownloadManager> {
        Ok(DownloadManager::new(&self.config.models_dir)?
            .with_auth_token(self.config.auth_token.clone()))
    }

    pub fn media_index(&self) -> DirectoryMediaIndex {
        DirectoryMediaIndex::new(self.config.screenshot_dirs.clone())
    }

    /// The model the LLM stage should use: the preferred one if downloaded,
    /// otherwise any downloaded model.
    pub fn active_model(&self) -> Option<&ModelDescriptor> {
        self.config
            .preferred_model
            .as_deref()
            .and_then(|name| self.registry.find(name))
            .filter(|model| self.registry.is_downloaded(model))
            .or_else(|| self.registry.first_downloaded())
    }

    /// Loads the active model if there is one. `Ok(false)` means analysis
    /// will produce fallback results.
    pub async fn prepare_llm(&self) -> Result<bool> {
        let Some(model) = self.active_model().cloned() else {
            info!("no model downloaded, analysis will use OCR text only");
            return Ok(false);
        };
        let weights = self.registry.path_for(&model);
        let llm = Arc::clone(&self.llm);
        let loaded = tokio::task::spawn_blocking(move || llm.initialize(&model, &weights))
            .await
            .map_err(|error| Error::Inference(format!("model load task failed: {error}")))?;

        match loaded {
            Ok(()) => Ok(true),
            Err(Error::CapabilityUnavailable(what)) => {
                warn!("{what} is not available, analysis will use OCR text only");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    /// Startup pass: scans the configured directories, loads the model if
    /// one is downloaded, then analyzes everything still waiting, including
    /// records left over from earlier runs.
    pub async fn catch_up(&self, pipeline: &AnalysisPipeline) -> Result<(ScanReport, BatchReport)> {
        self.catch_up_from(&self.media_index(), pipeline).await
    }

    async fn catch_up_from(
        &self,
        index: &dyn MediaIndex,
        pipeline: &AnalysisPipeline,
    ) -> Result<(ScanReport, BatchReport)> {
        let scanned = scan(index, &self.catalog)?;
        if !self.prepare_llm().await? {
            info!("analysis will store raw text until a model is available");
        }
        let analyzed = pipeline.run_pending().await?;
        Ok((scanned, analyzed))
    }

    pub fn pipeline(&self, events: Arc<dyn EventSink>) -> AnalysisPipeline {
        let pipeline = AnalysisPipeline::new(
            Arc::clone(&self.catalog),
            default_recognizer(),
            Arc::clone(&self.llm),
        )
        .with_events(events)
        .with_options(self.config.pipeline.clone());
        match &self.describer {
            Some(describer) => pipeline.with_describer(Arc::clone(describer)),
            None => pipeline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingSink;
    use crate::ml::Description;
    use crate::pipeline::AnalysisState;

    struct FixedCaption;

    impl ImageDescriber for FixedCaption {
        fn describe(&self, _image: &Path) -> Result<Description> {
            Ok(Description::Caption("A parking ticket on a windshield".to_string()))
        }
    }

    struct NothingNew;

    impl MediaIndex for NothingNew {
        fn screenshots(&self) -> Result<Vec<crate::scanner::MediaItem>> {
            Ok(Vec::new())
        }
    }

    fn test_config(home: &Path) -> Config {
        let mut config = Config::defaults(home);
        config.db_path = home.join("catalog.db");
        config.models_dir = home.join("models");
        config
    }

    #[tokio::test]
    async fn attached_describer_feeds_the_pipeline() {
        let home = tempfile::tempdir().expect("tempdir");
        let app = App::open(test_config(home.path()))
            .expect("open")
            .with_describer(Arc::new(FixedCaption));
        app.catalog
            .insert_if_absent("/shots/ticket.png", 1)
            .expect("insert");

        assert!(!app.prepare_llm().await.expect("prepare"));
        let outcome = app
            .pipeline(Arc::new(TracingSink))
            .reanalyze("/shots/ticket.png")
            .await
            .expect("analyze");
        assert_eq!(outcome.state, AnalysisState::Fallback);

        let record = app
            .catalog
            .get("/shots/ticket.png")
            .expect("get")
            .expect("record");
        assert_eq!(
            record.content.as_deref(),
            Some("A parking ticket on a windshield")
        );
    }

    #[tokio::test]
    async fn catch_up_retries_records_left_pending() {
        let home = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(home.path());
        config.pipeline.cooldown = std::time::Duration::ZERO;
        let app = App::open(config)
            .expect("open")
            .with_describer(Arc::new(FixedCaption));
        app.catalog
            .insert_if_absent("/shots/earlier.png", 1)
            .expect("insert");

        let pipeline = app.pipeline(Arc::new(TracingSink));
        let (scanned, analyzed) = app
            .catch_up_from(&NothingNew, &pipeline)
            .await
            .expect("catch up");

        assert_eq!(scanned.inserted, 0);
        assert_eq!(analyzed.total, 1);
        assert_eq!(analyzed.fallback, 1);
        assert!(app.catalog.list_unanalyzed(false).expect("pending").is_empty());
    }
}
