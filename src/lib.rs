//! Screenshot catalog core: media scanning, a SQLite catalog with
//! collections, the OCR/description/LLM analysis pipeline and model
//! downloads. The ML engines and any UI stay outside and plug in through the
//! traits in [`ml`], [`llm`] and [`events`].

pub mod app;
pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod llm;
pub mod ml;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod scanner;

pub use app::App;
pub use catalog::{AnalysisStatus, Catalog, Collection, ImageRecord};
pub use config::Config;
pub use download::{DownloadManager, DownloadState, DownloadStatus};
pub use error::{Error, Result};
pub use events::{ChannelSink, EventSink, PipelineEvent, TracingSink};
pub use llm::{LlmBackend, LlmEngine, LlmSession};
pub use ml::{Description, ImageDescriber, TextRecognizer};
pub use models::{ModelDescriptor, ModelRegistry};
pub use pipeline::{AnalysisMode, AnalysisOutcome, AnalysisPipeline, AnalysisState, BatchReport};
pub use prompt::StructuredAnalysis;
pub use scanner::{scan, DirectoryMediaIndex, MediaIndex, MediaItem, ScanReport};
