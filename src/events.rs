//! Progress reporting toward whatever presents the catalog.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::pipeline::AnalysisState;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnalysisStatusEvent {
    pub uri: String,
    pub state: AnalysisState,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub percent: f64,
    pub eta_seconds: u64,
    pub in_progress: bool,
}

impl BatchProgress {
    pub fn started(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            percent: if total == 0 { 100.0 } else { 0.0 },
            eta_seconds: 0,
            in_progress: total > 0,
        }
    }

    /// Progress after `completed` units took `elapsed` in total; the ETA
    /// assumes the remaining units take the running average.
    pub fn after(total: usize, completed: usize, elapsed: Duration) -> Self {
        if total == 0 {
            return Self::started(0);
        }
        let average = if completed == 0 {
            0.0
        } else {
            elapsed.as_secs_f64() / completed as f64
        };
        let remaining = total.saturating_sub(completed) as f64;
        Self {
            total,
            completed,
            percent: (completed as f64 / total as f64) * 100.0,
            eta_seconds: (average * remaining).round() as u64,
            in_progress: completed < total,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PipelineEvent {
    AnalysisStatus(AnalysisStatusEvent),
    BatchProgress(BatchProgress),
    /// A capability needed by a stage is being fetched.
    CapabilityDownloading { capability: String },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::AnalysisStatus(status) => match status.error {
                Some(error) => warn!("{} -> {:?}: {error}", status.uri, status.state),
                None => info!("{} -> {:?}", status.uri, status.state),
            },
            PipelineEvent::BatchProgress(progress) => info!(
                "batch {}/{} ({:.0}%), eta {}s",
                progress.completed, progress.total, progress.percent, progress.eta_seconds
            ),
            PipelineEvent::CapabilityDownloading { capability } => {
                info!("{capability} is downloading, retry later")
            }
        }
    }
}

/// Forwards events to a channel; a dropped receiver is tolerated.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_uses_running_average() {
        let progress = BatchProgress::after(10, 4, Duration::from_secs(8));
        assert_eq!(progress.eta_seconds, 12);
        assert!((progress.percent - 40.0).abs() < f64::EPSILON);
        assert!(progress.in_progress);

        let done = BatchProgress::after(10, 10, Duration::from_secs(20));
        assert_eq!(done.eta_seconds, 0);
        assert!(!done.in_progress);
    }

    #[test]
    fn empty_batch_is_complete() {
        let progress = BatchProgress::started(0);
        assert!(!progress.in_progress);
        assert_eq!(progress.percent, 100.0);
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(PipelineEvent::BatchProgress(BatchProgress::started(1)));
    }

    #[test]
    fn events_serialize_with_kebab_tags() {
        let value = serde_json::to_value(PipelineEvent::BatchProgress(BatchProgress::started(2)))
            .expect("json");
        assert_eq!(value["event"], "batch-progress");
        assert_eq!(value["total"], 2);
    }
}
