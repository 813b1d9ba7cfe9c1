//! Streaming download of model weights.
//!
//! Each attempt writes to its own `.part` file that is renamed into place
//! only when complete. Re-issuing a download for a model aborts the attempt
//! in flight; the new one starts again from byte zero.

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};
use tokio::{fs, io::AsyncWriteExt, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::ModelDescriptor;

const MIN_REPORT_STEP: u64 = 256 * 1024;
const UNKNOWN_TOTAL_REPORT_STEP: u64 = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum DownloadState {
    NotStarted,
    InProgress,
    Succeeded,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DownloadStatus {
    pub model: String,
    pub attempt: u64,
    pub received: u64,
    pub total: Option<u64>,
    pub state: DownloadState,
}

impl DownloadStatus {
    pub fn not_started(model: &str) -> Self {
        Self {
            model: model.to_string(),
            attempt: 0,
            received: 0,
            total: None,
            state: DownloadState::NotStarted,
        }
    }

    pub fn fraction(&self) -> Option<f64> {
        self.total
            .filter(|total| *total > 0)
            .map(|total| (self.received as f64 / total as f64).min(1.0))
    }
}

pub type ProgressObserver = Arc<dyn Fn(&DownloadStatus) + Send + Sync>;

type SharedMap<T> = Arc<Mutex<HashMap<String, T>>>;

fn lock<T>(map: &Mutex<T>) -> MutexGuard<'_, T> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decides when received-byte progress is worth publishing.
#[derive(Debug)]
pub(crate) struct ProgressThrottle {
    interval: Duration,
    step: u64,
    last_at: Instant,
    last_received: u64,
}

impl ProgressThrottle {
    pub(crate) fn new(interval: Duration, total: Option<u64>) -> Self {
        let step = match total {
            Some(total) => (total / 100).max(MIN_REPORT_STEP),
            None => UNKNOWN_TOTAL_REPORT_STEP,
        };
        Self {
            interval,
            step,
            last_at: Instant::now(),
            last_received: 0,
        }
    }

    pub(crate) fn should_report(&mut self, received: u64) -> bool {
        let due = self.interval.is_zero()
            || self.last_at.elapsed() >= self.interval
            || received.saturating_sub(self.last_received) >= self.step;
        if due {
            self.last_at = Instant::now();
            self.last_received = received;
        }
        due
    }
}

/// Removes an unfinished `.part` file when the attempt fails or is aborted.
struct PartFile {
    path: PathBuf,
    armed: bool,
}

impl PartFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(error) = std::fs::remove_file(&self.path) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove {}: {error}", self.path.display());
                }
            }
        }
    }
}

struct ActiveDownload {
    attempt: u64,
    task: tokio::task::AbortHandle,
}

pub struct DownloadHandle {
    model: String,
    attempt: u64,
    task: JoinHandle<Result<PathBuf>>,
}

impl DownloadHandle {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Resolves to the final file path, or [`Error::Cancelled`] when the
    /// attempt was replaced or cancelled.
    pub async fn wait(self) -> Result<PathBuf> {
        match self.task.await {
            Ok(result) => result,
            Err(error) if error.is_cancelled() => Err(Error::Cancelled),
            Err(error) => Err(Error::Io(std::io::Error::other(error))),
        }
    }
}

pub struct DownloadManager {
    client: Client,
    models_dir: PathBuf,
    auth_token: Option<String>,
    progress_interval: Duration,
    observer: Option<ProgressObserver>,
    statuses: SharedMap<DownloadStatus>,
    active: SharedMap<ActiveDownload>,
    next_attempt: AtomicU64,
}

impl DownloadManager {
    pub fn new(models_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            models_dir: models_dir.into(),
            auth_token: None,
            progress_interval: Duration::from_millis(500),
            observer: None,
            statuses: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(Mutex::new(HashMap::new())),
            next_attempt: AtomicU64::new(0),
        })
    }

    /// Bearer token for hosts that gate model files.
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn status(&self, model: &str) -> DownloadStatus {
        lock(&self.statuses)
            .get(model)
            .cloned()
            .unwrap_or_else(|| DownloadStatus::not_started(model))
    }

    pub fn is_active(&self, model: &str) -> bool {
        lock(&self.active).contains_key(model)
    }

    /// Starts downloading `model`, replacing any attempt already running for
    /// it. Must be called from within a tokio runtime.
    pub fn start(&self, model: &ModelDescriptor) -> DownloadHandle {
        let mut active = lock(&self.active);
        // Numbered under the lock so the attempt registered last is also the
        // newest one.
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(previous) = active.remove(&model.name) {
            info!(
                "restarting download of {} (attempt {} replaces {})",
                model.name, attempt, previous.attempt
            );
            previous.task.abort();
        }

        let job = DownloadJob {
            client: self.client.clone(),
            url: model.url.clone(),
            auth_token: self.auth_token.clone(),
            model: model.name.clone(),
            target: self.models_dir.join(&model.file_name),
            part: self
                .models_dir
                .join(format!("{}.{attempt}.part", model.file_name)),
            expected_size: model.expected_size,
            attempt,
            progress_interval: self.progress_interval,
            observer: self.observer.clone(),
            statuses: Arc::clone(&self.statuses),
            active: Arc::clone(&self.active),
        };
        job.publish(0, model.expected_size, DownloadState::InProgress);

        let task = tokio::spawn(job.run());
        active.insert(
            model.name.clone(),
            ActiveDownload {
                attempt,
                task: task.abort_handle(),
            },
        );

        DownloadHandle {
            model: model.name.clone(),
            attempt,
            task,
        }
    }

    /// Starts a download and waits for it.
    pub async fn download(&self, model: &ModelDescriptor) -> Result<PathBuf> {
        self.start(model).wait().await
    }

    /// Aborts the attempt in flight for `model`, if any.
    pub fn cancel(&self, model: &str) -> bool {
        let Some(previous) = lock(&self.active).remove(model) else {
            return false;
        };
        previous.task.abort();

        let cancelled = {
            let mut statuses = lock(&self.statuses);
            statuses
                .get_mut(model)
                .filter(|status| status.attempt == previous.attempt)
                .map(|status| {
                    status.state = DownloadState::Failed("cancelled".to_string());
                    status.clone()
                })
        };
        if let (Some(status), Some(observer)) = (cancelled, &self.observer) {
            observer(&status);
        }
        info!("cancelled download of {model}");
        true
    }
}

struct DownloadJob {
    client: Client,
    url: String,
    auth_token: Option<String>,
    model: String,
    target: PathBuf,
    part: PathBuf,
    expected_size: Option<u64>,
    attempt: u64,
    progress_interval: Duration,
    observer: Option<ProgressObserver>,
    statuses: SharedMap<DownloadStatus>,
    active: SharedMap<ActiveDownload>,
}

impl DownloadJob {
    /// Only the newest attempt for a model may write its status.
    fn publish(&self, received: u64, total: Option<u64>, state: DownloadState) {
        let status = DownloadStatus {
            model: self.model.clone(),
            attempt: self.attempt,
            received,
            total,
            state,
        };
        {
            let mut statuses = lock(&self.statuses);
            if let Some(current) = statuses.get(&self.model) {
                if current.attempt > self.attempt {
                    return;
                }
            }
            statuses.insert(self.model.clone(), status.clone());
        }
        if let Some(observer) = &self.observer {
            observer(&status);
        }
    }

    async fn run(self) -> Result<PathBuf> {
        let result = self.transfer().await;
        if let Err(error) = &result {
            warn!("download of {} failed: {error}", self.model);
            let last = lock(&self.statuses)
                .get(&self.model)
                .filter(|status| status.attempt == self.attempt)
                .map(|status| (status.received, status.total));
            let (received, total) = last.unwrap_or((0, self.expected_size));
            self.publish(received, total, DownloadState::Failed(error.to_string()));
        }

        let mut active = lock(&self.active);
        if active
            .get(&self.model)
            .map(|entry| entry.attempt == self.attempt)
            .unwrap_or(false)
        {
            active.remove(&self.model);
        }
        result
    }

    async fn transfer(&self) -> Result<PathBuf> {
        if let Some(parent) = self.target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::PermissionDenied(format!(
                "HTTP {status} for {}; check the access token",
                self.url
            )));
        }
        let resp = resp.error_for_status()?;

        let content_length = resp.content_length();
        let total = content_length.or(self.expected_size);
        info!(
            "downloading {} ({} bytes) to {}",
            self.model,
            total.map(|t| t.to_string()).unwrap_or_else(|| "?".to_string()),
            self.target.display()
        );

        let mut part = PartFile::new(self.part.clone());
        let mut file = fs::File::create(&self.part).await?;
        let mut throttle = ProgressThrottle::new(self.progress_interval, total);
        let mut received = 0u64;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if throttle.should_report(received) {
                self.publish(received, total, DownloadState::InProgress);
            }
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = content_length {
            if received != expected {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("received {received} of {expected} bytes"),
                )));
            }
        }

        fs::rename(&self.part, &self.target).await?;
        part.disarm();
        debug!("{} complete after {received} bytes", self.model);
        self.publish(received, Some(received), DownloadState::Succeeded);
        Ok(self.target.clone())
    }
}
