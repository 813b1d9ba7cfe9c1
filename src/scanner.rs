use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde::Serialize;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread,
    time::{Duration, Instant, UNIX_EPOCH},
};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::error::{Error, Result};

const DEBOUNCE: Duration = Duration::from_millis(750);
const SCREENSHOT_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaItem {
    pub uri: String,
    /// Milliseconds since the epoch.
    pub last_modified: i64,
}

/// The device's media index: whatever can enumerate stored screenshots.
pub trait MediaIndex: Send + Sync {
    fn screenshots(&self) -> Result<Vec<MediaItem>>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub discovered: usize,
    pub inserted: usize,
}

/// Adds one unanalyzed record per screenshot the catalog has not seen.
/// Known URIs are untouched, so ignored records stay ignored. An unreachable
/// index is not an error; the scan just finds nothing.
pub fn scan(index: &dyn MediaIndex, catalog: &Catalog) -> Result<ScanReport> {
    let items = match index.screenshots() {
        Ok(items) => items,
        Err(error) => {
            warn!("media index unavailable, nothing scanned: {error}");
            return Ok(ScanReport::default());
        }
    };

    let mut report = ScanReport {
        discovered: items.len(),
        inserted: 0,
    };
    for item in items {
        if catalog.insert_if_absent(&item.uri, item.last_modified)? {
            debug!("new screenshot {}", item.uri);
            report.inserted += 1;
        }
    }
    info!(
        "scan found {} screenshots, {} new",
        report.discovered, report.inserted
    );
    Ok(report)
}

/// Usual screenshot folders under `home`.
pub fn default_screenshot_dirs(home: &Path) -> Vec<PathBuf> {
    vec![
        home.join("Pictures").join("Screenshots"),
        home.join("DCIM").join("Screenshots"),
        home.join("Desktop"),
    ]
}

fn is_screenshot_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SCREENSHOT_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn file_modified_millis(path: &Path) -> i64 {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn media_item(path: &Path) -> Option<MediaItem> {
    let uri = path.to_str()?.to_string();
    Some(MediaItem {
        uri,
        last_modified: file_modified_millis(path),
    })
}

/// Screenshots stored as files in a fixed set of directories.
#[derive(Clone, Debug)]
pub struct DirectoryMediaIndex {
    dirs: Vec<PathBuf>,
}

impl DirectoryMediaIndex {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }
}

impl MediaIndex for DirectoryMediaIndex {
    fn screenshots(&self) -> Result<Vec<MediaItem>> {
        let mut items = Vec::new();
        let mut readable = 0usize;

        for dir in &self.dirs {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(error) => {
                    debug!("skipping {}: {error}", dir.display());
                    continue;
                }
            };
            readable += 1;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() && is_screenshot_file(&path) && !is_hidden(&path) {
                    items.extend(media_item(&path));
                }
            }
        }

        if readable == 0 {
            return Err(Error::NotFound("no readable screenshot directory".to_string()));
        }
        // Oldest first, so catalog insertion order follows capture order.
        items.sort_by(|a, b| a.last_modified.cmp(&b.last_modified).then(a.uri.cmp(&b.uri)));
        Ok(items)
    }
}

/// Waits until a freshly written file stops growing.
fn wait_for_file(path: &Path) -> Result<()> {
    let mut last_size = None;

    for _ in 0..12 {
        if let Ok(metadata) = fs::metadata(path) {
            let size = metadata.len();
            if size > 0 && last_size == Some(size) {
                return Ok(());
            }
            last_size = Some(size);
        }

        thread::sleep(Duration::from_millis(200));
    }

    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{} not ready after waiting", path.display()),
    )))
}

/// Keeps a directory watch alive; dropping it stops watching.
pub struct ScreenshotWatcher {
    _watcher: notify::RecommendedWatcher,
}

fn handle_event<F>(
    event: Event,
    catalog: &Arc<Catalog>,
    debounce_map: &Arc<Mutex<HashMap<PathBuf, Instant>>>,
    on_new: &Arc<F>,
) where
    F: Fn(String) + Send + Sync + 'static,
{
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }

    for path in event.paths {
        if !is_screenshot_file(&path) || is_hidden(&path) {
            continue;
        }

        let now = Instant::now();
        debounce_map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.clone(), now);

        let catalog = Arc::clone(catalog);
        let debounce_map = Arc::clone(debounce_map);
        let on_new = Arc::clone(on_new);
        thread::spawn(move || {
            thread::sleep(DEBOUNCE);
            let latest = {
                let mut guard = debounce_map
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let latest = guard.get(&path).map(|seen| *seen == now).unwrap_or(false);
                if latest {
                    guard.remove(&path);
                }
                latest
            };
            if !latest {
                return;
            }

            if let Err(error) = wait_for_file(&path) {
                warn!("{error}");
                return;
            }
            let Some(item) = media_item(&path) else {
                return;
            };
            match catalog.insert_if_absent(&item.uri, item.last_modified) {
                Ok(true) => {
                    info!("new screenshot {}", item.uri);
                    on_new(item.uri);
                }
                Ok(false) => {}
                Err(error) => warn!("failed to record {}: {error}", item.uri),
            }
        });
    }
}

/// Watches `dirs` for new screenshots, records them in `catalog` and hands
/// each new URI to `on_new`.
pub fn watch<F>(dirs: &[PathBuf], catalog: Arc<Catalog>, on_new: F) -> Result<ScreenshotWatcher>
where
    F: Fn(String) + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.send(res);
    })
    .map_err(|error| Error::Io(std::io::Error::other(error)))?;

    let mut watched = 0usize;
    for dir in dirs {
        match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                info!("watching {}", dir.display());
                watched += 1;
            }
            Err(error) => warn!("failed to watch {}: {error}", dir.display()),
        }
    }
    if watched == 0 {
        return Err(Error::NotFound("no watchable screenshot directory".to_string()));
    }

    let on_new = Arc::new(on_new);
    thread::spawn(move || {
        let debounce_map = Arc::new(Mutex::new(HashMap::new()));
        for res in rx {
            match res {
                Ok(event) => handle_event(event, &catalog, &debounce_map, &on_new),
                Err(error) => warn!("watch error: {error}"),
            }
        }
        debug!("screenshot watcher stopped");
    });

    Ok(ScreenshotWatcher { _watcher: watcher })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_by_extension_and_visibility() {
        assert!(is_screenshot_file(Path::new("/a/Screenshot_2024.PNG")));
        assert!(is_screenshot_file(Path::new("/a/shot.jpeg")));
        assert!(!is_screenshot_file(Path::new("/a/notes.txt")));
        assert!(is_hidden(Path::new("/a/.pending-shot.png")));
        assert!(!is_hidden(Path::new("/a/shot.png")));
    }

    #[test]
    fn directory_index_lists_visible_images() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("one.png"), b"png").expect("write");
        fs::write(dir.path().join("two.jpg"), b"jpg").expect("write");
        fs::write(dir.path().join(".hidden.png"), b"png").expect("write");
        fs::write(dir.path().join("readme.md"), b"md").expect("write");
        fs::create_dir(dir.path().join("nested.png")).expect("mkdir");

        let index = DirectoryMediaIndex::new(vec![
            dir.path().to_path_buf(),
            dir.path().join("missing"),
        ]);
        let mut uris: Vec<String> = index
            .screenshots()
            .expect("screenshots")
            .into_iter()
            .map(|item| item.uri)
            .collect();
        uris.sort();
        assert_eq!(uris.len(), 2);
        assert!(uris[0].ends_with("one.png"));
        assert!(uris[1].ends_with("two.jpg"));
    }

    #[test]
    fn directory_index_without_readable_dirs_fails() {
        let index = DirectoryMediaIndex::new(vec![PathBuf::from("/definitely/not/here")]);
        assert!(index.screenshots().is_err());
    }

    #[test]
    fn wait_for_file_accepts_settled_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shot.png");
        fs::write(&path, b"settled").expect("write");
        wait_for_file(&path).expect("ready");
    }
}
