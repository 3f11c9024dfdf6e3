//! Discovery feed: debounced directory watcher plus a startup scan.
//!
//! Watches the upload root and emits a [`Discovery`] for every settled
//! image file. The debounce window is what keeps half-written files out of
//! the pipeline: an event only fires once the file has been quiet for the
//! settle interval. Files already present at startup are scanned once
//! before live events flow. Duplicate events for an unchanged file are
//! fine — they collapse onto the same identity downstream.

use std::path::Path;

use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebouncedEvent, Debouncer, RecommendedCache, new_debouncer};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::error::Result;
use crate::model::Discovery;

/// Keeps the underlying watcher alive. Dropping this stops the feed.
pub struct WatcherHandle {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

/// Ensure the watch root and category subdirectories exist, returning the
/// category list (configured, or discovered from existing subdirectories).
pub fn prepare_categories(config: &WatchConfig) -> Result<Vec<String>> {
    std::fs::create_dir_all(&config.root)?;

    let mut categories = match &config.categories {
        Some(explicit) => explicit.clone(),
        None => {
            let mut found = Vec::new();
            for entry in std::fs::read_dir(&config.root)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type()?.is_dir() && !name.starts_with('.') {
                    found.push(name);
                }
            }
            found
        }
    };
    categories.sort();

    for category in &categories {
        std::fs::create_dir_all(config.root.join(category))?;
    }
    Ok(categories)
}

/// Start watching. Live events are delivered on `tx` from the watcher
/// thread; files already present in the category directories are scanned
/// and emitted before this returns.
pub async fn start(config: &WatchConfig, tx: mpsc::Sender<Discovery>) -> Result<WatcherHandle> {
    let categories = prepare_categories(config)?;
    info!(
        root = %config.root.display(),
        categories = categories.join(","),
        "watching for new files"
    );

    let root = config.root.clone();
    let extensions = config.extensions.clone();
    let event_tx = tx.clone();
    let mut debouncer = new_debouncer(
        config.settle,
        None,
        move |result: std::result::Result<Vec<DebouncedEvent>, Vec<notify::Error>>| match result {
            Ok(events) => {
                for event in events {
                    handle_event(&root, &extensions, &event, &event_tx);
                }
            }
            Err(errors) => {
                for error in errors {
                    warn!(error = %error, "watcher error");
                }
            }
        },
    )?;

    debouncer.watch(&config.root, RecursiveMode::Recursive)?;

    // The watcher is live before the scan, so files landing mid-scan are
    // reported either way; duplicates collapse onto the same identity.
    scan_existing(config, &categories, &tx).await?;

    Ok(WatcherHandle {
        _debouncer: debouncer,
    })
}

async fn scan_existing(
    config: &WatchConfig,
    categories: &[String],
    tx: &mpsc::Sender<Discovery>,
) -> Result<()> {
    let mut found = 0usize;
    for category in categories {
        let dir = config.root.join(category);
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if !meta.is_file() || !has_allowed_extension(&path, &config.extensions) {
                continue;
            }
            let discovery = Discovery {
                path,
                category: category.clone(),
                size: meta.len(),
                modified: meta.modified()?,
            };
            if tx.send(discovery).await.is_err() {
                return Ok(());
            }
            found += 1;
        }
    }
    info!(files = found, "initial scan complete");
    Ok(())
}

/// A create or write settled in some category directory.
fn handle_event(
    root: &Path,
    extensions: &[String],
    event: &DebouncedEvent,
    tx: &mpsc::Sender<Discovery>,
) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }

    for path in &event.paths {
        if !has_allowed_extension(path, extensions) {
            continue;
        }
        let Some(category) = category_of(root, path) else {
            debug!(path = %path.display(), "file outside a category directory; ignored");
            continue;
        };
        let Ok(meta) = std::fs::metadata(path) else {
            // Gone already (moved or deleted before the debounce fired).
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let discovery = Discovery {
            path: path.clone(),
            category,
            size: meta.len(),
            modified: meta.modified().unwrap_or_else(|_| std::time::SystemTime::now()),
        };
        debug!(path = %path.display(), "file event");
        if tx.blocking_send(discovery).is_err() {
            return;
        }
    }
}

fn has_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension() else {
        return false;
    };
    let ext = format!(".{}", ext.to_string_lossy().to_lowercase());
    extensions.contains(&ext)
}

/// First path component under the root: `root/cats/a.jpg` -> `cats`.
/// Files directly in the root have no category and are ignored.
fn category_of(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let first = components.next()?.as_os_str().to_string_lossy().into_owned();
    // Need at least one more component, otherwise `first` is the file itself.
    components.next()?;
    Some(first)
}
