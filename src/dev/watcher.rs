use std::path::{Path, PathBuf};
use std::time::Duration;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::RecursiveMode;
use notify_debouncer_mini::{DebounceEventResult, new_debouncer};
use tokio::sync::mpsc as tokio_mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::kitchen::Kitchen;
use crate::url_meta::UrlAssociations;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Modified(Url),
    Deleted(Url),
}

/// Keeps the OS watcher alive; dropping it stops watching.
pub struct WatcherHandle {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    _bridge_task: JoinHandle<()>,
}

fn build_gitignore_matcher(root: &Path) -> Gitignore {
    let mut builder = GitignoreBuilder::new(root);
    let gitignore_path = root.join(".gitignore");
    if gitignore_path.exists() {
        if let Some(err) = builder.add(&gitignore_path) {
            warn!(path = %gitignore_path.display(), error = %err, "cannot read .gitignore");
        }
    }
    builder.build().unwrap_or_else(|_| Gitignore::empty())
}

/// Watch `root` recursively, yielding changes of files the `watch` association covers.
///
/// Events are debounced at 75ms.
pub fn start_watcher(
    root: &Path,
    associations: UrlAssociations,
) -> anyhow::Result<(WatcherHandle, tokio_mpsc::Receiver<WatchEvent>)> {
    let (std_tx, std_rx) = std::sync::mpsc::channel::<DebounceEventResult>();
    let mut debouncer = new_debouncer(Duration::from_millis(75), move |res| {
        let _ = std_tx.send(res);
    })?;
    debouncer.watcher().watch(root, RecursiveMode::Recursive)?;

    let gitignore = build_gitignore_matcher(root);
    let (tokio_tx, tokio_rx) = tokio_mpsc::channel::<WatchEvent>(256);
    let bridge_task = tokio::task::spawn_blocking(move || {
        while let Ok(result) = std_rx.recv() {
            match result {
                Ok(events) => {
                    for event in events {
                        let Some(watch_event) = classify_event(&event.path, &gitignore, &associations) else {
                            continue;
                        };
                        if tokio_tx.blocking_send(watch_event).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => warn!(error = ?err, "watcher error"),
            }
        }
    });

    Ok((
        WatcherHandle {
            _debouncer: debouncer,
            _bridge_task: bridge_task,
        },
        tokio_rx,
    ))
}

fn classify_event(path: &Path, gitignore: &Gitignore, associations: &UrlAssociations) -> Option<WatchEvent> {
    if path.components().any(|c| c.as_os_str() == "node_modules") {
        return None;
    }
    if gitignore.matched(path, path.is_dir()).is_ignore() {
        return None;
    }
    if path.is_dir() {
        return None;
    }
    let url = Url::from_file_path(path).ok()?;
    if !associations.applies(url.as_str(), "watch") {
        return None;
    }
    Some(if path.exists() {
        WatchEvent::Modified(url)
    } else {
        WatchEvent::Deleted(url)
    })
}

/// Forward watcher events to the kitchen until the channel closes.
pub async fn apply_events(kitchen: Kitchen, mut rx: tokio_mpsc::Receiver<WatchEvent>) {
    while let Some(event) = rx.recv().await {
        let invalidated = match &event {
            WatchEvent::Modified(url) => kitchen.url_info_modified(url.as_str()),
            WatchEvent::Deleted(url) => kitchen.url_info_deleted(url.as_str()),
        };
        if !invalidated.is_empty() {
            debug!(event = ?event, count = invalidated.len(), "invalidated urls");
        }
    }
}

/// Watch the kitchen's root directory and keep its graph in sync.
pub fn watch_kitchen(kitchen: &Kitchen) -> anyhow::Result<WatcherHandle> {
    let root: PathBuf = kitchen
        .context()
        .root_directory_url
        .to_file_path()
        .map_err(|()| anyhow::anyhow!("root directory is not a file url"))?;
    let (handle, rx) = start_watcher(&root, kitchen.context().associations.clone())?;
    tokio::spawn(apply_events(kitchen.clone(), rx));
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn watch_all(root: &Path) -> UrlAssociations {
        let base = Url::from_directory_path(root).unwrap();
        let mut associations = UrlAssociations::new();
        associations
            .associate_flags("watch", [("./**/*", true), ("./vendor/", false)], &base)
            .unwrap();
        associations
    }

    #[test]
    fn test_classify_modified_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let associations = watch_all(dir.path());
        let gitignore = build_gitignore_matcher(dir.path());
        let file = dir.path().join("a.js");
        fs::write(&file, "1").unwrap();
        let url = Url::from_file_path(&file).unwrap();

        assert_eq!(
            classify_event(&file, &gitignore, &associations),
            Some(WatchEvent::Modified(url.clone()))
        );
        fs::remove_file(&file).unwrap();
        assert_eq!(
            classify_event(&file, &gitignore, &associations),
            Some(WatchEvent::Deleted(url))
        );
    }

    #[test]
    fn test_classify_skips_unwatched_and_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "dist/\n").unwrap();
        for sub in ["dist", "vendor", "node_modules"] {
            fs::create_dir(dir.path().join(sub)).unwrap();
            fs::write(dir.path().join(sub).join("x.js"), "1").unwrap();
        }
        let associations = watch_all(dir.path());
        let gitignore = build_gitignore_matcher(dir.path());

        for sub in ["dist", "vendor", "node_modules"] {
            let path = dir.path().join(sub).join("x.js");
            assert_eq!(classify_event(&path, &gitignore, &associations), None, "{sub} is skipped");
        }
    }
}
