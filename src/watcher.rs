//! Debounced filesystem watching.
//!
//! Wraps a `notify` watcher with a thread that batches bursts of events and
//! calls back once per quiet period. Dropping the [`DirWatcher`] stops the
//! watcher, which closes the channel and ends the thread.

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Live watch on one directory.
pub struct DirWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl DirWatcher {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for DirWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirWatcher").field("path", &self.path).finish()
    }
}

/// Watch `path` and call `on_change` with the set of touched paths after
/// each burst of create/modify/remove events settles for `debounce`.
pub fn watch<F>(
    path: &Path,
    recursive: bool,
    debounce: Duration,
    on_change: F,
) -> notify::Result<DirWatcher>
where
    F: Fn(Vec<PathBuf>) + Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
    let mut watcher = RecommendedWatcher::new(tx, notify::Config::default())?;
    let mode = if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher.watch(path, mode)?;

    let label = path.display().to_string();
    std::thread::Builder::new()
        .name("ouroboros-watch".into())
        .spawn(move || debounce_loop(rx, debounce, &label, on_change))
        .map_err(notify::Error::io)?;

    tracing::debug!(path = %path.display(), recursive, "watching");
    Ok(DirWatcher {
        path: path.to_path_buf(),
        _watcher: watcher,
    })
}

fn debounce_loop<F>(rx: Receiver<notify::Result<Event>>, debounce: Duration, label: &str, on_change: F)
where
    F: Fn(Vec<PathBuf>),
{
    loop {
        // Block until the first event of a burst, or until the watcher is dropped
        let first = match rx.recv() {
            Ok(Ok(event)) => event,
            Ok(Err(e)) => {
                tracing::warn!(path = %label, "watcher error: {e}");
                continue;
            }
            Err(_) => break,
        };

        let mut touched = BTreeSet::new();
        collect_paths(&first, &mut touched);

        let deadline = Instant::now() + debounce;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(Ok(event)) => collect_paths(&event, &mut touched),
                Ok(Err(e)) => tracing::warn!(path = %label, "watcher error: {e}"),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        if !touched.is_empty() {
            on_change(touched.into_iter().collect());
        }
    }
    tracing::debug!(path = %label, "watch ended");
}

/// Keep only events that change the listing.
fn collect_paths(event: &Event, touched: &mut BTreeSet<PathBuf>) {
    if matches!(
        event.kind,
        notify::EventKind::Create(_) | notify::EventKind::Modify(_) | notify::EventKind::Remove(_)
    ) {
        touched.extend(event.paths.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, EventKind};

    #[test]
    fn access_events_are_ignored() {
        let mut touched = BTreeSet::new();
        let access = Event::new(EventKind::Access(AccessKind::Any)).add_path("/a".into());
        collect_paths(&access, &mut touched);
        assert!(touched.is_empty());

        let create = Event::new(EventKind::Create(CreateKind::File)).add_path("/b".into());
        collect_paths(&create, &mut touched);
        assert_eq!(touched.into_iter().collect::<Vec<_>>(), vec![PathBuf::from("/b")]);
    }

    #[test]
    fn burst_is_delivered_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let (out_tx, out_rx) = std::sync::mpsc::channel();

        let handle = std::thread::spawn(move || {
            debounce_loop(rx, Duration::from_millis(100), "test", move |paths| {
                let _ = out_tx.send(paths);
            })
        });

        for name in ["/x", "/y", "/x"] {
            let ev = Event::new(EventKind::Create(CreateKind::File)).add_path(name.into());
            tx.send(Ok(ev)).unwrap();
        }

        let batch = out_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(batch, vec![PathBuf::from("/x"), PathBuf::from("/y")]);

        drop(tx);
        handle.join().unwrap();
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn real_directory_change_triggers_callback() {
        let dir = tempfile::tempdir().unwrap();
        let (out_tx, out_rx) = std::sync::mpsc::channel();
        let _watcher = watch(dir.path(), false, Duration::from_millis(100), move |paths| {
            let _ = out_tx.send(paths);
        })
        .unwrap();

        std::fs::write(dir.path().join("new.txt"), "x").unwrap();
        let batch = out_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(batch.iter().any(|p| p.ends_with("new.txt")));
    }
}
