//! Filesystem watching with per-scope debouncing.
//!
//! Each configured source gets a `notify` watcher. Every relevant event
//! restarts that source's debounce timer; when a timer runs out the change
//! callback is invoked once with the source's name. Timers are tokio tasks,
//! so they are aborted, never fired, once the [`WatchHandle`] is dropped.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;

/// Invoked with a scope name after a burst of changes settles.
pub type ChangeCallback = Arc<dyn Fn(String) + Send + Sync>;

type Timers = HashMap<String, (u64, JoinHandle<()>)>;

/// Collapses bursts of triggers per scope into one callback.
pub struct Debouncer {
    delay: Duration,
    runtime: Handle,
    callback: ChangeCallback,
    timers: Arc<Mutex<Timers>>,
    generation: Mutex<u64>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Debouncer {
    /// Must be created inside a tokio runtime; triggers may come from any thread.
    pub fn new(delay: Duration, callback: ChangeCallback) -> Result<Self> {
        let runtime = Handle::try_current().context("debouncer requires a tokio runtime")?;
        Ok(Self {
            delay,
            runtime,
            callback,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: Mutex::new(0),
        })
    }

    /// Restart the timer for `scope`.
    pub fn trigger(&self, scope: &str) {
        let id = {
            let mut generation = lock(&self.generation);
            *generation += 1;
            *generation
        };

        let mut timers = lock(&self.timers);
        if let Some((_, previous)) = timers.remove(scope) {
            previous.abort();
        }

        let delay = self.delay;
        let callback = self.callback.clone();
        let shared = self.timers.clone();
        let name = scope.to_string();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut timers = lock(&shared);
                match timers.get(&name) {
                    Some((current, _)) if *current == id => {
                        timers.remove(&name);
                    }
                    // Superseded by a later trigger.
                    _ => return,
                }
            }
            debug!(scope = %name, "debounced change fired");
            callback(name);
        });
        timers.insert(scope.to_string(), (id, task));
    }

    /// Scopes with a timer still running.
    pub fn pending(&self) -> usize {
        lock(&self.timers).len()
    }

    /// Abort every pending timer without firing it.
    pub fn shutdown(&self) {
        for (_, (_, task)) in lock(&self.timers).drain() {
            task.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps the watchers alive; dropping it stops watching and clears timers.
pub struct WatchHandle {
    _watchers: Vec<RecommendedWatcher>,
    debouncer: Arc<Debouncer>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.debouncer.shutdown();
    }
}

/// Watch every source root that exists. Sources whose root is missing are
/// skipped with a warning.
pub fn watch_sources(
    sources: &[SourceConfig],
    debounce: Duration,
    callback: ChangeCallback,
) -> Result<WatchHandle> {
    let debouncer = Arc::new(Debouncer::new(debounce, callback)?);
    let mut watchers = Vec::new();

    for source in sources {
        if !source.root.exists() {
            warn!(scope = %source.name, root = %source.root.display(), "source root missing, not watching");
            continue;
        }

        let scope = source.name.clone();
        let target = debouncer.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_relevant(&event) => target.trigger(&scope),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "watch error"),
        })
        .context("Failed to create file watcher")?;

        watcher
            .watch(&source.root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", source.root.display()))?;
        info!(scope = %source.name, root = %source.root.display(), ?debounce, "watching");
        watchers.push(watcher);
    }

    Ok(WatchHandle {
        _watchers: watchers,
        debouncer,
    })
}

fn is_relevant(event: &Event) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|p| !in_ignored_dir(p))
}

fn in_ignored_dir(path: &Path) -> bool {
    path.components().any(|c| {
        let name = c.as_os_str();
        name == ".git" || name == "node_modules" || name == "target"
    })
}
