//! Debounced file-system observer that drives the indexer. Owns an
//! in-memory `pending: (source_id, path) -> last_event_time` map and a
//! background tick task: a trailing-edge coalescer so rapid saves during
//! editing collapse into a single embedding call.

use crate::indexer::Indexer;
use crate::source::SourceRegistry;
use crate::state::ServerEvent;
use dashmap::DashMap;
use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// File names excluded from eventing regardless of source, to prevent the
/// service's own log output from triggering a reindex feedback loop.
const DENY_LIST: &[&str] = &["vault-search.log", ".vault-search-state.json"];

type PendingMap = DashMap<(String, String), Instant>;

pub struct FileWatcherManager {
    indexer: Arc<Indexer>,
    sources: Arc<SourceRegistry>,
    debounce: Duration,
    event_tx: broadcast::Sender<ServerEvent>,
    pending: Arc<PendingMap>,
    debouncers: DashMap<String, notify_debouncer_full::Debouncer<notify::RecommendedWatcher, notify_debouncer_full::FileIdMap>>,
}

impl FileWatcherManager {
    pub fn new(
        indexer: Arc<Indexer>,
        sources: Arc<SourceRegistry>,
        debounce: Duration,
        event_tx: broadcast::Sender<ServerEvent>,
    ) -> Self {
        Self {
            indexer,
            sources,
            debounce,
            event_tx,
            pending: Arc::new(DashMap::new()),
            debouncers: DashMap::new(),
        }
    }

    /// Starts watching every configured source root and spawns the tick loop
    /// that dispatches quiescent pending entries. `self` must already be
    /// wrapped in an `Arc` so the background task can outlive this call.
    pub fn start(self: &Arc<Self>) -> Result<(), notify::Error> {
        for source in self.sources.iter() {
            self.watch_source(&source.id, &source.root_path)?;
        }
        self.spawn_tick_loop();
        Ok(())
    }

    fn watch_source(&self, source_id: &str, root: &std::path::Path) -> Result<(), notify::Error> {
        let source_id_owned = source_id.to_string();
        let root_owned = root.to_path_buf();
        let pending = self.pending.clone();
        let event_tx = self.event_tx.clone();
        let indexer = self.indexer.clone();
        let rt_handle = tokio::runtime::Handle::try_current().ok();

        let mut debouncer = new_debouncer(
            Duration::from_millis(300),
            None,
            move |result: DebounceEventResult| {
                let events = match result {
                    Ok(events) => events,
                    Err(errors) => {
                        for e in errors {
                            warn!("watcher error on source {source_id_owned}: {e:?}");
                        }
                        return;
                    }
                };

                for event in &events {
                    handle_event(
                        event,
                        &source_id_owned,
                        &root_owned,
                        &pending,
                        &event_tx,
                        &indexer,
                        rt_handle.as_ref(),
                    );
                }
            },
        )?;

        debouncer.watch(root, RecursiveMode::Recursive)?;
        self.debouncers.insert(source_id.to_string(), debouncer);
        info!("watching source '{source_id}' at {}", root.display());
        Ok(())
    }

    fn spawn_tick_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let tick = Duration::from_secs(1).min(this.debounce);
            let mut interval = tokio::time::interval(tick.max(Duration::from_millis(100)));
            loop {
                interval.tick().await;
                this.dispatch_quiescent().await;
            }
        });
    }

    async fn dispatch_quiescent(&self) {
        let now = Instant::now();
        let due: Vec<(String, String)> = self
            .pending
            .iter()
            .filter(|e| now.duration_since(*e.value()) >= self.debounce)
            .map(|e| e.key().clone())
            .collect();

        for (source_id, relative_path) in due {
            self.pending.remove(&(source_id.clone(), relative_path.clone()));
            match self.indexer.index_single(&source_id, &relative_path).await {
                Ok(result) => {
                    let _ = self.event_tx.send(ServerEvent::FileIndexed {
                        source_id: source_id.clone(),
                        path: relative_path.clone(),
                        chunks: result.chunks_indexed,
                    });
                }
                Err(e) => warn!(source_id, relative_path, error = %e, "debounced reindex failed"),
            }
        }
    }

    pub fn is_watching(&self, source_id: &str) -> bool {
        self.debouncers.contains_key(source_id)
    }
}

fn handle_event(
    event: &DebouncedEvent,
    source_id: &str,
    root: &std::path::Path,
    pending: &PendingMap,
    event_tx: &broadcast::Sender<ServerEvent>,
    indexer: &Arc<Indexer>,
    rt_handle: Option<&tokio::runtime::Handle>,
) {
    use notify::event::{ModifyKind, RenameMode};
    use notify::EventKind;

    // A rename/move is reported with both endpoints in one coalesced event:
    // handle it atomically (remove the old id, enqueue the new one) so no
    // ghost entries survive the gap between the two halves.
    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        if event.paths.len() == 2 {
            let (from, to) = (&event.paths[0], &event.paths[1]);
            if let (Some(from_rel), Some(to_rel)) = (relative_of(root, from), relative_of(root, to)) {
                if !is_denied(&from_rel) {
                    pending.remove(&(source_id.to_string(), from_rel.clone()));
                    let _ = event_tx.send(ServerEvent::FileChanged {
                        source_id: source_id.to_string(),
                        path: from_rel.clone(),
                        change_type: "remove".to_string(),
                    });
                    if let Some(handle) = rt_handle {
                        let indexer = indexer.clone();
                        let sid = source_id.to_string();
                        handle.spawn(async move {
                            if let Err(e) = indexer.remove_file(&sid, &from_rel).await {
                                warn!("remove_file failed for {sid}::{from_rel}: {e}");
                            }
                        });
                    }
                }
                if !is_denied(&to_rel) {
                    pending.insert((source_id.to_string(), to_rel.clone()), Instant::now());
                    let _ = event_tx.send(ServerEvent::FileChanged {
                        source_id: source_id.to_string(),
                        path: to_rel,
                        change_type: "modify".to_string(),
                    });
                }
            }
            return;
        }
    }

    let relative_paths: Vec<String> = event
        .paths
        .iter()
        .filter_map(|p| relative_of(root, p))
        .filter(|p| !is_denied(p))
        .collect();

    if relative_paths.is_empty() {
        return;
    }

    match event.kind {
        // No debounce: the file is gone, nothing to coalesce. Removal is
        // dispatched immediately so a subsequent move-in can't race it.
        EventKind::Remove(_) => {
            for path in relative_paths {
                pending.remove(&(source_id.to_string(), path.clone()));
                let _ = event_tx.send(ServerEvent::FileChanged {
                    source_id: source_id.to_string(),
                    path: path.clone(),
                    change_type: "remove".to_string(),
                });
                if let Some(handle) = rt_handle {
                    let indexer = indexer.clone();
                    let sid = source_id.to_string();
                    handle.spawn(async move {
                        if let Err(e) = indexer.remove_file(&sid, &path).await {
                            warn!("remove_file failed for {sid}::{path}: {e}");
                        }
                    });
                }
            }
        }
        EventKind::Create(_) | EventKind::Modify(_) => {
            for path in relative_paths {
                pending.insert((source_id.to_string(), path.clone()), Instant::now());
                let _ = event_tx.send(ServerEvent::FileChanged {
                    source_id: source_id.to_string(),
                    path,
                    change_type: "modify".to_string(),
                });
            }
        }
        _ => {}
    }
}

fn relative_of(root: &std::path::Path, path: &std::path::Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
}

fn is_denied(relative_path: &str) -> bool {
    let name = std::path::Path::new(relative_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    DENY_LIST.contains(&name.as_str())
}
