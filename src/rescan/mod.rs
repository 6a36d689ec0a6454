//! The rescan engine (C6): periodic reconciliation between the file-state
//! repository and the synced folder on disk.

use crate::config::{RescanMode, SyncNodeConfig};
use crate::hashing;
use crate::repository::{SharedRepository, SyncedFile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

const PROGRESS_EMIT_INTERVAL: usize = 50;

/// An injected pure predicate deciding whether a relative path should be
/// skipped by the rescan. Any panic-free implementation error should resolve
/// to `false` (include the file) so a broken ruleset never hides data.
pub trait IgnoreMatcher: Send + Sync {
    fn is_ignored(&self, relative_path: &str) -> bool;
}

/// Default matcher: only the built-in dotfile/tilde rule, no extra patterns.
pub struct NoopIgnoreMatcher;

impl IgnoreMatcher for NoopIgnoreMatcher {
    fn is_ignored(&self, _relative_path: &str) -> bool {
        false
    }
}

/// Standing in for the external sync orchestrator this engine notifies after
/// a rescan that found changes.
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    async fn force_sync(&self);
}

/// No-op trigger used where nothing downstream needs to react.
pub struct NoopSyncTrigger;

#[async_trait]
impl SyncTrigger for NoopSyncTrigger {
    async fn force_sync(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedActual {
    pub hash: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescanChangeKind {
    NewFile,
    ModifiedFile,
    DeletedFile,
    HashMismatch,
}

#[derive(Debug, Clone)]
pub struct RescanChange {
    pub kind: RescanChangeKind,
    pub relative_path: String,
    pub detected_at: DateTime<Utc>,
    pub expected: Option<ExpectedActual>,
    pub actual: Option<ExpectedActual>,
}

#[derive(Debug, Clone)]
pub struct RescanProgress {
    pub total: usize,
    pub scanned: usize,
    pub changes: usize,
    pub current_file: String,
    pub is_running: bool,
}

impl RescanProgress {
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.scanned as f64 / self.total as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone)]
pub enum RescanEvent {
    ProgressChanged(RescanProgress),
    ChangeDetected(RescanChange),
    RescanCompleted(usize),
}

fn is_ignored(relative_path: &str, matcher: &dyn IgnoreMatcher) -> bool {
    let file_name = Path::new(relative_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    if file_name.starts_with('.') || file_name.starts_with('~') {
        return true;
    }
    matcher.is_ignored(relative_path)
}

/// Periodic reconciler between the file-state repository and the synced
/// folder, timer-driven with `Start`/`Stop`/`UpdateInterval` lifecycle.
pub struct RescanEngine {
    sync_folder: std::path::PathBuf,
    repository: SharedRepository,
    matcher: Arc<dyn IgnoreMatcher>,
    trigger: Arc<dyn SyncTrigger>,
    file_stream_buffer_size: usize,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RescanEvent>>>,
    is_running: AtomicBool,
    timer_cancel: StdMutex<Option<CancellationToken>>,
    pub last_rescan_time: Mutex<Option<DateTime<Utc>>>,
    pub last_rescan_duration_seconds: Mutex<f64>,
    pub last_rescan_changes_found: Mutex<usize>,
}

impl RescanEngine {
    pub fn new(
        sync_folder: std::path::PathBuf,
        repository: SharedRepository,
        matcher: Arc<dyn IgnoreMatcher>,
        trigger: Arc<dyn SyncTrigger>,
        file_stream_buffer_size: usize,
    ) -> Self {
        Self {
            sync_folder,
            repository,
            matcher,
            trigger,
            file_stream_buffer_size,
            subscribers: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
            timer_cancel: StdMutex::new(None),
            last_rescan_time: Mutex::new(None),
            last_rescan_duration_seconds: Mutex::new(0.0),
            last_rescan_changes_found: Mutex::new(0),
        }
    }

    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<RescanEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        rx
    }

    async fn emit(&self, event: RescanEvent) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Arms the periodic timer. The initial delay equals the period, so
    /// there is no rescan immediately at startup. A period of zero disables
    /// the timer entirely.
    pub fn start(self: &Arc<Self>, config: &SyncNodeConfig) {
        if config.rescan_interval_minutes == 0 {
            return;
        }
        let cancel = CancellationToken::new();
        let engine = self.clone();
        let period = std::time::Duration::from_secs(config.rescan_interval_minutes * 60);
        let mode = config.rescan_mode;
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {
                        let _ = engine.rescan(Some(mode), &CancellationToken::new()).await;
                    }
                }
            }
        });

        // Replacing any existing token drops and cancels the old timer task.
        let previous = self.timer_cancel.lock().unwrap().replace(cancel);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    pub async fn stop(&self) {
        if let Some(cancel) = self.timer_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
    }

    pub async fn update_interval(self: &Arc<Self>, config: &SyncNodeConfig) {
        self.stop().await;
        self.start(config);
    }

    /// Runs one reconciliation pass. Overlapping invocations return `0`
    /// immediately without running.
    pub async fn rescan(&self, mode: Option<RescanMode>, cancel: &CancellationToken) -> usize {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return 0;
        }

        let result = self.run_pass(mode, cancel).await;
        self.is_running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_pass(&self, mode: Option<RescanMode>, cancel: &CancellationToken) -> usize {
        let started_at = std::time::Instant::now();
        let mode = mode.unwrap_or(RescanMode::QuickTimestampOnly);

        let mut known: HashMap<String, SyncedFile> = self
            .repository
            .get_all()
            .into_iter()
            .map(|f| (f.relative_path.to_ascii_lowercase(), f))
            .collect();

        let disk = enumerate_disk_files(&self.sync_folder, self.matcher.as_ref());

        let total = disk.len() + known.len();
        let mut scanned = 0usize;
        let mut changes = 0usize;

        self.emit(RescanEvent::ProgressChanged(RescanProgress {
            total,
            scanned,
            changes,
            current_file: String::new(),
            is_running: true,
        }))
        .await;

        for relative_path in &disk {
            if cancel.is_cancelled() {
                self.emit(RescanEvent::ProgressChanged(RescanProgress {
                    total,
                    scanned,
                    changes,
                    current_file: "Cancelled".to_string(),
                    is_running: false,
                }))
                .await;
                return changes;
            }

            let absolute = self.sync_folder.join(relative_path);
            let metadata = match tokio::fs::metadata(&absolute).await {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(path = %relative_path, error = %err, "failed to stat file during rescan");
                    scanned += 1;
                    continue;
                }
            };
            let file_size = metadata.len();
            let last_modified: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            let key = relative_path.to_ascii_lowercase();
            if let Some(existing) = known.remove(&key) {
                match mode {
                    RescanMode::QuickTimestampOnly => {
                        if file_size != existing.file_size || last_modified != existing.last_modified {
                            changes += 1;
                            self.repository.add_or_update(SyncedFile {
                                relative_path: relative_path.clone(),
                                file_size,
                                last_modified,
                                content_hash: existing.content_hash.clone(),
                            });
                            self.emit(RescanEvent::ChangeDetected(RescanChange {
                                kind: RescanChangeKind::ModifiedFile,
                                relative_path: relative_path.clone(),
                                detected_at: Utc::now(),
                                expected: Some(ExpectedActual {
                                    hash: None,
                                    size: Some(existing.file_size),
                                }),
                                actual: Some(ExpectedActual {
                                    hash: None,
                                    size: Some(file_size),
                                }),
                            }))
                            .await;
                        }
                    }
                    RescanMode::DeepWithHash => match hashing::hash_file(&absolute, self.file_stream_buffer_size).await {
                        Ok(actual_hash) => {
                            if !actual_hash.eq_ignore_ascii_case(&existing.content_hash) {
                                changes += 1;
                                self.repository.add_or_update(SyncedFile {
                                    relative_path: relative_path.clone(),
                                    file_size,
                                    last_modified,
                                    content_hash: actual_hash.clone(),
                                });
                                self.emit(RescanEvent::ChangeDetected(RescanChange {
                                    kind: RescanChangeKind::HashMismatch,
                                    relative_path: relative_path.clone(),
                                    detected_at: Utc::now(),
                                    expected: Some(ExpectedActual {
                                        hash: Some(existing.content_hash.clone()),
                                        size: None,
                                    }),
                                    actual: Some(ExpectedActual {
                                        hash: Some(actual_hash),
                                        size: None,
                                    }),
                                }))
                                .await;
                            }
                        }
                        Err(err) => {
                            warn!(path = %relative_path, error = %err, "failed to hash file during deep rescan");
                        }
                    },
                }
            } else {
                changes += 1;
                let content_hash = match mode {
                    RescanMode::DeepWithHash => match hashing::hash_file(&absolute, self.file_stream_buffer_size).await {
                        Ok(hash) => hash,
                        Err(err) => {
                            warn!(path = %relative_path, error = %err, "failed to hash new file during deep rescan");
                            String::new()
                        }
                    },
                    RescanMode::QuickTimestampOnly => String::new(),
                };
                self.repository.add_or_update(SyncedFile {
                    relative_path: relative_path.clone(),
                    file_size,
                    last_modified,
                    content_hash,
                });
                self.emit(RescanEvent::ChangeDetected(RescanChange {
                    kind: RescanChangeKind::NewFile,
                    relative_path: relative_path.clone(),
                    detected_at: Utc::now(),
                    expected: None,
                    actual: Some(ExpectedActual {
                        hash: None,
                        size: Some(file_size),
                    }),
                }))
                .await;
            }

            scanned += 1;
            if scanned % PROGRESS_EMIT_INTERVAL == 0 {
                self.emit(RescanEvent::ProgressChanged(RescanProgress {
                    total,
                    scanned,
                    changes,
                    current_file: relative_path.clone(),
                    is_running: true,
                }))
                .await;
            }
        }

        if cancel.is_cancelled() {
            self.emit(RescanEvent::ProgressChanged(RescanProgress {
                total,
                scanned,
                changes,
                current_file: "Cancelled".to_string(),
                is_running: false,
            }))
            .await;
            return changes;
        }

        for (_, remaining) in known.into_iter() {
            changes += 1;
            scanned += 1;
            self.repository.remove(&remaining.relative_path);
            self.emit(RescanEvent::ChangeDetected(RescanChange {
                kind: RescanChangeKind::DeletedFile,
                relative_path: remaining.relative_path.clone(),
                detected_at: Utc::now(),
                expected: Some(ExpectedActual {
                    hash: Some(remaining.content_hash.clone()),
                    size: Some(remaining.file_size),
                }),
                actual: None,
            }))
            .await;
        }

        self.emit(RescanEvent::ProgressChanged(RescanProgress {
            total,
            scanned,
            changes,
            current_file: "Complete".to_string(),
            is_running: false,
        }))
        .await;

        *self.last_rescan_time.lock().await = Some(Utc::now());
        *self.last_rescan_duration_seconds.lock().await = started_at.elapsed().as_secs_f64();
        *self.last_rescan_changes_found.lock().await = changes;

        self.emit(RescanEvent::RescanCompleted(changes)).await;

        if changes > 0 {
            self.trigger.force_sync().await;
            info!(changes, "rescan found changes, force-sync triggered");
        }

        changes
    }
}

fn enumerate_disk_files(sync_folder: &Path, matcher: &dyn IgnoreMatcher) -> Vec<String> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(sync_folder).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(sync_folder) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let relative_str = relative.to_string_lossy().replace('\\', "/");
        if relative_str == crate::repository::CACHE_FILE_NAME {
            continue;
        }
        if is_ignored(&relative_str, matcher) {
            continue;
        }
        paths.push(relative_str);
    }
    paths
}
