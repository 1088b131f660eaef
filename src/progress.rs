//! Transfer progress: callback registries and the terminal bar
//!
//! A transfer registers a callback under its correlation id just before the
//! request goes out and holds the returned guard until it finishes, whatever
//! way it finishes. Progress for one id is delivered one callback at a time and
//! never goes backwards; duplicates and stale offsets are dropped.

use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::named_mutex::NamedAsyncMutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Bytes transferred so far and the total when known
    Advanced { bytes: u64, total: Option<u64> },
    Failed(String),
    /// The server refused the transfer with this HTTP status
    Rejected { status: u16, message: String },
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

struct Registration {
    callback: ProgressCallback,
    total: Option<u64>,
    last_offset: Option<u64>,
}

#[derive(Default)]
pub struct ProgressRegistry {
    entries: Mutex<HashMap<Uuid, Registration>>,
    locks: NamedAsyncMutex,
}

/// Server-pushed upload progress
pub type UploadProgressRegistry = ProgressRegistry;
/// Client-computed download progress
pub type DownloadProgressRegistry = ProgressRegistry;

/// Unregisters its callback when dropped.
pub struct RegistrationGuard {
    registry: Arc<ProgressRegistry>,
    id: Uuid,
}

impl RegistrationGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.entries.lock().remove(&self.id);
    }
}

impl ProgressRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(
        self: &Arc<Self>,
        id: Uuid,
        total: Option<u64>,
        callback: ProgressCallback,
    ) -> RegistrationGuard {
        self.entries.lock().insert(
            id,
            Registration {
                callback,
                total,
                last_offset: None,
            },
        );
        RegistrationGuard {
            registry: self.clone(),
            id,
        }
    }

    /// Deliver an offset for `id`. Returns false when nothing is registered or
    /// the offset does not move forward.
    pub async fn report(&self, id: Uuid, bytes: u64) -> bool {
        let _serial = self.locks.lock(&id.to_string()).await;
        let (callback, total) = {
            let mut entries = self.entries.lock();
            let Some(reg) = entries.get_mut(&id) else {
                return false;
            };
            if reg.last_offset.is_some_and(|last| bytes <= last) {
                return false;
            }
            reg.last_offset = Some(bytes);
            (reg.callback.clone(), reg.total)
        };
        callback(ProgressEvent::Advanced { bytes, total });
        true
    }

    pub async fn fail(&self, id: Uuid, message: &str) -> bool {
        self.deliver(id, ProgressEvent::Failed(message.to_string())).await
    }

    pub async fn reject(&self, id: Uuid, status: u16, message: &str) -> bool {
        let event = ProgressEvent::Rejected {
            status,
            message: message.to_string(),
        };
        self.deliver(id, event).await
    }

    async fn deliver(&self, id: Uuid, event: ProgressEvent) -> bool {
        let _serial = self.locks.lock(&id.to_string()).await;
        let callback = match self.entries.lock().get(&id) {
            Some(reg) => reg.callback.clone(),
            None => return false,
        };
        callback(event);
        true
    }

    /// Send an error event to every registration. Registrations stay in place;
    /// their owners drop them.
    pub async fn abort_all(&self, message: &str) -> usize {
        let ids: Vec<Uuid> = self.entries.lock().keys().copied().collect();
        let mut n = 0;
        for id in ids {
            if self.fail(id, message).await {
                n += 1;
            }
        }
        n
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Byte progress bar for a single transfer.
pub struct TransferBar {
    bar: ProgressBar,
    start_time: Instant,
}

impl TransferBar {
    pub fn new(label: &str, total: Option<u64>) -> Self {
        let bar = match total {
            Some(t) => ProgressBar::new(t),
            None => ProgressBar::new_spinner(),
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:30.green/white}] {bytes}/{total_bytes} {bytes_per_sec}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(label.to_string());
        Self {
            bar,
            start_time: Instant::now(),
        }
    }

    /// Callback that drives this bar.
    pub fn callback(&self) -> ProgressCallback {
        let bar = self.bar.clone();
        Arc::new(move |event: ProgressEvent| match event {
            ProgressEvent::Advanced { bytes, total } => {
                if let Some(t) = total {
                    bar.set_length(t);
                }
                bar.set_position(bytes);
            }
            ProgressEvent::Failed(msg) | ProgressEvent::Rejected { message: msg, .. } => {
                bar.abandon_with_message(msg)
            }
        })
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn finish_success(&self, bytes: u64) {
        let secs = self.elapsed_secs();
        let throughput = if secs > 0.0 {
            bytes as f64 / secs / 1_048_576.0
        } else {
            0.0
        };
        self.bar.finish_with_message(format!(
            "Completed {:.1} MB in {:.1}s ({:.1} MB/s)",
            bytes as f64 / 1_048_576.0,
            secs,
            throughput
        ));
    }

    pub fn finish_error(&self, msg: &str) {
        self.bar.abandon_with_message(format!("Failed {msg}"));
    }
}
