//! Bearer credential ownership, background refresh and change fan-out
//!
//! Two compound sequences touch the credential: an explicit `set_credential`
//! and the periodic monitor pass. Each queues on its own key ("setCredential",
//! "monitor") so a burst of sets is not stuck behind the timer, and both then
//! take the shared "credential" key for the read -> refresh -> publish section.
//! Keys are always taken in that order.

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::credential::BearerCredential;
use crate::error::SessionError;
use crate::logger::Logger;
use crate::named_mutex::NamedAsyncMutex;
use crate::token_client::TokenClient;

const MONITOR_KEY: &str = "monitor";
const SET_KEY: &str = "setCredential";
const CREDENTIAL_KEY: &str = "credential";

pub type SharedCredential = Option<Arc<BearerCredential>>;

/// Observer awaited on every publish. Implementations must not call back into
/// `set_credential`; that would wait on the lock the publisher holds.
#[async_trait]
pub trait CredentialSubscriber: Send + Sync {
    async fn credential_changed(&self, credential: SharedCredential);
}

#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    pub interval: Duration,
    pub threshold: chrono::Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            threshold: chrono::Duration::minutes(5),
        }
    }
}

#[derive(Default)]
struct Holder {
    current: SharedCredential,
    server_uri: Option<String>,
    subscribers: Vec<Arc<dyn CredentialSubscriber>>,
}

struct Inner {
    holder: Mutex<Holder>,
    locks: NamedAsyncMutex,
    client: Arc<dyn TokenClient>,
    logger: Arc<dyn Logger>,
    policy: RefreshPolicy,
    changes: watch::Sender<SharedCredential>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct AccessTokenManager {
    inner: Arc<Inner>,
}

impl AccessTokenManager {
    pub fn new(client: Arc<dyn TokenClient>, logger: Arc<dyn Logger>, policy: RefreshPolicy) -> Self {
        let (changes, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                holder: Mutex::new(Holder::default()),
                locks: NamedAsyncMutex::new(),
                client,
                logger,
                policy,
                changes,
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Spawn the monitor loop. Calling it twice keeps the first loop.
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if task.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move { inner.run().await }));
    }

    /// Last published credential. Never blocks on a refresh in progress.
    pub fn credential(&self) -> SharedCredential {
        self.inner.holder.lock().current.clone()
    }

    pub fn server_uri(&self) -> Option<String> {
        self.inner.holder.lock().server_uri.clone()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn CredentialSubscriber>) {
        self.inner.holder.lock().subscribers.push(subscriber);
    }

    /// Latest-value view of the credential for callers that do not need the
    /// awaited fan-out.
    pub fn changes(&self) -> watch::Receiver<SharedCredential> {
        self.inner.changes.subscribe()
    }

    /// Replace the credential, refresh it right away if it is already close to
    /// expiry, and publish. Returns after every subscriber has observed it.
    pub async fn set_credential(&self, credential: Option<BearerCredential>, server_uri: &str) {
        let _queued = self.inner.locks.lock(SET_KEY).await;
        let _section = self.inner.locks.lock(CREDENTIAL_KEY).await;
        {
            let mut holder = self.inner.holder.lock();
            holder.current = credential.map(Arc::new);
            holder.server_uri = Some(server_uri.trim_end_matches('/').to_string());
        }
        self.inner.refresh_if_needed().await;
        self.inner.publish().await;
    }

    /// Drop the credential, e.g. after the server stopped recognizing it.
    pub async fn clear(&self) {
        let _queued = self.inner.locks.lock(SET_KEY).await;
        let _section = self.inner.locks.lock(CREDENTIAL_KEY).await;
        self.inner.holder.lock().current = None;
        self.inner.publish().await;
    }

    /// One monitor pass, outside the timer. Exposed for callers that want an
    /// immediate check (e.g. right before a long transfer).
    pub async fn check_now(&self) {
        self.inner.monitor_pass().await;
    }

    /// Cancel any in-flight refresh and wait for the loop to exit.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("credential monitor ended abnormally: {e}");
            }
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval() fires immediately; the first real pass is one period out
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.monitor_pass().await;
        }
        tracing::debug!("credential monitor stopped");
    }

    async fn monitor_pass(&self) {
        let _queued = self.locks.lock(MONITOR_KEY).await;
        let _section = self.locks.lock(CREDENTIAL_KEY).await;
        if self.refresh_if_needed().await {
            self.publish().await;
        }
    }

    /// Returns true when the held credential changed (refreshed or cleared).
    async fn refresh_if_needed(&self) -> bool {
        let (current, server_uri) = {
            let holder = self.holder.lock();
            (holder.current.clone(), holder.server_uri.clone())
        };
        let Some(current) = current else {
            return false;
        };
        if !current.needs_refresh(self.policy.threshold) {
            return false;
        }
        let Some(server_uri) = server_uri else {
            self.holder.lock().current = None;
            return true;
        };

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(SessionError::Canceled),
            r = self.client.refresh(&server_uri, &current) => r,
        };
        match result {
            Ok(fresh) => {
                self.holder.lock().current = Some(Arc::new(fresh));
                tracing::debug!(server = %server_uri, "credential refreshed");
                self.logger.credential_refreshed(&server_uri);
                true
            }
            // shutting down; leave the credential as it was
            Err(SessionError::Canceled) => false,
            Err(e) => {
                self.holder.lock().current = None;
                tracing::warn!(server = %server_uri, "credential refresh failed, session lost: {e}");
                self.logger.session_lost(&server_uri, &e.to_string());
                true
            }
        }
    }

    async fn publish(&self) {
        let (current, subscribers) = {
            let holder = self.holder.lock();
            (holder.current.clone(), holder.subscribers.clone())
        };
        self.changes.send_replace(current.clone());
        join_all(
            subscribers
                .iter()
                .map(|s| s.credential_changed(current.clone())),
        )
        .await;
    }
}
