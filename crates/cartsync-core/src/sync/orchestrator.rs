//! Subscription lifecycle and background workers.
//!
//! Three tasks run while the synchronizer is started:
//!
//! - the control task follows the signed-in identity and the identity's list
//!   pointer, and drives `Unsubscribed -> Initializing -> Subscribed`;
//! - the local-change worker runs bulk reconciliation and every
//!   local-to-remote write;
//! - the remote-notification worker applies remote changes locally.
//!
//! Each attachment to a list is a [`Session`]. Jobs carry their session and
//! are dropped once a newer session has replaced it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::failure::{FailureListener, LoggingFailureListener};
use super::incremental::{self, FollowUp};
use super::reconcile::{reconcile_list, ReconcileReport};
use super::SyncContext;
use crate::auth::{Identity, IdentityProvider};
use crate::config::SyncSettings;
use crate::db::{EntityListener, ListenerId, LocalChange, LocalStore};
use crate::error::{Error, RemoteError, Result};
use crate::models::{EntityKind, EntityRef};
use crate::remote::{ChildEvent, ChildListener, RemotePath, RemoteStore, WatchId};
use crate::state::SyncState;

/// Remote/local ping-pong rounds awaited by [`Synchronizer::flush`]
const FLUSH_ROUNDS: usize = 4;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Session {
    epoch: u64,
    uid: String,
    list_id: String,
    ctx: SyncContext,
}

enum LocalJob {
    Change {
        session: Arc<Session>,
        change: LocalChange,
    },
    FollowUp {
        session: Arc<Session>,
        follow_up: FollowUp,
    },
    Reconcile {
        session: Arc<Session>,
        reply: oneshot::Sender<Result<Vec<ReconcileReport>>>,
    },
    Flush(oneshot::Sender<()>),
}

enum RemoteJob {
    Child {
        session: Arc<Session>,
        kind: EntityKind,
        event: ChildEvent,
    },
    Flush(oneshot::Sender<()>),
}

enum Control {
    PointerChanged { epoch: u64, list_id: Option<String> },
    Resync { epoch: u64 },
}

#[derive(Clone)]
struct Senders {
    local: mpsc::Sender<LocalJob>,
    remote: mpsc::Sender<RemoteJob>,
    control: mpsc::UnboundedSender<Control>,
}

impl Senders {
    /// Queue without blocking; a full queue schedules a bulk reconciliation
    fn offer_local(&self, epoch: u64, job: LocalJob) {
        match self.local.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    "Local change queue is full, dropping a change and scheduling a full reconciliation"
                );
                let _ = self.control.send(Control::Resync { epoch });
            }
            Err(TrySendError::Closed(_)) => tracing::debug!("Local change queue is closed"),
        }
    }

    fn offer_remote(&self, epoch: u64, job: RemoteJob) {
        match self.remote.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    "Remote notification queue is full, dropping a notification and scheduling a full reconciliation"
                );
                let _ = self.control.send(Control::Resync { epoch });
            }
            Err(TrySendError::Closed(_)) => tracing::debug!("Remote notification queue is closed"),
        }
    }
}

/// Forwards one collection's child events to the remote worker. Events
/// delivered while the listener is being registered are buffered and sent
/// with backpressure afterwards.
struct ChildForwarder {
    session: Arc<Session>,
    kind: EntityKind,
    senders: Senders,
    replay: Mutex<Option<Vec<ChildEvent>>>,
}

impl ChildListener for ChildForwarder {
    fn on_child(&self, event: ChildEvent) {
        if let Some(buffer) = lock(&self.replay).as_mut() {
            buffer.push(event);
            return;
        }
        self.senders.offer_remote(
            self.session.epoch,
            RemoteJob::Child {
                session: Arc::clone(&self.session),
                kind: self.kind,
                event,
            },
        );
    }
}

#[derive(Default)]
struct Attachment {
    session: Option<Arc<Session>>,
    local_listeners: Vec<ListenerId>,
    remote_watches: Vec<WatchId>,
}

/// State shared by the synchronizer handle and its tasks
struct Shared {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    failures: Arc<dyn FailureListener>,
    epoch: AtomicU64,
    state: watch::Sender<SyncState>,
    attachment: Mutex<Attachment>,
    reports: Mutex<Vec<ReconcileReport>>,
}

impl Shared {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn is_current(&self, session: &Session) -> bool {
        session.epoch == self.current_epoch()
    }

    fn session(&self) -> Option<Arc<Session>> {
        lock(&self.attachment).session.clone()
    }

    fn set_state(&self, state: SyncState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::info!("Synchronization state: {state}");
        }
    }

    /// Cancel every listener of the current session and invalidate its
    /// queued jobs
    fn detach(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let attachment = std::mem::take(&mut *lock(&self.attachment));
        for id in attachment.remote_watches {
            self.remote.unlisten(id);
        }
        for id in attachment.local_listeners {
            self.store.remove_entity_listener(id);
        }
        if let Some(session) = attachment.session {
            session.ctx.markers.clear();
            tracing::info!("Detached from list {}", session.list_id);
        }
        self.set_state(SyncState::Unsubscribed);
    }

    fn report_start_failure(&self, error: &Error) {
        if error.is_permission_denied() {
            tracing::debug!("Ignoring permission error while starting: {error}");
        } else {
            self.failures.synchronization_start_failed(error);
        }
    }

    fn report_entity_failure(&self, entity: EntityRef, error: &Error) {
        if error.is_permission_denied() {
            tracing::debug!("Ignoring permission error for {entity}: {error}");
        } else {
            self.failures.update_server_entity_failed(entity, error);
        }
    }

    fn report_notification_failure(&self, error: &Error) {
        if error.is_permission_denied() {
            tracing::debug!("Ignoring permission error in notification: {error}");
        } else {
            self.failures.server_notification_failed(error);
        }
    }
}

struct Running {
    senders: Senders,
    control: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Keeps the local store and the signed-in identity's shared list in sync.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use cartsync_core::{Identity, LocalIdentityProvider, MemoryRemoteStore, SqliteLocalStore, Synchronizer};
/// # async fn run() -> cartsync_core::Result<()> {
/// let identity = Arc::new(LocalIdentityProvider::new());
/// let sync = Synchronizer::new(
///     Arc::new(SqliteLocalStore::open_in_memory()?),
///     Arc::new(MemoryRemoteStore::new()),
///     identity.clone(),
/// );
/// sync.start()?;
/// identity.sign_in(Identity::new("user-1")?);
/// # Ok(())
/// # }
/// ```
pub struct Synchronizer {
    shared: Arc<Shared>,
    identity: Arc<dyn IdentityProvider>,
    settings: SyncSettings,
    running: Mutex<Option<Running>>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Unsubscribed);
        Self {
            shared: Arc::new(Shared {
                store,
                remote,
                failures: Arc::new(LoggingFailureListener),
                epoch: AtomicU64::new(0),
                state,
                attachment: Mutex::default(),
                reports: Mutex::default(),
            }),
            identity,
            settings: SyncSettings::default(),
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the logging failure listener. Has no effect once started.
    #[must_use]
    pub fn with_failure_listener(mut self, failures: Arc<dyn FailureListener>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.failures = failures;
        } else {
            tracing::warn!("Failure listener must be set before the synchronizer starts");
        }
        self
    }

    /// Spawn the control task and workers. Must be called from within a
    /// Tokio runtime. Starting twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| {
            Error::InvalidInput("Synchronizer::start requires a Tokio runtime".to_string())
        })?;
        self.settings.validate()?;
        let mut running = lock(&self.running);
        if running.is_some() {
            return Ok(());
        }

        let (local_tx, local_rx) = mpsc::channel(self.settings.queue_capacity);
        let (remote_tx, remote_rx) = mpsc::channel(self.settings.queue_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let senders = Senders {
            local: local_tx.clone(),
            remote: remote_tx,
            control: control_tx,
        };

        let workers = vec![
            runtime.spawn(run_local_worker(Arc::clone(&self.shared), local_rx)),
            runtime.spawn(run_remote_worker(
                Arc::clone(&self.shared),
                remote_rx,
                local_tx,
            )),
        ];
        let controller = Controller {
            shared: Arc::clone(&self.shared),
            senders: senders.clone(),
            identity: Arc::clone(&self.identity),
            awaiting_verification: false,
        };
        let control = runtime.spawn(controller.run(
            self.identity.subscribe(),
            control_rx,
            self.settings.verification_poll_interval(),
        ));

        *running = Some(Running {
            senders,
            control,
            workers,
        });
        tracing::info!("Synchronizer started");
        Ok(())
    }

    /// Detach from the list and wait for queued work to drain
    pub async fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };
        running.control.abort();
        let _ = running.control.await;
        self.shared.detach();
        drop(running.senders);
        for worker in running.workers {
            if let Err(error) = worker.await {
                tracing::error!("Synchronizer worker failed: {error}");
            }
        }
        tracing::info!("Synchronizer stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    pub fn state(&self) -> SyncState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.shared.state.subscribe()
    }

    /// List id of the current attachment
    pub fn active_list(&self) -> Option<String> {
        self.shared.session().map(|session| session.list_id.clone())
    }

    /// Reports of the last successful bulk reconciliation, one per kind
    pub fn last_reports(&self) -> Vec<ReconcileReport> {
        lock(&self.shared.reports).clone()
    }

    /// Schedule a full reconciliation of the active list
    pub fn resync(&self) {
        if let Some(running) = lock(&self.running).as_ref() {
            let _ = running.senders.control.send(Control::Resync {
                epoch: self.shared.current_epoch(),
            });
        }
    }

    /// Wait until both workers have drained what is queued, including the
    /// work that draining produces. For test harnesses.
    #[doc(hidden)]
    pub async fn flush(&self) {
        let Some(senders) = lock(&self.running)
            .as_ref()
            .map(|running| running.senders.clone())
        else {
            return;
        };
        for _ in 0..FLUSH_ROUNDS {
            let (done, wait) = oneshot::channel();
            if senders.remote.send(RemoteJob::Flush(done)).await.is_err() {
                return;
            }
            let _ = wait.await;
            let (done, wait) = oneshot::channel();
            if senders.local.send(LocalJob::Flush(done)).await.is_err() {
                return;
            }
            let _ = wait.await;
        }
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.control.abort();
            self.shared.detach();
        }
    }
}

struct Controller {
    shared: Arc<Shared>,
    senders: Senders,
    identity: Arc<dyn IdentityProvider>,
    awaiting_verification: bool,
}

impl Controller {
    async fn run(
        mut self,
        mut identities: watch::Receiver<Option<Identity>>,
        mut control: mpsc::UnboundedReceiver<Control>,
        poll_interval: Duration,
    ) {
        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let identity = identities.borrow_and_update().clone();
        self.evaluate(identity).await;
        loop {
            tokio::select! {
                changed = identities.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let identity = identities.borrow_and_update().clone();
                    self.evaluate(identity).await;
                }
                Some(message) = control.recv() => self.on_control(message).await,
                _ = poll.tick(), if self.awaiting_verification => self.poll_verification().await,
            }
        }
        self.shared.detach();
    }

    async fn evaluate(&mut self, identity: Option<Identity>) {
        match identity {
            None => {
                self.awaiting_verification = false;
                self.shared.detach();
            }
            Some(identity) if !identity.verified => {
                if !self.awaiting_verification {
                    tracing::info!("Waiting for {} to be verified", identity.uid);
                }
                self.awaiting_verification = true;
                self.shared.detach();
            }
            Some(identity) => {
                self.awaiting_verification = false;
                let attached = self
                    .shared
                    .session()
                    .is_some_and(|session| session.uid == identity.uid);
                if !attached {
                    self.attach(&identity).await;
                }
            }
        }
    }

    async fn poll_verification(&mut self) {
        match self.identity.refresh().await {
            Ok(identity) if identity.as_ref().is_some_and(|identity| identity.verified) => {
                self.evaluate(identity).await;
            }
            Ok(_) => {}
            Err(error) => tracing::warn!("Could not refresh identity: {error}"),
        }
    }

    async fn on_control(&mut self, message: Control) {
        match message {
            Control::PointerChanged { epoch, list_id } => {
                if epoch != self.shared.current_epoch() {
                    return;
                }
                let Some(session) = self.shared.session() else {
                    return;
                };
                if list_id.as_deref() == Some(session.list_id.as_str()) {
                    return;
                }
                tracing::info!(
                    "List pointer of {} moved from {} to {}",
                    session.uid,
                    session.list_id,
                    list_id.as_deref().unwrap_or("nothing")
                );
                self.reattach().await;
            }
            Control::Resync { epoch } => {
                if epoch != self.shared.current_epoch() {
                    return;
                }
                tracing::info!("Running a full reconciliation");
                self.reattach().await;
            }
        }
    }

    async fn reattach(&mut self) {
        self.shared.detach();
        let identity = self.identity.current();
        self.evaluate(identity).await;
    }

    async fn attach(&mut self, identity: &Identity) {
        self.shared.detach();
        self.shared.set_state(SyncState::Initializing);
        let epoch = self.shared.current_epoch();
        if let Err(error) = self.try_attach(identity, epoch).await {
            self.shared.detach();
            self.shared.report_start_failure(&error);
        }
    }

    async fn try_attach(&self, identity: &Identity, epoch: u64) -> Result<()> {
        let list_id = resolve_list(self.shared.remote.as_ref(), &identity.uid).await?;
        tracing::info!("Attaching {} to list {list_id}", identity.uid);
        let session = Arc::new(Session {
            epoch,
            uid: identity.uid.clone(),
            list_id,
            ctx: SyncContext::new(
                Arc::clone(&self.shared.store),
                Arc::clone(&self.shared.remote),
            ),
        });

        // Local listeners go in first; changes made during reconciliation
        // queue up behind it.
        let local_listeners = self.install_local_listeners(&session);
        {
            let mut attachment = lock(&self.shared.attachment);
            attachment.session = Some(Arc::clone(&session));
            attachment.local_listeners = local_listeners;
        }

        let (reply, result) = oneshot::channel();
        self.senders
            .local
            .send(LocalJob::Reconcile {
                session: Arc::clone(&session),
                reply,
            })
            .await
            .map_err(|_| Error::Closed)?;
        let reports = result.await.map_err(|_| Error::Closed)??;
        if !self.shared.is_current(&session) {
            return Ok(());
        }

        for kind in EntityKind::ALL {
            self.install_child_listener(&session, kind).await?;
        }
        self.install_pointer_listener(&session)?;

        *lock(&self.shared.reports) = reports;
        self.shared.set_state(SyncState::Subscribed);
        Ok(())
    }

    fn install_local_listeners(&self, session: &Arc<Session>) -> Vec<ListenerId> {
        EntityKind::ALL
            .into_iter()
            .map(|kind| {
                let session = Arc::clone(session);
                let senders = self.senders.clone();
                let listener: Arc<dyn EntityListener> = Arc::new(move |change: LocalChange| {
                    senders.offer_local(
                        session.epoch,
                        LocalJob::Change {
                            session: Arc::clone(&session),
                            change,
                        },
                    );
                });
                self.shared.store.add_entity_listener(kind, listener)
            })
            .collect()
    }

    fn remember_watch(&self, id: WatchId) {
        lock(&self.shared.attachment).remote_watches.push(id);
    }

    async fn install_child_listener(&self, session: &Arc<Session>, kind: EntityKind) -> Result<()> {
        let forwarder = Arc::new(ChildForwarder {
            session: Arc::clone(session),
            kind,
            senders: self.senders.clone(),
            replay: Mutex::new(Some(Vec::new())),
        });
        let collection = RemotePath::collection(&session.list_id, kind)?;
        let id = self
            .shared
            .remote
            .listen_children(&collection, Arc::clone(&forwarder) as Arc<dyn ChildListener>)?;
        self.remember_watch(id);

        // Hand the replayed children over before live events may pass them
        loop {
            let batch = {
                let mut replay = lock(&forwarder.replay);
                let batch = replay.as_mut().map(std::mem::take).unwrap_or_default();
                if batch.is_empty() {
                    *replay = None;
                    break;
                }
                batch
            };
            for event in batch {
                let job = RemoteJob::Child {
                    session: Arc::clone(session),
                    kind,
                    event,
                };
                self.senders.remote.send(job).await.map_err(|_| Error::Closed)?;
            }
        }
        Ok(())
    }

    fn install_pointer_listener(&self, session: &Arc<Session>) -> Result<()> {
        let pointer = RemotePath::list_pointer(&session.uid)?;
        let control = self.senders.control.clone();
        let epoch = session.epoch;
        let id = self.shared.remote.listen_value(
            &pointer,
            Arc::new(move |value: Option<Value>| {
                let list_id = value.as_ref().and_then(Value::as_str).map(str::to_string);
                let _ = control.send(Control::PointerChanged { epoch, list_id });
            }),
        )?;
        self.remember_watch(id);
        Ok(())
    }
}

/// Read the identity's list pointer, allocating a new list when unset
async fn resolve_list(remote: &dyn RemoteStore, uid: &str) -> Result<String> {
    let pointer = RemotePath::list_pointer(uid)?;
    match remote.get(&pointer).await? {
        Some(Value::String(list_id)) if !list_id.trim().is_empty() => Ok(list_id),
        Some(other) => Err(RemoteError::Malformed {
            path: pointer.to_string(),
            reason: format!("expected a list id, found {other}"),
        }
        .into()),
        None => {
            let list_id = remote.new_key();
            remote
                .set(&pointer, Value::String(list_id.clone()))
                .await?;
            tracing::info!("Allocated list {list_id} for {uid}");
            Ok(list_id)
        }
    }
}

async fn run_local_worker(shared: Arc<Shared>, mut jobs: mpsc::Receiver<LocalJob>) {
    while let Some(job) = jobs.recv().await {
        match job {
            LocalJob::Flush(done) => {
                let _ = done.send(());
            }
            LocalJob::Reconcile { session, reply } => {
                if !shared.is_current(&session) {
                    continue;
                }
                let result = reconcile_list(&session.ctx, &session.list_id).await;
                let _ = reply.send(result);
            }
            LocalJob::Change { session, change } => {
                if !shared.is_current(&session) {
                    continue;
                }
                if let Err(error) =
                    incremental::handle_local_change(&session.ctx, change, &session.list_id).await
                {
                    shared.report_entity_failure(change.entity, &error);
                }
            }
            LocalJob::FollowUp { session, follow_up } => {
                if !shared.is_current(&session) {
                    continue;
                }
                let entity = follow_up.entity();
                if let Err(error) =
                    incremental::handle_follow_up(&session.ctx, follow_up, &session.list_id).await
                {
                    shared.report_entity_failure(entity, &error);
                }
            }
        }
    }
    tracing::debug!("Local change worker stopped");
}

async fn run_remote_worker(
    shared: Arc<Shared>,
    mut jobs: mpsc::Receiver<RemoteJob>,
    local: mpsc::Sender<LocalJob>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            RemoteJob::Flush(done) => {
                let _ = done.send(());
            }
            RemoteJob::Child {
                session,
                kind,
                event,
            } => {
                if !shared.is_current(&session) {
                    continue;
                }
                match incremental::handle_remote_event(&session.ctx, kind, event, &session.list_id)
                    .await
                {
                    Ok(follow_ups) => {
                        for follow_up in follow_ups {
                            let job = LocalJob::FollowUp {
                                session: Arc::clone(&session),
                                follow_up,
                            };
                            if local.send(job).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(error) => shared.report_notification_failure(&error),
                }
            }
        }
    }
    tracing::debug!("Remote notification worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_list_allocates_once() {
        let remote = MemoryRemoteStore::new();
        let first = resolve_list(&remote, "u1").await.unwrap();
        let second = resolve_list(&remote, "u1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            remote.peek(&RemotePath::list_pointer("u1").unwrap()),
            Some(Value::String(first))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_list_rejects_non_string_pointer() {
        let remote = MemoryRemoteStore::new();
        remote
            .set(&RemotePath::list_pointer("u1").unwrap(), serde_json::json!({"a": 1}))
            .await
            .unwrap();
        let error = resolve_list(&remote, "u1").await.unwrap_err();
        assert!(matches!(error, Error::Remote(RemoteError::Malformed { .. })));
    }

    #[test]
    fn start_outside_runtime_fails() {
        let sync = Synchronizer::new(
            Arc::new(crate::db::SqliteLocalStore::open_in_memory().unwrap()),
            Arc::new(MemoryRemoteStore::new()),
            Arc::new(crate::auth::LocalIdentityProvider::new()),
        );
        assert!(sync.start().is_err());
        assert!(!sync.is_running());
    }
}
