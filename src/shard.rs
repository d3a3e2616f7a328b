//! Router shard
//!
//! A shard owns the registry, the pending-work table, and the app-options
//! cache for every call that hashes to it. All state lives inside one
//! dedicated task; every operation arrives as a mailbox command, so
//! mutation is serialized without locks. Delivery to workers never blocks
//! the shard.
//!
//! Handles:
//! - Sync dispatch with per-work monitors and the replay-on-race protocol
//! - Async dispatch (deliver-if-present, never creates workers)
//! - Admission (global and per-application live-call caps)
//! - Worker DOWN processing: registry cleanup plus pending replay
//! - Restart with empty state when the shard loop itself panics

use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::apps::{AppDirectory, AppOpts};
use crate::config::RouterConfig;
use crate::counters::CallCounters;
use crate::error::{RouterError, RouterResult};
use crate::message::{RawSipMsg, SipClass};
use crate::registry::CallRegistry;
use crate::types::{AppId, CallId, CallKey};
use crate::work::{CallReply, Origin, Work};
use crate::worker::{self, DownReason, MonitorRef, WorkerId, WorkerMsg};

/// Sending half of a shard mailbox
pub type ShardSender = mpsc::UnboundedSender<ShardCommand>;

/// Commands accepted by a shard
pub enum ShardCommand {
    /// Dispatch synchronous work, creating the worker if needed
    SubmitSync {
        app: AppId,
        call: CallId,
        work: Work,
        origin: Origin,
    },
    /// Dispatch fire-and-forget work to an existing worker
    SubmitAsync {
        app: AppId,
        call: CallId,
        work: Work,
    },
    /// Classify and dispatch a raw message from the transport
    Incoming { msg: RawSipMsg, origin: Origin },
    /// Worker accepted a synchronous handoff
    SyncAck(MonitorRef),
    /// A worker task ended
    WorkerDown { worker: WorkerId, reason: DownReason },
    /// Ask one worker to shut down in an orderly fashion
    StopCall { app: AppId, call: CallId },
    /// Registered calls on this shard
    GetCalls { reply: oneshot::Sender<Vec<CallKey>> },
    /// Unacknowledged sync handoffs on this shard
    PendingWork { reply: oneshot::Sender<usize> },
    /// Undequeued worker-mailbox messages on this shard
    PendingMsgs { reply: oneshot::Sender<usize> },
    /// Stop every worker on this shard; replies with the number stopped
    ClearCalls { reply: oneshot::Sender<usize> },
}

/// Handle used by the router to address one shard
#[derive(Clone)]
pub struct ShardHandle {
    /// Shard position in the pool
    pub pos: usize,
    tx: ShardSender,
}

impl ShardHandle {
    /// Submit a command to the shard
    pub fn send(&self, cmd: ShardCommand) -> RouterResult<()> {
        self.tx
            .send(cmd)
            .map_err(|_| RouterError::Internal(format!("router-{} mailbox closed", self.pos)))
    }

    /// Registered calls on this shard
    pub async fn calls(&self) -> RouterResult<Vec<CallKey>> {
        let (reply, rx) = oneshot::channel();
        self.send(ShardCommand::GetCalls { reply })?;
        rx.await
            .map_err(|_| RouterError::Internal("shard query dropped".to_string()))
    }

    /// Unacknowledged sync handoffs on this shard
    pub async fn pending_work(&self) -> RouterResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(ShardCommand::PendingWork { reply })?;
        rx.await
            .map_err(|_| RouterError::Internal("shard query dropped".to_string()))
    }

    /// Undequeued worker-mailbox messages on this shard
    pub async fn pending_msgs(&self) -> RouterResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(ShardCommand::PendingMsgs { reply })?;
        rx.await
            .map_err(|_| RouterError::Internal("shard query dropped".to_string()))
    }

    /// Stop every worker on this shard
    pub async fn clear_calls(&self) -> RouterResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(ShardCommand::ClearCalls { reply })?;
        rx.await
            .map_err(|_| RouterError::Internal("shard query dropped".to_string()))
    }
}

/// Start a shard and its supervisor
pub(crate) fn start(
    pos: usize,
    config: Arc<RouterConfig>,
    apps: AppDirectory,
    counters: CallCounters,
) -> ShardHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ShardHandle { pos, tx: tx.clone() };
    tokio::spawn(supervise(pos, config, apps, counters, tx, rx));
    handle
}

/// Run the shard until its mailbox closes, restarting with empty state if
/// the command loop panics. Worker crashes never reach this path; they
/// arrive as `WorkerDown` commands instead.
async fn supervise(
    pos: usize,
    config: Arc<RouterConfig>,
    apps: AppDirectory,
    counters: CallCounters,
    tx: ShardSender,
    mut rx: mpsc::UnboundedReceiver<ShardCommand>,
) {
    loop {
        let mut shard = RouterShard::new(pos, config.clone(), apps.clone(), counters.clone(), tx.clone());
        match AssertUnwindSafe(shard.serve(&mut rx)).catch_unwind().await {
            Ok(()) => break,
            Err(_) => {
                tracing::error!("router-{}: shard state lost to a panic, restarting", pos);
            }
        }
    }
}

struct PendingWork {
    app: AppId,
    call: CallId,
    worker: WorkerId,
    work: Work,
    origin: Origin,
}

/// One router shard's serialized state
struct RouterShard {
    pos: usize,
    name: String,
    config: Arc<RouterConfig>,
    apps: AppDirectory,
    counters: CallCounters,
    /// Self-address handed to spawned workers and their monitors
    tx: ShardSender,
    registry: CallRegistry,
    /// Sync handoffs not yet acknowledged, keyed by per-work monitor
    pending: HashMap<MonitorRef, PendingWork>,
    /// Memoized app options. Never invalidated: option changes require a
    /// router restart.
    app_opts: HashMap<AppId, Arc<AppOpts>>,
    worker_seq: u64,
    monitor_seq: u64,
}

impl RouterShard {
    fn new(
        pos: usize,
        config: Arc<RouterConfig>,
        apps: AppDirectory,
        counters: CallCounters,
        tx: ShardSender,
    ) -> Self {
        Self {
            pos,
            name: format!("router-{}", pos),
            config,
            apps,
            counters,
            tx,
            registry: CallRegistry::new(),
            pending: HashMap::new(),
            app_opts: HashMap::new(),
            worker_seq: 0,
            monitor_seq: 0,
        }
    }

    async fn serve(&mut self, rx: &mut mpsc::UnboundedReceiver<ShardCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd);
        }
    }

    fn handle(&mut self, cmd: ShardCommand) {
        match cmd {
            ShardCommand::SubmitSync {
                app,
                call,
                work,
                origin,
            } => self.dispatch_sync(app, call, work, origin),
            ShardCommand::SubmitAsync { app, call, work } => self.dispatch_async(app, call, work),
            ShardCommand::Incoming { msg, origin } => self.ingest_incoming(msg, origin),
            ShardCommand::SyncAck(monitor) => {
                // Demonitor: from here the worker owns the work item
                self.pending.remove(&monitor);
            }
            ShardCommand::WorkerDown { worker, reason } => self.handle_down(worker, reason),
            ShardCommand::StopCall { app, call } => {
                let key = CallKey::new(app, call);
                if let Some(handle) = self.registry.lookup(&key) {
                    handle.deliver(WorkerMsg::Stop);
                }
            }
            ShardCommand::GetCalls { reply } => {
                let _ = reply.send(self.registry.keys().cloned().collect());
            }
            ShardCommand::PendingWork { reply } => {
                let _ = reply.send(self.pending.len());
            }
            ShardCommand::PendingMsgs { reply } => {
                let _ = reply.send(self.registry.workers().map(|w| w.queued_msgs()).sum());
            }
            ShardCommand::ClearCalls { reply } => {
                let mut stopped = 0;
                for handle in self.registry.workers() {
                    if handle.deliver(WorkerMsg::Stop) {
                        stopped += 1;
                    }
                }
                let _ = reply.send(stopped);
            }
        }
    }

    /// Classify a raw message: requests may create workers, responses are
    /// only delivered to existing ones.
    fn ingest_incoming(&mut self, msg: RawSipMsg, origin: Origin) {
        let app = msg.app.clone();
        let call = msg.call.clone();
        match msg.class {
            SipClass::Request => self.dispatch_sync(app, call, Work::Incoming { msg }, origin),
            SipClass::Response => {
                self.dispatch_async(app, call, Work::Incoming { msg });
                origin.respond(Ok(CallReply::Ack));
            }
        }
    }

    fn dispatch_sync(&mut self, app: AppId, call: CallId, work: Work, origin: Origin) {
        let key = CallKey::new(app.clone(), call.clone());
        let handle = match self.registry.lookup(&key) {
            Some(handle) => handle.clone(),
            None => match self.ensure_worker(&app, &call) {
                Ok(handle) => handle,
                Err(e) => {
                    origin.respond(Err(e));
                    return;
                }
            },
        };

        let monitor = self.next_monitor();
        // The pending entry is the per-work monitor: it outlives the
        // handoff until the worker acks, and handle_down resurrects it if
        // the worker dies first.
        self.pending.insert(
            monitor,
            PendingWork {
                app,
                call,
                worker: handle.id,
                work: work.clone(),
                origin: origin.clone(),
            },
        );
        let delivered = handle.deliver(WorkerMsg::SyncWork {
            monitor,
            reply_to: self.tx.clone(),
            work,
            origin,
        });
        if !delivered {
            // The worker is already gone; its DOWN is in flight and will
            // replay this entry.
            tracing::debug!("{}: sync work raced a dead worker on {}", self.name, key);
        }
    }

    fn dispatch_async(&mut self, app: AppId, call: CallId, work: Work) {
        let key = CallKey::new(app, call);
        match self.registry.lookup(&key) {
            Some(handle) => {
                if !handle.deliver(WorkerMsg::AsyncWork { work }) {
                    tracing::debug!("{}: async work raced a dead worker on {}", self.name, key);
                }
            }
            None => {
                tracing::info!(
                    "{}: dropping async {} for unknown call {}",
                    self.name,
                    work.label(),
                    key
                );
            }
        }
    }

    /// Admission and worker creation
    fn ensure_worker(&mut self, app: &AppId, call: &CallId) -> RouterResult<worker::WorkerHandle> {
        if self.counters.live_calls() >= self.config.max_calls {
            tracing::warn!("{}: admission denied for {}: live-call limit", self.name, app);
            return Err(RouterError::TooManyCalls);
        }
        let opts = self.get_app_opts(app)?;
        if let Some(cap) = opts.max_calls {
            if self.counters.app_calls(app) >= cap {
                tracing::warn!("{}: admission denied for {}: app limit {}", self.name, app, cap);
                return Err(RouterError::TooManyCalls);
            }
        }

        let id = self.next_worker_id();
        let key = CallKey::new(app.clone(), call.clone());
        let handle = worker::spawn(id, key.clone(), opts, self.config.clone(), self.tx.clone());
        self.registry.insert(key.clone(), handle.clone());
        self.counters.incr(app);
        tracing::debug!("{}: spawned {} for {}", self.name, id, key);
        Ok(handle)
    }

    /// Resolve app options through the shard-local memo. Entries are added
    /// on first use and kept for the shard's lifetime.
    fn get_app_opts(&mut self, app: &AppId) -> RouterResult<Arc<AppOpts>> {
        if let Some(opts) = self.app_opts.get(app) {
            return Ok(opts.clone());
        }
        let opts = self.apps.get_app_opts(app)?;
        self.app_opts.insert(app.clone(), opts.clone());
        Ok(opts)
    }

    /// Process a worker DOWN: clean both registry directions, then replay
    /// every sync handoff the worker never acknowledged. Safe to run in any
    /// order relative to late acks; both paths are idempotent.
    fn handle_down(&mut self, worker: WorkerId, reason: DownReason) {
        if let Some((key, _)) = self.registry.remove_by_worker(worker) {
            self.counters.decr(&key.app);
            match &reason {
                DownReason::Normal => {
                    tracing::debug!("{}: {} for {} exited", self.name, worker, key);
                }
                DownReason::Crashed(cause) => {
                    tracing::warn!("{}: {} for {} crashed: {}", self.name, worker, key, cause);
                }
            }
        }

        let orphaned: Vec<MonitorRef> = self
            .pending
            .iter()
            .filter(|(_, p)| p.worker == worker)
            .map(|(monitor, _)| *monitor)
            .collect();
        for monitor in orphaned {
            if let Some(p) = self.pending.remove(&monitor) {
                tracing::debug!(
                    "{}: replaying {} for {}/{} after {} died",
                    self.name,
                    p.work.label(),
                    p.app,
                    p.call,
                    worker
                );
                // ensure_worker transparently creates the successor; if
                // admission now fails, the error reaches the origin.
                self.dispatch_sync(p.app, p.call, p.work, p.origin);
            }
        }
    }

    fn next_worker_id(&mut self) -> WorkerId {
        self.worker_seq += 1;
        // Shard position in the high bits keeps identities unique pool-wide
        WorkerId(((self.pos as u64) << 48) | self.worker_seq)
    }

    fn next_monitor(&mut self) -> MonitorRef {
        self.monitor_seq += 1;
        MonitorRef(self.monitor_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_setup(max_calls: usize) -> (RouterShard, mpsc::UnboundedReceiver<ShardCommand>) {
        let config = RouterConfig {
            shard_count: 1,
            max_calls,
            ..RouterConfig::default()
        };
        let apps = AppDirectory::new();
        apps.register(AppId::new("app1"), AppOpts::new("App One"));
        let (tx, rx) = mpsc::unbounded_channel();
        let shard = RouterShard::new(0, Arc::new(config), apps, CallCounters::new(), tx);
        (shard, rx)
    }

    #[tokio::test]
    async fn test_ensure_worker_registers_and_counts() {
        // Arrange
        let (mut shard, _rx) = test_setup(10);

        // Act
        let handle = shard
            .ensure_worker(&AppId::new("app1"), &CallId::new("c1"))
            .unwrap();

        // Assert
        assert!(shard.registry.contains_worker(handle.id));
        assert_eq!(shard.counters.live_calls(), 1);
    }

    #[tokio::test]
    async fn test_admission_denied_leaves_registry_unchanged() {
        // Arrange: limit of one, already reached
        let (mut shard, _rx) = test_setup(1);
        shard
            .ensure_worker(&AppId::new("app1"), &CallId::new("c1"))
            .unwrap();

        // Act
        let err = shard
            .ensure_worker(&AppId::new("app1"), &CallId::new("c2"))
            .unwrap_err();

        // Assert
        assert!(matches!(err, RouterError::TooManyCalls));
        assert_eq!(shard.registry.len(), 1);
        assert_eq!(shard.counters.live_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_app_rejected_before_spawn() {
        let (mut shard, _rx) = test_setup(10);
        let err = shard
            .ensure_worker(&AppId::new("ghost"), &CallId::new("c1"))
            .unwrap_err();
        assert!(matches!(err, RouterError::UnknownSipApp(_)));
        assert!(shard.registry.is_empty());
        assert_eq!(shard.counters.live_calls(), 0);
    }

    #[tokio::test]
    async fn test_app_opts_memoized_per_shard() {
        // Arrange
        let (mut shard, _rx) = test_setup(10);
        let app = AppId::new("app1");

        // Act: two resolutions through the shard memo
        let first = shard.get_app_opts(&app).unwrap();
        let second = shard.get_app_opts(&app).unwrap();

        // Assert: one directory lookup, same options object
        assert_eq!(shard.apps.lookup_count(), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_per_app_cap_enforced() {
        let (mut shard, _rx) = test_setup(100);
        shard
            .apps
            .register(AppId::new("small"), AppOpts::new("Small").with_max_calls(1));

        shard
            .ensure_worker(&AppId::new("small"), &CallId::new("c1"))
            .unwrap();
        let err = shard
            .ensure_worker(&AppId::new("small"), &CallId::new("c2"))
            .unwrap_err();

        assert!(matches!(err, RouterError::TooManyCalls));
    }
}
