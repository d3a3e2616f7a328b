//! Call router: shard pool and public API
//!
//! The router owns a fixed pool of shards and maps every call to one of
//! them by a stable hash of its Call-ID. Public operations are thin
//! wrappers: each builds one `Work` variant and submits it to the
//! responsible shard. Synchronous operations are bounded by the configured
//! round-trip deadline; fleet-wide queries fold over all shards.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::time::timeout;

use crate::apps::AppDirectory;
use crate::config::RouterConfig;
use crate::counters::CallCounters;
use crate::error::{RouterError, RouterResult};
use crate::message::{RawSipMsg, SipClass, SipMethod};
use crate::shard::{self, ShardCommand, ShardHandle};
use crate::types::{AppId, CallId, CallKey, DialogId, MsgId, TransactionId};
use crate::work::{CallReply, InspectQuery, Origin, Work};

/// Stable shard selection: the same Call-ID always lands on the same shard
/// for a given pool size.
pub fn shard_index(call: &CallId, shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    call.as_str().hash(&mut hasher);
    (hasher.finish() as usize) % shard_count.max(1)
}

/// A dialog reference: either a resolved handle or its textual form
#[derive(Debug, Clone)]
pub enum DialogSpec {
    /// Already-resolved dialog handle
    Id(DialogId),
    /// Textual handle form, resolved on use
    Handle(String),
}

impl DialogSpec {
    /// Resolve to a dialog handle
    pub fn resolve(self) -> RouterResult<DialogId> {
        match self {
            Self::Id(dialog) => Ok(dialog),
            Self::Handle(s) => {
                DialogId::from_handle(&s).map_err(|_| RouterError::UnknownDialog(s))
            }
        }
    }
}

impl From<DialogId> for DialogSpec {
    fn from(dialog: DialogId) -> Self {
        Self::Id(dialog)
    }
}

impl From<&str> for DialogSpec {
    fn from(s: &str) -> Self {
        Self::Handle(s.to_string())
    }
}

impl From<String> for DialogSpec {
    fn from(s: String) -> Self {
        Self::Handle(s)
    }
}

/// The call router
pub struct CallRouter {
    config: Arc<RouterConfig>,
    apps: AppDirectory,
    counters: CallCounters,
    shards: Vec<ShardHandle>,
}

impl CallRouter {
    /// Start a router with the given configuration and application
    /// directory. Spawns one shard task per configured shard.
    pub fn new(config: RouterConfig, apps: AppDirectory) -> RouterResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let counters = CallCounters::new();
        let shards = (0..config.shard_count)
            .map(|pos| shard::start(pos, config.clone(), apps.clone(), counters.clone()))
            .collect();
        tracing::info!(
            "call router started: {} shards, max {} calls",
            config.shard_count,
            config.max_calls
        );
        Ok(Self {
            config,
            apps,
            counters,
            shards,
        })
    }

    /// Router configuration snapshot
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Live-call counters service
    pub fn counters(&self) -> &CallCounters {
        &self.counters
    }

    /// Application directory
    pub fn apps(&self) -> &AppDirectory {
        &self.apps
    }

    /// Shard position a call routes to
    pub fn shard_of(&self, call: &CallId) -> usize {
        shard_index(call, self.shards.len())
    }

    fn shard_for(&self, call: &CallId) -> &ShardHandle {
        &self.shards[self.shard_of(call)]
    }

    async fn call_sync(&self, app: AppId, call: CallId, work: Work) -> RouterResult<CallReply> {
        let (origin, rx) = Origin::channel();
        self.shard_for(&call).send(ShardCommand::SubmitSync {
            app,
            call,
            work,
            origin,
        })?;
        match timeout(self.config.sync_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RouterError::Internal("reply channel closed".to_string())),
            Err(_) => Err(RouterError::Timeout),
        }
    }

    fn cast_async(&self, app: AppId, call: CallId, work: Work) -> RouterResult<()> {
        self.shard_for(&call)
            .send(ShardCommand::SubmitAsync { app, call, work })
    }

    /// Send an application-prepared request. The Call-ID is taken from the
    /// request itself.
    pub async fn send_request(
        &self,
        req: RawSipMsg,
        opts: serde_json::Value,
    ) -> RouterResult<CallReply> {
        if req.class != SipClass::Request {
            return Err(RouterError::InvalidCall(
                "send_request requires a request message".to_string(),
            ));
        }
        let app = req.app.clone();
        let call = req.call.clone();
        self.call_sync(app, call, Work::SendRequest { req, opts }).await
    }

    /// Build and send a request. When `opts` carries no `call_id`, a fresh
    /// locally-unique one is generated.
    pub async fn send(
        &self,
        app: AppId,
        method: SipMethod,
        uri: impl Into<String>,
        opts: serde_json::Value,
    ) -> RouterResult<CallReply> {
        let call = opts
            .get("call_id")
            .and_then(|v| v.as_str())
            .map(CallId::new)
            .unwrap_or_else(|| CallId::random(&self.config.global_id));
        self.call_sync(
            app,
            call,
            Work::Send {
                method,
                uri: uri.into(),
                opts,
            },
        )
        .await
    }

    /// Send a request inside an established dialog
    pub async fn send_dialog(
        &self,
        spec: impl Into<DialogSpec>,
        method: SipMethod,
        opts: serde_json::Value,
    ) -> RouterResult<CallReply> {
        let dialog = spec.into().resolve()?;
        let app = dialog.app.clone();
        let call = dialog.call.clone();
        self.call_sync(app, call, Work::SendDialog { dialog, method, opts })
            .await
    }

    /// Cancel an in-flight request
    pub async fn cancel(&self, msg: MsgId) -> RouterResult<CallReply> {
        let app = msg.app.clone();
        let call = msg.call.clone();
        self.call_sync(app, call, Work::Cancel { msg }).await
    }

    /// Reply synchronously to a received request
    pub async fn sync_reply(
        &self,
        msg: MsgId,
        reply: serde_json::Value,
    ) -> RouterResult<CallReply> {
        let app = msg.app.clone();
        let call = msg.call.clone();
        self.call_sync(app, call, Work::SyncReply { msg, reply }).await
    }

    /// Deliver an application callback result to a transaction
    /// (fire-and-forget)
    pub fn app_reply(
        &self,
        transaction: TransactionId,
        reply: serde_json::Value,
    ) -> RouterResult<()> {
        let app = transaction.app.clone();
        let call = transaction.call.clone();
        self.cast_async(app, call, Work::AppReply { transaction, reply })
    }

    /// Inspect a dialog
    pub async fn apply_dialog(
        &self,
        dialog: DialogId,
        query: InspectQuery,
    ) -> RouterResult<CallReply> {
        let app = dialog.app.clone();
        let call = dialog.call.clone();
        self.call_sync(app, call, Work::ApplyDialog { dialog, query })
            .await
    }

    /// Inspect a retained message
    pub async fn apply_sipmsg(&self, msg: MsgId, query: InspectQuery) -> RouterResult<CallReply> {
        let app = msg.app.clone();
        let call = msg.call.clone();
        self.call_sync(app, call, Work::ApplySipMsg { msg, query }).await
    }

    /// Inspect a transaction
    pub async fn apply_transaction(
        &self,
        transaction: TransactionId,
        query: InspectQuery,
    ) -> RouterResult<CallReply> {
        let app = transaction.app.clone();
        let call = transaction.call.clone();
        self.call_sync(app, call, Work::ApplyTransaction { transaction, query })
            .await
    }

    /// Tear down a dialog (fire-and-forget)
    pub fn stop_dialog(&self, spec: impl Into<DialogSpec>) -> RouterResult<()> {
        let dialog = spec.into().resolve()?;
        let app = dialog.app.clone();
        let call = dialog.call.clone();
        self.cast_async(app, call, Work::StopDialog { dialog })
    }

    /// Request orderly shutdown of one call worker
    pub fn stop_call(&self, app: AppId, call: CallId) -> RouterResult<()> {
        let shard = self.shard_for(&call);
        shard.send(ShardCommand::StopCall { app, call })
    }

    /// Hand a raw message to the router and wait for the worker's answer.
    /// Requests may create a worker; responses are delivered only to
    /// existing workers and an unmatched response is dropped.
    pub async fn incoming_sync(&self, msg: RawSipMsg) -> RouterResult<CallReply> {
        let (origin, rx) = Origin::channel();
        let shard = self.shard_for(&msg.call);
        shard.send(ShardCommand::Incoming { msg, origin })?;
        match timeout(self.config.sync_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RouterError::Internal("reply channel closed".to_string())),
            Err(_) => Err(RouterError::Timeout),
        }
    }

    /// Hand a raw message to the router without waiting for the worker's
    /// answer. Classification is the same as `incoming_sync`: a request
    /// may create a worker, a response is delivered only to an existing
    /// one. Only the caller's waiting differs; any reply is discarded.
    pub fn incoming_async(&self, msg: RawSipMsg) -> RouterResult<()> {
        let (origin, _rx) = Origin::channel();
        let shard = self.shard_for(&msg.call);
        shard.send(ShardCommand::Incoming { msg, origin })
    }

    /// Every registered call across all shards
    pub async fn get_all_calls(&self) -> RouterResult<Vec<CallKey>> {
        let mut calls = Vec::new();
        for shard in &self.shards {
            calls.extend(shard.calls().await?);
        }
        Ok(calls)
    }

    /// Dialogs of one call
    pub async fn get_dialogs(&self, app: AppId, call: CallId) -> RouterResult<Vec<DialogId>> {
        match self.call_sync(app, call, Work::GetDialogs).await? {
            CallReply::Dialogs(dialogs) => Ok(dialogs),
            other => Err(unexpected_reply("dialogs", &other)),
        }
    }

    /// Dialogs across every call
    pub async fn get_all_dialogs(&self) -> RouterResult<Vec<DialogId>> {
        let mut dialogs = Vec::new();
        for key in self.get_all_calls().await? {
            dialogs.extend(self.get_dialogs(key.app, key.call).await?);
        }
        Ok(dialogs)
    }

    /// Retained messages of one call
    pub async fn get_sipmsgs(&self, app: AppId, call: CallId) -> RouterResult<Vec<MsgId>> {
        match self.call_sync(app, call, Work::GetSipMsgs).await? {
            CallReply::SipMsgs(msgs) => Ok(msgs),
            other => Err(unexpected_reply("sipmsgs", &other)),
        }
    }

    /// Retained messages across every call
    pub async fn get_all_sipmsgs(&self) -> RouterResult<Vec<MsgId>> {
        let mut msgs = Vec::new();
        for key in self.get_all_calls().await? {
            msgs.extend(self.get_sipmsgs(key.app, key.call).await?);
        }
        Ok(msgs)
    }

    /// Transactions of one call
    pub async fn get_transactions(
        &self,
        app: AppId,
        call: CallId,
    ) -> RouterResult<Vec<TransactionId>> {
        match self.call_sync(app, call, Work::GetTransactions).await? {
            CallReply::Transactions(transactions) => Ok(transactions),
            other => Err(unexpected_reply("transactions", &other)),
        }
    }

    /// Transactions across every call
    pub async fn get_all_transactions(&self) -> RouterResult<Vec<TransactionId>> {
        let mut transactions = Vec::new();
        for key in self.get_all_calls().await? {
            transactions.extend(self.get_transactions(key.app, key.call).await?);
        }
        Ok(transactions)
    }

    /// Opaque state snapshot of one call
    pub async fn get_data(&self, app: AppId, call: CallId) -> RouterResult<serde_json::Value> {
        match self.call_sync(app, call, Work::GetData).await? {
            CallReply::Data(data) => Ok(data),
            other => Err(unexpected_reply("data", &other)),
        }
    }

    /// State snapshots across every call
    pub async fn get_all_data(&self) -> RouterResult<Vec<(CallKey, serde_json::Value)>> {
        let mut all = Vec::new();
        for key in self.get_all_calls().await? {
            let data = self.get_data(key.app.clone(), key.call.clone()).await?;
            all.push((key, data));
        }
        Ok(all)
    }

    /// Unacknowledged sync handoffs across all shards
    pub async fn pending_work(&self) -> RouterResult<usize> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.pending_work().await?;
        }
        Ok(total)
    }

    /// Undequeued worker-mailbox messages across all shards
    pub async fn pending_msgs(&self) -> RouterResult<usize> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.pending_msgs().await?;
        }
        Ok(total)
    }

    /// Stop every live worker; returns how many were asked to stop
    pub async fn clear_calls(&self) -> RouterResult<usize> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.clear_calls().await?;
        }
        Ok(total)
    }
}

fn unexpected_reply(wanted: &str, got: &CallReply) -> RouterError {
    RouterError::Internal(format!("expected {} reply, got {:?}", wanted, got))
}
