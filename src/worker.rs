//! Call worker actor
//!
//! One worker owns one call. It processes work items from its mailbox in
//! arrival order, acknowledges synchronous handoffs back to its shard, and
//! exits on its own when the call state drains or when nothing has happened
//! for the transaction timeout. Task exit, normal or panicked, is converted
//! into a DOWN notification for the owning shard by a join watcher.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::apps::AppOpts;
use crate::config::RouterConfig;
use crate::error::{RouterError, RouterResult};
use crate::message::{RawSipMsg, SipClass, SipMethod};
use crate::shard::{ShardCommand, ShardSender};
use crate::types::{CallKey, DialogId, MsgId, TransactionId};
use crate::work::{CallReply, InspectQuery, Origin, Work};

/// Worker identity, unique for the lifetime of the worker and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Per-work monitor reference, allocated by the shard for each sync handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorRef(pub u64);

impl fmt::Display for MonitorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mref-{}", self.0)
    }
}

/// Why a worker left the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownReason {
    /// Orderly exit: call finished, stop requested, or inactivity
    Normal,
    /// The worker task panicked or was aborted
    Crashed(String),
}

/// Messages accepted by a call worker
#[derive(Debug)]
pub enum WorkerMsg {
    /// Synchronous work: acknowledge to `reply_to` on acceptance, then
    /// answer `origin` with the result
    SyncWork {
        monitor: MonitorRef,
        reply_to: ShardSender,
        work: Work,
        origin: Origin,
    },
    /// Fire-and-forget work
    AsyncWork { work: Work },
    /// Request orderly shutdown
    Stop,
}

/// Handle to a live call worker, kept in the shard registry
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// Registry identity
    pub id: WorkerId,
    /// The call this worker owns
    pub key: CallKey,
    /// Spawn timestamp
    pub started_at: DateTime<Utc>,
    tx: mpsc::UnboundedSender<WorkerMsg>,
    queued: Arc<AtomicUsize>,
}

impl WorkerHandle {
    /// Deliver a message without blocking. Returns false when the worker
    /// has already left and the message was dropped.
    pub fn deliver(&self, msg: WorkerMsg) -> bool {
        self.queued.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(msg).is_ok() {
            true
        } else {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            false
        }
    }

    /// Messages delivered but not yet dequeued by the worker
    pub fn queued_msgs(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Handle not bound to any task (registry unit tests)
    #[cfg(test)]
    pub(crate) fn detached(id: WorkerId, key: CallKey) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self {
            id,
            key,
            started_at: Utc::now(),
            tx,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Spawn a worker for a call and register its join watcher.
///
/// The watcher is the long-lived monitor: it posts `WorkerDown` into the
/// owning shard's mailbox exactly once, after the worker task has ended.
pub(crate) fn spawn(
    id: WorkerId,
    key: CallKey,
    opts: Arc<AppOpts>,
    config: Arc<RouterConfig>,
    shard: ShardSender,
) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued = Arc::new(AtomicUsize::new(0));
    let handle = WorkerHandle {
        id,
        key: key.clone(),
        started_at: Utc::now(),
        tx,
        queued: queued.clone(),
    };

    let data = CallData::new(key, opts);
    let join = tokio::spawn(run(rx, queued, data, config));

    tokio::spawn(async move {
        let reason = match join.await {
            Ok(()) => DownReason::Normal,
            Err(e) if e.is_panic() => DownReason::Crashed("worker panicked".to_string()),
            Err(e) => DownReason::Crashed(e.to_string()),
        };
        let _ = shard.send(ShardCommand::WorkerDown { worker: id, reason });
    });

    handle
}

/// Worker mailbox loop
async fn run(
    mut rx: mpsc::UnboundedReceiver<WorkerMsg>,
    queued: Arc<AtomicUsize>,
    mut data: CallData,
    config: Arc<RouterConfig>,
) {
    let idle = config.transaction_timeout();
    let hard_deadline = Instant::now() + config.max_dialog_time();
    let mut idle_deadline = Instant::now() + idle;

    loop {
        let deadline = idle_deadline.min(hard_deadline);
        let msg = tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = sleep_until(deadline) => {
                tracing::debug!("call {}: no activity, worker exiting", data.key);
                break;
            }
        };

        queued.fetch_sub(1, Ordering::Relaxed);
        idle_deadline = Instant::now() + idle;

        match msg {
            WorkerMsg::SyncWork {
                monitor,
                reply_to,
                work,
                origin,
            } => {
                // Acknowledge acceptance first; from this point the worker
                // owns the work item and the shard will not replay it.
                let _ = reply_to.send(ShardCommand::SyncAck(monitor));
                let result = data.execute(&work);
                origin.respond(result);
            }
            WorkerMsg::AsyncWork { work } => {
                if let Err(e) = data.execute(&work) {
                    tracing::debug!("call {}: async {} dropped: {}", data.key, work.label(), e);
                }
            }
            WorkerMsg::Stop => {
                tracing::debug!("call {}: stop requested", data.key);
                break;
            }
        }

        if data.is_finished() {
            tracing::debug!("call {}: state drained, worker exiting", data.key);
            break;
        }
    }
}

/// Transaction role within the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransRole {
    Uac,
    Uas,
}

#[derive(Debug, Clone)]
struct TransactionEntry {
    msg: MsgId,
    method: SipMethod,
    role: TransRole,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct DialogEntry {
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct MsgEntry {
    method: SipMethod,
    class: SipClass,
    received_at: DateTime<Utc>,
}

/// Per-call state owned exclusively by the worker task.
///
/// This is the minimal state machine the router contract needs: open
/// transactions, established dialogs, and the retained message log. The
/// full transaction/dialog engine lives elsewhere in the stack.
struct CallData {
    key: CallKey,
    opts: Arc<AppOpts>,
    created_at: DateTime<Utc>,
    transactions: HashMap<TransactionId, TransactionEntry>,
    dialogs: HashMap<DialogId, DialogEntry>,
    msgs: HashMap<MsgId, MsgEntry>,
    history: Vec<String>,
    processed: u64,
}

impl CallData {
    fn new(key: CallKey, opts: Arc<AppOpts>) -> Self {
        Self {
            key,
            opts,
            created_at: Utc::now(),
            transactions: HashMap::new(),
            dialogs: HashMap::new(),
            msgs: HashMap::new(),
            history: Vec::new(),
            processed: 0,
        }
    }

    /// The call is done when nothing remains open after at least one work
    /// item was processed. The retained message log does not keep a call
    /// alive.
    fn is_finished(&self) -> bool {
        self.processed > 0 && self.transactions.is_empty() && self.dialogs.is_empty()
    }

    fn execute(&mut self, work: &Work) -> RouterResult<CallReply> {
        self.processed += 1;
        self.history.push(work.label().to_string());
        match work {
            Work::Send { method, .. } => Ok(self.open_client_transaction(method.clone())),
            Work::SendRequest { req, .. } => Ok(self.open_client_transaction(req.method.clone())),
            Work::SendDialog { dialog, method, .. } => {
                if !self.dialogs.contains_key(dialog) {
                    return Err(RouterError::UnknownDialog(dialog.to_string()));
                }
                let msg = self.record_msg(method.clone(), SipClass::Request);
                let transaction = self.open_transaction(msg.clone(), method.clone(), TransRole::Uac);
                Ok(CallReply::Sent {
                    msg,
                    transaction,
                    dialog: Some(dialog.clone()),
                })
            }
            Work::Cancel { msg } => {
                let target = self
                    .transactions
                    .iter()
                    .find(|(_, t)| t.msg == *msg && t.role == TransRole::Uac)
                    .map(|(id, _)| id.clone())
                    .ok_or_else(|| RouterError::UnknownRequest(msg.to_string()))?;
                self.transactions.remove(&target);
                Ok(CallReply::Ack)
            }
            Work::SyncReply { msg, .. } => {
                if !self.msgs.contains_key(msg) {
                    return Err(RouterError::UnknownSipMsg(msg.to_string()));
                }
                self.transactions.retain(|_, t| t.msg != *msg);
                Ok(CallReply::Ack)
            }
            Work::AppReply { transaction, .. } => {
                self.transactions
                    .remove(transaction)
                    .ok_or_else(|| RouterError::UnknownTransaction(transaction.to_string()))?;
                Ok(CallReply::Ack)
            }
            Work::ApplyDialog { dialog, query } => {
                let entry = self
                    .dialogs
                    .get(dialog)
                    .ok_or_else(|| RouterError::UnknownDialog(dialog.to_string()))?;
                Ok(CallReply::Snapshot(self.dialog_snapshot(dialog, entry, *query)))
            }
            Work::ApplySipMsg { msg, query } => {
                let entry = self
                    .msgs
                    .get(msg)
                    .ok_or_else(|| RouterError::UnknownSipMsg(msg.to_string()))?;
                Ok(CallReply::Snapshot(json!({
                    "msg": msg.to_string(),
                    "query": format!("{:?}", query),
                    "method": entry.method.to_string(),
                    "class": entry.class,
                    "received_at": entry.received_at,
                })))
            }
            Work::ApplyTransaction { transaction, query } => {
                let entry = self
                    .transactions
                    .get(transaction)
                    .ok_or_else(|| RouterError::UnknownTransaction(transaction.to_string()))?;
                Ok(CallReply::Snapshot(json!({
                    "transaction": transaction.to_string(),
                    "query": format!("{:?}", query),
                    "method": entry.method.to_string(),
                    "role": format!("{:?}", entry.role),
                    "state": "proceeding",
                    "created_at": entry.created_at,
                })))
            }
            Work::StopDialog { dialog } => {
                self.dialogs
                    .remove(dialog)
                    .ok_or_else(|| RouterError::UnknownDialog(dialog.to_string()))?;
                Ok(CallReply::Ack)
            }
            Work::Incoming { msg } => self.process_incoming(msg),
            Work::GetDialogs => Ok(CallReply::Dialogs(self.dialogs.keys().cloned().collect())),
            Work::GetSipMsgs => Ok(CallReply::SipMsgs(self.msgs.keys().cloned().collect())),
            Work::GetTransactions => Ok(CallReply::Transactions(
                self.transactions.keys().cloned().collect(),
            )),
            Work::GetData => Ok(CallReply::Data(self.snapshot())),
        }
    }

    fn open_client_transaction(&mut self, method: SipMethod) -> CallReply {
        let msg = self.record_msg(method.clone(), SipClass::Request);
        let transaction = self.open_transaction(msg.clone(), method.clone(), TransRole::Uac);
        let dialog = method.creates_dialog().then(|| {
            let dialog = DialogId::generate(self.key.app.clone(), self.key.call.clone());
            self.dialogs.insert(dialog.clone(), DialogEntry { created_at: Utc::now() });
            dialog
        });
        CallReply::Sent {
            msg,
            transaction,
            dialog,
        }
    }

    fn process_incoming(&mut self, raw: &RawSipMsg) -> RouterResult<CallReply> {
        match raw.class {
            SipClass::Request => {
                let msg = self.record_msg(raw.method.clone(), SipClass::Request);
                if raw.method == SipMethod::Bye {
                    // BYE terminates every dialog on the call
                    self.dialogs.clear();
                } else if raw.method.creates_dialog() {
                    let dialog = DialogId::generate(self.key.app.clone(), self.key.call.clone());
                    self.dialogs.insert(dialog.clone(), DialogEntry { created_at: Utc::now() });
                }
                let transaction = if raw.method == SipMethod::Ack {
                    // ACK is absorbed by the INVITE transaction; none of its own
                    None
                } else {
                    Some(self.open_transaction(msg.clone(), raw.method.clone(), TransRole::Uas))
                };
                Ok(match transaction {
                    Some(transaction) => CallReply::Sent {
                        msg,
                        transaction,
                        dialog: None,
                    },
                    None => CallReply::Ack,
                })
            }
            SipClass::Response => {
                let target = self
                    .transactions
                    .iter()
                    .find(|(_, t)| t.role == TransRole::Uac && t.method == raw.method)
                    .map(|(id, _)| id.clone())
                    .ok_or_else(|| {
                        RouterError::UnknownTransaction(format!(
                            "no client transaction for {} response on {}",
                            raw.method, self.key
                        ))
                    })?;
                self.record_msg(raw.method.clone(), SipClass::Response);
                // Final responses complete the transaction, provisionals keep it
                if raw.status.unwrap_or(200) >= 200 {
                    self.transactions.remove(&target);
                }
                Ok(CallReply::Ack)
            }
        }
    }

    fn record_msg(&mut self, method: SipMethod, class: SipClass) -> MsgId {
        let msg = MsgId::generate(self.key.app.clone(), self.key.call.clone());
        self.msgs.insert(
            msg.clone(),
            MsgEntry {
                method,
                class,
                received_at: Utc::now(),
            },
        );
        msg
    }

    fn open_transaction(&mut self, msg: MsgId, method: SipMethod, role: TransRole) -> TransactionId {
        let transaction = TransactionId::generate(self.key.app.clone(), self.key.call.clone());
        self.transactions.insert(
            transaction.clone(),
            TransactionEntry {
                msg,
                method,
                role,
                created_at: Utc::now(),
            },
        );
        transaction
    }

    fn dialog_snapshot(
        &self,
        dialog: &DialogId,
        entry: &DialogEntry,
        query: InspectQuery,
    ) -> serde_json::Value {
        json!({
            "dialog": dialog.to_string(),
            "query": format!("{:?}", query),
            "state": "confirmed",
            "created_at": entry.created_at,
        })
    }

    fn snapshot(&self) -> serde_json::Value {
        json!({
            "app": self.key.app.to_string(),
            "call": self.key.call.to_string(),
            "app_name": self.opts.name,
            "created_at": self.created_at,
            "processed": self.processed,
            "transactions": self.transactions.len(),
            "dialogs": self.dialogs.len(),
            "msgs": self.msgs.len(),
            "history": self.history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AppId, CallId};

    fn call_data() -> CallData {
        CallData::new(
            CallKey::new(AppId::new("app1"), CallId::new("c1")),
            Arc::new(AppOpts::new("App One")),
        )
    }

    #[test]
    fn test_send_opens_transaction_and_dialog() {
        // Arrange
        let mut data = call_data();

        // Act
        let reply = data
            .execute(&Work::Send {
                method: SipMethod::Invite,
                uri: "sip:bob@example.com".to_string(),
                opts: json!({}),
            })
            .unwrap();

        // Assert
        match reply {
            CallReply::Sent { dialog, .. } => assert!(dialog.is_some()),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(data.transactions.len(), 1);
        assert_eq!(data.dialogs.len(), 1);
        assert!(!data.is_finished());
    }

    #[test]
    fn test_final_response_completes_transaction() {
        let mut data = call_data();
        data.execute(&Work::Send {
            method: SipMethod::Options,
            uri: "sip:bob@example.com".to_string(),
            opts: json!({}),
        })
        .unwrap();

        let response = RawSipMsg::response(
            AppId::new("app1"),
            CallId::new("c1"),
            SipMethod::Options,
            200,
            json!({}),
        );
        data.execute(&Work::Incoming { msg: response }).unwrap();

        // OPTIONS opens no dialog, so the call is now drained
        assert!(data.transactions.is_empty());
        assert!(data.is_finished());
    }

    #[test]
    fn test_provisional_response_keeps_transaction() {
        let mut data = call_data();
        data.execute(&Work::Send {
            method: SipMethod::Invite,
            uri: "sip:bob@example.com".to_string(),
            opts: json!({}),
        })
        .unwrap();

        let ringing = RawSipMsg::response(
            AppId::new("app1"),
            CallId::new("c1"),
            SipMethod::Invite,
            180,
            json!({}),
        );
        data.execute(&Work::Incoming { msg: ringing }).unwrap();

        assert_eq!(data.transactions.len(), 1);
    }

    #[test]
    fn test_unmatched_response_is_an_error() {
        let mut data = call_data();
        let response = RawSipMsg::response(
            AppId::new("app1"),
            CallId::new("c1"),
            SipMethod::Invite,
            200,
            json!({}),
        );
        let err = data.execute(&Work::Incoming { msg: response }).unwrap_err();
        assert!(matches!(err, RouterError::UnknownTransaction(_)));
    }

    #[test]
    fn test_cancel_unknown_request_rejected() {
        let mut data = call_data();
        let msg = MsgId::generate(AppId::new("app1"), CallId::new("c1"));
        let err = data.execute(&Work::Cancel { msg }).unwrap_err();
        assert!(matches!(err, RouterError::UnknownRequest(_)));
    }

    #[test]
    fn test_stop_dialog_drains_call() {
        let mut data = call_data();
        let reply = data
            .execute(&Work::Send {
                method: SipMethod::Subscribe,
                uri: "sip:events@example.com".to_string(),
                opts: json!({}),
            })
            .unwrap();
        let dialog = match reply {
            CallReply::Sent { dialog: Some(d), .. } => d,
            other => panic!("unexpected reply: {:?}", other),
        };

        // Complete the transaction, then drop the dialog
        let response = RawSipMsg::response(
            AppId::new("app1"),
            CallId::new("c1"),
            SipMethod::Subscribe,
            200,
            json!({}),
        );
        data.execute(&Work::Incoming { msg: response }).unwrap();
        data.execute(&Work::StopDialog { dialog }).unwrap();

        assert!(data.is_finished());
    }

    #[test]
    fn test_incoming_ack_opens_nothing() {
        let mut data = call_data();
        let ack = RawSipMsg::request(AppId::new("app1"), CallId::new("c1"), SipMethod::Ack, json!({}));
        let reply = data.execute(&Work::Incoming { msg: ack }).unwrap();

        assert!(matches!(reply, CallReply::Ack));
        assert!(data.transactions.is_empty());
        assert!(data.is_finished());
    }

    #[test]
    fn test_history_preserves_submission_order() {
        let mut data = call_data();
        data.execute(&Work::Send {
            method: SipMethod::Invite,
            uri: "sip:a@b".to_string(),
            opts: json!({}),
        })
        .unwrap();
        data.execute(&Work::GetDialogs).unwrap();
        data.execute(&Work::GetData).unwrap();

        assert_eq!(data.history, vec!["send", "get_dialogs", "get_data"]);
    }
}
