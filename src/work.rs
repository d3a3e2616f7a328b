//! Work items dispatched to call workers
//!
//! Every public router operation maps to exactly one `Work` variant. Work
//! is cloneable so an unacknowledged item can be re-dispatched to a
//! successor worker after its target died.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::RouterResult;
use crate::message::RawSipMsg;
use crate::types::{DialogId, MsgId, TransactionId};

/// Typed inspection queries served by the worker.
///
/// These replace shipping caller-supplied closures into the worker: the
/// worker knows how to answer each variant from its own state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectQuery {
    /// Snapshot of a dialog's state
    DialogSnapshot,
    /// Headers of a retained SIP message
    SipMsgHeaders,
    /// Current state of a transaction
    TransactionState,
}

/// Reply values produced by a call worker
#[derive(Debug, Clone)]
pub enum CallReply {
    /// Work accepted, nothing further to report
    Ack,
    /// A message was sent or admitted into the call
    Sent {
        /// Handle of the created message
        msg: MsgId,
        /// Transaction opened for it
        transaction: TransactionId,
        /// Dialog established, when the method creates one
        dialog: Option<DialogId>,
    },
    /// Dialog enumeration
    Dialogs(Vec<DialogId>),
    /// Retained message enumeration
    SipMsgs(Vec<MsgId>),
    /// Transaction enumeration
    Transactions(Vec<TransactionId>),
    /// Answer to an inspection query
    Snapshot(serde_json::Value),
    /// Opaque per-call state for observability
    Data(serde_json::Value),
}

/// A tagged work request for a call worker
#[derive(Debug, Clone)]
pub enum Work {
    /// Send an application-prepared request
    SendRequest {
        req: RawSipMsg,
        opts: serde_json::Value,
    },
    /// Build and send a request from method and URI
    Send {
        method: crate::message::SipMethod,
        uri: String,
        opts: serde_json::Value,
    },
    /// Send a request inside an established dialog
    SendDialog {
        dialog: DialogId,
        method: crate::message::SipMethod,
        opts: serde_json::Value,
    },
    /// Cancel an in-flight request
    Cancel { msg: MsgId },
    /// Reply synchronously to a received request
    SyncReply {
        msg: MsgId,
        reply: serde_json::Value,
    },
    /// Deliver an application callback result to a transaction
    AppReply {
        transaction: TransactionId,
        reply: serde_json::Value,
    },
    /// Inspect a dialog
    ApplyDialog {
        dialog: DialogId,
        query: InspectQuery,
    },
    /// Inspect a retained message
    ApplySipMsg { msg: MsgId, query: InspectQuery },
    /// Inspect a transaction
    ApplyTransaction {
        transaction: TransactionId,
        query: InspectQuery,
    },
    /// Tear down a dialog
    StopDialog { dialog: DialogId },
    /// Process a message received from the transport
    Incoming { msg: RawSipMsg },
    /// Enumerate dialogs
    GetDialogs,
    /// Enumerate retained messages
    GetSipMsgs,
    /// Enumerate transactions
    GetTransactions,
    /// Opaque state snapshot
    GetData,
}

impl Work {
    /// Short label used in logs and call history
    pub fn label(&self) -> &'static str {
        match self {
            Self::SendRequest { .. } => "send_request",
            Self::Send { .. } => "send",
            Self::SendDialog { .. } => "send_dialog",
            Self::Cancel { .. } => "cancel",
            Self::SyncReply { .. } => "sync_reply",
            Self::AppReply { .. } => "app_reply",
            Self::ApplyDialog { .. } => "apply_dialog",
            Self::ApplySipMsg { .. } => "apply_sipmsg",
            Self::ApplyTransaction { .. } => "apply_transaction",
            Self::StopDialog { .. } => "stop_dialog",
            Self::Incoming { .. } => "incoming",
            Self::GetDialogs => "get_dialogs",
            Self::GetSipMsgs => "get_sipmsgs",
            Self::GetTransactions => "get_transactions",
            Self::GetData => "get_data",
        }
    }
}

/// The caller's reply channel for synchronous work.
///
/// Both the shard's pending table and the in-flight worker message hold a
/// reference to the same slot; whoever answers first consumes the sender,
/// so a replayed work item and its dead predecessor can never both reach
/// the caller.
#[derive(Clone)]
pub struct Origin {
    inner: Arc<Mutex<Option<oneshot::Sender<RouterResult<CallReply>>>>>,
}

impl Origin {
    /// Create a reply slot and the receiving half for the caller
    pub fn channel() -> (Self, oneshot::Receiver<RouterResult<CallReply>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Deliver the result. Returns false if the slot was already consumed
    /// or the caller stopped waiting.
    pub fn respond(&self, result: RouterResult<CallReply>) -> bool {
        match self.inner.lock().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Whether a reply has already been delivered
    pub fn is_spent(&self) -> bool {
        self.inner.lock().is_none()
    }
}

impl fmt::Debug for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Origin")
            .field("spent", &self.is_spent())
            .finish()
    }
}
