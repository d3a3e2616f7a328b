//! Sharded call router for a SIP stack
//!
//! This crate is the dispatch core of a SIP stack: it receives raw SIP
//! messages and synchronous user work, binds each to the per-call worker
//! owning that Call-ID, and guarantees at most one worker per
//! `(application, call)` pair while scaling across CPUs. It provides:
//! - A fixed pool of router shards selected by a stable hash of the Call-ID
//! - Per-shard registries of live call workers, serialized without locks
//! - Sync and async work dispatch, spawning workers on first reference
//! - Admission control (global and per-application live-call caps)
//! - Crash/exit handling that replays unacknowledged sync work to a
//!   successor worker

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod apps;
pub mod config;
pub mod counters;
pub mod error;
pub mod message;
pub mod registry;
pub mod router;
pub mod shard;
pub mod types;
pub mod work;
pub mod worker;

pub use apps::{AppDirectory, AppOpts};
pub use config::{RouterConfig, SipTimers};
pub use counters::CallCounters;
pub use error::{RouterError, RouterResult};
pub use message::{RawSipMsg, SipClass, SipMethod};
pub use router::{shard_index, CallRouter, DialogSpec};
pub use types::{AppId, CallId, CallKey, DialogId, MsgId, TransactionId};
pub use work::{CallReply, InspectQuery, Work};
pub use worker::{DownReason, WorkerHandle, WorkerId};
