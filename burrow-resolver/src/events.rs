//! Events delivered to bucket workers.
//!
//! Every asynchronous completion (a datagram, a finished send or connect,
//! a timer firing, an address-database find, a control message) arrives at
//! the owning bucket's worker as one of these, and is processed serially
//! there. Fields of a fetch context touched only from these handlers need
//! no locking.

use std::time::Instant;

use burrow_adb::FindEvent;
use burrow_dispatch::DispatchError;
use tokio::sync::mpsc;

use crate::fctx::FetchCtx;

pub(crate) type EventSink = mpsc::UnboundedSender<BucketEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutKind {
    /// The fetch's total lifetime deadline passed.
    Lifetime,
    /// The per-try idle interval passed.
    Idle,
}

pub(crate) enum BucketEvent {
    /// A freshly created fetch context, shipped to its worker.
    Start(Box<FetchCtx>),
    /// Shutdown control for the fetch context.
    Control(u64),
    /// The retry timer fired.
    Timeout {
        fctx: u64,
        generation: u64,
        kind: TimeoutKind,
    },
    /// An address-database find completed.
    FindDone { fctx: u64, event: FindEvent },
    /// A response arrived for one of the fetch's queries.
    Response {
        fctx: u64,
        query: u64,
        wire: Vec<u8>,
        finish: Instant,
    },
    /// A send completed.
    SendDone {
        fctx: u64,
        query: u64,
        result: Result<(), DispatchError>,
    },
    /// A TCP connect completed.
    Connected {
        fctx: u64,
        query: u64,
        result: Result<(), DispatchError>,
    },
    /// Wake the worker to re-check its exit condition.
    CheckExit,
}

impl BucketEvent {
    /// The fetch context the event concerns, if any.
    pub(crate) fn fctx_id(&self) -> Option<u64> {
        match self {
            Self::Start(fctx) => Some(fctx.shared.id),
            Self::Control(fctx)
            | Self::Timeout { fctx, .. }
            | Self::FindDone { fctx, .. }
            | Self::Response { fctx, .. }
            | Self::SendDone { fctx, .. }
            | Self::Connected { fctx, .. } => Some(*fctx),
            Self::CheckExit => None,
        }
    }
}
