//! Fetch handles, subscriber records, and the shared (locked) half of a
//! fetch context.

use burrow_cache::NodeRef;
use burrow_proto::{Name, RdataType, Rdataset};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{FetchOpts, FetchOutcome};

/// The completion event a subscriber receives, exactly once.
#[derive(Debug, Clone)]
pub struct FetchDone {
    pub outcome: FetchOutcome,
    /// The owner name the answer was found at (the end of any chain).
    pub foundname: Option<Name>,
    /// The answering rdataset, populated by the cache layer.
    pub rdataset: Option<Rdataset>,
    /// The covering signature rdataset, when one was present.
    pub sigrdataset: Option<Rdataset>,
    /// Handle onto the cache node the answer was committed to. Subscribers
    /// joined to one context all hold clones of the same node.
    pub node: Option<NodeRef>,
}

/// A subscriber's handle onto one question's outcome.
///
/// The handle stays valid until the subscriber has received its completion
/// event **and** handed the fetch back through
/// [`Resolver::destroy_fetch`](crate::Resolver::destroy_fetch).
#[derive(Debug)]
pub struct Fetch {
    pub(crate) shared: std::sync::Arc<FctxShared>,
    pub(crate) subscriber: u64,
    pub(crate) rx: Option<oneshot::Receiver<FetchDone>>,
}

impl Fetch {
    /// Waits for the completion event.
    ///
    /// Yields `Canceled` if the resolver tore the fetch down without
    /// delivering (shutdown while shutting down the process).
    pub async fn done(&mut self) -> FetchDone {
        match self.rx.take() {
            Some(rx) => match rx.await {
                Ok(done) => done,
                Err(_) => FetchDone {
                    outcome: FetchOutcome::Canceled,
                    foundname: None,
                    rdataset: None,
                    sigrdataset: None,
                    node: None,
                },
            },
            None => FetchDone {
                outcome: FetchOutcome::Canceled,
                foundname: None,
                rdataset: None,
                sigrdataset: None,
                node: None,
            },
        }
    }
}

/// The identity a fetch context is matched on when a second caller asks
/// the same question.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FetchKey {
    pub name: Name,
    pub rtype: RdataType,
    pub options: FetchOpts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchState {
    /// The start event has not run yet.
    Init,
    Active,
    /// Completion events have been posted; terminal.
    Done,
}

/// One subscriber's pending completion record.
///
/// The cache layer fills the head subscriber's fields when the answer is
/// committed; the rest are cloned from it.
#[derive(Debug)]
pub(crate) struct Subscriber {
    pub id: u64,
    pub tx: Option<oneshot::Sender<FetchDone>>,
    pub outcome: FetchOutcome,
    pub foundname: Option<Name>,
    pub rdataset: Option<Rdataset>,
    pub sigrdataset: Option<Rdataset>,
    pub node: Option<NodeRef>,
}

impl Subscriber {
    pub(crate) fn new(id: u64, tx: oneshot::Sender<FetchDone>) -> Self {
        Self {
            id,
            tx: Some(tx),
            // Placeholder until the cache layer or completion fills it in.
            outcome: FetchOutcome::ServFail,
            foundname: None,
            rdataset: None,
            sigrdataset: None,
            node: None,
        }
    }

    /// Sends the completion event, consuming the record. `override_outcome`
    /// replaces the stored outcome for subscribers that were never
    /// populated by the cache layer.
    pub(crate) fn deliver(mut self, override_outcome: Option<FetchOutcome>) {
        let outcome = override_outcome.unwrap_or(self.outcome);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(FetchDone {
                outcome,
                foundname: self.foundname,
                rdataset: self.rdataset,
                sigrdataset: self.sigrdataset,
                node: self.node,
            });
        }
    }
}

/// State of a fetch context protected by its lock: everything touched
/// from outside the owning bucket worker.
#[derive(Debug)]
pub(crate) struct FctxLocked {
    pub state: FetchState,
    pub references: u32,
    pub want_shutdown: bool,
    pub subscribers: Vec<Subscriber>,
    pub next_subscriber: u64,
}

/// The shared half of a fetch context, visible to fetch handles, the
/// resolver, and the bucket registry.
#[derive(Debug)]
pub(crate) struct FctxShared {
    pub id: u64,
    pub bucket: usize,
    pub key: FetchKey,
    pub locked: Mutex<FctxLocked>,
}

impl FctxShared {
    pub(crate) fn new(id: u64, bucket: usize, key: FetchKey) -> Self {
        Self {
            id,
            bucket,
            key,
            locked: Mutex::new(FctxLocked {
                state: FetchState::Init,
                references: 0,
                want_shutdown: false,
                subscribers: Vec::new(),
                next_subscriber: 0,
            }),
        }
    }

    /// Appends a subscriber and takes a reference; the fetch-handle half
    /// of `fctx_join`.
    pub(crate) fn join(
        shared: &std::sync::Arc<Self>,
        locked: &mut FctxLocked,
    ) -> Fetch {
        let id = locked.next_subscriber;
        locked.next_subscriber += 1;
        let (tx, rx) = oneshot::channel();
        locked.subscribers.push(Subscriber::new(id, tx));
        locked.references += 1;
        Fetch {
            shared: std::sync::Arc::clone(shared),
            subscriber: id,
            rx: Some(rx),
        }
    }
}

/// Copies the head subscriber's populated answer onto every other
/// subscriber.
pub(crate) fn clone_results(subscribers: &mut [Subscriber]) {
    let Some((head, rest)) = subscribers.split_first_mut() else {
        return;
    };
    for sub in rest {
        sub.outcome = head.outcome;
        sub.foundname = head.foundname.clone();
        sub.rdataset = head.rdataset.clone();
        sub.sigrdataset = head.sigrdataset.clone();
        sub.node = head.node.clone();
    }
}
