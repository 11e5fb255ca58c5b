//! The resolver: buckets, worker tasks, dispatchers, and fetch lifecycle.

use std::{
    hash::BuildHasher,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use ahash::{AHashMap, RandomState};
use burrow_adb::Adb;
use burrow_cache::{View, unix_now};
use burrow_dispatch::{Dispatch, UdpDispatch};
use burrow_proto::{Name, Rclass, RdataType, Rdataset};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::{
    Fetch, FetchOpts, ForwardPolicy, ResolverConfig, ResolverError,
    events::{BucketEvent, EventSink},
    fctx::{FctxAttrs, FetchCtx},
    fetch::{FctxShared, FetchKey, FetchState},
};

/// State protected by the resolver lock.
struct ResolverLocked {
    exiting: bool,
    active_buckets: usize,
    when_shutdown: Vec<oneshot::Sender<()>>,
}

/// State protected by a bucket's lock: membership, and through each
/// context's own lock, the externally-visible fetch state.
pub(crate) struct BucketLocked {
    pub exiting: bool,
    pub fctxs: Vec<Arc<FctxShared>>,
}

pub(crate) struct BucketShared {
    pub locked: Mutex<BucketLocked>,
}

pub(crate) struct Bucket {
    pub sink: EventSink,
    pub shared: Arc<BucketShared>,
}

/// Everything the fetch machinery reaches through its resolver handle.
pub(crate) struct ResolverInner {
    pub config: ResolverConfig,
    pub view: Arc<View>,
    pub adb: Arc<Adb>,
    pub rdclass: Rclass,
    pub buckets: Vec<Bucket>,
    pub dispatch4: Option<Arc<dyn Dispatch>>,
    pub dispatch6: Option<Arc<dyn Dispatch>>,
    pub forwarders: Mutex<Vec<SocketAddr>>,
    pub policy: Mutex<ForwardPolicy>,
    frozen: AtomicBool,
    locked: Mutex<ResolverLocked>,
    next_fctx: AtomicU64,
    hasher: RandomState,
}

impl ResolverInner {
    /// One bucket has fully drained while exiting.
    pub(crate) fn empty_bucket(&self) {
        let mut locked = self.locked.lock();
        debug_assert!(locked.active_buckets > 0);
        locked.active_buckets = locked.active_buckets.saturating_sub(1);
        trace!(active = locked.active_buckets, "bucket drained");
        if locked.active_buckets == 0 {
            for tx in locked.when_shutdown.drain(..) {
                let _ = tx.send(());
            }
        }
    }
}

/// An iterative, caching DNS resolver.
///
/// Cloning the handle shares the resolver (`attach`); dropping a clone
/// releases it (`detach`). Configuration mutators work until
/// [`freeze`](Self::freeze); fetches can be created only after it.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<ResolverInner>,
}

impl Resolver {
    /// Creates a resolver over `view`: binds the shared UDP sockets (an
    /// IPv4 socket on a port from the configured range, an IPv6 socket
    /// when the host has the stack), and starts one worker per bucket.
    ///
    /// A preexisting IPv4 dispatcher may be supplied to share a socket
    /// between resolvers.
    ///
    /// # Errors
    ///
    /// Fails when no UDP port can be bound.
    pub async fn create(
        view: Arc<View>,
        config: ResolverConfig,
        dispatch4: Option<Arc<dyn Dispatch>>,
    ) -> Result<Self, ResolverError> {
        let dispatch4: Option<Arc<dyn Dispatch>> = match dispatch4 {
            Some(dispatch) => Some(dispatch),
            None => {
                let udp: Arc<dyn Dispatch> =
                    UdpDispatch::bind_v4(config.udp_port_start..config.udp_port_end).await?;
                Some(udp)
            }
        };
        let dispatch6: Option<Arc<dyn Dispatch>> = match UdpDispatch::bind_v6().await {
            Ok(dispatch) => {
                let udp: Arc<dyn Dispatch> = dispatch;
                Some(udp)
            }
            Err(error) => {
                debug!(%error, "no ipv6 dispatcher");
                None
            }
        };

        let adb = Arc::new(Adb::new(Arc::clone(&view), config.server_port));
        let rdclass = view.rdclass();
        let nbuckets = config.buckets.max(1);

        let mut buckets = Vec::with_capacity(nbuckets);
        let mut receivers = Vec::with_capacity(nbuckets);
        for _ in 0..nbuckets {
            let (sink, rx) = mpsc::unbounded_channel();
            let shared = Arc::new(BucketShared {
                locked: Mutex::new(BucketLocked {
                    exiting: false,
                    fctxs: Vec::new(),
                }),
            });
            buckets.push(Bucket {
                sink,
                shared: Arc::clone(&shared),
            });
            receivers.push((rx, shared));
        }

        let inner = Arc::new(ResolverInner {
            config,
            view,
            adb,
            rdclass,
            buckets,
            dispatch4,
            dispatch6,
            forwarders: Mutex::new(Vec::new()),
            policy: Mutex::new(ForwardPolicy::default()),
            frozen: AtomicBool::new(false),
            locked: Mutex::new(ResolverLocked {
                exiting: false,
                active_buckets: nbuckets,
                when_shutdown: Vec::new(),
            }),
            next_fctx: AtomicU64::new(1),
            hasher: RandomState::new(),
        });

        for (rx, shared) in receivers {
            tokio::spawn(bucket_worker(rx, shared, Arc::downgrade(&inner)));
        }

        info!(buckets = nbuckets, "resolver created");
        Ok(Self { inner })
    }

    /// The view this resolver populates.
    #[must_use]
    pub fn view(&self) -> &Arc<View> {
        &self.inner.view
    }

    /// The shared address database.
    #[must_use]
    pub fn adb(&self) -> &Arc<Adb> {
        &self.inner.adb
    }

    /// Sets the default forwarders.
    ///
    /// # Errors
    ///
    /// Fails once the resolver is frozen.
    pub fn set_forwarders(&self, forwarders: Vec<SocketAddr>) -> Result<(), ResolverError> {
        if self.inner.frozen.load(Ordering::Acquire) {
            return Err(ResolverError::Frozen);
        }
        *self.inner.forwarders.lock() = forwarders;
        Ok(())
    }

    /// Sets the forwarding policy.
    ///
    /// # Errors
    ///
    /// Fails once the resolver is frozen.
    pub fn set_forward_policy(&self, policy: ForwardPolicy) -> Result<(), ResolverError> {
        if self.inner.frozen.load(Ordering::Acquire) {
            return Err(ResolverError::Frozen);
        }
        *self.inner.policy.lock() = policy;
        Ok(())
    }

    /// Makes the resolver immutable and eligible to create fetches.
    pub fn freeze(&self) {
        self.inner.frozen.store(true, Ordering::Release);
    }

    /// Starts (or joins) a fetch for `(name, rtype)`.
    ///
    /// `domain_hint` seeds the zone cut and its NS rdataset; without it
    /// the deepest cut known to the view is used (or the root, under a
    /// forward-only policy). `forwarders` override the resolver's default
    /// forwarder list for this fetch only.
    ///
    /// An existing fetch context with the same name, type, and options is
    /// joined unless [`FetchOpts::UNSHARED`] is set.
    ///
    /// # Errors
    ///
    /// Fails before [`freeze`](Self::freeze), during shutdown, or when no
    /// starting zone cut exists.
    pub fn create_fetch(
        &self,
        name: &Name,
        rtype: RdataType,
        domain_hint: Option<(Name, Rdataset)>,
        forwarders: &[SocketAddr],
        options: FetchOpts,
    ) -> Result<Fetch, ResolverError> {
        if !self.inner.frozen.load(Ordering::Acquire) {
            return Err(ResolverError::NotFrozen);
        }
        debug!(%name, %rtype, "createfetch");

        let nbuckets = u64::try_from(self.inner.buckets.len()).unwrap_or(1).max(1);
        let bucket_idx =
            usize::try_from(self.inner.hasher.hash_one(name) % nbuckets).unwrap_or(0);
        let bucket = &self.inner.buckets[bucket_idx];

        let mut bucket_locked = bucket.shared.locked.lock();
        if bucket_locked.exiting {
            return Err(ResolverError::ShuttingDown);
        }

        if !options.contains(FetchOpts::UNSHARED) {
            for shared in &bucket_locked.fctxs {
                if shared.key.name == *name
                    && shared.key.rtype == rtype
                    && shared.key.options == options
                {
                    let mut locked = shared.locked.lock();
                    if locked.state != FetchState::Done {
                        trace!(%name, "joined existing fetch");
                        return Ok(FctxShared::join(shared, &mut locked));
                    }
                }
            }
        }

        // No live context matched; build one.
        let policy = *self.inner.policy.lock();
        let (domain, nameservers) = match domain_hint {
            Some((domain, nameservers)) => (domain, Some(nameservers)),
            None if policy == ForwardPolicy::Only => (Name::root(), None),
            None => {
                let (domain, nameservers) = self.inner.view.find_zonecut(name, unix_now())?;
                (domain, Some(nameservers))
            }
        };

        let id = self.inner.next_fctx.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(FctxShared::new(
            id,
            bucket_idx,
            FetchKey {
                name: name.clone(),
                rtype,
                options,
            },
        ));
        let fetch = {
            let mut locked = shared.locked.lock();
            FctxShared::join(&shared, &mut locked)
        };

        let expires = Instant::now() + Duration::from_secs(self.inner.config.lifetime_secs);
        let fctx = FetchCtx::new(
            Arc::clone(&shared),
            Arc::clone(&self.inner),
            name.clone(),
            rtype,
            options,
            domain,
            nameservers,
            forwarders.to_vec(),
            bucket.sink.clone(),
            expires,
        );

        bucket_locked.fctxs.push(Arc::clone(&shared));
        if bucket.sink.send(BucketEvent::Start(Box::new(fctx))).is_err() {
            bucket_locked.fctxs.retain(|entry| entry.id != id);
            return Err(ResolverError::ShuttingDown);
        }

        Ok(fetch)
    }

    /// Removes one subscriber from its fetch context and delivers
    /// `Canceled` to it immediately; other subscribers are untouched.
    pub fn cancel_fetch(&self, fetch: &Fetch) {
        let shared = &fetch.shared;
        let subscriber = {
            let mut locked = shared.locked.lock();
            if locked.state == FetchState::Done {
                None
            } else {
                locked
                    .subscribers
                    .iter()
                    .position(|sub| sub.id == fetch.subscriber)
                    .map(|idx| locked.subscribers.remove(idx))
            }
        };
        if let Some(subscriber) = subscriber {
            trace!(fctx = shared.id, "fetch canceled");
            subscriber.deliver(Some(crate::FetchOutcome::Canceled));
        }
    }

    /// Releases a fetch handle. When the last reference to the context
    /// goes away, context shutdown is initiated (or completed).
    pub fn destroy_fetch(&self, fetch: Fetch) {
        let shared = fetch.shared;
        let (last, state) = {
            let mut locked = shared.locked.lock();
            debug_assert!(locked.references > 0);
            locked.references -= 1;
            let last = locked.references == 0;
            if last {
                locked.want_shutdown = true;
            }
            (last, locked.state)
        };

        if last && state != FetchState::Init {
            // The worker finishes (or notices it can destroy) the fctx.
            let bucket = &self.inner.buckets[shared.bucket];
            let _ = bucket.sink.send(BucketEvent::Control(shared.id));
        }
        // In `Init` the start event is still outstanding and will observe
        // `want_shutdown`.
    }

    /// Starts resolver shutdown: every fetch context is asked to shut
    /// down and buckets drain as their contexts destroy themselves.
    pub fn shutdown(&self) {
        let mut locked = self.inner.locked.lock();
        if locked.exiting {
            return;
        }
        info!("resolver shutting down");
        locked.exiting = true;

        for bucket in &self.inner.buckets {
            let mut bucket_locked = bucket.shared.locked.lock();
            bucket_locked.exiting = true;
            for shared in &bucket_locked.fctxs {
                let post = {
                    let mut fctx_locked = shared.locked.lock();
                    if fctx_locked.want_shutdown {
                        false
                    } else {
                        fctx_locked.want_shutdown = true;
                        fctx_locked.state != FetchState::Init
                    }
                };
                if post {
                    let _ = bucket.sink.send(BucketEvent::Control(shared.id));
                }
            }
            if bucket_locked.fctxs.is_empty() {
                locked.active_buckets = locked.active_buckets.saturating_sub(1);
            }
            drop(bucket_locked);
            let _ = bucket.sink.send(BucketEvent::CheckExit);
        }

        if locked.active_buckets == 0 {
            for tx in locked.when_shutdown.drain(..) {
                let _ = tx.send(());
            }
        }
    }

    /// Resolves when shutdown has drained every bucket; immediately if it
    /// already has.
    pub fn when_shutdown(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let rx = {
            let mut locked = self.inner.locked.lock();
            if locked.exiting && locked.active_buckets == 0 {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                locked.when_shutdown.push(tx);
                Some(rx)
            }
        };
        async move {
            if let Some(rx) = rx {
                let _ = rx.await;
            }
        }
    }
}

/// The per-bucket worker: applies events serially to the contexts it
/// owns, and destroys a context once nothing references it and no
/// asynchronous work remains.
async fn bucket_worker(
    mut rx: mpsc::UnboundedReceiver<BucketEvent>,
    shared: Arc<BucketShared>,
    inner: Weak<ResolverInner>,
) {
    let mut fctxs: AHashMap<u64, FetchCtx> = AHashMap::new();

    while let Some(event) = rx.recv().await {
        let target = event.fctx_id();
        match event {
            BucketEvent::Start(boxed) => {
                let id = boxed.shared.id;
                fctxs.insert(id, *boxed);
                let Some(fctx) = fctxs.get_mut(&id) else {
                    continue;
                };
                let want_shutdown = {
                    let mut locked = fctx.shared.locked.lock();
                    if locked.want_shutdown {
                        true
                    } else {
                        locked.state = FetchState::Active;
                        false
                    }
                };
                if want_shutdown {
                    // Asked to shut down before ever going active.
                    fctx.do_shutdown();
                } else {
                    fctx.try_();
                }
            }
            BucketEvent::Control(id) => {
                if let Some(fctx) = fctxs.get_mut(&id) {
                    fctx.do_shutdown();
                }
            }
            BucketEvent::Timeout {
                fctx: id,
                generation,
                kind,
            } => {
                if let Some(fctx) = fctxs.get_mut(&id) {
                    fctx.on_timeout(generation, kind);
                }
            }
            BucketEvent::FindDone { fctx: id, event } => {
                if let Some(fctx) = fctxs.get_mut(&id) {
                    fctx.find_done(event);
                }
            }
            BucketEvent::Response {
                fctx: id,
                query,
                wire,
                finish,
            } => {
                if let Some(fctx) = fctxs.get_mut(&id) {
                    fctx.on_response(query, &wire, finish);
                }
            }
            BucketEvent::SendDone {
                fctx: id,
                query,
                result,
            } => {
                if let Some(fctx) = fctxs.get_mut(&id) {
                    fctx.on_send_done(query, result);
                }
            }
            BucketEvent::Connected {
                fctx: id,
                query,
                result,
            } => {
                if let Some(fctx) = fctxs.get_mut(&id) {
                    fctx.on_connected(query, result);
                }
            }
            BucketEvent::CheckExit => {}
        }

        if let Some(id) = target {
            maybe_destroy(&mut fctxs, &shared, &inner, id);
        }

        // Once the bucket is exiting and empty there is nothing left to
        // serialize.
        let exit = {
            let locked = shared.locked.lock();
            locked.exiting && locked.fctxs.is_empty() && fctxs.is_empty()
        };
        if exit {
            break;
        }
    }
}

/// Destroys the context when nothing holds it and no asynchronous work
/// remains; the last destruction in an exiting bucket drains the bucket.
fn maybe_destroy(
    fctxs: &mut AHashMap<u64, FetchCtx>,
    shared: &Arc<BucketShared>,
    inner: &Weak<ResolverInner>,
    id: u64,
) {
    let Some(fctx) = fctxs.get(&id) else {
        return;
    };
    let destroy = {
        let locked = fctx.shared.locked.lock();
        locked.references == 0
            && fctx.pending == 0
            && fctx.validating == 0
            && match locked.state {
                FetchState::Done => {
                    locked.want_shutdown
                        || fctx.attributes.contains(FctxAttrs::SHUTTINGDOWN)
                        || locked.subscribers.is_empty()
                }
                FetchState::Init => locked.want_shutdown,
                FetchState::Active => false,
            }
    };
    if !destroy {
        return;
    }

    trace!(fctx = id, "destroyed");
    fctxs.remove(&id);
    let drained = {
        let mut locked = shared.locked.lock();
        locked.fctxs.retain(|entry| entry.id != id);
        locked.exiting && locked.fctxs.is_empty()
    };
    if drained && let Some(inner) = inner.upgrade() {
        inner.empty_bucket();
    }
}
