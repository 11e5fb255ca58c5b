//! The per-fetch retry timer.
//!
//! One timer serves both deadlines of a fetch: the fixed lifetime set at
//! creation and the per-try idle interval armed before each query. A
//! `touch` pushes the idle deadline out without rearming; the sleeping
//! task re-checks its target when it wakes, so a touched timer simply
//! keeps sleeping.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::events::{BucketEvent, EventSink, TimeoutKind};

pub(crate) struct RetryTimer {
    sink: EventSink,
    fctx: u64,
    expires: Instant,
    generation: Arc<AtomicU64>,
    idle_deadline: Arc<Mutex<Instant>>,
    last_interval: Duration,
    handle: Option<JoinHandle<()>>,
}

impl RetryTimer {
    pub(crate) fn new(sink: EventSink, fctx: u64, expires: Instant) -> Self {
        Self {
            sink,
            fctx,
            expires,
            generation: Arc::new(AtomicU64::new(0)),
            idle_deadline: Arc::new(Mutex::new(Instant::now())),
            last_interval: Duration::from_secs(2),
            handle: None,
        }
    }

    /// The generation current events must carry to be believed.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Arms the timer with a fresh idle interval, superseding any armed
    /// state.
    pub(crate) fn start(&mut self, interval: Duration) {
        self.last_interval = interval;
        *self.idle_deadline.lock() = Instant::now() + interval;
        self.arm(true);
    }

    /// Arms only the lifetime deadline (used while waiting on work that
    /// has no retry, like validation).
    pub(crate) fn start_lifetime_only(&mut self) {
        self.arm(false);
    }

    /// Extends the idle deadline without rearming.
    pub(crate) fn touch(&self) {
        *self.idle_deadline.lock() = Instant::now() + self.last_interval;
    }

    /// Disarms the timer; in-flight timeout events become stale.
    pub(crate) fn stop(&mut self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    fn arm(&mut self, with_idle: bool) {
        self.stop();
        let generation = self.generation.load(Ordering::Acquire);
        let sink = self.sink.clone();
        let fctx = self.fctx;
        let expires = self.expires;
        let gen_handle = Arc::clone(&self.generation);
        let idle_handle = Arc::clone(&self.idle_deadline);

        self.handle = Some(tokio::spawn(async move {
            loop {
                let idle = if with_idle {
                    Some(*idle_handle.lock())
                } else {
                    None
                };
                let target = idle.map_or(expires, |idle| idle.min(expires));
                tokio::time::sleep_until(target.into()).await;

                if gen_handle.load(Ordering::Acquire) != generation {
                    return;
                }
                let now = Instant::now();
                if now >= expires {
                    let _ = sink.send(BucketEvent::Timeout {
                        fctx,
                        generation,
                        kind: TimeoutKind::Lifetime,
                    });
                    return;
                }
                if idle.is_some() {
                    // The deadline may have been touched while we slept.
                    let current = *idle_handle.lock();
                    if now >= current {
                        let _ = sink.send(BucketEvent::Timeout {
                            fctx,
                            generation,
                            kind: TimeoutKind::Idle,
                        });
                        return;
                    }
                }
            }
        }));
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
