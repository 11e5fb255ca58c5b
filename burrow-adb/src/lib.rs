//! The address database: per-server address candidates with smoothed RTT,
//! EDNS0-capability flags, and lameness records.
//!
//! The fetch engine stays a pure driver; everything it learns about remote
//! servers (how fast they answer, whether they tolerate EDNS0, which zones
//! they are lame for) is recorded here and shared across fetch contexts.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use burrow_cache::View;
use burrow_proto::Name;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Flag bits shared on an [`AddrInfo`].
pub mod flags {
    /// The server has shown it does not tolerate EDNS0.
    pub const NOEDNS0: u32 = 0x0001;
}

/// How an RTT sample is folded into the smoothed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Factor {
    /// Exponential smoothing: seven parts history, three parts sample.
    Default,
    /// Replace the smoothed value outright.
    Replace,
}

/// One remote server address and what we know about it.
#[derive(Debug)]
pub struct AddrInfo {
    sockaddr: SocketAddr,
    srtt: AtomicU32,
    flags: AtomicU32,
    lameness: Mutex<Vec<(Name, u64)>>,
}

impl AddrInfo {
    fn new(sockaddr: SocketAddr) -> Self {
        Self {
            sockaddr,
            srtt: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            lameness: Mutex::new(Vec::new()),
        }
    }

    /// The server's socket address.
    #[must_use]
    pub const fn sockaddr(&self) -> SocketAddr {
        self.sockaddr
    }

    /// Smoothed round-trip time in microseconds.
    #[must_use]
    pub fn srtt(&self) -> u32 {
        self.srtt.load(Ordering::Relaxed)
    }

    /// The current flag bits.
    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    /// Whether this server is currently lame for `zone`.
    #[must_use]
    pub fn is_lame(&self, zone: &Name, now: u64) -> bool {
        self.lameness
            .lock()
            .iter()
            .any(|(lame_zone, until)| *until > now && lame_zone == zone)
    }
}

/// A resolved set of addresses for one nameserver name, sorted by srtt.
#[derive(Debug)]
pub struct Find {
    addrs: Vec<Arc<AddrInfo>>,
}

impl Find {
    /// The addresses, best (lowest srtt) first.
    #[must_use]
    pub fn addrs(&self) -> &[Arc<AddrInfo>] {
        &self.addrs
    }

    /// The srtt of the best address, used to order finds against each
    /// other.
    #[must_use]
    pub fn best_srtt(&self) -> u32 {
        self.addrs.first().map_or(u32::MAX, |ai| ai.srtt())
    }
}

/// Options controlling a find.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Return IPv4 addresses.
    pub inet: bool,
    /// Return IPv6 addresses.
    pub inet6: bool,
    /// Subscribe the caller for a completion event when nothing is known
    /// yet.
    pub want_event: bool,
    /// Deliver the completion event even when it reports no addresses.
    pub empty_event: bool,
    /// Do not start address fetches on the caller's behalf.
    pub avoid_fetches: bool,
    /// Restart the address search at the root rather than under the
    /// caller's zone (defends against in-bailiwick glue starvation).
    pub start_at_root: bool,
}

/// The completion event a pending find delivers, exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindEvent {
    MoreAddresses,
    NoMoreAddresses,
}

/// Outcome of [`Adb::create_find`].
#[derive(Debug)]
pub enum FindOutcome {
    /// Addresses were known immediately; no event will follow.
    Found(Find),
    /// Nothing known yet; one [`FindEvent`] will be delivered.
    Pending,
    /// Nothing known and no event was requested.
    Nothing,
}

/// The address database.
///
/// Addresses are resolved through the view (cached glue and answers, then
/// hints); reputation state is keyed by socket address and shared by every
/// fetch context that talks to the same server.
#[derive(Debug)]
pub struct Adb {
    view: Arc<View>,
    entries: DashMap<SocketAddr, Arc<AddrInfo>>,
    /// Port queried on resolved nameserver addresses.
    port: u16,
}

impl Adb {
    #[must_use]
    pub fn new(view: Arc<View>, port: u16) -> Self {
        Self {
            view,
            entries: DashMap::new(),
            port,
        }
    }

    /// The shared entry for `sockaddr`, created on first use.
    #[must_use]
    pub fn find_addrinfo(&self, sockaddr: SocketAddr) -> Arc<AddrInfo> {
        self.entries
            .entry(sockaddr)
            .or_insert_with(|| Arc::new(AddrInfo::new(sockaddr)))
            .clone()
    }

    /// Looks up the addresses for nameserver `name` on behalf of a fetch
    /// working under `zone`.
    ///
    /// When addresses are known they come back immediately, sorted by
    /// srtt and filtered by family and lameness. When nothing is known and
    /// the caller asked for events, exactly one completion event is posted
    /// through `notify` from a separate task; the second lookup there
    /// catches addresses that arrived in the meantime.
    pub fn create_find(
        adb: &Arc<Self>,
        name: &Name,
        zone: &Name,
        options: FindOptions,
        now: u64,
        notify: impl FnOnce(FindEvent) + Send + 'static,
    ) -> FindOutcome {
        let addrs = adb.lookup(name, zone, options, now);
        if !addrs.is_empty() {
            trace!(name = %name, count = addrs.len(), "find resolved immediately");
            return FindOutcome::Found(Find { addrs });
        }

        if options.want_event {
            let adb = Arc::clone(adb);
            let name = name.clone();
            let zone = zone.clone();
            debug!(name = %name, "find pending");
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                let addrs = adb.lookup(&name, &zone, options, now);
                let event = if addrs.is_empty() {
                    FindEvent::NoMoreAddresses
                } else {
                    FindEvent::MoreAddresses
                };
                notify(event);
            });
            return FindOutcome::Pending;
        }

        FindOutcome::Nothing
    }

    fn lookup(
        &self,
        name: &Name,
        zone: &Name,
        options: FindOptions,
        now: u64,
    ) -> Vec<Arc<AddrInfo>> {
        let mut addrs: Vec<Arc<AddrInfo>> = self
            .view
            .find_addresses(name, now, options.inet, options.inet6)
            .into_iter()
            .map(|ip| self.find_addrinfo(SocketAddr::new(ip, self.port)))
            .filter(|ai| !ai.is_lame(zone, now))
            .collect();
        addrs.sort_by_key(|ai| ai.srtt());
        addrs
    }

    /// Folds an RTT sample (microseconds) into the smoothed value.
    pub fn adjust_srtt(&self, addrinfo: &AddrInfo, rtt_us: u32, factor: Factor) {
        let new = match factor {
            Factor::Replace => rtt_us,
            Factor::Default => {
                let old = addrinfo.srtt();
                (old / 10).saturating_mul(7) + (rtt_us / 10).saturating_mul(3)
            }
        };
        trace!(server = %addrinfo.sockaddr(), srtt = new, "srtt adjusted");
        addrinfo.srtt.store(new, Ordering::Relaxed);
    }

    /// Sets the bits of `mask` to `bits` on the addrinfo's shared flags.
    pub fn change_flags(&self, addrinfo: &AddrInfo, mask: u32, bits: u32) {
        let mut current = addrinfo.flags();
        loop {
            let next = (current & !mask) | (bits & mask);
            match addrinfo.flags.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Records that the server does not serve `zone`, until `until`.
    pub fn mark_lame(&self, addrinfo: &AddrInfo, zone: &Name, until: u64) {
        debug!(server = %addrinfo.sockaddr(), zone = %zone, until, "marked lame");
        let mut lameness = addrinfo.lameness.lock();
        lameness.retain(|(lame_zone, _)| lame_zone != zone);
        lameness.push((zone.clone(), until));
    }
}
