//! The fetch context: the state machine for one question.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use burrow_adb::{AddrInfo, FindEvent, FindOptions, FindOutcome};
use burrow_cache::unix_now;
use burrow_proto::{Name, Rdata, RdataType, Rdataset};
use tracing::{debug, trace, warn};

use crate::{
    FetchOutcome, FetchOpts, ForwardPolicy, MAX_RESTARTS,
    events::{BucketEvent, EventSink, TimeoutKind},
    fetch::{FctxShared, FetchState},
    query::Query,
    resolver::ResolverInner,
    timer::RetryTimer,
};

/// Attribute bits of a fetch context, touched only on the bucket worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct FctxAttrs(u8);

impl FctxAttrs {
    /// The first subscriber's answer fields are populated.
    pub const HAVEANSWER: Self = Self(0x01);
    /// A relatedness scan is currently marking glue.
    pub const GLUING: Self = Self(0x02);
    /// Blocked waiting on an address-database find event.
    pub const ADDRWAIT: Self = Self(0x04);
    /// Shutdown has begun.
    pub const SHUTTINGDOWN: Self = Self(0x08);
    /// The classified response has names marked for the cache.
    pub const WANTCACHE: Self = Self(0x10);
    /// The classified response is negative and should be ncached.
    pub const WANTNCACHE: Self = Self(0x20);

    pub(crate) const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub(crate) const fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// One address candidate, with the per-fetch consumed mark.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub info: Arc<AddrInfo>,
    pub forwarder: bool,
    pub marked: bool,
}

impl Candidate {
    fn new(info: Arc<AddrInfo>, forwarder: bool) -> Self {
        Self {
            info,
            forwarder,
            marked: false,
        }
    }
}

/// The address a query will be sent to.
#[derive(Debug, Clone)]
pub(crate) struct SelectedAddr {
    pub info: Arc<AddrInfo>,
    pub forwarder: bool,
}

/// An address-database find's candidates, owned by the fetch.
#[derive(Debug)]
pub(crate) struct FctxFind {
    pub addrs: Vec<Candidate>,
}

/// Outcome of one round of address gathering.
pub(crate) enum GatherOutcome {
    /// At least one candidate is available.
    Success,
    /// Finds are pending; the fetch must suspend until an event arrives.
    Wait,
    /// No candidates and nothing pending.
    Fail(FetchOutcome),
}

/// The per-question state machine.
///
/// Everything here is owned by the bucket worker and touched only from
/// event handlers; the shared, locked half lives in [`FctxShared`].
pub(crate) struct FetchCtx {
    pub shared: Arc<FctxShared>,
    pub res: Arc<ResolverInner>,
    pub name: Name,
    pub rtype: RdataType,
    pub options: FetchOpts,

    /// Deepest zone whose NS set we believe; updated only on delegation.
    pub domain: Name,
    pub nameservers: Option<Rdataset>,
    /// Per-fetch forwarders, consulted before the resolver's.
    pub forwarders: Vec<SocketAddr>,

    pub queries: Vec<Query>,
    /// Queries canceled while a connect was in flight; freed when their
    /// connect event arrives (or the fetch is destroyed).
    pub parked: Vec<Query>,
    pub finds: Vec<FctxFind>,
    pub forwaddrs: Vec<Candidate>,
    /// Cursor into `finds` for round-robin address selection.
    pub find_cursor: Option<usize>,

    /// Address-database find events still owed to us.
    pub pending: u32,
    /// Validator jobs in flight. No validator is wired today, but the
    /// counter gates destruction so one can be dropped in later.
    pub validating: u32,
    pub restarts: u32,
    pub attributes: FctxAttrs,

    /// The most recently parsed response.
    pub rmessage: Option<burrow_proto::Message>,

    pub timer: RetryTimer,
    pub next_query_tag: u64,
    pub sink: EventSink,
}

impl FetchCtx {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shared: Arc<FctxShared>,
        res: Arc<ResolverInner>,
        name: Name,
        rtype: RdataType,
        options: FetchOpts,
        domain: Name,
        nameservers: Option<Rdataset>,
        forwarders: Vec<SocketAddr>,
        sink: EventSink,
        expires: Instant,
    ) -> Self {
        let timer = RetryTimer::new(sink.clone(), shared.id, expires);
        Self {
            shared,
            res,
            name,
            rtype,
            options,
            domain,
            nameservers,
            forwarders,
            queries: Vec::new(),
            parked: Vec::new(),
            finds: Vec::new(),
            forwaddrs: Vec::new(),
            find_cursor: None,
            pending: 0,
            validating: 0,
            restarts: 0,
            attributes: FctxAttrs::default(),
            rmessage: None,
            timer,
            next_query_tag: 0,
            sink,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    /// Sends one more query, gathering addresses first if the current
    /// candidate lists are spent.
    pub(crate) fn try_(&mut self) {
        debug_assert!(!self.attributes.contains(FctxAttrs::ADDRWAIT));

        let selected = match self.next_address() {
            Some(selected) => selected,
            None => {
                // Out of candidates: clear everything and start a new
                // round against (possibly refreshed) nameservers.
                self.cancel_queries(true);
                self.finds.clear();
                self.forwaddrs.clear();
                self.find_cursor = None;
                match self.get_addresses() {
                    GatherOutcome::Wait => {
                        trace!(fctx = self.id(), "waiting on address lookup");
                        self.attributes.insert(FctxAttrs::ADDRWAIT);
                        return;
                    }
                    GatherOutcome::Fail(outcome) => {
                        self.done(outcome);
                        return;
                    }
                    GatherOutcome::Success => match self.next_address() {
                        Some(selected) => selected,
                        None => {
                            // Gathering reported success, so a candidate
                            // should exist; losing it means every address
                            // was lame.
                            self.done(FetchOutcome::ServFail);
                            return;
                        }
                    },
                }
            }
        };

        if let Err(error) = self.query(&selected, self.options) {
            warn!(fctx = self.id(), %error, "query issuance failed");
            self.done(FetchOutcome::ServFail);
        }
    }

    /// Converts forwarders and the NS rdataset into candidate lists,
    /// consulting the address database.
    pub(crate) fn get_addresses(&mut self) -> GatherOutcome {
        self.restarts += 1;
        if self.restarts > MAX_RESTARTS {
            debug!(fctx = self.id(), "too many restarts");
            return GatherOutcome::Fail(FetchOutcome::ServFail);
        }

        let now = unix_now();
        let adb = Arc::clone(&self.res.adb);

        debug_assert!(self.forwaddrs.is_empty());
        let forwarders = if self.forwarders.is_empty() {
            self.res.forwarders.lock().clone()
        } else {
            self.forwarders.clone()
        };
        for sockaddr in forwarders {
            let info = adb.find_addrinfo(sockaddr);
            self.forwaddrs.push(Candidate::new(info, true));
        }

        let policy = *self.res.policy.lock();
        if policy != ForwardPolicy::Only {
            let std_options = FindOptions {
                inet: self.res.dispatch4.is_some(),
                inet6: self.res.dispatch6.is_some(),
                want_event: true,
                empty_event: true,
                avoid_fetches: true,
                start_at_root: false,
            };

            debug_assert!(self.finds.is_empty());
            let ns_names: Vec<Name> = self
                .nameservers
                .as_ref()
                .map(|rs| {
                    rs.rdatas
                        .iter()
                        .filter_map(|rdata| match rdata {
                            Rdata::Ns(name) => Some(name.clone()),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();

            for ns_name in ns_names {
                let mut options = std_options;
                // A nameserver under the query domain whose address we've
                // lost must be chased from the root, or stale glue
                // starves the fetch.
                if ns_name.is_subdomain(&self.domain) {
                    options.start_at_root = true;
                }

                let sink = self.sink.clone();
                let fctx = self.id();
                let outcome = burrow_adb::Adb::create_find(
                    &adb,
                    &ns_name,
                    &self.domain,
                    options,
                    now,
                    move |event| {
                        let _ = sink.send(BucketEvent::FindDone { fctx, event });
                    },
                );
                match outcome {
                    FindOutcome::Found(find) => {
                        self.finds.push(FctxFind {
                            addrs: find
                                .addrs()
                                .iter()
                                .map(|info| Candidate::new(Arc::clone(info), false))
                                .collect(),
                        });
                    }
                    FindOutcome::Pending => self.pending += 1,
                    FindOutcome::Nothing => {}
                }
            }
        }

        if self.finds.is_empty() && self.forwaddrs.is_empty() {
            if self.pending > 0 {
                GatherOutcome::Wait
            } else {
                // No addresses, and the address database cannot get them.
                GatherOutcome::Fail(FetchOutcome::ServFail)
            }
        } else {
            self.finds.sort_by_key(|find| {
                find.addrs
                    .first()
                    .map_or(u32::MAX, |candidate| candidate.info.srtt())
            });
            GatherOutcome::Success
        }
    }

    /// The next untried address: forwarders in fixed order first, then the
    /// finds round-robin starting after the last find used.
    pub(crate) fn next_address(&mut self) -> Option<SelectedAddr> {
        for candidate in &mut self.forwaddrs {
            if !candidate.marked {
                candidate.marked = true;
                self.find_cursor = None;
                return Some(SelectedAddr {
                    info: Arc::clone(&candidate.info),
                    forwarder: true,
                });
            }
        }

        let n = self.finds.len();
        if n == 0 {
            return None;
        }
        let order: Vec<usize> = match self.find_cursor {
            None => (0..n).collect(),
            Some(cursor) => ((cursor + 1)..n).chain(0..cursor).collect(),
        };
        for find_idx in order {
            if let Some(candidate) = self.finds[find_idx]
                .addrs
                .iter_mut()
                .find(|candidate| !candidate.marked)
            {
                candidate.marked = true;
                let selected = SelectedAddr {
                    info: Arc::clone(&candidate.info),
                    forwarder: false,
                };
                self.find_cursor = Some(find_idx);
                return Some(selected);
            }
        }
        None
    }

    /// An address-database find completed.
    pub(crate) fn find_done(&mut self, event: FindEvent) {
        self.pending = self.pending.saturating_sub(1);

        if self.attributes.contains(FctxAttrs::ADDRWAIT) {
            self.attributes.remove(FctxAttrs::ADDRWAIT);
            match event {
                FindEvent::MoreAddresses => self.try_(),
                FindEvent::NoMoreAddresses => {
                    if self.pending == 0 {
                        // Nothing left to wait for and no way to learn the
                        // answer.
                        self.done(FetchOutcome::ServFail);
                    } else {
                        self.attributes.insert(FctxAttrs::ADDRWAIT);
                    }
                }
            }
        }
        // When shutting down, the post-event destroy sweep notices the
        // pending count reaching zero.
    }

    /// The retry timer fired.
    pub(crate) fn on_timeout(&mut self, generation: u64, kind: TimeoutKind) {
        if generation != self.timer.generation() {
            return;
        }
        match kind {
            TimeoutKind::Lifetime => self.done(FetchOutcome::TimedOut),
            TimeoutKind::Idle => {
                // Existing queries stay alive; they may yet complete.
                self.attributes.remove(FctxAttrs::ADDRWAIT);
                self.try_();
            }
        }
    }

    /// Cancels queries, discards finds and candidates, stops the timer.
    pub(crate) fn stop_everything(&mut self) {
        self.cancel_queries(false);
        self.finds.clear();
        self.forwaddrs.clear();
        self.find_cursor = None;
        self.timer.stop();
    }

    /// Completes the fetch: stops all work, transitions to `Done`, and
    /// posts every subscriber's completion event.
    pub(crate) fn done(&mut self, outcome: FetchOutcome) {
        {
            let locked = self.shared.locked.lock();
            if locked.state == FetchState::Done {
                return;
            }
        }
        trace!(fctx = self.id(), ?outcome, "done");
        self.stop_everything();

        let have_answer = self.attributes.contains(FctxAttrs::HAVEANSWER);
        let mut locked = self.shared.locked.lock();
        locked.state = FetchState::Done;
        for subscriber in locked.subscribers.drain(..) {
            let override_outcome = if have_answer { None } else { Some(outcome) };
            subscriber.deliver(override_outcome);
        }
    }

    /// Runs the shutdown control event on the bucket worker.
    pub(crate) fn do_shutdown(&mut self) {
        self.attributes.insert(FctxAttrs::SHUTTINGDOWN);

        let state = self.shared.locked.lock().state;
        debug_assert!(self.shared.locked.lock().want_shutdown);
        if state != FetchState::Done {
            self.done(FetchOutcome::Canceled);
        }
    }

    /// Cancels every outstanding query.
    pub(crate) fn cancel_queries(&mut self, no_response: bool) {
        let tags: Vec<u64> = self.queries.iter().map(|query| query.tag).collect();
        for tag in tags {
            self.cancel_query(tag, None, no_response);
        }
    }

    /// Cancels one query, feeding RTT observations back to the address
    /// database.
    ///
    /// With a `finish` time the measured RTT is smoothed in; with
    /// `no_response` the smoothed RTT is penalized instead, because the
    /// packet was lost or the server is slow and we cannot tell which.
    pub(crate) fn cancel_query(
        &mut self,
        tag: u64,
        finish: Option<Instant>,
        no_response: bool,
    ) {
        let Some(idx) = self.queries.iter().position(|query| query.tag == tag) else {
            return;
        };
        debug_assert!(!self.queries[idx].canceled);

        let adb = Arc::clone(&self.res.adb);
        {
            let query = &mut self.queries[idx];
            query.canceled = true;

            if let Some(finish) = finish {
                let rtt = u32::try_from(
                    finish
                        .saturating_duration_since(query.start)
                        .as_micros(),
                )
                .unwrap_or(u32::MAX);
                adb.adjust_srtt(&query.addrinfo, rtt, burrow_adb::Factor::Default);
            } else if no_response {
                let rtt = no_response_rtt(query.addrinfo.srtt(), self.restarts);
                adb.adjust_srtt(&query.addrinfo, rtt, burrow_adb::Factor::Replace);
            }

            if let Some(entry) = query.entry.take() {
                query.dispatch.remove_response(&entry);
            }
        }

        let query = self.queries.remove(idx);
        if query.connecting {
            // Mid-connect; hold the query until its connect event arrives.
            self.parked.push(query);
        }
    }

    /// The interval before the next retry.
    pub(crate) fn retry_interval(&self, srtt_us: u32) -> std::time::Duration {
        std::time::Duration::from_secs(retry_interval_secs(self.restarts, srtt_us))
    }

    /// Marks the responding server lame for the current query domain.
    pub(crate) fn mark_broken(&self, addrinfo: &AddrInfo, now: u64) {
        self.res
            .adb
            .mark_lame(addrinfo, &self.domain, now + self.res.config.lame_ttl_secs);
    }

    /// Re-resolves the zone cut after following a referral.
    ///
    /// Fails when the view's best cut climbed back above the referral
    /// domain, which would walk the fetch upward forever.
    pub(crate) fn refresh_nameservers(&mut self, now: u64) -> Result<(), FetchOutcome> {
        match self.res.view.find_zonecut(&self.domain, now) {
            Ok((cut, nameservers)) => {
                if !cut.is_subdomain(&self.domain) {
                    debug!(fctx = self.id(), cut = %cut, domain = %self.domain,
                           "nameservers now above query domain");
                    return Err(FetchOutcome::ServFail);
                }
                self.domain = cut;
                self.nameservers = Some(nameservers);
                Ok(())
            }
            Err(error) => {
                debug!(fctx = self.id(), %error, "no zone cut after referral");
                Err(FetchOutcome::ServFail)
            }
        }
    }

}

/// Seconds before the next retry: 2 s for the first two rounds, then
/// exponential backoff capped at 30 s, never less than twice the smoothed
/// RTT.
pub(crate) fn retry_interval_secs(restarts: u32, srtt_us: u32) -> u64 {
    let mut seconds: u64 = if restarts < 3 {
        2
    } else {
        2u64 << (restarts - 1).min(30)
    };
    let doubled_rtt_secs = u64::from(srtt_us) / 500_000;
    if seconds < doubled_rtt_secs {
        seconds = doubled_rtt_secs;
    }
    if seconds > 30 {
        seconds = 30;
    }
    seconds
}

/// The penalty RTT recorded when a query got no response: the packet was
/// lost or the server is very slow, and we cannot tell which.
pub(crate) fn no_response_rtt(srtt_us: u32, restarts: u32) -> u32 {
    srtt_us
        .saturating_add(100_000u32.saturating_mul(restarts))
        .min(crate::MAX_NO_RESPONSE_RTT_US)
}
