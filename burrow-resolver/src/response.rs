//! Response classification: deciding what a reply means and marking what
//! it lets us cache.
//!
//! The classifier is a set of pure functions over a parsed message plus
//! the fetch's question and current query domain. They mark owner names
//! and rdatasets with attribute bits (cacheable, answer, glue, external,
//! chaining); the cache hand-off later walks the marks. `on_response`
//! strings the pieces together the way the protocol demands:
//! parse-fault recovery, truncation upgrade, header sanity, question
//! match, answer and no-answer processing, then caching and the follow-up
//! action.

use std::{sync::Arc, time::Instant};

use burrow_adb::flags as adbflags;
use burrow_cache::unix_now;
use burrow_proto::{
    Message, MessageName, Name, NameAttrs, Opcode, Rcode, Rdata, RdataType, Rdataset,
    RdatasetAttrs, Rclass, Trust, WireError,
};
use tracing::{debug, trace};

use crate::{
    FetchOpts, FetchOutcome,
    fctx::{FctxAttrs, FetchCtx, SelectedAddr},
};

/// How classification fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClassifyError {
    /// The peer sent something malformed; another server may do better.
    FormErr,
    /// Unrecoverable processing failure.
    Fatal,
}

/// What `answer_response` found.
#[derive(Debug)]
pub(crate) enum AnswerFlow {
    /// The chain ended in an answer; only authority NS marking remains.
    Complete,
    /// A CNAME/DNAME chain left the message before an answer was found;
    /// authority processing continues at the final query name.
    Chained(Name),
}

/// What `noanswer_response` found.
#[derive(Debug)]
pub(crate) enum NoanswerOutcome {
    /// Authoritative denial; the message should be negatively cached.
    Negative,
    /// A referral to a deeper zone cut.
    Referral { ns_name: Name },
    /// Nothing useful, but nothing wrong either (chain tails).
    Nothing,
}

/// Exactly one question, matching the fetch's name, type, and class.
pub(crate) fn same_question(
    message: &Message,
    name: &Name,
    rtype: RdataType,
    rclass: Rclass,
) -> Result<(), ClassifyError> {
    if message.questions.len() != 1 {
        return Err(ClassifyError::FormErr);
    }
    let question = &message.questions[0];
    if question.rtype != rtype || question.rclass != rclass || question.name != *name {
        return Err(ClassifyError::FormErr);
    }
    Ok(())
}

fn cname_target(rdataset: &Rdataset) -> Option<Name> {
    rdataset.rdatas.iter().find_map(|rdata| match rdata {
        Rdata::Cname(target) => Some(target.clone()),
        _ => None,
    })
}

/// Synthesizes the DNAME target: qname's prefix relative to the owner,
/// concatenated with the DNAME's right-hand side.
fn dname_target(
    rdataset: &Rdataset,
    qname: &Name,
    owner: &Name,
) -> Result<Option<Name>, ClassifyError> {
    let target = rdataset
        .rdatas
        .iter()
        .find_map(|rdata| match rdata {
            Rdata::Dname(target) => Some(target.clone()),
            _ => None,
        })
        .ok_or(ClassifyError::FormErr)?;

    let prefix = qname
        .prefix_of(owner)
        .map_err(|_| ClassifyError::FormErr)?;
    match Name::concatenate(&prefix, &target) {
        Ok(name) => Ok(Some(name)),
        // The synthesized name does not fit; chaining stops but caching
        // proceeds.
        Err(burrow_proto::NameError::NameTooLong) => Ok(None),
        Err(_) => Err(ClassifyError::FormErr),
    }
}

fn mark_related(entry_attrs: &mut NameAttrs, rdataset: &mut Rdataset, external: bool, gluing: bool) {
    entry_attrs.insert(NameAttrs::CACHE);
    rdataset.trust = if gluing {
        Trust::Glue
    } else {
        Trust::Additional
    };
    rdataset.attributes.insert(RdatasetAttrs::CACHE);
    if external {
        rdataset.attributes.insert(RdatasetAttrs::EXTERNAL);
    }
}

/// Marks additional-section data related to `addname`: for address
/// lookups, every A/AAAA rdataset (and their SIGs); otherwise exactly the
/// requested type and its SIG.
pub(crate) fn check_related(
    additional: &mut [MessageName],
    domain: &Name,
    gluing: bool,
    addname: &Name,
    rtype: RdataType,
) {
    let Some(entry) = additional.iter_mut().find(|entry| entry.name == *addname) else {
        return;
    };
    let external = !entry.name.is_subdomain(domain);

    if rtype == RdataType::A {
        for rdataset in &mut entry.rdatasets {
            let effective = rdataset.effective_type();
            if effective == RdataType::A || effective == RdataType::Aaaa {
                mark_related(&mut entry.attributes, rdataset, external, gluing);
            }
        }
    } else {
        for rdataset in &mut entry.rdatasets {
            if rdataset.rtype == rtype
                || (rdataset.rtype == RdataType::Sig && rdataset.covers == Some(rtype))
            {
                mark_related(&mut entry.attributes, rdataset, external, gluing);
            }
        }
    }
}

/// Walks the answer section, following CNAME/DNAME chains and marking the
/// answer and everything cacheable along the way.
#[allow(clippy::too_many_lines)]
pub(crate) fn answer_response(
    message: &mut Message,
    fctx_name: &Name,
    qtype: RdataType,
    domain: &Name,
) -> Result<AnswerFlow, ClassifyError> {
    let aa = message.flags.aa;
    let mut qname = fctx_name.clone();
    let mut done = false;
    let mut chaining = false;
    let mut have_answer = false;
    let mut want_chaining = false;

    for i in 0..message.answers.len() {
        if done {
            break;
        }
        let external = !message.answers[i].name.is_subdomain(domain);

        if message.answers[i].name == qname {
            for j in 0..message.answers[i].rdatasets.len() {
                let (rtype, covers) = {
                    let rdataset = &message.answers[i].rdatasets[j];
                    (rdataset.rtype, rdataset.covers)
                };
                let mut found = false;
                want_chaining = false;
                let mut aflag = RdatasetAttrs::default();
                let mut chain_target = None;

                if rtype == qtype || qtype == RdataType::Any {
                    // An ordinary answer.
                    found = true;
                    done = true;
                    aflag = RdatasetAttrs::ANSWER;
                } else if rtype == RdataType::Sig && covers == Some(qtype) {
                    found = true;
                    aflag = RdatasetAttrs::ANSWERSIG;
                } else if rtype == RdataType::Cname {
                    // A CNAME for these types is never legitimate.
                    if matches!(qtype, RdataType::Sig | RdataType::Key | RdataType::Nxt) {
                        return Err(ClassifyError::FormErr);
                    }
                    found = true;
                    want_chaining = true;
                    aflag = RdatasetAttrs::ANSWER;
                    chain_target = Some(
                        cname_target(&message.answers[i].rdatasets[j])
                            .ok_or(ClassifyError::FormErr)?,
                    );
                } else if rtype == RdataType::Sig && covers == Some(RdataType::Cname) {
                    found = true;
                    aflag = RdatasetAttrs::ANSWERSIG;
                }

                if found {
                    let related: Vec<Name>;
                    {
                        let entry = &mut message.answers[i];
                        entry.attributes.insert(NameAttrs::CACHE);
                        let rdataset = &mut entry.rdatasets[j];
                        rdataset.attributes.insert(RdatasetAttrs::CACHE);
                        rdataset.trust = Trust::Answer;
                        if chaining {
                            if external {
                                // Past the chain start and outside the
                                // query domain: cacheable only once it
                                // validates.
                                rdataset.attributes.insert(RdatasetAttrs::EXTERNAL);
                            }
                        } else {
                            if external {
                                return Err(ClassifyError::FormErr);
                            }
                            if aflag == RdatasetAttrs::ANSWER {
                                have_answer = true;
                            }
                            entry.attributes.insert(NameAttrs::ANSWER);
                            rdataset.attributes.insert(aflag);
                            if aa {
                                rdataset.trust = Trust::AuthAnswer;
                            }
                        }
                        related = rdataset.additional_names().cloned().collect();
                    }
                    for target in related {
                        check_related(&mut message.additional, domain, false, &target, RdataType::A);
                    }
                    if want_chaining {
                        chaining = true;
                        message.answers[i].rdatasets[j]
                            .attributes
                            .insert(RdatasetAttrs::CHAINING);
                        qname = chain_target.ok_or(ClassifyError::Fatal)?;
                    }
                }
            }
        } else {
            // A name other than the current qname can only be useful as a
            // DNAME (or its SIG).
            for j in 0..message.answers[i].rdatasets.len() {
                let (rtype, covers) = {
                    let rdataset = &message.answers[i].rdatasets[j];
                    (rdataset.rtype, rdataset.covers)
                };
                let mut found = false;
                want_chaining = false;
                let mut aflag = RdatasetAttrs::default();
                let mut chain_target = None;

                if rtype == RdataType::Dname {
                    if !chaining && external {
                        return Err(ClassifyError::FormErr);
                    }
                    found = true;
                    want_chaining = true;
                    aflag = RdatasetAttrs::ANSWER;
                    let owner = message.answers[i].name.clone();
                    match dname_target(&message.answers[i].rdatasets[j], &qname, &owner)? {
                        Some(target) => chain_target = Some(target),
                        None => want_chaining = false,
                    }
                } else if rtype == RdataType::Sig && covers == Some(RdataType::Dname) {
                    found = true;
                    aflag = RdatasetAttrs::ANSWERSIG;
                }

                if found {
                    {
                        let entry = &mut message.answers[i];
                        entry.attributes.insert(NameAttrs::CACHE);
                        let rdataset = &mut entry.rdatasets[j];
                        rdataset.attributes.insert(RdatasetAttrs::CACHE);
                        rdataset.trust = Trust::Answer;
                        if chaining {
                            if external {
                                rdataset.attributes.insert(RdatasetAttrs::EXTERNAL);
                            }
                        } else {
                            if external {
                                return Err(ClassifyError::FormErr);
                            }
                            if aflag == RdatasetAttrs::ANSWER {
                                have_answer = true;
                            }
                            entry.attributes.insert(NameAttrs::ANSWER);
                            rdataset.attributes.insert(aflag);
                            if aa {
                                rdataset.trust = Trust::AuthAnswer;
                            }
                        }
                    }
                    if want_chaining {
                        chaining = true;
                        message.answers[i].rdatasets[j]
                            .attributes
                            .insert(RdatasetAttrs::CHAINING);
                        qname = chain_target.ok_or(ClassifyError::Fatal)?;
                    }
                }
            }
        }
    }

    if !have_answer {
        return Err(ClassifyError::FormErr);
    }

    if want_chaining {
        // The chain left the message; the authority section may still
        // hold a negative answer or a referral for the target.
        return Ok(AnswerFlow::Chained(qname));
    }

    // A finished chain with anything but NOERROR is nonsense.
    if message.rcode != Rcode::NoError {
        return Err(ClassifyError::FormErr);
    }

    // The authority section of an answer should hold one non-external
    // name with NS (and SIG NS) rdatasets; stop at the first one found.
    let mut done_authority = false;
    for i in 0..message.authority.len() {
        if done_authority {
            break;
        }
        let external = !message.authority[i].name.is_subdomain(domain);
        if !external {
            for j in 0..message.authority[i].rdatasets.len() {
                let (rtype, covers) = {
                    let rdataset = &message.authority[i].rdatasets[j];
                    (rdataset.rtype, rdataset.covers)
                };
                if rtype == RdataType::Ns
                    || (rtype == RdataType::Sig && covers == Some(RdataType::Ns))
                {
                    let related: Vec<Name>;
                    {
                        let entry = &mut message.authority[i];
                        entry.attributes.insert(NameAttrs::CACHE);
                        let rdataset = &mut entry.rdatasets[j];
                        rdataset.attributes.insert(RdatasetAttrs::CACHE);
                        rdataset.trust = if aa && !chaining {
                            Trust::AuthAuthority
                        } else {
                            Trust::Additional
                        };
                        related = rdataset.additional_names().cloned().collect();
                    }
                    for target in related {
                        check_related(&mut message.additional, domain, false, &target, RdataType::A);
                    }
                }
            }
            done_authority = true;
        }
    }

    Ok(AnswerFlow::Complete)
}

/// Classifies a response with no usable answer: negative answer,
/// referral, or nothing.
#[allow(clippy::too_many_lines)]
pub(crate) fn noanswer_response(
    message: &mut Message,
    domain: &Name,
    oqname: Option<&Name>,
) -> Result<NoanswerOutcome, ClassifyError> {
    let aa = match oqname {
        // Invoked from answer_response after it followed a chain.
        Some(oqname) => {
            // Outside the query domain the authority section means
            // nothing without validation.
            if !oqname.is_subdomain(domain) {
                return Ok(NoanswerOutcome::Nothing);
            }
            false
        }
        None => message.flags.aa,
    };

    let mut negative = message.rcode == Rcode::NxDomain
        || (message.answers.is_empty() && message.authority.is_empty());

    let mut ns_name: Option<Name> = None;
    let mut ns_entry: Option<(usize, usize)> = None;
    let mut soa_name: Option<Name> = None;

    for i in 0..message.authority.len() {
        if !message.authority[i].name.is_subdomain(domain) {
            continue;
        }
        for j in 0..message.authority[i].rdatasets.len() {
            let rtype = message.authority[i].rdatasets[j].rtype;
            match rtype {
                RdataType::Ns => {
                    // Only one NS set is allowed.
                    if let Some(existing) = &ns_name
                        && *existing != message.authority[i].name
                    {
                        return Err(ClassifyError::FormErr);
                    }
                    ns_name = Some(message.authority[i].name.clone());
                    ns_entry = Some((i, j));
                    let entry = &mut message.authority[i];
                    entry.attributes.insert(NameAttrs::CACHE);
                    let rdataset = &mut entry.rdatasets[j];
                    rdataset.attributes.insert(RdatasetAttrs::CACHE);
                    rdataset.trust = Trust::Glue;
                }
                RdataType::Soa | RdataType::Nxt => {
                    // Only one SOA name is allowed.
                    if let Some(existing) = &soa_name
                        && *existing != message.authority[i].name
                    {
                        return Err(ClassifyError::FormErr);
                    }
                    soa_name = Some(message.authority[i].name.clone());
                    negative = true;
                    let entry = &mut message.authority[i];
                    entry.attributes.insert(NameAttrs::NCACHE);
                    let rdataset = &mut entry.rdatasets[j];
                    rdataset.attributes.insert(RdatasetAttrs::NCACHE);
                    rdataset.trust = if aa {
                        Trust::AuthAuthority
                    } else {
                        Trust::Additional
                    };
                }
                _ => {}
            }
        }
    }

    if !negative && ns_name.is_none() {
        return if oqname.is_some() {
            // A partial chain with nothing useful here; the answer part
            // already succeeded.
            Ok(NoanswerOutcome::Nothing)
        } else {
            // The responder is insane.
            Err(ClassifyError::FormErr)
        };
    }

    if let (Some(ns), Some(soa)) = (&ns_name, &soa_name)
        && ns != soa
    {
        return Err(ClassifyError::FormErr);
    }

    // A referral is followed only when we're not following a chain.
    if !negative
        && let Some(ns_name) = ns_name.clone()
        && oqname.is_none()
    {
        // Mark the glue before the caller swaps the query domain.
        if let Some((i, j)) = ns_entry {
            let related: Vec<Name> = message.authority[i].rdatasets[j]
                .additional_names()
                .cloned()
                .collect();
            for target in related {
                check_related(&mut message.additional, domain, true, &target, RdataType::A);
            }
        }
        return Ok(NoanswerOutcome::Referral { ns_name });
    }

    // Not a referral, so any NS set found along the way must not be
    // cached.
    if ns_name.is_some()
        && let Some((i, _)) = ns_entry
    {
        message.authority[i].attributes.remove(NameAttrs::CACHE);
    }

    if negative {
        Ok(NoanswerOutcome::Negative)
    } else {
        Ok(NoanswerOutcome::Nothing)
    }
}

impl FetchCtx {
    /// Handles a response event for query `tag`.
    #[allow(clippy::too_many_lines, clippy::cognitive_complexity)]
    pub(crate) fn on_response(&mut self, tag: u64, wire: &[u8], finish: Instant) {
        let Some(query_idx) = self
            .queries
            .iter()
            .position(|query| query.tag == tag && !query.canceled)
        else {
            return;
        };
        self.timer.touch();

        let (query_options, addrinfo, forwarder) = {
            let query = &self.queries[query_idx];
            (query.options, Arc::clone(&query.addrinfo), query.forwarder)
        };

        let mut options = query_options;
        let mut keep_trying = false;
        let mut broken_server = false;
        let mut get_nameservers = false;
        let mut resend = false;
        let mut result: Result<(), FetchOutcome> = Ok(());
        let now = unix_now();

        'classify: {
            let mut truncated = false;
            let parsed = match Message::from_wire(wire) {
                Ok(message) => Some(message),
                Err(WireError::UnexpectedEnd {
                    question_ok,
                    truncated: tc,
                }) => {
                    if !question_ok || !tc || options.contains(FetchOpts::TCP) {
                        // The message ended prematurely without being
                        // truncated (or came over TCP): likely an EDNS0
                        // casualty, otherwise a broken server.
                        if query_options.contains(FetchOpts::NOEDNS0) {
                            broken_server = true;
                            keep_trying = true;
                        } else {
                            options.insert(FetchOpts::NOEDNS0);
                            resend = true;
                            self.res.adb.change_flags(
                                &addrinfo,
                                adbflags::NOEDNS0,
                                adbflags::NOEDNS0,
                            );
                        }
                        break 'classify;
                    }
                    // Truncated mid-record; decide on the TCP upgrade
                    // below.
                    truncated = true;
                    None
                }
                Err(WireError::FormErr(reason)) => {
                    trace!(fctx = self.id(), reason, "malformed response");
                    if query_options.contains(FetchOpts::NOEDNS0) {
                        broken_server = true;
                        keep_trying = true;
                    } else {
                        options.insert(FetchOpts::NOEDNS0);
                        resend = true;
                        self.res
                            .adb
                            .change_flags(&addrinfo, adbflags::NOEDNS0, adbflags::NOEDNS0);
                    }
                    break 'classify;
                }
                Err(error) => {
                    debug!(fctx = self.id(), %error, "response unusable");
                    result = Err(FetchOutcome::ServFail);
                    break 'classify;
                }
            };

            if parsed.as_ref().is_some_and(|message| message.flags.tc) {
                truncated = true;
            }
            if truncated {
                if options.contains(FetchOpts::TCP) {
                    // Still truncated over TCP; the server is broken.
                    broken_server = true;
                    keep_trying = true;
                } else {
                    options.insert(FetchOpts::TCP);
                    resend = true;
                }
                break 'classify;
            }
            let Some(mut message) = parsed else {
                result = Err(FetchOutcome::ServFail);
                break 'classify;
            };

            if message.opcode != Opcode::Query {
                broken_server = true;
                keep_trying = true;
                break 'classify;
            }

            if message.rcode != Rcode::NoError && message.rcode != Rcode::NxDomain {
                if message.rcode == Rcode::FormErr && !query_options.contains(FetchOpts::NOEDNS0)
                {
                    // Very likely an EDNS0 rejection.
                    options.insert(FetchOpts::NOEDNS0);
                    resend = true;
                    self.res
                        .adb
                        .change_flags(&addrinfo, adbflags::NOEDNS0, adbflags::NOEDNS0);
                } else {
                    broken_server = true;
                    keep_trying = true;
                }
                break 'classify;
            }

            if let Err(error) = same_question(&message, &self.name, self.rtype, self.res.rdclass)
            {
                match error {
                    ClassifyError::FormErr => {
                        keep_trying = true;
                        result = Err(FetchOutcome::FormErr);
                    }
                    ClassifyError::Fatal => result = Err(FetchOutcome::ServFail),
                }
                break 'classify;
            }

            if !message.answers.is_empty() {
                match answer_response(&mut message, &self.name, self.rtype, &self.domain) {
                    Ok(AnswerFlow::Complete) => {
                        self.attributes.insert(FctxAttrs::WANTCACHE);
                    }
                    Ok(AnswerFlow::Chained(chained)) => {
                        self.attributes.insert(FctxAttrs::WANTCACHE);
                        self.attributes.insert(FctxAttrs::GLUING);
                        let outcome =
                            noanswer_response(&mut message, &self.domain, Some(&chained));
                        self.attributes.remove(FctxAttrs::GLUING);
                        match outcome {
                            Ok(outcome) => self.apply_noanswer(
                                outcome,
                                &mut get_nameservers,
                                &mut keep_trying,
                            ),
                            Err(ClassifyError::FormErr) => {
                                keep_trying = true;
                                result = Err(FetchOutcome::FormErr);
                                break 'classify;
                            }
                            Err(ClassifyError::Fatal) => {
                                result = Err(FetchOutcome::ServFail);
                                break 'classify;
                            }
                        }
                    }
                    Err(ClassifyError::FormErr) => {
                        keep_trying = true;
                        result = Err(FetchOutcome::FormErr);
                        break 'classify;
                    }
                    Err(ClassifyError::Fatal) => {
                        result = Err(FetchOutcome::ServFail);
                        break 'classify;
                    }
                }
            } else if !message.authority.is_empty()
                || matches!(message.rcode, Rcode::NoError | Rcode::NxDomain)
            {
                // NXDOMAIN, NXRRSET, or a referral.
                self.attributes.insert(FctxAttrs::GLUING);
                let outcome = noanswer_response(&mut message, &self.domain, None);
                self.attributes.remove(FctxAttrs::GLUING);
                match outcome {
                    Ok(outcome) => {
                        self.apply_noanswer(outcome, &mut get_nameservers, &mut keep_trying);
                    }
                    Err(ClassifyError::FormErr) => {
                        keep_trying = true;
                        result = Err(FetchOutcome::FormErr);
                        break 'classify;
                    }
                    Err(ClassifyError::Fatal) => {
                        result = Err(FetchOutcome::ServFail);
                        break 'classify;
                    }
                }
            } else {
                // The server is insane.
                broken_server = true;
                keep_trying = true;
                break 'classify;
            }

            let rcode = message.rcode;
            self.rmessage = Some(message);

            // Commit the cacheable parts; this is also where validator
            // work would be queued.
            if result.is_ok() && self.attributes.contains(FctxAttrs::WANTCACHE) {
                result = self.cache_message(now);
            }
            if result.is_ok() && self.attributes.contains(FctxAttrs::WANTNCACHE) {
                let covers = if rcode == Rcode::NxDomain {
                    RdataType::Any
                } else {
                    self.rtype
                };
                result = self.ncache_message(covers, now);
            }
        }

        self.cancel_query(tag, Some(finish), false);

        if keep_trying {
            if matches!(result, Err(FetchOutcome::FormErr)) {
                broken_server = true;
            }
            if broken_server {
                self.mark_broken(&addrinfo, now);
            }
            if get_nameservers {
                if let Err(outcome) = self.refresh_nameservers(now) {
                    self.done(outcome);
                    return;
                }
                self.cancel_queries(true);
                self.finds.clear();
                self.forwaddrs.clear();
                self.find_cursor = None;
            }
            self.try_();
        } else if resend {
            let selected = SelectedAddr {
                info: addrinfo,
                forwarder,
            };
            if self.query(&selected, options).is_err() {
                self.done(FetchOutcome::ServFail);
            }
        } else if result.is_ok() && !self.attributes.contains(FctxAttrs::HAVEANSWER) {
            // All well so far, but the answer awaits validation; hold the
            // fetch open under its lifetime deadline only.
            self.cancel_queries(true);
            self.timer.start_lifetime_only();
        } else {
            match result {
                Ok(()) => self.done(FetchOutcome::Success),
                Err(outcome) => self.done(outcome),
            }
        }
    }

    fn apply_noanswer(
        &mut self,
        outcome: NoanswerOutcome,
        get_nameservers: &mut bool,
        keep_trying: &mut bool,
    ) {
        match outcome {
            NoanswerOutcome::Negative => {
                self.attributes.insert(FctxAttrs::WANTNCACHE);
            }
            NoanswerOutcome::Referral { ns_name } => {
                // We don't have the answer, but we know a better place to
                // look: swap the query domain and re-resolve its NS
                // addresses once the glue is cached.
                self.domain = ns_name;
                self.nameservers = None;
                self.attributes.insert(FctxAttrs::WANTCACHE);
                *get_nameservers = true;
                *keep_trying = true;
            }
            NoanswerOutcome::Nothing => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn rdataset(rtype: RdataType, rdata: Rdata) -> Rdataset {
        let mut rs = Rdataset::new(rtype, 3600);
        rs.rdatas.push(rdata);
        rs
    }

    fn push(message: &mut Message, section: burrow_proto::Section, owner: &str, rs: Rdataset) {
        let idx = message.entry_for(section, &name(owner));
        message.section_mut(section)[idx].rdatasets.push(rs);
    }

    fn response(aa: bool) -> Message {
        let mut message =
            Message::query(1, name("www.example.com"), RdataType::A, Rclass::In);
        message.flags.qr = true;
        message.flags.aa = aa;
        message
    }

    #[test]
    fn test_same_question() {
        let message = response(true);
        assert!(same_question(&message, &name("www.example.com"), RdataType::A, Rclass::In).is_ok());
        assert!(
            same_question(&message, &name("www.example.org"), RdataType::A, Rclass::In).is_err()
        );
        assert!(
            same_question(&message, &name("www.example.com"), RdataType::Aaaa, Rclass::In)
                .is_err()
        );
    }

    #[test]
    fn test_ordinary_answer_marked() {
        let mut message = response(true);
        push(
            &mut message,
            burrow_proto::Section::Answer,
            "www.example.com",
            rdataset(RdataType::A, Rdata::A("93.184.216.34".parse().unwrap())),
        );

        let flow = answer_response(
            &mut message,
            &name("www.example.com"),
            RdataType::A,
            &Name::root(),
        )
        .unwrap();
        assert!(matches!(flow, AnswerFlow::Complete));

        let entry = &message.answers[0];
        assert!(entry.attributes.contains(NameAttrs::CACHE));
        assert!(entry.attributes.contains(NameAttrs::ANSWER));
        let rs = &entry.rdatasets[0];
        assert!(rs.attributes.contains(RdatasetAttrs::CACHE));
        assert!(rs.attributes.contains(RdatasetAttrs::ANSWER));
        assert_eq!(rs.trust, Trust::AuthAnswer);
    }

    #[test]
    fn test_cname_chain_completed_in_message() {
        let mut message = response(false);
        push(
            &mut message,
            burrow_proto::Section::Answer,
            "www.example.com",
            rdataset(RdataType::Cname, Rdata::Cname(name("web.example.com"))),
        );
        push(
            &mut message,
            burrow_proto::Section::Answer,
            "web.example.com",
            rdataset(RdataType::A, Rdata::A("93.184.216.34".parse().unwrap())),
        );

        let flow = answer_response(
            &mut message,
            &name("www.example.com"),
            RdataType::A,
            &Name::root(),
        )
        .unwrap();
        assert!(matches!(flow, AnswerFlow::Complete));

        // The CNAME is the answer and carries the chaining mark; the
        // target keeps plain answer trust.
        let cname = &message.answers[0].rdatasets[0];
        assert!(cname.attributes.contains(RdatasetAttrs::ANSWER));
        assert!(cname.attributes.contains(RdatasetAttrs::CHAINING));
        let target = &message.answers[1].rdatasets[0];
        assert!(target.attributes.contains(RdatasetAttrs::CACHE));
        assert!(!target.attributes.contains(RdatasetAttrs::ANSWER));
        assert_eq!(target.trust, Trust::Answer);
    }

    #[test]
    fn test_cname_chain_leaving_message_chains() {
        let mut message = response(false);
        push(
            &mut message,
            burrow_proto::Section::Answer,
            "www.example.com",
            rdataset(RdataType::Cname, Rdata::Cname(name("elsewhere.example.net"))),
        );

        let flow = answer_response(
            &mut message,
            &name("www.example.com"),
            RdataType::A,
            &Name::root(),
        )
        .unwrap();
        match flow {
            AnswerFlow::Chained(qname) => assert_eq!(qname, name("elsewhere.example.net")),
            AnswerFlow::Complete => panic!("expected a chained flow"),
        }
    }

    #[test]
    fn test_cname_for_sig_query_is_formerr() {
        let mut message = Message::query(1, name("www.example.com"), RdataType::Sig, Rclass::In);
        message.flags.qr = true;
        push(
            &mut message,
            burrow_proto::Section::Answer,
            "www.example.com",
            rdataset(RdataType::Cname, Rdata::Cname(name("web.example.com"))),
        );

        let result = answer_response(
            &mut message,
            &name("www.example.com"),
            RdataType::Sig,
            &Name::root(),
        );
        assert!(matches!(result, Err(ClassifyError::FormErr)));
    }

    #[test]
    fn test_dname_synthesizes_target() {
        let mut message = response(true);
        push(
            &mut message,
            burrow_proto::Section::Answer,
            "example.com",
            rdataset(RdataType::Dname, Rdata::Dname(name("example.net"))),
        );

        let flow = answer_response(
            &mut message,
            &name("www.example.com"),
            RdataType::A,
            &Name::root(),
        )
        .unwrap();
        match flow {
            AnswerFlow::Chained(qname) => assert_eq!(qname, name("www.example.net")),
            AnswerFlow::Complete => panic!("expected a chained flow"),
        }
    }

    #[test]
    fn test_referral_marks_glue() {
        let mut message = response(false);
        push(
            &mut message,
            burrow_proto::Section::Authority,
            "example.com",
            rdataset(RdataType::Ns, Rdata::Ns(name("ns.example.com"))),
        );
        push(
            &mut message,
            burrow_proto::Section::Additional,
            "ns.example.com",
            rdataset(RdataType::A, Rdata::A("203.0.113.1".parse().unwrap())),
        );

        let outcome = noanswer_response(&mut message, &Name::root(), None).unwrap();
        match outcome {
            NoanswerOutcome::Referral { ns_name } => assert_eq!(ns_name, name("example.com")),
            other => panic!("expected a referral: {other:?}"),
        }

        let ns = &message.authority[0].rdatasets[0];
        assert!(ns.attributes.contains(RdatasetAttrs::CACHE));
        assert_eq!(ns.trust, Trust::Glue);
        let glue = &message.additional[0].rdatasets[0];
        assert!(glue.attributes.contains(RdatasetAttrs::CACHE));
        assert_eq!(glue.trust, Trust::Glue);
    }

    #[test]
    fn test_negative_answer_marks_soa() {
        let mut message = response(true);
        message.rcode = Rcode::NxDomain;
        push(
            &mut message,
            burrow_proto::Section::Authority,
            "example.com",
            rdataset(
                RdataType::Soa,
                Rdata::Soa {
                    mname: name("ns.example.com"),
                    rname: name("hostmaster.example.com"),
                    serial: 1,
                    refresh: 7200,
                    retry: 3600,
                    expire: 1_209_600,
                    minimum: 300,
                },
            ),
        );

        let outcome = noanswer_response(&mut message, &Name::root(), None).unwrap();
        assert!(matches!(outcome, NoanswerOutcome::Negative));

        let entry = &message.authority[0];
        assert!(entry.attributes.contains(NameAttrs::NCACHE));
        let soa = &entry.rdatasets[0];
        assert!(soa.attributes.contains(RdatasetAttrs::NCACHE));
        assert_eq!(soa.trust, Trust::AuthAuthority);
    }

    #[test]
    fn test_two_ns_names_are_formerr() {
        let mut message = response(false);
        push(
            &mut message,
            burrow_proto::Section::Authority,
            "example.com",
            rdataset(RdataType::Ns, Rdata::Ns(name("ns1.example.com"))),
        );
        push(
            &mut message,
            burrow_proto::Section::Authority,
            "example.org",
            rdataset(RdataType::Ns, Rdata::Ns(name("ns1.example.org"))),
        );

        // Both names sit under the root domain, so both are considered,
        // and two distinct NS owner names are nonsense.
        let result = noanswer_response(&mut message, &Name::root(), None);
        assert!(matches!(result, Err(ClassifyError::FormErr)));
    }

    #[test]
    fn test_external_authority_ignored() {
        let mut message = response(false);
        push(
            &mut message,
            burrow_proto::Section::Authority,
            "example.org",
            rdataset(RdataType::Ns, Rdata::Ns(name("ns1.example.org"))),
        );

        // Under a "com" bailiwick an example.org NS set means nothing,
        // and an empty useful-content response is a protocol error.
        let result = noanswer_response(&mut message, &name("com"), None);
        assert!(matches!(result, Err(ClassifyError::FormErr)));
    }
}
