//! Committing classified responses into the cache and populating
//! subscriber events.
//!
//! The first subscriber's out-fields are filled directly by the cache
//! layer as the answer is committed; the rest are cloned from it, so
//! every fetch joined to one context sees the same authoritative outcome
//! and shares one cache-node handle.

use burrow_cache::{AddOutcome, CacheEntry, NcacheOutcome};
use burrow_proto::{MessageName, NameAttrs, RdataType, RdatasetAttrs, Section, Trust};
use tracing::{debug, trace};

use crate::{
    FetchOutcome,
    fctx::{FctxAttrs, FetchCtx},
};

impl FetchCtx {
    /// Caches every name in the response marked cacheable.
    pub(crate) fn cache_message(&mut self, now: u64) -> Result<(), FetchOutcome> {
        self.attributes.remove(FctxAttrs::WANTCACHE);

        let Some(message) = self.rmessage.take() else {
            return Ok(());
        };

        let mut result = Ok(());
        'sections: for section in Section::ALL {
            for entry in message.section(section) {
                if !entry.attributes.contains(NameAttrs::CACHE) {
                    continue;
                }
                if let Err(error) = self.cache_name(entry, now) {
                    result = Err(error);
                    break 'sections;
                }
            }
        }

        self.rmessage = Some(message);
        result
    }

    /// Caches one owner name's marked rdatasets, populating the head
    /// subscriber when this name owns the answer.
    fn cache_name(&mut self, entry: &MessageName, now: u64) -> Result<(), FetchOutcome> {
        let name = &entry.name;
        // A name under a security root needs DNSSEC validation before
        // anything but glue may be cached. No validator is wired, so such
        // data is simply not committed.
        let need_validation = self.res.view.is_secure(name);

        let have_answer = entry.attributes.contains(NameAttrs::ANSWER);

        let Some(node) = self.res.view.cache().find_node(name, true) else {
            return Err(FetchOutcome::ServFail);
        };

        let mut eresult = FetchOutcome::Success;
        let mut answer_rdataset = None;
        let mut answer_sigrdataset = None;

        for rdataset in &entry.rdatasets {
            if !rdataset.attributes.contains(RdatasetAttrs::CACHE) {
                continue;
            }
            if need_validation && rdataset.trust != Trust::Glue {
                debug!(
                    fctx = self.id(),
                    name = %name,
                    rtype = %rdataset.rtype,
                    "secure name, no validator; not caching"
                );
                continue;
            }
            if rdataset.attributes.contains(RdatasetAttrs::EXTERNAL) {
                // Outside the bailiwick; cacheable only after validation.
                trace!(fctx = self.id(), name = %name, "external data not cached");
                continue;
            }

            if rdataset.attributes.contains(RdatasetAttrs::CHAINING) {
                eresult = if rdataset.rtype == RdataType::Cname {
                    FetchOutcome::Cname
                } else {
                    FetchOutcome::Dname
                };
            }

            let is_answer = rdataset.attributes.contains(RdatasetAttrs::ANSWER);
            let is_answersig = rdataset.attributes.contains(RdatasetAttrs::ANSWERSIG);

            match node.add_rdataset(now, rdataset) {
                AddOutcome::Added(stored) => {
                    if is_answer {
                        answer_rdataset = Some(stored);
                    } else if is_answersig {
                        answer_sigrdataset = Some(stored);
                    }
                }
                AddOutcome::Unchanged(existing) => {
                    if is_answer {
                        match existing {
                            CacheEntry::Negative(negative) => {
                                // The cache already holds a better,
                                // negative answer; that is the result the
                                // subscribers must see.
                                eresult = if negative.covers == RdataType::Any {
                                    FetchOutcome::NcacheNxDomain
                                } else {
                                    FetchOutcome::NcacheNxRrset
                                };
                                answer_rdataset = None;
                            }
                            CacheEntry::Positive(cached) => {
                                answer_rdataset = Some(cached);
                            }
                        }
                    } else if is_answersig
                        && let CacheEntry::Positive(cached) = existing
                    {
                        answer_sigrdataset = Some(cached);
                    }
                }
            }
        }

        if have_answer {
            self.attributes.insert(FctxAttrs::HAVEANSWER);
            let mut locked = self.shared.locked.lock();
            if let Some(head) = locked.subscribers.first_mut() {
                head.outcome = eresult;
                head.foundname = Some(name.clone());
                if self.rtype != RdataType::Any && self.rtype != RdataType::Sig {
                    head.rdataset = answer_rdataset;
                    head.sigrdataset = answer_sigrdataset;
                }
                head.node = Some(node);
                crate::fetch::clone_results(&mut locked.subscribers);
            }
        }

        Ok(())
    }

    /// Builds and commits the negative-cache entry for the response.
    pub(crate) fn ncache_message(
        &mut self,
        covers: RdataType,
        now: u64,
    ) -> Result<(), FetchOutcome> {
        self.attributes.remove(FctxAttrs::WANTNCACHE);

        if self.res.view.is_secure(&self.name) {
            debug!(
                fctx = self.id(),
                name = %self.name,
                "secure name, no validator; negative answer not cached"
            );
            return Ok(());
        }

        let Some(message) = self.rmessage.take() else {
            return Ok(());
        };

        let Some(node) = self.res.view.cache().find_node(&self.name, true) else {
            self.rmessage = Some(message);
            return Err(FetchOutcome::ServFail);
        };

        let outcome = self
            .res
            .view
            .cache()
            .ncache_add(&message, &node, covers, self.rtype, now);
        self.rmessage = Some(message);

        let eresult = match outcome {
            Ok(NcacheOutcome::Added) => {
                if covers == RdataType::Any {
                    FetchOutcome::NcacheNxDomain
                } else {
                    FetchOutcome::NcacheNxRrset
                }
            }
            Ok(NcacheOutcome::Unchanged(CacheEntry::Negative(negative))) => {
                // The cached negative entry is better than ours; surface
                // it instead.
                if negative.covers == RdataType::Any {
                    FetchOutcome::NcacheNxDomain
                } else {
                    FetchOutcome::NcacheNxRrset
                }
            }
            Ok(NcacheOutcome::Unchanged(CacheEntry::Positive(_))) => FetchOutcome::Success,
            Err(error) => {
                debug!(fctx = self.id(), %error, "negative cache insert failed");
                return Err(FetchOutcome::ServFail);
            }
        };

        if !self.attributes.contains(FctxAttrs::HAVEANSWER) {
            self.attributes.insert(FctxAttrs::HAVEANSWER);
            let mut locked = self.shared.locked.lock();
            if let Some(head) = locked.subscribers.first_mut() {
                head.outcome = eresult;
                head.foundname = Some(self.name.clone());
                head.node = Some(node);
                crate::fetch::clone_results(&mut locked.subscribers);
            }
        }

        Ok(())
    }
}
