//! One in-flight request to one remote server over one transport.

use std::{sync::Arc, time::Instant};

use burrow_adb::AddrInfo;
use burrow_dispatch::{Dispatch, DispatchError, ResponseEntry, TcpDispatch};
use tracing::{trace, warn};

use crate::{
    FetchOpts, ResolverError, SEND_BUFFER_SIZE,
    events::BucketEvent,
    fctx::{FetchCtx, SelectedAddr},
};

/// An in-flight query: a dispatcher response slot, a transport, and the
/// timing needed for RTT feedback.
pub(crate) struct Query {
    pub tag: u64,
    pub addrinfo: Arc<AddrInfo>,
    pub forwarder: bool,
    pub dispatch: Arc<dyn Dispatch>,
    pub entry: Option<ResponseEntry>,
    pub options: FetchOpts,
    pub start: Instant,
    pub connecting: bool,
    pub canceled: bool,
}

impl FetchCtx {
    /// Issues one query toward `selected`, arming the retry timer first.
    pub(crate) fn query(
        &mut self,
        selected: &SelectedAddr,
        options: FetchOpts,
    ) -> Result<(), ResolverError> {
        let interval = self.retry_interval(selected.info.srtt());
        self.timer.start(interval);
        self.rmessage = None;

        let tag = self.next_query_tag;
        self.next_query_tag += 1;

        let result = if options.contains(FetchOpts::TCP) {
            self.start_tcp_query(tag, selected, options)
        } else {
            self.start_udp_query(tag, selected, options)
        };

        if result.is_err() {
            self.timer.stop();
        }
        result
    }

    fn start_tcp_query(
        &mut self,
        tag: u64,
        selected: &SelectedAddr,
        options: FetchOpts,
    ) -> Result<(), ResolverError> {
        let peer = selected.info.sockaddr();
        let sink = self.sink.clone();
        let fctx = self.id();
        // The query needs a socket and a private dispatcher of its own;
        // sending waits for the connect event.
        let dispatch = TcpDispatch::connect(
            peer,
            Box::new(move |result| {
                let _ = sink.send(BucketEvent::Connected {
                    fctx,
                    query: tag,
                    result,
                });
            }),
        );
        trace!(fctx = self.id(), %peer, "connecting via tcp");

        self.queries.push(Query {
            tag,
            addrinfo: Arc::clone(&selected.info),
            forwarder: selected.forwarder,
            dispatch,
            entry: None,
            options,
            start: Instant::now(),
            connecting: true,
            canceled: false,
        });
        Ok(())
    }

    fn start_udp_query(
        &mut self,
        tag: u64,
        selected: &SelectedAddr,
        options: FetchOpts,
    ) -> Result<(), ResolverError> {
        let peer = selected.info.sockaddr();
        let dispatch = match peer {
            std::net::SocketAddr::V4(_) => self.res.dispatch4.clone(),
            std::net::SocketAddr::V6(_) => self.res.dispatch6.clone(),
        }
        .ok_or(DispatchError::NotConnected(peer))?;

        self.queries.push(Query {
            tag,
            addrinfo: Arc::clone(&selected.info),
            forwarder: selected.forwarder,
            dispatch,
            entry: None,
            options,
            start: Instant::now(),
            connecting: false,
            canceled: false,
        });

        if let Err(error) = self.send_query(tag) {
            // The query never got on the wire; drop it rather than park.
            self.queries.retain(|query| query.tag != tag);
            return Err(error);
        }
        Ok(())
    }

    /// Renders and sends the query message; shared by the UDP path and the
    /// TCP connected event.
    pub(crate) fn send_query(&mut self, tag: u64) -> Result<(), ResolverError> {
        let Some(idx) = self.queries.iter().position(|query| query.tag == tag) else {
            return Ok(());
        };

        let peer = self.queries[idx].addrinfo.sockaddr();
        let sink = self.sink.clone();
        let fctx = self.id();
        let handler: burrow_dispatch::ResponseHandler = Box::new(move |wire| {
            let _ = sink.send(BucketEvent::Response {
                fctx,
                query: tag,
                wire,
                finish: Instant::now(),
            });
        });

        let entry = self.queries[idx].dispatch.add_response(peer, handler)?;
        let id = entry.id;
        self.queries[idx].entry = Some(entry);

        let wire = match self.render_query(idx, id) {
            Ok(wire) => wire,
            Err(error) => {
                if let Some(entry) = self.queries[idx].entry.take() {
                    self.queries[idx].dispatch.remove_response(&entry);
                }
                warn!(fctx = self.id(), %error, "query render failed");
                return Err(ResolverError::Dispatch(DispatchError::Io(
                    error.to_string(),
                )));
            }
        };

        let sink = self.sink.clone();
        let done: burrow_dispatch::SendDone = Box::new(move |result| {
            let _ = sink.send(BucketEvent::SendDone {
                fctx,
                query: tag,
                result,
            });
        });
        self.queries[idx].dispatch.send(wire, peer, done);
        trace!(fctx = self.id(), %peer, id, "query sent");
        Ok(())
    }

    /// Builds the wire form of the question for the query at `idx`.
    fn render_query(
        &mut self,
        idx: usize,
        id: u16,
    ) -> Result<Vec<u8>, burrow_proto::WireError> {
        let query = &mut self.queries[idx];
        let mut message = burrow_proto::Message::query(
            id,
            self.name.clone(),
            self.rtype,
            self.res.rdclass,
        );

        // RD is set when the caller wants recursion done for it, or when
        // the peer is a forwarder that will recurse anyway.
        if query.options.contains(FetchOpts::RECURSIVE) || query.forwarder {
            message.flags.rd = true;
        }

        // EDNS0, unless the caller said no or the server already taught us
        // it cannot cope.
        if !query.options.contains(FetchOpts::NOEDNS0) {
            if query.addrinfo.flags() & burrow_adb::flags::NOEDNS0 == 0 {
                message.edns_udp_size = Some(self.res.config.edns_udp_size);
            } else {
                query.options.insert(FetchOpts::NOEDNS0);
            }
        }

        let tcp = query.options.contains(FetchOpts::TCP);
        let max = if tcp {
            SEND_BUFFER_SIZE - 2
        } else {
            SEND_BUFFER_SIZE
        };
        let wire = message.to_wire(max)?;

        if tcp {
            let mut framed = Vec::with_capacity(wire.len() + 2);
            #[allow(clippy::cast_possible_truncation)]
            framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
            framed.extend_from_slice(&wire);
            Ok(framed)
        } else {
            Ok(wire)
        }
    }

    /// A TCP connect completed.
    pub(crate) fn on_connected(&mut self, tag: u64, result: Result<(), DispatchError>) {
        if let Some(idx) = self.parked.iter().position(|query| query.tag == tag) {
            // Canceled while the connect was in progress; safe to free
            // now that the event has arrived.
            self.parked.remove(idx);
            return;
        }
        let Some(idx) = self.queries.iter().position(|query| query.tag == tag) else {
            return;
        };
        self.queries[idx].connecting = false;

        match result {
            Ok(()) => {
                trace!(fctx = self.id(), "tcp connected");
                if self.send_query(tag).is_err() {
                    self.cancel_query(tag, None, false);
                }
            }
            Err(error) => {
                trace!(fctx = self.id(), %error, "tcp connect failed");
                self.cancel_query(tag, None, false);
            }
        }
    }

    /// A send completed; failures cancel the query, successes need no
    /// action because the response is matched asynchronously.
    pub(crate) fn on_send_done(&mut self, tag: u64, result: Result<(), DispatchError>) {
        if let Err(error) = result {
            trace!(fctx = self.id(), %error, "send failed");
            self.cancel_query(tag, None, false);
        }
    }
}
