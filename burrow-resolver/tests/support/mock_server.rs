//! A scripted fake authoritative DNS server for resolver tests.
//!
//! The server answers from a queue of scripted actions, one per incoming
//! query, regardless of transport; when the queue runs dry it falls back
//! to a configurable default. It listens on one loopback port over both
//! UDP and TCP, tracks how queries arrived, and records whether each
//! request advertised EDNS0.
#![allow(dead_code)] // Test utility module - not every test uses every knob.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use burrow_proto::{Message, Name, Rcode, Rdataset};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
    task::JoinHandle,
};

/// A canned response, instantiated against each request's id and
/// question.
#[derive(Debug, Clone, Default)]
pub struct ResponseTemplate {
    pub rcode: Rcode,
    pub aa: bool,
    pub tc: bool,
    pub answers: Vec<(Name, Rdataset)>,
    pub authority: Vec<(Name, Rdataset)>,
    pub additional: Vec<(Name, Rdataset)>,
    /// Response delay, for tests that need a window to race in.
    pub delay: Option<Duration>,
}

impl ResponseTemplate {
    #[must_use]
    pub fn answer(aa: bool, answers: Vec<(Name, Rdataset)>) -> Self {
        Self {
            aa,
            answers,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn rcode(rcode: Rcode) -> Self {
        Self {
            rcode,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_authority(mut self, authority: Vec<(Name, Rdataset)>) -> Self {
        self.authority = authority;
        self
    }

    #[must_use]
    pub fn with_additional(mut self, additional: Vec<(Name, Rdataset)>) -> Self {
        self.additional = additional;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn truncated() -> Self {
        Self {
            tc: true,
            ..Self::default()
        }
    }

    fn instantiate(&self, request: &Message) -> Message {
        let mut response = Message {
            id: request.id,
            rcode: self.rcode,
            questions: request.questions.clone(),
            ..Message::default()
        };
        response.flags.qr = true;
        response.flags.aa = self.aa;
        response.flags.tc = self.tc;
        for (section, entries) in [
            (burrow_proto::Section::Answer, &self.answers),
            (burrow_proto::Section::Authority, &self.authority),
            (burrow_proto::Section::Additional, &self.additional),
        ] {
            for (owner, rdataset) in entries {
                let idx = response.entry_for(section, owner);
                response.section_mut(section)[idx]
                    .rdatasets
                    .push(rdataset.clone());
            }
        }
        response
    }
}

/// What to do with one incoming query.
#[derive(Debug, Clone)]
pub enum MockAction {
    Reply(ResponseTemplate),
    /// Pretend the packet was lost.
    Drop,
}

struct Script {
    actions: Mutex<VecDeque<MockAction>>,
    fallback: MockAction,
}

impl Script {
    fn next(&self) -> MockAction {
        self.actions
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

pub struct MockServerBuilder {
    actions: VecDeque<MockAction>,
    fallback: MockAction,
}

impl MockServerBuilder {
    #[must_use]
    pub fn action(mut self, action: MockAction) -> Self {
        self.actions.push_back(action);
        self
    }

    #[must_use]
    pub fn reply(self, template: ResponseTemplate) -> Self {
        self.action(MockAction::Reply(template))
    }

    #[must_use]
    pub fn fallback(mut self, action: MockAction) -> Self {
        self.fallback = action;
        self
    }

    /// Binds the server on a loopback port (UDP and TCP) and starts
    /// serving.
    ///
    /// # Panics
    ///
    /// Panics when the sockets cannot be bound; tests cannot proceed
    /// without them.
    pub async fn build(self) -> MockDnsServer {
        let udp = UdpSocket::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|error| panic!("mock udp bind: {error}"));
        let addr = udp
            .local_addr()
            .unwrap_or_else(|error| panic!("mock local addr: {error}"));
        let tcp = TcpListener::bind(addr)
            .await
            .unwrap_or_else(|error| panic!("mock tcp bind: {error}"));

        let script = Arc::new(Script {
            actions: Mutex::new(self.actions),
            fallback: self.fallback,
        });
        let udp_queries = Arc::new(AtomicUsize::new(0));
        let tcp_connects = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let udp_task = tokio::spawn(serve_udp(
            udp,
            Arc::clone(&script),
            Arc::clone(&udp_queries),
            Arc::clone(&seen),
        ));
        let tcp_task = tokio::spawn(serve_tcp(
            tcp,
            Arc::clone(&script),
            Arc::clone(&tcp_connects),
            Arc::clone(&seen),
        ));

        MockDnsServer {
            addr,
            udp_queries,
            tcp_connects,
            seen,
            tasks: vec![udp_task, tcp_task],
        }
    }
}

/// Header facts recorded for each request, in arrival order.
#[derive(Debug, Clone, Copy)]
pub struct SeenRequest {
    pub edns: bool,
    pub rd: bool,
}

pub struct MockDnsServer {
    addr: SocketAddr,
    udp_queries: Arc<AtomicUsize>,
    tcp_connects: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockDnsServer {
    #[must_use]
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder {
            actions: VecDeque::new(),
            fallback: MockAction::Drop,
        }
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    #[must_use]
    pub fn udp_queries(&self) -> usize {
        self.udp_queries.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn tcp_connects(&self) -> usize {
        self.tcp_connects.load(Ordering::SeqCst)
    }

    /// Whether each request, in arrival order, advertised EDNS0.
    #[must_use]
    pub fn edns_seen(&self) -> Vec<bool> {
        self.seen.lock().iter().map(|seen| seen.edns).collect()
    }

    /// Whether each request, in arrival order, asked for recursion.
    #[must_use]
    pub fn rd_seen(&self) -> Vec<bool> {
        self.seen.lock().iter().map(|seen| seen.rd).collect()
    }
}

impl Drop for MockDnsServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn serve_udp(
    socket: UdpSocket,
    script: Arc<Script>,
    queries: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
) {
    let mut buf = [0u8; 4096];
    loop {
        let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
            continue;
        };
        let Ok(request) = Message::from_wire(&buf[..len]) else {
            continue;
        };
        queries.fetch_add(1, Ordering::SeqCst);
        seen.lock().push(SeenRequest {
            edns: request.edns_udp_size.is_some(),
            rd: request.flags.rd,
        });

        match script.next() {
            MockAction::Drop => {}
            MockAction::Reply(template) => {
                if let Some(delay) = template.delay {
                    tokio::time::sleep(delay).await;
                }
                let response = template.instantiate(&request);
                if let Ok(wire) = response.to_wire(4096) {
                    let _ = socket.send_to(&wire, peer).await;
                }
            }
        }
    }
}

async fn serve_tcp(
    listener: TcpListener,
    script: Arc<Script>,
    connects: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            continue;
        };
        connects.fetch_add(1, Ordering::SeqCst);
        let script = Arc::clone(&script);
        let seen = Arc::clone(&seen);
        tokio::spawn(async move {
            loop {
                let mut len_buf = [0u8; 2];
                if stream.read_exact(&mut len_buf).await.is_err() {
                    return;
                }
                let len = usize::from(u16::from_be_bytes(len_buf));
                let mut wire = vec![0u8; len];
                if stream.read_exact(&mut wire).await.is_err() {
                    return;
                }
                let Ok(request) = Message::from_wire(&wire) else {
                    continue;
                };
                seen.lock().push(SeenRequest {
                    edns: request.edns_udp_size.is_some(),
                    rd: request.flags.rd,
                });

                match script.next() {
                    MockAction::Drop => {}
                    MockAction::Reply(template) => {
                        if let Some(delay) = template.delay {
                            tokio::time::sleep(delay).await;
                        }
                        let response = template.instantiate(&request);
                        let Ok(wire) = response.to_wire(65_000) else {
                            continue;
                        };
                        let frame_len = u16::try_from(wire.len()).unwrap_or(u16::MAX);
                        if stream.write_all(&frame_len.to_be_bytes()).await.is_err() {
                            return;
                        }
                        if stream.write_all(&wire).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}
