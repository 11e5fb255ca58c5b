//! The shared UDP dispatcher.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    ops::Range,
    sync::Arc,
};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::{Dispatch, DispatchError, ResponseEntry, ResponseHandler, SendDone, peek_header};

/// Maximum datagram we accept; matches the advertised EDNS0 buffer size.
const RECV_BUFFER_SIZE: usize = 2048;

/// One UDP socket shared by every query of one address family.
///
/// A reader task demultiplexes incoming datagrams to response slots keyed
/// by (peer, id); anything unmatched is dropped.
pub struct UdpDispatch {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    slots: Arc<DashMap<(SocketAddr, u16), Mutex<ResponseHandler>>>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl UdpDispatch {
    /// Binds an IPv4 socket on the first free port in `ports` and starts
    /// the reader.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NoFreePort`] when every port in the range
    /// is taken.
    pub async fn bind_v4(ports: Range<u16>) -> Result<Arc<Self>, DispatchError> {
        for port in ports.clone() {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
            match UdpSocket::bind(addr).await {
                Ok(socket) => return Ok(Self::start(socket)?),
                Err(_) => continue,
            }
        }
        Err(DispatchError::NoFreePort {
            start: ports.start,
            end: ports.end,
        })
    }

    /// Binds an IPv6 socket on an ephemeral port and starts the reader.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the host has no IPv6 stack.
    pub async fn bind_v6() -> Result<Arc<Self>, DispatchError> {
        let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0);
        let socket = UdpSocket::bind(addr).await?;
        Self::start(socket)
    }

    fn start(socket: UdpSocket) -> Result<Arc<Self>, DispatchError> {
        let local = socket.local_addr()?;
        let socket = Arc::new(socket);
        let slots: Arc<DashMap<(SocketAddr, u16), Mutex<ResponseHandler>>> =
            Arc::new(DashMap::new());

        let reader = tokio::spawn(Self::read_loop(Arc::clone(&socket), Arc::clone(&slots)));
        debug!(%local, "udp dispatcher up");

        Ok(Arc::new(Self {
            socket,
            local,
            slots,
            reader: Mutex::new(Some(reader)),
        }))
    }

    async fn read_loop(
        socket: Arc<UdpSocket>,
        slots: Arc<DashMap<(SocketAddr, u16), Mutex<ResponseHandler>>>,
    ) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(recv) => recv,
                Err(error) => {
                    warn!(%error, "udp receive failed");
                    continue;
                }
            };
            let Some((id, qr)) = peek_header(&buf[..len]) else {
                trace!(%from, len, "runt datagram dropped");
                continue;
            };
            if !qr {
                trace!(%from, id, "non-response dropped");
                continue;
            }
            match slots.get(&(from, id)) {
                Some(slot) => (slot.lock())(buf[..len].to_vec()),
                None => trace!(%from, id, "unmatched response dropped"),
            }
        }
    }
}

impl Dispatch for UdpDispatch {
    fn add_response(
        &self,
        peer: SocketAddr,
        handler: ResponseHandler,
    ) -> Result<ResponseEntry, DispatchError> {
        let mut rng = rand::rng();
        for _ in 0..64 {
            let id: u16 = rng.random();
            let entry = self.slots.entry((peer, id));
            if let Entry::Vacant(vacant) = entry {
                vacant.insert(Mutex::new(handler));
                return Ok(ResponseEntry { id, peer });
            }
        }
        Err(DispatchError::NoFreeId(peer))
    }

    fn remove_response(&self, entry: &ResponseEntry) {
        self.slots.remove(&(entry.peer, entry.id));
    }

    fn send(&self, wire: Vec<u8>, peer: SocketAddr, done: SendDone) {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let result = socket
                .send_to(&wire, peer)
                .await
                .map(|_| ())
                .map_err(DispatchError::from);
            done(result);
        });
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}

impl Drop for UdpDispatch {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}
