//! The per-query TCP dispatcher.
//!
//! TCP queries each get their own connection. The wire format prefixes
//! every message with a 16-bit big-endian length; senders hand us the
//! already-prefixed buffer, while received messages are unframed before
//! delivery so response handling matches the UDP path.

use std::{net::SocketAddr, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::{debug, trace, warn};

use crate::{
    ConnectDone, Dispatch, DispatchError, ResponseEntry, ResponseHandler, SendDone, peek_header,
};

/// A dispatcher wrapping one TCP connection to one server.
pub struct TcpDispatch {
    peer: SocketAddr,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    local: Mutex<Option<SocketAddr>>,
    slots: Arc<DashMap<(SocketAddr, u16), Mutex<ResponseHandler>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TcpDispatch {
    /// Creates the dispatcher and starts connecting; `done` fires exactly
    /// once when the connect succeeds or fails.
    #[must_use]
    pub fn connect(peer: SocketAddr, done: ConnectDone) -> Arc<Self> {
        let dispatch = Arc::new(Self {
            peer,
            writer: Arc::new(Mutex::new(None)),
            local: Mutex::new(None),
            slots: Arc::new(DashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let this = Arc::clone(&dispatch);
        let task = tokio::spawn(async move {
            match TcpStream::connect(peer).await {
                Ok(stream) => {
                    let local = stream.local_addr().ok();
                    let (read_half, write_half) = stream.into_split();
                    *this.writer.lock() = Some(write_half);
                    *this.local.lock() = local;
                    let reader_task =
                        tokio::spawn(Self::read_loop(read_half, peer, Arc::clone(&this.slots)));
                    this.tasks.lock().push(reader_task);
                    debug!(%peer, "tcp connected");
                    done(Ok(()));
                }
                Err(error) => {
                    debug!(%peer, %error, "tcp connect failed");
                    done(Err(error.into()));
                }
            }
        });
        dispatch.tasks.lock().push(task);

        dispatch
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        peer: SocketAddr,
        slots: Arc<DashMap<(SocketAddr, u16), Mutex<ResponseHandler>>>,
    ) {
        loop {
            let mut len_buf = [0u8; 2];
            if let Err(error) = reader.read_exact(&mut len_buf).await {
                trace!(%peer, %error, "tcp stream closed");
                return;
            }
            let len = usize::from(u16::from_be_bytes(len_buf));
            let mut wire = vec![0u8; len];
            if let Err(error) = reader.read_exact(&mut wire).await {
                warn!(%peer, %error, "tcp stream closed mid-message");
                return;
            }
            let Some((id, qr)) = peek_header(&wire) else {
                continue;
            };
            if !qr {
                continue;
            }
            match slots.get(&(peer, id)) {
                Some(slot) => (slot.lock())(wire),
                None => trace!(%peer, id, "unmatched tcp response dropped"),
            }
        }
    }
}

impl Dispatch for TcpDispatch {
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
        let Some(mut writer) = self.writer.lock().take() else {
            done(Err(DispatchError::NotConnected(peer)));
            return;
        };

        let slot = Arc::clone(&self.writer);
        let task = tokio::spawn(async move {
            let result = writer.write_all(&wire).await.map_err(DispatchError::from);
            *slot.lock() = Some(writer);
            done(result);
        });
        self.tasks.lock().push(task);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local.lock()
    }
}

impl Drop for TcpDispatch {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
