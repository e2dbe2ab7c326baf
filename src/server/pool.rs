//! Fixed-size pool of per-connection resources.
//!
//! Every slot is allocated once at startup: socket read buffer, send buffer,
//! receive windows, parser and FastCGI session. A counting semaphore with
//! one permit per slot is the admission control; the accept loop waits on it
//! before accepting, so an exhausted pool stops new accepts instead of
//! queueing them.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{Mode, ServerConfig};
use crate::fastcgi::Session;
use crate::fastcgi::session::SessionLimits;
use crate::http::{BodyFraming, DiskSink, ParserLimits, RequestParser};

/// Everything one live connection needs.
#[derive(Debug)]
pub struct ConnectionSlot {
    id: usize,
    pub(crate) stream: Option<TcpStream>,
    pub(crate) read_buf: Vec<u8>,
    read_size: usize,
    pub(crate) send_buf: BytesMut,
    pub(crate) parser: RequestParser,
    pub(crate) session: Session,
    pub(crate) should_close: bool,
}

impl ConnectionSlot {
    /// Allocates every buffer the slot will reuse.
    pub fn new(id: usize, config: &ServerConfig) -> Self {
        let framing = match config.mode {
            Mode::Http => BodyFraming::ContentLength,
            // STDIN end is authoritative behind a front end
            Mode::FastCgi => BodyFraming::EndOfStream,
        };
        let limits = ParserLimits {
            max_body_size: config.max_body_size,
            ..ParserLimits::default()
        };
        let session_limits = SessionLimits {
            max_params_size: config.max_params_size,
            max_conns: config.max_connections,
        };
        Self {
            id,
            stream: None,
            read_buf: vec![0; config.read_buffer_size],
            read_size: config.read_buffer_size,
            send_buf: BytesMut::with_capacity(config.read_buffer_size),
            parser: RequestParser::new(
                config.window_capacity(),
                framing,
                limits,
                Box::new(DiskSink::new(&config.upload_dir)),
            ),
            session: Session::new(config.window_capacity(), session_limits),
            should_close: false,
        }
    }

    /// Stable index of this slot, for logging.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Gives the slot its socket.
    pub fn attach(&mut self, stream: TcpStream) {
        self.stream = Some(stream);
    }

    pub fn is_attached(&self) -> bool {
        self.stream.is_some()
    }

    /// Clears per-connection state. Buffers keep their allocations.
    ///
    /// A read buffer still lent out by an unwound [`serve`](Self::serve) is
    /// reallocated.
    pub fn reset(&mut self) {
        self.stream = None;
        if self.read_buf.len() != self.read_size {
            self.read_buf = vec![0; self.read_size];
        }
        self.send_buf.clear();
        self.parser.reset();
        self.session.reset();
        self.should_close = false;
    }
}

/// The pool itself. Shared by the accept loop and every connection task.
#[derive(Debug)]
pub struct ConnectionPool {
    slots: Mutex<Vec<ConnectionSlot>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl ConnectionPool {
    /// Builds `config.max_connections` slots up front.
    pub fn new(config: &ServerConfig) -> Arc<Self> {
        let capacity = config.max_connections;
        let slots = (0..capacity)
            .rev()
            .map(|id| ConnectionSlot::new(id, config))
            .collect();
        Arc::new(Self {
            slots: Mutex::new(slots),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently handed out.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a free slot. Returns `None` once the pool is closed.
    pub async fn acquire(self: &Arc<Self>) -> Option<PooledSlot> {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
        self.checkout(permit)
    }

    /// Takes a free slot without waiting.
    pub fn try_acquire(self: &Arc<Self>) -> Option<PooledSlot> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;
        self.checkout(permit)
    }

    /// Wakes pending and future [`acquire`](Self::acquire) calls with `None`.
    pub fn close(&self) {
        self.permits.close();
    }

    fn checkout(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Option<PooledSlot> {
        let slot = self.lock().pop()?;
        Some(PooledSlot {
            slot: Some(slot),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ConnectionSlot>> {
        // a poisoned stack of slots is still a valid stack
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A checked-out slot. Dropping it resets the slot, pushes it back and only
/// then releases the permit.
#[derive(Debug)]
pub struct PooledSlot {
    slot: Option<ConnectionSlot>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledSlot {
    type Target = ConnectionSlot;

    fn deref(&self) -> &ConnectionSlot {
        match &self.slot {
            Some(slot) => slot,
            None => unreachable!("slot is only taken on drop"),
        }
    }
}

impl DerefMut for PooledSlot {
    fn deref_mut(&mut self) -> &mut ConnectionSlot {
        match &mut self.slot {
            Some(slot) => slot,
            None => unreachable!("slot is only taken on drop"),
        }
    }
}

impl Drop for PooledSlot {
    fn drop(&mut self) {
        if let Some(mut slot) = self.slot.take() {
            slot.reset();
            self.pool.lock().push(slot);
        }
    }
}
