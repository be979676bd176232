use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use log::{debug, trace};

use crate::driver::{Flow, Operation};

use super::{Address, Socket, SocketError, lock};

/// Outbound messages held back until a driver flushes them.
///
/// [`SenderQueue::send`] only enqueues. Each [`SenderQueue::send_queued`] writes the oldest
/// message, so a host can pace output by driving the queue as an [`Operation`]. Empty
/// payloads are dropped when dequeued.
#[derive(Debug)]
pub struct SenderQueue {
    socket: Arc<Socket>,
    queue: Mutex<VecDeque<Vec<u8>>>,
    // Serialises dequeue-and-write so messages leave in enqueue order.
    drain: Mutex<()>,
}

impl SenderQueue {
    pub fn new(socket: Arc<Socket>) -> Self {
        Self {
            socket,
            queue: Mutex::default(),
            drain: Mutex::new(()),
        }
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    /// Messages waiting to be written.
    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues `payload` for a later flush.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), SocketError> {
        if self.socket.closed() {
            return Err(SocketError::Closed);
        }
        lock(&self.queue).push_back(payload.into());
        Ok(())
    }

    /// Writes the oldest queued message. Returns `false` when nothing was queued.
    pub fn send_queued(&self) -> Result<bool, SocketError> {
        let _drain = lock(&self.drain);
        let Some(payload) = lock(&self.queue).pop_front() else {
            return Ok(false);
        };

        if payload.is_empty() {
            trace!("dropping empty queued message");
        } else {
            self.socket.send(&payload)?;
        }
        Ok(true)
    }

    /// Writes every queued message in order, returning how many were dequeued.
    pub fn send_all(&self) -> Result<usize, SocketError> {
        let mut sent = 0;
        while self.send_queued()? {
            sent += 1;
        }
        Ok(sent)
    }

    pub fn receive(&self) -> Result<(Vec<u8>, Option<Address>), SocketError> {
        self.socket.receive()
    }

    /// Closes the socket and discards anything still queued.
    pub fn close(&self) -> Result<(), SocketError> {
        let dropped = {
            let mut queue = lock(&self.queue);
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if dropped > 0 {
            debug!("discarding {dropped} queued messages on close");
        }
        self.socket.close()
    }

    /// One flush step for a driver: stops once the socket is closed.
    pub fn step(&self) -> Result<Flow, SocketError> {
        if self.socket.closed() {
            return Ok(Flow::Stop);
        }
        self.send_queued()?;
        Ok(Flow::Continue)
    }
}

impl Operation for SenderQueue {
    type Error = SocketError;

    fn run_once(&mut self) -> Result<Flow, SocketError> {
        self.step()
    }
}
