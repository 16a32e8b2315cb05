//! In-memory transport.
//!
//! Records every sent envelope and lets the caller script connect failures,
//! connect latency, dropped connections and inbound frames. Used by the test
//! suite and for running the session stack without a remote endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::envelope::Envelope;

use super::{SignalHandler, Transport, TransportError, TransportFactory, TransportSignal};

#[derive(Default)]
struct FactoryState {
    /// Errors returned by the next connects, in order
    scripted_failures: VecDeque<TransportError>,
    /// Error returned by every connect while set
    persistent_failure: Option<TransportError>,
    connect_delay: Duration,
    created: Vec<Arc<MemoryTransport>>,
}

/// Factory producing [`MemoryTransport`]s
#[derive(Clone, Default)]
pub struct MemoryTransportFactory {
    state: Arc<Mutex<FactoryState>>,
    connect_attempts: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
}

impl MemoryTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connects with `error`
    pub fn fail_next(&self, count: usize, error: TransportError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.scripted_failures.push_back(error.clone());
        }
    }

    /// Fail every connect until cleared with `None`
    pub fn set_failure(&self, error: Option<TransportError>) {
        self.state.lock().persistent_failure = error;
    }

    /// Delay each connect by `delay`
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Total connect calls, including failed ones
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::Acquire)
    }

    /// Every transport created so far, oldest first
    pub fn transports(&self) -> Vec<Arc<MemoryTransport>> {
        self.state.lock().created.clone()
    }

    /// Most recently created transport for `key`
    pub fn latest(&self, key: &str) -> Option<Arc<MemoryTransport>> {
        self.state
            .lock()
            .created
            .iter()
            .rev()
            .find(|t| t.key == key)
            .cloned()
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn connect(
        &self,
        key: &str,
        on_signal: SignalHandler,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.connect_attempts.fetch_add(1, Ordering::AcqRel);

        let delay = self.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.persistent_failure.clone() {
            return Err(error);
        }

        let transport = Arc::new(MemoryTransport {
            id: self.next_id.fetch_add(1, Ordering::AcqRel),
            key: key.to_string(),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            send_budget: Mutex::new(None),
            stalled: AtomicBool::new(false),
            on_signal,
        });
        state.created.push(transport.clone());

        Ok(transport)
    }
}

/// Transport whose "remote end" is the test driving it
pub struct MemoryTransport {
    id: u64,
    key: String,
    connected: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<Envelope>>,
    /// Sends left before the connection drops on its own
    send_budget: Mutex<Option<usize>>,
    /// Sends hang while set
    stalled: AtomicBool,
    on_signal: SignalHandler,
}

impl MemoryTransport {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Envelopes successfully sent, in order
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    /// Message types sent, in order
    pub fn sent_types(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|e| e.message_type.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Let `count` more sends succeed, then drop the connection
    pub fn drop_after(&self, count: usize) {
        *self.send_budget.lock() = Some(count);
    }

    /// Make sends hang without completing, as on a congested link
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
    }

    /// Deliver an inbound frame as if the remote end sent it
    pub fn inject(&self, envelope: Envelope) {
        (self.on_signal)(TransportSignal::Frame(envelope));
    }

    /// Simulate an unexpected connection loss
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::Release);
        (self.on_signal)(TransportSignal::Closed { graceful: false });
    }

    /// Simulate the remote end closing the session cleanly
    pub fn remote_close(&self) {
        self.connected.store(false, Ordering::Release);
        (self.on_signal)(TransportSignal::Closed { graceful: true });
    }

    /// Simulate an unrecoverable transport failure
    pub fn fail(&self, reason: &str) {
        self.connected.store(false, Ordering::Release);
        (self.on_signal)(TransportSignal::Failed(reason.to_string()));
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.stalled.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }

        {
            let mut budget = self.send_budget.lock();
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    drop(budget);
                    self.drop_connection();
                    return Err(TransportError::NotConnected);
                }
                *remaining -= 1;
            }
        }

        self.sent.lock().push(envelope.clone());
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.closed.store(true, Ordering::Release);
    }
}
