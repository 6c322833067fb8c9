use crate::config::PEER_EVENTS_CAPACITY;
use crate::error::NegotiationError;
use crate::session::{PeerEvent, PeerFactory, PeerSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tagcall_media::AudioFrame;
use tokio::sync::{broadcast, mpsc};

/// Observable negotiation state shared between [`MockPeer`] sessions and
/// the test body.
pub struct MockPeerState {
    events_tx: broadcast::Sender<PeerEvent>,
    offers: AtomicUsize,
    answers: AtomicUsize,
    remote_descriptions: Mutex<Vec<String>>,
    remote_candidates: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

impl MockPeerState {
    /// Emits a peer event as if the transport had produced it.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answers(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    /// Remote descriptions actually applied, in application order.
    pub fn remote_descriptions(&self) -> Vec<String> {
        self.remote_descriptions.lock().clone()
    }

    /// Remote candidates actually applied, in application order.
    pub fn remote_candidates(&self) -> Vec<String> {
        self.remote_candidates.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Cloning shares the underlying state, so a clone handed to the code
/// under test can be observed from the test body.
#[derive(Clone)]
pub struct MockPeerFactory {
    state: Arc<MockPeerState>,
    fail_create: Arc<AtomicBool>,
}

impl Default for MockPeerFactory {
    fn default() -> Self {
        Self {
            state: Arc::new(MockPeerState {
                events_tx: broadcast::channel(PEER_EVENTS_CAPACITY).0,
                offers: AtomicUsize::new(0),
                answers: AtomicUsize::new(0),
                remote_descriptions: Mutex::new(Vec::new()),
                remote_candidates: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
            }),
            fail_create: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<MockPeerState> {
        self.state.clone()
    }

    /// Makes every subsequent create fail.
    pub fn fail_creates(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    type Session = MockPeer;

    async fn create(
        &self,
        _input_rx: mpsc::Receiver<AudioFrame>,
        _output_tx: mpsc::Sender<AudioFrame>,
    ) -> Result<MockPeer, NegotiationError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(NegotiationError::Other(anyhow::anyhow!(
                "mock peer creation failure"
            )));
        }

        Ok(MockPeer {
            state: self.state.clone(),
            remote_set: AtomicBool::new(false),
            offer_created: AtomicBool::new(false),
        })
    }
}

pub struct MockPeer {
    state: Arc<MockPeerState>,
    remote_set: AtomicBool,
    offer_created: AtomicBool,
}

#[async_trait]
impl PeerSession for MockPeer {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        if self.offer_created.swap(true, Ordering::SeqCst) {
            return Err(NegotiationError::OfferAlreadyCreated);
        }
        let n = self.state.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("offer-{n}"))
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, NegotiationError> {
        self.state.remote_descriptions.lock().push(sdp.to_string());
        self.remote_set.store(true, Ordering::SeqCst);
        let n = self.state.answers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("answer-{n}"))
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), NegotiationError> {
        if self.remote_set.swap(true, Ordering::SeqCst) {
            // Already stable; a duplicate answer is ignored.
            return Ok(());
        }
        self.state.remote_descriptions.lock().push(sdp.to_string());
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.remote_set.load(Ordering::SeqCst)
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), NegotiationError> {
        self.state.remote_candidates.lock().push(candidate.to_string());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.state.events_tx.subscribe()
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
