//! In-memory [`PeerConnection`]/[`DataChannel`]/[`PeerConnectionFactory`]
//! used by the engine's own test suite (and exported for downstream
//! integration tests) to drive every scenario in the component design
//! without a real network or browser WebRTC stack.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use async_trait::async_trait;
use webrtc_signal_proto::{IceCandidateInit, IceServer, PeerConfig, SdpKind};

use super::{ChannelState, DataChannel, IceConnectionState, PeerConnection, PeerConnectionFactory, PeerConnectionState, SignalingState};
use crate::{callback::Callback, config::ChannelInit, error::SessionError};

/// A data channel whose state and delivered events are driven entirely by
/// test code.
pub struct FakeDataChannel {
    label: String,
    state: Cell<ChannelState>,
    buffered_amount: Cell<u64>,
    sent: RefCell<Vec<String>>,
    on_open: Callback<()>,
    on_close: Callback<()>,
    on_message: Callback<String>,
    on_buffered_amount_low: Callback<()>,
}

impl FakeDataChannel {
    #[must_use]
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            state: Cell::new(ChannelState::Connecting),
            buffered_amount: Cell::new(0),
            sent: RefCell::default(),
            on_open: Callback::default(),
            on_close: Callback::default(),
            on_message: Callback::default(),
            on_buffered_amount_low: Callback::default(),
        }
    }

    /// Transitions the channel to `open` and fires the open handler.
    pub fn open(&self) {
        self.state.set(ChannelState::Open);
        self.on_open.call(());
    }

    /// Simulates the remote (or transport) closing the channel.
    pub fn close_from_remote(&self) {
        self.state.set(ChannelState::Closed);
        self.on_close.call(());
    }

    /// Every message handed to [`DataChannel::send`] so far, in send order.
    #[must_use]
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent.borrow().clone()
    }

    /// Sets the simulated `bufferedAmount` without firing the low-threshold
    /// signal (use [`fire_buffered_amount_low`](Self::fire_buffered_amount_low)
    /// for that).
    pub fn set_buffered_amount(&self, amount: u64) {
        self.buffered_amount.set(amount);
    }

    /// Fires the `bufferedAmountLow` signal the engine's backpressure wait
    /// is subscribed to.
    pub fn fire_buffered_amount_low(&self) {
        self.on_buffered_amount_low.call(());
    }

    /// Delivers an inbound message as if received over the channel.
    pub fn receive_message(&self, data: impl Into<String>) {
        self.on_message.call(data.into());
    }
}

impl DataChannel for FakeDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        self.state.get()
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered_amount.get()
    }

    fn set_buffered_amount_low_threshold(&self, _threshold: u64) {
        // the fake has no underlying transport to configure; tests fire
        // `fire_buffered_amount_low` directly instead of crossing a real
        // threshold.
    }

    fn send(&self, data: &str) -> Result<(), SessionError> {
        if self.state.get() != ChannelState::Open {
            return Err(SessionError::new(
                crate::error::ErrorKind::InvalidState,
                crate::error::ErrorPhase::Transport,
                "send on a channel that is not open",
            ));
        }
        self.sent.borrow_mut().push(data.to_owned());
        Ok(())
    }

    fn close(&self) {
        self.state.set(ChannelState::Closed);
    }

    fn on_open(&self, mut f: Box<dyn FnMut()>) {
        self.on_open.set_func(move |()| f());
    }

    fn on_close(&self, mut f: Box<dyn FnMut()>) {
        self.on_close.set_func(move |()| f());
    }

    fn on_message(&self, f: Box<dyn FnMut(String)>) {
        self.on_message.set_boxed(f);
    }

    fn on_buffered_amount_low(&self, mut f: Box<dyn FnMut()>) {
        self.on_buffered_amount_low.set_func(move |()| f());
    }
}

/// A peer connection whose SDP/ICE side effects are entirely in-memory;
/// test code flips [`connection_state`](Self::set_connection_state) and
/// [`ice_connection_state`](Self::set_ice_connection_state) and inspects
/// [`local_description`](Self::local_description)/
/// [`added_ice_candidates`](Self::added_ice_candidates) to assert on what
/// the engine did.
pub struct FakePeerConnection {
    id: u64,
    ice_servers: Vec<IceServer>,
    connection_state: Cell<PeerConnectionState>,
    ice_connection_state: Cell<IceConnectionState>,
    signaling_state: Cell<SignalingState>,
    local_description: RefCell<Option<(SdpKind, String)>>,
    remote_description: RefCell<Option<(SdpKind, String)>>,
    ice_restart_requested: Cell<bool>,
    offer_counter: Cell<u64>,
    added_ice_candidates: RefCell<Vec<IceCandidateInit>>,
    channels: RefCell<Vec<Rc<FakeDataChannel>>>,
    closed: Cell<bool>,
    on_negotiation_needed: Callback<()>,
    on_ice_candidate: Callback<IceCandidateInit>,
    on_connection_state_change: Callback<PeerConnectionState>,
    on_ice_connection_state_change: Callback<IceConnectionState>,
    on_data_channel: Callback<Rc<dyn DataChannel>>,
}

impl FakePeerConnection {
    #[must_use]
    fn new(id: u64, ice_servers: Vec<IceServer>) -> Self {
        Self {
            id,
            ice_servers,
            connection_state: Cell::new(PeerConnectionState::New),
            ice_connection_state: Cell::new(IceConnectionState::New),
            signaling_state: Cell::new(SignalingState::Stable),
            local_description: RefCell::default(),
            remote_description: RefCell::default(),
            ice_restart_requested: Cell::new(false),
            offer_counter: Cell::new(0),
            added_ice_candidates: RefCell::default(),
            channels: RefCell::default(),
            closed: Cell::new(false),
            on_negotiation_needed: Callback::default(),
            on_ice_candidate: Callback::default(),
            on_connection_state_change: Callback::default(),
            on_ice_connection_state_change: Callback::default(),
            on_data_channel: Callback::default(),
        }
    }

    /// Identity assigned by the [`FakePeerFactory`] that created this peer,
    /// in creation order starting at 0; lets tests assert "exactly N peers
    /// were created" and inspect a specific generation.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    #[must_use]
    pub fn local_description(&self) -> Option<(SdpKind, String)> {
        self.local_description.borrow().clone()
    }

    #[must_use]
    pub fn remote_description(&self) -> Option<(SdpKind, String)> {
        self.remote_description.borrow().clone()
    }

    #[must_use]
    pub fn added_ice_candidates(&self) -> Vec<IceCandidateInit> {
        self.added_ice_candidates.borrow().clone()
    }

    #[must_use]
    pub fn channels(&self) -> Vec<Rc<FakeDataChannel>> {
        self.channels.borrow().clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn set_connection_state(&self, state: PeerConnectionState) {
        self.connection_state.set(state);
        self.on_connection_state_change.call(state);
    }

    pub fn set_ice_connection_state(&self, state: IceConnectionState) {
        self.ice_connection_state.set(state);
        self.on_ice_connection_state_change.call(state);
    }

    pub fn emit_ice_candidate(&self, candidate: IceCandidateInit) {
        self.on_ice_candidate.call(candidate);
    }

    pub fn emit_negotiation_needed(&self) {
        self.on_negotiation_needed.call(());
    }

    pub fn emit_data_channel(&self, channel: Rc<FakeDataChannel>) {
        self.channels.borrow_mut().push(Rc::clone(&channel));
        self.on_data_channel.call(channel);
    }
}

#[async_trait(?Send)]
impl PeerConnection for FakePeerConnection {
    fn connection_state(&self) -> PeerConnectionState {
        self.connection_state.get()
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.ice_connection_state.get()
    }

    fn signaling_state(&self) -> SignalingState {
        self.signaling_state.get()
    }

    async fn create_offer(&self) -> Result<String, SessionError> {
        let n = self.offer_counter.get();
        self.offer_counter.set(n + 1);
        let restart = if self.ice_restart_requested.get() { "-restart" } else { "" };
        Ok(format!("v=0 offer#{}{}{}", self.id, n, restart))
    }

    async fn create_answer(&self) -> Result<String, SessionError> {
        let n = self.offer_counter.get();
        self.offer_counter.set(n + 1);
        Ok(format!("v=0 answer#{}{}", self.id, n))
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), SessionError> {
        match kind {
            SdpKind::Offer => self.signaling_state.set(SignalingState::HaveLocalOffer),
            SdpKind::Answer => self.signaling_state.set(SignalingState::Stable),
        }
        if kind == SdpKind::Offer {
            self.ice_restart_requested.set(false);
        }
        self.local_description.borrow_mut().replace((kind, sdp));
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), SessionError> {
        match kind {
            SdpKind::Offer => self.signaling_state.set(SignalingState::HaveRemoteOffer),
            SdpKind::Answer => self.signaling_state.set(SignalingState::Stable),
        }
        self.remote_description.borrow_mut().replace((kind, sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), SessionError> {
        self.added_ice_candidates.borrow_mut().push(candidate);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), SessionError> {
        self.signaling_state.set(SignalingState::Stable);
        self.local_description.borrow_mut().take();
        Ok(())
    }

    fn restart_ice(&self) {
        self.ice_restart_requested.set(true);
    }

    fn create_data_channel(&self, label: &str, _init: ChannelInit) -> Rc<dyn DataChannel> {
        let channel = Rc::new(FakeDataChannel::new(label));
        self.channels.borrow_mut().push(Rc::clone(&channel));
        channel
    }

    fn on_negotiation_needed(&self, mut f: Box<dyn FnMut()>) {
        self.on_negotiation_needed.set_func(move |()| f());
    }

    fn on_ice_candidate(&self, f: Box<dyn FnMut(IceCandidateInit)>) {
        self.on_ice_candidate.set_boxed(f);
    }

    fn on_connection_state_change(&self, f: Box<dyn FnMut(PeerConnectionState)>) {
        self.on_connection_state_change.set_boxed(f);
    }

    fn on_ice_connection_state_change(&self, f: Box<dyn FnMut(IceConnectionState)>) {
        self.on_ice_connection_state_change.set_boxed(f);
    }

    fn on_data_channel(&self, f: Box<dyn FnMut(Rc<dyn DataChannel>)>) {
        self.on_data_channel.set_boxed(f);
    }

    fn close(&self) {
        self.closed.set(true);
        self.connection_state.set(PeerConnectionState::Closed);
    }
}

/// Creates [`FakePeerConnection`]s and remembers every one it created, in
/// creation order, so tests can assert on how many peers were built and
/// inspect any one of them.
#[derive(Default)]
pub struct FakePeerFactory {
    peers: RefCell<Vec<Rc<FakePeerConnection>>>,
    fail_next: Cell<bool>,
}

impl FakePeerFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next [`create`](PeerConnectionFactory::create) call fail,
    /// for exercising peer-creation failure handling.
    pub fn fail_next_create(&self) {
        self.fail_next.set(true);
    }

    #[must_use]
    pub fn peers(&self) -> Vec<Rc<FakePeerConnection>> {
        self.peers.borrow().clone()
    }

    #[must_use]
    pub fn latest(&self) -> Rc<FakePeerConnection> {
        self.peers.borrow().last().cloned().expect("at least one peer was created")
    }
}

#[async_trait(?Send)]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(&self, config: PeerConfig) -> Result<Rc<dyn PeerConnection>, SessionError> {
        if self.fail_next.get() {
            self.fail_next.set(false);
            return Err(SessionError::signaling_failed("simulated peer creation failure"));
        }
        let id = self.peers.borrow().len() as u64;
        let peer = Rc::new(FakePeerConnection::new(id, config.ice_servers));
        self.peers.borrow_mut().push(Rc::clone(&peer));
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_assigns_sequential_ids_and_remembers_ice_servers() {
        let factory = FakePeerFactory::new();
        let _first = factory.create(PeerConfig::default()).await.unwrap();
        let stun_config = PeerConfig {
            ice_servers: vec![IceServer::new(vec!["stun:example.com".into()], None, None)],
        };
        let _second = factory.create(stun_config).await.unwrap();

        let peers = factory.peers();
        assert_eq!(peers.len(), 2);
        assert!(peers[0].ice_servers().is_empty());
        assert_eq!(peers[1].ice_servers()[0].urls[0], "stun:example.com");
    }

    #[tokio::test]
    async fn set_local_offer_then_remote_answer_returns_to_stable() {
        let factory = FakePeerFactory::new();
        let peer = factory.create(PeerConfig::default()).await.unwrap();
        let offer = peer.create_offer().await.unwrap();
        peer.set_local_description(SdpKind::Offer, offer).await.unwrap();
        assert_eq!(peer.signaling_state(), SignalingState::HaveLocalOffer);

        peer.set_remote_description(SdpKind::Answer, "v=0 answer".into()).await.unwrap();
        assert_eq!(peer.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn data_channel_send_fails_until_open() {
        let channel = FakeDataChannel::new("fast");
        assert!(channel.send("hi").is_err());
        channel.open();
        channel.send("hi").unwrap();
        assert_eq!(channel.sent_messages(), vec!["hi".to_owned()]);
    }
}
