//! Host-provided capability set (§4.6 / §6): a peer connection and data
//! channel abstraction. The spec treats these as external collaborators
//! assumed to exist; since this crate has no browser/OS WebRTC stack to
//! bind to, they are expressed as traits plus an in-memory fake
//! (`peer::fake`) that drives the engine's own test suite.

pub mod fake;

use std::rc::Rc;

use async_trait::async_trait;
use webrtc_signal_proto::{IceCandidateInit, PeerConfig, SdpKind};

use crate::{config::ChannelInit, error::SessionError};

/// Coarse connection state, mirroring `RTCPeerConnectionState`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE transport state, mirroring `RTCIceConnectionState`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Signaling state, restricted to the values the negotiation state machine
/// (§4.4.3) distinguishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Data channel ready state, mirroring `RTCDataChannelState`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A host-provided peer connection: offer/answer negotiation, ICE
/// candidate gathering, and labeled data channel creation.
#[async_trait(?Send)]
pub trait PeerConnection {
    fn connection_state(&self) -> PeerConnectionState;
    fn ice_connection_state(&self) -> IceConnectionState;
    fn signaling_state(&self) -> SignalingState;

    async fn create_offer(&self) -> Result<String, SessionError>;
    async fn create_answer(&self) -> Result<String, SessionError>;
    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), SessionError>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), SessionError>;
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), SessionError>;
    async fn rollback(&self) -> Result<(), SessionError>;

    /// Requests an ICE restart on the next offer created by this peer.
    fn restart_ice(&self);

    fn create_data_channel(&self, label: &str, init: ChannelInit) -> Rc<dyn DataChannel>;

    fn on_negotiation_needed(&self, f: Box<dyn FnMut()>);
    fn on_ice_candidate(&self, f: Box<dyn FnMut(IceCandidateInit)>);
    fn on_connection_state_change(&self, f: Box<dyn FnMut(PeerConnectionState)>);
    fn on_ice_connection_state_change(&self, f: Box<dyn FnMut(IceConnectionState)>);
    fn on_data_channel(&self, f: Box<dyn FnMut(Rc<dyn DataChannel>)>);

    fn close(&self);
}

/// A host-provided data channel: ordered/unordered delivery, backpressure
/// notification, and arbitrary-count labeled instances per peer.
pub trait DataChannel {
    fn label(&self) -> &str;
    fn state(&self) -> ChannelState;
    fn buffered_amount(&self) -> u64;
    fn set_buffered_amount_low_threshold(&self, threshold: u64);
    fn send(&self, data: &str) -> Result<(), SessionError>;
    fn close(&self);

    fn on_open(&self, f: Box<dyn FnMut()>);
    fn on_close(&self, f: Box<dyn FnMut()>);
    fn on_message(&self, f: Box<dyn FnMut(String)>);
    fn on_buffered_amount_low(&self, f: Box<dyn FnMut()>);
}

/// Builds a fresh [`PeerConnection`] for a given ICE phase's configuration;
/// the engine calls this on initial connect and on every peer rebuild.
#[async_trait(?Send)]
pub trait PeerConnectionFactory {
    async fn create(&self, config: PeerConfig) -> Result<Rc<dyn PeerConnection>, SessionError>;
}
