//! The session engine: the main state machine described by the component
//! design. [`Session`] is a cheap-to-clone handle (`Rc<Inner>`) around the
//! single-threaded, `RefCell`-guarded engine state.

mod negotiation;
mod recovery;

use std::{cell::{Cell, RefCell}, collections::VecDeque, rc::Rc, time::Duration};

use futures::channel::oneshot;
use session_reactive::ObservableCell;
use webrtc_signal_proto::{IceCandidateInit, RoomId, Role};

use crate::{
    backoff::BackoffDelayer,
    callback::Callback,
    config::EngineConfig,
    delay::ResettableDelayHandle,
    error::{ErrorKind, ErrorPhase, SessionError, TracedResult},
    ice::IcePhase,
    peer::{DataChannel, PeerConnection, PeerConnectionFactory},
    store::SignalStore,
};

/// Coarse lifecycle phase, held in an [`ObservableCell`] so `inspect` and
/// tests can read or await it without polling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    Subscribed,
    Negotiating,
    Connected,
    SoftReconnect,
    HardReconnect,
    Closing,
}

/// Heuristic label for which candidate family carried the connected pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SelectedPath {
    Host,
    Srflx,
    Relay,
    Unknown,
}

/// Per-type tally of candidates seen at one stage of the pipeline.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CandidateCounter {
    pub host: u64,
    pub srflx: u64,
    pub relay: u64,
    pub unknown: u64,
}

impl CandidateCounter {
    fn bump(&mut self, kind: crate::ice::CandidateType) {
        use crate::ice::CandidateType::{Host, Relay, Srflx, Unknown};
        match kind {
            Host => self.host += 1,
            Srflx => self.srflx += 1,
            Relay => self.relay += 1,
            Unknown => self.unknown += 1,
        }
    }

    fn get(&self, kind: crate::ice::CandidateType) -> u64 {
        use crate::ice::CandidateType::{Host, Relay, Srflx, Unknown};
        match kind {
            Host => self.host,
            Srflx => self.srflx,
            Relay => self.relay,
            Unknown => self.unknown,
        }
    }
}

/// Candidate/stat counters split by direction and pipeline stage.
#[derive(Clone, Copy, Debug, Default)]
pub struct IceCounters {
    pub local_seen: CandidateCounter,
    pub local_sent: CandidateCounter,
    pub local_dropped: CandidateCounter,
    pub remote_seen: CandidateCounter,
    pub remote_accepted: CandidateCounter,
    pub remote_dropped: CandidateCounter,
}

/// Non-authoritative snapshot returned by [`Session::inspect`].
#[derive(Clone, Debug)]
pub struct DebugSnapshot {
    pub phase: Phase,
    pub ice_phase: IcePhase,
    pub pc_generation: u64,
    pub signaling_epoch: u64,
    pub selected_path: Option<SelectedPath>,
    pub counters: IceCounters,
    pub fast_open: bool,
    pub reliable_open: bool,
    pub last_error: Option<SessionError>,
}

/// Optional timeout argument accepted by [`Session::reconnect_hard`] and
/// [`Session::wait_ready`].
#[derive(Clone, Copy, Debug, Default)]
pub struct WaitOpts {
    pub timeout: Option<Duration>,
}

pub(crate) struct Inner {
    role: Role,
    polite: bool,
    config: EngineConfig,
    store: Rc<dyn SignalStore>,
    peer_factory: Rc<dyn PeerConnectionFactory>,

    room_id: RefCell<Option<RoomId>>,
    signaling_epoch: Cell<u64>,
    pc_generation: Cell<u64>,
    remote_pc_generation: Cell<u64>,

    peer: RefCell<Option<Rc<dyn PeerConnection>>>,
    fast: RefCell<Option<Rc<dyn DataChannel>>>,
    reliable: RefCell<Option<Rc<dyn DataChannel>>>,
    pending_ice: RefCell<Vec<IceCandidateInit>>,
    fast_queue: RefCell<VecDeque<String>>,
    reliable_queue: RefCell<VecDeque<String>>,
    fast_open_waiters: RefCell<Vec<oneshot::Sender<()>>>,
    reliable_open_waiters: RefCell<Vec<oneshot::Sender<()>>>,
    fast_low_waiters: RefCell<Vec<oneshot::Sender<()>>>,
    reliable_low_waiters: RefCell<Vec<oneshot::Sender<()>>>,

    making_offer: Cell<bool>,
    answering: Cell<bool>,
    remote_desc_set: Cell<bool>,
    last_handled_offer_sdp: RefCell<Option<String>>,
    last_handled_answer_sdp: RefCell<Option<String>>,
    last_seen_offer_sdp: RefCell<Option<String>>,
    last_seen_answer_sdp: RefCell<Option<String>>,
    last_local_offer_sdp: RefCell<Option<String>>,

    ice_phase: Cell<IcePhase>,
    counters: RefCell<IceCounters>,
    selected_path: Cell<Option<SelectedPath>>,

    soft_backoff: RefCell<BackoffDelayer>,
    hard_backoff: RefCell<BackoffDelayer>,
    soft_retries: Cell<u32>,
    hard_retries: Cell<u32>,
    stun_watchdog_reconnects: Cell<u32>,

    soft_timer: RefCell<Option<ResettableDelayHandle>>,
    hard_timer: RefCell<Option<ResettableDelayHandle>>,
    connecting_watchdog_timer: RefCell<Option<ResettableDelayHandle>>,
    connecting_watchdog_generation: Cell<u64>,
    dc_recovery_timer: RefCell<Option<ResettableDelayHandle>>,
    dc_recovery_generation: Cell<u64>,
    lan_first_timer: RefCell<Option<ResettableDelayHandle>>,

    phase: ObservableCell<Phase>,
    controlled_peer_rebuild: Cell<bool>,
    subscribed: Cell<bool>,

    last_error: RefCell<Option<SessionError>>,

    on_fast_open: Callback<()>,
    on_fast_close: Callback<()>,
    on_fast_message: Callback<String>,
    on_reliable_open: Callback<()>,
    on_reliable_close: Callback<()>,
    on_reliable_message: Callback<String>,
    on_connection_state_change: Callback<crate::peer::PeerConnectionState>,
    on_error: Callback<SessionError>,
    on_debug: Callback<DebugSnapshot>,
}

/// Handle to a session engine instance. Cheap to clone; every clone shares
/// the same underlying state.
#[derive(Clone)]
pub struct Session(pub(crate) Rc<Inner>);

impl Session {
    /// Builds a new, unconnected session for `role` against `store`, using
    /// `peer_factory` to create peer connections on demand.
    #[must_use]
    pub fn new(
        role: Role,
        store: Rc<dyn SignalStore>,
        peer_factory: Rc<dyn PeerConnectionFactory>,
        config: EngineConfig,
    ) -> Self {
        let soft_backoff = BackoffDelayer::new(Duration::from_millis(250), Duration::from_millis(2500));
        let hard_backoff = BackoffDelayer::new(Duration::from_secs(6), Duration::from_secs(30));
        Self(Rc::new(Inner {
            polite: role.is_polite(),
            role,
            config,
            store,
            peer_factory,
            room_id: RefCell::default(),
            signaling_epoch: Cell::new(0),
            pc_generation: Cell::new(0),
            remote_pc_generation: Cell::new(0),
            peer: RefCell::default(),
            fast: RefCell::default(),
            reliable: RefCell::default(),
            pending_ice: RefCell::default(),
            fast_queue: RefCell::default(),
            reliable_queue: RefCell::default(),
            fast_open_waiters: RefCell::default(),
            reliable_open_waiters: RefCell::default(),
            fast_low_waiters: RefCell::default(),
            reliable_low_waiters: RefCell::default(),
            making_offer: Cell::new(false),
            answering: Cell::new(false),
            remote_desc_set: Cell::new(false),
            last_handled_offer_sdp: RefCell::default(),
            last_handled_answer_sdp: RefCell::default(),
            last_seen_offer_sdp: RefCell::default(),
            last_seen_answer_sdp: RefCell::default(),
            last_local_offer_sdp: RefCell::default(),
            ice_phase: Cell::new(IcePhase::Lan),
            counters: RefCell::default(),
            selected_path: Cell::new(None),
            soft_backoff: RefCell::new(soft_backoff),
            hard_backoff: RefCell::new(hard_backoff),
            soft_retries: Cell::new(0),
            hard_retries: Cell::new(0),
            stun_watchdog_reconnects: Cell::new(0),
            soft_timer: RefCell::default(),
            hard_timer: RefCell::default(),
            connecting_watchdog_timer: RefCell::default(),
            connecting_watchdog_generation: Cell::new(0),
            dc_recovery_timer: RefCell::default(),
            dc_recovery_generation: Cell::new(0),
            lan_first_timer: RefCell::default(),
            phase: ObservableCell::new(Phase::Idle),
            controlled_peer_rebuild: Cell::new(false),
            subscribed: Cell::new(false),
            last_error: RefCell::default(),
            on_fast_open: Callback::default(),
            on_fast_close: Callback::default(),
            on_fast_message: Callback::default(),
            on_reliable_open: Callback::default(),
            on_reliable_close: Callback::default(),
            on_reliable_message: Callback::default(),
            on_connection_state_change: Callback::default(),
            on_error: Callback::default(),
            on_debug: Callback::default(),
        }))
    }

    /// Creates a fresh room via the store and binds this session to it.
    ///
    /// # Errors
    /// [`ErrorKind::DbUnavailable`] if the store call fails.
    pub async fn create_room(&self) -> Result<RoomId, SessionError> {
        let id = self.0.store.create_room().await?;
        *self.0.room_id.borrow_mut() = Some(id.clone());
        self.snapshot_epoch().await?;
        Ok(id)
    }

    /// Binds this session to an existing room and moves phase to
    /// `subscribed`.
    ///
    /// # Errors
    /// [`ErrorKind::DbUnavailable`] if the store call fails.
    pub async fn join_room(&self, room_id: RoomId) -> Result<(), SessionError> {
        self.0.store.join_room(room_id.clone(), self.0.role).await?;
        *self.0.room_id.borrow_mut() = Some(room_id);
        self.snapshot_epoch().await?;
        self.0.phase.set(Phase::Subscribed);
        Ok(())
    }

    async fn snapshot_epoch(&self) -> Result<(), SessionError> {
        if let Some(room) = self.0.store.get_room().await? {
            self.0.signaling_epoch.set(room.epoch);
        }
        Ok(())
    }

    /// Sends `text` on the fast (unordered, zero-retransmit) channel.
    ///
    /// If the channel is open, waits out any backpressure then sends
    /// immediately; otherwise enqueues and sends once the channel opens.
    pub async fn send_fast(&self, text: impl Into<String>) {
        self.send_on(ChannelKind::Fast, text.into()).await;
    }

    /// Sends `text` on the reliable (ordered) channel. See
    /// [`Session::send_fast`] for delivery semantics.
    pub async fn send_reliable(&self, text: impl Into<String>) {
        self.send_on(ChannelKind::Reliable, text.into()).await;
    }

    /// Cancels every timer, unsubscribes from signaling streams, and closes
    /// the peer and channels. Safe to call more than once.
    pub async fn hangup(&self) {
        self.0.phase.set(Phase::Closing);
        self.0.subscribed.set(false);
        self.cancel_all_timers();
        if let Some(peer) = self.0.peer.borrow_mut().take() {
            peer.close();
        }
        self.0.fast.borrow_mut().take();
        self.0.reliable.borrow_mut().take();
        self.0.fast_queue.borrow_mut().clear();
        self.0.reliable_queue.borrow_mut().clear();
        self.0.phase.set(Phase::Idle);
        self.emit_debug();
    }

    /// `hangup` followed by deleting the room via the store.
    ///
    /// # Errors
    /// [`ErrorKind::DbUnavailable`] if the store call fails.
    pub async fn end_room(&self) -> Result<(), SessionError> {
        self.hangup().await;
        self.0.store.end_room().await?;
        self.0.room_id.borrow_mut().take();
        Ok(())
    }

    /// Resolves once the peer is connected and both channels are open, or
    /// rejects with [`ErrorKind::WaitReadyTimeout`] after `opts.timeout`
    /// (default taken from [`EngineConfig::wait_ready_timeout`]).
    ///
    /// # Errors
    /// [`ErrorKind::WaitReadyTimeout`] if the timeout elapses first.
    pub async fn wait_ready(&self, opts: WaitOpts) -> Result<(), SessionError> {
        let timeout = opts.timeout.unwrap_or(self.0.config.wait_ready_timeout);
        // `when_eq` checks its current value before subscribing, so a stale
        // `Connected` left over from a channel that has since closed would
        // resolve this immediately; loop and re-check `is_ready` against
        // live channel/peer state on every wakeup instead of trusting it.
        let wait_for_ready = async {
            loop {
                if self.is_ready() {
                    return;
                }
                if self.0.phase.when_eq(Phase::Connected).await.is_err() {
                    return;
                }
            }
        };
        match tokio::time::timeout(timeout, wait_for_ready).await {
            Ok(()) => Ok(()),
            Err(_elapsed) => Err(SessionError::wait_ready_timeout(timeout.as_millis() as u64)),
        }
    }

    fn is_ready(&self) -> bool {
        let fast_open = matches!(
            self.0.fast.borrow().as_deref().map(crate::peer::DataChannel::state),
            Some(crate::peer::ChannelState::Open)
        );
        let reliable_open = matches!(
            self.0.reliable.borrow().as_deref().map(crate::peer::DataChannel::state),
            Some(crate::peer::ChannelState::Open)
        );
        let connected = matches!(
            self.0.peer.borrow().as_deref().map(crate::peer::PeerConnection::connection_state),
            Some(crate::peer::PeerConnectionState::Connected)
        );
        fast_open && reliable_open && connected
    }

    /// Returns a non-authoritative snapshot of peer/ICE/channel state.
    #[must_use]
    pub fn inspect(&self) -> DebugSnapshot {
        DebugSnapshot {
            phase: self.0.phase.get_cloned(),
            ice_phase: self.0.ice_phase.get(),
            pc_generation: self.0.pc_generation.get(),
            signaling_epoch: self.0.signaling_epoch.get(),
            selected_path: self.0.selected_path.get(),
            counters: *self.0.counters.borrow(),
            fast_open: matches!(
                self.0.fast.borrow().as_deref().map(crate::peer::DataChannel::state),
                Some(crate::peer::ChannelState::Open)
            ),
            reliable_open: matches!(
                self.0.reliable.borrow().as_deref().map(crate::peer::DataChannel::state),
                Some(crate::peer::ChannelState::Open)
            ),
            last_error: self.0.last_error.borrow().clone(),
        }
    }

    /// Registers the handler invoked whenever the fast channel opens,
    /// replacing any previously registered handler.
    pub fn on_fast_open(&self, mut f: impl FnMut() + 'static) {
        self.0.on_fast_open.set_func(move |()| f());
    }

    /// Registers the handler invoked whenever the fast channel closes.
    pub fn on_fast_close(&self, mut f: impl FnMut() + 'static) {
        self.0.on_fast_close.set_func(move |()| f());
    }

    /// Registers the handler invoked for every message received on the fast
    /// channel.
    pub fn on_fast_message(&self, f: impl FnMut(String) + 'static) {
        self.0.on_fast_message.set_func(f);
    }

    /// Registers the handler invoked whenever the reliable channel opens.
    pub fn on_reliable_open(&self, mut f: impl FnMut() + 'static) {
        self.0.on_reliable_open.set_func(move |()| f());
    }

    /// Registers the handler invoked whenever the reliable channel closes.
    pub fn on_reliable_close(&self, mut f: impl FnMut() + 'static) {
        self.0.on_reliable_close.set_func(move |()| f());
    }

    /// Registers the handler invoked for every message received on the
    /// reliable channel.
    pub fn on_reliable_message(&self, f: impl FnMut(String) + 'static) {
        self.0.on_reliable_message.set_func(f);
    }

    /// Registers the handler invoked whenever the underlying peer
    /// connection's state changes.
    pub fn on_connection_state_change(&self, f: impl FnMut(crate::peer::PeerConnectionState) + 'static) {
        self.0.on_connection_state_change.set_func(f);
    }

    /// Registers the handler invoked whenever an internal event handler
    /// catches and reports a non-fatal error.
    pub fn on_error(&self, f: impl FnMut(SessionError) + 'static) {
        self.0.on_error.set_func(f);
    }

    /// Registers the handler invoked with a fresh [`DebugSnapshot`] whenever
    /// phase, peer generation, or ICE counters change.
    pub fn on_debug(&self, f: impl FnMut(DebugSnapshot) + 'static) {
        self.0.on_debug.set_func(f);
    }

    pub(crate) fn emit_debug(&self) {
        self.0.on_debug.call(self.inspect());
    }

    fn cancel_all_timers(&self) {
        for timer in [
            &self.0.soft_timer,
            &self.0.hard_timer,
            &self.0.connecting_watchdog_timer,
            &self.0.dc_recovery_timer,
            &self.0.lan_first_timer,
        ] {
            if let Some(handle) = timer.borrow_mut().take() {
                handle.stop();
            }
        }
    }

    fn report_error(&self, err: SessionError) {
        log::error!("{err}");
        self.0.last_error.borrow_mut().replace(err.clone());
        self.0.on_error.call(err);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ChannelKind {
    Fast,
    Reliable,
}

impl Inner {
    pub(crate) fn current_generation(&self) -> u64 {
        self.pc_generation.get()
    }

    pub(crate) fn is_current_generation(&self, generation: u64) -> bool {
        self.pc_generation.get() == generation
    }

    pub(crate) fn label_for(&self, kind: ChannelKind) -> &str {
        match kind {
            ChannelKind::Fast => &self.config.fast_label,
            ChannelKind::Reliable => &self.config.reliable_label,
        }
    }
}

/// Unwraps a [`TracedResult`] into the plain `Result` the public API
/// surface returns, logging the capture-site trace at `error` level first.
pub(crate) fn into_public<T>(result: TracedResult<T>) -> Result<T, SessionError> {
    result.map_err(|traced| {
        log::error!("{traced}");
        traced.into_inner()
    })
}

pub(crate) fn invalid_state(phase: ErrorPhase, message: impl Into<String>) -> SessionError {
    SessionError::new(ErrorKind::InvalidState, phase, message)
}
