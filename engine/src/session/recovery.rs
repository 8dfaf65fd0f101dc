//! Data channel lifecycle and send queues, the LAN-first/connecting/DC
//! watchdogs, and soft (ICE restart) / hard (peer rebuild) recovery.

use std::{rc::Rc, time::Duration};

use futures::channel::oneshot;
use webrtc_signal_proto::{Offer, SdpKind};

use super::{invalid_state, ChannelKind, Phase, SelectedPath, Session, WaitOpts};
use crate::{
    delay::resettable_delay_for,
    error::{ErrorPhase, SessionError},
    ice::{CandidateType, IcePhase},
    peer::{ChannelState, DataChannel, IceConnectionState, PeerConnection, PeerConnectionState, SignalingState},
};

impl Session {
    /// Re-negotiates with an ICE restart on the existing peer, if stable and
    /// not already mid-negotiation.
    ///
    /// # Errors
    /// [`ErrorKind::RoomNotSelected`](crate::error::ErrorKind::RoomNotSelected),
    /// [`ErrorKind::InvalidState`](crate::error::ErrorKind::InvalidState) if
    /// `connect` was never called.
    /// [`ErrorKind::SignalingFailed`](crate::error::ErrorKind::SignalingFailed).
    pub async fn reconnect_soft(&self) -> Result<(), SessionError> {
        if self.0.room_id.borrow().is_none() {
            return Err(SessionError::room_not_selected());
        }
        let peer = match self.0.peer.borrow().clone() {
            Some(peer) => peer,
            None => return Err(invalid_state(ErrorPhase::Reconnect, "reconnect_soft called before connect")),
        };
        if self.0.making_offer.get() || peer.signaling_state() != SignalingState::Stable {
            return Ok(());
        }
        self.0.phase.set(Phase::SoftReconnect);
        self.emit_debug();
        peer.restart_ice();
        self.0.making_offer.set(true);
        let generation = self.0.pc_generation.get();

        let result: Result<(), SessionError> = async {
            let offer_sdp = peer.create_offer().await?;
            if !self.0.is_current_generation(generation) {
                return Ok(());
            }
            peer.set_local_description(SdpKind::Offer, offer_sdp.clone()).await?;
            self.0.last_local_offer_sdp.borrow_mut().replace(offer_sdp.clone());
            let epoch = self
                .0
                .store
                .get_room()
                .await?
                .map_or(self.0.signaling_epoch.get(), |room| room.epoch);
            let offer = Offer::new(offer_sdp, epoch, Some(generation));
            self.0.store.set_offer(offer).await?;
            Ok(())
        }
        .await;

        self.0.making_offer.set(false);
        result.map_err(SessionError::signaling_failed)
    }

    /// Atomically rebuilds the peer on a new generation, resets negotiation
    /// state, then waits until both channels are open.
    ///
    /// # Errors
    /// [`ErrorKind::RoomNotSelected`](crate::error::ErrorKind::RoomNotSelected),
    /// [`ErrorKind::WaitReadyTimeout`](crate::error::ErrorKind::WaitReadyTimeout).
    pub async fn reconnect_hard(&self, opts: WaitOpts) -> Result<(), SessionError> {
        if self.0.room_id.borrow().is_none() {
            return Err(SessionError::room_not_selected());
        }
        self.0.phase.set(Phase::HardReconnect);
        self.emit_debug();
        self.0.controlled_peer_rebuild.set(true);
        if let Some(handle) = self.0.soft_timer.borrow_mut().take() {
            handle.stop();
        }
        if let Some(handle) = self.0.hard_timer.borrow_mut().take() {
            handle.stop();
        }

        let phase = self.0.ice_phase.get();
        self.rebuild_peer(phase).await;
        self.0.controlled_peer_rebuild.set(false);

        self.wait_ready(opts).await
    }

    pub(super) fn create_channels(&self, peer: &Rc<dyn PeerConnection>) {
        let generation = self.0.pc_generation.get();

        let fast = peer.create_data_channel(&self.0.config.fast_label, self.0.config.fast_init);
        fast.set_buffered_amount_low_threshold(self.0.config.fast_buffered_amount_low_threshold);
        self.wire_channel_callbacks(ChannelKind::Fast, &fast, generation);
        self.0.fast.borrow_mut().replace(fast);

        let reliable = peer.create_data_channel(&self.0.config.reliable_label, self.0.config.reliable_init);
        reliable.set_buffered_amount_low_threshold(self.0.config.reliable_buffered_amount_low_threshold);
        self.wire_channel_callbacks(ChannelKind::Reliable, &reliable, generation);
        self.0.reliable.borrow_mut().replace(reliable);
    }

    pub(super) fn receive_channel(&self, channel: Rc<dyn DataChannel>) {
        let generation = self.0.pc_generation.get();
        let kind = if channel.label() == self.0.config.fast_label {
            ChannelKind::Fast
        } else {
            ChannelKind::Reliable
        };
        let threshold = match kind {
            ChannelKind::Fast => self.0.config.fast_buffered_amount_low_threshold,
            ChannelKind::Reliable => self.0.config.reliable_buffered_amount_low_threshold,
        };
        channel.set_buffered_amount_low_threshold(threshold);
        self.wire_channel_callbacks(kind, &channel, generation);
        match kind {
            ChannelKind::Fast => self.0.fast.borrow_mut().replace(channel),
            ChannelKind::Reliable => self.0.reliable.borrow_mut().replace(channel),
        };
    }

    fn wire_channel_callbacks(&self, kind: ChannelKind, channel: &Rc<dyn DataChannel>, owner_generation: u64) {
        let session = self.clone();
        channel.on_open(Box::new(move || {
            if session.0.is_current_generation(owner_generation) {
                session.handle_channel_open(kind);
            }
        }));

        let session = self.clone();
        channel.on_close(Box::new(move || {
            if session.0.is_current_generation(owner_generation) {
                session.handle_channel_close(kind);
            }
        }));

        let session = self.clone();
        channel.on_message(Box::new(move |data| {
            if session.0.is_current_generation(owner_generation) {
                session.handle_channel_message(kind, data);
            }
        }));

        let session = self.clone();
        channel.on_buffered_amount_low(Box::new(move || {
            if !session.0.is_current_generation(owner_generation) {
                return;
            }
            let waiters = match kind {
                ChannelKind::Fast => &session.0.fast_low_waiters,
                ChannelKind::Reliable => &session.0.reliable_low_waiters,
            };
            for tx in waiters.borrow_mut().drain(..) {
                let _ = tx.send(());
            }
        }));
    }

    fn channel_for(&self, kind: ChannelKind) -> Option<Rc<dyn DataChannel>> {
        match kind {
            ChannelKind::Fast => self.0.fast.borrow().clone(),
            ChannelKind::Reliable => self.0.reliable.borrow().clone(),
        }
    }

    fn enqueue(&self, kind: ChannelKind, text: String) {
        match kind {
            ChannelKind::Fast => self.0.fast_queue.borrow_mut().push_back(text),
            ChannelKind::Reliable => self.0.reliable_queue.borrow_mut().push_back(text),
        }
    }

    fn take_queue(&self, kind: ChannelKind) -> Vec<String> {
        match kind {
            ChannelKind::Fast => self.0.fast_queue.borrow_mut().drain(..).collect(),
            ChannelKind::Reliable => self.0.reliable_queue.borrow_mut().drain(..).collect(),
        }
    }

    fn push_open_waiter(&self, kind: ChannelKind, tx: oneshot::Sender<()>) {
        match kind {
            ChannelKind::Fast => self.0.fast_open_waiters.borrow_mut().push(tx),
            ChannelKind::Reliable => self.0.reliable_open_waiters.borrow_mut().push(tx),
        }
    }

    fn take_open_waiters(&self, kind: ChannelKind) -> Vec<oneshot::Sender<()>> {
        match kind {
            ChannelKind::Fast => self.0.fast_open_waiters.borrow_mut().drain(..).collect(),
            ChannelKind::Reliable => self.0.reliable_open_waiters.borrow_mut().drain(..).collect(),
        }
    }

    pub(super) async fn send_on(&self, kind: ChannelKind, text: String) {
        if let Some(channel) = self.channel_for(kind) {
            if channel.state() == ChannelState::Open {
                self.send_with_backpressure(kind, &channel, text).await;
                return;
            }
        }
        let (tx, rx) = oneshot::channel();
        self.enqueue(kind, text);
        self.push_open_waiter(kind, tx);
        let _ = rx.await;
    }

    async fn send_with_backpressure(&self, kind: ChannelKind, channel: &Rc<dyn DataChannel>, text: String) {
        let threshold = match kind {
            ChannelKind::Fast => self.0.config.fast_buffered_amount_low_threshold,
            ChannelKind::Reliable => self.0.config.reliable_buffered_amount_low_threshold,
        };
        if channel.buffered_amount() > threshold {
            let (tx, rx) = oneshot::channel();
            self.push_low_waiter(kind, tx);
            let _ = rx.await;
        }
        if let Err(err) = channel.send(&text) {
            self.report_error(err);
        }
    }

    fn push_low_waiter(&self, kind: ChannelKind, tx: oneshot::Sender<()>) {
        match kind {
            ChannelKind::Fast => self.0.fast_low_waiters.borrow_mut().push(tx),
            ChannelKind::Reliable => self.0.reliable_low_waiters.borrow_mut().push(tx),
        }
    }

    fn handle_channel_open(&self, kind: ChannelKind) {
        let channel = match self.channel_for(kind) {
            Some(channel) => channel,
            None => return,
        };
        let pending = self.take_queue(kind);
        let waiters = self.take_open_waiters(kind);
        let session = self.clone();
        tokio::task::spawn_local(async move {
            for text in pending {
                session.send_with_backpressure(kind, &channel, text).await;
            }
            for tx in waiters {
                let _ = tx.send(());
            }
            match kind {
                ChannelKind::Fast => session.0.on_fast_open.call(()),
                ChannelKind::Reliable => session.0.on_reliable_open.call(()),
            }
            session.maybe_mark_connected();
        });
    }

    fn handle_channel_close(&self, kind: ChannelKind) {
        match kind {
            ChannelKind::Fast => {
                self.0.fast.borrow_mut().take();
                self.0.on_fast_close.call(());
            }
            ChannelKind::Reliable => {
                self.0.reliable.borrow_mut().take();
                self.0.on_reliable_close.call(());
            }
        }
        // A channel closing always makes `is_ready` false; drop a stale
        // `Connected` phase so a concurrent `wait_ready` re-checks live
        // state instead of resolving against the phase we're leaving.
        if self.0.phase.get() == Phase::Connected && !self.is_ready() {
            self.0.phase.set(Phase::Negotiating);
            self.emit_debug();
        }
        let unhealthy = matches!(
            self.0.peer.borrow().as_deref().map(PeerConnection::connection_state),
            Some(PeerConnectionState::Disconnected | PeerConnectionState::Failed | PeerConnectionState::Closed)
        );
        if unhealthy && !self.0.controlled_peer_rebuild.get() {
            self.schedule_soft_then_hard();
        }
    }

    fn handle_channel_message(&self, kind: ChannelKind, data: String) {
        match kind {
            ChannelKind::Fast => self.0.on_fast_message.call(data),
            ChannelKind::Reliable => self.0.on_reliable_message.call(data),
        }
    }

    fn maybe_mark_connected(&self) {
        if self.is_ready() {
            self.0.phase.set(Phase::Connected);
            self.infer_selected_path();
            self.reset_recovery_counters();
            self.emit_debug();
        }
    }

    fn infer_selected_path(&self) {
        if self.0.ice_phase.get() == IcePhase::Lan {
            self.0.selected_path.set(Some(SelectedPath::Host));
            return;
        }
        let counters = *self.0.counters.borrow();
        for kind in CandidateType::PRIORITY {
            if counters.local_sent.get(kind) > 0 || counters.remote_accepted.get(kind) > 0 {
                let path = match kind {
                    CandidateType::Srflx => SelectedPath::Srflx,
                    CandidateType::Relay => SelectedPath::Relay,
                    CandidateType::Host => SelectedPath::Host,
                    CandidateType::Unknown => SelectedPath::Unknown,
                };
                self.0.selected_path.set(Some(path));
                return;
            }
        }
        self.0.selected_path.set(Some(SelectedPath::Unknown));
    }

    fn reset_recovery_counters(&self) {
        self.0.soft_retries.set(0);
        self.0.hard_retries.set(0);
        self.0.stun_watchdog_reconnects.set(0);
        self.0.soft_backoff.borrow_mut().reset();
        self.0.hard_backoff.borrow_mut().reset();
        self.0.last_error.borrow_mut().take();
    }

    pub(super) fn handle_connection_state_change(&self, state: PeerConnectionState) {
        match state {
            PeerConnectionState::Connecting => self.arm_connecting_watchdog(),
            PeerConnectionState::Connected => {
                if let Some(handle) = self.0.connecting_watchdog_timer.borrow_mut().take() {
                    handle.stop();
                }
                if self.0.ice_phase.get() == IcePhase::Lan {
                    if let Some(handle) = self.0.lan_first_timer.borrow_mut().take() {
                        handle.stop();
                    }
                }
                self.arm_dc_recovery_watchdog();
                self.maybe_mark_connected();
            }
            PeerConnectionState::Disconnected => {
                if !self.0.controlled_peer_rebuild.get() {
                    self.schedule_soft_then_hard();
                }
            }
            PeerConnectionState::Failed | PeerConnectionState::Closed => {
                if !self.0.controlled_peer_rebuild.get() {
                    self.schedule_hard_immediately();
                }
            }
            PeerConnectionState::New => {}
        }
    }

    pub(super) fn handle_ice_connection_state_change(&self, state: IceConnectionState) {
        if state == IceConnectionState::Checking {
            self.arm_connecting_watchdog();
        }
    }

    fn arm_connecting_watchdog(&self) {
        if self.0.connecting_watchdog_timer.borrow().is_some() {
            return;
        }
        let timeout = if self.0.ice_phase.get() == IcePhase::Lan {
            Duration::from_millis(6500)
        } else {
            Duration::from_secs(25)
        };
        let generation = self.0.pc_generation.get();
        self.0.connecting_watchdog_generation.set(generation);
        let (fut, handle) = resettable_delay_for(timeout, false);
        self.0.connecting_watchdog_timer.borrow_mut().replace(handle);
        let session = self.clone();
        tokio::task::spawn_local(async move {
            fut.await;
            session.on_connecting_watchdog_fire(generation).await;
        });
    }

    async fn on_connecting_watchdog_fire(&self, generation: u64) {
        if !self.0.is_current_generation(generation) || self.is_ready() {
            return;
        }
        log::warn!(
            "connecting watchdog fired at generation {generation}, phase {:?}",
            self.0.ice_phase.get()
        );
        if self.0.ice_phase.get() == IcePhase::Stun && self.0.stun_watchdog_reconnects.get() >= 2 {
            log::warn!("watchdog-triggered hard reconnect cap reached for this session");
            return;
        }
        if self.0.ice_phase.get() == IcePhase::Stun {
            self.0.stun_watchdog_reconnects.set(self.0.stun_watchdog_reconnects.get() + 1);
        }
        let _ = self.reconnect_hard(WaitOpts::default()).await;
    }

    fn arm_dc_recovery_watchdog(&self) {
        let generation = self.0.pc_generation.get();
        self.0.dc_recovery_generation.set(generation);
        let (fut, handle) = resettable_delay_for(Duration::from_millis(1200), false);
        self.0.dc_recovery_timer.borrow_mut().replace(handle);
        let session = self.clone();
        tokio::task::spawn_local(async move {
            fut.await;
            session.on_dc_recovery_fire(generation).await;
        });
    }

    async fn on_dc_recovery_fire(&self, generation: u64) {
        if !self.0.is_current_generation(generation) {
            return;
        }
        let fast_open = matches!(
            self.0.fast.borrow().as_deref().map(DataChannel::state),
            Some(ChannelState::Open)
        );
        let reliable_open = matches!(
            self.0.reliable.borrow().as_deref().map(DataChannel::state),
            Some(ChannelState::Open)
        );
        if !fast_open || !reliable_open {
            let _ = self.reconnect_soft().await;
        }
    }

    fn schedule_soft_then_hard(&self) {
        let soft_delay = self.0.soft_backoff.borrow_mut().next();
        let hard_delay = self.0.hard_backoff.borrow_mut().next();
        let generation = self.0.pc_generation.get();

        let (soft_fut, soft_handle) = resettable_delay_for(soft_delay, false);
        self.0.soft_timer.borrow_mut().replace(soft_handle);
        let session = self.clone();
        tokio::task::spawn_local(async move {
            soft_fut.await;
            if session.0.is_current_generation(generation) {
                session.0.soft_retries.set(session.0.soft_retries.get() + 1);
                let _ = session.reconnect_soft().await;
            }
        });

        let (hard_fut, hard_handle) = resettable_delay_for(hard_delay, false);
        self.0.hard_timer.borrow_mut().replace(hard_handle);
        let session = self.clone();
        tokio::task::spawn_local(async move {
            hard_fut.await;
            if session.0.is_current_generation(generation) && !session.is_ready() {
                session.0.hard_retries.set(session.0.hard_retries.get() + 1);
                let _ = session.reconnect_hard(WaitOpts::default()).await;
            }
        });
    }

    fn schedule_hard_immediately(&self) {
        if let Some(handle) = self.0.soft_timer.borrow_mut().take() {
            handle.stop();
        }
        let generation = self.0.pc_generation.get();
        let session = self.clone();
        tokio::task::spawn_local(async move {
            if session.0.is_current_generation(generation) {
                session.0.hard_retries.set(session.0.hard_retries.get() + 1);
                let _ = session.reconnect_hard(WaitOpts::default()).await;
            }
        });
    }

    pub(super) fn arm_lan_first_timer(&self) {
        let generation = self.0.pc_generation.get();
        let (fut, handle) = resettable_delay_for(self.0.config.lan_first_timeout, false);
        self.0.lan_first_timer.borrow_mut().replace(handle);
        let session = self.clone();
        tokio::task::spawn_local(async move {
            fut.await;
            if !session.0.is_current_generation(generation) || session.is_ready() {
                return;
            }
            session.transition_to_stun().await;
        });
    }

    pub(super) fn cancel_peer_scoped_timers(&self) {
        for timer in [
            &self.0.connecting_watchdog_timer,
            &self.0.dc_recovery_timer,
            &self.0.lan_first_timer,
        ] {
            if let Some(handle) = timer.borrow_mut().take() {
                handle.stop();
            }
        }
    }
}
