//! `connect` and the perfect-negotiation state machine: offer/answer
//! exchange with glare resolution, remote ICE buffering, and epoch-driven
//! peer rebuilds.

use std::rc::Rc;

use futures::StreamExt as _;
use webrtc_signal_proto::{Answer, CandidateRecord, IceCandidateInit, Offer, Role, SdpKind};

use super::{into_public, Phase, Session};
use crate::{
    config::ConnectionStrategy,
    error::{SessionError, TracedResult},
    ice::{self, CandidateType, IcePhase},
    peer::{PeerConnection, SignalingState},
};

impl Session {
    /// Verifies a room has been selected and exists, subscribes to
    /// signaling streams, and builds the initial peer. Idempotent: a second
    /// call while already connected is a no-op.
    ///
    /// # Errors
    /// [`ErrorKind::RoomNotSelected`](crate::error::ErrorKind::RoomNotSelected),
    /// [`ErrorKind::RoomNotFound`](crate::error::ErrorKind::RoomNotFound),
    /// [`ErrorKind::DbUnavailable`](crate::error::ErrorKind::DbUnavailable).
    pub async fn connect(&self) -> Result<(), SessionError> {
        into_public(self.connect_traced().await)
    }

    async fn connect_traced(&self) -> TracedResult<()> {
        if self.0.peer.borrow().is_some() {
            return Ok(());
        }
        if self.0.room_id.borrow().is_none() {
            return Err(tracerr::new!(SessionError::room_not_selected()));
        }
        let room = self
            .0
            .store
            .get_room()
            .await
            .map_err(tracerr::from_and_wrap!())?
            .ok_or_else(|| tracerr::new!(SessionError::room_not_found()))?;
        if room.epoch > self.0.signaling_epoch.get() {
            self.0.signaling_epoch.set(room.epoch);
        }

        self.subscribe_streams();
        self.0.subscribed.set(true);

        let initial_phase = match self.0.config.connection_strategy {
            ConnectionStrategy::LanFirst => IcePhase::Lan,
            ConnectionStrategy::Default => IcePhase::Stun,
        };
        self.0.ice_phase.set(initial_phase);
        self.build_peer(initial_phase)
            .await
            .map_err(tracerr::from_and_wrap!())?;

        if initial_phase == IcePhase::Lan && self.0.role == Role::Caller {
            self.arm_lan_first_timer();
        }
        self.0.phase.set(Phase::Negotiating);
        self.emit_debug();
        Ok(())
    }

    fn subscribe_streams(&self) {
        self.spawn_offer_consumer();
        self.spawn_answer_consumer();
        self.spawn_ice_consumer();
    }

    fn spawn_offer_consumer(&self) {
        let mut stream = crate::stream::dedup_offers(self.0.store.subscribe_on_offer());
        let session = self.clone();
        tokio::task::spawn_local(async move {
            while let Some(offer) = stream.next().await {
                if !session.0.subscribed.get() {
                    break;
                }
                session.handle_remote_offer(offer).await;
            }
        });
    }

    fn spawn_answer_consumer(&self) {
        let mut stream = crate::stream::dedup_answers(self.0.store.subscribe_on_answer());
        let session = self.clone();
        tokio::task::spawn_local(async move {
            while let Some(answer) = stream.next().await {
                if !session.0.subscribed.get() {
                    break;
                }
                session.handle_remote_answer(answer).await;
            }
        });
    }

    fn spawn_ice_consumer(&self) {
        let raw = match self.0.role {
            Role::Caller => self.0.store.subscribe_on_callee_ice_candidate(),
            Role::Callee => self.0.store.subscribe_on_caller_ice_candidate(),
        };
        let mut stream = crate::stream::dedup_candidates(raw);
        let session = self.clone();
        tokio::task::spawn_local(async move {
            while let Some(candidate) = stream.next().await {
                if !session.0.subscribed.get() {
                    break;
                }
                session.handle_remote_ice_candidate(candidate).await;
            }
        });
    }

    pub(super) async fn handle_negotiation_needed(&self) {
        let peer = match self.0.peer.borrow().clone() {
            Some(peer) => peer,
            None => return,
        };
        if self.0.making_offer.get() || peer.signaling_state() != SignalingState::Stable {
            return;
        }
        self.0.making_offer.set(true);
        self.0.phase.set(Phase::Negotiating);
        let generation = self.0.pc_generation.get();

        let offer_sdp = match peer.create_offer().await {
            Ok(sdp) => sdp,
            Err(err) => {
                self.report_error(err);
                self.0.making_offer.set(false);
                return;
            }
        };
        if !self.0.is_current_generation(generation) {
            self.0.making_offer.set(false);
            return;
        }
        if let Err(err) = peer.set_local_description(SdpKind::Offer, offer_sdp.clone()).await {
            self.report_error(err);
            self.0.making_offer.set(false);
            return;
        }
        self.0.last_local_offer_sdp.borrow_mut().replace(offer_sdp.clone());

        let epoch = match self.0.store.get_room().await {
            Ok(Some(room)) if room.epoch > self.0.signaling_epoch.get() => {
                self.0.making_offer.set(false);
                self.epoch_advance(room.epoch).await;
                return;
            }
            Ok(Some(room)) => room.epoch,
            Ok(None) => self.0.signaling_epoch.get(),
            Err(err) => {
                self.report_error(err);
                self.0.making_offer.set(false);
                return;
            }
        };

        let offer = Offer::new(offer_sdp, epoch, Some(generation));
        if let Err(err) = self.0.store.set_offer(offer).await {
            self.report_error(err);
        }
        self.0.making_offer.set(false);
    }

    async fn handle_remote_offer(&self, offer: Offer) {
        if offer.epoch < self.0.signaling_epoch.get() {
            log::debug!("dropping offer at stale epoch {}", offer.epoch);
            return;
        }
        if offer.epoch > self.0.signaling_epoch.get() {
            self.epoch_advance(offer.epoch).await;
        }

        let already_seen = self.0.last_seen_offer_sdp.borrow().as_deref() == Some(offer.sdp.as_str());
        let own_echo = self.0.last_local_offer_sdp.borrow().as_deref() == Some(offer.sdp.as_str());
        if already_seen || own_echo {
            return;
        }
        self.0.last_seen_offer_sdp.borrow_mut().replace(offer.sdp.clone());

        if self.0.role == Role::Callee {
            if let Some(remote_generation) = offer.pc_generation {
                if remote_generation > self.0.pc_generation.get() {
                    self.rebuild_peer_for_generation(remote_generation).await;
                }
            }
        }

        let peer = match self.0.peer.borrow().clone() {
            Some(peer) => peer,
            None => return,
        };
        let glare = self.0.making_offer.get() || peer.signaling_state() != SignalingState::Stable;
        if glare {
            if !self.0.polite {
                log::debug!("impolite side ignoring offer during glare");
                return;
            }
            if let Err(err) = peer.rollback().await {
                log::warn!("rollback during glare resolution failed: {err}");
            }
        }

        if let Err(err) = peer.set_remote_description(SdpKind::Offer, offer.sdp.clone()).await {
            self.report_error(err);
            return;
        }
        self.0.remote_desc_set.set(true);
        self.0.last_handled_offer_sdp.borrow_mut().replace(offer.sdp);
        self.drain_pending_ice(&peer).await;

        if peer.signaling_state() == SignalingState::HaveRemoteOffer && !self.0.answering.get() {
            self.answer_offer(&peer, offer.pc_generation).await;
        }
    }

    async fn answer_offer(&self, peer: &Rc<dyn PeerConnection>, for_pc_generation: Option<u64>) {
        self.0.answering.set(true);
        let generation = self.0.pc_generation.get();
        match peer.create_answer().await {
            Ok(answer_sdp) => {
                if let Err(err) = peer.set_local_description(SdpKind::Answer, answer_sdp.clone()).await {
                    self.report_error(err);
                } else {
                    let epoch = match self.0.store.get_room().await {
                        Ok(Some(room)) => room.epoch,
                        _ => self.0.signaling_epoch.get(),
                    };
                    let answer = Answer::new(answer_sdp, epoch, Some(generation), for_pc_generation);
                    if let Err(err) = self.0.store.set_answer(answer).await {
                        self.report_error(err);
                    }
                }
            }
            Err(err) => self.report_error(err),
        }
        self.0.answering.set(false);
    }

    async fn handle_remote_answer(&self, answer: Answer) {
        if answer.epoch < self.0.signaling_epoch.get() {
            log::debug!("dropping answer at stale epoch {}", answer.epoch);
            return;
        }
        if answer.epoch > self.0.signaling_epoch.get() {
            self.epoch_advance(answer.epoch).await;
        }

        let already_seen = self.0.last_seen_answer_sdp.borrow().as_deref() == Some(answer.sdp.as_str());
        if already_seen {
            return;
        }
        self.0.last_seen_answer_sdp.borrow_mut().replace(answer.sdp.clone());

        let already_handled = self.0.last_handled_answer_sdp.borrow().as_deref() == Some(answer.sdp.as_str());
        if already_handled || self.0.remote_desc_set.get() {
            return;
        }

        let peer = match self.0.peer.borrow().clone() {
            Some(peer) => peer,
            None => return,
        };
        if peer.signaling_state() != SignalingState::HaveLocalOffer {
            return;
        }

        if self.0.role == Role::Caller {
            if let Some(for_generation) = answer.for_pc_generation {
                if for_generation != self.0.pc_generation.get() {
                    log::debug!("dropping answer for stale generation {for_generation}");
                    return;
                }
            }
        }
        if let Some(remote_generation) = answer.pc_generation {
            if remote_generation < self.0.remote_pc_generation.get() {
                return;
            }
            self.0.remote_pc_generation.set(remote_generation);
        }

        if let Err(err) = peer.set_remote_description(SdpKind::Answer, answer.sdp.clone()).await {
            self.report_error(err);
            return;
        }
        self.0.remote_desc_set.set(true);
        self.0.last_handled_answer_sdp.borrow_mut().replace(answer.sdp);
        self.drain_pending_ice(&peer).await;
    }

    async fn handle_remote_ice_candidate(&self, candidate: CandidateRecord) {
        if candidate.epoch < self.0.signaling_epoch.get() {
            return;
        }
        if candidate.epoch > self.0.signaling_epoch.get() {
            self.epoch_advance(candidate.epoch).await;
        }
        if candidate.pc_generation < self.0.remote_pc_generation.get() {
            return;
        }

        if self.0.ice_phase.get() == IcePhase::Lan
            && self.0.role == Role::Callee
            && ice::classify(&candidate.candidate) != CandidateType::Host
        {
            self.transition_to_stun().await;
        }

        let phase = self.0.ice_phase.get();
        let kind = ice::classify(&candidate.candidate);
        self.0.counters.borrow_mut().remote_seen.bump(kind);
        if !ice::should_accept(phase, &candidate.candidate) {
            self.0.counters.borrow_mut().remote_dropped.bump(kind);
            return;
        }
        self.0.counters.borrow_mut().remote_accepted.bump(kind);

        let init: IceCandidateInit = candidate.into();
        if self.0.remote_desc_set.get() {
            if let Some(peer) = self.0.peer.borrow().clone() {
                if let Err(err) = peer.add_ice_candidate(init).await {
                    log::warn!("add_ice_candidate failed: {err}");
                }
            }
        } else {
            self.0.pending_ice.borrow_mut().push(init);
        }
    }

    async fn drain_pending_ice(&self, peer: &Rc<dyn PeerConnection>) {
        let pending: Vec<_> = self.0.pending_ice.borrow_mut().drain(..).collect();
        for candidate in pending {
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                log::warn!("add_ice_candidate failed while draining buffered candidates: {err}");
            }
        }
    }

    pub(super) fn handle_local_ice_candidate(&self, candidate: IceCandidateInit) {
        let phase = self.0.ice_phase.get();
        let kind = ice::classify(&candidate.candidate);
        self.0.counters.borrow_mut().local_seen.bump(kind);
        if !ice::should_send(phase, &candidate.candidate) {
            self.0.counters.borrow_mut().local_dropped.bump(kind);
            return;
        }
        self.0.counters.borrow_mut().local_sent.bump(kind);

        let record = CandidateRecord::new(
            candidate.candidate,
            candidate.sdp_mid,
            candidate.sdp_m_line_index,
            candidate.username_fragment,
            self.0.signaling_epoch.get(),
            self.0.pc_generation.get(),
        );
        let session = self.clone();
        tokio::task::spawn_local(async move {
            let result = match session.0.role {
                Role::Caller => session.0.store.add_caller_ice_candidate(record).await,
                Role::Callee => session.0.store.add_callee_ice_candidate(record).await,
            };
            if let Err(err) = result {
                session.report_error(err);
            }
        });
    }

    pub(super) async fn epoch_advance(&self, new_epoch: u64) {
        log::debug!("epoch advance {} -> {new_epoch}", self.0.signaling_epoch.get());
        self.0.signaling_epoch.set(new_epoch);
        self.reset_negotiation_flags();
        self.0.pending_ice.borrow_mut().clear();
        self.rebuild_peer(self.0.ice_phase.get()).await;
    }

    async fn rebuild_peer_for_generation(&self, remote_generation: u64) {
        self.reset_negotiation_flags();
        self.0.pending_ice.borrow_mut().clear();
        self.rebuild_peer(self.0.ice_phase.get()).await;
        self.0.remote_pc_generation.set(remote_generation);
    }

    pub(super) async fn transition_to_stun(&self) {
        if self.0.ice_phase.get() == IcePhase::Stun {
            return;
        }
        log::debug!("LAN candidates exhausted, transitioning to STUN");
        if let Some(handle) = self.0.lan_first_timer.borrow_mut().take() {
            handle.stop();
        }
        self.reset_negotiation_flags();
        self.rebuild_peer(IcePhase::Stun).await;
    }

    fn reset_negotiation_flags(&self) {
        self.0.making_offer.set(false);
        self.0.answering.set(false);
        self.0.remote_desc_set.set(false);
        self.0.last_handled_offer_sdp.borrow_mut().take();
        self.0.last_handled_answer_sdp.borrow_mut().take();
        self.0.last_seen_offer_sdp.borrow_mut().take();
        self.0.last_seen_answer_sdp.borrow_mut().take();
        self.0.last_local_offer_sdp.borrow_mut().take();
    }

    pub(super) async fn rebuild_peer(&self, phase: IcePhase) {
        self.cancel_peer_scoped_timers();
        if let Some(old) = self.0.peer.borrow_mut().take() {
            old.close();
        }
        self.0.fast.borrow_mut().take();
        self.0.reliable.borrow_mut().take();
        self.0.pc_generation.set(self.0.pc_generation.get() + 1);
        self.0.ice_phase.set(phase);
        if let Err(err) = self.build_peer(phase).await {
            self.report_error(err);
        }
        if phase == IcePhase::Lan && self.0.role == Role::Caller {
            self.arm_lan_first_timer();
        }
        self.emit_debug();
    }

    pub(super) async fn build_peer(&self, phase: IcePhase) -> Result<(), SessionError> {
        let peer_config = ice::peer_config_for(phase, &self.0.config);
        let peer = self.0.peer_factory.create(peer_config).await?;
        self.wire_peer_callbacks(&peer);
        if self.0.role == Role::Caller {
            self.create_channels(&peer);
        }
        *self.0.peer.borrow_mut() = Some(peer);
        Ok(())
    }

    fn wire_peer_callbacks(&self, peer: &Rc<dyn PeerConnection>) {
        let generation = self.0.pc_generation.get();

        let session = self.clone();
        peer.on_negotiation_needed(Box::new(move || {
            if !session.0.is_current_generation(generation) {
                return;
            }
            let session = session.clone();
            tokio::task::spawn_local(async move { session.handle_negotiation_needed().await });
        }));

        let session = self.clone();
        peer.on_ice_candidate(Box::new(move |candidate| {
            if !session.0.is_current_generation(generation) {
                return;
            }
            session.handle_local_ice_candidate(candidate);
        }));

        let session = self.clone();
        peer.on_connection_state_change(Box::new(move |state| {
            if !session.0.is_current_generation(generation) {
                return;
            }
            session.0.on_connection_state_change.call(state);
            session.handle_connection_state_change(state);
        }));

        let session = self.clone();
        peer.on_ice_connection_state_change(Box::new(move |state| {
            if !session.0.is_current_generation(generation) {
                return;
            }
            session.handle_ice_connection_state_change(state);
        }));

        if self.0.role == Role::Callee {
            let session = self.clone();
            peer.on_data_channel(Box::new(move |channel| {
                if !session.0.is_current_generation(generation) {
                    return;
                }
                session.receive_channel(channel);
            }));
        }
    }
}
