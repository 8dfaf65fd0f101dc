//! In-memory [`SignalStore`] used by the engine's own test suite and
//! exported so downstream integration tests can drive the engine without a
//! real signaling backend.

use std::{cell::RefCell, rc::Rc};

use async_trait::async_trait;
use futures::channel::mpsc;
use webrtc_signal_proto::{Answer, CandidateRecord, Offer, RoomId, RoomRecord, Role};

use super::SignalStore;
use crate::error::SessionError;

#[derive(Default)]
struct State {
    next_room_id: u64,
    room: RoomRecord,
    caller_candidates: Vec<CandidateRecord>,
    callee_candidates: Vec<CandidateRecord>,
    offer_subs: Vec<mpsc::UnboundedSender<Offer>>,
    answer_subs: Vec<mpsc::UnboundedSender<Answer>>,
    caller_candidate_subs: Vec<mpsc::UnboundedSender<CandidateRecord>>,
    callee_candidate_subs: Vec<mpsc::UnboundedSender<CandidateRecord>>,
    has_room: bool,
    fail_next: bool,
}

/// A single-room, single-process fake of the signaling backend. Cloning
/// shares the same underlying room (use [`MemoryStore::clone`] to hand the
/// "other side" of a test a view of the same store).
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Rc<RefCell<State>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next store call fail with `DB_UNAVAILABLE`, for exercising
    /// the engine's error propagation.
    pub fn fail_next_call(&self) {
        self.state.borrow_mut().fail_next = true;
    }

    fn take_failure(&self) -> Result<(), SessionError> {
        let mut state = self.state.borrow_mut();
        if state.fail_next {
            state.fail_next = false;
            Err(SessionError::db_unavailable("simulated store outage"))
        } else {
            Ok(())
        }
    }
}

#[async_trait(?Send)]
impl SignalStore for MemoryStore {
    async fn create_room(&self) -> Result<RoomId, SessionError> {
        self.take_failure()?;
        let mut state = self.state.borrow_mut();
        state.next_room_id += 1;
        let id = RoomId(format!("room-{}", state.next_room_id));
        state.room = RoomRecord::default();
        state.has_room = true;
        Ok(id)
    }

    async fn join_room(&self, _room_id: RoomId, role: Role) -> Result<(), SessionError> {
        self.take_failure()?;
        let mut state = self.state.borrow_mut();
        if !state.has_room {
            return Err(SessionError::room_not_found());
        }
        let has_prior_activity =
            state.room.offer.is_some() || state.room.answer.is_some() || state.room.epoch > 0;
        if has_prior_activity {
            state.room.epoch += 1;
            state.room.offer = None;
            state.room.answer = None;
        }
        match role {
            Role::Caller => state.room.caller_uid = Some(webrtc_signal_proto::ParticipantId("caller".into())),
            Role::Callee => state.room.callee_uid = Some(webrtc_signal_proto::ParticipantId("callee".into())),
        }
        Ok(())
    }

    async fn get_room(&self) -> Result<Option<RoomRecord>, SessionError> {
        self.take_failure()?;
        let state = self.state.borrow();
        Ok(state.has_room.then(|| state.room.clone()))
    }

    async fn end_room(&self) -> Result<(), SessionError> {
        self.take_failure()?;
        let mut state = self.state.borrow_mut();
        *state = State::default();
        Ok(())
    }

    async fn set_offer(&self, offer: Offer) -> Result<(), SessionError> {
        self.take_failure()?;
        let mut state = self.state.borrow_mut();
        state.room.offer = Some(offer.clone());
        state
            .offer_subs
            .retain(|sub| sub.unbounded_send(offer.clone()).is_ok());
        Ok(())
    }

    async fn clear_offer(&self) -> Result<(), SessionError> {
        self.take_failure()?;
        self.state.borrow_mut().room.offer = None;
        Ok(())
    }

    async fn set_answer(&self, answer: Answer) -> Result<(), SessionError> {
        self.take_failure()?;
        let mut state = self.state.borrow_mut();
        state.room.answer = Some(answer.clone());
        state
            .answer_subs
            .retain(|sub| sub.unbounded_send(answer.clone()).is_ok());
        Ok(())
    }

    async fn clear_answer(&self) -> Result<(), SessionError> {
        self.take_failure()?;
        self.state.borrow_mut().room.answer = None;
        Ok(())
    }

    async fn add_caller_ice_candidate(&self, candidate: CandidateRecord) -> Result<(), SessionError> {
        self.take_failure()?;
        let mut state = self.state.borrow_mut();
        state.caller_candidates.push(candidate.clone());
        state
            .caller_candidate_subs
            .retain(|sub| sub.unbounded_send(candidate.clone()).is_ok());
        Ok(())
    }

    async fn add_callee_ice_candidate(&self, candidate: CandidateRecord) -> Result<(), SessionError> {
        self.take_failure()?;
        let mut state = self.state.borrow_mut();
        state.callee_candidates.push(candidate.clone());
        state
            .callee_candidate_subs
            .retain(|sub| sub.unbounded_send(candidate.clone()).is_ok());
        Ok(())
    }

    async fn clear_caller_candidates(&self) -> Result<(), SessionError> {
        self.take_failure()?;
        self.state.borrow_mut().caller_candidates.clear();
        Ok(())
    }

    async fn clear_callee_candidates(&self) -> Result<(), SessionError> {
        self.take_failure()?;
        self.state.borrow_mut().callee_candidates.clear();
        Ok(())
    }

    fn subscribe_on_offer(&self) -> futures::stream::LocalBoxStream<'static, Offer> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.borrow_mut();
        if let Some(offer) = state.room.offer.clone() {
            let _ = tx.unbounded_send(offer);
        }
        state.offer_subs.push(tx);
        Box::pin(rx)
    }

    fn subscribe_on_answer(&self) -> futures::stream::LocalBoxStream<'static, Answer> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.borrow_mut();
        if let Some(answer) = state.room.answer.clone() {
            let _ = tx.unbounded_send(answer);
        }
        state.answer_subs.push(tx);
        Box::pin(rx)
    }

    fn subscribe_on_caller_ice_candidate(&self) -> futures::stream::LocalBoxStream<'static, CandidateRecord> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.borrow_mut();
        for c in state.caller_candidates.clone() {
            let _ = tx.unbounded_send(c);
        }
        state.caller_candidate_subs.push(tx);
        Box::pin(rx)
    }

    fn subscribe_on_callee_ice_candidate(&self) -> futures::stream::LocalBoxStream<'static, CandidateRecord> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.borrow_mut();
        for c in state.callee_candidates.clone() {
            let _ = tx.unbounded_send(c);
        }
        state.callee_candidate_subs.push(tx);
        Box::pin(rx)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;

    use super::*;

    #[tokio::test]
    async fn create_then_join_round_trips_room_state() {
        let store = MemoryStore::new();
        let id = store.create_room().await.unwrap();
        store.join_room(id, Role::Caller).await.unwrap();
        let room = store.get_room().await.unwrap().unwrap();
        assert_eq!(room.epoch, 0);
    }

    #[tokio::test]
    async fn join_on_room_with_prior_activity_advances_epoch_and_clears_slots() {
        let store = MemoryStore::new();
        let id = store.create_room().await.unwrap();
        store.join_room(id.clone(), Role::Caller).await.unwrap();
        store.set_offer(Offer::new("v=0".into(), 0, None)).await.unwrap();

        store.join_room(id, Role::Callee).await.unwrap();
        let room = store.get_room().await.unwrap().unwrap();
        assert_eq!(room.epoch, 1);
        assert!(room.offer.is_none());
    }

    #[tokio::test]
    async fn subscribe_on_offer_replays_current_value() {
        let store = MemoryStore::new();
        store.set_offer(Offer::new("v=0".into(), 0, None)).await.unwrap();
        let mut sub = store.subscribe_on_offer();
        let first = sub.next().await.unwrap();
        assert_eq!(first.sdp, "v=0");
    }

    #[tokio::test]
    async fn fail_next_call_surfaces_db_unavailable_once() {
        let store = MemoryStore::new();
        store.fail_next_call();
        let err = store.create_room().await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::DbUnavailable);
        // the flag was consumed; the next call succeeds.
        store.create_room().await.unwrap();
    }

    #[tokio::test]
    async fn join_room_without_create_fails_room_not_found() {
        let store = MemoryStore::new();
        let err = store.join_room(RoomId("r".into()), Role::Caller).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::RoomNotFound);
    }
}
