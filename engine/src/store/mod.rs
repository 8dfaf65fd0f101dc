//! Signal store abstraction (§4.1): the CRUD-like backend the engine
//! consumes but never implements. Subscriptions are plain [`Stream`]s —
//! dropping the stream is the unsubscribe.

pub mod memory;

use async_trait::async_trait;
use futures::stream::LocalBoxStream;
use webrtc_signal_proto::{Answer, CandidateRecord, Offer, RoomId, RoomRecord, Role};

use crate::error::SessionError;

/// External signaling backend contract. All operations may fail with
/// [`ErrorKind::DbUnavailable`](crate::error::ErrorKind::DbUnavailable).
#[async_trait(?Send)]
pub trait SignalStore {
    async fn create_room(&self) -> Result<RoomId, SessionError>;
    async fn join_room(&self, room_id: RoomId, role: Role) -> Result<(), SessionError>;
    async fn get_room(&self) -> Result<Option<RoomRecord>, SessionError>;
    async fn end_room(&self) -> Result<(), SessionError>;

    async fn set_offer(&self, offer: Offer) -> Result<(), SessionError>;
    async fn clear_offer(&self) -> Result<(), SessionError>;
    async fn set_answer(&self, answer: Answer) -> Result<(), SessionError>;
    async fn clear_answer(&self) -> Result<(), SessionError>;

    async fn add_caller_ice_candidate(&self, candidate: CandidateRecord) -> Result<(), SessionError>;
    async fn add_callee_ice_candidate(&self, candidate: CandidateRecord) -> Result<(), SessionError>;
    async fn clear_caller_candidates(&self) -> Result<(), SessionError>;
    async fn clear_callee_candidates(&self) -> Result<(), SessionError>;

    fn subscribe_on_offer(&self) -> LocalBoxStream<'static, Offer>;
    fn subscribe_on_answer(&self) -> LocalBoxStream<'static, Answer>;
    fn subscribe_on_caller_ice_candidate(&self) -> LocalBoxStream<'static, CandidateRecord>;
    fn subscribe_on_callee_ice_candidate(&self) -> LocalBoxStream<'static, CandidateRecord>;
}
