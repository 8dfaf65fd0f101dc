//! Wire and storage types shared between the signal store and the session
//! engine: room/candidate records, SDP envelopes, and ICE server config.

use std::time::SystemTime;

use derive_more::{Constructor, Display, From};
use serde::{Deserialize, Serialize};

/// Which side of the session a participant plays.
///
/// The caller creates the initial offer; the callee is the glare-polite
/// side.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[display(fmt = "caller")]
    Caller,
    #[display(fmt = "callee")]
    Callee,
}

impl Role {
    /// Caller is impolite, callee is polite in perfect-negotiation glare
    /// resolution.
    #[must_use]
    pub fn is_polite(self) -> bool {
        matches!(self, Self::Callee)
    }
}

/// Opaque identifier of a room, handed out by the signal store.
#[derive(Clone, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

/// Opaque identifier of a participant (caller or callee).
#[derive(Clone, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

/// Local description type, mirroring `RTCSdpType` restricted to the two
/// kinds this engine ever creates.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    #[display(fmt = "offer")]
    Offer,
    #[display(fmt = "answer")]
    Answer,
}

/// An offer slot as stored in the room record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Constructor)]
pub struct Offer {
    pub sdp: String,
    pub epoch: u64,
    pub pc_generation: Option<u64>,
}

/// An answer slot as stored in the room record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Constructor)]
pub struct Answer {
    pub sdp: String,
    pub epoch: u64,
    pub pc_generation: Option<u64>,
    /// Must match the caller's current `pcGeneration` for the answer to be
    /// consumed.
    pub for_pc_generation: Option<u64>,
}

/// One ICE candidate entry in a caller/callee sub-collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
    pub username_fragment: Option<String>,
    pub epoch: u64,
    pub pc_generation: u64,
    #[serde(skip, default = "SystemTime::now")]
    pub created_at: SystemTime,
}

impl CandidateRecord {
    /// Builds a record stamped with the current time; `created_at` is
    /// local bookkeeping only, never read off the wire.
    #[must_use]
    pub fn new(
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
        username_fragment: Option<String>,
        epoch: u64,
        pc_generation: u64,
    ) -> Self {
        Self {
            candidate,
            sdp_mid,
            sdp_m_line_index,
            username_fragment,
            epoch,
            pc_generation,
            created_at: SystemTime::now(),
        }
    }

    /// Identity used for dedup by both the store and the signal stream
    /// layer: `(epoch, candidate, sdpMid, sdpMLineIndex)`.
    #[must_use]
    pub fn identity(&self) -> (u64, &str, Option<&str>, Option<u16>) {
        (
            self.epoch,
            self.candidate.as_str(),
            self.sdp_mid.as_deref(),
            self.sdp_m_line_index,
        )
    }
}

/// The room document the store owns and the engine observes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub caller_uid: Option<ParticipantId>,
    pub callee_uid: Option<ParticipantId>,
    pub offer: Option<Offer>,
    pub answer: Option<Answer>,
    /// Monotonically non-decreasing; advanced by the store on re-attach with
    /// evidence of prior activity.
    pub epoch: u64,
    #[serde(skip)]
    pub created_at: Option<SystemTime>,
    #[serde(skip)]
    pub updated_at: Option<SystemTime>,
    #[serde(skip)]
    pub expires_at: Option<SystemTime>,
}

/// One entry of a host-provided ICE server list (STUN/TURN).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Constructor)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Peer connection configuration for the current ICE phase.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
}

/// ICE candidate payload in the shape the host's peer connection and the
/// signal store both exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Constructor, From)]
pub struct IceCandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl From<CandidateRecord> for IceCandidateInit {
    fn from(rec: CandidateRecord) -> Self {
        Self {
            candidate: rec.candidate,
            sdp_mid: rec.sdp_mid,
            sdp_m_line_index: rec.sdp_m_line_index,
            username_fragment: rec.username_fragment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_politeness() {
        assert!(!Role::Caller.is_polite());
        assert!(Role::Callee.is_polite());
    }

    #[test]
    fn candidate_identity_ignores_username_fragment_and_timestamp() {
        let a = CandidateRecord::new(
            "candidate:1 1 UDP 2122260223 10.0.0.1 54321 typ host".into(),
            Some("0".into()),
            Some(0),
            Some("uf1".into()),
            3,
            1,
        );
        let mut b = a.clone();
        b.username_fragment = Some("uf2".into());
        b.created_at = SystemTime::now();
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn room_record_round_trips_through_json() {
        let mut room = RoomRecord {
            caller_uid: Some(ParticipantId("caller-1".into())),
            ..RoomRecord::default()
        };
        room.offer = Some(Offer::new("v=0".into(), 0, Some(1)));
        let json = serde_json::to_string(&room).unwrap();
        let back: RoomRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(room.caller_uid, back.caller_uid);
        assert_eq!(room.offer, back.offer);
    }

    #[test]
    fn answer_for_pc_generation_survives_json_round_trip() {
        let answer = Answer::new("v=0".into(), 4, Some(2), Some(2));
        let json = serde_json::to_string(&answer).unwrap();
        let back: Answer = serde_json::from_str(&json).unwrap();
        assert_eq!(answer, back);
    }
}
