//! ICE candidate classification and the LAN/STUN gathering strategy.

use webrtc_signal_proto::PeerConfig;

use crate::config::EngineConfig;

/// Candidate family, parsed out of the `typ <token>` component of an ICE
/// candidate line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CandidateType {
    Host,
    Srflx,
    Relay,
    Unknown,
}

impl CandidateType {
    /// All variants, in the priority order [`infer_selected_path`] checks
    /// them.
    pub const PRIORITY: [Self; 3] = [Self::Srflx, Self::Relay, Self::Host];
}

impl std::fmt::Display for CandidateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Host => "host",
            Self::Srflx => "srflx",
            Self::Relay => "relay",
            Self::Unknown => "unknown",
        })
    }
}

/// Gathering phase: host-only candidates, or full STUN/TURN gathering.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum IcePhase {
    Lan,
    Stun,
}

/// Parses the `typ <token>` component of a raw ICE candidate line.
#[must_use]
pub fn classify(candidate_line: &str) -> CandidateType {
    let mut tokens = candidate_line.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok == "typ" {
            return match tokens.next() {
                Some("host") => CandidateType::Host,
                Some("srflx") => CandidateType::Srflx,
                Some("relay") => CandidateType::Relay,
                _ => CandidateType::Unknown,
            };
        }
    }
    CandidateType::Unknown
}

/// Whether a locally-gathered candidate should be published to the store
/// given the current ICE phase.
#[must_use]
pub fn should_send(phase: IcePhase, candidate_line: &str) -> bool {
    phase != IcePhase::Lan || classify(candidate_line) == CandidateType::Host
}

/// Whether a remote candidate should be accepted given the current ICE
/// phase.
#[must_use]
pub fn should_accept(phase: IcePhase, candidate_line: &str) -> bool {
    phase != IcePhase::Lan || classify(candidate_line) == CandidateType::Host
}

/// Peer connection configuration for the given phase: no ICE servers in LAN
/// phase, the configured (or default) STUN/TURN list in STUN phase.
#[must_use]
pub fn peer_config_for(phase: IcePhase, config: &EngineConfig) -> PeerConfig {
    match phase {
        IcePhase::Lan => PeerConfig { ice_servers: Vec::new() },
        IcePhase::Stun => PeerConfig {
            ice_servers: config.effective_stun_servers(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_host_srflx_relay_and_unknown() {
        assert_eq!(
            classify("candidate:1 1 UDP 2122260223 10.0.0.5 54321 typ host"),
            CandidateType::Host
        );
        assert_eq!(
            classify("candidate:2 1 UDP 1686052607 203.0.113.9 60001 typ srflx raddr 10.0.0.5 rport 54321"),
            CandidateType::Srflx
        );
        assert_eq!(
            classify("candidate:3 1 UDP 41820159 198.51.100.2 3478 typ relay raddr 0.0.0.0 rport 0"),
            CandidateType::Relay
        );
        assert_eq!(classify("garbage, no typ token here"), CandidateType::Unknown);
    }

    #[test]
    fn lan_phase_only_allows_host_candidates() {
        let host = "candidate:1 1 UDP 2122260223 10.0.0.5 54321 typ host";
        let srflx = "candidate:2 1 UDP 1686052607 203.0.113.9 60001 typ srflx";
        assert!(should_send(IcePhase::Lan, host));
        assert!(!should_send(IcePhase::Lan, srflx));
        assert!(should_accept(IcePhase::Lan, host));
        assert!(!should_accept(IcePhase::Lan, srflx));
    }

    #[test]
    fn stun_phase_allows_every_candidate_type() {
        let srflx = "candidate:2 1 UDP 1686052607 203.0.113.9 60001 typ srflx";
        let relay = "candidate:3 1 UDP 41820159 198.51.100.2 3478 typ relay";
        assert!(should_send(IcePhase::Stun, srflx));
        assert!(should_send(IcePhase::Stun, relay));
        assert!(should_accept(IcePhase::Stun, relay));
    }

    #[test]
    fn lan_config_has_no_ice_servers() {
        let cfg = EngineConfig::default();
        let pc = peer_config_for(IcePhase::Lan, &cfg);
        assert!(pc.ice_servers.is_empty());
    }

    #[test]
    fn stun_config_falls_back_to_default_public_stun() {
        let cfg = EngineConfig::default();
        let pc = peer_config_for(IcePhase::Stun, &cfg);
        assert_eq!(pc.ice_servers.len(), 1);
        assert_eq!(pc.ice_servers[0].urls[0], crate::config::DEFAULT_STUN_URL);
    }
}
