//! Engine construction options; every key named in the component design has
//! a field here with the documented default.

use std::time::Duration;

use webrtc_signal_proto::IceServer;

/// ICE acquisition strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStrategy {
    /// Try host-only candidates first; fall back to STUN on timeout.
    LanFirst,
    /// Gather with the configured (or default) STUN/TURN servers from the
    /// start.
    Default,
}

impl Default for ConnectionStrategy {
    fn default() -> Self {
        Self::LanFirst
    }
}

/// Data channel construction options (ordering and retransmission policy).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChannelInit {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl ChannelInit {
    /// Default `fast` channel: unordered, zero retransmits.
    #[must_use]
    pub fn fast_default() -> Self {
        Self {
            ordered: false,
            max_retransmits: Some(0),
        }
    }

    /// Default `reliable` channel: ordered, unlimited retransmits.
    #[must_use]
    pub fn reliable_default() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
        }
    }
}

/// Recognized construction options for [`Session`](crate::session::Session).
/// Unknown options have no field to set, matching the source's "unknown
/// options are ignored" contract via the type system.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub connection_strategy: ConnectionStrategy,
    pub lan_first_timeout: Duration,
    pub stun_servers: Vec<IceServer>,
    pub fast_label: String,
    pub reliable_label: String,
    pub fast_init: ChannelInit,
    pub reliable_init: ChannelInit,
    pub fast_buffered_amount_low_threshold: u64,
    pub reliable_buffered_amount_low_threshold: u64,
    pub wait_ready_timeout: Duration,
    pub debug: bool,
}

/// Public STUN server used when STUN phase is entered without an explicit
/// override.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection_strategy: ConnectionStrategy::default(),
            lan_first_timeout: Duration::from_millis(1800),
            stun_servers: Vec::new(),
            fast_label: "fast".to_owned(),
            reliable_label: "reliable".to_owned(),
            fast_init: ChannelInit::fast_default(),
            reliable_init: ChannelInit::reliable_default(),
            fast_buffered_amount_low_threshold: 64 * 1024,
            reliable_buffered_amount_low_threshold: 256 * 1024,
            wait_ready_timeout: Duration::from_millis(15_000),
            debug: cfg!(test),
        }
    }
}

impl EngineConfig {
    /// Servers to use while gathering in STUN phase: the configured
    /// override, or the default public STUN if none was given.
    #[must_use]
    pub fn effective_stun_servers(&self) -> Vec<IceServer> {
        if self.stun_servers.is_empty() {
            vec![IceServer::new(vec![DEFAULT_STUN_URL.to_owned()], None, None)]
        } else {
            self.stun_servers.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_component_design() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.connection_strategy, ConnectionStrategy::LanFirst);
        assert_eq!(cfg.lan_first_timeout, Duration::from_millis(1800));
        assert_eq!(cfg.fast_label, "fast");
        assert_eq!(cfg.reliable_label, "reliable");
        assert!(!cfg.fast_init.ordered);
        assert_eq!(cfg.fast_init.max_retransmits, Some(0));
        assert!(cfg.reliable_init.ordered);
        assert_eq!(cfg.reliable_init.max_retransmits, None);
        assert_eq!(cfg.fast_buffered_amount_low_threshold, 65536);
        assert_eq!(cfg.reliable_buffered_amount_low_threshold, 262_144);
        assert_eq!(cfg.wait_ready_timeout, Duration::from_millis(15_000));
    }

    #[test]
    fn falls_back_to_default_public_stun() {
        let cfg = EngineConfig::default();
        let servers = cfg.effective_stun_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec![DEFAULT_STUN_URL.to_owned()]);
    }

    #[test]
    fn honors_configured_stun_override() {
        let mut cfg = EngineConfig::default();
        cfg.stun_servers = vec![IceServer::new(vec!["stun:example.com:3478".into()], None, None)];
        let servers = cfg.effective_stun_servers();
        assert_eq!(servers, cfg.stun_servers);
    }
}
