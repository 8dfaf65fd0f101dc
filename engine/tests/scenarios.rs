//! End-to-end scenarios and boundary behaviors for [`Session`], driven
//! entirely through the in-memory [`MemoryStore`]/[`FakePeerFactory`] test
//! doubles. Every test pauses the tokio clock and advances it explicitly
//! rather than sleeping in real time, the same way `delay.rs`'s own unit
//! tests drive `resettable_delay_for`.

use std::{rc::Rc, time::Duration};

use futures::StreamExt as _;
use webrtc_session_engine::{
    config::ConnectionStrategy,
    error::ErrorKind,
    peer::{fake::FakePeerFactory, PeerConnection},
    session::{Phase, SelectedPath, WaitOpts},
    store::{memory::MemoryStore, SignalStore},
    EngineConfig, Session,
};
use webrtc_signal_proto::{Answer, CandidateRecord, Offer, Role};

async fn drain() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn lan_first_config(timeout: Duration) -> EngineConfig {
    EngineConfig {
        connection_strategy: ConnectionStrategy::LanFirst,
        lan_first_timeout: timeout,
        ..EngineConfig::default()
    }
}

fn default_strategy_config() -> EngineConfig {
    EngineConfig {
        connection_strategy: ConnectionStrategy::Default,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn lan_timeout_falls_back_to_stun() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store: Rc<dyn SignalStore> = Rc::new(MemoryStore::new());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(
                Role::Caller,
                Rc::clone(&store),
                Rc::clone(&factory) as _,
                lan_first_config(Duration::from_millis(20)),
            );

            let room_id = session.create_room().await.unwrap();
            session.join_room(room_id).await.unwrap();
            session.connect().await.unwrap();

            assert_eq!(factory.peers().len(), 1);
            assert!(factory.peers()[0].ice_servers().is_empty());

            tokio::time::advance(Duration::from_millis(25)).await;
            drain().await;

            let peers = factory.peers();
            assert_eq!(peers.len(), 2);
            assert_eq!(peers[1].ice_servers()[0].urls[0], "stun:stun.l.google.com:19302");
        })
        .await;
}

#[tokio::test]
async fn staying_in_lan_on_early_connect_keeps_one_peer() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store: Rc<dyn SignalStore> = Rc::new(MemoryStore::new());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(
                Role::Caller,
                Rc::clone(&store),
                Rc::clone(&factory) as _,
                lan_first_config(Duration::from_millis(20)),
            );

            let room_id = session.create_room().await.unwrap();
            session.join_room(room_id).await.unwrap();
            session.connect().await.unwrap();

            let peer = factory.latest();
            let channels = peer.channels();
            assert_eq!(channels.len(), 2);
            channels[0].open();
            channels[1].open();
            drain().await;

            peer.set_connection_state(webrtc_session_engine::peer::PeerConnectionState::Connected);
            drain().await;

            tokio::time::advance(Duration::from_millis(25)).await;
            drain().await;

            assert_eq!(factory.peers().len(), 1);
            let snapshot = session.inspect();
            assert_eq!(snapshot.phase, Phase::Connected);
            assert_eq!(snapshot.selected_path, Some(SelectedPath::Host));
        })
        .await;
}

#[tokio::test]
async fn stale_answer_is_rejected_by_for_pc_generation() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store: Rc<dyn SignalStore> = Rc::new(MemoryStore::new());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(
                Role::Caller,
                Rc::clone(&store),
                Rc::clone(&factory) as _,
                lan_first_config(Duration::from_millis(20)),
            );

            let room_id = session.create_room().await.unwrap();
            session.join_room(room_id).await.unwrap();
            session.connect().await.unwrap();

            tokio::time::advance(Duration::from_millis(25)).await;
            drain().await;
            assert_eq!(factory.peers().len(), 2, "expected a STUN rebuild before the answer exchange");

            let current_generation = session.inspect().pc_generation;
            factory.latest().emit_negotiation_needed();
            drain().await;
            assert_eq!(factory.latest().signaling_state(), webrtc_session_engine::peer::SignalingState::HaveLocalOffer);

            store
                .set_answer(Answer::new(
                    "v=0 answer-stale".into(),
                    0,
                    Some(current_generation),
                    Some(current_generation.wrapping_sub(1)),
                ))
                .await
                .unwrap();
            drain().await;
            assert!(factory.latest().remote_description().is_none());

            store
                .set_answer(Answer::new(
                    "v=0 answer-valid".into(),
                    0,
                    Some(current_generation),
                    Some(current_generation),
                ))
                .await
                .unwrap();
            drain().await;
            let (kind, sdp) = factory.latest().remote_description().unwrap();
            assert_eq!(kind, webrtc_signal_proto::SdpKind::Answer);
            assert_eq!(sdp, "v=0 answer-valid");
        })
        .await;
}

#[tokio::test]
async fn callee_rebuilds_to_catch_up_with_ahead_generation_offer() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store = MemoryStore::new();
            let engine_store: Rc<dyn SignalStore> = Rc::new(store.clone());
            let factory = Rc::new(FakePeerFactory::new());
            let room_id = store.create_room().await.unwrap();

            let session = Session::new(Role::Callee, engine_store, Rc::clone(&factory) as _, default_strategy_config());
            session.join_room(room_id).await.unwrap();
            session.connect().await.unwrap();
            assert_eq!(factory.peers().len(), 1);

            store.set_offer(Offer::new("v=0 S1".into(), 0, Some(2))).await.unwrap();
            drain().await;

            assert_eq!(factory.peers().len(), 2, "an ahead-generation offer must trigger a peer rebuild");
            let (kind, sdp) = factory.latest().remote_description().unwrap();
            assert_eq!(kind, webrtc_signal_proto::SdpKind::Offer);
            assert_eq!(sdp, "v=0 S1");
        })
        .await;
}

#[tokio::test]
async fn echoed_own_offer_is_never_applied_as_remote() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store: Rc<dyn SignalStore> = Rc::new(MemoryStore::new());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(Role::Caller, Rc::clone(&store), Rc::clone(&factory) as _, default_strategy_config());

            let room_id = session.create_room().await.unwrap();
            session.join_room(room_id).await.unwrap();
            session.connect().await.unwrap();

            factory.latest().emit_negotiation_needed();
            drain().await;

            assert!(factory.latest().local_description().is_some());
            assert!(factory.latest().remote_description().is_none());
        })
        .await;
}

#[tokio::test]
async fn remote_ice_is_buffered_until_remote_description_then_drained_in_order() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store = MemoryStore::new();
            let engine_store: Rc<dyn SignalStore> = Rc::new(store.clone());
            let factory = Rc::new(FakePeerFactory::new());
            let room_id = store.create_room().await.unwrap();

            let session = Session::new(Role::Callee, engine_store, Rc::clone(&factory) as _, default_strategy_config());
            session.join_room(room_id).await.unwrap();
            session.connect().await.unwrap();

            for i in 0..3u16 {
                store
                    .add_caller_ice_candidate(CandidateRecord::new(
                        format!("candidate:{i} 1 UDP 2122260223 10.0.0.{i} 5000{i} typ host"),
                        Some("0".into()),
                        Some(0),
                        None,
                        0,
                        0,
                    ))
                    .await
                    .unwrap();
            }
            drain().await;
            assert!(factory.latest().added_ice_candidates().is_empty());

            store.set_offer(Offer::new("v=0 offer".into(), 0, Some(0))).await.unwrap();
            drain().await;

            let added = factory.latest().added_ice_candidates();
            assert_eq!(added.len(), 3);
            for (i, candidate) in added.iter().enumerate() {
                assert!(candidate.candidate.contains(&format!("10.0.0.{i}")));
            }
        })
        .await;
}

#[tokio::test]
async fn connect_is_idempotent() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store: Rc<dyn SignalStore> = Rc::new(MemoryStore::new());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(Role::Caller, Rc::clone(&store), Rc::clone(&factory) as _, default_strategy_config());

            let room_id = session.create_room().await.unwrap();
            session.join_room(room_id.clone()).await.unwrap();
            session.join_room(room_id).await.unwrap();
            session.connect().await.unwrap();
            assert_eq!(factory.peers().len(), 1);

            session.connect().await.unwrap();
            assert_eq!(factory.peers().len(), 1, "connect must be a no-op once a peer exists");
        })
        .await;
}

#[tokio::test]
async fn hangup_is_safe_to_call_twice() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store: Rc<dyn SignalStore> = Rc::new(MemoryStore::new());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(Role::Caller, Rc::clone(&store), Rc::clone(&factory) as _, default_strategy_config());

            let room_id = session.create_room().await.unwrap();
            session.join_room(room_id).await.unwrap();
            session.connect().await.unwrap();

            session.hangup().await;
            session.hangup().await;

            assert!(factory.latest().is_closed());
            assert_eq!(session.inspect().phase, Phase::Idle);
        })
        .await;
}

#[tokio::test]
async fn wait_ready_times_out_when_nothing_ever_connects() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store: Rc<dyn SignalStore> = Rc::new(MemoryStore::new());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(Role::Caller, Rc::clone(&store), Rc::clone(&factory) as _, default_strategy_config());

            let handle = tokio::task::spawn_local({
                let session = session.clone();
                async move {
                    session
                        .wait_ready(WaitOpts {
                            timeout: Some(Duration::from_millis(1)),
                        })
                        .await
                }
            });
            drain().await;
            tokio::time::advance(Duration::from_millis(5)).await;
            drain().await;
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.kind, ErrorKind::WaitReadyTimeout);
        })
        .await;
}

#[tokio::test]
async fn connect_without_a_room_in_the_store_fails_room_not_found() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store = MemoryStore::new();
            let engine_store: Rc<dyn SignalStore> = Rc::new(store.clone());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(Role::Caller, engine_store, Rc::clone(&factory) as _, default_strategy_config());

            let room_id = session.create_room().await.unwrap();
            session.join_room(room_id).await.unwrap();
            store.end_room().await.unwrap();

            let err = session.connect().await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::RoomNotFound);
        })
        .await;
}

#[tokio::test]
async fn create_room_surfaces_transient_store_failure() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store = MemoryStore::new();
            let engine_store: Rc<dyn SignalStore> = Rc::new(store.clone());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(Role::Caller, engine_store, Rc::clone(&factory) as _, default_strategy_config());

            store.fail_next_call();
            let err = session.create_room().await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::DbUnavailable);

            session.create_room().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn send_before_open_is_queued_then_flushed_on_open() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store: Rc<dyn SignalStore> = Rc::new(MemoryStore::new());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(Role::Caller, Rc::clone(&store), Rc::clone(&factory) as _, default_strategy_config());

            let room_id = session.create_room().await.unwrap();
            session.join_room(room_id).await.unwrap();
            session.connect().await.unwrap();

            let send = tokio::task::spawn_local({
                let session = session.clone();
                async move { session.send_fast("hello").await }
            });
            drain().await;

            let fast = factory.latest().channels()[0].clone();
            assert!(fast.sent_messages().is_empty());
            fast.open();
            drain().await;

            send.await.unwrap();
            assert_eq!(fast.sent_messages(), vec!["hello".to_owned()]);
        })
        .await;
}

#[tokio::test]
async fn send_over_backpressure_threshold_waits_for_low_signal() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store: Rc<dyn SignalStore> = Rc::new(MemoryStore::new());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(Role::Caller, Rc::clone(&store), Rc::clone(&factory) as _, default_strategy_config());

            let room_id = session.create_room().await.unwrap();
            session.join_room(room_id).await.unwrap();
            session.connect().await.unwrap();

            let reliable = factory.latest().channels()[1].clone();
            reliable.open();
            reliable.set_buffered_amount(1_000_000);
            drain().await;

            let send = tokio::task::spawn_local({
                let session = session.clone();
                async move { session.send_reliable("big-payload").await }
            });
            drain().await;
            assert!(reliable.sent_messages().is_empty(), "send must wait for bufferedAmountLow");

            reliable.fire_buffered_amount_low();
            drain().await;

            send.await.unwrap();
            assert_eq!(reliable.sent_messages(), vec!["big-payload".to_owned()]);
        })
        .await;
}

#[tokio::test]
async fn hard_reconnect_builds_a_new_peer_and_closes_the_old_one() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store: Rc<dyn SignalStore> = Rc::new(MemoryStore::new());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(Role::Caller, Rc::clone(&store), Rc::clone(&factory) as _, default_strategy_config());

            let room_id = session.create_room().await.unwrap();
            session.join_room(room_id).await.unwrap();
            session.connect().await.unwrap();
            let old_peer = factory.latest();
            let old_generation = session.inspect().pc_generation;

            let reconnect = tokio::task::spawn_local({
                let session = session.clone();
                async move {
                    session
                        .reconnect_hard(WaitOpts {
                            timeout: Some(Duration::from_millis(5)),
                        })
                        .await
                }
            });
            drain().await;
            tokio::time::advance(Duration::from_millis(10)).await;
            drain().await;
            let result = reconnect.await.unwrap();
            assert_eq!(result.unwrap_err().kind, ErrorKind::WaitReadyTimeout);

            assert!(old_peer.is_closed());
            assert_eq!(factory.peers().len(), 2);
            assert!(session.inspect().pc_generation > old_generation);

            old_peer.set_connection_state(webrtc_session_engine::peer::PeerConnectionState::Connected);
            drain().await;
            assert_ne!(session.inspect().phase, Phase::Connected, "events from a superseded generation must be ignored");
        })
        .await;
}

#[tokio::test]
async fn ice_candidate_round_trips_through_the_store_unchanged() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store = MemoryStore::new();
            store.create_room().await.unwrap();

            let sent = CandidateRecord::new(
                "candidate:1 1 UDP 2122260223 10.0.0.5 54321 typ host".into(),
                Some("0".into()),
                Some(0),
                Some("uf".into()),
                0,
                0,
            );
            store.add_caller_ice_candidate(sent.clone()).await.unwrap();

            let mut candidates = store.subscribe_on_caller_ice_candidate();
            let received = candidates.next().await.unwrap();
            assert_eq!(received.candidate, sent.candidate);
            assert_eq!(received.sdp_mid, sent.sdp_mid);
            assert_eq!(received.sdp_m_line_index, sent.sdp_m_line_index);
        })
        .await;
}

#[tokio::test]
async fn signaling_epoch_and_pc_generation_never_decrease_across_a_reconnect() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store = MemoryStore::new();
            let engine_store: Rc<dyn SignalStore> = Rc::new(store.clone());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(
                Role::Caller,
                engine_store,
                Rc::clone(&factory) as _,
                lan_first_config(Duration::from_millis(20)),
            );

            let room_id = session.create_room().await.unwrap();
            session.join_room(room_id).await.unwrap();
            session.connect().await.unwrap();

            let mut last_epoch = session.inspect().signaling_epoch;
            let mut last_generation = session.inspect().pc_generation;

            // LAN timeout forces a STUN rebuild, bumping `pc_generation`.
            tokio::time::advance(Duration::from_millis(25)).await;
            drain().await;
            let snapshot = session.inspect();
            assert!(snapshot.signaling_epoch >= last_epoch);
            assert!(snapshot.pc_generation >= last_generation);
            last_epoch = snapshot.signaling_epoch;
            last_generation = snapshot.pc_generation;

            // A higher-epoch offer from the store advances `signalingEpoch`
            // on arrival; it never moves backwards afterward.
            store
                .set_offer(Offer::new("v=0 offer-from-other-side".into(), last_epoch + 1, None))
                .await
                .unwrap();
            drain().await;
            let snapshot = session.inspect();
            assert!(snapshot.signaling_epoch >= last_epoch);
            assert!(snapshot.pc_generation >= last_generation);
        })
        .await;
}

#[tokio::test]
async fn wait_ready_rechecks_live_state_after_a_channel_closes() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store: Rc<dyn SignalStore> = Rc::new(MemoryStore::new());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(Role::Caller, Rc::clone(&store), Rc::clone(&factory) as _, default_strategy_config());

            let room_id = session.create_room().await.unwrap();
            session.join_room(room_id).await.unwrap();
            session.connect().await.unwrap();

            let peer = factory.latest();
            let channels = peer.channels();
            channels[0].open();
            channels[1].open();
            drain().await;
            peer.set_connection_state(webrtc_session_engine::peer::PeerConnectionState::Connected);
            drain().await;
            assert_eq!(session.inspect().phase, Phase::Connected);

            // The fast channel drops on its own; the peer connection itself
            // stays healthy, so no recovery watchdog fires. `phase` must no
            // longer read as `Connected` once a channel is gone, or a fresh
            // `wait_ready` would resolve immediately against stale state.
            channels[0].close_from_remote();
            drain().await;
            assert_ne!(session.inspect().phase, Phase::Connected);

            let handle = tokio::task::spawn_local({
                let session = session.clone();
                async move {
                    session
                        .wait_ready(WaitOpts {
                            timeout: Some(Duration::from_millis(1)),
                        })
                        .await
                }
            });
            drain().await;
            tokio::time::advance(Duration::from_millis(5)).await;
            drain().await;
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.kind, ErrorKind::WaitReadyTimeout);
        })
        .await;
}

#[tokio::test]
async fn on_debug_fires_when_phase_and_generation_change() {
    tokio::time::pause();
    tokio::task::LocalSet::new()
        .run_until(async {
            let store: Rc<dyn SignalStore> = Rc::new(MemoryStore::new());
            let factory = Rc::new(FakePeerFactory::new());
            let session = Session::new(
                Role::Caller,
                Rc::clone(&store),
                Rc::clone(&factory) as _,
                lan_first_config(Duration::from_millis(20)),
            );

            let snapshots: Rc<std::cell::RefCell<Vec<Phase>>> = Rc::default();
            let recorded = Rc::clone(&snapshots);
            session.on_debug(move |snapshot| recorded.borrow_mut().push(snapshot.phase));

            let room_id = session.create_room().await.unwrap();
            session.join_room(room_id).await.unwrap();
            session.connect().await.unwrap();
            drain().await;

            tokio::time::advance(Duration::from_millis(25)).await;
            drain().await;

            let seen = snapshots.borrow();
            assert!(seen.contains(&Phase::Negotiating), "connect() should push a snapshot");
            assert_eq!(factory.peers().len(), 2, "LAN timeout should have rebuilt onto STUN");
        })
        .await;
}
