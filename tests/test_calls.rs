mod common;

use common::*;
use siphub::edge::EdgeEvent;
use siphub::message::CallState;
use siphub::EdgeClient;
use siphub::Hub;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::{sleep, timeout};

async fn sip_ready(hub: &Hub, edge: &EdgeClient) {
    edge.initialize_sip(test_sip_config()).await.unwrap();
    edge.connect_sip().await.unwrap();
    edge.register_sip().await.unwrap();
    let _ = hub;
}

#[tokio::test]
async fn test_outgoing_call_offer_answer_flow() {
    let (stack, hub) = new_hub();
    let (pc_factory, edge) = ready_edge(&hub).await;
    let mut events = edge.subscribe();
    sip_ready(&hub, &edge).await;

    let call_id = edge
        .make_call("sip:bob@example.org", None)
        .await
        .unwrap();

    // The whole offer path ran on this edge's peer connection: microphone,
    // createOffer, setLocalDescription.
    let pc = pc_factory.last_pc();
    assert!(pc.microphone.load(Ordering::SeqCst));
    // The default STUN server was synthesized and shipped with the offer.
    assert_eq!(pc.ice_servers, 1);
    let local = pc.local.lock().unwrap().clone().unwrap();
    assert_eq!(local.kind, "offer");
    assert_eq!(local.sdp, OFFER_SDP);

    // The stack saw the same body the edge produced.
    let session = stack.last_ua().last_session();
    assert_eq!(session.local_body().unwrap(), OFFER_SDP);

    let creating = next_event(&mut events, |event| match event {
        EdgeEvent::CallUpdate(update) => Some(update.clone()),
        _ => None,
    })
    .await;
    assert_eq!(creating.call_id, call_id);
    assert_eq!(creating.state, CallState::Creating);
    let calling = next_event(&mut events, |event| match event {
        EdgeEvent::CallUpdate(update) => Some(update.state),
        _ => None,
    })
    .await;
    assert_eq!(calling, CallState::Calling);

    // Remote answers: the answer SDP must land on this peer connection.
    session.answer(ANSWER_SDP).await.unwrap();
    let connected = next_event(&mut events, |event| match event {
        EdgeEvent::CallUpdate(update) if update.state == CallState::Connected => Some(()),
        _ => None,
    })
    .await;
    let _ = connected;
    let remote = pc.remote.lock().unwrap().clone().unwrap();
    assert_eq!(remote.sdp, ANSWER_SDP);
    assert!(hub.sip().snapshot().await.has_active_call);

    // Hang up from the page; the record ends and resources unwind.
    edge.hangup_call(&call_id).await.unwrap();
    let ended = next_event(&mut events, |event| match event {
        EdgeEvent::CallUpdate(update) if update.state == CallState::Ended => {
            Some(update.clone())
        }
        _ => None,
    })
    .await;
    assert_eq!(ended.end_reason.as_deref(), Some("bye"));
    assert!(!hub.sip().snapshot().await.has_active_call);

    let closed = async {
        while !pc.closed.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(5)).await;
        }
    };
    timeout(Duration::from_secs(1), closed).await.unwrap();
    assert_eq!(hub.bridge().session_count(), 0);
}

#[tokio::test]
async fn test_call_updates_are_monotonic() {
    let (stack, hub) = new_hub();
    let (_pc_factory, edge) = ready_edge(&hub).await;
    let mut events = edge.subscribe();
    sip_ready(&hub, &edge).await;

    let _call_id = edge.make_call("bob", None).await.unwrap();
    let session = stack.last_ua().last_session();
    session.answer(ANSWER_SDP).await.unwrap();
    // A stale "calling" after establishment must not regress the record.
    session.emit(siphub::sip::stack::SessionState::Calling);
    session.hangup_remote("remote bye");

    let mut ranks = Vec::new();
    let done = next_event(&mut events, |event| match event {
        EdgeEvent::CallUpdate(update) => {
            ranks.push(update.state.rank());
            (update.state == CallState::Ended).then_some(())
        }
        _ => None,
    })
    .await;
    let _ = done;
    let mut sorted = ranks.clone();
    sorted.sort_unstable();
    assert_eq!(ranks, sorted, "call updates regressed: {:?}", ranks);
}

#[tokio::test]
async fn test_make_call_requires_connected_phase() {
    let (_stack, hub) = new_hub();
    let (_pc_factory, edge) = ready_edge(&hub).await;

    let err = edge.make_call("sip:bob@example.org", None).await.unwrap_err();
    assert!(err.to_string().contains("invalid state"), "got: {}", err);
}

#[tokio::test]
async fn test_second_concurrent_call_rejected() {
    let (stack, hub) = new_hub();
    let (_pc_factory, edge) = ready_edge(&hub).await;
    sip_ready(&hub, &edge).await;

    let _first = edge.make_call("bob", None).await.unwrap();
    let err = edge.make_call("carol", None).await.unwrap_err();
    assert!(err.to_string().contains("another call is active"));
    let _ = stack;
}

#[tokio::test]
async fn test_incoming_call_first_claim_wins() {
    let (stack, hub) = new_hub();
    let (pc1, edge1) = ready_edge(&hub).await;
    let (pc2, edge2) = ready_edge(&hub).await;
    let mut events1 = edge1.subscribe();
    let mut events2 = edge2.subscribe();
    sip_ready(&hub, &edge1).await;

    stack.last_ua().push_incoming("sip:carol@example.org", OFFER_SDP);

    let incoming1 = next_event(&mut events1, |event| match event {
        EdgeEvent::IncomingCall(payload) => Some(payload.clone()),
        _ => None,
    })
    .await;
    let incoming2 = next_event(&mut events2, |event| match event {
        EdgeEvent::IncomingCall(payload) => Some(payload.clone()),
        _ => None,
    })
    .await;
    assert_eq!(incoming1.call_id, incoming2.call_id);
    assert_eq!(incoming1.from, "sip:carol@example.org");

    // Second tab claims first; the other edge loses.
    edge2.answer_call(&incoming2.call_id, None).await.unwrap();
    let err = edge1
        .answer_call(&incoming1.call_id, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already claimed"));

    let claimed = next_event(&mut events1, |event| match event {
        EdgeEvent::CallClaimed(payload) => Some(payload.clone()),
        _ => None,
    })
    .await;
    assert_eq!(claimed.call_id, incoming1.call_id);
    assert_eq!(claimed.client_id, edge2.client_id());

    // Media landed on the claiming edge only.
    let connected = next_event(&mut events2, |event| match event {
        EdgeEvent::CallUpdate(update) if update.state == CallState::Connected => Some(()),
        _ => None,
    })
    .await;
    let _ = connected;
    let pc = pc2.last_pc();
    assert_eq!(pc.remote.lock().unwrap().clone().unwrap().sdp, OFFER_SDP);
    assert_eq!(
        pc.local.lock().unwrap().clone().unwrap().kind,
        "answer".to_string()
    );
    assert_eq!(pc1.pc_count(), 0);
}

#[tokio::test]
async fn test_incoming_record_rejects_outgoing_states() {
    let (stack, hub) = new_hub();
    let (_pc, edge) = ready_edge(&hub).await;
    let mut events = edge.subscribe();
    sip_ready(&hub, &edge).await;

    let session = stack
        .last_ua()
        .push_incoming("sip:carol@example.org", OFFER_SDP);
    let incoming = next_event(&mut events, |event| match event {
        EdgeEvent::IncomingCall(payload) => Some(payload.clone()),
        _ => None,
    })
    .await;

    // A stack reporting "calling" on an incoming session must not drag the
    // record onto the outgoing trajectory.
    session.emit(siphub::sip::stack::SessionState::Calling);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let snapshot = hub.sip().snapshot().await;
    assert_eq!(
        snapshot.active_call.as_ref().unwrap().state,
        CallState::Incoming
    );

    edge.answer_call(&incoming.call_id, None).await.unwrap();
    let mut seen = Vec::new();
    let done = next_event(&mut events, |event| match event {
        EdgeEvent::CallUpdate(update) => {
            seen.push(update.state);
            (update.state == CallState::Connected).then_some(())
        }
        _ => None,
    })
    .await;
    let _ = done;
    assert!(!seen.contains(&CallState::Calling), "saw: {:?}", seen);
    assert_eq!(seen.first(), Some(&CallState::Connecting));
}

#[tokio::test]
async fn test_dtmf_rides_the_call_session() {
    let (stack, hub) = new_hub();
    let (pc_factory, edge) = ready_edge(&hub).await;
    sip_ready(&hub, &edge).await;

    let call_id = edge.make_call("bob", None).await.unwrap();
    stack
        .last_ua()
        .last_session()
        .answer(ANSWER_SDP)
        .await
        .unwrap();

    edge.send_dtmf(&call_id, "1#").await.unwrap();
    let pc = pc_factory.last_pc();
    let delivered = async {
        while pc.dtmf.lock().unwrap().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    };
    timeout(Duration::from_secs(1), delivered).await.unwrap();
    assert_eq!(
        pc.dtmf.lock().unwrap().clone(),
        vec![("1#".to_string(), 100, 70)]
    );
}

#[tokio::test]
async fn test_media_failure_fails_the_call() {
    let (_stack, hub) = new_hub();
    let (pc_factory, edge) = ready_edge(&hub).await;
    let mut events = edge.subscribe();
    pc_factory.fail_media.store(true, Ordering::SeqCst);
    sip_ready(&hub, &edge).await;

    let err = edge.make_call("bob", None).await.unwrap_err();
    assert!(
        err.to_string().contains("getUserMedia denied"),
        "got: {}",
        err
    );
    let call_error = next_event(&mut events, |event| match event {
        EdgeEvent::CallError(payload) => Some(payload.clone()),
        _ => None,
    })
    .await;
    assert!(call_error.error.contains("getUserMedia denied"));
    assert!(!hub.sip().snapshot().await.has_active_call);
}

#[tokio::test]
async fn test_ice_trickle_order_end_to_end() {
    let (stack, hub) = new_hub();
    let (delegate_tx, mut delegate_rx) = unbounded_channel();
    *stack.ice_delegate.lock().unwrap() = Some(delegate_tx);
    let (pc_factory, edge) = ready_edge(&hub).await;
    sip_ready(&hub, &edge).await;

    let _call_id = edge.make_call("bob", None).await.unwrap();
    let pc = pc_factory.last_pc();
    for n in 0..4u32 {
        pc.emit_candidate(Some(siphub::message::IceCandidateInit {
            candidate: format!("candidate:{} 1 UDP 1 192.0.2.1 5000 typ host", n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }
    pc.emit_candidate(None);

    for n in 0..4u32 {
        let candidate = timeout(Duration::from_secs(1), delegate_rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(candidate.candidate.starts_with(&format!("candidate:{}", n)));
    }
    // Null candidate is the last delivery before gathering completes.
    let end = timeout(Duration::from_secs(1), delegate_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn test_local_media_control_stays_local() {
    let (stack, hub) = new_hub();
    let (pc_factory, edge) = ready_edge(&hub).await;
    sip_ready(&hub, &edge).await;
    let _call_id = edge.make_call("bob", None).await.unwrap();
    let _ = stack;

    edge.set_muted(true).await;
    let pc = pc_factory.last_pc();
    assert_eq!(*pc.muted.lock().unwrap(), Some(true));
    edge.set_muted(false).await;
    assert_eq!(*pc.muted.lock().unwrap(), Some(false));

    edge.send_local_dtmf("9").await;
    assert_eq!(
        pc.dtmf.lock().unwrap().clone(),
        vec![("9".to_string(), 100, 70)]
    );
}
