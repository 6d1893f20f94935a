//! End-to-end scenarios over in-memory connections

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, Notify, Semaphore};

use ocpp_engine::ocpp::types::{
    DataTransferRequest, DataTransferResponse, DataTransferStatus, HeartbeatRequest,
    HeartbeatResponse,
};
use ocpp_engine::transport::{self, ChannelConnection, Frame};
use ocpp_engine::{
    Direction, EngineConfig, Enforcement, ErrorCode, HandlerError, KeyMaterial, NetworkPath,
    NetworkingNode, OcppMessage, Outcome, Payload, Reply, SentMessageReport, SentMessageResult,
    SignaturePolicy, SignatureRule, SourceRouting,
};

fn node(id: &str) -> NetworkingNode {
    NetworkingNode::new(EngineConfig::new(id))
}

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 20, 12, 0, 0).unwrap()
}

/// Attach a raw connection to `peer` and return the frames sent to it
fn raw_peer(node: &NetworkingNode, peer: &str) -> mpsc::Receiver<Frame> {
    let (connection, rx) = ChannelConnection::new(peer, 16);
    node.attach(Arc::new(connection));
    rx
}

async fn next_message(rx: &mut mpsc::Receiver<Frame>) -> OcppMessage {
    let frame = rx.recv().await.expect("connection closed");
    OcppMessage::decode(frame.as_bytes()).expect("undecodable frame")
}

fn serve_heartbeat(node: &NetworkingNode) {
    node.router()
        .register::<HeartbeatRequest, _, _>(|_| async {
            Ok(Reply::Respond(HeartbeatResponse { current_time: noon() }))
        })
        .unwrap();
}

fn expect_error(message: OcppMessage, request_id: &str, code: ErrorCode) {
    match message {
        OcppMessage::CallError(error) => {
            assert_eq!(error.request_id.as_str(), request_id);
            assert_eq!(error.error_code, code, "{}", error.error_description);
        }
        other => panic!("Expected CallError, got {:?}", other),
    }
}

#[tokio::test]
async fn basic_heartbeat_on_the_wire() {
    let csms = node("CSMS");
    serve_heartbeat(&csms);
    let mut rx = raw_peer(&csms, "CS001");

    csms.on_frame("CS001", br#"[2,"abc","Heartbeat",{}]"#).await;

    assert_eq!(
        rx.recv().await,
        Some(Frame::Text(r#"[3,"abc",{"currentTime":"2026-01-20T12:00:00Z"}]"#.into()))
    );
}

#[tokio::test]
async fn basic_heartbeat_correlated() {
    let csms = node("CSMS");
    let station = node("CS001");
    serve_heartbeat(&csms);
    transport::link(&csms, &station, 16);

    let outcome = station
        .outbound()
        .request(&SourceRouting::to("CSMS"), &HeartbeatRequest {})
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Response(HeartbeatResponse { current_time: noon() }));
    assert_eq!(station.correlator().pending_count(), 0);
}

#[tokio::test]
async fn unknown_action_is_not_implemented() {
    let csms = node("CSMS");
    let mut rx = raw_peer(&csms, "CS001");

    csms.on_frame("CS001", br#"[2,"xyz","FooBar",{}]"#).await;

    let message = next_message(&mut rx).await;
    if let OcppMessage::CallError(error) = &message {
        assert_eq!(error.error_details, json!({}));
    }
    expect_error(message, "xyz", ErrorCode::NotImplemented);
}

#[tokio::test]
async fn malformed_payload_is_formation_violation() {
    let csms = node("CSMS");
    csms.router()
        .register::<DataTransferRequest, _, _>(|_| async {
            Ok(Reply::Respond(DataTransferResponse {
                status: DataTransferStatus::Accepted,
                data: None,
            }))
        })
        .unwrap();
    let mut rx = raw_peer(&csms, "CS001");

    csms.on_frame("CS001", br#"[2,"m1","DataTransfer",{"vendorId":42}]"#)
        .await;

    expect_error(next_message(&mut rx).await, "m1", ErrorCode::FormationViolation);
}

#[tokio::test]
async fn undecodable_call_answered_with_recovered_id() {
    let csms = node("CSMS");
    let mut rx = raw_peer(&csms, "CS001");

    // CALL with a missing payload element
    csms.on_frame("CS001", br#"[2,"bad-1","Heartbeat"]"#).await;
    expect_error(next_message(&mut rx).await, "bad-1", ErrorCode::FormationViolation);

    // Nothing to key a reply on
    csms.on_frame("CS001", b"not ocpp at all").await;
    // Malformed responses are never answered
    csms.on_frame("CS001", br#"[3,"bad-2"]"#).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn signature_gating() {
    let hmac_rule = || {
        SignatureRule::new(Enforcement::Required)
            .for_action("DataTransfer")
            .with_key("k1", KeyMaterial::hmac_sha256(b"shared-secret".to_vec()))
    };
    let policy = SignaturePolicy::new().with_rule(hmac_rule());

    let csms = NetworkingNode::new(EngineConfig::new("CSMS").with_signature_policy(policy.clone()));
    let station = NetworkingNode::new(EngineConfig::new("CS001").with_signature_policy(policy));
    transport::link(&csms, &station, 16);

    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = invoked.clone();
    csms.router()
        .register::<DataTransferRequest, _, _>(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Reply::Respond(DataTransferResponse {
                    status: DataTransferStatus::Accepted,
                    data: None,
                }))
            }
        })
        .unwrap();

    // Unsigned call from an unmanaged peer never reaches the handler
    let mut rx = raw_peer(&csms, "CS009");
    csms.on_frame("CS009", br#"[2,"s1","DataTransfer",{"vendorId":"EK"}]"#)
        .await;
    expect_error(next_message(&mut rx).await, "s1", ErrorCode::SecurityError);

    // A forged signature is rejected as well
    let forged = br#"[2,"s2","DataTransfer",{"vendorId":"EK","signatures":[{"keyId":"k1","algorithm":"HMAC-SHA256","value":"deadbeef"}]}]"#;
    csms.on_frame("CS009", forged).await;
    expect_error(next_message(&mut rx).await, "s2", ErrorCode::SecurityError);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    // Signed end to end
    let request = DataTransferRequest {
        vendor_id: "EK".into(),
        message_id: None,
        data: None,
    };
    let outcome = station
        .outbound()
        .request(&SourceRouting::to("CSMS"), &request)
        .await
        .unwrap();
    assert_eq!(
        outcome.response().map(|r| r.status),
        Some(DataTransferStatus::Accepted)
    );
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unsigned_response_rejected_when_required() {
    let csms = node("CSMS");
    serve_heartbeat(&csms);
    let station = NetworkingNode::new(EngineConfig::new("CS001").with_signature_policy(
        SignaturePolicy::new().with_rule(
            SignatureRule::new(Enforcement::Required)
                .for_direction(Direction::Response)
                .with_key("csms", KeyMaterial::hmac_sha256(b"secret".to_vec())),
        ),
    ));
    transport::link(&csms, &station, 16);

    let outcome = station
        .outbound()
        .request(&SourceRouting::to("CSMS"), &HeartbeatRequest {})
        .await
        .unwrap();
    assert_eq!(outcome.error_code(), Some(ErrorCode::SecurityError));
}

#[tokio::test]
async fn fan_out_picks_kth_subscriber() {
    const SUBSCRIBERS: usize = 5;
    const RESPONDER: usize = 3;

    let csms = node("CSMS");
    let station = node("CS001");
    transport::link(&csms, &station, 16);

    for index in 0..SUBSCRIBERS {
        csms.router()
            .register::<DataTransferRequest, _, _>(move |_| async move {
                // Later subscribers finish first
                let delay = (SUBSCRIBERS - index) as u64 * 5;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if index == RESPONDER {
                    Ok(Reply::Respond(DataTransferResponse {
                        status: DataTransferStatus::Accepted,
                        data: Some(json!({ "subscriber": index })),
                    }))
                } else {
                    Ok(Reply::Abstain)
                }
            })
            .unwrap();
    }

    let request = DataTransferRequest {
        vendor_id: "EK".into(),
        message_id: Some("fan-out".into()),
        data: None,
    };
    let response = station
        .outbound()
        .request(&SourceRouting::to("CSMS"), &request)
        .await
        .unwrap()
        .response()
        .unwrap();

    assert_eq!(response.data, Some(json!({ "subscriber": RESPONDER })));
}

#[tokio::test]
async fn handler_failure_is_internal_error() {
    let csms = node("CSMS");
    let station = node("CS001");
    transport::link(&csms, &station, 16);
    csms.router()
        .register::<HeartbeatRequest, _, _>(|_| async { Err(HandlerError::new("clock unavailable")) })
        .unwrap();

    let outcome = station
        .outbound()
        .request(&SourceRouting::to("CSMS"), &HeartbeatRequest {})
        .await
        .unwrap();

    match outcome {
        Outcome::Error(error) => {
            assert_eq!(error.error_code, ErrorCode::InternalError);
            assert_eq!(error.error_description, "clock unavailable");
        }
        other => panic!("Expected InternalError, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    let station = NetworkingNode::new(
        EngineConfig::new("CS001").with_request_timeout(Duration::from_secs(5)),
    );
    let _csms = raw_peer(&station, "CSMS");

    let started = tokio::time::Instant::now();
    let outcome = station
        .outbound()
        .call(&SourceRouting::to("CSMS"), "Heartbeat", Payload::empty())
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Timeout);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(station.correlator().pending_count(), 0);
}

#[tokio::test]
async fn connection_close_fails_pending_requests() {
    let station = node("CS001");
    let mut csms = raw_peer(&station, "CSMS");

    let pending = station
        .outbound()
        .send_request(&SourceRouting::to("CSMS"), "Heartbeat", Payload::empty())
        .await
        .unwrap();
    assert_eq!(pending.sent(), Some(&SentMessageResult::Sent));
    next_message(&mut csms).await;

    station.disconnect("CSMS");
    assert_eq!(pending.await, Outcome::ConnectionClosed);
    assert!(!station.connections().contains("CSMS"));
}

#[tokio::test]
async fn cancelled_request_resolves_immediately() {
    let station = node("CS001");
    let _csms = raw_peer(&station, "CSMS");

    let pending = station
        .outbound()
        .send_request(&SourceRouting::to("CSMS"), "Heartbeat", Payload::empty())
        .await
        .unwrap();
    assert!(pending.cancel_token().cancel());
    assert_eq!(pending.await, Outcome::Cancelled);
}

#[tokio::test]
async fn send_to_closed_peer_fails_the_request() {
    let station = node("CS001");
    drop(raw_peer(&station, "CSMS"));

    let outcome = station
        .outbound()
        .call(&SourceRouting::to("CSMS"), "Heartbeat", Payload::empty())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::SendFailed(SentMessageResult::ConnectionClosed));
}

#[tokio::test]
async fn duplicate_outbound_request_id_rejected() {
    let station = node("CS001");
    let _csms = raw_peer(&station, "CSMS");
    let outbound = station.outbound();

    let _first = outbound
        .send_request_with_id(&SourceRouting::to("CSMS"), "dup".into(), "Heartbeat", Payload::empty())
        .await
        .unwrap();
    let err = outbound
        .send_request_with_id(&SourceRouting::to("CSMS"), "dup".into(), "Heartbeat", Payload::empty())
        .await
        .err()
        .unwrap();
    assert_eq!(err.error_code(), ErrorCode::ProtocolError);
}

#[tokio::test]
async fn duplicate_inbound_request_id_rejected_while_in_flight() {
    let csms = node("CSMS");
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    csms.router()
        .register::<HeartbeatRequest, _, _>(move |_| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(Reply::Respond(HeartbeatResponse { current_time: noon() }))
            }
        })
        .unwrap();
    let mut rx = raw_peer(&csms, "CS001");

    let first = {
        let csms = csms.clone();
        tokio::spawn(async move { csms.on_frame("CS001", br#"[2,"d1","Heartbeat",{}]"#).await })
    };
    tokio::task::yield_now().await;

    csms.on_frame("CS001", br#"[2,"d1","Heartbeat",{}]"#).await;
    expect_error(next_message(&mut rx).await, "d1", ErrorCode::ProtocolError);

    release.notify_one();
    first.await.unwrap();
    assert!(matches!(next_message(&mut rx).await, OcppMessage::CallResult(_)));
}

/// Register a Heartbeat handler that waits for a permit before answering
fn gated_heartbeat(node: &NetworkingNode, runs: Arc<AtomicUsize>) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    let permits = gate.clone();
    node.router()
        .register::<HeartbeatRequest, _, _>(move |_| {
            let permits = permits.clone();
            let runs = runs.clone();
            async move {
                let _permit = permits.acquire().await.unwrap();
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(Reply::Respond(HeartbeatResponse { current_time: noon() }))
            }
        })
        .unwrap();
    gate
}

#[tokio::test]
async fn same_request_id_from_two_origins_behind_relay() {
    let csms = node("CSMS");
    let runs = Arc::new(AtomicUsize::new(0));
    let gate = gated_heartbeat(&csms, runs.clone());
    let mut relay = raw_peer(&csms, "NN1");

    let mut calls = Vec::new();
    for origin in ["CS001", "CS002"] {
        let frame = format!(
            r#"[2,"1","Heartbeat",{{}},{{"destination":"CSMS","networkPath":["{}","NN1"]}}]"#,
            origin
        );
        let csms = csms.clone();
        calls.push(tokio::spawn(async move { csms.on_frame("NN1", frame.as_bytes()).await }));
        tokio::task::yield_now().await;
    }

    gate.add_permits(2);
    for call in calls {
        call.await.unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    let mut destinations = Vec::new();
    for _ in 0..2 {
        match next_message(&mut relay).await {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.request_id.as_str(), "1");
                destinations.push(result.routing.unwrap().destination);
            }
            other => panic!("Expected CallResult, got {:?}", other),
        }
    }
    destinations.sort();
    assert_eq!(destinations, vec!["CS001", "CS002"]);
}

#[tokio::test]
async fn closed_peer_discards_in_flight_response() {
    let csms = node("CSMS");
    let runs = Arc::new(AtomicUsize::new(0));
    let gate = gated_heartbeat(&csms, runs.clone());

    let (old, mut old_rx) = ChannelConnection::new("CS001", 16);
    let old_id = csms.attach(Arc::new(old));
    let call = {
        let csms = csms.clone();
        tokio::spawn(async move { csms.on_frame("CS001", br#"[2,"h1","Heartbeat",{}]"#).await })
    };
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    // The station drops and comes straight back on a new socket
    csms.on_closed("CS001", old_id);
    let mut new_rx = raw_peer(&csms, "CS001");

    gate.add_permits(1);
    call.await.unwrap();

    // The handler finished, but its answer belongs to the closed connection
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(new_rx.try_recv().is_err());
    assert!(old_rx.try_recv().is_err());
}

#[tokio::test]
async fn reconnect_survives_close_of_old_socket() {
    let station = node("CS001");
    let (old, _old_rx) = ChannelConnection::new("CSMS", 16);
    let old_id = station.attach(Arc::new(old));
    let mut csms = raw_peer(&station, "CSMS");

    let pending = station
        .outbound()
        .send_request(&SourceRouting::to("CSMS"), "Heartbeat", Payload::empty())
        .await
        .unwrap();
    next_message(&mut csms).await;

    // The old socket's read loop ends after the replacement was attached
    station.on_closed("CSMS", old_id);
    assert!(station.connections().contains("CSMS"));
    assert!(station.correlator().is_pending(pending.request_id()));

    let response = format!(r#"[3,"{}",{{}}]"#, pending.request_id());
    station.on_frame("CSMS", response.as_bytes()).await;
    assert!(pending.await.is_response());
}

#[tokio::test]
async fn relinking_replaces_previous_link() {
    let station = node("CS001");
    let csms = node("CSMS");
    serve_heartbeat(&csms);

    transport::link(&station, &csms, 16);
    transport::link(&station, &csms, 16);
    // Let the first link's pumps notice their senders are gone
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert!(station.connections().contains("CSMS"));
    assert!(csms.connections().contains("CS001"));

    let outcome = station
        .outbound()
        .request(&SourceRouting::to("CSMS"), &HeartbeatRequest {})
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Response(HeartbeatResponse { current_time: noon() }));
}

#[tokio::test]
async fn relay_through_networking_node() {
    let station = node("CS001");
    let relay = node("NN1");
    let csms = node("CSMS");
    transport::link(&station, &relay, 16);
    transport::link(&relay, &csms, 16);
    station.set_default_route(Some("NN1".into()));

    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    csms.router()
        .register::<HeartbeatRequest, _, _>(move |incoming| {
            *sink.lock() = Some((
                incoming.context.network_path.clone(),
                incoming.context.origin().to_string(),
            ));
            async { Ok(Reply::Respond(HeartbeatResponse { current_time: noon() })) }
        })
        .unwrap();

    let outcome = station
        .outbound()
        .request(&SourceRouting::to("CSMS"), &HeartbeatRequest {})
        .await
        .unwrap();
    assert!(outcome.is_response());

    let (path, origin) = seen.lock().clone().unwrap();
    assert_eq!(path, NetworkPath::from_hops(["CS001", "NN1"]));
    assert_eq!(origin, "CS001");

    // And back down along an explicit source route
    serve_heartbeat(&station);
    let outcome = csms
        .outbound()
        .request(&SourceRouting::via(["NN1", "CS001"]), &HeartbeatRequest {})
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Response(HeartbeatResponse { current_time: noon() }));
}

#[tokio::test]
async fn unroutable_call_answered_with_routing_error() {
    let station = node("CS001");
    let relay = node("NN1");
    transport::link(&station, &relay, 16);
    station.set_default_route(Some("NN1".into()));

    let outcome = station
        .outbound()
        .call(&SourceRouting::to("CSMS"), "Heartbeat", Payload::empty())
        .await
        .unwrap();
    assert_eq!(outcome.error_code(), Some(ErrorCode::RoutingError));
}

#[tokio::test]
async fn hop_limit_enforced_by_relay() {
    let relay = NetworkingNode::new(EngineConfig::new("NN1").with_max_hops(2));
    let mut upstream = raw_peer(&relay, "CSMS");
    let mut downstream = raw_peer(&relay, "NN0");

    let frame = br#"[2,"h1","Heartbeat",{},{"destination":"CSMS","networkPath":["CS001","NN0"]}]"#;
    relay.on_frame("NN0", frame).await;

    let message = next_message(&mut downstream).await;
    assert_eq!(message.routing().map(|h| h.destination.as_str()), Some("CS001"));
    expect_error(message, "h1", ErrorCode::RoutingError);
    assert!(upstream.try_recv().is_err());
}

#[tokio::test]
async fn relay_detects_loops() {
    let relay = node("NN1");
    let _upstream = raw_peer(&relay, "CSMS");
    let mut downstream = raw_peer(&relay, "NN2");

    let frame = br#"[2,"l1","Heartbeat",{},{"destination":"CSMS","networkPath":["NN1","NN2"]}]"#;
    relay.on_frame("NN2", frame).await;

    expect_error(next_message(&mut downstream).await, "l1", ErrorCode::RoutingError);
}

#[tokio::test]
async fn binary_call_gets_binary_response() {
    let csms = node("CSMS");
    let station = node("CS001");
    transport::link(&csms, &station, 16);
    csms.router()
        .register::<DataTransferRequest, _, _>(|incoming| async move {
            Ok(Reply::Respond(DataTransferResponse {
                status: DataTransferStatus::Accepted,
                data: Some(json!(incoming.request.vendor_id)),
            }))
        })
        .unwrap();

    let outcome = station
        .outbound()
        .call(
            &SourceRouting::to("CSMS"),
            "DataTransfer",
            Payload::Binary(br#"{"vendorId":"EK"}"#.to_vec()),
        )
        .await
        .unwrap();

    let result = outcome.response().unwrap();
    assert!(matches!(result.payload, Payload::Binary(_)));
    let response: DataTransferResponse = result.parse_payload().unwrap();
    assert_eq!(response.data, Some(json!("EK")));
}

#[tokio::test]
async fn observers_see_every_transmission() {
    let csms = node("CSMS");
    let station = node("CS001");
    serve_heartbeat(&csms);
    transport::link(&csms, &station, 16);

    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    csms.reporter().subscribe(Arc::new(move |report: &SentMessageReport| {
        sink.lock().push(report.clone());
    }));

    station
        .outbound()
        .request(&SourceRouting::to("CSMS"), &HeartbeatRequest {})
        .await
        .unwrap();

    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].next_hop, "CS001");
    assert_eq!(reports[0].result, SentMessageResult::Sent);
    assert_eq!(reports[0].action, None);
}
