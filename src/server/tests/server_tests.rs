use super::*;
use crate::packet::{Packet, PROBE};
use crate::socket::SocketState;
use crate::transport::{PollingFlavor, PollingTransport, SocketFlavor, WebSocketTransport};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

fn server() -> Server {
    Server::new(EngineConfig::default()).unwrap()
}

fn get(transport: &str) -> Request {
    Request::new(Method::Get).with_query("transport", transport)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

async fn handshake(server: &Server, transport: &str) -> (Arc<Socket>, TransportHandle) {
    match server.handle_request(&get(transport)).await.unwrap() {
        RequestRoute::Handshake { socket, transport } => (socket, transport),
        other => panic!("expected handshake, got {:?}", other),
    }
}

#[tokio::test]
async fn test_verify_rejects_unknown_transport() {
    let server = server();
    let err = server.verify(&get("carrier-pigeon")).await.unwrap_err();
    assert_eq!(err, VerifyError::UnknownTransport("carrier-pigeon".to_string()));
    assert_eq!(err.code(), 0);

    let err = server.verify(&Request::new(Method::Get)).await.unwrap_err();
    assert_eq!(err.code(), 0);
}

#[tokio::test]
async fn test_verify_rejects_unregistered_transport() {
    let config = EngineConfig {
        transports: vec![TransportKind::PollingXhr],
        ..EngineConfig::default()
    };
    let server = Server::new(config).unwrap();
    assert!(server.verify(&get("polling-xhr")).await.is_ok());
    assert!(matches!(
        server.verify(&get("persistent-socket")).await,
        Err(VerifyError::UnknownTransport(_))
    ));
}

#[tokio::test]
async fn test_sidless_post_is_rejected_without_side_effects() {
    let server = server();
    let req = Request::from_url(Method::Post, "/engine?transport=polling-xhr");

    let err = server.handle_request(&req).await.unwrap_err();
    assert_eq!(err, VerifyError::BadHandshakeMethod(Method::Post));
    assert_eq!(err.status(), 400);
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&err.body()).unwrap(),
        serde_json::json!({"code": 2, "message": "Bad handshake method"})
    );
    assert_eq!(server.clients_count(), 0);
}

#[tokio::test]
async fn test_unknown_sid_is_rejected() {
    let server = server();
    let req = get("polling-xhr").with_query("sid", "nope");
    let err = server.handle_request(&req).await.unwrap_err();
    assert_eq!(err, VerifyError::UnknownSid(Sid::from("nope")));
    assert_eq!(err.code(), 1);
}

#[tokio::test]
async fn test_handshake_registers_and_announces_socket() {
    let server = server();
    let mut connections = server.subscribe();

    let (socket, transport) = handshake(&server, "polling-xhr").await;
    assert_eq!(server.clients_count(), 1);
    assert!(server.client(socket.sid()).is_some());
    assert_eq!(connections.recv().await.unwrap().sid(), socket.sid());

    let TransportHandle::Polling(polling) = transport else {
        panic!("polling handshake must yield a polling transport");
    };
    let batch = polling.on_poll_request().unwrap().await.unwrap();
    let Packet::Open(open) = &batch[0] else {
        panic!("first packet must be open");
    };
    assert_eq!(open.sid, *socket.sid());
    assert_eq!(open.upgrades, vec!["persistent-socket", "policy-probe"]);

    let route = server
        .handle_request(&get("polling-xhr").with_query("sid", socket.sid().as_str()))
        .await
        .unwrap();
    assert!(matches!(route, RequestRoute::Session(found) if found.sid() == socket.sid()));
}

#[tokio::test]
async fn test_close_removes_client_exactly_once() {
    let server = server();
    let (first, _t1) = handshake(&server, "polling-xhr").await;
    let (_second, _t2) = handshake(&server, "polling-jsonp").await;
    assert_eq!(server.clients_count(), 2);

    first.close();
    first.close();
    assert_eq!(server.clients_count(), 1);
    assert!(server.client(first.sid()).is_none());

    server.close();
    assert_eq!(server.clients_count(), 0);
}

#[tokio::test]
async fn test_transport_close_removes_client() {
    let server = server();
    let (socket, transport) = handshake(&server, "polling-xhr").await;
    let TransportHandle::Polling(polling) = transport else {
        panic!("expected polling transport");
    };

    polling.on_error("connection reset");
    eventually(|| server.clients_count() == 0).await;
    assert_eq!(socket.state(), SocketState::Closed);
}

#[test]
fn test_upgrades_follow_config() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();

    let server = server();
    assert_eq!(
        server.upgrades(TransportKind::PollingXhr),
        vec![TransportKind::PersistentSocket, TransportKind::PolicyProbe]
    );
    assert!(server.upgrades(TransportKind::PersistentSocket).is_empty());

    let restricted = Server::new(EngineConfig {
        transports: vec![TransportKind::PollingXhr, TransportKind::PersistentSocket],
        ..EngineConfig::default()
    })
    .unwrap();
    assert_eq!(
        restricted.upgrades(TransportKind::PollingXhr),
        vec![TransportKind::PersistentSocket]
    );

    let disabled = Server::new(EngineConfig {
        allow_upgrades: false,
        ..EngineConfig::default()
    })
    .unwrap();
    assert!(disabled.upgrades(TransportKind::PollingXhr).is_empty());
}

#[tokio::test]
async fn test_upgrade_request_moves_session_to_socket() {
    let server = server();
    let (socket, transport) = handshake(&server, "polling-xhr").await;
    let TransportHandle::Polling(polling) = transport else {
        panic!("expected polling transport");
    };
    let _ = polling.on_poll_request().unwrap().await;

    let (candidate, mut outbound) = WebSocketTransport::new(SocketFlavor::WebSocket);
    let req = get("persistent-socket").with_query("sid", socket.sid().as_str());
    let outcome = server
        .handle_upgrade_request(&req, candidate.clone())
        .await
        .unwrap();
    assert!(matches!(outcome, UpgradeOutcome::Upgrading(_)));

    candidate.on_packet(Packet::Ping(Some(PROBE.to_string())));
    assert_eq!(
        outbound.recv().await.unwrap(),
        Packet::Pong(Some(PROBE.to_string()))
    );
    candidate.on_packet(Packet::Upgrade);
    eventually(|| socket.state() == SocketState::Upgraded).await;

    socket.send("over the socket");
    assert_eq!(outbound.recv().await.unwrap(), Packet::message("over the socket"));
    assert_eq!(server.clients_count(), 1);
}

#[tokio::test]
async fn test_upgrade_after_upgrade_closes_new_transport() {
    let server = server();
    let (socket, _transport) = handshake(&server, "polling-xhr").await;
    let req = get("persistent-socket").with_query("sid", socket.sid().as_str());

    let (first, _first_out) = WebSocketTransport::new(SocketFlavor::WebSocket);
    server.handle_upgrade_request(&req, first.clone()).await.unwrap();
    first.on_packet(Packet::Upgrade);
    eventually(|| socket.is_upgraded()).await;

    let (second, mut second_out) = WebSocketTransport::new(SocketFlavor::WebSocket);
    let err = server
        .handle_upgrade_request(&req, second.clone())
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Upgrade(UpgradeRejected::AlreadyUpgraded));
    assert!(!second.is_writable());
    assert!(second_out.recv().await.is_none());
    assert!(first.is_writable());
    assert_eq!(socket.transport().id(), first.id());
}

#[tokio::test]
async fn test_failed_upgrade_verification_discards_candidate() {
    let server = server();
    let (candidate, _outbound) = WebSocketTransport::new(SocketFlavor::WebSocket);
    let req = get("persistent-socket").with_query("sid", "missing");

    let err = server
        .handle_upgrade_request(&req, candidate.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Verify(VerifyError::UnknownSid(_))));
    assert!(!candidate.is_writable());
    assert_eq!(server.clients_count(), 0);
}

#[tokio::test]
async fn test_sidless_socket_connection_handshakes() {
    let server = server();
    let (candidate, mut outbound) = WebSocketTransport::new(SocketFlavor::WebSocket);

    let outcome = server
        .handle_upgrade_request(&get("persistent-socket"), candidate)
        .await
        .unwrap();
    let UpgradeOutcome::Handshake(socket) = outcome else {
        panic!("expected a new session");
    };
    let Packet::Open(open) = outbound.recv().await.unwrap() else {
        panic!("first packet must be open");
    };
    assert_eq!(open.sid, *socket.sid());
    assert!(open.upgrades.is_empty());
    assert_eq!(server.clients_count(), 1);
}

#[tokio::test]
async fn test_polling_candidate_is_not_an_upgrade_target() {
    let server = server();
    let (socket, _transport) = handshake(&server, "polling-xhr").await;
    let candidate = PollingTransport::new(PollingFlavor::Jsonp);
    let req = get("polling-jsonp").with_query("sid", socket.sid().as_str());

    let err = server
        .handle_upgrade_request(&req, candidate)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Upgrade(UpgradeRejected::NotAllowed { .. })
    ));
    assert_eq!(socket.state(), SocketState::Open);
}

#[tokio::test]
async fn test_policy_probe_served_when_registered() {
    let server = server();
    let (mut client, stream) = duplex(1024);
    let probe = {
        let server = server.clone();
        tokio::spawn(async move { server.probe_legacy_policy(stream).await })
    };

    client
        .write_all(crate::policy::POLICY_REQUEST)
        .await
        .unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, crate::policy::DEFAULT_POLICY);
    assert!(matches!(probe.await.unwrap().unwrap(), ProbeResult::Responded));
}

#[tokio::test]
async fn test_policy_probe_skipped_when_unregistered() {
    let server = Server::new(EngineConfig {
        transports: vec![TransportKind::PollingXhr],
        ..EngineConfig::default()
    })
    .unwrap();
    let (mut client, stream) = duplex(1024);
    client
        .write_all(crate::policy::POLICY_REQUEST)
        .await
        .unwrap();

    let result = server.probe_legacy_policy(stream).await.unwrap();
    assert!(matches!(result, ProbeResult::Detached { ref consumed, .. } if consumed.is_empty()));
}
