use super::*;

#[test]
fn test_send_forwards_packets_to_framing_layer() {
    let (transport, mut outbound) = WebSocketTransport::new(SocketFlavor::WebSocket);
    assert!(transport.is_writable());

    transport
        .send(vec![Packet::message("one"), Packet::message("two")])
        .unwrap();

    assert_eq!(outbound.try_recv().unwrap(), Packet::message("one"));
    assert_eq!(outbound.try_recv().unwrap(), Packet::message("two"));
}

#[test]
fn test_send_after_framing_layer_hangs_up_returns_packets() {
    let (transport, outbound) = WebSocketTransport::new(SocketFlavor::WebSocket);
    drop(outbound);

    let err = transport
        .send(vec![Packet::message("a"), Packet::message("b")])
        .unwrap_err();
    assert_eq!(err.error, TransportError::Closed);
    assert_eq!(err.packets, vec![Packet::message("a"), Packet::message("b")]);
}

#[test]
fn test_disconnect_emits_close_once() {
    let (transport, _outbound) = WebSocketTransport::new(SocketFlavor::WebSocket);
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.bind(tx);

    transport.on_disconnect(Some("reset by peer".to_string()));
    transport.on_disconnect(None);

    assert_eq!(
        rx.try_recv().unwrap().1,
        TransportEvent::Close(CloseReason::TransportError("reset by peer".to_string()))
    );
    assert!(rx.try_recv().is_err());
    assert!(!transport.is_writable());
}

#[test]
fn test_close_ends_outbound_stream() {
    let (transport, mut outbound) = WebSocketTransport::new(SocketFlavor::PolicyProbe);
    let (done_tx, mut done_rx) = oneshot::channel();
    transport.close(Some(done_tx));

    assert!(done_rx.try_recv().is_ok());
    assert!(matches!(
        outbound.try_recv(),
        Err(mpsc::error::TryRecvError::Disconnected)
    ));
    assert_eq!(transport.kind(), TransportKind::PolicyProbe);
}

#[test]
fn test_discard_emits_nothing() {
    let (transport, _outbound) = WebSocketTransport::new(SocketFlavor::WebSocket);
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.bind(tx);

    transport.discard();
    transport.on_packet(Packet::Upgrade);
    transport.on_disconnect(None);

    assert!(rx.try_recv().is_err());
}
