use super::*;

#[test]
fn test_polling_variants_upgrade_to_socket_and_probe() {
    for kind in [
        TransportKind::PollingXhr,
        TransportKind::PollingJsonp,
        TransportKind::PollingDynamic,
    ] {
        assert_eq!(
            kind.upgrades_to(),
            &[TransportKind::PersistentSocket, TransportKind::PolicyProbe]
        );
        assert!(kind.is_polling());
    }
}

#[test]
fn test_terminal_variants_have_no_upgrades() {
    assert!(TransportKind::PersistentSocket.upgrades_to().is_empty());
    assert!(TransportKind::PolicyProbe.upgrades_to().is_empty());
}

#[test]
fn test_names_parse_back() {
    for kind in TransportKind::ALL {
        assert_eq!(kind.name().parse::<TransportKind>().unwrap(), kind);
    }
    assert!("flashsocket".parse::<TransportKind>().is_err());
}

#[test]
fn test_kind_serializes_as_wire_name() {
    let json = serde_json::to_string(&TransportKind::PollingJsonp).unwrap();
    assert_eq!(json, "\"polling-jsonp\"");
}

#[test]
fn test_relay_queues_until_bound() {
    let mut relay = EventRelay::default();
    relay.emit(7, TransportEvent::Drain);

    let (tx, mut rx) = mpsc::unbounded_channel();
    relay.bind(7, tx);
    relay.emit(7, TransportEvent::Packet(Packet::Noop));

    assert_eq!(rx.try_recv().unwrap(), (7, TransportEvent::Drain));
    assert_eq!(
        rx.try_recv().unwrap(),
        (7, TransportEvent::Packet(Packet::Noop))
    );
}

#[test]
fn test_detached_relay_is_silent() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut relay = EventRelay::default();
    relay.bind(1, tx);
    relay.detach();
    relay.emit(1, TransportEvent::Drain);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_build_assigns_distinct_ids() {
    let a = TransportHandle::build(TransportKind::PollingXhr).shared();
    let b = TransportHandle::build(TransportKind::PersistentSocket).shared();
    assert_ne!(a.id(), b.id());
    assert_eq!(a.kind(), TransportKind::PollingXhr);
    assert_eq!(b.name(), "persistent-socket");
    assert!(a.as_polling().is_some());
    assert!(b.as_polling().is_none());
}
