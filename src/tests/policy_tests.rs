use super::*;
use tokio::io::duplex;

#[test]
fn test_exact_request_in_one_chunk() {
    let mut probe = PolicyProbe::new();
    assert_eq!(probe.feed(POLICY_REQUEST), ProbeOutcome::Respond);
}

#[test]
fn test_request_split_across_chunks() {
    let mut probe = PolicyProbe::new();
    let (head, tail) = POLICY_REQUEST.split_at(5);
    assert_eq!(probe.feed(head), ProbeOutcome::NeedMore);
    assert_eq!(probe.feed(&[]), ProbeOutcome::NeedMore);
    assert_eq!(probe.feed(tail), ProbeOutcome::Respond);
}

#[test]
fn test_other_first_byte_detaches() {
    let mut probe = PolicyProbe::new();
    assert_eq!(probe.feed(b"GET / HTTP/1.1\r\n"), ProbeOutcome::Detach);
}

#[test]
fn test_mismatch_is_final() {
    let mut probe = PolicyProbe::new();
    assert_eq!(probe.feed(b"<policy-file-request/>X"), ProbeOutcome::Detach);
    assert_eq!(probe.feed(POLICY_REQUEST), ProbeOutcome::Detach);
}

#[test]
fn test_bytes_past_request_are_ignored() {
    let mut probe = PolicyProbe::new();
    let mut data = POLICY_REQUEST.to_vec();
    data.extend_from_slice(b"trailing");
    assert_eq!(probe.feed(&data), ProbeOutcome::Respond);
}

#[tokio::test]
async fn test_serve_writes_policy_and_closes() {
    let (mut client, server) = duplex(1024);
    let task = tokio::spawn(async move { serve_policy_probe(server, DEFAULT_POLICY).await });

    client.write_all(POLICY_REQUEST).await.unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();

    assert_eq!(response, DEFAULT_POLICY);
    assert!(matches!(task.await.unwrap().unwrap(), ProbeResult::Responded));
}

#[tokio::test]
async fn test_serve_hands_back_http_stream() {
    let (mut client, server) = duplex(1024);
    client.write_all(b"GET /engine HTTP/1.1\r\n").await.unwrap();

    let result = serve_policy_probe(server, DEFAULT_POLICY).await.unwrap();
    let ProbeResult::Detached { consumed, .. } = result else {
        panic!("http stream must be detached");
    };
    assert!(consumed.starts_with(b"GET"));
}

#[tokio::test]
async fn test_serve_detaches_on_early_eof() {
    let (mut client, server) = duplex(1024);
    client.write_all(b"<policy").await.unwrap();
    drop(client);

    let result = serve_policy_probe(server, DEFAULT_POLICY).await.unwrap();
    assert!(matches!(result, ProbeResult::Detached { ref consumed, .. } if consumed == b"<policy"));
}
