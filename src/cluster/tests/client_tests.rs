use super::*;
use crate::cluster::coordinator::Coordinator;
use crate::packet::Sid;
use futures::future::join_all;
use tokio::io::{duplex, split, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

async fn attached(coordinator: &Coordinator, worker: u32) -> RpcClient {
    let (worker_side, master_side) = duplex(64 * 1024);
    let (master_read, master_write) = split(master_side);
    coordinator
        .attach_worker(WorkerId(worker), master_read, master_write)
        .await;
    let (read, write) = split(worker_side);
    RpcClient::new(WorkerId(worker), read, write)
}

/// A client wired to a hand-driven master end.
fn scripted(worker: u32) -> (RpcClient, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
    let (worker_side, master_side) = duplex(64 * 1024);
    let (read, write) = split(worker_side);
    let (master_read, master_write) = split(master_side);
    (RpcClient::new(WorkerId(worker), read, write), master_read, master_write)
}

#[tokio::test]
async fn test_calls_round_trip_through_coordinator() {
    let coordinator = Coordinator::new();
    let client = attached(&coordinator, 1).await;
    let sid = Sid::from("abc");

    assert_eq!(
        client.call(RemoteCall::Verify(sid.clone())).await,
        Ok(RemoteReply::Verified(false))
    );
    assert_eq!(
        client.call(RemoteCall::Handshake(sid.clone())).await,
        Ok(RemoteReply::Ack)
    );
    assert_eq!(
        client.call(RemoteCall::Verify(sid.clone())).await,
        Ok(RemoteReply::Verified(true))
    );
    assert_eq!(
        client.call(RemoteCall::LookupWorker(sid)).await,
        Ok(RemoteReply::Owner(Some(WorkerId(1))))
    );
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_notify_is_fire_and_forget() {
    let coordinator = Coordinator::new();
    let client = attached(&coordinator, 2).await;
    let sid = Sid::from("quiet");

    client.notify(RemoteCall::Handshake(sid.clone())).unwrap();
    // A correlated call afterwards observes the notify's effect, since the
    // channel preserves order.
    assert_eq!(
        client.call(RemoteCall::Verify(sid)).await,
        Ok(RemoteReply::Verified(true))
    );
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_calls_resolve_once_each() {
    let coordinator = Coordinator::new();
    let owner = attached(&coordinator, 1).await;
    let asker = attached(&coordinator, 2).await;
    for i in 0..10 {
        owner
            .call(RemoteCall::Handshake(Sid::from(format!("s{}", i))))
            .await
            .unwrap();
    }

    let calls = (0..20).map(|i| asker.call(RemoteCall::Verify(Sid::from(format!("s{}", i)))));
    let replies = join_all(calls).await;
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply, Ok(RemoteReply::Verified(i < 10)));
    }
    assert_eq!(asker.pending_calls(), 0);
}

#[tokio::test]
async fn test_stale_and_foreign_lines_are_ignored() {
    let (client, master_read, mut master_write) = scripted(5);
    let mut requests = BufReader::new(master_read).lines();

    let call = tokio::spawn(async move {
        let reply = client.call(RemoteCall::Verify(Sid::from("x"))).await;
        (reply, client)
    });

    let request = requests.next_line().await.unwrap().unwrap();
    let Inbound::Tagged(request) = decode_line(&request) else {
        panic!("expected engine request");
    };
    let id = request.id.unwrap();

    let stale = format!(
        "{{\"__engine\":true,\"fn\":\"verify\",\"args\":[false],\"id\":{},\"wid\":5}}\n",
        id + 100
    );
    master_write.write_all(stale.as_bytes()).await.unwrap();
    master_write.write_all(b"{\"hello\":\"worker\"}\n").await.unwrap();
    let answer = Envelope::response(&request, &RemoteReply::Verified(true))
        .to_line()
        .unwrap();
    master_write
        .write_all(format!("{}\n", answer).as_bytes())
        .await
        .unwrap();
    // A duplicate answer after resolution must not resolve anything.
    master_write
        .write_all(format!("{}\n", answer).as_bytes())
        .await
        .unwrap();

    let (reply, client) = call.await.unwrap();
    assert_eq!(reply, Ok(RemoteReply::Verified(true)));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_channel_eof_fails_pending_calls() {
    let (client, master_read, master_write) = scripted(6);
    let call = tokio::spawn(async move { client.call(RemoteCall::Verify(Sid::from("x"))).await });

    let mut requests = BufReader::new(master_read).lines();
    let _ = requests.next_line().await.unwrap();
    drop(requests);
    drop(master_write);

    assert_eq!(call.await.unwrap(), Err(RpcError::ChannelClosed));
}

#[tokio::test]
async fn test_timeout_retires_call() {
    let (client, master_read, _master_write) = scripted(7);
    let client = client.with_timeout(Some(Duration::from_millis(30)));

    let reply = client.call(RemoteCall::Verify(Sid::from("slow"))).await;
    assert_eq!(reply, Err(RpcError::Timeout));
    assert_eq!(client.pending_calls(), 0);
    drop(master_read);
}

#[tokio::test]
async fn test_send_raw_reaches_coordinator_subscribers() {
    let coordinator = Coordinator::new();
    let mut events = coordinator.subscribe();
    let client = attached(&coordinator, 4).await;

    client
        .send_raw(&serde_json::json!({"kind": "stats", "clients": 3}))
        .unwrap();

    loop {
        if let crate::cluster::ClusterEvent::Message { worker, payload } = events.recv().await.unwrap() {
            assert_eq!(worker, WorkerId(4));
            assert_eq!(payload["clients"], 3);
            break;
        }
    }
}
