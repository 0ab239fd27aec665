//! Replies are matched to calls by correlation id, whatever order they
//! arrive in.

use rand::{seq::SliceRandom, thread_rng};
use rpcservice::{Promise, Protocol, ServiceClient, ServiceServer};
use std::time::Duration;
use tokio::{io, time};

const ECHO: u64 = 3;
const DELAYED: u64 = 1;

fn delayed_echo() -> ServiceServer {
    let mut protocol = Protocol::new();
    protocol
        .expose_async(DELAYED, |value: u32, delay_ms: u64| async move {
            time::sleep(Duration::from_millis(delay_ms)).await;
            value
        })
        .unwrap();
    ServiceServer::builder().add(ECHO, protocol).unwrap().build()
}

fn connect(server: &ServiceServer) -> ServiceClient {
    let (client_end, server_end) = io::duplex(64 * 1024);
    server.accept_stream(server_end);
    ServiceClient::builder().connect_stream(client_end)
}

#[tokio::test]
async fn replies_in_reverse_order_resolve_the_right_calls() {
    let server = delayed_echo();
    let client = connect(&server);

    // Earlier calls sleep longer, so replies come back last to first.
    let promises: Vec<(u32, Promise<u32>)> = (0..5u32)
        .map(|i| {
            let delay = u64::from(5 - i) * 40;
            (i, client.call(ECHO, DELAYED, &(i, delay)))
        })
        .collect();

    let ids: Vec<u64> = promises.iter().map(|(_, p)| p.id()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    for (expected, promise) in promises {
        let value = time::timeout(Duration::from_secs(5), promise.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, expected);
    }
}

#[tokio::test]
async fn shuffled_replies_resolve_the_right_calls() {
    let server = delayed_echo();
    let client = connect(&server);

    let mut delays: Vec<u64> = (0..32).map(|n| n * 3).collect();
    delays.shuffle(&mut thread_rng());

    let promises: Vec<(u32, Promise<u32>)> = delays
        .iter()
        .enumerate()
        .map(|(i, &delay)| {
            let value = i as u32;
            (value, client.call(ECHO, DELAYED, &(value, delay)))
        })
        .collect();

    let mut waiting = promises;
    waiting.shuffle(&mut thread_rng());
    for (expected, promise) in waiting {
        assert_eq!(promise.wait().await.unwrap(), expected);
    }
    assert_eq!(client.connection().pending_calls(), 0);
}

#[tokio::test]
async fn readiness_is_observable_without_waiting() {
    let server = delayed_echo();
    let client = connect(&server);

    let promise: Promise<u32> = client.call(ECHO, DELAYED, &(7u32, 0u64));
    for _ in 0..500 {
        if promise.is_ready() {
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    assert!(promise.is_fulfilled());
    assert_eq!(promise.try_take(), Some(Ok(7)));
}
