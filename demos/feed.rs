use std::time::Duration;

use rpcservice::{Protocol, Publisher, ServiceClient, ServiceServer};
use tokio::{sync::mpsc, task, time};

const CLOCK: u64 = 3;
const TICKS: u64 = 1;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let ticks = Publisher::new();
    let mut clock = Protocol::new();
    clock.register_feed(TICKS, &ticks).unwrap();

    let server = ServiceServer::builder().add(CLOCK, clock).unwrap().build();
    task::spawn({
        let server = server.clone();
        async move { server.serve_tcp("127.0.0.1:8889").await }
    });
    time::sleep(Duration::from_millis(10)).await;

    let client = ServiceClient::connect("127.0.0.1:8889").await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = client
        .subscribe(CLOCK, TICKS, move |tick: u32| {
            let _ = tx.send(tick);
        })
        .await
        .unwrap();

    for tick in 1..=5u32 {
        let delivered = ticks.publish(&tick);
        println!("published tick {tick} to {delivered} subscriber(s)");
        println!("client saw tick {}", rx.recv().await.unwrap());
    }

    client.unsubscribe(subscription);
    server.shutdown();
}
