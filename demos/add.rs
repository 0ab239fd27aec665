use std::time::Duration;

use rpcservice::{Protocol, ServiceClient, ServiceServer};
use tokio::{task, time};

const MATH: u64 = 1;
const ADD: u64 = 42;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let mut math = Protocol::new();
    math.expose(ADD, |a: i64, b: i64| a + b).unwrap();

    let server = ServiceServer::builder().add(MATH, math).unwrap().build();
    task::spawn({
        let server = server.clone();
        async move { server.serve_tcp("127.0.0.1:8888").await }
    });
    time::sleep(Duration::from_millis(10)).await;

    let client = ServiceClient::connect("127.0.0.1:8888").await.unwrap();
    let sum: i64 = client.call(MATH, ADD, &(2i64, 3i64)).wait().await.unwrap();
    println!("2 + 3 = {sum}");

    match client.call::<i64, _>(MATH, ADD, &("two", "three")).wait().await {
        Ok(sum) => println!("strings added up to {sum}?"),
        Err(err) => println!("adding strings failed: {err}"),
    }

    server.shutdown();
}
