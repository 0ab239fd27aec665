use rpcservice::{CallError, ConnectionHandle, ErrorCode, Protocol, ServiceClient, ServiceServer};
use std::{future::pending, time::Duration};
use tokio::{io, time};

const SVC: u64 = 1;
const HANG: u64 = 1;
const WHOAMI: u64 = 2;

const CALLBACKS: u64 = 7;
const NAME: u64 = 1;
const STRICT: u64 = 2;

fn server() -> ServiceServer {
    let mut protocol = Protocol::new();
    protocol
        .expose_async(HANG, || pending::<()>())
        .and_then(|p| p.expose_with_client(WHOAMI, |client: ConnectionHandle| client.as_u64()))
        .unwrap();
    ServiceServer::builder().add(SVC, protocol).unwrap().build()
}

fn connect(server: &ServiceServer, name: &'static str) -> ServiceClient {
    let mut callbacks = Protocol::new();
    callbacks
        .expose(NAME, move || name)
        .and_then(|p| {
            p.expose_async(STRICT, |n: u32| {
                assert!(n != 0, "callback rejects zero");
                async move { n }
            })
        })
        .unwrap();
    let (client_end, server_end) = io::duplex(64 * 1024);
    server.accept_stream(server_end);
    ServiceClient::builder()
        .add(CALLBACKS, callbacks)
        .unwrap()
        .connect_stream(client_end)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn losing_the_connection_fails_pending_calls() {
    let server = server();
    let client = connect(&server, "a");

    let hanging = client.call::<(), _>(SVC, HANG, &());
    let other = client.call::<(), _>(SVC, HANG, &());
    eventually(|| server.connection_count() == 1).await;

    server.shutdown();

    let outcome = time::timeout(Duration::from_secs(5), hanging.wait()).await.unwrap();
    assert_eq!(outcome, Err(CallError::ConnectionClosed));
    assert_eq!(other.wait().await, Err(CallError::ConnectionClosed));

    time::timeout(Duration::from_secs(5), client.closed()).await.unwrap();
    assert!(!client.is_alive());
    assert_eq!(client.connection().pending_calls(), 0);

    let late = client.call::<(), _>(SVC, HANG, &());
    assert!(late.is_ready());
    assert_eq!(late.wait().await, Err(CallError::ConnectionClosed));

    eventually(|| server.connection_count() == 0).await;
}

#[tokio::test]
async fn dropped_clients_leave_the_registry() {
    let server = server();
    let a = connect(&server, "a");
    let b = connect(&server, "b");
    eventually(|| server.connection_count() == 2).await;

    let handles = server.connections();
    assert_eq!(handles.len(), 2);
    assert!(handles[0] < handles[1]);

    drop(a);
    eventually(|| server.connection_count() == 1).await;
    assert!(b.is_alive());

    // Handles are not reused after a disconnect.
    let c = connect(&server, "c");
    eventually(|| server.connection_count() == 2).await;
    let newest = *server.connections().last().unwrap();
    assert!(newest > handles[1]);
    drop((b, c));
}

#[tokio::test]
async fn server_calls_back_into_its_clients() {
    let server = server();
    let alice = connect(&server, "alice");
    let bob = connect(&server, "bob");

    let alice_handle = ConnectionHandle::new(alice.call(SVC, WHOAMI, &()).wait().await.unwrap());
    let name: String = server.call(alice_handle, CALLBACKS, NAME, &()).wait().await.unwrap();
    assert_eq!(name, "alice");

    let mut names = Vec::new();
    for (_, promise) in server.broadcast::<String, _>(CALLBACKS, NAME, &()) {
        names.push(promise.wait().await.unwrap());
    }
    names.sort();
    assert_eq!(names, vec!["alice".to_owned(), "bob".to_owned()]);

    let mut visited = 0;
    server.for_each_connection(|handle, conn| {
        assert_eq!(conn.handle(), handle);
        visited += 1;
    });
    assert_eq!(visited, 2);
    drop(bob);
}

#[tokio::test]
async fn closing_the_client_is_seen_by_the_server() {
    let server = server();
    let client = connect(&server, "a");
    eventually(|| server.connection_count() == 1).await;
    let handle = server.connections()[0];

    client.close();
    time::timeout(Duration::from_secs(5), client.closed()).await.unwrap();
    eventually(|| server.connection(handle).is_none()).await;

    let err = server.call::<String, _>(handle, CALLBACKS, NAME, &()).wait().await;
    assert_eq!(err, Err(CallError::ConnectionClosed));
}

#[tokio::test]
async fn a_panicking_client_callback_leaves_both_ends_serving() {
    let server = server();
    let client = connect(&server, "a");
    let handle = ConnectionHandle::new(client.call(SVC, WHOAMI, &()).wait().await.unwrap());

    let outcome = time::timeout(
        Duration::from_secs(5),
        server.call::<u32, _>(handle, CALLBACKS, STRICT, &(0u32,)).wait(),
    )
    .await
    .unwrap();
    match outcome {
        Err(CallError::Remote(err)) => {
            assert_eq!(err.code, ErrorCode::Handler);
            assert!(err.message.contains("callback rejects zero"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    assert!(client.is_alive());
    let echoed: u32 = server.call(handle, CALLBACKS, STRICT, &(7u32,)).wait().await.unwrap();
    assert_eq!(echoed, 7);
    let again: u64 = client.call(SVC, WHOAMI, &()).wait().await.unwrap();
    assert_eq!(again, handle.as_u64());
}
