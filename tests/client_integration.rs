// tests/client_integration.rs
//! End-to-end scenarios for the client: response dispatch,
//! retransmission, and shutdown, driven through mock transports on
//! virtual time.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use stun_client::{
    Client, ClientOptions, Connection, Event, Handler, Message, StunError,
};

fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn binding_request() -> Message {
    let mut m = Message::new();
    m.add_software("stun-client test").unwrap();
    m.write_header();
    m
}

/// Transport that records writes and never delivers a response.
#[derive(Default)]
struct SilentConnection {
    writes: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl Connection for SilentConnection {
    async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
        std::future::pending().await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.writes.lock().push(buf.to_vec());
        Ok(buf.len())
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Transport that answers every request with a success response carrying
/// a fixed XOR-MAPPED-ADDRESS.
struct RespondingConnection {
    mapped: SocketAddr,
    response_tx: mpsc::UnboundedSender<Vec<u8>>,
    response_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl RespondingConnection {
    fn new(mapped: SocketAddr) -> Self {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        Self {
            mapped,
            response_tx,
            response_rx: tokio::sync::Mutex::new(response_rx),
        }
    }
}

#[async_trait]
impl Connection for RespondingConnection {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.response_rx.lock().await;
        match rx.recv().await {
            Some(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            None => std::future::pending().await,
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut request = Message::new();
        request.raw.clear();
        request.raw.extend_from_slice(buf);
        request.decode().expect("request must decode");

        let mut response = Message::new();
        response.typ = stun_client::MessageType::new(
            stun_client::Method::Binding,
            stun_client::MessageClass::SuccessResponse,
        );
        response.transaction_id = request.transaction_id;
        response.add_xor_mapped_address(self.mapped);
        response.write_header();
        self.response_tx
            .send(response.raw.to_vec())
            .expect("receiver alive");
        Ok(buf.len())
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn binding_request_resolves_with_mapped_address() {
    setup_test_logging();
    let mapped: SocketAddr = "213.141.156.236:48583".parse().unwrap();
    let conn = Arc::new(RespondingConnection::new(mapped));
    let client = Client::new(ClientOptions {
        connection: Some(conn),
        ..Default::default()
    })
    .unwrap();

    let request = binding_request();
    let event = client.request(&request).await.unwrap();
    match event {
        Event::Success {
            transaction_id,
            message,
        } => {
            assert_eq!(transaction_id, request.transaction_id);
            assert_eq!(message.get_xor_mapped_address().unwrap(), mapped);
        }
        Event::Failure { error, .. } => panic!("unexpected failure: {error}"),
    }

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn retransmits_until_send_budget_then_times_out() {
    setup_test_logging();
    let conn = Arc::new(SilentConnection::default());
    let client = Client::new(ClientOptions {
        connection: Some(conn.clone()),
        rto: Duration::from_millis(10),
        max_attempts: 3,
        timeout_rate: Duration::from_millis(10),
        ..Default::default()
    })
    .unwrap();

    let request = binding_request();
    let event = client.request(&request).await.unwrap();
    assert!(matches!(
        event,
        Event::Failure {
            error: StunError::TransactionTimedOut,
            ..
        }
    ));

    let writes = conn.writes.lock().clone();
    assert_eq!(writes.len(), 3);
    for write in &writes {
        assert_eq!(write.as_slice(), &request.raw[..]);
    }

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn handler_fires_exactly_once() {
    setup_test_logging();
    let conn = Arc::new(SilentConnection::default());
    let client = Client::new(ClientOptions {
        connection: Some(conn),
        rto: Duration::from_millis(10),
        max_attempts: 2,
        timeout_rate: Duration::from_millis(10),
        ..Default::default()
    })
    .unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));
    let seen = count.clone();
    let handler: Handler = Arc::new(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = done_tx.lock().take() {
            let _ = tx.send(());
        }
    });

    let request = binding_request();
    client.start(&request, Some(handler)).await.unwrap();
    done_rx.await.unwrap();

    // No further delivery after the terminal event.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn duplicate_transaction_id_is_rejected() {
    setup_test_logging();
    let conn = Arc::new(SilentConnection::default());
    let client = Client::new(ClientOptions {
        connection: Some(conn),
        ..Default::default()
    })
    .unwrap();

    let request = binding_request();
    let noop: Handler = Arc::new(|_| {});
    client.start(&request, Some(noop.clone())).await.unwrap();
    assert!(matches!(
        client.start(&request, Some(noop)).await,
        Err(StunError::TransactionExists)
    ));

    client.close().await.unwrap();
}

#[tokio::test]
async fn close_resolves_pending_transactions_and_is_terminal() {
    setup_test_logging();
    let conn = Arc::new(SilentConnection::default());
    let client = Arc::new(
        Client::new(ClientOptions {
            connection: Some(conn),
            ..Default::default()
        })
        .unwrap(),
    );

    let request = binding_request();
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request(&request).await })
    };
    // Let the transaction register before shutting down.
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.close().await.unwrap();
    let event = pending.await.unwrap().unwrap();
    assert!(matches!(
        event,
        Event::Failure {
            error: StunError::AgentClosed,
            ..
        }
    ));

    assert!(matches!(
        client.close().await,
        Err(StunError::ClientClosed)
    ));
    assert!(matches!(
        client.start(&binding_request(), None).await,
        Err(StunError::ClientClosed)
    ));
}

#[tokio::test]
async fn indication_registers_no_transaction() {
    setup_test_logging();
    let conn = Arc::new(SilentConnection::default());
    let client = Client::new(ClientOptions {
        connection: Some(conn.clone()),
        ..Default::default()
    })
    .unwrap();

    let mut m = Message::new();
    m.typ = stun_client::MessageType::new(
        stun_client::Method::Binding,
        stun_client::MessageClass::Indication,
    );
    m.write_header();
    client.indicate(&m).await.unwrap();

    assert_eq!(conn.writes.lock().len(), 1);
    // Nothing pends, so close resolves no handlers.
    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn set_rto_only_affects_new_transactions() {
    setup_test_logging();
    let conn = Arc::new(SilentConnection::default());
    let client = Client::new(ClientOptions {
        connection: Some(conn),
        rto: Duration::from_millis(10),
        max_attempts: 2,
        timeout_rate: Duration::from_millis(10),
        ..Default::default()
    })
    .unwrap();

    // In-flight transaction keeps its 10 ms snapshot even though the RTO
    // changes right after it starts.
    let started = Instant::now();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));
    let handler: Handler = Arc::new(move |event| {
        if let Some(tx) = done_tx.lock().take() {
            let _ = tx.send(event);
        }
    });
    client.start(&binding_request(), Some(handler)).await.unwrap();
    client.set_rto(Duration::from_millis(500));
    let event = done_rx.await.unwrap();
    assert!(matches!(event, Event::Failure { .. }));
    assert!(started.elapsed() < Duration::from_millis(100));

    // The next transaction snapshots the new value.
    let started = Instant::now();
    let event = client.request(&binding_request()).await.unwrap();
    assert!(matches!(event, Event::Failure { .. }));
    assert!(started.elapsed() >= Duration::from_millis(500));

    client.close().await.unwrap();
}
