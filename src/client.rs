// src/client.rs
//! STUN client: owns the transport, feeds inbound messages to the agent,
//! drives deadline collection and runs the retransmission policy.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::agent::{Agent, ClientAgent, Event, Handler};
use crate::clock::{Clock, SystemClock};
use crate::error::{StunError, StunResult};
use crate::message::{Message, TransactionId};

/// Default collector tick period.
pub const DEFAULT_TIMEOUT_RATE: Duration = Duration::from_millis(100);

/// Default initial retransmission interval (RFC 5389 Section 7.2.1).
pub const DEFAULT_RTO: Duration = Duration::from_millis(500);

/// Default total send budget per transaction.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 7;

/// Reusable inbound read buffer size.
const INBOUND_BUFFER_SIZE: usize = 1024;

/// Bidirectional transport owned by the client.
///
/// Each successful `recv` must yield one whole STUN message (datagram
/// semantics). Stream transports should frame with
/// [`Message::read_from`], which reads the 20-byte header and then the
/// body it declares.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Receive one message into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send one message.
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Release the transport. The client interrupts its pending reads
    /// through its own close signal, so sockets that close on drop may
    /// make this a no-op.
    fn close(&self) -> io::Result<()>;
}

#[async_trait]
impl Connection for UdpSocket {
    /// Requires a connected socket.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Options used to initialize a [`Client`].
pub struct ClientOptions {
    /// Transaction registry. Defaults to the built-in [`Agent`].
    pub agent: Option<Arc<dyn ClientAgent>>,
    /// Transport. Required.
    pub connection: Option<Arc<dyn Connection>>,
    /// Collector tick period.
    pub timeout_rate: Duration,
    /// Initial retransmission interval.
    pub rto: Duration,
    /// Total send budget per transaction, first write included.
    pub max_attempts: u32,
    /// Time source. Defaults to [`SystemClock`].
    pub clock: Option<Arc<dyn Clock>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            agent: None,
            connection: None,
            timeout_rate: DEFAULT_TIMEOUT_RATE,
            rto: DEFAULT_RTO,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            clock: None,
        }
    }
}

/// Client-side transaction state. `raw` keeps the serialized request so
/// retransmission does not re-encode.
struct ClientTransaction {
    id: TransactionId,
    start: Instant,
    rto: Duration,
    attempt: u32,
    handler: Handler,
    raw: Vec<u8>,
}

impl ClientTransaction {
    /// Deadline for the current attempt. Intervals grow as RTO, 2*RTO,
    /// 4*RTO per RFC 5389 Section 7.2.1; the RTO snapshot taken at start
    /// stays fixed for the transaction's lifetime.
    fn next_timeout(&self, now: Instant) -> Instant {
        let factor = 1u32 << self.attempt.min(31);
        now + self.rto.saturating_mul(factor)
    }
}

struct ClientInner {
    agent: Arc<dyn ClientAgent>,
    conn: Arc<dyn Connection>,
    clock: Arc<dyn Clock>,
    rto_nanos: AtomicU64,
    max_attempts: AtomicU32,
    closed: RwLock<bool>,
    transactions: Mutex<HashMap<TransactionId, ClientTransaction>>,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl ClientInner {
    fn rto(&self) -> Duration {
        Duration::from_nanos(self.rto_nanos.load(Ordering::Acquire))
    }

    /// Handler registered with the agent: forwards terminal events to the
    /// worker task that runs the retransmission policy.
    fn agent_handler(self: &Arc<Self>) -> Handler {
        let tx = self.event_tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(event);
        })
    }

    /// Insert a client transaction, rejecting duplicates and inserts on a
    /// closed client.
    fn put(&self, transaction: ClientTransaction) -> StunResult<()> {
        if *self.closed.read() {
            return Err(StunError::AgentClosed);
        }
        let mut transactions = self.transactions.lock();
        if transactions.contains_key(&transaction.id) {
            return Err(StunError::TransactionExists);
        }
        transactions.insert(transaction.id, transaction);
        Ok(())
    }

    fn remove(&self, id: TransactionId) {
        self.transactions.lock().remove(&id);
    }

    /// Retransmission policy. A success or an exhausted send budget is
    /// terminal; otherwise the request is re-registered and re-sent with
    /// a doubled interval. Failures on the retry path terminalize the
    /// transaction with the failing step's error.
    async fn handle_agent_event(self: &Arc<Self>, event: Event) {
        let id = event.transaction_id();
        let Some(mut transaction) = self.transactions.lock().remove(&id) else {
            // Resolved by another path, nothing to deliver.
            return;
        };
        let max_attempts = self.max_attempts.load(Ordering::Acquire);
        if event.is_success() || transaction.attempt + 1 >= max_attempts {
            (transaction.handler)(event);
            return;
        }

        transaction.attempt += 1;
        let handler = transaction.handler.clone();
        let raw = transaction.raw.clone();
        let deadline = transaction.next_timeout(self.clock.now());
        if let Err(error) = self.put(transaction) {
            handler(Event::Failure {
                transaction_id: id,
                error,
            });
            return;
        }
        if let Err(error) = self.agent.start(id, deadline, self.agent_handler()) {
            self.remove(id);
            handler(Event::Failure {
                transaction_id: id,
                error,
            });
            return;
        }
        if let Err(err) = self.conn.send(&raw).await {
            self.remove(id);
            // Resolve now instead of waiting out the deadline.
            let error = match self.agent.stop(id) {
                Err(stop_err) => StunError::Stop {
                    err: Box::new(stop_err),
                    cause: Box::new(err.into()),
                },
                Ok(()) => err.into(),
            };
            handler(Event::Failure {
                transaction_id: id,
                error,
            });
        }
    }
}

/// STUN client over an injectable transport.
///
/// Runs three background tasks: a reader feeding inbound messages to the
/// agent, a collector expiring deadlines, and a worker delivering agent
/// events through the retransmission policy. All are joined by
/// [`Client::close`].
pub struct Client {
    inner: Arc<ClientInner>,
    close_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Initialize a client and spawn its background tasks. Must be called
    /// within a tokio runtime. Fails with [`StunError::NoConnection`]
    /// when no transport is provided.
    pub fn new(options: ClientOptions) -> StunResult<Self> {
        let conn = options.connection.ok_or(StunError::NoConnection)?;
        let agent = options
            .agent
            .unwrap_or_else(|| Arc::new(Agent::new()) as Arc<dyn ClientAgent>);
        let clock = options
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let timeout_rate = if options.timeout_rate.is_zero() {
            DEFAULT_TIMEOUT_RATE
        } else {
            options.timeout_rate
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            agent,
            conn,
            clock,
            rto_nanos: AtomicU64::new(options.rto.as_nanos() as u64),
            max_attempts: AtomicU32::new(options.max_attempts),
            closed: RwLock::new(false),
            transactions: Mutex::new(HashMap::new()),
            event_tx,
        });
        let (close_tx, close_rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(read_until_closed(inner.clone(), close_rx.clone())),
            tokio::spawn(collect_until_closed(
                inner.clone(),
                close_rx.clone(),
                timeout_rate,
            )),
            tokio::spawn(process_events(inner.clone(), close_rx, event_rx)),
        ];

        Ok(Self {
            inner,
            close_tx,
            tasks: Mutex::new(tasks),
        })
    }

    /// Update the retransmission interval for transactions started after
    /// this call. In-flight transactions keep their snapshot.
    pub fn set_rto(&self, rto: Duration) {
        self.inner
            .rto_nanos
            .store(rto.as_nanos() as u64, Ordering::Release);
    }

    /// Register a transaction for `message` and write it to the
    /// transport. The handler eventually receives exactly one terminal
    /// [`Event`]. With no handler the message is an indication: it is
    /// written without transaction state.
    pub async fn start(&self, message: &Message, handler: Option<Handler>) -> StunResult<()> {
        if *self.inner.closed.read() {
            return Err(StunError::ClientClosed);
        }
        let registered = handler.is_some();
        if let Some(handler) = handler {
            let transaction = ClientTransaction {
                id: message.transaction_id,
                start: self.inner.clock.now(),
                rto: self.inner.rto(),
                attempt: 0,
                handler,
                raw: message.raw.to_vec(),
            };
            let deadline = transaction.next_timeout(transaction.start);
            let id = transaction.id;
            self.inner.put(transaction)?;
            if let Err(err) = self
                .inner
                .agent
                .start(id, deadline, self.inner.agent_handler())
            {
                self.inner.remove(id);
                return Err(err);
            }
        }
        if let Err(err) = self.inner.conn.send(&message.raw).await {
            if registered {
                self.inner.remove(message.transaction_id);
                // Resolve now instead of waiting out the deadline.
                if let Err(stop_err) = self.inner.agent.stop(message.transaction_id) {
                    return Err(StunError::Stop {
                        err: Box::new(stop_err),
                        cause: Box::new(err.into()),
                    });
                }
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Send `message` without registering a transaction.
    pub async fn indicate(&self, message: &Message) -> StunResult<()> {
        self.start(message, None).await
    }

    /// Start a transaction and wait for its terminal event.
    pub async fn request(&self, message: &Message) -> StunResult<Event> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let handler: Handler = Arc::new(move |event| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(event);
            }
        });
        self.start(message, Some(handler)).await?;
        // Every registered transaction resolves exactly once, so a
        // dropped sender means the delivery machinery is gone.
        rx.await.map_err(|_| StunError::ClientNotInitialized)
    }

    /// Shut down: close the agent (resolving pending transactions with
    /// [`StunError::AgentClosed`]), close the transport, stop and join
    /// the background tasks. A second call fails with
    /// [`StunError::ClientClosed`].
    pub async fn close(&self) -> StunResult<()> {
        {
            let mut closed = self.inner.closed.write();
            if *closed {
                return Err(StunError::ClientClosed);
            }
            *closed = true;
        }
        let agent_err = self.inner.agent.close().err();
        let conn_err = self.inner.conn.close().err().map(StunError::from);
        let _ = self.close_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        match (agent_err, conn_err) {
            (None, None) => Ok(()),
            (agent, connection) => Err(StunError::Close {
                agent: agent.map(Box::new),
                connection: connection.map(Box::new),
            }),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let mut closed = self.inner.closed.write();
        if *closed {
            return;
        }
        *closed = true;
        warn!("client dropped without close");
        let _ = self.inner.agent.close();
        let _ = self.inner.conn.close();
        let _ = self.close_tx.send(true);
    }
}

/// Reader task: decode inbound messages and hand them to the agent.
/// Undecodable datagrams are dropped so a hostile peer cannot kill the
/// client.
async fn read_until_closed(inner: Arc<ClientInner>, mut close_rx: watch::Receiver<bool>) {
    let mut buf = vec![0u8; INBOUND_BUFFER_SIZE];
    loop {
        let len = tokio::select! {
            _ = close_rx.changed() => return,
            received = inner.conn.recv(&mut buf) => match received {
                Ok(len) => len,
                Err(err) => {
                    debug!(error = %err, "transport read failed");
                    continue;
                }
            },
        };
        let mut message = Message::new();
        message.raw.clear();
        message.raw.extend_from_slice(&buf[..len]);
        match message.decode() {
            Ok(()) => {
                if let Err(StunError::AgentClosed) = inner.agent.process(message) {
                    return;
                }
                // Unmatched responses are benign.
            }
            Err(err) => debug!(error = %err, "dropping undecodable message"),
        }
    }
}

/// Collector task: tick at `rate` and expire transactions. Any collect
/// error besides a closed agent is an invariant violation.
async fn collect_until_closed(
    inner: Arc<ClientInner>,
    mut close_rx: watch::Receiver<bool>,
    rate: Duration,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + rate, rate);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = close_rx.changed() => return,
            _ = interval.tick() => match inner.agent.collect(inner.clock.now()) {
                Ok(()) | Err(StunError::AgentClosed) => {}
                Err(err) => panic!("collect failed: {err}"),
            },
        }
    }
}

/// Worker task: apply the retransmission policy to agent events. Drains
/// the queue on shutdown so events fired by the agent's close still reach
/// their handlers.
async fn process_events(
    inner: Arc<ClientInner>,
    mut close_rx: watch::Receiver<bool>,
    mut events: mpsc::UnboundedReceiver<Event>,
) {
    loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            event = events.recv() => match event {
                Some(event) => inner.handle_agent_event(event).await,
                None => return,
            },
        }
    }
    while let Ok(event) = events.try_recv() {
        inner.handle_agent_event(event).await;
    }
}
