//! Websocket connection with a bounded outbound queue and a read/write pump
//! pair. The bound slot carries whatever session state the owning manager
//! attaches (a user record for RTM clients, an attach record for MCU
//! sessions).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::api::TransactionId;
use crate::config::ConnectionSettings;

/// Outstanding pings tolerated before the peer counts as unresponsive.
const MAX_PENDING_PINGS: usize = 5;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("websocket transport error: {0}")]
    Transport(#[from] axum::Error),
    #[error("websocket write timed out")]
    WriteTimeout,
    #[error("no pong received before the read deadline")]
    ReadTimeout,
    #[error("handler error: {0}")]
    Handler(Box<dyn std::error::Error + Send + Sync>),
}

pub type TransactionCallback = Box<dyn FnOnce(&str) -> anyhow::Result<()> + Send>;

type ClosedCallback<B> = Box<dyn FnOnce(&Connection<B>) + Send>;

/// Reason the write pump stopped.
#[derive(Debug)]
pub enum Disconnect {
    /// Owning context was cancelled.
    Shutdown,
    /// The outbound queue was closed by `Connection::close`.
    Closed,
    /// Too many pings went unanswered.
    Unresponsive,
    Failed(ConnectionError),
}

impl Disconnect {
    pub fn is_clean(&self) -> bool {
        matches!(self, Disconnect::Shutdown | Disconnect::Closed)
    }
}

/// Callbacks a manager provides for the connections it serves.
pub trait ConnectionHandler<B>: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn on_connect(&self, conn: &Arc<Connection<B>>) -> Result<(), Self::Error>;

    fn on_text(&self, conn: &Arc<Connection<B>>, payload: &str) -> Result<(), Self::Error>;

    /// Returning `Ok` keeps the connection open; an error terminates it.
    fn on_error(&self, _conn: &Arc<Connection<B>>, err: Self::Error) -> Result<(), Self::Error> {
        Err(err)
    }

    /// Final text frame to write before the close frame, if any.
    fn on_before_disconnect(&self, _conn: &Arc<Connection<B>>, _reason: &Disconnect) -> Option<String> {
        None
    }

    fn on_disconnect(&self, conn: &Arc<Connection<B>>);
}

/// Receiving half of a connection's outbound queue. Consumed by the write
/// pump, or read directly in tests.
pub struct Outbound {
    rx: mpsc::Receiver<String>,
}

impl Outbound {
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

struct ConnectionState<B> {
    closed: bool,
    sender: Option<mpsc::Sender<String>>,
    on_closed: Vec<ClosedCallback<B>>,
    duration: Option<Duration>,
}

pub struct Connection<B> {
    id: String,
    settings: ConnectionSettings,
    started: Instant,
    state: Mutex<ConnectionState<B>>,
    bound: RwLock<Option<B>>,
    transactions: Mutex<HashMap<String, TransactionCallback>>,
    pending_pings: Mutex<VecDeque<u64>>,
    /// Why the read side gave up, reported by the write pump once the queue
    /// drains.
    failure: Mutex<Option<Disconnect>>,
    closed: CancellationToken,
}

impl<B> fmt::Debug for Connection<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.state.lock().closed)
            .finish()
    }
}

impl<B> Connection<B>
where
    B: Clone + Send + Sync + 'static,
{
    pub fn new(id: impl Into<String>, settings: ConnectionSettings) -> (Arc<Self>, Outbound) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let conn = Arc::new(Self {
            id: id.into(),
            settings,
            started: Instant::now(),
            state: Mutex::new(ConnectionState {
                closed: false,
                sender: Some(tx),
                on_closed: Vec::new(),
                duration: None,
            }),
            bound: RwLock::new(None),
            transactions: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(VecDeque::with_capacity(MAX_PENDING_PINGS)),
            failure: Mutex::new(None),
            closed: CancellationToken::new(),
        });
        (conn, Outbound { rx })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Lifetime of the connection, available once it is closed.
    pub fn duration(&self) -> Option<Duration> {
        self.state.lock().duration
    }

    pub fn bind(&self, value: B) {
        *self.bound.write() = Some(value);
    }

    pub fn bound(&self) -> Option<B> {
        self.bound.read().clone()
    }

    /// Serializes `message` and queues it without blocking.
    pub fn send<T>(&self, message: &T) -> Result<(), ConnectionError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_string(message)?;
        self.raw_send(payload)
    }

    /// Queues an already encoded text payload.
    pub fn raw_send(&self, payload: String) -> Result<(), ConnectionError> {
        let state = self.state.lock();
        let sender = match (&state.sender, state.closed) {
            (Some(sender), false) => sender,
            _ => return Err(ConnectionError::Closed),
        };
        match sender.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %self.id, "outbound queue full; dropping message");
                Err(ConnectionError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(ConnectionError::Closed),
        }
    }

    /// Like `send`, but routes the next inbound message carrying the same
    /// transaction id to `callback`.
    pub fn send_transaction<T>(
        &self,
        message: &T,
        callback: TransactionCallback,
    ) -> Result<(), ConnectionError>
    where
        T: Serialize + TransactionId + ?Sized,
    {
        let transaction = message.transaction_id();
        if !transaction.is_empty() {
            self.transactions.lock().insert(transaction.clone(), callback);
        }
        let result = self.send(message);
        if result.is_err() && !transaction.is_empty() {
            self.transactions.lock().remove(&transaction);
        }
        result
    }

    /// Removes and returns the callback registered for `transaction`.
    pub fn take_transaction(&self, transaction: &str) -> Option<TransactionCallback> {
        if transaction.is_empty() {
            return None;
        }
        self.transactions.lock().remove(transaction)
    }

    /// Registers `callback` to run once the connection closes. Runs it
    /// immediately when the connection is already closed.
    pub fn on_closed<F>(&self, callback: F)
    where
        F: FnOnce(&Connection<B>) + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if !state.closed {
                state.on_closed.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    /// Closes the outbound queue, which stops the write pump and with it the
    /// socket. Safe to call any number of times.
    pub fn close(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.sender = None;
            state.duration = Some(self.started.elapsed());
            std::mem::take(&mut state.on_closed)
        };
        self.closed.cancel();
        self.transactions.lock().clear();
        debug!(connection_id = %self.id, "connection closed");

        for callback in callbacks {
            callback(self);
        }
    }

    /// Closes the connection because its read side failed. The write pump
    /// then ends with the matching unclean reason instead of `Closed`.
    fn fail(&self, err: ConnectionError) {
        let reason = match err {
            ConnectionError::ReadTimeout => Disconnect::Unresponsive,
            err => Disconnect::Failed(err),
        };
        self.failure.lock().get_or_insert(reason);
        self.close();
    }

    /// Reason for an outbound queue that ended.
    fn closed_reason(&self) -> Disconnect {
        self.failure.lock().take().unwrap_or(Disconnect::Closed)
    }

    /// Runs both pumps until the connection ends. Returns after the close
    /// cascade completed and the handler saw `on_disconnect`.
    pub async fn serve<H>(
        self: Arc<Self>,
        socket: WebSocket,
        outbound: Outbound,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) where
        H: ConnectionHandler<B>,
    {
        let (sink, stream) = socket.split();
        let writer = tokio::spawn(Arc::clone(&self).write_pump(
            sink,
            outbound,
            Arc::clone(&handler),
            shutdown.clone(),
        ));

        match self.read_pump(stream, handler.as_ref(), &shutdown).await {
            Ok(()) => self.close(),
            Err(err) => {
                debug!(connection_id = %self.id, error = %err, "read pump ended with error");
                self.fail(err);
            }
        }
        handler.on_disconnect(&self);

        match writer.await {
            Ok(Disconnect::Failed(err)) => {
                debug!(connection_id = %self.id, error = %err, "write pump ended with error")
            }
            Ok(reason) => trace!(connection_id = %self.id, ?reason, "write pump finished"),
            Err(err) => warn!(connection_id = %self.id, error = %err, "write pump panicked"),
        }
    }

    async fn read_pump<H>(
        self: &Arc<Self>,
        mut stream: SplitStream<WebSocket>,
        handler: &H,
        shutdown: &CancellationToken,
    ) -> Result<(), ConnectionError>
    where
        H: ConnectionHandler<B>,
    {
        if let Err(err) = handler.on_connect(self) {
            warn!(connection_id = %self.id, error = %err, "connect handler failed");
        }

        let mut deadline = Instant::now() + self.settings.pong_wait;
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = self.closed.cancelled() => return Ok(()),
                next = timeout_at(deadline, stream.next()) => next,
            };
            let frame = match next {
                Err(_) => return Err(ConnectionError::ReadTimeout),
                Ok(None) => return Ok(()),
                Ok(Some(Err(err))) => return Err(ConnectionError::Transport(err)),
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Message::Text(text) => {
                    trace!(connection_id = %self.id, bytes = text.len(), "text frame received");
                    if let Err(err) = handler.on_text(self, &text) {
                        handler
                            .on_error(self, err)
                            .map_err(|err| ConnectionError::Handler(Box::new(err)))?;
                    }
                }
                Message::Pong(payload) => {
                    if self.accept_pong(&payload) {
                        deadline = Instant::now() + self.settings.pong_wait;
                    }
                }
                Message::Close(_) => return Ok(()),
                // Answered by the websocket layer.
                Message::Ping(_) => {}
                Message::Binary(_) => {
                    warn!(connection_id = %self.id, "ignoring unsupported binary frame");
                }
            }
        }
    }

    async fn write_pump<H>(
        self: Arc<Self>,
        mut sink: SplitSink<WebSocket, Message>,
        mut outbound: Outbound,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) -> Disconnect
    where
        H: ConnectionHandler<B>,
    {
        let period = self.settings.ping_period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sequence = 0u64;

        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Disconnect::Shutdown,
                payload = outbound.recv() => match payload {
                    Some(payload) => {
                        if let Err(err) = self.write_frame(&mut sink, Message::Text(payload)).await {
                            break Disconnect::Failed(err);
                        }
                    }
                    None => break self.closed_reason(),
                },
                _ = ticker.tick() => {
                    sequence += 1;
                    if !self.register_ping(sequence) {
                        debug!(connection_id = %self.id, "ping still pending");
                        break Disconnect::Unresponsive;
                    }
                    let payload = sequence.to_le_bytes().to_vec();
                    if let Err(err) = self.write_frame(&mut sink, Message::Ping(payload)).await {
                        break Disconnect::Failed(err);
                    }
                }
            }
        };

        if let Some(goodbye) = handler.on_before_disconnect(&self, &reason) {
            if let Err(err) = self.write_frame(&mut sink, Message::Text(goodbye)).await {
                trace!(connection_id = %self.id, error = %err, "goodbye write failed");
            }
        }
        let close = Message::Close(Some(CloseFrame {
            code: close_code::AWAY,
            reason: "".into(),
        }));
        if let Err(err) = self.write_frame(&mut sink, close).await {
            trace!(connection_id = %self.id, error = %err, "close frame write failed");
        }
        let _ = sink.close().await;
        self.close();
        reason
    }

    async fn write_frame(
        &self,
        sink: &mut SplitSink<WebSocket, Message>,
        frame: Message,
    ) -> Result<(), ConnectionError> {
        match timeout(self.settings.write_wait, sink.send(frame)).await {
            Ok(result) => result.map_err(ConnectionError::from),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    fn register_ping(&self, sequence: u64) -> bool {
        let mut pending = self.pending_pings.lock();
        if pending.len() >= MAX_PENDING_PINGS {
            return false;
        }
        pending.push_back(sequence);
        true
    }

    /// Only a pong echoing the most recent outstanding ping refreshes the
    /// read deadline. Older pending pings are discarded either way.
    fn accept_pong(&self, payload: &[u8]) -> bool {
        let Ok(bytes) = <[u8; 8]>::try_from(payload) else {
            return false;
        };
        let latest = {
            let mut pending = self.pending_pings.lock();
            let latest = pending.back().copied();
            pending.clear();
            latest
        };
        latest == Some(u64::from_le_bytes(bytes))
    }
}
