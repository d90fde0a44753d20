use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use axum::extract::ws::WebSocketUpgrade;
use axum::http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderMap};
use axum::response::Response;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::pipeline::{Pipeline, PipelineBackend, PipelineProvider};
use crate::api::{ConnectError, McuMessage, MCU_TYPE_ATTACH, MCU_TYPE_DETACH, MCU_TYPE_ERROR};
use crate::config::{ConnectionSettings, McuSettings, PipelineSettings};
use crate::connection::{Connection, ConnectionError, ConnectionHandler};
use crate::ids::random_key;
use crate::registry::Registry;

/// Websocket subprotocol MCU backends must request.
pub const MCU_SUBPROTOCOL: &str = "kwmmcu-protocol";

const TRANSACTION_BYTES: usize = 9;

/// Backend connection. Control connections carry no bound value; attached
/// sessions are bound to the record of the attach that created them.
pub type McuConnection = Connection<Arc<AttachedRecord>>;

#[derive(Debug, Error)]
pub enum McuError {
    #[error("no MCU control connection")]
    NoControlConnection,
    #[error("unknown attach transaction")]
    UnknownTransaction,
    #[error("failed to send to MCU: {0}")]
    Send(#[from] ConnectionError),
    #[error("invalid MCU message: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Pending or claimed attach, keyed by its transaction.
pub struct AttachedRecord {
    pub transaction: String,
    pub plugin: String,
    pub handle: i64,
    pub when: Instant,
    pipeline: Weak<Pipeline>,
}

impl AttachedRecord {
    pub fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.pipeline.upgrade()
    }
}

#[derive(Default)]
struct ControlRing {
    connections: Vec<Arc<McuConnection>>,
    cursor: usize,
}

pub struct McuManager {
    self_ref: Weak<McuManager>,
    settings: McuSettings,
    pipeline_settings: PipelineSettings,
    connection_settings: ConnectionSettings,
    shutdown: CancellationToken,
    control: Mutex<ControlRing>,
    attached: Registry<String, Arc<AttachedRecord>>,
    connections: Registry<String, Arc<McuConnection>>,
    next_handle: AtomicI64,
    next_connection: AtomicU64,
}

impl McuManager {
    pub fn new(
        settings: McuSettings,
        pipeline_settings: PipelineSettings,
        connection_settings: ConnectionSettings,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            settings,
            pipeline_settings,
            connection_settings,
            shutdown,
            control: Mutex::new(ControlRing::default()),
            attached: Registry::new(),
            connections: Registry::new(),
            next_handle: AtomicI64::new(0),
            next_connection: AtomicU64::new(0),
        })
    }

    pub fn num_active(&self) -> usize {
        self.connections.len()
    }

    pub fn num_pending_attaches(&self) -> usize {
        self.attached.len()
    }

    /// Periodically drops attach records the MCU never picked up.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.settings.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.sweep();
            }
            debug!("mcu sweeper stopped");
        })
    }

    pub fn sweep(&self) {
        let expiration = self.settings.attach_expiration;
        let mut purged = 0usize;
        for (transaction, record) in self.attached.snapshot() {
            if record.when.elapsed() <= expiration {
                continue;
            }
            if self
                .attached
                .remove_if(&transaction, |current| {
                    Arc::ptr_eq(current, &record) && current.when.elapsed() > expiration
                })
                .is_some()
            {
                purged += 1;
            }
        }
        if purged > 0 {
            debug!(purged, "purged expired mcu attach records");
        }
    }

    /// Upgrades an MCU websocket. Without a transaction the connection joins
    /// the control ring; with one it becomes the session of that attach.
    pub fn handle_websocket(
        self: &Arc<Self>,
        transaction: Option<String>,
        headers: &HeaderMap,
        ws: WebSocketUpgrade,
    ) -> Result<Response, ConnectError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectError::ShuttingDown);
        }
        if !requests_subprotocol(headers, MCU_SUBPROTOCOL) {
            return Err(ConnectError::BadRequest("missing mcu subprotocol"));
        }
        let record = match transaction {
            Some(transaction) => Some(self.claim(&transaction)?),
            None => None,
        };

        let manager = Arc::clone(self);
        Ok(ws
            .protocols([MCU_SUBPROTOCOL])
            .max_message_size(self.connection_settings.max_message_size)
            .on_upgrade(move |socket| async move {
                let id = format!(
                    "mcu-{}",
                    manager.next_connection.fetch_add(1, Ordering::Relaxed) + 1
                );
                let (conn, outbound) =
                    McuConnection::new(id.clone(), manager.connection_settings.clone());
                if let Some(record) = record {
                    conn.bind(record);
                }
                manager.connections.insert(id, Arc::clone(&conn));
                let shutdown = manager.shutdown.child_token();
                conn.serve(socket, outbound, Arc::clone(&manager), shutdown)
                    .await;
            }))
    }

    /// Consumes the attach record for `transaction`. A transaction can be
    /// claimed once, and only while its pipeline is alive.
    pub fn claim(&self, transaction: &str) -> Result<Arc<AttachedRecord>, ConnectError> {
        let record = self.attached.pop(transaction).ok_or(ConnectError::NotFound)?;
        if record.pipeline().is_none() {
            debug!(transaction, "attach record outlived its pipeline");
            return Err(ConnectError::NotFound);
        }
        Ok(record)
    }

    fn next_control(&self) -> Option<Arc<McuConnection>> {
        let mut ring = self.control.lock();
        ring.connections.retain(|conn| !conn.is_closed());
        if ring.connections.is_empty() {
            return None;
        }
        let index = ring.cursor % ring.connections.len();
        ring.cursor = index + 1;
        Some(Arc::clone(&ring.connections[index]))
    }

    fn register_control(&self, conn: &Arc<McuConnection>) {
        self.control.lock().connections.push(Arc::clone(conn));
        let manager = self.self_ref.clone();
        conn.on_closed(move |closed| {
            if let Some(manager) = manager.upgrade() {
                manager
                    .control
                    .lock()
                    .connections
                    .retain(|conn| !std::ptr::eq(Arc::as_ptr(conn), closed));
            }
        });
        info!(connection_id = %conn.id(), "mcu control connection registered");
    }
}

impl PipelineBackend for McuManager {
    fn attach(&self, plugin: &str, handle: i64, pipeline: Weak<Pipeline>) -> Result<(), McuError> {
        let control = self.next_control().ok_or(McuError::NoControlConnection)?;
        let transaction = random_key(TRANSACTION_BYTES);
        self.attached.insert(
            transaction.clone(),
            Arc::new(AttachedRecord {
                transaction: transaction.clone(),
                plugin: plugin.to_string(),
                handle,
                when: Instant::now(),
                pipeline,
            }),
        );

        let message = McuMessage {
            kind: MCU_TYPE_ATTACH.to_string(),
            transaction: transaction.clone(),
            plugin: plugin.to_string(),
            handle_id: handle,
            data: None,
        };
        let manager = self.self_ref.clone();
        let pending = transaction.clone();
        let sent = control.send_transaction(
            &message,
            Box::new(move |payload| {
                let reply: McuMessage = serde_json::from_str(payload)?;
                if reply.kind == MCU_TYPE_ERROR {
                    if let Some(manager) = manager.upgrade() {
                        manager.attached.pop(&pending);
                    }
                    anyhow::bail!("mcu rejected attach {pending}");
                }
                Ok(())
            }),
        );
        if let Err(err) = sent {
            self.attached.pop(&transaction);
            return Err(McuError::Send(err));
        }
        debug!(
            connection_id = %control.id(),
            pipeline_handle = handle,
            transaction = %transaction,
            "mcu attach requested"
        );
        Ok(())
    }

    fn detach(&self, plugin: &str, handle: i64) -> Result<(), McuError> {
        let control = self.next_control().ok_or(McuError::NoControlConnection)?;
        control.send(&McuMessage {
            kind: MCU_TYPE_DETACH.to_string(),
            plugin: plugin.to_string(),
            handle_id: handle,
            ..McuMessage::default()
        })?;
        debug!(pipeline_handle = handle, "mcu detach requested");
        Ok(())
    }
}

impl PipelineProvider for McuManager {
    fn pipeline(&self, scope: &str, id: &str) -> Option<Arc<Pipeline>> {
        let backend: Arc<dyn PipelineBackend> = self.self_ref.upgrade()?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        Some(Pipeline::new(
            id,
            scope,
            handle,
            self.pipeline_settings.clone(),
            backend,
        ))
    }
}

impl ConnectionHandler<Arc<AttachedRecord>> for McuManager {
    type Error = McuError;

    fn on_connect(&self, conn: &Arc<McuConnection>) -> Result<(), McuError> {
        let Some(record) = conn.bound() else {
            self.register_control(conn);
            return Ok(());
        };
        let pipeline = record.pipeline().ok_or(McuError::UnknownTransaction)?;
        debug!(
            connection_id = %conn.id(),
            pipeline_handle = record.handle,
            "mcu attached session connected"
        );
        if let Err(err) = pipeline.on_backend_connect(Arc::clone(conn)) {
            warn!(pipeline_handle = record.handle, error = %err, "pipeline refused backend connection");
            conn.close();
        }
        Ok(())
    }

    fn on_text(&self, conn: &Arc<McuConnection>, payload: &str) -> Result<(), McuError> {
        let message: McuMessage = serde_json::from_str(payload)?;
        if let Some(callback) = conn.take_transaction(&message.transaction) {
            if let Err(err) = callback(payload) {
                warn!(connection_id = %conn.id(), error = %err, "mcu transaction failed");
            }
            return Ok(());
        }

        match conn.bound() {
            Some(record) => {
                let Some(pipeline) = record.pipeline() else {
                    trace!(connection_id = %conn.id(), "dropping text for released pipeline");
                    return Ok(());
                };
                if let Err(err) = pipeline.on_backend_text(conn, payload) {
                    warn!(pipeline_handle = record.handle, error = %err, "pipeline rejected backend text");
                }
            }
            None if message.kind == MCU_TYPE_ERROR => {
                warn!(connection_id = %conn.id(), payload, "mcu control error");
            }
            None => {
                debug!(connection_id = %conn.id(), kind = %message.kind, "unhandled mcu control message");
            }
        }
        Ok(())
    }

    fn on_error(&self, conn: &Arc<McuConnection>, err: McuError) -> Result<(), McuError> {
        warn!(connection_id = %conn.id(), error = %err, "mcu message error");
        Ok(())
    }

    fn on_disconnect(&self, conn: &Arc<McuConnection>) {
        self.connections
            .remove_if(conn.id(), |current| Arc::ptr_eq(current, conn));
        debug!(connection_id = %conn.id(), "mcu connection disconnected");
    }
}

fn requests_subprotocol(headers: &HeaderMap, protocol: &str) -> bool {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim() == protocol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use crate::mcu::{PipelineError, PipelineObserver};
    use axum::http::HeaderValue;
    use std::time::Duration;

    fn manager() -> Arc<McuManager> {
        McuManager::new(
            McuSettings::default(),
            PipelineSettings::default(),
            ConnectionSettings::default(),
            CancellationToken::new(),
        )
    }

    fn control(manager: &Arc<McuManager>, id: &str) -> (Arc<McuConnection>, Outbound) {
        let (conn, outbound) = McuConnection::new(id, ConnectionSettings::default());
        manager.on_connect(&conn).expect("control connect");
        (conn, outbound)
    }

    fn next_message(outbound: &mut Outbound) -> McuMessage {
        let payload = outbound.try_recv().expect("queued message");
        serde_json::from_str(&payload).expect("mcu message")
    }

    struct NoopObserver;

    impl PipelineObserver for NoopObserver {
        fn on_connect(&self, _pipeline: &Pipeline) -> Result<(), PipelineError> {
            Ok(())
        }

        fn on_text(&self, _pipeline: &Pipeline, _payload: &str) -> Result<(), PipelineError> {
            Ok(())
        }

        fn on_reset(&self, _pipeline: &Pipeline) {}
    }

    #[test_timeout::tokio_timeout_test]
    async fn attach_requires_a_control_connection() {
        let manager = manager();
        assert!(matches!(
            manager.attach("rtm-channel", 1, Weak::new()),
            Err(McuError::NoControlConnection)
        ));
        assert_eq!(manager.num_pending_attaches(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn attaches_rotate_over_control_connections() {
        let manager = manager();
        let (_a, mut a_out) = control(&manager, "a");
        let (b, mut b_out) = control(&manager, "b");

        manager.attach("rtm-channel", 1, Weak::new()).expect("attach");
        manager.attach("rtm-channel", 2, Weak::new()).expect("attach");
        manager.attach("rtm-channel", 3, Weak::new()).expect("attach");

        let first = next_message(&mut a_out);
        assert_eq!(first.kind, MCU_TYPE_ATTACH);
        assert_eq!(first.plugin, "rtm-channel");
        assert_eq!(first.handle_id, 1);
        assert!(!first.transaction.is_empty());
        assert_eq!(next_message(&mut b_out).handle_id, 2);
        assert_eq!(next_message(&mut a_out).handle_id, 3);

        b.close();
        manager.attach("rtm-channel", 4, Weak::new()).expect("attach");
        manager.attach("rtm-channel", 5, Weak::new()).expect("attach");
        assert_eq!(next_message(&mut a_out).handle_id, 4);
        assert_eq!(next_message(&mut a_out).handle_id, 5);
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejected_attach_drops_its_record() {
        let manager = manager();
        let (conn, mut outbound) = control(&manager, "a");
        manager.attach("rtm-channel", 7, Weak::new()).expect("attach");
        let request = next_message(&mut outbound);
        assert_eq!(manager.num_pending_attaches(), 1);

        let reply = serde_json::json!({ "type": "error", "transaction": request.transaction });
        manager
            .on_text(&conn, &reply.to_string())
            .expect("reply handled");
        assert_eq!(manager.num_pending_attaches(), 0);
        assert!(matches!(
            manager.claim(&request.transaction),
            Err(ConnectError::NotFound)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn claimed_session_connects_the_pipeline() {
        let manager = manager();
        let (_control, mut control_out) = control(&manager, "control");
        let pipeline = manager
            .pipeline("rtm-channel", "@room")
            .expect("pipeline");
        pipeline.connect(Arc::new(NoopObserver)).expect("connect");
        let request = next_message(&mut control_out);
        assert_eq!(request.handle_id, pipeline.handle());

        let record = manager.claim(&request.transaction).expect("claim");
        assert!(manager.claim(&request.transaction).is_err());

        let (session, mut session_out) = McuConnection::new("session", ConnectionSettings::default());
        session.bind(record);
        manager.on_connect(&session).expect("session connect");
        assert!(pipeline.is_connected());

        pipeline.send(&serde_json::json!({ "hello": "mcu" })).expect("send");
        assert_eq!(session_out.try_recv().as_deref(), Some("{\"hello\":\"mcu\"}"));

        pipeline.close().expect("close");
        let detach = next_message(&mut control_out);
        assert_eq!(detach.kind, MCU_TYPE_DETACH);
        assert_eq!(detach.handle_id, pipeline.handle());
        assert!(session.is_closed());
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn sweep_purges_unclaimed_attaches() {
        let manager = manager();
        let (_conn, _outbound) = control(&manager, "a");
        manager.attach("rtm-channel", 1, Weak::new()).expect("attach");

        tokio::time::advance(Duration::from_secs(10)).await;
        manager.sweep();
        assert_eq!(manager.num_pending_attaches(), 1);

        tokio::time::advance(Duration::from_secs(25)).await;
        manager.sweep();
        assert_eq!(manager.num_pending_attaches(), 0);
    }

    #[test_timeout::timeout]
    fn subprotocol_must_be_offered() {
        let mut headers = HeaderMap::new();
        assert!(!requests_subprotocol(&headers, MCU_SUBPROTOCOL));
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("chat, kwmmcu-protocol"),
        );
        assert!(requests_subprotocol(&headers, MCU_SUBPROTOCOL));
    }
}
