//! Supervised link between a channel and an MCU backend session.
//!
//! A pipeline asks its backend to attach a plugin session; the backend later
//! hands over the websocket the MCU opened for it. Losing that connection, or
//! never receiving one, leads to a fixed-delay reconnect. Only one reconnect
//! is ever in flight, guarded by `connecting`.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{McuConnection, McuError};
use crate::config::PipelineSettings;
use crate::connection::ConnectionError;

pub const PIPELINE_MODE_MCU_FORWARD: &str = "mcu-forward";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is closed")]
    Closed,
    #[error("pipeline has no backend connection")]
    NotConnected,
    #[error("failed to decode pipeline payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Backend(#[from] McuError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Attach/detach half of the MCU protocol.
pub trait PipelineBackend: Send + Sync {
    /// Requests a backend session. Success only means the request went out;
    /// the connection arrives later through `Pipeline::on_backend_connect`.
    fn attach(&self, plugin: &str, handle: i64, pipeline: Weak<Pipeline>) -> Result<(), McuError>;

    fn detach(&self, plugin: &str, handle: i64) -> Result<(), McuError>;
}

/// Receives pipeline lifecycle events on behalf of the owning channel.
pub trait PipelineObserver: Send + Sync {
    fn on_connect(&self, pipeline: &Pipeline) -> Result<(), PipelineError>;

    fn on_text(&self, pipeline: &Pipeline, payload: &str) -> Result<(), PipelineError>;

    /// Called after a reconnect succeeded, never for the initial connect.
    fn on_reset(&self, pipeline: &Pipeline);
}

/// Hands out pipelines for a scope and id. `None` means traffic for that
/// id is delivered directly.
pub trait PipelineProvider: Send + Sync {
    fn pipeline(&self, scope: &str, id: &str) -> Option<Arc<Pipeline>>;
}

#[derive(Default)]
struct PipelineState {
    connecting: bool,
    closed: bool,
    connection: Option<Arc<McuConnection>>,
    observer: Option<Arc<dyn PipelineObserver>>,
    reconnector: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

pub struct Pipeline {
    id: String,
    plugin: String,
    handle: i64,
    settings: PipelineSettings,
    backend: Arc<dyn PipelineBackend>,
    state: Mutex<PipelineState>,
}

impl Pipeline {
    pub fn new(
        id: impl Into<String>,
        plugin: impl Into<String>,
        handle: i64,
        settings: PipelineSettings,
        backend: Arc<dyn PipelineBackend>,
    ) -> Arc<Self> {
        let pipeline = Arc::new(Self {
            id: id.into(),
            plugin: plugin.into(),
            handle,
            settings,
            backend,
            state: Mutex::new(PipelineState::default()),
        });
        debug!(
            pipeline_handle = handle,
            pipeline_id = %pipeline.id,
            plugin = %pipeline.plugin,
            "pipeline create"
        );
        pipeline
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn handle(&self) -> i64 {
        self.handle
    }

    pub fn mode(&self) -> &'static str {
        PIPELINE_MODE_MCU_FORWARD
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Stores the observer and requests the first backend session. A failed
    /// request is retried in the background; the watchdog starts either way.
    pub fn connect(self: &Arc<Self>, observer: Arc<dyn PipelineObserver>) -> Result<(), PipelineError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PipelineError::Closed);
            }
            state.observer = Some(observer);
        }

        match self
            .backend
            .attach(&self.plugin, self.handle, Arc::downgrade(self))
        {
            Ok(()) => debug!(pipeline_handle = self.handle, "pipeline control established"),
            Err(err) => {
                warn!(
                    pipeline_handle = self.handle,
                    error = %err,
                    "failed to establish pipeline control"
                );
                self.schedule_reconnect(&mut self.state.lock());
            }
        }
        self.restart_watchdog(&mut self.state.lock());
        Ok(())
    }

    /// Installs the backend connection the MCU opened for this pipeline.
    pub fn on_backend_connect(self: &Arc<Self>, conn: Arc<McuConnection>) -> Result<(), PipelineError> {
        let observer = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PipelineError::Closed);
            }
            state.connecting = false;
            state.connection = Some(Arc::clone(&conn));
            state.observer.clone()
        };

        let weak = Arc::downgrade(self);
        conn.on_closed(move |closed| {
            if let Some(pipeline) = weak.upgrade() {
                pipeline.on_backend_closed(closed);
            }
        });

        debug!(pipeline_handle = self.handle, connection_id = %conn.id(), "pipeline connect");
        match observer {
            Some(observer) => observer.on_connect(self),
            None => Ok(()),
        }
    }

    fn on_backend_closed(self: &Arc<Self>, conn: &McuConnection) {
        let mut state = self.state.lock();
        let current = state
            .connection
            .as_ref()
            .is_some_and(|active| std::ptr::eq(Arc::as_ptr(active), conn));
        if !current {
            return;
        }
        debug!(pipeline_handle = self.handle, "pipeline connection closed");
        if state.connecting || state.closed {
            return;
        }
        state.connection = None;
        self.schedule_reconnect(&mut state);
    }

    /// Routes text from the backend connection to the observer. Text from a
    /// connection that is no longer current is dropped.
    pub fn on_backend_text(&self, conn: &McuConnection, payload: &str) -> Result<(), PipelineError> {
        let observer = {
            let state = self.state.lock();
            let current = state
                .connection
                .as_ref()
                .is_some_and(|active| std::ptr::eq(Arc::as_ptr(active), conn));
            if !current || state.closed {
                return Ok(());
            }
            state.observer.clone()
        };
        match observer {
            Some(observer) => observer.on_text(self, payload),
            None => Ok(()),
        }
    }

    pub fn send<T>(&self, message: &T) -> Result<(), PipelineError>
    where
        T: Serialize + ?Sized,
    {
        let conn = {
            let state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.connection.clone()
        };
        match conn {
            Some(conn) => conn.send(message).map_err(PipelineError::from),
            None => {
                warn!(pipeline_handle = self.handle, "pipeline send without connection");
                Err(PipelineError::NotConnected)
            }
        }
    }

    /// Terminal. Stops both timers, detaches and closes the backend session.
    pub fn close(&self) -> Result<(), PipelineError> {
        let conn = {
            let mut state = self.state.lock();
            state.closed = true;
            state.observer = None;
            if let Some(handle) = state.reconnector.take() {
                handle.abort();
            }
            if let Some(handle) = state.watchdog.take() {
                handle.abort();
            }
            state.connection.take()
        };

        let Some(conn) = conn else {
            return Ok(());
        };
        let detached = self.backend.detach(&self.plugin, self.handle);
        if let Err(err) = &detached {
            warn!(pipeline_handle = self.handle, error = %err, "pipeline failed to detach");
        }
        conn.close();
        detached.map_err(PipelineError::from)
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut PipelineState) {
        if state.connecting || state.closed {
            return;
        }
        info!(pipeline_handle = self.handle, "pipeline scheduling control reestablish");
        if let Some(handle) = state.reconnector.take() {
            handle.abort();
        }
        state.connecting = true;

        let weak = Arc::downgrade(self);
        let delay = self.settings.reconnect_delay;
        state.reconnector = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(pipeline) = weak.upgrade() {
                pipeline.reconnect();
            }
        }));
    }

    fn reconnect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            // This task owns the handle; dropping it does not abort us.
            state.reconnector = None;
            if !state.connecting || state.closed {
                return;
            }
        }

        let attached = self
            .backend
            .attach(&self.plugin, self.handle, Arc::downgrade(self));

        let observer = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.connecting = false;
            match attached {
                Err(err) => {
                    warn!(
                        pipeline_handle = self.handle,
                        error = %err,
                        "pipeline failed to reestablish control"
                    );
                    self.schedule_reconnect(&mut state);
                    return;
                }
                Ok(()) => {
                    info!(pipeline_handle = self.handle, "pipeline control reestablished");
                    self.restart_watchdog(&mut state);
                    state.observer.clone()
                }
            }
        };

        if let Some(observer) = observer {
            observer.on_reset(self);
        }
    }

    fn restart_watchdog(self: &Arc<Self>, state: &mut PipelineState) {
        if let Some(handle) = state.watchdog.take() {
            handle.abort();
        }
        if state.closed {
            return;
        }

        let weak = Arc::downgrade(self);
        let timeout = self.settings.watchdog;
        state.watchdog = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeout).await;
                let Some(pipeline) = weak.upgrade() else {
                    return;
                };
                if !pipeline.on_watchdog() {
                    return;
                }
            }
        }));
    }

    /// Returns false once the pipeline is closed and the watchdog should stop.
    fn on_watchdog(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if state.connection.is_none() && !state.connecting {
            warn!(pipeline_handle = self.handle, "pipeline connection watcher timeout");
            self.schedule_reconnect(&mut state);
        }
        true
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(handle) = state.reconnector.take() {
            handle.abort();
        }
        if let Some(handle) = state.watchdog.take() {
            handle.abort();
        }
    }
}
