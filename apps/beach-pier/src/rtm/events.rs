use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

use super::manager::{RtmConnection, RtmManager, UserRecord};
use crate::api::{
    Envelope, Hello, PingPong, RtmError, SelfInfo, TransactionId, WebRtcMessage, TYPE_PING,
    TYPE_PONG, TYPE_WEBRTC,
};
use crate::connection::{ConnectionError, ConnectionHandler, Disconnect};
use crate::metrics::MetricEvent;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Reported to the client; the connection stays open.
    #[error(transparent)]
    Protocol(#[from] RtmError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("transaction reply failed: {0}")]
    Transaction(anyhow::Error),
}

impl RtmManager {
    fn on_ping(&self, conn: &Arc<RtmConnection>, payload: &str, id: u64) -> Result<(), HandlerError> {
        // Pings from connections without a user get no reply.
        let Some(user) = conn.bound() else {
            return Ok(());
        };
        let mut ping: PingPong = serde_json::from_str(payload)
            .map_err(|_| RtmError::bad_message("invalid ping", id))?;

        if let Some(refreshed) = self.authenticator().refresh_token(&user.auth()) {
            debug!(user_id = %user.id(), "injecting refreshed auth into pong");
            ping.insert("auth".to_string(), Value::String(refreshed.value.clone()));
            user.set_auth(refreshed);
        }
        ping.insert("type".to_string(), Value::String(TYPE_PONG.to_string()));
        conn.send(&ping)?;
        Ok(())
    }
}

impl ConnectionHandler<Arc<UserRecord>> for RtmManager {
    type Error = HandlerError;

    /// Registers the connection with its user, sharing an existing record
    /// when the user is already connected elsewhere, then says hello.
    fn on_connect(&self, conn: &Arc<RtmConnection>) -> Result<(), HandlerError> {
        debug!(connection_id = %conn.id(), "websocket connect");
        let mut self_info = None;
        if let Some(user) = conn.bound() {
            let mut first = false;
            let record = self.users.upsert(user.id().to_string(), |existing| match existing {
                Some(existing) => {
                    existing.add_connection(conn);
                    Arc::clone(existing)
                }
                None => {
                    user.add_connection(conn);
                    first = true;
                    Arc::clone(&user)
                }
            });
            if !Arc::ptr_eq(&record, &user) {
                conn.bind(Arc::clone(&record));
            }
            if first {
                debug!(user_id = %record.id(), "user is now active");
                self.metrics.record(MetricEvent::UserCreated);
            }
            self_info = Some(SelfInfo {
                id: record.id().to_string(),
                name: record.name(),
            });
        }

        conn.send(&Hello::hello(self_info))?;
        Ok(())
    }

    fn on_text(&self, conn: &Arc<RtmConnection>, payload: &str) -> Result<(), HandlerError> {
        let envelope: Envelope = serde_json::from_str(payload)
            .map_err(|_| RtmError::bad_message("invalid json", 0))?;
        if let Some(callback) = conn.take_transaction(&envelope.transaction_id()) {
            return callback(payload).map_err(HandlerError::Transaction);
        }

        trace!(connection_id = %conn.id(), kind = %envelope.kind, "rtm message");
        match envelope.kind.as_str() {
            TYPE_PING => self.on_ping(conn, payload, envelope.id),
            TYPE_WEBRTC => {
                let msg: WebRtcMessage = serde_json::from_str(payload)
                    .map_err(|_| RtmError::bad_message("invalid webrtc message", envelope.id))?;
                self.on_webrtc(conn, msg)
            }
            _ => Err(RtmError::bad_message("unknown type", envelope.id).into()),
        }
    }

    fn on_error(&self, conn: &Arc<RtmConnection>, err: HandlerError) -> Result<(), HandlerError> {
        match err {
            HandlerError::Protocol(err) => {
                debug!(connection_id = %conn.id(), error = %err, "rtm protocol error");
                conn.send(&err.reply())?;
                Ok(())
            }
            other => Err(other),
        }
    }

    fn on_before_disconnect(&self, _conn: &Arc<RtmConnection>, reason: &Disconnect) -> Option<String> {
        if !reason.is_clean() {
            return None;
        }
        serde_json::to_string(&Hello::goodbye()).ok()
    }

    fn on_disconnect(&self, conn: &Arc<RtmConnection>) {
        if let Some(user) = conn.bound() {
            if user.remove_connection(conn) {
                debug!(user_id = %user.id(), "user has no connections left");
            }
        }
        debug!(
            connection_id = %conn.id(),
            duration_ms = conn.duration().map(|d| d.as_millis() as u64),
            "websocket disconnect"
        );
    }
}
