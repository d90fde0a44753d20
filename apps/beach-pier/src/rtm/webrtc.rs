use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, warn};

use super::events::HandlerError;
use super::manager::{RtmConnection, RtmManager, UserRecord};
use crate::api::{
    ChannelExtra, ChannelGroup, RtmError, WebRtcAccept, WebRtcMessage, WebRtcReply,
    SUBTYPE_WEBRTC_CALL, SUBTYPE_WEBRTC_HANGUP, SUBTYPE_WEBRTC_SIGNAL, TYPE_WEBRTC,
};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies the hash binding a pair of participants to a channel.
/// The key is per process, so hashes do not survive a restart.
#[derive(Clone)]
pub struct ChannelHasher {
    key: Key<HmacSha256>,
}

impl ChannelHasher {
    pub fn generate() -> Self {
        let mut key = Key::<HmacSha256>::default();
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    fn compute(&self, kind: &str, source: &str, target: &str, channel: &str) -> HmacSha256 {
        let mut mac = <HmacSha256 as KeyInit>::new(&self.key);
        let (first, second) = if source < target {
            (source, target)
        } else {
            (target, source)
        };
        for part in [kind, first, second, channel] {
            mac.update(&(part.len() as u32).to_le_bytes());
            mac.update(part.as_bytes());
        }
        mac
    }

    /// Base64 hash for `kind` messages between `source` and `target` in
    /// `channel`. Swapping source and target yields the same hash.
    pub fn sign(&self, kind: &str, source: &str, target: &str, channel: &str) -> String {
        let mac = self.compute(kind, source, target, channel);
        STANDARD.encode(mac.finalize().into_bytes())
    }

    pub fn verify(&self, hash: &[u8], kind: &str, source: &str, target: &str, channel: &str) -> bool {
        self.compute(kind, source, target, channel)
            .verify_slice(hash)
            .is_ok()
    }

    pub fn decode(hash: &str) -> Option<Vec<u8>> {
        STANDARD.decode(hash).ok()
    }
}

impl RtmManager {
    pub(super) fn on_webrtc(
        &self,
        conn: &Arc<RtmConnection>,
        msg: WebRtcMessage,
    ) -> Result<(), HandlerError> {
        let user = conn
            .bound()
            .ok_or_else(|| RtmError::bad_message("connection has no user", msg.id))?;
        if !msg.source.is_empty() {
            return Err(RtmError::bad_message("source must be empty", msg.id).into());
        }

        match msg.subtype.as_str() {
            SUBTYPE_WEBRTC_CALL if msg.initiator && !msg.group.is_empty() => {
                self.on_group_join(conn, &user, msg)
            }
            SUBTYPE_WEBRTC_CALL => self.on_webrtc_call(conn, &user, msg),
            SUBTYPE_WEBRTC_SIGNAL | SUBTYPE_WEBRTC_HANGUP => self.on_webrtc_signal(&user, msg),
            _ => Err(RtmError::bad_message("unknown subtype", msg.id).into()),
        }
    }

    fn on_webrtc_call(
        &self,
        conn: &Arc<RtmConnection>,
        user: &UserRecord,
        mut msg: WebRtcMessage,
    ) -> Result<(), HandlerError> {
        let reply_to = msg.id;
        if msg.target.is_empty() {
            return Err(RtmError::bad_message("target is empty", reply_to).into());
        }
        if msg.target == user.id() {
            return Err(RtmError::bad_message("target same as source", reply_to).into());
        }
        if msg.state.is_empty() {
            return Err(RtmError::bad_message("state is empty", reply_to).into());
        }

        if msg.initiator {
            if !msg.channel.is_empty() || !msg.hash.is_empty() {
                return Err(
                    RtmError::bad_message("channel and hash must be empty", reply_to).into(),
                );
            }
            if msg.data.is_some() {
                return Err(RtmError::bad_message("data must be empty", reply_to).into());
            }

            let channel = self.create_random_channel();
            channel
                .add(user.id(), conn)
                .map_err(|err| RtmError::bad_message(err.to_string(), reply_to))?;
            let hash = self
                .hasher()
                .sign(&msg.kind, user.id(), &msg.target, channel.id());

            let mut reply = WebRtcReply::channel(channel.id());
            reply.reply_to = reply_to;
            reply.hash = hash.clone();
            if let Err(err) = conn.send(&reply) {
                warn!(connection_id = %conn.id(), error = %err, "failed to send channel reply");
            }

            msg.source = user.id().to_string();
            msg.channel = channel.id().to_string();
            msg.hash = hash;
            msg.id = 0;
            let targets = self
                .lookup_connections_by_user_id(&msg.target)
                .ok_or_else(|| RtmError::no_session_for_user("target not found", reply_to))?;
            debug!(
                user_id = %user.id(),
                target = %msg.target,
                channel_id = %channel.id(),
                connections = targets.len(),
                "webrtc call request"
            );
            for target in targets {
                if let Err(err) = target.send(&msg) {
                    warn!(connection_id = %target.id(), error = %err, "failed to send call");
                }
            }
            return Ok(());
        }

        let Some(data) = msg.data.clone() else {
            return Err(RtmError::bad_message("channel, hash or data is empty", reply_to).into());
        };
        if msg.channel.is_empty() || msg.hash.is_empty() {
            return Err(RtmError::bad_message("channel, hash or data is empty", reply_to).into());
        }
        let channel = self
            .channel(&msg.channel)
            .ok_or_else(|| RtmError::bad_message("channel not found", reply_to))?;
        channel.check_webrtc_message(self.hasher(), user.id(), &msg)?;
        let accept: WebRtcAccept = serde_json::from_value(data)
            .map_err(|_| RtmError::bad_message("invalid call response data", reply_to))?;

        if accept.accept {
            channel
                .add(user.id(), conn)
                .map_err(|err| RtmError::bad_message(err.to_string(), reply_to))?;
        }
        debug!(
            user_id = %user.id(),
            channel_id = %channel.id(),
            accept = accept.accept,
            state = %accept.state,
            "webrtc call response"
        );

        // Other devices of the responder stop ringing.
        let cleared = WebRtcMessage {
            kind: TYPE_WEBRTC.to_string(),
            subtype: SUBTYPE_WEBRTC_CALL.to_string(),
            initiator: true,
            channel: msg.channel.clone(),
            ..WebRtcMessage::default()
        };
        for other in user.connections() {
            if Arc::ptr_eq(&other, conn) {
                continue;
            }
            if let Err(err) = other.send(&cleared) {
                warn!(connection_id = %other.id(), error = %err, "failed to clear call");
            }
        }

        let target = msg.target.clone();
        channel.forward(user.id(), &target, None, msg)?;
        Ok(())
    }

    fn on_group_join(
        &self,
        conn: &Arc<RtmConnection>,
        user: &UserRecord,
        msg: WebRtcMessage,
    ) -> Result<(), HandlerError> {
        let reply_to = msg.id;
        if !msg.channel.is_empty() || !msg.hash.is_empty() {
            return Err(RtmError::bad_message("channel and hash must be empty", reply_to).into());
        }
        if !msg.target.is_empty() && msg.target != msg.group {
            return Err(RtmError::bad_message("target must match group", reply_to).into());
        }

        let channel = self
            .group_channel(&msg.group)
            .map_err(|err| RtmError::bad_message(err.to_string(), reply_to))?;
        channel
            .add(user.id(), conn)
            .map_err(|err| RtmError::bad_message(err.to_string(), reply_to))?;

        let mut reply = WebRtcReply::channel(channel.id());
        reply.reply_to = reply_to;
        reply.hash = self
            .hasher()
            .sign(&msg.kind, user.id(), &msg.group, channel.id());
        reply.group = msg.group.clone();
        reply.data = Some(ChannelExtra {
            pipeline: channel.pipeline_extra(),
            group: Some(ChannelGroup {
                group: msg.group.clone(),
                members: channel.members(),
                reset: false,
            }),
            replaced: false,
        });
        debug!(user_id = %user.id(), channel_id = %channel.id(), "webrtc group join");
        conn.send(&reply)?;
        Ok(())
    }

    fn on_webrtc_signal(
        &self,
        user: &UserRecord,
        mut msg: WebRtcMessage,
    ) -> Result<(), HandlerError> {
        let reply_to = msg.id;
        if msg.state.is_empty() {
            return Err(RtmError::bad_message("state is empty", reply_to).into());
        }
        if msg.channel.is_empty() || msg.hash.is_empty() || msg.data.is_none() {
            return Err(RtmError::bad_message("channel, hash or data is empty", reply_to).into());
        }
        let channel = self
            .channel(&msg.channel)
            .ok_or_else(|| RtmError::bad_message("channel not found", reply_to))?;
        channel.check_webrtc_message(self.hasher(), user.id(), &msg)?;

        let target = msg.target.clone();
        let (target_conn, found) = channel.get(&target);
        if msg.subtype == SUBTYPE_WEBRTC_HANGUP {
            channel.remove(user.id());
            debug!(user_id = %user.id(), channel_id = %channel.id(), "webrtc hangup");
            if !found {
                // The target never joined, so every device it has may ring.
                msg.source = user.id().to_string();
                msg.id = 0;
                let targets = self
                    .lookup_connections_by_user_id(&target)
                    .ok_or_else(|| RtmError::no_session_for_user("target not found", reply_to))?;
                for target in targets {
                    if let Err(err) = target.send(&msg) {
                        warn!(connection_id = %target.id(), error = %err, "failed to send hangup");
                    }
                }
                return Ok(());
            }
        }

        if !found {
            return Err(RtmError::no_session_for_user("target not found", reply_to).into());
        }
        channel.forward(user.id(), &target, target_conn.as_ref(), msg)?;
        Ok(())
    }
}
