use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::manager::RtmConnection;
use super::webrtc::ChannelHasher;
use crate::api::{ChannelExtra, ChannelPipeline, RtmError, WebRtcMessage, WebRtcReply};
use crate::connection::ConnectionError;
use crate::mcu::{Pipeline, PipelineError, PipelineObserver};
use crate::metrics::{InstanceMetrics, MetricEvent};

/// Prefix of ad hoc 1:1 channels.
pub const CHANNEL_PREFIX_RANDOM: &str = "*";
/// Prefix of named group channels.
pub const CHANNEL_PREFIX_GROUP: &str = "@";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("id already exists: {0}")]
    AlreadyExists(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOp {
    Add,
    Remove,
    Reset,
}

/// Decides what happens to the connection displaced by `Channel::add`.
/// Runs synchronously while the channel's membership lock is held, so it
/// must not call back into the channel.
pub trait ReplacePolicy: Send + Sync {
    fn on_replace(
        &self,
        channel_id: &str,
        member: &str,
        old: &Arc<RtmConnection>,
        new: &Arc<RtmConnection>,
    );
}

/// Notified on a spawned task after each membership change.
pub trait MembershipObserver: Send + Sync {
    fn after_membership_change(&self, channel: &Channel, op: ChannelOp, member: &str);
}

/// Notified on a spawned task after the channel's pipeline was reset.
pub trait ResetObserver: Send + Sync {
    fn after_reset(&self, channel: &Channel);
}

/// Marks a channel as special. Special channels stay alive until their
/// last member left.
#[derive(Clone)]
pub struct ChannelConfig {
    pub group: String,
    pub replace: Option<Arc<dyn ReplacePolicy>>,
    pub membership: Option<Arc<dyn MembershipObserver>>,
    pub reset: Option<Arc<dyn ResetObserver>>,
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("group", &self.group)
            .field("replace", &self.replace.is_some())
            .field("membership", &self.membership.is_some())
            .field("reset", &self.reset.is_some())
            .finish()
    }
}

#[derive(Default)]
struct ChannelState {
    closed: bool,
    members: HashMap<String, Arc<RtmConnection>>,
}

impl ChannelState {
    fn can_be_cleaned_up(&self, special: bool) -> bool {
        if special {
            self.members.is_empty()
        } else {
            // Only pairs are formed, so a lone member can be orphaned.
            self.members.len() <= 1
        }
    }
}

pub struct Channel {
    id: String,
    created: Instant,
    config: Option<ChannelConfig>,
    pipeline: Option<Arc<Pipeline>>,
    metrics: InstanceMetrics,
    state: RwLock<ChannelState>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("pipeline", &self.pipeline.as_ref().map(|p| p.handle()))
            .finish()
    }
}

impl Channel {
    /// Creates the channel and, when a pipeline is given, starts connecting
    /// it with the channel as observer.
    pub fn new(
        id: impl Into<String>,
        config: Option<ChannelConfig>,
        pipeline: Option<Arc<Pipeline>>,
        metrics: InstanceMetrics,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            id: id.into(),
            created: Instant::now(),
            config,
            pipeline,
            metrics,
            state: RwLock::new(ChannelState::default()),
        });
        debug!(channel_id = %channel.id, "channel create");
        channel.metrics.record(MetricEvent::ChannelCreated);

        if let Some(pipeline) = &channel.pipeline {
            let bridge = Arc::new(ChannelPipelineBridge {
                channel: Arc::downgrade(&channel),
            });
            if let Err(err) = pipeline.connect(bridge) {
                warn!(channel_id = %channel.id, error = %err, "channel pipeline connect failed");
            }
        }
        channel
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn group(&self) -> Option<&str> {
        self.config.as_ref().map(|config| config.group.as_str())
    }

    pub fn pipeline(&self) -> Option<&Arc<Pipeline>> {
        self.pipeline.as_ref()
    }

    pub fn pipeline_extra(&self) -> Option<ChannelPipeline> {
        self.pipeline.as_ref().map(|pipeline| ChannelPipeline {
            pipeline: pipeline.id().to_string(),
            mode: pipeline.mode().to_string(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Adds `conn` as `member`. A different connection already holding the
    /// id is handed to the replace policy, or the add fails without one.
    pub fn add(self: &Arc<Self>, member: &str, conn: &Arc<RtmConnection>) -> Result<(), ChannelError> {
        {
            let mut state = self.state.write();
            if state.closed {
                return Err(ChannelError::Closed);
            }
            if let Some(existing) = state.members.get(member) {
                if Arc::ptr_eq(existing, conn) {
                    return Ok(());
                }
                let Some(replace) = self.config.as_ref().and_then(|c| c.replace.as_ref()) else {
                    return Err(ChannelError::AlreadyExists(member.to_string()));
                };
                debug!(channel_id = %self.id, member, "channel replace");
                replace.on_replace(&self.id, member, existing, conn);
            }
            state.members.insert(member.to_string(), Arc::clone(conn));
        }

        let channel = Arc::downgrade(self);
        let removed = member.to_string();
        conn.on_closed(move |closed| {
            if let Some(channel) = channel.upgrade() {
                channel.remove_exact(&removed, closed);
            }
        });

        debug!(channel_id = %self.id, member, connection_id = %conn.id(), "channel add");
        self.metrics.record(MetricEvent::MemberAdded);
        self.notify(ChannelOp::Add, member);
        Ok(())
    }

    /// Removes whatever connection holds `member`.
    pub fn remove(self: &Arc<Self>, member: &str) -> bool {
        let removed = self.state.write().members.remove(member).is_some();
        if removed {
            self.after_remove(member);
        }
        removed
    }

    /// Removes `member` only while it is still held by `conn`, so a closing
    /// connection never evicts its replacement.
    fn remove_exact(self: &Arc<Self>, member: &str, conn: &RtmConnection) {
        let removed = {
            let mut state = self.state.write();
            let current = state
                .members
                .get(member)
                .is_some_and(|existing| std::ptr::eq(Arc::as_ptr(existing), conn));
            current && state.members.remove(member).is_some()
        };
        if removed {
            self.after_remove(member);
        }
    }

    fn after_remove(self: &Arc<Self>, member: &str) {
        debug!(channel_id = %self.id, member, "channel remove");
        self.metrics.record(MetricEvent::MemberRemoved);
        self.notify(ChannelOp::Remove, member);
    }

    fn notify(self: &Arc<Self>, op: ChannelOp, member: &str) {
        let Some(observer) = self.config.as_ref().and_then(|c| c.membership.clone()) else {
            return;
        };
        let channel = Arc::clone(self);
        let member = member.to_string();
        tokio::spawn(async move {
            observer.after_membership_change(&channel, op, &member);
        });
    }

    /// Looks up a direct member. Reports `found` for every id while a
    /// pipeline is attached, since the pipeline routes ids it alone knows.
    pub fn get(&self, member: &str) -> (Option<Arc<RtmConnection>>, bool) {
        let conn = self.state.read().members.get(member).cloned();
        let found = conn.is_some() || self.pipeline.is_some();
        (conn, found)
    }

    pub fn size(&self) -> usize {
        self.state.read().members.len()
    }

    /// Sorted member ids.
    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.state.read().members.keys().cloned().collect();
        members.sort();
        members
    }

    /// Members with their connections, sorted by id.
    pub fn connections(&self) -> Vec<(String, Arc<RtmConnection>)> {
        let mut members: Vec<_> = self
            .state
            .read()
            .members
            .iter()
            .map(|(id, conn)| (id.clone(), Arc::clone(conn)))
            .collect();
        members.sort_by(|a, b| a.0.cmp(&b.0));
        members
    }

    pub fn can_be_cleaned_up(&self) -> bool {
        self.state.read().can_be_cleaned_up(self.config.is_some())
    }

    /// Closes the channel if it is still eligible. Returns false when the
    /// membership changed since the caller checked.
    pub fn cleanup(&self) -> bool {
        let size = {
            let mut state = self.state.write();
            if state.closed || !state.can_be_cleaned_up(self.config.is_some()) {
                debug!(channel_id = %self.id, "channel cleanup rejected");
                return false;
            }
            state.closed = true;
            state.members.len()
        };

        if let Some(pipeline) = self.pipeline.clone() {
            tokio::spawn(async move {
                if let Err(err) = pipeline.close() {
                    debug!(pipeline_handle = pipeline.handle(), error = %err, "pipeline close failed");
                }
            });
        }
        debug!(channel_id = %self.id, connections = size, "channel cleaned up");
        self.metrics.record(MetricEvent::ChannelCleanedUp);
        true
    }

    /// Sends `msg` from `source` to `target`. With a pipeline attached the
    /// message always goes to the backend; otherwise to `hint` or the member
    /// holding `target`.
    pub fn forward(
        &self,
        source: &str,
        target: &str,
        hint: Option<&Arc<RtmConnection>>,
        mut msg: WebRtcMessage,
    ) -> Result<(), RtmError> {
        msg.source = source.to_string();
        let reply_to = msg.id;

        if let Some(pipeline) = &self.pipeline {
            if let Err(err) = pipeline.send(&msg) {
                warn!(channel_id = %self.id, error = %err, "channel pipeline send failed");
            }
            return Ok(());
        }

        let conn = match hint {
            Some(conn) => Some(Arc::clone(conn)),
            None => self.get(target).0,
        };
        let conn =
            conn.ok_or_else(|| RtmError::no_session_for_user("target not found", reply_to))?;

        msg.id = 0;
        send_logged(&self.id, &conn, &msg)
            .map_err(|_| RtmError::no_session_for_user("target not reachable", reply_to))
    }

    /// Delivers a message the pipeline produced to its target member.
    fn deliver(&self, msg: &WebRtcMessage) -> Result<(), RtmError> {
        if msg.source.is_empty() || msg.target.is_empty() {
            return Err(RtmError::no_session_for_user("invalid target", msg.id));
        }
        let conn = self
            .state
            .read()
            .members
            .get(&msg.target)
            .cloned()
            .ok_or_else(|| RtmError::no_session_for_user("target not found", msg.id))?;
        send_logged(&self.id, &conn, msg)
            .map_err(|_| RtmError::no_session_for_user("target not reachable", msg.id))
    }

    /// Validates group scope and the channel hash of a message sent by
    /// `source` into this channel.
    pub fn check_webrtc_message(
        &self,
        hasher: &ChannelHasher,
        source: &str,
        msg: &WebRtcMessage,
    ) -> Result<(), RtmError> {
        if !msg.group.is_empty() && self.group() != Some(msg.group.as_str()) {
            return Err(RtmError::bad_message("invalid channel for group", msg.id));
        }
        if msg.hash.is_empty() {
            return Err(RtmError::bad_message("missing hash", msg.id));
        }
        let hash = ChannelHasher::decode(&msg.hash)
            .ok_or_else(|| RtmError::bad_message("hash decode error", msg.id))?;

        let target = if !msg.group.is_empty() {
            msg.group.as_str()
        } else if msg.target.is_empty() {
            return Err(RtmError::bad_message("missing target", msg.id));
        } else if self.pipeline.is_some() {
            // The backend validates traffic routed through it.
            return Ok(());
        } else {
            msg.target.as_str()
        };

        if hasher.verify(&hash, &msg.kind, source, target, &msg.channel)
            || hasher.verify(&hash, &msg.kind, source, &msg.target, &msg.channel)
        {
            return Ok(());
        }
        Err(RtmError::bad_message("invalid hash", msg.id))
    }
}

fn send_logged(
    channel_id: &str,
    conn: &RtmConnection,
    msg: &WebRtcMessage,
) -> Result<(), ConnectionError> {
    conn.send(msg).inspect_err(|err| {
        warn!(channel_id, connection_id = %conn.id(), error = %err, "channel send failed");
    })
}

/// Connects a channel to its pipeline without keeping it alive.
struct ChannelPipelineBridge {
    channel: Weak<Channel>,
}

impl PipelineObserver for ChannelPipelineBridge {
    fn on_connect(&self, pipeline: &Pipeline) -> Result<(), PipelineError> {
        let Some(channel) = self.channel.upgrade() else {
            return Err(PipelineError::Closed);
        };
        debug!(channel_id = %channel.id, "channel pipeline connect");
        // The backend learns about the channel it serves from this reply.
        let mut reply = WebRtcReply::channel(channel.id.clone());
        reply.data = Some(ChannelExtra {
            pipeline: channel.pipeline_extra(),
            ..ChannelExtra::default()
        });
        pipeline.send(&reply)?;
        debug!(channel_id = %channel.id, "channel pipeline registered");
        Ok(())
    }

    fn on_text(&self, _pipeline: &Pipeline, payload: &str) -> Result<(), PipelineError> {
        let Some(channel) = self.channel.upgrade() else {
            return Ok(());
        };
        let msg: WebRtcMessage = serde_json::from_str(payload)?;
        trace!(channel_id = %channel.id, target = %msg.target, "channel deliver from pipeline");
        if let Err(err) = channel.deliver(&msg) {
            warn!(channel_id = %channel.id, error = %err, "channel deliver from pipeline failed");
        }
        Ok(())
    }

    fn on_reset(&self, _pipeline: &Pipeline) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        debug!(channel_id = %channel.id, "channel pipeline reset");
        let Some(observer) = channel.config.as_ref().and_then(|c| c.reset.clone()) else {
            return;
        };
        tokio::spawn(async move {
            observer.after_reset(&channel);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::connection::Outbound;
    use crate::config::PipelineSettings;
    use crate::mcu::{McuConnection, McuError, PipelineBackend, PIPELINE_MODE_MCU_FORWARD};
    use crate::metrics::CountingSink;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn metrics() -> (Arc<CountingSink>, InstanceMetrics) {
        let sink = Arc::new(CountingSink::default());
        (sink.clone(), InstanceMetrics::new(sink, "test"))
    }

    fn connection(id: &str) -> (Arc<RtmConnection>, Outbound) {
        RtmConnection::new(id, ConnectionSettings::default())
    }

    #[derive(Default)]
    struct RecordingReplace {
        calls: Mutex<Vec<(String, String, String)>>,
    }

    impl ReplacePolicy for RecordingReplace {
        fn on_replace(
            &self,
            _channel_id: &str,
            member: &str,
            old: &Arc<RtmConnection>,
            new: &Arc<RtmConnection>,
        ) {
            self.calls
                .lock()
                .push((member.to_string(), old.id().to_string(), new.id().to_string()));
        }
    }

    fn special_config(replace: Option<Arc<dyn ReplacePolicy>>) -> ChannelConfig {
        ChannelConfig {
            group: "room".into(),
            replace,
            membership: None,
            reset: None,
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn duplicate_member_without_policy_is_rejected() {
        let (_, metrics) = metrics();
        let channel = Channel::new("*plain", None, None, metrics);
        let (first, _first_out) = connection("1");
        let (second, _second_out) = connection("2");

        channel.add("alice", &first).expect("first add");
        channel.add("alice", &first).expect("same connection is a no-op");
        assert!(matches!(
            channel.add("alice", &second),
            Err(ChannelError::AlreadyExists(_))
        ));
        let (conn, found) = channel.get("alice");
        assert!(found);
        assert!(Arc::ptr_eq(&conn.expect("member"), &first));
    }

    #[test_timeout::tokio_timeout_test]
    async fn replace_policy_sees_old_and_new_before_swap() {
        let (sink, metrics) = metrics();
        let policy = Arc::new(RecordingReplace::default());
        let channel = Channel::new(
            "@room",
            Some(special_config(Some(policy.clone()))),
            None,
            metrics,
        );
        let (first, _first_out) = connection("1");
        let (second, _second_out) = connection("2");

        channel.add("alice", &first).expect("first add");
        channel.add("alice", &second).expect("replace");
        assert_eq!(
            *policy.calls.lock(),
            vec![("alice".to_string(), "1".to_string(), "2".to_string())]
        );
        assert!(Arc::ptr_eq(&channel.get("alice").0.expect("member"), &second));

        // The displaced connection closing must not evict its replacement.
        first.close();
        assert!(Arc::ptr_eq(&channel.get("alice").0.expect("member"), &second));
        second.close();
        assert!(channel.get("alice").0.is_none());
        assert_eq!(sink.count(MetricEvent::MemberAdded), 2);
        assert_eq!(sink.count(MetricEvent::MemberRemoved), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn cleanup_eligibility_depends_on_config() {
        let (_, metrics) = metrics();
        let group = Channel::new("@room", Some(special_config(None)), None, metrics.clone());
        assert!(group.can_be_cleaned_up());
        let (a, _a_out) = connection("a");
        group.add("a", &a).expect("add");
        assert!(!group.can_be_cleaned_up());

        let plain = Channel::new("*pair", None, None, metrics);
        let (b, _b_out) = connection("b");
        plain.add("a", &a).expect("add");
        assert!(plain.can_be_cleaned_up());
        plain.add("b", &b).expect("add");
        assert!(!plain.can_be_cleaned_up());
        assert!(!plain.cleanup());

        plain.remove("b");
        assert!(plain.cleanup());
        assert!(plain.is_closed());
        assert!(!plain.cleanup());
        assert!(matches!(plain.add("b", &b), Err(ChannelError::Closed)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn forward_stamps_source_and_clears_id() {
        let (_, metrics) = metrics();
        let channel = Channel::new("*pair", None, None, metrics);
        let (bob, mut bob_out) = connection("b");
        channel.add("bob", &bob).expect("add");

        let msg = WebRtcMessage {
            kind: "webrtc".into(),
            subtype: "webrtc_signal".into(),
            id: 9,
            target: "bob".into(),
            channel: "*pair".into(),
            ..WebRtcMessage::default()
        };
        channel
            .forward("alice", "bob", None, msg.clone())
            .expect("forward");
        let delivered: WebRtcMessage =
            serde_json::from_str(&bob_out.try_recv().expect("delivered")).expect("decode");
        assert_eq!(delivered.source, "alice");
        assert_eq!(delivered.id, 0);

        let err = channel
            .forward("alice", "carol", None, msg)
            .expect_err("unknown target");
        assert_eq!(err.code, crate::api::ErrorCode::NoSessionForUser);
        assert_eq!(err.reply_to, 9);
    }

    #[test_timeout::tokio_timeout_test]
    async fn hash_check_accepts_both_sides_of_a_pair() {
        let (_, metrics) = metrics();
        let hasher = ChannelHasher::generate();
        let channel = Channel::new("*pair", None, None, metrics);
        let hash = hasher.sign("webrtc", "alice", "bob", "*pair");

        let mut msg = WebRtcMessage {
            kind: "webrtc".into(),
            subtype: "webrtc_signal".into(),
            id: 4,
            target: "alice".into(),
            channel: "*pair".into(),
            hash: hash.clone(),
            ..WebRtcMessage::default()
        };
        channel
            .check_webrtc_message(&hasher, "bob", &msg)
            .expect("responder hash");

        msg.channel = "*other".into();
        let err = channel
            .check_webrtc_message(&hasher, "bob", &msg)
            .expect_err("hash is bound to the channel");
        assert_eq!(err.reply_to, 4);

        msg.channel = "*pair".into();
        msg.hash = "not base64!".into();
        assert_eq!(
            channel
                .check_webrtc_message(&hasher, "bob", &msg)
                .expect_err("undecodable")
                .msg,
            "hash decode error"
        );

        msg.hash = hash;
        msg.group = "room".into();
        assert_eq!(
            channel
                .check_webrtc_message(&hasher, "bob", &msg)
                .expect_err("no group")
                .msg,
            "invalid channel for group"
        );
    }

    /// Accepts every attach; the test hands over backend connections itself.
    #[derive(Default)]
    struct ManualBackend {
        attaches: AtomicUsize,
    }

    impl PipelineBackend for ManualBackend {
        fn attach(&self, _plugin: &str, _handle: i64, _pipeline: Weak<Pipeline>) -> Result<(), McuError> {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn detach(&self, _plugin: &str, _handle: i64) -> Result<(), McuError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingReset {
        resets: AtomicUsize,
    }

    impl ResetObserver for CountingReset {
        fn after_reset(&self, _channel: &Channel) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PipelineChannel {
        channel: Arc<Channel>,
        pipeline: Arc<Pipeline>,
        backend: Arc<ManualBackend>,
        reset: Arc<CountingReset>,
    }

    fn pipeline_channel() -> PipelineChannel {
        let (_, metrics) = metrics();
        let backend = Arc::new(ManualBackend::default());
        let pipeline = Pipeline::new(
            "pipeline-1",
            "rtm-channel",
            7,
            PipelineSettings::default(),
            Arc::clone(&backend) as Arc<dyn PipelineBackend>,
        );
        let reset = Arc::new(CountingReset::default());
        let config = ChannelConfig {
            reset: Some(Arc::clone(&reset) as Arc<dyn ResetObserver>),
            ..special_config(None)
        };
        let channel = Channel::new("@room", Some(config), Some(Arc::clone(&pipeline)), metrics);
        PipelineChannel {
            channel,
            pipeline,
            backend,
            reset,
        }
    }

    /// Hands a fresh backend connection to the pipeline and returns the
    /// registration it was sent.
    fn connect_backend(pipeline: &Arc<Pipeline>) -> (Arc<McuConnection>, Outbound, Value) {
        let (conn, mut outbound) = McuConnection::new("backend", ConnectionSettings::default());
        pipeline
            .on_backend_connect(Arc::clone(&conn))
            .expect("backend connect");
        let registration =
            serde_json::from_str(&outbound.try_recv().expect("registration")).expect("json");
        (conn, outbound, registration)
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn pipeline_registration_names_the_channel() {
        let fixture = pipeline_channel();
        assert_eq!(fixture.backend.attaches.load(Ordering::SeqCst), 1);

        let (_conn, _outbound, registration) = connect_backend(&fixture.pipeline);
        assert_eq!(registration["type"], "webrtc");
        assert_eq!(registration["subtype"], "webrtc_channel");
        assert_eq!(registration["channel"], "@room");
        assert_eq!(registration["data"]["pipeline"]["pipeline"], "pipeline-1");
        assert_eq!(
            registration["data"]["pipeline"]["mode"],
            PIPELINE_MODE_MCU_FORWARD
        );
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn pipeline_channel_routes_unknown_targets_to_the_backend() {
        let fixture = pipeline_channel();
        let (_conn, mut backend_out, _) = connect_backend(&fixture.pipeline);

        let (conn, found) = fixture.channel.get("zoe");
        assert!(conn.is_none());
        assert!(found);

        let msg = WebRtcMessage {
            kind: "webrtc".into(),
            subtype: "webrtc_signal".into(),
            id: 5,
            target: "zoe".into(),
            channel: "@room".into(),
            ..WebRtcMessage::default()
        };
        fixture
            .channel
            .forward("alice", "zoe", None, msg)
            .expect("forward");
        let sent: WebRtcMessage =
            serde_json::from_str(&backend_out.try_recv().expect("sent to backend")).expect("json");
        assert_eq!(sent.source, "alice");
        assert_eq!(sent.target, "zoe");
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn pipeline_channel_leaves_pair_hashes_to_the_backend() {
        let fixture = pipeline_channel();
        let hasher = ChannelHasher::generate();
        let unrelated = hasher.sign("webrtc", "mallory", "eve", "*elsewhere");

        let mut msg = WebRtcMessage {
            kind: "webrtc".into(),
            subtype: "webrtc_signal".into(),
            id: 6,
            target: "zoe".into(),
            channel: "@room".into(),
            hash: unrelated,
            ..WebRtcMessage::default()
        };
        fixture
            .channel
            .check_webrtc_message(&hasher, "alice", &msg)
            .expect("backend validates pair traffic");

        msg.group = "room".into();
        assert_eq!(
            fixture
                .channel
                .check_webrtc_message(&hasher, "alice", &msg)
                .expect_err("group traffic is still checked")
                .msg,
            "invalid hash"
        );
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn backend_text_reaches_the_target_member() {
        let fixture = pipeline_channel();
        let (backend, _backend_out, _) = connect_backend(&fixture.pipeline);
        let (bob, mut bob_out) = connection("b");
        fixture.channel.add("bob", &bob).expect("add");

        let payload = json!({
            "type": "webrtc", "subtype": "webrtc_signal",
            "source": "zoe", "target": "bob", "channel": "@room",
            "data": { "sdp": "offer" }
        });
        fixture
            .pipeline
            .on_backend_text(&backend, &payload.to_string())
            .expect("backend text");
        let delivered: Value =
            serde_json::from_str(&bob_out.try_recv().expect("delivered")).expect("json");
        assert_eq!(delivered["source"], "zoe");
        assert_eq!(delivered["data"]["sdp"], "offer");

        // Unknown targets are dropped without affecting the pipeline.
        let stray = json!({ "type": "webrtc", "source": "zoe", "target": "nobody" });
        fixture
            .pipeline
            .on_backend_text(&backend, &stray.to_string())
            .expect("stray text");
        assert!(bob_out.try_recv().is_none());
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn pipeline_reconnect_notifies_the_reset_observer() {
        let fixture = pipeline_channel();
        let (backend, _backend_out, _) = connect_backend(&fixture.pipeline);
        assert_eq!(fixture.reset.resets.load(Ordering::SeqCst), 0);

        backend.close();
        // Reconnect delay, then the spawned observer call.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fixture.backend.attaches.load(Ordering::SeqCst), 2);
        assert_eq!(fixture.reset.resets.load(Ordering::SeqCst), 1);
    }
}
