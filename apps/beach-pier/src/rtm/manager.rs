use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::response::Response;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use regex::Regex;
use tracing::{debug, error, info};

use super::channel::{Channel, ChannelError, CHANNEL_PREFIX_RANDOM};
use super::group::{group_channel_config, group_channel_id};
use super::webrtc::ChannelHasher;
use crate::api::ConnectError;
use crate::auth::{AuthKind, AuthToken, Authenticator};
use crate::config::{ConnectionSettings, RtmSettings};
use crate::connection::Connection;
use crate::ids::random_key;
use crate::mcu::{Pipeline, PipelineProvider};
use crate::metrics::{InstanceMetrics, MetricEvent};
use crate::registry::Registry;

/// Pipeline scope requested for RTM channels.
pub const PIPELINE_SCOPE_RTM_CHANNEL: &str = "rtm-channel";

/// Client connection, bound to the record of the user it belongs to.
pub type RtmConnection = Connection<Arc<UserRecord>>;

struct UserState {
    when: Instant,
    exit: Option<Instant>,
    connections: Vec<Arc<RtmConnection>>,
}

/// A user with their live connections. Shared by every connection of the
/// same user once registered.
pub struct UserRecord {
    id: String,
    auth: RwLock<AuthToken>,
    state: Mutex<UserState>,
}

impl UserRecord {
    pub fn new(id: impl Into<String>, auth: AuthToken) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            auth: RwLock::new(auth),
            state: Mutex::new(UserState {
                when: Instant::now(),
                exit: None,
                connections: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn auth(&self) -> AuthToken {
        self.auth.read().clone()
    }

    pub fn set_auth(&self, auth: AuthToken) {
        *self.auth.write() = auth;
    }

    pub fn name(&self) -> String {
        self.auth.read().name()
    }

    /// Copy of the live connections.
    pub fn connections(&self) -> Vec<Arc<RtmConnection>> {
        self.state.lock().connections.clone()
    }

    pub(super) fn add_connection(&self, conn: &Arc<RtmConnection>) {
        let mut state = self.state.lock();
        if state.connections.is_empty() {
            state.when = Instant::now();
        }
        state.exit = None;
        state.connections.push(Arc::clone(conn));
    }

    /// Removes `conn` by identity. Returns true when it was the last one.
    pub(super) fn remove_connection(&self, conn: &RtmConnection) -> bool {
        let mut state = self.state.lock();
        let before = state.connections.len();
        state
            .connections
            .retain(|existing| !std::ptr::eq(Arc::as_ptr(existing), conn));
        let emptied = before != state.connections.len() && state.connections.is_empty();
        if emptied {
            state.exit = Some(Instant::now());
        }
        emptied
    }

    fn is_idle_for(&self, idle: Duration) -> bool {
        let state = self.state.lock();
        state.connections.is_empty() && state.exit.is_some_and(|exit| exit.elapsed() > idle)
    }
}

struct KeyRecord {
    when: Instant,
    user: Arc<UserRecord>,
}

/// Everything `RtmManager::new` needs from its owner.
pub struct RtmManagerOptions {
    pub instance_id: String,
    pub settings: RtmSettings,
    pub connection_settings: ConnectionSettings,
    pub authenticator: Arc<dyn Authenticator>,
    pub pipelines: Option<Arc<dyn PipelineProvider>>,
    pub metrics: InstanceMetrics,
    pub shutdown: CancellationToken,
}

/// Registry of RTM keys, connections, users and channels.
pub struct RtmManager {
    self_ref: Weak<RtmManager>,
    id: String,
    settings: RtmSettings,
    connection_settings: ConnectionSettings,
    authenticator: Arc<dyn Authenticator>,
    pipelines: Option<Arc<dyn PipelineProvider>>,
    pub(super) metrics: InstanceMetrics,
    hasher: ChannelHasher,
    pipeline_forced: Option<Regex>,
    shutdown: CancellationToken,
    draining: CancellationToken,
    keys: Registry<String, Arc<KeyRecord>>,
    connections: Registry<String, Arc<RtmConnection>>,
    pub(super) users: Registry<String, Arc<UserRecord>>,
    channels: Registry<String, Arc<Channel>>,
    next_connection: AtomicU64,
}

impl RtmManager {
    pub fn new(options: RtmManagerOptions) -> Arc<Self> {
        let pipeline_forced = options
            .settings
            .pipeline_forced_pattern
            .as_deref()
            .and_then(compile_forced_pattern);
        let draining = options.shutdown.child_token();
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            id: options.instance_id,
            settings: options.settings,
            connection_settings: options.connection_settings,
            authenticator: options.authenticator,
            pipelines: options.pipelines,
            metrics: options.metrics,
            hasher: ChannelHasher::generate(),
            pipeline_forced,
            shutdown: options.shutdown,
            draining,
            keys: Registry::new(),
            connections: Registry::new(),
            users: Registry::new(),
            channels: Registry::new(),
            next_connection: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    pub(super) fn hasher(&self) -> &ChannelHasher {
        &self.hasher
    }

    pub fn num_active(&self) -> usize {
        self.connections.len()
    }

    /// Stops issuing connect keys. Keys already handed out stay redeemable
    /// and live connections keep running until shutdown.
    pub fn begin_drain(&self) {
        self.draining.cancel();
    }

    /// Registers the intent of `user_id` to connect and returns the one-time
    /// key redeemed by `handle_websocket_connect`.
    pub fn connect(&self, user_id: &str, auth: AuthToken) -> Result<String, ConnectError> {
        if self.draining.is_cancelled() {
            return Err(ConnectError::ShuttingDown);
        }
        let key = random_key(self.settings.key_bytes);
        self.keys.insert(
            key.clone(),
            Arc::new(KeyRecord {
                when: Instant::now(),
                user: UserRecord::new(user_id, auth),
            }),
        );
        debug!(user_id, "rtm connect key issued");
        Ok(key)
    }

    /// Consumes `key` and re-validates the credentials it was issued for.
    /// The key is gone afterwards whatever the outcome.
    pub async fn redeem_key(&self, key: &str) -> Result<Arc<UserRecord>, ConnectError> {
        let record = self.keys.pop(key).ok_or(ConnectError::NotFound)?;
        if record.when.elapsed() > self.settings.key_expiration {
            debug!("rtm connect key expired");
            return Err(ConnectError::NotFound);
        }

        let user = Arc::clone(&record.user);
        let auth = user.auth();
        let valid = match auth.kind {
            AuthKind::Token => self.authenticator.is_valid_token(&auth),
            AuthKind::Bearer => match self.authenticator.validate_bearer(&auth.value).await {
                Ok(_) => true,
                Err(err) => {
                    debug!(user_id = %user.id(), error = %err, "bearer no longer valid");
                    false
                }
            },
            AuthKind::Anonymous => true,
        };
        if !valid {
            debug!(user_id = %user.id(), "websocket connect forbidden");
            return Err(ConnectError::Forbidden);
        }

        if let Some(refreshed) = self.authenticator.refresh_token(&auth) {
            user.set_auth(refreshed);
        }
        Ok(user)
    }

    /// Redeems `key` and upgrades the request. The connection is served on
    /// its own task once the upgrade completes.
    pub async fn handle_websocket_connect(
        self: &Arc<Self>,
        key: &str,
        ws: WebSocketUpgrade,
    ) -> Result<Response, ConnectError> {
        let user = self.redeem_key(key).await?;
        let manager = Arc::clone(self);
        Ok(ws
            .max_message_size(self.connection_settings.max_message_size)
            .on_upgrade(move |socket| manager.serve_connection(socket, user)))
    }

    async fn serve_connection(self: Arc<Self>, socket: WebSocket, user: Arc<UserRecord>) {
        let (conn, outbound) = self.new_connection(user);
        let shutdown = self.shutdown.child_token();
        conn.clone()
            .serve(socket, outbound, Arc::clone(&self), shutdown)
            .await;
        self.release_connection(&conn);
    }

    /// Creates and registers a connection bound to `user`.
    pub(super) fn new_connection(
        &self,
        user: Arc<UserRecord>,
    ) -> (Arc<RtmConnection>, crate::connection::Outbound) {
        let id = (self.next_connection.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let (conn, outbound) = RtmConnection::new(id.clone(), self.connection_settings.clone());
        conn.bind(user);
        self.connections.insert(id, Arc::clone(&conn));
        self.metrics.record(MetricEvent::ConnectionOpened);
        self.metrics.active_connections(self.connections.len());
        (conn, outbound)
    }

    pub(super) fn release_connection(&self, conn: &Arc<RtmConnection>) {
        self.connections
            .remove_if(conn.id(), |current| Arc::ptr_eq(current, conn));
        self.metrics.record(MetricEvent::ConnectionClosed);
        self.metrics.active_connections(self.connections.len());
    }

    /// Copy of the live connections of `user_id`, if it has any.
    pub fn lookup_connections_by_user_id(&self, user_id: &str) -> Option<Vec<Arc<RtmConnection>>> {
        let connections = self.users.get(user_id)?.connections();
        (!connections.is_empty()).then_some(connections)
    }

    /// Backend pipeline for channel `id`, when a provider is configured and
    /// the id matches the forced pipeline pattern.
    pub fn pipeline(&self, id: &str) -> Option<Arc<Pipeline>> {
        let provider = self.pipelines.as_ref()?;
        if !self.pipeline_forced.as_ref()?.is_match(id) {
            return None;
        }
        provider.pipeline(PIPELINE_SCOPE_RTM_CHANNEL, id)
    }

    pub fn channel(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.get(id)
    }

    pub fn create_random_channel(&self) -> Arc<Channel> {
        loop {
            let id = format!(
                "{CHANNEL_PREFIX_RANDOM}{}",
                random_key(self.settings.channel_id_bytes)
            );
            let (channel, created) = self.channels.get_or_insert_with(id.clone(), || {
                Channel::new(id.clone(), None, self.pipeline(&id), self.metrics.clone())
            });
            if created {
                return channel;
            }
        }
    }

    /// The group channel for `group`, created on first reference. A closed
    /// channel still registered is replaced once.
    pub fn group_channel(&self, group: &str) -> Result<Arc<Channel>, ChannelError> {
        let id = group_channel_id(group);
        for _ in 0..2 {
            let (channel, _) = self.channels.get_or_insert_with(id.clone(), || {
                Channel::new(
                    id.clone(),
                    Some(group_channel_config(group)),
                    self.pipeline(&id),
                    self.metrics.clone(),
                )
            });
            if !channel.is_closed() {
                return Ok(channel);
            }
            self.channels
                .remove_if(&id, |current| Arc::ptr_eq(current, &channel));
        }
        Err(ChannelError::Closed)
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.self_ref.clone();
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
            debug!("rtm sweeper stopped");
        })
    }

    /// Purges expired keys, idle users and cleanup-eligible channels. Every
    /// removal re-checks its condition under the registry lock.
    pub fn sweep(&self) {
        let started = Instant::now();
        let keys = self.purge_keys();
        let users = self.purge_users();
        let channels = self.purge_channels();
        if keys + users + channels > 0 {
            info!(
                keys,
                users,
                channels,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "rtm sweep"
            );
        }
    }

    fn purge_keys(&self) -> usize {
        let expiration = self.settings.key_expiration;
        self.keys
            .snapshot()
            .into_iter()
            .filter(|(_, record)| record.when.elapsed() > expiration)
            .filter(|(key, record)| {
                self.keys
                    .remove_if(key, |current| Arc::ptr_eq(current, record))
                    .is_some()
            })
            .count()
    }

    fn purge_users(&self) -> usize {
        let idle = self.settings.user_idle;
        let mut purged = 0;
        for (id, _) in self.users.snapshot() {
            if self
                .users
                .remove_if(&id, |user| user.is_idle_for(idle))
                .is_some()
            {
                debug!(user_id = %id, "user is no longer active");
                self.metrics.record(MetricEvent::UserCleanedUp);
                purged += 1;
            }
        }
        purged
    }

    fn purge_channels(&self) -> usize {
        let expiration = self.settings.channel_expiration;
        let mut purged = 0;
        for (id, channel) in self.channels.snapshot() {
            if channel.created().elapsed() <= expiration {
                continue;
            }
            if !channel.is_closed() && !channel.cleanup() {
                continue;
            }
            if self
                .channels
                .remove_if(&id, |current| Arc::ptr_eq(current, &channel))
                .is_some()
            {
                purged += 1;
            }
        }
        purged
    }
}

/// Compiles the forced pipeline pattern. An invalid pattern disables forced
/// pipelines instead of failing startup.
fn compile_forced_pattern(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => {
            info!(pattern, "forced pipeline channels enabled");
            Some(regex)
        }
        Err(err) => {
            error!(
                pattern,
                error = %err,
                "invalid forced pipeline pattern; forced pipeline channels disabled"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SharedSecretAuthenticator;
    use crate::connection::ConnectionHandler;
    use crate::metrics::CountingSink;

    fn manager_with(settings: RtmSettings) -> (Arc<RtmManager>, Arc<CountingSink>) {
        let sink = Arc::new(CountingSink::default());
        let manager = RtmManager::new(RtmManagerOptions {
            instance_id: "test".into(),
            settings,
            connection_settings: ConnectionSettings::default(),
            authenticator: Arc::new(SharedSecretAuthenticator::new("secret")),
            pipelines: None,
            metrics: InstanceMetrics::new(sink.clone(), "test"),
            shutdown: CancellationToken::new(),
        });
        (manager, sink)
    }

    #[test_timeout::timeout]
    fn forced_pattern_searches_anywhere_in_the_id() {
        let cases = [
            ("@conf-.*", "@conf-1"),
            ("conf", "@conf-1"),
            ("^@", "@room"),
            (".*", "@room"),
        ];
        for (pattern, id) in cases {
            let regex = compile_forced_pattern(pattern).expect("valid pattern");
            assert!(regex.is_match(id), "{pattern} should match {id}");
        }
        let anchored = compile_forced_pattern("^@conf-").expect("valid pattern");
        assert!(!anchored.is_match("@room"));
        assert!(compile_forced_pattern("@conf-(").is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn keys_are_redeemed_exactly_once() {
        let (manager, _) = manager_with(RtmSettings::default());
        let key = manager
            .connect("alice", AuthToken::anonymous("alice"))
            .expect("key");
        assert_eq!(key.len(), 32);
        let user = manager.redeem_key(&key).await.expect("redeem");
        assert_eq!(user.id(), "alice");
        assert!(matches!(
            manager.redeem_key(&key).await,
            Err(ConnectError::NotFound)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn invalid_auth_is_forbidden_and_consumes_the_key() {
        let (manager, _) = manager_with(RtmSettings::default());
        let forged = AuthToken {
            kind: AuthKind::Token,
            subject: "alice".into(),
            value: "bogus.token".into(),
            expires_at: None,
            claims: Default::default(),
        };
        let key = manager.connect("alice", forged).expect("key");
        assert!(matches!(
            manager.redeem_key(&key).await,
            Err(ConnectError::Forbidden)
        ));
        assert!(matches!(
            manager.redeem_key(&key).await,
            Err(ConnectError::NotFound)
        ));
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn unredeemed_keys_expire_as_not_found() {
        let (manager, _) = manager_with(RtmSettings::default());
        let stale = manager
            .connect("alice", AuthToken::anonymous("alice"))
            .expect("key");
        let swept = manager
            .connect("bob", AuthToken::anonymous("bob"))
            .expect("key");

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(
            manager.redeem_key(&stale).await,
            Err(ConnectError::NotFound)
        ));

        tokio::time::advance(Duration::from_secs(60)).await;
        manager.sweep();
        assert!(matches!(
            manager.redeem_key(&swept).await,
            Err(ConnectError::NotFound)
        ));
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn idle_users_are_purged_after_their_last_connection() {
        let (manager, sink) = manager_with(RtmSettings::default());
        let (conn, _outbound) = manager.new_connection(UserRecord::new(
            "alice",
            AuthToken::anonymous("alice"),
        ));
        manager.on_connect(&conn).expect("connect");
        assert_eq!(
            manager
                .lookup_connections_by_user_id("alice")
                .map(|c| c.len()),
            Some(1)
        );

        tokio::time::advance(Duration::from_secs(120)).await;
        manager.sweep();
        assert!(manager.users.contains("alice"));

        conn.close();
        manager.on_disconnect(&conn);
        manager.release_connection(&conn);
        assert!(manager.lookup_connections_by_user_id("alice").is_none());
        assert_eq!(manager.num_active(), 0);

        tokio::time::advance(Duration::from_secs(30)).await;
        manager.sweep();
        assert!(manager.users.contains("alice"));

        tokio::time::advance(Duration::from_secs(31)).await;
        manager.sweep();
        assert!(!manager.users.contains("alice"));
        assert_eq!(sink.count(MetricEvent::UserCreated), 1);
        assert_eq!(sink.count(MetricEvent::UserCleanedUp), 1);
    }

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn sweep_cleans_up_eligible_channels_only() {
        let (manager, sink) = manager_with(RtmSettings::default());
        let lonely = manager.create_random_channel();
        let busy = manager.create_random_channel();
        let (a, _a_out) = RtmConnection::new("a", ConnectionSettings::default());
        let (b, _b_out) = RtmConnection::new("b", ConnectionSettings::default());
        busy.add("a", &a).expect("add");
        busy.add("b", &b).expect("add");

        manager.sweep();
        assert!(manager.channel(lonely.id()).is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        manager.sweep();
        assert!(manager.channel(lonely.id()).is_none());
        assert!(lonely.is_closed());
        assert!(manager.channel(busy.id()).is_some());

        b.close();
        manager.sweep();
        assert!(manager.channel(busy.id()).is_none());
        assert_eq!(sink.count(MetricEvent::ChannelCreated), 2);
        assert_eq!(sink.count(MetricEvent::ChannelCleanedUp), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn group_channel_is_shared_and_recreated_after_cleanup() {
        let (manager, _) = manager_with(RtmSettings::default());
        let first = manager.group_channel("room").expect("group");
        let again = manager.group_channel("room").expect("group");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.id(), "@room");
        assert_eq!(first.group(), Some("room"));

        assert!(first.cleanup());
        let fresh = manager.group_channel("room").expect("recreated");
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert!(!fresh.is_closed());
    }

    #[derive(Default)]
    struct RecordingProvider {
        requests: parking_lot::Mutex<Vec<(String, String)>>,
    }

    impl PipelineProvider for RecordingProvider {
        fn pipeline(&self, scope: &str, id: &str) -> Option<Arc<Pipeline>> {
            self.requests.lock().push((scope.to_string(), id.to_string()));
            None
        }
    }

    fn manager_with_pipelines(pattern: &str) -> (Arc<RtmManager>, Arc<RecordingProvider>) {
        let provider = Arc::new(RecordingProvider::default());
        let manager = RtmManager::new(RtmManagerOptions {
            instance_id: "test".into(),
            settings: RtmSettings {
                pipeline_forced_pattern: Some(pattern.into()),
                ..RtmSettings::default()
            },
            connection_settings: ConnectionSettings::default(),
            authenticator: Arc::new(SharedSecretAuthenticator::new("secret")),
            pipelines: Some(provider.clone()),
            metrics: InstanceMetrics::new(Arc::new(CountingSink::default()), "test"),
            shutdown: CancellationToken::new(),
        });
        (manager, provider)
    }

    #[test_timeout::tokio_timeout_test]
    async fn pipelines_follow_the_forced_pattern() {
        let (manager, provider) = manager_with_pipelines("^@conf-");

        manager.group_channel("room").expect("group");
        manager.create_random_channel();
        assert!(provider.requests.lock().is_empty());

        manager.group_channel("conf-1").expect("group");
        assert_eq!(
            *provider.requests.lock(),
            vec![("rtm-channel".to_string(), "@conf-1".to_string())]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn invalid_forced_pattern_disables_pipelines() {
        let (manager, provider) = manager_with_pipelines("@conf-(");
        manager.group_channel("conf-1").expect("group");
        assert!(manager.pipeline("@conf-1").is_none());
        assert!(provider.requests.lock().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn connect_is_refused_during_shutdown() {
        let (manager, _) = manager_with(RtmSettings::default());
        manager.shutdown.cancel();
        assert!(matches!(
            manager.connect("alice", AuthToken::anonymous("alice")),
            Err(ConnectError::ShuttingDown)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn draining_refuses_new_keys_but_honours_issued_ones() {
        let (manager, _) = manager_with(RtmSettings::default());
        let key = manager
            .connect("alice", AuthToken::anonymous("alice"))
            .expect("key");

        manager.begin_drain();
        assert!(matches!(
            manager.connect("bob", AuthToken::anonymous("bob")),
            Err(ConnectError::ShuttingDown)
        ));
        assert!(!manager.shutdown.is_cancelled());
        let user = manager.redeem_key(&key).await.expect("issued key still valid");
        assert_eq!(user.id(), "alice");
    }
}
