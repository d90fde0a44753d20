use std::sync::Arc;

use tracing::{debug, warn};

use super::channel::{
    Channel, ChannelConfig, ChannelOp, MembershipObserver, ReplacePolicy, ResetObserver,
    CHANNEL_PREFIX_GROUP,
};
use super::manager::RtmConnection;
use crate::api::{ChannelExtra, ChannelGroup, WebRtcReply};

pub fn group_channel_id(group: &str) -> String {
    format!("{CHANNEL_PREFIX_GROUP}{group}")
}

/// Config for the named group channel `@<group>`.
pub fn group_channel_config(group: &str) -> ChannelConfig {
    let policy = Arc::new(GroupPolicy);
    ChannelConfig {
        group: group.to_string(),
        replace: Some(policy.clone()),
        membership: Some(policy.clone()),
        reset: Some(policy),
    }
}

/// Keeps group members informed: a displaced device learns it was replaced,
/// and every membership change or pipeline reset is broadcast to the rest.
#[derive(Debug, Default)]
pub struct GroupPolicy;

impl GroupPolicy {
    fn broadcast(&self, channel: &Channel, op: ChannelOp, skip: &str) {
        let Some(group) = channel.group() else {
            return;
        };
        let connections = channel.connections();
        let mut reply = WebRtcReply::channel(channel.id());
        reply.data = Some(ChannelExtra {
            group: Some(ChannelGroup {
                group: group.to_string(),
                members: connections.iter().map(|(id, _)| id.clone()).collect(),
                reset: op == ChannelOp::Reset,
            }),
            ..ChannelExtra::default()
        });
        let payload = match serde_json::to_string(&reply) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(channel_id = %channel.id(), error = %err, "failed to encode group data");
                return;
            }
        };

        for (member, conn) in connections {
            if member == skip {
                continue;
            }
            if let Err(err) = conn.raw_send(payload.clone()) {
                warn!(
                    channel_id = %channel.id(),
                    connection_id = %conn.id(),
                    error = %err,
                    "failed to send group channel to connection"
                );
            }
        }
    }
}

impl ReplacePolicy for GroupPolicy {
    fn on_replace(
        &self,
        channel_id: &str,
        member: &str,
        old: &Arc<RtmConnection>,
        _new: &Arc<RtmConnection>,
    ) {
        let mut reply = WebRtcReply::channel(channel_id);
        reply.data = Some(ChannelExtra {
            replaced: true,
            ..ChannelExtra::default()
        });
        if let Err(err) = old.send(&reply) {
            warn!(channel_id, member, connection_id = %old.id(), error = %err, "failed to send group replace");
        }
    }
}

impl MembershipObserver for GroupPolicy {
    fn after_membership_change(&self, channel: &Channel, op: ChannelOp, member: &str) {
        self.broadcast(channel, op, member);
    }
}

impl ResetObserver for GroupPolicy {
    fn after_reset(&self, channel: &Channel) {
        debug!(channel_id = %channel.id(), members = channel.size(), "group channel reset");
        self.broadcast(channel, ChannelOp::Reset, "");
    }
}
