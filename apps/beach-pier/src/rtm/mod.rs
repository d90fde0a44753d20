//! Real-time messaging: key redemption, client connections, users and the
//! channels that pair WebRTC peers.

mod channel;
mod events;
mod group;
mod manager;
mod webrtc;

pub use channel::{
    Channel, ChannelConfig, ChannelError, ChannelOp, MembershipObserver, ReplacePolicy,
    ResetObserver, CHANNEL_PREFIX_GROUP, CHANNEL_PREFIX_RANDOM,
};
pub use events::HandlerError;
pub use group::{group_channel_config, group_channel_id, GroupPolicy};
pub use manager::{
    RtmConnection, RtmManager, RtmManagerOptions, UserRecord,
    PIPELINE_SCOPE_RTM_CHANNEL,
};
pub use webrtc::ChannelHasher;
