use buildhost_common::config::Settings;
use buildhost_common::{EnvSwitches, LockScope, ServerLocks};

use crate::handshake::Handshake;
use crate::ipc::ChannelName;

/// Everything derived from one server handshake: channel and locks.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub handshake: Handshake,
    pub channel: ChannelName,
    pub locks: ServerLocks,
}

impl ServerIdentity {
    pub fn new(handshake: Handshake, settings: &Settings) -> Self {
        let channel = ChannelName::for_handshake(&handshake, settings.channel_dir.as_deref());
        let locks = ServerLocks::new(
            LockScope::from_override(settings.lock_dir.as_deref()),
            handshake.fingerprint(),
        );
        Self {
            handshake,
            channel,
            locks,
        }
    }

    /// Identity a client and a server built from the same release and
    /// configuration agree on.
    pub fn from_settings(settings: &Settings, switches: &EnvSwitches) -> Self {
        let handshake = Handshake::for_server(settings.server.node_reuse, switches.session_salt);
        Self::new(handshake, settings)
    }
}
