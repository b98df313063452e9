//! Node protocol shared by the build client, the build server and task hosts:
//! handshake, packet framing, the background packet pump and local IPC.

pub mod endpoint;
pub mod frame;
pub mod handshake;
pub mod identity;
pub mod ipc;
pub mod packets;
pub mod pump;
pub mod wire;

pub use endpoint::{LinkError, LinkStatus, NodeEndpoint};
pub use frame::{FrameError, FrameReader, PacketFactory};
pub use handshake::{Handshake, HandshakeError, HandshakeOptions};
pub use identity::ServerIdentity;
pub use ipc::{ChannelName, DefaultBackend, IpcBackend, IpcListener};
pub use packets::{
    BuildCommand, BuildResult, Cancel, ConsoleWrite, LogEvent, LogImportance, LogKind, LogMessage,
    NodePacket, Packet, PacketType, TaskCommand, TaskComplete, TaskResultKind,
};
pub use pump::{spawn_pump, PumpExit, PumpHandle};
pub use wire::WireError;
