//! Instance World
//!
//! A shared, hierarchical scene graph of named instances kept in sync over a
//! length-framed TCP protocol.
//!
//! ## Architecture
//!
//! ```text
//! NetworkManager  (network.rs)   ← roles, handlers, event queue
//!   └── Connection  (connection.rs) ← receive loop + write loop per socket
//!         └── codec / protocol       ← framing, packet table
//!
//! TreeManager  (manager.rs)      ← root, path lookup, stats
//!   ├── ClassRegistry  (registry.rs) ← class name → constructor
//!   └── Instance       (instance.rs) ← parent/child tree, parts, cloning
//! ```
//!
//! Network tasks never touch the tree. They push [`network::PacketEvent`]s
//! onto a bounded queue which the owning thread drains once per tick with
//! [`NetworkManager::process_events`], running the registered handler for
//! each one.

// Tree and framing are always available (no net feature needed).
pub mod codec;
pub mod error;
pub mod instance;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod types;

// Sockets and the event queue require the `net` feature.
#[cfg(feature = "net")]
pub mod connection;
#[cfg(feature = "net")]
pub mod network;

pub use error::{NetError, ProtocolError, RegistryError, TreeError};
pub use instance::{Instance, InstanceRef, NodeKind, NodeSnapshot, PartData, Renderable, WorkspaceData};
pub use manager::TreeManager;
pub use protocol::{kinds, Packet, PacketKind};
pub use registry::{ClassRegistry, InstanceBlueprint};
pub use types::{ConnectionId, InstanceId, NetworkConfig, Quat, TreeStats, Vec3};

#[cfg(feature = "net")]
pub use connection::Connection;
#[cfg(feature = "net")]
pub use network::{ManagerState, NetworkManager, PacketEvent, PacketHandler};
