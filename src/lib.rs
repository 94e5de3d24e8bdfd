//! Nimbus: a clustered in-memory key/value substrate with membership
//! consensus, a reliable datagram call layer, and distributed fork/join
//! task execution.

#[macro_use]
mod utils;

mod cloud;
mod heartbeat;
mod msg;
mod node;
mod paxos;
mod rpc;
mod server;
mod store;
mod task;
mod wire;

pub use crate::cloud::Cloud;
pub use crate::node::{Node, NodeAddr, NodeId, NodeRegistry};
pub use crate::server::{NimbusNode, NodeConfig};
pub use crate::store::{Key, Store, UpdateKind, Value, WeakClock};
pub use crate::task::TaskKind;
pub use crate::utils::{logger_init, NimbusError, ME};
