//! Channel actors: the parent-side proxy that relays one network request to
//! a content process, its diversion sub-protocol, and the child-side peer.

pub mod actor;
pub mod child;
pub mod diversion;
pub mod task;

use pd_ipc::ActorId;
use std::fmt;

pub use actor::ActorOutcome;
pub use actor::ActorState;
pub use actor::ChannelActor;
pub use actor::Pump;
pub use child::ChannelChild;
pub use child::ChildOutcome;
pub use diversion::Handoff;
pub use task::ActorTask;
pub use task::PostedTask;
pub use task::TaskQueue;

/// Content process connected to the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process#{}", self.0)
    }
}

/// Parent-wide identity of a channel actor.
///
/// Actor ids are chosen by each child, so they are only unique together
/// with the process that chose them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActorKey {
    pub process: ProcessId,
    pub actor: ActorId,
}

impl ActorKey {
    pub fn new(process: ProcessId, actor: ActorId) -> Self {
        Self { process, actor }
    }
}

impl fmt::Display for ActorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.process, self.actor)
    }
}
