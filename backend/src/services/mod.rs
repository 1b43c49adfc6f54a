pub mod attachments;
pub mod broadcaster;
pub mod presence;
pub mod sweeper;

pub use attachments::SocketAttachments;
pub use broadcaster::{PresenceBroadcaster, PresenceEvent};
pub use presence::{HeartbeatOutcome, PresenceService};
pub use sweeper::{run_sweep, spawn_presence_sweeper, SweepOutcome, SweepSettings};
