pub mod participant;
pub mod presence;
pub mod registry;
pub mod resync;
pub mod room;
pub mod sync_config;
pub mod userctx;

pub use participant::{Connection, ParticipantSession, Selection, SessionState};
pub use registry::RoomRegistry;
pub use room::{JoinAccepted, JoinRequest, RoomHandle, RoomMessage, RoomStats};
pub use sync_config::SyncConfig;
pub use userctx::UserCtx;
