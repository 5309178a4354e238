pub mod diagnostics;
pub mod doc_latest;
pub mod doc_snapshot;
pub mod error;
pub mod health;
pub mod messages;
pub mod permission;
pub mod ready;

pub use diagnostics::*;
pub use doc_latest::*;
pub use doc_snapshot::*;
pub use error::*;
pub use health::*;
pub use messages::*;
pub use permission::*;
pub use ready::*;
