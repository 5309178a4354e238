pub mod health;
pub mod doc_latest;
pub mod diagnostics;

pub use health::*;
pub use doc_latest::*;
pub use diagnostics::*;
