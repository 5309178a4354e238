pub mod document;
pub mod operation;
pub mod transform;

pub use document::{Applied, DocumentState};
pub use operation::{OpKind, Operation};
pub use transform::{transform, transform_one};
