//! The binary document codec: a closed-enum element
//! type, an ordered `Document` with a lazily built name index, and the
//! 12-byte `ObjectId` identifier.

pub mod document;
pub mod element;
pub mod objectid;

pub use document::{Document, PathSegment};
pub use element::{Element, Value};
pub use objectid::ObjectId;
