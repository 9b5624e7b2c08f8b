pub mod data;

pub use data::{Envelope, FieldValue, ValueKey, WriteOrigin, WriteRequest};
