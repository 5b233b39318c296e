//! Typed payloads and the string constants that name them.
//!
//! - **`topics`**: PUB/SUB topics for notifications and monitor copies
//! - **`msg_types`**: `Message::msg_type` values
//! - **`hub`**: registration and hub query payloads
//! - **`task`**: error content and broadcast results

pub mod hub;
pub mod msg_types;
pub mod task;
pub mod topics;

pub use hub::*;
pub use task::*;
