//! Wire protocol for parent-worker communication.
//!
//! One JSON object per line over the worker's stdin/stdout. Outbound
//! requests carry a correlation id; inbound lines are classified as status,
//! ack, or final response.

pub mod codec;
pub mod protocol;
