//! Domain pipeline for inbound email-reply webhook events.
//!
//! The crate is purely computational: decoding a provider batch, filtering
//! and extracting raw events, normalizing reply bodies, and evaluating the
//! trust policy all happen here without any I/O. Posting the resulting
//! comment is left to the application layer.

pub mod batch;
pub mod extract;
pub mod normalize;
pub mod policy;
pub mod types;
