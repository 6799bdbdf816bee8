//! HTTP client for the blog-side bridge REST API.

mod bridge;

pub use bridge::{
    BridgeClient, BridgeError, CreatedComment, NewReplyComment, SubscriptionContext,
};
