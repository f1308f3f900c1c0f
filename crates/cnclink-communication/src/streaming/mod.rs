//! Pacing engines: the feeder/sender duality.
//!
//! The feeder carries interactive, unconstrained traffic; the sender paces a
//! loaded job. Both coexist against the same serial link; the controllers
//! arbitrate so device buffer limits are never violated.

pub mod feeder;
pub mod sender;

pub use feeder::{FeedItem, Feeder};
pub use sender::{CharCountingSender, SendResponseSender};
