//! Message and task types shared by the hub, the router and every transport
//!
//! `messages` holds the in-process model (mailbox messages, tasks, reports);
//! `wire` holds the request and response bodies that cross a transport.

pub mod messages;
pub mod wire;

pub use messages::*;
pub use wire::*;
