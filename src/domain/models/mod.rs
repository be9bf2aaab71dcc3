pub mod client;
pub mod event;

pub use client::{Client, ClientRef, Mailbox, Payload};
pub use event::{Event, MessageEvent, PING_FRAME, Subscribed};
