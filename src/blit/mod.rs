//! Blit is the out-of-band control protocol for a running plug: another process can inject
//!  messages into the data session, list / mute / delete its peers, or stop the process.

pub mod blit_client;
pub mod blit_messages;
pub mod blit_server;
