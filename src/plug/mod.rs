pub mod behavior;
pub mod dump;
pub mod feed;
pub mod operator_prompt;
pub mod peer;
pub mod peer_registry;
pub mod plug_config;
pub mod session;
pub mod session_handle;
pub mod shutdown;
