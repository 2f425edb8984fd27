pub mod logging;

pub mod blob_store;
pub mod channel;
pub mod codec;
pub mod config;
pub mod direct;
pub mod liveness;
pub mod protocol;
pub mod queue;
pub mod rate_limit;
pub mod recovery;
pub mod relay;
pub mod relay_client;
pub mod relay_transfer;
pub mod session_store;
pub mod transfer;
