pub mod config;
pub mod discovery;
pub mod framing;
pub mod identity;
pub mod jobs;
pub mod listing;
pub mod packet;
pub mod registry;
pub mod transfer;
