pub mod client_factory;
pub mod credentials;
pub mod daemon;
pub mod jobs;
pub mod network;
pub mod node_service;
pub mod state_id;
pub mod storage;
pub mod sync;
