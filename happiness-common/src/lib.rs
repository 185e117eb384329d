pub mod channel;
pub mod config;
pub mod health;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod scoring;
pub mod storage;
