pub mod batcher;
pub mod config;
pub mod context;
pub mod coverage;
pub mod database;
pub mod differencer;
pub mod error;
pub mod executor;
pub mod http_client;
pub mod market_data;
pub mod memory_store;
pub mod models;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod store;
pub mod tracker;

pub mod commands {
    pub mod backfill;
    pub mod confirm;
    pub mod coverage;
    pub mod report;
    pub mod sync;
}
