pub mod clock;
pub mod config;
pub mod engine;
pub mod jobs;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod review;
pub mod slot;
pub mod wal;
