pub mod backoff;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod qadu;
pub mod scheduler;
pub mod transport;
pub mod video;
