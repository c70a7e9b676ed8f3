pub mod clock;
pub mod config;
pub mod downstream;
pub mod elide;
pub mod export;
pub mod proto;
pub mod relay;
pub mod sampler;
pub mod server;
pub mod stats;
