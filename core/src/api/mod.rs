pub mod configuration;
pub mod context;
pub mod pipeline;
pub mod server;
pub mod stages;
pub mod ws;
