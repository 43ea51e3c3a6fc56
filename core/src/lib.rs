//! Front door of a Web3 JSON-RPC gateway: a request pipeline assembled from
//! declared features, workers serving it on a shared port, and a supervisor
//! forking those workers while owning the only background ingestion.

pub mod api;
pub mod cluster;
pub mod error;
pub mod ingestion;
pub mod node;
pub mod rate_limit;
pub mod rpc;
pub mod shutdown;
pub mod types;
pub mod utils;
