use clap::{command, Parser, ValueEnum};
use tracing::Level;
use web3_gateway_core::{api::pipeline::Feature, types::RuntimeMode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
	Text,
	Json,
}

#[derive(Parser, Debug)]
#[command(version)]
pub struct CliOpts {
	/// Path to the toml configuration file
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<String>,
	/// Database connection URL
	#[arg(long, env = "DATABASE_URL")]
	pub database_url: Option<String>,
	/// Godwoken node HTTP JSON-RPC endpoint
	#[arg(long, env = "GODWOKEN_JSON_RPC")]
	pub godwoken_json_rpc: Option<String>,
	/// Number of worker processes, zero or less serves from a single process
	#[arg(long, env = "CLUSTER_COUNT", allow_negative_numbers = true)]
	pub cluster_count: Option<i64>,
	/// HTTP port shared by all workers
	#[arg(short, long, env = "PORT")]
	pub port: Option<u16>,
	/// Log level
	#[arg(long, env = "LOG_LEVEL")]
	pub verbosity: Option<Level>,
	/// Log output format
	#[arg(long, env = "LOG_FORMAT", value_enum)]
	pub log_format: Option<LogFormat>,
	/// Set logs format to JSON
	#[arg(long)]
	pub logs_json: bool,
	/// Log request bodies at debug level
	#[arg(long, env = "WEB3_LOG_REQUEST_BODY")]
	pub log_request_body: bool,
	/// Request pipeline features, comma separated
	#[arg(long, env = "GATEWAY_FEATURES", value_enum, value_delimiter = ',')]
	pub features: Option<Vec<Feature>>,
	/// Production hides error details from clients
	#[arg(long, env = "GATEWAY_MODE", value_enum)]
	pub mode: Option<RuntimeMode>,
	/// Disable background block ingestion
	#[arg(long)]
	pub no_ingestion: bool,
	/// Set by the supervisor on the processes it forks
	#[arg(long, hide = true)]
	pub worker_id: Option<usize>,
}
