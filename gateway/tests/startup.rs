use std::process::{Command, Output};
use test_case::test_case;

const GATEWAY_ENV: [&str; 9] = [
	"DATABASE_URL",
	"GODWOKEN_JSON_RPC",
	"CLUSTER_COUNT",
	"PORT",
	"LOG_LEVEL",
	"LOG_FORMAT",
	"WEB3_LOG_REQUEST_BODY",
	"GATEWAY_FEATURES",
	"GATEWAY_MODE",
];

fn gateway(env: &[(&str, &str)]) -> Output {
	let mut command = Command::new(env!("CARGO_BIN_EXE_web3-gateway"));
	for name in GATEWAY_ENV {
		command.env_remove(name);
	}
	command
		.envs(env.iter().copied())
		.args(["--cluster-count", "0"])
		.output()
		.unwrap()
}

#[test_case(&[] => "DATABASE_URL" ; "database url missing")]
#[test_case(&[("DATABASE_URL", "postgres://localhost/web3")] => "GODWOKEN_JSON_RPC" ; "node url missing")]
#[test_case(&[("DATABASE_URL", "not a url"), ("GODWOKEN_JSON_RPC", "http://127.0.0.1:9")] => "DATABASE_URL" ; "database url invalid")]
fn missing_required_config_exits_before_listening(env: &[(&str, &str)]) -> &'static str {
	let output = gateway(env);
	assert!(!output.status.success());

	let stderr = String::from_utf8_lossy(&output.stderr);
	assert!(!String::from_utf8_lossy(&output.stdout).contains("Gateway running on"));
	["DATABASE_URL", "GODWOKEN_JSON_RPC"]
		.into_iter()
		.find(|name| stderr.contains(name))
		.unwrap_or("none")
}
