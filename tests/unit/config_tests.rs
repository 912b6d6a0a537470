use std::io::Write;
use std::time::Duration;

use toolpipe::config::{ClientConfig, DEFAULT_MAX_FRAME_BYTES, DEFAULT_PROTOCOL_VERSION};
use toolpipe::AppError;

fn sample_toml() -> &'static str {
    r#"
max_frame_bytes = 4096

[server]
command = "node"
args = ["server.js", "--stdio"]
working_dir = "/srv/tools"
isolate_env = true

[server.env]
API_MODE = "local"

[client]
name = "toolpipe-test"
version = "9.9.9"
protocol_version = "2025-03-26"

[timeouts]
handshake_seconds = 5
request_seconds = 10
tool_call_seconds = 60
shutdown_grace_ms = 250
exit_grace_ms = 100

[tools]
allowed = ["read_*", "search"]
blocked = ["read_secret*"]
prefix = "fs_"
"#
}

fn minimal_toml() -> &'static str {
    r#"
[server]
command = "my-server"
"#
}

#[test]
fn parses_full_config() {
    let config = ClientConfig::from_toml_str(sample_toml()).expect("valid config");

    assert_eq!(config.server.command, "node");
    assert_eq!(config.server.args, vec!["server.js", "--stdio"]);
    assert_eq!(
        config.server.working_dir.as_deref(),
        Some(std::path::Path::new("/srv/tools"))
    );
    assert!(config.server.isolate_env);
    assert_eq!(config.server.env.get("API_MODE").map(String::as_str), Some("local"));
    assert_eq!(config.client.name, "toolpipe-test");
    assert_eq!(config.client.protocol_version, "2025-03-26");
    assert_eq!(config.timeouts.handshake(), Duration::from_secs(5));
    assert_eq!(config.timeouts.tool_call(), Duration::from_secs(60));
    assert_eq!(config.timeouts.shutdown_grace(), Duration::from_millis(250));
    assert_eq!(config.timeouts.exit_grace(), Duration::from_millis(100));
    assert_eq!(config.max_frame_bytes, 4096);
    assert_eq!(config.tools.blocked, vec!["read_secret*"]);
    assert_eq!(config.tools.prefix.as_deref(), Some("fs_"));
}

#[test]
fn minimal_config_uses_defaults() {
    let config = ClientConfig::from_toml_str(minimal_toml()).expect("valid config");

    assert!(config.server.args.is_empty());
    assert!(!config.server.isolate_env);
    assert_eq!(config.client.name, "toolpipe");
    assert_eq!(config.client.version, env!("CARGO_PKG_VERSION"));
    assert_eq!(config.client.protocol_version, DEFAULT_PROTOCOL_VERSION);
    assert_eq!(config.timeouts.request(), Duration::from_secs(30));
    assert_eq!(config.timeouts.tool_call(), Duration::from_secs(120));
    assert_eq!(config.timeouts.shutdown_grace(), Duration::from_millis(2000));
    assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    assert!(config.tools.allowed.is_none());
    assert!(config.tools.prefix.is_none());
}

#[test]
fn programmatic_config_matches_minimal_toml() {
    let built = ClientConfig::new("my-server", Vec::new());
    let parsed = ClientConfig::from_toml_str(minimal_toml()).expect("valid config");

    assert_eq!(built, parsed);
    built.validate().expect("defaults are valid");
}

#[test]
fn missing_server_section_is_rejected() {
    let err = ClientConfig::from_toml_str("max_frame_bytes = 10").expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn empty_command_is_rejected() {
    let err = ClientConfig::from_toml_str("[server]\ncommand = \"  \"\n").expect_err("must fail");
    assert_eq!(
        err,
        AppError::Config("server.command must not be empty".into())
    );
}

#[test]
fn zero_frame_limit_is_rejected() {
    let raw = format!("max_frame_bytes = 0\n{}", minimal_toml());
    let err = ClientConfig::from_toml_str(&raw).expect_err("must fail");
    assert!(err.to_string().contains("max_frame_bytes"), "got {err}");
}

#[test]
fn zero_request_timeout_is_rejected() {
    let raw = format!("{}\n[timeouts]\nrequest_seconds = 0\n", minimal_toml());
    let err = ClientConfig::from_toml_str(&raw).expect_err("must fail");
    assert!(err.to_string().contains("timeouts.request_seconds"), "got {err}");
}

#[test]
fn invalid_tool_pattern_is_rejected() {
    let raw = format!("{}\n[tools]\nblocked = [\"[unclosed\"]\n", minimal_toml());
    let err = ClientConfig::from_toml_str(&raw).expect_err("must fail");
    assert!(err.to_string().contains("invalid tool pattern"), "got {err}");
}

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(sample_toml().as_bytes()).expect("write config");

    let config = ClientConfig::load_from_path(file.path()).expect("load config");
    assert_eq!(config.server.command, "node");
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = ClientConfig::load_from_path(dir.path().join("absent.toml")).expect_err("must fail");

    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
    assert!(err.to_string().starts_with("config: failed to read config"));
}
