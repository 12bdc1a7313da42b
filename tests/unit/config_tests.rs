use std::time::Duration;

use serial_test::serial;

use pr_scribe::config::{load_token, ClientConfig, TOKEN_ENV_VAR};
use pr_scribe::AppError;

fn sample_toml() -> &'static str {
    r#"
[server]
command = "github-mcp-server"
args = ["stdio", "--read-only"]
token_env = "GITHUB_PERSONAL_ACCESS_TOKEN"
working_dir = "/tmp"
initialize = false

[[server.extra_env]]
name = "GITHUB_TOOLSETS"
value = "repos,pull_requests"

[timeouts]
call_seconds = 45
startup_grace_millis = 500
stop_grace_millis = 750

[limits]
max_line_bytes = 65536
"#
}

fn minimal_toml() -> &'static str {
    r#"
[server]
command = "github-mcp-server"
"#
}

#[test]
fn full_config_parses() {
    let config = ClientConfig::from_toml_str(sample_toml()).expect("valid config");

    assert_eq!(config.server.command, "github-mcp-server");
    assert_eq!(config.server.args, vec!["stdio", "--read-only"]);
    assert!(!config.server.initialize);
    assert_eq!(config.server.extra_env.len(), 1);
    assert_eq!(config.timeouts.call_seconds, 45);
    assert_eq!(config.limits.max_line_bytes, 65_536);
    assert!(config.token.is_none(), "token is never read from the file");
}

#[test]
fn minimal_config_uses_defaults() {
    let config = ClientConfig::from_toml_str(minimal_toml()).expect("valid config");

    assert_eq!(config.server.args, vec!["stdio"]);
    assert_eq!(config.server.token_env, "GITHUB_PERSONAL_ACCESS_TOKEN");
    assert!(config.server.initialize);
    assert_eq!(config.timeouts.call_seconds, 30);
    assert_eq!(config.timeouts.startup_grace_millis, 2000);
    assert_eq!(config.limits.max_line_bytes, 1_048_576);
}

#[test]
fn session_options_follow_config() {
    let config = ClientConfig::from_toml_str(sample_toml()).expect("valid config");
    let options = config.session_options();

    assert_eq!(options.call_timeout, Duration::from_secs(45));
    assert_eq!(options.startup_grace, Duration::from_millis(500));
    assert_eq!(options.stop_grace, Duration::from_millis(750));
    assert_eq!(options.max_line_bytes, 65_536);
    assert!(!options.initialize);
}

#[test]
fn server_spec_carries_token_under_token_env() {
    let mut config = ClientConfig::from_toml_str(sample_toml()).expect("valid config");
    config.token = Some("ghp_secret".into());

    let spec = config.server_spec();

    assert_eq!(spec.command, "github-mcp-server");
    assert!(spec
        .env
        .contains(&("GITHUB_PERSONAL_ACCESS_TOKEN".into(), "ghp_secret".into())));
    assert!(spec
        .env
        .contains(&("GITHUB_TOOLSETS".into(), "repos,pull_requests".into())));
    assert_eq!(spec.working_dir.as_deref(), Some(std::path::Path::new("/tmp")));
}

#[test]
fn debug_output_never_shows_the_token() {
    let mut config = ClientConfig::from_toml_str(minimal_toml()).expect("valid config");
    config.token = Some("ghp_secret".into());

    let config_debug = format!("{config:?}");
    let spec_debug = format!("{:?}", config.server_spec());

    assert!(!config_debug.contains("ghp_secret"), "{config_debug}");
    assert!(!spec_debug.contains("ghp_secret"), "{spec_debug}");
    assert!(spec_debug.contains("GITHUB_PERSONAL_ACCESS_TOKEN"));
}

#[test]
fn empty_command_is_rejected() {
    let err = ClientConfig::from_toml_str("[server]\ncommand = \"  \"\n").expect_err("invalid");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("server.command")));
}

#[test]
fn zero_call_timeout_is_rejected() {
    let raw = format!("{}\n[timeouts]\ncall_seconds = 0\n", minimal_toml());
    let err = ClientConfig::from_toml_str(&raw).expect_err("invalid");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("call_seconds")));
}

#[test]
fn zero_line_limit_is_rejected() {
    let raw = format!("{}\n[limits]\nmax_line_bytes = 0\n", minimal_toml());
    let err = ClientConfig::from_toml_str(&raw).expect_err("invalid");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("max_line_bytes")));
}

#[test]
fn token_in_extra_env_is_rejected() {
    let raw = r#"
[server]
command = "github-mcp-server"

[[server.extra_env]]
name = "GITHUB_PERSONAL_ACCESS_TOKEN"
value = "inline"
"#;
    let err = ClientConfig::from_toml_str(raw).expect_err("invalid");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("extra_env")));
}

#[test]
fn missing_server_section_is_a_config_error() {
    let err = ClientConfig::from_toml_str("[timeouts]\ncall_seconds = 5\n").expect_err("invalid");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn load_from_path_reads_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, sample_toml()).expect("write config");

    let config = ClientConfig::load_from_path(&path).expect("load");

    assert_eq!(config.timeouts.call_seconds, 45);
}

#[test]
fn load_from_missing_path_is_a_config_error() {
    let err = ClientConfig::load_from_path("/definitely/not/here.toml").expect_err("missing");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("failed to read config")));
}

#[tokio::test]
#[serial]
async fn token_falls_back_to_named_env_var() {
    std::env::remove_var(TOKEN_ENV_VAR);
    std::env::set_var("PR_SCRIBE_TEST_TOKEN_ENV", "from-named-var");

    let token = load_token("PR_SCRIBE_TEST_TOKEN_ENV").await.expect("token");

    std::env::remove_var("PR_SCRIBE_TEST_TOKEN_ENV");
    assert_eq!(token, "from-named-var");
}

#[tokio::test]
#[serial]
async fn dedicated_env_var_takes_precedence() {
    std::env::set_var(TOKEN_ENV_VAR, "from-dedicated-var");
    std::env::set_var("PR_SCRIBE_TEST_TOKEN_ENV", "from-named-var");

    let token = load_token("PR_SCRIBE_TEST_TOKEN_ENV").await.expect("token");

    std::env::remove_var(TOKEN_ENV_VAR);
    std::env::remove_var("PR_SCRIBE_TEST_TOKEN_ENV");
    assert_eq!(token, "from-dedicated-var");
}

#[tokio::test]
#[serial]
async fn missing_token_is_a_config_error() {
    std::env::remove_var(TOKEN_ENV_VAR);
    std::env::remove_var("PR_SCRIBE_TEST_TOKEN_ENV");

    let err = load_token("PR_SCRIBE_TEST_TOKEN_ENV").await.expect_err("no token");

    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("access token not found")));
}
