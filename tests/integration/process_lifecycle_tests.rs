//! Integration tests against a real child process.
//!
//! The tool server is a small POSIX shell loop: it answers `initialize`,
//! fails `boom`, never answers `slow`, exits on `die`, reports a host
//! variable for `env`, writes junk and a stray response to stderr for
//! `noisy`, and otherwise returns the access token it was given
//! as double-encoded text content.

use std::time::Duration;

use serde_json::json;
use serial_test::serial;

use pr_scribe::config::ClientConfig;
use pr_scribe::rpc::codec::MAX_LINE_BYTES;
use pr_scribe::rpc::session::SessionOptions;
use pr_scribe::rpc::supervisor::ServerSpec;
use pr_scribe::{AppError, SessionState, ToolClient};

const FAKE_SERVER: &str = r#"
echo "fake server listening on stdio" >&2
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"fake-sh","version":"1"}}}\n' "$id" ;;
    *'"name":"die"'*)
      exit 0 ;;
    *'"name":"slow"'*)
      continue ;;
    *'"name":"boom"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32603,"message":"boom"}}\n' "$id" ;;
    *'"name":"noisy"'*)
      printf 'bad \377\376 bytes\n' >&2
      printf '{"jsonrpc":"2.0","id":%s,"result":"from stderr"}\n' "$id" >&2
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"{\\"stream\\":\\"stdout\\"}"}]}}\n' "$id" ;;
    *'"name":"env"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"{\\"leak\\":\\"%s\\"}"}]}}\n' "$id" "${PR_SCRIBE_LEAK_CHECK:-absent}" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"{\\"token\\":\\"%s\\"}"}]}}\n' "$id" "$GITHUB_PERSONAL_ACCESS_TOKEN" ;;
  esac
done
"#;

fn fake_spec() -> ServerSpec {
    ServerSpec {
        command: "sh".into(),
        args: vec!["-c".into(), FAKE_SERVER.into()],
        env: vec![("GITHUB_PERSONAL_ACCESS_TOKEN".into(), "ghp_fake".into())],
        working_dir: None,
    }
}

fn options(call_timeout: Duration) -> SessionOptions {
    SessionOptions {
        call_timeout,
        startup_grace: Duration::ZERO,
        stop_grace: Duration::from_millis(500),
        max_line_bytes: MAX_LINE_BYTES,
        initialize: true,
    }
}

#[tokio::test]
async fn round_trip_through_child_process() {
    let client = ToolClient::new(fake_spec(), options(Duration::from_secs(10)));
    assert_eq!(client.state(), SessionState::NotStarted);

    let value = client
        .invoke("get_me", json!({}))
        .await
        .expect("round trip");

    assert_eq!(value, json!({ "token": "ghp_fake" }));
    assert_eq!(client.state(), SessionState::Ready);

    client.shutdown().await.expect("shutdown");
    assert_eq!(client.state(), SessionState::Stopped);
}

#[tokio::test]
async fn explicit_start_brings_session_up_before_first_call() {
    let client = ToolClient::new(fake_spec(), options(Duration::from_secs(10)));
    let mut states = client.watch_state();

    client.start().await.expect("start");

    assert_eq!(*states.borrow_and_update(), SessionState::Ready);
    client.shutdown().await.expect("shutdown");
    states.changed().await.expect("state change observed");
    assert!(matches!(
        *states.borrow(),
        SessionState::Stopping | SessionState::Stopped
    ));
}

#[tokio::test]
async fn server_error_is_reported_and_session_survives() {
    let client = ToolClient::new(fake_spec(), options(Duration::from_secs(10)));

    let err = client.invoke("boom", json!({})).await.expect_err("fails");
    match err.root_cause() {
        AppError::Protocol { error, .. } => {
            assert_eq!(error.code, -32603);
            assert_eq!(error.message, "boom");
        }
        other => panic!("expected Protocol, got {other:?}"),
    }

    client
        .invoke("get_me", json!({}))
        .await
        .expect("session survives a server error");
    client.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn unanswered_call_times_out_and_session_survives() {
    let client = ToolClient::new(fake_spec(), options(Duration::from_millis(300)));

    let err = client.invoke("slow", json!({})).await.expect_err("timeout");
    assert!(err.is_timeout(), "got {err:?}");

    client
        .invoke("get_me", json!({}))
        .await
        .expect("session survives a timeout");
    client.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn spawn_failure_stops_the_client() {
    let spec = ServerSpec {
        command: "/definitely/not/a/tool-server".into(),
        ..fake_spec()
    };
    let client = ToolClient::new(spec, options(Duration::from_secs(1)));

    let err = client.invoke("get_me", json!({})).await.expect_err("spawn");
    assert!(matches!(err.root_cause(), AppError::Spawn(_)), "got {err:?}");
    assert!(err.is_fatal());
    assert_eq!(client.state(), SessionState::Stopped);

    let err = client.invoke("get_me", json!({})).await.expect_err("stopped");
    assert!(matches!(err.root_cause(), AppError::SessionClosed(_)));
}

#[tokio::test]
async fn empty_command_is_a_spawn_error() {
    let spec = ServerSpec {
        command: String::new(),
        ..fake_spec()
    };
    let client = ToolClient::new(spec, options(Duration::from_secs(1)));

    let err = client.start().await.expect_err("empty command");

    assert!(matches!(err, AppError::Spawn(_)), "got {err:?}");
}

#[tokio::test]
async fn server_exit_rejects_pending_call() {
    let client = ToolClient::new(fake_spec(), options(Duration::from_secs(10)));
    client.start().await.expect("start");

    let err = client.invoke("die", json!({})).await.expect_err("server exited");

    assert!(
        matches!(err.root_cause(), AppError::SessionClosed(msg) if msg.contains("closed its output stream")),
        "got {err:?}"
    );
    client.shutdown().await.expect("shutdown after exit");
}

#[tokio::test]
async fn server_exit_moves_client_to_stopped() {
    let client = ToolClient::new(fake_spec(), options(Duration::from_secs(10)));
    let mut states = client.watch_state();
    client.start().await.expect("start");

    client.invoke("die", json!({})).await.expect_err("server exited");

    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == SessionState::Stopped),
    )
    .await
    .expect("client stops after server exit")
    .expect("state sender alive");
    let err = client.invoke("get_me", json!({})).await.expect_err("stopped");
    assert!(matches!(err.root_cause(), AppError::SessionClosed(_)));
}

#[tokio::test]
async fn stderr_noise_is_logged_not_parsed() {
    let client = ToolClient::new(fake_spec(), options(Duration::from_secs(10)));

    for _ in 0..2 {
        let value = client
            .invoke("noisy", json!({}))
            .await
            .expect("stdout response wins");
        assert_eq!(value, json!({ "stream": "stdout" }));
    }
    assert_eq!(client.state(), SessionState::Ready);
    client.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn scoped_client_passes_token_and_shuts_down() {
    let mut config = ClientConfig::for_command("sh", vec!["-c".into(), FAKE_SERVER.into()]);
    config.timeouts.startup_grace_millis = 0;
    config.token = Some("ghp_scoped".into());

    let (value, states) = ToolClient::scoped(&config, |client| async move {
        let value = client.invoke("get_me", json!({})).await?;
        Ok::<_, AppError>((value, client.watch_state()))
    })
    .await
    .expect("scoped run");

    assert_eq!(value, json!({ "token": "ghp_scoped" }));
    assert_eq!(*states.borrow(), SessionState::Stopped);
}

#[tokio::test]
#[serial]
async fn host_environment_does_not_leak_into_server() {
    std::env::set_var("PR_SCRIBE_LEAK_CHECK", "leaked");
    let client = ToolClient::new(fake_spec(), options(Duration::from_secs(10)));

    let value = client.invoke("env", json!({})).await;

    std::env::remove_var("PR_SCRIBE_LEAK_CHECK");
    assert_eq!(value.expect("env tool"), json!({ "leak": "absent" }));
    client.shutdown().await.expect("shutdown");
}
