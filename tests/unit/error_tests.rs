//! Unit tests for `AppError` display format and classification helpers.

use std::error::Error as _;
use std::time::Duration;

use serde_json::json;

use pr_scribe::rpc::envelope::RpcError;
use pr_scribe::AppError;

fn timeout(id: u64) -> AppError {
    AppError::Timeout {
        id,
        method: "tools/call".into(),
        after: Duration::from_secs(30),
    }
}

fn protocol(id: u64) -> AppError {
    AppError::Protocol {
        id,
        error: RpcError {
            code: -32602,
            message: "invalid params".into(),
            data: None,
        },
    }
}

#[test]
fn timeout_display_references_call_id() {
    let text = timeout(9).to_string();
    assert!(text.starts_with("timeout:"), "{text}");
    assert!(text.contains("call 9"), "{text}");
    assert!(text.contains("30s"), "{text}");
}

#[test]
fn protocol_display_includes_code_and_message() {
    assert_eq!(
        protocol(4).to_string(),
        "protocol: call 4 failed with code -32602: invalid params"
    );
}

#[test]
fn string_variants_use_prefixes() {
    assert_eq!(AppError::Spawn("no such file".into()).to_string(), "spawn: no such file");
    assert_eq!(AppError::Transport("write failed".into()).to_string(), "transport: write failed");
    assert_eq!(
        AppError::SessionClosed("session shut down".into()).to_string(),
        "session closed: session shut down"
    );
    assert_eq!(
        AppError::StreamTooLong(16).to_string(),
        "stream too long: line exceeded 16 bytes"
    );
}

#[test]
fn tool_error_wraps_cause_and_keeps_arguments() {
    let err = AppError::Tool {
        tool: "get_file_contents".into(),
        arguments: json!({ "path": "README.md" }),
        source: Box::new(timeout(9)),
    };

    assert!(err.to_string().starts_with("tool get_file_contents: timeout:"));
    assert!(err.source().is_some(), "source must expose the cause");
    match &err {
        AppError::Tool { arguments, .. } => assert_eq!(arguments["path"], "README.md"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn classification_looks_through_tool_wrapper() {
    let wrapped = |source| AppError::Tool {
        tool: "t".into(),
        arguments: json!({}),
        source: Box::new(source),
    };

    assert!(wrapped(timeout(1)).is_timeout());
    assert!(!wrapped(timeout(1)).is_protocol());
    assert!(wrapped(protocol(1)).is_protocol());
    assert!(wrapped(AppError::Spawn("x".into())).is_fatal());
    assert!(wrapped(AppError::SessionClosed("x".into())).is_fatal());
    assert!(!wrapped(timeout(1)).is_fatal());
}

#[test]
fn root_cause_of_plain_error_is_itself() {
    let err = AppError::Transport("x".into());
    assert!(matches!(err.root_cause(), AppError::Transport(_)));
}

#[test]
fn io_errors_convert() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
    assert!(matches!(err, AppError::Io(ref msg) if msg == "pipe"));
}
