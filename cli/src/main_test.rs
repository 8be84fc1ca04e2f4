use super::*;

fn context() -> CliContext {
    let config = ClientConfig::new("http://127.0.0.1:9000").unwrap();
    let api = ApiClient::from_config(&config).unwrap();
    CliContext { config, api }
}

#[test]
fn commands_need_a_token() {
    let ctx = context();
    assert!(matches!(require_token(&ctx), Err(CliError::Api(ApiError::NotAuthenticated))));

    ctx.api.token().set(Some("abc".into()));
    assert!(require_token(&ctx).is_ok());
}

#[cfg(unix)]
#[test]
fn pipe_to_feeds_stdin() {
    pipe_to("cat", &[], "eggs").unwrap();
}

#[cfg(unix)]
#[test]
fn pipe_to_reports_a_failing_program() {
    let err = pipe_to("false", &[], "").unwrap_err();
    assert!(err.to_string().contains("false exited"));
}

#[cfg(unix)]
#[test]
fn pipe_to_reports_a_reader_that_quits_early() {
    // `true` never reads, so a payload larger than the pipe buffer cannot be written.
    let text = "x".repeat(1 << 20);
    assert!(pipe_to("true", &[], &text).is_err());
}
