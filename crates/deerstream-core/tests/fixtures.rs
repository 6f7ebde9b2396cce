//! Event-log fixture helpers for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use wiremock::ResponseTemplate;

// Load fixture templates at compile time
pub const RESEARCH_TURN: &str = include_str!("fixtures/research_turn.sse");
pub const PLAN_INTERRUPT: &str = include_str!("fixtures/plan_interrupt.sse");
pub const BROKEN_ARGS: &str = include_str!("fixtures/broken_args.sse");

/// Fills in the thread id placeholder of a fixture.
pub fn with_thread(template: &str, thread_id: &str) -> String {
    template.replace("{{THREAD_ID}}", thread_id)
}

/// Wrap an event-stream body in a ResponseTemplate.
pub fn sse_response(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body.to_string())
}

/// Writes a log under a replay directory, creating parent directories.
pub fn write_log(root: &Path, log_path: &str, body: &str) {
    let full = root.join(log_path);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).expect("create replay dir");
    }
    fs::write(full, body).expect("write replay log");
}

pub fn can_bind_localhost() -> bool {
    std::net::TcpListener::bind("127.0.0.1:0").is_ok()
}
