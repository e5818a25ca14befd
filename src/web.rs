//! Read-only admin UI: a task index, a per-task detail page with captured
//! output, and the system log ring as plain text.

use crate::build_info;
use crate::logbuf;
use crate::tasks::output::Line;
use crate::tasks::registry;
use crate::tasks::task::{TaskStatus, fmt_ago, fmt_duration};
use askama::Template;
use axum::Router;
use axum::extract::Path as AxumPath;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use std::sync::Arc;

pub async fn serve(listener: std::net::TcpListener) -> anyhow::Result<()> {
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    let app = Router::new()
        .route("/", get(index_page))
        .route("/task/:name", get(task_page))
        .route("/log", get(log_page));
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Template)]
#[template(path = "status.html")]
struct IndexTemplate {
    rows: Vec<IndexRow>,
    build_banner: String,
}

struct IndexRow {
    name: String,
    summary: String,
}

#[derive(Template)]
#[template(path = "task.html")]
struct TaskTemplate {
    name: String,
    summary: String,
    running: Option<RunningView>,
    failures: Vec<FailureView>,
    output_of: String,
    lines: Vec<LineView>,
}

struct RunningView {
    id: String,
    pid: i32,
    uptime: String,
    argv: String,
}

struct FailureView {
    id: String,
    outcome: String,
    ago: String,
}

struct LineView {
    ts: String,
    stream: &'static str,
    data: String,
    truncated: bool,
}

async fn index_page() -> Response {
    let mut rows = Vec::new();
    for task in registry::list() {
        let summary = match task.status().await {
            Some(st) => st.summary(),
            None => "gone".to_string(),
        };
        rows.push(IndexRow {
            name: task.name().to_string(),
            summary,
        });
    }
    render(IndexTemplate {
        rows,
        build_banner: build_info::banner(),
    })
}

async fn task_page(AxumPath(name): AxumPath<String>) -> Response {
    let Some(task) = registry::get(&name) else {
        return (StatusCode::NOT_FOUND, format!("no such task {name:?}\n")).into_response();
    };
    let Some(st) = task.status().await else {
        return (StatusCode::NOT_FOUND, format!("task {name:?} is gone\n")).into_response();
    };
    render(task_view(&name, &st))
}

fn task_view(name: &str, st: &TaskStatus) -> TaskTemplate {
    let running = st.running.as_ref().map(|inst| RunningView {
        id: inst.id(),
        pid: inst.pid(),
        uptime: fmt_duration(inst.uptime()),
        argv: inst.lr.argv.join(" "),
    });
    let failures = st
        .failures
        .iter()
        .map(|inst| FailureView {
            id: inst.id(),
            outcome: match inst.exit() {
                Some(e) => e.result.to_string(),
                None => "no exit record".to_string(),
            },
            ago: match inst.exit() {
                Some(e) => fmt_ago(e.at),
                None => "?".to_string(),
            },
        })
        .collect();

    // Show the running instance's output; for a stopped task, the most
    // recent failure's output is the interesting part.
    let (output_of, lines) = match (&st.running, st.failures.last()) {
        (Some(inst), _) => (inst.id(), inst.output()),
        (None, Some(inst)) => (inst.id(), inst.output()),
        (None, None) => (String::new(), Vec::new()),
    };

    TaskTemplate {
        name: name.to_string(),
        summary: st.summary(),
        running,
        failures,
        output_of,
        lines: lines.iter().map(line_view).collect(),
    }
}

fn line_view(line: &Arc<Line>) -> LineView {
    LineView {
        ts: line.at.format("%H:%M:%S%.3f").to_string(),
        stream: line.stream.as_str(),
        data: line.data.clone(),
        truncated: line.truncated,
    }
}

async fn log_page() -> Response {
    ([("content-type", "text/plain; charset=utf-8")], logbuf::render()).into_response()
}

fn render<T: Template>(t: T) -> Response {
    match t.render() {
        Ok(s) => Html(s).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
