use crate::logbuf;
use crate::tasks::registry;
use crate::{watcher, web};
use clap::Parser;
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};

#[derive(Debug, Parser)]
#[command(name = "runsit", version, about = "runsit runs stuff")]
pub struct Args {
    /// Admin HTTP port on the listen address.
    #[arg(long = "http_port", default_value_t = 4762)]
    pub http_port: u16,

    /// Directory containing per-task *.json config files.
    #[arg(long = "config_dir", default_value = "/etc/runsit")]
    pub config_dir: PathBuf,
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    // The admin listener binds first: a supervisor nobody can reach is worse
    // than one that refuses to start.
    let listen_host = std::env::var("RUNSIT_LISTEN")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let addr = format!("{listen_host}:{}", args.http_port);
    let listener = match std::net::TcpListener::bind(&addr) {
        Ok(l) => l,
        Err(e) => {
            logbuf::log("web", None, format!("error listening on {addr}: {e}"));
            std::process::exit(1);
        }
    };
    logbuf::log("web", None, format!("listening on {addr}"));

    watcher::start(args.config_dir.clone())?;
    start_signal_handler();

    web::serve(listener).await
}

/// SIGINT/SIGTERM stop every task, then the process exits cleanly. Stop has
/// no timeout: each task loop kills its child's process group outright.
fn start_signal_handler() {
    tokio::spawn(async move {
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                logbuf::log("signal", None, format!("SIGINT handler failed: {e}"));
                return;
            }
        };
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                logbuf::log("signal", None, format!("SIGTERM handler failed: {e}"));
                return;
            }
        };
        let which = tokio::select! {
            _ = int.recv() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        };
        logbuf::log("signal", None, format!("got {which}; stopping all tasks"));
        for task in registry::list() {
            task.stop().await;
        }
        logbuf::log("signal", None, format!("tasks all stopped after {which}; quitting"));
        std::process::exit(0);
    });
}
