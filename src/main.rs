mod allocation;
mod auth;
mod backup;
mod db;
mod import;
mod ipc;
mod slots;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Exam hall seating daemon: JSON requests on stdin, responses on stdout.
#[derive(Parser, Debug)]
#[command(name = "examhalld", version, about, long_about = None)]
struct Cli {
    /// Workspace directory to open before serving requests
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Re-run seat allocation for one exam or every exam
    Regenerate {
        /// Workspace directory holding examhall.sqlite3
        #[arg(short, long)]
        workspace: PathBuf,

        /// Exam to regenerate (its whole slot is re-seated)
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        exam_id: Option<String>,

        /// Regenerate every exam
        #[arg(long)]
        all: bool,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("EXAMHALLD_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run_regenerate(workspace: PathBuf, exam_id: Option<String>, all: bool) -> anyhow::Result<bool> {
    let conn = db::open_db(&workspace)
        .with_context(|| format!("failed to open workspace {}", workspace.display()))?;
    let ids = match exam_id {
        Some(id) if !all => vec![id],
        _ => slots::all_exam_ids(&conn)?,
    };
    if ids.is_empty() {
        println!("no exams found");
        return Ok(true);
    }
    let mut all_ok = true;
    for id in ids {
        match slots::regenerate(&conn, &id) {
            Ok(outcome) => println!("ok {}: {}", id, outcome.message()),
            Err(e) => {
                all_ok = false;
                tracing::error!(exam = %id, "regenerate failed: {}", e);
                println!("failed {}: {}", id, e);
            }
        }
    }
    Ok(all_ok)
}

fn serve(mut state: ipc::AppState) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to echo back.
                tracing::warn!("bad request line: {}", e);
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::Regenerate {
            workspace,
            exam_id,
            all,
        }) => {
            if !run_regenerate(workspace, exam_id, all)? {
                std::process::exit(1);
            }
            Ok(())
        }
        None => {
            let mut state = ipc::AppState::default();
            if let Some(path) = cli.workspace {
                ipc::select_workspace(&mut state, path)?;
            }
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "examhalld ready");
            serve(state);
            Ok(())
        }
    }
}
