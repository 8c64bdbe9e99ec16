mod auth;
mod db;
mod ipc;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;

/// Backend daemon for a multi-branch martial-arts school. Speaks a
/// line-oriented JSON protocol on stdin/stdout; an HTTP edge maps REST
/// routes onto request methods and the bearer token onto `token`.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Directory holding the SQLite database.
    #[arg(long, env = "DOJANGD_DATA_DIR")]
    data_dir: PathBuf,

    /// Secret used to sign and verify session tokens.
    #[arg(long, env = "DOJANGD_JWT_SECRET", default_value = "dojangd-dev-secret")]
    jwt_secret: String,

    /// Password for the seeded admin account (first startup only).
    #[arg(long, env = "DOJANGD_ADMIN_PASSWORD", default_value = "admin123")]
    admin_password: String,
}

fn main() {
    // stdout is the protocol channel; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let conn = match db::open_db(&args.data_dir, &args.admin_password) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(
                "failed to open database in {}: {e:?}",
                args.data_dir.display()
            );
            std::process::exit(1);
        }
    };
    tracing::info!("dojangd ready, data dir {}", args.data_dir.display());

    let mut state = ipc::AppState {
        db: conn,
        jwt_secret: args.jwt_secret,
    };

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
                // Can't reply with the caller's id; best effort.
                let _ = writeln!(
                    stdout,
                    "{{\"ok\":false,\"error\":{{\"code\":\"bad_json\",\"message\":\"{}\"}}}}",
                    e
                );
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
