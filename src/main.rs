mod activity;
mod api_server;
mod bell;
mod buffers;
mod errors;
mod hq;
mod http_server;
mod input;
mod protocol;
mod recorder;
mod remotes;
mod resolver;
mod store;
mod stream;
mod supervisor;
mod tty_spawn;
mod utils;
mod watcher;

use std::path::PathBuf;

use anyhow::{anyhow, bail};
use clap::Parser;
use nix::sys::signal::Signal;
use tracing_subscriber::EnvFilter;

use crate::api_server::{RemoteRole, ServerConfig};
use crate::store::SessionStore;
use crate::supervisor::{CreateOptions, InputPayload, PtySupervisor};

/// Terminal session multiplexer: spawn commands under a PTY, record their
/// output, stream them live, and federate multiple hosts behind one HQ.
#[derive(Parser, Debug)]
#[command(name = "tty-hub", version, about)]
struct Args {
    /// Where the control folder is located
    #[arg(long)]
    control_path: Option<PathBuf>,

    /// List all sessions as JSON and exit
    #[arg(long)]
    list_sessions: bool,

    /// Names the session when creating
    #[arg(long)]
    session_name: Option<String>,

    /// Operate on this session
    #[arg(long)]
    session: Option<String>,

    /// Send key input to a session (arrow_up, arrow_down, arrow_left,
    /// arrow_right, escape, enter, ctrl_enter, shift_enter)
    #[arg(long)]
    send_key: Option<String>,

    /// Send text input to a session
    #[arg(long)]
    send_text: Option<String>,

    /// Send this signal number to a session
    #[arg(long)]
    signal: Option<i32>,

    /// Send SIGTERM to a session (equivalent to --signal 15)
    #[arg(long)]
    stop: bool,

    /// Send SIGKILL to a session (equivalent to --signal 9)
    #[arg(long)]
    kill: bool,

    /// Remove exited sessions (all if no --session given)
    #[arg(long)]
    cleanup: bool,

    /// Start the HTTP server on this port
    #[arg(long)]
    port: Option<u16>,

    /// Bind address for the HTTP server (default 127.0.0.1)
    #[arg(long)]
    bind: Option<String>,

    /// Serve dashboard assets from this directory
    #[arg(long)]
    static_path: Option<PathBuf>,

    /// Protect the HTTP surface with basic auth (any username)
    #[arg(long)]
    password: Option<String>,

    /// Bearer token for federated access (guards /api/health once set)
    #[arg(long)]
    token: Option<String>,

    /// Run as headquarters: register remotes and aggregate their sessions
    #[arg(long)]
    hq: bool,

    /// Federate with this HQ as a remote
    #[arg(long)]
    hq_url: Option<String>,

    /// Username for HQ basic auth
    #[arg(long)]
    hq_username: Option<String>,

    /// Password for HQ basic auth
    #[arg(long)]
    hq_password: Option<String>,

    /// This host's unique name within the federation
    #[arg(long)]
    name: Option<String>,

    /// The URL HQ should reach this host on
    #[arg(long)]
    url: Option<String>,

    /// Command to run in forward mode
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let control_path = args
        .control_path
        .clone()
        .unwrap_or_else(crate::utils::default_control_path);
    let store = SessionStore::new(control_path.clone());

    if args.list_sessions {
        let sessions: Vec<serde_json::Value> = store
            .list()?
            .into_iter()
            .map(|entry| {
                serde_json::json!({
                    "id": entry.id,
                    "info": entry.info,
                    "lastModified": entry.last_modified,
                })
            })
            .collect();
        println!("{}", serde_json::to_string(&sessions)?);
        return Ok(());
    }

    let supervisor = PtySupervisor::new(store, None);

    if let Some(key) = args.send_key {
        let session = required_session(&args.session, "--send-key")?;
        supervisor.send_input(&session, InputPayload::Key(key))?;
        return Ok(());
    }

    if let Some(text) = args.send_text {
        let session = required_session(&args.session, "--send-text")?;
        supervisor.send_input(&session, InputPayload::Text(text))?;
        return Ok(());
    }

    let signal = if args.kill {
        Some(Signal::SIGKILL)
    } else if args.stop {
        Some(Signal::SIGTERM)
    } else if let Some(number) = args.signal {
        Some(Signal::try_from(number).map_err(|_| anyhow!("Invalid signal number: {number}"))?)
    } else {
        None
    };
    if let Some(signal) = signal {
        let session = required_session(&args.session, "--signal/--stop/--kill")?;
        supervisor.kill(&session, signal)?;
        return Ok(());
    }

    if args.cleanup {
        match &args.session {
            Some(session) => supervisor.cleanup(session)?,
            None => {
                let removed = supervisor.cleanup_exited()?;
                tracing::info!(count = removed.len(), "removed exited sessions");
            }
        }
        return Ok(());
    }

    // server mode
    if args.port.is_some() || args.bind.is_some() {
        let bind = match (args.bind, args.port) {
            (Some(bind), Some(port)) if !bind.contains(':') => format!("{bind}:{port}"),
            (Some(bind), _) => bind,
            (None, Some(port)) => format!("127.0.0.1:{port}"),
            (None, None) => unreachable!(),
        };

        let remote_role = match &args.hq_url {
            Some(hq_url) => {
                let name = args
                    .name
                    .clone()
                    .ok_or_else(|| anyhow!("--name is required when federating with an HQ"))?;
                let our_url = args
                    .url
                    .clone()
                    .ok_or_else(|| anyhow!("--url is required when federating with an HQ"))?;
                Some(RemoteRole {
                    hq_url: hq_url.clone(),
                    hq_username: args.hq_username.clone().unwrap_or_default(),
                    hq_password: args.hq_password.clone().unwrap_or_default(),
                    name,
                    our_url,
                })
            }
            None => None,
        };
        if args.hq && remote_role.is_some() {
            bail!("--hq and --hq-url are mutually exclusive");
        }

        return api_server::start_server(ServerConfig {
            bind,
            control_path,
            static_path: args.static_path,
            password: args.password,
            token: args.token,
            hq_mode: args.hq,
            remote_role,
        });
    }

    // forward mode
    if args.command.is_empty() {
        bail!("No command provided; pass one after the flags or use --port to serve");
    }
    let exit_code = supervisor.spawn_forward(
        &args.command,
        CreateOptions {
            session_id: args.session,
            name: args.session_name,
            ..CreateOptions::default()
        },
    )?;
    std::process::exit(exit_code);
}

fn required_session(session: &Option<String>, flag: &str) -> anyhow::Result<String> {
    session
        .clone()
        .ok_or_else(|| anyhow!("{flag} requires --session <session_id>"))
}
