use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

/// How long a `which`/`where` or alias probe may take before we give up and
/// fall back to running the command through the user's shell.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const KNOWN_SHELLS: &[&str] = &["bash", "zsh", "sh", "fish", "dash", "ksh"];

/// Provenance of a resolution, kept so callers can log what happened to the
/// user's argv without mutating the original request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedKind {
    /// Found on PATH; argv[0] replaced with the absolute path.
    Path,
    /// A user alias; runs through the user's shell with `-i -c`.
    Alias,
    /// Not found anywhere; assumed to be a shell builtin.
    Builtin,
    /// The user asked for an interactive shell.
    InteractiveShell,
}

#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    pub argv: Vec<String>,
    pub kind: ResolvedKind,
}

fn user_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_shell(program: &str) -> bool {
    KNOWN_SHELLS.contains(&basename(program))
}

/// An interactive-shell request is a known shell invoked with no args or
/// only `-i` / `-l`.
fn is_interactive_shell_request(argv: &[String]) -> bool {
    if argv.is_empty() || !is_shell(&argv[0]) {
        return false;
    }
    argv[1..].iter().all(|arg| arg == "-i" || arg == "-l")
}

/// Runs a probe command, killing it if it exceeds [`PROBE_TIMEOUT`].
fn run_probe(program: &str, args: &[&str]) -> Option<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    let deadline = Instant::now() + PROBE_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    return None;
                }
                let mut output = String::new();
                use std::io::Read;
                child.stdout.take()?.read_to_string(&mut output).ok()?;
                return Some(output);
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    debug!(program, "probe timed out");
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(_) => return None,
        }
    }
}

fn which(program: &str) -> Option<PathBuf> {
    let probe = if cfg!(windows) { "where" } else { "which" };
    let output = run_probe(probe, &[program])?;
    let line = output.lines().next()?.trim();
    if line.is_empty() {
        return None;
    }
    let path = PathBuf::from(line);
    path.is_file().then_some(path)
}

/// Asks the user's shell for its alias table and looks up `name`. Bash
/// prints `alias name='body'`, zsh prints `name=body`.
fn lookup_alias(shell: &str, name: &str) -> Option<String> {
    let output = run_probe(shell, &["-i", "-c", "alias"])?;
    for line in output.lines() {
        let line = line.strip_prefix("alias ").unwrap_or(line);
        let Some((alias_name, body)) = line.split_once('=') else {
            continue;
        };
        if alias_name.trim() == name {
            let body = body.trim();
            let body = body
                .strip_prefix('\'')
                .and_then(|b| b.strip_suffix('\''))
                .unwrap_or(body);
            return Some(body.to_string());
        }
    }
    None
}

/// The rc file the shell would read, if one exists, so aliases and PATH
/// tweaks apply to one-shot commands too.
fn shell_rc_file(shell: &str) -> Option<PathBuf> {
    let home = crate::utils::home_dir()?;
    let candidate = match basename(shell) {
        "zsh" => home.join(".zshrc"),
        "bash" => home.join(".bashrc"),
        _ => return None,
    };
    candidate.exists().then_some(candidate)
}

/// Wraps a one-shot command line for execution through the user's shell,
/// sourcing the rc file when one is present so the invocation behaves like
/// the user's own prompt but exits when the command does.
fn through_shell(shell: &str, command_line: &str) -> Vec<String> {
    if let Some(rc) = shell_rc_file(shell) {
        vec![
            shell.to_string(),
            "-c".to_string(),
            format!(". {} >/dev/null 2>&1; {}", rc.display(), command_line),
        ]
    } else {
        vec![
            shell.to_string(),
            "-i".to_string(),
            "-c".to_string(),
            command_line.to_string(),
        ]
    }
}

/// Resolves the user's argv into the argv actually spawned.
///
/// The returned argv is what gets recorded in `session.json`; the caller's
/// original argv is never mutated.
pub fn resolve_command(argv: &[String]) -> ResolvedCommand {
    assert!(!argv.is_empty(), "empty command line");
    let program = &argv[0];
    let shell = user_shell();

    if is_interactive_shell_request(argv) {
        let path = which(program)
            .map_or_else(|| program.clone(), |p| p.to_string_lossy().to_string());
        let mut resolved = vec![path];
        resolved.push("-i".to_string());
        resolved.push("-l".to_string());
        return ResolvedCommand {
            argv: resolved,
            kind: ResolvedKind::InteractiveShell,
        };
    }

    if let Some(path) = which(program) {
        let mut resolved = vec![path.to_string_lossy().to_string()];
        resolved.extend(argv[1..].iter().cloned());
        return ResolvedCommand {
            argv: resolved,
            kind: ResolvedKind::Path,
        };
    }

    if let Some(alias_body) = lookup_alias(&shell, program) {
        let rest = shell_words::join(&argv[1..]);
        let command_line = if rest.is_empty() {
            alias_body
        } else {
            format!("{alias_body} {rest}")
        };
        return ResolvedCommand {
            argv: through_shell(&shell, &command_line),
            kind: ResolvedKind::Alias,
        };
    }

    // Not on PATH, not an alias: assume a shell builtin.
    let command_line = shell_words::join(argv);
    ResolvedCommand {
        argv: through_shell(&shell, &command_line),
        kind: ResolvedKind::Builtin,
    }
}

/// Pre-flight check mirroring what `execvp` will do, so spawn errors can be
/// reported before forking.
pub fn executable_error(argv: &[String]) -> Option<std::io::Error> {
    let program = argv.first()?;
    if !program.contains('/') {
        // Will be resolved through PATH at exec time.
        return None;
    }
    let path = Path::new(program);
    if !path.exists() {
        return Some(std::io::Error::from(std::io::ErrorKind::NotFound));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = path.metadata() {
            if metadata.permissions().mode() & 0o111 == 0 {
                return Some(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
            }
        }
    }
    None
}
