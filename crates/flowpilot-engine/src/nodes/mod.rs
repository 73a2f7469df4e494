// Built-in node executors, one module per node kind

pub mod chat_api;
pub mod chat_cli;
pub mod condition;
pub mod delay;
pub mod file_read;
pub mod file_write;
pub mod http;
pub mod loop_node;
pub mod parallel;
pub mod shell;

use std::path::PathBuf;
use std::time::Duration;

/// How long a subprocess gets to exit after the graceful terminate before
/// it is force-killed.
pub(crate) const KILL_GRACE: Duration = Duration::from_secs(5);

/// Terminate a child process: graceful terminate first, forceful kill after
/// the grace period, then await the exit so no zombie is left behind.
pub(crate) async fn terminate_child(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(pid, "subprocess ignored SIGTERM, killing");
    }

    let _ = child.kill().await;
}

/// Expand `~` and `$VAR` / `${VAR}` references in a filesystem path.
/// Unknown variables expand to the empty string.
pub(crate) fn expand_path(path: &str) -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_default();

    let tilde_expanded = if path == "~" {
        home.clone()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("{home}/{rest}")
    } else {
        path.to_string()
    };

    let var_pattern = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("static regex");
    let expanded = var_pattern.replace_all(&tilde_expanded, |caps: &regex::Captures<'_>| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        std::env::var(name).unwrap_or_default()
    });

    PathBuf::from(expanded.into_owned())
}
