//! Development mode: file-watch auto-restart and debugger attachment.
//!
//! An attacher is created per dev-mode server by the service. It starts
//! the server once on attach, watches the configured globs relative to
//! the server's first root, and coalesces change bursts into a single
//! stop/start cycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mcpd_core::domain::{DebugConfig, McpServerDefinition, McpServerLaunch};
use mcpd_core::ports::McpError;
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::server::{McpServer, StartOptions};

const NODE_DEFAULT_PORT: u16 = 9229;
const DEBUGPY_DEFAULT_PORT: u16 = 5678;
const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

/// Debugger port a rewritten launch will listen on.
pub fn debug_port(debug: &DebugConfig) -> u16 {
    match debug {
        DebugConfig::Node { port } => port.unwrap_or(NODE_DEFAULT_PORT),
        DebugConfig::Debugpy { port, .. } => port.unwrap_or(DEBUGPY_DEFAULT_PORT),
    }
}

/// Rewrite a stdio launch so the process starts suspended under a
/// debugger. HTTP launches cannot be debugged this way.
pub fn debug_launch(
    launch: &McpServerLaunch,
    debug: &DebugConfig,
) -> Result<McpServerLaunch, McpError> {
    let McpServerLaunch::Stdio {
        command,
        args,
        cwd,
        env,
        env_file,
    } = launch
    else {
        return Err(McpError::InvalidConfig(
            "debugging requires a stdio launch".to_string(),
        ));
    };
    let executable = executable_stem(command);

    match debug {
        DebugConfig::Node { port } => {
            if !executable.starts_with("node") {
                return Err(McpError::InvalidConfig(format!(
                    "node debugging requires a node executable, got '{command}'"
                )));
            }
            let port = port.unwrap_or(NODE_DEFAULT_PORT);
            let mut rewritten = vec![format!("--inspect-brk=127.0.0.1:{port}")];
            rewritten.extend(args.iter().cloned());
            Ok(McpServerLaunch::Stdio {
                command: command.clone(),
                args: rewritten,
                cwd: cwd.clone(),
                env: env.clone(),
                env_file: env_file.clone(),
            })
        }
        DebugConfig::Debugpy { port, debugpy_path } => {
            let port = port.unwrap_or(DEBUGPY_DEFAULT_PORT);
            let listen = format!("127.0.0.1:{port}");
            let (command, prefix) = match debugpy_path {
                Some(path) => (
                    path.to_string_lossy().into_owned(),
                    vec![
                        "--listen".to_string(),
                        listen,
                        "--wait-for-client".to_string(),
                    ],
                ),
                None if executable.starts_with("python") => (
                    command.clone(),
                    vec![
                        "-m".to_string(),
                        "debugpy".to_string(),
                        "--listen".to_string(),
                        listen,
                        "--wait-for-client".to_string(),
                    ],
                ),
                None => {
                    return Err(McpError::InvalidConfig(format!(
                        "debugpy debugging requires a python executable or an explicit debugpyPath, got '{command}'"
                    )));
                }
            };
            let mut rewritten = prefix;
            rewritten.extend(args.iter().cloned());
            Ok(McpServerLaunch::Stdio {
                command,
                args: rewritten,
                cwd: cwd.clone(),
                env: env.clone(),
                env_file: env_file.clone(),
            })
        }
    }
}

fn executable_stem(command: &str) -> String {
    Path::new(command)
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Poll until the debugger port accepts a connection, racing a timeout.
pub async fn wait_for_debugger(port: u16) -> Result<(), McpError> {
    let address = format!("127.0.0.1:{port}");
    let poll = async {
        loop {
            if tokio::net::TcpStream::connect(&address).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::time::timeout(ATTACH_TIMEOUT, poll)
        .await
        .map_err(|_| {
            McpError::DebugAttach(format!("debugger port {port} never opened"))
        })
}

/// Drives one dev-mode server; dropped when the server is disposed.
pub struct DevModeAttacher {
    _watcher: Option<notify::RecommendedWatcher>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl DevModeAttacher {
    /// Attach to a server whose definition carries a dev-mode block.
    /// Returns `None` for servers without one.
    pub fn attach(server: &Arc<McpServer>, definition: &McpServerDefinition) -> Option<Self> {
        let dev = definition.dev_mode.as_ref()?;
        let debug = dev.debug.clone();
        let options = StartOptions {
            interactive: false,
            debug: debug.is_some(),
        };

        let mut tasks = Vec::new();

        // Eligibility just began: start once, then wait for the debugger
        // to attach when one is configured.
        let this = Arc::clone(server);
        let start_debug = debug.clone();
        tasks.push(tokio::spawn(async move {
            this.start(options).await;
            if let Some(debug) = start_debug {
                if let Err(e) = wait_for_debugger(debug_port(&debug)).await {
                    tracing::warn!(server = %this.definition_id, error = %e, "Debugger did not attach");
                }
            }
        }));

        let watcher = if dev.watch.is_empty() {
            None
        } else {
            let root = definition
                .roots
                .first()
                .cloned()
                .unwrap_or_else(|| PathBuf::from("."));
            Self::spawn_watch(server, root, dev.watch.clone(), options, &mut tasks)
        };

        Some(Self {
            _watcher: watcher,
            tasks,
        })
    }

    fn spawn_watch(
        server: &Arc<McpServer>,
        root: PathBuf,
        patterns: Vec<String>,
        options: StartOptions,
        tasks: &mut Vec<tokio::task::JoinHandle<()>>,
    ) -> Option<notify::RecommendedWatcher> {
        // Capacity 1: a burst of changes while a restart is in flight
        // collapses into at most one queued trigger.
        let (tx, mut rx) = mpsc::channel::<()>(1);

        let match_root = root.clone();
        let match_patterns = patterns.clone();
        let watcher = notify::recommended_watcher(
            move |event: Result<notify::Event, notify::Error>| {
                let Ok(event) = event else { return };
                let hit = event.paths.iter().any(|path| {
                    let relative = path.strip_prefix(&match_root).unwrap_or(path);
                    let relative = relative.to_string_lossy().replace('\\', "/");
                    match_patterns.iter().any(|p| glob_match(p, &relative))
                });
                if hit {
                    let _ = tx.try_send(());
                }
            },
        );
        let mut watcher = match watcher {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create dev-mode file watcher");
                return None;
            }
        };
        if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
            tracing::warn!(root = %root.display(), error = %e, "Failed to watch dev-mode root");
            return None;
        }

        tasks.push(spawn_restart_loop(server, rx, options));

        Some(watcher)
    }
}

/// Restart the server once per received trigger, discarding triggers
/// that arrived while the restart was in flight.
fn spawn_restart_loop(
    server: &Arc<McpServer>,
    mut rx: mpsc::Receiver<()>,
    options: StartOptions,
) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(server);
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            let Some(server) = weak.upgrade() else { return };
            tracing::info!(
                server = %server.definition_id,
                "Watched file changed; restarting MCP server"
            );
            server.stop().await;
            server.start(options).await;
            // Changes that landed mid-restart are already covered.
            while rx.try_recv().is_ok() {}
        }
    })
}

impl Drop for DevModeAttacher {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Minimal glob matching: `**` crosses separators, `*` and `?` stay
/// within one path segment.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
        match (pattern.first(), path.first()) {
            (None, None) => true,
            (Some(&"**"), _) => {
                match_segments(&pattern[1..], path)
                    || (!path.is_empty() && match_segments(pattern, &path[1..]))
            }
            (Some(seg), Some(part)) => {
                match_segment(seg, part) && match_segments(&pattern[1..], &path[1..])
            }
            _ => false,
        }
    }

    fn match_segment(pattern: &str, text: &str) -> bool {
        let p: Vec<char> = pattern.chars().collect();
        let t: Vec<char> = text.chars().collect();
        match_chars(&p, &t)
    }

    fn match_chars(p: &[char], t: &[char]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                match_chars(&p[1..], t) || (!t.is_empty() && match_chars(p, &t[1..]))
            }
            (Some('?'), Some(_)) => match_chars(&p[1..], &t[1..]),
            (Some(a), Some(b)) if a == b => match_chars(&p[1..], &t[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('/').collect();
    let path: Vec<&str> = path.split('/').collect();
    match_segments(&pattern, &path)
}
