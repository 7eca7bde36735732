//! Starting worker subprocesses.
//!
//! The forking launcher keeps one long-lived spawning process. Each launch is
//! one line on that process's stdin naming the local account and the
//! registration name the new worker must publish under. The spawning process
//! reports back on stdout:
//!
//! ```text
//! spawned <registration-name> <pid>
//! exited <registration-name> <exit-code>
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::errors::RunError;

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Ask for a worker running as `local_user` that will register as
    /// `registration_name`. Returns once the request has been handed over,
    /// not once the worker is up.
    async fn launch(&self, local_user: &str, registration_name: &str) -> Result<(), RunError>;

    /// Exit code of a launched worker, once it is known to have exited.
    fn exit_code(&self, registration_name: &str) -> Option<i32>;

    /// Drop what is known about a worker that has been replaced.
    fn forget(&self, registration_name: &str);

    /// Ask the spawning side to exit, waiting at most `wait` before killing it.
    /// Returns the spawning process's exit code when one was observed.
    async fn shutdown(&self, wait: Duration) -> Option<i32>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkerEvent {
    Spawned { pid: u32 },
    Exited { code: i32 },
}

struct ForkerProcess {
    child: Child,
    control: Option<ChildStdin>,
    reader: JoinHandle<()>,
}

pub struct ForkingLauncher {
    command: String,
    args: Vec<String>,
    process: AsyncMutex<Option<ForkerProcess>>,
    events: Arc<Mutex<HashMap<String, WorkerEvent>>>,
}

impl ForkingLauncher {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            command: config.forker_command.clone(),
            args: config.forker_args.clone(),
            process: AsyncMutex::new(None),
            events: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn spawn_forker(&self) -> Result<ForkerProcess, RunError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(command = %self.command, error = %e, "Failed to start worker forker");
                RunError::connectivity(format!("cannot start forker '{}': {e}", self.command))
            })?;

        let control = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunError::implementation("forker stdout was not captured"))?;

        let events = Arc::clone(&self.events);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => record_event(&events, &line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Lost forker report stream");
                        break;
                    }
                }
            }
        });

        info!(
            command = %self.command,
            system_pid = ?child.id(),
            "Worker forker started"
        );

        Ok(ForkerProcess {
            child,
            control,
            reader,
        })
    }
}

fn record_event(events: &Mutex<HashMap<String, WorkerEvent>>, line: &str) {
    let mut parts = line.split_whitespace();
    let event = match (parts.next(), parts.next(), parts.next()) {
        (Some("spawned"), Some(name), Some(pid)) => pid
            .parse()
            .ok()
            .map(|pid| (name.to_string(), WorkerEvent::Spawned { pid })),
        (Some("exited"), Some(name), Some(code)) => code
            .parse()
            .ok()
            .map(|code| (name.to_string(), WorkerEvent::Exited { code })),
        _ => None,
    };

    match event {
        Some((name, event)) => {
            debug!(registration_name = %name, event = ?event, "Forker report");
            if let Ok(mut events) = events.lock() {
                events.insert(name, event);
            }
        }
        None => debug!(line = %line, "Ignoring unrecognised forker output"),
    }
}

#[async_trait]
impl WorkerLauncher for ForkingLauncher {
    async fn launch(&self, local_user: &str, registration_name: &str) -> Result<(), RunError> {
        if local_user.chars().any(char::is_whitespace)
            || registration_name.chars().any(char::is_whitespace)
        {
            return Err(RunError::invalid_argument(
                "launch arguments must not contain whitespace",
            ));
        }

        let mut process = self.process.lock().await;
        let alive = match process.as_mut() {
            Some(forker) => matches!(forker.child.try_wait(), Ok(None)),
            None => false,
        };
        if !alive {
            if let Some(dead) = process.take() {
                dead.reader.abort();
                warn!("Worker forker had exited; starting a new one");
            }
            *process = Some(self.spawn_forker()?);
        }

        let forker = process
            .as_mut()
            .ok_or_else(|| RunError::implementation("forker missing after start"))?;
        let control = forker
            .control
            .as_mut()
            .ok_or_else(|| RunError::bad_state("forker control channel already closed"))?;

        let line = format!("{local_user} {registration_name}\n");
        let written = async {
            control.write_all(line.as_bytes()).await?;
            control.flush().await
        }
        .await;

        written.map_err(|e| {
            RunError::connectivity(format!("forker control channel write failed: {e}"))
        })?;

        info!(
            local_user = %local_user,
            registration_name = %registration_name,
            "Worker launch requested"
        );
        Ok(())
    }

    fn exit_code(&self, registration_name: &str) -> Option<i32> {
        let events = self.events.lock().ok()?;
        match events.get(registration_name) {
            Some(WorkerEvent::Exited { code }) => Some(*code),
            _ => None,
        }
    }

    fn forget(&self, registration_name: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.remove(registration_name);
        }
    }

    async fn shutdown(&self, wait: Duration) -> Option<i32> {
        let mut forker = self.process.lock().await.take()?;

        // Closing stdin is the exit request.
        drop(forker.control.take());

        let code = match timeout(wait, forker.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed waiting for worker forker");
                None
            }
            Err(_) => {
                warn!(
                    wait_secs = wait.as_secs_f64(),
                    "Worker forker did not exit in time; killing it"
                );
                if let Err(e) = forker.child.kill().await {
                    warn!(error = %e, "Failed to kill worker forker");
                }
                forker.child.wait().await.ok().and_then(|s| s.code())
            }
        };

        forker.reader.abort();
        info!(exit_code = ?code, "Worker forker stopped");
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launcher(command: &str, args: &[&str]) -> ForkingLauncher {
        ForkingLauncher::new(&WorkerConfig {
            forker_command: command.to_string(),
            forker_args: args.iter().map(|a| a.to_string()).collect(),
            ..WorkerConfig::default()
        })
    }

    #[test]
    fn test_forker_reports_are_parsed() {
        let events = Mutex::new(HashMap::new());
        record_event(&events, "spawned worker-a 4242");
        record_event(&events, "exited worker-b 3");
        record_event(&events, "garbage line");

        let events = events.into_inner().unwrap();
        assert_eq!(events.get("worker-a"), Some(&WorkerEvent::Spawned { pid: 4242 }));
        assert_eq!(events.get("worker-b"), Some(&WorkerEvent::Exited { code: 3 }));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_replaced_workers_are_forgotten() {
        let launcher = launcher("cat", &[]);
        record_event(&launcher.events, "spawned worker-5 100");
        record_event(&launcher.events, "exited worker-5 2");
        record_event(&launcher.events, "spawned worker-6 101");
        assert_eq!(launcher.exit_code("worker-5"), Some(2));

        launcher.forget("worker-5");

        assert_eq!(launcher.exit_code("worker-5"), None);
        let events = launcher.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events.contains_key("worker-6"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_forker_exits_when_control_channel_closes() {
        // `cat` echoes nothing useful back but exits cleanly on EOF.
        let launcher = launcher("cat", &[]);
        launcher.launch("alice", "worker-1").await.unwrap();
        let code = launcher.shutdown(Duration::from_secs(5)).await;
        assert_eq!(code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_forker_reports_exit_codes() {
        let script = "while read user name; do echo \"exited $name 7\"; done";
        let launcher = launcher("sh", &["-c", script]);
        launcher.launch("alice", "worker-2").await.unwrap();

        let mut code = None;
        for _ in 0..50 {
            code = launcher.exit_code("worker-2");
            if code.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(code, Some(7));
        launcher.shutdown(Duration::from_secs(5)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stubborn_forker_is_killed() {
        let launcher = launcher("sh", &["-c", "trap '' TERM; exec sleep 30"]);
        launcher.launch("alice", "worker-3").await.unwrap();
        let code = launcher.shutdown(Duration::from_millis(200)).await;
        // Killed by signal: no exit code.
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn test_missing_forker_is_a_connectivity_failure() {
        let launcher = launcher("definitely-not-a-real-forker-binary", &[]);
        let err = launcher.launch("alice", "worker-4").await.unwrap_err();
        assert!(matches!(err, RunError::ConnectivityFailure { .. }));
    }
}
