//! The container-command boundary: everything the sandbox dispatcher needs
//! from a running container, expressed as a trait so it can be faked in
//! tests without a real container runtime.

use std::path::Path;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::error::DispatchError;
use crate::log;

const LOG: &str = "container";

/// A single process observed inside the container, scoped to one UID.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub command: String,
    pub cpu_percent: f64,
    pub memory_mb: u64,
    /// Wall-clock start time, derived from the probe's elapsed-seconds
    /// reading (`etimes`) subtracted from the moment of the probe.
    pub start_time: SystemTime,
}

/// The command-runner facility a sandbox dispatcher is built on. The default
/// implementation (`DockerContainer`) shells out to the `docker` CLI; an
/// embedder may supply another implementation (e.g. a fake, for tests, or a
/// `podman`-backed one) at construction.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runs a command inside the container as an optional UID and working
    /// directory, returning combined stdout+stderr and the exit code.
    async fn exec(
        &self,
        as_uid: Option<u32>,
        working_dir: Option<&str>,
        command: &str,
        timeout_secs: u64,
    ) -> (String, i32);

    /// True iff the container is running.
    async fn health(&self) -> bool;

    /// Idempotent: creates the account for `uid`/`username` if it doesn't
    /// exist yet, then (re)chowns its home directory.
    async fn ensure_user(&self, uid: u32, username: &str, home_base: &Path) -> Result<(), DispatchError>;

    /// Spawns the interactive login shell as `uid` in `home_dir`, with the
    /// given terminal size, attached via `script` so it emits ANSI.
    /// `max_file_size_mb`, when set, is applied as a `ulimit -f` on the shell
    /// before it execs.
    fn spawn_interactive(
        &self,
        uid: u32,
        home_dir: &str,
        cols: u16,
        rows: u16,
        max_file_size_mb: Option<u64>,
    ) -> Result<Child, DispatchError>;

    async fn list_processes(&self, uid: u32) -> Result<Vec<ProcessSnapshot>, DispatchError>;
    async fn kill_process(&self, pid: u32) -> Result<(), DispatchError>;
    async fn kill_all(&self, uid: u32) -> Result<(), DispatchError>;
    async fn disk_usage_mb(&self, home_dir: &str) -> Result<u64, DispatchError>;
}

/// Shells out to the `docker` CLI (or a `docker`-compatible one, e.g. `podman`,
/// if `cli` is overridden).
pub struct DockerContainer {
    container_name: String,
    cli: String,
}

impl DockerContainer {
    pub fn new(container_name: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            cli: "docker".to_string(),
        }
    }

    pub fn with_cli(container_name: impl Into<String>, cli: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            cli: cli.into(),
        }
    }

    fn base_exec_args(&self, as_uid: Option<u32>, working_dir: Option<&str>) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if let Some(uid) = as_uid {
            args.push("-u".to_string());
            args.push(uid.to_string());
        }
        if let Some(wd) = working_dir {
            args.push("-w".to_string());
            args.push(wd.to_string());
        }
        args.push(self.container_name.clone());
        args
    }

    async fn run(&self, args: &[String], timeout_secs: u64) -> Result<(String, i32), DispatchError> {
        let mut cmd = Command::new(&self.cli);
        cmd.args(args);
        let child = cmd.output();
        match timeout(Duration::from_secs(timeout_secs), child).await {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok((combined.trim().to_string(), output.status.code().unwrap_or(-1)))
            }
            Ok(Err(e)) => Err(DispatchError::LaunchFailed(e.to_string())),
            Err(_) => Err(DispatchError::Timeout(timeout_secs)),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerContainer {
    async fn exec(
        &self,
        as_uid: Option<u32>,
        working_dir: Option<&str>,
        command: &str,
        timeout_secs: u64,
    ) -> (String, i32) {
        let mut args = self.base_exec_args(as_uid, working_dir);
        args.push("bash".to_string());
        args.push("-c".to_string());
        args.push(command.to_string());
        match self.run(&args, timeout_secs).await {
            Ok(result) => result,
            Err(e) => e.as_exit(),
        }
    }

    async fn health(&self) -> bool {
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}}".to_string(),
            self.container_name.clone(),
        ];
        matches!(self.run(&args, 5).await, Ok((out, 0)) if out.contains("true"))
    }

    async fn ensure_user(&self, uid: u32, username: &str, home_base: &Path) -> Result<(), DispatchError> {
        let home = home_base.join(username);
        let home_str = home.to_string_lossy().to_string();

        let check = vec![
            "exec".to_string(),
            self.container_name.clone(),
            "id".to_string(),
            "-u".to_string(),
            uid.to_string(),
        ];
        let exists = matches!(self.run(&check, 5).await, Ok((_, 0)));

        if !exists {
            let create = vec![
                "exec".to_string(),
                self.container_name.clone(),
                "useradd".to_string(),
                "-u".to_string(),
                uid.to_string(),
                "-m".to_string(),
                "-s".to_string(),
                "/bin/bash".to_string(),
                username.to_string(),
            ];
            if let Err(e) = self.run(&create, 10).await {
                eprintln!("{} ensure_user: useradd failed for uid={uid}: {e}", log::prefix(LOG));
            }
        }

        let chown = vec![
            "exec".to_string(),
            self.container_name.clone(),
            "chown".to_string(),
            "-R".to_string(),
            format!("{uid}:{uid}"),
            home_str,
        ];
        self.run(&chown, 10).await.map(|_| ())
    }

    fn spawn_interactive(
        &self,
        uid: u32,
        home_dir: &str,
        cols: u16,
        rows: u16,
        max_file_size_mb: Option<u64>,
    ) -> Result<Child, DispatchError> {
        let mut cmd = Command::new(&self.cli);
        cmd.args(["exec", "-i", "-u"]).arg(uid.to_string()).args(["-w", home_dir]).arg(&self.container_name);
        match max_file_size_mb {
            Some(mb) => {
                // ulimit -f is in 512-byte blocks.
                let blocks = mb.saturating_mul(2048);
                cmd.args(["bash", "-c"]).arg(format!(
                    "ulimit -f {blocks}; exec env TERM=xterm COLUMNS={cols} LINES={rows} script -qfc bash /dev/null"
                ));
            }
            None => {
                cmd.args(["env", "TERM=xterm"])
                    .arg(format!("COLUMNS={cols}"))
                    .arg(format!("LINES={rows}"))
                    .args(["script", "-qfc", "bash", "/dev/null"]);
            }
        }
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        cmd.spawn().map_err(|e| DispatchError::LaunchFailed(e.to_string()))
    }

    async fn list_processes(&self, uid: u32) -> Result<Vec<ProcessSnapshot>, DispatchError> {
        let args = vec![
            "exec".to_string(),
            self.container_name.clone(),
            "ps".to_string(),
            "-u".to_string(),
            uid.to_string(),
            "-o".to_string(),
            "pid,pcpu,rss,etimes,comm".to_string(),
            "--no-headers".to_string(),
        ];
        let (out, code) = self.run(&args, 5).await?;
        if code != 0 {
            return Ok(Vec::new());
        }
        let probed_at = SystemTime::now();
        let mut snapshots = Vec::new();
        for line in out.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                continue;
            }
            let pid = fields[0].parse().unwrap_or(0);
            let cpu_percent = fields[1].parse().unwrap_or(0.0);
            let rss_kb: u64 = fields[2].parse().unwrap_or(0);
            let etimes_secs: u64 = fields[3].parse().unwrap_or(0);
            let command = fields[4..].join(" ");
            let start_time = probed_at
                .checked_sub(Duration::from_secs(etimes_secs))
                .unwrap_or(probed_at);
            snapshots.push(ProcessSnapshot {
                pid,
                command,
                cpu_percent,
                memory_mb: rss_kb / 1024,
                start_time,
            });
        }
        Ok(snapshots)
    }

    async fn kill_process(&self, pid: u32) -> Result<(), DispatchError> {
        let args = vec![
            "exec".to_string(),
            self.container_name.clone(),
            "kill".to_string(),
            pid.to_string(),
        ];
        self.run(&args, 5).await.map(|_| ())
    }

    async fn kill_all(&self, uid: u32) -> Result<(), DispatchError> {
        let args = vec![
            "exec".to_string(),
            self.container_name.clone(),
            "pkill".to_string(),
            "-u".to_string(),
            uid.to_string(),
        ];
        self.run(&args, 5).await.map(|_| ())
    }

    async fn disk_usage_mb(&self, home_dir: &str) -> Result<u64, DispatchError> {
        let args = vec![
            "exec".to_string(),
            self.container_name.clone(),
            "du".to_string(),
            "-sm".to_string(),
            home_dir.to_string(),
        ];
        let (out, code) = self.run(&args, 10).await?;
        if code != 0 {
            return Ok(0);
        }
        Ok(out.split_whitespace().next().and_then(|s| s.parse().ok()).unwrap_or(0))
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Spawns local `sh` processes instead of shelling to a container binary.
    /// Honors `health`/`ensure_user` as in-memory flags so sandbox dispatcher
    /// and session manager tests can exercise real process lifecycles without
    /// a container daemon.
    pub struct FakeContainerRuntime {
        healthy: AtomicBool,
        pub ensured_users: Mutex<Vec<(u32, String)>>,
    }

    impl Default for FakeContainerRuntime {
        fn default() -> Self {
            Self::new()
        }
    }

    impl FakeContainerRuntime {
        pub fn new() -> Self {
            Self {
                healthy: AtomicBool::new(true),
                ensured_users: Mutex::new(Vec::new()),
            }
        }

        pub fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeContainerRuntime {
        async fn exec(
            &self,
            _as_uid: Option<u32>,
            working_dir: Option<&str>,
            command: &str,
            timeout_secs: u64,
        ) -> (String, i32) {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            if let Some(wd) = working_dir {
                cmd.current_dir(wd);
            }
            match timeout(Duration::from_secs(timeout_secs), cmd.output()).await {
                Ok(Ok(out)) => (
                    String::from_utf8_lossy(&out.stdout).trim().to_string(),
                    out.status.code().unwrap_or(-1),
                ),
                Ok(Err(e)) => (e.to_string(), -1),
                Err(_) => (format!("timeout after {timeout_secs}s"), -1),
            }
        }

        async fn health(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn ensure_user(&self, uid: u32, username: &str, _home_base: &Path) -> Result<(), DispatchError> {
            self.ensured_users.lock().unwrap().push((uid, username.to_string()));
            Ok(())
        }

        fn spawn_interactive(
            &self,
            _uid: u32,
            _home_dir: &str,
            _cols: u16,
            _rows: u16,
            _max_file_size_mb: Option<u64>,
        ) -> Result<Child, DispatchError> {
            Command::new("sh")
                .args(["-c", "cat"])
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .spawn()
                .map_err(|e| DispatchError::LaunchFailed(e.to_string()))
        }

        async fn list_processes(&self, _uid: u32) -> Result<Vec<ProcessSnapshot>, DispatchError> {
            Ok(Vec::new())
        }

        async fn kill_process(&self, _pid: u32) -> Result<(), DispatchError> {
            Ok(())
        }

        async fn kill_all(&self, _uid: u32) -> Result<(), DispatchError> {
            Ok(())
        }

        async fn disk_usage_mb(&self, _home_dir: &str) -> Result<u64, DispatchError> {
            Ok(0)
        }
    }
}
