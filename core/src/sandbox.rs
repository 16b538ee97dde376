//! Stateless command execution and interactive shell spawning inside the
//! container, scoped per owner by a deterministically derived UID.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::config::ResourceLimits;
use crate::container::{ContainerRuntime, ProcessSnapshot};
use crate::error::DispatchError;
use crate::log;

const LOG: &str = "sandbox";

fn derive_uid(owner_id: &str, base: u32, modulus: u32) -> u32 {
    let digest = Sha256::digest(owner_id.as_bytes());
    let hash_val = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    base + (hash_val % modulus)
}

/// What `read_output` observed within its timeout.
pub enum ReadOutcome {
    Data(Vec<u8>),
    Eof,
    TimedOut,
}

/// An owning handle to a spawned interactive shell: a writable stdin, a
/// chunked stdout reader, and exit observation, all backed by background
/// tasks bridging the child's blocking-free tokio I/O into channels the
/// session manager can poll with its own timeouts.
pub struct InteractiveHandle {
    stdin: Arc<AsyncMutex<Option<ChildStdin>>>,
    output_rx: mpsc::Receiver<Vec<u8>>,
    exit_rx: watch::Receiver<Option<i32>>,
    child: Arc<AsyncMutex<Child>>,
}

impl InteractiveHandle {
    fn new(mut child: Child) -> Self {
        let stdin = child.stdin.take();
        let mut stdout = child.stdout.take();

        let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            let Some(mut stdout) = stdout.take() else { return };
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let child = Arc::new(AsyncMutex::new(child));
        let child_for_wait = Arc::clone(&child);
        tokio::spawn(async move {
            let status = {
                let mut guard = child_for_wait.lock().await;
                guard.wait().await
            };
            let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
            let _ = exit_tx.send(Some(code));
        });

        Self {
            stdin: Arc::new(AsyncMutex::new(stdin)),
            output_rx: rx,
            exit_rx,
            child,
        }
    }

    pub async fn stdin_write(&self, bytes: &[u8]) -> Result<(), DispatchError> {
        let mut guard = self.stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            stdin.write_all(bytes).await?;
            stdin.flush().await?;
        }
        Ok(())
    }

    /// Waits up to `timeout_dur` for the next chunk of output.
    pub async fn read_output(&mut self, timeout_dur: Duration) -> ReadOutcome {
        match tokio::time::timeout(timeout_dur, self.output_rx.recv()).await {
            Ok(Some(chunk)) => ReadOutcome::Data(chunk),
            Ok(None) => ReadOutcome::Eof,
            Err(_) => ReadOutcome::TimedOut,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Graceful shutdown request (SIGTERM on Unix). Follow up with `wait`,
    /// then `kill` if it doesn't exit in time.
    #[cfg(unix)]
    pub async fn terminate(&self) {
        let guard = self.child.lock().await;
        if let Some(pid) = guard.id() {
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    pub async fn terminate(&self) {
        self.kill().await;
    }

    pub async fn kill(&self) {
        let mut guard = self.child.lock().await;
        let _ = guard.start_kill();
    }

    /// Waits up to `timeout_dur` for the process to have already exited,
    /// returning its exit code if so.
    pub async fn wait(&self, timeout_dur: Duration) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        if let Some(code) = *rx.borrow() {
            return Some(code);
        }
        let _ = tokio::time::timeout(timeout_dur, rx.changed()).await;
        *rx.borrow()
    }

    /// A cheap, cloneable handle to everything but the output stream: lets
    /// the session manager keep writing stdin and controlling the process
    /// from its own task after handing the `InteractiveHandle` itself (and
    /// its output receiver) off to the dedicated reader task.
    pub fn control(&self) -> InteractiveControl {
        InteractiveControl {
            stdin: Arc::clone(&self.stdin),
            exit_rx: self.exit_rx.clone(),
            child: Arc::clone(&self.child),
        }
    }
}

/// Everything about an `InteractiveHandle` except its output stream: stdin
/// writes, exit observation, and termination. Cloneable so both the reader
/// task and the session's own close path can act on the same process.
#[derive(Clone)]
pub struct InteractiveControl {
    stdin: Arc<AsyncMutex<Option<ChildStdin>>>,
    exit_rx: watch::Receiver<Option<i32>>,
    child: Arc<AsyncMutex<Child>>,
}

impl InteractiveControl {
    pub async fn stdin_write(&self, bytes: &[u8]) -> Result<(), DispatchError> {
        let mut guard = self.stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            stdin.write_all(bytes).await?;
            stdin.flush().await?;
        }
        Ok(())
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    #[cfg(unix)]
    pub async fn terminate(&self) {
        let guard = self.child.lock().await;
        if let Some(pid) = guard.id() {
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    pub async fn terminate(&self) {
        self.kill().await;
    }

    pub async fn kill(&self) {
        let mut guard = self.child.lock().await;
        let _ = guard.start_kill();
    }

    pub async fn wait(&self, timeout_dur: Duration) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        if let Some(code) = *rx.borrow() {
            return Some(code);
        }
        let _ = tokio::time::timeout(timeout_dur, rx.changed()).await;
        *rx.borrow()
    }
}

/// Stateless facade over a `ContainerRuntime`: UID mapping, one-shot
/// execution, interactive shell spawning, and resource accounting. Holds no
/// session state of its own (the session manager owns that).
pub struct SandboxDispatcher {
    runtime: Arc<dyn ContainerRuntime>,
    home_base: PathBuf,
    limits: ResourceLimits,
    uid_base: u32,
    uid_modulus: u32,
    uid_cache: DashMap<String, u32>,
}

impl SandboxDispatcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        home_base: PathBuf,
        limits: ResourceLimits,
        uid_base: u32,
        uid_modulus: u32,
    ) -> Self {
        Self {
            runtime,
            home_base,
            limits,
            uid_base,
            uid_modulus,
            uid_cache: DashMap::new(),
        }
    }

    /// Deterministic, stable for the dispatcher's lifetime once assigned.
    pub fn uid_for(&self, owner_id: &str) -> u32 {
        if let Some(existing) = self.uid_cache.get(owner_id) {
            return *existing;
        }
        let uid = derive_uid(owner_id, self.uid_base, self.uid_modulus);
        self.uid_cache.insert(owner_id.to_string(), uid);
        uid
    }

    fn home_dir(&self, username: &str) -> String {
        self.home_base.join(username).to_string_lossy().into_owned()
    }

    pub async fn health(&self) -> bool {
        self.runtime.health().await
    }

    pub async fn execute(
        &self,
        command: &str,
        as_owner: Option<&str>,
        working_dir: Option<&str>,
        timeout_secs: u64,
    ) -> (String, i32) {
        if !self.runtime.health().await {
            return DispatchError::HealthDown.as_exit();
        }
        let uid = as_owner.map(|owner| self.uid_for(owner));
        self.runtime.exec(uid, working_dir, command, timeout_secs).await
    }

    pub async fn ensure_user(&self, owner_id: &str, username: &str) -> Result<(), DispatchError> {
        let uid = self.uid_for(owner_id);
        self.runtime.ensure_user(uid, username, &self.home_base).await
    }

    pub async fn open_interactive(
        &self,
        owner_id: &str,
        username: &str,
        cols: u16,
        rows: u16,
    ) -> Result<InteractiveHandle, DispatchError> {
        if !self.runtime.health().await {
            return Err(DispatchError::HealthDown);
        }
        self.ensure_user(owner_id, username).await?;
        let uid = self.uid_for(owner_id);
        let home_dir = self.home_dir(username);
        let child = self
            .runtime
            .spawn_interactive(uid, &home_dir, cols, rows, Some(self.limits.max_file_size_mb))?;
        Ok(InteractiveHandle::new(child))
    }

    pub async fn list_processes(&self, owner_id: &str) -> Result<Vec<ProcessSnapshot>, DispatchError> {
        self.runtime.list_processes(self.uid_for(owner_id)).await
    }

    /// Restricted to the owner's own UID: refuses to kill a pid that isn't
    /// currently one of theirs.
    pub async fn kill_process(&self, owner_id: &str, pid: u32) -> Result<(), DispatchError> {
        let procs = self.list_processes(owner_id).await?;
        if !procs.iter().any(|p| p.pid == pid) {
            return Err(DispatchError::LaunchFailed(format!("pid {pid} is not owned by this user")));
        }
        self.runtime.kill_process(pid).await
    }

    pub async fn kill_all(&self, owner_id: &str) -> Result<(), DispatchError> {
        self.runtime.kill_all(self.uid_for(owner_id)).await
    }

    /// Enforces `ResourceLimits` for the owner. A probe failure (container
    /// transiently unreachable) does not itself refuse the attempt; only an
    /// actual limit breach does.
    pub async fn check_limits(&self, owner_id: &str, username: &str) -> (bool, Option<String>) {
        let uid = self.uid_for(owner_id);
        let procs = match self.runtime.list_processes(uid).await {
            Ok(p) => p,
            Err(e) => {
                eprintln!("{} check_limits: process probe failed for uid={uid}: {e}", log::prefix(LOG));
                return (true, None);
            }
        };

        if procs.len() as u32 > self.limits.max_processes {
            return (
                false,
                Some(format!("too many processes ({} > {})", procs.len(), self.limits.max_processes)),
            );
        }

        let cpu_sum: f64 = procs.iter().map(|p| p.cpu_percent).sum();
        if cpu_sum > self.limits.max_cpu_percent {
            return (
                false,
                Some(format!("cpu usage too high ({cpu_sum:.1}% > {}%)", self.limits.max_cpu_percent)),
            );
        }

        let mem_sum: u64 = procs.iter().map(|p| p.memory_mb).sum();
        if mem_sum > self.limits.max_memory_mb {
            return (
                false,
                Some(format!("memory usage too high ({mem_sum}MB > {}MB)", self.limits.max_memory_mb)),
            );
        }

        let home_dir = self.home_dir(username);
        if let Ok(disk_mb) = self.runtime.disk_usage_mb(&home_dir).await {
            if disk_mb > self.limits.max_disk_mb {
                return (
                    false,
                    Some(format!("disk usage too high ({disk_mb}MB > {}MB)", self.limits.max_disk_mb)),
                );
            }
        }

        (true, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_derivation_is_deterministic() {
        let a = derive_uid("user-42", 1000, 2_147_483_147);
        let b = derive_uid("user-42", 1000, 2_147_483_147);
        assert_eq!(a, b);
        assert!(a >= 1000);
    }

    #[test]
    fn uid_derivation_differs_across_owners() {
        let a = derive_uid("user-1", 1000, 2_147_483_147);
        let b = derive_uid("user-2", 1000, 2_147_483_147);
        assert_ne!(a, b);
    }

    fn dispatcher_with_fake() -> (Arc<SandboxDispatcher>, Arc<crate::container::fake::FakeContainerRuntime>) {
        let runtime = Arc::new(crate::container::fake::FakeContainerRuntime::new());
        let dispatcher = Arc::new(SandboxDispatcher::new(
            runtime.clone(),
            PathBuf::from("/tmp"),
            ResourceLimits::default(),
            1000,
            2_147_483_147,
        ));
        (dispatcher, runtime)
    }

    #[tokio::test]
    async fn execute_runs_command_and_captures_output() {
        let (dispatcher, _runtime) = dispatcher_with_fake();
        let (out, code) = dispatcher.execute("echo hi", None, None, 5).await;
        assert_eq!(code, 0);
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn execute_refuses_when_unhealthy() {
        let (dispatcher, runtime) = dispatcher_with_fake();
        runtime.set_healthy(false);
        let (out, code) = dispatcher.execute("echo hi", None, None, 5).await;
        assert_eq!(code, -1);
        assert!(out.contains("not running"));
    }

    #[tokio::test]
    async fn ensure_user_is_idempotent_and_records_uid() {
        let (dispatcher, runtime) = dispatcher_with_fake();
        dispatcher.ensure_user("owner-1", "alice").await.unwrap();
        dispatcher.ensure_user("owner-1", "alice").await.unwrap();
        let recorded = runtime.ensured_users.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].0, dispatcher.uid_for("owner-1"));
    }

    #[tokio::test]
    async fn open_interactive_allows_stdin_roundtrip() {
        let (dispatcher, _runtime) = dispatcher_with_fake();
        let mut handle = dispatcher.open_interactive("owner-1", "alice", 80, 24).await.unwrap();
        handle.stdin_write(b"hello\n").await.unwrap();
        let outcome = handle.read_output(Duration::from_secs(2)).await;
        match outcome {
            ReadOutcome::Data(chunk) => assert_eq!(chunk, b"hello\n"),
            _ => panic!("expected echoed data"),
        }
        handle.terminate().await;
    }
}
