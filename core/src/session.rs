//! Per-owner interactive session lifecycle: opening a shell, translating
//! chat-message input into stdin bytes, and tearing the session down exactly
//! once regardless of which path (EOF, exit sentinel, surface-gone, external
//! cancel) triggered it.
//!
//! Grounded on the teacher's `SessionContext`/`Registry` (owner-keyed
//! `DashMap`, one background task owning the mutable state) generalized from
//! UUID-keyed AI-agent sessions to owner-id-keyed shell sessions, and on the
//! original `Shell` cog's `on_message`/`_read_output` for the state machine
//! and input-translation semantics.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::ansi::AnsiInterpreter;
use crate::coalescer::{format_content, Coalescer, RenderEvent};
use crate::config::Config;
use crate::error::DispatchError;
use crate::framebuffer::Framebuffer;
use crate::log;
use crate::sandbox::{InteractiveControl, InteractiveHandle, ReadOutcome, SandboxDispatcher};
use crate::surface::{Surface, SurfaceRef};

const LOG: &str = "session";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a session is already running for this owner")]
    AlreadyRunning,
    #[error("container is not running")]
    HealthDown,
    #[error("no running session for this owner")]
    NotRunning,
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Fire-and-forget notification emitted after an owner's command completes
/// (one-shot or interactive). The callback's return value, panics aside, has
/// no effect on shell state: it is never re-entered into the dispatcher.
#[derive(Debug, Clone)]
pub struct AchievementEvent {
    pub owner_id: String,
    pub trigger: AchievementTrigger,
}

#[derive(Debug, Clone)]
pub enum AchievementTrigger {
    SessionOpened,
    CommandExecuted { command: String, exit_code: i32 },
    InteractiveInput { text: String },
}

pub type AchievementCallback = Arc<dyn Fn(AchievementEvent) + Send + Sync>;

/// Result of translating one chat message into bytes for the process's
/// stdin, or the exit sentinel that never reaches the process at all.
#[derive(Debug, PartialEq, Eq)]
pub enum Translated {
    Exit,
    Bytes(Vec<u8>),
}

const EOF_GUARD_MESSAGE: &str = "echo use [EXIT] to close the shell session\n";

/// Translates one user message into process-stdin bytes per the documented
/// token table, applied left to right in a single forward scan so that bytes
/// produced by one substitution (e.g. the literal `[EXIT]` text inside the
/// `[^D]` guard message) are never re-interpreted as a new token.
pub fn translate_input(message: &str) -> Translated {
    if message.trim() == "[EXIT]" {
        return Translated::Exit;
    }

    let chars: Vec<char> = message.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if let Some((consumed, mut bytes)) = match_token(&chars, i) {
            out.append(&mut bytes);
            i += consumed;
        } else {
            let mut buf = [0u8; 4];
            out.extend_from_slice(chars[i].encode_utf8(&mut buf).as_bytes());
            i += 1;
        }
    }
    Translated::Bytes(out)
}

fn literal_at(chars: &[char], i: usize, token: &str) -> bool {
    let tc: Vec<char> = token.chars().collect();
    i + tc.len() <= chars.len() && chars[i..i + tc.len()] == tc[..]
}

fn match_token(chars: &[char], i: usize) -> Option<(usize, Vec<u8>)> {
    if literal_at(chars, i, "[<]") {
        return Some((3, vec![0x08]));
    }
    if chars.get(i) == Some(&'[') && chars.get(i + 1) == Some(&'<') {
        let start = i + 2;
        let mut j = start;
        while chars.get(j).is_some_and(|c| c.is_ascii_digit()) {
            j += 1;
        }
        if j > start && chars.get(j) == Some(&']') {
            let n: usize = chars[start..j].iter().collect::<String>().parse().unwrap_or(0);
            return Some((j + 1 - i, vec![0x08; n]));
        }
    }
    if literal_at(chars, i, "[^C]") {
        return Some((4, vec![0x03]));
    }
    if literal_at(chars, i, "[^Z]") {
        return Some((4, vec![0x1A]));
    }
    if literal_at(chars, i, "[^L]") {
        return Some((4, vec![0x0C]));
    }
    if literal_at(chars, i, "[^D]") {
        return Some((4, EOF_GUARD_MESSAGE.as_bytes().to_vec()));
    }
    if literal_at(chars, i, "[UP]") {
        return Some((4, b"\x1b[A".to_vec()));
    }
    if literal_at(chars, i, "[DOWN]") {
        return Some((6, b"\x1b[B".to_vec()));
    }
    if literal_at(chars, i, "[RIGHT]") {
        return Some((7, b"\x1b[C".to_vec()));
    }
    if literal_at(chars, i, "[LEFT]") {
        return Some((6, b"\x1b[D".to_vec()));
    }
    if literal_at(chars, i, "[HOME]") {
        return Some((6, b"\x1b[H".to_vec()));
    }
    if literal_at(chars, i, "[END]") {
        return Some((5, b"\x1b[F".to_vec()));
    }
    if literal_at(chars, i, "[PGUP]") {
        return Some((6, b"\x1b[5~".to_vec()));
    }
    if literal_at(chars, i, "[PGDN]") {
        return Some((6, b"\x1b[6~".to_vec()));
    }
    if literal_at(chars, i, "[]") {
        return Some((2, vec![0x0A]));
    }
    if chars.get(i) == Some(&'[') && chars.get(i + 1) == Some(&'^') {
        if let Some(&x) = chars.get(i + 2) {
            if x.is_ascii_alphabetic() && chars.get(i + 3) == Some(&']') {
                let byte = (x.to_ascii_uppercase() as u8).wrapping_sub(0x40);
                return Some((4, vec![byte]));
            }
        }
    }
    if literal_at(chars, i, "[#]") {
        return match chars.get(i + 3) {
            Some(&next) => {
                let mut buf = [0u8; 4];
                let upper = next.to_ascii_uppercase();
                Some((4, upper.encode_utf8(&mut buf).as_bytes().to_vec()))
            }
            None => Some((3, Vec::new())),
        };
    }
    None
}

/// Table entry: just enough state for `deliver_input`/`cancel` to act on a
/// running session without touching its reader task or Framebuffer directly.
struct SessionEntry {
    surface_ref: SurfaceRef,
    running: Arc<AtomicBool>,
    control: InteractiveControl,
}

/// Shared state the reader task needs to own through to teardown.
struct SessionInner {
    control: InteractiveControl,
    fb: Arc<AsyncMutex<Framebuffer>>,
    surface: Arc<dyn Surface>,
    surface_ref: SurfaceRef,
    coalescer: Arc<Coalescer>,
    running: Arc<AtomicBool>,
}

/// Per-owner interactive session registry and lifecycle driver. Construction
/// takes the Sandbox Dispatcher and Surface collaborators; everything else
/// (Framebuffer sizing, rate limits, timeouts) is a plain field so tests can
/// build one without touching global config.
pub struct SessionManager {
    dispatcher: Arc<SandboxDispatcher>,
    surface: Arc<dyn Surface>,
    table: Arc<DashMap<String, SessionEntry>>,
    coalescer: Arc<Coalescer>,
    fb_width: u16,
    fb_height: u16,
    scrollback: usize,
    read_timeout: Duration,
    exec_timeout_secs: u64,
    home_base: PathBuf,
    working_dirs: DashMap<String, String>,
    achievements: Option<AchievementCallback>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dispatcher: Arc<SandboxDispatcher>,
        surface: Arc<dyn Surface>,
        fb_width: u16,
        fb_height: u16,
        scrollback: usize,
        min_publish_interval: Duration,
        flash_hold: Duration,
        read_timeout: Duration,
        exec_timeout_secs: u64,
        home_base: PathBuf,
        achievements: Option<AchievementCallback>,
    ) -> Self {
        Self {
            dispatcher,
            surface,
            table: Arc::new(DashMap::new()),
            coalescer: Arc::new(Coalescer::new(min_publish_interval, flash_hold)),
            fb_width,
            fb_height,
            scrollback,
            read_timeout,
            exec_timeout_secs,
            home_base,
            working_dirs: DashMap::new(),
            achievements,
        }
    }

    pub fn from_config(
        config: &Config,
        dispatcher: Arc<SandboxDispatcher>,
        surface: Arc<dyn Surface>,
        achievements: Option<AchievementCallback>,
    ) -> Self {
        Self::new(
            dispatcher,
            surface,
            config.fb_width,
            config.fb_height,
            config.scrollback_rows,
            Duration::from_millis(config.min_publish_interval_ms),
            Duration::from_millis(config.flash_hold_ms),
            Duration::from_millis(50),
            config.exec_timeout_secs,
            config.home_base.clone(),
            achievements,
        )
    }

    pub fn is_running(&self, owner_id: &str) -> bool {
        self.table.get(owner_id).map(|e| e.running.load(Ordering::SeqCst)).unwrap_or(false)
    }

    /// Opens an interactive shell for `owner_id`. Fails fast without
    /// disturbing any existing session if one is already registered.
    pub async fn open(&self, owner_id: &str, username: &str) -> Result<(), SessionError> {
        if self.table.contains_key(owner_id) {
            return Err(SessionError::AlreadyRunning);
        }
        if !self.dispatcher.health().await {
            return Err(SessionError::HealthDown);
        }

        let handle = self.dispatcher.open_interactive(owner_id, username, self.fb_width, self.fb_height).await?;
        let control = handle.control();

        let entry_slot = match self.table.entry(owner_id.to_string()) {
            Entry::Occupied(_) => {
                control.terminate().await;
                return Err(SessionError::AlreadyRunning);
            }
            Entry::Vacant(slot) => slot,
        };

        let fb = Arc::new(AsyncMutex::new(Framebuffer::new(self.fb_width, self.fb_height, self.scrollback)));
        let running = Arc::new(AtomicBool::new(true));

        let initial_content = {
            let g = fb.lock().await;
            format_content(&g.render(false))
        };
        let surface_ref = match self.surface.send(&initial_content).await {
            Ok(r) => r,
            Err(_) => {
                control.terminate().await;
                return Err(SessionError::HealthDown);
            }
        };

        entry_slot.insert(SessionEntry {
            surface_ref: surface_ref.clone(),
            running: Arc::clone(&running),
            control: control.clone(),
        });

        let (tx, rx) = mpsc::channel::<RenderEvent>(256);
        tokio::spawn({
            let coalescer = Arc::clone(&self.coalescer);
            let surface = Arc::clone(&self.surface);
            let surface_ref = surface_ref.clone();
            let fb = Arc::clone(&fb);
            let running = Arc::clone(&running);
            async move {
                coalescer.run(rx, surface, surface_ref, fb, running).await;
            }
        });

        let inner = Arc::new(SessionInner {
            control,
            fb,
            surface: Arc::clone(&self.surface),
            surface_ref,
            coalescer: Arc::clone(&self.coalescer),
            running,
        });
        tokio::spawn(run_reader(handle, inner, tx, self.read_timeout, Arc::clone(&self.table), owner_id.to_string()));

        if let Some(cb) = &self.achievements {
            cb(AchievementEvent { owner_id: owner_id.to_string(), trigger: AchievementTrigger::SessionOpened });
        }

        Ok(())
    }

    /// Translates and delivers one chat message to the owner's running
    /// session. `origin` must match the session's published surface or the
    /// input is silently ignored (delivered-to-the-wrong-channel is not an
    /// error, just a no-op, per the routing invariant). `input_message` is
    /// the user's own chat message, deleted best-effort afterward so the
    /// channel reads like a terminal.
    pub async fn deliver_input(
        &self,
        owner_id: &str,
        origin: &SurfaceRef,
        input_message: &SurfaceRef,
        text: &str,
    ) -> Result<(), SessionError> {
        let (running, control) = {
            let entry = self.table.get(owner_id).ok_or(SessionError::NotRunning)?;
            if entry.surface_ref != *origin {
                return Ok(());
            }
            (Arc::clone(&entry.running), entry.control.clone())
        };

        if !running.load(Ordering::SeqCst) {
            return Err(SessionError::NotRunning);
        }

        match translate_input(text) {
            Translated::Exit => {
                running.store(false, Ordering::SeqCst);
            }
            Translated::Bytes(bytes) => {
                if let Err(e) = control.stdin_write(&bytes).await {
                    eprintln!("{} stdin write failed for owner={owner_id}: {e}", log::prefix(LOG));
                }
                if let Some(cb) = &self.achievements {
                    cb(AchievementEvent {
                        owner_id: owner_id.to_string(),
                        trigger: AchievementTrigger::InteractiveInput { text: text.to_string() },
                    });
                }
            }
        }

        let _ = self.surface.delete(input_message).await;
        Ok(())
    }

    /// Externally cancels a running session; the reader task observes this
    /// within one read timeout and drives the rest of teardown.
    pub fn cancel(&self, owner_id: &str) -> Result<(), SessionError> {
        let entry = self.table.get(owner_id).ok_or(SessionError::NotRunning)?;
        entry.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Runs a single one-shot command as the owner's mapped UID, tracking
    /// their last working directory the way an interactive shell would.
    pub async fn execute_once(&self, owner_id: &str, username: &str, command: &str) -> (String, i32) {
        if let Err(e) = self.dispatcher.ensure_user(owner_id, username).await {
            return e.as_exit();
        }

        let wd = self
            .working_dirs
            .get(owner_id)
            .map(|v| v.clone())
            .unwrap_or_else(|| format!("{}/{username}", self.home_base.display()));

        let (output, code) = self.dispatcher.execute(command, Some(owner_id), Some(&wd), self.exec_timeout_secs).await;

        if let Some(cb) = &self.achievements {
            cb(AchievementEvent {
                owner_id: owner_id.to_string(),
                trigger: AchievementTrigger::CommandExecuted { command: command.to_string(), exit_code: code },
            });
        }

        (output, code)
    }

    /// Sets the owner's working directory for subsequent `execute_once` calls
    /// (e.g. after a `cd` the embedder parsed out of the command).
    pub fn set_working_dir(&self, owner_id: &str, dir: impl Into<String>) {
        self.working_dirs.insert(owner_id.to_string(), dir.into());
    }
}

/// Owns the interactive process's output stream exclusively until the
/// session closes, feeding the ANSI interpreter and notifying the coalescer,
/// then running the single teardown sequence regardless of what ended the
/// loop (process EOF, exit sentinel, external cancel, or surface-gone).
async fn run_reader(
    mut handle: InteractiveHandle,
    inner: Arc<SessionInner>,
    coalescer_tx: mpsc::Sender<RenderEvent>,
    read_timeout: Duration,
    table: Arc<DashMap<String, SessionEntry>>,
    owner_id: String,
) {
    let mut ansi = AnsiInterpreter::new();

    loop {
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
        match handle.read_output(read_timeout).await {
            ReadOutcome::Data(chunk) => {
                let bell = {
                    let mut fb = inner.fb.lock().await;
                    ansi.feed(&mut fb, &chunk)
                };
                let _ = coalescer_tx.send(RenderEvent { bell }).await;
            }
            ReadOutcome::Eof => {
                inner.running.store(false, Ordering::SeqCst);
                break;
            }
            ReadOutcome::TimedOut => continue,
        }
    }

    inner.control.terminate().await;
    if inner.control.wait(Duration::from_secs(2)).await.is_none() {
        inner.control.kill().await;
    }

    {
        let mut fb = inner.fb.lock().await;
        fb.clear();
        let row = fb.height() / 2;
        fb.write_centered(row, "shell session closed");
    }
    inner.coalescer.publish_now(&inner.surface, &inner.surface_ref, &inner.fb, &inner.running).await;

    table.remove(&owner_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_message_exit_is_sentinel() {
        assert_eq!(translate_input("[EXIT]"), Translated::Exit);
        assert_eq!(translate_input(" [EXIT] "), Translated::Exit);
    }

    #[test]
    fn exit_embedded_in_other_text_is_not_sentinel() {
        match translate_input("echo [EXIT] nope") {
            Translated::Bytes(b) => assert!(!b.is_empty()),
            Translated::Exit => panic!("should not be treated as the sentinel"),
        }
    }

    #[test]
    fn backspace_repeat_count() {
        match translate_input("[<3]") {
            Translated::Bytes(b) => assert_eq!(b, vec![0x08, 0x08, 0x08]),
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn single_backspace_token() {
        match translate_input("[<]") {
            Translated::Bytes(b) => assert_eq!(b, vec![0x08]),
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn control_c_token() {
        match translate_input("[^C]") {
            Translated::Bytes(b) => assert_eq!(b, vec![0x03]),
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn eof_guard_replaces_with_literal_message() {
        match translate_input("[^D]") {
            Translated::Bytes(b) => assert_eq!(b, EOF_GUARD_MESSAGE.as_bytes()),
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn arrow_keys_become_csi_sequences() {
        match translate_input("[UP][DOWN][LEFT][RIGHT]") {
            Translated::Bytes(b) => assert_eq!(b, b"\x1b[A\x1b[B\x1b[D\x1b[C"),
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn bracket_bracket_is_newline() {
        match translate_input("ls[]") {
            Translated::Bytes(b) => assert_eq!(b, b"ls\n"),
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn generic_control_token() {
        match translate_input("[^A]") {
            Translated::Bytes(b) => assert_eq!(b, vec![1]),
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn generic_shift_token_uppercases_only_next_char() {
        match translate_input("[#]hello") {
            Translated::Bytes(b) => assert_eq!(b, b"Hello"),
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn plain_text_passes_through() {
        match translate_input("ls -la") {
            Translated::Bytes(b) => assert_eq!(b, b"ls -la"),
            _ => panic!("expected bytes"),
        }
    }

    use crate::config::ResourceLimits;
    use crate::container::fake::FakeContainerRuntime;
    use crate::surface::fake::FakeSurface;

    fn test_manager(surface: Arc<FakeSurface>) -> SessionManager {
        let runtime = Arc::new(FakeContainerRuntime::new());
        let dispatcher = Arc::new(SandboxDispatcher::new(
            runtime,
            PathBuf::from("/tmp"),
            ResourceLimits::default(),
            1000,
            2_147_483_147,
        ));
        SessionManager::new(
            dispatcher,
            surface,
            40,
            3,
            50,
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(20),
            5,
            PathBuf::from("/tmp"),
            None,
        )
    }

    #[tokio::test]
    async fn open_publishes_opening_snapshot_and_registers_session() {
        let surface = Arc::new(FakeSurface::new(10_000));
        let mgr = test_manager(surface.clone());

        mgr.open("owner-1", "alice").await.unwrap();
        assert!(mgr.is_running("owner-1"));
        assert_eq!(surface.messages.len(), 1);
        mgr.cancel("owner-1").unwrap();
    }

    #[tokio::test]
    async fn opening_twice_for_the_same_owner_fails_fast() {
        let surface = Arc::new(FakeSurface::new(10_000));
        let mgr = test_manager(surface.clone());

        mgr.open("owner-1", "alice").await.unwrap();
        let err = mgr.open("owner-1", "alice").await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyRunning));
        mgr.cancel("owner-1").unwrap();
    }

    #[tokio::test]
    async fn exit_sentinel_closes_the_session() {
        let surface = Arc::new(FakeSurface::new(10_000));
        let mgr = test_manager(surface.clone());

        mgr.open("owner-1", "alice").await.unwrap();
        let origin = SurfaceRef::new("1");
        let input_msg = surface.send("[EXIT]").await.unwrap();

        mgr.deliver_input("owner-1", &origin, &input_msg, "[EXIT]").await.unwrap();

        for _ in 0..50 {
            if !mgr.is_running("owner-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!mgr.is_running("owner-1"));

        let closing_content = surface.messages.get("1").unwrap().clone();
        assert!(closing_content.contains("shell session closed"));
    }

    #[tokio::test]
    async fn deliver_input_to_wrong_origin_is_a_no_op() {
        let surface = Arc::new(FakeSurface::new(10_000));
        let mgr = test_manager(surface.clone());

        mgr.open("owner-1", "alice").await.unwrap();
        let wrong_origin = SurfaceRef::new("not-the-real-ref");
        let input_msg = surface.send("ls").await.unwrap();

        mgr.deliver_input("owner-1", &wrong_origin, &input_msg, "ls").await.unwrap();
        assert!(mgr.is_running("owner-1"));
        mgr.cancel("owner-1").unwrap();
    }

    #[tokio::test]
    async fn execute_once_tracks_working_directory() {
        let surface = Arc::new(FakeSurface::new(10_000));
        let mgr = test_manager(surface);

        mgr.set_working_dir("owner-1", "/tmp");
        let (out, code) = mgr.execute_once("owner-1", "alice", "pwd").await;
        assert_eq!(code, 0);
        assert_eq!(out, "/tmp");
    }
}
