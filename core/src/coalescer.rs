//! Rate-limited publish of a Framebuffer to a `Surface`: at most one publish
//! in flight per session, bell-triggered flashes bypass the rate limit, and
//! oversized renders degrade through a fallback chain before truncating.
//!
//! Grounded on the per-channel send daemon in the teacher's `im/daemon.rs`
//! (one task per destination, draining a queue under a rate limit) and on
//! the flash/truncation policy of `_update` in the original shell cog.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;

use crate::framebuffer::Framebuffer;
use crate::log;
use crate::surface::{Surface, SurfaceRef};

const LOG: &str = "coalescer";

/// Truncation notice appended when a render still doesn't fit after dropping
/// the cursor marker and trimming trailing rows.
const TRUNCATION_NOTICE: &str = "... output truncated, use [PGUP]/[PGDN] to scroll";

/// Raised by the reader task whenever the Framebuffer mutated, carrying
/// whether this chunk's bytes included a bell.
#[derive(Debug, Clone, Copy)]
pub struct RenderEvent {
    pub bell: bool,
}

/// Wraps rendered rows in the fenced-code-block form the surface displays as
/// colored text. Shared with the session manager for the opening snapshot.
pub(crate) fn format_content(lines: &[String]) -> String {
    format!("```ansi\n{}\n```", lines.join("\n"))
}

/// Renders the framebuffer against `max_len`, falling back in the documented
/// order: cursor-shown, then cursor-hidden, then trailing rows dropped one
/// at a time with a truncation notice appended.
async fn render_budgeted(fb: &AsyncMutex<Framebuffer>, max_len: usize) -> String {
    let with_cursor = { fb.lock().await.render(true) };
    let content = format_content(&with_cursor);
    if content.len() <= max_len {
        return content;
    }

    let without_cursor = { fb.lock().await.render(false) };
    let content = format_content(&without_cursor);
    if content.len() <= max_len {
        return content;
    }

    let mut rows = without_cursor;
    while !rows.is_empty() {
        let mut candidate = rows.clone();
        candidate.push(TRUNCATION_NOTICE.to_string());
        let content = format_content(&candidate);
        if content.len() <= max_len {
            return content;
        }
        rows.pop();
    }
    format_content(&[TRUNCATION_NOTICE.to_string()])
}

/// Rate-limits publishes of one Session's Framebuffer to its Surface.
pub struct Coalescer {
    min_interval: Duration,
    flash_hold: Duration,
}

impl Coalescer {
    pub fn new(min_interval: Duration, flash_hold: Duration) -> Self {
        Self { min_interval, flash_hold }
    }

    async fn edit(
        &self,
        surface: &Arc<dyn Surface>,
        surface_ref: &SurfaceRef,
        content: String,
        running: &AtomicBool,
    ) {
        match surface.edit(surface_ref, &content).await {
            Ok(()) => {}
            Err(crate::error::SurfaceError::Gone) => {
                running.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                eprintln!(
                    "{} publish failed content={} error={e}",
                    log::prefix(LOG),
                    log::truncate_content_default(&content)
                );
            }
        }
    }

    async fn flash(
        &self,
        surface: &Arc<dyn Surface>,
        surface_ref: &SurfaceRef,
        fb: &AsyncMutex<Framebuffer>,
        running: &AtomicBool,
    ) {
        let lines = { fb.lock().await.render(true) };
        let inverted: Vec<String> = lines.iter().map(|l| format!("\x1b[7m{l}\x1b[27m")).collect();
        self.edit(surface, surface_ref, format_content(&inverted), running).await;
    }

    /// Renders and publishes the current Framebuffer state immediately,
    /// bypassing the rate limit. Used both for the session's opening
    /// snapshot-adjacent edits and for the final closed-state frame.
    pub async fn publish_now(
        &self,
        surface: &Arc<dyn Surface>,
        surface_ref: &SurfaceRef,
        fb: &AsyncMutex<Framebuffer>,
        running: &AtomicBool,
    ) {
        let content = render_budgeted(fb, surface.max_content_len()).await;
        self.edit(surface, surface_ref, content, running).await;
    }

    /// Drains `rx` until the sender side is dropped (the reader task ending,
    /// for any reason, is exactly that signal), coalescing bursts of
    /// mutations into a single rate-limited publish and forcing an immediate
    /// flash-then-normal sequence whenever a bell arrived.
    pub async fn run(
        &self,
        mut rx: mpsc::Receiver<RenderEvent>,
        surface: Arc<dyn Surface>,
        surface_ref: SurfaceRef,
        fb: Arc<AsyncMutex<Framebuffer>>,
        running: Arc<AtomicBool>,
    ) {
        let mut last_publish: Option<Instant> = None;
        let mut pending_bell = false;
        let mut dirty = false;

        while let Some(event) = rx.recv().await {
            dirty = true;
            pending_bell |= event.bell;

            // Coalesce anything else that arrived while we were scheduling
            // this publish so a burst of output chunks yields one edit.
            while let Ok(event) = rx.try_recv() {
                dirty = true;
                pending_bell |= event.bell;
            }

            if !dirty {
                continue;
            }

            if pending_bell {
                pending_bell = false;
                self.flash(&surface, &surface_ref, &fb, &running).await;
                tokio::time::sleep(self.flash_hold).await;
            } else if let Some(last) = last_publish {
                let elapsed = last.elapsed();
                if elapsed < self.min_interval {
                    tokio::time::sleep(self.min_interval - elapsed).await;
                }
            }

            self.publish_now(&surface, &surface_ref, &fb, &running).await;
            last_publish = Some(Instant::now());
            dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::fake::FakeSurface;

    fn fresh_fb(w: u16, h: u16) -> Arc<AsyncMutex<Framebuffer>> {
        Arc::new(AsyncMutex::new(Framebuffer::new(w, h, 100)))
    }

    #[tokio::test]
    async fn publish_now_writes_current_frame() {
        let fake = Arc::new(FakeSurface::new(10_000));
        let surface_ref = fake.send("init").await.unwrap();
        let surface: Arc<dyn Surface> = fake.clone();
        let fb = fresh_fb(10, 3);
        {
            let mut g = fb.lock().await;
            g.write('h');
            g.write('i');
        }
        let coalescer = Coalescer::new(Duration::from_millis(100), Duration::from_millis(150));
        let running = Arc::new(AtomicBool::new(true));
        coalescer.publish_now(&surface, &surface_ref, &fb, &running).await;

        let content = fake.messages.get(&surface_ref.0).unwrap().clone();
        assert!(content.contains('h') && content.contains('i'));
    }

    #[tokio::test]
    async fn gone_surface_stops_running() {
        let fake = Arc::new(FakeSurface::new(10_000));
        let surface_ref = fake.send("init").await.unwrap();
        fake.mark_gone(&surface_ref);
        let surface: Arc<dyn Surface> = fake;
        let fb = fresh_fb(10, 3);
        let coalescer = Coalescer::new(Duration::from_millis(100), Duration::from_millis(150));
        let running = Arc::new(AtomicBool::new(true));
        coalescer.publish_now(&surface, &surface_ref, &fb, &running).await;
        assert!(!running.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn bell_forces_flash_before_normal_frame() {
        let fake = Arc::new(FakeSurface::new(10_000));
        let surface_ref = fake.send("init").await.unwrap();
        let surface: Arc<dyn Surface> = fake.clone();
        let fb = fresh_fb(10, 3);
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(8);
        let coalescer = Coalescer::new(Duration::from_millis(100), Duration::from_millis(150));

        let handle = tokio::spawn({
            let surface = surface.clone();
            let surface_ref = surface_ref.clone();
            let fb = fb.clone();
            let running = running.clone();
            async move {
                coalescer.run(rx, surface, surface_ref, fb, running).await;
            }
        });

        tx.send(RenderEvent { bell: true }).await.unwrap();
        tokio::time::advance(Duration::from_millis(160)).await;
        drop(tx);
        handle.await.unwrap();

        let content = fake.messages.get(&surface_ref.0).unwrap().clone();
        // after the hold, the flash (inverted) frame has been replaced by the normal one.
        assert!(!content.contains("\x1b[7m"));
    }
}
