//! The message-surface boundary: sending, editing and deleting chat
//! messages, abstracted so the session manager and coalescer never touch a
//! concrete chat API.

use async_trait::async_trait;

use crate::error::SurfaceError;

/// Opaque reference to a previously published message, returned by `send`
/// and threaded back through `edit`/`delete`. Transports are free to encode
/// whatever they need (channel id, message id, thread id, ...) as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SurfaceRef(pub String);

impl SurfaceRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// A single place a Session can publish its framebuffer to, and that a user
/// sends input through. Implemented per chat transport (Telegram, Slack,
/// a local terminal, ...); the core depends only on this trait.
#[async_trait]
pub trait Surface: Send + Sync {
    /// Publishes `content` as a new message, returning a reference usable
    /// with `edit`/`delete`.
    async fn send(&self, content: &str) -> Result<SurfaceRef, SurfaceError>;

    /// Replaces the content of a previously sent message in place. Returns
    /// `Err(SurfaceError::Gone)` when the target no longer exists so the
    /// caller can terminate the owning Session rather than retry forever.
    async fn edit(&self, target: &SurfaceRef, content: &str) -> Result<(), SurfaceError>;

    /// Best-effort cleanup of a message (typically the user's own input, so
    /// the surface reads like a terminal). Failure is non-fatal.
    async fn delete(&self, target: &SurfaceRef) -> Result<(), SurfaceError>;

    /// Max content length this surface accepts in one message; the
    /// coalescer truncates renders against this budget.
    fn max_content_len(&self) -> usize;
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// An in-memory `Surface` for tests: records every send/edit, can be
    /// told to report a target as gone.
    pub struct FakeSurface {
        next_id: AtomicU64,
        pub messages: DashMap<String, String>,
        pub max_len: usize,
        pub gone: DashMap<String, ()>,
    }

    impl FakeSurface {
        pub fn new(max_len: usize) -> Self {
            Self {
                next_id: AtomicU64::new(1),
                messages: DashMap::new(),
                max_len,
                gone: DashMap::new(),
            }
        }

        pub fn mark_gone(&self, target: &SurfaceRef) {
            self.gone.insert(target.0.clone(), ());
        }
    }

    #[async_trait]
    impl Surface for FakeSurface {
        async fn send(&self, content: &str) -> Result<SurfaceRef, SurfaceError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
            self.messages.insert(id.clone(), content.to_string());
            Ok(SurfaceRef::new(id))
        }

        async fn edit(&self, target: &SurfaceRef, content: &str) -> Result<(), SurfaceError> {
            if self.gone.contains_key(&target.0) {
                return Err(SurfaceError::Gone);
            }
            self.messages.insert(target.0.clone(), content.to_string());
            Ok(())
        }

        async fn delete(&self, target: &SurfaceRef) -> Result<(), SurfaceError> {
            self.messages.remove(&target.0);
            Ok(())
        }

        fn max_content_len(&self) -> usize {
            self.max_len
        }
    }
}
