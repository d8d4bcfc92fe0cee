//! Single-Owner Debug Sessions
//!
//! Interactive tools (the selector finder and the action recorder) drive
//! their own automation session outside any execution. At most one session
//! per tool may be active; acquiring a slot displaces and closes whatever
//! held it before. Ownership is proven by a [`DebugSessionToken`], so a
//! displaced owner cannot release its successor's session.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::session::AutomationSession;

/// Which interactive tool a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugSessionKind {
    SelectorFinder,
    ActionRecorder,
}

impl fmt::Display for DebugSessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelectorFinder => write!(f, "selector-finder"),
            Self::ActionRecorder => write!(f, "action-recorder"),
        }
    }
}

/// Proof of ownership for one acquisition of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugSessionToken {
    kind: DebugSessionKind,
    generation: u64,
}

impl DebugSessionToken {
    pub fn kind(&self) -> DebugSessionKind {
        self.kind
    }
}

struct Holder {
    generation: u64,
    session: Arc<dyn AutomationSession>,
}

struct SlotState {
    holder: Option<Holder>,
    next_generation: u64,
}

/// A slot holding at most one active debug session.
pub struct DebugSessionSlot {
    kind: DebugSessionKind,
    state: Mutex<SlotState>,
}

impl DebugSessionSlot {
    pub fn new(kind: DebugSessionKind) -> Self {
        Self {
            kind,
            state: Mutex::new(SlotState {
                holder: None,
                next_generation: 1,
            }),
        }
    }

    pub fn kind(&self) -> DebugSessionKind {
        self.kind
    }

    /// Installs `session` as the active one, closing the displaced session.
    pub async fn acquire(&self, session: Arc<dyn AutomationSession>) -> DebugSessionToken {
        let (generation, displaced) = {
            let mut state = self.state.lock().await;
            let generation = state.next_generation;
            state.next_generation += 1;
            let displaced = state.holder.replace(Holder {
                generation,
                session,
            });
            info!("{} session acquired (generation {})", self.kind, generation);
            (generation, displaced)
        };

        if let Some(previous) = displaced {
            debug!(
                "Closing displaced {} session (generation {})",
                self.kind, previous.generation
            );
            if let Err(e) = previous.session.close().await {
                warn!("Failed to close displaced {} session: {}", self.kind, e);
            }
        }

        DebugSessionToken {
            kind: self.kind,
            generation,
        }
    }

    /// Returns the current session together with a token for it, letting a
    /// caller join the session that is already open.
    pub async fn attach(&self) -> Option<(DebugSessionToken, Arc<dyn AutomationSession>)> {
        let state = self.state.lock().await;
        state.holder.as_ref().map(|holder| {
            (
                DebugSessionToken {
                    kind: self.kind,
                    generation: holder.generation,
                },
                Arc::clone(&holder.session),
            )
        })
    }

    /// The session owned by `token`, if it is still the active one.
    pub async fn session(&self, token: &DebugSessionToken) -> Option<Arc<dyn AutomationSession>> {
        let state = self.state.lock().await;
        state
            .holder
            .as_ref()
            .filter(|holder| token.kind == self.kind && holder.generation == token.generation)
            .map(|holder| Arc::clone(&holder.session))
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.holder.is_some()
    }

    /// Releases and closes the session if `token` still owns it.
    ///
    /// Returns false for stale tokens.
    pub async fn release(&self, token: DebugSessionToken) -> bool {
        let released = {
            let mut state = self.state.lock().await;
            let owns = token.kind == self.kind
                && state
                    .holder
                    .as_ref()
                    .map_or(false, |holder| holder.generation == token.generation);
            if owns {
                state.holder.take()
            } else {
                None
            }
        };

        match released {
            Some(holder) => {
                if let Err(e) = holder.session.close().await {
                    warn!("Failed to close {} session: {}", self.kind, e);
                }
                info!("{} session released", self.kind);
                true
            }
            None => {
                debug!("Ignoring stale {} token", self.kind);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSession;

    #[tokio::test]
    async fn test_acquire_displaces_previous() {
        let slot = DebugSessionSlot::new(DebugSessionKind::SelectorFinder);
        let first = Arc::new(FakeSession::new());
        let second = Arc::new(FakeSession::new());

        let first_token = slot.acquire(first.clone()).await;
        let second_token = slot.acquire(second.clone()).await;

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(slot.session(&first_token).await.is_none());
        assert!(slot.session(&second_token).await.is_some());
    }

    #[tokio::test]
    async fn test_stale_token_cannot_release() {
        let slot = DebugSessionSlot::new(DebugSessionKind::ActionRecorder);
        let stale = slot.acquire(Arc::new(FakeSession::new())).await;
        let current_session = Arc::new(FakeSession::new());
        let current = slot.acquire(current_session.clone()).await;

        assert!(!slot.release(stale).await);
        assert!(slot.is_active().await);

        assert!(slot.release(current).await);
        assert!(current_session.is_closed());
        assert!(!slot.is_active().await);
        assert!(!slot.release(current).await);
    }

    #[tokio::test]
    async fn test_attach_joins_active_session() {
        let slot = DebugSessionSlot::new(DebugSessionKind::SelectorFinder);
        assert!(slot.attach().await.is_none());

        let token = slot.acquire(Arc::new(FakeSession::new())).await;
        let (attached, _) = slot.attach().await.unwrap();
        assert_eq!(attached, token);
    }

    #[tokio::test]
    async fn test_tokens_are_slot_specific() {
        let finder = DebugSessionSlot::new(DebugSessionKind::SelectorFinder);
        let token = finder.acquire(Arc::new(FakeSession::new())).await;

        let recorder = DebugSessionSlot::new(DebugSessionKind::ActionRecorder);
        recorder.acquire(Arc::new(FakeSession::new())).await;
        assert!(!recorder.release(token).await);
        assert_eq!(token.kind(), DebugSessionKind::SelectorFinder);
    }
}
