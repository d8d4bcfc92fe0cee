//! Automation Session Contract
//!
//! The engine never drives a browser itself. It talks to an
//! [`AutomationSession`] that exposes the few primitives the condition
//! evaluator and the wait coordinator need, and obtains one session per
//! execution from a [`SessionFactory`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use crate::error::SessionError;
use crate::lock;

/// A live automation session owned by exactly one execution.
#[async_trait]
pub trait AutomationSession: Send + Sync {
    /// Locates the element and reports whether it is visible.
    ///
    /// A missing element is `Ok(false)`, not an error.
    async fn is_element_visible(&self, selector: &str) -> Result<bool, SessionError>;

    async fn current_url(&self) -> Result<String, SessionError>;

    /// Evaluates a script that must return a boolean, optionally passing
    /// one JSON argument.
    async fn evaluate_predicate(
        &self,
        script: &str,
        argument: Option<&Value>,
    ) -> Result<bool, SessionError>;

    async fn reload(&self) -> Result<(), SessionError>;

    async fn bring_to_front(&self) -> Result<(), SessionError>;

    /// Releases the underlying driver resources. Called once per execution
    /// during cleanup.
    async fn close(&self) -> Result<(), SessionError>;
}

/// Opens sessions for new executions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, execution_id: &str) -> Result<Arc<dyn AutomationSession>, SessionError>;
}

/// A session with no page behind it.
///
/// Used by the command-line runner, where workflows only exercise the
/// built-in node types. Nothing is ever visible and every predicate is
/// false, so condition waits against it time out.
#[derive(Debug, Default)]
pub struct DetachedSession {
    url: Mutex<String>,
    closed: AtomicBool,
}

impl DetachedSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the session at a fixed URL.
    pub fn at(url: impl Into<String>) -> Self {
        Self {
            url: Mutex::new(url.into()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AutomationSession for DetachedSession {
    async fn is_element_visible(&self, _selector: &str) -> Result<bool, SessionError> {
        self.ensure_open()?;
        Ok(false)
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        self.ensure_open()?;
        Ok(lock(&self.url).clone())
    }

    async fn evaluate_predicate(
        &self,
        _script: &str,
        _argument: Option<&Value>,
    ) -> Result<bool, SessionError> {
        self.ensure_open()?;
        Ok(false)
    }

    async fn reload(&self) -> Result<(), SessionError> {
        self.ensure_open()
    }

    async fn bring_to_front(&self) -> Result<(), SessionError> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        Ok(())
    }
}

/// Hands out a fresh [`DetachedSession`] per execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSessionFactory;

#[async_trait]
impl SessionFactory for DetachedSessionFactory {
    async fn open(&self, execution_id: &str) -> Result<Arc<dyn AutomationSession>, SessionError> {
        debug!("Opening detached session for execution {}", execution_id);
        Ok(Arc::new(DetachedSession::at("about:blank")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detached_session_reports_nothing() {
        let session = DetachedSession::at("https://example.com/login");

        assert!(!session.is_element_visible("#login").await.unwrap());
        assert!(!session.evaluate_predicate("true", None).await.unwrap());
        assert_eq!(
            session.current_url().await.unwrap(),
            "https://example.com/login"
        );
        assert!(session.reload().await.is_ok());
    }

    #[tokio::test]
    async fn test_detached_session_close_once() {
        let session = DetachedSession::new();

        assert!(session.close().await.is_ok());
        assert!(session.is_closed());
        assert_eq!(session.close().await, Err(SessionError::Closed));
        assert_eq!(session.current_url().await, Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn test_factory_opens_independent_sessions() {
        let factory = DetachedSessionFactory;
        let a = factory.open("a").await.unwrap();
        let b = factory.open("b").await.unwrap();

        a.close().await.unwrap();
        assert!(b.bring_to_front().await.is_ok());
    }
}
