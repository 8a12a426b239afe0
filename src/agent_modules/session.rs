//! Scoped use of the automation backend: one session per authentication attempt.
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::retry::{retry_with_backoff, RetryPolicy};
use super::utils::{panic_message, RunFlag};

/// Backend steps an attempt may take (load, submit, read result); the whole
/// attempt is bounded by this many session timeouts.
const ATTEMPT_TIMEOUT_STEPS: u32 = 3;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Carrier selector value, e.g. `@cmcc`.
    pub carrier_suffix: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("carrier_suffix", &self.carrier_suffix)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub headless: bool,
    /// Per-request timeout inside the backend.
    pub timeout: Duration,
    pub user_agent: String,
    pub viewport: Viewport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationOutcome {
    pub success: bool,
    pub message: String,
}

impl AuthenticationOutcome {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    pub fn into_result(self) -> Result<String, String> {
        if self.success {
            Ok(self.message)
        } else {
            Err(self.message)
        }
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to start session: {0}")]
    Launch(String),
    #[error("portal unreachable: {0}")]
    Navigation(String),
    #[error("login form error: {0}")]
    Form(String),
    #[error("failed to release session: {0}")]
    Release(String),
}

/// The concrete portal automation.
///
/// `open` must clean up after itself when it fails: no handle means nothing
/// for the session to release.
#[async_trait]
pub trait AutomationBackend: Send + Sync + 'static {
    type Handle: Send + 'static;

    async fn open(
        &self,
        credentials: &Credentials,
        settings: &SessionSettings,
    ) -> Result<Self::Handle, BackendError>;

    async fn detect_already_authenticated(&self, handle: &mut Self::Handle) -> bool;

    async fn submit_credentials(&self, handle: &mut Self::Handle) -> Result<(), BackendError>;

    async fn interpret_result(&self, handle: &mut Self::Handle) -> AuthenticationOutcome;

    async fn close(&self, handle: Self::Handle) -> Result<(), BackendError>;
}

/// Exclusive hold on one backend handle.
///
/// Call [`AuthSession::release`] to close it. If the session is dropped while
/// still holding the handle (early return, panic, cancelled future), the close
/// is spawned onto the current runtime instead.
pub struct AuthSession<B: AutomationBackend> {
    backend: Arc<B>,
    handle: Option<B::Handle>,
}

impl<B: AutomationBackend> AuthSession<B> {
    pub async fn acquire(
        backend: Arc<B>,
        credentials: &Credentials,
        settings: &SessionSettings,
    ) -> Result<Self, BackendError> {
        let handle = backend.open(credentials, settings).await?;
        debug!("Session acquired.");
        Ok(Self {
            backend,
            handle: Some(handle),
        })
    }

    pub async fn detect_already_authenticated(&mut self) -> bool {
        match self.handle.as_mut() {
            Some(handle) => self.backend.detect_already_authenticated(handle).await,
            None => false,
        }
    }

    pub async fn submit_credentials(&mut self) -> Result<(), BackendError> {
        match self.handle.as_mut() {
            Some(handle) => self.backend.submit_credentials(handle).await,
            None => Err(BackendError::Form("session already released".to_string())),
        }
    }

    pub async fn interpret_result(&mut self) -> AuthenticationOutcome {
        match self.handle.as_mut() {
            Some(handle) => self.backend.interpret_result(handle).await,
            None => AuthenticationOutcome::failed("session already released"),
        }
    }

    /// Closes the handle. Close errors are logged, never returned.
    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            match self.backend.close(handle).await {
                Ok(()) => debug!("Session released."),
                Err(e) => warn!(error = %e, "Session did not close cleanly."),
            }
        }
    }
}

impl<B: AutomationBackend> Drop for AuthSession<B> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let backend = self.backend.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("Session dropped while held; closing it in the background.");
                runtime.spawn(async move {
                    if let Err(e) = backend.close(handle).await {
                        warn!(error = %e, "Background session close failed.");
                    }
                });
            }
            Err(_) => error!("Session dropped outside a runtime; backend handle leaked."),
        }
    }
}

/// Runs authentication attempts, each through a fresh [`AuthSession`].
///
/// Attempts share nothing but the backend itself, so overlapping calls (a
/// manual login while the monitor is also logging in) are allowed and each
/// holds its own session.
pub struct Authenticator<B: AutomationBackend> {
    backend: Arc<B>,
    credentials: Credentials,
    settings: SessionSettings,
    retry: RetryPolicy,
}

impl<B: AutomationBackend> Clone for Authenticator<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            credentials: self.credentials.clone(),
            settings: self.settings.clone(),
            retry: self.retry,
        }
    }
}

impl<B: AutomationBackend> Authenticator<B> {
    pub fn new(
        backend: Arc<B>,
        credentials: Credentials,
        settings: SessionSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            credentials,
            settings,
            retry,
        }
    }

    /// One bare attempt. Never panics and never leaves the session open.
    pub async fn attempt_once(&self) -> AuthenticationOutcome {
        let mut session = match self.acquire().await {
            Ok(session) => session,
            Err(outcome) => return outcome,
        };

        let budget = self.settings.timeout.saturating_mul(ATTEMPT_TIMEOUT_STEPS);
        let steps = tokio::time::timeout(budget, AssertUnwindSafe(drive(&mut session)).catch_unwind());
        let outcome = match steps.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                let details = panic_message(&*panic);
                error!(error = %details, "Fault during login attempt.");
                AuthenticationOutcome::failed(format!("unexpected fault during login: {details}"))
            }
            Err(_) => {
                warn!(budget_secs = budget.as_secs(), "Login attempt timed out.");
                AuthenticationOutcome::failed(format!(
                    "login attempt timeout after {}s",
                    budget.as_secs()
                ))
            }
        };

        session.release().await;
        if outcome.success {
            info!(message = %outcome.message, "Login attempt succeeded.");
        } else {
            warn!(message = %outcome.message, "Login attempt failed.");
        }
        outcome
    }

    /// The full path: [`Authenticator::attempt_once`] wrapped in retry and
    /// backoff. Backoff waits end early once `run_flag` is lowered.
    pub async fn authenticate(&self, run_flag: &RunFlag) -> AuthenticationOutcome {
        let this = self;
        let retried = retry_with_backoff(
            &self.retry,
            || !run_flag.is_active(),
            move |_attempt| async move { this.attempt_once().await.into_result() },
        )
        .await;

        match retried.result {
            Ok(message) => AuthenticationOutcome::succeeded(message),
            Err(message) => AuthenticationOutcome::failed(message),
        }
    }

    /// Opens a session only to see whether the portal answers and whether a
    /// login is already active.
    pub async fn test_connection(&self) -> AuthenticationOutcome {
        let mut session = match self.acquire().await {
            Ok(session) => session,
            Err(outcome) => {
                return AuthenticationOutcome::failed(format!(
                    "portal connection test failed: {}",
                    outcome.message
                ));
            }
        };

        let already = AssertUnwindSafe(session.detect_already_authenticated())
            .catch_unwind()
            .await
            .unwrap_or(false);
        session.release().await;

        if already {
            AuthenticationOutcome::succeeded("portal reachable; a login is already active")
        } else {
            AuthenticationOutcome::succeeded("portal reachable")
        }
    }

    async fn acquire(&self) -> Result<AuthSession<B>, AuthenticationOutcome> {
        let acquiring = AuthSession::acquire(self.backend.clone(), &self.credentials, &self.settings);
        match AssertUnwindSafe(acquiring).catch_unwind().await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => {
                warn!(error = %e, "Could not open a session.");
                Err(AuthenticationOutcome::failed(e.to_string()))
            }
            Err(panic) => {
                let details = panic_message(&*panic);
                error!(error = %details, "Fault while opening a session.");
                Err(AuthenticationOutcome::failed(format!(
                    "unexpected fault while opening session: {details}"
                )))
            }
        }
    }
}

async fn drive<B: AutomationBackend>(session: &mut AuthSession<B>) -> AuthenticationOutcome {
    if session.detect_already_authenticated().await {
        return AuthenticationOutcome::succeeded("already authenticated");
    }
    if let Err(e) = session.submit_credentials().await {
        return AuthenticationOutcome::failed(e.to_string());
    }
    session.interpret_result().await
}
