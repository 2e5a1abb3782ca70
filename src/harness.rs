use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::browser::Browser;
use crate::session::{BrowserContextId, HarnessError, Session, SessionFactory};
use crate::Error;

/// Harness tuning knobs. Every blocking wait in the harness is bounded by
/// one of these.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Explicit browser executable; discovered when `None`.
    pub browser_bin: Option<PathBuf>,
    /// Run without a display surface. (Default: true)
    pub headless: bool,
    /// Pass browser stdout / stderr through. (Default: false)
    pub output: bool,
    /// Wait bound for the control channel endpoint. (Default: 10s)
    pub channel_ready_timeout: Duration,
    /// Wait bound for the document ready signal. (Default: 30s)
    pub document_ready_timeout: Duration,
    /// Wait bound for a single command round trip. (Default: 30s)
    pub command_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            browser_bin: None,
            headless: true,
            output: false,
            channel_ready_timeout: Duration::from_secs(10),
            document_ready_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// One of the four ordered teardown actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    CloseSession,
    DisposeContext,
    CloseFactory,
    KillProcess,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CloseSession => "close session",
            Self::DisposeContext => "dispose context",
            Self::CloseFactory => "close factory",
            Self::KillProcess => "kill process",
        };
        s.fmt(f)
    }
}

/// Outcome of a teardown pass.
///
/// Step failures are diagnostics, not errors: they are logged and kept
/// here, and never returned as `Err` so they cannot mask whatever failure
/// triggered the teardown.
#[derive(Debug, Default)]
pub struct TeardownReport {
    attempted: Vec<TeardownStep>,
    failures: Vec<(TeardownStep, HarnessError)>,
}

impl TeardownReport {
    fn record(&mut self, step: TeardownStep, result: Result<(), HarnessError>) {
        self.attempted.push(step);
        match result {
            Ok(()) => log::debug!("teardown: {} done", step),
            Err(err) => {
                log::warn!("teardown: {} failed: {}", step, err);
                self.failures.push((step, err));
            }
        }
    }

    /// Steps attempted, in execution order.
    pub fn attempted(&self) -> &[TeardownStep] {
        &self.attempted
    }

    pub fn failures(&self) -> &[(TeardownStep, HarnessError)] {
        &self.failures
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Active,
    TearingDown,
    Closed,
}

/// One browser process, one isolated browsing context, one session, and a
/// teardown that always runs each release step.
///
/// Not for sharing across concurrent test units; each unit owns its own
/// harness (and with it, its own browser process).
#[derive(Debug)]
pub struct Harness {
    state: State,
    browser: Option<Browser>,
    loop_task: Option<JoinHandle<()>>,
    factory: Option<SessionFactory>,
    context: Option<BrowserContextId>,
    session: Option<Session>,
}

impl Harness {
    /// Launch the browser, connect the control channel, and create an
    /// isolated context with one session in it.
    ///
    /// On partial failure everything created so far is torn down before
    /// the error is returned.
    pub async fn launch(config: HarnessConfig) -> Result<Self, HarnessError> {
        let mut launcher = Browser::launcher();
        launcher
            .headless(config.headless)
            .output(config.output)
            .channel_ready_timeout(config.channel_ready_timeout);
        if let Some(bin) = &config.browser_bin {
            launcher.browser_bin(bin);
        }
        let mut browser = launcher.launch().await?;

        let (client, task) = match browser.connect().await {
            Ok(connected) => connected,
            Err(err) => {
                browser.close().await;
                return Err(connect_error(err));
            }
        };
        let loop_task = tokio::spawn(async move {
            if let Err(err) = task.await {
                log::warn!("message loop terminated: {}", err);
            }
        });

        let mut factory = SessionFactory::new(client);
        factory
            .command_timeout(config.command_timeout)
            .document_ready_timeout(config.document_ready_timeout);

        let mut harness = Self {
            state: State::Created,
            browser: Some(browser),
            loop_task: Some(loop_task),
            factory: Some(factory),
            context: None,
            session: None,
        };

        match harness.setup().await {
            Ok(()) => {
                harness.state = State::Active;
                Ok(harness)
            }
            Err(err) => {
                harness.teardown().await;
                Err(err)
            }
        }
    }

    async fn setup(&mut self) -> Result<(), HarnessError> {
        let factory = match &self.factory {
            Some(factory) => factory,
            None => return Ok(()),
        };
        // A failure between the two leaves the context registered with the
        // factory; the close-factory teardown step disposes it.
        let context = factory.create_context().await?;
        let session = factory.create_session(Some(&context)).await?;
        self.context = Some(context);
        self.session = Some(session);
        Ok(())
    }

    /// The harness session, while active.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// The isolated context the session lives in, while active.
    pub fn context(&self) -> Option<&BrowserContextId> {
        self.context.as_ref()
    }

    /// The context/session factory, until the factory-close teardown step.
    pub fn factory(&self) -> Option<&SessionFactory> {
        self.factory.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.state == State::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Release everything in reverse acquisition order: close session,
    /// dispose context, close factory, kill process. Every step is
    /// attempted regardless of earlier step failures. A second call
    /// no-ops and returns an empty report.
    pub async fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.state == State::Closed {
            return report;
        }
        self.state = State::TearingDown;

        let result = match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        };
        report.record(TeardownStep::CloseSession, result);

        let result = match (&self.factory, self.context.take()) {
            (Some(factory), Some(context)) => factory.dispose_context(&context).await,
            _ => Ok(()),
        };
        report.record(TeardownStep::DisposeContext, result);

        let result = match self.factory.take() {
            Some(mut factory) => factory.close().await,
            None => Ok(()),
        };
        report.record(TeardownStep::CloseFactory, result);

        let result = match self.browser.take() {
            Some(mut browser) => {
                browser.close().await;
                Ok(())
            }
            None => Ok(()),
        };
        report.record(TeardownStep::KillProcess, result);

        if let Some(task) = self.loop_task.take() {
            task.abort();
        }

        self.state = State::Closed;
        report
    }

    /// Launch, hand the session to `fun`, and tear down on every exit
    /// path. Teardown step failures are logged, never returned, so the
    /// closure's own result is what the caller sees.
    pub async fn run<F, Fut, R>(config: HarnessConfig, fun: F) -> Result<R, HarnessError>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<R, HarnessError>>,
    {
        let mut harness = Self::launch(config).await?;

        let result = match harness.session().cloned() {
            Some(session) => fun(session).await,
            None => Err(HarnessError::Channel(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "harness active without a session",
            )))),
        };

        let report = harness.teardown().await;
        if !report.is_clean() {
            log::warn!(
                "teardown completed with {} failure(s)",
                report.failures().len()
            );
        }
        result
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        // Browser::drop kills the process synchronously; the loop task is
        // aborted so it does not outlive the harness.
        if let Some(task) = self.loop_task.take() {
            task.abort();
        }
    }
}

fn connect_error(err: Error) -> HarnessError {
    match err {
        Error::Launch(launch) => HarnessError::Launch(launch),
        other => HarnessError::Channel(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_harness() -> Harness {
        Harness {
            state: State::Created,
            browser: None,
            loop_task: None,
            factory: None,
            context: None,
            session: None,
        }
    }

    #[tokio::test]
    async fn teardown_attempts_all_steps_once() {
        let mut harness = empty_harness();
        let report = harness.teardown().await;
        assert_eq!(
            report.attempted(),
            &[
                TeardownStep::CloseSession,
                TeardownStep::DisposeContext,
                TeardownStep::CloseFactory,
                TeardownStep::KillProcess,
            ]
        );
        assert!(report.is_clean());
        assert!(harness.is_closed());
    }

    #[tokio::test]
    async fn second_teardown_is_a_noop() {
        let mut harness = empty_harness();
        harness.teardown().await;
        let report = harness.teardown().await;
        assert!(report.attempted().is_empty());
        assert!(harness.is_closed());
    }

    #[test]
    fn report_keeps_failures_without_escalating() {
        let mut report = TeardownReport::default();
        report.record(TeardownStep::CloseSession, Ok(()));
        report.record(
            TeardownStep::DisposeContext,
            Err(HarnessError::NavigationTimeout(Duration::from_secs(1))),
        );
        report.record(TeardownStep::CloseFactory, Ok(()));
        assert!(!report.is_clean());
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.failures()[0].0, TeardownStep::DisposeContext);
        assert_eq!(report.attempted().len(), 3);
    }

    #[test]
    fn config_defaults_are_bounded() {
        let config = HarnessConfig::default();
        assert!(config.headless);
        assert_eq!(config.channel_ready_timeout, Duration::from_secs(10));
        assert_eq!(config.document_ready_timeout, Duration::from_secs(30));
        assert_eq!(config.command_timeout, Duration::from_secs(30));
    }
}
