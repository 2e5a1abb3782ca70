use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::timeout;

use crate::browser::LaunchError;
use crate::client::{CdpClient, SessionId};
use crate::Error;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DOCUMENT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Harness operation error.
///
/// Distinguishes where in the setup / drive / teardown flow a failure
/// happened, so callers can tell a script exception apart from a dead
/// control channel.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Browser could not be launched.
    #[error("failed to launch browser")]
    Launch(#[from] LaunchError),

    /// Browsing context creation failed.
    #[error("failed to create browsing context")]
    ContextCreation(#[source] Error),

    /// Session (tab) creation failed.
    #[error("failed to create session")]
    SessionCreation(#[source] Error),

    /// Document ready signal did not fire in time.
    #[error("document not ready within {0:?}")]
    NavigationTimeout(Duration),

    /// The evaluated script raised an exception.
    #[error("script threw: {0}")]
    ScriptException(String),

    /// Evaluation failed before the script ran.
    #[error("evaluation failed before the script ran")]
    Evaluation(#[source] Error),

    /// The page refused to print.
    #[error("page is not printable: {0}")]
    NotPrintable(String),

    /// Print command failed in transit.
    #[error("print failed")]
    Print(#[source] Error),

    /// Context still has open sessions attached.
    #[error("cannot dispose context {context}: {open} session(s) still open")]
    ContextBusy {
        context: BrowserContextId,
        open: usize,
    },

    /// Any other control channel failure.
    #[error(transparent)]
    Channel(#[from] Error),
}

type Result<T> = std::result::Result<T, HarnessError>;

/// Opaque identifier of an isolated browsing context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrowserContextId(String);

impl BrowserContextId {
    fn new<S: Into<String>>(v: S) -> Self {
        Self(v.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrowserContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which sessions belong to which context, shared between the factory and
/// every session handle. Source of truth for close idempotence and the
/// dispose-ordering check.
#[derive(Debug, Default)]
struct Registry {
    contexts: HashSet<BrowserContextId>,
    // target id -> owning context (None: browser default context)
    sessions: HashMap<String, Option<BrowserContextId>>,
}

impl Registry {
    fn open_sessions_in(&self, context: &BrowserContextId) -> usize {
        self.sessions
            .values()
            .filter(|ctx| ctx.as_ref() == Some(context))
            .count()
    }
}

async fn bounded<F>(limit: Duration, fut: F) -> crate::Result<Value>
where
    F: Future<Output = crate::Result<Value>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(..) => Err(Error::Timeout(limit)),
    }
}

/// Factory for isolated browsing contexts and sessions (tabs).
#[derive(Debug)]
pub struct SessionFactory {
    client: CdpClient,
    registry: Arc<Mutex<Registry>>,
    command_timeout: Duration,
    document_ready_timeout: Duration,
    closed: bool,
}

impl SessionFactory {
    pub fn new(client: CdpClient) -> Self {
        Self {
            client,
            registry: Default::default(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            document_ready_timeout: DEFAULT_DOCUMENT_READY_TIMEOUT,
            closed: false,
        }
    }

    /// Bound for a single command round trip. (Default: 30s)
    pub fn command_timeout(&mut self, value: Duration) -> &mut Self {
        self.command_timeout = value;
        self
    }

    /// Bound for [`Session::wait_document_ready`]. (Default: 30s)
    pub fn document_ready_timeout(&mut self, value: Duration) -> &mut Self {
        self.document_ready_timeout = value;
        self
    }

    /// Create a new isolated browsing context.
    pub async fn create_context(&self) -> Result<BrowserContextId> {
        let response = bounded(
            self.command_timeout,
            self.client
                .request(None, "Target.createBrowserContext", json!({})),
        )
        .await
        .map_err(HarnessError::ContextCreation)?;

        let id = response
            .get("browserContextId")
            .and_then(Value::as_str)
            .ok_or_else(|| HarnessError::ContextCreation(Error::Response(response.clone())))?;
        let id = BrowserContextId::new(id);

        self.registry.lock().unwrap().contexts.insert(id.clone());
        log::debug!("browsing context created: {}", id);
        Ok(id)
    }

    /// Create a new session, scoped to `context` when given, otherwise in
    /// the browser's default context.
    pub async fn create_session(&self, context: Option<&BrowserContextId>) -> Result<Session> {
        let mut params = json!({ "url": "about:blank" });
        if let Some(context) = context {
            params["browserContextId"] = json!(context);
        }
        let response = bounded(
            self.command_timeout,
            self.client.request(None, "Target.createTarget", params),
        )
        .await
        .map_err(HarnessError::SessionCreation)?;
        let target_id = response
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| HarnessError::SessionCreation(Error::Response(response.clone())))?
            .to_string();

        // The tab exists browser-side from here on. Register before attach
        // so a failure below still leaves it reachable by the close() sweep.
        self.registry
            .lock()
            .unwrap()
            .sessions
            .insert(target_id.clone(), context.cloned());

        let response = bounded(
            self.command_timeout,
            self.client.request(
                None,
                "Target.attachToTarget",
                json!({ "targetId": &target_id, "flatten": true }),
            ),
        )
        .await
        .map_err(HarnessError::SessionCreation)?;
        let session_id = response
            .get("sessionId")
            .and_then(Value::as_str)
            .map(SessionId::new)
            .ok_or_else(|| HarnessError::SessionCreation(Error::Response(response.clone())))?;

        let session = Session {
            client: self.client.clone(),
            session_id,
            target_id,
            context: context.cloned(),
            registry: self.registry.clone(),
            command_timeout: self.command_timeout,
            document_ready_timeout: self.document_ready_timeout,
        };

        // Page domain events drive wait_document_ready.
        bounded(
            self.command_timeout,
            self.client
                .request(Some(&session.session_id), "Page.enable", json!({})),
        )
        .await
        .map_err(HarnessError::SessionCreation)?;

        log::debug!("session created: {}", session.session_id);
        Ok(session)
    }

    /// Dispose an isolated browsing context.
    ///
    /// Rejects with [`HarnessError::ContextBusy`] while sessions created in
    /// the context are still open. Disposing an unknown or already-disposed
    /// context is a no-op.
    pub async fn dispose_context(&self, context: &BrowserContextId) -> Result<()> {
        {
            let registry = self.registry.lock().unwrap();
            if !registry.contexts.contains(context) {
                log::debug!("context {} already disposed", context);
                return Ok(());
            }
            let open = registry.open_sessions_in(context);
            if open > 0 {
                return Err(HarnessError::ContextBusy {
                    context: context.clone(),
                    open,
                });
            }
        }

        bounded(
            self.command_timeout,
            self.client.request(
                None,
                "Target.disposeBrowserContext",
                json!({ "browserContextId": context }),
            ),
        )
        .await?;

        self.registry.lock().unwrap().contexts.remove(context);
        log::debug!("browsing context disposed: {}", context);
        Ok(())
    }

    /// Close the factory: force-close sessions it still tracks, dispose
    /// remaining contexts. Idempotent; returns the first failure but
    /// attempts every release.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let (targets, contexts) = {
            let registry = self.registry.lock().unwrap();
            (
                registry.sessions.keys().cloned().collect::<Vec<_>>(),
                registry.contexts.iter().cloned().collect::<Vec<_>>(),
            )
        };

        let mut first_failure = None;
        for target_id in targets {
            let result = bounded(
                self.command_timeout,
                self.client
                    .request(None, "Target.closeTarget", json!({ "targetId": &target_id })),
            )
            .await;
            match result {
                Ok(..) => {
                    self.registry.lock().unwrap().sessions.remove(&target_id);
                }
                Err(err) => {
                    log::warn!("failed to close target {}: {}", target_id, err);
                    first_failure.get_or_insert(HarnessError::Channel(err));
                }
            }
        }
        for context in contexts {
            if let Err(err) = self.dispose_context(&context).await {
                log::warn!("failed to dispose context {}: {}", context, err);
                first_failure.get_or_insert(err);
            }
        }

        match first_failure {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// A single controllable tab, bound to one browsing context.
///
/// Cloneable handle; the shared registry records whether the underlying
/// target is still open, so `close` on any clone is observed by all.
#[derive(Debug, Clone)]
pub struct Session {
    client: CdpClient,
    session_id: SessionId,
    target_id: String,
    context: Option<BrowserContextId>,
    registry: Arc<Mutex<Registry>>,
    command_timeout: Duration,
    document_ready_timeout: Duration,
}

impl Session {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Owning context, `None` for the browser default context.
    pub fn context(&self) -> Option<&BrowserContextId> {
        self.context.as_ref()
    }

    async fn command(&self, method: &str, params: Value) -> crate::Result<Value> {
        bounded(
            self.command_timeout,
            self.client.request(Some(&self.session_id), method, params),
        )
        .await
    }

    /// Begin loading `url`. Does not wait for the load to complete.
    pub async fn navigate(&self, url: &str) -> Result<()> {
        let response = self.command("Page.navigate", json!({ "url": url })).await?;
        if let Some(error_text) = response.get("errorText").and_then(Value::as_str) {
            if !error_text.is_empty() {
                return Err(HarnessError::Channel(Error::Response(response.clone())));
            }
        }
        Ok(())
    }

    /// Wait until the current document reports ready.
    ///
    /// Subscribes for load events before probing `document.readyState`, so
    /// a load firing between the two cannot be missed.
    pub async fn wait_document_ready(&self) -> Result<()> {
        let mut events = self
            .client
            .events(Some(&self.session_id))
            .map_err(HarnessError::Channel)?;

        let state = self.eval_value("document.readyState").await?;
        if state.as_str() == Some("complete") {
            return Ok(());
        }

        let limit = self.document_ready_timeout;
        let wait = async move {
            while let Some(event) = events.next().await {
                if event.method == "Page.loadEventFired" {
                    return Ok(());
                }
            }
            Err(HarnessError::Channel(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "control channel closed while waiting for document ready",
            ))))
        };
        match timeout(limit, wait).await {
            Ok(result) => result,
            Err(..) => Err(HarnessError::NavigationTimeout(limit)),
        }
    }

    /// Current document title; empty string when none is set.
    pub async fn get_title(&self) -> Result<String> {
        let title = self.eval_value("document.title").await?;
        Ok(title.as_str().unwrap_or_default().to_string())
    }

    /// Execute `script` in the page and return its serialized result.
    ///
    /// A script-level exception surfaces as
    /// [`HarnessError::ScriptException`]; a transport problem as
    /// [`HarnessError::Evaluation`].
    pub async fn evaluate(&self, script: &str) -> Result<Value> {
        self.eval_value(script).await
    }

    async fn eval_value(&self, script: &str) -> Result<Value> {
        let response = self
            .command(
                "Runtime.evaluate",
                json!({ "expression": script, "returnByValue": true }),
            )
            .await
            .map_err(HarnessError::Evaluation)?;

        if let Some(details) = response.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("unknown exception");
            return Err(HarnessError::ScriptException(text.to_string()));
        }

        Ok(response
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Render the current page to PDF.
    pub async fn print_to_pdf(&self, options: &PrintToPdfOptions) -> Result<Vec<u8>> {
        let params = serde_json::to_value(options).map_err(|e| HarnessError::Print(e.into()))?;
        let response = match self.command("Page.printToPDF", params).await {
            Ok(response) => response,
            Err(Error::Response(err)) => {
                let message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("print refused");
                return Err(HarnessError::NotPrintable(message.to_string()));
            }
            Err(err) => return Err(HarnessError::Print(err)),
        };

        let data = response
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| HarnessError::NotPrintable("no data in response".to_string()))?;
        let bytes = base64::decode(data).map_err(|e| {
            HarnessError::Print(Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
        })?;
        log::debug!("printed {} bytes of PDF", bytes.len());
        Ok(bytes)
    }

    /// Close the tab. Safe to call more than once; a session whose target
    /// is no longer registered no-ops.
    pub async fn close(&self) -> Result<()> {
        {
            let registry = self.registry.lock().unwrap();
            if !registry.sessions.contains_key(&self.target_id) {
                return Ok(());
            }
        }

        bounded(
            self.command_timeout,
            self.client.request(
                None,
                "Target.closeTarget",
                json!({ "targetId": &self.target_id }),
            ),
        )
        .await?;

        self.registry.lock().unwrap().sessions.remove(&self.target_id);
        log::debug!("session closed: {}", self.session_id);
        Ok(())
    }
}

/// Page margins for [`PrintToPdfOptions`], in inches.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Margins {
    pub margin_top: f64,
    pub margin_bottom: f64,
    pub margin_left: f64,
    pub margin_right: f64,
}

impl Default for Margins {
    fn default() -> Self {
        Self {
            margin_top: 0.4,
            margin_bottom: 0.4,
            margin_left: 0.4,
            margin_right: 0.4,
        }
    }
}

/// Options for [`Session::print_to_pdf`].
///
/// Defaults: US Letter portrait at 100% scale with background graphics,
/// 0.4in margins, all pages.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintToPdfOptions {
    pub landscape: bool,
    pub display_header_footer: bool,
    pub print_background: bool,
    pub scale: f64,
    /// Paper width in inches.
    pub paper_width: f64,
    /// Paper height in inches.
    pub paper_height: f64,
    #[serde(flatten)]
    pub margins: Margins,
    /// Page ranges to print, e.g. "1-5, 8"; empty prints all pages.
    pub page_ranges: String,
    pub ignore_invalid_page_ranges: bool,
    pub header_template: String,
    pub footer_template: String,
    #[serde(rename = "preferCSSPageSize")]
    pub prefer_css_page_size: bool,
}

impl Default for PrintToPdfOptions {
    fn default() -> Self {
        Self {
            landscape: false,
            display_header_footer: false,
            print_background: true,
            scale: 1.0,
            paper_width: 8.5,
            paper_height: 11.0,
            margins: Default::default(),
            page_ranges: String::new(),
            ignore_invalid_page_ranges: false,
            header_template: String::new(),
            footer_template: String::new(),
            prefer_css_page_size: false,
        }
    }
}
