#![doc(html_root_url = "https://docs.rs/cdp-harness/0.1.0")]
//! Disposable headless-Chromium session harness over the
//! [Chrome DevTools Protocol](https://chromedevtools.github.io/devtools-protocol/).
//!
//! The harness owns one browser process, one isolated browsing context and
//! one session (tab), and guarantees ordered best-effort teardown of all
//! three no matter how the body of a test unit exits.
//!
//! ## Example
//!
//! ```no_run
//! use cdp_harness::{Harness, HarnessConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let title = Harness::run(HarnessConfig::default(), |session| async move {
//!         session.navigate("https://example.org/").await?;
//!         session.wait_document_ready().await?;
//!         Ok(session.get_title().await?)
//!     })
//!     .await?;
//!
//!     println!("title: {}", title);
//!     Ok(())
//! }
//! ```
//!
//! ## License
//!
//! Licensed under either of
//! * Apache License, Version 2.0
//!   ([LICENSE-APACHE](LICENSE-APACHE) or http://www.apache.org/licenses/LICENSE-2.0)
//! * MIT license
//!   ([LICENSE-MIT](LICENSE-MIT) or http://opensource.org/licenses/MIT)
//! at your option.

use std::io;
use std::time::Duration;

use futures::channel::mpsc;
use futures::channel::oneshot;

pub use browser::{default_browser, Browser, BrowserType, LaunchError, Launcher, BROWSER_BIN};
pub use client::{CdpClient, CdpEvents, Event, Loop, SessionId};
pub use harness::{Harness, HarnessConfig, TeardownReport, TeardownStep};
pub use session::{
    BrowserContextId, HarnessError, Margins, PrintToPdfOptions, Session, SessionFactory,
};

mod browser;
mod client;
mod harness;
pub(crate) mod os;
pub(crate) mod process;
mod session;

/// Control channel error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO Error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Websocket Request Error.
    #[error(transparent)]
    WsRequest(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialize / Deserialize Error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Chrome DevTools Protocol Command Error.
    #[error("error response {0:?}")]
    Response(serde_json::Value),

    /// Loop Cancelation Error.
    #[error("loop canceled")]
    LoopCanceled(#[from] oneshot::Canceled),

    /// Maybe Loop Aborted Error.
    #[error("loop aborted")]
    LoopAborted(#[from] mpsc::SendError),

    /// Bounded wait expired.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// Browser launch error.
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl<T> From<mpsc::TrySendError<T>> for Error {
    fn from(v: mpsc::TrySendError<T>) -> Self {
        Self::LoopAborted(v.into_send_error())
    }
}

/// Control channel result.
pub type Result<T> = std::result::Result<T, Error>;
