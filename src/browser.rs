use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime};

use dirs::home_dir;
use tempfile::TempDir;
use tokio::fs::{create_dir_all, metadata, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::sleep;
use url::Url;
use which::which;

use crate::process::{Process, ProcessBuilder};

/// Environment variable overriding browser binary discovery.
pub const BROWSER_BIN: &str = "CDP_HARNESS_BROWSER";

const DEFAULT_CHANNEL_READY_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Browser launch error.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// IO error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Control channel endpoint did not appear within the timeout.
    #[error("control channel not ready after {0:?}")]
    ChannelNotReady(Duration),

    /// Unexpected format for DevToolsActivePort.
    #[error("unexpected format.")]
    UnexpectedFormat,

    /// Failed to parse URL.
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),

    /// Browser not found.
    #[error("browser not found.")]
    BrowserNotFound,

    /// Browser process exited before the control channel came up.
    #[error("browser process terminated during startup.")]
    ProcessExited,
}

type Result<T> = std::result::Result<T, LaunchError>;

#[derive(Debug)]
enum UserDataDir {
    Generated(TempDir),
    Specified(PathBuf),
}

impl UserDataDir {
    async fn generated() -> Result<Self> {
        if let Ok(..) = metadata("/snap").await {
            // Snapcraft chromium can not access /tmp dir.
            let snapdir = home_dir()
                .unwrap_or_else(|| "".into())
                .join("snap/chromium/common");
            create_dir_all(&snapdir).await?;
            Ok(Self::Generated(TempDir::new_in(&snapdir)?))
        } else {
            Ok(Self::Generated(TempDir::new()?))
        }
    }

    fn path(&self) -> PathBuf {
        match self {
            Self::Generated(dir) => dir.as_ref().to_path_buf(),
            Self::Specified(dir) => dir.clone(),
        }
    }
}

/// Browser type.
#[derive(Debug, Clone)]
pub enum BrowserType {
    /// Chromium
    Chromium,
}

/// Locate a browser binary the way [`Launcher`] would, honoring the
/// [`BROWSER_BIN`] environment variable.
pub fn default_browser() -> Option<PathBuf> {
    which_browser(&BrowserType::Chromium)
}

fn which_browser(browser: &BrowserType) -> Option<PathBuf> {
    if let Ok(val) = env::var(BROWSER_BIN) {
        return which(val).ok();
    }
    crate::os::find_browser(browser)
}

/// Launcher (Builder) for Browser.
#[derive(Debug, Default)]
pub struct Launcher {
    browser_type: Option<BrowserType>,
    browser_bin: Option<PathBuf>,
    user_data_dir: Option<PathBuf>,
    headless: Option<bool>,
    incognito: Option<bool>,
    output: Option<bool>,
    channel_ready_timeout: Option<Duration>,
}

impl Launcher {
    /// Specify launching browser type. (Default: Chromium)
    pub fn browser_type(&mut self, value: BrowserType) -> &mut Self {
        self.browser_type = Some(value);
        self
    }

    /// Specify the browser executable explicitly, bypassing discovery.
    pub fn browser_bin<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.browser_bin = Some(path.as_ref().to_path_buf());
        self
    }

    /// Specify user data dir. (If not specified: using temporary dir)
    pub fn user_data_dir<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.user_data_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Specify headless mode or not. (Default: headless)
    pub fn headless(&mut self, value: bool) -> &mut Self {
        self.headless = Some(value);
        self
    }

    /// Default the browser to an ephemeral incognito profile. (Default: true)
    pub fn incognito(&mut self, value: bool) -> &mut Self {
        self.incognito = Some(value);
        self
    }

    /// Whether or not browser process stdout / stderr. (Default: false)
    pub fn output(&mut self, value: bool) -> &mut Self {
        self.output = Some(value);
        self
    }

    /// How long to wait for the control channel endpoint. (Default: 10s)
    pub fn channel_ready_timeout(&mut self, value: Duration) -> &mut Self {
        self.channel_ready_timeout = Some(value);
        self
    }

    fn flags(&self) -> Vec<String> {
        let mut flags = vec![];
        if self.headless.unwrap_or(true) {
            flags.push("--headless".to_string());
            flags.push("--disable-gpu".to_string());
        }
        if self.incognito.unwrap_or(true) {
            flags.push("--incognito".to_string());
        }

        // https://github.com/puppeteer/puppeteer/blob/9a8479a52a7d8b51690b0732b2a10816cd1b8aef/src/node/Launcher.ts#L159
        flags.extend(
            [
                "--disable-background-networking",
                "--enable-features=NetworkService,NetworkServiceInProcess",
                "--disable-background-timer-throttling",
                "--disable-backgrounding-occluded-windows",
                "--disable-breakpad",
                "--disable-client-side-phishing-detection",
                "--disable-component-extensions-with-background-pages",
                "--disable-default-apps",
                "--disable-dev-shm-usage",
                "--disable-extensions",
                "--disable-features=Translate",
                "--disable-hang-monitor",
                "--disable-ipc-flooding-protection",
                "--disable-popup-blocking",
                "--disable-prompt-on-repost",
                "--disable-renderer-backgrounding",
                "--disable-sync",
                "--force-color-profile=srgb",
                "--metrics-recording-only",
                "--no-first-run",
                "--enable-automation",
                "--password-store=basic",
                "--use-mock-keychain",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        flags
    }

    /// Launching browser.
    pub async fn launch(&mut self) -> Result<Browser> {
        let now = SystemTime::now();

        let user_data_dir = if let Some(dir) = &self.user_data_dir {
            UserDataDir::Specified(dir.clone())
        } else {
            UserDataDir::generated().await?
        };

        let browser_type = self
            .browser_type
            .to_owned()
            .unwrap_or(BrowserType::Chromium);

        let bin = self
            .browser_bin
            .clone()
            .or_else(|| which_browser(&browser_type))
            .ok_or(LaunchError::BrowserNotFound)?;
        let mut command = ProcessBuilder::new(bin);

        command.stdin(Stdio::null());
        if self.output.unwrap_or(false) {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        command.args(self.flags());
        command.arg(&format!(
            "--user-data-dir={}",
            user_data_dir.path().to_string_lossy()
        ));
        command.arg("--remote-debugging-port=0");

        log::debug!("browser spawned {:?}", command);
        let proc = command.spawn()?;

        Ok(Browser {
            when: now,
            proc: Some(proc),
            user_data_dir: Some(user_data_dir),
            channel_ready_timeout: self
                .channel_ready_timeout
                .unwrap_or(DEFAULT_CHANNEL_READY_TIMEOUT),
        })
    }
}

/// Represent instance.
///
/// Make drop on kill (TERM) and clean generated user data dir best effort.
#[derive(Debug)]
pub struct Browser {
    when: SystemTime,
    proc: Option<Process>,
    user_data_dir: Option<UserDataDir>,
    channel_ready_timeout: Duration,
}

impl Browser {
    /// Construct [`Launcher`] instance.
    pub fn launcher() -> Launcher {
        Default::default()
    }

    fn user_data_dir(&self) -> PathBuf {
        self.user_data_dir
            .as_ref()
            .expect("already closed.")
            .path()
    }

    /// Wait for the websocket endpoint advertised in `DevToolsActivePort`.
    pub(crate) async fn cdp_url(&mut self) -> Result<Url> {
        let f = self.user_data_dir().join("DevToolsActivePort");

        let deadline = Instant::now() + self.channel_ready_timeout;
        let mut n = 0usize;
        while Instant::now() < deadline {
            match File::open(&f).await {
                Ok(f) => {
                    let metadata = f.metadata().await?;
                    if metadata.modified()? >= self.when {
                        let mut f = BufReader::new(f).lines();
                        let maybe_port = f.next_line().await?;
                        let maybe_path = f.next_line().await?;
                        let maybe_eof = f.next_line().await?;
                        if let (Some(port), Some(path), None) = (maybe_port, maybe_path, maybe_eof)
                        {
                            return Ok(Url::parse(&format!("ws://127.0.0.1:{}{}", port, path))?);
                        } else {
                            return Err(LaunchError::UnexpectedFormat);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if self
                        .proc
                        .as_mut()
                        .ok_or(LaunchError::ProcessExited)?
                        .try_wait()?
                    {
                        return Err(LaunchError::ProcessExited);
                    }
                    log::trace!(
                        "{}: {:?} not found. wait {}.",
                        n,
                        f,
                        CHANNEL_POLL_INTERVAL.as_millis()
                    );
                }
                Err(e) => return Err(e.into()),
            }
            n += 1;
            sleep(CHANNEL_POLL_INTERVAL).await;
        }

        Err(LaunchError::ChannelNotReady(self.channel_ready_timeout))
    }

    /// Connect Chrome DevTools Protocol Client.
    ///
    /// The process handle stays with the caller; the client only borrows
    /// the control channel endpoint.
    pub async fn connect(&mut self) -> super::Result<(super::CdpClient, super::client::Loop)> {
        let url = self.cdp_url().await.map_err(crate::Error::Launch)?;
        super::CdpClient::connect(&url).await
    }

    /// Close browser.
    ///
    /// Safe to call more than once; subsequent calls no-op.
    pub async fn close(&mut self) {
        if let Some(proc) = self.proc.take() {
            proc.kill().await;
        }
        self.user_data_dir.take();
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        if let Some(proc) = self.proc.take() {
            proc.kill_sync();
        }
        self.user_data_dir.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_flags_present_by_default() {
        let flags = Launcher::default().flags();
        assert!(flags.contains(&"--headless".to_string()));
        assert!(flags.contains(&"--disable-gpu".to_string()));
        assert!(flags.contains(&"--incognito".to_string()));
    }

    #[test]
    fn headed_launch_omits_headless_flags() {
        let mut launcher = Launcher::default();
        launcher.headless(false).incognito(false);
        let flags = launcher.flags();
        assert!(!flags.contains(&"--headless".to_string()));
        assert!(!flags.contains(&"--disable-gpu".to_string()));
        assert!(!flags.contains(&"--incognito".to_string()));
        // stability flags are unconditional
        assert!(flags.contains(&"--no-first-run".to_string()));
    }

    #[tokio::test]
    async fn launch_fails_for_missing_binary() {
        let err = Browser::launcher()
            .browser_bin("/nonexistent/browser-binary")
            .launch()
            .await
            .err();
        // spawn of a nonexistent path surfaces as an IO error
        assert!(matches!(err, Some(LaunchError::Io(..))));
    }
}
