use std::io;
use std::path::PathBuf;

use nix::sys::signal::{kill, SIGTERM};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tokio::process::Child;
use which::which;

use crate::browser::BrowserType;

const CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
];

#[cfg(target_os = "macos")]
const APP_BUNDLES: &[&str] = &[
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
];

pub fn find_browser(_browser: &BrowserType) -> Option<PathBuf> {
    for bin in CANDIDATES {
        if let Ok(bin) = which(bin) {
            return Some(bin);
        }
    }

    #[cfg(target_os = "macos")]
    for bundle in APP_BUNDLES {
        let bundle = PathBuf::from(bundle);
        if bundle.exists() {
            return Some(bundle);
        }
    }

    None
}

pub async fn proc_kill(mut proc: Child) {
    if let Some(pid) = proc.id() {
        let pid = Pid::from_raw(pid as i32);
        kill(pid, Some(SIGTERM)).ok();
        proc.wait().await.ok();
    }
}

pub fn proc_kill_sync(proc: Child) {
    if let Some(pid) = proc.id() {
        let pid = Pid::from_raw(pid as i32);
        kill(pid, Some(SIGTERM)).ok();
        waitpid(Some(pid), None).ok(); // FIXME blocking
    }
}

pub fn try_wait(proc: &mut Child) -> io::Result<bool> {
    Ok(proc.try_wait()?.is_some())
}
