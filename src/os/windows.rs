use std::io;
use std::path::PathBuf;

use tokio::process::Child;
use which::which;

use crate::browser::BrowserType;

pub fn find_browser(_browser: &BrowserType) -> Option<PathBuf> {
    if let Ok(bin) = which(r#"C:\Program Files\Chromium\Application\chrome.exe"#) {
        return Some(bin);
    }
    if let Ok(bin) = which(r#"C:\Program Files\Google\Chrome\Application\chrome.exe"#) {
        return Some(bin);
    }

    which("chromium").or_else(|_| which("chrome")).ok()
}

pub async fn proc_kill(mut proc: Child) {
    proc.start_kill().ok();
    proc.wait().await.ok();
}

pub fn proc_kill_sync(mut proc: Child) {
    proc.start_kill().ok();
}

pub fn try_wait(proc: &mut Child) -> io::Result<bool> {
    Ok(proc.try_wait()?.is_some())
}
