use cdp_harness::default_browser;
use sysinfo::{ProcessExt, RefreshKind, System, SystemExt};

pub fn init() {
    pretty_env_logger::try_init().ok();
}

/// Browser processes currently in the process table.
#[allow(dead_code)]
pub fn browser_process_count() -> usize {
    let sys = System::new_with_specifics(RefreshKind::new().with_processes());
    let mut count = 0;
    for name in &["chromium", "chrome", "Chromium"] {
        for proc in sys.process_by_name(name) {
            println!("{:?} {} {:?}", proc.parent(), proc.pid(), proc.cmd());
            count += 1;
        }
    }
    count
}

/// Live-browser tests skip (pass vacuously) when no browser binary can be
/// discovered on this machine.
pub fn browser_available() -> bool {
    init();
    if default_browser().is_none() {
        eprintln!("[SKIP] no chromium/chrome binary found; skipping live browser test");
        return false;
    }
    true
}
