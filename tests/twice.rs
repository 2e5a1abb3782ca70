use std::time::Duration;

use cdp_harness::{Harness, HarnessConfig};

mod common;

// Two harness instances back to back must not interfere: each owns its own
// process, context and session, and leaves no browser process behind.
#[tokio::test]
async fn twice() -> anyhow::Result<()> {
    if !common::browser_available() {
        return Ok(());
    }

    let baseline = common::browser_process_count();
    proc().await?;
    assert_no_surviving_browser(baseline).await;
    proc().await?;
    assert_no_surviving_browser(baseline).await;
    Ok(())
}

// Child processes of a killed browser can take a moment to leave the
// process table.
async fn assert_no_surviving_browser(baseline: usize) {
    for _ in 0..25 {
        if common::browser_process_count() <= baseline {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("browser process survived teardown");
}

async fn proc() -> anyhow::Result<()> {
    let title = Harness::run(HarnessConfig::default(), |session| async move {
        session
            .navigate("data:text/html,<title>round trip</title>")
            .await?;
        session.wait_document_ready().await?;
        Ok(session.get_title().await?)
    })
    .await?;
    assert_eq!(title, "round trip");
    Ok(())
}
