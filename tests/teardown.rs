use cdp_harness::{Harness, HarnessConfig, HarnessError, TeardownStep};

mod common;

#[tokio::test]
async fn lifecycle_and_idempotent_teardown() -> anyhow::Result<()> {
    if !common::browser_available() {
        return Ok(());
    }

    let mut harness = Harness::launch(HarnessConfig::default()).await?;
    assert!(harness.is_active());
    assert!(harness.session().is_some());
    assert!(harness.context().is_some());

    let report = harness.teardown().await;
    assert!(report.is_clean(), "failures: {:?}", report.failures());
    assert_eq!(
        report.attempted(),
        &[
            TeardownStep::CloseSession,
            TeardownStep::DisposeContext,
            TeardownStep::CloseFactory,
            TeardownStep::KillProcess,
        ]
    );
    assert!(harness.is_closed());

    // repeated invocation from a nested cleanup handler must be safe
    let report = harness.teardown().await;
    assert!(report.attempted().is_empty());
    Ok(())
}

#[tokio::test]
async fn session_close_twice_noops() -> anyhow::Result<()> {
    if !common::browser_available() {
        return Ok(());
    }

    let mut harness = Harness::launch(HarnessConfig::default()).await?;
    let session = harness.session().cloned().expect("active harness");
    session.close().await?;
    session.close().await?;

    let report = harness.teardown().await;
    assert!(report.is_clean(), "failures: {:?}", report.failures());
    Ok(())
}

#[tokio::test]
async fn dispose_rejects_context_with_open_session() -> anyhow::Result<()> {
    if !common::browser_available() {
        return Ok(());
    }

    let mut harness = Harness::launch(HarnessConfig::default()).await?;
    let factory = harness.factory().expect("active harness");
    let context = harness.context().cloned().expect("active harness");

    let err = factory.dispose_context(&context).await.unwrap_err();
    assert!(matches!(err, HarnessError::ContextBusy { .. }));

    // closing the session unblocks disposal
    harness.session().cloned().expect("active harness").close().await?;
    harness.factory().expect("active harness").dispose_context(&context).await?;

    let report = harness.teardown().await;
    assert!(report.is_clean(), "failures: {:?}", report.failures());
    Ok(())
}

#[tokio::test]
async fn failing_body_still_tears_down() -> anyhow::Result<()> {
    if !common::browser_available() {
        return Ok(());
    }

    let result: Result<(), _> = Harness::run(HarnessConfig::default(), |session| async move {
        session.navigate("data:text/html,<title>x</title>").await?;
        session.wait_document_ready().await?;
        session.evaluate("undefined.property").await?;
        Ok(())
    })
    .await;

    // the script failure is what the caller observes; teardown already ran
    assert!(matches!(result, Err(HarnessError::ScriptException(..))));
    Ok(())
}
