use cdp_harness::{Harness, HarnessConfig, HarnessError, PrintToPdfOptions};

mod common;

const TEST_PAGE: &str = "data:text/html,<html><head><title>Test Page</title></head>\
                         <body><h1>Headless Test</h1></body></html>";

#[tokio::test]
async fn navigate_and_get_title() -> anyhow::Result<()> {
    if !common::browser_available() {
        return Ok(());
    }

    let title = Harness::run(HarnessConfig::default(), |session| async move {
        session.navigate(TEST_PAGE).await?;
        session.wait_document_ready().await?;
        session.get_title().await
    })
    .await?;

    assert_eq!(title, "Test Page");
    Ok(())
}

#[tokio::test]
async fn evaluate_in_headless_page() -> anyhow::Result<()> {
    if !common::browser_available() {
        return Ok(());
    }

    let text = Harness::run(HarnessConfig::default(), |session| async move {
        session.navigate(TEST_PAGE).await?;
        session.wait_document_ready().await?;
        session
            .evaluate("document.querySelector('h1').textContent")
            .await
    })
    .await?;

    assert_eq!(text, serde_json::json!("Headless Test"));
    Ok(())
}

#[tokio::test]
async fn script_exception_is_distinguished() -> anyhow::Result<()> {
    if !common::browser_available() {
        return Ok(());
    }

    let result = Harness::run(HarnessConfig::default(), |session| async move {
        session.navigate(TEST_PAGE).await?;
        session.wait_document_ready().await?;
        session.evaluate("throw new Error('boom')").await
    })
    .await;

    match result {
        Err(HarnessError::ScriptException(text)) => assert!(text.contains("boom")),
        other => panic!("expected script exception, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn print_page_to_pdf_file() -> anyhow::Result<()> {
    if !common::browser_available() {
        return Ok(());
    }

    let pdf = Harness::run(HarnessConfig::default(), |session| async move {
        session.navigate(TEST_PAGE).await?;
        session.wait_document_ready().await?;
        session.print_to_pdf(&PrintToPdfOptions::default()).await
    })
    .await?;

    assert!(pdf.starts_with(b"%PDF-"), "not a PDF: {:?}", &pdf[..pdf.len().min(8)]);

    let dir = tempfile::tempdir()?;
    let out = dir.path().join("pdf-output");
    std::fs::create_dir_all(&out)?;
    let path = out.join("test-page.pdf");
    std::fs::write(&path, &pdf)?;
    assert_eq!(std::fs::metadata(&path)?.len(), pdf.len() as u64);
    Ok(())
}

#[tokio::test]
async fn launch_with_bogus_binary_fails() {
    common::init();

    let config = HarnessConfig {
        browser_bin: Some("/nonexistent/browser-binary".into()),
        ..HarnessConfig::default()
    };
    let result = Harness::run(config, |_| async { Ok(()) }).await;
    assert!(matches!(result, Err(HarnessError::Launch(..))));
}
