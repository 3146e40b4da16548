//! Field-template induction across the exploration sample
//!
//! Visits a few detail pages with the learning loop, folds each field's
//! per-page xpaths into one template, then proves every template on a
//! separate validation sample before the workers are allowed to trust it.

use std::time::Duration;

use log::{info, warn};

use crate::actions::ActionExecutor;
use crate::browser::{BrowserHandle, PageHandle, SharedPage};
use crate::config::SpiderConfig;
use crate::llm::LlmClient;
use crate::pattern::{validate_xpath_pattern, PatternSynthesizer};
use crate::task::FieldDefinition;

use super::learner::learn_field_on_page;
use super::record::{CommonFieldXPath, FieldOutcome, PageExtractionRecord};

/// Learn and validate one template per field.
///
/// `explore_urls` feed induction; `validate_urls` gate the `validated` flag
/// at the configured pass ratio.
pub async fn learn_field_patterns(
    browser: &dyn BrowserHandle,
    llm: &dyn LlmClient,
    config: &SpiderConfig,
    fields: &[FieldDefinition],
    explore_urls: &[String],
    validate_urls: &[String],
) -> crate::error::SpiderResult<Vec<CommonFieldXPath>> {
    let page = browser.new_page().await?;
    let records = explore_pages(browser, &page, llm, config, fields, explore_urls).await;
    if records.len() < 2 {
        warn!(
            "only {} exploration record(s); template induction needs at least 2",
            records.len()
        );
        let _ = page.close().await;
        return Ok(Vec::new());
    }

    let synthesizer = PatternSynthesizer::with_llm(llm);
    let mut patterns = Vec::new();
    for field in fields {
        let mut source_xpaths = Vec::new();
        let mut per_source_candidates = Vec::new();
        for record in &records {
            if let Some(outcome) = record.field(&field.name) {
                if let Some(xpath) = &outcome.xpath {
                    source_xpaths.push(xpath.clone());
                    per_source_candidates.push(outcome.xpath_candidates.clone());
                }
            }
        }

        let Some(synthesized) = synthesizer
            .synthesize(&field.name, &source_xpaths, &per_source_candidates)
            .await
        else {
            warn!("no common template for field '{}'", field.name);
            continue;
        };

        let mut pattern = CommonFieldXPath {
            field_name: field.name.clone(),
            xpath_pattern: synthesized.pattern,
            source_xpaths,
            confidence: synthesized.confidence,
            validated: false,
        };
        pattern.validated = validate_pattern(
            &page,
            llm,
            config,
            field,
            &pattern.xpath_pattern,
            validate_urls,
        )
        .await;
        info!(
            "field '{}': template {} (confidence {:.2}, validated {})",
            field.name, pattern.xpath_pattern, pattern.confidence, pattern.validated
        );
        patterns.push(pattern);
    }

    let _ = page.close().await;
    Ok(patterns)
}

async fn explore_pages(
    browser: &dyn BrowserHandle,
    page: &SharedPage,
    llm: &dyn LlmClient,
    config: &SpiderConfig,
    fields: &[FieldDefinition],
    explore_urls: &[String],
) -> Vec<PageExtractionRecord> {
    let timeout = Duration::from_secs(config.browser.page_load_timeout_secs);
    let mut records = Vec::new();

    for url in explore_urls.iter().take(config.extractor.explore_count) {
        if let Err(e) = page.goto(url, timeout).await {
            warn!("exploration page unreachable, skipping {url}: {e}");
            continue;
        }

        let mut outcomes: Vec<FieldOutcome> = Vec::with_capacity(fields.len());
        for field in fields {
            let mut executor = ActionExecutor::new(
                browser,
                SharedPage::clone(page),
                Duration::from_millis(config.browser.step_timeout_ms),
            );
            outcomes.push(learn_field_on_page(&mut executor, llm, field, config).await);
        }
        records.push(PageExtractionRecord::new(url, outcomes, fields));
    }
    records
}

/// Re-run the template over the validation sample; it passes when the
/// configured ratio of pages yields a non-empty, type- and semantics-valid
/// value
async fn validate_pattern(
    page: &SharedPage,
    llm: &dyn LlmClient,
    config: &SpiderConfig,
    field: &FieldDefinition,
    xpath_pattern: &str,
    validate_urls: &[String],
) -> bool {
    let sample: Vec<&String> = validate_urls
        .iter()
        .take(config.extractor.validate_count)
        .collect();
    if sample.is_empty() {
        return false;
    }

    let timeout = Duration::from_secs(config.browser.page_load_timeout_secs);
    let mut passed = 0usize;
    for url in &sample {
        let (ok, _) = validate_xpath_pattern(
            page.as_ref(),
            url,
            xpath_pattern,
            None,
            field,
            Some(llm),
            timeout,
        )
        .await;
        if ok {
            passed += 1;
        }
    }

    let ratio = passed as f64 / sample.len() as f64;
    ratio >= config.extractor.validation_pass_ratio
}
