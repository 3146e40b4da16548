//! XPath induction end to end: folding visit xpaths into a template,
//! over-broad rejection, union handling, and the synthesizer's fallback
//! ladder with an LLM in the loop.

mod common;

use common::FakeLlm;
use somspider::pattern::{
    fold_detail_xpath, is_over_broad, pattern_confidence, PatternSynthesizer,
};
use somspider::som::snapshot::{XPathCandidate, XPathStrategy};

fn strings(xs: &[&str]) -> Vec<String> {
    xs.iter().map(|s| (*s).to_string()).collect()
}

#[test]
fn three_visits_fold_into_one_template() {
    // Visits landed on rows 1, 3 and 5 of the same list
    let sources = strings(&[
        "//section//ul/li[1]/a",
        "//section//ul/li[3]/a",
        "//section//ul/li[5]/a",
    ]);
    let folded = fold_detail_xpath(&sources).expect("fold");
    assert_eq!(folded.pattern, "//section//ul/li/a");
    assert!(folded.confidence >= 0.9);
}

#[test]
fn heterogeneous_templates_do_not_fold() {
    let sources = strings(&["//section//ul/li[1]/a", "//main//table/tr[2]/td/a"]);
    assert!(fold_detail_xpath(&sources).is_none());
}

#[tokio::test]
async fn synthesizer_asks_llm_when_rules_go_over_broad() {
    // Sources whose only rule-merge is over-broad; the LLM answer is taken
    let llm = FakeLlm::new(vec![
        r#"{"xpath_pattern": "//div[contains(@class, 'meta')]//time"}"#,
    ]);
    let sources = strings(&["//div//span[1]", "//div//span[2]", "//section//div//span[3]"]);

    let synthesizer = PatternSynthesizer::with_llm(&llm);
    let result = synthesizer.synthesize("date", &sources, &[]).await.expect("pattern");
    assert_eq!(result.pattern, "//div[contains(@class, 'meta')]//time");
    assert_eq!(llm.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn over_broad_llm_answer_is_discarded() {
    // The model replies with a bare //span; nothing rule-based survives
    // either, so the field gets no template at all
    let llm = FakeLlm::new(vec![r#"{"xpath_pattern": "//div//span"}"#]);
    let sources = strings(&["//div//span[1]", "//article//p//span[2]"]);

    let synthesizer = PatternSynthesizer::with_llm(&llm);
    assert!(synthesizer.synthesize("price", &sources, &[]).await.is_none());
}

#[tokio::test]
async fn candidate_strategy_group_beats_absolute_fold() {
    let candidate = |xpath: &str, strategy, priority| XPathCandidate {
        xpath: xpath.to_string(),
        priority,
        strategy,
        confidence: 0.9,
    };
    let per_source = vec![
        vec![
            candidate("//*[@id='content']/h1", XPathStrategy::IdRelative, 3),
            candidate("/html/body[1]/div[2]/h1[1]", XPathStrategy::Absolute, 7),
        ],
        vec![
            candidate("//*[@id='content']/h1", XPathStrategy::IdRelative, 3),
            candidate("/html/body[1]/div[5]/h1[1]", XPathStrategy::Absolute, 7),
        ],
        vec![
            candidate("//*[@id='content']/h1", XPathStrategy::IdRelative, 3),
            candidate("/html/body[1]/div[3]/h1[1]", XPathStrategy::Absolute, 7),
        ],
    ];
    let sources = strings(&[
        "/html/body[1]/div[2]/h1[1]",
        "/html/body[1]/div[5]/h1[1]",
        "/html/body[1]/div[3]/h1[1]",
    ]);

    let synthesizer = PatternSynthesizer::new();
    let result = synthesizer
        .synthesize("title", &sources, &per_source)
        .await
        .expect("pattern");
    assert_eq!(result.pattern, "//*[@id='content']/h1");
}

#[test]
fn over_broad_rules_match_the_catalogue() {
    for bad in ["//div//span", "//section//div", "//*", "//ul//div", "relative/a"] {
        assert!(is_over_broad(bad), "{bad} should be over-broad");
    }
    for good in [
        "//*[@id='main']/ul/li/a",
        "//div[contains(@class, 'list')]//a",
        "//section/ul/li/a",
    ] {
        assert!(!is_over_broad(good), "{good} should be acceptable");
    }
}

#[test]
fn union_confidence_blends_exact_and_normalized() {
    let sources = strings(&["//*[@id='a']/li/a", "//*[@id='b']/div/a"]);
    let union = "//*[@id='a']/li/a | //*[@id='b']/div/a";
    // Every source matches one union member exactly and structurally
    let confidence = pattern_confidence(&sources, union);
    assert!((confidence - 1.0).abs() < 1e-9, "got {confidence}");
}
