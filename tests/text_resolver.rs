//! Text-first mark resolution, including the renumbered-overlay reselect
//! path for duplicate link texts.

mod common;

use std::collections::BTreeMap;

use common::{FakeLlm, FakePage};
use somspider::som::snapshot::{BoundingBox, ElementMark, SoMSnapshot};
use somspider::som::{resolve_mark_ids_from_map, resolve_single_mark_id};

fn mark(id: u64, text: &str, href: &str) -> ElementMark {
    ElementMark {
        mark_id: id,
        tag: "a".into(),
        role: None,
        text: text.into(),
        aria_label: None,
        placeholder: None,
        title: None,
        value: None,
        href: Some(href.into()),
        input_type: None,
        bbox: BoundingBox {
            x: 10.0,
            y: 20.0 * id as f64,
            width: 80.0,
            height: 16.0,
        },
        center_normalized: (0.5, 0.5),
        xpath_candidates: vec![],
        is_visible: true,
    }
}

fn snapshot(marks: Vec<ElementMark>) -> SoMSnapshot {
    SoMSnapshot {
        url: "https://example.com/list".into(),
        title: "list".into(),
        viewport_width: 1280,
        viewport_height: 720,
        marks,
        scroll_info: None,
        timestamp: 0,
    }
}

fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[tokio::test]
async fn duplicate_texts_resolve_to_two_distinct_marks() {
    // Two links share the exact text "查看详情" and the model got both ids
    // wrong. Each entry triggers the overlay-renumber reselect, and the two
    // answers land on different marks with different hrefs.
    let snap = snapshot(vec![
        mark(12, "查看详情", "/detail/1001"),
        mark(17, "查看详情", "/detail/1002"),
    ]);
    let page = FakePage::new("p1", "https://example.com/list", Vec::new());
    let llm = FakeLlm::new(vec![
        r#"{"action": "select", "args": {"selected_mark_id": 1}}"#,
        r#"{"action": "select", "args": {"selected_mark_id": 2}}"#,
    ]);

    let resolved = resolve_mark_ids_from_map(
        page.as_ref(),
        &llm,
        &snap,
        &map(&[("3", "查看详情"), ("7", "查看详情")]),
        1,
    )
    .await
    .expect("resolution");

    assert_eq!(resolved.len(), 2, "both entries must survive");
    assert!(resolved.contains(&12) && resolved.contains(&17));
    let hrefs: Vec<&str> = resolved
        .iter()
        .map(|id| snap.mark(*id).unwrap().href.as_deref().unwrap())
        .collect();
    assert_ne!(hrefs[0], hrefs[1]);
}

#[tokio::test]
async fn wrong_id_is_corrected_by_unique_text() {
    let snap = snapshot(vec![
        mark(3, "首页", "/"),
        mark(9, "2026年度市政道路招标公告", "/detail/88"),
    ]);
    let page = FakePage::new("p1", "https://example.com/list", Vec::new());
    let llm = FakeLlm::new(vec![]);

    // The model claimed id 5, which does not exist; the text is unique
    let resolved = resolve_single_mark_id(
        page.as_ref(),
        &llm,
        &snap,
        Some(5),
        "2026年度市政道路招标公告",
        1,
    )
    .await
    .expect("resolution");
    assert_eq!(resolved, 9);
}

#[tokio::test]
async fn single_item_not_found_is_fatal() {
    let snap = snapshot(vec![mark(1, "首页", "/")]);
    let page = FakePage::new("p1", "https://example.com/list", Vec::new());
    let llm = FakeLlm::new(vec![]);

    let result = resolve_single_mark_id(
        page.as_ref(),
        &llm,
        &snap,
        Some(1),
        "text that exists nowhere",
        1,
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn batch_drops_unresolvable_entries_but_keeps_the_rest() {
    let snap = snapshot(vec![mark(4, "招标公告一", "/d/1"), mark(5, "招标公告二", "/d/2")]);
    let page = FakePage::new("p1", "https://example.com/list", Vec::new());
    let llm = FakeLlm::new(vec![]);

    let resolved = resolve_mark_ids_from_map(
        page.as_ref(),
        &llm,
        &snap,
        &map(&[("4", "招标公告一"), ("99", "ghost entry"), ("5", "招标公告二")]),
        1,
    )
    .await
    .expect("partial resolution");
    assert!(resolved.contains(&4) && resolved.contains(&5));
    assert_eq!(resolved.len(), 2);
}

#[tokio::test]
async fn second_reselect_failure_skips_the_item() {
    // Ambiguous entry in a batch: the model answers garbage twice, the item
    // is dropped, the unambiguous one survives
    let snap = snapshot(vec![
        mark(1, "查看详情", "/d/1"),
        mark(2, "查看详情", "/d/2"),
        mark(3, "独立公告", "/d/3"),
    ]);
    let page = FakePage::new("p1", "https://example.com/list", Vec::new());
    let llm = FakeLlm::new(vec![
        r#"{"no": "json of use"}"#,
        r#"{"still": "useless"}"#,
    ]);

    let resolved = resolve_mark_ids_from_map(
        page.as_ref(),
        &llm,
        &snap,
        &map(&[("1", "查看详情"), ("3", "独立公告")]),
        2,
    )
    .await
    .expect("partial resolution");
    assert_eq!(resolved, vec![3]);
}
