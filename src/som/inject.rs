//! SoM injection and screenshot helpers
//!
//! [`inject_and_scan`] evaluates the page-side scanner, which tags every
//! interactive element with `data-som-id`, draws the numbered overlay, and
//! returns the snapshot JSON. The custom-overlay screenshot path renumbers a
//! handful of candidate elements for disambiguation without disturbing the
//! original mark bindings.

use base64::Engine;
use serde_json::json;

use crate::browser::PageHandle;
use crate::error::{SpiderError, SpiderResult};

use super::snapshot::{BoundingBox, SoMSnapshot};

/// Page-side scanner. Finds interactive elements, assigns mark ids, tags
/// them with `data-som-id`, builds multi-strategy xpath candidates, draws
/// the overlay, and returns the snapshot.
const SOM_SCAN_JS: &str = r#"
(() => {
    const OVERLAY_ID = '__som_overlay_container__';

    const SELECTOR = [
        'button', 'input', 'select', 'textarea',
        'a[href]', 'a[onclick]',
        'details', 'summary',
        'label[for]',
        '[onclick]', '[onsubmit]', '[onchange]',
        '[role="button"]', '[role="link"]', '[role="tab"]',
        '[role="menuitem"]', '[role="option"]', '[role="checkbox"]',
        '[role="radio"]', '[role="combobox"]', '[role="searchbox"]',
        '[role="textbox"]',
        '[contenteditable="true"]',
        '[tabindex]'
    ].join(', ');

    const isVisible = (el) => {
        const rect = el.getBoundingClientRect();
        if (rect.width <= 1 || rect.height <= 1) return false;
        if (rect.bottom < 0 || rect.top > window.innerHeight) return false;
        const style = window.getComputedStyle(el);
        return style.visibility !== 'hidden' && style.display !== 'none'
            && style.opacity !== '0';
    };

    const cssEscape = (v) => (window.CSS && CSS.escape) ? CSS.escape(v) : v;

    const stableClass = (el) => {
        const cls = (el.getAttribute && el.getAttribute('class')) || '';
        const noise = new Set(['active', 'hover', 'focus', 'selected', 'open',
            'show', 'hide', 'col', 'row', 'first', 'last', 'odd', 'even',
            'clearfix', 'disabled']);
        for (const token of cls.split(/\s+/)) {
            if (!token || token.length < 3) continue;
            if (/^\d+$/.test(token)) continue;
            if (noise.has(token.toLowerCase())) continue;
            if (/\d{5,}/.test(token)) continue;
            if (/[0-9a-f]{8}/.test(token)) continue;
            return token;
        }
        return null;
    };

    const indexAmongSiblings = (el) => {
        let index = 1;
        let sibling = el.previousElementSibling;
        while (sibling) {
            if (sibling.tagName === el.tagName) index++;
            sibling = sibling.previousElementSibling;
        }
        return index;
    };

    const absoluteXPath = (el) => {
        const parts = [];
        let node = el;
        while (node && node.nodeType === 1 && node !== document.documentElement) {
            parts.unshift(node.tagName.toLowerCase() + '[' + indexAmongSiblings(node) + ']');
            node = node.parentElement;
        }
        return '/html/' + parts.join('/');
    };

    const relativePathFrom = (ancestor, el) => {
        const parts = [];
        let node = el;
        while (node && node !== ancestor) {
            parts.unshift(node.tagName.toLowerCase() + '[' + indexAmongSiblings(node) + ']');
            node = node.parentElement;
        }
        return parts.join('/');
    };

    const buildCandidates = (el) => {
        const out = [];
        const tag = el.tagName.toLowerCase();

        if (el.id && !/\d{5,}/.test(el.id)) {
            out.push({ xpath: `//*[@id='${el.id}']`, priority: 1,
                       strategy: 'id', confidence: 0.95 });
        }
        const testid = el.getAttribute('data-testid');
        if (testid) {
            out.push({ xpath: `//*[@data-testid='${testid}']`, priority: 2,
                       strategy: 'testid', confidence: 0.95 });
        }

        let ancestor = el.parentElement;
        while (ancestor && ancestor !== document.body) {
            if (ancestor.id && !/\d{5,}/.test(ancestor.id)) break;
            ancestor = ancestor.parentElement;
        }
        if (ancestor && ancestor.id) {
            out.push({
                xpath: `//*[@id='${ancestor.id}']/` + relativePathFrom(ancestor, el),
                priority: 3, strategy: 'id-relative', confidence: 0.85
            });
            const cls = stableClass(el);
            if (cls) {
                out.push({
                    xpath: `//*[@id='${ancestor.id}']//${tag}[contains(@class, '${cls}')]`,
                    priority: 4, strategy: 'id-class-relative', confidence: 0.7
                });
            }
        }

        const ownClass = stableClass(el);
        if (ownClass) {
            out.push({
                xpath: `//${tag}[contains(@class, '${ownClass}')]`,
                priority: 5, strategy: 'class-anchor', confidence: 0.6
            });
        }

        for (const attr of el.attributes) {
            if (attr.name.startsWith('data-') && attr.name !== 'data-som-id'
                && attr.name !== 'data-testid' && attr.value) {
                out.push({
                    xpath: `//${tag}[@${attr.name}='${attr.value}']`,
                    priority: 6, strategy: 'data-attr', confidence: 0.6
                });
                break;
            }
        }

        out.push({ xpath: absoluteXPath(el), priority: 7,
                   strategy: 'absolute', confidence: 0.4 });
        return out;
    };

    // Reset any previous scan
    const previous = document.getElementById(OVERLAY_ID);
    if (previous) previous.remove();
    document.querySelectorAll('[data-som-id]').forEach(el =>
        el.removeAttribute('data-som-id'));

    const container = document.createElement('div');
    container.id = OVERLAY_ID;
    container.style.cssText =
        'position: fixed; top: 0; left: 0; width: 100vw; height: 100vh;' +
        'pointer-events: none; z-index: 2147483647; overflow: hidden;';
    document.body.appendChild(container);

    window.__SOM__ = {
        clear: () => {
            const c = document.getElementById(OVERLAY_ID);
            if (c) c.remove();
            document.querySelectorAll('[data-som-id]').forEach(el =>
                el.removeAttribute('data-som-id'));
        },
        setVisibility: (visible) => {
            const c = document.getElementById(OVERLAY_ID);
            if (c) c.style.display = visible ? 'block' : 'none';
        }
    };

    const marks = [];
    let nextId = 1;
    const seen = new Set();
    for (const el of document.querySelectorAll(SELECTOR)) {
        if (seen.has(el) || !isVisible(el)) continue;
        seen.add(el);

        const markId = nextId++;
        el.setAttribute('data-som-id', String(markId));
        const rect = el.getBoundingClientRect();

        const box = document.createElement('div');
        box.style.cssText =
            `position: fixed; left: ${rect.x}px; top: ${rect.y}px;` +
            `width: ${rect.width}px; height: ${rect.height}px;` +
            'border: 2px solid #ff4400; box-sizing: border-box;' +
            'pointer-events: none;';
        const label = document.createElement('div');
        label.textContent = String(markId);
        const labelTop = rect.y >= 14 ? rect.y - 14 : rect.y + 2;
        label.style.cssText =
            `position: fixed; left: ${rect.x}px; top: ${labelTop}px;` +
            'font: bold 11px Arial; color: #fff; background: #ff4400;' +
            'padding: 0 3px; border-radius: 2px; pointer-events: none;' +
            'white-space: nowrap;';
        container.appendChild(box);
        container.appendChild(label);

        marks.push({
            mark_id: markId,
            tag: el.tagName.toLowerCase(),
            role: el.getAttribute('role'),
            text: ((el.innerText !== undefined ? el.innerText : el.textContent) || '')
                .trim().slice(0, 300),
            aria_label: el.getAttribute('aria-label'),
            placeholder: el.getAttribute('placeholder'),
            title: el.getAttribute('title'),
            value: el.value !== undefined && typeof el.value === 'string'
                ? el.value.slice(0, 100) : null,
            href: el.getAttribute('href'),
            input_type: el.getAttribute('type'),
            bbox: { x: rect.x, y: rect.y, width: rect.width, height: rect.height },
            center_normalized: [
                (rect.x + rect.width / 2) / window.innerWidth,
                (rect.y + rect.height / 2) / window.innerHeight
            ],
            xpath_candidates: buildCandidates(el),
            is_visible: true
        });
    }

    const doc = document.documentElement;
    const top = window.scrollY || doc.scrollTop || 0;
    const client = window.innerHeight || doc.clientHeight || 0;
    return {
        url: window.location.href,
        title: document.title,
        viewport_width: window.innerWidth,
        viewport_height: window.innerHeight,
        marks: marks,
        scroll_info: {
            scroll_top: top,
            scroll_height: doc.scrollHeight || 0,
            client_height: client,
            is_at_top: top <= 1,
            is_at_bottom: top + client >= (doc.scrollHeight || 0) - 1,
            can_scroll_up: top > 1,
            can_scroll_down: top + client < (doc.scrollHeight || 0) - 1
        },
        timestamp: Date.now()
    };
})()
"#;

/// Inject the scanner and parse the snapshot it returns
pub async fn inject_and_scan(page: &dyn PageHandle) -> SpiderResult<SoMSnapshot> {
    let value = page.evaluate(SOM_SCAN_JS).await?;
    serde_json::from_value(value)
        .map_err(|e| SpiderError::Browser(format!("snapshot parse: {e}")))
}

/// Screenshot the page (with the SoM overlay as drawn) and base64-encode it
pub async fn capture_screenshot_base64(page: &dyn PageHandle) -> SpiderResult<(Vec<u8>, String)> {
    let bytes = page.screenshot().await?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok((bytes, encoded))
}

/// An overlay box with a caller-chosen label, for disambiguation renders
#[derive(Debug, Clone)]
pub struct CustomMark {
    pub label: String,
    pub bbox: BoundingBox,
}

const CUSTOM_OVERLAY_ID: &str = "__som_custom_overlay_container__";

/// Screenshot with custom renumbered boxes, hiding the original overlay.
///
/// The original `data-som-id` bindings stay untouched so the eventual click
/// still resolves; only the visual layer is swapped for the duration of the
/// screenshot.
pub async fn capture_screenshot_with_custom_marks(
    page: &dyn PageHandle,
    marks: &[CustomMark],
) -> SpiderResult<(Vec<u8>, String)> {
    let payload = json!({
        "containerId": CUSTOM_OVERLAY_ID,
        "marks": marks.iter().map(|m| json!({
            "label": m.label,
            "bbox": {
                "x": m.bbox.x, "y": m.bbox.y,
                "width": m.bbox.width, "height": m.bbox.height,
            },
        })).collect::<Vec<_>>(),
    });

    let draw = format!(
        r#"
((payload) => {{
    const {{ containerId, marks }} = payload;
    const existing = document.getElementById(containerId);
    if (existing) existing.remove();
    if (window.__SOM__ && window.__SOM__.setVisibility) window.__SOM__.setVisibility(false);

    const container = document.createElement('div');
    container.id = containerId;
    container.style.cssText =
        'position: fixed; top: 0; left: 0; width: 100vw; height: 100vh;' +
        'pointer-events: none; z-index: 2147483647; overflow: hidden;';
    document.body.appendChild(container);

    for (const m of marks) {{
        const b = m.bbox;
        const box = document.createElement('div');
        box.style.cssText =
            `position: fixed; left: ${{b.x}}px; top: ${{b.y}}px;` +
            `width: ${{b.width}}px; height: ${{b.height}}px;` +
            'border: 2px solid #ff0000; background: rgba(255,0,0,0.1);' +
            'pointer-events: none; box-sizing: border-box;';
        const label = document.createElement('div');
        label.textContent = m.label;
        const top = b.y >= 16 ? b.y - 16 : b.y + 2;
        label.style.cssText =
            `position: fixed; left: ${{b.x}}px; top: ${{top}}px;` +
            'font: bold 11px Arial; color: #fff; background: #ff0000;' +
            'padding: 1px 4px; border-radius: 3px; pointer-events: none;' +
            'white-space: nowrap;';
        container.appendChild(box);
        container.appendChild(label);
    }}
    return true;
}})({payload})
"#
    );

    let clear = format!(
        r#"
(() => {{
    const existing = document.getElementById('{CUSTOM_OVERLAY_ID}');
    if (existing) existing.remove();
    if (window.__SOM__ && window.__SOM__.setVisibility) window.__SOM__.setVisibility(true);
    return true;
}})()
"#
    );

    page.evaluate(&draw).await?;
    let shot = capture_screenshot_base64(page).await;
    // Always restore the original overlay, even when the screenshot failed
    let _ = page.evaluate(&clear).await;
    shot
}

/// Remove the SoM overlay and the data-som-id tags
pub async fn clear_overlay(page: &dyn PageHandle) -> SpiderResult<()> {
    page.evaluate("window.__SOM__ && window.__SOM__.clear()").await?;
    Ok(())
}

/// Save a diagnostic screenshot under `{output_dir}/screenshots/`
pub async fn save_screenshot(
    page: &dyn PageHandle,
    output_dir: &std::path::Path,
    label: &str,
) -> SpiderResult<std::path::PathBuf> {
    let dir = output_dir.join("screenshots");
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| SpiderError::Checkpoint(format!("create {dir:?}: {e}")))?;

    let bytes = page.screenshot().await?;
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("{label}_{stamp}.png"));
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| SpiderError::Checkpoint(format!("write {path:?}: {e}")))?;
    Ok(path)
}

/// Map every mark to its ranked xpath list, with the data-som-id attribute
/// as the guaranteed fallback entry
#[must_use]
pub fn build_mark_id_to_xpath_map(
    snapshot: &SoMSnapshot,
) -> std::collections::HashMap<u64, Vec<String>> {
    snapshot
        .marks
        .iter()
        .map(|mark| {
            let mut xpaths: Vec<String> = mark
                .xpath_candidates
                .iter()
                .map(|c| c.xpath.clone())
                .collect();
            if xpaths.is_empty() {
                xpaths.push(format!("//*[@data-som-id=\"{}\"]", mark.mark_id));
            }
            (mark.mark_id, xpaths)
        })
        .collect()
}

/// Compact one-line-per-mark listing for LLM prompts
#[must_use]
pub fn format_marks_for_llm(snapshot: &SoMSnapshot, max_marks: usize) -> String {
    let mut lines = Vec::new();
    for mark in snapshot.marks.iter().take(max_marks) {
        let mut parts = vec![format!("[{}]", mark.mark_id), mark.tag.clone()];
        if let Some(role) = &mark.role {
            parts.push(format!("role={role}"));
        }
        if !mark.text.is_empty() {
            parts.push(format!("\"{}\"", truncate(&mark.text, 30)));
        }
        if let Some(label) = &mark.aria_label {
            parts.push(format!("aria-label={}", truncate(label, 20)));
        }
        if let Some(placeholder) = &mark.placeholder {
            parts.push(format!("placeholder={}", truncate(placeholder, 20)));
        }
        if let Some(href) = &mark.href {
            parts.push(format!("href={}", truncate(href, 30)));
        }
        if let Some(input_type) = &mark.input_type {
            parts.push(format!("type={input_type}"));
        }
        let (cx, cy) = mark.center_normalized;
        parts.push(format!("@({cx:.2},{cy:.2})"));
        lines.push(parts.join(" "));
    }
    if snapshot.marks.len() > max_marks {
        lines.push(format!("... and {} more elements", snapshot.marks.len() - max_marks));
    }
    lines.join("\n")
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::som::snapshot::{ElementMark, XPathCandidate, XPathStrategy};

    fn mark(id: u64, candidates: Vec<XPathCandidate>) -> ElementMark {
        ElementMark {
            mark_id: id,
            tag: "a".into(),
            role: None,
            text: format!("link {id}"),
            aria_label: None,
            placeholder: None,
            title: None,
            value: None,
            href: Some(format!("/detail/{id}")),
            input_type: None,
            bbox: BoundingBox::default(),
            center_normalized: (0.5, 0.5),
            xpath_candidates: candidates,
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

    #[test]
    fn test_mark_map_falls_back_to_som_attr() {
        let snap = snapshot(vec![mark(3, vec![])]);
        let map = build_mark_id_to_xpath_map(&snap);
        assert_eq!(map[&3], vec!["//*[@data-som-id=\"3\"]".to_string()]);
    }

    #[test]
    fn test_mark_map_keeps_candidate_order() {
        let snap = snapshot(vec![mark(
            1,
            vec![
                XPathCandidate {
                    xpath: "//*[@id='x']".into(),
                    priority: 1,
                    strategy: XPathStrategy::Id,
                    confidence: 0.95,
                },
                XPathCandidate {
                    xpath: "/html/body[1]/a[1]".into(),
                    priority: 7,
                    strategy: XPathStrategy::Absolute,
                    confidence: 0.4,
                },
            ],
        )]);
        let map = build_mark_id_to_xpath_map(&snap);
        assert_eq!(map[&1][0], "//*[@id='x']");
        assert_eq!(map[&1][1], "/html/body[1]/a[1]");
    }

    #[test]
    fn test_format_marks_truncates() {
        let marks: Vec<ElementMark> = (1..=5).map(|i| mark(i, vec![])).collect();
        let out = format_marks_for_llm(&snapshot(marks), 3);
        assert!(out.contains("[1] a"));
        assert!(out.contains("and 2 more elements"));
    }
}
