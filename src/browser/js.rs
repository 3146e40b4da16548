//! JavaScript evaluated inside the page
//!
//! All DOM queries and interactions run as self-contained IIFE expressions:
//! a payload object is serialized into the expression, the script resolves
//! the selector (xpath or css), applies one operation, and returns JSON.

use serde_json::Value;

/// Core selector-operation script. Receives `{kind, selector, op, nth, arg,
/// limit}` and returns an op-specific JSON value.
const QUERY_CORE: &str = r#"
((payload) => {
    const { kind, selector, op, nth, arg, limit } = payload;

    const resolve = () => {
        try {
            if (kind === 'css') {
                return Array.from(document.querySelectorAll(selector));
            }
            const result = document.evaluate(
                selector, document, null,
                XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null
            );
            const nodes = [];
            for (let i = 0; i < result.snapshotLength; i++) {
                nodes.push(result.snapshotItem(i));
            }
            return nodes;
        } catch (e) {
            return [];
        }
    };

    const isVisible = (el) => {
        if (!el || !el.getBoundingClientRect) return false;
        const rect = el.getBoundingClientRect();
        if (rect.width <= 0 || rect.height <= 0) return false;
        const style = window.getComputedStyle(el);
        return style.visibility !== 'hidden' && style.display !== 'none';
    };

    const nodes = resolve();
    const pick = () => nodes[nth || 0];

    switch (op) {
        case 'count':
            return nodes.length;
        case 'visible': {
            const el = pick();
            return el ? isVisible(el) : false;
        }
        case 'text': {
            const el = pick();
            if (!el) return null;
            return (el.innerText !== undefined ? el.innerText : el.textContent) || '';
        }
        case 'texts':
            return nodes.slice(0, limit || nodes.length).map(el =>
                ((el.innerText !== undefined ? el.innerText : el.textContent) || '').trim()
            );
        case 'attr': {
            const el = pick();
            return el && el.getAttribute ? el.getAttribute(arg) : null;
        }
        case 'attrs':
            return nodes.slice(0, limit || nodes.length).map(el =>
                el.getAttribute ? el.getAttribute(arg) : null
            );
        case 'tag': {
            const el = pick();
            return el ? el.tagName.toLowerCase() : null;
        }
        case 'click': {
            const el = pick();
            if (!el || !isVisible(el)) return false;
            el.scrollIntoView({ block: 'center', inline: 'nearest' });
            el.click();
            return true;
        }
        case 'fill': {
            const el = pick();
            if (!el) return false;
            el.focus();
            const proto = el.tagName === 'TEXTAREA'
                ? HTMLTextAreaElement.prototype
                : HTMLInputElement.prototype;
            const setter = Object.getOwnPropertyDescriptor(proto, 'value');
            if (setter && setter.set) {
                setter.set.call(el, arg);
            } else {
                el.value = arg;
            }
            el.dispatchEvent(new Event('input', { bubbles: true }));
            el.dispatchEvent(new Event('change', { bubbles: true }));
            return true;
        }
        default:
            return null;
    }
})(__PAYLOAD__)
"#;

/// Build the query expression for a payload
#[must_use]
pub fn query_script(payload: &Value) -> String {
    QUERY_CORE.replace("__PAYLOAD__", &payload.to_string())
}

/// Dispatch a key press to the focused element. For Enter inside a form the
/// form is submitted as well, matching what a trusted keypress would do.
#[must_use]
pub fn press_key_script(key_json: &str) -> String {
    format!(
        r#"
((key) => {{
    const el = document.activeElement || document.body;
    const opts = {{ key, bubbles: true, cancelable: true }};
    el.dispatchEvent(new KeyboardEvent('keydown', opts));
    el.dispatchEvent(new KeyboardEvent('keyup', opts));
    if (key === 'Enter' && el.form && el.form.requestSubmit) {{
        el.form.requestSubmit();
    }}
    return true;
}})({key_json})
"#
    )
}

/// Scroll state of the document, used by snapshots and the explore loop
pub const SCROLL_INFO_SCRIPT: &str = r"
(() => {
    const doc = document.documentElement;
    const top = window.scrollY || doc.scrollTop || 0;
    const height = doc.scrollHeight || 0;
    const client = window.innerHeight || doc.clientHeight || 0;
    return {
        scroll_top: top,
        scroll_height: height,
        client_height: client,
        is_at_top: top <= 1,
        is_at_bottom: top + client >= height - 1,
        can_scroll_up: top > 1,
        can_scroll_down: top + client < height - 1
    };
})()
";
