#![allow(dead_code)]

//! Scripted browser and LLM fakes shared by the integration tests
//!
//! The fake page interprets the query payloads the selector layer embeds in
//! its evaluation scripts, serving answers from an in-memory element table.
//! The fake LLM replays a queue of canned replies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use somspider::browser::{BrowserHandle, PageHandle, SharedPage};
use somspider::error::{SpiderError, SpiderResult};
use somspider::llm::LlmClient;

/// One scripted DOM element, addressed by the selectors that should hit it
#[derive(Debug, Clone, Default)]
pub struct FakeElement {
    pub selectors: Vec<String>,
    pub text: String,
    pub tag: String,
    pub attrs: HashMap<String, String>,
    pub visible: bool,
}

impl FakeElement {
    pub fn new(selector: &str, tag: &str, text: &str) -> Self {
        Self {
            selectors: vec![selector.to_string()],
            text: text.to_string(),
            tag: tag.to_string(),
            attrs: HashMap::new(),
            visible: true,
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Default)]
struct FakePageState {
    url: String,
    elements: Vec<FakeElement>,
    closed: bool,
    visited: Vec<String>,
    /// Remaining page states entered by clicking the flow selector
    flow: Vec<(String, Vec<FakeElement>)>,
    flow_selector: Option<String>,
}

/// A page whose DOM is a scripted element table
pub struct FakePage {
    id: String,
    state: Mutex<FakePageState>,
}

impl FakePage {
    pub fn new(id: &str, url: &str, elements: Vec<FakeElement>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            state: Mutex::new(FakePageState {
                url: url.to_string(),
                elements,
                closed: false,
                visited: vec![url.to_string()],
                flow: Vec::new(),
                flow_selector: None,
            }),
        })
    }

    pub fn set_elements(&self, elements: Vec<FakeElement>) {
        self.state.lock().expect("state").elements = elements;
    }

    /// Script a pagination flow: clicking `selector` swaps in the next
    /// (url, elements) state
    pub fn set_flow(&self, selector: &str, states: Vec<(String, Vec<FakeElement>)>) {
        let mut state = self.state.lock().expect("state");
        state.flow_selector = Some(selector.to_string());
        state.flow = states;
    }

    pub fn visited_urls(&self) -> Vec<String> {
        self.state.lock().expect("state").visited.clone()
    }

    fn matching(&self, selector: &str) -> Vec<FakeElement> {
        let state = self.state.lock().expect("state");
        state
            .elements
            .iter()
            .filter(|el| el.selectors.iter().any(|s| s == selector))
            .cloned()
            .collect()
    }

    /// Pull the payload object back out of a query script
    fn parse_payload(js: &str) -> Option<Value> {
        let tail = js.rfind("})(").map(|pos| &js[pos + 3..])?;
        let end = tail.rfind(')')?;
        serde_json::from_str(tail[..end].trim()).ok()
    }

    fn answer_query(&self, payload: &Value) -> Value {
        let selector = payload["selector"].as_str().unwrap_or_default();
        let op = payload["op"].as_str().unwrap_or_default();
        let nth = payload["nth"].as_u64().unwrap_or(0) as usize;
        let matches = self.matching(selector);

        match op {
            "count" => json!(matches.len()),
            "visible" => json!(matches.get(nth).map(|el| el.visible).unwrap_or(false)),
            "text" => matches
                .get(nth)
                .map(|el| json!(el.text))
                .unwrap_or(Value::Null),
            "texts" => {
                let limit = payload["limit"].as_u64().unwrap_or(u64::MAX) as usize;
                json!(matches
                    .iter()
                    .take(limit)
                    .map(|el| el.text.clone())
                    .collect::<Vec<_>>())
            }
            "attr" => {
                let name = payload["arg"].as_str().unwrap_or_default();
                matches
                    .get(nth)
                    .and_then(|el| el.attrs.get(name))
                    .map(|v| json!(v))
                    .unwrap_or(Value::Null)
            }
            "attrs" => {
                let name = payload["arg"].as_str().unwrap_or_default();
                let limit = payload["limit"].as_u64().unwrap_or(u64::MAX) as usize;
                json!(matches
                    .iter()
                    .take(limit)
                    .map(|el| el.attrs.get(name).cloned())
                    .collect::<Vec<_>>())
            }
            "tag" => matches
                .get(nth)
                .map(|el| json!(el.tag))
                .unwrap_or(Value::Null),
            "click" => {
                let clickable = matches.get(nth).map(|el| el.visible).unwrap_or(false);
                if clickable {
                    let mut state = self.state.lock().expect("state");
                    let advances = state
                        .flow_selector
                        .as_deref()
                        .map(|s| s == selector)
                        .unwrap_or(false);
                    if advances && !state.flow.is_empty() {
                        let (url, elements) = state.flow.remove(0);
                        state.visited.push(url.clone());
                        state.url = url;
                        state.elements = elements;
                    }
                }
                json!(clickable)
            }
            "fill" => json!(matches.get(nth).is_some()),
            _ => Value::Null,
        }
    }
}

#[async_trait]
impl PageHandle for FakePage {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn goto(&self, url: &str, _timeout: Duration) -> SpiderResult<()> {
        let mut state = self.state.lock().expect("state");
        state.url = url.to_string();
        state.visited.push(url.to_string());
        Ok(())
    }

    async fn current_url(&self) -> SpiderResult<String> {
        Ok(self.state.lock().expect("state").url.clone())
    }

    async fn evaluate(&self, js: &str) -> SpiderResult<Value> {
        if let Some(payload) = Self::parse_payload(js) {
            if payload.get("op").is_some() {
                return Ok(self.answer_query(&payload));
            }
        }
        // Overlay drawing, key presses, scrolls: acknowledged, not modelled
        Ok(Value::Bool(true))
    }

    async fn screenshot(&self) -> SpiderResult<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn go_back(&self, _timeout: Duration) -> SpiderResult<()> {
        let mut state = self.state.lock().expect("state");
        if state.visited.len() > 1 {
            state.visited.pop();
            state.url = state.visited.last().cloned().unwrap_or_default();
        }
        Ok(())
    }

    async fn close(&self) -> SpiderResult<()> {
        self.state.lock().expect("state").closed = true;
        Ok(())
    }

    async fn is_closed(&self) -> bool {
        self.state.lock().expect("state").closed
    }
}

/// A browser whose page list is fixed up front; new pages are seeded from a
/// template DOM so workers see the same scripted site
pub struct FakeBrowser {
    pages: Mutex<Vec<SharedPage>>,
    new_page_elements: Vec<FakeElement>,
    next_id: AtomicUsize,
}

impl FakeBrowser {
    pub fn new(pages: Vec<SharedPage>) -> Self {
        Self {
            pages: Mutex::new(pages),
            new_page_elements: Vec::new(),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Every page opened later starts with these elements
    pub fn with_template(elements: Vec<FakeElement>) -> Self {
        Self {
            pages: Mutex::new(Vec::new()),
            new_page_elements: elements,
            next_id: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BrowserHandle for FakeBrowser {
    async fn new_page(&self) -> SpiderResult<SharedPage> {
        let index = self.next_id.fetch_add(1, Ordering::SeqCst);
        let page = FakePage::new(
            &format!("fresh-{index}"),
            "about:blank",
            self.new_page_elements.clone(),
        );
        self.pages.lock().expect("pages").push(page.clone());
        Ok(page)
    }

    async fn pages(&self) -> SpiderResult<Vec<SharedPage>> {
        Ok(self.pages.lock().expect("pages").clone())
    }
}

/// LLM replaying canned replies in order; repeats the last one when drained
pub struct FakeLlm {
    replies: Vec<String>,
    cursor: AtomicUsize,
    pub calls: Mutex<Vec<String>>,
}

impl FakeLlm {
    pub fn new(replies: Vec<&str>) -> Self {
        Self {
            replies: replies.into_iter().map(str::to_string).collect(),
            cursor: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    async fn chat(
        &self,
        _system: &str,
        user: &str,
        _images_base64: &[String],
    ) -> Result<String, SpiderError> {
        self.calls.lock().expect("calls").push(user.to_string());
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.replies
            .get(index.min(self.replies.len().saturating_sub(1)))
            .cloned()
            .ok_or_else(|| SpiderError::Llm("no canned reply".into()))
    }
}
