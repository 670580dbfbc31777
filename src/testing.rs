//! Scripted stand-ins for the browser and the model, used by unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::driver::{Driver, Element, Locator};
use crate::model::QuizError;
use crate::reasoning::{CompletionRequest, Reasoner};

pub const PNG_STUB: &[u8] = &[0x89, b'P', b'N', b'G'];

#[derive(Clone, Debug)]
pub struct FakeElement {
    pub text: String,
    pub visible: bool,
    pub width: f64,
    pub height: f64,
    pub functional_selector: Option<String>,
    /// Clicks only land once this many parent hops have been taken.
    pub clickable_from: u8,
}

impl FakeElement {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            visible: true,
            width: 200.0,
            height: 50.0,
            functional_selector: None,
            clickable_from: 0,
        }
    }

    pub fn button(functional: &str) -> Self {
        let mut el = Self::text("");
        el.functional_selector = Some(functional.to_string());
        el
    }

    pub fn image(width: f64, height: f64) -> Self {
        let mut el = Self::text("");
        el.width = width;
        el.height = height;
        el
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn clickable_from(mut self, depth: u8) -> Self {
        self.clickable_from = depth;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct Screen {
    pub url: String,
    pub text: String,
    pub elements: HashMap<String, Vec<FakeElement>>,
    /// Number of `current_url` reads served before the next read moves on; 0 keeps the screen.
    pub reads: usize,
    /// Move on after a click on this selector; `"*"` matches any click.
    pub advance_on_click: Option<String>,
}

impl Screen {
    pub fn new(url: &str) -> Self {
        Self { url: url.to_string(), ..Default::default() }
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn with(mut self, selector: &str, elements: Vec<FakeElement>) -> Self {
        self.elements.insert(selector.to_string(), elements);
        self
    }

    pub fn reads(mut self, n: usize) -> Self {
        self.reads = n;
        self
    }

    pub fn until_click(mut self, selector: &str) -> Self {
        self.advance_on_click = Some(selector.to_string());
        self
    }
}

#[derive(Default)]
struct State {
    screen: Screen,
    queue: VecDeque<Screen>,
    reads_on_screen: usize,
    clicks: Vec<Element>,
    typed: Vec<(String, String)>,
    entered: Vec<String>,
    visits: Vec<String>,
    queried: Vec<String>,
    failures: HashMap<String, QuizError>,
    screenshots: usize,
}

impl State {
    fn advance(&mut self) {
        if let Some(next) = self.queue.pop_front() {
            self.screen = next;
            self.reads_on_screen = 0;
        }
    }

    fn find(&self, el: &Element) -> Option<FakeElement> {
        self.screen
            .elements
            .get(el.locator.as_str())
            .and_then(|els| els.get(el.index))
            .cloned()
    }
}

pub struct FakeDriver {
    state: Mutex<State>,
}

impl FakeDriver {
    pub fn new(url: &str) -> Self {
        Self::scripted(vec![Screen::new(url)])
    }

    pub fn scripted(screens: Vec<Screen>) -> Self {
        let mut queue: VecDeque<Screen> = screens.into();
        let screen = queue.pop_front().unwrap_or_default();
        Self { state: Mutex::new(State { screen, queue, ..Default::default() }) }
    }

    pub fn put(&self, selector: &str, elements: Vec<FakeElement>) {
        self.state.lock().unwrap().screen.elements.insert(selector.to_string(), elements);
    }

    pub fn set_url(&self, url: &str) {
        self.state.lock().unwrap().screen.url = url.to_string();
    }

    pub fn set_text(&self, text: &str) {
        self.state.lock().unwrap().screen.text = text.to_string();
    }

    pub fn fail_on(&self, selector: &str, err: QuizError) {
        self.state.lock().unwrap().failures.insert(selector.to_string(), err);
    }

    pub fn clicks(&self) -> Vec<Element> {
        self.state.lock().unwrap().clicks.clone()
    }

    pub fn clicked_selectors(&self) -> Vec<String> {
        self.clicks().iter().map(|e| e.locator.as_str().to_string()).collect()
    }

    pub fn typed(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().typed.clone()
    }

    pub fn entered(&self) -> Vec<String> {
        self.state.lock().unwrap().entered.clone()
    }

    pub fn visits(&self) -> Vec<String> {
        self.state.lock().unwrap().visits.clone()
    }

    pub fn queried(&self) -> Vec<String> {
        self.state.lock().unwrap().queried.clone()
    }

    pub fn screenshots(&self) -> usize {
        self.state.lock().unwrap().screenshots
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn locate_all(&self, locator: &Locator) -> Result<Vec<Element>, QuizError> {
        let mut st = self.state.lock().unwrap();
        let key = locator.as_str().to_string();
        st.queried.push(key.clone());
        if let Some(err) = st.failures.get(&key) {
            return Err(err.clone());
        }
        let els = st.screen.elements.get(&key).cloned().unwrap_or_default();
        Ok(els
            .into_iter()
            .enumerate()
            .map(|(i, fe)| Element {
                locator: locator.clone(),
                index: i,
                depth: 0,
                text: fe.text,
                visible: fe.visible,
                width: fe.width,
                height: fe.height,
                functional_selector: fe.functional_selector,
            })
            .collect())
    }

    async fn current_url(&self) -> Result<String, QuizError> {
        let mut st = self.state.lock().unwrap();
        if let Some(err) = st.failures.get("url") {
            return Err(err.clone());
        }
        if st.screen.reads > 0 && st.reads_on_screen >= st.screen.reads {
            st.advance();
        }
        st.reads_on_screen += 1;
        Ok(st.screen.url.clone())
    }

    async fn page_text(&self) -> Result<String, QuizError> {
        let st = self.state.lock().unwrap();
        if let Some(err) = st.failures.get("text") {
            return Err(err.clone());
        }
        Ok(st.screen.text.clone())
    }

    async fn click(&self, element: &Element) -> Result<(), QuizError> {
        let mut st = self.state.lock().unwrap();
        let fe = st
            .find(element)
            .ok_or_else(|| QuizError::Driver(format!("stale element {}", element.locator.as_str())))?;
        if !fe.visible || element.depth < fe.clickable_from {
            return Err(QuizError::Driver("element not interactable".into()));
        }
        st.clicks.push(element.clone());
        let advance = match st.screen.advance_on_click.as_deref() {
            Some("*") => true,
            Some(sel) => sel == element.locator.as_str(),
            None => false,
        };
        if advance {
            st.advance();
        }
        Ok(())
    }

    async fn parent(&self, element: &Element) -> Result<Option<Element>, QuizError> {
        let st = self.state.lock().unwrap();
        if st.find(element).is_none() || element.depth >= 10 {
            return Ok(None);
        }
        let mut up = element.clone();
        up.depth += 1;
        Ok(Some(up))
    }

    async fn type_text(&self, element: &Element, text: &str) -> Result<(), QuizError> {
        let mut st = self.state.lock().unwrap();
        st.typed.push((element.locator.as_str().to_string(), text.to_string()));
        Ok(())
    }

    async fn press_enter(&self, element: &Element) -> Result<(), QuizError> {
        let mut st = self.state.lock().unwrap();
        st.entered.push(element.locator.as_str().to_string());
        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<(), QuizError> {
        let mut st = self.state.lock().unwrap();
        st.visits.push(url.to_string());
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, QuizError> {
        let mut st = self.state.lock().unwrap();
        st.screenshots += 1;
        Ok(PNG_STUB.to_vec())
    }
}

type Reply = Box<dyn Fn(&CompletionRequest) -> Result<String, QuizError> + Send + Sync>;

pub struct FakeReasoner {
    reply: Reply,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl FakeReasoner {
    pub fn new(reply: impl Fn(&CompletionRequest) -> Result<String, QuizError> + Send + Sync + 'static) -> Self {
        Self { reply: Box::new(reply), calls: Mutex::new(Vec::new()) }
    }

    pub fn always(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_| Ok(text.clone()))
    }

    pub fn failing() -> Self {
        Self::new(|_| Err(QuizError::Reasoner("offline".into())))
    }

    /// Answers classification prompts with `label` and answer prompts with `answer_json`.
    pub fn scripted(label: &str, answer_json: &str) -> Self {
        let label = label.to_string();
        let answer = answer_json.to_string();
        Self::new(move |req| {
            if req.schema.is_some() {
                Ok(answer.clone())
            } else {
                Ok(label.clone())
            }
        })
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Reasoner for FakeReasoner {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, QuizError> {
        self.calls.lock().unwrap().push(request.clone());
        (self.reply)(request)
    }
}
