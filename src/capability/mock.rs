// Scripted in-memory page for engine tests: elements are seeded up
// front, operations are recorded, and missing elements surface as
// timeouts the way a real driver's auto-wait would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{BrowserPage, ElementState, PageError, PageFactory};

#[derive(Debug, Clone)]
pub struct MockElement {
    pub text: String,
    pub value: String,
    pub attributes: HashMap<String, String>,
    pub visible: bool,
    pub count: usize,
}

impl Default for MockElement {
    fn default() -> Self {
        Self {
            text: String::new(),
            value: String::new(),
            attributes: HashMap::new(),
            visible: true,
            count: 1,
        }
    }
}

impl MockElement {
    pub fn with_text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Self::default()
        }
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Default)]
pub struct MockState {
    pub url: String,
    pub title: String,
    pub elements: HashMap<String, MockElement>,
    pub actions: Vec<String>,
    pub opened: usize,
    pub closed: bool,
}

pub struct MockPageFactory {
    state: Arc<Mutex<MockState>>,
}

impl MockPageFactory {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn seed(&self, selector: &str, element: MockElement) {
        self.state
            .lock()
            .unwrap()
            .elements
            .insert(selector.to_string(), element);
    }

    pub fn set_title(&self, title: &str) {
        self.state.lock().unwrap().title = title.to_string();
    }

    pub fn handle(&self) -> Arc<Mutex<MockState>> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl PageFactory for MockPageFactory {
    async fn open(&self, _headless: bool) -> Result<Box<dyn BrowserPage>, PageError> {
        self.state.lock().unwrap().opened += 1;
        Ok(Box::new(MockPage {
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct MockPage {
    state: Arc<Mutex<MockState>>,
}

impl MockPage {
    fn record(&self, action: String) {
        self.state.lock().unwrap().actions.push(action);
    }

    fn with_element<T>(
        &self,
        selector: &str,
        condition: &str,
        timeout: Duration,
        f: impl FnOnce(&mut MockElement) -> T,
    ) -> Result<T, PageError> {
        let mut state = self.state.lock().unwrap();
        match state.elements.get_mut(selector) {
            Some(element) => Ok(f(element)),
            None => Err(PageError::timeout(selector, condition, timeout)),
        }
    }
}

#[async_trait]
impl BrowserPage for MockPage {
    async fn goto(&mut self, url: &str, _timeout: Duration) -> Result<(), PageError> {
        self.state.lock().unwrap().url = url.to_string();
        self.record(format!("goto {url}"));
        Ok(())
    }

    async fn title(&mut self) -> Result<String, PageError> {
        Ok(self.state.lock().unwrap().title.clone())
    }

    async fn current_url(&mut self) -> Result<String, PageError> {
        Ok(self.state.lock().unwrap().url.clone())
    }

    async fn wait_for_url(&mut self, pattern: &str, timeout: Duration) -> Result<(), PageError> {
        let url = self.state.lock().unwrap().url.clone();
        if url.contains(pattern) {
            Ok(())
        } else {
            Err(PageError::timeout(pattern, "url match", timeout))
        }
    }

    async fn wait_for_timeout(&mut self, duration: Duration) {
        tokio::time::sleep(duration.min(Duration::from_millis(5))).await;
    }

    async fn press(&mut self, key: &str, _timeout: Duration) -> Result<(), PageError> {
        self.record(format!("press {key}"));
        Ok(())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, PageError> {
        Ok(vec![0u8; 8])
    }

    async fn close(&mut self) -> Result<(), PageError> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }

    async fn click(&mut self, selector: &str, timeout: Duration) -> Result<(), PageError> {
        self.with_element(selector, "element attached", timeout, |_| ())?;
        self.record(format!("click {selector}"));
        Ok(())
    }

    async fn fill(
        &mut self,
        selector: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<(), PageError> {
        self.with_element(selector, "element attached", timeout, |element| {
            element.value = value.to_string();
        })?;
        self.record(format!("fill {selector}={value}"));
        Ok(())
    }

    async fn type_text(
        &mut self,
        selector: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<(), PageError> {
        self.with_element(selector, "element attached", timeout, |element| {
            element.value.push_str(value);
        })?;
        self.record(format!("type {selector}={value}"));
        Ok(())
    }

    async fn set_checked(
        &mut self,
        selector: &str,
        checked: bool,
        timeout: Duration,
    ) -> Result<(), PageError> {
        self.with_element(selector, "element attached", timeout, |element| {
            element.value = checked.to_string();
        })?;
        self.record(format!("set_checked {selector}={checked}"));
        Ok(())
    }

    async fn hover(&mut self, selector: &str, timeout: Duration) -> Result<(), PageError> {
        self.with_element(selector, "element attached", timeout, |_| ())?;
        self.record(format!("hover {selector}"));
        Ok(())
    }

    async fn focus(&mut self, selector: &str, timeout: Duration) -> Result<(), PageError> {
        self.with_element(selector, "element attached", timeout, |_| ())?;
        self.record(format!("focus {selector}"));
        Ok(())
    }

    async fn drag_to(
        &mut self,
        source: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<(), PageError> {
        self.with_element(source, "element attached", timeout, |_| ())?;
        self.record(format!("drag {source} -> {target}"));
        Ok(())
    }

    async fn scroll_into_view(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), PageError> {
        self.with_element(selector, "element attached", timeout, |_| ())?;
        self.record(format!("scroll {selector}"));
        Ok(())
    }

    async fn select_option(
        &mut self,
        selector: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<(), PageError> {
        self.with_element(selector, "element attached", timeout, |element| {
            element.value = value.to_string();
        })?;
        self.record(format!("select {selector}={value}"));
        Ok(())
    }

    async fn wait_for(
        &mut self,
        selector: &str,
        state: ElementState,
        timeout: Duration,
    ) -> Result<(), PageError> {
        let visible = {
            let guard = self.state.lock().unwrap();
            guard.elements.get(selector).map(|e| e.visible)
        };
        let satisfied = match state {
            ElementState::Attached => visible.is_some(),
            ElementState::Visible => visible == Some(true),
            ElementState::Hidden => visible != Some(true),
        };
        if satisfied {
            Ok(())
        } else {
            Err(PageError::timeout(selector, &format!("state {state}"), timeout))
        }
    }

    async fn text_content(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<String, PageError> {
        self.with_element(selector, "element attached", timeout, |element| {
            element.text.clone()
        })
    }

    async fn get_attribute(
        &mut self,
        selector: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<String>, PageError> {
        self.with_element(selector, "element attached", timeout, |element| {
            element.attributes.get(name).cloned()
        })
    }

    async fn input_value(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<String, PageError> {
        self.with_element(selector, "element attached", timeout, |element| {
            element.value.clone()
        })
    }

    async fn element_count(&mut self, selector: &str) -> Result<usize, PageError> {
        let state = self.state.lock().unwrap();
        Ok(state.elements.get(selector).map(|e| e.count).unwrap_or(0))
    }
}
