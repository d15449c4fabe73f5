//! In-memory page for exercising the engine without a browser.
//!
//! [`FakePage`] implements [`PageEngine`] over an arena DOM parsed from an
//! HTML snippet. Tests script the page's behaviour with reactions
//! ("when `.save-btn button` is clicked, remove the sidebar") and inspect
//! what the engine did through the per-element event log.

mod css;

pub use css::SelectorList;
pub use dom::{FakeDom, NodeId};

use crate::element::{ComputedColors, DomEvent, ElementImpl};
use crate::platforms::{MutationWatch, PageEngine};
use crate::{AutomationError, Element};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

type Action = Arc<dyn Fn(&mut FakeDom) + Send + Sync>;

struct Reaction {
    selector: SelectorList,
    event: DomEvent,
    delay: Option<Duration>,
    action: Action,
}

struct Observer {
    root: Option<NodeId>,
    tx: mpsc::UnboundedSender<()>,
}

#[derive(Default)]
struct Shared {
    dom: Mutex<FakeDom>,
    reactions: Mutex<Vec<Reaction>>,
    observers: Mutex<HashMap<u64, Observer>>,
    next_observer: AtomicU64,
    events: Mutex<Vec<(NodeId, DomEvent)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A scriptable in-memory page
#[derive(Clone, Default)]
pub struct FakePage {
    shared: Arc<Shared>,
}

impl FakePage {
    /// Builds a page from `html`. Panics on markup the parser rejects.
    pub fn new(html: &str) -> Self {
        let dom = FakeDom::parse(html).unwrap_or_else(|e| panic!("bad test HTML: {e}"));
        Self {
            shared: Arc::new(Shared {
                dom: Mutex::new(dom),
                ..Default::default()
            }),
        }
    }

    pub fn engine(&self) -> Arc<dyn PageEngine> {
        Arc::new(self.clone())
    }

    fn parse_selector(selector: &str) -> SelectorList {
        selector
            .parse()
            .unwrap_or_else(|e| panic!("bad test selector {selector:?}: {e}"))
    }

    /// Runs `action` whenever `event` reaches an element matching `selector`
    /// (on the element itself or bubbling from a descendant).
    pub fn on(
        &self,
        selector: &str,
        event: DomEvent,
        action: impl Fn(&mut FakeDom) + Send + Sync + 'static,
    ) -> &Self {
        self.register(selector, event, None, Arc::new(action))
    }

    pub fn on_click(
        &self,
        selector: &str,
        action: impl Fn(&mut FakeDom) + Send + Sync + 'static,
    ) -> &Self {
        self.on(selector, DomEvent::Click, action)
    }

    /// Like [`FakePage::on_click`], but the page reacts after `delay`.
    pub fn on_click_after(
        &self,
        selector: &str,
        delay: Duration,
        action: impl Fn(&mut FakeDom) + Send + Sync + 'static,
    ) -> &Self {
        self.register(selector, DomEvent::Click, Some(delay), Arc::new(action))
    }

    fn register(
        &self,
        selector: &str,
        event: DomEvent,
        delay: Option<Duration>,
        action: Action,
    ) -> &Self {
        lock(&self.shared.reactions).push(Reaction {
            selector: Self::parse_selector(selector),
            event,
            delay,
            action,
        });
        self
    }

    /// Applies `f` to the document and notifies observers of what changed.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut FakeDom) -> R) -> R {
        let (result, dirty) = {
            let mut dom = lock(&self.shared.dom);
            let result = f(&mut dom);
            (result, dom.take_dirty())
        };
        self.notify(&dirty);
        result
    }

    /// Applies `f` after `delay` on the runtime's clock.
    pub fn mutate_later(&self, delay: Duration, f: impl FnOnce(&mut FakeDom) + Send + 'static) {
        let page = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            page.mutate(f);
        });
    }

    /// Read-only access to the document.
    pub fn read<R>(&self, f: impl FnOnce(&FakeDom) -> R) -> R {
        f(&lock(&self.shared.dom))
    }

    /// Events dispatched on the first element matching `selector`.
    pub fn events(&self, selector: &str) -> Vec<DomEvent> {
        let Some(node) = self.read(|dom| dom.query_one(selector)) else {
            return Vec::new();
        };
        lock(&self.shared.events)
            .iter()
            .filter(|(id, _)| *id == node)
            .map(|(_, event)| *event)
            .collect()
    }

    /// Every dispatched event, in order.
    pub fn event_log(&self) -> Vec<(NodeId, DomEvent)> {
        lock(&self.shared.events).clone()
    }

    /// Current `value` of the first element matching `selector`.
    pub fn value(&self, selector: &str) -> Option<String> {
        self.read(|dom| dom.query_one(selector).map(|n| dom.value(n)))
    }

    pub fn values(&self, selector: &str) -> Vec<String> {
        self.read(|dom| dom.query(selector).into_iter().map(|n| dom.value(n)).collect())
    }

    pub fn count(&self, selector: &str) -> usize {
        self.read(|dom| dom.query(selector).len())
    }

    /// Live mutation observers.
    pub fn observer_count(&self) -> usize {
        lock(&self.shared.observers).len()
    }

    fn notify(&self, dirty: &[NodeId]) {
        if dirty.is_empty() {
            return;
        }
        let dom = lock(&self.shared.dom);
        let observers = lock(&self.shared.observers);
        for observer in observers.values() {
            let affected = match observer.root {
                None => true,
                Some(root) => dirty.iter().any(|n| dom.contains(root, *n)),
            };
            if affected {
                let _ = observer.tx.send(());
            }
        }
    }

    fn element(&self, node: NodeId) -> Element {
        Element::new(Box::new(FakeElement {
            page: self.clone(),
            node,
        }))
    }

    fn dispatch(&self, target: NodeId, event: DomEvent) {
        lock(&self.shared.events).push((target, event));

        let matched: Vec<(Option<Duration>, Action)> = {
            let dom = lock(&self.shared.dom);
            let reactions = lock(&self.shared.reactions);
            reactions
                .iter()
                .filter(|r| r.event == event)
                .filter(|r| {
                    let mut current = Some(target);
                    while let Some(id) = current {
                        if r.selector.matches(&dom, id) {
                            return true;
                        }
                        current = dom.parent_element(id);
                    }
                    false
                })
                .map(|r| (r.delay, r.action.clone()))
                .collect()
        };

        for (delay, action) in matched {
            match delay {
                None => self.mutate(|dom| action(dom)),
                Some(delay) => self.mutate_later(delay, move |dom| action(dom)),
            }
        }
    }
}

#[async_trait]
impl PageEngine for FakePage {
    async fn query_selector_all(&self, selector: &str) -> Result<Vec<Element>, AutomationError> {
        let parsed: SelectorList = selector.parse()?;
        let nodes = self.read(|dom| dom.select(dom.document(), &parsed));
        Ok(nodes.into_iter().map(|n| self.element(n)).collect())
    }

    async fn observe_mutations(
        &self,
        root: Option<&Element>,
    ) -> Result<MutationWatch, AutomationError> {
        let root = match root {
            Some(element) => Some(node_of(element)?),
            None => None,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_observer.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.observers).insert(id, Observer { root, tx });

        let shared = self.shared.clone();
        Ok(MutationWatch::new(rx, move || {
            lock(&shared.observers).remove(&id);
        }))
    }
}

fn node_of(element: &Element) -> Result<NodeId, AutomationError> {
    element
        .inner()
        .as_any()
        .downcast_ref::<FakeElement>()
        .map(|e| e.node)
        .ok_or_else(|| {
            AutomationError::InvalidArgument("element does not belong to a FakePage".to_string())
        })
}

#[derive(Clone)]
struct FakeElement {
    page: FakePage,
    node: NodeId,
}

impl std::fmt::Debug for FakeElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeElement")
            .field("node", &self.node.index())
            .finish()
    }
}

impl FakeElement {
    fn read<R>(&self, f: impl FnOnce(&FakeDom, NodeId) -> R) -> R {
        self.page.read(|dom| f(dom, self.node))
    }
}

#[async_trait]
impl ElementImpl for FakeElement {
    fn object_id(&self) -> String {
        format!("fake-{}", self.node.index())
    }

    async fn tag_name(&self) -> Result<String, AutomationError> {
        Ok(self.read(|dom, n| dom.tag_name(n).unwrap_or_default().to_string()))
    }

    async fn attribute(&self, name: &str) -> Result<Option<String>, AutomationError> {
        Ok(self.read(|dom, n| dom.attribute(n, name).map(str::to_string)))
    }

    async fn text_content(&self) -> Result<String, AutomationError> {
        Ok(self.read(|dom, n| dom.text_content(n)))
    }

    async fn query_selector_all(&self, selector: &str) -> Result<Vec<Element>, AutomationError> {
        let parsed: SelectorList = selector.parse()?;
        let nodes = self.read(|dom, n| dom.select(n, &parsed));
        Ok(nodes.into_iter().map(|n| self.page.element(n)).collect())
    }

    async fn closest(&self, selector: &str) -> Result<Option<Element>, AutomationError> {
        let parsed: SelectorList = selector.parse()?;
        let found = self.read(|dom, n| dom.closest(n, &parsed));
        Ok(found.map(|n| self.page.element(n)))
    }

    async fn parent(&self) -> Result<Option<Element>, AutomationError> {
        let found = self.read(|dom, n| dom.parent_element(n));
        Ok(found.map(|n| self.page.element(n)))
    }

    async fn has_layout(&self) -> Result<bool, AutomationError> {
        Ok(self.read(|dom, n| dom.has_layout(n)))
    }

    async fn computed_colors(&self) -> Result<ComputedColors, AutomationError> {
        Ok(self.read(|dom, n| ComputedColors {
            color: dom
                .computed_style(n, "color", true)
                .unwrap_or_else(|| "rgb(0, 0, 0)".to_string()),
            background_color: dom
                .computed_style(n, "background-color", false)
                .unwrap_or_else(|| "rgba(0, 0, 0, 0)".to_string()),
            fill: dom
                .computed_style(n, "fill", true)
                .unwrap_or_else(|| "rgb(0, 0, 0)".to_string()),
            stroke: dom
                .computed_style(n, "stroke", true)
                .unwrap_or_else(|| "none".to_string()),
        }))
    }

    async fn is_connected(&self) -> Result<bool, AutomationError> {
        Ok(self.read(|dom, n| dom.is_connected(n)))
    }

    async fn dispatch_event(&self, event: DomEvent) -> Result<(), AutomationError> {
        self.page.dispatch(self.node, event);
        Ok(())
    }

    async fn set_native_value(&self, value: &str) -> Result<(), AutomationError> {
        let node = self.node;
        self.page.mutate(|dom| dom.set_value(node, value));
        Ok(())
    }

    async fn scroll_into_view(&self) -> Result<(), AutomationError> {
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ElementImpl> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
