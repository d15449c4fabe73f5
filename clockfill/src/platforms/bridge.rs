//! Page backend that drives the active browser tab through the extension
//! bridge. Elements are opaque ids into a page-side registry installed by
//! [`PRELUDE`]; every operation is one small script.

use super::{MutationWatch, PageEngine};
use crate::element::{ComputedColors, DomEvent, ElementImpl, WarningSnapshot};
use crate::extension_bridge::ExtensionBridge;
use crate::{AutomationError, Element};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_EVAL_TIMEOUT: Duration = Duration::from_secs(10);
const DETACHED_MARKER: &str = "clockfill:detached";

/// Installs `window.__clockfill` once per document.
///
/// Handles hold elements weakly. `sweep()` drops handles whose element was
/// collected or left the document, and runs before every document-level
/// query, so the registry stays bounded by the live DOM.
pub const PRELUDE: &str = r#"
if (!window.__clockfill) {
  window.__clockfill = {
    nodes: new Map(),
    ids: new WeakMap(),
    next: 1,
    observers: new Map(),
    put(el) {
      let id = this.ids.get(el);
      if (!id) {
        id = 'n' + this.next++;
        this.ids.set(el, id);
      }
      if (!this.nodes.has(id)) this.nodes.set(id, new WeakRef(el));
      return id;
    },
    peek(id) {
      const ref = this.nodes.get(id);
      return ref ? ref.deref() : undefined;
    },
    get(id) {
      const el = this.peek(id);
      if (!el) {
        this.nodes.delete(id);
        throw new Error('clockfill:detached ' + id);
      }
      return el;
    },
    sweep() {
      for (const [id, ref] of this.nodes) {
        const el = ref.deref();
        if (!el || !el.isConnected) this.nodes.delete(id);
      }
    },
  };
}
"#;

fn script(body: &str) -> String {
    format!("(() => {{\n{PRELUDE}\nconst R = window.__clockfill;\n{body}\n}})()")
}

/// A JSON literal safe to splice into a script.
fn js(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn map_eval_error(error: AutomationError) -> AutomationError {
    match error {
        AutomationError::PlatformError(msg) if msg.contains(DETACHED_MARKER) => {
            AutomationError::ElementDetached(msg)
        }
        other => other,
    }
}

#[derive(Clone)]
struct Channel {
    bridge: Arc<ExtensionBridge>,
    timeout: Duration,
}

impl Channel {
    async fn eval<T: DeserializeOwned>(&self, body: &str) -> Result<T, AutomationError> {
        let value = self
            .bridge
            .eval(&script(body), self.timeout)
            .await
            .map_err(map_eval_error)?;
        serde_json::from_value(value).map_err(|e| {
            AutomationError::PlatformError(format!("Unexpected script result: {e}"))
        })
    }

    fn elements(&self, ids: Vec<String>) -> Vec<Element> {
        ids.into_iter().map(|id| self.element(id)).collect()
    }

    fn element(&self, id: String) -> Element {
        Element::new(Box::new(BridgeElement {
            channel: self.clone(),
            id,
        }))
    }
}

/// [`PageEngine`] over the active tab of the connected extension
#[derive(Clone)]
pub struct BridgeEngine {
    channel: Channel,
}

impl BridgeEngine {
    pub fn new(bridge: Arc<ExtensionBridge>) -> Self {
        Self {
            channel: Channel {
                bridge,
                timeout: DEFAULT_EVAL_TIMEOUT,
            },
        }
    }

    /// Per-script evaluation budget
    pub fn with_eval_timeout(mut self, timeout: Duration) -> Self {
        self.channel.timeout = timeout;
        self
    }
}

#[async_trait]
impl PageEngine for BridgeEngine {
    async fn query_selector_all(&self, selector: &str) -> Result<Vec<Element>, AutomationError> {
        let ids: Vec<String> = self
            .channel
            .eval(&format!(
                "R.sweep();
return Array.from(document.querySelectorAll({})).map((e) => R.put(e));",
                js(selector)
            ))
            .await?;
        Ok(self.channel.elements(ids))
    }

    async fn observe_mutations(
        &self,
        root: Option<&Element>,
    ) -> Result<MutationWatch, AutomationError> {
        let watch_id = Uuid::new_v4().to_string();
        let root_expr = match root {
            Some(el) => format!("R.get({})", js(&el.object_id())),
            None => "document".to_string(),
        };
        let events = self.channel.bridge.register_watch(&watch_id);
        let installed: Result<bool, AutomationError> = self
            .channel
            .eval(&format!(
                "const wid = {wid};
const obs = new MutationObserver(() => document.dispatchEvent(
  new CustomEvent('clockfill:mutation', {{ detail: {{ watchId: wid }} }})));
obs.observe({root_expr}, {{ childList: true, subtree: true, attributes: true }});
R.observers.set(wid, obs);
return true;",
                wid = js(&watch_id)
            ))
            .await;
        if let Err(e) = installed {
            self.channel.bridge.unregister_watch(&watch_id);
            return Err(e);
        }

        let channel = self.channel.clone();
        Ok(MutationWatch::new(events, move || {
            channel.bridge.unregister_watch(&watch_id);
            let body = format!(
                "const o = R.observers.get({wid});
if (o) {{ o.disconnect(); R.observers.delete({wid}); }}
return true;",
                wid = js(&watch_id)
            );
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = channel.eval::<bool>(&body).await {
                            debug!(error = %e, "Observer teardown script failed");
                        }
                    });
                }
                Err(_) => warn!("No runtime to disconnect page observer"),
            }
        }))
    }
}

#[derive(Clone)]
struct BridgeElement {
    channel: Channel,
    id: String,
}

impl std::fmt::Debug for BridgeElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeElement").field("id", &self.id).finish()
    }
}

impl BridgeElement {
    fn this(&self) -> String {
        format!("R.get({})", js(&self.id))
    }
}

#[async_trait]
impl ElementImpl for BridgeElement {
    fn object_id(&self) -> String {
        self.id.clone()
    }

    async fn tag_name(&self) -> Result<String, AutomationError> {
        self.channel
            .eval(&format!("return {}.tagName.toLowerCase();", self.this()))
            .await
    }

    async fn attribute(&self, name: &str) -> Result<Option<String>, AutomationError> {
        self.channel
            .eval(&format!("return {}.getAttribute({});", self.this(), js(name)))
            .await
    }

    async fn text_content(&self) -> Result<String, AutomationError> {
        self.channel
            .eval(&format!("return {}.textContent ?? '';", self.this()))
            .await
    }

    async fn query_selector_all(&self, selector: &str) -> Result<Vec<Element>, AutomationError> {
        let ids: Vec<String> = self
            .channel
            .eval(&format!(
                "return Array.from({}.querySelectorAll({})).map((e) => R.put(e));",
                self.this(),
                js(selector)
            ))
            .await?;
        Ok(self.channel.elements(ids))
    }

    async fn closest(&self, selector: &str) -> Result<Option<Element>, AutomationError> {
        let id: Option<String> = self
            .channel
            .eval(&format!(
                "const f = {}.closest({}); return f ? R.put(f) : null;",
                self.this(),
                js(selector)
            ))
            .await?;
        Ok(id.map(|id| self.channel.element(id)))
    }

    async fn parent(&self) -> Result<Option<Element>, AutomationError> {
        let id: Option<String> = self
            .channel
            .eval(&format!(
                "const p = {}.parentElement; return p ? R.put(p) : null;",
                self.this()
            ))
            .await?;
        Ok(id.map(|id| self.channel.element(id)))
    }

    async fn has_layout(&self) -> Result<bool, AutomationError> {
        self.channel
            .eval(&format!(
                "const e = {};
return !!(e.offsetWidth || e.offsetHeight || e.getClientRects().length);",
                self.this()
            ))
            .await
    }

    async fn computed_colors(&self) -> Result<ComputedColors, AutomationError> {
        self.channel
            .eval(&format!(
                "const s = getComputedStyle({});
return {{ color: s.color, backgroundColor: s.backgroundColor, fill: s.fill, stroke: s.stroke }};",
                self.this()
            ))
            .await
    }

    async fn is_connected(&self) -> Result<bool, AutomationError> {
        self.channel
            .eval(&format!(
                "const e = R.peek({}); return !!(e && e.isConnected);",
                js(&self.id)
            ))
            .await
    }

    async fn dispatch_event(&self, event: DomEvent) -> Result<(), AutomationError> {
        let constructor = if event.is_pointer() {
            format!(
                "new MouseEvent({}, {{ bubbles: true, cancelable: true, view: window }})",
                js(event.as_str())
            )
        } else {
            format!(
                "new Event({}, {{ bubbles: true, cancelable: true }})",
                js(event.as_str())
            )
        };
        let _: bool = self
            .channel
            .eval(&format!(
                "{}.dispatchEvent({constructor}); return true;",
                self.this()
            ))
            .await?;
        Ok(())
    }

    async fn set_native_value(&self, value: &str) -> Result<(), AutomationError> {
        let _: bool = self
            .channel
            .eval(&format!(
                "const e = {};
const proto = e instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
const setter = Object.getOwnPropertyDescriptor(proto, 'value')?.set;
if (setter) setter.call(e, {v}); else e.value = {v};
return true;",
                self.this(),
                v = js(value)
            ))
            .await?;
        Ok(())
    }

    async fn scroll_into_view(&self) -> Result<(), AutomationError> {
        let _: bool = self
            .channel
            .eval(&format!(
                "{}.scrollIntoView({{ block: 'center', behavior: 'smooth' }}); return true;",
                self.this()
            ))
            .await?;
        Ok(())
    }

    async fn warning_snapshot(
        &self,
        markers: &[&str],
        candidates: &str,
    ) -> Result<WarningSnapshot, AutomationError> {
        let markers = serde_json::to_string(markers).map_err(|e| {
            AutomationError::InvalidArgument(format!("Unencodable marker list: {e}"))
        })?;
        self.channel
            .eval(&format!(
                "const row = {};
for (const m of {markers}) {{
  if (row.querySelector(m)) return {{ marker: m, indicators: [] }};
}}
const indicators = Array.from(row.querySelectorAll({})).map((c) => {{
  const s = getComputedStyle(c);
  return {{
    text: c.textContent ?? '',
    colors: {{ color: s.color, backgroundColor: s.backgroundColor, fill: s.fill, stroke: s.stroke }},
  }};
}});
return {{ marker: null, indicators }};",
                self.this(),
                js(candidates)
            ))
            .await
    }

    fn clone_box(&self) -> Box<dyn ElementImpl> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
