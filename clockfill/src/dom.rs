//! Stateless element helpers shared by the row scanner and the sidebar driver.
//!
//! Everything here works through [`Element`] and [`PageEngine`], so the same
//! heuristics run against a live tab or the in-memory test page.

use crate::element::DomEvent;
use crate::platforms::PageEngine;
use crate::{AutomationError, Element};
use once_cell::sync::Lazy;
use regex::Regex;
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(15_000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

const BUTTON_SELECTOR: &str = "button, [role=\"button\"], a";

/// Lower-case, collapse whitespace runs, trim.
pub fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Builds `[name="value"]`, escaping the value for a quoted CSS string.
pub fn attr_selector(name: &str, value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("[{name}=\"{escaped}\"]")
}

/// True iff the element has a rendered box. Errors (detached handles and the
/// like) count as not visible.
pub async fn is_visible(element: &Element) -> bool {
    match element.has_layout().await {
        Ok(visible) => visible,
        Err(e) => {
            debug!(error = %e, "Visibility probe failed; treating element as hidden");
            false
        }
    }
}

pub async fn dispatch_click(element: &Element) -> Result<(), AutomationError> {
    element.dispatch_event(DomEvent::Click).await
}

/// Commits a value the way a user edit would look to the page's framework:
/// click, focus-in, native set, input, change, blur, focus-out.
pub async fn commit_value(input: &Element, value: &str) -> Result<(), AutomationError> {
    input.dispatch_event(DomEvent::Click).await?;
    input.dispatch_event(DomEvent::FocusIn).await?;
    input.set_native_value(value).await?;
    input.dispatch_event(DomEvent::Input).await?;
    input.dispatch_event(DomEvent::Change).await?;
    input.dispatch_event(DomEvent::Blur).await?;
    input.dispatch_event(DomEvent::FocusOut).await?;
    Ok(())
}

/// Options for [`wait_for`]
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
    pub root: Option<Element>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WAIT_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
            root: None,
        }
    }
}

impl WaitOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Restrict mutation observation to a subtree
    pub fn within(mut self, root: &Element) -> Self {
        self.root = Some(root.clone());
        self
    }
}

/// Resolves with the first `Some` the condition yields, or fails with
/// [`AutomationError::Timeout`] once `options.timeout` has elapsed.
///
/// The condition runs once immediately, after every mutation under the
/// observed root, and on every `options.interval` tick (for changes such as
/// computed visibility that produce no mutation record). The observer is
/// disconnected exactly once on either outcome; the ticker dies with this
/// frame.
pub async fn wait_for<T, F, Fut>(
    engine: &dyn PageEngine,
    mut condition: F,
    options: WaitOptions,
) -> Result<T, AutomationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    let deadline = start + options.timeout;
    let mut watch = engine.observe_mutations(options.root.as_ref()).await?;
    let mut ticker = time::interval_at(start + options.interval, options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        if let Some(value) = condition().await {
            break Ok(value);
        }
        if Instant::now() >= deadline {
            break Err(AutomationError::Timeout(format!(
                "Timed out after {:?} waiting for condition",
                options.timeout
            )));
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = watch.changed() => {}
            _ = time::sleep_until(deadline) => {}
        }
    };

    watch.disconnect();
    outcome
}

/// First visible button-like element whose text or aria-label contains one of
/// the candidate phrases. Candidates are tried in order, then DOM order.
pub async fn find_button_by_visible_text(
    container: &Element,
    candidates: &[&str],
) -> Result<Option<Element>, AutomationError> {
    let mut described = Vec::new();
    for button in container.query_selector_all(BUTTON_SELECTOR).await? {
        if !is_visible(&button).await {
            continue;
        }
        let text = normalize(&button.text_content().await?);
        let aria = normalize(&button.attribute("aria-label").await?.unwrap_or_default());
        described.push((button, text, aria));
    }

    for candidate in candidates {
        let wanted = normalize(candidate);
        if wanted.is_empty() {
            continue;
        }
        if let Some((button, _, _)) = described
            .iter()
            .find(|(_, text, aria)| text.contains(&wanted) || aria.contains(&wanted))
        {
            return Ok(Some(button.clone()));
        }
    }

    Ok(None)
}

/// Resolves an input from its label text: `for` association, nested input,
/// sibling input under the label's parent, then a substring match against
/// input name / aria-label / placeholder.
pub async fn find_input_by_label(
    container: &Element,
    label_text: &str,
) -> Result<Option<Element>, AutomationError> {
    let wanted = normalize(label_text);

    for label in container.query_selector_all("label").await? {
        if !normalize(&label.text_content().await?).contains(&wanted) {
            continue;
        }

        if let Some(target_id) = label.attribute("for").await? {
            if let Some(target) = container
                .query_selector(&attr_selector("id", &target_id))
                .await?
            {
                if target.tag_name().await?.eq_ignore_ascii_case("input") {
                    return Ok(Some(target));
                }
                if let Some(input) = target.query_selector("input").await? {
                    return Ok(Some(input));
                }
            }
        }

        if let Some(nested) = label.query_selector("input").await? {
            return Ok(Some(nested));
        }

        if let Some(parent) = label.parent().await? {
            if let Some(sibling) = parent.query_selector("input").await? {
                return Ok(Some(sibling));
            }
        }
    }

    let compact: String = wanted.chars().filter(|c| !c.is_whitespace()).collect();
    for input in container.query_selector_all("input").await? {
        let mut haystacks = Vec::with_capacity(3);
        for attr in ["name", "aria-label", "placeholder"] {
            haystacks.push(normalize(&input.attribute(attr).await?.unwrap_or_default()));
        }
        if haystacks
            .iter()
            .any(|value| value.contains(&compact) || value.contains(&wanted))
        {
            return Ok(Some(input));
        }
    }

    Ok(None)
}

/// An opaque RGB color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

static RGB_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^rgba?\(\s*(\d+)[\s,]+(\d+)[\s,]+(\d+)\s*(?:[,/]\s*([\d.]+)\s*(%)?\s*)?\)")
        .expect("valid rgb() pattern")
});

/// Parses `rgb()`/`rgba()` and 3/6-digit hex colors. Transparent colors
/// (keyword or zero alpha) parse to `None`.
pub fn parse_color(value: &str) -> Option<Rgb> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("transparent") {
        return None;
    }

    if let Some(caps) = RGB_FUNCTION.captures(value) {
        let channel = |i: usize| -> Option<u8> {
            caps.get(i)?
                .as_str()
                .parse::<u32>()
                .ok()
                .map(|v| v.min(255) as u8)
        };
        if let Some(alpha) = caps.get(4) {
            let alpha: f64 = alpha.as_str().parse().ok()?;
            if alpha == 0.0 {
                return None;
            }
        }
        return Some(Rgb {
            r: channel(1)?,
            g: channel(2)?,
            b: channel(3)?,
        });
    }

    let hex = value.strip_prefix('#').unwrap_or(value);
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let expanded: String = match hex.len() {
        3 => hex.chars().flat_map(|c| [c, c]).collect(),
        6 => hex.to_string(),
        _ => return None,
    };
    let channel = |i: usize| u8::from_str_radix(&expanded[i..i + 2], 16).ok();
    Some(Rgb {
        r: channel(0)?,
        g: channel(2)?,
        b: channel(4)?,
    })
}

/// Red channel above 180 with green and blue both below 100.
pub fn is_reddish(value: &str) -> bool {
    parse_color(value)
        .map(|c| c.r > 180 && c.g < 100 && c.b < 100)
        .unwrap_or(false)
}
