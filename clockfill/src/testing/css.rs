//! The CSS selector subset the fake page understands: type, `#id`, `.class`,
//! `[attr]`, `[attr="v"]`, `[attr*="v"]`, `[attr^="v"]`, `[attr$="v"]`
//! (each with an optional ` i` flag), descendant and child combinators, and
//! comma-separated groups.

use super::dom::{FakeDom, NodeId};
use crate::AutomationError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrOp {
    Exists,
    Equals(String),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttrCondition {
    name: String,
    op: AttrOp,
    case_insensitive: bool,
}

impl AttrCondition {
    fn matches(&self, actual: Option<&str>) -> bool {
        let Some(actual) = actual else {
            return false;
        };
        let fold = |s: &str| {
            if self.case_insensitive {
                s.to_lowercase()
            } else {
                s.to_string()
            }
        };
        let actual = fold(actual);
        match &self.op {
            AttrOp::Exists => true,
            AttrOp::Equals(v) => actual == fold(v),
            AttrOp::Contains(v) => !v.is_empty() && actual.contains(&fold(v)),
            AttrOp::StartsWith(v) => !v.is_empty() && actual.starts_with(&fold(v)),
            AttrOp::EndsWith(v) => !v.is_empty() && actual.ends_with(&fold(v)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrCondition>,
}

impl Compound {
    fn matches(&self, dom: &FakeDom, node: NodeId) -> bool {
        let Some(tag) = dom.tag_name(node) else {
            return false;
        };
        if let Some(wanted) = &self.tag {
            if !tag.eq_ignore_ascii_case(wanted) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if dom.attribute(node, "id") != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.is_empty() {
            let classes = dom.attribute(node, "class").unwrap_or_default();
            let tokens: Vec<&str> = classes.split_whitespace().collect();
            if !self.classes.iter().all(|c| tokens.contains(&c.as_str())) {
                return false;
            }
        }
        self.attrs
            .iter()
            .all(|cond| cond.matches(dom.attribute(node, &cond.name)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Part {
    // Relation to the part on the left.
    combinator: Option<Combinator>,
    compound: Compound,
}

/// A parsed selector group list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorList {
    source: String,
    groups: Vec<Vec<Part>>,
}

impl SelectorList {
    pub fn matches(&self, dom: &FakeDom, node: NodeId) -> bool {
        self.groups
            .iter()
            .any(|parts| matches_from(parts, parts.len() - 1, dom, node))
    }
}

fn matches_from(parts: &[Part], idx: usize, dom: &FakeDom, node: NodeId) -> bool {
    let part = &parts[idx];
    if !part.compound.matches(dom, node) {
        return false;
    }
    if idx == 0 {
        return true;
    }
    match part.combinator.unwrap_or(Combinator::Descendant) {
        Combinator::Child => dom
            .parent(node)
            .map(|p| matches_from(parts, idx - 1, dom, p))
            .unwrap_or(false),
        Combinator::Descendant => {
            let mut current = dom.parent(node);
            while let Some(ancestor) = current {
                if matches_from(parts, idx - 1, dom, ancestor) {
                    return true;
                }
                current = dom.parent(ancestor);
            }
            false
        }
    }
}

impl fmt::Display for SelectorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for SelectorList {
    type Err = AutomationError;

    fn from_str(selector: &str) -> Result<Self, Self::Err> {
        let groups = split_outside_brackets(selector, |c| c == ',')?
            .into_iter()
            .map(|group| parse_complex(selector, &group))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source: selector.to_string(),
            groups,
        })
    }
}

fn unsupported(selector: &str) -> AutomationError {
    AutomationError::InvalidArgument(format!("Unsupported selector: {selector}"))
}

/// Splits on `sep` outside `[...]` and quotes. Empty pieces are errors for
/// commas and skipped for whitespace.
fn split_outside_brackets(
    selector: &str,
    sep: impl Fn(char) -> bool,
) -> Result<Vec<String>, AutomationError> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in selector.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match (quote, ch) {
            (_, '\\') => {
                current.push(ch);
                escaped = true;
            }
            (Some(q), c) if c == q => {
                quote = None;
                current.push(ch);
            }
            (Some(_), _) => current.push(ch),
            (None, '"' | '\'') => {
                quote = Some(ch);
                current.push(ch);
            }
            (None, '[') => {
                depth += 1;
                current.push(ch);
            }
            (None, ']') => {
                depth = depth.checked_sub(1).ok_or_else(|| unsupported(selector))?;
                current.push(ch);
            }
            (None, c) if depth == 0 && sep(c) => {
                pieces.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if depth != 0 || quote.is_some() {
        return Err(unsupported(selector));
    }
    pieces.push(current);
    Ok(pieces.into_iter().map(|p| p.trim().to_string()).collect())
}

fn parse_complex(selector: &str, group: &str) -> Result<Vec<Part>, AutomationError> {
    if group.is_empty() {
        return Err(unsupported(selector));
    }
    let spaced = group.replace('>', " > ");
    let tokens: Vec<String> = split_outside_brackets(&spaced, |c| c.is_whitespace())?
        .into_iter()
        .filter(|t| !t.is_empty())
        .collect();

    let mut parts = Vec::new();
    let mut pending: Option<Combinator> = None;
    for token in tokens {
        if token == ">" {
            if parts.is_empty() || pending.is_some() {
                return Err(unsupported(selector));
            }
            pending = Some(Combinator::Child);
            continue;
        }
        let combinator = if parts.is_empty() {
            None
        } else {
            Some(pending.take().unwrap_or(Combinator::Descendant))
        };
        parts.push(Part {
            combinator,
            compound: parse_compound(selector, &token)?,
        });
    }
    if parts.is_empty() || pending.is_some() {
        return Err(unsupported(selector));
    }
    Ok(parts)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn take_ident(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && is_ident_char(chars[end]) {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

fn parse_compound(selector: &str, token: &str) -> Result<Compound, AutomationError> {
    let chars: Vec<char> = token.chars().collect();
    let mut compound = Compound::default();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '#' | '.' => {
                let (ident, next) = take_ident(&chars, i + 1);
                if ident.is_empty() {
                    return Err(unsupported(selector));
                }
                if chars[i] == '#' {
                    compound.id = Some(ident);
                } else {
                    compound.classes.push(ident);
                }
                i = next;
            }
            '[' => {
                let close = find_attr_end(&chars, i).ok_or_else(|| unsupported(selector))?;
                let body: String = chars[i + 1..close].iter().collect();
                compound.attrs.push(parse_attr(selector, &body)?);
                i = close + 1;
            }
            '*' if i == 0 => i += 1,
            c if is_ident_char(c) && i == 0 => {
                let (tag, next) = take_ident(&chars, i);
                compound.tag = Some(tag.to_lowercase());
                i = next;
            }
            _ => return Err(unsupported(selector)),
        }
    }
    Ok(compound)
}

fn find_attr_end(chars: &[char], open: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut i = open + 1;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(_) if c == '\\' => i += 1,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == ']' => return Some(i),
            None => {}
        }
        i += 1;
    }
    None
}

fn parse_attr(selector: &str, body: &str) -> Result<AttrCondition, AutomationError> {
    let body = body.trim();
    let op_at = body.find(|c: char| matches!(c, '=' | '*' | '^' | '$'));
    let Some(op_at) = op_at else {
        if body.is_empty() || !body.chars().all(is_ident_char) {
            return Err(unsupported(selector));
        }
        return Ok(AttrCondition {
            name: body.to_string(),
            op: AttrOp::Exists,
            case_insensitive: false,
        });
    };

    let name = body[..op_at].trim().to_string();
    let rest = &body[op_at..];
    let (kind, rest) = if let Some(r) = rest.strip_prefix("*=") {
        ('*', r)
    } else if let Some(r) = rest.strip_prefix("^=") {
        ('^', r)
    } else if let Some(r) = rest.strip_prefix("$=") {
        ('$', r)
    } else if let Some(r) = rest.strip_prefix('=') {
        ('=', r)
    } else {
        return Err(unsupported(selector));
    };

    let rest = rest.trim();
    let (value, flags) = match rest.chars().next() {
        Some(q @ ('"' | '\'')) => {
            let mut value = String::new();
            let mut chars = rest[1..].char_indices();
            let mut end = None;
            while let Some((idx, c)) = chars.next() {
                if c == '\\' {
                    if let Some((_, escaped)) = chars.next() {
                        value.push(escaped);
                    }
                } else if c == q {
                    end = Some(idx + 2);
                    break;
                } else {
                    value.push(c);
                }
            }
            let end = end.ok_or_else(|| unsupported(selector))?;
            (value, rest[end..].trim())
        }
        _ => {
            let mut split = rest.splitn(2, char::is_whitespace);
            let value = split.next().unwrap_or_default().to_string();
            (value, split.next().unwrap_or_default().trim())
        }
    };

    let case_insensitive = match flags {
        "" => false,
        "i" | "I" => true,
        _ => return Err(unsupported(selector)),
    };
    let op = match kind {
        '*' => AttrOp::Contains(value),
        '^' => AttrOp::StartsWith(value),
        '$' => AttrOp::EndsWith(value),
        _ => AttrOp::Equals(value),
    };
    Ok(AttrCondition {
        name,
        op,
        case_insensitive,
    })
}
