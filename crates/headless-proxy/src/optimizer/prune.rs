//! Streaming HTML pruning with `lol_html`.

use super::minify::{collapse_style_attr, minify_css};
use super::ImageDimensions;
use lol_html::errors::RewritingError;
use lol_html::html_content::ContentType;
use lol_html::{doc_comments, element, rewrite_str, text, RewriteStrSettings};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

const KEPT_SCRIPT_TYPES: &[&str] = &["application/ld+json", "application/json"];
const KEPT_DATA_ATTRIBUTES: &[&str] = &["data-id", "data-src", "data-href", "data-url", "data-target"];
const REMOVED_META_NAMES: &[&str] = &["robots", "googlebot", "generator"];

static EMPTY_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<style\b[^>]*>\s*</style\s*>").expect("valid regex"));

pub struct PruneOptions<'a> {
    pub compress_images: bool,
    pub image_dimensions: &'a ImageDimensions,
}

#[derive(Default)]
struct PruneState {
    removed: usize,
    meta_names: HashSet<String>,
    style_text: String,
}

impl PruneState {
    fn bump(&mut self) {
        self.removed += 1;
    }
}

/// Whether an inline style hides the element outright.
fn hides_element(style: &str) -> bool {
    let compact: String = style
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    compact.trim_end_matches(';') == "display:none"
}

/// Prune `html`, returning the rewritten document and how many nodes or
/// attributes were removed.
pub fn prune(html: &str, options: &PruneOptions<'_>) -> Result<(String, usize), RewritingError> {
    let state = Rc::new(RefCell::new(PruneState::default()));

    let mut handlers = vec![
        element!("script", {
            let state = Rc::clone(&state);
            move |el| {
                let kept = el
                    .get_attribute("type")
                    .map(|t| KEPT_SCRIPT_TYPES.contains(&t.trim().to_ascii_lowercase().as_str()))
                    .unwrap_or(false);
                if !kept {
                    el.remove();
                    state.borrow_mut().bump();
                }
                Ok(())
            }
        }),
        element!("link[rel]", {
            let state = Rc::clone(&state);
            move |el| {
                let rel = el.get_attribute("rel").unwrap_or_default().to_ascii_lowercase();
                if rel
                    .split_whitespace()
                    .any(|r| r == "preload" || r == "prefetch")
                {
                    el.remove();
                    state.borrow_mut().bump();
                }
                Ok(())
            }
        }),
        element!("meta[name]", {
            let state = Rc::clone(&state);
            move |el| {
                let name = el.get_attribute("name").unwrap_or_default().to_ascii_lowercase();
                let mut state = state.borrow_mut();
                if REMOVED_META_NAMES.contains(&name.as_str()) || !state.meta_names.insert(name) {
                    el.remove();
                    state.bump();
                }
                Ok(())
            }
        }),
        element!("[hidden]", {
            let state = Rc::clone(&state);
            move |el| {
                if !el.removed() {
                    el.remove();
                    state.borrow_mut().bump();
                }
                Ok(())
            }
        }),
        element!("[style]", {
            let state = Rc::clone(&state);
            move |el| {
                if el.removed() {
                    return Ok(());
                }
                let style = el.get_attribute("style").unwrap_or_default();
                let tag = el.tag_name();
                let hidden_iframe = tag == "iframe" && {
                    let lower = style.to_ascii_lowercase();
                    lower.contains("display: none") || lower.contains("display:none")
                };
                if hidden_iframe || (tag != "noscript" && hides_element(&style)) {
                    el.remove();
                    state.borrow_mut().bump();
                    return Ok(());
                }
                let collapsed = collapse_style_attr(&style);
                if collapsed.len() < style.len() {
                    el.set_attribute("style", &collapsed)?;
                    state.borrow_mut().bump();
                }
                Ok(())
            }
        }),
        element!("*", {
            let state = Rc::clone(&state);
            move |el| {
                if el.removed() {
                    return Ok(());
                }
                let stripped: Vec<String> = el
                    .attributes()
                    .iter()
                    .map(|a| a.name())
                    .filter(|n| n.starts_with("data-") && !KEPT_DATA_ATTRIBUTES.contains(&n.as_str()))
                    .collect();
                for name in &stripped {
                    el.remove_attribute(name);
                }
                state.borrow_mut().removed += stripped.len();
                Ok(())
            }
        }),
        element!("a[rel]", {
            let state = Rc::clone(&state);
            move |el| {
                let rel = el.get_attribute("rel").unwrap_or_default();
                let blank = el.get_attribute("target").as_deref() == Some("_blank");
                if rel == "noopener noreferrer" && !blank {
                    el.remove_attribute("rel");
                    state.borrow_mut().bump();
                }
                Ok(())
            }
        }),
        text!("style", {
            let state = Rc::clone(&state);
            move |t| {
                let mut state = state.borrow_mut();
                state.style_text.push_str(t.as_str());
                if t.last_in_text_node() {
                    let original = std::mem::take(&mut state.style_text);
                    let minified = minify_css(&original);
                    if minified.len() < original.len() {
                        state.bump();
                    }
                    t.replace(&minified, ContentType::Html);
                } else {
                    t.remove();
                }
                Ok(())
            }
        }),
    ];

    if options.compress_images {
        let dimensions = options.image_dimensions;
        handlers.push(element!("img", {
            let state = Rc::clone(&state);
            move |el| {
                if el.removed() {
                    return Ok(());
                }
                if !el.has_attribute("loading") {
                    el.set_attribute("loading", "lazy")?;
                }
                if el.has_attribute("srcset") {
                    el.remove_attribute("srcset");
                    state.borrow_mut().bump();
                }
                if !el.has_attribute("alt") {
                    el.set_attribute("alt", "")?;
                }
                let rendered = el
                    .get_attribute("src")
                    .and_then(|src| dimensions.get(&src).copied());
                if let Some((width, height)) = rendered {
                    if !el.has_attribute("width") && width > 0 {
                        el.set_attribute("width", &width.to_string())?;
                    }
                    if !el.has_attribute("height") && height > 0 {
                        el.set_attribute("height", &height.to_string())?;
                    }
                }
                Ok(())
            }
        }));
    }

    let rewritten = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: handlers,
            document_content_handlers: vec![doc_comments!({
                let state = Rc::clone(&state);
                move |c| {
                    c.remove();
                    state.borrow_mut().bump();
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    )?;

    let empty_styles = EMPTY_STYLE.find_iter(&rewritten).count();
    let output = if empty_styles > 0 {
        EMPTY_STYLE.replace_all(&rewritten, "").into_owned()
    } else {
        rewritten
    };

    let removed = state.borrow().removed + empty_styles;
    Ok((output, removed))
}
