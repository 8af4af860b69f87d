//! Content-type keyed minifiers.
//!
//! These are conservative text transforms: whitespace and comments go, content
//! that could change meaning (preformatted text, inline scripts) is left alone.

use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static ATTR_COLON: Lazy<Regex> = Lazy::new(|| Regex::new(r":\s+").expect("valid regex"));
static ATTR_SEMI: Lazy<Regex> = Lazy::new(|| Regex::new(r";\s+").expect("valid regex"));
static MARKUP_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"<!--[\s\S]*?-->").expect("valid regex"));
static BETWEEN_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r">\s+<").expect("valid regex"));
static HTML_RAW_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)<pre\b.*?</pre\s*>|<textarea\b.*?</textarea\s*>|<script\b.*?</script\s*>|<style\b.*?</style\s*>",
    )
    .expect("valid regex")
});

/// Media type of a `Content-Type` value, lowercased and without parameters.
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Minify `input` according to its content type. Unknown or binary types are
/// returned unchanged.
pub fn minify(content_type: &str, input: &str) -> String {
    match media_type(content_type).as_str() {
        "text/html" | "application/xhtml+xml" => minify_html(input),
        "text/css" => minify_css(input),
        "text/javascript" | "application/javascript" | "application/x-javascript" => {
            minify_js(input)
        }
        "application/json" | "application/ld+json" => minify_json(input),
        "image/svg+xml" | "text/xml" | "application/xml" => minify_xml(input),
        _ => input.to_string(),
    }
}

/// Drop comments and collapsible whitespace from a stylesheet.
///
/// Quoted strings are copied untouched. Whitespace around `{ } ; ,` goes, as
/// does whitespace after `:`. Whitespace before `:` only goes inside a
/// declaration, since in a selector (`.nav :first-child`) it is a combinator.
pub fn minify_css(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
                continue;
            }
            '"' | '\'' => {
                flush_space(&mut out, &mut pending_space);
                let end = string_end(&chars, i);
                out.extend(&chars[i..end]);
                i = end;
                continue;
            }
            c if c.is_whitespace() => {
                if !out.is_empty() && !out.ends_with(|p: char| matches!(p, '{' | '}' | ';' | ',' | ':')) {
                    pending_space = true;
                }
            }
            '{' | ';' | ',' => {
                pending_space = false;
                out.push(c);
            }
            '}' => {
                pending_space = false;
                if out.ends_with(';') {
                    out.pop();
                }
                out.push(c);
            }
            ':' => {
                if in_declaration(&chars, i) {
                    pending_space = false;
                } else {
                    flush_space(&mut out, &mut pending_space);
                }
                out.push(c);
            }
            _ => {
                flush_space(&mut out, &mut pending_space);
                out.push(c);
            }
        }
        i += 1;
    }
    out
}

fn flush_space(out: &mut String, pending_space: &mut bool) {
    if std::mem::take(pending_space) {
        out.push(' ');
    }
}

/// Index just past the string literal opening at `start`.
fn string_end(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

/// Whether the `:` at `at` ends a property name rather than sitting in a
/// selector: a declaration runs into `;` or `}` before any `{`.
fn in_declaration(chars: &[char], at: usize) -> bool {
    let mut i = at + 1;
    while i < chars.len() {
        match chars[i] {
            '"' | '\'' => {
                i = string_end(chars, i);
                continue;
            }
            '{' => return false,
            ';' | '}' => return true,
            _ => {}
        }
        i += 1;
    }
    true
}

/// Collapse an inline `style` attribute.
pub fn collapse_style_attr(input: &str) -> String {
    let out = WHITESPACE.replace_all(input, " ");
    let out = ATTR_COLON.replace_all(&out, ":");
    let out = ATTR_SEMI.replace_all(&out, ";");
    out.trim().to_string()
}

/// Remove comments and collapse whitespace runs to one space, leaving
/// `pre`, `textarea`, `script` and `style` blocks verbatim.
pub fn minify_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for block in HTML_RAW_BLOCK.find_iter(input) {
        out.push_str(&collapse_markup(&input[last..block.start()]));
        out.push_str(block.as_str());
        last = block.end();
    }
    out.push_str(&collapse_markup(&input[last..]));
    out.trim().to_string()
}

fn collapse_markup(segment: &str) -> String {
    let out = MARKUP_COMMENT.replace_all(segment, "");
    WHITESPACE.replace_all(&out, " ").into_owned()
}

/// Line-level script minification: trims lines and drops blank and
/// whole-line `//` comment lines. Never rewrites inside a line.
pub fn minify_js(input: &str) -> String {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("//"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn minify_json(input: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(input) {
        Ok(value) => serde_json::to_string(&value).unwrap_or_else(|_| input.to_string()),
        Err(_) => input.to_string(),
    }
}

pub fn minify_xml(input: &str) -> String {
    let out = MARKUP_COMMENT.replace_all(input, "");
    let out = BETWEEN_TAGS.replace_all(&out, "><");
    out.trim().to_string()
}
