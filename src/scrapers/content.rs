//! Visible-content extraction from fetched HTML.

use std::collections::HashSet;

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

pub const MAX_TEXT_CHARS: usize = 50_000;
pub const MAX_LINKS: usize = 100;
pub const MAX_CLEAN_HTML_CHARS: usize = 100_000;

/// Subtrees that never contribute visible text.
const EXCLUDED: &[&str] = &[
    "script", "style", "nav", "footer", "header", "iframe", "noscript",
];

/// What the extraction collaborator sees of a page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContent {
    pub url: String,
    pub title: Option<String>,
    pub meta_description: Option<String>,
    pub text: String,
    pub links: Vec<String>,
    pub clean_html: String,
}

/// Cut `s` to at most `max` characters.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        } else if let Some(el) = ElementRef::wrap(child) {
            if !EXCLUDED.contains(&el.value().name()) {
                collect_text(el, out);
            }
        }
    }
}

fn visible_text(document: &Html) -> String {
    let mut raw = String::new();
    let body = selector("body").and_then(|s| document.select(&s).next());
    match body {
        Some(body) => collect_text(body, &mut raw),
        None => collect_text(document.root_element(), &mut raw),
    }
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, MAX_TEXT_CHARS).to_string()
}

fn absolute_links(document: &Html, base: Option<&Url>) -> Vec<String> {
    let Some(anchors) = selector("a[href]") else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let resolved = match base {
            Some(base) => base.join(href.trim()),
            None => Url::parse(href.trim()),
        };
        let Ok(mut link) = resolved else {
            continue;
        };
        if link.scheme() != "http" && link.scheme() != "https" {
            continue;
        }
        link.set_fragment(None);
        let link = link.to_string();
        if seen.insert(link.clone()) {
            links.push(link);
            if links.len() >= MAX_LINKS {
                break;
            }
        }
    }
    links
}

/// Extract title, meta description, visible text and absolute links.
pub fn extract_visible_content(html: &str, url: &str) -> PageContent {
    let document = Html::parse_document(html);
    let base = Url::parse(url).ok();

    let title = selector("title")
        .and_then(|s| document.select(&s).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let meta_description = selector("meta[name=\"description\"]")
        .and_then(|s| document.select(&s).next())
        .and_then(|el| el.value().attr("content"))
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());

    PageContent {
        url: url.to_string(),
        title,
        meta_description,
        text: visible_text(&document),
        links: absolute_links(&document, base.as_ref()),
        clean_html: truncate_chars(&document.html(), MAX_CLEAN_HTML_CHARS).to_string(),
    }
}
