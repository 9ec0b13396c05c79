//! Plain-text normalization and media reference discovery for legacy HTML bodies.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CRATE_NAME: &str = "newsmig-extract";

/// Leading marker every normalized body starts with.
pub const INDENTATION: &str = "    ";
pub const VIDEO_WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

static VIDEO_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(https?://)?((www\.)?youtube\.com|youtu\.be)/.+$")
        .expect("video url pattern is valid")
});

static VIDEO_EMBED_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{youtube\}([\w\-]+)\{/youtube\}").expect("video embed pattern is valid")
});

const HIDDEN_TEXT_PARENTS: &[&str] = &["script", "style", "template", "noscript"];
const DOCUMENT_SHELL: &[&str] = &["html", "head", "body"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaReferences {
    /// Raw image URLs in document order, duplicates preserved.
    pub images: Vec<String>,
    /// Link-derived video URLs followed by pseudo-tag derived ones.
    pub videos: Vec<String>,
}

/// A legacy body parsed once and queried several times.
pub struct HtmlDocument<'a> {
    raw: &'a str,
    html: Html,
}

impl<'a> HtmlDocument<'a> {
    /// Never fails; html5ever recovers from unclosed and stray tags.
    pub fn parse(raw: &'a str) -> Self {
        Self {
            raw,
            html: Html::parse_document(raw),
        }
    }

    pub fn text(&self) -> String {
        let joined = self.visible_text_fragments().join(" ");
        let without_embeds = VIDEO_EMBED_TAG_RE.replace_all(&joined, "");
        format!("{INDENTATION}{without_embeds}")
    }

    fn visible_text_fragments(&self) -> Vec<&str> {
        self.html
            .tree
            .root()
            .descendants()
            .filter_map(|node| {
                let Node::Text(text) = node.value() else {
                    return None;
                };
                let hidden = node.ancestors().any(|ancestor| {
                    ancestor
                        .value()
                        .as_element()
                        .is_some_and(|el| HIDDEN_TEXT_PARENTS.contains(&el.name()))
                });
                if hidden {
                    return None;
                }
                let trimmed = text.trim();
                (!trimmed.is_empty()).then_some(trimmed)
            })
            .collect()
    }

    /// True when the body still contains real elements, i.e. it has not been normalized yet.
    pub fn has_markup(&self) -> bool {
        self.html
            .tree
            .root()
            .descendants()
            .filter_map(|node| node.value().as_element())
            .any(|el| !DOCUMENT_SHELL.contains(&el.name()))
    }

    pub fn image_references(&self) -> Vec<String> {
        let Some(selector) = parse_selector("img") else {
            return Vec::new();
        };
        self.html.select(&selector).filter_map(image_source).collect()
    }

    pub fn video_references(&self) -> Vec<String> {
        let mut urls = self.linked_video_urls();
        urls.extend(embedded_video_urls(self.raw));
        urls
    }

    pub fn has_video_references(&self) -> bool {
        !self.linked_video_urls().is_empty() || VIDEO_EMBED_TAG_RE.is_match(self.raw)
    }

    pub fn media_references(&self) -> MediaReferences {
        MediaReferences {
            images: self.image_references(),
            videos: self.video_references(),
        }
    }

    fn linked_video_urls(&self) -> Vec<String> {
        let Some(selector) = parse_selector("a") else {
            return Vec::new();
        };
        self.html
            .select(&selector)
            .filter_map(|link| non_empty_attr(link, "src").or_else(|| non_empty_attr(link, "href")))
            .filter(|url| is_video_url(url))
            .collect()
    }
}

fn parse_selector(selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(sel) => Some(sel),
        Err(err) => {
            warn!(selector, error = %err, "selector rejected; treating as no references");
            None
        }
    }
}

fn non_empty_attr(element: ElementRef<'_>, name: &str) -> Option<String> {
    element
        .value()
        .attr(name)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// `src`, then the element's own `href`, then the nearest enclosing link.
fn image_source(img: ElementRef<'_>) -> Option<String> {
    non_empty_attr(img, "src")
        .or_else(|| non_empty_attr(img, "href"))
        .or_else(|| {
            img.ancestors()
                .filter_map(ElementRef::wrap)
                .find(|el| el.value().name() == "a")
                .and_then(|link| non_empty_attr(link, "href"))
        })
}

pub fn is_video_url(url: &str) -> bool {
    VIDEO_URL_RE.is_match(url.trim())
}

/// Canonical watch URLs for every `{youtube}CODE{/youtube}` pseudo-tag in `raw`.
pub fn embedded_video_urls(raw: &str) -> Vec<String> {
    VIDEO_EMBED_TAG_RE
        .captures_iter(raw)
        .map(|caps| format!("{VIDEO_WATCH_URL_PREFIX}{}", &caps[1]))
        .collect()
}

pub fn normalize_text(raw: &str) -> String {
    HtmlDocument::parse(raw).text()
}

pub fn extract_media(raw: &str) -> MediaReferences {
    HtmlDocument::parse(raw).media_references()
}

/// Extraction capability handed to the reconciler.
pub trait ContentExtractor: Send + Sync {
    fn normalize_text(&self, raw: &str) -> String;
    fn extract_media(&self, raw: &str) -> MediaReferences;
    fn has_video_references(&self, raw: &str) -> bool;
    fn has_markup(&self, raw: &str) -> bool;
    /// True when `text` already carries the normalized-output marker.
    fn is_normalized(&self, text: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlExtractor;

impl ContentExtractor for HtmlExtractor {
    fn normalize_text(&self, raw: &str) -> String {
        normalize_text(raw)
    }

    fn extract_media(&self, raw: &str) -> MediaReferences {
        extract_media(raw)
    }

    fn has_video_references(&self, raw: &str) -> bool {
        HtmlDocument::parse(raw).has_video_references()
    }

    fn has_markup(&self, raw: &str) -> bool {
        HtmlDocument::parse(raw).has_markup()
    }

    fn is_normalized(&self, text: &str) -> bool {
        text.starts_with(INDENTATION)
    }
}

/// Maps absolute URLs under the legacy site onto storage-relative paths.
#[derive(Debug, Clone)]
pub struct UrlNormalizer {
    legacy_domain: String,
    pattern: Option<Regex>,
}

impl UrlNormalizer {
    pub fn new(legacy_domain: impl Into<String>) -> Self {
        let legacy_domain = legacy_domain.into().trim().to_string();
        let pattern = if legacy_domain.is_empty() {
            None
        } else {
            Regex::new(&format!(
                r"(?i)^https?://{}/(.+)$",
                regex::escape(&legacy_domain)
            ))
            .map_err(|err| warn!(legacy_domain = %legacy_domain, error = %err, "legacy domain pattern rejected"))
            .ok()
        };
        Self {
            legacy_domain,
            pattern,
        }
    }

    pub fn legacy_domain(&self) -> &str {
        &self.legacy_domain
    }

    /// Legacy absolute URLs come back as their path, still percent-encoded; anything
    /// else unchanged. Decoding happens once, where the path is consumed
    /// (`file_name_from_path`, source lookup).
    pub fn to_relative(&self, url: &str) -> String {
        let Some(pattern) = &self.pattern else {
            return url.to_string();
        };
        match pattern.captures(url.trim()) {
            Some(caps) => caps[1].to_string(),
            None => url.to_string(),
        }
    }
}
