//! Keyreply Render
//!
//! Parses raw reply text into an ordered chain of text and image segments

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static BARE_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\S+\.(?:jpg|jpeg|png|gif|bmp|webp)$").expect("bare image pattern")
});

static MARKER_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*\[(?:图片|img)\](\S+)\s*$").expect("marker line pattern")
});

// Only "text then marker" is recognized; anything after the token is not captured.
static MIXED_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.*?)\[(?:图片|img)\](\S+)").expect("mixed line pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ImageSource {
    LocalPath(String),
    RemoteUrl(String),
}

impl ImageSource {
    pub fn as_str(&self) -> &str {
        match self {
            ImageSource::LocalPath(path) => path,
            ImageSource::RemoteUrl(url) => url,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ImageSource::RemoteUrl(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentSegment {
    Text { text: String },
    Image { source: ImageSource },
    /// Synthesized by the caller; never produced by [`render_chain`].
    Mention { target_id: String },
}

impl ContentSegment {
    pub fn text(text: impl Into<String>) -> Self {
        ContentSegment::Text { text: text.into() }
    }

    pub fn local_image(path: impl Into<String>) -> Self {
        ContentSegment::Image {
            source: ImageSource::LocalPath(path.into()),
        }
    }

    pub fn remote_image(url: impl Into<String>) -> Self {
        ContentSegment::Image {
            source: ImageSource::RemoteUrl(url.into()),
        }
    }

    pub fn mention(target_id: impl Into<String>) -> Self {
        ContentSegment::Mention {
            target_id: target_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub images_enabled: bool,
    pub allow_remote_images: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            images_enabled: true,
            allow_remote_images: true,
        }
    }
}

fn has_remote_scheme(token: &str) -> bool {
    let lower = token.get(..8).unwrap_or(token).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn classify_image(token: &str, options: RenderOptions) -> Option<ImageSource> {
    if has_remote_scheme(token) {
        options
            .allow_remote_images
            .then(|| ImageSource::RemoteUrl(token.to_string()))
    } else {
        Some(ImageSource::LocalPath(token.to_string()))
    }
}

fn bare_image(text: &str, options: RenderOptions) -> Option<ImageSource> {
    // A marker-prefixed token is a marker line, not a path containing the marker.
    if !BARE_IMAGE_RE.is_match(text) || MARKER_LINE_RE.is_match(text) {
        return None;
    }
    classify_image(text, options)
}

fn render_line(line: &str, options: RenderOptions, chain: &mut Vec<ContentSegment>) {
    if options.images_enabled {
        if let Some(caps) = MARKER_LINE_RE.captures(line) {
            if let Some(source) = classify_image(&caps[1], options) {
                chain.push(ContentSegment::Image { source });
                return;
            }
        }

        if let Some(caps) = MIXED_LINE_RE.captures(line) {
            let leading = caps[1].trim();
            if !leading.is_empty() {
                if let Some(source) = classify_image(&caps[2], options) {
                    chain.push(ContentSegment::text(leading));
                    chain.push(ContentSegment::Image { source });
                    return;
                }
            }
        }
    }

    if !line.trim().is_empty() {
        chain.push(ContentSegment::text(format!("{}\n", line)));
    }
}

/// Renders raw reply text into a content chain.
///
/// A reply that is a single image path or URL becomes one image segment. Otherwise
/// each line becomes an image (`[img]token` / `[图片]token`), a text+image pair
/// (`text [img]token`), or a text segment ending in `\n`. Blank lines are skipped and
/// the last text segment loses its trailing newline. Never fails: anything that is
/// not a recognizable image falls back to text.
pub fn render_chain(raw: &str, options: RenderOptions) -> Vec<ContentSegment> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if options.images_enabled {
        if let Some(source) = bare_image(trimmed, options) {
            return vec![ContentSegment::Image { source }];
        }
    }

    let mut chain = Vec::new();
    for line in trimmed.split('\n') {
        render_line(line.trim_end(), options, &mut chain);
    }

    if let Some(ContentSegment::Text { text }) = chain.last_mut() {
        if text.ends_with('\n') {
            text.pop();
        }
    }

    chain
}

/// Flattens a chain into a single human-readable string, mostly for terminals and logs.
pub fn describe_chain(chain: &[ContentSegment]) -> String {
    let mut out = String::new();
    for segment in chain {
        match segment {
            ContentSegment::Text { text } => out.push_str(text),
            ContentSegment::Image { source } => {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                let kind = if source.is_remote() { "url" } else { "file" };
                out.push_str(&format!("[image {}: {}]\n", kind, source.as_str()));
            }
            ContentSegment::Mention { target_id } => {
                out.push_str(&format!("@{} ", target_id));
            }
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::{describe_chain, render_chain, ContentSegment, ImageSource, RenderOptions};

    fn render(raw: &str) -> Vec<ContentSegment> {
        render_chain(raw, RenderOptions::default())
    }

    fn local_only() -> RenderOptions {
        RenderOptions {
            images_enabled: true,
            allow_remote_images: false,
        }
    }

    #[test]
    fn empty_and_whitespace_input_yield_no_segments() {
        assert!(render("").is_empty());
        assert!(render("  \n\t \n").is_empty());
    }

    #[test]
    fn plain_text_is_single_segment() {
        assert_eq!(render("hello"), vec![ContentSegment::text("hello")]);
    }

    #[test]
    fn bare_local_image_reference() {
        assert_eq!(render("pic.png"), vec![ContentSegment::local_image("pic.png")]);
        assert_eq!(
            render("  images/Cat.JPEG \n"),
            vec![ContentSegment::local_image("images/Cat.JPEG")]
        );
    }

    #[test]
    fn single_marker_line_is_not_a_bare_path() {
        assert_eq!(
            render("[图片]cat.jpg"),
            vec![ContentSegment::local_image("cat.jpg")]
        );
    }

    #[test]
    fn bare_remote_image_reference() {
        assert_eq!(
            render("http://x.com/a.jpg"),
            vec![ContentSegment::remote_image("http://x.com/a.jpg")]
        );
        assert_eq!(
            render("HTTPS://x.com/b.webp"),
            vec![ContentSegment::remote_image("HTTPS://x.com/b.webp")]
        );
    }

    #[test]
    fn bare_remote_image_is_text_when_network_images_disallowed() {
        assert_eq!(
            render_chain("http://x.com/a.jpg", local_only()),
            vec![ContentSegment::text("http://x.com/a.jpg")]
        );
    }

    #[test]
    fn unknown_extension_is_not_a_bare_image() {
        assert_eq!(render("notes.txt"), vec![ContentSegment::text("notes.txt")]);
    }

    #[test]
    fn marker_line_between_text_lines() {
        assert_eq!(
            render("line1\n[img]a.png\nline2"),
            vec![
                ContentSegment::text("line1\n"),
                ContentSegment::local_image("a.png"),
                ContentSegment::text("line2"),
            ]
        );
    }

    #[test]
    fn mixed_line_with_leading_text() {
        assert_eq!(
            render("hi [图片]b.jpg"),
            vec![ContentSegment::text("hi"), ContentSegment::local_image("b.jpg")]
        );
    }

    #[test]
    fn marker_is_case_insensitive_and_allows_indent() {
        assert_eq!(
            render("top\n   [IMG]https://cdn.example/p"),
            vec![
                ContentSegment::text("top\n"),
                ContentSegment::remote_image("https://cdn.example/p"),
            ]
        );
    }

    #[test]
    fn multiple_marker_lines_are_independent_images() {
        assert_eq!(
            render("[img]a.png\n[图片]b.gif\n[img]http://h/c.bmp"),
            vec![
                ContentSegment::local_image("a.png"),
                ContentSegment::local_image("b.gif"),
                ContentSegment::remote_image("http://h/c.bmp"),
            ]
        );
    }

    #[test]
    fn text_after_inline_marker_is_dropped() {
        assert_eq!(
            render("look [img]a.png isn't it nice"),
            vec![ContentSegment::text("look"), ContentSegment::local_image("a.png")]
        );
    }

    #[test]
    fn marker_followed_by_text_without_leading_text_stays_text() {
        assert_eq!(
            render("[img]a.png trailing words"),
            vec![ContentSegment::text("[img]a.png trailing words")]
        );
    }

    #[test]
    fn marker_without_token_stays_text() {
        assert_eq!(
            render("first\n[img] spaced.png"),
            vec![
                ContentSegment::text("first\n"),
                ContentSegment::text("[img] spaced.png"),
            ]
        );
    }

    #[test]
    fn trailing_and_inner_blank_lines_produce_no_segments() {
        assert_eq!(
            render("a\n\n   \nb\n\n\n"),
            vec![ContentSegment::text("a\n"), ContentSegment::text("b")]
        );
    }

    #[test]
    fn leading_whitespace_inside_block_is_preserved() {
        assert_eq!(
            render("menu:\n  - tea  \n  - coffee"),
            vec![
                ContentSegment::text("menu:\n"),
                ContentSegment::text("  - tea\n"),
                ContentSegment::text("  - coffee"),
            ]
        );
    }

    #[test]
    fn last_text_keeps_newline_when_followed_by_image() {
        let chain = render("caption\n[img]a.png");
        assert_eq!(
            chain,
            vec![
                ContentSegment::text("caption\n"),
                ContentSegment::local_image("a.png"),
            ]
        );
    }

    #[test]
    fn remote_marker_degrades_to_text_when_disallowed() {
        assert_eq!(
            render_chain("see\n[img]http://x.com/a.png", local_only()),
            vec![
                ContentSegment::text("see\n"),
                ContentSegment::text("[img]http://x.com/a.png"),
            ]
        );
    }

    #[test]
    fn disabled_images_render_everything_as_text() {
        let options = RenderOptions {
            images_enabled: false,
            allow_remote_images: true,
        };
        assert_eq!(
            render_chain("pic.png", options),
            vec![ContentSegment::text("pic.png")]
        );
        assert_eq!(
            render_chain("hi [img]a.png", options),
            vec![ContentSegment::text("hi [img]a.png")]
        );
    }

    #[test]
    fn rendering_is_deterministic() {
        let raw = "a\n[img]x.png\nb [图片]y.jpg\n";
        assert_eq!(render(raw), render(raw));
    }

    #[test]
    fn segments_serialize_with_type_tags() {
        let chain = vec![
            ContentSegment::mention("42"),
            ContentSegment::text("hi"),
            ContentSegment::remote_image("https://x/a.png"),
        ];
        let json = serde_json::to_value(&chain).expect("serialize");
        assert_eq!(json[0]["type"], "mention");
        assert_eq!(json[0]["target_id"], "42");
        assert_eq!(json[1]["type"], "text");
        assert_eq!(json[2]["source"]["kind"], "remote_url");
        assert_eq!(json[2]["source"]["value"], "https://x/a.png");

        let back: Vec<ContentSegment> = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, chain);
    }

    #[test]
    fn describe_chain_flattens_for_terminals() {
        let chain = vec![
            ContentSegment::mention("7"),
            ContentSegment::text("hello"),
            ContentSegment::Image {
                source: ImageSource::LocalPath("a.png".to_string()),
            },
        ];
        assert_eq!(describe_chain(&chain), "@7 hello\n[image file: a.png]");
    }
}
