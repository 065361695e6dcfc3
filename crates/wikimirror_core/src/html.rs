//! HTML string <-> parse tree.
//!
//! Decoding runs html5ever over the input and copies the resulting rcdom into
//! an owned [`HtmlRoot`]. Fragments are parsed inside a synthetic body; input
//! that carries its own doctype or `<html>` element is parsed as a document.
//! Encoding is hand written so that namespaced storage-format elements
//! (`ac:*`, `ri:*`) keep the XHTML shape the remote wiki expects.

use std::sync::LazyLock;

use html5ever::tendril::TendrilSink;
use html5ever::tree_builder::TreeBuilderOpts;
use html5ever::{ParseOpts, parse_document};
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use regex::{Captures, Regex};

use crate::error::ParseError;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

static SELF_CLOSING_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([A-Za-z][A-Za-z0-9:_.-]*)(\s[^<>]*?)?\s*/>").expect("self-closing tag pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HtmlRoot {
    pub children: Vec<HtmlNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtmlNode {
    Text {
        value: String,
    },
    Element {
        tag_name: String,
        properties: Properties,
        children: Vec<HtmlNode>,
    },
    Comment {
        value: String,
    },
    Doctype {
        name: String,
    },
}

impl HtmlNode {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text {
            value: value.into(),
        }
    }

    pub fn element(tag_name: impl Into<String>, children: Vec<HtmlNode>) -> Self {
        Self::Element {
            tag_name: tag_name.into(),
            properties: Properties::default(),
            children,
        }
    }

    pub fn element_with(
        tag_name: impl Into<String>,
        properties: Properties,
        children: Vec<HtmlNode>,
    ) -> Self {
        Self::Element {
            tag_name: tag_name.into(),
            properties,
            children,
        }
    }
}

/// Attribute map that keeps insertion order so encoding is stable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Properties(Vec<(String, String)>);

impl Properties {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.0.iter_mut().find(|(key, _)| *key == name) {
            slot.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn decode(html: &str) -> Result<HtmlRoot, ParseError> {
    check_terminated(html)?;
    let expanded = expand_self_closing_tags(html);

    let root = if is_full_document(&expanded) {
        let dom = parse_html(&expanded);
        HtmlRoot {
            children: convert_children(&dom.document),
        }
    } else {
        let wrapped = format!("<!DOCTYPE html><html><head></head><body>{expanded}</body></html>");
        let dom = parse_html(&wrapped);
        let body = find_element(&dom.document, "body");
        HtmlRoot {
            children: body.map(|body| convert_children(&body)).unwrap_or_default(),
        }
    };

    if root.children.is_empty() && !html.trim().is_empty() {
        return Err(ParseError::Html(
            "input produced no content (is it an HTML fragment?)".to_string(),
        ));
    }
    Ok(root)
}

pub fn encode(root: &HtmlRoot) -> String {
    let mut output = String::new();
    for node in &root.children {
        write_node(node, false, &mut output);
    }
    output
}

/// Encode a single node, used where one element has to be captured verbatim.
pub fn encode_node(node: &HtmlNode) -> String {
    let mut output = String::new();
    write_node(node, false, &mut output);
    output
}

pub fn is_void_element(tag_name: &str) -> bool {
    VOID_ELEMENTS.contains(&tag_name)
}

pub fn escape_text(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            _ => output.push(ch),
        }
    }
    output
}

fn escape_attribute(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => output.push_str("&amp;"),
            '"' => output.push_str("&quot;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            _ => output.push(ch),
        }
    }
    output
}

fn write_node(node: &HtmlNode, raw_text: bool, output: &mut String) {
    match node {
        HtmlNode::Text { value } => {
            if raw_text {
                output.push_str(value);
            } else {
                output.push_str(&escape_text(value));
            }
        }
        HtmlNode::Comment { value } => {
            output.push_str("<!--");
            output.push_str(value);
            output.push_str("-->");
        }
        HtmlNode::Doctype { name } => {
            output.push_str("<!DOCTYPE ");
            output.push_str(name);
            output.push('>');
        }
        HtmlNode::Element {
            tag_name,
            properties,
            children,
        } => {
            output.push('<');
            output.push_str(tag_name);
            for (key, value) in properties.iter() {
                output.push(' ');
                output.push_str(key);
                output.push_str("=\"");
                output.push_str(&escape_attribute(value));
                output.push('"');
            }
            if is_void_element(tag_name) || (children.is_empty() && tag_name.contains(':')) {
                output.push_str(" />");
                return;
            }
            output.push('>');
            let raw = RAW_TEXT_ELEMENTS.contains(&tag_name.as_str());
            for child in children {
                write_node(child, raw, output);
            }
            output.push_str("</");
            output.push_str(tag_name);
            output.push('>');
        }
    }
}

fn parse_html(html: &str) -> RcDom {
    let opts = ParseOpts {
        tree_builder: TreeBuilderOpts {
            drop_doctype: false,
            ..Default::default()
        },
        ..Default::default()
    };
    parse_document(RcDom::default(), opts)
        .from_utf8()
        .one(html.as_bytes())
}

fn is_full_document(html: &str) -> bool {
    let head = html.trim_start().to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html")
}

/// XHTML-style `<tag/>` on a non-void element would otherwise swallow its siblings.
fn expand_self_closing_tags(html: &str) -> String {
    SELF_CLOSING_TAG_RE
        .replace_all(html, |caps: &Captures<'_>| {
            let tag = &caps[1];
            let attrs = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            if is_void_element(&tag.to_ascii_lowercase()) {
                format!("<{tag}{attrs} />")
            } else {
                format!("<{tag}{attrs}></{tag}>")
            }
        })
        .into_owned()
}

/// html5ever recovers from truncated markup by dropping it; report that instead.
fn check_terminated(html: &str) -> Result<(), ParseError> {
    if let Some(start) = html.rfind("<!--")
        && !html[start + 4..].contains("-->")
    {
        return Err(ParseError::Html(format!(
            "unterminated comment starting at byte {start}"
        )));
    }
    if let Some(start) = html.rfind('<') {
        let rest = &html[start + 1..];
        let opens_tag = rest
            .chars()
            .next()
            .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '/' || ch == '!');
        if opens_tag && !rest.contains('>') {
            return Err(ParseError::Html(format!(
                "unterminated tag starting at byte {start}"
            )));
        }
    }
    Ok(())
}

fn find_element(handle: &Handle, tag_name: &str) -> Option<Handle> {
    if let NodeData::Element { name, .. } = &handle.data
        && name.local.as_ref() == tag_name
    {
        return Some(handle.clone());
    }
    for child in handle.children.borrow().iter() {
        if let Some(found) = find_element(child, tag_name) {
            return Some(found);
        }
    }
    None
}

fn convert_children(handle: &Handle) -> Vec<HtmlNode> {
    handle
        .children
        .borrow()
        .iter()
        .filter_map(convert_node)
        .collect()
}

fn convert_node(handle: &Handle) -> Option<HtmlNode> {
    match &handle.data {
        NodeData::Text { contents } => Some(HtmlNode::Text {
            value: contents.borrow().to_string(),
        }),
        NodeData::Comment { contents } => Some(HtmlNode::Comment {
            value: contents.to_string(),
        }),
        NodeData::Doctype { name, .. } => Some(HtmlNode::Doctype {
            name: name.to_string(),
        }),
        NodeData::Element { name, attrs, .. } => {
            let mut properties = Properties::default();
            for attr in attrs.borrow().iter() {
                let key = match &attr.name.prefix {
                    Some(prefix) => format!("{}:{}", prefix.as_ref(), attr.name.local.as_ref()),
                    None => attr.name.local.to_string(),
                };
                properties.insert(key, attr.value.to_string());
            }
            Some(HtmlNode::Element {
                tag_name: name.local.to_string(),
                properties,
                children: convert_children(handle),
            })
        }
        NodeData::Document | NodeData::ProcessingInstruction { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_fragment_yields_body_children() {
        let root = decode("<p>Hello <strong>world</strong></p><hr>").expect("decode");
        assert_eq!(
            root.children,
            vec![
                HtmlNode::element(
                    "p",
                    vec![
                        HtmlNode::text("Hello "),
                        HtmlNode::element("strong", vec![HtmlNode::text("world")]),
                    ]
                ),
                HtmlNode::element("hr", vec![]),
            ]
        );
    }

    #[test]
    fn decode_keeps_namespaced_elements_and_attribute_order() {
        let root = decode(
            r#"<ac:structured-macro ac:name="info" ac:schema-version="1"><ac:rich-text-body><p>x</p></ac:rich-text-body></ac:structured-macro>"#,
        )
        .expect("decode");
        let HtmlNode::Element {
            tag_name,
            properties,
            children,
        } = &root.children[0]
        else {
            panic!("expected element");
        };
        assert_eq!(tag_name, "ac:structured-macro");
        assert_eq!(
            properties.iter().collect::<Vec<_>>(),
            vec![("ac:name", "info"), ("ac:schema-version", "1")]
        );
        assert_eq!(children.len(), 1);
    }

    #[test]
    fn decode_honours_self_closing_namespaced_elements() {
        let root = decode(r#"<p><ac:link><ri:page ri:content-title="Home" /></ac:link> after</p>"#)
            .expect("decode");
        let HtmlNode::Element { children, .. } = &root.children[0] else {
            panic!("expected paragraph");
        };
        assert_eq!(children.len(), 2);
        assert_eq!(children[1], HtmlNode::text(" after"));
    }

    #[test]
    fn decode_full_document_keeps_doctype() {
        let root = decode("<!DOCTYPE html><html><head></head><body><p>x</p></body></html>")
            .expect("decode");
        assert!(matches!(root.children[0], HtmlNode::Doctype { ref name } if name == "html"));
    }

    #[test]
    fn decode_rejects_truncated_markup() {
        assert!(decode("<p>text</p><strong class=\"a").is_err());
        assert!(decode("<p>text</p><!-- never closed").is_err());
        assert!(decode("<head></head>").is_err());
        assert!(decode("a < b").is_ok());
        assert!(decode("   ").is_ok());
    }

    #[test]
    fn encode_writes_void_and_empty_namespaced_elements_self_closing() {
        let root = HtmlRoot {
            children: vec![
                HtmlNode::element("p", vec![HtmlNode::text("a"), HtmlNode::element("br", vec![])]),
                HtmlNode::element_with(
                    "ri:page",
                    Properties::default().with("ri:content-title", "A \"quoted\" & title"),
                    vec![],
                ),
            ],
        };
        assert_eq!(
            encode(&root),
            r#"<p>a<br /></p><ri:page ri:content-title="A &quot;quoted&quot; &amp; title" />"#
        );
    }

    #[test]
    fn encode_escapes_text() {
        let root = HtmlRoot {
            children: vec![HtmlNode::element(
                "p",
                vec![HtmlNode::text("1 < 2 && 3 > 2")],
            )],
        };
        assert_eq!(encode(&root), "<p>1 &lt; 2 &amp;&amp; 3 &gt; 2</p>");
    }

    #[test]
    fn tree_round_trips_through_encode_and_decode() {
        let root = HtmlRoot {
            children: vec![
                HtmlNode::element_with(
                    "h2",
                    Properties::default().with("id", "intro"),
                    vec![HtmlNode::text("Intro & setup")],
                ),
                HtmlNode::element(
                    "ul",
                    vec![HtmlNode::element(
                        "li",
                        vec![HtmlNode::element(
                            "p",
                            vec![
                                HtmlNode::element_with(
                                    "a",
                                    Properties::default().with("href", "https://example.com/?a=1&b=2"),
                                    vec![HtmlNode::text("link")],
                                ),
                                HtmlNode::element("br", vec![]),
                            ],
                        )],
                    )],
                ),
                HtmlNode::Comment {
                    value: " note ".to_string(),
                },
                HtmlNode::element_with(
                    "ac:structured-macro",
                    Properties::default().with("ac:name", "toc"),
                    vec![HtmlNode::element_with(
                        "ac:parameter",
                        Properties::default().with("ac:name", "maxLevel"),
                        vec![HtmlNode::text("3")],
                    )],
                ),
                HtmlNode::element_with(
                    "ri:attachment",
                    Properties::default().with("ri:filename", "a.png"),
                    vec![],
                ),
            ],
        };
        let encoded = encode(&root);
        assert_eq!(decode(&encoded).expect("decode"), root);
    }

    #[test]
    fn string_round_trip_is_stable_for_well_formed_input() {
        let source = r#"<h1>Title</h1><p>Some <em>text</em> and <code>code</code>.</p><table><tbody><tr><td><p>a</p></td></tr></tbody></table>"#;
        let once = encode(&decode(source).expect("decode"));
        assert_eq!(once, source);
    }
}
