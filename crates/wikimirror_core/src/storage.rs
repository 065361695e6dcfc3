//! Storage-format quirks handled at the string level around the HTML codec.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::html::escape_text;

static CDATA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>").expect("cdata pattern"));

static LAYOUT_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"</?ac:layout(?:-section|-cell)?(?:\s[^>]*)?>").expect("layout tag pattern")
});

static PLAIN_TEXT_BODY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<ac:plain-text-body>(.*?)</ac:plain-text-body>")
        .expect("plain text body pattern")
});

/// Prepare raw storage markup for the HTML parser.
///
/// CDATA sections become escaped text and page layout wrappers are removed so
/// their content reads as ordinary top-level blocks.
pub fn preprocess(raw: &str) -> String {
    let without_cdata = CDATA_RE.replace_all(raw, |caps: &Captures<'_>| escape_text(&caps[1]));
    LAYOUT_TAG_RE.replace_all(&without_cdata, "").into_owned()
}

/// Put plain-text macro bodies back into CDATA sections.
pub fn postprocess(markup: &str) -> String {
    PLAIN_TEXT_BODY_RE
        .replace_all(markup, |caps: &Captures<'_>| {
            let text = unescape_text(&caps[1]);
            format!(
                "<ac:plain-text-body><![CDATA[{}]]></ac:plain-text-body>",
                text.replace("]]>", "]]]]><![CDATA[>")
            )
        })
        .into_owned()
}

fn unescape_text(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_escapes_cdata_content() {
        let raw = "<ac:plain-text-body><![CDATA[if a < b && c]]></ac:plain-text-body>";
        assert_eq!(
            preprocess(raw),
            "<ac:plain-text-body>if a &lt; b &amp;&amp; c</ac:plain-text-body>"
        );
    }

    #[test]
    fn preprocess_joins_split_cdata_sections() {
        let raw = "<![CDATA[a]]]]><![CDATA[>b]]>";
        assert_eq!(preprocess(raw), "a]]&gt;b");
    }

    #[test]
    fn preprocess_strips_layout_wrappers() {
        let raw = r#"<ac:layout><ac:layout-section ac:type="two_equal"><ac:layout-cell><p>left</p></ac:layout-cell><ac:layout-cell><p>right</p></ac:layout-cell></ac:layout-section></ac:layout>"#;
        assert_eq!(preprocess(raw), "<p>left</p><p>right</p>");
    }

    #[test]
    fn postprocess_restores_cdata_and_splits_terminator() {
        let markup = "<ac:plain-text-body>x &lt; y ]]&gt; z</ac:plain-text-body>";
        assert_eq!(
            postprocess(markup),
            "<ac:plain-text-body><![CDATA[x < y ]]]]><![CDATA[> z]]></ac:plain-text-body>"
        );
        assert_eq!(preprocess(&postprocess(markup)), markup);
    }
}
