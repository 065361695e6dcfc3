//! Whole-document pipelines between remote storage markup, the AST and Markdown.

use crate::ast::Document;
use crate::convert;
use crate::error::{ConversionError, ParseError};
use crate::{html, markdown, storage};

pub fn remote_markup_to_document(raw: &str) -> Result<Document, ParseError> {
    let prepared = storage::preprocess(raw);
    let tree = html::decode(&prepared)?;
    Ok(convert::html::tree_to_document(&tree))
}

pub fn document_to_remote_markup(document: &Document) -> Result<String, ConversionError> {
    document.validate()?;
    let tree = convert::html::document_to_tree(document);
    Ok(storage::postprocess(&html::encode(&tree)))
}

pub fn document_to_markdown(document: &Document) -> String {
    markdown::encode(&convert::markdown::document_to_tree(document))
}

pub fn markdown_to_document(source: &str) -> Document {
    convert::markdown::tree_to_document(&markdown::decode(source))
}

/// Markdown text for a remote page together with the document read back from it.
///
/// Hashing the re-read document puts remote content in the same space as local
/// files, so content Markdown cannot express does not show up as a change.
pub fn canonical_markdown(raw: &str) -> Result<(String, Document), ParseError> {
    let remote = remote_markup_to_document(raw)?;
    let text = document_to_markdown(&remote);
    let document = markdown_to_document(&text);
    Ok((text, document))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BlockNode, InlineNode, MacroNode, MacroParameter, PanelType};

    const PAGE: &str = concat!(
        "<h1>Release notes</h1>",
        "<p>Shipped <strong>v2</strong> with <a href=\"https://example.com\">docs</a>.</p>",
        "<ac:structured-macro ac:name=\"info\"><ac:parameter ac:name=\"title\">Heads up</ac:parameter>",
        "<ac:rich-text-body><p>Read this first.</p></ac:rich-text-body></ac:structured-macro>",
        "<ac:structured-macro ac:name=\"code\"><ac:parameter ac:name=\"language\">rust</ac:parameter>",
        "<ac:plain-text-body><![CDATA[fn main() { if a < b {} }]]></ac:plain-text-body></ac:structured-macro>",
        "<ac:structured-macro ac:name=\"toc\" />",
    );

    #[test]
    fn remote_markup_reads_into_document() {
        let document = remote_markup_to_document(PAGE).expect("decode page");
        assert_eq!(document.children.len(), 5);
        assert_eq!(
            document.children[2],
            BlockNode::Macro(MacroNode {
                panel_type: PanelType::Info,
                parameters: vec![MacroParameter {
                    name: "title".to_string(),
                    value: "Heads up".to_string(),
                }],
                children: vec![BlockNode::Paragraph {
                    children: vec![InlineNode::text("Read this first.")],
                }],
            })
        );
        assert_eq!(
            document.children[3],
            BlockNode::CodeBlock {
                code: "fn main() { if a < b {} }".to_string(),
                language: Some("rust".to_string()),
            }
        );
        assert!(matches!(document.children[4], BlockNode::Unsupported { .. }));
    }

    #[test]
    fn remote_pipeline_round_trips_through_markup() {
        let document = remote_markup_to_document(PAGE).expect("decode page");
        let markup = document_to_remote_markup(&document).expect("encode page");
        assert!(markup.contains("<![CDATA[fn main() { if a < b {} }]]>"));
        let reread = remote_markup_to_document(&markup).expect("decode again");
        assert_eq!(reread, document);
    }

    #[test]
    fn canonical_markdown_is_a_fixed_point() {
        let (text, document) = canonical_markdown(PAGE).expect("canonical markdown");
        assert!(text.starts_with("# Release notes\n"));
        assert!(text.contains("> [!INFO] Heads up"));
        assert_eq!(markdown_to_document(&document_to_markdown(&document)), document);
    }

    #[test]
    fn encoding_rejects_unknown_versions() {
        let document = Document {
            version: 7,
            children: Vec::new(),
        };
        assert_eq!(
            document_to_remote_markup(&document),
            Err(ConversionError::UnsupportedVersion {
                found: 7,
                expected: Document::CURRENT_VERSION,
            })
        );
    }
}
