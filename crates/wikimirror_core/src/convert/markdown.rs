//! AST <-> Markdown parse tree.
//!
//! Panels travel as GFM alert blockquotes. Macros Markdown cannot express are
//! degraded to their storage-format HTML and carried as raw blocks, which read
//! back as [`BlockNode::Unsupported`].

use crate::ast::{
    BlockNode, Document, InlineNode, ListItem, MacroNode, MacroParameter, PanelType, TableCell,
    TableRow, normalize_inlines,
};
use crate::convert;
use crate::html;
use crate::markdown::{MdAlert, MdBlock, MdInline, MdListItem, MdRoot, MdTableRow};

pub fn document_to_tree(document: &Document) -> MdRoot {
    MdRoot {
        children: blocks_to_markdown(&document.children),
    }
}

pub fn tree_to_document(root: &MdRoot) -> Document {
    Document::new(blocks_from_markdown(&root.children))
}

fn blocks_to_markdown(blocks: &[BlockNode]) -> Vec<MdBlock> {
    blocks.iter().map(block_to_markdown).collect()
}

fn block_to_markdown(block: &BlockNode) -> MdBlock {
    match block {
        BlockNode::Heading { level, children } => MdBlock::Heading {
            depth: *level,
            children: inlines_to_markdown(children),
        },
        BlockNode::Paragraph { children } => MdBlock::Paragraph {
            children: inlines_to_markdown(children),
        },
        BlockNode::CodeBlock { code, language } => MdBlock::Code {
            value: code.clone(),
            lang: language.clone(),
        },
        BlockNode::ThematicBreak => MdBlock::ThematicBreak,
        BlockNode::BlockQuote { children } => MdBlock::Blockquote {
            alert: None,
            children: blocks_to_markdown(children),
        },
        BlockNode::List { ordered, items } => MdBlock::List {
            ordered: *ordered,
            items: items
                .iter()
                .map(|item| MdListItem {
                    children: blocks_to_markdown(&item.children),
                })
                .collect(),
        },
        BlockNode::Table { header, rows } => {
            let columns = rows
                .iter()
                .map(|row| row.cells.len())
                .chain(header.iter().map(|row| row.cells.len()))
                .max()
                .unwrap_or(0);
            let header = match header {
                Some(row) => row_to_markdown(row),
                None => MdTableRow {
                    cells: vec![Vec::new(); columns],
                },
            };
            MdBlock::Table {
                header,
                rows: rows.iter().map(row_to_markdown).collect(),
            }
        }
        BlockNode::Macro(node) => macro_to_markdown(node),
        BlockNode::Unsupported { raw } => MdBlock::Html { value: raw.clone() },
    }
}

fn row_to_markdown(row: &TableRow) -> MdTableRow {
    MdTableRow {
        cells: row
            .cells
            .iter()
            .map(|cell| inlines_to_markdown(&cell.children))
            .collect(),
    }
}

fn macro_to_markdown(node: &MacroNode) -> MdBlock {
    if node.is_markdown_representable() {
        return MdBlock::Blockquote {
            alert: Some(MdAlert {
                kind: node.panel_type.name().to_string(),
                title: node.title().map(str::to_string),
            }),
            children: blocks_to_markdown(&node.children),
        };
    }
    let storage = convert::html::document_to_tree(&Document::new(vec![BlockNode::Macro(
        node.clone(),
    )]));
    MdBlock::Html {
        value: html::encode(&storage),
    }
}

fn inlines_to_markdown(nodes: &[InlineNode]) -> Vec<MdInline> {
    nodes.iter().map(inline_to_markdown).collect()
}

fn inline_to_markdown(node: &InlineNode) -> MdInline {
    match node {
        InlineNode::Text { value } => MdInline::Text {
            value: value.clone(),
        },
        InlineNode::Strong { children } => MdInline::Strong {
            children: inlines_to_markdown(children),
        },
        InlineNode::Emphasis { children } => MdInline::Emphasis {
            children: inlines_to_markdown(children),
        },
        InlineNode::Strikethrough { children } => MdInline::Delete {
            children: inlines_to_markdown(children),
        },
        InlineNode::InlineCode { value } => MdInline::InlineCode {
            value: value.clone(),
        },
        InlineNode::Link { href, children } => MdInline::Link {
            url: href.clone(),
            children: inlines_to_markdown(children),
        },
        InlineNode::Image { src, alt } => MdInline::Image {
            url: src.clone(),
            alt: alt.clone(),
        },
        InlineNode::Break => MdInline::Break,
    }
}

fn blocks_from_markdown(blocks: &[MdBlock]) -> Vec<BlockNode> {
    let mut output = Vec::with_capacity(blocks.len());
    for block in blocks {
        block_from_markdown(block, &mut output);
    }
    output
}

fn block_from_markdown(block: &MdBlock, output: &mut Vec<BlockNode>) {
    match block {
        MdBlock::Heading { depth, children } => output.push(BlockNode::Heading {
            level: (*depth).clamp(1, 6),
            children: inlines_from_markdown(children),
        }),
        MdBlock::Paragraph { children } => {
            let children = inlines_from_markdown(children);
            if !children.is_empty() {
                output.push(BlockNode::Paragraph { children });
            }
        }
        MdBlock::Code { value, lang } => output.push(BlockNode::CodeBlock {
            code: value.clone(),
            language: lang.clone(),
        }),
        MdBlock::ThematicBreak => output.push(BlockNode::ThematicBreak),
        MdBlock::List { ordered, items } => output.push(BlockNode::List {
            ordered: *ordered,
            items: items
                .iter()
                .map(|item| ListItem {
                    children: blocks_from_markdown(&item.children),
                })
                .collect(),
        }),
        MdBlock::Blockquote { alert, children } => {
            let children = blocks_from_markdown(children);
            output.push(match alert {
                Some(alert) => alert_to_block(alert, children),
                None => BlockNode::BlockQuote { children },
            });
        }
        MdBlock::Table { header, rows } => {
            let header_empty = header.cells.iter().all(|cell| cell.is_empty());
            output.push(BlockNode::Table {
                header: (!header_empty).then(|| row_from_markdown(header, true)),
                rows: rows.iter().map(|row| row_from_markdown(row, false)).collect(),
            });
        }
        MdBlock::Html { value } => output.push(BlockNode::Unsupported { raw: value.clone() }),
    }
}

fn alert_to_block(alert: &MdAlert, children: Vec<BlockNode>) -> BlockNode {
    let panel_type = match alert.kind.as_str() {
        "important" => PanelType::Info,
        "caution" => PanelType::Error,
        other => PanelType::from_name(other),
    };
    if !panel_type.is_known() {
        // Keep the marker as text so an unknown alert kind survives as a quote.
        let mut marker = format!("[!{}]", alert.kind.to_ascii_uppercase());
        if let Some(title) = &alert.title {
            marker.push(' ');
            marker.push_str(title);
        }
        let mut quoted = vec![BlockNode::Paragraph {
            children: vec![InlineNode::text(marker)],
        }];
        quoted.extend(children);
        return BlockNode::BlockQuote { children: quoted };
    }
    let parameters = alert
        .title
        .iter()
        .map(|title| MacroParameter {
            name: "title".to_string(),
            value: title.clone(),
        })
        .collect();
    BlockNode::Macro(MacroNode {
        panel_type,
        parameters,
        children,
    })
}

fn row_from_markdown(row: &MdTableRow, is_header: bool) -> TableRow {
    TableRow {
        cells: row
            .cells
            .iter()
            .map(|cell| TableCell {
                is_header,
                children: inlines_from_markdown(cell),
            })
            .collect(),
    }
}

fn inlines_from_markdown(nodes: &[MdInline]) -> Vec<InlineNode> {
    normalize_inlines(nodes.iter().map(inline_from_markdown).collect())
}

fn inline_from_markdown(node: &MdInline) -> InlineNode {
    match node {
        MdInline::Text { value } => InlineNode::text(value.clone()),
        MdInline::Strong { children } => InlineNode::Strong {
            children: inlines_from_markdown(children),
        },
        MdInline::Emphasis { children } => InlineNode::Emphasis {
            children: inlines_from_markdown(children),
        },
        MdInline::Delete { children } => InlineNode::Strikethrough {
            children: inlines_from_markdown(children),
        },
        MdInline::InlineCode { value } => InlineNode::InlineCode {
            value: value.clone(),
        },
        MdInline::Link { url, children } => InlineNode::Link {
            href: url.clone(),
            children: inlines_from_markdown(children),
        },
        MdInline::Image { url, alt } => InlineNode::Image {
            src: url.clone(),
            alt: alt.clone(),
        },
        MdInline::Break => InlineNode::Break,
    }
}
