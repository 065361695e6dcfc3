//! AST <-> HTML parse tree using the storage-format idioms of the remote wiki.

use crate::ast::{
    BlockNode, Document, InlineNode, ListItem, MacroNode, MacroParameter, PanelType, TableCell,
    TableRow, normalize_inlines,
};
use crate::html::{self, HtmlNode, HtmlRoot, Properties};

const MACRO_TAG: &str = "ac:structured-macro";

const TRANSPARENT_CONTAINERS: &[&str] = &[
    "html",
    "body",
    "div",
    "section",
    "article",
    "main",
    "header",
    "footer",
    "aside",
    "nav",
    "center",
    "figure",
    "ac:rich-text-body",
    "ac:layout",
    "ac:layout-section",
    "ac:layout-cell",
];

const METADATA_ELEMENTS: &[&str] = &["head", "title", "meta", "link", "base"];

const PHRASING_ELEMENTS: &[&str] = &[
    "a",
    "abbr",
    "b",
    "bdi",
    "bdo",
    "big",
    "br",
    "cite",
    "code",
    "del",
    "dfn",
    "em",
    "font",
    "i",
    "img",
    "ins",
    "kbd",
    "mark",
    "q",
    "s",
    "samp",
    "small",
    "span",
    "strike",
    "strong",
    "sub",
    "sup",
    "time",
    "tt",
    "u",
    "var",
    "ac:emoticon",
    "ac:image",
    "ac:inline-comment-marker",
    "ac:link",
    "ac:placeholder",
    "ri:user",
];

pub fn document_to_tree(document: &Document) -> HtmlRoot {
    HtmlRoot {
        children: blocks_to_html(&document.children),
    }
}

fn blocks_to_html(blocks: &[BlockNode]) -> Vec<HtmlNode> {
    let mut output = Vec::with_capacity(blocks.len());
    for block in blocks {
        block_to_html(block, &mut output);
    }
    output
}

fn block_to_html(block: &BlockNode, output: &mut Vec<HtmlNode>) {
    match block {
        BlockNode::Heading { level, children } => {
            let level = (*level).clamp(1, 6);
            output.push(HtmlNode::element(
                format!("h{level}"),
                inlines_to_html(children),
            ));
        }
        BlockNode::Paragraph { children } => {
            output.push(HtmlNode::element("p", inlines_to_html(children)));
        }
        BlockNode::CodeBlock { code, language } => {
            let mut children = Vec::new();
            if let Some(language) = language {
                children.push(macro_parameter("language", language));
            }
            children.push(HtmlNode::element(
                "ac:plain-text-body",
                vec![HtmlNode::text(code.clone())],
            ));
            output.push(HtmlNode::element_with(
                MACRO_TAG,
                Properties::default().with("ac:name", "code"),
                children,
            ));
        }
        BlockNode::ThematicBreak => output.push(HtmlNode::element("hr", Vec::new())),
        BlockNode::BlockQuote { children } => {
            output.push(HtmlNode::element("blockquote", blocks_to_html(children)));
        }
        BlockNode::List { ordered, items } => {
            let tag = if *ordered { "ol" } else { "ul" };
            let items = items
                .iter()
                .map(|item| HtmlNode::element("li", blocks_to_html(&item.children)))
                .collect();
            output.push(HtmlNode::element(tag, items));
        }
        BlockNode::Table { header, rows } => {
            let mut body = Vec::with_capacity(rows.len() + 1);
            if let Some(header) = header {
                body.push(row_to_html(header, true));
            }
            for row in rows {
                body.push(row_to_html(row, false));
            }
            output.push(HtmlNode::element(
                "table",
                vec![HtmlNode::element("tbody", body)],
            ));
        }
        BlockNode::Macro(node) => output.push(macro_to_html(node)),
        BlockNode::Unsupported { raw } => output.extend(unsupported_to_html(raw)),
    }
}

fn row_to_html(row: &TableRow, header: bool) -> HtmlNode {
    let cells = row
        .cells
        .iter()
        .map(|cell| {
            let tag = if header || cell.is_header { "th" } else { "td" };
            HtmlNode::element(
                tag,
                vec![HtmlNode::element("p", inlines_to_html(&cell.children))],
            )
        })
        .collect();
    HtmlNode::element("tr", cells)
}

fn macro_to_html(node: &MacroNode) -> HtmlNode {
    let mut children: Vec<HtmlNode> = node
        .parameters
        .iter()
        .map(|parameter| macro_parameter(&parameter.name, &parameter.value))
        .collect();
    children.push(HtmlNode::element(
        "ac:rich-text-body",
        blocks_to_html(&node.children),
    ));
    HtmlNode::element_with(
        MACRO_TAG,
        Properties::default().with("ac:name", node.panel_type.name()),
        children,
    )
}

fn macro_parameter(name: &str, value: &str) -> HtmlNode {
    HtmlNode::element_with(
        "ac:parameter",
        Properties::default().with("ac:name", name),
        vec![HtmlNode::text(value)],
    )
}

fn unsupported_to_html(raw: &str) -> Vec<HtmlNode> {
    if let Ok(root) = html::decode(raw)
        && root
            .children
            .iter()
            .any(|node| matches!(node, HtmlNode::Element { .. }))
    {
        return root.children;
    }
    vec![HtmlNode::element("p", vec![HtmlNode::text(raw)])]
}

fn inlines_to_html(nodes: &[InlineNode]) -> Vec<HtmlNode> {
    nodes.iter().map(inline_to_html).collect()
}

fn inline_to_html(node: &InlineNode) -> HtmlNode {
    match node {
        InlineNode::Text { value } => HtmlNode::text(value.clone()),
        InlineNode::Strong { children } => HtmlNode::element("strong", inlines_to_html(children)),
        InlineNode::Emphasis { children } => HtmlNode::element("em", inlines_to_html(children)),
        InlineNode::Strikethrough { children } => HtmlNode::element("s", inlines_to_html(children)),
        InlineNode::InlineCode { value } => {
            HtmlNode::element("code", vec![HtmlNode::text(value.clone())])
        }
        InlineNode::Link { href, children } => HtmlNode::element_with(
            "a",
            Properties::default().with("href", href.clone()),
            inlines_to_html(children),
        ),
        InlineNode::Image { src, alt } => {
            let mut properties = Properties::default();
            if !alt.is_empty() {
                properties.insert("ac:alt", alt.clone());
            }
            let resource = if is_external_url(src) {
                HtmlNode::element_with(
                    "ri:url",
                    Properties::default().with("ri:value", src.clone()),
                    Vec::new(),
                )
            } else {
                HtmlNode::element_with(
                    "ri:attachment",
                    Properties::default().with("ri:filename", src.clone()),
                    Vec::new(),
                )
            };
            HtmlNode::element_with("ac:image", properties, vec![resource])
        }
        InlineNode::Break => HtmlNode::element("br", Vec::new()),
    }
}

fn is_external_url(src: &str) -> bool {
    src.contains("://") || src.starts_with('/') || src.starts_with("data:")
}

pub fn tree_to_document(root: &HtmlRoot) -> Document {
    Document::new(blocks_from_html(&root.children))
}

/// Collects loose phrasing content between block elements into paragraphs.
#[derive(Default)]
struct BlockBuilder {
    blocks: Vec<BlockNode>,
    pending: Vec<HtmlNode>,
}

impl BlockBuilder {
    fn push_inline(&mut self, node: &HtmlNode) {
        if self.pending.is_empty()
            && let HtmlNode::Text { value } = node
            && value.trim().is_empty()
        {
            return;
        }
        self.pending.push(node.clone());
    }

    fn push_block(&mut self, block: BlockNode) {
        self.flush();
        self.blocks.push(block);
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let nodes = std::mem::take(&mut self.pending);
        let children = trim_inline_edges(inlines_from_html(&nodes));
        if !children.is_empty() {
            self.blocks.push(BlockNode::Paragraph { children });
        }
    }

    fn finish(mut self) -> Vec<BlockNode> {
        self.flush();
        self.blocks
    }
}

fn blocks_from_html(nodes: &[HtmlNode]) -> Vec<BlockNode> {
    let mut builder = BlockBuilder::default();
    for node in nodes {
        block_from_html(node, &mut builder);
    }
    builder.finish()
}

fn block_from_html(node: &HtmlNode, builder: &mut BlockBuilder) {
    let (tag_name, properties, children) = match node {
        HtmlNode::Text { .. } => {
            builder.push_inline(node);
            return;
        }
        HtmlNode::Comment { .. } | HtmlNode::Doctype { .. } => return,
        HtmlNode::Element {
            tag_name,
            properties,
            children,
        } => (tag_name.as_str(), properties, children),
    };

    match tag_name {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = tag_name[1..].parse::<u8>().unwrap_or(1);
            builder.push_block(BlockNode::Heading {
                level,
                children: inlines_from_html(children),
            });
        }
        "p" => {
            if children.iter().any(is_block_element) {
                builder.flush();
                for child in children {
                    block_from_html(child, builder);
                }
                builder.flush();
                return;
            }
            let inlines = inlines_from_html(children);
            if inlines.is_empty() {
                builder.flush();
            } else {
                builder.push_block(BlockNode::Paragraph { children: inlines });
            }
        }
        "hr" => builder.push_block(BlockNode::ThematicBreak),
        "blockquote" => builder.push_block(BlockNode::BlockQuote {
            children: blocks_from_html(children),
        }),
        "ul" | "ol" => builder.push_block(list_from_html(tag_name == "ol", children)),
        "table" => builder.push_block(table_from_html(children)),
        "pre" => builder.push_block(pre_from_html(properties, children)),
        MACRO_TAG => builder.push_block(macro_from_html(node, properties, children)),
        _ if TRANSPARENT_CONTAINERS.contains(&tag_name) => {
            builder.flush();
            for child in children {
                block_from_html(child, builder);
            }
            builder.flush();
        }
        _ if METADATA_ELEMENTS.contains(&tag_name) => {}
        _ if PHRASING_ELEMENTS.contains(&tag_name) => builder.push_inline(node),
        _ => builder.push_block(BlockNode::Unsupported {
            raw: html::encode_node(node),
        }),
    }
}

fn is_block_element(node: &HtmlNode) -> bool {
    match node {
        HtmlNode::Element { tag_name, .. } => !PHRASING_ELEMENTS.contains(&tag_name.as_str()),
        HtmlNode::Text { .. } | HtmlNode::Comment { .. } | HtmlNode::Doctype { .. } => false,
    }
}

fn list_from_html(ordered: bool, children: &[HtmlNode]) -> BlockNode {
    let mut items: Vec<ListItem> = Vec::new();
    for child in children {
        match child {
            HtmlNode::Element {
                tag_name,
                children: item_children,
                ..
            } if tag_name == "li" => items.push(ListItem {
                children: blocks_from_html(item_children),
            }),
            HtmlNode::Text { value } if value.trim().is_empty() => {}
            HtmlNode::Comment { .. } | HtmlNode::Doctype { .. } => {}
            other => {
                // Stray content between items belongs to the item before it.
                let blocks = blocks_from_html(std::slice::from_ref(other));
                match items.last_mut() {
                    Some(item) => item.children.extend(blocks),
                    None => items.push(ListItem { children: blocks }),
                }
            }
        }
    }
    BlockNode::List { ordered, items }
}

fn table_from_html(children: &[HtmlNode]) -> BlockNode {
    let mut head_rows = Vec::new();
    let mut body_rows = Vec::new();
    collect_table_rows(children, false, &mut head_rows, &mut body_rows);

    let mut rows = Vec::with_capacity(head_rows.len() + body_rows.len());
    let header = if !head_rows.is_empty() {
        let mut head_rows = head_rows.into_iter();
        let header = head_rows.next();
        rows.extend(head_rows);
        header
    } else if body_rows
        .first()
        .is_some_and(|row: &TableRow| !row.cells.is_empty() && row.cells.iter().all(|c| c.is_header))
    {
        Some(body_rows.remove(0))
    } else {
        None
    };
    rows.extend(body_rows);
    BlockNode::Table { header, rows }
}

fn collect_table_rows(
    nodes: &[HtmlNode],
    in_head: bool,
    head_rows: &mut Vec<TableRow>,
    body_rows: &mut Vec<TableRow>,
) {
    for node in nodes {
        let HtmlNode::Element {
            tag_name, children, ..
        } = node
        else {
            continue;
        };
        match tag_name.as_str() {
            "thead" => collect_table_rows(children, true, head_rows, body_rows),
            "tbody" | "tfoot" => collect_table_rows(children, false, head_rows, body_rows),
            "tr" => {
                let row = row_from_html(children);
                if in_head {
                    head_rows.push(row);
                } else {
                    body_rows.push(row);
                }
            }
            _ => {}
        }
    }
}

fn row_from_html(children: &[HtmlNode]) -> TableRow {
    let cells = children
        .iter()
        .filter_map(|child| match child {
            HtmlNode::Element {
                tag_name,
                children,
                ..
            } if tag_name == "th" || tag_name == "td" => Some(TableCell {
                is_header: tag_name == "th",
                children: cell_inlines(children),
            }),
            _ => None,
        })
        .collect();
    TableRow { cells }
}

/// Cells hold inline content; paragraphs inside a cell are joined with breaks.
fn cell_inlines(children: &[HtmlNode]) -> Vec<InlineNode> {
    let mut output = Vec::new();
    let mut loose = Vec::new();
    let mut paragraphs = 0usize;
    for child in children {
        match child {
            HtmlNode::Element {
                tag_name,
                children: paragraph,
                ..
            } if tag_name == "p" || tag_name == "div" => {
                if !loose.is_empty() {
                    output.extend(inlines_from_html(&std::mem::take(&mut loose)));
                }
                if paragraphs > 0 {
                    output.push(InlineNode::Break);
                }
                output.extend(inlines_from_html(paragraph));
                paragraphs += 1;
            }
            HtmlNode::Text { value } if value.trim().is_empty() && loose.is_empty() => {}
            other => loose.push(other.clone()),
        }
    }
    if !loose.is_empty() {
        output.extend(trim_inline_edges(inlines_from_html(&loose)));
    }
    normalize_inlines(output)
}

fn pre_from_html(properties: &Properties, children: &[HtmlNode]) -> BlockNode {
    let mut language = properties.get("data-language").map(str::to_string);
    let code = match children {
        [
            HtmlNode::Element {
                tag_name,
                properties: code_properties,
                children: code_children,
            },
        ] if tag_name == "code" => {
            if let Some(class) = code_properties.get("class") {
                language = class
                    .split_whitespace()
                    .find_map(|name| name.strip_prefix("language-"))
                    .map(str::to_string)
                    .or(language);
            }
            text_content(code_children)
        }
        _ => text_content(children),
    };
    BlockNode::CodeBlock { code, language }
}

fn macro_from_html(node: &HtmlNode, properties: &Properties, children: &[HtmlNode]) -> BlockNode {
    let name = properties.get("ac:name").unwrap_or_default();
    let mut parameters = Vec::new();
    let mut rich_body = None;
    let mut plain_body = None;
    for child in children {
        let HtmlNode::Element {
            tag_name,
            properties: child_properties,
            children: grandchildren,
        } = child
        else {
            continue;
        };
        match tag_name.as_str() {
            "ac:parameter" => parameters.push(MacroParameter {
                name: child_properties.get("ac:name").unwrap_or_default().to_string(),
                value: text_content(grandchildren),
            }),
            "ac:rich-text-body" => rich_body = Some(grandchildren),
            "ac:plain-text-body" => plain_body = Some(text_content(grandchildren)),
            _ => {}
        }
    }

    if name == "code" || name == "noformat" {
        let language = parameters
            .iter()
            .find(|parameter| parameter.name == "language")
            .map(|parameter| parameter.value.clone());
        return BlockNode::CodeBlock {
            code: plain_body.unwrap_or_default(),
            language,
        };
    }

    match rich_body {
        Some(body) if !name.is_empty() => BlockNode::Macro(MacroNode {
            panel_type: PanelType::from_name(name),
            parameters,
            children: blocks_from_html(body),
        }),
        _ => BlockNode::Unsupported {
            raw: html::encode_node(node),
        },
    }
}

fn inlines_from_html(nodes: &[HtmlNode]) -> Vec<InlineNode> {
    let mut output = Vec::new();
    for node in nodes {
        inline_from_html(node, &mut output);
    }
    normalize_inlines(output)
}

fn inline_from_html(node: &HtmlNode, output: &mut Vec<InlineNode>) {
    let (tag_name, properties, children) = match node {
        HtmlNode::Text { value } => {
            output.push(InlineNode::text(value.clone()));
            return;
        }
        HtmlNode::Comment { .. } | HtmlNode::Doctype { .. } => return,
        HtmlNode::Element {
            tag_name,
            properties,
            children,
        } => (tag_name.as_str(), properties, children),
    };

    match tag_name {
        "strong" | "b" => output.push(InlineNode::Strong {
            children: inlines_from_html(children),
        }),
        "em" | "i" => output.push(InlineNode::Emphasis {
            children: inlines_from_html(children),
        }),
        "s" | "del" | "strike" => output.push(InlineNode::Strikethrough {
            children: inlines_from_html(children),
        }),
        "span"
            if properties
                .get("style")
                .is_some_and(|style| style.contains("line-through")) =>
        {
            output.push(InlineNode::Strikethrough {
                children: inlines_from_html(children),
            })
        }
        "code" | "tt" => output.push(InlineNode::InlineCode {
            value: text_content(children),
        }),
        "a" => match properties.get("href") {
            Some(href) => output.push(InlineNode::Link {
                href: href.to_string(),
                children: inlines_from_html(children),
            }),
            None => output.extend(inlines_from_html(children)),
        },
        "img" => output.push(InlineNode::Image {
            src: properties.get("src").unwrap_or_default().to_string(),
            alt: properties.get("alt").unwrap_or_default().to_string(),
        }),
        "ac:image" => output.push(InlineNode::Image {
            src: image_source(children).unwrap_or_default(),
            alt: properties.get("ac:alt").unwrap_or_default().to_string(),
        }),
        "br" => output.push(InlineNode::Break),
        "time" if children.is_empty() => {
            if let Some(datetime) = properties.get("datetime") {
                output.push(InlineNode::text(datetime));
            }
        }
        "ac:emoticon" => {
            if let Some(fallback) = properties.get("ac:emoji-fallback") {
                output.push(InlineNode::text(fallback));
            }
        }
        "ac:link" => {
            let text = inlines_from_html(children);
            if text.is_empty() {
                if let Some(title) = linked_page_title(children) {
                    output.push(InlineNode::text(title));
                }
            } else {
                output.extend(text);
            }
        }
        "ac:parameter" => {}
        MACRO_TAG => match macro_title(children) {
            Some(title) => output.push(InlineNode::text(title)),
            None => output.extend(inlines_from_html(children)),
        },
        "p" | "div" => {
            if !output.is_empty() {
                output.push(InlineNode::Break);
            }
            output.extend(inlines_from_html(children));
        }
        _ => output.extend(inlines_from_html(children)),
    }
}

fn image_source(children: &[HtmlNode]) -> Option<String> {
    children.iter().find_map(|child| match child {
        HtmlNode::Element {
            tag_name,
            properties,
            ..
        } if tag_name == "ri:url" => properties.get("ri:value").map(str::to_string),
        HtmlNode::Element {
            tag_name,
            properties,
            ..
        } if tag_name == "ri:attachment" => properties.get("ri:filename").map(str::to_string),
        _ => None,
    })
}

fn linked_page_title(children: &[HtmlNode]) -> Option<String> {
    children.iter().find_map(|child| match child {
        HtmlNode::Element {
            tag_name,
            properties,
            ..
        } if tag_name == "ri:page" => properties.get("ri:content-title").map(str::to_string),
        _ => None,
    })
}

fn macro_title(children: &[HtmlNode]) -> Option<String> {
    children.iter().find_map(|child| match child {
        HtmlNode::Element {
            tag_name,
            properties,
            children,
        } if tag_name == "ac:parameter" && properties.get("ac:name") == Some("title") => {
            Some(text_content(children))
        }
        _ => None,
    })
}

fn text_content(nodes: &[HtmlNode]) -> String {
    let mut output = String::new();
    collect_text(nodes, &mut output);
    output
}

fn collect_text(nodes: &[HtmlNode], output: &mut String) {
    for node in nodes {
        match node {
            HtmlNode::Text { value } => output.push_str(value),
            HtmlNode::Element {
                tag_name, children, ..
            } => {
                if tag_name == "br" {
                    output.push('\n');
                } else {
                    collect_text(children, output);
                }
            }
            HtmlNode::Comment { .. } | HtmlNode::Doctype { .. } => {}
        }
    }
}

/// Loose text between blocks carries source indentation; trim it at the edges.
fn trim_inline_edges(mut nodes: Vec<InlineNode>) -> Vec<InlineNode> {
    if let Some(InlineNode::Text { value }) = nodes.first_mut() {
        *value = value.trim_start().to_string();
    }
    if let Some(InlineNode::Text { value }) = nodes.last_mut() {
        *value = value.trim_end().to_string();
    }
    normalize_inlines(nodes)
}
