//! Markdown string <-> parse tree.
//!
//! Decoding uses comrak with the GFM table and strikethrough extensions.
//! Encoding is done here so the output is stable across pulls and every
//! construct re-parses to the tree it came from. Formatting that no delimiter
//! run can express at its position is written as an HTML tag pair, which the
//! decoder reads back as the same node.

use std::sync::LazyLock;

use comrak::nodes::{AstNode, ListType, NodeValue};
use comrak::{Arena, ComrakOptions, parse_document};
use regex::Regex;

/// Info string marking a fenced block as raw HTML carried through Markdown.
pub const HTML_FENCE_INFO: &str = "{=html}";

static ALERT_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[!([A-Za-z][A-Za-z0-9_-]*)\][ \t]*(.*)$").expect("alert marker pattern")
});

static ORDERED_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,9})([.)])").expect("ordered marker pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MdRoot {
    pub children: Vec<MdBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MdBlock {
    Heading {
        depth: u8,
        children: Vec<MdInline>,
    },
    Paragraph {
        children: Vec<MdInline>,
    },
    Code {
        value: String,
        lang: Option<String>,
    },
    ThematicBreak,
    List {
        ordered: bool,
        items: Vec<MdListItem>,
    },
    Blockquote {
        alert: Option<MdAlert>,
        children: Vec<MdBlock>,
    },
    Table {
        header: MdTableRow,
        rows: Vec<MdTableRow>,
    },
    /// Markup carried verbatim; written as a `{=html}` fenced block.
    Html {
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdListItem {
    pub children: Vec<MdBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdTableRow {
    pub cells: Vec<Vec<MdInline>>,
}

/// GFM alert marker on a blockquote: `> [!NOTE] Optional title`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdAlert {
    pub kind: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MdInline {
    Text { value: String },
    Strong { children: Vec<MdInline> },
    Emphasis { children: Vec<MdInline> },
    Delete { children: Vec<MdInline> },
    InlineCode { value: String },
    Link { url: String, children: Vec<MdInline> },
    Image { url: String, alt: String },
    Break,
}

pub fn decode(markdown: &str) -> MdRoot {
    let arena = Arena::new();
    let options = comrak_options();
    let root = parse_document(&arena, markdown, &options);
    let lines: Vec<&str> = markdown.lines().collect();
    MdRoot {
        children: blocks_from_children(root, &lines),
    }
}

pub fn encode(root: &MdRoot) -> String {
    let rendered = render_blocks(&root.children);
    if rendered.is_empty() {
        String::new()
    } else {
        format!("{rendered}\n")
    }
}

fn comrak_options() -> ComrakOptions<'static> {
    let mut options = ComrakOptions::default();
    options.extension.table = true;
    options.extension.strikethrough = true;
    options
}

fn blocks_from_children<'a>(node: &'a AstNode<'a>, lines: &[&str]) -> Vec<MdBlock> {
    node.children()
        .filter_map(|child| block_from_node(child, lines))
        .collect()
}

fn block_from_node<'a>(node: &'a AstNode<'a>, lines: &[&str]) -> Option<MdBlock> {
    let value = node.data.borrow().value.clone();
    let block = match value {
        NodeValue::Heading(heading) => MdBlock::Heading {
            depth: heading.level,
            children: inlines_from_children(node),
        },
        NodeValue::Paragraph => MdBlock::Paragraph {
            children: inlines_from_children(node),
        },
        NodeValue::CodeBlock(code) => {
            let literal = strip_final_newline(&code.literal);
            let info = code.info.trim();
            if info == HTML_FENCE_INFO {
                MdBlock::Html { value: literal }
            } else {
                let lang = info.split_whitespace().next().map(str::to_string);
                MdBlock::Code {
                    value: literal,
                    lang,
                }
            }
        }
        NodeValue::HtmlBlock(html) => MdBlock::Html {
            value: html.literal.trim_end_matches('\n').to_string(),
        },
        NodeValue::ThematicBreak => MdBlock::ThematicBreak,
        NodeValue::BlockQuote => blockquote_from_node(node, lines),
        NodeValue::List(list) => MdBlock::List {
            ordered: matches!(list.list_type, ListType::Ordered),
            items: node
                .children()
                .map(|item| MdListItem {
                    children: blocks_from_children(item, lines),
                })
                .collect(),
        },
        NodeValue::Table(_) => {
            let mut rows = node.children().map(|row| MdTableRow {
                cells: row.children().map(inlines_from_children).collect(),
            });
            let header = rows.next().unwrap_or(MdTableRow { cells: Vec::new() });
            MdBlock::Table {
                header,
                rows: rows.collect(),
            }
        }
        _ => {
            let value = source_lines(node, lines);
            if value.trim().is_empty() {
                return None;
            }
            MdBlock::Html { value }
        }
    };
    Some(block)
}

fn blockquote_from_node<'a>(node: &'a AstNode<'a>, lines: &[&str]) -> MdBlock {
    let mut children = blocks_from_children(node, lines);
    let marker_line = node
        .first_child()
        .filter(|first| matches!(first.data.borrow().value, NodeValue::Paragraph))
        .and_then(|first| {
            let start = first.data.borrow().sourcepos.start;
            let line = lines.get(start.line.checked_sub(1)?)?;
            line.get(start.column.checked_sub(1)?..)
        });

    // Only an unescaped `[!KIND]` at the start of the quote counts as an alert.
    let alert = match (marker_line, children.first_mut()) {
        (Some(line), Some(MdBlock::Paragraph { children: inlines }))
            if ALERT_MARKER_RE.is_match(line) =>
        {
            split_alert_marker(inlines)
        }
        _ => None,
    };
    let marker_only = alert.is_some()
        && matches!(children.first(), Some(MdBlock::Paragraph { children }) if children.is_empty());
    if marker_only {
        children.remove(0);
    }
    MdBlock::Blockquote { alert, children }
}

/// Remove the marker line from the first paragraph and parse it.
fn split_alert_marker(inlines: &mut Vec<MdInline>) -> Option<MdAlert> {
    let mut marker_line = Vec::new();
    let mut rest = Vec::new();
    let mut in_rest = false;
    for inline in inlines.drain(..) {
        if in_rest {
            rest.push(inline);
            continue;
        }
        match inline {
            MdInline::Text { value } => match value.split_once('\n') {
                Some((before, after)) => {
                    marker_line.push(MdInline::Text {
                        value: before.to_string(),
                    });
                    if !after.is_empty() {
                        rest.push(MdInline::Text {
                            value: after.to_string(),
                        });
                    }
                    in_rest = true;
                }
                None => marker_line.push(MdInline::Text { value }),
            },
            MdInline::Break => in_rest = true,
            other => marker_line.push(other),
        }
    }
    *inlines = rest;

    let text = inline_plain_text(&marker_line);
    let captures = ALERT_MARKER_RE.captures(text.trim())?;
    let title = captures
        .get(2)
        .map(|m| m.as_str().trim().to_string())
        .filter(|title| !title.is_empty());
    Some(MdAlert {
        kind: captures[1].to_ascii_lowercase(),
        title,
    })
}

fn inlines_from_children<'a>(node: &'a AstNode<'a>) -> Vec<MdInline> {
    // Open `<strong>`/`<em>`/`<del>` tags with the siblings collected before them.
    let mut open: Vec<(StyleTag, String, Vec<MdInline>)> = Vec::new();
    let mut output = Vec::new();
    for child in node.children() {
        let html = match &child.data.borrow().value {
            NodeValue::HtmlInline(html) => Some(html.clone()),
            _ => None,
        };
        let style = html.as_deref().and_then(parse_style_tag);
        match style {
            Some((tag, false)) => {
                let html = html.unwrap_or_default();
                open.push((tag, html, std::mem::take(&mut output)));
            }
            Some((tag, true)) if open.last().is_some_and(|(top, ..)| *top == tag) => {
                if let Some((tag, _, mut outer)) = open.pop() {
                    outer.push(tag.wrap(merge_text(std::mem::take(&mut output))));
                    output = outer;
                }
            }
            _ => inline_from_node(child, &mut output),
        }
    }
    // Unclosed tags stay literal.
    while let Some((_, html, mut outer)) = open.pop() {
        outer.push(MdInline::Text { value: html });
        outer.append(&mut output);
        output = outer;
    }
    merge_text(output)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StyleTag {
    Strong,
    Emphasis,
    Delete,
}

impl StyleTag {
    fn name(self) -> &'static str {
        match self {
            Self::Strong => "strong",
            Self::Emphasis => "em",
            Self::Delete => "del",
        }
    }

    /// Delimiter runs to try, in order of preference.
    fn delimiters(self) -> &'static [&'static str] {
        match self {
            Self::Strong => &["**", "__"],
            Self::Emphasis => &["*", "_"],
            Self::Delete => &["~~"],
        }
    }

    fn wrap(self, children: Vec<MdInline>) -> MdInline {
        match self {
            Self::Strong => MdInline::Strong { children },
            Self::Emphasis => MdInline::Emphasis { children },
            Self::Delete => MdInline::Delete { children },
        }
    }
}

/// `<em>` or `</em>` style tags without attributes; `true` marks a closing tag.
fn parse_style_tag(html: &str) -> Option<(StyleTag, bool)> {
    let compact = html.trim().to_ascii_lowercase();
    let inner = compact.strip_prefix('<')?.strip_suffix('>')?;
    let (closing, name) = match inner.strip_prefix('/') {
        Some(name) => (true, name),
        None => (false, inner),
    };
    let tag = match name.trim() {
        "strong" | "b" => StyleTag::Strong,
        "em" | "i" => StyleTag::Emphasis,
        "del" | "s" => StyleTag::Delete,
        _ => return None,
    };
    Some((tag, closing))
}

fn inline_from_node<'a>(node: &'a AstNode<'a>, output: &mut Vec<MdInline>) {
    let value = node.data.borrow().value.clone();
    match value {
        NodeValue::Text(text) => output.push(MdInline::Text { value: text }),
        NodeValue::SoftBreak => output.push(MdInline::Text {
            value: "\n".to_string(),
        }),
        NodeValue::LineBreak => output.push(MdInline::Break),
        NodeValue::Code(code) => output.push(MdInline::InlineCode {
            value: code.literal,
        }),
        NodeValue::HtmlInline(html) => {
            if is_break_tag(&html) {
                output.push(MdInline::Break);
            } else {
                output.push(MdInline::Text { value: html });
            }
        }
        NodeValue::Strong => output.push(MdInline::Strong {
            children: inlines_from_children(node),
        }),
        NodeValue::Emph => output.push(MdInline::Emphasis {
            children: inlines_from_children(node),
        }),
        NodeValue::Strikethrough => output.push(MdInline::Delete {
            children: inlines_from_children(node),
        }),
        NodeValue::Link(link) => output.push(MdInline::Link {
            url: link.url,
            children: inlines_from_children(node),
        }),
        NodeValue::Image(link) => output.push(MdInline::Image {
            url: link.url,
            alt: inline_plain_text(&inlines_from_children(node)),
        }),
        _ => {
            for child in node.children() {
                inline_from_node(child, output);
            }
        }
    }
}

fn is_break_tag(html: &str) -> bool {
    let compact: String = html
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    compact == "<br>" || compact == "<br/>"
}

fn merge_text(nodes: Vec<MdInline>) -> Vec<MdInline> {
    let mut output: Vec<MdInline> = Vec::with_capacity(nodes.len());
    for node in nodes {
        if let MdInline::Text { value } = &node {
            if value.is_empty() {
                continue;
            }
            if let Some(MdInline::Text { value: previous }) = output.last_mut() {
                previous.push_str(value);
                continue;
            }
        }
        output.push(node);
    }
    output
}

fn inline_plain_text(nodes: &[MdInline]) -> String {
    let mut output = String::new();
    for node in nodes {
        match node {
            MdInline::Text { value } | MdInline::InlineCode { value } => output.push_str(value),
            MdInline::Strong { children }
            | MdInline::Emphasis { children }
            | MdInline::Delete { children }
            | MdInline::Link { children, .. } => output.push_str(&inline_plain_text(children)),
            MdInline::Image { alt, .. } => output.push_str(alt),
            MdInline::Break => output.push('\n'),
        }
    }
    output
}

fn strip_final_newline(value: &str) -> String {
    value.strip_suffix('\n').unwrap_or(value).to_string()
}

fn source_lines<'a>(node: &'a AstNode<'a>, lines: &[&str]) -> String {
    let sourcepos = node.data.borrow().sourcepos;
    let start = sourcepos.start.line.max(1) - 1;
    let end = sourcepos.end.line.min(lines.len());
    if start >= end {
        return String::new();
    }
    lines[start..end].join("\n")
}

fn render_blocks(blocks: &[MdBlock]) -> String {
    let mut rendered = Vec::with_capacity(blocks.len());
    let mut previous_list: Option<(bool, bool)> = None;
    for block in blocks {
        let text = match block {
            MdBlock::List { ordered, items } => {
                // Adjacent lists of one kind would merge unless their markers differ.
                let alternate = match previous_list {
                    Some((previous_ordered, previous_alternate)) if previous_ordered == *ordered => {
                        !previous_alternate
                    }
                    _ => false,
                };
                previous_list = Some((*ordered, alternate));
                render_list(*ordered, items, alternate)
            }
            other => {
                previous_list = None;
                render_block(other)
            }
        };
        if !text.is_empty() {
            rendered.push(text);
        }
    }
    rendered.join("\n\n")
}

fn render_block(block: &MdBlock) -> String {
    match block {
        MdBlock::Heading { depth, children } => render_inline_block(block, |tags_only| {
            let depth = usize::from((*depth).clamp(1, 6));
            let context = InlineContext::heading().tags_only(tags_only);
            let text = render_inlines(children, context).replace('\n', " ");
            let text = text.trim();
            if text.is_empty() {
                "#".repeat(depth)
            } else {
                format!("{} {}", "#".repeat(depth), text)
            }
        }),
        MdBlock::Paragraph { children } => render_inline_block(block, |tags_only| {
            let context = InlineContext::default().tags_only(tags_only);
            render_inlines(children, context)
                .split('\n')
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(escape_line_start)
                .collect::<Vec<_>>()
                .join("\n")
        }),
        MdBlock::Code { value, lang } => render_fence(value, lang.as_deref().unwrap_or("")),
        MdBlock::Html { value } => render_fence(value, HTML_FENCE_INFO),
        MdBlock::ThematicBreak => "---".to_string(),
        MdBlock::List { ordered, items } => render_list(*ordered, items, false),
        MdBlock::Blockquote { alert, children } => {
            let mut inner = String::new();
            if let Some(alert) = alert {
                inner.push_str(&format!("[!{}]", alert.kind.to_ascii_uppercase()));
                if let Some(title) = &alert.title {
                    let title = escape_text(&title.replace('\n', " "), false);
                    inner.push(' ');
                    inner.push_str(title.trim());
                }
                if !children.is_empty() {
                    inner.push_str("\n\n");
                }
            }
            inner.push_str(&render_blocks(children));
            if inner.is_empty() {
                return ">".to_string();
            }
            inner
                .split('\n')
                .map(|line| {
                    if line.is_empty() {
                        ">".to_string()
                    } else {
                        format!("> {line}")
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        MdBlock::Table { header, rows } => {
            render_inline_block(block, |tags_only| render_table(header, rows, tags_only))
        }
    }
}

fn render_fence(value: &str, info: &str) -> String {
    let use_tilde = info.contains('`');
    let fence_char = if use_tilde { '~' } else { '`' };
    let longest = longest_run(value, fence_char);
    let fence = fence_char.to_string().repeat(longest.max(2) + 1);
    if value.is_empty() {
        format!("{fence}{info}\n{fence}")
    } else {
        format!("{fence}{info}\n{value}\n{fence}")
    }
}

fn render_list(ordered: bool, items: &[MdListItem], alternate: bool) -> String {
    let tight = items.iter().all(|item| item.children.len() <= 1);
    let separator = if tight { "\n" } else { "\n\n" };
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let marker = match (ordered, alternate) {
                (false, false) => "-".to_string(),
                (false, true) => "*".to_string(),
                (true, false) => format!("{}.", index + 1),
                (true, true) => format!("{})", index + 1),
            };
            let content = render_blocks(&item.children);
            if content.is_empty() {
                return marker;
            }
            let indent = " ".repeat(marker.len() + 1);
            let mut output = String::new();
            for (line_index, line) in content.split('\n').enumerate() {
                if line_index == 0 {
                    output.push_str(&marker);
                    output.push(' ');
                    output.push_str(line);
                } else {
                    output.push('\n');
                    if !line.is_empty() {
                        output.push_str(&indent);
                        output.push_str(line);
                    }
                }
            }
            output
        })
        .collect::<Vec<_>>()
        .join(separator)
}

fn render_table(header: &MdTableRow, rows: &[MdTableRow], tags_only: bool) -> String {
    let columns = rows
        .iter()
        .map(|row| row.cells.len())
        .chain(std::iter::once(header.cells.len()))
        .max()
        .unwrap_or(0);
    if columns == 0 {
        return String::new();
    }
    let render_row = |row: &MdTableRow| {
        let mut line = String::from("|");
        for column in 0..columns {
            let cell = row
                .cells
                .get(column)
                .map(|cell| render_inlines(cell, InlineContext::table().tags_only(tags_only)))
                .unwrap_or_default();
            let cell = cell.replace('\n', " ");
            let cell = cell.trim();
            line.push(' ');
            line.push_str(cell);
            if !cell.is_empty() {
                line.push(' ');
            }
            line.push('|');
        }
        line
    };
    let mut lines = vec![render_row(header)];
    lines.push(format!("|{}", " --- |".repeat(columns)));
    lines.extend(rows.iter().map(render_row));
    lines.join("\n")
}

#[derive(Debug, Clone, Copy, Default)]
struct InlineContext {
    in_table: bool,
    in_heading: bool,
    /// Write formatting as HTML tags instead of delimiter runs.
    tags_only: bool,
    /// Characters just outside the rendered run; `None` is a line edge.
    before: Option<char>,
    after: Option<char>,
}

impl InlineContext {
    fn table() -> Self {
        Self {
            in_table: true,
            ..Self::default()
        }
    }

    fn heading() -> Self {
        Self {
            in_heading: true,
            ..Self::default()
        }
    }

    fn tags_only(self, tags_only: bool) -> Self {
        Self { tags_only, ..self }
    }

    fn between(self, before: char, after: char) -> Self {
        Self {
            before: Some(before),
            after: Some(after),
            ..self
        }
    }
}

fn render_inlines(nodes: &[MdInline], context: InlineContext) -> String {
    let mut output = String::new();
    for (index, node) in nodes.iter().enumerate() {
        let is_last = index + 1 == nodes.len();
        let before = output.chars().next_back().or(context.before);
        let after = match nodes.get(index + 1) {
            Some(next) => leading_char(next, context),
            None => context.after,
        };
        match node {
            MdInline::Text { value } => output.push_str(&escape_text(value, context.in_table)),
            MdInline::Strong { children } => {
                push_styled(&mut output, StyleTag::Strong, children, context, before, after);
            }
            MdInline::Emphasis { children } => {
                push_styled(&mut output, StyleTag::Emphasis, children, context, before, after);
            }
            MdInline::Delete { children } => {
                push_styled(&mut output, StyleTag::Delete, children, context, before, after);
            }
            MdInline::InlineCode { value } => {
                output.push_str(&render_code_span(value, context.in_table));
            }
            MdInline::Link { url, children } => {
                let text = render_inlines(children, context.between('[', ']'));
                output.push('[');
                output.push_str(&text);
                output.push_str("](");
                output.push_str(&render_destination(url));
                output.push(')');
            }
            MdInline::Image { url, alt } => {
                output.push_str("![");
                output.push_str(&escape_text(&alt.replace('\n', " "), context.in_table));
                output.push_str("](");
                output.push_str(&render_destination(url));
                output.push(')');
            }
            MdInline::Break => {
                if context.in_table || context.in_heading || is_last {
                    output.push_str("<br>");
                } else {
                    output.push_str("\\\n");
                }
            }
        }
    }
    output
}

/// First character `node` will render as. Formatting is assumed to use its
/// preferred delimiter; whichever it ends up using is punctuation as well.
fn leading_char(node: &MdInline, context: InlineContext) -> Option<char> {
    let styled = |tag: StyleTag, children: &[MdInline]| {
        if inline_plain_text(children).starts_with(char::is_whitespace) {
            Some(' ')
        } else if context.tags_only {
            Some('<')
        } else {
            tag.delimiters()[0].chars().next()
        }
    };
    match node {
        MdInline::Text { value } => escape_text(value, context.in_table).chars().next(),
        MdInline::Strong { children } => styled(StyleTag::Strong, children),
        MdInline::Emphasis { children } => styled(StyleTag::Emphasis, children),
        MdInline::Delete { children } => styled(StyleTag::Delete, children),
        MdInline::InlineCode { .. } => Some('`'),
        MdInline::Link { .. } => Some('['),
        MdInline::Image { .. } => Some('!'),
        MdInline::Break => Some('\\'),
    }
}

/// Render formatting with the first delimiter run CommonMark reads back as
/// the same node here, falling back to an HTML tag pair.
fn push_styled(
    output: &mut String,
    tag: StyleTag,
    children: &[MdInline],
    context: InlineContext,
    before: Option<char>,
    after: Option<char>,
) {
    if !context.tags_only {
        for delimiter in tag.delimiters() {
            let Some(mark) = delimiter.chars().next() else {
                continue;
            };
            let inner = render_inlines(children, context.between(mark, mark));
            if inner.trim().is_empty() {
                output.push_str(&inner);
                return;
            }
            if let Some(run) = delimited(&inner, delimiter, mark, before, after) {
                output.push_str(&run);
                return;
            }
        }
    }
    let inner = render_inlines(children, context.between('>', '<'));
    let name = tag.name();
    output.push_str(&format!("<{name}>{inner}</{name}>"));
}

/// Wrap `inner` in `delimiter` if the runs open and close where placed.
/// Delimiters must hug non-space content, so surrounding whitespace moves
/// outside.
fn delimited(
    inner: &str,
    delimiter: &str,
    mark: char,
    before: Option<char>,
    after: Option<char>,
) -> Option<String> {
    let core = inner.trim();
    let first = core.chars().next()?;
    let last = core.chars().next_back()?;
    let leading = &inner[..inner.len() - inner.trim_start().len()];
    let trailing = &inner[inner.trim_end().len()..];
    let before = if leading.is_empty() { before } else { Some(' ') };
    let after = if trailing.is_empty() { after } else { Some(' ') };

    // A neighbouring run of the same character would join this one.
    if before == Some(mark) || after == Some(mark) || first == mark || last == mark {
        return None;
    }
    if !can_open(mark, before, first) || !can_close(mark, last, after) {
        return None;
    }
    Some(format!("{leading}{delimiter}{core}{delimiter}{trailing}"))
}

fn is_space(ch: Option<char>) -> bool {
    ch.is_none_or(char::is_whitespace)
}

fn is_punctuation(ch: Option<char>) -> bool {
    ch.is_some_and(|ch| !ch.is_alphanumeric() && !ch.is_whitespace())
}

fn left_flanking(before: Option<char>, after: Option<char>) -> bool {
    !is_space(after) && (!is_punctuation(after) || is_space(before) || is_punctuation(before))
}

fn right_flanking(before: Option<char>, after: Option<char>) -> bool {
    !is_space(before) && (!is_punctuation(before) || is_space(after) || is_punctuation(after))
}

fn can_open(mark: char, before: Option<char>, first: char) -> bool {
    let after = Some(first);
    let left = left_flanking(before, after);
    if mark == '_' {
        left && (!right_flanking(before, after) || is_punctuation(before))
    } else {
        left
    }
}

fn can_close(mark: char, last: char, after: Option<char>) -> bool {
    let before = Some(last);
    let right = right_flanking(before, after);
    if mark == '_' {
        right && (!left_flanking(before, after) || is_punctuation(after))
    } else {
        right
    }
}

/// Render a block holding inline content. If its formatting does not read
/// back as written, render it again with tag pairs for every format.
fn render_inline_block(block: &MdBlock, render: impl Fn(bool) -> String) -> String {
    let text = render(false);
    if !has_formatting(block) || decode(&text).children == [canonical_block(block)] {
        return text;
    }
    render(true)
}

fn has_formatting(block: &MdBlock) -> bool {
    fn any(nodes: &[MdInline]) -> bool {
        nodes.iter().any(|node| match node {
            MdInline::Strong { .. } | MdInline::Emphasis { .. } | MdInline::Delete { .. } => true,
            MdInline::Link { children, .. } => any(children),
            _ => false,
        })
    }
    match block {
        MdBlock::Heading { children, .. } | MdBlock::Paragraph { children } => any(children),
        MdBlock::Table { header, rows } => std::iter::once(header)
            .chain(rows)
            .any(|row| row.cells.iter().any(|cell| any(cell))),
        _ => false,
    }
}

/// The block as decoding would produce it: adjacent text merged.
fn canonical_block(block: &MdBlock) -> MdBlock {
    let row = |row: &MdTableRow| MdTableRow {
        cells: row.cells.iter().map(|cell| canonical_inlines(cell)).collect(),
    };
    match block {
        MdBlock::Heading { depth, children } => MdBlock::Heading {
            depth: *depth,
            children: canonical_inlines(children),
        },
        MdBlock::Paragraph { children } => MdBlock::Paragraph {
            children: canonical_inlines(children),
        },
        MdBlock::Table { header, rows } => MdBlock::Table {
            header: row(header),
            rows: rows.iter().map(row).collect(),
        },
        other => other.clone(),
    }
}

fn canonical_inlines(nodes: &[MdInline]) -> Vec<MdInline> {
    merge_text(
        nodes
            .iter()
            .map(|node| match node {
                MdInline::Strong { children } => MdInline::Strong {
                    children: canonical_inlines(children),
                },
                MdInline::Emphasis { children } => MdInline::Emphasis {
                    children: canonical_inlines(children),
                },
                MdInline::Delete { children } => MdInline::Delete {
                    children: canonical_inlines(children),
                },
                MdInline::Link { url, children } => MdInline::Link {
                    url: url.clone(),
                    children: canonical_inlines(children),
                },
                other => other.clone(),
            })
            .collect(),
    )
}

fn render_code_span(value: &str, in_table: bool) -> String {
    let mut value = value.replace('\n', " ");
    if in_table {
        value = value.replace('|', "\\|");
    }
    if value.is_empty() {
        return "` `".to_string();
    }
    let fence = "`".repeat(longest_run(&value, '`') + 1);
    let needs_padding = value.starts_with('`')
        || value.ends_with('`')
        || (value.starts_with(' ') && value.ends_with(' ') && !value.trim().is_empty());
    if needs_padding {
        format!("{fence} {value} {fence}")
    } else {
        format!("{fence}{value}{fence}")
    }
}

fn render_destination(url: &str) -> String {
    let url = url.replace('\n', "");
    let needs_brackets = url.is_empty()
        || url
            .chars()
            .any(|ch| ch.is_whitespace() || matches!(ch, '(' | ')' | '<' | '>'));
    if needs_brackets {
        format!("<{}>", url.replace('<', "\\<").replace('>', "\\>"))
    } else {
        url
    }
}

fn escape_text(value: &str, in_table: bool) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' | '`' | '*' | '_' | '[' | ']' | '<' | '>' | '#' | '~' | '&' | '|' | '!' => {
                output.push('\\');
                output.push(ch);
            }
            '\n' if in_table => output.push(' '),
            _ => output.push(ch),
        }
    }
    output
}

/// Escape characters that would turn a paragraph line into another block.
fn escape_line_start(line: &str) -> String {
    if let Some(first) = line.chars().next()
        && matches!(first, '-' | '+' | '=')
    {
        return format!("\\{line}");
    }
    if let Some(captures) = ORDERED_MARKER_RE.captures(line) {
        let digits = &captures[1];
        let delimiter = &captures[2];
        return format!("{digits}\\{delimiter}{}", &line[captures[0].len()..]);
    }
    line.to_string()
}

fn longest_run(value: &str, target: char) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for ch in value.chars() {
        if ch == target {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> MdInline {
        MdInline::Text {
            value: value.to_string(),
        }
    }

    fn paragraph(value: &str) -> MdBlock {
        MdBlock::Paragraph {
            children: vec![text(value)],
        }
    }

    #[test]
    fn decode_basic_blocks() {
        let root = decode("# Title\n\nSome *em* and **strong** and ~~gone~~.\n\n---\n\n```rust\nfn main() {}\n```\n");
        assert_eq!(
            root.children,
            vec![
                MdBlock::Heading {
                    depth: 1,
                    children: vec![text("Title")],
                },
                MdBlock::Paragraph {
                    children: vec![
                        text("Some "),
                        MdInline::Emphasis {
                            children: vec![text("em")],
                        },
                        text(" and "),
                        MdInline::Strong {
                            children: vec![text("strong")],
                        },
                        text(" and "),
                        MdInline::Delete {
                            children: vec![text("gone")],
                        },
                        text("."),
                    ],
                },
                MdBlock::ThematicBreak,
                MdBlock::Code {
                    value: "fn main() {}".to_string(),
                    lang: Some("rust".to_string()),
                },
            ]
        );
    }

    #[test]
    fn decode_alert_blockquote() {
        let root = decode("> [!WARNING] Mind the gap\n>\n> Stand back.\n");
        assert_eq!(
            root.children,
            vec![MdBlock::Blockquote {
                alert: Some(MdAlert {
                    kind: "warning".to_string(),
                    title: Some("Mind the gap".to_string()),
                }),
                children: vec![paragraph("Stand back.")],
            }]
        );
    }

    #[test]
    fn escaped_alert_marker_stays_text() {
        let root = decode("> \\[!NOTE\\] literal\n");
        assert_eq!(
            root.children,
            vec![MdBlock::Blockquote {
                alert: None,
                children: vec![paragraph("[!NOTE] literal")],
            }]
        );
    }

    #[test]
    fn decode_html_fence_and_raw_html_block() {
        let root = decode("```{=html}\n<ac:task-list></ac:task-list>\n```\n\n<div>\nraw\n</div>\n");
        assert_eq!(
            root.children,
            vec![
                MdBlock::Html {
                    value: "<ac:task-list></ac:task-list>".to_string(),
                },
                MdBlock::Html {
                    value: "<div>\nraw\n</div>".to_string(),
                },
            ]
        );
    }

    #[test]
    fn decode_table_and_break_tags() {
        let root = decode("| a | b |\n| --- | --- |\n| 1<br>2 | `x\\|y` |\n");
        assert_eq!(
            root.children,
            vec![MdBlock::Table {
                header: MdTableRow {
                    cells: vec![vec![text("a")], vec![text("b")]],
                },
                rows: vec![MdTableRow {
                    cells: vec![
                        vec![text("1"), MdInline::Break, text("2")],
                        vec![MdInline::InlineCode {
                            value: "x|y".to_string(),
                        }],
                    ],
                }],
            }]
        );
    }

    #[test]
    fn encode_escapes_markdown_syntax_in_text() {
        let root = MdRoot {
            children: vec![
                paragraph("# not a heading *or* _emphasis_ [link](x) <b> a|b"),
                paragraph("- not a list\n1. nor this\n+ nor this"),
            ],
        };
        let encoded = encode(&root);
        assert_eq!(
            encoded,
            "\\# not a heading \\*or\\* \\_emphasis\\_ \\[link\\](x) \\<b\\> a\\|b\n\n\\- not a list\n1\\. nor this\n\\+ nor this\n"
        );
        assert_eq!(decode(&encoded), root);
    }

    #[test]
    fn adjacent_lists_stay_separate() {
        let root = MdRoot {
            children: vec![
                MdBlock::List {
                    ordered: false,
                    items: vec![MdListItem {
                        children: vec![paragraph("a")],
                    }],
                },
                MdBlock::List {
                    ordered: false,
                    items: vec![MdListItem {
                        children: vec![paragraph("b")],
                    }],
                },
            ],
        };
        let encoded = encode(&root);
        assert_eq!(encoded, "- a\n\n* b\n");
        assert_eq!(decode(&encoded), root);
    }

    #[test]
    fn code_fences_grow_past_inner_backticks() {
        let root = MdRoot {
            children: vec![MdBlock::Code {
                value: "```\nnested\n```".to_string(),
                lang: None,
            }],
        };
        let encoded = encode(&root);
        assert!(encoded.starts_with("````\n"));
        assert_eq!(decode(&encoded), root);
    }

    #[test]
    fn tree_round_trips_through_encode_and_decode() {
        let root = MdRoot {
            children: vec![
                MdBlock::Heading {
                    depth: 2,
                    children: vec![
                        text("Setup "),
                        MdInline::InlineCode {
                            value: "a `tick`".to_string(),
                        },
                    ],
                },
                MdBlock::Paragraph {
                    children: vec![
                        MdInline::Strong {
                            children: vec![
                                MdInline::Emphasis {
                                    children: vec![text("both")],
                                },
                                text(" bold"),
                            ],
                        },
                        text(" then "),
                        MdInline::Link {
                            url: "https://example.com/a b".to_string(),
                            children: vec![text("a link")],
                        },
                        MdInline::Break,
                        MdInline::Image {
                            url: "pic.png".to_string(),
                            alt: "a pic".to_string(),
                        },
                    ],
                },
                MdBlock::List {
                    ordered: true,
                    items: vec![
                        MdListItem {
                            children: vec![
                                paragraph("first"),
                                MdBlock::Code {
                                    value: "inside".to_string(),
                                    lang: None,
                                },
                            ],
                        },
                        MdListItem {
                            children: vec![
                                paragraph("second"),
                                MdBlock::List {
                                    ordered: false,
                                    items: vec![MdListItem {
                                        children: vec![paragraph("nested")],
                                    }],
                                },
                            ],
                        },
                    ],
                },
                MdBlock::Blockquote {
                    alert: Some(MdAlert {
                        kind: "info".to_string(),
                        title: None,
                    }),
                    children: vec![paragraph("note body")],
                },
                MdBlock::Blockquote {
                    alert: None,
                    children: vec![paragraph("plain quote")],
                },
                MdBlock::Table {
                    header: MdTableRow {
                        cells: vec![vec![text("h1")], vec![text("h2")]],
                    },
                    rows: vec![MdTableRow {
                        cells: vec![vec![text("a|b")], Vec::new()],
                    }],
                },
                MdBlock::Html {
                    value: "<ac:structured-macro ac:name=\"toc\" />".to_string(),
                },
                MdBlock::ThematicBreak,
            ],
        };
        let encoded = encode(&root);
        assert_eq!(decode(&encoded), root, "encoded:\n{encoded}");
    }

    fn strong(children: Vec<MdInline>) -> MdInline {
        MdInline::Strong { children }
    }

    fn emphasis(children: Vec<MdInline>) -> MdInline {
        MdInline::Emphasis { children }
    }

    fn delete(children: Vec<MdInline>) -> MdInline {
        MdInline::Delete { children }
    }

    fn code(value: &str) -> MdInline {
        MdInline::InlineCode {
            value: value.to_string(),
        }
    }

    fn encode_paragraph(children: Vec<MdInline>) -> (String, MdRoot) {
        let root = MdRoot {
            children: vec![MdBlock::Paragraph { children }],
        };
        (encode(&root), root)
    }

    #[test]
    fn adjacent_formatting_of_one_kind_stays_separate() {
        let (encoded, root) =
            encode_paragraph(vec![emphasis(vec![text("a")]), emphasis(vec![text("b")])]);
        assert_eq!(encoded, "_a_*b*\n");
        assert_eq!(decode(&encoded), root);

        let (encoded, root) = encode_paragraph(vec![strong(vec![text("a")]), strong(vec![text("b")])]);
        assert_eq!(encoded, "__a__**b**\n");
        assert_eq!(decode(&encoded), root);
    }

    #[test]
    fn emphasis_at_a_word_boundary_inside_strong_uses_tags() {
        let (encoded, root) =
            encode_paragraph(vec![strong(vec![emphasis(vec![text("a")]), text("b")])]);
        assert_eq!(encoded, "**<em>a</em>b**\n");
        assert_eq!(decode(&encoded), root);
    }

    #[test]
    fn intraword_strong_around_punctuation_uses_tags() {
        let (encoded, root) =
            encode_paragraph(vec![text("foo"), strong(vec![text("(bar)")]), text("baz")]);
        assert_eq!(encoded, "foo<strong>(bar)</strong>baz\n");
        assert_eq!(decode(&encoded), root);

        let (encoded, root) = encode_paragraph(vec![text("foo"), strong(vec![text("bar")]), text("baz")]);
        assert_eq!(encoded, "foo**bar**baz\n");
        assert_eq!(decode(&encoded), root);
    }

    #[test]
    fn nested_and_adjacent_formatting_round_trips() {
        let link = |children| MdInline::Link {
            url: "https://example.com".to_string(),
            children,
        };
        let cases: Vec<Vec<MdInline>> = vec![
            vec![delete(vec![text("a")]), delete(vec![text("b")])],
            vec![strong(vec![text("a"), emphasis(vec![text("b")])])],
            vec![strong(vec![emphasis(vec![text("a")])])],
            vec![emphasis(vec![strong(vec![text("a")])])],
            vec![emphasis(vec![text("a")]), strong(vec![text("b")])],
            vec![strong(vec![text("a")]), emphasis(vec![text("b")])],
            vec![strong(vec![text("a")]), text(" "), emphasis(vec![text("b")])],
            vec![text("foo"), emphasis(vec![text("bar")]), text("baz")],
            vec![text("foo"), emphasis(vec![text("(bar)")]), text("baz")],
            vec![text("x "), emphasis(vec![text("a"), strong(vec![text("b")]), text("c")]), text(" y")],
            vec![text("a"), delete(vec![strong(vec![text("b")])]), text("c")],
            vec![strong(vec![code("x")]), text("y")],
            vec![code("x"), emphasis(vec![text("y")]), code("z")],
            vec![emphasis(vec![code("a")]), emphasis(vec![code("b")])],
            vec![link(vec![emphasis(vec![text("a")]), emphasis(vec![text("b")])])],
            vec![emphasis(vec![link(vec![text("a")])]), text("b")],
            vec![strong(vec![text("a "), emphasis(vec![text("b")]), text(" c")]), strong(vec![text("d")])],
        ];
        for children in cases {
            let (encoded, root) = encode_paragraph(children);
            assert_eq!(decode(&encoded), root, "encoded:\n{encoded}");
        }
    }

    #[test]
    fn heading_and_table_formatting_round_trips() {
        let root = MdRoot {
            children: vec![
                MdBlock::Heading {
                    depth: 2,
                    children: vec![emphasis(vec![text("a")]), emphasis(vec![text("b")])],
                },
                MdBlock::Table {
                    header: MdTableRow {
                        cells: vec![
                            vec![strong(vec![text("h")]), strong(vec![text("i")])],
                            vec![text("plain")],
                        ],
                    },
                    rows: vec![MdTableRow {
                        cells: vec![
                            vec![text("x"), strong(vec![text("(y)")]), text("z")],
                            vec![strong(vec![emphasis(vec![text("p")]), text("q")])],
                        ],
                    }],
                },
            ],
        };
        let encoded = encode(&root);
        assert_eq!(decode(&encoded), root, "encoded:\n{encoded}");
    }

    #[test]
    fn style_tags_decode_to_formatting_and_stray_tags_stay_text() {
        let root = decode("<b>bold</b> and <em>em</em> and <del>gone</del>\n\nopen <em>only\n");
        assert_eq!(
            root.children,
            vec![
                MdBlock::Paragraph {
                    children: vec![
                        strong(vec![text("bold")]),
                        text(" and "),
                        emphasis(vec![text("em")]),
                        text(" and "),
                        delete(vec![text("gone")]),
                    ],
                },
                paragraph("open <em>only"),
            ]
        );
    }
}
