//! Format-neutral page representation.
//!
//! Every conversion goes through [`Document`]: remote storage markup and local
//! Markdown are both decoded into it and encoded from it. Trees are owned and
//! immutable once built; decoders return inline content in normal form (see
//! [`normalize_inlines`]).

use serde::{Deserialize, Serialize};

use crate::error::ConversionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub version: u32,
    pub children: Vec<BlockNode>,
}

impl Document {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(children: Vec<BlockNode>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            children,
        }
    }

    /// Check the structural invariants encoders rely on.
    pub fn validate(&self) -> Result<(), ConversionError> {
        if self.version != Self::CURRENT_VERSION {
            return Err(ConversionError::UnsupportedVersion {
                found: self.version,
                expected: Self::CURRENT_VERSION,
            });
        }
        validate_blocks(&self.children)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BlockNode {
    Heading {
        level: u8,
        children: Vec<InlineNode>,
    },
    Paragraph {
        children: Vec<InlineNode>,
    },
    CodeBlock {
        code: String,
        language: Option<String>,
    },
    ThematicBreak,
    BlockQuote {
        children: Vec<BlockNode>,
    },
    List {
        ordered: bool,
        items: Vec<ListItem>,
    },
    Table {
        header: Option<TableRow>,
        rows: Vec<TableRow>,
    },
    Macro(MacroNode),
    /// Content no converter understands, kept verbatim so it survives a round trip.
    Unsupported {
        raw: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub children: Vec<BlockNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub cells: Vec<TableCell>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCell {
    pub is_header: bool,
    pub children: Vec<InlineNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InlineNode {
    Text { value: String },
    Strong { children: Vec<InlineNode> },
    Emphasis { children: Vec<InlineNode> },
    Strikethrough { children: Vec<InlineNode> },
    InlineCode { value: String },
    Link { href: String, children: Vec<InlineNode> },
    Image { src: String, alt: String },
    Break,
}

impl InlineNode {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text {
            value: value.into(),
        }
    }
}

/// Wiki-specific construct (panels, expand sections, unknown macros with a body).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroNode {
    pub panel_type: PanelType,
    pub parameters: Vec<MacroParameter>,
    pub children: Vec<BlockNode>,
}

impl MacroNode {
    pub fn title(&self) -> Option<&str> {
        self.parameter("title")
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|parameter| parameter.name == name)
            .map(|parameter| parameter.value.as_str())
    }

    /// Whether Markdown can carry this macro as an alert blockquote.
    pub fn is_markdown_representable(&self) -> bool {
        self.panel_type.is_known()
            && self
                .parameters
                .iter()
                .all(|parameter| parameter.name == "title")
            && self.parameters.len() <= 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroParameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PanelType {
    Info,
    Note,
    Warning,
    Tip,
    Success,
    Error,
    Expand,
    Panel,
    Other(String),
}

impl PanelType {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "info" => Self::Info,
            "note" => Self::Note,
            "warning" => Self::Warning,
            "tip" => Self::Tip,
            "success" => Self::Success,
            "error" => Self::Error,
            "expand" => Self::Expand,
            "panel" => Self::Panel,
            _ => Self::Other(name.trim().to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Info => "info",
            Self::Note => "note",
            Self::Warning => "warning",
            Self::Tip => "tip",
            Self::Success => "success",
            Self::Error => "error",
            Self::Expand => "expand",
            Self::Panel => "panel",
            Self::Other(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

/// Merge adjacent text, drop empty text and empty formatting wrappers.
pub fn normalize_inlines(nodes: Vec<InlineNode>) -> Vec<InlineNode> {
    let mut output: Vec<InlineNode> = Vec::with_capacity(nodes.len());
    for node in nodes {
        let node = match node {
            InlineNode::Text { value } if value.is_empty() => continue,
            InlineNode::Strong { children } => {
                let children = normalize_inlines(children);
                if children.is_empty() {
                    continue;
                }
                InlineNode::Strong { children }
            }
            InlineNode::Emphasis { children } => {
                let children = normalize_inlines(children);
                if children.is_empty() {
                    continue;
                }
                InlineNode::Emphasis { children }
            }
            InlineNode::Strikethrough { children } => {
                let children = normalize_inlines(children);
                if children.is_empty() {
                    continue;
                }
                InlineNode::Strikethrough { children }
            }
            InlineNode::Link { href, children } => InlineNode::Link {
                href,
                children: normalize_inlines(children),
            },
            other => other,
        };

        if let InlineNode::Text { value } = &node
            && let Some(InlineNode::Text { value: previous }) = output.last_mut()
        {
            previous.push_str(value);
            continue;
        }
        output.push(node);
    }
    output
}

/// Concatenated text content, formatting dropped.
pub fn plain_text(nodes: &[InlineNode]) -> String {
    let mut output = String::new();
    collect_plain_text(nodes, &mut output);
    output
}

fn collect_plain_text(nodes: &[InlineNode], output: &mut String) {
    for node in nodes {
        match node {
            InlineNode::Text { value } | InlineNode::InlineCode { value } => output.push_str(value),
            InlineNode::Strong { children }
            | InlineNode::Emphasis { children }
            | InlineNode::Strikethrough { children }
            | InlineNode::Link { children, .. } => collect_plain_text(children, output),
            InlineNode::Image { alt, .. } => output.push_str(alt),
            InlineNode::Break => output.push('\n'),
        }
    }
}

fn validate_blocks(blocks: &[BlockNode]) -> Result<(), ConversionError> {
    for block in blocks {
        match block {
            BlockNode::Heading { level, .. } => {
                if !(1..=6).contains(level) {
                    return Err(ConversionError::InvalidHeadingLevel(*level));
                }
            }
            BlockNode::BlockQuote { children } => validate_blocks(children)?,
            BlockNode::List { items, .. } => {
                for item in items {
                    validate_blocks(&item.children)?;
                }
            }
            BlockNode::Macro(node) => validate_blocks(&node.children)?,
            BlockNode::Paragraph { .. }
            | BlockNode::CodeBlock { .. }
            | BlockNode::ThematicBreak
            | BlockNode::Table { .. }
            | BlockNode::Unsupported { .. } => {}
        }
    }
    Ok(())
}
