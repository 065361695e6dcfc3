//! Node-level converters between the [`Document`](crate::ast::Document) and the
//! two parse trees. Every function here is total: content without a mapping
//! degrades to [`BlockNode::Unsupported`](crate::ast::BlockNode::Unsupported)
//! or is flattened into its children, never dropped.

pub mod html;
pub mod markdown;
