pub mod ast;
pub mod config;
pub mod convert;
pub mod document;
pub mod error;
pub mod filesystem;
pub mod frontmatter;
pub mod hash;
pub mod html;
pub mod markdown;
pub mod remote;
pub mod runtime;
pub mod storage;
pub mod sync;
pub mod vcs;
