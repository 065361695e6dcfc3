//! Reconciliation between the remote page tree and the local mirror.
//!
//! Every operation takes a [`SyncContext`] loaded once per invocation, compares
//! content hashes in AST space and reports per-page failures in its result
//! instead of aborting the batch.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::path::PathBuf;

use serde::Serialize;
use tracing::warn;

use crate::config::DEFAULT_AUTHOR_EMAIL_DOMAIN;
use crate::document::markdown_to_document;
use crate::error::{SyncResult, VcsError};
use crate::filesystem::{LocalPage, UnreadablePage, children_dir, page_path_for, scan_pages};
use crate::hash::hash_document;
use crate::remote::{RemotePageRef, RemoteWikiClient};
use crate::runtime::ResolvedPaths;
use crate::vcs::VersionControl;

pub mod ledger;
mod pull;
mod push;
mod status;

pub use pull::{PullOptions, PullResult, PulledPage, pull};
pub use push::{PushAction, PushActionKind, PushOptions, PushResult, push};
pub use status::{FileStatus, PageDiff, StatusResult, diff_pages, status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Synced,
    LocalModified,
    RemoteModified,
    Conflict,
    LocalOnly,
    RemoteOnly,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::LocalModified => "local-modified",
            Self::RemoteModified => "remote-modified",
            Self::Conflict => "conflict",
            Self::LocalOnly => "local-only",
            Self::RemoteOnly => "remote-only",
        }
    }
}

/// Classify a page from its local, baseline and remote content hashes.
///
/// `local` is `None` when no file mirrors the page, `remote` is `None` when the
/// page does not exist remotely. Edits that converge on the same content on
/// both sides count as synced.
pub fn classify(local: Option<&str>, baseline: Option<&str>, remote: Option<&str>) -> SyncStatus {
    let (local, remote) = match (local, remote) {
        (None, _) => return SyncStatus::RemoteOnly,
        (Some(_), None) => return SyncStatus::LocalOnly,
        (Some(local), Some(remote)) => (local, remote),
    };
    let Some(baseline) = baseline else {
        return if local == remote {
            SyncStatus::Synced
        } else {
            SyncStatus::Conflict
        };
    };
    match (local == baseline, remote == baseline) {
        (true, true) => SyncStatus::Synced,
        (false, true) => SyncStatus::LocalModified,
        (true, false) => SyncStatus::RemoteModified,
        (false, false) if local == remote => SyncStatus::Synced,
        (false, false) => SyncStatus::Conflict,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub operation: &'static str,
    pub completed: usize,
    pub total: usize,
    pub title: String,
}

/// Local state for one sync invocation.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub paths: ResolvedPaths,
    pub root_page_id: String,
    pub author_email_domain: String,
    pages: Vec<LocalPage>,
    by_page_id: HashMap<String, usize>,
    unreadable: Vec<UnreadablePage>,
    load_errors: Vec<String>,
}

impl SyncContext {
    /// Scan the content directory. Files that cannot be read, and files
    /// repeating a `pageId` already claimed by an earlier path, are left out
    /// of the page index and reported through [`SyncContext::load_errors`].
    pub fn load(paths: ResolvedPaths, root_page_id: impl Into<String>) -> SyncResult<Self> {
        let scan = scan_pages(&paths)?;
        let mut load_errors: Vec<String> = scan
            .unreadable
            .iter()
            .map(|file| page_error(&file.relative_path, &file.reason))
            .collect();
        let pages = scan.pages;
        let mut by_page_id = HashMap::new();
        for (index, page) in pages.iter().enumerate() {
            let Some(page_id) = page.page_id() else {
                continue;
            };
            if let Some(previous) = by_page_id.get(page_id) {
                let previous: &LocalPage = &pages[*previous];
                warn!(
                    page_id,
                    kept = %previous.relative_path,
                    ignored = %page.relative_path,
                    "duplicate pageId in local files"
                );
                load_errors.push(page_error(
                    &page.relative_path,
                    format!(
                        "pageId {page_id} is already used by {}; file ignored",
                        previous.relative_path
                    ),
                ));
                continue;
            }
            by_page_id.insert(page_id.to_string(), index);
        }
        Ok(Self {
            paths,
            root_page_id: root_page_id.into(),
            author_email_domain: DEFAULT_AUTHOR_EMAIL_DOMAIN.to_string(),
            pages,
            by_page_id,
            unreadable: scan.unreadable,
            load_errors,
        })
    }

    pub fn with_author_email_domain(mut self, domain: impl Into<String>) -> Self {
        self.author_email_domain = domain.into();
        self
    }

    pub fn pages(&self) -> &[LocalPage] {
        &self.pages
    }

    pub fn page_by_id(&self, page_id: &str) -> Option<&LocalPage> {
        self.by_page_id.get(page_id).map(|index| &self.pages[*index])
    }

    /// Files not yet linked to a remote page.
    pub fn unlinked_pages(&self) -> impl Iterator<Item = &LocalPage> {
        self.pages.iter().filter(|page| page.page_id().is_none())
    }

    /// Whether another file already claimed this page's `pageId`.
    pub fn is_shadowed(&self, page: &LocalPage) -> bool {
        page.page_id()
            .and_then(|id| self.page_by_id(id))
            .is_some_and(|indexed| indexed.path != page.path)
    }

    /// Per-file problems found while loading: unreadable files and
    /// duplicate `pageId`s.
    pub fn load_errors(&self) -> &[String] {
        &self.load_errors
    }

    pub fn unreadable_pages(&self) -> &[UnreadablePage] {
        &self.unreadable
    }
}

/// A page found while walking the remote tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoteNode {
    pub id: String,
    pub title: String,
    pub parent_id: String,
    pub position: u32,
}

/// List the tree under `root_id`, parents before children, siblings in order.
///
/// Failing to list the root is fatal; failures deeper down skip that subtree.
pub(crate) fn walk_remote_tree(
    remote: &mut dyn RemoteWikiClient,
    root_id: &str,
    errors: &mut Vec<String>,
) -> SyncResult<Vec<RemoteNode>> {
    let top = remote.get_all_children(root_id)?;
    let mut stack = Vec::new();
    push_children(&mut stack, root_id, top);

    let mut nodes = Vec::new();
    while let Some(node) = stack.pop() {
        match remote.get_all_children(&node.id) {
            Ok(children) => push_children(&mut stack, &node.id, children),
            Err(error) => {
                warn!(page = %node.title, %error, "failed to list child pages");
                errors.push(page_error(&node.title, error));
            }
        }
        nodes.push(node);
    }
    Ok(nodes)
}

fn push_children(stack: &mut Vec<RemoteNode>, parent_id: &str, children: Vec<RemotePageRef>) {
    let nodes: Vec<RemoteNode> = children
        .into_iter()
        .enumerate()
        .map(|(position, child)| RemoteNode {
            id: child.id,
            title: child.title,
            parent_id: parent_id.to_string(),
            position: u32::try_from(position).unwrap_or(u32::MAX),
        })
        .collect();
    stack.extend(nodes.into_iter().rev());
}

/// Decides where pages without a local file are written.
pub(crate) struct PathPlanner<'a> {
    ctx: &'a SyncContext,
    planned: HashMap<String, PathBuf>,
    taken: HashSet<PathBuf>,
}

impl<'a> PathPlanner<'a> {
    pub fn new(ctx: &'a SyncContext) -> Self {
        Self {
            ctx,
            planned: HashMap::new(),
            taken: ctx
                .pages
                .iter()
                .map(|page| page.path.clone())
                .chain(ctx.unreadable.iter().map(|file| file.path.clone()))
                .collect(),
        }
    }

    /// Existing local path for the page, else a fresh path under its parent.
    /// Nodes must be planned parents first.
    pub fn plan(&mut self, node: &RemoteNode) -> PathBuf {
        if let Some(page) = self.ctx.page_by_id(&node.id) {
            self.planned.insert(node.id.clone(), page.path.clone());
            return page.path.clone();
        }
        let parent_dir = match self.planned.get(&node.parent_id) {
            Some(parent_path) => children_dir(parent_path),
            None => self.ctx.paths.content_dir.clone(),
        };
        let path = page_path_for(&parent_dir, &node.title, &node.id, &self.taken);
        self.taken.insert(path.clone());
        self.planned.insert(node.id.clone(), path.clone());
        path
    }
}

pub(crate) fn local_hash(page: &LocalPage) -> SyncResult<String> {
    Ok(hash_document(&markdown_to_document(&page.body))?)
}

pub(crate) fn page_error(label: &str, error: impl Display) -> String {
    format!("{label}: {error}")
}

pub(crate) fn is_cancelled(cancel: Option<&std::sync::atomic::AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(std::sync::atomic::Ordering::Relaxed))
}

/// Refuse to touch a repository that is missing or mid-merge.
pub(crate) fn ensure_vcs_ready(
    ctx: &SyncContext,
    vcs: &dyn VersionControl,
) -> SyncResult<crate::vcs::VcsStatus> {
    if !vcs.is_initialized()? {
        return Err(VcsError::NotInitialized(ctx.paths.project_root.clone()).into());
    }
    let status = vcs.status()?;
    if status.has_conflicts {
        return Err(VcsError::MergeConflict.into());
    }
    Ok(status)
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::MockWiki;

    #[test]
    fn classification_table() {
        let cases = [
            (None, None, Some("r"), SyncStatus::RemoteOnly),
            (Some("l"), None, None, SyncStatus::LocalOnly),
            (Some("l"), Some("b"), None, SyncStatus::LocalOnly),
            (Some("b"), Some("b"), Some("b"), SyncStatus::Synced),
            (Some("l"), Some("b"), Some("b"), SyncStatus::LocalModified),
            (Some("b"), Some("b"), Some("r"), SyncStatus::RemoteModified),
            (Some("l"), Some("b"), Some("r"), SyncStatus::Conflict),
            (Some("x"), Some("b"), Some("x"), SyncStatus::Synced),
            (Some("x"), None, Some("x"), SyncStatus::Synced),
            (Some("x"), None, Some("y"), SyncStatus::Conflict),
        ];
        for (local, baseline, remote, expected) in cases {
            assert_eq!(
                classify(local, baseline, remote),
                expected,
                "local={local:?} baseline={baseline:?} remote={remote:?}"
            );
            // Classification is a pure function of its inputs.
            assert_eq!(classify(local, baseline, remote), expected);
        }
    }

    #[test]
    fn remote_tree_walk_is_parents_first_in_sibling_order() {
        let mut wiki = MockWiki::new("root");
        wiki.add_page("1", "root", "Guide", "<p>g</p>");
        wiki.add_page("2", "1", "Install", "<p>i</p>");
        wiki.add_page("3", "1", "Configure", "<p>c</p>");
        wiki.add_page("4", "root", "FAQ", "<p>f</p>");
        wiki.fail_listing("3");

        let mut errors = Vec::new();
        let nodes = walk_remote_tree(&mut wiki, "root", &mut errors).expect("walk");
        let ids: Vec<&str> = nodes.iter().map(|node| node.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
        assert_eq!(nodes[2].position, 1);
        assert_eq!(nodes[3].parent_id, "root");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Configure: "));

        wiki.fail_listing("root");
        assert!(walk_remote_tree(&mut wiki, "root", &mut Vec::new()).is_err());
    }
}
