use std::collections::HashSet;

use serde::Serialize;
use similar::TextDiff;
use tracing::{debug, info, warn};

use crate::document::canonical_markdown;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::hash::hash_document;
use crate::remote::{RemotePage, RemoteWikiClient};

use super::{
    PathPlanner, SyncContext, SyncStatus, classify, local_hash, page_error, walk_remote_tree,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    pub path: String,
    pub status: SyncStatus,
    pub title: String,
    pub page_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    pub synced: usize,
    pub local_modified: usize,
    pub remote_modified: usize,
    pub conflicts: usize,
    pub local_only: usize,
    pub remote_only: usize,
    pub files: Vec<FileStatus>,
    pub errors: Vec<String>,
}

impl StatusResult {
    fn record(&mut self, file: FileStatus) {
        match file.status {
            SyncStatus::Synced => self.synced += 1,
            SyncStatus::LocalModified => self.local_modified += 1,
            SyncStatus::RemoteModified => self.remote_modified += 1,
            SyncStatus::Conflict => self.conflicts += 1,
            SyncStatus::LocalOnly => self.local_only += 1,
            SyncStatus::RemoteOnly => self.remote_only += 1,
        }
        self.files.push(file);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDiff {
    pub path: String,
    pub title: String,
    pub page_id: Option<String>,
    pub status: SyncStatus,
    pub diff: String,
}

/// A remote page together with its canonical Markdown and hash.
#[derive(Debug, Clone)]
pub(crate) struct RemoteSnapshot {
    pub page: RemotePage,
    pub markdown: String,
    pub hash: String,
}

pub(crate) fn fetch_snapshot(
    remote: &mut dyn RemoteWikiClient,
    page_id: &str,
) -> SyncResult<RemoteSnapshot> {
    let page = remote.get_page(page_id)?;
    let (markdown, document) = canonical_markdown(&page.raw_markup)?;
    let hash = hash_document(&document)?;
    Ok(RemoteSnapshot {
        page,
        markdown,
        hash,
    })
}

struct SurveyEntry {
    file: FileStatus,
    remote_markdown: Option<String>,
    local_body: Option<String>,
}

#[derive(Default)]
struct Survey {
    entries: Vec<SurveyEntry>,
    errors: Vec<String>,
}

/// Classify every remote page under the root and every local file.
fn survey(ctx: &SyncContext, remote: &mut dyn RemoteWikiClient) -> SyncResult<Survey> {
    let mut survey = Survey {
        errors: ctx.load_errors().to_vec(),
        ..Survey::default()
    };
    let nodes = walk_remote_tree(remote, &ctx.root_page_id, &mut survey.errors)?;
    let mut planner = PathPlanner::new(ctx);
    let mut visited: HashSet<String> = HashSet::new();

    for node in &nodes {
        visited.insert(node.id.clone());
        let path = planner.plan(node);
        let snapshot = match fetch_snapshot(remote, &node.id) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(page = %node.title, %error, "failed to fetch remote page");
                survey.errors.push(page_error(&node.title, error));
                continue;
            }
        };
        let local = ctx.page_by_id(&node.id);
        let local_hash = match local.map(local_hash).transpose() {
            Ok(hash) => hash,
            Err(error) => {
                survey.errors.push(page_error(&node.title, error));
                continue;
            }
        };
        let status = classify(
            local_hash.as_deref(),
            local.and_then(|page| page.front_matter.content_hash.as_deref()),
            Some(&snapshot.hash),
        );
        debug!(page = %node.title, status = status.as_str(), "classified page");
        survey.entries.push(SurveyEntry {
            file: FileStatus {
                path: ctx.paths.relative_to_root(&path),
                status,
                title: snapshot.page.title.clone(),
                page_id: Some(node.id.clone()),
            },
            remote_markdown: Some(snapshot.markdown),
            local_body: local.map(|page| page.body.clone()),
        });
    }

    for page in ctx.pages() {
        let page_id = page.page_id();
        if ctx.is_shadowed(page) || page_id.is_some_and(|id| visited.contains(id)) {
            continue;
        }
        let local = match local_hash(page) {
            Ok(hash) => hash,
            Err(error) => {
                survey.errors.push(page_error(&page.relative_path, error));
                continue;
            }
        };
        // Linked pages outside the walked tree are looked up directly.
        let mut status = SyncStatus::LocalOnly;
        let mut remote_markdown = None;
        if let Some(id) = page_id {
            match fetch_snapshot(remote, id) {
                Ok(snapshot) => {
                    status = classify(
                        Some(&local),
                        page.front_matter.content_hash.as_deref(),
                        Some(&snapshot.hash),
                    );
                    remote_markdown = Some(snapshot.markdown);
                }
                Err(SyncError::Remote(RemoteError::NotFound(_))) => {}
                Err(error) => {
                    warn!(page = %page.relative_path, %error, "failed to fetch remote page");
                    survey.errors.push(page_error(&page.title(), error));
                    continue;
                }
            }
        }
        survey.entries.push(SurveyEntry {
            file: FileStatus {
                path: page.relative_path.clone(),
                status,
                title: page.title(),
                page_id: page_id.map(str::to_string),
            },
            remote_markdown,
            local_body: Some(page.body.clone()),
        });
    }

    survey
        .entries
        .sort_by(|left, right| left.file.path.cmp(&right.file.path));
    Ok(survey)
}

/// Read-only comparison of the mirror against the remote tree.
pub fn status(ctx: SyncContext, remote: &mut dyn RemoteWikiClient) -> SyncResult<StatusResult> {
    let survey = survey(&ctx, remote)?;
    let mut result = StatusResult {
        errors: survey.errors,
        ..StatusResult::default()
    };
    for entry in survey.entries {
        result.record(entry.file);
    }
    info!(
        synced = result.synced,
        changed = result.files.len() - result.synced,
        errors = result.errors.len(),
        "status complete"
    );
    Ok(result)
}

/// Unified diffs from remote Markdown to the local body for every page that
/// is not in sync.
pub fn diff_pages(ctx: SyncContext, remote: &mut dyn RemoteWikiClient) -> SyncResult<Vec<PageDiff>> {
    let survey = survey(&ctx, remote)?;
    for error in &survey.errors {
        warn!(%error, "page skipped in diff");
    }
    Ok(survey
        .entries
        .into_iter()
        .filter(|entry| entry.file.status != SyncStatus::Synced)
        .map(|entry| {
            let old = entry.remote_markdown.unwrap_or_default();
            let new = entry.local_body.unwrap_or_default();
            let diff = TextDiff::from_lines(&old, &new)
                .unified_diff()
                .context_radius(3)
                .header(
                    &format!("remote/{}", entry.file.path),
                    &format!("local/{}", entry.file.path),
                )
                .to_string();
            PageDiff {
                path: entry.file.path,
                title: entry.file.title,
                page_id: entry.file.page_id,
                status: entry.file.status,
                diff,
            }
        })
        .collect())
}
