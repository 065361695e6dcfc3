use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::document::{document_to_remote_markup, markdown_to_document};
use crate::error::{RemoteError, SyncError, SyncResult, VcsError};
use crate::filesystem::{LocalPage, enclosing_page, write_page_atomic};
use crate::frontmatter::PageFrontMatter;
use crate::remote::RemoteWikiClient;
use crate::runtime::ResolvedPaths;
use crate::vcs::VersionControl;

use super::ledger::{LedgerEntry, SyncLedger};
use super::status::fetch_snapshot;
use super::{
    SyncContext, SyncProgress, SyncStatus, classify, ensure_vcs_ready, local_hash, page_error,
};

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub dry_run: bool,
    /// Revision comment for updated pages.
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PushActionKind {
    Create,
    Update,
    Delete,
    Conflict,
}

impl PushActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAction {
    pub page_id: Option<String>,
    pub title: String,
    pub path: String,
    pub action: PushActionKind,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub dry_run: bool,
    pub pushed: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub errors: Vec<String>,
    pub actions: Vec<PushAction>,
    pub request_count: usize,
}

impl PushResult {
    fn count(&mut self, action: PushActionKind) {
        match action {
            PushActionKind::Create => self.created += 1,
            PushActionKind::Update => self.updated += 1,
            PushActionKind::Delete => self.deleted += 1,
            PushActionKind::Conflict => return,
        }
        self.pushed += 1;
    }
}

/// Bookkeeping shared by every mutation of one push run.
struct PushRun<'a> {
    ctx: &'a SyncContext,
    ledger: SyncLedger,
    created_ids: HashMap<PathBuf, String>,
    staged: Vec<String>,
    result: PushResult,
}

/// Send local edits, new files and deletions to the wiki.
pub fn push(
    ctx: SyncContext,
    remote: &mut dyn RemoteWikiClient,
    vcs: &mut dyn VersionControl,
    options: &PushOptions,
    progress: &mut dyn FnMut(&SyncProgress),
) -> SyncResult<PushResult> {
    let vcs_status = ensure_vcs_ready(&ctx, vcs)?;
    if vcs_status.has_changes {
        return Err(SyncError::UncommittedChanges);
    }

    let mut run = PushRun {
        ctx: &ctx,
        ledger: SyncLedger::open(&ctx.paths)?,
        created_ids: HashMap::new(),
        staged: Vec::new(),
        result: PushResult {
            dry_run: options.dry_run,
            errors: ctx.load_errors().to_vec(),
            ..PushResult::default()
        },
    };

    let total = ctx.pages().len();
    for (index, page) in ctx.pages().iter().enumerate() {
        let outcome = push_page(&mut run, remote, page, options);
        progress(&SyncProgress {
            operation: "push",
            completed: index + 1,
            total,
            title: page.title(),
        });
        if let Err(error) = outcome {
            finish(&mut run, vcs)?;
            return Err(error);
        }
    }
    push_deletions(&mut run, remote, options)?;
    finish(&mut run, vcs)?;

    let mut result = run.result;
    result.request_count = remote.request_count();
    info!(
        dry_run = result.dry_run,
        created = result.created,
        updated = result.updated,
        deleted = result.deleted,
        errors = result.errors.len(),
        "push complete"
    );
    Ok(result)
}

/// Commit whatever front matter was rewritten so far.
fn finish(run: &mut PushRun<'_>, vcs: &mut dyn VersionControl) -> SyncResult<()> {
    if run.staged.is_empty() {
        return Ok(());
    }
    vcs.add_paths(&run.staged)?;
    let message = format!("Record push of {} page(s)", run.result.pushed);
    match vcs.commit(&message, None) {
        Ok(hash) => debug!(%hash, "recorded push"),
        Err(VcsError::NoChanges) => {}
        Err(error) => return Err(error.into()),
    }
    run.staged.clear();
    Ok(())
}

/// Handle one local file. Only a failed front matter write after a remote
/// mutation is returned as an error; everything else lands in `errors`.
fn push_page(
    run: &mut PushRun<'_>,
    remote: &mut dyn RemoteWikiClient,
    page: &LocalPage,
    options: &PushOptions,
) -> SyncResult<()> {
    // Reported in the context's load errors.
    if run.ctx.is_shadowed(page) {
        return Ok(());
    }
    let title = page.title();

    let local = match local_hash(page) {
        Ok(hash) => hash,
        Err(error) => {
            run.result.errors.push(page_error(&title, error));
            return Ok(());
        }
    };
    let status = match page.page_id() {
        None => SyncStatus::LocalOnly,
        Some(id) => match fetch_snapshot(remote, id) {
            Ok(snapshot) => classify(
                Some(&local),
                page.front_matter.content_hash.as_deref(),
                Some(&snapshot.hash),
            ),
            Err(SyncError::Remote(RemoteError::NotFound(_))) => SyncStatus::LocalOnly,
            Err(error) => {
                warn!(page = %title, %error, "failed to fetch remote page");
                run.result.errors.push(page_error(&title, error));
                return Ok(());
            }
        },
    };

    let action = match status {
        SyncStatus::LocalOnly => PushActionKind::Create,
        SyncStatus::LocalModified => PushActionKind::Update,
        SyncStatus::Conflict => {
            warn!(page = %title, "skipping page changed on both sides");
            run.result
                .errors
                .push(page_error(&title, SyncError::Conflict(title.clone())));
            run.result.actions.push(PushAction {
                page_id: page.page_id().map(str::to_string),
                title,
                path: page.relative_path.clone(),
                action: PushActionKind::Conflict,
            });
            return Ok(());
        }
        SyncStatus::Synced | SyncStatus::RemoteModified | SyncStatus::RemoteOnly => {
            return Ok(());
        }
    };

    run.result.actions.push(PushAction {
        page_id: page.page_id().map(str::to_string),
        title: title.clone(),
        path: page.relative_path.clone(),
        action,
    });
    if options.dry_run {
        run.result.count(action);
        return Ok(());
    }

    let markup = match document_to_remote_markup(&markdown_to_document(&page.body)) {
        Ok(markup) => markup,
        Err(error) => {
            run.result.errors.push(page_error(&title, error));
            return Ok(());
        }
    };

    let (page_id, version, parent_id) = match action {
        PushActionKind::Create => {
            let parent_id = resolve_parent(run, page);
            match remote.create_page(&parent_id, &title, &markup) {
                Ok(new_id) => {
                    if let Some(stale) = page.page_id() {
                        run.ledger.remove(stale)?;
                    }
                    run.created_ids.insert(page.path.clone(), new_id.clone());
                    (new_id, 1, Some(parent_id))
                }
                Err(error) => {
                    warn!(page = %title, %error, "failed to create page");
                    run.result.errors.push(page_error(&title, error));
                    return Ok(());
                }
            }
        }
        _ => {
            let id = page.page_id().unwrap_or_default().to_string();
            match remote.update_page(&id, &title, &markup, options.message.as_deref()) {
                Ok(version) => (id, version, page.front_matter.parent_id.clone()),
                Err(error) => {
                    warn!(page = %title, %error, "failed to update page");
                    run.result.errors.push(page_error(&title, error));
                    return Ok(());
                }
            }
        }
    };
    run.result.count(action);
    debug!(page = %title, %page_id, version, action = action.as_str(), "pushed page");

    let front_matter = PageFrontMatter {
        page_id: Some(page_id.clone()),
        version,
        title: title.clone(),
        updated: Some(Utc::now()),
        parent_id,
        position: page.front_matter.position,
        content_hash: Some(local.clone()),
    };
    write_page_atomic(&page.path, &front_matter, &page.body)?;
    run.staged.push(page.relative_path.clone());
    run.ledger.upsert(&LedgerEntry::new(
        page_id,
        &page.relative_path,
        title,
        version,
        local,
    ))?;
    Ok(())
}

/// Parent for a new page: explicit `parentId`, else the enclosing page in the
/// file tree (possibly created earlier in this run), else the root.
fn resolve_parent(run: &PushRun<'_>, page: &LocalPage) -> String {
    if let Some(parent) = page
        .front_matter
        .parent_id
        .as_deref()
        .filter(|parent| !parent.trim().is_empty())
    {
        return parent.to_string();
    }
    if let Some(enclosing) = enclosing_page(run.ctx.pages(), page) {
        if let Some(id) = run.created_ids.get(&enclosing.path) {
            return id.clone();
        }
        if let Some(id) = enclosing.page_id() {
            return id.to_string();
        }
    }
    run.ctx.root_page_id.clone()
}

/// Delete remote pages whose mirrored file is gone, deepest paths first.
fn push_deletions(
    run: &mut PushRun<'_>,
    remote: &mut dyn RemoteWikiClient,
    options: &PushOptions,
) -> SyncResult<()> {
    let mut removed: Vec<LedgerEntry> = run
        .ledger
        .entries()?
        .into_iter()
        .filter(|entry| run.ctx.page_by_id(&entry.page_id).is_none())
        .filter(|entry| !absolute_path(&run.ctx.paths, &entry.relative_path).exists())
        .collect();
    removed.sort_by(|left, right| {
        depth(&right.relative_path)
            .cmp(&depth(&left.relative_path))
            .then_with(|| left.relative_path.cmp(&right.relative_path))
    });

    for entry in removed {
        let action = PushAction {
            page_id: Some(entry.page_id.clone()),
            title: entry.title.clone(),
            path: entry.relative_path.clone(),
            action: PushActionKind::Delete,
        };
        if options.dry_run {
            run.result.actions.push(action);
            run.result.count(PushActionKind::Delete);
            continue;
        }
        match remote.delete_page(&entry.page_id) {
            Ok(()) => {
                run.result.actions.push(action);
                run.result.count(PushActionKind::Delete);
                run.ledger.remove(&entry.page_id)?;
            }
            Err(RemoteError::NotFound(_)) => {
                debug!(page = %entry.title, "page already gone remotely");
                run.ledger.remove(&entry.page_id)?;
            }
            Err(error) => {
                warn!(page = %entry.title, %error, "failed to delete page");
                run.result.errors.push(page_error(&entry.title, error));
            }
        }
    }
    Ok(())
}

fn absolute_path(paths: &ResolvedPaths, relative: &str) -> PathBuf {
    let mut output = paths.project_root.clone();
    for segment in relative.split('/') {
        if !segment.is_empty() {
            output.push(segment);
        }
    }
    output
}

fn depth(relative: &str) -> usize {
    Path::new(relative).components().count()
}
