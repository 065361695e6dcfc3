use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::document::canonical_markdown;
use crate::error::{SyncResult, VcsError};
use crate::filesystem::{slugify, write_page_atomic};
use crate::frontmatter::PageFrontMatter;
use crate::hash::hash_document;
use crate::remote::RemoteWikiClient;
use crate::vcs::{CommitAuthor, VersionControl};

use super::ledger::{LedgerEntry, SyncLedger};
use super::status::fetch_snapshot;
use super::{
    PathPlanner, SyncContext, SyncProgress, SyncStatus, classify, ensure_vcs_ready, is_cancelled,
    local_hash, page_error, walk_remote_tree,
};

#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Overwrite pages with local edits.
    pub force: bool,
    /// Commit every remote version separately instead of one snapshot commit.
    pub replay_history: bool,
    pub branch: Option<String>,
    pub cancel: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PulledPage {
    pub page_id: String,
    pub title: String,
    pub path: String,
    pub action: String,
    pub version: u64,
    pub status: SyncStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResult {
    pub pulled: usize,
    pub commits: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub pages: Vec<PulledPage>,
    pub cancelled: bool,
    pub request_count: usize,
}

/// A remote page whose local file is about to change.
struct PlannedWrite {
    tree_index: usize,
    path: PathBuf,
    relative_path: String,
    front_matter: PageFrontMatter,
    markdown: String,
    action: &'static str,
    status: SyncStatus,
    local_version: u64,
}

impl PlannedWrite {
    fn page_id(&self) -> &str {
        self.front_matter.page_id.as_deref().unwrap_or_default()
    }
}

/// One remote version scheduled for its own commit.
struct ReplayEvent {
    timestamp: DateTime<Utc>,
    tree_index: usize,
    version: u64,
    write: usize,
    front_matter: PageFrontMatter,
    markdown: String,
    author: Option<CommitAuthor>,
    message: Option<String>,
}

fn replay_order(left: &ReplayEvent, right: &ReplayEvent) -> Ordering {
    left.timestamp
        .cmp(&right.timestamp)
        .then(left.tree_index.cmp(&right.tree_index))
        .then(left.version.cmp(&right.version))
}

/// Bring the local mirror up to date with the remote tree and commit the result.
pub fn pull(
    ctx: SyncContext,
    remote: &mut dyn RemoteWikiClient,
    vcs: &mut dyn VersionControl,
    options: &PullOptions,
    progress: &mut dyn FnMut(&SyncProgress),
) -> SyncResult<PullResult> {
    ensure_vcs_ready(&ctx, vcs)?;
    if let Some(branch) = &options.branch {
        vcs.create_branch(branch)?;
    }
    let ledger = SyncLedger::open(&ctx.paths)?;
    let cancel = options.cancel.as_deref();

    let mut result = PullResult {
        errors: ctx.load_errors().to_vec(),
        ..PullResult::default()
    };
    let nodes = walk_remote_tree(remote, &ctx.root_page_id, &mut result.errors)?;
    let mut planner = PathPlanner::new(&ctx);
    let mut planned = Vec::new();

    for (tree_index, node) in nodes.iter().enumerate() {
        if is_cancelled(cancel) {
            result.cancelled = true;
            break;
        }
        let path = planner.plan(node);
        let relative_path = ctx.paths.relative_to_root(&path);
        let snapshot = match fetch_snapshot(remote, &node.id) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(page = %node.title, %error, "failed to fetch remote page");
                result.errors.push(page_error(&node.title, error));
                continue;
            }
        };

        let local = ctx.page_by_id(&node.id);
        let local_hash = match local.map(local_hash).transpose() {
            Ok(hash) => hash,
            Err(error) => {
                result.errors.push(page_error(&node.title, error));
                continue;
            }
        };
        let status = classify(
            local_hash.as_deref(),
            local.and_then(|page| page.front_matter.content_hash.as_deref()),
            Some(&snapshot.hash),
        );
        let front_matter = PageFrontMatter {
            page_id: Some(node.id.clone()),
            version: snapshot.page.version,
            title: snapshot.page.title.clone(),
            updated: snapshot.page.updated,
            parent_id: Some(node.parent_id.clone()),
            position: Some(node.position),
            content_hash: Some(snapshot.hash.clone()),
        };
        let page_record = |action: &str| PulledPage {
            page_id: node.id.clone(),
            title: snapshot.page.title.clone(),
            path: relative_path.clone(),
            action: action.to_string(),
            version: snapshot.page.version,
            status,
        };

        if matches!(status, SyncStatus::LocalModified | SyncStatus::Conflict) && !options.force {
            debug!(page = %node.title, status = status.as_str(), "keeping local edits");
            result.skipped += 1;
            result.pages.push(page_record("skipped"));
            continue;
        }
        if let Some(page) = local
            && page.front_matter == front_matter
            && page.body == snapshot.markdown
        {
            result.unchanged += 1;
            result.pages.push(page_record("unchanged"));
            continue;
        }

        planned.push(PlannedWrite {
            tree_index,
            path,
            relative_path,
            front_matter,
            markdown: snapshot.markdown,
            action: if local.is_some() { "updated" } else { "created" },
            status,
            local_version: local.map(|page| page.front_matter.version).unwrap_or(0),
        });
    }

    if options.replay_history {
        replay(&ctx, remote, vcs, &ledger, &planned, options, progress, &mut result)?;
    } else {
        write_snapshot(vcs, &ledger, &planned, cancel, progress, &mut result)?;
    }

    result.request_count = remote.request_count();
    info!(
        pulled = result.pulled,
        commits = result.commits,
        skipped = result.skipped,
        errors = result.errors.len(),
        "pull complete"
    );
    Ok(result)
}

fn record_written(
    ledger: &SyncLedger,
    write: &PlannedWrite,
    result: &mut PullResult,
) -> SyncResult<()> {
    let front_matter = &write.front_matter;
    ledger.upsert(&LedgerEntry::new(
        write.page_id(),
        &write.relative_path,
        &front_matter.title,
        front_matter.version,
        front_matter.content_hash.as_deref().unwrap_or_default(),
    ))?;
    result.pulled += 1;
    result.pages.push(PulledPage {
        page_id: write.page_id().to_string(),
        title: front_matter.title.clone(),
        path: write.relative_path.clone(),
        action: write.action.to_string(),
        version: front_matter.version,
        status: write.status,
    });
    Ok(())
}

fn commit_staged(
    vcs: &mut dyn VersionControl,
    message: &str,
    author: Option<&CommitAuthor>,
) -> SyncResult<bool> {
    match vcs.commit(message, author) {
        Ok(hash) => {
            debug!(%hash, message, "committed");
            Ok(true)
        }
        Err(VcsError::NoChanges) => Ok(false),
        Err(error) => Err(error.into()),
    }
}

fn write_snapshot(
    vcs: &mut dyn VersionControl,
    ledger: &SyncLedger,
    planned: &[PlannedWrite],
    cancel: Option<&AtomicBool>,
    progress: &mut dyn FnMut(&SyncProgress),
    result: &mut PullResult,
) -> SyncResult<()> {
    let mut staged = Vec::new();
    for (index, write) in planned.iter().enumerate() {
        if is_cancelled(cancel) {
            result.cancelled = true;
            break;
        }
        match write_page_atomic(&write.path, &write.front_matter, &write.markdown) {
            Ok(()) => {
                staged.push(write.relative_path.clone());
                record_written(ledger, write, result)?;
            }
            Err(error) => {
                warn!(path = %write.relative_path, %error, "failed to write page");
                result
                    .errors
                    .push(page_error(&write.front_matter.title, error));
            }
        }
        progress(&SyncProgress {
            operation: "pull",
            completed: index + 1,
            total: planned.len(),
            title: write.front_matter.title.clone(),
        });
    }

    if !staged.is_empty() {
        vcs.add_paths(&staged)?;
        let message = format!("Pull {} page(s) from wiki", staged.len());
        if commit_staged(vcs, &message, None)? {
            result.commits = 1;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn replay(
    ctx: &SyncContext,
    remote: &mut dyn RemoteWikiClient,
    vcs: &mut dyn VersionControl,
    ledger: &SyncLedger,
    planned: &[PlannedWrite],
    options: &PullOptions,
    progress: &mut dyn FnMut(&SyncProgress),
    result: &mut PullResult,
) -> SyncResult<()> {
    let mut events = Vec::new();
    for (index, write) in planned.iter().enumerate() {
        if is_cancelled(options.cancel.as_deref()) {
            result.cancelled = true;
            return Ok(());
        }
        match version_events(ctx, remote, index, write) {
            Ok(page_events) => events.extend(page_events),
            Err(error) => {
                warn!(page = %write.front_matter.title, %error, "failed to load version history");
                result
                    .errors
                    .push(page_error(&write.front_matter.title, error));
            }
        }
    }
    events.sort_by(replay_order);

    let total = events.len();
    for (completed, event) in events.into_iter().enumerate() {
        if is_cancelled(options.cancel.as_deref()) {
            result.cancelled = true;
            break;
        }
        let write = &planned[event.write];
        if let Err(error) = write_page_atomic(&write.path, &event.front_matter, &event.markdown) {
            warn!(path = %write.relative_path, %error, "failed to write page version");
            result
                .errors
                .push(page_error(&write.front_matter.title, error));
            continue;
        }
        vcs.add_paths(std::slice::from_ref(&write.relative_path))?;

        let mut message = format!("{} (v{})", event.front_matter.title, event.version);
        if let Some(note) = event.message.as_deref().map(str::trim)
            && !note.is_empty()
        {
            message.push_str("\n\n");
            message.push_str(note);
        }
        if commit_staged(vcs, &message, event.author.as_ref())? {
            result.commits += 1;
        }
        if event.version == write.front_matter.version {
            record_written(ledger, write, result)?;
        }
        progress(&SyncProgress {
            operation: "pull",
            completed: completed + 1,
            total,
            title: event.front_matter.title.clone(),
        });
    }
    Ok(())
}

/// Versions of one page newer than the local copy, ending with the current one.
fn version_events(
    ctx: &SyncContext,
    remote: &mut dyn RemoteWikiClient,
    write_index: usize,
    write: &PlannedWrite,
) -> SyncResult<Vec<ReplayEvent>> {
    let current_version = write.front_matter.version;
    let history = remote.get_version_history(write.page_id())?;
    let mut events = Vec::new();
    let mut has_current = false;

    for version in history {
        if version.version <= write.local_version || version.version > current_version {
            continue;
        }
        let email = version
            .author_email
            .clone()
            .filter(|email| !email.trim().is_empty())
            .unwrap_or_else(|| {
                format!("{}@{}", slugify(&version.author), ctx.author_email_domain)
            });
        let author = CommitAuthor {
            name: version.author.clone(),
            email,
            date: Some(version.timestamp),
        };

        let (front_matter, markdown) = if version.version == current_version {
            has_current = true;
            (write.front_matter.clone(), write.markdown.clone())
        } else {
            let (markdown, document) = canonical_markdown(&version.raw_markup)?;
            let front_matter = PageFrontMatter {
                version: version.version,
                updated: Some(version.timestamp),
                content_hash: Some(hash_document(&document)?),
                ..write.front_matter.clone()
            };
            (front_matter, markdown)
        };
        events.push(ReplayEvent {
            timestamp: version.timestamp,
            tree_index: write.tree_index,
            version: version.version,
            write: write_index,
            front_matter,
            markdown,
            author: Some(author),
            message: version.message,
        });
    }

    if !has_current {
        let timestamp = events
            .iter()
            .map(|event| event.timestamp)
            .max()
            .into_iter()
            .chain(write.front_matter.updated)
            .max()
            .unwrap_or_else(Utc::now);
        events.push(ReplayEvent {
            timestamp,
            tree_index: write.tree_index,
            version: current_version,
            write: write_index,
            front_matter: write.front_matter.clone(),
            markdown: write.markdown.clone(),
            author: None,
            message: None,
        });
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::Ordering as AtomicOrdering;

    use super::*;
    use crate::filesystem::read_page;
    use crate::sync::testing::{MockVcs, MockWiki, at, project};

    fn no_progress() -> impl FnMut(&SyncProgress) {
        |_| {}
    }

    #[test]
    fn pull_writes_tree_and_commits_once() {
        let (_temp, paths) = project();
        let mut wiki = MockWiki::new("root");
        wiki.add_page("1", "root", "Guide", "<h1>Guide</h1><p>intro</p>");
        wiki.add_page("2", "1", "Install Steps", "<p>run it</p>");
        let mut vcs = MockVcs::new(&paths);

        let ctx = SyncContext::load(paths.clone(), "root").expect("ctx");
        let mut seen = Vec::new();
        let result = pull(ctx, &mut wiki, &mut vcs, &PullOptions::default(), &mut |event: &SyncProgress| {
            seen.push(event.completed)
        })
        .expect("pull");

        assert_eq!(result.pulled, 2);
        assert_eq!(result.commits, 1);
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(vcs.commits[0].message, "Pull 2 page(s) from wiki");

        let child = read_page(&paths, &paths.content_dir.join("guide").join("install-steps.md"))
            .expect("child page");
        assert_eq!(child.front_matter.page_id.as_deref(), Some("2"));
        assert_eq!(child.front_matter.parent_id.as_deref(), Some("1"));
        assert_eq!(child.body, "run it\n");
        assert!(child.front_matter.content_hash.is_some());

        let ledger = SyncLedger::open(&paths).expect("ledger");
        assert_eq!(ledger.entries().expect("entries").len(), 2);

        let again = pull(
            SyncContext::load(paths.clone(), "root").expect("ctx"),
            &mut wiki,
            &mut vcs,
            &PullOptions::default(),
            &mut no_progress(),
        )
        .expect("second pull");
        assert_eq!(again.pulled, 0);
        assert_eq!(again.unchanged, 2);
        assert_eq!(again.commits, 0);
    }

    #[test]
    fn failing_page_does_not_stop_the_others() {
        let (_temp, paths) = project();
        let mut wiki = MockWiki::new("root");
        wiki.add_page("1", "root", "One", "<p>1</p>");
        wiki.add_page("2", "root", "Two", "<p>2</p>");
        wiki.add_page("3", "root", "Three", "<p>3</p>");
        wiki.fail_page("2");
        let mut vcs = MockVcs::new(&paths);

        let result = pull(
            SyncContext::load(paths.clone(), "root").expect("ctx"),
            &mut wiki,
            &mut vcs,
            &PullOptions::default(),
            &mut no_progress(),
        )
        .expect("pull");

        assert_eq!(result.pulled, 2);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Two: "));
        assert!(paths.content_dir.join("one.md").exists());
        assert!(paths.content_dir.join("three.md").exists());
        assert!(!paths.content_dir.join("two.md").exists());
    }

    #[test]
    fn local_edits_are_kept_unless_forced() {
        let (_temp, paths) = project();
        let mut wiki = MockWiki::new("root");
        wiki.add_page("1", "root", "Notes", "<p>remote</p>");
        let mut vcs = MockVcs::new(&paths);
        pull(
            SyncContext::load(paths.clone(), "root").expect("ctx"),
            &mut wiki,
            &mut vcs,
            &PullOptions::default(),
            &mut no_progress(),
        )
        .expect("initial pull");

        let path = paths.content_dir.join("notes.md");
        let edited = fs::read_to_string(&path)
            .expect("read")
            .replace("remote\n", "mine\n");
        fs::write(&path, &edited).expect("edit");

        let result = pull(
            SyncContext::load(paths.clone(), "root").expect("ctx"),
            &mut wiki,
            &mut vcs,
            &PullOptions::default(),
            &mut no_progress(),
        )
        .expect("pull");
        assert_eq!(result.skipped, 1);
        assert_eq!(result.pages[0].status, SyncStatus::LocalModified);
        assert_eq!(fs::read_to_string(&path).expect("read"), edited);

        let forced = pull(
            SyncContext::load(paths.clone(), "root").expect("ctx"),
            &mut wiki,
            &mut vcs,
            &PullOptions {
                force: true,
                ..PullOptions::default()
            },
            &mut no_progress(),
        )
        .expect("forced pull");
        assert_eq!(forced.pulled, 1);
        assert!(fs::read_to_string(&path).expect("read").ends_with("remote\n"));
    }

    #[test]
    fn replay_commits_versions_in_chronological_order() {
        let (_temp, paths) = project();
        let mut wiki = MockWiki::new("root");
        wiki.add_page("1", "root", "Alpha", "<p>a1</p>");
        wiki.add_page("2", "root", "Beta", "<p>b1</p>");
        wiki.edit_page_at("1", "<p>a2</p>", "Grace", at(30));
        let mut vcs = MockVcs::new(&paths);

        let options = PullOptions {
            replay_history: true,
            branch: Some("import".to_string()),
            ..PullOptions::default()
        };
        let result = pull(
            SyncContext::load(paths.clone(), "root").expect("ctx"),
            &mut wiki,
            &mut vcs,
            &options,
            &mut no_progress(),
        )
        .expect("pull");

        assert_eq!(result.commits, 3);
        assert_eq!(result.pulled, 2);
        assert_eq!(vcs.branches, vec!["import"]);
        let messages: Vec<&str> = vcs
            .commits
            .iter()
            .map(|commit| commit.message.lines().next().unwrap_or_default())
            .collect();
        assert_eq!(messages, vec!["Alpha (v1)", "Beta (v1)", "Alpha (v2)"]);

        let first = &vcs.commits[0];
        assert_eq!(first.files.len(), 1);
        assert!(first.files[0].1.ends_with("a1\n"));
        let last = &vcs.commits[2];
        let author = last.author.as_ref().expect("author");
        assert_eq!(author.name, "Grace");
        assert_eq!(author.email, "grace@example.com");
        assert_eq!(author.date, Some(at(30)));
        assert!(last.files[0].1.ends_with("a2\n"));
        assert!(last.message.contains("edit by Grace"));

        assert_eq!(
            vcs.commits[1].author.as_ref().map(|author| author.email.as_str()),
            Some("ada@wiki.invalid")
        );
    }

    #[test]
    fn replay_starts_after_the_local_version() {
        let (_temp, paths) = project();
        let mut wiki = MockWiki::new("root");
        wiki.add_page("1", "root", "Alpha", "<p>a1</p>");
        let mut vcs = MockVcs::new(&paths);
        pull(
            SyncContext::load(paths.clone(), "root").expect("ctx"),
            &mut wiki,
            &mut vcs,
            &PullOptions::default(),
            &mut no_progress(),
        )
        .expect("initial pull");

        wiki.edit_page("1", "<p>a2</p>");
        wiki.edit_page("1", "<p>a3</p>");
        let result = pull(
            SyncContext::load(paths.clone(), "root").expect("ctx"),
            &mut wiki,
            &mut vcs,
            &PullOptions {
                replay_history: true,
                ..PullOptions::default()
            },
            &mut no_progress(),
        )
        .expect("replay");

        assert_eq!(result.commits, 2);
        let replayed: Vec<&str> = vcs.commits[1..]
            .iter()
            .map(|commit| commit.message.lines().next().unwrap_or_default())
            .collect();
        assert_eq!(replayed, vec!["Alpha (v2)", "Alpha (v3)"]);
    }

    #[test]
    fn cancellation_stops_before_writing() {
        let (_temp, paths) = project();
        let mut wiki = MockWiki::new("root");
        wiki.add_page("1", "root", "One", "<p>1</p>");
        let mut vcs = MockVcs::new(&paths);
        let cancel = Arc::new(AtomicBool::new(false));
        cancel.store(true, AtomicOrdering::Relaxed);

        let result = pull(
            SyncContext::load(paths.clone(), "root").expect("ctx"),
            &mut wiki,
            &mut vcs,
            &PullOptions {
                cancel: Some(Arc::clone(&cancel)),
                ..PullOptions::default()
            },
            &mut no_progress(),
        )
        .expect("pull");

        assert!(result.cancelled);
        assert_eq!(result.pulled, 0);
        assert!(vcs.commits.is_empty());
        assert!(!paths.content_dir.join("one.md").exists());
    }

    #[test]
    fn unreadable_file_is_reported_and_left_untouched() {
        let (_temp, paths) = project();
        let mut wiki = MockWiki::new("root");
        wiki.add_page("1", "root", "Bad", "<p>remote</p>");
        let broken = "---\ntitle: [unclosed\n---\n\nbody\n";
        fs::write(paths.content_dir.join("bad.md"), broken).expect("bad page");
        let mut vcs = MockVcs::new(&paths);

        let result = pull(
            SyncContext::load(paths.clone(), "root").expect("ctx"),
            &mut wiki,
            &mut vcs,
            &PullOptions::default(),
            &mut no_progress(),
        )
        .expect("pull");

        assert_eq!(result.pulled, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("pages/bad.md: "));
        assert_eq!(
            fs::read_to_string(paths.content_dir.join("bad.md")).expect("read bad"),
            broken
        );
        assert!(paths.content_dir.join("bad-1.md").exists());
    }

    #[test]
    fn missing_git_is_reported_as_not_installed() {
        let (_temp, paths) = project();
        let mut wiki = MockWiki::new("root");
        wiki.add_page("1", "root", "One", "<p>1</p>");
        let mut vcs = MockVcs::new(&paths);
        vcs.installed = false;

        let error = pull(
            SyncContext::load(paths, "root").expect("ctx"),
            &mut wiki,
            &mut vcs,
            &PullOptions::default(),
            &mut no_progress(),
        )
        .expect_err("git missing");
        assert!(matches!(
            error,
            crate::error::SyncError::Vcs(VcsError::NotInstalled)
        ));
        assert_eq!(wiki.request_count(), 0);
    }

    #[test]
    fn merge_conflicts_abort_before_remote_calls() {
        let (_temp, paths) = project();
        let mut wiki = MockWiki::new("root");
        wiki.add_page("1", "root", "One", "<p>1</p>");
        let mut vcs = MockVcs::new(&paths);
        vcs.conflicts = true;

        let error = pull(
            SyncContext::load(paths, "root").expect("ctx"),
            &mut wiki,
            &mut vcs,
            &PullOptions::default(),
            &mut no_progress(),
        )
        .expect_err("conflicted repository");
        assert!(matches!(
            error,
            crate::error::SyncError::Vcs(VcsError::MergeConflict)
        ));
        assert_eq!(wiki.request_count(), 0);
    }
}
