//! In-memory wiki and version control doubles for the sync tests.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use crate::error::{RemoteError, VcsError};
use crate::remote::{RemotePage, RemotePageRef, RemoteVersion, RemoteWikiClient};
use crate::runtime::{ResolvedPaths, ValueSource};
use crate::vcs::{
    CommitAuthor, CommitInfo, DiffOptions, LogOptions, VcsStatus, VcsStatusEntry, VersionControl,
};

pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .expect("base timestamp")
        + Duration::minutes(minutes)
}

pub fn project() -> (TempDir, ResolvedPaths) {
    let temp = tempfile::tempdir().expect("tempdir");
    let project_root = temp.path().join("project");
    let paths = ResolvedPaths {
        content_dir: project_root.join("pages"),
        state_dir: project_root.join(".wikimirror"),
        db_path: project_root.join(".wikimirror").join("sync.db"),
        config_path: project_root.join(".wikimirror").join("config.toml"),
        project_root,
        root_source: ValueSource::Flag,
        content_source: ValueSource::Default,
        config_source: ValueSource::Default,
    };
    fs::create_dir_all(&paths.content_dir).expect("content dir");
    fs::create_dir_all(&paths.state_dir).expect("state dir");
    (temp, paths)
}

#[derive(Debug, Clone)]
pub struct MockPage {
    pub id: String,
    pub title: String,
    pub parent_id: String,
    pub markup: String,
    pub version: u64,
    pub updated: DateTime<Utc>,
    pub history: Vec<RemoteVersion>,
}

#[derive(Debug, Default)]
pub struct MockWiki {
    root_id: String,
    pages: HashMap<String, MockPage>,
    children: HashMap<String, Vec<String>>,
    failing_pages: HashSet<String>,
    failing_listings: HashSet<String>,
    next_id: u64,
    clock: i64,
    requests: usize,
    pub created: Vec<(String, String)>,
    pub updated: Vec<(String, Option<String>)>,
    pub deleted: Vec<String>,
}

impl MockWiki {
    pub fn new(root_id: &str) -> Self {
        Self {
            root_id: root_id.to_string(),
            next_id: 1000,
            ..Self::default()
        }
    }

    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        at(self.clock)
    }

    pub fn add_page(&mut self, id: &str, parent_id: &str, title: &str, markup: &str) {
        let timestamp = self.tick();
        self.insert_page(id, parent_id, title, markup, "Ada", timestamp);
    }

    fn insert_page(
        &mut self,
        id: &str,
        parent_id: &str,
        title: &str,
        markup: &str,
        author: &str,
        timestamp: DateTime<Utc>,
    ) {
        self.pages.insert(
            id.to_string(),
            MockPage {
                id: id.to_string(),
                title: title.to_string(),
                parent_id: parent_id.to_string(),
                markup: markup.to_string(),
                version: 1,
                updated: timestamp,
                history: vec![RemoteVersion {
                    version: 1,
                    raw_markup: markup.to_string(),
                    author: author.to_string(),
                    author_email: None,
                    timestamp,
                    message: None,
                }],
            },
        );
        self.children
            .entry(parent_id.to_string())
            .or_default()
            .push(id.to_string());
    }

    /// Record a new remote version written by `author` at `timestamp`.
    pub fn edit_page_at(
        &mut self,
        id: &str,
        markup: &str,
        author: &str,
        timestamp: DateTime<Utc>,
    ) {
        let page = self.pages.get_mut(id).expect("page exists");
        page.version += 1;
        page.markup = markup.to_string();
        page.updated = timestamp;
        page.history.push(RemoteVersion {
            version: page.version,
            raw_markup: markup.to_string(),
            author: author.to_string(),
            author_email: Some(format!("{}@example.com", author.to_ascii_lowercase())),
            timestamp,
            message: Some(format!("edit by {author}")),
        });
    }

    pub fn edit_page(&mut self, id: &str, markup: &str) {
        let timestamp = self.tick();
        self.edit_page_at(id, markup, "Grace", timestamp);
    }

    pub fn fail_page(&mut self, id: &str) {
        self.failing_pages.insert(id.to_string());
    }

    pub fn fail_listing(&mut self, id: &str) {
        self.failing_listings.insert(id.to_string());
    }

    pub fn page(&self, id: &str) -> &MockPage {
        self.pages.get(id).expect("page exists")
    }

    pub fn find_by_title(&self, title: &str) -> Option<&MockPage> {
        self.pages.values().find(|page| page.title == title)
    }

    pub fn mutation_count(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

impl RemoteWikiClient for MockWiki {
    fn get_page(&mut self, id: &str) -> Result<RemotePage, RemoteError> {
        self.requests += 1;
        if self.failing_pages.contains(id) {
            return Err(RemoteError::Api {
                status: 500,
                message: "internal error".to_string(),
            });
        }
        let page = self
            .pages
            .get(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        Ok(RemotePage {
            id: page.id.clone(),
            title: page.title.clone(),
            raw_markup: page.markup.clone(),
            version: page.version,
            parent_id: Some(page.parent_id.clone()),
            updated: Some(page.updated),
        })
    }

    fn get_all_children(&mut self, id: &str) -> Result<Vec<RemotePageRef>, RemoteError> {
        self.requests += 1;
        if self.failing_listings.contains(id) {
            return Err(RemoteError::Transport("connection reset".to_string()));
        }
        if id != self.root_id && !self.pages.contains_key(id) {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        Ok(self
            .children
            .get(id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|child| self.pages.get(child))
                    .map(|page| RemotePageRef {
                        id: page.id.clone(),
                        title: page.title.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_version_history(&mut self, id: &str) -> Result<Vec<RemoteVersion>, RemoteError> {
        self.requests += 1;
        if self.failing_pages.contains(id) {
            return Err(RemoteError::Transport("history unavailable".to_string()));
        }
        self.pages
            .get(id)
            .map(|page| page.history.clone())
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    fn create_page(
        &mut self,
        parent_id: &str,
        title: &str,
        markup: &str,
    ) -> Result<String, RemoteError> {
        self.requests += 1;
        if self.failing_pages.contains(title) {
            return Err(RemoteError::Api {
                status: 400,
                message: "rejected".to_string(),
            });
        }
        self.next_id += 1;
        let id = self.next_id.to_string();
        let timestamp = self.tick();
        self.insert_page(&id, parent_id, title, markup, "wikimirror", timestamp);
        self.created.push((parent_id.to_string(), title.to_string()));
        Ok(id)
    }

    fn update_page(
        &mut self,
        id: &str,
        title: &str,
        markup: &str,
        comment: Option<&str>,
    ) -> Result<u64, RemoteError> {
        self.requests += 1;
        if self.failing_pages.contains(id) {
            return Err(RemoteError::Api {
                status: 409,
                message: "version conflict".to_string(),
            });
        }
        if !self.pages.contains_key(id) {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        let timestamp = self.tick();
        self.edit_page_at(id, markup, "wikimirror", timestamp);
        let page = self.pages.get_mut(id).expect("page exists");
        page.title = title.to_string();
        self.updated
            .push((id.to_string(), comment.map(str::to_string)));
        Ok(page.version)
    }

    fn delete_page(&mut self, id: &str) -> Result<(), RemoteError> {
        self.requests += 1;
        let page = self
            .pages
            .remove(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        if let Some(siblings) = self.children.get_mut(&page.parent_id) {
            siblings.retain(|child| child != id);
        }
        self.deleted.push(id.to_string());
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.requests
    }
}

#[derive(Debug, Clone)]
pub struct MockCommit {
    pub message: String,
    pub author: Option<CommitAuthor>,
    /// Staged paths with their content at commit time.
    pub files: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct MockVcs {
    root: PathBuf,
    /// `false` makes every call behave as if git were missing from PATH.
    pub installed: bool,
    pub initialized: bool,
    pub dirty: bool,
    pub conflicts: bool,
    pub staged: Vec<String>,
    pub commits: Vec<MockCommit>,
    pub branches: Vec<String>,
}

impl MockVcs {
    pub fn new(paths: &ResolvedPaths) -> Self {
        Self {
            root: paths.project_root.clone(),
            installed: true,
            initialized: true,
            dirty: false,
            conflicts: false,
            staged: Vec::new(),
            commits: Vec::new(),
            branches: Vec::new(),
        }
    }
}

impl VersionControl for MockVcs {
    fn is_initialized(&self) -> Result<bool, VcsError> {
        if !self.installed {
            return Err(VcsError::NotInstalled);
        }
        Ok(self.initialized)
    }

    fn status(&self) -> Result<VcsStatus, VcsError> {
        let mut entries = Vec::new();
        if self.dirty {
            entries.push(VcsStatusEntry {
                path: "pages/dirty.md".to_string(),
                staged: false,
                status: " M".to_string(),
            });
        }
        if self.conflicts {
            entries.push(VcsStatusEntry {
                path: "pages/conflicted.md".to_string(),
                staged: false,
                status: "UU".to_string(),
            });
        }
        Ok(VcsStatus {
            has_changes: !entries.is_empty(),
            entries,
            has_conflicts: self.conflicts,
        })
    }

    fn add_all(&mut self) -> Result<(), VcsError> {
        self.staged.push(".".to_string());
        Ok(())
    }

    fn add_paths(&mut self, paths: &[String]) -> Result<(), VcsError> {
        for path in paths {
            if !self.staged.contains(path) {
                self.staged.push(path.clone());
            }
        }
        Ok(())
    }

    fn commit(
        &mut self,
        message: &str,
        author: Option<&CommitAuthor>,
    ) -> Result<String, VcsError> {
        if self.staged.is_empty() {
            return Err(VcsError::NoChanges);
        }
        let files = self
            .staged
            .drain(..)
            .map(|path| {
                let content = fs::read_to_string(self.root.join(&path)).unwrap_or_default();
                (path, content)
            })
            .collect();
        self.commits.push(MockCommit {
            message: message.to_string(),
            author: author.cloned(),
            files,
        });
        Ok(format!("{:040x}", self.commits.len()))
    }

    fn log(&self, options: &LogOptions) -> Result<Vec<CommitInfo>, VcsError> {
        let limit = options.max_count.unwrap_or(usize::MAX);
        Ok(self
            .commits
            .iter()
            .enumerate()
            .rev()
            .take(limit)
            .map(|(index, commit)| CommitInfo {
                hash: format!("{:040x}", index + 1),
                author: commit
                    .author
                    .as_ref()
                    .map(|author| author.name.clone())
                    .unwrap_or_default(),
                email: commit
                    .author
                    .as_ref()
                    .map(|author| author.email.clone())
                    .unwrap_or_default(),
                date: commit
                    .author
                    .as_ref()
                    .and_then(|author| author.date)
                    .unwrap_or_else(|| at(0)),
                message: commit.message.clone(),
            })
            .collect())
    }

    fn diff(&self, _options: &DiffOptions) -> Result<String, VcsError> {
        Ok(String::new())
    }

    fn create_branch(&mut self, name: &str) -> Result<(), VcsError> {
        self.branches.push(name.to_string());
        Ok(())
    }
}
