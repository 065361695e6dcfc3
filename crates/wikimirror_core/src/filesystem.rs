use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{SyncError, SyncResult};
use crate::frontmatter::{PageFrontMatter, parse_page_file, render_page_file};
use crate::runtime::ResolvedPaths;

pub const PAGE_EXTENSION: &str = "md";

/// A Markdown page file found under the content directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPage {
    pub path: PathBuf,
    /// Project-relative path with forward slashes.
    pub relative_path: String,
    pub front_matter: PageFrontMatter,
    pub body: String,
}

impl LocalPage {
    pub fn page_id(&self) -> Option<&str> {
        self.front_matter.page_id.as_deref()
    }

    /// Front matter title, falling back to the file name.
    pub fn title(&self) -> String {
        let title = self.front_matter.title.trim();
        if !title.is_empty() {
            return title.to_string();
        }
        self.path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| stem.replace(['-', '_'], " "))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTreeNode {
    pub page_id: Option<String>,
    pub path: String,
    pub title: String,
    pub children: Vec<LocalTreeNode>,
}

/// A page file that exists but could not be read or parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadablePage {
    pub path: PathBuf,
    pub relative_path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct PageScan {
    pub pages: Vec<LocalPage>,
    pub unreadable: Vec<UnreadablePage>,
}

/// Read every page file under the content directory, sorted by path.
///
/// A file that fails to load is recorded in `unreadable` and the scan goes
/// on; only an unwalkable directory fails the whole scan.
pub fn scan_pages(paths: &ResolvedPaths) -> SyncResult<PageScan> {
    let mut scan = PageScan::default();
    if !paths.content_dir.exists() {
        return Ok(scan);
    }

    let walker = WalkDir::new(&paths.content_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));
    for entry in walker {
        let entry = entry.map_err(|error| {
            let path = error
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| paths.content_dir.clone());
            SyncError::file_system(path, io::Error::from(error))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(PAGE_EXTENSION) {
            continue;
        }
        match read_page(paths, path) {
            Ok(page) => scan.pages.push(page),
            Err(error) => {
                let relative_path = paths.relative_to_root(path);
                warn!(path = %relative_path, %error, "skipping unreadable page file");
                scan.unreadable.push(UnreadablePage {
                    path: path.to_path_buf(),
                    relative_path,
                    reason: error.to_string(),
                });
            }
        }
    }
    scan.pages
        .sort_by(|left, right| left.relative_path.cmp(&right.relative_path));
    scan.unreadable
        .sort_by(|left, right| left.relative_path.cmp(&right.relative_path));
    Ok(scan)
}

pub fn read_page(paths: &ResolvedPaths, path: &Path) -> SyncResult<LocalPage> {
    validate_scoped_path(paths, path)?;
    let text = fs::read_to_string(path).map_err(|error| SyncError::file_system(path, error))?;
    let file = parse_page_file(&text).map_err(|error| {
        SyncError::file_system(path, io::Error::new(io::ErrorKind::InvalidData, error))
    })?;
    Ok(LocalPage {
        path: path.to_path_buf(),
        relative_path: paths.relative_to_root(path),
        front_matter: file.front_matter,
        body: file.body,
    })
}

/// Write a page through a sibling temp file and a rename so readers never see
/// a half-written header.
pub fn write_page_atomic(
    path: &Path,
    front_matter: &PageFrontMatter,
    body: &str,
) -> SyncResult<()> {
    let rendered = render_page_file(front_matter, body)?;
    let parent = path.parent().ok_or_else(|| {
        SyncError::file_system(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "page path has no parent"),
        )
    })?;
    fs::create_dir_all(parent).map_err(|error| SyncError::file_system(parent, error))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("page");
    let temp_path = parent.join(format!(".{file_name}.tmp"));
    fs::write(&temp_path, rendered).map_err(|error| SyncError::file_system(&temp_path, error))?;
    if let Err(error) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(SyncError::file_system(path, error));
    }
    Ok(())
}

/// Reject paths that leave the content directory.
pub fn validate_scoped_path(paths: &ResolvedPaths, candidate: &Path) -> SyncResult<()> {
    let absolute = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        paths.project_root.join(candidate)
    };
    let normalized = normalize_pathbuf(&absolute);
    if normalized.starts_with(normalize_pathbuf(&paths.content_dir)) {
        return Ok(());
    }
    Err(SyncError::file_system(
        normalized,
        io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!(
                "path escapes the content directory {}",
                display_path(&paths.content_dir)
            ),
        ),
    ))
}

/// File name stem for a page title: lowercase ASCII words joined by dashes.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for ch in title.chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(ch.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "page".to_string()
    } else {
        slug
    }
}

/// Directory holding the children of the page stored at `page_path`.
pub fn children_dir(page_path: &Path) -> PathBuf {
    page_path.with_extension("")
}

/// Path for a page that has no local file yet.
///
/// Titles that slug to an already used path get the page id appended.
pub fn page_path_for(
    parent_dir: &Path,
    title: &str,
    page_id: &str,
    taken: &HashSet<PathBuf>,
) -> PathBuf {
    let slug = slugify(title);
    let candidate = parent_dir.join(format!("{slug}.{PAGE_EXTENSION}"));
    if !taken.contains(&candidate) && !candidate.exists() {
        return candidate;
    }
    parent_dir.join(format!("{slug}-{}.{PAGE_EXTENSION}", slugify(page_id)))
}

/// Nearest page whose children directory contains `page`.
pub fn enclosing_page<'a>(pages: &'a [LocalPage], page: &LocalPage) -> Option<&'a LocalPage> {
    let by_path: HashMap<&Path, &LocalPage> = pages
        .iter()
        .map(|candidate| (candidate.path.as_path(), candidate))
        .collect();
    enclosing_index_path(&by_path, &page.path)
}

fn enclosing_index_path<'a>(
    by_path: &HashMap<&Path, &'a LocalPage>,
    path: &Path,
) -> Option<&'a LocalPage> {
    let mut dir = path.parent();
    while let Some(current) = dir {
        let candidate = current.with_extension(PAGE_EXTENSION);
        if let Some(page) = by_path.get(candidate.as_path()) {
            return Some(page);
        }
        dir = current.parent();
    }
    None
}

/// Arrange scanned pages by directory nesting, ordered by position then path.
pub fn build_tree(pages: &[LocalPage]) -> Vec<LocalTreeNode> {
    let by_path: HashMap<&Path, &LocalPage> = pages
        .iter()
        .map(|page| (page.path.as_path(), page))
        .collect();
    let mut children: HashMap<Option<&Path>, Vec<&LocalPage>> = HashMap::new();
    for page in pages {
        let parent = enclosing_index_path(&by_path, &page.path).map(|parent| parent.path.as_path());
        children.entry(parent).or_default().push(page);
    }
    for siblings in children.values_mut() {
        siblings.sort_by(|left, right| {
            left.front_matter
                .position
                .unwrap_or(u32::MAX)
                .cmp(&right.front_matter.position.unwrap_or(u32::MAX))
                .then_with(|| left.relative_path.cmp(&right.relative_path))
        });
    }
    tree_level(&children, None)
}

fn tree_level(
    children: &HashMap<Option<&Path>, Vec<&LocalPage>>,
    parent: Option<&Path>,
) -> Vec<LocalTreeNode> {
    children
        .get(&parent)
        .map(|siblings| {
            siblings
                .iter()
                .map(|page| LocalTreeNode {
                    page_id: page.front_matter.page_id.clone(),
                    path: page.relative_path.clone(),
                    title: page.title(),
                    children: tree_level(children, Some(page.path.as_path())),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|name| name.starts_with('.'))
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn normalize_pathbuf(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(std::path::MAIN_SEPARATOR_STR)),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
