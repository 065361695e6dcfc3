//! Version control behind the mirror: the trait the sync engine commits
//! through and a `git` subprocess implementation.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::VcsError;

const FIELD_SEPARATOR: char = '\u{1f}';
const RECORD_SEPARATOR: char = '\u{1e}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VcsStatusEntry {
    pub path: String,
    pub staged: bool,
    /// Two-letter porcelain code, e.g. `M `, `??`, `UU`.
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VcsStatus {
    pub has_changes: bool,
    pub entries: Vec<VcsStatusEntry>,
    pub has_conflicts: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub max_count: Option<usize>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub hash: String,
    pub author: String,
    pub email: String,
    pub date: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    pub staged: bool,
    pub paths: Vec<String>,
}

pub trait VersionControl {
    /// Whether the project root is inside a work tree. Fails only when the
    /// backend itself cannot run.
    fn is_initialized(&self) -> Result<bool, VcsError>;
    fn status(&self) -> Result<VcsStatus, VcsError>;
    fn add_all(&mut self) -> Result<(), VcsError>;
    fn add_paths(&mut self, paths: &[String]) -> Result<(), VcsError>;
    /// Commit the staged changes and return the new commit hash.
    fn commit(&mut self, message: &str, author: Option<&CommitAuthor>)
    -> Result<String, VcsError>;
    fn log(&self, options: &LogOptions) -> Result<Vec<CommitInfo>, VcsError>;
    fn diff(&self, options: &DiffOptions) -> Result<String, VcsError>;
    fn create_branch(&mut self, name: &str) -> Result<(), VcsError>;
}

#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
}

impl GitCli {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run `git init` unless the root already is a repository.
    pub fn init_repository(&self) -> Result<bool, VcsError> {
        if self.is_initialized()? {
            return Ok(false);
        }
        self.run(&["init", "--quiet"], &[])?;
        Ok(true)
    }

    fn run(&self, args: &[&str], envs: &[(&str, String)]) -> Result<String, VcsError> {
        debug!(args = ?args, "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .envs(envs.iter().map(|(key, value)| (*key, value.as_str())))
            .output()
            .map_err(|error| {
                if error.kind() == io::ErrorKind::NotFound {
                    VcsError::NotInstalled
                } else {
                    VcsError::Io(error)
                }
            })?;
        if !output.status.success() {
            return Err(VcsError::Command {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn ensure_initialized(&self) -> Result<(), VcsError> {
        if self.is_initialized()? {
            Ok(())
        } else {
            Err(VcsError::NotInitialized(self.root.clone()))
        }
    }

    fn has_head(&self) -> bool {
        self.run(&["rev-parse", "--verify", "--quiet", "HEAD"], &[])
            .is_ok()
    }
}

impl VersionControl for GitCli {
    fn is_initialized(&self) -> Result<bool, VcsError> {
        if !self.root.is_dir() {
            return Ok(false);
        }
        match self.run(&["rev-parse", "--is-inside-work-tree"], &[]) {
            Ok(output) => Ok(output.trim() == "true"),
            Err(VcsError::Command { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn status(&self) -> Result<VcsStatus, VcsError> {
        self.ensure_initialized()?;
        let output = self.run(&["status", "--porcelain=v1", "-z"], &[])?;
        Ok(parse_porcelain_status(&output))
    }

    fn add_all(&mut self) -> Result<(), VcsError> {
        self.ensure_initialized()?;
        self.run(&["add", "--all"], &[])?;
        Ok(())
    }

    fn add_paths(&mut self, paths: &[String]) -> Result<(), VcsError> {
        self.ensure_initialized()?;
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "--all", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run(&args, &[])?;
        Ok(())
    }

    fn commit(
        &mut self,
        message: &str,
        author: Option<&CommitAuthor>,
    ) -> Result<String, VcsError> {
        self.ensure_initialized()?;
        let staged = self.run(&["diff", "--cached", "--name-only"], &[])?;
        if staged.trim().is_empty() {
            return Err(VcsError::NoChanges);
        }

        let mut args = vec!["commit".to_string(), "--quiet".to_string()];
        let mut envs = Vec::new();
        if let Some(author) = author {
            args.push(format!("--author={} <{}>", author.name, author.email));
            envs.push(("GIT_COMMITTER_NAME", author.name.clone()));
            envs.push(("GIT_COMMITTER_EMAIL", author.email.clone()));
            if let Some(date) = author.date {
                let date = date.to_rfc3339();
                args.push(format!("--date={date}"));
                envs.push(("GIT_COMMITTER_DATE", date));
            }
        }
        args.push("-m".to_string());
        args.push(message.to_string());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args, &envs)?;
        let hash = self.run(&["rev-parse", "HEAD"], &[])?;
        Ok(hash.trim().to_string())
    }

    fn log(&self, options: &LogOptions) -> Result<Vec<CommitInfo>, VcsError> {
        self.ensure_initialized()?;
        if !self.has_head() {
            return Ok(Vec::new());
        }
        let format = format!(
            "--format=%H{FIELD_SEPARATOR}%an{FIELD_SEPARATOR}%ae{FIELD_SEPARATOR}%aI{FIELD_SEPARATOR}%B{RECORD_SEPARATOR}"
        );
        let mut args = vec!["log".to_string(), format];
        if let Some(count) = options.max_count {
            args.push(format!("--max-count={count}"));
        }
        if let Some(path) = &options.path {
            args.push("--".to_string());
            args.push(path.clone());
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&args, &[])?;
        parse_log(&output)
    }

    fn diff(&self, options: &DiffOptions) -> Result<String, VcsError> {
        self.ensure_initialized()?;
        let mut args = vec!["diff"];
        if options.staged {
            args.push("--cached");
        }
        if !options.paths.is_empty() {
            args.push("--");
            args.extend(options.paths.iter().map(String::as_str));
        }
        self.run(&args, &[])
    }

    fn create_branch(&mut self, name: &str) -> Result<(), VcsError> {
        self.ensure_initialized()?;
        self.run(&["checkout", "--quiet", "-b", name], &[])?;
        Ok(())
    }
}

fn parse_porcelain_status(output: &str) -> VcsStatus {
    let mut entries = Vec::new();
    let mut has_conflicts = false;
    let mut records = output.split('\0').filter(|record| !record.is_empty());
    while let Some(record) = records.next() {
        if record.len() < 4 {
            continue;
        }
        let (code, path) = record.split_at(2);
        let index = code.chars().next().unwrap_or(' ');
        if matches!(code, "DD" | "AU" | "UD" | "UA" | "DU" | "AA" | "UU") {
            has_conflicts = true;
        }
        // Renames and copies carry the original path as a separate record.
        if matches!(index, 'R' | 'C') {
            records.next();
        }
        entries.push(VcsStatusEntry {
            path: path[1..].to_string(),
            staged: index != ' ' && index != '?',
            status: code.to_string(),
        });
    }
    VcsStatus {
        has_changes: !entries.is_empty(),
        entries,
        has_conflicts,
    }
}

fn parse_log(output: &str) -> Result<Vec<CommitInfo>, VcsError> {
    let mut commits = Vec::new();
    for record in output.split(RECORD_SEPARATOR) {
        let record = record.trim_start_matches('\n');
        if record.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.splitn(5, FIELD_SEPARATOR).collect();
        let [hash, author, email, date, message] = fields.as_slice() else {
            return Err(VcsError::Command {
                command: "log".to_string(),
                stderr: format!("unexpected log record: {record}"),
            });
        };
        let date = DateTime::parse_from_rfc3339(date.trim())
            .map_err(|error| VcsError::Command {
                command: "log".to_string(),
                stderr: format!("invalid commit date {date}: {error}"),
            })?
            .with_timezone(&Utc);
        commits.push(CommitInfo {
            hash: hash.to_string(),
            author: author.to_string(),
            email: email.to_string(),
            date,
            message: message.trim_end().to_string(),
        });
    }
    Ok(commits)
}
