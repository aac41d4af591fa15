use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Directories that never belong to the project proper.
const EXCLUDED_DIRS: &[&str] = &["__pycache__", "node_modules", "site-packages"];

/// Walks a project tree, skipping hidden directories, virtualenvs, caches
/// and any extra directory names supplied by the caller (reports, backups).
#[derive(Debug, Clone)]
pub struct ProjectWalker {
    root: PathBuf,
    extra_excludes: Vec<String>,
}

impl ProjectWalker {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            extra_excludes: Vec::new(),
        }
    }

    pub fn excluding<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_excludes.extend(names.into_iter().map(Into::into));
        self
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        name.starts_with('.')
            || EXCLUDED_DIRS.contains(&name.as_ref())
            || self.extra_excludes.iter().any(|e| e.as_str() == name)
            || entry.path().join("pyvenv.cfg").is_file()
    }

    /// Every entry below the root (the root itself excluded), in a stable order.
    pub fn entries(&self) -> impl Iterator<Item = DirEntry> + '_ {
        WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter()
            .filter_entry(|entry| !self.is_excluded(entry))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::debug!(error = %err, "skipping unreadable path");
                    None
                }
            })
            .filter(|entry| entry.depth() > 0)
    }

    pub fn files(&self) -> impl Iterator<Item = DirEntry> + '_ {
        self.entries().filter(|entry| entry.file_type().is_file())
    }

    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }
}

pub fn file_name_matches(path: &Path, predicate: impl Fn(&str) -> bool) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .is_some_and(predicate)
}
