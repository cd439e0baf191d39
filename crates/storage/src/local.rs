//! Store backed by a directory on the local filesystem.

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::fs::{self, File};
use walkdir::WalkDir;

use crate::{FileStore, StoredFile, Walk};

/// A [`FileStore`] rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a store rooted at `root`. The directory is not checked here.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a root-relative name onto the filesystem.
    ///
    /// Empty names, absolute paths and `..` components are rejected with
    /// [`io::ErrorKind::InvalidInput`].
    pub fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let relative = Path::new(name);
        let mut has_normal = false;
        for component in relative.components() {
            match component {
                Component::Normal(_) => has_normal = true,
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("path escapes the served directory: {name}"),
                    ));
                }
            }
        }
        if !has_normal {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid file name: {name:?}"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl FileStore for LocalStore {
    type Reader = File;
    type Writer = File;

    async fn open(&self, name: &str) -> io::Result<File> {
        File::open(self.resolve(name)?).await
    }

    async fn create(&self, name: &str) -> io::Result<File> {
        File::create(self.resolve(name)?).await
    }

    async fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(name)?).await
    }

    fn walk(&self) -> Walk {
        let root = self.root.clone();
        let entries = WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => return Some(Err(io::Error::from(e))),
                };
                if entry.file_type().is_dir() {
                    return None;
                }
                Some(stored_file(&root, entry))
            });
        Box::new(entries)
    }
}

fn stored_file(root: &Path, entry: walkdir::DirEntry) -> io::Result<StoredFile> {
    let relative = entry.path().strip_prefix(root).map_err(|_| {
        io::Error::other(format!(
            "{} is not below {}",
            entry.path().display(),
            root.display()
        ))
    })?;
    let path = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let metadata = entry.metadata().map_err(io::Error::from)?;
    Ok(StoredFile {
        path,
        size: metadata.len(),
        modified: metadata.modified()?,
    })
}
