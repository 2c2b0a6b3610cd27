//! Read-only file library: path resolution and listing.
//!
//! Everything shareable lives under one root. Requests name files by a
//! relative, forward-slash path; resolution canonicalizes and then verifies
//! the result is still under the root, so symlinks and `..` components
//! cannot escape it.

use camino::{Utf8Path, Utf8PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("path escapes the library root: {0}")]
    PathEscape(String),
    #[error("not a regular file: {0}")]
    NotRegularFile(String),
    #[error("library I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A library file that passed resolution. `rel_path` is the normalized
/// library-relative path, `abs_path` the canonical on-disk location.
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub rel_path: String,
    pub abs_path: Utf8PathBuf,
    pub size: u64,
}

impl ResolvedFile {
    pub fn basename(&self) -> &str {
        self.abs_path.file_name().unwrap_or("file")
    }
}

#[derive(Debug, Clone)]
pub struct Library {
    root: Utf8PathBuf,
}

impl Library {
    /// The root must exist; it is canonicalized once here so that every
    /// later prefix check compares canonical paths to canonical paths.
    pub fn open(root: &Utf8Path) -> anyhow::Result<Self> {
        let root = root
            .canonicalize_utf8()
            .map_err(|e| anyhow::anyhow!("cannot open library root '{root}': {e}"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub async fn resolve(&self, rel_path: &str) -> Result<ResolvedFile, LibraryError> {
        if rel_path.is_empty() || rel_path.starts_with('/') {
            return Err(LibraryError::PathEscape(rel_path.to_owned()));
        }

        let joined = self.root.join(rel_path);
        let abs = tokio::fs::canonicalize(&joined).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LibraryError::NotFound(rel_path.to_owned())
            } else {
                LibraryError::Io {
                    path: rel_path.to_owned(),
                    source: e,
                }
            }
        })?;
        let abs = Utf8PathBuf::from_path_buf(abs)
            .map_err(|p| LibraryError::PathEscape(p.display().to_string()))?;

        if !abs.starts_with(&self.root) {
            return Err(LibraryError::PathEscape(rel_path.to_owned()));
        }

        let meta = tokio::fs::metadata(&abs).await.map_err(|e| LibraryError::Io {
            path: rel_path.to_owned(),
            source: e,
        })?;
        if !meta.is_file() {
            return Err(LibraryError::NotRegularFile(rel_path.to_owned()));
        }

        let rel = abs
            .strip_prefix(&self.root)
            .expect("prefix was just checked")
            .as_str()
            .to_owned();

        Ok(ResolvedFile {
            rel_path: rel,
            abs_path: abs,
            size: meta.len(),
        })
    }

    /// Relative paths of all regular files under the root, sorted. Hidden
    /// files and directories (leading dot) are omitted.
    pub async fn list_files(&self) -> anyhow::Result<Vec<String>> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || list_files_sync(&root))
            .await
            .map_err(|e| anyhow::anyhow!("library listing task panicked: {e}"))??;
        Ok(files)
    }
}

fn list_files_sync(root: &Utf8Path) -> anyhow::Result<Vec<String>> {
    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        // depth 0 is the root itself, whatever it happens to be named
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .map(|name| name.starts_with('.'))
                    .unwrap_or(true)
        });

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root.as_std_path())
            .expect("walkdir yields paths under its root");
        if let Some(rel) = rel.to_str() {
            files.push(rel.to_owned());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    async fn fixture() -> (camino_tempfile::Utf8TempDir, Library) {
        let dir = tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"hello world!")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("sub/b.bin"), b"xyz")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join(".hidden"), b"secret")
            .await
            .unwrap();
        let library = Library::open(dir.path()).unwrap();
        (dir, library)
    }

    #[tokio::test]
    async fn resolve_regular_file() {
        let (_dir, library) = fixture().await;
        let f = library.resolve("a.txt").await.unwrap();
        assert_eq!(f.rel_path, "a.txt");
        assert_eq!(f.size, 12);
        assert_eq!(f.basename(), "a.txt");
    }

    #[tokio::test]
    async fn resolve_rejects_traversal() {
        let (_dir, library) = fixture().await;
        assert!(matches!(
            library.resolve("../etc/passwd").await,
            Err(LibraryError::PathEscape(_)) | Err(LibraryError::NotFound(_))
        ));
        assert!(matches!(
            library.resolve("/etc/passwd").await,
            Err(LibraryError::PathEscape(_))
        ));
    }

    #[tokio::test]
    async fn resolve_rejects_escaping_symlink() {
        let (dir, library) = fixture().await;
        tokio::fs::symlink("/etc/passwd", dir.path().join("link"))
            .await
            .unwrap();
        assert!(matches!(
            library.resolve("link").await,
            Err(LibraryError::PathEscape(_))
        ));
    }

    #[tokio::test]
    async fn resolve_rejects_directory() {
        let (_dir, library) = fixture().await;
        assert!(matches!(
            library.resolve("sub").await,
            Err(LibraryError::NotRegularFile(_))
        ));
    }

    #[tokio::test]
    async fn resolve_missing_file() {
        let (_dir, library) = fixture().await;
        assert!(matches!(
            library.resolve("nope.txt").await,
            Err(LibraryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn listing_is_sorted_and_skips_hidden() {
        let (_dir, library) = fixture().await;
        let files = library.list_files().await.unwrap();
        assert_eq!(files, vec!["a.txt", "sub/b.bin"]);
    }
}
