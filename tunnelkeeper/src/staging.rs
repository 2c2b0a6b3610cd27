//! Per-tunnel staging directories.
//!
//! The static file server only ever sees `<staging_root>/<tunnel_id>/`, so
//! a tunnel exposes exactly one file and nothing else of the library. The
//! staging reference is a symlink to the canonical library path.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use utils::fs_ext;
use utils::id::TunnelId;

use crate::library::ResolvedFile;

#[derive(Debug, Clone)]
pub struct StagingDir {
    root: Utf8PathBuf,
}

impl StagingDir {
    pub async fn create(root: &Utf8Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("creating staging root '{root}'"))?;
        let root = root
            .canonicalize_utf8()
            .with_context(|| format!("canonicalizing staging root '{root}'"))?;
        Ok(Self { root })
    }

    pub fn tunnel_dir(&self, tunnel_id: TunnelId) -> Utf8PathBuf {
        self.root.join(tunnel_id.to_string())
    }

    /// Stage `file` for exposure: create the per-tunnel directory and a
    /// symlink named after the file inside it. Returns the link path.
    pub async fn stage(
        &self,
        tunnel_id: TunnelId,
        file: &ResolvedFile,
    ) -> anyhow::Result<Utf8PathBuf> {
        let dir = self.tunnel_dir(tunnel_id);
        tokio::fs::create_dir(&dir)
            .await
            .with_context(|| format!("creating staging dir '{dir}'"))?;
        let link = dir.join(file.basename());
        tokio::fs::symlink(&file.abs_path, &link)
            .await
            .with_context(|| format!("linking '{}' as '{link}'", file.abs_path))?;
        Ok(link)
    }

    /// Remove a tunnel's staging directory. Tolerates the directory being
    /// gone already, so destroy can be retried.
    pub async fn remove(&self, tunnel_id: TunnelId) -> anyhow::Result<()> {
        let dir = self.tunnel_dir(tunnel_id);
        tokio::fs::remove_dir_all(&dir)
            .await
            .or_else(fs_ext::ignore_not_found)
            .with_context(|| format!("removing staging dir '{dir}'"))
    }

    /// Tunnel ids that currently have a staging directory. Non-id entries
    /// are ignored; the reconciler uses this to sweep orphans.
    pub async fn list(&self) -> anyhow::Result<Vec<TunnelId>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading staging root '{}'", self.root))?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = name.parse::<TunnelId>() {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[tokio::test]
    async fn stage_and_remove() {
        let lib = tempdir().unwrap();
        let staging = tempdir().unwrap();
        tokio::fs::write(lib.path().join("a.txt"), b"12 bytes....")
            .await
            .unwrap();

        let sd = StagingDir::create(staging.path()).await.unwrap();
        let id: TunnelId = "0a1b2c3d".parse().unwrap();
        let file = ResolvedFile {
            rel_path: "a.txt".to_owned(),
            abs_path: lib.path().join("a.txt"),
            size: 12,
        };

        let link = sd.stage(id, &file).await.unwrap();
        assert!(link.as_str().ends_with("0a1b2c3d/a.txt"));
        assert_eq!(tokio::fs::read(&link).await.unwrap(), b"12 bytes....");
        assert_eq!(sd.list().await.unwrap(), vec![id]);

        sd.remove(id).await.unwrap();
        assert!(sd.list().await.unwrap().is_empty());
        // second removal is a no-op
        sd.remove(id).await.unwrap();
    }
}
