//! Deployment artifacts served to executors.
//!
//! A prepared commit directory is packed into `<dir>/<commit id>.tgz`,
//! leaving out the top-level `.git` directory. Executors download it with
//! their own token.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::Result;
use crate::store::Commit;

/// Outcome of an artifact download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLookup {
    /// Token unknown, or the instance does not belong to that executor.
    Unauthorized,
    NotFound,
    Found(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the package for `artifact_id`, whether or not it exists.
    /// Ids that could escape the artifact directory yield `None`.
    pub fn path_of(&self, artifact_id: &str) -> Option<PathBuf> {
        let safe = !artifact_id.is_empty()
            && artifact_id != "."
            && artifact_id != ".."
            && !artifact_id.contains(['/', '\\']);
        safe.then(|| self.dir.join(format!("{artifact_id}.tgz")))
    }

    /// Existing package for `artifact_id`.
    pub async fn find(&self, artifact_id: &str) -> Option<PathBuf> {
        let path = self.path_of(artifact_id)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(path),
            _ => None,
        }
    }

    /// Packs the commit directory and returns the package path.
    pub async fn prepare(&self, commit: &Commit) -> Result<PathBuf> {
        let path = self
            .path_of(&commit.id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid commit id {:?}", commit.id)))?;
        let dir = self.dir.clone();
        let src = commit.dir.clone();
        let target = path.clone();
        debug!(component = "artifact", event = "prepare", commit = %commit.id, src = ?src, "packing commit");

        tokio::task::spawn_blocking(move || -> io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let tmp = target.with_extension("tgz.tmp");
            pack_dir(&src, &tmp)?;
            std::fs::rename(&tmp, &target)
        })
        .await
        .map_err(io::Error::other)??;

        info!(component = "artifact", event = "prepared", commit = %commit.id, path = ?path, "commit packed");
        Ok(path)
    }
}

fn pack_dir(src: &Path, target: &Path) -> io::Result<()> {
    let file = BufWriter::new(File::create(target)?);
    let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let walker = WalkDir::new(src)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == ".git"));
    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let name = Path::new(".").join(rel);
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            // Links are stored as links, never followed.
            let target = std::fs::read_link(entry.path())?;
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            tar.append_link(&mut header, &name, &target)?;
        } else if file_type.is_dir() {
            tar.append_dir(&name, entry.path())?;
        } else if file_type.is_file() {
            tar.append_path_with_name(entry.path(), &name)?;
        } else {
            debug!(component = "artifact", event = "skip_special", path = ?entry.path(), "not packing special file");
        }
    }

    let mut gz = tar.into_inner()?;
    gz.flush()?;
    gz.finish()?.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;
    use std::io::Read;

    fn entries(path: &Path) -> BTreeMap<String, String> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
        let mut out = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path().unwrap().to_string_lossy().trim_start_matches("./").to_string();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            out.insert(name, body);
        }
        out
    }

    #[tokio::test]
    async fn test_prepare_packs_commit_without_top_level_git() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("package.json"), "{}").unwrap();
        std::fs::create_dir_all(src.path().join("lib/.git")).unwrap();
        std::fs::write(src.path().join("lib/index.js"), "module.exports = 1;").unwrap();
        std::fs::write(src.path().join("lib/.git/keep"), "nested git stays").unwrap();
        std::fs::create_dir_all(src.path().join(".git")).unwrap();
        std::fs::write(src.path().join(".git/HEAD"), "ref").unwrap();

        let out = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(out.path().join("executor"));
        let commit = Commit {
            id: "abc123".into(),
            dir: src.path().to_path_buf(),
        };
        let path = store.prepare(&commit).await.unwrap();
        assert_eq!(path, out.path().join("executor/abc123.tgz"));

        let files = entries(&path);
        assert_eq!(files.get("package.json").map(String::as_str), Some("{}"));
        assert_eq!(files.get("lib/index.js").map(String::as_str), Some("module.exports = 1;"));
        assert!(files.contains_key("lib/.git/keep"));
        assert!(!files.keys().any(|k| k.starts_with(".git")));

        assert_eq!(store.find("abc123").await, Some(path));
        assert_eq!(store.find("missing").await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prepare_keeps_symlinks_as_links() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("node_modules/.bin")).unwrap();
        std::fs::write(src.path().join("node_modules/tool.js"), "#!/usr/bin/env node").unwrap();
        std::os::unix::fs::symlink("../tool.js", src.path().join("node_modules/.bin/tool")).unwrap();

        let out = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(out.path());
        let commit = Commit {
            id: "links".into(),
            dir: src.path().to_path_buf(),
        };
        let path = store.prepare(&commit).await.unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&path).unwrap()));
        let mut links = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            if !entry.header().entry_type().is_symlink() {
                continue;
            }
            let name = entry.path().unwrap().to_string_lossy().trim_start_matches("./").to_string();
            let target = entry.link_name().unwrap().unwrap().to_string_lossy().to_string();
            links.insert(name, target);
        }
        assert_eq!(links.get("node_modules/.bin/tool").map(String::as_str), Some("../tool.js"));

        // The link target itself is still packed as a regular file.
        assert!(entries(&path).contains_key("node_modules/tool.js"));
    }

    #[test]
    fn test_path_of_rejects_traversal() {
        let store = ArtifactStore::new("/tmp/artifacts");
        assert!(store.path_of("../etc/passwd").is_none());
        assert!(store.path_of("..").is_none());
        assert!(store.path_of("").is_none());
        assert_eq!(store.path_of("c1"), Some(PathBuf::from("/tmp/artifacts/c1.tgz")));
    }
}
