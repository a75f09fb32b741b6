//! The on-disk working directory.
//!
//! One directory per database:
//!
//! ```text
//! base.fvecs                       raw vectors, no header
//! base.xids                        aligned external ids, -1 = deleted
//! base.mutation                    8-byte little-endian delete counter
//! <recipe>.<mutation>.<ntrain>.index   serialised index artifacts
//! *.tmp                            side files during a sync
//! ```
//!
//! Promotion renames the side files over the primaries while the
//! coordinator holds its write lock.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const FVECS_NAME: &str = "base.fvecs";
const XIDS_NAME: &str = "base.xids";
const MUTATION_NAME: &str = "base.mutation";
const INDEX_SUFFIX: &str = ".index";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Clone, Debug)]
pub struct WorkDir {
    dir: PathBuf,
}

impl WorkDir {
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|err| Error::io(&dir, err))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn fvecs(&self) -> PathBuf {
        self.dir.join(FVECS_NAME)
    }

    pub fn xids(&self) -> PathBuf {
        self.dir.join(XIDS_NAME)
    }

    pub fn mutation(&self) -> PathBuf {
        self.dir.join(MUTATION_NAME)
    }

    pub fn tmp_sibling(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(TMP_SUFFIX);
        PathBuf::from(name)
    }

    pub fn artifact(&self, recipe: &str, mutation: u64, ntrain: usize) -> PathBuf {
        self.dir
            .join(format!("{recipe}.{mutation}.{ntrain}{INDEX_SUFFIX}"))
    }

    /// Scans for the newest artifact of `recipe`, ordered by the
    /// `(mutation, ntrain)` pair encoded in the filename.
    pub fn latest_artifact(&self, recipe: &str) -> Result<Option<(PathBuf, u64, usize)>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|err| Error::io(&self.dir, err))?;
        let mut best: Option<(PathBuf, u64, usize)> = None;
        for entry in entries {
            let entry = entry.map_err(|err| Error::io(&self.dir, err))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((mutation, ntrain)) = parse_artifact_name(name, recipe) else {
                continue;
            };
            let candidate = (entry.path(), mutation, ntrain);
            best = match best {
                Some(current) if (current.1, current.2) >= (mutation, ntrain) => Some(current),
                _ => Some(candidate),
            };
        }
        Ok(best)
    }

    /// Deletes every artifact of `recipe` except `keep` (all of them when
    /// `keep` is `None`).
    pub fn prune_artifacts(&self, recipe: &str, keep: Option<&Path>) -> Result<()> {
        let entries = std::fs::read_dir(&self.dir).map_err(|err| Error::io(&self.dir, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| Error::io(&self.dir, err))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if parse_artifact_name(name, recipe).is_none() {
                continue;
            }
            let path = entry.path();
            if keep != Some(path.as_path()) {
                tracing::debug!(path = %path.display(), "pruning stale index artifact");
                std::fs::remove_file(&path).map_err(|err| Error::io(&path, err))?;
            }
        }
        Ok(())
    }

    /// Atomically replaces `primary` with its side copy.
    pub fn promote(tmp: &Path, primary: &Path) -> Result<()> {
        std::fs::rename(tmp, primary).map_err(|err| Error::io(primary, err))
    }
}

fn parse_artifact_name(name: &str, recipe: &str) -> Option<(u64, usize)> {
    let stem = name.strip_suffix(INDEX_SUFFIX)?;
    let rest = stem.strip_prefix(recipe)?.strip_prefix('.')?;
    let (mutation_str, ntrain_str) = rest.split_once('.')?;
    let mutation = mutation_str.parse().ok()?;
    let ntrain = ntrain_str.parse().ok()?;
    Some((mutation, ntrain))
}

/// Removes every database file under `dir`: the base files, all index
/// artifacts, and any leftover side copies.
pub fn clear_work_dir(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(Error::io(dir, err)),
    };
    for entry in entries {
        let entry = entry.map_err(|err| Error::io(dir, err))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let ours = name == FVECS_NAME
            || name == XIDS_NAME
            || name == MUTATION_NAME
            || name.ends_with(INDEX_SUFFIX)
            || name.ends_with(TMP_SUFFIX);
        if ours {
            let path = entry.path();
            std::fs::remove_file(&path).map_err(|err| Error::io(&path, err))?;
        }
    }
    tracing::info!(dir = %dir.display(), "cleared work directory");
    Ok(())
}
