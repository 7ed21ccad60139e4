//! Artifact files: scratch creation, commit, and content hashing
//!
//! Suppliers write into scratch files obtained from their supply context.
//! Once committed an artifact is read-only and immutable; the engine then
//! hashes it and promotes it to its content-addressed final name.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::error::{LarderError, LarderResult};

/// File extension of committed, content-addressed artifact files
pub const ARTIFACT_EXT: &str = "art";

const SCRATCH_PREFIX: &str = "scratch-";
const SCRATCH_SUFFIX: &str = ".tmp";

/// One artifact file produced by a supplier.
///
/// Writable until [`commit`](Artifact::commit), immutable afterwards.
#[derive(Debug)]
pub struct Artifact {
    path: PathBuf,
    readonly: AtomicBool,
}

impl Artifact {
    /// Create a fresh scratch artifact inside the given directory
    pub(crate) fn scratch(dir: &Path) -> LarderResult<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| LarderError::io(format!("creating cache directory {}", dir.display()), e))?;
        let name = format!("{SCRATCH_PREFIX}{}{SCRATCH_SUFFIX}", Uuid::new_v4().simple());
        Ok(Self {
            path: dir.join(name),
            readonly: AtomicBool::new(false),
        })
    }

    /// Location of the artifact file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the artifact has been committed
    pub fn readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    /// Write the full artifact contents. Fails after commit.
    pub fn write(&self, bytes: &[u8]) -> LarderResult<()> {
        if self.readonly() {
            return Err(LarderError::ArtifactReadonly(self.path.clone()));
        }
        fs::write(&self.path, bytes)
            .map_err(|e| LarderError::io(format!("writing artifact {}", self.path.display()), e))
    }

    /// Commit the artifact, making it immutable.
    ///
    /// The file must exist by the time the supplier commits; committing an
    /// artifact that was never written is a supplier bug.
    pub fn commit(&self) -> LarderResult<()> {
        if self.readonly() {
            return Ok(());
        }
        if !self.path.is_file() {
            return Err(LarderError::ArtifactMissing(self.path.clone()));
        }
        self.readonly.store(true, Ordering::Release);
        Ok(())
    }
}

/// Stream a file through SHA-256, returning the hex hash and byte size
pub fn hash_file(path: &Path) -> LarderResult<(String, u64)> {
    let mut file = File::open(path)
        .map_err(|e| LarderError::io(format!("opening artifact {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    let mut size = 0u64;
    loop {
        let amount = file
            .read(&mut buffer)
            .map_err(|e| LarderError::io(format!("reading artifact {}", path.display()), e))?;
        if amount == 0 {
            break;
        }
        hasher.update(&buffer[..amount]);
        size += amount as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// File name of a committed artifact with the given content hash
pub(crate) fn content_file_name(hash: &str) -> String {
    format!("{hash}.{ARTIFACT_EXT}")
}

/// Promote a committed scratch artifact to its content-addressed name.
///
/// If an identical artifact already exists the scratch copy is discarded and
/// the existing file reused, keeping exactly one file per content hash.
pub(crate) fn promote(artifact: &Artifact, dir: &Path, hash: &str) -> LarderResult<PathBuf> {
    let target = dir.join(content_file_name(hash));
    if target == artifact.path() {
        return Ok(target);
    }
    if target.is_file() {
        debug!("Artifact {} already stored, discarding scratch copy", hash);
        if let Err(e) = fs::remove_file(artifact.path()) {
            debug!("Unable to remove redundant scratch file: {e}");
        }
        return Ok(target);
    }
    fs::rename(artifact.path(), &target)
        .map_err(|e| LarderError::io(format!("promoting artifact to {}", target.display()), e))?;
    Ok(target)
}

/// Whether a directory entry is a committed artifact file
pub(crate) fn is_artifact_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXT)
}

/// Whether a directory entry is a leftover scratch file
pub(crate) fn is_scratch_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(SCRATCH_PREFIX) && n.ends_with(SCRATCH_SUFFIX))
}
