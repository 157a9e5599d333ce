//! Best-effort persistence of downloaded bundles under
//! `persistence_directory` (§4.F "reads persisted bundles ... on a
//! best-effort basis").

use std::path::{Path, PathBuf};

fn bundle_file(persistence_directory: &Path, name: &str) -> PathBuf {
    persistence_directory.join(name).join("bundle.tar.gz")
}

/// Write `raw` to `<persistence_directory>/<name>/bundle.tar.gz`, via a
/// temp-file-then-rename so a crash mid-write never leaves a truncated
/// bundle behind for the next recovery attempt.
pub fn persist_bundle(persistence_directory: &Path, name: &str, raw: &[u8]) -> std::io::Result<()> {
    let target = bundle_file(persistence_directory, name);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = target.with_extension("tar.gz.tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, &target)
}

/// Load a previously persisted bundle, returning `None` (and logging) on
/// any error rather than failing startup — recovery is best-effort (§4.F).
pub fn load_persisted_bundle(persistence_directory: &Path, name: &str) -> Option<Vec<u8>> {
    let path = bundle_file(persistence_directory, name);
    match std::fs::read(&path) {
        Ok(bytes) => Some(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            tracing::warn!(bundle = %name, path = %path.display(), error = %err, "failed to read persisted bundle");
            None
        }
    }
}
