//! Concurrent-safe reservation of unique names within a directory.

use tracing::debug;

use crate::error::{PhotarkError, Result};
use crate::repo::{create_dir_all_0700, create_file_0600, join_rel, Repository};

impl Repository {
    /// Reserve a name for a new file (or directory) inside the
    /// repo-relative `dir`. If `target_name` is taken, a counter is
    /// spliced in at the first dot (`p.jpg` → `p-002.jpg`, `album` →
    /// `album-002`) until a free name is found, up to 999 collisions.
    ///
    /// Workers racing on the same `(dir, target_name)` are serialized
    /// through the filename registry, and the chosen name is physically
    /// created on disk (an empty file, or the directory itself) before the
    /// registry key is released, so a returned name can never be handed
    /// out twice.
    pub(crate) fn reserve_unique_filename(
        &self,
        dir: &str,
        target_name: &str,
        is_dir: bool,
    ) -> Result<String> {
        let _reservation = self.inflight.names.acquire(&join_rel(dir, target_name));

        let mut candidate = target_name.to_string();
        if self.file_exists(&join_rel(dir, &candidate)) {
            let mut found = false;
            for i in 2..1000u32 {
                candidate = numbered_candidate(target_name, i);
                if !self.file_exists(&join_rel(dir, &candidate)) {
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(PhotarkError::NamesExhausted(target_name.to_string()));
            }
        }

        let full = self.full_path(&join_rel(dir, &candidate));
        if is_dir {
            debug!("reserving directory {}", full.display());
            create_dir_all_0700(&full)?;
        } else {
            create_file_0600(&full)?;
        }

        Ok(candidate)
    }
}

/// Splice `-{i:03}` in before the extension: `photo.jpg` → `photo-002.jpg`,
/// `archive.tar.gz` → `archive-002.tar.gz`, `album` → `album-002`.
fn numbered_candidate(target_name: &str, i: u32) -> String {
    match target_name.split_once('.') {
        Some((base, ext)) => format!("{base}-{i:03}.{ext}"),
        None => format!("{target_name}-{i:03}"),
    }
}
