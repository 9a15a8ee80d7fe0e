//! The pointer manifest: a per-collection `others.txt` whose lines are
//! repo-relative paths to items that belong to this collection but whose
//! canonical file lives under another collection's directory.
//!
//! The file is plain text with no escape policy; providers are responsible
//! for never producing names containing a newline. Rewrites go through a
//! sibling temp file and commit with a rename, so readers never observe a
//! half-written manifest.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind, Write};

use crate::error::Result;
use crate::repo::{create_dir_all_0700, create_file_0600, join_rel, open_append_0600, Repository};

pub(crate) const MEDIA_LIST_NAME: &str = "others.txt";

impl Repository {
    /// Repo-relative path of the media list for the collection directory
    /// `dir_path`.
    pub(crate) fn media_list_path(dir_path: &str) -> String {
        join_rel(dir_path, MEDIA_LIST_NAME)
    }

    /// Append one path line to the media list in `dir_path`, creating the
    /// directory and the file as needed.
    pub(crate) fn append_media_list(&self, dir_path: &str, line: &str) -> Result<()> {
        create_dir_all_0700(&self.full_path(dir_path))?;
        let mut file = open_append_0600(&self.full_path(&Self::media_list_path(dir_path)))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Whether the media list in `dir_path` has a line equal to `path`.
    /// A missing media list simply does not contain anything.
    pub(crate) fn media_list_contains(&self, dir_path: &str, path: &str) -> Result<bool> {
        let file = match File::open(self.full_path(&Self::media_list_path(dir_path))) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        for line in BufReader::new(file).lines() {
            if line?.trim() == path {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Replace every line equal to `old_path` with `new_path` in the media
    /// list in `dir_path`; an empty `new_path` deletes matching lines. The
    /// rewrite lands atomically via a temp-file rename, and a rewrite that
    /// leaves zero lines deletes the file. Missing file is a no-op.
    pub(crate) fn replace_in_media_list(
        &self,
        dir_path: &str,
        old_path: &str,
        new_path: &str,
    ) -> Result<()> {
        let perm = self.full_path(&Self::media_list_path(dir_path));
        let tmp = perm.with_extension("txt.tmp");

        let infile = match File::open(&perm) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut out = create_file_0600(&tmp)?;
        let mut wrote_any = false;
        for line in BufReader::new(infile).lines() {
            let line = line?;
            if line == old_path {
                if new_path.is_empty() {
                    continue;
                }
                writeln!(out, "{new_path}")?;
                wrote_any = true;
                continue;
            }
            writeln!(out, "{line}")?;
            wrote_any = true;
        }
        out.flush()?;
        drop(out);

        fs::rename(&tmp, &perm)?;
        if !wrote_any {
            fs::remove_file(&perm)?;
        }
        Ok(())
    }
}
