//! Static archive reader: a thin wrapper around `goblin::archive::Archive`
//! for the rare `DT_NEEDED` entry that resolves into a `.a` rather than a
//! `.so`. Not a reimplementation of archive internals — just enough surface
//! to enumerate and extract member object files.

use crate::errors::{LuciError, Result};
use std::path::{Path, PathBuf};

pub struct StaticArchive {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl StaticArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(LuciError::Io)?;
        // Validate eagerly so callers get a BadFormat at open time rather
        // than at first member access.
        goblin::archive::Archive::parse(&bytes).map_err(LuciError::Goblin)?;
        Ok(StaticArchive {
            path: path.to_path_buf(),
            bytes,
        })
    }

    pub fn member_names(&self) -> Result<Vec<String>> {
        let archive = goblin::archive::Archive::parse(&self.bytes).map_err(LuciError::Goblin)?;
        Ok(archive.members().into_iter().map(str::to_string).collect())
    }

    /// Returns the raw bytes of `member`, suitable for handing to
    /// `image::Image::parse_bytes`.
    pub fn extract(&self, member: &str) -> Result<Vec<u8>> {
        let archive = goblin::archive::Archive::parse(&self.bytes).map_err(LuciError::Goblin)?;
        archive
            .extract(member, &self.bytes)
            .map(|s| s.to_vec())
            .map_err(|e| LuciError::BadFormat {
                path: self.path.clone(),
                reason: format!("member {member:?}: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_non_archive_is_bad_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-an-archive.a");
        std::fs::write(&path, b"definitely not an ar archive").unwrap();
        let err = StaticArchive::open(&path).unwrap_err();
        assert!(matches!(err, LuciError::Goblin(_)));
    }
}
