//! Identity / version chain.
//!
//! An `Identity` is the logical shared object behind a canonical path: it
//! owns an ordered sequence of `Image` versions, tracks which one is
//! `current`, and is the unit the debug notifier and DSU controller key
//! their work on.

use crate::errors::{LuciError, Result};
use crate::image::{Image, ImageState};
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// `(device, inode)` pair used for identity equality: two paths naming the
/// same file must resolve to one Identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub dev: u64,
    pub ino: u64,
}

impl FileKey {
    pub fn of(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(LuciError::Io)?;
        Ok(FileKey {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

/// A debugger-visible link-map record; kept in sync with whichever image is
/// `current` for consumers that don't know about versioning at all.
#[derive(Debug, Clone, Default)]
pub struct LinkMapRecord {
    pub l_addr: usize,
    pub l_name: String,
}

pub struct Identity {
    pub key: FileKey,
    pub path: PathBuf,
    pub versions: RwLock<Vec<Arc<Image>>>,
    pub current: Mutex<usize>,
    pub link_map: Mutex<LinkMapRecord>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("path", &self.path)
            .field("versions", &self.versions.read().unwrap().len())
            .finish()
    }
}

impl Identity {
    fn new(key: FileKey, path: PathBuf) -> Self {
        Identity {
            key,
            path,
            versions: RwLock::new(Vec::new()),
            current: Mutex::new(0),
            link_map: Mutex::new(LinkMapRecord::default()),
        }
    }

    pub fn current_image(&self) -> Arc<Image> {
        let versions = self.versions.read().unwrap();
        let idx = *self.current.lock().unwrap();
        versions[idx].clone()
    }

    /// Prior (non-current) versions still retained because some dependent
    /// frame or dtv might still reference them.
    pub fn prior_images(&self) -> Vec<Arc<Image>> {
        let versions = self.versions.read().unwrap();
        let idx = *self.current.lock().unwrap();
        versions
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, img)| img.clone())
            .collect()
    }

    pub fn version_count(&self) -> usize {
        self.versions.read().unwrap().len()
    }
}

/// Per-path registry; creation is atomic so two interners racing on the same
/// canonical path or the same inode get back the same `Identity`.
#[derive(Default)]
pub struct IdentityChain {
    by_path: Mutex<HashMap<PathBuf, Arc<Identity>>>,
    by_key: Mutex<HashMap<FileKey, Arc<Identity>>>,
}

impl IdentityChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalizes `path` and returns the unique `Identity` for it,
    /// creating one if this is the first reference. A second caller
    /// referencing the same file by a different path (but same inode)
    /// receives the exact same `Identity`.
    pub fn intern(&self, path: &Path) -> Result<Arc<Identity>> {
        let canonical = std::fs::canonicalize(path).map_err(LuciError::Io)?;
        let key = FileKey::of(&canonical)?;

        let mut by_key = self.by_key.lock().unwrap();
        if let Some(existing) = by_key.get(&key) {
            let mut by_path = self.by_path.lock().unwrap();
            by_path.entry(canonical).or_insert_with(|| existing.clone());
            return Ok(existing.clone());
        }

        let identity = Arc::new(Identity::new(key, canonical.clone()));
        by_key.insert(key, identity.clone());
        drop(by_key);

        let mut by_path = self.by_path.lock().unwrap();
        by_path.insert(canonical, identity.clone());
        Ok(identity)
    }

    pub fn lookup_path(&self, path: &Path) -> Option<Arc<Identity>> {
        self.by_path.lock().unwrap().get(path).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Identity>> {
        self.by_key.lock().unwrap().values().cloned().collect()
    }

    /// Appends `image` as the new current version; the previous current
    /// becomes the (new) head of the prior list.
    pub fn attach(&self, identity: &Identity, image: Arc<Image>) {
        let mut versions = identity.versions.write().unwrap();
        versions.push(image);
        *identity.current.lock().unwrap() = versions.len() - 1;
        let mut link_map = identity.link_map.lock().unwrap();
        link_map.l_addr = versions.last().unwrap().base;
        link_map.l_name = identity.path.to_string_lossy().into_owned();
    }

    /// Marks a no-longer-current `image` as `Retiring`, the signal the
    /// retirement predicate and `retire` itself require before an image may
    /// be unmapped. Refuses to mark the current version.
    pub fn begin_retirement(&self, identity: &Identity, image: &Arc<Image>) -> Result<()> {
        let versions = identity.versions.read().unwrap();
        let current_idx = *identity.current.lock().unwrap();
        let is_current = versions
            .get(current_idx)
            .map(|c| Arc::ptr_eq(c, image))
            .unwrap_or(false);
        if is_current {
            return Err(LuciError::Fatal {
                reason: "refusing to mark the current version as retiring".into(),
            });
        }
        image.state.set(ImageState::Retiring);
        Ok(())
    }

    /// Unlinks and unmaps `image`, provided the retirement predicate holds.
    /// The predicate is the caller's responsibility (it requires knowledge
    /// of live threads and call stacks this module doesn't own); this
    /// function assumes it has already been checked true.
    pub fn retire(&self, identity: &Identity, image: &Arc<Image>) -> Result<()> {
        let mut versions = identity.versions.write().unwrap();
        let pos = versions
            .iter()
            .position(|v| Arc::ptr_eq(v, image))
            .ok_or_else(|| LuciError::NotFound {
                what: format!("image {:?} not in chain for {:?}", image.path, identity.path),
            })?;
        let current_idx = *identity.current.lock().unwrap();
        if pos == current_idx {
            return Err(LuciError::Fatal {
                reason: "refusing to retire the current version".into(),
            });
        }
        versions.remove(pos);
        if pos < current_idx {
            *identity.current.lock().unwrap() -= 1;
        }
        Ok(())
    }
}

/// Whether `image` may be safely destroyed: not current, and (caller-supplied)
/// no thread dtv, no live return address, and no unrebound dependent.
pub fn retirement_ready(
    identity: &Identity,
    image: &Arc<Image>,
    no_live_returns: bool,
    no_dtv_refs: bool,
    no_unrebound_dependents: bool,
) -> bool {
    let versions = identity.versions.read().unwrap();
    let current_idx = *identity.current.lock().unwrap();
    let is_current = versions
        .get(current_idx)
        .map(|c| Arc::ptr_eq(c, image))
        .unwrap_or(false);
    !is_current
        && image.state.get() == ImageState::Retiring
        && no_live_returns
        && no_dtv_refs
        && no_unrebound_dependents
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_dummy_so(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"not really an elf, just needs an inode").unwrap();
        path
    }

    #[test]
    fn interning_same_path_twice_yields_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_dummy_so(&dir, "libfoo.so");
        let chain = IdentityChain::new();
        let a = chain.intern(&path).unwrap();
        let b = chain.intern(&path).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    fn bare_image(path: &str, base: usize) -> Arc<Image> {
        use crate::image::{AtomicImageState, DynInfo, RelocSet};
        Arc::new(Image {
            path: PathBuf::from(path),
            base,
            segments: vec![],
            relro: None,
            program_headers: vec![],
            dyn_info: DynInfo::default(),
            symtab: vec![],
            file_bytes: Vec::new(),
            relocs: RelocSet::default(),
            tls: None,
            needed: vec![],
            soname: None,
            state: AtomicImageState::new(ImageState::Ready),
            fd: None,
            is_pie: true,
            entry: 0,
            versym: vec![],
            verdef_names: std::collections::HashMap::new(),
            verneed_names: std::collections::HashMap::new(),
        })
    }

    #[test]
    fn retirement_requires_marking_retiring_first_and_refuses_the_current_version() {
        let identity = Arc::new(Identity::new(FileKey { dev: 0, ino: 1 }, PathBuf::from("/fake/libfoo.so")));
        let chain = IdentityChain::new();
        let v0 = bare_image("/fake/libfoo.so", 0x1000);
        chain.attach(&identity, v0.clone());
        let v1 = bare_image("/fake/libfoo.so", 0x2000);
        chain.attach(&identity, v1.clone());

        // v0 is no longer current, but hasn't been marked retiring yet.
        assert!(!retirement_ready(&identity, &v0, true, true, true));

        // The current version (v1) may never be marked retiring.
        assert!(chain.begin_retirement(&identity, &v1).is_err());

        chain.begin_retirement(&identity, &v0).unwrap();
        assert_eq!(v0.state.get(), ImageState::Retiring);
        assert!(retirement_ready(&identity, &v0, true, true, true));
        assert!(!retirement_ready(&identity, &v0, false, true, true));

        chain.retire(&identity, &v0).unwrap();
        assert_eq!(identity.version_count(), 1);
    }

    #[test]
    fn interning_by_hardlink_yields_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_dummy_so(&dir, "libfoo.so");
        let alias = dir.path().join("libfoo-alias.so");
        std::fs::hard_link(&path, &alias).unwrap();

        let chain = IdentityChain::new();
        let a = chain.intern(&path).unwrap();
        let b = chain.intern(&alias).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
