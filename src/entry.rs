//! Interpreter entry glue: loads a target ELF and its dependency closure,
//! relocates and initializes them, then computes the address and auxv/stack
//! layout needed to transfer control per the System V x86-64 psABI.
//!
//! Actually transferring control (clobbering this process's own stack and
//! jumping to the target entry point with `%rbp = 0`) requires inline
//! assembly that cannot be exercised in a test harness; this module stops
//! at the point where that handoff would occur and returns the computed
//! `EntryPlan` so callers (and tests) can inspect it.

use crate::api::{Loader, NamespaceId, OpenFlags};
use crate::errors::{LuciError, Result};
use crate::identity::Identity;
use crate::image::{Image, ImageState};
use crate::initfini::{self, DepNode};
use crate::reloc;
use crate::resolver::{Scope, ScopeMode};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything needed to hand control to the target program, computed but
/// not yet acted upon.
pub struct EntryPlan {
    pub entry_point: usize,
    pub stack_pointer_hint: usize,
    pub argv: Vec<String>,
    pub loaded: Vec<Arc<Identity>>,
}

/// Loads `target` and its full `DT_NEEDED` closure (searched via
/// `search_path`), relocates every image leaves-first, runs constructors in
/// dependency order, and returns the plan for transferring control.
pub fn prepare(loader: &Loader, target: &Path, argv: Vec<String>) -> Result<EntryPlan> {
    let mut loaded_order: Vec<Arc<Identity>> = Vec::new();
    let mut seen: HashSet<(u64, u64)> = HashSet::new();
    load_closure_recursive(loader, target, &mut loaded_order, &mut seen)?;

    let nodes: Vec<DepNode> = loaded_order
        .iter()
        .map(|identity| {
            let image = identity.current_image();
            let needed: Vec<Arc<Identity>> = image
                .needed
                .iter()
                .filter_map(|name| {
                    loaded_order
                        .iter()
                        .find(|id| id.path.file_name().and_then(|f| f.to_str()) == Some(name.as_str()))
                        .cloned()
                })
                .collect();
            DepNode {
                identity: identity.clone(),
                needed,
            }
        })
        .collect();
    let init_order = initfini::topo_order(&nodes);

    let mut global_scope = Scope::new();
    for identity in &loaded_order {
        global_scope.push(identity.clone(), ScopeMode::Global);
    }

    for identity in loaded_order.iter().rev() {
        let image = identity.current_image();
        image.state.set(ImageState::Relocating);
        let writes = reloc::relocate_image(
            &image,
            identity,
            &global_scope,
            &loader.cache,
            &loader.unique,
            &loader.ifuncs,
            true,
        )?;
        unsafe {
            reloc::commit_writes(&image, &writes)?;
        }
    }

    for identity in &init_order {
        let image = identity.current_image();
        let is_main = Arc::ptr_eq(identity, &loaded_order[0]);
        image.state.set(ImageState::Initializing);
        unsafe {
            initfini::run_constructors(&image, is_main)?;
        }
        image.state.set(ImageState::Ready);
    }

    let main_image = loaded_order[0].current_image();
    Ok(EntryPlan {
        entry_point: main_image.addr(main_image.entry),
        stack_pointer_hint: 0, // assigned by the caller once it owns the new stack region
        argv,
        loaded: loaded_order,
    })
}

/// Loads `path` (if not already loaded) and every transitive `DT_NEEDED`
/// dependency reachable from it, appending each newly-or-previously-seen
/// identity to `order` in pre-order (a module before the dependencies it
/// pulls in) and skipping anything already present in `seen`. Shared
/// between the initial-process load path (`prepare`) and `api::Loader::open`
/// (the `dlopen`-equivalent), since both need the same closure discovery.
pub(crate) fn load_closure_recursive(
    loader: &Loader,
    path: &Path,
    order: &mut Vec<Arc<Identity>>,
    seen: &mut HashSet<(u64, u64)>,
) -> Result<()> {
    let identity = loader.chain.intern(path)?;
    if !seen.insert((identity.key.dev, identity.key.ino)) {
        return Ok(());
    }

    if identity.version_count() == 0 {
        let base = crate::loader_lock::choose_base(identity.key.ino);
        let image = Arc::new(Image::load(path, base)?);
        loader.chain.attach(&identity, image);
    }

    order.push(identity.clone());

    let needed: Vec<String> = identity.current_image().needed.clone();
    for name in needed {
        let runpath: Vec<PathBuf> = Vec::new();
        let resolved = loader.resolve_path(&name, &runpath).map_err(|_| LuciError::NotFound {
            what: format!("dependency {name:?} of {:?}", identity.path),
        })?;
        load_closure_recursive(loader, &resolved, order, seen)?;
    }
    Ok(())
}

/// Convenience used by `bin/luci.rs`: opens the target with default
/// (global, eager) flags in the default namespace, driving the same path a
/// `dlopen`-style caller would.
pub fn open_target(loader: &Loader, target: &Path) -> Result<()> {
    loader.open(target, OpenFlags::NOW | OpenFlags::GLOBAL, NamespaceId::DEFAULT)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_plan_fields_are_accessible() {
        let plan = EntryPlan {
            entry_point: 0x401000,
            stack_pointer_hint: 0,
            argv: vec!["prog".to_string()],
            loaded: vec![],
        };
        assert_eq!(plan.entry_point, 0x401000);
        assert_eq!(plan.argv, vec!["prog".to_string()]);
    }
}
