//! Integration coverage for symbol-scope precedence: global-vs-local
//! visibility and `STB_GNU_UNIQUE` first-definition-wins semantics, built
//! against hand-assembled images so the test doesn't depend on a real
//! toolchain-produced `.so`.

use goblin::elf::Sym;
use luci::identity::{FileKey, Identity, LinkMapRecord};
use luci::image::{DynInfo, Image, ImageState, Prot, RelocSet, Segment};
use luci::resolver::{lookup, LookupFlags, Resolution, ResolutionCache, Scope, ScopeMode, UniqueSymbols};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

const STB_GLOBAL: u8 = 1;
const STB_WEAK: u8 = 2;
const STB_GNU_UNIQUE: u8 = 10;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;

fn st_info(bind: u8, ty: u8) -> u8 {
    (bind << 4) | (ty & 0xf)
}

/// Builds a one-symbol image whose dynamic string table is `strtab` and
/// whose sole export is named at `name_offset` within it.
fn build_image(
    ino: u64,
    strtab: &[u8],
    name_offset: usize,
    st_value: u64,
    bind: u8,
    ty: u8,
) -> Arc<Identity> {
    let sym = Sym {
        st_name: name_offset,
        st_info: st_info(bind, ty),
        st_other: 0,
        st_shndx: 1,
        st_value,
        st_size: 8,
    };
    let image = Image {
        path: PathBuf::from(format!("/fake/lib{ino}.so")),
        base: 0x1000 * ino as usize,
        segments: vec![Segment {
            offset: 0,
            vaddr: 0,
            filesz: strtab.len() as u64,
            memsz: strtab.len() as u64,
            prot: Prot::READ,
        }],
        relro: None,
        program_headers: vec![],
        dyn_info: DynInfo {
            strtab_off: Some(0),
            ..Default::default()
        },
        symtab: vec![sym],
        file_bytes: strtab.to_vec(),
        relocs: RelocSet::default(),
        tls: None,
        needed: vec![],
        soname: None,
        state: luci::image::AtomicImageState::new(ImageState::Ready),
        fd: None,
        is_pie: true,
        entry: 0,
        versym: vec![],
        verdef_names: std::collections::HashMap::new(),
        verneed_names: std::collections::HashMap::new(),
    };
    Arc::new(Identity {
        key: FileKey { dev: 0, ino },
        path: image.path.clone(),
        versions: RwLock::new(vec![Arc::new(image)]),
        current: Mutex::new(0),
        link_map: Mutex::new(LinkMapRecord::default()),
    })
}

#[test]
fn global_definition_wins_over_a_handle_scoped_to_local() {
    // libone.so (GLOBAL) and libtwo.so (LOCAL) both define `_delta`.
    let strtab = b"\0_delta\0";
    let one = build_image(1, strtab, 1, 0x100, STB_GLOBAL, STT_OBJECT);
    let two = build_image(2, strtab, 1, 0x200, STB_GLOBAL, STT_OBJECT);

    let mut default_scope = Scope::new();
    default_scope.push(one.clone(), ScopeMode::Global);

    let cache = ResolutionCache::new();
    let unique = UniqueSymbols::new();
    let requester = one.current_image();

    let res = lookup(
        &default_scope,
        &requester,
        "_delta",
        None,
        LookupFlags::WEAK_OK,
        &cache,
        &unique,
    )
    .unwrap();
    assert!(Arc::ptr_eq(&res.identity, &one));
    assert_eq!(res.value, one.current_image().addr(0x100));

    // A handle opened directly on libtwo.so (LOCAL to that handle) still
    // resolves to libtwo.so's own definition.
    let mut h2_scope = Scope::new();
    h2_scope.push(two.clone(), ScopeMode::Local);
    let res2 = lookup(
        &h2_scope,
        &two.current_image(),
        "_delta",
        None,
        LookupFlags::WEAK_OK,
        &cache,
        &unique,
    )
    .unwrap();
    assert!(Arc::ptr_eq(&res2.identity, &two));
    assert_eq!(res2.value, two.current_image().addr(0x200));
}

#[test]
fn unique_symbol_first_definition_wins_regardless_of_load_order() {
    let strtab = b"\0U\0";
    let liba = build_image(10, strtab, 1, 0xa000, STB_GNU_UNIQUE, STT_FUNC);
    let libb = build_image(11, strtab, 1, 0xb000, STB_GNU_UNIQUE, STT_FUNC);

    let unique = UniqueSymbols::new();
    let cache_a = ResolutionCache::new();
    let cache_b = ResolutionCache::new();

    let mut scope_a = Scope::new();
    scope_a.push(liba.clone(), ScopeMode::Global);
    let res_a = lookup(&scope_a, &liba.current_image(), "U", None, LookupFlags::WEAK_OK, &cache_a, &unique).unwrap();
    assert!(Arc::ptr_eq(&res_a.identity, &liba));

    // libb.so is loaded second and also defines U; the unique registry must
    // still hand back liba.so's definition, even from a scope that only
    // contains libb.so.
    let mut scope_b = Scope::new();
    scope_b.push(libb.clone(), ScopeMode::Global);
    let res_b = lookup(&scope_b, &libb.current_image(), "U", None, LookupFlags::WEAK_OK, &cache_b, &unique).unwrap();
    assert!(Arc::ptr_eq(&res_b.identity, &liba));
    assert_eq!(res_b.value, res_a.value);
}

#[test]
fn weak_definition_only_used_when_no_strong_definition_exists() {
    let strtab = b"\0maybe_sym\0";
    let weak_only = build_image(20, strtab, 1, 0xc000, STB_WEAK, STT_FUNC);

    let mut scope = Scope::new();
    scope.push(weak_only.clone(), ScopeMode::Global);
    let cache = ResolutionCache::new();
    let unique = UniqueSymbols::new();

    // Without WEAK_OK, a weak-only definition must not satisfy the lookup.
    let err = lookup(
        &scope,
        &weak_only.current_image(),
        "maybe_sym",
        None,
        LookupFlags::empty(),
        &cache,
        &unique,
    )
    .unwrap_err();
    assert!(matches!(err, luci::errors::LuciError::NotFound { .. }));

    // With WEAK_OK, the weak definition resolves.
    let res: Resolution = lookup(
        &scope,
        &weak_only.current_image(),
        "maybe_sym",
        None,
        LookupFlags::WEAK_OK,
        &cache,
        &unique,
    )
    .unwrap();
    assert_eq!(res.value, weak_only.current_image().addr(0xc000));
}
