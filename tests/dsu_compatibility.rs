//! Integration coverage for DSU compatibility checking: an update that
//! changes an exported object's size must be rejected.

use goblin::elf::Sym;
use luci::dsu::check_compatibility;
use luci::image::{DynInfo, Image, ImageState, Prot, RelocSet, Segment};
use std::path::PathBuf;

const STB_GLOBAL: u8 = 1;
const STT_OBJECT: u8 = 1;

fn object_image(path: &str, base: usize, strtab: &[u8], name_offset: usize, size: u64) -> Image {
    let sym = Sym {
        st_name: name_offset,
        st_info: (STB_GLOBAL << 4) | STT_OBJECT,
        st_other: 0,
        st_shndx: 1,
        st_value: 0x2000,
        st_size: size,
    };
    Image {
        path: PathBuf::from(path),
        base,
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
    }
}

#[test]
fn size_changed_export_rejects_the_update() {
    let strtab = b"\0state\0";
    let v0 = object_image("/fake/libbaz.so", 0x1000, strtab, 1, 8);
    let v1 = object_image("/fake/libbaz.so", 0x1000, strtab, 1, 16);

    let (findings, accept) = check_compatibility(&v0, &v1, None);
    assert!(!accept, "a size change on a shared STT_OBJECT export must reject the update");
    assert!(findings
        .iter()
        .any(|f| matches!(f, luci::dsu::CompatFinding::SizeMismatch { old_size: 8, new_size: 16, .. })));
}

#[test]
fn unchanged_export_size_is_accepted() {
    let strtab = b"\0state\0";
    let v0 = object_image("/fake/libbaz.so", 0x1000, strtab, 1, 8);
    let v1 = object_image("/fake/libbaz.so", 0x1000, strtab, 1, 8);

    let (findings, accept) = check_compatibility(&v0, &v1, None);
    assert!(accept);
    assert!(findings
        .iter()
        .any(|f| matches!(f, luci::dsu::CompatFinding::Compatible { symbol } if symbol == "state")));
}
