/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Reading of Mach-O files (C1: binary image loader, C2: section registry).
//!
//! Implemented using the `mach_object` crate. All usage of that crate should
//! be confined to this module. The goal, same as before, is to read the
//! Mach-O binary exactly once and store everything later stages need — but
//! this reader now has to serve PPC, PPC64, i386 and x86-64 instead of just
//! ARM, and can no longer assume the file is little-endian.
//!
//! Useful resources:
//! - Apple's [Overview of the Mach-O Executable Format](https://developer.apple.com/library/archive/documentation/Performance/Conceptual/CodeFootprint/Articles/MachOOverview.html) explains what "segments" and "sections" are, and provides short descriptions of the purposes of some common sections.
//! - Apple's old "OS X ABI Mach-O File Format Reference", which is mirrored in [various](https://github.com/aidansteele/osx-abi-macho-file-format-reference) [places](https://www.symbolcrash.com/wp-content/uploads/2019/02/ABI_MachOFormat.pdf) online.
//! - The LLVM functions [`RuntimeDyldMachO::populateIndirectSymbolPointersSection`](https://github.com/llvm/llvm-project/blob/2e999b7dd1934a44d38c3a753460f1e5a217e9a5/llvm/lib/ExecutionEngine/RuntimeDyld/RuntimeDyldMachO.cpp#L179-L220) and [`MachOObjectFile::getIndirectSymbolTableEntry`](https://github.com/llvm/llvm-project/blob/3c09ed006ab35dd8faac03311b14f0857b01949c/llvm/lib/Object/MachOObjectFile.cpp#L4803-L4808) are references for how to read the indirect symbol table.
//! - The [source code of the mach_object crate](https://docs.rs/mach_object/latest/src/mach_object/commands.rs.html) has useful comments that don't show up in the generated documentation, e.g. around `DySymTab`.

use crate::arch::Arch;
use crate::error::{AnnotateError, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use mach_object::{cpu_type_t, LoadCommand, MachCommand, OFile, Symbol, SymbolIter};
use std::io::{Cursor, Seek, SeekFrom};

/// The closed set of section kinds the resolver (C6) knows how to read.
/// Disjoint by construction: [SectionRegistry::register] assigns exactly one
/// kind to a section, from its `(segname, sectname)` pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SectionKind {
    CString,
    PString,
    TextConst,
    CfString,
    Float4,
    Double8,
    DataGeneric,
    DataConst,
    Dyld,
    NonLazySymbol,
    ImportPointer,
    ObjcGeneric,
    ObjcStringObject,
    ObjcClass,
    ObjcModule,
    ObjcClassRef,
    ObjcMsgRef,
    ObjcSelRef,
    ObjcSuperRef,
    ObjcCatList,
    ObjcProtoList,
    ObjcProtoRef,
    /// Registered, but not one of the kinds above — [crate::resolver] always
    /// returns `None` for addresses inside one of these.
    Unrecognized,
}

/// A handle for one section: enough to find its bytes and classify it.
#[derive(Debug, Clone)]
pub struct Section {
    pub segment: String,
    pub name: String,
    pub vm_address: u64,
    pub file_offset: u64,
    pub size: u64,
    pub kind: SectionKind,
    /// True for sections containing machine code (used by function
    /// discovery, C5, to decide which symbols are candidate function
    /// entries).
    pub is_code: bool,
}

impl Section {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.vm_address && addr < self.vm_address + self.size
    }
}

/// Fixed `(segname, sectname) -> kind` table. Lookups are by exact match; the
/// registry enforces at most one handle per `(segment, section)` pair.
const SECTION_KIND_TABLE: &[(&str, &str, SectionKind)] = &[
    ("__TEXT", "__cstring", SectionKind::CString),
    ("__TEXT", "__pstring", SectionKind::PString),
    ("__TEXT", "__const", SectionKind::TextConst),
    ("__TEXT", "__literal4", SectionKind::Float4),
    ("__TEXT", "__literal8", SectionKind::Double8),
    ("__DATA", "__cfstring", SectionKind::CfString),
    ("__DATA", "__const", SectionKind::DataConst),
    ("__DATA", "__data", SectionKind::DataGeneric),
    ("__DATA", "__nl_symbol_ptr", SectionKind::NonLazySymbol),
    ("__DATA", "__la_symbol_ptr", SectionKind::ImportPointer),
    ("__DATA", "__dyld", SectionKind::Dyld),
    ("__OBJC", "__module_info", SectionKind::ObjcModule),
    ("__OBJC", "__class", SectionKind::ObjcClass),
    ("__OBJC", "__meta_class", SectionKind::ObjcClass),
    ("__OBJC", "__cstring", SectionKind::CString),
    ("__OBJC", "__selector_strs", SectionKind::CString),
    ("__OBJC", "__cat_cls_meth", SectionKind::ObjcGeneric),
    ("__OBJC", "__cat_inst_meth", SectionKind::ObjcGeneric),
    ("__OBJC", "__message_refs", SectionKind::ObjcMsgRef),
    ("__DATA", "__objc_classlist", SectionKind::ObjcClassRef),
    ("__DATA", "__objc_classrefs", SectionKind::ObjcClassRef),
    ("__DATA", "__objc_superrefs", SectionKind::ObjcSuperRef),
    ("__DATA", "__objc_selrefs", SectionKind::ObjcSelRef),
    ("__DATA", "__objc_msgrefs", SectionKind::ObjcMsgRef),
    ("__DATA", "__objc_catlist", SectionKind::ObjcCatList),
    ("__DATA", "__objc_protolist", SectionKind::ObjcProtoList),
    ("__DATA", "__objc_protorefs", SectionKind::ObjcProtoRef),
    ("__DATA", "__objc_const", SectionKind::ObjcGeneric),
    ("__DATA", "__objc_data", SectionKind::ObjcGeneric),
];

fn classify_section(segname: &str, sectname: &str) -> SectionKind {
    SECTION_KIND_TABLE
        .iter()
        .find(|(seg, sect, _)| *seg == segname && *sect == sectname)
        .map(|(_, _, kind)| *kind)
        .unwrap_or(SectionKind::Unrecognized)
}

/// Keeps a typed handle for every section the annotator might consult.
/// Overlapping sections are disallowed; missing sections are tolerated, the
/// resolver just returns no hint for them.
#[derive(Debug, Default)]
pub struct SectionRegistry {
    sections: Vec<Section>,
}

impl SectionRegistry {
    pub fn register(&mut self, section: Section) -> Result<()> {
        for existing in &self.sections {
            if existing.segment == section.segment && existing.name == section.name {
                return Err(AnnotateError::format(format!(
                    "duplicate section {},{}",
                    section.segment, section.name
                )));
            }
            let overlaps = section.vm_address < existing.vm_address + existing.size
                && existing.vm_address < section.vm_address + section.size
                && section.size > 0
                && existing.size > 0;
            if overlaps {
                return Err(AnnotateError::format(format!(
                    "section {},{} overlaps {},{}",
                    section.segment, section.name, existing.segment, existing.name
                )));
            }
        }
        self.sections.push(section);
        Ok(())
    }

    pub fn lookup_by_address(&self, addr: u64) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains(addr))
    }

    pub fn by_name(&self, segname: &str, sectname: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.segment == segname && s.name == sectname)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }
}

/// One entry from the symbol table, with fields already normalized to host
/// byte order by the `mach_object` crate.
#[derive(Debug, Clone)]
pub struct SymbolTableEntry {
    pub address: u64,
    pub name: String,
    pub external: bool,
    pub in_code_section: bool,
}

/// A fully-loaded Mach-O image: everything the later stages (C3 onward)
/// need, read exactly once.
pub struct MachO {
    pub name: String,
    pub arch: Arch,
    /// True if the file's own byte order differs from what its architecture
    /// would normally use — i.e. something this crate must byte-swap by hand
    /// whenever it reads a raw struct the `mach_object` crate doesn't already
    /// normalize (the Objective-C metadata, see `crate::objc`).
    pub is_swapped: bool,
    pub sections: SectionRegistry,
    /// Symbols sorted by address, for binary search.
    pub symbols: Vec<SymbolTableEntry>,
    pub dynamic_libraries: Vec<String>,
    pub entry_point: Option<u64>,
    /// Symbol names for each slot in a `__la_symbol_ptr`/`__nl_symbol_ptr`
    /// section, keyed by the slot's virtual address, resolved through the
    /// indirect symbol table.
    pub indirect_symbol_names: std::collections::HashMap<u64, String>,
    bytes: Vec<u8>,
}

fn cputype_matches(arch: Arch, cputype: cpu_type_t) -> bool {
    use mach_object::{CPU_TYPE_I386, CPU_TYPE_POWERPC, CPU_TYPE_POWERPC64, CPU_TYPE_X86_64};
    match arch {
        Arch::Ppc => cputype == CPU_TYPE_POWERPC,
        Arch::Ppc64 => cputype == CPU_TYPE_POWERPC64,
        Arch::I386 => cputype == CPU_TYPE_I386,
        Arch::X86_64 => cputype == CPU_TYPE_X86_64,
    }
}

impl MachO {
    /// Load a Mach-O image (or, for a fat binary, the slice matching `arch`)
    /// from `bytes`.
    pub fn load_from_bytes(bytes: &[u8], arch: Arch, name: String) -> Result<MachO> {
        log_dbg!("Reading {:?} for {}", name, arch);

        let mut cursor = Cursor::new(bytes);
        let file = OFile::parse(&mut cursor)
            .map_err(|e| AnnotateError::format(format!("could not parse Mach-O file: {e}")))?;

        let (header, commands) = match file {
            OFile::MachFile { header, commands } => (header, commands),
            OFile::FatFile { files, .. } => {
                let slice = files
                    .iter()
                    .find(|(fat_arch, _)| cputype_matches(arch, fat_arch.cputype))
                    .map(|(fat_arch, _)| {
                        &bytes[fat_arch.offset as usize..][..fat_arch.size as usize]
                    });
                return match slice {
                    Some(slice) => MachO::load_from_bytes(slice, arch, name),
                    None => Err(AnnotateError::unsupported(format!(
                        "no {} slice in fat binary",
                        arch
                    ))),
                };
            }
            OFile::ArFile { .. } | OFile::SymDef { .. } => {
                return Err(AnnotateError::format(
                    "not an executable Mach-O file".to_string(),
                ));
            }
        };

        if !cputype_matches(arch, header.cputype) {
            return Err(AnnotateError::unsupported(format!(
                "image is not a {} binary",
                arch
            )));
        }
        log!("Loading {} slice for {:?}", arch, name);

        let is_swapped = header.is_bigend() != arch.is_bigend();
        let is_64bit = header.is_64bit();
        if is_64bit != arch.is_64bit() {
            return Err(AnnotateError::format(
                "header word size disagrees with architecture selector".to_string(),
            ));
        }

        let mut sections = SectionRegistry::default();
        let mut symbol_table_info: Option<(u32, u32, u32, u32)> = None;
        let mut dysymtab_info: Option<(u32, u32)> = None;
        let mut dynamic_libraries = Vec::new();
        let mut entry_point = None;
        let mut text_segment_base = None;
        let mut all_raw_sections = Vec::new();
        let mut indirect_sections = Vec::new();

        for MachCommand(command, _size) in &commands {
            match command {
                LoadCommand::Segment {
                    segname,
                    vmaddr,
                    fileoff,
                    sections: segment_sections,
                    ..
                } => {
                    if segname == "__TEXT" {
                        text_segment_base = Some(*vmaddr);
                    }
                    for section in segment_sections {
                        let is_code = segname == "__TEXT"
                            && (section.sectname == "__text"
                                || section.sectname == "__textcoal_nt");
                        let kind = classify_section(segname, &section.sectname);
                        if matches!(kind, SectionKind::ImportPointer | SectionKind::NonLazySymbol) {
                            indirect_sections.push((section.addr, section.size, section.reserved1));
                        }
                        sections.register(Section {
                            segment: segname.clone(),
                            name: section.sectname.clone(),
                            vm_address: section.addr,
                            file_offset: *fileoff + (section.addr - vmaddr),
                            size: section.size,
                            kind,
                            is_code,
                        })?;
                    }
                    all_raw_sections.extend(segment_sections.iter().cloned());
                }
                LoadCommand::SymTab {
                    symoff,
                    nsyms,
                    stroff,
                    strsize,
                } => {
                    symbol_table_info = Some((*symoff, *nsyms, *stroff, *strsize));
                }
                LoadCommand::DySymTab {
                    indirectsymoff,
                    nindirectsyms,
                    ..
                } => {
                    dysymtab_info = Some((*indirectsymoff, *nindirectsyms));
                }
                LoadCommand::LoadDyLib(dylib) => {
                    dynamic_libraries.push(dylib.name.to_string());
                }
                LoadCommand::UnixThread { entry, .. } => {
                    entry_point = Some(*entry);
                }
                LoadCommand::EntryPoint { entryoff, .. } => {
                    if let Some(base) = text_segment_base {
                        entry_point = Some(base + entryoff);
                    }
                }
                LoadCommand::EncryptionInfo { id, .. } => {
                    if *id != 0 {
                        return Err(AnnotateError::format(
                            "the executable is encrypted".to_string(),
                        ));
                    }
                }
                _ => (),
            }
        }

        let mut symbol_entries = Vec::new();
        let mut all_symbols_in_order: Vec<Option<String>> = Vec::new();
        if let Some((symoff, nsyms, stroff, strsize)) = symbol_table_info {
            let mut cursor = Cursor::new(bytes);
            if cursor.seek(SeekFrom::Start(symoff as u64)).is_ok() {
                let iter = SymbolIter::new(
                    &mut cursor,
                    all_raw_sections.clone(),
                    nsyms,
                    stroff,
                    strsize,
                    header.is_bigend(),
                    is_64bit,
                );
                for symbol in iter {
                    match &symbol {
                        Symbol::Defined {
                            name: Some(name),
                            external,
                            entry,
                            sect,
                            ..
                        } => {
                            let address: u64 = (*entry).try_into().unwrap_or(0);
                            let in_code_section = sections
                                .iter()
                                .enumerate()
                                .any(|(idx, s)| (idx + 1) as u8 == *sect && s.is_code);
                            symbol_entries.push(SymbolTableEntry {
                                address,
                                name: name.to_string(),
                                external: *external,
                                in_code_section,
                            });
                        }
                        _ => (),
                    }
                    all_symbols_in_order.push(match &symbol {
                        Symbol::Undefined { name: Some(n), .. } => Some(n.to_string()),
                        Symbol::Prebound { name: Some(n), .. } => Some(n.to_string()),
                        Symbol::Defined { name: Some(n), .. } => Some(n.to_string()),
                        _ => None,
                    });
                }
            }
        }
        symbol_entries.sort_by_key(|s| s.address);

        // The indirect symbol table maps each slot in a lazy/non-lazy symbol
        // pointer section back to a symbol table index; read it the same
        // way touchHLE's own (ARM/LE-only) reader does, generalized with
        // explicit endianness.
        let mut indirect_symbol_names = std::collections::HashMap::new();
        if let Some((indirectsymoff, nindirectsyms)) = dysymtab_info {
            let table_bytes = bytes
                .get(indirectsymoff as usize..)
                .and_then(|b| b.get(..nindirectsyms as usize * 4));
            if let Some(table_bytes) = table_bytes {
                let indices: Vec<u32> = table_bytes
                    .chunks_exact(4)
                    .map(|c| {
                        if header.is_bigend() {
                            BigEndian::read_u32(c)
                        } else {
                            LittleEndian::read_u32(c)
                        }
                    })
                    .collect();
                for (vm_address, size, reserved1) in indirect_sections {
                    let word = arch.word_size() as u64;
                    let count = size / word;
                    for i in 0..count {
                        let table_idx = reserved1 as usize + i as usize;
                        if let Some(Some(name)) =
                            indices.get(table_idx).and_then(|&symidx| {
                                all_symbols_in_order.get(symidx as usize)
                            })
                        {
                            indirect_symbol_names.insert(vm_address + i * word, name.clone());
                        }
                    }
                }
            }
        }

        Ok(MachO {
            name,
            arch,
            is_swapped,
            sections,
            symbols: symbol_entries,
            dynamic_libraries,
            entry_point,
            indirect_symbol_names,
            bytes: bytes.to_vec(),
        })
    }

    pub fn is_bigend(&self) -> bool {
        self.arch.is_bigend()
    }

    pub fn addr_to_file_offset(&self, addr: u64) -> Option<u64> {
        self.sections
            .lookup_by_address(addr)
            .map(|s| s.file_offset + (addr - s.vm_address))
    }

    /// Read `len` bytes starting at virtual address `addr`, if it falls
    /// entirely within a registered section.
    pub fn bytes_at(&self, addr: u64, len: u64) -> Option<&[u8]> {
        let section = self.sections.lookup_by_address(addr)?;
        if addr + len > section.vm_address + section.size {
            return None;
        }
        let off = (section.file_offset + (addr - section.vm_address)) as usize;
        self.bytes.get(off..off + len as usize)
    }

    pub fn read_u8(&self, addr: u64) -> Option<u8> {
        self.bytes_at(addr, 1).map(|b| b[0])
    }

    pub fn read_u16(&self, addr: u64) -> Option<u16> {
        let bytes = self.bytes_at(addr, 2)?;
        Some(if self.is_bigend() {
            BigEndian::read_u16(bytes)
        } else {
            LittleEndian::read_u16(bytes)
        })
    }

    pub fn read_u32(&self, addr: u64) -> Option<u32> {
        let bytes = self.bytes_at(addr, 4)?;
        Some(if self.is_bigend() {
            BigEndian::read_u32(bytes)
        } else {
            LittleEndian::read_u32(bytes)
        })
    }

    pub fn read_u64(&self, addr: u64) -> Option<u64> {
        let bytes = self.bytes_at(addr, 8)?;
        Some(if self.is_bigend() {
            BigEndian::read_u64(bytes)
        } else {
            LittleEndian::read_u64(bytes)
        })
    }

    pub fn read_f32(&self, addr: u64) -> Option<f32> {
        let bytes = self.bytes_at(addr, 4)?;
        Some(if self.is_bigend() {
            BigEndian::read_f32(bytes)
        } else {
            LittleEndian::read_f32(bytes)
        })
    }

    pub fn read_f64(&self, addr: u64) -> Option<f64> {
        let bytes = self.bytes_at(addr, 8)?;
        Some(if self.is_bigend() {
            BigEndian::read_f64(bytes)
        } else {
            LittleEndian::read_f64(bytes)
        })
    }

    /// Read a word: 32 bits on the 32-bit architectures, 64 bits on the
    /// 64-bit ones, zero-extended to `u64` either way.
    pub fn read_word(&self, addr: u64) -> Option<u64> {
        if self.arch.is_64bit() {
            self.read_u64(addr)
        } else {
            self.read_u32(addr).map(u64::from)
        }
    }

    /// Read a NUL-terminated C string starting at `addr`.
    pub fn cstr_at(&self, addr: u64) -> Option<String> {
        let section = self.sections.lookup_by_address(addr)?;
        let start = (section.file_offset + (addr - section.vm_address)) as usize;
        let end_of_section = (section.file_offset + section.size) as usize;
        let slice = self
            .bytes
            .get(start..end_of_section.min(self.bytes.len()))?;
        let nul = slice.iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&slice[..nul]).into_owned())
    }

    pub fn function_symbol_at(&self, addr: u64) -> Option<&SymbolTableEntry> {
        self.symbols
            .binary_search_by_key(&addr, |s| s.address)
            .ok()
            .map(|idx| &self.symbols[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(
        segment: &str,
        name: &str,
        vm_address: u64,
        size: u64,
        kind: SectionKind,
    ) -> Section {
        Section {
            segment: segment.to_string(),
            name: name.to_string(),
            vm_address,
            file_offset: 0,
            size,
            kind,
            is_code: false,
        }
    }

    #[test]
    fn registry_rejects_overlap() {
        let mut reg = SectionRegistry::default();
        reg.register(section(
            "__TEXT",
            "__text",
            0x1000,
            0x100,
            SectionKind::Unrecognized,
        ))
        .unwrap();
        let err = reg
            .register(section(
                "__TEXT",
                "__other",
                0x1080,
                0x100,
                SectionKind::Unrecognized,
            ))
            .unwrap_err();
        assert!(matches!(err, AnnotateError::Format(_)));
    }

    #[test]
    fn registry_lookup_by_address() {
        let mut reg = SectionRegistry::default();
        reg.register(section(
            "__TEXT",
            "__cstring",
            0x2000,
            0x40,
            SectionKind::CString,
        ))
        .unwrap();
        let found = reg.lookup_by_address(0x2010).unwrap();
        assert_eq!(found.kind, SectionKind::CString);
        assert!(reg.lookup_by_address(0x3000).is_none());
    }

    #[test]
    fn classify_known_and_unknown_sections() {
        assert_eq!(classify_section("__TEXT", "__cstring"), SectionKind::CString);
        assert_eq!(
            classify_section("__DATA", "__objc_classlist"),
            SectionKind::ObjcClassRef
        );
        assert_eq!(
            classify_section("__TEXT", "__made_up"),
            SectionKind::Unrecognized
        );
    }
}
