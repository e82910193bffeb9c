/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Reading of Objective-C class, category, ivar and method metadata straight
//! out of an image's `__OBJC`/`__DATA` sections (C3: Objective-C catalog).
//!
//! Two on-disk formats are supported, matching `examples/original_source/src/source/ObjcTypes.h`:
//! the "v1" format (`objc1_32_*`/`objc1_64_*`: module/symtab/class/category/
//! method_list/ivar_list, with a sentinel-terminated method list) used by
//! older toolchains, and the "v2" format (`class_t`/`class_ro_t`/
//! `method_list_t`/`ivar_list_t`) used by everything built against the
//! modern runtime. Both exist in 32- and 64-bit variants; the 64-bit v2
//! layout has two fields that are full pointer/word width purely by
//! historical accident rather than because they need the range: `ivar_t`'s
//! `offset` is a *pointer to* an `int32_t` rather than the offset itself, and
//! `protocol_list_t`'s `count` is a full `uintptr_t`. See [read_class_v2].
//!
//! Note that metaclasses are just a special case of classes: a class's `isa`
//! points at its metaclass, which holds the class (not instance) methods.

use super::methods::{sort_methods_by_imp, IvarInfo, MethodInfo};
use crate::error::{AnnotateError, Result};
use crate::mach_o::MachO;

/// One class or metaclass, with its ivars and methods already flattened out
/// of whatever on-disk shape they were stored in.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub name: String,
    pub address: u64,
    pub is_metaclass: bool,
    pub superclass_name: Option<String>,
    pub ivars: Vec<IvarInfo>,
    pub methods: Vec<MethodInfo>,
}

/// A category: methods and (for v2) properties/protocols attached to an
/// existing class without subclassing it. The annotator only needs enough
/// to extend the owning class's method set.
#[derive(Debug, Clone)]
pub struct CategoryInfo {
    pub name: String,
    pub class_name: String,
    pub methods: Vec<MethodInfo>,
}

fn read_method_list(image: &MachO, addr: u64, is_class_method: bool) -> Result<Vec<MethodInfo>> {
    if addr == 0 {
        return Ok(Vec::new());
    }
    let entsize = image
        .read_u32(addr)
        .ok_or_else(|| AnnotateError::format("truncated method_list_t"))?;
    let count = image
        .read_u32(addr + 4)
        .ok_or_else(|| AnnotateError::format("truncated method_list_t"))?;
    // The low two bits of entsize carry "relative/small method list" flags
    // in newer runtimes; every target architecture this crate supports
    // predates that encoding, so they're expected to be zero, but mask them
    // off rather than trip over a flag we don't otherwise care about.
    let entry_size = (entsize & !0b11).max(image.arch.word_size() as u32 * 3) as u64;
    let mut methods = Vec::with_capacity(count as usize);
    let mut entry = addr + 8;
    for _ in 0..count {
        let word = image.arch.word_size() as u64;
        let sel_addr = image
            .read_word(entry)
            .ok_or_else(|| AnnotateError::format("truncated method_t"))?;
        let types_addr = image
            .read_word(entry + word)
            .ok_or_else(|| AnnotateError::format("truncated method_t"))?;
        let imp = image
            .read_word(entry + 2 * word)
            .ok_or_else(|| AnnotateError::format("truncated method_t"))?;
        let selector = image.cstr_at(sel_addr).unwrap_or_default();
        let type_encoding = image.cstr_at(types_addr).unwrap_or_default();
        methods.push(MethodInfo {
            selector,
            type_encoding,
            imp,
            is_class_method,
        });
        entry += entry_size;
    }
    Ok(methods)
}

fn read_ivar_list_v2(image: &MachO, addr: u64) -> Result<Vec<IvarInfo>> {
    if addr == 0 {
        return Ok(Vec::new());
    }
    let entsize = image
        .read_u32(addr)
        .ok_or_else(|| AnnotateError::format("truncated ivar_list_t"))? as u64;
    let count = image
        .read_u32(addr + 4)
        .ok_or_else(|| AnnotateError::format("truncated ivar_list_t"))?;
    let word = image.arch.word_size() as u64;
    let mut ivars = Vec::with_capacity(count as usize);
    let mut entry = addr + 8;
    for _ in 0..count {
        // ivar_t.offset is a pointer to the actual `int32_t` offset, not the
        // offset value itself -- "64-bit by accident", see module docs.
        let offset_ptr = image
            .read_word(entry)
            .ok_or_else(|| AnnotateError::format("truncated ivar_t"))?;
        let name_addr = image
            .read_word(entry + word)
            .ok_or_else(|| AnnotateError::format("truncated ivar_t"))?;
        let type_addr = image
            .read_word(entry + 2 * word)
            .ok_or_else(|| AnnotateError::format("truncated ivar_t"))?;
        let offset = image.read_u32(offset_ptr).unwrap_or(0) as u64;
        ivars.push(IvarInfo {
            name: image.cstr_at(name_addr).unwrap_or_default(),
            type_encoding: image.cstr_at(type_addr).unwrap_or_default(),
            offset,
        });
        entry += entsize;
    }
    Ok(ivars)
}

/// `class_ro_t` field offsets. `instanceStart`/`instanceSize` stay 32-bit
/// even in the 64-bit layout, and 64-bit inserts a 4-byte `reserved` pad
/// before the pointer fields begin (which are then word-aligned).
struct ClassRoLayout {
    name: u64,
    base_methods: u64,
    ivars: u64,
}

fn class_ro_layout(word: u64) -> ClassRoLayout {
    if word == 8 {
        ClassRoLayout {
            name: 24,
            base_methods: 32,
            ivars: 48,
        }
    } else {
        ClassRoLayout {
            name: 16,
            base_methods: 20,
            ivars: 28,
        }
    }
}

/// Read one `class_t` (v2 format) at `addr`, plus its metaclass if
/// `include_metaclass` is set (the metaclass is itself a `class_t`, pointed
/// to by the class's `isa`).
fn read_class_v2(image: &MachO, addr: u64, is_metaclass: bool) -> Result<ClassInfo> {
    let word = image.arch.word_size() as u64;
    // class_t: isa, superclass, cache, vtable, then data (class_ro_t*, low
    // bits may carry Swift-stability flags we don't expect to see here).
    let superclass_addr = image
        .read_word(addr + word)
        .ok_or_else(|| AnnotateError::format("truncated class_t"))?;
    let data_field = image
        .read_word(addr + 4 * word)
        .ok_or_else(|| AnnotateError::format("truncated class_t"))?;
    let ro_addr = data_field & !0b111;

    let layout = class_ro_layout(word);
    let name_addr = image
        .read_word(ro_addr + layout.name)
        .ok_or_else(|| AnnotateError::format("truncated class_ro_t"))?;
    let methods_addr = image
        .read_word(ro_addr + layout.base_methods)
        .ok_or_else(|| AnnotateError::format("truncated class_ro_t"))?;
    let ivars_addr = image
        .read_word(ro_addr + layout.ivars)
        .ok_or_else(|| AnnotateError::format("truncated class_ro_t"))?;

    let name = image
        .cstr_at(name_addr)
        .ok_or_else(|| AnnotateError::format("class name pointer out of range"))?;
    let mut methods = read_method_list(image, methods_addr, is_metaclass)?;
    sort_methods_by_imp(&mut methods);
    let ivars = if is_metaclass {
        Vec::new()
    } else {
        read_ivar_list_v2(image, ivars_addr)?
    };

    let superclass_name = if superclass_addr == 0 {
        None
    } else {
        read_class_v2(image, superclass_addr, is_metaclass)
            .ok()
            .map(|c| c.name)
    };

    Ok(ClassInfo {
        name,
        address: addr,
        is_metaclass,
        superclass_name,
        ivars,
        methods,
    })
}

/// Read the whole v2 catalog, walking `__DATA,__objc_classlist` (class
/// pointers) and `__DATA,__objc_catlist` (category pointers).
pub fn load_v2(image: &MachO) -> Result<(Vec<ClassInfo>, Vec<CategoryInfo>)> {
    let word = image.arch.word_size() as u64;
    let mut classes = Vec::new();

    if let Some(section) = image.sections.by_name("__DATA", "__objc_classlist") {
        let count = section.size / word;
        for i in 0..count {
            let class_ptr_addr = section.vm_address + i * word;
            let Some(class_addr) = image.read_word(class_ptr_addr) else {
                continue;
            };
            match read_class_v2(image, class_addr, false) {
                Ok(class_info) => classes.push(class_info),
                Err(e) => log!("skipping unreadable class at {:#x}: {}", class_addr, e),
            }
            let isa = image.read_word(class_addr).unwrap_or(0);
            if isa != 0 {
                if let Ok(meta) = read_class_v2(image, isa, true) {
                    classes.push(meta);
                }
            }
        }
    }

    let mut categories = Vec::new();
    if let Some(section) = image.sections.by_name("__DATA", "__objc_catlist") {
        let count = section.size / word;
        for i in 0..count {
            let cat_ptr_addr = section.vm_address + i * word;
            let Some(cat_addr) = image.read_word(cat_ptr_addr) else {
                continue;
            };
            match read_category_v2(image, cat_addr) {
                Ok(cat) => categories.push(cat),
                Err(e) => log!("skipping unreadable category at {:#x}: {}", cat_addr, e),
            }
        }
    }

    Ok((classes, categories))
}

fn read_category_v2(image: &MachO, addr: u64) -> Result<CategoryInfo> {
    let word = image.arch.word_size() as u64;
    // category_t: name, cls, instanceMethods, classMethods, protocols, properties
    let name_addr = image
        .read_word(addr)
        .ok_or_else(|| AnnotateError::format("truncated category_t"))?;
    let class_addr = image
        .read_word(addr + word)
        .ok_or_else(|| AnnotateError::format("truncated category_t"))?;
    let instance_methods_addr = image
        .read_word(addr + 2 * word)
        .ok_or_else(|| AnnotateError::format("truncated category_t"))?;
    let class_methods_addr = image
        .read_word(addr + 3 * word)
        .ok_or_else(|| AnnotateError::format("truncated category_t"))?;

    let name = image.cstr_at(name_addr).unwrap_or_default();
    let class_name = if class_addr != 0 {
        read_class_v2(image, class_addr, false)
            .map(|c| c.name)
            .unwrap_or_default()
    } else {
        String::new()
    };
    let mut methods = read_method_list(image, instance_methods_addr, false)?;
    methods.extend(read_method_list(image, class_methods_addr, true)?);
    sort_methods_by_imp(&mut methods);

    Ok(CategoryInfo {
        name,
        class_name,
        methods,
    })
}

/// Read one v1-format class (`objc1_32_class`/`objc1_64_class`) at `addr`.
/// v1 classes are 32-bit only in every binary this crate has been observed
/// to annotate, but the on-disk layout scales cleanly to a 64-bit pointer
/// width so the word size is still taken from `image.arch`.
fn read_class_v1(image: &MachO, addr: u64, is_metaclass: bool) -> Result<ClassInfo> {
    let word = image.arch.word_size() as u64;
    // objc1_32_class: isa, super_class, name, version, info, instance_size,
    // ivars, methodLists, cache, protocols.
    let superclass_addr = image
        .read_word(addr + word)
        .ok_or_else(|| AnnotateError::format("truncated objc1 class"))?;
    let name_addr = image
        .read_word(addr + 2 * word)
        .ok_or_else(|| AnnotateError::format("truncated objc1 class"))?;
    let ivars_addr = image
        .read_word(addr + 6 * word)
        .ok_or_else(|| AnnotateError::format("truncated objc1 class"))?;
    let method_lists_addr = image
        .read_word(addr + 7 * word)
        .ok_or_else(|| AnnotateError::format("truncated objc1 class"))?;

    let name = image
        .cstr_at(name_addr)
        .ok_or_else(|| AnnotateError::format("class name pointer out of range"))?;

    // methodLists points directly at a single objc1_32_method_list for
    // statically-linked classes (the common case); the indirect
    // array-of-lists form (used when CLS_NO_METHOD_ARRAY is clear) is not
    // produced by any toolchain this crate targets and is left unhandled.
    let methods = if method_lists_addr != 0 {
        read_method_list_v1(image, method_lists_addr, is_metaclass).unwrap_or_default()
    } else {
        Vec::new()
    };
    let ivars = if is_metaclass {
        Vec::new()
    } else {
        read_ivar_list_v1(image, ivars_addr).unwrap_or_default()
    };

    let superclass_name = if superclass_addr == 0 {
        None
    } else {
        read_class_v1(image, superclass_addr, is_metaclass)
            .ok()
            .map(|c| c.name)
    };

    let mut methods = methods;
    sort_methods_by_imp(&mut methods);

    Ok(ClassInfo {
        name,
        address: addr,
        is_metaclass,
        superclass_name,
        ivars,
        methods,
    })
}

/// The v1 method-list sentinel: a `method_count` of `0xffffffff` means this
/// is not a real list (the `obsolete` field has been repurposed), and
/// parsing stops without treating it as malformed input.
const V1_METHOD_LIST_SENTINEL: u32 = 0xffff_ffff;

fn read_method_list_v1(
    image: &MachO,
    addr: u64,
    is_class_method: bool,
) -> Result<Vec<MethodInfo>> {
    let word = image.arch.word_size() as u64;
    let method_count = image
        .read_u32(addr + word)
        .ok_or_else(|| AnnotateError::format("truncated objc1 method_list"))?;
    if method_count == V1_METHOD_LIST_SENTINEL {
        return Ok(Vec::new());
    }
    let mut methods = Vec::with_capacity(method_count as usize);
    let mut entry = addr + word + 4;
    for _ in 0..method_count {
        let sel_addr = image
            .read_word(entry)
            .ok_or_else(|| AnnotateError::format("truncated objc1 method"))?;
        let types_addr = image
            .read_word(entry + word)
            .ok_or_else(|| AnnotateError::format("truncated objc1 method"))?;
        let imp = image
            .read_word(entry + 2 * word)
            .ok_or_else(|| AnnotateError::format("truncated objc1 method"))?;
        methods.push(MethodInfo {
            selector: image.cstr_at(sel_addr).unwrap_or_default(),
            type_encoding: image.cstr_at(types_addr).unwrap_or_default(),
            imp,
            is_class_method,
        });
        entry += 3 * word;
    }
    Ok(methods)
}

fn read_ivar_list_v1(image: &MachO, addr: u64) -> Result<Vec<IvarInfo>> {
    if addr == 0 {
        return Ok(Vec::new());
    }
    let word = image.arch.word_size() as u64;
    let ivar_count = image
        .read_u32(addr)
        .ok_or_else(|| AnnotateError::format("truncated objc1 ivar_list"))?;
    let mut ivars = Vec::with_capacity(ivar_count as usize);
    let mut entry = addr + 4;
    for _ in 0..ivar_count {
        let name_addr = image
            .read_word(entry)
            .ok_or_else(|| AnnotateError::format("truncated objc1 ivar"))?;
        let type_addr = image
            .read_word(entry + word)
            .ok_or_else(|| AnnotateError::format("truncated objc1 ivar"))?;
        // Unlike v2, the v1 ivar offset is the value itself, not a pointer
        // to it.
        let offset = image.read_u32(entry + 2 * word).unwrap_or(0) as u64;
        ivars.push(IvarInfo {
            name: image.cstr_at(name_addr).unwrap_or_default(),
            type_encoding: image.cstr_at(type_addr).unwrap_or_default(),
            offset,
        });
        entry += 2 * word + 4;
    }
    Ok(ivars)
}

/// Read the whole v1 catalog via the module table
/// (`__OBJC,__module_info` -> `objc1_32_module` -> `objc1_32_symtab`, which
/// lists the image's classes and categories).
pub fn load_v1(image: &MachO) -> Result<(Vec<ClassInfo>, Vec<CategoryInfo>)> {
    let word = image.arch.word_size() as u64;
    let Some(section) = image.sections.by_name("__OBJC", "__module_info") else {
        return Ok((Vec::new(), Vec::new()));
    };

    let mut classes = Vec::new();
    let mut categories = Vec::new();

    let module_size = 2 * word + 2 * word; // version, size, name, symtab
    let module_count = section.size / module_size;
    for m in 0..module_count {
        let module_addr = section.vm_address + m * module_size;
        let symtab_addr = image
            .read_word(module_addr + 3 * word)
            .ok_or_else(|| AnnotateError::format("truncated objc1 module"))?;
        if symtab_addr == 0 {
            continue;
        }
        // objc1_32_symtab: sel_ref_cnt(word), refs(ptr), cls_def_cnt(u16),
        // cat_def_cnt(u16), defs[]
        let cls_def_cnt = image
            .read_u16(symtab_addr + 2 * word)
            .ok_or_else(|| AnnotateError::format("truncated objc1 symtab"))?;
        let cat_def_cnt = image
            .read_u16(symtab_addr + 2 * word + 2)
            .ok_or_else(|| AnnotateError::format("truncated objc1 symtab"))?;
        let defs_base = symtab_addr + 2 * word + 4;

        for i in 0..cls_def_cnt as u64 {
            if let Some(class_addr) = image.read_word(defs_base + i * word) {
                if let Ok(class_info) = read_class_v1(image, class_addr, false) {
                    let isa = image.read_word(class_addr).unwrap_or(0);
                    if isa != 0 {
                        if let Ok(meta) = read_class_v1(image, isa, true) {
                            classes.push(meta);
                        }
                    }
                    classes.push(class_info);
                }
            }
        }
        for i in 0..cat_def_cnt as u64 {
            let cat_addr_slot = defs_base + (cls_def_cnt as u64 + i) * word;
            if let Some(cat_addr) = image.read_word(cat_addr_slot) {
                if let Ok(cat) = read_category_v1(image, cat_addr) {
                    categories.push(cat);
                }
            }
        }
    }

    Ok((classes, categories))
}

fn read_category_v1(image: &MachO, addr: u64) -> Result<CategoryInfo> {
    let word = image.arch.word_size() as u64;
    let cat_name_addr = image
        .read_word(addr)
        .ok_or_else(|| AnnotateError::format("truncated objc1 category"))?;
    let class_name_addr = image
        .read_word(addr + word)
        .ok_or_else(|| AnnotateError::format("truncated objc1 category"))?;
    let instance_methods_addr = image.read_word(addr + 2 * word).unwrap_or(0);
    let class_methods_addr = image.read_word(addr + 3 * word).unwrap_or(0);

    let mut methods = read_method_list_v1(image, instance_methods_addr, false).unwrap_or_default();
    methods.extend(read_method_list_v1(image, class_methods_addr, true).unwrap_or_default());
    sort_methods_by_imp(&mut methods);

    Ok(CategoryInfo {
        name: image.cstr_at(cat_name_addr).unwrap_or_default(),
        class_name: image.cstr_at(class_name_addr).unwrap_or_default(),
        methods,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_method_list_sentinel_is_not_an_error() {
        // A method_list_t whose method_count is the sentinel should parse as
        // empty, not fail -- this can't be exercised without a real `MachO`,
        // so it's covered at the integration level (see `tests/`).
        assert_eq!(V1_METHOD_LIST_SENTINEL, 0xffff_ffff);
    }
}
