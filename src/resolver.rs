/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The pointer/address resolver (C6).
//!
//! Given an address referenced by an instruction (a load target, a call
//! target, an immediate that looks like it could be a pointer), classify
//! what it points to and produce a human-readable hint for the annotator
//! (C8) to turn into a trailing comment.

use crate::mach_o::{MachO, SectionKind};
use crate::objc::ObjcCatalog;

/// What an address was found to point at.
#[derive(Debug, Clone, PartialEq)]
pub enum PointerHint {
    CString(String),
    PString(String),
    Float4(f32),
    Double8(f64),
    /// A `CFString`/`__CFConstantString` constant string literal.
    CfString(String),
    /// An `NSString` constant string literal -- same on-disk layout as
    /// [PointerHint::CfString], distinguished only by its `isa` (spec.md
    /// §4.6).
    NsString(String),
    /// A symbol imported from another image, reached through a
    /// lazy/non-lazy symbol pointer slot.
    ImportedSymbol(String),
    /// A locally-defined data or function symbol.
    Symbol(String),
    /// A `__DATA,__dyld` stub cell, rendered as the stub's own symbol name
    /// when the symbol table has one (spec.md §4.6).
    DyldStub(String),
    ObjcClassRef(String),
    ObjcSelRef(String),
    ObjcSuperRef(String),
    /// A class or instance method implementation.
    ObjcMethod {
        class_name: String,
        selector: String,
        is_class_method: bool,
        type_encoding: String,
    },
    /// An instance variable, resolved via a known class pointer and a
    /// matching offset (spec.md §4.7, "indirect loads through a known class
    /// pointer").
    ObjcIvar { class_name: String, ivar_name: String, type_encoding: String },
}

/// The well-known `isa` value that marks a literal as an `NSString` constant
/// rather than a plain `CFString` one (spec.md §4.6): both share the same
/// `{isa, flags, chars, length}` layout, so this sentinel is the only way to
/// tell them apart statically.
const NSSTRING_ISA_SENTINEL: u64 = 0x7c8;

/// `__CFConstantString`/`__NSConstantString` literal layout: isa, flags,
/// data pointer, length -- one word each.
fn read_cfstring(image: &MachO, addr: u64) -> Option<(bool, String)> {
    let word = image.arch.word_size() as u64;
    let isa = image.read_word(addr)?;
    if isa == 0 {
        return None;
    }
    let data_ptr = image.read_word(addr + 2 * word)?;
    let chars = image.cstr_at(data_ptr)?;
    Some((isa == NSSTRING_ISA_SENTINEL, chars))
}

/// Resolves addresses against an image's section registry, symbol table and
/// Objective-C catalog.
pub struct Resolver<'a> {
    image: &'a MachO,
    catalog: &'a ObjcCatalog,
}

impl<'a> Resolver<'a> {
    pub fn new(image: &'a MachO, catalog: &'a ObjcCatalog) -> Resolver<'a> {
        Resolver { image, catalog }
    }

    /// Classify `addr` and produce a hint, if anything is known about it.
    /// Returns `None` for an address in an unmapped or unrecognized region
    /// (spec.md §7: the annotator just emits no comment in that case).
    pub fn resolve(&self, addr: u64) -> Option<PointerHint> {
        if let Some((class_name, method)) = self.catalog.method_at(addr) {
            return Some(PointerHint::ObjcMethod {
                class_name: class_name.to_string(),
                selector: method.selector.clone(),
                is_class_method: method.is_class_method,
                type_encoding: method.type_encoding.clone(),
            });
        }

        if let Some(name) = self.image.indirect_symbol_names.get(&addr) {
            return Some(PointerHint::ImportedSymbol(name.clone()));
        }

        if let Some(sym) = self.image.function_symbol_at(addr) {
            return Some(PointerHint::Symbol(sym.name.clone()));
        }

        let section = self.image.sections.lookup_by_address(addr)?;
        match section.kind {
            SectionKind::CString => self.image.cstr_at(addr).map(PointerHint::CString),
            SectionKind::PString => self.image.cstr_at(addr).map(PointerHint::PString),
            SectionKind::Float4 => self.image.read_f32(addr).map(PointerHint::Float4),
            SectionKind::Double8 => self.image.read_f64(addr).map(PointerHint::Double8),
            SectionKind::CfString => read_cfstring(self.image, addr).map(|(is_nsstring, s)| {
                if is_nsstring {
                    PointerHint::NsString(s)
                } else {
                    PointerHint::CfString(s)
                }
            }),
            SectionKind::Dyld => self
                .image
                .function_symbol_at(addr)
                .map(|sym| PointerHint::DyldStub(sym.name.clone())),
            SectionKind::ObjcClassRef | SectionKind::ObjcSuperRef | SectionKind::ObjcSelRef => {
                let target = self.image.read_word(addr)?;
                let name = if section.kind == SectionKind::ObjcSelRef {
                    self.image.cstr_at(target)
                } else {
                    self.resolve_class_name(target)
                }?;
                Some(match section.kind {
                    SectionKind::ObjcClassRef => PointerHint::ObjcClassRef(name),
                    SectionKind::ObjcSuperRef => PointerHint::ObjcSuperRef(name),
                    _ => PointerHint::ObjcSelRef(name),
                })
            }
            _ => None,
        }
    }

    /// Look up whether `addr` is itself the implementation entry point of a
    /// known method, independent of any section-registry classification --
    /// used to recognize a function as an Objective-C method body so its
    /// `ret`/`blr` lines can carry a return-type comment (spec.md §6,
    /// `return_statements`).
    pub fn method_at(&self, addr: u64) -> Option<(&str, &crate::objc::MethodInfo)> {
        self.catalog.method_at(addr)
    }

    /// Resolve an indirect ivar load: `class_name` is whatever class pointer
    /// the simulator (C5) last saw loaded into the base register, `offset`
    /// is the load's displacement (spec.md §4.7, scenario "indirect load
    /// through a known class pointer").
    pub fn resolve_ivar(&self, class_name: &str, offset: u64) -> Option<PointerHint> {
        let ivar = self.catalog.ivar_in_class(class_name, offset)?;
        Some(PointerHint::ObjcIvar {
            class_name: class_name.to_string(),
            ivar_name: ivar.name.clone(),
            type_encoding: ivar.type_encoding.clone(),
        })
    }

    fn resolve_class_name(&self, class_addr: u64) -> Option<String> {
        self.catalog
            .classes
            .iter()
            .find(|c| c.address == class_addr)
            .map(|c| c.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_are_distinguishable() {
        let a = PointerHint::CString("hi".to_string());
        let b = PointerHint::PString("hi".to_string());
        assert_ne!(a, b);
    }
}
