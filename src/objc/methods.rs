/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Method and ivar records read out of Objective-C class/category metadata.
//!
//! Resources:
//! - `examples/original_source/src/source/ObjcTypes.h`'s `objc1_32_method`/
//!   `objc2_32_method_t` and `objc1_32_ivar`/`objc2_32_ivar_t` are the struct
//!   layouts this reads; see `super::v1` and `super::v2` for where they're
//!   parsed off an image.

/// One method entry: enough to print a `-[Class sel]`/`+[Class sel]` comment
/// and, via `imp`, to recognize a block's entry point as the start of a
/// method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub selector: String,
    pub type_encoding: String,
    pub imp: u64,
    pub is_class_method: bool,
}

/// One ivar entry. `offset` is the value to match against whatever offset
/// the register/stack simulator (C7) has inferred a load is reading,
/// assuming the base register was known to hold `self`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvarInfo {
    pub name: String,
    pub type_encoding: String,
    pub offset: u64,
}

/// Sort `methods` by `imp` and assert the order is self-consistent, i.e. that
/// no two methods share an `imp` with different selectors. A shared `imp` is
/// not itself an error (multiple selectors may have been coalesced onto one
/// implementation by the linker) — but [lookup_by_imp] then returns
/// whichever one sorted first, and that choice must be stable across a
/// lookup-by-address and a subsequent lookup-by-selector, which sorting by
/// `imp` and breaking ties by selector guarantees.
pub fn sort_methods_by_imp(methods: &mut Vec<MethodInfo>) {
    methods.sort_by(|a, b| a.imp.cmp(&b.imp).then_with(|| a.selector.cmp(&b.selector)));
}

pub fn lookup_by_imp(methods: &[MethodInfo], imp: u64) -> Option<&MethodInfo> {
    let idx = methods.binary_search_by_key(&imp, |m| m.imp).ok()?;
    Some(&methods[idx])
}

/// Find the ivar, if any, whose offset exactly matches `offset`. v1 and v2
/// layouts both store an absolute byte offset from the start of the
/// instance, so no per-version handling is needed once [IvarInfo] is built.
pub fn lookup_by_offset(ivars: &[IvarInfo], offset: u64) -> Option<&IvarInfo> {
    ivars.iter().find(|iv| iv.offset == offset)
}

/// Translate the leading character of an Objective-C type encoding into the
/// C type name it stands for (Apple's "Type Encodings" reference). Only the
/// first encoded type is read -- qualifiers, bitfield widths and nested
/// struct/union member lists aren't expanded, which is enough for a trailing
/// comment (`return_types`/`variable_types`, spec.md §6) rather than a full
/// re-rendering of the signature.
pub fn decode_type_encoding(encoding: &str) -> &'static str {
    let first = encoding
        .trim_start_matches(|c: char| c == 'r' || c == 'n' || c == 'N' || c == 'o' || c == 'O' || c == 'R' || c == 'V')
        .chars()
        .next();
    match first {
        Some('v') => "void",
        Some('c') => "char",
        Some('C') => "unsigned char",
        Some('i') => "int",
        Some('I') => "unsigned int",
        Some('s') => "short",
        Some('S') => "unsigned short",
        Some('l') => "long",
        Some('L') => "unsigned long",
        Some('q') => "long long",
        Some('Q') => "unsigned long long",
        Some('f') => "float",
        Some('d') => "double",
        Some('B') => "BOOL",
        Some('*') => "char *",
        Some('@') => "id",
        Some('#') => "Class",
        Some(':') => "SEL",
        Some('^') => "pointer",
        Some('{') => "struct",
        Some('(') => "union",
        Some('[') => "array",
        _ => "?",
    }
}

/// The return type encoded at the start of a method's full type-encoding
/// string, before the frame-size digits and argument types that follow it.
pub fn return_type_of(type_encoding: &str) -> &'static str {
    decode_type_encoding(type_encoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(selector: &str, imp: u64) -> MethodInfo {
        MethodInfo {
            selector: selector.to_string(),
            type_encoding: "v@:".to_string(),
            imp,
            is_class_method: false,
        }
    }

    #[test]
    fn sorts_and_finds_by_imp() {
        let mut methods = vec![method("viewDidLoad", 0x2000), method("init", 0x1000)];
        sort_methods_by_imp(&mut methods);
        assert_eq!(methods[0].selector, "init");
        assert_eq!(lookup_by_imp(&methods, 0x2000).unwrap().selector, "viewDidLoad");
        assert!(lookup_by_imp(&methods, 0x3000).is_none());
    }

    #[test]
    fn ties_on_imp_break_by_selector_deterministically() {
        let mut methods = vec![method("zeta", 0x1000), method("alpha", 0x1000)];
        sort_methods_by_imp(&mut methods);
        assert_eq!(methods[0].selector, "alpha");
    }

    #[test]
    fn ivar_lookup_by_offset() {
        let ivars = vec![
            IvarInfo {
                name: "_count".to_string(),
                type_encoding: "i".to_string(),
                offset: 8,
            },
            IvarInfo {
                name: "_name".to_string(),
                type_encoding: "@".to_string(),
                offset: 12,
            },
        ];
        assert_eq!(lookup_by_offset(&ivars, 12).unwrap().name, "_name");
        assert!(lookup_by_offset(&ivars, 16).is_none());
    }

    #[test]
    fn decodes_common_type_encodings() {
        assert_eq!(decode_type_encoding("v@:"), "void");
        assert_eq!(decode_type_encoding("@"), "id");
        assert_eq!(decode_type_encoding("i"), "int");
        assert_eq!(decode_type_encoding("Ri"), "int");
    }
}
