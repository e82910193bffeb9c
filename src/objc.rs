/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Objective-C metadata catalog (C3).
//!
//! Builds a flat, read-only catalog of every class, category, ivar and
//! method an image's `__OBJC`/`__DATA` sections describe. Two on-disk
//! formats exist (see `classes` module docs); this module picks whichever
//! one the image actually has and normalizes both into the same
//! [ClassInfo]/[CategoryInfo] shape, so the resolver (C6) and annotator (C8)
//! never need to know which format a given binary used.

mod classes;
mod methods;

pub use classes::{CategoryInfo, ClassInfo};
pub use methods::{
    decode_type_encoding, lookup_by_imp, lookup_by_offset, return_type_of, IvarInfo, MethodInfo,
};

use crate::error::Result;
use crate::mach_o::MachO;

/// The whole Objective-C metadata catalog for one image.
#[derive(Debug, Default)]
pub struct ObjcCatalog {
    pub classes: Vec<ClassInfo>,
    pub categories: Vec<CategoryInfo>,
}

impl ObjcCatalog {
    /// Build the catalog for `image`. If the image has a v2-format class
    /// list (`__DATA,__objc_classlist`), that format wins outright, even if
    /// v1-format sections are also present (mixing formats in one image
    /// doesn't happen in practice, but if it did, v2 reflects what the
    /// runtime actually loads). Falls back to v1
    /// (`__OBJC,__module_info`). An image with neither yields an empty,
    /// valid catalog: plenty of Mach-O binaries have no Objective-C content
    /// at all, and that is not an error.
    pub fn load(image: &MachO) -> Result<ObjcCatalog> {
        let has_v2 = image
            .sections
            .by_name("__DATA", "__objc_classlist")
            .is_some();

        let (classes, categories) = if has_v2 {
            classes::load_v2(image)?
        } else if image.sections.by_name("__OBJC", "__module_info").is_some() {
            classes::load_v1(image)?
        } else {
            log!("no Objective-C metadata sections found in {}", image.name);
            (Vec::new(), Vec::new())
        };

        Ok(ObjcCatalog { classes, categories })
    }

    pub fn class_named(&self, name: &str) -> Option<&ClassInfo> {
        self.classes.iter().find(|c| !c.is_metaclass && c.name == name)
    }

    /// A class's metaclass: the class its `isa` points at, which carries its
    /// class (not instance) methods (spec.md C3 query contract,
    /// `metaclass_from_class`).
    pub fn metaclass_of(&self, class: &ClassInfo) -> Option<&ClassInfo> {
        self.classes
            .iter()
            .find(|c| c.is_metaclass && c.name == class.name)
    }

    /// Find the ivar at exactly `offset` in `class_name`'s instance layout.
    /// Per spec.md C3, matches only the named class's own ivars -- it does
    /// not walk up to the superclass, since an inherited ivar's offset was
    /// already baked into the subclass's own ivar list by the compiler.
    pub fn ivar_in_class(&self, class_name: &str, offset: u64) -> Option<&methods::IvarInfo> {
        let class = self.class_named(class_name)?;
        lookup_by_offset(&class.ivars, offset)
    }

    /// Find the class or category method whose `imp` matches `addr`. Per
    /// spec.md's boundary rule, when a class and one of its categories both
    /// declare an override for the same selector, the runtime's own
    /// category-wins-at-load-time behavior isn't modeled here (this is a
    /// static catalog, not the dynamic method-resolution order) — instead
    /// this simply returns whichever entry's `imp` equals `addr`, since by
    /// construction only one implementation can live at a given address.
    pub fn method_at(&self, addr: u64) -> Option<(&str, &MethodInfo)> {
        for class in &self.classes {
            if let Some(m) = lookup_by_imp(&class.methods, addr) {
                return Some((&class.name, m));
            }
        }
        for category in &self.categories {
            if let Some(m) = lookup_by_imp(&category.methods, addr) {
                return Some((&category.class_name, m));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_catalog_is_not_an_error() {
        let catalog = ObjcCatalog::default();
        assert!(catalog.classes.is_empty());
        assert!(catalog.class_named("NSObject").is_none());
    }
}
