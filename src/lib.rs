/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Symbolic annotation of Mach-O disassembly.
//!
//! Given a Mach-O binary and the two disassembly listings an external
//! disassembler produced for it (a symbolic one and a numeric one, see
//! [lines]), this crate resolves addresses the disassembler left bare --
//! Objective-C classes, methods and ivars, string and CFString literals,
//! imported symbols, stack-frame offsets -- into trailing comments, the way
//! a human reading the raw disassembly by hand would annotate it.
//!
//! The pipeline is a straight line through this crate's modules:
//! [mach_o] loads the image and its section registry, [objc] reads whatever
//! Objective-C metadata it carries, [lines] ingests the two listings and
//! cross-links them by address, [functions] discovers function and block
//! boundaries, [annotate] drives [sim]'s per-architecture register/stack
//! simulator block by block and consults [resolver] for what each address
//! means, and [writer] renders the result. [demangle] is an optional
//! collaborator for C++ symbol names. See [annotate_image] for the
//! entry point that runs the whole pipeline.

#[macro_use]
mod log;
pub mod annotate;
pub mod arch;
pub mod demangle;
pub mod error;
pub mod functions;
pub mod lines;
pub mod mach_o;
pub mod objc;
pub mod options;
pub mod resolver;
pub mod sim;
pub mod writer;

pub use arch::Arch;
pub use error::{AnnotateError, Result};
pub use options::Options;

use lines::{DualLineList, LineList};
use mach_o::MachO;
use objc::ObjcCatalog;
use std::sync::atomic::AtomicBool;

/// Everything [annotate_image] needs: the raw binary, which architecture
/// slice to annotate it as, the two disassembly listings already produced
/// for it by an external disassembler, and the user's option set.
pub struct AnnotationRequest<'a> {
    pub binary: &'a [u8],
    pub arch: Arch,
    pub name: String,
    pub symbolic_listing: &'a str,
    pub numeric_listing: &'a str,
    pub options: Options,
}

/// Run the full C1-C9 pipeline: load the image, build the Objective-C
/// catalog, ingest and cross-link the two listings, discover functions and
/// blocks, annotate, and render. `cancelled`, if given, is polled between
/// functions so a caller running this on a background thread can request an
/// early stop (spec.md's `cancelled` error kind).
pub fn annotate_image(
    request: AnnotationRequest,
    cancelled: Option<&AtomicBool>,
) -> Result<String> {
    let image = MachO::load_from_bytes(request.binary, request.arch, request.name)?;
    let catalog = ObjcCatalog::load(&image)?;

    let symbolic = LineList::from_text(request.symbolic_listing);
    let numeric = LineList::from_text(request.numeric_listing);
    let mut dual = DualLineList::new(symbolic, numeric);
    dual.cross_link()?;

    let funcs = functions::find_functions(&image, &dual.numeric);
    // spec.md §3: `is_function_start` is set when a line's address is a
    // function entry -- mark it on both listings now that C5 has run.
    for function in &funcs {
        if let Some(line) = dual.numeric.get_mut(function.start_line()) {
            line.is_function_start = true;
        }
        if let Some(alt_idx) = dual.numeric.get(function.start_line()).and_then(|l| l.alt) {
            if let Some(line) = dual.symbolic.get_mut(alt_idx) {
                line.is_function_start = true;
            }
        }
    }

    let annotator = annotate::Annotator::new(&image, &catalog, request.options);
    annotator.annotate(&mut dual, &funcs, cancelled)?;

    let merged = LineList::from_lines(dual.choose_lines());

    let mut out = String::new();
    let out_writer = writer::Writer::new(request.options);
    out_writer.write(&mut out, &merged, &funcs, &image);
    Ok(out)
}
