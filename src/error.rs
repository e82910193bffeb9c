/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The annotator's error kinds.
//!
//! Unlike touchHLE's own top-level `Result<(), String>`, callers of this
//! crate (a CLI, a GUI shell) need to tell these apart to pick an exit code
//! or a recovery path, so each spec-defined kind gets its own variant.

use std::fmt;

/// One of the five error kinds the annotation pipeline can fail with.
#[derive(Debug, thiserror::Error)]
pub enum AnnotateError {
    /// File missing, unreadable, or a write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic, truncation, inconsistent load commands, duplicated
    /// sections, or a line-list address mismatch between the two
    /// disassembly listings.
    #[error("malformed input: {0}")]
    Format(String),

    /// No fat slice for the requested architecture, or an unknown/
    /// unsupported cpu type.
    #[error("unsupported binary: {0}")]
    Unsupported(String),

    /// The external disassembler or demangler is unavailable.
    #[error("external tool unavailable: {0}")]
    Toolchain(String),

    /// The controller requested cancellation mid-pass.
    #[error("annotation cancelled")]
    Cancelled,
}

impl AnnotateError {
    pub fn format(msg: impl Into<String>) -> Self {
        AnnotateError::Format(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        AnnotateError::Unsupported(msg.into())
    }

    pub fn toolchain(msg: impl Into<String>) -> Self {
        AnnotateError::Toolchain(msg.into())
    }

    /// The CLI exit code a caller should use for this error kind, per the
    /// external-interface contract: 1 usage, 2 malformed/unsupported binary,
    /// 3 missing external tool, 4 cancelled. Usage errors (exit code 1) are
    /// not produced by this crate (they belong to the excluded argument
    /// parser), so they never appear here.
    pub fn exit_code(&self) -> i32 {
        match self {
            AnnotateError::Io(_) | AnnotateError::Format(_) | AnnotateError::Unsupported(_) => 2,
            AnnotateError::Toolchain(_) => 3,
            AnnotateError::Cancelled => 4,
        }
    }
}

/// Wraps a `&'static str`/`String` error from the lower-level Mach-O loader
/// (which, like touchHLE's own `MachO::load_from_bytes`, reports simple
/// string errors) into a [AnnotateError].
impl From<&'static str> for AnnotateError {
    fn from(msg: &'static str) -> Self {
        AnnotateError::Format(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AnnotateError>;

/// A line in a disassembly listing that couldn't be parsed. Per spec.md §7,
/// this does not abort the pass: the line is skipped and the simulator's
/// register state is conservatively invalidated.
#[derive(Debug)]
pub struct SkippedLine {
    pub line_no: usize,
    pub reason: String,
}

impl fmt::Display for SkippedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line_no, self.reason)
    }
}
