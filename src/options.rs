/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Parsing and management of the annotator's user-configurable options.
//!
//! Mirrors the split touchHLE's own `options` module makes: a plain struct
//! with a `Default` impl for the documented defaults, and a
//! `parse_argument` method an embedding command line can drive with
//! `--flag`/`--no-flag` syntax, without this crate depending on an
//! argument-parsing crate itself (argument parsing proper is outside the
//! annotation core, see spec.md §1).

/// All annotator options, see spec.md §6 for the semantics of each.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// Prefix each code line with its function-local offset.
    pub local_offsets: bool,
    /// Compress runs of spaces used for column padding into tabs.
    pub entab_output: bool,
    /// Dump recognised data sections after the disassembly.
    pub data_sections: bool,
    /// Reserve a checksum line in the output header.
    pub checksum: bool,
    /// Expand `objc_msgSend` family calls to `-[Class sel]`/`+[Class sel]`.
    pub verbose_msg_sends: bool,
    /// Emit a blank line at each discovered block boundary.
    pub separate_logical_blocks: bool,
    /// Route C++ symbol names through the external demangler.
    pub demangle_cpp_names: bool,
    /// Include Objective-C method return-type comments.
    pub return_types: bool,
    /// Include ivar type comments.
    pub variable_types: bool,
    /// Include function return-statement comments.
    pub return_statements: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            local_offsets: true,
            entab_output: false,
            data_sections: false,
            checksum: true,
            verbose_msg_sends: true,
            separate_logical_blocks: false,
            demangle_cpp_names: true,
            return_types: true,
            variable_types: true,
            return_statements: true,
        }
    }
}

impl Options {
    /// Parse one command-line-style argument. Returns `Ok(true)` if the
    /// argument was a recognized option and has been applied, `Ok(false)` if
    /// it wasn't recognized (so the caller can treat it as something else,
    /// e.g. a file path), or `Err` if it looked like one of our options but
    /// had an invalid form.
    pub fn parse_argument(&mut self, arg: &str) -> Result<bool, String> {
        let (name, negate) = match arg.strip_prefix("--no-") {
            Some(rest) => (rest, true),
            None => match arg.strip_prefix("--") {
                Some(rest) => (rest, false),
                None => return Ok(false),
            },
        };

        let slot = match name {
            "local-offsets" => &mut self.local_offsets,
            "entab-output" => &mut self.entab_output,
            "data-sections" => &mut self.data_sections,
            "checksum" => &mut self.checksum,
            "verbose-msg-sends" => &mut self.verbose_msg_sends,
            "separate-logical-blocks" => &mut self.separate_logical_blocks,
            "demangle-cpp-names" => &mut self.demangle_cpp_names,
            "return-types" => &mut self.return_types,
            "variable-types" => &mut self.variable_types,
            "return-statements" => &mut self.return_statements,
            _ => return Ok(false),
        };
        *slot = !negate;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::Options;

    #[test]
    fn defaults_match_spec() {
        let opts = Options::default();
        assert!(opts.local_offsets);
        assert!(!opts.entab_output);
        assert!(!opts.data_sections);
        assert!(opts.checksum);
        assert!(opts.verbose_msg_sends);
        assert!(!opts.separate_logical_blocks);
        assert!(opts.demangle_cpp_names);
        assert!(opts.return_types);
        assert!(opts.variable_types);
        assert!(opts.return_statements);
    }

    #[test]
    fn parse_toggles_and_negates() {
        let mut opts = Options::default();
        assert_eq!(opts.parse_argument("--no-checksum"), Ok(true));
        assert!(!opts.checksum);
        assert_eq!(opts.parse_argument("--checksum"), Ok(true));
        assert!(opts.checksum);
        assert_eq!(opts.parse_argument("--entab-output"), Ok(true));
        assert!(opts.entab_output);
    }

    #[test]
    fn unrecognized_argument_is_not_an_error() {
        let mut opts = Options::default();
        assert_eq!(opts.parse_argument("/path/to/binary"), Ok(false));
        assert_eq!(opts.parse_argument("--bogus-flag"), Ok(false));
    }
}
