/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The output writer (C9): formats the annotated line list into the final
//! text, with fixed field widths, optional entabification, an optional
//! checksum-line placeholder, and an optional dump of recognized data
//! sections after the disassembly.

use crate::functions::FunctionInfo;
use crate::lines::LineList;
use crate::mach_o::MachO;
use crate::options::Options;
use std::fmt::Write as _;

/// Column widths for the non-comment fields of a code line: address, raw
/// bytes, local offset, mnemonic. The comment (if any) follows with no fixed
/// width of its own.
const ADDRESS_WIDTH: usize = 10;
const BYTES_WIDTH: usize = 21;
const OFFSET_WIDTH: usize = 7;
const MNEMONIC_WIDTH: usize = 28;

pub struct Writer {
    options: Options,
}

impl Writer {
    pub fn new(options: Options) -> Writer {
        Writer { options }
    }

    /// Render `lines` (already annotated by `crate::annotate`) for
    /// `functions`, writing into `out`.
    pub fn write(&self, out: &mut String, lines: &LineList, functions: &[FunctionInfo], image: &MachO) {
        self.write_header(out, image);

        if self.options.checksum {
            // The checksum itself is computed by the embedding tool after
            // the file is written (its algorithm is outside this crate's
            // scope); this just reserves the line so the layout matches.
            self.push_line(out, "checksum: 0x00000000");
        }

        for function in functions {
            for (block_idx, block) in function.blocks.iter().enumerate() {
                if self.options.separate_logical_blocks && block_idx > 0 {
                    out.push('\n');
                }
                for line_idx in block.start_line..block.end_line {
                    let Some(line) = lines.get(line_idx) else { continue };
                    let formatted = if self.options.local_offsets {
                        let offset = line.address.wrapping_sub(function.start);
                        format!(
                            "{:0addr_w$x}  {:bytes_w$}  {:<off_w$}  {:<mnem_w$}",
                            line.address,
                            hex_bytes(&line.raw_bytes),
                            format!("+{offset:#x}"),
                            line.text,
                            addr_w = ADDRESS_WIDTH,
                            bytes_w = BYTES_WIDTH,
                            off_w = OFFSET_WIDTH,
                            mnem_w = MNEMONIC_WIDTH,
                        )
                    } else {
                        format!(
                            "{:0addr_w$x}  {:bytes_w$}  {:<mnem_w$}",
                            line.address,
                            hex_bytes(&line.raw_bytes),
                            line.text,
                            addr_w = ADDRESS_WIDTH,
                            bytes_w = BYTES_WIDTH,
                            mnem_w = MNEMONIC_WIDTH,
                        )
                    };
                    self.push_line(out, formatted.trim_end());
                }
            }
        }

        if self.options.data_sections {
            self.write_data_sections(out, image);
        }
    }

    /// A short header identifying the image and architecture the listing
    /// below was produced for, the way `otx`'s own output opens with a
    /// banner before the first disassembled line.
    fn write_header(&self, out: &mut String, image: &MachO) {
        self.push_line(out, &format!("-- {} ({}) --", image.name, image.arch));
    }

    fn push_line(&self, out: &mut String, line: &str) {
        let line = if self.options.entab_output {
            entab(line)
        } else {
            line.to_string()
        };
        out.push_str(&line);
        out.push('\n');
    }

    fn write_data_sections(&self, out: &mut String, image: &MachO) {
        out.push('\n');
        out.push_str("-- data sections --\n");
        for section in image.sections.iter() {
            if section.is_code {
                continue;
            }
            let mut line = String::new();
            let _ = write!(line, "{},{}  {:#x}  ({:#x} bytes)", section.segment, section.name, section.vm_address, section.size);
            self.push_line(out, &line);
        }
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

/// Collapse runs of two or more spaces into a single tab, the simplest
/// reading of "entabify column padding" that doesn't require knowing the
/// terminal's tab stops.
fn entab(line: &str) -> String {
    let mut result = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ' ' && chars.peek() == Some(&' ') {
            while chars.peek() == Some(&' ') {
                chars.next();
            }
            result.push('\t');
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entab_collapses_space_runs() {
        assert_eq!(entab("a    b  c"), "a\tb\tc");
        assert_eq!(entab("a b"), "a b");
    }

    #[test]
    fn hex_bytes_formats_lowercase_pairs() {
        assert_eq!(hex_bytes(&[0x0a, 0xff]), "0a ff");
    }
}
