/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The disassembly line model (C4).
//!
//! The two disassembly listings (symbolic and numeric) the annotator ingests
//! are represented as a pair of [LineList]s, cross-linked by address. This
//! is a flat `Vec` with stable indices rather than a doubly-linked list:
//! lines are appended and occasionally replaced or split, but the pipeline
//! never needs pointer-stable storage, and a `Vec` is both simpler and
//! easier to binary-search over.

use crate::error::{AnnotateError, Result};

/// One line of a disassembly listing.
#[derive(Debug, Clone)]
pub struct Line {
    pub address: u64,
    pub text: String,
    pub raw_bytes: Vec<u8>,
    pub is_code: bool,
    pub is_function_start: bool,
    /// Index of the corresponding line in the other list (symbolic <->
    /// numeric), once [DualLineList::cross_link] has run.
    pub alt: Option<usize>,
}

impl Line {
    fn new(address: u64, text: String) -> Line {
        Line {
            address,
            text,
            raw_bytes: Vec::new(),
            is_code: true,
            is_function_start: false,
            alt: None,
        }
    }

    fn with_bytes(address: u64, raw_bytes: Vec<u8>, text: String, is_code: bool) -> Line {
        Line {
            address,
            text,
            raw_bytes,
            is_code,
            is_function_start: false,
            alt: None,
        }
    }
}

/// An address-ordered sequence of [Line]s from one disassembly listing.
#[derive(Debug, Default)]
pub struct LineList {
    lines: Vec<Line>,
}

/// Parse one line of the form `"<hex address>:<whitespace><text>"`, the
/// shape both `objdump`-style and `otool -tV`-style listings share. A line
/// that doesn't start with a recognizable address is skipped (spec.md §7:
/// a malformed individual line degrades silently rather than aborting the
/// whole pass), not treated as a format error.
///
/// `text` may optionally open with a run of whitespace-separated two-digit
/// hex byte pairs (`"55 89 e5  push %ebp"`) -- the raw byte column spec.md
/// §4.4 says a code line carries alongside its mnemonic. Those are peeled
/// off into the returned byte vector; the rest becomes the line's text. At
/// least two such tokens must appear consecutively before anything else is
/// trusted as a byte column -- a handful of real PPC mnemonics (`ba`, `bc`)
/// are themselves two lowercase hex digits, so a single matching token is
/// left alone as the mnemonic rather than misread as a one-byte dump. A
/// line whose text is empty, or is a single token ending in `:` (a bare
/// function/section label with no instruction of its own), is reported as
/// not code (spec.md §3: "section headers and function labels set
/// `is_code=false`").
fn parse_line(raw: &str) -> Option<(u64, Vec<u8>, String, bool)> {
    let (addr_part, rest) = raw.split_once(':')?;
    let addr_part = addr_part.trim();
    let addr = u64::from_str_radix(addr_part.trim_start_matches("0x"), 16).ok()?;
    let rest = rest.trim();

    let all_tokens: Vec<&str> = rest.split_whitespace().collect();
    let is_byte_token = |tok: &str| tok.len() == 2 && tok.chars().all(|c| c.is_ascii_hexdigit());
    let byte_run = all_tokens.iter().take_while(|t| is_byte_token(t)).count();
    let byte_run = if byte_run >= 2 { byte_run } else { 0 };

    let raw_bytes = all_tokens[..byte_run]
        .iter()
        .map(|t| u8::from_str_radix(t, 16).unwrap())
        .collect();
    let remaining = &all_tokens[byte_run..];
    let text = remaining.join(" ");

    let is_code = !text.is_empty() && !(remaining.len() == 1 && text.ends_with(':'));
    Some((addr, raw_bytes, text, is_code))
}

impl LineList {
    /// Wrap an already-built, address-ordered run of lines -- used for the
    /// merged listing [DualLineList::choose_lines] produces, which has no
    /// raw text of its own to parse.
    pub fn from_lines(lines: Vec<Line>) -> LineList {
        LineList { lines }
    }

    /// Ingest a raw disassembly listing, one instruction/directive per
    /// source line. Lines that don't parse are skipped with a warning
    /// rather than aborting ingestion.
    pub fn from_text(raw: &str) -> LineList {
        let mut lines = Vec::new();
        for (line_no, raw_line) in raw.lines().enumerate() {
            if raw_line.trim().is_empty() {
                continue;
            }
            match parse_line(raw_line) {
                Some((address, raw_bytes, text, is_code)) => {
                    lines.push(Line::with_bytes(address, raw_bytes, text, is_code))
                }
                None => log!("skipping unparseable line {}: {:?}", line_no + 1, raw_line),
            }
        }
        LineList { lines }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Line> {
        self.lines.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Line> {
        self.lines.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Line> {
        self.lines.iter()
    }

    /// Binary search for the line at exactly `address`. Lines are assumed
    /// address-ordered, true of both listing formats this crate ingests.
    pub fn index_of_address(&self, address: u64) -> Option<usize> {
        self.lines
            .binary_search_by_key(&address, |l| l.address)
            .ok()
    }

    pub fn insert_before(&mut self, idx: usize, line: Line) {
        self.lines.insert(idx, line);
    }

    pub fn insert_after(&mut self, idx: usize, line: Line) {
        self.lines.insert(idx + 1, line);
    }

    pub fn replace(&mut self, idx: usize, line: Line) {
        self.lines[idx] = line;
    }

    /// Delete the line immediately before `idx`, shifting `idx` and every
    /// later index down by one. Returns the new index of what used to be at
    /// `idx`.
    pub fn delete_before(&mut self, idx: usize) -> usize {
        if idx == 0 {
            return idx;
        }
        self.lines.remove(idx - 1);
        idx - 1
    }
}

/// The symbolic and numeric listings together, cross-linked by address.
pub struct DualLineList {
    pub symbolic: LineList,
    pub numeric: LineList,
}

impl DualLineList {
    pub fn new(symbolic: LineList, numeric: LineList) -> DualLineList {
        DualLineList { symbolic, numeric }
    }

    /// Walk both lists in step and record each code line's `alt` index in
    /// the other list (spec.md §4.4). Unlike a strict index-by-index
    /// comparison, this tolerates the two listings disagreeing about
    /// non-code framing (section headers, bare labels, blank padding) --
    /// only the *code* line address sequence is required to line up, since
    /// that's the only invariant spec.md actually asserts for the dual
    /// listing. Non-code lines are simply never linked; nothing downstream
    /// needs their `alt`.
    pub fn cross_link(&mut self) -> Result<()> {
        let mut i = 0;
        let mut j = 0;
        loop {
            while i < self.symbolic.len() && !self.symbolic.get(i).unwrap().is_code {
                i += 1;
            }
            while j < self.numeric.len() && !self.numeric.get(j).unwrap().is_code {
                j += 1;
            }
            if i >= self.symbolic.len() || j >= self.numeric.len() {
                break;
            }
            let sym_addr = self.symbolic.get(i).unwrap().address;
            let num_addr = self.numeric.get(j).unwrap().address;
            if sym_addr != num_addr {
                return Err(AnnotateError::format(format!(
                    "code line address mismatch between listings: {sym_addr:#x} vs {num_addr:#x}"
                )));
            }
            self.symbolic.get_mut(i).unwrap().alt = Some(j);
            self.numeric.get_mut(j).unwrap().alt = Some(i);
            i += 1;
            j += 1;
        }

        // Exhausting one listing's code lines while the other still has some
        // left means the two disagree about which addresses are code at
        // all -- a genuine format error, not a framing difference.
        let has_remaining_code = |list: &LineList, from: usize| list.iter().skip(from).any(|l| l.is_code);
        if has_remaining_code(&self.symbolic, i) || has_remaining_code(&self.numeric, j) {
            return Err(AnnotateError::format(
                "symbolic and numeric listings disagree about which addresses are code".to_string(),
            ));
        }
        Ok(())
    }

    /// Merge the two cross-linked listings into one canonical line per
    /// address, for output (spec.md §9 DESIGN NOTES: which listing "wins"
    /// per line is an implementation-defined policy, not specified).
    ///
    /// Driven off the numeric listing rather than a lock-step zip: function
    /// and block discovery (C5) and the annotator (C8) both index into
    /// `numeric`, so the merged output must preserve `numeric`'s line count
    /// and ordering exactly, even though `cross_link` no longer guarantees
    /// the symbolic listing has the same length. For each code line, keeps
    /// whichever listing's text names something the other left as a bare
    /// register/hex literal -- the same judgment call a human comparing the
    /// two listings side by side would make -- and otherwise falls back to
    /// the numeric listing, since a bare literal is never wrong even when a
    /// symbol can't be recovered. Non-code lines, and any code line with no
    /// cross-linked counterpart, pass through from `numeric` unchanged.
    pub fn choose_lines(&self) -> Vec<Line> {
        self.numeric
            .iter()
            .map(|num| {
                if !num.is_code {
                    return num.clone();
                }
                match num.alt.and_then(|alt_idx| self.symbolic.get(alt_idx)) {
                    Some(sym) if prefers_symbolic(&sym.text, &num.text) => {
                        let mut merged = sym.clone();
                        merged.raw_bytes = num.raw_bytes.clone();
                        merged.is_function_start = num.is_function_start;
                        merged.alt = num.alt;
                        merged
                    }
                    _ => num.clone(),
                }
            })
            .collect()
    }
}

/// Whether a token is something the disassembler left untranslated: a
/// register name, or a `$`/`0x`-prefixed (or bare decimal) literal.
fn is_bare_literal(token: &str) -> bool {
    let token = token.trim_end_matches(',').trim();
    if token.is_empty() {
        return true;
    }
    if token.starts_with('%') || token.starts_with('$') {
        return true;
    }
    if token.starts_with('r') && token[1..].chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    let stripped = token.trim_start_matches("0x");
    u64::from_str_radix(stripped, 16).is_ok() || token.parse::<i64>().is_ok()
}

fn prefers_symbolic(symbolic_text: &str, numeric_text: &str) -> bool {
    let sym_base = symbolic_text.split(" ; ").next().unwrap_or(symbolic_text).trim();
    let num_base = numeric_text.split(" ; ").next().unwrap_or(numeric_text).trim();
    if sym_base == num_base {
        return true;
    }
    let sym_last = sym_base.split_whitespace().last().unwrap_or("");
    let num_last = num_base.split_whitespace().last().unwrap_or("");
    !is_bare_literal(sym_last) && is_bare_literal(num_last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingests_raw_byte_column_when_present() {
        let lines = LineList::from_text("0x1fa0: 55 89 e5 57  push %ebp\n");
        let line = lines.get(0).unwrap();
        assert_eq!(line.raw_bytes, vec![0x55, 0x89, 0xe5, 0x57]);
        assert_eq!(line.text, "push %ebp");
        assert!(line.is_code);
    }

    #[test]
    fn does_not_mistake_a_two_hex_digit_mnemonic_for_a_byte_dump() {
        // "ba" (branch always) and "bc" are real PPC mnemonics that happen
        // to also be valid hex byte pairs; a lone leading match must not be
        // swallowed as a one-byte dump, or block-ending/mnemonic matching
        // downstream would silently break.
        let lines = LineList::from_text("0x2000: ba 0x3000\n");
        let line = lines.get(0).unwrap();
        assert!(line.raw_bytes.is_empty());
        assert_eq!(line.text, "ba 0x3000");
    }

    #[test]
    fn bare_label_line_is_not_code() {
        let lines = LineList::from_text("0x1000: _foo:\n");
        assert!(!lines.get(0).unwrap().is_code);
    }

    #[test]
    fn ingests_and_skips_bad_lines() {
        let raw = "0x1000: push %ebp\nnot a line\n0x1001: mov %esp, %ebp\n";
        let lines = LineList::from_text(raw);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines.get(0).unwrap().address, 0x1000);
        assert_eq!(lines.get(1).unwrap().text, "mov %esp, %ebp");
    }

    #[test]
    fn binary_search_by_address() {
        let lines = LineList::from_text("0x10: a\n0x20: b\n0x30: c\n");
        assert_eq!(lines.index_of_address(0x20), Some(1));
        assert!(lines.index_of_address(0x25).is_none());
    }

    #[test]
    fn cross_link_matches_identical_address_sequences() {
        let symbolic = LineList::from_text("0x10: call _foo\n0x14: ret\n");
        let numeric = LineList::from_text("0x10: call 0x2000\n0x14: ret\n");
        let mut dual = DualLineList::new(symbolic, numeric);
        dual.cross_link().unwrap();
        assert_eq!(dual.symbolic.get(0).unwrap().alt, Some(0));
        assert_eq!(dual.numeric.get(1).unwrap().alt, Some(1));
    }

    #[test]
    fn cross_link_rejects_mismatched_addresses() {
        let symbolic = LineList::from_text("0x10: call _foo\n");
        let numeric = LineList::from_text("0x20: call 0x2000\n");
        let mut dual = DualLineList::new(symbolic, numeric);
        assert!(dual.cross_link().is_err());
    }

    #[test]
    fn cross_link_tolerates_differing_non_code_framing() {
        // The symbolic listing carries an extra bare label line (e.g. a
        // disassembler-emitted routine name) that the numeric listing never
        // has; the code line addresses still line up and should link fine.
        let symbolic =
            LineList::from_text("0x10: _foo:\n0x10: push %ebp\n0x14: call _bar\n0x18: ret\n");
        let numeric = LineList::from_text("0x10: push %ebp\n0x14: call 0x2000\n0x18: ret\n");
        let mut dual = DualLineList::new(symbolic, numeric);
        dual.cross_link().unwrap();
        assert_eq!(dual.numeric.get(0).unwrap().alt, Some(1));
        assert_eq!(dual.numeric.get(1).unwrap().alt, Some(2));
        assert!(dual.symbolic.get(0).unwrap().alt.is_none());
    }

    #[test]
    fn choose_lines_prefers_whichever_listing_names_something() {
        let symbolic = LineList::from_text("0x10: call _foo\n0x14: mov %eax, %ebx\n");
        let numeric = LineList::from_text("0x10: call 0x2000\n0x14: mov %eax, %ebx\n");
        let mut dual = DualLineList::new(symbolic, numeric);
        dual.cross_link().unwrap();
        let merged = dual.choose_lines();
        assert_eq!(merged[0].text, "call _foo");
        assert_eq!(merged[1].text, "mov %eax, %ebx");
    }

    #[test]
    fn insert_and_delete_before_shift_indices() {
        let mut lines = LineList::from_text("0x10: a\n0x20: b\n");
        lines.insert_after(0, Line::new(0x18, "inserted".to_string()));
        assert_eq!(lines.len(), 3);
        assert_eq!(lines.get(1).unwrap().text, "inserted");
        let new_idx = lines.delete_before(2);
        assert_eq!(new_idx, 1);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines.get(1).unwrap().text, "b");
    }
}
