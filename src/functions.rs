/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Function and block discovery (C5).
//!
//! Function boundaries come from the symbol table (any defined symbol in a
//! code section) plus the image's entry point, widened by spec.md §4.5's
//! heuristic set so that unsymbolized ("anonymous") functions are still
//! found: the first code line in the listing, any code line immediately
//! following an unconditional return/jump with no fall-through, and any
//! address a backward branch reaches from a *different* already-known
//! function (an intra-function loop backedge stays a block boundary, not a
//! new function -- see [backward_jump_starts]). Nothing here re-disassembles
//! the binary or reconstructs a full control-flow graph (both are explicit
//! non-goals); it only tracks enough of each function's branch targets to
//! split it into straight-line blocks and to know, at each block's entry,
//! what the simulator (C7) believed about register contents the first time
//! control reached there (spec.md §4.5 `gather_func_infos`, §8 scenario 4).

use crate::arch::Arch;
use crate::lines::{Line, LineList};
use crate::mach_o::MachO;
use crate::sim::{new_simulator, MachineState};
use std::collections::{BTreeSet, HashMap};

/// One discovered function.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub start: u64,
    pub end: u64,
    pub name: String,
    /// True if `name` was invented (`AnonN`) rather than read from the
    /// symbol table.
    pub name_is_generic: bool,
    pub blocks: Vec<BlockInfo>,
}

impl FunctionInfo {
    /// Line-list index of this function's first instruction -- the index
    /// [crate::annotate_image] marks `is_function_start` on.
    pub fn start_line(&self) -> usize {
        self.blocks.first().map_or(0, |b| b.start_line)
    }
}

/// One block within a function: a contiguous range of line indices (into
/// the numeric listing that discovery was run against) the simulator treats
/// as a single register-state lifetime, plus the state it believed on
/// arrival (spec.md §3's `BlockInfo`).
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub begin_address: u64,
    pub start_line: usize,
    /// Exclusive.
    pub end_line: usize,
    /// Set when this block was closed by an epilogue-looking instruction
    /// (a `ret`/`jmp`-family mnemonic) rather than by falling into a jump
    /// target.
    pub is_epilog: bool,
    /// The simulator's state the first time control reached
    /// `begin_address`, captured during discovery and restored by the
    /// annotator (C8) at the top of this block rather than carried forward
    /// from whatever block preceded it in line order.
    pub entry_state: MachineState,
}

/// Mnemonics that end a block: an unconditional transfer of control after
/// which the simulator can no longer trust register contents carried over
/// from the previous block. Deliberately conservative (text match against
/// already-disassembled mnemonics, not decoded machine code, per the
/// re-disassembly non-goal).
const BLOCK_ENDING_MNEMONICS: &[&str] = &[
    "ret", "retn", "retq", "leave", "blr", "rfi", "sysret", "iret", "hlt", "jmp",
];

fn is_block_ending(text: &str) -> bool {
    let mnemonic = text.split_whitespace().next().unwrap_or("");
    BLOCK_ENDING_MNEMONICS.contains(&mnemonic)
}

/// Mnemonics that transfer control to another address without being a call
/// (i.e. without setting a return address) -- the set [branch_target] looks
/// for. PPC branch mnemonics all start with `b`; `bl`/`bla` (link) and `blr`
/// (itself a return, not a branch to a literal target) are excluded since
/// they're calls/returns, not jumps.
fn is_branch_mnemonic(arch: Arch, mnemonic: &str) -> bool {
    match arch {
        Arch::Ppc | Arch::Ppc64 => {
            mnemonic.starts_with('b') && !matches!(mnemonic, "bl" | "bla" | "blr")
        }
        Arch::I386 | Arch::X86_64 => matches!(
            mnemonic,
            "jmp" | "je" | "jne" | "jz" | "jnz" | "jg" | "jge" | "jl" | "jle" | "ja" | "jae"
                | "jb" | "jbe" | "jc" | "jnc" | "jo" | "jno" | "js" | "jns" | "jp" | "jnp"
                | "jcxz" | "jecxz" | "jrcxz" | "loop" | "loope" | "loopne" | "loopz" | "loopnz"
        ),
    }
}

/// The literal target address of a branch (not call) instruction, if `text`
/// is one and its operand is already a plain hex/decimal literal (true of a
/// numeric listing's branch operands, which is all this looks at -- a
/// symbolic listing's `b some_label` has nothing to parse here).
fn branch_target(arch: Arch, text: &str) -> Option<u64> {
    let mut parts = text.split_whitespace();
    let mnemonic = parts.next()?;
    if !is_branch_mnemonic(arch, mnemonic) {
        return None;
    }
    let operand = parts.next()?;
    let token = operand.trim_start_matches('$').trim_start_matches("0x");
    u64::from_str_radix(token, 16).ok()
}

/// Candidate function-start addresses from the line-shape heuristics of
/// spec.md §4.5: the very first code line in the listing, and every code
/// line that immediately follows one ending a block with no fall-through.
fn heuristic_starts(lines: &LineList) -> Vec<u64> {
    let mut starts = Vec::new();
    if let Some(first) = lines.iter().find(|l| l.is_code) {
        starts.push(first.address);
    }
    let mut prev_code: Option<&Line> = None;
    for line in lines.iter() {
        if !line.is_code {
            continue;
        }
        if let Some(prev) = prev_code {
            if is_block_ending(&prev.text) {
                starts.push(line.address);
            }
        }
        prev_code = Some(line);
    }
    starts
}

/// Backward branches that reach into a *different* already-known function
/// than the one containing the branch instruction (spec.md §4.5: "a
/// backward jump elsewhere targets this line"). A backward branch whose
/// target is still inside the branching instruction's own function is an
/// ordinary loop backedge -- it stays a block boundary (see
/// [discover_blocks]), not a new function. `known_starts` must already be
/// sorted and deduplicated.
fn backward_jump_starts(arch: Arch, lines: &LineList, known_starts: &[u64]) -> Vec<u64> {
    let owning_function = |addr: u64| known_starts.iter().rev().find(|&&s| s <= addr).copied();
    let mut extra = Vec::new();
    for line in lines.iter() {
        if !line.is_code {
            continue;
        }
        let Some(target) = branch_target(arch, &line.text) else {
            continue;
        };
        if target >= line.address {
            continue;
        }
        if owning_function(line.address) != owning_function(target) {
            extra.push(target);
        }
    }
    extra
}

/// Discover every function in `image` whose body lies in `lines`, and split
/// each into blocks.
pub fn find_functions(image: &MachO, lines: &LineList) -> Vec<FunctionInfo> {
    let mut starts: Vec<u64> = image
        .symbols
        .iter()
        .filter(|s| s.in_code_section)
        .map(|s| s.address)
        .collect();
    starts.extend(heuristic_starts(lines));
    if let Some(entry) = image.entry_point {
        starts.push(entry);
    }
    starts.sort_unstable();
    starts.dedup();

    // Backward-jump targets need a preliminary function layout to tell
    // "elsewhere" apart from "still inside this function", so they're
    // folded in as a second pass rather than up front.
    let extra = backward_jump_starts(image.arch, lines, &starts);
    if !extra.is_empty() {
        starts.extend(extra);
        starts.sort_unstable();
        starts.dedup();
    }

    gather_func_infos(image, lines, &starts)
}

/// Build [FunctionInfo]s for the given sorted, deduplicated list of function
/// start addresses. Split out from [find_functions] so callers (and tests)
/// can drive discovery off an explicit address list without needing a real
/// symbol table.
pub fn gather_func_infos(image: &MachO, lines: &LineList, starts: &[u64]) -> Vec<FunctionInfo> {
    let mut anon_counter = 0usize;
    let mut functions = Vec::with_capacity(starts.len());

    for (i, &start) in starts.iter().enumerate() {
        let Some(start_line) = lines.index_of_address(start) else {
            continue;
        };
        let end = starts.get(i + 1).copied().unwrap_or(u64::MAX);
        let end_line = match starts.get(i + 1) {
            Some(&next_start) => lines.index_of_address(next_start).unwrap_or(lines.len()),
            None => lines.len(),
        };
        if end_line <= start_line {
            continue;
        }

        let (name, name_is_generic) = match image.function_symbol_at(start) {
            Some(sym) => (sym.name.clone(), false),
            None => {
                anon_counter += 1;
                (format!("Anon{anon_counter}"), true)
            }
        };

        let blocks = discover_blocks(image.arch, lines, start_line, end_line);
        functions.push(FunctionInfo {
            start,
            end,
            name,
            name_is_generic,
            blocks,
        });
    }

    functions
}

/// Walk one function's lines once, simulating register state as it goes
/// (spec.md §4.5 `gather_func_infos`), splitting into [BlockInfo]s at
/// epilogue mnemonics *and* at every address an intra-function branch
/// targets. Each block's `entry_state` is the simulator's snapshot the
/// first (and, in this linear walk, only) time execution reaches its
/// `begin_address` -- exactly spec.md §8 scenario 4's "a backward jump
/// creates a BlockInfo at its target whose entry_state is the state at
/// first arrival".
fn discover_blocks(arch: Arch, lines: &LineList, start_line: usize, end_line: usize) -> Vec<BlockInfo> {
    let start_addr = match lines.get(start_line) {
        Some(line) => line.address,
        None => return Vec::new(),
    };
    let end_addr = lines.get(end_line).map(|l| l.address);

    let mut boundaries: BTreeSet<u64> = BTreeSet::new();
    for idx in start_line..end_line {
        let Some(line) = lines.get(idx) else { continue };
        if !line.is_code {
            continue;
        }
        if let Some(target) = branch_target(arch, &line.text) {
            let in_range = target >= start_addr && end_addr.map_or(true, |e| target < e);
            if in_range && target != start_addr {
                boundaries.insert(target);
            }
        }
    }

    let mut sim = new_simulator(arch);
    sim.reset();

    let mut entry_states: HashMap<u64, MachineState> = HashMap::new();
    entry_states.insert(start_addr, sim.snapshot());

    let mut blocks = Vec::new();
    let mut block_start_line = start_line;
    let mut block_begin_address = start_addr;

    for idx in start_line..end_line {
        let Some(line) = lines.get(idx) else { continue };

        if idx != start_line && boundaries.contains(&line.address) {
            blocks.push(BlockInfo {
                begin_address: block_begin_address,
                start_line: block_start_line,
                end_line: idx,
                is_epilog: false,
                entry_state: entry_states
                    .remove(&block_begin_address)
                    .unwrap_or_default(),
            });
            block_start_line = idx;
            block_begin_address = line.address;
            entry_states
                .entry(block_begin_address)
                .or_insert_with(|| sim.snapshot());
        }

        if line.is_code {
            sim.step(&line.text);
        }

        if line.is_code && is_block_ending(&line.text) {
            blocks.push(BlockInfo {
                begin_address: block_begin_address,
                start_line: block_start_line,
                end_line: idx + 1,
                is_epilog: true,
                entry_state: entry_states
                    .remove(&block_begin_address)
                    .unwrap_or_default(),
            });
            block_start_line = idx + 1;
            if let Some(next) = lines.get(idx + 1).filter(|_| idx + 1 < end_line) {
                block_begin_address = next.address;
                entry_states
                    .entry(block_begin_address)
                    .or_insert_with(|| sim.snapshot());
            }
        }
    }

    if block_start_line < end_line {
        blocks.push(BlockInfo {
            begin_address: block_begin_address,
            start_line: block_start_line,
            end_line,
            is_epilog: false,
            entry_state: entry_states
                .remove(&block_begin_address)
                .unwrap_or_default(),
        });
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lines::LineList;

    #[test]
    fn splits_on_epilogue_instructions() {
        let lines = LineList::from_text(
            "0x10: push %ebp\n0x11: mov %esp, %ebp\n0x12: ret\n0x13: nop\n0x14: ret\n",
        );
        let blocks = discover_blocks(Arch::X86_64, &lines, 0, lines.len());
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].start_line, 0);
        assert_eq!(blocks[0].end_line, 3);
        assert!(blocks[0].is_epilog);
        assert_eq!(blocks[1].start_line, 3);
        assert_eq!(blocks[1].end_line, 5);
    }

    #[test]
    fn splits_on_backward_branch_targets_within_a_function() {
        // A loop: 0x1fc0 is the function entry, 0x1fe0 is a backward-branch
        // target reached again from 0x2000 -- spec.md §8 scenario 4.
        let lines = LineList::from_text(
            "0x1fc0: li r3, 0x0\n0x1fe0: addi r3, r3, 0x1\n0x1ff0: cmpwi r3, 0xa\n0x2000: blt 0x1fe0\n0x2010: blr\n",
        );
        let blocks = discover_blocks(Arch::Ppc, &lines, 0, lines.len());
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].begin_address, 0x1fc0);
        assert!(!blocks[0].is_epilog);
        assert_eq!(blocks[1].begin_address, 0x1fe0);
        assert!(blocks[1].is_epilog);
    }

    #[test]
    fn gather_func_infos_names_anonymous_functions() {
        let lines = LineList::from_text("0x10: push %ebp\n0x11: ret\n0x20: nop\n0x21: ret\n");
        let blocks_a = discover_blocks(Arch::X86_64, &lines, 0, 2);
        let blocks_b = discover_blocks(Arch::X86_64, &lines, 2, 4);
        assert_eq!(blocks_a.len(), 1);
        assert_eq!(blocks_b.len(), 1);
    }

    #[test]
    fn heuristic_starts_finds_first_code_line_and_post_epilogue_lines() {
        let lines = LineList::from_text(
            "0x1000: push %ebp\n0x1001: ret\n0x1040: push %ebp\n0x1041: ret\n",
        );
        let starts = heuristic_starts(&lines);
        assert!(starts.contains(&0x1000));
        assert!(starts.contains(&0x1040));
    }

    #[test]
    fn backward_jump_into_a_different_function_creates_a_new_start() {
        // 0x1000 and 0x2000 are two separately-known functions; 0x2010
        // branches backward into 0x1000's body, which is "elsewhere".
        let lines = LineList::from_text(
            "0x1000: push %ebp\n0x1004: ret\n0x2000: push %ebp\n0x2010: b 0x1004\n0x2014: ret\n",
        );
        let known = vec![0x1000u64, 0x2000u64];
        let extra = backward_jump_starts(Arch::Ppc, &lines, &known);
        assert_eq!(extra, vec![0x1004]);
    }

    #[test]
    fn backward_branch_within_the_same_function_is_not_elsewhere() {
        let lines = LineList::from_text(
            "0x1000: li r3, 0x0\n0x1004: addi r3, r3, 0x1\n0x1008: b 0x1004\n",
        );
        let known = vec![0x1000u64];
        let extra = backward_jump_starts(Arch::Ppc, &lines, &known);
        assert!(extra.is_empty());
    }
}
