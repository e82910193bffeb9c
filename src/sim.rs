/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The per-function register/stack simulator (C7).
//!
//! This does not decode machine code (re-disassembly is an explicit
//! non-goal) -- it pattern-matches against the mnemonic/operand text the
//! disassembly listing already contains, tracking just enough state
//! (constant loads, `lea`/`addis`+`ori` pair construction, argument
//! registers) to let the annotator (C8) resolve what a `call`/`bl` target
//! or a memory operand actually refers to.
//!
//! Each architecture gets its own [Simulator] implementation, grounded in
//! `examples/original_source/src/source/ObjcTypes.h`'s per-processor-class
//! specialization (`Exe32Processor`, `X86Processor`, `PPC64Processor`,
//! `X8664Processor`) rather than one shared state machine: PPC/PPC64 track
//! `LR`/`CTR` in addition to general registers, while i386/x86-64 track a
//! shadow of the last several stack slots instead.

use std::collections::HashMap;

/// A snapshot of everything the simulator currently believes about register
/// (and, on x86, stack) contents. Taken at the start of a [crate::functions::BlockInfo]
/// and restored there again if control re-enters the block from somewhere
/// the simulator didn't track (first-entry-wins: only the first time a
/// block is reached is its incoming state recorded).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineState {
    pub registers: HashMap<String, u64>,
    pub stack: Vec<Option<u64>>,
    /// Register -> class name, for registers the simulator has seen loaded
    /// from an Objective-C class reference. Lets a later indirect load
    /// through the same register (`mov 8(%eax), %ecx` style) be resolved as
    /// an ivar access instead of a bare numeric offset (spec.md §4.7,
    /// "indirect loads through a known class pointer").
    pub class_ptr: HashMap<String, String>,
}

/// The seven `objc_msgSend` family entry points the annotator recognizes and
/// expands into `-[Class sel]`/`+[Class sel]` comments (spec.md §6,
/// `verbose_msg_sends`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgSendVariant {
    Send,
    SendRtp,
    SendSuper,
    SendStret,
    SendSuperStret,
    SendFpret,
    SendVariadic,
}

pub fn classify_msg_send(symbol: &str) -> Option<MsgSendVariant> {
    Some(match symbol {
        "_objc_msgSend" => MsgSendVariant::Send,
        "_objc_msgSend_rtp" => MsgSendVariant::SendRtp,
        "_objc_msgSendSuper" | "_objc_msgSendSuper2" => MsgSendVariant::SendSuper,
        "_objc_msgSend_stret" => MsgSendVariant::SendStret,
        "_objc_msgSendSuper_stret" | "_objc_msgSendSuper2_stret" => MsgSendVariant::SendSuperStret,
        "_objc_msgSend_fpret" | "_objc_msgSend_fp2ret" => MsgSendVariant::SendFpret,
        "_objc_msgSend_variadic" => MsgSendVariant::SendVariadic,
        _ => return None,
    })
}

pub trait Simulator {
    /// Reset all tracked state (called at the start of a function).
    fn reset(&mut self);
    /// Process one disassembled instruction's mnemonic and operand text.
    fn step(&mut self, text: &str);
    /// The currently-known constant value of a register, if any.
    fn value_of(&self, register: &str) -> Option<u64>;
    /// Force a register to a known value, bypassing decoding. Used by the
    /// thunk-call special case (spec.md §4.7): after a `call`/`bl` to a
    /// recognized PC-anchor thunk, the caller knows the thunk's target
    /// register now holds the address right after the call.
    fn set_value(&mut self, register: &str, value: u64);
    /// The class this register is currently known to hold a pointer to, if
    /// the simulator has seen it loaded from a class reference.
    fn class_ptr_of(&self, register: &str) -> Option<&str>;
    /// Record that `register` now holds a pointer to `class_name`, because
    /// the annotator just resolved a load into it as an Objective-C class
    /// reference.
    fn set_class_ptr(&mut self, register: &str, class_name: String);
    fn snapshot(&self) -> MachineState;
    fn restore(&mut self, state: &MachineState);
}

fn parse_hex_imm(s: &str) -> Option<u64> {
    let s = s.trim().trim_start_matches('$').trim_start_matches("0x");
    u64::from_str_radix(s, 16).ok()
}

/// PPC and PPC64: tracks general-purpose registers plus `LR` (link
/// register, the return address) and `CTR` (count register, commonly used
/// for indirect calls/branches via `bctrl`). 32-bit immediate loads are
/// reconstructed from `lis`/`addis` + `ori`/`la` pairs, since neither
/// instruction alone carries the full constant.
#[derive(Debug, Default)]
pub struct PowerPcSimulator {
    registers: HashMap<String, u64>,
    lr: Option<u64>,
    ctr: Option<u64>,
    class_ptr: HashMap<String, String>,
}

impl PowerPcSimulator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Simulator for PowerPcSimulator {
    fn reset(&mut self) {
        self.registers.clear();
        self.lr = None;
        self.ctr = None;
        self.class_ptr.clear();
    }

    fn step(&mut self, text: &str) {
        let mut parts = text.split_whitespace();
        let Some(mnemonic) = parts.next() else { return };
        let operands: String = parts.collect::<Vec<_>>().join(" ");
        let fields: Vec<&str> = operands.split(',').map(str::trim).collect();

        match mnemonic {
            "lis" if fields.len() == 2 => {
                if let Some(imm) = parse_hex_imm(fields[1]) {
                    self.registers.insert(fields[0].to_string(), imm << 16);
                    self.class_ptr.remove(fields[0]);
                }
            }
            "addis" | "ori" | "la" if fields.len() == 3 => {
                if let (Some(&base), Some(imm)) =
                    (self.registers.get(fields[1]), parse_hex_imm(fields[2]))
                {
                    let value = if mnemonic == "addis" {
                        base.wrapping_add(imm << 16)
                    } else {
                        base | imm
                    };
                    self.registers.insert(fields[0].to_string(), value);
                } else {
                    self.registers.remove(fields[0]);
                }
                self.class_ptr.remove(fields[0]);
            }
            "li" if fields.len() == 2 => {
                if let Some(imm) = parse_hex_imm(fields[1]) {
                    self.registers.insert(fields[0].to_string(), imm);
                }
                self.class_ptr.remove(fields[0]);
            }
            "mr" if fields.len() == 2 => {
                if let Some(&v) = self.registers.get(fields[1]) {
                    self.registers.insert(fields[0].to_string(), v);
                } else {
                    self.registers.remove(fields[0]);
                }
                match self.class_ptr.get(fields[1]).cloned() {
                    Some(class_name) => {
                        self.class_ptr.insert(fields[0].to_string(), class_name);
                    }
                    None => {
                        self.class_ptr.remove(fields[0]);
                    }
                }
            }
            "mflr" if fields.len() == 1 => {
                if let Some(lr) = self.lr {
                    self.registers.insert(fields[0].to_string(), lr);
                }
                self.class_ptr.remove(fields[0]);
            }
            "mtlr" if fields.len() == 1 => {
                self.lr = self.registers.get(fields[0]).copied();
            }
            "mtctr" if fields.len() == 1 => {
                self.ctr = self.registers.get(fields[0]).copied();
            }
            // lwz/ld into a register other than the base invalidates any
            // stale class-pointer belief about the destination; the ivar
            // resolution itself happens in the annotator, which consults
            // class_ptr_of *before* step() runs for this line.
            "lwz" | "ld" | "lbz" | "lhz" if fields.len() == 2 => {
                self.registers.remove(fields[0]);
                self.class_ptr.remove(fields[0]);
            }
            "bl" | "bla" => {
                // A call clobbers every volatile GPR's tracked value except
                // what the callee is defined to preserve; conservatively
                // invalidate everything but r1 (stack pointer) and r2/r13
                // (TOC/thread pointer on the architectures that have one).
                self.registers
                    .retain(|reg, _| matches!(reg.as_str(), "r1" | "r2" | "r13"));
                self.class_ptr
                    .retain(|reg, _| matches!(reg.as_str(), "r1" | "r2" | "r13"));
            }
            _ => (),
        }
    }

    fn value_of(&self, register: &str) -> Option<u64> {
        self.registers.get(register).copied()
    }

    fn set_value(&mut self, register: &str, value: u64) {
        self.registers.insert(register.to_string(), value);
        self.class_ptr.remove(register);
    }

    fn class_ptr_of(&self, register: &str) -> Option<&str> {
        self.class_ptr.get(register).map(String::as_str)
    }

    fn set_class_ptr(&mut self, register: &str, class_name: String) {
        self.class_ptr.insert(register.to_string(), class_name);
    }

    fn snapshot(&self) -> MachineState {
        let mut registers = self.registers.clone();
        if let Some(lr) = self.lr {
            registers.insert("lr".to_string(), lr);
        }
        if let Some(ctr) = self.ctr {
            registers.insert("ctr".to_string(), ctr);
        }
        MachineState {
            registers,
            stack: Vec::new(),
            class_ptr: self.class_ptr.clone(),
        }
    }

    fn restore(&mut self, state: &MachineState) {
        self.registers = state.registers.clone();
        self.lr = self.registers.remove("lr");
        self.ctr = self.registers.remove("ctr");
        self.class_ptr = state.class_ptr.clone();
    }
}

/// i386 and x86-64: tracks general registers plus a shadow of recent stack
/// writes (`iStack`), keyed by displacement from the frame base, which is
/// how arguments spilled to the stack before a call get resolved.
#[derive(Debug, Default)]
pub struct X86Simulator {
    registers: HashMap<String, u64>,
    /// Maps a stack displacement (as written in operand syntax, e.g. `-8`
    /// for `-0x8(%rbp)`) to the last known value stored there.
    stack: HashMap<i64, u64>,
    class_ptr: HashMap<String, String>,
}

impl X86Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_stack_operand(operand: &str) -> Option<i64> {
        let operand = operand.trim();
        let (disp, rest) = operand.split_once('(')?;
        if !rest.starts_with("%rbp") && !rest.starts_with("%ebp") && !rest.starts_with("%rsp") {
            return None;
        }
        let disp = disp.trim();
        if disp.is_empty() {
            return Some(0);
        }
        disp.trim_start_matches('-')
            .trim_start_matches("0x")
            .parse::<i64>()
            .ok()
            .map(|v| if disp.starts_with('-') { -v } else { v })
    }

    /// Parse `disp(%reg)` for any base register, not just the frame-pointer
    /// forms [parse_stack_operand] recognizes. Used to notice an indirect
    /// load through a register the simulator believes holds a class
    /// pointer (spec.md §4.7, ivar resolution), e.g. `movl 8(%eax), %ecx`.
    pub fn parse_indirect_operand(operand: &str) -> Option<(i64, &str)> {
        let operand = operand.trim();
        let (disp, rest) = operand.split_once('(')?;
        let reg = rest.trim_end_matches(')').trim();
        if !reg.starts_with('%') {
            return None;
        }
        let disp = disp.trim();
        if disp.is_empty() {
            return Some((0, reg));
        }
        let value = disp
            .trim_start_matches('-')
            .trim_start_matches("0x")
            .parse::<i64>()
            .ok()?;
        Some((if disp.starts_with('-') { -value } else { value }, reg))
    }
}

impl Simulator for X86Simulator {
    fn reset(&mut self) {
        self.registers.clear();
        self.stack.clear();
        self.class_ptr.clear();
    }

    fn step(&mut self, text: &str) {
        let mut parts = text.split_whitespace();
        let Some(mnemonic) = parts.next() else { return };
        let operands: String = parts.collect::<Vec<_>>().join(" ");
        let fields: Vec<&str> = operands.rsplitn(2, ',').collect();
        if fields.len() != 2 {
            if mnemonic == "call" || mnemonic == "callq" {
                self.registers
                    .retain(|reg, _| matches!(reg.as_str(), "%rbp" | "%ebp" | "%rsp" | "%esp"));
                self.class_ptr
                    .retain(|reg, _| matches!(reg.as_str(), "%rbp" | "%ebp" | "%rsp" | "%esp"));
            }
            return;
        }
        let (src, dst) = (fields[1].trim(), fields[0].trim());

        match mnemonic {
            "mov" | "movl" | "movq" => {
                if let Some(imm) = parse_hex_imm(src) {
                    if let Some(disp) = Self::parse_stack_operand(dst) {
                        self.stack.insert(disp, imm);
                    } else {
                        self.registers.insert(dst.to_string(), imm);
                        self.class_ptr.remove(dst);
                    }
                } else if let Some(disp) = Self::parse_stack_operand(src) {
                    match self.stack.get(&disp) {
                        Some(&v) => {
                            self.registers.insert(dst.to_string(), v);
                        }
                        None => {
                            self.registers.remove(dst);
                        }
                    }
                    self.class_ptr.remove(dst);
                } else if Self::parse_indirect_operand(src).is_some() {
                    // An indirect load through some base register: the
                    // value itself isn't known (the annotator resolves the
                    // ivar separately via the resolver/catalog), but it
                    // certainly isn't still a class pointer.
                    self.registers.remove(dst);
                    self.class_ptr.remove(dst);
                } else if let Some(&v) = self.registers.get(src) {
                    self.registers.insert(dst.to_string(), v);
                    match self.class_ptr.get(src).cloned() {
                        Some(class_name) => {
                            self.class_ptr.insert(dst.to_string(), class_name);
                        }
                        None => {
                            self.class_ptr.remove(dst);
                        }
                    }
                } else {
                    self.registers.remove(dst);
                    self.class_ptr.remove(dst);
                }
            }
            "lea" | "leaq" => {
                // `lea <disp>(%rip), %reg` is the PC-relative addressing
                // form used for string/data references; the disassembler
                // has usually already resolved the absolute target into the
                // operand text as a `0x...` literal.
                if let Some(imm) = parse_hex_imm(src.split('(').next().unwrap_or(src)) {
                    self.registers.insert(dst.to_string(), imm);
                } else {
                    self.registers.remove(dst);
                }
                self.class_ptr.remove(dst);
            }
            _ => (),
        }
    }

    fn value_of(&self, register: &str) -> Option<u64> {
        self.registers.get(register).copied()
    }

    fn set_value(&mut self, register: &str, value: u64) {
        self.registers.insert(register.to_string(), value);
        self.class_ptr.remove(register);
    }

    fn class_ptr_of(&self, register: &str) -> Option<&str> {
        self.class_ptr.get(register).map(String::as_str)
    }

    fn set_class_ptr(&mut self, register: &str, class_name: String) {
        self.class_ptr.insert(register.to_string(), class_name);
    }

    fn snapshot(&self) -> MachineState {
        MachineState {
            registers: self.registers.clone(),
            stack: {
                let max_disp = self.stack.keys().map(|d| d.unsigned_abs()).max().unwrap_or(0);
                (0..=max_disp)
                    .map(|d| self.stack.get(&(d as i64)).copied())
                    .collect()
            },
            class_ptr: self.class_ptr.clone(),
        }
    }

    fn restore(&mut self, state: &MachineState) {
        self.registers = state.registers.clone();
        self.stack.clear();
        for (i, slot) in state.stack.iter().enumerate() {
            if let Some(v) = slot {
                self.stack.insert(i as i64, *v);
            }
        }
        self.class_ptr = state.class_ptr.clone();
    }
}

/// Scan a listing for the x86 PC-anchor thunk pattern: a tiny function that
/// copies the return address off the stack into a register and returns
/// immediately (`___i686.get_pc_thunk.bx`-style, spec.md §4.7/§8 scenario 6).
/// Returns each thunk's entry address mapped to the register it loads.
pub fn find_thunks(lines: &crate::lines::LineList) -> HashMap<u64, String> {
    let mut thunks = HashMap::new();
    let mut iter = lines.iter().peekable();
    while let Some(line) = iter.next() {
        let Some(&next) = iter.peek() else { break };
        let mut parts = line.text.split_whitespace();
        let Some(mnemonic) = parts.next() else { continue };
        if !matches!(mnemonic, "mov" | "movl" | "movq") {
            continue;
        }
        let operands: String = parts.collect::<Vec<_>>().join(" ");
        let mut fields = operands.rsplitn(2, ',');
        let (Some(dst), Some(src)) = (fields.next(), fields.next()) else {
            continue;
        };
        let src = src.trim();
        let is_esp_top = matches!(
            X86Simulator::parse_indirect_operand(src),
            Some((0, reg)) if reg == "%esp" || reg == "%rsp"
        );
        let next_mnemonic = next.text.split_whitespace().next().unwrap_or("");
        if is_esp_top && matches!(next_mnemonic, "ret" | "retq") {
            thunks.insert(line.address, dst.trim().to_string());
        }
    }
    thunks
}

/// Construct the right [Simulator] for `arch`. Shared by the discovery pass
/// (C5, [crate::functions::gather_func_infos]) and the annotation pass (C8,
/// [crate::annotate::Annotator]) so both walk a function's instructions with
/// exactly the same register-tracking semantics.
pub fn new_simulator(arch: crate::arch::Arch) -> Box<dyn Simulator> {
    use crate::arch::Arch;
    match arch {
        Arch::Ppc | Arch::Ppc64 => Box::new(PowerPcSimulator::new()),
        Arch::I386 | Arch::X86_64 => Box::new(X86Simulator::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_msg_send_variants() {
        assert_eq!(classify_msg_send("_objc_msgSend"), Some(MsgSendVariant::Send));
        assert_eq!(
            classify_msg_send("_objc_msgSend_stret"),
            Some(MsgSendVariant::SendStret)
        );
        assert_eq!(classify_msg_send("_memcpy"), None);
    }

    #[test]
    fn ppc_tracks_lis_ori_pair() {
        let mut sim = PowerPcSimulator::new();
        sim.step("lis r3, 0x1");
        sim.step("ori r3, r3, 0x2000");
        assert_eq!(sim.value_of("r3"), Some(0x0001_2000));
    }

    #[test]
    fn ppc_call_invalidates_volatile_registers() {
        let mut sim = PowerPcSimulator::new();
        sim.step("li r3, 0x10");
        sim.step("bl _foo");
        assert_eq!(sim.value_of("r3"), None);
    }

    #[test]
    fn x86_tracks_mov_immediate_and_stack_roundtrip() {
        let mut sim = X86Simulator::new();
        sim.step("movl $0x1234, -8(%ebp)");
        sim.step("movl -8(%ebp), %eax");
        assert_eq!(sim.value_of("%eax"), Some(0x1234));
    }

    #[test]
    fn x86_snapshot_restore_round_trips() {
        let mut sim = X86Simulator::new();
        sim.step("mov $0x42, %eax");
        let snap = sim.snapshot();
        sim.step("mov $0x99, %eax");
        sim.restore(&snap);
        assert_eq!(sim.value_of("%eax"), Some(0x42));
    }

    #[test]
    fn x86_propagates_class_ptr_across_register_moves() {
        let mut sim = X86Simulator::new();
        sim.set_class_ptr("%ecx", "NSArray".to_string());
        sim.step("mov %ecx, %eax");
        assert_eq!(sim.class_ptr_of("%eax"), Some("NSArray"));
        sim.step("movl 8(%eax), %edx");
        assert_eq!(sim.class_ptr_of("%edx"), None);
    }

    #[test]
    fn ppc_propagates_class_ptr_through_mr() {
        let mut sim = PowerPcSimulator::new();
        sim.set_class_ptr("r3", "NSArray".to_string());
        sim.step("mr r4, r3");
        assert_eq!(sim.class_ptr_of("r4"), Some("NSArray"));
    }

    #[test]
    fn finds_x86_get_pc_thunk_pattern() {
        let lines = crate::lines::LineList::from_text(
            "0x100: movl (%esp), %ebx\n0x103: ret\n0x104: nop\n",
        );
        let thunks = find_thunks(&lines);
        assert_eq!(thunks.get(&0x100).map(String::as_str), Some("%ebx"));
        assert!(!thunks.contains_key(&0x104));
    }

    #[test]
    fn set_value_clears_any_stale_class_ptr() {
        let mut sim = X86Simulator::new();
        sim.set_class_ptr("%ebx", "Foo".to_string());
        sim.set_value("%ebx", 0x2000);
        assert_eq!(sim.value_of("%ebx"), Some(0x2000));
        assert_eq!(sim.class_ptr_of("%ebx"), None);
    }
}
