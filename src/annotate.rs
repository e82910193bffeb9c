/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The line annotator (C8): drives the simulator across each function's
//! blocks and turns whatever it and the resolver learn into a trailing
//! comment on the corresponding output line.

use crate::arch::Arch;
use crate::demangle::Demangler;
use crate::error::Result;
use crate::functions::FunctionInfo;
use crate::lines::DualLineList;
use crate::mach_o::MachO;
use crate::objc::ObjcCatalog;
use crate::options::Options;
use crate::resolver::{PointerHint, Resolver};
use crate::sim::{classify_msg_send, find_thunks, new_simulator, Simulator};
use std::cell::RefCell;

/// The per-architecture argument registers used to pass the selector (the
/// second argument) to `objc_msgSend` and its variants, in System V/AAPCS32
/// calling-convention order. i386 passes arguments on the stack instead, so
/// there is no register to read here -- the selector simply isn't recovered
/// for 32-bit x86 binaries, which is a silent degradation, not a bug.
fn selector_register(arch: Arch) -> Option<&'static str> {
    match arch {
        Arch::Ppc | Arch::Ppc64 => Some("r4"),
        Arch::X86_64 => Some("%rsi"),
        Arch::I386 => None,
    }
}

fn receiver_register(arch: Arch) -> Option<&'static str> {
    match arch {
        Arch::Ppc | Arch::Ppc64 => Some("r3"),
        Arch::X86_64 => Some("%rdi"),
        Arch::I386 => None,
    }
}

/// Pull a trailing `0x...`/plain hex literal out of an operand string, the
/// shape a numeric-listing call/branch target or a resolved data reference
/// takes once the disassembler has already done the arithmetic.
fn trailing_hex_literal(operands: &str) -> Option<u64> {
    let token = operands.split_whitespace().last()?;
    let token = token.trim_start_matches('$').trim_start_matches("0x");
    u64::from_str_radix(token, 16).ok()
}

fn call_target(text: &str) -> Option<u64> {
    let operands = text.splitn(2, char::is_whitespace).nth(1)?;
    trailing_hex_literal(operands)
}

/// Mnemonics that actually return to the caller, a narrower set than
/// [crate::functions]'s block-ending mnemonics (which also treats `jmp` and
/// `leave` as ending a block, neither of which returns).
fn is_return_mnemonic(text: &str) -> bool {
    matches!(
        text.split_whitespace().next().unwrap_or(""),
        "ret" | "retn" | "retq" | "blr" | "rfi" | "sysret" | "iret"
    )
}

/// Parse `disp(reg)` out of a memory operand, in either PPC (`8(r4)`) or x86
/// (`8(%eax)`) syntax -- whichever register prefix convention the operand
/// uses is preserved verbatim so it matches what the simulator (C7) tracks.
fn parse_disp_reg(mem: &str) -> Option<(i64, &str)> {
    let (disp, rest) = mem.split_once('(')?;
    let reg = rest.trim_end_matches(')').trim();
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

/// The destination register of an instruction that loads a constant or
/// resolved address into a register -- exactly the mnemonics the simulator
/// itself treats as value-producing (spec.md §4.7, "class pointer tracked
/// through registers").
fn parse_dst_register(arch: Arch, text: &str) -> Option<String> {
    let mut parts = text.split_whitespace();
    let mnemonic = parts.next()?;
    let operands: String = parts.collect::<Vec<_>>().join(" ");
    match arch {
        Arch::Ppc | Arch::Ppc64 => {
            if !matches!(mnemonic, "lis" | "addis" | "ori" | "la" | "li") {
                return None;
            }
            operands.split(',').next().map(|s| s.trim().to_string())
        }
        Arch::I386 | Arch::X86_64 => {
            if !matches!(mnemonic, "mov" | "movl" | "movq" | "lea" | "leaq") {
                return None;
            }
            operands.rsplit(',').next().map(|s| s.trim().to_string())
        }
    }
}

/// An indirect memory load's `(destination, base register, offset)`,
/// restricted to the actual load mnemonics the simulator recognizes (not
/// `lea`, which computes an address rather than dereferencing one).
fn parse_indirect_load(arch: Arch, text: &str) -> Option<(String, String, i64)> {
    let mut parts = text.split_whitespace();
    let mnemonic = parts.next()?;
    let operands: String = parts.collect::<Vec<_>>().join(" ");
    match arch {
        Arch::Ppc | Arch::Ppc64 => {
            if !matches!(mnemonic, "lwz" | "ld" | "lbz" | "lhz") {
                return None;
            }
            let mut fields = operands.splitn(2, ',');
            let dst = fields.next()?.trim().to_string();
            let (offset, base) = parse_disp_reg(fields.next()?.trim())?;
            Some((dst, base.to_string(), offset))
        }
        Arch::I386 | Arch::X86_64 => {
            if !matches!(mnemonic, "mov" | "movl" | "movq") {
                return None;
            }
            let mut fields = operands.rsplitn(2, ',');
            let dst = fields.next()?.trim().to_string();
            let (offset, base) = parse_disp_reg(fields.next()?.trim())?;
            Some((dst, base.to_string(), offset))
        }
    }
}

fn hint_to_comment(hint: &PointerHint) -> String {
    match hint {
        PointerHint::CString(s) => format!("{s:?}"),
        PointerHint::PString(s) => format!("{s:?}"),
        PointerHint::Float4(f) => format!("{f}"),
        PointerHint::Double8(f) => format!("{f}"),
        PointerHint::CfString(s) => format!("@{s:?}"),
        PointerHint::NsString(s) => format!("@{s:?}"),
        PointerHint::ImportedSymbol(name) => name.clone(),
        PointerHint::Symbol(name) => name.clone(),
        PointerHint::DyldStub(name) => name.clone(),
        PointerHint::ObjcClassRef(name) => name.clone(),
        PointerHint::ObjcSelRef(name) => format!("@selector({name})"),
        PointerHint::ObjcSuperRef(name) => format!("super ({name})"),
        PointerHint::ObjcMethod {
            class_name,
            selector,
            is_class_method,
            ..
        } => {
            let prefix = if *is_class_method { '+' } else { '-' };
            format!("{prefix}[{class_name} {selector}]")
        }
        PointerHint::ObjcIvar {
            class_name,
            ivar_name,
            ..
        } => format!("{class_name}->{ivar_name}"),
    }
}

/// Append a return/ivar type suffix to an already-formatted hint comment,
/// gated on the `return_types`/`variable_types` options (spec.md §6) -- off
/// by default, neither option's absence changes anything [hint_to_comment]
/// itself produces.
fn augment_hint_comment(hint: &PointerHint, base: String, options: &Options) -> String {
    match hint {
        PointerHint::ObjcMethod { type_encoding, .. } if options.return_types => {
            format!("{base} ; returns {}", crate::objc::return_type_of(type_encoding))
        }
        PointerHint::ObjcIvar { type_encoding, .. } if options.variable_types => {
            format!("{base} ({})", crate::objc::decode_type_encoding(type_encoding))
        }
        _ => base,
    }
}

/// Drives the simulator and resolver over a whole image's discovered
/// functions, annotating the symbolic listing's lines in place.
pub struct Annotator<'a> {
    image: &'a MachO,
    resolver: Resolver<'a>,
    options: Options,
    /// `None` once `demangle_cpp_names` is off, or if `c++filt` couldn't be
    /// started -- in either case names are just left mangled (spec.md §7).
    demangler: RefCell<Option<Demangler>>,
}

impl<'a> Annotator<'a> {
    pub fn new(image: &'a MachO, catalog: &'a ObjcCatalog, options: Options) -> Annotator<'a> {
        let demangler = if options.demangle_cpp_names {
            match Demangler::spawn("c++filt") {
                Ok(d) => Some(d),
                Err(e) => {
                    log!("{e}, leaving C++ names mangled");
                    None
                }
            }
        } else {
            None
        };
        Annotator {
            image,
            resolver: Resolver::new(image, catalog),
            options,
            demangler: RefCell::new(demangler),
        }
    }

    fn demangle(&self, name: &str) -> String {
        match self.demangler.borrow_mut().as_mut() {
            Some(d) => d.demangle(name),
            None => name.to_string(),
        }
    }

    /// Annotate every line covered by `functions`, appending a trailing
    /// comment to the numeric listing's text (the symbolic listing keeps its
    /// own naming; `lines.symbolic` is annotated with the same comment via
    /// its `alt` cross-link so either listing can be used for final output).
    pub fn annotate(
        &self,
        lines: &mut DualLineList,
        functions: &[FunctionInfo],
        cancelled: Option<&std::sync::atomic::AtomicBool>,
    ) -> Result<()> {
        // PC-anchor thunks are plain functions, found once across the whole
        // image rather than per block (spec.md §4.7/§8 scenario 6).
        let thunks = find_thunks(&lines.numeric);

        for function in functions {
            if cancelled.is_some_and(|flag| flag.load(std::sync::atomic::Ordering::Relaxed)) {
                return Err(crate::error::AnnotateError::Cancelled);
            }
            // If this whole function is a known method's implementation,
            // its `ret`/`blr` lines get a return-type comment.
            let method_return_type = if self.options.return_statements {
                self.resolver
                    .method_at(function.start)
                    .map(|(_, m)| crate::objc::return_type_of(&m.type_encoding))
            } else {
                None
            };
            let mut sim = new_simulator(self.image.arch);

            for block in &function.blocks {
                // The discovery pass (C5, functions::gather_func_infos)
                // already walked this function once and recorded, per
                // block, the state the first time control reached it --
                // restore that now instead of carrying state forward from
                // whatever block happens to precede this one in line order.
                sim.restore(&block.entry_state);

                for line_idx in block.start_line..block.end_line {
                    let (comment, set_class_ptr, thunk_hit) = {
                        let Some(line) = lines.numeric.get(line_idx) else {
                            continue;
                        };
                        let mut effect = self.effect_for_line(sim.as_ref(), &line.text);
                        if let Some(return_type) = method_return_type {
                            if is_return_mnemonic(&line.text) {
                                effect.comment = Some(match effect.comment {
                                    Some(c) => format!("{c}; returns {return_type}"),
                                    None => format!("returns {return_type}"),
                                });
                            }
                        }
                        let thunk_hit = thunks
                            .get(&call_target(&line.text).unwrap_or(u64::MAX))
                            .filter(|_| matches!(line.text.split_whitespace().next(), Some("call" | "callq" | "bl" | "bla")))
                            .cloned()
                            .zip(lines.numeric.get(line_idx + 1).map(|l| l.address));
                        sim.step(&line.text);
                        (effect.comment, effect.set_class_ptr, thunk_hit)
                    };
                    if let Some((dst, class_name)) = set_class_ptr {
                        sim.set_class_ptr(&dst, class_name);
                    }
                    if let Some((reg, return_addr)) = thunk_hit {
                        sim.set_value(&reg, return_addr);
                    }
                    if let Some(comment) = comment {
                        if let Some(line) = lines.numeric.get_mut(line_idx) {
                            line.text = format!("{} ; {}", line.text, comment);
                        }
                        if let Some(alt_idx) = lines.numeric.get(line_idx).and_then(|l| l.alt) {
                            if let Some(sym_line) = lines.symbolic.get_mut(alt_idx) {
                                sym_line.text = format!("{} ; {}", sym_line.text, comment);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn effect_for_line(&self, sim: &dyn Simulator, text: &str) -> LineEffect {
        let empty = LineEffect { comment: None, set_class_ptr: None };
        let Some(mnemonic) = text.split_whitespace().next() else {
            return empty;
        };
        let is_transfer = matches!(
            mnemonic,
            "call" | "callq" | "bl" | "b" | "ba" | "jmp" | "je" | "jne"
        );
        if is_transfer {
            return LineEffect {
                comment: self.comment_for_transfer(sim, text),
                set_class_ptr: None,
            };
        }

        // An indirect load through a register the simulator already knows
        // holds a class pointer resolves as an ivar access, independent of
        // whatever else the section registry says about the target address.
        if let Some((_, base, offset)) = parse_indirect_load(self.image.arch, text) {
            if let Some(class_name) = sim.class_ptr_of(&base) {
                if let Some(hint) = self.resolver.resolve_ivar(class_name, offset as u64) {
                    let comment = augment_hint_comment(&hint, hint_to_comment(&hint), &self.options);
                    return LineEffect {
                        comment: Some(comment),
                        set_class_ptr: None,
                    };
                }
            }
        }

        let Some(hint) = self.comment_for_data_reference(text) else {
            return empty;
        };
        let set_class_ptr = match &hint {
            PointerHint::ObjcClassRef(name) => {
                parse_dst_register(self.image.arch, text).map(|dst| (dst, name.clone()))
            }
            _ => None,
        };
        let comment = augment_hint_comment(&hint, hint_to_comment(&hint), &self.options);
        LineEffect {
            comment: Some(comment),
            set_class_ptr,
        }
    }

    fn comment_for_transfer(&self, sim: &dyn Simulator, text: &str) -> Option<String> {
        let target = call_target(text)?;
        let hint = self.resolver.resolve(target)?;

        if let PointerHint::ImportedSymbol(name) | PointerHint::Symbol(name) = &hint {
            if self.options.verbose_msg_sends {
                if let Some(comment) = self.msg_send_comment(sim, name) {
                    return Some(comment);
                }
            }
            return Some(self.demangle(name));
        }
        Some(augment_hint_comment(&hint, hint_to_comment(&hint), &self.options))
    }

    fn msg_send_comment(&self, sim: &dyn Simulator, target_symbol: &str) -> Option<String> {
        let variant = classify_msg_send(target_symbol)?;
        use crate::sim::MsgSendVariant::*;
        let is_super = matches!(variant, SendSuper | SendSuperStret);

        let sel_reg = selector_register(self.image.arch)?;
        let sel_addr = sim.value_of(sel_reg)?;
        let selector = self.image.cstr_at(sel_addr)?;

        let class_name = if is_super {
            "super".to_string()
        } else {
            receiver_register(self.image.arch)
                .and_then(|r| sim.value_of(r))
                .and_then(|addr| self.resolver.resolve(addr))
                .map(|hint| hint_to_comment(&hint))
                .unwrap_or_else(|| "?".to_string())
        };

        Some(format!("-[{class_name} {selector}]"))
    }

    fn comment_for_data_reference(&self, text: &str) -> Option<PointerHint> {
        let operands = text.splitn(2, char::is_whitespace).nth(1)?;
        let addr = trailing_hex_literal(operands)?;
        self.resolver.resolve(addr)
    }
}

/// What annotating one line learned: an optional trailing comment, and an
/// optional class-pointer fact to record in the simulator once the line has
/// been stepped over.
struct LineEffect {
    comment: Option<String>,
    set_class_ptr: Option<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_hex_literal_parses_operand_tail() {
        assert_eq!(trailing_hex_literal("$0x1000"), Some(0x1000));
        assert_eq!(trailing_hex_literal("-8(%ebp), 0x2000"), Some(0x2000));
        assert_eq!(trailing_hex_literal("%eax"), None);
    }

    #[test]
    fn hint_formatting_matches_expected_shapes() {
        assert_eq!(
            hint_to_comment(&PointerHint::CString("hi".to_string())),
            "\"hi\""
        );
        assert_eq!(
            hint_to_comment(&PointerHint::ObjcMethod {
                class_name: "Foo".to_string(),
                selector: "bar".to_string(),
                is_class_method: true,
                type_encoding: "v@:".to_string(),
            }),
            "+[Foo bar]"
        );
        assert_eq!(
            hint_to_comment(&PointerHint::ObjcIvar {
                class_name: "Foo".to_string(),
                ivar_name: "_bar".to_string(),
                type_encoding: "i".to_string(),
            }),
            "Foo->_bar"
        );
    }

    #[test]
    fn parses_indirect_load_operands_for_both_syntaxes() {
        assert_eq!(
            parse_indirect_load(Arch::X86_64, "movq 8(%rax), %rbx"),
            Some(("%rbx".to_string(), "%rax".to_string(), 8))
        );
        assert_eq!(
            parse_indirect_load(Arch::Ppc, "lwz r5, 12(r3)"),
            Some(("r5".to_string(), "r3".to_string(), 12))
        );
        assert_eq!(parse_indirect_load(Arch::X86_64, "mov $0x10, %eax"), None);
    }

    #[test]
    fn parses_dst_register_for_load_shaped_mnemonics() {
        assert_eq!(
            parse_dst_register(Arch::X86_64, "lea 0x1000(%rip), %rcx"),
            Some("%rcx".to_string())
        );
        assert_eq!(
            parse_dst_register(Arch::Ppc, "lis r3, 0x1000"),
            Some("r3".to_string())
        );
    }
}
