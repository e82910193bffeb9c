/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Drives the whole `C1->C9` pipeline over a hand-built Mach-O byte stream.
//!
//! Unlike touchHLE's own `tests/integration.rs`, which shells out to `clang`
//! and an ARM toolchain to build and run a real iPhone OS test app, this
//! crate never executes guest code and has no Apple toolchain dependency to
//! begin with -- so its integration tests build the smallest Mach-O image
//! that exercises the loader, the function/block splitter, the simulator and
//! resolver, and the writer, entirely in memory.

use mach_annotate::{annotate_image, AnnotationRequest, Arch, Options};

const LC_SEGMENT: u32 = 0x1;
const LC_SYMTAB: u32 = 0x2;
const CPU_TYPE_I386: u32 = 7;
const CPU_TYPE_POWERPC: u32 = 18;
const N_SECT: u8 = 0x0e;
const N_EXT: u8 = 0x01;

fn push_u16(buf: &mut Vec<u8>, v: u16, big: bool) {
    buf.extend_from_slice(&if big { v.to_be_bytes() } else { v.to_le_bytes() });
}

fn push_u32(buf: &mut Vec<u8>, v: u32, big: bool) {
    buf.extend_from_slice(&if big { v.to_be_bytes() } else { v.to_le_bytes() });
}

fn fixed16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

/// Build a minimal, valid, 32-bit, single-segment Mach-O executable: one
/// `__TEXT,__text` section (used only to give the `_foo` symbol somewhere to
/// live; its actual bytes are never decoded, since this crate consumes
/// disassembly listings produced elsewhere, not raw instruction bytes), one
/// `__TEXT,__cstring` section holding a literal string, a one-entry symbol
/// table defining `_foo` at the start of `__text`, and nothing else --
/// enough for [mach_annotate::mach_o::MachO::load_from_bytes] to build a
/// full section registry and symbol table from.
fn build_minimal_macho(big: bool, cputype: u32, cpusubtype: u32) -> Vec<u8> {
    let text_size = 4u32;
    let cstring_size = 3u32; // "hi\0"
    let segment_vmaddr = 0x1000u32;

    let header_size = 28u32;
    let segment_cmdsize = 56 + 2 * 68; // one LC_SEGMENT, two sections
    let symtab_cmdsize = 24u32;
    let sizeofcmds = segment_cmdsize + symtab_cmdsize;
    let commands_end = header_size + sizeofcmds;

    let text_fileoff = commands_end;
    let cstring_fileoff = text_fileoff + text_size;
    let symoff = cstring_fileoff + cstring_size;
    let nsyms = 1u32;
    let stroff = symoff + nsyms * 12;
    // Conventional leading NUL, then "_foo\0".
    let strtab: &[u8] = b"\0_foo\0";
    let strsize = strtab.len() as u32;

    let mut buf = Vec::new();

    // mach_header
    let magic = if big { 0xfeedfaceu32 } else { 0xfeedfaceu32 };
    // Written in the file's own byte order, the same convention every real
    // Mach-O binary follows: read back using that same order, the magic
    // number always comes out as 0xfeedface, regardless of which endianness
    // the binary actually uses.
    push_u32(&mut buf, magic, big);
    push_u32(&mut buf, cputype, big);
    push_u32(&mut buf, cpusubtype, big);
    push_u32(&mut buf, 2, big); // MH_EXECUTE
    push_u32(&mut buf, 2, big); // ncmds
    push_u32(&mut buf, sizeofcmds, big);
    push_u32(&mut buf, 0, big); // flags

    // LC_SEGMENT
    push_u32(&mut buf, LC_SEGMENT, big);
    push_u32(&mut buf, segment_cmdsize, big);
    buf.extend_from_slice(&fixed16("__TEXT"));
    push_u32(&mut buf, segment_vmaddr, big); // vmaddr
    push_u32(&mut buf, text_size + cstring_size, big); // vmsize
    push_u32(&mut buf, text_fileoff, big); // fileoff
    push_u32(&mut buf, text_size + cstring_size, big); // filesize
    push_u32(&mut buf, 7, big); // maxprot
    push_u32(&mut buf, 5, big); // initprot
    push_u32(&mut buf, 2, big); // nsects
    push_u32(&mut buf, 0, big); // flags

    // section 1: __TEXT,__text
    buf.extend_from_slice(&fixed16("__text"));
    buf.extend_from_slice(&fixed16("__TEXT"));
    push_u32(&mut buf, segment_vmaddr, big); // addr
    push_u32(&mut buf, text_size, big); // size
    push_u32(&mut buf, text_fileoff, big); // offset
    push_u32(&mut buf, 0, big); // align
    push_u32(&mut buf, 0, big); // reloff
    push_u32(&mut buf, 0, big); // nreloc
    push_u32(&mut buf, 0x80000400, big); // flags (pure instructions)
    push_u32(&mut buf, 0, big); // reserved1
    push_u32(&mut buf, 0, big); // reserved2

    // section 2: __TEXT,__cstring
    let cstring_vmaddr = segment_vmaddr + text_size;
    buf.extend_from_slice(&fixed16("__cstring"));
    buf.extend_from_slice(&fixed16("__TEXT"));
    push_u32(&mut buf, cstring_vmaddr, big); // addr
    push_u32(&mut buf, cstring_size, big); // size
    push_u32(&mut buf, cstring_fileoff, big); // offset
    push_u32(&mut buf, 0, big); // align
    push_u32(&mut buf, 0, big); // reloff
    push_u32(&mut buf, 0, big); // nreloc
    push_u32(&mut buf, 0, big); // flags
    push_u32(&mut buf, 0, big); // reserved1
    push_u32(&mut buf, 0, big); // reserved2

    // LC_SYMTAB
    push_u32(&mut buf, LC_SYMTAB, big);
    push_u32(&mut buf, symtab_cmdsize, big);
    push_u32(&mut buf, symoff, big);
    push_u32(&mut buf, nsyms, big);
    push_u32(&mut buf, stroff, big);
    push_u32(&mut buf, strsize, big);

    assert_eq!(buf.len() as u32, commands_end);

    // __text: content is never decoded by this crate, just needs to exist.
    buf.extend_from_slice(&[0x90, 0x90, 0x90, 0x90][..text_size as usize]);
    // __cstring: "hi\0"
    buf.extend_from_slice(b"hi\0");

    assert_eq!(buf.len() as u32, symoff);

    // one nlist entry: _foo, N_SECT|N_EXT, section 1, value = segment_vmaddr
    push_u32(&mut buf, 1, big); // n_strx (offset of "_foo" past the leading NUL)
    buf.push(N_SECT | N_EXT); // n_type
    buf.push(1); // n_sect (1-indexed: __text)
    push_u16(&mut buf, 0, big); // n_desc
    push_u32(&mut buf, segment_vmaddr, big); // n_value

    assert_eq!(buf.len() as u32, stroff);
    buf.extend_from_slice(strtab);

    buf
}

#[test]
fn annotates_a_minimal_i386_image() {
    let bytes = build_minimal_macho(false, CPU_TYPE_I386, 3);

    let symbolic = "0x1000: push %ebp\n\
                     0x1001: call _foo\n\
                     0x1002: ret\n\
                     0x1003: dd 0x1004\n";
    let numeric = "0x1000: push %ebp\n\
                    0x1001: call 0x1000\n\
                    0x1002: ret\n\
                    0x1003: dd 0x1004\n";

    let mut options = Options::default();
    // Avoid depending on a `c++filt` binary being present in the test
    // environment; the demangler's own pass-through behavior is covered by
    // `demangle`'s unit tests.
    options.demangle_cpp_names = false;

    let request = AnnotationRequest {
        binary: &bytes,
        arch: Arch::I386,
        name: "minimal.bin".to_string(),
        symbolic_listing: symbolic,
        numeric_listing: numeric,
        options,
    };

    let output = annotate_image(request, None).expect("pipeline should succeed");

    // The call target resolves against the symbol table (C6), and the
    // merge (C4's `choose_lines`) keeps the symbolic side since it names
    // something ("_foo") where the numeric side left a bare address.
    assert!(output.contains("call _foo"));
    assert!(output.contains("; _foo"));

    // The `dd 0x1004` line points at the `__cstring` literal; both listings
    // carry the same base text, so either could win the merge, but the
    // comment itself must be present either way.
    assert!(output.contains("\"hi\""));

    // The header banner names the image and architecture.
    assert!(output.contains("minimal.bin"));
    assert!(output.contains("i386"));
}

#[test]
fn annotates_a_minimal_big_endian_ppc_image() {
    let bytes = build_minimal_macho(true, CPU_TYPE_POWERPC, 0);

    let symbolic = "0x1000: mflr r0\n\
                     0x1001: bl _foo\n\
                     0x1002: blr\n";
    let numeric = "0x1000: mflr r0\n\
                    0x1001: bl 0x1000\n\
                    0x1002: blr\n";

    let request = AnnotationRequest {
        binary: &bytes,
        arch: Arch::Ppc,
        name: "minimal_ppc.bin".to_string(),
        symbolic_listing: symbolic,
        numeric_listing: numeric,
        options: Options::default(),
    };

    let output = annotate_image(request, None).expect("big-endian pipeline should succeed");
    assert!(output.contains("ppc"));
    // A `bl` to the function's own entry resolves to its own symbol name.
    assert!(output.contains("_foo"));
}

#[test]
fn rejects_a_truncated_header() {
    let bytes = vec![0u8; 4];
    let request = AnnotationRequest {
        binary: &bytes,
        arch: Arch::I386,
        name: "too_short.bin".to_string(),
        symbolic_listing: "",
        numeric_listing: "",
        options: Options::default(),
    };
    assert!(annotate_image(request, None).is_err());
}
