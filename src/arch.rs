/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The closed set of architectures this crate annotates disassembly for.

/// Architecture selector. Chosen by the caller before loading an image; for a
/// fat binary it also picks which slice gets loaded (see [crate::image]).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    Ppc,
    Ppc64,
    I386,
    X86_64,
}

impl Arch {
    /// Width in bytes of a pointer/word for this architecture: 4 for the
    /// 32-bit architectures, 8 for the 64-bit ones.
    pub fn word_size(self) -> u8 {
        match self {
            Arch::Ppc | Arch::I386 => 4,
            Arch::Ppc64 | Arch::X86_64 => 8,
        }
    }

    pub fn is_64bit(self) -> bool {
        self.word_size() == 8
    }

    /// PPC and PPC64 are big-endian; i386 and x86-64 are little-endian. This
    /// is a property of the architecture, independent of what the Mach
    /// header's magic says (which is cross-checked at load time).
    pub fn is_bigend(self) -> bool {
        matches!(self, Arch::Ppc | Arch::Ppc64)
    }

    pub fn name(self) -> &'static str {
        match self {
            Arch::Ppc => "ppc",
            Arch::Ppc64 => "ppc64",
            Arch::I386 => "i386",
            Arch::X86_64 => "x86_64",
        }
    }
}

impl std::str::FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ppc" => Ok(Arch::Ppc),
            "ppc64" => Ok(Arch::Ppc64),
            "i386" => Ok(Arch::I386),
            "x86_64" => Ok(Arch::X86_64),
            _ => Err(format!("Unknown architecture selector: {:?}", s)),
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::Arch;

    #[test]
    fn word_sizes_and_endianness() {
        assert_eq!(Arch::Ppc.word_size(), 4);
        assert_eq!(Arch::Ppc64.word_size(), 8);
        assert_eq!(Arch::I386.word_size(), 4);
        assert_eq!(Arch::X86_64.word_size(), 8);

        assert!(Arch::Ppc.is_bigend());
        assert!(Arch::Ppc64.is_bigend());
        assert!(!Arch::I386.is_bigend());
        assert!(!Arch::X86_64.is_bigend());
    }

    #[test]
    fn parse_round_trip() {
        for arch in [Arch::Ppc, Arch::Ppc64, Arch::I386, Arch::X86_64] {
            assert_eq!(arch.name().parse::<Arch>().unwrap(), arch);
        }
        assert!("sparc".parse::<Arch>().is_err());
    }
}
