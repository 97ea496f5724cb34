use crate::{
	error::{Error, Result},
	search::Searcher,
};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
	Little,
	Big,
}

/// Architecture descriptor. Identity is the canonical name; two loaders are
/// compatible iff their descriptors compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
	X86,
	X86_64,
	Aarch64,
}

impl Arch {
	pub fn name(self) -> &'static str {
		match self {
			Arch::X86 => "x86",
			Arch::X86_64 => "x86_64",
			Arch::Aarch64 => "aarch64",
		}
	}

	pub fn pointer_width(self) -> usize {
		match self {
			Arch::X86 => 4,
			Arch::X86_64 | Arch::Aarch64 => 8,
		}
	}

	pub fn endianness(self) -> Endian { Endian::Little }

	/// Decoder bitness for the x86 family. Scanning any other architecture is
	/// a disassembler error since the backend only decodes x86.
	pub fn bitness(self) -> Result<u32> {
		match self {
			Arch::X86 => Ok(32),
			Arch::X86_64 => Ok(64),
			other => Err(Error::Disassembler(format!(
				"no decoder for architecture {}",
				other.name()
			))),
		}
	}

	pub fn searcher(self) -> Searcher { Searcher::new(self) }

	pub fn from_elf_machine(machine: u16) -> Result<Self> {
		use goblin::elf::header::{EM_386, EM_AARCH64, EM_X86_64};
		match machine {
			EM_386 => Ok(Arch::X86),
			EM_X86_64 => Ok(Arch::X86_64),
			EM_AARCH64 => Ok(Arch::Aarch64),
			other => Err(Error::Loader(format!("unsupported ELF machine {other:#x}"))),
		}
	}

	pub fn from_pe_machine(machine: u16) -> Result<Self> {
		use goblin::pe::header::{COFF_MACHINE_ARM64, COFF_MACHINE_X86, COFF_MACHINE_X86_64};
		match machine {
			COFF_MACHINE_X86 => Ok(Arch::X86),
			COFF_MACHINE_X86_64 => Ok(Arch::X86_64),
			COFF_MACHINE_ARM64 => Ok(Arch::Aarch64),
			other => Err(Error::Loader(format!("unsupported PE machine {other:#x}"))),
		}
	}
}

impl fmt::Display for Arch {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

impl FromStr for Arch {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		match s.to_ascii_lowercase().as_str() {
			"x86" | "i386" | "x86_32" => Ok(Arch::X86),
			"x86_64" | "x64" | "amd64" => Ok(Arch::X86_64),
			"aarch64" | "arm64" => Ok(Arch::Aarch64),
			other => Err(Error::Loader(format!("unknown architecture: {other}"))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn names_round_trip() {
		for arch in [Arch::X86, Arch::X86_64, Arch::Aarch64] {
			assert_eq!(arch.name().parse::<Arch>().unwrap(), arch);
		}
	}

	#[test]
	fn pointer_widths() {
		assert_eq!(Arch::X86.pointer_width(), 4);
		assert_eq!(Arch::X86_64.pointer_width(), 8);
		assert_eq!(Arch::Aarch64.pointer_width(), 8);
	}

	#[test]
	fn no_decoder_for_aarch64() {
		assert!(Arch::Aarch64.bitness().is_err());
		assert_eq!(Arch::X86_64.bitness().unwrap(), 64);
	}
}
