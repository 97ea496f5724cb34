use colored::Colorize;
use iced_x86::{FastFormatter, Instruction};
use std::fmt;

/// Gadget flavor, named after the terminator that ends the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GadgetKind {
	Rop,
	Jop,
	Sys,
}

impl GadgetKind {
	pub fn as_str(self) -> &'static str {
		match self {
			GadgetKind::Rop => "rop",
			GadgetKind::Jop => "jop",
			GadgetKind::Sys => "sys",
		}
	}
}

impl fmt::Display for GadgetKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Which gadget kinds a scan admits. Mirrors the `type` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindFilter {
	All,
	Only(GadgetKind),
}

impl KindFilter {
	pub fn admits(self, kind: GadgetKind) -> bool {
		match self {
			KindFilter::All => true,
			KindFilter::Only(k) => k == kind,
		}
	}
}

fn formatter() -> FastFormatter {
	let mut formatter = FastFormatter::new();
	let options = formatter.options_mut();
	options.set_use_hex_prefix(true);
	options.set_space_after_operand_separator(true);
	// Keep memory operands address-independent so identical byte sequences at
	// different addresses share one fingerprint.
	options.set_rip_relative_addresses(true);
	formatter
}

/// Canonical text of a single instruction, as used in gadget fingerprints.
pub fn instruction_text(instruction: &Instruction) -> String {
	let mut formatter = formatter();
	let mut text = String::new();
	formatter.format(instruction, &mut text);
	text
}

/// An instruction sequence ending in a control-flow transfer.
///
/// `text` is the `; `-joined Intel-syntax rendering of the instructions and
/// doubles as the fingerprint: it carries no addresses, so two gadgets with
/// the same decoded instructions are interchangeable for de-duplication no
/// matter where they live.
#[derive(Debug, Clone)]
pub struct Gadget {
	address: u64,
	offset: u64,
	link_address: u64,
	bytes: Vec<u8>,
	instructions: Vec<Instruction>,
	kind: GadgetKind,
	text: String,
}

impl Gadget {
	pub fn new(
		address: u64,
		offset: u64,
		link_address: u64,
		bytes: Vec<u8>,
		instructions: Vec<Instruction>,
		kind: GadgetKind,
	) -> Self {
		let mut formatter = formatter();
		let mut text = String::new();
		for (i, instruction) in instructions.iter().enumerate() {
			if i > 0 {
				text.push_str("; ");
			}
			formatter.format(instruction, &mut text);
		}
		Self { address, offset, link_address, bytes, instructions, kind, text }
	}

	pub fn address(&self) -> u64 { self.address }

	/// Offset of the gadget within the binary file.
	pub fn offset(&self) -> u64 { self.offset }

	/// Recomputes the effective address after an image-base change. With a
	/// base the address is `base + file offset`, without one the link-time
	/// address.
	pub fn rebase(&mut self, image_base: Option<u64>) {
		self.address = match image_base {
			Some(base) => base + self.offset,
			None => self.link_address,
		};
	}

	pub fn bytes(&self) -> &[u8] { &self.bytes }

	pub fn instructions(&self) -> &[Instruction] { &self.instructions }

	pub fn kind(&self) -> GadgetKind { self.kind }

	pub fn text(&self) -> &str { &self.text }

	/// De-dup identity: the address-free textual form.
	pub fn fingerprint(&self) -> &str { &self.text }

	/// True iff the little-endian encoding of the gadget address contains any
	/// of the forbidden byte values. `pointer_width` is the architecture's.
	pub fn address_contains(&self, badbytes: &[u8], pointer_width: usize) -> bool {
		self.address.to_le_bytes()[..pointer_width]
			.iter()
			.any(|b| badbytes.contains(b))
	}

	/// One-line rendering; `detailed` adds per-instruction addresses and bytes.
	pub fn render(&self, detailed: bool) -> String {
		let mut out = format!(
			"{}: {}",
			format!("{:#010x}", self.address).red(),
			self.text
		);
		if detailed {
			let mut formatter = formatter();
			let mut offset = 0usize;
			for instruction in &self.instructions {
				let encoding = &self.bytes[offset..offset + instruction.len()];
				let hex = encoding
					.iter()
					.map(|b| format!("{b:02x}"))
					.collect::<String>();
				let mut line = String::new();
				formatter.format(instruction, &mut line);
				// derive the line address from the gadget address so a
				// rebase does not leave stale instruction pointers
				out.push_str(&format!(
					"\n  {:#010x}: {hex:<16} {line}",
					self.address + offset as u64
				));
				offset += instruction.len();
			}
		}
		out
	}
}
