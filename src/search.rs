use crate::{
	arch::Arch,
	binary::Binary,
	error::Result,
	gadget::Gadget,
};
use regex::{bytes, Regex};

/// Printable runs of length >= 2, the default string-search pattern.
pub const DEFAULT_STRING_PATTERN: &str = "[ -~]{2}[ -~]*";

/// Compiles user patterns over instruction text into predicates. Supplied by
/// the architecture descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Searcher {
	arch: Arch,
}

impl Searcher {
	pub(crate) fn new(arch: Arch) -> Self { Self { arch } }

	pub fn arch(&self) -> Arch { self.arch }

	/// Turns a user pattern into a regex: metacharacters are literal, `?`
	/// matches one printable character and `%` any printable run.
	pub fn prepare_filter(&self, pattern: &str) -> String {
		let mut prepared = String::with_capacity(pattern.len());
		for c in pattern.chars() {
			match c {
				'?' => prepared.push_str("[ -~]"),
				'%' => prepared.push_str("[ -~]*"),
				c if regex_syntax_char(c) => {
					prepared.push('\\');
					prepared.push(c);
				}
				c => prepared.push(c),
			}
		}
		prepared
	}

	pub fn compile(&self, pattern: &str) -> Result<Regex> {
		Ok(Regex::new(&self.prepare_filter(pattern))?)
	}

	/// Lazy search over a gadget sequence. `quality` bounds the number of
	/// instructions preceding the terminator; lower is better.
	pub fn search<'g>(
		&self,
		gadgets: &'g [Gadget],
		pattern: &str,
		quality: Option<usize>,
	) -> Result<impl Iterator<Item = &'g Gadget>> {
		let regex = self.compile(pattern)?;
		Ok(gadgets
			.iter()
			.filter(move |&gadget| matches(&regex, gadget, quality)))
	}
}

/// The search predicate, shared with the service's cross-file search.
pub fn matches(regex: &Regex, gadget: &Gadget, quality: Option<usize>) -> bool {
	if let Some(quality) = quality {
		if gadget.instructions().len() > quality + 1 {
			return false;
		}
	}
	regex.is_match(gadget.text())
}

fn regex_syntax_char(c: char) -> bool {
	matches!(
		c,
		'\\' | '.' | '+' | '*' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|'
	)
}

/// Scans the binary's data sections for the pattern (default: printable runs)
/// and returns `(virtual address, matched bytes)` pairs, rebased onto the
/// image base when one is set.
pub fn search_strings(binary: &Binary, pattern: Option<&str>) -> Result<Vec<(u64, Vec<u8>)>> {
	let searcher = binary.arch().searcher();
	let pattern = match pattern {
		None | Some("") => DEFAULT_STRING_PATTERN.to_string(),
		Some(pattern) => searcher.prepare_filter(pattern),
	};
	let regex = bytes::Regex::new(&pattern)?;
	let mut found = Vec::new();
	for section in binary.data_sections() {
		let va = section.va(binary.image_base());
		for m in regex.find_iter(section.bytes()) {
			found.push((va + m.start() as u64, m.as_bytes().to_vec()));
		}
	}
	Ok(found)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gadget::GadgetKind;
	use iced_x86::{Decoder, DecoderOptions};

	fn gadget(bytes: &[u8], address: u64) -> Gadget {
		let mut decoder = Decoder::with_ip(64, bytes, address, DecoderOptions::NONE);
		let mut instructions = Vec::new();
		while decoder.can_decode() {
			instructions.push(decoder.decode());
		}
		Gadget::new(address, address, address, bytes.to_vec(), instructions, GadgetKind::Rop)
	}

	#[test]
	fn wildcards_expand_to_printable_classes() {
		let searcher = Arch::X86_64.searcher();
		assert_eq!(searcher.prepare_filter("pop r?x"), "pop r[ -~]x");
		assert_eq!(searcher.prepare_filter("mov%"), "mov[ -~]*");
		assert_eq!(searcher.prepare_filter("a+b"), "a\\+b");
	}

	#[test]
	fn search_filters_by_pattern_and_quality() {
		let gadgets = vec![
			gadget(&[0x58, 0xc3], 0x1000),             // pop rax; ret
			gadget(&[0x58, 0x5b, 0xc3], 0x2000),       // pop rax; pop rbx; ret
			gadget(&[0xff, 0xe0], 0x3000),             // jmp rax
		];
		let searcher = Arch::X86_64.searcher();
		let hits = searcher
			.search(&gadgets, "pop%", None)
			.unwrap()
			.collect::<Vec<_>>();
		assert_eq!(hits.len(), 2);
		let tight = searcher
			.search(&gadgets, "pop%", Some(1))
			.unwrap()
			.collect::<Vec<_>>();
		assert_eq!(tight.len(), 1);
		assert_eq!(tight[0].address(), 0x1000);
	}

	#[test]
	fn string_search_finds_printable_runs() {
		let mut bytes = vec![0x00];
		bytes.extend_from_slice(b"/bin/sh");
		bytes.push(0x00);
		let binary = Binary::open("blob", Some(bytes), true, Some(crate::arch::Arch::X86_64))
			.unwrap();
		let found = search_strings(&binary, None).unwrap();
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].0, 1);
		assert_eq!(found[0].1, b"/bin/sh");
	}

	#[test]
	fn string_search_rebases_addresses() {
		let mut binary = Binary::open(
			"blob",
			Some(b"\x00hello\x00".to_vec()),
			true,
			Some(crate::arch::Arch::X86_64),
		)
		.unwrap();
		binary.set_image_base(Some(0x400000));
		let found = search_strings(&binary, Some("hello")).unwrap();
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].0, 0x400001);
	}
}
