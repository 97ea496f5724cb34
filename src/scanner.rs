use crate::{
	binary::{Binary, Section},
	error::{Error, Result},
	gadget::{self, Gadget, GadgetKind, KindFilter},
	rules,
};
use iced_x86::{Decoder, DecoderOptions, Instruction};
use rayon::prelude::*;
use regex::Regex;

/// Scan progress subscriber: `(gadget, index, total)`. Purely informational;
/// a failing subscriber aborts the scan.
pub type ScanProgress<'a> =
	&'a mut dyn FnMut(&Gadget, usize, usize) -> std::result::Result<(), String>;

/// Longest x86 instruction encoding.
const MAX_INSTR_LEN: usize = 15;

/// One executable section plus the addressing context needed to mint gadgets.
struct SectionView<'a> {
	bytes: &'a [u8],
	va: u64,
	file_offset: u64,
	link_va: u64,
	bitness: u32,
}

impl<'a> SectionView<'a> {
	fn new(section: &'a Section, image_base: Option<u64>, bitness: u32) -> Self {
		Self {
			bytes: section.bytes(),
			va: section.va(image_base),
			file_offset: section.offset(),
			link_va: section.virtual_address(),
			bitness,
		}
	}

	fn decode_at(&self, offset: usize) -> Instruction {
		Decoder::with_ip(
			self.bitness,
			&self.bytes[offset..],
			self.va + offset as u64,
			DecoderOptions::NONE,
		)
		.decode()
	}

	fn decoder_at(&self, offset: usize) -> Decoder<'a> {
		Decoder::with_ip(
			self.bitness,
			&self.bytes[offset..],
			self.va + offset as u64,
			DecoderOptions::NONE,
		)
	}

	fn gadget(
		&self,
		start: usize,
		end: usize,
		instructions: Vec<Instruction>,
		kind: GadgetKind,
	) -> Gadget {
		Gadget::new(
			self.va + start as u64,
			self.file_offset + start as u64,
			self.link_va + start as u64,
			self.bytes[start..end].to_vec(),
			instructions,
			kind,
		)
	}
}

fn views<'a>(binary: &'a Binary, bitness: u32) -> Vec<SectionView<'a>> {
	binary
		.executable_sections()
		.map(|section| SectionView::new(section, binary.image_base(), bitness))
		.collect()
}

/// Enumerates all gadget candidates of the binary's executable sections.
///
/// For every terminator the backward walk emits one candidate per start
/// offset that decodes cleanly onto the terminator with at most `inst_count`
/// instructions in total; on a variable-length ISA this yields overlapping
/// candidates by construction. Enumeration order is ascending terminator
/// offset, then ascending start offset, sections in loader order.
pub fn scan(
	binary: &Binary,
	inst_count: usize,
	filter: KindFilter,
	mut progress: Option<ScanProgress<'_>>,
) -> Result<Vec<Gadget>> {
	let bitness = binary.arch().bitness()?;
	let mut gadgets = Vec::new();
	for view in views(binary, bitness) {
		let tails = (0..view.bytes.len())
			.into_par_iter()
			.filter_map(|offset| {
				let instr = view.decode_at(offset);
				rules::classify_tail(&instr, filter).map(|kind| (offset, instr.len(), kind))
			})
			.collect::<Vec<_>>();
		for (tail, tail_len, kind) in tails {
			gadgets_from_tail(&view, tail, tail_len, kind, inst_count, &mut gadgets);
		}
	}
	if let Some(progress) = progress.as_mut() {
		let total = gadgets.len();
		for (i, gadget) in gadgets.iter().enumerate() {
			progress(gadget, i, total).map_err(|reason| Error::SubscriberFailed { reason })?;
		}
	}
	tracing::debug!(file = binary.name(), count = gadgets.len(), "gadget scan finished");
	Ok(gadgets)
}

fn gadgets_from_tail(
	view: &SectionView<'_>,
	tail: usize,
	tail_len: usize,
	kind: GadgetKind,
	inst_count: usize,
	out: &mut Vec<Gadget>,
) {
	let earliest = tail.saturating_sub(MAX_INSTR_LEN * (inst_count - 1));
	for start in earliest..=tail {
		let mut decoder = view.decoder_at(start);
		let mut instructions = Vec::new();
		let mut pos = start;
		let mut valid = true;
		while pos < tail {
			if instructions.len() == inst_count - 1 {
				valid = false;
				break;
			}
			let instr = decoder.decode();
			if !rules::is_gadget_body(&instr) {
				valid = false;
				break;
			}
			pos = start + decoder.position();
			instructions.push(instr);
		}
		if !valid || pos != tail {
			continue;
		}
		instructions.push(decoder.decode());
		out.push(view.gadget(start, tail + tail_len, instructions, kind));
	}
}

fn tail_kind(instructions: &[Instruction]) -> GadgetKind {
	instructions
		.last()
		.and_then(|instr| rules::classify_tail(instr, KindFilter::All))
		.unwrap_or(GadgetKind::Rop)
}

/// Finds `pop <reg>; pop <reg>; ret` triples, the classic SEH-overwrite
/// primitive.
pub fn search_pop_pop_ret(binary: &Binary) -> Result<Vec<Gadget>> {
	let bitness = binary.arch().bitness()?;
	let mut found = Vec::new();
	for view in views(binary, bitness) {
		for offset in 0..view.bytes.len() {
			let mut decoder = view.decoder_at(offset);
			let first = decoder.decode();
			if !rules::is_pop_reg(&first) {
				continue;
			}
			let second = decoder.decode();
			if !rules::is_pop_reg(&second) {
				continue;
			}
			let ret = decoder.decode();
			if rules::classify_tail(&ret, KindFilter::Only(GadgetKind::Rop)).is_none() {
				continue;
			}
			let end = offset + decoder.position();
			found.push(view.gadget(offset, end, vec![first, second, ret], GadgetKind::Rop));
		}
	}
	Ok(found)
}

/// Finds `jmp <reg>` / `call <reg>` instructions for the named registers.
pub fn search_jmp_reg(binary: &Binary, regs: &[String]) -> Result<Vec<Gadget>> {
	let bitness = binary.arch().bitness()?;
	let mut found = Vec::new();
	for view in views(binary, bitness) {
		for offset in 0..view.bytes.len() {
			let instr = view.decode_at(offset);
			if !rules::is_jmp_to_named_reg(&instr, regs) {
				continue;
			}
			found.push(view.gadget(offset, offset + instr.len(), vec![instr], GadgetKind::Jop));
		}
	}
	Ok(found)
}

/// Finds raw occurrences of an opcode byte pattern in executable sections.
/// Occurrences that do not decode to whole instructions are skipped.
pub fn search_opcode(binary: &Binary, opcode: &[u8]) -> Result<Vec<Gadget>> {
	let bitness = binary.arch().bitness()?;
	let mut found = Vec::new();
	if opcode.is_empty() {
		return Ok(found);
	}
	for view in views(binary, bitness) {
		for offset in 0..view.bytes.len().saturating_sub(opcode.len() - 1) {
			if &view.bytes[offset..offset + opcode.len()] != opcode {
				continue;
			}
			// decode within the matched span only
			let span = &view.bytes[offset..offset + opcode.len()];
			let mut decoder =
				Decoder::with_ip(bitness, span, view.va + offset as u64, DecoderOptions::NONE);
			let mut instructions = Vec::new();
			let mut complete = true;
			while decoder.can_decode() {
				let instr = decoder.decode();
				if instr.is_invalid() {
					complete = false;
					break;
				}
				instructions.push(instr);
			}
			if !complete || decoder.position() != opcode.len() {
				continue;
			}
			let kind = tail_kind(&instructions);
			found.push(view.gadget(offset, offset + opcode.len(), instructions, kind));
		}
	}
	Ok(found)
}

/// Matches `;`-separated instruction text (with `?`/`%` wildcards) against
/// the decodings at every executable offset.
pub fn search_instructions(binary: &Binary, code: &str) -> Result<Vec<Gadget>> {
	let bitness = binary.arch().bitness()?;
	let searcher = binary.arch().searcher();
	let parts = code
		.split(';')
		.map(str::trim)
		.filter(|part| !part.is_empty())
		.collect::<Vec<_>>();
	let mut found = Vec::new();
	if parts.is_empty() {
		return Ok(found);
	}
	let pattern = parts
		.iter()
		.map(|part| searcher.prepare_filter(part))
		.collect::<Vec<_>>()
		.join("; ");
	let regex = Regex::new(&format!("^{pattern}$"))?;
	for view in views(binary, bitness) {
		for offset in 0..view.bytes.len() {
			let mut decoder = view.decoder_at(offset);
			let mut instructions = Vec::with_capacity(parts.len());
			let mut valid = true;
			for _ in 0..parts.len() {
				let instr = decoder.decode();
				if instr.is_invalid() {
					valid = false;
					break;
				}
				instructions.push(instr);
			}
			if !valid {
				continue;
			}
			let end = offset + decoder.position();
			let kind = tail_kind(&instructions);
			let candidate = view.gadget(offset, end, instructions, kind);
			if regex.is_match(candidate.text()) {
				found.push(candidate);
			}
		}
	}
	Ok(found)
}

/// Disassembles `length` instructions at `address`, which must be covered by
/// an executable section. A negative length yields `|length|` instructions
/// ending at `address`, the instruction at the address being the last.
pub fn disassemble_address(binary: &Binary, address: u64, length: i64) -> Result<String> {
	let section = binary
		.executable_section_at(address)
		.ok_or(Error::AddressNotMapped { address })?;
	let bitness = binary.arch().bitness()?;
	let view = SectionView::new(section, binary.image_base(), bitness);
	let offset = (address - view.va) as usize;
	let instructions = if length >= 0 {
		decode_forward(&view, offset, length as usize)?
	}
	else {
		decode_backward(&view, offset, length.unsigned_abs() as usize)?
	};
	Ok(instructions
		.iter()
		.map(|instr| format!("{:#010x}: {}", instr.ip(), gadget::instruction_text(instr)))
		.collect::<Vec<_>>()
		.join("\n"))
}

fn decode_forward(view: &SectionView<'_>, offset: usize, count: usize) -> Result<Vec<Instruction>> {
	let mut decoder = view.decoder_at(offset);
	let mut instructions = Vec::with_capacity(count);
	for _ in 0..count {
		if !decoder.can_decode() {
			break;
		}
		let instr = decoder.decode();
		if instr.is_invalid() {
			return Err(Error::Disassembler(format!(
				"cannot disassemble at {:#x}",
				instr.ip()
			)));
		}
		instructions.push(instr);
	}
	Ok(instructions)
}

fn decode_backward(view: &SectionView<'_>, offset: usize, count: usize) -> Result<Vec<Instruction>> {
	// earliest start whose decoding lands exactly on the target wins; the
	// instruction at the target closes the sequence
	let earliest = offset.saturating_sub(MAX_INSTR_LEN * count.saturating_sub(1));
	for start in earliest..=offset {
		let mut decoder = view.decoder_at(start);
		let mut instructions = Vec::new();
		let mut pos = start;
		let mut valid = true;
		while pos < offset {
			let instr = decoder.decode();
			if instr.is_invalid() {
				valid = false;
				break;
			}
			pos = start + decoder.position();
			instructions.push(instr);
		}
		if !valid || pos != offset {
			continue;
		}
		let at_target = decoder.decode();
		if at_target.is_invalid() {
			break;
		}
		instructions.push(at_target);
		let keep = instructions.len().saturating_sub(count);
		return Ok(instructions[keep..].to_vec());
	}
	Err(Error::Disassembler(format!(
		"cannot disassemble backward from {:#x}",
		view.va + offset as u64
	)))
}
