use crate::{
	arch::Arch,
	error::{Error, Result},
};
use goblin::{
	elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHT_NOBITS},
	pe::section_table::{IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_EXECUTE},
	Object,
};
use std::{fmt, fs::read, path::Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
	Elf,
	Pe,
	Raw,
}

impl fmt::Display for FileFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			FileFormat::Elf => "ELF",
			FileFormat::Pe => "PE",
			FileFormat::Raw => "raw",
		})
	}
}

/// A named region of the binary with its mapping information and a copy of
/// its file bytes.
#[derive(Debug, Clone)]
pub struct Section {
	name: String,
	virtual_address: u64,
	offset: u64,
	bytes: Vec<u8>,
	executable: bool,
	data: bool,
}

impl Section {
	pub fn name(&self) -> &str { &self.name }

	/// Link-time virtual address, before any image-base override.
	pub fn virtual_address(&self) -> u64 { self.virtual_address }

	pub fn offset(&self) -> u64 { self.offset }

	pub fn size(&self) -> u64 { self.bytes.len() as u64 }

	pub fn bytes(&self) -> &[u8] { &self.bytes }

	pub fn is_executable(&self) -> bool { self.executable }

	pub fn is_data(&self) -> bool { self.data }

	/// Effective virtual address: rebased onto the image base when one is
	/// set, the link-time address otherwise.
	pub fn va(&self, image_base: Option<u64>) -> u64 {
		match image_base {
			Some(base) => base + self.offset,
			None => self.virtual_address,
		}
	}

	pub fn contains(&self, address: u64, image_base: Option<u64>) -> bool {
		let va = self.va(image_base);
		va <= address && address < va + self.size()
	}
}

/// Loader handle for one opened binary: parsed sections plus the two mutable
/// attributes (architecture, image base) the service may rewrite.
pub struct Binary {
	name: String,
	format: FileFormat,
	arch: Arch,
	image_base: Option<u64>,
	sections: Vec<Section>,
}

impl Binary {
	/// Opens a binary. `bytes` overrides reading from disk. With `raw` the
	/// blob is wrapped in a single executable+data section at address 0 and
	/// `arch` must be given; otherwise the format is detected by `goblin`
	/// and `arch`, if present, must agree with the file header.
	pub fn open(name: &str, bytes: Option<Vec<u8>>, raw: bool, arch: Option<Arch>) -> Result<Self> {
		let bytes = match bytes {
			Some(bytes) => bytes,
			None => read(Path::new(name))?,
		};
		if raw {
			let arch = arch.ok_or_else(|| {
				Error::Loader("raw loading requires an explicit architecture".to_string())
			})?;
			return Ok(Self {
				name: name.to_string(),
				format: FileFormat::Raw,
				arch,
				image_base: None,
				sections: vec![Section {
					name: String::from("raw"),
					virtual_address: 0,
					offset: 0,
					bytes,
					executable: true,
					data: true,
				}],
			});
		}
		let (format, parsed_arch, sections) = match Object::parse(&bytes)? {
			Object::Elf(elf) => {
				let arch = Arch::from_elf_machine(elf.header.e_machine)?;
				let sections = elf
					.section_headers
					.iter()
					.filter(|header| {
						header.sh_size > 0
							&& header.sh_flags & u64::from(SHF_ALLOC) != 0
							&& header.sh_type != SHT_NOBITS
					})
					.filter_map(|header| {
						let start = header.sh_offset as usize;
						let end = start.checked_add(header.sh_size as usize)?;
						let bytes = bytes.get(start..end)?.to_vec();
						let executable = header.sh_flags & u64::from(SHF_EXECINSTR) != 0;
						Some(Section {
							name: elf
								.shdr_strtab
								.get_at(header.sh_name)
								.unwrap_or("")
								.to_string(),
							virtual_address: header.sh_addr,
							offset: header.sh_offset,
							bytes,
							executable,
							data: !executable,
						})
					})
					.collect::<Vec<_>>();
				(FileFormat::Elf, arch, sections)
			}
			Object::PE(pe) => {
				let arch = Arch::from_pe_machine(pe.header.coff_header.machine)?;
				let sections = pe
					.sections
					.iter()
					.filter(|section| section.size_of_raw_data > 0)
					.filter_map(|section| {
						let start = section.pointer_to_raw_data as usize;
						let end = start.checked_add(section.size_of_raw_data as usize)?;
						let bytes = bytes.get(start..end)?.to_vec();
						let executable = section.characteristics & IMAGE_SCN_MEM_EXECUTE != 0;
						let data = section.characteristics & IMAGE_SCN_CNT_INITIALIZED_DATA != 0;
						Some(Section {
							name: section.name().unwrap_or("").to_string(),
							virtual_address: pe.image_base as u64 + u64::from(section.virtual_address),
							offset: u64::from(section.pointer_to_raw_data),
							bytes,
							executable,
							data: data && !executable,
						})
					})
					.collect::<Vec<_>>();
				(FileFormat::Pe, arch, sections)
			}
			Object::Unknown(magic) => {
				return Err(Error::Loader(format!("unknown file format (magic {magic:#x})")))
			}
			Object::Mach(_) => {
				return Err(Error::Loader("Mach-O files are not supported".to_string()))
			}
			_ => return Err(Error::Loader("unsupported file format".to_string())),
		};
		if let Some(requested) = arch {
			if requested != parsed_arch {
				return Err(Error::Loader(format!(
					"requested architecture {requested} does not match file header {parsed_arch}"
				)));
			}
		}
		Ok(Self {
			name: name.to_string(),
			format,
			arch: parsed_arch,
			image_base: None,
			sections,
		})
	}

	pub fn name(&self) -> &str { &self.name }

	pub fn format(&self) -> FileFormat { self.format }

	pub fn arch(&self) -> Arch { self.arch }

	pub fn set_arch(&mut self, arch: Arch) { self.arch = arch }

	pub fn image_base(&self) -> Option<u64> { self.image_base }

	pub fn set_image_base(&mut self, base: Option<u64>) { self.image_base = base }

	pub fn sections(&self) -> &[Section] { &self.sections }

	pub fn executable_sections(&self) -> impl Iterator<Item = &Section> {
		self.sections.iter().filter(|s| s.is_executable())
	}

	pub fn data_sections(&self) -> impl Iterator<Item = &Section> {
		self.sections.iter().filter(|s| s.is_data())
	}

	/// The executable section whose effective address range covers `address`.
	pub fn executable_section_at(&self, address: u64) -> Option<&Section> {
		self.executable_sections()
			.find(|s| s.contains(address, self.image_base))
	}
}
