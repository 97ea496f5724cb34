use crate::{
	arch::Arch,
	binary::Binary,
	chain::{self, ChainBuilder, ChainInput, ChainOptions},
	error::{Error, Result},
	filters,
	gadget::Gadget,
	options::{self, OptionChange, Options, OptionValue},
	scanner, search,
};

pub type ScanProgressFn = Box<dyn FnMut(&Gadget, usize, usize) -> std::result::Result<(), String>>;
pub type DedupProgressFn = Box<dyn FnMut(&Gadget, bool, f64) -> std::result::Result<(), String>>;
pub type ChainMessageFn = Box<dyn FnMut(&str) -> std::result::Result<(), String>>;

/// Optional progress subscribers. Absent hooks mean no reporting; a hook
/// returning `Err` aborts the enclosing operation with `SubscriberFailed`.
#[derive(Default)]
pub struct Callbacks {
	pub scan_progress: Option<ScanProgressFn>,
	pub dedup_progress: Option<DedupProgressFn>,
	pub chain_message: Option<ChainMessageFn>,
}

/// Per-binary state: the loader handle, the raw scanner output and the
/// filtered/deduped view derived from it.
///
/// `raw` is unset until a scan runs; the file counts as loaded exactly while
/// `raw` holds a value. `derived` is rebuilt by the service, never coupled to
/// `raw` automatically.
pub struct FileContainer {
	loader: Binary,
	raw: Option<Vec<Gadget>>,
	derived: Option<Vec<Gadget>>,
}

impl FileContainer {
	fn new(loader: Binary) -> Self {
		Self { loader, raw: None, derived: None }
	}

	pub fn name(&self) -> &str { self.loader.name() }

	pub fn arch(&self) -> Arch { self.loader.arch() }

	pub fn loader(&self) -> &Binary { &self.loader }

	pub fn loaded(&self) -> bool { self.raw.is_some() }

	pub fn raw(&self) -> Option<&[Gadget]> { self.raw.as_deref() }

	pub fn derived(&self) -> Option<&[Gadget]> { self.derived.as_deref() }
}

/// Multi-binary gadget service: owns the option registry and the ordered
/// file list, and keeps every derived view consistent with both.
///
/// All files share one architecture; `add_file` enforces it against the
/// first opened file.
pub struct GadgetService {
	options: Options,
	files: Vec<FileContainer>,
	callbacks: Callbacks,
	builders: Vec<Box<dyn ChainBuilder>>,
}

impl GadgetService {
	pub fn new<I>(initial_options: I, callbacks: Callbacks) -> Result<Self>
	where
		I: IntoIterator<Item = (String, OptionValue)>,
	{
		let options = Options::new(initial_options, None)?;
		if options.color() {
			colored::control::set_override(true);
		}
		Ok(Self {
			options,
			files: Vec::new(),
			callbacks,
			builders: Vec::new(),
		})
	}

	pub fn with_defaults() -> Result<Self> { Self::new(Vec::new(), Callbacks::default()) }

	pub fn options(&self) -> &Options { &self.options }

	pub fn files(&self) -> &[FileContainer] { &self.files }

	pub fn file_names(&self) -> impl Iterator<Item = &str> {
		self.files.iter().map(FileContainer::name)
	}

	pub fn get_file(&self, name: &str) -> Option<&FileContainer> {
		self.files.iter().find(|file| file.name() == name)
	}

	fn index_of(&self, name: &str) -> Result<usize> {
		self.files
			.iter()
			.position(|file| file.name() == name)
			.ok_or_else(|| Error::MissingFile { name: name.to_string() })
	}

	/// Writes one option and runs the invalidation dispatch before returning.
	pub fn set_option(&mut self, key: &str, value: OptionValue) -> Result<()> {
		let change = self.options.set(key, value)?;
		self.option_changed(change)
	}

	fn option_changed(&mut self, change: OptionChange) -> Result<()> {
		match change.key {
			options::BADBYTES | options::ALL => {
				tracing::debug!(key = change.key, "rebuilding derived views");
				for idx in 0..self.files.len() {
					Self::prepare(&self.options, &mut self.callbacks, &mut self.files[idx])?;
				}
				Ok(())
			}
			options::COLOR => {
				if let OptionValue::Bool(color) = change.new {
					colored::control::set_override(color);
				}
				Ok(())
			}
			// detailed is read at render time; inst_count and type only
			// shape the next scan
			_ => Ok(()),
		}
	}

	/// Runs the filter pipeline over `raw` into `derived`. No-op on unloaded
	/// files.
	fn prepare(options: &Options, callbacks: &mut Callbacks, file: &mut FileContainer) -> Result<()> {
		let raw = match &file.raw {
			Some(raw) => raw.clone(),
			None => return Ok(()),
		};
		let badbytes = filters::parse_badbytes(options.badbytes())?;
		let width = file.loader.arch().pointer_width();
		let mut gadgets = filters::filter_badbytes(raw, &badbytes, width);
		if !options.keep_all() {
			gadgets = match callbacks.dedup_progress.as_mut() {
				Some(cb) => filters::delete_duplicates(gadgets, Some(cb.as_mut()))?,
				None => filters::delete_duplicates(gadgets, None)?,
			};
		}
		file.derived = Some(gadgets);
		Ok(())
	}

	/// Opens a binary and appends its container. Does not scan.
	pub fn add_file(
		&mut self,
		name: &str,
		bytes: Option<Vec<u8>>,
		arch: Option<Arch>,
		raw: bool,
	) -> Result<()> {
		if self.get_file(name).is_some() {
			return Err(Error::DuplicateFile { name: name.to_string() });
		}
		let loader = Binary::open(name, bytes, raw, arch)?;
		if let Some(first) = self.files.first() {
			if first.arch() != loader.arch() {
				return Err(Error::ArchitectureMismatch {
					existing: first.arch().name().to_string(),
					incoming: loader.arch().name().to_string(),
				});
			}
		}
		tracing::debug!(file = name, arch = loader.arch().name(), "file added");
		self.files.push(FileContainer::new(loader));
		Ok(())
	}

	/// Removes the named container; absent names are ignored.
	pub fn remove_file(&mut self, name: &str) {
		self.files.retain(|file| file.name() != name);
	}

	/// Scans gadgets for one file, or for every file when `name` is `None`,
	/// then rebuilds the derived views.
	pub fn load_gadgets(&mut self, name: Option<&str>) -> Result<()> {
		if let Some(name) = name {
			self.index_of(name)?;
		}
		let inst_count = self.options.inst_count() as usize;
		let filter = self.options.kind_filter();
		for idx in 0..self.files.len() {
			if let Some(name) = name {
				if self.files[idx].name() != name {
					continue;
				}
			}
			let raw = {
				let file = &self.files[idx];
				match self.callbacks.scan_progress.as_mut() {
					Some(cb) => scanner::scan(file.loader(), inst_count, filter, Some(cb.as_mut()))?,
					None => scanner::scan(file.loader(), inst_count, filter, None)?,
				}
			};
			self.files[idx].raw = Some(raw);
			Self::prepare(&self.options, &mut self.callbacks, &mut self.files[idx])?;
		}
		Ok(())
	}

	/// Moves the file's image base. Gadget addresses are rebased and the
	/// filter pipeline re-applied; no re-scan happens.
	pub fn set_image_base(&mut self, name: &str, base: Option<u64>) -> Result<()> {
		let idx = self.index_of(name)?;
		self.files[idx].loader.set_image_base(base);
		if let Some(raw) = self.files[idx].raw.as_mut() {
			for gadget in raw.iter_mut() {
				gadget.rebase(base);
			}
			Self::prepare(&self.options, &mut self.callbacks, &mut self.files[idx])?;
		}
		Ok(())
	}

	/// Rewrites the file's architecture descriptor and invalidates its gadget
	/// collections. Forbidden while other files are open, since every file of
	/// the service must share one architecture.
	pub fn set_architecture(&mut self, name: &str, arch: Arch) -> Result<()> {
		let idx = self.index_of(name)?;
		if self.files.len() > 1 {
			let existing = self
				.files
				.iter()
				.enumerate()
				.find(|(i, _)| *i != idx)
				.map(|(_, file)| file.arch().name().to_string())
				.unwrap_or_default();
			return Err(Error::ArchitectureMismatch {
				existing,
				incoming: arch.name().to_string(),
			});
		}
		let file = &mut self.files[idx];
		file.loader.set_arch(arch);
		file.raw = None;
		file.derived = None;
		Ok(())
	}

	fn selected(&self, name: Option<&str>) -> Result<Vec<&FileContainer>> {
		match name {
			Some(name) => {
				self.index_of(name)?;
				Ok(self.files.iter().filter(|f| f.name() == name).collect())
			}
			None => Ok(self.files.iter().collect()),
		}
	}

	/// Shared plumbing of the specialized scans: run per file, then bad-byte
	/// filter (no dedup).
	fn specialized<F>(&self, name: Option<&str>, scan: F) -> Result<Vec<(String, Vec<Gadget>)>>
	where
		F: Fn(&Binary) -> Result<Vec<Gadget>>,
	{
		let badbytes = filters::parse_badbytes(self.options.badbytes())?;
		let mut out = Vec::new();
		for file in self.selected(name)? {
			out.push((file.name().to_string(), scan(file.loader())?));
		}
		let width = self
			.files
			.first()
			.map(|file| file.arch().pointer_width())
			.unwrap_or(8);
		Ok(filters::filter_badbytes_map(out, &badbytes, width))
	}

	pub fn search_pop_pop_ret(&self, name: Option<&str>) -> Result<Vec<(String, Vec<Gadget>)>> {
		self.specialized(name, scanner::search_pop_pop_ret)
	}

	pub fn search_jmp_reg(
		&self,
		regs: &[String],
		name: Option<&str>,
	) -> Result<Vec<(String, Vec<Gadget>)>> {
		self.specialized(name, |loader| scanner::search_jmp_reg(loader, regs))
	}

	pub fn search_opcode(
		&self,
		opcode: &[u8],
		name: Option<&str>,
	) -> Result<Vec<(String, Vec<Gadget>)>> {
		self.specialized(name, |loader| scanner::search_opcode(loader, opcode))
	}

	pub fn search_instructions(
		&self,
		code: &str,
		name: Option<&str>,
	) -> Result<Vec<(String, Vec<Gadget>)>> {
		self.specialized(name, |loader| scanner::search_instructions(loader, code))
	}

	/// String search over data sections; `(address, bytes)` pairs per file.
	pub fn search_string(
		&self,
		pattern: Option<&str>,
		name: Option<&str>,
	) -> Result<Vec<(String, Vec<(u64, Vec<u8>)>)>> {
		let mut out = Vec::new();
		for file in self.selected(name)? {
			out.push((
				file.name().to_string(),
				search::search_strings(file.loader(), pattern)?,
			));
		}
		Ok(out)
	}

	/// Lazy pattern search over the derived views. A named search requires
	/// the file to be loaded; an unnamed search skips unloaded files.
	pub fn search<'s>(
		&'s self,
		pattern: &str,
		quality: Option<usize>,
		name: Option<&str>,
	) -> Result<impl Iterator<Item = (&'s str, &'s Gadget)> + 's> {
		if let Some(name) = name {
			let file = &self.files[self.index_of(name)?];
			if !file.loaded() {
				return Err(Error::NotLoaded { name: name.to_string() });
			}
		}
		let arch = self.files.first().map(FileContainer::arch).unwrap_or(Arch::X86_64);
		let regex = arch.searcher().compile(pattern)?;
		let name = name.map(str::to_string);
		Ok(self
			.files
			.iter()
			.filter(move |file| name.as_deref().map_or(true, |n| file.name() == n))
			.flat_map(|file| {
				file.derived()
					.unwrap_or(&[])
					.iter()
					.map(move |gadget| (file.name(), gadget))
			})
			.filter(move |&(_, gadget)| search::matches(&regex, gadget, quality)))
	}

	/// Eager, map-shaped collection of [`GadgetService::search`].
	pub fn search_dict(
		&self,
		pattern: &str,
		quality: Option<usize>,
		name: Option<&str>,
	) -> Result<Vec<(String, Vec<Gadget>)>> {
		let mut out: Vec<(String, Vec<Gadget>)> = Vec::new();
		for (file, gadget) in self.search(pattern, quality, name)? {
			match out.iter_mut().find(|(existing, _)| existing.as_str() == file) {
				Some((_, list)) => list.push(gadget.clone()),
				None => out.push((file.to_string(), vec![gadget.clone()])),
			}
		}
		Ok(out)
	}

	/// Textual disassembly at an address of the named file. Negative length
	/// walks backward.
	pub fn disassemble_at(&self, name: &str, address: u64, length: i64) -> Result<String> {
		let file = &self.files[self.index_of(name)?];
		scanner::disassemble_address(file.loader(), address, length)
	}

	/// Textual listing of the derived views, honoring the `detailed` option.
	pub fn render_gadgets(&self, name: Option<&str>) -> Result<String> {
		let detailed = self.options.detailed();
		let mut out = String::new();
		for file in self.selected(name)? {
			let derived = match file.derived() {
				Some(derived) => derived,
				None if name.is_some() => {
					return Err(Error::NotLoaded { name: file.name().to_string() })
				}
				None => continue,
			};
			out.push_str(file.name());
			out.push('\n');
			for gadget in derived {
				out.push_str(&gadget.render(detailed));
				out.push('\n');
			}
		}
		Ok(out)
	}

	pub fn register_chain_builder(&mut self, builder: Box<dyn ChainBuilder>) {
		self.builders.push(builder);
	}

	/// Builds a payload with the registered generator for the current
	/// architecture, over every file's derived view.
	pub fn create_chain(&mut self, chain: &str, chain_options: &ChainOptions) -> Result<String> {
		let arch = match self.files.first() {
			Some(file) => file.arch(),
			None => {
				return Err(Error::UnsupportedChain {
					arch: "unknown".to_string(),
					chain: chain.to_string(),
				})
			}
		};
		let badbytes = filters::parse_badbytes(self.options.badbytes())?;
		let builder = chain::get(&self.builders, arch, chain).ok_or_else(|| {
			Error::UnsupportedChain {
				arch: arch.name().to_string(),
				chain: chain.to_string(),
			}
		})?;
		let inputs = self
			.files
			.iter()
			.map(|file| ChainInput {
				loader: file.loader(),
				gadgets: file.derived().unwrap_or(&[]),
			})
			.collect::<Vec<_>>();
		match self.callbacks.chain_message.as_mut() {
			Some(cb) => builder.create(&inputs, &badbytes, chain_options, Some(cb.as_mut())),
			None => builder.create(&inputs, &badbytes, chain_options, None),
		}
	}
}
