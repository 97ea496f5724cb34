use clap::Parser;
use colored::control::set_override;
use gadgetscope::{
	arch::Arch,
	options,
	options::OptionValue,
	service::{Callbacks, GadgetService},
};
use std::{
	error::Error,
	io::{stdout, BufWriter, Write},
	path::PathBuf,
	time::Instant,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(version)]
struct Opt {
	/// Maximum number of instructions in a gadget
	#[clap(short, long, default_value = "6")]
	inst_count: u32,

	/// Bytes forbidden in gadget addresses, as a hex string eg. `000a`
	#[clap(short, long, default_value = "")]
	badbytes: String,

	/// Show duplicated gadgets
	#[clap(short, long)]
	all: bool,

	/// Only emit gadgets of this kind (`rop`, `jop`, `sys` or `all`)
	#[clap(short = 't', long, default_value = "all")]
	gadget_type: String,

	/// Forces output to be in colour or plain text (`true` or `false`)
	#[clap(short, long)]
	color: Option<bool>,

	/// Per-instruction gadget listing with addresses and bytes
	#[clap(short, long)]
	detailed: bool,

	/// Treats the input files as blobs of code
	#[clap(long)]
	raw: bool,

	/// Architecture for raw blobs (`x86`, `x86_64`)
	#[clap(long)]
	arch: Option<String>,

	/// Rebase all sections onto this image base (hexadecimal)
	#[clap(long)]
	image_base: Option<String>,

	/// Perform a regex search on the derived gadgets
	#[clap(short = 'R', long)]
	search: Option<String>,

	/// Bound on the instructions before the terminator for --search
	#[clap(short, long)]
	quality: Option<usize>,

	/// Search data sections for strings matching the pattern (printable runs
	/// when empty)
	#[clap(long, num_args = 0..=1, default_missing_value = "")]
	string: Option<String>,

	/// Search for pop/pop/ret triples
	#[clap(long)]
	ppr: bool,

	/// Search for `jmp <reg>`/`call <reg>` on the given registers
	#[clap(long, value_delimiter = ',')]
	jmp_reg: Vec<String>,

	/// Search for a raw opcode given as a hex string
	#[clap(long)]
	opcode: Option<String>,

	/// Search for instruction text with `?`/`%` wildcards, eg. `pop r?x; ret`
	#[clap(long)]
	instructions: Option<String>,

	/// Disassemble `address:count`; a negative count walks backward
	#[clap(long)]
	disassemble: Option<String>,

	/// The binaries to inspect
	#[clap(required = true)]
	binaries: Vec<PathBuf>,
}

fn parse_hex_u64(s: &str) -> Result<u64, Box<dyn Error>> {
	let trimmed = s.strip_prefix("0x").unwrap_or(s);
	Ok(u64::from_str_radix(trimmed, 16)?)
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, Box<dyn Error>> {
	if s.len() % 2 != 0 {
		return Err("opcode must be an even-length hex string".into());
	}
	(0..s.len())
		.step_by(2)
		.map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(Into::into))
		.collect()
}

fn write_file_gadgets(
	mut w: impl Write,
	results: &[(String, Vec<gadgetscope::gadget::Gadget>)],
	detailed: bool,
) -> usize {
	let mut count = 0;
	for (file, gadgets) in results {
		let _ = writeln!(w, "{file}");
		for gadget in gadgets {
			count += 1;
			if writeln!(w, "{}", gadget.render(detailed)).is_err() {
				// Pipe closed - finished writing gadgets
				return count;
			}
		}
	}
	count
}

fn main() -> Result<(), Box<dyn Error>> {
	let start = Instant::now();

	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_writer(std::io::stderr)
		.init();

	let opts = Opt::parse();

	if let Some(colour) = opts.color {
		set_override(colour);
	}

	let arch = opts.arch.as_deref().map(str::parse::<Arch>).transpose()?;

	let mut initial = vec![
		(options::INST_COUNT.to_string(), OptionValue::Int(opts.inst_count)),
		(options::BADBYTES.to_string(), OptionValue::Str(opts.badbytes.clone())),
		(options::ALL.to_string(), OptionValue::Bool(opts.all)),
		(options::TYPE.to_string(), OptionValue::Str(opts.gadget_type.clone())),
		(options::DETAILED.to_string(), OptionValue::Bool(opts.detailed)),
	];
	if let Some(colour) = opts.color {
		initial.push((options::COLOR.to_string(), OptionValue::Bool(colour)));
	}

	let mut service = GadgetService::new(initial, Callbacks::default())?;

	for path in &opts.binaries {
		service.add_file(&path.to_string_lossy(), None, arch, opts.raw)?;
	}

	if let Some(base) = opts.image_base.as_deref() {
		let base = parse_hex_u64(base)?;
		let names = service.file_names().map(str::to_string).collect::<Vec<_>>();
		for name in names {
			service.set_image_base(&name, Some(base))?;
		}
	}

	// Stdout uses a LineWriter internally, therefore we improve performance by
	// wrapping stdout in a BufWriter
	let mut stdout = BufWriter::new(stdout());
	let detailed = opts.detailed;

	if let Some(target) = opts.disassemble.as_deref() {
		let (address, count) = target
			.split_once(':')
			.ok_or("expected `address:count` for --disassemble")?;
		let address = parse_hex_u64(address)?;
		let count = count.parse::<i64>()?;
		let names = service.file_names().map(str::to_string).collect::<Vec<_>>();
		for name in names {
			writeln!(stdout, "{name}")?;
			writeln!(stdout, "{}", service.disassemble_at(&name, address, count)?)?;
		}
	}
	else if let Some(pattern) = opts.string.as_deref() {
		let pattern = (!pattern.is_empty()).then_some(pattern);
		for (file, matches) in service.search_string(pattern, None)? {
			writeln!(stdout, "{file}")?;
			for (address, bytes) in matches {
				writeln!(stdout, "{address:#010x}: {}", String::from_utf8_lossy(&bytes))?;
			}
		}
	}
	else if opts.ppr {
		let found = service.search_pop_pop_ret(None)?;
		write_file_gadgets(&mut stdout, &found, detailed);
	}
	else if !opts.jmp_reg.is_empty() {
		let found = service.search_jmp_reg(&opts.jmp_reg, None)?;
		write_file_gadgets(&mut stdout, &found, detailed);
	}
	else if let Some(opcode) = opts.opcode.as_deref() {
		let found = service.search_opcode(&parse_hex_bytes(opcode)?, None)?;
		write_file_gadgets(&mut stdout, &found, detailed);
	}
	else if let Some(code) = opts.instructions.as_deref() {
		let found = service.search_instructions(code, None)?;
		write_file_gadgets(&mut stdout, &found, detailed);
	}
	else if let Some(pattern) = opts.search.as_deref() {
		service.load_gadgets(None)?;
		let found = service.search_dict(pattern, opts.quality, None)?;
		let count = write_file_gadgets(&mut stdout, &found, detailed);
		stdout.flush()?;
		eprintln!(
			"\n==> Found {} gadgets in {:.3} seconds",
			count,
			start.elapsed().as_secs_f32()
		);
		return Ok(());
	}
	else {
		service.load_gadgets(None)?;
		write!(stdout, "{}", service.render_gadgets(None)?)?;
		let count = service
			.files()
			.iter()
			.filter_map(|file| file.derived())
			.map(<[_]>::len)
			.sum::<usize>();
		stdout.flush()?;
		eprintln!(
			"\n==> Found {} gadgets in {:.3} seconds",
			count,
			start.elapsed().as_secs_f32()
		);
		return Ok(());
	}

	stdout.flush()?;
	Ok(())
}
