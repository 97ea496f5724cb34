use crate::{arch::Arch, binary::Binary, error::Result, gadget::Gadget};
use rustc_hash::FxHashMap;

/// Chain progress/message subscriber.
pub type ChainMessage<'a> = &'a mut dyn FnMut(&str) -> std::result::Result<(), String>;

/// Per-file input to a chain builder: the loader and its derived gadget view.
pub struct ChainInput<'a> {
	pub loader: &'a Binary,
	pub gadgets: &'a [Gadget],
}

/// Key/value options forwarded to a builder (for example a command string
/// for an execve chain).
pub type ChainOptions = FxHashMap<String, String>;

/// A code generator for one (architecture, chain name) pair. Builders are
/// registered on the service; the crate itself ships none.
pub trait ChainBuilder {
	fn arch(&self) -> Arch;

	/// Chain name this builder answers to, e.g. `execve` or `mprotect`.
	fn name(&self) -> &str;

	/// Produces the payload text. Forbidden address bytes and the message
	/// subscriber are threaded through from the service.
	fn create(
		&self,
		inputs: &[ChainInput<'_>],
		badbytes: &[u8],
		options: &ChainOptions,
		message: Option<ChainMessage<'_>>,
	) -> Result<String>;
}

/// Looks up a builder for the architecture/chain pair.
pub fn get<'b>(
	builders: &'b [Box<dyn ChainBuilder>],
	arch: Arch,
	chain: &str,
) -> Option<&'b dyn ChainBuilder> {
	builders
		.iter()
		.find(|builder| builder.arch() == arch && builder.name() == chain)
		.map(|builder| &**builder)
}
