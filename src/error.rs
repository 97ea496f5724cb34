use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid value for option `{key}`: {reason}")]
	InvalidOption { key: String, reason: String },

	#[error("unknown option `{key}`")]
	UnknownOption { key: String },

	#[error("file is already added: {name}")]
	DuplicateFile { name: String },

	#[error("no such file opened: {name}")]
	MissingFile { name: String },

	#[error("no gadgets loaded for file: {name}")]
	NotLoaded { name: String },

	#[error("architecture mismatch: loaded {existing}, file to open {incoming}")]
	ArchitectureMismatch { existing: String, incoming: String },

	#[error("malformed badbytes: {reason}")]
	BadBytesMalformed { reason: String },

	#[error("address not mapped by any executable section: {address:#x}")]
	AddressNotMapped { address: u64 },

	#[error("no {chain} chain generation support for {arch}")]
	UnsupportedChain { arch: String, chain: String },

	#[error("progress subscriber failed: {reason}")]
	SubscriberFailed { reason: String },

	#[error("invalid search pattern")]
	Pattern(#[from] regex::Error),

	#[error("loader: {0}")]
	Loader(String),

	#[error("disassembler: {0}")]
	Disassembler(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl From<goblin::error::Error> for Error {
	fn from(e: goblin::error::Error) -> Self { Error::Loader(e.to_string()) }
}
