use crate::{
	error::{Error, Result},
	filters,
	gadget::{GadgetKind, KindFilter},
};

pub const INST_COUNT: &str = "inst_count";
pub const COLOR: &str = "color";
pub const BADBYTES: &str = "badbytes";
pub const ALL: &str = "all";
pub const TYPE: &str = "type";
pub const DETAILED: &str = "detailed";

const KEYS: [&str; 6] = [INST_COUNT, COLOR, BADBYTES, ALL, TYPE, DETAILED];

/// A validated option value. Writes of the wrong variant for a key fail
/// validation rather than being coerced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
	Int(u32),
	Bool(bool),
	Str(String),
}

impl From<u32> for OptionValue {
	fn from(v: u32) -> Self { OptionValue::Int(v) }
}

impl From<bool> for OptionValue {
	fn from(v: bool) -> Self { OptionValue::Bool(v) }
}

impl From<&str> for OptionValue {
	fn from(v: &str) -> Self { OptionValue::Str(v.to_string()) }
}

/// The single-key delta reported for every successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionChange {
	pub key: &'static str,
	pub old: OptionValue,
	pub new: OptionValue,
}

pub type OptionObserver = Box<dyn FnMut(&str, &OptionValue, &OptionValue)>;

/// Validated configuration bag driving every derived view.
///
/// Every recognized key always holds a validated value; writes go through
/// [`Options::set`], which re-checks the key, re-validates the whole record
/// and notifies the observer exactly once before returning the applied
/// change.
pub struct Options {
	inst_count: u32,
	color: bool,
	badbytes: String,
	all: bool,
	gadget_type: String,
	detailed: bool,
	observer: Option<OptionObserver>,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			inst_count: 6,
			color: false,
			badbytes: String::new(),
			all: false,
			gadget_type: "all".to_string(),
			detailed: false,
			observer: None,
		}
	}
}

impl std::fmt::Debug for Options {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Options")
			.field("inst_count", &self.inst_count)
			.field("color", &self.color)
			.field("badbytes", &self.badbytes)
			.field("all", &self.all)
			.field("type", &self.gadget_type)
			.field("detailed", &self.detailed)
			.finish()
	}
}

fn invalid(key: &str, reason: impl Into<String>) -> Error {
	Error::InvalidOption { key: key.to_string(), reason: reason.into() }
}

impl Options {
	/// Builds a registry from an initial key/value map, filling defaults for
	/// absent keys. The observer is not notified for initial values.
	pub fn new<I>(initial: I, observer: Option<OptionObserver>) -> Result<Self>
	where
		I: IntoIterator<Item = (String, OptionValue)>,
	{
		let mut options = Options { observer, ..Options::default() };
		for (key, value) in initial {
			options.apply(&key, value)?;
		}
		options.validate()?;
		Ok(options)
	}

	pub fn inst_count(&self) -> u32 { self.inst_count }

	pub fn color(&self) -> bool { self.color }

	pub fn badbytes(&self) -> &str { &self.badbytes }

	/// `all = true` keeps duplicate gadgets in the derived view.
	pub fn keep_all(&self) -> bool { self.all }

	pub fn detailed(&self) -> bool { self.detailed }

	pub fn kind_filter(&self) -> KindFilter {
		match self.gadget_type.as_str() {
			"rop" => KindFilter::Only(GadgetKind::Rop),
			"jop" => KindFilter::Only(GadgetKind::Jop),
			"sys" => KindFilter::Only(GadgetKind::Sys),
			_ => KindFilter::All,
		}
	}

	pub fn get(&self, key: &str) -> Result<OptionValue> {
		match key {
			INST_COUNT => Ok(OptionValue::Int(self.inst_count)),
			COLOR => Ok(OptionValue::Bool(self.color)),
			BADBYTES => Ok(OptionValue::Str(self.badbytes.clone())),
			ALL => Ok(OptionValue::Bool(self.all)),
			TYPE => Ok(OptionValue::Str(self.gadget_type.clone())),
			DETAILED => Ok(OptionValue::Bool(self.detailed)),
			_ => Err(Error::UnknownOption { key: key.to_string() }),
		}
	}

	/// Validates and writes one key, re-validates the full record, then
	/// notifies the observer synchronously. Returns the applied change so the
	/// owner can run its own invalidation dispatch.
	pub fn set(&mut self, key: &str, value: OptionValue) -> Result<OptionChange> {
		let old = self.get(key)?;
		let canonical = self.apply(key, value)?;
		self.validate()?;
		let new = self.get(canonical)?;
		if let Some(observer) = self.observer.as_mut() {
			observer(canonical, &old, &new);
		}
		Ok(OptionChange { key: canonical, old, new })
	}

	pub fn iter(&self) -> impl Iterator<Item = (&'static str, OptionValue)> + '_ {
		KEYS.iter()
			.filter_map(|key| self.get(key).ok().map(|value| (*key, value)))
	}

	/// Single-key validation + normalization + store. Returns the canonical
	/// key name.
	fn apply(&mut self, key: &str, value: OptionValue) -> Result<&'static str> {
		match key {
			INST_COUNT => match value {
				OptionValue::Int(n) if n >= 1 => {
					self.inst_count = n;
					Ok(INST_COUNT)
				}
				OptionValue::Int(_) => Err(invalid(key, "has to be bigger than 0")),
				_ => Err(invalid(key, "expected an integer")),
			},
			COLOR => match value {
				OptionValue::Bool(b) => {
					self.color = b;
					Ok(COLOR)
				}
				_ => Err(invalid(key, "expected a bool")),
			},
			BADBYTES => match value {
				OptionValue::Str(s) => {
					filters::parse_badbytes(&s).map_err(|e| invalid(key, e.to_string()))?;
					self.badbytes = s.to_ascii_lowercase();
					Ok(BADBYTES)
				}
				_ => Err(invalid(key, "expected a hex string")),
			},
			ALL => match value {
				OptionValue::Bool(b) => {
					self.all = b;
					Ok(ALL)
				}
				_ => Err(invalid(key, "expected a bool")),
			},
			TYPE => match value {
				OptionValue::Str(s) => {
					let s = s.to_ascii_lowercase();
					match s.as_str() {
						"rop" | "jop" | "sys" | "all" => {
							self.gadget_type = s;
							Ok(TYPE)
						}
						_ => Err(invalid(key, "has to be \"rop\", \"jop\", \"sys\" or \"all\"")),
					}
				}
				_ => Err(invalid(key, "expected a string")),
			},
			DETAILED => match value {
				OptionValue::Bool(b) => {
					self.detailed = b;
					Ok(DETAILED)
				}
				_ => Err(invalid(key, "expected a bool")),
			},
			_ => Err(Error::UnknownOption { key: key.to_string() }),
		}
	}

	/// Full-record validation, run after every single-key write to catch
	/// cross-key constraints.
	fn validate(&self) -> Result<()> {
		if self.inst_count < 1 {
			return Err(invalid(INST_COUNT, "has to be bigger than 0"));
		}
		filters::parse_badbytes(&self.badbytes)
			.map_err(|e| invalid(BADBYTES, e.to_string()))?;
		match self.gadget_type.as_str() {
			"rop" | "jop" | "sys" | "all" => Ok(()),
			_ => Err(invalid(TYPE, "has to be \"rop\", \"jop\", \"sys\" or \"all\"")),
		}
	}
}
