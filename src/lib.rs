//! ROP/JOP/SYS gadget discovery and chain construction for ELF and PE
//! binaries.
//!
//! [`service::GadgetService`] is the entry point: open one or more binaries,
//! scan them for gadgets, and query the filtered views.
//!
//! ```no_run
//! use gadgetscope::service::GadgetService;
//!
//! # fn main() -> gadgetscope::error::Result<()> {
//! let mut service = GadgetService::with_defaults()?;
//! service.add_file("/usr/bin/true", None, None, false)?;
//! service.load_gadgets(None)?;
//! for (file, gadget) in service.search("pop r?x; ret", None, None)? {
//!     println!("{file}: {}", gadget.render(false));
//! }
//! # Ok(())
//! # }
//! ```

pub mod arch;
pub mod binary;
pub mod chain;
pub mod error;
pub mod filters;
pub mod gadget;
pub mod options;
pub mod rules;
pub mod scanner;
pub mod search;
pub mod service;
