use gadgetscope::{
	arch::Arch,
	chain::{ChainBuilder, ChainInput, ChainMessage, ChainOptions},
	error::{Error, Result},
	gadget::Gadget,
	options::{self, OptionValue},
	service::{Callbacks, GadgetService},
};
use std::{cell::RefCell, rc::Rc};

fn add_raw(service: &mut GadgetService, name: &str, bytes: &[u8], base: u64) {
	service
		.add_file(name, Some(bytes.to_vec()), Some(Arch::X86_64), true)
		.unwrap();
	service.set_image_base(name, Some(base)).unwrap();
}

fn derived_of<'s>(service: &'s GadgetService, name: &str) -> &'s [Gadget] {
	service.get_file(name).unwrap().derived().unwrap()
}

fn fingerprints(gadgets: &[Gadget]) -> Vec<&str> {
	gadgets.iter().map(Gadget::fingerprint).collect()
}

#[test]
fn load_gadgets_populates_the_derived_view() {
	// S1: pop rcx; pop rbx; ret at 0x1000
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "x", &[0x59, 0x5b, 0xc3], 0x1000);
	service.load_gadgets(None).unwrap();

	let file = service.get_file("x").unwrap();
	assert!(file.loaded());
	let derived = file.derived().unwrap();
	let full = derived
		.iter()
		.find(|g| g.fingerprint() == "pop rcx; pop rbx; ret")
		.unwrap();
	assert_eq!(full.address(), 0x1000);
}

#[test]
fn badbytes_change_rebuilds_derived_but_not_raw() {
	// S2: every address in 0x1000..0x1003 encodes a zero byte
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "x", &[0x59, 0x5b, 0xc3], 0x1000);
	service.load_gadgets(None).unwrap();
	let raw_before = service.get_file("x").unwrap().raw().unwrap().len();
	assert!(raw_before > 0);

	service
		.set_option(options::BADBYTES, OptionValue::from("00"))
		.unwrap();
	let file = service.get_file("x").unwrap();
	assert!(file.derived().unwrap().is_empty());
	assert_eq!(file.raw().unwrap().len(), raw_before);
}

#[test]
fn dedup_keeps_the_first_copy_unless_all_is_set() {
	// S3: two copies of `pop rcx; ret`
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "x", &[0x59, 0xc3, 0x59, 0xc3], 0x1000);
	service.load_gadgets(None).unwrap();

	let derived = derived_of(&service, "x");
	assert_eq!(
		fingerprints(derived),
		vec!["pop rcx; ret", "ret"]
	);
	assert_eq!(derived[0].address(), 0x1000);

	service.set_option(options::ALL, OptionValue::from(true)).unwrap();
	let derived = derived_of(&service, "x");
	assert_eq!(derived.len(), 4);
	let raw = service.get_file("x").unwrap().raw().unwrap();
	assert_eq!(fingerprints(derived), fingerprints(raw));
}

#[test]
fn architecture_mismatch_leaves_state_unchanged() {
	// S4
	let mut service = GadgetService::with_defaults().unwrap();
	service
		.add_file("a", Some(vec![0xc3]), Some(Arch::X86_64), true)
		.unwrap();
	let err = service
		.add_file("b", Some(vec![0xc3]), Some(Arch::Aarch64), true)
		.unwrap_err();
	assert!(matches!(err, Error::ArchitectureMismatch { .. }));
	assert_eq!(service.file_names().collect::<Vec<_>>(), vec!["a"]);
}

#[test]
fn badbytes_option_is_validated() {
	// S5
	let mut service = GadgetService::with_defaults().unwrap();
	assert!(matches!(
		service.set_option(options::BADBYTES, OptionValue::from("ZZ")),
		Err(Error::InvalidOption { .. })
	));
	assert!(matches!(
		service.set_option(options::BADBYTES, OptionValue::from("0")),
		Err(Error::InvalidOption { .. })
	));
	service
		.set_option(options::BADBYTES, OptionValue::from("0a"))
		.unwrap();
	assert_eq!(
		service.options().get(options::BADBYTES).unwrap(),
		OptionValue::from("0a")
	);
}

#[test]
fn disassembly_requires_a_mapped_address() {
	// S6
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "x", &[0x59, 0x5b, 0xc3], 0x1000);
	assert!(matches!(
		service.disassemble_at("x", 0x999, 1),
		Err(Error::AddressNotMapped { address: 0x999 })
	));
	let text = service.disassemble_at("x", 0x1000, 1).unwrap();
	assert!(text.contains("pop rcx"));
	let backward = service.disassemble_at("x", 0x1002, -2).unwrap();
	assert_eq!(backward.lines().count(), 2);
	assert!(backward.contains("ret"));
}

#[test]
fn reactive_badbytes_equals_replay() {
	// changing badbytes after the fact gives the same view as loading with
	// them from the start
	let bytes = [0x59, 0x5b, 0xc3];
	let mut reactive = GadgetService::with_defaults().unwrap();
	add_raw(&mut reactive, "x", &bytes, 0x1000);
	reactive.load_gadgets(None).unwrap();
	reactive
		.set_option(options::BADBYTES, OptionValue::from("01"))
		.unwrap();

	let mut replay = GadgetService::new(
		vec![("badbytes".to_string(), OptionValue::from("01"))],
		Callbacks::default(),
	)
	.unwrap();
	add_raw(&mut replay, "x", &bytes, 0x1000);
	replay.load_gadgets(None).unwrap();

	let view = |service: &GadgetService| {
		derived_of(service, "x")
			.iter()
			.map(|g| (g.address(), g.fingerprint().to_string()))
			.collect::<Vec<_>>()
	};
	let reactive_view = view(&reactive);
	assert!(!reactive_view.is_empty());
	assert_eq!(reactive_view, view(&replay));
}

#[test]
fn image_base_change_reapplies_the_filter_pipeline() {
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "x", &[0x59, 0x5b, 0xc3], 0x1000);
	service.load_gadgets(None).unwrap();
	// 0x20 only appears in addresses under the new base
	service
		.set_option(options::BADBYTES, OptionValue::from("20"))
		.unwrap();
	assert_eq!(derived_of(&service, "x").len(), 3);

	service.set_image_base("x", Some(0x2000)).unwrap();
	assert!(derived_of(&service, "x").is_empty());
	// raw survives a rebase, only addresses moved
	let raw = service.get_file("x").unwrap().raw().unwrap();
	assert_eq!(raw.len(), 3);
	assert!(raw.iter().all(|g| g.address() >= 0x2000));

	service.set_image_base("x", Some(0x1000)).unwrap();
	assert_eq!(derived_of(&service, "x").len(), 3);
}

#[test]
fn set_architecture_invalidates_gadgets() {
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "x", &[0x59, 0xc3], 0x1000);
	service.load_gadgets(None).unwrap();
	assert!(service.get_file("x").unwrap().loaded());

	service.set_architecture("x", Arch::X86).unwrap();
	let file = service.get_file("x").unwrap();
	assert!(!file.loaded());
	assert!(file.raw().is_none());
	assert!(file.derived().is_none());
	assert!(matches!(
		service.search("pop", None, Some("x")),
		Err(Error::NotLoaded { .. })
	));
}

#[test]
fn set_architecture_is_refused_with_multiple_files() {
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "a", &[0xc3], 0x1000);
	add_raw(&mut service, "b", &[0xc3], 0x2000);
	assert!(matches!(
		service.set_architecture("a", Arch::X86),
		Err(Error::ArchitectureMismatch { .. })
	));
	assert_eq!(service.get_file("a").unwrap().arch(), Arch::X86_64);
}

#[test]
fn duplicate_and_missing_files_are_rejected() {
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "a", &[0xc3], 0x1000);
	assert!(matches!(
		service.add_file("a", Some(vec![0xc3]), Some(Arch::X86_64), true),
		Err(Error::DuplicateFile { .. })
	));
	assert!(matches!(
		service.load_gadgets(Some("nope")),
		Err(Error::MissingFile { .. })
	));
	assert!(matches!(
		service.set_image_base("nope", Some(0)),
		Err(Error::MissingFile { .. })
	));

	service.remove_file("missing");
	service.remove_file("a");
	assert_eq!(service.files().len(), 0);
}

#[test]
fn files_preserve_insertion_order() {
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "b", &[0xc3], 0x1000);
	add_raw(&mut service, "a", &[0xc3], 0x2000);
	assert_eq!(service.file_names().collect::<Vec<_>>(), vec!["b", "a"]);
}

#[test]
fn search_results_come_from_the_derived_view() {
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "x", &[0x59, 0x5b, 0xc3], 0x1000);
	service.load_gadgets(None).unwrap();

	let hits = service
		.search("pop", None, None)
		.unwrap()
		.collect::<Vec<_>>();
	assert_eq!(hits.len(), 2);
	let derived = derived_of(&service, "x");
	for (file, gadget) in &hits {
		assert_eq!(*file, "x");
		assert!(gadget.text().contains("pop"));
		assert!(derived
			.iter()
			.any(|d| d.address() == gadget.address() && d.fingerprint() == gadget.fingerprint()));
	}

	let dict = service.search_dict("pop", None, None).unwrap();
	assert_eq!(dict.len(), 1);
	assert_eq!(dict[0].0, "x");
	assert_eq!(dict[0].1.len(), 2);

	// quality bounds the body length
	let tight = service
		.search("pop", Some(1), None)
		.unwrap()
		.collect::<Vec<_>>();
	assert_eq!(tight.len(), 1);
	assert_eq!(tight[0].1.fingerprint(), "pop rbx; ret");
}

#[test]
fn unnamed_search_skips_unloaded_files() {
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "a", &[0x59, 0xc3], 0x1000);
	add_raw(&mut service, "b", &[0x59, 0xc3], 0x2000);
	service.load_gadgets(Some("a")).unwrap();
	let hits = service
		.search("pop", None, None)
		.unwrap()
		.collect::<Vec<_>>();
	assert!(hits.iter().all(|(file, _)| *file == "a"));
	assert!(!hits.is_empty());
}

#[test]
fn specialized_searches_are_badbyte_filtered() {
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "x", &[0x58, 0x5b, 0xc3], 0x1000);

	let found = service.search_pop_pop_ret(None).unwrap();
	assert_eq!(found.len(), 1);
	assert_eq!(found[0].0, "x");
	assert_eq!(found[0].1.len(), 1);
	assert_eq!(found[0].1[0].fingerprint(), "pop rax; pop rbx; ret");

	service
		.set_option(options::BADBYTES, OptionValue::from("00"))
		.unwrap();
	let found = service.search_pop_pop_ret(None).unwrap();
	assert!(found[0].1.is_empty());
}

#[test]
fn opcode_and_instruction_searches_return_per_file_maps() {
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "x", &[0xff, 0xe4, 0x58, 0xc3], 0x1000);

	let jmp = service.search_opcode(&[0xff, 0xe4], None).unwrap();
	assert_eq!(jmp[0].1[0].fingerprint(), "jmp rsp");
	assert_eq!(jmp[0].1[0].address(), 0x1000);

	let regs = vec!["rsp".to_string()];
	let jmp = service.search_jmp_reg(&regs, None).unwrap();
	assert_eq!(jmp[0].1.len(), 1);

	let instr = service.search_instructions("pop r?x; ret", None).unwrap();
	assert_eq!(instr[0].1.len(), 1);
	assert_eq!(instr[0].1[0].fingerprint(), "pop rax; ret");
}

#[test]
fn string_search_reports_rebased_addresses() {
	let mut service = GadgetService::with_defaults().unwrap();
	let mut bytes = vec![0x00];
	bytes.extend_from_slice(b"/bin/sh");
	bytes.push(0x00);
	add_raw(&mut service, "x", &bytes, 0x1000);

	let found = service.search_string(None, None).unwrap();
	assert_eq!(found[0].0, "x");
	assert_eq!(found[0].1.len(), 1);
	assert_eq!(found[0].1[0].0, 0x1001);
	assert_eq!(found[0].1[0].1, b"/bin/sh");
}

#[test]
fn inst_count_change_only_affects_the_next_scan() {
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "x", &[0x59, 0x5b, 0xc3], 0x1000);
	service.load_gadgets(None).unwrap();
	let before = derived_of(&service, "x").len();

	service
		.set_option(options::INST_COUNT, OptionValue::Int(2))
		.unwrap();
	assert_eq!(derived_of(&service, "x").len(), before);

	service.load_gadgets(None).unwrap();
	assert!(derived_of(&service, "x")
		.iter()
		.all(|g| g.instructions().len() <= 2));
}

#[test]
fn type_option_restricts_the_next_scan() {
	let mut service = GadgetService::new(
		vec![("type".to_string(), OptionValue::from("jop"))],
		Callbacks::default(),
	)
	.unwrap();
	add_raw(&mut service, "x", &[0x58, 0xc3, 0xff, 0xe0], 0x1000);
	service.load_gadgets(None).unwrap();
	let derived = derived_of(&service, "x");
	assert!(!derived.is_empty());
	assert!(derived
		.iter()
		.all(|g| g.kind() == gadgetscope::gadget::GadgetKind::Jop));
}

#[test]
fn progress_callbacks_observe_scan_and_dedup() {
	let scans = Rc::new(RefCell::new(0usize));
	let dedups = Rc::new(RefCell::new(0usize));
	let scan_sink = Rc::clone(&scans);
	let dedup_sink = Rc::clone(&dedups);
	let callbacks = Callbacks {
		scan_progress: Some(Box::new(move |_, _, _| {
			*scan_sink.borrow_mut() += 1;
			Ok(())
		})),
		dedup_progress: Some(Box::new(move |_, _, _| {
			*dedup_sink.borrow_mut() += 1;
			Ok(())
		})),
		chain_message: None,
	};
	let mut service = GadgetService::new(Vec::new(), callbacks).unwrap();
	add_raw(&mut service, "x", &[0x59, 0xc3, 0x59, 0xc3], 0x1000);
	service.load_gadgets(None).unwrap();
	assert_eq!(*scans.borrow(), 4);
	assert_eq!(*dedups.borrow(), 4);
}

#[test]
fn failing_subscriber_aborts_loading() {
	let callbacks = Callbacks {
		scan_progress: Some(Box::new(|_, _, _| Err("nope".to_string()))),
		dedup_progress: None,
		chain_message: None,
	};
	let mut service = GadgetService::new(Vec::new(), callbacks).unwrap();
	add_raw(&mut service, "x", &[0xc3], 0x1000);
	assert!(matches!(
		service.load_gadgets(None),
		Err(Error::SubscriberFailed { .. })
	));
}

#[test]
fn render_gadgets_lists_per_file() {
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "x", &[0x59, 0xc3], 0x1000);
	assert!(matches!(
		service.render_gadgets(Some("x")),
		Err(Error::NotLoaded { .. })
	));
	service.load_gadgets(None).unwrap();
	let text = service.render_gadgets(None).unwrap();
	assert!(text.starts_with("x\n"));
	assert!(text.contains("pop rcx; ret"));
}

struct EchoChain;

impl ChainBuilder for EchoChain {
	fn arch(&self) -> Arch { Arch::X86_64 }

	fn name(&self) -> &str { "execve" }

	fn create(
		&self,
		inputs: &[ChainInput<'_>],
		badbytes: &[u8],
		chain_options: &ChainOptions,
		message: Option<ChainMessage<'_>>,
	) -> Result<String> {
		if let Some(message) = message {
			message("generating execve chain")
				.map_err(|reason| Error::SubscriberFailed { reason })?;
		}
		Ok(format!(
			"files={} badbytes={} options={}",
			inputs.len(),
			badbytes.len(),
			chain_options.len()
		))
	}
}

#[test]
fn chain_creation_requires_a_registered_builder() {
	let mut service = GadgetService::with_defaults().unwrap();
	add_raw(&mut service, "x", &[0x59, 0xc3], 0x1000);
	service.load_gadgets(None).unwrap();

	let err = service.create_chain("execve", &ChainOptions::default()).unwrap_err();
	assert!(matches!(err, Error::UnsupportedChain { .. }));

	service.register_chain_builder(Box::new(EchoChain));
	let text = service.create_chain("execve", &ChainOptions::default()).unwrap();
	assert_eq!(text, "files=1 badbytes=0 options=0");
	// still no mprotect builder
	assert!(matches!(
		service.create_chain("mprotect", &ChainOptions::default()),
		Err(Error::UnsupportedChain { .. })
	));
}

#[test]
fn chain_messages_flow_through_the_callback() {
	let messages = Rc::new(RefCell::new(Vec::new()));
	let sink = Rc::clone(&messages);
	let callbacks = Callbacks {
		scan_progress: None,
		dedup_progress: None,
		chain_message: Some(Box::new(move |message| {
			sink.borrow_mut().push(message.to_string());
			Ok(())
		})),
	};
	let mut service = GadgetService::new(Vec::new(), callbacks).unwrap();
	add_raw(&mut service, "x", &[0x59, 0xc3], 0x1000);
	service.load_gadgets(None).unwrap();
	service.register_chain_builder(Box::new(EchoChain));
	service.create_chain("execve", &ChainOptions::default()).unwrap();
	assert_eq!(*messages.borrow(), vec!["generating execve chain".to_string()]);
}
