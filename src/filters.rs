use crate::{
	error::{Error, Result},
	gadget::Gadget,
};
use rustc_hash::FxHashSet;

/// Dedup progress subscriber: `(gadget, was_added, fraction)`.
pub type DedupProgress<'a> =
	&'a mut dyn FnMut(&Gadget, bool, f64) -> std::result::Result<(), String>;

/// Decodes a badbytes option string into byte values. The string must have
/// even length and consist of hex digits only.
pub fn parse_badbytes(badbytes: &str) -> Result<Vec<u8>> {
	if badbytes.len() % 2 != 0 {
		return Err(Error::BadBytesMalformed {
			reason: "length has to be a multiple of two".to_string(),
		});
	}
	(0..badbytes.len())
		.step_by(2)
		.map(|i| {
			u8::from_str_radix(&badbytes[i..i + 2], 16).map_err(|_| Error::BadBytesMalformed {
				reason: "has to consist of 0-9 a-f A-F".to_string(),
			})
		})
		.collect()
}

/// Drops every gadget whose little-endian address encoding contains a
/// forbidden byte. Order is preserved.
pub fn filter_badbytes(gadgets: Vec<Gadget>, badbytes: &[u8], pointer_width: usize) -> Vec<Gadget> {
	if badbytes.is_empty() {
		return gadgets;
	}
	gadgets
		.into_iter()
		.filter(|g| !g.address_contains(badbytes, pointer_width))
		.collect()
}

/// Map-shaped variant of [`filter_badbytes`]: filters each file's sequence
/// independently, keeping the file order.
pub fn filter_badbytes_map(
	gadgets: Vec<(String, Vec<Gadget>)>,
	badbytes: &[u8],
	pointer_width: usize,
) -> Vec<(String, Vec<Gadget>)> {
	gadgets
		.into_iter()
		.map(|(name, gadgets)| (name, filter_badbytes(gadgets, badbytes, pointer_width)))
		.collect()
}

/// Keeps the first gadget of every fingerprint, dropping later duplicates.
/// Input order decides the winner.
pub fn delete_duplicates(
	gadgets: Vec<Gadget>,
	mut progress: Option<DedupProgress<'_>>,
) -> Result<Vec<Gadget>> {
	let total = gadgets.len();
	let mut seen = FxHashSet::default();
	let mut kept = Vec::new();
	for (i, gadget) in gadgets.into_iter().enumerate() {
		let added = seen.insert(gadget.fingerprint().to_string());
		if let Some(progress) = progress.as_mut() {
			let fraction = i as f64 / total.saturating_sub(1).max(1) as f64;
			progress(&gadget, added, fraction)
				.map_err(|reason| Error::SubscriberFailed { reason })?;
		}
		if added {
			kept.push(gadget);
		}
	}
	Ok(kept)
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
	fn parse_badbytes_accepts_hex_pairs() {
		assert_eq!(parse_badbytes("").unwrap(), Vec::<u8>::new());
		assert_eq!(parse_badbytes("000a").unwrap(), vec![0x00, 0x0a]);
		assert_eq!(parse_badbytes("Ff").unwrap(), vec![0xff]);
	}

	#[test]
	fn parse_badbytes_rejects_odd_and_nonhex() {
		assert!(matches!(
			parse_badbytes("0"),
			Err(Error::BadBytesMalformed { .. })
		));
		assert!(matches!(
			parse_badbytes("zz"),
			Err(Error::BadBytesMalformed { .. })
		));
	}

	#[test]
	fn badbyte_filter_drops_matching_addresses() {
		let gadgets = vec![gadget(&[0xc3], 0x1100), gadget(&[0xc3], 0x111111)];
		let kept = filter_badbytes(gadgets.clone(), &[0x11], 8);
		assert!(kept.is_empty());
		let kept = filter_badbytes(gadgets, &[0x42], 8);
		assert_eq!(kept.len(), 2);
	}

	#[test]
	fn badbyte_filter_keeps_order() {
		let gadgets = vec![
			gadget(&[0xc3], 0x424242),
			gadget(&[0xc3], 0x114242),
			gadget(&[0xc3], 0x434343),
		];
		let kept = filter_badbytes(gadgets, &[0x11], 4);
		let addresses = kept.iter().map(Gadget::address).collect::<Vec<_>>();
		assert_eq!(addresses, vec![0x424242, 0x434343]);
	}

	#[test]
	fn map_shaped_filter_keeps_the_file_order() {
		let map = vec![
			("b".to_string(), vec![gadget(&[0xc3], 0x111111), gadget(&[0xc3], 0x424242)]),
			("a".to_string(), vec![gadget(&[0xc3], 0x111111)]),
		];
		let filtered = filter_badbytes_map(map, &[0x11], 4);
		assert_eq!(filtered.len(), 2);
		assert_eq!(filtered[0].0, "b");
		assert_eq!(filtered[0].1.len(), 1);
		assert_eq!(filtered[1].0, "a");
		assert!(filtered[1].1.is_empty());
	}

	#[test]
	fn dedup_keeps_first_occurrence() {
		let gadgets = vec![
			gadget(&[0x59, 0xc3], 0x1000),
			gadget(&[0xc3], 0x1001),
			gadget(&[0x59, 0xc3], 0x2000),
		];
		let kept = delete_duplicates(gadgets, None).unwrap();
		assert_eq!(kept.len(), 2);
		assert_eq!(kept[0].address(), 0x1000);
		assert_eq!(kept[1].address(), 0x1001);
	}

	#[test]
	fn dedup_progress_reports_every_gadget() {
		let gadgets = vec![
			gadget(&[0xc3], 0x1000),
			gadget(&[0xc3], 0x2000),
		];
		let mut reports = Vec::new();
		let mut cb = |g: &Gadget, added: bool, fraction: f64| {
			reports.push((g.address(), added, fraction));
			Ok(())
		};
		let kept = delete_duplicates(gadgets, Some(&mut cb)).unwrap();
		assert_eq!(kept.len(), 1);
		assert_eq!(reports, vec![(0x1000, true, 0.0), (0x2000, false, 1.0)]);
	}

	#[test]
	fn failing_dedup_subscriber_aborts() {
		let gadgets = vec![gadget(&[0xc3], 0x1000)];
		let mut cb = |_: &Gadget, _: bool, _: f64| Err("boom".to_string());
		assert!(matches!(
			delete_duplicates(gadgets, Some(&mut cb)),
			Err(Error::SubscriberFailed { .. })
		));
	}
}
