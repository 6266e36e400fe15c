//! Caches the units a late joiner needs before it can decode anything.
//!
//! A decoder can only start on an IDR, and only after it has seen the SPS
//! and PPS. The cache keeps the latest parameter sets plus every unit of the
//! current group of pictures, so a mid-stream subscriber can be prefilled
//! with a decodable prefix.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::{nal_type, NalType};

/// Budget for the cached group; a stream without keyframes would otherwise
/// grow it forever, and an over-budget snapshot is useless for prefill anyway.
const MAX_GOP_BYTES: usize = 4 * 1024 * 1024;

/// AUD/SEI units retained between the last VCL unit and the next IDR.
const MAX_PREFIX_UNITS: usize = 16;

#[derive(Default)]
pub struct GopCache {
	last_sps: Option<Bytes>,
	last_pps: Option<Bytes>,

	// AUD/SEI seen since the last VCL unit; they lead the next access unit.
	prefix: VecDeque<Bytes>,

	// SPS, PPS, prefix, IDR, then every following slice.
	gop: Vec<Bytes>,
	gop_bytes: usize,
	has_idr: bool,
}

impl GopCache {
	/// Apply one emitted NAL to the cache.
	pub fn push(&mut self, nal: &Bytes) {
		match nal_type(nal) {
			Some(NalType::Sps) => self.last_sps = Some(nal.clone()),
			Some(NalType::Pps) => self.last_pps = Some(nal.clone()),
			Some(NalType::Sei) | Some(NalType::Aud) => {
				self.prefix.push_back(nal.clone());
				while self.prefix.len() > MAX_PREFIX_UNITS {
					self.prefix.pop_front();
				}
			}
			Some(NalType::IdrSlice) => {
				self.gop.clear();
				self.gop.extend(self.last_sps.iter().cloned());
				self.gop.extend(self.last_pps.iter().cloned());
				self.gop.extend(self.prefix.drain(..));
				self.gop.push(nal.clone());
				self.gop_bytes = self.gop.iter().map(Bytes::len).sum();
				self.has_idr = true;
			}
			Some(NalType::NonIdrSlice) => {
				self.prefix.clear();
				if self.has_idr {
					self.append(nal.clone());
				}
			}
			_ => {
				if self.has_idr {
					self.append(nal.clone());
				}
			}
		}

		if self.gop_bytes > MAX_GOP_BYTES {
			self.gop.clear();
			self.gop_bytes = 0;
			self.has_idr = false;
		}
	}

	fn append(&mut self, nal: Bytes) {
		self.gop_bytes += nal.len();
		self.gop.push(nal);
	}

	/// True once the cached group starts at an IDR, i.e. a snapshot is usable.
	pub fn has_idr(&self) -> bool {
		self.has_idr
	}

	/// The current decodable prefix: SPS, PPS, access-unit prefix, IDR, and
	/// every slice broadcast since.
	pub fn snapshot(&self) -> Vec<Bytes> {
		self.gop.clone()
	}

	pub fn clear(&mut self) {
		self.last_sps = None;
		self.last_pps = None;
		self.prefix.clear();
		self.gop.clear();
		self.gop_bytes = 0;
		self.has_idr = false;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::START_CODE;

	fn nal(nal_type: u8, payload: &[u8]) -> Bytes {
		let mut data = START_CODE.to_vec();
		data.push((3 << 5) | (nal_type & 0x1f));
		data.extend_from_slice(payload);
		Bytes::from(data)
	}

	fn types(units: &[Bytes]) -> Vec<u8> {
		units.iter().map(|u| u[4] & 0x1f).collect()
	}

	#[test]
	fn test_gop_starts_at_idr() {
		let mut cache = GopCache::default();

		cache.push(&nal(7, b"S"));
		cache.push(&nal(8, b"P"));
		cache.push(&nal(9, b"A"));
		assert!(!cache.has_idr());
		assert!(cache.snapshot().is_empty());

		cache.push(&nal(5, b"I"));
		assert!(cache.has_idr());
		assert_eq!(types(&cache.snapshot()), vec![7, 8, 9, 5]);

		cache.push(&nal(1, b"1"));
		cache.push(&nal(1, b"2"));
		assert_eq!(types(&cache.snapshot()), vec![7, 8, 9, 5, 1, 1]);
	}

	#[test]
	fn test_new_idr_replaces_gop() {
		let mut cache = GopCache::default();

		cache.push(&nal(7, b"S"));
		cache.push(&nal(8, b"P"));
		cache.push(&nal(5, b"I"));
		cache.push(&nal(1, b"1"));

		// The next keyframe starts a fresh group from the stored parameters.
		cache.push(&nal(6, b"E"));
		cache.push(&nal(5, b"J"));
		assert_eq!(types(&cache.snapshot()), vec![7, 8, 6, 5]);
	}

	#[test]
	fn test_slices_before_idr_are_dropped() {
		let mut cache = GopCache::default();

		cache.push(&nal(7, b"S"));
		cache.push(&nal(1, b"1"));
		assert!(cache.snapshot().is_empty());
	}

	#[test]
	fn test_prefix_cleared_by_slice() {
		let mut cache = GopCache::default();

		cache.push(&nal(7, b"S"));
		cache.push(&nal(8, b"P"));
		cache.push(&nal(9, b"A"));
		cache.push(&nal(1, b"1"));
		// The AUD belonged to the dropped slice, not the coming IDR.
		cache.push(&nal(5, b"I"));
		assert_eq!(types(&cache.snapshot()), vec![7, 8, 5]);
	}

	#[test]
	fn test_prefix_bounded() {
		let mut cache = GopCache::default();

		cache.push(&nal(7, b"S"));
		cache.push(&nal(8, b"P"));
		for _ in 0..MAX_PREFIX_UNITS + 8 {
			cache.push(&nal(9, b"A"));
		}
		cache.push(&nal(5, b"I"));
		assert_eq!(cache.snapshot().len(), 2 + MAX_PREFIX_UNITS + 1);
	}

	#[test]
	fn test_budget_overflow_clears() {
		let mut cache = GopCache::default();

		cache.push(&nal(7, b"S"));
		cache.push(&nal(8, b"P"));
		cache.push(&nal(5, b"I"));

		let big = vec![0u8; 1024 * 1024];
		for _ in 0..5 {
			cache.push(&nal(1, &big));
		}

		assert!(!cache.has_idr());
		assert!(cache.snapshot().is_empty());

		// A fresh IDR makes the cache usable again.
		cache.push(&nal(5, b"I"));
		assert!(cache.has_idr());
		assert_eq!(types(&cache.snapshot()), vec![7, 8, 5]);
	}
}
