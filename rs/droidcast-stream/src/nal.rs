//! Reframes the agent's byte stream into Annex-B NAL units.
//!
//! The capture agent emits either raw Annex-B (start-code separated) or
//! 4-byte big-endian length-prefixed units depending on the encoder. The
//! [UnitExtractor] detects the framing from the stream head and emits
//! Annex-B in both cases, tolerating arbitrary chunk boundaries and leading
//! garbage.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Every emitted unit is prefixed with the 4 byte start code.
///
/// One byte longer than the 3 byte variant, but downstream consumers only
/// ever see a single framing.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Soft cap on the reassembly buffer; the oldest bytes are discarded past it.
const MAX_BUFFER: usize = 512 * 1024;

/// Upper bound on a single NAL unit; anything larger resets the extractor.
const MAX_NAL: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum NalType {
	Unspecified = 0,
	NonIdrSlice = 1,
	DataPartitionA = 2,
	DataPartitionB = 3,
	DataPartitionC = 4,
	IdrSlice = 5,
	Sei = 6,
	Sps = 7,
	Pps = 8,
	Aud = 9,
	EndOfSeq = 10,
	EndOfStream = 11,
	Filler = 12,
	SpsExt = 13,
	Prefix = 14,
	SubsetSps = 15,
	DepthParameterSet = 16,
}

/// Read the unit type of an Annex-B framed NAL (4 byte start code included).
pub fn nal_type(nal: &[u8]) -> Option<NalType> {
	let header = nal.get(START_CODE.len())?;
	NalType::try_from(header & 0x1f).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
	AnnexB,
	LengthPrefixed,
}

/// Incremental reframer for the agent byte stream.
///
/// Feed arbitrary chunks via [UnitExtractor::push]; complete units come back
/// in order, each carrying the 4 byte start code. In Annex-B mode the final
/// unit is held until the next start code confirms its end.
#[derive(Default)]
pub struct UnitExtractor {
	buf: BytesMut,
	framing: Option<Framing>,
}

impl UnitExtractor {
	pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
		self.buf.extend_from_slice(chunk);

		if self.buf.len() > MAX_BUFFER {
			let excess = self.buf.len() - MAX_BUFFER;
			self.buf.advance(excess);
			// The cut landed mid-unit, so realign from scratch.
			self.framing = None;
		}

		let mut out = Vec::new();

		loop {
			if self.framing.is_none() {
				self.detect();
			}

			let nal = match self.framing {
				Some(Framing::AnnexB) => self.next_annexb(),
				Some(Framing::LengthPrefixed) => self.next_length_prefixed(),
				None => None,
			};

			match nal {
				Some(nal) => out.push(nal),
				None => break,
			}
		}

		out
	}

	/// Decide the framing from the buffer head, skipping leading garbage one
	/// byte at a time until something plausible lines up.
	fn detect(&mut self) {
		while self.framing.is_none() {
			if start_code_len(&self.buf).is_some() {
				self.framing = Some(Framing::AnnexB);
				return;
			}

			// A partial start code or length prefix at the head stays
			// unconfirmed until more bytes arrive.
			if self.buf.len() < 5 {
				return;
			}

			let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
			if (1..=MAX_NAL).contains(&len) && self.buf[4] & 0x1f != 0 {
				self.framing = Some(Framing::LengthPrefixed);
				return;
			}

			self.buf.advance(1);
		}
	}

	fn next_annexb(&mut self) -> Option<Bytes> {
		let head = start_code_len(&self.buf)?;

		match find_start_code(&self.buf, head) {
			Some(mut end) => {
				// A zero right before the 3 byte pattern belongs to a 4 byte
				// start code, not to this unit.
				if end > head && self.buf[end - 1] == 0 {
					end -= 1;
				}

				let nal = framed(&self.buf[head..end]);
				self.buf.advance(end);
				Some(nal)
			}
			None => {
				if self.buf.len() - head > MAX_NAL {
					self.buf.clear();
					self.framing = None;
				}
				None
			}
		}
	}

	fn next_length_prefixed(&mut self) -> Option<Bytes> {
		if self.buf.len() < 4 {
			return None;
		}

		let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
		if len == 0 || len > MAX_NAL {
			// Corrupt prefix; drop everything and realign.
			self.buf.clear();
			self.framing = None;
			return None;
		}

		if self.buf.len() < 4 + len {
			return None;
		}

		self.buf.advance(4);
		let payload = self.buf.split_to(len);
		Some(framed(&payload))
	}
}

fn framed(payload: &[u8]) -> Bytes {
	let mut nal = BytesMut::with_capacity(START_CODE.len() + payload.len());
	nal.put_slice(&START_CODE);
	nal.put_slice(payload);
	nal.freeze()
}

// Size of the start code at the head of the buffer, if any.
fn start_code_len(buf: &[u8]) -> Option<usize> {
	if buf.len() >= 3 && buf[0] == 0 && buf[1] == 0 && buf[2] == 1 {
		return Some(3);
	}
	if buf.len() >= 4 && buf[0] == 0 && buf[1] == 0 && buf[2] == 0 && buf[3] == 1 {
		return Some(4);
	}
	None
}

// Offset of the next 3 byte start code pattern at or after `from`.
fn find_start_code(buf: &[u8], from: usize) -> Option<usize> {
	if buf.len() < from + 3 {
		return None;
	}
	buf[from..]
		.windows(3)
		.position(|w| w[0] == 0 && w[1] == 0 && w[2] == 1)
		.map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn annexb(header: u8, payload: &[u8]) -> Vec<u8> {
		let mut nal = START_CODE.to_vec();
		nal.push(header);
		nal.extend_from_slice(payload);
		nal
	}

	#[test]
	fn test_annexb_extracts_complete_nals() {
		let mut ex = UnitExtractor::default();

		let sps = annexb(0x67, &[0x01, 0x02]);
		let idr = annexb(0x65, &[0x03, 0x04]);
		let non_idr = annexb(0x61, &[0x05]);

		let mut stream = sps.clone();
		stream.extend_from_slice(&idr);
		stream.extend_from_slice(&non_idr);

		// The last unit is held until the next start code confirms its end.
		let out = ex.push(&stream);
		assert_eq!(out, vec![Bytes::from(sps), Bytes::from(idr)]);

		let out = ex.push(&START_CODE);
		assert_eq!(out, vec![Bytes::from(non_idr)]);
	}

	#[test]
	fn test_annexb_3_byte_start_codes_normalized() {
		let mut ex = UnitExtractor::default();

		let stream = [&[0, 0, 1, 0x67, 0xaa][..], &[0, 0, 1, 0x65, 0xbb][..], &[0, 0, 1][..]].concat();
		let out = ex.push(&stream);

		assert_eq!(
			out,
			vec![
				Bytes::from(annexb(0x67, &[0xaa])),
				Bytes::from(annexb(0x65, &[0xbb])),
			]
		);
	}

	#[test]
	fn test_annexb_split_across_chunks_with_garbage() {
		let mut ex = UnitExtractor::default();

		let sps = annexb(0x67, &[0x01]);
		let idr = annexb(0x65, &[0x02, 0x03]);
		let p = annexb(0x61, &[0x04]);

		let mut stream = vec![b'X'; 9];
		stream.extend_from_slice(&sps);
		stream.extend_from_slice(&idr);
		stream.extend_from_slice(&p);

		let mut out = Vec::new();
		out.extend(ex.push(&stream[..5]));
		out.extend(ex.push(&stream[5..12]));
		out.extend(ex.push(&stream[12..]));

		// P is held until the next start code arrives.
		assert_eq!(out, vec![Bytes::from(sps), Bytes::from(idr)]);

		out.extend(ex.push(&START_CODE));
		assert_eq!(out.last(), Some(&Bytes::from(p)));
	}

	#[test]
	fn test_length_prefixed_converts_to_annexb() {
		let mut ex = UnitExtractor::default();

		let sps_payload = [0x67, 0x11, 0x22, 0x33];
		let idr_payload = [0x65, 0x44, 0x55];

		let mut stream = (sps_payload.len() as u32).to_be_bytes().to_vec();
		stream.extend_from_slice(&sps_payload);
		stream.extend_from_slice(&(idr_payload.len() as u32).to_be_bytes());
		stream.extend_from_slice(&idr_payload);

		// Feed in two chunks to exercise buffering.
		let out1 = ex.push(&stream[..5]);
		let out2 = ex.push(&stream[5..]);

		assert!(out1.is_empty());
		assert_eq!(
			out2,
			vec![
				Bytes::from([&START_CODE[..], &sps_payload[..]].concat()),
				Bytes::from([&START_CODE[..], &idr_payload[..]].concat()),
			]
		);
	}

	#[test]
	fn test_length_prefixed_skips_leading_garbage() {
		let mut ex = UnitExtractor::default();

		let payload = [0x67, 0xaa];
		let mut stream = vec![b'X'; 9];
		stream.extend_from_slice(&(payload.len() as u32).to_be_bytes());
		stream.extend_from_slice(&payload);

		let out = ex.push(&stream);
		assert_eq!(out, vec![Bytes::from([&START_CODE[..], &payload[..]].concat())]);
	}

	#[test]
	fn test_length_prefixed_oversize_resets() {
		let mut ex = UnitExtractor::default();

		let payload = [0x67, 0x01];
		let mut stream = (payload.len() as u32).to_be_bytes().to_vec();
		stream.extend_from_slice(&payload);
		assert_eq!(ex.push(&stream).len(), 1);

		// An implausible length wipes the buffer instead of stalling forever.
		let bogus = ((MAX_NAL + 1) as u32).to_be_bytes();
		assert!(ex.push(&bogus).is_empty());
		assert!(ex.push(&[0xff; 16]).is_empty());

		// The extractor recovers on the next clean unit.
		let out = ex.push(&stream);
		assert_eq!(out, vec![Bytes::from([&START_CODE[..], &payload[..]].concat())]);
	}

	#[test]
	fn test_buffer_cap_discards_oldest() {
		let mut ex = UnitExtractor::default();

		// No start code anywhere; the buffer must stay bounded.
		assert!(ex.push(&vec![0xff; MAX_BUFFER + 4096]).is_empty());

		let nal = annexb(0x67, &[0x01]);
		let mut stream = nal.clone();
		stream.extend_from_slice(&START_CODE);

		let out = ex.push(&stream);
		assert_eq!(out, vec![Bytes::from(nal)]);
	}

	#[test]
	fn test_nal_type() {
		assert_eq!(nal_type(&annexb(0x67, &[0x01])), Some(NalType::Sps));
		assert_eq!(nal_type(&annexb(0x65, &[0x01])), Some(NalType::IdrSlice));
		assert_eq!(nal_type(&annexb(0x41, &[0x01])), Some(NalType::NonIdrSlice));
		assert_eq!(nal_type(&START_CODE), None);
	}
}
