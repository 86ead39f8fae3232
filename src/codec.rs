//! Little-endian binary primitives shared by the collection database and
//! the song serializers.

use std::io::{self, Read, Write};

macro_rules! read_le {
	($t: ty, $r: ident) => {{
		let mut buf = [0; (<$t>::BITS / 8) as usize];
		$r.read_exact(&mut buf).map(|_| <$t>::from_le_bytes(buf))
	}};
}

/// Width of the length prefix written in front of a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
	U8,
	U16,
}

impl Width {
	#[inline]
	const fn max(self) -> usize {
		match self {
			Self::U8 => u8::MAX as usize,
			Self::U16 => u16::MAX as usize,
		}
	}
}

pub fn write_u32(w: &mut dyn Write, v: u32) -> io::Result<()> {
	w.write_all(&v.to_le_bytes())
}

pub fn write_u64(w: &mut dyn Write, v: u64) -> io::Result<()> {
	w.write_all(&v.to_le_bytes())
}

pub fn write_str(w: &mut dyn Write, s: &str, width: Width) -> io::Result<()> {
	let len = s.len();
	if len > width.max() {
		return Err(io::Error::new(
			io::ErrorKind::InvalidInput,
			format!("string of {len} bytes does not fit a {width:?} length prefix"),
		));
	}

	match width {
		Width::U8 => w.write_all(&[len as u8])?,
		Width::U16 => w.write_all(&(len as u16).to_le_bytes())?,
	}
	w.write_all(s.as_bytes())
}

pub fn read_u32(r: &mut dyn Read) -> io::Result<u32> {
	read_le!(u32, r)
}

pub fn read_u64(r: &mut dyn Read) -> io::Result<u64> {
	read_le!(u64, r)
}

pub fn read_str(r: &mut dyn Read, width: Width) -> io::Result<String> {
	read_str_opt(r, width)?.ok_or_else(|| io::ErrorKind::UnexpectedEof.into())
}

/// Like [`read_str`] but a clean end of stream before the length prefix
/// yields `None`.
pub fn read_str_opt(r: &mut dyn Read, width: Width) -> io::Result<Option<String>> {
	let mut first = [0u8; 1];
	loop {
		match r.read(&mut first) {
			Ok(0) => return Ok(None),
			Ok(_) => break,
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => return Err(e),
		}
	}

	let len = match width {
		Width::U8 => first[0] as usize,
		Width::U16 => {
			let second = read_le!(u8, r)?;
			u16::from_le_bytes([first[0], second]) as usize
		}
	};

	let mut data = vec![0; len];
	r.read_exact(&mut data)?;

	String::from_utf8(data)
		.map(Some)
		.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn prefixes_are_little_endian() {
		let mut buf = Vec::new();
		write_str(&mut buf, "ab", Width::U16).unwrap();
		write_u32(&mut buf, 0x0102_0304).unwrap();

		assert_eq!(buf, [2, 0, b'a', b'b', 4, 3, 2, 1]);
	}

	#[test]
	fn oversized_string_is_rejected() {
		let long = "x".repeat(256);
		let err = write_str(&mut Vec::new(), &long, Width::U8).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
	}

	#[test]
	fn clean_eof_reads_as_none() {
		let mut empty: &[u8] = &[];
		assert!(read_str_opt(&mut empty, Width::U16).unwrap().is_none());

		let mut truncated: &[u8] = &[5, b'a'];
		let err = read_str(&mut truncated, Width::U8).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
	}

	#[test]
	fn reads_back_mixed_record() {
		let mut buf = Vec::new();
		write_u64(&mut buf, 3).unwrap();
		write_str(&mut buf, "yt", Width::U8).unwrap();
		write_str(&mut buf, "", Width::U16).unwrap();

		let mut r = buf.as_slice();
		assert_eq!(read_u64(&mut r).unwrap(), 3);
		assert_eq!(read_str(&mut r, Width::U8).unwrap(), "yt");
		assert_eq!(read_str(&mut r, Width::U16).unwrap(), "");
		assert!(read_str_opt(&mut r, Width::U8).unwrap().is_none());
	}
}
