//! Line-oriented key/value documents.
//!
//! A document is an insertion-ordered multimap of string keys to string
//! values, stored as plain text: one `key=value` line per entry, LF
//! terminated. The `=` separator is the first occurrence on the line, so
//! values may themselves contain `=`. Whitespace around both key and value
//! is stripped on read and never emitted on write.
//!
//! Typed documents additionally carry a header line of the form
//! `@<type_id>:<version>` before the body. Untyped documents have no
//! header at all, which keeps the format usable for internal bookkeeping
//! files that are nothing but key/value pairs.

use compact_str::CompactString;
use std::io::{BufRead, Write};

/// An insertion-ordered `key=value` document.
///
/// Lookups are linear; documents are expected to stay small (tens of
/// entries), which also keeps peak memory predictable on constrained
/// hosts.
#[derive(Debug, Clone, Default)]
pub struct Document {
	type_id: Option<u16>,
	serial_version: u16,
	deserialized_version: u16,
	entries: Vec<(CompactString, CompactString)>,
}

impl Document {
	/// An empty, untyped document. No header line is written for these.
	pub fn new() -> Document {
		Document::default()
	}

	/// An empty document carrying a type id and serial version header.
	pub fn typed(type_id: u16, serial_version: u16) -> Document {
		Document {
			type_id: Some(type_id),
			serial_version,
			..Document::default()
		}
	}

	pub fn type_id(&self) -> Option<u16> {
		self.type_id
	}

	pub fn serial_version(&self) -> u16 {
		self.serial_version
	}

	/// The version found in the header the last time this document was
	/// populated from a stream. Zero if it never was.
	pub fn deserialized_version(&self) -> u16 {
		self.deserialized_version
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// The value of the first entry with this key.
	pub fn get(&self, key: &str) -> Option<&str> {
		self.entries
			.iter()
			.find(|(k, _)| *k == key)
			.map(|(_, v)| v.as_str())
	}

	pub fn contains(&self, key: &str) -> bool {
		self.entries.iter().any(|(k, _)| *k == key)
	}

	/// Replace the value of an existing key in place, or append a new
	/// entry. Insertion order of existing entries is preserved.
	pub fn put(&mut self, key: &str, value: &str) {
		if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
			slot.1 = CompactString::new(value);
		} else {
			self.entries
				.push((CompactString::new(key), CompactString::new(value)));
		}
	}

	/// `put` with an empty value.
	pub fn put_empty(&mut self, key: &str) {
		self.put(key, "");
	}

	/// Remove the entry with this key. Returns whether it existed.
	pub fn remove(&mut self, key: &str) -> bool {
		let before = self.entries.len();
		self.entries.retain(|(k, _)| *k != key);
		before != self.entries.len()
	}

	/// Entries in insertion order.
	pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
		self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	/// Read a document from a stream, replacing any existing entries.
	///
	/// A leading `@type:version` header makes the document typed; without
	/// one it is untyped and `deserialized_version` stays at zero.
	pub fn read_from(reader: impl BufRead) -> std::io::Result<Document> {
		let mut doc = Document::new();
		doc.merge_from(reader)?;
		Ok(doc)
	}

	/// Populate this document from a stream, keeping its own `type_id` and
	/// `serial_version` but recording the stream's header version as
	/// `deserialized_version`. Existing entries are discarded.
	pub fn merge_from(&mut self, reader: impl BufRead) -> std::io::Result<()> {
		self.entries.clear();
		let mut first = true;
		for line in reader.lines() {
			let line = line?;
			let line = line.trim();
			if first {
				first = false;
				if let Some(rest) = line.strip_prefix('@') {
					let (tid, version) = parse_header(rest).ok_or_else(|| {
						std::io::Error::new(
							std::io::ErrorKind::InvalidData,
							format!("malformed document header: {:?}", line),
						)
					})?;
					if self.type_id.is_none() {
						self.type_id = Some(tid);
						self.serial_version = version;
					}
					self.deserialized_version = version;
					continue;
				}
			}
			if line.is_empty() {
				continue;
			}
			let (key, value) = split_line(line);
			if key.is_empty() {
				continue;
			}
			self.entries.push((
				CompactString::new(key),
				CompactString::new(value.unwrap_or("")),
			));
		}
		Ok(())
	}

	/// Write the document: header (typed documents only) then one
	/// `key=value` line per entry, in insertion order.
	pub fn write_to(&self, mut writer: impl Write) -> std::io::Result<()> {
		if let Some(tid) = self.type_id {
			writeln!(writer, "@{}:{}", tid, self.serial_version)?;
		}
		for (k, v) in &self.entries {
			writeln!(writer, "{}={}", k, v)?;
		}
		Ok(())
	}
}

/// Split one body line at the first `=`, trimming whitespace around both
/// halves. Returns `(key, None)` for a line with no separator.
pub fn split_line(line: &str) -> (&str, Option<&str>) {
	match memchr::memchr(b'=', line.as_bytes()) {
		Some(pos) => (line[..pos].trim(), Some(line[pos + 1..].trim())),
		None => (line.trim(), None),
	}
}

fn parse_header(rest: &str) -> Option<(u16, u16)> {
	let colon = memchr::memchr(b':', rest.as_bytes())?;
	let tid = rest[..colon].trim().parse().ok()?;
	let version = rest[colon + 1..].trim().parse().ok()?;
	Some((tid, version))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn put_get_ordering() {
		let mut d = Document::new();
		d.put("b", "2");
		d.put("a", "1");
		d.put("b", "3");
		assert_eq!(d.get("b"), Some("3"));
		let keys: Vec<&str> = d.entries().map(|(k, _)| k).collect();
		assert_eq!(keys, ["b", "a"]);
	}

	#[test]
	fn untyped_round_trip() {
		let mut d = Document::new();
		d.put("path/one", "work/3.tmp");
		d.put("x", "a=b=c");
		d.put_empty("flag");
		let mut out = Vec::new();
		d.write_to(&mut out).unwrap();
		assert_eq!(out, b"path/one=work/3.tmp\nx=a=b=c\nflag=\n");

		let back = Document::read_from(&out[..]).unwrap();
		assert_eq!(back.type_id(), None);
		assert_eq!(back.get("x"), Some("a=b=c"));
		assert_eq!(back.get("flag"), Some(""));
	}

	#[test]
	fn typed_round_trip() {
		let mut d = Document::typed(7, 2);
		d.put("name", "door sensor");
		let mut out = Vec::new();
		d.write_to(&mut out).unwrap();
		assert!(out.starts_with(b"@7:2\n"));

		let back = Document::read_from(&out[..]).unwrap();
		assert_eq!(back.type_id(), Some(7));
		assert_eq!(back.serial_version(), 2);
		assert_eq!(back.deserialized_version(), 2);
		assert_eq!(back.get("name"), Some("door sensor"));
	}

	#[test]
	fn merge_keeps_own_version() {
		let mut newer = Document::typed(7, 3);
		newer.put("name", "n");
		let mut out = Vec::new();
		newer.write_to(&mut out).unwrap();

		let mut old_code = Document::typed(7, 2);
		old_code.merge_from(&out[..]).unwrap();
		assert_eq!(old_code.serial_version(), 2);
		assert_eq!(old_code.deserialized_version(), 3);
	}

	#[test]
	fn read_trims_and_skips_blanks() {
		let text = b"  a  =  1  \n\n junk \nb=\n";
		let d = Document::read_from(&text[..]).unwrap();
		assert_eq!(d.get("a"), Some("1"));
		assert_eq!(d.get("junk"), Some(""));
		assert_eq!(d.get("b"), Some(""));
		assert_eq!(d.len(), 3);
	}

	#[test]
	fn bad_header_is_an_error() {
		assert!(Document::read_from(&b"@seven:2\nk=v\n"[..]).is_err());
	}
}
