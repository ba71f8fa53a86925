//! Storage adapter: record, descriptor, and index streams over a [`Vfs`].
//!
//! Nothing above this layer touches a byte stream directly. Records and
//! transaction descriptors go through the `linedoc` codec — serializing a
//! descriptor exactly like an ordinary record means recovery only ever
//! needs one codec. Index files are streamed line by line through a
//! fixed-size buffer; a line that does not fit is an error, never a silent
//! truncation.

use crate::vfs::Vfs;
use crate::{Error, Result};
use linedoc::Document;
use std::io::{BufReader, Read, Write};

pub(crate) struct Storage<V: Vfs> {
	vfs: V,
}

impl<V: Vfs> Storage<V> {
	pub fn new(vfs: V) -> Storage<V> {
		Storage { vfs }
	}

	pub fn vfs(&self) -> &V {
		&self.vfs
	}

	pub fn exists(&self, path: &str) -> bool {
		self.vfs.exists(path)
	}

	pub fn is_dir(&self, path: &str) -> bool {
		self.vfs.is_dir(path)
	}

	pub fn mkdir(&self, path: &str) -> bool {
		self.vfs.mkdir(path)
	}

	pub fn remove(&self, path: &str) -> bool {
		self.vfs.remove(path)
	}

	pub fn rename(&self, old: &str, new: &str) -> bool {
		self.vfs.rename(old, new)
	}

	pub fn child_names(&self, dir: &str) -> std::io::Result<Vec<String>> {
		self.vfs.child_names(dir)
	}

	/// Load a record (or a transaction descriptor) from `path`.
	pub fn load_record(&self, path: &str) -> Result<Document> {
		let reader = BufReader::new(self.vfs.open_read(path)?);
		Ok(Document::read_from(reader)?)
	}

	/// Load a record from `path` into an existing document, preserving the
	/// document's own type and serial version.
	pub fn load_record_into(&self, path: &str, doc: &mut Document) -> Result<()> {
		let reader = BufReader::new(self.vfs.open_read(path)?);
		doc.merge_from(reader)?;
		Ok(())
	}

	/// Write a record to `path`, replacing any existing content.
	pub fn write_record(&self, path: &str, doc: &Document) -> Result<()> {
		let mut writer = self.vfs.open_write(path)?;
		doc.write_to(&mut writer)?;
		writer.flush()?;
		Ok(())
	}

	/// Write a transaction descriptor. Same wire format as a record; kept
	/// separate so call sites read as what they are.
	pub fn write_descriptor(&self, path: &str, doc: &Document) -> Result<()> {
		self.write_record(path, doc)
	}

	/// Append a single `key=value` line to an index file, creating it if
	/// missing.
	pub fn append_index_line(&self, path: &str, key: &str, value: &str) -> Result<()> {
		let mut writer = self.vfs.open_append(path)?;
		writeln!(writer, "{}={}", key, value)?;
		writer.flush()?;
		Ok(())
	}

	/// Open an index file for line-bounded reading.
	pub fn read_index(&self, path: &str) -> Result<LineStream<Box<dyn Read>>> {
		let reader = self.vfs.open_read(path)?;
		Ok(LineStream::new(reader, self.vfs.line_buffer_size()))
	}

	/// Open the staged rewrite target of an index, truncating it.
	pub fn write_index(&self, path: &str) -> Result<LineSink> {
		Ok(LineSink {
			writer: self.vfs.open_write(path)?,
		})
	}
}

/// Writes index lines, re-adding the LF the reader stripped.
pub(crate) struct LineSink {
	writer: Box<dyn Write>,
}

impl LineSink {
	pub fn emit(&mut self, line: &str) -> std::io::Result<()> {
		self.writer.write_all(line.as_bytes())?;
		self.writer.write_all(b"\n")
	}

	pub fn emit_entry(&mut self, key: &str, value: &str) -> std::io::Result<()> {
		writeln!(self.writer, "{}={}", key, value)
	}

	pub fn finish(mut self) -> std::io::Result<()> {
		self.writer.flush()
	}
}

/// Streams LF-terminated lines through a buffer of fixed capacity.
///
/// The trailing LF on the final line is optional. A line longer than the
/// capacity yields `InvalidData`.
pub(crate) struct LineStream<R: Read> {
	reader: R,
	/// bytes read but not yet consumed
	pending: Vec<u8>,
	line: Vec<u8>,
	capacity: usize,
	eof: bool,
}

impl<R: Read> LineStream<R> {
	pub fn new(reader: R, capacity: usize) -> LineStream<R> {
		LineStream {
			reader,
			pending: Vec::with_capacity(capacity),
			line: Vec::with_capacity(capacity),
			capacity,
			eof: false,
		}
	}

	/// The next line without its LF, or `None` at end of stream.
	pub fn next_line(&mut self) -> Result<Option<&str>> {
		self.line.clear();
		loop {
			if let Some(pos) = memchr::memchr(b'\n', &self.pending) {
				self.push_to_line(pos)?;
				self.pending.drain(..=pos);
				return Ok(Some(self.current()?));
			}
			if self.eof {
				if self.pending.is_empty() && self.line.is_empty() {
					return Ok(None);
				}
				let len = self.pending.len();
				self.push_to_line(len)?;
				self.pending.clear();
				return Ok(Some(self.current()?));
			}
			let mut chunk = [0u8; 64];
			let n = self.reader.read(&mut chunk)?;
			if n == 0 {
				self.eof = true;
			} else {
				self.pending.extend_from_slice(&chunk[..n]);
			}
		}
	}

	fn push_to_line(&mut self, upto: usize) -> Result<()> {
		if self.line.len() + upto > self.capacity {
			return Err(Error::Io(std::io::Error::new(
				std::io::ErrorKind::InvalidData,
				format!("index line exceeds {} bytes", self.capacity),
			)));
		}
		self.line.extend_from_slice(&self.pending[..upto]);
		Ok(())
	}

	fn current(&self) -> Result<&str> {
		std::str::from_utf8(&self.line).map_err(|_| {
			Error::Io(std::io::Error::new(
				std::io::ErrorKind::InvalidData,
				"index line is not valid UTF-8",
			))
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn lines_of(bytes: &[u8], cap: usize) -> Vec<String> {
		let mut stream = LineStream::new(bytes, cap);
		let mut out = Vec::new();
		while let Some(line) = stream.next_line().unwrap() {
			out.push(line.to_owned());
		}
		out
	}

	#[test]
	fn splits_lines() {
		assert_eq!(lines_of(b"a=1\nb=2\n", 64), ["a=1", "b=2"]);
		// missing trailing LF on the last line
		assert_eq!(lines_of(b"a=1\nb=2", 64), ["a=1", "b=2"]);
		assert_eq!(lines_of(b"", 64), Vec::<String>::new());
		assert_eq!(lines_of(b"\n\n", 64), ["", ""]);
	}

	#[test]
	fn long_lines_span_chunks() {
		let line = "k".repeat(100);
		let bytes = format!("{line}=v\nz=1\n");
		assert_eq!(
			lines_of(bytes.as_bytes(), 128),
			[format!("{line}=v"), "z=1".to_owned()]
		);
	}

	#[test]
	fn overlong_line_is_an_error() {
		let bytes = format!("{}\n", "x".repeat(65));
		let mut stream = LineStream::new(bytes.as_bytes(), 64);
		assert!(stream.next_line().is_err());
	}
}
