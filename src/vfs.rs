//! Filesystem capabilities behind a trait.
//!
//! The engine only ever needs a small capability set — existence checks,
//! mkdir/remove/rename, directory listing, and byte streams — always
//! addressed by canonical absolute paths like `/DATA/~WORK/3.tmp`. Keeping
//! that surface behind [`Vfs`] lets the same engine run against a real
//! block device directory or an in-memory mock with fault injection.
//!
//! Boolean operations return `false` on *any* underlying error; partial
//! success is never claimed. `rename` is assumed atomic at the filesystem
//! layer.

use antidote::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Default size of the line buffer used when streaming index files.
pub const DEFAULT_LINE_BUFFER: usize = 64;

pub trait Vfs {
	fn exists(&self, path: &str) -> bool;
	fn is_dir(&self, path: &str) -> bool;
	/// Create a directory. Not recursive; the parent must already exist.
	fn mkdir(&self, path: &str) -> bool;
	fn remove(&self, path: &str) -> bool;
	/// Atomically rename `old` to `new`.
	fn rename(&self, old: &str, new: &str) -> bool;
	/// Short names of the entries directly under `dir`.
	fn child_names(&self, dir: &str) -> std::io::Result<Vec<String>>;
	fn open_read(&self, path: &str) -> std::io::Result<Box<dyn Read>>;
	/// Open for writing, truncating any existing content.
	fn open_write(&self, path: &str) -> std::io::Result<Box<dyn Write>>;
	/// Open for writing, appending to any existing content.
	fn open_append(&self, path: &str) -> std::io::Result<Box<dyn Write>>;
	/// Longest index line this filesystem's streams will carry.
	fn line_buffer_size(&self) -> usize {
		DEFAULT_LINE_BUFFER
	}
}

/// Real filesystem variant: maps the engine's absolute namespace onto a
/// host directory, so engine path `/DATA/foo.txt` lands at
/// `<base>/DATA/foo.txt`.
///
/// Opening takes an exclusive `fs2` lock on a `.lock` file in the base
/// directory; a second process opening the same base fails. The lock is
/// held for the lifetime of the value.
pub struct DiskVfs {
	base: PathBuf,
	_lock: std::fs::File,
}

impl DiskVfs {
	pub fn open(base: impl Into<PathBuf>) -> std::io::Result<DiskVfs> {
		use fs2::FileExt;
		let base = base.into();
		std::fs::create_dir_all(&base)?;
		let lock = std::fs::File::create(base.join(".lock"))?;
		lock.try_lock_exclusive()?;
		Ok(DiskVfs { base, _lock: lock })
	}

	fn host(&self, path: &str) -> PathBuf {
		self.base.join(path.trim_start_matches('/'))
	}
}

impl Vfs for DiskVfs {
	fn exists(&self, path: &str) -> bool {
		self.host(path).symlink_metadata().is_ok()
	}

	fn is_dir(&self, path: &str) -> bool {
		self.host(path).is_dir()
	}

	fn mkdir(&self, path: &str) -> bool {
		std::fs::create_dir(self.host(path)).is_ok()
	}

	fn remove(&self, path: &str) -> bool {
		let host = self.host(path);
		if host.is_dir() {
			std::fs::remove_dir(host).is_ok()
		} else {
			std::fs::remove_file(host).is_ok()
		}
	}

	fn rename(&self, old: &str, new: &str) -> bool {
		std::fs::rename(self.host(old), self.host(new)).is_ok()
	}

	fn child_names(&self, dir: &str) -> std::io::Result<Vec<String>> {
		let mut names = Vec::new();
		for entry in std::fs::read_dir(self.host(dir))? {
			names.push(entry?.file_name().to_string_lossy().into_owned());
		}
		names.sort();
		Ok(names)
	}

	fn open_read(&self, path: &str) -> std::io::Result<Box<dyn Read>> {
		Ok(Box::new(std::fs::File::open(self.host(path))?))
	}

	fn open_write(&self, path: &str) -> std::io::Result<Box<dyn Write>> {
		Ok(Box::new(std::fs::File::create(self.host(path))?))
	}

	fn open_append(&self, path: &str) -> std::io::Result<Box<dyn Write>> {
		Ok(Box::new(
			std::fs::OpenOptions::new()
				.create(true)
				.append(true)
				.open(self.host(path))?,
		))
	}
}

/// In-memory mock variant, for tests.
///
/// Clones share the same underlying state, so a test can hold one handle
/// while the engine owns another. `fail_after` arms a budget of
/// filesystem calls: once spent, every subsequent call fails, which is
/// how the crash-interruption tests stop a commit at an arbitrary point.
#[derive(Clone)]
pub struct MemVfs {
	state: Arc<Mutex<MemState>>,
}

#[derive(Default)]
struct MemState {
	dirs: BTreeSet<String>,
	files: BTreeMap<String, Vec<u8>>,
	remaining_ops: Option<u64>,
}

impl MemState {
	/// Spend one unit of the fault budget. Returns false once exhausted.
	fn tick(&mut self) -> bool {
		match self.remaining_ops {
			None => true,
			Some(0) => false,
			Some(ref mut n) => {
				*n -= 1;
				true
			}
		}
	}

	fn parent_is_dir(&self, path: &str) -> bool {
		match memchr::memrchr(b'/', path.as_bytes()) {
			Some(0) => true, // "/" always exists
			Some(pos) => self.dirs.contains(&path[..pos]),
			None => false,
		}
	}
}

impl Default for MemVfs {
	fn default() -> MemVfs {
		MemVfs::new()
	}
}

impl MemVfs {
	pub fn new() -> MemVfs {
		MemVfs {
			state: Arc::new(Mutex::new(MemState::default())),
		}
	}

	/// Fail every filesystem call after the next `n` calls succeed.
	pub fn fail_after(&self, n: u64) {
		self.state.lock().remaining_ops = Some(n);
	}

	/// Disarm `fail_after`.
	pub fn clear_faults(&self) {
		self.state.lock().remaining_ops = None;
	}

	/// Raw bytes of a file, for assertions.
	pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
		self.state.lock().files.get(path).cloned()
	}

	/// Plant a file without going through the engine.
	pub fn put_file(&self, path: &str, bytes: &[u8]) {
		self.state.lock().files.insert(path.to_owned(), bytes.to_vec());
	}
}

impl Vfs for MemVfs {
	fn exists(&self, path: &str) -> bool {
		let mut s = self.state.lock();
		if !s.tick() {
			return false;
		}
		s.files.contains_key(path) || s.dirs.contains(path)
	}

	fn is_dir(&self, path: &str) -> bool {
		let mut s = self.state.lock();
		if !s.tick() {
			return false;
		}
		path == "/" || s.dirs.contains(path)
	}

	fn mkdir(&self, path: &str) -> bool {
		let mut s = self.state.lock();
		if !s.tick() {
			return false;
		}
		if s.dirs.contains(path) || s.files.contains_key(path) || !s.parent_is_dir(path) {
			return false;
		}
		s.dirs.insert(path.to_owned())
	}

	fn remove(&self, path: &str) -> bool {
		let mut s = self.state.lock();
		if !s.tick() {
			return false;
		}
		s.files.remove(path).is_some() || s.dirs.remove(path)
	}

	fn rename(&self, old: &str, new: &str) -> bool {
		let mut s = self.state.lock();
		if !s.tick() {
			return false;
		}
		if !s.parent_is_dir(new) {
			return false;
		}
		match s.files.remove(old) {
			Some(bytes) => {
				s.files.insert(new.to_owned(), bytes);
				true
			}
			None => false,
		}
	}

	fn child_names(&self, dir: &str) -> std::io::Result<Vec<String>> {
		let mut s = self.state.lock();
		if !s.tick() {
			return Err(std::io::Error::new(
				std::io::ErrorKind::Other,
				"injected fault",
			));
		}
		if dir != "/" && !s.dirs.contains(dir) {
			return Err(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("no such directory: {dir}"),
			));
		}
		let prefix = format!("{}/", dir.trim_end_matches('/'));
		let mut names: Vec<String> = s
			.files
			.keys()
			.chain(s.dirs.iter())
			.filter_map(|p| p.strip_prefix(&prefix))
			.filter(|rest| !rest.is_empty() && !rest.contains('/'))
			.map(str::to_owned)
			.collect();
		names.sort();
		names.dedup();
		Ok(names)
	}

	fn open_read(&self, path: &str) -> std::io::Result<Box<dyn Read>> {
		let mut s = self.state.lock();
		if !s.tick() {
			return Err(std::io::Error::new(
				std::io::ErrorKind::Other,
				"injected fault",
			));
		}
		match s.files.get(path) {
			Some(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
			None => Err(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("no such file: {path}"),
			)),
		}
	}

	fn open_write(&self, path: &str) -> std::io::Result<Box<dyn Write>> {
		let mut s = self.state.lock();
		if !s.tick() {
			return Err(std::io::Error::new(
				std::io::ErrorKind::Other,
				"injected fault",
			));
		}
		if !s.parent_is_dir(path) {
			return Err(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("parent missing: {path}"),
			));
		}
		s.files.insert(path.to_owned(), Vec::new());
		Ok(Box::new(MemWriter {
			state: self.state.clone(),
			path: path.to_owned(),
			buf: Vec::new(),
		}))
	}

	fn open_append(&self, path: &str) -> std::io::Result<Box<dyn Write>> {
		let mut s = self.state.lock();
		if !s.tick() {
			return Err(std::io::Error::new(
				std::io::ErrorKind::Other,
				"injected fault",
			));
		}
		if !s.parent_is_dir(path) {
			return Err(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("parent missing: {path}"),
			));
		}
		let buf = s.files.get(path).cloned().unwrap_or_default();
		s.files.entry(path.to_owned()).or_default();
		Ok(Box::new(MemWriter {
			state: self.state.clone(),
			path: path.to_owned(),
			buf,
		}))
	}
}

/// Buffers writes, committing the whole body on flush/drop.
struct MemWriter {
	state: Arc<Mutex<MemState>>,
	path: String,
	buf: Vec<u8>,
}

impl Write for MemWriter {
	fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
		self.buf.extend_from_slice(data);
		Ok(data.len())
	}

	fn flush(&mut self) -> std::io::Result<()> {
		let mut s = self.state.lock();
		s.files.insert(self.path.clone(), self.buf.clone());
		Ok(())
	}
}

impl Drop for MemWriter {
	fn drop(&mut self) {
		let _ = self.flush();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mem_tree_basics() {
		let v = MemVfs::new();
		assert!(v.mkdir("/DATA"));
		assert!(!v.mkdir("/DATA"));
		assert!(!v.mkdir("/DATA/a/b"));
		assert!(v.mkdir("/DATA/a"));
		assert!(v.is_dir("/DATA/a"));
		assert!(!v.is_dir("/DATA/nope"));

		{
			let mut w = v.open_write("/DATA/a/f.txt").unwrap();
			w.write_all(b"hello").unwrap();
		}
		assert!(v.exists("/DATA/a/f.txt"));
		assert_eq!(v.contents("/DATA/a/f.txt").unwrap(), b"hello");

		{
			let mut w = v.open_append("/DATA/a/f.txt").unwrap();
			w.write_all(b" world").unwrap();
		}
		assert_eq!(v.contents("/DATA/a/f.txt").unwrap(), b"hello world");

		assert!(v.rename("/DATA/a/f.txt", "/DATA/g.txt"));
		assert!(!v.exists("/DATA/a/f.txt"));
		assert_eq!(v.child_names("/DATA").unwrap(), ["a", "g.txt"]);
		assert!(v.remove("/DATA/g.txt"));
		assert!(!v.remove("/DATA/g.txt"));
	}

	#[test]
	fn fault_budget() {
		let v = MemVfs::new();
		assert!(v.mkdir("/DATA"));
		v.fail_after(2);
		assert!(v.exists("/DATA"));
		assert!(v.mkdir("/DATA/x"));
		assert!(!v.exists("/DATA")); // budget spent
		assert!(!v.mkdir("/DATA/y"));
		v.clear_faults();
		assert!(v.exists("/DATA"));
	}

	#[test]
	fn disk_round_trip() {
		let t = tempfile::TempDir::new().unwrap();
		let v = DiskVfs::open(t.path()).unwrap();
		assert!(v.mkdir("/DATA"));
		{
			let mut w = v.open_write("/DATA/f.txt").unwrap();
			w.write_all(b"abc").unwrap();
		}
		let mut out = String::new();
		v.open_read("/DATA/f.txt")
			.unwrap()
			.read_to_string(&mut out)
			.unwrap();
		assert_eq!(out, "abc");
		assert!(v.rename("/DATA/f.txt", "/DATA/g.txt"));
		assert!(v.exists("/DATA/g.txt"));
		assert!(DiskVfs::open(t.path()).is_err()); // second opener is locked out
	}
}
