//! Canonical path handling under the configured root directory.
//!
//! Every name an application hands the engine is resolved to a bounded
//! absolute path below the root before any filesystem call is made. The
//! root itself is a single path component (`/LOGGER`, never `/a/b`), so
//! the whole namespace stays within FAT16's comfort zone.

use crate::{Error, Result};

/// Longest canonical path the engine will produce or accept, in bytes.
/// Anything longer is rejected outright rather than truncated.
pub const MAX_PATH: usize = 64;

const WORK_DIR_NAME: &str = "~WORK";
const IDX_DIR_NAME: &str = "~IDX";
const INDEX_EXT: &str = ".idx";

/// Resolves application-supplied names to canonical absolute paths.
#[derive(Debug, Clone)]
pub(crate) struct PathResolver {
	root: String,
	work_dir: String,
	idx_dir: String,
}

impl PathResolver {
	/// Validate and adopt a root directory name.
	///
	/// The name is trimmed, given a leading `/` if it lacks one, and must
	/// then match `/[A-Za-z0-9_]+` — no nested roots.
	pub fn new(root: &str) -> Result<PathResolver> {
		let trimmed = root.trim();
		if trimmed.is_empty() {
			return Err(Error::InvalidName("empty root directory".into()));
		}
		let root = if trimmed.starts_with('/') {
			trimmed.to_owned()
		} else {
			format!("/{}", trimmed)
		};
		let body = &root[1..];
		if body.is_empty() || !body.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
			return Err(Error::InvalidName(format!(
				"root must be a single /[A-Za-z0-9_]+ component, got {:?}",
				root
			)));
		}
		let mut resolver = PathResolver {
			root,
			work_dir: String::new(),
			idx_dir: String::new(),
		};
		resolver.work_dir = resolver.canonical(WORK_DIR_NAME)?;
		resolver.idx_dir = resolver.canonical(IDX_DIR_NAME)?;
		Ok(resolver)
	}

	pub fn root(&self) -> &str {
		&self.root
	}

	pub fn work_dir(&self) -> &str {
		&self.work_dir
	}

	pub fn idx_dir(&self) -> &str {
		&self.idx_dir
	}

	/// Prefix `name` with the root directory if it is not already.
	///
	/// ```text
	/// foo.txt            ->  /<root>/foo.txt
	/// /foo.txt           ->  /<root>/foo.txt
	/// /<root>/foo.txt    ->  /<root>/foo.txt
	/// ```
	pub fn canonical(&self, name: &str) -> Result<String> {
		if name.trim().is_empty() {
			return Err(Error::InvalidName("empty name".into()));
		}
		let out = if name.starts_with(&self.root)
			&& name[self.root.len()..].starts_with('/')
		{
			name.to_owned()
		} else if name.starts_with('/') {
			format!("{}{}", self.root, name)
		} else {
			format!("{}/{}", self.root, name)
		};
		if out.len() > MAX_PATH {
			return Err(Error::InvalidName(format!(
				"path exceeds {} bytes: {:?}",
				MAX_PATH, out
			)));
		}
		Ok(out)
	}

	/// Canonical path of the file backing a named index:
	/// `<root>/~IDX/<name>.idx`.
	pub fn index_path(&self, idx_name: &str) -> Result<String> {
		if idx_name.trim().is_empty() {
			return Err(Error::InvalidName("empty index name".into()));
		}
		let out = format!("{}/{}{}", self.idx_dir, idx_name, INDEX_EXT);
		if out.len() > MAX_PATH {
			return Err(Error::InvalidName(format!(
				"index path exceeds {} bytes: {:?}",
				MAX_PATH, out
			)));
		}
		Ok(out)
	}
}

/// Whether `name` is a legal FAT16 8.3 short name: 1-8 characters, then
/// optionally a single `.` and a 1-3 character extension.
pub(crate) fn is_valid_short_name(name: &str) -> bool {
	if name.is_empty() {
		return false;
	}
	let bytes = name.as_bytes();
	if bytes[0] == b'.' || bytes[bytes.len() - 1] == b'.' {
		return false;
	}
	if bytes.iter().filter(|&&b| b == b'.').count() > 1 {
		return false;
	}
	let (stem_len, ext_len) = match memchr::memchr(b'.', bytes) {
		Some(pos) => (pos, bytes.len() - pos - 1),
		None => (bytes.len(), 0),
	};
	if stem_len == 0 || stem_len > 8 || ext_len > 3 {
		return false;
	}
	name.bytes().all(|b| {
		b.is_ascii_alphanumeric()
			|| matches!(
				b,
				b'!' | b'#'
					| b'$' | b'%' | b'&' | b'\''
					| b'(' | b')' | b'-' | b'@'
					| b'^' | b'_' | b'`' | b'{'
					| b'}' | b'~' | b'.'
			)
	})
}

/// Directory part of an absolute path: everything up to the last `/`, or
/// `/` when the only slash is the leading one.
pub(crate) fn dir_part(path: &str) -> Result<&str> {
	let path = non_blank(path)?;
	let last = memchr::memrchr(b'/', path.as_bytes())
		.ok_or_else(|| Error::InvalidName(format!("not an absolute path: {:?}", path)))?;
	Ok(if last == 0 { "/" } else { &path[..last] })
}

/// Basename of an absolute path: everything after the last `/`.
pub(crate) fn base_name(path: &str) -> Result<&str> {
	let path = non_blank(path)?;
	match memchr::memrchr(b'/', path.as_bytes()) {
		Some(last) => Ok(&path[last + 1..]),
		None => Ok(path),
	}
}

fn non_blank(path: &str) -> Result<&str> {
	if path.trim().is_empty() {
		Err(Error::InvalidName("empty path".into()))
	} else {
		Ok(path)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn root_normalization() {
		assert_eq!(PathResolver::new(" DATA ").unwrap().root(), "/DATA");
		assert_eq!(PathResolver::new("/DATA").unwrap().root(), "/DATA");
		assert!(PathResolver::new("/a/b").is_err());
		assert!(PathResolver::new("/").is_err());
		assert!(PathResolver::new("  ").is_err());
		assert!(PathResolver::new("/DA TA").is_err());
	}

	#[test]
	fn canonicalization() {
		let p = PathResolver::new("/DATA").unwrap();
		assert_eq!(p.canonical("foo.txt").unwrap(), "/DATA/foo.txt");
		assert_eq!(p.canonical("/foo.txt").unwrap(), "/DATA/foo.txt");
		assert_eq!(p.canonical("/DATA/foo.txt").unwrap(), "/DATA/foo.txt");
		// "/DATABASE" is not under "/DATA"
		assert_eq!(p.canonical("/DATABASE/x").unwrap(), "/DATA/DATABASE/x");
		assert!(p.canonical("").is_err());
		let long = "x".repeat(MAX_PATH);
		assert!(p.canonical(&long).is_err());
	}

	#[test]
	fn derived_directories() {
		let p = PathResolver::new("DATA").unwrap();
		assert_eq!(p.work_dir(), "/DATA/~WORK");
		assert_eq!(p.idx_dir(), "/DATA/~IDX");
		assert_eq!(p.index_path("users").unwrap(), "/DATA/~IDX/users.idx");
		assert!(p.index_path(" ").is_err());
	}

	#[test]
	fn short_names() {
		for ok in ["A", "12345678", "NOTES.TXT", "a_b-c.x", "~WORK", "7.cmt"] {
			assert!(is_valid_short_name(ok), "{ok:?} should be valid");
		}
		for bad in [
			"",
			"123456789",
			"NOTES.TEXT",
			"NOTES.",
			".TXT",
			"a.b.c",
			"sp ace",
			"tab\tx",
			"slash/x",
		] {
			assert!(!is_valid_short_name(bad), "{bad:?} should be invalid");
		}
	}

	#[test]
	fn splitting() {
		assert_eq!(dir_part("/DATA/foo.txt").unwrap(), "/DATA");
		assert_eq!(dir_part("/foo.txt").unwrap(), "/");
		assert_eq!(base_name("/DATA/foo.txt").unwrap(), "foo.txt");
		assert!(dir_part("  ").is_err());
		assert!(dir_part("relative.txt").is_err());
	}
}
