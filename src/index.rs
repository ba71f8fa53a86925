//! Sorted string indexes: flat `key=value` files, always rewritten as a
//! whole through a streaming filter.
//!
//! Every mutation follows the same shape: resolve the index file, obtain
//! (or open) a transaction that owns it, stream the committed index
//! through a filter into the staged temp file, and let commit or abort
//! decide visibility. Filters see every source line exactly once, in
//! order, and may write zero, one, or two lines per input line. Lookups
//! and searches are the same scan with no sink.

use crate::manager::TxnManager;
use crate::paths::PathResolver;
use crate::storage::{LineSink, Storage};
use crate::txn::Transaction;
use crate::vfs::Vfs;
use crate::{Error, Result};
use compact_str::CompactString;
use smallvec::SmallVec;

/// Prefix searches return at most this many full matches before falling
/// back to trie mode.
pub const MATCH_CAP: usize = 10;

/// Per-operation scan state. One variant per index operation, so the
/// capture travels with the behavior instead of behind a void pointer.
enum Filter<'a> {
	Lookup {
		key: &'a str,
		found: Option<CompactString>,
	},
	Upsert {
		key: &'a str,
		value: &'a str,
		prev_key: CompactString,
		did_upsert: bool,
	},
	Remove {
		key: &'a str,
		did_remove: bool,
	},
	Rename {
		old_key: &'a str,
		new_key: &'a str,
		value: &'a str,
		prev_key: CompactString,
		did_remove: bool,
		did_insert: bool,
		conflict: bool,
	},
	Prefix {
		results: SearchResults,
	},
}

impl Filter<'_> {
	/// Process one line. Returns whether to keep scanning.
	fn apply(&mut self, line: &str, sink: Option<&mut LineSink>) -> Result<bool> {
		let (k, v) = linedoc::split_line(line);
		let v = v.unwrap_or("");
		match self {
			Filter::Lookup { key, found } => {
				if k == *key {
					*found = Some(CompactString::new(v));
					return Ok(false); // stop scanning
				}
				Ok(true)
			}

			Filter::Upsert {
				key,
				value,
				prev_key,
				did_upsert,
			} => {
				let sink = need_sink(sink)?;
				if *did_upsert {
					// already placed; pipe the rest verbatim
					sink.emit(line)?;
					return Ok(true);
				}
				if k == *key {
					sink.emit_entry(key, value)?;
					*did_upsert = true;
				} else if *key < k && (prev_key.is_empty() || *key > prev_key.as_str()) {
					// the slot right before the first greater key
					sink.emit_entry(key, value)?;
					sink.emit(line)?;
					*did_upsert = true;
				} else {
					sink.emit(line)?;
					*prev_key = CompactString::new(k);
				}
				Ok(true)
			}

			Filter::Remove { key, did_remove } => {
				let sink = need_sink(sink)?;
				if *did_remove {
					sink.emit(line)?;
					return Ok(true);
				}
				if k == *key {
					*did_remove = true;
				} else {
					sink.emit(line)?;
				}
				Ok(true)
			}

			Filter::Rename {
				old_key,
				new_key,
				value,
				prev_key,
				did_remove,
				did_insert,
				conflict,
			} => {
				let sink = need_sink(sink)?;
				if *did_remove && *did_insert {
					sink.emit(line)?;
					return Ok(true);
				}
				if k == *old_key {
					*did_remove = true;
				} else if k == *new_key {
					*conflict = true;
					return Ok(false);
				} else if *new_key < k && (prev_key.is_empty() || *new_key > prev_key.as_str()) {
					sink.emit_entry(new_key, value)?;
					sink.emit(line)?;
					*did_insert = true;
				} else {
					sink.emit(line)?;
					*prev_key = CompactString::new(k);
				}
				Ok(true)
			}

			Filter::Prefix { results } => Ok(results.observe(k, v)),
		}
	}
}

fn need_sink(sink: Option<&mut LineSink>) -> Result<&mut LineSink> {
	sink.ok_or_else(|| {
		Error::Io(std::io::Error::new(
			std::io::ErrorKind::InvalidInput,
			"rewrite filter invoked without a sink",
		))
	})
}

/// Result of a prefix search.
///
/// Up to [`MATCH_CAP`] full `(key, value)` matches; past that the search
/// switches to *trie mode* and returns the set of distinct
/// next-characters instead, each carrying a value only when
/// `prefix + character` is itself a key.
pub struct SearchResults {
	prefix: String,
	trie_mode: bool,
	matches: SmallVec<[(CompactString, CompactString); MATCH_CAP]>,
	continuations: Vec<(char, CompactString)>,
	/// one bit per ASCII 32..=122, `c - 32`
	bloom: [u32; 3],
}

impl SearchResults {
	fn new(prefix: &str) -> SearchResults {
		SearchResults {
			prefix: prefix.to_owned(),
			trie_mode: false,
			matches: SmallVec::new(),
			continuations: Vec::new(),
			bloom: [0; 3],
		}
	}

	pub fn prefix(&self) -> &str {
		&self.prefix
	}

	pub fn trie_mode(&self) -> bool {
		self.trie_mode
	}

	/// Full matches; empty in trie mode.
	pub fn matches(&self) -> &[(CompactString, CompactString)] {
		&self.matches
	}

	/// Next-character continuations, in scan order; empty unless in trie
	/// mode.
	pub fn continuations(&self) -> &[(char, CompactString)] {
		&self.continuations
	}

	fn observe(&mut self, key: &str, value: &str) -> bool {
		if !self.prefix.is_empty() && !key.starts_with(&self.prefix) {
			// sorted index: once past the prefix there are no more matches
			return key <= self.prefix.as_str();
		}
		if self.matches.len() < MATCH_CAP {
			self.matches
				.push((CompactString::new(key), CompactString::new(value)));
		} else {
			self.trie_mode = true;
		}
		if key.len() > self.prefix.len() {
			let c = key.as_bytes()[self.prefix.len()];
			if (32..=122).contains(&c) {
				let index = (c - 32) as usize;
				let (word, bit) = (index / 32, index % 32);
				if self.bloom[word] & (1 << bit) == 0 {
					self.bloom[word] |= 1 << bit;
					let exact = key.len() == self.prefix.len() + 1;
					self.continuations.push((
						c as char,
						CompactString::new(if exact { value } else { "" }),
					));
				}
			}
		}
		true
	}

	/// Keep whichever result list the final mode calls for.
	fn seal(&mut self) {
		if self.trie_mode {
			self.matches.clear();
		} else {
			self.continuations.clear();
		}
	}
}

/// Stream `src` through `filter`, optionally into `dst`.
fn pipe<V: Vfs>(
	storage: &Storage<V>,
	src: &str,
	dst: Option<&str>,
	filter: &mut Filter<'_>,
) -> Result<()> {
	let mut lines = storage.read_index(src)?;
	let mut sink = match dst {
		Some(d) => Some(storage.write_index(d)?),
		None => None,
	};
	while let Some(line) = lines.next_line()? {
		if line.trim().is_empty() {
			continue;
		}
		if !filter.apply(line, sink.as_mut())? {
			break;
		}
	}
	if let Some(sink) = sink {
		sink.finish()?;
	}
	Ok(())
}

fn check_entry<V: Vfs>(storage: &Storage<V>, key: &str, value: &str) -> Result<()> {
	if key.is_empty() || key.contains('=') || key.contains('\n') {
		return Err(Error::InvalidName(format!("invalid index key: {:?}", key)));
	}
	if value.contains('\n') {
		return Err(Error::InvalidName(format!(
			"index value may not contain newlines: {:?}",
			value
		)));
	}
	let line_len = key.len() + 1 + value.len();
	if line_len > storage.vfs().line_buffer_size() {
		return Err(Error::InvalidName(format!(
			"index entry exceeds the {}-byte line buffer",
			storage.vfs().line_buffer_size()
		)));
	}
	Ok(())
}

/// Read-only scan for a key. `Ok(None)` when the index or key is absent.
fn scan_for_key<V: Vfs>(
	storage: &Storage<V>,
	idx_file: &str,
	key: &str,
) -> Result<Option<CompactString>> {
	if !storage.exists(idx_file) {
		return Ok(None);
	}
	let mut filter = Filter::Lookup { key, found: None };
	pipe(storage, idx_file, None, &mut filter)?;
	match filter {
		Filter::Lookup { found, .. } => Ok(found),
		_ => unreachable!(),
	}
}

pub(crate) fn lookup<V: Vfs>(
	storage: &Storage<V>,
	resolver: &PathResolver,
	idx_name: &str,
	key: &str,
) -> Result<Option<CompactString>> {
	check_entry(storage, key, "")?;
	scan_for_key(storage, &resolver.index_path(idx_name)?, key)
}

pub(crate) fn prefix_search<V: Vfs>(
	storage: &Storage<V>,
	resolver: &PathResolver,
	idx_name: &str,
	prefix: &str,
) -> Result<SearchResults> {
	let idx_file = resolver.index_path(idx_name)?;
	let mut results = SearchResults::new(prefix);
	if storage.exists(&idx_file) {
		let mut filter = Filter::Prefix { results };
		pipe(storage, &idx_file, None, &mut filter)?;
		results = match filter {
			Filter::Prefix { results } => results,
			_ => unreachable!(),
		};
	}
	results.seal();
	Ok(results)
}

/// Insert `key=value`, or update the value of an existing `key`, keeping
/// the index sorted.
pub(crate) fn upsert<V: Vfs>(
	storage: &Storage<V>,
	resolver: &PathResolver,
	txns: &TxnManager,
	idx_name: &str,
	key: &str,
	value: &str,
	txn: Option<&mut Transaction>,
) -> Result<()> {
	check_entry(storage, key, value)?;
	let idx_file = resolver.index_path(idx_name)?;
	let mut txn_ref = txns.explicit_or_begin(storage, resolver, &idx_file, txn)?;

	let outcome = (|| {
		let tmp = txns.temp_path(txn_ref.txn(), &idx_file)?;
		if !storage.exists(&idx_file) {
			// first write to this index
			storage.append_index_line(&tmp, key, value)?;
			return Ok(());
		}
		let mut filter = Filter::Upsert {
			key,
			value,
			prev_key: CompactString::default(),
			did_upsert: false,
		};
		pipe(storage, &idx_file, Some(&tmp), &mut filter)?;
		if matches!(filter, Filter::Upsert { did_upsert: false, .. }) {
			// new key sorts after every existing key
			storage.append_index_line(&tmp, key, value)?;
		}
		Ok(())
	})();

	txns.finalize(storage, txn_ref, outcome)
}

/// Remove `key`. It is an error for the key to be absent.
pub(crate) fn remove<V: Vfs>(
	storage: &Storage<V>,
	resolver: &PathResolver,
	txns: &TxnManager,
	idx_name: &str,
	key: &str,
	txn: Option<&mut Transaction>,
) -> Result<()> {
	check_entry(storage, key, "")?;
	let idx_file = resolver.index_path(idx_name)?;
	let mut txn_ref = txns.explicit_or_begin(storage, resolver, &idx_file, txn)?;

	let outcome = (|| {
		let tmp = txns.temp_path(txn_ref.txn(), &idx_file)?;
		if !storage.exists(&idx_file) {
			return Err(Error::NotFound(key.to_owned()));
		}
		let mut filter = Filter::Remove {
			key,
			did_remove: false,
		};
		pipe(storage, &idx_file, Some(&tmp), &mut filter)?;
		match filter {
			Filter::Remove { did_remove: true, .. } => Ok(()),
			_ => Err(Error::NotFound(key.to_owned())),
		}
	})();

	txns.finalize(storage, txn_ref, outcome)
}

/// Rename `old_key` to `new_key`, repositioning the entry to keep the
/// index sorted. The value travels with the rename.
///
/// Both preconditions — `old_key` present, `new_key` absent — are checked
/// with read-only scans before the output stream is opened, so a refused
/// rename leaves the index byte-for-byte untouched.
pub(crate) fn rename<V: Vfs>(
	storage: &Storage<V>,
	resolver: &PathResolver,
	txns: &TxnManager,
	idx_name: &str,
	old_key: &str,
	new_key: &str,
	txn: Option<&mut Transaction>,
) -> Result<()> {
	check_entry(storage, old_key, "")?;
	let idx_file = resolver.index_path(idx_name)?;

	let value = scan_for_key(storage, &idx_file, old_key)?
		.ok_or_else(|| Error::NotFound(old_key.to_owned()))?;
	// the rewritten line is `new_key=value`; bound that combination, not
	// the key against an empty placeholder
	check_entry(storage, new_key, &value)?;
	if scan_for_key(storage, &idx_file, new_key)?.is_some() {
		return Err(Error::AlreadyExists(new_key.to_owned()));
	}

	let mut txn_ref = txns.explicit_or_begin(storage, resolver, &idx_file, txn)?;
	let outcome = (|| {
		let tmp = txns.temp_path(txn_ref.txn(), &idx_file)?;
		let mut filter = Filter::Rename {
			old_key,
			new_key,
			value: &value,
			prev_key: CompactString::default(),
			did_remove: false,
			did_insert: false,
			conflict: false,
		};
		pipe(storage, &idx_file, Some(&tmp), &mut filter)?;
		match filter {
			Filter::Rename { conflict: true, .. } => {
				Err(Error::AlreadyExists(new_key.to_owned()))
			}
			Filter::Rename {
				did_remove: true,
				did_insert,
				..
			} => {
				if !did_insert {
					// the renamed key sorts after every remaining key
					storage.append_index_line(&tmp, new_key, &value)?;
				}
				Ok(())
			}
			_ => Err(Error::NotFound(old_key.to_owned())),
		}
	})();

	txns.finalize(storage, txn_ref, outcome)
}
