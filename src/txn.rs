//! A group of files locked for mutation, staged in the work directory.

use antidote::Mutex;
use linedoc::Document;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

/// Staged value meaning "delete this target on apply".
pub(crate) const TOMBSTONE: &str = "{TOMBSTONE}";

const TXN_EXT: &str = ".txn";
const COMMIT_EXT: &str = ".cmt";
pub(crate) const TMP_EXT: &str = ".tmp";

/// Process-wide transaction state: the lock table and the id sequence.
///
/// Both restart from empty/zero with the process, which is why `fsck`
/// must clear the work directory before any new transaction is accepted —
/// a fresh sequence would otherwise collide with leftover temp names.
pub(crate) struct TxnShared {
	locks: Mutex<HashSet<String>>,
	id_seq: AtomicU16,
}

impl Default for TxnShared {
	fn default() -> TxnShared {
		TxnShared {
			locks: Mutex::new(HashSet::new()),
			id_seq: AtomicU16::new(0),
		}
	}
}

impl TxnShared {
	pub fn next_id(&self) -> u16 {
		self.id_seq.fetch_add(1, Ordering::Relaxed)
	}

	pub fn reset(&self) {
		self.locks.lock().clear();
		self.id_seq.store(0, Ordering::Relaxed);
	}

	/// Block until `path` is unowned, then take it. Contention comes only
	/// from another live transaction in this same process, so the wait is
	/// a brief busy-wait rather than a parked sleep.
	fn acquire(&self, path: &str) {
		let mut logged = false;
		loop {
			{
				let mut locks = self.locks.lock();
				if !locks.contains(path) {
					locks.insert(path.to_owned());
					return;
				}
			}
			if !logged {
				log::debug!("lock contention on {}", path);
				logged = true;
			}
			std::thread::yield_now();
		}
	}

	fn release(&self, path: &str) {
		self.locks.lock().remove(path);
	}

	#[cfg(test)]
	pub fn is_locked(&self, path: &str) -> bool {
		self.locks.lock().contains(path)
	}
}

/// What a transaction has staged for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Staged<'a> {
	/// New content is (or will be) at this temp path.
	Temp(&'a str),
	/// The target is marked for deletion.
	Tombstone,
}

/// An ordered set of target files locked for mutation.
///
/// Created by [`CardStore::begin_txn`](crate::CardStore::begin_txn) and
/// consumed by `commit_txn` or `abort_txn`. Entries apply in insertion
/// order, which keeps commits and recovery deterministic.
pub struct Transaction {
	shared: Arc<TxnShared>,
	/// `<workdir>/<id>`, extension appended per commit state
	base: String,
	committed: bool,
	/// whether this transaction owns lock-table entries for its targets
	holds_locks: bool,
	entries: Vec<(String, String)>,
}

impl Transaction {
	pub(crate) fn new(shared: Arc<TxnShared>, work_dir: &str) -> Transaction {
		let base = format!("{}/{}", work_dir, shared.next_id());
		Transaction {
			shared,
			base,
			committed: false,
			holds_locks: true,
			entries: Vec::new(),
		}
	}

	/// Rebuild a transaction from a descriptor found by `fsck`. It holds
	/// no locks (the lock table died with the previous process) and is
	/// already past its commit point.
	pub(crate) fn from_descriptor(
		shared: Arc<TxnShared>,
		descriptor_path: &str,
		doc: &Document,
	) -> Transaction {
		let base = descriptor_path
			.strip_suffix(COMMIT_EXT)
			.unwrap_or(descriptor_path)
			.to_owned();
		Transaction {
			shared,
			base,
			committed: true,
			holds_locks: false,
			entries: doc
				.entries()
				.map(|(k, v)| (k.to_owned(), v.to_owned()))
				.collect(),
		}
	}

	/// Lock `path` (waiting out any contention) and stage a fresh temp
	/// path for it: `<workdir>/<id>.tmp`.
	pub(crate) fn add(&mut self, path: &str, work_dir: &str) {
		self.shared.acquire(path);
		let tmp = format!("{}/{}{}", work_dir, self.shared.next_id(), TMP_EXT);
		self.entries.push((path.to_owned(), tmp));
	}

	pub(crate) fn contains(&self, path: &str) -> bool {
		self.entries.iter().any(|(target, _)| target == path)
	}

	pub(crate) fn staged(&self, path: &str) -> Option<Staged<'_>> {
		self.entries
			.iter()
			.find(|(target, _)| target == path)
			.map(|(_, value)| {
				if value == TOMBSTONE {
					Staged::Tombstone
				} else {
					Staged::Temp(value)
				}
			})
	}

	/// Overwrite the staged value for `path` (used to tombstone).
	pub(crate) fn set_staged(&mut self, path: &str, value: &str) {
		if let Some(slot) = self.entries.iter_mut().find(|(target, _)| target == path) {
			slot.1 = value.to_owned();
		}
	}

	/// `<workdir>/<id>.txn`, or `.cmt` once committed.
	pub(crate) fn descriptor_path(&self) -> String {
		let ext = if self.committed { COMMIT_EXT } else { TXN_EXT };
		format!("{}{}", self.base, ext)
	}

	pub(crate) fn set_committed(&mut self) {
		self.committed = true;
	}

	/// Staged entries, insertion order.
	pub(crate) fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
		self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	/// Drop every lock-table entry this transaction owns. Called exactly
	/// once per transaction, on the commit, abort, or recovery path.
	pub(crate) fn release_locks(&mut self) {
		if !self.holds_locks {
			return;
		}
		self.holds_locks = false;
		for (target, _) in &self.entries {
			self.shared.release(target);
		}
	}

	/// The descriptor document: one `target=staged` line per entry.
	pub(crate) fn to_document(&self) -> Document {
		let mut doc = Document::new();
		for (target, staged) in &self.entries {
			doc.put(target, staged);
		}
		doc
	}
}

impl Drop for Transaction {
	fn drop(&mut self) {
		// A transaction abandoned without commit or abort must not pin its
		// targets until restart. Its descriptor and temps stay behind for
		// the next fsck, like any other interrupted transaction.
		self.release_locks();
	}
}

impl std::fmt::Debug for Transaction {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(
			f,
			"Transaction {{ {} targets, descriptor={} }}",
			self.entries.len(),
			self.descriptor_path()
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_and_descriptor_extension() {
		let shared = Arc::new(TxnShared::default());
		let mut txn = Transaction::new(shared.clone(), "/D/~WORK");
		assert_eq!(txn.descriptor_path(), "/D/~WORK/0.txn");
		txn.add("/D/a.txt", "/D/~WORK");
		txn.add("/D/b.txt", "/D/~WORK");
		assert_eq!(txn.staged("/D/a.txt"), Some(Staged::Temp("/D/~WORK/1.tmp")));
		assert_eq!(txn.staged("/D/b.txt"), Some(Staged::Temp("/D/~WORK/2.tmp")));
		assert_eq!(txn.staged("/D/c.txt"), None);
		txn.set_committed();
		assert_eq!(txn.descriptor_path(), "/D/~WORK/0.cmt");
		txn.release_locks();
	}

	#[test]
	fn tombstoning() {
		let shared = Arc::new(TxnShared::default());
		let mut txn = Transaction::new(shared, "/D/~WORK");
		txn.add("/D/a.txt", "/D/~WORK");
		txn.set_staged("/D/a.txt", TOMBSTONE);
		assert_eq!(txn.staged("/D/a.txt"), Some(Staged::Tombstone));
		let doc = txn.to_document();
		assert_eq!(doc.get("/D/a.txt"), Some(TOMBSTONE));
		txn.release_locks();
	}

	#[test]
	fn release_is_idempotent_but_releases_once() {
		let shared = Arc::new(TxnShared::default());
		let mut txn = Transaction::new(shared.clone(), "/D/~WORK");
		txn.add("/D/a.txt", "/D/~WORK");
		assert!(shared.is_locked("/D/a.txt"));
		txn.release_locks();
		assert!(!shared.is_locked("/D/a.txt"));

		// a second transaction now owns the lock; releasing the first
		// again must not steal it
		let mut txn2 = Transaction::new(shared.clone(), "/D/~WORK");
		txn2.add("/D/a.txt", "/D/~WORK");
		txn.release_locks();
		assert!(shared.is_locked("/D/a.txt"));
		txn2.release_locks();
	}

	#[test]
	fn contended_add_blocks_until_release() {
		let shared = Arc::new(TxnShared::default());
		let mut txn = Transaction::new(shared.clone(), "/D/~WORK");
		txn.add("/D/hot.txt", "/D/~WORK");

		let shared2 = shared.clone();
		let waiter = std::thread::spawn(move || {
			let mut other = Transaction::new(shared2, "/D/~WORK");
			other.add("/D/hot.txt", "/D/~WORK");
			other.release_locks();
		});

		// the waiter cannot finish while we hold the lock
		std::thread::sleep(std::time::Duration::from_millis(50));
		assert!(!waiter.is_finished());
		txn.release_locks();
		waiter.join().unwrap();
	}

	#[test]
	fn descriptor_round_trip() {
		let shared = Arc::new(TxnShared::default());
		let mut txn = Transaction::new(shared.clone(), "/D/~WORK");
		txn.add("/D/a.txt", "/D/~WORK");
		txn.add("/D/b.txt", "/D/~WORK");
		txn.set_staged("/D/b.txt", TOMBSTONE);

		let mut bytes = Vec::new();
		txn.to_document().write_to(&mut bytes).unwrap();
		let doc = Document::read_from(&bytes[..]).unwrap();

		let recovered = Transaction::from_descriptor(shared, "/D/~WORK/0.cmt", &doc);
		let entries: Vec<_> = recovered.entries().collect();
		assert_eq!(
			entries,
			[("/D/a.txt", "/D/~WORK/1.tmp"), ("/D/b.txt", TOMBSTONE)]
		);
		assert_eq!(recovered.descriptor_path(), "/D/~WORK/0.cmt");
		txn.release_locks();
	}
}
