//! The application-facing store.

use crate::index::{self, SearchResults};
use crate::manager::{ErrorHook, TxnManager};
use crate::paths::PathResolver;
use crate::storage::Storage;
use crate::txn::{Staged, Transaction, TOMBSTONE};
use crate::vfs::{DiskVfs, Vfs};
use crate::{Error, Result};
use compact_str::CompactString;
use linedoc::Document;

/// A crash-safe record and index store rooted at a single directory.
///
/// Opening provisions the root, `~WORK`, and `~IDX` directories and runs
/// recovery over the work directory; no operation is accepted until that
/// recovery succeeds. Every mutation goes through a transaction — one the
/// caller opened with [`begin_txn`](CardStore::begin_txn), or an implicit
/// single-file transaction committed on the spot.
pub struct CardStore<V: Vfs> {
	resolver: PathResolver,
	storage: Storage<V>,
	txns: TxnManager,
}

impl<V: Vfs> std::fmt::Debug for CardStore<V> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CardStore").finish_non_exhaustive()
	}
}

impl CardStore<DiskVfs> {
	/// Open a store on the real filesystem, mapping the engine namespace
	/// onto `base`. Takes an exclusive lock on `base`.
	pub fn open(
		base: impl Into<std::path::PathBuf>,
		root_dir: &str,
		error_hook: Option<ErrorHook>,
	) -> Result<CardStore<DiskVfs>> {
		CardStore::with_vfs(DiskVfs::open(base)?, root_dir, error_hook)
	}
}

impl<V: Vfs> CardStore<V> {
	/// Open a store over any filesystem capability set.
	pub fn with_vfs(vfs: V, root_dir: &str, error_hook: Option<ErrorHook>) -> Result<CardStore<V>> {
		let resolver = PathResolver::new(root_dir)?;
		let storage = Storage::new(vfs);
		let txns = TxnManager::new(error_hook);

		for dir in [resolver.root(), resolver.idx_dir(), resolver.work_dir()] {
			if !storage.exists(dir) && !storage.mkdir(dir) {
				return Err(Error::MissingPrerequisite(format!(
					"could not create {}",
					dir
				)));
			}
		}

		txns.reset();
		txns.fsck(&storage, &resolver)?;

		Ok(CardStore {
			resolver,
			storage,
			txns,
		})
	}

	/// The filesystem this store runs on.
	pub fn vfs(&self) -> &V {
		self.storage.vfs()
	}

	/// Open a transaction locking `names` for mutation. Contended names
	/// block until their owning transaction finishes.
	pub fn begin_txn(&self, names: &[&str]) -> Result<Transaction> {
		let mut targets = Vec::with_capacity(names.len());
		for name in names {
			targets.push(self.resolver.canonical(name)?);
		}
		let targets: Vec<&str> = targets.iter().map(String::as_str).collect();
		self.txns.begin(&self.storage, &self.resolver, &targets)
	}

	/// Apply the transaction's staged changes atomically.
	pub fn commit_txn(&self, txn: Transaction) -> Result<()> {
		self.txns.commit(&self.storage, txn)
	}

	/// Discard the transaction's staged changes.
	pub fn abort_txn(&self, txn: Transaction) {
		self.txns.abort(&self.storage, txn)
	}

	/// Write a record. With no transaction the write commits immediately.
	///
	/// A typed document whose serial version is older than the version it
	/// was last deserialized from is refused: newer on-disk data must not
	/// be clobbered by an older writer.
	pub fn save(
		&self,
		name: &str,
		doc: &Document,
		txn: Option<&mut Transaction>,
	) -> Result<()> {
		if doc.type_id().is_some() && doc.serial_version() < doc.deserialized_version() {
			return Err(Error::VersionRefused {
				serial: doc.serial_version(),
				deserialized: doc.deserialized_version(),
			});
		}
		let target = self.resolver.canonical(name)?;
		let mut txn_ref =
			self.txns
				.explicit_or_begin(&self.storage, &self.resolver, &target, txn)?;
		let outcome = (|| {
			let tmp = self.txns.temp_path(txn_ref.txn(), &target)?;
			self.storage.write_record(&tmp, doc)
		})();
		self.txns.finalize(&self.storage, txn_ref, outcome)
	}

	/// Read a record. `Ok(None)` when the file does not exist.
	pub fn load(&self, name: &str) -> Result<Option<Document>> {
		let target = self.resolver.canonical(name)?;
		if !self.storage.exists(&target) {
			return Ok(None);
		}
		self.storage.load_record(&target).map(Some)
	}

	/// Read a record into an existing document, keeping the document's
	/// own type and serial version. Returns whether the file existed.
	pub fn load_into(&self, name: &str, doc: &mut Document) -> Result<bool> {
		let target = self.resolver.canonical(name)?;
		if !self.storage.exists(&target) {
			return Ok(false);
		}
		self.storage.load_record_into(&target, doc)?;
		Ok(true)
	}

	pub fn exists(&self, name: &str) -> Result<bool> {
		let target = self.resolver.canonical(name)?;
		Ok(self.storage.exists(&target))
	}

	/// Delete a file. Inside a transaction this stages a tombstone; the
	/// file disappears at commit. With no transaction the tombstone is
	/// committed immediately.
	pub fn erase(&self, name: &str, txn: Option<&mut Transaction>) -> Result<()> {
		let target = self.resolver.canonical(name)?;
		if !self.storage.exists(&target) {
			return Err(Error::MissingPrerequisite(format!(
				"no such file: {}",
				target
			)));
		}
		let mut txn_ref =
			self.txns
				.explicit_or_begin(&self.storage, &self.resolver, &target, txn)?;
		let outcome = (|| {
			let txn = txn_ref.txn();
			match txn.staged(&target) {
				Some(Staged::Temp(_)) | Some(Staged::Tombstone) => {}
				None => {
					return Err(Error::Staging(format!(
						"{} is not part of this transaction",
						target
					)))
				}
			}
			txn.set_staged(&target, TOMBSTONE);
			// the tombstone must be durable in the descriptor before commit
			self.storage
				.write_descriptor(&txn.descriptor_path(), &txn.to_document())
		})();
		self.txns.finalize(&self.storage, txn_ref, outcome)
	}

	/// Create a directory under the root. The parent must already exist.
	pub fn mkdir(&self, name: &str) -> Result<()> {
		let target = self.resolver.canonical(name)?;
		if self.storage.mkdir(&target) {
			Ok(())
		} else {
			Err(Error::MissingPrerequisite(format!(
				"could not create directory {}",
				target
			)))
		}
	}

	/// Insert or update an index entry, keeping the index sorted.
	pub fn idx_upsert(
		&self,
		idx_name: &str,
		key: &str,
		value: &str,
		txn: Option<&mut Transaction>,
	) -> Result<()> {
		index::upsert(
			&self.storage,
			&self.resolver,
			&self.txns,
			idx_name,
			key,
			value,
			txn,
		)
	}

	/// Remove an index entry. The key must exist.
	pub fn idx_remove(
		&self,
		idx_name: &str,
		key: &str,
		txn: Option<&mut Transaction>,
	) -> Result<()> {
		index::remove(&self.storage, &self.resolver, &self.txns, idx_name, key, txn)
	}

	/// Rename an index key, repositioning its entry to keep the index
	/// sorted. The new key must not already exist.
	pub fn idx_rename(
		&self,
		idx_name: &str,
		old_key: &str,
		new_key: &str,
		txn: Option<&mut Transaction>,
	) -> Result<()> {
		index::rename(
			&self.storage,
			&self.resolver,
			&self.txns,
			idx_name,
			old_key,
			new_key,
			txn,
		)
	}

	/// The value stored under `key`, or `None`. An empty value is a
	/// legitimate value — use [`idx_has_key`](CardStore::idx_has_key) to
	/// test presence.
	pub fn idx_lookup(&self, idx_name: &str, key: &str) -> Result<Option<CompactString>> {
		index::lookup(&self.storage, &self.resolver, idx_name, key)
	}

	pub fn idx_has_key(&self, idx_name: &str, key: &str) -> Result<bool> {
		Ok(self.idx_lookup(idx_name, key)?.is_some())
	}

	/// Prefix search with trie fallback; see [`SearchResults`].
	pub fn idx_prefix_search(&self, idx_name: &str, prefix: &str) -> Result<SearchResults> {
		index::prefix_search(&self.storage, &self.resolver, idx_name, prefix)
	}
}
