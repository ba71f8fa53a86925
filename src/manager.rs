//! Transaction lifecycle: begin, commit, abort, and startup recovery.
//!
//! The commit protocol is rename-based because create/rename/delete are
//! the only primitives a FAT16 card gives us:
//!
//! 1. staged content is written to `.tmp` files in the work directory;
//! 2. the descriptor is renamed `.txn` → `.cmt` — the commit point;
//! 3. each staged change is applied (rename into place, or delete);
//! 4. the descriptor is removed and the locks released.
//!
//! A crash before step 2 rolls back (fsck clears the work directory); a
//! crash after it rolls forward (fsck replays the `.cmt` descriptor).

use crate::paths::{self, PathResolver};
use crate::storage::Storage;
use crate::txn::{Staged, Transaction, TxnShared, TOMBSTONE};
use crate::vfs::Vfs;
use crate::{Error, Result};
use std::sync::Arc;

/// Called when the engine detects an inconsistency that needs operator
/// attention — an apply failure past the commit point, or an fsck that
/// cannot finish. The engine still returns the failure to the caller;
/// halting is the embedder's decision.
pub type ErrorHook = Box<dyn Fn()>;

pub(crate) struct TxnManager {
	shared: Arc<TxnShared>,
	error_hook: Option<ErrorHook>,
}

/// A transaction that is either borrowed from the caller or opened
/// implicitly for a single operation.
pub(crate) enum TxnRef<'a> {
	Explicit(&'a mut Transaction),
	Implicit(Transaction),
}

impl TxnRef<'_> {
	pub fn txn(&mut self) -> &mut Transaction {
		match self {
			TxnRef::Explicit(t) => t,
			TxnRef::Implicit(t) => t,
		}
	}
}

impl TxnManager {
	pub fn new(error_hook: Option<ErrorHook>) -> TxnManager {
		TxnManager {
			shared: Arc::new(TxnShared::default()),
			error_hook,
		}
	}

	/// Clear the lock table and restart the id sequence. Only meaningful
	/// at startup, right before `fsck` empties the work directory.
	pub fn reset(&self) {
		self.shared.reset();
	}

	/// Open a transaction over `targets` (already canonical), waiting out
	/// lock contention, and persist its `.txn` descriptor.
	///
	/// A target that does not exist yet must have a valid FAT16 basename
	/// and an existing parent directory. On any failure every acquired
	/// lock is released and nothing is left behind.
	pub fn begin<V: Vfs>(
		&self,
		storage: &Storage<V>,
		resolver: &PathResolver,
		targets: &[&str],
	) -> Result<Transaction> {
		if targets.is_empty() {
			return Err(Error::InvalidName(
				"transaction needs at least one target".into(),
			));
		}
		let mut txn = Transaction::new(self.shared.clone(), resolver.work_dir());
		for target in targets {
			self.add_target(storage, &mut txn, target, resolver.work_dir())?;
		}
		storage.write_descriptor(&txn.descriptor_path(), &txn.to_document())?;
		Ok(txn)
	}

	fn add_target<V: Vfs>(
		&self,
		storage: &Storage<V>,
		txn: &mut Transaction,
		target: &str,
		work_dir: &str,
	) -> Result<()> {
		if txn.contains(target) {
			// adding the same path twice would deadlock on our own lock
			return Err(Error::AlreadyExists(format!(
				"{} is already in this transaction",
				target
			)));
		}
		if !storage.exists(target) {
			let name = paths::base_name(target)?;
			if !paths::is_valid_short_name(name) {
				return Err(Error::InvalidName(format!(
					"not a valid FAT16 short name: {:?}",
					name
				)));
			}
			let dir = paths::dir_part(target)?;
			if !storage.exists(dir) {
				return Err(Error::MissingPrerequisite(format!(
					"directory does not exist: {}",
					dir
				)));
			}
			if !storage.is_dir(dir) {
				return Err(Error::MissingPrerequisite(format!(
					"not a directory: {}",
					dir
				)));
			}
		}
		txn.add(target, work_dir);
		if let Some(Staged::Temp(tmp)) = txn.staged(target) {
			if storage.exists(tmp) {
				// only possible if fsck did not run; refuse to clobber
				return Err(Error::Staging(format!(
					"staging file already exists: {}",
					tmp
				)));
			}
		}
		Ok(())
	}

	/// The staged temp path for `target`, or why there isn't one.
	pub fn temp_path(&self, txn: &Transaction, target: &str) -> Result<String> {
		match txn.staged(target) {
			Some(Staged::Temp(tmp)) => Ok(tmp.to_owned()),
			Some(Staged::Tombstone) => Err(Error::Staging(format!(
				"{} is marked for delete",
				target
			))),
			None => Err(Error::Staging(format!(
				"{} is not part of this transaction",
				target
			))),
		}
	}

	/// Commit: flip the descriptor to `.cmt` (the commit point), apply the
	/// staged changes, then clean up.
	pub fn commit<V: Vfs>(&self, storage: &Storage<V>, mut txn: Transaction) -> Result<()> {
		let old = txn.descriptor_path();
		txn.set_committed();
		let new = txn.descriptor_path();

		if !storage.rename(&old, &new) {
			// not durable; discard the transaction safely
			if !storage.remove(&old) {
				log::warn!("could not remove descriptor {}", old);
			}
			txn.release_locks();
			return Err(Error::CommitPoint(old));
		}

		if let Err(e) = self.apply_changes(storage, &txn) {
			// past the commit point: leave the descriptor and temps for
			// the next fsck to finish the job
			log::warn!("apply failed after commit point: {}", e);
			self.report_inconsistency();
			txn.release_locks();
			return Err(e);
		}

		self.cleanup(storage, txn);
		Ok(())
	}

	/// Abort: delete staged temps, then the descriptor. A temp that will
	/// not delete is tolerated; the next fsck sweeps it.
	pub fn abort<V: Vfs>(&self, storage: &Storage<V>, txn: Transaction) {
		for (_, staged) in txn.entries() {
			if staged != TOMBSTONE && storage.exists(staged) && !storage.remove(staged) {
				log::warn!("could not remove staged file {}", staged);
			}
		}
		self.cleanup(storage, txn);
	}

	/// Use the caller's transaction, or open an implicit single-file one
	/// over `target`.
	pub fn explicit_or_begin<'a, V: Vfs>(
		&self,
		storage: &Storage<V>,
		resolver: &PathResolver,
		target: &str,
		txn: Option<&'a mut Transaction>,
	) -> Result<TxnRef<'a>> {
		match txn {
			Some(t) => Ok(TxnRef::Explicit(t)),
			None => Ok(TxnRef::Implicit(self.begin(storage, resolver, &[target])?)),
		}
	}

	/// Commit or abort an implicit transaction; pass through the outcome
	/// of an explicit one untouched.
	pub fn finalize<V: Vfs>(
		&self,
		storage: &Storage<V>,
		txn: TxnRef<'_>,
		outcome: Result<()>,
	) -> Result<()> {
		match (txn, outcome) {
			(TxnRef::Implicit(t), Ok(())) => self.commit(storage, t),
			(TxnRef::Implicit(t), Err(e)) => {
				self.abort(storage, t);
				Err(e)
			}
			(TxnRef::Explicit(_), outcome) => outcome,
		}
	}

	/// Apply staged changes in insertion order.
	///
	/// Tombstone: remove the target (a missing target is success). Temp
	/// never written: no-op, so replaying an already-applied descriptor
	/// changes nothing. Otherwise replace the target with the temp.
	pub fn apply_changes<V: Vfs>(&self, storage: &Storage<V>, txn: &Transaction) -> Result<()> {
		for (target, staged) in txn.entries() {
			if staged == TOMBSTONE {
				if storage.exists(target) && !storage.remove(target) {
					return Err(Error::PostCommitApply(format!(
						"could not remove {}",
						target
					)));
				}
			} else if !storage.exists(staged) {
				// nothing was written to the temp; nothing to apply
			} else {
				if storage.exists(target) && !storage.remove(target) {
					return Err(Error::PostCommitApply(format!(
						"old file could not be removed: {}",
						target
					)));
				}
				if !storage.rename(staged, target) {
					return Err(Error::PostCommitApply(format!(
						"could not move {} to {}",
						staged, target
					)));
				}
			}
		}
		Ok(())
	}

	/// Remove the descriptor and release the locks.
	fn cleanup<V: Vfs>(&self, storage: &Storage<V>, mut txn: Transaction) {
		let descriptor = txn.descriptor_path();
		if storage.exists(&descriptor) && !storage.remove(&descriptor) {
			log::warn!("could not remove descriptor {}", descriptor);
		}
		txn.release_locks();
	}

	/// Startup recovery over the work directory.
	///
	/// Every `.cmt` descriptor is a finalized transaction that never got
	/// applied: load it, apply it, remove it. Everything still left in the
	/// work directory afterwards belonged to in-flight transactions and is
	/// deleted. Must succeed before any new transaction is accepted.
	pub fn fsck<V: Vfs>(&self, storage: &Storage<V>, resolver: &PathResolver) -> Result<()> {
		let work_dir = resolver.work_dir();
		let names = storage.child_names(work_dir)?;
		if !names.is_empty() {
			log::info!("recovering work directory ({} entries)", names.len());
		}
		for name in &names {
			if !name.ends_with(".cmt") {
				continue;
			}
			let descriptor = format!("{}/{}", work_dir, name);
			let doc = storage.load_record(&descriptor)?;
			let txn = Transaction::from_descriptor(self.shared.clone(), &descriptor, &doc);
			log::info!("applying finalized transaction {}", descriptor);
			if let Err(e) = self.apply_changes(storage, &txn) {
				// finalized data could not be made durable; this is the
				// hard stop
				self.report_inconsistency();
				return Err(Error::Fsck(format!("could not apply {}: {}", descriptor, e)));
			}
			self.cleanup(storage, txn);
		}

		// every commit is applied; whatever remains is rollback debris
		for name in storage.child_names(work_dir)? {
			let leftover = format!("{}/{}", work_dir, name);
			log::info!("cleaning up {}", leftover);
			if !storage.remove(&leftover) {
				// no finalized data at risk, but a stale temp can collide
				// with a future transaction's staging name
				self.report_inconsistency();
				return Err(Error::Fsck(format!("could not clean up {}", leftover)));
			}
		}
		Ok(())
	}

	fn report_inconsistency(&self) {
		if let Some(hook) = &self.error_hook {
			hook();
		}
	}
}
