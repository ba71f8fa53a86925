//! Crash and recovery behavior: the commit point, startup fsck, and the
//! guarantee that an interrupted transaction is either fully applied or
//! fully rolled back.

use cardstore::{CardStore, Document, MemVfs, Vfs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn mem_store(vfs: &MemVfs) -> cardstore::Result<CardStore<MemVfs>> {
	CardStore::with_vfs(vfs.clone(), "DATA", None)
}

fn work_dir_entries(vfs: &MemVfs) -> Vec<String> {
	vfs.child_names("/DATA/~WORK").unwrap()
}

fn note(value: &str) -> Document {
	let mut doc = Document::new();
	doc.put("body", value);
	doc
}

fn body_of(store: &CardStore<MemVfs>, name: &str) -> Option<String> {
	store
		.load(name)
		.unwrap()
		.map(|d| d.get("body").unwrap_or("").to_owned())
}

#[test]
fn atomic_two_file_save() {
	let vfs = MemVfs::new();
	let store = mem_store(&vfs).unwrap();
	store.save("notes.txt", &note("A"), None).unwrap();

	let mut txn = store.begin_txn(&["notes.txt", "todo.txt"]).unwrap();
	store.save("notes.txt", &note("B"), Some(&mut txn)).unwrap();
	store.save("todo.txt", &note("X"), Some(&mut txn)).unwrap();
	store.commit_txn(txn).unwrap();

	assert_eq!(body_of(&store, "notes.txt").as_deref(), Some("B"));
	assert_eq!(body_of(&store, "todo.txt").as_deref(), Some("X"));
	assert_eq!(work_dir_entries(&vfs), Vec::<String>::new());
}

#[test]
fn fsck_completes_a_finalized_transaction() {
	let vfs = MemVfs::new();
	{
		let store = mem_store(&vfs).unwrap();
		store.idx_upsert("fruit", "banana", "y", None).unwrap();
		store.idx_upsert("fruit", "apple", "r", None).unwrap();
	}

	// a crash left a finalized descriptor and its staged index rewrite
	let staged = b"apple=r\nbanana=y\ncherry=r\n";
	vfs.put_file("/DATA/~WORK/50.tmp", staged);
	vfs.put_file(
		"/DATA/~WORK/49.cmt",
		b"/DATA/~IDX/fruit.idx=/DATA/~WORK/50.tmp\n",
	);

	let store = mem_store(&vfs).unwrap();
	assert_eq!(
		vfs.contents("/DATA/~IDX/fruit.idx").unwrap(),
		staged.to_vec()
	);
	assert_eq!(work_dir_entries(&vfs), Vec::<String>::new());
	assert_eq!(store.idx_lookup("fruit", "cherry").unwrap().as_deref(), Some("r"));
}

#[test]
fn fsck_rolls_back_an_in_flight_transaction() {
	let vfs = MemVfs::new();
	{
		let store = mem_store(&vfs).unwrap();
		store.idx_upsert("fruit", "banana", "y", None).unwrap();
	}
	let before = vfs.contents("/DATA/~IDX/fruit.idx").unwrap();

	// crash before the commit point: descriptor still has the .txn
	// extension
	vfs.put_file("/DATA/~WORK/7.txn", b"/DATA/~IDX/fruit.idx=/DATA/~WORK/8.tmp\n");
	vfs.put_file("/DATA/~WORK/8.tmp", b"apple=r\nbanana=y\n");

	mem_store(&vfs).unwrap();
	assert_eq!(work_dir_entries(&vfs), Vec::<String>::new());
	assert_eq!(vfs.contents("/DATA/~IDX/fruit.idx").unwrap(), before);
}

#[test]
fn fsck_applies_tombstones() {
	let vfs = MemVfs::new();
	{
		let store = mem_store(&vfs).unwrap();
		store.save("notes.txt", &note("A"), None).unwrap();
	}
	vfs.put_file("/DATA/~WORK/3.cmt", b"/DATA/notes.txt={TOMBSTONE}\n");

	let store = mem_store(&vfs).unwrap();
	assert!(!store.exists("notes.txt").unwrap());
	assert_eq!(work_dir_entries(&vfs), Vec::<String>::new());
}

#[test]
fn reapplying_an_applied_descriptor_changes_nothing() {
	let vfs = MemVfs::new();
	{
		let store = mem_store(&vfs).unwrap();
		store.idx_upsert("fruit", "apple", "r", None).unwrap();
	}
	let applied = vfs.contents("/DATA/~IDX/fruit.idx").unwrap();

	// same descriptor again, but its temp no longer exists: the
	// missing-temp branch must be a no-op
	vfs.put_file(
		"/DATA/~WORK/40.cmt",
		b"/DATA/~IDX/fruit.idx=/DATA/~WORK/41.tmp\n",
	);
	mem_store(&vfs).unwrap();
	assert_eq!(vfs.contents("/DATA/~IDX/fruit.idx").unwrap(), applied);
	assert_eq!(work_dir_entries(&vfs), Vec::<String>::new());
}

/// Interrupt a two-file commit after every possible number of filesystem
/// calls. Whatever the cut, recovery must land on exactly the pre-state
/// or exactly the post-state.
#[test]
fn interrupted_commit_is_all_or_nothing() {
	let mut saw_pre = false;
	let mut saw_post = false;

	for budget in 0..32 {
		let vfs = MemVfs::new();
		let store = mem_store(&vfs).unwrap();
		store.save("notes.txt", &note("A"), None).unwrap();

		let mut txn = store.begin_txn(&["notes.txt", "todo.txt"]).unwrap();
		store.save("notes.txt", &note("B"), Some(&mut txn)).unwrap();
		store.save("todo.txt", &note("X"), Some(&mut txn)).unwrap();

		vfs.fail_after(budget);
		let _ = store.commit_txn(txn);
		vfs.clear_faults();
		drop(store);

		// reboot
		let store = mem_store(&vfs).unwrap();
		let notes = body_of(&store, "notes.txt");
		let todo = body_of(&store, "todo.txt");
		match (notes.as_deref(), todo.as_deref()) {
			(Some("A"), None) => saw_pre = true,
			(Some("B"), Some("X")) => saw_post = true,
			other => panic!("mixed state after budget {}: {:?}", budget, other),
		}
		assert_eq!(work_dir_entries(&vfs), Vec::<String>::new());
	}

	// the sweep must actually have exercised both outcomes
	assert!(saw_pre && saw_post);
}

#[test]
fn commit_point_failure_is_a_clean_rollback() {
	let vfs = MemVfs::new();
	let store = mem_store(&vfs).unwrap();
	store.save("notes.txt", &note("A"), None).unwrap();

	let mut txn = store.begin_txn(&["notes.txt"]).unwrap();
	store.save("notes.txt", &note("B"), Some(&mut txn)).unwrap();

	// the very next filesystem call is the .txn -> .cmt rename
	vfs.fail_after(0);
	let err = store.commit_txn(txn).unwrap_err();
	vfs.clear_faults();
	assert!(matches!(err, cardstore::Error::CommitPoint(_)));

	// not durable: the target is untouched and the lock is free again
	assert_eq!(body_of(&store, "notes.txt").as_deref(), Some("A"));
	let txn = store.begin_txn(&["notes.txt"]).unwrap();
	store.abort_txn(txn);
}

#[test]
fn apply_failure_after_commit_point_fires_hook_and_recovers() {
	let vfs = MemVfs::new();
	let hook_fired = Arc::new(AtomicBool::new(false));
	let hook: cardstore::ErrorHook = {
		let flag = hook_fired.clone();
		Box::new(move || flag.store(true, Ordering::SeqCst))
	};
	let store = CardStore::with_vfs(vfs.clone(), "DATA", Some(hook)).unwrap();

	store.mkdir("sub").unwrap();
	let mut txn = store.begin_txn(&["sub/f.rec"]).unwrap();
	store.save("sub/f.rec", &note("V"), Some(&mut txn)).unwrap();

	// yank the parent directory out from under the apply step
	assert!(vfs.remove("/DATA/sub"));
	let err = store.commit_txn(txn).unwrap_err();
	assert!(matches!(err, cardstore::Error::PostCommitApply(_)));
	assert!(hook_fired.load(Ordering::SeqCst));

	// the finalized descriptor survived for recovery; put the directory
	// back and reopen
	drop(store);
	assert!(work_dir_entries(&vfs).iter().any(|n| n.ends_with(".cmt")));
	vfs.mkdir("/DATA/sub");
	let store = mem_store(&vfs).unwrap();
	assert_eq!(body_of(&store, "sub/f.rec").as_deref(), Some("V"));
	assert_eq!(work_dir_entries(&vfs), Vec::<String>::new());
}

#[test]
fn unrecoverable_fsck_fails_open_and_fires_hook() {
	let vfs = MemVfs::new();
	{
		mem_store(&vfs).unwrap();
	}
	// finalized transaction whose target can never be applied
	vfs.put_file("/DATA/~WORK/9.tmp", b"data");
	vfs.put_file("/DATA/~WORK/8.cmt", b"/DATA/gone/f.txt=/DATA/~WORK/9.tmp\n");

	let hook_fired = Arc::new(AtomicBool::new(false));
	let hook: cardstore::ErrorHook = {
		let flag = hook_fired.clone();
		Box::new(move || flag.store(true, Ordering::SeqCst))
	};
	let err = CardStore::with_vfs(vfs.clone(), "DATA", Some(hook)).unwrap_err();
	assert!(matches!(err, cardstore::Error::Fsck(_)));
	assert!(hook_fired.load(Ordering::SeqCst));

	// nothing was deleted; the operator can still intervene
	assert!(vfs.exists("/DATA/~WORK/8.cmt"));
	assert!(vfs.exists("/DATA/~WORK/9.tmp"));
}

#[test]
fn descriptor_matches_the_record_format() {
	let vfs = MemVfs::new();
	let store = mem_store(&vfs).unwrap();
	let txn = store.begin_txn(&["notes.txt", "todo.txt"]).unwrap();

	// exactly one descriptor, readable by the ordinary record codec
	let names = work_dir_entries(&vfs);
	let descriptors: Vec<&String> = names.iter().filter(|n| n.ends_with(".txn")).collect();
	assert_eq!(descriptors.len(), 1);
	let bytes = vfs
		.contents(&format!("/DATA/~WORK/{}", descriptors[0]))
		.unwrap();
	let doc = Document::read_from(&bytes[..]).unwrap();
	let entries: Vec<(&str, &str)> = doc.entries().collect();
	assert_eq!(entries.len(), 2);
	assert_eq!(entries[0].0, "/DATA/notes.txt");
	assert!(entries[0].1.starts_with("/DATA/~WORK/"));
	assert!(entries[0].1.ends_with(".tmp"));
	assert_eq!(entries[1].0, "/DATA/todo.txt");

	store.abort_txn(txn);
	assert_eq!(work_dir_entries(&vfs), Vec::<String>::new());
}
