//! End-to-end behaviour of diff, apply and commit between two trees.

use std::fs;
use std::path::Path;

use filetime::{set_file_mtime, FileTime};
use tandem_core::{probe, ExcludeSet, Fingerprint, Repository, ROOT};
use tandem_sync::{
    apply_diff, commit_dir, commit_records, compute_diff, parse_stream, BufferOnly, ChangeRecord,
    DiffError, DiffOptions, DiffSink, DiffStream,
};
use tempfile::TempDir;

const CEILING: usize = 1 << 20;

fn options(with_contents: bool) -> DiffOptions {
    DiffOptions {
        ceiling: CEILING,
        with_contents,
    }
}

fn write_file(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(&path, body).expect("write");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).expect("chmod");
    }
    set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000, 0)).expect("mtime");
}

fn full_diff(repo: &Repository) -> DiffStream {
    compute_diff(
        repo.root(),
        repo,
        repo.exclude(),
        &[ROOT.to_string()],
        true,
        options(true),
        &mut BufferOnly { ceiling: CEILING },
    )
    .expect("diff")
}

fn open(dir: &TempDir) -> Repository {
    Repository::open(dir.path(), ExcludeSet::default()).expect("open repo")
}

// ---------------------------------------------------------------------------
// 1. Round trip
// ---------------------------------------------------------------------------

#[test]
fn hello_scenario_converges() {
    let a = TempDir::new().expect("tree a");
    let b = TempDir::new().expect("tree b");
    write_file(a.path(), "foo/bar.txt", "hello");
    let repo_a = open(&a);
    let repo_b = open(&b);

    let stream = full_diff(&repo_a);
    let records = parse_stream(stream.as_bytes(), true).expect("parse");
    assert_eq!(records.len(), 2);
    assert_eq!(
        records[0],
        ChangeRecord::Added {
            path: "foo".into(),
            fingerprint: Fingerprint::Dir,
            contents: None,
        }
    );
    match &records[1] {
        ChangeRecord::Added {
            path,
            fingerprint,
            contents,
        } => {
            assert_eq!(path, "foo/bar.txt");
            assert_eq!(fingerprint.file_size(), Some(5));
            assert_eq!(contents.as_deref(), Some(b"hello".as_slice()));
        }
        other => panic!("expected Added, got {other:?}"),
    }

    let stats = apply_diff(&repo_b, stream.as_bytes()).expect("apply");
    assert_eq!(stats.added, 2);
    assert_eq!(fs::read_to_string(b.path().join("foo/bar.txt")).expect("read"), "hello");
    assert!(full_diff(&repo_b).is_empty(), "destination must be converged");
}

#[test]
#[cfg(unix)]
fn mixed_tree_round_trips() {
    let a = TempDir::new().expect("tree a");
    let b = TempDir::new().expect("tree b");
    write_file(a.path(), "src/main.rs", "fn main() {}\n");
    write_file(a.path(), "src/lib/mod.rs", "");
    write_file(a.path(), "README", "readme");
    fs::create_dir_all(a.path().join("empty/nested")).expect("mkdir");
    std::os::unix::fs::symlink("src/main.rs", a.path().join("entry")).expect("symlink");
    let repo_a = open(&a);
    let repo_b = open(&b);

    apply_diff(&repo_b, full_diff(&repo_a).as_bytes()).expect("apply");

    for rel in ["src/main.rs", "src/lib/mod.rs", "README", "empty/nested", "entry"] {
        assert_eq!(
            probe(&b.path().join(rel)).expect("probe b"),
            probe(&a.path().join(rel)).expect("probe a"),
            "{rel}"
        );
    }
    assert!(full_diff(&repo_b).is_empty());
}

// ---------------------------------------------------------------------------
// 2. Idempotence
// ---------------------------------------------------------------------------

#[test]
fn reapplying_a_stream_changes_nothing() {
    let a = TempDir::new().expect("tree a");
    let b = TempDir::new().expect("tree b");
    write_file(a.path(), "x/y.txt", "payload");
    let repo_a = open(&a);
    let repo_b = open(&b);
    let stream = full_diff(&repo_a);

    apply_diff(&repo_b, stream.as_bytes()).expect("first apply");
    let before = probe(&b.path().join("x/y.txt")).expect("probe");
    let second = apply_diff(&repo_b, stream.as_bytes()).expect("second apply");

    assert_eq!(second.changes(), 0);
    assert_eq!(second.unchanged, 2);
    assert_eq!(probe(&b.path().join("x/y.txt")).expect("probe"), before);
}

// ---------------------------------------------------------------------------
// 3. Modification and deletion detection
// ---------------------------------------------------------------------------

#[test]
fn modified_file_carries_previous_fingerprint() {
    let a = TempDir::new().expect("tree a");
    write_file(a.path(), "f", "one");
    let repo = open(&a);
    commit_dir(&repo, ROOT, true).expect("commit");
    let old = probe(&a.path().join("f")).expect("probe");

    write_file(a.path(), "f", "three");
    let records = parse_stream(full_diff(&repo).as_bytes(), true).expect("parse");
    assert_eq!(records.len(), 1);
    match &records[0] {
        ChangeRecord::Modified {
            previous, contents, ..
        } => {
            assert_eq!(previous, &old);
            assert_eq!(contents.as_deref(), Some(b"three".as_slice()));
        }
        other => panic!("expected Modified, got {other:?}"),
    }
}

#[test]
fn deleted_subtree_is_reported_once_at_its_root() {
    let a = TempDir::new().expect("tree a");
    write_file(a.path(), "keep/stay.txt", "s");
    write_file(a.path(), "keep/leaf.txt", "l");
    write_file(a.path(), "gone/deep/one", "1");
    write_file(a.path(), "gone/two", "2");
    let repo = open(&a);
    commit_dir(&repo, ROOT, true).expect("commit");

    fs::remove_dir_all(a.path().join("gone")).expect("rm gone");
    fs::remove_file(a.path().join("keep/leaf.txt")).expect("rm leaf");

    let records = parse_stream(full_diff(&repo).as_bytes(), true).expect("parse");
    let deleted: Vec<_> = records
        .iter()
        .filter(|r| matches!(r, ChangeRecord::Deleted { .. }))
        .map(|r| r.path().to_string())
        .collect();
    assert_eq!(records.len(), deleted.len());
    // Subdirectories are walked before the parent's own deletion pass.
    assert_eq!(deleted, ["keep/leaf.txt", "gone"]);
}

#[test]
fn committed_records_silence_the_next_diff() {
    let a = TempDir::new().expect("tree a");
    write_file(a.path(), "d/f", "data");
    let repo = open(&a);

    let stream = full_diff(&repo);
    let records = parse_stream(stream.as_bytes(), true).expect("parse");
    commit_records(&repo, &records).expect("commit");
    assert!(full_diff(&repo).is_empty());
}

// ---------------------------------------------------------------------------
// 4. Memory ceiling
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Collect {
    flushed: Vec<DiffStream>,
    big: Vec<(String, Fingerprint)>,
}

impl DiffSink for Collect {
    fn flush(&mut self, stream: DiffStream) -> Result<(), DiffError> {
        self.flushed.push(stream);
        Ok(())
    }

    fn big_file(&mut self, rel: &str, fingerprint: &Fingerprint) -> Result<(), DiffError> {
        self.big.push((rel.to_string(), fingerprint.clone()));
        Ok(())
    }
}

#[test]
fn oversized_file_goes_out_of_band() {
    let a = TempDir::new().expect("tree a");
    let ceiling = 4096;
    write_file(a.path(), "small", "tiny");
    fs::write(a.path().join("huge.bin"), vec![7u8; ceiling * 3]).expect("write huge");
    let repo = open(&a);

    let mut sink = Collect::default();
    let stream = compute_diff(
        a.path(),
        &repo,
        repo.exclude(),
        &[ROOT.to_string()],
        true,
        DiffOptions {
            ceiling,
            with_contents: true,
        },
        &mut sink,
    )
    .expect("diff");

    assert!(stream.len() < ceiling);
    assert!(sink.flushed.is_empty());
    assert_eq!(sink.big.len(), 1);
    assert_eq!(sink.big[0].0, "huge.bin");
    assert_eq!(sink.big[0].1.file_size(), Some((ceiling * 3) as u64));

    let records = parse_stream(stream.as_bytes(), true).expect("parse");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].path(), "small");
}
