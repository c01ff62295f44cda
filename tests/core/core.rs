use spectrail::core::checkpoint::{CheckpointCoordinator, GitOperation, OperationKind, RiskReason};
use spectrail::core::config::{CheckpointConfig, LockConfig, SpectrailConfig};
use spectrail::core::error::SpectrailError;
use spectrail::core::git_lock::{GitLockManager, LockState};
use spectrail::core::index::{ChangeKind, IndexManager, IndexState, validate_schema};
use spectrail::core::time;
use spectrail::core::workspace::Workspace;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::{TempDir, tempdir};

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn git_repo() -> TempDir {
    let tmp = tempdir().expect("tempdir");
    let dir = tmp.path();
    git(dir, &["init", "-q"]);
    git(dir, &["config", "user.email", "test@test.com"]);
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    fs::write(dir.join("README.md"), "# test\n").expect("write readme");
    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", "init"]);
    tmp
}

fn commit_file(dir: &Path, rel: &str, content: &str, msg: &str) -> String {
    let p = dir.join(rel);
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(&p, content).unwrap();
    git(dir, &["add", rel]);
    git(dir, &["commit", "-q", "-m", msg]);
    git(dir, &["rev-parse", "HEAD"])
}

fn write(ws: &Workspace, rel: &str, content: &str) {
    let p = ws.root.join(rel);
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, content).unwrap();
}

fn index(ws: &Workspace) -> IndexManager {
    IndexManager::new(ws, &SpectrailConfig::default())
}

fn fast_locks(ws: &Workspace) -> GitLockManager {
    let config = LockConfig {
        timeout_ms: 500,
        initial_backoff_ms: 5,
        max_backoff_ms: 50,
        corrupt_grace_ms: 1_000,
    };
    GitLockManager::new(ws, &config)
}

// ===== Index =====

#[test]
fn initialize_is_idempotent() {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    let mgr = index(&ws);

    assert!(mgr.initialize().unwrap());
    let first = fs::read(mgr.path()).unwrap();
    assert!(!mgr.initialize().unwrap());
    assert_eq!(fs::read(mgr.path()).unwrap(), first);

    let value: serde_json::Value = serde_json::from_slice(&first).unwrap();
    assert!(validate_schema(&value));
    assert_eq!(mgr.state(), IndexState::Empty);
}

#[test]
fn auth_scenario_round_trip_and_delete() {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    let mgr = index(&ws);
    mgr.initialize().unwrap();

    write(
        &ws,
        "src/auth.rs",
        "// REQ AUTH-001 login requires a password\nfn login() {}\n// REQ AUTH-002 verify\nfn logout() {}\n",
    );
    let outcome = mgr
        .process_change(&ws.root.join("src/auth.rs"), ChangeKind::Created)
        .unwrap();
    assert!(outcome.written);

    let doc = mgr.load();
    let req = doc.bucket("REQ").unwrap();
    assert_eq!(req.len(), 2);
    assert_eq!(req["REQ-AUTH-001"].locations.len(), 1);
    assert_eq!(req["REQ-AUTH-002"].locations.len(), 1);
    assert_eq!(req["REQ-AUTH-002"].locations[0].line, 3);
    assert_eq!(doc.metadata.total_tags, 2);
    assert_eq!(doc.files["src/auth.rs"].len(), 2);
    assert!(doc.is_valid());

    fs::remove_file(ws.root.join("src/auth.rs")).unwrap();
    mgr.process_change(Path::new("src/auth.rs"), ChangeKind::Deleted)
        .unwrap();
    let doc = mgr.load();
    assert_eq!(doc.metadata.total_tags, 0);
    assert!(doc.files.is_empty());
    assert!(doc.bucket("REQ").unwrap().is_empty());
}

#[test]
fn first_seen_survives_re_indexing_the_file() {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    let mgr = index(&ws);
    write(&ws, "src/auth.rs", "// @REQ AUTH-001\n");
    mgr.process_change(Path::new("src/auth.rs"), ChangeKind::Created)
        .unwrap();
    let (_, first) = mgr.query("REQ-AUTH-001").unwrap();

    thread::sleep(std::time::Duration::from_millis(1_100));
    write(&ws, "src/auth.rs", "// @REQ AUTH-001\n// @REQ AUTH-002\n");
    let outcome = mgr
        .process_change(Path::new("src/auth.rs"), ChangeKind::Modified)
        .unwrap();
    assert!(outcome.written);

    let (_, kept) = mgr.query("REQ-AUTH-001").unwrap();
    let (_, added) = mgr.query("REQ-AUTH-002").unwrap();
    assert_eq!(kept.first_seen, first.first_seen);
    assert_ne!(kept.last_seen, first.first_seen);
    assert_eq!(added.first_seen, kept.last_seen);
}

#[test]
fn change_outside_the_root_is_rejected() {
    let tmp = tempdir().unwrap();
    let other = tempdir().unwrap();
    fs::write(other.path().join("x.rs"), "// @CODE OUT-001\n").unwrap();
    let ws = Workspace::new(tmp.path());
    let mgr = index(&ws);
    mgr.initialize().unwrap();

    for path in [other.path().join("x.rs"), Path::new("../x.rs").to_path_buf()] {
        assert!(matches!(
            mgr.process_change(&path, ChangeKind::Created),
            Err(SpectrailError::ValidationError(_))
        ));
    }
    let doc = mgr.load();
    assert_eq!(doc.metadata.total_tags, 0);
    assert!(doc.files.is_empty());
}

#[test]
fn modified_twice_leaves_store_unchanged() {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    let mgr = index(&ws);
    write(&ws, "src/a.rs", "// @TASK AUTH-010\n// @TASK AUTH-010 verify\n");

    mgr.process_change(Path::new("src/a.rs"), ChangeKind::Modified)
        .unwrap();
    let after_first = fs::read(mgr.path()).unwrap();
    let second = mgr
        .process_change(Path::new("src/a.rs"), ChangeKind::Modified)
        .unwrap();
    assert!(!second.written);
    assert_eq!(fs::read(mgr.path()).unwrap(), after_first);

    let doc = mgr.load();
    assert_eq!(doc.query("TASK-AUTH-010").unwrap().entry.locations.len(), 2);
    assert_eq!(doc.metadata.total_tags, 1);
}

#[test]
fn delete_removes_exactly_the_files_attribution() {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    let mgr = index(&ws);
    write(&ws, "specs/auth.py", "# REQ AUTH-001\n# REQ AUTH-003\n");
    write(&ws, "src/auth.rs", "// REQ AUTH-001 impl\n// @TASK AUTH-001\n");
    mgr.process_change(Path::new("specs/auth.py"), ChangeKind::Created)
        .unwrap();
    mgr.process_change(Path::new("src/auth.rs"), ChangeKind::Created)
        .unwrap();
    let before = mgr.load();
    assert_eq!(before.metadata.total_tags, 3);
    let first_seen = before.query("REQ-AUTH-001").unwrap().entry.first_seen.clone();

    mgr.process_change(Path::new("src/auth.rs"), ChangeKind::Deleted)
        .unwrap();
    let after = mgr.load();
    // TASK-AUTH-001 disappears; REQ-AUTH-001 survives through specs/auth.py.
    assert_eq!(after.metadata.total_tags, 2);
    let req = after.query("REQ-AUTH-001").unwrap();
    assert_eq!(req.entry.locations.len(), 1);
    assert_eq!(req.entry.locations[0].file, "specs/auth.py");
    assert_eq!(req.entry.first_seen, first_seen);
    assert!(after.query("TASK-AUTH-001").is_none());
}

#[test]
fn modified_event_for_vanished_file_acts_as_delete() {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    let mgr = index(&ws);
    write(&ws, "src/a.rs", "// @CODE CORE-001\n");
    mgr.process_change(Path::new("src/a.rs"), ChangeKind::Created)
        .unwrap();
    fs::remove_file(ws.root.join("src/a.rs")).unwrap();
    let outcome = mgr
        .process_change(Path::new("src/a.rs"), ChangeKind::Modified)
        .unwrap();
    assert_eq!(outcome.occurrences_before, 1);
    assert_eq!(outcome.occurrences_after, 0);
    assert_eq!(mgr.load().metadata.total_tags, 0);
}

#[test]
fn corrupt_store_degrades_then_repairs() {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    let mgr = index(&ws);
    mgr.initialize().unwrap();
    fs::write(mgr.path(), "{ not json").unwrap();

    let doc = mgr.load();
    assert_eq!(doc.metadata.total_tags, 0);
    assert!(matches!(
        mgr.load_strict(),
        Err(SpectrailError::SchemaCorruption(_))
    ));

    write(&ws, "src/a.rs", "// @TASK CORE-002\n");
    mgr.process_change(Path::new("src/a.rs"), ChangeKind::Modified)
        .unwrap();
    let repaired = mgr.load_strict().unwrap();
    assert_eq!(repaired.metadata.total_tags, 1);
}

#[test]
fn invariant_violation_counts_as_corruption() {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    let mgr = index(&ws);
    write(&ws, "src/a.rs", "// @TASK CORE-002\n");
    mgr.process_change(Path::new("src/a.rs"), ChangeKind::Created)
        .unwrap();

    let mut value: serde_json::Value =
        serde_json::from_slice(&fs::read(mgr.path()).unwrap()).unwrap();
    value["metadata"]["total_tags"] = serde_json::json!(7);
    fs::write(mgr.path(), serde_json::to_vec(&value).unwrap()).unwrap();
    assert!(mgr.load_strict().is_err());
    assert_eq!(mgr.load().metadata.total_tags, 0);
}

#[test]
fn v1_documents_are_migrated_on_load() {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    let mgr = index(&ws);
    ws.ensure_state_dir().unwrap();
    let v1 = serde_json::json!({
        "metadata": {"created_at": "1700000000Z", "updated_at": "1700000000Z", "version": "1.0", "total_tags": 0},
        "categories": {
            "PRIMARY": {"REQ": {"REQ-AUTH-001": {
                "description": null,
                "locations": [{"file": "specs/a.py", "line": 1, "verb": "impl"}],
                "first_seen": "1700000000Z",
                "last_seen": "1700000000Z"
            }}, "DESIGN": {}},
            "STEERING": {"PRODUCT": {}, "TECH": {}, "STRUCTURE": {}},
            "IMPLEMENTATION": {"TASK": {}, "CODE": {}},
            "QUALITY": {"TEST": {}, "REVIEW": {}}
        },
        "files": {"specs/a.py": ["REQ-AUTH-001"]}
    });
    fs::write(mgr.path(), serde_json::to_vec(&v1).unwrap()).unwrap();

    let doc = mgr.load_strict().unwrap();
    assert_eq!(doc.metadata.schema_version, 2);
    assert_eq!(doc.metadata.total_tags, 1);
    assert!(doc.chains.is_empty());
    assert_eq!(doc.metadata.created_at, "1700000000Z");
}

#[test]
fn rebuild_scans_workspace_and_keeps_created_at() {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    let mgr = index(&ws);
    mgr.initialize().unwrap();
    let created_at = mgr.load().metadata.created_at;

    write(&ws, "src/lib.rs", "// @CODE CORE-001\n");
    write(&ws, "tests/core.rs", "// @TEST CORE-001 verify\n");
    write(&ws, "specs/req.md", "<!-- REQ CORE-001 core behaviour -->\n");
    write(&ws, "target/debug/gen.rs", "// @CODE JUNK-001\n");
    write(&ws, ".spectrail/notes.rs", "// @CODE JUNK-002\n");

    let doc = mgr.rebuild_workspace().unwrap();
    assert_eq!(doc.metadata.created_at, created_at);
    assert_eq!(doc.metadata.total_tags, 3);
    assert!(doc.contains("REQ-CORE-001"));
    assert!(doc.contains("TEST-CORE-001"));
    assert!(!doc.contains("CODE-JUNK-001"));
    assert!(!doc.contains("CODE-JUNK-002"));
    assert_eq!(mgr.load_strict().unwrap(), doc);
}

#[test]
fn hundred_files_parse_quickly() {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    let mgr = index(&ws);
    let mut paths = Vec::new();
    for i in 0..100 {
        let rel = format!("src/m{i}.rs");
        let mut body = String::new();
        for j in 0..20 {
            body.push_str(&format!("// @TASK MOD{i}-{j:03}\nfn f{j}() {{ let _ = \"// @TASK FAKE-001\"; }}\n"));
        }
        write(&ws, &rel, &body);
        paths.push(ws.root.join(rel));
    }
    let started = std::time::Instant::now();
    let doc = mgr.rebuild(&paths).unwrap();
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    assert_eq!(doc.metadata.total_tags, 2000);
    assert!(!doc.contains("TASK-FAKE-001"));
}

// ===== Git lock =====

#[test]
fn exactly_one_concurrent_acquirer_wins() {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    ws.ensure_state_dir().unwrap();
    let start = Arc::new(Barrier::new(2));
    let tried = Arc::new(Barrier::new(2));

    let handles: Vec<_> = ["agent-a", "agent-b"]
        .into_iter()
        .map(|holder| {
            let ws = ws.clone();
            let start = Arc::clone(&start);
            let tried = Arc::clone(&tried);
            thread::spawn(move || {
                let locks = fast_locks(&ws);
                start.wait();
                let attempt = locks.acquire(holder, "commit", "", false);
                let won = attempt.is_ok();
                let contended = matches!(attempt, Err(SpectrailError::LockContention { .. }));
                tried.wait();
                drop(attempt);
                (won, contended)
            })
        })
        .collect();

    let results: Vec<(bool, bool)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|(won, _)| *won).count(), 1);
    assert_eq!(results.iter().filter(|(_, contended)| *contended).count(), 1);

    let third = fast_locks(&ws);
    let guard = third.acquire("agent-c", "merge", "", false).unwrap();
    assert_eq!(guard.holder_id(), "agent-c");
}

#[test]
fn waiter_gets_lock_after_release() {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    let holder = fast_locks(&ws);
    let guard = holder.acquire("agent-a", "commit", "", false).unwrap();

    let ws2 = ws.clone();
    let waiter = thread::spawn(move || {
        let locks = fast_locks(&ws2);
        locks
            .acquire("agent-b", "commit", "", true)
            .map(|g| g.holder_id().to_string())
    });
    thread::sleep(std::time::Duration::from_millis(60));
    guard.release().unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), "agent-b");
    assert_eq!(holder.status(), LockState::Free);
}

#[test]
fn lock_transitions_are_audited() {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    let locks = fast_locks(&ws);
    locks
        .acquire("agent-a", "commit", "", false)
        .unwrap()
        .release()
        .unwrap();
    let ops: Vec<String> = spectrail::core::audit::AuditLog::new(&ws)
        .read_all()
        .into_iter()
        .map(|e| e.op)
        .collect();
    assert_eq!(ops, vec!["lock.acquire", "lock.release"]);
}

// ===== Checkpoints =====

fn coordinator(ws: &Workspace) -> CheckpointCoordinator {
    CheckpointCoordinator::new(ws, &CheckpointConfig::default()).unwrap()
}

fn files(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("src/f{i}.rs")).collect()
}

#[test]
fn risky_delete_checkpoints_and_small_delete_does_not() {
    let tmp = git_repo();
    let ws = Workspace::new(tmp.path());
    let locks = fast_locks(&ws);
    let cps = coordinator(&ws);
    let lock = locks.acquire("agent-a", "delete", "", false).unwrap();

    let small = GitOperation::new(OperationKind::Delete, "one file", files(1));
    assert!(cps.guard(&lock, &small).unwrap().is_none());
    assert!(cps.list().is_empty());
    assert!(cps.orphans().unwrap().is_empty());

    let big = GitOperation::new(OperationKind::Delete, "mass delete", files(10));
    let cp = cps.guard(&lock, &big).unwrap().expect("checkpoint");
    assert!(!cp.is_safety);
    assert!(cp.git_ref.starts_with("refs/spectrail/checkpoints/cp-"));
    assert_eq!(cp.commit, git(tmp.path(), &["rev-parse", "HEAD"]));
    assert_eq!(git(tmp.path(), &["rev-parse", &cp.git_ref]), cp.commit);
    assert_eq!(cps.list(), vec![cp.clone()]);

    let log = fs::read_to_string(ws.checkpoint_log_path()).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert!(log.contains(&cp.id));
}

#[test]
fn dirty_tree_is_snapshotted_without_touching_it() {
    let tmp = git_repo();
    let ws = Workspace::new(tmp.path());
    fs::write(tmp.path().join("README.md"), "# dirty\n").unwrap();
    let locks = fast_locks(&ws);
    let cps = coordinator(&ws);
    let lock = locks.acquire("agent-a", "commit", "", false).unwrap();

    let op = GitOperation::new(OperationKind::Commit, "bump", vec!["Cargo.toml".to_string()]);
    assert!(matches!(cps.evaluate(&op), Some(RiskReason::CriticalFile { .. })));
    let cp = cps.guard(&lock, &op).unwrap().unwrap();
    assert_ne!(cp.commit, git(tmp.path(), &["rev-parse", "HEAD"]));
    let snap = git(tmp.path(), &["show", &format!("{}:README.md", cp.commit)]);
    assert_eq!(snap, "# dirty");
    assert_eq!(
        fs::read_to_string(tmp.path().join("README.md")).unwrap(),
        "# dirty\n"
    );
}

#[test]
fn restore_takes_exactly_one_safety_checkpoint_first() {
    let tmp = git_repo();
    let dir = tmp.path();
    let a = commit_file(dir, "app.rs", "v1\n", "a");
    let ws = Workspace::new(dir);
    let locks = fast_locks(&ws);
    let cps = coordinator(&ws);

    let lock = locks.acquire("agent-a", "commit", "", false).unwrap();
    let target = cps
        .guard(
            &lock,
            &GitOperation::new(OperationKind::Commit, "lockfile", vec!["Cargo.lock".to_string()]),
        )
        .unwrap()
        .unwrap();
    assert_eq!(target.commit, a);
    let b = commit_file(dir, "app.rs", "v2\n", "b");

    let before = time::now_epoch_ms();
    let safety = cps.restore(&lock, &target.id).unwrap();
    let after = time::now_epoch_ms();

    assert!(safety.is_safety);
    assert_eq!(safety.commit, b);
    assert!(safety.created_at >= before && safety.created_at <= after);
    assert_eq!(fs::read_to_string(dir.join("app.rs")).unwrap(), "v1\n");
    assert_eq!(git(dir, &["rev-parse", "HEAD"]), a);

    let list = cps.list();
    assert_eq!(list.iter().filter(|c| c.is_safety).count(), 1);
    assert_eq!(list.len(), 2);
}

#[test]
fn restore_discards_tracked_edits_kept_by_the_safety_checkpoint() {
    let tmp = git_repo();
    let dir = tmp.path();
    commit_file(dir, "a.rs", "a1\n", "a");
    let a = commit_file(dir, "b.rs", "b1\n", "b");
    let ws = Workspace::new(dir);
    let locks = fast_locks(&ws);
    let cps = coordinator(&ws);
    let lock = locks.acquire("agent-a", "delete", "", false).unwrap();
    let target = cps
        .guard(&lock, &GitOperation::new(OperationKind::Delete, "purge", files(6)))
        .unwrap()
        .unwrap();
    commit_file(dir, "a.rs", "a2\n", "a v2");
    // b.rs is identical in HEAD and the target; a plain checkout would keep this.
    fs::write(dir.join("b.rs"), "local edit\n").unwrap();

    let safety = cps.restore(&lock, &target.id).unwrap();

    assert_eq!(git(dir, &["rev-parse", "HEAD"]), a);
    assert_eq!(fs::read_to_string(dir.join("a.rs")).unwrap(), "a1\n");
    assert_eq!(fs::read_to_string(dir.join("b.rs")).unwrap(), "b1\n");
    assert_eq!(git(dir, &["status", "--porcelain", "--untracked-files=no"]), "");
    let kept = git(dir, &["show", &format!("{}:b.rs", safety.commit)]);
    assert_eq!(kept, "local edit");
}

#[test]
fn restore_conflict_on_untracked_file_changes_nothing() {
    let tmp = git_repo();
    let dir = tmp.path();
    commit_file(dir, "gen.rs", "v1\n", "a");
    let ws = Workspace::new(dir);
    let locks = fast_locks(&ws);
    let cps = coordinator(&ws);
    let lock = locks.acquire("agent-a", "commit", "", false).unwrap();
    let target = cps
        .guard(
            &lock,
            &GitOperation::new(OperationKind::Delete, "purge", files(6)),
        )
        .unwrap()
        .unwrap();
    git(dir, &["rm", "-q", "gen.rs"]);
    git(dir, &["commit", "-q", "-m", "drop gen"]);
    let b = git(dir, &["rev-parse", "HEAD"]);
    fs::write(dir.join("gen.rs"), "untracked\n").unwrap();

    match cps.restore(&lock, &target.id) {
        Err(SpectrailError::RestoreConflict { checkpoint_id, paths }) => {
            assert_eq!(checkpoint_id, target.id);
            assert_eq!(paths, vec!["gen.rs".to_string()]);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(fs::read_to_string(dir.join("gen.rs")).unwrap(), "untracked\n");
    assert_eq!(git(dir, &["rev-parse", "HEAD"]), b);
}

#[test]
fn restore_unknown_checkpoint_is_not_found() {
    let tmp = git_repo();
    let ws = Workspace::new(tmp.path());
    let locks = fast_locks(&ws);
    let cps = coordinator(&ws);
    let lock = locks.acquire("agent-a", "restore", "", false).unwrap();
    assert!(matches!(
        cps.restore(&lock, "cp-nope"),
        Err(SpectrailError::NotFound(_))
    ));
    assert!(cps.list().is_empty());
}

#[test]
fn prune_keeps_newest_and_clears_orphans() {
    let tmp = git_repo();
    let dir = tmp.path();
    let ws = Workspace::new(dir);
    let locks = fast_locks(&ws);
    let cps = coordinator(&ws);
    let lock = locks.acquire("agent-a", "delete", "", false).unwrap();
    let op = GitOperation::new(OperationKind::Delete, "purge", files(8));
    for _ in 0..3 {
        cps.guard(&lock, &op).unwrap().unwrap();
        thread::sleep(std::time::Duration::from_millis(3));
    }
    let newest = cps.list()[0].clone();
    git(dir, &["update-ref", "refs/spectrail/checkpoints/cp-orphan", "HEAD"]);
    assert_eq!(
        cps.orphans().unwrap(),
        vec!["refs/spectrail/checkpoints/cp-orphan".to_string()]
    );

    let report = cps.prune(&lock, 1).unwrap();
    assert_eq!(report.pruned.len(), 2);
    assert_eq!(report.orphans_removed.len(), 1);
    assert_eq!(cps.list(), vec![newest]);
    assert!(cps.orphans().unwrap().is_empty());
    let refs = git(dir, &["for-each-ref", "--format=%(refname)", "refs/spectrail/"]);
    assert_eq!(refs.lines().count(), 1);
}

#[test]
fn run_guarded_releases_even_when_the_operation_fails() {
    let tmp = git_repo();
    let ws = Workspace::new(tmp.path());
    let locks = fast_locks(&ws);
    let cps = coordinator(&ws);
    let op = GitOperation::new(OperationKind::Delete, "purge", files(7));

    let result: Result<(_, ()), _> = cps.run_guarded(&locks, "agent-a", &op, false, |cp| {
        assert!(cp.is_some());
        Err(SpectrailError::ValidationError("boom".to_string()))
    });
    assert!(matches!(result, Err(SpectrailError::ValidationError(_))));
    assert_eq!(locks.status(), LockState::Free);
    assert_eq!(cps.list().len(), 1);

    let small = GitOperation::new(OperationKind::Delete, "one", files(1));
    let (cp, value) = cps
        .run_guarded(&locks, "agent-a", &small, false, |_| Ok(42))
        .unwrap();
    assert!(cp.is_none());
    assert_eq!(value, 42);
}
