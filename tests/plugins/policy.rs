use spectrail::core::config::{DuplicatePolicy, PolicyConfig, SpectrailConfig};
use spectrail::core::index::{ChangeKind, IndexDocument, IndexManager};
use spectrail::core::workspace::Workspace;
use spectrail::plugins::policy::{
    PolicyValidator, RULE_DUPLICATE_TAG, RULE_MISSING_TAG, RULE_UNLINKED_TAG, Severity, blocking,
};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn indexed(files: &[(&str, &str)]) -> (tempfile::TempDir, IndexDocument) {
    let tmp = tempdir().unwrap();
    let ws = Workspace::new(tmp.path());
    let mgr = IndexManager::new(&ws, &SpectrailConfig::default());
    for (rel, content) in files {
        let p = ws.root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(&p, content).unwrap();
        mgr.process_change(Path::new(rel), ChangeKind::Created)
            .unwrap();
    }
    let doc = mgr.load();
    (tmp, doc)
}

#[test]
fn exempt_paths_yield_no_violations() {
    let v = PolicyValidator::new(&PolicyConfig::default(), IndexDocument::skeleton()).unwrap();
    for path in [
        "docs/guide.rs",
        "reports/coverage.py",
        "src/generated/api.ts",
        "templates/base.js",
        "third_party/vendor/lib.c",
        "examples/demo.rs",
        ".spectrail/hooks.sh",
    ] {
        assert!(v.validate(path, "fn main() {}").is_empty(), "{path} should be exempt");
        assert!(v.is_exempt(path));
    }
}

#[test]
fn custom_exemptions_replace_defaults() {
    let config = PolicyConfig {
        exempt: vec!["legacy/**".to_string()],
        ..PolicyConfig::default()
    };
    let v = PolicyValidator::new(&config, IndexDocument::skeleton()).unwrap();
    assert!(v.validate("legacy/old.rs", "").is_empty());
    let out = v.validate("docs/snippet.rs", "");
    assert_eq!(out[0].rule, RULE_MISSING_TAG);
}

#[test]
fn strict_linkage_requires_spec_declared_elsewhere() {
    let (_tmp, doc) = indexed(&[("specs/tasks.md", "<!-- TASK AUTH-001 login flow -->\n")]);
    let config = PolicyConfig {
        strict_linkage: true,
        ..PolicyConfig::default()
    };
    let v = PolicyValidator::new(&config, doc).unwrap();

    assert!(v.validate("src/login.rs", "// @TASK AUTH-001\n").is_empty());

    let out = v.validate("src/logout.rs", "// @TASK AUTH-099\n");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].rule, RULE_UNLINKED_TAG);
    assert_eq!(out[0].severity, Severity::High);
    assert_eq!(out[0].spec_id.as_deref(), Some("TASK-AUTH-099"));
    assert_eq!(out[0].line, Some(1));
}

#[test]
fn strict_linkage_checks_chain_targets() {
    let (_tmp, doc) = indexed(&[("specs/req.md", "<!-- REQ AUTH-001 -->\n")]);
    let config = PolicyConfig {
        strict_linkage: true,
        ..PolicyConfig::default()
    };
    let v = PolicyValidator::new(&config, doc).unwrap();
    assert!(
        v.validate("src/design.rs", "// DESIGN AUTH-010 depends REQ-AUTH-001\n")
            .is_empty()
    );
    let out = v.validate("src/design.rs", "// DESIGN AUTH-011 depends REQ-AUTH-404\n");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].spec_id.as_deref(), Some("REQ-AUTH-404"));
}

#[test]
fn a_file_cannot_link_to_itself() {
    let (_tmp, doc) = indexed(&[("src/login.rs", "// @TASK AUTH-001\n")]);
    let config = PolicyConfig {
        strict_linkage: true,
        ..PolicyConfig::default()
    };
    let v = PolicyValidator::new(&config, doc).unwrap();
    let out = v.validate("src/login.rs", "// @TASK AUTH-001\nfn login() {}\n");
    assert_eq!(out[0].rule, RULE_UNLINKED_TAG);
}

#[test]
fn duplicates_rejected_by_default_and_merged_on_request() {
    let (_tmp, doc) = indexed(&[("src/a.rs", "// @CODE AUTH-001\n")]);

    let reject = PolicyValidator::new(&PolicyConfig::default(), doc.clone()).unwrap();
    let out = reject.validate("src/b.rs", "// @CODE AUTH-001\n// @CODE AUTH-001\n");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].rule, RULE_DUPLICATE_TAG);
    assert_eq!(out[0].severity, Severity::Medium);
    assert!(out[0].message.contains("src/a.rs:1"));
    assert!(!blocking(&out));

    // A different verb is a different declaration.
    assert!(reject.validate("src/b.rs", "// @CODE AUTH-001 verify\n").is_empty());
    // Re-validating the file that owns the tag is not a duplicate.
    assert!(reject.validate("src/a.rs", "// @CODE AUTH-001\n").is_empty());

    let merge = PolicyValidator::new(
        &PolicyConfig {
            duplicates: DuplicatePolicy::Merge,
            ..PolicyConfig::default()
        },
        doc,
    )
    .unwrap();
    assert!(merge.validate("src/b.rs", "// @CODE AUTH-001\n").is_empty());
}

#[test]
fn tags_inside_strings_do_not_count() {
    let v = PolicyValidator::new(&PolicyConfig::default(), IndexDocument::skeleton()).unwrap();
    let out = v.validate("src/app.ts", "const s = \"// @TASK AUTH-001\";\n");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].rule, RULE_MISSING_TAG);
    assert!(blocking(&out));
}

#[test]
fn invalid_glob_is_reported() {
    let config = PolicyConfig {
        exempt: vec!["src/[".to_string()],
        ..PolicyConfig::default()
    };
    assert!(PolicyValidator::new(&config, IndexDocument::skeleton()).is_err());
}
