//! End-to-end instrumentation tests.
//!
//! The full pipeline needs a real module plus its Portable PDB sidecar;
//! tests gate on samples under `tests/samples/` and silently pass when
//! they are absent, so the suite runs everywhere while exercising the
//! whole engine where fixtures exist.

use std::path::PathBuf;

use ilcover::{Error, HitEntry, Instrumenter};

/// Copies a sample module and its sidecar into a scratch directory;
/// instrumentation rewrites the module in place and callers are
/// expected to operate on copies.
fn staged_sample(name: &str) -> Option<(tempfile::TempDir, PathBuf)> {
    let samples = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/samples");
    let module = samples.join(format!("{name}.dll"));
    let sidecar = samples.join(format!("{name}.pdb"));
    if !module.is_file() || !sidecar.is_file() {
        return None;
    }

    let dir = tempfile::tempdir().expect("scratch dir");
    let staged_module = dir.path().join(format!("{name}.dll"));
    std::fs::copy(&module, &staged_module).expect("stage module");
    std::fs::copy(&sidecar, dir.path().join(format!("{name}.pdb"))).expect("stage sidecar");
    Some((dir, staged_module))
}

#[test]
fn missing_module_is_a_precondition_failure() {
    let mut instrumenter =
        Instrumenter::new("/nonexistent/App.dll", "t0", &[], &[], &[]).unwrap();
    assert!(!instrumenter.can_instrument());
    assert!(matches!(
        instrumenter.instrument(),
        Err(Error::PreconditionFailed(_))
    ));
}

#[test]
fn module_without_sidecar_cannot_be_instrumented() {
    let dir = tempfile::tempdir().unwrap();
    let module = dir.path().join("Bare.dll");
    std::fs::write(&module, b"not even a pe").unwrap();

    let instrumenter = Instrumenter::new(&module, "t0", &[], &[], &[]).unwrap();
    assert!(!instrumenter.can_instrument());
}

#[test]
fn instruments_sample_in_place() {
    let Some((_dir, module)) = staged_sample("HelloCoverage") else {
        return;
    };

    let mut instrumenter = Instrumenter::new(&module, "itest", &[], &[], &[]).unwrap();
    assert!(instrumenter.can_instrument());
    let result = instrumenter.instrument().unwrap();

    assert!(!result.hit_entries.is_empty());
    assert!(result.hits_file_path.ends_with("HelloCoverage_itest"));
    assert_eq!(result.module, "HelloCoverage");

    // Document indices are dense and in first-seen order.
    let mut indices: Vec<u32> = result.documents.values().map(|d| d.index).collect();
    indices.sort_unstable();
    for (expected, index) in indices.iter().enumerate() {
        assert_eq!(*index, expected as u32);
    }

    // Every entry points at a registered document.
    let document_count = result.documents.len() as u32;
    for entry in &result.hit_entries {
        let document = match entry {
            HitEntry::Line { document, .. } | HitEntry::Branch { document, .. } => *document,
        };
        assert!(document < document_count);
    }

    // The rewritten module still parses, and the tracker type landed in
    // it under the reserved namespace.
    let view = dotscope::CilAssemblyView::from_path(&module).expect("instrumented module loads");
    let strings: Vec<String> = view
        .strings()
        .map(|heap| heap.iter().map(|(_, s)| s.to_string()).collect())
        .unwrap_or_default();
    assert!(strings.iter().any(|s| s == "HelloCoverage_itest"));
    assert!(strings.iter().any(|s| s == "HitsArray"));
    assert!(strings.iter().any(|s| s == "HitsFilePath"));
}

#[test]
fn concurrent_runs_do_not_collide() {
    // Two instrument runs over the same module path with different
    // identifiers must produce distinct tracker names and hit files.
    let Some((_dir_a, module_a)) = staged_sample("HelloCoverage") else {
        return;
    };
    let Some((_dir_b, module_b)) = staged_sample("HelloCoverage") else {
        return;
    };

    let first = Instrumenter::new(&module_a, "runa", &[], &[], &[])
        .unwrap()
        .instrument()
        .unwrap();
    let second = Instrumenter::new(&module_b, "runb", &[], &[], &[])
        .unwrap()
        .instrument()
        .unwrap();

    assert_ne!(first.hits_file_path, second.hits_file_path);
    assert_eq!(first.hit_entries.len(), second.hit_entries.len());
}

#[test]
fn excluded_types_register_no_hits() {
    let Some((_dir, module)) = staged_sample("HelloCoverage") else {
        return;
    };

    let result = Instrumenter::new(&module, "filtered", &["*".to_string()], &[], &[])
        .unwrap()
        .instrument()
        .unwrap();

    // Everything excluded: a well-formed result with an empty map, and
    // the tracker still injected.
    assert!(result.hit_entries.is_empty());
    assert!(result.documents.is_empty());
    let view = dotscope::CilAssemblyView::from_path(&module).expect("module still loads");
    let strings: Vec<String> = view
        .strings()
        .map(|heap| heap.iter().map(|(_, s)| s.to_string()).collect())
        .unwrap_or_default();
    assert!(strings.iter().any(|s| s == "HelloCoverage_filtered"));
}
