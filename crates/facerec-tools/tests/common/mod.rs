//! Reference-comparison helpers shared by the tool tests.
//!
//! References live in `testdata/tools/<name>.fra` and are only written when
//! `FACEREC_REGENERATE_REFS=1` is set. A missing reference fails the test.

#![allow(dead_code)]

use facerec_core::{Archive, Artifact};
use std::path::{Path, PathBuf};

pub const ARRAY_TOLERANCE: f64 = 1e-5;
pub const SCORE_TOLERANCE: f64 = 1e-7;

pub fn reference_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("testdata")
        .join("tools")
        .join(format!("{name}.fra"))
}

pub fn regenerate() -> bool {
    std::env::var("FACEREC_REGENERATE_REFS").is_ok_and(|v| v == "1")
}

/// Read the reference at `path`, or store `produced` there when
/// regenerating. Returns `None` after storing.
fn reference_at(produced: &Archive, path: &Path, regenerate: bool) -> Option<Archive> {
    if regenerate {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).unwrap();
        }
        produced.write(path).unwrap();
        return None;
    }
    if !path.exists() {
        panic!(
            "missing reference {}; run with FACEREC_REGENERATE_REFS=1 to create it",
            path.display()
        );
    }
    Some(Archive::read(path).unwrap())
}

/// Compare an archive against the reference stored at `path`.
pub fn compare_archive_at(produced: &Archive, path: &Path, regenerate: bool) {
    let Some(reference) = reference_at(produced, path, regenerate) else {
        return;
    };
    if let Err(mismatch) = produced.compare(&reference, ARRAY_TOLERANCE) {
        panic!("{} differs from its reference: {mismatch}", path.display());
    }
}

/// Compare a score against the reference stored at `path`.
pub fn compare_score_at(score: f64, path: &Path, regenerate: bool) {
    let mut produced = Archive::new();
    produced.set_f64("score", score).unwrap();
    let Some(reference) = reference_at(&produced, path, regenerate) else {
        return;
    };
    let expected = reference.get_f64("score").unwrap();
    assert!(
        (score - expected).abs() < SCORE_TOLERANCE,
        "{}: score {score} differs from reference {expected}",
        path.display()
    );
}

/// Compare an archive against the reference `name`.
pub fn compare_archive(produced: &Archive, name: &str) {
    compare_archive_at(produced, &reference_path(name), regenerate());
}

/// Compare an artifact file written by a tool against the reference `name`.
pub fn compare_file(produced: &Path, name: &str) {
    compare_archive(&Archive::read(produced).unwrap(), name);
}

/// Compare a payload against the reference `name`.
pub fn compare_artifact<T: Artifact>(value: &T, name: &str) {
    compare_archive(&to_archive(value), name);
}

/// Compare a score against the reference `name`.
pub fn compare_score(score: f64, name: &str) {
    compare_score_at(score, &reference_path(name), regenerate());
}

pub fn to_archive<T: Artifact>(value: &T) -> Archive {
    let mut archive = Archive::new();
    value.save(&mut archive).unwrap();
    archive
}

/// Assert that two payloads store the same data within the array tolerance.
pub fn assert_close<T: Artifact>(a: &T, b: &T) {
    if let Err(mismatch) = to_archive(a).compare(&to_archive(b), ARRAY_TOLERANCE) {
        panic!("artifacts differ: {mismatch}");
    }
}

pub fn assert_score(score: f64, expected: f64) {
    assert!(
        (score - expected).abs() < SCORE_TOLERANCE,
        "score {score} != {expected}"
    );
}
