mod common;

use std::fs;

use common::vx;

fn pinned_engine() -> String {
    format!("https://git.example/engine/engine.git@{}", "a".repeat(40))
}

#[test]
fn create_validate_clone_lifecycle() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = temp.path().join("cache");

    vx(temp.path(), &cache)
        .args(["create", "v1", "--engine"])
        .arg(pinned_engine())
        .arg("--extension")
        .arg(format!(
            "https://git.example/nodes/upscaler.git@{}",
            "b".repeat(40)
        ))
        .args([
            "--model",
            r#"{"source": "hub://org/repo/x.safetensors", "target_subdir": "checkpoints"}"#,
        ])
        .assert()
        .success();
    assert!(temp.path().join("versions/v1.json").is_file());

    // Pinned specs validate fully offline.
    vx(temp.path(), &cache)
        .args(["--offline", "validate", "v1"])
        .assert()
        .success();
    let lock_path = cache.join("resolved/v1.lock");
    assert!(lock_path.is_file());

    vx(temp.path(), &cache)
        .args(["clone", "v1", "v2"])
        .assert()
        .success();
    let cloned = fs::read_to_string(temp.path().join("versions/v2.json")).expect("v2");
    assert!(cloned.contains("\"version_id\": \"v2\""));
    // Clone copies the spec, never the lock.
    assert!(!cache.join("resolved/v2.lock").is_file());

    // Cloning onto an existing id needs --force.
    vx(temp.path(), &cache)
        .args(["clone", "v1", "v2"])
        .assert()
        .code(2);
    vx(temp.path(), &cache)
        .args(["clone", "v1", "v2", "--force"])
        .assert()
        .success();
}

#[test]
fn repeated_validation_is_byte_identical() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = temp.path().join("cache");

    vx(temp.path(), &cache)
        .args(["create", "det", "--engine"])
        .arg(pinned_engine())
        .assert()
        .success();

    vx(temp.path(), &cache)
        .args(["--offline", "validate", "det"])
        .assert()
        .success();
    let first = fs::read(cache.join("resolved/det.lock")).expect("first lock");

    vx(temp.path(), &cache)
        .args(["--offline", "validate", "det"])
        .assert()
        .success();
    let second = fs::read(cache.join("resolved/det.lock")).expect("second lock");

    assert_eq!(first, second);
}

#[test]
fn spec_files_are_canonical_json() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = temp.path().join("cache");
    vx(temp.path(), &cache)
        .args(["create", "canon", "--engine"])
        .arg(pinned_engine())
        .assert()
        .success();

    let contents = fs::read_to_string(temp.path().join("versions/canon.json")).expect("spec");
    assert!(contents.ends_with('\n'));
    assert!(!contents.contains('\r'));
    // Keys arrive sorted: engine_source precedes version_id.
    let engine_idx = contents.find("engine_source").expect("engine_source");
    let version_idx = contents.find("version_id").expect("version_id");
    assert!(engine_idx < version_idx);
}

#[test]
fn delete_removes_spec_only_when_asked() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = temp.path().join("cache");
    vx(temp.path(), &cache)
        .args(["create", "keep", "--engine"])
        .arg(pinned_engine())
        .assert()
        .success();
    vx(temp.path(), &cache)
        .args(["--offline", "validate", "keep"])
        .assert()
        .success();

    vx(temp.path(), &cache)
        .args(["delete", "keep"])
        .assert()
        .success();
    assert!(!cache.join("resolved/keep.lock").is_file());
    assert!(temp.path().join("versions/keep.json").is_file());

    vx(temp.path(), &cache)
        .args(["delete", "keep", "--remove-spec"])
        .assert()
        .success();
    assert!(!temp.path().join("versions/keep.json").is_file());
}
