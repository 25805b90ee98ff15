mod common;

use common::vx;

#[test]
fn validate_of_missing_spec_exits_3() {
    let temp = tempfile::tempdir().expect("tempdir");
    vx(temp.path(), &temp.path().join("cache"))
        .args(["validate", "ghost"])
        .assert()
        .code(3);
}

#[test]
fn create_with_bad_model_json_exits_2() {
    let temp = tempfile::tempdir().expect("tempdir");
    vx(temp.path(), &temp.path().join("cache"))
        .args([
            "create",
            "v1",
            "--engine",
            "https://git.example/engine/engine.git@main",
            "--model",
            "not-json",
        ])
        .assert()
        .code(2);
}

#[test]
fn create_with_traversal_target_exits_3() {
    let temp = tempfile::tempdir().expect("tempdir");
    vx(temp.path(), &temp.path().join("cache"))
        .args([
            "create",
            "v1",
            "--engine",
            "https://git.example/engine/engine.git@main",
            "--model",
            r#"{"source": "https://host/m.bin", "target_path": "../../escape"}"#,
        ])
        .assert()
        .code(3);
}

#[test]
fn offline_validate_of_floating_ref_exits_7() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = temp.path().join("cache");
    vx(temp.path(), &cache)
        .args([
            "create",
            "v1",
            "--engine",
            "https://git.example/engine/engine.git@main",
        ])
        .assert()
        .success();
    let assert = vx(temp.path(), &cache)
        .args(["--offline", "validate", "v1"])
        .assert()
        .code(7);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(
        stderr.contains("[offline_unavailable]"),
        "stderr was: {stderr}"
    );
}

#[test]
fn delete_of_unmarked_directory_exits_2() {
    let temp = tempfile::tempdir().expect("tempdir");
    let target = temp.path().join("not-a-workspace");
    std::fs::create_dir_all(&target).expect("dir");
    vx(temp.path(), &temp.path().join("cache"))
        .args(["delete", "v1", "--target"])
        .arg(&target)
        .assert()
        .code(2);
    assert!(target.exists());
}

#[test]
fn run_handler_with_missing_workflow_exits_2() {
    let temp = tempfile::tempdir().expect("tempdir");
    vx(temp.path(), &temp.path().join("cache"))
        .args(["run-handler", "v1", "--workflow", "no-such-file.json"])
        .assert()
        .code(2);
}

#[test]
fn delete_with_nothing_to_remove_succeeds() {
    let temp = tempfile::tempdir().expect("tempdir");
    let target = temp.path().join("absent-workspace");
    vx(temp.path(), &temp.path().join("cache"))
        .args(["delete", "v1", "--target"])
        .arg(&target)
        .assert()
        .success();
}
