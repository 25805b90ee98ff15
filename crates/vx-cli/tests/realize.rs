mod common;

use std::fs;

use common::{find_git, find_python, init_engine_repo, vx};

/// End-to-end realization against a local engine repository: sources cloned
/// into the shared cache, projected as symlinks, model fetched and projected,
/// marker written, warm re-run short-circuited, delete leaving the cache
/// intact.
#[test]
fn realize_projects_sources_and_models_then_short_circuits() {
    if find_git().is_none() || find_python().is_none() {
        eprintln!("skipping realize test (git or python not found)");
        return;
    }
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = temp.path().join("cache");
    let (repo, commit) = init_engine_repo(
        temp.path(),
        &[("main.py", "print('engine stub')\n")],
    );

    let model_file = temp.path().join("weights.bin");
    fs::write(&model_file, b"weights").expect("model");

    vx(temp.path(), &cache)
        .args(["create", "e2e", "--engine"])
        .arg(&repo)
        .arg("--model")
        .arg(format!(
            r#"{{"source": "{}", "target_subdir": "checkpoints"}}"#,
            model_file.display()
        ))
        .assert()
        .success();

    let workspace = temp.path().join("ws");
    vx(temp.path(), &cache)
        .args(["realize", "e2e", "--target"])
        .arg(&workspace)
        .assert()
        .success();

    // Engine projection is a symlink into the shared source cache.
    let engine_link = workspace.join("engine");
    assert!(fs::symlink_metadata(&engine_link)
        .expect("engine link")
        .file_type()
        .is_symlink());
    let entry = fs::read_link(&engine_link).expect("target");
    assert!(entry.starts_with(cache.join("sources")));
    assert!(entry.display().to_string().contains(&commit));
    assert!(engine_link.join("main.py").is_file());

    // Model projected under its category, bytes intact through the cache.
    let model_link = workspace.join("models/checkpoints/weights.bin");
    assert!(fs::symlink_metadata(&model_link)
        .expect("model link")
        .file_type()
        .is_symlink());
    assert_eq!(fs::read(&model_link).expect("model bytes"), b"weights");

    // Marker and venv present, model paths config generated.
    assert!(workspace.join(".env_marker").is_file());
    assert!(workspace.join(".venv/bin/python").is_file());
    let paths_doc =
        fs::read_to_string(workspace.join("extra_model_paths.yaml")).expect("paths config");
    assert!(paths_doc.contains("checkpoints:"));

    // Warm re-run is a no-op.
    let assert = vx(temp.path(), &cache)
        .args(["--json", "realize", "e2e", "--target"])
        .arg(&workspace)
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let body: serde_json::Value = serde_json::from_str(&stdout).expect("json envelope");
    assert_eq!(body["details"]["short_circuited"], true);

    // Offline warm re-run also succeeds (everything cached).
    vx(temp.path(), &cache)
        .args(["--offline", "realize", "e2e", "--target"])
        .arg(&workspace)
        .assert()
        .success();

    // Delete tears down the workspace and lock but never the cache.
    vx(temp.path(), &cache)
        .args(["delete", "e2e", "--target"])
        .arg(&workspace)
        .assert()
        .success();
    assert!(!workspace.exists());
    assert!(!cache.join("resolved/e2e.lock").exists());
    assert!(entry.exists(), "cache entry must survive delete");
}

#[test]
fn dry_run_realize_changes_nothing() {
    if find_git().is_none() {
        eprintln!("skipping dry-run test (git not found)");
        return;
    }
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = temp.path().join("cache");
    let (repo, _commit) = init_engine_repo(temp.path(), &[("main.py", "pass\n")]);

    vx(temp.path(), &cache)
        .args(["create", "dry", "--engine"])
        .arg(&repo)
        .assert()
        .success();

    let workspace = temp.path().join("ws");
    let assert = vx(temp.path(), &cache)
        .args(["realize", "dry", "--dry-run", "--target"])
        .arg(&workspace)
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(stdout.contains("version_id:  dry"));
    assert!(!workspace.exists());
    assert!(!cache.join("sources").exists());
}

#[test]
fn checksum_mismatch_fails_with_integrity_and_corrected_checksum_recovers() {
    if find_git().is_none() || find_python().is_none() {
        eprintln!("skipping checksum test (git or python not found)");
        return;
    }
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = temp.path().join("cache");
    let (repo, _commit) = init_engine_repo(temp.path(), &[("main.py", "pass\n")]);

    let model_file = temp.path().join("checkpoints").join("weights.bin");
    fs::create_dir_all(model_file.parent().expect("parent")).expect("dir");
    fs::write(&model_file, b"real bytes").expect("model");

    let bad = format!(
        r#"{{"source": "{}", "target_subdir": "checkpoints", "checksum": "sha256:{}"}}"#,
        model_file.display(),
        "f".repeat(64)
    );
    vx(temp.path(), &cache)
        .args(["create", "sum", "--engine"])
        .arg(&repo)
        .arg("--model")
        .arg(&bad)
        .assert()
        .success();

    let workspace = temp.path().join("ws");
    let assert = vx(temp.path(), &cache)
        .args(["realize", "sum", "--target"])
        .arg(&workspace)
        .assert()
        .code(6);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("[integrity]"), "stderr was: {stderr}");
    // The mismatching blob must not be published under the declared key.
    assert!(!cache
        .join("models/sha256")
        .join("ff")
        .join("f".repeat(64))
        .join("blob")
        .exists());

    // Correct the checksum via --auto-checksum and retry.
    vx(temp.path(), &cache)
        .args(["create", "sum", "--force", "--engine"])
        .arg(&repo)
        .arg("--model")
        .arg(format!(
            r#"{{"source": "{}", "target_subdir": "checkpoints", "name": "weights.bin"}}"#,
            model_file.display()
        ))
        .args(["--auto-checksum", "--models-root"])
        .arg(temp.path())
        .assert()
        .success();
    let spec = fs::read_to_string(temp.path().join("versions/sum.json")).expect("spec");
    assert!(spec.contains("sha256:"), "auto checksum missing: {spec}");

    vx(temp.path(), &cache)
        .args(["realize", "sum", "--target"])
        .arg(&workspace)
        .assert()
        .success();
}
