#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;

use assert_cmd::Command;

/// A `vx` invocation rooted at `specs_root` with an isolated cache.
pub fn vx(specs_root: &Path, cache_root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("vx").expect("vx binary");
    cmd.current_dir(specs_root)
        .env_remove("OFFLINE")
        .env_remove("ENGINE_HOME")
        .env_remove("MODELS_DIR")
        .env_remove("OUTPUT_MODE")
        .env("CACHE_ROOT", cache_root);
    cmd
}

pub fn find_git() -> Option<PathBuf> {
    which("git")
}

pub fn find_python() -> Option<PathBuf> {
    which("python3").or_else(|| which("python"))
}

fn which(name: &str) -> Option<PathBuf> {
    let output = StdCommand::new("which").arg(name).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

/// Initialize a local engine repository with the given files committed on
/// `main`; returns the repo path and the commit hash.
pub fn init_engine_repo(dir: &Path, files: &[(&str, &str)]) -> (PathBuf, String) {
    let repo = dir.join("engine-repo");
    fs::create_dir_all(&repo).expect("repo dir");
    git(&repo, &["-c", "init.defaultBranch=main", "init", "--quiet"]);
    for (name, contents) in files {
        let path = repo.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("parent");
        }
        fs::write(&path, contents).expect("file");
    }
    git(&repo, &["add", "."]);
    git(
        &repo,
        &[
            "-c",
            "user.email=test@example.com",
            "-c",
            "user.name=test",
            "commit",
            "--quiet",
            "-m",
            "initial",
        ],
    );
    let output = StdCommand::new("git")
        .current_dir(&repo)
        .args(["rev-parse", "HEAD"])
        .output()
        .expect("rev-parse");
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (repo, commit)
}

fn git(repo: &Path, args: &[&str]) {
    let status = StdCommand::new("git")
        .current_dir(repo)
        .args(args)
        .status()
        .expect("git");
    assert!(status.success(), "git {args:?} failed in {}", repo.display());
}

/// A stub engine entrypoint speaking just enough of the local HTTP API for
/// the handler: readiness endpoints, prompt submission (which writes the
/// received graph as the artifact), and history polling.
pub const STUB_ENGINE_MAIN: &str = r#"#!/usr/bin/env python3
import argparse
import json
import pathlib
from http.server import BaseHTTPRequestHandler, HTTPServer

parser = argparse.ArgumentParser()
parser.add_argument("--listen", default="127.0.0.1")
parser.add_argument("--port", type=int, default=8188)
parser.add_argument("--disable-auto-launch", action="store_true")
parser.add_argument("--output-directory", default="output")
parser.add_argument("--input-directory", default="input")
parser.add_argument("--extra-model-paths-config", default=None)
args = parser.parse_args()

out_dir = pathlib.Path(args.output_directory)


class Handler(BaseHTTPRequestHandler):
    def log_message(self, *_args):
        pass

    def _json(self, payload):
        body = json.dumps(payload).encode("utf-8")
        self.send_response(200)
        self.send_header("Content-Type", "application/json")
        self.end_headers()
        self.wfile.write(body)

    def do_GET(self):
        if self.path in ("/", "/queue"):
            self.send_response(200)
            self.end_headers()
            self.wfile.write(b"ok")
            return
        if self.path.startswith("/history/"):
            prompt_id = self.path.rsplit("/", 1)[1]
            self._json({
                prompt_id: {
                    "status": {"status_str": "success"},
                    "outputs": {"9": {"images": [{"filename": "result.json"}]}},
                }
            })
            return
        self.send_response(404)
        self.end_headers()

    def do_POST(self):
        if self.path == "/prompt":
            length = int(self.headers.get("Content-Length", 0))
            payload = json.loads(self.rfile.read(length) or b"{}")
            out_dir.mkdir(parents=True, exist_ok=True)
            (out_dir / "result.json").write_text(json.dumps(payload.get("prompt", {})))
            self._json({"prompt_id": "p1"})
            return
        self.send_response(404)
        self.end_headers()


HTTPServer((args.listen, args.port), Handler).serve_forever()
"#;
