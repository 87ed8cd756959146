/// Drives the compiled `url-kitchen` binary over small temp projects.
///
/// `CARGO_BIN_EXE_url-kitchen` is set by Cargo during `cargo test` to the binary of the
/// current profile.
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_url-kitchen"))
}

/// Run a command and assert it exits successfully. Returns stdout.
fn run_success(args: &[&str]) -> String {
    let out = Command::new(binary())
        .args(args)
        .output()
        .expect("failed to invoke url-kitchen binary");
    let stdout = String::from_utf8_lossy(&out.stdout).to_string();
    let stderr = String::from_utf8_lossy(&out.stderr).to_string();
    assert!(
        out.status.success(),
        "command {:?} failed with status {:?}\nstdout: {}\nstderr: {}",
        args,
        out.status,
        stdout,
        stderr
    );
    stdout
}

/// Run a command and assert it exits with a non-zero status. Returns stderr.
fn run_failure(args: &[&str]) -> String {
    let out = Command::new(binary())
        .args(args)
        .output()
        .expect("failed to invoke url-kitchen binary");
    let stderr = String::from_utf8_lossy(&out.stderr).to_string();
    assert!(
        !out.status.success(),
        "command {:?} expected to fail but exited successfully\nstderr: {}",
        args,
        stderr
    );
    stderr
}

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(
        src.join("index.html"),
        r#"<html>
<head><link rel="stylesheet" href="./main.css" /></head>
<body><script type="module" src="./main.js"></script></body>
</html>"#,
    )
    .unwrap();
    fs::write(src.join("main.css"), "body { background: url(./bg.png); }\n").unwrap();
    fs::write(src.join("bg.png"), [0x89, 0x50, 0x4e, 0x47]).unwrap();
    fs::write(src.join("main.js"), "import { x } from './dep.js';\nconsole.log(x);\n").unwrap();
    fs::write(src.join("dep.js"), "export const x = 1;\n").unwrap();
    dir
}

fn path_arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

// ---------------------------------------------------------------------------
// build
// ---------------------------------------------------------------------------

#[test]
fn test_build_writes_versioned_files() {
    let dir = project();
    let stdout = run_success(&["build", path_arg(dir.path())]);
    let listed: Vec<&str> = stdout.lines().collect();
    assert_eq!(listed.first(), Some(&"index.html"), "pages first: {stdout}");
    assert_eq!(listed.len(), 5, "index, css, png, two js files: {stdout}");

    let dist = dir.path().join("dist");
    let html = fs::read_to_string(dist.join("index.html")).unwrap();
    assert!(html.contains("<script type=\"importmap\">"), "static js imports go through the importmap: {html}");
    for path in &listed {
        assert!(dist.join(path).is_file(), "{path} written");
    }
}

#[test]
fn test_build_json_manifest_and_config_file() {
    let dir = project();
    fs::write(
        dir.path().join("url-kitchen.toml"),
        "build_directory = \"public\"\nversioning_method = \"search_param\"\n",
    )
    .unwrap();
    let stdout = run_success(&["build", path_arg(dir.path()), "--json"]);
    let manifest: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let css = manifest["assets/css/main.css"].as_str().unwrap();
    assert!(css.starts_with("assets/css/main.css?v="), "got {css}");
    assert!(dir.path().join("public/assets/css/main.css").is_file());
}

#[test]
fn test_build_without_versioning() {
    let dir = project();
    let stdout = run_success(&["build", path_arg(dir.path()), "--no-versioning", "--json"]);
    assert_eq!(stdout.trim(), "{}");
    let html = fs::read_to_string(dir.path().join("dist/index.html")).unwrap();
    assert!(html.contains("href=\"/assets/css/main.css\""), "{html}");
}

#[test]
fn test_build_missing_entry_fails() {
    let dir = project();
    let stderr = run_failure(&["build", path_arg(dir.path()), "--entry", "./missing.html"]);
    assert!(stderr.contains("missing.html"), "error names the file: {stderr}");
}

// ---------------------------------------------------------------------------
// graph
// ---------------------------------------------------------------------------

#[test]
fn test_graph_text_lists_urls_and_references() {
    let dir = project();
    let stdout = run_success(&["graph", path_arg(dir.path())]);
    assert!(stdout.contains("index.html (html)\n"), "{stdout}");
    assert!(stdout.contains("  -> main.css ["), "{stdout}");
    assert!(stdout.contains("main.js (js_module)\n  -> dep.js ["), "{stdout}");
}

#[test]
fn test_graph_dot_format() {
    let dir = project();
    let stdout = run_success(&["graph", path_arg(dir.path()), "--format", "dot"]);
    assert!(stdout.starts_with("digraph url_graph {"), "{stdout}");
    assert!(stdout.trim_end().ends_with('}'));
}
