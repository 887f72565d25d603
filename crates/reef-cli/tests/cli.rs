use std::path::Path;
use std::process::Command;

fn run_reef(args: &[&str]) -> std::process::Output {
    let exe = env!("CARGO_BIN_EXE_reef");
    Command::new(exe).args(args).output().expect("run reef")
}

fn write_bytes(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dir");
    }
    std::fs::write(path, bytes).expect("write file");
}

#[test]
fn serves_a_script_from_a_host_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_bytes(&dir.path().join("index.php"), b"Hi");

    let out = run_reef(&[dir.path().to_str().unwrap(), "/index.php"]);
    assert_eq!(
        out.status.code(),
        Some(0),
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("HTTP 200"), "stdout:\n{stdout}");
    assert!(stdout.ends_with("\nHi"), "stdout:\n{stdout}");
}

#[test]
fn missing_static_files_report_the_fallback_marker() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_bytes(&dir.path().join("index.php"), b"unused");

    let out = run_reef(&[dir.path().to_str().unwrap(), "/missing.png"]);
    assert_eq!(out.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("HTTP 404"), "stdout:\n{stdout}");
    assert!(stdout.contains("x-file-type: static"), "stdout:\n{stdout}");
}

#[test]
fn static_assets_are_served_with_their_content_type() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_bytes(&dir.path().join("assets/app.css"), b"body{}");

    let out = run_reef(&[dir.path().to_str().unwrap(), "/assets/app.css"]);
    assert_eq!(out.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("HTTP 200"), "stdout:\n{stdout}");
    assert!(stdout.contains("content-type: text/css"), "stdout:\n{stdout}");
}
