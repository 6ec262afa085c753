use std::path::Path;
use std::process::{Command, Output};

fn theo(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_theo"))
        .args(args)
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn write(dir: &Path, name: &str, text: &str) {
    std::fs::write(dir.join(name), text).unwrap();
}

const PASSING: &str = "// !theo\n// tests:\n//   - name: Seven\n//     run: echo 7\n//     output: 7\n// !theo\n";
const FAILING: &str = "// !theo\n// tests:\n//   - name: Eight\n//     run: echo 8\n//     output: 9\n// !theo\n";

#[test]
fn test_cli_all_clear_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "gcd.c", PASSING);

    let output = theo(dir.path(), &["--no-color", "gcd.c"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(0), "stdout: {}", stdout);
    assert!(stdout.contains("┌ Starting gcd.c:1"));
    assert!(stdout.contains("All clear!"));
}

#[test]
fn test_cli_file_without_block_does_not_fail_run() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "gcd.c", PASSING);
    write(dir.path(), "util.c", "int util(void) { return 0; }\n");

    let output = theo(dir.path(), &["--no-color", "gcd.c", "util.c"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(0), "stdout: {}", stdout);
    assert!(!stdout.contains("util.c"));
    assert!(stdout.contains("All clear!"));
}

#[test]
fn test_cli_unchecked_memory_is_not_reported_ok() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "gcd.c",
        "// !theo\n// configuration:\n//   valgrind: true\n// tests:\n//   - name: Seven\n//     run: echo 7\n//     output: 7\n// !theo\n",
    );
    write(dir.path(), "theo.toml", "[memcheck]\ntool = \"theo-missing-memory-checker\"\n");

    let output = theo(dir.path(), &["--no-color", "--no-memory-check", "gcd.c"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(0), "stdout: {}", stdout);
    assert!(stdout.contains("memory ----"));
    assert!(!stdout.contains("memory OK"));
}

#[test]
fn test_cli_failure_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "gcd.c", PASSING);
    write(dir.path(), "lcm.c", FAILING);

    let output = theo(dir.path(), &["--no-color"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(1), "stdout: {}", stdout);
    assert!(stdout.contains("Failed 1 tests of 2"));
    assert!(stdout.contains("Expected output \"9\" but found \"8\""));
}

#[test]
fn test_cli_malformed_exits_two() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "gcd.c", PASSING);
    write(dir.path(), "open.c", "// !theo\n// tests:\n");

    let output = theo(dir.path(), &["--no-color", "."]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(2), "stdout: {}", stdout);
    assert!(stdout.contains("unterminated"));
    // The valid file still ran.
    assert!(stdout.contains("Seven"));
}

#[test]
fn test_cli_json_format() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "lcm.c", FAILING);

    let output = theo(dir.path(), &["--format", "json", "lcm.c"]);
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert_eq!(summary["tally"]["failed"], 1);
    assert_eq!(summary["reports"][0]["results"][0]["test"]["name"], "Eight");
}

#[test]
fn test_cli_reads_config_file() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "gcd.c", PASSING);
    write(dir.path(), "theo.toml", "format = \"events\"\n");

    let output = theo(dir.path(), &["gcd.c"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(0));
    assert!(stdout.lines().all(|l| l.starts_with('{')));
    assert!(stdout.lines().last().unwrap().contains("\"run_finished\""));
}

#[test]
fn test_cli_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "gcd.c", PASSING);

    let output = theo(dir.path(), &["--parallelism", "0", "gcd.c"]);

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Parallelism"));
}

#[test]
fn test_cli_help_describes_timeout_as_default() {
    let dir = tempfile::tempdir().unwrap();

    let output = theo(dir.path(), &["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(0));
    assert!(stdout.contains("Default per-test timeout in seconds"));
}
