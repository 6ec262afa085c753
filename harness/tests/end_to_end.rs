use annotation::Scanner;
use harness::{
    default_runner, discover, ErrorReason, HarnessConfig, Outcome, OutcomeClass, RunSummary,
    Scheduler, SetupOutcome, SystemRunner,
};
use serial_test::serial;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const SUITE: &str = r#"#!/bin/sh
# !theo
# configuration:
#   shell: true
#   setup: echo 'echo "$1"' > echo.sh
#   environment: GREETING=hello
#   volatile: scratch.txt
#
# tests:
#   - name: Seven
#     run: sh echo.sh 7
#     output: 7
#   - name: Eight
#     run: sh echo.sh 8
#     output: 9
#   - name: Greets
#     run: echo "$GREETING"
#     output: hello
#   - name: Exits
#     run: exit 3
#     output: ""
#     exit: 3
#   - name: Reads
#     run: cat
#     input: abc
#     output: abc
#   - name: Scratch
#     run: test ! -e scratch.txt && touch scratch.txt && echo fresh
#     output: fresh
# !theo
"#;

fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

async fn run(paths: &[PathBuf], config: HarnessConfig) -> RunSummary {
    let discovery = discover(paths, &Scanner::new());
    let runner = default_runner(&config);
    Scheduler::new(runner, config)
        .run(discovery, &CancellationToken::new())
        .await
}

fn outcome<'a>(summary: &'a RunSummary, name: &str) -> &'a Outcome {
    &summary
        .reports
        .iter()
        .flat_map(|r| &r.results)
        .find(|r| r.test.name == name)
        .unwrap()
        .outcome
}

#[tokio::test]
async fn test_real_processes_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "suite.sh", SUITE);

    let summary = run(&[path], HarnessConfig::default().with_timeout_secs(30)).await;

    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.reports[0].setup, SetupOutcome::Success);
    assert!(outcome(&summary, "Seven").is_pass());
    assert_eq!(outcome(&summary, "Eight").class(), OutcomeClass::Fail);
    assert!(outcome(&summary, "Greets").is_pass());
    assert!(outcome(&summary, "Exits").is_pass());
    assert!(outcome(&summary, "Reads").is_pass());
    assert!(outcome(&summary, "Scratch").is_pass());
    assert!(!dir.path().join("scratch.txt").exists());

    assert_eq!(summary.tally.total, 6);
    assert_eq!(summary.tally.passed, 5);
    assert_eq!(summary.tally.failed, 1);
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test]
async fn test_results_keep_declaration_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "suite.sh", SUITE);

    let summary = run(&[path], HarnessConfig::default()).await;

    let results = &summary.reports[0].results;
    let names: Vec<_> = results.iter().map(|r| r.test.name.as_str()).collect();
    assert_eq!(names, ["Seven", "Eight", "Greets", "Exits", "Reads", "Scratch"]);
    assert!(results
        .windows(2)
        .all(|pair| pair[0].started_at <= pair[1].started_at));
}

#[tokio::test]
async fn test_setup_failure_runs_no_tests() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "broken_setup.sh",
        "# !theo\n# configuration:\n#   setup: sh -c 'exit 2'\n# tests:\n#   - name: A\n#     run: touch ran.txt\n#     output: \"\"\n# !theo\n",
    );

    let summary = run(&[path], HarnessConfig::default()).await;

    assert!(summary.reports[0].setup.is_failed());
    assert_eq!(
        outcome(&summary, "A"),
        &Outcome::Error(ErrorReason::SetupFailed)
    );
    assert!(!dir.path().join("ran.txt").exists());
    assert_eq!(summary.tally.setup_failures, 1);
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test]
async fn test_missing_memory_checker_is_tool_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "leaky.c",
        "/*\n * !theo\n * configuration:\n *   setup: touch built.txt\n *   valgrind: true\n * tests:\n *   - name: A\n *     run: echo 7\n *     output: 7\n * !theo\n */\n",
    );
    let config = HarnessConfig::default().with_memcheck_tool("theo-missing-memory-checker");

    let summary = run(&[path.clone()], config.clone()).await;

    assert_eq!(
        outcome(&summary, "A"),
        &Outcome::Error(ErrorReason::ToolUnavailable {
            tool: "theo-missing-memory-checker".into()
        })
    );
    assert_eq!(summary.reports[0].setup, SetupOutcome::Skipped);
    assert!(!dir.path().join("built.txt").exists());
    assert_eq!(summary.exit_code(), 1);

    // Turning memory checking off at the harness level runs the tests plainly.
    let summary = run(&[path], config.with_memory_check(false)).await;
    assert!(outcome(&summary, "A").is_pass());
    assert!(dir.path().join("built.txt").exists());
    assert_eq!(summary.exit_code(), 0);
}

/// Stands in for valgrind: writes one leak to the XML report, then runs the program.
const FAKE_CHECKER: &str = r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    --xml-file=*) xml="${arg#--xml-file=}" ;;
  esac
done
while [ $# -gt 0 ]; do
  case "$1" in
    --*) shift ;;
    *) break ;;
  esac
done
cat > "$xml" <<'XML'
<?xml version="1.0"?>
<valgrindoutput>
  <tool>memcheck</tool>
  <error>
    <unique>0x0</unique>
    <kind>Leak_DefinitelyLost</kind>
    <xwhat><text>8 bytes in 1 blocks are definitely lost in loss record 1 of 1</text></xwhat>
    <stack><frame><fn>leak</fn><file>leaky.c</file><line>4</line></frame></stack>
  </error>
</valgrindoutput>
XML
exec "$@"
"#;

#[cfg(unix)]
#[tokio::test]
async fn test_memory_checker_wraps_real_process() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let checker = write(dir.path(), "fake-valgrind", FAKE_CHECKER);
    std::fs::set_permissions(&checker, std::fs::Permissions::from_mode(0o755)).unwrap();
    let path = write(
        dir.path(),
        "leaky.c",
        "/*\n * !theo\n * configuration:\n *   valgrind: true\n * tests:\n *   - name: Leaks\n *     run: echo 7\n *     output: 7\n * !theo\n */\n",
    );
    let config = HarnessConfig::default().with_memcheck_tool(checker.display().to_string());

    let summary = run(&[path], config).await;

    let result = &summary.reports[0].results[0];
    assert_eq!(result.outcome.class(), OutcomeClass::MemoryError);
    assert_eq!(result.actual_output, "7\n");
    let Outcome::MemoryError(report) = &result.outcome else {
        unreachable!()
    };
    assert_eq!(report.defects[0].kind, "Leak_DefinitelyLost");

    let saved = report.saved_to.clone().unwrap();
    assert_eq!(saved, dir.path().join("Leaks.valgrind"));
    assert!(std::fs::read_to_string(saved).unwrap().contains("<fn>leak</fn>"));
    assert_eq!(summary.tally.memory_errored, 1);
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test]
async fn test_malformed_block_exits_with_two() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a.py",
        "# !theo\n# tests:\n#   - name: A\n#     run: echo 1\n#     output: 1\n#   - name: A\n#     run: echo 2\n#     output: 2\n# !theo\n",
    );
    write(
        dir.path(),
        "b.py",
        "# !theo\n# tests:\n#   - name: B\n#     run: echo 1\n#     output: 2\n# !theo\n",
    );

    let summary = run(&[dir.path().to_path_buf()], HarnessConfig::default()).await;

    assert_eq!(summary.diagnostics.len(), 1);
    assert!(summary.diagnostics[0].message.contains("duplicate"));
    assert_eq!(summary.tally.failed, 1);
    assert_eq!(summary.exit_code(), 2);
}

#[cfg(unix)]
fn is_running(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if kill(Pid::from_raw(pid), None).is_err() {
        return false;
    }
    // An unreaped zombie still accepts signal 0.
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => !Path::new("/proc").exists(),
    }
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_timeout_kills_the_whole_process_group() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "hang.sh",
        "# !theo\n# configuration:\n#   shell: true\n# tests:\n#   - name: Hangs\n#     run: sleep 30 & echo $! > bg.pid; wait\n#     output: \"\"\n#     timeout: 1\n# !theo\n",
    );

    let started = Instant::now();
    let discovery = discover(&[path], &Scanner::new());
    let summary = Scheduler::new(Arc::new(SystemRunner::new()), HarnessConfig::default())
        .run(discovery, &CancellationToken::new())
        .await;

    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(
        outcome(&summary, "Hangs"),
        &Outcome::Error(ErrorReason::Timeout { timeout_ms: 1000 })
    );

    let pid: i32 = std::fs::read_to_string(dir.path().join("bg.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while is_running(pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!is_running(pid), "background child {} survived the timeout", pid);
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_cancellation_stops_running_tests() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "slow.sh",
        "# !theo\n# tests:\n#   - name: Slow\n#     run: sleep 30\n#     output: \"\"\n#   - name: Never\n#     run: echo 1\n#     output: 1\n# !theo\n",
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let discovery = discover(&[path], &Scanner::new());
    let summary = Scheduler::new(Arc::new(SystemRunner::new()), HarnessConfig::default())
        .run(discovery, &cancel)
        .await;

    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(summary.cancelled);
    assert_eq!(outcome(&summary, "Slow"), &Outcome::Error(ErrorReason::Cancelled));
    assert_eq!(outcome(&summary, "Never"), &Outcome::Error(ErrorReason::Cancelled));
}
