use annotation::prelude::*;
use std::path::{Path, PathBuf};

fn fixture(name: &str) -> (PathBuf, String) {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    let text = std::fs::read_to_string(&path).unwrap();
    (path, text)
}

fn specifications(name: &str) -> Vec<Specification> {
    let (path, text) = fixture(name);
    let scanner = Scanner::new();
    scanner
        .scan(&path, &text)
        .map(|block| parse_specification(block.unwrap()).unwrap())
        .collect()
}

#[test]
fn test_standalone_c_round_trips_every_field() {
    let specs = specifications("standalone.c");
    assert_eq!(specs.len(), 1);
    let spec = &specs[0];

    assert_eq!(spec.configuration.setup, vec!["make standalone"]);
    assert!(spec.configuration.memory_check);

    let expected = [
        ("ANumberandItself", "./standalone 7 7", "7"),
        ("TwoBigNumbers", "./standalone 1394 2414", "34"),
        ("TwoHugeIntegers", "./standalone 290272158 608635170", "9363618"),
        ("TwoPrimes", "./standalone 23 91", "1"),
        ("Zero", "./standalone 0 0", "0"),
        ("SecondZero", "./standalone 125 0", "125"),
        ("FirstZero", "./standalone 0 125", "125"),
        ("FirstOne", "./standalone 1 99", "1"),
        ("SecondOne", "./standalone 99 1", "1"),
    ];
    let actual: Vec<_> = spec
        .tests
        .iter()
        .map(|t| (t.name.as_str(), t.run.as_str(), t.expected_output.as_str()))
        .collect();
    assert_eq!(actual, expected);

    // Each entry points at its `- name:` line in the file.
    let (_, text) = fixture("standalone.c");
    let lines: Vec<_> = text.lines().collect();
    for test in &spec.tests {
        assert!(lines[test.line - 1].contains(&format!("name: {}", test.name)));
    }
}

#[test]
fn test_python_file_with_two_comment_styles() {
    let specs = specifications("multi.py");
    assert_eq!(specs.len(), 2);

    assert_eq!(specs[0].configuration.setup.len(), 1);
    assert_eq!(specs[0].tests[0].name, "Greets");

    let names: Vec<_> = specs[1].tests.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["Shouts", "Quiet"]);
    assert_eq!(specs[1].tests[1].expected_output, "");
    assert!(specs[0].block.start_line < specs[1].block.start_line);
}

#[test]
fn test_unterminated_block_after_valid_one() {
    let (path, text) = fixture("broken.sh");
    let scanner = Scanner::new();
    let results: Vec<_> = scanner.scan(&path, &text).collect();

    assert_eq!(results.len(), 2);
    let spec = parse_specification(results[0].clone().unwrap()).unwrap();
    assert_eq!(spec.tests[0].name, "A");
    match &results[1] {
        Err(ScanError::UnterminatedBlock { line, .. }) => assert_eq!(*line, 9),
        other => panic!("expected unterminated block, got {:?}", other),
    }
}

#[test]
fn test_whole_file_block_for_plain_spec_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("suite.theo");
    let text = "tests:\n  - name: A\n    run: echo 7\n    output: 7\n";
    std::fs::write(&path, text).unwrap();

    assert!(!Scanner::new().has_marker(text));
    let spec = parse_specification(AnnotationBlock::whole_file(&path, text)).unwrap();
    assert_eq!(spec.tests[0].line, 2);
}
