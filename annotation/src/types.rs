use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A delimited `!theo` region found in a source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationBlock {
    /// File the block was found in
    pub source_path: PathBuf,
    /// Payload with comment decoration stripped
    pub raw_text: String,
    /// 1-based line of the opening marker
    pub start_line: usize,
    /// 1-based line of the closing marker
    pub end_line: usize,
}

impl AnnotationBlock {
    /// Treat a whole file as a single block (used for plain `.theo` files).
    pub fn whole_file(source_path: impl Into<PathBuf>, text: &str) -> Self {
        Self {
            source_path: source_path.into(),
            raw_text: text.to_string(),
            start_line: 0,
            end_line: text.lines().count() + 1,
        }
    }

    /// Absolute file line for a 1-based line inside the payload.
    pub fn file_line(&self, payload_line: usize) -> usize {
        self.start_line + payload_line
    }
}

/// The `configuration` section of a block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Commands run once before any test; empty means no setup phase
    pub setup: Vec<String>,
    /// Run every test under the memory checker (`valgrind` key)
    pub memory_check: bool,
    /// Environment applied to every command of the block
    pub environment: Vec<(String, String)>,
    /// Paths removed before and after each test
    pub volatile: Vec<String>,
    /// Run commands through `sh -c` instead of splitting them into argv
    pub shell: bool,
    /// Per-test timeout override, in seconds
    pub timeout_secs: Option<u64>,
}

impl Configuration {
    pub fn has_setup(&self) -> bool {
        !self.setup.is_empty()
    }
}

/// One named entry of the `tests` list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub run: String,
    pub expected_output: String,
    /// Text piped to the command's stdin
    pub input: Option<String>,
    /// Exit code the command must return
    pub expected_exit: i32,
    pub timeout_secs: Option<u64>,
    /// Commands run right before this test
    pub setup: Vec<String>,
    pub environment: Vec<(String, String)>,
    /// 1-based line of the entry in its source file
    pub line: usize,
}

impl TestCase {
    pub fn new(name: impl Into<String>, run: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: run.into(),
            expected_output: output.into(),
            input: None,
            expected_exit: 0,
            timeout_secs: None,
            setup: Vec::new(),
            environment: Vec::new(),
            line: 0,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_expected_exit(mut self, code: i32) -> Self {
        self.expected_exit = code;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Does `actual` stdout satisfy this test's expected output?
    pub fn output_matches(&self, actual: &str) -> bool {
        normalize_output(&self.expected_output) == normalize_output(actual)
    }
}

/// A parsed block: configuration plus ordered, uniquely named tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specification {
    pub configuration: Configuration,
    pub tests: Vec<TestCase>,
    pub block: AnnotationBlock,
}

impl Specification {
    pub fn source_path(&self) -> &std::path::Path {
        &self.block.source_path
    }

    /// Human readable `file:line` label for the block.
    pub fn label(&self) -> String {
        format!("{}:{}", self.block.source_path.display(), self.block.start_line)
    }
}

/// Strip a single trailing newline (`\n` or `\r\n`).
///
/// Only one is removed, so `"7\n\n"` keeps its extra blank line and still
/// differs from `"7"`.
pub fn normalize_output(text: &str) -> &str {
    text.strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text)
}
