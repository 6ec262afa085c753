//! Turning a block payload into a [`Specification`]
//!
//! The payload is YAML with two top-level sections:
//!
//! ```yaml
//! configuration:
//!   setup: make standalone
//!   valgrind: true
//!
//! tests:
//!   - name: TwoPrimes
//!     run: ./standalone 23 91
//!     output: 1
//! ```
//!
//! Everything besides `tests[].name`, `tests[].run` and `tests[].output` is
//! optional. Unrecognized keys are rejected.

use crate::error::{ParseError, ParseResult};
use crate::types::{AnnotationBlock, Configuration, Specification, TestCase};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    configuration: Option<RawConfiguration>,
    tests: Option<Vec<RawTest>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfiguration {
    setup: Option<Value>,
    valgrind: Option<bool>,
    environment: Option<Value>,
    volatile: Option<Value>,
    shell: Option<bool>,
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTest {
    name: Option<Value>,
    run: Option<Value>,
    output: Option<Value>,
    input: Option<Value>,
    exit: Option<i32>,
    timeout: Option<u64>,
    setup: Option<Value>,
    environment: Option<Value>,
}

/// Parse the payload of `block` into a validated specification.
pub fn parse_specification(block: AnnotationBlock) -> ParseResult<Specification> {
    let context = BlockContext::new(&block);

    if block.raw_text.trim().is_empty() {
        return Err(context.error(0, "empty annotation block"));
    }

    let document: RawDocument = serde_yaml::from_str(&block.raw_text).map_err(|e| {
        let line = e.location().map(|l| l.line()).unwrap_or(0);
        context.error(line, format!("invalid YAML: {}", strip_location(&e)))
    })?;

    let configuration = parse_configuration(&context, document.configuration.unwrap_or_default())?;

    let raw_tests = document
        .tests
        .ok_or_else(|| context.error(0, "missing required section `tests`"))?;
    if raw_tests.is_empty() {
        return Err(context.error(
            context.tests_line,
            "`tests` must contain at least one entry",
        ));
    }

    let mut seen = HashSet::new();
    let mut tests = Vec::with_capacity(raw_tests.len());
    for (index, raw) in raw_tests.into_iter().enumerate() {
        let line = context.entry_line(index);
        let test = parse_test(&context, line, index, raw)?;
        if !seen.insert(test.name.clone()) {
            return Err(context.error(line, format!("duplicate test name `{}`", test.name)));
        }
        tests.push(test);
    }

    debug!(
        path = %block.source_path.display(),
        line = block.start_line,
        tests = tests.len(),
        "parsed specification"
    );

    Ok(Specification {
        configuration,
        tests,
        block,
    })
}

/// Source location bookkeeping for one block
struct BlockContext<'a> {
    block: &'a AnnotationBlock,
    tests_line: usize,
    entries: Vec<usize>,
}

impl<'a> BlockContext<'a> {
    fn new(block: &'a AnnotationBlock) -> Self {
        let (tests_line, entries) = locate_tests(&block.raw_text);
        Self {
            block,
            tests_line,
            entries,
        }
    }

    /// Payload line of the `index`th `tests` entry, best effort.
    fn entry_line(&self, index: usize) -> usize {
        self.entries.get(index).copied().unwrap_or(self.tests_line)
    }

    /// Build an error for a 1-based payload line (0 = the opening marker).
    fn error(&self, payload_line: usize, reason: impl Into<String>) -> ParseError {
        ParseError::malformed(
            self.block.source_path.clone(),
            self.block.file_line(payload_line),
            reason,
        )
    }
}

/// Find the `tests:` key and the first line of each list entry under it.
fn locate_tests(payload: &str) -> (usize, Vec<usize>) {
    let mut lines = payload.lines().enumerate();
    let Some((tests_line, tests_indent)) = lines.by_ref().find_map(|(index, line)| {
        let trimmed = line.trim_start();
        trimmed
            .starts_with("tests:")
            .then(|| (index + 1, line.len() - trimmed.len()))
    }) else {
        return (0, Vec::new());
    };

    let mut item_indent = None;
    let mut entries = Vec::new();
    for (index, line) in lines {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = line.len() - trimmed.len();
        let is_item = trimmed == "-" || trimmed.starts_with("- ");
        if !is_item && indent <= tests_indent {
            break;
        }
        if is_item {
            match item_indent {
                None => {
                    item_indent = Some(indent);
                    entries.push(index + 1);
                }
                Some(width) if width == indent => entries.push(index + 1),
                Some(_) => {}
            }
        }
    }
    (tests_line, entries)
}

fn parse_configuration(
    context: &BlockContext<'_>,
    raw: RawConfiguration,
) -> ParseResult<Configuration> {
    let line = 0;
    let setup = string_list(context, line, "configuration.setup", raw.setup)?
        .into_iter()
        .filter(|command| !command.trim().is_empty())
        .collect();
    let environment = parse_environment(
        context,
        line,
        string_list(context, line, "configuration.environment", raw.environment)?,
    )?;
    let volatile = string_list(context, line, "configuration.volatile", raw.volatile)?;
    if raw.timeout == Some(0) {
        return Err(context.error(line, "`configuration.timeout` must be greater than 0"));
    }

    Ok(Configuration {
        setup,
        memory_check: raw.valgrind.unwrap_or(false),
        environment,
        volatile,
        shell: raw.shell.unwrap_or(false),
        timeout_secs: raw.timeout,
    })
}

fn parse_test(
    context: &BlockContext<'_>,
    line: usize,
    index: usize,
    raw: RawTest,
) -> ParseResult<TestCase> {
    let label = format!("tests[{}]", index);
    let name = required(context, line, &label, "name", raw.name)?;
    if name.trim().is_empty() {
        return Err(context.error(line, format!("{}: empty `name` value", label)));
    }
    let label = format!("test `{}`", name);

    let run = required(context, line, &label, "run", raw.run)?;
    if run.trim().is_empty() {
        return Err(context.error(line, format!("{}: empty `run` value", label)));
    }
    let expected_output = required(context, line, &label, "output", raw.output)?;

    let input = match raw.input {
        Some(value) => scalar_text(&value)
            .map_err(|kind| context.error(line, format!("{}: `input` must be a scalar, found {}", label, kind)))?,
        None => None,
    };
    if raw.timeout == Some(0) {
        return Err(context.error(line, format!("{}: `timeout` must be greater than 0", label)));
    }

    let setup = string_list(context, line, &format!("{}.setup", label), raw.setup)?;
    let environment = parse_environment(
        context,
        line,
        string_list(context, line, &format!("{}.environment", label), raw.environment)?,
    )?;

    Ok(TestCase {
        name,
        run,
        expected_output,
        input,
        expected_exit: raw.exit.unwrap_or(0),
        timeout_secs: raw.timeout,
        setup,
        environment,
        line: context.block.file_line(line),
    })
}

fn required(
    context: &BlockContext<'_>,
    line: usize,
    label: &str,
    field: &str,
    value: Option<Value>,
) -> ParseResult<String> {
    let missing = || context.error(line, format!("{}: missing required field `{}`", label, field));
    let value = value.ok_or_else(missing)?;
    scalar_text(&value)
        .map_err(|kind| {
            context.error(
                line,
                format!("{}: `{}` must be a scalar, found {}", label, field, kind),
            )
        })?
        .ok_or_else(missing)
}

/// Literal text of a YAML scalar; `Ok(None)` for null.
fn scalar_text(value: &Value) -> Result<Option<String>, &'static str> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Sequence(_) => Err("a list"),
        Value::Mapping(_) => Err("a mapping"),
        Value::Tagged(tagged) => scalar_text(&tagged.value),
    }
}

/// A key accepting either one string or a list of strings.
fn string_list(
    context: &BlockContext<'_>,
    line: usize,
    label: &str,
    value: Option<Value>,
) -> ParseResult<Vec<String>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let invalid = |kind: &str| {
        context.error(
            line,
            format!("`{}` must be a string or a list of strings, found {}", label, kind),
        )
    };
    match value {
        Value::Sequence(items) => items
            .iter()
            .filter_map(|item| scalar_text(item).transpose())
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid),
        other => Ok(scalar_text(&other).map_err(invalid)?.into_iter().collect()),
    }
}

fn parse_environment(
    context: &BlockContext<'_>,
    line: usize,
    pairs: Vec<String>,
) -> ParseResult<Vec<(String, String)>> {
    pairs
        .into_iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(context.error(
                line,
                format!("environment entry `{}` is not of the form KEY=VALUE", pair),
            )),
        })
        .collect()
}

/// serde_yaml appends "at line X column Y"; the file line is reported separately.
fn strip_location(error: &serde_yaml::Error) -> String {
    let message = error.to_string();
    match message.find(" at line ") {
        Some(at) => message[..at].to_string(),
        None => message,
    }
}
