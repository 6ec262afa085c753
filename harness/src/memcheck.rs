//! Memory checking as a runner decorator
//!
//! [`MemcheckRunner`] wraps any [`ProcessRunner`]. Requests flagged with
//! `memory_check` are rewritten to run under valgrind with an XML report,
//! which is parsed and attached to the [`ProcessOutput`]; all other requests
//! pass straight through.

use crate::config::MemcheckConfig;
use crate::process::{ProcessOutput, ProcessRunner, RunRequest, RunnerError, RunnerResult};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One problem reported by the checker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDefect {
    /// Checker classification, e.g. `InvalidRead` or `Leak_DefinitelyLost`
    pub kind: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemcheckReport {
    pub tool: String,
    pub defects: Vec<MemoryDefect>,
    /// Copy of the full XML report, kept when defects were found
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_to: Option<PathBuf>,
}

impl MemcheckReport {
    pub fn is_clean(&self) -> bool {
        self.defects.is_empty()
    }

    /// Short `kind xN` digest for report lines.
    pub fn summary(&self) -> String {
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for defect in &self.defects {
            match counts.iter_mut().find(|(kind, _)| *kind == defect.kind) {
                Some((_, count)) => *count += 1,
                None => counts.push((&defect.kind, 1)),
            }
        }
        counts
            .iter()
            .map(|(kind, count)| format!("{} x{}", kind, count))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Runs flagged requests under valgrind
#[derive(Debug, Clone)]
pub struct MemcheckRunner<R> {
    inner: R,
    config: MemcheckConfig,
}

impl<R: ProcessRunner> MemcheckRunner<R> {
    pub fn new(inner: R, config: MemcheckConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    fn resolve_tool(&self) -> RunnerResult<PathBuf> {
        which::which(&self.config.tool).map_err(|e| {
            debug!(tool = %self.config.tool, error = %e, "memory checker lookup failed");
            RunnerError::ToolUnavailable {
                tool: self.config.tool.clone(),
            }
        })
    }

    fn checker_args(&self, xml_path: &Path) -> Vec<String> {
        let mut args = vec![
            "--xml=yes".to_string(),
            format!("--xml-file={}", xml_path.display()),
            "--leak-check=full".to_string(),
        ];
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    /// Rewrite `request` so the checker supervises the program under test.
    fn wrap(&self, request: &RunRequest, tool: &Path, xml_path: &Path) -> RunRequest {
        let mut wrapped = request.clone();
        let tool = tool.display().to_string();
        let args = self.checker_args(xml_path);

        wrapped.argv = match (request.shell, request.argv.get(2)) {
            // Let the shell resolve the command, then replace itself with the checker.
            (true, Some(command)) => {
                let prefix = shlex::try_join(
                    std::iter::once(tool.as_str()).chain(args.iter().map(String::as_str)),
                )
                .unwrap_or_else(|_| format!("{} {}", tool, args.join(" ")));
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("exec {} {}", prefix, command),
                ]
            }
            _ => std::iter::once(tool)
                .chain(args)
                .chain(request.argv.iter().cloned())
                .collect(),
        };
        wrapped.memory_check = false;
        wrapped
    }
}

#[async_trait]
impl<R: ProcessRunner> ProcessRunner for MemcheckRunner<R> {
    async fn run(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> RunnerResult<ProcessOutput> {
        if !request.memory_check {
            return self.inner.run(request, cancel).await;
        }

        let tool = self.resolve_tool()?;
        let xml_file = tempfile::Builder::new()
            .prefix("theo-memcheck-")
            .suffix(".xml")
            .tempfile()?;
        let wrapped = self.wrap(request, &tool, xml_file.path());

        let mut output = self.inner.run(&wrapped, cancel).await?;
        if output.timed_out || output.cancelled {
            return Ok(output);
        }

        let xml = tokio::fs::read_to_string(xml_file.path()).await?;
        let defects = parse_valgrind_xml(&xml).map_err(|message| {
            warn!(command = %request.display(), %message, "could not parse memory checker report");
            RunnerError::MemcheckReport { message }
        })?;
        debug!(
            command = %request.display(),
            defects = defects.len(),
            "memory check finished"
        );

        let saved_to = if defects.is_empty() {
            None
        } else {
            let destination = report_destination(request);
            match tokio::fs::copy(xml_file.path(), &destination).await {
                Ok(_) => Some(destination),
                Err(e) => {
                    warn!(path = %destination.display(), error = %e, "could not keep memory checker report");
                    None
                }
            }
        };

        output.memcheck = Some(MemcheckReport {
            tool: self.config.tool.clone(),
            defects,
            saved_to,
        });
        Ok(output)
    }

    fn memory_check_available(&self) -> RunnerResult<()> {
        self.resolve_tool().map(|_| ())
    }
}

/// `<label>.valgrind` next to where the command ran.
fn report_destination(request: &RunRequest) -> PathBuf {
    let stem: String = request
        .label
        .as_deref()
        .unwrap_or("memcheck")
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let file = format!("{}.valgrind", stem);
    match &request.cwd {
        Some(cwd) => cwd.join(file),
        None => PathBuf::from(file),
    }
}

/// Extract `/valgrindoutput/error` entries from a valgrind XML report.
pub fn parse_valgrind_xml(xml: &str) -> Result<Vec<MemoryDefect>, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut current: Option<MemoryDefect> = None;
    let mut defects = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                path.push(String::from_utf8_lossy(element.name().as_ref()).into_owned());
                if is_error_element(&path) {
                    current = Some(MemoryDefect::default());
                }
            }
            Ok(Event::End(_)) => {
                if is_error_element(&path) {
                    defects.extend(current.take());
                }
                path.pop();
            }
            Ok(Event::Text(text)) => {
                let Some(defect) = current.as_mut() else {
                    continue;
                };
                let text = text.unescape().map_err(|e| e.to_string())?;
                let inner: Vec<&str> = path.iter().skip(2).map(String::as_str).collect();
                match inner.as_slice() {
                    ["kind"] => defect.kind = text.into_owned(),
                    ["what"] | ["xwhat", "text"] if defect.description.is_empty() => {
                        defect.description = text.into_owned()
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(format!(
                    "invalid XML at byte {}: {}",
                    reader.buffer_position(),
                    e
                ))
            }
            _ => {}
        }
    }

    Ok(defects)
}

fn is_error_element(path: &[String]) -> bool {
    path.len() == 2 && path[0] == "valgrindoutput" && path[1] == "error"
}
