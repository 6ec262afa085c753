//! Locating `!theo` blocks inside arbitrary text files

use crate::comment::{CommentStyle, CommentStyles};
use crate::error::{ScanError, ScanResult};
use crate::types::AnnotationBlock;
use std::iter::{Enumerate, FusedIterator};
use std::path::Path;
use std::str::Lines;
use tracing::debug;

/// Marker token opening and closing every block
pub const DEFAULT_MARKER: &str = "!theo";

/// Finds annotation blocks in file contents
#[derive(Debug, Clone)]
pub struct Scanner {
    marker: String,
    styles: CommentStyles,
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
            styles: CommentStyles::default(),
        }
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    pub fn with_styles(mut self, styles: CommentStyles) -> Self {
        self.styles = styles;
        self
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Lazily yield the blocks of `text` in file order.
    ///
    /// The iterator stops after the first [`ScanError`].
    pub fn scan<'a>(&'a self, path: &'a Path, text: &'a str) -> Blocks<'a> {
        Blocks {
            scanner: self,
            path,
            lines: text.lines().enumerate(),
            done: false,
        }
    }

    /// Whether `text` contains at least one opening marker line.
    pub fn has_marker(&self, text: &str) -> bool {
        text.lines()
            .any(|line| self.styles.detect(line, &self.marker).is_some())
    }

    fn is_marker_line(&self, line: &str, style: &CommentStyle) -> bool {
        style.marker_content(line) == self.marker || self.styles.detect(line, &self.marker).is_some()
    }
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the blocks of one file, see [`Scanner::scan`]
pub struct Blocks<'a> {
    scanner: &'a Scanner,
    path: &'a Path,
    lines: Enumerate<Lines<'a>>,
    done: bool,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = ScanResult<AnnotationBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let scanner = self.scanner;

        let (start_index, style) = loop {
            let Some((index, line)) = self.lines.next() else {
                self.done = true;
                return None;
            };
            if let Some(style) = scanner.styles.detect(line, &scanner.marker) {
                break (index, style);
            }
        };

        let mut payload = Vec::new();
        for (index, line) in self.lines.by_ref() {
            if scanner.is_marker_line(line, style) {
                debug!(
                    path = %self.path.display(),
                    start_line = start_index + 1,
                    end_line = index + 1,
                    style = %style.name,
                    "found annotation block"
                );
                return Some(Ok(AnnotationBlock {
                    source_path: self.path.to_path_buf(),
                    raw_text: dedent(&payload),
                    start_line: start_index + 1,
                    end_line: index + 1,
                }));
            }
            payload.push(style.strip_payload_line(line));
        }

        self.done = true;
        Some(Err(ScanError::UnterminatedBlock {
            path: self.path.to_path_buf(),
            line: start_index + 1,
        }))
    }
}

impl FusedIterator for Blocks<'_> {}

fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Join payload lines, removing the indentation they all share.
fn dedent(lines: &[&str]) -> String {
    let common = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| indent_width(line))
        .min()
        .unwrap_or(0);

    let mut text = String::new();
    for line in lines {
        if line.trim().is_empty() {
            text.push('\n');
        } else {
            text.push_str(line.get(common..).unwrap_or(line.trim_start()).trim_end());
            text.push('\n');
        }
    }
    text
}
