//! Finding annotated files and turning their blocks into specifications

use crate::report::Diagnostic;
use annotation::{parse_specification, AnnotationBlock, Scanner, Specification};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Extension of files that are a specification from top to bottom
pub const SPEC_FILE_EXTENSION: &str = "theo";

/// Directories never descended into
const SKIPPED_DIRS: &[&str] = &["target", "node_modules"];

/// A file to scan; `explicit` files were named on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub explicit: bool,
}

/// Specifications and diagnostics sharing one discovery index sequence
#[derive(Debug, Default)]
pub struct Discovery {
    pub specifications: Vec<(usize, Arc<Specification>)>,
    pub diagnostics: Vec<(usize, Diagnostic)>,
    pub files_scanned: usize,
    next_index: usize,
}

impl Discovery {
    fn push_specification(&mut self, specification: Specification) {
        self.specifications
            .push((self.next_index, Arc::new(specification)));
        self.next_index += 1;
    }

    fn push_diagnostic(&mut self, diagnostic: Diagnostic) {
        warn!("{}", diagnostic);
        self.diagnostics.push((self.next_index, diagnostic));
        self.next_index += 1;
    }

    pub fn test_count(&self) -> usize {
        self.specifications.iter().map(|(_, s)| s.tests.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.specifications.is_empty() && self.diagnostics.is_empty()
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || (entry.file_type().is_dir() && SKIPPED_DIRS.contains(&name.as_ref()))
}

fn has_glob_meta(input: &str) -> bool {
    input.contains(['*', '?', '['])
}

/// Expand command line inputs into files, in a stable order.
///
/// Directories are walked recursively (sorted, hidden entries skipped),
/// glob patterns are expanded, and plain paths are taken as given.
pub fn expand_inputs(inputs: &[PathBuf], discovery: &mut Discovery) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    let mut add = |path: PathBuf, explicit: bool| {
        if seen.insert(path.clone()) {
            candidates.push(Candidate { path, explicit });
        }
    };

    for input in inputs {
        if input.is_dir() {
            let walker = WalkDir::new(input)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !is_skipped(e));
            for entry in walker {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => add(entry.into_path(), false),
                    Ok(_) => {}
                    Err(e) => {
                        let path = e.path().unwrap_or(input.as_path()).to_path_buf();
                        discovery.push_diagnostic(Diagnostic::read(path, e.to_string()));
                    }
                }
            }
        } else if input.exists() {
            add(input.clone(), true);
        } else if has_glob_meta(&input.to_string_lossy()) {
            let pattern = input.to_string_lossy();
            match glob::glob(&pattern) {
                Ok(paths) => {
                    let mut matched: Vec<PathBuf> = paths.filter_map(Result::ok).filter(|p| p.is_file()).collect();
                    matched.sort();
                    if matched.is_empty() {
                        discovery.push_diagnostic(Diagnostic::read(input, "pattern matched no files"));
                    }
                    for path in matched {
                        add(path, false);
                    }
                }
                Err(e) => {
                    discovery.push_diagnostic(Diagnostic::read(input, format!("invalid pattern: {}", e)));
                }
            }
        } else {
            discovery.push_diagnostic(Diagnostic::read(input, "no such file or directory"));
        }
    }
    candidates
}

/// Scan and parse every block of one file.
pub fn discover_file(scanner: &Scanner, candidate: &Candidate, discovery: &mut Discovery) {
    let path = &candidate.path;
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::InvalidData && !candidate.explicit => {
            debug!("Skipping non-UTF-8 file {}", path.display());
            return;
        }
        Err(e) => {
            discovery.push_diagnostic(Diagnostic::read(path, e.to_string()));
            return;
        }
    };
    discovery.files_scanned += 1;

    if !scanner.has_marker(&text) {
        if path.extension().is_some_and(|ext| ext == SPEC_FILE_EXTENSION) {
            push_parsed(AnnotationBlock::whole_file(path, &text), discovery);
        } else if candidate.explicit {
            info!("Skipping {}: no {} block found", path.display(), scanner.marker());
        }
        return;
    }

    for block in scanner.scan(path, &text) {
        match block {
            Ok(block) => push_parsed(block, discovery),
            Err(e) => discovery.push_diagnostic(e.into()),
        }
    }
}

fn push_parsed(block: AnnotationBlock, discovery: &mut Discovery) {
    match parse_specification(block) {
        Ok(specification) => {
            debug!(
                "Found {} with {} tests",
                specification.label(),
                specification.tests.len()
            );
            discovery.push_specification(specification);
        }
        Err(e) => discovery.push_diagnostic(e.into()),
    }
}

/// Collect every specification reachable from `inputs`.
pub fn discover(inputs: &[PathBuf], scanner: &Scanner) -> Discovery {
    let mut discovery = Discovery::default();
    let candidates = expand_inputs(inputs, &mut discovery);
    for candidate in &candidates {
        discover_file(scanner, candidate, &mut discovery);
    }
    debug!(
        "Discovered {} specifications ({} tests) in {} files",
        discovery.specifications.len(),
        discovery.test_count(),
        discovery.files_scanned
    );
    discovery
}

/// Convenience for a single path.
pub fn discover_path(path: &Path) -> Discovery {
    discover(&[path.to_path_buf()], &Scanner::new())
}
