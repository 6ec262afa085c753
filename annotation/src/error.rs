use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while locating blocks in a file
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// A start marker with no matching end marker before end-of-file
    #[error("{}:{line}: unterminated !theo block (no closing marker before end of file)", path.display())]
    UnterminatedBlock { path: PathBuf, line: usize },
}

impl ScanError {
    pub fn path(&self) -> &std::path::Path {
        match self {
            ScanError::UnterminatedBlock { path, .. } => path,
        }
    }

    pub fn line(&self) -> usize {
        match self {
            ScanError::UnterminatedBlock { line, .. } => *line,
        }
    }
}

/// Errors raised while turning a block payload into a specification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{}:{line}: malformed specification: {reason}", path.display())]
    MalformedSpec {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

impl ParseError {
    pub fn malformed(path: impl Into<PathBuf>, line: usize, reason: impl Into<String>) -> Self {
        ParseError::MalformedSpec {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }

    pub fn line(&self) -> usize {
        match self {
            ParseError::MalformedSpec { line, .. } => *line,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ParseError::MalformedSpec { reason, .. } => reason,
        }
    }
}

pub type ScanResult<T> = Result<T, ScanError>;
pub type ParseResult<T> = Result<T, ParseError>;
