//! Embedded test annotations
//!
//! Source files declare their own tests inside comments:
//!
//! ```c
//! /*
//!  * !theo
//!  * configuration:
//!  *   setup: make standalone
//!  *
//!  * tests:
//!  *   - name: TwoPrimes
//!  *     run: ./standalone 23 91
//!  *     output: 1
//!  * !theo
//!  */
//! ```
//!
//! [`Scanner`] finds the blocks, [`parse_specification`] validates them into
//! [`Specification`]s ready for execution.

pub mod comment;
pub mod error;
pub mod parser;
pub mod scanner;
pub mod types;

pub use comment::{CommentStyle, CommentStyles};
pub use error::{ParseError, ParseResult, ScanError, ScanResult};
pub use parser::parse_specification;
pub use scanner::{Blocks, Scanner, DEFAULT_MARKER};
pub use types::{normalize_output, AnnotationBlock, Configuration, Specification, TestCase};

pub mod prelude {
    pub use crate::comment::*;
    pub use crate::error::*;
    pub use crate::parser::*;
    pub use crate::scanner::*;
    pub use crate::types::*;
}
