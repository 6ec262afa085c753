//! Comment decoration handling
//!
//! Annotation blocks live inside whatever comment syntax the host file uses.
//! Rather than hard-coding one language, each syntax is described as a
//! [`CommentStyle`] (opener, per-line continuation, closer) and the scanner
//! strips decoration with whichever style matched the opening marker.

/// How one family of comments decorates its lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentStyle {
    /// Short identifier, used in logs
    pub name: String,
    /// Token that starts the comment (`//`, `/*`, `#`); empty for bare text
    pub opener: String,
    /// Token repeated at the start of inner lines (`*` inside `/* */`)
    pub continuation: Option<String>,
    /// Token that ends the comment (`*/`, `-->`)
    pub closer: Option<String>,
}

impl CommentStyle {
    /// A single-line comment style where every line repeats the opener.
    pub fn line(name: impl Into<String>, token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            name: name.into(),
            opener: token.clone(),
            continuation: Some(token),
            closer: None,
        }
    }

    /// A block comment style.
    pub fn block(
        name: impl Into<String>,
        opener: impl Into<String>,
        continuation: Option<&str>,
        closer: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            opener: opener.into(),
            continuation: continuation.map(str::to_string),
            closer: Some(closer.into()),
        }
    }

    /// Undecorated text (docstrings, plain files).
    pub fn bare() -> Self {
        Self {
            name: "bare".to_string(),
            opener: String::new(),
            continuation: None,
            closer: None,
        }
    }

    fn decoration_tokens(&self) -> impl Iterator<Item = &str> {
        [Some(self.opener.as_str()), self.continuation.as_deref()]
            .into_iter()
            .flatten()
            .filter(|t| !t.is_empty())
    }

    /// Content of a potential marker line with this style's decoration removed.
    ///
    /// Decoration is optional, so `!theo */` closes a `/* */` block as well as
    /// ` * !theo` does.
    pub fn marker_content<'a>(&self, line: &'a str) -> &'a str {
        let mut rest = line.trim();
        for token in self.decoration_tokens() {
            if let Some(stripped) = rest.strip_prefix(token) {
                rest = stripped.trim_start();
                break;
            }
        }
        if let Some(closer) = &self.closer {
            if let Some(stripped) = rest.strip_suffix(closer.as_str()) {
                rest = stripped.trim_end();
            }
        }
        rest
    }

    /// Whether `line` visibly uses this style's decoration.
    pub fn decorates(&self, line: &str) -> bool {
        let trimmed = line.trim();
        self.decoration_tokens().any(|t| trimmed.starts_with(t))
            || self
                .closer
                .as_deref()
                .is_some_and(|c| trimmed.ends_with(c))
    }

    /// Remove this style's decoration from one payload line.
    ///
    /// Leading whitespace, the continuation token and one following space
    /// are removed. Lines that carry no decoration are returned unchanged
    /// so their indentation survives.
    pub fn strip_payload_line<'a>(&self, line: &'a str) -> &'a str {
        let line = line.trim_end_matches('\r');
        let trimmed = line.trim_start();
        let token = self
            .continuation
            .as_deref()
            .filter(|t| !t.is_empty())
            .filter(|t| trimmed.starts_with(*t));
        match token {
            Some(token) => {
                let rest = &trimmed[token.len()..];
                rest.strip_prefix(' ').unwrap_or(rest)
            }
            None => line,
        }
    }
}

/// The ordered set of comment styles the scanner recognizes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentStyles {
    styles: Vec<CommentStyle>,
}

impl CommentStyles {
    pub fn new(styles: Vec<CommentStyle>) -> Self {
        Self { styles }
    }

    /// Add a style; it is tried before the bare fallback.
    pub fn with_style(mut self, style: CommentStyle) -> Self {
        let bare_at = self
            .styles
            .iter()
            .position(|s| s.opener.is_empty())
            .unwrap_or(self.styles.len());
        self.styles.insert(bare_at, style);
        self
    }

    pub fn styles(&self) -> &[CommentStyle] {
        &self.styles
    }

    /// Find the style under which `line` is exactly `marker`.
    ///
    /// Styles whose decoration appears on the line win; an undecorated
    /// marker falls back to the bare style.
    pub fn detect(&self, line: &str, marker: &str) -> Option<&CommentStyle> {
        self.styles
            .iter()
            .find(|style| style.decorates(line) && style.marker_content(line) == marker)
            .or_else(|| {
                if line.trim() == marker {
                    self.styles.iter().find(|style| style.opener.is_empty())
                } else {
                    None
                }
            })
    }
}

impl Default for CommentStyles {
    fn default() -> Self {
        // Longer tokens first so `<!--` wins over `--` and `/*` over `*`.
        Self::new(vec![
            CommentStyle::block("html", "<!--", None, "-->"),
            CommentStyle::block("c-block", "/*", Some("*"), "*/"),
            CommentStyle::block("ocaml", "(*", Some("*"), "*)"),
            CommentStyle::block("haskell-block", "{-", None, "-}"),
            CommentStyle::line("c-line", "//"),
            CommentStyle::line("dash", "--"),
            CommentStyle::line("hash", "#"),
            CommentStyle::line("lisp", ";"),
            CommentStyle::line("percent", "%"),
            CommentStyle::bare(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "!theo";

    #[test]
    fn test_detect_common_styles() {
        let styles = CommentStyles::default();
        assert_eq!(styles.detect(" * !theo", MARKER).unwrap().name, "c-block");
        assert_eq!(styles.detect("/* !theo", MARKER).unwrap().name, "c-block");
        assert_eq!(styles.detect("// !theo", MARKER).unwrap().name, "c-line");
        assert_eq!(styles.detect("#!theo", MARKER).unwrap().name, "hash");
        assert_eq!(styles.detect("-- !theo", MARKER).unwrap().name, "dash");
        assert_eq!(styles.detect("<!-- !theo -->", MARKER).unwrap().name, "html");
        assert_eq!(styles.detect("   !theo  ", MARKER).unwrap().name, "bare");
        assert_eq!(styles.detect("!theo */", MARKER).unwrap().name, "c-block");
    }

    #[test]
    fn test_detect_rejects_other_text() {
        let styles = CommentStyles::default();
        assert!(styles.detect(" * see !theo below", MARKER).is_none());
        assert!(styles.detect("// !theorem", MARKER).is_none());
        assert!(styles.detect("int main() {", MARKER).is_none());
    }

    #[test]
    fn test_marker_content_with_closer() {
        let style = CommentStyle::block("c-block", "/*", Some("*"), "*/");
        assert_eq!(style.marker_content("!theo */"), "!theo");
        assert_eq!(style.marker_content("/* !theo */"), "!theo");
    }

    #[test]
    fn test_strip_payload_line() {
        let c = CommentStyle::block("c-block", "/*", Some("*"), "*/");
        assert_eq!(c.strip_payload_line(" *   setup: make"), "  setup: make");
        assert_eq!(c.strip_payload_line(" *"), "");
        assert_eq!(c.strip_payload_line("  setup: make"), "  setup: make");

        let hash = CommentStyle::line("hash", "#");
        assert_eq!(hash.strip_payload_line("# tests:"), "tests:");
        assert_eq!(hash.strip_payload_line("#   - name: A\r"), "  - name: A");
    }

    #[test]
    fn test_with_style_keeps_bare_last() {
        let styles = CommentStyles::default().with_style(CommentStyle::line("sql", "REM"));
        let names: Vec<_> = styles.styles().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names.last(), Some(&"bare"));
        assert!(names.contains(&"sql"));
        assert_eq!(styles.detect("REM !theo", MARKER).unwrap().name, "sql");
    }
}
