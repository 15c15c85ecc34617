// ABOUTME: Source text abstraction: expression text plus line-offset bookkeeping

use crate::error::Diagnostic;
use std::sync::Arc;

/// An expression source: the text to parse plus precomputed line offsets
/// so byte-offset diagnostics can be rendered as line/column locations.
#[derive(Debug, Clone)]
pub struct Source {
    text: Arc<str>,
    description: String,
    /// Byte offset at which each line starts; line_offsets[0] == 0.
    line_offsets: Vec<u32>,
}

impl Source {
    pub fn new(text: impl Into<String>) -> Self {
        Source::with_description(text, "<input>")
    }

    /// Create a source with a description used in rendered diagnostics,
    /// typically a file name or policy element name.
    pub fn with_description(text: impl Into<String>, description: impl Into<String>) -> Self {
        let text: String = text.into();
        let mut line_offsets = vec![0u32];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                line_offsets.push(i as u32 + 1);
            }
        }
        Source {
            text: Arc::from(text.as_str()),
            description: description.into(),
            line_offsets,
        }
    }

    pub fn content(&self) -> &str {
        &self.text
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Translate a byte offset to a 1-based (line, column) pair. Columns
    /// count bytes within the line, which is exact for ASCII operators
    /// and close enough for caret-free diagnostics.
    pub fn location(&self, offset: u32) -> (u32, u32) {
        let line_idx = match self.line_offsets.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let line_start = self.line_offsets[line_idx];
        (line_idx as u32 + 1, offset - line_start + 1)
    }

    /// Render a diagnostic against this source as `desc:line:col: message`.
    pub fn render(&self, d: &Diagnostic) -> String {
        let (line, col) = self.location(d.start);
        format!(
            "{}: {}:{}:{}: {}",
            d.severity, self.description, line, col, d.message
        )
    }
}
