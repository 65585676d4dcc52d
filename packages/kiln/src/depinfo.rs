//! Parses rustc/gcc/clang-style makefile dependency (`.d`) files.
//!
//! This is the core's only source of implicit dependencies: a compiler
//! invoked with `-M`-style flags emits a file of the form
//!
//! ```text
//! output.o: input.c header1.h header2.h \
//!   header3.h
//! ```
//!
//! blank lines and `#`-comments are ignored, and a trailing backslash
//! continues the line. The core never parses source itself (that's a
//! Non-goal) — this is strictly reading what the compiler already emitted.

use std::collections::BTreeSet;

use color_eyre::{Result, eyre::Context};

use crate::{fs, path::AbsFilePath};

/// One `output: inputs...` line parsed from a dep-info file.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DepInfoLine {
    pub output: String,
    pub inputs: Vec<String>,
}

/// The parsed contents of a dep-info file: zero or more build lines.
/// Comments and blank lines are discarded, not retained.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct DepInfo(pub Vec<DepInfoLine>);

impl DepInfo {
    /// Read and parse a dep-info file from disk.
    #[tracing::instrument]
    pub async fn from_file(path: &AbsFilePath) -> Result<Self> {
        let content = fs::must_read_buffered_utf8(path)
            .await
            .with_context(|| format!("read dep-info file {path:?}"))?;
        Self::parse(&content).with_context(|| format!("parse dep-info file {path:?}"))
    }

    /// Parse dep-info file contents already in memory.
    pub fn parse(content: &str) -> Result<Self> {
        let mut lines = Vec::new();
        let mut logical_line = String::new();

        for raw_line in content.lines() {
            let trimmed = raw_line.trim_end();
            if let Some(continued) = trimmed.strip_suffix('\\') {
                logical_line.push_str(continued);
                logical_line.push(' ');
                continue;
            }
            logical_line.push_str(trimmed);
            if let Some(line) = Self::parse_line(&logical_line)? {
                lines.push(line);
            }
            logical_line.clear();
        }
        if !logical_line.trim().is_empty() {
            if let Some(line) = Self::parse_line(&logical_line)? {
                lines.push(line);
            }
        }

        Ok(Self(lines))
    }

    fn parse_line(line: &str) -> Result<Option<DepInfoLine>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let Some((output, rest)) = line.split_once(": ").or_else(|| {
            line.strip_suffix(':').map(|output| (output, ""))
        }) else {
            return Ok(None);
        };
        let inputs = rest.split_whitespace().map(str::to_owned).collect();
        Ok(Some(DepInfoLine {
            output: output.trim().to_owned(),
            inputs,
        }))
    }

    /// The set of declared output paths across all lines.
    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|line| line.output.as_str())
    }

    /// The sorted, deduplicated set of every input referenced by any line,
    /// the shape `implicitDepsHash` (§4.2) needs: the transitive closure of
    /// discovered headers, independent of declaration order.
    pub fn all_inputs_sorted(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .0
            .iter()
            .flat_map(|line| line.inputs.iter().map(String::as_str))
            .collect();
        set.into_iter().map(str::to_owned).collect()
    }

    /// Inputs declared for a specific output, if that output appears.
    pub fn inputs_for(&self, output: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|line| line.output == output)
            .map(|line| line.inputs.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_simple_line() {
        let info = DepInfo::parse("a.o: a.c a.h\n").unwrap();
        assert_eq!(info.0.len(), 1);
        assert_eq!(info.0[0].output, "a.o");
        assert_eq!(info.0[0].inputs, vec!["a.c", "a.h"]);
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let info = DepInfo::parse("# generated\n\na.o: a.c\n").unwrap();
        assert_eq!(info.0.len(), 1);
    }

    #[test]
    fn handles_line_continuation() {
        let info = DepInfo::parse("a.o: a.c \\\n  a.h \\\n  b.h\n").unwrap();
        assert_eq!(info.0.len(), 1);
        assert_eq!(info.0[0].inputs, vec!["a.c", "a.h", "b.h"]);
    }

    #[test]
    fn handles_output_with_no_inputs() {
        let info = DepInfo::parse("a.o:\n").unwrap();
        assert_eq!(info.0[0].inputs, Vec::<String>::new());
    }

    #[test]
    fn all_inputs_sorted_dedupes_across_lines() {
        let info = DepInfo::parse("a.o: common.h a.c\nb.o: common.h b.c\n").unwrap();
        assert_eq!(info.all_inputs_sorted(), vec!["a.c", "b.c", "common.h"]);
    }
}
