//! This module defines the error types surfaced by the CDB reader and
//! writer. Every parse-side error carries the 1-based line number it was
//! detected on, so a bad file can be diagnosed without re-running.

use std::io;

use thiserror::Error;

/// Errors that abort an import. Per the resource model, no partial mesh is
/// ever surfaced alongside one of these.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
  /// A line or field could not be parsed. Malformed numeric text is never
  /// silently coerced to zero -- that would corrupt geometry.
  #[error("syntax error on line {line}: {reason} (near {text:?})")]
  Syntax {
    /// The 1-based line number the error was detected on.
    line: usize,
    /// What was expected and not found.
    reason: String,
    /// The offending token or raw line text.
    text: String
  },
  /// An element's connectivity references a node that was never defined.
  #[error("element {element} references node {node}, which is not defined")]
  MissingNode {
    /// The ID of the offending element.
    element: usize,
    /// The referenced, undefined node ID.
    node: usize
  },
  /// The underlying stream failed.
  #[error("i/o error: {0}")]
  Io(#[from] io::Error)
}

impl ParseError {
  /// Shorthand for building a syntax error.
  pub(crate) fn syntax<R, T>(line: usize, reason: R, text: T) -> Self
    where R: Into<String>, T: Into<String> {
    return Self::Syntax {
      line,
      reason: reason.into(),
      text: text.into()
    };
  }
}

/// Errors that abort an export.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExportError {
  /// A face has a vertex count that maps to neither shell family.
  #[error(
    "face {face} has {count} vertices; only 3, 4, 6 or 8 are supported"
  )]
  UnsupportedFace {
    /// The 0-based index of the offending face.
    face: usize,
    /// Its vertex count.
    count: usize
  },
  /// A face references a vertex index outside the vertex list.
  #[error("face {face} references vertex {vertex}, which does not exist")]
  MissingVertex {
    /// The 0-based index of the offending face.
    face: usize,
    /// The out-of-range vertex index.
    vertex: usize
  },
  /// A value cannot be represented within the chosen fixed field width.
  /// Reported explicitly, never truncated silently.
  #[error("value {value} does not fit in a {width}-character field")]
  FormatOverflow {
    /// The rendered value that did not fit.
    value: String,
    /// The declared field width.
    width: usize
  },
  /// The underlying stream failed.
  #[error("i/o error: {0}")]
  Io(#[from] io::Error)
}
