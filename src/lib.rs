//! This library implements a reader and a writer for the ANSYS CDB text
//! format, as used to exchange finite-element mesh geometry: nodes, elements,
//! element-type/material/real-constant selectors, and the block-encoded
//! NBLOCK/EBLOCK node and element tables.
//!
//! The read path is a one-pass, line-fed parser: feed it lines (or a whole
//! `BufRead`) and it tracks the stateful TYPE/MAT/REAL directives, decodes
//! fixed-width block records, and hands back an owned [`mesh::Mesh`]. The
//! write path turns a plain polygonal mesh into well-formed CDB text,
//! partitioning faces into SHELL63/SHELL93 element families by node count.
//!
//! The codec has no dependency on any host editing environment -- conversion
//! to and from a host's own mesh representation is the caller's business.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]
#![allow(clippy::needless_return)]

pub mod errors;
pub mod format;
pub mod mesh;
pub mod parser;
pub mod writer;

#[cfg(test)]
mod tests;

/// One-stop import for the types most users of this library need.
pub mod prelude {
  pub use crate::errors::{ExportError, ParseError};
  pub use crate::format::{Field, FieldKind, LineFormat};
  pub use crate::mesh::{Element, ElementTypeDef, Mesh, Node, PolyMesh};
  pub use crate::parser::CdbParser;
  pub use crate::writer::{CdbWriter, ExportOptions};
}
