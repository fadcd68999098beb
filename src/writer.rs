//! This module implements the CDB generator: it walks a polygonal mesh
//! once, partitions its faces into the two shell element families by node
//! count, and streams well-formed NBLOCK/EBLOCK text plus the required
//! ET/TYPE/MAT/REAL selector commands.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::ExportError;
use crate::format::{format_integer, format_real};
use crate::mesh::PolyMesh;

/// Options controlling CDB text generation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportOptions {
  /// Width of a coordinate field, in characters.
  pub coord_width: usize,
  /// Digits after the point in a coordinate field.
  pub coord_precision: usize,
  /// The material number stamped on every element.
  pub material: usize,
  /// The real-constant-set number stamped on every element.
  pub real_set: usize,
  /// Type name for shells without mid-side nodes (3/4-vertex faces).
  pub linear_shell: String,
  /// Type name for shells with mid-side nodes (6/8-vertex faces).
  pub quadratic_shell: String
}

impl Default for ExportOptions {
  fn default() -> Self {
    return Self {
      coord_width: 16,
      coord_precision: 9,
      material: 1,
      real_set: 1,
      linear_shell: "SHELL63".to_string(),
      quadratic_shell: "SHELL93".to_string()
    };
  }
}

/// The two shell element families a face can map to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ShellFamily {
  /// No mid-side nodes: 3- and 4-vertex faces (SHELL63 by default).
  Linear,
  /// Mid-side nodes present: 6- and 8-vertex faces (SHELL93 by default).
  Quadratic
}

/// Maps a face to its shell family by vertex count. Anything that is
/// neither a valid linear nor a valid quadratic shell shape is a caller
/// contract violation -- rejected, not guessed at.
fn classify(face: &[usize], index: usize) -> Result<ShellFamily, ExportError> {
  return match face.len() {
    3 | 4 => Ok(ShellFamily::Linear),
    6 | 8 => Ok(ShellFamily::Quadratic),
    n => Err(ExportError::UnsupportedFace { face: index, count: n })
  };
}

/// Builds the 1-based connectivity for a face's EBLOCK record. Triangles
/// repeat their last corner to fill the degenerate quad slot; 6-vertex
/// faces (corner/mid-side alternating) are reordered corners-first with
/// the third corner repeated, matching the ANSYS quadratic-triangle shape.
fn record_nodes(face: &[usize]) -> Vec<usize> {
  let n = |i: usize| face[i] + 1;
  return match face.len() {
    3 => vec![n(0), n(1), n(2), n(2)],
    4 => face.iter().map(|v| v + 1).collect(),
    6 => vec![n(0), n(2), n(4), n(4), n(1), n(3), n(4), n(5)],
    8 => face.iter().map(|v| v + 1).collect(),
    _ => unreachable!("face was classified before emission")
  };
}

/// The number of decimal digits in an identifier.
fn digits(n: usize) -> usize {
  return n.checked_ilog10().unwrap_or(0) as usize + 1;
}

/// This is the CDB writer: borrows a polygonal mesh, owns the options, and
/// streams the text out in one pass.
pub struct CdbWriter<'m> {
  /// The mesh to export.
  mesh: &'m PolyMesh,
  /// The generation options.
  options: ExportOptions
}

impl<'m> CdbWriter<'m> {
  /// Instantiates a writer with default options.
  pub fn new(mesh: &'m PolyMesh) -> Self {
    return Self::with_options(mesh, ExportOptions::default());
  }

  /// Instantiates a writer with the given options.
  pub fn with_options(mesh: &'m PolyMesh, options: ExportOptions) -> Self {
    return Self { mesh, options };
  }

  /// The name to write for a family's ET command.
  fn family_name(&self, family: ShellFamily) -> &str {
    return match family {
      ShellFamily::Linear => &self.options.linear_shell,
      ShellFamily::Quadratic => &self.options.quadratic_shell
    };
  }

  /// The fixed width for integer fields: wide enough for the largest
  /// identifier present, and never narrower than the ANSYS-customary 8.
  fn int_width(&self) -> usize {
    let max_id = self.mesh.vertices.len().max(self.mesh.faces.len()).max(1);
    return digits(max_id).max(8);
  }

  /// Writes the mesh as CDB text into a stream.
  pub fn write<W: Write>(&self, out: &mut W) -> Result<(), ExportError> {
    // validate the whole face list up front: no partial output for a mesh
    // that violates the contract
    let mut families: Vec<ShellFamily> =
      Vec::with_capacity(self.mesh.faces.len());
    for (i, face) in self.mesh.faces.iter().enumerate() {
      for vertex in face.iter().copied() {
        if vertex >= self.mesh.vertices.len() {
          return Err(ExportError::MissingVertex { face: i, vertex });
        }
      }
      families.push(classify(face, i)?);
    }
    // at most one ET per family actually used, ascending indices
    let used: Vec<ShellFamily> =
      families.iter().copied().sorted().dedup().collect();
    let type_index = |family: ShellFamily| -> usize {
      return used.iter().position(|f| *f == family).unwrap_or(0) + 1;
    };
    // group same-type elements contiguously, stable within a family
    let order: Vec<usize> = (0..families.len())
      .sorted_by_key(|&i| (families[i], i))
      .collect();
    debug!(
      "writing {} nodes and {} elements across {} element type(s)",
      self.mesh.vertices.len(),
      self.mesh.faces.len(),
      used.len()
    );
    let width = self.int_width();
    let int_field = |v: usize| -> Result<String, ExportError> {
      return format_integer(v as i64, width)
        .ok_or_else(|| ExportError::FormatOverflow {
          value: v.to_string(),
          width
        });
    };
    writeln!(out, "/PREP7")?;
    writeln!(out, "/TITLE,")?;
    for family in used.iter().copied() {
      writeln!(out, "ET,{},{}", type_index(family), self.family_name(family))?;
    }
    if let Some(first) = order.first() {
      writeln!(out, "TYPE,{}", type_index(families[*first]))?;
      writeln!(out, "MAT,{}", self.options.material)?;
      writeln!(out, "REAL,{}", self.options.real_set)?;
    }
    self.write_nblock(out, width, &int_field)?;
    self.write_eblock(out, &order, &families, &type_index, &int_field)?;
    writeln!(out, "FINISH")?;
    return Ok(());
  }

  /// Writes the node table.
  fn write_nblock<W: Write>(
    &self,
    out: &mut W,
    width: usize,
    int_field: &dyn Fn(usize) -> Result<String, ExportError>
  ) -> Result<(), ExportError> {
    let cw = self.options.coord_width;
    let cp = self.options.coord_precision;
    writeln!(out, "NBLOCK,6,SOLID")?;
    writeln!(out, "(3i{width},6e{cw}.{cp})")?;
    let coord_field = |v: f64| -> Result<String, ExportError> {
      return format_real(v, cw, cp).ok_or_else(|| {
        ExportError::FormatOverflow { value: format!("{v:e}"), width: cw }
      });
    };
    for (i, vertex) in self.mesh.vertices.iter().enumerate() {
      let mut line = String::with_capacity(3 * width + 3 * cw);
      line.push_str(&int_field(i + 1)?);
      line.push_str(&int_field(0)?);
      line.push_str(&int_field(0)?);
      for axis in 0..3 {
        line.push_str(&coord_field(vertex[axis])?);
      }
      writeln!(out, "{line}")?;
    }
    // the dummy N command ANSYS closes a node block with
    writeln!(out, "N,R5.3,LOC,-1,")?;
    return Ok(());
  }

  /// Writes the element table, one SOLID-layout record per face. Each
  /// record carries its own mat/type/real fields, so selector state is
  /// correct for every element on readback regardless of grouping.
  fn write_eblock<W: Write>(
    &self,
    out: &mut W,
    order: &[usize],
    families: &[ShellFamily],
    type_index: &dyn Fn(ShellFamily) -> usize,
    int_field: &dyn Fn(usize) -> Result<String, ExportError>
  ) -> Result<(), ExportError> {
    writeln!(out, "EBLOCK,19,SOLID,{}", order.len())?;
    writeln!(out, "(19i{})", self.int_width())?;
    for (element_number, face_index) in order.iter().copied().enumerate() {
      let nodes = record_nodes(&self.mesh.faces[face_index]);
      let mut fields: Vec<usize> = vec![
        self.options.material,
        type_index(families[face_index]),
        self.options.real_set,
        1, 0, 0, 0, 0,
        nodes.len(),
        0,
        element_number + 1
      ];
      fields.extend(nodes);
      for chunk in fields.chunks(19) {
        let mut line = String::new();
        for v in chunk.iter().copied() {
          line.push_str(&int_field(v)?);
        }
        writeln!(out, "{line}")?;
      }
    }
    writeln!(out, "-1")?;
    return Ok(());
  }

  /// Utility method -- writes the mesh to a file.
  pub fn write_file<P: AsRef<Path>>(&self, p: P) -> Result<(), ExportError> {
    let file = File::create(p.as_ref())?;
    let mut out = BufWriter::new(file);
    self.write(&mut out)?;
    out.flush()?;
    return Ok(());
  }
}
