//! This module implements the in-memory model of a CDB mesh: nodes,
//! elements, the element-type table, and the plain polygonal view used at
//! the export boundary. These are owned values with no back-references to
//! any host object.

use std::collections::BTreeMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// A single mesh node. Identifiers are the 1-based ones from the file.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Node {
  /// The node number, positive and unique within a model.
  pub id: usize,
  /// The nodal coordinates.
  pub coords: Vector3<f64>,
  /// Rotation angles (THXY, THYZ, THZX), when the file carries them.
  /// Geometry-only consumers ignore these, but they round-trip.
  pub rotations: Option<Vector3<f64>>
}

/// A single element: ordered connectivity plus the attribute selections
/// that were active when it was read. Selections are cursors, not stored
/// per-element values in the file -- an element keeps whatever was active
/// at the time it was created and is never re-resolved.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Element {
  /// The element number, positive and unique within a model.
  pub id: usize,
  /// The referenced node numbers. Order is significant -- it defines the
  /// winding.
  pub nodes: Vec<usize>,
  /// The element-type table index active at creation.
  pub etype: usize,
  /// The material number active at creation.
  pub material: usize,
  /// The real-constant-set number active at creation.
  pub real_set: usize,
  /// Set when `etype` has no entry in the element-type table. The element
  /// is kept so the geometry still loads for inspection.
  pub unresolved_type: bool
}

/// An entry in the element-type table, as registered by an ET command.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ElementTypeDef {
  /// The table index the ET command assigned.
  pub index: usize,
  /// The type name, uppercased. ANSYS writes either a full name like
  /// `SHELL63` or the bare numeric code `63`; both are accepted.
  pub name: String
}

impl ElementTypeDef {
  /// Builds a definition, normalising the name to uppercase.
  pub fn new(index: usize, name: &str) -> Self {
    return Self { index, name: name.trim().to_ascii_uppercase() };
  }

  /// Extracts the numeric ANSYS type code from the name, so `SHELL63` and
  /// a bare `63` both come back as 63.
  pub fn code(&self) -> Option<u32> {
    let start = self.name.find(|c: char| c.is_ascii_digit())?;
    let digits: String = self.name[start..]
      .chars()
      .take_while(|c| c.is_ascii_digit())
      .collect();
    return digits.parse().ok();
  }
}

/// The result of an import and the general in-memory form of a CDB model:
/// nodes, elements and type definitions keyed by their file identifiers.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Mesh {
  /// The nodes, keyed by node number.
  pub nodes: BTreeMap<usize, Node>,
  /// The elements, keyed by element number.
  pub elements: BTreeMap<usize, Element>,
  /// The element-type table, keyed by type index.
  pub element_types: BTreeMap<usize, ElementTypeDef>
}

impl Mesh {
  /// Instantiates an empty mesh.
  pub fn new() -> Self {
    return Self::default();
  }

  /// Produces the dense, 0-based polygonal view of the mesh: vertices in
  /// node-number order, one face per element in element-number order. The
  /// renumbering is stable, and padding nodes (a repeated corner standing
  /// in for a missing one, as in a triangle written as a degenerate quad)
  /// are collapsed.
  pub fn to_polygons(&self) -> PolyMesh {
    let mut index_of: BTreeMap<usize, usize> = BTreeMap::new();
    let mut vertices: Vec<Vector3<f64>> = Vec::with_capacity(self.nodes.len());
    for (id, node) in self.nodes.iter() {
      index_of.insert(*id, vertices.len());
      vertices.push(node.coords);
    }
    let mut faces: Vec<Vec<usize>> = Vec::with_capacity(self.elements.len());
    for element in self.elements.values() {
      let mut face: Vec<usize> = Vec::with_capacity(element.nodes.len());
      for nid in element.nodes.iter() {
        if let Some(vi) = index_of.get(nid).copied() {
          if face.last() != Some(&vi) {
            face.push(vi);
          }
        }
      }
      faces.push(face);
    }
    return PolyMesh { vertices, faces };
  }
}

/// A plain polygonal mesh: the exporter's input. Vertex indices within
/// faces are 0-based and dense; the writer renumbers them from 1 on the
/// way out, so holes in a host's own numbering never leak into the file.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PolyMesh {
  /// The vertex coordinates.
  pub vertices: Vec<Vector3<f64>>,
  /// The faces, each an ordered list of at least three vertex indices.
  pub faces: Vec<Vec<usize>>
}

impl PolyMesh {
  /// Instantiates an empty polygonal mesh.
  pub fn new() -> Self {
    return Self::default();
  }
}
