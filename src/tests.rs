use std::io::Cursor;

use nalgebra::Vector3;

use crate::errors::{ExportError, ParseError};
use crate::format::{
  decode_fortran_real, format_integer, format_real, FieldKind, LineFormat
};
use crate::mesh::{ElementTypeDef, Mesh, PolyMesh};
use crate::parser::CdbParser;
use crate::writer::{CdbWriter, ExportOptions};

fn parse(text: &str) -> Mesh {
  return CdbParser::parse_bufread(Cursor::new(text)).expect("parse failed");
}

fn parse_err(text: &str) -> ParseError {
  return CdbParser::parse_bufread(Cursor::new(text))
    .expect_err("parse should have failed");
}

fn export(mesh: &PolyMesh) -> String {
  let mut buf: Vec<u8> = Vec::new();
  CdbWriter::new(mesh).write(&mut buf).expect("export failed");
  return String::from_utf8(buf).unwrap();
}

fn v(x: f64, y: f64, z: f64) -> Vector3<f64> {
  return Vector3::new(x, y, z);
}

/// One unit quad.
fn quad_mesh() -> PolyMesh {
  return PolyMesh {
    vertices: vec![
      v(0.0, 0.0, 0.0),
      v(1.0, 0.0, 0.0),
      v(1.0, 1.0, 0.0),
      v(0.0, 1.0, 0.0)
    ],
    faces: vec![vec![0, 1, 2, 3]]
  };
}

/// One quad plus one 8-node (corners-then-midsides) face, disjoint vertices.
fn mixed_mesh() -> PolyMesh {
  let mut mesh = quad_mesh();
  let base = mesh.vertices.len();
  mesh.vertices.extend([
    v(2.0, 0.0, 0.0),
    v(3.0, 0.0, 0.0),
    v(3.0, 1.0, 0.0),
    v(2.0, 1.0, 0.0),
    v(2.5, 0.0, 0.0),
    v(3.0, 0.5, 0.0),
    v(2.5, 1.0, 0.0),
    v(2.0, 0.5, 0.0)
  ]);
  mesh.faces.push((base..base + 8).collect());
  return mesh;
}

#[test]
fn test_decode_fortran_real() {
  let epsilon = 1e-12_f64;
  let assert_near = |a: f64, b: f64| assert!((a - b).abs() < epsilon.max(b.abs() * 1e-12));
  let direct = |s: &str, f: f64| assert_near(decode_fortran_real(s).unwrap(), f);
  let must_fail = |s: &str| assert_eq!(decode_fortran_real(s), None);
  direct("3.0", 3.0);
  direct(" 12.5 ", 12.5);
  direct("-0.25", -0.25);
  direct("1.5e-3", 1.5e-3);
  direct("1.5E-3", 1.5e-3);
  // Fortran D exponents
  direct("1.5d-3", 1.5e-3);
  direct("1.5D+2", 150.0);
  // bare embedded-sign exponents
  direct("1.5-3", 1.5e-3);
  direct("-2.5+2", -250.0);
  must_fail("");
  must_fail("   ");
  must_fail("abc");
  must_fail("1.2.3");
  must_fail("-");
  must_fail("e5");
}

#[test]
fn test_line_format_parse() {
  let f = LineFormat::parse("(3i8,6e16.9)").unwrap();
  assert_eq!(f.len(), 9);
  assert_eq!(f.fields()[0].kind, FieldKind::Integer);
  assert_eq!(f.fields()[0].width, 8);
  assert_eq!(f.fields()[3].kind, FieldKind::Real);
  assert_eq!(f.fields()[3].width, 16);
  assert_eq!(f.fields()[3].precision, 9);
  let g = LineFormat::parse("(19i8)").unwrap();
  assert_eq!(g.len(), 19);
  // %g-style reals count as reals too
  let h = LineFormat::parse("(3i8,6g16.9)").unwrap();
  assert_eq!(h.fields()[8].kind, FieldKind::Real);
  assert!(LineFormat::parse("junk").is_none());
  assert!(LineFormat::parse("").is_none());
}

#[test]
fn test_field_formatting() {
  assert_eq!(format_integer(123, 8).unwrap(), "     123");
  assert_eq!(format_integer(-1, 4).unwrap(), "  -1");
  assert!(format_integer(12345, 3).is_none());
  let r = format_real(1.5, 16, 9).unwrap();
  assert_eq!(r.len(), 16);
  assert_eq!(r.trim(), "1.500000000e0");
  assert!(format_real(-1.5, 8, 9).is_none());
}

#[test]
fn test_single_line_commands() {
  let mesh = parse(
    "N,1,0.0,0.0,0.0\n\
     N,2,1.0,0.0,0.0\n\
     N,3,1.0,1.0,0.0\n\
     N,4,0.0,1.0,0.0\n\
     ET,1,SHELL63\n\
     TYPE,1\n\
     EN,1,1,2,3,4\n"
  );
  assert_eq!(mesh.nodes.len(), 4);
  assert_eq!(mesh.elements.len(), 1);
  let e = &mesh.elements[&1];
  assert_eq!(e.nodes, vec![1, 2, 3, 4]);
  assert_eq!(e.etype, 1);
  assert_eq!(e.material, 1);
  assert_eq!(e.real_set, 1);
  assert!(!e.unresolved_type);
  assert_eq!(mesh.element_types[&1].name, "SHELL63");
}

#[test]
fn test_selector_correctness() {
  let mut text = String::new();
  for i in 1..=12 {
    text.push_str(&format!("N,{i},{}.0,0.0,0.0\n", i));
  }
  text.push_str(
    "ET,1,SHELL63\n\
     TYPE,1\n\
     EN,1,1,2,3,4\n\
     TYPE,2\n\
     ET,2,SHELL93\n\
     EN,2,5,6,7,8,9,10,11,12\n"
  );
  let mesh = parse(&text);
  let e1 = &mesh.elements[&1];
  let e2 = &mesh.elements[&2];
  assert_eq!(e1.etype, 1);
  assert_eq!(mesh.element_types[&e1.etype].name, "SHELL63");
  assert_eq!(e2.etype, 2);
  assert_eq!(mesh.element_types[&e2.etype].name, "SHELL93");
  assert!(!e1.unresolved_type && !e2.unresolved_type);
}

#[test]
fn test_selectors_apply_at_creation_only() {
  // later MAT selections must not retroactively change earlier elements
  let mesh = parse(
    "N,1,0,0,0\nN,2,1,0,0\nN,3,1,1,0\n\
     ET,1,SHELL63\n\
     MAT,3\n\
     REAL,2\n\
     EN,1,1,2,3\n\
     MAT,7\n\
     EN,2,3,2,1\n"
  );
  assert_eq!(mesh.elements[&1].material, 3);
  assert_eq!(mesh.elements[&1].real_set, 2);
  assert_eq!(mesh.elements[&2].material, 7);
}

#[test]
fn test_unknown_directives_skipped() {
  let mesh = parse(
    "/PREP7\n\
     /TITLE, test plate\n\
     ! a comment line\n\
     NUMOFF,NODE,4\n\
     N,1,0,0,0\n\
     N,2,1,0,0\n\
     N,3,1,1,0\n\
     ET,1,SHELL63\n\
     EN,1,1,2,3\n\
     FINISH\n"
  );
  assert_eq!(mesh.nodes.len(), 3);
  assert_eq!(mesh.elements.len(), 1);
}

#[test]
fn test_duplicate_identifiers_last_write_wins() {
  let mesh = parse(
    "N,1,0,0,0\n\
     N,1,5.0,6.0,7.0\n\
     ET,1,SHELL63\n\
     ET,1,SHELL93\n"
  );
  assert_eq!(mesh.nodes[&1].coords, v(5.0, 6.0, 7.0));
  assert_eq!(mesh.element_types[&1].name, "SHELL93");
}

#[test]
fn test_et_blank_index_defaults_to_next() {
  let mesh = parse("ET,1,SHELL63\nET,,SHELL93\n");
  assert_eq!(mesh.element_types[&2].name, "SHELL93");
}

#[test]
fn test_element_type_code() {
  assert_eq!(ElementTypeDef::new(1, "SHELL63").code(), Some(63));
  assert_eq!(ElementTypeDef::new(1, "93").code(), Some(93));
  assert_eq!(ElementTypeDef::new(1, "shell281").code(), Some(281));
  assert_eq!(ElementTypeDef::new(1, "WHAT").code(), None);
}

#[test]
fn test_node_rotations_roundtrip_in_model() {
  let mesh = parse("N,5,1.0,2.0,3.0,10.0,20.0,30.0\n");
  let node = &mesh.nodes[&5];
  assert_eq!(node.coords, v(1.0, 2.0, 3.0));
  assert_eq!(node.rotations, Some(v(10.0, 20.0, 30.0)));
  let plain = parse("N,5,1.0,2.0,3.0\n");
  assert_eq!(plain.nodes[&5].rotations, None);
}

#[test]
fn test_archive_n_and_en_forms() {
  let mesh = parse(
    "N,R5.3,LOC,1,0,0,0.0,0.0,0.0\n\
     N,R5.3,LOC,2,0,0,1.0,0.0,0.0\n\
     N,R5.3,LOC,3,0,0,1.0,1.0,0.0\n\
     N,R5.3,LOC,4,0,0,0.0,1.0,0.0\n\
     N,R5.3,ANG,4,15.0,0.0,0.0\n\
     ET,1,SHELL63\n\
     EN,R5.5,ATTR,4,2,1,3,0,0,8\n\
     EN,R5.5,NODE,4,1,2,3,4\n"
  );
  assert_eq!(mesh.nodes.len(), 4);
  assert_eq!(mesh.nodes[&2].coords, v(1.0, 0.0, 0.0));
  assert_eq!(mesh.nodes[&4].rotations, Some(v(15.0, 0.0, 0.0)));
  let e = &mesh.elements[&8];
  assert_eq!(e.material, 2);
  assert_eq!(e.etype, 1);
  assert_eq!(e.real_set, 3);
  assert_eq!(e.nodes, vec![1, 2, 3, 4]);
}

#[test]
fn test_archive_attr_zero_falls_back_to_cursors() {
  // archive files stamp unset ATTR fields as 0; those take the cursor
  // values, same as blanks
  let mesh = parse(
    "N,1,0,0,0\nN,2,1,0,0\nN,3,1,1,0\nN,4,0,1,0\n\
     ET,3,SHELL63\n\
     MAT,2\n\
     REAL,4\n\
     EN,R5.5,ATTR,4,0,0,0,0,0,7\n\
     EN,R5.5,NODE,4,1,2,3,4\n"
  );
  let e = &mesh.elements[&7];
  assert_eq!(e.material, 2);
  assert_eq!(e.etype, 3);
  assert_eq!(e.real_set, 4);
  assert_eq!(e.nodes, vec![1, 2, 3, 4]);
}

/// Renders a fixed-width NBLOCK row under a (3i8,6e16.9) format.
fn nblock_row(id: usize, coords: &[f64]) -> String {
  let mut line = format!("{id:>8}{:>8}{:>8}", 0, 0);
  for c in coords {
    line.push_str(&format!("{:>16}", format!("{c:.9e}")));
  }
  line.push('\n');
  return line;
}

#[test]
fn test_nblock_roundtrip_of_rows() {
  let text = format!(
    "NBLOCK,6,SOLID\n(3i8,6e16.9)\n{}{}N,R5.3,LOC,-1,\n",
    nblock_row(1, &[0.5, -1.25, 3.0]),
    nblock_row(2, &[1.0, 2.0, -3.5])
  );
  let mesh = parse(&text);
  assert_eq!(mesh.nodes.len(), 2);
  assert_eq!(mesh.nodes[&1].coords, v(0.5, -1.25, 3.0));
  assert_eq!(mesh.nodes[&2].coords, v(1.0, 2.0, -3.5));
}

#[test]
fn test_nblock_truncated_row_tolerated() {
  // a data row shorter than the declared field count still yields a node,
  // missing trailing fields treated as zero
  let text = format!(
    "NBLOCK,6,SOLID\n(3i8,6e16.9)\n{}-1\n",
    nblock_row(7, &[4.5])
  );
  let mesh = parse(&text);
  assert_eq!(mesh.nodes[&7].coords, v(4.5, 0.0, 0.0));
  assert_eq!(mesh.nodes[&7].rotations, None);
}

#[test]
fn test_nblock_declared_count_terminates() {
  // no -1 and no dummy N: the declared count alone must end the block
  let text = format!(
    "NBLOCK,6,SOLID,2,2\n(3i8,6e16.9)\n{}{}ET,1,SHELL63\n",
    nblock_row(1, &[0.0, 0.0, 0.0]),
    nblock_row(2, &[1.0, 0.0, 0.0])
  );
  let mesh = parse(&text);
  assert_eq!(mesh.nodes.len(), 2);
  assert_eq!(mesh.element_types[&1].name, "SHELL63");
}

#[test]
fn test_nblock_declared_count_then_dummy_trailer() {
  // ANSYS writes the dummy N trailer even when the header count already
  // closed the block; it must read as a no-op, not a failed N command
  let text = format!(
    "NBLOCK,6,SOLID,2,2\n(3i8,6e16.9)\n{}{}N,R5.3,LOC, -1,\nET,1,SHELL63\n",
    nblock_row(1, &[0.0, 0.0, 0.0]),
    nblock_row(2, &[1.0, 0.0, 0.0])
  );
  let mesh = parse(&text);
  assert_eq!(mesh.nodes.len(), 2);
  assert_eq!(mesh.element_types[&1].name, "SHELL63");
  // same thing with the bare form
  let mesh = parse("N,1,0,0,0\nN,-1\n");
  assert_eq!(mesh.nodes.len(), 1);
}

#[test]
fn test_comment_lines_inside_blocks() {
  let mut text = format!(
    "NBLOCK,6,SOLID\n(3i8,6e16.9)\n{}! a comment\n{}-1\n",
    nblock_row(1, &[0.0, 0.0, 0.0]),
    nblock_row(2, &[1.0, 0.0, 0.0])
  );
  text.push_str("N,3,1,1,0\nN,4,0,1,0\nET,1,SHELL63\nEBLOCK,19,SOLID,1\n(19i8)\n");
  text.push_str("! another comment\n");
  for f in [1, 1, 1, 1, 0, 0, 0, 0, 4, 0, 1, 1, 2, 3, 4] {
    text.push_str(&format!("{f:>8}"));
  }
  text.push_str("\n-1\n");
  let mesh = parse(&text);
  assert_eq!(mesh.nodes.len(), 4);
  assert_eq!(mesh.elements[&1].nodes, vec![1, 2, 3, 4]);
}

#[test]
fn test_nblock_malformed_coordinate_is_syntax_error() {
  let mut row = format!("{:>8}{:>8}{:>8}", 3, 0, 0);
  row.push_str(&format!("{:>16}", "abc"));
  let text = format!("NBLOCK,6,SOLID\n(3i8,6e16.9)\n{row}\n-1\n");
  match parse_err(&text) {
    ParseError::Syntax { line, text, .. } => {
      assert_eq!(line, 3);
      assert_eq!(text, "abc");
    },
    other => panic!("expected a syntax error, got {other:?}")
  }
}

#[test]
fn test_malformed_directive_real_is_syntax_error() {
  match parse_err("N,1,0.0,oops,0.0\n") {
    ParseError::Syntax { line, text, .. } => {
      assert_eq!(line, 1);
      assert_eq!(text, "oops");
    },
    other => panic!("expected a syntax error, got {other:?}")
  }
}

#[test]
fn test_eblock_continuation_lines() {
  // 12 fields per line: an 8-node record (19 fields) continues onto a
  // second physical line, detected by field-count bookkeeping
  let mut text = String::from("NBLOCK,6,SOLID\n(3i8,6e16.9)\n");
  for i in 1..=8 {
    text.push_str(&nblock_row(i, &[i as f64, 0.0, 0.0]));
  }
  text.push_str("N,R5.3,LOC,-1,\nET,1,SHELL93\nEBLOCK,12,SOLID,1\n(12i6)\n");
  let first: Vec<i64> = vec![1, 1, 1, 1, 0, 0, 0, 0, 8, 0, 1, 1];
  let second: Vec<i64> = vec![2, 3, 4, 5, 6, 7, 8];
  for fields in [first, second] {
    for f in fields {
      text.push_str(&format!("{f:>6}"));
    }
    text.push('\n');
  }
  text.push_str("-1\n");
  let mesh = parse(&text);
  let e = &mesh.elements[&1];
  assert_eq!(e.nodes, vec![1, 2, 3, 4, 5, 6, 7, 8]);
  assert_eq!(e.etype, 1);
  assert!(!e.unresolved_type);
}

#[test]
fn test_eblock_non_solid_records() {
  let mut text = String::from(
    "N,1,0,0,0\nN,2,1,0,0\nN,3,1,1,0\nN,4,0,1,0\n\
     ET,1,SHELL63\nEBLOCK,10,,1\n(10i6)\n"
  );
  for f in [1, 1, 1, 1, 0, 1, 2, 3, 4, 0] {
    text.push_str(&format!("{f:>6}"));
  }
  text.push_str("\n-1\n");
  let mesh = parse(&text);
  let e = &mesh.elements[&1];
  assert_eq!(e.nodes, vec![1, 2, 3, 4]);
  assert_eq!(e.etype, 1);
  assert_eq!(e.material, 1);
}

#[test]
fn test_unresolved_type_is_flagged_not_fatal() {
  let mesh = parse("N,1,0,0,0\nN,2,1,0,0\nN,3,1,1,0\nEN,1,1,2,3\n");
  let e = &mesh.elements[&1];
  assert!(e.unresolved_type);
  assert_eq!(e.nodes, vec![1, 2, 3]);
}

#[test]
fn test_missing_node_is_referential_error() {
  match parse_err("ET,1,SHELL63\nEN,1,7,8,9\n") {
    ParseError::MissingNode { element, node } => {
      assert_eq!(element, 1);
      assert_eq!(node, 7);
    },
    other => panic!("expected a missing-node error, got {other:?}")
  }
}

#[test]
fn test_import_idempotence() {
  let text = export(&mixed_mesh());
  assert_eq!(parse(&text), parse(&text));
}

#[test]
fn test_crlf_tolerated() {
  let lf = "N,1,0,0,0\nN,2,1,0,0\nN,3,1,1,0\nET,1,SHELL63\nEN,1,1,2,3\n";
  let crlf = lf.replace('\n', "\r\n");
  assert_eq!(parse(lf), parse(&crlf));
}

#[test]
fn test_export_shape_partition() {
  let text = export(&mixed_mesh());
  let et_lines: Vec<&str> = text
    .lines()
    .filter(|l| l.starts_with("ET,"))
    .collect();
  assert_eq!(et_lines, vec!["ET,1,SHELL63", "ET,2,SHELL93"]);
  let mesh = parse(&text);
  assert_eq!(mesh.elements.len(), 2);
  let quad = &mesh.elements[&1];
  let eight = &mesh.elements[&2];
  assert_eq!(quad.nodes.len(), 4);
  assert_eq!(mesh.element_types[&quad.etype].name, "SHELL63");
  assert_eq!(eight.nodes.len(), 8);
  assert_eq!(mesh.element_types[&eight.etype].name, "SHELL93");
}

#[test]
fn test_export_roundtrip() {
  for source in [quad_mesh(), mixed_mesh()] {
    let back = parse(&export(&source)).to_polygons();
    assert_eq!(back.faces, source.faces);
    assert_eq!(back.vertices.len(), source.vertices.len());
    for (a, b) in back.vertices.iter().zip(source.vertices.iter()) {
      assert!((a - b).norm() < 1e-9, "vertex drifted: {a:?} vs {b:?}");
    }
  }
}

#[test]
fn test_export_triangle_padding_collapses_on_import() {
  let mesh = PolyMesh {
    vertices: vec![v(0.0, 0.0, 0.0), v(1.0, 0.0, 0.0), v(0.0, 1.0, 0.0)],
    faces: vec![vec![0, 1, 2]]
  };
  let back = parse(&export(&mesh));
  // written as a degenerate quad with the last corner repeated
  assert_eq!(back.elements[&1].nodes, vec![1, 2, 3, 3]);
  assert_eq!(back.to_polygons().faces, vec![vec![0, 1, 2]]);
}

#[test]
fn test_export_custom_type_names() {
  let options = ExportOptions {
    linear_shell: "SHELL181".to_string(),
    ..ExportOptions::default()
  };
  let mut buf: Vec<u8> = Vec::new();
  CdbWriter::with_options(&quad_mesh(), options)
    .write(&mut buf)
    .unwrap();
  let text = String::from_utf8(buf).unwrap();
  assert!(text.contains("ET,1,SHELL181"));
}

#[test]
fn test_export_unsupported_face_rejected() {
  let mut mesh = quad_mesh();
  mesh.vertices.push(v(2.0, 2.0, 0.0));
  mesh.faces = vec![vec![0, 1, 2, 3, 4]];
  let mut buf: Vec<u8> = Vec::new();
  match CdbWriter::new(&mesh).write(&mut buf).unwrap_err() {
    ExportError::UnsupportedFace { face, count } => {
      assert_eq!(face, 0);
      assert_eq!(count, 5);
    },
    other => panic!("expected an unsupported-face error, got {other:?}")
  }
}

#[test]
fn test_export_missing_vertex_rejected() {
  let mut mesh = quad_mesh();
  mesh.faces = vec![vec![0, 1, 2, 9]];
  let mut buf: Vec<u8> = Vec::new();
  match CdbWriter::new(&mesh).write(&mut buf).unwrap_err() {
    ExportError::MissingVertex { face, vertex } => {
      assert_eq!(face, 0);
      assert_eq!(vertex, 9);
    },
    other => panic!("expected a missing-vertex error, got {other:?}")
  }
}

#[test]
fn test_export_format_overflow_reported() {
  let options = ExportOptions { coord_width: 10, ..ExportOptions::default() };
  let mut buf: Vec<u8> = Vec::new();
  let err = CdbWriter::with_options(&quad_mesh(), options)
    .write(&mut buf)
    .unwrap_err();
  match err {
    ExportError::FormatOverflow { width, .. } => assert_eq!(width, 10),
    other => panic!("expected a format-overflow error, got {other:?}")
  }
}

#[test]
fn test_file_entry_points() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("plate.cdb");
  let source = mixed_mesh();
  CdbWriter::new(&source).write_file(&path).unwrap();
  let mesh = CdbParser::parse_file(&path).unwrap();
  assert_eq!(mesh.nodes.len(), source.vertices.len());
  assert_eq!(mesh.elements.len(), source.faces.len());
  assert!(CdbParser::parse_file(dir.path().join("nope.cdb")).is_err());
}
