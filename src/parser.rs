//! This module implements the one-pass parser for CDB files: the directive
//! state machine (selector cursors, the ET table, N/EN/TYPE/MAT/REAL
//! handling) and the NBLOCK/EBLOCK block decoders it delegates to.
//!
//! All state lives in the per-call [`CdbParser`] value, so concurrent
//! imports of different files never interfere. The parser doesn't care how
//! lines are fed into it; [`CdbParser::parse_bufread`] and
//! [`CdbParser::parse_file`] are the whole-stream conveniences.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::{debug, warn};
use nalgebra::Vector3;

use crate::errors::ParseError;
use crate::format::{
  decode_fortran_real, split_directive, BadField, Field, FieldKind, LineFormat
};
use crate::mesh::{Element, ElementTypeDef, Mesh, Node};

/// The two kinds of block table a CDB file can put the parser inside.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockKind {
  /// An NBLOCK node coordinate table.
  Nodes,
  /// An EBLOCK element connectivity table.
  Elements
}

/// The three selector cursors a CDB file mutates as it goes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SelectorKind {
  /// The active element type (TYPE command).
  ElementType,
  /// The active material (MAT command).
  Material,
  /// The active real-constant set (REAL command).
  RealSet
}

/// A block decoder's verdict on one line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum LineResponse {
  /// The line was the block's format specification.
  Format,
  /// The line carried record data.
  Data,
  /// The line terminated the block.
  Done
}

/// What the parser concluded from one line.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ParserResponse {
  /// The line was blank.
  Blank,
  /// The line was a comment.
  Comment,
  /// The line held a command we don't recognise. Unknown directives are
  /// skipped, never fatal -- forward compatibility.
  Unknown,
  /// The line defined a node with this number.
  Node(usize),
  /// The line defined (or amended) an element with this number.
  Element(usize),
  /// The line registered an element-type definition at this index.
  TypeDefined(usize),
  /// The line moved a selector cursor to this index.
  Selector(SelectorKind, usize),
  /// The line opened a block table.
  BeginBlock(BlockKind),
  /// The line was handed to the active block decoder.
  InBlock(BlockKind, LineResponse)
}

/// What a block decoder wants done after eating a line.
enum BlockOutcome {
  /// The line was consumed; the block may carry on.
  Line(LineResponse),
  /// The line terminated the block and was consumed.
  Finished,
  /// The line terminated the block but belongs to the outer state machine
  /// and must be reprocessed as a directive.
  FinishedReprocess
}

/// Decoder for an NBLOCK node coordinate table.
struct NblockDecoder {
  /// The fixed-field layout, read off the line after the header.
  format: Option<LineFormat>,
  /// The declared record count hint, when the header carried one.
  declared: Option<usize>,
  /// Records read so far.
  read: usize,
  /// Set once the declared record count has been reached.
  done: bool
}

impl NblockDecoder {
  /// Instantiates a decoder right after the NBLOCK header line.
  fn new(declared: Option<usize>) -> Self {
    return Self { format: None, declared, read: 0, done: false };
  }

  /// Consumes one line of the block.
  fn consume(
    &mut self,
    line: &str,
    line_no: usize,
    mesh: &mut Mesh
  ) -> Result<BlockOutcome, ParseError> {
    let format = match self.format {
      Some(ref f) => f,
      None => {
        let f = LineFormat::parse(line).ok_or_else(|| ParseError::syntax(
          line_no,
          "malformed NBLOCK format specification",
          line
        ))?;
        self.format = Some(f);
        return Ok(BlockOutcome::Line(LineResponse::Format));
      }
    };
    let trimmed = line.trim();
    if trimmed.is_empty() {
      return Ok(BlockOutcome::Finished);
    }
    if first_token(trimmed) == "-1" {
      return Ok(BlockOutcome::Finished);
    }
    if trimmed.starts_with(|c: char| c.is_ascii_alphabetic()) {
      // ANSYS closes an NBLOCK with a dummy "N,R5.3,LOC,-1," command. Any
      // other directive also ends the table, but gets reprocessed.
      if first_token(trimmed) == "n" {
        return Ok(BlockOutcome::Finished);
      }
      return Ok(BlockOutcome::FinishedReprocess);
    }
    let fields = format
      .read_fields(line)
      .map_err(|bf| bad_field(line_no, bf))?;
    let ints: Vec<&Field> = fields
      .iter()
      .zip(format.fields())
      .filter(|(_, s)| s.kind == FieldKind::Integer)
      .map(|(f, _)| f)
      .collect();
    let reals: Vec<&Field> = fields
      .iter()
      .zip(format.fields())
      .filter(|(_, s)| s.kind == FieldKind::Real)
      .map(|(f, _)| f)
      .collect();
    let id = ints
      .first()
      .and_then(|f| f.int())
      .ok_or_else(|| ParseError::syntax(
        line_no,
        "missing node number in NBLOCK record",
        line.trim()
      ))?;
    if id <= 0 {
      return Err(ParseError::syntax(
        line_no,
        "node number must be positive",
        id.to_string()
      ));
    }
    // the first three real fields are the coordinates; missing trailing
    // fields are zero, since ANSYS drops trailing zero columns
    let real_at = |i: usize| reals.get(i).and_then(|f| f.real());
    let coords = Vector3::new(
      real_at(0).unwrap_or(0.0),
      real_at(1).unwrap_or(0.0),
      real_at(2).unwrap_or(0.0)
    );
    // the next three, when declared and present, are rotation angles
    let rotations = if (3..6).any(|i| real_at(i).is_some()) {
      Some(Vector3::new(
        real_at(3).unwrap_or(0.0),
        real_at(4).unwrap_or(0.0),
        real_at(5).unwrap_or(0.0)
      ))
    } else {
      None
    };
    let node = Node { id: id as usize, coords, rotations };
    if mesh.nodes.insert(node.id, node).is_some() {
      warn!("node {} redefined on line {}; keeping the latest", id, line_no);
    }
    self.read += 1;
    if self.declared.is_some_and(|n| self.read >= n) {
      self.done = true;
    }
    return Ok(BlockOutcome::Line(LineResponse::Data));
  }
}

/// A partially-assembled EBLOCK record whose connectivity continues on the
/// following physical line(s).
struct PendingRecord {
  /// The integer fields collected so far.
  fields: Vec<i64>,
  /// The total field count this record needs, from the declared node
  /// count -- the single source of truth for continuation, never a
  /// heuristic on line shape.
  needed: usize
}

/// Decoder for an EBLOCK element connectivity table.
struct EblockDecoder {
  /// The fixed-field layout, read off the line after the header.
  format: Option<LineFormat>,
  /// The per-line field count declared in the header.
  num_fields: usize,
  /// Whether the SOLID record layout is in effect.
  solid: bool,
  /// The declared record count hint, when the header carried one.
  declared: Option<usize>,
  /// Records read so far.
  read: usize,
  /// A record awaiting continuation lines, if any.
  pending: Option<PendingRecord>,
  /// Set once the declared record count has been reached.
  done: bool
}

impl EblockDecoder {
  /// Instantiates a decoder right after the EBLOCK header line.
  fn new(num_fields: usize, solid: bool, declared: Option<usize>) -> Self {
    return Self {
      format: None,
      num_fields,
      solid,
      declared,
      read: 0,
      pending: None,
      done: false
    };
  }

  /// Consumes one line of the block.
  fn consume(
    &mut self,
    line: &str,
    line_no: usize,
    mesh: &mut Mesh
  ) -> Result<BlockOutcome, ParseError> {
    let format = match self.format {
      Some(ref f) => f,
      None => {
        let f = LineFormat::parse(line).ok_or_else(|| ParseError::syntax(
          line_no,
          "malformed EBLOCK format specification",
          line
        ))?;
        self.format = Some(f);
        return Ok(BlockOutcome::Line(LineResponse::Format));
      }
    };
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('-') {
      if self.pending.is_some() {
        return Err(ParseError::syntax(
          line_no,
          "EBLOCK record terminated before its declared node count was met",
          trimmed
        ));
      }
      return Ok(BlockOutcome::Finished);
    }
    // how many fields this line may carry: the header count for a fresh
    // record, whatever is still owed for a continuation
    let limit = match self.pending {
      Some(ref p) => p.needed - p.fields.len(),
      None => self.num_fields
    };
    let mut fields = collect_integers(format, line, limit, line_no)?;
    if let Some(mut pending) = self.pending.take() {
      pending.fields.append(&mut fields);
      if pending.fields.len() < pending.needed {
        self.pending = Some(pending);
      } else {
        self.finish_record(pending.fields, line_no, mesh)?;
      }
      return Ok(BlockOutcome::Line(LineResponse::Data));
    }
    if self.solid {
      if fields.len() < 11 {
        return Err(ParseError::syntax(
          line_no,
          "EBLOCK SOLID record has fewer than 11 leading fields",
          trimmed
        ));
      }
      let nnodes = fields[8];
      if nnodes <= 0 {
        return Err(ParseError::syntax(
          line_no,
          "EBLOCK record declares a non-positive node count",
          nnodes.to_string()
        ));
      }
      let needed = 11 + nnodes as usize;
      if fields.len() < needed {
        self.pending = Some(PendingRecord { fields, needed });
      } else {
        fields.truncate(needed);
        self.finish_record(fields, line_no, mesh)?;
      }
    } else {
      if fields.len() < 6 {
        return Err(ParseError::syntax(
          line_no,
          "EBLOCK record has fewer than 6 fields",
          trimmed
        ));
      }
      self.finish_record(fields, line_no, mesh)?;
    }
    return Ok(BlockOutcome::Line(LineResponse::Data));
  }

  /// Turns a fully-collected run of record fields into an element.
  fn finish_record(
    &mut self,
    fields: Vec<i64>,
    line_no: usize,
    mesh: &mut Mesh
  ) -> Result<(), ParseError> {
    // SOLID layout: 0 mat, 1 type, 2 real, 8 node count, 10 element
    // number, 11.. connectivity. Without SOLID: 0 element number, 1 type,
    // 2 real, 3 mat, 5.. connectivity on a single record line.
    let (id, etype, material, real_set, raw_nodes) = if self.solid {
      (fields[10], fields[1], fields[0], fields[2], &fields[11..])
    } else {
      (fields[0], fields[1], fields[3], fields[2], &fields[5..])
    };
    if id <= 0 {
      return Err(ParseError::syntax(
        line_no,
        "element number must be positive",
        id.to_string()
      ));
    }
    let mut nodes: Vec<usize> = raw_nodes
      .iter()
      .map(|&n| to_index(n, line_no, "node number"))
      .collect::<Result<_, _>>()?;
    if !self.solid {
      // short records pad the tail with zeros
      while nodes.last() == Some(&0) {
        nodes.pop();
      }
    }
    let element = Element {
      id: id as usize,
      nodes,
      etype: to_index(etype, line_no, "element type index")?,
      material: to_index(material, line_no, "material index")?,
      real_set: to_index(real_set, line_no, "real constant set index")?,
      unresolved_type: false
    };
    if mesh.elements.insert(element.id, element).is_some() {
      warn!(
        "element {} redefined on line {}; keeping the latest", id, line_no
      );
    }
    self.read += 1;
    if self.declared.is_some_and(|n| self.read >= n) {
      self.done = true;
    }
    return Ok(());
  }
}

/// The block decoder the parser is currently delegating lines to.
enum BlockState {
  /// Inside an NBLOCK.
  Nodes(NblockDecoder),
  /// Inside an EBLOCK.
  Elements(EblockDecoder)
}

impl BlockState {
  /// The kind of block this state decodes.
  fn kind(&self) -> BlockKind {
    return match self {
      Self::Nodes(_) => BlockKind::Nodes,
      Self::Elements(_) => BlockKind::Elements
    };
  }

  /// Whether the decoder hit its declared record count.
  fn is_done(&self) -> bool {
    return match self {
      Self::Nodes(d) => d.done,
      Self::Elements(d) => d.done
    };
  }
}

/// This is the CDB parser -- it doesn't care how lines are fed into it.
/// One-pass, single-thread, all state per-call.
pub struct CdbParser {
  /// The mesh being accumulated.
  mesh: Mesh,
  /// The active element type (TYPE cursor).
  current_type: usize,
  /// The active material (MAT cursor).
  current_mat: usize,
  /// The active real-constant set (REAL cursor).
  current_real: usize,
  /// The current element number, for EN,..,NODE continuations.
  current_element: usize,
  /// The decoder for the block we're currently in, if any.
  block: Option<BlockState>,
  /// The total number of consumed lines.
  total_lines: usize
}

impl Default for CdbParser {
  fn default() -> Self {
    return Self::new();
  }
}

impl CdbParser {
  /// Instantiates a new parser. Cursors start at the ANSYS defaults.
  pub fn new() -> Self {
    return Self {
      mesh: Mesh::new(),
      current_type: 1,
      current_mat: 1,
      current_real: 1,
      current_element: 1,
      block: None,
      total_lines: 0
    };
  }

  /// Consumes a line into the parser.
  pub fn consume(&mut self, line: &str) -> Result<ParserResponse, ParseError> {
    self.total_lines += 1;
    // CRLF tolerance
    let line = line.strip_suffix('\r').unwrap_or(line);
    // comment lines are skipped wherever they appear, block tables included
    if line.trim_start().starts_with('!') {
      return Ok(ParserResponse::Comment);
    }
    if let Some(mut state) = self.block.take() {
      let outcome = match state {
        BlockState::Nodes(ref mut d) => {
          d.consume(line, self.total_lines, &mut self.mesh)?
        },
        BlockState::Elements(ref mut d) => {
          d.consume(line, self.total_lines, &mut self.mesh)?
        }
      };
      let kind = state.kind();
      match outcome {
        BlockOutcome::Line(resp) => {
          if state.is_done() {
            debug!(
              "{:?} block hit its declared count on line {}",
              kind,
              self.total_lines
            );
          } else {
            self.block = Some(state);
          }
          return Ok(ParserResponse::InBlock(kind, resp));
        },
        BlockOutcome::Finished => {
          debug!("{:?} block ended on line {}", kind, self.total_lines);
          return Ok(ParserResponse::InBlock(kind, LineResponse::Done));
        },
        BlockOutcome::FinishedReprocess => {
          debug!(
            "{:?} block ended by a directive on line {}",
            kind,
            self.total_lines
          );
          // fall through: the line belongs to the state machine
        }
      }
    }
    return self.handle_directive(line);
  }

  /// Handles a line outside any block.
  fn handle_directive(
    &mut self,
    line: &str
  ) -> Result<ParserResponse, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
      return Ok(ParserResponse::Blank);
    }
    let tokens = split_directive(trimmed);
    return match tokens[0].as_str() {
      "n" => self.read_n(&tokens),
      "en" => self.read_en(&tokens),
      "et" => self.read_et(&tokens),
      "type" => self.read_selector(&tokens, SelectorKind::ElementType),
      "mat" => self.read_selector(&tokens, SelectorKind::Material),
      "real" => self.read_selector(&tokens, SelectorKind::RealSet),
      "nblock" => self.begin_nblock(&tokens),
      "eblock" => self.begin_eblock(&tokens),
      other => {
        debug!(
          "skipping unrecognised command {:?} on line {}",
          other,
          self.total_lines
        );
        Ok(ParserResponse::Unknown)
      }
    };
  }

  /// Reads an N command, in either the bare `N,id,x,y,z` form or the
  /// archive `N,R5.3,LOC/ANG,...` form ANSYS writes.
  fn read_n(&mut self, tokens: &[String]) -> Result<ParserResponse, ParseError> {
    if tokens.len() >= 3 && is_revision(&tokens[1]) {
      return self.read_n_archive(tokens);
    }
    let id = match self.n_node_number(tokens.get(1))? {
      Some(id) => id,
      None => return Ok(ParserResponse::Unknown)
    };
    let coords = Vector3::new(
      self.opt_real(tokens, 2)?.unwrap_or(0.0),
      self.opt_real(tokens, 3)?.unwrap_or(0.0),
      self.opt_real(tokens, 4)?.unwrap_or(0.0)
    );
    let angles = [
      self.opt_real(tokens, 5)?,
      self.opt_real(tokens, 6)?,
      self.opt_real(tokens, 7)?
    ];
    let rotations = if angles.iter().any(|a| a.is_some()) {
      Some(Vector3::new(
        angles[0].unwrap_or(0.0),
        angles[1].unwrap_or(0.0),
        angles[2].unwrap_or(0.0)
      ))
    } else {
      None
    };
    self.insert_node(Node { id, coords, rotations });
    return Ok(ParserResponse::Node(id));
  }

  /// Reads the archive form of the N command:
  /// `N,R5.3,LOC,node,solid,parm,x,y,z` or `N,R5.3,ANG,node,thxy,thyz,thzx`.
  fn read_n_archive(
    &mut self,
    tokens: &[String]
  ) -> Result<ParserResponse, ParseError> {
    match tokens[2].as_str() {
      "loc" => {
        let id = match self.n_node_number(tokens.get(3))? {
          Some(id) => id,
          None => return Ok(ParserResponse::Unknown)
        };
        let coords = Vector3::new(
          self.opt_real(tokens, 6)?.unwrap_or(0.0),
          self.opt_real(tokens, 7)?.unwrap_or(0.0),
          self.opt_real(tokens, 8)?.unwrap_or(0.0)
        );
        self.insert_node(Node { id, coords, rotations: None });
        return Ok(ParserResponse::Node(id));
      },
      "ang" => {
        let id = match self.n_node_number(tokens.get(3))? {
          Some(id) => id,
          None => return Ok(ParserResponse::Unknown)
        };
        let rotations = Vector3::new(
          self.opt_real(tokens, 4)?.unwrap_or(0.0),
          self.opt_real(tokens, 5)?.unwrap_or(0.0),
          self.opt_real(tokens, 6)?.unwrap_or(0.0)
        );
        if let Some(node) = self.mesh.nodes.get_mut(&id) {
          node.rotations = Some(rotations);
        } else {
          warn!(
            "line {} sets angles on undefined node {}; ignored",
            self.total_lines,
            id
          );
        }
        return Ok(ParserResponse::Node(id));
      },
      other => {
        debug!(
          "skipping N command with unknown key {:?} on line {}",
          other,
          self.total_lines
        );
        return Ok(ParserResponse::Unknown);
      }
    }
  }

  /// Reads an EN command, in either the bare `EN,id,n1,...` form or the
  /// archive `EN,R5.5,ATTR/NODE,...` form.
  fn read_en(
    &mut self,
    tokens: &[String]
  ) -> Result<ParserResponse, ParseError> {
    if tokens.len() >= 3 && is_revision(&tokens[1]) {
      return self.read_en_archive(tokens);
    }
    let id = self.req_index(tokens.get(1), "element number")?;
    let mut nodes: Vec<usize> = Vec::with_capacity(tokens.len() - 2);
    for token in &tokens[2..] {
      if token.is_empty() {
        continue;
      }
      nodes.push(self.parse_index(token, "node number")?);
    }
    self.current_element = id;
    let element = Element {
      id,
      nodes,
      etype: self.current_type,
      material: self.current_mat,
      real_set: self.current_real,
      unresolved_type: false
    };
    self.insert_element(element);
    return Ok(ParserResponse::Element(id));
  }

  /// Reads the archive form of the EN command. ATTR records set the
  /// attribute selections (and element number); NODE records append
  /// connectivity to the current element.
  fn read_en_archive(
    &mut self,
    tokens: &[String]
  ) -> Result<ParserResponse, ParseError> {
    match tokens[2].as_str() {
      "attr" => {
        // blank and zero attributes fall back to the cursors; archive
        // files stamp unset attributes as 0
        let material = self.attr_index(tokens, 4, self.current_mat)?;
        let etype = self.attr_index(tokens, 5, self.current_type)?;
        let real_set = self.attr_index(tokens, 6, self.current_real)?;
        self.current_element =
          self.attr_index(tokens, 9, self.current_element)?;
        let id = self.current_element;
        let entry = self.mesh.elements.entry(id).or_insert(Element {
          id,
          nodes: Vec::new(),
          etype,
          material,
          real_set,
          unresolved_type: false
        });
        entry.material = material;
        entry.etype = etype;
        entry.real_set = real_set;
        return Ok(ParserResponse::Element(id));
      },
      "node" => {
        let mut nodes: Vec<usize> = Vec::new();
        for token in tokens.get(4..).unwrap_or(&[]) {
          if token.is_empty() {
            continue;
          }
          nodes.push(self.parse_index(token, "node number")?);
        }
        let id = self.current_element;
        let (etype, material, real_set) =
          (self.current_type, self.current_mat, self.current_real);
        let entry = self.mesh.elements.entry(id).or_insert(Element {
          id,
          nodes: Vec::new(),
          etype,
          material,
          real_set,
          unresolved_type: false
        });
        entry.nodes.extend(nodes);
        return Ok(ParserResponse::Element(id));
      },
      other => {
        debug!(
          "skipping EN command with unknown key {:?} on line {}",
          other,
          self.total_lines
        );
        return Ok(ParserResponse::Unknown);
      }
    }
  }

  /// Reads an ET command: registers (or overwrites) an element-type
  /// definition and moves the TYPE cursor to it. A blank index defaults to
  /// one past the current maximum.
  fn read_et(
    &mut self,
    tokens: &[String]
  ) -> Result<ParserResponse, ParseError> {
    let index = match tokens.get(1).map(String::as_str) {
      None | Some("") => {
        self.mesh.element_types.keys().max().copied().unwrap_or(0) + 1
      },
      Some(raw) => self.parse_index(raw, "element type index")?
    };
    let name = match tokens.get(2).map(String::as_str) {
      None | Some("") => {
        return Err(ParseError::syntax(
          self.total_lines,
          "ET command is missing the element type name",
          tokens.join(",")
        ));
      },
      Some(name) => name
    };
    let def = ElementTypeDef::new(index, name);
    if self.mesh.element_types.insert(index, def).is_some() {
      warn!(
        "element type {} redefined on line {}; keeping the latest",
        index,
        self.total_lines
      );
    }
    self.current_type = index;
    return Ok(ParserResponse::TypeDefined(index));
  }

  /// Reads a TYPE/MAT/REAL command and moves the matching cursor. Indices
  /// are accepted without a prior ET -- they're only validated lazily,
  /// when an element using them is finalised.
  fn read_selector(
    &mut self,
    tokens: &[String],
    kind: SelectorKind
  ) -> Result<ParserResponse, ParseError> {
    let index = self.opt_index(tokens, 1)?.unwrap_or(1);
    match kind {
      SelectorKind::ElementType => self.current_type = index,
      SelectorKind::Material => self.current_mat = index,
      SelectorKind::RealSet => self.current_real = index
    }
    return Ok(ParserResponse::Selector(kind, index));
  }

  /// Reads an NBLOCK header and enters the node table.
  fn begin_nblock(
    &mut self,
    tokens: &[String]
  ) -> Result<ParserResponse, ParseError> {
    // NBLOCK,NUMFIELD,Solkey,NDmax,NDsel -- the counts are hints only
    self.req_index(tokens.get(1), "NBLOCK field count")?;
    let declared = tokens
      .get(4)
      .and_then(|t| t.parse::<usize>().ok())
      .or_else(|| tokens.get(3).and_then(|t| t.parse::<usize>().ok()));
    self.block = Some(BlockState::Nodes(NblockDecoder::new(declared)));
    debug!("NBLOCK opened on line {}", self.total_lines);
    return Ok(ParserResponse::BeginBlock(BlockKind::Nodes));
  }

  /// Reads an EBLOCK header and enters the element table.
  fn begin_eblock(
    &mut self,
    tokens: &[String]
  ) -> Result<ParserResponse, ParseError> {
    // EBLOCK,NUM_NODES,Solkey,count
    let num_fields = self.req_index(tokens.get(1), "EBLOCK field count")?;
    let solid = tokens.get(2).map(String::as_str) == Some("solid");
    let declared = tokens.get(3).and_then(|t| t.parse::<usize>().ok());
    self.block = Some(BlockState::Elements(
      EblockDecoder::new(num_fields, solid, declared)
    ));
    debug!("EBLOCK opened on line {}", self.total_lines);
    return Ok(ParserResponse::BeginBlock(BlockKind::Elements));
  }

  /// Inserts a node, warning on redefinition (last write wins).
  fn insert_node(&mut self, node: Node) {
    let id = node.id;
    if self.mesh.nodes.insert(id, node).is_some() {
      warn!(
        "node {} redefined on line {}; keeping the latest",
        id,
        self.total_lines
      );
    }
  }

  /// Inserts an element, warning on redefinition (last write wins).
  fn insert_element(&mut self, element: Element) {
    let id = element.id;
    if self.mesh.elements.insert(id, element).is_some() {
      warn!(
        "element {} redefined on line {}; keeping the latest",
        id,
        self.total_lines
      );
    }
  }

  /// Parses the node number of an N command. ANSYS writes a dummy
  /// `N,R5.3,LOC,-1,` trailer after a count-terminated NBLOCK, so a
  /// non-positive number is `None` -- the whole line is a no-op -- rather
  /// than an error. Absent or malformed numbers still are.
  fn n_node_number(
    &self,
    token: Option<&String>
  ) -> Result<Option<usize>, ParseError> {
    return match token.map(String::as_str) {
      None | Some("") => Err(ParseError::syntax(
        self.total_lines,
        "missing node number",
        ""
      )),
      Some(raw) => match raw.parse::<i64>() {
        Ok(x) if x > 0 => Ok(Some(x as usize)),
        Ok(_) => Ok(None),
        Err(_) => Err(ParseError::syntax(
          self.total_lines,
          "malformed node number",
          raw
        ))
      }
    };
  }

  /// Parses a required positive index from a directive argument.
  fn req_index(
    &self,
    token: Option<&String>,
    what: &str
  ) -> Result<usize, ParseError> {
    return match token.map(String::as_str) {
      None | Some("") => Err(ParseError::syntax(
        self.total_lines,
        format!("missing {what}"),
        ""
      )),
      Some(raw) => self.parse_index(raw, what)
    };
  }

  /// Parses a positive index from a token, with a syntax error naming the
  /// token otherwise.
  fn parse_index(&self, raw: &str, what: &str) -> Result<usize, ParseError> {
    return match raw.parse::<i64>() {
      Ok(x) if x > 0 => Ok(x as usize),
      Ok(_) => Err(ParseError::syntax(
        self.total_lines,
        format!("{what} must be positive"),
        raw
      )),
      Err(_) => Err(ParseError::syntax(
        self.total_lines,
        format!("malformed {what}"),
        raw
      ))
    };
  }

  /// Parses an ATTR attribute field: absent, blank, or zero means "keep
  /// the cursor value", anything else must be a positive index.
  fn attr_index(
    &self,
    tokens: &[String],
    i: usize,
    cursor: usize
  ) -> Result<usize, ParseError> {
    return match tokens.get(i).map(String::as_str) {
      None | Some("") | Some("0") => Ok(cursor),
      Some(raw) => self.parse_index(raw, "index")
    };
  }

  /// Parses an optional positive index: absent or blank is `None`, present
  /// but malformed is an error.
  fn opt_index(
    &self,
    tokens: &[String],
    i: usize
  ) -> Result<Option<usize>, ParseError> {
    return match tokens.get(i).map(String::as_str) {
      None | Some("") => Ok(None),
      Some(raw) => self.parse_index(raw, "index").map(Some)
    };
  }

  /// Parses an optional real argument: absent or blank is `None`, present
  /// but malformed is an error -- never a silent zero.
  fn opt_real(
    &self,
    tokens: &[String],
    i: usize
  ) -> Result<Option<f64>, ParseError> {
    return match tokens.get(i).map(String::as_str) {
      None | Some("") => Ok(None),
      Some(raw) => match decode_fortran_real(raw) {
        Some(v) => Ok(Some(v)),
        None => Err(ParseError::syntax(
          self.total_lines,
          "malformed real value",
          raw
        ))
      }
    };
  }

  /// Finishes up: validates element connectivity against the node set and
  /// flags elements whose type index was never registered. This is the
  /// only point a mesh ever leaves the parser, so no partial result can be
  /// observed on failure.
  pub fn finish(self) -> Result<Mesh, ParseError> {
    let mut mesh = self.mesh;
    let nodes = &mesh.nodes;
    let types = &mesh.element_types;
    for element in mesh.elements.values_mut() {
      for nid in element.nodes.iter().copied() {
        if !nodes.contains_key(&nid) {
          return Err(ParseError::MissingNode {
            element: element.id,
            node: nid
          });
        }
      }
      if !types.contains_key(&element.etype) {
        warn!(
          "element {} uses type index {} with no ET definition",
          element.id,
          element.etype
        );
        element.unresolved_type = true;
      }
    }
    return Ok(mesh);
  }

  /// Parses from a BufRead instance.
  pub fn parse_bufread<R: BufRead>(reader: R) -> Result<Mesh, ParseError> {
    let mut parser = Self::new();
    for line in reader.lines() {
      parser.consume(&line?)?;
    }
    return parser.finish();
  }

  /// Utility method -- reads and parses a file.
  pub fn parse_file<P: AsRef<Path>>(p: P) -> Result<Mesh, ParseError> {
    let file = File::open(p.as_ref())?;
    return Self::parse_bufread(BufReader::new(file));
  }
}

/// The first comma-delimited token of a line, trimmed and lowercased.
fn first_token(line: &str) -> String {
  return line
    .split(',')
    .next()
    .unwrap_or("")
    .trim()
    .to_ascii_lowercase();
}

/// Checks whether a directive argument is an archive revision marker like
/// `R5.3`.
fn is_revision(token: &str) -> bool {
  return token.starts_with('r') && token[1..].parse::<f64>().is_ok();
}

/// Wraps a field decoding failure into a full syntax error.
fn bad_field(line_no: usize, bf: BadField) -> ParseError {
  let kind = match bf.kind {
    FieldKind::Integer => "integer",
    FieldKind::Real => "real",
    FieldKind::Text => "text"
  };
  return ParseError::syntax(
    line_no,
    format!("malformed {} in field {}", kind, bf.index + 1),
    bf.token
  );
}

/// Collects up to `limit` integer fields off a fixed-width line, stopping
/// at the first absent field.
fn collect_integers(
  format: &LineFormat,
  line: &str,
  limit: usize,
  line_no: usize
) -> Result<Vec<i64>, ParseError> {
  let mut out: Vec<i64> = Vec::new();
  for i in 0..limit.min(format.len()) {
    let token = format.slice(line, i).trim();
    if token.is_empty() {
      break;
    }
    match token.parse::<i64>() {
      Ok(v) => out.push(v),
      Err(_) => {
        return Err(ParseError::syntax(
          line_no,
          format!("malformed integer in field {}", i + 1),
          token
        ));
      }
    }
  }
  return Ok(out);
}

/// Converts a non-negative record field to an index, erroring on negatives.
fn to_index(v: i64, line_no: usize, what: &str) -> Result<usize, ParseError> {
  if v < 0 {
    return Err(ParseError::syntax(
      line_no,
      format!("{what} cannot be negative"),
      v.to_string()
    ));
  }
  return Ok(v as usize);
}
