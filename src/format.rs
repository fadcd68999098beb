//! This module implements the field reader: Fortran-style format
//! specifications as declared under NBLOCK/EBLOCK headers, fixed-width field
//! extraction tolerant of short lines, lenient decoding of Fortran real
//! literals, and the overflow-checked formatting used on the write path.

use serde::{Deserialize, Serialize};

/// The kind of datum a fixed-width field holds.
#[derive(
  Copy, Clone, Debug, Serialize, Deserialize, PartialOrd, Ord, PartialEq, Eq
)]
pub enum FieldKind {
  /// An integer field, like `i8`.
  Integer,
  /// A real field, like `e16.9`, `f10.3` or `g16.9`.
  Real,
  /// A character field, like `a8`.
  Text
}

/// One fixed-width field slot: its kind, width and (for reals) precision.
#[derive(
  Copy, Clone, Debug, Serialize, Deserialize, PartialOrd, Ord, PartialEq, Eq
)]
pub struct FieldSpec {
  /// The kind of datum in the field.
  pub kind: FieldKind,
  /// The field width, in characters.
  pub width: usize,
  /// Digits after the point, for real fields. Zero otherwise.
  pub precision: usize
}

/// A typed value read out of a field.
#[derive(Clone, Debug, PartialEq, derive_more::From)]
pub enum Field {
  /// An integer value.
  Integer(i64),
  /// A real value.
  Real(f64),
  /// A character value.
  Text(String),
  /// The field was absent or all-blank. Callers default these to zero --
  /// blank is not an error, only malformed text is.
  Blank
}

impl Field {
  /// Returns the integer value, if there is one.
  pub fn int(&self) -> Option<i64> {
    return match self {
      Self::Integer(x) => Some(*x),
      _ => None
    };
  }

  /// Returns the integer value, or zero for a blank field.
  pub fn int_or_zero(&self) -> i64 {
    return self.int().unwrap_or(0);
  }

  /// Returns the value as a real, widening integers.
  pub fn real(&self) -> Option<f64> {
    return match self {
      Self::Integer(x) => Some(*x as f64),
      Self::Real(x) => Some(*x),
      _ => None
    };
  }

  /// True iff the field was absent or all-blank.
  pub fn is_blank(&self) -> bool {
    return matches!(self, Self::Blank);
  }
}

/// A field that failed to decode: which one, and the offending text. The
/// parser wraps this into a full syntax error with the line number.
#[derive(Clone, Debug)]
pub(crate) struct BadField {
  /// The 0-based index of the field within the line.
  pub(crate) index: usize,
  /// The kind the format declared for it.
  pub(crate) kind: FieldKind,
  /// The offending token text.
  pub(crate) token: String
}

/// The flattened fixed-field layout declared under a block header, one
/// [`FieldSpec`] per field -- `(3i8,6e16.9)` becomes three integer slots
/// followed by six real slots.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineFormat {
  /// The fields, in line order.
  fields: Vec<FieldSpec>
}

impl LineFormat {
  /// Parses a format line like `(3i8,6e16.9)`. Returns `None` if no field
  /// can be made out of it.
  pub fn parse(line: &str) -> Option<Self> {
    let start = line.find('(').map(|i| i + 1).unwrap_or(0);
    let end = line.rfind(')').unwrap_or(line.len());
    let inner = line.get(start..end)?;
    let mut fields: Vec<FieldSpec> = Vec::new();
    for item in inner.split(',') {
      let item = item.trim().to_ascii_lowercase();
      let mut chars = item.chars().peekable();
      let mut count: usize = 0;
      let mut seen_count = false;
      while let Some(c) = chars.peek().copied() {
        if let Some(d) = c.to_digit(10) {
          count = count * 10 + d as usize;
          seen_count = true;
          chars.next();
        } else {
          break;
        }
      }
      if !seen_count {
        count = 1;
      }
      let kind = match chars.next() {
        Some('i') => FieldKind::Integer,
        Some('e' | 'f' | 'g' | 'd') => FieldKind::Real,
        Some('a') => FieldKind::Text,
        _ => continue
      };
      let rest: String = chars.collect();
      let (raw_width, raw_precision) = match rest.split_once('.') {
        Some((w, p)) => (w, p),
        None => (rest.as_str(), "")
      };
      let width: usize = match raw_width.parse() {
        Ok(w) => w,
        Err(_) => continue
      };
      let precision: usize = raw_precision.parse().unwrap_or(0);
      for _ in 0..count {
        fields.push(FieldSpec { kind, width, precision });
      }
    }
    if fields.is_empty() {
      return None;
    }
    return Some(Self { fields });
  }

  /// The number of fields one full line carries.
  pub fn len(&self) -> usize {
    return self.fields.len();
  }

  /// True iff the format declares no fields at all.
  pub fn is_empty(&self) -> bool {
    return self.fields.is_empty();
  }

  /// The field slots, in line order.
  pub fn fields(&self) -> &[FieldSpec] {
    return &self.fields;
  }

  /// Slices the raw text of field `index` out of a line. Fields beyond the
  /// end of a short line come back empty.
  pub fn slice<'l>(&self, line: &'l str, index: usize) -> &'l str {
    let start: usize = self.fields[..index].iter().map(|f| f.width).sum();
    let end = start + self.fields[index].width;
    return line
      .get(start..end.min(line.len()))
      .or_else(|| line.get(start..))
      .unwrap_or("");
  }

  /// Reads every declared field off a line, in order. Fields missing off
  /// the end of a short line come back [`Field::Blank`]; text that is
  /// present but does not decode is an error.
  pub(crate) fn read_fields(&self, line: &str) -> Result<Vec<Field>, BadField> {
    let mut out: Vec<Field> = Vec::with_capacity(self.fields.len());
    for (i, spec) in self.fields.iter().enumerate() {
      let raw = self.slice(line, i);
      let token = raw.trim();
      if token.is_empty() {
        out.push(Field::Blank);
        continue;
      }
      let bad = || BadField { index: i, kind: spec.kind, token: token.into() };
      match spec.kind {
        FieldKind::Integer => match token.parse::<i64>() {
          Ok(x) => out.push(Field::Integer(x)),
          Err(_) => return Err(bad())
        },
        FieldKind::Real => match decode_fortran_real(token) {
          Some(x) => out.push(Field::Real(x)),
          None => return Err(bad())
        },
        FieldKind::Text => out.push(Field::Text(token.to_string()))
      }
    }
    return Ok(out);
  }
}

/// Decodes a Fortran-flavoured real literal. Hyper-lenient and doesn't
/// require pulling a whole regex library: accepts ordinary `1.5e-3`, the
/// `D`-exponent spelling `1.5D-3`, and the bare embedded-sign exponent
/// `1.5-3`. Returns `None` for anything else -- malformed text must surface
/// as an error upstream, never as a zero.
pub fn decode_fortran_real(s: &str) -> Option<f64> {
  let t = s.trim();
  if t.is_empty() {
    return None;
  }
  if let Ok(v) = t.parse::<f64>() {
    return Some(v);
  }
  let lowered = t.to_ascii_lowercase().replace('d', "e");
  if let Ok(v) = lowered.parse::<f64>() {
    return Some(v);
  }
  // embedded exponent with no separator, e.g. "1.5-3" meaning 1.5e-3
  if let Some(pos) = lowered.rfind(['+', '-']) {
    if pos > 0 && !lowered[..pos].ends_with('e') {
      let (m, e) = lowered.split_at(pos);
      let mantissa: f64 = m.parse().ok()?;
      let exponent: i32 = e.parse().ok()?;
      return Some(mantissa * 10f64.powi(exponent));
    }
  }
  return None;
}

/// Splits a directive line into its comma-delimited arguments, trimmed and
/// lowercased. Command names are case-insensitive in CDB.
pub(crate) fn split_directive(line: &str) -> Vec<String> {
  return line
    .split(',')
    .map(|t| t.trim().to_ascii_lowercase())
    .collect();
}

/// Right-aligns an integer into a fixed-width field. `None` if it won't fit
/// -- the writer reports that as an overflow instead of truncating.
pub fn format_integer(v: i64, width: usize) -> Option<String> {
  let s = v.to_string();
  if s.len() > width {
    return None;
  }
  return Some(format!("{s:>width$}"));
}

/// Right-aligns a real into a fixed-width field in scientific notation with
/// the given precision. `None` if it won't fit.
pub fn format_real(v: f64, width: usize, precision: usize) -> Option<String> {
  let s = format!("{v:.precision$e}");
  if s.len() > width {
    return None;
  }
  return Some(format!("{s:>width$}"));
}
