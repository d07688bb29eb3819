//! Placeholder parsing and substitution.
//!
//! Derivations refer to store paths that are not known until their inputs
//! are built. Those references are written as placeholders and replaced with
//! real paths right before the builder runs.
//!
//! # Placeholder Formats
//!
//! - `$${drv:<id>:<output>}` - an output of another derivation
//! - `$${src:<entry>}` - a source imported into the store
//! - `$${out}` / `$${out:<output>}` - an output directory of the derivation being built
//!
//! Single `$` characters pass through unchanged, so shell variables like
//! `$HOME` need no escaping. `$$${` produces a literal `$${`.
//!
//! # Example
//!
//! ```
//! use bramble_lib::derivation::placeholder::{parse, Placeholder, Segment};
//!
//! let segments = parse("$${drv:abc:out}/bin:$PATH").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Placeholder(Placeholder::Derivation { id: "abc".into(), output: "out".into() }),
//!     Segment::Literal("/bin:$PATH".to_string()),
//! ]);
//! ```

use thiserror::Error;

use crate::consts::DEFAULT_OUTPUT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  Derivation { id: String, output: String },
  Source(String),
  Out(String),
}

impl Placeholder {
  pub fn render(&self) -> String {
    match self {
      Placeholder::Derivation { id, output } => format!("$${{drv:{id}:{output}}}"),
      Placeholder::Source(entry) => format!("$${{src:{entry}}}"),
      Placeholder::Out(output) if output == DEFAULT_OUTPUT => "$${out}".to_string(),
      Placeholder::Out(output) => format!("$${{out:{output}}}"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Literal(String),
  Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder type: {0}")]
  UnknownType(String),

  #[error("malformed placeholder: {0}")]
  Malformed(String),

  #[error("unresolved derivation output {id}:{output}")]
  UnresolvedDerivation { id: String, output: String },

  #[error("unresolved source {0}")]
  UnresolvedSource(String),

  #[error("unknown output {0:?}")]
  UnresolvedOut(String),
}

/// Supplies concrete paths for placeholders.
pub trait Resolver {
  fn resolve_derivation(&self, id: &str, output: &str) -> Result<&str, PlaceholderError>;

  fn resolve_source(&self, entry: &str) -> Result<&str, PlaceholderError>;

  fn resolve_out(&self, output: &str) -> Result<&str, PlaceholderError>;
}

/// Split `input` into literal text and placeholders.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut rest = input;
  let mut offset = 0;

  while let Some(pos) = rest.find("$${") {
    if pos > 0 && rest.as_bytes()[pos - 1] == b'$' {
      literal.push_str(&rest[..pos - 1]);
      literal.push_str("$${");
      rest = &rest[pos + 3..];
      offset += pos + 3;
      continue;
    }

    literal.push_str(&rest[..pos]);
    let body_start = pos + 3;
    let close = rest[body_start..]
      .find('}')
      .ok_or(PlaceholderError::Unclosed(offset + pos))?;

    if !literal.is_empty() {
      segments.push(Segment::Literal(std::mem::take(&mut literal)));
    }
    segments.push(Segment::Placeholder(parse_body(&rest[body_start..body_start + close])?));

    let consumed = body_start + close + 1;
    rest = &rest[consumed..];
    offset += consumed;
  }

  literal.push_str(rest);
  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }
  Ok(segments)
}

fn parse_body(body: &str) -> Result<Placeholder, PlaceholderError> {
  if body == "out" {
    return Ok(Placeholder::Out(DEFAULT_OUTPUT.to_string()));
  }

  let (kind, rest) = body
    .split_once(':')
    .ok_or_else(|| PlaceholderError::Malformed(format!("missing colon in '{body}'")))?;
  if rest.is_empty() {
    return Err(PlaceholderError::Malformed(format!("empty reference in '{body}'")));
  }

  match kind {
    "drv" => {
      let (id, output) = rest
        .split_once(':')
        .ok_or_else(|| PlaceholderError::Malformed(format!("derivation placeholder missing output: '{body}'")))?;
      Ok(Placeholder::Derivation {
        id: id.to_string(),
        output: output.to_string(),
      })
    }
    "src" => Ok(Placeholder::Source(rest.to_string())),
    "out" => Ok(Placeholder::Out(rest.to_string())),
    _ => Err(PlaceholderError::UnknownType(kind.to_string())),
  }
}

/// Every placeholder in `input`, in order.
pub fn references(input: &str) -> Result<Vec<Placeholder>, PlaceholderError> {
  Ok(
    parse(input)?
      .into_iter()
      .filter_map(|segment| match segment {
        Segment::Placeholder(p) => Some(p),
        Segment::Literal(_) => None,
      })
      .collect(),
  )
}

/// Replace every placeholder in `input` using `resolver`.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::with_capacity(input.len());
  for segment in parse(input)? {
    match segment {
      Segment::Literal(text) => result.push_str(&text),
      Segment::Placeholder(Placeholder::Derivation { id, output }) => {
        result.push_str(resolver.resolve_derivation(&id, &output)?)
      }
      Segment::Placeholder(Placeholder::Source(entry)) => result.push_str(resolver.resolve_source(&entry)?),
      Segment::Placeholder(Placeholder::Out(output)) => result.push_str(resolver.resolve_out(&output)?),
    }
  }
  Ok(result)
}
