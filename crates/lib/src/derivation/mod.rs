//! Derivations: immutable descriptions of a single build step.
//!
//! A derivation names a builder, its arguments and environment, the other
//! derivations whose outputs it consumes, the sources it copies in, the
//! outputs it promises, and how its output hash is determined. Its identity
//! is the hash of that description, so two evaluations that describe the
//! same step agree on the identity regardless of where the store lives.

pub mod placeholder;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{DEFAULT_OUTPUT, DRV_RECORD_EXTENSION};
use crate::util::hash::{HashError, Hashable, hash_bytes};
use placeholder::{Placeholder, PlaceholderError};

/// Builder name for downloads performed by bramble itself.
pub const FETCH_URL_BUILDER: &str = "builtin:fetch_url";

/// Identity hash of a [`Derivation`], truncated like store names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DerivationId(pub String);

impl std::fmt::Display for DerivationId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// How the output hash of a derivation is decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HashMode {
  /// Whatever the builder produces, hashed after the build.
  Content,
  /// The output must hash to exactly this SHA-256.
  Fixed { sha256: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivation {
  pub name: String,
  pub builder: String,
  #[serde(default)]
  pub args: Vec<String>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  /// Derivations whose outputs are referenced from `builder`, `args` or `env`.
  #[serde(default)]
  pub inputs: BTreeSet<DerivationId>,
  /// File name in the build directory -> store entry.
  #[serde(default)]
  pub sources: BTreeMap<String, String>,
  pub outputs: Vec<String>,
  pub hash_mode: HashMode,
}

impl Hashable for Derivation {}

#[derive(Debug, Error)]
pub enum DerivationError {
  #[error("invalid derivation name {0:?}")]
  InvalidName(String),

  #[error("derivation {0:?} has no builder")]
  MissingBuilder(String),

  #[error("derivation {name:?} declares invalid output {output:?}")]
  InvalidOutput { name: String, output: String },

  #[error("fixed-output derivation {0:?} must have exactly one output")]
  FixedOutputCount(String),

  #[error("derivation {name:?} refers to an output {output:?} it does not declare")]
  UnknownOutput { name: String, output: String },

  #[error(transparent)]
  Placeholder(#[from] PlaceholderError),

  #[error("failed to hash derivation: {0}")]
  Hash(#[from] HashError),
}

impl Derivation {
  /// A content-mode derivation with the default output.
  pub fn new(name: impl Into<String>, builder: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      builder: builder.into(),
      args: Vec::new(),
      env: BTreeMap::new(),
      inputs: BTreeSet::new(),
      sources: BTreeMap::new(),
      outputs: vec![DEFAULT_OUTPUT.to_string()],
      hash_mode: HashMode::Content,
    }
  }

  pub fn id(&self) -> Result<DerivationId, HashError> {
    Ok(DerivationId(self.content_hash()?.store_name().to_string()))
  }

  /// Name of the `.drv` record for this derivation.
  pub fn record_name(&self, id: &DerivationId) -> String {
    format!("{}-{}{DRV_RECORD_EXTENSION}", id, self.name)
  }

  /// Store label for one of this derivation's outputs.
  pub fn output_label(&self, output: &str) -> String {
    if output == DEFAULT_OUTPUT {
      self.name.clone()
    } else {
      format!("{}-{}", self.name, output)
    }
  }

  pub fn is_builtin_fetch(&self) -> bool {
    self.builder == FETCH_URL_BUILDER
  }

  pub fn fixed_hash(&self) -> Option<&str> {
    match &self.hash_mode {
      HashMode::Fixed { sha256 } => Some(sha256),
      HashMode::Content => None,
    }
  }

  /// Check the description and fill `inputs` from the placeholders in
  /// `builder`, `args` and `env`.
  pub fn finalize(mut self) -> Result<Self, DerivationError> {
    if !valid_name(&self.name) {
      return Err(DerivationError::InvalidName(self.name));
    }
    if self.builder.is_empty() {
      return Err(DerivationError::MissingBuilder(self.name));
    }
    if self.outputs.is_empty() {
      self.outputs.push(DEFAULT_OUTPUT.to_string());
    }
    let mut seen = BTreeSet::new();
    for output in &self.outputs {
      if !valid_name(output) || !seen.insert(output.as_str()) {
        return Err(DerivationError::InvalidOutput {
          name: self.name.clone(),
          output: output.clone(),
        });
      }
    }
    if matches!(self.hash_mode, HashMode::Fixed { .. }) && self.outputs.len() != 1 {
      return Err(DerivationError::FixedOutputCount(self.name));
    }

    let mut inputs = BTreeSet::new();
    let texts = std::iter::once(&self.builder)
      .chain(self.args.iter())
      .chain(self.env.values());
    for text in texts {
      for reference in placeholder::references(text)? {
        match reference {
          Placeholder::Derivation { id, .. } => {
            inputs.insert(DerivationId(id));
          }
          Placeholder::Out(output) if !self.outputs.contains(&output) => {
            return Err(DerivationError::UnknownOutput {
              name: self.name.clone(),
              output,
            });
          }
          _ => {}
        }
      }
    }
    self.inputs.extend(inputs);
    Ok(self)
  }
}

/// Placeholder for one output of the derivation `id`.
pub fn output_placeholder(id: &DerivationId, output: &str) -> String {
  Placeholder::Derivation {
    id: id.0.clone(),
    output: output.to_string(),
  }
  .render()
}

/// A derivation name for a download: the last path segment of `url`, or a
/// hash of the URL when that segment is unusable.
pub fn fetch_url_name(url: &str) -> String {
  let last = url.rsplit('/').next().unwrap_or_default();
  let last = last.split(['?', '#']).next().unwrap_or_default();
  let sanitized: String = last
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+') { c } else { '_' })
    .collect();
  if valid_name(&sanitized) {
    sanitized
  } else {
    format!("download-{}", &hash_bytes(url.as_bytes()).as_str()[..16])
  }
}

fn valid_name(name: &str) -> bool {
  !name.is_empty()
    && name != "."
    && name != ".."
    && name
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
}

/// What a successful build leaves behind in the store, keyed by identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationRecord {
  pub id: DerivationId,
  pub derivation: Derivation,
  /// Output name -> store entry name.
  pub outputs: BTreeMap<String, String>,
}
