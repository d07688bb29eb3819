//! Length-stable store directory allocation.
//!
//! Every installation pads its store directory so that the store prefix
//! (store directory plus trailing separator) is exactly [`PADDING_TARGET_LEN`]
//! characters. Artifacts that embed store paths can then be moved between
//! installations by rewriting the prefix in place without resizing them.

use crate::consts::{CANONICAL_STORE_PARENT, PADDING_TARGET_LEN, PADDING_TOKEN};
use crate::store::StoreError;

/// Compute the padding path appended to `parent`.
///
/// The result starts with a separator and is made of `/`-separated copies of
/// [`PADDING_TOKEN`] followed by a partial token, sized so that
/// `parent + result + "/"` has exactly `target` characters.
pub fn padded_directory_name(parent: &str, target: usize) -> Result<String, StoreError> {
  // one separator before the padding and one after the store directory
  let remaining = target as isize - parent.len() as isize - 2;
  if remaining <= 0 {
    return Err(StoreError::PathTooLong {
      parent: parent.to_string(),
      target,
    });
  }
  let remaining = remaining as usize;

  let token_len = PADDING_TOKEN.len();
  let mut repetitions = remaining / (token_len + 1);
  let extra = remaining % (token_len + 1);

  let mut name = String::with_capacity(remaining + 1);
  if extra == 0 {
    // an empty trailing segment would collapse; split the last token instead
    repetitions -= 1;
    for _ in 0..repetitions {
      name.push('/');
      name.push_str(PADDING_TOKEN);
    }
    name.push('/');
    name.push_str(&PADDING_TOKEN[..token_len - 1]);
    name.push('/');
    name.push_str(&PADDING_TOKEN[..1]);
  } else {
    for _ in 0..repetitions {
      name.push('/');
      name.push_str(PADDING_TOKEN);
    }
    name.push('/');
    name.push_str(&PADDING_TOKEN[..extra]);
  }

  Ok(name)
}

/// The prefix every store uses when hashing outputs, so that hashes do not
/// depend on where a store is mounted.
pub fn canonical_store_prefix() -> Result<String, StoreError> {
  let padding = padded_directory_name(CANONICAL_STORE_PARENT, PADDING_TARGET_LEN)?;
  Ok(format!("{CANONICAL_STORE_PARENT}{padding}/"))
}
