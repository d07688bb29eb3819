//! The `builtin:fetch_url` builder.
//!
//! Downloads are streamed straight into the store through
//! [`Store::write_content`], so a wrong hash never leaves anything behind and
//! a download is never held in memory as a whole. The store write runs on a
//! blocking thread and receives chunks over a bounded channel.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::BuildError;
use crate::consts::DEFAULT_OUTPUT;
use crate::derivation::Derivation;
use crate::project::lockfile::LockFileManager;
use crate::store::{Store, entry_name};

/// Env key carrying the URL of a fetch derivation.
pub const URL_ENV: &str = "url";

/// Chunks in flight between the download and the store write.
const CHUNK_QUEUE: usize = 16;
const FILE_CHUNK_SIZE: usize = 64 * 1024;

type Chunk = io::Result<Vec<u8>>;

/// Fetch the URL of `drv` into the store and return its outputs.
///
/// A fixed-hash derivation is checked against its hash. Otherwise the hash of
/// whatever arrived is pinned in the lockfile under the URL, and a conflict
/// with an earlier pin fails the build.
pub async fn fetch_url(
  drv: &Derivation,
  store: Arc<Store>,
  lockfile: Option<&LockFileManager>,
) -> Result<BTreeMap<String, String>, BuildError> {
  let url = drv.env.get(URL_ENV).ok_or_else(|| BuildError::Fetch {
    url: String::new(),
    message: format!("derivation {} has no url", drv.name),
  })?;
  info!(url = %url, "fetching URL");

  let label = drv.output_label(DEFAULT_OUTPUT);
  let expected = drv.fixed_hash().map(str::to_string);
  let (tx, rx) = mpsc::channel::<Chunk>(CHUNK_QUEUE);

  let writer_label = label.clone();
  let writer = tokio::task::spawn_blocking(move || {
    store.write_content(ChunkReader::new(rx), Some(&writer_label), expected.as_deref())
  });

  let downloaded = download(url, tx).await;
  let written = writer.await.map_err(|e| BuildError::Join(e.to_string()))?;
  // a failed download also fails the write; its own error says more
  let size = downloaded?;
  let (hash, path) = written?;
  debug!(path = ?path, size, "download committed");

  if drv.fixed_hash().is_none()
    && let Some(lockfile) = lockfile
  {
    lockfile.pin(url, hash.as_str())?;
  }

  Ok(BTreeMap::from([(
    DEFAULT_OUTPUT.to_string(),
    entry_name(&hash, Some(&label)),
  )]))
}

/// Send the body of `url` down `tx` and return its size.
///
/// On failure the error is also sent, so the store write is abandoned rather
/// than committing a truncated file.
async fn download(url: &str, tx: mpsc::Sender<Chunk>) -> Result<u64, BuildError> {
  let result = stream_body(url, &tx).await;
  if let Err(BuildError::Fetch { message, .. }) = &result
    && tx.send(Err(io::Error::other(message.clone()))).await.is_err()
  {
    debug!("store write already finished");
  }
  result
}

async fn stream_body(url: &str, tx: &mpsc::Sender<Chunk>) -> Result<u64, BuildError> {
  let fetch_error = |message: String| BuildError::Fetch {
    url: url.to_string(),
    message,
  };
  let mut size = 0u64;

  if let Some(path) = url.strip_prefix("file://") {
    let mut file = tokio::fs::File::open(PathBuf::from(path))
      .await
      .map_err(|e| fetch_error(e.to_string()))?;
    let mut buffer = vec![0u8; FILE_CHUNK_SIZE];
    loop {
      let read = file.read(&mut buffer).await.map_err(|e| fetch_error(e.to_string()))?;
      if read == 0 {
        return Ok(size);
      }
      size += read as u64;
      if tx.send(Ok(buffer[..read].to_vec())).await.is_err() {
        // the store write gave up and reports why
        return Ok(size);
      }
    }
  }

  if !(url.starts_with("http://") || url.starts_with("https://")) {
    return Err(fetch_error("unsupported URL scheme".to_string()));
  }

  let mut response = reqwest::get(url).await.map_err(|e| fetch_error(e.to_string()))?;
  if !response.status().is_success() {
    return Err(fetch_error(format!("HTTP {}", response.status())));
  }
  while let Some(chunk) = response.chunk().await.map_err(|e| fetch_error(e.to_string()))? {
    size += chunk.len() as u64;
    if tx.send(Ok(chunk.to_vec())).await.is_err() {
      return Ok(size);
    }
  }
  Ok(size)
}

/// Blocking [`Read`] over the chunks of a download.
struct ChunkReader {
  rx: mpsc::Receiver<Chunk>,
  current: io::Cursor<Vec<u8>>,
}

impl ChunkReader {
  fn new(rx: mpsc::Receiver<Chunk>) -> Self {
    Self {
      rx,
      current: io::Cursor::new(Vec::new()),
    }
  }
}

impl Read for ChunkReader {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    loop {
      let read = Read::read(&mut self.current, buf)?;
      if read > 0 || buf.is_empty() {
        return Ok(read);
      }
      match self.rx.blocking_recv() {
        Some(Ok(chunk)) => self.current = io::Cursor::new(chunk),
        Some(Err(e)) => return Err(e),
        None => return Ok(0),
      }
    }
  }
}
