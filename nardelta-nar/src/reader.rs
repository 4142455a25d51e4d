//! Pull parser turning an archive byte stream into flattened entries.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire;
use crate::{display_path, NarEntry, NarError, Result};

const COPY_BUF: usize = 128 * 1024;

/// Streaming archive reader.
///
/// Call [`next_entry`] in a loop; after a [`Regular`] entry the body must
/// be consumed with [`read_body`] or [`copy_body`] (an unconsumed body is
/// skipped on the next call).
///
/// [`next_entry`]: NarReader::next_entry
/// [`read_body`]: NarReader::read_body
/// [`copy_body`]: NarReader::copy_body
/// [`Regular`]: crate::NarEntryKind::Regular
pub struct NarReader<R> {
    r: R,
    started: bool,
    done: bool,
    dirs: Vec<Vec<u8>>,
    body_path: Vec<u8>,
    body_len: u64,
    body_remaining: u64,
    pending_node_close: bool,
    pending_entry_close: bool,
}

impl<R: AsyncRead + Unpin> NarReader<R> {
    pub fn new(r: R) -> Self {
        Self {
            r,
            started: false,
            done: false,
            dirs: Vec::new(),
            body_path: Vec::new(),
            body_len: 0,
            body_remaining: 0,
            pending_node_close: false,
            pending_entry_close: false,
        }
    }

    /// Next entry in traversal order, or `None` at the end of a well-formed
    /// archive.
    pub async fn next_entry(&mut self) -> Result<Option<NarEntry>> {
        if self.done {
            return Ok(None);
        }
        if !self.started {
            wire::expect_string(&mut self.r, wire::MAGIC)
                .await
                .map_err(|e| match e {
                    NarError::UnexpectedToken { .. } => NarError::BadMagic,
                    other => other,
                })?;
            self.started = true;
            return Ok(Some(self.parse_node(Vec::new()).await?));
        }

        self.finish_current().await?;

        loop {
            let Some(dir) = self.dirs.last() else {
                self.verify_eof().await?;
                self.done = true;
                return Ok(None);
            };
            let tok = wire::read_string(&mut self.r).await?;
            match tok.as_slice() {
                b")" => {
                    let closed = self.dirs.pop().expect("checked non-empty");
                    if !closed.is_empty() {
                        // the entry wrapper around the nested directory
                        wire::expect_string(&mut self.r, b")").await?;
                    }
                }
                b"entry" => {
                    wire::expect_string(&mut self.r, b"(").await?;
                    wire::expect_string(&mut self.r, b"name").await?;
                    let name = wire::read_string(&mut self.r).await?;
                    wire::expect_string(&mut self.r, b"node").await?;
                    let mut path = dir.clone();
                    if !path.is_empty() {
                        path.push(b'/');
                    }
                    path.extend_from_slice(&name);
                    return Ok(Some(self.parse_node(path).await?));
                }
                _ => {
                    return Err(NarError::UnexpectedToken {
                        expected: "entry or )".into(),
                        got: String::from_utf8_lossy(&tok).into_owned(),
                    })
                }
            }
        }
    }

    /// Read the whole body of the current regular entry.
    pub async fn read_body(&mut self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.body_remaining.min(1 << 30) as usize);
        while self.body_remaining > 0 {
            let want = self.body_remaining.min(COPY_BUF as u64) as usize;
            let before = buf.len();
            buf.resize(before + want, 0);
            self.r
                .read_exact(&mut buf[before..])
                .await
                .map_err(|_| NarError::UnexpectedEof)?;
            self.body_remaining -= want as u64;
        }
        wire::read_padding(&mut self.r, self.body_len).await?;
        self.body_len = 0;
        Ok(buf.freeze())
    }

    /// Stream the body of the current regular entry into `w`.
    pub async fn copy_body<W: AsyncWrite + Unpin>(&mut self, w: &mut W) -> Result<u64> {
        let total = self.body_remaining;
        let mut buf = vec![0u8; COPY_BUF];
        while self.body_remaining > 0 {
            let want = self.body_remaining.min(COPY_BUF as u64) as usize;
            self.r
                .read_exact(&mut buf[..want])
                .await
                .map_err(|_| NarError::UnexpectedEof)?;
            w.write_all(&buf[..want]).await?;
            self.body_remaining -= want as u64;
        }
        wire::read_padding(&mut self.r, self.body_len).await?;
        self.body_len = 0;
        Ok(total)
    }

    async fn parse_node(&mut self, path: Vec<u8>) -> Result<NarEntry> {
        wire::expect_string(&mut self.r, b"(").await?;
        wire::expect_string(&mut self.r, b"type").await?;
        let t = wire::read_string(&mut self.r).await?;
        match t.as_slice() {
            b"regular" => {
                let mut tok = wire::read_string(&mut self.r).await?;
                let mut executable = false;
                if tok == b"executable" {
                    wire::expect_string(&mut self.r, b"").await?;
                    executable = true;
                    tok = wire::read_string(&mut self.r).await?;
                }
                if tok != b"contents" {
                    return Err(NarError::UnexpectedToken {
                        expected: "contents".into(),
                        got: String::from_utf8_lossy(&tok).into_owned(),
                    });
                }
                let size = wire::read_u64(&mut self.r).await?;
                self.body_path = path.clone();
                self.body_len = size;
                self.body_remaining = size;
                self.pending_node_close = true;
                self.pending_entry_close = !self.dirs.is_empty();
                Ok(NarEntry::regular(path, executable, size))
            }
            b"symlink" => {
                wire::expect_string(&mut self.r, b"target").await?;
                let target = wire::read_string(&mut self.r).await?;
                wire::expect_string(&mut self.r, b")").await?;
                if !self.dirs.is_empty() {
                    wire::expect_string(&mut self.r, b")").await?;
                }
                Ok(NarEntry::symlink(path, target))
            }
            b"directory" => {
                self.dirs.push(path.clone());
                Ok(NarEntry::directory(path))
            }
            _ => Err(NarError::UnexpectedToken {
                expected: "regular, symlink or directory".into(),
                got: String::from_utf8_lossy(&t).into_owned(),
            }),
        }
    }

    /// Skip whatever is left of the current regular entry and read the
    /// tokens closing it.
    async fn finish_current(&mut self) -> Result<()> {
        if self.body_remaining > 0 || self.body_len > 0 {
            let mut buf = vec![0u8; COPY_BUF.min(self.body_remaining.max(1) as usize)];
            while self.body_remaining > 0 {
                let want = self.body_remaining.min(buf.len() as u64) as usize;
                self.r
                    .read_exact(&mut buf[..want])
                    .await
                    .map_err(|_| NarError::UnexpectedEof)?;
                self.body_remaining -= want as u64;
            }
            wire::read_padding(&mut self.r, self.body_len).await?;
            self.body_len = 0;
        }
        if self.pending_node_close {
            wire::expect_string(&mut self.r, b")").await?;
            self.pending_node_close = false;
        }
        if self.pending_entry_close {
            wire::expect_string(&mut self.r, b")").await?;
            self.pending_entry_close = false;
        }
        Ok(())
    }

    async fn verify_eof(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        match self.r.read(&mut byte).await? {
            0 => Ok(()),
            _ => Err(NarError::TrailingData),
        }
    }

    /// Path of the regular entry whose body is currently readable.
    pub fn body_path(&self) -> String {
        display_path(&self.body_path)
    }
}
