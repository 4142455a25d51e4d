//! Serializer turning flattened entries back into the canonical archive
//! encoding.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire;
use crate::{base_name, display_path, parent_of, NarEntry, NarEntryKind, NarError, Result};

const COPY_BUF: usize = 128 * 1024;

/// Body bytes for a regular entry.
pub enum BodySource<'a> {
    Buf(&'a [u8]),
    Reader(&'a mut (dyn AsyncRead + Send + Unpin)),
}

struct DirFrame {
    path: Vec<u8>,
    last_name: Option<Vec<u8>>,
}

/// Streaming archive writer.
///
/// Entries must arrive in archive traversal order: a directory before its
/// contents, siblings in strictly increasing name order. The writer closes
/// directories on its own when an entry leaves them and on [`finish`].
///
/// [`finish`]: NarWriter::finish
pub struct NarWriter<W> {
    w: W,
    started: bool,
    finished: bool,
    dirs: Vec<DirFrame>,
}

impl<W: AsyncWrite + Unpin> NarWriter<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            started: false,
            finished: false,
            dirs: Vec::new(),
        }
    }

    pub async fn write_entry(&mut self, entry: &NarEntry, body: Option<BodySource<'_>>) -> Result<()> {
        match &entry.kind {
            NarEntryKind::Directory => self.write_directory(&entry.path).await,
            NarEntryKind::Symlink { target } => self.write_symlink(&entry.path, target).await,
            NarEntryKind::Regular { executable, size } => {
                let body = body.unwrap_or(BodySource::Buf(b""));
                self.write_regular(&entry.path, *executable, *size, body).await
            }
        }
    }

    pub async fn write_directory(&mut self, path: &[u8]) -> Result<()> {
        self.open_node(path).await?;
        wire::write_string(&mut self.w, b"(").await?;
        wire::write_string(&mut self.w, b"type").await?;
        wire::write_string(&mut self.w, b"directory").await?;
        self.dirs.push(DirFrame {
            path: path.to_vec(),
            last_name: None,
        });
        Ok(())
    }

    pub async fn write_symlink(&mut self, path: &[u8], target: &[u8]) -> Result<()> {
        self.open_node(path).await?;
        wire::write_string(&mut self.w, b"(").await?;
        wire::write_string(&mut self.w, b"type").await?;
        wire::write_string(&mut self.w, b"symlink").await?;
        wire::write_string(&mut self.w, b"target").await?;
        wire::write_string(&mut self.w, target).await?;
        wire::write_string(&mut self.w, b")").await?;
        self.close_entry_wrapper(path).await
    }

    pub async fn write_regular(
        &mut self,
        path: &[u8],
        executable: bool,
        size: u64,
        body: BodySource<'_>,
    ) -> Result<()> {
        self.open_node(path).await?;
        wire::write_string(&mut self.w, b"(").await?;
        wire::write_string(&mut self.w, b"type").await?;
        wire::write_string(&mut self.w, b"regular").await?;
        if executable {
            wire::write_string(&mut self.w, b"executable").await?;
            wire::write_string(&mut self.w, b"").await?;
        }
        wire::write_string(&mut self.w, b"contents").await?;
        wire::write_u64(&mut self.w, size).await?;

        let written = match body {
            BodySource::Buf(buf) => {
                self.w.write_all(buf).await?;
                buf.len() as u64
            }
            BodySource::Reader(r) => {
                let mut buf = vec![0u8; COPY_BUF];
                let mut total: u64 = 0;
                loop {
                    let n = r.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    total += n as u64;
                    if total > size {
                        break; // overrun, reported below
                    }
                    self.w.write_all(&buf[..n]).await?;
                }
                total
            }
        };
        if written != size {
            return Err(NarError::BodySize {
                path: display_path(path),
                expected: size,
                got: written,
            });
        }

        wire::write_padding(&mut self.w, size).await?;
        wire::write_string(&mut self.w, b")").await?;
        self.close_entry_wrapper(path).await
    }

    /// Close all open directories and flush. Must be called exactly once.
    pub async fn finish(&mut self) -> Result<()> {
        if !self.started {
            return Err(NarError::BadNesting {
                path: String::new(),
            });
        }
        while !self.dirs.is_empty() {
            self.close_top().await?;
        }
        self.finished = true;
        self.w.flush().await?;
        Ok(())
    }

    async fn open_node(&mut self, path: &[u8]) -> Result<()> {
        if self.finished {
            return Err(NarError::BadNesting {
                path: display_path(path),
            });
        }
        if !self.started {
            if !path.is_empty() {
                return Err(NarError::BadNesting {
                    path: display_path(path),
                });
            }
            wire::write_string(&mut self.w, wire::MAGIC).await?;
            self.started = true;
            return Ok(());
        }

        let parent = parent_of(path);
        loop {
            match self.dirs.last() {
                Some(frame) if frame.path == parent => break,
                Some(_) => self.close_top().await?,
                None => {
                    return Err(NarError::BadNesting {
                        path: display_path(path),
                    })
                }
            }
        }

        let name = base_name(path);
        let frame = self.dirs.last_mut().expect("checked above");
        if let Some(last) = &frame.last_name {
            if name <= last.as_slice() {
                return Err(NarError::OutOfOrder {
                    path: display_path(path),
                });
            }
        }
        frame.last_name = Some(name.to_vec());

        wire::write_string(&mut self.w, b"entry").await?;
        wire::write_string(&mut self.w, b"(").await?;
        wire::write_string(&mut self.w, b"name").await?;
        wire::write_string(&mut self.w, name).await?;
        wire::write_string(&mut self.w, b"node").await?;
        Ok(())
    }

    async fn close_entry_wrapper(&mut self, path: &[u8]) -> Result<()> {
        if !path.is_empty() {
            wire::write_string(&mut self.w, b")").await?;
        }
        Ok(())
    }

    async fn close_top(&mut self) -> Result<()> {
        let frame = self.dirs.pop().expect("caller checks non-empty");
        wire::write_string(&mut self.w, b")").await?;
        if !frame.path.is_empty() {
            wire::write_string(&mut self.w, b")").await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NarReader;

    async fn write_archive(entries: &[(NarEntry, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut w = NarWriter::new(&mut out);
        for (entry, body) in entries {
            w.write_entry(entry, Some(BodySource::Buf(body))).await.unwrap();
        }
        w.finish().await.unwrap();
        out
    }

    async fn read_archive(bytes: &[u8]) -> Vec<(NarEntry, Vec<u8>)> {
        let mut r = NarReader::new(bytes);
        let mut entries = Vec::new();
        while let Some(entry) = r.next_entry().await.unwrap() {
            let body = match entry.kind {
                NarEntryKind::Regular { .. } => r.read_body().await.unwrap().to_vec(),
                _ => Vec::new(),
            };
            entries.push((entry, body));
        }
        entries
    }

    #[tokio::test]
    async fn test_single_file_bytes() {
        let out = write_archive(&[(NarEntry::regular("", false, 2), b"hi".as_slice())]).await;

        // hand-assembled reference encoding
        let mut expected = Vec::new();
        for tok in [
            b"nix-archive-1".as_slice(),
            b"(",
            b"type",
            b"regular",
            b"contents",
        ] {
            expected.extend_from_slice(&(tok.len() as u64).to_le_bytes());
            expected.extend_from_slice(tok);
            expected.extend_from_slice(&vec![0u8; wire::padding(tok.len() as u64)]);
        }
        expected.extend_from_slice(&2u64.to_le_bytes());
        expected.extend_from_slice(b"hi");
        expected.extend_from_slice(&[0u8; 6]);
        expected.extend_from_slice(&1u64.to_le_bytes());
        expected.extend_from_slice(b")");
        expected.extend_from_slice(&[0u8; 7]);

        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_tree_roundtrip() {
        let entries: Vec<(NarEntry, &[u8])> = vec![
            (NarEntry::directory(""), b"".as_slice()),
            (NarEntry::directory("bin"), b""),
            (NarEntry::regular("bin/tool", true, 9), b"#!/bin/sh"),
            (NarEntry::symlink("lib", b"share/lib".as_slice()), b""),
            (NarEntry::directory("share"), b""),
            (NarEntry::directory("share/lib"), b""),
            (NarEntry::regular("share/lib/data", false, 3), b"xyz"),
        ];
        let bytes = write_archive(&entries).await;
        let parsed = read_archive(&bytes).await;

        assert_eq!(parsed.len(), entries.len());
        for ((entry, body), (expected_entry, expected_body)) in parsed.iter().zip(&entries) {
            assert_eq!(entry, expected_entry);
            assert_eq!(body.as_slice(), *expected_body);
        }

        // serializing the parsed entries again is byte-stable
        let again: Vec<(NarEntry, &[u8])> = parsed
            .iter()
            .map(|(e, b)| (e.clone(), b.as_slice()))
            .collect();
        assert_eq!(write_archive(&again).await, bytes);
    }

    #[tokio::test]
    async fn test_sibling_order_enforced() {
        let mut out = Vec::new();
        let mut w = NarWriter::new(&mut out);
        w.write_directory(b"").await.unwrap();
        w.write_regular(b"b", false, 0, BodySource::Buf(b"")).await.unwrap();
        let err = w.write_regular(b"a", false, 0, BodySource::Buf(b"")).await;
        assert!(matches!(err, Err(NarError::OutOfOrder { .. })));
    }

    #[tokio::test]
    async fn test_body_size_enforced() {
        let mut out = Vec::new();
        let mut w = NarWriter::new(&mut out);
        let err = w.write_regular(b"", false, 5, BodySource::Buf(b"abc")).await;
        assert!(matches!(err, Err(NarError::BodySize { .. })));
    }

    #[tokio::test]
    async fn test_rejects_bad_magic() {
        let mut bytes = write_archive(&[(NarEntry::regular("", false, 0), b"".as_slice())]).await;
        bytes[8] = b'X';
        let mut r = NarReader::new(bytes.as_slice());
        assert!(matches!(r.next_entry().await, Err(NarError::BadMagic)));
    }

    #[tokio::test]
    async fn test_skips_unread_body() {
        let entries: Vec<(NarEntry, &[u8])> = vec![
            (NarEntry::directory(""), b"".as_slice()),
            (NarEntry::regular("a", false, 5), b"aaaaa"),
            (NarEntry::regular("b", false, 1), b"b"),
        ];
        let bytes = write_archive(&entries).await;
        let mut r = NarReader::new(bytes.as_slice());
        // never read a's body; the reader skips it
        assert_eq!(r.next_entry().await.unwrap().unwrap().path, b"");
        assert_eq!(r.next_entry().await.unwrap().unwrap().path, b"a");
        let b = r.next_entry().await.unwrap().unwrap();
        assert_eq!(b.path, b"b");
        assert_eq!(r.read_body().await.unwrap().as_ref(), b"b");
        assert!(r.next_entry().await.unwrap().is_none());
    }
}
