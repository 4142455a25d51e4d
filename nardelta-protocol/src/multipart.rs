//! Streaming `multipart/form-data` framing for the differ response.
//!
//! The response carries exactly three parts in order (`header`, `body`,
//! `trailer`); the body part is raw delta bytes of unknown length, so both
//! sides must stream. The writer feeds an [`AsyncWrite`]; the reader pulls
//! from any `Stream` of [`Bytes`] chunks and hands out one part at a time.

use std::io;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;

pub fn random_boundary() -> String {
    let mut rng = rand::thread_rng();
    (0..30)
        .map(|_| {
            let chars = b"0123456789abcdefghijklmnopqrstuvwxyz";
            chars[rng.gen_range(0..chars.len())] as char
        })
        .collect()
}

pub struct MultipartWriter<W> {
    w: W,
    boundary: String,
    wrote_part: bool,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> MultipartWriter<W> {
    pub fn new(w: W, boundary: String) -> Self {
        Self {
            w,
            boundary,
            wrote_part: false,
            closed: false,
        }
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    async fn begin_part(&mut self, disposition: &str, content_type: Option<&str>) -> io::Result<()> {
        debug_assert!(!self.closed);
        let lead = if self.wrote_part { "\r\n" } else { "" };
        self.wrote_part = true;
        let mut head = format!(
            "{lead}--{}\r\nContent-Disposition: form-data; {disposition}\r\n",
            self.boundary
        );
        if let Some(ct) = content_type {
            head.push_str(&format!("Content-Type: {ct}\r\n"));
        }
        head.push_str("\r\n");
        self.w.write_all(head.as_bytes()).await
    }

    /// Write a complete small part holding a JSON value.
    pub async fn write_json_field<T: Serialize>(&mut self, name: &str, value: &T) -> io::Result<()> {
        self.begin_part(&format!("name=\"{name}\""), None).await?;
        let body = serde_json::to_vec(value).map_err(io::Error::other)?;
        self.w.write_all(&body).await?;
        self.w.write_all(b"\n").await
    }

    /// Start a file part; the raw content is then written straight to
    /// [`inner_mut`](Self::inner_mut) until the next part begins.
    pub async fn begin_file_field(&mut self, name: &str, filename: &str) -> io::Result<()> {
        self.begin_part(
            &format!("name=\"{name}\"; filename=\"{filename}\""),
            Some("application/octet-stream"),
        )
        .await
    }

    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.w
    }

    /// Write the terminating boundary and flush.
    pub async fn close(&mut self) -> io::Result<()> {
        debug_assert!(!self.closed);
        self.closed = true;
        let tail = format!("\r\n--{}--\r\n", self.boundary);
        self.w.write_all(tail.as_bytes()).await?;
        self.w.flush().await
    }
}

/// Extract the boundary parameter from a `multipart/form-data`
/// content-type header value.
pub fn boundary_from_content_type(content_type: &str) -> io::Result<String> {
    let mut parts = content_type.split(';');
    let mediatype = parts.next().unwrap_or("").trim();
    if mediatype != "multipart/form-data" {
        return Err(io::Error::other(format!(
            "wrong content-type {mediatype:?}"
        )));
    }
    for param in parts {
        if let Some((key, value)) = param.trim().split_once('=') {
            if key == "boundary" {
                return Ok(value.trim_matches('"').to_string());
            }
        }
    }
    Err(io::Error::other("missing multipart boundary"))
}

enum ReaderState {
    /// Before the first boundary line.
    Preamble,
    /// A boundary line has been consumed up to its trailing CRLF/`--`.
    AfterBoundary,
    /// Streaming the current part's content.
    InPart,
    /// The terminating boundary was seen.
    Done,
}

pub struct MultipartReader<S> {
    stream: S,
    buf: BytesMut,
    /// `\r\n--<boundary>`, the delimiter in front of every non-first part.
    delimiter: Vec<u8>,
    state: ReaderState,
    stream_done: bool,
}

pub struct Part<'a, S> {
    reader: &'a mut MultipartReader<S>,
    pub name: String,
}

impl<S> MultipartReader<S>
where
    S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
{
    pub fn new(stream: S, boundary: &str) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
            delimiter: format!("\r\n--{boundary}").into_bytes(),
            state: ReaderState::Preamble,
            stream_done: false,
        }
    }

    /// Advance to the next part. The previous part must have been fully
    /// consumed.
    pub async fn next_part(&mut self) -> io::Result<Option<Part<'_, S>>> {
        match self.state {
            ReaderState::Preamble => {
                // first boundary has no leading CRLF
                let first_len = self.delimiter.len() - 2;
                self.want(first_len).await?;
                if self.buf[..first_len] != self.delimiter[2..] {
                    return Err(io::Error::other("multipart preamble mismatch"));
                }
                let _ = self.buf.split_to(first_len);
                self.state = ReaderState::AfterBoundary;
            }
            ReaderState::AfterBoundary => {}
            ReaderState::InPart => {
                return Err(io::Error::other("previous multipart part not consumed"))
            }
            ReaderState::Done => return Ok(None),
        }

        // after a boundary: "--" ends the stream, CRLF opens headers
        self.want(2).await?;
        if &self.buf[..2] == b"--" {
            self.state = ReaderState::Done;
            return Ok(None);
        }
        if &self.buf[..2] != b"\r\n" {
            return Err(io::Error::other("garbage after multipart boundary"));
        }
        let _ = self.buf.split_to(2);

        // headers run until an empty line
        let header_end = loop {
            if let Some(pos) = find(&self.buf, b"\r\n\r\n") {
                break pos;
            }
            if !self.fill().await? {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof in multipart headers",
                ));
            }
        };
        let headers = self.buf.split_to(header_end + 4);
        let name = part_name(&headers)
            .ok_or_else(|| io::Error::other("multipart part without a name"))?;

        self.state = ReaderState::InPart;
        Ok(Some(Part { reader: self, name }))
    }

    /// Next chunk of the current part, or `None` at the part's end.
    async fn chunk(&mut self) -> io::Result<Option<Bytes>> {
        if !matches!(self.state, ReaderState::InPart) {
            return Ok(None);
        }
        loop {
            if let Some(pos) = find(&self.buf, &self.delimiter) {
                if pos == 0 {
                    let _ = self.buf.split_to(self.delimiter.len());
                    self.state = ReaderState::AfterBoundary;
                    return Ok(None);
                }
                return Ok(Some(self.buf.split_to(pos).freeze()));
            }
            // hold back delimiter-len-1 tail bytes: a delimiter may
            // straddle the chunk border
            if self.buf.len() >= self.delimiter.len() {
                let safe = self.buf.len() - (self.delimiter.len() - 1);
                return Ok(Some(self.buf.split_to(safe).freeze()));
            }
            if !self.fill().await? {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof inside multipart part",
                ));
            }
        }
    }

    async fn want(&mut self, n: usize) -> io::Result<()> {
        while self.buf.len() < n {
            if !self.fill().await? {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated multipart stream",
                ));
            }
        }
        Ok(())
    }

    async fn fill(&mut self) -> io::Result<bool> {
        if self.stream_done {
            return Ok(false);
        }
        match self.stream.next().await {
            Some(chunk) => {
                self.buf.extend_from_slice(&chunk?);
                Ok(true)
            }
            None => {
                self.stream_done = true;
                Ok(false)
            }
        }
    }
}

impl<'a, S> Part<'a, S>
where
    S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
{
    /// Collect the whole part. Only sensible for the small JSON parts.
    pub async fn bytes(self) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        let reader = self.reader;
        while let Some(chunk) = reader.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    pub async fn json<T: DeserializeOwned>(self) -> io::Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(io::Error::other)
    }

    /// The part content as an [`AsyncRead`], for streaming consumers.
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin + 'a
    where
        S: 'a,
    {
        let stream = futures::stream::try_unfold(self.reader, |reader| async move {
            Ok::<_, io::Error>(reader.chunk().await?.map(|chunk| (chunk, reader)))
        });
        StreamReader::new(Box::pin(stream))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn part_name(headers: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(headers).ok()?;
    for line in text.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if !key.eq_ignore_ascii_case("content-disposition") {
            continue;
        }
        for param in value.split(';') {
            if let Some((k, v)) = param.trim().split_once('=') {
                if k == "name" {
                    return Some(v.trim_matches('"').to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tokio::io::AsyncReadExt;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Header {
        algo: String,
    }

    fn chunked(bytes: Vec<u8>, size: usize) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin {
        let chunks: Vec<io::Result<Bytes>> = bytes
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(chunks)
    }

    async fn build_message(body: &[u8]) -> (Vec<u8>, String) {
        let mut out = Vec::new();
        let boundary = random_boundary();
        let mut w = MultipartWriter::new(&mut out, boundary.clone());
        w.write_json_field("header", &Header { algo: "zstd".into() })
            .await
            .unwrap();
        w.begin_file_field("body", "delta").await.unwrap();
        w.inner_mut().write_all(body).await.unwrap();
        w.write_json_field("trailer", &serde_json::json!({"Ok": true}))
            .await
            .unwrap();
        w.close().await.unwrap();
        (out, boundary)
    }

    #[tokio::test]
    async fn test_roundtrip_all_chunk_sizes() {
        // delta bytes that contain CR, LF and dashes to stress the scanner
        let mut body = Vec::new();
        for i in 0..512u32 {
            body.extend_from_slice(format!("--\r\n{i}-").as_bytes());
        }
        let (msg, boundary) = build_message(&body).await;

        for chunk_size in [1, 2, 3, 7, 64, 4096] {
            let mut r = MultipartReader::new(chunked(msg.clone(), chunk_size), &boundary);

            let part = r.next_part().await.unwrap().unwrap();
            assert_eq!(part.name, "header");
            let h: Header = part.json().await.unwrap();
            assert_eq!(h.algo, "zstd");

            let part = r.next_part().await.unwrap().unwrap();
            assert_eq!(part.name, "body");
            let mut got = Vec::new();
            part.into_async_read().read_to_end(&mut got).await.unwrap();
            assert_eq!(got, body, "chunk size {chunk_size}");

            let part = r.next_part().await.unwrap().unwrap();
            assert_eq!(part.name, "trailer");
            let t: serde_json::Value = part.json().await.unwrap();
            assert_eq!(t["Ok"], true);

            assert!(r.next_part().await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_empty_body_part() {
        let (msg, boundary) = build_message(b"").await;
        let mut r = MultipartReader::new(chunked(msg, 5), &boundary);
        r.next_part().await.unwrap().unwrap().bytes().await.unwrap();
        let part = r.next_part().await.unwrap().unwrap();
        assert_eq!(part.bytes().await.unwrap().len(), 0);
        r.next_part().await.unwrap().unwrap().bytes().await.unwrap();
        assert!(r.next_part().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_stream_errors() {
        let (mut msg, boundary) = build_message(b"payload").await;
        msg.truncate(msg.len() / 2);
        let mut r = MultipartReader::new(chunked(msg, 9), &boundary);
        let mut saw_error = false;
        for _ in 0..4 {
            match r.next_part().await {
                Ok(Some(part)) => {
                    if part.bytes().await.is_err() {
                        saw_error = true;
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    saw_error = true;
                    break;
                }
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn test_boundary_from_content_type() {
        let b = boundary_from_content_type("multipart/form-data; boundary=abc123").unwrap();
        assert_eq!(b, "abc123");
        assert!(boundary_from_content_type("text/plain").is_err());
        assert!(boundary_from_content_type("multipart/form-data").is_err());
    }
}
