//! Reversible archive transform across compression boundaries.
//!
//! Deltas between two archives are nearly useless when the interesting
//! bytes sit inside embedded `.xz`/`.gz` files (kernel modules, firmware,
//! man pages): a one-byte change reshuffles the whole compressed stream.
//! [`expand_nar`] re-encodes such an archive by replacing each compressed
//! file with a small metadata record (the options needed to reproduce it)
//! plus its decompressed bytes; [`collapse_nar`] recompresses with exactly
//! those options, reconstructing the original archive bit for bit.
//!
//! The metadata record lands at `<path>\x01_exp1meta_` and the data at
//! `<path>\x01_exp2data_`; the suffixes sort immediately after the
//! original path so entry ordering survives the transform.
//!
//! Both directions run as a reader task and a writer task connected by a
//! bounded entry channel, with a weighted byte budget capping the data
//! held in flight across decompressor children.

mod byte_stream;
pub mod xz;

pub use byte_stream::TransformStream;
pub use xz::{parse_xz, XzInfo, XzParseError};

use std::io;
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use nardelta_nar::{BodySource, NarEntry, NarEntryKind, NarReader, NarWriter};

pub const XZ_BIN: &str = "xz";
pub const GZIP_BIN: &str = "gzip";

/// Sorts immediately after the original path, before any sibling.
pub const META_SUFFIX: &[u8] = b"\x01_exp1meta_";
pub const DATA_SUFFIX: &[u8] = b"\x01_exp2data_";

/// gzip, deflate, no flags, zero mtime, unix. Anything else is passed
/// through untouched: reproducing it is not guaranteed.
const GZ_HEADER: [u8; 10] = [0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 3];

#[derive(Debug, Clone, Copy, Default)]
pub struct ExpandOptions {
    /// Parsed entries buffered between reader and writer; 0 means
    /// `4 × cores`.
    pub buffer_entries: usize,
    /// Bytes of file data in flight across subprocesses; 0 means 128 MiB.
    pub buffer_bytes: u64,
}

impl ExpandOptions {
    fn resolve(self) -> (usize, u64) {
        let entries = if self.buffer_entries == 0 {
            4 * std::thread::available_parallelism().map_or(4, |n| n.get())
        } else {
            self.buffer_entries
        };
        let bytes = if self.buffer_bytes == 0 {
            128 * 1024 * 1024
        } else {
            self.buffer_bytes
        };
        (entries, bytes)
    }
}

/// Record emitted next to each expanded file.
#[derive(Debug, Serialize, Deserialize)]
struct ExpandMeta {
    #[serde(rename = "a")]
    algo: String,
    #[serde(rename = "o", default, skip_serializing_if = "Vec::is_empty")]
    options: Vec<String>,
    #[serde(rename = "c")]
    compressed_size: u64,
}

/// Expand embedded compressed files into metadata + decompressed bytes.
pub fn expand_nar<R>(input: R, opts: ExpandOptions) -> TransformStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    transform(input, opts, Direction::Expand)
}

/// Reverse [`expand_nar`], reproducing the original archive exactly.
pub fn collapse_nar<R>(input: R, opts: ExpandOptions) -> TransformStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    transform(input, opts, Direction::Collapse)
}

#[derive(Clone, Copy)]
enum Direction {
    Expand,
    Collapse,
}

fn transform<R>(input: R, opts: ExpandOptions, direction: Direction) -> TransformStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (entries, budget) = opts.resolve();
    let (sink, failure_tx, out) = byte_stream::byte_channel();
    let (ent_tx, ent_rx) = mpsc::channel::<io::Result<Ent>>(entries);
    let sem = Arc::new(Semaphore::new(
        budget.min(Semaphore::MAX_PERMITS as u64) as usize
    ));

    tokio::spawn(async move {
        let res = match direction {
            Direction::Expand => read_and_expand(input, &ent_tx, sem, budget).await,
            Direction::Collapse => read_and_collapse(input, &ent_tx, sem, budget).await,
        };
        if let Err(e) = res {
            let _ = ent_tx.send(Err(e)).await;
        }
    });

    tokio::spawn(async move {
        if let Err(e) = write_entries(ent_rx, sink).await {
            let _ = failure_tx.send(e);
        }
    });

    out
}

struct Ent {
    entry: NarEntry,
    data: EntData,
    release: Option<Release>,
}

enum EntData {
    None,
    Buf(Bytes),
    Stream(ChildStdout),
}

impl Ent {
    fn plain(entry: NarEntry) -> Self {
        Self {
            entry,
            data: EntData::None,
            release: None,
        }
    }
}

/// Resources tied to one entry, released once its bytes are written out.
struct Release {
    permit: Option<OwnedSemaphorePermit>,
    child: Option<(Child, &'static str)>,
    feeder: Option<JoinHandle<()>>,
}

impl Release {
    fn permit_only(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Some(permit),
            child: None,
            feeder: None,
        }
    }

    async fn finish(mut self) -> io::Result<()> {
        if let Some((mut child, tool)) = self.child.take() {
            let status = child.wait().await?;
            if !status.success() {
                return Err(io::Error::other(format!("{tool} exited with {status}")));
            }
        }
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.await;
        }
        drop(self.permit.take());
        Ok(())
    }
}

async fn acquire(sem: &Arc<Semaphore>, budget: u64, need: u64) -> io::Result<OwnedSemaphorePermit> {
    let n = need.min(budget).min(u32::MAX as u64) as u32;
    sem.clone()
        .acquire_many_owned(n)
        .await
        .map_err(io::Error::other)
}

async fn send(tx: &mpsc::Sender<io::Result<Ent>>, ent: Ent) -> io::Result<()> {
    tx.send(Ok(ent))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "consumer went away"))
}

fn nar_err(e: nardelta_nar::NarError) -> io::Error {
    io::Error::other(e)
}

async fn read_and_expand<R>(
    input: R,
    tx: &mpsc::Sender<io::Result<Ent>>,
    sem: Arc<Semaphore>,
    budget: u64,
) -> io::Result<()>
where
    R: AsyncRead + Send + Unpin,
{
    let mut r = NarReader::new(input);
    while let Some(entry) = r.next_entry().await.map_err(nar_err)? {
        match entry.kind {
            NarEntryKind::Directory | NarEntryKind::Symlink { .. } => {
                send(tx, Ent::plain(entry)).await?;
            }
            NarEntryKind::Regular { executable, size } => {
                let permit = acquire(&sem, budget, size).await?;
                let buf = r.read_body().await.map_err(nar_err)?;

                if entry.path.ends_with(b".xz") {
                    match xz::parse_xz(&buf) {
                        Ok(info) => {
                            expand_compressed(
                                tx,
                                &entry.path,
                                executable,
                                size,
                                "xz",
                                info.options,
                                info.uncompressed_size,
                                XZ_BIN,
                                &["-dc"],
                                buf,
                                permit,
                            )
                            .await?;
                            continue;
                        }
                        Err(e) => {
                            log::debug!("pass through {}: {}", r.body_path(), e);
                        }
                    }
                } else if entry.path.ends_with(b".gz")
                    && buf.len() >= 18
                    && buf[..10] == GZ_HEADER
                {
                    let end = buf.len();
                    let uncompressed =
                        u32::from_le_bytes(buf[end - 4..].try_into().expect("4 bytes")) as u64;
                    expand_compressed(
                        tx,
                        &entry.path,
                        executable,
                        size,
                        "gz",
                        Vec::new(),
                        uncompressed,
                        GZIP_BIN,
                        &["-ndc"],
                        buf,
                        permit,
                    )
                    .await?;
                    continue;
                }

                send(
                    tx,
                    Ent {
                        entry,
                        data: EntData::Buf(buf),
                        release: Some(Release::permit_only(permit)),
                    },
                )
                .await?;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn expand_compressed(
    tx: &mpsc::Sender<io::Result<Ent>>,
    path: &[u8],
    executable: bool,
    compressed_size: u64,
    algo: &str,
    options: Vec<String>,
    uncompressed_size: u64,
    bin: &'static str,
    args: &[&str],
    buf: Bytes,
    permit: OwnedSemaphorePermit,
) -> io::Result<()> {
    let meta = ExpandMeta {
        algo: algo.to_string(),
        options,
        compressed_size,
    };
    let meta_json = serde_json::to_vec(&meta)?;

    let mut meta_path = path.to_vec();
    meta_path.extend_from_slice(META_SUFFIX);
    send(
        tx,
        Ent {
            entry: NarEntry::regular(meta_path, executable, meta_json.len() as u64),
            data: EntData::Buf(meta_json.into()),
            release: None,
        },
    )
    .await?;

    let mut data_path = path.to_vec();
    data_path.extend_from_slice(DATA_SUFFIX);
    let (child, stdout, feeder) = spawn_tool(bin, args, buf)?;
    send(
        tx,
        Ent {
            entry: NarEntry::regular(data_path, executable, uncompressed_size),
            data: EntData::Stream(stdout),
            release: Some(Release {
                permit: Some(permit),
                child: Some((child, bin)),
                feeder: Some(feeder),
            }),
        },
    )
    .await
}

async fn read_and_collapse<R>(
    input: R,
    tx: &mpsc::Sender<io::Result<Ent>>,
    sem: Arc<Semaphore>,
    budget: u64,
) -> io::Result<()>
where
    R: AsyncRead + Send + Unpin,
{
    let mut r = NarReader::new(input);
    while let Some(entry) = r.next_entry().await.map_err(nar_err)? {
        match entry.kind {
            NarEntryKind::Directory | NarEntryKind::Symlink { .. } => {
                send(tx, Ent::plain(entry)).await?;
            }
            NarEntryKind::Regular { .. } if entry.path.ends_with(META_SUFFIX) => {
                let meta_buf = r.read_body().await.map_err(nar_err)?;
                let meta: ExpandMeta = serde_json::from_slice(&meta_buf)?;

                let data_entry = r
                    .next_entry()
                    .await
                    .map_err(nar_err)?
                    .ok_or_else(|| io::Error::other("expanded archive ends after metadata"))?;
                let NarEntryKind::Regular { executable, size } = data_entry.kind else {
                    return Err(io::Error::other("bad expanded archive"));
                };
                if !data_entry.path.ends_with(DATA_SUFFIX) {
                    return Err(io::Error::other("bad expanded archive"));
                }

                let permit = acquire(&sem, budget, size + meta.compressed_size).await?;
                let buf = r.read_body().await.map_err(nar_err)?;

                let (bin, args): (&'static str, Vec<String>) = match meta.algo.as_str() {
                    "xz" => {
                        let mut args = vec!["-c".to_string()];
                        args.extend(meta.options.iter().cloned());
                        (XZ_BIN, args)
                    }
                    "gz" => (GZIP_BIN, vec!["-nc".to_string()]),
                    other => {
                        return Err(io::Error::other(format!("unexpected algo {other:?}")))
                    }
                };
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                let (child, stdout, feeder) = spawn_tool(bin, &args, buf)?;

                let orig_path = data_entry.path[..data_entry.path.len() - DATA_SUFFIX.len()].to_vec();
                send(
                    tx,
                    Ent {
                        entry: NarEntry::regular(orig_path, executable, meta.compressed_size),
                        data: EntData::Stream(stdout),
                        release: Some(Release {
                            permit: Some(permit),
                            child: Some((child, bin)),
                            feeder: Some(feeder),
                        }),
                    },
                )
                .await?;
            }
            NarEntryKind::Regular { size, .. } => {
                let permit = acquire(&sem, budget, size).await?;
                let buf = r.read_body().await.map_err(nar_err)?;
                send(
                    tx,
                    Ent {
                        entry,
                        data: EntData::Buf(buf),
                        release: Some(Release::permit_only(permit)),
                    },
                )
                .await?;
            }
        }
    }
    Ok(())
}

fn spawn_tool(
    bin: &'static str,
    args: &[&str],
    input: Bytes,
) -> io::Result<(Child, ChildStdout, JoinHandle<()>)> {
    let mut cmd = Command::new(bin);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;
    let mut stdin = child.stdin.take().expect("stdin is piped");
    let feeder = tokio::spawn(async move {
        let _ = stdin.write_all(&input).await;
        let _ = stdin.shutdown().await;
    });
    let stdout = child.stdout.take().expect("stdout is piped");
    Ok((child, stdout, feeder))
}

async fn write_entries(
    mut rx: mpsc::Receiver<io::Result<Ent>>,
    sink: byte_stream::ByteSink,
) -> io::Result<()> {
    let mut w = NarWriter::new(sink);
    while let Some(item) = rx.recv().await {
        let ent = item?;
        match ent.data {
            EntData::None => w.write_entry(&ent.entry, None).await,
            EntData::Buf(buf) => w.write_entry(&ent.entry, Some(BodySource::Buf(&buf))).await,
            EntData::Stream(mut stdout) => {
                w.write_entry(&ent.entry, Some(BodySource::Reader(&mut stdout)))
                    .await
            }
        }
        .map_err(nar_err)?;
        if let Some(release) = ent.release {
            release.finish().await?;
        }
    }
    w.finish().await.map_err(nar_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use nardelta_nar::NarWriter;

    async fn build_archive(entries: &[(NarEntry, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut w = NarWriter::new(&mut out);
        for (entry, body) in entries {
            w.write_entry(entry, Some(BodySource::Buf(body))).await.unwrap();
        }
        w.finish().await.unwrap();
        out
    }

    async fn collect(mut stream: TransformStream) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    fn gzip_available() -> bool {
        std::process::Command::new(GZIP_BIN)
            .arg("--version")
            .output()
            .is_ok()
    }

    #[tokio::test]
    async fn test_plain_archive_is_untouched() {
        let archive = build_archive(&[
            (NarEntry::directory(""), b"".as_slice()),
            (NarEntry::regular("data.txt", false, 5), b"hello"),
            (NarEntry::symlink("link", b"data.txt".as_slice()), b""),
        ])
        .await;

        let expanded = collect(expand_nar(
            std::io::Cursor::new(archive.clone()),
            ExpandOptions::default(),
        ))
        .await
        .unwrap();
        assert_eq!(expanded, archive);

        let collapsed = collect(collapse_nar(
            std::io::Cursor::new(expanded),
            ExpandOptions::default(),
        ))
        .await
        .unwrap();
        assert_eq!(collapsed, archive);
    }

    #[tokio::test]
    async fn test_gz_gate_rejects_nonstandard_header() {
        // name flag set (FLG = 0x08): not reproducible, must pass through
        let mut gz = vec![0x1f, 0x8b, 8, 8, 0, 0, 0, 0, 0, 3];
        gz.extend_from_slice(b"ls.1\0datadatadata");
        gz.extend_from_slice(&[0u8; 8]);
        let archive = build_archive(&[
            (NarEntry::directory(""), b"".as_slice()),
            (NarEntry::regular("ls.1.gz", false, gz.len() as u64), gz.as_slice()),
        ])
        .await;

        let expanded = collect(expand_nar(
            std::io::Cursor::new(archive.clone()),
            ExpandOptions::default(),
        ))
        .await
        .unwrap();
        assert_eq!(expanded, archive);
    }

    #[tokio::test]
    async fn test_truncated_xz_passes_through() {
        // ends in .xz but is not a valid container
        let archive = build_archive(&[
            (NarEntry::directory(""), b"".as_slice()),
            (NarEntry::regular("broken.xz", false, 5), b"notxz".as_slice()),
        ])
        .await;
        let expanded = collect(expand_nar(
            std::io::Cursor::new(archive.clone()),
            ExpandOptions::default(),
        ))
        .await
        .unwrap();
        assert_eq!(expanded, archive);
    }

    #[tokio::test]
    async fn test_gz_expand_collapse_roundtrip() {
        if !gzip_available() {
            eprintln!("gzip not available, skipping");
            return;
        }

        // produce a strict-header gz with the real tool
        let payload = b"man page contents, repeated a few times. man page contents.\n";
        let mut child = std::process::Command::new(GZIP_BIN)
            .arg("-nc")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        use std::io::Write as _;
        child.stdin.take().unwrap().write_all(payload).unwrap();
        let gz = child.wait_with_output().unwrap().stdout;
        if gz.len() < 18 || gz[..10] != GZ_HEADER {
            eprintln!("local gzip output fails the strict header gate, skipping");
            return;
        }

        let archive = build_archive(&[
            (NarEntry::directory(""), b"".as_slice()),
            (NarEntry::directory("man1"), b""),
            (NarEntry::regular("man1/ls.1.gz", false, gz.len() as u64), gz.as_slice()),
            (NarEntry::regular("man1/plain.txt", false, 6), b"sixchr"),
        ])
        .await;

        let expanded = collect(expand_nar(
            std::io::Cursor::new(archive.clone()),
            ExpandOptions::default(),
        ))
        .await
        .unwrap();
        assert_ne!(expanded, archive);

        // the transformed archive carries the metadata + data entries in
        // place of the original
        let mut r = NarReader::new(expanded.as_slice());
        let mut paths = Vec::new();
        while let Some(entry) = r.next_entry().await.unwrap() {
            paths.push(String::from_utf8_lossy(&entry.path).into_owned());
            if let NarEntryKind::Regular { size, .. } = entry.kind {
                let body = r.read_body().await.unwrap();
                if entry.path.ends_with(META_SUFFIX) {
                    let meta: ExpandMeta = serde_json::from_slice(&body).unwrap();
                    assert_eq!(meta.algo, "gz");
                    assert_eq!(meta.compressed_size, gz.len() as u64);
                }
                if entry.path.ends_with(DATA_SUFFIX) {
                    assert_eq!(size, payload.len() as u64);
                    assert_eq!(body.as_ref(), payload);
                }
            }
        }
        assert_eq!(
            paths,
            vec![
                "",
                "man1",
                "man1/ls.1.gz\u{1}_exp1meta_",
                "man1/ls.1.gz\u{1}_exp2data_",
                "man1/plain.txt",
            ]
        );

        let collapsed = collect(collapse_nar(
            std::io::Cursor::new(expanded),
            ExpandOptions::default(),
        ))
        .await
        .unwrap();
        assert_eq!(collapsed, archive);
    }

    #[tokio::test]
    async fn test_collapse_rejects_meta_without_data() {
        let meta = br#"{"a":"gz","c":10}"#;
        let archive = build_archive(&[
            (NarEntry::directory(""), b"".as_slice()),
            (
                NarEntry::regular(b"x.gz\x01_exp1meta_".to_vec(), false, meta.len() as u64),
                meta.as_slice(),
            ),
            (NarEntry::regular("y.txt", false, 1), b"y"),
        ])
        .await;
        let res = collect(collapse_nar(
            std::io::Cursor::new(archive),
            ExpandOptions::default(),
        ))
        .await;
        assert!(res.is_err());
    }
}
