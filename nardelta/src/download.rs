//! Upstream archive downloads for the differ: fetch, decompress by URL
//! extension, optionally expand, and land the bytes in a temp file.

use std::io;
use std::process::Stdio;
use std::time::Instant;

use futures::TryStreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::StreamReader;

use nardelta_delta::ZSTD_BIN;
use nardelta_expander::{expand_nar, ExpandOptions, XZ_BIN};
use nardelta_protocol::NarInfo;
use nardelta_store_core::StoreName;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("not found")]
    NotFound,

    #[error("http error {0}")]
    Status(reqwest::StatusCode),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("narinfo parse error: {0}")]
    NarInfo(#[from] nardelta_protocol::NarInfoError),

    #[error("unknown compression {0:?}")]
    UnknownCompression(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct Downloaded {
    pub file: tempfile::NamedTempFile,
    pub size: u64,
}

/// Fetch one archive by its cache-relative path and spool the
/// decompressed (and optionally expanded) bytes to a temp file.
pub async fn download_nar(
    http: &reqwest::Client,
    upstream: &str,
    req_name: &str,
    nar_path: &str,
    filter: Option<ExpandOptions>,
) -> Result<Downloaded, DownloadError> {
    let start = Instant::now();
    let url = format!("http://{upstream}/{nar_path}");
    let res = http.get(&url).send().await?;
    if !res.status().is_success() {
        log::warn!("download http status {} for {url}", res.status());
        return Err(DownloadError::Status(res.status()));
    }

    let body = StreamReader::new(res.bytes_stream().map_err(io::Error::other));

    let basename = nar_path.rsplit('/').next().unwrap_or(nar_path);
    let extension = basename.rsplit_once('.').map_or("", |(_, ext)| ext);
    let (mut reader, decompress): (Box<dyn AsyncRead + Send + Unpin>, _) = match extension {
        "xz" => {
            let (child, stdout, feeder) = spawn_decompress(XZ_BIN, &["-d"], body)?;
            (Box::new(stdout), Some((child, feeder)))
        }
        "zst" => {
            let (child, stdout, feeder) = spawn_decompress(ZSTD_BIN, &["-d"], body)?;
            (Box::new(stdout), Some((child, feeder)))
        }
        "nar" | "" | "none" => (Box::new(body), None),
        other => return Err(DownloadError::UnknownCompression(other.to_string())),
    };

    if let Some(opts) = filter {
        reader = Box::new(expand_nar(reader, opts).into_async_read());
    }

    let file = tempfile::NamedTempFile::new()?;
    let mut out = tokio::fs::File::create(file.path()).await?;
    let size = tokio::io::copy(&mut reader, &mut out).await?;
    out.flush().await?;
    drop(reader); // EOF seen; release the decompressor's stdout

    if let Some((mut child, feeder)) = decompress {
        let status = child.wait().await?;
        let _ = feeder.await;
        if !status.success() {
            return Err(io::Error::other(format!("decompressor exited with {status}")).into());
        }
    }

    let elapsed = start.elapsed();
    log::info!(
        "downloaded {req_name} [{size} bytes] in {elapsed:.2?}: {:.3} MB/s",
        size as f64 / elapsed.as_secs_f64().max(1e-9) / 1e6,
    );
    Ok(Downloaded { file, size })
}

/// Fetch an archive by store hash: metadata lookup first, then the
/// archive it points at. A missing metadata record is the differ's 404.
pub async fn download_nar_from_info(
    http: &reqwest::Client,
    upstream: &str,
    store_hash: &str,
    filter: Option<ExpandOptions>,
) -> Result<Downloaded, DownloadError> {
    let url = format!("https://{upstream}/{store_hash}.narinfo");
    let res = http.get(&url).send().await?;
    if !res.status().is_success() {
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DownloadError::NotFound);
        }
        return Err(DownloadError::Status(res.status()));
    }
    let ni = NarInfo::parse(&res.text().await?)?;
    let req_name = ni
        .store_path
        .rsplit('/')
        .next()
        .and_then(|name| StoreName::parse(name).ok())
        .map(|name| name.rest.to_string())
        .unwrap_or_else(|| ni.store_path.clone());
    download_nar(http, upstream, &req_name, &ni.url, filter).await
}

fn spawn_decompress<R>(
    bin: &'static str,
    args: &[&str],
    mut src: R,
) -> io::Result<(
    tokio::process::Child,
    tokio::process::ChildStdout,
    tokio::task::JoinHandle<()>,
)>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut child = tokio::process::Command::new(bin)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;
    let mut stdin = child.stdin.take().expect("stdin is piped");
    let feeder = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut src, &mut stdin).await;
        let _ = stdin.shutdown().await;
    });
    let stdout = child.stdout.take().expect("stdout is piped");
    Ok((child, stdout, feeder))
}
