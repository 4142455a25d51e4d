//! Optional small-delta cache: read-through on the substituter,
//! write-through on the differ. The backing store is an object-store
//! endpoint with public reads and time-bounded expiration; entries are
//! advisory and may vanish at any time.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Read one precomputed delta. Any failure is a miss.
pub async fn read(
    http: &reqwest::Client,
    read_url: &str,
    key: &str,
) -> Option<reqwest::Response> {
    let url = format!("{}/{key}", read_url.trim_end_matches('/'));
    match http.get(&url).send().await {
        Ok(res) if res.status().is_success() => Some(res),
        Ok(res) => {
            log::debug!("delta cache miss {key}: {}", res.status());
            None
        }
        Err(e) => {
            log::debug!("delta cache read error {key}: {e}");
            None
        }
    }
}

/// Background upload of one delta keyed by `key`. Feed it through the
/// returned sender; abort the handle to drop a partial object.
pub fn start_write(
    http: &reqwest::Client,
    write_url: &str,
    key: &str,
) -> (mpsc::Sender<Bytes>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<Bytes>(8);
    let url = format!("{}/{key}", write_url.trim_end_matches('/'));
    let http = http.clone();
    let key = key.to_string();
    let handle = tokio::spawn(async move {
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok::<_, io::Error>(chunk), rx))
        });
        let res = http
            .put(&url)
            .header(reqwest::header::CACHE_CONTROL, "public, max-age=31536000")
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await;
        match res {
            Ok(res) if res.status().is_success() => {
                log::info!("uploaded cache object {key}");
            }
            Ok(res) => log::warn!("cache upload {key} failed: {}", res.status()),
            Err(e) => log::warn!("cache upload {key} failed: {e}"),
        }
    });
    (tx, handle)
}

/// Duplicates everything written into `main` into the cache upload. A
/// full upload channel back-pressures; a failed upload is dropped and
/// writing continues on `main` alone.
pub struct TeeWriter<W> {
    main: W,
    cache: Option<PollSender<Bytes>>,
}

impl<W: AsyncWrite + Unpin> TeeWriter<W> {
    pub fn new(main: W, cache: Option<mpsc::Sender<Bytes>>) -> Self {
        Self {
            main,
            cache: cache.map(PollSender::new),
        }
    }

    pub fn into_inner(self) -> W {
        self.main
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for TeeWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // reserve the cache slot before touching main, so nothing is
        // consumed when we return Pending
        if let Some(cache) = &mut self.cache {
            if ready!(cache.poll_reserve(cx)).is_err() {
                log::warn!("error writing to cache, aborting cache write");
                self.cache = None;
            }
        }
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.main).poll_write(cx, buf))?;
        if n > 0 {
            if let Some(cache) = &mut this.cache {
                if cache.send_item(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    log::warn!("error writing to cache, aborting cache write");
                    this.cache = None;
                }
            }
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.main).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(cache) = &mut self.cache {
            cache.close();
        }
        Pin::new(&mut self.main).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_tee_duplicates_writes() {
        let (tx, mut rx) = mpsc::channel::<Bytes>(8);
        let mut main = Vec::new();
        {
            let mut tee = TeeWriter::new(&mut main, Some(tx));
            tee.write_all(b"hello ").await.unwrap();
            tee.write_all(b"world").await.unwrap();
            tee.shutdown().await.unwrap();
        }
        assert_eq!(main, b"hello world");

        let mut cached = Vec::new();
        while let Some(chunk) = rx.recv().await {
            cached.extend_from_slice(&chunk);
        }
        assert_eq!(cached, b"hello world");
    }

    #[tokio::test]
    async fn test_tee_survives_dropped_consumer() {
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        drop(rx);
        let mut main = Vec::new();
        let mut tee = TeeWriter::new(&mut main, Some(tx));
        tee.write_all(b"still works").await.unwrap();
        assert_eq!(main, b"still works");
    }
}
