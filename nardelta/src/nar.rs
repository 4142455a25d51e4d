//! Archive endpoint: reconstructs the requested archive on the fly by
//! combining a locally regenerated base stream with the delta fetched
//! from the differ (or the small-delta cache), streaming the result to
//! the client as it is produced.

use std::io;
use std::process::Stdio;
use std::sync::Arc;

use actix_web::body::SizedStream;
use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use futures::TryStreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::{ReaderStream, StreamReader};

use nardelta_delta::{DeltaAlgo, ExpandArgs, Input};
use nardelta_expander::{collapse_nar, expand_nar};
use nardelta_protocol::multipart::{boundary_from_content_type, MultipartReader};
use nardelta_protocol::{
    cache_key, DiffStats, DifferHeader, DifferTrailer, PART_BODY, PART_HEADER, PART_TRAILER,
};

use crate::analytics::{AnDiff, AnRecord};
use crate::deltacache;
use crate::error::{AppError, IoErrorContext, ServerError, ServerResult};
use crate::subst::{Recent, Subst};

pub(crate) async fn get(path: web::Path<String>, subst: web::Data<Arc<Subst>>) -> ServerResult {
    subst.alive();
    let nar_basename = format!("{}.nar", path.into_inner());

    let Some(recent) = subst.get_recent(&nar_basename) else {
        return Ok(HttpResponse::NotFound().body("no recent found"));
    };

    let permit = subst
        .nar_sem
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ServerError::internal("canceled"))?;

    // everything up to the multipart header happens before the response
    // starts, so differ failures still map to proper status codes
    let source = delta_source(&subst, &recent).await?;

    let (mut out, body) = tokio::io::duplex(256 * 1024);
    let nar_size = recent.request.req_nar_size;
    let subst = subst.get_ref().clone();
    tokio::spawn(async move {
        let _permit = permit;
        match reconstruct(&subst, &recent, source, &mut out).await {
            Ok(stats) => log::info!("nar {} -> {stats}", recent.request.req_name),
            Err(e) => {
                // the stream just truncates; the client's archive hash
                // check rejects the partial fetch
                log::warn!("nar {} failed: {e}", recent.request.req_name);
            }
        }
    });

    Ok(HttpResponse::Ok()
        .insert_header((
            actix_web::http::header::CONTENT_TYPE,
            "application/x-nix-archive",
        ))
        .body(SizedStream::new(nar_size, ReaderStream::new(body))))
}

/// Where the delta bytes come from, plus the algorithm that decodes them.
pub(crate) struct DeltaSource {
    algo: DeltaAlgo,
    body: StreamReader<ReceiverStream, bytes::Bytes>,
    /// Present when the delta comes from the differ; resolved only after
    /// the body part has been drained.
    trailer: Option<oneshot::Receiver<io::Result<DifferTrailer>>>,
}

type ReceiverStream = std::pin::Pin<
    Box<dyn futures::Stream<Item = io::Result<bytes::Bytes>> + Send + 'static>,
>;

/// Try the small-delta cache, then fall back to a differ call.
pub(crate) async fn delta_source(
    subst: &Subst,
    recent: &Recent,
) -> Result<DeltaSource, ServerError> {
    if let Some(read_url) = &subst.cfg.cache_read_url {
        if let Some(algo) = DeltaAlgo::pick(&recent.request.accept_algos) {
            let key = cache_key(&recent.request, algo.name());
            if let Some(res) = deltacache::read(&subst.http, read_url, &key).await {
                log::info!("delta cache hit for {}", recent.request.req_name);
                let stream: ReceiverStream =
                    Box::pin(res.bytes_stream().map_err(io::Error::other));
                return Ok(DeltaSource {
                    algo,
                    body: StreamReader::new(stream),
                    trailer: None,
                });
            }
        }
    }

    differ_source(subst, recent).await
}

async fn differ_source(subst: &Subst, recent: &Recent) -> Result<DeltaSource, ServerError> {
    let res = subst
        .http
        .post(subst.differ_url())
        .json(&recent.request)
        .send()
        .await
        .map_err(AppError::from)?;

    let status = res.status();
    if !status.is_success() {
        // TODO: on most errors, fall back to proxying from upstream
        return Err(ServerError::with_status(
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            AppError::Internal(format!("differ http status {status}")),
        ));
    }

    let content_type = res
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let boundary = boundary_from_content_type(&content_type)
        .io_context("differ response content-type")?;

    let stream: ReceiverStream = Box::pin(res.bytes_stream().map_err(io::Error::other));
    let mut mpr = MultipartReader::new(stream, &boundary);

    // the header part names the algorithm; everything downstream can
    // start once it is known
    let part = mpr
        .next_part()
        .await
        .io_context("differ multipart header")?
        .ok_or_else(|| ServerError::internal("differ response has no parts"))?;
    if part.name != PART_HEADER {
        return Err(ServerError::internal("differ multipart header wrong name"));
    }
    let header: DifferHeader = part.json().await.io_context("differ multipart header")?;
    let algo = DeltaAlgo::by_name(&header.algo)
        .ok_or_else(|| ServerError::internal(format!("unknown algo {:?}", header.algo)))?;

    // forward the body into a channel; read the trailer once it's drained
    let (body_tx, body_rx) = mpsc::channel::<io::Result<bytes::Bytes>>(4);
    let (trailer_tx, trailer_rx) = oneshot::channel();
    tokio::spawn(async move {
        let res = pump_body(&mut mpr, &body_tx).await;
        if let Err(e) = &res {
            // abort the decoder too, not just the trailer wait
            let _ = body_tx.send(Err(io::Error::other(e.to_string()))).await;
        }
        let _ = trailer_tx.send(res);
    });

    let body_stream: ReceiverStream = Box::pin(futures::stream::unfold(
        body_rx,
        |mut rx| async move { rx.recv().await.map(|item| (item, rx)) },
    ));

    Ok(DeltaSource {
        algo,
        body: StreamReader::new(body_stream),
        trailer: Some(trailer_rx),
    })
}

async fn pump_body<S>(
    mpr: &mut MultipartReader<S>,
    body_tx: &mpsc::Sender<io::Result<bytes::Bytes>>,
) -> io::Result<DifferTrailer>
where
    S: futures::Stream<Item = io::Result<bytes::Bytes>> + Send + Unpin,
{
    let part = mpr
        .next_part()
        .await?
        .ok_or_else(|| io::Error::other("differ response missing body part"))?;
    if part.name != PART_BODY {
        return Err(io::Error::other("differ multipart body wrong name"));
    }
    let mut body = part.into_async_read();
    loop {
        let mut chunk = vec![0u8; 64 * 1024];
        let n = tokio::io::AsyncReadExt::read(&mut body, &mut chunk).await?;
        if n == 0 {
            break;
        }
        chunk.truncate(n);
        if body_tx.send(Ok(chunk.into())).await.is_err() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "decoder went away",
            ));
        }
    }
    drop(body);

    let part = mpr
        .next_part()
        .await?
        .ok_or_else(|| io::Error::other("differ response missing trailer part"))?;
    if part.name != PART_TRAILER {
        return Err(io::Error::other("differ multipart trailer wrong name"));
    }
    let trailer: DifferTrailer = part.json().await?;
    if mpr.next_part().await?.is_some() {
        return Err(io::Error::other("trailing multipart parts"));
    }
    Ok(trailer)
}

/// Run the reconstruction pipeline: dump the base locally, apply the
/// delta, optionally collapse, and write archive bytes into `out`.
pub(crate) async fn reconstruct<W>(
    subst: &Subst,
    recent: &Recent,
    source: DeltaSource,
    out: &mut W,
) -> Result<DiffStats, AppError>
where
    W: AsyncWrite + Send + Unpin,
{
    let cfg = &subst.cfg;
    let filtered = recent.request.nar_filter.is_some();

    let mut dump = tokio::process::Command::new(&cfg.nix_store_bin)
        .arg("--dump")
        .arg(&recent.request.base_store_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .io_context("base dump spawn")?;
    let dump_stdout = dump.stdout.take().expect("stdout is piped");

    let mut base: Box<dyn AsyncRead + Send + Unpin> = if filtered {
        Box::new(expand_nar(dump_stdout, cfg.expander_options()).into_async_read())
    } else {
        Box::new(dump_stdout)
    };

    let DeltaSource {
        algo,
        mut body,
        trailer,
    } = source;

    let expand_stats = if filtered {
        // decoder output runs through the collapse filter before the
        // client sees it
        let (decoded_w, decoded_r) = tokio::io::duplex(256 * 1024);
        let mut collapsed = collapse_nar(decoded_r, cfg.expander_options()).into_async_read();

        let decode = async {
            let mut decoded_w = decoded_w;
            let res = algo
                .expand(ExpandArgs {
                    base: Input::Stream(&mut base),
                    base_size: recent.request.base_nar_size,
                    delta: &mut body,
                    output: &mut decoded_w,
                })
                .await;
            decoded_w.shutdown().await.ok();
            drop(decoded_w);
            res
        };
        let copy = async { tokio::io::copy(&mut collapsed, out).await };

        let (stats, copy_res) = tokio::join!(decode, copy);
        let stats = stats?; // a decoder failure is the root cause
        copy_res.io_context("collapse filter")?;
        stats
    } else {
        algo.expand(ExpandArgs {
            base: Input::Stream(&mut base),
            base_size: recent.request.base_nar_size,
            delta: &mut body,
            output: out,
        })
        .await?
    };
    out.flush().await.io_context("output flush")?;

    let dump_status = dump.wait().await.io_context("base dump wait")?;
    if !dump_status.success() {
        return Err(AppError::Internal(format!(
            "base dump exited with {dump_status}"
        )));
    }

    // the trailer is the authoritative success signal; bytes may already
    // have streamed when it reports a failure
    let mut stats = match trailer {
        Some(rx) => {
            let trailer = rx
                .await
                .map_err(|_| AppError::Internal("trailer lost".to_string()))?
                .io_context("differ multipart trailer")?;
            if !trailer.ok {
                return Err(AppError::Internal(format!(
                    "differ trailer not ok: {}",
                    trailer.error
                )));
            }
            trailer.stats.unwrap_or_default()
        }
        None => DiffStats {
            algo: algo.name().to_string(),
            level: algo.level() as u64,
            ..Default::default()
        },
    };
    stats.exp_total_ms = expand_stats.exp_total_ms;
    stats.exp_user_ms = expand_stats.exp_user_ms;
    stats.exp_sys_ms = expand_stats.exp_sys_ms;

    *recent.stats.lock().expect("stats lock poisoned") = Some(stats.clone());

    subst.analytics.write(AnRecord {
        d: Some(AnDiff {
            id: recent.id.clone(),
            stats: Some(stats.clone()),
        }),
        ..Default::default()
    });

    Ok(stats)
}
