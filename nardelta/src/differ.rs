//! The differ endpoint: downloads both archives from the upstream cache,
//! runs the delta encoder, and streams the framed response back.

use std::io;
use std::sync::Arc;

use actix_web::{web, HttpResponse};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;

use nardelta_delta::{CreateArgs, DeltaAlgo, Input};
use nardelta_protocol::multipart::{random_boundary, MultipartWriter};
use nardelta_protocol::{
    cache_key, DifferHeader, DifferRequest, DifferTrailer, PART_BODY, PART_HEADER, PART_TRAILER,
};
use nardelta_store_core::StoreName;

use crate::config::Config;
use crate::deltacache::{self, TeeWriter};
use crate::download::{self, DownloadError};
use crate::error::{AppError, ServerError, ServerResult};

pub struct Differ {
    cfg: Arc<Config>,
    http: reqwest::Client,
    /// Disk budget in MiB-granular permits, sized from the temp dir's
    /// free space. Caps the bytes of concurrent download jobs.
    disk_sem: Arc<Semaphore>,
    disk_total_mib: u64,
    /// Roughly, each download uses some network plus a decompressor
    /// process, and each delta an encoder process, so together these
    /// allow about 2 × cpus processes.
    dl_sem: Arc<Semaphore>,
    delta_sem: Arc<Semaphore>,
}

const MIB: u64 = 1024 * 1024;

impl Differ {
    pub fn new(cfg: Arc<Config>, http: reqwest::Client) -> io::Result<Arc<Self>> {
        let stat = nix::sys::statvfs::statvfs(std::env::temp_dir().as_path())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let free_bytes = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        let disk_total_mib = (free_bytes * 9 / 10 / MIB).min(u32::MAX as u64);

        let concurrency = std::thread::available_parallelism().map_or(4, |n| n.get());

        Ok(Arc::new(Self {
            cfg,
            http,
            disk_sem: Arc::new(Semaphore::new(disk_total_mib as usize)),
            disk_total_mib,
            dl_sem: Arc::new(Semaphore::new(concurrency)),
            delta_sem: Arc::new(Semaphore::new(concurrency)),
        }))
    }
}

pub(crate) async fn post(
    differ: web::Data<Arc<Differ>>,
    body: web::Json<DifferRequest>,
) -> ServerResult {
    let differ = differ.get_ref().clone();
    let mut req = body.into_inner();
    if req.upstream.is_empty() {
        req.upstream = differ.cfg.upstream.clone();
    }

    let Some(algo) = DeltaAlgo::pick(&req.accept_algos) else {
        return Err(ServerError::with_status(
            actix_web::http::StatusCode::BAD_REQUEST,
            AppError::Internal(format!("unknown algo {:?}", req.accept_algos)),
        ));
    };

    // times two: base + requested, expected to be about the same size
    let need_mib = (req.req_nar_size * 2 / MIB + 1).min(u32::MAX as u64);
    if need_mib > differ.disk_total_mib {
        return Err(ServerError::with_status(
            actix_web::http::StatusCode::INSUFFICIENT_STORAGE,
            AppError::Internal(format!("{need_mib} MiB exceeds the disk budget")),
        ));
    }
    let disk_permit = differ
        .disk_sem
        .clone()
        .acquire_many_owned(need_mib as u32)
        .await
        .map_err(|_| ServerError::internal("canceled"))?;

    // base + request in parallel, each under a download slot
    let filter = req.nar_filter.map(|_| differ.cfg.expander_options());
    let request_dl = async {
        let _slot = differ.dl_sem.acquire().await;
        download::download_nar(
            &differ.http,
            &req.upstream,
            &req.req_name,
            &req.req_nar_path,
            filter,
        )
        .await
    };
    let base_dl = async {
        let _slot = differ.dl_sem.acquire().await;
        let base_name = req.base_store_path.rsplit('/').next().unwrap_or_default();
        let hash = StoreName::parse(base_name)
            .map(|name| name.hash.to_string())
            .map_err(|e| DownloadError::Io(io::Error::other(e)))?;
        download::download_nar_from_info(&differ.http, &req.upstream, &hash, filter).await
    };
    let (request_nar, base_nar) = match tokio::join!(request_dl, base_dl) {
        (Ok(r), Ok(b)) => (r, b),
        (Err(DownloadError::NotFound), _) | (_, Err(DownloadError::NotFound)) => {
            return Err(ServerError::with_status(
                actix_web::http::StatusCode::NOT_FOUND,
                AppError::Internal("nar download error: not found".to_string()),
            ));
        }
        (Err(e), _) | (_, Err(e)) => {
            return Err(ServerError::internal(format!("nar download error: {e}")));
        }
    };

    let delta_permit = differ
        .delta_sem
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ServerError::internal("canceled"))?;

    let boundary = random_boundary();
    let content_type = format!("multipart/form-data; boundary={boundary}");
    let (out, response_body) = tokio::io::duplex(256 * 1024);

    tokio::spawn(async move {
        // temp files and budget permits live for the whole job
        let _disk = disk_permit;
        let _delta = delta_permit;

        let mut mpw = MultipartWriter::new(out, boundary);
        if let Err(e) = run_job(&differ, &req, algo, &request_nar, &base_nar, &mut mpw).await {
            log::warn!("differ job for {}: {e}", req.req_name);
        }
    });

    Ok(HttpResponse::Ok()
        .insert_header((actix_web::http::header::CONTENT_TYPE, content_type))
        .streaming(ReaderStream::new(response_body)))
}

async fn run_job(
    differ: &Differ,
    req: &DifferRequest,
    algo: DeltaAlgo,
    request_nar: &download::Downloaded,
    base_nar: &download::Downloaded,
    mpw: &mut MultipartWriter<tokio::io::DuplexStream>,
) -> io::Result<()> {
    mpw.write_json_field(
        PART_HEADER,
        &DifferHeader {
            algo: algo.name().to_string(),
        },
    )
    .await?;
    mpw.begin_file_field(PART_BODY, "delta").await?;

    // tee the delta into the write-through cache while it streams out
    let (cache_tx, cache_task) = match &differ.cfg.cache_write_url {
        Some(url) => {
            let key = cache_key(req, algo.name());
            let (tx, handle) = deltacache::start_write(&differ.http, url, &key);
            (Some(tx), Some(handle))
        }
        None => (None, None),
    };
    let mut output = TeeWriter::new(mpw.inner_mut(), cache_tx);

    let result = algo
        .create(CreateArgs {
            base: Input::File(base_nar.file.path()),
            base_size: base_nar.size,
            request: Input::File(request_nar.file.path()),
            request_size: request_nar.size,
            output: &mut output,
        })
        .await;
    output.flush().await.ok();
    drop(output); // ends the cache upload stream
    if result.is_err() {
        // never leave a partial object behind
        if let Some(task) = &cache_task {
            task.abort();
        }
    }

    let trailer = match &result {
        Ok(stats) => {
            let mut stats = stats.clone();
            stats.base_size = base_nar.size;
            DifferTrailer {
                ok: true,
                stats: Some(stats),
                error: String::new(),
            }
        }
        Err(e) => DifferTrailer {
            ok: false,
            stats: None,
            error: e.to_string(),
        },
    };

    mpw.write_json_field(PART_TRAILER, &trailer).await?;
    mpw.close().await?;

    if trailer.ok {
        if let Some(task) = cache_task {
            let _ = task.await;
        }
        if let Some(stats) = &trailer.stats {
            log::info!("diffed {} -> {stats}", req.req_name);
        }
        Ok(())
    } else {
        Err(io::Error::other(trailer.error))
    }
}
