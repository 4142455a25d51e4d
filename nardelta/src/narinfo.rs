//! Metadata endpoint: forwards the lookup upstream, finds a base, and
//! rewrites the record so the client fetches an uncompressed archive from
//! our own `nar/` endpoint.

use std::sync::{Arc, Mutex};

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};

use nardelta_protocol::{
    NarInfo, FAILED_IDENTICAL, FAILED_NOT_FOUND, FAILED_NO_BASE, FAILED_TOO_BIG, FAILED_TOO_SMALL,
};
use nardelta_store_core::{base32, StorePath};

use crate::analytics::{self, AnRecord, AnRequest};
use crate::error::{AppError, ServerError, ServerResult};
use crate::subst::{is_not_found, Recent, Subst};

pub(crate) enum Lookup {
    Found { recent: Arc<Recent>, body: String },
    Miss { status: StatusCode, msg: String },
}

pub(crate) async fn get(
    req: HttpRequest,
    path: web::Path<String>,
    subst: web::Data<Arc<Subst>>,
) -> ServerResult {
    subst.alive();
    let hash = path.into_inner();
    if hash.is_empty() || !hash.bytes().all(|b| base32::BASE32_ALPHABET.contains(&b)) {
        return Ok(HttpResponse::NotFound().finish());
    }

    let _permit = subst
        .narinfo_sem
        .acquire()
        .await
        .map_err(|_| ServerError::internal("canceled"))?;

    if req.method() == actix_web::http::Method::HEAD {
        let res = subst
            .upstream_narinfo(&hash, true)
            .await
            .map_err(AppError::from)?;
        let status = StatusCode::from_u16(res.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Ok(HttpResponse::build(status).finish());
    }

    match lookup(&subst, &hash).await? {
        Lookup::Found { body, .. } => Ok(HttpResponse::Ok()
            .insert_header((actix_web::http::header::CONTENT_TYPE, NarInfo::content_type()))
            .body(body)),
        Lookup::Miss { status, msg } => {
            log::info!("narinfo {hash} -> {status} {msg}");
            Ok(HttpResponse::build(status).body(msg))
        }
    }
}

/// Listings are deliberately unsupported; the client falls through to the
/// next cache.
pub(crate) async fn reject_listing(subst: web::Data<Arc<Subst>>) -> HttpResponse {
    subst.alive();
    HttpResponse::NotFound().finish()
}

/// The metadata flow shared by the HTTP handler and the simulation
/// driver. On success the recent memo has been stored before the body is
/// handed back.
pub(crate) async fn lookup(subst: &Subst, hash: &str) -> Result<Lookup, ServerError> {
    let reqid = analytics::new_id();

    let res = subst
        .upstream_narinfo(hash, false)
        .await
        .map_err(AppError::from)?;
    let status = res.status();
    if is_not_found(status) {
        subst.analytics.write(AnRecord {
            r: Some(AnRequest {
                id: reqid,
                req_store_path: hash.to_string(),
                failed: FAILED_NOT_FOUND.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        return Ok(Lookup::Miss {
            status: StatusCode::NOT_FOUND,
            msg: "upstream not found".to_string(),
        });
    } else if !status.is_success() {
        return Ok(Lookup::Miss {
            status: StatusCode::from_u16(status.as_u16())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            msg: format!("upstream http status {status}"),
        });
    }

    let text = res.text().await.map_err(AppError::from)?;
    let ni = NarInfo::parse(&text).map_err(AppError::from)?;
    let store_path = StorePath::parse(&ni.store_path).map_err(AppError::from)?;
    let name = store_path.name();
    let store_name = name.to_string();

    let file_size = ni.file_size.unwrap_or(0);
    let cfg = &subst.cfg;
    if file_size < cfg.min_file_size
        || file_size > cfg.max_file_size
        || ni.nar_size > cfg.max_nar_size
    {
        let code = if file_size > cfg.max_file_size || ni.nar_size > cfg.max_nar_size {
            FAILED_TOO_BIG
        } else {
            FAILED_TOO_SMALL
        };
        subst.analytics.write(AnRecord {
            r: Some(AnRequest {
                id: reqid,
                req_store_path: store_name,
                nar_size: ni.nar_size,
                file_size,
                failed: code.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        // too small or too big, pretend we don't have it
        let msg = format!("{} is too {} ({file_size})", name.rest, &code[3..]);
        return Ok(Lookup::Miss {
            status: StatusCode::NOT_FOUND,
            msg,
        });
    }

    let found = subst.catalog.find_base(&ni, name.rest).await;
    let (base, nar_filter) = match found {
        Ok((base, _)) if base.name().hash == name.hash => {
            // only reachable in simulation, the client wouldn't request a
            // path it already has
            subst.analytics.write(AnRecord {
                r: Some(AnRequest {
                    id: reqid,
                    req_store_path: store_name,
                    nar_size: ni.nar_size,
                    file_size,
                    failed: FAILED_IDENTICAL.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            return Ok(Lookup::Miss {
                status: StatusCode::NOT_FOUND,
                msg: "identical".to_string(),
            });
        }
        Err(e) => {
            subst.analytics.write(AnRecord {
                r: Some(AnRequest {
                    id: reqid,
                    req_store_path: store_name,
                    nar_size: ni.nar_size,
                    file_size,
                    failed: FAILED_NO_BASE.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            return Ok(Lookup::Miss {
                status: StatusCode::NOT_FOUND,
                msg: e.to_string(),
            });
        }
        Ok(found) => found,
    };

    // new url for the uncompressed nar
    let new_url = format!("nar/{}.nar", ni.nar_hash_bare());
    let nar_basename = new_url
        .rsplit('/')
        .next()
        .expect("rsplit yields at least one")
        .to_string();

    let recent = Arc::new(Recent {
        id: reqid.clone(),
        request: nardelta_protocol::DifferRequest {
            req_nar_path: ni.url.clone(),
            base_store_path: base.as_str().to_string(),
            accept_algos: cfg.diff_algo.split(',').map(str::to_string).collect(),
            nar_filter,
            upstream: cfg.upstream.clone(),
            base_nar_size: 0,
            req_nar_size: ni.nar_size,
            req_name: name.rest.to_string(),
        },
        stats: Mutex::new(None),
    });
    // stored before the metadata goes out so the follow-up archive fetch
    // always resolves
    subst.put_recent(nar_basename, recent.clone());

    let rewritten = ni.to_uncompressed(new_url);

    subst.analytics.write(AnRecord {
        r: Some(AnRequest {
            id: reqid,
            req_store_path: store_name,
            base_store_path: base.name().to_string(),
            nar_size: ni.nar_size,
            file_size,
            differ_request: Some(recent.request.clone()),
            ..Default::default()
        }),
        ..Default::default()
    });

    Ok(Lookup::Found {
        recent,
        body: rewritten.to_text(),
    })
}
