//! Offline simulation: seed the catalog from one list of store names,
//! then drive the full metadata+archive flow for another list against a
//! discarding sink. Useful for measuring achievable ratios over a real
//! upgrade without a client in the loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::Semaphore;

use nardelta_store_core::STORE_DIR;

use crate::catalog::Catalog;
use crate::nar;
use crate::narinfo::{self, Lookup};
use crate::subst::Subst;

pub async fn run(
    reqs_file: &str,
    bases_file: &str,
    catalog: Arc<Catalog>,
    subst: Arc<Subst>,
) -> Result<()> {
    let reqs = std::fs::read_to_string(reqs_file)
        .with_context(|| format!("Couldn't read request list {reqs_file:?}"))?;
    let bases = std::fs::read_to_string(bases_file)
        .with_context(|| format!("Couldn't read base list {bases_file:?}"))?;

    let base_names: Vec<String> = bases
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    catalog.set(&base_names).await;
    log::info!("catalog seeded with {} paths", catalog.len());

    let sem = Arc::new(Semaphore::new(40));
    let success = Arc::new(AtomicU32::new(0));
    let errors = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();
    let mut total = 0;

    for line in reqs.lines() {
        let name = line
            .trim()
            .trim_start_matches(STORE_DIR)
            .trim_start_matches('/')
            .to_string();
        if name.is_empty() {
            continue;
        }
        total += 1;

        let sem = sem.clone();
        let subst = subst.clone();
        let success = success.clone();
        let errors = errors.clone();
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire().await;
            match request_one(&subst, &name).await {
                Ok(stats) => {
                    log::info!("req {} -> {stats}", &name[33.min(name.len())..]);
                    success.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::warn!("{e:#}");
                    errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    log::info!(
        "{total} paths total, {} diffed, {} err",
        success.load(Ordering::Relaxed),
        errors.load(Ordering::Relaxed)
    );
    Ok(())
}

async fn request_one(subst: &Subst, name: &str) -> Result<nardelta_protocol::DiffStats> {
    let hash = name.split('-').next().unwrap_or(name);

    let recent = match narinfo::lookup(subst, hash)
        .await
        .map_err(|e| anyhow!("get narinfo {name}: {e}"))?
    {
        Lookup::Found { recent, .. } => recent,
        Lookup::Miss { status, msg } => {
            return Err(anyhow!("get narinfo {name}: {status} {msg}"))
        }
    };

    let source = nar::delta_source(subst, &recent)
        .await
        .map_err(|e| anyhow!("get nar {name}: {e}"))?;
    let mut sink = tokio::io::sink();
    nar::reconstruct(subst, &recent, source, &mut sink)
        .await
        .map_err(|e| anyhow!("get nar {name}: {e}"))
}
