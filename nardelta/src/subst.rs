//! Shared state of the cache-impersonating substituter.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Semaphore;

use nardelta_protocol::{DiffStats, DifferRequest, DIFFER_PATH};

use crate::analytics::Analytics;
use crate::catalog::Catalog;
use crate::config::Config;

/// Context a follow-up archive fetch needs, stored when the rewritten
/// metadata goes out. Bounded; an entry that ages out just turns into a
/// 404 and the client moves on to the next substituter.
pub struct Recent {
    pub id: String,
    pub request: DifferRequest,
    /// Filled once the reconstruction finishes; simulation reads it back.
    pub stats: Mutex<Option<DiffStats>>,
}

pub struct Subst {
    pub cfg: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub analytics: Analytics,
    pub http: reqwest::Client,
    /// Bounds concurrent metadata lookups.
    pub narinfo_sem: Arc<Semaphore>,
    /// Bounds concurrent archive reconstructions; a permit rides along
    /// with the streaming task, not just the handler.
    pub nar_sem: Arc<Semaphore>,
    recents: Mutex<LruCache<String, Arc<Recent>>>,
    last_request: AtomicI64,
}

impl Subst {
    pub fn new(
        cfg: Arc<Config>,
        catalog: Arc<Catalog>,
        analytics: Analytics,
        http: reqwest::Client,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            catalog,
            analytics,
            http,
            narinfo_sem: Arc::new(Semaphore::new(40)),
            nar_sem: Arc::new(Semaphore::new(20)),
            recents: Mutex::new(LruCache::new(NonZeroUsize::new(10_000).expect("nonzero"))),
            last_request: AtomicI64::new(chrono::Utc::now().timestamp()),
        })
    }

    pub fn alive(&self) {
        self.last_request
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_request.load(Ordering::Relaxed);
        let idle = chrono::Utc::now().timestamp().saturating_sub(last);
        Duration::from_secs(idle.max(0) as u64)
    }

    pub fn get_recent(&self, nar_basename: &str) -> Option<Arc<Recent>> {
        self.recents
            .lock()
            .expect("recents lock poisoned")
            .get(nar_basename)
            .cloned()
    }

    pub fn put_recent(&self, nar_basename: String, recent: Arc<Recent>) {
        self.recents
            .lock()
            .expect("recents lock poisoned")
            .put(nar_basename, recent);
    }

    pub async fn upstream_narinfo(&self, hash: &str, head: bool) -> reqwest::Result<reqwest::Response> {
        let url = format!("https://{}/{hash}.narinfo", self.cfg.upstream);
        let req = if head {
            self.http.head(&url)
        } else {
            self.http.get(&url)
        };
        req.send().await
    }

    pub fn differ_url(&self) -> String {
        let differ = &self.cfg.differ;
        if differ.starts_with("http://") || differ.starts_with("https://") {
            match url::Url::parse(differ) {
                Ok(mut u) => {
                    u.set_path(DIFFER_PATH);
                    return u.to_string();
                }
                Err(e) => log::warn!("bad differ url {differ:?}: {e}"),
            }
        }
        format!("https://{differ}{DIFFER_PATH}")
    }
}

pub fn is_not_found(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::NOT_FOUND
        || status == reqwest::StatusCode::UNAUTHORIZED
        || status == reqwest::StatusCode::FORBIDDEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syschecker::SysChecker;

    fn subst_with_differ(differ: &str) -> Arc<Subst> {
        let mut cfg = crate::config::load().unwrap();
        cfg.differ = differ.to_string();
        let cfg = Arc::new(cfg);
        let http = reqwest::Client::new();
        let checker = Arc::new(SysChecker::new(cfg.clone(), http.clone()));
        let catalog = Arc::new(Catalog::new(cfg.clone(), checker));
        Subst::new(cfg, catalog, Analytics::disabled(), http)
    }

    #[tokio::test]
    async fn test_differ_url() {
        assert_eq!(
            subst_with_differ("http://localhost:7420").differ_url(),
            format!("http://localhost:7420{DIFFER_PATH}")
        );
        assert_eq!(
            subst_with_differ("https://differ.example.org/ignored").differ_url(),
            format!("https://differ.example.org{DIFFER_PATH}")
        );
        assert_eq!(
            subst_with_differ("differ.example.org:7420").differ_url(),
            format!("https://differ.example.org:7420{DIFFER_PATH}")
        );
    }

    #[tokio::test]
    async fn test_recents_lru() {
        let subst = subst_with_differ("http://localhost:7420");
        assert!(subst.get_recent("x.nar").is_none());
        subst.put_recent(
            "x.nar".to_string(),
            Arc::new(Recent {
                id: "id1".into(),
                request: DifferRequest {
                    req_nar_path: "nar/x.nar.xz".into(),
                    base_store_path: "/nix/store/b".into(),
                    accept_algos: vec![],
                    nar_filter: None,
                    upstream: String::new(),
                    base_nar_size: 0,
                    req_nar_size: 0,
                    req_name: String::new(),
                },
                stats: Mutex::new(None),
            }),
        );
        assert_eq!(subst.get_recent("x.nar").unwrap().id, "id1");
    }
}
