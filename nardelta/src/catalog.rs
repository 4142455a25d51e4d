//! Index of locally held packages, used to pick a delta base for an
//! incoming request.
//!
//! The catalog is an ordered set of `(rest, hash, system)` entries built
//! from the store directory listing. Updates clone the current set,
//! mutate the clone and publish it atomically; lookups run against
//! whatever snapshot they grabbed, so a refresh never disturbs a
//! concurrent scan.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Instant;

use regex::Regex;
use thiserror::Error;

use nardelta_protocol::{NarFilter, NarInfo};
use nardelta_store_core::{base32, find_dashes, match_len, StoreName, StorePath, STORE_DIR};

use crate::config::Config;
use crate::syschecker::{SysChecker, SysTag};

/// Packages whose contents are mostly embedded `.xz`/`.gz` files. They
/// are only worth diffing through the expand filter, and would otherwise
/// be rejected by the skip list.
static USE_EXPAND_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // kernel itself (xz)
        r"^linux-[\d.-]+$",
        // firmware packages (xz)
        r"^alsa-firmware-[\d.-]+-xz$",
        r"^libreelec-dvb-firmware-[\d.-]+-xz$",
        r"^rtl8192su-unstable-[\d.-]+-xz$",
        r"^rt5677-firmware-xz$",
        r"^intel2200BGFirmware-[\d.-]+-xz$",
        r"^rtw88-firmware-unstable-[\d.-]+-xz$",
        r"^linux-firmware-[\d.-]+-xz$", // this one is huge
        r"^wireless-regdb-[\d.-]+-xz$",
        r"^sof-firmware-[\d.-]+-xz$",
        r"^zd1211-firmware-[\d.-]+-xz$",
        // separate kernel modules (xz)
        r"^v4l2loopback-unstable-[\d.-]+$",
        // man pages (gz)
        r"^.*-.*-man$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// Compressed single files won't diff well anyway.
static SKIP_RES: LazyLock<Vec<Regex>> =
    LazyLock::new(|| vec![Regex::new(r"\.(drv|lock|bz2|gz|xz)$").expect("static pattern")]);

fn match_any(res: &[Regex], s: &str) -> bool {
    res.iter().any(|re| re.is_match(s))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CatalogEntry {
    pub rest: String,
    pub hash: [u8; 20],
    pub sys: SysTag,
}

#[derive(Error, Debug)]
pub enum FindBaseError {
    #[error("name too short")]
    TooShort,

    #[error("can't handle 'source'")]
    Source,

    #[error("no base found for {0}")]
    NoBase(String),
}

pub struct Catalog {
    cfg: Arc<Config>,
    snapshot: RwLock<Arc<BTreeSet<CatalogEntry>>>,
    sys_checker: Arc<SysChecker>,
}

impl Catalog {
    pub fn new(cfg: Arc<Config>, sys_checker: Arc<SysChecker>) -> Self {
        Self {
            cfg,
            snapshot: RwLock::new(Arc::new(BTreeSet::new())),
            sys_checker,
        }
    }

    /// Initial scan plus the periodic refresh task.
    pub fn start(self: &Arc<Self>) {
        let catalog = self.clone();
        tokio::spawn(async move {
            catalog.update().await;
            let mut ticker = tokio::time::interval(catalog.cfg.catalog_update_freq);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                catalog.update().await;
            }
        });
    }

    fn current(&self) -> Arc<BTreeSet<CatalogEntry>> {
        self.snapshot.read().expect("catalog lock poisoned").clone()
    }

    fn publish(&self, set: BTreeSet<CatalogEntry>) {
        *self.snapshot.write().expect("catalog lock poisoned") = Arc::new(set);
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    /// Rescan the store directory and publish a new snapshot.
    pub async fn update(&self) {
        let start = Instant::now();

        let mut dir = match tokio::fs::read_dir(STORE_DIR).await {
            Ok(dir) => dir,
            Err(e) => {
                log::warn!("catalog list error: {e}");
                return;
            }
        };

        let mut next = (*self.current()).clone();
        let mut names = Vec::with_capacity(2048);
        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                    if names.len() == 2048 {
                        self.add_batch(&mut next, &names).await;
                        names.clear();
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("catalog read_dir: {e}");
                    return;
                }
            }
        }
        self.add_batch(&mut next, &names).await;

        let total = next.len();
        self.publish(next);

        log::info!(
            "catalog updated: {total} paths in {:.2}s",
            start.elapsed().as_secs_f64()
        );
    }

    /// Seed the catalog from explicit store names (simulation runs). Use
    /// either this or [`start`], not both.
    ///
    /// [`start`]: Catalog::start
    pub async fn set(&self, names: &[String]) {
        let mut next = (*self.current()).clone();
        self.add_batch(&mut next, names).await;
        self.publish(next);
    }

    async fn add_batch(&self, next: &mut BTreeSet<CatalogEntry>, names: &[String]) {
        let mut batch = Vec::new();
        let mut store_paths = Vec::new();
        for name in names {
            let name = name
                .strip_prefix(STORE_DIR)
                .map(|n| n.trim_start_matches('/'))
                .unwrap_or(name);

            let Ok(parsed) = StoreName::parse(name) else {
                continue;
            };
            if match_any(&USE_EXPAND_RES, parsed.rest) {
                // allow despite the skip list
            } else if match_any(&SKIP_RES, parsed.rest) {
                continue;
            }
            let Ok(hash) = parsed.hash_bytes() else {
                log::warn!("bad hash {:?}", parsed.hash);
                continue;
            };
            let entry = CatalogEntry {
                rest: parsed.rest.to_string(),
                hash,
                sys: 0,
            };
            if !contains_ignoring_sys(next, &entry) {
                batch.push(entry);
                store_paths.push(StorePath::from_parts(parsed.hash, parsed.rest));
            }
        }
        if store_paths.is_empty() {
            return;
        }
        let tags = self.sys_checker.sys_for_store_paths(&store_paths).await;
        for (mut entry, sys) in batch.into_iter().zip(tags) {
            entry.sys = sys;
            next.insert(entry);
        }
    }

    /// Best local base for a requested package, plus the filter marker for
    /// compressed-contents packages.
    ///
    /// Candidates share the prefix up to the request's first dash. Of
    /// those, keep same system and same dash count (rejects `-dev`/`-doc`
    /// style sibling outputs and cross-ABI builds), then take the longest
    /// common prefix; later entries win ties, being probably more recent.
    pub async fn find_base(
        &self,
        ni: &NarInfo,
        req: &str,
    ) -> Result<(StorePath, Option<NarFilter>), FindBaseError> {
        if req.len() < 3 {
            return Err(FindBaseError::TooShort);
        } else if req == "source" {
            // no metadata to disambiguate contents
            return Err(FindBaseError::Source);
        }

        let req_sys = self.sys_checker.sys_from_narinfo(ni).await;

        let dashes = find_dashes(req);
        let start = match dashes.first() {
            None => req.to_string(),
            Some(&first) => req[..first + 1].to_string(),
        };

        let bt = self.current();
        let low = CatalogEntry {
            rest: start.clone(),
            hash: [0; 20],
            sys: 0,
        };

        let mut best: Option<&CatalogEntry> = None;
        let mut best_match = 0;
        for entry in bt.range(low..).take_while(|e| e.rest.starts_with(&start)) {
            if entry.sys == req_sys && find_dashes(&entry.rest).len() == dashes.len() {
                let m = match_len(req, &entry.rest);
                if m >= best_match {
                    best_match = m;
                    best = Some(entry);
                }
            }
        }

        let Some(best) = best else {
            return Err(FindBaseError::NoBase(req.to_string()));
        };

        let filter = if match_any(&USE_EXPAND_RES, &best.rest) {
            Some(NarFilter::ExpandV2)
        } else {
            None
        };

        log::info!(
            "catalog found base for {req} -> {}{}",
            best.rest,
            if filter.is_some() { " [expanded]" } else { "" }
        );
        let store_path = StorePath::from_parts(&base32::to_base32(&best.hash), &best.rest);
        Ok((store_path, filter))
    }
}

/// Membership test on `(rest, hash)` only; the stored system tag is
/// whatever the original resolution produced.
fn contains_ignoring_sys(set: &BTreeSet<CatalogEntry>, entry: &CatalogEntry) -> bool {
    set.range(
        CatalogEntry {
            rest: entry.rest.clone(),
            hash: entry.hash,
            sys: 0,
        }..,
    )
    .take_while(|e| e.rest == entry.rest && e.hash == entry.hash)
    .next()
    .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_and_allow_patterns() {
        assert!(match_any(&SKIP_RES, "something-1.2.drv"));
        assert!(match_any(&SKIP_RES, "patch-2.7.6.tar.xz"));
        assert!(match_any(&SKIP_RES, "config.lock"));
        assert!(!match_any(&SKIP_RES, "rsync-3.2.6"));

        assert!(match_any(&USE_EXPAND_RES, "linux-6.1.55"));
        assert!(match_any(&USE_EXPAND_RES, "linux-firmware-20230825-xz"));
        assert!(match_any(&USE_EXPAND_RES, "man-db-2.11.2-man"));
        assert!(!match_any(&USE_EXPAND_RES, "linux-pam-1.5.2"));
        assert!(!match_any(&USE_EXPAND_RES, "rsync-3.2.6"));
    }

    fn entry(rest: &str, hash_byte: u8, sys: SysTag) -> CatalogEntry {
        CatalogEntry {
            rest: rest.into(),
            hash: [hash_byte; 20],
            sys,
        }
    }

    fn catalog_with(entries: Vec<CatalogEntry>) -> Catalog {
        let cfg = Arc::new(crate::config::load().unwrap());
        let checker = Arc::new(SysChecker::new(cfg.clone(), reqwest::Client::new()));
        let catalog = Catalog::new(cfg, checker);
        catalog.publish(entries.into_iter().collect());
        catalog
    }

    fn narinfo(rest: &str) -> NarInfo {
        // no references, so the request resolves to the unknown system tag
        NarInfo {
            store_path: format!("/nix/store/{}-{rest}", "1".repeat(32)),
            url: "nar/xxxx.nar.xz".into(),
            compression: "xz".into(),
            file_hash: None,
            file_size: Some(100_000),
            nar_hash: "sha256:9fff".into(),
            nar_size: 400_000,
            references: vec![],
            deriver: None,
            sigs: vec![],
            ca: None,
        }
    }

    #[tokio::test]
    async fn test_find_base_longest_prefix_wins() {
        let catalog = catalog_with(vec![
            entry("pipewire-0.2.0", 1, 0),
            entry("pipewire-0.3.70", 2, 0),
            entry("pinentry-1.2.1", 3, 0),
        ]);
        let (path, filter) = catalog
            .find_base(&narinfo("pipewire-0.3.71"), "pipewire-0.3.71")
            .await
            .unwrap();
        assert!(path.as_str().ends_with("-pipewire-0.3.70"));
        assert_eq!(path.name().hash, base32::to_base32(&[2; 20]));
        assert!(filter.is_none());
    }

    #[tokio::test]
    async fn test_find_base_rejects_other_dash_count() {
        // prefix matches up to "git-2.38." but the dash counts differ
        let catalog = catalog_with(vec![entry("git-2.38.4-doc", 1, 0)]);
        assert!(matches!(
            catalog.find_base(&narinfo("git-2.38.5"), "git-2.38.5").await,
            Err(FindBaseError::NoBase(_))
        ));
    }

    #[tokio::test]
    async fn test_find_base_rejects_other_system() {
        let catalog = catalog_with(vec![entry("rsync-3.2.6", 1, 257)]);
        // request resolves to unknown (0), candidate is tagged 257
        assert!(matches!(
            catalog.find_base(&narinfo("rsync-3.2.7"), "rsync-3.2.7").await,
            Err(FindBaseError::NoBase(_))
        ));
    }

    #[tokio::test]
    async fn test_find_base_later_entry_wins_ties() {
        let catalog = catalog_with(vec![
            entry("zsh-5.9", 1, 0),
            entry("zsh-5.9", 9, 0),
        ]);
        let (path, _) = catalog.find_base(&narinfo("zsh-5.9"), "zsh-5.9").await.unwrap();
        assert_eq!(path.name().hash, base32::to_base32(&[9; 20]));
    }

    #[tokio::test]
    async fn test_find_base_marks_expandable_packages() {
        let catalog = catalog_with(vec![entry("linux-firmware-20230825-xz", 1, 0)]);
        let (_, filter) = catalog
            .find_base(
                &narinfo("linux-firmware-20230901-xz"),
                "linux-firmware-20230901-xz",
            )
            .await
            .unwrap();
        assert_eq!(filter, Some(NarFilter::ExpandV2));
    }

    #[tokio::test]
    async fn test_find_base_rejects_short_and_source() {
        let catalog = catalog_with(vec![]);
        assert!(matches!(
            catalog.find_base(&narinfo("ab"), "ab").await,
            Err(FindBaseError::TooShort)
        ));
        assert!(matches!(
            catalog.find_base(&narinfo("source"), "source").await,
            Err(FindBaseError::Source)
        ));
    }

    #[test]
    fn test_entry_ordering() {
        let a = CatalogEntry {
            rest: "git-2.38.4".into(),
            hash: [0; 20],
            sys: 5,
        };
        let b = CatalogEntry {
            rest: "git-2.38.4".into(),
            hash: [1; 20],
            sys: 0,
        };
        let c = CatalogEntry {
            rest: "git-2.38.5".into(),
            hash: [0; 20],
            sys: 0,
        };
        // ordered by rest first, then hash
        assert!(a < b);
        assert!(b < c);
    }
}
