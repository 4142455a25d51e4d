//! Resolves the "system" of a store path: an opaque ABI+architecture tag
//! used to keep base selection from pairing packages across platforms.
//!
//! The tag is derived from file presence in a libc-like dependency (which
//! dynamic linker exists) or, for grub, in the package itself. Presence is
//! checked against the local store for catalog entries and against the
//! upstream `.ls` listing for requested packages. Misclassification only
//! costs base matches; the client's archive hash check is the final
//! arbiter.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, LazyLock};

use lru::LruCache;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::{Mutex, OnceCell, Semaphore};

use nardelta_protocol::NarInfo;
use nardelta_store_core::{StoreName, StorePath, STORE_DIR};

use crate::config::Config;

/// Opaque system tag. 0 always means unknown; other values are only
/// consistent within one process.
pub type SysTag = u32;

pub const SYS_UNKNOWN: SysTag = 0;

const ARCH_X86_64: SysTag = 1;
const ARCH_I686: SysTag = 2;
const ARCH_AARCH64: SysTag = 3;
const LIBC_GLIBC: SysTag = 1 << 8;
const LIBC_MUSL: SysTag = 2 << 8;
const GRUB_X86_64: SysTag = 21;
const GRUB_I686: SysTag = 22;

static LIBC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(glibc-[\d.-]+|musl-[\d.]+)$").expect("static pattern"));
// grub has both a host and a target
static GRUB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^grub-[\d.-]+$").expect("static pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Missing,
    Regular,
    Directory,
    Symlink,
    Other,
}

trait PresenceSource {
    fn check(&self, path: &str) -> Presence;
}

pub struct SysChecker {
    cfg: Arc<Config>,
    http: reqwest::Client,
    listing_sem: Semaphore,
    state: Mutex<CheckerState>,
}

struct CheckerState {
    cache: LruCache<String, SysTag>,
    pending: HashMap<String, Arc<OnceCell<SysTag>>>,
}

impl SysChecker {
    pub fn new(cfg: Arc<Config>, http: reqwest::Client) -> Self {
        Self {
            cfg,
            http,
            listing_sem: Semaphore::new(20),
            state: Mutex::new(CheckerState {
                cache: LruCache::new(NonZeroUsize::new(10_000).expect("nonzero")),
                pending: HashMap::new(),
            }),
        }
    }

    /// Tags for a batch of local store paths, resolved with one
    /// `nix path-info` invocation and local file inspection.
    pub async fn sys_for_store_paths(&self, store_paths: &[StorePath]) -> Vec<SysTag> {
        let mut out = vec![SYS_UNKNOWN; store_paths.len()];
        let info = match self.query_path_info(store_paths).await {
            Ok(info) => info,
            Err(e) => {
                log::warn!("path-info batch failed: {e}");
                return out;
            }
        };
        let by_path: HashMap<&str, &PathInfoItem> =
            info.iter().map(|i| (i.path.as_str(), i)).collect();

        for (i, store_path) in store_paths.iter().enumerate() {
            let Some(item) = by_path.get(store_path.as_str()) else {
                continue;
            };
            let refs: Vec<&str> = item
                .references
                .iter()
                .filter_map(|r| r.strip_prefix(STORE_DIR).and_then(|r| r.strip_prefix('/')))
                .collect();
            out[i] = self
                .sys_from_deps(store_path.name(), &refs, ProbeVia::LocalStore)
                .await;
        }
        out
    }

    /// Tag for an upstream package, from its metadata record. Presence is
    /// probed through the upstream file listing.
    pub async fn sys_from_narinfo(&self, ni: &NarInfo) -> SysTag {
        let Ok(store_path) = StorePath::parse(&ni.store_path) else {
            return SYS_UNKNOWN;
        };
        let refs: Vec<&str> = ni.references.iter().map(String::as_str).collect();
        self.sys_from_deps(store_path.name(), &refs, ProbeVia::UpstreamListing)
            .await
    }

    async fn sys_from_deps(
        &self,
        store_name: StoreName<'_>,
        deps: &[&str],
        via: ProbeVia,
    ) -> SysTag {
        if GRUB_RE.is_match(store_name.rest) {
            let full = format!("{}-{}", store_name.hash, store_name.rest);
            return self
                .cached(store_name.hash, || async {
                    match self.probe_source(via, &full).await {
                        Some(src) => sys_from_grub(&src, &full),
                        None => SYS_UNKNOWN,
                    }
                })
                .await;
        }
        for dep in deps {
            let Ok(dep_name) = StoreName::parse(dep) else {
                continue;
            };
            if LIBC_RE.is_match(dep_name.rest) {
                return self
                    .cached(dep_name.hash, || async {
                        match self.probe_source(via, dep).await {
                            Some(src) => sys_from_libc(&src, dep),
                            None => SYS_UNKNOWN,
                        }
                    })
                    .await;
            }
        }
        SYS_UNKNOWN
    }

    async fn probe_source(&self, via: ProbeVia, store_name: &str) -> Option<Source> {
        match via {
            ProbeVia::LocalStore => Some(Source::Local(LocalPresence {
                store_name: store_name.to_string(),
            })),
            ProbeVia::UpstreamListing => {
                let hash = store_name.get(..32)?;
                self.fetch_listing(hash).await.map(Source::Listing)
            }
        }
    }

    /// Memoized by store hash, with concurrent misses coalesced so each
    /// hash is resolved at most once.
    async fn cached<F, Fut>(&self, hash: &str, f: F) -> SysTag
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = SysTag>,
    {
        let cell = {
            let mut state = self.state.lock().await;
            if let Some(v) = state.cache.get(hash) {
                return *v;
            }
            state
                .pending
                .entry(hash.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let value = *cell.get_or_init(f).await;

        let mut state = self.state.lock().await;
        state.cache.put(hash.to_string(), value);
        state.pending.remove(hash);
        value
    }

    async fn query_path_info(
        &self,
        store_paths: &[StorePath],
    ) -> std::io::Result<Vec<PathInfoItem>> {
        let output = tokio::process::Command::new(&self.cfg.nix_bin)
            .arg("path-info")
            .arg("--json")
            .args(store_paths.iter().map(|p| p.as_str()))
            .stderr(std::process::Stdio::inherit())
            .output()
            .await?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "path-info exited with {}",
                output.status
            )));
        }
        serde_json::from_slice(&output.stdout).map_err(std::io::Error::other)
    }

    async fn fetch_listing(&self, store_hash: &str) -> Option<ListingNode> {
        let _permit = self.listing_sem.acquire().await.ok()?;
        let url = format!("https://{}/{store_hash}.ls", self.cfg.upstream);
        let res = self.http.get(&url).send().await.ok()?;
        if !res.status().is_success() {
            return None;
        }
        // brotli/gzip content-encodings are handled by the client
        let listing: Listing = res.json().await.ok()?;
        Some(listing.root)
    }
}

#[derive(Debug, Deserialize)]
struct PathInfoItem {
    path: String,
    #[serde(default)]
    references: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Listing {
    root: ListingNode,
}

#[derive(Debug, Deserialize)]
struct ListingNode {
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    entries: HashMap<String, ListingNode>,
}

impl ListingNode {
    fn lookup(&self, path: &str) -> Presence {
        let mut node = self;
        for part in path.split('/') {
            match node.entries.get(part) {
                Some(child) => node = child,
                None => return Presence::Missing,
            }
        }
        match node.node_type.as_str() {
            "regular" => Presence::Regular,
            "directory" => Presence::Directory,
            "symlink" => Presence::Symlink,
            _ => Presence::Other,
        }
    }
}

#[derive(Clone, Copy)]
enum ProbeVia {
    LocalStore,
    UpstreamListing,
}

enum Source {
    Local(LocalPresence),
    Listing(ListingNode),
}

impl PresenceSource for Source {
    fn check(&self, path: &str) -> Presence {
        match self {
            Source::Local(local) => local.check(path),
            Source::Listing(root) => root.lookup(path),
        }
    }
}

/// Presence via lstat under the local store.
struct LocalPresence {
    store_name: String,
}

impl PresenceSource for LocalPresence {
    fn check(&self, path: &str) -> Presence {
        let full = format!("{STORE_DIR}/{}/{path}", self.store_name);
        match std::fs::symlink_metadata(&full) {
            Err(_) => Presence::Missing,
            Ok(meta) => {
                let ft = meta.file_type();
                if ft.is_file() {
                    Presence::Regular
                } else if ft.is_dir() {
                    Presence::Directory
                } else if ft.is_symlink() {
                    Presence::Symlink
                } else {
                    Presence::Other
                }
            }
        }
    }
}

fn sys_from_libc<S: PresenceSource>(source: &S, thing: &str) -> SysTag {
    let sys = match () {
        _ if source.check("lib/ld-linux-x86-64.so.2") != Presence::Missing => {
            LIBC_GLIBC | ARCH_X86_64
        }
        _ if source.check("lib/ld-linux-aarch64.so.1") != Presence::Missing => {
            LIBC_GLIBC | ARCH_AARCH64
        }
        _ if source.check("lib/ld-linux.so.2") != Presence::Missing => LIBC_GLIBC | ARCH_I686,
        _ if source.check("lib/ld-musl-x86_64.so.1") != Presence::Missing => {
            LIBC_MUSL | ARCH_X86_64
        }
        _ if source.check("lib/ld-musl-aarch64.so.1") != Presence::Missing => {
            LIBC_MUSL | ARCH_AARCH64
        }
        _ if source.check("lib/ld-musl-i386.so.1") != Presence::Missing => LIBC_MUSL | ARCH_I686,
        _ => SYS_UNKNOWN,
    };
    if sys == SYS_UNKNOWN {
        log::info!("couldn't find system from {thing}");
    }
    sys
}

fn sys_from_grub<S: PresenceSource>(source: &S, thing: &str) -> SysTag {
    // the host binaries could be glibc or musl; unlikely to be mixed on
    // one machine, so only the target matters
    let sys = match () {
        _ if source.check("lib/grub/x86_64-efi") != Presence::Missing => GRUB_X86_64,
        _ if source.check("lib/grub/i386-pc") != Presence::Missing => GRUB_I686,
        _ => SYS_UNKNOWN,
    };
    if sys == SYS_UNKNOWN {
        log::info!("couldn't find system from {thing}");
    }
    sys
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapPresence(HashMap<&'static str, Presence>);

    impl PresenceSource for MapPresence {
        fn check(&self, path: &str) -> Presence {
            *self.0.get(path).unwrap_or(&Presence::Missing)
        }
    }

    #[test]
    fn test_libc_probe() {
        let glibc_x86 = MapPresence(HashMap::from([(
            "lib/ld-linux-x86-64.so.2",
            Presence::Regular,
        )]));
        assert_eq!(
            sys_from_libc(&glibc_x86, "glibc-2.37"),
            LIBC_GLIBC | ARCH_X86_64
        );

        let musl_aarch64 = MapPresence(HashMap::from([(
            "lib/ld-musl-aarch64.so.1",
            Presence::Symlink,
        )]));
        assert_eq!(
            sys_from_libc(&musl_aarch64, "musl-1.2"),
            LIBC_MUSL | ARCH_AARCH64
        );

        let empty = MapPresence(HashMap::new());
        assert_eq!(sys_from_libc(&empty, "glibc-?"), SYS_UNKNOWN);
    }

    #[test]
    fn test_grub_probe() {
        let efi = MapPresence(HashMap::from([("lib/grub/x86_64-efi", Presence::Directory)]));
        assert_eq!(sys_from_grub(&efi, "grub-2.06"), GRUB_X86_64);
    }

    #[test]
    fn test_libc_name_patterns() {
        assert!(LIBC_RE.is_match("glibc-2.37-8"));
        assert!(LIBC_RE.is_match("musl-1.2.3"));
        assert!(!LIBC_RE.is_match("glibc-2.37-8-dev"));
        assert!(!LIBC_RE.is_match("xglibc-2.37"));
        assert!(GRUB_RE.is_match("grub-2.06"));
        assert!(!GRUB_RE.is_match("grub-2.06-dev"));
    }

    #[test]
    fn test_listing_lookup() {
        let json = r#"{
            "version": 1,
            "root": {
                "type": "directory",
                "entries": {
                    "lib": {
                        "type": "directory",
                        "entries": {
                            "ld-linux-x86-64.so.2": {"type": "regular", "size": 1}
                        }
                    }
                }
            }
        }"#;
        let listing: Listing = serde_json::from_str(json).unwrap();
        assert_eq!(
            listing.root.lookup("lib/ld-linux-x86-64.so.2"),
            Presence::Regular
        );
        assert_eq!(listing.root.lookup("lib/missing"), Presence::Missing);
    }
}
