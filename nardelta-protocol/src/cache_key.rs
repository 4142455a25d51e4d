//! Deterministic key for the optional small-delta cache.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::DifferRequest;

/// Content-address of one delta: upstream, the two inputs, their sizes and
/// the algorithm family. The level is deliberately absent so any acceptable
/// level can satisfy a hit. The nar hashes themselves are not available on
/// both sides; the sizes catch most mismatched reuses and the client's
/// archive-hash check catches the rest.
pub fn cache_key(req: &DifferRequest, algo: &str) -> String {
    let mut h = Sha256::new();
    h.update(format!("up={}\n", req.upstream));
    h.update(format!("req={}\n", req.req_nar_path));
    h.update(format!("base={}\n", req.base_store_path));
    h.update(format!("sizes={},{}\n", req.base_nar_size, req.req_nar_size));
    h.update(format!("algo={algo}\n"));
    if let Some(filter) = &req.nar_filter {
        let tag = serde_json::to_value(filter)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        h.update(format!("filter={tag}\n"));
    }
    let encoded = URL_SAFE_NO_PAD.encode(h.finalize());
    format!("v1-{}", &encoded[..36])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NarFilter;

    fn request() -> DifferRequest {
        DifferRequest {
            req_nar_path: "nar/abcd.nar.xz".into(),
            base_store_path: "/nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-foo-1.0".into(),
            accept_algos: vec!["zstd-3".into()],
            nar_filter: None,
            upstream: "cache.example.org".into(),
            base_nar_size: 0,
            req_nar_size: 4096,
            req_name: "foo-1.1".into(),
        }
    }

    #[test]
    fn test_key_shape() {
        let key = cache_key(&request(), "zstd");
        assert_eq!(key.len(), 3 + 36);
        assert!(key.starts_with("v1-"));
        // url-safe, no padding
        assert!(!key.contains('+') && !key.contains('/') && !key.contains('='));
    }

    #[test]
    fn test_key_is_deterministic_and_discriminating() {
        let base = cache_key(&request(), "zstd");
        assert_eq!(base, cache_key(&request(), "zstd"));
        assert_ne!(base, cache_key(&request(), "xdelta"));

        let mut other = request();
        other.req_nar_size = 4097;
        assert_ne!(base, cache_key(&other, "zstd"));

        let mut filtered = request();
        filtered.nar_filter = Some(NarFilter::ExpandV2);
        assert_ne!(base, cache_key(&filtered, "zstd"));
    }
}
