//! Wire types shared by the substituter and the differ: the diff request
//! JSON body, the framed multipart response, diff statistics, the narinfo
//! text format, and the small-delta cache key.

pub mod cache_key;
pub mod multipart;
pub mod narinfo;

pub use cache_key::cache_key;
pub use narinfo::{NarInfo, NarInfoError};

use serde::{Deserialize, Serialize};

/// Path of the differ endpoint.
pub const DIFFER_PATH: &str = "/nardelta-differ";

/// Ordered part names of the framed differ response.
pub const PART_HEADER: &str = "header";
pub const PART_BODY: &str = "body";
pub const PART_TRAILER: &str = "trailer";

/// Failure classes recorded in analytics.
pub const FAILED_NOT_FOUND: &str = "notfound";
pub const FAILED_TOO_SMALL: &str = "toosmall";
pub const FAILED_TOO_BIG: &str = "toobig";
pub const FAILED_NO_BASE: &str = "nobase";
pub const FAILED_IDENTICAL: &str = "identical";

/// Filters a nar stream can be piped through on both sides of the diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NarFilter {
    #[serde(rename = "expv2")]
    ExpandV2,
}

/// Job description POSTed to the differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifferRequest {
    // required for the request:
    /// full nar path of requested
    pub req_nar_path: String,
    /// full store path of base
    pub base_store_path: String,
    /// accepted diff algos, ordered
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accept_algos: Vec<String>,
    /// pipe nars through a filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nar_filter: Option<NarFilter>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upstream: String,

    // informational only (but used for the cache key):
    /// size of base nar
    #[serde(default)]
    pub base_nar_size: u64,
    /// size of requested nar (used for resource control)
    #[serde(default)]
    pub req_nar_size: u64,
    /// requested name only, no hash (used for logs)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub req_name: String,
}

/// First part of the framed response: which algorithm the differ chose.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DifferHeader {
    pub algo: String,
}

/// Last part of the framed response. `ok` is the authoritative success
/// signal; the body may have streamed before a failure surfaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DifferTrailer {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<DiffStats>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// Outcome and resource usage of one delta computation/application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    #[serde(rename = "base", default, skip_serializing_if = "is_zero_u64")]
    pub base_size: u64,
    #[serde(rename = "diff", default, skip_serializing_if = "is_zero_u64")]
    pub diff_size: u64,
    #[serde(rename = "nar", default, skip_serializing_if = "is_zero_u64")]
    pub nar_size: u64,
    #[serde(rename = "algo", default, skip_serializing_if = "String::is_empty")]
    pub algo: String,
    #[serde(rename = "lvl", default, skip_serializing_if = "is_zero_u64")]
    pub level: u64,
    #[serde(rename = "cmpMs", default, skip_serializing_if = "is_zero_u64")]
    pub cmp_total_ms: u64,
    #[serde(rename = "expMs", default, skip_serializing_if = "is_zero_u64")]
    pub exp_total_ms: u64,
    #[serde(rename = "cmpU", default, skip_serializing_if = "is_zero_u64")]
    pub cmp_user_ms: u64,
    #[serde(rename = "cmpS", default, skip_serializing_if = "is_zero_u64")]
    pub cmp_sys_ms: u64,
    #[serde(rename = "expU", default, skip_serializing_if = "is_zero_u64")]
    pub exp_user_ms: u64,
    #[serde(rename = "expS", default, skip_serializing_if = "is_zero_u64")]
    pub exp_sys_ms: u64,
}

impl std::fmt::Display for DiffStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{} {}/{} -> {} [cmp {}t {}u {}s exp {}t {}u {}s]",
            self.algo,
            self.level,
            self.base_size,
            self.nar_size,
            self.diff_size,
            self.cmp_total_ms,
            self.cmp_user_ms,
            self.cmp_sys_ms,
            self.exp_total_ms,
            self.exp_user_ms,
            self.exp_sys_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_differ_request_json_shape() {
        let req = DifferRequest {
            req_nar_path: "nar/abc.nar.xz".into(),
            base_store_path: "/nix/store/x-y".into(),
            accept_algos: vec!["zstd-3".into(), "xdelta-1".into()],
            nar_filter: Some(NarFilter::ExpandV2),
            upstream: "cache.example.org".into(),
            base_nar_size: 0,
            req_nar_size: 1234,
            req_name: "y".into(),
        };
        let v: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(v["reqNarPath"], "nar/abc.nar.xz");
        assert_eq!(v["baseStorePath"], "/nix/store/x-y");
        assert_eq!(v["acceptAlgos"][0], "zstd-3");
        assert_eq!(v["narFilter"], "expv2");
        assert_eq!(v["reqNarSize"], 1234);

        let back: DifferRequest = serde_json::from_value(v).unwrap();
        assert_eq!(back.nar_filter, Some(NarFilter::ExpandV2));
    }

    #[test]
    fn test_trailer_omits_empty_error() {
        let t = DifferTrailer {
            ok: true,
            stats: Some(DiffStats {
                algo: "zstd".into(),
                level: 3,
                diff_size: 10,
                ..Default::default()
            }),
            error: String::new(),
        };
        let v = serde_json::to_value(&t).unwrap();
        assert_eq!(v["Ok"], true);
        assert_eq!(v["Stats"]["algo"], "zstd");
        assert!(v.get("Error").is_none());
    }

    #[test]
    fn test_stats_display() {
        let s = DiffStats {
            algo: "zstd".into(),
            level: 3,
            base_size: 100,
            nar_size: 120,
            diff_size: 7,
            ..Default::default()
        };
        assert_eq!(s.to_string(), "zstd-3 100/120 -> 7 [cmp 0t 0u 0s exp 0t 0u 0s]");
    }
}
