//! Append-only newline-delimited record log: one `r` record per served
//! metadata lookup, one `d` record per completed reconstruction, joined
//! on `id` by offline analysis.

use std::io::Write;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use rand::RngCore;
use serde::Serialize;

use nardelta_protocol::{DiffStats, DifferRequest};

#[derive(Debug, Default, Serialize)]
pub struct AnRecord {
    #[serde(rename = "t", skip_serializing_if = "String::is_empty")]
    pub t: String,
    #[serde(rename = "r", skip_serializing_if = "Option::is_none")]
    pub r: Option<AnRequest>,
    #[serde(rename = "d", skip_serializing_if = "Option::is_none")]
    pub d: Option<AnDiff>,
}

#[derive(Debug, Default, Serialize)]
pub struct AnRequest {
    #[serde(rename = "id", skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// requested store path (minus the store dir)
    #[serde(rename = "req", skip_serializing_if = "String::is_empty")]
    pub req_store_path: String,
    /// nar size from upstream
    #[serde(rename = "nar", skip_serializing_if = "is_zero")]
    pub nar_size: u64,
    /// file size from upstream
    #[serde(rename = "file", skip_serializing_if = "is_zero")]
    pub file_size: u64,
    /// base that we picked (if we did)
    #[serde(rename = "base", skip_serializing_if = "String::is_empty")]
    pub base_store_path: String,
    /// full request to be sent to the differ
    #[serde(rename = "differReq", skip_serializing_if = "Option::is_none")]
    pub differ_request: Option<DifferRequest>,
    /// error code
    #[serde(rename = "failed", skip_serializing_if = "String::is_empty")]
    pub failed: String,
}

#[derive(Debug, Default, Serialize)]
pub struct AnDiff {
    #[serde(rename = "id", skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "stats", skip_serializing_if = "Option::is_none")]
    pub stats: Option<DiffStats>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

pub struct Analytics {
    file: Option<Mutex<std::fs::File>>,
}

impl Analytics {
    /// Empty name disables the sink; `default` auto-names a `.jsonl` file
    /// under the logs directory.
    pub fn open(name: &str) -> Self {
        let resolved;
        let name = if name.is_empty() {
            return Self { file: None };
        } else if name == "default" {
            let base = std::env::var("LOGS_DIRECTORY").unwrap_or_else(|_| "log".to_string());
            let _ = std::fs::create_dir_all(&base);
            resolved = format!(
                "{base}/{}.jsonl",
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
            );
            resolved.as_str()
        } else {
            name
        };

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(name);
        match file {
            Ok(f) => Self {
                file: Some(Mutex::new(f)),
            },
            Err(e) => {
                log::warn!("couldn't open analytics log {name}: {e}");
                Self { file: None }
            }
        }
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn write(&self, mut rec: AnRecord) {
        let Some(file) = &self.file else {
            return;
        };
        rec.t = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let Ok(mut line) = serde_json::to_vec(&rec) else {
            return;
        };
        line.push(b'\n');
        let _ = file.lock().expect("analytics lock poisoned").write_all(&line);
    }
}

/// Request correlation id: 12 random bytes, unpadded base64.
pub fn new_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_shape() {
        let rec = AnRecord {
            t: "2023-09-01T00:00:00Z".into(),
            r: Some(AnRequest {
                id: "abc".into(),
                req_store_path: "hash-foo-1.0".into(),
                nar_size: 10,
                file_size: 5,
                failed: "nobase".into(),
                ..Default::default()
            }),
            d: None,
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["r"]["req"], "hash-foo-1.0");
        assert_eq!(v["r"]["failed"], "nobase");
        assert!(v.get("d").is_none());
        assert!(v["r"].get("base").is_none());
    }

    #[test]
    fn test_id_shape() {
        let id = new_id();
        assert_eq!(id.len(), 16);
        assert_ne!(id, new_id());
    }

    #[test]
    fn test_write_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("an.jsonl");
        let analytics = Analytics::open(path.to_str().unwrap());
        analytics.write(AnRecord {
            d: Some(AnDiff {
                id: "x".into(),
                stats: Some(DiffStats {
                    algo: "zstd".into(),
                    diff_size: 3,
                    ..Default::default()
                }),
            }),
            ..Default::default()
        });
        analytics.write(AnRecord::default());

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.trim_end().split('\n').collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["d"]["stats"]["algo"], "zstd");
        assert!(first["t"].as_str().unwrap().ends_with('Z'));
    }
}
