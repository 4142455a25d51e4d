//! The `.narinfo` text format: `Key: value` lines describing one store
//! path in a binary cache.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NarInfoError {
    #[error("narinfo line without separator: {0:?}")]
    BadLine(String),

    #[error("narinfo missing required field {0}")]
    MissingField(&'static str),

    #[error("narinfo field {field} is not a number: {value:?}")]
    BadNumber { field: &'static str, value: String },
}

/// A parsed metadata record. Fields we do not consume are dropped on
/// parse; everything the client validates (hashes, sizes, references,
/// signatures) is carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarInfo {
    pub store_path: String,
    pub url: String,
    pub compression: String,
    pub file_hash: Option<String>,
    pub file_size: Option<u64>,
    pub nar_hash: String,
    pub nar_size: u64,
    pub references: Vec<String>,
    pub deriver: Option<String>,
    pub sigs: Vec<String>,
    pub ca: Option<String>,
}

impl NarInfo {
    pub fn content_type() -> &'static str {
        "text/x-nix-narinfo"
    }

    pub fn parse(text: &str) -> Result<Self, NarInfoError> {
        let mut store_path = None;
        let mut url = None;
        let mut compression = None;
        let mut file_hash = None;
        let mut file_size = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = Vec::new();
        let mut deriver = None;
        let mut sigs = Vec::new();
        let mut ca = None;

        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| NarInfoError::BadLine(line.into()))?;
            match key {
                "StorePath" => store_path = Some(value.to_string()),
                "URL" => url = Some(value.to_string()),
                "Compression" => compression = Some(value.to_string()),
                "FileHash" => file_hash = Some(value.to_string()),
                "FileSize" => file_size = Some(parse_u64("FileSize", value)?),
                "NarHash" => nar_hash = Some(value.to_string()),
                "NarSize" => nar_size = Some(parse_u64("NarSize", value)?),
                "References" => {
                    references = value.split_whitespace().map(str::to_string).collect()
                }
                "Deriver" => deriver = Some(value.to_string()),
                "Sig" => sigs.push(value.to_string()),
                "CA" => ca = Some(value.to_string()),
                _ => {} // fields we do not consume
            }
        }

        Ok(NarInfo {
            store_path: store_path.ok_or(NarInfoError::MissingField("StorePath"))?,
            url: url.ok_or(NarInfoError::MissingField("URL"))?,
            // historical default when the field is absent
            compression: compression.unwrap_or_else(|| "bzip2".to_string()),
            file_hash,
            file_size,
            nar_hash: nar_hash.ok_or(NarInfoError::MissingField("NarHash"))?,
            nar_size: nar_size.ok_or(NarInfoError::MissingField("NarSize"))?,
            references,
            deriver,
            sigs,
            ca,
        })
    }

    /// The nar hash without its `sha256:` style prefix.
    pub fn nar_hash_bare(&self) -> &str {
        match self.nar_hash.split_once(':') {
            Some((_, bare)) => bare,
            None => &self.nar_hash,
        }
    }

    /// The rewritten record the substituter announces: an uncompressed
    /// archive served from its own `nar/` endpoint, everything the client
    /// verifies left untouched.
    pub fn to_uncompressed(&self, url: String) -> NarInfo {
        NarInfo {
            url,
            compression: "none".to_string(),
            file_hash: Some(self.nar_hash.clone()),
            file_size: Some(self.nar_size),
            ..self.clone()
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity(512);
        push_line(&mut out, "StorePath", &self.store_path);
        push_line(&mut out, "URL", &self.url);
        push_line(&mut out, "Compression", &self.compression);
        if let Some(file_hash) = &self.file_hash {
            push_line(&mut out, "FileHash", file_hash);
        }
        if let Some(file_size) = self.file_size {
            push_line(&mut out, "FileSize", &file_size.to_string());
        }
        push_line(&mut out, "NarHash", &self.nar_hash);
        push_line(&mut out, "NarSize", &self.nar_size.to_string());
        if !self.references.is_empty() {
            push_line(&mut out, "References", &self.references.join(" "));
        }
        if let Some(deriver) = &self.deriver {
            push_line(&mut out, "Deriver", deriver);
        }
        for sig in &self.sigs {
            push_line(&mut out, "Sig", sig);
        }
        if let Some(ca) = &self.ca {
            push_line(&mut out, "CA", ca);
        }
        out
    }
}

fn push_line(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push_str(": ");
    out.push_str(value);
    out.push('\n');
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, NarInfoError> {
    value.parse().map_err(|_| NarInfoError::BadNumber {
        field,
        value: value.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
StorePath: /nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-pipewire-0.3.71
URL: nar/1bcd.nar.xz
Compression: xz
FileHash: sha256:1bcd
FileSize: 1000
NarHash: sha256:9fff
NarSize: 4096
References: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-pipewire-0.3.71 bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-glibc-2.37-8
Deriver: cccccccccccccccccccccccccccccccc-pipewire-0.3.71.drv
Sig: cache.example.org-1:base64sigbytes
";

    #[test]
    fn test_parse() {
        let ni = NarInfo::parse(SAMPLE).unwrap();
        assert_eq!(ni.compression, "xz");
        assert_eq!(ni.file_size, Some(1000));
        assert_eq!(ni.nar_size, 4096);
        assert_eq!(ni.references.len(), 2);
        assert_eq!(ni.sigs, vec!["cache.example.org-1:base64sigbytes"]);
        assert_eq!(ni.nar_hash_bare(), "9fff");
    }

    #[test]
    fn test_text_roundtrip() {
        let ni = NarInfo::parse(SAMPLE).unwrap();
        let again = NarInfo::parse(&ni.to_text()).unwrap();
        assert_eq!(ni, again);
    }

    #[test]
    fn test_rewrite_for_uncompressed_serving() {
        let ni = NarInfo::parse(SAMPLE).unwrap();
        let rewritten = ni.to_uncompressed("nar/9fff.nar".into());
        assert_eq!(rewritten.url, "nar/9fff.nar");
        assert_eq!(rewritten.compression, "none");
        assert_eq!(rewritten.file_hash.as_deref(), Some("sha256:9fff"));
        assert_eq!(rewritten.file_size, Some(4096));
        assert_eq!(rewritten.nar_hash, ni.nar_hash);
        assert_eq!(rewritten.nar_size, ni.nar_size);
        assert_eq!(rewritten.references, ni.references);
        assert_eq!(rewritten.sigs, ni.sigs);
    }

    #[test]
    fn test_parse_rejects_missing_nar_hash() {
        assert!(matches!(
            NarInfo::parse("StorePath: /nix/store/x\nURL: nar/x\nNarSize: 1\n"),
            Err(NarInfoError::MissingField("NarHash"))
        ));
    }
}
