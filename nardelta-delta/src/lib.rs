//! Uniform interface over the external delta tools: a patch-from-base
//! encoder and the matching decoder, both streaming through pipes.
//!
//! Two algorithms are supported: `zstd --patch-from` and `xdelta3`. The
//! base is handed to the tool as an auxiliary input, either a file path
//! (the differ holds downloaded temp files) or a pipe surfaced to the
//! child as `/dev/fd/3` and fed by a copy task (the substituter only has
//! streams).

mod process;

use std::path::Path;

use nardelta_protocol::DiffStats;
use tokio::io::{AsyncRead, AsyncWrite};

pub use process::DeltaError;

pub const ZSTD_BIN: &str = "zstd";
pub const XDELTA3_BIN: &str = "xdelta3";

pub type Result<T> = std::result::Result<T, DeltaError>;

/// A byte source handed to a delta tool.
pub enum Input<'a> {
    File(&'a Path),
    Stream(&'a mut (dyn AsyncRead + Send + Unpin)),
}

pub struct CreateArgs<'a> {
    pub base: Input<'a>,
    pub base_size: u64,
    pub request: Input<'a>,
    pub request_size: u64,
    pub output: &'a mut (dyn AsyncWrite + Send + Unpin),
}

pub struct ExpandArgs<'a> {
    pub base: Input<'a>,
    pub base_size: u64,
    pub delta: &'a mut (dyn AsyncRead + Send + Unpin),
    pub output: &'a mut (dyn AsyncWrite + Send + Unpin),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaAlgo {
    Zstd { level: u32 },
    Xdelta { level: u32 },
}

impl DeltaAlgo {
    /// Look up an algorithm family by name, with its differ-side default
    /// level.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "zstd" => Some(Self::Zstd { level: 9 }),
            "xdelta" => Some(Self::Xdelta { level: 6 }),
            _ => None,
        }
    }

    /// First supported entry of an ordered `name-level` acceptance list.
    pub fn pick(accept: &[String]) -> Option<Self> {
        for token in accept {
            let (name, level) = match token.split_once('-') {
                Some((name, level)) => (name, level.parse().ok()),
                None => (token.as_str(), None),
            };
            if let Some(mut algo) = Self::by_name(name) {
                if let Some(level) = level {
                    algo.set_level(level);
                }
                return Some(algo);
            }
        }
        None
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Zstd { .. } => "zstd",
            Self::Xdelta { .. } => "xdelta",
        }
    }

    pub fn level(&self) -> u32 {
        match self {
            Self::Zstd { level } | Self::Xdelta { level } => *level,
        }
    }

    pub fn set_level(&mut self, new: u32) {
        match self {
            Self::Zstd { level } | Self::Xdelta { level } => *level = new,
        }
    }

    /// Produce a delta from base to request, writing it to `args.output`.
    pub async fn create(&self, args: CreateArgs<'_>) -> Result<DiffStats> {
        let dict_size = stream_dict_size(&args.base, args.base_size);
        let (level, request_size) = (self.level(), args.request_size);
        let outcome = match self {
            Self::Zstd { .. } => {
                let argv =
                    |base_arg: &str| zstd_create_args(level, base_arg, dict_size, request_size);
                process::run_tool(ZSTD_BIN, argv, args.base, args.request, args.output).await?
            }
            Self::Xdelta { .. } => {
                let argv = |base_arg: &str| xdelta_create_args(level, base_arg);
                process::run_tool(XDELTA3_BIN, argv, args.base, args.request, args.output).await?
            }
        };
        Ok(DiffStats {
            diff_size: outcome.bytes_out,
            nar_size: request_size,
            algo: self.name().to_string(),
            level: self.level() as u64,
            cmp_total_ms: outcome.wall_ms,
            cmp_user_ms: outcome.user_ms,
            cmp_sys_ms: outcome.sys_ms,
            ..Default::default()
        })
    }

    /// Apply a delta to a base, writing the reconstruction to
    /// `args.output`.
    pub async fn expand(&self, args: ExpandArgs<'_>) -> Result<DiffStats> {
        // zstd needs the dictionary size up front. With a file or a sized
        // stream that is known; an unsized stream (a filtered dump, whose
        // length only falls out at the end) is spooled to a temp file
        // first.
        let outcome = match (self, args.base) {
            (Self::Zstd { .. }, Input::Stream(src)) if args.base_size == 0 => {
                let spooled = process::spool_to_temp(ZSTD_BIN, src).await?;
                let base = Input::File(spooled.path());
                let dict_size = stream_dict_size(&base, args.base_size);
                let delta = Input::Stream(args.delta);
                let argv = |base_arg: &str| zstd_expand_args(base_arg, dict_size);
                process::run_tool(ZSTD_BIN, argv, base, delta, args.output).await?
            }
            (Self::Zstd { .. }, base) => {
                let dict_size = stream_dict_size(&base, args.base_size);
                let delta = Input::Stream(args.delta);
                let argv = |base_arg: &str| zstd_expand_args(base_arg, dict_size);
                process::run_tool(ZSTD_BIN, argv, base, delta, args.output).await?
            }
            (Self::Xdelta { .. }, base) => {
                let delta = Input::Stream(args.delta);
                let argv = |base_arg: &str| xdelta_expand_args(base_arg);
                process::run_tool(XDELTA3_BIN, argv, base, delta, args.output).await?
            }
        };
        Ok(DiffStats {
            exp_total_ms: outcome.wall_ms,
            exp_user_ms: outcome.user_ms,
            exp_sys_ms: outcome.sys_ms,
            ..Default::default()
        })
    }
}

/// `--dict-stream-size` is only needed (and only meaningful) when the base
/// arrives as a stream.
fn stream_dict_size(base: &Input<'_>, base_size: u64) -> Option<u64> {
    match base {
        Input::Stream(_) if base_size > 0 => Some(base_size),
        _ => None,
    }
}

fn zstd_create_args(
    level: u32,
    base_arg: &str,
    dict_stream_size: Option<u64>,
    request_size: u64,
) -> Vec<String> {
    let mut args = vec![
        format!("-{level}"),
        "--single-thread".into(),
        "-c".into(),
    ];
    if let Some(size) = dict_stream_size {
        args.push(format!("--dict-stream-size={size}"));
    }
    args.push(format!("--patch-from={base_arg}"));
    args.push(format!("--stream-size={request_size}"));
    args
}

fn zstd_expand_args(base_arg: &str, dict_stream_size: Option<u64>) -> Vec<String> {
    let mut args = vec!["--long=30".into(), "-c".into(), "-d".into()];
    if let Some(size) = dict_stream_size {
        args.push(format!("--dict-stream-size={size}"));
    }
    args.push(format!("--patch-from={base_arg}"));
    args
}

fn xdelta_create_args(level: u32, base_arg: &str) -> Vec<String> {
    vec![
        format!("-{level}"),
        "-S".into(),
        "lzma".into(),
        "-A".into(),
        "-D".into(),
        "-c".into(),
        "-e".into(),
        "-s".into(),
        base_arg.into(),
    ]
}

fn xdelta_expand_args(base_arg: &str) -> Vec<String> {
    vec!["-R".into(), "-c".into(), "-d".into(), "-s".into(), base_arg.into()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_first_supported() {
        let algo = DeltaAlgo::pick(&["zstd-3".into(), "xdelta-1".into()]).unwrap();
        assert_eq!(algo, DeltaAlgo::Zstd { level: 3 });

        let algo = DeltaAlgo::pick(&["brotli-5".into(), "xdelta-1".into()]).unwrap();
        assert_eq!(algo, DeltaAlgo::Xdelta { level: 1 });

        assert_eq!(DeltaAlgo::pick(&["brotli-5".into()]), None);
        assert_eq!(DeltaAlgo::pick(&[]), None);
    }

    #[test]
    fn test_pick_defaults_level() {
        assert_eq!(
            DeltaAlgo::pick(&["zstd".into()]),
            Some(DeltaAlgo::Zstd { level: 9 })
        );
        // unparsable level keeps the default
        assert_eq!(
            DeltaAlgo::pick(&["xdelta-x".into()]),
            Some(DeltaAlgo::Xdelta { level: 6 })
        );
    }

    #[test]
    fn test_zstd_args() {
        assert_eq!(
            zstd_create_args(3, "/tmp/base", None, 2000),
            vec![
                "-3",
                "--single-thread",
                "-c",
                "--patch-from=/tmp/base",
                "--stream-size=2000",
            ]
        );
        assert_eq!(
            zstd_expand_args("/dev/fd/3", Some(1000)),
            vec!["--long=30", "-c", "-d", "--dict-stream-size=1000", "--patch-from=/dev/fd/3"]
        );
        assert_eq!(
            zstd_expand_args("/tmp/base", None),
            vec!["--long=30", "-c", "-d", "--patch-from=/tmp/base"]
        );
    }

    #[test]
    fn test_xdelta_args() {
        assert_eq!(
            xdelta_create_args(1, "/tmp/base"),
            vec!["-1", "-S", "lzma", "-A", "-D", "-c", "-e", "-s", "/tmp/base"]
        );
        assert_eq!(xdelta_expand_args("/dev/fd/3"), vec!["-R", "-c", "-d", "-s", "/dev/fd/3"]);
    }

    fn tool_available(bin: &str) -> bool {
        std::process::Command::new(bin)
            .arg("-V")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok()
    }

    fn sample_pair() -> (Vec<u8>, Vec<u8>) {
        // base and request share most content, as adjacent versions do
        let base: Vec<u8> = (0..200u32)
            .flat_map(|i| format!("line {i} of the base file\n").into_bytes())
            .collect();
        let mut request = base.clone();
        request.extend_from_slice(b"line 200, new in this version\n");
        request.splice(..7, b"changed".iter().copied());
        (base, request)
    }

    async fn roundtrip(algo: DeltaAlgo, base: &[u8], request: &[u8], sized_base: bool) {
        let base_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(base_file.path(), base).unwrap();

        let mut delta = Vec::new();
        algo.create(CreateArgs {
            base: Input::File(base_file.path()),
            base_size: base.len() as u64,
            request: Input::Stream(&mut &request[..]),
            request_size: request.len() as u64,
            output: &mut delta,
        })
        .await
        .unwrap();
        assert!(!delta.is_empty());
        assert!(delta.len() < request.len(), "delta should beat the raw nar");

        // decode with the base as a stream, the way the substituter runs it
        let mut reconstructed = Vec::new();
        let stats = algo
            .expand(ExpandArgs {
                base: Input::Stream(&mut &base[..]),
                base_size: if sized_base { base.len() as u64 } else { 0 },
                delta: &mut &delta[..],
                output: &mut reconstructed,
            })
            .await
            .unwrap();
        assert_eq!(reconstructed, request);
        assert!(stats.exp_total_ms < 60_000);
    }

    #[tokio::test]
    async fn test_zstd_roundtrip() {
        if !tool_available(ZSTD_BIN) {
            eprintln!("zstd not available, skipping");
            return;
        }
        let (base, request) = sample_pair();
        // unsized stream: the decoder spools the base and patches from the
        // file, which every patch-from-capable zstd supports
        roundtrip(DeltaAlgo::Zstd { level: 3 }, &base, &request, false).await;
    }

    #[tokio::test]
    async fn test_xdelta_roundtrip() {
        if !tool_available(XDELTA3_BIN) {
            eprintln!("xdelta3 not available, skipping");
            return;
        }
        let (base, request) = sample_pair();
        roundtrip(DeltaAlgo::Xdelta { level: 1 }, &base, &request, true).await;
    }

    #[tokio::test]
    async fn test_missing_tool_is_an_error() {
        let algo = DeltaAlgo::Zstd { level: 3 };
        // nonexistent base path: spawn or open fails, never panics
        let err = algo
            .create(CreateArgs {
                base: Input::File(std::path::Path::new("/nonexistent/base")),
                base_size: 10,
                request: Input::Stream(&mut &b"request"[..]),
                request_size: 7,
                output: &mut Vec::new(),
            })
            .await;
        assert!(err.is_err());
    }
}
