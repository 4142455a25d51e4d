//! Recovers the information needed to reproduce an xz file from its
//! container structure: the check kind, the first block's filter chain
//! (as `xz` command line options) and the total uncompressed size from
//! the stream index.
//!
//! Reference: the xz file format description (tukaani.org/xz/xz-file-format.txt).

use thiserror::Error;

#[derive(Error, Debug)]
#[error("bad xz data: {0}")]
pub struct XzParseError(String);

#[derive(Debug, PartialEq, Eq)]
pub struct XzInfo {
    pub uncompressed_size: u64,
    pub options: Vec<String>,
}

const MAGIC: &[u8] = &[0xFD, b'7', b'z', b'X', b'Z', 0x00];

fn err(msg: impl Into<String>) -> XzParseError {
    XzParseError(msg.into())
}

pub fn parse_xz(buf: &[u8]) -> Result<XzInfo, XzParseError> {
    if buf.len() < 32 || &buf[..6] != MAGIC {
        return Err(err("bad magic"));
    }

    let mut opts = Vec::new();

    let check_type = buf[7] & 0xf;
    match check_type {
        0x00 => opts.push("--check=none".to_string()),
        0x01 => opts.push("--check=crc32".to_string()),
        0x04 => opts.push("--check=crc64".to_string()),
        0x0A => opts.push("--check=sha256".to_string()),
        other => return Err(err(format!("unknown check type {other}"))),
    }

    // first block header starts at offset 12
    let flags = *buf.get(13).ok_or_else(|| err("truncated block header"))?;
    let n_filters = (flags & 0x03) + 1;
    let has_cmp_size = flags & 0x40 != 0;
    let has_uncmp_size = flags & 0x80 != 0;

    let mut i = 14;
    if has_cmp_size {
        let (_, l) = read_varint(buf, i)?; // compressed size
        i += l;
    }
    if has_uncmp_size {
        let (_, l) = read_varint(buf, i)?; // uncompressed size
        i += l;
    }

    // filter flags of the first block
    for _ in 0..n_filters {
        let (filter_id, l) = read_varint(buf, i)?;
        i += l;
        let (prop_size, l) = read_varint(buf, i)?;
        i += l;

        match filter_id {
            0x21 => {
                // lzma2
                if prop_size != 1 {
                    return Err(err(format!("lzma2 filter has wrong propSize {prop_size}")));
                }
                let bits = buf.get(i).ok_or_else(|| err("truncated lzma2 props"))? & 0x3F;
                if bits > 40 {
                    return Err(err(format!("lzma2 filter has bad dictSize {bits}")));
                }
                let dict_size = lzma2_dict_size(bits);
                opts.push(format!("--lzma2=dict={dict_size}"));
            }
            0x04..=0x0a => {
                // branch/call/jump conversions, one switch each
                let switch = match filter_id {
                    0x04 => "--x86",
                    0x05 => "--powerpc",
                    0x06 => "--ia64",
                    0x07 => "--arm",
                    0x08 => "--armthumb",
                    0x09 => "--sparc",
                    _ => "--arm64",
                };
                opts.push(switch.to_string());
            }
            0x03 => {
                // delta
                if prop_size != 1 {
                    return Err(err(format!("delta filter has wrong propSize {prop_size}")));
                }
                let dist = *buf.get(i).ok_or_else(|| err("truncated delta props"))? as u32 + 1;
                opts.push(format!("--delta=dist={dist}"));
            }
            _ => {
                // seen on degenerate streams (e.g. empty files); recovery
                // still works when the index parses
            }
        }

        i += prop_size as usize;
        if i > buf.len() {
            return Err(err("truncated filter flags"));
        }
    }

    // footer: 4 bytes crc32, 4 bytes backward size, 2 bytes stream flags,
    // the YZ footer magic
    let end = buf.len();
    if &buf[end - 2..] != b"YZ" || buf[end - 4..end - 2] != buf[6..8] {
        return Err(err("bad footer magic or mismatched stream flags"));
    }
    let bw =
        u32::from_le_bytes(buf[end - 8..end - 4].try_into().expect("4 bytes")) as usize;
    let bw_size = (bw + 1) * 4;
    if end < 12 + bw_size || end - 12 - bw_size < 12 {
        return Err(err(format!("too big index size {bw_size}")));
    }
    let index = &buf[end - 12 - bw_size..end - 12];
    if index[0] != 0x00 {
        return Err(err(format!("index corrupted {}", index[0])));
    }

    let mut i = 1;
    let (n_rec, l) = read_varint(index, i)?;
    i += l;
    let mut total_uncompressed: u64 = 0;
    for _ in 0..n_rec {
        let (_, l) = read_varint(index, i)?; // unpadded size
        i += l;
        let (uncompressed, l) = read_varint(index, i)?;
        i += l;
        total_uncompressed = total_uncompressed
            .checked_add(uncompressed)
            .ok_or_else(|| err("index size overflow"))?;
    }

    Ok(XzInfo {
        uncompressed_size: total_uncompressed,
        options: opts,
    })
}

/// The 6-bit dictionary size encoding: 40 is reserved, values below map to
/// `(2 | (bits & 1)) << (bits / 2 + 11)`.
fn lzma2_dict_size(bits: u8) -> u64 {
    if bits == 40 {
        return u32::MAX as u64;
    }
    ((2 | (bits as u64 & 1)) << (bits / 2 + 11)) as u64
}

fn read_varint(buf: &[u8], start: usize) -> Result<(u64, usize), XzParseError> {
    let mut n: u64 = 0;
    let mut l = 0;
    loop {
        let b = *buf
            .get(start + l)
            .ok_or_else(|| err("truncated varint"))?;
        n |= ((b & 0x7f) as u64) << (l * 7);
        l += 1;
        if b & 0x80 == 0 {
            return Ok((n, l));
        }
        if l >= 9 {
            return Err(err("varint too long"));
        }
    }
}
