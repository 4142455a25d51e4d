//! Wire primitives of the archive encoding: little-endian u64 framing and
//! strings padded to 8-byte alignment.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{NarError, Result};

pub const MAGIC: &[u8] = b"nix-archive-1";

/// Tokens (names, symlink targets, type tags) are small; file contents are
/// framed separately and never pass through [`read_string`].
const MAX_STRING_LEN: u64 = 4096;

pub const ZEROS: [u8; 8] = [0u8; 8];

pub const fn padding(len: u64) -> usize {
    ((8 - (len % 8)) % 8) as usize
}

pub async fn read_u64<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await.map_err(eof_as_truncation)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a u64, mapping clean EOF at the first byte to `None`.
pub async fn read_u64_or_eof<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<u64>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(NarError::UnexpectedEof);
        }
        filled += n;
    }
    Ok(Some(u64::from_le_bytes(buf)))
}

pub async fn read_padding<R: AsyncRead + Unpin>(r: &mut R, len: u64) -> Result<()> {
    let pad = padding(len);
    if pad == 0 {
        return Ok(());
    }
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf[..pad])
        .await
        .map_err(eof_as_truncation)?;
    if buf[..pad].iter().any(|&b| b != 0) {
        return Err(NarError::BadPadding);
    }
    Ok(())
}

/// Read a length-prefixed padded string.
pub async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_u64(r).await?;
    if len > MAX_STRING_LEN {
        return Err(NarError::StringTooLong {
            len,
            limit: MAX_STRING_LEN,
        });
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await.map_err(eof_as_truncation)?;
    read_padding(r, len).await?;
    Ok(buf)
}

/// Read a string and require it to equal `expected`.
pub async fn expect_string<R: AsyncRead + Unpin>(r: &mut R, expected: &[u8]) -> Result<()> {
    let got = read_string(r).await?;
    if got != expected {
        return Err(NarError::UnexpectedToken {
            expected: String::from_utf8_lossy(expected).into_owned(),
            got: String::from_utf8_lossy(&got).into_owned(),
        });
    }
    Ok(())
}

pub async fn write_u64<W: AsyncWrite + Unpin>(w: &mut W, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes()).await?;
    Ok(())
}

pub async fn write_padding<W: AsyncWrite + Unpin>(w: &mut W, len: u64) -> Result<()> {
    let pad = padding(len);
    if pad > 0 {
        w.write_all(&ZEROS[..pad]).await?;
    }
    Ok(())
}

/// Write a length-prefixed padded string.
pub async fn write_string<W: AsyncWrite + Unpin>(w: &mut W, s: &[u8]) -> Result<()> {
    write_u64(w, s.len() as u64).await?;
    w.write_all(s).await?;
    write_padding(w, s.len() as u64).await?;
    Ok(())
}

fn eof_as_truncation(e: std::io::Error) -> NarError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        NarError::UnexpectedEof
    } else {
        NarError::Io(e)
    }
}
