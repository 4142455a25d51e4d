//! The base32 variant used for store hashes: five-bit digits taken
//! little-endian from the byte string but emitted in reverse order, with
//! the ambiguous characters E O U T left out of the alphabet.
//!
//! Digit order and bit layout per the nix32 crate
//! (https://crates.io/crates/nix32).

/// omitted: E O U T
pub const BASE32_ALPHABET: &[u8] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// Digits needed for `n` bytes.
const fn encoded_len(n: usize) -> usize {
    (n * 8).div_ceil(5)
}

/// Converts the given byte slice to a base32 encoded String.
///
/// Digits come out most-significant first, i.e. the digit covering the top
/// bits of the last byte leads.
pub fn to_base32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(encoded_len(bytes.len()));
    for digit in (0..encoded_len(bytes.len())).rev() {
        let bit = digit * 5;
        // the five bits may straddle a byte border; read them through a
        // sixteen-bit window
        let low = bytes[bit / 8] as u16;
        let high = bytes.get(bit / 8 + 1).map_or(0, |&b| b as u16);
        let value = (low | high << 8) >> (bit % 8) & 0x1f;
        out.push(BASE32_ALPHABET[value as usize] as char);
    }
    out
}

/// Decodes base32 input to bytes.
///
/// The inverse of [`to_base32`]: each digit is shifted back to its bit
/// offset and merged in; bits that fall past the end of the output are the
/// encoder's padding and carry nothing.
pub fn from_base32(input: &str) -> Result<Vec<u8>, String> {
    let mut out = vec![0u8; input.len() * 5 / 8];
    for (n, c) in input.bytes().rev().enumerate() {
        let digit = BASE32_ALPHABET
            .iter()
            .position(|&b| b == c)
            .ok_or_else(|| format!("invalid base32 character: {}", c as char))?;

        let bit = n * 5;
        let window = (digit as u16) << (bit % 8);
        if let Some(b) = out.get_mut(bit / 8) {
            *b |= window as u8;
        }
        if let Some(b) = out.get_mut(bit / 8 + 1) {
            *b |= (window >> 8) as u8;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let data = b"hello world";
        let encoded = to_base32(data);
        let decoded = from_base32(&encoded).unwrap();
        assert_eq!(data.to_vec(), decoded);
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(to_base32(&[]), "");
        assert_eq!(to_base32(&[0x1f]), "0z");
        assert_eq!(to_base32(&[0xff, 0x00]), "007z");
        assert_eq!(from_base32("").unwrap(), Vec::<u8>::new());
        assert_eq!(from_base32("0z").unwrap(), vec![0x1f]);
        assert_eq!(from_base32("007z").unwrap(), vec![0xff, 0x00]);
    }

    #[test]
    fn test_store_hash_width() {
        // a 20-byte digest encodes to the 32-character store hash
        let encoded = to_base32(&[0u8; 20]);
        assert_eq!(encoded.len(), 32);
        assert_eq!(encoded, "0".repeat(32));
    }

    #[test]
    fn test_rejects_bad_character() {
        assert!(from_base32("e000").is_err());
    }
}
