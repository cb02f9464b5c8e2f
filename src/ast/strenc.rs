//! Array-of-u64 <-> string encoding shared by `String` nodes, `Print`'s
//! string-decode display mode, and the `strlen`/`strcat` builtins.
//!
//! Bytes pack little-endian within each 64-bit word, matching the original's
//! `uint64_t` array layout for string data.

/// Packs `s` into 64-bit words, `ceil(len/8)` of them, zero-padded.
pub fn encode(s: &str) -> Vec<u64> {
    let bytes = s.as_bytes();
    let nwords = bytes.len().div_ceil(8);
    let mut words = vec![0u64; nwords];
    for (i, &b) in bytes.iter().enumerate() {
        words[i / 8] |= (b as u64) << ((i % 8) * 8);
    }
    words
}

/// Decodes exactly `len` bytes out of `words`, regardless of embedded NULs.
pub fn decode_fixed(words: &[u64], len: usize) -> String {
    let mut bytes = Vec::with_capacity(len);
    'outer: for &w in words {
        for i in 0..8 {
            if bytes.len() >= len {
                break 'outer;
            }
            bytes.push(((w >> (i * 8)) & 0xFF) as u8);
        }
    }
    bytes.truncate(len);
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Decodes up to the first NUL byte (or the end of the buffer).
pub fn decode_nul_terminated(words: &[u64]) -> String {
    decode_fixed(words, length(words))
}

/// Byte count up to the first NUL, matching `strlen` semantics.
pub fn length(words: &[u64]) -> usize {
    let mut n = 0;
    for &w in words {
        for i in 0..8 {
            if ((w >> (i * 8)) & 0xFF) == 0 {
                return n;
            }
            n += 1;
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for s in ["", "abc", "hello, world", "a very long string indeed!!"] {
            let words = encode(s);
            assert_eq!(length(&words), s.len());
            assert_eq!(decode_nul_terminated(&words), s);
        }
    }
}
