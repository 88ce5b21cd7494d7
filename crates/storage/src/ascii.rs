//! ASCII 8-to-7 packing
//!
//! Pure-ASCII payloads drop the always-zero high bit and pack 8 characters
//! into 7 bytes. Packed size is `ceil(7n/8)`, which maps two adjacent
//! decoded lengths onto the same packed length; the envelope keeps one of
//! two parity bits to recover the exact original length (`ASCII2` rounds
//! the derived length up, `ASCII1` rounds it down).

/// Whether the payload qualifies for 7-bit packing
pub fn is_ascii(data: &[u8]) -> bool {
    data.iter().all(|&b| b < 0x80)
}

/// Packed byte length for `n` ASCII characters
pub fn packed_size(n: usize) -> usize {
    (7 * n + 7) / 8
}

/// Decoded length for a packed length and parity choice
pub fn decoded_size(packed: usize, round_up: bool) -> usize {
    let up = packed * 8 / 7;
    if round_up {
        up
    } else {
        up - 1
    }
}

/// Parity for an original length: true if the decoded length rounds up
pub fn rounds_up(n: usize) -> bool {
    decoded_size(packed_size(n), true) == n
}

/// Pack ASCII bytes, 7 bits per character, LSB-first
pub fn pack(src: &[u8]) -> Vec<u8> {
    debug_assert!(is_ascii(src));
    let mut out = Vec::with_capacity(packed_size(src.len()));
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &b in src {
        acc |= (b as u32) << bits;
        bits += 7;
        if bits >= 8 {
            out.push(acc as u8);
            acc >>= 8;
            bits -= 8;
        }
    }
    if bits > 0 {
        out.push(acc as u8);
    }
    out
}

/// Unpack `decoded_len` characters from a packed buffer
pub fn unpack(packed: &[u8], decoded_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(decoded_len);
    unpack_into(packed, 0, decoded_len, &mut out);
    out
}

/// Unpack characters `[char_from, char_from + count)` into `out`.
///
/// Lets equality and hashing walk a packed payload a chunk at a time
/// without materializing the whole string.
pub fn unpack_into(packed: &[u8], char_from: usize, count: usize, out: &mut Vec<u8>) {
    let start_bit = char_from * 7;
    let mut i = start_bit / 8;
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    // Preload the partially consumed byte
    if start_bit % 8 != 0 && i < packed.len() {
        acc = (packed[i] >> (start_bit % 8)) as u32;
        bits = 8 - (start_bit % 8) as u32;
        i += 1;
    }
    for _ in 0..count {
        while bits < 7 && i < packed.len() {
            acc |= (packed[i] as u32) << bits;
            i += 1;
            bits += 8;
        }
        out.push((acc & 0x7f) as u8);
        acc >>= 7;
        bits = bits.saturating_sub(7);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_roundtrip() {
        for len in 1..=200 {
            let src: Vec<u8> = (0..len).map(|i| (b'a' + (i % 26) as u8)).collect();
            let packed = pack(&src);
            assert_eq!(packed.len(), packed_size(len));
            assert_eq!(unpack(&packed, len), src);
        }
    }

    #[test]
    fn test_parity_recovers_exact_length() {
        // Adjacent lengths share a packed size; the parity bit must
        // disambiguate every length
        for len in 1..=4096usize {
            let p = packed_size(len);
            let up = rounds_up(len);
            assert_eq!(decoded_size(p, up), len, "len {len} packed {p}");
        }
    }

    #[test]
    fn test_chunked_unpack_matches_full() {
        let src: Vec<u8> = (0..537).map(|i| ((i * 7 + 13) % 128) as u8).collect();
        let packed = pack(&src);
        let mut out = Vec::new();
        let mut at = 0;
        for chunk in [8usize, 64, 100, 256, 109] {
            unpack_into(&packed, at, chunk, &mut out);
            at += chunk;
        }
        assert_eq!(out, src);
    }

    #[test]
    fn test_is_ascii() {
        assert!(is_ascii(b"hello world 123"));
        assert!(!is_ascii(&[0x80]));
        assert!(!is_ascii("héllo".as_bytes()));
    }
}
