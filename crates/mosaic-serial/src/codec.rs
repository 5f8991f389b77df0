//! Weight-compression facade.
//!
//! Keep this tiny and synchronous. `None` passes bytes through; `Hde` is
//! the device's Huffman engine, modelled here as a canonical Huffman byte
//! codec so the emitted stream is deterministic and self-describing. The
//! stream layout: original length (u32), 256 code lengths (u8 each), then
//! the MSB-first bitstream.

use serde::{Deserialize, Serialize};

use mosaic_core::{Error, Result};

const PASS: &str = "weight-codec";

/// Populated tensors below this size are never worth compressing.
pub const COMPRESSION_THRESHOLD: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Codec {
    None = 0,
    Hde = 1,
}

impl Codec {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Hde),
            _ => Err(Error::argument(PASS, format!("unknown codec id {v}"))),
        }
    }
}

pub fn compress(codec: Codec, input: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(input.to_vec()),
        Codec::Hde => hde_compress(input),
    }
}

pub fn decompress(codec: Codec, input: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(input.to_vec()),
        Codec::Hde => hde_decompress(input),
    }
}

/// Code lengths from a Huffman tree over byte frequencies. Ties resolve by
/// symbol value so identical inputs always build identical tables.
fn code_lengths(input: &[u8]) -> [u8; 256] {
    let mut freq = [0u64; 256];
    for &b in input {
        freq[b as usize] += 1;
    }

    // (weight, tie_break, symbols covered)
    let mut nodes: Vec<(u64, u32, Vec<u8>)> = freq
        .iter()
        .enumerate()
        .filter(|(_, &f)| f > 0)
        .map(|(sym, &f)| (f, sym as u32, vec![sym as u8]))
        .collect();

    let mut lengths = [0u8; 256];
    if nodes.len() == 1 {
        lengths[nodes[0].2[0] as usize] = 1;
        return lengths;
    }

    let mut next_tie = 256u32;
    while nodes.len() > 1 {
        nodes.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        let (wa, _, sa) = nodes.remove(0);
        let (wb, _, sb) = nodes.remove(0);
        for &s in sa.iter().chain(sb.iter()) {
            lengths[s as usize] += 1;
        }
        let mut merged = sa;
        merged.extend(sb);
        nodes.push((wa + wb, next_tie, merged));
        next_tie += 1;
    }
    lengths
}

/// Canonical codes from lengths: symbols sorted by (length, value).
fn canonical_codes(lengths: &[u8; 256]) -> Vec<(u8, u32, u8)> {
    let mut symbols: Vec<(u8, u8)> = (0..=255u8)
        .filter(|&s| lengths[s as usize] > 0)
        .map(|s| (lengths[s as usize], s))
        .collect();
    symbols.sort();

    let mut out = Vec::with_capacity(symbols.len());
    let mut code = 0u32;
    let mut prev_len = 0u8;
    for (len, sym) in symbols {
        code <<= len - prev_len;
        out.push((sym, code, len));
        code += 1;
        prev_len = len;
    }
    out
}

fn hde_compress(input: &[u8]) -> Result<Vec<u8>> {
    let lengths = code_lengths(input);
    let codes = canonical_codes(&lengths);
    let mut table = [(0u32, 0u8); 256];
    for (sym, code, len) in codes {
        table[sym as usize] = (code, len);
    }

    let mut out = Vec::with_capacity(input.len() / 2 + 260);
    out.extend_from_slice(&(input.len() as u32).to_le_bytes());
    out.extend_from_slice(&lengths);

    let mut acc = 0u64;
    let mut bits = 0u32;
    for &b in input {
        let (code, len) = table[b as usize];
        acc = (acc << len) | code as u64;
        bits += len as u32;
        while bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    if bits > 0 {
        out.push((acc << (8 - bits)) as u8);
    }
    Ok(out)
}

fn hde_decompress(input: &[u8]) -> Result<Vec<u8>> {
    if input.len() < 260 {
        return Err(Error::runtime(PASS, "truncated compressed stream"));
    }
    let original_len =
        u32::from_le_bytes([input[0], input[1], input[2], input[3]]) as usize;
    let mut lengths = [0u8; 256];
    lengths.copy_from_slice(&input[4..260]);
    let codes = canonical_codes(&lengths);

    let mut out = Vec::with_capacity(original_len);
    let mut code = 0u32;
    let mut len = 0u8;
    for &byte in &input[260..] {
        for bit in (0..8).rev() {
            code = (code << 1) | ((byte >> bit) & 1) as u32;
            len += 1;
            if let Some(&(sym, _, _)) = codes
                .iter()
                .find(|&&(_, c, l)| l == len && c == code)
            {
                out.push(sym);
                code = 0;
                len = 0;
                if out.len() == original_len {
                    return Ok(out);
                }
            }
        }
    }
    if out.len() != original_len {
        return Err(Error::runtime(
            PASS,
            format!(
                "compressed stream decoded {} of {original_len} bytes",
                out.len()
            ),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 37) as u8).collect();
        let packed = compress(Codec::Hde, &data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(Codec::Hde, &packed).unwrap(), data);
    }

    #[test]
    fn single_symbol_stream() {
        let data = vec![42u8; 500];
        let packed = compress(Codec::Hde, &data).unwrap();
        assert_eq!(decompress(Codec::Hde, &packed).unwrap(), data);
    }

    #[test]
    fn deterministic() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
        assert_eq!(
            compress(Codec::Hde, &data).unwrap(),
            compress(Codec::Hde, &data).unwrap()
        );
    }
}
