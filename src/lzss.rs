/*!
# Parametric LZSS Codec

The disc's assets are compressed with an LZSS variant whose distance and
length field widths vary per asset. Each descriptor record carries the two
widths; the common pairing is 11-bit lookback with 4-bit repetition.

## Stream grammar

One token at a time, read through the bit buffer:

- flag bit 1: literal, the next 8 bits are an output byte
- flag bit 0: back-reference, `lookback` bits of distance then
  `repetition` bits of length code

`lookback` counts backwards from the output tail, so 0 means the previous
byte. The copy length is `length_code + min_rep`, where `min_rep` is the
smallest length at which a reference beats writing literals. Bytes are
copied one at a time, so a reference may read bytes it is itself producing
(run encoding).

Discovery only ever decompresses and probes; the encoder exists to
validate the decoder by round-trip.
*/

use thiserror::Error;

use crate::bitbuf::{BitReader, BitWriter, ShortRead};

/// Distance field width used when no descriptor says otherwise.
pub const DEFAULT_LOOKBACK_BITS: u32 = 11;
/// Length field width used when no descriptor says otherwise.
pub const DEFAULT_REPETITION_BITS: u32 = 4;

const FLAG_BITS: u32 = 1;
const FLAG_REPETITION: u32 = 0;
const FLAG_LITERAL: u32 = 1;
const BITS_PER_BYTE: u32 = 8;

/// Decompression failed; the stream is not a valid asset at this position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LzssError {
    #[error(transparent)]
    ShortRead(#[from] ShortRead),
    /// A back-reference pointed at bytes that were never decoded.
    #[error("illegal decompression sequence")]
    IllegalSequence,
}

/// Minimum copy length at which a back-reference token is smaller than the
/// literals it replaces.
pub fn min_repetitions(lookback_bits: u32, repetition_bits: u32) -> usize {
    let token_bits = lookback_bits + repetition_bits + FLAG_BITS;
    token_bits.div_ceil(FLAG_BITS + BITS_PER_BYTE) as usize
}

/// Decompress `final_size` bytes starting at `offset` in `buf`.
pub fn decompress(
    buf: &[u8],
    offset: usize,
    final_size: usize,
    lookback_bits: u32,
    repetition_bits: u32,
) -> Result<Vec<u8>, LzssError> {
    let tail = buf.get(offset..).ok_or(ShortRead)?;
    let mut bits = BitReader::new(tail);
    let min_rep = min_repetitions(lookback_bits, repetition_bits);

    let mut output = Vec::with_capacity(final_size);
    while output.len() < final_size {
        if bits.read_bits(FLAG_BITS)? == FLAG_REPETITION {
            let lookback = bits.read_bits(lookback_bits)? as usize;
            if lookback >= output.len() {
                return Err(LzssError::IllegalSequence);
            }
            let count = bits.read_bits(repetition_bits)? as usize + min_rep;

            // Copy byte-wise: the source window may include bytes this
            // reference is itself appending.
            let from = output.len() - 1 - lookback;
            for i in 0..count {
                let byte = output[from + i];
                output.push(byte);
            }
        } else {
            output.push(bits.read_bits(BITS_PER_BYTE)? as u8);
        }
    }

    Ok(output)
}

/// Simulate decompression and report how many bytes of `buf`, counted from
/// `offset` in whole 32-bit words, one stream occupies.
///
/// Returns `None` when any token is malformed or the stream underruns
/// before `final_size` bytes of output have been accounted for. Probing
/// never copies bytes, only tracks the output length.
pub fn probe_compressed_size(
    buf: &[u8],
    offset: usize,
    final_size: usize,
    lookback_bits: u32,
    repetition_bits: u32,
) -> Option<usize> {
    let tail = buf.get(offset..)?;
    let mut bits = BitReader::new(tail);
    let min_rep = min_repetitions(lookback_bits, repetition_bits);

    let mut size = 0usize;
    while size < final_size {
        match bits.read_bits(FLAG_BITS) {
            Ok(FLAG_REPETITION) => {
                let lookback = bits.read_bits(lookback_bits).ok()? as usize;
                if lookback >= size {
                    return None;
                }
                size += bits.read_bits(repetition_bits).ok()? as usize + min_rep;
            }
            Ok(_) => {
                bits.read_bits(BITS_PER_BYTE).ok()?;
                size += 1;
            }
            Err(ShortRead) => return None,
        }
    }

    Some(bits.bytes_consumed())
}

/// Simulate decompression of the `compressed_size` bytes at `offset` and
/// report how much output they would produce.
///
/// Only meaningful when the caller already believes compressed data begins
/// at `offset`: the stream is read from a bounded slice, and whatever has
/// been accounted for when the slice exhausts (or a reference reaches past
/// the simulated output) is returned as-is.
pub fn probe_decompressed_size(
    buf: &[u8],
    offset: usize,
    compressed_size: usize,
    lookback_bits: u32,
    repetition_bits: u32,
) -> usize {
    let start = offset.min(buf.len());
    let end = offset.saturating_add(compressed_size).min(buf.len());
    let mut bits = BitReader::new(&buf[start..end]);
    let min_rep = min_repetitions(lookback_bits, repetition_bits);

    let mut size = 0usize;
    loop {
        match bits.read_bits(FLAG_BITS) {
            Ok(FLAG_REPETITION) => {
                let Ok(lookback) = bits.read_bits(lookback_bits) else {
                    break;
                };
                if lookback as usize >= size {
                    break;
                }
                let Ok(code) = bits.read_bits(repetition_bits) else {
                    break;
                };
                size += code as usize + min_rep;
            }
            Ok(_) => {
                if bits.read_bits(BITS_PER_BYTE).is_err() {
                    break;
                }
                size += 1;
            }
            Err(ShortRead) => break,
        }
    }

    size
}

/// Does a stream at `offset` decode to at least `minimum_bytes` of output
/// without a malformed token? This is the structural probe used when
/// sweeping the data archive for plausible compressed payloads.
pub fn test_decompress(
    buf: &[u8],
    offset: usize,
    minimum_bytes: usize,
    lookback_bits: u32,
    repetition_bits: u32,
) -> bool {
    probe_compressed_size(buf, offset, minimum_bytes, lookback_bits, repetition_bits).is_some()
}

/// First position in `data[from..to]` where `needle` occurs in full.
fn find_sequence(data: &[u8], needle: &[u8], from: usize, to: usize) -> Option<usize> {
    let to = to.min(data.len());
    if needle.is_empty() || from >= to || from + needle.len() > to {
        return None;
    }
    data[from..to]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|i| i + from)
}

/// Compress `input` with the given field widths.
///
/// Greedy longest-match search: find the shortest match first, then extend
/// it byte-by-byte from the position it was found at, narrowing the search
/// window to that position before looking for anything longer. Produces
/// the same output as a naive window scan while terminating early once a
/// matched prefix stops extending.
pub fn compress(input: &[u8], lookback_bits: u32, repetition_bits: u32) -> Vec<u8> {
    let mut bits = BitWriter::new();
    let min_rep = min_repetitions(lookback_bits, repetition_bits);
    let max_lookback = (1usize << lookback_bits) - 1;
    let max_repetitions = min_rep + (1usize << repetition_bits) - 1;

    let len = input.len();
    let mut pos = 0usize;

    while pos < len {
        let mut min_search = pos.saturating_sub(max_lookback);
        let max_search = len.min(pos + max_repetitions);

        let mut best_len = 0usize;
        let mut best_index = 0usize;
        let mut search_size = 1usize;

        while search_size <= max_repetitions && pos + search_size < max_search {
            let needle = &input[pos..pos + search_size];
            let found = match find_sequence(input, needle, min_search, max_search) {
                Some(i) if i < pos => i,
                _ => break,
            };

            best_index = found;
            best_len = search_size;

            // The hit is known to match `search_size` bytes; see how far
            // it keeps matching before searching again.
            search_size += 1;
            let mut probe = search_size - 1;
            while search_size <= max_repetitions
                && pos + probe < max_search
                && input[found + probe] == input[pos + probe]
            {
                best_len = search_size;
                probe = search_size;
                search_size += 1;
            }

            // Nothing longer can start before this hit.
            min_search = found;
        }

        if best_len < min_rep {
            bits.write_bits(FLAG_LITERAL, FLAG_BITS);
            bits.write_bits(u32::from(input[pos]), BITS_PER_BYTE);
            pos += 1;
        } else {
            bits.write_bits(FLAG_REPETITION, FLAG_BITS);
            bits.write_bits((pos - best_index - 1) as u32, lookback_bits);
            bits.write_bits((best_len - min_rep) as u32, repetition_bits);
            pos += best_len;
        }
    }

    bits.finish()
}
