//! Traffic-shape padding.
//!
//! Plaintexts are padded up to a small set of block sizes before
//! encryption so ciphertext lengths cluster. The pad length lives in the
//! final byte, so at most 255 bytes can ever be added; data that lands
//! within 1-255 bytes under a bucket boundary but needs more goes out
//! unpadded. Peers must agree on these rules byte-for-byte.

use rand_core::{OsRng, RngCore};

/// Target plaintext size buckets.
const BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];
/// Room assumed for AEAD framing when choosing a bucket.
const AEAD_OVERHEAD: usize = 16;
/// The pad length must fit one trailing byte.
const MAX_PADDING: usize = 255;

/// Smallest bucket that holds `data_len` plus AEAD overhead, or `data_len`
/// itself when no bucket fits.
pub fn optimal_block_size(data_len: usize) -> usize {
    let total = data_len + AEAD_OVERHEAD;
    for block in BLOCK_SIZES {
        if total <= block {
            return block;
        }
    }
    data_len
}

/// Pad `data` to `target` bytes: random filler, then a trailing pad-length
/// byte. No-op when the data already reaches the target or the pad would
/// not fit in one byte.
pub fn pad_to_block(data: &[u8], target: usize) -> Vec<u8> {
    if data.len() >= target {
        return data.to_vec();
    }
    let pad_len = target - data.len();
    if pad_len > MAX_PADDING {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(data);
    // Random fill, not zeros, so padded tails do not compress away.
    let mut filler = vec![0u8; pad_len - 1];
    OsRng.fill_bytes(&mut filler);
    out.extend_from_slice(&filler);
    out.push(pad_len as u8);
    out
}

/// Strip padding applied by [`pad_to_block`]. Buffers that do not look
/// padded (zero or oversized trailing byte) come back unchanged, so this
/// never shrinks below what the trailing byte accounts for.
pub fn unpad(data: &[u8]) -> Vec<u8> {
    let Some(&last) = data.last() else {
        return Vec::new();
    };
    let pad_len = last as usize;
    if pad_len == 0 || pad_len > data.len() {
        return data.to_vec();
    }
    data[..data.len() - pad_len].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_then_unpad_recovers_input() {
        let data = vec![0xABu8; 100];
        let padded = pad_to_block(&data, 256);
        assert_eq!(padded.len(), 256);
        assert_eq!(unpad(&padded), data);
    }

    #[test]
    fn recovery_holds_across_pad_range() {
        // Any target within one length byte of the data pads reversibly.
        for data_len in [0usize, 1, 17, 100, 200, 254, 255] {
            let data = vec![0x5Au8; data_len];
            for pad in [1usize, 2, 50, 255] {
                let target = data_len + pad;
                let padded = pad_to_block(&data, target);
                assert_eq!(padded.len(), target);
                assert_eq!(unpad(&padded), data, "len {data_len} pad {pad}");
            }
        }
    }

    #[test]
    fn pad_is_noop_when_already_large_enough() {
        let data = vec![1u8; 300];
        assert_eq!(pad_to_block(&data, 256), data);
        assert_eq!(pad_to_block(&data, 300), data);
    }

    #[test]
    fn pad_is_noop_when_padding_exceeds_length_byte() {
        let data = vec![1u8; 10];
        // 2048 - 10 far exceeds 255, so the data goes out unpadded.
        assert_eq!(pad_to_block(&data, 2048), data);
        assert_eq!(pad_to_block(&data, 266), data);
        // One byte under the limit still pads.
        assert_eq!(pad_to_block(&data, 265).len(), 265);
    }

    #[test]
    fn filler_is_not_zeros() {
        let padded = pad_to_block(&[0u8; 16], 256);
        let filler = &padded[16..255];
        assert!(filler.iter().any(|&b| b != 0));
    }

    #[test]
    fn unpad_leaves_unpadded_data_alone() {
        assert_eq!(unpad(&[7, 7, 7, 0]), vec![7, 7, 7, 0]);
        let data = [1u8, 2, 200];
        assert_eq!(unpad(&data), data.to_vec());
        assert_eq!(unpad(&[]), Vec::<u8>::new());
    }

    #[test]
    fn block_size_selection() {
        assert_eq!(optimal_block_size(0), 256);
        assert_eq!(optimal_block_size(100), 256);
        assert_eq!(optimal_block_size(240), 256);
        assert_eq!(optimal_block_size(241), 512);
        assert_eq!(optimal_block_size(496), 512);
        assert_eq!(optimal_block_size(497), 1024);
        assert_eq!(optimal_block_size(2032), 2048);
        assert_eq!(optimal_block_size(2033), 2033);
        assert_eq!(optimal_block_size(5000), 5000);
    }
}
