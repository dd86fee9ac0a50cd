//! Slow-data scrambling and 6-byte block reassembly.
//!
//! Each AMBE datagram carries a 3-byte slow-data tail, scrambled by
//! XOR against a fixed key. Two consecutive fragments concatenate into
//! a 6-byte logical block: byte 0's high nibble is the side-channel
//! `type`, the low nibble is the payload `length` (0..5), and the
//! remaining up to 5 bytes are payload for that type's assembler
//! (`spec.md` §3, §4.1).

use crate::error::Malformed;

const SCRAMBLE_KEY: [u8; 3] = [0x70, 0x4F, 0x93];

/// XORs a 3-byte slow-data block against the fixed scramble key.
/// Self-inverse: scrambling and descrambling are the same operation.
pub fn scramble_slow_data(block: [u8; 3]) -> [u8; 3] {
    [
        block[0] ^ SCRAMBLE_KEY[0],
        block[1] ^ SCRAMBLE_KEY[1],
        block[2] ^ SCRAMBLE_KEY[2],
    ]
}

/// Descrambles a 3-byte slow-data fragment. `fragment_index` (the
/// fragment's position within the stream) does not affect the XOR —
/// it exists so callers can track which half of a 6-byte-block pair
/// this fragment is, the way `SlowDataDemux` does internally.
pub fn descramble_slow_data(block: [u8; 3], _fragment_index: usize) -> [u8; 3] {
    scramble_slow_data(block)
}

/// Reassembles descrambled 3-byte slow-data fragments into 6-byte
/// blocks and splits off each block's payload. One instance per
/// logical AMBE stream; call `sync()` on every sync frame (every 21st
/// voice frame) to resynchronize, per `spec.md` §4.1's failure model:
/// a length field out of range resets the assembler but never the
/// caller's voice-frame delivery.
#[derive(Default)]
pub struct SlowDataDemux {
    pending: Option<[u8; 3]>,
}

impl SlowDataDemux {
    pub fn new() -> SlowDataDemux {
        SlowDataDemux { pending: None }
    }

    /// Resets assembly state. Must be called on sync frames.
    pub fn sync(&mut self) {
        self.pending = None;
    }

    /// Feeds one raw (still-scrambled) 3-byte slow-data fragment.
    /// Returns `Some((type, payload))` once a full 6-byte block has
    /// been assembled from a pair of fragments.
    pub fn push(&mut self, raw_fragment: [u8; 3]) -> Result<Option<(u8, Vec<u8>)>, Malformed> {
        let descrambled = descramble_slow_data(raw_fragment, 0);
        match self.pending.take() {
            None => {
                self.pending = Some(descrambled);
                Ok(None)
            }
            Some(first) => {
                let mut block = [0u8; 6];
                block[..3].copy_from_slice(&first);
                block[3..].copy_from_slice(&descrambled);

                let data_type = block[0] >> 4;
                let length = (block[0] & 0x0F) as usize;
                if length > 5 {
                    self.sync();
                    return Err(Malformed("slow-data length field out of range"));
                }
                Ok(Some((data_type, block[1..1 + length].to_vec())))
            }
        }
    }
}

/// One-shot helper matching `spec.md` §4.1's `collectSlowData(streamFragments)
/// → (type, payload)`: reassembles a whole stream's worth of raw
/// fragments and concatenates payload bytes carrying the
/// last-seen `type`.
pub fn collect_slow_data(fragments: &[[u8; 3]]) -> Result<(u8, Vec<u8>), Malformed> {
    let mut demux = SlowDataDemux::new();
    let mut data_type = 0u8;
    let mut payload = Vec::new();
    for fragment in fragments {
        if let Some((t, chunk)) = demux.push(*fragment)? {
            data_type = t;
            payload.extend(chunk);
        }
    }
    Ok((data_type, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descramble_is_self_inverse() {
        for seed in 0u8..=10 {
            let block = [seed, seed.wrapping_mul(3), seed.wrapping_add(7)];
            let scrambled = scramble_slow_data(block);
            let restored = descramble_slow_data(scrambled, 0);
            assert_eq!(restored, block);
        }
    }

    #[test]
    fn pairs_fragments_into_blocks() {
        // type=2, length=3, payload = [0xAA, 0xBB, 0xCC]
        let header_byte = (2u8 << 4) | 3;
        let logical_block = [header_byte, 0xAA, 0xBB, 0xCC, 0x00, 0x00];
        let frag0 = scramble_slow_data([logical_block[0], logical_block[1], logical_block[2]]);
        let frag1 = scramble_slow_data([logical_block[3], logical_block[4], logical_block[5]]);

        let mut demux = SlowDataDemux::new();
        assert!(demux.push(frag0).unwrap().is_none());
        let (data_type, payload) = demux.push(frag1).unwrap().unwrap();
        assert_eq!(data_type, 2);
        assert_eq!(payload, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn rejects_length_over_five() {
        let header_byte = (1u8 << 4) | 7; // invalid length
        let frag0 = scramble_slow_data([header_byte, 0, 0]);
        let frag1 = scramble_slow_data([0, 0, 0]);

        let mut demux = SlowDataDemux::new();
        demux.push(frag0).unwrap();
        assert!(demux.push(frag1).is_err());
    }

    #[test]
    fn sync_resets_pairing() {
        let mut demux = SlowDataDemux::new();
        demux.push([1, 2, 3]).unwrap();
        demux.sync();
        // After sync, the next fragment starts a fresh pair rather
        // than completing the one before the sync.
        assert!(demux.push([4, 5, 6]).unwrap().is_none());
    }
}
