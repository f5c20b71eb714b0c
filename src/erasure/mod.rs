//! Reed-Solomon codec over the cell-striped extent shard layout.
//!
//! A payload of length `R` is prefixed with a 4-byte big-endian length header
//! and striped cell-by-cell, round-robin, across `data_shards` equally sized
//! shards; `parity_shards` additional shards are then filled by the codec.
//! Cell 0 of shard 0 starts with the header, so the first cell carries at
//! most `cell_size - 4` payload bytes.
//!
//! Decoding reverses the mapping after verifying (and, where needed,
//! reconstructing) the shard set. [`ErasureCoder::reconstruct`] is the
//! streaming variant used by recovery: it consumes one reader per surviving
//! shard position and rebuilds the missing positions into writers, one
//! bounded stripe at a time.

use crate::error::{BasaltError, Result};
use crate::types::ErasureConfig;
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::io::{Read, Write};
use tracing::debug;

/// Byte length of the big-endian payload-length header in shard 0.
pub const LENGTH_HEADER_SIZE: usize = 4;

/// Stripe length for streaming reconstruction. Memory use is bounded by
/// `RECONSTRUCT_STRIPE * total_shards` regardless of shard size.
const RECONSTRUCT_STRIPE: usize = 1 << 20;

/// Encoder/decoder for one erasure-coding configuration.
pub struct ErasureCoder {
    config: ErasureConfig,
    /// Absent when `parity_shards == 0`: the payload is striped without
    /// redundancy and the codec layer is bypassed.
    codec: Option<ReedSolomon>,
}

impl ErasureCoder {
    pub fn new(config: ErasureConfig) -> Result<Self> {
        config.validate()?;

        let codec = if config.parity_shards > 0 {
            Some(
                ReedSolomon::new(config.data_shards, config.parity_shards)
                    .map_err(|e| BasaltError::Internal(format!("failed to create codec: {}", e)))?,
            )
        } else {
            None
        };

        Ok(Self { config, codec })
    }

    pub fn config(&self) -> &ErasureConfig {
        &self.config
    }

    /// Shard length produced for a payload of `payload_len` bytes:
    /// `ceil((payload_len + 4) / (k * cell_size)) * cell_size`.
    pub fn object_size(&self, payload_len: usize) -> usize {
        let actual = payload_len + LENGTH_HEADER_SIZE;
        let group = self.config.data_shards * self.config.cell_size;
        actual.div_ceil(group) * self.config.cell_size
    }

    /// Encode a payload into `data_shards + parity_shards` equally sized
    /// shards. Deterministic for a given payload and configuration.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        let k = self.config.data_shards;
        let cell = self.config.cell_size;
        let actual_size = payload.len() + LENGTH_HEADER_SIZE;
        let object_size = self.object_size(payload.len());

        let mut shards = vec![vec![0u8; object_size]; self.config.total_shards()];

        // First cell: length header, then as much payload as fits after it.
        shards[0][..LENGTH_HEADER_SIZE].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        let first = payload.len().min(cell - LENGTH_HEADER_SIZE);
        shards[0][LENGTH_HEADER_SIZE..LENGTH_HEADER_SIZE + first]
            .copy_from_slice(&payload[..first]);

        // Remaining cells stripe round-robin over the data shards. Cell t
        // covers header-adjusted bytes [t*cell, t*cell + avail) of the
        // payload-with-header, i.e. payload bytes starting at t*cell - 4.
        let cell_count = actual_size.div_ceil(cell);
        for t in 1..cell_count {
            let row = t / k;
            let col = t % k;
            let avail = cell.min(actual_size - t * cell);
            let src = t * cell - LENGTH_HEADER_SIZE;
            shards[col][row * cell..row * cell + avail]
                .copy_from_slice(&payload[src..src + avail]);
        }

        if let Some(codec) = &self.codec {
            codec
                .encode(&mut shards)
                .map_err(|e| BasaltError::Internal(format!("encode failed: {}", e)))?;
        }

        debug!(
            payload_len = payload.len(),
            object_size,
            shards = shards.len(),
            "encoded payload into shards"
        );

        Ok(shards)
    }

    /// Decode a shard set back into the original payload. Missing shards are
    /// `None`; they are reconstructed first when parity allows it.
    pub fn decode(&self, shards: &mut [Option<Vec<u8>>]) -> Result<Vec<u8>> {
        let k = self.config.data_shards;
        let cell = self.config.cell_size;

        if shards.len() != self.config.total_shards() {
            return Err(BasaltError::Internal(format!(
                "expected {} shards, got {}",
                self.config.total_shards(),
                shards.len()
            )));
        }

        let missing = shards.iter().filter(|s| s.is_none()).count();
        match &self.codec {
            Some(codec) if missing > 0 => {
                codec.reconstruct(shards).map_err(|e| {
                    BasaltError::CorruptShards(format!("reconstruction failed: {}", e))
                })?;
            }
            Some(codec) => {
                let full: Vec<&[u8]> = shards
                    .iter()
                    .flatten()
                    .map(|s| s.as_slice())
                    .collect();
                let ok = codec
                    .verify(&full)
                    .map_err(|e| BasaltError::CorruptShards(format!("verify failed: {}", e)))?;
                if !ok {
                    return Err(BasaltError::CorruptShards(
                        "parity mismatch across shards".to_string(),
                    ));
                }
            }
            None if missing > 0 => {
                return Err(BasaltError::CorruptShards(format!(
                    "{} shards missing with no parity configured",
                    missing
                )));
            }
            None => {}
        }

        let object_size = match shards.iter().flatten().next() {
            Some(s) => s.len(),
            None => {
                return Err(BasaltError::CorruptShards("all shards missing".to_string()));
            }
        };
        if object_size % cell != 0 {
            return Err(BasaltError::CorruptShards(format!(
                "shard length {} is not cell-aligned",
                object_size
            )));
        }

        let shard0 = shards[0]
            .as_ref()
            .ok_or_else(|| BasaltError::CorruptShards("shard 0 unrecovered".to_string()))?;
        let mut header = [0u8; LENGTH_HEADER_SIZE];
        header.copy_from_slice(&shard0[..LENGTH_HEADER_SIZE]);
        let payload_len = u32::from_be_bytes(header) as usize;

        let actual_size = payload_len + LENGTH_HEADER_SIZE;
        if actual_size > k * object_size {
            return Err(BasaltError::CorruptShards(format!(
                "header claims {} payload bytes, shards hold at most {}",
                payload_len,
                k * object_size - LENGTH_HEADER_SIZE
            )));
        }

        // Reverse the cell mapping into a contiguous buffer, header included,
        // then strip the header.
        let mut full = vec![0u8; actual_size];
        let cell_count = actual_size.div_ceil(cell);
        for t in 0..cell_count {
            let row = t / k;
            let col = t % k;
            let n = cell.min(actual_size - t * cell);
            let shard = shards[col]
                .as_ref()
                .ok_or_else(|| BasaltError::CorruptShards(format!("shard {} unrecovered", col)))?;
            full[t * cell..t * cell + n].copy_from_slice(&shard[row * cell..row * cell + n]);
        }

        full.drain(..LENGTH_HEADER_SIZE);
        Ok(full)
    }

    /// Streaming reconstruction for recovery: `inputs` holds one reader per
    /// shard position (`None` where the shard is unavailable), `outputs` one
    /// writer per position to rebuild (`None` elsewhere). Shard bytes flow
    /// through in fixed-size stripes, so memory stays bounded no matter how
    /// large the shards are.
    pub fn reconstruct<R: Read, W: Write>(
        &self,
        inputs: &mut [Option<R>],
        outputs: &mut [Option<W>],
    ) -> Result<()> {
        let total = self.config.total_shards();
        if inputs.len() != total || outputs.len() != total {
            return Err(BasaltError::Internal(format!(
                "expected {} shard positions, got {} inputs / {} outputs",
                total,
                inputs.len(),
                outputs.len()
            )));
        }

        let present = inputs.iter().filter(|r| r.is_some()).count();
        if present < self.config.data_shards {
            return Err(BasaltError::ShardShort {
                available: present,
                required: self.config.data_shards,
            });
        }
        let codec = match &self.codec {
            Some(codec) => codec,
            None => {
                return Err(BasaltError::CorruptShards(
                    "cannot reconstruct without parity shards".to_string(),
                ));
            }
        };

        let mut buf = vec![0u8; RECONSTRUCT_STRIPE];
        loop {
            let mut stripes: Vec<Option<Vec<u8>>> = Vec::with_capacity(total);
            let mut stripe_len: Option<usize> = None;

            for input in inputs.iter_mut() {
                match input {
                    Some(reader) => {
                        let n = read_full(reader, &mut buf)?;
                        match stripe_len {
                            Some(expected) if expected != n => {
                                return Err(BasaltError::CorruptShards(format!(
                                    "shard length mismatch: {} vs {}",
                                    expected, n
                                )));
                            }
                            None => stripe_len = Some(n),
                            _ => {}
                        }
                        stripes.push(Some(buf[..n].to_vec()));
                    }
                    None => stripes.push(None),
                }
            }

            let n = stripe_len.unwrap_or(0);
            if n == 0 {
                break;
            }

            codec
                .reconstruct(&mut stripes)
                .map_err(|e| BasaltError::CorruptShards(format!("reconstruction failed: {}", e)))?;

            for (stripe, output) in stripes.iter().zip(outputs.iter_mut()) {
                if let (Some(stripe), Some(writer)) = (stripe, output) {
                    writer.write_all(stripe)?;
                }
            }

            if n < RECONSTRUCT_STRIPE {
                break;
            }
        }

        for output in outputs.iter_mut().flatten() {
            output.flush()?;
        }

        Ok(())
    }
}

/// Read into `buf` until it is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn coder(k: usize, m: usize, cell: usize) -> ErasureCoder {
        ErasureCoder::new(ErasureConfig {
            data_shards: k,
            parity_shards: m,
            cell_size: cell,
        })
        .unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_encode_shape_and_header() {
        let coder = coder(4, 2, 4096);
        let payload = pattern(123_456);
        let shards = coder.encode(&payload).unwrap();

        assert_eq!(shards.len(), 6);
        let object_size = coder.object_size(payload.len());
        for shard in &shards {
            assert_eq!(shard.len(), object_size);
        }
        assert_eq!(&shards[0][..4], &(payload.len() as u32).to_be_bytes());
    }

    #[test]
    fn test_round_trip_selected_configs() {
        for (k, m, cell) in [(1, 0, 4096), (2, 1, 4096), (4, 2, 65536), (16, 6, 4096)] {
            let coder = coder(k, m, cell);
            let payload = pattern(1 << 20);
            let shards = coder.encode(&payload).unwrap();
            let mut opts: Vec<_> = shards.into_iter().map(Some).collect();
            let decoded = coder.decode(&mut opts).unwrap();
            assert_eq!(decoded, payload, "round trip failed for {}+{}/{}", k, m, cell);
        }
    }

    #[test]
    fn test_every_single_shard_recoverable() {
        let coder = coder(4, 2, 4096);
        let payload = pattern(100_000);
        let shards = coder.encode(&payload).unwrap();

        for missing in 0..shards.len() {
            let mut opts: Vec<_> = shards.iter().cloned().map(Some).collect();
            opts[missing] = None;
            let decoded = coder.decode(&mut opts).unwrap();
            assert_eq!(decoded, payload, "failed with shard {} missing", missing);
        }
    }

    #[test]
    fn test_payload_smaller_than_first_cell() {
        // The whole payload fits behind the header in shard 0's first cell;
        // every other data shard is pure padding.
        let coder = coder(4, 2, 4096);
        let payload = pattern(100);
        let shards = coder.encode(&payload).unwrap();
        for shard in shards.iter().take(4).skip(1) {
            assert!(shard.iter().all(|&b| b == 0));
        }

        let mut opts: Vec<_> = shards.into_iter().map(Some).collect();
        opts[2] = None;
        assert_eq!(coder.decode(&mut opts).unwrap(), payload);
    }

    #[test]
    fn test_too_many_missing_fails() {
        let coder = coder(4, 2, 4096);
        let payload = pattern(50_000);
        let shards = coder.encode(&payload).unwrap();

        let mut opts: Vec<_> = shards.into_iter().map(Some).collect();
        opts[0] = None;
        opts[1] = None;
        opts[4] = None;
        assert!(matches!(
            coder.decode(&mut opts),
            Err(BasaltError::CorruptShards(_))
        ));
    }

    #[test]
    fn test_zero_parity_requires_all_shards() {
        let coder = coder(4, 0, 4096);
        let payload = pattern(10_000);
        let shards = coder.encode(&payload).unwrap();
        assert_eq!(shards.len(), 4);

        let mut opts: Vec<_> = shards.iter().cloned().map(Some).collect();
        assert_eq!(coder.decode(&mut opts).unwrap(), payload);

        opts = shards.into_iter().map(Some).collect();
        opts[1] = None;
        assert!(coder.decode(&mut opts).is_err());
    }

    #[test]
    fn test_streaming_reconstruct_matches_encoded_shard() {
        let coder = coder(4, 2, 65536);
        let payload = pattern(123_456);
        let shards = coder.encode(&payload).unwrap();

        let missing = 3;
        let mut inputs: Vec<Option<Cursor<Vec<u8>>>> = shards
            .iter()
            .enumerate()
            .map(|(i, s)| {
                if i == missing {
                    None
                } else {
                    Some(Cursor::new(s.clone()))
                }
            })
            .collect();
        let mut outputs: Vec<Option<Vec<u8>>> =
            (0..shards.len()).map(|_| None).collect();
        outputs[missing] = Some(Vec::new());

        coder.reconstruct(&mut inputs, &mut outputs).unwrap();
        assert_eq!(outputs[missing].as_deref().unwrap(), &shards[missing][..]);
    }

    #[test]
    fn test_streaming_reconstruct_too_few_survivors() {
        let coder = coder(4, 2, 4096);
        let payload = pattern(40_000);
        let shards = coder.encode(&payload).unwrap();

        let mut inputs: Vec<Option<Cursor<Vec<u8>>>> = shards
            .iter()
            .enumerate()
            .map(|(i, s)| (i >= 3).then(|| Cursor::new(s.clone())))
            .collect();
        let mut outputs: Vec<Option<Vec<u8>>> =
            (0..shards.len()).map(|_| None).collect();
        outputs[0] = Some(Vec::new());

        assert!(matches!(
            coder.reconstruct(&mut inputs, &mut outputs),
            Err(BasaltError::ShardShort { available: 3, required: 4 })
        ));
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert!(ErasureCoder::new(ErasureConfig {
            data_shards: 0,
            parity_shards: 2,
            cell_size: 4096,
        })
        .is_err());
        assert!(ErasureCoder::new(ErasureConfig {
            data_shards: 255,
            parity_shards: 2,
            cell_size: 4096,
        })
        .is_err());
    }
}
