use std::collections::BTreeMap;

use gf256::gf256;

use crate::constants::{DEFAULT_MAX_SEGMENT_SIZE, MAX_SHARES_TOTAL};
use crate::error::{GridError, Result};

const HEADER_SIZE: usize = 4 + 8;

/// A k-of-n erasure code: any `needed` of the `total` shares rebuild the input.
pub trait Codec: Send + Sync {
    /// Encodes `data` into `total` shares, indexed by share number.
    fn encode(&self, data: &[u8], needed: usize, total: usize) -> Result<Vec<Vec<u8>>>;

    /// Rebuilds the input from at least `needed` shares keyed by share number.
    fn decode(&self, shares: &BTreeMap<u8, Vec<u8>>, needed: usize, total: usize) -> Result<Vec<u8>>;
}

/// Systematic Reed-Solomon code over GF(2^8).
///
/// Input is cut into segments of at most `max_segment_size` bytes. Each
/// segment is split into `k` equal blocks, which become the first `k` shares
/// unchanged; the remaining `n - k` shares hold the values at `x = k+1..=n`
/// of the polynomial through the data points at `x = 1..=k`.
///
/// Every share starts with a 12 byte header: the segment size (u32, big
/// endian) and the input length (u64, big endian).
///
/// # Examples
///
/// ```rust
/// use std::collections::BTreeMap;
/// use sharegrid::codec::{Codec, LagrangeCodec};
///
/// let codec = LagrangeCodec::new(1024);
/// let shares = codec.encode(b"hello world", 2, 4).unwrap();
///
/// // any two shares will do
/// let subset: BTreeMap<u8, Vec<u8>> = [(1u8, shares[1].clone()), (3u8, shares[3].clone())].into();
/// assert_eq!(codec.decode(&subset, 2, 4).unwrap(), b"hello world");
/// ```
#[derive(Debug, Clone, Copy)]
pub struct LagrangeCodec {
    max_segment_size: usize,
}

impl Default for LagrangeCodec {
    fn default() -> Self {
        LagrangeCodec::new(DEFAULT_MAX_SEGMENT_SIZE)
    }
}

impl LagrangeCodec {
    pub fn new(max_segment_size: usize) -> Self {
        LagrangeCodec {
            max_segment_size: max_segment_size.max(1),
        }
    }

    pub fn max_segment_size(&self) -> usize {
        self.max_segment_size
    }
}

fn check_parameters(needed: usize, total: usize) -> Result<()> {
    if needed == 0 || needed > total || total > MAX_SHARES_TOTAL {
        return Err(GridError::Codec(format!(
            "cannot encode {needed}-of-{total}"
        )));
    }
    Ok(())
}

/// Splits the input length into segment lengths.
fn segment_lengths(length: usize, segment_size: usize) -> impl Iterator<Item = usize> {
    let full = length / segment_size;
    let tail = length % segment_size;
    std::iter::repeat(segment_size)
        .take(full)
        .chain((tail > 0).then_some(tail))
}

fn block_size(segment_length: usize, needed: usize) -> usize {
    segment_length.div_ceil(needed)
}

/// Bytes each share carries after its header, or `None` if that does not
/// fit in memory.
fn encoded_length(length: u64, segment_size: usize, needed: usize) -> Option<usize> {
    let length = usize::try_from(length).ok()?;
    let full = length / segment_size;
    let tail = length % segment_size;
    full.checked_mul(block_size(segment_size, needed))?
        .checked_add(block_size(tail, needed))
}

/// Computes the Lagrange basis weights for evaluating at `x` the polynomial
/// through points at `xs`.
///
/// Interpolating is then a dot product of the weights with the y values.
/// Addition in GF(2^8) is XOR, so `x - x_j` is written `x + x_j`.
fn lagrange_weights(xs: &[gf256], x: gf256) -> Vec<gf256> {
    xs.iter()
        .enumerate()
        .map(|(i, &a_x)| {
            let mut weight = gf256::new(1);
            for (j, &b_x) in xs.iter().enumerate() {
                if i != j {
                    weight *= (x + b_x) / (a_x + b_x);
                }
            }
            weight
        })
        .collect()
}

fn share_x(share_number: usize) -> gf256 {
    gf256::new((share_number + 1) as u8)
}

fn combine(weights: &[gf256], blocks: &[&[u8]], offset: usize) -> u8 {
    let mut value = gf256::new(0);
    for (weight, block) in weights.iter().zip(blocks) {
        value += *weight * gf256::new(block[offset]);
    }
    u8::from(value)
}

impl Codec for LagrangeCodec {
    fn encode(&self, data: &[u8], needed: usize, total: usize) -> Result<Vec<Vec<u8>>> {
        check_parameters(needed, total)?;

        let segment_size = u32::try_from(self.max_segment_size).map_err(|_| {
            GridError::Codec(format!("segment size {} too large", self.max_segment_size))
        })?;
        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(&segment_size.to_be_bytes());
        header.extend_from_slice(&(data.len() as u64).to_be_bytes());
        let mut shares = vec![header; total];

        let data_xs: Vec<gf256> = (0..needed).map(share_x).collect();
        let parity_weights: Vec<Vec<gf256>> = (needed..total)
            .map(|s| lagrange_weights(&data_xs, share_x(s)))
            .collect();

        let mut start = 0;
        for length in segment_lengths(data.len(), self.max_segment_size) {
            let block = block_size(length, needed);
            let mut padded = data[start..start + length].to_vec();
            padded.resize(block * needed, 0);
            start += length;

            let blocks: Vec<&[u8]> = padded.chunks(block).collect();
            for (s, chunk) in blocks.iter().enumerate() {
                shares[s].extend_from_slice(chunk);
            }
            for (p, weights) in parity_weights.iter().enumerate() {
                let parity: Vec<u8> = (0..block).map(|o| combine(weights, &blocks, o)).collect();
                shares[needed + p].extend_from_slice(&parity);
            }
        }
        Ok(shares)
    }

    fn decode(&self, shares: &BTreeMap<u8, Vec<u8>>, needed: usize, total: usize) -> Result<Vec<u8>> {
        check_parameters(needed, total)?;

        // prefer data shares, they need no arithmetic
        let chosen: Vec<(usize, &Vec<u8>)> = shares
            .iter()
            .map(|(&s, bytes)| (s as usize, bytes))
            .filter(|(s, _)| *s < total)
            .take(needed)
            .collect();
        if chosen.len() < needed {
            return Err(GridError::Codec(format!(
                "have {} usable shares, need {needed}",
                chosen.len()
            )));
        }

        let header = &chosen[0].1;
        if header.len() < HEADER_SIZE || chosen.iter().any(|(_, b)| b.len() != header.len()) {
            return Err(GridError::Codec("inconsistent share lengths".to_string()));
        }
        if chosen.iter().any(|(_, b)| b[..HEADER_SIZE] != header[..HEADER_SIZE]) {
            return Err(GridError::Codec("inconsistent share headers".to_string()));
        }
        let mut segment_size = [0u8; 4];
        segment_size.copy_from_slice(&header[..4]);
        let segment_size = u32::from_be_bytes(segment_size) as usize;
        let mut length = [0u8; 8];
        length.copy_from_slice(&header[4..HEADER_SIZE]);
        let length = u64::from_be_bytes(length);
        if segment_size == 0 {
            return Err(GridError::Codec("zero segment size".to_string()));
        }
        if encoded_length(length, segment_size, needed) != Some(header.len() - HEADER_SIZE) {
            return Err(GridError::Codec("share length does not match header".to_string()));
        }
        // bounded by the share length checked above
        let length = length as usize;

        let xs: Vec<gf256> = chosen.iter().map(|(s, _)| share_x(*s)).collect();
        let recover: Vec<Option<Vec<gf256>>> = (0..needed)
            .map(|i| {
                if chosen.iter().any(|(s, _)| *s == i) {
                    None
                } else {
                    Some(lagrange_weights(&xs, share_x(i)))
                }
            })
            .collect();

        let mut out = Vec::with_capacity(length);
        let mut offset = HEADER_SIZE;
        for segment_length in segment_lengths(length, segment_size) {
            let block = block_size(segment_length, needed);
            let blocks: Vec<&[u8]> = chosen
                .iter()
                .map(|(_, b)| &b[offset..offset + block])
                .collect();

            let mut segment = Vec::with_capacity(block * needed);
            for (i, weights) in recover.iter().enumerate() {
                match weights {
                    None => {
                        let position = chosen.iter().position(|(s, _)| *s == i).unwrap_or(0);
                        segment.extend_from_slice(blocks[position]);
                    }
                    Some(weights) => {
                        segment.extend((0..block).map(|o| combine(weights, &blocks, o)));
                    }
                }
            }
            segment.truncate(segment_length);
            out.extend_from_slice(&segment);
            offset += block;
        }
        Ok(out)
    }
}
