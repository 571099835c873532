//! Splitting advertising payloads into controller-sized fragments.

use crate::hci::AdvDataOp;

/// Largest single write for extended advertising or scan response data.
pub const EXT_ADV_DATA_LEN_MAX: usize = 251;
/// Largest single write for periodic advertising data.
pub const PERIODIC_ADV_DATA_LEN_MAX: usize = 252;

/// Splits `data` into `(operation, chunk)` pairs in send order.
///
/// A payload that fits in one chunk (including an empty payload) is a
/// single `Complete` write; anything larger opens with `First`, continues
/// with `Intermediate`, and closes with `Last`. The caller must deliver
/// the chunks strictly in order, each only after the previous one was
/// accepted.
pub fn fragments(data: &[u8], max_chunk: usize) -> Vec<(AdvDataOp, &[u8])> {
    if data.len() <= max_chunk {
        return vec![(AdvDataOp::Complete, data)];
    }

    let mut out = Vec::with_capacity(data.len() / max_chunk + 1);
    let mut offset = 0;
    while offset < data.len() {
        let remaining = data.len() - offset;
        let len = remaining.min(max_chunk);
        let op = if offset == 0 {
            AdvDataOp::First
        } else if remaining > max_chunk {
            AdvDataOp::Intermediate
        } else {
            AdvDataOp::Last
        };
        out.push((op, &data[offset..offset + len]));
        offset += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    #[test]
    fn test_empty_payload_single_complete() {
        let chunks = fragments(&[], EXT_ADV_DATA_LEN_MAX);
        assert_eq!(chunks, vec![(AdvDataOp::Complete, &[][..])]);
    }

    #[test]
    fn test_exact_fit_single_complete() {
        let data = vec![0xab; EXT_ADV_DATA_LEN_MAX];
        let chunks = fragments(&data, EXT_ADV_DATA_LEN_MAX);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0, AdvDataOp::Complete);
        assert_eq!(chunks[0].1.len(), EXT_ADV_DATA_LEN_MAX);
    }

    #[test]
    fn test_two_fragments() {
        let data: Vec<u8> = (0..300u16).map(|b| b as u8).collect();
        let chunks = fragments(&data, EXT_ADV_DATA_LEN_MAX);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].0, AdvDataOp::First);
        assert_eq!(chunks[0].1.len(), 251);
        assert_eq!(chunks[1].0, AdvDataOp::Last);
        assert_eq!(chunks[1].1.len(), 49);
    }

    #[test]
    fn test_intermediate_fragments() {
        let data = vec![0x55u8; 503];
        let chunks = fragments(&data, EXT_ADV_DATA_LEN_MAX);
        let ops: Vec<AdvDataOp> = chunks.iter().map(|(op, _)| *op).collect();
        assert_eq!(ops, vec![AdvDataOp::First, AdvDataOp::Intermediate, AdvDataOp::Last]);
    }

    #[test]
    fn test_boundary_is_last_not_intermediate() {
        // Exactly two full chunks: the second carries max_chunk bytes but
        // still closes the sequence.
        let data = vec![0u8; 2 * EXT_ADV_DATA_LEN_MAX];
        let chunks = fragments(&data, EXT_ADV_DATA_LEN_MAX);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].0, AdvDataOp::Last);
    }

    #[test]
    fn test_reassembly_and_count() {
        for len in [0usize, 1, 250, 251, 252, 300, 502, 503, 1000] {
            let data: Vec<u8> = (0..len).map(|b| b as u8).collect();
            let chunks = fragments(&data, EXT_ADV_DATA_LEN_MAX);
            let expected_count =
                if len <= EXT_ADV_DATA_LEN_MAX { 1 } else { len.div_ceil(EXT_ADV_DATA_LEN_MAX) };
            assert_eq!(chunks.len(), expected_count, "len {}", len);
            let rebuilt: Vec<u8> = chunks.iter().map(|(_, c)| c.to_vec()).concat();
            assert_eq!(rebuilt, data, "len {}", len);
        }
    }

    #[test]
    fn test_periodic_chunk_size() {
        let data = vec![0u8; 253];
        let chunks = fragments(&data, PERIODIC_ADV_DATA_LEN_MAX);
        assert_eq!(chunks[0].1.len(), 252);
        assert_eq!(chunks[1].1.len(), 1);
    }
}
