use super::collective::Collective;
use std::ops::Range;

/// The contiguous share of `len` items that `part` out of `parts` handles. The first
/// `len % parts` parts take one extra item.
pub fn partition_range(len: usize, parts: usize, part: usize) -> Range<usize> {
    let parts = parts.max(1);
    let base = len / parts;
    let extra = len % parts;
    let start = part * base + part.min(extra);
    let end = start + base + usize::from(part < extra);
    start.min(len)..end.min(len)
}

/// Round-robin owner rank of each of `count` items.
pub fn assign_round_robin(count: usize, size: usize) -> Vec<usize> {
    (0..count).map(|i| i % size.max(1)).collect()
}

/// Gathers `payload` from every rank together with a success flag.
///
/// Returns the payloads (indexed by rank) if every rank succeeded, otherwise the lowest rank
/// that reported a failure.
pub(crate) fn gather_with_status(
    comm: &dyn Collective,
    ok: bool,
    payload: Vec<f64>,
) -> Result<Vec<Vec<f64>>, usize> {
    let mut message = Vec::with_capacity(payload.len() + 1);
    message.push(if ok { 1.0 } else { 0.0 });
    message.extend(payload);
    let gathered = comm.all_gather(message);
    if let Some(rank) = gathered.iter().position(|m| m.first() != Some(&1.0)) {
        return Err(rank);
    }
    Ok(gathered.into_iter().map(|mut m| m.split_off(1)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::distributed::collective::SerialComm;

    #[test]
    fn ranges_cover_everything_once() {
        for len in 0..12 {
            for parts in 1..5 {
                let mut covered = Vec::new();
                for p in 0..parts {
                    covered.extend(partition_range(len, parts, p));
                }
                assert_eq!(covered, (0..len).collect::<Vec<_>>(), "len {len} parts {parts}");
            }
        }
        assert_eq!(partition_range(7, 3, 0), 0..3);
        assert_eq!(partition_range(7, 3, 2), 5..7);
        assert_eq!(partition_range(2, 4, 3), 2..2);
    }

    #[test]
    fn round_robin_cycles_through_ranks() {
        assert_eq!(assign_round_robin(5, 2), vec![0, 1, 0, 1, 0]);
        assert_eq!(assign_round_robin(2, 1), vec![0, 0]);
    }

    #[test]
    fn status_flag_is_stripped_from_payloads() {
        assert_eq!(
            gather_with_status(&SerialComm, true, vec![4.0, 5.0]),
            Ok(vec![vec![4.0, 5.0]])
        );
        assert_eq!(gather_with_status(&SerialComm, false, vec![4.0]), Err(0));
    }
}
