/// Precision@k for a batch of row-major class scores.
///
/// `scores` holds `targets.len()` rows of `num_classes` entries each. For every `k` in
/// `topk`, returns the percentage of rows whose target is among the `k` highest scores.
/// Equal scores rank the lower class index first.
pub fn accuracy(scores: &[f32], num_classes: usize, targets: &[i64], topk: &[usize]) -> Vec<f64> {
    let batch = targets.len();
    if batch == 0 || num_classes == 0 {
        return vec![0.0; topk.len()];
    }
    debug_assert_eq!(scores.len(), batch * num_classes);

    let maxk = topk.iter().copied().max().unwrap_or(0).min(num_classes);
    let mut correct = vec![0usize; topk.len()];
    let mut order: Vec<usize> = Vec::with_capacity(num_classes);

    for (row, &target) in scores.chunks_exact(num_classes).zip(targets) {
        order.clear();
        order.extend(0..num_classes);
        order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));

        let rank = order[..maxk]
            .iter()
            .position(|&class| class as i64 == target);

        if let Some(rank) = rank {
            for (slot, &k) in correct.iter_mut().zip(topk) {
                if rank < k.min(num_classes) {
                    *slot += 1;
                }
            }
        }
    }

    correct
        .into_iter()
        .map(|hits| hits as f64 * 100.0 / batch as f64)
        .collect()
}
