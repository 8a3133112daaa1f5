use fnv::FnvHashMap as HashMap;
use rand::seq::SliceRandom;
use rand::Rng;
use std::hash::Hash;

/// partition membership vector into groups of indexes
/// # Arguments
/// * `membership` - a vector of membership (E.g., cluster assignment)
/// # Returns
/// A hashmap: cluster/group name -> indexes of the elements
pub fn partition_by_membership<T>(membership: &[T]) -> HashMap<T, Vec<usize>>
where
    T: Eq + Hash + Clone,
{
    let mut pb_elems: HashMap<T, Vec<usize>> = HashMap::default();
    for (cell, k) in membership.iter().enumerate() {
        pb_elems.entry(k.clone()).or_default().push(cell);
    }
    pb_elems
}

/// Randomly split `0..ntot` into `nfold` groups of (almost) equal size
///
/// The indexes are shuffled with `rng` and dealt out in turn, so that
/// fold sizes differ by at most one. Folds are returned with sorted
/// members; a fold is empty only if `nfold > ntot`.
pub fn random_folds<R: Rng + ?Sized>(ntot: usize, nfold: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let nfold = nfold.max(1);
    let mut indexes: Vec<usize> = (0..ntot).collect();
    indexes.shuffle(rng);

    let mut folds = vec![Vec::with_capacity(ntot.div_ceil(nfold)); nfold];
    for (r, i) in indexes.into_iter().enumerate() {
        folds[r % nfold].push(i);
    }
    for fold in folds.iter_mut() {
        fold.sort_unstable();
    }
    folds
}

/// Generate minibatch intervals
/// * `ntot` - number of total samples
/// * `batch_size` - the size of each batch
pub fn generate_minibatch_intervals(ntot: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let batch_size = batch_size.max(1);
    let num_batches = ntot.div_ceil(batch_size);
    (0..num_batches)
        .map(|b| {
            let lb: usize = b * batch_size;
            let ub: usize = ((b + 1) * batch_size).min(ntot);
            (lb, ub)
        })
        .collect::<Vec<_>>()
}
