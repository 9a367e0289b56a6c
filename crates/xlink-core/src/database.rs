use std::cmp::Ordering;

use fnv::FnvHashMap;
use rayon::prelude::*;

use crate::fragment::{Fragment, FragmentCandidate, FragmentId};

/// All fragments sharing exactly the same neutral mass
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bucket<'db> {
    pub mass: f64,
    pub fragments: &'db [FragmentCandidate],
}

/// Theoretical fragments, sorted by neutral mass and grouped into buckets of
/// identical mass
///
/// Immutable after construction, and safe to share between threads
#[derive(Clone, Debug, Default)]
pub struct FragmentIndex {
    fragments: Vec<FragmentCandidate>,
    /// Distinct masses, in ascending order
    masses: Vec<f64>,
    /// `fragments[offsets[i]..offsets[i + 1]]` holds all fragments of `masses[i]`
    offsets: Vec<usize>,
    /// Position of each fragment id in `fragments`
    positions: FnvHashMap<FragmentId, usize>,
}

impl FragmentIndex {
    pub fn build<I, F>(candidates: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Fragment,
    {
        let mut fragments = candidates
            .into_iter()
            .map(|f| FragmentCandidate {
                id: f.id(),
                neutral_mass: f.neutral_mass(),
                kind: f.kind(),
            })
            .collect::<Vec<_>>();

        let total = fragments.len();
        fragments.retain(|f| f.neutral_mass.is_finite());
        if fragments.len() < total {
            log::warn!(
                "ignoring {} fragments without a finite mass",
                total - fragments.len()
            );
        }

        // Ties are broken by id so that iteration order is reproducible
        fragments.par_sort_unstable_by(|a, b| {
            a.neutral_mass
                .total_cmp(&b.neutral_mass)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut masses = Vec::new();
        let mut offsets = Vec::new();
        for (idx, fragment) in fragments.iter().enumerate() {
            match masses.last() {
                Some(mass) if fragment.neutral_mass.total_cmp(mass) == Ordering::Equal => {}
                _ => {
                    masses.push(fragment.neutral_mass);
                    offsets.push(idx);
                }
            }
        }
        offsets.push(fragments.len());

        let mut positions = FnvHashMap::default();
        for (idx, fragment) in fragments.iter().enumerate() {
            if positions.insert(fragment.id, idx).is_some() {
                log::warn!("duplicate fragment id {}", fragment.id.0);
            }
        }

        log::trace!(
            "indexed {} fragments in {} buckets",
            fragments.len(),
            masses.len()
        );

        FragmentIndex {
            fragments,
            masses,
            offsets,
            positions,
        }
    }

    /// Number of fragments in the index
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Number of distinct masses
    pub fn buckets(&self) -> usize {
        self.masses.len()
    }

    pub fn fragments(&self) -> &[FragmentCandidate] {
        &self.fragments
    }

    /// Look up a fragment by id. If an id was used more than once, the
    /// heaviest of them is returned.
    pub fn get(&self, id: FragmentId) -> Option<&FragmentCandidate> {
        self.positions.get(&id).map(|&idx| &self.fragments[idx])
    }

    fn bucket(&self, idx: usize) -> Bucket<'_> {
        Bucket {
            mass: self.masses[idx],
            fragments: &self.fragments[self.offsets[idx]..self.offsets[idx + 1]],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Bucket<'_>> {
        (0..self.masses.len()).map(move |idx| self.bucket(idx))
    }

    /// Every bucket with `lo <= mass <= hi`, in ascending mass order
    pub fn range_query(&self, lo: f64, hi: f64) -> impl Iterator<Item = Bucket<'_>> {
        let (left, right) = binary_search_slice(&self.masses, |m, q| m.total_cmp(q), lo, hi);
        // `binary_search_slice` returns the widest covering range, the first
        // and last entries may be just outside of it
        (left..right)
            .filter(move |&idx| self.masses[idx] >= lo && self.masses[idx] <= hi)
            .map(move |idx| self.bucket(idx))
    }
}

pub fn build_fragment_index<I, F>(candidates: I) -> FragmentIndex
where
    I: IntoIterator<Item = F>,
    F: Fragment,
{
    FragmentIndex::build(candidates)
}

/// Indices `(left, right)` into `slice`, sorted by `key`, such that every
/// element between `low` and `high` lies in `slice[left..right]`. The range
/// may include one element below `low`, callers filter the ends.
#[inline]
pub fn binary_search_slice<T, F, S>(slice: &[T], key: F, low: S, high: S) -> (usize, usize)
where
    F: Fn(&T, &S) -> Ordering,
{
    let left_idx = match slice.binary_search_by(|a| key(a, &low)) {
        Ok(idx) | Err(idx) => {
            let mut idx = idx.saturating_sub(1);
            while idx > 0 && key(&slice[idx], &low) != Ordering::Less {
                idx -= 1;
            }
            idx
        }
    };

    let right_idx = match slice[left_idx..].binary_search_by(|a| key(a, &high)) {
        Ok(idx) | Err(idx) => {
            let mut idx = idx + left_idx;
            while idx < slice.len() && key(&slice[idx], &high) != Ordering::Greater {
                idx = idx.saturating_add(1);
            }
            idx.min(slice.len())
        }
    };
    (left_idx, right_idx)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn range_query_over_repeated_masses() {
        // Many fragments at the edges of the window, and right outside of it
        let masses = [99.0, 100.0, 100.0, 100.0, 150.0, 200.0, 200.0, 200.5];
        let index = FragmentIndex::build(
            masses
                .iter()
                .enumerate()
                .map(|(id, &m)| FragmentCandidate::new(id as u32, m)),
        );
        assert_eq!(index.buckets(), 5);

        let hits = index
            .range_query(100.0, 200.0)
            .flat_map(|b| b.fragments.iter().map(|f| f.id.0))
            .collect::<Vec<_>>();
        assert_eq!(hits, vec![1, 2, 3, 4, 5, 6]);

        let hits = index.range_query(99.5, 149.0).collect::<Vec<_>>();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fragments.len(), 3);

        // Window entirely below or above the index
        assert_eq!(index.range_query(0.0, 98.0).count(), 0);
        assert_eq!(index.range_query(201.0, 300.0).count(), 0);
    }

    #[test]
    fn lookup_by_id() {
        let index = FragmentIndex::build(vec![
            FragmentCandidate::new(7, 250.0),
            FragmentCandidate::new(3, 100.0),
        ]);
        assert_eq!(index.get(FragmentId(7)).map(|f| f.neutral_mass), Some(250.0));
        assert_eq!(index.get(FragmentId(3)).map(|f| f.neutral_mass), Some(100.0));
        assert!(index.get(FragmentId(4)).is_none());
    }

    #[test]
    fn buckets_group_equal_masses() {
        let index = FragmentIndex::build(vec![
            FragmentCandidate::new(4, 250.0),
            FragmentCandidate::new(3, 100.0),
            FragmentCandidate::new(1, 100.0),
            FragmentCandidate::new(2, f64::NAN),
            FragmentCandidate::new(5, 175.5),
        ]);
        assert_eq!(index.len(), 4);
        assert_eq!(index.buckets(), 3);

        let buckets = index.iter().collect::<Vec<_>>();
        assert_eq!(buckets[0].mass, 100.0);
        assert_eq!(
            buckets[0].fragments.iter().map(|f| f.id).collect::<Vec<_>>(),
            vec![FragmentId(1), FragmentId(3)]
        );
        assert_eq!(buckets[2].fragments[0].id, FragmentId(4));
    }

    #[test]
    fn range_query() {
        let index = FragmentIndex::build(vec![
            FragmentCandidate::new(0, 100.0),
            FragmentCandidate::new(1, 100.00005),
            FragmentCandidate::new(2, 250.0),
        ]);

        let hits = index
            .range_query(99.9999, 100.0001)
            .flat_map(|b| b.fragments.iter().map(|f| f.id))
            .collect::<Vec<_>>();
        assert_eq!(hits, vec![FragmentId(0), FragmentId(1)]);

        // Bounds are inclusive
        assert_eq!(index.range_query(250.0, 250.0).count(), 1);
        assert_eq!(index.range_query(100.0001, 249.9999).count(), 0);
        assert_eq!(index.range_query(300.0, 200.0).count(), 0);
        assert_eq!(FragmentIndex::default().range_query(0.0, 1e9).count(), 0);
    }
}
