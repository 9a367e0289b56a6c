use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

use crate::database::FragmentIndex;
use crate::fragment::{Fragment, FragmentCandidate, FragmentId, FragmentKind};
use crate::isotopes::IsotopeCluster;
use crate::mass::{mz_to_mass, Tolerance, NEUTRON, PROTON};
use crate::spectrum::{Annotation, ClusterIx, MatchedAnnotation, PeakIx, Spectrum};

/// A fragment bound to a peak at a specific charge state
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct MatchedFragment {
    pub fragment: FragmentId,
    pub kind: FragmentKind,
    pub neutral_mass: f64,
    pub charge: u8,
    pub peak: PeakIx,
    /// If `Some(mz)`, the peak is the second isotope peak and the
    /// monoisotopic peak was expected at `mz`
    pub missing_mz: Option<f64>,
    pub cluster: Option<ClusterIx>,
}

impl MatchedFragment {
    pub fn matched_missing(&self) -> bool {
        self.missing_mz.is_some()
    }

    pub fn is_lossy(&self) -> bool {
        matches!(self.kind, FragmentKind::Loss { .. })
    }

    /// Theoretical m/z of the fragment at the matched charge
    pub fn mz(&self) -> f64 {
        crate::mass::mass_to_mz(self.neutral_mass, self.charge)
    }

    /// m/z the peak was expected at, under the hypothesis it was matched by
    pub fn experimental_mz(&self, spectrum: &Spectrum) -> Option<f64> {
        match self.missing_mz {
            Some(mz) => Some(mz),
            None => spectrum.get(self.peak).map(|peak| peak.mz),
        }
    }
}

/// At most one peak per (fragment, charge)
#[derive(Clone, Debug, Default)]
pub struct MatchedFragmentCollection {
    matches: FnvHashMap<(FragmentId, u8), MatchedFragment>,
}

impl MatchedFragmentCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning the one it replaced
    pub fn add(&mut self, record: MatchedFragment) -> Option<MatchedFragment> {
        self.matches.insert((record.fragment, record.charge), record)
    }

    pub fn get(&self, fragment: FragmentId, charge: u8) -> Option<&MatchedFragment> {
        self.matches.get(&(fragment, charge))
    }

    pub fn has_matched(&self, fragment: FragmentId, charge: u8) -> bool {
        self.matches.contains_key(&(fragment, charge))
    }

    /// Has `fragment` been matched at any charge state?
    pub fn has_matched_any(&self, fragment: FragmentId) -> bool {
        (1..=self.max_charge()).any(|z| self.has_matched(fragment, z))
    }

    /// Has the base of `fragment` (or `fragment` itself, if it is not a
    /// loss) been matched at any charge state?
    pub fn has_matched_non_lossy<F: Fragment>(&self, fragment: &F) -> bool {
        let base = fragment.base().unwrap_or_else(|| fragment.id());
        (1..=self.max_charge())
            .filter_map(|z| self.get(base, z))
            .any(|m| !m.is_lossy())
    }

    pub fn matched_peak(&self, fragment: FragmentId, charge: u8) -> Option<PeakIx> {
        self.get(fragment, charge).map(|m| m.peak)
    }

    pub fn remove(&mut self, fragment: FragmentId, charge: u8) -> Option<MatchedFragment> {
        self.matches.remove(&(fragment, charge))
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn clear(&mut self) {
        self.matches.clear();
    }

    /// Highest charge state of any record
    pub fn max_charge(&self) -> u8 {
        self.matches.values().map(|m| m.charge).max().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MatchedFragment> {
        self.matches.values()
    }

    /// All records, ordered by fragment and charge
    pub fn sorted(&self) -> Vec<&MatchedFragment> {
        let mut records = self.matches.values().collect::<Vec<_>>();
        records.sort_unstable_by_key(|m| (m.fragment, m.charge));
        records
    }

    /// Distinct matched fragments
    pub fn fragments(&self) -> Vec<FragmentId> {
        let mut ids = self.matches.keys().map(|(id, _)| *id).collect::<Vec<_>>();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn matched_lossy(&self) -> usize {
        self.iter().filter(|m| m.is_lossy()).count()
    }

    pub fn matched_non_lossy(&self) -> usize {
        self.iter().filter(|m| !m.is_lossy()).count()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchSettings {
    /// Try to explain unmatched peaks as the second isotope peak of a
    /// fragment whose monoisotopic peak was not observed
    pub match_missing_monoisotopic: bool,
    /// Only apply the missing monoisotopic hypothesis above this neutral mass
    pub missing_monoisotopic_min_mass: f64,
    /// Insert a virtual peak where a missing monoisotopic peak should be
    pub virtual_missing_peaks: bool,
    /// When a neutral loss matches a cluster, look for an isotope cluster of
    /// its unmatched base fragment at the same charge
    pub transfer_loss_to_base: bool,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            match_missing_monoisotopic: true,
            missing_monoisotopic_min_mass: 0.0,
            virtual_missing_peaks: false,
            transfer_loss_to_base: false,
        }
    }
}

/// Binds peaks and isotope clusters of a spectrum to fragments of an index
///
/// Clusters are processed before single peaks, clusters in descending and
/// single peaks in ascending m/z order. A direct match always supersedes an
/// earlier record of the same (fragment, charge): its annotation is removed
/// from the previously matched peak. Missing monoisotopic matches are only
/// tried if there was no direct match, and never replace an existing record.
pub struct Matcher<'db> {
    pub index: &'db FragmentIndex,
    pub tolerance: Tolerance,
    pub settings: MatchSettings,
}

impl<'db> Matcher<'db> {
    pub fn new(index: &'db FragmentIndex, tolerance: Tolerance, settings: MatchSettings) -> Self {
        Self {
            index,
            tolerance,
            settings,
        }
    }

    /// Fragments of the index within tolerance of `neutral`, an ion observed
    /// at `mz` with charge `charge`
    fn candidates(&self, mz: f64, charge: u8, neutral: f64) -> Vec<&'db FragmentCandidate> {
        let (lo, hi) = self
            .tolerance
            .bounds_with_reference(neutral, mz * charge as f64);
        self.index
            .range_query(lo, hi)
            .flat_map(|bucket| bucket.fragments.iter())
            .collect()
    }

    fn bind(
        &self,
        spectrum: &mut Spectrum,
        collection: &mut MatchedFragmentCollection,
        record: MatchedFragment,
    ) {
        spectrum[record.peak].annotate(Annotation::Matched(MatchedAnnotation {
            fragment: record.fragment,
            charge: record.charge,
            missing_mz: record.missing_mz,
            cluster: record.cluster,
        }));
        collection.add(record);
    }

    fn record(
        candidate: &FragmentCandidate,
        charge: u8,
        peak: PeakIx,
        missing_mz: Option<f64>,
        cluster: Option<ClusterIx>,
    ) -> MatchedFragment {
        MatchedFragment {
            fragment: candidate.id,
            kind: candidate.kind,
            neutral_mass: candidate.neutral_mass,
            charge,
            peak,
            missing_mz,
            cluster,
        }
    }

    /// Bind every fragment explaining `peak` at `charge`. Returns true if
    /// there was at least one.
    fn match_direct(
        &self,
        spectrum: &mut Spectrum,
        collection: &mut MatchedFragmentCollection,
        peak: PeakIx,
        mz: f64,
        charge: u8,
        cluster: Option<ClusterIx>,
    ) -> bool {
        let candidates = self.candidates(mz, charge, mz_to_mass(mz, charge));
        for candidate in &candidates {
            if let Some(previous) = collection.remove(candidate.id, charge) {
                if let Some(p) = spectrum.get_mut(previous.peak) {
                    p.remove_match(candidate.id, charge);
                }
            }
            if cluster.is_some() && self.settings.transfer_loss_to_base && candidate.is_lossy() {
                self.transfer_loss_to_base(spectrum, collection, candidate, charge);
            }
            let record = Self::record(candidate, charge, peak, None, cluster);
            self.bind(spectrum, collection, record);
        }
        !candidates.is_empty()
    }

    /// `loss` was matched through a cluster at `charge`. If its base fragment
    /// has no match at that charge, but an isotope peak sits at its m/z, grow
    /// a cluster from that peak until intensities rise again after falling,
    /// then bind the base fragment to it. Returns true if a base was bound.
    fn transfer_loss_to_base(
        &self,
        spectrum: &mut Spectrum,
        collection: &mut MatchedFragmentCollection,
        loss: &FragmentCandidate,
        charge: u8,
    ) -> bool {
        let base = match loss.base().and_then(|id| self.index.get(id)) {
            Some(base) if !collection.has_matched(base.id, charge) => base,
            _ => return false,
        };
        let mz = base.mz(charge);
        let seed = match spectrum.peak_at(mz, self.tolerance) {
            Some(ix) if spectrum[ix].is_isotope() => ix,
            _ => return false,
        };

        let diff = NEUTRON / charge as f64;
        let mut cluster = IsotopeCluster::new(seed, spectrum[seed].mz, charge);
        let mut previous = 0.0;
        let mut falling = false;
        let mut offset = 1.0;
        while let Some(ix) = spectrum.peak_at(mz + diff * offset, self.tolerance) {
            let last = cluster.peaks[cluster.peaks.len() - 1];
            if spectrum[ix].mz <= spectrum[last].mz {
                break;
            }
            let intensity = spectrum[ix].intensity;
            if previous * 0.95 > intensity {
                falling = true;
            } else if falling && previous < intensity * 0.95 {
                break;
            }
            cluster.push(ix);
            previous = intensity;
            offset += 1.0;
        }
        if cluster.len() < 2 {
            return false;
        }

        log::trace!(
            "{}: fragment {} recovered from loss {} at {:.4} (z={})",
            spectrum.id,
            base.id.0,
            loss.id.0,
            cluster.mz,
            charge
        );
        let cix = ClusterIx(spectrum.clusters.len() as u32);
        spectrum.clusters.push(cluster);
        let record = Self::record(base, charge, seed, None, Some(cix));
        self.bind(spectrum, collection, record);
        true
    }

    /// Bind fragments that explain `peak` as the second isotope peak. Only
    /// (fragment, charge) pairs without a record are bound.
    fn match_missing(
        &self,
        spectrum: &mut Spectrum,
        collection: &mut MatchedFragmentCollection,
        peak: PeakIx,
        mz: f64,
        charge: u8,
        cluster: Option<ClusterIx>,
    ) -> bool {
        if !self.settings.match_missing_monoisotopic {
            return false;
        }
        let neutral = mz_to_mass(mz, charge) - PROTON;
        if neutral < self.settings.missing_monoisotopic_min_mass {
            return false;
        }
        let missing_mz = mz - PROTON / charge as f64;

        let mut matched = false;
        for candidate in self.candidates(missing_mz, charge, neutral) {
            if collection.has_matched(candidate.id, charge) {
                continue;
            }
            let record = Self::record(candidate, charge, peak, Some(missing_mz), cluster);
            self.bind(spectrum, collection, record);
            matched = true;
        }

        if matched && self.settings.virtual_missing_peaks {
            spectrum.add_virtual_peak(missing_mz, charge);
        }
        matched
    }

    /// Returns the clusters that were not matched
    fn match_clusters(
        &self,
        spectrum: &mut Spectrum,
        collection: &mut MatchedFragmentCollection,
    ) -> Vec<ClusterIx> {
        let mut order = (0..spectrum.clusters.len() as u32)
            .map(ClusterIx)
            .collect::<Vec<_>>();
        order.sort_by(|a, b| {
            let a = &spectrum.clusters[a.0 as usize];
            let b = &spectrum.clusters[b.0 as usize];
            b.mz.total_cmp(&a.mz)
        });

        let mut unmatched = Vec::new();
        for cix in order {
            let cluster = &spectrum.clusters[cix.0 as usize];
            let (mono, mz, charge) = (cluster.monoisotopic, cluster.mz, cluster.charge);
            if charge == 0 {
                unmatched.push(cix);
                continue;
            }
            let matched = self.match_direct(spectrum, collection, mono, mz, charge, Some(cix))
                || self.match_missing(spectrum, collection, mono, mz, charge, Some(cix));
            if !matched {
                unmatched.push(cix);
            }
        }
        unmatched
    }

    /// Match peaks that are not part of any cluster, trying each charge
    /// state from the highest down. Returns the peaks that were not matched.
    fn match_peaks(
        &self,
        spectrum: &mut Spectrum,
        collection: &mut MatchedFragmentCollection,
        greedy: bool,
    ) -> Vec<PeakIx> {
        let max_charge = spectrum.charge_limit();
        let peaks = spectrum.unclustered().collect::<Vec<_>>();

        let mut unmatched = Vec::new();
        for ix in peaks {
            let mz = spectrum[ix].mz;
            let mut matched = None;
            for charge in (1..=max_charge).rev() {
                if self.match_direct(spectrum, collection, ix, mz, charge, None) {
                    matched = Some(charge);
                    if greedy {
                        break;
                    }
                }
            }
            if matched.is_none() {
                for charge in (1..=max_charge).rev() {
                    if self.match_missing(spectrum, collection, ix, mz, charge, None) {
                        matched = Some(charge);
                        if greedy {
                            break;
                        }
                    }
                }
            }

            match matched {
                Some(charge) if greedy => spectrum[ix].charge = charge,
                Some(_) => {}
                None => unmatched.push(ix),
            }
        }
        unmatched
    }

    /// Greedy matching: every peak is assigned the first, highest charge
    /// state that explains it. Returns the spectrum of everything that was
    /// left unexplained.
    pub fn match_greedy_into(
        &self,
        spectrum: &mut Spectrum,
        collection: &mut MatchedFragmentCollection,
    ) -> Spectrum {
        let clusters = self.match_clusters(spectrum, collection);
        let peaks = self.match_peaks(spectrum, collection, true);
        log::trace!(
            "{}: {} matches, {} clusters and {} peaks unexplained",
            spectrum.id,
            collection.len(),
            clusters.len(),
            peaks.len()
        );
        spectrum.residual(&peaks, &clusters)
    }

    pub fn match_greedy(&self, spectrum: &mut Spectrum) -> (MatchedFragmentCollection, Spectrum) {
        let mut collection = MatchedFragmentCollection::new();
        let residual = self.match_greedy_into(spectrum, &mut collection);
        (collection, residual)
    }

    /// Non-greedy matching: every charge state of every single peak is
    /// considered
    pub fn match_non_greedy_into(
        &self,
        spectrum: &mut Spectrum,
        collection: &mut MatchedFragmentCollection,
    ) {
        self.match_clusters(spectrum, collection);
        self.match_peaks(spectrum, collection, false);
        log::trace!("{}: {} matches", spectrum.id, collection.len());
    }

    pub fn match_non_greedy(&self, spectrum: &mut Spectrum) -> MatchedFragmentCollection {
        let mut collection = MatchedFragmentCollection::new();
        self.match_non_greedy_into(spectrum, &mut collection);
        collection
    }
}

pub fn match_greedy(
    spectrum: &mut Spectrum,
    index: &FragmentIndex,
    tolerance: Tolerance,
) -> (MatchedFragmentCollection, Spectrum) {
    Matcher::new(index, tolerance, MatchSettings::default()).match_greedy(spectrum)
}

pub fn match_non_greedy(
    spectrum: &mut Spectrum,
    index: &FragmentIndex,
    tolerance: Tolerance,
) -> MatchedFragmentCollection {
    Matcher::new(index, tolerance, MatchSettings::default()).match_non_greedy(spectrum)
}
