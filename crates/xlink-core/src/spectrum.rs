use serde::{Deserialize, Serialize};

use crate::database::binary_search_slice;
use crate::fragment::FragmentId;
use crate::isotopes::IsotopeCluster;
use crate::mass::Tolerance;
use crate::Error;

/// If the precursor charge state is not known, consider fragments up to z=3
pub const UNKNOWN_PRECURSOR_CHARGE: u8 = 3;

/// Index of a peak in the peak arena of a [`Spectrum`]
#[derive(Hash, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PeakIx(pub u32);

/// Index of an isotope cluster in [`Spectrum::clusters`]
#[derive(Hash, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ClusterIx(pub u32);

/// A theoretical fragment explaining a peak
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct MatchedAnnotation {
    pub fragment: FragmentId,
    pub charge: u8,
    /// If `Some(mz)`, the peak was matched as the second isotope peak and
    /// the monoisotopic peak would have been at `mz`
    pub missing_mz: Option<f64>,
    /// Cluster through which the peak was matched, if any
    pub cluster: Option<ClusterIx>,
}

impl MatchedAnnotation {
    pub fn matched_missing(&self) -> bool {
        self.missing_mz.is_some()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub enum Annotation {
    /// Member of an isotope cluster
    Isotope,
    /// Monoisotopic peak of an isotope cluster
    Monoisotopic,
    /// Peak was not observed, but inserted during processing
    Virtual,
    /// No fragment explains this peak
    Unmatched,
    Matched(MatchedAnnotation),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Peak {
    pub mz: f64,
    pub intensity: f64,
    /// Assigned charge, 0 if unknown
    pub charge: u8,
    annotations: Vec<Annotation>,
}

impl Peak {
    pub fn new(mz: f64, intensity: f64) -> Self {
        Self {
            mz,
            intensity,
            charge: 0,
            annotations: Vec::new(),
        }
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Attach an annotation. Flags are only stored once, a fragment can be
    /// matched to the same peak under several hypotheses.
    pub fn annotate(&mut self, annotation: Annotation) {
        if !self.annotations.contains(&annotation) {
            self.annotations.push(annotation);
        }
    }

    pub fn has(&self, annotation: Annotation) -> bool {
        self.annotations.contains(&annotation)
    }

    pub fn remove(&mut self, annotation: Annotation) {
        self.annotations.retain(|a| *a != annotation);
    }

    pub fn is_isotope(&self) -> bool {
        self.has(Annotation::Isotope)
    }

    pub fn is_monoisotopic(&self) -> bool {
        self.has(Annotation::Monoisotopic)
    }

    pub fn is_virtual(&self) -> bool {
        self.has(Annotation::Virtual)
    }

    pub fn matches(&self) -> impl Iterator<Item = &MatchedAnnotation> {
        self.annotations.iter().filter_map(|a| match a {
            Annotation::Matched(m) => Some(m),
            _ => None,
        })
    }

    pub fn is_matched(&self) -> bool {
        self.matches().next().is_some()
    }

    /// Remove every match of `fragment` at `charge` from this peak, returning
    /// the number of removed annotations
    pub fn remove_match(&mut self, fragment: FragmentId, charge: u8) -> usize {
        let before = self.annotations.len();
        self.annotations.retain(|a| match a {
            Annotation::Matched(m) => !(m.fragment == fragment && m.charge == charge),
            _ => true,
        });
        before - self.annotations.len()
    }

    pub fn clear_matches(&mut self) {
        self.annotations
            .retain(|a| !matches!(a, Annotation::Matched(_) | Annotation::Unmatched));
    }
}

/// Centroided MS2 scan, as handed over by spectrum loading
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct RawSpectrum {
    pub id: String,
    pub precursor_mz: f64,
    /// Precursor charge, 0 if unknown
    #[serde(default)]
    pub precursor_charge: u8,
    pub mz: Vec<f64>,
    pub intensity: Vec<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Spectrum {
    pub id: String,
    pub precursor_mz: f64,
    /// Precursor charge, 0 if unknown
    pub precursor_charge: u8,
    pub tolerance: Tolerance,
    /// Peak arena. Only ever appended to, so [`PeakIx`] stay valid
    peaks: Vec<Peak>,
    /// Visible peaks, sorted by m/z in ascending order
    order: Vec<PeakIx>,
    pub clusters: Vec<IsotopeCluster>,
}

impl Spectrum {
    pub fn new(
        id: String,
        precursor_mz: f64,
        precursor_charge: u8,
        tolerance: Tolerance,
        mut peaks: Vec<Peak>,
    ) -> Self {
        peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));
        let order = (0..peaks.len() as u32).map(PeakIx).collect();
        Self {
            id,
            precursor_mz,
            precursor_charge,
            tolerance,
            peaks,
            order,
            clusters: Vec::new(),
        }
    }

    /// Validate a [`RawSpectrum`] and turn it into a [`Spectrum`]
    pub fn try_from_raw(raw: RawSpectrum, tolerance: Tolerance) -> Result<Self, Error> {
        let malformed = |reason: String| Error::MalformedSpectrum {
            id: raw.id.clone(),
            reason,
        };

        if raw.mz.len() != raw.intensity.len() {
            return Err(malformed(format!(
                "{} m/z values, but {} intensities",
                raw.mz.len(),
                raw.intensity.len()
            )));
        }
        if let Some(mz) = raw.mz.iter().find(|mz| !mz.is_finite() || **mz <= 0.0) {
            return Err(malformed(format!("invalid m/z value {}", mz)));
        }
        if let Some(int) = raw.intensity.iter().find(|int| !int.is_finite()) {
            return Err(malformed(format!("invalid intensity {}", int)));
        }
        if raw.mz.len() > u32::MAX as usize {
            return Err(malformed("too many peaks".into()));
        }

        let peaks = raw
            .mz
            .iter()
            .zip(raw.intensity.iter())
            .map(|(&mz, &intensity)| Peak::new(mz, intensity))
            .collect();

        Ok(Spectrum::new(
            raw.id,
            raw.precursor_mz,
            raw.precursor_charge,
            tolerance,
            peaks,
        ))
    }

    /// Number of visible peaks
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Highest fragment charge state worth considering for this spectrum
    pub fn charge_limit(&self) -> u8 {
        match self.precursor_charge {
            0 => UNKNOWN_PRECURSOR_CHARGE,
            z => z,
        }
    }

    pub fn get(&self, ix: PeakIx) -> Option<&Peak> {
        self.peaks.get(ix.0 as usize)
    }

    pub fn get_mut(&mut self, ix: PeakIx) -> Option<&mut Peak> {
        self.peaks.get_mut(ix.0 as usize)
    }

    /// Visible peaks, sorted by m/z
    pub fn indices(&self) -> &[PeakIx] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeakIx, &Peak)> {
        self.order.iter().map(move |&ix| (ix, &self[ix]))
    }

    /// Peaks that are not part of any isotope cluster
    pub fn unclustered(&self) -> impl Iterator<Item = PeakIx> + '_ {
        self.iter()
            .filter(|(_, peak)| {
                !(peak.is_isotope() || peak.is_monoisotopic() || peak.is_virtual())
            })
            .map(|(ix, _)| ix)
    }

    pub fn cluster(&self, ix: ClusterIx) -> Option<&IsotopeCluster> {
        self.clusters.get(ix.0 as usize)
    }

    pub fn total_intensity(&self) -> f64 {
        self.iter().map(|(_, peak)| peak.intensity).sum()
    }

    /// All visible peaks with `lo <= mz <= hi`, in ascending m/z order
    pub fn range(&self, lo: f64, hi: f64) -> impl Iterator<Item = PeakIx> + '_ {
        let (i, j) = binary_search_slice(
            &self.order,
            |ix, query| self[*ix].mz.total_cmp(query),
            lo,
            hi,
        );
        self.order[i..j]
            .iter()
            .copied()
            .filter(move |&ix| self[ix].mz >= lo && self[ix].mz <= hi)
    }

    fn closest(&self, lo: f64, hi: f64, target: f64) -> Option<PeakIx> {
        let mut best = None;
        let mut min_eps = f64::MAX;
        for ix in self.range(lo, hi) {
            let eps = (self[ix].mz - target).abs();
            if eps < min_eps {
                min_eps = eps;
                best = Some(ix);
            }
        }
        best
    }

    /// Closest peak to `mz` within `tolerance`
    pub fn peak_at(&self, mz: f64, tolerance: Tolerance) -> Option<PeakIx> {
        let (lo, hi) = tolerance.bounds(mz);
        self.closest(lo, hi, mz)
    }

    /// Closest peak to `peak.mz + delta`. Both the position of `peak` and the
    /// target carry an error, so the window is widened twice.
    pub fn peak_at_distance(
        &self,
        peak: PeakIx,
        delta: f64,
        tolerance: Tolerance,
    ) -> Option<PeakIx> {
        let mz = self.get(peak)?.mz;
        let lo = tolerance.min_range(tolerance.min_range(mz) + delta);
        let hi = tolerance.max_range(tolerance.max_range(mz) + delta);
        self.closest(lo, hi, lo + (hi - lo) / 2.0)
    }

    /// Insert a new peak, keeping m/z order
    pub fn add_peak(&mut self, peak: Peak) -> PeakIx {
        let ix = PeakIx(self.peaks.len() as u32);
        let mz = peak.mz;
        self.peaks.push(peak);
        let pos = self.order.partition_point(|&other| self[other].mz <= mz);
        self.order.insert(pos, ix);
        ix
    }

    /// Insert a zero-intensity peak standing in for an unobserved ion. An
    /// existing virtual peak within tolerance is reused.
    pub fn add_virtual_peak(&mut self, mz: f64, charge: u8) -> PeakIx {
        let (lo, hi) = self.tolerance.bounds(mz);
        if let Some(existing) = self
            .range(lo, hi)
            .find(|&ix| self[ix].is_virtual() && self[ix].charge == charge)
        {
            return existing;
        }
        let mut peak = Peak::new(mz, 0.0);
        peak.charge = charge;
        peak.annotate(Annotation::Virtual);
        self.add_peak(peak)
    }

    /// Tag all visible peaks that carry no fragment match
    pub fn annotate_unmatched(&mut self) -> usize {
        let unmatched = self
            .iter()
            .filter(|(_, peak)| !peak.is_matched() && !peak.is_virtual())
            .map(|(ix, _)| ix)
            .collect::<Vec<_>>();
        for &ix in &unmatched {
            self[ix].annotate(Annotation::Unmatched);
        }
        unmatched.len()
    }

    /// A copy of this spectrum that only exposes `peaks`, the listed
    /// `clusters` and their member peaks. The peak arena is shared in layout,
    /// so [`PeakIx`] values taken from `self` remain valid. Clusters are
    /// renumbered, and matches through a cluster that was left out no longer
    /// refer to any cluster.
    pub fn residual(&self, peaks: &[PeakIx], clusters: &[ClusterIx]) -> Spectrum {
        let mut visible = vec![false; self.peaks.len()];
        let mut renumbered = vec![None; self.clusters.len()];
        let clusters = clusters
            .iter()
            .filter_map(|&cix| Some((cix, self.cluster(cix)?)))
            .enumerate()
            .map(|(new, (old, cluster))| {
                renumbered[old.0 as usize] = Some(ClusterIx(new as u32));
                cluster.clone()
            })
            .collect::<Vec<_>>();

        let mut arena = self.peaks.clone();
        for peak in &mut arena {
            for annotation in &mut peak.annotations {
                if let Annotation::Matched(m) = annotation {
                    m.cluster = m
                        .cluster
                        .and_then(|cix| renumbered.get(cix.0 as usize).copied().flatten());
                }
            }
        }

        for ix in peaks
            .iter()
            .chain(clusters.iter().flat_map(|c| c.peaks.iter()))
        {
            if let Some(v) = visible.get_mut(ix.0 as usize) {
                *v = true;
            }
        }

        let order = self
            .order
            .iter()
            .copied()
            .filter(|ix| visible[ix.0 as usize])
            .collect();

        Spectrum {
            id: self.id.clone(),
            precursor_mz: self.precursor_mz,
            precursor_charge: self.precursor_charge,
            tolerance: self.tolerance,
            peaks: arena,
            order,
            clusters,
        }
    }
}

impl std::ops::Index<PeakIx> for Spectrum {
    type Output = Peak;

    fn index(&self, index: PeakIx) -> &Self::Output {
        &self.peaks[index.0 as usize]
    }
}

impl std::ops::IndexMut<PeakIx> for Spectrum {
    fn index_mut(&mut self, index: PeakIx) -> &mut Self::Output {
        &mut self.peaks[index.0 as usize]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn spectrum(mz: &[f64]) -> Spectrum {
        let peaks = mz.iter().map(|&mz| Peak::new(mz, 100.0)).collect();
        Spectrum::new("test".into(), 600.0, 2, Tolerance::Ppm(10.0), peaks)
    }

    #[test]
    fn sorted_on_construction() {
        let s = spectrum(&[300.0, 100.0, 200.0]);
        let mzs = s.iter().map(|(_, p)| p.mz).collect::<Vec<_>>();
        assert_eq!(mzs, vec![100.0, 200.0, 300.0]);
        assert_eq!(s.len(), 3);
        assert_eq!(s.charge_limit(), 2);
    }

    #[test]
    fn malformed_spectra() {
        let raw = RawSpectrum {
            id: "scan=1".into(),
            precursor_mz: 500.0,
            precursor_charge: 2,
            mz: vec![100.0, 200.0],
            intensity: vec![1.0],
        };
        let err = Spectrum::try_from_raw(raw.clone(), Tolerance::Da(0.02)).unwrap_err();
        assert!(matches!(err, Error::MalformedSpectrum { ref id, .. } if id == "scan=1"));

        let nan = RawSpectrum {
            mz: vec![100.0, f64::NAN],
            intensity: vec![1.0, 1.0],
            ..raw.clone()
        };
        assert!(Spectrum::try_from_raw(nan, Tolerance::Da(0.02)).is_err());

        let ok = RawSpectrum {
            intensity: vec![1.0, 0.0],
            ..raw
        };
        let s = Spectrum::try_from_raw(ok, Tolerance::Da(0.02)).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.precursor_charge, 2);
    }

    #[test]
    fn nearest_peak() {
        let s = spectrum(&[100.0, 100.0005, 100.002, 250.0]);
        // 10 ppm of 100 = 0.001
        assert_eq!(s.peak_at(100.0004, s.tolerance), Some(PeakIx(1)));
        assert_eq!(s.peak_at(100.0001, s.tolerance), Some(PeakIx(0)));
        assert_eq!(s.peak_at(100.0015, s.tolerance), Some(PeakIx(2)));
        assert_eq!(s.peak_at(150.0, s.tolerance), None);

        let range = s.range(100.0001, 100.01).collect::<Vec<_>>();
        assert_eq!(range, vec![PeakIx(1), PeakIx(2)]);
        assert_eq!(s.range(0.0, 1000.0).count(), 4);
        assert_eq!(s.range(300.0, 1000.0).count(), 0);
    }

    #[test]
    fn peak_at_distance() {
        let s = spectrum(&[500.0, 500.502, 501.003, 502.0]);
        let diff = crate::mass::NEUTRON / 2.0;
        assert_eq!(
            s.peak_at_distance(PeakIx(0), diff, s.tolerance),
            Some(PeakIx(1))
        );
        assert_eq!(
            s.peak_at_distance(PeakIx(0), 2.0 * diff, s.tolerance),
            Some(PeakIx(2))
        );
        assert_eq!(s.peak_at_distance(PeakIx(0), 3.0 * diff, s.tolerance), None);
        assert_eq!(
            s.peak_at_distance(PeakIx(2), -2.0 * diff, s.tolerance),
            Some(PeakIx(0))
        );
        assert_eq!(s.peak_at_distance(PeakIx(9), diff, s.tolerance), None);
    }

    #[test]
    fn added_peaks_keep_indices() {
        let mut s = spectrum(&[100.0, 300.0]);
        let ix = s.add_peak(Peak::new(200.0, 5.0));
        assert_eq!(ix, PeakIx(2));
        assert_eq!(s.indices(), &[PeakIx(0), PeakIx(2), PeakIx(1)]);
        assert_eq!(s[PeakIx(1)].mz, 300.0);

        let v = s.add_virtual_peak(150.0, 2);
        assert!(s[v].is_virtual());
        assert_eq!(s[v].intensity, 0.0);
        assert_eq!(s.add_virtual_peak(150.0001, 2), v);
        assert_eq!(s.len(), 4);
        // virtual peaks are never treated as unclustered signal
        assert_eq!(s.unclustered().count(), 3);
    }

    #[test]
    fn annotations() {
        let mut peak = Peak::new(100.0, 1.0);
        peak.annotate(Annotation::Isotope);
        peak.annotate(Annotation::Isotope);
        assert_eq!(peak.annotations().len(), 1);

        let m = MatchedAnnotation {
            fragment: FragmentId(7),
            charge: 2,
            missing_mz: None,
            cluster: None,
        };
        peak.annotate(Annotation::Matched(m));
        peak.annotate(Annotation::Matched(MatchedAnnotation {
            fragment: FragmentId(8),
            ..m
        }));
        assert_eq!(peak.matches().count(), 2);
        assert_eq!(peak.remove_match(FragmentId(7), 2), 1);
        assert_eq!(peak.remove_match(FragmentId(7), 2), 0);
        assert!(peak.is_matched());
        peak.clear_matches();
        assert!(!peak.is_matched());
        assert!(peak.is_isotope());
    }

    #[test]
    fn residual_exposes_subset() {
        let mut s = spectrum(&[100.0, 200.0, 300.0, 400.0]);
        s[PeakIx(0)].annotate(Annotation::Unmatched);
        let r = s.residual(&[PeakIx(3), PeakIx(1)], &[]);
        assert_eq!(r.indices(), &[PeakIx(1), PeakIx(3)]);
        assert_eq!(r[PeakIx(3)].mz, 400.0);
        assert!(r.clusters.is_empty());
        assert_eq!(r.total_intensity(), 200.0);

        assert_eq!(s.annotate_unmatched(), 4);
        assert!(s[PeakIx(2)].has(Annotation::Unmatched));
    }

    #[test]
    fn residual_renumbers_clusters() {
        let mut s = spectrum(&[100.0, 100.5, 200.0, 200.5]);
        for (mono, mz) in [(PeakIx(0), 100.0), (PeakIx(2), 200.0)] {
            let mut cluster = IsotopeCluster::new(mono, mz, 2);
            cluster.peaks.push(PeakIx(mono.0 + 1));
            s.clusters.push(cluster);
        }
        let matched = |fragment, cluster| {
            Annotation::Matched(MatchedAnnotation {
                fragment: FragmentId(fragment),
                charge: 2,
                missing_mz: None,
                cluster: Some(ClusterIx(cluster)),
            })
        };
        s[PeakIx(0)].annotate(matched(1, 0));
        s[PeakIx(2)].annotate(matched(2, 1));

        let r = s.residual(&[], &[ClusterIx(1)]);
        assert_eq!(r.clusters.len(), 1);
        assert_eq!(r.clusters[0].mz, 200.0);
        assert_eq!(r.indices(), &[PeakIx(2), PeakIx(3)]);
        let cluster_of = |ix: PeakIx| r[ix].matches().next().and_then(|m| m.cluster);
        assert_eq!(cluster_of(PeakIx(2)), Some(ClusterIx(0)));
        assert_eq!(cluster_of(PeakIx(0)), None);
        assert_eq!(r.cluster(ClusterIx(0)), Some(&r.clusters[0]));

        // The original spectrum is left alone
        let original = s[PeakIx(2)].matches().next().and_then(|m| m.cluster);
        assert_eq!(original, Some(ClusterIx(1)));
    }
}
