use serde::{Deserialize, Serialize};

use crate::mass::{mz_to_mass, Tolerance, NEUTRON};
use crate::spectrum::{Annotation, PeakIx, Spectrum};

/// A run of peaks spaced by `NEUTRON / charge`, starting at the
/// monoisotopic peak
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IsotopeCluster {
    /// Member peaks, in ascending m/z order
    pub peaks: Vec<PeakIx>,
    pub monoisotopic: PeakIx,
    /// m/z of the monoisotopic peak
    pub mz: f64,
    pub charge: u8,
    /// Cluster was grown towards lower m/z, past the peak that seeded it
    pub extended: bool,
    /// Averagine error, lower is better
    pub score: Option<f64>,
}

impl IsotopeCluster {
    pub fn new(monoisotopic: PeakIx, mz: f64, charge: u8) -> Self {
        Self {
            peaks: vec![monoisotopic],
            monoisotopic,
            mz,
            charge,
            extended: false,
            score: None,
        }
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn contains(&self, peak: PeakIx) -> bool {
        self.peaks.contains(&peak)
    }

    pub fn neutral_mass(&self) -> f64 {
        mz_to_mass(self.mz, self.charge)
    }

    pub fn summed_intensity(&self, spectrum: &Spectrum) -> f64 {
        self.peaks
            .iter()
            .filter_map(|&ix| spectrum.get(ix))
            .map(|peak| peak.intensity)
            .sum()
    }

    pub(crate) fn push(&mut self, peak: PeakIx) {
        self.peaks.push(peak);
    }

    /// Add a peak below the current monoisotopic peak, which becomes the new
    /// monoisotopic peak
    fn prepend(&mut self, peak: PeakIx, mz: f64) {
        self.peaks.insert(0, peak);
        self.monoisotopic = peak;
        self.mz = mz;
    }

    /// Move `peaks[at..]` into a new cluster of the same charge
    pub(crate) fn split_off(&mut self, at: usize, mz: f64) -> Option<IsotopeCluster> {
        if at == 0 || at >= self.peaks.len() {
            return None;
        }
        let peaks = self.peaks.split_off(at);
        Some(IsotopeCluster {
            monoisotopic: peaks[0],
            peaks,
            mz,
            charge: self.charge,
            extended: false,
            score: None,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IsotopeDetector {
    /// Highest charge state to consider, further capped by the precursor charge
    pub max_charge: u8,
    /// The first isotope peak must be less than this many times weaker than
    /// the monoisotopic peak
    pub max_mono_to_first_ratio: f64,
}

impl Default for IsotopeDetector {
    fn default() -> Self {
        Self {
            max_charge: 8,
            max_mono_to_first_ratio: 8.0,
        }
    }
}

impl IsotopeDetector {
    fn charge_limit(&self, spectrum: &Spectrum) -> u8 {
        match spectrum.precursor_charge {
            0 => self.max_charge,
            z => self.max_charge.min(z),
        }
    }

    fn accept_first(&self, mono: f64, first: f64) -> bool {
        mono > 0.0 && first > 0.0 && first / mono < self.max_mono_to_first_ratio
    }

    /// Find isotope clusters and annotate their peaks. Clusters are returned,
    /// not stored in the spectrum.
    pub fn detect(&self, spectrum: &mut Spectrum, tolerance: Tolerance) -> Vec<IsotopeCluster> {
        let max_charge = self.charge_limit(spectrum);
        let order = spectrum.indices().to_vec();
        let mut clusters = Vec::new();

        for pair in order.windows(2) {
            let (ix, next) = (pair[0], pair[1]);
            if spectrum[ix].is_isotope() || spectrum[ix].is_virtual() {
                continue;
            }
            // No other peak close enough to start any cluster
            if tolerance.min_diff(spectrum[ix].mz, spectrum[next].mz) > 1.0 {
                continue;
            }

            for charge in 1..=max_charge {
                let diff = NEUTRON / charge as f64;
                let first = match spectrum.peak_at_distance(ix, diff, tolerance) {
                    Some(first) => first,
                    None => continue,
                };
                if !self.accept_first(spectrum[ix].intensity, spectrum[first].intensity) {
                    continue;
                }

                let mut cluster = IsotopeCluster::new(ix, spectrum[ix].mz, charge);
                let mut walk = Some(first);
                let mut offset = 1.0;
                while let Some(peak) = walk {
                    let last = cluster.peaks[cluster.peaks.len() - 1];
                    if spectrum[peak].mz <= spectrum[last].mz || spectrum[peak].intensity <= 0.0 {
                        break;
                    }
                    cluster.push(peak);
                    spectrum[peak].annotate(Annotation::Isotope);
                    spectrum[peak].charge = charge;

                    offset += 1.0;
                    walk = spectrum.peak_at_distance(ix, diff * offset, tolerance);
                }

                let mono = &mut spectrum[ix];
                mono.annotate(Annotation::Isotope);
                mono.annotate(Annotation::Monoisotopic);
                mono.charge = charge;

                log::trace!(
                    "{}: {} peak cluster at {:.4} (z={})",
                    spectrum.id,
                    cluster.len(),
                    cluster.mz,
                    charge
                );

                if let Some(extended) = self.extend(spectrum, &cluster, diff, tolerance) {
                    clusters.push(cluster);
                    clusters.push(extended);
                } else {
                    clusters.push(cluster);
                }
            }
        }

        clusters
    }

    /// Look for isotope peaks below the monoisotopic peak of `cluster`. If
    /// any are found, a copy of the cluster starting at the lowest of them is
    /// returned.
    fn extend(
        &self,
        spectrum: &mut Spectrum,
        cluster: &IsotopeCluster,
        diff: f64,
        tolerance: Tolerance,
    ) -> Option<IsotopeCluster> {
        let seed = cluster.monoisotopic;
        let mut extended = cluster.clone();
        let mut offset = 1.0;
        while let Some(peak) = spectrum.peak_at_distance(seed, -diff * offset, tolerance) {
            if spectrum[peak].mz >= extended.mz || spectrum[peak].intensity <= 0.0 {
                break;
            }
            extended.prepend(peak, spectrum[peak].mz);
            spectrum[peak].annotate(Annotation::Isotope);
            spectrum[peak].charge = cluster.charge;
            offset += 1.0;
        }

        if extended.len() == cluster.len() {
            return None;
        }
        extended.extended = true;
        let mono = &mut spectrum[extended.monoisotopic];
        mono.annotate(Annotation::Monoisotopic);
        mono.charge = cluster.charge;
        Some(extended)
    }

    /// Detect clusters with the tolerance of the spectrum and store them in
    /// the spectrum. Returns the number of new clusters.
    pub fn annotate(&self, spectrum: &mut Spectrum) -> usize {
        let tolerance = spectrum.tolerance;
        let clusters = self.detect(spectrum, tolerance);
        let n = clusters.len();
        spectrum.clusters.extend(clusters);
        n
    }
}

pub fn detect_isotope_clusters(
    spectrum: &mut Spectrum,
    max_charge: u8,
    tolerance: Tolerance,
) -> Vec<IsotopeCluster> {
    IsotopeDetector {
        max_charge,
        ..Default::default()
    }
    .detect(spectrum, tolerance)
}
