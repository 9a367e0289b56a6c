//! Averagine model of peptide isotope envelopes, used to split isotope
//! clusters that are really two overlapping envelopes

use serde::{Deserialize, Serialize};

use crate::isotopes::IsotopeCluster;
use crate::spectrum::{Annotation, Spectrum};

/// Slope of the linear height model, per isotope offset
pub const AVERAGINE_A: [f64; 9] = [
    -0.02576, 0.049889, 0.029321, 0.020406, 0.012126, 0.013333, 0.006667, 0.003333, 0.001667,
];

/// Intercept of the linear height model, per isotope offset
pub const AVERAGINE_B: [f64; 9] = [136.0, 0.0, -2.93, -2.04, -12.0, -26.0, -39.0, -58.0, -87.0];

/// Above this mass the monoisotopic peak has a predicted height of zero
pub const BORDER_MASS: f64 = -AVERAGINE_B[0] / AVERAGINE_A[0];

/// Predicted height of isotope peak `offset` of an ion with neutral `mass`,
/// in arbitrary units. Offsets past the end of the table reuse the last
/// entry, and the result is never negative.
pub fn relative_height(mass: f64, offset: usize) -> f64 {
    let i = offset.min(AVERAGINE_A.len() - 1);
    (mass * AVERAGINE_A[i] + AVERAGINE_B[i]).max(0.0)
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Averagine {
    /// Observed and predicted heights may differ by this factor before a
    /// cluster is split
    pub breakup_factor: f64,
    /// Smaller clusters are never split
    pub min_cluster_size: usize,
}

impl Default for Averagine {
    fn default() -> Self {
        Self {
            breakup_factor: 4.0,
            min_cluster_size: 5,
        }
    }
}

impl Averagine {
    /// Offset of the first peak in `cluster` that does not fit the envelope
    /// predicted from its monoisotopic peak
    fn split_point(&self, spectrum: &Spectrum, cluster: &IsotopeCluster) -> Option<usize> {
        if cluster.len() < self.min_cluster_size || cluster.extended {
            return None;
        }

        let mono = spectrum.get(*cluster.peaks.first()?)?;
        let mass = mono.mz * cluster.charge as f64;
        let factor = mono.intensity / relative_height(mass, 0);
        if !factor.is_finite() || factor <= 0.0 {
            return None;
        }

        for (offset, &ix) in cluster.peaks.iter().enumerate().skip(1) {
            let calculated = relative_height(mass, offset) * factor;
            let observed = spectrum[ix].intensity;
            if calculated <= 0.0 || !calculated.is_finite() {
                continue;
            }
            if calculated / self.breakup_factor > observed
                || observed > calculated * self.breakup_factor
            {
                return Some(offset);
            }
        }
        None
    }

    /// Split every cluster of the spectrum that deviates from the averagine
    /// envelope. The tail of a split cluster becomes a new cluster, whose
    /// first peak is marked monoisotopic. Returns the number of new clusters.
    pub fn deconvolute(&self, spectrum: &mut Spectrum, max_charge: u8) -> usize {
        let splits = spectrum
            .clusters
            .iter()
            .enumerate()
            .filter(|(_, cluster)| cluster.charge <= max_charge)
            .filter_map(|(idx, cluster)| Some((idx, self.split_point(spectrum, cluster)?)))
            .collect::<Vec<_>>();

        let mut discovered = Vec::with_capacity(splits.len());
        for (idx, offset) in splits {
            let mono = spectrum.clusters[idx].peaks[offset];
            let mz = spectrum[mono].mz;
            if let Some(tail) = spectrum.clusters[idx].split_off(offset, mz) {
                spectrum[mono].annotate(Annotation::Monoisotopic);
                log::trace!(
                    "{}: split cluster at {:.4} (z={}), new cluster at {:.4}",
                    spectrum.id,
                    spectrum.clusters[idx].mz,
                    tail.charge,
                    mz
                );
                discovered.push(tail);
            }
        }

        let n = discovered.len();
        spectrum.clusters.extend(discovered);
        n
    }

    /// Deviation of `cluster` from the averagine envelope, anchored at peak
    /// `first`, which is assumed to sit at isotope offset `offset`
    pub fn error(
        &self,
        spectrum: &Spectrum,
        cluster: &IsotopeCluster,
        first: usize,
        offset: usize,
    ) -> f64 {
        let reference = match cluster.peaks.get(first).and_then(|&ix| spectrum.get(ix)) {
            Some(peak) => peak,
            None => return 0.0,
        };
        let mass = reference.mz * cluster.charge as f64;
        let factor = reference.intensity / relative_height(mass, offset);

        // Every unobserved peak before the anchor costs the predicted height
        // of the anchor itself
        let mut error = 0.0;
        let anchor = relative_height(mass, offset) * factor;
        if anchor.is_finite() {
            error += anchor * offset as f64;
        }

        let last = cluster
            .len()
            .min((first + AVERAGINE_A.len()).saturating_sub(offset + 1));
        let mut previous = reference.intensity;
        let mut offset = offset;
        for &ix in cluster.peaks.iter().take(last).skip(first + 1) {
            let peak = &spectrum[ix];
            if peak.is_monoisotopic() && !peak.is_isotope() {
                break;
            }
            offset += 1;
            let calculated = relative_height(mass, offset) * factor;
            let delta = ((previous - calculated) - (previous - peak.intensity)).abs()
                + (peak.intensity - calculated).abs();
            if delta.is_finite() {
                error += delta;
            }
            previous = peak.intensity;
        }
        error
    }

    /// Store the averagine error of every cluster in the spectrum
    pub fn score(&self, spectrum: &mut Spectrum) {
        let scores = spectrum
            .clusters
            .iter()
            .map(|cluster| self.error(spectrum, cluster, 0, 0))
            .collect::<Vec<_>>();
        for (cluster, score) in spectrum.clusters.iter_mut().zip(scores) {
            cluster.score = Some(score);
        }
    }
}

pub fn deconvolute(spectrum: &mut Spectrum, max_charge: u8) -> usize {
    Averagine::default().deconvolute(spectrum, max_charge)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mass::{Tolerance, NEUTRON};
    use crate::spectrum::{Peak, PeakIx};

    #[test]
    fn heights() {
        assert!((relative_height(3000.0, 0) - 58.72).abs() < 1e-9);
        assert!((relative_height(3000.0, 1) - 149.667).abs() < 1e-9);
        assert!((relative_height(3000.0, 4) - 24.378).abs() < 1e-9);
        // Offsets past the table reuse the last entry
        assert_eq!(relative_height(3000.0, 8), relative_height(3000.0, 20));
        // Never negative
        assert_eq!(relative_height(100.0, 8), 0.0);
        assert_eq!(relative_height(BORDER_MASS + 1.0, 0), 0.0);
        assert!((BORDER_MASS - 5279.503).abs() < 1e-3);
    }

    /// Five-peak, doubly charged cluster of mass 3000 following the
    /// averagine envelope exactly
    fn envelope(scale: f64) -> Spectrum {
        let mono = 1500.0;
        let peaks = (0..5)
            .map(|k| {
                Peak::new(
                    mono + k as f64 * NEUTRON / 2.0,
                    relative_height(3000.0, k) * scale,
                )
            })
            .collect();
        let mut s = Spectrum::new("test".into(), 1500.0, 2, Tolerance::Ppm(10.0), peaks);
        let mut cluster = IsotopeCluster::new(PeakIx(0), mono, 2);
        cluster.peaks = (0..5).map(PeakIx).collect();
        s.clusters.push(cluster);
        s
    }

    #[test]
    fn perfect_envelope_is_kept() {
        let mut s = envelope(10.0);
        assert_eq!(Averagine::default().deconvolute(&mut s, 8), 0);
        assert_eq!(s.clusters.len(), 1);
        assert_eq!(s.clusters[0].len(), 5);

        Averagine::default().score(&mut s);
        assert!(s.clusters[0].score.unwrap() < 1e-9);
    }

    #[test]
    fn overlapping_envelope_is_split() {
        let mut s = envelope(10.0);
        s[PeakIx(3)].intensity *= 9.0;
        assert_eq!(deconvolute(&mut s, 8), 1);
        assert_eq!(s.clusters.len(), 2);
        assert_eq!(s.clusters[0].peaks, vec![PeakIx(0), PeakIx(1), PeakIx(2)]);
        assert_eq!(s.clusters[1].peaks, vec![PeakIx(3), PeakIx(4)]);
        assert_eq!(s.clusters[1].monoisotopic, PeakIx(3));
        assert_eq!(s.clusters[1].charge, 2);
        assert_eq!(s.clusters[1].mz, s[PeakIx(3)].mz);
        assert!(s[PeakIx(3)].is_monoisotopic());

        Averagine::default().score(&mut s);
        assert!(s.clusters.iter().all(|c| c.score.is_some()));
        assert!(s.clusters[0].score.unwrap() < 1e-9);
    }

    #[test]
    fn weak_peaks_also_split() {
        let mut s = envelope(10.0);
        s[PeakIx(2)].intensity /= 5.0;
        assert_eq!(deconvolute(&mut s, 8), 1);
        assert_eq!(s.clusters[1].monoisotopic, PeakIx(2));
    }

    #[test]
    fn skipped_clusters() {
        // Too small
        let mut s = envelope(10.0);
        s[PeakIx(3)].intensity *= 9.0;
        let strict = Averagine {
            min_cluster_size: 6,
            ..Default::default()
        };
        assert_eq!(strict.deconvolute(&mut s, 8), 0);

        // Charge above the limit
        assert_eq!(deconvolute(&mut s, 1), 0);

        // Extended clusters are never split
        s.clusters[0].extended = true;
        assert_eq!(deconvolute(&mut s, 8), 0);
    }

    #[test]
    fn error_with_unobserved_leading_peaks() {
        let peaks = vec![Peak::new(1500.0, 587.2)];
        let mut s = Spectrum::new("offset".into(), 1500.0, 2, Tolerance::Ppm(10.0), peaks);
        s.clusters.push(IsotopeCluster::new(PeakIx(0), 1500.0, 2));
        let cluster = &s.clusters[0];
        let averagine = Averagine::default();

        assert_eq!(averagine.error(&s, cluster, 0, 0), 0.0);
        assert!((averagine.error(&s, cluster, 0, 1) - 587.2).abs() < 1e-9);
        assert!((averagine.error(&s, cluster, 0, 2) - 1174.4).abs() < 1e-9);
        // Anchor outside of the cluster
        assert_eq!(averagine.error(&s, cluster, 3, 0), 0.0);
    }

    #[test]
    fn error_of_anchored_envelope() {
        // Anchored at the second peak, assumed to sit at offset 1. The missing
        // monoisotopic peak costs the height of the anchor, the rest of the
        // envelope only deviates by the shifted mass estimate.
        let s = envelope(10.0);
        let anchor = s[PeakIx(1)].intensity;
        let err = Averagine::default().error(&s, &s.clusters[0], 1, 1);
        assert!(err >= anchor);
        assert!(err - anchor < 1.0);
    }

    #[test]
    fn heavy_ions_are_not_split() {
        // Predicted monoisotopic height is zero, so no envelope can be fit
        let peaks = (0..5)
            .map(|k| Peak::new(3000.0 + k as f64 * NEUTRON / 2.0, 100.0 * (k + 1) as f64))
            .collect();
        let mut s = Spectrum::new("heavy".into(), 3000.0, 2, Tolerance::Ppm(10.0), peaks);
        let mut cluster = IsotopeCluster::new(PeakIx(0), 3000.0, 2);
        cluster.peaks = (0..5).map(PeakIx).collect();
        s.clusters.push(cluster);
        assert_eq!(deconvolute(&mut s, 8), 0);

        Averagine::default().score(&mut s);
        assert!(s.clusters[0].score.is_some());
    }
}
