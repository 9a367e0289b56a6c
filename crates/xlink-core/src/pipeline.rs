use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::averagine::Averagine;
use crate::database::FragmentIndex;
use crate::isotopes::IsotopeDetector;
use crate::mass::Tolerance;
use crate::matching::{MatchSettings, MatchedFragmentCollection, Matcher};
use crate::spectrum::{RawSpectrum, Spectrum};
use crate::Error;

#[derive(Deserialize, Default, Clone, Debug)]
/// Annotation parameters, as deserialized from JSON. Missing values take defaults.
pub struct Builder {
    /// Highest isotope cluster charge, further capped by the precursor charge
    pub max_charge: Option<u8>,
    pub max_mono_to_first_ratio: Option<f64>,
    /// Split isotope clusters that do not follow the averagine envelope
    pub deconvolute: Option<bool>,
    pub breakup_factor: Option<f64>,
    pub min_cluster_size: Option<usize>,
    pub match_missing_monoisotopic: Option<bool>,
    pub missing_monoisotopic_min_mass: Option<f64>,
    pub virtual_missing_peaks: Option<bool>,
    pub transfer_loss_to_base: Option<bool>,
    /// Use greedy matching, and keep the residual spectrum
    pub greedy: Option<bool>,
}

impl Builder {
    pub fn make_parameters(self) -> Parameters {
        let isotopes = IsotopeDetector::default();
        let averagine = Averagine::default();
        let matching = MatchSettings::default();
        Parameters {
            isotopes: IsotopeDetector {
                max_charge: self.max_charge.unwrap_or(isotopes.max_charge).max(1),
                max_mono_to_first_ratio: self
                    .max_mono_to_first_ratio
                    .unwrap_or(isotopes.max_mono_to_first_ratio),
            },
            deconvolute: self.deconvolute.unwrap_or(true),
            averagine: Averagine {
                breakup_factor: self
                    .breakup_factor
                    .map(f64::abs)
                    .unwrap_or(averagine.breakup_factor),
                min_cluster_size: self.min_cluster_size.unwrap_or(averagine.min_cluster_size),
            },
            matching: MatchSettings {
                match_missing_monoisotopic: self
                    .match_missing_monoisotopic
                    .unwrap_or(matching.match_missing_monoisotopic),
                missing_monoisotopic_min_mass: self
                    .missing_monoisotopic_min_mass
                    .unwrap_or(matching.missing_monoisotopic_min_mass),
                virtual_missing_peaks: self
                    .virtual_missing_peaks
                    .unwrap_or(matching.virtual_missing_peaks),
                transfer_loss_to_base: self
                    .transfer_loss_to_base
                    .unwrap_or(matching.transfer_loss_to_base),
            },
            greedy: self.greedy.unwrap_or(true),
        }
    }
}

#[derive(Serialize, Copy, Clone, Debug, PartialEq)]
pub struct Parameters {
    pub isotopes: IsotopeDetector,
    pub deconvolute: bool,
    pub averagine: Averagine,
    pub matching: MatchSettings,
    pub greedy: bool,
}

impl Default for Parameters {
    fn default() -> Self {
        Builder::default().make_parameters()
    }
}

/// Checked between spectra. Spectra that were not started when cancellation
/// is signalled are skipped.
pub trait Cancellation: Sync {
    fn is_cancelled(&self) -> bool;
}

impl Cancellation for AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

/// Never cancels
pub struct Never;

impl Cancellation for Never {
    fn is_cancelled(&self) -> bool {
        false
    }
}

pub struct Deadline(Instant);

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Deadline(Instant::now() + duration)
    }
}

impl Cancellation for Deadline {
    fn is_cancelled(&self) -> bool {
        Instant::now() >= self.0
    }
}

#[derive(Clone, Debug)]
pub struct Annotated {
    pub spectrum: Spectrum,
    pub matches: MatchedFragmentCollection,
    /// Unexplained clusters and peaks, greedy matching only
    pub residual: Option<Spectrum>,
}

#[derive(Debug)]
pub struct Outcome {
    pub id: String,
    pub result: Result<Annotated, Error>,
}

/// Runs cluster detection, deconvolution and matching for single spectra
pub struct Annotator {
    pub parameters: Parameters,
    pub tolerance: Tolerance,
    pub index: Arc<FragmentIndex>,
}

impl Annotator {
    pub fn new(parameters: Parameters, tolerance: Tolerance, index: Arc<FragmentIndex>) -> Self {
        Self {
            parameters,
            tolerance,
            index,
        }
    }

    /// Annotate an already validated spectrum
    pub fn process(&self, mut spectrum: Spectrum) -> Annotated {
        let clusters = self.parameters.isotopes.detect(&mut spectrum, self.tolerance);
        spectrum.clusters.extend(clusters);

        if self.parameters.deconvolute {
            let max_charge = self.parameters.isotopes.max_charge;
            self.parameters
                .averagine
                .deconvolute(&mut spectrum, max_charge);
        }
        self.parameters.averagine.score(&mut spectrum);

        let matcher = Matcher::new(&self.index, self.tolerance, self.parameters.matching);
        let (matches, residual) = if self.parameters.greedy {
            let (matches, residual) = matcher.match_greedy(&mut spectrum);
            (matches, Some(residual))
        } else {
            (matcher.match_non_greedy(&mut spectrum), None)
        };
        spectrum.annotate_unmatched();

        Annotated {
            spectrum,
            matches,
            residual,
        }
    }

    /// Validate and annotate a spectrum. A panic while processing is turned
    /// into [`Error::Panicked`], and does not affect other spectra.
    pub fn annotate(&self, raw: RawSpectrum) -> Result<Annotated, Error> {
        let id = raw.id.clone();
        let spectrum = Spectrum::try_from_raw(raw, self.tolerance)?;
        catch_unwind(AssertUnwindSafe(|| self.process(spectrum))).map_err(|payload| {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".into()
            };
            Error::Panicked { id, message }
        })
    }

    /// Annotate spectra in parallel. Outcomes are returned in input order;
    /// spectra skipped due to cancellation have no outcome.
    pub fn annotate_all<C: Cancellation + ?Sized>(
        &self,
        spectra: Vec<RawSpectrum>,
        cancel: &C,
    ) -> Vec<Outcome> {
        let total = spectra.len();
        let counter = AtomicUsize::new(0);
        let start = Instant::now();

        let outcomes = spectra
            .into_par_iter()
            .filter_map(|raw| {
                if cancel.is_cancelled() {
                    return None;
                }
                let prev = counter.fetch_add(1, Ordering::Relaxed);
                if prev > 0 && prev % 10_000 == 0 {
                    let duration = Instant::now().duration_since(start).as_millis() as usize;
                    let rate = prev * 1000 / (duration + 1);
                    log::trace!("- annotated {} spectra ({} spectra/s)", prev, rate);
                }

                let id = raw.id.clone();
                let result = self.annotate(raw);
                if let Err(e) = &result {
                    log::error!("{}", e);
                }
                Some(Outcome { id, result })
            })
            .collect::<Vec<_>>();

        if outcomes.len() < total {
            log::warn!(
                "cancelled: skipped {} of {} spectra",
                total - outcomes.len(),
                total
            );
        }
        let duration = Instant::now().duration_since(start).as_millis() as usize;
        log::info!(
            "- annotate: {:8} ms ({} spectra/s)",
            duration,
            outcomes.len() * 1000 / (duration + 1)
        );
        outcomes
    }
}
