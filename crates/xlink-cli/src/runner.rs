use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::info;
use xlink_core::database::FragmentIndex;
use xlink_core::fragment::FragmentCandidate;
use xlink_core::pipeline::{Annotator, Cancellation, Deadline, Never, Outcome};
use xlink_core::spectrum::RawSpectrum;

use super::input::Search;

pub struct Runner {
    pub index: Arc<FragmentIndex>,
    pub parameters: Search,
    start: Instant,
}

/// Outcomes of every spectrum of a single input file
pub struct FileOutcomes {
    pub file_id: usize,
    pub outcomes: Vec<Outcome>,
}

impl Runner {
    pub fn new(parameters: Search) -> anyhow::Result<Self> {
        let start = Instant::now();
        let fragments: Vec<FragmentCandidate> = xlink_core::read_json(&parameters.fragments)
            .with_context(|| format!("Failed to read fragments from `{}`", parameters.fragments))?;
        let index = FragmentIndex::build(fragments);
        info!(
            "loaded {} fragments ({} distinct masses) in {:#?}",
            index.len(),
            index.buckets(),
            start.elapsed()
        );
        Ok(Self {
            index: Arc::new(index),
            parameters,
            start,
        })
    }

    fn read_spectra(&self, path: &str) -> anyhow::Result<Vec<RawSpectrum>> {
        xlink_core::read_json(path).with_context(|| format!("Failed to read spectra from `{path}`"))
    }

    pub fn make_path<S: AsRef<str>>(&self, path: S) -> PathBuf {
        self.parameters.output_directory.join(path.as_ref())
    }

    pub fn annotate(&self, cancel: &dyn Cancellation) -> anyhow::Result<Vec<FileOutcomes>> {
        let annotator = Annotator::new(
            self.parameters.annotation,
            self.parameters.fragment_tol,
            self.index.clone(),
        );

        let mut files = Vec::with_capacity(self.parameters.spectra_paths.len());
        for (file_id, path) in self.parameters.spectra_paths.iter().enumerate() {
            if cancel.is_cancelled() {
                log::warn!("cancelled: skipping `{}`", path);
                continue;
            }
            let spectra = self.read_spectra(path)?;
            info!("- {}: {} spectra", path, spectra.len());
            let outcomes = annotator.annotate_all(spectra, cancel);
            files.push(FileOutcomes { file_id, outcomes });
        }
        Ok(files)
    }

    pub fn run(mut self) -> anyhow::Result<Search> {
        let cancel: Box<dyn Cancellation> = match self.parameters.timeout {
            Some(secs) => Box::new(Deadline::after(Duration::from_secs(secs))),
            None => Box::new(Never),
        };

        let files = self.annotate(cancel.as_ref())?;

        let (mut annotated, mut failed, mut matches) = (0, 0, 0);
        for outcome in files.iter().flat_map(|f| f.outcomes.iter()) {
            match &outcome.result {
                Ok(a) => {
                    annotated += 1;
                    matches += a.matches.len();
                }
                Err(_) => failed += 1,
            }
        }
        info!(
            "annotated {} spectra ({} failed) with {} fragment matches",
            annotated, failed, matches
        );

        let path = self.write_matches(&files)?;
        self.parameters.output_paths.push(path);
        let path = self.write_summary(&files)?;
        self.parameters.output_paths.push(path);

        let path = self.make_path("results.json");
        self.parameters.output_paths.push(path.display().to_string());
        let bytes = serde_json::to_vec_pretty(&self.parameters)?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write `{}`", path.display()))?;

        info!("finished in {}s", self.start.elapsed().as_secs());
        Ok(self.parameters)
    }
}
