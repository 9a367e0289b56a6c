use std::path::PathBuf;

use anyhow::{ensure, Context};
use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use xlink_core::mass::Tolerance;
use xlink_core::pipeline::{Builder, Parameters};

#[derive(Serialize)]
/// Actual annotation parameters - may include overrides or default values not set by user
pub struct Search {
    pub version: String,
    pub annotation: Parameters,
    pub fragment_tol: Tolerance,
    pub fragments: String,
    pub spectra_paths: Vec<String>,
    /// Stop starting new spectra after this many seconds
    pub timeout: Option<u64>,
    pub output_paths: Vec<String>,

    #[serde(skip_serializing)]
    pub output_directory: PathBuf,
}

#[derive(Deserialize)]
/// Input parameters deserialized from JSON file
pub struct Input {
    #[serde(default)]
    annotation: Builder,
    fragment_tol: Tolerance,
    fragments: Option<String>,
    spectra_paths: Option<Vec<String>>,
    output_directory: Option<String>,
    timeout: Option<u64>,
}

impl Input {
    pub fn from_arguments(matches: ArgMatches) -> anyhow::Result<Self> {
        let path = matches
            .get_one::<String>("parameters")
            .context("missing parameters file")?;
        let mut input = Input::load(path)
            .with_context(|| format!("Failed to read parameters from `{path}`"))?;

        // Handle JSON configuration overrides
        if let Some(output_directory) = matches.get_one::<String>("output_directory") {
            log::trace!("overriding `output_directory` parameter.");
            input.output_directory = Some(output_directory.into());
        }
        if let Some(fragments) = matches.get_one::<String>("fragments") {
            log::trace!("overriding `fragments` parameter.");
            input.fragments = Some(fragments.into());
        }
        if let Some(spectra_paths) = matches.get_many::<String>("spectra_paths") {
            log::trace!("overriding `spectra_paths` parameter.");
            input.spectra_paths = Some(spectra_paths.into_iter().map(|p| p.into()).collect());
        }
        if let Some(timeout) = matches.get_one::<u64>("timeout").copied() {
            input.timeout = Some(timeout);
        }

        Ok(input)
    }

    pub fn load<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        xlink_core::read_json(path).map_err(anyhow::Error::from)
    }

    fn check_tolerance(tolerance: &Tolerance) {
        match tolerance {
            Tolerance::Ppm(ppm) if *ppm > 50.0 => {
                log::warn!("fragment tolerance of {} is wider than expected", tolerance)
            }
            Tolerance::Da(da) if *da > 0.5 => {
                log::warn!("fragment tolerance of {} is wider than expected", tolerance)
            }
            _ => {}
        }
    }

    pub fn build(self) -> anyhow::Result<Search> {
        ensure!(
            self.fragment_tol.value().is_finite() && self.fragment_tol.value() >= 0.0,
            "`fragment_tol` must be a non-negative number"
        );
        Self::check_tolerance(&self.fragment_tol);

        // avoid failing later if these parameters are not set (but doesn't check if files exist)
        let fragments = self
            .fragments
            .context("`fragments` must be set. For more information try '--help'")?;
        let spectra_paths = self
            .spectra_paths
            .context("`spectra_paths` must be set. For more information try '--help'")?;
        ensure!(!spectra_paths.is_empty(), "`spectra_paths` is empty");

        let annotation = self.annotation.make_parameters();
        if annotation.averagine.breakup_factor <= 1.0 {
            log::warn!(
                "`breakup_factor` of {} will split nearly every isotope cluster",
                annotation.averagine.breakup_factor
            );
        }

        let output_directory = match self.output_directory {
            Some(path) => {
                let path = PathBuf::from(path);
                std::fs::create_dir_all(&path)
                    .with_context(|| format!("Failed to create `{}`", path.display()))?;
                path
            }
            None => std::env::current_dir()?,
        };

        Ok(Search {
            version: clap::crate_version!().into(),
            annotation,
            fragment_tol: self.fragment_tol,
            fragments,
            spectra_paths,
            timeout: self.timeout,
            output_paths: Vec::new(),
            output_directory,
        })
    }
}
