use rayon::prelude::*;
use xlink_core::fragment::FragmentKind;
use xlink_core::matching::MatchedFragment;
use xlink_core::pipeline::{Annotated, Outcome};

use crate::runner::{FileOutcomes, Runner};

fn kind_name(record: &MatchedFragment) -> &'static str {
    match record.kind {
        FragmentKind::Base => "base",
        FragmentKind::Loss { .. } => "loss",
        FragmentKind::Crosslinked => "crosslinked",
    }
}

impl Runner {
    pub fn serialize_match(
        &self,
        filename: &str,
        annotated: &Annotated,
        record: &MatchedFragment,
    ) -> csv::ByteRecord {
        let spectrum = &annotated.spectrum;
        let tolerance = self.parameters.fragment_tol;
        let experimental = record.experimental_mz(spectrum).unwrap_or_default();
        let (peak_mz, peak_intensity) = spectrum
            .get(record.peak)
            .map(|peak| (peak.mz, peak.intensity))
            .unwrap_or_default();

        let mut row = csv::ByteRecord::new();
        row.push_field(filename.as_bytes());
        row.push_field(spectrum.id.as_bytes());
        row.push_field(itoa::Buffer::new().format(record.fragment.0).as_bytes());
        row.push_field(kind_name(record).as_bytes());
        row.push_field(itoa::Buffer::new().format(record.charge).as_bytes());
        row.push_field(ryu::Buffer::new().format(peak_mz).as_bytes());
        row.push_field(ryu::Buffer::new().format(peak_intensity).as_bytes());
        row.push_field(ryu::Buffer::new().format(record.mz()).as_bytes());
        row.push_field(
            ryu::Buffer::new()
                .format(tolerance.error(experimental, record.mz()))
                .as_bytes(),
        );
        row.push_field(itoa::Buffer::new().format(record.matched_missing() as u8).as_bytes());
        match record.cluster.and_then(|cix| spectrum.cluster(cix)) {
            Some(cluster) => {
                row.push_field(itoa::Buffer::new().format(cluster.len()).as_bytes());
                row.push_field(
                    ryu::Buffer::new()
                        .format(cluster.score.unwrap_or_default())
                        .as_bytes(),
                );
            }
            None => {
                row.push_field(b"1");
                row.push_field(b"");
            }
        }
        row
    }

    pub fn write_matches(&self, files: &[FileOutcomes]) -> anyhow::Result<String> {
        let path = self.make_path("matched_fragments.xlink.tsv");

        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(vec![]);

        let headers = csv::ByteRecord::from(vec![
            "filename",
            "scannr",
            "fragment",
            "kind",
            "charge",
            "peak_mz",
            "peak_intensity",
            "calcmz",
            "fragment_error",
            "missing_monoisotopic",
            "cluster_size",
            "cluster_score",
        ]);
        wtr.write_byte_record(&headers)?;

        let rows = files
            .par_iter()
            .flat_map(|file| {
                let filename = &self.parameters.spectra_paths[file.file_id];
                file.outcomes.par_iter().flat_map(move |outcome| {
                    outcome
                        .result
                        .as_ref()
                        .map(|annotated| {
                            annotated
                                .matches
                                .sorted()
                                .into_iter()
                                .map(|record| self.serialize_match(filename, annotated, record))
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default()
                })
            })
            .collect::<Vec<_>>();

        for row in rows {
            wtr.write_byte_record(&row)?;
        }

        wtr.flush()?;
        let bytes = wtr.into_inner()?;
        std::fs::write(&path, bytes)?;
        Ok(path.display().to_string())
    }

    pub fn serialize_outcome(&self, filename: &str, outcome: &Outcome) -> csv::ByteRecord {
        let mut row = csv::ByteRecord::new();
        row.push_field(filename.as_bytes());
        row.push_field(outcome.id.as_bytes());
        match &outcome.result {
            Ok(annotated) => {
                let spectrum = &annotated.spectrum;
                let matched = spectrum
                    .iter()
                    .filter(|(_, peak)| peak.is_matched())
                    .map(|(_, peak)| peak.intensity)
                    .sum::<f64>();
                let total = spectrum.total_intensity();
                row.push_field(itoa::Buffer::new().format(spectrum.len()).as_bytes());
                row.push_field(itoa::Buffer::new().format(spectrum.clusters.len()).as_bytes());
                row.push_field(itoa::Buffer::new().format(annotated.matches.len()).as_bytes());
                row.push_field(
                    itoa::Buffer::new()
                        .format(annotated.matches.matched_lossy())
                        .as_bytes(),
                );
                row.push_field(
                    ryu::Buffer::new()
                        .format(if total > 0.0 { matched * 100.0 / total } else { 0.0 })
                        .as_bytes(),
                );
                row.push_field(
                    itoa::Buffer::new()
                        .format(annotated.residual.as_ref().map(|r| r.len()).unwrap_or(0))
                        .as_bytes(),
                );
                row.push_field(b"");
            }
            Err(e) => {
                for _ in 0..6 {
                    row.push_field(b"");
                }
                row.push_field(e.to_string().as_bytes());
            }
        }
        row
    }

    pub fn write_summary(&self, files: &[FileOutcomes]) -> anyhow::Result<String> {
        let path = self.make_path("spectra.xlink.tsv");

        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(vec![]);

        let headers = csv::ByteRecord::from(vec![
            "filename",
            "scannr",
            "peaks",
            "clusters",
            "matched_fragments",
            "matched_lossy",
            "matched_intensity_pct",
            "residual_peaks",
            "error",
        ]);
        wtr.write_byte_record(&headers)?;

        for file in files {
            let filename = &self.parameters.spectra_paths[file.file_id];
            for outcome in &file.outcomes {
                wtr.write_byte_record(&self.serialize_outcome(filename, outcome))?;
            }
        }

        wtr.flush()?;
        let bytes = wtr.into_inner()?;
        std::fs::write(&path, bytes)?;
        Ok(path.display().to_string())
    }
}
