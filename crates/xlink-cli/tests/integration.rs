use xlink_cli::input::Input;
use xlink_cli::runner::Runner;
use xlink_core::mass::mass_to_mz;

fn workspace(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("xlink-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn integration() -> anyhow::Result<()> {
    let dir = workspace("integration");
    let mono = mass_to_mz(997.485, 2);

    std::fs::write(
        dir.join("fragments.json"),
        r#"[
            {"id": 1, "neutral_mass": 997.485},
            {"id": 2, "neutral_mass": 979.4744, "kind": {"loss": {"base": 1}}},
            {"id": 3, "neutral_mass": 2200.0, "kind": "crosslinked"}
        ]"#,
    )?;

    let spectra = serde_json::json!([
        {
            "id": "scan=1",
            "precursor_mz": 800.0,
            "precursor_charge": 3,
            "mz": [mono, mono + 0.501675, mono + 1.00335, 1200.0],
            "intensity": [100.0, 55.0, 20.0, 10.0]
        },
        {
            "id": "scan=2",
            "precursor_mz": 800.0,
            "mz": [100.0, 200.0],
            "intensity": [1.0]
        }
    ]);
    std::fs::write(dir.join("spectra.json"), serde_json::to_vec(&spectra)?)?;

    let parameters = serde_json::json!({
        "fragment_tol": {"ppm": 10.0},
        "annotation": {"greedy": false},
        "fragments": dir.join("fragments.json"),
        "spectra_paths": [dir.join("spectra.json")],
        "output_directory": dir.join("out"),
    });
    std::fs::write(dir.join("params.json"), serde_json::to_vec(&parameters)?)?;

    let search = Input::load(dir.join("params.json"))?.build()?;
    assert!(!search.annotation.greedy);
    let runner = Runner::new(search)?;
    assert_eq!(runner.index.len(), 3);

    let search = runner.run()?;
    assert_eq!(search.output_paths.len(), 3);

    let matches = std::fs::read_to_string(dir.join("out").join("matched_fragments.xlink.tsv"))?;
    let rows = matches.lines().collect::<Vec<_>>();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].starts_with("filename\tscannr\tfragment"));
    let fields = rows[1].split('\t').collect::<Vec<_>>();
    assert_eq!(fields[1], "scan=1");
    assert_eq!(fields[2], "1");
    assert_eq!(fields[3], "base");
    assert_eq!(fields[4], "2");
    assert_eq!(fields[9], "0");

    let summary = std::fs::read_to_string(dir.join("out").join("spectra.xlink.tsv"))?;
    let failed = summary
        .lines()
        .find(|line| line.contains("scan=2"))
        .unwrap_or_default();
    assert!(failed.contains("malformed spectrum"));

    let results: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.join("out").join("results.json"))?)?;
    assert_eq!(results["fragment_tol"]["ppm"], 10.0);

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn missing_fragments_is_an_error() -> anyhow::Result<()> {
    let dir = workspace("missing");
    std::fs::write(
        dir.join("params.json"),
        r#"{"fragment_tol": {"da": 0.02}, "spectra_paths": ["a.json"]}"#,
    )?;
    assert!(Input::load(dir.join("params.json"))?.build().is_err());

    std::fs::write(dir.join("params.json"), r#"{"fragment_tol": {"parsecs": 1}}"#)?;
    assert!(Input::load(dir.join("params.json")).is_err());

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
