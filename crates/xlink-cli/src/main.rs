use clap::{value_parser, Arg, Command, ValueHint};
use rayon::ThreadPoolBuilder;
use xlink_cli::input::Input;
use xlink_cli::runner::Runner;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::default()
        .filter_level(log::LevelFilter::Error)
        .parse_env(env_logger::Env::default().filter_or("XLINK_LOG", "error,xlink=info"))
        .init();

    let matches = Command::new("xlink")
        .version(clap::crate_version!())
        .about("Annotate cross-linking MS2 spectra with isotope clusters and matched fragments")
        .arg(
            Arg::new("parameters")
                .required(true)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help("Path to configuration parameters (JSON file)")
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("spectra_paths")
                .num_args(1..)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Paths to spectra (JSON files) to process. Overrides spectra listed in the \
                     configuration file.",
                )
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("fragments")
                .short('f')
                .long("fragments")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path to theoretical fragments (JSON file). Overrides the file \
                     specified in the configuration file.",
                )
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("output_directory")
                .short('o')
                .long("output_directory")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path where annotation results will be written. \
                     Overrides the directory specified in the configuration file.",
                )
                .value_hint(ValueHint::DirPath),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .value_parser(value_parser!(u16).range(1..))
                .help("Number of worker threads (default = # of CPUs)")
                .value_hint(ValueHint::Other),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_parser(value_parser!(u64))
                .help("Stop starting new spectra after this many seconds")
                .value_hint(ValueHint::Other),
        )
        .help_template(
            "{usage-heading} {usage}\n\n\
             {about-with-newline}\n\
             Version {version}\n\n\
             {all-args}{after-help}",
        )
        .get_matches();

    let threads = matches
        .get_one::<u16>("threads")
        .copied()
        .map(usize::from)
        .unwrap_or_else(num_cpus::get);

    ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()?;

    let input = Input::from_arguments(matches)?;

    let runner = input.build().and_then(Runner::new)?;

    let search = runner.run()?;
    for path in &search.output_paths {
        log::info!("wrote {}", path);
    }

    Ok(())
}
