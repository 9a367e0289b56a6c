pub mod averagine;
pub mod database;
pub mod fragment;
pub mod isotopes;
pub mod mass;
pub mod matching;
pub mod pipeline;
pub mod spectrum;

#[derive(Debug)]
pub enum Error {
    /// Tolerance unit is not one of `da`, `m/z`, `mz` or `ppm`
    UnknownUnit(String),
    InvalidTolerance(String),
    MalformedSpectrum {
        id: String,
        reason: String,
    },
    /// A fault caught at the per-spectrum worker boundary
    Panicked {
        id: String,
        message: String,
    },
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownUnit(unit) => write!(f, "unknown tolerance unit `{}`", unit),
            Self::InvalidTolerance(value) => write!(f, "invalid tolerance value `{}`", value),
            Self::MalformedSpectrum { id, reason } => {
                write!(f, "malformed spectrum `{}`: {}", id, reason)
            }
            Self::Panicked { id, message } => {
                write!(f, "processing spectrum `{}` failed: {}", id, message)
            }
            Self::Io(e) => e.fmt(f),
            Self::Json(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

pub fn read_json<P, T>(path: P) -> Result<T, Error>
where
    P: AsRef<std::path::Path>,
    T: for<'de> serde::Deserialize<'de>,
{
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}
