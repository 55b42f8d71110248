use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Identifies the unit of work a failure belongs to.
///
/// A unit of work is a (year, month, model species) request, optionally
/// narrowed down to the sector that was being processed when it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnitKey {
    pub year: i32,
    pub month: u32,
    pub sector: Option<String>,
    pub species: String,
}

impl WorkUnitKey {
    pub fn new(year: i32, month: u32, species: &str) -> Self {
        Self {
            year,
            month,
            sector: None,
            species: species.to_string(),
        }
    }

    /// Narrow the key to a single sector
    pub fn with_sector(mut self, sector: &str) -> Self {
        self.sector = Some(sector.to_string());
        self
    }
}

impl fmt::Display for WorkUnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "year={} month={:02}", self.year, self.month)?;
        if let Some(sector) = &self.sector {
            write!(f, " sector={}", sector)?;
        }
        write!(f, " species={}", self.species)
    }
}

/// Error type for emission processing.
#[derive(Error, Debug)]
pub enum EmissionError {
    #[error("Missing configuration: {0}")]
    MissingConfiguration(String),
    #[error("Unknown sector '{sector}' in {table}")]
    UnknownSector { sector: String, table: String },
    #[error("Unknown species '{species}' in {table}")]
    UnknownSpecies { species: String, table: String },
    #[error("Incompatible grid for {context}: expected {expected:?}, got {actual:?}")]
    IncompatibleGrid {
        context: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("Missing source file {}", path.display())]
    MissingSourceFile { path: PathBuf },
    #[error("Invalid date {year}-{month:02}-{day:02}")]
    InvalidDate { year: i32, month: u32, day: u32 },
    #[error("Invalid hour of day {0}, expected 0..=23")]
    InvalidHour(u32),
    #[error("Could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not parse {source_name}: {details}")]
    Parse {
        source_name: String,
        details: String,
    },
    #[error("Projection error: {0}")]
    Projection(String),
    #[error("Invalid configuration file: {0}")]
    Config(#[from] toml::de::Error),
    #[error("Failed to compute emissions for {key}: {source}")]
    WorkUnit {
        key: WorkUnitKey,
        #[source]
        source: Box<EmissionError>,
    },
}

impl EmissionError {
    /// Build an I/O error, mapping "not found" onto [`EmissionError::MissingSourceFile`]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            EmissionError::MissingSourceFile { path }
        } else {
            EmissionError::Io { path, source }
        }
    }

    pub fn parse(source_name: impl Into<String>, details: impl Into<String>) -> Self {
        EmissionError::Parse {
            source_name: source_name.into(),
            details: details.into(),
        }
    }

    /// Attach the failing unit of work to an error.
    ///
    /// Errors that already carry a key keep it, so the most specific key
    /// (the one that includes the sector) survives propagation.
    pub fn in_work_unit(self, key: WorkUnitKey) -> Self {
        match self {
            EmissionError::WorkUnit { .. } => self,
            other => EmissionError::WorkUnit {
                key,
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with any work unit wrapping removed
    pub fn root(&self) -> &EmissionError {
        match self {
            EmissionError::WorkUnit { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Convenience type for `Result<T, EmissionError>`.
pub type EmissionResult<T> = Result<T, EmissionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_missing_source_file() {
        let err = EmissionError::io(
            "input/missing.asc",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, EmissionError::MissingSourceFile { .. }));
    }

    #[test]
    fn test_work_unit_keeps_innermost_key() {
        let inner = EmissionError::UnknownSector {
            sector: "shipping".to_string(),
            table: "layer weights".to_string(),
        };
        let err = inner
            .in_work_unit(WorkUnitKey::new(2020, 1, "NO").with_sector("shipping"))
            .in_work_unit(WorkUnitKey::new(2020, 1, "NO"));

        let message = err.to_string();
        assert!(message.contains("year=2020 month=01 sector=shipping species=NO"));
        assert!(matches!(err.root(), EmissionError::UnknownSector { .. }));
    }
}
