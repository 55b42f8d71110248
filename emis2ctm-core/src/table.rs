//! Readers for the small delimited files that drive emission processing
//!
//! Two shapes of file are supported:
//!
//! - [`Table`]: comma-separated factor tables with a header row
//!   (species maps, weekday/hour weights, layer fractions, control rows)
//! - [`parse_grid`]: plain numeric grids, either whitespace-delimited with a
//!   fixed number of header lines (ESRI ASCII grids) or comma-delimited masks
//!
//! Blank lines and lines starting with `#` are ignored by the table reader.
//! Fields may be quoted, so a quoted header can contain a comma.

use crate::errors::{EmissionError, EmissionResult};
use ndarray::Array2;
use std::path::Path;
use std::str::FromStr;

const COMMENT_PREFIX: u8 = b'#';

/// A parsed comma-separated table with a header row
#[derive(Debug, Clone)]
pub struct Table {
    source_name: String,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Read and parse a table from disk
    pub fn from_path(path: &Path) -> EmissionResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EmissionError::io(path, e))?;
        Self::parse(&text, &path.display().to_string())
    }

    /// Parse a table from text.
    ///
    /// `source_name` is only used in error messages.
    pub fn parse(text: &str, source_name: &str) -> EmissionResult<Self> {
        let text = text.trim_start_matches('\u{feff}');
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .comment(Some(COMMENT_PREFIX))
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| EmissionError::parse(source_name, e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect();
        if headers.iter().all(String::is_empty) {
            return Err(EmissionError::parse(source_name, "table has no header row"));
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| EmissionError::parse(source_name, e.to_string()))?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
            if fields.len() < headers.len() {
                fields.resize(headers.len(), String::new());
            }
            rows.push(fields);
        }

        Ok(Self {
            source_name: source_name.to_string(),
            headers,
            rows,
        })
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a named column
    pub fn column_index(&self, name: &str) -> EmissionResult<usize> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| EmissionError::parse(&self.source_name, format!("missing column '{}'", name)))
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().enumerate().map(move |(index, fields)| Row {
            table: self,
            index,
            fields,
        })
    }
}

/// A single data row of a [`Table`]
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    table: &'a Table,
    index: usize,
    fields: &'a [String],
}

impl<'a> Row<'a> {
    /// Raw field text, empty when the row is shorter than the header
    pub fn get(&self, column: usize) -> &'a str {
        self.fields.get(column).map(String::as_str).unwrap_or("")
    }

    /// Raw field text by column name
    pub fn field(&self, name: &str) -> EmissionResult<&'a str> {
        Ok(self.get(self.table.column_index(name)?))
    }

    /// Parse a required field
    pub fn parse<T: FromStr>(&self, column: usize) -> EmissionResult<T> {
        let raw = self.get(column);
        raw.parse::<T>().map_err(|_| self.invalid(column, raw))
    }

    /// Parse a required field by column name
    pub fn parse_named<T: FromStr>(&self, name: &str) -> EmissionResult<T> {
        self.parse(self.table.column_index(name)?)
    }

    /// Parse an optional number.
    ///
    /// Empty fields and `NaN` spellings are treated as missing.
    pub fn parse_optional_f64(&self, column: usize) -> EmissionResult<Option<f64>> {
        let raw = self.get(column);
        if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
            return Ok(None);
        }
        raw.parse::<f64>()
            .map(Some)
            .map_err(|_| self.invalid(column, raw))
    }

    fn invalid(&self, column: usize, raw: &str) -> EmissionError {
        let header = self
            .table
            .headers
            .get(column)
            .map(String::as_str)
            .unwrap_or("?");
        EmissionError::parse(
            &self.table.source_name,
            format!(
                "invalid value '{}' in column '{}' of data row {}",
                raw,
                header,
                self.index + 1
            ),
        )
    }
}

/// Parse a numeric grid into a `rows x columns` array.
///
/// `skip_rows` leading lines are dropped before parsing (the header block of
/// an ASCII grid). When `separator` is `None` values are split on whitespace.
/// The grid is returned in file order; callers flip it when the file is
/// written north-first.
pub fn parse_grid(
    text: &str,
    skip_rows: usize,
    separator: Option<char>,
    source_name: &str,
) -> EmissionResult<Array2<f64>> {
    let mut values = Vec::new();
    let mut n_cols: Option<usize> = None;
    let mut n_rows = 0;

    for (line_no, line) in text.lines().enumerate().skip(skip_rows) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let before = values.len();
        let fields: Vec<&str> = match separator {
            Some(sep) => line.split(sep).map(str::trim).collect(),
            None => line.split_whitespace().collect(),
        };
        for field in fields {
            let value = field.parse::<f64>().map_err(|_| {
                EmissionError::parse(
                    source_name,
                    format!("invalid value '{}' on line {}", field, line_no + 1),
                )
            })?;
            values.push(value);
        }

        let width = values.len() - before;
        match n_cols {
            None => n_cols = Some(width),
            Some(expected) if expected != width => {
                return Err(EmissionError::parse(
                    source_name,
                    format!(
                        "line {} has {} values, expected {}",
                        line_no + 1,
                        width,
                        expected
                    ),
                ))
            }
            Some(_) => {}
        }
        n_rows += 1;
    }

    let n_cols = n_cols.ok_or_else(|| EmissionError::parse(source_name, "grid has no data rows"))?;
    Array2::from_shape_vec((n_rows, n_cols), values)
        .map_err(|e| EmissionError::parse(source_name, e.to_string()))
}

/// Read a numeric grid from disk, see [`parse_grid`]
pub fn read_grid(path: &Path, skip_rows: usize, separator: Option<char>) -> EmissionResult<Array2<f64>> {
    let text = std::fs::read_to_string(path).map_err(|e| EmissionError::io(path, e))?;
    parse_grid(&text, skip_rows, separator, &path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_parse_table_skips_comments_and_pads_rows() {
        let text = "\u{feff}Var,NO,NO2\n# comment\n\nNO,0.9\nNO2,,1\n";
        let table = Table::parse(text, "species-map.csv").unwrap();

        assert_eq!(table.headers(), &["Var", "NO", "NO2"]);
        assert_eq!(table.len(), 2);

        let rows: Vec<_> = table.rows().collect();
        assert_eq!(rows[0].get(0), "NO");
        assert_eq!(rows[0].parse_optional_f64(1).unwrap(), Some(0.9));
        assert_eq!(rows[0].parse_optional_f64(2).unwrap(), None);
        assert_eq!(rows[1].parse_optional_f64(1).unwrap(), None);
        assert_eq!(rows[1].parse_optional_f64(2).unwrap(), Some(1.0));
    }

    #[test]
    fn test_quoted_fields_keep_commas() {
        let text = "Var,\"NOx,total\",SO2\nNO,0.9,\n\"SO2\",,1\n";
        let table = Table::parse(text, "species-map.csv").unwrap();

        assert_eq!(table.headers(), &["Var", "NOx,total", "SO2"]);
        assert_eq!(table.column_index("SO2").unwrap(), 2);
        let rows: Vec<_> = table.rows().collect();
        assert_eq!(rows[1].get(0), "SO2");
        assert_eq!(rows[1].parse_named::<f64>("SO2").unwrap(), 1.0);
    }

    #[test]
    fn test_invalid_value_names_column_and_row() {
        let table = Table::parse("species,unit_convert\nNO,abc\n", "convert.csv").unwrap();
        let row = table.rows().next().unwrap();
        let err = row.parse_named::<f64>("unit_convert").unwrap_err();

        let message = err.to_string();
        assert!(message.contains("convert.csv"));
        assert!(message.contains("unit_convert"));
        assert!(message.contains("row 1"));
    }

    #[test]
    fn test_missing_column() {
        let table = Table::parse("sector,1\npower,1\n", "day.csv").unwrap();
        assert!(table.column_index("2").is_err());
    }

    #[test]
    fn test_empty_table_is_error() {
        assert!(Table::parse("\n# nothing\n", "empty.csv").is_err());
    }

    #[test]
    fn test_parse_ascii_grid_with_header() {
        let text = "ncols 3\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\nNODATA_value -9999\n1 2 3\n4 5 6\n";
        let grid = parse_grid(text, 6, None, "grid.asc").unwrap();
        assert_eq!(grid, array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
    }

    #[test]
    fn test_parse_comma_grid() {
        let grid = parse_grid("1,0\n0,1\n", 0, Some(','), "mask.csv").unwrap();
        assert_eq!(grid, array![[1.0, 0.0], [0.0, 1.0]]);
    }

    #[test]
    fn test_ragged_grid_is_error() {
        assert!(parse_grid("1 2 3\n4 5\n", 0, None, "ragged.asc").is_err());
    }
}
