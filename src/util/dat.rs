//! `.dat` numeric array files: one whitespace-separated row per line, every
//! line terminated by a newline.

use super::UtilError;
use nalgebra::DMatrix;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Number format used when writing a `.dat` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatFormat {
    /// C `% 8e`: sign or space, six decimals, two-digit exponent.
    #[default]
    Float,
    /// C `%d` of the value truncated towards zero.
    Integer,
}

/// Formats `value` like C's `printf("% 8e", value)`.
pub fn format_c_exp(value: f64) -> String {
    if value.is_nan() {
        return " nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { " inf" } else { "-inf" }.to_string();
    }
    let formatted = format!("{value:.6e}");
    let (mantissa, exponent) = formatted.split_once('e').unwrap_or((&formatted, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if mantissa.starts_with('-') { "" } else { " " };
    let exp_sign = if exponent < 0 { '-' } else { '+' };
    format!("{sign}{mantissa}e{exp_sign}{:02}", exponent.abs())
}

fn format_value(value: f64, format: DatFormat) -> Result<String, UtilError> {
    match format {
        DatFormat::Float => Ok(format_c_exp(value)),
        DatFormat::Integer => {
            if !value.is_finite() {
                return Err(UtilError::InvalidParams(format!(
                    "cannot write {value} as an integer"
                )));
            }
            Ok(format!("{}", value.trunc() as i64))
        }
    }
}

/// Reads a `.dat` file. An empty file yields a 0×0 matrix.
pub fn load_dat<P: AsRef<Path>>(path: P) -> Result<DMatrix<f64>, UtilError> {
    let contents = fs::read_to_string(path)?;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(|token| {
                token.parse::<f64>().map_err(|e| UtilError::Parse {
                    line: index + 1,
                    message: format!("invalid number `{token}`: {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(first) = rows.first() {
            if first.len() != row.len() {
                return Err(UtilError::Parse {
                    line: index + 1,
                    message: format!("expected {} values, found {}", first.len(), row.len()),
                });
            }
        }
        rows.push(row);
    }

    let ncols = rows.first().map_or(0, Vec::len);
    Ok(DMatrix::from_row_iterator(
        rows.len(),
        ncols,
        rows.into_iter().flatten(),
    ))
}

/// Writes `matrix` row by row.
pub fn save_dat<P: AsRef<Path>>(
    path: P,
    matrix: &DMatrix<f64>,
    format: DatFormat,
) -> Result<(), UtilError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for row in matrix.row_iter() {
        let fields = row
            .iter()
            .map(|v| format_value(*v, format))
            .collect::<Result<Vec<_>, _>>()?;
        writeln!(writer, "{}", fields.join(" "))?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes a one-dimensional array as a single row.
pub fn save_dat_row<P: AsRef<Path>>(path: P, values: &[f64], format: DatFormat) -> Result<(), UtilError> {
    save_dat(path, &DMatrix::from_row_slice(1, values.len(), values), format)
}
