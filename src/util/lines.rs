//! Line group CSV files with the header `line,x,y`.
//!
//! Rows sharing a `line` id form one group. Groups are returned in the order
//! their ids first appear; rows of a group keep their file order.

use super::UtilError;
use crate::geometry::LineGroup;
use log::debug;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
struct LineRecord {
    line: u32,
    x: f64,
    y: f64,
}

pub fn load_line_groups<P: AsRef<Path>>(path: P) -> Result<Vec<LineGroup>, UtilError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_path(path.as_ref())?;

    let mut slots: HashMap<u32, usize> = HashMap::new();
    let mut groups: Vec<LineGroup> = Vec::new();
    for record in reader.deserialize() {
        let record: LineRecord = record?;
        if !(record.x.is_finite() && record.y.is_finite()) {
            return Err(UtilError::InvalidParams(format!(
                "non-finite point ({}, {}) in line {}",
                record.x, record.y, record.line
            )));
        }
        let slot = *slots.entry(record.line).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(Vector2::new(record.x, record.y));
    }

    debug!(
        "Read {} line groups with {} points from {}",
        groups.len(),
        groups.iter().map(Vec::len).sum::<usize>(),
        path.as_ref().display()
    );
    Ok(groups)
}

/// Writes `groups`, numbering them from 0 in order.
pub fn save_line_groups<P: AsRef<Path>>(path: P, groups: &[LineGroup]) -> Result<(), UtilError> {
    let mut writer = csv::Writer::from_path(path)?;
    for (id, group) in groups.iter().enumerate() {
        for point in group {
            writer.serialize(LineRecord {
                line: id as u32,
                x: point.x,
                y: point.y,
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ensure_output_dir;
    use std::fs;

    #[test]
    fn test_load_sample_groups_in_first_appearance_order() {
        let groups = load_line_groups("samples/lines.csv").unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 4);
        assert_eq!(groups[1].len(), 3);
        assert_eq!(groups[2].len(), 1);
        // id 7 appears first in the file
        assert_eq!(groups[0][0], Vector2::new(40.5, 100.25));
        assert_eq!(groups[1][0], Vector2::new(300.0, 20.0));
    }

    #[test]
    fn test_save_and_reload() {
        ensure_output_dir().unwrap();
        let groups = vec![
            vec![Vector2::new(1.0, 2.0), Vector2::new(3.5, 4.25)],
            vec![Vector2::new(-7.0, 0.125)],
        ];
        save_line_groups("output/lines_saved.csv", &groups).unwrap();
        let text = fs::read_to_string("output/lines_saved.csv").unwrap();
        assert!(text.starts_with("line,x,y\n"));
        assert_eq!(load_line_groups("output/lines_saved.csv").unwrap(), groups);
        fs::remove_file("output/lines_saved.csv").unwrap();
    }

    #[test]
    fn test_bad_row() {
        ensure_output_dir().unwrap();
        fs::write("output/lines_bad.csv", "line,x,y\n0,1.0,two\n").unwrap();
        let err = load_line_groups("output/lines_bad.csv").unwrap_err();
        assert!(matches!(err, UtilError::Csv(_)));
        fs::remove_file("output/lines_bad.csv").unwrap();
    }
}
