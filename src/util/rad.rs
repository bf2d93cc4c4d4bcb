//! `.rad` parameter files.
//!
//! A `.rad` file stores the Caltech intrinsic matrix and distortion vector as
//! `key = value` lines:
//!
//! ```text
//! K11 = 1000        # fx
//! K12 = 0           # fx * skew
//! K13 = 320         # cx
//! K21 = 0
//! K22 = 1000        # fy
//! K23 = 240         # cy
//! K31 = 0
//! K32 = 0
//! K33 = 1
//! kc1 = -0.2        # k1
//! kc2 = 0.05        # k2
//! kc3 = 0           # p1
//! kc4 = 0           # p2
//! comment = free text
//! ```
//!
//! Blank lines and lines starting with `#` are ignored. Values are written in
//! the shortest form that parses back to the same `f64`.

use super::UtilError;
use crate::distortion::DistortionParameters;
use log::warn;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const MATRIX_KEYS: [&str; 9] = ["K11", "K12", "K13", "K21", "K22", "K23", "K31", "K32", "K33"];
const DISTORTION_KEYS: [&str; 4] = ["kc1", "kc2", "kc3", "kc4"];

/// Contents of a `.rad` file.
#[derive(Debug, Clone, PartialEq)]
pub struct RadFile {
    pub parameters: DistortionParameters,
    pub comment: String,
}

impl RadFile {
    pub fn new(parameters: DistortionParameters, comment: impl Into<String>) -> Self {
        Self {
            parameters,
            comment: comment.into(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, UtilError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), UtilError> {
        fs::write(path, self.render())?;
        Ok(())
    }

    /// Parses the text of a `.rad` file.
    pub fn parse(text: &str) -> Result<Self, UtilError> {
        let mut values: HashMap<&str, f64> = HashMap::new();
        let mut comment = String::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| UtilError::Parse {
                line: index + 1,
                message: format!("expected `key = value`, found `{line}`"),
            })?;
            let key = key.trim();
            let value = value.trim();

            if key == "comment" {
                comment = value.to_string();
                continue;
            }
            if !MATRIX_KEYS.contains(&key) && !DISTORTION_KEYS.contains(&key) {
                warn!("Ignoring unknown key `{}` on line {}", key, index + 1);
                continue;
            }
            let number = value.parse::<f64>().map_err(|e| UtilError::Parse {
                line: index + 1,
                message: format!("invalid value `{value}` for {key}: {e}"),
            })?;
            values.insert(key, number);
        }

        let get = |key: &str| {
            values
                .get(key)
                .copied()
                .ok_or_else(|| UtilError::InvalidParams(format!("missing key {key}")))
        };

        let fx = get("K11")?;
        let fy = get("K22")?;
        if fx == 0.0 {
            return Err(UtilError::InvalidParams("K11 (fx) must not be zero".to_string()));
        }
        let parameters = DistortionParameters::new(fx, fy, get("K13")?, get("K23")?)
            .with_skew(get("K12")? / fx)
            .with_radial(vec![get("kc1")?, get("kc2")?])
            .with_tangential(get("kc3")?, get("kc4")?);

        for key in ["K21", "K31", "K32"] {
            if values.get(key).is_some_and(|v| *v != 0.0) {
                warn!("{} is not zero and has no place in the distortion model", key);
            }
        }
        if values.get("K33").is_some_and(|v| *v != 1.0) {
            warn!("K33 is not one, the intrinsic matrix is not normalised");
        }

        parameters.validate()?;
        Ok(Self {
            parameters,
            comment,
        })
    }

    /// Renders the file contents.
    pub fn render(&self) -> String {
        let p = &self.parameters;
        if p.radial.len() > 2 {
            warn!(
                "A .rad file stores k1 and k2 only, dropping {} higher radial terms",
                p.radial.len() - 2
            );
        }
        let matrix = [
            p.focal_length_x,
            p.focal_length_x * p.skew,
            p.center_x,
            0.0,
            p.focal_length_y,
            p.center_y,
            0.0,
            0.0,
            1.0,
        ];
        let distortion = [p.k1(), p.k2(), p.tangential[0], p.tangential[1]];

        MATRIX_KEYS
            .iter()
            .zip(matrix)
            .chain(DISTORTION_KEYS.iter().zip(distortion))
            .map(|(key, value)| format!("{key} = {value}\n"))
            .chain(std::iter::once(format!(
                "comment = {}\n",
                self.comment.replace('\n', " ")
            )))
            .collect()
    }
}
