//! Distortion parameter values and their YAML representation.

use super::{validation, DistortionError};
use crate::util::UtilError;
use serde::{Deserialize, Serialize};
use std::{fmt, fs, io::Write};
use yaml_rust::YamlLoader;

/// Immutable parameter set of a distortion model.
///
/// Focal lengths are fixed during estimation; the center and the first two
/// radial coefficients are what the line-straightness estimator solves for.
/// Builder methods consume and return the value, so an estimate is always
/// replaced as a whole.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DistortionParameters {
    /// Focal length along x, in pixels.
    pub focal_length_x: f64,
    /// Focal length along y, in pixels.
    pub focal_length_y: f64,
    /// Distortion center x, in pixels.
    pub center_x: f64,
    /// Distortion center y, in pixels.
    pub center_y: f64,
    /// Radial coefficients `k1, k2, ...` for `r^2, r^4, ...`.
    #[serde(default)]
    pub radial: Vec<f64>,
    /// Tangential coefficients `[p1, p2]`.
    #[serde(default)]
    pub tangential: [f64; 2],
    /// Pixel skew (`alpha_c`).
    #[serde(default)]
    pub skew: f64,
}

impl DistortionParameters {
    /// Parameters without any distortion.
    pub fn new(focal_length_x: f64, focal_length_y: f64, center_x: f64, center_y: f64) -> Self {
        Self {
            focal_length_x,
            focal_length_y,
            center_x,
            center_y,
            radial: Vec::new(),
            tangential: [0.0; 2],
            skew: 0.0,
        }
    }

    /// Default focal length of 1000 px with the center in the middle of a
    /// `width`×`height` image, the starting point for a fresh image set.
    pub fn for_image(width: u32, height: u32) -> Self {
        Self::new(1000.0, 1000.0, width as f64 / 2.0, height as f64 / 2.0)
    }

    pub fn with_center(mut self, center_x: f64, center_y: f64) -> Self {
        self.center_x = center_x;
        self.center_y = center_y;
        self
    }

    pub fn with_radial(mut self, radial: Vec<f64>) -> Self {
        self.radial = radial;
        self
    }

    pub fn with_tangential(mut self, p1: f64, p2: f64) -> Self {
        self.tangential = [p1, p2];
        self
    }

    pub fn with_skew(mut self, skew: f64) -> Self {
        self.skew = skew;
        self
    }

    /// Radial coefficient `k_{index+1}`, zero when not set.
    pub fn radial_coefficient(&self, index: usize) -> f64 {
        self.radial.get(index).copied().unwrap_or(0.0)
    }

    pub fn k1(&self) -> f64 {
        self.radial_coefficient(0)
    }

    pub fn k2(&self) -> f64 {
        self.radial_coefficient(1)
    }

    /// `true` when every distortion coefficient is zero.
    pub fn is_identity(&self) -> bool {
        self.radial.iter().all(|k| *k == 0.0)
            && self.tangential == [0.0; 2]
            && self.skew == 0.0
    }

    /// Checks that focal lengths are positive and every value is finite.
    pub fn validate(&self) -> Result<(), DistortionError> {
        validation::validate_focal_lengths(self.focal_length_x, self.focal_length_y)?;
        validation::validate_finite("center_x", self.center_x)?;
        validation::validate_finite("center_y", self.center_y)?;
        for (i, k) in self.radial.iter().enumerate() {
            validation::validate_finite(&format!("k{}", i + 1), *k)?;
        }
        validation::validate_finite("p1", self.tangential[0])?;
        validation::validate_finite("p2", self.tangential[1])?;
        validation::validate_finite("skew", self.skew)?;
        Ok(())
    }

    /// Loads parameters from a YAML file.
    ///
    /// The expected layout is
    ///
    /// ```yaml
    /// distortion:
    ///   model: caltech
    ///   focal_length: [1000.0, 1000.0]
    ///   center: [320.0, 240.0]
    ///   radial: [-0.2, 0.05]
    ///   tangential: [0.0, 0.0]
    ///   skew: 0.0
    /// ```
    ///
    /// `radial`, `tangential` and `skew` are optional and default to zero.
    pub fn load_from_yaml(path: &str) -> Result<Self, UtilError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)
            .map_err(|e| UtilError::Yaml(e.to_string()))?;

        let doc = docs
            .first()
            .ok_or_else(|| UtilError::InvalidParams("Empty YAML document".to_string()))?;
        let node = &doc["distortion"];

        let focal = node["focal_length"]
            .as_vec()
            .ok_or_else(|| UtilError::InvalidParams("Missing focal_length".to_string()))?;
        let center = node["center"]
            .as_vec()
            .ok_or_else(|| UtilError::InvalidParams("Missing center".to_string()))?;
        if focal.len() != 2 || center.len() != 2 {
            return Err(UtilError::InvalidParams(
                "focal_length and center need exactly two values".to_string(),
            ));
        }

        let number = |value: &yaml_rust::Yaml, name: &str| -> Result<f64, UtilError> {
            value
                .as_f64()
                .or_else(|| value.as_i64().map(|v| v as f64))
                .ok_or_else(|| UtilError::InvalidParams(format!("Invalid {name}")))
        };

        let mut params = Self::new(
            number(&focal[0], "focal_length[0]")?,
            number(&focal[1], "focal_length[1]")?,
            number(&center[0], "center[0]")?,
            number(&center[1], "center[1]")?,
        );

        if let Some(radial) = node["radial"].as_vec() {
            params.radial = radial
                .iter()
                .enumerate()
                .map(|(i, k)| number(k, &format!("radial[{i}]")))
                .collect::<Result<_, _>>()?;
        }
        if let Some(tangential) = node["tangential"].as_vec() {
            if tangential.len() != 2 {
                return Err(UtilError::InvalidParams(format!(
                    "Expected 2 tangential coefficients, found {}",
                    tangential.len()
                )));
            }
            params.tangential = [
                number(&tangential[0], "tangential[0]")?,
                number(&tangential[1], "tangential[1]")?,
            ];
        }
        if !node["skew"].is_badvalue() {
            params.skew = number(&node["skew"], "skew")?;
        }

        params.validate()?;
        Ok(params)
    }

    /// Saves the parameters in the layout read by [`DistortionParameters::load_from_yaml`].
    pub fn save_to_yaml(&self, path: &str) -> Result<(), UtilError> {
        let mut node = serde_yaml::Mapping::new();
        node.insert("model".into(), "caltech".into());
        node.insert(
            "focal_length".into(),
            serde_yaml::to_value([self.focal_length_x, self.focal_length_y])?,
        );
        node.insert(
            "center".into(),
            serde_yaml::to_value([self.center_x, self.center_y])?,
        );
        node.insert("radial".into(), serde_yaml::to_value(&self.radial)?);
        node.insert("tangential".into(), serde_yaml::to_value(self.tangential)?);
        node.insert("skew".into(), serde_yaml::to_value(self.skew)?);

        let mut root = serde_yaml::Mapping::new();
        root.insert("distortion".into(), serde_yaml::Value::Mapping(node));
        let yaml_string = serde_yaml::to_string(&root)?;

        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }
}

impl fmt::Debug for DistortionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DistortionParameters [ fc: ({}, {}), cc: ({}, {}), radial: {:?}, tangential: {:?}, skew: {} ]",
            self.focal_length_x,
            self.focal_length_y,
            self.center_x,
            self.center_y,
            self.radial,
            self.tangential,
            self.skew
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_yaml() {
        let params = DistortionParameters::load_from_yaml("samples/caltech.yaml").unwrap();
        assert_eq!(params.focal_length_x, 1000.0);
        assert_eq!(params.focal_length_y, 1000.0);
        assert_eq!(params.center_x, 321.0);
        assert_eq!(params.center_y, 242.0);
        assert_eq!(params.radial, vec![-0.21, 0.045]);
        assert_eq!(params.tangential, [0.0012, -0.0004]);
        assert_eq!(params.skew, 0.0);
    }

    #[test]
    fn test_save_to_yaml_round_trip() {
        fs::create_dir_all("output").expect("Failed to create output directory for test.");
        let output_path = "output/params_saved.yaml";

        let params = DistortionParameters::new(812.5, 790.25, 330.125, 251.0)
            .with_radial(vec![-0.3125, 0.1, 0.001])
            .with_tangential(1e-4, -2e-5)
            .with_skew(0.002);
        params.save_to_yaml(output_path).unwrap();
        let loaded = DistortionParameters::load_from_yaml(output_path).unwrap();
        assert_eq!(params, loaded);

        fs::remove_file(output_path).unwrap();
    }

    #[test]
    fn test_validate() {
        assert!(DistortionParameters::new(1000.0, 1000.0, 0.0, 0.0).validate().is_ok());
        assert!(DistortionParameters::new(1000.0, 1000.0, f64::NAN, 0.0)
            .validate()
            .is_err());
        assert!(DistortionParameters::new(1000.0, 1000.0, 0.0, 0.0)
            .with_radial(vec![f64::INFINITY])
            .validate()
            .is_err());
    }

    #[test]
    fn test_missing_radial_terms_read_as_zero() {
        let params = DistortionParameters::for_image(640, 480).with_radial(vec![0.5]);
        assert_eq!(params.center_x, 320.0);
        assert_eq!(params.k1(), 0.5);
        assert_eq!(params.k2(), 0.0);
        assert!(!params.is_identity());
        assert!(DistortionParameters::for_image(640, 480).is_identity());
    }
}
