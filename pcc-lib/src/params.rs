//! Encoder parameter sets: what to compress and how.

use foldhash::{HashMap, HashMapExt};

use crate::cloud::{BoundingBox, PointCloud};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttributeLabel {
    Colour = 0,
    Reflectance = 1,
}

impl AttributeLabel {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AttributeLabel::Colour),
            1 => Some(AttributeLabel::Reflectance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttributeEncoding {
    /// Scalar quantisation with an `init_qp`-driven step before the entropy
    /// stage. Step 1 (qp 0) is lossless.
    Quantized = 0,
    /// Values pass to the entropy stage untouched.
    Raw = 1,
}

impl AttributeEncoding {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AttributeEncoding::Quantized),
            1 => Some(AttributeEncoding::Raw),
            _ => None,
        }
    }
}

/// What an attribute is, per the sequence parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeDescription {
    pub label: AttributeLabel,
    pub num_dimensions: u8,
    pub bitdepth: u8,
}

/// How an attribute is coded, per its attribute parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeParameterSet {
    pub encoding: AttributeEncoding,
    pub init_qp: u8,
}

/// Full encoder configuration for one sequence.
///
/// `seq_bounding_box` left as `None` means "derive from the cloud extents";
/// [`ParameterSet::derive`] resolves it. `attributes`, `attr_params` and
/// `attribute_index` run in parallel: entry `i` of the first two describes
/// the same attribute, and the index map resolves an attribute name to `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    pub seq_parameter_set_id: u8,
    pub geom_parameter_set_id: u8,
    pub seq_geom_scale: f64,
    pub seq_bounding_box: Option<BoundingBox>,
    pub merge_duplicate_points: bool,
    pub attributes: Vec<AttributeDescription>,
    pub attr_params: Vec<AttributeParameterSet>,
    pub attribute_index: HashMap<String, usize>,
}

impl Default for ParameterSet {
    fn default() -> Self {
        ParameterSet {
            seq_parameter_set_id: 0,
            geom_parameter_set_id: 0,
            seq_geom_scale: 1.0,
            seq_bounding_box: None,
            merge_duplicate_points: false,
            attributes: Vec::new(),
            attr_params: Vec::new(),
            attribute_index: HashMap::new(),
        }
    }
}

impl ParameterSet {
    /// The driver's default configuration for `cloud`: unit scale,
    /// auto-derived bounding box, and an 8-bit colour attribute when the
    /// cloud carries colours.
    pub fn for_cloud(cloud: &PointCloud) -> Self {
        let mut params = ParameterSet::default();
        if cloud.has_colors() {
            params.add_attribute(
                "color",
                AttributeDescription {
                    label: AttributeLabel::Colour,
                    num_dimensions: 3,
                    bitdepth: 8,
                },
                AttributeParameterSet {
                    encoding: AttributeEncoding::Quantized,
                    init_qp: 32,
                },
            );
        }
        params
    }

    /// Appends an attribute, keeping description, settings and index map
    /// consistent.
    pub fn add_attribute(
        &mut self,
        name: &str,
        description: AttributeDescription,
        settings: AttributeParameterSet,
    ) {
        let index = self.attributes.len();
        self.attributes.push(description);
        self.attr_params.push(settings);
        self.attribute_index.insert(name.to_string(), index);
    }

    /// Checks the set for internal consistency.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.seq_geom_scale.is_finite() || self.seq_geom_scale <= 0.0 {
            return Err(Error::Config(format!(
                "Geometry scale must be finite and positive, got {}",
                self.seq_geom_scale
            )));
        }

        if self.attr_params.len() != self.attributes.len() {
            return Err(Error::Config(format!(
                "{} attribute descriptions but {} attribute parameter sets",
                self.attributes.len(),
                self.attr_params.len()
            )));
        }

        if self.attribute_index.len() != self.attributes.len() {
            return Err(Error::Config(
                "The attribute index map does not cover the attribute list".to_string(),
            ));
        }
        let mut seen = vec![false; self.attributes.len()];
        for (name, &index) in &self.attribute_index {
            if index >= self.attributes.len() || seen[index] {
                return Err(Error::Config(format!(
                    "Attribute '{}' maps to an invalid or duplicate index {}",
                    name, index
                )));
            }
            seen[index] = true;
        }

        for (index, attr) in self.attributes.iter().enumerate() {
            if attr.num_dimensions == 0 || attr.bitdepth == 0 {
                return Err(Error::Config(format!(
                    "Attribute {} has zero dimensions or bitdepth",
                    index
                )));
            }
            if attr.label == AttributeLabel::Colour && attr.num_dimensions != 3 {
                return Err(Error::Config(format!(
                    "A colour attribute must have 3 dimensions, got {}",
                    attr.num_dimensions
                )));
            }
        }

        if let Some(bbox) = &self.seq_bounding_box {
            for axis in 0..3 {
                if bbox.max[axis] < bbox.min[axis] {
                    return Err(Error::Config(format!(
                        "Bounding box max is below min on axis {}",
                        axis
                    )));
                }
            }
        }

        Ok(())
    }

    /// Returns a copy with every derived field resolved from `cloud`; the
    /// input is left untouched and already-resolved sets pass through
    /// unchanged.
    pub fn derive(&self, cloud: &PointCloud) -> ParameterSet {
        let mut derived = self.clone();
        if derived.seq_bounding_box.is_none() {
            derived.seq_bounding_box = Some(cloud.bounding_box());
        }
        derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn colour_cloud() -> PointCloud {
        PointCloud {
            positions: vec![[0.0, 0.0, 0.0], [4.0, 2.0, -1.0]],
            colors: Some(vec![[255, 0, 0], [0, 255, 0]]),
        }
    }

    #[test]
    fn default_set_validates() {
        ParameterSet::default().validate().expect("default must be valid");
    }

    #[test]
    fn for_cloud_adds_colour_only_when_present() {
        let with = ParameterSet::for_cloud(&colour_cloud());
        assert_eq!(with.attributes.len(), 1);
        assert_eq!(with.attributes[0].label, AttributeLabel::Colour);
        assert_eq!(with.attribute_index.get("color"), Some(&0));
        with.validate().expect("must be valid");

        let without = ParameterSet::for_cloud(&PointCloud {
            positions: vec![[1.0; 3]],
            colors: None,
        });
        assert!(without.attributes.is_empty());
        without.validate().expect("must be valid");
    }

    #[test]
    fn derive_fills_bounding_box_and_is_idempotent() {
        let cloud = colour_cloud();
        let params = ParameterSet::for_cloud(&cloud);
        assert!(params.seq_bounding_box.is_none());

        let derived = params.derive(&cloud);
        let bbox = derived.seq_bounding_box.expect("bbox not derived");
        assert_eq!(bbox.min, [0.0, 0.0, -1.0]);
        assert_eq!(bbox.max, [4.0, 2.0, 0.0]);
        // The input is untouched and a second derivation changes nothing.
        assert!(params.seq_bounding_box.is_none());
        assert_eq!(derived.derive(&cloud), derived);
    }

    #[test]
    fn derive_keeps_an_explicit_bounding_box() {
        let explicit = BoundingBox {
            min: [-10.0; 3],
            max: [10.0; 3],
        };
        let mut params = ParameterSet::default();
        params.seq_bounding_box = Some(explicit);
        let derived = params.derive(&colour_cloud());
        assert_eq!(derived.seq_bounding_box, Some(explicit));
    }

    #[test]
    fn rejects_bad_geometry_scale() {
        for scale in [0.0, -2.0, f64::NAN, f64::INFINITY] {
            let mut params = ParameterSet::default();
            params.seq_geom_scale = scale;
            let err = params.validate().unwrap_err();
            assert!(matches!(err, Error::Config(_)), "scale {}", scale);
        }
    }

    #[test]
    fn rejects_settings_length_mismatch() {
        let mut params = ParameterSet::for_cloud(&colour_cloud());
        params.attr_params.clear();
        let err = params.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {:?}", err);
    }

    #[test]
    fn rejects_broken_index_map() {
        let mut params = ParameterSet::for_cloud(&colour_cloud());
        params.attribute_index.insert("color".to_string(), 5);
        let err = params.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {:?}", err);

        let mut params = ParameterSet::for_cloud(&colour_cloud());
        params.attribute_index.clear();
        let err = params.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {:?}", err);
    }

    #[test]
    fn rejects_degenerate_attributes() {
        let mut params = ParameterSet::default();
        params.add_attribute(
            "color",
            AttributeDescription {
                label: AttributeLabel::Colour,
                num_dimensions: 1,
                bitdepth: 8,
            },
            AttributeParameterSet {
                encoding: AttributeEncoding::Raw,
                init_qp: 0,
            },
        );
        let err = params.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {:?}", err);

        let mut params = ParameterSet::default();
        params.add_attribute(
            "reflectance",
            AttributeDescription {
                label: AttributeLabel::Reflectance,
                num_dimensions: 1,
                bitdepth: 0,
            },
            AttributeParameterSet {
                encoding: AttributeEncoding::Raw,
                init_qp: 0,
            },
        );
        let err = params.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {:?}", err);
    }

    #[test]
    fn rejects_inverted_bounding_box() {
        let mut params = ParameterSet::default();
        params.seq_bounding_box = Some(BoundingBox {
            min: [0.0, 0.0, 0.0],
            max: [1.0, -1.0, 1.0],
        });
        let err = params.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {:?}", err);
    }
}
