/// In-memory point cloud: positions plus an optional per-point colour layer.
///
/// When `colors` is `Some`, it holds exactly one value per point; the PLY
/// reader constructs clouds that way and the encoder rejects anything else.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PointCloud {
    pub positions: Vec<[f64; 3]>,
    pub colors: Option<Vec<[u8; 3]>>,
}

impl PointCloud {
    pub fn point_count(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn has_colors(&self) -> bool {
        self.colors.is_some()
    }

    /// Axis-aligned extent of all points; zeroes for an empty cloud.
    pub fn bounding_box(&self) -> BoundingBox {
        let mut bbox = BoundingBox {
            min: [f64::MAX, f64::MAX, f64::MAX],
            max: [f64::MIN, f64::MIN, f64::MIN],
        };
        if self.positions.is_empty() {
            return BoundingBox::default();
        }
        for position in &self.positions {
            for axis in 0..3 {
                bbox.min[axis] = bbox.min[axis].min(position[axis]);
                bbox.max[axis] = bbox.max[axis].max(position[axis]);
            }
        }
        bbox
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundingBox {
    pub fn size(&self) -> [f64; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_covers_all_points() {
        let cloud = PointCloud {
            positions: vec![[1.0, -2.0, 3.0], [4.0, 0.0, -1.0], [0.0, 5.0, 2.0]],
            colors: None,
        };
        let bbox = cloud.bounding_box();
        assert_eq!(bbox.min, [0.0, -2.0, -1.0]);
        assert_eq!(bbox.max, [4.0, 5.0, 3.0]);
        assert_eq!(bbox.size(), [4.0, 7.0, 4.0]);
    }

    #[test]
    fn empty_cloud_has_zero_bounding_box() {
        let cloud = PointCloud::default();
        assert!(cloud.is_empty());
        assert_eq!(cloud.bounding_box(), BoundingBox::default());
    }
}
