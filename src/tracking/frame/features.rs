//! Keyframe features across the cameras of a rig.

use nalgebra::Vector2;

/// ORB matching thresholds.
pub const TH_HIGH: u32 = 100; // Max descriptor distance for acceptance
pub const TH_LOW: u32 = 50; // Stricter threshold

/// 256-bit binary descriptor.
pub type Descriptor = [u8; 32];

/// A single detected feature.
///
/// Feature slots of a keyframe run over all cameras of the rig; `camera`
/// records which image the keypoint was detected in.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub camera: usize,
    pub keypoint: Vector2<f64>,
    /// Pyramid level the keypoint was detected at.
    pub octave: i32,
    pub descriptor: Descriptor,
}

impl Feature {
    pub fn new(camera: usize, keypoint: Vector2<f64>, octave: i32, descriptor: Descriptor) -> Self {
        Self {
            camera,
            keypoint,
            octave,
            descriptor,
        }
    }
}

/// Hamming distance between two descriptors.
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_distance() {
        let a = [0u8; 32];
        assert_eq!(descriptor_distance(&a, &a), 0);

        let mut c = [0u8; 32];
        c[0] = 0xFF;
        c[31] = 0x01;
        assert_eq!(descriptor_distance(&a, &c), 9);
    }
}
