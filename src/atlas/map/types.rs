//! Stable handles into the map arena.
//!
//! Keyframes and landmarks reference each other only through these ids, so
//! the bipartite observation graph has no ownership cycles and tombstoning
//! an entry is a plain data update.

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub fn new(id: u64) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Keyframe handle. Assigned monotonically by [`super::Map`]; id 0 is the
    /// map origin.
    KeyFrameId,
    "KF"
);

define_id!(
    /// Landmark handle. Stays valid after the landmark is tombstoned so
    /// redirect chains can still be resolved.
    MapPointId,
    "MP"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_order_by_creation() {
        assert!(KeyFrameId::new(3) < KeyFrameId::new(10));
        assert_eq!(KeyFrameId::new(42), KeyFrameId::new(42));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", MapPointId::new(123)), "MP123");
        assert_eq!(format!("{}", KeyFrameId::new(7)), "KF7");
    }
}
