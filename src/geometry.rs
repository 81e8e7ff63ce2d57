//! World geometry: points, axis-aligned bounding boxes, octant subdivision.
//!
//! The world is the cube `[0, 2^size_log]^3`. Every interior level splits
//! its cube at the centroid into eight octants addressed by a 3-bit index:
//! bit 0 = Y-high, bit 1 = X-high, bit 2 = Z-high.

/// A point in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// An axis-aligned bounding box given by its min and max corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point,
    pub max: Point,
}

/// A shape as the octree sees it: its bounds plus a 32-bit index into the
/// caller's shape table. The octree never stores anything else about it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeData {
    pub aabb: Aabb,
    pub index: u32,
}

/// A shape relocation: where the shape was, where it is going.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeMove {
    pub aabb_old: Aabb,
    pub aabb_new: Aabb,
    pub index: u32,
}

impl Point {
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl Aabb {
    #[must_use]
    pub const fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    /// Componentwise midpoint.
    #[must_use]
    pub fn centre(&self) -> Point {
        Point {
            x: (self.min.x + self.max.x) * 0.5,
            y: (self.min.y + self.max.y) * 0.5,
            z: (self.min.z + self.max.z) * 0.5,
        }
    }

    /// Overlap test. Touching boxes count as intersecting: a pair is
    /// disjoint only when strictly separated along some axis.
    #[must_use]
    pub fn intersects(&self, other: &Aabb) -> bool {
        fn axis(min0: f32, max0: f32, min1: f32, max1: f32) -> bool {
            !(max1 < min0 || max0 < min1)
        }

        axis(self.min.x, self.max.x, other.min.x, other.max.x)
            && axis(self.min.y, self.max.y, other.min.y, other.max.y)
            && axis(self.min.z, self.max.z, other.min.z, other.max.z)
    }

    /// The AABB of octant `index` (0..8) of this box, split at `centre`.
    ///
    /// Bit 0 selects the high Y half, bit 1 high X, bit 2 high Z.
    #[must_use]
    pub fn octant(&self, index: u32, centre: &Point) -> Aabb {
        let (min, max) = (self.min, self.max);
        let c = *centre;

        match index {
            0 => Aabb::new(min, c),
            1 => Aabb::new(
                Point::new(min.x, c.y, min.z),
                Point::new(c.x, max.y, c.z),
            ),
            2 => Aabb::new(
                Point::new(c.x, min.y, min.z),
                Point::new(max.x, c.y, c.z),
            ),
            3 => Aabb::new(
                Point::new(c.x, c.y, min.z),
                Point::new(max.x, max.y, c.z),
            ),
            4 => Aabb::new(
                Point::new(min.x, min.y, c.z),
                Point::new(c.x, c.y, max.z),
            ),
            5 => Aabb::new(
                Point::new(min.x, c.y, c.z),
                Point::new(c.x, max.y, max.z),
            ),
            6 => Aabb::new(
                Point::new(c.x, min.y, c.z),
                Point::new(max.x, c.y, max.z),
            ),
            7 => Aabb::new(c, max),
            _ => unreachable!("octant index out of range: {index}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cube() -> Aabb {
        Aabb::new(Point::new(0.0, 0.0, 0.0), Point::new(2.0, 2.0, 2.0))
    }

    #[test]
    fn centre_is_midpoint() {
        let c = test_cube().centre();
        assert_eq!((c.x, c.y, c.z), (1.0, 1.0, 1.0));
    }

    #[test]
    fn touching_boxes_intersect() {
        let a = Aabb::new(Point::new(0.0, 0.0, 0.0), Point::new(1.0, 1.0, 1.0));
        let b = Aabb::new(Point::new(1.0, 0.0, 0.0), Point::new(2.0, 1.0, 1.0));
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
    }

    #[test]
    fn separated_boxes_do_not_intersect() {
        let a = Aabb::new(Point::new(0.0, 0.0, 0.0), Point::new(1.0, 1.0, 1.0));
        let b = Aabb::new(Point::new(1.1, 0.0, 0.0), Point::new(2.0, 1.0, 1.0));
        assert!(!a.intersects(&b));
        assert!(!b.intersects(&a));

        let c = Aabb::new(Point::new(0.0, 0.0, 1.5), Point::new(1.0, 1.0, 2.0));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn octant_bits_select_halves() {
        let cube = test_cube();
        let c = cube.centre();

        for i in 0..8u32 {
            let o = cube.octant(i, &c);

            let (y_lo, y_hi) = if i & 1 == 0 { (0.0, 1.0) } else { (1.0, 2.0) };
            let (x_lo, x_hi) = if i & 2 == 0 { (0.0, 1.0) } else { (1.0, 2.0) };
            let (z_lo, z_hi) = if i & 4 == 0 { (0.0, 1.0) } else { (1.0, 2.0) };

            assert_eq!((o.min.x, o.max.x), (x_lo, x_hi), "octant {i} x");
            assert_eq!((o.min.y, o.max.y), (y_lo, y_hi), "octant {i} y");
            assert_eq!((o.min.z, o.max.z), (z_lo, z_hi), "octant {i} z");
        }
    }

    #[test]
    fn octants_partition_the_cube() {
        // Every point strictly inside the cube lies in at least one octant,
        // and the eight octant volumes sum to the cube volume.
        let cube = test_cube();
        let c = cube.centre();

        let mut volume = 0.0f32;
        for i in 0..8u32 {
            let o = cube.octant(i, &c);
            volume += (o.max.x - o.min.x) * (o.max.y - o.min.y) * (o.max.z - o.min.z);
        }
        assert_eq!(volume, 8.0);
    }

    #[test]
    fn octant_six_is_not_degenerate() {
        // Octant 6 covers the high-X/low-Y/high-Z cell, not a zero-height
        // slab at the centre plane.
        let cube = test_cube();
        let o = cube.octant(6, &cube.centre());
        assert_eq!(o.max.z, cube.max.z);
        assert!(o.max.z > o.min.z);

        let cell = Aabb::new(Point::new(1.5, 0.4, 1.5), Point::new(1.6, 0.5, 1.6));
        assert!(o.intersects(&cell));
        assert!(!cube.octant(7, &cube.centre()).intersects(&cell));
    }
}
