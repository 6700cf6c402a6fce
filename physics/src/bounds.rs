use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Axis aligned bounding box.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub mins: Vec3,
    pub maxs: Vec3,
}

impl Bounds {
    /// An inverted box that any point or box will expand.
    pub fn new() -> Bounds {
        Bounds {
            mins: Vec3::splat(f32::MAX),
            maxs: Vec3::splat(-f32::MAX),
        }
    }

    pub fn from_min_max(mins: Vec3, maxs: Vec3) -> Self {
        Self { mins, maxs }
    }

    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        let half_extents = half_extents.abs();
        Self {
            mins: center - half_extents,
            maxs: center + half_extents,
        }
    }

    /// Bounds of `pts`. Any non-finite point makes every component NaN.
    pub fn from_points(pts: &[Vec3]) -> Self {
        if !pts.iter().all(|pt| pt.is_finite()) {
            return Bounds::from_min_max(Vec3::NAN, Vec3::NAN);
        }
        pts.iter().fold(Bounds::new(), |acc, pt| acc + *pt)
    }

    /// `mins <= maxs` on every axis and no component is NaN.
    pub fn is_valid(&self) -> bool {
        self.mins.is_finite() && self.maxs.is_finite() && self.mins.cmple(self.maxs).all()
    }

    /// Inclusive overlap test, touching boxes intersect.
    #[inline]
    pub fn intersects(&self, rhs: &Self) -> bool {
        self.mins.cmple(rhs.maxs).all() && rhs.mins.cmple(self.maxs).all()
    }

    #[inline]
    pub fn contains(&self, rhs: &Self) -> bool {
        self.mins.cmple(rhs.mins).all() && self.maxs.cmpge(rhs.maxs).all()
    }

    #[inline]
    pub fn union(&self, rhs: &Self) -> Self {
        Self {
            mins: self.mins.min(rhs.mins),
            maxs: self.maxs.max(rhs.maxs),
        }
    }

    pub fn expand_by_point(&mut self, pt: Vec3) {
        self.add_assign(pt);
    }

    /// Grows the box by `margin` on every side.
    pub fn expanded(&self, margin: f32) -> Self {
        let margin = Vec3::splat(margin);
        Self {
            mins: self.mins - margin,
            maxs: self.maxs + margin,
        }
    }

    /// Grows the box only on the side each component of `delta` points to.
    pub fn signed_expanded(&self, delta: Vec3) -> Self {
        let zero = Vec3::ZERO;
        Self {
            mins: self.mins + delta.min(zero),
            maxs: self.maxs + delta.max(zero),
        }
    }

    pub fn width(&self) -> Vec3 {
        self.maxs - self.mins
    }

    pub fn center(&self) -> Vec3 {
        (self.mins + self.maxs) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        self.width() * 0.5
    }

    pub fn surface_area(&self) -> f32 {
        let w = self.width();
        2.0 * (w.x * w.y + w.y * w.z + w.z * w.x)
    }
}

impl Default for Bounds {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Add<Vec3> for Bounds {
    type Output = Self;
    fn add(self, pt: Vec3) -> Self::Output {
        Bounds {
            mins: Vec3::select(pt.cmplt(self.mins), pt, self.mins),
            maxs: Vec3::select(pt.cmpgt(self.maxs), pt, self.maxs),
        }
    }
}

impl AddAssign<Vec3> for Bounds {
    fn add_assign(&mut self, pt: Vec3) {
        self.mins = Vec3::select(pt.cmplt(self.mins), pt, self.mins);
        self.maxs = Vec3::select(pt.cmpgt(self.maxs), pt, self.maxs);
    }
}

#[cfg(test)]
mod test {
    use super::Bounds;
    use glam::Vec3;

    #[test]
    fn test_intersects_inclusive() {
        let a = Bounds::from_min_max(Vec3::ZERO, Vec3::ONE);
        let b = Bounds::from_min_max(Vec3::ONE, Vec3::splat(2.0));
        let c = Bounds::from_min_max(Vec3::new(1.01, 0.0, 0.0), Vec3::splat(2.0));
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_union_and_contains() {
        let a = Bounds::from_min_max(Vec3::ZERO, Vec3::ONE);
        let b = Bounds::from_min_max(Vec3::splat(-1.0), Vec3::splat(0.5));
        let u = a.union(&b);
        assert_eq!(u, Bounds::from_min_max(Vec3::splat(-1.0), Vec3::ONE));
        assert!(u.contains(&a));
        assert!(u.contains(&b));
        assert!(!a.contains(&u));
    }

    #[test]
    fn test_expanded() {
        let a = Bounds::from_min_max(Vec3::ZERO, Vec3::ONE).expanded(0.5);
        assert_eq!(a.mins, Vec3::splat(-0.5));
        assert_eq!(a.maxs, Vec3::splat(1.5));

        let s = Bounds::from_min_max(Vec3::ZERO, Vec3::ONE)
            .signed_expanded(Vec3::new(1.0, -1.0, 0.0));
        assert_eq!(s.mins, Vec3::new(0.0, -1.0, 0.0));
        assert_eq!(s.maxs, Vec3::new(2.0, 1.0, 1.0));
    }

    #[test]
    fn test_from_points() {
        let b = Bounds::from_points(&[Vec3::new(1.0, -2.0, 3.0), Vec3::new(-1.0, 2.0, 0.0)]);
        assert_eq!(b.mins, Vec3::new(-1.0, -2.0, 0.0));
        assert_eq!(b.maxs, Vec3::new(1.0, 2.0, 3.0));
        assert!(b.is_valid());
        assert!(!Bounds::new().is_valid());

        let nan = Bounds::from_points(&[Vec3::ONE, Vec3::new(f32::NAN, 0.0, 0.0)]);
        assert!(nan.mins.is_nan() && nan.maxs.is_nan());
        assert!(!nan.is_valid());
    }
}
