// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE-APACHE file or at:
//     https://www.apache.org/licenses/LICENSE-2.0

//! Simple data types

/// 2D position or size over `f32`
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vec2(pub f32, pub f32);

impl Vec2 {
    /// Zero
    pub const ZERO: Vec2 = Vec2(0.0, 0.0);

    /// Return the minimum, componentwise
    #[inline]
    pub fn min(self, other: Self) -> Self {
        Vec2(self.0.min(other.0), self.1.min(other.1))
    }

    /// Return the maximum, componentwise
    #[inline]
    pub fn max(self, other: Self) -> Self {
        Vec2(self.0.max(other.0), self.1.max(other.1))
    }
}

impl std::ops::Add for Vec2 {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Vec2(self.0 + other.0, self.1 + other.1)
    }
}

impl std::ops::AddAssign for Vec2 {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
        self.1 += other.1;
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Vec2(self.0 - other.0, self.1 - other.1)
    }
}

impl std::ops::Mul<f32> for Vec2 {
    type Output = Self;

    #[inline]
    fn mul(self, f: f32) -> Self {
        Vec2(self.0 * f, self.1 * f)
    }
}

impl From<Vec2> for (f32, f32) {
    fn from(size: Vec2) -> Self {
        (size.0, size.1)
    }
}

/// An axis-aligned ink box
///
/// An empty box is represented with `min` at positive and `max` at negative
/// infinity so that `union` of an empty box with anything is the identity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rect {
    pub min: Vec2,
    pub max: Vec2,
}

impl Default for Rect {
    fn default() -> Self {
        Rect::EMPTY
    }
}

impl Rect {
    /// The empty box
    pub const EMPTY: Rect = Rect {
        min: Vec2(f32::INFINITY, f32::INFINITY),
        max: Vec2(f32::NEG_INFINITY, f32::NEG_INFINITY),
    };

    /// True if no area has been united into this box
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.0 > self.max.0 || self.min.1 > self.max.1
    }

    /// The union of two boxes
    #[inline]
    pub fn union(self, other: Rect) -> Rect {
        Rect {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rect_union() {
        let a = Rect {
            min: Vec2(1.0, -2.0),
            max: Vec2(4.0, 3.0),
        };
        assert!(Rect::EMPTY.is_empty());
        assert_eq!(Rect::EMPTY.union(a), a);
        let b = Rect {
            min: Vec2(-1.0, 0.0),
            max: Vec2(2.0, 5.0),
        };
        let u = a.union(b);
        assert_eq!(u.min, Vec2(-1.0, -2.0));
        assert_eq!(u.max, Vec2(4.0, 5.0));
    }
}
