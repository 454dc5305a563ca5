// mathlib.rs -- vector helpers used by the planes, bounds and hull builders

pub type Vec3 = [f32; 3];

// Plane types
pub const PLANE_X: i32 = 0;
pub const PLANE_Y: i32 = 1;
pub const PLANE_Z: i32 = 2;
pub const PLANE_ANYX: i32 = 3;
pub const PLANE_ANYY: i32 = 4;
pub const PLANE_ANYZ: i32 = 5;

#[inline]
pub fn dot_product(a: &Vec3, b: &Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vector_add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

/// Axial planes get the axis index, everything else the dominant axis + 3.
pub fn plane_type_for_normal(normal: &Vec3) -> i32 {
    if normal[0] == 1.0 || normal[0] == -1.0 {
        return PLANE_X;
    }
    if normal[1] == 1.0 || normal[1] == -1.0 {
        return PLANE_Y;
    }
    if normal[2] == 1.0 || normal[2] == -1.0 {
        return PLANE_Z;
    }

    let ax = normal[0].abs();
    let ay = normal[1].abs();
    let az = normal[2].abs();
    if ax >= ay && ax >= az {
        PLANE_ANYX
    } else if ay >= ax && ay >= az {
        PLANE_ANYY
    } else {
        PLANE_ANYZ
    }
}

/// Smallest value of `normal . c` over the corners `c` of the box [mins, maxs].
pub fn box_min_along(normal: &Vec3, mins: &Vec3, maxs: &Vec3) -> f32 {
    let mut d = 0.0;
    for i in 0..3 {
        d += (normal[i] * mins[i]).min(normal[i] * maxs[i]);
    }
    d
}

/// Largest value of `normal . c` over the corners `c` of the box [mins, maxs].
pub fn box_max_along(normal: &Vec3, mins: &Vec3, maxs: &Vec3) -> f32 {
    let mut d = 0.0;
    for i in 0..3 {
        d += (normal[i] * mins[i]).max(normal[i] * maxs[i]);
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_types() {
        assert_eq!(plane_type_for_normal(&[1.0, 0.0, 0.0]), PLANE_X);
        assert_eq!(plane_type_for_normal(&[0.0, -1.0, 0.0]), PLANE_Y);
        assert_eq!(plane_type_for_normal(&[0.0, 0.0, 1.0]), PLANE_Z);
        assert_eq!(plane_type_for_normal(&[0.8, 0.6, 0.0]), PLANE_ANYX);
        assert_eq!(plane_type_for_normal(&[0.0, 0.6, 0.8]), PLANE_ANYZ);
    }

    #[test]
    fn box_support_along_normal() {
        let mins = [-16.0, -16.0, -36.0];
        let maxs = [16.0, 16.0, 36.0];
        assert_eq!(box_min_along(&[0.0, 0.0, 1.0], &mins, &maxs), -36.0);
        assert_eq!(box_max_along(&[1.0, 0.0, 0.0], &mins, &maxs), 16.0);
        let n = [0.6, 0.8, 0.0];
        assert!((box_max_along(&n, &mins, &maxs) - (0.6 * 16.0 + 0.8 * 16.0)).abs() < 1e-4);
    }

    #[test]
    fn vector_ops() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 5.0, 6.0];
        assert_eq!(dot_product(&a, &b), 32.0);
        assert_eq!(vector_add(&a, &b), [5.0, 7.0, 9.0]);
        assert_eq!(vector_subtract(&b, &a), [3.0, 3.0, 3.0]);
    }
}
