// Copyright (C) 2023 setzer22 and contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ear-clip triangulation, plane fitting and small polygon/line primitives
//! used by the texture solver and the rebuilder.

use super::*;

/// The axis whose corresponding plane a polygon's vertices get projected onto
/// before 2D triangulation, chosen as the axis most aligned with the
/// polygon's normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DominantAxis {
    X,
    Y,
    Z,
}

impl DominantAxis {
    pub fn from_normal(normal: Vec3) -> Self {
        let a = normal.abs();
        if a.x >= a.y && a.x >= a.z {
            DominantAxis::X
        } else if a.y >= a.x && a.y >= a.z {
            DominantAxis::Y
        } else {
            DominantAxis::Z
        }
    }

    /// Projects a 3d point onto this axis' plane, producing 2d coordinates.
    pub fn project(&self, p: Vec3) -> [f64; 2] {
        match self {
            DominantAxis::X => [p.y as f64, p.z as f64],
            DominantAxis::Y => [p.x as f64, p.z as f64],
            DominantAxis::Z => [p.x as f64, p.y as f64],
        }
    }
}

/// Fits a plane to a (possibly non-planar) polygon using Newell's method:
/// the normal is accumulated from consecutive edge cross products and the
/// centroid is the vertex mean. Returns `(normal, centroid, distance)` where
/// `distance` is the signed plane distance from the origin along `normal`.
///
/// Returns `None` if the polygon has fewer than 3 vertices or the
/// accumulated normal is (numerically) zero-length.
pub fn newell_plane_fit(verts: &[Vec3]) -> Option<(Vec3, Vec3, f32)> {
    if verts.len() < 3 {
        return None;
    }

    let mut normal = Vec3::ZERO;
    let mut centroid = Vec3::ZERO;
    for (a, b) in verts.iter().copied().circular_tuple_windows() {
        normal += Vec3::new(
            (a.y - b.y) * (a.z + b.z),
            (a.z - b.z) * (a.x + b.x),
            (a.x - b.x) * (a.y + b.y),
        );
        centroid += a;
    }
    centroid /= verts.len() as f32;

    // Tiny epsilon added to the length to avoid a zero-division on perfectly
    // degenerate (zero-area) input.
    let len = normal.length() + 1e-8;
    if len < 1e-6 {
        return None;
    }
    let normal = normal / len;
    let distance = -centroid.dot(normal);
    Some((normal, centroid, distance))
}

/// Ear-clip triangulation of an (approximately) planar polygon given as
/// world-space 3d positions. Projects onto whichever axis-aligned plane is
/// most aligned with the fitted normal, then hands the 2d ring to `earcutr`.
///
/// Returns index triples into `verts` (`3*(n-2)` indices on success) or an
/// empty vector if the input is degenerate (fewer than 3 vertices, or a
/// zero-length normal).
#[profiling::function]
pub fn triangulate_polygon(verts: &[Vec3]) -> Vec<u32> {
    if verts.len() < 3 {
        return Vec::new();
    }

    let Some((normal, _, _)) = newell_plane_fit(verts) else {
        return Vec::new();
    };
    if verts.len() == 3 {
        return vec![0, 1, 2];
    }
    let axis = DominantAxis::from_normal(normal);

    let flat: Vec<f64> = verts.iter().flat_map(|v| axis.project(*v)).collect();
    match earcutr::earcut(&flat, &[], 2) {
        Ok(indices) => indices.into_iter().map(|i| i as u32).collect(),
        Err(_) => Vec::new(),
    }
}

/// Clips a simple polygon against an infinite line defined by a segment
/// `(a, b)` in the polygon's own plane, keeping the side the polygon's
/// centroid falls on (Sutherland-Hodgman, single edge).
pub fn clip_polygon_by_segment(verts: &[Vec3], normal: Vec3, a: Vec3, b: Vec3) -> Vec<Vec3> {
    if verts.len() < 3 {
        return Vec::new();
    }
    let line_dir = (b - a).normalize_or_zero();
    let line_normal = normal.cross(line_dir);
    let side = |p: Vec3| (p - a).dot(line_normal);

    let mut out = Vec::with_capacity(verts.len() + 1);
    for (cur, next) in verts.iter().copied().circular_tuple_windows() {
        let cur_side = side(cur);
        let next_side = side(next);
        if cur_side >= 0.0 {
            out.push(cur);
        }
        if (cur_side >= 0.0) != (next_side >= 0.0) {
            let t = cur_side / (cur_side - next_side);
            out.push(cur.lerp(next, t));
        }
    }
    out
}

/// Closest point on segment `[a, b]` to `p`.
pub fn closest_point_on_segment(p: Vec3, a: Vec3, b: Vec3) -> Vec3 {
    let ab = b - a;
    let len_sq = ab.length_squared();
    if len_sq < 1e-12 {
        return a;
    }
    let t = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    a + ab * t
}

/// Closest pair of points between two line segments `(p1, q1)` and `(p2,
/// q2)`, returned as the two parameters `(s1, s2)` along each segment.
/// Fails when the segments are (near-)parallel, matching the documented
/// `OutOfRange`-adjacent degenerate case.
pub fn closest_segment_segment(p1: Vec3, q1: Vec3, p2: Vec3, q2: Vec3) -> Result<(f32, f32)> {
    let d1 = q1 - p1;
    let d2 = q2 - p2;
    let r = p1 - p2;

    let a = d1.dot(d1);
    let e = d2.dot(d2);
    let f = d2.dot(r);

    if a < 1e-12 && e < 1e-12 {
        return Ok((0.0, 0.0));
    }
    if a < 1e-12 {
        return Ok((0.0, (f / e).clamp(0.0, 1.0)));
    }
    let c = d1.dot(r);
    if e < 1e-12 {
        return Ok(((-c / a).clamp(0.0, 1.0), 0.0));
    }

    let b = d1.dot(d2);
    let denom = a * e - b * b;
    if denom.abs() < 1e-6 {
        bail!("closest_segment_segment: segments are parallel");
    }

    let s = ((b * f - c * e) / denom).clamp(0.0, 1.0);
    let t = (b * s + f) / e;
    let t = t.clamp(0.0, 1.0);
    // Recompute s with the clamped t to stay on-segment.
    let s = ((b * t - c) / a).clamp(0.0, 1.0);
    Ok((s, t))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_triangulate_quad() {
        let verts = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ];
        let indices = triangulate_polygon(&verts);
        assert_eq!(indices.len(), 6);
    }

    #[test]
    fn test_triangulate_degenerate() {
        // All three points collinear: Newell normal is zero.
        let verts = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
        ];
        let indices = triangulate_polygon(&verts);
        assert_eq!(indices.len(), 0);
    }

    #[test]
    fn test_newell_plane_fit_unit_square() {
        let verts = [
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(1.0, 1.0, 1.0),
            Vec3::new(0.0, 1.0, 1.0),
        ];
        let (normal, centroid, _) = newell_plane_fit(&verts).unwrap();
        assert!(normal.dot(Vec3::Z).abs() > 0.99);
        assert!((centroid - Vec3::new(0.5, 0.5, 1.0)).length() < 1e-5);
    }

    #[test]
    fn test_closest_point_on_segment_clamps() {
        let p = closest_point_on_segment(Vec3::new(5.0, 0.0, 0.0), Vec3::ZERO, Vec3::X);
        assert_eq!(p, Vec3::X);
    }
}
