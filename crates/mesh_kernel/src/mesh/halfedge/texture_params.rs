// Copyright (C) 2023 setzer22 and contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bidirectional link between per-face projection parameters (U-axis, V-axis,
//! scale, offset) and per-corner UV coordinates.

use super::triangulate::newell_plane_fit;
use super::*;

/// One of the six axis-aligned box-projection orientations used by
/// `align_to_grid`/`align_to_face`. Each row is `(normal, right, down)`.
const ORIENTATION_TABLE: [(Vec3, Vec3, Vec3); 6] = [
    (Vec3::Z, Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, -1.0, 0.0)), // +Z
    (
        Vec3::new(0.0, 0.0, -1.0),
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(0.0, -1.0, 0.0),
    ), // -Z
    (
        Vec3::new(0.0, -1.0, 0.0),
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(0.0, 0.0, -1.0),
    ), // -Y
    (Vec3::Y, Vec3::new(-1.0, 0.0, 0.0), Vec3::new(0.0, 0.0, -1.0)), // +Y
    (
        Vec3::new(-1.0, 0.0, 0.0),
        Vec3::new(0.0, -1.0, 0.0),
        Vec3::new(0.0, 0.0, -1.0),
    ), // -X
    (Vec3::X, Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, -1.0)), // +X
];

fn best_orientation(normal: Vec3) -> (Vec3, Vec3) {
    ORIENTATION_TABLE
        .iter()
        .max_by(|(n1, ..), (n2, ..)| {
            n1.dot(normal)
                .partial_cmp(&n2.dot(normal))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(_, right, down)| (*right, *down))
        .expect("orientation table is non-empty")
}

/// Justification mode for `justify`: which side of the `(W, H)` texture tile
/// the face's UV bounding box should be shifted to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Justify {
    None,
    Top,
    Bottom,
    Left,
    Right,
    Center,
    Fit,
    FitX,
    FitY,
}

/// Per-face projection parameters: a world-space orthogonal basis plus the
/// scale/offset that map a dotted world coordinate into normalized UV space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureParams {
    pub u_axis: Vec3,
    pub v_axis: Vec3,
    pub scale: Vec2,
    pub offset: Vec2,
}

impl Default for TextureParams {
    fn default() -> Self {
        Self {
            u_axis: Vec3::X,
            v_axis: Vec3::Y,
            scale: Vec2::splat(0.25),
            offset: Vec2::ZERO,
        }
    }
}

impl MeshConnectivity {
    /// `coords_from_params`: for each corner of `face`, project its
    /// world-space position through `params` and normalize by the texture
    /// dimensions.
    pub fn coords_from_params(
        &self,
        positions: &Positions,
        face: FaceId,
        params: &TextureParams,
        dims: (f32, f32),
    ) -> SVec<Vec2> {
        let (w, h) = (dims.0.max(1.0), dims.1.max(1.0));
        self.face_vertices(face)
            .iter()
            .map(|&v| {
                let p = positions[v];
                let u = params.u_axis.dot(p) / params.scale.x + params.offset.x;
                let v = params.v_axis.dot(p) / params.scale.y + params.offset.y;
                Vec2::new(u / w, v / h)
            })
            .collect()
    }

    /// `params_from_coords`: inverts `coords_from_params` given explicit
    /// corner UVs, choosing the best-conditioned triangle of corners.
    pub fn params_from_coords(
        &self,
        positions: &Positions,
        face: FaceId,
        uvs: &[Vec2],
        dims: (f32, f32),
    ) -> Result<TextureParams> {
        let verts = self.face_vertices(face);
        if verts.len() < 3 || uvs.len() != verts.len() {
            bail!("params_from_coords: face and uv array length mismatch");
        }
        let (w, h) = (dims.0.max(1.0), dims.1.max(1.0));
        let positions: SVec<Vec3> = verts.iter().map(|&v| positions[v]).collect();

        // Pick the corner triple maximizing |ab|^2 * |ac|^2 * (1 - |a_hat . c_hat|)
        let n = positions.len();
        let mut best = (0usize, 1usize, 2usize);
        let mut best_score = f32::MIN;
        for a in 0..n {
            for b in 0..n {
                if b == a {
                    continue;
                }
                for c in 0..n {
                    if c == a || c == b {
                        continue;
                    }
                    let ab = positions[b] - positions[a];
                    let ac = positions[c] - positions[a];
                    let ab_hat = ab.normalize_or_zero();
                    let ac_hat = ac.normalize_or_zero();
                    let score =
                        ab.length_squared() * ac.length_squared() * (1.0 - ab_hat.dot(ac_hat).abs());
                    if score > best_score {
                        best_score = score;
                        best = (a, b, c);
                    }
                }
            }
        }
        let (ia, ib, ic) = best;

        let e0 = positions[ib] - positions[ia];
        let e1 = positions[ic] - positions[ia];
        let uv_a = uvs[ia];
        let t00 = uvs[ib].x - uv_a.x;
        let t01 = uvs[ib].y - uv_a.y;
        let t10 = uvs[ic].x - uv_a.x;
        let t11 = uvs[ic].y - uv_a.y;

        let e_det = t00 * t11 - t10 * t01;
        if e_det.abs() < 1e-8 {
            bail!("params_from_coords: degenerate uvs");
        }

        let u_world = (t11 * e0 - t01 * e1) / e_det;
        let v_world = (-t10 * e0 + t00 * e1) / e_det;

        // `u_world`/`v_world` are texture-to-world gradients and generally
        // not orthogonal, so dotting a world position against them directly
        // would not recover the UV back out. Build M = [U, V, U×V]^T (the
        // third row fills out the rank so M is invertible even though the
        // texture basis only spans the face plane), invert it, and read its
        // U/V rows back as the world-to-texture basis `coords_from_params`
        // expects to dot against.
        let w_world = u_world.cross(v_world);
        let m = Mat3::from_cols(u_world, v_world, w_world).transpose();
        if m.determinant().abs() < 1e-8 {
            bail!("params_from_coords: degenerate texture basis");
        }
        let m_inv = m.inverse().transpose();
        let u_row = m_inv.x_axis;
        let v_row = m_inv.y_axis;

        let u_len = u_row.length().max(1e-8);
        let v_len = v_row.length().max(1e-8);
        let u_norm = u_row / u_len;
        let v_norm = v_row / v_len;

        let scale = Vec2::new(1.0 / (w * u_len), 1.0 / (h * v_len));

        let frac = |x: f32| x - x.floor();
        let offset_u = frac(u_norm.dot(positions[ia]) * u_len) - frac(uv_a.x);
        let offset_v = frac(v_norm.dot(positions[ia]) * v_len) - frac(uv_a.y);
        let offset = Vec2::new(offset_u * w, offset_v * h);

        Ok(TextureParams {
            u_axis: u_norm,
            v_axis: v_norm,
            scale,
            offset,
        })
    }

    /// `align_to_grid`: snap `params` to the orientation whose axis best
    /// matches the face's Newell normal, with a fixed 0.25 scale and zero
    /// offset.
    pub fn align_to_grid(&self, positions: &Positions, face: FaceId) -> Result<TextureParams> {
        let verts: SVec<Vec3> = self
            .face_vertices(face)
            .iter()
            .map(|&v| positions[v])
            .collect();
        let (normal, ..) = newell_plane_fit(&verts).ok_or_else(|| anyhow!("degenerate face"))?;
        let (right, down) = best_orientation(normal);
        Ok(TextureParams {
            u_axis: right,
            v_axis: down,
            scale: Vec2::splat(0.25),
            offset: Vec2::ZERO,
        })
    }

    /// `align_to_face`: like `align_to_grid`, but re-derives U/V directly
    /// from the face's own normal instead of the table axis.
    pub fn align_to_face(&self, positions: &Positions, face: FaceId) -> Result<TextureParams> {
        let verts: SVec<Vec3> = self
            .face_vertices(face)
            .iter()
            .map(|&v| positions[v])
            .collect();
        let (normal, ..) = newell_plane_fit(&verts).ok_or_else(|| anyhow!("degenerate face"))?;
        let (_, down) = best_orientation(normal);
        let u = normal.cross(down).normalize_or_zero();
        let v = u.cross(normal).normalize_or_zero();
        Ok(TextureParams {
            u_axis: u,
            v_axis: v,
            scale: Vec2::splat(0.25),
            offset: Vec2::ZERO,
        })
    }

    /// Shifts (and, for `Fit*` modes, rescales) `params.offset` so the face's
    /// UV bounding box touches the requested side of the `(W, H)` tile.
    pub fn justify(
        &self,
        positions: &Positions,
        face: FaceId,
        params: &mut TextureParams,
        dims: (f32, f32),
        mode: Justify,
        extents: Vec2,
    ) {
        let coords = self.coords_from_params(positions, face, params, dims);
        if coords.is_empty() {
            return;
        }
        let min = coords
            .iter()
            .copied()
            .reduce(|a, b| a.min(b))
            .unwrap_or_default();
        let max = coords
            .iter()
            .copied()
            .reduce(|a, b| a.max(b))
            .unwrap_or_default();
        let size = (max - min).max(Vec2::splat(1e-6));

        match mode {
            Justify::None => {}
            Justify::Top => params.offset.y -= min.y,
            Justify::Bottom => params.offset.y -= max.y - extents.y,
            Justify::Left => params.offset.x -= min.x,
            Justify::Right => params.offset.x -= max.x - extents.x,
            Justify::Center => {
                params.offset += (extents - size) * 0.5 - min;
            }
            Justify::Fit => {
                params.scale *= size / extents.max(Vec2::splat(1e-6));
                params.offset -= min;
            }
            Justify::FitX => {
                params.scale.x *= size.x / extents.x.max(1e-6);
                params.offset.x -= min.x;
            }
            Justify::FitY => {
                params.scale.y *= size.y / extents.y.max(1e-6);
                params.offset.y -= min.y;
            }
        }
    }
}

impl HalfEdgeMesh {
    /// Reads the per-face projection parameters, falling back to
    /// [`TextureParams::default`] for faces that never had one set.
    pub fn face_texture_params(&mut self, face: FaceId) -> TextureParams {
        let u = self.channels.ensure_channel::<FaceId, Vec3>("texture_u_axis");
        let v = self.channels.ensure_channel::<FaceId, Vec3>("texture_v_axis");
        let scale = self.channels.ensure_channel::<FaceId, Vec2>("texture_scale");
        let offset = self
            .channels
            .ensure_channel::<FaceId, Vec2>("texture_offset");

        let u_axis = self.channels.read_channel(u).unwrap()[face];
        let v_axis = self.channels.read_channel(v).unwrap()[face];
        let scale = self.channels.read_channel(scale).unwrap()[face];
        let offset = self.channels.read_channel(offset).unwrap()[face];

        if u_axis == Vec3::ZERO || v_axis == Vec3::ZERO {
            TextureParams::default()
        } else {
            TextureParams {
                u_axis,
                v_axis,
                scale,
                offset,
            }
        }
    }

    pub fn set_face_texture_params(&mut self, face: FaceId, params: TextureParams) {
        let u = self.channels.ensure_channel::<FaceId, Vec3>("texture_u_axis");
        let v = self.channels.ensure_channel::<FaceId, Vec3>("texture_v_axis");
        let scale = self.channels.ensure_channel::<FaceId, Vec2>("texture_scale");
        let offset = self
            .channels
            .ensure_channel::<FaceId, Vec2>("texture_offset");

        self.channels.write_channel(u).unwrap()[face] = params.u_axis;
        self.channels.write_channel(v).unwrap()[face] = params.v_axis;
        self.channels.write_channel(scale).unwrap()[face] = params.scale;
        self.channels.write_channel(offset).unwrap()[face] = params.offset;
    }

    /// Texture dimensions in use for the given material. The kernel has no
    /// material table of its own (that's `IMaterialResolver`'s job); absent a
    /// resolver, every material defaults to 512x512.
    pub fn face_texture_dims(&self, material_id: i32, resolver: Option<&dyn super::rebuilder::IMaterialResolver>) -> (f32, f32) {
        resolver
            .and_then(|r| r.resolve(material_id))
            .map(|resolved| (resolved.texture_dims.0.max(1) as f32, resolved.texture_dims.1.max(1) as f32))
            .unwrap_or((512.0, 512.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_align_to_grid_quad_facing_z() {
        let mesh = HalfEdgeMesh::build_from_polygons(
            &[
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            &[[0u32, 1, 2, 3]],
        )
        .unwrap();
        let conn = mesh.read_connectivity();
        let face = conn.iter_faces().next().unwrap().0;
        let positions = mesh.read_positions();
        let params = conn.align_to_grid(&positions, face).unwrap();
        assert_eq!(params.scale, Vec2::splat(0.25));
        assert_eq!(params.offset, Vec2::ZERO);
    }

    #[test]
    fn test_texture_round_trip() {
        let mesh = HalfEdgeMesh::build_from_polygons(
            &[
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            &[[0u32, 1, 2, 3]],
        )
        .unwrap();
        let conn = mesh.read_connectivity();
        let positions = mesh.read_positions();
        let face = conn.iter_faces().next().unwrap().0;

        let params = conn.align_to_grid(&positions, face).unwrap();
        let dims = (512.0, 512.0);
        let coords = conn.coords_from_params(&positions, face, &params, dims);
        let recovered = conn
            .params_from_coords(&positions, face, &coords, dims)
            .unwrap();

        assert!((recovered.u_axis - params.u_axis).length() < 1e-3);
        assert!((recovered.v_axis - params.v_axis).length() < 1e-3);
        assert!((recovered.scale - params.scale).length() < 1e-3);
    }

    #[test]
    fn test_texture_round_trip_non_orthogonal_basis() {
        // A sheared, non-axis-aligned U/V basis: U and V are not
        // perpendicular, which is exactly the case the raw 2x2 solve in
        // `params_from_coords` gets wrong without the M = [U,V,UxV]^T
        // invert-and-read-rows step.
        let mesh = HalfEdgeMesh::build_from_polygons(
            &[
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            &[[0u32, 1, 2, 3]],
        )
        .unwrap();
        let conn = mesh.read_connectivity();
        let positions = mesh.read_positions();
        let face = conn.iter_faces().next().unwrap().0;

        let params = TextureParams {
            u_axis: Vec3::new(1.0, 0.0, 0.0),
            v_axis: Vec3::new(0.6, 0.8, 0.0),
            scale: Vec2::new(0.3, 0.4),
            offset: Vec2::new(0.1, -0.2),
        };
        let dims = (512.0, 512.0);
        let coords = conn.coords_from_params(&positions, face, &params, dims);
        let recovered = conn
            .params_from_coords(&positions, face, &coords, dims)
            .unwrap();

        let recovered_coords = conn.coords_from_params(&positions, face, &recovered, dims);
        for (a, b) in coords.iter().zip(recovered_coords.iter()) {
            assert!((*a - *b).length() < 1e-3, "{:?} vs {:?}", a, b);
        }
    }
}
