// Copyright (C) 2023 setzer22 and contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turns the current connectivity and channels into the two output surfaces
//! an application actually renders and collides against: a set of per-material
//! `Submesh`es and one combined collision buffer. This is the terminal stage
//! of a mesh's edit lifecycle: it only reads connectivity, never mutates it,
//! and leaves the mesh `Clean` (see [`MeshState`]) when it returns.
//!
//! Every fallible step here (triangulation, plane fit, texture solve) is
//! caught per-face and degrades to "skip this face" rather than propagating
//! an error out of [`HalfEdgeMesh::rebuild`] - the rebuilder never raises.

use std::collections::{HashMap, HashSet};

use super::triangulate::{newell_plane_fit, triangulate_polygon};
use super::*;

/// Rigid transform `{position, rotation, scale}`, represented the way the
/// rest of the kernel represents geometric transforms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    pub fn point_to_world(&self, p: Vec3) -> Vec3 {
        self.matrix().transform_point3(p)
    }

    pub fn inverse(&self) -> Transform {
        let (scale, rotation, position) = self.matrix().inverse().to_scale_rotation_translation();
        Transform {
            position,
            rotation,
            scale,
        }
    }
}

/// What an [`IMaterialResolver`] returns for a compact `material_id`: an
/// opaque handle into whatever shader/surface system the caller owns, and
/// the pixel dimensions of its texture (consumed by the projection solver,
/// see `texture_params`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMaterial {
    pub local_id: i32,
    pub surface: u64,
    pub texture_dims: (u32, u32),
}

/// Maps a face's compact `material_id` to the data needed to build render
/// output. Called lazily, the first time a face carrying that id is rebuilt.
pub trait IMaterialResolver {
    fn resolve(&self, material_id: i32) -> Option<ResolvedMaterial>;
}

/// One vertex of a [`Submesh`]'s vertex buffer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderVertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub tangent: Vec3,
    pub texcoord: Vec2,
}

/// Receives the per-material render output of [`HalfEdgeMesh::rebuild`].
pub trait IRenderMesh {
    fn submesh(
        &mut self,
        vertices: &[RenderVertex],
        indices: &[u32],
        material: i32,
        bounds: (Vec3, Vec3),
        uv_density: f32,
    );
}

/// Receives the single combined collision buffer of [`HalfEdgeMesh::rebuild`].
pub trait ICollisionSink {
    fn collision_mesh(
        &mut self,
        positions: &[Vec3],
        indices: &[u32],
        per_triangle_material: &[u8],
        hull_candidates: &[Vec3],
    );
}

/// One group of triangles sharing a material. Mirrors what gets handed to
/// [`IRenderMesh::submesh`], plus the originating face of every triangle so
/// picking can map a render-side hit back to a `FaceId`.
#[derive(Debug, Clone, Default)]
pub struct Submesh {
    pub material_id: i32,
    pub vertices: Vec<RenderVertex>,
    pub indices: Vec<u32>,
    pub bounds: (Vec3, Vec3),
    pub uv_density: f32,
    /// The face that produced each triangle (`indices` chunked by 3).
    pub triangle_faces: Vec<FaceId>,
}

/// The combined collision buffer, mirroring [`ICollisionSink::collision_mesh`].
#[derive(Debug, Clone, Default)]
pub struct CollisionMesh {
    pub positions: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub per_triangle_material: Vec<u8>,
    pub hull_candidates: Vec<Vec3>,
}

/// The full output of a [`HalfEdgeMesh::rebuild`] call.
#[derive(Debug, Clone, Default)]
pub struct Model {
    pub submeshes: Vec<Submesh>,
    pub collision: CollisionMesh,
}

/// Whether the edge crossed by `edge` (connecting `a` and `b`) should
/// accumulate normals across, per the rule in `mesh/halfedge/rebuilder.rs`'s
/// module doc: `Soft` always merges, `Hard` always splits, `Default` merges
/// only when the two face normals are within the mesh's smoothing threshold.
fn edge_is_smooth(
    flag: SmoothingFlag,
    normal_a: Vec3,
    normal_b: Vec3,
    threshold_cos: f32,
) -> bool {
    match flag {
        SmoothingFlag::Hard => false,
        SmoothingFlag::Soft => true,
        SmoothingFlag::Default => normal_a.dot(normal_b) > threshold_cos + f32::EPSILON,
    }
}

/// Smoothed normal for the corner of `face` at `vertex`, reached via the
/// outgoing half-edge `h`. Walks `vertex`'s fan in both directions from
/// `face`, stopping at the first edge that doesn't qualify as smooth (a
/// `Hard` edge, an open boundary, or - for `Default` edges - too steep an
/// angle), and averages the flat normals of every face visited.
fn smoothed_corner_normal(
    conn: &MeshConnectivity,
    flat_normals: &HashMap<FaceId, Vec3>,
    smoothing: Option<&Channel<HalfEdgeId, SmoothingFlag>>,
    h: HalfEdgeId,
    face: FaceId,
    vertex: VertexId,
    threshold_cos: f32,
) -> Vec3 {
    let own_normal = flat_normals.get(&face).copied().unwrap_or(Vec3::Z);

    let Ok(fan) = conn.at_vertex(vertex).outgoing_halfedges() else {
        return own_normal;
    };
    let n = fan.len();
    let Some(idx) = fan.iter().position(|&e| e == h) else {
        return own_normal;
    };

    let face_at = |i: usize| conn.at_halfedge(fan[i]).face_or_boundary().ok().flatten();
    let flag_at = |i: usize| smoothing.map(|s| s[fan[i]]).unwrap_or_default();
    let normal_of = |f: FaceId| flat_normals.get(&f).copied().unwrap_or(Vec3::Z);

    let mut group = vec![face];
    let mut seen = HashSet::new();
    seen.insert(face);

    // Forward: cross edge `fan[j]` into the face reached by `fan[j + 1]`.
    let mut j = idx;
    for _ in 0..n {
        let (Some(cur), Some(next)) = (face_at(j), face_at((j + 1) % n)) else {
            break;
        };
        if !edge_is_smooth(flag_at(j), normal_of(cur), normal_of(next), threshold_cos) {
            break;
        }
        if !seen.insert(next) {
            break;
        }
        group.push(next);
        j = (j + 1) % n;
    }

    // Backward: cross edge `fan[j - 1]` into the face reached by `fan[j - 1]`'s
    // predecessor.
    let mut j = idx;
    for _ in 0..n {
        let prev = (j + n - 1) % n;
        let (Some(prev_face), Some(cur)) = (face_at(prev), face_at(j)) else {
            break;
        };
        if !edge_is_smooth(flag_at(prev), normal_of(prev_face), normal_of(cur), threshold_cos) {
            break;
        }
        if !seen.insert(prev_face) {
            break;
        }
        group.push(prev_face);
        j = prev;
    }

    let sum: Vec3 = group.iter().map(|f| normal_of(*f)).sum();
    sum.normalize_or_zero()
}

/// Tangent for a corner: the face's projection U-axis flattened onto the
/// plane perpendicular to `normal`, flipped so `cross(normal, tangent)`
/// agrees with the V-axis (the bitangent).
fn corner_tangent(params: &TextureParams, normal: Vec3) -> Vec3 {
    let flattened = params.u_axis - normal * normal.dot(params.u_axis);
    let tangent = flattened.normalize_or_zero();
    if tangent == Vec3::ZERO {
        return tangent;
    }
    if normal.cross(tangent).dot(params.v_axis) < 0.0 {
        -tangent
    } else {
        tangent
    }
}

/// The value at `fraction` counting down from the top of an ascending-sorted
/// sample set, e.g. `fraction = 0.1` is the 10th-percentile-from-top sample
/// `uv_density` is built from.
fn percentile_from_top(sorted_ascending: &[f32], fraction: f32) -> f32 {
    let Some(&last) = sorted_ascending.last() else {
        return 0.0;
    };
    let n = sorted_ascending.len();
    let from_top = ((n as f32) * fraction).floor() as usize;
    let idx = n.saturating_sub(1).saturating_sub(from_top);
    sorted_ascending.get(idx).copied().unwrap_or(last)
}

impl HalfEdgeMesh {
    /// Reads the per-face projection parameters without materializing the
    /// texture channels, falling back to [`TextureParams::default`] the same
    /// way [`HalfEdgeMesh::face_texture_params`] does.
    fn read_texture_params(&self, face: FaceId) -> TextureParams {
        let read = |name: &str| -> Option<Vec3> {
            let ch = self.channels.channel_id::<FaceId, Vec3>(name)?;
            self.channels.read_channel(ch).ok().map(|c| c[face])
        };
        let read_v2 = |name: &str| -> Option<Vec2> {
            let ch = self.channels.channel_id::<FaceId, Vec2>(name)?;
            self.channels.read_channel(ch).ok().map(|c| c[face])
        };

        match (read("texture_u_axis"), read("texture_v_axis")) {
            (Some(u_axis), Some(v_axis)) if u_axis != Vec3::ZERO && v_axis != Vec3::ZERO => {
                TextureParams {
                    u_axis,
                    v_axis,
                    scale: read_v2("texture_scale").unwrap_or(Vec2::splat(0.25)),
                    offset: read_v2("texture_offset").unwrap_or(Vec2::ZERO),
                }
            }
            _ => TextureParams::default(),
        }
    }

    /// Groups faces by `material_id`, triangulates each, computes smoothed
    /// per-corner normals and tangents, and emits the resulting submeshes and
    /// collision buffer to `render_sink`/`collision_sink`. Returns the same
    /// data as an owned [`Model`], additionally tagged with the originating
    /// `FaceId` of every triangle for picking.
    ///
    /// Degenerate input (a face that fails to triangulate, a triangle with
    /// ~zero world-space area) is silently dropped; this call never returns
    /// an error.
    #[profiling::function]
    pub fn rebuild(
        &self,
        resolver: Option<&dyn IMaterialResolver>,
        render_sink: &mut dyn IRenderMesh,
        collision_sink: &mut dyn ICollisionSink,
    ) -> Model {
        let conn = self.read_connectivity();
        let positions = self.read_positions();

        let material_guard = self
            .channels
            .channel_id::<FaceId, i32>("material_id")
            .and_then(|ch| self.channels.read_channel(ch).ok());
        let smoothing_guard = self
            .channels
            .channel_id::<HalfEdgeId, SmoothingFlag>("smoothing_flag")
            .and_then(|ch| self.channels.read_channel(ch).ok());
        let smoothing = smoothing_guard.as_deref();

        let threshold_cos = self.smoothing_threshold_deg.to_radians().cos();

        let flat_normals: HashMap<FaceId, Vec3> = conn
            .iter_faces()
            .filter_map(|(f, _)| {
                let verts = conn.face_vertices(f);
                let pts: SVec<Vec3> = verts.iter().map(|&v| positions[v]).collect();
                newell_plane_fit(&pts).map(|(normal, _, _)| (f, normal))
            })
            .collect();

        let mut groups: HashMap<i32, Vec<FaceId>> = HashMap::new();
        for (f, _) in conn.iter_faces() {
            let mat = material_guard.as_ref().map(|c| c[f]).unwrap_or(0);
            groups.entry(mat).or_default().push(f);
        }

        let mut dims_cache: HashMap<i32, (f32, f32)> = HashMap::new();
        let mut submeshes = Vec::new();
        let mut collision = CollisionMesh::default();

        for (material_id, faces) in groups {
            let dims = *dims_cache
                .entry(material_id)
                .or_insert_with(|| self.face_texture_dims(material_id, resolver));

            let mut vertices: Vec<RenderVertex> = Vec::new();
            let mut indices: Vec<u32> = Vec::new();
            let mut triangle_faces: Vec<FaceId> = Vec::new();
            let mut bounds_min = Vec3::splat(f32::MAX);
            let mut bounds_max = Vec3::splat(f32::MIN);
            let mut uv_density_samples: Vec<f32> = Vec::new();

            for face in faces {
                let face_verts = conn.face_vertices(face);
                if face_verts.len() < 3 {
                    continue;
                }
                let face_edges = conn.face_edges(face);
                let world_positions: SVec<Vec3> =
                    face_verts.iter().map(|&v| positions[v]).collect();

                let tris = triangulate_polygon(&world_positions);
                if tris.is_empty() || tris.len() % 3 != 0 {
                    continue;
                }

                let params = self.read_texture_params(face);
                let uvs = conn.coords_from_params(&positions, face, &params, dims);

                let corner_normals: SVec<Vec3> = face_edges
                    .iter()
                    .zip(face_verts.iter())
                    .map(|(&h, &v)| {
                        smoothed_corner_normal(
                            &conn,
                            &flat_normals,
                            smoothing,
                            h,
                            face,
                            v,
                            threshold_cos,
                        )
                    })
                    .collect();
                let corner_tangents: SVec<Vec3> = corner_normals
                    .iter()
                    .map(|&n| corner_tangent(&params, n))
                    .collect();

                let base = vertices.len() as u32;
                for (i, &v) in face_verts.iter().enumerate() {
                    let p = positions[v];
                    bounds_min = bounds_min.min(p);
                    bounds_max = bounds_max.max(p);
                    vertices.push(RenderVertex {
                        position: p,
                        normal: corner_normals[i],
                        tangent: corner_tangents[i],
                        texcoord: uvs[i],
                    });
                }

                for tri in tris.chunks_exact(3) {
                    let (a, b, c) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
                    let (pa, pb, pc) = (world_positions[a], world_positions[b], world_positions[c]);
                    let cross = (pb - pa).cross(pc - pa);
                    let area_world = cross.length() * 0.5;
                    if area_world < 1e-10 {
                        // Triangle is valid in UV space but has ~zero world area;
                        // not worth rendering or colliding against.
                        continue;
                    }

                    indices.push(base + tri[0]);
                    indices.push(base + tri[1]);
                    indices.push(base + tri[2]);
                    triangle_faces.push(face);

                    let (ua, ub, uc) = (uvs[a], uvs[b], uvs[c]);
                    let area_uv = (ub - ua).perp_dot(uc - ua).abs() * 0.5;
                    if area_uv > 1e-12 {
                        uv_density_samples.push((area_world / area_uv).sqrt());
                    }
                }
            }

            if indices.is_empty() {
                continue;
            }

            uv_density_samples
                .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let uv_density = percentile_from_top(&uv_density_samples, 0.1);
            let bounds = (bounds_min, bounds_max);

            render_sink.submesh(&vertices, &indices, material_id, bounds, uv_density);

            let collision_base = collision.positions.len() as u32;
            collision.positions.extend(vertices.iter().map(|v| v.position));
            for tri in indices.chunks_exact(3) {
                collision.indices.push(collision_base + tri[0]);
                collision.indices.push(collision_base + tri[1]);
                collision.indices.push(collision_base + tri[2]);
                collision.per_triangle_material.push((material_id & 0xff) as u8);
            }
            collision
                .hull_candidates
                .extend(vertices.iter().map(|v| v.position));

            submeshes.push(Submesh {
                material_id,
                vertices,
                indices,
                bounds,
                uv_density,
                triangle_faces,
            });
        }

        collision_sink.collision_mesh(
            &collision.positions,
            &collision.indices,
            &collision.per_triangle_material,
            &collision.hull_candidates,
        );

        drop(conn);
        drop(positions);
        self.mark_clean();

        Model {
            submeshes,
            collision,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct RecordingRenderSink {
        submeshes: Vec<(i32, usize, f32)>,
    }
    impl IRenderMesh for RecordingRenderSink {
        fn submesh(
            &mut self,
            vertices: &[RenderVertex],
            indices: &[u32],
            material: i32,
            _bounds: (Vec3, Vec3),
            uv_density: f32,
        ) {
            self.submeshes.push((material, indices.len(), uv_density));
            assert!(!vertices.is_empty());
        }
    }

    #[derive(Default)]
    struct RecordingCollisionSink {
        triangle_count: usize,
    }
    impl ICollisionSink for RecordingCollisionSink {
        fn collision_mesh(
            &mut self,
            _positions: &[Vec3],
            indices: &[u32],
            per_triangle_material: &[u8],
            _hull_candidates: &[Vec3],
        ) {
            self.triangle_count = indices.len() / 3;
            assert_eq!(per_triangle_material.len(), self.triangle_count);
        }
    }

    fn two_quads() -> HalfEdgeMesh {
        HalfEdgeMesh::build_from_polygons(
            &[
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(2.0, 0.0, 0.0),
                Vec3::new(2.0, 1.0, 0.0),
            ],
            &[[0u32, 1, 2, 3], [1, 4, 5, 2]],
        )
        .unwrap()
    }

    #[test]
    fn test_rebuild_groups_submeshes_by_material() {
        let mut mesh = two_quads();
        let second_face = mesh.read_connectivity().iter_faces().nth(1).unwrap().0;
        euler_ops::set_face_material(&mut mesh, second_face, 1).unwrap();

        let mut render = RecordingRenderSink::default();
        let mut collision = RecordingCollisionSink::default();
        let model = mesh.rebuild(None, &mut render, &mut collision);

        assert_eq!(model.submeshes.len(), 2);
        let mut materials: Vec<i32> = model.submeshes.iter().map(|s| s.material_id).collect();
        materials.sort();
        assert_eq!(materials, vec![0, 1]);
        assert_eq!(collision.triangle_count, 4);
    }

    #[test]
    fn test_rebuild_drops_degenerate_face() {
        let mesh = HalfEdgeMesh::build_from_polygons(
            &[
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(2.0, 0.0, 0.0),
                Vec3::new(3.0, 0.0, 0.0),
                Vec3::new(4.0, 0.0, 0.0),
            ],
            &[[0u32, 1, 2, 3], [4, 5, 6]],
        )
        .unwrap();

        let mut render = RecordingRenderSink::default();
        let mut collision = RecordingCollisionSink::default();
        let model = mesh.rebuild(None, &mut render, &mut collision);

        // The collinear triangle contributes nothing; only the quad survives.
        assert_eq!(model.submeshes.len(), 1);
        assert_eq!(model.submeshes[0].indices.len(), 6);
    }

    #[test]
    fn test_rebuild_soft_edge_merges_normals_across_steep_fold() {
        // Two triangles folded at a right angle along the shared edge (1,2).
        let mut mesh = HalfEdgeMesh::build_from_polygons(
            &[
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 1.0),
            ],
            &[[0u32, 1, 2], [0, 2, 3]],
        )
        .unwrap();

        // The two triangles share exactly one full-edge (the diagonal between
        // the quad's opposite corners); find either of its two half-edges.
        let shared = {
            let conn = mesh.read_connectivity();
            conn.iter_halfedges()
                .map(|(h, _)| h)
                .find(|&h| conn.at_halfedge(h).twin().try_end().is_ok())
                .unwrap()
        };

        euler_ops::set_edge_smoothing(&mut mesh, shared, SmoothingFlag::Soft).unwrap();

        let mut render = RecordingRenderSink::default();
        let mut collision = RecordingCollisionSink::default();
        let model = mesh.rebuild(None, &mut render, &mut collision);

        assert_eq!(model.submeshes.len(), 1);
        let normals: Vec<Vec3> = model.submeshes[0].vertices.iter().map(|v| v.normal).collect();
        // Every corner should share the same averaged normal once merged.
        for n in &normals[1..] {
            assert!((*n - normals[0]).length() < 1e-4);
        }
    }
}
