// Copyright (C) 2023 setzer22 and contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{anyhow, bail};
use smallvec::SmallVec;

use crate::prelude::*;

/// Divides an edge, creating a vertex in between and a new pair of halfedges.
///
/// ## Id Stability
/// Let (v, w) the (src, dst) endpoints of h, and x the new vertex id. It is
/// guaranteed that on the new mesh, the halfedge "h" will remain on the second
/// half of the edge, that is, from x to w. The new edge will go from v to x.
/// Note that this is done in combination with the chamfer operation, whose
/// stability depends on this behavior.
pub fn divide_edge(
    mesh: &mut MeshConnectivity,
    positions: &mut Positions,
    h: HalfEdgeId,
    interpolation_factor: f32,
) -> Result<VertexId> {
    // Select the necessary data elements
    let h_l = h;
    let h_r = mesh.at_halfedge(h_l).twin().try_end()?;
    let h_l_prev = mesh.at_halfedge(h_l).previous().try_end()?;
    let h_r_next = mesh.at_halfedge(h_r).next().try_end()?;
    let f_l = mesh.at_halfedge(h_l).face().try_end().ok();
    let f_r = mesh.at_halfedge(h_r).face().try_end().ok();
    let (v, w) = mesh.at_halfedge(h).src_dst_pair()?;

    // Calculate the new vertex position
    let v_pos = positions[v];
    let w_pos = positions[w];
    let pos = v_pos.lerp(w_pos, interpolation_factor);

    // Allocate new elements
    let x = mesh.alloc_vertex(positions, pos, None);
    let h_l_2 = mesh.alloc_halfedge(HalfEdge::default());
    let h_r_2 = mesh.alloc_halfedge(HalfEdge::default());

    // --- Update connectivity ---

    // Next pointers
    mesh[h_l_2].next = Some(h_l);
    mesh[h_l_prev].next = Some(h_l_2);
    mesh[h_r].next = Some(h_r_2);
    mesh[h_r_2].next = Some(h_r_next);

    // Twin pointers
    mesh[h_l_2].twin = Some(h_r_2);
    mesh[h_r_2].twin = Some(h_l_2);
    mesh[h_l].twin = Some(h_r);
    mesh[h_r].twin = Some(h_l);

    // Vertex pointers
    mesh[h_l].vertex = Some(x);
    mesh[h_r].vertex = Some(w);
    mesh[h_r_2].vertex = Some(x);
    mesh[h_l_2].vertex = Some(v);

    // Face pointers: May be None for boundary
    mesh[h_l_2].face = f_l;
    mesh[h_r_2].face = f_r;

    mesh[x].halfedge = Some(h_l);
    mesh[v].halfedge = Some(h_l_2);

    Ok(x)
}

/// Cuts a face by creating a new edge between vertices `v` and `w`. The
/// vertices must share a face, but not an edge.
pub fn cut_face(
    mesh: &mut halfedge::MeshConnectivity,
    v: VertexId,
    w: VertexId,
) -> Result<HalfEdgeId> {
    let face = mesh
        .at_vertex(v)
        .adjacent_faces()?
        .into_iter()
        .find(|f| mesh.face_vertices(*f).contains(&w))
        .ok_or_else(|| anyhow!("cut_face: v and w must share a face"))?;

    if mesh.at_vertex(v).halfedge_to(w).try_end().is_ok() {
        bail!("cut_face: v and w cannot share an edge")
    }

    let face_halfedges = mesh.face_edges(face);
    if face_halfedges.len() <= 3 {
        bail!("cut_face: cut face only works for quads or higher")
    }

    mesh.add_debug_vertex(v, DebugMark::red("v"));
    mesh.add_debug_vertex(w, DebugMark::red("w"));

    /*
    for h in mesh.at_face(face).halfedges()? {
        mesh.add_debug_halfedge(h, DebugMark::green(""));
    }
    */

    let v_idx = face_halfedges
        .iter()
        .position(|h| mesh.at_halfedge(*h).vertex().end() == v)
        .unwrap() as i32;
    let w_idx = face_halfedges
        .iter()
        .position(|h| mesh.at_halfedge(*h).vertex().end() == w)
        .unwrap() as i32;

    // NOTE: Use rem euclid so negative indices wrap up back at the end
    let h_vprev_v = face_halfedges[(v_idx - 1).rem_euclid(face_halfedges.len() as i32) as usize];
    let h_v_vnext = face_halfedges[v_idx as usize];
    let h_wprev_w = face_halfedges[(w_idx - 1).rem_euclid(face_halfedges.len() as i32) as usize];
    let h_w_wnext = face_halfedges[w_idx as usize];

    // Create new data
    let h_v_w = mesh.alloc_halfedge(HalfEdge::default());
    let h_w_v = mesh.alloc_halfedge(HalfEdge::default());
    let new_face = mesh.alloc_face(None);

    mesh[h_v_w].vertex = Some(v);
    mesh[h_w_v].vertex = Some(w);

    mesh[h_v_w].face = Some(face);
    mesh[h_w_v].face = Some(new_face);

    mesh[h_v_w].twin = Some(h_w_v);
    mesh[h_w_v].twin = Some(h_v_w);

    mesh[h_v_w].next = Some(h_w_wnext);
    mesh[h_w_v].next = Some(h_v_vnext);

    mesh[new_face].halfedge = Some(h_w_v);
    mesh[face].halfedge = Some(h_v_w);

    // Fix connectivity

    mesh[h_vprev_v].next = Some(h_v_w);
    mesh[h_wprev_w].next = Some(h_w_v);

    // The halfedges of the original face that fall on the new face
    let (start, end) = {
        let start = v_idx;
        let mut end = (w_idx - 1).rem_euclid(face_halfedges.len() as i32);
        if end < start {
            end += face_halfedges.len() as i32
        }
        (start, end)
    };
    for i in start..=end {
        let h = face_halfedges[i as usize % face_halfedges.len()];
        mesh[h].face = Some(new_face);
        mesh.add_debug_halfedge(h, DebugMark::blue(""));
    }

    Ok(h_v_w)
}

pub fn dissolve_vertex(mesh: &mut halfedge::MeshConnectivity, v: VertexId) -> Result<FaceId> {
    let outgoing = mesh.at_vertex(v).outgoing_halfedges()?;

    if outgoing.is_empty() {
        bail!("Vertex {:?} is not in a face. Cannot dissolve", v);
    }

    let new_face = mesh.alloc_face(None);

    let mut to_delete = SmallVec::<[_; 16]>::new();

    // Fix next pointers for edges in the new face
    for &h in &outgoing {
        let tw = mesh.at_halfedge(h).twin().try_end()?;
        let w = mesh.at_halfedge(tw).vertex().try_end()?;
        let nxt = mesh.at_halfedge(h).next().try_end()?;
        let prv = mesh.at_halfedge(tw).previous().try_end()?;
        let f = mesh.at_halfedge(h).face().try_end()?;
        mesh[prv].next = Some(nxt);
        if mesh[w].halfedge == Some(tw) {
            mesh[w].halfedge = Some(nxt);
        }

        // We cannot safely remove data at this point, because it could be
        // accessed during `previous()` traversal.
        to_delete.push((tw, h, f));
    }

    // Set all halfedges to the same face
    let outer_loop = mesh.halfedge_loop(mesh.at_halfedge(outgoing[0]).next().try_end()?);
    for &h in &outer_loop {
        mesh[h].face = Some(new_face);
    }
    mesh[new_face].halfedge = Some(outer_loop[0]);

    mesh.remove_vertex(v);
    for (tw, h, f) in to_delete {
        mesh.remove_halfedge(tw);
        mesh.remove_halfedge(h);
        mesh.remove_face(f);
    }

    Ok(new_face)
}

/// Chamfers a vertex. That is, for each outgoing edge of the vertex, a new
/// vertex will be created. All the new vertices will be joined in a new face,
/// and the original vertex will get removed.
///
/// ## Vertices in the boundary
/// When any of the outgoing halfedges for `v` lies in the boundary, this
/// operation cannot be completed as documented, because the final
/// `dissolve_vertex` operation is not well-defined.
///
/// In that case, the operation doesn't complete, and the resulting `FaceId`
/// return value will be `None`. This behavior is not only a best-effort, but is
/// consistent with the expected behavior during the bevel operation, which
/// depends on this operation.
///
/// ## Id Stability
/// This operation guarantees that the outgoing halfedge ids are preserved.
/// Additionally, the returned vertex id vector has the newly created vertex ids
/// provided in the same order as `v`'s outgoing_halfedges
pub fn chamfer_vertex(
    mesh: &mut halfedge::MeshConnectivity,
    positions: &mut Positions,
    v: VertexId,
    interpolation_factor: f32,
) -> Result<(Option<FaceId>, SVec<VertexId>)> {
    let outgoing = mesh.at_vertex(v).outgoing_halfedges()?;
    let mut vertices = SVec::new();
    for &h in &outgoing {
        vertices.push(divide_edge(mesh, positions, h, interpolation_factor)?);
    }

    let mut is_boundary = false;

    for ((&v, _), (&w, &hw)) in vertices
        .iter()
        .zip(outgoing.iter())
        .circular_tuple_windows()
    {
        // Only cut faces at the boundary. If there's two vertices separated by
        // boundary, we take note of that and don't do the final dissolve.
        if !mesh.at_halfedge(hw).is_boundary()? {
            cut_face(mesh, v, w)?;
        } else {
            is_boundary = true;
        }
    }

    if is_boundary {
        Ok((None, vertices))
    } else {
        Ok((Some(dissolve_vertex(mesh, v)?), vertices))
    }
}

/// Merges the src and dst vertices of `h` so that only the first one remains
pub fn collapse_edge(mesh: &mut MeshConnectivity, h: HalfEdgeId) -> Result<VertexId> {
    let (v, w) = mesh.at_halfedge(h).src_dst_pair()?;
    let t = mesh.at_halfedge(h).twin().try_end()?;
    let h_next = mesh.at_halfedge(h).next().try_end()?;
    let h_prev = mesh.at_halfedge(h).previous().try_end()?;
    let t_next = mesh.at_halfedge(t).next().try_end()?;
    let t_prev = mesh.at_halfedge(t).previous().try_end()?;
    let w_outgoing = mesh.at_vertex(w).outgoing_halfedges()?;
    let f_h = mesh.at_halfedge(h).face_or_boundary()?;
    let f_t = mesh.at_halfedge(t).face_or_boundary()?;
    // We check here if either face is a triangle. This is an edge case that
    // requires some additional post-processing later.
    let f_h_is_triangle = f_h.is_some() && mesh.halfedge_loop_iter(h).count() == 3;
    let f_t_is_triangle = f_t.is_some() && mesh.halfedge_loop_iter(t).count() == 3;

    // --- Adjust connectivity ---
    for h_wo in w_outgoing {
        mesh[h_wo].vertex = Some(v);
    }
    mesh[t_prev].next = Some(t_next);
    mesh[h_prev].next = Some(h_next);

    // Some face may point to the halfedges we're deleting. Fix that.
    if let Some(f_h) = f_h {
        if mesh.at_face(f_h).halfedge().try_end()? == h {
            mesh[f_h].halfedge = Some(h_next);
        }
    }
    if let Some(f_t) = f_t {
        if mesh.at_face(f_t).halfedge().try_end()? == t {
            mesh[f_t].halfedge = Some(t_next);
        }
    }

    // --- Remove data ----
    mesh.remove_halfedge(t);
    mesh.remove_halfedge(h);
    mesh.remove_vertex(w);

    // --- Triangular face post-processing ---

    // If either f_h or f_t were triangle faces, we need to do some extra
    // cleanup, because the collapse edge operation also removes those faces.

    /// The operation returns a pair of halfedges, which are the external edges
    /// of the triangular face after the internal ones have been deleted. After
    /// this operation, the triangular face is now a single edge.
    fn post_process_triangular_face(
        mesh: &mut MeshConnectivity,
        prev: HalfEdgeId,
        next: HalfEdgeId,
        face: Option<FaceId>,
    ) -> Result<(HalfEdgeId, HalfEdgeId)> {
        let prev_twin = mesh.at_halfedge(prev).twin().try_end()?;
        let next_twin = mesh.at_halfedge(next).twin().try_end()?;
        mesh[prev_twin].twin = Some(next_twin);
        mesh[next_twin].twin = Some(prev_twin);
        mesh.remove_halfedge(prev);
        mesh.remove_halfedge(next);
        if let Some(face) = face {
            mesh.remove_face(face);
        }
        Ok((prev_twin, next_twin))
    }

    let f_h_triangle_halfedges = if f_h_is_triangle {
        Some(post_process_triangular_face(mesh, h_prev, h_next, f_h)?)
    } else {
        None
    };
    let f_t_triangle_halfedges = if f_t_is_triangle {
        Some(post_process_triangular_face(mesh, t_prev, t_next, f_t)?)
    } else {
        None
    };

    // --- Fix connectivity for vertices ---

    // The remaining vertices may be pointing to a deleted halfedge. We need to
    // fix that here to prevent consistency issues.
    if mesh[v].halfedge == Some(h) {
        // In general, we can use `h_next` since that is not an outgoing
        // halfedge of `v (because `h` was collapsed). But in case `f_h` was a
        // triangle we need to use `h_v_x` since `h_next` was deleted.
        if let Some((h_v_x, _)) = f_h_triangle_halfedges {
            mesh[v].halfedge = Some(h_v_x);
        } else {
            mesh[v].halfedge = Some(h_next);
        }
    }
    if let Some((_, h_x_w)) = f_h_triangle_halfedges {
        let x = mesh.at_halfedge(h_x_w).vertex().try_end()?;
        if mesh[x].halfedge == Some(h_prev) {
            mesh[x].halfedge = Some(h_x_w);
        }
    }
    if let Some((h_v_y, h_y_v)) = f_t_triangle_halfedges {
        let y = mesh.at_halfedge(h_y_v).vertex().try_end()?;
        if mesh[y].halfedge == Some(t_prev) {
            mesh[y].halfedge = Some(h_y_v);
        }

        if mesh[v].halfedge == Some(t_next) {
            mesh[v].halfedge = Some(h_v_y);
        }
    }

    Ok(v)
}
