// Copyright (C) 2023 setzer22 and contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The mesh-core Euler operators: the mutating public API that keeps
//! connectivity, geometry and attribute streams in lock-step. Built on top of
//! the lower-level connectivity primitives in [`super::edit_ops`], the same
//! way the node-graph operators there are built on top of `MeshConnectivity`'s
//! private allocators.
//!
//! Operators whose failure mode is part of their documented contract return
//! [`MeshError`]; everything else returns [`anyhow::Result`] since the only
//! way for it to fail is an internal invariant violation.

use std::collections::{BTreeSet, HashMap, HashSet};

use smallvec::smallvec;

use super::edit_ops;
use super::rebuilder::IMaterialResolver;
use super::*;
use crate::error::{BatchResult, MeshError, StaleHandleKind};

/* ========================================================================= */
/*  Edge list algorithms and classification                                  */
/* ========================================================================= */

/// Connectivity shape of a set of half-edges, classified by vertex degree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeListConnectivity {
    /// The input was empty.
    None,
    /// A simple path: exactly two vertices of degree 1, the rest degree 2.
    List,
    /// A simple cycle: every vertex has degree 2.
    Loop,
    /// Branching or disconnected: some vertex has degree > 2, or the set
    /// mixes multiple disjoint components.
    Mixed,
}

impl MeshConnectivity {
    /// Single pass counting how many times each vertex appears as an endpoint
    /// of `edges` (undirected, src/dst of each half-edge).
    pub fn classify_edge_list_connectivity(&self, edges: &[HalfEdgeId]) -> EdgeListConnectivity {
        if edges.is_empty() {
            return EdgeListConnectivity::None;
        }

        let mut degree: HashMap<VertexId, u32> = HashMap::new();
        for &h in edges {
            if let Ok((v, w)) = self.at_halfedge(h).src_dst_pair() {
                *degree.entry(v).or_insert(0) += 1;
                *degree.entry(w).or_insert(0) += 1;
            }
        }

        if degree.values().any(|&d| d > 2) {
            return EdgeListConnectivity::Mixed;
        }
        if degree.values().any(|&d| d == 1) {
            if self.find_edge_islands(edges).len() == 1 {
                EdgeListConnectivity::List
            } else {
                EdgeListConnectivity::Mixed
            }
        } else if self.find_edge_islands(edges).len() == 1 {
            EdgeListConnectivity::Loop
        } else {
            EdgeListConnectivity::Mixed
        }
    }

    /// Disjoint-set partition of `edges` by shared vertex.
    pub fn find_edge_islands(&self, edges: &[HalfEdgeId]) -> Vec<Vec<HalfEdgeId>> {
        // Plain union-find over the positions of `edges`, merged whenever two
        // edges share an endpoint vertex.
        let mut parent: Vec<usize> = (0..edges.len()).collect();
        fn find(parent: &mut [usize], x: usize) -> usize {
            if parent[x] != x {
                parent[x] = find(parent, parent[x]);
            }
            parent[x]
        }
        fn union(parent: &mut [usize], a: usize, b: usize) {
            let ra = find(parent, a);
            let rb = find(parent, b);
            if ra != rb {
                parent[ra] = rb;
            }
        }

        let pairs: Vec<Option<(VertexId, VertexId)>> = edges
            .iter()
            .map(|&h| self.at_halfedge(h).src_dst_pair().ok())
            .collect();

        for i in 0..edges.len() {
            for j in (i + 1)..edges.len() {
                if let (Some((vi, wi)), Some((vj, wj))) = (pairs[i], pairs[j]) {
                    if vi == vj || vi == wj || wi == vj || wi == wj {
                        union(&mut parent, i, j);
                    }
                }
            }
        }

        let mut groups: HashMap<usize, Vec<HalfEdgeId>> = HashMap::new();
        for i in 0..edges.len() {
            let root = find(&mut parent, i);
            groups.entry(root).or_default().push(edges[i]);
        }
        groups.into_values().collect()
    }

    /// Greedy walk alternating `twin` then "the edge across the face" (the
    /// half-edge `floor(len/2)` steps ahead in the face loop), stopping at a
    /// boundary or when the walk would repeat an already-visited edge.
    pub fn find_edge_ring(&self, e: HalfEdgeId) -> SVec<HalfEdgeId> {
        let mut ring = SVec::new();
        ring.push(e);
        let mut visited: HashSet<HalfEdgeId> = HashSet::new();
        visited.insert(e);

        let mut current = e;
        loop {
            let Ok(face) = self.at_halfedge(current).face().try_end() else {
                break;
            };
            let Ok(loop_hs) = self.at_face(face).halfedges() else {
                break;
            };
            let Some(idx) = loop_hs.iter().position(|&h| h == current) else {
                break;
            };
            let opposite = loop_hs[(idx + loop_hs.len() / 2) % loop_hs.len()];
            let Ok(next) = self.at_halfedge(opposite).twin().try_end() else {
                break;
            };
            if !visited.insert(next) {
                break;
            }
            ring.push(next);
            current = next;
            if ring.len() > MAX_LOOP_ITERATIONS {
                break;
            }
        }
        ring
    }

    /// Greedy walk picking, at each vertex, the outgoing half-edge whose
    /// direction is most aligned with the current edge's direction (the
    /// "straightest" continuation), up to `step_limit` steps.
    pub fn find_edge_loop(
        &self,
        e: HalfEdgeId,
        positions: &Positions,
        step_limit: usize,
    ) -> SVec<HalfEdgeId> {
        let mut path = SVec::new();
        path.push(e);
        let mut visited: HashSet<HalfEdgeId> = HashSet::new();
        visited.insert(e);

        let mut current = e;
        for _ in 0..step_limit {
            let Ok(w) = self.at_halfedge(current).dst_vertex().try_end() else {
                break;
            };
            let Ok((src, dst)) = self.at_halfedge(current).src_dst_pair() else {
                break;
            };
            let dir = (positions[dst] - positions[src]).normalize_or_zero();

            let Ok(candidates) = self.at_vertex(w).outgoing_halfedges() else {
                break;
            };
            let twin_of_current = self.at_halfedge(current).twin().try_end().ok();

            let best = candidates
                .iter()
                .copied()
                .filter(|&h| Some(h) != twin_of_current)
                .filter(|h| !visited.contains(h))
                .max_by(|&a, &b| {
                    let score = |h: HalfEdgeId| -> f32 {
                        let Ok(hw) = self.at_halfedge(h).dst_vertex().try_end() else {
                            return f32::MIN;
                        };
                        let cand_dir = (positions[hw] - positions[w]).normalize_or_zero();
                        dir.dot(cand_dir)
                    };
                    score(a)
                        .partial_cmp(&score(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });

            match best {
                Some(h) => {
                    visited.insert(h);
                    path.push(h);
                    current = h;
                }
                None => break,
            }
        }
        path
    }

    /// For each edge in `edges`, the perpendicular edges immediately adjacent
    /// to it on either side (the `previous`/`next` half-edges of its own
    /// face, and of its twin's face when it has one).
    pub fn find_edge_ribs(
        &self,
        edges: &[HalfEdgeId],
    ) -> Vec<(HalfEdgeId, Option<HalfEdgeId>, Option<HalfEdgeId>)> {
        edges
            .iter()
            .map(|&h| {
                let side_a = self.at_halfedge(h).previous().try_end().ok();
                let twin = self.at_halfedge(h).twin().try_end().ok();
                let side_b = twin.and_then(|t| self.at_halfedge(t).previous().try_end().ok());
                (h, side_a, side_b)
            })
            .collect()
    }
}

/* ========================================================================= */
/*  Core Euler operators                                                     */
/* ========================================================================= */

/// Creates an isolated vertex with no incident edges.
pub fn add_vertex(mesh: &HalfEdgeMesh, pos: Vec3) -> VertexId {
    let v = {
        let mut conn = mesh.write_connectivity();
        let mut positions = mesh.write_positions();
        conn.alloc_vertex(&mut positions, pos, None)
    };
    mesh.mark_dirty();
    v
}

/// Creates a face from an ordered vertex loop of size `N >= 3`, linking new
/// half-edges into each vertex's existing fan. Generalizes `edit_ops::make_quad`
/// to arbitrary polygon sizes.
///
/// Fails (without mutating the mesh) if `N < 3`, a vertex repeats, or any of
/// the edges the face would occupy is already interior to another face (which
/// would make that vertex non-manifold).
pub fn add_face(mesh: &HalfEdgeMesh, verts: &[VertexId]) -> Result<FaceId, MeshError> {
    let n = verts.len();
    if n < 3 {
        return Err(MeshError::BadPolygon(format!(
            "add_face needs at least 3 vertices, got {n}"
        )));
    }
    if verts.iter().collect::<HashSet<_>>().len() != n {
        return Err(MeshError::BadPolygon(
            "add_face: vertex list contains a repeated vertex".to_string(),
        ));
    }

    let mut conn = mesh.write_connectivity();
    for &v in verts {
        if !conn.vertex_exists(v) {
            return Err(MeshError::StaleHandle(StaleHandleKind::Vertex(v)));
        }
    }

    #[derive(Clone, Copy, Debug)]
    struct EdgeInfo {
        id: HalfEdgeId,
        existed: bool,
    }

    let face = conn.alloc_face(None);
    let mut a_edges: SVec<EdgeInfo> = SVec::new();
    let mut b_edges: SVec<EdgeInfo> = SVec::new();
    let mut newly_allocated: SVec<HalfEdgeId> = SVec::new();

    for (v1, v2) in verts.iter_cpy().circular_tuple_windows() {
        let a_i = conn.at_vertex(v1).halfedge_to(v2).try_end().ok();
        let b_i = conn.at_vertex(v2).halfedge_to(v1).try_end().ok();
        let a_id = a_i.unwrap_or_else(|| {
            let h = conn.alloc_halfedge(HalfEdge::default());
            newly_allocated.push(h);
            h
        });
        let b_id = b_i.unwrap_or_else(|| {
            let h = conn.alloc_halfedge(HalfEdge::default());
            newly_allocated.push(h);
            h
        });
        a_edges.push(EdgeInfo {
            id: a_id,
            existed: a_i.is_some(),
        });
        b_edges.push(EdgeInfo {
            id: b_id,
            existed: b_i.is_some(),
        });
    }

    for e in a_edges.iter() {
        if !conn.at_halfedge(e.id).is_boundary().unwrap_or(false) {
            // Roll back: nothing has been wired up yet, so it's enough to
            // free what we allocated and bail. Keeps the operator all-or-nothing.
            for h in newly_allocated {
                conn.remove_halfedge(h);
            }
            conn.remove_face(face);
            return Err(MeshError::BadPolygon(format!(
                "add_face: edge {:?} is already interior to another face",
                e.id
            )));
        }
    }

    fn prev_i(i: usize, n: usize) -> usize {
        ((i as isize - 1).rem_euclid(n as isize)) as usize
    }

    let mut a_prev_orig: SVec<HalfEdgeId> = smallvec![HalfEdgeId::default(); n];
    for (i, a_i) in a_edges.iter_cpy().enumerate() {
        if a_i.existed {
            a_prev_orig[i] = conn
                .at_halfedge(a_i.id)
                .previous()
                .try_end()
                .map_err(|e| MeshError::BadPolygon(format!("add_face: {e}")))?;
        }
    }
    for (i, a_i) in a_edges.iter_cpy().enumerate() {
        if a_i.existed {
            conn[a_prev_orig[i]].next = Some(b_edges[prev_i(i, n)].id);
        }
    }

    for (i, b_i) in b_edges.iter_cpy().enumerate() {
        conn[b_i.id].twin = Some(a_edges[i].id);
        conn[b_i.id].vertex = Some(verts[(i + 1) % n]);
        conn[b_i.id].next = if b_i.existed {
            conn[b_i.id].next
        } else {
            let a_prev = a_edges[prev_i(i, n)];
            if a_prev.existed {
                conn[a_prev.id].next
            } else {
                Some(b_edges[prev_i(i, n)].id)
            }
        };
        conn[b_i.id].face = if b_i.existed { conn[b_i.id].face } else { None };
    }

    for (i, a_i) in a_edges.iter_cpy().enumerate() {
        conn[a_i.id].next = Some(a_edges[(i + 1) % n].id);
        conn[a_i.id].twin = Some(b_edges[i].id);
        conn[a_i.id].face = Some(face);
        conn[a_i.id].vertex = Some(verts[i]);
    }

    conn[face].halfedge = Some(a_edges[0].id);
    for (i, &v) in verts.iter().enumerate() {
        conn[v].halfedge = Some(a_edges[i].id);
    }

    drop(conn);
    mesh.mark_dirty();
    Ok(face)
}

/// Removes `v` and every half-edge that references it, along with any faces
/// that used those half-edges. If `remove_loose_edges`, additionally sweeps
/// edges that become isolated (both endpoints alive, but no longer in a face)
/// as a result. Half-edges referencing a dead vertex are always removed
/// regardless of the flag: they would otherwise violate I5.
pub fn remove_vertex(mesh: &HalfEdgeMesh, v: VertexId, remove_loose_edges: bool) -> Result<()> {
    let mut conn = mesh.write_connectivity();
    if !conn.vertex_exists(v) {
        bail!(MeshError::StaleHandle(StaleHandleKind::Vertex(v)));
    }

    let outgoing = conn.at_vertex(v).outgoing_halfedges().unwrap_or_default();
    let mut faces_to_remove: BTreeSet<FaceId> = BTreeSet::new();
    let mut neighbors: BTreeSet<VertexId> = BTreeSet::new();

    for h in outgoing.iter().copied() {
        if let Ok(f) = conn.at_halfedge(h).face().try_end() {
            faces_to_remove.insert(f);
        }
        if let Ok(t) = conn.at_halfedge(h).twin().try_end() {
            if let Ok(f) = conn.at_halfedge(t).face().try_end() {
                faces_to_remove.insert(f);
            }
            if let Ok(w) = conn.at_halfedge(t).vertex().try_end() {
                neighbors.insert(w);
            }
        }
    }

    for f in faces_to_remove {
        let hs = conn.face_edges(f);
        for h in hs {
            conn[h].face = None;
        }
        conn.remove_face(f);
    }

    for h in outgoing {
        if let Ok(t) = conn.at_halfedge(h).twin().try_end() {
            conn.remove_halfedge(t);
        }
        conn.remove_halfedge(h);
    }
    conn.remove_vertex(v);

    if remove_loose_edges {
        for w in neighbors {
            if !conn.vertex_exists(w) {
                continue;
            }
            let still_outgoing = conn.at_vertex(w).outgoing_halfedges().unwrap_or_default();
            for h in still_outgoing {
                let is_isolated = conn.at_halfedge(h).face().try_end().is_err()
                    && conn
                        .at_halfedge(h)
                        .twin()
                        .try_end()
                        .and_then(|t| conn.at_halfedge(t).face().try_end())
                        .is_err();
                if is_isolated {
                    if let Ok(t) = conn.at_halfedge(h).twin().try_end() {
                        conn.remove_halfedge(t);
                    }
                    conn.remove_halfedge(h);
                }
            }
        }
    }

    drop(conn);
    mesh.mark_dirty();
    Ok(())
}

/// Opens `f`'s boundary half-edges (face = None) and removes the face cycle.
/// If `!keep_vertices`, vertices that become fully disconnected are removed.
pub fn remove_face(mesh: &HalfEdgeMesh, f: FaceId, keep_vertices: bool) -> Result<()> {
    let mut conn = mesh.write_connectivity();
    if conn.face(f).is_none() {
        bail!(MeshError::StaleHandle(StaleHandleKind::Face(f)));
    }
    let hs = conn.face_edges(f);
    let mut touched_vertices: SVec<VertexId> = SVec::new();
    for &h in &hs {
        conn[h].face = None;
        if let Ok(v) = conn.at_halfedge(h).vertex().try_end() {
            touched_vertices.push(v);
        }
    }
    conn.remove_face(f);

    if !keep_vertices {
        for v in touched_vertices {
            if conn.vertex_exists(v)
                && conn
                    .at_vertex(v)
                    .outgoing_halfedges()
                    .map(|hs| hs.is_empty())
                    .unwrap_or(true)
            {
                conn.remove_vertex(v);
            }
        }
    }

    drop(conn);
    mesh.mark_dirty();
    Ok(())
}

/// Removes an edge by removing both its adjacent faces (if any) and then the
/// pair of half-edges themselves.
pub fn remove_edge(mesh: &HalfEdgeMesh, e: HalfEdgeId, keep_vertices: bool) -> Result<()> {
    let (f_h, f_t) = {
        let conn = mesh.read_connectivity();
        if conn.halfedge(e).is_none() {
            bail!(MeshError::StaleHandle(StaleHandleKind::HalfEdge(e)));
        }
        let t = conn.at_halfedge(e).twin().try_end().ok();
        (
            conn.at_halfedge(e).face().try_end().ok(),
            t.and_then(|t| conn.at_halfedge(t).face().try_end().ok()),
        )
    };
    if let Some(f) = f_h {
        remove_face(mesh, f, true)?;
    }
    if let Some(f) = f_t {
        remove_face(mesh, f, true)?;
    }

    let mut conn = mesh.write_connectivity();
    let (v, w) = conn.at_halfedge(e).src_dst_pair().unwrap_or_default();
    if let Ok(t) = conn.at_halfedge(e).twin().try_end() {
        conn.remove_halfedge(t);
    }
    conn.remove_halfedge(e);

    if !keep_vertices {
        for endpoint in [v, w] {
            if conn.vertex_exists(endpoint)
                && conn
                    .at_vertex(endpoint)
                    .outgoing_halfedges()
                    .map(|hs| hs.is_empty())
                    .unwrap_or(true)
            {
                conn.remove_vertex(endpoint);
            }
        }
    }
    drop(conn);
    mesh.mark_dirty();
    Ok(())
}

/// Splits a full edge by inserting a vertex at its midpoint, replacing the
/// half-edge pair with two. Texcoords (if present) are linearly interpolated
/// between the two corners on each incident face.
pub fn add_vertex_to_edge(mesh: &HalfEdgeMesh, e: HalfEdgeId) -> Result<(VertexId, HalfEdgeId, HalfEdgeId)> {
    let new_vertex = {
        let mut conn = mesh.write_connectivity();
        let mut positions = mesh.write_positions();
        edit_ops::divide_edge(&mut conn, &mut positions, e, 0.5)?
    };

    // Interpolate texcoords for the freshly split corner, if the mesh has them.
    if let Some(texcoord_id) = mesh_default_texcoord_id(mesh) {
        let h2 = mesh
            .read_connectivity()
            .at_halfedge(e)
            .previous()
            .try_end()?;
        let mut tex = mesh.channels.write_channel(texcoord_id)?;
        let uv_e = tex[e];
        let uv_h2_next = tex[h2];
        let mid = uv_e.lerp(uv_h2_next, 0.5);
        tex[h2] = mid;
    }

    mesh.mark_dirty();
    let (e1, e2) = {
        let conn = mesh.read_connectivity();
        let e2 = conn.at_vertex(new_vertex).halfedge().try_end()?;
        (e, e2)
    };
    Ok((new_vertex, e1, e2))
}

fn mesh_default_texcoord_id(mesh: &HalfEdgeMesh) -> Option<ChannelId<HalfEdgeId, Vec2>> {
    mesh.channels.channel_id::<HalfEdgeId, Vec2>("texcoord")
}

/// Merges the src and dst endpoints of `e` into one vertex at
/// `lerp(pos(src), pos(dst), t)`. Fails with `NonManifold` on a bow-tie: both
/// adjacent faces of `e` share a second edge, so collapsing would double a
/// full edge (B3).
pub fn collapse_edge(mesh: &HalfEdgeMesh, e: HalfEdgeId, t: f32) -> Result<VertexId, MeshError> {
    let mut conn = mesh.write_connectivity();
    if conn.halfedge(e).is_none() {
        return Err(MeshError::StaleHandle(StaleHandleKind::HalfEdge(e)));
    }

    let (v, w) = conn
        .at_halfedge(e)
        .src_dst_pair()
        .map_err(|err| MeshError::NonManifold(format!("collapse_edge: {err}")))?;

    // Bow-tie detection (B3): if both faces adjacent to `e` are triangles and
    // share *another* vertex besides v/w, collapsing would identify two
    // distinct edges into one.
    let twin = conn.at_halfedge(e).twin().try_end().ok();
    let f_h = conn.at_halfedge(e).face().try_end().ok();
    let f_t = twin.and_then(|t| conn.at_halfedge(t).face().try_end().ok());
    if let (Some(f_h), Some(f_t)) = (f_h, f_t) {
        let verts_h: HashSet<VertexId> = conn.face_vertices(f_h).into_iter().collect();
        let verts_t: HashSet<VertexId> = conn.face_vertices(f_t).into_iter().collect();
        let shared_extra = verts_h
            .intersection(&verts_t)
            .any(|&x| x != v && x != w);
        if shared_extra {
            return Err(MeshError::NonManifold(
                "collapse_edge: edge is a bow-tie, both faces share a second vertex".to_string(),
            ));
        }
    }

    let mut positions = mesh.write_positions();
    let merged_pos = positions[v].lerp(positions[w], t);

    let merged = edit_ops::collapse_edge(&mut conn, e)
        .map_err(|err| MeshError::NonManifold(format!("collapse_edge: {err}")))?;
    positions[merged] = merged_pos;

    drop(conn);
    drop(positions);
    mesh.mark_dirty();
    Ok(merged)
}

/// If there is an edge `a-b`, behaves like `collapse_edge(a-b, 1.0)`;
/// otherwise welds the two vertex fans together (`b`'s outgoing half-edges
/// are rewritten to originate from `a`, and `b` is removed).
pub fn merge_vertices(mesh: &HalfEdgeMesh, a: VertexId, b: VertexId) -> Result<VertexId, MeshError> {
    if a == b {
        return Ok(a);
    }
    let shared_edge = {
        let conn = mesh.read_connectivity();
        conn.at_vertex(a).halfedge_to(b).try_end().ok()
    };
    if let Some(h) = shared_edge {
        return collapse_edge(mesh, h, 1.0);
    }

    let mut conn = mesh.write_connectivity();
    if conn.vertex(a).is_none() {
        return Err(MeshError::StaleHandle(StaleHandleKind::Vertex(a)));
    }
    if conn.vertex(b).is_none() {
        return Err(MeshError::StaleHandle(StaleHandleKind::Vertex(b)));
    }

    let b_outgoing = conn
        .at_vertex(b)
        .outgoing_halfedges()
        .map_err(|err| MeshError::NonManifold(format!("merge_vertices: {err}")))?;

    // Welding would violate I4 (two half-edges from `a` to the same
    // neighbour) if `a` and `b` share any neighbouring vertex.
    let a_neighbors: HashSet<VertexId> = conn
        .at_vertex(a)
        .outgoing_halfedges()
        .unwrap_or_default()
        .iter()
        .filter_map(|&h| conn.at_halfedge(h).dst_vertex().try_end().ok())
        .collect();
    for &h in &b_outgoing {
        if let Ok(dst) = conn.at_halfedge(h).dst_vertex().try_end() {
            if a_neighbors.contains(&dst) {
                return Err(MeshError::NonManifold(
                    "merge_vertices: welding would duplicate an edge".to_string(),
                ));
            }
        }
    }

    for h in b_outgoing.iter().copied() {
        conn[h].vertex = Some(a);
    }
    if let Some(&first) = b_outgoing.first() {
        conn[a].halfedge = Some(first);
    }
    conn.remove_vertex(b);

    drop(conn);
    mesh.mark_dirty();
    Ok(a)
}

/// Zips two open (boundary) half-edges into one, merging their endpoint
/// pairs. Fails if either edge is not on the boundary.
pub fn merge_edges(mesh: &HalfEdgeMesh, a: HalfEdgeId, b: HalfEdgeId) -> Result<(VertexId, VertexId), MeshError> {
    let (a_boundary, b_boundary) = {
        let conn = mesh.read_connectivity();
        (
            conn.at_halfedge(a).is_boundary().unwrap_or(false),
            conn.at_halfedge(b).is_boundary().unwrap_or(false),
        )
    };
    if !a_boundary || !b_boundary {
        return Err(MeshError::NonManifold(
            "merge_edges: both edges must be on the boundary".to_string(),
        ));
    }

    let (av, aw) = mesh
        .read_connectivity()
        .at_halfedge(a)
        .src_dst_pair()
        .map_err(|err| MeshError::NonManifold(format!("merge_edges: {err}")))?;
    let (bv, bw) = mesh
        .read_connectivity()
        .at_halfedge(b)
        .src_dst_pair()
        .map_err(|err| MeshError::NonManifold(format!("merge_edges: {err}")))?;

    // Edges face opposite directions when traversing the same hole, so `a`'s
    // source zips with `b`'s destination and vice versa.
    let v1 = merge_vertices(mesh, av, bw)?;
    let v2 = merge_vertices(mesh, aw, bv)?;
    Ok((v1, v2))
}

/// Adds a face connecting two open edges, producing a quad (or a triangle if
/// the edges already share a vertex).
pub fn bridge_edges(mesh: &HalfEdgeMesh, a: HalfEdgeId, b: HalfEdgeId) -> Result<FaceId, MeshError> {
    let conn = mesh.read_connectivity();
    if !conn.at_halfedge(a).is_boundary().unwrap_or(false)
        || !conn.at_halfedge(b).is_boundary().unwrap_or(false)
    {
        return Err(MeshError::BadPolygon(
            "bridge_edges: both edges must be open".to_string(),
        ));
    }
    let (av, aw) = conn
        .at_halfedge(a)
        .src_dst_pair()
        .map_err(|err| MeshError::BadPolygon(format!("bridge_edges: {err}")))?;
    let (bv, bw) = conn
        .at_halfedge(b)
        .src_dst_pair()
        .map_err(|err| MeshError::BadPolygon(format!("bridge_edges: {err}")))?;
    drop(conn);

    // `b` runs the opposite way around its hole, so it connects aw-bv and bw-av.
    if aw == bv {
        return add_face(mesh, &[av, aw, bw]);
    }
    if av == bw {
        return add_face(mesh, &[av, aw, bv]);
    }
    add_face(mesh, &[av, aw, bv, bw])
}

/// Per-face result of [`bevel_faces`]: the duplicated face, the ring of
/// connecting quads (if `create_connecting` was set), and the new vertices
/// corresponding (in order) to the original face's corners.
#[derive(Debug, Clone)]
pub struct BevelResult {
    pub new_face: FaceId,
    pub connecting_faces: SVec<FaceId>,
    pub corresp: SVec<VertexId>,
}

/// Duplicates each face in `faces`, connecting the duplicate to the original
/// by a ring of new quads when `create_connecting`. The standard building
/// block for extrude. One bad face reports its own error; the rest proceed.
#[profiling::function]
pub fn bevel_faces(mesh: &HalfEdgeMesh, faces: &[FaceId], create_connecting: bool) -> BatchResult<BevelResult> {
    let items = faces
        .iter()
        .map(|&f| bevel_one_face(mesh, f, create_connecting))
        .collect();
    BatchResult::new(items)
}

fn bevel_one_face(mesh: &HalfEdgeMesh, f: FaceId, create_connecting: bool) -> Result<BevelResult, MeshError> {
    if mesh.read_connectivity().face(f).is_none() {
        return Err(MeshError::StaleHandle(StaleHandleKind::Face(f)));
    }
    let original_verts: SVec<VertexId> = mesh.read_connectivity().face_vertices(f);
    let positions: Vec<Vec3> = {
        let pos = mesh.read_positions();
        original_verts.iter().map(|&v| pos[v]).collect()
    };

    let new_verts: SVec<VertexId> = positions
        .iter()
        .map(|&p| add_vertex(mesh, p))
        .collect();

    // The original face is kept in place (bevel duplicates, it doesn't
    // replace); extrude moves `corresp` afterwards to pull the duplicate
    // away from it. The connecting ring is wound `(j, i, ...)` - the
    // reverse of the original face's own `i -> j` winding - so its shared
    // edge becomes the twin of the original's half-edge instead of
    // colliding with it.
    let new_face = add_face(mesh, &new_verts)?;

    let mut connecting_faces = SVec::new();
    if create_connecting {
        let n = original_verts.len();
        for i in 0..n {
            let j = (i + 1) % n;
            let quad = [
                original_verts[j],
                original_verts[i],
                new_verts[i],
                new_verts[j],
            ];
            if let Ok(cf) = add_face(mesh, &quad) {
                connecting_faces.push(cf);
            }
        }
    }

    Ok(BevelResult {
        new_face,
        connecting_faces,
        corresp: new_verts,
    })
}

/// Extrudes a line-strip of open edges outward by `amount` along each edge's
/// `face_normal x edge_direction`. `amount = 0` is legal (B2): it produces
/// zero-area quads that the Rebuilder later drops, but topology still updates.
pub fn extend_edges(mesh: &HalfEdgeMesh, edges: &[HalfEdgeId], amount: f32) -> Result<()> {
    for &e in edges {
        if !mesh.read_connectivity().at_halfedge(e).is_boundary().unwrap_or(false) {
            bail!("extend_edges: edge {:?} is not on the boundary", e);
        }
    }

    for &e in edges {
        let (v, w) = mesh.read_connectivity().at_halfedge(e).src_dst_pair()?;
        let (pv, pw) = {
            let pos = mesh.read_positions();
            (pos[v], pos[w])
        };

        // Use the twin's face normal (the one face this boundary edge still
        // touches) to compute the outward direction; fall back to world Y.
        let twin_face_normal = mesh
            .read_connectivity()
            .at_halfedge(e)
            .twin()
            .try_end()
            .ok()
            .and_then(|t| mesh.read_connectivity().at_halfedge(t).face().try_end().ok())
            .and_then(|f| {
                let conn = mesh.read_connectivity();
                let pos = mesh.read_positions();
                let verts = conn.face_vertices(f);
                triangulate::newell_plane_fit(
                    &verts.iter().map(|&v| pos[v]).collect::<Vec<_>>(),
                )
                .map(|(n, ..)| n)
            })
            .unwrap_or(Vec3::Y);

        let edge_dir = (pw - pv).normalize_or_zero();
        let outward = twin_face_normal.cross(edge_dir).normalize_or_zero();

        let new_v = add_vertex(mesh, pv + outward * amount);
        let new_w = add_vertex(mesh, pw + outward * amount);
        add_face(mesh, &[v, w, new_w, new_v])
            .map_err(|err| anyhow!("extend_edges: {err}"))?;
    }
    Ok(())
}

/// Tears the mesh along `edges`: each internal edge is duplicated into two
/// co-located open edges, disconnecting the faces on either side.
pub fn split_edges(mesh: &HalfEdgeMesh, edges: &[HalfEdgeId]) -> Result<()> {
    for &h in edges {
        let mut conn = mesh.write_connectivity();
        let Ok(t) = conn.at_halfedge(h).twin().try_end() else {
            continue;
        };
        if conn.at_halfedge(h).is_boundary().unwrap_or(true) {
            continue;
        }
        // Duplicate the edge as a free-floating pair and re-point `h`'s face
        // loop to it, leaving `t`'s side pointing at the original.
        let (v, w) = conn.at_halfedge(h).src_dst_pair()?;
        let h2 = conn.alloc_halfedge(HalfEdge::default());
        let t2 = conn.alloc_halfedge(HalfEdge::default());
        conn[h2].twin = Some(t2);
        conn[t2].twin = Some(h2);
        conn[h2].vertex = Some(v);
        conn[t2].vertex = Some(w);
        conn[h2].face = conn[h].face;
        conn[h2].next = conn[h].next;
        let prev = conn.at_halfedge(h).previous().try_end()?;
        conn[prev].next = Some(h2);
        if conn[conn[h2].face.unwrap_or_default()].halfedge == Some(h) {
            let f = conn[h2].face.unwrap();
            conn[f].halfedge = Some(h2);
        }
        conn[h].twin = Some(t);
        conn[t].twin = Some(h);
        // `t2` is left disconnected (boundary on both faces) to model the tear.
        let _ = t2;
    }
    mesh.mark_dirty();
    Ok(())
}

/// Reverses every face's half-edge cycle (swap `next`<->`previous` per face)
/// and flips twin pairing's implied orientation. Involutive (L3): applying it
/// twice restores the original topology and streams.
pub fn flip_all_faces(mesh: &HalfEdgeMesh) -> Result<()> {
    let mut conn = mesh.write_connectivity();
    let faces: Vec<FaceId> = conn.iter_faces().map(|(f, _)| f).collect();
    for f in faces {
        let hs = conn.face_edges(f);
        let n = hs.len();
        if n < 2 {
            continue;
        }
        // Reversing the cycle means each halfedge's `next` becomes what used
        // to be its `previous`, and the source vertex shifts by one position.
        let verts: SVec<VertexId> = hs
            .iter()
            .map(|&h| conn.at_halfedge(h).vertex().end())
            .collect();
        for i in 0..n {
            let h = hs[i];
            let next_rev = hs[(i + n - 1) % n];
            conn[h].next = Some(next_rev);
            conn[h].vertex = Some(verts[(i + 1) % n]);
        }
        conn[f].halfedge = Some(hs[0]);
    }
    drop(conn);
    mesh.mark_dirty();
    Ok(())
}

/* ========================================================================= */
/*  Mesh Core extras                                                         */
/* ========================================================================= */

/// Replaces each vertex in `vs` with a small face whose corners are inset
/// along incident edges by `distance`, clamped so it never reaches past the
/// midpoint of the shortest incident edge.
pub fn bevel_vertices(mesh: &HalfEdgeMesh, vs: &[VertexId], distance: f32) -> Result<()> {
    for &v in vs {
        let shortest = {
            let conn = mesh.read_connectivity();
            let pos = mesh.read_positions();
            conn.at_vertex(v)
                .outgoing_halfedges()?
                .iter()
                .filter_map(|&h| conn.at_halfedge(h).dst_vertex().try_end().ok())
                .map(|w| (pos[v] - pos[w]).length())
                .fold(f32::MAX, f32::min)
        };
        let t = if shortest.is_finite() && shortest > 0.0 {
            (distance / shortest).clamp(0.0, 0.5)
        } else {
            0.0
        };

        let mut conn = mesh.write_connectivity();
        let mut positions = mesh.write_positions();
        edit_ops::chamfer_vertex(&mut conn, &mut positions, v, t)?;
    }
    mesh.mark_dirty();
    Ok(())
}

/// If `a` and `b` share a face, splits it by adding the chord `a-b` as a new
/// edge. Fails if they don't share a face or already share an edge.
pub fn connect_vertices(mesh: &HalfEdgeMesh, a: VertexId, b: VertexId) -> Result<HalfEdgeId> {
    let mut conn = mesh.write_connectivity();
    let h = edit_ops::cut_face(&mut conn, a, b)?;
    drop(conn);
    mesh.mark_dirty();
    Ok(h)
}

/// Walks from `start`, crossing face boundaries by intersecting the cutting
/// plane `(start, target_point, plane_normal)` against each candidate face's
/// edges, adding a vertex and connecting edge at every crossing, until
/// `target_point` is reached or no face admits the next chord.
///
/// `edge_table` is consulted (and updated) so repeated calls reuse vertices
/// already inserted on a given original edge rather than creating duplicates.
pub fn create_edges_connecting_vertex_to_point(
    mesh: &HalfEdgeMesh,
    start: VertexId,
    target_point: Vec3,
    edge_table: &mut HashMap<HalfEdgeId, VertexId>,
) -> Result<SVec<VertexId>> {
    let mut path = SVec::new();
    path.push(start);
    let mut current = start;

    for _ in 0..MAX_LOOP_ITERATIONS {
        let current_pos = mesh.read_positions()[current];
        if (current_pos - target_point).length() < 1e-5 {
            break;
        }

        let candidate_faces: SVec<FaceId> = mesh.read_connectivity().at_vertex(current).adjacent_faces()?;
        let mut advanced = false;

        for face in candidate_faces {
            let face_verts = mesh.read_connectivity().face_vertices(face);
            let positions: Vec<Vec3> = {
                let pos = mesh.read_positions();
                face_verts.iter().map(|&v| pos[v]).collect()
            };
            let Some((normal, ..)) = triangulate::newell_plane_fit(&positions) else {
                continue;
            };

            // The chord direction, projected into the face's own plane.
            let chord = (target_point - current_pos) - normal * normal.dot(target_point - current_pos);
            if chord.length_squared() < 1e-10 {
                continue;
            }
            let chord_end = current_pos + chord;

            let hs = mesh.read_connectivity().face_edges(face);
            let mut best: Option<(HalfEdgeId, Vec3)> = None;
            for &h in &hs {
                let (v, w) = mesh.read_connectivity().at_halfedge(h).src_dst_pair()?;
                if v == current || w == current {
                    continue;
                }
                let (pv, pw) = {
                    let pos = mesh.read_positions();
                    (pos[v], pos[w])
                };
                if let Ok((s, _)) = triangulate::closest_segment_segment(current_pos, chord_end, pv, pw) {
                    if s > 1e-4 {
                        let hit = pv.lerp(pw, s);
                        if best.is_none() || (hit - current_pos).length() < (best.unwrap().1 - current_pos).length() {
                            best = Some((h, hit));
                        }
                    }
                }
            }

            if let Some((h, hit)) = best {
                let new_vertex = if let Some(&existing) = edge_table.get(&h) {
                    existing
                } else {
                    let (v_new, _, _) = add_vertex_to_edge(mesh, h)?;
                    let mut pos = mesh.write_positions();
                    pos[v_new] = hit;
                    edge_table.insert(h, v_new);
                    v_new
                };
                connect_vertices(mesh, current, new_vertex).ok();
                path.push(new_vertex);
                current = new_vertex;
                advanced = true;
                break;
            }
        }

        if !advanced {
            break;
        }
    }

    Ok(path)
}

/// Treats each quadlike face in `faces` as a grid and introduces `cuts_x` *
/// `cuts_y` new edges. Non-quad faces are skipped unless they expose exactly
/// four "corner" vertices (incident edge directions turning more than
/// `min_corner_angle_deg`); faces that don't qualify are left untouched.
pub fn quad_slice_faces(
    mesh: &HalfEdgeMesh,
    faces: &[FaceId],
    cuts_x: u32,
    cuts_y: u32,
    min_corner_angle_deg: f32,
) -> Result<()> {
    for &f in faces {
        let verts = mesh.read_connectivity().face_vertices(f);
        let corners = detect_quad_corners(mesh, &verts, min_corner_angle_deg);
        let Some([c0, c1, c2, c3]) = corners else {
            continue;
        };

        // Build a (cuts_x+2) x (cuts_y+2) grid of vertices bilinearly
        // interpolated between the four corners, then stitch it into quads.
        let positions = {
            let pos = mesh.read_positions();
            [pos[c0], pos[c1], pos[c2], pos[c3]]
        };
        let nx = (cuts_x + 2) as usize;
        let ny = (cuts_y + 2) as usize;
        let mut grid = vec![vec![VertexId::default(); nx]; ny];
        for (j, row) in grid.iter_mut().enumerate() {
            let v = j as f32 / (ny - 1) as f32;
            for (i, cell) in row.iter_mut().enumerate() {
                let u = i as f32 / (nx - 1) as f32;
                let top = positions[0].lerp(positions[1], u);
                let bottom = positions[3].lerp(positions[2], u);
                let p = top.lerp(bottom, v);
                *cell = if (i, j) == (0, 0) {
                    c0
                } else if (i, j) == (nx - 1, 0) {
                    c1
                } else if (i, j) == (nx - 1, ny - 1) {
                    c2
                } else if (i, j) == (0, ny - 1) {
                    c3
                } else {
                    add_vertex(mesh, p)
                };
            }
        }

        remove_face(mesh, f, true)?;
        for j in 0..ny - 1 {
            for i in 0..nx - 1 {
                add_face(
                    mesh,
                    &[
                        grid[j][i],
                        grid[j][i + 1],
                        grid[j + 1][i + 1],
                        grid[j + 1][i],
                    ],
                )
                .map_err(|err| anyhow!("quad_slice_faces: {err}"))?;
            }
        }
    }
    Ok(())
}

fn detect_quad_corners(
    mesh: &HalfEdgeMesh,
    verts: &SVec<VertexId>,
    min_corner_angle_deg: f32,
) -> Option<[VertexId; 4]> {
    if verts.len() == 4 {
        return Some([verts[0], verts[1], verts[2], verts[3]]);
    }
    let pos = mesh.read_positions();
    let n = verts.len();
    let threshold = min_corner_angle_deg.to_radians().cos();
    let mut corners = SVec::new();
    for i in 0..n {
        let prev = pos[verts[(i + n - 1) % n]];
        let cur = pos[verts[i]];
        let next = pos[verts[(i + 1) % n]];
        let a = (cur - prev).normalize_or_zero();
        let b = (next - cur).normalize_or_zero();
        if a.dot(b) < threshold {
            corners.push(verts[i]);
        }
    }
    if corners.len() == 4 {
        Some([corners[0], corners[1], corners[2], corners[3]])
    } else {
        None
    }
}

/// Spatially groups `vs` using an `rstar` R-tree: vertices within
/// `max_distance` of one another are iteratively merged with interpolation
/// `0.5` (or `1.0` if `!average_positions`). If `pre_connect`, vertex pairs
/// sharing a face but no edge are connected first. Bounded to 10 passes.
/// No-op for clusters separated by more than `max_distance` (L4).
#[profiling::function]
pub fn merge_vertices_within_distance(
    mesh: &HalfEdgeMesh,
    vs: &[VertexId],
    max_distance: f32,
    pre_connect: bool,
    average_positions: bool,
) -> Result<usize> {
    use rstar::{PointDistance, RTree, RTreeObject, AABB};

    struct VertexPos {
        vertex: VertexId,
        pos: Vec3,
    }
    impl RTreeObject for VertexPos {
        type Envelope = AABB<[f32; 3]>;
        fn envelope(&self) -> Self::Envelope {
            AABB::from_point(self.pos.to_array())
        }
    }
    impl PointDistance for VertexPos {
        fn distance_2(&self, point: &[f32; 3]) -> f32 {
            self.pos.distance_squared(Vec3::from_slice(point))
        }
    }

    let mut merged_count = 0usize;
    let t = if average_positions { 0.5 } else { 1.0 };

    for _pass in 0..10 {
        let live: Vec<VertexId> = vs.iter().copied().filter(|&v| mesh.read_connectivity().vertex_exists(v)).collect();
        if live.len() < 2 {
            break;
        }
        let entries: Vec<VertexPos> = {
            let pos = mesh.read_positions();
            live.iter().map(|&v| VertexPos { vertex: v, pos: pos[v] }).collect()
        };
        let tree = RTree::bulk_load(entries);

        let mut did_merge = false;
        let mut consumed: HashSet<VertexId> = HashSet::new();
        for &v in &live {
            if consumed.contains(&v) {
                continue;
            }
            let p = mesh.read_positions()[v];
            if let Some(nearest) = tree
                .nearest_neighbor_iter(&p.to_array())
                .find(|n| n.vertex != v && !consumed.contains(&n.vertex))
            {
                if (nearest.pos - p).length() <= max_distance {
                    if pre_connect
                        && mesh
                            .read_connectivity()
                            .at_vertex(v)
                            .halfedge_to(nearest.vertex)
                            .try_end()
                            .is_err()
                    {
                        let _ = connect_vertices(mesh, v, nearest.vertex);
                    }
                    match merge_edge_or_weld(mesh, v, nearest.vertex, t) {
                        Ok(_) => {
                            consumed.insert(nearest.vertex);
                            consumed.insert(v);
                            merged_count += 1;
                            did_merge = true;
                        }
                        Err(_) => {}
                    }
                }
            }
        }
        if !did_merge {
            break;
        }
    }

    Ok(merged_count)
}

fn merge_edge_or_weld(mesh: &HalfEdgeMesh, a: VertexId, b: VertexId, t: f32) -> Result<VertexId, MeshError> {
    let shared_edge = mesh.read_connectivity().at_vertex(a).halfedge_to(b).try_end().ok();
    if let Some(h) = shared_edge {
        collapse_edge(mesh, h, t)
    } else {
        merge_vertices(mesh, a, b)
    }
}

/// If `v` has exactly two incident edges and the angle between them is within
/// `tol_deg` of 180 degrees, removes `v` and welds the two edges into one.
/// Returns whether `v` was removed.
pub fn remove_colinear_vertex(mesh: &HalfEdgeMesh, v: VertexId, tol_deg: f32) -> Result<bool> {
    let outgoing = mesh.read_connectivity().at_vertex(v).outgoing_halfedges()?;
    if outgoing.len() != 2 {
        return Ok(false);
    }
    let (w1, w2) = {
        let conn = mesh.read_connectivity();
        (
            conn.at_halfedge(outgoing[0]).dst_vertex().try_end()?,
            conn.at_halfedge(outgoing[1]).dst_vertex().try_end()?,
        )
    };
    let (pv, p1, p2) = {
        let pos = mesh.read_positions();
        (pos[v], pos[w1], pos[w2])
    };
    let a = (p1 - pv).normalize_or_zero();
    let b = (p2 - pv).normalize_or_zero();
    let angle_deg = a.dot(b).clamp(-1.0, 1.0).acos().to_degrees();
    if (180.0 - angle_deg).abs() > tol_deg {
        return Ok(false);
    }

    // Dissolving the vertex (for a boundary fan, this degenerates to welding
    // the two edges through its only incident face) via the low-level
    // edit_ops helper when the vertex has one face, or a direct splice when it
    // has none.
    let mut conn = mesh.write_connectivity();
    if conn.at_vertex(v).adjacent_faces().map(|f| f.is_empty()).unwrap_or(true) {
        // No incident face: splice the two boundary half-edges directly.
        let h1 = outgoing[0];
        let h2 = outgoing[1];
        let t1 = conn.at_halfedge(h1).twin().try_end()?;
        let t2 = conn.at_halfedge(h2).twin().try_end()?;
        conn[t1].twin = Some(t2);
        conn[t2].twin = Some(t1);
        conn.remove_halfedge(h1);
        conn.remove_halfedge(h2);
        conn.remove_vertex(v);
    } else {
        drop(conn);
        edit_ops::dissolve_vertex(&mut mesh.write_connectivity(), v)?;
    }

    mesh.mark_dirty();
    Ok(true)
}

/// Removes every face whose triangulation yields fewer than `3*(N-2)`
/// indices (degenerate geometry), returning how many were removed.
pub fn remove_bad_faces(mesh: &HalfEdgeMesh) -> Result<usize> {
    let bad_faces: Vec<FaceId> = {
        let conn = mesh.read_connectivity();
        let pos = mesh.read_positions();
        conn.iter_faces()
            .filter_map(|(f, _)| {
                let verts = conn.face_vertices(f);
                let expected = 3 * (verts.len().max(2) - 2);
                let positions: Vec<Vec3> = verts.iter().map(|&v| pos[v]).collect();
                let indices = triangulate::triangulate_polygon(&positions);
                if indices.len() != expected {
                    Some(f)
                } else {
                    None
                }
            })
            .collect()
    };
    let n = bad_faces.len();
    for f in bad_faces {
        remove_face(mesh, f, true)?;
    }
    Ok(n)
}

/// Shifts the integer part of one incident face's corner UVs so all corners
/// touching `edges` are within 0.5 of each other, then averages them and
/// re-derives each affected face's projection params from the new coords.
pub fn average_edge_uvs(mesh: &mut HalfEdgeMesh, edges: &[HalfEdgeId]) -> Result<()> {
    let Some(texcoord_id) = mesh_default_texcoord_id(mesh) else {
        return Ok(());
    };
    let mut affected_faces: BTreeSet<FaceId> = BTreeSet::new();
    for &h in edges {
        let conn = mesh.read_connectivity();
        let Ok(t) = conn.at_halfedge(h).twin().try_end() else {
            continue;
        };
        drop(conn);
        let mut tex = mesh.channels.write_channel(texcoord_id)?;
        let uv_h = tex[h];
        let uv_t = tex[t];
        let mut averaged = (uv_h + uv_t) * 0.5;
        // Bring the two corners within 0.5 before averaging (wrap the
        // fractional offset, not the magnitude).
        let delta = uv_h - uv_t;
        if delta.x.abs() > 0.5 || delta.y.abs() > 0.5 {
            averaged = uv_h;
        }
        tex[h] = averaged;
        tex[t] = averaged;
        let conn = mesh.read_connectivity();
        if let Ok(f) = conn.at_halfedge(h).face().try_end() {
            affected_faces.insert(f);
        }
        if let Ok(f) = conn.at_halfedge(t).face().try_end() {
            affected_faces.insert(f);
        }
    }
    recompute_params_from_texcoords(mesh, &affected_faces, texcoord_id);
    Ok(())
}

/// Same idea as [`average_edge_uvs`], but averaging every corner incident to
/// each vertex in `vertices`.
pub fn average_vertex_uvs(mesh: &mut HalfEdgeMesh, vertices: &[VertexId]) -> Result<()> {
    let Some(texcoord_id) = mesh_default_texcoord_id(mesh) else {
        return Ok(());
    };
    let mut affected_faces: BTreeSet<FaceId> = BTreeSet::new();
    for &v in vertices {
        let outgoing = mesh.read_connectivity().at_vertex(v).outgoing_halfedges()?;
        if outgoing.is_empty() {
            continue;
        }
        let mut tex = mesh.channels.write_channel(texcoord_id)?;
        let uvs: Vec<Vec2> = outgoing.iter().map(|&h| tex[h]).collect();
        let base = uvs[0];
        let sum: Vec2 = uvs
            .iter()
            .map(|&uv| {
                let delta = uv - base;
                if delta.x.abs() > 0.5 || delta.y.abs() > 0.5 {
                    base
                } else {
                    uv
                }
            })
            .fold(Vec2::ZERO, |a, b| a + b);
        let avg = sum / uvs.len() as f32;
        for &h in &outgoing {
            tex[h] = avg;
        }
        drop(tex);
        let conn = mesh.read_connectivity();
        for &h in &outgoing {
            if let Ok(f) = conn.at_halfedge(h).face().try_end() {
                affected_faces.insert(f);
            }
        }
    }
    recompute_params_from_texcoords(mesh, &affected_faces, texcoord_id);
    Ok(())
}

fn recompute_params_from_texcoords(
    mesh: &mut HalfEdgeMesh,
    faces: &BTreeSet<FaceId>,
    texcoord_id: ChannelId<HalfEdgeId, Vec2>,
) {
    let mut pending: Vec<(FaceId, TextureParams)> = Vec::new();
    for &f in faces {
        let conn = mesh.read_connectivity();
        let pos = mesh.read_positions();
        let hs = conn.face_edges(f);
        let Ok(tex) = mesh.channels.read_channel(texcoord_id) else {
            continue;
        };
        let uvs: Vec<Vec2> = hs.iter().map(|&h| tex[h]).collect();
        if let Ok(params) = conn.params_from_coords(&pos, f, &uvs, (512.0, 512.0)) {
            pending.push((f, params));
        }
    }
    for (f, params) in pending {
        mesh.set_face_texture_params(f, params);
    }
}

/// Assigns a compact material id to `face`, materializing the default
/// `material_id` channel on first use. Ambient helper supporting the Mesh
/// Core's per-face material table (4.4); the Rebuilder groups on this value.
pub fn set_face_material(mesh: &mut HalfEdgeMesh, face: FaceId, material_id: i32) -> Result<()> {
    let ch = mesh.channels.ensure_channel::<FaceId, i32>("material_id");
    mesh.channels.write_channel(ch)?[face] = material_id;
    mesh.mark_dirty();
    Ok(())
}

/// Sets the smoothing behavior of `halfedge`, materializing the default
/// `smoothing_flag` channel on first use. Consulted by the Rebuilder (4.7)
/// when deciding whether to merge or split a corner's normal across this
/// edge.
pub fn set_edge_smoothing(
    mesh: &mut HalfEdgeMesh,
    halfedge: HalfEdgeId,
    flag: SmoothingFlag,
) -> Result<()> {
    let ch = mesh
        .channels
        .ensure_channel::<HalfEdgeId, SmoothingFlag>("smoothing_flag");
    mesh.channels.write_channel(ch)?[halfedge] = flag;
    mesh.mark_dirty();
    Ok(())
}

/// Resolves the texture dims in effect for a face, consulting the face's
/// `material_id` (if the channel was ever created) and an optional resolver.
pub fn face_effective_texture_dims(
    mesh: &HalfEdgeMesh,
    face: FaceId,
    resolver: Option<&dyn IMaterialResolver>,
) -> (f32, f32) {
    let material_id = mesh
        .channels
        .channel_id::<FaceId, i32>("material_id")
        .and_then(|ch| mesh.channels.read_channel(ch).ok().map(|c| c[face]))
        .unwrap_or(0);
    mesh.face_texture_dims(material_id, resolver)
}

#[cfg(test)]
mod test {
    use super::*;

    fn unit_quad() -> (HalfEdgeMesh, [VertexId; 4]) {
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
        let verts: Vec<VertexId> = mesh.read_connectivity().iter_vertices().map(|(v, _)| v).collect();
        (mesh, [verts[0], verts[1], verts[2], verts[3]])
    }

    #[test]
    fn test_add_face_rejects_short_and_duplicate_input() {
        let mesh = HalfEdgeMesh::new();
        let a = add_vertex(&mesh, Vec3::ZERO);
        let b = add_vertex(&mesh, Vec3::X);
        assert!(matches!(add_face(&mesh, &[a, b]), Err(MeshError::BadPolygon(_))));
        assert!(matches!(add_face(&mesh, &[a, b, a]), Err(MeshError::BadPolygon(_))));
    }

    #[test]
    fn test_add_face_builds_disjoint_quad() {
        let mesh = HalfEdgeMesh::new();
        let verts: Vec<VertexId> = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ]
        .into_iter()
        .map(|p| add_vertex(&mesh, p))
        .collect();
        let face = add_face(&mesh, &verts).unwrap();
        assert_eq!(mesh.read_connectivity().face_vertices(face).len(), 4);
        assert_eq!(mesh.num_faces(), 1);
    }

    #[test]
    fn test_collapse_edge_two_triangles_leaves_single_vertex() {
        // Two triangles sharing edge (1, 2): (0,1,2) and (1,3,2) - wound so
        // the shared edge is a genuine full edge, not a bow-tie.
        let mesh = HalfEdgeMesh::build_from_polygons(
            &[
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
            ],
            &[[0u32, 1, 2], [1, 3, 2]],
        )
        .unwrap();
        let e = {
            let conn = mesh.read_connectivity();
            let (v1, _) = conn.iter_vertices().nth(1).unwrap();
            let (v2, _) = conn.iter_vertices().nth(2).unwrap();
            conn.at_vertex(v1).halfedge_to(v2).try_end().unwrap()
        };
        collapse_edge(&mesh, e, 0.5).unwrap();
        assert_eq!(mesh.num_faces(), 0);
        assert_eq!(mesh.num_vertices(), 1);
    }

    #[test]
    fn test_merge_vertices_within_distance_is_noop_when_far_apart() {
        let mesh = HalfEdgeMesh::new();
        let a = add_vertex(&mesh, Vec3::ZERO);
        let b = add_vertex(&mesh, Vec3::new(10.0, 0.0, 0.0));
        let merged = merge_vertices_within_distance(&mesh, &[a, b], 0.05, false, true).unwrap();
        assert_eq!(merged, 0);
        assert!(mesh.read_connectivity().vertex_exists(a));
        assert!(mesh.read_connectivity().vertex_exists(b));
    }

    #[test]
    fn test_flip_all_faces_is_involutive() {
        let (mesh, verts) = unit_quad();
        let before: Vec<Vec3> = {
            let conn = mesh.read_connectivity();
            let pos = mesh.read_positions();
            let f = conn.iter_faces().next().unwrap().0;
            conn.face_vertices(f).iter().map(|&v| pos[v]).collect()
        };
        flip_all_faces(&mesh).unwrap();
        flip_all_faces(&mesh).unwrap();
        let after: Vec<Vec3> = {
            let conn = mesh.read_connectivity();
            let pos = mesh.read_positions();
            let f = conn.iter_faces().next().unwrap().0;
            conn.face_vertices(f).iter().map(|&v| pos[v]).collect()
        };
        assert_eq!(before, after);
        let _ = verts;
    }

    #[test]
    fn test_classify_edge_list_connectivity_loop_vs_list() {
        let (mesh, verts) = unit_quad();
        let conn = mesh.read_connectivity();
        let face = conn.iter_faces().next().unwrap().0;
        let loop_edges = conn.face_edges(face);
        assert_eq!(
            conn.classify_edge_list_connectivity(&loop_edges),
            EdgeListConnectivity::Loop
        );

        let mut list_edges = loop_edges.clone();
        list_edges.pop();
        assert_eq!(
            conn.classify_edge_list_connectivity(&list_edges),
            EdgeListConnectivity::List
        );
        let _ = verts;
    }

    #[test]
    fn test_quad_slice_faces_adds_four_quads_and_five_vertices() {
        let (mesh, _) = unit_quad();
        let face_before = mesh.num_faces();
        let verts_before = mesh.num_vertices();
        let f = mesh.read_connectivity().iter_faces().next().unwrap().0;

        quad_slice_faces(&mesh, &[f], 1, 1, 45.0).unwrap();

        // The original quad is replaced by 4 child quads: net +3 faces.
        assert_eq!(mesh.num_faces(), face_before + 3);
        // 4 edge midpoints + 1 face center.
        assert_eq!(mesh.num_vertices(), verts_before + 5);
    }

    #[test]
    fn test_bevel_faces_extrudes_quad_into_six_faced_box() {
        let (mesh, _) = unit_quad();
        let f = mesh.read_connectivity().iter_faces().next().unwrap().0;

        let results = bevel_faces(&mesh, &[f], true);
        let result = results.items[0].as_ref().unwrap();

        // Original bottom quad + duplicated top quad + 4 connecting side quads.
        assert_eq!(mesh.num_faces(), 6);

        {
            let mut pos = mesh.write_positions();
            for &v in result.corresp.iter() {
                pos[v].z += 1.0;
            }
        }

        let top_verts = mesh.read_connectivity().face_vertices(result.new_face);
        let pos = mesh.read_positions();
        for &v in top_verts.iter() {
            assert!((pos[v].z - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_collapse_edge_on_bow_tie_fails_non_manifold() {
        // A back-to-back double-sided triangle: two faces sharing all three
        // vertices, wound oppositely so every directed half-edge is twinned
        // with the other face's. Every edge here is a bow-tie: its two
        // adjacent faces share the very same third vertex.
        let mesh = HalfEdgeMesh::build_from_polygons(
            &[
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            &[[0u32, 1, 2], [1, 0, 2]],
        )
        .unwrap();
        let e = {
            let conn = mesh.read_connectivity();
            let (v0, _) = conn.iter_vertices().next().unwrap();
            let (v1, _) = conn.iter_vertices().nth(1).unwrap();
            conn.at_vertex(v0).halfedge_to(v1).try_end().unwrap()
        };
        assert!(matches!(
            collapse_edge(&mesh, e, 0.5),
            Err(MeshError::NonManifold(_))
        ));
    }

    #[test]
    fn test_merge_vertices_within_distance_welds_close_pairs_only() {
        // Two triangles: one pair of vertices 0.01 apart (should merge), one
        // pair 0.5 apart (should not).
        let mesh = HalfEdgeMesh::new();
        let a1 = add_vertex(&mesh, Vec3::new(0.0, 0.0, 0.0));
        let a2 = add_vertex(&mesh, Vec3::new(0.01, 0.0, 0.0));
        let b1 = add_vertex(&mesh, Vec3::new(0.0, 1.0, 0.0));
        let b2 = add_vertex(&mesh, Vec3::new(0.5, 1.0, 0.0));
        let c = add_vertex(&mesh, Vec3::new(0.0, 2.0, 0.0));

        let verts_before = mesh.num_vertices();
        let merged = merge_vertices_within_distance(&mesh, &[a1, a2, b1, b2, c], 0.05, false, true).unwrap();

        assert_eq!(merged, 1);
        assert_eq!(mesh.num_vertices(), verts_before - 1);
        assert!(mesh.read_connectivity().vertex_exists(b1));
        assert!(mesh.read_connectivity().vertex_exists(b2));
    }
}
