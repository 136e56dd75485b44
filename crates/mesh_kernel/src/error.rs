// Copyright (C) 2023 setzer22 and contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed error taxonomy for mesh editing operators.
//!
//! Most internal plumbing still returns `anyhow::Result` for convenience
//! (`bail!`/`anyhow!` read well inline), but operators whose failure mode is
//! part of the documented contract return a [`MeshError`] so callers can
//! match on it instead of parsing a message string.

use thiserror::Error;

use crate::mesh::halfedge::id_types::{FaceId, HalfEdgeId, VertexId};

/// A handle whose generation no longer matches the live entry in its pool.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StaleHandleKind {
    #[error("vertex handle is stale")]
    Vertex(VertexId),
    #[error("half-edge handle is stale")]
    HalfEdge(HalfEdgeId),
    #[error("face handle is stale")]
    Face(FaceId),
}

/// Errors returned by topology and mesh-editing operators.
///
/// This mirrors the error taxonomy operators are documented against: every
/// variant here is something a caller is expected to branch on, as opposed to
/// the ad-hoc `anyhow::Error` messages used for internal invariant failures
/// that should never occur in correct code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// A handle whose generation no longer matches the pool it was drawn from.
    #[error("stale handle: {0}")]
    StaleHandle(StaleHandleKind),

    /// Fewer than 3 vertices, a repeated vertex, or an insertion that would
    /// create a non-manifold edge.
    #[error("bad polygon: {0}")]
    BadPolygon(String),

    /// An edit that would place a third face on a full edge, or zip edges
    /// whose endpoints are incompatible.
    #[error("non-manifold edit: {0}")]
    NonManifold(String),

    /// Triangulation, plane-fit, or texture-basis solve lost rank; the
    /// operator was skipped for the offending element.
    #[error("degenerate geometry: {0}")]
    Degenerate(String),

    /// Operator called with an empty input set. This is a no-op success, not
    /// a failure, but callers that want to distinguish "did nothing" from
    /// "did something" can match on it.
    #[error("operator called with an empty set")]
    Empty,

    /// A numeric argument was outside its documented domain.
    #[error("argument out of range: {0}")]
    OutOfRange(String),
}

impl MeshError {
    pub fn is_empty(&self) -> bool {
        matches!(self, MeshError::Empty)
    }
}

/// The result of one item in a bulk operator (e.g. `bevel_faces` over a face
/// list): bulk operators never fail the whole batch over one bad item, they
/// report per-item status and proceed with the rest.
#[derive(Debug, Clone)]
pub struct BatchResult<T> {
    pub ok_count: usize,
    pub items: Vec<Result<T, MeshError>>,
}

impl<T> BatchResult<T> {
    pub fn new(items: Vec<Result<T, MeshError>>) -> Self {
        let ok_count = items.iter().filter(|r| r.is_ok()).count();
        Self { ok_count, items }
    }

    pub fn oks(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter_map(|r| r.as_ref().ok())
    }
}
