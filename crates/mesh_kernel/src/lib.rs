// Copyright (C) 2022 setzer22 and contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Some useful re-exports
pub mod prelude;

/// The halfedge graph data structure and main edit operations
pub mod mesh;

/// Error types and result aliases shared across the kernel
pub mod error;

/// Interior-mutability and reference-counting abstractions, swapped between
/// `Rc`/`RefCell` and `Arc`/`AtomicRefCell` by the `sync` feature
pub mod sync;
