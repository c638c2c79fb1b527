// Copyright 2025 Rowscan Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The search cursor subsystem
//!
//! - [`SearchCursor`] / [`RelationCursor`] - the caller-driven state machine
//! - [`IndexSearch`] - visibility-filtered scan over the planned key
//! - [`DataSearch`] - exact-match clustering fetch for partial keys
//! - [`SearchReturnKey`] - reusable decoded-entry buffer
//! - [`TimeConstraint`] - MVCC visibility window
//! - [`UserSearchRegistry`] - per-connection cursor list and broadcasts
//! - [`IndexValidationSearch`] - uncommitted-tree scan for commit validation

pub mod cursor;
pub mod data_search;
pub mod index_search;
pub mod registry;
pub mod return_key;
pub mod time_constraint;
pub mod validation;

pub use cursor::{RelationCursor, ScanStats, SearchCursor};
pub use data_search::{DataFetch, DataSearch};
pub use index_search::{IndexSearch, IndexStep};
pub use registry::{RegistryCheckout, SharedCursorState, SlotId, UserSearchRegistry};
pub use return_key::SearchReturnKey;
pub use time_constraint::TimeConstraint;
pub use validation::IndexValidationSearch;
