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

//! Scan configuration
//!

/// Default number of same-direction steps before a scan is classified
/// long-sequential
pub const DEFAULT_SEQUENTIAL_THRESHOLD: u32 = 16;

/// Default bound on the pessimistic not-found retry loop inside one step
pub const DEFAULT_MAX_STEP_RETRIES: u32 = 128;

/// Default lock wait budget in milliseconds
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Tunables for cursor scans
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Same-direction steps before the scan is marked long-sequential
    /// Default: 16
    pub sequential_threshold: u32,

    /// Maximum consecutive not-found index steps retried inside a single
    /// pessimistic step call before the result is surfaced
    /// Default: 128
    pub max_step_retries: u32,

    /// Lock timeout applied when the transaction layer does not supply one
    /// Default: 5000
    pub default_lock_timeout_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            sequential_threshold: DEFAULT_SEQUENTIAL_THRESHOLD,
            max_step_retries: DEFAULT_MAX_STEP_RETRIES,
            default_lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl ScanConfig {
    /// Creates the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the long-sequential threshold
    pub fn with_sequential_threshold(mut self, threshold: u32) -> Self {
        self.sequential_threshold = threshold.max(1);
        self
    }

    /// Sets the step retry bound
    pub fn with_max_step_retries(mut self, retries: u32) -> Self {
        self.max_step_retries = retries.max(1);
        self
    }
}
