// Copyright Istio Authors
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

use std::sync::{Arc, Mutex};

use crate::issuance::RequestRecord;

/// AuditLog keeps every issued credential for the lifetime of the process. Records are never
/// removed or modified once appended.
#[derive(Clone, Debug, Default)]
pub struct AuditLog {
    records: Arc<Mutex<Vec<RequestRecord>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: RequestRecord) {
        self.records.lock().expect("mutex").push(record);
    }

    /// snapshot returns a copy of all records, oldest first.
    pub fn snapshot(&self) -> Vec<RequestRecord> {
        self.records.lock().expect("mutex").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
