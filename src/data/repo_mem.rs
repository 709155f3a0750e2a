//! In-memory data source, used by embedding hosts that materialise records
//! themselves and by tests.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::common::error::{EngineError, EngineResult};

use super::domain::{DataSource, Record};

#[derive(Default)]
pub struct MemoryDataSource {
    datasets: RwLock<HashMap<String, Vec<Record>>>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot served for `definition_name`.
    pub fn put(&self, definition_name: impl Into<String>, records: Vec<Record>) {
        self.datasets.write().insert(definition_name.into(), records);
    }
}

impl DataSource for MemoryDataSource {
    fn snapshot(&self, definition_name: &str) -> EngineResult<Vec<Record>> {
        self.datasets
            .read()
            .get(definition_name)
            .cloned()
            .ok_or_else(|| EngineError::not_found("dataset", definition_name))
    }
}
