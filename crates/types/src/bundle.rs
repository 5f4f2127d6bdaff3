//! Start-time options handed to the simulator when a client container is launched.

use std::collections::BTreeMap;

use crate::aliases::Bytes;

/// Environment parameters (`HIVE_*`) of a client container.
pub type Params = BTreeMap<String, String>;

/// Parameters plus files to place into a client container before it starts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartBundle {
    pub params: Params,
    pub files: BTreeMap<String, Bytes>,
}

impl StartBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_params(params: Params) -> Self {
        Self { params, files: BTreeMap::new() }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    pub fn file(mut self, path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    /// Merges `other` into `self`; entries of `other` win.
    pub fn merge(mut self, other: StartBundle) -> Self {
        self.params.extend(other.params);
        self.files.extend(other.files);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}
