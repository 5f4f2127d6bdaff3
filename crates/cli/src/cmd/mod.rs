use std::path::Path;

use hivenet_types::StartBundle;
use itertools::Itertools;

use crate::{config::save, error::Error};

pub mod genesis;
pub mod keys;
pub mod proxy;

/// File holding a bundle's parameters, one `KEY=value` per line.
pub const PARAMS_FILE: &str = "params.env";

/// Writes the files of `bundle` under `dir`, plus its parameters when there are any.
///
/// Returns the number of files written.
pub fn write_bundle(dir: &Path, bundle: &StartBundle) -> Result<usize, Error> {
    for (path, content) in &bundle.files {
        save(&dir.join(path.trim_start_matches('/')), content.as_ref())?;
    }
    if bundle.params.is_empty() {
        return Ok(bundle.files.len());
    }
    let params = bundle.params.iter().map(|(k, v)| format!("{k}={v}\n")).join("");
    save(&dir.join(PARAMS_FILE), params.as_bytes())?;
    Ok(bundle.files.len() + 1)
}
