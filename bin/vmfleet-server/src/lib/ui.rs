// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static file serving for an optional browser UI.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use dropshot::HttpError;

const INDEX_FILE: &str = "index.html";

/// Checks that `folder` exists and is a directory.
pub fn check_folder(folder: &Path) -> anyhow::Result<()> {
    let metadata = std::fs::metadata(folder)?;
    anyhow::ensure!(
        metadata.is_dir(),
        "path {} is not a directory",
        folder.display()
    );
    Ok(())
}

/// Maps the components of a `/ui/...` request path to a file below `root`.
///
/// Components that could escape `root` are refused. An empty path names the
/// index file.
pub(crate) fn resolve(
    root: &Path,
    components: &[String],
) -> Result<PathBuf, HttpError> {
    let mut path = root.to_path_buf();
    for component in components {
        if component.is_empty()
            || component == "."
            || component == ".."
            || component.contains(['/', '\\'])
        {
            return Err(HttpError::for_bad_request(
                None,
                format!("invalid UI path component {component:?}"),
            ));
        }
        path.push(component);
    }

    if components.is_empty() || path.is_dir() {
        path.push(INDEX_FILE);
    }
    Ok(path)
}

pub(crate) fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

pub(crate) async fn read(path: &Path) -> Result<Vec<u8>, HttpError> {
    tokio::fs::read(path).await.map_err(|e| {
        let msg = format!("failed to read {}: {}", path.display(), e);
        match e.kind() {
            ErrorKind::NotFound => HttpError::for_not_found(None, msg),
            _ => HttpError::for_internal_error(msg),
        }
    })
}
