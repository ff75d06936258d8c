// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Materialization of statements into script files.
//!
//! The SQL client only reads scripts from disk, so every statement is first
//! written to a uniquely named file in the scratch directory. The file lives
//! exactly as long as the [`ScriptFile`] handle that created it.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StatementError;
use crate::session::SessionId;

/// How often creating a script is attempted when its session directory
/// disappears underneath it.
const CREATE_ATTEMPTS: usize = 3;

/// Handle to a script file in the scratch directory.
///
/// Dropping the handle removes the file. Callers that want to observe removal
/// failures should call [`ScriptFile::remove`] instead.
#[derive(Debug)]
pub struct ScriptFile {
    id: Uuid,
    path: PathBuf,
    removed: bool,
}

impl ScriptFile {
    /// Writes `statement` to a new script file for `session` beneath
    /// `scratch_dir`.
    ///
    /// The file is named after a freshly generated version 4 UUID, so
    /// concurrent calls never collide. The file is created exclusively and its
    /// contents are exactly the bytes of `statement`.
    pub async fn create(
        scratch_dir: &Path,
        session: &SessionId,
        statement: &str,
    ) -> Result<ScriptFile, StatementError> {
        let id = Uuid::new_v4();
        let path = script_path(scratch_dir, session, id);
        let io_err = |source| StatementError::Io {
            path: path.clone(),
            source,
        };

        // Another request in the same session may remove the session
        // directory between creating it and creating the file in it.
        let mut attempts = 0;
        let mut file = loop {
            attempts += 1;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(io_err)?;
            }
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => break file,
                Err(e) if e.kind() == io::ErrorKind::NotFound && attempts < CREATE_ATTEMPTS => {
                    continue
                }
                Err(e) => return Err(io_err(e)),
            }
        };

        // From here on the handle owns the file, so an early return below
        // removes the partially written script.
        let script = ScriptFile {
            id,
            path: path.clone(),
            removed: false,
        };
        file.write_all(statement.as_bytes()).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;

        info!(script_id = %id, path = %path.display(), "wrote script file");
        debug!(script_id = %id, statement, "script contents");
        Ok(script)
    }

    /// The unique identifier of this script.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The location of this script on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the script file.
    ///
    /// A file that is already gone is not an error.
    pub async fn remove(mut self) -> Result<(), io::Error> {
        self.removed = true;
        match fs::remove_file(&self.path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => (),
        }
        if let Some(dir) = self.path.parent() {
            if let Err(e) = fs::remove_dir(dir).await {
                log_session_dir_error(dir, &e);
            }
        }
        Ok(())
    }
}

impl Drop for ScriptFile {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                warn!(
                    script_id = %self.id,
                    path = %self.path.display(),
                    "unable to remove script file: {e}"
                );
            }
            _ => {}
        }
        if let Some(dir) = self.path.parent() {
            if let Err(e) = std::fs::remove_dir(dir) {
                log_session_dir_error(dir, &e);
            }
        }
    }
}

/// Session directories are removed once their last script is gone. A
/// directory that still holds scripts of concurrent requests fails to be
/// removed, which is expected.
fn log_session_dir_error(dir: &Path, e: &io::Error) {
    debug!("session directory {} not removed: {e}", dir.display());
}

/// Returns the path of the script with the given `id` for `session`.
pub fn script_path(scratch_dir: &Path, session: &SessionId, id: Uuid) -> PathBuf {
    scratch_dir
        .join(session.as_str())
        .join(format!("script_{}.sql", id.as_hyphenated()))
}
