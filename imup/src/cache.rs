//! On-disk spool of unshipped send jobs.
//!
//! Jobs live as JSON files under the user cache directory, named by the
//! md5 of their serialised form so rewriting the same job is idempotent.
//! The sender spools here when shut down mid-delivery; the supervisor
//! reads the directory back at startup, enqueues everything and clears
//! it.

use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::sender::SendJob;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cannot serialise job: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
}

/// Directory the spool lives in: `<user cache>/imup`.
#[must_use]
pub fn cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("imup")
}

/// Write a job into the spool. The filename is the md5 of the serialised
/// job, so writing the same job twice is a no-op.
///
/// # Errors
///
/// Serialisation and filesystem failures.
pub fn to_user_cache(dir: &Path, job: &SendJob) -> Result<PathBuf, CacheError> {
    fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o755));
    }

    let bytes = serde_json::to_vec(job)?;
    let digest = md5::compute(&bytes);
    let path = dir.join(format!("{digest:x}.json"));

    fs::write(&path, &bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o666));
    }

    debug!(path = %path.display(), "spooled job to user cache");
    Ok(path)
}

/// Read every spooled job back. Unreadable or unparsable files are skipped
/// with a warning; a missing directory is simply empty.
#[must_use]
pub fn from_cache_dir(dir: &Path) -> Vec<SendJob> {
    let mut jobs = Vec::new();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "spool directory not readable, assuming empty");
            return jobs;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }

        match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<SendJob>(&bytes) {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unparsable spool file");
                }
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot read spool file");
            }
        }
    }

    jobs
}

/// Delete every file in the spool directory. Best effort.
pub fn clear_cache(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        if let Err(err) = fs::remove_file(entry.path()) {
            warn!(path = %entry.path().display(), error = %err, "cannot remove spool file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn job(payload: serde_json::Value) -> SendJob {
        SendJob {
            address: "https://api.imup.io/v1/data/connectivity".to_string(),
            data: payload,
        }
    }

    #[test]
    fn round_trip_preserves_the_job_byte_for_byte() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = job(json!({
            "statusChanged": true,
            "downtime": 3,
            "email": "test@example.com",
            "data": [{"pingAddress": "1.1.1.1", "success": true}],
        }));

        let path = to_user_cache(dir.path(), &original).expect("spool");
        assert!(path.exists());

        let recovered = from_cache_dir(dir.path());
        assert_eq!(recovered, vec![original.clone()]);

        let on_disk = std::fs::read(&path).expect("read spool file");
        assert_eq!(on_disk, serde_json::to_vec(&original).expect("serialise"));
    }

    #[test]
    fn identical_jobs_share_one_spool_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = job(json!({"statusChanged": false}));

        let first = to_user_cache(dir.path(), &original).expect("spool");
        let second = to_user_cache(dir.path(), &original).expect("spool");
        assert_eq!(first, second);
        assert_eq!(from_cache_dir(dir.path()).len(), 1);
    }

    #[test]
    fn distinct_jobs_get_distinct_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        to_user_cache(dir.path(), &job(json!({"downtime": 1}))).expect("spool");
        to_user_cache(dir.path(), &job(json!({"downtime": 2}))).expect("spool");
        to_user_cache(dir.path(), &job(json!({"downtime": 3}))).expect("spool");

        assert_eq!(from_cache_dir(dir.path()).len(), 3);
    }

    #[test]
    fn clear_cache_empties_the_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        to_user_cache(dir.path(), &job(json!({"downtime": 1}))).expect("spool");
        to_user_cache(dir.path(), &job(json!({"downtime": 2}))).expect("spool");

        clear_cache(dir.path());
        assert!(from_cache_dir(dir.path()).is_empty());
    }

    #[test]
    fn unparsable_files_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        to_user_cache(dir.path(), &job(json!({"downtime": 1}))).expect("spool");
        std::fs::write(dir.path().join("junk.json"), b"not a job").expect("write junk");

        assert_eq!(from_cache_dir(dir.path()).len(), 1);
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("never-created");
        assert!(from_cache_dir(&missing).is_empty());
        clear_cache(&missing);
    }
}
