//! The on-disk layout of job artifacts: one directory per jid holding
//! `input`, and later exactly one of `result` or `error`. Artifact files
//! are opened with exclusive create so a second writer always fails, which
//! is what makes completed jobs immutable.

use anyhow::{Context as _, Result};
use corral_base::JobId;
use std::{
    fs::{File, OpenOptions},
    os::unix::fs::{DirBuilderExt as _, OpenOptionsExt as _},
    path::{Path, PathBuf},
};

pub struct JobLayout {
    root: PathBuf,
}

impl JobLayout {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating store dir `{}`", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, jid: JobId) -> PathBuf {
        self.root.join(jid.to_string())
    }

    pub fn job_file_path(&self, jid: JobId, name: &str) -> PathBuf {
        self.job_dir(jid).join(name)
    }

    /// Create the job's directory. Workers fetch out of it over the static
    /// file surface, so it is world-readable.
    pub fn create_job_dir(&self, jid: JobId) -> Result<()> {
        std::fs::DirBuilder::new()
            .mode(0o777)
            .create(self.job_dir(jid))
            .with_context(|| format!("creating job dir for {jid}"))?;
        Ok(())
    }

    /// Exclusive-create an artifact file under the job's directory. Fails
    /// if the file already exists.
    pub fn create_job_file(&self, jid: JobId, name: &str) -> Result<File> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o666)
            .open(self.job_file_path(jid, name))
            .with_context(|| format!("creating {name} file for {jid}"))
    }

    pub fn remove_job_file(&self, jid: JobId, name: &str) {
        std::fs::remove_file(self.job_file_path(jid, name)).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_base::INPUT_ARTIFACT;
    use std::io::Write as _;

    #[test]
    fn second_create_of_the_same_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(dir.path()).unwrap();
        layout.create_job_dir(JobId(1)).unwrap();

        let mut file = layout.create_job_file(JobId(1), INPUT_ARTIFACT).unwrap();
        file.write_all(b"payload").unwrap();
        drop(file);

        assert!(layout.create_job_file(JobId(1), INPUT_ARTIFACT).is_err());
        let contents = std::fs::read(layout.job_file_path(JobId(1), INPUT_ARTIFACT)).unwrap();
        assert_eq!(contents, b"payload");
    }

    #[test]
    fn creating_the_same_job_dir_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(dir.path()).unwrap();
        layout.create_job_dir(JobId(2)).unwrap();
        assert!(layout.create_job_dir(JobId(2)).is_err());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = JobLayout::new(dir.path()).unwrap();
        layout.create_job_dir(JobId(3)).unwrap();
        layout.create_job_file(JobId(3), INPUT_ARTIFACT).unwrap();
        layout.remove_job_file(JobId(3), INPUT_ARTIFACT);
        layout.remove_job_file(JobId(3), INPUT_ARTIFACT);
        assert!(!layout.job_file_path(JobId(3), INPUT_ARTIFACT).exists());
    }
}
