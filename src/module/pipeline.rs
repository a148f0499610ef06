use crate::status::{MAX_PHASE, PHASE_ANONYMIZED, PHASE_DOWNLOADED};
use crate::upstream::UpstreamStore;
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::rc::Rc;

const ORTHANC_TARGET_PREFIX: &str = "orthanc:";

/// One accession's current position in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseJob {
    pub accession: String,
    pub uuid: String,
    pub subject_id: String,
    /// `;`-separated targets recorded so far.
    pub targets: String,
}

impl PhaseJob {
    fn anonymized_uuid(&self) -> Option<&str> {
        self.targets
            .split(';')
            .filter_map(|target| target.trim().strip_prefix(ORTHANC_TARGET_PREFIX))
            .last()
    }

    fn with_target(&self, target: &str) -> String {
        if self.targets.is_empty() {
            target.to_string()
        } else {
            format!("{};{target}", self.targets)
        }
    }
}

/// The image-byte pipeline behind a stager module.
pub trait DeidPipeline {
    /// Run `phase` for `job`, returning the targets to record afterwards.
    fn run_phase(&self, job: &PhaseJob, phase: i64) -> Result<String>;
}

/// Anonymizes through Orthanc and writes archives under a target root.
pub struct OrthancPipeline {
    upstream: Rc<dyn UpstreamStore>,
    target_root: PathBuf,
    zip_archive_structure: bool,
}

impl OrthancPipeline {
    pub fn new(
        upstream: Rc<dyn UpstreamStore>,
        target_root: impl Into<PathBuf>,
        zip_archive_structure: bool,
    ) -> Self {
        Self {
            upstream,
            target_root: target_root.into(),
            zip_archive_structure,
        }
    }

    fn archive_path(&self, job: &PhaseJob, anonymized: &str) -> PathBuf {
        if self.zip_archive_structure {
            let subject = if job.subject_id.is_empty() {
                "unknown_subject"
            } else {
                job.subject_id.as_str()
            };
            self.target_root
                .join(subject)
                .join(format!("{}.zip", job.accession))
        } else {
            self.target_root
                .join(format!("{}_{anonymized}.zip", job.accession))
        }
    }
}

impl DeidPipeline for OrthancPipeline {
    fn run_phase(&self, job: &PhaseJob, phase: i64) -> Result<String> {
        match phase {
            PHASE_DOWNLOADED => {
                self.upstream
                    .describe_study(&job.uuid)
                    .with_context(|| format!("verify study {} upstream", job.uuid))?;
                Ok(job.targets.clone())
            }
            PHASE_ANONYMIZED => {
                let subject = if job.subject_id.is_empty() {
                    job.accession.as_str()
                } else {
                    job.subject_id.as_str()
                };
                let anonymized = self
                    .upstream
                    .anonymize_study(&job.uuid, subject)
                    .with_context(|| format!("anonymize study {}", job.uuid))?;
                Ok(job.with_target(&format!("{ORTHANC_TARGET_PREFIX}{anonymized}")))
            }
            MAX_PHASE => {
                let anonymized = job
                    .anonymized_uuid()
                    .ok_or_else(|| anyhow!("no anonymized study recorded for {}", job.accession))?;
                let dest = self.archive_path(job, anonymized);
                self.upstream
                    .download_archive(anonymized, &dest)
                    .with_context(|| format!("archive study {anonymized}"))?;
                Ok(job.with_target(&dest.display().to_string()))
            }
            other => Err(anyhow!("no pipeline step for phase {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeUpstream;

    fn job() -> PhaseJob {
        PhaseJob {
            accession: "A1".to_string(),
            uuid: "u1".to_string(),
            subject_id: "S1".to_string(),
            targets: String::new(),
        }
    }

    #[test]
    fn phases_accumulate_targets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let upstream = Rc::new(FakeUpstream::default().with_study("u1", "CT"));
        let pipeline = OrthancPipeline::new(upstream.clone(), dir.path(), true);

        let mut job = job();
        job.targets = pipeline.run_phase(&job, PHASE_DOWNLOADED).expect("phase 3");
        assert!(job.targets.is_empty());
        job.targets = pipeline.run_phase(&job, PHASE_ANONYMIZED).expect("phase 4");
        assert_eq!(job.targets, "orthanc:anon-u1-S1");
        job.targets = pipeline.run_phase(&job, MAX_PHASE).expect("phase 5");

        let archive = dir.path().join("S1").join("A1.zip");
        assert!(archive.exists());
        assert_eq!(
            job.targets,
            format!("orthanc:anon-u1-S1;{}", archive.display())
        );
    }

    #[test]
    fn flat_layout_names_archive_after_anonymized_study() {
        let upstream: Rc<dyn UpstreamStore> = Rc::new(FakeUpstream::default());
        let pipeline = OrthancPipeline::new(upstream, "/targets", false);
        let path = pipeline.archive_path(&job(), "anon9");
        assert_eq!(path, PathBuf::from("/targets/A1_anon9.zip"));
    }

    #[test]
    fn missing_study_fails_verification() {
        let upstream: Rc<dyn UpstreamStore> = Rc::new(FakeUpstream::default());
        let pipeline = OrthancPipeline::new(upstream, "/targets", false);
        assert!(pipeline.run_phase(&job(), PHASE_DOWNLOADED).is_err());
        assert!(pipeline.run_phase(&job(), MAX_PHASE).is_err());
    }
}
