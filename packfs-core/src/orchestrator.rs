//! Job orchestration: render every configured job and collect the results.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::{JobVars, PackConfig};
use crate::render::{JobFiles, PackRenderer, RenderRequest};

/// Variable carrying the job's own name into the template.
pub const JOB_NAME_VAR: &str = "job_name";

/// Default number of renders allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT_RENDERS: usize = 4;

/// Result of rendering one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Rendered(JobFiles),
    Failed(String),
}

impl JobOutcome {
    /// Rendered files; `None` for a failed job.
    pub fn files(&self) -> Option<&JobFiles> {
        match self {
            JobOutcome::Rendered(files) => Some(files),
            JobOutcome::Failed(_) => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, JobOutcome::Failed(_))
    }
}

/// Outcomes keyed by `pack:job`.
pub type AggregateResult = BTreeMap<String, JobOutcome>;

/// Key of a job in the aggregate and name of its top-level directory.
pub fn composite_key(pack: &str, job: &str) -> String {
    format!("{}:{}", pack, job)
}

/// One planned render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedJob {
    pub key: String,
    pub request: RenderRequest,
}

/// Turn the configuration into render requests, one per job.
///
/// `job_name` is set to the job's table name unless the job sets it itself.
/// If two jobs map to the same composite key the first one is kept.
pub fn plan_jobs(config: &PackConfig) -> Vec<PlannedJob> {
    let mut planned: BTreeMap<String, PlannedJob> = BTreeMap::new();

    for (pack, settings) in &config.packs {
        for (job, job_vars) in &settings.jobs {
            let key = composite_key(pack, job);
            if planned.contains_key(&key) {
                warn!(job = %key, "duplicate job key, skipping");
                continue;
            }

            let mut variables = JobVars::new();
            variables.insert(JOB_NAME_VAR.to_string(), job.clone());
            variables.extend(job_vars.iter().map(|(k, v)| (k.clone(), v.clone())));

            let request = RenderRequest::new(pack.clone(), variables, settings.parser_v1);
            planned.insert(key.clone(), PlannedJob { key, request });
        }
    }

    planned.into_values().collect()
}

/// Renders every job of a configuration with bounded parallelism.
#[derive(Clone)]
pub struct JobOrchestrator {
    renderer: Arc<dyn PackRenderer>,
    max_concurrent: usize,
}

impl JobOrchestrator {
    pub fn new(renderer: Arc<dyn PackRenderer>, max_concurrent: usize) -> Self {
        Self {
            renderer,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Render all jobs. Never fails as a whole: each job's failure is
    /// recorded as [`JobOutcome::Failed`] under its key.
    pub async fn render_all(&self, config: &PackConfig) -> AggregateResult {
        let jobs = plan_jobs(config);

        // Every key starts out failed so a job whose task dies still shows up.
        let mut aggregate: AggregateResult = jobs
            .iter()
            .map(|job| {
                (
                    job.key.clone(),
                    JobOutcome::Failed("render did not complete".to_string()),
                )
            })
            .collect();

        let sem = Arc::new(Semaphore::new(self.max_concurrent));
        let mut join_set: JoinSet<(String, JobOutcome)> = JoinSet::new();

        for job in jobs {
            let sem = sem.clone();
            let renderer = self.renderer.clone();

            join_set.spawn(async move {
                let PlannedJob { key, request } = job;
                let outcome = match sem.acquire_owned().await {
                    Ok(_permit) => {
                        info!(job = %key, "rendering job");
                        match renderer.render(&request).await {
                            Ok(files) => {
                                info!(job = %key, files = files.len(), "rendered job");
                                JobOutcome::Rendered(files)
                            }
                            Err(e) => {
                                warn!(job = %key, error = %e, "failed to render job");
                                JobOutcome::Failed(e.to_string())
                            }
                        }
                    }
                    Err(e) => JobOutcome::Failed(e.to_string()),
                };
                (key, outcome)
            });
        }

        while let Some(res) = join_set.join_next().await {
            match res {
                Ok((key, outcome)) => {
                    aggregate.insert(key, outcome);
                }
                Err(e) => {
                    warn!(error = %e, "render task panicked");
                }
            }
        }

        let failed = aggregate.values().filter(|o| o.is_failed()).count();
        info!(
            total = aggregate.len(),
            failed,
            "finished rendering jobs"
        );

        aggregate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::{PackFsError, PackFsResult};

    /// Renders `README` containing the request's variables; fails for
    /// packs named `broken` and panics for packs named `panics`.
    #[derive(Default)]
    struct ScriptedRenderer {
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PackRenderer for ScriptedRenderer {
        async fn render(&self, request: &RenderRequest) -> PackFsResult<JobFiles> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if request.pack == "panics" {
                panic!("renderer blew up");
            }
            if request.pack == "broken" {
                return Err(PackFsError::Render {
                    pack: request.pack.clone(),
                    status: 1,
                    stderr: "bad variable".to_string(),
                });
            }

            let body: String = request
                .variables
                .iter()
                .map(|(k, v)| format!("{}={}\n", k, v))
                .collect();
            let mut files = JobFiles::new();
            files.insert("README".to_string(), body);
            Ok(files)
        }
    }

    fn config(text: &str) -> PackConfig {
        PackConfig::from_toml_str(text).unwrap()
    }

    #[test]
    fn test_plan_injects_job_name() {
        let jobs = plan_jobs(&config(
            r#"
            [hello]
            parserV1 = true
            [hello.job1]
            x = "1"
            "#,
        ));

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].key, "hello:job1");
        assert_eq!(jobs[0].request.pack, "hello");
        assert!(jobs[0].request.parser_v1);
        assert_eq!(jobs[0].request.variables["job_name"], "job1");
        assert_eq!(jobs[0].request.variables["x"], "1");
    }

    #[test]
    fn test_plan_explicit_job_name_wins() {
        let jobs = plan_jobs(&config("[hello.job1]\njob_name = \"custom\"\n"));
        assert_eq!(jobs[0].request.variables["job_name"], "custom");
    }

    #[test]
    fn test_plan_skips_colliding_keys() {
        let jobs = plan_jobs(&config(
            r#"
            ["a:b".c]
            ["a"."b:c"]
            "#,
        ));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].key, "a:b:c");
    }

    #[tokio::test]
    async fn test_render_all_collects_every_job() {
        let renderer = Arc::new(ScriptedRenderer::default());
        let orchestrator = JobOrchestrator::new(renderer.clone(), 2);

        let aggregate = orchestrator
            .render_all(&config(
                r#"
                [hello.job1]
                x = "1"
                [hello.job2]
                [broken.job1]
                "#,
            ))
            .await;

        assert_eq!(aggregate.len(), 3);
        let files = aggregate["hello:job1"].files().unwrap();
        assert_eq!(files["README"], "job_name=job1\nx=1\n");
        assert!(aggregate["hello:job2"].files().is_some());

        let failed = &aggregate["broken:job1"];
        assert!(failed.is_failed());
        assert!(failed.files().is_none());
        assert!(matches!(failed, JobOutcome::Failed(msg) if msg.contains("bad variable")));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panicking_render_is_recorded_as_failed() {
        let renderer = Arc::new(ScriptedRenderer::default());
        let orchestrator = JobOrchestrator::new(renderer, 2);

        let aggregate = orchestrator
            .render_all(&config(
                r#"
                [hello.job1]
                [panics.job1]
                [hello.job2]
                "#,
            ))
            .await;

        assert_eq!(aggregate.len(), 3);
        assert!(aggregate["panics:job1"].is_failed());
        assert!(matches!(&aggregate["hello:job1"], JobOutcome::Rendered(_)));
        assert!(matches!(&aggregate["hello:job2"], JobOutcome::Rendered(_)));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let renderer = Arc::new(ScriptedRenderer::default());
        let orchestrator = JobOrchestrator::new(renderer.clone(), 2);

        let text: String = (0..8).map(|i| format!("[pack.job{}]\n", i)).collect();
        let aggregate = orchestrator.render_all(&config(&text)).await;

        assert_eq!(aggregate.len(), 8);
        assert!(renderer.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_empty_config() {
        let orchestrator = JobOrchestrator::new(Arc::new(ScriptedRenderer::default()), 0);
        assert_eq!(orchestrator.max_concurrent(), 1);
        assert!(orchestrator.render_all(&PackConfig::default()).await.is_empty());
    }
}
