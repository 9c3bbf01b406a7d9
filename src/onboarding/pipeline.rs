//! Deployment orchestrator: drives one deployment through the fixed
//! seven-step sequence and records the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;

use super::models::{Deployment, DeploymentId, DeploymentStatus, OnboardingConfig};
use super::registry::Registry;
use super::runner::{CommandRunner, Transcript};
use super::tfvars::write_tfvars;
use super::ws::{Broadcaster, DeploymentEvent};
use crate::config::{DeploymentSettings, ToolSettings};
use crate::errors::DeploymentError;

/// Plan artifact written by the plan step and consumed by the apply step.
pub const PLAN_FILE: &str = "tfplan";

// ── Steps ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Configure,
    SelectSubscription,
    Init,
    Validate,
    Plan,
    Apply,
    Outputs,
}

impl Step {
    /// Execution order.
    pub const ALL: [Step; 7] = [
        Step::Configure,
        Step::SelectSubscription,
        Step::Init,
        Step::Validate,
        Step::Plan,
        Step::Apply,
        Step::Outputs,
    ];

    /// Human-readable text sent in the step event.
    pub fn description(&self) -> &'static str {
        match self {
            Step::Configure => "Creating configuration files...",
            Step::SelectSubscription => "Setting Azure subscription...",
            Step::Init => "Initializing Terraform...",
            Step::Validate => "Validating Terraform configuration...",
            Step::Plan => "Planning Terraform deployment...",
            Step::Apply => "Applying Terraform configuration...",
            Step::Outputs => "Retrieving deployment outputs...",
        }
    }

    /// Status recorded once the step succeeds. The outputs step ends the
    /// deployment instead.
    pub fn reached(&self) -> Option<DeploymentStatus> {
        match self {
            Step::Configure => Some(DeploymentStatus::Configuring),
            Step::SelectSubscription => Some(DeploymentStatus::AzureConfigured),
            Step::Init => Some(DeploymentStatus::TerraformInitialized),
            Step::Validate => Some(DeploymentStatus::TerraformValidated),
            Step::Plan => Some(DeploymentStatus::TerraformPlanned),
            Step::Apply => Some(DeploymentStatus::TerraformApplied),
            Step::Outputs => None,
        }
    }

    /// External command for this step. `Configure` is local file work.
    pub fn command(
        &self,
        tools: &ToolSettings,
        config: &OnboardingConfig,
    ) -> Option<(String, Vec<String>)> {
        let args = |a: &[&str]| a.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let tf = |a: &[&str]| Some((tools.terraform.clone(), args(a)));
        match self {
            Step::Configure => None,
            Step::SelectSubscription => Some((
                tools.azure_cli.clone(),
                args(&["account", "set", "--subscription", config.subscription_id.as_str()]),
            )),
            Step::Init => tf(&["init"]),
            Step::Validate => tf(&["validate"]),
            Step::Plan => tf(&["plan", format!("-out={PLAN_FILE}").as_str()]),
            Step::Apply => tf(&["apply", "-auto-approve", PLAN_FILE]),
            Step::Outputs => tf(&["output", "-json"]),
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::Configure => "configure",
            Step::SelectSubscription => "select_subscription",
            Step::Init => "init",
            Step::Validate => "validate",
            Step::Plan => "plan",
            Step::Apply => "apply",
            Step::Outputs => "outputs",
        };
        f.write_str(name)
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────

/// Background task of one deployment.
pub struct DeploymentHandle {
    pub id: DeploymentId,
    task: JoinHandle<()>,
}

impl DeploymentHandle {
    /// Wait until the deployment reached a terminal state.
    pub async fn finished(self) {
        if let Err(e) = self.task.await {
            tracing::error!(deployment_id = %self.id, error = %e, "Deployment supervisor task failed");
        }
    }
}

/// Runs deployments. Cheap to clone; every clone shares the same registry,
/// broadcaster and command runner.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<Registry>,
    broadcaster: Arc<Broadcaster>,
    runner: Arc<dyn CommandRunner>,
    tools: Arc<ToolSettings>,
    settings: Arc<DeploymentSettings>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        broadcaster: Arc<Broadcaster>,
        runner: Arc<dyn CommandRunner>,
        tools: ToolSettings,
        settings: DeploymentSettings,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            runner,
            tools: Arc::new(tools),
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn work_dir_for(&self, id: &DeploymentId) -> PathBuf {
        self.settings.work_root.join(id.to_string())
    }

    /// Register a new deployment (entry and lock together) without running it.
    pub fn create(&self, config: OnboardingConfig) -> DeploymentId {
        loop {
            let id = DeploymentId::new();
            let deployment = Deployment::new(id, config.clone(), self.work_dir_for(&id));
            if self.registry.create(deployment) {
                tracing::info!(deployment_id = %id, app_name = %config.app_name, "Deployment created");
                return id;
            }
        }
    }

    /// Create a deployment and start it in the background.
    pub fn start(&self, config: OnboardingConfig) -> DeploymentHandle {
        let id = self.create(config);
        self.launch(id)
    }

    /// Start the step sequence of an already created deployment.
    ///
    /// The sequence runs in its own task. A supervisor task awaits it and
    /// records a failure if it panicked, so no deployment is left running.
    pub fn launch(&self, id: DeploymentId) -> DeploymentHandle {
        let worker = tokio::spawn(self.clone().run(id));
        let supervisor = self.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = worker.await {
                tracing::error!(deployment_id = %id, error = %e, "Deployment task aborted");
                supervisor.finish(id, Err(DeploymentError::Aborted(e.to_string())));
            }
        });
        DeploymentHandle { id, task }
    }

    async fn run(self, id: DeploymentId) {
        let Some(deployment) = self.registry.get(&id) else {
            tracing::warn!(deployment_id = %id, "Deployment vanished before it started");
            return;
        };
        let result = self
            .execute(id, &deployment.config, &deployment.work_dir)
            .await;
        self.finish(id, result);
    }

    async fn execute(
        &self,
        id: DeploymentId,
        config: &OnboardingConfig,
        work_dir: &Path,
    ) -> Result<serde_json::Value, DeploymentError> {
        let mut last = Transcript::default();

        for step in Step::ALL {
            tracing::info!(deployment_id = %id, %step, "{}", step.description());
            self.broadcaster.publish(
                &id,
                &DeploymentEvent::Step {
                    step: step.description().to_string(),
                },
            );

            match step.command(&self.tools, config) {
                None => self.configure(config, work_dir).await?,
                Some((program, args)) => {
                    let broadcaster = &self.broadcaster;
                    let on_chunk = |chunk: &str| {
                        broadcaster.publish(
                            &id,
                            &DeploymentEvent::Output {
                                data: chunk.to_string(),
                            },
                        );
                    };
                    last = self.runner.run(&program, &args, work_dir, &on_chunk).await?;
                }
            }

            if let Some(status) = step.reached() {
                self.registry.update(&id, |d| d.advance(status));
            }
        }

        let outputs: serde_json::Value =
            serde_json::from_str(last.stdout.trim()).map_err(DeploymentError::OutputParse)?;
        let empty = match &outputs {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if empty {
            return Err(DeploymentError::NoOutputs);
        }
        Ok(outputs)
    }

    /// Create the working directory, copy the Terraform sources into it
    /// and render `terraform.tfvars`.
    async fn configure(
        &self,
        config: &OnboardingConfig,
        work_dir: &Path,
    ) -> Result<(), DeploymentError> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|source| DeploymentError::WorkDir {
                path: work_dir.to_path_buf(),
                source,
            })?;

        for file in &self.settings.template_files {
            let source_path = self.settings.template_dir.join(file);
            if !tokio::fs::try_exists(&source_path).await.unwrap_or(false) {
                tracing::debug!(file = %source_path.display(), "Template file not found, skipping");
                continue;
            }
            tokio::fs::copy(&source_path, work_dir.join(file))
                .await
                .map_err(|source| DeploymentError::TemplateCopy {
                    file: file.clone(),
                    source,
                })?;
        }

        write_tfvars(config, work_dir)
            .await
            .map_err(|source| DeploymentError::Render {
                path: work_dir.join(super::tfvars::TFVARS_FILE),
                source,
            })?;
        Ok(())
    }

    /// Record the terminal state and emit the terminal event. Only the first
    /// call for a deployment has any effect.
    fn finish(&self, id: DeploymentId, result: Result<serde_json::Value, DeploymentError>) {
        let now = Utc::now();
        match result {
            Ok(outputs) => {
                let recorded = self.registry.update(&id, |d| d.complete(outputs.clone(), now));
                if recorded == Some(true) {
                    tracing::info!(deployment_id = %id, "Deployment completed");
                    self.broadcaster
                        .publish(&id, &DeploymentEvent::Complete { outputs });
                }
            }
            Err(e) => {
                let error = e.to_string();
                let recorded = self.registry.update(&id, |d| d.fail(error.clone(), now));
                if recorded == Some(true) {
                    tracing::warn!(deployment_id = %id, %error, "Deployment failed");
                    self.broadcaster
                        .publish(&id, &DeploymentEvent::Error { error });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CommandError;
    use crate::onboarding::models::fixtures::sample_config;
    use crate::onboarding::runner::{ChunkSink, ScriptedRunner};
    use crate::onboarding::ws::Subscription;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const OUTPUTS: &str = r#"{"application_id":{"sensitive":false,"type":"string","value":"11111111-2222-4333-8444-555555555555"}}"#;

    struct Harness {
        orchestrator: Orchestrator,
        runner: Arc<ScriptedRunner>,
        work_root: TempDir,
        template_dir: TempDir,
    }

    fn harness(runner: ScriptedRunner) -> Harness {
        let work_root = tempfile::tempdir().unwrap();
        let template_dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(runner);
        let settings = DeploymentSettings {
            work_root: work_root.path().to_path_buf(),
            template_dir: template_dir.path().to_path_buf(),
            ..DeploymentSettings::default()
        };
        let orchestrator = Orchestrator::new(
            Arc::new(Registry::new()),
            Arc::new(Broadcaster::new(1024)),
            runner.clone(),
            ToolSettings::default(),
            settings,
        );
        Harness {
            orchestrator,
            runner,
            work_root,
            template_dir,
        }
    }

    fn drain(sub: &mut Subscription) -> Vec<DeploymentEvent> {
        let mut events = Vec::new();
        while let Some(json) = sub.try_recv() {
            events.push(serde_json::from_str(&json).unwrap());
        }
        events
    }

    async fn run_to_end(h: &Harness) -> (Deployment, Vec<DeploymentEvent>) {
        let id = h.orchestrator.create(sample_config());
        let mut sub = h.orchestrator.broadcaster().subscribe(id);
        h.orchestrator.launch(id).finished().await;
        let deployment = h.orchestrator.registry().get(&id).unwrap();
        (deployment, drain(&mut sub))
    }

    const EXPECTED_COMMANDS: [&str; 6] = [
        "az account set --subscription 3f2c9a7e-1b4d-4c8e-9a2f-6d5e4c3b2a10",
        "terraform init",
        "terraform validate",
        "terraform plan -out=tfplan",
        "terraform apply -auto-approve tfplan",
        "terraform output -json",
    ];

    #[test]
    fn test_step_order_and_status_progression() {
        let reached: Vec<_> = Step::ALL.iter().filter_map(Step::reached).collect();
        let ranks: Vec<_> = reached.iter().filter_map(DeploymentStatus::rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(Step::ALL.last(), Some(&Step::Outputs));
    }

    #[tokio::test]
    async fn test_successful_deployment() {
        let h = harness(ScriptedRunner::new().respond("terraform output", OUTPUTS));
        std::fs::write(h.template_dir.path().join("variables.tf"), "variable \"x\" {}").unwrap();

        let (deployment, events) = run_to_end(&h).await;

        assert_eq!(deployment.status(), DeploymentStatus::Completed);
        assert!(deployment.end_time().unwrap() >= deployment.start_time());
        assert_eq!(
            deployment.output().unwrap()["application_id"]["value"],
            "11111111-2222-4333-8444-555555555555"
        );
        assert!(deployment.error().is_none());

        assert_eq!(h.runner.command_lines(), EXPECTED_COMMANDS);
        for call in h.runner.invocations() {
            assert_eq!(call.cwd, deployment.work_dir);
        }

        // Working directory holds the copied template and the rendered tfvars;
        // absent templates are skipped.
        let work_dir = &deployment.work_dir;
        assert!(work_dir.starts_with(h.work_root.path()));
        assert!(work_dir.join("variables.tf").exists());
        assert!(!work_dir.join("outputs.tf").exists());
        assert!(work_dir.join("terraform.tfvars").exists());

        let steps: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                DeploymentEvent::Step { step } => Some(step.as_str()),
                _ => None,
            })
            .collect();
        let expected: Vec<_> = Step::ALL.iter().map(Step::description).collect();
        assert_eq!(steps, expected);

        assert!(events.contains(&DeploymentEvent::Output {
            data: OUTPUTS.to_string()
        }));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(matches!(events.last(), Some(DeploymentEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn test_failure_at_any_step_stops_the_sequence() {
        // Commands start at step 2; step 1 is local file work.
        for (index, command) in EXPECTED_COMMANDS.iter().enumerate() {
            let h = harness(
                ScriptedRunner::new()
                    .fail_on(command, 1, "scripted failure")
                    .respond("terraform output", OUTPUTS),
            );
            let (deployment, events) = run_to_end(&h).await;

            assert_eq!(deployment.status(), DeploymentStatus::Failed, "{command}");
            assert!(deployment.output().is_none());
            let error = deployment.error().unwrap();
            assert!(error.contains("scripted failure"), "{error}");
            assert!(error.contains("code 1"), "{error}");

            // Nothing after the failing command ran.
            assert_eq!(h.runner.command_lines(), EXPECTED_COMMANDS[..=index]);

            assert_eq!(
                events.last(),
                Some(&DeploymentEvent::Error {
                    error: error.to_string()
                })
            );
            assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        }
    }

    #[tokio::test]
    async fn test_plan_failure_never_runs_apply_or_output() {
        let h = harness(ScriptedRunner::new().fail_on("terraform plan", 1, "Error: quota exceeded"));
        let (deployment, _) = run_to_end(&h).await;
        assert_eq!(deployment.status(), DeploymentStatus::Failed);
        assert_eq!(
            deployment.error(),
            Some("Command failed with code 1: Error: quota exceeded")
        );
        assert!(
            !h.runner
                .command_lines()
                .iter()
                .any(|c| c.starts_with("terraform apply") || c.starts_with("terraform output"))
        );
    }

    #[tokio::test]
    async fn test_unwritable_work_root_fails_before_any_command() {
        let h = harness(ScriptedRunner::new());
        // Replace the work root with a regular file.
        let blocker = h.work_root.path().join("blocked");
        std::fs::write(&blocker, "").unwrap();
        let orchestrator = Orchestrator::new(
            Arc::clone(h.orchestrator.registry()),
            Arc::clone(h.orchestrator.broadcaster()),
            h.runner.clone(),
            ToolSettings::default(),
            DeploymentSettings {
                work_root: blocker,
                ..DeploymentSettings::default()
            },
        );
        let handle = orchestrator.start(sample_config());
        let id = handle.id;
        handle.finished().await;

        let deployment = orchestrator.registry().get(&id).unwrap();
        assert_eq!(deployment.status(), DeploymentStatus::Failed);
        assert!(deployment.error().unwrap().contains("working directory"));
        assert!(h.runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_outputs_fail() {
        let h = harness(ScriptedRunner::new().respond("terraform output", "not json"));
        let (deployment, _) = run_to_end(&h).await;
        assert_eq!(deployment.status(), DeploymentStatus::Failed);
        assert!(deployment.error().unwrap().contains("parse terraform outputs"));
        assert_eq!(h.runner.command_lines().len(), 6);
    }

    #[tokio::test]
    async fn test_empty_outputs_fail() {
        let h = harness(ScriptedRunner::new().respond("terraform output", "{}\n"));
        let (deployment, _) = run_to_end(&h).await;
        assert_eq!(deployment.status(), DeploymentStatus::Failed);
        assert_eq!(deployment.error(), Some("Terraform reported no outputs"));
    }

    #[tokio::test]
    async fn test_custom_tool_paths_are_used() {
        let mut h = harness(ScriptedRunner::new().respond("tofu output", OUTPUTS));
        h.orchestrator.tools = Arc::new(ToolSettings {
            azure_cli: "/opt/az/bin/az".into(),
            terraform: "tofu".into(),
        });
        let (deployment, _) = run_to_end(&h).await;
        assert_eq!(deployment.status(), DeploymentStatus::Completed);
        let programs: Vec<_> = h.runner.invocations().into_iter().map(|c| c.program).collect();
        assert_eq!(programs[0], "/opt/az/bin/az");
        assert!(programs[1..].iter().all(|p| p == "tofu"));
    }

    struct PanickingRunner;

    #[async_trait]
    impl CommandRunner for PanickingRunner {
        async fn run(
            &self,
            _program: &str,
            _args: &[String],
            _cwd: &Path,
            _on_chunk: ChunkSink<'_>,
        ) -> Result<Transcript, CommandError> {
            panic!("runner blew up");
        }
    }

    #[tokio::test]
    async fn test_panic_in_task_is_recorded_as_failure() {
        let work_root = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(Registry::new()),
            Arc::new(Broadcaster::new(16)),
            Arc::new(PanickingRunner),
            ToolSettings::default(),
            DeploymentSettings {
                work_root: work_root.path().to_path_buf(),
                ..DeploymentSettings::default()
            },
        );
        let id = orchestrator.create(sample_config());
        let mut sub = orchestrator.broadcaster().subscribe(id);
        orchestrator.launch(id).finished().await;

        let deployment = orchestrator.registry().get(&id).unwrap();
        assert_eq!(deployment.status(), DeploymentStatus::Failed);
        assert!(deployment.error().unwrap().contains("aborted"));
        assert!(deployment.end_time().is_some());
        let events = drain(&mut sub);
        assert!(matches!(events.last(), Some(DeploymentEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_deployments_use_separate_work_dirs() {
        let h = harness(ScriptedRunner::new().respond("terraform output", OUTPUTS));
        let a = h.orchestrator.start(sample_config());
        let b = h.orchestrator.start(sample_config());
        let (ida, idb) = (a.id, b.id);
        a.finished().await;
        b.finished().await;

        let da = h.orchestrator.registry().get(&ida).unwrap();
        let db = h.orchestrator.registry().get(&idb).unwrap();
        assert_ne!(da.work_dir, db.work_dir);
        assert_eq!(da.status(), DeploymentStatus::Completed);
        assert_eq!(db.status(), DeploymentStatus::Completed);
        assert_eq!(h.runner.invocations().len(), 12);
    }
}
