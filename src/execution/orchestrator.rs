//! Pipeline orchestrator - sequences an entire run
//!
//! A run moves through resource setup, cloning, service start, injection,
//! steps and extraction. The first failure is kept and every later setup
//! stage is skipped, but services and resources are always torn down.

use crate::core::config::{PipelineDefinition, Step};
use crate::core::environment::{self, Scope};
use crate::core::{RunStage, RunState};
use crate::engine::{ContainerEngine, ContainerSpec, Mount, OutputSink, StdoutSink};
use crate::error::PipelineError;
use crate::execution::container::{ContainerDescriptor, ContainerRunner};
use crate::execution::events::{EventBus, PipelineEvent};
use crate::execution::repos::{self, GIT_SSH_COMMAND};
use crate::execution::resources::ResourceManager;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Host path of the Docker daemon socket
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// A background service started by the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedService {
    pub name: String,
    pub image: String,
    pub container_id: String,
    pub suppress_log: bool,
}

/// Runs a pipeline definition against a container engine
pub struct Orchestrator<E> {
    engine: E,
    definition: PipelineDefinition,
    process_env: Vec<String>,
    sink: Arc<dyn OutputSink>,
    events: EventBus,
    state: RunState,
    services: Vec<StartedService>,
    first_error: Option<PipelineError>,
}

impl<E: ContainerEngine> Orchestrator<E> {
    pub fn new(engine: E, definition: PipelineDefinition) -> Self {
        Self {
            engine,
            definition,
            process_env: environment::process_environment(),
            sink: Arc::new(StdoutSink),
            events: EventBus::new(),
            state: RunState::new(),
            services: Vec::new(),
            first_error: None,
        }
    }

    /// Resolve bare variables against `env` instead of the real process environment
    pub fn with_process_env(mut self, env: Vec<String>) -> Self {
        self.process_env = env;
        self
    }

    /// Where container output goes
    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&mut self, handler: F)
    where
        F: Fn(PipelineEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler);
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Services started and not yet stopped
    pub fn running_services(&self) -> &[StartedService] {
        &self.services
    }

    /// Execute the whole pipeline and return the first error, if any
    pub async fn run(&mut self) -> Result<(), PipelineError> {
        let span = info_span!("run", run_id = %self.state.run_id);
        self.execute().instrument(span).await
    }

    async fn execute(&mut self) -> Result<(), PipelineError> {
        let run_id = self.state.run_id;
        info!("Starting pipeline run {}", run_id);
        self.state.start();
        self.events.emit(PipelineEvent::RunStarted { run_id });

        if let Err(err) = self.prepare() {
            self.record(err);
            return self.finish();
        }

        let deadline = Instant::now() + self.definition.settings.timeout();
        let mut resources = ResourceManager::new(&self.definition.settings);

        if self.enter(RunStage::ResourcesUp) {
            if let Err(err) = resources.setup(&self.engine).await {
                self.record(err);
            }
        }
        if self.enter(RunStage::Cloning) {
            if let Err(err) = self.clone_repositories(deadline).await {
                self.record(err);
            }
        }
        if self.enter(RunStage::ServicesUp) {
            if let Err(err) = self.start_services(deadline).await {
                self.record(err);
            }
        }
        if self.enter(RunStage::Injecting) {
            if let Err(err) = self.inject_files(deadline).await {
                self.record(err);
            }
        }
        if self.enter(RunStage::Steps) {
            if let Err(err) = self.run_steps(deadline).await {
                self.record(err);
            }
        }
        if self.enter(RunStage::Extracting) {
            if let Err(err) = self.extract_files(deadline).await {
                self.record(err);
            }
        }

        self.enter(RunStage::ServicesDown);
        self.stop_services().await;

        self.enter(RunStage::ResourcesDown);
        if let Err(err) = resources.teardown(&self.engine).await {
            self.record(err);
        }

        self.finish()
    }

    /// Validation, permission checks and environment resolution. Runs before
    /// any engine call.
    fn prepare(&mut self) -> Result<(), PipelineError> {
        self.definition.validate()?;
        self.definition.authorize()?;

        let process_env: &[String] = &self.process_env;
        let global = environment::expand(&self.definition.environment, &[process_env], &Scope::Global)?;

        for service in &mut self.definition.services {
            service.environment = environment::expand(
                &service.environment,
                &[global.as_slice(), process_env],
                &Scope::Service(service.name.clone()),
            )?;
        }

        let ssh_agent = environment::lookup(process_env, "SSH_AUTH_SOCK");
        for step in &mut self.definition.steps {
            let merged = environment::merge(&global, &step.environment);
            step.environment = environment::expand(&merged, &[process_env], &Scope::Step(step.name.clone()))?;
            if step.forward_ssh_agent && ssh_agent.is_none() {
                return Err(PipelineError::SshAgentUnavailable(step.name.clone()));
            }
        }

        self.definition.environment = global;
        Ok(())
    }

    fn enter(&mut self, stage: RunStage) -> bool {
        if !self.state.should_run(stage) {
            debug!("Skipping {} after an earlier failure", stage);
            return false;
        }
        self.state.advance(stage);
        self.events.emit(PipelineEvent::StageStarted { stage });
        true
    }

    fn record(&mut self, error: PipelineError) {
        self.state.fail();
        match self.first_error {
            None => self.first_error = Some(error),
            Some(_) => warn!("Additional failure: {}", error),
        }
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        self.state.finish();
        self.events.emit(PipelineEvent::RunFinished {
            run_id: self.state.run_id,
            status: self.state.status,
        });
        match self.first_error.take() {
            Some(err) => Err(err),
            None => {
                info!("Pipeline run {} completed", self.state.run_id);
                Ok(())
            }
        }
    }

    async fn clone_repositories(&self, deadline: Instant) -> Result<(), PipelineError> {
        let runner = ContainerRunner::new(&self.engine).with_events(&self.events);
        let settings = &self.definition.settings;

        for repo in &self.definition.repositories {
            info!("Cloning {} from {}", repo.name, repo.location);
            self.events.emit(PipelineEvent::RepositoryCloning {
                name: repo.name.clone(),
                location: repo.location.clone(),
            });

            let plan = repos::clone_plan(repo, &settings.working_directory);
            let git = self.git_descriptor();
            let failed = |action: &'static str| {
                move |source| PipelineError::Repository {
                    name: repo.name.clone(),
                    action,
                    source,
                }
            };

            runner
                .execute(&git.clone().with_shell(plan.clone_command), deadline)
                .await
                .map_err(failed("clone"))?;

            if let Some(checkout) = plan.checkout {
                let in_repo = git.with_working_dir(checkout.working_dir);
                runner
                    .execute(&in_repo.clone().with_shell(checkout.fetch), deadline)
                    .await
                    .map_err(failed("fetch"))?;
                runner
                    .execute(&in_repo.with_shell(checkout.checkout), deadline)
                    .await
                    .map_err(failed("check out"))?;
            }
        }
        Ok(())
    }

    async fn start_services(&mut self, deadline: Instant) -> Result<(), PipelineError> {
        let runner = ContainerRunner::new(&self.engine).with_events(&self.events);
        let settings = &self.definition.settings;

        for service in &self.definition.services {
            let spec = ContainerSpec {
                name: Some(service.name.clone()),
                image: service.image.clone(),
                env: service.environment.clone(),
                network: Some(settings.network_name.clone()),
                privileged: service.privileged,
                ..Default::default()
            };
            let container_id = runner
                .start_background(&spec, deadline)
                .await
                .map_err(|source| PipelineError::ServiceStart {
                    name: service.name.clone(),
                    source,
                })?;

            info!("Started service {} ({})", service.name, container_id);
            self.events.emit(PipelineEvent::ServiceStarted {
                name: service.name.clone(),
                container_id: container_id.clone(),
            });
            self.services.push(StartedService {
                name: service.name.clone(),
                image: service.image.clone(),
                container_id,
                suppress_log: service.suppress_log,
            });
        }
        Ok(())
    }

    async fn inject_files(&self, deadline: Instant) -> Result<(), PipelineError> {
        let injections = self.definition.injections();
        if injections.is_empty() {
            return Ok(());
        }
        info!("Injecting {} file entries", injections.len());
        let descriptor = self.utility_descriptor().with_files(injections);
        ContainerRunner::new(&self.engine)
            .with_events(&self.events)
            .execute(&descriptor, deadline)
            .await
            .map_err(PipelineError::Inject)
    }

    async fn run_steps(&mut self, deadline: Instant) -> Result<(), PipelineError> {
        let runner = ContainerRunner::new(&self.engine).with_events(&self.events);
        let total = self.definition.steps.len();

        for (index, step) in self.definition.steps.iter().enumerate() {
            info!("Running step {} ({}/{})", step.name, index + 1, total);
            self.events.emit(PipelineEvent::StepStarted {
                name: step.name.clone(),
                index: index + 1,
                total,
            });

            let descriptor = step_descriptor(
                step,
                &self.definition,
                environment::lookup(&self.process_env, "SSH_AUTH_SOCK"),
                Arc::clone(&self.sink),
            );
            let result = runner.execute(&descriptor, deadline).await;

            self.events.emit(PipelineEvent::StepFinished {
                name: step.name.clone(),
                success: result.is_ok(),
            });
            result.map_err(|source| PipelineError::Step {
                name: step.name.clone(),
                source,
            })?;
            self.state.completed_steps += 1;
        }
        Ok(())
    }

    async fn extract_files(&self, deadline: Instant) -> Result<(), PipelineError> {
        let extractions = self.definition.extractions();
        if extractions.is_empty() {
            return Ok(());
        }
        info!("Extracting {} file entries", extractions.len());
        let descriptor = self.utility_descriptor().with_files(extractions);
        ContainerRunner::new(&self.engine)
            .with_events(&self.events)
            .execute(&descriptor, deadline)
            .await
            .map_err(PipelineError::Extract)
    }

    /// Stop services in reverse start order. Every service is attempted.
    async fn stop_services(&mut self) {
        while let Some(service) = self.services.pop() {
            let result = {
                let runner = ContainerRunner::new(&self.engine);
                let sink = (!service.suppress_log).then(|| self.sink.as_ref());
                runner
                    .stop_and_remove(&service.container_id, &service.image, sink)
                    .await
            };

            info!("Stopped service {}", service.name);
            self.events.emit(PipelineEvent::ServiceStopped {
                name: service.name.clone(),
            });
            if let Err(source) = result {
                self.record(PipelineError::ServiceStop {
                    name: service.name,
                    container_id: service.container_id,
                    source,
                });
            }
        }
    }

    fn base_descriptor(&self, image: &str) -> ContainerDescriptor {
        let settings = &self.definition.settings;
        ContainerDescriptor::new(image, &settings.volume_name, &settings.working_directory)
            .with_sink(Arc::clone(&self.sink))
    }

    fn utility_descriptor(&self) -> ContainerDescriptor {
        self.base_descriptor(&self.definition.settings.utility_image)
            .with_shell(vec!["sh".to_string()])
    }

    fn git_descriptor(&self) -> ContainerDescriptor {
        let mut env = vec![GIT_SSH_COMMAND.to_string()];
        let mut descriptor = self.base_descriptor(&self.definition.settings.git_image);
        if let Some(socket) = environment::lookup(&self.process_env, "SSH_AUTH_SOCK") {
            env.push(format!("SSH_AUTH_SOCK={}", socket));
            descriptor = descriptor.with_bind(Mount::bind(socket, socket));
        }
        descriptor.with_environment(env)
    }
}

fn step_descriptor(
    step: &Step,
    definition: &PipelineDefinition,
    ssh_agent: Option<&str>,
    sink: Arc<dyn OutputSink>,
) -> ContainerDescriptor {
    let settings = &definition.settings;
    let shell = if step.shell.is_empty() {
        settings.shell.clone()
    } else {
        step.shell.clone()
    };

    let mut environment = step.environment.clone();
    let mut descriptor = ContainerDescriptor::new(&step.image, &settings.volume_name, &settings.working_directory)
        .with_shell(shell)
        .with_commands(step.commands.clone())
        .with_user(step.user.clone())
        .with_network(&settings.network_name)
        .with_entrypoint_override(step.override_entrypoint)
        .with_sink(sink);

    if step.mount_docker_sock {
        descriptor = descriptor.with_bind(Mount::bind(DOCKER_SOCKET, DOCKER_SOCKET));
    }
    if let Some(socket) = ssh_agent.filter(|_| step.forward_ssh_agent) {
        descriptor = descriptor.with_bind(Mount::bind(socket, socket));
        environment.retain(|entry| environment::EnvEntry::parse(entry).name() != "SSH_AUTH_SOCK");
        environment.push(format!("SSH_AUTH_SOCK={}", socket));
    }
    descriptor.with_environment(environment)
}
