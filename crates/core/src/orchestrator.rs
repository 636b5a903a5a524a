//! Task intake, dispatch and aggregation.
//!
//! Every agent invocation runs as its own tokio task under a watchdog: the
//! orchestrator publishes `agent_start` at dispatch, and exactly one terminal
//! event (`agent_done` or `error`) per invocation is guaranteed by the
//! invocation's terminal claim, whether the agent finishes, fails, panics, runs
//! past its deadline or its task is cancelled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::agents::{
    Agent, AgentContext, AgentDescriptor, AgentEmitter, AgentOutput, AgentRegistry, AgentStatus,
    Invocation,
};
use crate::bus::{CommandBus, DEFAULT_CHANNEL};
use crate::error::{ChorusError, ChorusResult};
use crate::event::{ErrorKind, EventBody, SYSTEM_SOURCE};
use crate::routing::{KeywordRoutingPolicy, RoutePlan, RouteStep, RoutingPolicy};
use crate::speech::{MutedSynthesizer, SpeechSynthesizer};
use crate::task::{AgentReport, Context, StepOutcome, Task, TaskOutcome, TaskState, Topology};

/// Exponential backoff for transient agent failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `failed_attempts + 1`.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.pow(exp))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub channel: String,
    /// Per-invocation deadline enforced by the watchdog.
    pub agent_deadline: Duration,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            agent_deadline: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

struct TaskEntry {
    task: Task,
    cancel_tx: watch::Sender<bool>,
    state_tx: watch::Sender<TaskState>,
    outcome: Option<TaskOutcome>,
}

pub struct Orchestrator {
    bus: Arc<CommandBus>,
    agents: Arc<AgentRegistry>,
    routing: Arc<dyn RoutingPolicy>,
    speech: Arc<dyn SpeechSynthesizer>,
    config: OrchestratorConfig,
    channel: Arc<str>,
    tasks: Mutex<HashMap<Uuid, TaskEntry>>,
    descriptors: Mutex<HashMap<String, AgentSlot>>,
}

/// Descriptor plus the number of invocations of that agent still running.
struct AgentSlot {
    descriptor: AgentDescriptor,
    in_flight: usize,
    failed: bool,
}

pub struct OrchestratorBuilder {
    bus: Arc<CommandBus>,
    agents: Arc<AgentRegistry>,
    routing: Arc<dyn RoutingPolicy>,
    speech: Arc<dyn SpeechSynthesizer>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn routing(mut self, routing: Arc<dyn RoutingPolicy>) -> Self {
        self.routing = routing;
        self
    }

    pub fn speech(mut self, speech: Arc<dyn SpeechSynthesizer>) -> Self {
        self.speech = speech;
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<Orchestrator> {
        let descriptors = self
            .agents
            .descriptors()
            .into_iter()
            .map(|descriptor| {
                let slot = AgentSlot {
                    descriptor,
                    in_flight: 0,
                    failed: false,
                };
                (slot.descriptor.name.clone(), slot)
            })
            .collect();
        Arc::new(Orchestrator {
            channel: Arc::from(self.config.channel.as_str()),
            bus: self.bus,
            agents: self.agents,
            routing: self.routing,
            speech: self.speech,
            config: self.config,
            tasks: Mutex::new(HashMap::new()),
            descriptors: Mutex::new(descriptors),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once `cancel` flips to true. Never resolves if the sender is gone.
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Body of one invocation: retries transient failures, then publishes the
/// terminal event if nobody has claimed it yet.
async fn run_invocation(
    agent: Arc<dyn Agent>,
    ctx: AgentContext,
    retry: RetryPolicy,
) -> Result<AgentOutput, ChorusError> {
    let emitter = ctx.emitter().clone();
    let mut attempt = 1;
    let result = loop {
        match agent.run(&ctx).await {
            Ok(output) => break Ok(output),
            Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                let delay = retry.delay_for(attempt);
                warn!(agent = agent.name(), attempt, ?delay, error = %e, "Retrying after transient error");
                emitter.status(format!(
                    "retrying {} after transient error (attempt {}/{})",
                    agent.name(),
                    attempt + 1,
                    retry.max_attempts
                ));
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => break Err(ChorusError::from_agent(&e, attempt)),
        }
    };
    emitter.finish(&result);
    result
}

/// Wire kind and message for a failed step.
fn failure(err: &ChorusError) -> (ErrorKind, String) {
    (err.kind().unwrap_or(ErrorKind::AgentFailure), err.to_string())
}

impl Orchestrator {
    pub fn builder(bus: Arc<CommandBus>, agents: Arc<AgentRegistry>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            bus,
            agents,
            routing: Arc::new(KeywordRoutingPolicy::default()),
            speech: Arc::new(MutedSynthesizer),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn bus(&self) -> &Arc<CommandBus> {
        &self.bus
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn publish(&self, body: EventBody) -> ChorusResult<()> {
        self.bus.publish(&self.channel, SYSTEM_SOURCE, body).map(|_| ())
    }

    /// Accepts a task and returns its id. Dispatch happens in the background;
    /// progress is observable on the bus.
    pub fn submit(self: &Arc<Self>, text: impl Into<String>, context: Context) -> ChorusResult<Uuid> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ChorusError::InvalidTask("task text is empty".into()));
        }
        let mut task = Task::new(text, context);
        let task_id = task.id;

        let plan = self.routing.plan(&task.text, &self.agents);
        let plan = if plan.steps.is_empty() {
            RoutePlan::single(self.agents.general().name(), task.text.clone())
        } else {
            plan
        };
        task.topology = plan.topology;
        task.assigned_agents = plan.steps.iter().map(|s| s.agent.clone()).collect();
        task.transition(TaskState::Running)?;
        info!(%task_id, topology = %plan.topology, agents = ?task.assigned_agents, "Task accepted");

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, _) = watch::channel(TaskState::Running);
        let start = EventBody::TaskStart {
            task_id,
            text: task.text.clone(),
        };
        {
            // Registered before `task_start` is visible, and published under
            // the lock so a `cancel` cannot overtake it.
            let mut tasks = lock(&self.tasks);
            tasks.insert(
                task_id,
                TaskEntry {
                    task,
                    cancel_tx,
                    state_tx,
                    outcome: None,
                },
            );
            if let Err(e) = self.publish(start) {
                tasks.remove(&task_id);
                return Err(e);
            }
        }

        let this = Arc::clone(self);
        let span = info_span!("task", %task_id);
        tokio::spawn(async move { this.drive(task_id, plan, cancel_rx).await }.instrument(span));
        Ok(task_id)
    }

    async fn drive(self: Arc<Self>, task_id: Uuid, plan: RoutePlan, cancel: watch::Receiver<bool>) {
        let context = match lock(&self.tasks).get(&task_id) {
            Some(entry) => entry.task.context.clone(),
            None => return,
        };

        let reports = match plan.topology {
            Topology::Single | Topology::Parallel => {
                join_all(
                    plan.steps
                        .iter()
                        .map(|step| self.run_step(task_id, step, context.clone(), cancel.clone())),
                )
                .await
            }
            Topology::Chain => self.run_chain(task_id, &plan.steps, context, &cancel).await,
        };

        self.finish(task_id, plan.topology, reports);
    }

    async fn run_chain(
        &self,
        task_id: Uuid,
        steps: &[RouteStep],
        mut context: Context,
        cancel: &watch::Receiver<bool>,
    ) -> Vec<AgentReport> {
        let mut reports = Vec::with_capacity(steps.len());
        let mut broken = false;
        for step in steps {
            if broken || *cancel.borrow() {
                let reason = if broken {
                    "skipped: upstream step failed"
                } else {
                    "skipped: task cancelled"
                };
                reports.push(AgentReport::failed(&step.agent, &step.text, ErrorKind::AgentFailure, reason));
                continue;
            }
            let report = self.run_step(task_id, step, context.clone(), cancel.clone()).await;
            match &report.outcome {
                StepOutcome::Succeeded { summary, result } => {
                    context.insert("previous_agent".into(), json!(step.agent));
                    context.insert("previous_summary".into(), json!(summary));
                    context.insert("previous_result".into(), result.clone());
                }
                StepOutcome::Failed { .. } => broken = true,
            }
            reports.push(report);
        }
        reports
    }

    /// Dispatches one invocation and supervises it to a terminal outcome.
    async fn run_step(
        &self,
        task_id: Uuid,
        step: &RouteStep,
        context: Context,
        cancel: watch::Receiver<bool>,
    ) -> AgentReport {
        let Some(agent) = self.agents.get(&step.agent) else {
            let reason = format!("no agent named '{}'", step.agent);
            warn!(%task_id, agent = %step.agent, "Routing produced an unknown agent");
            let _ = self.publish(EventBody::Error {
                task_id: Some(task_id),
                agent: Some(step.agent.clone()),
                invocation_id: None,
                kind: ErrorKind::AgentFailure,
                message: reason.clone(),
            });
            return AgentReport::failed(&step.agent, &step.text, ErrorKind::AgentFailure, reason);
        };

        let invocation = Invocation::new(task_id, agent.name());
        let emitter = AgentEmitter::new(
            Arc::clone(&self.bus),
            Arc::clone(&self.channel),
            Arc::clone(&invocation),
            Arc::clone(&self.speech),
        );
        if let Err(e) = emitter.start() {
            return AgentReport::failed(&step.agent, &step.text, ErrorKind::AgentFailure, e.to_string());
        }
        self.mark_active(agent.name(), task_id);
        debug!(%task_id, agent = agent.name(), invocation = %invocation.id, "Agent dispatched");

        let ctx = AgentContext::new(task_id, step.text.clone(), context, emitter.clone());
        let handle = tokio::spawn(run_invocation(
            Arc::clone(&agent),
            ctx,
            self.config.retry.clone(),
        ));
        let deadline = self.config.agent_deadline;
        let cancel_probe = cancel.clone();

        let outcome: Result<AgentOutput, (ErrorKind, String)> = tokio::select! {
            joined = tokio::time::timeout(deadline, handle) => match joined {
                Ok(Ok(Ok(output))) => Ok(output),
                Ok(Ok(Err(err))) => Err(failure(&err)),
                Ok(Err(join_error)) => {
                    let err = ChorusError::ProtocolViolation {
                        agent: agent.name().to_string(),
                        detail: format!("invocation aborted: {join_error}"),
                    };
                    warn!(%task_id, error = %err, "Converting agent crash to an error event");
                    let (kind, message) = failure(&err);
                    emitter.force_error(kind, message.clone());
                    Err((kind, message))
                }
                Err(_) => {
                    let err = ChorusError::AgentTimeout {
                        agent: agent.name().to_string(),
                        deadline_ms: deadline.as_millis() as u64,
                    };
                    warn!(%task_id, error = %err, "Watchdog forcing terminal error");
                    let (kind, message) = failure(&err);
                    emitter.force_error(kind, message.clone());
                    Err((kind, message))
                }
            },
            _ = cancelled(cancel) => {
                emitter.force_error(ErrorKind::Cancelled, "task cancelled");
                Err((ErrorKind::Cancelled, "task cancelled".to_string()))
            }
        };

        // The runner returned without anyone publishing a terminal event.
        if !invocation.has_terminated() {
            let err = ChorusError::ProtocolViolation {
                agent: agent.name().to_string(),
                detail: "no terminal event published".into(),
            };
            warn!(%task_id, error = %err, "Invocation ended without a terminal event");
            let (kind, message) = failure(&err);
            emitter.force_error(kind, message);
        }
        let outcome = match outcome {
            Ok(_) if *cancel_probe.borrow() => {
                Err((ErrorKind::Cancelled, "result discarded: task cancelled".to_string()))
            }
            other => other,
        };

        match outcome {
            Ok(output) => {
                self.mark_finished(agent.name(), AgentStatus::Done);
                AgentReport {
                    agent: step.agent.clone(),
                    text: step.text.clone(),
                    outcome: StepOutcome::Succeeded {
                        summary: output.summary,
                        result: output.data,
                    },
                }
            }
            Err((kind, reason)) => {
                self.mark_finished(agent.name(), AgentStatus::Error);
                AgentReport::failed(&step.agent, &step.text, kind, reason)
            }
        }
    }

    /// Publishes the aggregated outcome. Runs once per task.
    fn finish(&self, task_id: Uuid, topology: Topology, reports: Vec<AgentReport>) {
        let (state, cancelled, state_tx) = {
            let mut tasks = lock(&self.tasks);
            let Some(entry) = tasks.get_mut(&task_id) else {
                return;
            };
            let cancelled = *entry.cancel_tx.borrow();
            let state = if cancelled {
                TaskState::Failed
            } else {
                TaskState::from_reports(&reports)
            };
            if let Err(e) = entry.task.transition(state) {
                warn!(%task_id, error = %e, "Task already terminal; not publishing again");
                return;
            }
            (state, cancelled, entry.state_tx.clone())
        };

        let final_response = match topology {
            Topology::Chain => reports
                .iter()
                .rev()
                .find_map(|r| match &r.outcome {
                    StepOutcome::Succeeded { summary, .. } if state != TaskState::Failed => {
                        Some(summary.clone())
                    }
                    _ => None,
                })
                .unwrap_or_default(),
            Topology::Single | Topology::Parallel => reports
                .iter()
                .filter_map(|r| match &r.outcome {
                    StepOutcome::Succeeded { summary, .. } => Some(summary.as_str()),
                    StepOutcome::Failed { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" | "),
        };

        let failures: Vec<String> = reports
            .iter()
            .filter_map(|r| match &r.outcome {
                StepOutcome::Failed { reason, .. } => Some(format!("{}: {}", r.agent, reason)),
                StepOutcome::Succeeded { .. } => None,
            })
            .collect();

        match state {
            TaskState::Failed => {
                let (kind, message) = if cancelled {
                    (ErrorKind::Cancelled, "task cancelled".to_string())
                } else {
                    (ErrorKind::AgentFailure, format!("task failed: {}", failures.join("; ")))
                };
                let _ = self.publish(EventBody::Error {
                    task_id: Some(task_id),
                    agent: None,
                    invocation_id: None,
                    kind,
                    message,
                });
            }
            TaskState::Partial => {
                let _ = self.publish(EventBody::Status {
                    task_id: Some(task_id),
                    message: format!("partial result; failed: {}", failures.join("; ")),
                });
            }
            _ => {}
        }

        if state != TaskState::Failed {
            for (i, word) in final_response.split_whitespace().enumerate() {
                let token = if i == 0 {
                    word.to_string()
                } else {
                    format!(" {word}")
                };
                let _ = self.publish(EventBody::Token {
                    task_id: Some(task_id),
                    token,
                });
            }
        }

        let outcome = TaskOutcome {
            state,
            topology,
            reports,
            final_response,
        };
        if let Some(entry) = lock(&self.tasks).get_mut(&task_id) {
            entry.outcome = Some(outcome.clone());
        }
        let _ = self.publish(EventBody::TaskDone { task_id, outcome });
        state_tx.send_replace(state);
        info!(%task_id, %state, "Task finished");
    }

    /// Requests cancellation. Returns false if the task already finished or
    /// was already cancelled.
    ///
    /// In-flight invocations are not interrupted; their supervisors publish a
    /// `cancelled` terminal error and discard whatever the agent returns.
    pub fn cancel(&self, task_id: Uuid) -> ChorusResult<bool> {
        // The task table stays locked while `task_cancelled` is published so
        // the driver cannot publish `task_done` ahead of it.
        let tasks = lock(&self.tasks);
        let entry = tasks
            .get(&task_id)
            .ok_or(ChorusError::TaskNotFound(task_id))?;
        if entry.task.state.is_terminal() || *entry.cancel_tx.borrow() {
            return Ok(false);
        }
        info!(%task_id, "Cancelling task");
        self.publish(EventBody::TaskCancelled { task_id })?;
        entry.cancel_tx.send_replace(true);
        Ok(true)
    }

    pub fn task(&self, task_id: Uuid) -> Option<Task> {
        lock(&self.tasks).get(&task_id).map(|e| e.task.clone())
    }

    /// Aggregated result, once the task has finished.
    pub fn outcome(&self, task_id: Uuid) -> Option<TaskOutcome> {
        lock(&self.tasks).get(&task_id).and_then(|e| e.outcome.clone())
    }

    /// Snapshots of every known task, oldest first.
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = lock(&self.tasks).values().map(|e| e.task.clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Descriptors in registry order.
    pub fn agents(&self) -> Vec<AgentDescriptor> {
        let descriptors = lock(&self.descriptors);
        self.agents
            .all()
            .filter_map(|a| descriptors.get(a.name()).map(|slot| slot.descriptor.clone()))
            .collect()
    }

    /// Waits until the task reaches a terminal state and returns it.
    pub async fn wait(&self, task_id: Uuid) -> ChorusResult<Task> {
        let mut rx = lock(&self.tasks)
            .get(&task_id)
            .map(|e| e.state_tx.subscribe())
            .ok_or(ChorusError::TaskNotFound(task_id))?;
        // The sender lives in the task table for the life of the orchestrator.
        let _ = rx.wait_for(|s| s.is_terminal()).await;
        self.task(task_id).ok_or(ChorusError::TaskNotFound(task_id))
    }

    fn mark_active(&self, agent: &str, task_id: Uuid) {
        if let Some(slot) = lock(&self.descriptors).get_mut(agent) {
            if slot.in_flight == 0 {
                slot.failed = false;
            }
            slot.in_flight += 1;
            slot.descriptor.status = AgentStatus::Active;
            slot.descriptor.current_task_id = Some(task_id);
        }
    }

    /// The agent stays active until its last concurrent invocation ends; a
    /// failure in any of them leaves it in `Error`.
    fn mark_finished(&self, agent: &str, status: AgentStatus) {
        if let Some(slot) = lock(&self.descriptors).get_mut(agent) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
            slot.failed |= status == AgentStatus::Error;
            if slot.in_flight == 0 {
                slot.descriptor.status = if slot.failed {
                    AgentStatus::Error
                } else {
                    status
                };
                slot.descriptor.current_task_id = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Subscription;
    use crate::error::AgentError;
    use crate::event::{Event, EventKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    type Script = Box<dyn Fn(&AgentContext, u32) -> Result<AgentOutput, AgentError> + Send + Sync>;

    struct Scripted {
        name: &'static str,
        delay: Duration,
        attempts: AtomicU32,
        script: Script,
    }

    impl Scripted {
        fn new(
            name: &'static str,
            delay: Duration,
            script: impl Fn(&AgentContext, u32) -> Result<AgentOutput, AgentError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                delay,
                attempts: AtomicU32::new(0),
                script: Box::new(script),
            })
        }
    }

    #[async_trait]
    impl Agent for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn capability(&self) -> &str {
            "test agent"
        }

        fn matches(&self, text: &str) -> bool {
            text.contains(self.name)
        }

        async fn run(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.name == "panicky" {
                panic!("agent blew up");
            }
            (self.script)(ctx, attempt)
        }
    }

    fn ok(summary: &str) -> Result<AgentOutput, AgentError> {
        Ok(AgentOutput {
            summary: summary.to_string(),
            data: json!({ "answer": summary }),
        })
    }

    /// Routes every task to a fixed plan.
    struct Fixed(RoutePlan);

    impl RoutingPolicy for Fixed {
        fn plan(&self, _text: &str, _agents: &AgentRegistry) -> RoutePlan {
            self.0.clone()
        }
    }

    fn step(agent: &str) -> RouteStep {
        RouteStep {
            agent: agent.to_string(),
            text: format!("ask {agent}"),
        }
    }

    fn setup(
        agents: Vec<Arc<Scripted>>,
        topology: Topology,
        deadline: Duration,
    ) -> (Arc<Orchestrator>, Subscription) {
        let bus = Arc::new(CommandBus::default());
        let general = Scripted::new("general", Duration::ZERO, |_, _| ok("general answer"));
        let mut builder = AgentRegistry::builder(general);
        let steps = agents.iter().map(|a| step(a.name)).collect();
        for agent in agents {
            builder = builder.specialist(agent);
        }
        let orchestrator = Orchestrator::builder(Arc::clone(&bus), Arc::new(builder.build().unwrap()))
            .routing(Arc::new(Fixed(RoutePlan { topology, steps })))
            .config(OrchestratorConfig {
                agent_deadline: deadline,
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(40),
                },
                ..Default::default()
            })
            .build();
        let sub = bus.subscribe_live(DEFAULT_CHANNEL);
        (orchestrator, sub)
    }

    fn drain(sub: &mut Subscription) -> Vec<Arc<Event>> {
        std::iter::from_fn(|| sub.try_recv()).collect()
    }

    fn count(events: &[Arc<Event>], kind: EventKind) -> usize {
        events.iter().filter(|e| e.kind() == kind).count()
    }

    fn outcome(events: &[Arc<Event>]) -> TaskOutcome {
        events
            .iter()
            .find_map(|e| match &e.body {
                EventBody::TaskDone { outcome, .. } => Some(outcome.clone()),
                _ => None,
            })
            .expect("task_done published")
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_success_publishes_lifecycle_in_order() {
        let agent = Scripted::new("echo", Duration::from_millis(5), |_, _| ok("hello there"));
        let (orch, mut sub) = setup(vec![agent], Topology::Single, Duration::from_secs(5));

        let id = orch.submit("say hi", Context::new()).unwrap();
        let task = orch.wait(id).await.unwrap();
        assert_eq!(task.state, TaskState::Succeeded);

        let kinds: Vec<EventKind> = drain(&mut sub).iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::TaskStart,
                EventKind::AgentStart,
                EventKind::AgentDone,
                EventKind::Token,
                EventKind::Token,
                EventKind::TaskDone,
            ]
        );
        assert_eq!(orch.agents()[1].status, AgentStatus::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_then_succeed() {
        let agent = Scripted::new("flaky", Duration::ZERO, |_, attempt| {
            if attempt < 3 {
                Err(AgentError::Transient("upstream timeout".into()))
            } else {
                ok("third time lucky")
            }
        });
        let (orch, mut sub) = setup(vec![agent], Topology::Single, Duration::from_secs(5));

        let id = orch.submit("go", Context::new()).unwrap();
        assert_eq!(orch.wait(id).await.unwrap().state, TaskState::Succeeded);

        let events = drain(&mut sub);
        let retries = events
            .iter()
            .filter(|e| matches!(&e.body, EventBody::Status { message, .. } if message.starts_with("retrying flaky")))
            .count();
        assert_eq!(retries, 2);
        assert_eq!(count(&events, EventKind::AgentDone), 1);
        assert_eq!(count(&events, EventKind::Error), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_input_is_not_retried() {
        let agent = Scripted::new("strict", Duration::ZERO, |_, _| {
            Err(AgentError::InvalidInput("missing location".into()))
        });
        let (orch, mut sub) = setup(vec![agent.clone()], Topology::Single, Duration::from_secs(5));

        let id = orch.submit("go", Context::new()).unwrap();
        assert_eq!(orch.wait(id).await.unwrap().state, TaskState::Failed);
        assert_eq!(agent.attempts.load(Ordering::SeqCst), 1);

        // Agent error, then the task-level error before task_done.
        let events = drain(&mut sub);
        let tail: Vec<EventKind> = events.iter().rev().take(3).map(|e| e.kind()).collect();
        assert_eq!(
            tail,
            vec![EventKind::TaskDone, EventKind::Error, EventKind::Error]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_forces_timeout_terminal() {
        let slow = Scripted::new("slow", Duration::from_secs(60), |_, _| ok("too late"));
        let fast = Scripted::new("fast", Duration::from_millis(1), |_, _| ok("on time"));
        let (orch, mut sub) = setup(vec![slow, fast], Topology::Parallel, Duration::from_secs(1));

        let id = orch.submit("go", Context::new()).unwrap();
        assert_eq!(orch.wait(id).await.unwrap().state, TaskState::Partial);

        // Let the abandoned agent finish; its result must not surface.
        tokio::time::sleep(Duration::from_secs(120)).await;
        let events = drain(&mut sub);
        let slow_terminals: Vec<&Arc<Event>> = events
            .iter()
            .filter(|e| e.source == "slow")
            .filter(|e| matches!(e.kind(), EventKind::AgentDone | EventKind::Error))
            .collect();
        assert_eq!(slow_terminals.len(), 1);
        assert!(matches!(
            &slow_terminals[0].body,
            EventBody::Error { kind: ErrorKind::AgentTimeout, .. }
        ));

        let report = outcome(&events);
        assert_eq!(report.final_response, "on time");
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_agent_is_a_protocol_violation() {
        let agent = Scripted::new("panicky", Duration::ZERO, |_, _| ok("unreachable"));
        let (orch, mut sub) = setup(vec![agent], Topology::Single, Duration::from_secs(5));

        let id = orch.submit("go", Context::new()).unwrap();
        assert_eq!(orch.wait(id).await.unwrap().state, TaskState::Failed);

        let events = drain(&mut sub);
        assert!(events.iter().any(|e| matches!(
            &e.body,
            EventBody::Error { kind: ErrorKind::ProtocolViolation, agent: Some(a), .. } if a == "panicky"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_passes_results_and_skips_after_failure() {
        let first = Scripted::new("first", Duration::ZERO, |_, _| ok("step one"));
        let second = Scripted::new("second", Duration::ZERO, |ctx, _| {
            assert_eq!(ctx.context["previous_summary"], "step one");
            Err(AgentError::Permanent("cannot continue".into()))
        });
        let third = Scripted::new("third", Duration::ZERO, |_, _| ok("never"));
        let (orch, mut sub) = setup(
            vec![first, second, third.clone()],
            Topology::Chain,
            Duration::from_secs(5),
        );

        let id = orch.submit("go", Context::new()).unwrap();
        assert_eq!(orch.wait(id).await.unwrap().state, TaskState::Partial);
        assert_eq!(third.attempts.load(Ordering::SeqCst), 0);

        let report = outcome(&drain(&mut sub));
        assert!(matches!(
            &report.reports[2].outcome,
            StepOutcome::Failed { reason, .. } if reason == "skipped: upstream step failed"
        ));
        assert_eq!(report.final_response, "step one");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_results_and_fails_task() {
        let agent = Scripted::new("slow", Duration::from_secs(10), |_, _| ok("late"));
        let (orch, mut sub) = setup(vec![agent], Topology::Single, Duration::from_secs(30));

        let id = orch.submit("go", Context::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(orch.cancel(id).unwrap());
        assert!(!orch.cancel(id).unwrap());

        let task = orch.wait(id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        tokio::time::sleep(Duration::from_secs(20)).await;

        let events = drain(&mut sub);
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind()).collect();
        let cancelled_at = kinds.iter().position(|k| *k == EventKind::TaskCancelled).unwrap();
        let done_at = kinds.iter().position(|k| *k == EventKind::TaskDone).unwrap();
        assert!(cancelled_at < done_at);
        assert_eq!(done_at, kinds.len() - 1, "nothing after task_done");
        assert_eq!(count(&events, EventKind::AgentDone), 0);
        assert!(matches!(orch.cancel(Uuid::new_v4()), Err(ChorusError::TaskNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_transient_upstream() {
        let agent = Scripted::new("flaky", Duration::ZERO, |_, _| {
            Err(AgentError::Transient("503".into()))
        });
        let (orch, mut sub) = setup(vec![agent.clone()], Topology::Single, Duration::from_secs(5));

        let id = orch.submit("go", Context::new()).unwrap();
        assert_eq!(orch.wait(id).await.unwrap().state, TaskState::Failed);
        assert_eq!(agent.attempts.load(Ordering::SeqCst), 3);

        let events = drain(&mut sub);
        assert!(events.iter().any(|e| matches!(
            &e.body,
            EventBody::Error { kind: ErrorKind::TransientUpstream, agent: Some(a), message, .. }
                if a == "flaky" && message.ends_with("(gave up after 3 attempts)")
        )));
        assert!(matches!(
            &outcome(&events).reports[0].outcome,
            StepOutcome::Failed { kind: ErrorKind::TransientUpstream, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_is_registered_before_task_start_is_seen() {
        let agent = Scripted::new("echo", Duration::from_millis(5), |_, _| ok("hi"));
        let (orch, mut sub) = setup(vec![agent], Topology::Single, Duration::from_secs(5));

        let id = orch.submit("go", Context::new()).unwrap();
        let first = sub.try_recv().unwrap();
        assert!(matches!(&first.body, EventBody::TaskStart { task_id, .. } if *task_id == id));
        assert!(orch.task(id).is_some());
        assert!(orch.cancel(id).unwrap());
        assert_eq!(orch.wait(id).await.unwrap().state, TaskState::Failed);
    }

    /// Takes longer for some cities than others.
    struct PerCity;

    #[async_trait]
    impl Agent for PerCity {
        fn name(&self) -> &str {
            "weather"
        }

        fn capability(&self) -> &str {
            "weather per city"
        }

        fn matches(&self, _text: &str) -> bool {
            true
        }

        async fn run(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
            let delay = if ctx.text == "Oslo" { 10 } else { 200 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            ok(&ctx.text)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_stays_active_until_last_fanout_step_ends() {
        let general = Scripted::new("general", Duration::ZERO, |_, _| ok("general answer"));
        let registry = AgentRegistry::builder(general)
            .specialist(Arc::new(PerCity))
            .build()
            .unwrap();
        let steps = ["Oslo", "Lima"]
            .into_iter()
            .map(|city| RouteStep {
                agent: "weather".into(),
                text: city.into(),
            })
            .collect();
        let orch = Orchestrator::builder(Arc::new(CommandBus::default()), Arc::new(registry))
            .routing(Arc::new(Fixed(RoutePlan {
                topology: Topology::Parallel,
                steps,
            })))
            .build();

        let id = orch.submit("weather in Oslo and Lima", Context::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Oslo is done, Lima is still running.
        let mid = orch.agents()[1].clone();
        assert_eq!(mid.status, AgentStatus::Active);
        assert_eq!(mid.current_task_id, Some(id));

        assert_eq!(orch.wait(id).await.unwrap().state, TaskState::Succeeded);
        let end = orch.agents()[1].clone();
        assert_eq!(end.status, AgentStatus::Done);
        assert_eq!(end.current_task_id, None);
    }

    #[tokio::test]
    async fn test_empty_task_is_rejected() {
        let (orch, _sub) = setup(vec![], Topology::Single, Duration::from_secs(1));
        assert!(matches!(
            orch.submit("   ", Context::new()),
            Err(ChorusError::InvalidTask(_))
        ));
    }
}
