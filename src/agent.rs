//! Agent execution boundary.
//!
//! The scheduler only ever sees the [`Agent`] trait: one asynchronous
//! `invoke(task, invocation)` call. Concrete agents form a closed set in
//! [`AgentBackend`], and [`AgentRouter`] picks one per task by `agent_ref`.

use std::collections::HashMap;
use std::process::Stdio;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::config::Config;
use crate::core::task::Task;
use crate::orchestration::budget::{ExecutionTier, TokenUsage};
use crate::{swlog_debug, Error, Result};

/// Per-attempt input handed to an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Outputs of the task's successful dependencies.
    pub context: String,
    /// Tier the agent should target.
    pub tier: ExecutionTier,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// What an agent produced for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub content: String,
    pub usage: TokenUsage,
}

/// Anything that can execute a task.
pub trait Agent: Send + Sync {
    fn invoke<'a>(
        &'a self,
        task: &'a Task,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<AgentReply>>;
}

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Prompt text sent to external agents.
pub fn render_prompt(task: &Task, invocation: &Invocation) -> String {
    if invocation.context.is_empty() {
        task.description.clone()
    } else {
        format!(
            "{}\n\nContext from completed dependencies:\n{}",
            task.description, invocation.context
        )
    }
}

/// Answers every task by echoing it back. Used for dry runs.
#[derive(Debug, Clone, Default)]
pub struct EchoAgent;

impl EchoAgent {
    fn reply(&self, task: &Task, invocation: &Invocation) -> AgentReply {
        let content = format!("[{}] {}", task.agent_ref, task.description);
        let prompt = render_prompt(task, invocation);
        AgentReply {
            usage: TokenUsage::new(estimate_tokens(&prompt), estimate_tokens(&content)),
            content,
        }
    }
}

/// Runs an external command with the prompt as its last argument and
/// returns its stdout.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    base_command: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: &str) -> Self {
        Self {
            base_command: command.split_whitespace().map(String::from).collect(),
        }
    }

    pub fn binary(&self) -> &str {
        self.base_command.first().map(|s| s.as_str()).unwrap_or("")
    }

    pub fn command(&self, prompt: Option<&str>) -> Vec<String> {
        let mut cmd = self.base_command.clone();
        if let Some(p) = prompt {
            cmd.push(p.to_string());
        }
        cmd
    }

    pub fn is_available(&self) -> bool {
        !self.binary().is_empty() && which::which(self.binary()).is_ok()
    }

    async fn run(&self, task: &Task, invocation: &Invocation) -> Result<AgentReply> {
        if !self.is_available() {
            return Err(Error::AgentNotAvailable(self.binary().to_string()));
        }
        let prompt = render_prompt(task, invocation);
        let argv = self.command(Some(&prompt));
        swlog_debug!(
            "agent: running {} for task {} (tier={}, attempt={})",
            self.binary(),
            task.id,
            invocation.tier,
            invocation.attempt
        );

        let output = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .env("SWARM_TASK_ID", task.id.to_string())
            .env("SWARM_AGENT", &task.agent_ref)
            .env("SWARM_TIER", invocation.tier.to_string())
            .env("SWARM_ATTEMPT", invocation.attempt.to_string())
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Agent(format!(
                "{} exited with {}: {}",
                self.binary(),
                output.status,
                stderr.trim()
            )));
        }
        let content = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        Ok(AgentReply {
            usage: TokenUsage::new(estimate_tokens(&prompt), estimate_tokens(&content)),
            content,
        })
    }
}

/// The closed set of built-in agents.
#[derive(Debug, Clone)]
pub enum AgentBackend {
    Echo(EchoAgent),
    Command(CommandAgent),
}

impl Agent for AgentBackend {
    fn invoke<'a>(
        &'a self,
        task: &'a Task,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<AgentReply>> {
        match self {
            AgentBackend::Echo(echo) => {
                let reply = echo.reply(task, invocation);
                async move { Ok(reply) }.boxed()
            }
            AgentBackend::Command(cmd) => cmd.run(task, invocation).boxed(),
        }
    }
}

/// Routes each task to the backend registered for its `agent_ref`.
#[derive(Debug, Clone)]
pub struct AgentRouter {
    routes: HashMap<String, AgentBackend>,
    fallback: AgentBackend,
}

impl AgentRouter {
    pub fn new(fallback: AgentBackend) -> Self {
        Self {
            routes: HashMap::new(),
            fallback,
        }
    }

    /// Routes from `[agents]` plus `default_command`; tasks with no route
    /// fall back to the echo agent when no default command is set.
    pub fn from_config(config: &Config) -> Self {
        let fallback = match &config.default_command {
            Some(cmd) => AgentBackend::Command(CommandAgent::new(cmd)),
            None => AgentBackend::Echo(EchoAgent),
        };
        let mut router = Self::new(fallback);
        for (agent_ref, cmd) in &config.agents {
            router = router.route(agent_ref, AgentBackend::Command(CommandAgent::new(cmd)));
        }
        router
    }

    pub fn route(mut self, agent_ref: &str, backend: AgentBackend) -> Self {
        self.routes.insert(agent_ref.to_string(), backend);
        self
    }

    pub fn backend_for(&self, agent_ref: &str) -> &AgentBackend {
        self.routes.get(agent_ref).unwrap_or(&self.fallback)
    }

    /// Binaries referenced by command routes that are not on `PATH`.
    pub fn missing_binaries(&self) -> Vec<String> {
        let mut missing: Vec<String> = self
            .routes
            .values()
            .chain(std::iter::once(&self.fallback))
            .filter_map(|backend| match backend {
                AgentBackend::Command(cmd) if !cmd.is_available() => {
                    Some(cmd.binary().to_string())
                }
                _ => None,
            })
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}

impl Agent for AgentRouter {
    fn invoke<'a>(
        &'a self,
        task: &'a Task,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<AgentReply>> {
        self.backend_for(&task.agent_ref).invoke(task, invocation)
    }
}
