//! AI agent contract
//!
//! The agent converts natural-language instructions into screen actions. The
//! control plane treats it as a black box: it never sees model output, only
//! success, failure, query answers, and task-start tips.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;

/// Callback invoked when the agent starts working on a task.
///
/// One tip is one AI action for usage accounting. The executor's callback
/// logs the tip and captures a screenshot, so it is async.
pub type TipCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Driver for a single target's agent, browser or Android.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    /// Launch the app this agent is attached to (Android only; browser
    /// agents reject this).
    async fn launch(&self, app_id: &str) -> Result<()>;

    /// Perform a natural-language action on the target.
    async fn ai_act(&self, instruction: &str) -> Result<()>;

    /// Check a natural-language assertion against the target.
    async fn ai_assert(&self, instruction: &str) -> Result<()>;

    /// Ask a question about the current screen; returns the agent's answer.
    async fn ai_query(&self, prompt: &str) -> Result<String>;

    /// Wait until a natural-language predicate holds, within the deadline.
    async fn ai_wait_for(&self, predicate: &str, timeout: Duration) -> Result<()>;

    /// Install standing context prepended to every instruction.
    async fn set_act_context(&self, context: &str) -> Result<()>;

    /// Register the task-start tip callback. At most one is active.
    fn on_task_start_tip(&self, callback: TipCallback);
}

/// Constructs agents for targets.
///
/// The AI key travels here per run; concurrent runs with distinct keys get
/// distinct driver instances and never observe each other's credentials.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    /// Agent bound to an Android device identified by serial.
    async fn android_agent(&self, serial: &str) -> Result<Arc<dyn AgentDriver>>;

    /// Agent bound to a browser page, primed with a security preamble.
    async fn browser_agent(
        &self,
        page: Arc<dyn crate::browser::PageHandle>,
        api_key: &str,
        preamble: &str,
    ) -> Result<Arc<dyn AgentDriver>>;

    /// Hand the run's key to an already-attached Android agent.
    async fn configure_android_agent(
        &self,
        agent: &Arc<dyn AgentDriver>,
        api_key: &str,
    ) -> Result<()>;
}

pub mod mock {
    //! Scripted agent for tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{AgentDriver, AgentFactory, TipCallback};

    /// Mock implementation of [`AgentDriver`].
    ///
    /// Every operation fires the task-start tip (as the real agent does),
    /// records the call, and consults scripted failures and query answers.
    /// Failure patterns match by substring; the first match wins.
    #[derive(Default)]
    pub struct MockAgent {
        calls: Mutex<Vec<String>>,
        act_failures: Mutex<Vec<(String, String, Option<usize>)>>,
        assert_failures: Mutex<Vec<(String, String)>>,
        query_responses: Mutex<HashMap<String, VecDeque<String>>>,
        act_delay: Mutex<Option<Duration>>,
        tip: Mutex<Option<TipCallback>>,
    }

    impl MockAgent {
        #[must_use]
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Make every `ai_act` take this long. Lets tests hold a run in
        /// `RUNNING` while they observe the queue.
        pub fn set_act_delay(&self, delay: Duration) {
            *self.act_delay.lock() = Some(delay);
        }

        /// Fail `ai_act` whenever the instruction contains `pattern`.
        pub fn fail_act_containing(&self, pattern: &str, message: &str) {
            self.act_failures.lock().push((
                pattern.to_string(),
                message.to_string(),
                None,
            ));
        }

        /// Fail `ai_act` for the next `count` matching instructions only.
        pub fn fail_act_times(&self, pattern: &str, message: &str, count: usize) {
            self.act_failures.lock().push((
                pattern.to_string(),
                message.to_string(),
                Some(count),
            ));
        }

        /// Fail `ai_assert` whenever the instruction contains `pattern`.
        pub fn fail_assert_containing(&self, pattern: &str, message: &str) {
            self.assert_failures
                .lock()
                .push((pattern.to_string(), message.to_string()));
        }

        /// Answer `ai_query` prompts containing `pattern` with `response`.
        /// Multiple responses for one pattern are consumed in order.
        pub fn answer_query(&self, pattern: &str, response: &str) {
            self.query_responses
                .lock()
                .entry(pattern.to_string())
                .or_default()
                .push_back(response.to_string());
        }

        #[must_use]
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        #[must_use]
        pub fn calls_containing(&self, needle: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.contains(needle))
                .count()
        }

        async fn fire_tip(&self, description: &str) {
            let tip = self.tip.lock().clone();
            if let Some(tip) = tip {
                tip(description.to_string()).await;
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }
    }

    #[async_trait]
    impl AgentDriver for MockAgent {
        async fn launch(&self, app_id: &str) -> Result<()> {
            self.record(format!("launch {app_id}"));
            Ok(())
        }

        async fn ai_act(&self, instruction: &str) -> Result<()> {
            self.record(format!("act {instruction}"));
            self.fire_tip(instruction).await;
            let delay = *self.act_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut failures = self.act_failures.lock();
            for (pattern, message, remaining) in failures.iter_mut() {
                if instruction.contains(pattern.as_str()) {
                    match remaining {
                        Some(0) => continue,
                        Some(n) => {
                            *n -= 1;
                            return Err(anyhow!(message.clone()));
                        }
                        None => return Err(anyhow!(message.clone())),
                    }
                }
            }
            Ok(())
        }

        async fn ai_assert(&self, instruction: &str) -> Result<()> {
            self.record(format!("assert {instruction}"));
            self.fire_tip(instruction).await;
            let failures = self.assert_failures.lock();
            for (pattern, message) in failures.iter() {
                if instruction.contains(pattern.as_str()) {
                    return Err(anyhow!(message.clone()));
                }
            }
            Ok(())
        }

        async fn ai_query(&self, prompt: &str) -> Result<String> {
            self.record(format!("query {prompt}"));
            let mut responses = self.query_responses.lock();
            for (pattern, queue) in responses.iter_mut() {
                if prompt.contains(pattern.as_str()) {
                    let response = if queue.len() > 1 {
                        queue.pop_front()
                    } else {
                        queue.front().cloned()
                    };
                    if let Some(response) = response {
                        return Ok(response);
                    }
                }
            }
            Ok("NOT_FOUND".to_string())
        }

        async fn ai_wait_for(&self, predicate: &str, _timeout: Duration) -> Result<()> {
            self.record(format!("wait_for {predicate}"));
            Ok(())
        }

        async fn set_act_context(&self, context: &str) -> Result<()> {
            self.record(format!("set_context {context}"));
            Ok(())
        }

        fn on_task_start_tip(&self, callback: TipCallback) {
            *self.tip.lock() = Some(callback);
        }
    }

    /// Factory handing out pre-scripted agents in order, or fresh defaults.
    #[derive(Default)]
    pub struct MockAgentFactory {
        scripted: Mutex<VecDeque<Arc<MockAgent>>>,
        created: Mutex<Vec<Arc<MockAgent>>>,
    }

    impl MockAgentFactory {
        #[must_use]
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Queue an agent to be returned by the next factory call.
        pub fn queue_agent(&self, agent: Arc<MockAgent>) {
            self.scripted.lock().push_back(agent);
        }

        /// Every agent this factory has produced.
        #[must_use]
        pub fn created(&self) -> Vec<Arc<MockAgent>> {
            self.created.lock().clone()
        }

        fn next_agent(&self) -> Arc<MockAgent> {
            let agent = self
                .scripted
                .lock()
                .pop_front()
                .unwrap_or_else(MockAgent::new);
            self.created.lock().push(Arc::clone(&agent));
            agent
        }
    }

    #[async_trait]
    impl AgentFactory for MockAgentFactory {
        async fn android_agent(&self, _serial: &str) -> Result<Arc<dyn AgentDriver>> {
            Ok(self.next_agent())
        }

        async fn browser_agent(
            &self,
            _page: Arc<dyn crate::browser::PageHandle>,
            _api_key: &str,
            preamble: &str,
        ) -> Result<Arc<dyn AgentDriver>> {
            let agent = self.next_agent();
            agent.record(format!("preamble {preamble}"));
            Ok(agent)
        }

        async fn configure_android_agent(
            &self,
            _agent: &Arc<dyn AgentDriver>,
            _api_key: &str,
        ) -> Result<()> {
            Ok(())
        }
    }
}
