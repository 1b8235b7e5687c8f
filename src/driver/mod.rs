//! Fleet dispatcher.
//!
//! Fans one logical command out to a set of nodes over HTTP and collects a
//! result per node. Delivery is sequential and best-effort: a node that is
//! down delays the dispatch but never aborts it.

mod registry;

pub use registry::{Node, NodeRegistry};

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::DEFAULT_TIMEOUT_SECS;
use crate::error::{HavocError, Result};
use crate::protocol::{CommandEnvelope, ErrorEnvelope, ErrorKind};

/// Which nodes a dispatch goes to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Targets {
    pub nodes: Vec<String>,
    pub groups: Vec<String>,
}

impl Targets {
    /// Every registered node.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn nodes<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
            groups: Vec::new(),
        }
    }

    pub fn groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: Vec::new(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }
}

/// What one node answered.
///
/// `Reply` holds whatever JSON the agent returned, including its own 403
/// error envelopes. `Failed` means the agent could not be reached or did not
/// answer with JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NodeResult {
    Reply(Value),
    Failed(ErrorEnvelope),
}

impl NodeResult {
    pub fn reply(&self) -> Option<&Value> {
        match self {
            Self::Reply(v) => Some(v),
            Self::Failed(_) => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Per-node results of one dispatch, keyed by node name.
pub type DispatchResult = BTreeMap<String, NodeResult>;

pub struct Driver {
    registry: NodeRegistry,
    client: Client,
}

impl Driver {
    pub fn new(registry: NodeRegistry) -> Result<Self> {
        Self::with_timeout(registry, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// `timeout` bounds each node's request on its own.
    pub fn with_timeout(registry: NodeRegistry, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { registry, client })
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Register or refresh a node after the driver is built.
    pub fn add_node(&mut self, name: &str, endpoint: &str, group: &str, secret: &str) {
        self.registry.add_node(name, endpoint, group, secret);
    }

    /// Send `command` to every resolved target and collect the answers.
    pub async fn dispatch(
        &self,
        command: &str,
        arguments: Option<Map<String, Value>>,
        targets: &Targets,
    ) -> Result<DispatchResult> {
        if command.is_empty() {
            return Err(HavocError::InvalidCommand("command must not be empty".to_string()));
        }

        let nodes = self.registry.resolve(&targets.nodes, &targets.groups);
        if nodes.is_empty() {
            return Err(HavocError::NoNodesConfigured);
        }

        tracing::info!("Dispatching '{}' to {} node(s)", command, nodes.len());

        let mut results = DispatchResult::new();
        for node in nodes {
            let envelope = CommandEnvelope::new(command, arguments.clone(), &node.secret);
            let result = self.send(&node, &envelope).await;
            if let NodeResult::Failed(err) = &result {
                tracing::warn!("Node {} failed: {}", node.name, err.value);
            }
            results.insert(node.name, result);
        }

        Ok(results)
    }

    async fn send(&self, node: &Node, envelope: &CommandEnvelope) -> NodeResult {
        let url = endpoint_url(&node.endpoint);
        tracing::debug!("POST {} command={}", url, envelope.command);

        let response = match self.client.post(&url).json(envelope).send().await {
            Ok(r) => r,
            Err(e) => {
                return NodeResult::Failed(ErrorEnvelope::new(
                    ErrorKind::TransportError,
                    format!("Request to {} failed: {}", url, e),
                ))
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                return NodeResult::Failed(ErrorEnvelope::new(
                    ErrorKind::TransportError,
                    format!("Failed to read response from {}: {}", url, e),
                ))
            }
        };

        match serde_json::from_str::<Value>(&body) {
            Ok(value) => NodeResult::Reply(value),
            Err(_) => {
                tracing::debug!("Non-JSON answer from {} ({}): {}", url, status, body);
                NodeResult::Failed(ErrorEnvelope::new(ErrorKind::TransportError, body))
            }
        }
    }

    // ------------------------------------------------------------------
    // Process control
    // ------------------------------------------------------------------

    pub async fn get_process(&self, targets: &Targets, pids: &[u32], names: &[&str]) -> Result<DispatchResult> {
        self.dispatch("get_process", selector_args(pids, names), targets)
            .await
    }

    pub async fn list_process(&self, targets: &Targets) -> Result<DispatchResult> {
        self.dispatch("list_process", None, targets).await
    }

    pub async fn kill_process(&self, targets: &Targets, pids: &[u32], names: &[&str]) -> Result<DispatchResult> {
        self.dispatch("kill_process", selector_args(pids, names), targets)
            .await
    }

    pub async fn suspend_process(&self, targets: &Targets, pids: &[u32], names: &[&str]) -> Result<DispatchResult> {
        self.dispatch("suspend_process", selector_args(pids, names), targets)
            .await
    }

    pub async fn resume_process(&self, targets: &Targets, pids: &[u32], names: &[&str]) -> Result<DispatchResult> {
        self.dispatch("resume_process", selector_args(pids, names), targets)
            .await
    }

    /// Poll `get_process` once per second until every targeted node reports
    /// at least one matching process, or `timeout` elapses.
    ///
    /// Returns the last answer either way.
    pub async fn wait_for_process(
        &self,
        targets: &Targets,
        pids: &[u32],
        names: &[&str],
        timeout: Duration,
    ) -> Result<DispatchResult> {
        let deadline = Instant::now() + timeout;
        loop {
            let result = self.get_process(targets, pids, names).await?;
            if result.values().all(has_processes) {
                return Ok(result);
            }
            if Instant::now() >= deadline {
                tracing::info!("Processes did not show up within {:?}", timeout);
                return Ok(result);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    pub async fn exec_command(
        &self,
        targets: &Targets,
        cmd: &str,
        result_should_contain: Option<&str>,
        result_should_not_contain: Option<&str>,
    ) -> Result<DispatchResult> {
        if cmd.is_empty() {
            return Err(HavocError::InvalidCommand("cmd: command is not specified".to_string()));
        }
        let mut args = Map::new();
        args.insert("cmd".into(), json!(cmd));
        if let Some(s) = result_should_contain.filter(|s| !s.is_empty()) {
            args.insert("result_should_contain".into(), json!(s));
        }
        if let Some(s) = result_should_not_contain.filter(|s| !s.is_empty()) {
            args.insert("result_should_not_contain".into(), json!(s));
        }
        self.dispatch("exec_command", Some(args), targets).await
    }

    // ------------------------------------------------------------------
    // Node and network
    // ------------------------------------------------------------------

    pub async fn shutdown_node(&self, targets: &Targets) -> Result<DispatchResult> {
        self.dispatch("shutdown_node", None, targets).await
    }

    pub async fn restart_node(&self, targets: &Targets) -> Result<DispatchResult> {
        self.dispatch("restart_node", None, targets).await
    }

    pub async fn list_network_adapters(&self, targets: &Targets) -> Result<DispatchResult> {
        self.dispatch("list_network_adapters", None, targets).await
    }

    pub async fn disable_network_adapters(
        &self,
        targets: &Targets,
        adapters: &[&str],
        timeout: Duration,
    ) -> Result<DispatchResult> {
        let mut args = adapters_args(adapters);
        args.insert("timeout".into(), json!(timeout.as_secs_f64()));
        self.dispatch("disable_network_adapters", Some(args), targets)
            .await
    }

    pub async fn enable_network_adapters(&self, targets: &Targets, adapters: &[&str]) -> Result<DispatchResult> {
        let args = adapters_args(adapters);
        self.dispatch(
            "enable_network_adapters",
            (!args.is_empty()).then_some(args),
            targets,
        )
        .await
    }

    pub async fn blink_networking(
        &self,
        targets: &Targets,
        enable_network_timeout: Duration,
        disable_network_timeout: Duration,
        adapters: &[&str],
        work_time: Duration,
    ) -> Result<DispatchResult> {
        let mut args = adapters_args(adapters);
        args.insert(
            "enable_network_timeout".into(),
            json!(enable_network_timeout.as_secs_f64()),
        );
        args.insert(
            "disable_network_timeout".into(),
            json!(disable_network_timeout.as_secs_f64()),
        );
        args.insert("work_time".into(), json!(work_time.as_secs_f64()));
        self.dispatch("blink_networking", Some(args), targets).await
    }

    pub async fn block_dnsname(&self, targets: &Targets, dnsnames: &[&str], timeout: Duration) -> Result<DispatchResult> {
        let mut args = Map::new();
        args.insert("dnsname".into(), json!(dnsnames));
        args.insert("timeout".into(), json!(timeout.as_secs_f64()));
        self.dispatch("block_dnsname", Some(args), targets).await
    }

    // ------------------------------------------------------------------
    // Resource burn
    // ------------------------------------------------------------------

    pub async fn burn_cpu(&self, targets: &Targets, timeout: Duration) -> Result<DispatchResult> {
        self.dispatch("burn_cpu", Some(timeout_args(timeout)), targets)
            .await
    }

    pub async fn burn_ram(&self, targets: &Targets, timeout: Duration) -> Result<DispatchResult> {
        self.dispatch("burn_ram", Some(timeout_args(timeout)), targets)
            .await
    }

    /// `file_size` uses the agent's `<count>[B|K|M]` format, e.g. `"1k"`.
    pub async fn burn_disk(
        &self,
        targets: &Targets,
        timeout: Duration,
        file_size: &str,
        thread_limit: u32,
    ) -> Result<DispatchResult> {
        let mut args = timeout_args(timeout);
        args.insert("file_size".into(), json!(file_size));
        args.insert("thread_limit".into(), json!(thread_limit.to_string()));
        self.dispatch("burn_disk", Some(args), targets).await
    }
}

/// Normalize an endpoint into a URL for the agent root.
pub fn endpoint_url(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

fn selector_args(pids: &[u32], names: &[&str]) -> Option<Map<String, Value>> {
    let mut args = Map::new();
    if !pids.is_empty() {
        args.insert("pids".into(), json!(pids));
    }
    if !names.is_empty() {
        args.insert("names".into(), json!(names));
    }
    (!args.is_empty()).then_some(args)
}

fn adapters_args(adapters: &[&str]) -> Map<String, Value> {
    let mut args = Map::new();
    if !adapters.is_empty() {
        args.insert("adapters".into(), json!(adapters));
    }
    args
}

fn timeout_args(timeout: Duration) -> Map<String, Value> {
    let mut args = Map::new();
    args.insert("timeout".into(), json!(timeout.as_secs_f64()));
    args
}

fn has_processes(result: &NodeResult) -> bool {
    result
        .reply()
        .and_then(|v| v.get("list"))
        .and_then(|l| l.as_array())
        .is_some_and(|l| !l.is_empty())
}
