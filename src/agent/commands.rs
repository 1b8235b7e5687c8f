//! The command surface exposed over the wire.
//!
//! Each command is a handler in a static table keyed by its wire name. A
//! handler decodes its own arguments object, so shape errors surface as
//! `wrong_parameters` without reaching the component.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use havoc::protocol::OperationResult;

use crate::args::{self, duration_or};
use crate::error::{CommandError, CommandResult};
use crate::exec;
use crate::network::{self, NetworkInjector};
use crate::node;
use crate::process::{PollPolicy, ProcessController};
use crate::resource::{self, WorkerLauncher};

pub type Handler = fn(&Agent, Map<String, Value>) -> CommandResult<Value>;

const ADMIN_REQUIRED: &str = "This function must be run by Admin";

/// Wire name to handler, in catalogue order.
const COMMANDS: &[(&str, Handler)] = &[
    ("get_process", Agent::get_process),
    ("list_process", Agent::list_process),
    ("kill_process", Agent::kill_process),
    ("suspend_process", Agent::suspend_process),
    ("resume_process", Agent::resume_process),
    ("list_network_adapters", Agent::list_network_adapters),
    ("disable_network_adapters", Agent::disable_network_adapters),
    ("enable_network_adapters", Agent::enable_network_adapters),
    ("blink_networking", Agent::blink_networking),
    ("block_dnsname", Agent::block_dnsname),
    ("burn_cpu", Agent::burn_cpu),
    ("burn_ram", Agent::burn_ram),
    ("burn_disk", Agent::burn_disk),
    ("exec_command", Agent::exec_command),
    ("shutdown_node", Agent::shutdown_node),
    ("restart_node", Agent::restart_node),
];

fn table() -> &'static HashMap<&'static str, Handler> {
    static TABLE: OnceLock<HashMap<&'static str, Handler>> = OnceLock::new();
    TABLE.get_or_init(|| COMMANDS.iter().copied().collect())
}

/// Every command name, in catalogue order.
pub fn command_names() -> Vec<&'static str> {
    COMMANDS.iter().map(|(name, _)| *name).collect()
}

pub fn lookup(name: &str) -> Option<Handler> {
    table().get(name).copied()
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessArgs {
    #[serde(default, deserialize_with = "args::pids")]
    pids: Vec<u32>,
    #[serde(default, deserialize_with = "args::string_list")]
    names: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimeoutArgs {
    #[serde(default, deserialize_with = "args::seconds")]
    timeout: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdapterArgs {
    #[serde(default, deserialize_with = "args::string_list")]
    adapters: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DisableArgs {
    #[serde(default, deserialize_with = "args::string_list")]
    adapters: Vec<String>,
    #[serde(default, deserialize_with = "args::seconds")]
    timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BlinkArgs {
    enable_network_timeout: Value,
    disable_network_timeout: Value,
    #[serde(default, deserialize_with = "args::string_list")]
    adapters: Vec<String>,
    #[serde(default, deserialize_with = "args::seconds")]
    work_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DnsArgs {
    #[serde(deserialize_with = "args::string_list")]
    dnsname: Vec<String>,
    #[serde(default, deserialize_with = "args::seconds")]
    timeout: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BurnDiskArgs {
    #[serde(default, deserialize_with = "args::seconds")]
    timeout: Option<f64>,
    #[serde(default, deserialize_with = "args::raw_string")]
    file_size: Option<String>,
    #[serde(default, deserialize_with = "args::raw_string")]
    thread_limit: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecArgs {
    cmd: String,
    #[serde(default)]
    result_should_contain: Option<String>,
    #[serde(default)]
    result_should_not_contain: Option<String>,
}

fn decode<T: DeserializeOwned>(arguments: Map<String, Value>) -> CommandResult<T> {
    Ok(serde_json::from_value(Value::Object(arguments))?)
}

fn to_json<T: Serialize>(value: &T) -> CommandResult<Value> {
    serde_json::to_value(value).map_err(|e| CommandError::Unexpected(e.to_string()))
}

fn wrap_list<T: Serialize>(items: &[T]) -> CommandResult<Value> {
    Ok(json!({ "list": to_json(&items)? }))
}

/// Owns the components every handler runs against.
pub struct Agent {
    process: ProcessController,
    network: NetworkInjector,
    workers: WorkerLauncher,
    is_admin: bool,
}

impl Agent {
    pub fn new(
        process: ProcessController,
        network: NetworkInjector,
        workers: WorkerLauncher,
        is_admin: bool,
    ) -> Self {
        Self {
            process,
            network,
            workers,
            is_admin,
        }
    }

    /// Agent wired to the real host.
    pub fn system(workers: WorkerLauncher) -> Self {
        Self::new(
            ProcessController::new(PollPolicy::default()),
            NetworkInjector::system(),
            workers,
            running_as_admin(),
        )
    }

    /// Run `name` with `arguments`; `None` when no such command exists.
    #[cfg(test)]
    pub fn invoke(&self, name: &str, arguments: Map<String, Value>) -> Option<CommandResult<Value>> {
        lookup(name).map(|handler| handler(self, arguments))
    }

    fn admin_required(&self) -> Option<Value> {
        if self.is_admin {
            return None;
        }
        tracing::warn!("Privileged command refused: agent is not running as admin");
        serde_json::to_value(OperationResult::error(ADMIN_REQUIRED)).ok()
    }

    fn get_process(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let a: ProcessArgs = decode(arguments)?;
        wrap_list(&self.process.get_process(&a.pids, &a.names)?)
    }

    fn list_process(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let NoArgs {} = decode(arguments)?;
        wrap_list(&self.process.list_process())
    }

    fn kill_process(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let a: ProcessArgs = decode(arguments)?;
        wrap_list(&self.process.kill_process(&a.pids, &a.names)?)
    }

    fn suspend_process(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let a: ProcessArgs = decode(arguments)?;
        wrap_list(&self.process.suspend_process(&a.pids, &a.names)?)
    }

    fn resume_process(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let a: ProcessArgs = decode(arguments)?;
        wrap_list(&self.process.resume_process(&a.pids, &a.names)?)
    }

    fn list_network_adapters(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let NoArgs {} = decode(arguments)?;
        if let Some(denied) = self.admin_required() {
            return Ok(denied);
        }
        to_json(&self.network.list_network_adapters()?)
    }

    fn disable_network_adapters(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let a: DisableArgs = decode(arguments)?;
        if let Some(denied) = self.admin_required() {
            return Ok(denied);
        }
        let timeout = duration_or(a.timeout, 0.0);
        to_json(&self.network.disable_network_adapters(a.adapters, timeout)?)
    }

    fn enable_network_adapters(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let a: AdapterArgs = decode(arguments)?;
        if let Some(denied) = self.admin_required() {
            return Ok(denied);
        }
        to_json(&self.network.enable_network_adapters(&a.adapters))
    }

    fn blink_networking(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let a: BlinkArgs = decode(arguments)?;
        if let Some(denied) = self.admin_required() {
            return Ok(denied);
        }
        let step = |v: &Value| duration_or(args::parse_seconds(v), network::DEFAULT_BLINK_STEP_SECS);
        to_json(&self.network.blink_networking(
            step(&a.enable_network_timeout),
            step(&a.disable_network_timeout),
            a.adapters,
            duration_or(a.work_time, network::DEFAULT_BLINK_WORK_SECS),
        )?)
    }

    fn block_dnsname(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let a: DnsArgs = decode(arguments)?;
        if let Some(denied) = self.admin_required() {
            return Ok(denied);
        }
        let timeout = duration_or(a.timeout, network::DEFAULT_DNS_BLOCK_SECS);
        to_json(&self.network.block_dnsname(a.dnsname, timeout)?)
    }

    fn burn_cpu(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let a: TimeoutArgs = decode(arguments)?;
        let timeout = duration_or(a.timeout, resource::DEFAULT_BURN_SECS);
        to_json(&resource::burn_cpu(&self.workers, timeout)?)
    }

    fn burn_ram(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let a: TimeoutArgs = decode(arguments)?;
        let timeout = duration_or(a.timeout, resource::DEFAULT_BURN_SECS);
        to_json(&resource::burn_ram(&self.workers, timeout)?)
    }

    fn burn_disk(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let a: BurnDiskArgs = decode(arguments)?;
        to_json(&resource::burn_disk(
            &self.workers,
            duration_or(a.timeout, resource::DEFAULT_BURN_SECS),
            a.file_size.as_deref().unwrap_or(resource::DEFAULT_FILE_SIZE),
            a.thread_limit.as_deref().unwrap_or(resource::DEFAULT_THREAD_LIMIT),
        )?)
    }

    fn exec_command(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let a: ExecArgs = decode(arguments)?;
        to_json(&exec::exec_command(
            &a.cmd,
            a.result_should_contain.as_deref(),
            a.result_should_not_contain.as_deref(),
        )?)
    }

    fn shutdown_node(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let NoArgs {} = decode(arguments)?;
        if let Some(denied) = self.admin_required() {
            return Ok(denied);
        }
        to_json(&node::shutdown_node()?)
    }

    fn restart_node(&self, arguments: Map<String, Value>) -> CommandResult<Value> {
        let NoArgs {} = decode(arguments)?;
        if let Some(denied) = self.admin_required() {
            return Ok(denied);
        }
        to_json(&node::restart_node()?)
    }
}

#[cfg(unix)]
fn running_as_admin() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
fn running_as_admin() -> bool {
    // Privileged tools fail loudly on their own when not elevated
    true
}
