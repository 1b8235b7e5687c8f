//! Network fault injection: adapter flapping and DNS blackholing.
//!
//! Everything except `enable_network_adapters` and `list_network_adapters`
//! acknowledges first and acts on a background thread after a short grace
//! period, so the reply leaves the host before the network goes away.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::Networks;

use havoc::protocol::OperationResult;

use crate::error::{CommandError, CommandResult};
use crate::hosts::HostsFile;

pub const DEFAULT_DNS_BLOCK_SECS: f64 = 30.0;
pub const DEFAULT_BLINK_WORK_SECS: f64 = 30.0;
pub const DEFAULT_BLINK_STEP_SECS: f64 = 1.0;

/// Turns adapters up and down. The system implementation shells out to the
/// platform's network tools.
pub trait AdapterControl: Send + Sync {
    /// Adapter names, loopback excluded.
    fn list(&self) -> CommandResult<Vec<String>>;

    /// `true` when the platform command exited zero.
    fn set_state(&self, adapter: &str, up: bool) -> bool;

    /// Apply `up` to every adapter.
    fn set_all(&self, up: bool) -> bool {
        match self.list() {
            Ok(adapters) => adapters
                .iter()
                .fold(true, |ok, adapter| self.set_state(adapter, up) && ok),
            Err(e) => {
                tracing::warn!("Failed to list adapters: {}", e);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NetworkTiming {
    /// Delay before a background action starts.
    pub grace: Duration,
}

impl Default for NetworkTiming {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
enum Tool {
    Ip(PathBuf),
    Ifconfig(PathBuf),
    Netsh,
}

/// Adapter control through `ip`, `ifconfig` or `netsh`, whichever the host
/// has.
#[derive(Debug, Clone)]
pub struct SystemAdapters {
    tool: Tool,
}

impl SystemAdapters {
    pub fn detect() -> Self {
        let tool = if cfg!(windows) {
            Tool::Netsh
        } else if let Ok(ip) = which::which("ip") {
            Tool::Ip(ip)
        } else {
            Tool::Ifconfig(which::which("ifconfig").unwrap_or_else(|_| PathBuf::from("ifconfig")))
        };
        tracing::debug!("Adapter control via {:?}", tool);
        Self { tool }
    }

    fn command(&self, adapter: &str, up: bool) -> Command {
        match &self.tool {
            Tool::Ip(bin) => {
                let mut cmd = Command::new(bin);
                cmd.args(["link", "set", "dev", adapter, if up { "up" } else { "down" }]);
                cmd
            }
            Tool::Ifconfig(bin) => {
                let mut cmd = Command::new(bin);
                cmd.args([adapter, if up { "up" } else { "down" }]);
                cmd
            }
            Tool::Netsh => {
                let mut cmd = Command::new("netsh");
                cmd.args([
                    "interface",
                    "set",
                    "interface",
                    &format!("name={}", adapter),
                    if up { "admin=enabled" } else { "admin=disabled" },
                ]);
                cmd
            }
        }
    }
}

impl AdapterControl for SystemAdapters {
    fn list(&self) -> CommandResult<Vec<String>> {
        let networks = Networks::new_with_refreshed_list();
        let mut names: Vec<String> = networks
            .iter()
            .filter(|(name, data)| {
                let loopback_addrs = !data.ip_networks().is_empty()
                    && data.ip_networks().iter().all(|n| n.addr.is_loopback());
                !(loopback_addrs || is_loopback_name(name))
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn set_state(&self, adapter: &str, up: bool) -> bool {
        run_quiet(self.command(adapter, up))
    }

    fn set_all(&self, up: bool) -> bool {
        if let Tool::Netsh = self.tool {
            let mut cmd = Command::new("wmic");
            cmd.args([
                "path",
                "win32_networkadapter",
                "where",
                "PhysicalAdapter=True",
                "call",
                if up { "enable" } else { "disable" },
            ]);
            return run_quiet(cmd);
        }

        match self.list() {
            Ok(adapters) => adapters
                .iter()
                .fold(true, |ok, adapter| self.set_state(adapter, up) && ok),
            Err(_) => false,
        }
    }
}

fn is_loopback_name(name: &str) -> bool {
    name == "lo" || name == "lo0" || name.to_ascii_lowercase().contains("loopback")
}

fn run_quiet(mut cmd: Command) -> bool {
    let status = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output();
    match status {
        Ok(out) if out.status.success() => true,
        Ok(out) => {
            tracing::warn!(
                "{:?} exited with {}: {}",
                cmd.get_program(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
            false
        }
        Err(e) => {
            tracing::warn!("Failed to run {:?}: {}", cmd.get_program(), e);
            false
        }
    }
}

pub struct NetworkInjector {
    adapters: Arc<dyn AdapterControl>,
    hosts: Arc<HostsFile>,
    timing: NetworkTiming,
}

impl NetworkInjector {
    pub fn new(adapters: Arc<dyn AdapterControl>, hosts: Arc<HostsFile>, timing: NetworkTiming) -> Self {
        Self {
            adapters,
            hosts,
            timing,
        }
    }

    pub fn system() -> Self {
        Self::new(
            Arc::new(SystemAdapters::detect()),
            Arc::new(HostsFile::system()),
            NetworkTiming::default(),
        )
    }

    pub fn list_network_adapters(&self) -> CommandResult<Vec<String>> {
        self.adapters.list()
    }

    /// Take adapters down after the grace period. With a non-zero `timeout`
    /// they come back up once it elapses.
    pub fn disable_network_adapters(
        &self,
        adapters: Vec<String>,
        timeout: Duration,
    ) -> CommandResult<OperationResult> {
        let control = Arc::clone(&self.adapters);
        let grace = self.timing.grace;
        spawn_background("havoc-net-disable", move || {
            thread::sleep(grace);
            disable_for(control.as_ref(), &adapters, timeout);
        })?;
        Ok(OperationResult::success("Network adapter is disabled"))
    }

    /// Bring adapters up now. Succeeds only if every command succeeded.
    pub fn enable_network_adapters(&self, adapters: &[String]) -> OperationResult {
        if enable(self.adapters.as_ref(), adapters) {
            OperationResult::success("Network adapter is enabled")
        } else {
            OperationResult::error("Network adapter is not enabled")
        }
    }

    /// Flap adapters: down for `disable_timeout`, up for `enable_timeout`,
    /// until `work_time` has passed. The final cycle may end in either state.
    pub fn blink_networking(
        &self,
        enable_timeout: Duration,
        disable_timeout: Duration,
        adapters: Vec<String>,
        work_time: Duration,
    ) -> CommandResult<OperationResult> {
        let control = Arc::clone(&self.adapters);
        let grace = self.timing.grace;
        spawn_background("havoc-net-blink", move || {
            thread::sleep(grace);
            let end = Instant::now() + work_time;
            let mut cycles = 0u32;
            loop {
                disable_for(control.as_ref(), &adapters, disable_timeout);
                thread::sleep(enable_timeout);
                cycles += 1;
                if Instant::now() > end {
                    break;
                }
            }
            tracing::info!("Network blinking finished after {} cycles", cycles);
        })?;
        Ok(OperationResult::success("Network blinking is started"))
    }

    /// Point `names` at localhost for `timeout`, then take the entries out.
    pub fn block_dnsname(&self, names: Vec<String>, timeout: Duration) -> CommandResult<OperationResult> {
        if names.is_empty() {
            return Err(CommandError::invalid("Specify at least one dnsname"));
        }

        let hosts = Arc::clone(&self.hosts);
        spawn_background("havoc-dns-block", move || {
            let injection = match hosts.inject(&names) {
                Ok(injection) => injection,
                Err(e) => {
                    tracing::error!("Failed to update {}: {}", hosts.path().display(), e);
                    return;
                }
            };
            thread::sleep(timeout);
            if let Err(e) = hosts.restore(&injection) {
                tracing::error!("Failed to restore {}: {}", hosts.path().display(), e);
            }
        })?;
        Ok(OperationResult::success("Redirect dnsname to localhost is started"))
    }
}

fn disable_for(control: &dyn AdapterControl, adapters: &[String], reenable_after: Duration) {
    let ok = if adapters.is_empty() {
        control.set_all(false)
    } else {
        adapters
            .iter()
            .fold(true, |ok, adapter| control.set_state(adapter, false) && ok)
    };
    tracing::info!("Disabled adapters {:?} (all ok: {})", adapters, ok);

    if !reenable_after.is_zero() {
        thread::sleep(reenable_after);
        enable(control, adapters);
    }
}

fn enable(control: &dyn AdapterControl, adapters: &[String]) -> bool {
    let ok = if adapters.is_empty() {
        control.set_all(true)
    } else {
        adapters
            .iter()
            .fold(true, |ok, adapter| control.set_state(adapter, true) && ok)
    };
    tracing::info!("Enabled adapters {:?} (all ok: {})", adapters, ok);
    ok
}

fn spawn_background<F>(name: &str, f: F) -> CommandResult<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|_| ())
        .map_err(|e| CommandError::Unexpected(format!("Failed to start {}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use havoc::protocol::Status;

    /// In-memory adapters; names in `broken` refuse to change state.
    #[derive(Default)]
    struct FakeAdapters {
        state: Mutex<HashMap<String, bool>>,
        broken: Vec<String>,
    }

    impl FakeAdapters {
        fn with(names: &[&str]) -> Self {
            Self {
                state: Mutex::new(names.iter().map(|n| (n.to_string(), true)).collect()),
                broken: Vec::new(),
            }
        }

        fn is_up(&self, name: &str) -> bool {
            self.state.lock().unwrap()[name]
        }
    }

    impl AdapterControl for FakeAdapters {
        fn list(&self) -> CommandResult<Vec<String>> {
            let mut names: Vec<String> = self.state.lock().unwrap().keys().cloned().collect();
            names.sort();
            Ok(names)
        }

        fn set_state(&self, adapter: &str, up: bool) -> bool {
            if self.broken.iter().any(|b| b == adapter) {
                return false;
            }
            match self.state.lock().unwrap().get_mut(adapter) {
                Some(s) => {
                    *s = up;
                    true
                }
                None => false,
            }
        }
    }

    fn injector(fake: Arc<FakeAdapters>, hosts: HostsFile) -> NetworkInjector {
        NetworkInjector::new(
            fake,
            Arc::new(hosts),
            NetworkTiming {
                grace: Duration::ZERO,
            },
        )
    }

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_list_network_adapters() {
        let fake = Arc::new(FakeAdapters::with(&["eth1", "eth0"]));
        let net = injector(fake, HostsFile::at("/dev/null"));
        assert_eq!(net.list_network_adapters().unwrap(), vec!["eth0", "eth1"]);
    }

    #[test]
    fn test_disable_then_enable_restores_state() {
        let fake = Arc::new(FakeAdapters::with(&["eth0", "eth1"]));
        let net = injector(Arc::clone(&fake), HostsFile::at("/dev/null"));

        let ack = net.disable_network_adapters(vec![], Duration::ZERO).unwrap();
        assert_eq!(ack.message, "Network adapter is disabled");
        assert!(wait_until(|| !fake.is_up("eth0") && !fake.is_up("eth1")));

        let first = net.enable_network_adapters(&[]);
        let second = net.enable_network_adapters(&[]);
        assert_eq!(first.status, Status::Success);
        assert_eq!(second.status, Status::Success);
        assert!(fake.is_up("eth0") && fake.is_up("eth1"));
    }

    #[test]
    fn test_disable_with_timeout_reenables() {
        let fake = Arc::new(FakeAdapters::with(&["eth0", "eth1"]));
        let net = injector(Arc::clone(&fake), HostsFile::at("/dev/null"));

        net.disable_network_adapters(vec!["eth0".to_string()], Duration::from_millis(200))
            .unwrap();
        assert!(wait_until(|| !fake.is_up("eth0")));
        assert!(fake.is_up("eth1"));
        assert!(wait_until(|| fake.is_up("eth0")));
    }

    #[test]
    fn test_enable_reports_failure() {
        let fake = Arc::new(FakeAdapters {
            broken: vec!["eth0".to_string()],
            ..FakeAdapters::with(&["eth0", "eth1"])
        });
        let net = injector(fake, HostsFile::at("/dev/null"));

        let result = net.enable_network_adapters(&["eth0".to_string(), "eth1".to_string()]);
        assert_eq!(result.status, Status::Error);
        assert_eq!(result.message, "Network adapter is not enabled");

        let unknown = net.enable_network_adapters(&["wlan9".to_string()]);
        assert_eq!(unknown.status, Status::Error);
    }

    #[test]
    fn test_blink_networking_ends_up() {
        let fake = Arc::new(FakeAdapters::with(&["eth0"]));
        let net = injector(Arc::clone(&fake), HostsFile::at("/dev/null"));

        let ack = net
            .blink_networking(
                Duration::from_millis(20),
                Duration::from_millis(20),
                vec!["eth0".to_string()],
                Duration::from_millis(100),
            )
            .unwrap();
        assert_eq!(ack.message, "Network blinking is started");

        // Every cycle re-enables before sleeping, so the adapter settles up
        thread::sleep(Duration::from_millis(400));
        assert!(fake.is_up("eth0"));
    }

    #[test]
    fn test_block_dnsname_restores_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        let original = "127.0.0.1 localhost\n";
        std::fs::write(&path, original).unwrap();

        let fake = Arc::new(FakeAdapters::default());
        let net = injector(fake, HostsFile::at(&path));

        let ack = net
            .block_dnsname(vec!["x.test".to_string()], Duration::from_millis(500))
            .unwrap();
        assert_eq!(ack.message, "Redirect dnsname to localhost is started");

        let read = || std::fs::read_to_string(&path).unwrap();
        assert!(wait_until(|| read().contains("127.0.0.1    x.test")));
        assert!(wait_until(|| read() == original));
    }

    #[test]
    fn test_block_dnsname_requires_names() {
        let net = injector(Arc::new(FakeAdapters::default()), HostsFile::at("/dev/null"));
        assert!(matches!(
            net.block_dnsname(vec![], Duration::ZERO),
            Err(CommandError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_loopback_names() {
        assert!(is_loopback_name("lo"));
        assert!(is_loopback_name("Loopback Pseudo-Interface 1"));
        assert!(!is_loopback_name("eth0"));
    }
}
