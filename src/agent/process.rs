//! Process control for the havoc-agent.
//!
//! Lists, kills, suspends and resumes local processes selected by PID or by
//! glob-matched name. Every mutating call observes the process before acting
//! and polls it afterwards, so a transition caused by someone else is not
//! reported as our own.

use std::collections::{BTreeMap, HashSet};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{
    Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, ThreadKind, UpdateKind,
};

use crate::error::{CommandError, CommandResult};

/// Polling cadence and convergence deadlines for mutating operations.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub kill_timeout: Duration,
    pub suspend_timeout: Duration,
    /// Resuming is near-instant, so this one is short.
    pub resume_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            kill_timeout: Duration::from_secs(60),
            suspend_timeout: Duration::from_secs(60),
            resume_timeout: Duration::from_secs(10),
        }
    }
}

/// Scheduler state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Sleeping,
    Stopped,
    Zombie,
    Idle,
    Dead,
    Other,
}

impl ProcessState {
    /// Counts as resumed.
    fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Sleeping | Self::Idle)
    }

    /// Counts as gone for kill convergence.
    fn is_defunct(self) -> bool {
        matches!(self, Self::Zombie | Self::Dead)
    }
}

impl From<ProcessStatus> for ProcessState {
    fn from(status: ProcessStatus) -> Self {
        match status {
            ProcessStatus::Run => Self::Running,
            ProcessStatus::Sleep | ProcessStatus::UninterruptibleDiskSleep => Self::Sleeping,
            ProcessStatus::Stop | ProcessStatus::Tracing => Self::Stopped,
            ProcessStatus::Zombie => Self::Zombie,
            ProcessStatus::Idle => Self::Idle,
            ProcessStatus::Dead => Self::Dead,
            _ => Self::Other,
        }
    }
}

/// A process as reported by `get_process`.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub status: ProcessState,
    #[serde(rename = "cmd")]
    pub command_line: String,
    #[serde(rename = "node")]
    pub node_id: String,
    pub endpoint: String,
    /// Only sampled for scoped queries.
    #[serde(rename = "cpu", skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
    #[serde(rename = "ram", skip_serializing_if = "Option::is_none")]
    pub ram_kb: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Present,
    NotFound,
    Killed,
    NotKilled,
    KilledByAnotherProcess,
    Stopped,
    WasStopped,
    StoppedByAnotherProcess,
    NotStopped,
    Resumed,
    WasResumed,
    ResumedByAnotherProcess,
    NotResumed,
}

/// Result for one requested PID or name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    pub pid: Option<u32>,
    pub name: Option<String>,
    pub status: OutcomeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Kill,
    Stop,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    NoSuchProcess,
    Os(String),
}

/// Per-PID observation and signalling used by the mutating operations.
pub trait ProcessProbe: Send + Sync {
    /// Current state of `pid`, `None` when it no longer exists.
    fn state(&self, pid: u32) -> Option<ProcessState>;

    fn signal(&self, pid: u32, action: Action) -> Result<(), SignalError>;
}

/// The real process table.
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn state(&self, pid: u32) -> Option<ProcessState> {
        probe(pid)
    }

    fn signal(&self, pid: u32, action: Action) -> Result<(), SignalError> {
        send_signal(pid, action)
    }
}

/// Lightweight view of a process used while resolving selectors.
#[derive(Debug, Clone)]
struct ProcessEntry {
    pid: u32,
    name: String,
    command_line: String,
    status: ProcessState,
    cpu_usage: f32,
    memory: u64,
}

pub struct ProcessController {
    policy: PollPolicy,
    probe: Arc<dyn ProcessProbe>,
    own_pid: u32,
    node_id: String,
    endpoint: String,
}

impl ProcessController {
    pub fn new(policy: PollPolicy) -> Self {
        Self::with_probe(policy, Arc::new(SystemProbe))
    }

    pub fn with_probe(policy: PollPolicy, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            policy,
            probe,
            own_pid: std::process::id(),
            node_id: machine_id(),
            endpoint: local_endpoint(),
        }
    }

    /// Processes selected by PID and/or name; every process when unscoped.
    ///
    /// Unknown PIDs and unmatched names are dropped silently here, unlike
    /// the mutating operations which report them as `not_found`.
    pub fn get_process(&self, pids: &[u32], names: &[String]) -> CommandResult<Vec<ProcessRecord>> {
        let scoped = !pids.is_empty() || !names.is_empty();
        let entries = self.snapshot(scoped);

        if !scoped {
            return Ok(entries.into_iter().map(|e| self.record(e, false)).collect());
        }

        let matchers = compile_globs(names)?;
        let wanted: HashSet<u32> = pids.iter().copied().collect();
        let cores = num_cores() as f32;

        // BTreeMap keeps the PID order and drops duplicates
        let mut selected = BTreeMap::new();
        for entry in entries {
            let by_pid = wanted.contains(&entry.pid);
            let by_name = entry.pid != self.own_pid
                && matchers.iter().any(|(_, m)| m.matches_process(&entry));
            if by_pid || by_name {
                let mut entry = entry;
                entry.cpu_usage /= cores;
                selected.insert(entry.pid, entry);
            }
        }

        Ok(selected.into_values().map(|e| self.record(e, true)).collect())
    }

    /// Every process on the host.
    pub fn list_process(&self) -> Vec<ProcessRecord> {
        self.snapshot(false)
            .into_iter()
            .map(|e| self.record(e, false))
            .collect()
    }

    pub fn kill_process(&self, pids: &[u32], names: &[String]) -> CommandResult<Vec<ProcessOutcome>> {
        let mut outcomes = self.resolve(pids, names)?;

        for outcome in outcomes.iter_mut().filter(|o| o.status == OutcomeStatus::Present) {
            let Some(pid) = outcome.pid else { continue };
            outcome.status = self.kill_one(pid);
            tracing::info!("kill pid={} -> {:?}", pid, outcome.status);
        }

        Ok(outcomes)
    }

    pub fn suspend_process(&self, pids: &[u32], names: &[String]) -> CommandResult<Vec<ProcessOutcome>> {
        let mut outcomes = self.resolve(pids, names)?;

        // Already stopped before we did anything
        for outcome in outcomes.iter_mut().filter(|o| o.status == OutcomeStatus::Present) {
            if let Some(ProcessState::Stopped) = outcome.pid.and_then(|p| self.probe.state(p)) {
                outcome.status = OutcomeStatus::WasStopped;
            }
        }

        for outcome in outcomes.iter_mut().filter(|o| o.status == OutcomeStatus::Present) {
            let Some(pid) = outcome.pid else { continue };
            outcome.status = self.suspend_one(pid);
            tracing::info!("suspend pid={} -> {:?}", pid, outcome.status);
        }

        Ok(outcomes)
    }

    pub fn resume_process(&self, pids: &[u32], names: &[String]) -> CommandResult<Vec<ProcessOutcome>> {
        let mut outcomes = self.resolve(pids, names)?;

        for outcome in outcomes.iter_mut().filter(|o| o.status == OutcomeStatus::Present) {
            let state = outcome.pid.and_then(|p| self.probe.state(p));
            if state.is_some_and(ProcessState::is_active) {
                outcome.status = OutcomeStatus::WasResumed;
            }
        }

        for outcome in outcomes.iter_mut().filter(|o| o.status == OutcomeStatus::Present) {
            let Some(pid) = outcome.pid else { continue };
            outcome.status = self.resume_one(pid);
            tracing::info!("resume pid={} -> {:?}", pid, outcome.status);
        }

        Ok(outcomes)
    }

    fn kill_one(&self, pid: u32) -> OutcomeStatus {
        if self.probe.state(pid).map_or(true, ProcessState::is_defunct) {
            return OutcomeStatus::KilledByAnotherProcess;
        }

        match self.probe.signal(pid, Action::Kill) {
            Ok(()) => {}
            Err(SignalError::NoSuchProcess) => return OutcomeStatus::KilledByAnotherProcess,
            Err(SignalError::Os(e)) => {
                tracing::warn!("Failed to kill pid {}: {}", pid, e);
                return OutcomeStatus::NotKilled;
            }
        }

        let gone = self.converge(pid, self.policy.kill_timeout, |state| {
            state.map_or(true, ProcessState::is_defunct)
        });
        if gone {
            OutcomeStatus::Killed
        } else {
            OutcomeStatus::NotKilled
        }
    }

    fn suspend_one(&self, pid: u32) -> OutcomeStatus {
        match self.probe.state(pid) {
            None => return OutcomeStatus::KilledByAnotherProcess,
            Some(ProcessState::Stopped) => return OutcomeStatus::StoppedByAnotherProcess,
            Some(_) => {}
        }

        match self.probe.signal(pid, Action::Stop) {
            Ok(()) => {}
            Err(SignalError::NoSuchProcess) => return OutcomeStatus::KilledByAnotherProcess,
            Err(SignalError::Os(e)) => {
                tracing::warn!("Failed to suspend pid {}: {}", pid, e);
                return OutcomeStatus::NotStopped;
            }
        }

        let mut vanished = false;
        let stopped = self.converge(pid, self.policy.suspend_timeout, |state| match state {
            None => {
                vanished = true;
                true
            }
            Some(s) => s == ProcessState::Stopped,
        });

        match (vanished, stopped) {
            (true, _) => OutcomeStatus::KilledByAnotherProcess,
            (false, true) => OutcomeStatus::Stopped,
            (false, false) => OutcomeStatus::NotStopped,
        }
    }

    fn resume_one(&self, pid: u32) -> OutcomeStatus {
        match self.probe.state(pid) {
            None => return OutcomeStatus::KilledByAnotherProcess,
            Some(s) if s.is_active() => return OutcomeStatus::ResumedByAnotherProcess,
            Some(_) => {}
        }

        match self.probe.signal(pid, Action::Continue) {
            Ok(()) => {}
            Err(SignalError::NoSuchProcess) => return OutcomeStatus::KilledByAnotherProcess,
            Err(SignalError::Os(e)) => {
                tracing::warn!("Failed to resume pid {}: {}", pid, e);
                return OutcomeStatus::NotResumed;
            }
        }

        let mut vanished = false;
        let resumed = self.converge(pid, self.policy.resume_timeout, |state| match state {
            None => {
                vanished = true;
                true
            }
            Some(s) => s.is_active(),
        });

        match (vanished, resumed) {
            (true, _) => OutcomeStatus::KilledByAnotherProcess,
            (false, true) => OutcomeStatus::Resumed,
            (false, false) => OutcomeStatus::NotResumed,
        }
    }

    /// Poll `pid` until `done` holds or `timeout` elapses.
    fn converge<F>(&self, pid: u32, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(Option<ProcessState>) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if done(self.probe.state(pid)) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.policy.interval);
        }
    }

    /// Turn selectors into one `present`/`not_found` outcome per target,
    /// deduplicated and sorted by PID.
    fn resolve(&self, pids: &[u32], names: &[String]) -> CommandResult<Vec<ProcessOutcome>> {
        if pids.is_empty() && names.is_empty() {
            return Err(CommandError::invalid("Specify at least one pid or name"));
        }

        let local: Vec<ProcessEntry> = self
            .snapshot(false)
            .into_iter()
            .filter(|e| e.pid != self.own_pid)
            .collect();

        let mut outcomes = Vec::new();
        let mut targets: Vec<u32> = pids.to_vec();

        for (name, glob) in compile_globs(names)? {
            let matched: Vec<u32> = local
                .iter()
                .filter(|e| glob.matches_process(e))
                .map(|e| e.pid)
                .collect();
            if matched.is_empty() {
                outcomes.push(ProcessOutcome {
                    pid: None,
                    name: Some(name),
                    status: OutcomeStatus::NotFound,
                });
            }
            targets.extend(matched);
        }

        let mut seen = HashSet::new();
        for pid in targets {
            if !seen.insert(pid) {
                continue;
            }
            let outcome = match local.iter().find(|e| e.pid == pid) {
                Some(entry) => ProcessOutcome {
                    pid: Some(pid),
                    name: Some(entry.name.clone()),
                    status: OutcomeStatus::Present,
                },
                None => ProcessOutcome {
                    pid: Some(pid),
                    name: None,
                    status: OutcomeStatus::NotFound,
                },
            };
            outcomes.push(outcome);
        }

        // Unmatched names (no PID) sort first
        outcomes.sort_by_key(|o| o.pid);
        Ok(outcomes)
    }

    fn snapshot(&self, with_usage: bool) -> Vec<ProcessEntry> {
        let mut kind = ProcessRefreshKind::nothing().with_cmd(UpdateKind::OnlyIfNotSet);
        if with_usage {
            kind = kind.with_cpu().with_memory();
        }

        let mut sys = System::new();
        sys.refresh_processes_specifics(ProcessesToUpdate::All, true, kind);
        if with_usage {
            // CPU usage needs two samples
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            sys.refresh_processes_specifics(ProcessesToUpdate::All, true, kind);
        }

        let mut entries: Vec<ProcessEntry> = sys
            .processes()
            .values()
            // Userland threads show up as processes on Linux; kernel tasks stay
            .filter(|p| !matches!(p.thread_kind(), Some(ThreadKind::Userland)))
            .map(|p| ProcessEntry {
                pid: p.pid().as_u32(),
                name: p.name().to_string_lossy().into_owned(),
                command_line: p
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" "),
                status: p.status().into(),
                cpu_usage: p.cpu_usage(),
                memory: p.memory(),
            })
            .collect();
        entries.sort_by_key(|e| e.pid);
        entries
    }

    fn record(&self, entry: ProcessEntry, with_usage: bool) -> ProcessRecord {
        ProcessRecord {
            pid: entry.pid,
            name: entry.name,
            status: entry.status,
            command_line: entry.command_line,
            node_id: self.node_id.clone(),
            endpoint: self.endpoint.clone(),
            cpu_percent: with_usage.then_some(entry.cpu_usage),
            ram_kb: with_usage.then_some(entry.memory / 1024),
        }
    }
}

fn probe(pid: u32) -> Option<ProcessState> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    sys.process(pid).map(|p| p.status().into())
}

#[cfg(unix)]
fn send_signal(pid: u32, action: Action) -> Result<(), SignalError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    let signal = match action {
        Action::Kill => Signal::SIGKILL,
        Action::Stop => Signal::SIGSTOP,
        Action::Continue => Signal::SIGCONT,
    };
    let raw = i32::try_from(pid).map_err(|_| SignalError::NoSuchProcess)?;

    kill(nix::unistd::Pid::from_raw(raw), signal).map_err(|e| match e {
        Errno::ESRCH => SignalError::NoSuchProcess,
        other => SignalError::Os(other.desc().to_string()),
    })
}

#[cfg(not(unix))]
fn send_signal(pid: u32, action: Action) -> Result<(), SignalError> {
    let signal = match action {
        Action::Kill => sysinfo::Signal::Kill,
        Action::Stop => sysinfo::Signal::Stop,
        Action::Continue => sysinfo::Signal::Continue,
    };
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let process = sys.process(pid).ok_or(SignalError::NoSuchProcess)?;

    match process.kill_with(signal) {
        Some(true) => Ok(()),
        Some(false) => Err(SignalError::Os(format!("signal {:?} failed", signal))),
        None => Err(SignalError::Os(format!(
            "signal {:?} is not supported on this platform",
            signal
        ))),
    }
}

/// fnmatch-style pattern: `*`, `?` and `[...]` classes.
#[derive(Debug)]
pub struct Glob(regex_lite::Regex);

impl Glob {
    pub fn new(pattern: &str) -> CommandResult<Self> {
        let mut re = String::with_capacity(pattern.len() + 8);
        re.push('^');
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                '[' => {
                    let mut class = String::new();
                    let mut closed = false;
                    if chars.peek() == Some(&'!') {
                        chars.next();
                        class.push('^');
                    }
                    for c in chars.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        if c == '\\' || c == '[' {
                            class.push('\\');
                        }
                        class.push(c);
                    }
                    if closed {
                        re.push('[');
                        re.push_str(&class);
                        re.push(']');
                    } else {
                        // Unterminated class matches literally
                        re.push_str(&regex_lite::escape("["));
                        re.push_str(&regex_lite::escape(class.trim_start_matches('^')));
                    }
                }
                other => re.push_str(&regex_lite::escape(&other.to_string())),
            }
        }
        re.push('$');

        regex_lite::Regex::new(&re)
            .map(Self)
            .map_err(|e| CommandError::invalid(format!("Bad name pattern '{}': {}", pattern, e)))
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }

    fn matches_process(&self, entry: &ProcessEntry) -> bool {
        self.is_match(&entry.name) || self.is_match(&entry.command_line)
    }
}

/// Compile each distinct pattern once, keeping first-seen order.
fn compile_globs(names: &[String]) -> CommandResult<Vec<(String, Glob)>> {
    let mut seen = HashSet::new();
    names
        .iter()
        .filter(|n| seen.insert(n.as_str()))
        .map(|n| Glob::new(n).map(|g| (n.clone(), g)))
        .collect()
}

fn num_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Stable identifier of this machine.
fn machine_id() -> String {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(System::host_name)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Address this host's name resolves to, falling back to localhost.
fn local_endpoint() -> String {
    System::host_name()
        .and_then(|host| (host.as_str(), 0).to_socket_addrs().ok())
        .and_then(|mut addrs| addrs.find(|a| a.is_ipv4()))
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use OutcomeStatus::*;
    use ProcessState as S;

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(50),
            kill_timeout: Duration::from_secs(5),
            suspend_timeout: Duration::from_secs(5),
            resume_timeout: Duration::from_secs(5),
        }
    }

    /// Spawn a long sleep and reap it in the background so a kill leaves no
    /// zombie behind.
    #[cfg(unix)]
    fn spawn_sleeper() -> u32 {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        pid
    }

    const UNUSED_PID: u32 = 999_999_999;

    /// Replays a fixed sequence of states, repeating the last one.
    struct ScriptedProbe {
        states: Mutex<VecDeque<Option<ProcessState>>>,
        reply: Result<(), SignalError>,
        sent: Mutex<Vec<Action>>,
    }

    impl ProcessProbe for ScriptedProbe {
        fn state(&self, _pid: u32) -> Option<ProcessState> {
            let mut states = self.states.lock().unwrap();
            if states.len() > 1 {
                states.pop_front().flatten()
            } else {
                states.front().copied().flatten()
            }
        }

        fn signal(&self, _pid: u32, action: Action) -> Result<(), SignalError> {
            self.sent.lock().unwrap().push(action);
            self.reply.clone()
        }
    }

    fn scripted(
        states: &[Option<ProcessState>],
        reply: Result<(), SignalError>,
    ) -> (ProcessController, Arc<ScriptedProbe>) {
        let probe = Arc::new(ScriptedProbe {
            states: Mutex::new(states.iter().copied().collect()),
            reply,
            sent: Mutex::new(Vec::new()),
        });
        let policy = PollPolicy {
            interval: Duration::from_millis(5),
            kill_timeout: Duration::from_millis(50),
            suspend_timeout: Duration::from_millis(50),
            resume_timeout: Duration::from_millis(50),
        };
        (ProcessController::with_probe(policy, probe.clone()), probe)
    }

    fn os_error() -> Result<(), SignalError> {
        Err(SignalError::Os("Operation not permitted".to_string()))
    }

    #[test]
    fn test_glob_matching() {
        assert!(Glob::new("fire*").unwrap().is_match("firefox"));
        assert!(Glob::new("*fox").unwrap().is_match("firefox"));
        assert!(Glob::new("f?re*").unwrap().is_match("firefox"));
        assert!(Glob::new("[ft]op").unwrap().is_match("top"));
        assert!(Glob::new("[!ft]op").unwrap().is_match("hop"));
        assert!(!Glob::new("fire").unwrap().is_match("firefox"));
        assert!(Glob::new("a.b").unwrap().is_match("a.b"));
        assert!(!Glob::new("a.b").unwrap().is_match("axb"));
        assert!(Glob::new("/usr/bin/python *").unwrap().is_match("/usr/bin/python -u x.py"));
    }

    #[test]
    fn test_glob_unterminated_class_is_literal() {
        let glob = Glob::new("ab[c").unwrap();
        assert!(glob.is_match("ab[c"));
    }

    #[test]
    fn test_mutating_ops_require_selector() {
        let controller = ProcessController::new(fast_policy());
        for result in [
            controller.kill_process(&[], &[]),
            controller.suspend_process(&[], &[]),
            controller.resume_process(&[], &[]),
        ] {
            assert!(matches!(result, Err(CommandError::InvalidArgument(_))));
        }
    }

    #[test]
    fn test_list_process_is_not_empty() {
        let controller = ProcessController::new(fast_policy());
        let all = controller.list_process();
        assert!(!all.is_empty());
        assert!(all.iter().all(|p| p.cpu_percent.is_none() && p.ram_kb.is_none()));
        assert!(all.windows(2).all(|w| w[0].pid < w[1].pid));
    }

    #[cfg(unix)]
    #[test]
    fn test_get_process_drops_unknown_pid() {
        let controller = ProcessController::new(fast_policy());
        let parent = std::os::unix::process::parent_id();

        let records = controller.get_process(&[parent, UNUSED_PID], &[]).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, parent);
        assert!(records[0].cpu_percent.is_some());
        assert!(records[0].ram_kb.is_some());
    }

    #[test]
    fn test_get_process_unmatched_name_is_empty() {
        let controller = ProcessController::new(fast_policy());
        let records = controller
            .get_process(&[], &["no-such-process-*-havoc-test".to_string()])
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_kill_reports_not_found() {
        let controller = ProcessController::new(fast_policy());
        let outcomes = controller
            .kill_process(&[UNUSED_PID], &["no-such-process-havoc-test".to_string()])
            .unwrap();

        assert_eq!(
            outcomes,
            vec![
                ProcessOutcome {
                    pid: None,
                    name: Some("no-such-process-havoc-test".to_string()),
                    status: OutcomeStatus::NotFound,
                },
                ProcessOutcome {
                    pid: Some(UNUSED_PID),
                    name: None,
                    status: OutcomeStatus::NotFound,
                },
            ]
        );
    }

    #[test]
    fn test_own_process_is_never_a_target() {
        let controller = ProcessController::new(fast_policy());
        let outcomes = controller.kill_process(&[std::process::id()], &[]).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, OutcomeStatus::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_process_by_pid() {
        let controller = ProcessController::new(fast_policy());
        let pid = spawn_sleeper();

        let outcomes = controller.kill_process(&[pid, pid], &[]).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].pid, Some(pid));
        assert_eq!(outcomes[0].name.as_deref(), Some("sleep"));
        assert_eq!(outcomes[0].status, OutcomeStatus::Killed);
    }

    #[cfg(unix)]
    #[test]
    fn test_suspend_then_resume() {
        let controller = ProcessController::new(fast_policy());
        let pid = spawn_sleeper();

        let suspended = controller.suspend_process(&[pid], &[]).unwrap();
        assert_eq!(suspended[0].status, OutcomeStatus::Stopped);

        let again = controller.suspend_process(&[pid], &[]).unwrap();
        assert_eq!(again[0].status, OutcomeStatus::WasStopped);

        let resumed = controller.resume_process(&[pid], &[]).unwrap();
        assert_eq!(resumed[0].status, OutcomeStatus::Resumed);

        let again = controller.resume_process(&[pid], &[]).unwrap();
        assert_eq!(again[0].status, OutcomeStatus::WasResumed);

        let killed = controller.kill_process(&[pid], &[]).unwrap();
        assert_eq!(killed[0].status, OutcomeStatus::Killed);
    }

    #[cfg(unix)]
    #[test]
    fn test_outcomes_sorted_by_pid() {
        let controller = ProcessController::new(fast_policy());
        let a = spawn_sleeper();
        let b = spawn_sleeper();
        let (hi, lo) = if a > b { (a, b) } else { (b, a) };

        let outcomes = controller.kill_process(&[hi, lo], &[]).unwrap();
        let pids: Vec<Option<u32>> = outcomes.iter().map(|o| o.pid).collect();
        assert_eq!(pids, vec![Some(lo), Some(hi)]);
        assert!(outcomes.iter().all(|o| o.status == OutcomeStatus::Killed));
    }

    #[test]
    fn test_kill_transitions() {
        let cases = [
            (vec![None], Ok(()), KilledByAnotherProcess, false),
            (vec![Some(S::Zombie)], Ok(()), KilledByAnotherProcess, false),
            (vec![Some(S::Sleeping)], Err(SignalError::NoSuchProcess), KilledByAnotherProcess, true),
            (vec![Some(S::Sleeping)], os_error(), NotKilled, true),
            (vec![Some(S::Sleeping), Some(S::Sleeping), None], Ok(()), Killed, true),
            (vec![Some(S::Running), Some(S::Zombie)], Ok(()), Killed, true),
            (vec![Some(S::Sleeping)], Ok(()), NotKilled, true),
        ];

        for (states, reply, expected, signalled) in cases {
            let (controller, probe) = scripted(&states, reply);
            assert_eq!(controller.kill_one(42), expected, "{:?}", states);
            let sent = probe.sent.lock().unwrap().clone();
            assert_eq!(sent == vec![Action::Kill], signalled, "{:?}", states);
        }
    }

    #[test]
    fn test_suspend_transitions() {
        let cases = [
            (vec![None], Ok(()), KilledByAnotherProcess),
            (vec![Some(S::Stopped)], Ok(()), StoppedByAnotherProcess),
            (vec![Some(S::Running)], Err(SignalError::NoSuchProcess), KilledByAnotherProcess),
            (vec![Some(S::Running)], os_error(), NotStopped),
            (vec![Some(S::Running), Some(S::Running), Some(S::Stopped)], Ok(()), Stopped),
            (vec![Some(S::Running), None], Ok(()), KilledByAnotherProcess),
            (vec![Some(S::Running)], Ok(()), NotStopped),
        ];

        for (states, reply, expected) in cases {
            let (controller, _) = scripted(&states, reply);
            assert_eq!(controller.suspend_one(42), expected, "{:?}", states);
        }
    }

    #[test]
    fn test_resume_transitions() {
        let cases = [
            (vec![None], Ok(()), KilledByAnotherProcess),
            (vec![Some(S::Sleeping)], Ok(()), ResumedByAnotherProcess),
            (vec![Some(S::Stopped)], Err(SignalError::NoSuchProcess), KilledByAnotherProcess),
            (vec![Some(S::Stopped)], os_error(), NotResumed),
            (vec![Some(S::Stopped), Some(S::Stopped), Some(S::Running)], Ok(()), Resumed),
            (vec![Some(S::Stopped), None], Ok(()), KilledByAnotherProcess),
            (vec![Some(S::Stopped)], Ok(()), NotResumed),
        ];

        for (states, reply, expected) in cases {
            let (controller, _) = scripted(&states, reply);
            assert_eq!(controller.resume_one(42), expected, "{:?}", states);
        }
    }

    /// The first observation happens before any signal, so a process that
    /// changes state between the two passes is credited to someone else.
    #[cfg(unix)]
    #[test]
    fn test_two_pass_classification() {
        let parent = std::os::unix::process::parent_id();

        let (controller, probe) = scripted(&[Some(S::Stopped)], Ok(()));
        let outcomes = controller.suspend_process(&[parent], &[]).unwrap();
        assert_eq!(outcomes[0].status, WasStopped);
        assert!(probe.sent.lock().unwrap().is_empty());

        let (controller, probe) = scripted(&[Some(S::Sleeping), Some(S::Stopped)], Ok(()));
        let outcomes = controller.suspend_process(&[parent], &[]).unwrap();
        assert_eq!(outcomes[0].status, StoppedByAnotherProcess);
        assert!(probe.sent.lock().unwrap().is_empty());

        let (controller, _) = scripted(&[Some(S::Running)], Ok(()));
        let outcomes = controller.resume_process(&[parent], &[]).unwrap();
        assert_eq!(outcomes[0].status, WasResumed);

        let (controller, _) = scripted(&[Some(S::Stopped), Some(S::Running)], Ok(()));
        let outcomes = controller.resume_process(&[parent], &[]).unwrap();
        assert_eq!(outcomes[0].status, ResumedByAnotherProcess);
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_after_external_kill() {
        let controller = ProcessController::new(fast_policy());
        let pid = spawn_sleeper();

        let resolved = controller.resolve(&[pid], &[]).unwrap();
        assert_eq!(resolved[0].status, Present);

        let raw = nix::unistd::Pid::from_raw(pid as i32);
        nix::sys::signal::kill(raw, nix::sys::signal::Signal::SIGKILL).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while probe(pid).is_some_and(|s| !s.is_defunct()) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(controller.kill_one(pid), KilledByAnotherProcess);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_kernel_tasks_are_listed() {
        // pid 2 is kthreadd on a host; in a container it may not exist at all
        let is_process = std::fs::read_to_string("/proc/2/status")
            .map(|s| s.lines().any(|l| l.split_whitespace().eq(["Tgid:", "2"])))
            .unwrap_or(false);
        if !is_process {
            return;
        }

        let controller = ProcessController::new(fast_policy());
        assert!(controller.list_process().iter().any(|p| p.pid == 2));
        let records = controller.get_process(&[2], &[]).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_get_process_unions_pids_and_names() {
        let controller = ProcessController::new(fast_policy());
        let parent = std::os::unix::process::parent_id();
        let sleeper = spawn_sleeper();

        let records = controller
            .get_process(&[parent], &["sleep".to_string()])
            .unwrap();
        let pids: Vec<u32> = records.iter().map(|r| r.pid).collect();
        assert!(pids.contains(&parent));
        assert!(pids.contains(&sleeper));
        assert!(pids.windows(2).all(|w| w[0] < w[1]));

        controller.kill_process(&[sleeper], &[]).unwrap();
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = ProcessOutcome {
            pid: None,
            name: Some("nginx".to_string()),
            status: OutcomeStatus::KilledByAnotherProcess,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["pid"], serde_json::Value::Null);
        assert_eq!(json["status"], "killed_by_another_process");
    }

    #[test]
    fn test_record_serialization_uses_wire_names() {
        let record = ProcessRecord {
            pid: 1,
            name: "init".to_string(),
            status: ProcessState::Sleeping,
            command_line: "/sbin/init".to_string(),
            node_id: "abc".to_string(),
            endpoint: "10.0.0.1".to_string(),
            cpu_percent: None,
            ram_kb: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["cmd"], "/sbin/init");
        assert_eq!(json["node"], "abc");
        assert_eq!(json["status"], "sleeping");
        assert!(json.get("cpu").is_none());
    }
}
