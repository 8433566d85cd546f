use crate::config::{Readiness, ServiceSpec, StartupConfig};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Initial delay between readiness probes
const PROBE_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
/// Cap on the delay between readiness probes
const PROBE_MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Establishes forwarding channels.
///
/// `spawn` must start a process that listens on the service's local port and
/// forwards to its remote target. Failure to start is reported synchronously.
pub trait Forwarder: Send + Sync {
    fn spawn(&self, service: &ServiceSpec) -> std::io::Result<Child>;
}

/// Forwards through `kubectl port-forward`
#[derive(Debug, Clone)]
pub struct KubectlForwarder {
    program: String,
}

impl KubectlForwarder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(service: &ServiceSpec) -> Vec<String> {
        vec![
            "port-forward".to_string(),
            "--namespace".to_string(),
            service.namespace.clone(),
            service.target.clone(),
            format!("{}:{}", service.local_port, service.port),
        ]
    }
}

impl Default for KubectlForwarder {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl Forwarder for KubectlForwarder {
    fn spawn(&self, service: &ServiceSpec) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(Self::args(service));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd.spawn()
    }
}

/// One running forwarding process
pub struct ForwardingHandle {
    hostname: String,
    child: Child,
}

impl ForwardingHandle {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// SIGTERM, wait up to `grace_period`, then SIGKILL
    async fn terminate(mut self, grace_period: Duration) {
        let hostname = self.hostname.as_str();

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(hostname, ?status, "Forwarding process already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(hostname, error = %e, "Failed to query forwarding process");
            }
        }

        if let Some(pid) = self.child.id() {
            debug!(hostname, pid, "Sending SIGTERM to forwarding process");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = self.child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(hostname, ?status, "Forwarding process exited");
            }
            Ok(Err(e)) => {
                warn!(hostname, error = %e, "Error waiting for forwarding process to exit");
            }
            Err(_) => {
                warn!(
                    hostname,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, killing forwarding process"
                );
                if let Err(e) = self.child.kill().await {
                    warn!(hostname, error = %e, "Failed to kill forwarding process");
                }
            }
        }
    }
}

/// Owns every forwarding process started for this run.
///
/// Handles are registered under a mutex. `shutdown` runs at most once: the
/// first caller flips an atomic flag and drains the registry, and any start
/// racing with it kills its own freshly spawned child instead of registering.
pub struct ForwardingSupervisor {
    forwarder: Box<dyn Forwarder>,
    handles: Mutex<Vec<ForwardingHandle>>,
    shut_down: AtomicBool,
    grace_period: Duration,
}

impl ForwardingSupervisor {
    pub fn new(forwarder: impl Forwarder + 'static, grace_period: Duration) -> Self {
        Self {
            forwarder: Box::new(forwarder),
            handles: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            grace_period,
        }
    }

    /// Start one forwarding channel per service, in order. Stops at the first
    /// failure; channels already started stay registered for `shutdown`.
    pub fn start_all(&self, services: &[ServiceSpec]) -> Result<usize> {
        for service in services {
            self.start(service)?;
        }
        debug!(hostnames = ?self.hostnames(), "Forwarding channels tracked");
        Ok(services.len())
    }

    fn start(&self, service: &ServiceSpec) -> Result<()> {
        let hostname = service.name.clone();

        if self.is_shut_down() {
            return Err(Error::ShutdownInProgress { hostname });
        }

        info!(
            hostname = %hostname,
            target = %service.target,
            namespace = %service.namespace,
            local_port = service.local_port,
            remote_port = service.port,
            "Starting forwarding channel"
        );

        let mut child = self
            .forwarder
            .spawn(service)
            .map_err(|source| Error::ForwardingSpawn {
                hostname: hostname.clone(),
                source,
            })?;

        stream_output(&hostname, &mut child);

        let mut handles = self.handles.lock();
        if self.is_shut_down() {
            drop(handles);
            warn!(hostname = %hostname, "Shutdown began during startup, stopping new forwarding process");
            let name = hostname.clone();
            tokio::spawn(async move {
                if let Err(e) = child.kill().await {
                    warn!(hostname = %name, error = %e, "Failed to kill forwarding process");
                }
            });
            return Err(Error::ShutdownInProgress { hostname });
        }

        debug!(hostname = %hostname, pid = child.id().unwrap_or(0), "Forwarding process spawned");
        handles.push(ForwardingHandle { hostname, child });
        Ok(())
    }

    /// Terminate every tracked process. Only the first call does anything;
    /// it returns how many handles it terminated.
    pub async fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Forwarding supervisor already shut down");
            return 0;
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        let count = handles.len();
        info!(count, "Stopping forwarding channels");

        let mut tasks = JoinSet::new();
        for handle in handles {
            tasks.spawn(handle.terminate(self.grace_period));
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Forwarding process termination task failed");
            }
        }

        count
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Number of currently tracked forwarding processes
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.handles.lock().iter().map(|h| h.hostname().to_string()).collect()
    }
}

/// Relay a child's stdout/stderr lines into the log
fn stream_output(hostname: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(relay_lines(hostname.to_string(), stdout, false));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(relay_lines(hostname.to_string(), stderr, true));
    }
}

async fn relay_lines<R: AsyncRead + Unpin>(hostname: String, reader: R, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!(hostname = %hostname, "{}", line);
        } else {
            debug!(hostname = %hostname, "{}", line);
        }
    }
}

/// Wait until forwarding channels can be expected to accept connections.
pub async fn wait_ready(services: &[ServiceSpec], startup: &StartupConfig) {
    match startup.readiness {
        Readiness::Settle => {
            let delay = startup.settle_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Waiting for forwarding channels to settle");
            tokio::time::sleep(delay).await;
        }
        Readiness::Probe => {
            let addrs: Vec<String> = services.iter().map(ServiceSpec::local_authority).collect();
            let pending = probe_ready(&addrs, startup.probe_timeout()).await;
            if pending.is_empty() {
                info!(count = addrs.len(), "All forwarding channels accepting connections");
            } else {
                warn!(
                    addrs = ?pending,
                    timeout_secs = startup.probe_timeout().as_secs(),
                    "Forwarding channels not ready before deadline, serving anyway"
                );
            }
        }
    }
}

/// Poll each address with a TCP connect until it succeeds or `timeout`
/// elapses. Returns the addresses that never accepted.
pub async fn probe_ready(addrs: &[String], timeout: Duration) -> Vec<String> {
    let deadline = Instant::now() + timeout;
    let mut pending: Vec<String> = addrs.to_vec();
    let mut backoff = PROBE_INITIAL_BACKOFF;

    loop {
        let mut still_pending = Vec::new();
        for addr in pending {
            match tokio::time::timeout(PROBE_MAX_BACKOFF, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(_)) => debug!(addr = %addr, "Forwarding channel is accepting connections"),
                _ => still_pending.push(addr),
            }
        }
        pending = still_pending;

        let now = Instant::now();
        if pending.is_empty() || now >= deadline {
            return pending;
        }

        tokio::time::sleep(backoff.min(deadline - now)).await;
        backoff = (backoff * 2).min(PROBE_MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Weak};

    /// Starts `sleep 60` for every service, optionally failing the nth spawn
    struct SleepForwarder {
        fail_at: Option<usize>,
        spawned: Arc<AtomicUsize>,
    }

    impl SleepForwarder {
        fn new() -> Self {
            Self {
                fail_at: None,
                spawned: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing_at(index: usize) -> Self {
            Self {
                fail_at: Some(index),
                spawned: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Forwarder for SleepForwarder {
        fn spawn(&self, _service: &ServiceSpec) -> std::io::Result<Child> {
            let index = self.spawned.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(index) {
                return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such program"));
            }
            let mut cmd = Command::new("sleep");
            cmd.arg("60").kill_on_drop(true);
            cmd.spawn()
        }
    }

    fn services(count: usize) -> Vec<ServiceSpec> {
        (0..count)
            .map(|i| {
                let mut spec = ServiceSpec::new(&format!("svc{}", i), &format!("svc/svc{}", i), 80);
                spec.apply_defaults(i);
                spec
            })
            .collect()
    }

    #[test]
    fn test_kubectl_args() {
        let mut spec = ServiceSpec::new("api", "svc/api", 8080);
        spec.namespace = "backend".to_string();
        spec.apply_defaults(2);

        assert_eq!(
            KubectlForwarder::args(&spec),
            vec!["port-forward", "--namespace", "backend", "svc/api", "1502:8080"]
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let supervisor = ForwardingSupervisor::new(
            KubectlForwarder::new("/nonexistent/portgate-kubectl"),
            Duration::from_secs(1),
        );

        let err = supervisor.start_all(&services(1)).unwrap_err();
        assert!(matches!(err, Error::ForwardingSpawn { .. }));
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_start_all_and_shutdown() {
        let supervisor = ForwardingSupervisor::new(SleepForwarder::new(), Duration::from_secs(1));

        assert_eq!(supervisor.start_all(&services(3)).unwrap(), 3);
        assert_eq!(supervisor.len(), 3);
        assert_eq!(
            supervisor.hostnames(),
            vec!["svc0.local", "svc1.local", "svc2.local"]
        );

        assert_eq!(supervisor.shutdown().await, 3);
        assert!(supervisor.is_empty());
        assert!(supervisor.is_shut_down());
    }

    #[tokio::test]
    async fn test_partial_start_leaves_started_handles_for_teardown() {
        let supervisor =
            ForwardingSupervisor::new(SleepForwarder::failing_at(2), Duration::from_secs(1));

        let err = supervisor.start_all(&services(4)).unwrap_err();
        match err {
            Error::ForwardingSpawn { hostname, .. } => assert_eq!(hostname, "svc2.local"),
            other => panic!("unexpected error: {}", other),
        }

        // Nothing past the failing service was started
        assert_eq!(supervisor.len(), 2);
        assert_eq!(supervisor.shutdown().await, 2);
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let supervisor = ForwardingSupervisor::new(SleepForwarder::new(), Duration::from_secs(1));
        supervisor.start_all(&services(2)).unwrap();

        let (a, b) = tokio::join!(supervisor.shutdown(), supervisor.shutdown());
        assert_eq!(a + b, 2);
        assert!(a == 0 || b == 0);

        assert_eq!(supervisor.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_start_after_shutdown_is_refused() {
        let forwarder = SleepForwarder::new();
        let spawned = Arc::clone(&forwarder.spawned);
        let supervisor = ForwardingSupervisor::new(forwarder, Duration::from_secs(1));

        assert_eq!(supervisor.shutdown().await, 0);

        let err = supervisor.start_all(&services(2)).unwrap_err();
        assert!(matches!(err, Error::ShutdownInProgress { .. }));
        assert_eq!(spawned.load(Ordering::SeqCst), 0);
        assert!(supervisor.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_spawned_during_shutdown_is_reaped() {
        /// Marks its supervisor shut down while the process is being spawned
        struct RacingForwarder {
            supervisor: Arc<Mutex<Weak<ForwardingSupervisor>>>,
            pid: Arc<Mutex<Option<u32>>>,
        }

        impl Forwarder for RacingForwarder {
            fn spawn(&self, _service: &ServiceSpec) -> std::io::Result<Child> {
                let child = Command::new("sleep").arg("60").spawn()?;
                *self.pid.lock() = child.id();
                if let Some(supervisor) = self.supervisor.lock().upgrade() {
                    supervisor.shut_down.store(true, Ordering::SeqCst);
                }
                Ok(child)
            }
        }

        let slot = Arc::new(Mutex::new(Weak::new()));
        let pid = Arc::new(Mutex::new(None));
        let supervisor = Arc::new(ForwardingSupervisor::new(
            RacingForwarder {
                supervisor: Arc::clone(&slot),
                pid: Arc::clone(&pid),
            },
            Duration::from_secs(1),
        ));
        *slot.lock() = Arc::downgrade(&supervisor);

        let err = supervisor.start_all(&services(1)).unwrap_err();
        assert!(matches!(err, Error::ShutdownInProgress { .. }));
        assert!(supervisor.is_empty());

        let pid = (*pid.lock()).expect("process was spawned") as libc::pid_t;
        let deadline = Instant::now() + Duration::from_secs(5);
        // Succeeds for as long as the process, or its zombie, exists
        while unsafe { libc::kill(pid, 0) } == 0 {
            assert!(Instant::now() < deadline, "forwarding process was not reaped");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_shutdown_tolerates_exited_process() {
        struct TrueForwarder;
        impl Forwarder for TrueForwarder {
            fn spawn(&self, _service: &ServiceSpec) -> std::io::Result<Child> {
                Command::new("true").spawn()
            }
        }

        let supervisor = ForwardingSupervisor::new(TrueForwarder, Duration::from_secs(1));
        supervisor.start_all(&services(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(supervisor.shutdown().await, 1);
    }

    #[tokio::test]
    async fn test_probe_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().to_string();

        let closed = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().to_string()
        };

        let pending = probe_ready(&[open.clone(), closed.clone()], Duration::from_millis(300)).await;
        assert_eq!(pending, vec![closed]);

        let pending = probe_ready(&[open], Duration::from_millis(300)).await;
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_probe_waits_for_late_listener() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let addr = format!("127.0.0.1:{}", port);

        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(listener);
        });

        let pending = probe_ready(&[addr], Duration::from_secs(2)).await;
        assert!(pending.is_empty());
        late.abort();
    }
}
