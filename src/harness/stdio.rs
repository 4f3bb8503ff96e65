use std::{
    ffi::OsStr,
    io,
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use serde::de::IgnoredAny;
use serde_json::{Map, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    runtime::Handle,
};
use tracing::{debug, info, warn};

use crate::{
    errors::HarnessError,
    harness::diagnostics::DiagnosticsCollector,
    logging,
    mcp::rpc::{parse_line, serialize_line, Incoming, Notification, Request, Response},
};

const DIAGNOSTICS_DRAIN_WAIT: Duration = Duration::from_secs(1);

/// How stdout lines that are not JSON at all are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdoutPolicy {
    /// Any non-JSON line is a protocol violation.
    #[default]
    Strict,
    /// Non-JSON lines are logged and skipped.
    SkipNonJson,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Response(Response),
    /// The child closed its output or sent an empty line.
    NoResponse,
}

#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub status: ExitStatus,
    pub forced: bool,
    pub diagnostics: String,
}

impl ShutdownReport {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Exclusive owner of one child process speaking line-delimited JSON-RPC on its stdio.
///
/// At most one request is in flight: [`StdioHarness::send`] refuses a new request
/// until the previous one has been answered by [`StdioHarness::receive`].
#[derive(Debug)]
pub struct StdioHarness {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    diagnostics: Option<DiagnosticsCollector>,
    policy: StdoutPolicy,
    next_id: u64,
    outstanding: Option<u64>,
    shutdown: Option<ShutdownReport>,
}

impl StdioHarness {
    pub fn start<I, S>(program: impl AsRef<OsStr>, args: I) -> Result<Self, HarnessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program_name = program.as_ref().to_string_lossy().into_owned();

        // Process handles and the stderr drain task both need a runtime.
        Handle::try_current().map_err(|err| {
            HarnessError::launch(&program_name, io::Error::new(io::ErrorKind::Other, err))
        })?;

        let mut child = Command::new(program.as_ref())
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| HarnessError::launch(&program_name, err))?;

        let missing = |stream: &str| {
            HarnessError::launch(
                &program_name,
                io::Error::new(io::ErrorKind::Other, format!("{stream} was not captured")),
            )
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        info!(program = %program_name, pid = ?child.id(), "child process started");

        Ok(Self {
            program: program_name,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            diagnostics: Some(DiagnosticsCollector::spawn(stderr)),
            policy: StdoutPolicy::default(),
            next_id: 1,
            outstanding: None,
            shutdown: None,
        })
    }

    pub fn with_policy(mut self, policy: StdoutPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Builds a request carrying the next identifier of this session.
    pub fn request(
        &mut self,
        method: impl Into<String>,
        params: Option<Map<String, Value>>,
    ) -> Request {
        let id = self.next_id;
        self.next_id += 1;
        Request::new(id, method, params)
    }

    pub async fn send(&mut self, request: &Request) -> Result<(), HarnessError> {
        if let Some(id) = self.outstanding {
            return Err(HarnessError::RequestInFlight(id));
        }

        let line = serialize_line(request).map_err(|err| HarnessError::Write(err.into()))?;
        logging::log_outgoing(
            Some(request.id),
            &request.method,
            request.params.clone().map(Value::Object).as_ref(),
        );
        self.write_line(&line).await?;
        self.outstanding = Some(request.id);
        Ok(())
    }

    pub async fn notify(
        &mut self,
        method: impl Into<String>,
        params: Option<Map<String, Value>>,
    ) -> Result<(), HarnessError> {
        let notification = Notification::new(method, params);
        let line = serialize_line(&notification).map_err(|err| HarnessError::Write(err.into()))?;
        logging::log_outgoing(
            None,
            &notification.method,
            notification.params.clone().map(Value::Object).as_ref(),
        );
        self.write_line(&line).await
    }

    /// Reads the reply to the outstanding request, giving up after `timeout`.
    ///
    /// The deadline covers every line read, including skipped notifications and
    /// skipped non-JSON lines. Any terminal outcome clears the outstanding request.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Reply, HarnessError> {
        let expected = self.outstanding.take();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let line = match tokio::time::timeout_at(deadline, self.stdout.next_line()).await {
                Err(_) => return Err(HarnessError::Timeout(timeout)),
                Ok(Ok(None)) => return Ok(Reply::NoResponse),
                Ok(Ok(Some(line))) => line,
                Ok(Err(err)) if err.kind() == io::ErrorKind::InvalidData => {
                    return Err(HarnessError::protocol("stdout is not valid UTF-8", ""))
                }
                Ok(Err(err)) => return Err(HarnessError::Io(err)),
            };

            if self.policy == StdoutPolicy::SkipNonJson
                && !line.trim().is_empty()
                && serde_json::from_str::<IgnoredAny>(line.trim()).is_err()
            {
                debug!(line = %line, "skipping non-JSON stdout line");
                continue;
            }

            match parse_line(&line)? {
                Incoming::Blank => return Ok(Reply::NoResponse),
                Incoming::Notification { method } => {
                    debug!(method = %method, "skipping server notification");
                }
                Incoming::Response(response) => {
                    return match expected {
                        Some(id) if id == response.id => Ok(Reply::Response(response)),
                        Some(id) => Err(HarnessError::protocol(
                            format!(
                                "response id {} does not match outstanding request {id}",
                                response.id
                            ),
                            line,
                        )),
                        None => Err(HarnessError::protocol(
                            format!("response {} arrived with no request outstanding", response.id),
                            line,
                        )),
                    };
                }
            }
        }
    }

    /// Sends a request and waits for its response; a closed output becomes
    /// [`HarnessError::NoResponse`].
    pub async fn call(
        &mut self,
        method: &str,
        params: Option<Map<String, Value>>,
        timeout: Duration,
    ) -> Result<Response, HarnessError> {
        let request = self.request(method, params);
        let started_at = Instant::now();

        let result = self.exchange(&request, timeout).await;
        let outcome = match &result {
            Ok(response) if response.result().is_some() => "success",
            Ok(_) => "error_response",
            Err(err) => err.kind(),
        };
        logging::exchange_summary(request.id, method, started_at, outcome);

        result
    }

    async fn exchange(
        &mut self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, HarnessError> {
        self.send(request).await?;
        match self.receive(timeout).await? {
            Reply::Response(response) => Ok(response),
            Reply::NoResponse => Err(HarnessError::NoResponse),
        }
    }

    /// Stops the child: closes stdin and asks it to terminate, then kills it once
    /// `grace` has elapsed. Stderr is drained after the child is reaped, on both paths.
    ///
    /// Calling it again returns the first report without touching the process.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<ShutdownReport, HarnessError> {
        if let Some(report) = &self.shutdown {
            return Ok(report.clone());
        }

        drop(self.stdin.take());
        self.outstanding = None;

        let stopped = self.stop_child(grace).await;
        self.finish_shutdown(stopped).await
    }

    async fn stop_child(&mut self, grace: Duration) -> io::Result<(ExitStatus, bool)> {
        if let Some(status) = self.child.try_wait()? {
            return Ok((status, false));
        }

        request_termination(&self.child);
        if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
            return Ok((status?, false));
        }

        warn!(
            program = %self.program,
            grace_ms = grace.as_millis(),
            "child ignored termination request; killing"
        );
        self.child.kill().await?;
        Ok((self.child.wait().await?, true))
    }

    /// Drains stderr whatever the outcome of stopping the child; a failed stop
    /// carries it in [`HarnessError::Shutdown`].
    async fn finish_shutdown(
        &mut self,
        stopped: io::Result<(ExitStatus, bool)>,
    ) -> Result<ShutdownReport, HarnessError> {
        let diagnostics = match self.diagnostics.take() {
            Some(collector) => collector.finish(DIAGNOSTICS_DRAIN_WAIT).await,
            None => String::new(),
        };

        let (status, forced) = match stopped {
            Ok(stopped) => stopped,
            Err(source) => {
                warn!(program = %self.program, error = %source, "child could not be stopped");
                return Err(HarnessError::Shutdown {
                    source,
                    diagnostics,
                });
            }
        };

        info!(
            program = %self.program,
            status = %status,
            forced = forced,
            diagnostics_bytes = diagnostics.len(),
            "child process stopped"
        );

        let report = ShutdownReport {
            status,
            forced,
            diagnostics,
        };
        self.shutdown = Some(report.clone());
        Ok(report)
    }

    async fn write_line(&mut self, line: &str) -> Result<(), HarnessError> {
        if let Some(status) = self.child.try_wait().map_err(HarnessError::Write)? {
            return Err(HarnessError::Write(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("child already exited with {status}"),
            )));
        }

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(HarnessError::Write(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stdin is closed",
            )));
        };

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(HarnessError::Write)?;
        stdin.flush().await.map_err(HarnessError::Write)
    }
}

#[cfg(unix)]
fn request_termination(child: &Child) {
    use nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid = pid, error = %err, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn request_termination(_child: &Child) {}

#[cfg(all(test, unix))]
mod tests {
    use serde_json::json;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Answers every request line with a result echoing its id.
    const RESPONDER: &str = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  printf '{"jsonrpc":"2.0","id":%s,"result":{"echo":true}}\n' "$id"
done"#;

    fn shell(script: &str) -> StdioHarness {
        StdioHarness::start("sh", ["-c", script]).expect("sh should launch")
    }

    #[tokio::test]
    async fn missing_executable_is_launch_error() {
        let err = StdioHarness::start("/nonexistent/mcp-server-binary", ["server.py"])
            .expect_err("launch must fail");
        assert!(matches!(err, HarnessError::Launch { .. }));
    }

    #[test]
    fn start_outside_runtime_is_launch_error() {
        let err = StdioHarness::start("sh", ["-c", "exit 0"]).expect_err("no runtime");
        assert_eq!(err.kind(), "launch_error");
    }

    #[tokio::test]
    async fn responses_correlate_with_requests() {
        let mut harness = shell(RESPONDER);

        for expected_id in 1..=3u64 {
            let response = harness
                .call("tools/list", None, TIMEOUT)
                .await
                .expect("call should succeed");
            assert_eq!(response.id, expected_id);
            assert_eq!(response.result(), Some(&json!({ "echo": true })));
        }

        harness.shutdown(TIMEOUT).await.expect("shutdown");
    }

    #[tokio::test]
    async fn second_send_requires_prior_receive() {
        let mut harness = shell(RESPONDER);
        let first = harness.request("ping", None);
        let second = harness.request("ping", None);

        harness.send(&first).await.expect("first send");
        let err = harness.send(&second).await.expect_err("second send must fail");
        assert!(matches!(err, HarnessError::RequestInFlight(1)));

        let reply = harness.receive(TIMEOUT).await.expect("receive");
        assert!(matches!(reply, Reply::Response(Response { id: 1, .. })));
        harness.send(&second).await.expect("send after receive");

        harness.shutdown(TIMEOUT).await.expect("shutdown");
    }

    #[tokio::test]
    async fn closed_output_is_no_response() {
        let mut harness = shell("read line; exit 0");
        let request = harness.request("initialize", None);

        harness.send(&request).await.expect("send");
        let reply = harness.receive(TIMEOUT).await.expect("receive");
        assert_eq!(reply, Reply::NoResponse);

        let err = harness
            .call("tools/list", None, TIMEOUT)
            .await
            .expect_err("exited child cannot answer");
        assert!(matches!(
            err,
            HarnessError::Write(_) | HarnessError::NoResponse
        ));
    }

    #[tokio::test]
    async fn blank_line_is_no_response() {
        let mut harness = shell("read line; echo ''; sleep 5");
        let request = harness.request("initialize", None);

        harness.send(&request).await.expect("send");
        let reply = harness.receive(TIMEOUT).await.expect("receive");
        assert_eq!(reply, Reply::NoResponse);

        harness.shutdown(TIMEOUT).await.expect("shutdown");
    }

    #[tokio::test]
    async fn non_json_line_is_protocol_error() {
        let mut harness = shell("read line; echo 'Starting server on stdio'; sleep 5");

        let err = harness
            .call("initialize", None, TIMEOUT)
            .await
            .expect_err("must fail");
        assert!(matches!(err, HarnessError::Protocol { .. }));

        harness.shutdown(TIMEOUT).await.expect("shutdown");
    }

    #[tokio::test]
    async fn skip_policy_ignores_log_lines_and_notifications() {
        let mut harness = shell(
            r#"read line
echo 'Starting server on stdio'
echo '{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}'
echo '{"jsonrpc":"2.0","id":1,"result":{}}'
sleep 5"#,
        )
        .with_policy(StdoutPolicy::SkipNonJson);

        let response = harness
            .call("initialize", None, TIMEOUT)
            .await
            .expect("log line should be skipped");
        assert_eq!(response.id, 1);

        harness.shutdown(TIMEOUT).await.expect("shutdown");
    }

    #[tokio::test]
    async fn mismatched_id_is_protocol_error() {
        let mut harness =
            shell(r#"read line; echo '{"jsonrpc":"2.0","id":99,"result":{}}'; sleep 5"#);

        let err = harness
            .call("initialize", None, TIMEOUT)
            .await
            .expect_err("must fail");
        assert!(matches!(err, HarnessError::Protocol { .. }));
        assert!(err.to_string().contains("99"));

        harness.shutdown(TIMEOUT).await.expect("shutdown");
    }

    #[tokio::test]
    async fn silent_child_times_out() {
        let mut harness = StdioHarness::start("sleep", ["30"]).expect("sleep should launch");
        let request = harness.request("initialize", None);
        harness.send(&request).await.expect("send");

        let started_at = Instant::now();
        let err = harness
            .receive(Duration::from_millis(200))
            .await
            .expect_err("must time out");
        assert!(matches!(err, HarnessError::Timeout(_)));
        assert!(started_at.elapsed() < Duration::from_secs(5));

        let report = harness.shutdown(TIMEOUT).await.expect("shutdown");
        assert!(!report.forced);
    }

    #[tokio::test]
    async fn steady_notifications_do_not_extend_the_deadline() {
        let mut harness = shell(
            r#"read line
while :; do
  echo '{"jsonrpc":"2.0","method":"notifications/message"}'
  sleep 0.05
done"#,
        );
        let request = harness.request("initialize", None);
        harness.send(&request).await.expect("send");

        let started_at = Instant::now();
        let err = harness
            .receive(Duration::from_millis(300))
            .await
            .expect_err("notifications are not a reply");
        assert!(matches!(err, HarnessError::Timeout(_)));
        assert!(started_at.elapsed() < Duration::from_secs(2));

        harness.shutdown(TIMEOUT).await.expect("shutdown");
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let mut harness = shell(RESPONDER);

        let first = harness.shutdown(TIMEOUT).await.expect("first shutdown");
        let started_at = Instant::now();
        let second = harness.shutdown(TIMEOUT).await.expect("second shutdown");

        assert!(started_at.elapsed() < Duration::from_millis(100));
        assert_eq!(first.status, second.status);
        assert!(!harness.is_running());
    }

    #[tokio::test]
    async fn term_resistant_child_is_killed_and_stderr_kept() {
        let mut harness = shell("trap '' TERM; echo armed >&2; while :; do sleep 0.1; done");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started_at = Instant::now();
        let report = harness
            .shutdown(Duration::from_millis(300))
            .await
            .expect("shutdown");

        assert!(report.forced);
        assert!(report.diagnostics.contains("armed"));
        assert!(started_at.elapsed() < Duration::from_secs(3));
        assert!(!harness.is_running());
    }

    #[tokio::test]
    async fn stderr_is_surfaced_after_graceful_exit() {
        let mut harness = shell("echo 'fatal: config missing' >&2; read line");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = harness.shutdown(TIMEOUT).await.expect("shutdown");
        assert!(!report.forced);
        assert!(report.diagnostics.contains("fatal: config missing"));
    }

    #[tokio::test]
    async fn failed_stop_still_hands_over_stderr() {
        let mut harness = shell("echo 'worker crashed' >&2; exit 0");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = harness
            .finish_shutdown(Err(io::Error::new(io::ErrorKind::Other, "wait failed")))
            .await
            .expect_err("stop failure is reported");

        assert_eq!(err.kind(), "shutdown_error");
        assert!(err.to_string().contains("wait failed"));
        assert!(err
            .diagnostics()
            .is_some_and(|text| text.contains("worker crashed")));
    }

    #[tokio::test]
    async fn send_after_shutdown_is_write_error() {
        let mut harness = shell(RESPONDER);
        harness.shutdown(TIMEOUT).await.expect("shutdown");

        let request = harness.request("tools/list", None);
        let err = harness.send(&request).await.expect_err("must fail");
        assert!(matches!(err, HarnessError::Write(_)));
    }

    #[tokio::test]
    async fn send_to_exited_child_is_write_error() {
        let mut harness =
            StdioHarness::start("true", Vec::<String>::new()).expect("true should launch");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let request = harness.request("initialize", None);
        let err = harness.send(&request).await.expect_err("must fail");
        assert!(matches!(err, HarnessError::Write(_)));
    }
}
