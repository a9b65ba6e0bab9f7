//! Runs commands as child processes of this one.
//!
//! Each command runs through the platform shell. Standard output lines become
//! success objects, standard error lines become error records, and the exit
//! status decides how the execution ends.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as ProcessCommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    InvocationRequest, RemoteInvocation, RemoteOutcome, RemoteOutputWriter, RemoteSession, RetryNotification,
    Transport, TransportError,
};
use crate::core::descriptor::{ConnectionDescriptor, Target, TransportOptions};
use crate::core::record::{ErrorCategory, ErrorRecord, PipelineRecord};

/// Transport for the local-process target kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProcessTransport;

impl LocalProcessTransport {
    pub fn new() -> Self {
        Self
    }

    fn accepts(target: &Target) -> bool {
        match target {
            Target::LocalProcess => true,
            Target::ComputerName { name } => name == "localhost" || name == "." || name == "127.0.0.1",
            _ => false,
        }
    }
}

#[async_trait]
impl Transport for LocalProcessTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn RemoteSession>, TransportError> {
        if !Self::accepts(&descriptor.target) {
            return Err(TransportError::Rejected(format!("{} is not a local target", descriptor.target)));
        }
        let (retry, _) = broadcast::channel(8);
        Ok(Arc::new(LocalSession {
            id: Uuid::new_v4(),
            options: descriptor.options.clone(),
            executions: Arc::new(Mutex::new(HashMap::new())),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            retry,
        }))
    }
}

struct LocalSession {
    id: Uuid,
    options: TransportOptions,
    executions: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    connected: AtomicBool,
    closed: AtomicBool,
    retry: broadcast::Sender<RetryNotification>,
}

#[async_trait]
impl RemoteSession for LocalSession {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn invoke(&self, request: InvocationRequest) -> Result<RemoteInvocation, TransportError> {
        if self.closed.load(Ordering::Acquire) || !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::SessionUnavailable(self.id));
        }

        let (shell, shell_arg) = get_shell();
        let command_line = request.command.command_line();
        let mut cmd = ProcessCommand::new(shell);
        cmd.arg(shell_arg).arg(&command_line);
        if let Some(ref dir) = request.command.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &request.command.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

        let mut child = cmd.spawn()?;
        tracing::debug!(command = %command_line, pid = ?child.id(), "Spawned local process");

        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(write_input(stdin, request.input));
        }

        let (writer, invocation) =
            RemoteOutputWriter::channel(self.options.output_buffer_capacity, self.options.buffering_mode);
        let stop = CancellationToken::new();
        self.executions.lock().insert(invocation.id, stop.clone());
        tokio::spawn(run_process(child, writer, stop, Arc::clone(&self.executions), invocation.id));
        Ok(invocation)
    }

    async fn stop(&self, invocation: Uuid) -> Result<(), TransportError> {
        let executions = self.executions.lock();
        let token = executions.get(&invocation).ok_or(TransportError::ExecutionNotFound(invocation))?;
        token.cancel();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::SessionUnavailable(self.id));
        }
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::SessionUnavailable(self.id));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            for token in self.executions.lock().values() {
                token.cancel();
            }
        }
        Ok(())
    }

    fn retry_notifications(&self) -> broadcast::Receiver<RetryNotification> {
        self.retry.subscribe()
    }
}

/// Feed the input to the child, one value per line, then close stdin.
async fn write_input(mut stdin: ChildStdin, input: Vec<Value>) {
    for value in input {
        let line = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        if stdin.write_all(line.as_bytes()).await.is_err() || stdin.write_all(b"\n").await.is_err() {
            return;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn run_process(
    mut child: Child,
    writer: RemoteOutputWriter,
    stop: CancellationToken,
    executions: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    invocation: Uuid,
) {
    enum Event {
        Stop,
        Stdout(Line),
        Stderr(Line),
    }

    let mut stdout = child.stdout.take().map(LineReader::new);
    let mut stderr = child.stderr.take().map(LineReader::new);

    let mut stopped = false;
    while stdout.is_some() || stderr.is_some() {
        let event = tokio::select! {
            () = stop.cancelled() => Event::Stop,
            line = next_line(&mut stdout) => Event::Stdout(line),
            line = next_line(&mut stderr) => Event::Stderr(line),
        };
        match event {
            Event::Stop => {
                stopped = true;
                break;
            }
            Event::Stdout(Line::Text(line)) => {
                writer.write(PipelineRecord::output(line)).await;
            }
            Event::Stderr(Line::Text(line)) => {
                let record = ErrorRecord::new(line).with_category(ErrorCategory::RemoteError);
                writer.write(PipelineRecord::Error(record)).await;
            }
            Event::Stdout(Line::Failed(err)) => {
                writer.write(read_failure("standard output", &err)).await;
                stdout = None;
            }
            Event::Stderr(Line::Failed(err)) => {
                writer.write(read_failure("standard error", &err)).await;
                stderr = None;
            }
            Event::Stdout(Line::Eof) => stdout = None,
            Event::Stderr(Line::Eof) => stderr = None,
        }
    }

    let status = if stopped {
        None
    } else {
        tokio::select! {
            status = child.wait() => Some(status),
            () = stop.cancelled() => None,
        }
    };
    let outcome = match status {
        Some(Ok(status)) if status.success() => RemoteOutcome::Completed,
        Some(Ok(status)) => match status.code() {
            Some(code) => RemoteOutcome::Failed(format!("exit code {code}")),
            None => RemoteOutcome::Failed("terminated by signal".to_string()),
        },
        Some(Err(err)) => RemoteOutcome::Failed(err.to_string()),
        None => {
            if let Err(err) = child.kill().await {
                tracing::warn!(error = %err, "Failed to kill local process");
            }
            RemoteOutcome::Stopped
        }
    };
    tracing::debug!(outcome = ?outcome, "Local process finished");

    executions.lock().remove(&invocation);
    writer.finish(outcome).await;
}

fn read_failure(stream: &str, err: &std::io::Error) -> PipelineRecord {
    tracing::warn!(stream, error = %err, "Failed to read local process output");
    PipelineRecord::Error(
        ErrorRecord::new(format!("failed to read {stream}: {err}")).with_category(ErrorCategory::ResourceUnavailable),
    )
}

enum Line {
    Text(String),
    Eof,
    Failed(std::io::Error),
}

/// Newline-delimited reader that decodes invalid UTF-8 lossily.
///
/// Bytes read before a cancelled call stay buffered, so it can sit in a
/// `select!` loop.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self { reader: BufReader::new(inner), buf: Vec::new() }
    }

    async fn next(&mut self) -> Line {
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) if self.buf.is_empty() => Line::Eof,
            Ok(_) => {
                let mut end = self.buf.len();
                if self.buf[..end].ends_with(b"\n") {
                    end -= 1;
                }
                if self.buf[..end].ends_with(b"\r") {
                    end -= 1;
                }
                let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
                self.buf.clear();
                Line::Text(line)
            }
            Err(err) => Line::Failed(err),
        }
    }
}

async fn next_line<R: AsyncRead + Unpin>(reader: &mut Option<LineReader<R>>) -> Line {
    match reader {
        Some(reader) => reader.next().await,
        None => std::future::pending().await,
    }
}

/// Shell and flag for the current platform.
fn get_shell() -> (&'static str, &'static str) {
    if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::command::CommandDefinition;
    use crate::transport::RemoteEvent;

    async fn run(script: &str, input: Vec<Value>) -> Vec<RemoteEvent> {
        let session = LocalProcessTransport.open(&ConnectionDescriptor::new(Target::LocalProcess)).await.unwrap();
        let mut invocation =
            session.invoke(InvocationRequest { command: CommandDefinition::script(script), input }).await.unwrap();
        let mut events = Vec::new();
        while let Some(event) = invocation.events.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_rejects_remote_targets() {
        let result = LocalProcessTransport.open(&ConnectionDescriptor::new(Target::computer("web01"))).await;
        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_stdout_lines_become_output() {
        let events = run("echo one; echo two", Vec::new()).await;
        assert_eq!(
            events,
            vec![
                RemoteEvent::Record(PipelineRecord::output("one")),
                RemoteEvent::Record(PipelineRecord::output("two")),
                RemoteEvent::Finished(RemoteOutcome::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_stderr_and_exit_code() {
        let events = run("echo oops >&2; exit 3", Vec::new()).await;
        assert!(matches!(&events[0], RemoteEvent::Record(PipelineRecord::Error(e)) if e.message == "oops"));
        assert_eq!(events.last(), Some(&RemoteEvent::Finished(RemoteOutcome::Failed("exit code 3".into()))));
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_truncate_output() {
        let events = run(r"printf 'a\n\377\nb\nc'", Vec::new()).await;
        assert_eq!(
            events,
            vec![
                RemoteEvent::Record(PipelineRecord::output("a")),
                RemoteEvent::Record(PipelineRecord::output("\u{FFFD}")),
                RemoteEvent::Record(PipelineRecord::output("b")),
                RemoteEvent::Record(PipelineRecord::output("c")),
                RemoteEvent::Finished(RemoteOutcome::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_finished_execution_is_released() {
        let session = LocalProcessTransport.open(&ConnectionDescriptor::new(Target::LocalProcess)).await.unwrap();
        let mut invocation =
            session.invoke(InvocationRequest { command: CommandDefinition::script("true"), input: Vec::new() }).await.unwrap();
        while invocation.events.recv().await.is_some() {}

        let result = session.stop(invocation.id).await;
        assert!(matches!(result, Err(TransportError::ExecutionNotFound(id)) if id == invocation.id));
    }

    #[tokio::test]
    async fn test_input_written_to_stdin() {
        let events = run("cat", vec![Value::from("a"), Value::from(2)]).await;
        assert_eq!(events[0], RemoteEvent::Record(PipelineRecord::output("a")));
        assert_eq!(events[1], RemoteEvent::Record(PipelineRecord::output("2")));
    }

    #[tokio::test]
    async fn test_stop_kills_process() {
        let session = LocalProcessTransport.open(&ConnectionDescriptor::new(Target::LocalProcess)).await.unwrap();
        let mut invocation = session
            .invoke(InvocationRequest { command: CommandDefinition::script("sleep 30"), input: Vec::new() })
            .await
            .unwrap();
        session.stop(invocation.id).await.unwrap();

        let mut last = None;
        while let Some(event) = invocation.events.recv().await {
            last = Some(event);
        }
        assert_eq!(last, Some(RemoteEvent::Finished(RemoteOutcome::Stopped)));
    }
}
