//! Runs the `lockstep-worker` binary the way the coordinator does: rank
//! variables in the environment, JSON frames over stdin/stdout.

use lockstep_common::LockstepConfig;
use lockstep_proto::{
    decode_frame, encode_frame, ChatMessage, Dialog, DispatchedRequest, WorkerCommand, WorkerEvent,
};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

const IO_TIMEOUT: Duration = Duration::from_secs(10);

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    _model: TempDir,
}

fn model_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("checkpoint")).unwrap();
    std::fs::write(dir.path().join("tokenizer.model"), b"tokenizer").unwrap();
    dir
}

fn command(rank: usize, world_size: usize, model: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_lockstep-worker"));
    command
        .current_dir(model)
        .env_remove("LOCKSTEP_CONFIG")
        .env("RANK", rank.to_string())
        .env("WORLD_SIZE", world_size.to_string())
        .env("LOCKSTEP_MODEL__CHECKPOINT_DIR", model.join("checkpoint"))
        .env("LOCKSTEP_MODEL__TOKENIZER_PATH", model.join("tokenizer.model"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    command
}

impl Worker {
    fn spawn() -> Self {
        let model = model_dir();
        let mut child = command(0, 1, model.path()).spawn().unwrap();
        let stdin = child.stdin.take().unwrap();
        let stdout = BufReader::new(child.stdout.take().unwrap()).lines();

        Self {
            child,
            stdin,
            stdout,
            _model: model,
        }
    }

    async fn send(&mut self, command: &WorkerCommand) {
        let line = encode_frame(command).unwrap();
        self.stdin.write_all(line.as_bytes()).await.unwrap();
        self.stdin.flush().await.unwrap();
    }

    async fn next_event(&mut self) -> WorkerEvent {
        let line = tokio::time::timeout(IO_TIMEOUT, self.stdout.next_line())
            .await
            .expect("worker did not answer in time")
            .unwrap()
            .expect("worker closed stdout");
        decode_frame(&line).unwrap()
    }
}

fn generate(seq: u64, content: &str) -> WorkerCommand {
    WorkerCommand::Generate(DispatchedRequest {
        request_id: format!("req-{}", seq),
        seq,
        dialog: Dialog::new(vec![ChatMessage::new("user", content)]),
    })
}

async fn expect_generated(worker: &mut Worker, seq: u64, content: &str) {
    let prompt = LockstepConfig::default().chat.default_system_prompt;
    let normalized = Dialog::new(vec![
        ChatMessage::system(prompt),
        ChatMessage::new("user", content),
    ]);

    match worker.next_event().await {
        WorkerEvent::Generated(output) => {
            assert_eq!(output.rank, 0);
            assert_eq!(output.seq, seq);
            assert_eq!(output.request_id, format!("req-{}", seq));
            assert_eq!(output.dialog_digest, normalized.digest());
            assert_eq!(output.generation, ChatMessage::assistant(content));
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

async fn shutdown(mut worker: Worker) {
    worker.send(&WorkerCommand::Shutdown).await;
    assert_eq!(worker.next_event().await, WorkerEvent::Stopped { rank: 0 });

    let status = tokio::time::timeout(IO_TIMEOUT, worker.child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_worker_serves_frames_until_shutdown() {
    let mut worker = Worker::spawn();
    assert_eq!(worker.next_event().await, WorkerEvent::Ready { rank: 0 });

    worker.send(&generate(1, "Hello")).await;
    expect_generated(&mut worker, 1, "Hello").await;

    worker.send(&generate(2, "Second")).await;
    expect_generated(&mut worker, 2, "Second").await;

    shutdown(worker).await;
}

#[tokio::test]
async fn test_worker_exits_when_stdin_closes() {
    let mut worker = Worker::spawn();
    assert_eq!(worker.next_event().await, WorkerEvent::Ready { rank: 0 });

    let Worker {
        mut child,
        stdin,
        mut stdout,
        _model,
    } = worker;
    drop(stdin);

    let line = tokio::time::timeout(IO_TIMEOUT, stdout.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        decode_frame::<WorkerEvent>(&line).unwrap(),
        WorkerEvent::Stopped { rank: 0 }
    );
    let status = tokio::time::timeout(IO_TIMEOUT, child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_rank_outside_world_fails_to_start() {
    let model = model_dir();
    let status = tokio::time::timeout(IO_TIMEOUT, command(1, 1, model.path()).status())
        .await
        .unwrap()
        .unwrap();
    assert!(!status.success());
}

#[cfg(unix)]
#[tokio::test]
async fn test_interrupt_waits_for_shutdown_sentinel() {
    let mut worker = Worker::spawn();
    assert_eq!(worker.next_event().await, WorkerEvent::Ready { rank: 0 });

    let pid = worker.child.id().unwrap();
    let killed = std::process::Command::new("kill")
        .args(["-INT", &pid.to_string()])
        .status()
        .unwrap();
    assert!(killed.success());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Still serving after the interrupt.
    worker.send(&generate(1, "still here")).await;
    expect_generated(&mut worker, 1, "still here").await;

    shutdown(worker).await;
}
