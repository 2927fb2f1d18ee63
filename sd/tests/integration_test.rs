//! Integration tests for solverd
//!
//! These tests run the service end to end: admission, scheduling, workers and
//! the progress bus against a store in a temp directory.

use std::sync::Arc;
use std::time::Duration;

use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use solverd::artifacts::ArtifactStore;
use solverd::config::Config;
use solverd::domain::{Principal, TaskStatus, TransitionOutcome};
use solverd::events::PushMessage;
use solverd::service::{SolverService, SubmitRequest};
use tempfile::TempDir;
use tokio::sync::watch;

fn test_config(temp: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = temp.path().to_path_buf();
    config.scheduler.poll_interval_ms = 50;
    config
}

/// Augmented `A|b` text for a random diagonally dominant system
fn random_system_text(n: usize, seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = String::new();
    for i in 0..n {
        let row: Vec<String> = (0..=n)
            .map(|j| {
                let v: f64 = rng.random_range(-1.0..1.0);
                let v = if i == j { v + n as f64 } else { v };
                format!("{:.6}", v)
            })
            .collect();
        out.push_str(&row.join(" "));
        out.push('\n');
    }
    out
}

struct Running {
    service: Arc<SolverService>,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<eyre::Result<()>>,
}

impl Running {
    fn start(config: Config) -> Self {
        let service = Arc::new(SolverService::open(config).expect("Failed to open service"));
        let (shutdown, rx) = watch::channel(false);
        let svc = service.clone();
        let handle = tokio::spawn(async move { svc.run(rx).await });
        Self {
            service,
            shutdown,
            handle,
        }
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(30), self.handle).await;
        assert!(result.is_ok(), "Service should shut down gracefully");
    }
}

async fn wait_for_status(service: &SolverService, id: &str, wanted: &[TaskStatus], timeout: Duration) -> TaskStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = service.state().get_task_required(id).await.unwrap();
        if wanted.contains(&task.status) {
            return task.status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {} stuck in {} waiting for {:?}",
            id,
            task.status,
            wanted
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn submit(service: &SolverService, user: &str, text: &str) -> String {
    let receipt = service
        .submit(&Principal::user(user), SubmitRequest::default())
        .await
        .unwrap();
    let outcome = service.prepare(&receipt.id, text).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Applied(TaskStatus::Queued));
    receipt.id
}

// =============================================================================
// End to end
// =============================================================================

#[tokio::test]
async fn test_two_by_two_solves_end_to_end() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let running = Running::start(test_config(&temp));
    let service = running.service.clone();
    let alice = Principal::user("alice");

    let receipt = service
        .submit(
            &alice,
            SubmitRequest {
                save_factors: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let mut subscription = service.subscribe(Some(&alice), &receipt.id).await.unwrap();
    assert!(matches!(subscription.next().await, Some(PushMessage::InitialState(_))));

    service.prepare(&receipt.id, "2 1 3\n1 3 5\n").await.unwrap();

    // Follow the push channel to the terminal update
    let final_event = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match subscription.next().await {
                Some(PushMessage::Update(event)) if event.status.is_terminal() => return event,
                Some(_) => continue,
                None => panic!("bus closed before the task finished"),
            }
        }
    })
    .await
    .expect("task did not finish in time");
    assert_eq!(final_event.status, TaskStatus::Completed);
    assert_eq!(final_event.percentage, 100.0);

    let view = service.detail(&alice, &receipt.id).await.unwrap();
    let result = view.task.result_artifact.expect("solution artifact");
    let x = ArtifactStore::read_solution(std::path::Path::new(&result)).unwrap();
    assert_abs_diff_eq!(x[0], 0.8, epsilon = 1e-9);
    assert_abs_diff_eq!(x[1], 1.4, epsilon = 1e-9);
    assert!(view.task.factor_artifacts.is_some());
    assert!(view.task.started_at.is_some());
    assert!(view.task.completed_at.is_some());

    let progress = service.progress(&alice, &receipt.id).await.unwrap();
    let percentages: Vec<f64> = progress.iter().map(|p| p.percentage).collect();
    assert!(percentages.windows(2).all(|w| w[0] <= w[1]), "{:?}", percentages);
    assert_eq!(percentages.last().copied(), Some(100.0));

    let logs: Vec<String> = service
        .logs(&alice, &receipt.id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.message)
        .collect();
    assert_eq!(logs.first().map(String::as_str), Some("Input validated: 2x2 system"), "{:?}", logs);
    assert!(logs[1].starts_with("Starting LU decomposition"), "{:?}", logs);

    drop(subscription);
    running.stop().await;
}

#[tokio::test]
async fn test_follow_sees_worker_in_another_service() {
    use futures::StreamExt;

    let temp = TempDir::new().expect("Failed to create temp dir");
    let running = Running::start(test_config(&temp));
    // Same store, separate bus: stands in for a CLI process
    let client = SolverService::open(test_config(&temp)).unwrap();
    let alice = Principal::user("alice");

    let id = submit(&client, "alice", &random_system_text(40, 3)).await;
    let updates = Box::pin(client.follow(&alice, &id).await.unwrap());
    let messages: Vec<PushMessage> = tokio::time::timeout(Duration::from_secs(30), updates.collect())
        .await
        .expect("follow did not reach a terminal status");

    assert!(matches!(messages.first(), Some(PushMessage::InitialState(_))));
    let last = messages.last().unwrap().event();
    assert_eq!(last.status, TaskStatus::Completed);
    assert_eq!(last.percentage, 100.0);

    let stored = running.service.state().get_task_required(&id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);

    running.stop().await;
}

#[tokio::test]
async fn test_singular_system_fails_with_message() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let running = Running::start(test_config(&temp));
    let service = running.service.clone();

    let id = submit(&service, "alice", "1 2 3\n2 4 6\n").await;
    let status = wait_for_status(&service, &id, &[TaskStatus::Failed, TaskStatus::Completed], Duration::from_secs(30)).await;
    assert_eq!(status, TaskStatus::Failed);

    let task = service.state().get_task_required(&id).await.unwrap();
    assert_eq!(task.result_message.as_deref(), Some(solverd::worker::MSG_SINGULAR));
    assert!(task.result_artifact.is_none());

    running.stop().await;
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test]
async fn test_running_never_exceeds_global_cap() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config(&temp);
    config.admission.global_cap = 2;
    config.admission.per_user_cap = 10;
    let running = Running::start(config);
    let service = running.service.clone();

    let mut ids = Vec::new();
    for i in 0..6 {
        let user = format!("user{}", i % 3);
        ids.push(submit(&service, &user, &random_system_text(60, i)).await);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let counts = service.state().counts().await.unwrap();
        assert!(counts.running <= 2, "running {} exceeds cap", counts.running);
        if counts.completed == ids.len() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "tasks did not finish: {:?}", counts);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    running.stop().await;
}

#[tokio::test]
async fn test_cancelling_running_task_promotes_queued() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config(&temp);
    config.admission.global_cap = 1;
    config.admission.per_user_cap = 10;
    let running = Running::start(config);
    let service = running.service.clone();
    let alice = Principal::user("alice");

    let first = submit(&service, "alice", &random_system_text(500, 7)).await;
    let second = submit(&service, "alice", "2 1 3\n1 3 5\n").await;

    // Cancel once the decomposition is past its first checkpoint
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let progress = service.progress(&alice, &first).await.unwrap();
        if progress.iter().any(|p| p.stage == "LU decomposition" && p.percentage > 10.0) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "decomposition never started");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let outcome = service.cancel(&alice, &first).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Applied(TaskStatus::Cancelled));
    let recorded = service.progress(&alice, &first).await.unwrap().len();

    let status = wait_for_status(
        &service,
        &second,
        &[TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled],
        Duration::from_secs(30),
    )
    .await;
    assert_eq!(status, TaskStatus::Completed);

    // Give the abandoned engine time to hit its next checkpoint
    tokio::time::sleep(Duration::from_millis(200)).await;
    let first_task = service.state().get_task_required(&first).await.unwrap();
    assert_eq!(first_task.status, TaskStatus::Cancelled);
    assert!(first_task.result_artifact.is_none());
    assert_eq!(service.progress(&alice, &first).await.unwrap().len(), recorded);

    running.stop().await;
}

#[tokio::test]
async fn test_queue_positions_follow_creation_order() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config(&temp);
    config.admission.per_user_cap = 1;
    let service = SolverService::open(config).unwrap();
    let alice = Principal::user("alice");

    let mut positions = Vec::new();
    for _ in 0..4 {
        let receipt = service.submit(&alice, SubmitRequest::default()).await.unwrap();
        positions.push(receipt.queue_position.unwrap());
    }
    assert_eq!(positions, vec![1, 2, 3, 4]);

    let statuses: Vec<TaskStatus> = service
        .list(&alice, None)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.status)
        .collect();
    assert_eq!(statuses[0], TaskStatus::Pending);
    assert!(statuses[1..].iter().all(|s| *s == TaskStatus::Queued));
}

// =============================================================================
// CLI
// =============================================================================

mod cli {
    use assert_cmd::Command;
    use predicates::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn sd(temp: &TempDir) -> Command {
        let config = temp.path().join("solverd.yml");
        fs::write(
            &config,
            format!("storage:\n  data-dir: {}\n", temp.path().join("data").display()),
        )
        .unwrap();
        let mut cmd = Command::cargo_bin("sd").unwrap();
        cmd.env("XDG_DATA_HOME", temp.path())
            .env("HOME", temp.path())
            .arg("--config")
            .arg(config);
        cmd
    }

    #[test]
    fn test_help_lists_subcommands() {
        Command::cargo_bin("sd")
            .unwrap()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("submit").and(predicate::str::contains("capacity")));
    }

    #[test]
    fn test_submit_then_list_and_status() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("system.txt");
        fs::write(&input, "2 1 3\n1 3 5\n").unwrap();

        let output = sd(&temp)
            .args(["--format", "json", "submit"])
            .arg(&input)
            .args(["--user", "alice"])
            .output()
            .unwrap();
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        let view: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(view["status"], "queued");
        assert_eq!(view["matrix_size"], 2);
        let id = view["id"].as_str().unwrap().to_string();

        sd(&temp)
            .args(["list", "--status", "queued"])
            .assert()
            .success()
            .stdout(predicate::str::contains(id.as_str()));

        sd(&temp)
            .args(["status", &id, "--user", "bob"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Not authorized"));

        sd(&temp)
            .args(["cancel", &id, "--user", "alice"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cancelled"));
    }

    #[test]
    fn test_invalid_input_is_rejected() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("bad.txt");
        fs::write(&input, "1 2 x\n3 4 5\n").unwrap();

        sd(&temp)
            .arg("submit")
            .arg(&input)
            .args(["--user", "alice"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Rejected").and(predicate::str::contains("Invalid input")));
    }
}
