#![cfg(unix)]

use std::time::Duration;

use agent_exec_core::ExecuteRequest;
use agent_exec_core::OrchestratorConfig;
use agent_exec_core::ProcessControlAction;
use agent_exec_core::ProcessControlParams;
use agent_exec_core::ProcessControlStatus;
use agent_exec_core::ProcessEventKind;
use agent_exec_core::ProcessFailure;
use agent_exec_core::ProcessId;
use agent_exec_core::ProcessManager;
use agent_exec_core::ProcessMode;
use agent_exec_core::ProcessStatus;
use assert_matches::assert_matches;
use core_test_support::TEST_DEADLINE;
use core_test_support::snapshot;
use core_test_support::test_config;
use core_test_support::test_manager;
use core_test_support::wait_for;
use pretty_assertions::assert_eq;

async fn active_running_count(manager: &ProcessManager) -> usize {
    manager
        .list()
        .await
        .into_iter()
        .filter(|snapshot| snapshot.is_active)
        .count()
}

fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    unsafe { libc::kill(pid, 0) == 0 }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_echo_completes_with_output() {
    let manager = test_manager();
    let id = manager
        .execute(ExecuteRequest::background("echo hi"))
        .await
        .expect("execute");

    let outcome = manager.wait_for_completion(id).await.expect("outcome");
    assert!(outcome.completed);
    let done = snapshot(&manager, id).await;
    assert_eq!(done.record.status, ProcessStatus::Completed);
    assert_eq!(done.record.stdout, "hi\n");
    assert_eq!(done.record.exit_code, Some(0));
    assert_eq!(done.record.mode, ProcessMode::Background);
    assert!(done.record.end_time.is_some());
    assert!(!done.is_active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn active_command_reports_completion_to_waiter() {
    let manager = test_manager();
    let id = manager
        .execute(ExecuteRequest::active("echo out; echo err 1>&2"))
        .await
        .expect("execute");

    let outcome = manager.wait_for_completion(id).await.expect("outcome");
    assert!(outcome.completed);
    assert_eq!(outcome.status, ProcessStatus::Completed);
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.stdout, "out\n");
    assert_eq!(outcome.stderr, "err\n");
    assert_eq!(outcome.mode, ProcessMode::Active);
    assert_eq!(manager.slot_state().await.expect("slot state").holder, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiting_on_background_process_blocks_until_it_exits() {
    let manager = test_manager();
    let id = manager
        .execute(ExecuteRequest::background("sleep 0.2; echo x"))
        .await
        .expect("execute");

    let outcome = tokio::time::timeout(TEST_DEADLINE, manager.wait_for_completion(id))
        .await
        .expect("finished in time")
        .expect("outcome");
    assert!(outcome.completed);
    assert_eq!(outcome.status, ProcessStatus::Completed);
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.stdout, "x\n");
    assert_eq!(outcome.mode, ProcessMode::Background);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiting_after_demotion_resolves_immediately() {
    let manager = test_manager();
    let id = manager
        .execute(ExecuteRequest::active("echo early; sleep 30").with_timeout_ms(0))
        .await
        .expect("execute");
    wait_for("first output", || {
        let manager = manager.clone();
        async move {
            let current = manager.get(id).await?;
            current.record.stdout.contains("early").then_some(())
        }
    })
    .await;
    assert!(manager.demote(id).await);

    let outcome = tokio::time::timeout(Duration::from_millis(500), manager.wait_for_completion(id))
        .await
        .expect("resolved without waiting for exit")
        .expect("outcome");
    assert!(!outcome.completed);
    assert_eq!(outcome.status, ProcessStatus::Running);
    assert_eq!(outcome.exit_code, None);
    assert_eq!(outcome.stdout, "early\n");
    assert_eq!(outcome.mode, ProcessMode::Background);

    let follow = tokio::spawn({
        let manager = manager.clone();
        async move { manager.wait_for_exit(id).await }
    });
    assert!(manager.kill(id).await);
    let finished = follow.await.expect("follow task").expect("outcome");
    assert!(finished.completed);
    assert_eq!(finished.status, ProcessStatus::Killed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_zero_exit_is_failed_with_code() {
    let manager = test_manager();
    let id = manager
        .execute(ExecuteRequest::active("echo boom 1>&2; exit 3"))
        .await
        .expect("execute");

    let outcome = manager.wait_for_completion(id).await.expect("outcome");
    assert_eq!(outcome.status, ProcessStatus::Failed);
    assert_eq!(outcome.exit_code, Some(3));
    assert_eq!(outcome.stderr, "boom\n");
    let record = snapshot(&manager, id).await.record;
    assert_eq!(
        record.failure,
        Some(ProcessFailure::NonZeroExit { exit_code: 3 })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn active_timeout_demotes_without_killing() {
    let manager = test_manager();
    let mut events = manager.subscribe();
    let id = manager
        .execute(ExecuteRequest::active("sleep 5").with_timeout_ms(100))
        .await
        .expect("execute");

    let outcome = tokio::time::timeout(Duration::from_secs(2), manager.wait_for_completion(id))
        .await
        .expect("demoted in time")
        .expect("outcome");
    assert!(!outcome.completed);
    assert_eq!(outcome.status, ProcessStatus::Running);
    assert_eq!(outcome.exit_code, None);
    assert_eq!(outcome.mode, ProcessMode::Background);

    let current = snapshot(&manager, id).await;
    assert_eq!(current.record.mode, ProcessMode::Background);
    assert_eq!(current.record.status, ProcessStatus::Running);
    assert!(current.record.pid.is_some());
    assert_eq!(manager.slot_state().await.expect("slot state").holder, None);

    let timeout = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if let ProcessEventKind::Timeout { timeout_ms } = event.kind
                && event.process_id == id
            {
                return Some(timeout_ms);
            }
        }
        None
    })
    .await
    .expect("timeout event in time");
    assert_eq!(timeout, Some(100));

    assert!(manager.kill(id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_active_request_waits_for_demotion() {
    let manager = test_manager();
    let first = manager
        .execute(ExecuteRequest::active("sleep 10").with_timeout_ms(50))
        .await
        .expect("execute first");

    let second = manager
        .execute(ExecuteRequest::active("echo second"))
        .await
        .expect("execute second");
    assert_ne!(first, second);

    // The second request could only start once the first gave the slot up.
    let first_now = snapshot(&manager, first).await;
    assert_eq!(first_now.record.mode, ProcessMode::Background);
    assert_eq!(first_now.record.status, ProcessStatus::Running);

    let outcome = manager.wait_for_completion(second).await.expect("outcome");
    assert_eq!(outcome.stdout, "second\n");
    assert!(manager.kill(first).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_escalates_when_term_is_ignored() {
    let manager = ProcessManager::new(OrchestratorConfig {
        kill_grace_period_ms: 300,
        ..test_config()
    });
    let id = manager
        .execute(ExecuteRequest::background(
            "trap '' TERM; echo ready; while :; do sleep 1; done",
        ))
        .await
        .expect("execute");
    let pid = wait_for("trap installed", || {
        let manager = manager.clone();
        async move {
            let current = manager.get(id).await?;
            current
                .record
                .stdout
                .contains("ready")
                .then_some(current.record.pid)
                .flatten()
        }
    })
    .await;

    let mut events = manager.subscribe_process(id);
    let started = tokio::time::Instant::now();
    assert!(manager.kill(id).await);

    let killed = snapshot(&manager, id).await;
    assert_eq!(killed.record.status, ProcessStatus::Killed);
    assert!(killed.record.end_time.is_some());
    assert_matches!(
        events.recv().await.map(|event| event.kind),
        Some(ProcessEventKind::Killed { .. })
    );

    wait_for("process to be force-killed", || async move {
        (!pid_alive(pid)).then_some(())
    })
    .await;
    assert!(started.elapsed() < TEST_DEADLINE);
    assert!(started.elapsed() >= Duration::from_millis(250));

    // A second kill is an invalid transition.
    assert!(!manager.kill(id).await);
    assert_eq!(
        snapshot(&manager, id).await.record.status,
        ProcessStatus::Killed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_of_active_process_frees_the_slot() {
    let manager = test_manager();
    let id = manager
        .execute(ExecuteRequest::active("sleep 30").with_timeout_ms(0))
        .await
        .expect("execute");
    assert_eq!(
        manager.slot_state().await.expect("slot state").holder,
        Some(id)
    );

    let waiter = tokio::spawn({
        let manager = manager.clone();
        async move { manager.wait_for_completion(id).await }
    });
    assert!(manager.kill(id).await);

    let outcome = waiter.await.expect("waiter task").expect("outcome");
    assert!(outcome.completed);
    assert_eq!(outcome.status, ProcessStatus::Killed);
    assert_eq!(outcome.exit_code, None);

    let next = tokio::time::timeout(
        Duration::from_secs(2),
        manager.execute(ExecuteRequest::active("true")),
    )
    .await
    .expect("slot available after kill")
    .expect("execute");
    manager.wait_for_completion(next).await.expect("outcome");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_promote_never_creates_two_active_processes() {
    let manager = test_manager();
    let background = manager
        .execute(ExecuteRequest::background("sleep 30"))
        .await
        .expect("execute background");
    let active = manager
        .execute(ExecuteRequest::active("sleep 30").with_timeout_ms(0))
        .await
        .expect("execute active");

    let promote = tokio::spawn({
        let manager = manager.clone();
        async move { manager.promote(background).await }
    });

    let state = wait_for("promote to queue", || {
        let manager = manager.clone();
        async move {
            let state = manager.slot_state().await.ok()?;
            (!state.queued.is_empty()).then_some(state)
        }
    })
    .await;
    assert_eq!(state.holder, Some(active));
    assert_eq!(state.queued, vec![background]);
    assert_eq!(
        snapshot(&manager, background).await.record.mode,
        ProcessMode::Background
    );
    assert_eq!(active_running_count(&manager).await, 1);

    assert!(manager.demote(active).await);
    assert!(promote.await.expect("promote task"));

    assert_eq!(
        snapshot(&manager, background).await.record.mode,
        ProcessMode::Active
    );
    assert_eq!(
        snapshot(&manager, active).await.record.mode,
        ProcessMode::Background
    );
    assert_eq!(active_running_count(&manager).await, 1);
    assert_eq!(
        manager.slot_state().await.expect("slot state").holder,
        Some(background)
    );

    assert!(manager.kill(background).await);
    assert!(manager.kill(active).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_transitions_return_false() {
    let manager = test_manager();
    let unknown = ProcessId::new();
    assert!(!manager.demote(unknown).await);
    assert!(!manager.promote(unknown).await);
    assert!(!manager.kill(unknown).await);
    assert!(manager.wait_for_completion(unknown).await.is_none());

    let id = manager
        .execute(ExecuteRequest::background("sleep 30"))
        .await
        .expect("execute");
    assert!(!manager.demote(id).await, "background cannot be demoted");
    assert!(manager.promote(id).await);
    assert!(!manager.promote(id).await, "already active");
    assert!(manager.demote(id).await);
    assert!(manager.kill(id).await);
    assert!(!manager.promote(id).await, "killed cannot be promoted");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_demote_emits_mode_changed() {
    let manager = test_manager();
    let id = manager
        .execute(ExecuteRequest::active("sleep 30").with_timeout_ms(60_000))
        .await
        .expect("execute");
    let mut events = manager.subscribe_process(id);
    let waiter = tokio::spawn({
        let manager = manager.clone();
        async move { manager.wait_for_completion(id).await }
    });

    assert!(manager.demote(id).await);
    assert_eq!(
        events.recv().await.map(|event| event.kind),
        Some(ProcessEventKind::ModeChanged {
            from: ProcessMode::Active,
            to: ProcessMode::Background,
        })
    );
    let outcome = waiter.await.expect("waiter task").expect("outcome");
    assert!(!outcome.completed);
    assert_eq!(outcome.mode, ProcessMode::Background);

    assert!(manager.kill(id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawn_failure_is_recorded_and_frees_the_slot() {
    let manager = test_manager();
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("gone");
    let id = manager
        .execute(ExecuteRequest::active("echo hi").with_cwd(&missing))
        .await
        .expect("execute");

    let record = snapshot(&manager, id).await.record;
    assert_eq!(record.status, ProcessStatus::Failed);
    assert_eq!(record.exit_code, None);
    assert_eq!(record.working_directory, missing);
    assert_matches!(record.failure, Some(ProcessFailure::Spawn { .. }));
    assert!(record.stderr.contains("failed to spawn"), "{}", record.stderr);

    let outcome = manager.wait_for_completion(id).await.expect("outcome");
    assert!(outcome.completed);
    assert_eq!(outcome.status, ProcessStatus::Failed);

    let next = tokio::time::timeout(
        Duration::from_secs(2),
        manager.execute(ExecuteRequest::active("true")),
    )
    .await
    .expect("slot released after spawn failure")
    .expect("execute");
    manager.wait_for_completion(next).await.expect("outcome");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lifecycle_events_arrive_in_order() {
    let manager = test_manager();
    let mut events = manager.subscribe();
    let id = manager
        .execute(ExecuteRequest::active("printf done"))
        .await
        .expect("execute");
    manager.wait_for_completion(id).await.expect("outcome");

    let mut names = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        assert_eq!(event.process_id, id);
        let terminal = event.kind.is_terminal();
        names.push(event.kind.name());
        if terminal {
            break;
        }
    }
    assert_eq!(names, vec!["started", "output", "completed"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_queued_request_is_withdrawn() {
    let manager = test_manager();
    let holder = manager
        .execute(ExecuteRequest::active("sleep 30").with_timeout_ms(0))
        .await
        .expect("execute");

    let queued = tokio::time::timeout(
        Duration::from_millis(100),
        manager.execute(ExecuteRequest::active("echo never")),
    )
    .await;
    assert!(queued.is_err(), "request should still be queued");

    assert!(manager.demote(holder).await);
    wait_for("slot to be free", || {
        let manager = manager.clone();
        async move {
            let state = manager.slot_state().await.ok()?;
            (state.holder.is_none() && state.queued.is_empty()).then_some(())
        }
    })
    .await;
    assert_eq!(manager.list().await.len(), 1);

    assert!(manager.kill(holder).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_active_requests_run_one_at_a_time() {
    let manager = test_manager();
    let tasks = (0..4)
        .map(|idx| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let id = manager
                    .execute(ExecuteRequest::active(format!("sleep 0.1; echo {idx}")))
                    .await
                    .expect("execute");
                manager.wait_for_completion(id).await.expect("outcome")
            })
        })
        .collect::<Vec<_>>();

    let sampler = tokio::spawn({
        let manager = manager.clone();
        async move {
            let mut max_active = 0;
            for _ in 0..60 {
                max_active = max_active.max(active_running_count(&manager).await);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            max_active
        }
    });

    for task in tasks {
        let outcome = task.await.expect("task");
        assert_eq!(outcome.status, ProcessStatus::Completed);
    }
    assert!(sampler.await.expect("sampler") <= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn output_retention_keeps_the_tail() {
    let manager = ProcessManager::new(OrchestratorConfig {
        output_retention_bytes: Some(16),
        ..test_config()
    });
    let id = manager
        .execute(ExecuteRequest::active(
            "i=0; while [ $i -lt 20 ]; do echo line$i; i=$((i+1)); done",
        ))
        .await
        .expect("execute");
    manager.wait_for_completion(id).await.expect("outcome");

    let record = snapshot(&manager, id).await.record;
    assert!(record.stdout_truncated);
    assert!(!record.stderr_truncated);
    assert!(record.stdout.len() <= 16, "{:?}", record.stdout);
    assert!(record.stdout.ends_with("line19\n"), "{:?}", record.stdout);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_maps_outcomes_to_statuses() {
    let manager = test_manager();
    let id = manager
        .execute(ExecuteRequest::active("sleep 30").with_timeout_ms(0))
        .await
        .expect("execute");

    let response = manager
        .control(ProcessControlParams::new(id, ProcessControlAction::Promote))
        .await;
    assert_matches!(response.status, ProcessControlStatus::Reject(_));

    let response = manager
        .control(ProcessControlParams::new(id, ProcessControlAction::Demote))
        .await;
    assert_eq!(response.status, ProcessControlStatus::Ack);

    let response = manager
        .control(ProcessControlParams::new(id, ProcessControlAction::Kill))
        .await;
    assert_eq!(response.status, ProcessControlStatus::Ack);

    let response = manager
        .control(ProcessControlParams::new(id, ProcessControlAction::Kill))
        .await;
    assert_eq!(response.status, ProcessControlStatus::AlreadyTerminated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_reports_derived_fields() {
    let manager = test_manager();
    let first = manager
        .execute(ExecuteRequest::background("true"))
        .await
        .expect("execute");
    manager.wait_for_completion(first).await.expect("outcome");
    let second = manager
        .execute(ExecuteRequest::active("sleep 30").with_timeout_ms(0))
        .await
        .expect("execute");

    let listed = manager.list().await;
    let ids = listed.iter().map(|s| s.record.id).collect::<Vec<_>>();
    assert_eq!(ids, vec![first, second]);
    assert!(!listed[0].is_active);
    assert!(listed[1].is_active);

    let value = serde_json::to_value(&listed[1]).expect("serialize snapshot");
    assert_eq!(value["status"], "running");
    assert_eq!(value["mode"], "active");
    assert_eq!(value["is_active"], true);
    assert!(value["duration_ms"].is_u64());

    assert!(manager.kill(second).await);
}
