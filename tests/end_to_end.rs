use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use quarrel_core::event::EventBus;
use quarrel_core::routing::Route;
use quarrel_core::types::{SlotConfig, Submission, WorkflowEvent};
use quarrel_engine::{SessionOrchestrator, TranscriptLogger};
use quarrel_test_utils::{submission, test_config, ScriptedChannel, ScriptedConnector};

#[tokio::test(start_paused = true)]
async fn test_two_agent_trip_planning() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = test_config(dir.path());
    let bus = Arc::new(EventBus::new(128));
    let mut rx = bus.subscribe();

    let planner = ScriptedChannel::fixed("Itinerary").into_arc();
    let approver = ScriptedChannel::fixed("Approved").into_arc();
    let connector = Arc::new(
        ScriptedConnector::new()
            .with_channel(0, planner.clone())
            .with_channel(1, approver.clone()),
    );

    let transcript = TranscriptLogger::new(config.transcript_dir(), "trip");
    let transcript_path = transcript.path();
    let transcript_task = transcript.spawn(&bus, CancellationToken::new());

    let (mut orchestrator, _handle) = SessionOrchestrator::new(config, connector, bus.clone());
    let job = Submission {
        agent_slots: vec![
            SlotConfig::new("", "http://127.0.0.1:9100"),
            SlotConfig::new("", "http://127.0.0.1:9101"),
        ],
        role_directives: Vec::new(),
        workflow_text: "USER -> 1\n1 -> 2".to_string(),
        initial_task: "Plan a trip".to_string(),
    };
    let report = orchestrator.run_submission(job).await.expect("run succeeds");

    assert_eq!(report.outputs.len(), 2);
    assert_eq!(report.output(0), Some("Itinerary"));
    assert_eq!(report.output(1), Some("Approved"));
    assert!(approver.prompts()[0].contains("[Agent1]: Itinerary"));

    let mut completed = false;
    while let Ok(event) = rx.try_recv() {
        if let WorkflowEvent::RunComplete { run_id, steps, .. } = event {
            assert_eq!(run_id, report.run_id);
            assert_eq!(steps, 2);
            completed = true;
        }
    }
    assert!(completed, "run-complete signal published");

    drop(orchestrator);
    drop(bus);
    transcript_task.await.expect("transcript task");

    let log = std::fs::read_to_string(transcript_path).expect("transcript written");
    assert!(log.starts_with("# Quarrel Workflow Log - trip\n"));
    assert!(log.contains("> TASK: Plan a trip\n"));
    assert!(log.contains("**Agent1**: Itinerary\n"));
    assert!(log.contains("**Agent2**: Approved\n"));
    assert!(log.contains("> DONE (2 steps, 0 timeouts"));
}

#[tokio::test(start_paused = true)]
async fn test_routing_file_and_roles_shape_dispatch() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = test_config(dir.path());
    std::fs::write(
        config.routing_path(),
        r#"{"selectors":[{"keyword":"claude","input":"compose","reply":"answer"}]}"#,
    )
    .expect("write routing file");

    let claude = ScriptedChannel::fixed("Draft").into_arc();
    let other = ScriptedChannel::fixed("Critique").into_arc();
    let connector = Arc::new(
        ScriptedConnector::new()
            .with_channel(0, claude.clone())
            .with_channel(1, other.clone()),
    );

    let (mut orchestrator, _handle) =
        SessionOrchestrator::new(config, connector, Arc::new(EventBus::default()));
    let mut job = submission(&["Claude Opus", "Gemini"], "USER -> 1\n1 -> 2", "Write a haiku");
    job.role_directives = vec![String::new(), "You are a strict critic.".to_string()];
    orchestrator.run_submission(job).await.expect("run succeeds");

    assert_eq!(claude.routes(), vec![Route::new("compose", "answer")]);
    assert_eq!(other.routes(), vec![Route::new("prompt", "reply")]);
    assert_eq!(claude.prompts()[0], "CTX:\nWrite a haiku\n\nREPLY:");
    assert_eq!(
        other.prompts()[0],
        "ROLE:You are a strict critic.\nCTX:\n[Claude Opus]: Draft\n\nREPLY:"
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_snapshot_lands_in_debug_dir() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = test_config(dir.path());
    let debug_dir = config.debug_dir();

    let stuck = ScriptedChannel::never_settles()
        .with_snapshot("<html>typing...</html>")
        .into_arc();
    let connector = Arc::new(ScriptedConnector::new().with_channel(0, stuck.clone()));

    let (mut orchestrator, _handle) =
        SessionOrchestrator::new(config, connector, Arc::new(EventBus::default()));
    let report = orchestrator
        .run_submission(submission(&["Slow"], "USER -> 1", "hello"))
        .await
        .expect("run succeeds");

    assert_eq!(report.timeouts, 1);
    assert_eq!(report.output(0), Some("(TIMEOUT)"));
    assert_eq!(stuck.snapshots_taken(), 1);

    let snapshots: Vec<_> = std::fs::read_dir(debug_dir)
        .expect("debug dir exists")
        .map(|e| e.expect("dir entry").file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].ends_with("-Slow-timeout.html"));
}
