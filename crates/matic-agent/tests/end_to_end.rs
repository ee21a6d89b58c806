//! End-to-end exercises: manager, channels and jobs against a scripted
//! fake agent over a mock pipe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use matic_agent::job::WalkPolicy;
use matic_agent::{AgentManager, Event, Handle};
use matic_core::constants::{DEFAULT_POLL_INTERVAL, TIMEOUT_MARGIN};
use matic_core::proto::{Buffer, Opcode, ResponseKind, family};
use matic_test_utils::{FakeAgent, MockPipe};

const MAGIC: u64 = 0x1b90_f02e_10d5_1500;

fn manager() -> Arc<AgentManager> {
    Arc::new(AgentManager::new())
}

/// Let the agent poll once and trade frames with the manager until the
/// exchange goes quiet.
fn pump(mgr: &AgentManager, pipe: &mut MockPipe, agent: &mut FakeAgent, now: Instant) {
    pipe.push_inbound(agent.announce());
    loop {
        mgr.dispatch(pipe, now).expect("dispatch");
        let Some(wire) = pipe.take_written() else {
            break;
        };
        match agent.handle(&wire).expect("agent") {
            Some(reply) => pipe.push_inbound(reply),
            None => break,
        }
    }
}

fn connected_handle(
    mgr: &Arc<AgentManager>,
    pipe: &mut MockPipe,
    agent: &mut FakeAgent,
    now: Instant,
) -> Handle {
    pump(mgr, pipe, agent, now);
    let handle = mgr.open().unwrap();
    handle.connect("hostname0").unwrap();
    assert!(handle.is_connected().unwrap());
    handle
}

#[test]
fn announce_registers_channel_with_name_and_ordinal() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");

    pump(&mgr, &mut pipe, &mut agent, Instant::now());
    assert_eq!(mgr.channel_ids().unwrap(), vec!["hostname0".to_string()]);

    // Same name, different identity: next ordinal.
    let mut pipe2 = MockPipe::new();
    let mut agent2 = FakeAgent::new(0x1b90_f02e_0000_0002, "hostname");
    pump(&mgr, &mut pipe2, &mut agent2, Instant::now());
    assert_eq!(
        mgr.channel_ids().unwrap(),
        vec!["hostname0".to_string(), "hostname1".to_string()]
    );
}

#[test]
fn connect_matches_exact_name_and_path_tiers() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    pump(&mgr, &mut pipe, &mut agent, Instant::now());

    let exact = mgr.open().unwrap();
    exact.connect("hostname0").unwrap();
    assert_eq!(exact.channel_id().unwrap().as_deref(), Some("hostname0"));

    let by_name = mgr.open().unwrap();
    by_name.connect("host").unwrap();
    assert!(by_name.is_connected().unwrap());

    let by_path = mgr.open().unwrap();
    by_path.connect("agent_manager.hostname0").unwrap();
    assert!(by_path.is_connected().unwrap());
}

#[test]
fn pending_connect_resolves_when_agent_announces() {
    let mgr = manager();
    let handle = mgr.open().unwrap();
    handle.connect("hostname").unwrap();
    assert!(!handle.is_connected().unwrap());

    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    pump(&mgr, &mut pipe, &mut agent, Instant::now());

    assert!(handle.is_connected().unwrap());
    let events = mgr.take_events().unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Connected { channel_id, .. } if channel_id == "hostname0")));
}

#[test]
fn duplicate_identity_with_other_name_is_rejected() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    pump(&mgr, &mut pipe, &mut agent, Instant::now());

    let mut intruder = FakeAgent::new(MAGIC, "impostor");
    pipe.push_inbound(intruder.announce());
    assert!(mgr.dispatch(&mut pipe, Instant::now()).is_err());
}

#[test]
fn download_job_fetches_remote_file() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    agent.add_file("/data/greeting.txt", b"hello matic".to_vec());
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("greeting.txt");
    let job = handle.download("/data/greeting.txt", &local).unwrap();

    pump(&mgr, &mut pipe, &mut agent, now);

    let report = handle.finished_job(job).unwrap().expect("finished");
    assert!(report.succeeded(), "report: {report:?}");
    assert_eq!(std::fs::read(&local).unwrap(), b"hello matic");
    assert!(report.summary.contains("11 bytes"));
}

#[test]
fn upload_job_stores_remote_file() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    agent.add_dir("/data");
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("up.txt");
    std::fs::write(&local, b"payload").unwrap();
    let job = handle.upload(&local, "/data/up.txt").unwrap();

    pump(&mgr, &mut pipe, &mut agent, now);

    let report = handle.finished_job(job).unwrap().expect("finished");
    assert!(report.succeeded(), "report: {report:?}");
    assert_eq!(agent.file("/data/up.txt"), Some(b"payload".as_slice()));
    assert_eq!(agent.open_tickets(), 0);
}

#[test]
fn large_upload_is_chunked_to_the_write_buffer() {
    let mgr = manager();
    let mut pipe = MockPipe::new().with_buffer_sizes(4096, 256);
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    agent.add_dir("/data");
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);

    let body: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("big.bin");
    std::fs::write(&local, &body).unwrap();
    let job = handle.upload(&local, "/data/big.bin").unwrap();

    pump(&mgr, &mut pipe, &mut agent, now);

    let report = handle.finished_job(job).unwrap().expect("finished");
    assert!(report.succeeded(), "report: {report:?}");
    assert_eq!(agent.file("/data/big.bin"), Some(body.as_slice()));
}

#[test]
fn run_job_captures_output_and_exit_status() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    agent.add_command("uname -r", b"6.1.0-matic\n".to_vec(), 0);
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);

    let job = handle.run("uname -r").unwrap();
    pump(&mgr, &mut pipe, &mut agent, now);

    let report = handle.finished_job(job).unwrap().expect("finished");
    assert!(report.succeeded());
    assert_eq!(report.output, "6.1.0-matic\n");
    assert!(report.summary.contains("status 0"));
}

#[test]
fn failed_job_reports_agent_errno() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);

    let dir = tempfile::tempdir().unwrap();
    let job = handle
        .download("/no/such/file", dir.path().join("x"))
        .unwrap();
    pump(&mgr, &mut pipe, &mut agent, now);

    let report = handle.finished_job(job).unwrap().expect("finished");
    let (errno, message) = report.error.clone().expect("error recorded");
    assert_eq!(errno, 2);
    assert!(message.contains("No such file"));
    // A failed job never takes the channel down.
    assert_eq!(mgr.channel_ids().unwrap(), vec!["hostname0".to_string()]);
}

#[test]
fn upload_dir_skips_existing_creates_missing_and_reports() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    agent.add_file("/target/a.txt", b"old remote".to_vec());
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"new local").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/b.txt"), b"beta").unwrap();

    let job = handle
        .upload_dir(dir.path(), "/target", WalkPolicy::default())
        .unwrap();
    pump(&mgr, &mut pipe, &mut agent, now);

    let report = handle.finished_job(job).unwrap().expect("finished");
    assert!(report.succeeded(), "report: {report:?}");

    // a.txt existed: untouched. sub/ was created, b.txt copied.
    assert_eq!(agent.file("/target/a.txt"), Some(b"old remote".as_slice()));
    assert!(agent.has_dir("/target/sub"));
    assert_eq!(agent.file("/target/sub/b.txt"), Some(b"beta".as_slice()));

    assert!(report.output.contains("skipped /target/a.txt"));
    assert!(report.output.contains("created /target/sub"));
    assert!(report.output.contains("uploaded /target/sub/b.txt"));
    assert!(report.summary.contains("uploaded 1 file"));
    assert!(report.summary.contains("created 1 directory"));
}

#[test]
fn download_dir_mirrors_remote_tree() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    agent.add_dir("/src");
    agent.add_file("/src/a.txt", b"alpha".to_vec());
    agent.add_file("/src/sub/c.txt", b"gamma".to_vec());
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("mirror");
    let job = handle
        .download_dir("/src", &local, WalkPolicy::default())
        .unwrap();
    pump(&mgr, &mut pipe, &mut agent, now);

    let report = handle.finished_job(job).unwrap().expect("finished");
    assert!(report.succeeded(), "report: {report:?}");
    assert_eq!(std::fs::read(local.join("a.txt")).unwrap(), b"alpha");
    assert_eq!(std::fs::read(local.join("sub/c.txt")).unwrap(), b"gamma");
}

#[test]
fn jobs_run_in_queue_order() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    agent.add_dir("/data");
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("f.txt");
    std::fs::write(&local, b"first").unwrap();
    let up = handle.upload(&local, "/data/f.txt").unwrap();
    let down_local = dir.path().join("copy.txt");
    let down = handle.download("/data/f.txt", &down_local).unwrap();

    pump(&mgr, &mut pipe, &mut agent, now);

    // The download sees the file the upload created in the same queue.
    assert!(handle.finished_job(up).unwrap().unwrap().succeeded());
    assert!(handle.finished_job(down).unwrap().unwrap().succeeded());
    assert_eq!(std::fs::read(&down_local).unwrap(), b"first");
}

#[test]
fn cancelled_queued_job_never_reaches_the_agent() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    agent.add_command("reboot", b"".to_vec(), 0);
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);

    let keep = handle.time_get().unwrap();
    let drop = handle.run("reboot").unwrap();
    assert!(handle.cancel(drop).unwrap());

    pump(&mgr, &mut pipe, &mut agent, now);

    assert!(handle.finished_job(keep).unwrap().unwrap().succeeded());
    let dropped = handle.finished_job(drop).unwrap().expect("report kept");
    assert!(dropped.cancelled);
}

#[test]
fn poll_interval_job_changes_the_idle_ack() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);

    assert_eq!(
        agent.acked_poll_ms(),
        Some(DEFAULT_POLL_INTERVAL.as_millis() as u32)
    );

    let job = handle.set_poll_interval(Duration::from_millis(2500)).unwrap();
    pump(&mgr, &mut pipe, &mut agent, now);
    assert!(handle.finished_job(job).unwrap().unwrap().succeeded());

    pump(&mgr, &mut pipe, &mut agent, now);
    assert_eq!(agent.acked_poll_ms(), Some(2500));
}

#[test]
fn missed_deadline_makes_channel_and_handles_stale() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);
    let job = handle.time_get().unwrap();

    let late = now + DEFAULT_POLL_INTERVAL + TIMEOUT_MARGIN + Duration::from_secs(1);
    mgr.tick(late).unwrap();

    assert!(handle.is_stale().unwrap());
    assert!(mgr.channel_ids().unwrap().is_empty());
    let events = mgr.take_events().unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ChannelLost { reason, .. } if reason.contains("timed out"))));
    assert!(handle.finished_job(job).unwrap().unwrap().cancelled);

    // Stale handles refuse new work.
    assert!(handle.time_get().is_err());
}

#[test]
fn quit_job_retires_channel() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);

    let job = handle.quit_agent(0).unwrap();
    pump(&mgr, &mut pipe, &mut agent, now);

    assert!(handle.finished_job(job).unwrap().unwrap().succeeded());
    assert!(handle.is_stale().unwrap());
    assert!(mgr.channel_ids().unwrap().is_empty());
}

#[test]
fn restarted_agent_reannounces_on_fresh_channel() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);

    handle.restart_agent().unwrap();
    pump(&mgr, &mut pipe, &mut agent, now);
    assert!(handle.is_stale().unwrap());

    // The restarted agent comes back under the next ordinal.
    let mut restarted = FakeAgent::new(MAGIC, "hostname");
    pump(&mgr, &mut pipe, &mut restarted, now);
    assert_eq!(mgr.channel_ids().unwrap(), vec!["hostname1".to_string()]);
}

#[test]
fn unsolicited_reply_retires_the_channel() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);

    let mut stray = Buffer::new(
        MAGIC,
        Opcode::request(family::TIME_GET).response(ResponseKind::Data),
        99,
        false,
        4096,
    );
    stray.write_u64(0).unwrap();
    pipe.push_inbound(stray.to_wire());

    assert!(mgr.dispatch(&mut pipe, now).is_err());
    assert!(handle.is_stale().unwrap());
    let events = mgr.take_events().unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ChannelLost { reason, .. } if reason.contains("protocol"))));
}

#[test]
fn byte_swapped_pipe_round_trips() {
    let mgr = manager();
    let mut pipe = MockPipe::new().with_swap();
    let mut agent = FakeAgent::new(MAGIC, "hostname").with_swap();
    agent.add_file("/data/x", b"swapped".to_vec());
    let now = Instant::now();
    let handle = connected_handle(&mgr, &mut pipe, &mut agent, now);

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("x");
    let job = handle.download("/data/x", &local).unwrap();
    pump(&mgr, &mut pipe, &mut agent, now);

    assert!(handle.finished_job(job).unwrap().unwrap().succeeded());
    assert_eq!(std::fs::read(&local).unwrap(), b"swapped");
}

#[test]
fn channel_survives_until_last_handle_disconnects() {
    let mgr = manager();
    let mut pipe = MockPipe::new();
    let mut agent = FakeAgent::new(MAGIC, "hostname");
    let now = Instant::now();
    pump(&mgr, &mut pipe, &mut agent, now);

    let first = mgr.open().unwrap();
    first.connect("hostname0").unwrap();
    let second = mgr.open().unwrap();
    second.connect("hostname0").unwrap();

    first.disconnect().unwrap();
    assert_eq!(mgr.channel_ids().unwrap(), vec!["hostname0".to_string()]);

    second.disconnect().unwrap();
    assert!(mgr.channel_ids().unwrap().is_empty());
}
