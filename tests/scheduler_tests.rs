use std::path::{Path, PathBuf};

use cindexd::config::{ServerConfig, ServerOptions};
use cindexd::project::{IndexData, Project, Projects};
use cindexd::scheduler::{Action, IndexerJob, JobId, PoolStats, Scheduler};
use cindexd::source::Source;
use cindexd::unit::{JobFlags, Unit};

const PROJECT_ROOT: &str = "/proj";

fn test_config(job_count: usize, options: ServerOptions) -> ServerConfig {
    let mut config = ServerConfig::new(0, PathBuf::from("/tmp/cindexd-test.sock"));
    config.job_count = job_count;
    config.max_pending_preprocess = 10;
    config.reschedule_timeout_ms = 100;
    config.options = options;
    config
}

fn test_projects() -> Projects {
    let root = PathBuf::from(PROJECT_ROOT);
    let mut project = Project::new(root.clone());
    project.load();
    let mut projects = Projects::new();
    projects.insert(root, project);
    projects
}

fn make_unit(name: &str, preprocessed: bool) -> Unit {
    let command = format!("cc -c {}.c", name);
    let source = Source::parse(&command, Path::new(PROJECT_ROOT)).unwrap();
    let mut unit = Unit::new(source, JobFlags::COMPILE);
    if preprocessed {
        unit.preprocessed = format!("int {};", name).into_bytes();
    }
    unit
}

fn admit(scheduler: &mut Scheduler, name: &str, preprocessed: bool) -> JobId {
    let unit = make_unit(name, preprocessed);
    let job = IndexerJob::new(PathBuf::from(PROJECT_ROOT), unit, "/tmp/sock".into());
    let id = job.id;
    scheduler.add_job(job);
    id
}

fn result_for(scheduler: &Scheduler, id: JobId) -> IndexData {
    let job = scheduler.tables.job(id).unwrap();
    IndexData {
        job_id: id,
        key: job.unit.key(),
        file_id: 1,
        flags: job.flags(),
        project: PathBuf::from(PROJECT_ROOT),
        symbol_count: 10,
        message: String::new(),
    }
}

fn launched_ids(actions: &[Action]) -> Vec<JobId> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::LaunchLocal(id) => Some(*id),
            _ => None,
        })
        .collect()
}

fn notify_count(actions: &[Action]) -> usize {
    actions
        .iter()
        .filter(|a| matches!(a, Action::NotifyProject { .. }))
        .count()
}

#[test]
fn slots_bound_local_dispatch() {
    let mut scheduler = Scheduler::new(test_config(2, ServerOptions::NONE));
    let projects = test_projects();
    let a = admit(&mut scheduler, "a", true);
    let b = admit(&mut scheduler, "b", true);
    let _c = admit(&mut scheduler, "c", true);

    let actions = scheduler.work(0, PoolStats::default(), &projects);
    let launched = launched_ids(&actions);
    assert_eq!(launched, vec![a, b], "FIFO dispatch up to job_count");

    scheduler.local_launched(a, 100, 0);
    scheduler.local_launched(b, 101, 0);

    // slot accounting holds at work-loop exit
    assert!(
        scheduler.tables.local_jobs.len() + scheduler.tables.total_job_requests()
            <= scheduler.config().job_count
    );

    // no free slots: nothing more is launched
    let actions = scheduler.work(0, PoolStats::default(), &projects);
    assert!(launched_ids(&actions).is_empty());
    assert_eq!(scheduler.tables.pending.len(), 1);
}

#[test]
fn solo_compile_runs_without_announcing() {
    let mut scheduler = Scheduler::new(test_config(1, ServerOptions::NONE));
    let projects = test_projects();

    // standalone: compile skips the preprocess pool entirely
    let source = Source::parse("cc -c solo.c", Path::new(PROJECT_ROOT)).unwrap();
    scheduler.enqueue_compile(source, PathBuf::from(PROJECT_ROOT), JobFlags::COMPILE);
    assert!(scheduler.tables.pending_preprocess.is_empty());
    assert_eq!(scheduler.tables.pending.len(), 1);
    let id = scheduler.tables.pending[0];

    let actions = scheduler.work(0, PoolStats::default(), &projects);
    assert_eq!(launched_ids(&actions), vec![id]);
    assert!(!scheduler.announced(), "standalone nodes never announce");

    scheduler.local_launched(id, 200, 0);
    let data = result_for(&scheduler, id);
    let actions = scheduler.handle_indexer_message(data, false, &projects);
    assert_eq!(notify_count(&actions), 1);
    assert!(scheduler.tables.processing.is_empty());

    // the child exits cleanly afterwards; nothing further happens
    let actions = scheduler.handle_local_finished(200, 0, "", 10, &projects);
    assert_eq!(notify_count(&actions), 0);
    assert!(!scheduler.tables.is_live(id));
}

#[test]
fn surplus_is_shipped_to_requesting_peer() {
    // capacity 1, two compiles: one runs locally, the other is announced and
    // then shipped when a peer asks for two jobs
    let mut scheduler = Scheduler::new(test_config(1, ServerOptions::JOB_SERVER));
    let projects = test_projects();
    let a = admit(&mut scheduler, "a", true);
    let b = admit(&mut scheduler, "b", true);

    let actions = scheduler.work(0, PoolStats::default(), &projects);
    assert_eq!(launched_ids(&actions), vec![a]);
    scheduler.local_launched(a, 300, 0);
    assert!(scheduler.announced(), "surplus work must be announced");
    assert!(actions
        .iter()
        .any(|a| matches!(a, Action::Broadcast { .. })));

    let actions = scheduler.handle_job_request(7, 2);
    let Some(Action::SendJobResponse {
        conn,
        job_ids,
        finished,
    }) = actions.first()
    else {
        panic!("expected a job response, got {:?}", actions);
    };
    assert_eq!(*conn, 7);
    assert_eq!(job_ids, &vec![b], "only the non-running job ships");
    assert!(*finished, "we ran out before filling the request");

    // send completes: the job is now a tracked remote replica
    let actions = scheduler.job_response_sent(job_ids, *finished, 50);
    assert!(actions
        .iter()
        .any(|a| matches!(a, Action::StartRescheduleTimer)));
    assert!(scheduler.tables.processing.contains(&b));
    assert!(scheduler.tables.job(b).unwrap().flags().contains(JobFlags::REMOTE));
    assert!(!scheduler.announced(), "finished=true reopens announcements");
}

#[test]
fn jobs_lacking_preprocessed_content_are_never_offered() {
    let mut scheduler = Scheduler::new(test_config(0, ServerOptions::JOB_SERVER));
    let _bare = admit(&mut scheduler, "bare", false);
    let ready = admit(&mut scheduler, "ready", true);

    let actions = scheduler.handle_job_request(1, 5);
    let Some(Action::SendJobResponse { job_ids, finished, .. }) = actions.first() else {
        panic!("expected a job response");
    };
    assert_eq!(job_ids, &vec![ready]);
    assert!(*finished);
    // the unpreprocessed job stays queued for local dispatch
    assert_eq!(scheduler.tables.pending.len(), 1);
}

#[test]
fn reschedule_requeues_stalled_remote_and_drops_late_result() {
    let mut scheduler = Scheduler::new(test_config(1, ServerOptions::JOB_SERVER));
    let projects = test_projects();
    let id = admit(&mut scheduler, "stall", true);

    // ship the job to a peer
    let actions = scheduler.handle_job_request(3, 1);
    let Some(Action::SendJobResponse { job_ids, finished, .. }) = actions.first() else {
        panic!("expected a job response");
    };
    scheduler.job_response_sent(job_ids, *finished, 0);
    assert!(scheduler.tables.processing.contains(&id));

    // before the timeout: nothing happens, timer restarts
    let actions = scheduler.on_reschedule(50);
    assert!(actions
        .iter()
        .any(|a| matches!(a, Action::StartRescheduleTimer)));
    assert!(scheduler.tables.pending.is_empty());

    // past the timeout: re-queued locally but still tracked in processing
    let actions = scheduler.on_reschedule(200);
    assert!(actions.is_empty());
    assert_eq!(scheduler.tables.pending.len(), 1);
    assert!(scheduler.tables.processing.contains(&id));
    assert!(scheduler
        .tables
        .job(id)
        .unwrap()
        .flags()
        .contains(JobFlags::RESCHEDULED));

    // the replica runs locally and wins
    let actions = scheduler.work(300, PoolStats::default(), &projects);
    assert_eq!(launched_ids(&actions), vec![id]);
    scheduler.local_launched(id, 400, 300);
    let data = result_for(&scheduler, id);
    let actions = scheduler.handle_indexer_message(data.clone(), false, &projects);
    assert_eq!(notify_count(&actions), 1);
    assert!(scheduler
        .tables
        .job(id)
        .unwrap()
        .flags()
        .contains(JobFlags::COMPLETE_LOCAL));

    // the peer's late answer is a duplicate and is dropped
    let actions = scheduler.handle_indexer_message(data, true, &projects);
    assert_eq!(notify_count(&actions), 0, "first result wins, once");
}

#[test]
fn remote_result_wins_and_local_replica_is_ignored() {
    let mut scheduler = Scheduler::new(test_config(1, ServerOptions::JOB_SERVER));
    let projects = test_projects();
    let id = admit(&mut scheduler, "race", true);

    let actions = scheduler.handle_job_request(3, 1);
    let Some(Action::SendJobResponse { job_ids, finished, .. }) = actions.first() else {
        panic!("expected a job response");
    };
    scheduler.job_response_sent(job_ids, *finished, 0);
    scheduler.on_reschedule(200);
    assert_eq!(scheduler.tables.pending.len(), 1);

    // the original remote answers before the replica is dispatched
    let data = result_for(&scheduler, id);
    let actions = scheduler.handle_indexer_message(data, true, &projects);
    assert_eq!(notify_count(&actions), 1);

    // the work loop throws the completed replica away instead of launching it
    let actions = scheduler.work(300, PoolStats::default(), &projects);
    assert!(launched_ids(&actions).is_empty());
    assert!(scheduler.tables.pending.is_empty());
    assert!(!scheduler.tables.is_live(id));
}

#[test]
fn failed_send_requeues_jobs_and_keeps_peer() {
    let mut scheduler = Scheduler::new(test_config(0, ServerOptions::JOB_SERVER));
    scheduler.remotes.insert("10.0.0.5".into(), 9000);
    let id = admit(&mut scheduler, "lost", true);

    let actions = scheduler.handle_job_request(4, 1);
    let Some(Action::SendJobResponse { job_ids, .. }) = actions.first() else {
        panic!("expected a job response");
    };
    assert!(scheduler.tables.pending.is_empty());

    // connection died mid-send: the job reappears at the tail, unrescheduled
    scheduler.job_response_send_failed(job_ids);
    assert_eq!(scheduler.tables.pending.len(), 1);
    assert_eq!(scheduler.tables.pending[0], id);
    assert!(!scheduler
        .tables
        .job(id)
        .unwrap()
        .flags()
        .contains(JobFlags::RESCHEDULED));
    assert!(!scheduler.tables.processing.contains(&id));
    assert!(
        scheduler.remotes.contains("10.0.0.5"),
        "only finished=true evicts a peer"
    );
}

#[test]
fn announce_gate_reopens_on_new_client_and_on_finished_response() {
    let mut scheduler = Scheduler::new(test_config(0, ServerOptions::JOB_SERVER));
    let projects = test_projects();
    admit(&mut scheduler, "a", true);
    admit(&mut scheduler, "b", true);

    let actions = scheduler.work(0, PoolStats::default(), &projects);
    assert_eq!(
        actions
            .iter()
            .filter(|a| matches!(a, Action::Broadcast { .. }))
            .count(),
        1
    );
    assert!(scheduler.announced());

    // gated: no second announcement while the first stands
    let actions = scheduler.work(0, PoolStats::default(), &projects);
    assert!(actions.is_empty());

    // a client joining reopens the gate
    scheduler.handle_client_connected();
    assert!(!scheduler.announced());
    let actions = scheduler.work(0, PoolStats::default(), &projects);
    assert_eq!(
        actions
            .iter()
            .filter(|a| matches!(a, Action::Broadcast { .. }))
            .count(),
        1
    );
}

#[test]
fn incoming_announcement_registers_peer_and_reopens_gate() {
    let mut scheduler = Scheduler::new(test_config(1, ServerOptions::JOB_SERVER));
    let projects = test_projects();
    admit(&mut scheduler, "a", true);
    admit(&mut scheduler, "b", true);
    scheduler.work(0, PoolStats::default(), &projects);
    assert!(scheduler.announced());

    scheduler.handle_job_announcement("10.1.1.1".into(), 9000);
    assert!(scheduler.remotes.contains("10.1.1.1"));
    assert!(!scheduler.announced(), "a peer with fresh work reopens the gate");
}

#[test]
fn work_requests_jobs_from_one_peer_with_spare_slots() {
    let mut scheduler = Scheduler::new(test_config(3, ServerOptions::JOB_SERVER));
    let projects = test_projects();
    scheduler.remotes.insert("10.2.2.2".into(), 9000);

    let actions = scheduler.work(0, PoolStats::default(), &projects);
    let requests: Vec<_> = actions
        .iter()
        .filter_map(|a| match a {
            Action::RequestJobs { count } => Some(*count),
            _ => None,
        })
        .collect();
    assert_eq!(requests, vec![3], "all free slots are requested, once");
}

#[test]
fn no_local_compiles_clamps_slots() {
    let mut scheduler = Scheduler::new(test_config(
        4,
        ServerOptions::JOB_SERVER | ServerOptions::NO_LOCAL_COMPILES,
    ));
    let projects = test_projects();
    admit(&mut scheduler, "a", true);

    let actions = scheduler.work(0, PoolStats::default(), &projects);
    assert!(launched_ids(&actions).is_empty());
    assert!(scheduler.announced(), "work it cannot run is still announced");
}

#[test]
fn preprocess_drain_respects_admission_bound() {
    let mut config = test_config(2, ServerOptions::JOB_SERVER);
    config.max_pending_preprocess = 2;
    let mut scheduler = Scheduler::new(config);
    let projects = test_projects();

    for name in ["a", "b", "c", "d"] {
        let source = Source::parse(&format!("cc -c {}.c", name), Path::new(PROJECT_ROOT)).unwrap();
        scheduler.enqueue_compile(source, PathBuf::from(PROJECT_ROOT), JobFlags::COMPILE);
    }
    assert_eq!(scheduler.tables.pending_preprocess.len(), 4);

    let actions = scheduler.work(0, PoolStats::default(), &projects);
    let started = actions
        .iter()
        .filter(|a| matches!(a, Action::StartPreprocess(_)))
        .count();
    assert_eq!(started, 2);
    assert_eq!(scheduler.tables.pending_preprocess.len(), 2);

    // with the pool full, nothing more is admitted
    let actions = scheduler.work(0, PoolStats { busy: 2, backlog: 0 }, &projects);
    assert!(actions
        .iter()
        .all(|a| !matches!(a, Action::StartPreprocess(_))));
}

#[test]
fn from_remote_jobs_are_not_tracked_in_processing() {
    let mut scheduler = Scheduler::new(test_config(1, ServerOptions::JOB_SERVER));
    let projects = test_projects();

    let unit = make_unit("guest", true);
    let payload = cindexd::net::wire::JobPayload {
        id: 424242,
        unit,
        project: PathBuf::from(PROJECT_ROOT),
        blocked_files: Default::default(),
    };
    scheduler.handle_job_response(11, "10.3.3.3".into(), vec![payload], 9000, false);
    assert_eq!(scheduler.tables.pending.len(), 1);
    let id = scheduler.tables.pending[0];
    let job = scheduler.tables.job(id).unwrap();
    assert!(job.flags().contains(JobFlags::FROM_REMOTE));
    assert_eq!(job.wire_id(), 424242);
    assert_eq!(job.destination, "10.3.3.3");

    let actions = scheduler.work(0, PoolStats::default(), &projects);
    assert_eq!(launched_ids(&actions), vec![id]);
    assert!(
        scheduler.tables.processing.is_empty(),
        "we only track jobs we own"
    );
}

#[test]
fn finished_response_evicts_peer_from_registry() {
    let mut scheduler = Scheduler::new(test_config(1, ServerOptions::JOB_SERVER));
    scheduler.remotes.insert("10.4.4.4".into(), 9000);
    scheduler
        .tables
        .pending_job_requests
        .insert(21, 2);

    scheduler.handle_job_response(21, "10.4.4.4".into(), Vec::new(), 9000, true);
    assert!(!scheduler.remotes.contains("10.4.4.4"));
    assert!(scheduler.tables.pending_job_requests.is_empty());
}

#[test]
fn crashed_child_reports_after_grace_and_project_requests_retry() {
    let mut scheduler = Scheduler::new(test_config(1, ServerOptions::NONE));
    let mut projects = test_projects();
    let source = Source::parse("cc -c crashy.c", Path::new(PROJECT_ROOT)).unwrap();
    projects
        .get_mut(Path::new(PROJECT_ROOT))
        .unwrap()
        .add_source(source);

    let id = admit(&mut scheduler, "crashy", true);
    let actions = scheduler.work(0, PoolStats::default(), &projects);
    assert_eq!(launched_ids(&actions), vec![id]);
    scheduler.local_launched(id, 500, 0);

    let actions = scheduler.handle_local_finished(500, 1, "segfault", 100, &projects);
    let Some(Action::NotifyProject { data, job, delay_ms }) = actions.first() else {
        panic!("expected a delayed project notification");
    };
    assert_eq!(*delay_ms, scheduler.config().crash_retry_delay_ms);
    assert!(job.flags().contains(JobFlags::CRASHED));
    assert!(scheduler.tables.processing.is_empty());

    let project = projects.get_mut(Path::new(PROJECT_ROOT)).unwrap();
    let outcome = project.on_job_finished(data, job, 5);
    assert!(matches!(
        outcome,
        cindexd::project::JobOutcome::Retry(_)
    ));
}

#[test]
fn aborted_jobs_are_not_promoted_to_crashed() {
    let mut scheduler = Scheduler::new(test_config(1, ServerOptions::NONE));
    let projects = test_projects();
    let id = admit(&mut scheduler, "aborted", true);
    let actions = scheduler.work(0, PoolStats::default(), &projects);
    assert_eq!(launched_ids(&actions), vec![id]);
    scheduler.local_launched(id, 600, 0);

    scheduler.tables.job_mut(id).unwrap().abort();
    let actions = scheduler.handle_local_finished(600, 1, "killed", 100, &projects);
    // aborted: no crash promotion, and completion forwarding is suppressed
    assert_eq!(notify_count(&actions), 1);
    let Some(Action::NotifyProject { job, .. }) = actions.first() else {
        unreachable!();
    };
    assert!(!job.flags().contains(JobFlags::CRASHED));
    assert!(job.flags().contains(JobFlags::ABORTED));
}

#[test]
fn exit_orchestration_routes_by_topology() {
    // leaf with a job-server connection forwards upstream
    let mut scheduler = Scheduler::new(test_config(1, ServerOptions::NONE));
    scheduler.set_server_connected(true);
    let actions = scheduler.handle_exit(7, true);
    assert!(matches!(actions[0], Action::SendToServer(_)));
    assert!(matches!(actions[1], Action::ScheduleQuit { code: 7, .. }));

    // hub broadcasts a non-forwarding exit to its clients
    let mut scheduler = Scheduler::new(test_config(1, ServerOptions::JOB_SERVER));
    scheduler.clients.insert(1);
    scheduler.clients.insert(2);
    let actions = scheduler.handle_exit(7, true);
    let Action::Broadcast { msg, except } = &actions[0] else {
        panic!("expected a broadcast");
    };
    assert!(except.is_none());
    assert!(matches!(
        msg,
        cindexd::net::wire::Message::Exit {
            exit_code: 7,
            forward: false
        }
    ));
    assert!(matches!(actions[1], Action::ScheduleQuit { code: 7, .. }));

    // solo node just goes
    let mut scheduler = Scheduler::new(test_config(1, ServerOptions::NONE));
    let actions = scheduler.handle_exit(3, true);
    assert!(matches!(actions[0], Action::Quit { code: 3 }));
}

#[test]
fn every_admitted_job_is_reachable_until_done() {
    // P2: admitted jobs stay visible in pending/processing/local_jobs until
    // complete or aborted
    let mut scheduler = Scheduler::new(test_config(1, ServerOptions::JOB_SERVER));
    let projects = test_projects();
    let a = admit(&mut scheduler, "a", true);
    let b = admit(&mut scheduler, "b", true);

    let actions = scheduler.work(0, PoolStats::default(), &projects);
    scheduler.local_launched(launched_ids(&actions)[0], 700, 0);
    let actions = scheduler.handle_job_request(31, 1);
    let Some(Action::SendJobResponse { job_ids, finished, .. }) = actions.first() else {
        panic!("expected a job response");
    };
    scheduler.job_response_sent(job_ids, *finished, 0);

    for id in [a, b] {
        assert!(scheduler.tables.is_live(id), "job {} went missing", id);
    }
    let in_pending = |s: &Scheduler, id| s.tables.pending.contains(&id);
    let in_processing = |s: &Scheduler, id| s.tables.processing.contains(&id);
    let in_local = |s: &Scheduler, id| s.tables.local_jobs.values().any(|(j, _)| *j == id);
    assert!(in_processing(&scheduler, a) && in_local(&scheduler, a));
    assert!(in_processing(&scheduler, b) && !in_pending(&scheduler, b));
}
