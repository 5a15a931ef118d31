//! The scheduling core: one decision point for admitting, dispatching,
//! farming out, rescheduling, and reconciling translation-unit jobs.
//!
//! [`Scheduler`] is a synchronous state machine. Handlers mutate the job
//! tables and return [`Action`]s; the server actor performs the actual I/O
//! (child processes, peer sockets, timers). The split keeps every scheduling
//! rule testable without a runtime.

pub mod job;
pub mod remotes;
pub mod tables;

use std::collections::HashSet;
use std::path::PathBuf;

pub use job::{IndexerJob, JobId};
pub use remotes::{PeerRegistry, Remote};
pub use tables::{JobTables, PreprocessRequest};

use crate::config::{ServerConfig, ServerOptions};
use crate::net::connection::ConnId;
use crate::net::wire::{JobPayload, Message};
use crate::project::{IndexData, Projects};
use crate::source::Source;
use crate::unit::{JobFlags, Unit};

/// Preprocess-pool gauges sampled at the top of each work pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub busy: usize,
    pub backlog: usize,
}

impl PoolStats {
    pub fn in_flight(self) -> usize {
        self.busy + self.backlog
    }
}

/// I/O the server actor must perform on the scheduler's behalf.
#[derive(Debug)]
pub enum Action {
    /// Move one request from the pending-preprocess queue into the pool.
    StartPreprocess(PreprocessRequest),
    LaunchLocal(JobId),
    /// Send on the job-server connection.
    SendToServer(Message),
    Broadcast {
        msg: Message,
        except: Option<ConnId>,
    },
    /// Ship jobs to a requesting peer; completion must be reported back via
    /// `job_response_sent` / `job_response_send_failed`.
    SendJobResponse {
        conn: ConnId,
        job_ids: Vec<JobId>,
        finished: bool,
    },
    /// Dial peers round-robin until one accepts a request for `count` jobs.
    RequestJobs { count: usize },
    StartRescheduleTimer,
    /// Hand a result to the owning project, after `delay_ms`.
    NotifyProject {
        data: IndexData,
        job: Box<IndexerJob>,
        delay_ms: u64,
    },
    ScheduleQuit { code: i32, delay_ms: u64 },
    Quit { code: i32 },
}

/// The single scheduling decision point.
pub struct Scheduler {
    config: ServerConfig,
    pub tables: JobTables,
    pub remotes: PeerRegistry,
    pub clients: HashSet<ConnId>,
    announced: bool,
    work_pending: bool,
    server_connected: bool,
}

impl Scheduler {
    pub fn new(config: ServerConfig) -> Scheduler {
        Scheduler {
            config,
            tables: JobTables::new(),
            remotes: PeerRegistry::new(),
            clients: HashSet::new(),
            announced: false,
            work_pending: false,
            server_connected: false,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn set_job_server_location(&mut self, host: String, port: u16) {
        self.config.job_server = Some((host, port));
    }

    pub fn set_server_connected(&mut self, connected: bool) {
        self.server_connected = connected;
        if connected {
            self.request_work();
        }
    }

    pub fn is_server_connected(&self) -> bool {
        self.server_connected
    }

    /// Part of a farm: we are the job-server or we can reach one.
    pub fn has_server(&self) -> bool {
        self.config.is_job_server() || self.server_connected
    }

    pub fn announced(&self) -> bool {
        self.announced
    }

    /// Flag that scheduling conditions may have changed. The server actor
    /// drains this once per event, collapsing storms of pokes into a single
    /// work pass.
    pub fn request_work(&mut self) {
        self.work_pending = true;
    }

    pub fn take_work_request(&mut self) -> bool {
        std::mem::take(&mut self.work_pending)
    }

    /// Admit a compile. Standalone coordinators skip the preprocess step and
    /// index straight from source; farm members preprocess first so the unit
    /// can travel (a unit without preprocessed bytes is never offered out).
    pub fn enqueue_compile(&mut self, source: Source, project: PathBuf, flags: JobFlags) {
        self.request_work();
        if !self.config.options.contains(ServerOptions::FORCE_PREPROCESSING) && !self.has_server() {
            let unit = Unit::new(source, flags);
            let destination = self.config.socket_file.to_string_lossy().into_owned();
            self.add_job(IndexerJob::new(project, unit, destination));
            return;
        }
        self.tables.pending_preprocess.push_back(PreprocessRequest {
            source,
            project,
            flags,
        });
    }

    /// A preprocessed unit came back from the pool.
    pub fn unit_preprocessed(&mut self, unit: Unit, project: PathBuf) {
        let destination = self.config.socket_file.to_string_lossy().into_owned();
        self.add_job(IndexerJob::new(project, unit, destination));
    }

    pub fn add_job(&mut self, job: IndexerJob) {
        debug_assert!(!job.is_complete());
        tracing::debug!(job_id = job.id, source = %job.unit.source_file.display(), "Adding job");
        self.tables.add_pending(job);
        self.request_work();
    }

    /// One pass of the work loop (C9). Runs whenever conditions may have
    /// changed; fills local slots, advertises surplus, fetches from peers.
    pub fn work(&mut self, now_ms: u64, pool: PoolStats, projects: &Projects) -> Vec<Action> {
        self.work_pending = false;
        let mut actions = Vec::new();

        // Feed the preprocess pool under the admission bound.
        let bound = self
            .config
            .max_pending_preprocess
            .saturating_sub(pool.in_flight() + self.tables.pending.len());
        let mut drained = 0usize;
        while drained < bound {
            let Some(request) = self.tables.pending_preprocess.pop_front() else {
                break;
            };
            actions.push(Action::StartPreprocess(request));
            drained += 1;
        }

        let mut slots = self.config.job_count as i64;
        slots -= (pool.in_flight() + drained) as i64;
        slots -= self.tables.local_jobs.len() as i64;
        slots -= self.tables.total_job_requests() as i64;
        if self.config.options.contains(ServerOptions::NO_LOCAL_COMPILES) {
            slots = slots.min(0);
        }

        if slots <= 0 && !self.has_server() {
            return actions;
        }

        let mut announcables = 0usize;
        let mut index = 0usize;
        while index < self.tables.pending.len() {
            let id = self.tables.pending[index];
            let Some(job) = self.tables.job(id) else {
                self.tables.pending.remove(index);
                continue;
            };
            let flags = job.flags();
            if flags.is_complete() {
                self.tables.pending.remove(index);
                self.tables.maybe_release(id);
                continue;
            }
            let from_remote = flags.contains(JobFlags::FROM_REMOTE);
            if !from_remote && !projects.contains_key(&job.project) {
                // the owning project went away; drop the work
                self.tables.pending.remove(index);
                self.tables.maybe_release(id);
                continue;
            }

            if slots > 0 {
                self.tables.pending.remove(index);
                if !from_remote {
                    self.tables.processing.insert(id);
                }
                let job = self.tables.job_mut(id).expect("job just looked up");
                job.unit.flags.remove(JobFlags::RESCHEDULED);
                job.unit.flags.insert(JobFlags::RUNNING_LOCAL);
                job.started = now_ms;
                slots -= 1;
                actions.push(Action::LaunchLocal(id));
            } else {
                if !from_remote {
                    announcables += 1;
                }
                index += 1;
            }
        }

        if !self.has_server() {
            return actions;
        }

        if !self.announced && announcables > 0 {
            self.announced = true;
            tracing::debug!(announcables, "Announcing surplus work to the farm");
            if self.server_connected {
                actions.push(Action::SendToServer(Message::ProxyJobAnnouncement {
                    port: self.config.tcp_port,
                }));
            } else {
                // we are the job-server; receivers derive our host themselves
                actions.push(Action::Broadcast {
                    msg: Message::JobAnnouncement {
                        host: String::new(),
                        port: self.config.tcp_port,
                    },
                    except: None,
                });
            }
        }

        if slots > 0 && !self.remotes.is_empty() {
            actions.push(Action::RequestJobs {
                count: slots as usize,
            });
        }

        actions
    }

    /// Launch succeeded: track the child.
    pub fn local_launched(&mut self, id: JobId, pid: u32, now_ms: u64) {
        self.tables.local_jobs.insert(pid, (id, now_ms));
    }

    /// Launch failed: treat exactly like an immediate crash.
    pub fn local_launch_failed(&mut self, id: JobId, projects: &Projects) -> Vec<Action> {
        self.request_work();
        let Some(job) = self.tables.job_mut(id) else {
            return Vec::new();
        };
        if !job.unit.flags.contains(JobFlags::ABORTED) {
            job.unit.flags.insert(JobFlags::CRASHED);
        }
        job.unit.flags.remove(JobFlags::RUNNING_LOCAL);
        let mut actions = Vec::new();
        if projects.contains_key(&job.project) {
            let data = IndexData::crashed(job);
            actions.push(Action::NotifyProject {
                data,
                job: Box::new(job.clone()),
                delay_ms: self.config.crash_retry_delay_ms,
            });
        }
        self.tables.processing.remove(&id);
        self.tables.maybe_release(id);
        actions
    }

    /// A local child exited (C6).
    pub fn handle_local_finished(
        &mut self,
        pid: u32,
        exit_code: i32,
        stderr: &str,
        now_ms: u64,
        projects: &Projects,
    ) -> Vec<Action> {
        self.request_work();
        let Some((id, dispatched_ms)) = self.tables.local_jobs.remove(&pid) else {
            tracing::debug!(pid, "Exit from an unknown child");
            return Vec::new();
        };
        let mut actions = Vec::new();
        let crash_delay = self.config.crash_retry_delay_ms;
        let Some(job) = self.tables.job_mut(id) else {
            return actions;
        };

        if job.unit.flags.contains(JobFlags::FROM_REMOTE) {
            tracing::info!(
                source = %job.unit.source_file.display(),
                peer = %job.destination,
                elapsed_ms = now_ms.saturating_sub(dispatched_ms),
                "Finished remote peer's job"
            );
        }

        let failed = exit_code != 0 || !stderr.is_empty();
        if !job.unit.flags.is_complete() && failed {
            if !job.unit.flags.contains(JobFlags::ABORTED) {
                job.unit.flags.insert(JobFlags::CRASHED);
            }
            job.unit.flags.remove(JobFlags::RUNNING_LOCAL);
            tracing::error!(
                source = %job.unit.source_file.display(),
                exit_code,
                flags = %job.unit.flags,
                "Indexer child crashed"
            );
            if projects.contains_key(&job.project) {
                // an empty result after a grace period lets the project
                // decide whether to retry or move on
                let data = IndexData::crashed(job);
                actions.push(Action::NotifyProject {
                    data,
                    job: Box::new(job.clone()),
                    delay_ms: crash_delay,
                });
            }
        }

        self.tables.processing.remove(&id);
        self.tables.maybe_release(id);
        actions
    }

    /// Result reconciliation (C10): first replica wins, the rest are noise.
    pub fn handle_indexer_message(
        &mut self,
        data: IndexData,
        remote_origin: bool,
        projects: &Projects,
    ) -> Vec<Action> {
        self.request_work();
        let id = data.job_id;
        if !self.tables.processing.contains(&id) {
            tracing::debug!(job_id = id, "Duplicate result, dropping");
            return Vec::new();
        }
        let Some(job) = self.tables.job_mut(id) else {
            self.tables.processing.remove(&id);
            return Vec::new();
        };
        debug_assert!(!job.unit.flags.contains(JobFlags::FROM_REMOTE));

        let running_flag = if remote_origin {
            JobFlags::REMOTE
        } else {
            JobFlags::RUNNING_LOCAL
        };
        job.unit.flags.remove(running_flag);

        let mut actions = Vec::new();
        if !job.unit.flags.is_complete() && !job.unit.flags.contains(JobFlags::ABORTED) {
            let complete = if remote_origin {
                JobFlags::COMPLETE_REMOTE
            } else {
                JobFlags::COMPLETE_LOCAL
            };
            job.unit.flags.insert(complete);
            if projects.contains_key(&data.project) {
                actions.push(Action::NotifyProject {
                    data,
                    job: Box::new(job.clone()),
                    delay_ms: 0,
                });
            } else {
                tracing::error!(project = %data.project.display(), "No project for this result");
            }
        }

        self.tables.processing.remove(&id);
        self.tables.maybe_release(id);
        actions
    }

    /// A peer asked for up to `num_jobs` work items (C7).
    pub fn handle_job_request(&mut self, conn: ConnId, num_jobs: usize) -> Vec<Action> {
        let mut selected = Vec::new();
        let mut finished = true;
        let mut index = 0usize;
        while index < self.tables.pending.len() {
            let id = self.tables.pending[index];
            let Some(job) = self.tables.job(id) else {
                self.tables.pending.remove(index);
                continue;
            };
            let flags = job.flags();
            if flags.is_complete() {
                self.tables.pending.remove(index);
                self.tables.maybe_release(id);
                continue;
            }
            if flags.contains(JobFlags::FROM_REMOTE) || job.unit.preprocessed.is_empty() {
                index += 1;
                continue;
            }

            if self.config.options.contains(ServerOptions::COMPRESSION_REMOTE)
                && !flags.contains(JobFlags::PREPROCESS_COMPRESSED)
            {
                let job = self.tables.job_mut(id).expect("job just looked up");
                if let Err(e) = job.unit.compress_preprocessed() {
                    tracing::warn!(job_id = id, error = %e, "Compression failed, shipping raw");
                }
            }

            self.tables.pending.remove(index);
            self.tables.pin_in_flight(id);
            selected.push(id);
            if selected.len() == num_jobs {
                finished = false;
                break;
            }
        }

        tracing::debug!(
            conn,
            asked = num_jobs,
            sending = selected.len(),
            finished,
            "Answering job request"
        );
        vec![Action::SendJobResponse {
            conn,
            job_ids: selected,
            finished,
        }]
    }

    /// The bytes of a job response reached the peer: the jobs are now its
    /// problem, tracked here as remote replicas.
    pub fn job_response_sent(
        &mut self,
        job_ids: &[JobId],
        finished: bool,
        now_ms: u64,
    ) -> Vec<Action> {
        if finished {
            // we undersold; re-announce once new work shows up
            self.announced = false;
        }
        let mut any = false;
        for &id in job_ids {
            self.tables.unpin_in_flight(id);
            let Some(job) = self.tables.job_mut(id) else {
                continue;
            };
            job.unit.flags.insert(JobFlags::REMOTE);
            job.unit.flags.remove(JobFlags::RESCHEDULED);
            job.started = now_ms;
            self.tables.processing.insert(id);
            any = true;
        }
        if any {
            vec![Action::StartRescheduleTimer]
        } else {
            Vec::new()
        }
    }

    /// The connection died mid-send: the peer never got the jobs, so they go
    /// back in line. The peer stays registered; only an explicit
    /// `finished=true` evicts it.
    pub fn job_response_send_failed(&mut self, job_ids: &[JobId]) {
        self.request_work();
        for &id in job_ids {
            self.tables.unpin_in_flight(id);
            let Some(job) = self.tables.job_mut(id) else {
                continue;
            };
            if job.unit.flags.is_complete() {
                self.tables.maybe_release(id);
                continue;
            }
            job.unit.flags.remove(JobFlags::RESCHEDULED);
            self.tables.push_pending(id);
        }
    }

    /// Jobs arrived from a peer answering our request.
    pub fn handle_job_response(
        &mut self,
        conn: ConnId,
        host: String,
        jobs: Vec<JobPayload>,
        port: u16,
        finished: bool,
    ) {
        self.tables.pending_job_requests.remove(&conn);
        tracing::debug!(peer = %host, jobs = jobs.len(), finished, "Got jobs from peer");
        for payload in jobs {
            if payload.unit.preprocessed.is_empty() {
                tracing::warn!(peer = %host, "Peer shipped a unit without preprocessed bytes, dropping");
                continue;
            }
            let job = IndexerJob::from_remote(
                payload.id,
                payload.project,
                payload.unit,
                host.clone(),
                port,
                payload.blocked_files,
            );
            self.add_job(job);
        }
        if finished {
            self.remotes.remove(&host);
        }
    }

    /// A peer (or the job-server, fanning out) advertises work.
    pub fn handle_job_announcement(&mut self, host: String, port: u16) {
        tracing::debug!(peer = %host, port, "Job announcement");
        self.remotes.insert(host, port);
        // a peer with fresh work is worth re-advertising into
        self.announced = false;
        self.request_work();
    }

    /// Job-server only: stamp the originator's IP and fan the announcement
    /// out to everyone else.
    pub fn handle_proxy_announcement(
        &mut self,
        conn: ConnId,
        origin_ip: String,
        port: u16,
    ) -> Vec<Action> {
        let msg = Message::JobAnnouncement {
            host: origin_ip.clone(),
            port,
        };
        let actions = vec![Action::Broadcast {
            msg,
            except: Some(conn),
        }];
        self.handle_job_announcement(origin_ip, port);
        actions
    }

    /// A farm client introduced itself on a fresh connection.
    pub fn handle_client(&mut self, conn: ConnId, peer_ip: String) -> Vec<Action> {
        tracing::info!(peer = %peer_ip, "Farm client connected");
        self.clients.insert(conn);
        let actions = vec![Action::Broadcast {
            msg: Message::ClientConnected { peer: peer_ip },
            except: Some(conn),
        }];
        self.handle_client_connected();
        actions
    }

    /// A new client joined the farm somewhere: fresh announcement territory.
    pub fn handle_client_connected(&mut self) {
        self.announced = false;
        self.request_work();
    }

    /// Periodic stalled-remote-job scan (C8).
    pub fn on_reschedule(&mut self, now_ms: u64) -> Vec<Action> {
        let mut restart_timer = false;
        let ids: Vec<JobId> = self.tables.processing.iter().copied().collect();
        for id in ids {
            let Some(job) = self.tables.job(id) else {
                self.tables.processing.remove(&id);
                continue;
            };
            let flags = job.flags();
            if flags.is_complete() {
                // completed while we were shipping it somewhere
                self.tables.processing.remove(&id);
                self.tables.maybe_release(id);
                continue;
            }
            if flags.contains(JobFlags::REMOTE)
                && !flags.intersects(JobFlags::RESCHEDULED | JobFlags::RUNNING_LOCAL)
            {
                if now_ms.saturating_sub(job.started) >= self.config.reschedule_timeout_ms {
                    tracing::warn!(
                        job_id = id,
                        source = %job.unit.source_file.display(),
                        stalled_ms = now_ms.saturating_sub(job.started),
                        "Rescheduling stalled remote job"
                    );
                    // keep it in processing: the original replica may still
                    // answer, and first-wins sorts out the race
                    let job = self.tables.job_mut(id).expect("job just looked up");
                    job.unit.flags.insert(JobFlags::RESCHEDULED);
                    self.tables.push_pending(id);
                    self.request_work();
                } else {
                    restart_timer = true;
                }
            }
        }
        if restart_timer {
            vec![Action::StartRescheduleTimer]
        } else {
            Vec::new()
        }
    }

    /// Graceful teardown propagation (C11).
    pub fn handle_exit(&mut self, exit_code: i32, forward: bool) -> Vec<Action> {
        if self.server_connected && forward {
            return vec![
                Action::SendToServer(Message::Exit { exit_code, forward }),
                Action::ScheduleQuit {
                    code: exit_code,
                    delay_ms: 1000,
                },
            ];
        }
        if !self.clients.is_empty() {
            return vec![
                Action::Broadcast {
                    msg: Message::Exit {
                        exit_code,
                        forward: false,
                    },
                    except: None,
                },
                Action::ScheduleQuit {
                    code: exit_code,
                    delay_ms: 1000,
                },
            ];
        }
        if forward {
            // nowhere to propagate; just go
            vec![Action::Quit { code: exit_code }]
        } else {
            vec![Action::ScheduleQuit {
                code: exit_code,
                delay_ms: 1000,
            }]
        }
    }

    /// Connection bookkeeping shared by peers and clients.
    pub fn handle_connection_closed(&mut self, conn: ConnId) {
        self.clients.remove(&conn);
        if self.tables.pending_job_requests.remove(&conn).is_some() {
            self.request_work();
        }
    }
}
