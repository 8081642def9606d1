use std::{collections::HashSet, slice, sync::Arc, time::Duration};

use comm::{Communication, Host, MessageType, PeerId, Subscription};
use futures::future::try_join_all;
use parking_lot::Mutex;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

use crate::{
    elector::{serve_election_requests, ElectorFactory, ElectorKind},
    exclude_peers,
    message::StartMessage,
    CoordinatorConfig, Error, Process, ResultSender, RetryPolicy,
};

/// Runs processes that need a single peer to coordinate them.
///
/// The first attempt of a session is coordinated by the statically elected
/// peer. Retryable failures lead to a bully election among the remaining
/// candidates and a new attempt, up to `max_retries` times.
pub struct Coordinator {
    host: Arc<dyn Host>,
    communication: Arc<dyn Communication>,
    electors: ElectorFactory,
    config: CoordinatorConfig,
    pending: Mutex<HashSet<String>>,
}

impl Coordinator {
    pub fn new(
        host: Arc<dyn Host>,
        communication: Arc<dyn Communication>,
        electors: ElectorFactory,
    ) -> Self {
        Self {
            host,
            communication,
            electors,
            config: CoordinatorConfig::default(),
            pending: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run `processes`, which must all belong to the same session, until they
    /// complete or fail for good.
    ///
    /// Only one execution per session id may run at a time. Whichever way the
    /// execution ends, including the returned future being dropped, the
    /// session is closed on the bus and every process is stopped once.
    #[tracing::instrument(skip_all, fields(session_id))]
    pub async fn execute(
        &self,
        processes: Vec<Arc<dyn Process>>,
        results: ResultSender,
    ) -> Result<(), Error> {
        let Some(lead) = processes.first().cloned() else {
            return Err(Error::NoProcesses);
        };
        let session_id = lead.session_id().to_string();
        if let Some(process) = processes.iter().find(|p| p.session_id() != session_id) {
            return Err(Error::MismatchedSessions {
                expected: session_id,
                found: process.session_id().to_string(),
            });
        }
        tracing::Span::current().record("session_id", session_id.as_str());

        let _guard = SessionGuard::acquire(self, &session_id, &processes)?;
        let session = Session {
            coordinator: self,
            id: &session_id,
            lead: lead.as_ref(),
            processes: &processes,
            results: &results,
        };
        tokio::select! {
            result = session.run() => result,
            err = serve_election_requests(self.communication.clone(), &session_id) => {
                Err(err.into())
            }
        }
    }
}

/// Marks a session as pending and cleans it up when dropped.
struct SessionGuard<'a> {
    coordinator: &'a Coordinator,
    session_id: String,
    processes: &'a [Arc<dyn Process>],
}

impl<'a> SessionGuard<'a> {
    fn acquire(
        coordinator: &'a Coordinator,
        session_id: &str,
        processes: &'a [Arc<dyn Process>],
    ) -> Result<Self, Error> {
        if !coordinator.pending.lock().insert(session_id.to_string()) {
            return Err(Error::AlreadyPending(session_id.to_string()));
        }
        Ok(Self {
            coordinator,
            session_id: session_id.to_string(),
            processes,
        })
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.coordinator
            .communication
            .close_session(&self.session_id);
        self.coordinator.pending.lock().remove(&self.session_id);
        for process in self.processes {
            process.stop();
        }
        tracing::debug!(session_id = %self.session_id, "session cleaned up");
    }
}

/// One `execute` call.
struct Session<'a> {
    coordinator: &'a Coordinator,
    id: &'a str,
    /// Answers readiness and start parameter queries for all processes.
    lead: &'a dyn Process,
    processes: &'a [Arc<dyn Process>],
    results: &'a ResultSender,
}

impl Session<'_> {
    fn config(&self) -> &CoordinatorConfig {
        &self.coordinator.config
    }

    fn local(&self) -> PeerId {
        self.coordinator.host.id()
    }

    fn subscribe(&self, message_type: MessageType) -> Subscription {
        Subscription::new(self.coordinator.communication.clone(), self.id, message_type)
    }

    async fn broadcast(
        &self,
        peers: &[PeerId],
        payload: Vec<u8>,
        message_type: MessageType,
    ) -> Result<(), comm::CommunicationError> {
        self.coordinator
            .communication
            .broadcast(peers, payload, message_type, self.id)
            .await
    }

    async fn run(&self) -> Result<(), Error> {
        let candidates = self.lead.valid_coordinators();
        let elected = self
            .coordinator
            .electors
            .elector(self.id, ElectorKind::Static)
            .coordinator(&candidates)
            .await?;

        // `None` while waiting for a start from any peer.
        let mut expected = Some(elected);
        let mut excluded: Vec<PeerId> = Vec::new();
        let mut retries = 0;
        loop {
            let attempt = match &expected {
                Some(coordinator) => {
                    self.supervised(Some(coordinator), self.start(coordinator, &excluded))
                        .await
                }
                None => self.supervised(None, self.wait_for_start(None)).await,
            };
            let err = match attempt {
                Ok(()) => {
                    tracing::info!(session_id = %self.id, "session completed");
                    return Ok(());
                }
                Err(err) => err,
            };

            let policy = if self.lead.retryable() && retries < self.config().max_retries {
                err.retry_policy()
            } else {
                RetryPolicy::Fatal
            };
            match policy {
                RetryPolicy::Fatal => {
                    self.abort(expected.as_ref(), &err).await;
                    return Err(err);
                }
                RetryPolicy::Reelect { exclude } => {
                    tracing::warn!(
                        session_id = %self.id,
                        error = %err,
                        ?exclude,
                        "attempt failed, electing a new coordinator"
                    );
                    excluded = exclude;
                    let remaining = exclude_peers(&candidates, &excluded);
                    let coordinator = self
                        .coordinator
                        .electors
                        .elector(self.id, ElectorKind::Bully)
                        .coordinator(&remaining)
                        .await?;
                    expected = Some(coordinator);
                }
                RetryPolicy::WaitForStart => {
                    tracing::info!(
                        session_id = %self.id,
                        error = %err,
                        "not selected, waiting for the next start"
                    );
                    expected = None;
                }
            }
            retries += 1;
        }
    }

    /// Run one attempt under the watchdog.
    async fn supervised(
        &self,
        coordinator: Option<&PeerId>,
        attempt: impl std::future::Future<Output = Result<(), Error>>,
    ) -> Result<(), Error> {
        tokio::select! {
            result = attempt => result,
            err = self.watch_execution(coordinator) => Err(err),
        }
    }

    /// Resolves when the attempt has to be given up: the coordinator sent a
    /// fail message, or the attempt took longer than the tss timeout.
    async fn watch_execution(&self, coordinator: Option<&PeerId>) -> Error {
        let mut fails = self.subscribe(MessageType::TssFail);
        let timeout = sleep(self.config().tss_timeout);
        tokio::pin!(timeout);
        loop {
            tokio::select! {
                _ = &mut timeout => return Error::Timeout(self.config().tss_timeout),
                msg = fails.recv() => match msg {
                    Some(msg) if Some(&msg.from) == coordinator => {
                        return Error::Aborted { peer: msg.from };
                    }
                    Some(msg) => {
                        tracing::debug!(session_id = %self.id, from = %msg.from, "ignoring fail message");
                    }
                    None => return Error::Closed,
                },
            }
        }
    }

    async fn start(&self, coordinator: &PeerId, excluded: &[PeerId]) -> Result<(), Error> {
        if *coordinator == self.local() {
            tracing::info!(session_id = %self.id, "acting as coordinator");
            self.initiate(excluded).await
        } else {
            tracing::info!(session_id = %self.id, %coordinator, "waiting for coordinator");
            self.wait_for_start(Some(coordinator)).await
        }
    }

    /// Collect ready peers until the process can start, then start it.
    async fn initiate(&self, excluded: &[PeerId]) -> Result<(), Error> {
        let process = self.lead;
        let ready_peers = {
            let mut readies = self.subscribe(MessageType::TssReady);
            let mut ready_peers = vec![self.local()];
            let mut ticker =
                interval(self.config().initiate_period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.broadcast_initiate().await,
                    msg = readies.recv() => {
                        let msg = msg.ok_or(Error::Closed)?;
                        tracing::debug!(session_id = %self.id, from = %msg.from, "received ready message");
                        if excluded.contains(&msg.from) || ready_peers.contains(&msg.from) {
                            continue;
                        }
                        ready_peers.push(msg.from);
                        if process.ready(&ready_peers, excluded)? {
                            break ready_peers;
                        }
                    }
                }
            }
        };

        let params = process.start_params(&ready_peers);
        let start = StartMessage::new(params.clone()).to_bytes()?;
        tracing::info!(session_id = %self.id, ready = ready_peers.len(), "starting session");
        if let Err(err) = self
            .broadcast(&self.coordinator.host.peers(), start, MessageType::TssStart)
            .await
        {
            tracing::warn!(session_id = %self.id, error = %err, "start message not delivered to every peer");
        }
        self.run_processes(true, params).await
    }

    async fn broadcast_initiate(&self) {
        let peers = self.coordinator.host.peers();
        if let Err(err) = self
            .broadcast(&peers, Vec::new(), MessageType::TssInitiate)
            .await
        {
            tracing::debug!(session_id = %self.id, error = %err, "initiate message not delivered");
        }
    }

    /// Answer initiate messages of `coordinator` until it sends the start
    /// message, then run the processes. Without an expected coordinator, any
    /// peer's start is accepted and only the watchdog bounds the wait.
    async fn wait_for_start(&self, coordinator: Option<&PeerId>) -> Result<(), Error> {
        let from_coordinator = |from: &PeerId| coordinator.map_or(true, |c| c == from);
        let coordinator_timeout = self.config().coordinator_timeout;

        let params = {
            let mut initiates = self.subscribe(MessageType::TssInitiate);
            let mut starts = self.subscribe(MessageType::TssStart);
            let timeout = sleep(coordinator_timeout);
            tokio::pin!(timeout);
            loop {
                tokio::select! {
                    msg = initiates.recv() => {
                        let msg = msg.ok_or(Error::Closed)?;
                        if !from_coordinator(&msg.from) {
                            tracing::debug!(session_id = %self.id, from = %msg.from, "ignoring initiate message");
                            continue;
                        }
                        timeout.as_mut().reset(Instant::now() + coordinator_timeout);
                        if let Err(err) = self
                            .broadcast(slice::from_ref(&msg.from), Vec::new(), MessageType::TssReady)
                            .await
                        {
                            tracing::warn!(session_id = %self.id, error = %err, "ready message not delivered");
                        }
                    }
                    msg = starts.recv() => {
                        let msg = msg.ok_or(Error::Closed)?;
                        if !from_coordinator(&msg.from) {
                            tracing::debug!(session_id = %self.id, from = %msg.from, "ignoring start message");
                            continue;
                        }
                        tracing::info!(session_id = %self.id, from = %msg.from, "received start message");
                        break StartMessage::from_bytes(&msg.payload)?.params;
                    }
                    _ = &mut timeout, if coordinator.is_some() => {
                        if let Some(peer) = coordinator {
                            return Err(Error::Coordinator { peer: peer.clone() });
                        }
                    }
                }
            }
        };

        self.run_processes(false, params).await
    }

    /// Run every process; the first failure cancels the others.
    async fn run_processes(&self, coordinator: bool, params: Vec<u8>) -> Result<(), Error> {
        let runs = self
            .processes
            .iter()
            .map(|process| process.run(coordinator, self.results.clone(), params.clone()));
        try_join_all(runs).await?;
        Ok(())
    }

    /// Tell the participants to give up if this peer coordinates the attempt.
    async fn abort(&self, coordinator: Option<&PeerId>, err: &Error) {
        tracing::error!(session_id = %self.id, error = %err, "session failed");
        if coordinator != Some(&self.local()) {
            return;
        }
        let peers = self.coordinator.host.peers();
        if let Err(err) = self.broadcast(&peers, Vec::new(), MessageType::TssFail).await {
            tracing::debug!(session_id = %self.id, error = %err, "fail message not delivered");
        }
    }
}
