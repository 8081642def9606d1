use std::{
    slice,
    sync::Arc,
    time::{Duration, Instant},
};

use comm::{
    memory::MemoryNetwork, Communication, CommunicationError, MessageType, PeerId, Subscription,
};
use coordinator::{message::StartMessage, CoordinatorConfig, Error, Process, ProcessError};
use futures::future::join_all;
use tests::{coordinator, fast_config, join_peers, peer_ids, MockProcess};
use tokio::sync::mpsc;

const SESSION: &str = "keygen-1";

fn processes(peers: &[PeerId], online: &[PeerId]) -> Vec<Arc<MockProcess>> {
    online
        .iter()
        .map(|id| Arc::new(MockProcess::new(SESSION, id, peers)))
        .collect()
}

fn as_dyn(process: &Arc<MockProcess>) -> Vec<Arc<dyn Process>> {
    vec![process.clone() as Arc<dyn Process>]
}

/// Send initiate messages from `peer` until `participant` answers.
async fn initiate_until_ready(peer: &Arc<dyn Communication>, participant: &PeerId) {
    let mut readies = Subscription::new(peer.clone(), SESSION, MessageType::TssReady);
    loop {
        peer.broadcast(
            slice::from_ref(participant),
            Vec::new(),
            MessageType::TssInitiate,
            SESSION,
        )
        .await
        .unwrap();
        let ready = tokio::time::timeout(Duration::from_millis(50), readies.recv()).await;
        if let Ok(Some(msg)) = ready {
            assert_eq!(&msg.from, participant);
            return;
        }
    }
}

/// Start the session from `peer` with `subset` as the participants.
async fn send_start(peer: &Arc<dyn Communication>, participant: &PeerId, subset: &[PeerId]) {
    let params = serde_json::to_vec(subset).unwrap();
    let start = StartMessage::new(params).to_bytes().unwrap();
    peer.broadcast(
        slice::from_ref(participant),
        start,
        MessageType::TssStart,
        SESSION,
    )
    .await
    .unwrap();
}

fn communication_error(reason: &str) -> ProcessError {
    ProcessError::Communication(CommunicationError::new(PeerId::from("peer-c"), reason))
}

#[tokio::test]
async fn three_peers_complete_a_ceremony() {
    let network = MemoryNetwork::new();
    let peers = peer_ids(&["peer-a", "peer-b", "peer-c"]);
    let coordinators = join_peers(&network, &peers, &peers, fast_config());
    let processes = processes(&peers, &peers);

    let (tx, mut rx) = mpsc::channel(16);
    let executions = coordinators
        .iter()
        .zip(&processes)
        .map(|(coordinator, process)| coordinator.execute(as_dyn(process), tx.clone()));
    let results = tokio::time::timeout(Duration::from_secs(10), join_all(executions))
        .await
        .unwrap();

    for result in results {
        result.unwrap();
    }
    // peer-a has the lowest id and coordinates.
    assert_eq!(processes[0].runs(), vec![true]);
    assert_eq!(processes[1].runs(), vec![false]);
    assert_eq!(processes[2].runs(), vec![false]);
    for process in &processes {
        assert_eq!(process.stops(), 1);
    }

    drop(tx);
    let mut outputs = Vec::new();
    while let Some(result) = rx.recv().await {
        assert_eq!(result.session_id, SESSION);
        outputs.push(String::from_utf8(result.payload).unwrap());
    }
    outputs.sort();
    assert_eq!(outputs, vec!["peer-a", "peer-b", "peer-c"]);
}

#[tokio::test]
async fn concurrent_execution_of_the_same_session_is_rejected() {
    let network = MemoryNetwork::new();
    let peers = peer_ids(&["peer-a", "peer-b"]);
    let online = peer_ids(&["peer-a"]);
    let coordinator = join_peers(&network, &peers, &online, fast_config()).remove(0);
    let (tx, _rx) = mpsc::channel(16);

    // peer-b never answers, so peer-a keeps initiating.
    let first = Arc::new(MockProcess::new(SESSION, &online[0], &peers));
    let running = tokio::spawn({
        let coordinator = coordinator.clone();
        let processes = as_dyn(&first);
        let tx = tx.clone();
        async move { coordinator.execute(processes, tx).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = Arc::new(MockProcess::new(SESSION, &online[0], &peers));
    let err = coordinator
        .execute(as_dyn(&second), tx.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyPending(session) if session == SESSION));
    assert_eq!(second.stops(), 0);
    assert!(!running.is_finished());

    // Cancelling the first execution cleans the session up.
    running.abort();
    assert!(running.await.unwrap_err().is_cancelled());
    assert_eq!(first.stops(), 1);

    let third = Arc::new(MockProcess::new(SESSION, &online[0], &peers));
    let execution = coordinator.execute(as_dyn(&third), tx.clone());
    assert!(
        tokio::time::timeout(Duration::from_millis(100), execution)
            .await
            .is_err(),
        "the session should be free again"
    );
    assert_eq!(third.stops(), 1);
}

#[tokio::test]
async fn tss_timeout_always_fails() {
    let network = MemoryNetwork::new();
    let peers = peer_ids(&["peer-a", "peer-b", "peer-c"]);
    let config = CoordinatorConfig {
        tss_timeout: Duration::from_nanos(1),
        ..fast_config()
    };
    let coordinators = join_peers(&network, &peers, &peers, config);
    let processes = processes(&peers, &peers);

    let (tx, _rx) = mpsc::channel(16);
    let executions = coordinators
        .iter()
        .zip(&processes)
        .map(|(coordinator, process)| coordinator.execute(as_dyn(process), tx.clone()));
    let results = tokio::time::timeout(Duration::from_secs(5), join_all(executions))
        .await
        .unwrap();

    for result in results {
        let err = result.unwrap_err();
        assert!(
            matches!(err, Error::Timeout(_) | Error::Aborted { .. }),
            "unexpected error: {err}"
        );
    }
    for process in &processes {
        assert_eq!(process.stops(), 1);
    }
}

#[tokio::test]
async fn silent_coordinator_times_out() {
    let network = MemoryNetwork::new();
    let peers = peer_ids(&["peer-a", "peer-b", "peer-c"]);
    let online = peer_ids(&["peer-b"]);
    let config = fast_config();
    let coordinator = join_peers(&network, &peers, &online, config.clone()).remove(0);
    let process = Arc::new(MockProcess::new(SESSION, &online[0], &peers).not_retryable());
    let (tx, _rx) = mpsc::channel(16);

    let started = Instant::now();
    let err = coordinator
        .execute(as_dyn(&process), tx)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::Coordinator { peer } if peer == PeerId::from("peer-a")));
    assert!(elapsed >= config.coordinator_timeout);
    assert!(elapsed < config.coordinator_timeout + Duration::from_secs(1));
    assert!(process.runs().is_empty());
    assert_eq!(process.stops(), 1);
}

#[tokio::test]
async fn dead_coordinator_is_replaced() {
    let network = MemoryNetwork::new();
    let peers = peer_ids(&["peer-a", "peer-b", "peer-c"]);
    let online = peer_ids(&["peer-b", "peer-c"]);
    let coordinators = join_peers(&network, &peers, &online, fast_config());
    let processes = processes(&peers, &online);

    let (tx, _rx) = mpsc::channel(16);
    let executions = coordinators
        .iter()
        .zip(&processes)
        .map(|(coordinator, process)| coordinator.execute(as_dyn(process), tx.clone()));
    let results = tokio::time::timeout(Duration::from_secs(10), join_all(executions))
        .await
        .unwrap();

    for result in results {
        result.unwrap();
    }
    // peer-b took over once peer-a was excluded.
    assert_eq!(processes[0].runs(), vec![true]);
    assert_eq!(processes[1].runs(), vec![false]);
    assert!(processes[0]
        .excluded()
        .iter()
        .all(|excluded| *excluded == peer_ids(&["peer-a"])));
    for process in &processes {
        assert_eq!(process.stops(), 1);
    }
}

#[tokio::test]
async fn culprits_are_excluded_from_reelection() {
    let network = MemoryNetwork::new();
    let peers = peer_ids(&["peer-a", "peer-b", "peer-c"]);
    let coordinators = join_peers(&network, &peers, &peers, fast_config());
    let processes: Vec<Arc<MockProcess>> = peers
        .iter()
        .map(|id| {
            Arc::new(
                MockProcess::new(SESSION, id, &peers).fail_with(ProcessError::Culprits {
                    culprits: peer_ids(&["peer-a"]),
                    reason: "invalid share".to_string(),
                }),
            )
        })
        .collect();

    let (tx, _rx) = mpsc::channel(16);
    let mut executions: Vec<_> = coordinators
        .iter()
        .zip(&processes)
        .map(|(coordinator, process)| {
            let coordinator = coordinator.clone();
            let processes = as_dyn(process);
            let tx = tx.clone();
            tokio::spawn(async move { coordinator.execute(processes, tx).await })
        })
        .collect();

    // peer-a is left out of the second attempt and keeps waiting for a start.
    let waiting = executions.remove(0);
    for execution in executions {
        tokio::time::timeout(Duration::from_secs(10), execution)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
    waiting.abort();

    // peer-a coordinated the first attempt, peer-b the second.
    assert_eq!(processes[0].runs().first(), Some(&true));
    assert_eq!(processes[1].runs(), vec![false, true]);
    assert_eq!(processes[2].runs(), vec![false, false]);
    let excluded = processes[1].excluded();
    assert_eq!(excluded.last().unwrap(), &peer_ids(&["peer-a"]));
}

#[tokio::test]
async fn non_retryable_failure_is_returned_unchanged() {
    let network = MemoryNetwork::new();
    let peers = peer_ids(&["peer-a", "peer-b", "peer-c"]);
    let coordinators = join_peers(&network, &peers, &peers, fast_config());
    let processes: Vec<Arc<MockProcess>> = peers
        .iter()
        .map(|id| {
            Arc::new(
                MockProcess::new(SESSION, id, &peers)
                    .not_retryable()
                    .fail_with(ProcessError::Culprits {
                        culprits: peer_ids(&["peer-c"]),
                        reason: "invalid share".to_string(),
                    }),
            )
        })
        .collect();

    let (tx, _rx) = mpsc::channel(16);
    let executions = coordinators
        .iter()
        .zip(&processes)
        .map(|(coordinator, process)| coordinator.execute(as_dyn(process), tx.clone()));
    let results = tokio::time::timeout(Duration::from_secs(10), join_all(executions))
        .await
        .unwrap();

    let coordinator_result = &results[0];
    assert!(matches!(
        coordinator_result,
        Err(Error::Culprits { culprits, .. }) if *culprits == peer_ids(&["peer-c"])
    ));
    for result in &results[1..] {
        assert!(matches!(
            result,
            Err(Error::Culprits { .. }) | Err(Error::Aborted { .. })
        ));
    }
    // A participant may see the fail message before it got to run.
    assert_eq!(processes[0].runs(), vec![true]);
    for process in &processes {
        assert!(process.runs().len() <= 1);
        assert_eq!(process.stops(), 1);
    }
}

#[tokio::test]
async fn round_messages_reach_the_whole_subset() {
    let network = MemoryNetwork::new();
    let peers = peer_ids(&["peer-a", "peer-b", "peer-c"]);
    let (coordinators, processes): (Vec<_>, Vec<_>) = peers
        .iter()
        .map(|id| {
            let communication: Arc<dyn Communication> = Arc::new(network.join(id.clone()));
            let process =
                Arc::new(MockProcess::new(SESSION, id, &peers).with_rounds(communication.clone()));
            (coordinator(id, &peers, communication, fast_config()), process)
        })
        .unzip();

    let (tx, _rx) = mpsc::channel(16);
    let executions = coordinators
        .iter()
        .zip(&processes)
        .map(|(coordinator, process)| coordinator.execute(as_dyn(process), tx.clone()));
    let results = tokio::time::timeout(Duration::from_secs(10), join_all(executions))
        .await
        .unwrap();

    for result in results {
        result.unwrap();
    }
    for (id, process) in peers.iter().zip(&processes) {
        let mut received = process.received();
        received.sort();
        let expected: Vec<(PeerId, bool)> = peers
            .iter()
            .filter(|peer| *peer != id)
            .map(|peer| (peer.clone(), true))
            .collect();
        assert_eq!(received, expected);
    }
}

#[tokio::test]
async fn reelection_excludes_only_the_latest_culprits() {
    let network = MemoryNetwork::new();
    let peers = peer_ids(&["peer-a", "peer-b", "peer-c", "peer-d"]);
    let online = peer_ids(&["peer-b", "peer-c", "peer-d"]);
    let coordinators = join_peers(&network, &peers, &online, fast_config());
    // peer-a may coordinate but is offline; readiness only needs the others.
    let processes: Vec<Arc<MockProcess>> = online
        .iter()
        .map(|id| {
            Arc::new(
                MockProcess::new(SESSION, id, &online)
                    .coordinators(&peers)
                    .fail_with(ProcessError::Culprits {
                        culprits: peer_ids(&["peer-d"]),
                        reason: "invalid share".to_string(),
                    }),
            )
        })
        .collect();

    let (tx, _rx) = mpsc::channel(16);
    let mut executions: Vec<_> = coordinators
        .iter()
        .zip(&processes)
        .map(|(coordinator, process)| {
            let coordinator = coordinator.clone();
            let processes = as_dyn(process);
            let tx = tx.clone();
            tokio::spawn(async move { coordinator.execute(processes, tx).await })
        })
        .collect();

    // peer-d is left out of the last attempt and keeps waiting for a start.
    let waiting = executions.pop().unwrap();
    for execution in executions {
        tokio::time::timeout(Duration::from_secs(15), execution)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
    waiting.abort();

    // The silent peer-a was replaced by peer-b, which coordinated both runs.
    assert_eq!(processes[0].runs(), vec![true, true]);
    assert_eq!(processes[1].runs(), vec![false, false]);
    let excluded = processes[0].excluded();
    assert_eq!(excluded.first().unwrap(), &peer_ids(&["peer-a"]));
    assert_eq!(excluded.last().unwrap(), &peer_ids(&["peer-d"]));
}

#[tokio::test]
async fn communication_failure_reelects_without_exclusions() {
    let network = MemoryNetwork::new();
    let peers = peer_ids(&["peer-a", "peer-b", "peer-c"]);
    let coordinators = join_peers(&network, &peers, &peers, fast_config());
    let processes: Vec<Arc<MockProcess>> = peers
        .iter()
        .map(|id| {
            Arc::new(MockProcess::new(SESSION, id, &peers).fail_with(communication_error("reset")))
        })
        .collect();

    let (tx, _rx) = mpsc::channel(16);
    let executions = coordinators
        .iter()
        .zip(&processes)
        .map(|(coordinator, process)| coordinator.execute(as_dyn(process), tx.clone()));
    let results = tokio::time::timeout(Duration::from_secs(10), join_all(executions))
        .await
        .unwrap();

    for result in results {
        result.unwrap();
    }
    // Nobody was blamed, so peer-a wins the election again.
    assert_eq!(processes[0].runs(), vec![true, true]);
    assert_eq!(processes[1].runs(), vec![false, false]);
    assert_eq!(processes[2].runs(), vec![false, false]);
    assert!(processes[0].excluded().iter().all(Vec::is_empty));
}

#[tokio::test]
async fn last_error_is_returned_once_retries_are_used_up() {
    let network = MemoryNetwork::new();
    let peers = peer_ids(&["peer-a", "peer-b"]);
    let config = CoordinatorConfig {
        max_retries: 1,
        ..fast_config()
    };
    let coordinators = join_peers(&network, &peers, &peers, config);
    let processes: Vec<Arc<MockProcess>> = peers
        .iter()
        .map(|id| {
            Arc::new(
                MockProcess::new(SESSION, id, &peers)
                    .fail_with(communication_error("first"))
                    .fail_with(communication_error("second")),
            )
        })
        .collect();

    let (tx, _rx) = mpsc::channel(16);
    let executions = coordinators
        .iter()
        .zip(&processes)
        .map(|(coordinator, process)| coordinator.execute(as_dyn(process), tx.clone()));
    let results = tokio::time::timeout(Duration::from_secs(10), join_all(executions))
        .await
        .unwrap();

    assert!(matches!(
        &results[0],
        Err(Error::Communication(err)) if err.reason == "second"
    ));
    assert_eq!(processes[0].runs(), vec![true, true]);
    // peer-b either failed its own run or saw peer-a give up first.
    assert!(matches!(
        &results[1],
        Err(Error::Communication(_)) | Err(Error::Aborted { .. })
    ));
    for process in &processes {
        assert_eq!(process.stops(), 1);
    }
}

#[tokio::test]
async fn late_participant_is_picked_up_by_repeated_initiates() {
    let network = MemoryNetwork::new();
    let peers = peer_ids(&["peer-a", "peer-b"]);
    let config = fast_config();
    let coordinators = join_peers(&network, &peers, &peers, config.clone());
    let processes = processes(&peers, &peers);
    let (tx, _rx) = mpsc::channel(16);

    let early = tokio::spawn({
        let coordinator = coordinators[0].clone();
        let processes = as_dyn(&processes[0]);
        let tx = tx.clone();
        async move { coordinator.execute(processes, tx).await }
    });
    // The first initiate messages reach peer-b before it executes.
    tokio::time::sleep(config.initiate_period * 5 / 2).await;
    assert!(!early.is_finished());

    let late = coordinators[1].execute(as_dyn(&processes[1]), tx.clone());
    tokio::time::timeout(Duration::from_secs(5), late)
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), early)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(processes[0].runs(), vec![true]);
    assert_eq!(processes[1].runs(), vec![false]);
}

#[tokio::test]
async fn peer_left_out_of_the_subset_joins_a_later_start() {
    let network = MemoryNetwork::new();
    let peers = peer_ids(&["peer-a", "peer-c"]);
    let (leader, participant) = (&peers[0], &peers[1]);
    let coordinator = join_peers(&network, &peers, slice::from_ref(participant), fast_config())
        .remove(0);
    let leader_bus: Arc<dyn Communication> = Arc::new(network.join(leader.clone()));
    let process = Arc::new(MockProcess::new(SESSION, participant, &peers));
    let (tx, _rx) = mpsc::channel(16);

    let execution = tokio::spawn({
        let processes = as_dyn(&process);
        async move { coordinator.execute(processes, tx).await }
    });

    initiate_until_ready(&leader_bus, participant).await;
    send_start(&leader_bus, participant, slice::from_ref(leader)).await;
    // Let stale ready messages drain before the next round.
    tokio::time::sleep(Duration::from_millis(200)).await;
    initiate_until_ready(&leader_bus, participant).await;
    send_start(&leader_bus, participant, &peers).await;

    tokio::time::timeout(Duration::from_secs(5), execution)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(process.runs(), vec![false, false]);
    assert_eq!(process.stops(), 1);
}

#[tokio::test]
async fn fail_message_from_the_coordinator_aborts_the_session() {
    let network = MemoryNetwork::new();
    let peers = peer_ids(&["peer-a", "peer-c"]);
    let (leader, participant) = (&peers[0], &peers[1]);
    let coordinator = join_peers(&network, &peers, slice::from_ref(participant), fast_config())
        .remove(0);
    let leader_bus: Arc<dyn Communication> = Arc::new(network.join(leader.clone()));
    let bystander: Arc<dyn Communication> = Arc::new(network.join(PeerId::from("peer-x")));
    let process = Arc::new(MockProcess::new(SESSION, participant, &peers));
    let (tx, _rx) = mpsc::channel(16);

    let mut execution = tokio::spawn({
        let processes = as_dyn(&process);
        async move { coordinator.execute(processes, tx).await }
    });
    initiate_until_ready(&leader_bus, participant).await;

    bystander
        .broadcast(
            slice::from_ref(participant),
            Vec::new(),
            MessageType::TssFail,
            SESSION,
        )
        .await
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(100), &mut execution)
            .await
            .is_err(),
        "only the coordinator may abort the session"
    );

    leader_bus
        .broadcast(
            slice::from_ref(participant),
            Vec::new(),
            MessageType::TssFail,
            SESSION,
        )
        .await
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(1), execution)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, Error::Aborted { peer } if peer == *leader));
    assert!(process.runs().is_empty());
    assert_eq!(process.stops(), 1);
}
