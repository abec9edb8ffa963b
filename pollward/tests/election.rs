mod common;

use common::*;
use pollward::api::{Epoch, InstanceId, Keys, LeaderRecord, Record, Role};
use pollward::store::mem::MemStore;
use pollward::{ElectionError, OffsetCheckpoint, Parameters, StoreHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn leader_owner(store: &MemStore) -> Option<InstanceId> {
    store
        .peek(&Keys::new("svc").leader())
        .map(|bytes| LeaderRecord::decode(&bytes).unwrap().owner)
}

/// Advance time in small steps, checking that at most one instance leads
async fn run_checked(instances: &[&TestInstance], duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        sleep(Duration::from_millis(100)).await;
        let leaders = instances.iter().filter(|i| i.is_leader()).count();
        assert!(leaders <= 1, "{leaders} leaders at the same time");
    }
}

#[tokio::test(start_paused = true)]
async fn single_instance_leads() -> anyhow::Result<()> {
    let store = MemStore::new();
    let ledger = Arc::new(Ledger::default());
    let x = TestInstance::start(&store, &ledger, "x").await?;

    sleep(Duration::from_secs(1)).await;
    assert!(x.is_leader());
    assert_eq!(x.elector().role(), Role::Leader);
    assert_eq!(x.elector().epoch(), Some(Epoch(1)));
    assert_eq!(leader_owner(&store), Some(InstanceId::from("x")));

    // stays leader across many lease periods
    sleep(Duration::from_secs(120)).await;
    assert!(x.is_leader());
    assert_eq!(ledger.elections_of("x").len(), 1);
    assert_eq!(x.elector().stats().leadership_changes, 1);

    let status = x.elector().cluster_status().await?;
    assert_eq!(status.cluster.current_leader, Some(InstanceId::from("x")));
    assert_eq!(status.cluster.active_instances.len(), 1);
    assert!(status.cluster.active_instances[0].is_leader);
    assert!(status.is_leader);
    assert_eq!(status.instance_id, InstanceId::from("x"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn simultaneous_start_elects_one() -> anyhow::Result<()> {
    let store = MemStore::new();
    let ledger = Arc::new(Ledger::default());
    let (x, y) = tokio::join!(
        TestInstance::start(&store, &ledger, "x"),
        TestInstance::start(&store, &ledger, "y")
    );
    let (x, y) = (x?, y?);

    run_checked(&[&x, &y], Duration::from_secs(60)).await;

    assert_eq!(ledger.elections().len(), 1);
    let leader = ledger.elections()[0].instance.clone();
    assert_eq!(leader_owner(&store), Some(leader.clone()));

    let follower = if leader.0 == "x" { &y } else { &x };
    assert!(!follower.is_leader());
    assert_eq!(follower.elector().role(), Role::Follower);
    ledger.assert_clean();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn follower_takes_over_silent_leader() -> anyhow::Result<()> {
    let store = MemStore::new();
    let ledger = Arc::new(Ledger::default());
    let x = TestInstance::start(&store, &ledger, "x").await?;
    sleep(Duration::from_secs(2)).await;
    let y = TestInstance::start(&store, &ledger, "y").await?;
    run_checked(&[&x, &y], Duration::from_secs(5)).await;
    assert!(x.is_leader());

    let silenced_at = Instant::now();
    x.client.disconnect();
    run_checked(&[&x, &y], Duration::from_secs(25)).await;

    assert!(y.is_leader());
    assert!(!x.is_leader());
    let elections = ledger.elections_of("y");
    assert_eq!(elections.len(), 1);
    let failover = elections[0].at - silenced_at;
    assert!(
        Duration::from_secs(10) <= failover && failover <= Duration::from_secs(17),
        "failover took {failover:?}"
    );
    assert_eq!(elections[0].epoch, Epoch(2));
    assert_eq!(ledger.losses_of("x"), 1);
    assert_eq!(leader_owner(&store), Some(InstanceId::from("y")));
    ledger.assert_clean();

    // back online, x must not disturb the new leader
    x.client.reconnect();
    run_checked(&[&x, &y], Duration::from_secs(30)).await;
    assert!(y.is_leader());
    assert_eq!(ledger.elections().len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn checkpoint_survives_failover() -> anyhow::Result<()> {
    let store = MemStore::new();
    let ledger = Arc::new(Ledger::default());
    let z = TestInstance::start(&store, &ledger, "z").await?;
    sleep(Duration::from_secs(1)).await;
    let y = TestInstance::start(&store, &ledger, "y").await?;

    let z_checkpoint = z.supervisor.checkpoint().expect("z leads");
    assert_eq!(z_checkpoint.save_offset(1042).await?, 1042);
    assert_eq!(z.elector().cluster_status().await?.offset, 1042);

    z.client.disconnect();
    run_checked(&[&z, &y], Duration::from_secs(30)).await;

    let elections = ledger.elections_of("y");
    assert_eq!(elections.len(), 1);
    assert_eq!(elections[0].offset, 1042);

    // the demoted leader can no longer move the cursor
    z.client.reconnect();
    assert!(matches!(
        z_checkpoint.save_offset(1050).await,
        Err(ElectionError::NotLeader)
    ));
    let stale_writer = OffsetCheckpoint::new(
        StoreHandle::new(Arc::new(store.connect()), Duration::from_secs(1)),
        Keys::new("svc").offset(),
        InstanceId::from("z"),
    );
    assert!(matches!(
        stale_writer.save(1050, z_checkpoint.epoch()).await,
        Err(ElectionError::Fenced { .. })
    ));
    assert_eq!(stale_writer.load().await?, 1042);

    let y_checkpoint = y.supervisor.checkpoint().expect("y leads");
    assert_eq!(y_checkpoint.save_offset(1043).await?, 1043);
    ledger.assert_clean();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_releases_leadership() -> anyhow::Result<()> {
    let store = MemStore::new();
    let ledger = Arc::new(Ledger::default());
    let x = TestInstance::start(&store, &ledger, "x").await?;
    sleep(Duration::from_secs(1)).await;
    let y = TestInstance::start(&store, &ledger, "y").await?;
    sleep(Duration::from_secs(1)).await;
    assert!(x.is_leader());

    x.elector().stop().await;
    assert!(!x.is_leader());
    assert_eq!(ledger.losses_of("x"), 1);
    assert_eq!(leader_owner(&store), None);
    assert_eq!(store.peek(&Keys::new("svc").health(&InstanceId::from("x"))), None);

    // idempotent
    x.elector().stop().await;
    assert_eq!(ledger.losses_of("x"), 1);

    // released, not expired: y can take over on its next tick
    run_checked(&[&x, &y], Duration::from_secs(3)).await;
    assert!(y.is_leader());
    ledger.assert_clean();

    y.elector().stop().await;
    assert_eq!(leader_owner(&store), None);
    assert_eq!(store.live_leases(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopping_a_follower_leaves_the_leader_alone() -> anyhow::Result<()> {
    let store = MemStore::new();
    let ledger = Arc::new(Ledger::default());
    let x = TestInstance::start(&store, &ledger, "x").await?;
    sleep(Duration::from_secs(1)).await;
    let y = TestInstance::start(&store, &ledger, "y").await?;
    sleep(Duration::from_secs(3)).await;

    y.elector().stop().await;
    assert!(!y.is_leader());
    assert_eq!(ledger.losses_of("y"), 0);
    assert_eq!(leader_owner(&store), Some(InstanceId::from("x")));
    assert!(x.is_leader());

    let status = x.elector().cluster_status().await?;
    assert_eq!(status.cluster.active_instances.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrent_stops_wait_for_each_other() -> anyhow::Result<()> {
    let store = MemStore::new();
    let ledger = Arc::new(Ledger::default());
    let x = TestInstance::start(&store, &ledger, "x").await?;
    sleep(Duration::from_secs(1)).await;

    tokio::join!(x.elector().stop(), x.elector().stop());
    assert!(!x.is_leader());
    assert_eq!(ledger.losses_of("x"), 1);
    assert_eq!(leader_owner(&store), None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dropped_elector_shuts_down() -> anyhow::Result<()> {
    let store = MemStore::new();
    let ledger = Arc::new(Ledger::default());
    let mut x = TestInstance::start(&store, &ledger, "x").await?;
    sleep(Duration::from_secs(1)).await;

    x.drop_elector();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(ledger.losses_of("x"), 1);
    assert_eq!(leader_owner(&store), None);
    assert_eq!(store.live_leases(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_supervisor_start_is_retried() -> anyhow::Result<()> {
    let store = MemStore::new();
    let ledger = Arc::new(Ledger::default());
    let x = TestInstance::start_with(&store, &ledger, "x", |params| params).await?;
    x.supervisor.fail_starts(2);

    run_checked(&[&x], Duration::from_secs(20)).await;
    assert!(x.is_leader());
    assert_eq!(ledger.elections_of("x").len(), 1);
    // every failed start gave the leader record back and bumped the epoch
    assert!(Epoch(1) < ledger.elections_of("x")[0].epoch);
    assert_eq!(x.elector().stats().leadership_changes, 3);
    ledger.assert_clean();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_is_fatal() {
    let store = MemStore::new();
    let ledger = Arc::new(Ledger::default());
    let client = store.connect();
    client.disconnect();

    let params = Parameters::builder()
        .service("svc")
        .startup_probe_attempts(3)
        .build();
    let supervisor = Arc::new(RecordingSupervisor::new("x", ledger.clone()));
    let err = pollward::Elector::start(params, Arc::new(client), supervisor)
        .await
        .err()
        .expect("start must fail");
    assert!(matches!(err, ElectionError::Connect(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn unsafe_parameters_are_rejected() {
    let store = MemStore::new();
    let ledger = Arc::new(Ledger::default());
    let err = TestInstance::start_with(&store, &ledger, "x", |mut params| {
        params.lease_ttl = Duration::from_secs(1);
        params
    })
    .await
    .err()
    .expect("start must fail");

    assert!(matches!(
        err.downcast_ref::<ElectionError>(),
        Some(ElectionError::InvalidParameters(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn many_instances_one_leader_at_a_time() -> anyhow::Result<()> {
    let store = MemStore::new();
    let ledger = Arc::new(Ledger::default());
    let mut instances = vec![];
    for id in ["a", "b", "c", "d"] {
        instances.push(TestInstance::start(&store, &ledger, id).await?);
    }

    for _round in 0..3 {
        run_checked(&instances.iter().collect::<Vec<_>>(), Duration::from_secs(5)).await;
        let leader = instances
            .iter()
            .find(|i| i.is_leader())
            .expect("some instance leads");
        leader.client.disconnect();
        run_checked(&instances.iter().collect::<Vec<_>>(), Duration::from_secs(30)).await;
        leader.client.reconnect();
    }

    let epochs: Vec<Epoch> = ledger.elections().iter().map(|e| e.epoch).collect();
    assert_eq!(epochs.len(), 4);
    assert!(epochs.windows(2).all(|w| w[0] < w[1]), "{epochs:?}");
    ledger.assert_clean();
    Ok(())
}
