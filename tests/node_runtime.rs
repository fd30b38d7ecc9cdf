use mixnode::config::MixConfig;
use mixnode::devnet::Cluster;
use mixnode::mix::denom::STANDARD_DENOMINATIONS;
use mixnode::mix::PoolState;
use mixnode::node::{Clock, MixHandle, MixNode};
use mixnode::COIN;
use std::time::Duration;

fn spawn_cluster(cluster: Cluster) -> Vec<MixHandle> {
    let clock = Clock::new(1_700_000_000_000);
    let mut handles = Vec::new();
    for node in cluster.into_nodes() {
        let (pool, link, inbox) = node.into_parts();
        let (node, handle) = MixNode::new(pool, link, inbox, clock);
        handles.push(handle);
        tokio::spawn(async move {
            let _ = node.run().await;
        });
    }
    handles
}

#[tokio::test(start_paused = true)]
async fn test_nodes_complete_a_session() {
    let config = MixConfig {
        tick_interval_ms: 200,
        auto_denominate_ticks: 1,
        rng_seed: Some(17),
        ..MixConfig::default()
    };
    // A single denomination keeps every concurrent join compatible.
    let funding = vec![STANDARD_DENOMINATIONS[3], STANDARD_DENOMINATIONS[3], COIN / 10, COIN / 10];
    let cluster = Cluster::new(1, 3, &funding, config);
    let chain = cluster.chain.clone();
    let handles = spawn_cluster(cluster);

    let coordinator = handles[0].clone();
    let done = tokio::time::timeout(
        Duration::from_secs(120),
        coordinator.wait_for(|s| s.state == PoolState::Success),
    )
    .await;
    let snapshot = done.expect("session finished in time").unwrap();
    assert!(snapshot.coordinator);
    assert_eq!(coordinator.metrics().sessions_completed(), 1);

    let mixed = chain.mempool().into_iter().find(|tx| tx.inputs.len() == 3);
    assert!(mixed.is_some(), "mixing transaction not in mempool");

    let users = coordinator.with_pool(|pool| pool.session_users()).await;
    assert_eq!(users, 0);

    for handle in &handles {
        handle.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_node_publishes_initial_status() {
    let config = MixConfig { auto_denominate: false, ..MixConfig::default() };
    let cluster = Cluster::new(1, 1, &[COIN], config);
    let handles = spawn_cluster(cluster);

    tokio::time::sleep(Duration::from_secs(5)).await;
    for handle in &handles {
        let status = handle.status();
        assert_eq!(status.state, PoolState::Idle);
        assert_eq!(status.session_id, 0);
        handle.shutdown();
    }
}
