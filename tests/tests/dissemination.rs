mod harness;

use std::time::Duration;

use futures::executor::block_on;

use pool_registry::prototyping::DirectNetwork;

use harness::{eventually, member_count, TestPool, TestRegistry};

fn assert_converged(members: &[TestRegistry]) {
    for member in members {
        eventually("every member sees the whole pool", || {
            member_count(member) == members.len()
        });
    }

    let time = block_on(members[0].time()).unwrap();
    for member in members {
        eventually("every member reached the same time", || {
            block_on(member.time()).unwrap() >= time
        });
    }
}

#[test]
fn gossiping_members_converge() {
    let pool = TestPool::start();
    let config = pool.config().with_gossip(Duration::from_millis(30));

    let members = (0..4)
        .map(|_| pool.join_with(config.clone()))
        .collect::<Vec<_>>();

    assert_converged(&members);

    block_on(members[3].signal("ping", &[members[0].identifier().clone()])).unwrap();

    let mut received = Vec::new();
    eventually("the signal was gossiped", || {
        received.extend(block_on(members[0].received_signals()).unwrap());
        !received.is_empty()
    });
    assert_eq!(received, vec!["ping".to_owned()]);
}

#[test]
fn tree_members_converge() {
    let pool = TestPool::start();
    let config = pool.config().with_tree();

    let members = (0..6)
        .map(|_| pool.join_with(config.clone()))
        .collect::<Vec<_>>();

    assert_converged(&members);

    block_on(members[5].leave()).unwrap();

    for member in &members[..5] {
        eventually("the leave reached every member", || member_count(member) == 5);
    }
}

#[test]
fn members_converge_despite_slow_connections() {
    let network =
        DirectNetwork::with_characteristics(0.0, rand_distr::Normal::new(5.0, 2.0).unwrap());
    let pool = TestPool::start_on(network);

    let members = (0..3).map(|_| pool.join()).collect::<Vec<_>>();

    assert_converged(&members);

    let winner = block_on(members[2].elect("leader")).unwrap();

    for member in &members {
        let result = block_on(member.get_election_result("leader", Some(Duration::from_secs(5))))
            .unwrap();

        assert_eq!(result, Some(winner.clone()));
    }
}

#[test]
fn heartbeats_and_gossip_outlast_refused_connections() {
    let pool = TestPool::start();
    let config = pool
        .config()
        .with_gossip(Duration::from_millis(30))
        .with_heartbeat_interval(Duration::from_millis(100));

    let members = (0..3)
        .map(|_| pool.join_with(config.clone()))
        .collect::<Vec<_>>();

    assert_converged(&members);

    pool.network.set_refusal_rate(0.5);

    let heartbeats = pool.heartbeats();
    eventually("heartbeats keep reaching the server", || {
        pool.heartbeats() >= heartbeats + 10
    });

    let target = members[0].identifier().clone();
    eventually("the signal was accepted", || {
        block_on(members[2].signal("still here", &[target.clone()])).is_ok()
    });

    let mut received = Vec::new();
    eventually("the signal was gossiped", || {
        received.extend(block_on(members[0].received_signals()).unwrap());
        !received.is_empty()
    });
    assert_eq!(received, vec!["still here".to_owned()]);

    assert_converged(&members);

    let heartbeats = pool.heartbeats();
    eventually("heartbeats still reach the server", || {
        pool.heartbeats() > heartbeats
    });

    pool.network.set_refusal_rate(0.0);
}
