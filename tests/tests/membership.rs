mod harness;

use std::time::Duration;

use futures::executor::block_on;

use pool_registry::{Capabilities, ConfigError, RegistryError};

use harness::{eventually, member_count, TestPool};

#[test]
fn first_member_initializes_alone() {
    let pool = TestPool::start();

    let registry = pool.join();

    assert_eq!(registry.identifier().id(), 0);
    assert_eq!(registry.pool_name(), pool.name);
    assert_eq!(block_on(registry.time()).unwrap(), 1);
    assert_eq!(
        block_on(registry.members()).unwrap(),
        vec![registry.identifier().clone()]
    );
}

#[test]
fn second_member_bootstraps_from_first() {
    let pool = TestPool::start();

    let first = pool.join();
    let second = pool.join();

    let mut members = block_on(second.members()).unwrap();
    members.sort();

    assert_eq!(
        members,
        vec![first.identifier().clone(), second.identifier().clone()]
    );
    assert_eq!(block_on(second.time()).unwrap(), 2);
    assert_eq!(pool.state_requests(), 0);

    eventually("the first member sees the second", || member_count(&first) == 2);
}

#[test]
fn bootstrap_falls_back_to_server() {
    let pool = TestPool::start();

    let first = pool.join();
    block_on(pool.network.disconnect(first.identifier().address()));

    let second = pool.join();

    assert_eq!(member_count(&second), 2);
    assert_eq!(block_on(second.time()).unwrap(), 2);
    assert_eq!(pool.state_requests(), 1);
}

#[test]
fn joins_are_reported_as_downcalls() {
    let pool = TestPool::start();

    let first = pool.join();
    let second = pool.join();

    for member in [&first, &second] {
        let mut joined = Vec::new();

        eventually("both joins were reported", || {
            joined.extend(block_on(member.joined_members()).unwrap());
            joined.len() == 2
        });

        assert!(joined.contains(first.identifier()));
        assert!(joined.contains(second.identifier()));
    }

    assert!(block_on(second.joined_members()).unwrap().is_empty());
}

#[test]
fn leaving_member_is_removed_everywhere() {
    let pool = TestPool::start();

    let first = pool.join();
    let second = pool.join();

    eventually("both members know each other", || member_count(&first) == 2);

    block_on(second.leave()).unwrap();

    eventually("the first member saw the leave", || {
        block_on(first.left_members())
            .unwrap()
            .contains(second.identifier())
    });
    assert_eq!(member_count(&first), 1);

    assert!(matches!(
        block_on(second.members()),
        Err(RegistryError::Stopped)
    ));
    assert!(matches!(block_on(second.leave()), Err(RegistryError::Stopped)));
}

#[test]
fn closed_world_pool_closes_when_complete() {
    let pool = TestPool::start();
    let config = pool
        .config()
        .with_capabilities(Capabilities::all())
        .with_pool_size(3);

    let members = (0..3)
        .map(|_| pool.join_with(config.clone()))
        .collect::<Vec<_>>();

    for member in &members {
        assert_eq!(member.pool_size().unwrap(), 3);
        block_on(member.wait_until_pool_closed()).unwrap();
        assert!(block_on(member.is_closed()).unwrap());
        assert_eq!(member_count(member), 3);
    }

    let late = block_on(
        pool_registry::RegistryBuilder::new(config)
            .join(pool.network.clone(), pool_registry::executor::StdThread),
    );

    assert!(matches!(late, Err(RegistryError::Remote(_))));
}

#[test]
fn sequence_numbers_are_pool_wide() {
    let pool = TestPool::start();

    let first = pool.join();
    let second = pool.join();

    assert_eq!(block_on(first.sequence_number("jobs")).unwrap(), 0);
    assert_eq!(block_on(second.sequence_number("jobs")).unwrap(), 1);
    assert_eq!(block_on(first.sequence_number("jobs")).unwrap(), 2);
    assert_eq!(block_on(second.sequence_number("other")).unwrap(), 0);
}

#[test]
fn tokens_are_handed_out_once() {
    let pool = TestPool::start();

    let first = pool.join();
    let second = pool.join();

    block_on(first.add_tokens("slots", 2)).unwrap();

    assert!(block_on(second.get_token("slots")).unwrap());
    assert!(block_on(first.get_token("slots")).unwrap());
    assert!(!block_on(second.get_token("slots")).unwrap());
    assert!(!block_on(first.get_token("other")).unwrap());

    block_on(second.add_tokens("slots", 1)).unwrap();
    assert!(block_on(first.get_token("slots")).unwrap());

    block_on(second.leave()).unwrap();
    assert!(matches!(
        block_on(second.get_token("slots")),
        Err(RegistryError::Stopped)
    ));
}

#[test]
fn membership_queries_follow_leaves() {
    let pool = TestPool::start();

    let first = pool.join();
    let second = pool.join();

    eventually("the first member sees the second", || member_count(&first) == 2);

    assert!(block_on(first.is_member(second.identifier())).unwrap());
    let picked = block_on(first.random_pool_member()).unwrap().unwrap();
    assert!(&picked == first.identifier() || &picked == second.identifier());

    block_on(second.leave()).unwrap();

    eventually("the first member saw the leave", || {
        !block_on(first.is_member(second.identifier())).unwrap()
    });
    assert_eq!(
        block_on(first.random_pool_member()).unwrap(),
        Some(first.identifier().clone())
    );
    assert!(matches!(
        block_on(second.random_pool_member()),
        Err(RegistryError::Stopped)
    ));
}

#[test]
fn missing_capabilities_are_configuration_errors() {
    let pool = TestPool::start();
    let registry = pool.join_with(pool.config().with_capabilities(Capabilities::none()));

    assert!(matches!(
        block_on(registry.elect("leader")),
        Err(RegistryError::Configuration(ConfigError::MissingCapability(
            "elections"
        )))
    ));
    assert!(matches!(
        block_on(registry.signal("hello", &[])),
        Err(RegistryError::Configuration(ConfigError::MissingCapability(
            "signals"
        )))
    ));
    assert!(matches!(
        block_on(registry.wait_until_terminated(Some(Duration::from_millis(1)))),
        Err(RegistryError::Configuration(ConfigError::MissingCapability(
            "termination"
        )))
    ));
    assert!(matches!(
        registry.pool_size(),
        Err(RegistryError::Configuration(ConfigError::MissingCapability(
            "closed world"
        )))
    ));
    assert!(matches!(
        block_on(registry.enable_events()),
        Err(RegistryError::Configuration(ConfigError::NoEventHandler))
    ));
    assert!(matches!(
        block_on(registry.joined_members()),
        Err(RegistryError::Configuration(ConfigError::MissingCapability(
            "membership"
        )))
    ));
}

#[test]
fn invalid_configuration_is_rejected_before_joining() {
    let pool = TestPool::start();
    let config = pool
        .config()
        .with_gossip(Duration::from_millis(50))
        .with_tree();

    let result = block_on(
        pool_registry::RegistryBuilder::new(config)
            .join(pool.network.clone(), pool_registry::executor::StdThread),
    );

    assert!(matches!(
        result,
        Err(RegistryError::Configuration(ConfigError::GossipAndTree))
    ));
    assert!(block_on(pool.server.members(&pool.name)).is_empty());
}
