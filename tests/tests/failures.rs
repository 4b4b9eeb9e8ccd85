mod harness;

use std::sync::Arc;
use std::time::Duration;

use futures::executor::block_on;

use pool_registry::RegistryError;

use harness::{eventually, member_count, TestPool};

#[test]
fn member_assumed_dead_is_removed_and_stops() {
    let pool = TestPool::start();

    let first = pool.join();
    let second = pool.join();
    let victim = Arc::new(pool.join());

    for member in [&first, &second] {
        eventually("all members know each other", || member_count(member) == 3);
    }

    let pending = {
        let victim = Arc::clone(&victim);

        std::thread::spawn(move || block_on(victim.get_election_result("never", None)))
    };

    block_on(second.assume_dead(victim.identifier())).unwrap();

    for member in [&first, &second] {
        let mut died = Vec::new();

        eventually("the death was reported", || {
            died.extend(block_on(member.died_members()).unwrap());
            !died.is_empty()
        });

        assert_eq!(died, vec![victim.identifier().clone()]);
        assert_eq!(member_count(member), 2);
    }

    assert!(matches!(pending.join().unwrap(), Err(RegistryError::Stopped)));
    assert!(matches!(
        block_on(victim.members()),
        Err(RegistryError::Stopped)
    ));
    assert!(matches!(
        block_on(victim.elect("leader")),
        Err(RegistryError::Stopped)
    ));
}

#[test]
fn unreachable_suspect_is_declared_dead() {
    let pool = TestPool::start();

    let first = pool.join();
    let second = pool.join();

    eventually("both members know each other", || member_count(&first) == 2);

    block_on(pool.network.disconnect(second.identifier().address()));
    block_on(first.maybe_dead(second.identifier())).unwrap();

    let mut died = Vec::new();

    eventually("the suspect was declared dead", || {
        died.extend(block_on(first.died_members()).unwrap());
        !died.is_empty()
    });

    assert_eq!(died, vec![second.identifier().clone()]);
    assert_eq!(member_count(&first), 1);
}

#[test]
fn reachable_suspect_survives() {
    let pool = TestPool::start();

    let first = pool.join();
    let second = pool.join();

    eventually("both members know each other", || member_count(&first) == 2);

    block_on(first.maybe_dead(second.identifier())).unwrap();

    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(member_count(&first), 2);
    assert!(block_on(first.died_members()).unwrap().is_empty());
}
