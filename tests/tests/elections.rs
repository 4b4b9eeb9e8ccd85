mod harness;

use std::time::Duration;

use futures::executor::block_on;

use harness::{eventually, TestPool};

#[test]
fn concurrent_candidates_agree_on_one_winner() {
    let pool = TestPool::start();

    let first = pool.join();
    let second = pool.join();

    let (a, b) = block_on(async { futures::join!(first.elect("leader"), second.elect("leader")) });
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a, b);
    assert!(a == *first.identifier() || a == *second.identifier());

    for member in [&first, &second] {
        let winner = block_on(member.get_election_result("leader", Some(Duration::from_secs(5))))
            .unwrap();

        assert_eq!(winner, Some(a.clone()));
    }

    let winner = if a == *first.identifier() {
        &first
    } else {
        &second
    };
    let loser = if a == *first.identifier() {
        &second
    } else {
        &first
    };

    assert_eq!(
        block_on(winner.won_elections()).unwrap(),
        vec!["leader".to_owned()]
    );
    assert!(block_on(loser.won_elections()).unwrap().is_empty());
}

#[test]
fn decided_election_is_not_sent_again() {
    let pool = TestPool::start();

    let first = pool.join();
    let second = pool.join();

    let winner = block_on(first.elect("coordinator")).unwrap();
    assert_eq!(winner, *first.identifier());

    eventually("the second member learned the result", || {
        block_on(second.get_election_result("coordinator", Some(Duration::ZERO)))
            .unwrap()
            .is_some()
    });

    let time = pool.server_time();

    assert_eq!(block_on(second.elect("coordinator")).unwrap(), winner);
    assert_eq!(block_on(first.elect("coordinator")).unwrap(), winner);
    assert_eq!(pool.server_time(), time);
}

#[test]
fn election_result_times_out_without_candidates() {
    let pool = TestPool::start();

    let member = pool.join();

    let result = block_on(member.get_election_result("nobody", Some(Duration::from_millis(50))));

    assert_eq!(result.unwrap(), None);
}
