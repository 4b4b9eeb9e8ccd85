mod harness;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use futures::executor::block_on;

use pool_registry::{EventHandler, Identifier};

use harness::{eventually, TestPool};

/// Blocks in every `joined` callback until released.
struct Gatekeeper {
    calls: Arc<AtomicUsize>,
    entered: Mutex<mpsc::Sender<Identifier>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl EventHandler for Gatekeeper {
    fn joined(&self, member: &Identifier) {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let _ = self.entered.lock().unwrap().send(member.clone());
        let _ = self.release.lock().unwrap().recv();
    }
}

#[derive(Default)]
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl EventHandler for Recorder {
    fn joined(&self, member: &Identifier) {
        self.log.lock().unwrap().push(format!("joined {}", member.id()));
    }

    fn left(&self, member: &Identifier) {
        self.log.lock().unwrap().push(format!("left {}", member.id()));
    }

    fn got_signal(&self, signal: &str, source: &Identifier) {
        self.log
            .lock()
            .unwrap()
            .push(format!("signal {} from {}", signal, source.id()));
    }

    fn elected(&self, election: &str, winner: &Identifier) {
        self.log
            .lock()
            .unwrap()
            .push(format!("elected {} for {}", winner.id(), election));
    }

    fn pool_terminated(&self, source: &Identifier) {
        self.log
            .lock()
            .unwrap()
            .push(format!("terminated by {}", source.id()));
    }
}

#[test]
fn disabling_waits_for_running_callback() {
    let pool = TestPool::start();

    let calls = Arc::new(AtomicUsize::new(0));
    let (entered_send, entered) = mpsc::channel();
    let (release, release_recv) = mpsc::channel();

    let member = Arc::new(pool.join_handled(Gatekeeper {
        calls: Arc::clone(&calls),
        entered: Mutex::new(entered_send),
        release: Mutex::new(release_recv),
    }));

    // nothing is delivered before events are enabled
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    block_on(member.enable_events()).unwrap();

    let joined = entered.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(joined, *member.identifier());

    let (disabled_send, disabled) = mpsc::channel();
    {
        let member = Arc::clone(&member);

        std::thread::spawn(move || {
            block_on(member.disable_events()).unwrap();
            let _ = disabled_send.send(());
        });
    }

    assert!(disabled.recv_timeout(Duration::from_millis(200)).is_err());

    release.send(()).unwrap();
    disabled.recv_timeout(Duration::from_secs(5)).unwrap();

    let other = pool.join();

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    block_on(member.enable_events()).unwrap();

    let joined = entered.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(joined, *other.identifier());

    release.send(()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn callbacks_arrive_in_event_order() {
    let pool = TestPool::start();

    let recorder = Recorder::default();
    let log = Arc::clone(&recorder.log);

    let first = pool.join_handled(recorder);
    block_on(first.enable_events()).unwrap();

    let second = pool.join();

    eventually("the join was delivered", || log.lock().unwrap().len() == 2);

    block_on(second.elect("leader")).unwrap();
    block_on(second.signal("wake up", &[first.identifier().clone()])).unwrap();
    block_on(second.leave()).unwrap();
    block_on(first.terminate()).unwrap();

    eventually("all events were delivered", || log.lock().unwrap().len() == 6);

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "joined 0",
            "joined 1",
            "elected 1 for leader",
            "signal wake up from 1",
            "left 1",
            "terminated by 0",
        ]
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>()
    );
}

#[test]
fn signals_reach_only_their_targets() {
    let pool = TestPool::start();

    let sender = pool.join();
    let target = pool.join();
    let bystander = pool.join();

    block_on(sender.signal("hello", &[target.identifier().clone()])).unwrap();
    block_on(sender.signal("all", &[
        target.identifier().clone(),
        bystander.identifier().clone(),
    ]))
    .unwrap();

    let mut received = Vec::new();
    eventually("both signals arrived", || {
        received.extend(block_on(target.received_signals()).unwrap());
        received.len() == 2
    });
    assert_eq!(received, vec!["hello".to_owned(), "all".to_owned()]);

    let mut received = Vec::new();
    eventually("the broadcast arrived", || {
        received.extend(block_on(bystander.received_signals()).unwrap());
        !received.is_empty()
    });
    assert_eq!(received, vec!["all".to_owned()]);

    assert!(block_on(sender.received_signals()).unwrap().is_empty());
}

#[test]
fn termination_is_seen_by_every_member() {
    let pool = TestPool::start();

    let first = pool.join();
    let second = pool.join();

    assert!(!block_on(second.has_terminated()).unwrap());

    block_on(first.terminate()).unwrap();

    let terminator =
        block_on(second.wait_until_terminated(Some(Duration::from_secs(5)))).unwrap();

    assert_eq!(terminator, Some(first.identifier().clone()));
    assert!(block_on(second.has_terminated()).unwrap());

    let terminator =
        block_on(first.wait_until_terminated(Some(Duration::from_secs(5)))).unwrap();

    assert_eq!(terminator, Some(first.identifier().clone()));
}
