mod harness;

use std::time::{Duration, Instant};

use futures::executor::block_on;
use futures::io::{AsyncReadExt, AsyncWriteExt};

use pool_registry::Transport;

use harness::{member_count, TestPool};

fn put_bytes(request: &mut Vec<u8>, bytes: &[u8]) {
    request.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    request.extend_from_slice(bytes);
}

#[test]
fn bootstrap_gives_up_on_silent_peer() {
    let pool = TestPool::start();

    let first = pool.join();
    block_on(pool.network.hang(first.identifier().address()));

    let config = pool.config().with_connect_timeout(Duration::from_millis(500));
    let started = Instant::now();
    let second = pool.join_with(config);

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(pool.state_requests(), 1);
    assert_eq!(member_count(&second), 2);
    assert_eq!(block_on(second.time()).unwrap(), 2);
}

#[test]
fn state_request_with_last_join_time_is_rejected() {
    let pool = TestPool::start();
    let member = pool.join();

    let mut request = vec![0x7a, 7];
    request.extend_from_slice(&99u64.to_be_bytes());
    put_bytes(&mut request, pool.name.as_bytes());
    put_bytes(&mut request, b"nowhere");
    put_bytes(&mut request, b"");
    put_bytes(&mut request, b"");
    request.extend_from_slice(&u32::MAX.to_be_bytes());

    let reply = block_on(async {
        let mut stream = pool
            .network
            .connect(member.identifier().address())
            .await
            .unwrap();

        stream.write_all(&request).await.unwrap();
        stream.flush().await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        reply
    });

    assert_eq!(reply.first(), Some(&2));
    assert_eq!(member_count(&member), 1);
}
