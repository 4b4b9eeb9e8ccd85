use futures::future::Either;
use futures::stream::StreamExt;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::error::RegistryError;
use crate::executor::Executor;
use crate::snapshot::PoolSnapshot;
use crate::transport::Transport;
use crate::wire::Connection;
use crate::wire::Magic;
use crate::wire::Opcode;
use crate::wire::NO_MINIMUM;

use super::CommunicationHandler;

/// Accepts connections until the pool stops, handing each one to a task of
/// its own.
pub(crate) async fn accept<T: Transport, E: Executor>(
    comm: CommunicationHandler<T, E>,
    mut listener: T::Listener,
) {
    let pool = comm.pool().clone();
    let stopped = pool.stopped();
    futures::pin_mut!(stopped);

    loop {
        match futures::future::select(listener.next(), stopped.as_mut()).await {
            Either::Left((Some(Ok(stream)), _)) => {
                let handler = handle_connection(comm.clone(), stream);

                if let Err(e) = comm.executor().execute(handler) {
                    warn!("Could not spawn connection handler: {}", e);
                }
            }
            Either::Left((Some(Err(e)), _)) => {
                warn!("Could not accept connection: {}", e);
            }
            Either::Left((None, _)) => {
                debug!("Listener closed.");
                break;
            }
            Either::Right(((), _)) => break,
        }
    }

    debug!("Stopped accepting connections.");
}

async fn handle_connection<T: Transport, E: Executor>(
    comm: CommunicationHandler<T, E>,
    stream: T::Stream,
) {
    let mut conn = Connection::new(stream, "incoming connection");

    if let Err(e) = dispatch(&comm, &mut conn).await {
        debug!("Handling incoming connection failed: {}", e);
    }

    if let Err(e) = conn.close().await {
        trace!("Closing incoming connection failed: {}", e);
    }
}

async fn dispatch<T: Transport, E: Executor>(
    comm: &CommunicationHandler<T, E>,
    conn: &mut Connection<T::Stream>,
) -> Result<(), RegistryError> {
    let magic = conn.read_u8().await?;

    if Magic::from_byte(magic) != Some(Magic::Peer) {
        return reject(conn, format!("unexpected magic byte {}", magic)).await;
    }

    let opcode = conn.read_u8().await?;

    match Opcode::from_byte(opcode) {
        Some(Opcode::Gossip) => handle_gossip(comm, conn).await,
        Some(Opcode::Push) => handle_push(comm, conn).await,
        Some(Opcode::Ping) => handle_ping(comm, conn).await,
        Some(Opcode::GetState) => handle_get_state(comm, conn).await,
        _ => reject(conn, format!("unexpected opcode {}", opcode)).await,
    }
}

/// Replies with an error and fails with a protocol error.
async fn reject<S>(conn: &mut Connection<S>, message: String) -> Result<(), RegistryError>
where
    S: futures::io::AsyncRead + futures::io::AsyncWrite + Unpin,
{
    conn.write_error(&message);
    conn.flush().await?;

    Err(RegistryError::Protocol(message))
}

async fn handle_gossip<T: Transport, E: Executor>(
    comm: &CommunicationHandler<T, E>,
    conn: &mut Connection<T::Stream>,
) -> Result<(), RegistryError> {
    let peer = conn.read_identifier().await?;
    let peer_time = conn.read_u32().await?;

    if peer.pool() != comm.config().pool_name() {
        return reject(conn, format!("wrong pool `{}`", peer.pool())).await;
    }

    let local_time = comm.pool().status().await?.time;

    conn.write_ok();
    conn.write_u32(local_time);

    if local_time > peer_time {
        let events = comm.pool().events_from(peer_time).await?;
        conn.write_events(&events);
        conn.flush().await?;
    } else if local_time < peer_time {
        conn.flush().await?;

        let events = conn.read_events().await?;
        trace!("Gossip from {} yielded {} events.", peer, events.len());
        comm.pool().new_events(events).await?;
    } else {
        conn.flush().await?;
    }

    Ok(())
}

async fn handle_push<T: Transport, E: Executor>(
    comm: &CommunicationHandler<T, E>,
    conn: &mut Connection<T::Stream>,
) -> Result<(), RegistryError> {
    let pool_name = conn.read_string().await?;

    if pool_name != comm.config().pool_name() {
        return reject(conn, format!("wrong pool `{}`", pool_name)).await;
    }

    let pool = comm.pool();
    let initialized = pool.status().await?.initialized;
    let join_time = comm.membership().await.map_or(0, |m| m.join_time);

    conn.write_ok();
    conn.write_bool(!initialized);
    conn.write_u32(join_time);
    conn.write_u32(pool.next_required_event().await?);
    conn.flush().await?;

    let snapshot = if initialized {
        None
    } else {
        Some(PoolSnapshot::decode(conn.read_bytes().await?).await?)
    };
    let events = conn.read_events().await?;
    let minimum = conn.read_i32().await?;

    if let Some(snapshot) = snapshot {
        pool.init(snapshot).await?;
    }

    pool.new_events(events).await?;

    if minimum != NO_MINIMUM {
        let minimum = u32::try_from(minimum)
            .map_err(|_| RegistryError::protocol(format!("invalid minimum time {}", minimum)))?;

        pool.purge_history_up_to(minimum).await?;
    }

    Ok(())
}

async fn handle_ping<T: Transport, E: Executor>(
    comm: &CommunicationHandler<T, E>,
    conn: &mut Connection<T::Stream>,
) -> Result<(), RegistryError> {
    let stopped = comm.pool().is_stopped().await;

    let membership = match comm.membership().await {
        Some(membership) if !stopped => membership,
        _ => return reject(conn, "not a member".into()).await,
    };

    conn.write_ok();
    conn.write_identifier(&membership.identifier);
    conn.flush().await
}

async fn handle_get_state<T: Transport, E: Executor>(
    comm: &CommunicationHandler<T, E>,
    conn: &mut Connection<T::Stream>,
) -> Result<(), RegistryError> {
    let peer = conn.read_identifier().await?;
    let join_time = conn.read_u32().await?;

    if peer.pool() != comm.config().pool_name() {
        return reject(conn, format!("wrong pool `{}`", peer.pool())).await;
    }

    let required = match join_time.checked_add(1) {
        Some(required) => required,
        None => return reject(conn, format!("invalid join time {}", join_time)).await,
    };

    // The requester needs a snapshot that includes its own join. Half the
    // timeout is left for the reply to reach it.
    let caught_up = comm
        .pool()
        .wait_for_event_time(required, Some(comm.config().connect_timeout() / 2))
        .await?;

    let snapshot = if caught_up {
        comm.pool().prepare_snapshot(join_time).await?
    } else {
        None
    };

    match snapshot {
        Some(snapshot) => {
            conn.write_ok();
            conn.write_bytes(&snapshot.encode());
            conn.flush().await
        }
        None => reject(conn, format!("no state for time {} available", required)).await,
    }
}
