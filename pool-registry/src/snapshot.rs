use std::sync::Arc;

use futures::io::AsyncRead;
use futures::io::AsyncWrite;
use futures::io::Cursor;

use crate::error::RegistryError;
use crate::event::Event;
use crate::event::Time;
use crate::wire::Connection;

/// Everything a member needs to continue from `time` on.
///
/// Members and elections are kept in their serialized form so that a snapshot
/// does not depend on the member set representation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub(crate) time: Time,
    pub(crate) members: Vec<u8>,
    pub(crate) elections: Vec<u8>,
    pub(crate) signals: Vec<Arc<Event>>,
    pub(crate) close_event: Option<Arc<Event>>,
    pub(crate) terminate_event: Option<Arc<Event>>,
}

impl PoolSnapshot {
    pub fn time(&self) -> Time {
        self.time
    }

    pub(crate) fn write_to<S>(&self, conn: &mut Connection<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        conn.write_u32(self.time);
        conn.write_bytes(&self.members);
        conn.write_bytes(&self.elections);
        conn.write_events(&self.signals);

        for event in [&self.close_event, &self.terminate_event] {
            match event {
                Some(e) => {
                    conn.write_bool(true);
                    conn.write_event(e);
                }
                None => conn.write_bool(false),
            }
        }
    }

    pub(crate) async fn read_from<S>(conn: &mut Connection<S>) -> Result<Self, RegistryError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let time = conn.read_u32().await?;
        let members = conn.read_bytes().await?;
        let elections = conn.read_bytes().await?;
        let signals = conn.read_events().await?;
        let close_event = read_optional_event(conn).await?;
        let terminate_event = read_optional_event(conn).await?;

        Ok(Self {
            time,
            members,
            elections,
            signals,
            close_event,
            terminate_event,
        })
    }

    /// Serializes the snapshot into a self contained blob.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut conn = Connection::new(Cursor::new(Vec::new()), "snapshot");
        self.write_to(&mut conn);
        conn.take_output()
    }

    pub(crate) async fn decode(bytes: Vec<u8>) -> Result<Self, RegistryError> {
        let mut conn = Connection::new(Cursor::new(bytes), "snapshot");
        Self::read_from(&mut conn).await
    }
}

async fn read_optional_event<S>(
    conn: &mut Connection<S>,
) -> Result<Option<Arc<Event>>, RegistryError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Ok(if conn.read_bool().await? {
        Some(Arc::new(conn.read_event().await?))
    } else {
        None
    })
}
