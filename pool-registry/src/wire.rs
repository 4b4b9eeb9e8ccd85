//! Wire protocol shared by members and the server.
//!
//! Every connection starts with a magic byte telling whether a member talks to
//! the server or to a peer, followed by an opcode. Every reply starts with a
//! status byte that has to be checked before the rest of the reply is read.
//! All integers are big-endian.

use std::sync::Arc;

use futures::io::AsyncRead;
use futures::io::AsyncReadExt;
use futures::io::AsyncWrite;
use futures::io::AsyncWriteExt;

use crate::error::IoError;
use crate::error::RegistryError;
use crate::event::Event;
use crate::event::EventKind;
use crate::identifier::Identifier;

/// Upper bound on strings, blobs and lists read off the wire.
const MAX_LENGTH: usize = 64 * 1024 * 1024;

const REPLY_OK: u8 = 1;
const REPLY_ERROR: u8 = 2;

/// No events may be purged, used in place of a minimum event time.
pub(crate) const NO_MINIMUM: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Magic {
    Server,
    Peer,
}

impl Magic {
    pub fn to_byte(self) -> u8 {
        match self {
            Magic::Server => 0x5c,
            Magic::Peer => 0x7a,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x5c => Some(Magic::Server),
            0x7a => Some(Magic::Peer),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Opcode {
    Join,
    Leave,
    Elect,
    SequenceNr,
    Dead,
    MaybeDead,
    Signal,
    GetState,
    Heartbeat,
    Terminate,
    Gossip,
    Push,
    Ping,
    AddTokens,
    GetToken,
}

impl Opcode {
    pub fn to_byte(self) -> u8 {
        match self {
            Opcode::Join => 0,
            Opcode::Leave => 1,
            Opcode::Elect => 2,
            Opcode::SequenceNr => 3,
            Opcode::Dead => 4,
            Opcode::MaybeDead => 5,
            Opcode::Signal => 6,
            Opcode::GetState => 7,
            Opcode::Heartbeat => 8,
            Opcode::Terminate => 9,
            Opcode::Gossip => 10,
            Opcode::Push => 11,
            Opcode::Ping => 12,
            Opcode::AddTokens => 13,
            Opcode::GetToken => 14,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Opcode::Join,
            1 => Opcode::Leave,
            2 => Opcode::Elect,
            3 => Opcode::SequenceNr,
            4 => Opcode::Dead,
            5 => Opcode::MaybeDead,
            6 => Opcode::Signal,
            7 => Opcode::GetState,
            8 => Opcode::Heartbeat,
            9 => Opcode::Terminate,
            10 => Opcode::Gossip,
            11 => Opcode::Push,
            12 => Opcode::Ping,
            13 => Opcode::AddTokens,
            14 => Opcode::GetToken,
            _ => return None,
        })
    }
}

/// A byte stream with a write buffer.
///
/// Writes only fill the buffer, [`flush`][Connection::flush] sends it.
pub(crate) struct Connection<S> {
    stream: S,
    out: Vec<u8>,
    peer: String,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            out: Vec::new(),
            peer: peer.into(),
        }
    }

    #[cfg(any(test, feature = "prototyping"))]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Takes whatever has been written but not flushed.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    pub fn write_header(&mut self, magic: Magic, opcode: Opcode) {
        self.write_u8(magic.to_byte());
        self.write_u8(opcode.to_byte());
    }

    pub fn write_u8(&mut self, value: u8) {
        self.out.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    pub fn write_u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    #[cfg(any(test, feature = "prototyping"))]
    pub fn write_i64(&mut self, value: i64) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_len(&mut self, len: usize) {
        self.write_u32(len as u32);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_len(value.len());
        self.out.extend_from_slice(value);
    }

    pub fn write_identifier(&mut self, identifier: &Identifier) {
        self.write_u64(identifier.id());
        self.write_str(identifier.pool());
        self.write_str(identifier.address());
        self.write_str(identifier.location());
        self.write_bytes(identifier.data());
    }

    pub fn write_identifiers<'a>(
        &mut self,
        identifiers: impl ExactSizeIterator<Item = &'a Identifier>,
    ) {
        self.write_len(identifiers.len());

        for identifier in identifiers {
            self.write_identifier(identifier);
        }
    }

    pub fn write_event(&mut self, event: &Event) {
        self.write_u8(event.kind().to_byte());
        self.write_u32(event.time());

        match event.description() {
            Some(d) => {
                self.write_bool(true);
                self.write_str(d);
            }
            None => self.write_bool(false),
        }

        self.write_identifiers(event.ibises().iter());
    }

    pub fn write_events(&mut self, events: &[Arc<Event>]) {
        self.write_len(events.len());

        for event in events {
            self.write_event(event);
        }
    }

    async fn read_array<const N: usize>(&mut self) -> Result<[u8; N], RegistryError> {
        let mut buf = [0; N];

        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| IoError::new(format!("reading from {}", self.peer), e))?;

        Ok(buf)
    }

    pub async fn read_u8(&mut self) -> Result<u8, RegistryError> {
        Ok(self.read_array::<1>().await?[0])
    }

    pub async fn read_bool(&mut self) -> Result<bool, RegistryError> {
        match self.read_u8().await? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(RegistryError::protocol(format!("invalid boolean {}", b))),
        }
    }

    pub async fn read_u32(&mut self) -> Result<u32, RegistryError> {
        Ok(u32::from_be_bytes(self.read_array().await?))
    }

    pub async fn read_i32(&mut self) -> Result<i32, RegistryError> {
        Ok(i32::from_be_bytes(self.read_array().await?))
    }

    pub async fn read_u64(&mut self) -> Result<u64, RegistryError> {
        Ok(u64::from_be_bytes(self.read_array().await?))
    }

    pub async fn read_i64(&mut self) -> Result<i64, RegistryError> {
        Ok(i64::from_be_bytes(self.read_array().await?))
    }

    pub async fn read_len(&mut self) -> Result<usize, RegistryError> {
        let len = self.read_u32().await? as usize;

        if len > MAX_LENGTH {
            return Err(RegistryError::protocol(format!("length {} out of bounds", len)));
        }

        Ok(len)
    }

    pub async fn read_bytes(&mut self) -> Result<Vec<u8>, RegistryError> {
        let len = self.read_len().await?;
        let mut buf = vec![0; len];

        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| IoError::new(format!("reading from {}", self.peer), e))?;

        Ok(buf)
    }

    pub async fn read_string(&mut self) -> Result<String, RegistryError> {
        let bytes = self.read_bytes().await?;

        String::from_utf8(bytes).map_err(|e| {
            IoError::invalid_data(format!("reading string from {}", self.peer), e).into()
        })
    }

    pub async fn read_identifier(&mut self) -> Result<Identifier, RegistryError> {
        let id = self.read_u64().await?;
        let pool = self.read_string().await?;
        let address = self.read_string().await?;
        let location = self.read_string().await?;
        let data = self.read_bytes().await?;

        Ok(Identifier::new(id, pool, address, location, data))
    }

    pub async fn read_identifiers(&mut self) -> Result<Vec<Identifier>, RegistryError> {
        let len = self.read_len().await?;
        let mut identifiers = Vec::with_capacity(len.min(1024));

        for _ in 0..len {
            identifiers.push(self.read_identifier().await?);
        }

        Ok(identifiers)
    }

    pub async fn read_event(&mut self) -> Result<Event, RegistryError> {
        let kind = self.read_u8().await?;
        let kind = EventKind::from_byte(kind)
            .ok_or_else(|| RegistryError::protocol(format!("unknown event type {}", kind)))?;
        let time = self.read_u32().await?;
        let description = if self.read_bool().await? {
            Some(self.read_string().await?)
        } else {
            None
        };
        let ibises = self.read_identifiers().await?;

        Ok(Event::new(kind, time, description, ibises))
    }

    pub async fn read_events(&mut self) -> Result<Vec<Arc<Event>>, RegistryError> {
        let len = self.read_len().await?;
        let mut events = Vec::with_capacity(len.min(1024));

        for _ in 0..len {
            events.push(Arc::new(self.read_event().await?));
        }

        Ok(events)
    }

    pub async fn flush(&mut self) -> Result<(), RegistryError> {
        let out = std::mem::take(&mut self.out);

        self.stream
            .write_all(&out)
            .await
            .map_err(|e| IoError::new(format!("writing to {}", self.peer), e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| IoError::new(format!("flushing to {}", self.peer), e))?;

        Ok(())
    }

    pub async fn close(mut self) -> Result<(), RegistryError> {
        self.flush().await?;
        self.stream
            .close()
            .await
            .map_err(|e| IoError::new(format!("closing connection to {}", self.peer), e))?;

        Ok(())
    }

    /// Writes the OK status. Reply fields may follow before the next flush.
    pub fn write_ok(&mut self) {
        self.write_u8(REPLY_OK);
    }

    /// Replaces anything written but not yet flushed with an error status.
    pub fn write_error(&mut self, message: &str) {
        self.out.clear();
        self.write_u8(REPLY_ERROR);
        self.write_str(message);
    }

    /// Reads the status of a reply, turning error replies into errors.
    pub async fn check_reply(&mut self) -> Result<(), RegistryError> {
        match self.read_u8().await? {
            REPLY_OK => Ok(()),
            REPLY_ERROR => Err(RegistryError::Remote(self.read_string().await?)),
            status => Err(RegistryError::protocol(format!(
                "unknown reply status {} from {}",
                status, self.peer
            ))),
        }
    }
}
