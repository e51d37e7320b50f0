//! Write-ahead journal of typed, replayable state mutations.
//!
//! Every record on the output stream is laid out as
//! `[u32 BE opcode][u64 BE payload length][u32 BE checksum][payload]`, where
//! the payload is the MessagePack encoding of the entry registered under that
//! opcode and the checksum is the CRC-32C of opcode, length and payload.
//! Writes are durable on return; replay applies complete records in file
//! order and treats a truncated or torn trailing record as the end of the
//! log.

mod sink;

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::marker::PhantomData;

use crate::utils::DagError;

use serde::de::DeserializeOwned;
use serde::Serialize;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncRead, AsyncReadExt};

use crc32c::{crc32c, crc32c_append};

pub use sink::{FileSink, JournalSink};

#[cfg(test)]
pub(crate) use sink::MemSink;

/// Journal operation code type.
pub type OpCode = u32;

/// Size of the fixed record header: opcode + payload length + checksum.
pub const RECORD_HEADER_LEN: usize = 4 + 8 + 4;

/// A typed mutation that can be recorded in the journal and applied to some
/// live state `S`. Applying the same entry twice must yield the same state as
/// applying it once.
pub trait JournalEntry<S>:
    Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
    /// Operation code this entry is registered under.
    const OPCODE: OpCode;

    /// Applies the mutation to live state.
    fn apply(&self, state: &mut S) -> Result<(), DagError>;
}

/// Replay-side handler bound to an opcode.
pub trait EntryHandler<S>: Send + Sync {
    /// Decodes the payload and applies it to the given state.
    fn replay(&self, payload: &[u8], state: &mut S) -> Result<(), DagError>;
}

/// Generic replay handler for any `JournalEntry` type.
pub struct Replayer<E>(PhantomData<fn() -> E>);

impl<E> Replayer<E> {
    pub fn new() -> Self {
        Replayer(PhantomData)
    }
}

impl<E> Default for Replayer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, E> EntryHandler<S> for Replayer<E>
where
    E: JournalEntry<S>,
{
    fn replay(&self, payload: &[u8], state: &mut S) -> Result<(), DagError> {
        let entry: E = decode_from_slice(payload)?;
        pf_trace!("replaying {:?}", entry);
        entry.apply(state)
    }
}

/// Thresholds after which routine journal growth should be folded into a
/// fresh snapshot. A zero bound is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Maximum number of entries written since the last rotation.
    pub max_entries: usize,

    /// Maximum number of bytes written since the last rotation.
    pub max_bytes: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        RotationPolicy {
            max_entries: 1000,
            max_bytes: 1024 * 1024,
        }
    }
}

impl RotationPolicy {
    /// Policy that never asks for rotation.
    pub fn never() -> Self {
        RotationPolicy {
            max_entries: 0,
            max_bytes: 0,
        }
    }

    fn reached(&self, entries: usize, bytes: usize) -> bool {
        (self.max_entries > 0 && entries >= self.max_entries)
            || (self.max_bytes > 0 && bytes >= self.max_bytes)
    }
}

/// Outcome of a replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Number of entries applied.
    pub applied: usize,

    /// Length in bytes of the well-formed prefix that was consumed.
    pub valid_len: usize,

    /// True if a partial trailing record was found and ignored.
    pub truncated: bool,
}

/// The write-ahead journal over live state of type `S`.
pub struct Journal<S> {
    /// Map from opcode -> replay handler.
    handlers: HashMap<OpCode, Box<dyn EntryHandler<S>>>,

    /// Current output stream; `None` until one is set.
    output: Option<Box<dyn JournalSink>>,

    /// Rotation thresholds evaluated after every write.
    policy: RotationPolicy,

    /// Entries written since the output was last set.
    entries_written: usize,

    /// Bytes written since the output was last set.
    bytes_written: usize,
}

impl<S> Journal<S> {
    /// Creates a journal with no handlers and no output stream.
    pub fn new(policy: RotationPolicy) -> Self {
        Journal {
            handlers: HashMap::new(),
            output: None,
            policy,
            entries_written: 0,
            bytes_written: 0,
        }
    }

    /// Binds an opcode to its replay handler.
    pub fn register(
        &mut self,
        code: OpCode,
        handler: Box<dyn EntryHandler<S>>,
    ) -> Result<(), DagError>
    where
        S: 'static,
    {
        if self.handlers.contains_key(&code) {
            return logged_err!("journal opcode {} registered twice", code);
        }
        self.handlers.insert(code, handler);
        Ok(())
    }

    /// Registers the generic replayer of entry type `E` under its opcode.
    pub fn register_entry<E>(&mut self) -> Result<(), DagError>
    where
        S: 'static,
        E: JournalEntry<S>,
    {
        self.register(E::OPCODE, Box::new(Replayer::<E>::new()))
    }

    /// Replaces the output stream, resetting the rotation counters. The old
    /// stream, if any, is dropped.
    pub fn set_output(&mut self, output: Box<dyn JournalSink>) {
        self.output = Some(output);
        self.entries_written = 0;
        self.bytes_written = 0;
    }

    /// Returns true if an output stream is set. A failed write drops the
    /// output, so this is false until a new one is set.
    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// Number of entries written since the output was last set.
    pub fn entries_written(&self) -> usize {
        self.entries_written
    }

    /// Number of bytes written since the output was last set.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// Returns true if the rotation policy asks for a fresh snapshot.
    pub fn rotation_due(&self) -> bool {
        self.policy.reached(self.entries_written, self.bytes_written)
    }

    /// Encodes one entry into its on-stream record bytes.
    pub fn encode_record<E>(entry: &E) -> Result<Vec<u8>, DagError>
    where
        E: JournalEntry<S>,
    {
        let payload = encode_to_vec(entry)?;
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        record.extend_from_slice(&E::OPCODE.to_be_bytes());
        record.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        let checksum = crc32c_append(crc32c(&record), &payload);
        record.extend_from_slice(&checksum.to_be_bytes());
        record.extend_from_slice(&payload);
        Ok(record)
    }

    /// Serializes and appends the entry to the output stream. Returns only
    /// once the sink reports the bytes durable; the entry is NOT applied to
    /// any state here. A failed write is not retried: the output stream may
    /// hold part of the record, so it is dropped and every later write fails
    /// until a new stream is set.
    pub async fn write<E>(&mut self, entry: &E) -> Result<(), DagError>
    where
        E: JournalEntry<S>,
    {
        if !self.handlers.contains_key(&E::OPCODE) {
            return logged_err!(
                "writing unregistered journal opcode {}",
                E::OPCODE
            );
        }
        let record = Self::encode_record(entry)?;
        let output = match self.output.as_mut() {
            Some(output) => output,
            None => return logged_err!("journal has no output stream"),
        };

        if let Err(e) = output.append(&record).await {
            pf_error!("journal append failed, output dropped: {}", e);
            self.output = None;
            return Err(e);
        }
        self.entries_written += 1;
        self.bytes_written += record.len();
        pf_trace!("journaled {:?}", entry);

        if self.rotation_due() {
            pf_debug!(
                "journal rotation due after {} entries {} bytes",
                self.entries_written,
                self.bytes_written
            );
        }
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes unless the stream ends first. Returns
    /// the number of bytes actually read.
    async fn read_full<R>(
        reader: &mut R,
        buf: &mut [u8],
    ) -> Result<usize, DagError>
    where
        R: AsyncRead + Unpin,
    {
        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    /// Reads entries sequentially until end of stream and applies each one
    /// through its registered handler, in file order. A partial or torn
    /// (checksum mismatch) trailing record ends replay without being applied.
    /// A checksum mismatch followed by more data, and an unknown opcode, are
    /// fatal.
    pub async fn replay<R>(
        &self,
        reader: &mut R,
        state: &mut S,
    ) -> Result<ReplayStats, DagError>
    where
        R: AsyncRead + Unpin,
    {
        let mut stats = ReplayStats {
            applied: 0,
            valid_len: 0,
            truncated: false,
        };

        loop {
            let mut header = [0u8; RECORD_HEADER_LEN];
            let got = Self::read_full(reader, &mut header).await?;
            if got == 0 {
                break; // clean end of log
            }
            if got < RECORD_HEADER_LEN {
                pf_warn!(
                    "journal record header truncated at offset {}",
                    stats.valid_len
                );
                stats.truncated = true;
                break;
            }

            let mut code_bytes = [0u8; 4];
            code_bytes.copy_from_slice(&header[..4]);
            let code = OpCode::from_be_bytes(code_bytes);
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&header[4..12]);
            let payload_len = u64::from_be_bytes(len_bytes);
            let mut sum_bytes = [0u8; 4];
            sum_bytes.copy_from_slice(&header[12..]);
            let checksum = u32::from_be_bytes(sum_bytes);

            // the length is untrusted until the checksum matches: read no
            // more than the stream actually holds
            let mut payload = Vec::new();
            let got = (&mut *reader)
                .take(payload_len)
                .read_to_end(&mut payload)
                .await? as u64;
            if got < payload_len {
                pf_warn!(
                    "journal record payload truncated at offset {}: {} < {}",
                    stats.valid_len,
                    got,
                    payload_len
                );
                stats.truncated = true;
                break;
            }

            if crc32c_append(crc32c(&header[..12]), &payload) != checksum {
                let mut next = [0u8; 1];
                if Self::read_full(reader, &mut next).await? == 0 {
                    pf_warn!(
                        "journal record torn at offset {}",
                        stats.valid_len
                    );
                    stats.truncated = true;
                    break;
                }
                return logged_err!(
                    "journal record corrupt at offset {}",
                    stats.valid_len
                );
            }

            let handler = match self.handlers.get(&code) {
                Some(handler) => handler,
                None => {
                    return logged_err!(
                        "unknown journal opcode {} at offset {}",
                        code,
                        stats.valid_len
                    );
                }
            };
            handler.replay(&payload, state)?;

            stats.applied += 1;
            stats.valid_len += RECORD_HEADER_LEN + payload.len();
        }

        pf_debug!(
            "journal replay applied {} entries ({} bytes)",
            stats.applied,
            stats.valid_len
        );
        Ok(stats)
    }
}
