//! Binary event log of runtime activity.
//!
//! Each record is a little-endian `{ event_type: u32, payload_size: u32 }` header followed by
//! `payload_size` bytes of payload. Payload fields are little-endian `u32`s.

use std::{io::Write, sync::Mutex};

use xenon_cpu::BackendKind;

pub const FUNCTION_COMPILED: u32 = 1;
pub const FUNCTION_ENTER: u32 = 2;
pub const BREAKPOINT_HIT: u32 = 3;
pub const FUNCTION_FAILED: u32 = 4;

const HEADER_SIZE: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    FunctionCompiled { address: u32, end_address: u32, backend: u32 },
    FunctionEnter { address: u32, thread_id: u32 },
    BreakpointHit { address: u32 },
    FunctionFailed { address: u32 },
}

impl TraceEvent {
    pub fn compiled(address: u32, end_address: u32, backend: BackendKind) -> Self {
        Self::FunctionCompiled { address, end_address, backend: backend.as_u32() }
    }

    pub fn event_type(&self) -> u32 {
        match self {
            Self::FunctionCompiled { .. } => FUNCTION_COMPILED,
            Self::FunctionEnter { .. } => FUNCTION_ENTER,
            Self::BreakpointHit { .. } => BREAKPOINT_HIT,
            Self::FunctionFailed { .. } => FUNCTION_FAILED,
        }
    }

    fn fields(&self) -> Vec<u32> {
        match *self {
            Self::FunctionCompiled { address, end_address, backend } => {
                vec![address, end_address, backend]
            }
            Self::FunctionEnter { address, thread_id } => vec![address, thread_id],
            Self::BreakpointHit { address } | Self::FunctionFailed { address } => vec![address],
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        self.fields().into_iter().flat_map(u32::to_le_bytes).collect()
    }

    /// Decodes the payload of a record, returns `None` for unknown or truncated events.
    pub fn decode(event_type: u32, payload: &[u8]) -> Option<Self> {
        let field = |i: usize| {
            let bytes = payload.get(i * 4..i * 4 + 4)?;
            Some(u32::from_le_bytes(bytes.try_into().ok()?))
        };
        Some(match event_type {
            FUNCTION_COMPILED => Self::FunctionCompiled {
                address: field(0)?,
                end_address: field(1)?,
                backend: field(2)?,
            },
            FUNCTION_ENTER => Self::FunctionEnter { address: field(0)?, thread_id: field(1)? },
            BREAKPOINT_HIT => Self::BreakpointHit { address: field(0)? },
            FUNCTION_FAILED => Self::FunctionFailed { address: field(0)? },
            _ => return None,
        })
    }
}

/// Writes trace records to an optional output. Writes from different threads are serialized.
#[derive(Default)]
pub struct Tracer {
    output: Mutex<Option<Box<dyn Write + Send>>>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_output(&self, output: Box<dyn Write + Send>) {
        *self.output.lock().unwrap_or_else(|e| e.into_inner()) = Some(output);
    }

    /// Stops tracing, returning the previous output.
    pub fn take_output(&self) -> Option<Box<dyn Write + Send>> {
        self.output.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn is_enabled(&self) -> bool {
        self.output.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn write_event(&self, event_type: u32, data: &[u8]) -> std::io::Result<()> {
        let mut output = self.output.lock().unwrap_or_else(|e| e.into_inner());
        let Some(out) = output.as_mut() else { return Ok(()) };

        let mut record = Vec::with_capacity(HEADER_SIZE + data.len());
        record.extend_from_slice(&event_type.to_le_bytes());
        record.extend_from_slice(&(data.len() as u32).to_le_bytes());
        record.extend_from_slice(data);
        out.write_all(&record)?;
        out.flush()
    }

    /// Records `event`, logging (instead of returning) any IO error.
    pub fn emit(&self, event: TraceEvent) {
        if let Err(e) = self.write_event(event.event_type(), &event.payload()) {
            tracing::error!("failed to write trace event: {e}");
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceRecord {
    pub event_type: u32,
    pub payload: Vec<u8>,
}

impl TraceRecord {
    pub fn event(&self) -> Option<TraceEvent> {
        TraceEvent::decode(self.event_type, &self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    /// The stream ended inside the record starting at this offset.
    Truncated { offset: usize },
}

impl std::fmt::Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { offset } => write!(f, "truncated trace record at offset {offset}"),
        }
    }
}

impl std::error::Error for TraceError {}

/// Parses a stream of trace records.
pub struct TraceReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> TraceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl Iterator for TraceReader<'_> {
    type Item = Result<TraceRecord, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.data[self.offset..];
        if rest.is_empty() {
            return None;
        }

        let start = self.offset;
        let truncated = TraceError::Truncated { offset: start };
        if rest.len() < HEADER_SIZE {
            self.offset = self.data.len();
            return Some(Err(truncated));
        }
        let word = |i: usize| u32::from_le_bytes([rest[i], rest[i + 1], rest[i + 2], rest[i + 3]]);
        let event_type = word(0);
        let size = word(4) as usize;

        let Some(payload) = rest.get(HEADER_SIZE..HEADER_SIZE + size) else {
            self.offset = self.data.len();
            return Some(Err(truncated));
        };
        self.offset += HEADER_SIZE + size;
        Some(Ok(TraceRecord { event_type, payload: payload.to_vec() }))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn records_are_read_back() {
        let buffer = SharedBuffer::default();
        let tracer = Tracer::new();
        assert!(!tracer.is_enabled());
        tracer.emit(TraceEvent::BreakpointHit { address: 0x10 });

        tracer.set_output(Box::new(buffer.clone()));
        tracer.emit(TraceEvent::compiled(0x8200_0000, 0x8200_000c, BackendKind::Native));
        tracer.emit(TraceEvent::FunctionEnter { address: 0x8200_0000, thread_id: 3 });
        tracer.write_event(99, &[1, 2, 3]).unwrap();

        let data = buffer.0.lock().unwrap().clone();
        assert_eq!(&data[..8], &[1, 0, 0, 0, 12, 0, 0, 0]);

        let records: Vec<_> = TraceReader::new(&data).map(Result::unwrap).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[0].event(),
            Some(TraceEvent::FunctionCompiled {
                address: 0x8200_0000,
                end_address: 0x8200_000c,
                backend: 1
            })
        );
        assert_eq!(
            records[1].event(),
            Some(TraceEvent::FunctionEnter { address: 0x8200_0000, thread_id: 3 })
        );
        assert_eq!(records[2], TraceRecord { event_type: 99, payload: vec![1, 2, 3] });
        assert_eq!(records[2].event(), None);
    }

    #[test]
    fn truncated_stream() {
        let mut data = vec![];
        data.extend_from_slice(&FUNCTION_FAILED.to_le_bytes());
        data.extend_from_slice(&4_u32.to_le_bytes());
        data.extend_from_slice(&0x1234_u32.to_le_bytes());
        data.extend_from_slice(&[3, 0, 0, 0, 4, 0]);

        let mut reader = TraceReader::new(&data);
        let first = reader.next().unwrap().unwrap();
        assert_eq!(first.event(), Some(TraceEvent::FunctionFailed { address: 0x1234 }));
        assert_eq!(reader.next(), Some(Err(TraceError::Truncated { offset: 12 })));
        assert_eq!(reader.next(), None);
    }
}
