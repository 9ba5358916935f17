//! Breakpoints, execution control and the request based debugging interface.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, RwLock,
};

use hashbrown::HashMap;

use crate::Runtime;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    /// Stops every time the address is reached.
    Code,
    /// Stops the next time the address is reached, then removes itself.
    Step,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Breakpoint {
    pub kind: BreakpointKind,
    pub address: u32,
}

impl Breakpoint {
    pub fn code(address: u32) -> Self {
        Self { kind: BreakpointKind::Code, address }
    }

    pub fn step(address: u32) -> Self {
        Self { kind: BreakpointKind::Step, address }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContentSource {
    Symbols,
    Breakpoints,
    Execution,
    Function,
}

impl ContentSource {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Symbols,
            1 => Self::Breakpoints,
            2 => Self::Execution,
            3 => Self::Function,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// A debugger request. Integers in the payload are big-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub source: ContentSource,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(source: ContentSource, words: &[u32]) -> Self {
        Self { source, payload: words.iter().flat_map(|x| x.to_be_bytes()).collect() }
    }

    fn word(&self, index: usize) -> Option<u32> {
        let bytes = self.payload.get(index * 4..index * 4 + 4)?;
        Some(u32::from_be_bytes(bytes.try_into().ok()?))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: ResponseStatus,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self { status: ResponseStatus::Ok, payload }
    }

    /// An error response, the payload holds the message.
    pub fn error(message: impl Into<String>) -> Self {
        Self { status: ResponseStatus::Error, payload: message.into().into_bytes() }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    pub fn word(&self, index: usize) -> Option<u32> {
        let bytes = self.payload.get(index * 4..index * 4 + 4)?;
        Some(u32::from_be_bytes(bytes.try_into().ok()?))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecutionState {
    Running,
    Paused,
}

impl ExecutionState {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Running => 0,
            Self::Paused => 1,
        }
    }
}

const BREAKPOINT_SET: u32 = 0;
const BREAKPOINT_CLEAR: u32 = 1;
const BREAKPOINT_STEP: u32 = 2;

const EXECUTION_QUERY: u32 = 0;
const EXECUTION_PAUSE: u32 = 1;
const EXECUTION_CONTINUE: u32 = 2;

struct ExecutionInfo {
    state: ExecutionState,
    last_break: Option<u32>,
}

pub struct Debugger {
    breakpoints: RwLock<HashMap<u32, BreakpointKind>>,
    pause_requested: AtomicBool,
    execution: Mutex<ExecutionInfo>,
}

impl Default for Debugger {
    fn default() -> Self {
        Self {
            breakpoints: RwLock::new(HashMap::new()),
            pause_requested: AtomicBool::new(false),
            execution: Mutex::new(ExecutionInfo {
                state: ExecutionState::Running,
                last_break: None,
            }),
        }
    }
}

impl Debugger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_breakpoint(&self, address: u32) -> bool {
        self.breakpoints.read().unwrap_or_else(|e| e.into_inner()).contains_key(&address)
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        let breakpoints = self.breakpoints.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<_> =
            breakpoints.iter().map(|(&address, &kind)| Breakpoint { kind, address }).collect();
        list.sort_by_key(|x| x.address);
        list
    }

    /// Returns whether the set of breakpointed addresses changed. A step breakpoint never
    /// replaces a code breakpoint at the same address.
    pub(crate) fn insert(&self, breakpoint: Breakpoint) -> bool {
        let mut breakpoints = self.breakpoints.write().unwrap_or_else(|e| e.into_inner());
        match breakpoints.get_mut(&breakpoint.address) {
            Some(kind) => {
                if breakpoint.kind == BreakpointKind::Code {
                    *kind = BreakpointKind::Code;
                }
                false
            }
            None => {
                breakpoints.insert(breakpoint.address, breakpoint.kind);
                true
            }
        }
    }

    pub(crate) fn remove(&self, address: u32) -> Option<Breakpoint> {
        let mut breakpoints = self.breakpoints.write().unwrap_or_else(|e| e.into_inner());
        breakpoints.remove(&address).map(|kind| Breakpoint { kind, address })
    }

    fn execution(&self) -> std::sync::MutexGuard<'_, ExecutionInfo> {
        self.execution.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.execution().state
    }

    /// The address of the most recent breakpoint hit.
    pub fn last_break(&self) -> Option<u32> {
        self.execution().last_break
    }

    /// Asks running threads to stop at the next function entry.
    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.pause_requested.store(false, Ordering::Release);
        self.execution().state = ExecutionState::Running;
    }

    /// Consumes a pending pause request, moving to the paused state.
    pub(crate) fn take_pause_request(&self, address: u32) -> bool {
        if !self.pause_requested.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.record_stop(address);
        true
    }

    /// Records a breakpoint hit at `address`, returning the breakpoint if one is registered there.
    pub(crate) fn on_hit(&self, address: u32) -> Option<Breakpoint> {
        self.record_stop(address);
        let kind = *self.breakpoints.read().unwrap_or_else(|e| e.into_inner()).get(&address)?;
        Some(Breakpoint { kind, address })
    }

    fn record_stop(&self, address: u32) {
        let mut execution = self.execution();
        execution.state = ExecutionState::Paused;
        execution.last_break = Some(address);
    }

    pub fn handle_request(&self, runtime: &Runtime, request: Request) -> Response {
        match request.source {
            ContentSource::Symbols => self.symbols_request(runtime, &request),
            ContentSource::Breakpoints => self.breakpoint_request(runtime, &request),
            ContentSource::Execution => self.execution_request(&request),
            ContentSource::Function => self.function_request(runtime, &request),
        }
    }

    /// Handles a request with an untyped content source.
    pub fn handle_raw_request(&self, runtime: &Runtime, source: u32, payload: Vec<u8>) -> Response {
        match ContentSource::from_u32(source) {
            Some(source) => self.handle_request(runtime, Request { source, payload }),
            None => Response::error(format!("unknown content source: {source}")),
        }
    }

    fn symbols_request(&self, runtime: &Runtime, request: &Request) -> Response {
        let Some(address) = request.word(0) else { return Response::error("missing address") };
        let symbols = runtime.symbols();
        let Some(symbol) = symbols.lookup(address).or_else(|| symbols.find_containing(address))
        else {
            return Response::error(format!("no function at {address:#x}"));
        };

        let mut payload = vec![];
        payload.extend_from_slice(&symbol.state().as_u32().to_be_bytes());
        payload.extend_from_slice(&symbol.address.to_be_bytes());
        payload.extend_from_slice(&symbol.end_address().to_be_bytes());
        payload.extend_from_slice(symbol.name().as_bytes());
        Response::ok(payload)
    }

    fn breakpoint_request(&self, runtime: &Runtime, request: &Request) -> Response {
        let (Some(op), Some(address)) = (request.word(0), request.word(1)) else {
            return Response::error("expected operation and address");
        };
        match op {
            BREAKPOINT_SET => runtime.add_breakpoint(Breakpoint::code(address)),
            BREAKPOINT_STEP => runtime.add_breakpoint(Breakpoint::step(address)),
            BREAKPOINT_CLEAR => {
                if !runtime.remove_breakpoint(address) {
                    return Response::error(format!("no breakpoint at {address:#x}"));
                }
            }
            _ => return Response::error(format!("unknown breakpoint operation: {op}")),
        }
        Response::ok(vec![])
    }

    fn execution_request(&self, request: &Request) -> Response {
        match request.word(0) {
            Some(EXECUTION_QUERY) => {}
            Some(EXECUTION_PAUSE) => self.request_pause(),
            Some(EXECUTION_CONTINUE) => self.resume(),
            Some(op) => return Response::error(format!("unknown execution operation: {op}")),
            None => return Response::error("missing operation"),
        }
        Response::ok(self.execution_state().as_u32().to_be_bytes().to_vec())
    }

    fn function_request(&self, runtime: &Runtime, request: &Request) -> Response {
        let Some(address) = request.word(0) else { return Response::error("missing address") };
        let Some(func) = runtime.lookup_compiled(address) else {
            return Response::error(format!("{address:#x} has not been compiled"));
        };
        match &func.debug_info {
            Some(info) => Response::ok(info.dump().into_bytes()),
            None => Response::error(format!("no debug info for {address:#x}")),
        }
    }
}
