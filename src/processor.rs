//! Request/response processor
//!
//! The processor owns the transport and enforces one request in flight at a
//! time. For each request it stamps a sequence number, sends the message,
//! and waits for the reply whose group, command, sequence and operation
//! match. Replies that do not match are dropped and waiting continues until
//! the original deadline. On timeout the request is resent as long as
//! retries remain, optionally with the other header version so that
//! devices which only understand SMP version 1 still answer.
//!
//! Command groups share one processor through an `Rc<Processor<T>>`; a send
//! issued while another is in flight fails immediately with
//! [`TransportError::Busy`].

use std::cell::Cell;
use std::time::Duration;

use smpmgr_core::cbor;
use smpmgr_core::message::{response_op, SmpMessage};
use smpmgr_core::{Error, Result, Transport, TransportError};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Processor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// No request in flight
    Idle,
    /// Handing a request to the transport
    Sending,
    /// Waiting for the matching reply
    AwaitingResponse,
    /// Timed out; about to resend
    Retrying,
    /// Last request got its reply
    Completed,
    /// Last request failed
    Failed,
}

impl ProcessorState {
    fn in_progress(self) -> bool {
        matches!(
            self,
            ProcessorState::Sending | ProcessorState::AwaitingResponse | ProcessorState::Retrying
        )
    }
}

/// The request currently being processed
#[derive(Debug)]
struct InFlight {
    message: SmpMessage,
    retries_remaining: u8,
    timeout_ms: u32,
    allow_version_probe: bool,
}

impl InFlight {
    /// Whether `reply` answers this request
    fn matches(&self, reply: &SmpMessage) -> bool {
        let sent = &self.message;
        reply.group() == sent.group()
            && reply.command() == sent.command()
            && reply.sequence() == sent.sequence()
            && reply.op() == response_op(sent.op())
    }
}

/// Releases the busy flag when a send finishes or its future is dropped
struct BusyGuard<'a> {
    busy: &'a Cell<bool>,
    state: &'a Cell<ProcessorState>,
}

impl<'a> BusyGuard<'a> {
    fn acquire(busy: &'a Cell<bool>, state: &'a Cell<ProcessorState>) -> Option<Self> {
        if busy.replace(true) {
            return None;
        }
        Some(Self { busy, state })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.state.get().in_progress() {
            self.state.set(ProcessorState::Idle);
        }
        self.busy.set(false);
    }
}

/// Serializes SMP requests over a transport
pub struct Processor<T: Transport> {
    transport: Mutex<T>,
    busy: Cell<bool>,
    sequence: Cell<u8>,
    state: Cell<ProcessorState>,
}

impl<T: Transport> Processor<T> {
    /// Create a processor that owns `transport`
    pub fn new(transport: T) -> Self {
        Self {
            transport: Mutex::new(transport),
            busy: Cell::new(false),
            sequence: Cell::new(0),
            state: Cell::new(ProcessorState::Idle),
        }
    }

    /// Whether a request is in flight
    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }

    /// Current state
    pub fn state(&self) -> ProcessorState {
        self.state.get()
    }

    /// Sequence number the next request will use
    pub fn next_sequence(&self) -> u8 {
        self.sequence.get()
    }

    /// Replace the transport, returning the previous one
    pub fn set_transport(&self, transport: T) -> core::result::Result<T, TransportError> {
        let mut current = self.lock()?;
        Ok(std::mem::replace(&mut *current, transport))
    }

    /// Run `f` with exclusive access to the transport
    ///
    /// Fails with [`TransportError::Busy`] while a request is in flight.
    pub fn with_transport<R>(
        &self,
        f: impl FnOnce(&mut T) -> R,
    ) -> core::result::Result<R, TransportError> {
        let mut transport = self.lock()?;
        Ok(f(&mut transport))
    }

    /// Largest message that fits the transport at the given MTU
    ///
    /// Fails with [`TransportError::Busy`] while a request is in flight:
    /// the request holds the transport until it completes, and the limit
    /// is only needed when building the next request.
    pub fn max_message_data_size(&self, mtu: usize) -> core::result::Result<usize, TransportError> {
        self.with_transport(|t| t.max_message_data_size(mtu))
    }

    /// Abandon the request in flight
    ///
    /// Not supported: a request runs until it completes, fails or times out.
    /// Dropping the future returned by [`send`](Self::send) releases the
    /// processor immediately.
    pub fn cancel(&self) {
        log::debug!("processor: cancel requested, not supported");
    }

    fn lock(&self) -> core::result::Result<tokio::sync::MutexGuard<'_, T>, TransportError> {
        if self.busy.get() {
            return Err(TransportError::Busy);
        }
        self.transport.try_lock().map_err(|_| TransportError::Busy)
    }

    /// Send a request and wait for its reply
    ///
    /// `message` must be finalized. On timeout the request is resent up to
    /// `retries` times; with `allow_version_probe` each resend flips the
    /// header version. A reply carrying a non-zero `rc`, or an `err` map, is
    /// returned as [`Error::Rc`] or [`Error::Group`].
    pub async fn send(
        &self,
        message: SmpMessage,
        timeout_ms: u32,
        retries: u8,
        allow_version_probe: bool,
    ) -> Result<SmpMessage> {
        let _guard =
            BusyGuard::acquire(&self.busy, &self.state).ok_or(TransportError::Busy)?;
        let mut transport = self
            .transport
            .try_lock()
            .map_err(|_| TransportError::Busy)?;

        if !transport.is_connected() {
            self.state.set(ProcessorState::Failed);
            return Err(TransportError::NotConnected.into());
        }
        if !message.is_valid() {
            self.state.set(ProcessorState::Failed);
            return Err(TransportError::MessageNotValid.into());
        }

        let mut in_flight = InFlight {
            message,
            retries_remaining: retries,
            timeout_ms,
            allow_version_probe,
        };
        in_flight.message.set_sequence(self.sequence.get());

        let result = self.run(&mut *transport, &mut in_flight).await;
        self.state.set(if result.is_ok() {
            ProcessorState::Completed
        } else {
            ProcessorState::Failed
        });

        check_reply(result?)
    }

    async fn run(
        &self,
        transport: &mut T,
        in_flight: &mut InFlight,
    ) -> core::result::Result<SmpMessage, TransportError> {
        let mut first_attempt = true;

        loop {
            self.state.set(ProcessorState::Sending);
            transport.send(&in_flight.message)?;

            if first_attempt {
                self.sequence.set(self.sequence.get().wrapping_add(1));
                first_attempt = false;
            }

            self.state.set(ProcessorState::AwaitingResponse);
            match self.await_response(transport, in_flight).await {
                Err(TransportError::Timeout) if in_flight.retries_remaining > 0 => {
                    in_flight.retries_remaining -= 1;
                    self.state.set(ProcessorState::Retrying);

                    if in_flight.allow_version_probe {
                        let version = in_flight.message.version().toggled();
                        in_flight.message.set_version(version);
                    }
                    log::debug!(
                        "processor: timeout on seq {}, retrying with version {} ({} left)",
                        in_flight.message.sequence(),
                        in_flight.message.version().number(),
                        in_flight.retries_remaining
                    );
                }
                result => return result,
            }
        }
    }

    async fn await_response(
        &self,
        transport: &mut T,
        in_flight: &InFlight,
    ) -> core::result::Result<SmpMessage, TransportError> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(in_flight.timeout_ms));

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            let remaining_ms = u32::try_from(remaining.as_millis())
                .unwrap_or(u32::MAX)
                .max(1);

            let reply = transport.receive(remaining_ms).await?;
            if in_flight.matches(&reply) {
                return Ok(reply);
            }

            log::debug!(
                "processor: dropping unexpected reply (group {}, command {}, seq {}, op {:?})",
                reply.group(),
                reply.command(),
                reply.sequence(),
                reply.op()
            );
        }
    }
}

/// Turn an error carried in a reply payload into an [`Error`]
///
/// An `rc` of 0, at the top level or inside an `err` map, is success, the
/// same as no `rc` at all.
fn check_reply(reply: SmpMessage) -> Result<SmpMessage> {
    let Some(contents) = reply.contents() else {
        if reply.payload().is_empty() {
            return Ok(reply);
        }
        return Err(TransportError::InvalidResponse.into());
    };

    if let Some(err) = cbor::map_get(contents, "err") {
        let group = cbor::get_u64(err, "group").and_then(|g| u16::try_from(g).ok());
        let rc = cbor::get_i64(err, "rc").and_then(|rc| i32::try_from(rc).ok());
        return match (group, rc) {
            (Some(_), Some(0)) => Ok(reply),
            (Some(group), Some(rc)) => Err(Error::Group { group, rc }),
            _ => Err(TransportError::InvalidResponse.into()),
        };
    }

    if let Some(rc) = cbor::get_i64(contents, "rc") {
        let rc = i32::try_from(rc).map_err(|_| TransportError::InvalidResponse)?;
        if rc != 0 {
            return Err(Error::Rc { rc });
        }
    }

    Ok(reply)
}
