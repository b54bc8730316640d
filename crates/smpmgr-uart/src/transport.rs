//! Serial port transport
//!
//! A background thread reads the port and forwards raw bytes over a tokio
//! channel; [`UartTransport::receive`] feeds them through the
//! [`FrameDecoder`] until a complete message arrives or the timeout expires.
//! The channel is bounded, and whatever is queued when a request goes out is
//! discarded, so console output from an idle device cannot pile up.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use smpmgr_core::message::SmpMessage;
use smpmgr_core::{Transport, TransportError};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{timeout_at, Instant};

use crate::config::UartConfig;
use crate::framing::{self, FrameDecoder};

/// Read timeout of the background reader; bounds how long it takes to notice
/// a disconnect
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Size of the reader thread's buffer
const READ_BUFFER_SIZE: usize = 256;

/// Reads queued between the reader thread and the transport; further reads
/// are dropped until the queue drains
pub const READ_CHANNEL_DEPTH: usize = 64;

/// Largest SMP message the length field of a frame can describe
const MAX_FRAME_MESSAGE: usize = u16::MAX as usize - 2;

/// An open link: the write half and the channel fed by the reader
struct Link {
    writer: Box<dyn Write + Send>,
    rx: Receiver<Vec<u8>>,
    stop: Option<Arc<AtomicBool>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(stop) = &self.stop {
            stop.store(true, Ordering::Relaxed);
        }
    }
}

/// SMP over a serial console
#[derive(Default)]
pub struct UartTransport {
    config: Option<UartConfig>,
    link: Option<Link>,
    decoder: FrameDecoder,
}

impl std::fmt::Debug for UartTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UartTransport")
            .field("config", &self.config)
            .field("connected", &self.link.is_some())
            .finish()
    }
}

impl UartTransport {
    /// Create an unconfigured transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport for the given port settings
    pub fn with_config(config: UartConfig) -> Self {
        Self {
            config: Some(config),
            ..Self::default()
        }
    }

    /// Create a connected transport over an existing byte link
    ///
    /// Frames are written to `writer`; raw bytes arriving on `rx` are
    /// decoded as if read from a serial port.
    pub fn with_link(writer: Box<dyn Write + Send>, rx: Receiver<Vec<u8>>) -> Self {
        Self {
            config: None,
            link: Some(Link {
                writer,
                rx,
                stop: None,
            }),
            decoder: FrameDecoder::new(),
        }
    }

    /// Current port settings
    pub fn config(&self) -> Option<&UartConfig> {
        self.config.as_ref()
    }

    /// Change the port settings
    ///
    /// Not allowed while connected.
    pub fn set_config(&mut self, config: UartConfig) -> Result<(), TransportError> {
        if self.link.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        config.validate()?;
        self.config = Some(config);
        Ok(())
    }

    fn open_port(config: &UartConfig) -> Result<Box<dyn SerialPort>, TransportError> {
        serialport::new(&config.port, config.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_POLL_INTERVAL)
            .open()
            .map_err(|e| TransportError::OpenFailed(format!("{}: {}", config.port, e)))
    }
}

/// Forward everything read from `port` to `tx` until stopped
fn reader_loop(
    mut port: Box<dyn SerialPort>,
    tx: Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];

    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => match tx.try_send(buf[..n].to_vec()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::trace!("uart: read queue full, dropping {} bytes", n);
                }
                Err(TrySendError::Closed(_)) => break,
            },
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::warn!("uart: read failed: {}", e);
                break;
            }
        }
    }

    log::debug!("uart: reader stopped");
}

/// Drop everything received before a new request goes out
///
/// Nothing queued at this point can answer the request about to be sent.
fn discard_stale_input(rx: &mut Receiver<Vec<u8>>, decoder: &mut FrameDecoder) {
    let mut discarded = decoder.buffered();
    loop {
        match rx.try_recv() {
            Ok(bytes) => discarded += bytes.len(),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
    decoder.reset();

    if discarded > 0 {
        log::debug!("uart: discarded {} bytes of stale input", discarded);
    }
}

impl Transport for UartTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.link.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let config = self.config.as_ref().ok_or_else(|| {
            TransportError::InvalidConfiguration("No serial port configured".to_string())
        })?;
        config.validate()?;

        let port = Self::open_port(config)?;
        let reader = port
            .try_clone()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(READ_CHANNEL_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("smp-uart-reader".to_string())
            .spawn(move || reader_loop(reader, tx, thread_stop))?;

        log::info!("Opened serial port {} at {} baud", config.port, config.baud);

        self.decoder.reset();
        self.link = Some(Link {
            writer: Box::new(port),
            rx,
            stop: Some(stop),
        });
        Ok(())
    }

    fn disconnect(&mut self, force: bool) -> Result<(), TransportError> {
        let Some(mut link) = self.link.take() else {
            return if force {
                Ok(())
            } else {
                Err(TransportError::NotConnected)
            };
        };

        self.decoder.reset();

        let flushed = link.writer.flush();
        drop(link);
        log::info!("uart: disconnected");

        match flushed {
            Err(e) if !force => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn send(&mut self, message: &SmpMessage) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;

        let data = message.data();
        if data.len() > MAX_FRAME_MESSAGE {
            return Err(TransportError::MessageTooLarge);
        }

        discard_stale_input(&mut link.rx, &mut self.decoder);

        let frame = framing::encode_frame(&data);
        link.writer.write_all(&frame)?;
        link.writer.flush()?;

        log::trace!(
            "uart: sent {} byte message as {} bytes",
            data.len(),
            frame.len()
        );
        Ok(())
    }

    async fn receive(&mut self, timeout_ms: u32) -> Result<SmpMessage, TransportError> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;

        loop {
            while let Some(frame) = self.decoder.next_frame() {
                let message = SmpMessage::from_bytes(&frame);
                if message.is_valid() {
                    return Ok(message);
                }
                log::debug!(
                    "uart: dropping frame with inconsistent SMP length ({} bytes)",
                    frame.len()
                );
            }

            match timeout_at(deadline, link.rx.recv()).await {
                Ok(Some(bytes)) => self.decoder.push(&bytes),
                Ok(None) => {
                    return Err(TransportError::Io("serial reader stopped".to_string()));
                }
                Err(_) => return Err(TransportError::Timeout),
            }
        }
    }

    fn max_message_data_size(&self, mtu: usize) -> usize {
        framing::max_message_data_size(mtu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smpmgr_core::message::{Operation, ProtocolVersion};
    use std::sync::Mutex;

    /// Writer that keeps everything written
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn echo_message() -> SmpMessage {
        let mut message = SmpMessage::start(Operation::Write, ProtocolVersion::V2, 0, 0)
            .with_field("d", "hello");
        message.finalize().unwrap();
        message
    }

    fn linked() -> (UartTransport, Capture, Sender<Vec<u8>>) {
        let capture = Capture::default();
        let (tx, rx) = mpsc::channel(READ_CHANNEL_DEPTH);
        let transport = UartTransport::with_link(Box::new(capture.clone()), rx);
        (transport, capture, tx)
    }

    #[test]
    fn test_send_writes_frame() {
        let (mut transport, capture, _tx) = linked();
        let message = echo_message();
        transport.send(&message).unwrap();

        let written = capture.0.lock().unwrap().clone();
        assert_eq!(written, framing::encode_frame(&message.data()));
    }

    #[tokio::test]
    async fn test_receive_reassembles_split_frame() {
        let (mut transport, _capture, tx) = linked();
        let message = echo_message();
        let frame = framing::encode_frame(&message.data());

        let (a, b) = frame.split_at(5);
        tx.try_send(b"noise".to_vec()).unwrap();
        tx.try_send(a.to_vec()).unwrap();
        tx.try_send(b.to_vec()).unwrap();

        let received = transport.receive(1000).await.unwrap();
        assert!(received.is_valid());
        assert_eq!(received.data(), message.data());
    }

    #[tokio::test]
    async fn test_receive_two_frames_in_one_read() {
        let (mut transport, _capture, tx) = linked();
        let first = echo_message();
        let mut second = SmpMessage::start(Operation::Read, ProtocolVersion::V1, 1, 0);
        second.finalize().unwrap();

        let mut bytes = framing::encode_frame(&first.data());
        bytes.extend(framing::encode_frame(&second.data()));
        tx.try_send(bytes).unwrap();

        assert_eq!(transport.receive(100).await.unwrap().data(), first.data());
        assert_eq!(transport.receive(100).await.unwrap().data(), second.data());
    }

    #[tokio::test]
    async fn test_send_discards_stale_input() {
        let (mut transport, capture, tx) = linked();
        let stale = echo_message();

        // A chatty idle device fills the queue, ending in a stale reply
        while tx.capacity() > 1 {
            tx.try_send(b"uart:~$ log line\r\n".to_vec()).unwrap();
        }
        tx.try_send(framing::encode_frame(&stale.data())).unwrap();
        assert_eq!(tx.capacity(), 0);
        assert!(tx.try_send(b"dropped".to_vec()).is_err());

        let request = echo_message();
        transport.send(&request).unwrap();
        assert_eq!(tx.capacity(), tx.max_capacity());
        assert_eq!(
            *capture.0.lock().unwrap(),
            framing::encode_frame(&request.data())
        );

        let mut reply = SmpMessage::start(Operation::WriteResponse, ProtocolVersion::V2, 0, 0)
            .with_field("r", "fresh");
        reply.finalize().unwrap();
        tx.try_send(framing::encode_frame(&reply.data())).unwrap();

        let received = transport.receive(100).await.unwrap();
        assert_eq!(received.data(), reply.data());
    }

    #[tokio::test]
    async fn test_send_drops_partial_frame() {
        let (mut transport, _capture, tx) = linked();
        let frame = framing::encode_frame(&echo_message().data());
        tx.try_send(frame[..20].to_vec()).unwrap();

        assert!(matches!(
            transport.receive(10).await,
            Err(TransportError::Timeout)
        ));
        assert!(transport.decoder.buffered() > 0);

        transport.send(&echo_message()).unwrap();
        assert_eq!(transport.decoder.buffered(), 0);
        assert!(!transport.decoder.in_frame());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_timeout() {
        let (mut transport, _capture, _tx) = linked();
        assert_eq!(
            transport.receive(3000).await.unwrap_err(),
            TransportError::Timeout
        );
    }

    #[tokio::test]
    async fn test_receive_reader_gone() {
        let (mut transport, _capture, tx) = linked();
        drop(tx);
        assert!(matches!(
            transport.receive(100).await,
            Err(TransportError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_not_connected() {
        let mut transport = UartTransport::with_config(UartConfig::new("/dev/null"));
        assert!(!transport.is_connected());
        assert_eq!(
            transport.send(&echo_message()),
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            transport.receive(10).await.unwrap_err(),
            TransportError::NotConnected
        );
        assert_eq!(transport.disconnect(false), Err(TransportError::NotConnected));
        assert_eq!(transport.disconnect(true), Ok(()));
    }

    #[test]
    fn test_config_changes() {
        let mut transport = UartTransport::new();
        assert!(matches!(
            transport.connect(),
            Err(TransportError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            transport.set_config(UartConfig::new("")),
            Err(TransportError::InvalidConfiguration(_))
        ));
        transport.set_config(UartConfig::new("/dev/ttyACM0")).unwrap();
        assert_eq!(transport.config().unwrap().port, "/dev/ttyACM0");

        let (mut linked, _capture, _tx) = linked();
        assert_eq!(
            linked.set_config(UartConfig::new("/dev/ttyACM1")),
            Err(TransportError::AlreadyConnected)
        );
        assert_eq!(linked.connect(), Err(TransportError::AlreadyConnected));
        linked.disconnect(false).unwrap();
        assert!(!linked.is_connected());
    }

    #[test]
    fn test_max_message_data_size() {
        let transport = UartTransport::new();
        assert_eq!(transport.max_message_data_size(256), 179);
    }
}
