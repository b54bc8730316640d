//! End-to-end tests: command groups over the serial framing, answered by the
//! dummy device

use std::io::{self, Write};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use smpmgr::group::enumeration::EnumGroup;
use smpmgr::group::img::{ImgGroup, NoProgress};
use smpmgr::group::os::OsGroup;
use smpmgr::group::settings::SettingsGroup;
use smpmgr::group::shell::ShellGroup;
use smpmgr::{Error, ErrorRegistry, Processor, Transport, UartTransport};
use smpmgr_core::message::{ProtocolVersion, SmpMessage};
use smpmgr_dummy::{sample_image, DummyConfig, DummyDevice};
use smpmgr_uart::framing::{self, FrameDecoder};
use smpmgr_uart::transport::READ_CHANNEL_DEPTH;
use tokio::sync::mpsc::{self, Sender};

/// Console prompt the device prints before each reply
const PROMPT: &[u8] = b"uart:~$ ";

/// Serial link with a dummy device on the far end
///
/// Frames written by the transport are decoded and handed to the device;
/// its replies are framed and sent back, each preceded by console output.
struct Bridge {
    device: Arc<Mutex<DummyDevice>>,
    decoder: FrameDecoder,
    tx: Sender<Vec<u8>>,
}

impl Write for Bridge {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.decoder.push(buf);

        while let Some(frame) = self.decoder.next_frame() {
            let request = SmpMessage::from_bytes(&frame);
            let mut device = self.device.lock().unwrap();
            device
                .send(&request)
                .map_err(|e| io::Error::other(e.to_string()))?;

            while let Some(reply) = device.take_reply() {
                let mut bytes = PROMPT.to_vec();
                bytes.extend(framing::encode_frame(&reply.data()));
                let _ = self.tx.try_send(bytes);
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn connect(config: DummyConfig) -> (Rc<Processor<UartTransport>>, Arc<Mutex<DummyDevice>>) {
    init();
    let device = Arc::new(Mutex::new(DummyDevice::new(config)));
    let (tx, rx) = mpsc::channel(READ_CHANNEL_DEPTH);
    let bridge = Bridge {
        device: Arc::clone(&device),
        decoder: FrameDecoder::new(),
        tx,
    };
    let transport = UartTransport::with_link(Box::new(bridge), rx);
    (Rc::new(Processor::new(transport)), device)
}

#[tokio::test]
async fn test_os_commands() {
    let (processor, device) = connect(DummyConfig::default());
    let mut registry = ErrorRegistry::new();
    let os = OsGroup::new(Rc::clone(&processor), &mut registry);

    assert_eq!(os.echo("hello over uart").await.unwrap(), "hello over uart");
    let params = os.mcumgr_parameters().await.unwrap();
    assert_eq!(params.buf_size, 2048);
    os.reset(false).await.unwrap();

    assert_eq!(device.lock().unwrap().resets(), 1);
    assert_eq!(processor.next_sequence(), 3);
}

#[tokio::test]
async fn test_upload() {
    let (processor, device) = connect(DummyConfig::default());
    let mut registry = ErrorRegistry::new();
    let img = ImgGroup::new(Rc::clone(&processor), &mut registry);
    let data = sample_image(2000, [0x5A; 32]);

    let report = img.upload(0, &data, false, &mut NoProgress).await.unwrap();
    assert_eq!(report.bytes, data.len());

    let limit = processor.max_message_data_size(256).unwrap();
    assert_eq!(limit, 179);
    {
        let device = device.lock().unwrap();
        assert_eq!(device.uploaded_data(), Some(data.as_slice()));
        assert!(device.requests().iter().all(|r| r.size() <= limit));
    }

    let images = img.state().await.unwrap();
    assert_eq!(images[1].hash, [0x5A; 32]);
}

#[tokio::test]
async fn test_error_description() {
    let (processor, _device) = connect(DummyConfig::default());
    let mut registry = ErrorRegistry::new();
    let img = ImgGroup::new(Rc::clone(&processor), &mut registry);

    let err = img.set_state(Some(&[0u8; 32]), false).await.unwrap_err();
    assert_eq!(err, Error::Group { group: 1, rc: 3 });
    assert!(registry.describe(&err).contains("NO_IMAGE"));

    let err = img.erase(4).await.unwrap_err();
    assert_eq!(err, Error::Rc { rc: 3 });
    assert!(registry.describe(&err).contains("EINVAL"));
}

#[tokio::test(start_paused = true)]
async fn test_version_one_device() {
    let (processor, device) = connect(DummyConfig {
        supports_v2: false,
        ..DummyConfig::default()
    });
    let mut registry = ErrorRegistry::new();
    let os = OsGroup::new(Rc::clone(&processor), &mut registry);

    assert_eq!(os.echo("v1").await.unwrap(), "v1");

    let versions: Vec<ProtocolVersion> = device
        .lock()
        .unwrap()
        .requests()
        .iter()
        .map(SmpMessage::version)
        .collect();
    assert_eq!(versions, [ProtocolVersion::V2, ProtocolVersion::V1]);
}

#[tokio::test]
async fn test_management_groups() {
    let (processor, device) = connect(DummyConfig::default());
    let mut registry = ErrorRegistry::new();
    let groups = EnumGroup::new(Rc::clone(&processor), &mut registry);
    let settings = SettingsGroup::new(Rc::clone(&processor), &mut registry);
    let shell = ShellGroup::new(Rc::clone(&processor), &mut registry);

    let ids = groups.list().await.unwrap();
    assert!(ids.contains(&smpmgr::group::GROUP_ID_SHELL));

    settings.write("app/mode", b"fast").await.unwrap();
    settings.save().await.unwrap();
    assert_eq!(settings.read("app/mode", None).await.unwrap(), b"fast");

    let result = shell.execute(&["echo", "over", "uart"]).await.unwrap();
    assert_eq!(result.output, "over uart");
    assert_eq!(result.ret, 0);

    assert_eq!(device.lock().unwrap().setting("app/mode"), Some(&b"fast"[..]));
}
