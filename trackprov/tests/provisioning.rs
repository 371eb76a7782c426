//! End-to-end provisioning runs against a simulated tracker.
//!
//! Each test hands the session one end of an in-memory duplex stream and
//! runs a small firmware model on the other end. Time is paused, so the
//! multi-second boot and confirmation windows run instantly.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::time::{self, Instant};

use trackprov::error::TransportError;
use trackprov::registry::{PortIdentity, VID_SILICON_LABS};
use trackprov::session::Transition;
use trackprov::transport::{BoxedStream, PortOpener};
use trackprov::{
    ChannelRegistry, ErrorKind, PortDescriptor, PortInfo, ProvisioningRequest,
    ProvisioningSession, SerialConfig, SessionBuilder, SessionState,
};

const PORT: &str = "/dev/ttyUSB0";

/// Hands out queued streams, then reports the port as open elsewhere.
struct FakeOpener {
    streams: Mutex<VecDeque<DuplexStream>>,
}

impl PortOpener for FakeOpener {
    fn open(
        &self,
        port: &PortDescriptor,
        _config: &SerialConfig,
    ) -> Result<BoxedStream, TransportError> {
        match self.streams.lock().unwrap().pop_front() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(TransportError::AlreadyOpen {
                port: port.to_string(),
            }),
        }
    }
}

/// How the simulated firmware reacts to `PROVISION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confirm {
    /// Prints "Credentials stored successfully".
    Direct,
    /// Stores silently; only `INFO` shows it.
    InfoOnly,
    /// Prints the stored-token notice and reboots.
    Reboot,
    /// Ignores the command.
    Never,
}

/// Firmware model for one boot.
#[derive(Debug, Clone)]
struct Firmware {
    /// Lines printed on boot, each after its delay.
    boot: Vec<(Duration, &'static str)>,
    /// Identifier already stored on the device.
    stored: Option<String>,
    confirm: Confirm,
    /// Separator between the fields of an `INFO` reply.
    info_separator: &'static str,
}

impl Firmware {
    fn fresh() -> Self {
        Self {
            boot: vec![
                (Duration::from_millis(200), "\x1b[0;32mrst:0x1 (POWERON_RESET)\x1b[0m\r\n"),
                (Duration::from_millis(100), "Booting...\n"),
                (Duration::from_millis(500), "Waiting for provisioning commands...\n"),
            ],
            stored: None,
            confirm: Confirm::Direct,
            info_separator: "\n",
        }
    }

    fn provisioned(id: &str) -> Self {
        Self {
            boot: vec![
                (Duration::from_millis(200), "Booting...\n"),
                (Duration::from_millis(300), "Device provisioned successfully!\n"),
            ],
            stored: Some(id.to_string()),
            confirm: Confirm::Direct,
            info_separator: "\n",
        }
    }

    fn silent() -> Self {
        Self {
            boot: vec![(Duration::from_millis(200), "Booting...\n")],
            stored: None,
            confirm: Confirm::Never,
            info_separator: "\n",
        }
    }

    fn confirming(mut self, confirm: Confirm) -> Self {
        self.confirm = confirm;
        self
    }

    fn info_separated_by(mut self, separator: &'static str) -> Self {
        self.info_separator = separator;
        self
    }
}

/// Lines the simulated device received, with arrival times.
type Received = Arc<Mutex<Vec<(Instant, String)>>>;

fn lines(received: &Received) -> Vec<String> {
    received.lock().unwrap().iter().map(|(_, l)| l.clone()).collect()
}

fn arrival(received: &Received, prefix: &str) -> Option<Instant> {
    received
        .lock()
        .unwrap()
        .iter()
        .find(|(_, l)| l.starts_with(prefix))
        .map(|(at, _)| *at)
}

fn spawn_device(stream: DuplexStream, firmware: Firmware) -> Received {
    let received: Received = Arc::default();
    let log = received.clone();

    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(stream);
        for (delay, line) in &firmware.boot {
            time::sleep(*delay).await;
            if write.write_all(line.as_bytes()).await.is_err() {
                return;
            }
        }

        let mut stored = firmware.stored.clone();
        let mut pending = None;
        let mut requests = BufReader::new(read).lines();
        while let Ok(Some(line)) = requests.next_line().await {
            log.lock().unwrap().push((Instant::now(), line.clone()));

            let reply = if let Some(id) = line.strip_prefix("DEVICE_ID=") {
                pending = Some(id.to_string());
                "OK device id\n".to_string()
            } else if line.starts_with("TOKEN=") {
                "OK token\n".to_string()
            } else if line == "PROVISION" {
                match firmware.confirm {
                    Confirm::Direct => {
                        stored = pending.take();
                        "Credentials stored successfully\n".to_string()
                    }
                    Confirm::InfoOnly => {
                        stored = pending.take();
                        String::new()
                    }
                    Confirm::Reboot => {
                        stored = pending.take();
                        "Stored token. Rebooting...\nets Jun  8 2016 00:22:57\nrst:0xc (SW_CPU_RESET)\n"
                            .to_string()
                    }
                    Confirm::Never => String::new(),
                }
            } else if line == "INFO" {
                match &stored {
                    Some(id) => format!(
                        "device_id={}{}provisioned=yes\n",
                        id, firmware.info_separator
                    ),
                    None => format!("device_id={}provisioned=no\n", firmware.info_separator),
                }
            } else {
                "ERR unknown command\n".to_string()
            };

            time::sleep(Duration::from_millis(50)).await;
            if write.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    });

    received
}

/// A session on a one-port registry, plus the device ends of its streams.
fn session_with(boots: usize) -> (ProvisioningSession, Vec<DuplexStream>) {
    let registry = ChannelRegistry::empty();
    registry.register(PortInfo::new(
        PORT,
        PortIdentity::usb(VID_SILICON_LABS, 0xea60),
    ));

    let mut hosts = VecDeque::new();
    let mut devices = Vec::new();
    for _ in 0..boots {
        let (host, device) = tokio::io::duplex(4096);
        hosts.push_back(host);
        devices.push(device);
    }

    let session = SessionBuilder::new(Arc::new(registry))
        .opener(FakeOpener {
            streams: Mutex::new(hosts),
        })
        .build()
        .unwrap();
    (session, devices)
}

fn request(id: &str) -> ProvisioningRequest {
    ProvisioningRequest::new(id, "tok_abc123").unwrap()
}

fn visited(transitions: &[Transition]) -> Vec<SessionState> {
    transitions.iter().map(|t| t.state).collect()
}

fn entered(transitions: &[Transition], state: SessionState) -> Option<Instant> {
    transitions.iter().find(|t| t.state == state).map(|t| t.at)
}

#[tokio::test(start_paused = true)]
async fn test_fresh_device_is_provisioned() {
    let (mut session, mut devices) = session_with(1);
    let received = spawn_device(devices.remove(0), Firmware::fresh());

    let outcome = session.run(&request("TRK-0099"), None).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.status, SessionState::Success);
    assert_eq!(outcome.message, "Provisioning successful! Device configured.");
    assert_eq!(
        visited(session.transitions()),
        vec![
            SessionState::Connecting,
            SessionState::WaitingForBoot,
            SessionState::SendingCredentials,
            SessionState::AwaitingConfirmation,
            SessionState::Success,
        ]
    );
    assert_eq!(
        lines(&received),
        vec!["DEVICE_ID=TRK-0099", "TOKEN=tok_abc123", "PROVISION"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_needs_provisioning_before_provisioned_never_verifies() {
    let (mut session, mut devices) = session_with(1);
    let firmware = Firmware {
        boot: vec![
            (Duration::from_millis(100), "Waiting for provisioning commands...\n"),
            (Duration::from_millis(100), "Device provisioned successfully!\n"),
        ],
        stored: None,
        confirm: Confirm::Direct,
        info_separator: "\n",
    };
    spawn_device(devices.remove(0), firmware);

    session.run(&request("TRK-0099"), None).await.unwrap();

    let states = visited(session.transitions());
    assert!(states.contains(&SessionState::SendingCredentials));
    assert!(!states.contains(&SessionState::VerifyingExisting));
}

#[tokio::test(start_paused = true)]
async fn test_first_write_after_boot_is_device_id() {
    let (mut session, mut devices) = session_with(1);
    let firmware = Firmware {
        boot: vec![
            (Duration::from_millis(10), "Booting...\n"),
            (Duration::from_millis(500), "Waiting for provisioning commands...\n"),
        ],
        stored: None,
        confirm: Confirm::Direct,
        info_separator: "\n",
    };
    let received = spawn_device(devices.remove(0), firmware);

    session.run(&request("TRK-0099"), None).await.unwrap();

    assert_eq!(lines(&received)[0], "DEVICE_ID=TRK-0099");
}

#[tokio::test(start_paused = true)]
async fn test_commands_are_paced() {
    let (mut session, mut devices) = session_with(1);
    let received = spawn_device(devices.remove(0), Firmware::fresh());

    session.run(&request("TRK-0099"), None).await.unwrap();

    let device_id = arrival(&received, "DEVICE_ID=").unwrap();
    let token = arrival(&received, "TOKEN=").unwrap();
    let provision = arrival(&received, "PROVISION").unwrap();
    assert!(token - device_id >= Duration::from_millis(300));
    assert!(provision - token >= Duration::from_millis(300));

    let awaiting = entered(session.transitions(), SessionState::AwaitingConfirmation).unwrap();
    assert!(awaiting - provision >= Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_already_provisioned_with_same_id() {
    let (mut session, mut devices) = session_with(1);
    let received = spawn_device(devices.remove(0), Firmware::provisioned("TRK-0099"));

    let outcome = session.run(&request("TRK-0099"), None).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.message, "Device is already provisioned with the correct ID.");
    assert!(visited(session.transitions()).contains(&SessionState::VerifyingExisting));
    assert_eq!(lines(&received), vec!["INFO"]);
}

#[tokio::test(start_paused = true)]
async fn test_identity_mismatch_sends_nothing() {
    let (mut session, mut devices) = session_with(1);
    let received = spawn_device(devices.remove(0), Firmware::provisioned("TRK-0050"));

    let err = session.run(&request("TRK-0099"), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::IdentityMismatch);
    let outcome = session.outcome();
    assert_eq!(outcome.status, SessionState::Error);
    assert_eq!(outcome.error, Some(ErrorKind::IdentityMismatch));
    assert!(outcome.message.contains("TRK-0050"));
    assert!(outcome.message.contains("TRK-0099"));
    assert_eq!(lines(&received), vec!["INFO"]);
}

#[tokio::test(start_paused = true)]
async fn test_identifier_prefix_is_not_a_match() {
    let (mut session, mut devices) = session_with(1);
    spawn_device(devices.remove(0), Firmware::provisioned("TRK-00990"));

    let err = session.run(&request("TRK-0099"), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::IdentityMismatch);
}

#[tokio::test(start_paused = true)]
async fn test_single_line_info_reply_verifies() {
    let (mut session, mut devices) = session_with(1);
    let firmware = Firmware::provisioned("TRK-0099").info_separated_by(",");
    let received = spawn_device(devices.remove(0), firmware);

    let outcome = session.run(&request("TRK-0099"), None).await.unwrap();

    assert!(outcome.success);
    assert_eq!(lines(&received), vec!["INFO"]);
}

#[tokio::test(start_paused = true)]
async fn test_single_line_info_mismatch_names_stored_id() {
    let (mut session, mut devices) = session_with(1);
    let firmware = Firmware::provisioned("TRK-0050").info_separated_by(",");
    spawn_device(devices.remove(0), firmware);

    let err = session.run(&request("TRK-0099"), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::IdentityMismatch);
    assert!(session.outcome().message.contains("'TRK-0050'"));
    assert!(!session.outcome().message.contains("provisioned=yes"));
}

#[tokio::test(start_paused = true)]
async fn test_boot_timeout_errors_once() {
    let (mut session, mut devices) = session_with(1);
    spawn_device(devices.remove(0), Firmware::silent());

    let start = Instant::now();
    let err = session.run(&request("TRK-0099"), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BootTimeout);
    assert!(start.elapsed() >= Duration::from_secs(10));
    assert!(start.elapsed() < Duration::from_secs(11));

    let errors = session
        .transitions()
        .iter()
        .filter(|t| t.state == SessionState::Error)
        .count();
    assert_eq!(errors, 1);

    let outcome = session.outcome();
    assert!(outcome.message.contains("reset"));
    assert!(outcome.diagnostic.unwrap().contains("Booting..."));
}

#[tokio::test(start_paused = true)]
async fn test_info_fallback_confirms() {
    let (mut session, mut devices) = session_with(1);
    let firmware = Firmware::fresh().confirming(Confirm::InfoOnly);
    let received = spawn_device(devices.remove(0), firmware);

    let outcome = session.run(&request("TRK-0099"), None).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.message, "Provisioning confirmed by INFO query.");
    assert_eq!(lines(&received).last().map(String::as_str), Some("INFO"));

    let provision = arrival(&received, "PROVISION").unwrap();
    let info = arrival(&received, "INFO").unwrap();
    assert!(info - provision >= Duration::from_secs(8));
}

#[tokio::test(start_paused = true)]
async fn test_reboot_confirms_early() {
    let (mut session, mut devices) = session_with(1);
    let firmware = Firmware::fresh().confirming(Confirm::Reboot);
    let received = spawn_device(devices.remove(0), firmware);

    let outcome = session.run(&request("TRK-0099"), None).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.message, "Device rebooted after provisioning.");
    assert!(!lines(&received).contains(&"INFO".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_timeout() {
    let (mut session, mut devices) = session_with(1);
    let firmware = Firmware::fresh().confirming(Confirm::Never);
    let received = spawn_device(devices.remove(0), firmware);

    let err = session.run(&request("TRK-0099"), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfirmationTimeout);
    assert_eq!(
        session.outcome().message,
        "device did not confirm provisioning; verify firmware and retry"
    );
    assert_eq!(
        session.outcome().error,
        Some(ErrorKind::ConfirmationTimeout)
    );
    assert_eq!(lines(&received).last().map(String::as_str), Some("INFO"));
}

#[tokio::test(start_paused = true)]
async fn test_device_disconnect_is_transport_error() {
    let (mut session, mut devices) = session_with(1);
    let mut device = devices.remove(0);
    tokio::spawn(async move {
        time::sleep(Duration::from_millis(300)).await;
        let _ = device.write_all(b"Booting...\n").await;
        time::sleep(Duration::from_millis(300)).await;
        drop(device);
    });

    let start = Instant::now();
    let err = session.run(&request("TRK-0099"), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TransportIo);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(session.state(), SessionState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_no_selection_is_channel_unavailable() {
    let mut session = SessionBuilder::new(Arc::new(ChannelRegistry::empty()))
        .opener(FakeOpener {
            streams: Mutex::new(VecDeque::new()),
        })
        .build()
        .unwrap();

    let err = session.run(&request("TRK-0099"), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ChannelUnavailable);
    assert_eq!(session.outcome().error, Some(ErrorKind::ChannelUnavailable));
}

#[tokio::test(start_paused = true)]
async fn test_finished_session_must_be_reset() {
    let (mut session, mut devices) = session_with(2);
    spawn_device(devices.remove(0), Firmware::fresh());
    session.run(&request("TRK-0099"), None).await.unwrap();

    let err = session.run(&request("TRK-0099"), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(session.state(), SessionState::Success);

    session.reset().await;
    assert_eq!(session.state(), SessionState::Idle);

    spawn_device(devices.remove(0), Firmware::provisioned("TRK-0099"));
    let outcome = session.run(&request("TRK-0099"), None).await.unwrap();
    assert!(outcome.success);
}

#[tokio::test(start_paused = true)]
async fn test_close_while_confirming_then_rerun() {
    let (mut session, mut devices) = session_with(2);
    let firmware = Firmware::fresh().confirming(Confirm::Never);
    spawn_device(devices.remove(0), firmware);

    let handle = session.handle();
    let mut updates = handle.subscribe();
    let closer = tokio::spawn(async move {
        updates
            .wait_for(|o| o.status == SessionState::AwaitingConfirmation)
            .await
            .unwrap();
        time::sleep(Duration::from_secs(1)).await;
        let closed_at = Instant::now();
        handle.close().await;
        closed_at
    });

    let outcome = session.run(&request("TRK-0099"), None).await.unwrap();
    let closed_at = closer.await.unwrap();

    assert_eq!(outcome.status, SessionState::Idle);
    assert!(!outcome.success);
    assert_eq!(session.state(), SessionState::Idle);
    assert!(closed_at.elapsed() < Duration::from_millis(500));

    // The first boot printed the needs-provisioning banner. The second
    // device is already provisioned, so a leaked transcript would send
    // credentials again.
    let received = spawn_device(devices.remove(0), Firmware::provisioned("TRK-0099"));
    let outcome = session.run(&request("TRK-0099"), None).await.unwrap();

    assert!(outcome.success);
    assert_eq!(lines(&received), vec!["INFO"]);
    assert!(!visited(session.transitions()).contains(&SessionState::SendingCredentials));
}

#[tokio::test(start_paused = true)]
async fn test_outcome_updates_are_observable() {
    let (mut session, mut devices) = session_with(1);
    spawn_device(devices.remove(0), Firmware::fresh());

    // The watch channel only guarantees the latest state; the full
    // sequence is in the transition log.
    let mut updates = session.handle().subscribe();
    let watcher = tokio::spawn(async move {
        let mut seen = Vec::new();
        while updates.changed().await.is_ok() {
            let status = updates.borrow_and_update().status;
            seen.push(status);
            if status.is_terminal() {
                break;
            }
        }
        seen
    });

    session.run(&request("TRK-0099"), None).await.unwrap();
    let seen = watcher.await.unwrap();

    assert_eq!(seen.last(), Some(&SessionState::Success));
    assert_eq!(session.handle().outcome().status, SessionState::Success);
    assert_eq!(
        visited(session.transitions()),
        vec![
            SessionState::Connecting,
            SessionState::WaitingForBoot,
            SessionState::SendingCredentials,
            SessionState::AwaitingConfirmation,
            SessionState::Success,
        ]
    );
}
