//! USB link transport
//!
//! Owns the dongle device handle and the two protocol threads: the writer
//! loop establishes the link, heartbeats every two seconds and owns the
//! reconnect policy; the reader loop pulls framed payloads off the bulk IN
//! endpoint and hands them upward through [`LinkEvents`]. Every USB failure
//! is absorbed locally as a state transition; nothing unwinds across a
//! thread boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use rusb::{DeviceHandle, Direction, GlobalContext, TransferType};

use crate::cipher::SessionCipher;
use crate::config::Config;
use crate::constants;
use crate::error::{Error, LinkError, Result};
use crate::wire::{self, FrameHeader};

/// Connectivity of the link, ordered from least to most connected.
///
/// Higher ordinal wins during transition arbitration; `Error` and a
/// `NoDevice` downgrade from `Online`+ latch only after
/// [`constants::STATE_LATCH_THRESHOLD`] consecutive signals, absorbing
/// transient USB glitches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LinkState {
    Initialising = 0,
    NoDevice = 1,
    Linking = 2,
    Error = 3,
    Online = 4,
    Connected = 5,
}

/// Callbacks from the transport threads into the command layer.
///
/// Buffer ownership moves with `on_frame`; the receiver frees anything it
/// does not forward.
pub trait LinkEvents: Send + Sync {
    /// A complete decrypted frame. `length` is the wire payload length;
    /// `data` may carry extra zero-filled decoder padding past it.
    fn on_frame(&self, cmd: u32, length: usize, data: Vec<u8>);

    /// The link came up (endpoints claimed) or went away.
    fn on_device(&self, connected: bool);

    /// Externally observable state transition.
    fn on_state(&self, _state: LinkState) {}
}

/// Latching transition arbiter; exactly one per transport.
struct StateMachine {
    state: LinkState,
    fail_count: u8,
    nodevice_count: u8,
}

impl StateMachine {
    fn new() -> Self {
        Self {
            state: LinkState::Initialising,
            fail_count: 0,
            nodevice_count: 0,
        }
    }

    /// Apply a requested transition; Some(state) when the externally visible
    /// state actually changed.
    fn request(&mut self, requested: LinkState) -> Option<LinkState> {
        if requested == self.state {
            return None;
        }

        match requested {
            LinkState::Error => {
                self.fail_count += 1;
                if self.fail_count < constants::STATE_LATCH_THRESHOLD {
                    return None;
                }
            }
            LinkState::NoDevice if self.state >= LinkState::Online => {
                self.nodevice_count += 1;
                if self.nodevice_count < constants::STATE_LATCH_THRESHOLD {
                    return None;
                }
            }
            // A silent reconnect attempt while the visible state still says
            // Online+ must not announce itself; the downgrade counters decide
            // when the glitch becomes real.
            LinkState::Linking if self.state >= LinkState::Online => {
                return None;
            }
            _ => {}
        }

        self.fail_count = 0;
        self.nodevice_count = 0;
        self.state = requested;
        Some(requested)
    }
}

/// Claimed device handle plus its discovered bulk endpoints
struct Endpoints {
    handle: DeviceHandle<GlobalContext>,
    ep_in: u8,
    ep_out: u8,
}

struct LinkInner {
    vendor_id: u16,
    product_id: u16,
    video_padding: usize,

    cipher: SessionCipher,
    encrypt_enabled: AtomicBool,

    device: RwLock<Option<Arc<Endpoints>>>,
    active: AtomicBool,
    connected: AtomicBool,

    state: Mutex<StateMachine>,
    // Weak: the sink (the session layer) owns this transport, a strong
    // reference here would cycle
    events: RwLock<Option<Weak<dyn LinkEvents>>>,

    // Single writer transfer in flight at a time
    write_lock: Mutex<()>,

    // Interruptible sleeps for both loops
    sleep_lock: Mutex<()>,
    sleep_cv: Condvar,
}

impl LinkInner {
    fn events(&self) -> Option<Arc<dyn LinkEvents>> {
        self.events.read().as_ref()?.upgrade()
    }

    fn sleep(&self, duration: Duration) {
        let mut guard = self.sleep_lock.lock();
        if self.active.load(Ordering::Acquire) {
            let _ = self.sleep_cv.wait_for(&mut guard, duration);
        }
    }

    fn request_state(&self, requested: LinkState) {
        let changed = self.state.lock().request(requested);
        if let Some(state) = changed {
            tracing::info!(?state, "link state changed");
            if let Some(events) = self.events() {
                events.on_state(state);
            }
        }
    }

    fn notify_device(&self, connected: bool) {
        if let Some(events) = self.events() {
            events.on_device(connected);
        }
    }

    /// Build the header and the (possibly encrypted) payload for one send.
    /// The payload is copied only when it actually gets transformed.
    fn build_frame<'a>(
        &self,
        cmd: u32,
        encrypt: bool,
        payload: &'a [u8],
    ) -> (FrameHeader, std::borrow::Cow<'a, [u8]>) {
        let encrypting =
            encrypt && !payload.is_empty() && self.encrypt_enabled.load(Ordering::Acquire);

        if encrypting {
            let mut transformed = payload.to_vec();
            if self.cipher.encrypt(&mut transformed) {
                return (
                    FrameHeader::encrypted(cmd, transformed.len() as u32),
                    std::borrow::Cow::Owned(transformed),
                );
            }
        }
        (
            FrameHeader::plain(cmd, payload.len() as u32),
            std::borrow::Cow::Borrowed(payload),
        )
    }

    fn send(&self, cmd: u32, encrypt: bool, payload: &[u8]) -> std::result::Result<usize, LinkError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(LinkError::NotLinked);
        }
        let device = self
            .device
            .read()
            .clone()
            .ok_or(LinkError::NotLinked)?;

        let (header, body) = self.build_frame(cmd, encrypt, payload);
        let raw_header = header.encode();

        // Unbounded timeout, matching the peer's pull cadence
        let _writer = self.write_lock.lock();
        let mut transferred = device
            .handle
            .write_bulk(device.ep_out, &raw_header, Duration::ZERO)
            .map_err(|e| self.write_failed("header", e))?;
        if !body.is_empty() {
            transferred = device
                .handle
                .write_bulk(device.ep_out, &body, Duration::ZERO)
                .map_err(|e| self.write_failed("payload", e))?;
        }
        Ok(transferred)
    }

    fn write_failed(&self, stage: &'static str, error: rusb::Error) -> LinkError {
        if error == rusb::Error::NoDevice {
            self.connected.store(false, Ordering::Release);
            return LinkError::Disconnected;
        }
        LinkError::usb(stage, error)
    }
}

/// USB link to the dongle: session state machine, framing, both loops.
pub struct LinkTransport {
    inner: Arc<LinkInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LinkTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let cipher =
            SessionCipher::new(constants::ENCRYPTION_BASE_KEY).map_err(Error::Cipher)?;
        Ok(Self {
            inner: Arc::new(LinkInner {
                vendor_id: config.vendor_id,
                product_id: config.product_id,
                video_padding: config.video_padding,
                cipher,
                encrypt_enabled: AtomicBool::new(false),
                device: RwLock::new(None),
                active: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                state: Mutex::new(StateMachine::new()),
                events: RwLock::new(None),
                write_lock: Mutex::new(()),
                sleep_lock: Mutex::new(()),
                sleep_cv: Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the writer/reconnect loop and the reader loop.
    pub fn start(&self, events: Arc<dyn LinkEvents>) -> Result<()> {
        if self.inner.active.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self.inner.events.write() = Some(Arc::downgrade(&events));

        let mut threads = self.threads.lock();

        let writer = self.inner.clone();
        threads.push(
            thread::Builder::new()
                .name("link-writer".into())
                .spawn(move || write_loop(&writer))
                .map_err(Error::Io)?,
        );

        let reader = self.inner.clone();
        threads.push(
            thread::Builder::new()
                .name("link-reader".into())
                .spawn(move || read_loop(&reader))
                .map_err(Error::Io)?,
        );

        Ok(())
    }

    /// Cooperative shutdown: clear the active flag, wake every sleeper and
    /// join both loops.
    pub fn stop(&self) {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.sleep_cv.notify_all();

        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }

        *self.inner.device.write() = None;
        self.inner.connected.store(false, Ordering::Release);
    }

    /// Frame and write one command; payload is encrypted only when both the
    /// caller asks for it and the handshake negotiated it.
    pub fn send(&self, cmd: u32, encrypt: bool, payload: &[u8]) -> std::result::Result<usize, LinkError> {
        self.inner.send(cmd, encrypt, payload)
    }

    /// Flip encrypted sending after the peer acknowledged the handshake
    pub fn set_encryption(&self, enabled: bool) {
        self.inner.encrypt_enabled.store(enabled, Ordering::Release);
        tracing::info!(enabled, "encrypted sending");
    }

    /// Seed for the encryption handshake payload
    pub fn cipher_seed(&self) -> u32 {
        self.inner.cipher.seed()
    }

    /// Whether the peer has acknowledged encrypted sending
    pub fn encryption_enabled(&self) -> bool {
        self.inner.encrypt_enabled.load(Ordering::Acquire)
    }

    /// Drive the Online/Connected boundary from phone plug events
    pub fn phone_state(&self, plugged: bool) {
        let requested = if plugged {
            LinkState::Connected
        } else {
            LinkState::Online
        };
        // Only meaningful while the link itself is up
        if self.inner.connected.load(Ordering::Acquire) {
            self.inner.request_state(requested);
        }
    }

    /// Current externally visible state
    pub fn state(&self) -> LinkState {
        self.inner.state.lock().state
    }
}

impl Drop for LinkTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open the device and claim its bulk endpoints. Each failed step logs,
/// requests a state downgrade and bails; the writer loop retries.
fn connect(inner: &LinkInner) -> std::result::Result<(), LinkError> {
    let handle = match rusb::open_device_with_vid_pid(inner.vendor_id, inner.product_id) {
        Some(handle) => handle,
        None => {
            inner.request_state(LinkState::NoDevice);
            return Err(LinkError::DeviceNotFound {
                vendor_id: inner.vendor_id,
                product_id: inner.product_id,
            });
        }
    };

    inner.request_state(LinkState::Linking);
    match link(inner, handle) {
        Ok(endpoints) => {
            *inner.device.write() = Some(Arc::new(endpoints));
            Ok(())
        }
        Err(e) => {
            inner.request_state(LinkState::Error);
            Err(e)
        }
    }
}

/// Reset, configure, claim and discover endpoints on an opened handle
fn link(
    inner: &LinkInner,
    mut handle: DeviceHandle<GlobalContext>,
) -> std::result::Result<Endpoints, LinkError> {
    tracing::debug!("resetting device");
    handle
        .reset()
        .map_err(|e| LinkError::usb("reset", e))?;

    tracing::debug!("setting configuration");
    handle
        .set_active_configuration(1)
        .map_err(|e| LinkError::usb("set configuration", e))?;

    tracing::debug!("claiming interface");
    handle
        .claim_interface(0)
        .map_err(|e| LinkError::usb("claim interface", e))?;

    let descriptor = handle
        .device()
        .active_config_descriptor()
        .map_err(|e| LinkError::usb("config descriptor", e))?;

    let mut ep_in = None;
    let mut ep_out = None;
    for interface in descriptor.interfaces() {
        for alt in interface.descriptors() {
            for endpoint in alt.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => ep_in.get_or_insert(endpoint.address()),
                    Direction::Out => ep_out.get_or_insert(endpoint.address()),
                };
            }
        }
        break; // first interface only
    }

    match (ep_in, ep_out) {
        (Some(ep_in), Some(ep_out)) => {
            tracing::info!(ep_in, ep_out, "bulk endpoints claimed");
            Ok(Endpoints {
                handle,
                ep_in,
                ep_out,
            })
        }
        _ => Err(LinkError::MissingEndpoints),
    }
}

/// Reconnect policy and heartbeat cadence. This is the only thread that may
/// call connect/link/release.
fn write_loop(inner: &LinkInner) {
    let heartbeat = Duration::from_millis(constants::HEARTBEAT_INTERVAL_MS);
    let backoff = Duration::from_millis(constants::RECONNECT_DELAY_MS);

    while inner.active.load(Ordering::Acquire) {
        match connect(inner) {
            Ok(()) => {
                inner.connected.store(true, Ordering::Release);
                inner.request_state(LinkState::Online);
                inner.notify_device(true);

                while inner.connected.load(Ordering::Acquire)
                    && inner.active.load(Ordering::Acquire)
                {
                    if let Err(e) = inner.send(wire::cmd::HEARTBEAT, false, &[]) {
                        tracing::warn!(error = %e, "heartbeat failed");
                    }
                    inner.sleep(heartbeat);
                }

                inner.notify_device(false);
                inner.request_state(LinkState::NoDevice);
                *inner.device.write() = None;
            }
            Err(e) => {
                tracing::debug!(error = %e, "link attempt failed");
            }
        }
        inner.sleep(backoff);
    }

    *inner.device.write() = None;
}

/// Pull frames off the bulk IN endpoint while linked
fn read_loop(inner: &LinkInner) {
    let read_timeout = Duration::from_millis(constants::READ_TIMEOUT_MS);
    let idle = Duration::from_millis(constants::RECONNECT_DELAY_MS);

    let mut raw_header = [0u8; wire::HEADER_LEN];

    while inner.active.load(Ordering::Acquire) {
        let device = match inner.device.read().clone() {
            Some(device) if inner.connected.load(Ordering::Acquire) => device,
            _ => {
                inner.sleep(idle);
                continue;
            }
        };

        let transferred =
            match device
                .handle
                .read_bulk(device.ep_in, &mut raw_header, read_timeout)
            {
                Ok(n) => n,
                Err(rusb::Error::NoDevice) => {
                    tracing::info!("device lost");
                    inner.connected.store(false, Ordering::Release);
                    inner.request_state(LinkState::NoDevice);
                    continue;
                }
                Err(rusb::Error::Timeout) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "header read failed");
                    inner.sleep(Duration::from_millis(10));
                    continue;
                }
            };

        if transferred != wire::HEADER_LEN {
            continue;
        }

        let header = match FrameHeader::decode(&raw_header) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(error = %e, "corrupt frame header dropped");
                continue;
            }
        };

        let length = header.length as usize;
        let padding = if header.cmd == wire::cmd::VIDEO_DATA {
            inner.video_padding
        } else {
            0
        };

        let mut data = vec![0u8; length];
        if length > 0 && !read_exact(&device, &mut data, read_timeout) {
            tracing::debug!(cmd = header.cmd, length, "truncated payload dropped");
            continue;
        }

        if header.is_encrypted() {
            if !inner.cipher.decrypt(&mut data) {
                // Silent drop: no cipher for this frame
                tracing::trace!(cmd = header.cmd, "undecryptable frame dropped");
                continue;
            }
        }

        if padding > 0 {
            data.resize(length + padding, 0);
        }

        if let Some(events) = inner.events() {
            events.on_frame(header.cmd, length, data);
        }
    }
}

/// Fill `buf` from the IN endpoint across as many transfers as needed
fn read_exact(device: &Endpoints, buf: &mut [u8], timeout: Duration) -> bool {
    let mut filled = 0;
    while filled < buf.len() {
        match device
            .handle
            .read_bulk(device.ep_in, &mut buf[filled..], timeout)
        {
            Ok(0) => return false,
            Ok(n) => filled += n,
            Err(e) => {
                tracing::debug!(error = %e, filled, "payload read failed");
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering_is_meaningful() {
        assert!(LinkState::Connected > LinkState::Online);
        assert!(LinkState::Online > LinkState::Error);
        assert!(LinkState::Error > LinkState::Linking);
        assert!(LinkState::Linking > LinkState::NoDevice);
        assert!(LinkState::NoDevice > LinkState::Initialising);
    }

    #[test]
    fn error_latches_after_threshold() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.request(LinkState::Online), Some(LinkState::Online));

        // Nine error signals in a row change nothing
        for _ in 0..9 {
            assert_eq!(machine.request(LinkState::Error), None);
            assert_eq!(machine.state, LinkState::Online);
        }
        // The tenth latches, exactly once
        assert_eq!(machine.request(LinkState::Error), Some(LinkState::Error));
        // The eleventh is idempotent
        assert_eq!(machine.request(LinkState::Error), None);
        assert_eq!(machine.state, LinkState::Error);
    }

    #[test]
    fn error_counter_resets_on_good_transition() {
        let mut machine = StateMachine::new();
        machine.request(LinkState::Online);
        for _ in 0..9 {
            machine.request(LinkState::Error);
        }
        // Recovery clears the streak; the next error starts from zero
        assert_eq!(machine.request(LinkState::Linking), Some(LinkState::Linking));
        for _ in 0..9 {
            assert_eq!(machine.request(LinkState::Error), None);
        }
        assert_eq!(machine.request(LinkState::Error), Some(LinkState::Error));
    }

    #[test]
    fn nodevice_latches_only_while_online() {
        let mut machine = StateMachine::new();

        // Before the link is up, device absence is immediate
        assert_eq!(
            machine.request(LinkState::NoDevice),
            Some(LinkState::NoDevice)
        );

        machine.request(LinkState::Online);
        machine.request(LinkState::Connected);
        for _ in 0..9 {
            assert_eq!(machine.request(LinkState::NoDevice), None);
            assert_eq!(machine.state, LinkState::Connected);
        }
        assert_eq!(
            machine.request(LinkState::NoDevice),
            Some(LinkState::NoDevice)
        );
    }

    #[test]
    fn silent_reconnect_does_not_announce_linking() {
        let mut machine = StateMachine::new();
        machine.request(LinkState::Online);

        // A reconnect attempt during a glitch stays invisible
        assert_eq!(machine.request(LinkState::Linking), None);
        assert_eq!(machine.state, LinkState::Online);

        // Once NoDevice latches, the next attempt is announced
        for _ in 0..10 {
            machine.request(LinkState::NoDevice);
        }
        assert_eq!(machine.state, LinkState::NoDevice);
        assert_eq!(machine.request(LinkState::Linking), Some(LinkState::Linking));
    }

    #[test]
    fn repeated_state_is_not_reported() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.request(LinkState::Linking), Some(LinkState::Linking));
        assert_eq!(machine.request(LinkState::Linking), None);
    }

    #[test]
    fn frame_building_respects_negotiation() {
        let transport = LinkTransport::new(&Config::default()).unwrap();
        let payload = b"pointer event".to_vec();

        // Before negotiation: plain magic, untouched payload
        let (header, body) = transport.inner.build_frame(5, true, &payload);
        assert!(!header.is_encrypted());
        assert_eq!(body.as_ref(), payload.as_slice());

        transport.set_encryption(true);

        // encrypt=true now transforms and switches magic
        let (header, body) = transport.inner.build_frame(5, true, &payload);
        assert!(header.is_encrypted());
        assert_eq!(header.length as usize, payload.len());
        assert_ne!(body.as_ref(), payload.as_slice());

        // encrypt=false is never transformed, negotiated or not
        let (header, body) = transport.inner.build_frame(5, false, &payload);
        assert!(!header.is_encrypted());
        assert_eq!(body.as_ref(), payload.as_slice());

        // Zero-length payloads stay plain
        let (header, _) = transport.inner.build_frame(170, true, &[]);
        assert!(!header.is_encrypted());
    }
}
