//! APCI connection engine.
//!
//! One [`Connection`] per peer socket. Each connection owns a read loop, a
//! write loop and a test-probe loop, plus the supervisory-timer callback;
//! they share one mutex-guarded state block (sequence tracker + link state)
//! and communicate through bounded queues. Control frames travel on a
//! separate queue serviced with priority by the write loop, so confirmations
//! and forced acknowledgments are never stuck behind window-blocked data.
//!
//! There is no retransmission anywhere in this layer: a lost or reordered
//! frame surfaces as connection loss, and recovery belongs to whoever
//! re-establishes the connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{ApciError, ApciResult};
use crate::frame::{ControlFunction, Frame, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::seq::{OutstandingFrame, SeqTracker};
use crate::timers::TimerHandle;

/// Connection tuning parameters.
///
/// The defaults are the standard IEC 60870-5-104 values: t1 = 15 s,
/// t2 = 10 s, t3 = 20 s, k = 12, w = 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Response timeout (t1): maximum wait for an acknowledgment or a
    /// handshake confirmation; expiry closes the connection
    pub response_timeout: Duration,
    /// Supervisory timeout (t2): maximum ack latency before an S-frame is
    /// forced out
    pub supervisory_timeout: Duration,
    /// Test timeout (t3): idle-probe period
    pub test_timeout: Duration,
    /// Send window (k): maximum unacknowledged outgoing I-frames
    pub send_window: u16,
    /// Receive window (w): received I-frames tolerated before a forced
    /// acknowledgment
    pub recv_window: u16,
    /// Capacity of the outgoing request queue
    pub send_queue: usize,
    /// Capacity of the delivered-payload queue
    pub recv_queue: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(15),
            supervisory_timeout: Duration::from_secs(10),
            test_timeout: Duration::from_secs(20),
            send_window: 12,
            recv_window: 8,
            send_queue: 1024,
            recv_queue: 1024,
        }
    }
}

impl LinkConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the response timeout (t1)
    pub fn response_timeout(mut self, value: Duration) -> Self {
        self.response_timeout = value;
        self
    }

    /// Set the supervisory timeout (t2)
    pub fn supervisory_timeout(mut self, value: Duration) -> Self {
        self.supervisory_timeout = value;
        self
    }

    /// Set the test-probe period (t3)
    pub fn test_timeout(mut self, value: Duration) -> Self {
        self.test_timeout = value;
        self
    }

    /// Set the send window (k)
    pub fn send_window(mut self, value: u16) -> Self {
        self.send_window = value;
        self
    }

    /// Set the receive window (w)
    pub fn recv_window(mut self, value: u16) -> Self {
        self.recv_window = value;
        self
    }

    /// Set the outgoing request queue capacity
    pub fn send_queue(mut self, value: usize) -> Self {
        self.send_queue = value;
        self
    }

    /// Set the delivered-payload queue capacity
    pub fn recv_queue(mut self, value: usize) -> Self {
        self.recv_queue = value;
        self
    }

    /// Validate the configuration
    pub fn build(self) -> ApciResult<Self> {
        if self.send_window == 0 || self.recv_window == 0 {
            return Err(ApciError::Config(
                "window sizes must be at least 1".to_string(),
            ));
        }
        if self.send_queue == 0 || self.recv_queue == 0 {
            return Err(ApciError::Config(
                "queue capacities must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Connection life-cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Initiator waiting for the start confirmation
    Connecting,
    /// Data transfer permitted
    Enabled,
    /// Data transfer not permitted (responder before start / after stop)
    Disabled,
    /// Teardown in progress
    Closing,
    /// Stream closed, all waiters resolved
    Closed,
}

/// One `send`/`drain` call queued for the write loop. An absent payload is a
/// flush marker.
struct SendRequest {
    payload: Option<Vec<u8>>,
    wait_ack: bool,
    done: oneshot::Sender<ApciResult<()>>,
}

/// A data frame waiting for send-window admission.
struct PendingData {
    payload: Vec<u8>,
    wait_ack: bool,
    done: oneshot::Sender<ApciResult<()>>,
}

/// Priority traffic for the write loop.
enum CtrlCmd {
    /// Transmit a U-format frame
    Control(ControlFunction),
    /// Transmit an S-frame carrying the current receive sequence
    Ack,
}

/// State shared by the read loop, write loop, test loop and timers.
/// Mutations under the lock never span a suspension point.
struct Shared {
    state: LinkState,
    tracker: SeqTracker,
    /// An S-frame is queued but not yet written
    ack_pending: bool,
    /// Armed supervisory timer (t2), if any
    sup_timer: Option<TimerHandle>,
    /// Response timer (t1) for an unanswered test probe
    test_timer: Option<TimerHandle>,
    /// Resolves the initiator's wait for the start confirmation
    start_waiter: Option<oneshot::Sender<()>>,
    /// The connection's last outbound frame; abort unless a graceful
    /// release overrides it
    close_frame: ControlFunction,
}

struct Core {
    cfg: LinkConfig,
    /// True for the initiating role, which never honors a stop request
    always_enabled: bool,
    shared: Mutex<Shared>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Wakes the write loop when an acknowledgment frees a window slot
    window_free: Notify,
    ctrl_tx: mpsc::UnboundedSender<CtrlCmd>,
    /// Delivery side of the receive queue; taken on shutdown so `receive`
    /// observes end of stream once the buffered payloads are drained
    recv_tx: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
    enabled_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// An APCI connection over a reliable byte stream.
///
/// Created by [`connect`] / [`Server::accept`] for TCP, or by
/// [`Connection::initiate`] / [`Connection::respond`] over any
/// `AsyncRead + AsyncWrite` transport.
pub struct Connection {
    core: Arc<Core>,
    send_tx: mpsc::Sender<SendRequest>,
    recv_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    enabled_rx: watch::Receiver<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl Connection {
    /// Take the initiating role on an established stream: send the start
    /// activation and wait up to the response timeout for the confirmation.
    pub async fn initiate<S>(stream: S, config: LinkConfig) -> ApciResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = Self::spawn(stream, true, config);
        connection.start_handshake().await?;
        Ok(connection)
    }

    /// Take the responding role on an established stream. Data transfer
    /// stays disabled until the peer activates it.
    pub fn respond<S>(stream: S, config: LinkConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(stream, false, config)
    }

    fn spawn<S>(stream: S, always_enabled: bool, cfg: LinkConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (send_tx, send_rx) = mpsc::channel(cfg.send_queue);
        let (recv_tx, recv_rx) = mpsc::channel(cfg.recv_queue);
        let (enabled_tx, enabled_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);

        let state = if always_enabled {
            LinkState::Connecting
        } else {
            LinkState::Disabled
        };

        let core = Arc::new(Core {
            cfg,
            always_enabled,
            shared: Mutex::new(Shared {
                state,
                tracker: SeqTracker::new(cfg.send_window, cfg.recv_window),
                ack_pending: false,
                sup_timer: None,
                test_timer: None,
                start_waiter: None,
                close_frame: ControlFunction::Abort,
            }),
            writer: Mutex::new(Box::new(writer)),
            window_free: Notify::new(),
            ctrl_tx,
            recv_tx: StdMutex::new(Some(recv_tx)),
            enabled_tx,
            closed_tx,
            tasks: StdMutex::new(Vec::new()),
        });

        let read_task = tokio::spawn(read_loop(core.clone(), Box::new(reader)));
        let write_task = tokio::spawn(write_loop(core.clone(), ctrl_rx, send_rx));
        let test_task = tokio::spawn(test_loop(core.clone()));
        if let Ok(mut tasks) = core.tasks.lock() {
            tasks.extend([read_task, write_task, test_task]);
        }

        Self {
            core,
            send_tx,
            recv_rx: Mutex::new(recv_rx),
            enabled_rx,
            closed_rx,
        }
    }

    async fn start_handshake(&self) -> ApciResult<()> {
        let confirmation = {
            let mut shared = self.core.shared.lock().await;
            let (tx, rx) = oneshot::channel();
            shared.start_waiter = Some(tx);
            rx
        };
        debug!("sending start activation");
        let _ = self
            .core
            .ctrl_tx
            .send(CtrlCmd::Control(ControlFunction::StartAct));

        match timeout(self.core.cfg.response_timeout, confirmation).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ApciError::ConnectionClosed),
            Err(_) => {
                self.core
                    .clone()
                    .shutdown(Some(ApciError::ResponseTimeout))
                    .await;
                Err(ApciError::ResponseTimeout)
            }
        }
    }

    /// Queue a payload for transmission.
    ///
    /// With `wait_ack` the call resolves once the peer has acknowledged the
    /// frame; without it, once the frame has been written. If data transfer
    /// is disabled when the write loop dequeues the request, the payload is
    /// silently discarded; if `wait_ack` was requested, the call instead
    /// fails with [`ApciError::TransferDisabled`] while the connection
    /// stays open.
    pub async fn send(&self, payload: &[u8], wait_ack: bool) -> ApciResult<()> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ApciError::PayloadTooLarge { len: payload.len() });
        }
        let (done, completion) = oneshot::channel();
        self.send_tx
            .send(SendRequest {
                payload: Some(payload.to_vec()),
                wait_ack,
                done,
            })
            .await
            .map_err(|_| ApciError::ConnectionClosed)?;
        completion.await.unwrap_or(Err(ApciError::ConnectionClosed))
    }

    /// Queue a flush marker: resolves once everything queued ahead of it has
    /// been written to the stream and, with `wait_ack`, once the newest
    /// outstanding data frame at that point has been acknowledged.
    pub async fn drain(&self, wait_ack: bool) -> ApciResult<()> {
        let (done, completion) = oneshot::channel();
        self.send_tx
            .send(SendRequest {
                payload: None,
                wait_ack,
                done,
            })
            .await
            .map_err(|_| ApciError::ConnectionClosed)?;
        completion.await.unwrap_or(Err(ApciError::ConnectionClosed))
    }

    /// Dequeue the next delivered payload, in arrival order.
    pub async fn receive(&self) -> ApciResult<Vec<u8>> {
        self.recv_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(ApciError::ConnectionClosed)
    }

    /// Whether data transfer is currently enabled
    pub fn is_enabled(&self) -> bool {
        *self.enabled_rx.borrow()
    }

    /// Observe enable/disable transitions of the data-transfer handshake.
    pub fn enabled_updates(&self) -> watch::Receiver<bool> {
        self.enabled_rx.clone()
    }

    /// Current life-cycle state
    pub async fn state(&self) -> LinkState {
        self.core.shared.lock().await.state
    }

    /// Close the connection: transmit the close frame best-effort, cancel
    /// all loops and timers, and fail every pending operation. Idempotent.
    pub async fn close(&self) {
        self.core.clone().shutdown(None).await;
        self.wait_closed().await;
    }

    /// Wait until the connection has fully closed.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed_rx.clone();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.core.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Core {
    fn queue_control(&self, function: ControlFunction) {
        let _ = self.ctrl_tx.send(CtrlCmd::Control(function));
    }

    fn queue_ack_locked(&self, shared: &mut Shared) {
        if !shared.ack_pending {
            shared.ack_pending = true;
            let _ = self.ctrl_tx.send(CtrlCmd::Ack);
        }
    }

    fn begin_shutdown(self: &Arc<Self>, reason: Option<ApciError>) {
        let core = self.clone();
        tokio::spawn(async move {
            core.shutdown(reason).await;
        });
    }

    async fn shutdown(self: Arc<Self>, reason: Option<ApciError>) {
        let close_frame;
        let outstanding;
        {
            let mut shared = self.shared.lock().await;
            if matches!(shared.state, LinkState::Closing | LinkState::Closed) {
                return;
            }
            shared.state = LinkState::Closing;
            match &reason {
                Some(e) => warn!("closing connection: {e}"),
                None => info!("closing connection"),
            }
            close_frame = shared.close_frame;
            outstanding = shared.tracker.take_outstanding();
            shared.sup_timer = None;
            shared.test_timer = None;
            shared.start_waiter = None;
        }

        for frame in outstanding {
            frame.resolve_closed();
        }
        self.window_free.notify_one();
        if let Ok(mut delivery) = self.recv_tx.lock() {
            delivery.take();
        }

        // Stop the loops first so the writer is free for the final frame.
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in &handles {
            handle.abort();
        }

        {
            let mut writer = self.writer.lock().await;
            if let Ok(bytes) = Frame::Control(close_frame).encode() {
                let _ = writer.write_all(&bytes).await;
                let _ = writer.flush().await;
            }
            let _ = writer.shutdown().await;
        }

        self.shared.lock().await.state = LinkState::Closed;
        let _ = self.closed_tx.send(true);
        info!("connection closed");
    }

    async fn write_frame(&self, bytes: &[u8]) -> ApciResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn flush_stream(&self) -> ApciResult<()> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }

    /// Wait for a free send-window slot and reserve the next sequence
    /// number. Returns `None` once the connection is closing.
    async fn admit_send(self: &Arc<Self>) -> Option<u16> {
        loop {
            {
                let mut shared = self.shared.lock().await;
                if matches!(shared.state, LinkState::Closing | LinkState::Closed) {
                    return None;
                }
                if let Some(seq) = shared.tracker.reserve_send() {
                    return Some(seq);
                }
            }
            self.window_free.notified().await;
        }
    }

    /// Classify a dequeued request: flush markers and disabled-state drops
    /// are handled here; a transmittable payload is handed back for window
    /// admission.
    async fn accept_request(&self, request: SendRequest) -> ApciResult<Option<PendingData>> {
        match request.payload {
            None => {
                if let Err(e) = self.flush_stream().await {
                    let _ = request.done.send(Err(ApciError::ConnectionClosed));
                    return Err(e);
                }
                if request.wait_ack {
                    let mut shared = self.shared.lock().await;
                    if let Some(done) = shared.tracker.attach_to_newest(request.done) {
                        let _ = done.send(Ok(()));
                    }
                } else {
                    let _ = request.done.send(Ok(()));
                }
                Ok(None)
            }
            Some(payload) => {
                let state = self.shared.lock().await.state;
                match state {
                    LinkState::Enabled => Ok(Some(PendingData {
                        payload,
                        wait_ack: request.wait_ack,
                        done: request.done,
                    })),
                    LinkState::Disabled | LinkState::Connecting => {
                        if request.wait_ack {
                            let _ = request.done.send(Err(ApciError::TransferDisabled));
                        } else {
                            debug!(
                                "data transfer disabled, discarding {} byte payload",
                                payload.len()
                            );
                            let _ = request.done.send(Ok(()));
                        }
                        Ok(None)
                    }
                    LinkState::Closing | LinkState::Closed => {
                        let _ = request.done.send(Err(ApciError::ConnectionClosed));
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Build and transmit an I-frame under an admitted sequence number.
    async fn transmit_data(self: &Arc<Self>, seq: u16, data: PendingData) -> ApciResult<()> {
        let bytes;
        let done_after_write;
        {
            let mut shared = self.shared.lock().await;
            let frame = Frame::Data {
                send_seq: seq,
                recv_seq: shared.tracker.recv_seq(),
                payload: data.payload,
            };
            bytes = frame.encode()?;

            let core = self.clone();
            let response_timer = TimerHandle::arm(self.cfg.response_timeout, async move {
                warn!("response timeout waiting for acknowledgment");
                core.begin_shutdown(Some(ApciError::ResponseTimeout));
            });

            let mut waiters = Vec::new();
            done_after_write = if data.wait_ack {
                waiters.push(data.done);
                None
            } else {
                Some(data.done)
            };
            shared
                .tracker
                .register_outstanding(seq, OutstandingFrame::new(waiters, response_timer));

            // The piggy-backed receive sequence acknowledges everything
            // received so far.
            shared.tracker.ack_sent();
            shared.ack_pending = false;
            shared.sup_timer = None;
        }

        self.write_frame(&bytes).await?;
        debug!("sent I-frame seq {seq}");
        if let Some(done) = done_after_write {
            let _ = done.send(Ok(()));
        }
        Ok(())
    }

    async fn write_ctrl(&self, cmd: CtrlCmd) -> ApciResult<()> {
        match cmd {
            CtrlCmd::Control(function) => {
                let bytes = Frame::Control(function).encode()?;
                debug!("sending control frame {function:?}");
                self.write_frame(&bytes).await
            }
            CtrlCmd::Ack => {
                let bytes;
                {
                    let mut shared = self.shared.lock().await;
                    let frame = Frame::Ack {
                        recv_seq: shared.tracker.recv_seq(),
                    };
                    bytes = frame.encode()?;
                    shared.tracker.ack_sent();
                    shared.ack_pending = false;
                    shared.sup_timer = None;
                }
                debug!("sent acknowledgment frame");
                self.write_frame(&bytes).await
            }
        }
    }

    async fn supervisory_expired(self: Arc<Self>) {
        let mut shared = self.shared.lock().await;
        // Dropping our own handle here only aborts a task that is already
        // past its last await point.
        shared.sup_timer = None;
        if matches!(shared.state, LinkState::Closing | LinkState::Closed) {
            return;
        }
        debug!("supervisory timeout, flushing acknowledgment");
        self.queue_ack_locked(&mut shared);
    }

    fn resolve_acked(&self, resolved: Vec<OutstandingFrame>) {
        if resolved.is_empty() {
            return;
        }
        for frame in resolved {
            frame.resolve_acked();
        }
        self.window_free.notify_one();
    }

    /// Dispatch one received frame. `Ok(false)` stops the read loop for a
    /// graceful teardown.
    async fn handle_frame(self: &Arc<Self>, frame: Frame) -> ApciResult<bool> {
        match frame {
            Frame::Control(function) => self.handle_control(function).await,
            Frame::Ack { recv_seq } => {
                let resolved;
                {
                    let mut shared = self.shared.lock().await;
                    if shared.state == LinkState::Connecting {
                        debug!("ignoring sequenced frame before start confirmation");
                        return Ok(true);
                    }
                    resolved = shared.tracker.on_ack_received(recv_seq)?;
                }
                self.resolve_acked(resolved);
                Ok(true)
            }
            Frame::Data {
                send_seq,
                recv_seq,
                payload,
            } => {
                let resolved;
                {
                    let mut shared = self.shared.lock().await;
                    if shared.state == LinkState::Connecting {
                        debug!("ignoring sequenced frame before start confirmation");
                        return Ok(true);
                    }
                    resolved = shared.tracker.on_ack_received(recv_seq)?;
                    shared.tracker.on_data_received(send_seq)?;
                    if shared.tracker.needs_forced_ack() {
                        self.queue_ack_locked(&mut shared);
                    } else if shared.sup_timer.is_none() && !shared.ack_pending {
                        let core = self.clone();
                        shared.sup_timer = Some(TimerHandle::arm(
                            self.cfg.supervisory_timeout,
                            async move {
                                core.supervisory_expired().await;
                            },
                        ));
                    }
                }
                self.resolve_acked(resolved);
                let delivery = match self.recv_tx.lock() {
                    Ok(guard) => (*guard).clone(),
                    Err(_) => None,
                };
                match delivery {
                    Some(tx) if tx.send(payload).await.is_ok() => Ok(true),
                    _ => Ok(false),
                }
            }
        }
    }

    async fn handle_control(self: &Arc<Self>, function: ControlFunction) -> ApciResult<bool> {
        match function {
            ControlFunction::TestAct => {
                self.queue_control(ControlFunction::TestCon);
                Ok(true)
            }
            ControlFunction::TestCon => {
                self.shared.lock().await.test_timer = None;
                Ok(true)
            }
            ControlFunction::StartAct => {
                if self.always_enabled {
                    warn!("ignoring start activation on the initiating side");
                    return Ok(true);
                }
                let mut shared = self.shared.lock().await;
                match shared.state {
                    LinkState::Disabled => {
                        shared.state = LinkState::Enabled;
                        let _ = self.enabled_tx.send(true);
                        info!("data transfer enabled");
                    }
                    // duplicate activation, just re-confirm
                    LinkState::Enabled => {}
                    _ => return Ok(true),
                }
                self.queue_control(ControlFunction::StartCon);
                Ok(true)
            }
            ControlFunction::StartCon => {
                let mut shared = self.shared.lock().await;
                match shared.start_waiter.take() {
                    Some(waiter) => {
                        if shared.state == LinkState::Connecting {
                            shared.state = LinkState::Enabled;
                        }
                        let _ = self.enabled_tx.send(true);
                        let _ = waiter.send(());
                        info!("data transfer enabled");
                    }
                    None => warn!("unexpected start confirmation"),
                }
                Ok(true)
            }
            ControlFunction::StopAct => {
                if self.always_enabled {
                    warn!("ignoring stop activation on the initiating side");
                    return Ok(true);
                }
                let mut shared = self.shared.lock().await;
                if shared.state == LinkState::Enabled {
                    // Flush the pending acknowledgment before confirming the
                    // stop; the queue preserves the order.
                    if shared.tracker.has_unacked_in() {
                        self.queue_ack_locked(&mut shared);
                    }
                    shared.state = LinkState::Disabled;
                    let _ = self.enabled_tx.send(false);
                    info!("data transfer disabled");
                    self.queue_control(ControlFunction::StopCon);
                }
                Ok(true)
            }
            ControlFunction::StopCon => {
                warn!("unexpected stop confirmation");
                Ok(true)
            }
            ControlFunction::Abort => Err(ApciError::PeerAborted),
            ControlFunction::ReleaseAct => {
                info!("peer requested link release");
                self.shared.lock().await.close_frame = ControlFunction::ReleaseCon;
                Ok(false)
            }
            ControlFunction::ReleaseCon => {
                debug!("unexpected release confirmation");
                Ok(true)
            }
        }
    }
}

/// Read one length-prefixed frame from the stream.
async fn read_frame<R>(reader: &mut R) -> ApciResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; HEADER_LEN];
    reader.read_exact(&mut buf).await?;
    let total = Frame::next_frame_size(&buf)?;
    buf.resize(total, 0);
    reader.read_exact(&mut buf[HEADER_LEN..]).await?;
    Frame::decode(&buf)
}

async fn read_loop(core: Arc<Core>, mut reader: Box<dyn AsyncRead + Send + Unpin>) {
    let failure = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => break Some(e),
        };
        match core.handle_frame(frame).await {
            Ok(true) => {}
            Ok(false) => break None,
            Err(e) => break Some(e),
        }
    };
    match failure {
        Some(e) => {
            warn!("read loop terminated: {e}");
            core.begin_shutdown(Some(e));
        }
        None => core.begin_shutdown(None),
    }
}

async fn write_loop(
    core: Arc<Core>,
    mut ctrl_rx: mpsc::UnboundedReceiver<CtrlCmd>,
    mut send_rx: mpsc::Receiver<SendRequest>,
) {
    let mut pending: Option<PendingData> = None;
    let failure = loop {
        if let Some(data) = pending.take() {
            // A data frame is parked on window admission; keep servicing
            // control traffic so confirmations and forced acks still flow.
            tokio::select! {
                biased;
                cmd = ctrl_rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Err(e) = core.write_ctrl(cmd).await {
                            break Some(e);
                        }
                        pending = Some(data);
                    }
                    None => break None,
                },
                admitted = core.admit_send() => match admitted {
                    Some(seq) => {
                        if let Err(e) = core.transmit_data(seq, data).await {
                            break Some(e);
                        }
                    }
                    None => {
                        let _ = data.done.send(Err(ApciError::ConnectionClosed));
                        break None;
                    }
                },
            }
        } else {
            tokio::select! {
                biased;
                cmd = ctrl_rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Err(e) = core.write_ctrl(cmd).await {
                            break Some(e);
                        }
                    }
                    None => break None,
                },
                request = send_rx.recv() => match request {
                    Some(request) => match core.accept_request(request).await {
                        Ok(next) => pending = next,
                        Err(e) => break Some(e),
                    },
                    None => break None,
                },
            }
        }
    };
    match failure {
        Some(e) => {
            warn!("write loop terminated: {e}");
            core.begin_shutdown(Some(e));
        }
        None => core.begin_shutdown(None),
    }
}

async fn test_loop(core: Arc<Core>) {
    loop {
        sleep(core.cfg.test_timeout).await;
        {
            let mut shared = core.shared.lock().await;
            if matches!(shared.state, LinkState::Closing | LinkState::Closed) {
                break;
            }
            // A probe is still unconfirmed; its response timer must keep
            // running until the confirmation arrives or it expires.
            if shared.test_timer.is_some() {
                continue;
            }
            // The probe period is fixed; inbound traffic does not defer it.
            let peer = core.clone();
            shared.test_timer = Some(TimerHandle::arm(core.cfg.response_timeout, async move {
                warn!("response timeout waiting for test confirmation");
                peer.begin_shutdown(Some(ApciError::ResponseTimeout));
            }));
        }
        debug!("sending test frame activation");
        if core
            .ctrl_tx
            .send(CtrlCmd::Control(ControlFunction::TestAct))
            .is_err()
        {
            break;
        }
    }
}

/// Connect to a peer over TCP and enable data transfer.
pub async fn connect(addr: impl ToSocketAddrs, config: LinkConfig) -> ApciResult<Connection> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    info!("connected to {peer}, starting data transfer");
    Connection::initiate(stream, config).await
}

/// TCP listener producing responder-role [`Connection`]s.
pub struct Server {
    listener: TcpListener,
    config: LinkConfig,
}

impl Server {
    /// Bind a listener. The conventional port is [`crate::frame::DEFAULT_PORT`].
    pub async fn bind(addr: impl ToSocketAddrs, config: LinkConfig) -> ApciResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, config })
    }

    /// Local address the listener is bound to
    pub fn local_addr(&self) -> ApciResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next peer as a responder-role connection.
    pub async fn accept(&self) -> ApciResult<Connection> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        info!("accepted connection from {peer}");
        Ok(Connection::respond(stream, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_matches_the_standard_parameters() {
        let cfg = LinkConfig::default();
        assert_eq!(cfg.response_timeout, Duration::from_secs(15));
        assert_eq!(cfg.supervisory_timeout, Duration::from_secs(10));
        assert_eq!(cfg.test_timeout, Duration::from_secs(20));
        assert_eq!(cfg.send_window, 12);
        assert_eq!(cfg.recv_window, 8);
        assert_eq!(cfg.send_queue, 1024);
        assert_eq!(cfg.recv_queue, 1024);
    }

    #[test]
    fn config_builder_validates_windows() {
        let cfg = LinkConfig::new().send_window(0).build();
        assert!(matches!(cfg, Err(ApciError::Config(_))));

        let cfg = LinkConfig::new()
            .send_window(6)
            .recv_window(4)
            .response_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        assert_eq!(cfg.send_window, 6);
        assert_eq!(cfg.recv_window, 4);
        assert_eq!(cfg.response_timeout, Duration::from_secs(5));
    }
}
