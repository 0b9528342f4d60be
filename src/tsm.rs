//! Application service access point and transaction state machines
//!
//! Confirmed requests run through one TSM per (peer, invoke-id). The state
//! machines are explicit state plus event handlers: every inbound APDU,
//! segment ack, and timer fire mutates the record under a lock, produces a
//! list of APDUs to transmit, and the I/O happens after the lock drops.
//! That keeps cancellation and timeout cleanup local to single functions.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    apdu::{
        AbortPdu, AbortReason, Apdu, ComplexAck, ConfirmedRequest, ConfirmedService, ErrorClass,
        ErrorCode, ErrorPdu, RejectPdu, RejectReason, SegmentAck, Segmentation, SimpleAck,
        UnconfirmedRequest, UnconfirmedService, max_segments_code, max_segments_from_code,
    },
    app::DeviceInfoCache,
    decoder::Decodable,
    encoder::Encodable,
    error::{Error, Result},
    network::{Nsap, UpstreamPdu},
    pdu::{Address, Pdu},
};

/// per-segment header octets of a segmented confirmed request
const SEGMENTED_REQUEST_HEADER: usize = 6;
/// per-segment header octets of a segmented complex ack
const SEGMENTED_ACK_HEADER: usize = 5;

/// ASAP tuning knobs; the defaults match the device-object defaults
#[derive(Debug, Clone)]
pub struct AsapConfig {
    /// wait for a confirmation before retrying, per attempt
    pub apdu_timeout: Duration,
    /// wait for a segment ack before retransmitting the window
    pub segment_timeout: Duration,
    /// retransmissions before the transaction aborts
    pub retries: u32,
    /// window size proposed when we segment
    pub proposed_window_size: u8,
    /// largest APDU we accept
    pub max_apdu: u16,
    /// most segments we accept in one transaction (0 = unspecified)
    pub max_segments: u8,
    /// what we advertise in I-Am
    pub segmentation: Segmentation,
}

impl Default for AsapConfig {
    fn default() -> Self {
        AsapConfig {
            apdu_timeout: Duration::from_secs(3),
            segment_timeout: Duration::from_secs(2),
            retries: 3,
            proposed_window_size: 4,
            max_apdu: 1476,
            max_segments: 16,
            segmentation: Segmentation::SegmentedBoth,
        }
    }
}

/// A complete confirmed request handed up to the application
#[derive(Debug)]
pub struct IncomingRequest {
    pub source: Address,
    pub invoke_id: u8,
    pub service: ConfirmedService,
    /// fully reassembled parameter octets
    pub parameters: Vec<u8>,
    /// largest APDU the requester accepts
    pub max_apdu: u16,
    /// requester accepts a segmented response
    pub segmented_response_accepted: bool,
    /// most segments the requester accepts (0 = unspecified)
    pub max_segments: u8,
}

/// An unconfirmed request handed up to the application
#[derive(Debug)]
pub struct IncomingUnconfirmed {
    pub source: Address,
    /// the local or broadcast scope it arrived under
    pub destination: Address,
    pub service: UnconfirmedService,
    pub parameters: Vec<u8>,
}

/// What the ASAP delivers upward
#[derive(Debug)]
pub enum IncomingApdu {
    Confirmed(IncomingRequest),
    Unconfirmed(IncomingUnconfirmed),
}

/// The application's answer to a confirmed request
#[derive(Debug)]
pub enum Response {
    /// service completed, no data
    Simple,
    /// service completed with result octets
    Complex(Vec<u8>),
    /// service failed
    Error(ErrorClass, ErrorCode),
    /// protocol-violating request
    Reject(RejectReason),
    /// transaction abandoned
    Abort(AbortReason),
}

/// The resolution of a confirmed request future
pub type Confirmation = Result<Option<ComplexAck>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    /// transmitting request segments
    SegmentedRequest,
    /// request fully sent, waiting for the response
    AwaitingConfirmation,
    /// receiving response segments
    SegmentedConfirmation,
}

struct ClientTsm {
    state: ClientState,
    service: ConfirmedService,
    /// complete request parameters, pre-segmentation
    parameters: Vec<u8>,
    /// parameter chunks when segmenting, empty otherwise
    segments: Vec<Vec<u8>>,
    /// negotiated transmit window
    window_size: u8,
    /// index of the first unacknowledged segment
    window_base: usize,
    retry_count: u32,
    /// peer limits used to build segments
    peer_max_apdu: u16,
    segmented_response_accepted: bool,
    /// reassembly of a segmented response
    response_parameters: Vec<u8>,
    response_next_seq: u8,
    response_window: u8,
    response_service: ConfirmedService,
    /// guards stale timer fires
    epoch: u64,
    timer: Option<tokio::task::JoinHandle<()>>,
    tx: Option<oneshot::Sender<Confirmation>>,
    /// device-info held for the transaction's lifetime
    info_held: bool,
}

impl ClientTsm {
    fn resolve(&mut self, result: Confirmation) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    /// receiving request segments
    SegmentedRequest,
    /// request delivered, waiting on the application
    AwaitingResponse,
    /// transmitting response segments
    SegmentedResponse,
}

struct ServerTsm {
    state: ServerState,
    service: ConfirmedService,
    /// reassembly of a segmented request
    request_parameters: Vec<u8>,
    request_next_seq: u8,
    request_window: u8,
    /// requester limits for the response
    max_apdu: u16,
    segmented_response_accepted: bool,
    max_segments: u8,
    /// response segments being transmitted
    segments: Vec<Vec<u8>>,
    window_size: u8,
    window_base: usize,
    retry_count: u32,
    epoch: u64,
    timer: Option<tokio::task::JoinHandle<()>>,
}

impl ServerTsm {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

enum TimerKind {
    Client,
    Server,
}

/// Application Service Access Point: invoke-ID allocation, dispatch,
/// and the segmentation machinery
pub struct Asap {
    config: AsapConfig,
    nsap: Arc<Nsap>,
    device_info: Arc<Mutex<DeviceInfoCache>>,
    clients: Mutex<HashMap<(Address, u8), ClientTsm>>,
    servers: Mutex<HashMap<(Address, u8), ServerTsm>>,
    invoke_counters: Mutex<HashMap<Address, u8>>,
    upstream: Mutex<Option<mpsc::Sender<IncomingApdu>>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Asap {
    pub fn new(
        config: AsapConfig,
        nsap: Arc<Nsap>,
        device_info: Arc<Mutex<DeviceInfoCache>>,
    ) -> Arc<Self> {
        Arc::new(Asap {
            config,
            nsap,
            device_info,
            clients: Mutex::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
            invoke_counters: Mutex::new(HashMap::new()),
            upstream: Mutex::new(None),
            pump: Mutex::new(None),
        })
    }

    /// wire the NSAP below and the application channel above, then start
    /// the upstream pump
    pub fn start(self: &Arc<Self>, upstream: mpsc::Sender<IncomingApdu>) {
        *self.upstream.lock().expect("poisoned") = Some(upstream);
        let (tx, mut rx) = mpsc::channel::<UpstreamPdu>(64);
        self.nsap.start(tx);
        let asap = self.clone();
        *self.pump.lock().expect("poisoned") = Some(tokio::spawn(async move {
            while let Some(pdu) = rx.recv().await {
                asap.handle_upstream(pdu).await;
            }
        }));
    }

    /// stop the pump and fail every outstanding transaction
    pub fn stop(&self) {
        if let Some(pump) = self.pump.lock().expect("poisoned").take() {
            pump.abort();
        }
        let mut clients = self.clients.lock().expect("poisoned");
        for (_, mut tsm) in clients.drain() {
            tsm.resolve(Err(Error::Cancelled));
        }
        let mut servers = self.servers.lock().expect("poisoned");
        for (_, mut tsm) in servers.drain() {
            tsm.stop_timer();
        }
    }

    async fn try_send_apdu(
        &self,
        destination: &Address,
        apdu: &Apdu,
        expecting_reply: bool,
    ) -> Result<()> {
        let pdu = Pdu::new(destination.clone(), apdu.to_vec()?).expecting_reply(expecting_reply);
        self.nsap.request(pdu).await
    }

    async fn send_apdu(&self, destination: &Address, apdu: &Apdu, expecting_reply: bool) {
        if let Err(e) = self.try_send_apdu(destination, apdu, expecting_reply).await {
            warn!("send to {destination:?} failed: {e}");
        }
    }

    /// send an unconfirmed request; resolves as soon as the bytes are queued
    pub async fn send_unconfirmed(
        &self,
        destination: &Address,
        service: UnconfirmedService,
        parameters: Vec<u8>,
    ) -> Result<()> {
        let apdu = Apdu::UnconfirmedRequest(UnconfirmedRequest {
            service,
            parameters,
        });
        let pdu = Pdu::new(destination.clone(), apdu.to_vec()?);
        self.nsap.request(pdu).await
    }

    /// next free invoke id for the peer
    fn allocate_invoke_id(&self, peer: &Address) -> Result<u8> {
        let mut counters = self.invoke_counters.lock().expect("poisoned");
        let clients = self.clients.lock().expect("poisoned");
        let counter = counters
            .entry(peer.clone())
            .or_insert_with(|| rand::random());
        for _ in 0..=u8::MAX as usize {
            let id = *counter;
            *counter = counter.wrapping_add(1);
            if !clients.contains_key(&(peer.clone(), id)) {
                return Ok(id);
            }
        }
        Err(Error::Abort(AbortReason::OutOfResources))
    }

    /// Issue a confirmed request. The returned future resolves exactly once
    /// with the ack (None for a SimpleAck), an Error/Reject/Abort, or
    /// cancellation.
    pub async fn request(
        self: &Arc<Self>,
        peer: Address,
        service: ConfirmedService,
        parameters: Vec<u8>,
    ) -> Result<oneshot::Receiver<Confirmation>> {
        if peer.is_broadcast() {
            return Err(Error::Config("confirmed requests cannot be broadcast"));
        }
        let invoke_id = self.allocate_invoke_id(&peer)?;

        // peer limits from the device-info cache; conservative defaults
        // when the peer is unknown
        let (peer_max_apdu, peer_segmentation, peer_max_segments, info_held) = {
            let mut cache = self.device_info.lock().expect("poisoned");
            match cache.acquire_by_address(&peer) {
                Some(info) => (
                    info.max_apdu_length_accepted,
                    info.segmentation_supported,
                    info.max_segments_accepted,
                    true,
                ),
                None => (480, Segmentation::NoSegmentation, 0, false),
            }
        };

        let fits = parameters.len() + SEGMENTED_REQUEST_HEADER <= peer_max_apdu as usize;
        let mutual_segmentation =
            self.config.segmentation.can_transmit() && peer_segmentation.can_receive();

        let (tx, rx) = oneshot::channel();
        let mut actions: Vec<Apdu> = Vec::new();

        {
            let mut clients = self.clients.lock().expect("poisoned");
            let mut tsm = ClientTsm {
                state: ClientState::AwaitingConfirmation,
                service,
                parameters: parameters.clone(),
                segments: Vec::new(),
                window_size: self.config.proposed_window_size,
                window_base: 0,
                retry_count: 0,
                peer_max_apdu,
                segmented_response_accepted: self.config.segmentation.can_receive(),
                response_parameters: Vec::new(),
                response_next_seq: 0,
                response_window: 0,
                response_service: service,
                epoch: 0,
                timer: None,
                tx: Some(tx),
                info_held,
            };

            if fits {
                actions.push(Apdu::ConfirmedRequest(self.build_request(
                    &tsm,
                    invoke_id,
                    None,
                    parameters,
                )));
            } else {
                if !mutual_segmentation {
                    let mut tsm = tsm;
                    tsm.resolve(Err(Error::Abort(AbortReason::SegmentationNotSupported)));
                    self.release_info(&peer, tsm.info_held);
                    return Ok(rx);
                }
                let chunk = (peer_max_apdu as usize).saturating_sub(SEGMENTED_REQUEST_HEADER);
                tsm.segments = parameters.chunks(chunk.max(1)).map(<[u8]>::to_vec).collect();
                if peer_max_segments != 0 && tsm.segments.len() > peer_max_segments as usize {
                    let mut tsm = tsm;
                    tsm.resolve(Err(Error::Abort(AbortReason::ApduTooLong)));
                    self.release_info(&peer, tsm.info_held);
                    return Ok(rx);
                }
                tsm.state = ClientState::SegmentedRequest;
                for (seq, segment) in tsm
                    .segments
                    .iter()
                    .take(tsm.window_size as usize)
                    .enumerate()
                {
                    actions.push(Apdu::ConfirmedRequest(self.build_request(
                        &tsm,
                        invoke_id,
                        Some((seq as u8, seq + 1 < tsm.segments.len())),
                        segment.clone(),
                    )));
                }
            }

            let timeout = match tsm.state {
                ClientState::SegmentedRequest => self.config.segment_timeout,
                _ => self.config.apdu_timeout,
            };
            tsm.timer = Some(self.arm_timer(peer.clone(), invoke_id, 0, timeout, TimerKind::Client));
            clients.insert((peer.clone(), invoke_id), tsm);
        }

        for apdu in actions {
            // a routing failure fails the transaction up front
            if let Err(e) = self.try_send_apdu(&peer, &apdu, true).await {
                self.resolve_client(&peer, invoke_id, Err(e));
                break;
            }
        }
        Ok(rx)
    }

    fn build_request(
        &self,
        tsm: &ClientTsm,
        invoke_id: u8,
        segment: Option<(u8, bool)>,
        parameters: Vec<u8>,
    ) -> ConfirmedRequest {
        ConfirmedRequest {
            segmented: segment.is_some(),
            more_follows: segment.map(|(_, more)| more).unwrap_or(false),
            segmented_response_accepted: tsm.segmented_response_accepted,
            max_segments: max_segments_from_code(max_segments_code(self.config.max_segments)),
            max_apdu: self.config.max_apdu,
            invoke_id,
            sequence_number: segment.map(|(seq, _)| seq),
            window_size: segment.map(|_| tsm.window_size),
            service: tsm.service,
            parameters,
        }
    }

    fn arm_timer(
        self: &Arc<Self>,
        peer: Address,
        invoke_id: u8,
        epoch: u64,
        after: Duration,
        kind: TimerKind,
    ) -> tokio::task::JoinHandle<()> {
        let asap = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            match kind {
                TimerKind::Client => asap.client_timeout(&peer, invoke_id, epoch).await,
                TimerKind::Server => asap.server_timeout(&peer, invoke_id, epoch).await,
            }
        })
    }

    fn release_info(&self, peer: &Address, held: bool) {
        if held {
            self.device_info.lock().expect("poisoned").release(peer);
        }
    }

    // ---- upstream dispatch --------------------------------------------

    async fn handle_upstream(self: &Arc<Self>, pdu: UpstreamPdu) {
        let apdu = match Apdu::from_bytes(&pdu.apdu) {
            Ok(a) => a,
            Err(e) => {
                warn!("dropping malformed APDU from {:?}: {e}", pdu.source);
                return;
            }
        };
        match apdu {
            Apdu::ConfirmedRequest(request) => {
                if pdu.destination.is_broadcast() {
                    debug!("ignoring broadcast confirmed request");
                    return;
                }
                self.handle_confirmed_request(pdu.source, request).await;
            }
            Apdu::UnconfirmedRequest(request) => {
                let upstream = self.upstream.lock().expect("poisoned").clone();
                if let Some(tx) = upstream {
                    let _ = tx
                        .send(IncomingApdu::Unconfirmed(IncomingUnconfirmed {
                            source: pdu.source,
                            destination: pdu.destination,
                            service: request.service,
                            parameters: request.parameters,
                        }))
                        .await;
                }
            }
            Apdu::SimpleAck(ack) => {
                self.resolve_client(&pdu.source, ack.invoke_id, Ok(None));
            }
            Apdu::ComplexAck(ack) => {
                self.handle_complex_ack(pdu.source, ack).await;
            }
            Apdu::SegmentAck(ack) => {
                if ack.from_server {
                    self.handle_segment_ack_client(pdu.source, ack).await;
                } else {
                    self.handle_segment_ack_server(pdu.source, ack).await;
                }
            }
            Apdu::Error(error) => {
                self.resolve_client(
                    &pdu.source,
                    error.invoke_id,
                    Err(Error::execution(error.error_class, error.error_code)),
                );
            }
            Apdu::Reject(reject) => {
                self.resolve_client(&pdu.source, reject.invoke_id, Err(Error::Reject(reject.reason)));
            }
            Apdu::Abort(abort) => {
                if abort.from_server {
                    self.resolve_client(
                        &pdu.source,
                        abort.invoke_id,
                        Err(Error::Abort(abort.reason)),
                    );
                } else {
                    // requester abandoned; drop the server record
                    let mut servers = self.servers.lock().expect("poisoned");
                    if let Some(mut tsm) = servers.remove(&(pdu.source.clone(), abort.invoke_id)) {
                        tsm.stop_timer();
                    }
                }
            }
        }
    }

    /// resolve a client TSM and tear it down
    fn resolve_client(&self, peer: &Address, invoke_id: u8, result: Confirmation) {
        let removed = {
            let mut clients = self.clients.lock().expect("poisoned");
            clients.remove(&(peer.clone(), invoke_id))
        };
        match removed {
            Some(mut tsm) => {
                tsm.resolve(result);
                self.release_info(peer, tsm.info_held);
            }
            None => debug!("response for unknown transaction {invoke_id} from {peer:?}"),
        }
    }

    async fn handle_complex_ack(self: &Arc<Self>, source: Address, ack: ComplexAck) {
        if !ack.segmented {
            self.resolve_client(&source, ack.invoke_id, Ok(Some(ack)));
            return;
        }

        // segmented response: receiver state machine
        let mut reply: Option<Apdu> = None;
        let mut complete: Option<Confirmation> = None;
        {
            let mut clients = self.clients.lock().expect("poisoned");
            let Some(tsm) = clients.get_mut(&(source.clone(), ack.invoke_id)) else {
                return;
            };
            if !tsm.segmented_response_accepted {
                complete = Some(Err(Error::Abort(AbortReason::SegmentationNotSupported)));
                reply = Some(Apdu::Abort(AbortPdu {
                    from_server: false,
                    invoke_id: ack.invoke_id,
                    reason: AbortReason::SegmentationNotSupported,
                }));
            } else {
                let window = ack.window_size.unwrap_or(1);
                if window == 0 || window > 127 {
                    complete = Some(Err(Error::Abort(AbortReason::WindowSizeOutOfRange)));
                    reply = Some(Apdu::Abort(AbortPdu {
                        from_server: false,
                        invoke_id: ack.invoke_id,
                        reason: AbortReason::WindowSizeOutOfRange,
                    }));
                } else {
                    let seq = ack.sequence_number.unwrap_or(0);
                    if tsm.state != ClientState::SegmentedConfirmation {
                        if seq != 0 {
                            // first segment must be sequence zero
                            complete =
                                Some(Err(Error::Abort(AbortReason::InvalidApduInThisState)));
                            reply = Some(Apdu::Abort(AbortPdu {
                                from_server: false,
                                invoke_id: ack.invoke_id,
                                reason: AbortReason::InvalidApduInThisState,
                            }));
                        } else {
                            tsm.state = ClientState::SegmentedConfirmation;
                            tsm.response_window = window;
                            tsm.response_service = ack.service;
                            tsm.response_parameters = ack.parameters.clone();
                            tsm.response_next_seq = 1;
                        }
                    } else if seq == tsm.response_next_seq {
                        tsm.response_parameters.extend_from_slice(&ack.parameters);
                        tsm.response_next_seq = tsm.response_next_seq.wrapping_add(1);
                        if self.config.max_segments != 0
                            && tsm.response_next_seq as usize > self.config.max_segments as usize
                        {
                            complete = Some(Err(Error::Abort(AbortReason::BufferOverflow)));
                            reply = Some(Apdu::Abort(AbortPdu {
                                from_server: false,
                                invoke_id: ack.invoke_id,
                                reason: AbortReason::BufferOverflow,
                            }));
                        }
                    } else {
                        // duplicate or out of order: nak with the last
                        // in-order sequence, window does not advance
                        reply = Some(Apdu::SegmentAck(SegmentAck {
                            negative: true,
                            from_server: false,
                            invoke_id: ack.invoke_id,
                            sequence_number: tsm.response_next_seq.wrapping_sub(1),
                            actual_window_size: tsm.response_window,
                        }));
                    }

                    if complete.is_none() && reply.is_none() {
                        let last = tsm.response_next_seq.wrapping_sub(1);
                        let window_full =
                            u16::from(tsm.response_next_seq) % u16::from(tsm.response_window) == 0;
                        if !ack.more_follows {
                            reply = Some(Apdu::SegmentAck(SegmentAck {
                                negative: false,
                                from_server: false,
                                invoke_id: ack.invoke_id,
                                sequence_number: last,
                                actual_window_size: tsm.response_window,
                            }));
                            complete = Some(Ok(Some(ComplexAck::new(
                                ack.invoke_id,
                                tsm.response_service,
                                std::mem::take(&mut tsm.response_parameters),
                            ))));
                        } else if window_full {
                            reply = Some(Apdu::SegmentAck(SegmentAck {
                                negative: false,
                                from_server: false,
                                invoke_id: ack.invoke_id,
                                sequence_number: last,
                                actual_window_size: tsm.response_window,
                            }));
                        }
                        // receiving segments restarts the inactivity clock
                        tsm.epoch += 1;
                        if let Some(timer) = tsm.timer.take() {
                            timer.abort();
                        }
                        tsm.timer = Some(self.arm_timer(
                            source.clone(),
                            ack.invoke_id,
                            tsm.epoch,
                            self.config.segment_timeout,
                            TimerKind::Client,
                        ));
                    }
                }
            }
        }

        if let Some(apdu) = reply {
            self.send_apdu(&source, &apdu, false).await;
        }
        if let Some(result) = complete {
            self.resolve_client(&source, ack.invoke_id, result);
        }
    }

    /// the server acknowledged some of our request segments
    async fn handle_segment_ack_client(self: &Arc<Self>, source: Address, ack: SegmentAck) {
        let mut actions: Vec<Apdu> = Vec::new();
        {
            let mut clients = self.clients.lock().expect("poisoned");
            let Some(tsm) = clients.get_mut(&(source.clone(), ack.invoke_id)) else {
                return;
            };
            if tsm.state != ClientState::SegmentedRequest {
                return;
            }
            // the ack names the last sequence received in order; the
            // window advances monotonically
            let acked = ack.sequence_number as usize + 1;
            if acked <= tsm.window_base && ack.negative {
                // peer is missing segments: retransmit from the base
            } else if acked > tsm.window_base {
                tsm.window_base = acked;
                tsm.retry_count = 0;
            }
            tsm.window_size = tsm.window_size.min(ack.actual_window_size.max(1));

            if tsm.window_base >= tsm.segments.len() {
                // request fully delivered; now the response clock runs
                tsm.state = ClientState::AwaitingConfirmation;
                tsm.epoch += 1;
                if let Some(timer) = tsm.timer.take() {
                    timer.abort();
                }
                tsm.timer = Some(self.arm_timer(
                    source.clone(),
                    ack.invoke_id,
                    tsm.epoch,
                    self.config.apdu_timeout,
                    TimerKind::Client,
                ));
            } else {
                for offset in 0..tsm.window_size as usize {
                    let index = tsm.window_base + offset;
                    let Some(segment) = tsm.segments.get(index) else {
                        break;
                    };
                    actions.push(Apdu::ConfirmedRequest(self.build_request(
                        tsm,
                        ack.invoke_id,
                        Some((index as u8, index + 1 < tsm.segments.len())),
                        segment.clone(),
                    )));
                }
                tsm.epoch += 1;
                if let Some(timer) = tsm.timer.take() {
                    timer.abort();
                }
                tsm.timer = Some(self.arm_timer(
                    source.clone(),
                    ack.invoke_id,
                    tsm.epoch,
                    self.config.segment_timeout,
                    TimerKind::Client,
                ));
            }
        }
        for apdu in actions {
            self.send_apdu(&source, &apdu, true).await;
        }
    }

    async fn client_timeout(self: &Arc<Self>, peer: &Address, invoke_id: u8, epoch: u64) {
        let mut actions: Vec<Apdu> = Vec::new();
        let mut failed = false;
        {
            let mut clients = self.clients.lock().expect("poisoned");
            let Some(tsm) = clients.get_mut(&(peer.clone(), invoke_id)) else {
                return;
            };
            if tsm.epoch != epoch {
                return;
            }
            tsm.retry_count += 1;
            if tsm.retry_count > self.config.retries {
                failed = true;
                actions.push(Apdu::Abort(AbortPdu {
                    from_server: false,
                    invoke_id,
                    reason: AbortReason::TsmTimeout,
                }));
            } else {
                match tsm.state {
                    ClientState::AwaitingConfirmation => {
                        // retransmit the whole request
                        if tsm.segments.is_empty() {
                            actions.push(Apdu::ConfirmedRequest(self.build_request(
                                tsm,
                                invoke_id,
                                None,
                                tsm.parameters.clone(),
                            )));
                        }
                    }
                    ClientState::SegmentedRequest => {
                        // retransmit the unacknowledged window
                        for offset in 0..tsm.window_size as usize {
                            let index = tsm.window_base + offset;
                            let Some(segment) = tsm.segments.get(index) else {
                                break;
                            };
                            actions.push(Apdu::ConfirmedRequest(self.build_request(
                                tsm,
                                invoke_id,
                                Some((index as u8, index + 1 < tsm.segments.len())),
                                segment.clone(),
                            )));
                        }
                    }
                    ClientState::SegmentedConfirmation => {
                        // the response stalled
                        failed = true;
                        actions.push(Apdu::Abort(AbortPdu {
                            from_server: false,
                            invoke_id,
                            reason: AbortReason::TsmTimeout,
                        }));
                    }
                }
                if !failed {
                    tsm.epoch += 1;
                    let timeout = match tsm.state {
                        ClientState::AwaitingConfirmation => self.config.apdu_timeout,
                        _ => self.config.segment_timeout,
                    };
                    tsm.timer = Some(self.arm_timer(
                        peer.clone(),
                        invoke_id,
                        tsm.epoch,
                        timeout,
                        TimerKind::Client,
                    ));
                }
            }
        }
        for apdu in &actions {
            self.send_apdu(peer, apdu, !failed).await;
        }
        if failed {
            self.resolve_client(peer, invoke_id, Err(Error::Abort(AbortReason::TsmTimeout)));
        }
    }

    // ---- server side ---------------------------------------------------

    async fn handle_confirmed_request(self: &Arc<Self>, source: Address, request: ConfirmedRequest) {
        let invoke_id = request.invoke_id;

        if !request.segmented {
            // duplicate of an in-flight transaction is ignored; the
            // response or its retransmission answers it
            let deliver = {
                let servers = self.servers.lock().expect("poisoned");
                !servers.contains_key(&(source.clone(), invoke_id))
            };
            if !deliver {
                return;
            }
            {
                let mut servers = self.servers.lock().expect("poisoned");
                servers.insert(
                    (source.clone(), invoke_id),
                    ServerTsm {
                        state: ServerState::AwaitingResponse,
                        service: request.service,
                        request_parameters: Vec::new(),
                        request_next_seq: 0,
                        request_window: 0,
                        max_apdu: request.max_apdu,
                        segmented_response_accepted: request.segmented_response_accepted,
                        max_segments: request.max_segments,
                        segments: Vec::new(),
                        window_size: 0,
                        window_base: 0,
                        retry_count: 0,
                        epoch: 0,
                        timer: None,
                    },
                );
            }
            self.deliver_request(source, request.service, request.parameters, invoke_id)
                .await;
            return;
        }

        // segmented request: receiver state machine
        if !self.config.segmentation.can_receive() {
            self.send_apdu(
                &source,
                &Apdu::Abort(AbortPdu {
                    from_server: true,
                    invoke_id,
                    reason: AbortReason::SegmentationNotSupported,
                }),
                false,
            )
            .await;
            return;
        }

        let mut reply: Option<Apdu> = None;
        let mut deliver: Option<(ConfirmedService, Vec<u8>)> = None;
        {
            let mut servers = self.servers.lock().expect("poisoned");
            let seq = request.sequence_number.unwrap_or(0);
            let window = request.window_size.unwrap_or(1).clamp(1, 127);

            let tsm = servers
                .entry((source.clone(), invoke_id))
                .or_insert_with(|| ServerTsm {
                    state: ServerState::SegmentedRequest,
                    service: request.service,
                    request_parameters: Vec::new(),
                    request_next_seq: 0,
                    request_window: window,
                    max_apdu: request.max_apdu,
                    segmented_response_accepted: request.segmented_response_accepted,
                    max_segments: request.max_segments,
                    segments: Vec::new(),
                    window_size: 0,
                    window_base: 0,
                    retry_count: 0,
                    epoch: 0,
                    timer: None,
                });
            if tsm.state != ServerState::SegmentedRequest {
                return;
            }

            if seq == tsm.request_next_seq {
                tsm.request_parameters.extend_from_slice(&request.parameters);
                tsm.request_next_seq = tsm.request_next_seq.wrapping_add(1);
                if self.config.max_segments != 0
                    && tsm.request_next_seq as usize > self.config.max_segments as usize
                {
                    reply = Some(Apdu::Abort(AbortPdu {
                        from_server: true,
                        invoke_id,
                        reason: AbortReason::BufferOverflow,
                    }));
                    let mut tsm = servers
                        .remove(&(source.clone(), invoke_id))
                        .expect("present");
                    tsm.stop_timer();
                } else {
                    let last = tsm.request_next_seq.wrapping_sub(1);
                    let window_full =
                        u16::from(tsm.request_next_seq) % u16::from(tsm.request_window) == 0;
                    if !request.more_follows {
                        reply = Some(Apdu::SegmentAck(SegmentAck {
                            negative: false,
                            from_server: true,
                            invoke_id,
                            sequence_number: last,
                            actual_window_size: tsm.request_window,
                        }));
                        tsm.state = ServerState::AwaitingResponse;
                        deliver = Some((
                            tsm.service,
                            std::mem::take(&mut tsm.request_parameters),
                        ));
                    } else if window_full {
                        reply = Some(Apdu::SegmentAck(SegmentAck {
                            negative: false,
                            from_server: true,
                            invoke_id,
                            sequence_number: last,
                            actual_window_size: tsm.request_window,
                        }));
                    }
                }
            } else {
                reply = Some(Apdu::SegmentAck(SegmentAck {
                    negative: true,
                    from_server: true,
                    invoke_id,
                    sequence_number: tsm.request_next_seq.wrapping_sub(1),
                    actual_window_size: tsm.request_window,
                }));
            }
        }

        if let Some(apdu) = reply {
            self.send_apdu(&source, &apdu, false).await;
        }
        if let Some((service, parameters)) = deliver {
            self.deliver_request(source, service, parameters, invoke_id)
                .await;
        }
    }

    async fn deliver_request(
        &self,
        source: Address,
        service: ConfirmedService,
        parameters: Vec<u8>,
        invoke_id: u8,
    ) {
        let (max_apdu, sa, max_segments) = {
            let servers = self.servers.lock().expect("poisoned");
            match servers.get(&(source.clone(), invoke_id)) {
                Some(tsm) => (
                    tsm.max_apdu,
                    tsm.segmented_response_accepted,
                    tsm.max_segments,
                ),
                None => return,
            }
        };
        let upstream = self.upstream.lock().expect("poisoned").clone();
        if let Some(tx) = upstream {
            let _ = tx
                .send(IncomingApdu::Confirmed(IncomingRequest {
                    source,
                    invoke_id,
                    service,
                    parameters,
                    max_apdu,
                    segmented_response_accepted: sa,
                    max_segments,
                }))
                .await;
        }
    }

    /// Answer a confirmed request. Complex results that exceed the
    /// requester's APDU limit are segmented when the requester allows it.
    pub async fn respond(
        self: &Arc<Self>,
        peer: &Address,
        invoke_id: u8,
        response: Response,
    ) -> Result<()> {
        let mut actions: Vec<Apdu> = Vec::new();
        let mut finished = true;
        {
            let mut servers = self.servers.lock().expect("poisoned");
            let Some(tsm) = servers.get_mut(&(peer.clone(), invoke_id)) else {
                return Err(Error::Config("no transaction to respond to"));
            };
            let service = tsm.service;
            match response {
                Response::Simple => actions.push(Apdu::SimpleAck(SimpleAck {
                    invoke_id,
                    service,
                })),
                Response::Error(class, code) => actions.push(Apdu::Error(ErrorPdu {
                    invoke_id,
                    service,
                    error_class: class,
                    error_code: code,
                })),
                Response::Reject(reason) => actions.push(Apdu::Reject(RejectPdu {
                    invoke_id,
                    reason,
                })),
                Response::Abort(reason) => actions.push(Apdu::Abort(AbortPdu {
                    from_server: true,
                    invoke_id,
                    reason,
                })),
                Response::Complex(parameters) => {
                    let fits =
                        parameters.len() + SEGMENTED_ACK_HEADER <= tsm.max_apdu as usize;
                    if fits {
                        actions.push(Apdu::ComplexAck(ComplexAck::new(
                            invoke_id,
                            service,
                            parameters,
                        )));
                    } else if !tsm.segmented_response_accepted
                        || !self.config.segmentation.can_transmit()
                    {
                        actions.push(Apdu::Abort(AbortPdu {
                            from_server: true,
                            invoke_id,
                            reason: AbortReason::SegmentationNotSupported,
                        }));
                    } else {
                        let chunk =
                            (tsm.max_apdu as usize).saturating_sub(SEGMENTED_ACK_HEADER);
                        tsm.segments =
                            parameters.chunks(chunk.max(1)).map(<[u8]>::to_vec).collect();
                        if tsm.max_segments != 0
                            && tsm.segments.len() > tsm.max_segments as usize
                        {
                            tsm.segments.clear();
                            actions.push(Apdu::Abort(AbortPdu {
                                from_server: true,
                                invoke_id,
                                reason: AbortReason::ApduTooLong,
                            }));
                        } else {
                            finished = false;
                            tsm.state = ServerState::SegmentedResponse;
                            tsm.window_size = self.config.proposed_window_size;
                            tsm.window_base = 0;
                            for (seq, segment) in tsm
                                .segments
                                .iter()
                                .take(tsm.window_size as usize)
                                .enumerate()
                            {
                                actions.push(Apdu::ComplexAck(ComplexAck {
                                    segmented: true,
                                    more_follows: seq + 1 < tsm.segments.len(),
                                    invoke_id,
                                    sequence_number: Some(seq as u8),
                                    window_size: Some(tsm.window_size),
                                    service,
                                    parameters: segment.clone(),
                                }));
                            }
                            tsm.epoch += 1;
                            tsm.timer = Some(self.arm_timer(
                                peer.clone(),
                                invoke_id,
                                tsm.epoch,
                                self.config.segment_timeout,
                                TimerKind::Server,
                            ));
                        }
                    }
                }
            }
            if finished {
                let mut tsm = servers.remove(&(peer.clone(), invoke_id)).expect("present");
                tsm.stop_timer();
            }
        }
        for apdu in actions {
            self.send_apdu(peer, &apdu, false).await;
        }
        Ok(())
    }

    /// the requester acknowledged some of our response segments
    async fn handle_segment_ack_server(self: &Arc<Self>, source: Address, ack: SegmentAck) {
        let mut actions: Vec<Apdu> = Vec::new();
        let mut finished = false;
        {
            let mut servers = self.servers.lock().expect("poisoned");
            let Some(tsm) = servers.get_mut(&(source.clone(), ack.invoke_id)) else {
                return;
            };
            if tsm.state != ServerState::SegmentedResponse {
                return;
            }
            let acked = ack.sequence_number as usize + 1;
            if acked > tsm.window_base {
                tsm.window_base = acked;
                tsm.retry_count = 0;
            }
            tsm.window_size = tsm.window_size.min(ack.actual_window_size.max(1));

            if tsm.window_base >= tsm.segments.len() {
                finished = true;
            } else {
                for offset in 0..tsm.window_size as usize {
                    let index = tsm.window_base + offset;
                    let Some(segment) = tsm.segments.get(index) else {
                        break;
                    };
                    actions.push(Apdu::ComplexAck(ComplexAck {
                        segmented: true,
                        more_follows: index + 1 < tsm.segments.len(),
                        invoke_id: ack.invoke_id,
                        sequence_number: Some(index as u8),
                        window_size: Some(tsm.window_size),
                        service: tsm.service,
                        parameters: segment.clone(),
                    }));
                }
                tsm.epoch += 1;
                if let Some(timer) = tsm.timer.take() {
                    timer.abort();
                }
                tsm.timer = Some(self.arm_timer(
                    source.clone(),
                    ack.invoke_id,
                    tsm.epoch,
                    self.config.segment_timeout,
                    TimerKind::Server,
                ));
            }
            if finished {
                let mut tsm = servers
                    .remove(&(source.clone(), ack.invoke_id))
                    .expect("present");
                tsm.stop_timer();
            }
        }
        for apdu in actions {
            self.send_apdu(&source, &apdu, false).await;
        }
    }

    async fn server_timeout(self: &Arc<Self>, peer: &Address, invoke_id: u8, epoch: u64) {
        let mut actions: Vec<Apdu> = Vec::new();
        {
            let mut servers = self.servers.lock().expect("poisoned");
            let Some(tsm) = servers.get_mut(&(peer.clone(), invoke_id)) else {
                return;
            };
            if tsm.epoch != epoch || tsm.state != ServerState::SegmentedResponse {
                return;
            }
            tsm.retry_count += 1;
            if tsm.retry_count > self.config.retries {
                actions.push(Apdu::Abort(AbortPdu {
                    from_server: true,
                    invoke_id,
                    reason: AbortReason::TsmTimeout,
                }));
                let mut tsm = servers.remove(&(peer.clone(), invoke_id)).expect("present");
                tsm.stop_timer();
            } else {
                for offset in 0..tsm.window_size as usize {
                    let index = tsm.window_base + offset;
                    let Some(segment) = tsm.segments.get(index) else {
                        break;
                    };
                    actions.push(Apdu::ComplexAck(ComplexAck {
                        segmented: true,
                        more_follows: index + 1 < tsm.segments.len(),
                        invoke_id,
                        sequence_number: Some(index as u8),
                        window_size: Some(tsm.window_size),
                        service: tsm.service,
                        parameters: segment.clone(),
                    }));
                }
                tsm.epoch += 1;
                tsm.timer = Some(self.arm_timer(
                    peer.clone(),
                    invoke_id,
                    tsm.epoch,
                    self.config.segment_timeout,
                    TimerKind::Server,
                ));
            }
        }
        for apdu in actions {
            self.send_apdu(peer, &apdu, false).await;
        }
    }

    /// outstanding client transactions, for diagnostics and tests
    pub fn outstanding(&self) -> usize {
        self.clients.lock().expect("poisoned").len()
    }
}
