//! Link session with the pump
//!
//! The session owns the transport for the whole import and walks the link
//! through `Disconnected -> Discovering -> Connecting -> Connected`. Once
//! connected, every information frame carries the 3-bit send and receive
//! counters. The pump rejects anything out of sequence, so the counters only
//! move after an exchange has been accepted, and a desynchronised link can only
//! be recovered by reconnecting (which zeroes both counters).
//!
//! A history request follows a fixed choreography:
//!
//! 1. host sends `I(ns, nr)` with the request payload
//! 2. pump acknowledges with `RR(ns + 1)`
//! 3. host polls with `RR(nr)`
//! 4. pump answers `I(nr, ...)` with the data
//! 5. host acknowledges with `RR(nr + 1)`
//!
//! Any timeout, bad checksum or choreography mismatch flushes the link, waits a
//! fixed delay and retries the whole request a bounded number of times.

use crate::config::LinkConfig;
use crate::frame::{build_frame, FrameCodec, RawFrame};
use crate::types::{hex_dump, FrameType, PumpError, Result};
use log::{debug, error, info, warn};
use std::fmt;
use tokio::time::{sleep, timeout_at, Instant};

/// Address used for discovery before the pump's own address is known
pub const BROADCAST_ADDRESS: u8 = 0xFF;

/// Payload prefix of a diagnostic echo from the pump
pub const ECHO_MARKER: u8 = 0xD1;

/// Link counters wrap after this many values
pub const COUNTER_MODULUS: u8 = 7;

/// Byte transport to the pump (serial port, IrDA dongle, ...)
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Open the underlying port
    async fn open(&mut self) -> Result<()>;

    /// Write raw bytes
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Wait for the next chunk of received bytes
    async fn read(&mut self) -> Result<Vec<u8>>;

    /// Discard any received bytes not yet delivered
    async fn flush(&mut self) -> Result<()>;

    /// Close the underlying port
    async fn close(&mut self) -> Result<()>;
}

/// Advance a link counter by one
pub fn next_counter(counter: u8) -> u8 {
    (counter + 1) % COUNTER_MODULUS
}

/// Connection phase of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Discovering,
    Connecting,
    Connected,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Disconnected => write!(f, "Disconnected"),
            LinkStatus::Discovering => write!(f, "Discovering"),
            LinkStatus::Connecting => write!(f, "Connecting"),
            LinkStatus::Connected => write!(f, "Connected"),
        }
    }
}

/// Counter and addressing state that must stay in step with the pump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkState {
    pub send_counter: u8,
    pub receive_counter: u8,
    pub address: Option<u8>,
    /// Retries performed over the life of the session
    pub retries: u32,
}

impl LinkState {
    fn zero_counters(&mut self) {
        self.send_counter = 0;
        self.receive_counter = 0;
    }
}

/// One request/response conversation with a pump
pub struct LinkSession {
    transport: Box<dyn Transport>,
    codec: FrameCodec,
    config: LinkConfig,
    status: LinkStatus,
    state: LinkState,
}

impl LinkSession {
    /// Create a new session that takes ownership of the transport
    pub fn new(transport: Box<dyn Transport>, config: LinkConfig) -> Self {
        Self {
            transport,
            codec: FrameCodec::new(),
            config,
            status: LinkStatus::Disconnected,
            state: LinkState::default(),
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Open the transport, discover the pump and connect to it
    pub async fn open(&mut self) -> Result<()> {
        self.transport.open().await?;
        self.establish().await
    }

    async fn establish(&mut self) -> Result<()> {
        let address = self.discover().await?;
        self.connect(address).await
    }

    /// Broadcast discovery across the address slots until a pump answers
    pub async fn discover(&mut self) -> Result<u8> {
        self.status = LinkStatus::Discovering;
        let slots = self.config.discovery_slots;

        for slot in 0..slots {
            let frame = build_frame(
                BROADCAST_ADDRESS,
                FrameType::Discovery.to_u8(),
                &[slot, slots],
            );
            self.write_frame(&frame).await?;

            match self.wait_frame(self.config.discovery_poll_interval).await {
                Ok(response) if response.valid => {
                    if response.frame_type()? != FrameType::Discovery {
                        debug!("Ignoring {} during discovery", response.frame_type()?);
                        continue;
                    }
                    let address = match response.payload.first() {
                        Some(&address) if address != BROADCAST_ADDRESS && address != 0 => address,
                        _ => {
                            warn!("Discovery answer without usable address: [{}]", hex_dump(&response.payload));
                            continue;
                        }
                    };
                    info!(
                        "Pump answered discovery in slot {} with address 0x{:02X}, identity [{}]",
                        slot,
                        address,
                        hex_dump(&response.payload[1..])
                    );
                    return Ok(address);
                }
                Ok(_) => {
                    debug!("Corrupt discovery answer in slot {}", slot);
                    self.codec.reset();
                }
                Err(PumpError::Timeout { .. }) => {
                    debug!("No discovery answer in slot {}", slot);
                }
                Err(e) => return Err(e),
            }
        }

        self.status = LinkStatus::Disconnected;
        error!("Discovery failed on all {} slots", slots);
        Err(PumpError::DiscoveryFailed { slots })
    }

    /// Send an addressed connect and wait for the pump to accept it
    pub async fn connect(&mut self, address: u8) -> Result<()> {
        self.status = LinkStatus::Connecting;
        let frame = build_frame(address, FrameType::Connect.to_u8(), &[]);

        for attempt in 1..=self.config.connect_attempts {
            let result = self.exchange(&frame).await;
            match result {
                Ok(response) if response.valid && response.address == address => {
                    if response.frame_type()? == FrameType::ConnectAck {
                        self.state.address = Some(address);
                        self.state.zero_counters();
                        self.status = LinkStatus::Connected;
                        info!("Connected to pump at address 0x{:02X}", address);
                        return Ok(());
                    }
                    warn!("Connect attempt {} answered with {}", attempt, response.frame_type()?);
                }
                Ok(_) => warn!("Connect attempt {} got a corrupt or misaddressed answer", attempt),
                Err(PumpError::Timeout { .. }) => warn!("Connect attempt {} timed out", attempt),
                Err(e) => return Err(e),
            }
            self.recover().await?;
        }

        self.status = LinkStatus::Disconnected;
        Err(PumpError::ConnectFailed {
            attempts: self.config.connect_attempts,
        })
    }

    /// Drop the link and connect again from scratch, zeroing both counters
    pub async fn reconnect(&mut self) -> Result<()> {
        warn!("Reconnecting to pump");
        if let Err(e) = self.disconnect().await {
            debug!("Ignoring disconnect failure before reconnect: {}", e);
        }
        self.codec.reset();
        self.transport.flush().await?;
        match self.state.address {
            Some(address) => match self.connect(address).await {
                Ok(()) => Ok(()),
                Err(PumpError::ConnectFailed { .. }) => self.establish().await,
                Err(e) => Err(e),
            },
            None => self.establish().await,
        }
    }

    /// Tell the pump the session is over
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.status != LinkStatus::Connected {
            self.status = LinkStatus::Disconnected;
            return Ok(());
        }
        let address = self.state.address.ok_or(PumpError::NotConnected)?;
        let frame = build_frame(address, FrameType::Disconnect.to_u8(), &[]);
        self.status = LinkStatus::Disconnected;
        self.state.zero_counters();

        match self.exchange(&frame).await {
            Ok(response) if response.valid && response.frame_type()? == FrameType::ConnectAck => {
                info!("Disconnected from pump");
            }
            Ok(_) | Err(PumpError::Timeout { .. }) => {
                debug!("Pump did not confirm disconnect");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Release the transport
    pub async fn close(&mut self) -> Result<()> {
        self.disconnect().await?;
        self.transport.close().await
    }

    /// Perform one information exchange, retrying on recoverable failures
    pub async fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if self.status != LinkStatus::Connected {
            return Err(PumpError::NotConnected);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_request(payload).await {
                Ok(data) => return Ok(data),
                Err(e) if Self::is_retryable(&e) && attempt < self.config.max_retries => {
                    warn!(
                        "Request [{}] failed on attempt {}: {}",
                        hex_dump(payload),
                        attempt,
                        e
                    );
                    self.state.retries += 1;
                    self.recover().await?;
                }
                Err(PumpError::Timeout { .. }) => {
                    error!("Request [{}] timed out {} times", hex_dump(payload), attempt);
                    return Err(PumpError::Timeout { attempts: attempt });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn is_retryable(error: &PumpError) -> bool {
        matches!(
            error,
            PumpError::Timeout { .. } | PumpError::ChecksumMismatch | PumpError::UnexpectedResponse(_)
        )
    }

    async fn try_request(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let address = self.state.address.ok_or(PumpError::NotConnected)?;
        let send = self.state.send_counter;
        let receive = self.state.receive_counter;

        let command = build_frame(
            address,
            FrameType::Information { send, receive }.to_u8(),
            payload,
        );
        let ack = self.exchange_checked(&command, address).await?;
        match ack.frame_type()? {
            FrameType::ReceiveReady { receive: acked } if acked == next_counter(send) => {
                self.state.send_counter = acked;
            }
            FrameType::ReceiveReady { receive: acked } => {
                return Err(PumpError::CounterDesync {
                    expected: next_counter(send),
                    got: acked,
                });
            }
            other => {
                return Err(PumpError::UnexpectedResponse(format!(
                    "expected RR after command, got {}",
                    other
                )));
            }
        }

        let poll = build_frame(address, FrameType::ReceiveReady { receive }.to_u8(), &[]);
        let data = self.exchange_checked(&poll, address).await?;
        match data.frame_type()? {
            FrameType::Information { send: device_send, .. } if device_send == receive => {}
            FrameType::Information { send: device_send, .. } => {
                return Err(PumpError::CounterDesync {
                    expected: receive,
                    got: device_send,
                });
            }
            other => {
                return Err(PumpError::UnexpectedResponse(format!(
                    "expected data frame after poll, got {}",
                    other
                )));
            }
        }
        self.state.receive_counter = next_counter(receive);

        let final_ack = build_frame(
            address,
            FrameType::ReceiveReady {
                receive: self.state.receive_counter,
            }
            .to_u8(),
            &[],
        );
        self.write_frame(&final_ack).await?;

        debug!(
            "Exchange complete: ns={} nr={} payload=[{}]",
            self.state.send_counter,
            self.state.receive_counter,
            hex_dump(&data.payload)
        );
        Ok(data.payload)
    }

    /// Exchange one frame, resolving diagnostic echoes and rejecting corrupt answers
    async fn exchange_checked(&mut self, frame: &[u8], address: u8) -> Result<RawFrame> {
        let mut echoes = 0;
        loop {
            let response = self.exchange(frame).await?;
            if !response.valid {
                return Err(PumpError::ChecksumMismatch);
            }
            if response.address != address {
                return Err(PumpError::UnexpectedResponse(format!(
                    "answer from address 0x{:02X}, expected 0x{:02X}",
                    response.address, address
                )));
            }
            if response.payload.first() != Some(&ECHO_MARKER) {
                return Ok(response);
            }

            echoes += 1;
            if echoes > self.config.max_retries {
                return Err(PumpError::UnexpectedResponse(
                    "pump keeps answering with diagnostic echoes".to_string(),
                ));
            }
            warn!(
                "Diagnostic echo from pump, re-acknowledging with nr={}",
                self.state.receive_counter
            );
            let ack = build_frame(
                address,
                FrameType::ReceiveReady {
                    receive: self.state.receive_counter,
                }
                .to_u8(),
                &[],
            );
            self.write_frame(&ack).await?;
        }
    }

    /// Write a frame and wait for exactly one answer
    async fn exchange(&mut self, frame: &[u8]) -> Result<RawFrame> {
        self.write_frame(frame).await?;
        self.wait_frame(self.config.response_timeout).await
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        debug!("TX [{}]", hex_dump(frame));
        self.transport.write(frame).await
    }

    async fn wait_frame(&mut self, wait: std::time::Duration) -> Result<RawFrame> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(frame) = self.codec.next_frame()? {
                return Ok(frame);
            }
            match timeout_at(deadline, self.transport.read()).await {
                Ok(Ok(bytes)) => {
                    debug!("RX [{}]", hex_dump(&bytes));
                    self.codec.receive_bytes(&bytes);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(PumpError::Timeout { attempts: 1 }),
            }
        }
    }

    /// Flush both buffers and wait the fixed retry delay
    async fn recover(&mut self) -> Result<()> {
        self.codec.reset();
        self.transport.flush().await?;
        sleep(self.config.retry_delay).await;
        Ok(())
    }
}
