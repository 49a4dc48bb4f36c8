use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, trace};

use crate::radius::{
    AccessRequest, Code, Credentials, PacketError, Reply, SharedSecret, HEADER_LEN, MAX_PACKET_LEN,
};
use crate::results::Status;
use crate::retry::RetryPolicy;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// No verified reply arrived within the timeout, after every transmission.
    #[error("no reply after {attempts} transmission(s)")]
    Timeout { attempts: u32 },
    #[error("failed to build request: {0}")]
    Build(PacketError),
    #[error("invalid reply: {0}")]
    Reply(PacketError),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl ExchangeError {
    /// Timeouts map to `NoReply`, everything else to `Failed`.
    pub fn status(&self) -> Status {
        match self {
            ExchangeError::Timeout { .. } => Status::NoReply,
            _ => Status::Failed,
        }
    }

    /// Building the same request again fails the same way.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExchangeError::Build(_))
    }
}

/// One authenticated request/response exchange per call.
pub trait ProtocolClient: Send {
    fn name(&self) -> &'static str;

    fn exchange<'a>(
        &'a mut self,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<Reply, ExchangeError>>;
}

/// Builds one client per worker so workers never share transport state.
pub trait ClientFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn connect(&self, worker: usize) -> BoxFuture<'_, Result<Box<dyn ProtocolClient>, ExchangeError>>;
}

/// Terminal result of an exchange wrapped in a retry policy.
#[derive(Debug)]
pub struct RetriedExchange {
    pub result: Result<Reply, ExchangeError>,
    pub retries: u32,
}

impl RetriedExchange {
    pub fn status(&self) -> Status {
        match &self.result {
            Ok(_) => Status::Succeeded,
            Err(e) => e.status(),
        }
    }
}

/// Run one exchange, retrying failed attempts as `policy` allows.
pub async fn exchange_with_retry(
    client: &mut dyn ProtocolClient,
    credentials: &Credentials,
    policy: &RetryPolicy,
) -> RetriedExchange {
    let mut retries = 0;
    loop {
        match client.exchange(credentials).await {
            Ok(reply) => {
                return RetriedExchange {
                    result: Ok(reply),
                    retries,
                }
            }
            Err(e) if policy.should_retry(&e, retries) => {
                debug!(retry = retries + 1, error = %e, "Retrying exchange");
                sleep(policy.backoff()).await;
                retries += 1;
            }
            Err(e) => {
                return RetriedExchange {
                    result: Err(e),
                    retries,
                }
            }
        }
    }
}

/// Transport parameters shared by every UDP client of a run.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// `host:port` of the RADIUS server
    pub server: String,
    /// Wait per transmission
    pub timeout: Duration,
    /// Retransmissions of the same datagram before reporting a timeout
    pub retries: u32,
    pub nas_identifier: Option<String>,
}

/// RADIUS client over a connected UDP socket.
pub struct UdpRadiusClient {
    socket: UdpSocket,
    settings: Arc<TransportSettings>,
    secret: Arc<SharedSecret>,
    next_identifier: u8,
    buf: Vec<u8>,
}

impl UdpRadiusClient {
    pub async fn connect(
        settings: Arc<TransportSettings>,
        secret: Arc<SharedSecret>,
    ) -> Result<Self, ExchangeError> {
        let server = tokio::net::lookup_host(settings.server.as_str())
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{} did not resolve to an address", settings.server),
                )
            })?;

        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;

        Ok(Self {
            socket,
            settings,
            secret,
            next_identifier: rand::random(),
            buf: vec![0u8; MAX_PACKET_LEN],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn next_request(&mut self, credentials: &Credentials) -> Result<AccessRequest, PacketError> {
        let identifier = self.next_identifier;
        self.next_identifier = self.next_identifier.wrapping_add(1);
        let authenticator: [u8; 16] = rand::random();
        AccessRequest::build(
            identifier,
            authenticator,
            credentials,
            self.settings.nas_identifier.as_deref(),
            &self.secret,
        )
    }

    async fn send_and_wait(&mut self, request: &AccessRequest) -> Result<Reply, ExchangeError> {
        let attempts = self.settings.retries + 1;
        for attempt in 1..=attempts {
            self.socket.send(request.as_bytes()).await?;
            let deadline = Instant::now() + self.settings.timeout;
            let wait = await_reply(&self.socket, &mut self.buf, request, &self.secret);
            match timeout_at(deadline, wait).await {
                Ok(result) => return result,
                Err(_) => trace!(
                    identifier = request.identifier(),
                    attempt,
                    "No reply before timeout"
                ),
            }
        }
        Err(ExchangeError::Timeout { attempts })
    }
}

async fn await_reply(
    socket: &UdpSocket,
    buf: &mut [u8],
    request: &AccessRequest,
    secret: &SharedSecret,
) -> Result<Reply, ExchangeError> {
    loop {
        let len = socket.recv(buf).await?;
        match request
            .verify_reply(&buf[..len], secret)
            .map_err(ExchangeError::Reply)?
        {
            Some(reply) => return Ok(reply),
            None => trace!(
                expected = request.identifier(),
                got = buf[1],
                "Ignoring reply for another identifier"
            ),
        }
    }
}

impl ProtocolClient for UdpRadiusClient {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn exchange<'a>(
        &'a mut self,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<Reply, ExchangeError>> {
        Box::pin(async move {
            let request = self.next_request(credentials).map_err(ExchangeError::Build)?;
            self.send_and_wait(&request).await
        })
    }
}

pub struct UdpClientFactory {
    settings: Arc<TransportSettings>,
    secret: Arc<SharedSecret>,
}

impl UdpClientFactory {
    pub fn new(settings: TransportSettings, secret: Arc<SharedSecret>) -> Self {
        Self {
            settings: Arc::new(settings),
            secret,
        }
    }
}

impl ClientFactory for UdpClientFactory {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn connect(&self, worker: usize) -> BoxFuture<'_, Result<Box<dyn ProtocolClient>, ExchangeError>> {
        Box::pin(async move {
            let client = UdpRadiusClient::connect(self.settings.clone(), self.secret.clone()).await?;
            trace!(worker, local = ?client.local_addr().ok(), "UDP client bound");
            Ok(Box::new(client) as Box<dyn ProtocolClient>)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    Reply,
    Timeout,
    Error,
}

/// Offline client: sleeps for a fixed delay, then plays its script
/// (falling back to `fallback` once the script is exhausted).
pub struct MockClient {
    delay: Duration,
    script: VecDeque<MockOutcome>,
    fallback: MockOutcome,
}

impl MockClient {
    pub fn scripted(delay: Duration, script: impl IntoIterator<Item = MockOutcome>) -> Self {
        Self {
            delay,
            script: script.into_iter().collect(),
            fallback: MockOutcome::Reply,
        }
    }

    pub fn always(delay: Duration, outcome: MockOutcome) -> Self {
        Self {
            delay,
            script: VecDeque::new(),
            fallback: outcome,
        }
    }
}

impl ProtocolClient for MockClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn exchange<'a>(
        &'a mut self,
        _credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<Reply, ExchangeError>> {
        Box::pin(async move {
            sleep(self.delay).await;
            match self.script.pop_front().unwrap_or(self.fallback) {
                MockOutcome::Reply => Ok(Reply {
                    code: Code::AccessAccept,
                    identifier: 0,
                    length: HEADER_LEN,
                }),
                MockOutcome::Timeout => Err(ExchangeError::Timeout { attempts: 1 }),
                MockOutcome::Error => Err(ExchangeError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "mock transport failure",
                ))),
            }
        })
    }
}

/// Hands every worker a [`MockClient`] with the same delay and script.
#[derive(Debug, Clone)]
pub struct MockClientFactory {
    delay: Duration,
    script: Vec<MockOutcome>,
    fallback: MockOutcome,
    refuse_connect: bool,
}

impl MockClientFactory {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            script: Vec::new(),
            fallback: MockOutcome::Reply,
            refuse_connect: false,
        }
    }

    pub fn with_script(mut self, script: Vec<MockOutcome>) -> Self {
        self.script = script;
        self
    }

    pub fn with_fallback(mut self, outcome: MockOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Make every `connect` fail, as if the socket could not be bound.
    pub fn refusing_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }
}

impl ClientFactory for MockClientFactory {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn connect(&self, _worker: usize) -> BoxFuture<'_, Result<Box<dyn ProtocolClient>, ExchangeError>> {
        Box::pin(async move {
            if self.refuse_connect {
                return Err(ExchangeError::Io(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "mock connect refused",
                )));
            }
            let mut client = MockClient::scripted(self.delay, self.script.iter().copied());
            client.fallback = self.fallback;
            Ok(Box::new(client) as Box<dyn ProtocolClient>)
        })
    }
}
