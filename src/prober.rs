//! Liveness probers.
//!
//! A [`Prober`] sends reachability probes to a single target and reports every
//! reply or loss as a [`ProbeEvent`]. The production implementation sends ICMP
//! echo requests through a shared `surge_ping` client.

use futures::future::BoxFuture;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use surge_ping::{Client as PingClient, Config as PingConfig, PingIdentifier, PingSequence, ICMP};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const ECHO_PAYLOAD: [u8; 56] = [0u8; 56];

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid target address {0:?}")]
    InvalidTarget(String),
    #[error("icmp socket error: {0}")]
    Socket(#[from] io::Error),
    #[error("failed to resolve {target}: {reason}")]
    Resolve { target: String, reason: String },
    #[error("no ip address found for {0}")]
    NoAddress(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeEvent {
    Reply { latency: Duration },
    Lost { sequence: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

pub trait Prober: Send + 'static {
    /// Runs until `cancel` fires or the event receiver is dropped.
    /// An `Err` means the prober can no longer produce events.
    fn run(
        self: Box<Self>,
        events: mpsc::Sender<ProbeEvent>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<(), ProbeError>>;
}

pub trait ProberFactory: Send + Sync + 'static {
    fn build(&self, target: &str) -> Result<Box<dyn Prober>, ProbeError>;
}

/// Accepts IP literals and syntactically valid host names.
pub fn validate_target(target: &str) -> Result<(), ProbeError> {
    if target.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let invalid = || ProbeError::InvalidTarget(target.to_string());
    let host = target.strip_suffix('.').unwrap_or(target);
    if host.is_empty() || host.len() > 253 {
        return Err(invalid());
    }
    for label in host.split('.') {
        let ok = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !ok {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Shared ICMP client, or why it could not be opened.
pub(crate) type SharedClient = Result<PingClient, SocketFailure>;

#[derive(Debug, Clone)]
pub(crate) struct SocketFailure {
    kind: io::ErrorKind,
    message: String,
}

impl From<&io::Error> for SocketFailure {
    fn from(e: &io::Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl SocketFailure {
    fn to_error(&self) -> ProbeError {
        ProbeError::Socket(io::Error::new(self.kind, self.message.clone()))
    }
}

fn open_client(kind: ICMP, family: &str) -> SharedClient {
    let config = PingConfig::builder().kind(kind).build();
    PingClient::new(&config).map_err(|e| {
        warn!("{} ICMP socket unavailable, {} targets will be invalid: {}", family, family, e);
        SocketFailure::from(&e)
    })
}

fn client_for(v4: &SharedClient, v6: &SharedClient, ip: IpAddr) -> Result<PingClient, ProbeError> {
    let client = match ip {
        IpAddr::V4(_) => v4,
        IpAddr::V6(_) => v6,
    };
    client.clone().map_err(|failure| failure.to_error())
}

pub struct IcmpProberFactory {
    v4: SharedClient,
    v6: SharedClient,
    resolver: Arc<TokioResolver>,
    settings: ProbeSettings,
}

impl IcmpProberFactory {
    /// Opens the shared ICMP sockets. A socket that cannot be opened is
    /// remembered and reported by every prober that would need it.
    pub fn new(settings: ProbeSettings) -> Self {
        Self::with_clients(open_client(ICMP::V4, "IPv4"), open_client(ICMP::V6, "IPv6"), settings)
    }

    pub(crate) fn with_clients(v4: SharedClient, v6: SharedClient, settings: ProbeSettings) -> Self {
        let resolver = match TokioResolver::builder_tokio() {
            Ok(builder) => {
                info!("DNS resolver configured from system settings");
                builder.build()
            }
            Err(e) => {
                warn!("System resolver config unavailable ({}), using Cloudflare 1.1.1.1 / 1.0.0.1", e);
                TokioResolver::builder_with_config(
                    ResolverConfig::cloudflare(),
                    TokioConnectionProvider::default(),
                )
                .build()
            }
        };

        Self {
            v4,
            v6,
            resolver: Arc::new(resolver),
            settings,
        }
    }

    /// True when at least one ICMP socket is usable.
    pub fn has_sockets(&self) -> bool {
        self.v4.is_ok() || self.v6.is_ok()
    }
}

impl ProberFactory for IcmpProberFactory {
    fn build(&self, target: &str) -> Result<Box<dyn Prober>, ProbeError> {
        validate_target(target)?;
        if let Ok(ip) = target.parse::<IpAddr>() {
            client_for(&self.v4, &self.v6, ip)?;
        } else if let (Err(failure), Err(_)) = (&self.v4, &self.v6) {
            return Err(failure.to_error());
        }
        Ok(Box::new(IcmpProber {
            target: target.to_string(),
            v4: self.v4.clone(),
            v6: self.v6.clone(),
            resolver: Arc::clone(&self.resolver),
            settings: self.settings,
        }))
    }
}

pub struct IcmpProber {
    target: String,
    v4: SharedClient,
    v6: SharedClient,
    resolver: Arc<TokioResolver>,
    settings: ProbeSettings,
}

impl IcmpProber {
    async fn resolve(&self) -> Result<IpAddr, ProbeError> {
        if let Ok(ip) = self.target.parse::<IpAddr>() {
            return Ok(ip);
        }
        let lookup = self
            .resolver
            .lookup_ip(self.target.as_str())
            .await
            .map_err(|e| ProbeError::Resolve {
                target: self.target.clone(),
                reason: e.to_string(),
            })?;
        lookup
            .iter()
            .next()
            .ok_or_else(|| ProbeError::NoAddress(self.target.clone()))
    }

    async fn probe_loop(
        self,
        events: mpsc::Sender<ProbeEvent>,
        cancel: CancellationToken,
    ) -> Result<(), ProbeError> {
        let ip = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            ip = self.resolve() => ip?,
        };

        let client = client_for(&self.v4, &self.v6, ip)?;
        let mut pinger = client.pinger(ip, PingIdentifier(rand::random())).await;
        pinger.timeout(self.settings.timeout);
        debug!(addr = %self.target, %ip, "Prober started");

        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sequence: u16 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                reply = pinger.ping(PingSequence(sequence), &ECHO_PAYLOAD) => reply,
            };

            let event = match reply {
                Ok((_, latency)) => ProbeEvent::Reply { latency },
                Err(e) => {
                    trace!(addr = %self.target, seq = sequence, "Echo lost: {}", e);
                    ProbeEvent::Lost { sequence }
                }
            };
            if events.send(event).await.is_err() {
                break;
            }
            sequence = sequence.wrapping_add(1);
        }

        debug!(addr = %self.target, "Prober stopped");
        Ok(())
    }
}

impl Prober for IcmpProber {
    fn run(
        self: Box<Self>,
        events: mpsc::Sender<ProbeEvent>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<(), ProbeError>> {
        Box::pin(self.probe_loop(events, cancel))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Prober driven by the test through a [`ManualHandle`].
    pub struct ManualProber {
        feed: mpsc::UnboundedReceiver<ProbeEvent>,
        fail_with: Option<String>,
    }

    impl Prober for ManualProber {
        fn run(
            mut self: Box<Self>,
            events: mpsc::Sender<ProbeEvent>,
            cancel: CancellationToken,
        ) -> BoxFuture<'static, Result<(), ProbeError>> {
            Box::pin(async move {
                if let Some(target) = self.fail_with.take() {
                    return Err(ProbeError::NoAddress(target));
                }
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(()),
                        event = self.feed.recv() => match event {
                            Some(event) => {
                                if events.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                            None => return Ok(()),
                        },
                    }
                }
            })
        }
    }

    /// ICMP factory whose sockets were refused, as for an unprivileged user.
    pub fn unprivileged_icmp_factory() -> IcmpProberFactory {
        let refused = || -> SharedClient { Err(SocketFailure::from(&io::Error::from(io::ErrorKind::PermissionDenied))) };
        IcmpProberFactory::with_clients(
            refused(),
            refused(),
            ProbeSettings {
                interval: Duration::from_secs(5),
                timeout: Duration::from_millis(3500),
            },
        )
    }

    #[derive(Clone)]
    pub struct ManualHandle(mpsc::UnboundedSender<ProbeEvent>);

    impl ManualHandle {
        pub fn reply(&self) {
            let _ = self.0.send(ProbeEvent::Reply {
                latency: Duration::from_millis(1),
            });
        }

        pub fn lose(&self, sequence: u16) {
            let _ = self.0.send(ProbeEvent::Lost { sequence });
        }
    }

    #[derive(Default)]
    pub struct ManualProberFactory {
        handles: Mutex<HashMap<String, ManualHandle>>,
        reject: Vec<String>,
        crash: Vec<String>,
    }

    impl ManualProberFactory {
        /// Fails to construct probers for `targets`.
        pub fn rejecting(targets: &[&str]) -> Self {
            Self {
                reject: targets.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            }
        }

        /// Builds probers for `targets` that fail as soon as they run.
        pub fn crashing(targets: &[&str]) -> Self {
            Self {
                crash: targets.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            }
        }

        pub fn handle(&self, target: &str) -> ManualHandle {
            self.handles.lock().unwrap()[target].clone()
        }
    }

    impl ProberFactory for ManualProberFactory {
        fn build(&self, target: &str) -> Result<Box<dyn Prober>, ProbeError> {
            if self.reject.iter().any(|t| t == target) {
                return Err(ProbeError::InvalidTarget(target.to_string()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.handles
                .lock()
                .unwrap()
                .insert(target.to_string(), ManualHandle(tx));
            let fail_with = self
                .crash
                .iter()
                .any(|t| t == target)
                .then(|| target.to_string());
            Ok(Box::new(ManualProber { feed: rx, fail_with }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::unprivileged_icmp_factory;
    use super::*;

    #[test]
    fn test_validate_ip_literals() {
        assert!(validate_target("10.0.0.5").is_ok());
        assert!(validate_target("fe80::1").is_ok());
    }

    #[test]
    fn test_validate_hostnames() {
        assert!(validate_target("router.lan").is_ok());
        assert!(validate_target("printer-2.office.example.com.").is_ok());
    }

    #[test]
    fn test_validate_rejects_garbage() {
        for bad in ["", "foo bar", "-lead.example", "a..b", "host/with/slash", "x_y"] {
            assert!(
                matches!(validate_target(bad), Err(ProbeError::InvalidTarget(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_refused_sockets_fail_build_not_construction() {
        let factory = unprivileged_icmp_factory();
        assert!(!factory.has_sockets());

        for target in ["10.0.0.5", "fe80::1", "router.lan"] {
            match factory.build(target) {
                Err(ProbeError::Socket(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
                Err(e) => panic!("{target}: unexpected error {e}"),
                Ok(_) => panic!("{target}: built without a socket"),
            }
        }
        assert!(matches!(factory.build("foo bar"), Err(ProbeError::InvalidTarget(_))));
    }
}
