//! One-shot address exchange.
//!
//! Wire format: TCP/IPv4 on a fixed port. The connecting side writes a single
//! marker byte and closes; the listening side ignores the payload and takes
//! the peer address from the connection itself.

use crate::clock::Clock;
use crate::config::RetryPolicy;
use crate::error::HarnessError;
use async_trait::async_trait;
use std::fmt::Display;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument, warn};

/// Content is irrelevant, only the connection matters.
pub const MARKER: u8 = 0;

/// Upper bound for a single dial so an unroutable peer can't eat the whole deadline.
const MAX_DIAL_ATTEMPT: Duration = Duration::from_secs(2);

/// Floor for a dial made right at the deadline, so the last attempt can still connect.
const MIN_DIAL_ATTEMPT: Duration = Duration::from_millis(50);

/// Something that can report the address of a running environment.
#[async_trait]
pub trait AddressSource: Send + Sync {
    /// `Ok(None)` or an empty string means "not assigned yet".
    async fn find_address(&self) -> anyhow::Result<Option<String>>;
}

/// Retry `attempt` every `policy.interval` until it succeeds or
/// `policy.timeout` has elapsed on `clock`. An attempt is always made before
/// the deadline is checked, so a zero timeout still tries once.
///
/// Each attempt is handed the time left before the deadline, and the pause
/// between attempts never sleeps past it.
pub async fn retry_until<C, T, E, F, Fut>(
    clock: &C,
    policy: RetryPolicy,
    operation: &'static str,
    mut attempt: F,
) -> Result<T, HarnessError>
where
    C: Clock + ?Sized,
    E: Display,
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let deadline = clock.now() + policy.timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(clock.now());
        match attempt(remaining).await {
            Ok(value) => {
                debug!(operation, attempts, "Retry loop succeeded");
                return Ok(value);
            }
            Err(e) => {
                let now = clock.now();
                if now >= deadline {
                    warn!(operation, attempts, error = %e, "Retry loop gave up");
                    return Err(HarnessError::Timeout {
                        operation,
                        after: policy.timeout,
                        last_error: Some(e.to_string()),
                    });
                }
                debug!(operation, attempts, error = %e, "Attempt failed, retrying");
                clock.sleep(policy.interval.min(deadline - now)).await;
            }
        }
    }
}

/// Listening half of the exchange. Holds the socket until a peer connects.
pub struct AddressListener {
    listener: TcpListener,
    port: u16,
}

impl AddressListener {
    /// Bind `0.0.0.0:port`. Port 0 picks an ephemeral port.
    pub async fn bind(port: u16) -> Result<Self, HarnessError> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HarnessError::Listen { port, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| HarnessError::Listen { port, source })?
            .port();
        Ok(Self { listener, port })
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Accept exactly one connection and return its source address. The
    /// listener and the accepted stream are both dropped before returning.
    pub async fn accept_peer(self, timeout: Duration) -> Result<IpAddr, HarnessError> {
        let accepted = tokio::time::timeout(timeout, self.listener.accept())
            .await
            .map_err(|_| HarnessError::timeout("waiting for address connection", timeout))?;
        let (_stream, peer) = accepted.map_err(HarnessError::Accept)?;
        info!(peer = %peer, "Connected to peer");
        Ok(peer.ip())
    }
}

/// Listen on `port` and return the address of the first host that connects.
#[instrument]
pub async fn learn_peer_address(port: u16, timeout: Duration) -> Result<IpAddr, HarnessError> {
    let listener = AddressListener::bind(port).await?;
    listener.accept_peer(timeout).await
}

/// Tell the listener at `peer:port` our address by connecting to it. The
/// listener may not be up yet, so dial failures are retried per `policy`.
#[instrument(skip(clock))]
pub async fn announce_address<C>(
    clock: &C,
    peer: IpAddr,
    port: u16,
    policy: RetryPolicy,
) -> Result<(), HarnessError>
where
    C: Clock + ?Sized,
{
    let addr = SocketAddr::new(peer, port);

    let mut stream = retry_until(clock, policy, "waiting to send IP", |remaining| async move {
        let dial_timeout = dial_budget(remaining);
        match tokio::time::timeout(dial_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("dial to {} timed out", addr),
            )),
        }
    })
    .await?;

    stream
        .write_all(&[MARKER])
        .await
        .map_err(|source| HarnessError::Write {
            peer: addr.to_string(),
            source,
        })?;

    if let Err(e) = stream.shutdown().await {
        debug!(peer = %addr, error = %e, "Shutdown after marker failed");
    }

    info!(peer = %addr, "Sent our address to peer");
    Ok(())
}

/// Time allowed for one dial given what is left of the overall deadline.
fn dial_budget(remaining: Duration) -> Duration {
    remaining.clamp(MIN_DIAL_ATTEMPT, MAX_DIAL_ATTEMPT)
}

/// Poll `source` until it reports an address, then parse it.
#[instrument(skip(clock, source))]
pub async fn discover_own_address<C, S>(
    clock: &C,
    source: &S,
    policy: RetryPolicy,
) -> Result<IpAddr, HarnessError>
where
    C: Clock + ?Sized,
    S: AddressSource + ?Sized,
{
    let raw = retry_until(clock, policy, "getting IP", move |_| async move {
        match source.find_address().await {
            Ok(Some(addr)) if !addr.trim().is_empty() => Ok(addr),
            Ok(_) => Err("address not assigned yet".to_string()),
            Err(e) => Err(format!("{:#}", e)),
        }
    })
    .await?;

    let ip: IpAddr = raw
        .trim()
        .parse()
        .map_err(|_| HarnessError::InvalidAddress(raw.clone()))?;

    info!(ip = %ip, "Container has address");
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, TokioClock};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    fn policy(timeout_ms: u64, interval_ms: u64) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(timeout_ms),
            interval: Duration::from_millis(interval_ms),
        }
    }

    /// Reports a fixed sequence of answers, then repeats the last one.
    struct ScriptedSource {
        answers: Mutex<Vec<anyhow::Result<Option<String>>>>,
        calls: AtomicU32,
    }

    impl ScriptedSource {
        fn new(mut answers: Vec<anyhow::Result<Option<String>>>) -> Self {
            answers.reverse();
            Self {
                answers: Mutex::new(answers),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AddressSource for ScriptedSource {
        async fn find_address(&self) -> anyhow::Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.pop().unwrap()
            } else {
                match answers.last() {
                    Some(Ok(v)) => Ok(v.clone()),
                    Some(Err(e)) => Err(anyhow::anyhow!("{}", e)),
                    None => Ok(None),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_retry_tolerates_transient_failures() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);

        let value = retry_until(&clock, policy(10_000, 200), "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 5 {
                    Err("connection refused")
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_retry_gives_up_at_deadline() {
        let clock = ManualClock::new();
        let start = clock.now();
        let calls = AtomicU32::new(0);

        let err = retry_until(&clock, policy(1_000, 200), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("connection refused") }
        })
        .await
        .unwrap_err();

        match err {
            HarnessError::Timeout { last_error, .. } => {
                assert_eq!(last_error.as_deref(), Some("connection refused"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        // Attempts at t = 0, 200, ..., 1000.
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(clock.now() - start, Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_retry_never_sleeps_past_deadline() {
        let clock = ManualClock::new();
        let start = clock.now();
        let budgets = Mutex::new(Vec::new());

        let err = retry_until(&clock, policy(1_000, 300), "test", |remaining| {
            budgets.lock().unwrap().push(remaining);
            async { Err::<(), _>("no route to host") }
        })
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        // Attempts at t = 0, 300, 600, 900, then a short 100ms pause to 1000.
        let budgets: Vec<u64> = budgets
            .into_inner()
            .unwrap()
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(budgets, vec![1000, 700, 400, 100, 0]);
        assert_eq!(clock.now() - start, Duration::from_millis(1000));
    }

    #[test]
    fn test_dial_budget_tracks_remaining_time() {
        assert_eq!(dial_budget(Duration::from_secs(10)), MAX_DIAL_ATTEMPT);
        assert_eq!(dial_budget(Duration::from_millis(300)), Duration::from_millis(300));
        assert_eq!(dial_budget(Duration::ZERO), MIN_DIAL_ATTEMPT);
    }

    #[tokio::test]
    async fn test_learn_and_announce_roundtrip() {
        let listener = AddressListener::bind(0).await.unwrap();
        let port = listener.local_port();
        assert_ne!(port, 0);

        let learner = tokio::spawn(listener.accept_peer(Duration::from_secs(5)));

        announce_address(&TokioClock, IpAddr::V4(Ipv4Addr::LOCALHOST), port, policy(5_000, 50))
            .await
            .unwrap();

        let learned = learner.await.unwrap().unwrap();
        assert_eq!(learned, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_announce_writes_single_marker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let reader = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        announce_address(&TokioClock, IpAddr::V4(Ipv4Addr::LOCALHOST), port, policy(2_000, 50))
            .await
            .unwrap();

        assert_eq!(reader.await.unwrap(), vec![MARKER]);
    }

    #[tokio::test]
    async fn test_announce_waits_for_late_listener() {
        // Reserve a port, release it, and bring the listener up later.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            learn_peer_address(port, Duration::from_secs(5)).await
        });

        announce_address(&TokioClock, IpAddr::V4(Ipv4Addr::LOCALHOST), port, policy(5_000, 100))
            .await
            .unwrap();

        assert!(late.await.unwrap().unwrap().is_loopback());
    }

    #[tokio::test]
    async fn test_announce_times_out_without_listener() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let clock = ManualClock::new();

        let err = announce_address(&clock, IpAddr::V4(Ipv4Addr::LOCALHOST), port, policy(1_000, 200))
            .await
            .unwrap_err();

        assert!(err.is_timeout(), "unexpected error: {}", err);
        assert!(err.to_string().contains("waiting to send IP"));
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let listener = AddressListener::bind(0).await.unwrap();
        let err = listener.accept_peer(Duration::from_millis(50)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_listen_error() {
        let first = AddressListener::bind(0).await.unwrap();
        let err = AddressListener::bind(first.local_port()).await.err().unwrap();
        assert!(matches!(err, HarnessError::Listen { .. }));
    }

    #[tokio::test]
    async fn test_discover_polls_until_assigned() {
        let clock = ManualClock::new();
        let source = ScriptedSource::new(vec![
            Ok(None),
            Err(anyhow::anyhow!("container not running")),
            Ok(Some(String::new())),
            Ok(Some("172.17.0.2".to_string())),
        ]);

        let ip = discover_own_address(&clock, &source, policy(10_000, 250)).await.unwrap();

        assert_eq!(ip, "172.17.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_discover_rejects_malformed_address() {
        let clock = ManualClock::new();
        let source = ScriptedSource::new(vec![Ok(Some("not-an-ip".to_string()))]);

        let err = discover_own_address(&clock, &source, policy(10_000, 250)).await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidAddress(ref raw) if raw == "not-an-ip"));
    }

    #[tokio::test]
    async fn test_discover_times_out() {
        let clock = ManualClock::new();
        let source = ScriptedSource::new(vec![Ok(None)]);

        let err = discover_own_address(&clock, &source, policy(1_000, 250)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().starts_with("timed out getting IP"));
    }
}
