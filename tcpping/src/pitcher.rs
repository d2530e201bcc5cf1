use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Result};
use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::PitcherConfig,
    error::PingError,
    logger,
    stats::{Aggregator, MessageCounter, RoundTripRecord, RunSummary},
    wire,
};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(5);
pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);
/// Extra time the tasks get to wind down after the run duration.
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Measuring side of a session.
pub struct Pitcher {
    cfg: PitcherConfig,
    sinks: Vec<mpsc::Sender<RoundTripRecord>>,
}

impl Pitcher {
    pub fn new(cfg: PitcherConfig) -> Self {
        Self {
            cfg,
            sinks: Vec::new(),
        }
    }

    /// Every recorded round trip is also offered to `sink`. A full or closed
    /// sink never slows the probe loop down, the record is dropped instead.
    pub fn with_record_sink(mut self, sink: mpsc::Sender<RoundTripRecord>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Runs one session: connect, handshake, ping for the configured
    /// duration, then drain. Fails early on a transport error, or before
    /// connecting if the config does not validate.
    pub async fn run(mut self) -> Result<RunSummary> {
        self.cfg = self.cfg.validated()?;
        let mut stream = self.connect().await?;
        stream
            .write_all(&wire::encode_handshake(self.cfg.size as i32))
            .await
            .map_err(PingError::Transport)?;
        info!(
            "Pinging {}:{} with {} byte packets, {} per second for {:?}",
            self.cfg.host, self.cfg.port, self.cfg.size, self.cfg.mps, self.cfg.duration
        );

        let result_logger = match self.cfg.file.clone() {
            Some(path) => {
                let (tx, handle) = logger::spawn_result_logger(path, self.cfg.size).await?;
                self.sinks.push(tx);
                Some(handle)
            }
            None => None,
        };

        let counter = Arc::new(MessageCounter::new());
        let aggregator = Arc::new(Aggregator::new(counter.clone()));
        let token = CancellationToken::new();
        let start = Instant::now();

        let emitter = Emitter {
            frame_size: self.cfg.size,
            period: self.cfg.emit_interval(),
            counter,
            aggregator: aggregator.clone(),
            sinks: std::mem::take(&mut self.sinks),
            token: token.clone(),
        };
        let mut tasks: Vec<JoinHandle<Result<()>>> = vec![
            tokio::spawn(emitter.run(stream)),
            tokio::spawn(report(aggregator.clone(), start, token.clone())),
            tokio::spawn(stop(start + self.cfg.duration, token.clone())),
        ];

        let drain_deadline = start + self.cfg.duration + DRAIN_GRACE;
        let drained = tokio::time::timeout_at(drain_deadline, join_all(&mut tasks)).await;
        let outcome = match drained {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("tasks still running {:?} after the run, aborting them", DRAIN_GRACE);
                token.cancel();
                for task in &tasks {
                    task.abort();
                }
                Ok(())
            }
        };

        // Final report, taken once nothing can record anymore.
        let report = aggregator.flush();
        info!("{}", report);

        if let Some(handle) = result_logger {
            // Senders went away with the emitter, so the writer finishes.
            match handle.await? {
                Ok(rows) => debug!("result logger wrote {} rows", rows),
                Err(e) => warn!("result logger failed: {:#}", e),
            }
        }

        let summary = aggregator.summary();
        info!("{}", summary);
        outcome.map(|_| summary)
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = tokio::net::lookup_host((self.cfg.host.as_str(), self.cfg.port))
            .await?
            .next()
            .ok_or_else(|| anyhow!("could not resolve {}", self.cfg.host))?;
        let local: IpAddr = match addr {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = common::new_tcp_socket(self.cfg.iface.as_deref(), local, None)?;

        let socket = tokio::task::spawn_blocking(move || {
            socket.set_nonblocking(false)?;
            socket.connect_timeout(&addr.into(), CONNECT_TIMEOUT)?;
            socket.set_nonblocking(true)?;
            Ok::<_, std::io::Error>(socket)
        })
        .await?
        .map_err(PingError::Transport)?;

        let stream = TcpStream::from_std(socket.into())?;
        info!("Connected to {}", addr);
        Ok(stream)
    }
}

/// Waits for every task and returns the first failure, if any.
async fn join_all(tasks: &mut [JoinHandle<Result<()>>]) -> Result<()> {
    let mut outcome = Ok(());
    for task in tasks.iter_mut() {
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }
    }
    outcome
}

struct Emitter {
    frame_size: usize,
    period: Duration,
    counter: Arc<MessageCounter>,
    aggregator: Arc<Aggregator>,
    sinks: Vec<mpsc::Sender<RoundTripRecord>>,
    token: CancellationToken,
}

impl Emitter {
    /// Sends one probe per period and waits for its echo. Owns the connection
    /// and closes it on return. A fatal error cancels the whole run.
    async fn run(self, stream: TcpStream) -> Result<()> {
        match self.emit(stream).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("stopping after fatal error: {}", e);
                self.token.cancel();
                Err(e.into())
            }
        }
    }

    async fn emit(&self, stream: TcpStream) -> Result<(), PingError> {
        let (reader, mut writer) = stream.into_split();
        let mut echoes = EchoReader::new(reader, self.frame_size);
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let id = self.counter.next_id();
            let probe = wire::encode_probe(id, wire::now_millis()?, self.frame_size);
            let written = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                written = writer.write_all(&probe) => written,
            };
            written.map_err(PingError::Transport)?;
            trace!("sent message {}", id);

            let deadline = Instant::now() + ECHO_TIMEOUT;
            let echo = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                echo = echoes.await_echo(id, deadline) => echo,
            };
            match echo {
                Ok(record) => self.record(record),
                Err(e) if e.is_recoverable() => info!("{}", e),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn record(&self, record: RoundTripRecord) {
        debug!(
            "message {}: host A {}, host B {}, received {}",
            record.message_id, record.host_a, record.host_b, record.rtt_timestamp
        );
        self.aggregator.record(record);
        for sink in &self.sinks {
            if let Err(e) = sink.try_send(record) {
                warn!("dropping record of message {}: {}", record.message_id, e);
            }
        }
    }
}

/// Flushes the aggregator once per second until cancelled.
async fn report(
    aggregator: Arc<Aggregator>,
    start: Instant,
    token: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval_at(start + REPORT_INTERVAL, REPORT_INTERVAL);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let report = aggregator.flush();
                info!("{}", report);
            }
        }
    }
    Ok(())
}

/// Ends the run at `deadline`, or earlier if something else cancelled it.
async fn stop(deadline: Instant, token: CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep_until(deadline) => debug!("run duration reached"),
        _ = token.cancelled() => warn!("run stopped early"),
    }
    token.cancel();
    Ok(())
}

enum FrameRead {
    Complete(BytesMut),
    TimedOut { partial: usize },
    Closed { partial: usize },
}

/// Reads echo frames off the stream. Bytes of a frame that did not complete
/// before a deadline stay buffered and are finished by the next read.
pub struct EchoReader<R> {
    inner: R,
    frame_size: usize,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> EchoReader<R> {
    pub fn new(inner: R, frame_size: usize) -> Self {
        Self {
            inner,
            frame_size,
            buf: BytesMut::with_capacity(frame_size),
        }
    }

    /// Waits until `deadline` for the echo of message `id`. Echoes of older
    /// messages that arrive in the meantime are discarded.
    pub async fn await_echo(
        &mut self,
        id: i64,
        deadline: Instant,
    ) -> Result<RoundTripRecord, PingError> {
        loop {
            let frame = match self.read_frame(deadline).await? {
                FrameRead::Complete(frame) => frame,
                FrameRead::TimedOut { partial: 0 } => {
                    return Err(PingError::Timeout { id })
                }
                FrameRead::TimedOut { partial } => {
                    return Err(PingError::SizeMismatch {
                        id,
                        expected: self.frame_size,
                        actual: partial,
                    })
                }
                FrameRead::Closed { partial } => {
                    if partial > 0 {
                        warn!(
                            "message {}: received {} bytes, expected {}",
                            id, partial, self.frame_size
                        );
                    }
                    return Err(PingError::ConnectionClosed);
                }
            };
            let rtt_timestamp = wire::now_millis()?;
            let header = wire::decode_echo_header(&frame)?;

            if header.id < id {
                debug!("discarding late echo of message {}", header.id);
                continue;
            }
            if header.id > id {
                return Err(PingError::UnexpectedEcho {
                    expected: id,
                    actual: header.id,
                });
            }
            return Ok(RoundTripRecord {
                message_id: header.id,
                host_a: header.host_a,
                host_b: header.host_b,
                rtt_timestamp,
            });
        }
    }

    async fn read_frame(&mut self, deadline: Instant) -> Result<FrameRead, PingError> {
        while self.buf.len() < self.frame_size {
            self.buf.reserve(self.frame_size - self.buf.len());
            let read =
                tokio::time::timeout_at(deadline, self.inner.read_buf(&mut self.buf)).await;
            match read {
                Err(_elapsed) => {
                    return Ok(FrameRead::TimedOut {
                        partial: self.buf.len(),
                    })
                }
                Ok(Ok(0)) => {
                    return Ok(FrameRead::Closed {
                        partial: self.buf.len(),
                    })
                }
                Ok(Ok(n)) => trace!("read {} bytes", n),
                Ok(Err(e)) => return Err(PingError::Transport(e)),
            }
        }
        Ok(FrameRead::Complete(self.buf.split_to(self.frame_size)))
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;
    use crate::{
        catcher::Catcher,
        config::CatcherConfig,
        wire::encode_echo,
    };

    const FRAME: usize = 100;

    fn soon(millis: u64) -> Instant {
        Instant::now() + Duration::from_millis(millis)
    }

    #[tokio::test]
    async fn reads_full_frame() {
        let (mut peer, local) = duplex(1024);
        let mut reader = EchoReader::new(local, FRAME);
        peer.write_all(&encode_echo(1, 100, 103, FRAME)).await.unwrap();

        let record = reader.await_echo(1, soon(1000)).await.unwrap();
        assert_eq!(record.message_id, 1);
        assert_eq!(record.host_a, 100);
        assert_eq!(record.host_b, 103);
        assert!(record.rtt_timestamp >= record.host_b);
    }

    #[tokio::test]
    async fn reassembles_fragmented_frame() {
        let (mut peer, local) = duplex(1024);
        let mut reader = EchoReader::new(local, FRAME);
        let echo = encode_echo(7, 100, 101, FRAME);

        peer.write_all(&echo[..10]).await.unwrap();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            peer.write_all(&echo[10..60]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            peer.write_all(&echo[60..]).await.unwrap();
            peer
        });

        let record = reader.await_echo(7, soon(2000)).await.unwrap();
        assert_eq!(record.message_id, 7);
        assert_eq!(record.host_b, 101);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn no_bytes_is_timeout() {
        let (_peer, local) = duplex(1024);
        let mut reader = EchoReader::new(local, FRAME);

        let err = reader.await_echo(3, soon(100)).await.unwrap_err();
        assert!(matches!(err, PingError::Timeout { id: 3 }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn short_read_is_size_mismatch_then_discarded() {
        let (mut peer, local) = duplex(1024);
        let mut reader = EchoReader::new(local, FRAME);
        let late = encode_echo(1, 100, 101, FRAME);

        peer.write_all(&late[..40]).await.unwrap();
        let err = reader.await_echo(1, soon(100)).await.unwrap_err();
        assert!(matches!(
            err,
            PingError::SizeMismatch {
                id: 1,
                expected: FRAME,
                actual: 40
            }
        ));

        // The rest of the late echo arrives together with the next one.
        peer.write_all(&late[40..]).await.unwrap();
        peer.write_all(&encode_echo(2, 200, 201, FRAME)).await.unwrap();
        let record = reader.await_echo(2, soon(1000)).await.unwrap();
        assert_eq!(record.message_id, 2);
        assert_eq!(record.host_a, 200);
    }

    #[tokio::test]
    async fn echo_from_the_future_is_rejected() {
        let (mut peer, local) = duplex(1024);
        let mut reader = EchoReader::new(local, FRAME);
        peer.write_all(&encode_echo(9, 1, 2, FRAME)).await.unwrap();

        let err = reader.await_echo(4, soon(1000)).await.unwrap_err();
        assert!(matches!(
            err,
            PingError::UnexpectedEcho {
                expected: 4,
                actual: 9
            }
        ));
    }

    #[tokio::test]
    async fn peer_close_is_fatal() {
        let (peer, local) = duplex(1024);
        let mut reader = EchoReader::new(local, FRAME);
        drop(peer);

        let err = reader.await_echo(1, soon(1000)).await.unwrap_err();
        assert!(matches!(err, PingError::ConnectionClosed));
        assert!(!err.is_recoverable());
    }

    fn pitcher_config(addr: SocketAddr, secs: u64) -> PitcherConfig {
        PitcherConfig {
            mps: 5,
            size: FRAME,
            duration: Duration::from_secs(secs),
            ..PitcherConfig::new(addr.ip().to_string(), addr.port())
        }
    }

    #[tokio::test]
    async fn run_against_catcher() {
        let catcher = Catcher::bind(&CatcherConfig {
            bind: "127.0.0.1".parse().unwrap(),
            port: 0,
            iface: None,
        })
        .unwrap();
        let addr = catcher.local_addr().unwrap();
        let catcher = tokio::spawn(catcher.run());

        let summary = Pitcher::new(pitcher_config(addr, 2)).run().await.unwrap();
        assert!(summary.sent >= 5, "sent {}", summary.sent);
        // Nothing goes out after the stop, one tick may race it.
        assert!(summary.sent <= 2 * 5 + 1, "sent {}", summary.sent);
        assert!(summary.answered >= 1);
        assert!(summary.answered as i64 <= summary.sent);

        // The last probe may have been cut off by the stop.
        let echoed = catcher.await.unwrap().unwrap();
        assert!(echoed <= summary.sent as u64);
        assert!(echoed >= summary.answered as u64);
    }

    #[tokio::test]
    async fn undersized_frames_fall_back_to_default() {
        let catcher = Catcher::bind(&CatcherConfig {
            bind: "127.0.0.1".parse().unwrap(),
            port: 0,
            iface: None,
        })
        .unwrap();
        let addr = catcher.local_addr().unwrap();
        let catcher = tokio::spawn(catcher.run());

        let cfg = PitcherConfig {
            size: 20,
            ..pitcher_config(addr, 1)
        };
        let summary = Pitcher::new(cfg).run().await.unwrap();
        assert!(summary.answered >= 1);
        catcher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn invalid_config_fails_before_connecting() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cfg = PitcherConfig {
            mps: 0,
            ..pitcher_config(addr, 1)
        };
        let err = Pitcher::new(cfg).run().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PingError>(),
            Some(PingError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn emitter_failure_cancels_run() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });
        let stream = TcpStream::connect(addr).await.unwrap();

        let counter = Arc::new(MessageCounter::new());
        let token = CancellationToken::new();
        let emitter = Emitter {
            frame_size: FRAME,
            period: Duration::from_millis(10),
            counter: counter.clone(),
            aggregator: Arc::new(Aggregator::new(counter)),
            sinks: Vec::new(),
            token: token.clone(),
        };

        assert!(emitter.run(stream).await.is_err());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn unreachable_catcher_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(Pitcher::new(pitcher_config(addr, 1)).run().await.is_err());
    }

    #[tokio::test]
    async fn catcher_hanging_up_stops_run_early() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut handshake = [0u8; 4];
            stream.read_exact(&mut handshake).await.unwrap();
        });

        let started = Instant::now();
        let err = Pitcher::new(pitcher_config(addr, 20)).run().await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            err.downcast_ref::<PingError>(),
            Some(PingError::ConnectionClosed) | Some(PingError::Transport(_))
        ));
    }
}
