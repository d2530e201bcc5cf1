use std::net::SocketAddr;

use anyhow::Result;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, error, info, trace};

use crate::{
    config::CatcherConfig,
    error::PingError,
    wire::{self, ECHO_HEADER_LEN, HANDSHAKE_LEN, MAX_PACKET_SIZE},
};

/// Echo side of a session. Serves exactly one Pitcher and then returns.
pub struct Catcher {
    listener: TcpListener,
}

impl Catcher {
    /// Binds the listening socket. Port 0 picks an ephemeral port, see
    /// [Catcher::local_addr].
    pub fn bind(cfg: &CatcherConfig) -> Result<Catcher> {
        let socket =
            common::new_tcp_socket(cfg.iface.as_deref(), cfg.bind, Some(cfg.port))?;
        // Nobody is ever accepted after the first connection.
        socket.listen(1)?;
        let listener = TcpListener::from_std(socket.into())?;
        info!("Catcher started on {}", listener.local_addr()?);
        Ok(Catcher { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts one connection and echoes its probes until the peer closes.
    /// Returns the number of echoed frames.
    pub async fn run(self) -> Result<u64> {
        let (stream, peer) = self.listener.accept().await?;
        // Later connection attempts get refused.
        drop(self.listener);
        info!("Accepted connection from {}", peer);

        let result = serve(stream).await;
        match &result {
            Ok(echoed) => info!("{} closed the connection after {} probes", peer, echoed),
            Err(e) => error!("session with {} failed: {:#}", peer, e),
        }
        result
    }
}

async fn serve(mut stream: TcpStream) -> Result<u64> {
    let frame_size = read_handshake(&mut stream).await?;
    debug!("Ping packets will be {} bytes", frame_size);

    let mut frame = vec![0u8; frame_size];
    let mut echoed = 0;
    loop {
        match stream.read_exact(&mut frame).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(PingError::Transport(e).into()),
        }
        // Stamp before anything else so our own processing stays out of B->A.
        let host_b = wire::now_millis()?;
        let header = wire::stamp_echo(&mut frame, host_b)?;
        trace!(
            "message {}: host A timestamp {}, host B timestamp {}",
            header.id,
            header.host_a,
            host_b
        );

        stream
            .write_all(&frame)
            .await
            .map_err(PingError::Transport)?;
        echoed += 1;
    }
    Ok(echoed)
}

async fn read_handshake(stream: &mut TcpStream) -> Result<usize> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    match stream.read_exact(&mut buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(PingError::HandshakeFailed.into())
        }
        Err(e) => return Err(PingError::Transport(e).into()),
    }

    let size = wire::decode_handshake(&buf)?;
    match usize::try_from(size) {
        Ok(size) if (ECHO_HEADER_LEN..=MAX_PACKET_SIZE).contains(&size) => Ok(size),
        _ => Err(PingError::MalformedHandshake(format!(
            "packet size {} outside {}..={}",
            size, ECHO_HEADER_LEN, MAX_PACKET_SIZE
        ))
        .into()),
    }
}
