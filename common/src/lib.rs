use std::{
    fmt,
    marker::PhantomData,
    net::{IpAddr, SocketAddr},
    path::Path,
};

use anyhow::Result;
pub use logging_macro::Logging;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncWriteExt;

/// Create a non-blocking TCP socket bound to `bind_address`.
///
/// `bind_port` of `None` requests an ephemeral port. When `bind_interface` is
/// given the socket is additionally pinned to that device.
pub fn new_tcp_socket(
    bind_interface: Option<&str>,
    bind_address: IpAddr,
    bind_port: Option<u16>,
) -> Result<Socket> {
    let domain = match bind_address {
        IpAddr::V4(..) => Domain::IPV4,
        IpAddr::V6(..) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    socket.set_reuse_address(true)?;

    let socket = match bind_interface {
        Some(bi) => bind_to_device(socket, bi)?,
        None => socket,
    };

    let socket_address = SocketAddr::new(bind_address, bind_port.unwrap_or(0));
    socket.bind(&socket_address.into())?;

    Ok(socket)
}

pub fn bind_to_device(
    socket: Socket,
    bind_interface: &str,
) -> Result<Socket, std::io::Error> {
    // Socket2 bind_device does not have nice error types, so we have to handle
    // the libc errors. In case, we get an error when binding, map it into a
    // more friendly std::io::Error
    if let Err(err) = socket.bind_device(Some(bind_interface.as_bytes())) {
        return if matches!(err.raw_os_error(), Some(libc::ENODEV)) {
            let error_msg = format!(
                "error binding to device (`{}`): {}",
                bind_interface, err
            );
            Err(std::io::Error::new(std::io::ErrorKind::Other, error_msg))
        } else {
            let error_msg = format!("unexpected error binding device: {}", err);
            Err(std::io::Error::new(std::io::ErrorKind::Other, error_msg))
        };
    }

    Ok(socket)
}

/// A record that can be written as one CSV row. The row itself comes from the
/// `Display` impl, usually generated by `#[derive(Logging)]`.
pub trait Logging {
    fn header(&self) -> String;
}

/// Appends `Logging` records to a CSV file, writing the header before the
/// first row.
pub struct Logger<T> {
    file: tokio::fs::File,
    header_written: bool,
    rows: usize,
    kind: PhantomData<T>,
}

impl<T: Logging + fmt::Display> Logger<T> {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Self {
            file,
            header_written: false,
            rows: 0,
            kind: PhantomData,
        })
    }

    pub async fn log(&mut self, record: &T) -> Result<()> {
        if !self.header_written {
            self.file.write_all(record.header().as_bytes()).await?;
            self.header_written = true;
        }
        self.file.write_all(record.to_string().as_bytes()).await?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}

/// Running statistics using Welford's online algorithm.
#[derive(Debug, Clone)]
pub struct Statistics {
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    samples: usize,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mean: {:.2} variance: {:.2} standard deviation: {:.2} min: {:.2} \
             max: {:.2} samples: {}",
            self.mean(),
            self.variance(),
            self.standard_deviation(),
            self.min(),
            self.max(),
            self.samples()
        )
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            mean: f64::NAN,
            m2: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            samples: 0,
        }
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }
    /// Population variance.
    pub fn variance(&self) -> f64 {
        self.m2 / (self.samples as f64)
    }
    pub fn standard_deviation(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn update(&mut self, value: f64) {
        self.samples += 1;
        if self.samples == 1 {
            self.mean = value;
            self.m2 = 0.0;
            self.min = value;
            self.max = value;
        } else {
            let old_mean = self.mean;
            self.mean = old_mean + (value - old_mean) / self.samples as f64;
            self.m2 += (value - old_mean) * (value - self.mean);
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
    }
}
