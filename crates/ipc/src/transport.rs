//! Local endpoints and the duplex streams connected over them

use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use workhive_errors::{ContextError, Error};

/// Boxed read half of a duplex stream
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a duplex stream
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const UNIX_SCHEME: &str = "unix://";
const TCP_SCHEME: &str = "tcp://";

/// Address a worker dials to reach its parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    /// Parse a `unix://<path>` or `tcp://<host>:<port>` URI
    ///
    /// # Errors
    ///
    /// Returns `ContextError::InvalidEndpoint` for unknown schemes or
    /// unparseable addresses.
    pub fn parse(uri: &str) -> Result<Self, ContextError> {
        let invalid = || ContextError::InvalidEndpoint {
            uri: uri.to_string(),
        };

        if let Some(path) = uri.strip_prefix(UNIX_SCHEME) {
            return Self::parse_unix(path).ok_or_else(invalid);
        }

        if let Some(addr) = uri.strip_prefix(TCP_SCHEME) {
            return addr.parse().map(Self::Tcp).map_err(|_| invalid());
        }

        Err(invalid())
    }

    #[cfg(unix)]
    fn parse_unix(path: &str) -> Option<Self> {
        (!path.is_empty()).then(|| Self::Unix(PathBuf::from(path)))
    }

    #[cfg(not(unix))]
    fn parse_unix(_path: &str) -> Option<Self> {
        None
    }

    /// Render the endpoint as a URI accepted by [`Endpoint::parse`]
    #[must_use]
    pub fn uri(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "{UNIX_SCHEME}{}", path.display()),
            Self::Tcp(addr) => write!(f, "{TCP_SCHEME}{addr}"),
        }
    }
}

/// Listening socket owned by the hub's accept loop
pub(crate) enum Listener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Bind a fresh listener: a randomly named socket in the temp directory
    /// on Unix, an ephemeral loopback port elsewhere.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn bind() -> Result<(Self, Endpoint), Error> {
        #[cfg(unix)]
        {
            let mut suffix = [0u8; 10];
            rand::rng().fill_bytes(&mut suffix);
            let path =
                std::env::temp_dir().join(format!("workhive-ipc-{}.sock", hex::encode(suffix)));
            let listener =
                UnixListener::bind(&path).map_err(|e| Error::io_with_path(&e, &path))?;
            Ok((Self::Unix(listener), Endpoint::Unix(path)))
        }
        #[cfg(not(unix))]
        {
            Self::bind_tcp()
        }
    }

    /// Bind to `127.0.0.1:0` and resolve the port the OS picked
    #[cfg_attr(unix, allow(dead_code))]
    pub(crate) fn bind_tcp() -> Result<(Self, Endpoint), Error> {
        let std_listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        std_listener.set_nonblocking(true)?;
        let addr = std_listener.local_addr()?;
        let listener = TcpListener::from_std(std_listener)?;
        Ok((Self::Tcp(listener), Endpoint::Tcp(addr)))
    }

    pub(crate) async fn accept(&self) -> std::io::Result<(BoxedReader, BoxedWriter)> {
        match self {
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
        }
    }
}

/// Dial an endpoint and split the stream into boxed halves
///
/// # Errors
///
/// Returns an I/O error if the endpoint refuses the connection.
pub async fn connect(endpoint: &Endpoint) -> Result<(BoxedReader, BoxedWriter), Error> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path)
                .await
                .map_err(|e| Error::io_with_path(&e, path))?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_endpoint() {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:4100").unwrap();
        assert_eq!(endpoint, Endpoint::Tcp("127.0.0.1:4100".parse().unwrap()));
        assert_eq!(endpoint.uri(), "tcp://127.0.0.1:4100");
    }

    #[cfg(unix)]
    #[test]
    fn parses_unix_endpoint() {
        let endpoint = Endpoint::parse("unix:///tmp/workhive-ipc-00.sock").unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Unix(PathBuf::from("/tmp/workhive-ipc-00.sock"))
        );
        assert_eq!(endpoint.uri(), "unix:///tmp/workhive-ipc-00.sock");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(
            Endpoint::parse("http://127.0.0.1:80"),
            Err(ContextError::InvalidEndpoint { .. })
        ));
        assert!(Endpoint::parse("tcp://not-an-address").is_err());
    }

    #[tokio::test]
    async fn tcp_listener_resolves_port() {
        let (listener, endpoint) = Listener::bind_tcp().unwrap();
        let Endpoint::Tcp(addr) = &endpoint else {
            panic!("expected a tcp endpoint");
        };
        assert_ne!(addr.port(), 0);

        let dial = tokio::spawn(async move { connect(&endpoint).await.map(|_| ()) });
        listener.accept().await.unwrap();
        dial.await.unwrap().unwrap();
    }
}
