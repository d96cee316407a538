use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::server::connection::{Connection, Shared};
use crate::server::transport::{load_tls_config, split_plain, split_tls};
use crate::session::SessionCodec;
use may::coroutine::{self, JoinHandle};
use may::net::{TcpListener, TcpStream};
use rustls::ServerConfig;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The engine: HTTP and HTTPS listeners in front of a [`Dispatcher`].
pub struct EngineServer {
    config: EngineConfig,
    dispatcher: Arc<Dispatcher>,
}

/// Handle to a running server
///
/// Reports the bound ports (useful with port `0`) and stops the acceptors.
pub struct ServerHandle {
    hostname: String,
    http_addr: Option<SocketAddr>,
    https_addr: Option<SocketAddr>,
    acceptors: Vec<JoinHandle<()>>,
    dispatcher: Arc<Dispatcher>,
}

impl EngineServer {
    pub fn new(config: EngineConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self { config, dispatcher }
    }

    /// Bind the configured listeners and start accepting.
    ///
    /// # Errors
    ///
    /// Invalid configuration, unreadable TLS material, a port that cannot be
    /// bound or an acceptor coroutine that cannot be spawned.
    pub fn start(self) -> Result<ServerHandle, EngineError> {
        self.config.validate()?;
        let tls = match (&self.config.https_port, &self.config.tls) {
            (Some(_), Some(tls)) => Some(load_tls_config(tls)?),
            _ => None,
        };
        let http_port = self.config.http_port;
        let https_port = self.config.https_port;
        let bind_address = self.config.bind_address.clone();
        let hostname = self.config.hostname.clone();
        let stack_size = self.config.stack_size;

        let shared = Arc::new(Shared {
            dispatcher: Arc::clone(&self.dispatcher),
            sessions: SessionCodec::new(self.config.cookies.clone()),
            config: self.config,
        });

        let mut acceptors = Vec::new();
        let mut http_addr = None;
        let mut https_addr = None;
        if let Some(port) = http_port {
            let listener = bind(&bind_address, port)?;
            let addr = local_addr(&listener, &bind_address)?;
            acceptors.push(spawn_acceptor(listener, Arc::clone(&shared), None, stack_size)?);
            info!(addr = %addr, "HTTP listener started");
            http_addr = Some(addr);
        }
        if let (Some(port), Some(tls)) = (https_port, tls) {
            let listener = bind(&bind_address, port)?;
            let addr = local_addr(&listener, &bind_address)?;
            acceptors.push(spawn_acceptor(listener, Arc::clone(&shared), Some(tls), stack_size)?);
            info!(addr = %addr, "HTTPS listener started");
            https_addr = Some(addr);
        }

        Ok(ServerHandle {
            hostname,
            http_addr,
            https_addr,
            acceptors,
            dispatcher: self.dispatcher,
        })
    }
}

fn bind(host: &str, port: u16) -> Result<TcpListener, EngineError> {
    let addr = format!("{host}:{port}");
    let resolved = addr
        .to_socket_addrs()
        .and_then(|mut addrs| {
            addrs
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address"))
        })
        .map_err(|source| EngineError::Bind {
            addr: addr.clone(),
            source,
        })?;
    TcpListener::bind(resolved).map_err(|source| EngineError::Bind { addr, source })
}

fn local_addr(listener: &TcpListener, host: &str) -> Result<SocketAddr, EngineError> {
    listener.local_addr().map_err(|source| EngineError::Bind {
        addr: host.to_string(),
        source,
    })
}

fn spawn_acceptor(
    listener: TcpListener,
    shared: Arc<Shared>,
    tls: Option<Arc<ServerConfig>>,
    stack_size: usize,
) -> Result<JoinHandle<()>, EngineError> {
    // SAFETY: may::coroutine::Builder::spawn() is marked unsafe by the may runtime.
    // The acceptor owns its listener and shared state; nothing is borrowed.
    let handle = unsafe {
        coroutine::Builder::new()
            .name("acceptor".to_string())
            .stack_size(stack_size)
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => accept(stream, &shared, tls.as_ref(), stack_size),
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
            })
    };
    handle.map_err(EngineError::Spawn)
}

fn accept(stream: TcpStream, shared: &Arc<Shared>, tls: Option<&Arc<ServerConfig>>, stack_size: usize) {
    let remote = stream.peer_addr().ok();
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Cannot set TCP_NODELAY");
    }
    let halves = match tls {
        Some(config) => split_tls(stream, Arc::clone(config)),
        None => split_plain(stream),
    };
    let (reader, writer) = match halves {
        Ok(halves) => halves,
        Err(e) => {
            warn!(remote = ?remote, error = %e, "Cannot set up connection");
            return;
        }
    };
    let connection = Connection::new(Arc::clone(shared), reader, writer, remote, tls.is_some());

    // SAFETY: may::coroutine::Builder::spawn() is marked unsafe by the may runtime.
    // The connection is moved into the coroutine and owned by it alone.
    let spawned = unsafe {
        coroutine::Builder::new()
            .stack_size(stack_size)
            .spawn(move || connection.serve())
    };
    if let Err(e) = spawned {
        error!(remote = ?remote, error = %e, stack_size, "Failed to spawn connection coroutine");
    }
}

impl ServerHandle {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Bound HTTP port, if the HTTP listener is enabled.
    pub fn http_port(&self) -> Option<u16> {
        self.http_addr.map(|a| a.port())
    }

    pub fn https_port(&self) -> Option<u16> {
        self.https_addr.map(|a| a.port())
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Wait until every listener accepts connections.
    ///
    /// # Errors
    ///
    /// `TimedOut` if a listener is not reachable within about 250ms.
    pub fn wait_ready(&self) -> io::Result<()> {
        for addr in self.http_addr.iter().chain(self.https_addr.iter()) {
            let target = reachable(*addr);
            let mut ready = false;
            for _ in 0..50 {
                if std::net::TcpStream::connect(target).is_ok() {
                    ready = true;
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
            if !ready {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "server not ready"));
            }
        }
        Ok(())
    }

    /// Stop accepting and drop every WebSocket channel and listener.
    ///
    /// Connections already being served finish on their own.
    pub fn stop(self) {
        for handle in self.acceptors {
            // SAFETY: may::CoroutineHandle::coroutine().cancel() is marked unsafe by the may runtime.
            // The handle is valid and cancelling the acceptor is the intended shutdown.
            unsafe {
                handle.coroutine().cancel();
            }
            if handle.join().is_err() {
                debug!("Acceptor coroutine ended by cancellation");
            }
        }
        self.dispatcher.stop();
        info!("Server stopped");
    }

    /// Block until the acceptors finish, which only happens after a cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error if an acceptor panicked.
    pub fn join(self) -> thread::Result<()> {
        for handle in self.acceptors {
            handle.join()?;
        }
        Ok(())
    }
}

/// Loopback address for a listener bound to the unspecified address.
fn reachable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port()),
        _ => addr,
    }
}
