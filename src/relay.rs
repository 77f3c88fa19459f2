// src/relay.rs
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::SetupError;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const LISTEN_BACKLOG: i32 = 1024;

/// Which side of a relayed connection finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// How a relayed connection ended. A failed copy does not report how many
/// bytes it moved before the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed { finished: Direction, bytes: u64 },
    Failed { finished: Direction, error: io::ErrorKind },
}

/// Running accept loop. Dropping the handle leaves the loop running.
pub struct RelayHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    /// Waits for the accept loop to end, either on its own or after `abort`.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                log::error!("Accept loop panicked: {}", e);
            }
        }
    }
}

struct Target {
    host: String,
    port: u16,
}

impl Target {
    async fn dial(&self) -> io::Result<TcpStream> {
        match timeout(DIAL_TIMEOUT, TcpStream::connect((self.host.as_str(), self.port))).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", DIAL_TIMEOUT),
            )),
        }
    }
}

pub struct ConnectionRelay {
    target: Arc<Target>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRelay {
    pub fn new(target_host: &str, target_port: u16) -> Self {
        Self {
            target: Arc::new(Target {
                host: target_host.to_string(),
                port: target_port,
            }),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Listens on every address at `local_port`, IPv6 included when the
    /// host supports a dual-stack socket.
    pub async fn start(&self, local_port: u16) -> Result<RelayHandle, SetupError> {
        self.listen(&[
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, local_port)),
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port)),
        ])
        .await
    }

    pub async fn start_on(&self, bind_addr: SocketAddr) -> Result<RelayHandle, SetupError> {
        self.listen(&[bind_addr]).await
    }

    /// Binds the first address that works out of `candidates`.
    async fn listen(&self, candidates: &[SocketAddr]) -> Result<RelayHandle, SetupError> {
        let target = &self.target;
        match tokio::net::lookup_host((target.host.as_str(), target.port)).await {
            Ok(addrs) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                log::info!("Target {} resolves to {:?}", target.host, addrs);
            }
            Err(e) => {
                log::warn!("DNS lookup for {} failed: {}", target.host, e);
                log::warn!("Continuing, connections may fail until the name resolves");
            }
        }

        let mut port = 0;
        let mut bound = Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no address to listen on",
        ));
        for addr in candidates {
            port = addr.port();
            bound = bind_listener(*addr);
            match &bound {
                Ok(_) => break,
                Err(e) => log::debug!("Cannot listen on {}: {}", addr, e),
            }
        }
        let listener = bound.map_err(|source| SetupError::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| SetupError::Bind { port, source })?;

        log::info!(
            "Relay listening on {}, forwarding to {}:{}",
            local_addr,
            target.host,
            target.port
        );

        let task = tokio::spawn(accept_loop(
            listener,
            self.target.clone(),
            self.next_id.clone(),
        ));

        Ok(RelayHandle { local_addr, task })
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

async fn accept_loop(listener: TcpListener, target: Arc<Target>, next_id: Arc<AtomicU64>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let conn_id = next_id.fetch_add(1, Ordering::Relaxed);
                log::debug!("New connection {} from {}", conn_id, addr);

                let target = target.clone();
                tokio::spawn(async move {
                    handle(stream, &target, conn_id).await;
                });
            }
            Err(e) => {
                log::error!("Accept error, relay stopped: {}", e);
                break;
            }
        }
    }
}

/// Dials the target for one accepted client and relays until either side is
/// done. Failures stay local to this connection.
async fn handle(client: TcpStream, target: &Target, conn_id: u64) {
    log::debug!("Connection {}: dialing {}:{}", conn_id, target.host, target.port);

    let server = match target.dial().await {
        Ok(server) => server,
        Err(e) => {
            log::warn!(
                "Connection {}: failed to reach {}:{}: {}",
                conn_id,
                target.host,
                target.port,
                e
            );
            return;
        }
    };

    match RelayConnection::new(client, server).run(conn_id).await {
        RelayOutcome::Completed { finished, bytes } => {
            log::debug!("Connection {} closed: {:?} done after {} bytes", conn_id, finished, bytes)
        }
        RelayOutcome::Failed { finished, error } => {
            log::debug!("Connection {} closed: {:?} failed ({:?})", conn_id, finished, error)
        }
    }
}

/// Both sockets of one relayed connection, owned by the task serving it.
pub struct RelayConnection {
    client: TcpStream,
    server: TcpStream,
}

impl RelayConnection {
    pub fn new(client: TcpStream, server: TcpStream) -> Self {
        for stream in [&client, &server] {
            if let Err(e) = stream.set_nodelay(true) {
                log::debug!("Failed to set TCP_NODELAY: {}", e);
            }
        }
        Self { client, server }
    }

    /// Copies in both directions until one of them reaches EOF or fails,
    /// then closes both sockets. The other copy is dropped mid-flight.
    pub async fn run(mut self, conn_id: u64) -> RelayOutcome {
        let (mut client_rd, mut client_wr) = self.client.split();
        let (mut server_rd, mut server_wr) = self.server.split();

        let upstream = tokio::io::copy(&mut client_rd, &mut server_wr);
        let downstream = tokio::io::copy(&mut server_rd, &mut client_wr);

        let (finished, result) = tokio::select! {
            res = upstream => (Direction::ClientToServer, res),
            res = downstream => (Direction::ServerToClient, res),
        };

        match result {
            Ok(bytes) => RelayOutcome::Completed { finished, bytes },
            Err(e) => {
                log::debug!("Connection {} interrupted: {}", conn_id, e);
                RelayOutcome::Failed {
                    finished,
                    error: e.kind(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    async fn start_relay(target: SocketAddr) -> RelayHandle {
        ConnectionRelay::new(&target.ip().to_string(), target.port())
            .start_on("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_relay_echo() {
        let echo = echo_server().await;
        let relay = start_relay(echo).await;

        let client = TcpStream::connect(relay.local_addr()).await.unwrap();
        let (mut rd, mut wr) = client.into_split();

        let data = payload(16 * 1024);
        let to_send = data.clone();
        let writer = tokio::spawn(async move {
            wr.write_all(&to_send).await.unwrap();
            wr
        });

        let mut echoed = vec![0u8; data.len()];
        rd.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, data);

        drop(writer.await.unwrap());
        relay.abort();
    }

    #[tokio::test]
    async fn test_relay_server_to_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"220 ready\r\n").await.unwrap();
            let mut got = [0u8; 5];
            stream.read_exact(&mut got).await.unwrap();
            got
        });

        let relay = start_relay(target).await;
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();

        let mut banner = [0u8; 11];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"220 ready\r\n");

        client.write_all(b"HELO\n").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"HELO\n");
        relay.abort();
    }

    #[tokio::test]
    async fn test_dial_failure_closes_client_only() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = unused.local_addr().unwrap();
        drop(unused);

        let relay = start_relay(dead).await;

        for _ in 0..2 {
            let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
            let mut buf = [0u8; 1];
            let n = client.read(&mut buf).await.unwrap_or(0);
            assert_eq!(n, 0);
        }

        assert!(!relay.is_finished());
        relay.abort();
    }

    #[tokio::test]
    async fn test_concurrent_connections_are_independent() {
        let echo = echo_server().await;
        let relay = start_relay(echo).await;
        let addr = relay.local_addr();

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            tasks.push(tokio::spawn(async move {
                let mut client = TcpStream::connect(addr).await.unwrap();
                let msg = vec![i; 256];
                client.write_all(&msg).await.unwrap();
                let mut back = vec![0u8; 256];
                client.read_exact(&mut back).await.unwrap();
                back == msg
            }));
        }
        for t in tasks {
            assert!(t.await.unwrap());
        }
        relay.abort();
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let near = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (far, _) = listener.accept().await.unwrap();
        (near, far)
    }

    #[tokio::test]
    async fn test_outcome_reports_bytes_of_finished_direction() {
        let (mut client, relay_client) = socket_pair().await;
        let (relay_server, mut server) = socket_pair().await;

        let relayed = tokio::spawn(RelayConnection::new(relay_client, relay_server).run(1));

        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();

        let mut got = [0u8; 5];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");

        assert_eq!(
            relayed.await.unwrap(),
            RelayOutcome::Completed {
                finished: Direction::ClientToServer,
                bytes: 5
            }
        );
    }

    #[tokio::test]
    async fn test_start_accepts_ipv4_and_ipv6() {
        let echo = echo_server().await;
        let relay = ConnectionRelay::new(&echo.ip().to_string(), echo.port())
            .start(0)
            .await
            .unwrap();
        let port = relay.local_addr().port();

        let mut targets = vec![SocketAddr::from((Ipv4Addr::LOCALHOST, port))];
        let loopback_v6 = std::net::TcpListener::bind((Ipv6Addr::LOCALHOST, 0)).is_ok();
        if relay.local_addr().is_ipv6() && loopback_v6 {
            targets.push(SocketAddr::from((Ipv6Addr::LOCALHOST, port)));
        }
        for addr in targets {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"ping").await.unwrap();
            let mut back = [0u8; 4];
            client.read_exact(&mut back).await.unwrap();
            assert_eq!(&back, b"ping", "via {}", addr);
        }
        relay.abort();
    }

    #[tokio::test]
    async fn test_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let err = ConnectionRelay::new("127.0.0.1", 9)
            .start_on(addr)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SetupError::Bind { port, .. } if port == addr.port()));
    }

    #[tokio::test]
    async fn test_start_survives_dns_failure() {
        let relay = ConnectionRelay::new("does-not-exist.invalid", 80)
            .start_on("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(!relay.is_finished());
        relay.abort();
        relay.join().await;
    }

    #[tokio::test]
    async fn test_connection_ends_when_one_side_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let relay = start_relay(target).await;

        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(server);

        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        relay.abort();
    }
}
