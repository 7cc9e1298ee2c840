use bytes::Bytes;
use futures::future::BoxFuture;
use kube_bridge::agent::Agent;
use kube_bridge::config::{AgentConfig, ProxyConfig};
use kube_bridge::network::hosts::MarkedHostsFile;
use kube_bridge::network::probe::SocketPortProbe;
use kube_bridge::network::routing::{Platform, RoutingRuleInstaller};
use kube_bridge::network::NetworkEnvironment;
use kube_bridge::proxy::BridgeSession;
use kube_bridge::tunnel::probe::PROBE_RESPONSE;
use kube_bridge::tunnel::{StreamHandler, TunnelClient};
use kube_bridge::wire::PortForwardStartInfo;
use kube_bridge::{EndpointInfo, Error, Result, StreamId};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Eq)]
enum Event {
    Connected(StreamId),
    Data(StreamId, Bytes),
    Closed(StreamId),
}

struct ChannelHandler {
    events: mpsc::UnboundedSender<Event>,
    /// Streams whose data the local side refuses
    refuse_data: Mutex<HashSet<StreamId>>,
    refuse_connections: AtomicBool,
}

impl ChannelHandler {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let handler = Self {
            events,
            refuse_data: Mutex::new(HashSet::new()),
            refuse_connections: AtomicBool::new(false),
        };
        (Arc::new(handler), rx)
    }
}

impl StreamHandler for ChannelHandler {
    fn on_connected(&self, stream_id: StreamId) -> BoxFuture<'_, Result<()>> {
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Box::pin(async { Err(Error::Tunnel("local process is down".to_string())) });
        }
        let _ = self.events.send(Event::Connected(stream_id));
        Box::pin(async { Ok(()) })
    }

    fn on_data(&self, stream_id: StreamId, content: Bytes) -> BoxFuture<'_, Result<()>> {
        if self.refuse_data.lock().unwrap().contains(&stream_id) {
            return Box::pin(async { Err(Error::Tunnel("local write failed".to_string())) });
        }
        let _ = self.events.send(Event::Data(stream_id, content));
        Box::pin(async { Ok(()) })
    }

    fn on_closed(&self, stream_id: StreamId) -> BoxFuture<'_, ()> {
        let _ = self.events.send(Event::Closed(stream_id));
        Box::pin(async {})
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a stream event")
        .expect("event channel closed")
}

async fn start_agent() -> (Arc<Agent>, SocketAddr) {
    let agent = Arc::new(Agent::new(AgentConfig {
        bind_address: (Ipv4Addr::LOCALHOST, 0).into(),
        ..Default::default()
    }));
    let listener = agent.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = agent.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (agent, addr)
}

/// Echoes each read back to the peer.
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Accepts connections and never reads from them.
async fn stalled_server() -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// Wait until the agent closes its end of `socket`.
async fn closed_by_agent(socket: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(WAIT, socket.read(&mut buf))
        .await
        .expect("agent never closed the socket");
    assert_eq!(read.unwrap_or(0), 0);
}

fn reverse_forward(
    client: &TunnelClient,
    port: u16,
    handler: Arc<ChannelHandler>,
    cancel: &CancellationToken,
) -> tokio::task::JoinHandle<Result<()>> {
    let client = client.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let info = PortForwardStartInfo {
            port,
            local_port: None,
            http_probes: Vec::new(),
        };
        client.reverse_port_forward_start(info, handler, cancel).await
    })
}

fn free_port() -> u16 {
    std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Connect once the agent has started listening on `port`.
async fn connect_when_listening(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(socket) = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
            return socket;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on port {}", port);
}

async fn wait_for_connectors(agent: &Agent, expected: usize) {
    tokio::time::timeout(WAIT, async {
        while agent.endpoint().connector_count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connector count never settled");
}

#[tokio::test]
async fn service_stream_delivers_in_order_then_closes_once() {
    let (agent, agent_addr) = start_agent().await;
    let echo = echo_server().await;
    let client = TunnelClient::new(agent_addr.to_string());
    let (handler, mut events) = ChannelHandler::new();

    let id = client
        .service_port_forward_start("127.0.0.1", echo.port(), handler, CancellationToken::new())
        .await
        .unwrap()
        .expect("service should connect");

    for chunk in ["one", "two", "three"] {
        client
            .send_service_port_forward_data("127.0.0.1", echo.port(), id, Bytes::from(chunk))
            .await
            .unwrap();
        assert_eq!(next_event(&mut events).await, Event::Data(id, Bytes::from(chunk)));
    }

    client.stop_service_port_forward("127.0.0.1", echo.port(), id).await;
    assert_eq!(next_event(&mut events).await, Event::Closed(id));
    assert!(tokio::time::timeout(Duration::from_millis(200), events.recv())
        .await
        .map_or(true, |event| event.is_none()));

    // the target's connector can go without touching anything else
    assert_eq!(agent.endpoint().connector_count(), 1);
    client.reset().await;
    assert_eq!(agent.endpoint().connector_count(), 0);
    client.shutdown().await;
}

#[tokio::test]
async fn closing_one_stream_keeps_the_other_alive() {
    let (_agent, agent_addr) = start_agent().await;
    let echo = echo_server().await;
    let client = TunnelClient::new(agent_addr.to_string());
    let (handler_a, mut events_a) = ChannelHandler::new();
    let (handler_b, mut events_b) = ChannelHandler::new();

    let a = client
        .service_port_forward_start("127.0.0.1", echo.port(), handler_a, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    let b = client
        .service_port_forward_start("127.0.0.1", echo.port(), handler_b, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_ne!(a, b);

    client.stop_service_port_forward("127.0.0.1", echo.port(), a).await;
    assert_eq!(next_event(&mut events_a).await, Event::Closed(a));

    client
        .send_service_port_forward_data("127.0.0.1", echo.port(), b, Bytes::from_static(b"still open"))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut events_b).await,
        Event::Data(b, Bytes::from_static(b"still open"))
    );
    client.shutdown().await;
}

#[tokio::test]
async fn a_stalled_service_only_stalls_its_own_stream() {
    let (_agent, agent_addr) = start_agent().await;
    let stalled = stalled_server().await;
    let echo = echo_server().await;
    let client = TunnelClient::new(agent_addr.to_string());
    let (stalled_handler, mut stalled_events) = ChannelHandler::new();
    let (echo_handler, mut echo_events) = ChannelHandler::new();

    let stuck = client
        .service_port_forward_start("127.0.0.1", stalled.port(), stalled_handler, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    let flood = tokio::spawn({
        let client = client.clone();
        async move {
            let chunk = Bytes::from(vec![0u8; 1024 * 1024]);
            loop {
                let sent = client
                    .send_service_port_forward_data("127.0.0.1", stalled.port(), stuck, chunk.clone())
                    .await;
                if let Err(e) = sent {
                    break e;
                }
            }
        }
    });
    // let the socket buffers of the stalled service fill up
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!flood.is_finished());

    assert!(client.ping(2000, 1).await);
    let other = client
        .service_port_forward_start("127.0.0.1", echo.port(), echo_handler, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    client
        .send_service_port_forward_data("127.0.0.1", echo.port(), other, Bytes::from_static(b"still flowing"))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut echo_events).await,
        Event::Data(other, Bytes::from_static(b"still flowing"))
    );

    client.stop_service_port_forward("127.0.0.1", stalled.port(), stuck).await;
    assert_eq!(next_event(&mut stalled_events).await, Event::Closed(stuck));
    let error = tokio::time::timeout(WAIT, flood).await.unwrap().unwrap();
    assert!(matches!(error, Error::Agent(_)));

    tokio::time::timeout(WAIT, client.reset()).await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn a_failing_local_stream_is_stopped_without_its_neighbours() {
    let (_agent, agent_addr) = start_agent().await;
    let client = TunnelClient::new(agent_addr.to_string());
    let (handler, mut events) = ChannelHandler::new();
    let port = free_port();
    let cancel = CancellationToken::new();
    let forward = reverse_forward(&client, port, handler.clone(), &cancel);

    let mut socket_a = connect_when_listening(port).await;
    let Event::Connected(a) = next_event(&mut events).await else {
        panic!("expected stream a to connect");
    };
    let mut socket_b = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    let Event::Connected(b) = next_event(&mut events).await else {
        panic!("expected stream b to connect");
    };

    // data the local side cannot take closes that stream only
    handler.refuse_data.lock().unwrap().insert(a);
    socket_a.write_all(b"boom").await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Closed(a));
    closed_by_agent(&mut socket_a).await;

    // the agent's own Closed for `a` is not delivered a second time
    socket_b.write_all(b"fine").await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Data(b, Bytes::from_static(b"fine")));

    // a connection the local side refuses is stopped at once
    handler.refuse_connections.store(true, Ordering::SeqCst);
    let mut refused = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    assert!(matches!(next_event(&mut events).await, Event::Closed(id) if id != a && id != b));
    closed_by_agent(&mut refused).await;

    socket_b.write_all(b"still fine").await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        Event::Data(b, Bytes::from_static(b"still fine"))
    );

    cancel.cancel();
    tokio::time::timeout(WAIT, forward).await.unwrap().unwrap().unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn cancelling_a_reverse_forward_stops_its_open_streams() {
    let (_agent, agent_addr) = start_agent().await;
    let client = TunnelClient::new(agent_addr.to_string());
    let (handler, mut events) = ChannelHandler::new();
    let port = free_port();
    let cancel = CancellationToken::new();
    let forward = reverse_forward(&client, port, handler, &cancel);

    let mut first = connect_when_listening(port).await;
    assert!(matches!(next_event(&mut events).await, Event::Connected(_)));
    let mut second = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    assert!(matches!(next_event(&mut events).await, Event::Connected(_)));

    cancel.cancel();
    tokio::time::timeout(WAIT, forward).await.unwrap().unwrap().unwrap();

    closed_by_agent(&mut first).await;
    closed_by_agent(&mut second).await;
    client.shutdown().await;
}

#[tokio::test]
async fn unreachable_service_yields_no_stream() {
    let (_agent, agent_addr) = start_agent().await;
    let client = TunnelClient::new(agent_addr.to_string());
    let (handler, _events) = ChannelHandler::new();

    let id = client
        .service_port_forward_start("127.0.0.1", free_port(), handler, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(id, None);
    client.shutdown().await;
}

#[tokio::test]
async fn sending_to_an_unknown_target_is_an_error() {
    let (_agent, agent_addr) = start_agent().await;
    let client = TunnelClient::new(agent_addr.to_string());

    let result = client
        .send_service_port_forward_data("nowhere.svc", 80, 1, Bytes::from_static(b"x"))
        .await;

    assert!(matches!(result, Err(Error::Tunnel(_))));
    client.shutdown().await;
}

#[tokio::test]
async fn http_probes_are_answered_by_the_agent() {
    let (_agent, agent_addr) = start_agent().await;
    let client = TunnelClient::new(agent_addr.to_string());
    let (handler, mut events) = ChannelHandler::new();
    let port = free_port();
    let cancel = CancellationToken::new();

    let forward = tokio::spawn({
        let client = client.clone();
        let cancel = cancel.clone();
        async move {
            client
                .reverse_port_forward_start(
                    PortForwardStartInfo {
                        port,
                        local_port: None,
                        http_probes: vec!["/healthz".to_string()],
                    },
                    handler,
                    cancel,
                )
                .await
        }
    });

    let mut socket = connect_when_listening(port).await;
    let Event::Connected(id) = next_event(&mut events).await else {
        panic!("expected a connected stream first");
    };

    socket
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: pod\r\n\r\n")
        .await
        .unwrap();
    let mut response = vec![0u8; PROBE_RESPONSE.len()];
    socket.read_exact(&mut response).await.unwrap();
    assert_eq!(response, PROBE_RESPONSE);

    socket.write_all(b"hello").await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Data(id, Bytes::from_static(b"hello")));

    cancel.cancel();
    tokio::time::timeout(WAIT, forward).await.unwrap().unwrap().unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn ping_answers_while_the_agent_runs() {
    let (agent, agent_addr) = start_agent().await;
    let client = TunnelClient::new(agent_addr.to_string());

    assert!(client.ping(500, 3).await);

    agent.shutdown().await;
    assert!(!client.ping(50, 2).await);
}

#[tokio::test]
async fn dropping_the_control_connection_releases_targets() {
    let (agent, agent_addr) = start_agent().await;
    let echo = echo_server().await;
    let client = TunnelClient::new(agent_addr.to_string());
    let (handler, _events) = ChannelHandler::new();

    client
        .service_port_forward_start("127.0.0.1", echo.port(), handler, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(agent.endpoint().connector_count(), 1);

    client.shutdown().await;
    wait_for_connectors(&agent, 0).await;
}

/// Installs nothing and leaves ports where the probe put them.
#[derive(Debug)]
struct NoRules;

impl RoutingRuleInstaller for NoRules {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn add_routing_rules<'a>(&'a mut self, _endpoints: &'a [EndpointInfo]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn remove_routing_rules<'a>(&'a mut self, _ips: Option<&'a [IpAddr]>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[tokio::test]
async fn bridge_session_forwards_both_directions_and_cleans_up() {
    let (agent, agent_addr) = start_agent().await;
    let cluster_service = echo_server().await;
    let local_process = echo_server().await;
    let reverse_port = free_port();
    let dir = tempfile::tempdir().unwrap();
    let hosts_path = dir.path().join("hosts");

    let mut endpoint = EndpointInfo::new("localhost", &[cluster_service.port()]);
    endpoint.local_ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let mut config = ProxyConfig {
        agent_address: agent_addr,
        endpoints: vec![endpoint],
        reverse_forwards: vec![PortForwardStartInfo {
            port: reverse_port,
            local_port: Some(local_process.port()),
            http_probes: Vec::new(),
        }],
        ..Default::default()
    };
    config.network.add_routing_rules = false;
    config.ping.interval_ms = 100;
    config.ping.retries = 20;

    let network =
        NetworkEnvironment::with_parts(&config.network, Box::new(NoRules), Arc::new(SocketPortProbe)).unwrap();
    let mut session = BridgeSession::with_network(config, network, Arc::new(MarkedHostsFile::new(&hosts_path)));
    session.start().await.unwrap();
    assert!(std::fs::read_to_string(&hosts_path)
        .unwrap()
        .contains("127.0.0.1 localhost # kube-bridge"));

    // local -> cluster
    let mut outbound = TcpStream::connect(session.listeners()[0]).await.unwrap();
    outbound.write_all(b"to the cluster").await.unwrap();
    let mut buf = [0u8; 14];
    tokio::time::timeout(WAIT, outbound.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"to the cluster");

    // cluster -> local
    let mut inbound = connect_when_listening(reverse_port).await;
    inbound.write_all(b"to the laptop").await.unwrap();
    let mut buf = [0u8; 13];
    tokio::time::timeout(WAIT, inbound.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"to the laptop");

    session.stop().await.unwrap();
    assert!(!std::fs::read_to_string(&hosts_path).unwrap().contains("kube-bridge"));
    wait_for_connectors(&agent, 0).await;
}
