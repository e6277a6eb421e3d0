//! End-to-end tests against a real listener
//!
//! Each test binds its own server on an ephemeral loopback port and drives
//! it with the russh client.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use russh_keys::key::{KeyPair, PublicKey};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use keel_core::ServerConfig;
use keel_passwd::{AuthContext, HashCost, HashPolicy, LocalStore};
use keel_server::auth::PasswordAuthenticator;
use keel_server::server::SshServer;
use keel_server::session::SftpServerProcess;
use keel_server::tunnel::ConfiguredPolicy;
use keel_server::ServerState;

const CHEAP: HashCost = HashCost {
    memory_kib: 8,
    iterations: 1,
    parallelism: 1,
};

struct TrustingClient;

#[async_trait]
impl client::Handler for TrustingClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn test_config(dir: &Path) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.bind_address = "127.0.0.1:0".to_string();
    config.host_key_path = dir.join("host_key");
    config.shell = Some("/bin/sh".into());
    config.sftp_server = "/bin/cat".into();
    config.auth.password_file = dir.join("passwd");
    config.auth.hash.memory_kib = CHEAP.memory_kib;
    config.auth.hash.iterations = CHEAP.iterations;
    config.auth.hash.parallelism = CHEAP.parallelism;
    config
}

async fn start(configure: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    configure(&mut config);

    LocalStore::new(&config.auth.password_file, HashPolicy::new(CHEAP).unwrap())
        .set_password("alice", b"secret")
        .unwrap();

    let authenticator =
        PasswordAuthenticator::from_config(&config.auth, AuthContext::system()).unwrap();
    let file_transfer = Arc::new(SftpServerProcess::new(&config.sftp_server));
    let policy = ConfiguredPolicy::new(&config.forwarding).into_shared();
    let state = Arc::new(ServerState::new(config, authenticator, file_transfer, policy));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();

    let server = SshServer::new(
        KeyPair::generate_ed25519().unwrap(),
        Arc::clone(&state),
        cancel.clone(),
    );
    tokio::spawn(async move { server.serve(listener).await });

    TestServer {
        addr,
        state,
        cancel,
        _dir: dir,
    }
}

async fn connect(addr: SocketAddr) -> client::Handle<TrustingClient> {
    let config = Arc::new(client::Config::default());
    client::connect(config, addr, TrustingClient).await.unwrap()
}

async fn login(addr: SocketAddr) -> client::Handle<TrustingClient> {
    let mut session = connect(addr).await;
    assert!(session.authenticate_password("alice", "secret").await.unwrap());
    session
}

/// Collect channel output until the server closes it
async fn drain(channel: &mut russh::Channel<client::Msg>) -> Vec<u8> {
    let mut output = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    output
}

/// Replies and output seen on a session channel
#[derive(Default)]
struct Seen {
    replies: Vec<bool>,
    output: Vec<u8>,
    eofs: usize,
}

impl Seen {
    fn output_contains(&self, needle: &str) -> bool {
        String::from_utf8_lossy(&self.output).contains(needle)
    }
}

/// Record channel messages until `done` holds or the channel closes
async fn watch(
    channel: &mut russh::Channel<client::Msg>,
    seen: &mut Seen,
    done: impl Fn(&Seen) -> bool,
) {
    while !done(seen) {
        match channel.wait().await {
            Some(ChannelMsg::Success) => seen.replies.push(true),
            Some(ChannelMsg::Failure) => seen.replies.push(false),
            Some(ChannelMsg::Data { data }) => seen.output.extend_from_slice(&data),
            Some(ChannelMsg::Eof) => seen.eofs += 1,
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
}

#[tokio::test]
async fn test_exec_over_password_login() {
    let server = start(|_| {}).await;
    let session = login(server.addr).await;

    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, "echo hello").await.unwrap();

    let output = timeout(Duration::from_secs(10), drain(&mut channel))
        .await
        .unwrap();
    assert_eq!(output, b"hello\n");

    let stats = server.state.stats.snapshot();
    assert_eq!(stats.auth_successes, 1);
    assert_eq!(stats.channels_opened, 1);
}

#[tokio::test]
async fn test_wrong_password_rejected() {
    let server = start(|_| {}).await;
    let mut session = connect(server.addr).await;

    assert!(!session.authenticate_password("alice", "nope").await.unwrap());
    assert!(!session.authenticate_password("mallory", "secret").await.unwrap());
    assert_eq!(server.state.stats.snapshot().auth_failures, 2);
}

#[tokio::test]
async fn test_sftp_subsystem_reaches_service() {
    let server = start(|_| {}).await;
    let session = login(server.addr).await;

    let mut channel = session.channel_open_session().await.unwrap();
    channel.request_subsystem(true, "sftp").await.unwrap();
    channel.data(&b"abc"[..]).await.unwrap();
    channel.eof().await.unwrap();

    // the configured server program is `cat`
    let output = timeout(Duration::from_secs(10), drain(&mut channel))
        .await
        .unwrap();
    assert_eq!(output, b"abc");
}

#[tokio::test]
async fn test_unreachable_tunnel_rejected() {
    let server = start(|_| {}).await;
    let session = login(server.addr).await;

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);

    let result = session
        .channel_open_direct_tcpip("127.0.0.1", port as u32, "127.0.0.1", 40000)
        .await;
    assert!(result.is_err());
    assert_eq!(server.state.stats.snapshot().channels_opened, 0);
}

#[tokio::test]
async fn test_forbidden_tunnel_rejected() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = target.local_addr().unwrap().port();

    let server = start(|config| {
        config.forwarding.allowed_hosts = Some(vec!["db.internal".to_string()]);
    })
    .await;
    let session = login(server.addr).await;

    let result = session
        .channel_open_direct_tcpip("127.0.0.1", port as u32, "127.0.0.1", 40000)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_tunnel_reaches_destination() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = target.local_addr().unwrap().port();
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let (mut socket, _) = target.accept().await.unwrap();
        socket.write_all(b"banner").await.unwrap();
    });

    let server = start(|_| {}).await;
    let session = login(server.addr).await;

    let mut channel = session
        .channel_open_direct_tcpip("127.0.0.1", port as u32, "127.0.0.1", 40000)
        .await
        .unwrap();

    let output = timeout(Duration::from_secs(10), drain(&mut channel))
        .await
        .unwrap();
    assert_eq!(output, b"banner");
}

#[tokio::test]
async fn test_channel_limit_enforced() {
    let server = start(|config| config.max_channels_per_connection = Some(1)).await;
    let session = login(server.addr).await;

    let _first = session.channel_open_session().await.unwrap();
    assert!(session.channel_open_session().await.is_err());
}

#[tokio::test]
async fn test_shell_requests_each_get_one_reply() {
    let server = start(|_| {}).await;
    let session = login(server.addr).await;
    let mut channel = session.channel_open_session().await.unwrap();
    let mut seen = Seen::default();

    // back to back: the shell request arrives before pty-req is answered
    channel
        .request_pty(true, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    channel.request_shell(true).await.unwrap();
    timeout(Duration::from_secs(10), watch(&mut channel, &mut seen, |s| s.replies.len() >= 2))
        .await
        .unwrap();
    assert_eq!(seen.replies, vec![true, true]);

    channel.window_change(120, 40, 0, 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    channel.data(&b"stty size\n"[..]).await.unwrap();
    timeout(
        Duration::from_secs(10),
        watch(&mut channel, &mut seen, |s| s.output_contains("40 120")),
    )
    .await
    .unwrap();
    assert_eq!(seen.replies.len(), 2, "window-change must not be answered");

    channel.exec(true, "true").await.unwrap();
    timeout(Duration::from_secs(10), watch(&mut channel, &mut seen, |s| s.replies.len() >= 3))
        .await
        .unwrap();
    assert_eq!(seen.replies, vec![true, true, false]);

    channel.data(&b"exit\n"[..]).await.unwrap();
    timeout(Duration::from_secs(10), watch(&mut channel, &mut seen, |_| false))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_exec_sends_one_eof_before_close() {
    let server = start(|_| {}).await;
    let session = login(server.addr).await;

    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, "echo hello").await.unwrap();

    let mut seen = Seen::default();
    timeout(Duration::from_secs(10), watch(&mut channel, &mut seen, |_| false))
        .await
        .unwrap();
    assert_eq!(seen.replies, vec![true]);
    assert_eq!(seen.output, b"hello\n");
    assert_eq!(seen.eofs, 1);
}

#[tokio::test]
async fn test_non_utf8_exec_declined() {
    let server = start(|_| {}).await;
    let session = login(server.addr).await;

    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, b"echo \xff".to_vec()).await.unwrap();

    let mut seen = Seen::default();
    timeout(Duration::from_secs(10), watch(&mut channel, &mut seen, |s| !s.replies.is_empty()))
        .await
        .unwrap();
    assert_eq!(seen.replies, vec![false]);

    // the channel is still unclaimed
    channel.exec(true, "echo ok").await.unwrap();
    timeout(Duration::from_secs(10), watch(&mut channel, &mut seen, |_| false))
        .await
        .unwrap();
    assert_eq!(seen.replies, vec![false, true]);
    assert_eq!(seen.output, b"ok\n");
}
