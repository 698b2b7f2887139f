use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{mpsc as std_mpsc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

use snapkv::config::MAX_FRAME_SIZE;
use snapkv::server::serve;
use snapkv::snapshot::{JsonSnapshot, Snapshot, SnapshotError};
use snapkv::store::Store;

const GREETING: &[u8] = b"+Welcome to snapkv\r\n";
const UNKNOWN: &[u8] = b"-Unknown command or invalid arguments\r\n";

async fn start(store: Store) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(serve(listener, store, MAX_FRAME_SIZE));

    addr
}

async fn connect(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    expect(&mut stream, GREETING).await;
    stream
}

async fn expect(stream: &mut TcpStream, expected: &[u8]) {
    let mut buf = vec![0u8; expected.len()];

    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for a reply")
        .unwrap();

    assert_eq!(
        String::from_utf8_lossy(&buf),
        String::from_utf8_lossy(expected)
    );
}

async fn send(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_all(bytes).await.unwrap();
}

#[tokio::test]
async fn test_greeting_on_connect() {
    let addr = start(Store::new()).await;

    connect(addr).await;
}

#[tokio::test]
async fn test_set_and_get() {
    let addr = start(Store::new()).await;
    let mut stream = connect(addr).await;

    send(&mut stream, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\nvalue\r\n").await;
    expect(&mut stream, b"+OK\r\n").await;

    send(&mut stream, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await;
    expect(&mut stream, b"$5\r\nvalue\r\n").await;
}

#[tokio::test]
async fn test_get_missing_key() {
    let addr = start(Store::new()).await;
    let mut stream = connect(addr).await;

    send(&mut stream, b"*2\r\n$3\r\nGET\r\n$1\r\nz\r\n").await;
    expect(&mut stream, b"$-1\r\n").await;
}

#[tokio::test]
async fn test_del_counts_present_keys() {
    let addr = start(Store::new()).await;
    let mut stream = connect(addr).await;

    send(&mut stream, b"SET a 1\r\nSET c 3\r\n").await;
    expect(&mut stream, b"+OK\r\n+OK\r\n").await;

    send(&mut stream, b"DEL a b c\r\n").await;
    expect(&mut stream, b":2\r\n").await;

    send(&mut stream, b"GET a\r\nEXISTS c\r\nDEL a\r\n").await;
    expect(&mut stream, b"$-1\r\n:0\r\n:0\r\n").await;
}

#[tokio::test]
async fn test_binary_safe_value_with_embedded_crlf() {
    let addr = start(Store::new()).await;
    let mut stream = connect(addr).await;

    send(&mut stream, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$4\r\na\r\nb\r\n").await;
    expect(&mut stream, b"+OK\r\n").await;

    send(&mut stream, b"GET k\r\n").await;
    expect(&mut stream, b"$4\r\na\r\nb\r\n").await;
}

#[tokio::test]
async fn test_command_delivered_byte_by_byte_runs_once() {
    let addr = start(Store::new()).await;
    let mut stream = connect(addr).await;

    for byte in b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n" {
        send(&mut stream, &[*byte]).await;
        stream.flush().await.unwrap();
        sleep(Duration::from_millis(2)).await;
    }

    // Any duplicate dispatch would put a second +OK ahead of the EXISTS reply.
    send(&mut stream, b"EXISTS k\r\n").await;
    expect(&mut stream, b"+OK\r\n:1\r\n").await;
}

#[tokio::test]
async fn test_pipelined_commands_in_one_write() {
    let addr = start(Store::new()).await;
    let mut stream = connect(addr).await;

    send(
        &mut stream,
        b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\nGET a\r\n*2\r\n$6\r\nEXISTS\r\n$1\r\na\r\n",
    )
    .await;

    expect(&mut stream, b"+OK\r\n$1\r\n1\r\n:1\r\n").await;
}

#[tokio::test]
async fn test_malformed_frame_does_not_desynchronize() {
    let addr = start(Store::new()).await;
    let mut stream = connect(addr).await;

    send(&mut stream, b"*abc\r\n*2\r\n$3\r\nGET\r\n$1\r\nz\r\n").await;

    expect(&mut stream, UNKNOWN).await;
    expect(&mut stream, b"$-1\r\n").await;
}

#[tokio::test]
async fn test_malformed_element_payload_is_never_executed() {
    let addr = start(Store::new()).await;
    let mut stream = connect(addr).await;

    send(&mut stream, b"SET victim 1\r\n").await;
    expect(&mut stream, b"+OK\r\n").await;

    // The first argument is one byte longer than declared, and the last one reads as a command.
    send(
        &mut stream,
        b"*3\r\n$3\r\nSET\r\n$1\r\nkk\r\n$10\r\nDEL victim\r\nEXISTS victim\r\n",
    )
    .await;

    expect(&mut stream, UNKNOWN).await;
    expect(&mut stream, b":1\r\n").await;
}

#[tokio::test]
async fn test_command_errors_keep_connection_open() {
    let addr = start(Store::new()).await;
    let mut stream = connect(addr).await;

    send(&mut stream, b"PING\r\n").await;
    expect(&mut stream, UNKNOWN).await;

    send(&mut stream, b"get\r\n").await;
    expect(&mut stream, UNKNOWN).await;

    send(&mut stream, b"*3\r\n$3\r\nSET\r\n$0\r\n\r\n$1\r\nv\r\n").await;
    expect(&mut stream, b"-Key cannot be empty\r\n").await;

    send(&mut stream, b"*0\r\n").await;
    expect(&mut stream, UNKNOWN).await;

    send(&mut stream, b"sEt k v\r\n").await;
    expect(&mut stream, b"+OK\r\n").await;
}

#[tokio::test]
async fn test_dropped_client_does_not_affect_others() {
    let addr = start(Store::new()).await;

    let mut leaving = connect(addr).await;
    send(&mut leaving, b"*3\r\n$3\r\nSET\r\n$1\r\nk").await;
    drop(leaving);

    let mut stream = connect(addr).await;
    send(&mut stream, b"EXISTS k\r\n").await;
    expect(&mut stream, b":0\r\n").await;
}

#[tokio::test]
async fn test_restart_durability() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data-store.json");

    {
        let addr = start(Store::open(JsonSnapshot::new(&path))).await;
        let mut stream = connect(addr).await;

        send(&mut stream, b"SET a 1\r\n").await;
        expect(&mut stream, b"+OK\r\n").await;
    }

    // The reply is only sent after the snapshot was written.
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, r#"{"a":"1"}"#);

    let addr = start(Store::open(JsonSnapshot::new(&path))).await;
    let mut stream = connect(addr).await;

    send(&mut stream, b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n").await;
    expect(&mut stream, b"$1\r\n1\r\n").await;
}

#[tokio::test]
async fn test_corrupt_snapshot_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data-store.json");
    std::fs::write(&path, "{ definitely not json").unwrap();

    let addr = start(Store::open(JsonSnapshot::new(&path))).await;
    let mut stream = connect(addr).await;

    send(&mut stream, b"GET a\r\n").await;
    expect(&mut stream, b"$-1\r\n").await;

    send(&mut stream, b"SET a 1\r\n").await;
    expect(&mut stream, b"+OK\r\n").await;
    assert_eq!(std::fs::read_to_string(&path).unwrap(), r#"{"a":"1"}"#);
}

struct FailingSnapshot;

impl Snapshot for FailingSnapshot {
    fn load(&self) -> Result<Option<HashMap<String, Bytes>>, SnapshotError> {
        Ok(None)
    }

    fn save(&self, _entries: &HashMap<String, Bytes>) -> Result<(), SnapshotError> {
        Err(std::io::Error::other("disk full").into())
    }
}

#[tokio::test]
async fn test_persist_failure_still_acknowledges() {
    let addr = start(Store::open(FailingSnapshot)).await;
    let mut stream = connect(addr).await;

    send(&mut stream, b"SET a 1\r\nGET a\r\n").await;
    expect(&mut stream, b"+OK\r\n$1\r\n1\r\n").await;
}

/// Blocks every save until the test releases it.
struct GatedSnapshot {
    entered: mpsc::UnboundedSender<()>,
    release: Mutex<std_mpsc::Receiver<()>>,
}

impl Snapshot for GatedSnapshot {
    fn load(&self) -> Result<Option<HashMap<String, Bytes>>, SnapshotError> {
        Ok(None)
    }

    fn save(&self, _entries: &HashMap<String, Bytes>) -> Result<(), SnapshotError> {
        let _ = self.entered.send(());
        // Returns once the test sends a release or drops the sender.
        let _ = self.release.lock().unwrap().recv();
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocked_persist_does_not_corrupt_other_connections() {
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = std_mpsc::channel();
    let store = Store::open(GatedSnapshot {
        entered: entered_tx,
        release: Mutex::new(release_rx),
    });
    let addr = start(store).await;

    let mut writer = connect(addr).await;
    let mut other = connect(addr).await;

    send(&mut writer, b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n").await;
    timeout(Duration::from_secs(5), entered_rx.recv())
        .await
        .expect("persist never started")
        .unwrap();

    // While the first persist is stuck, stream two commands byte by byte on another connection.
    for byte in b"*3\r\n$3\r\nSET\r\n$1\r\nb\r\n$1\r\n2\r\n*2\r\n$3\r\nGET\r\n$1\r\na\r\n" {
        send(&mut other, &[*byte]).await;
        sleep(Duration::from_millis(1)).await;
    }

    drop(release_tx);

    expect(&mut writer, b"+OK\r\n").await;
    expect(&mut other, b"+OK\r\n$1\r\n1\r\n").await;

    send(&mut writer, b"GET b\r\n").await;
    expect(&mut writer, b"$1\r\n2\r\n").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_share_the_store() {
    let addr = start(Store::new()).await;

    let mut handles = vec![];
    for i in 0..16 {
        handles.push(tokio::spawn(async move {
            let mut stream = connect(addr).await;
            let cmd = format!("SET key-{} value-{}\r\n", i, i);
            send(&mut stream, cmd.as_bytes()).await;
            expect(&mut stream, b"+OK\r\n").await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut stream = connect(addr).await;
    for i in 0..16 {
        let cmd = format!("GET key-{}\r\n", i);
        let value = format!("value-{}", i);
        send(&mut stream, cmd.as_bytes()).await;
        expect(
            &mut stream,
            format!("${}\r\n{}\r\n", value.len(), value).as_bytes(),
        )
        .await;
    }
}
