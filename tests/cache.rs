//! Engine and end-to-end pipeline tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use acorncache::commands::CommandContext;
use acorncache::events::EventBus;
use acorncache::eviction::EvictionEngine;
use acorncache::expiry::ExpiryEngine;
use acorncache::memory::MemoryAccountant;
use acorncache::protocol::{Frame, FrameReader, FrameType};
use acorncache::server::serve;
use acorncache::store::Store;

// =============================================================================
// Test Harness
// =============================================================================

struct CacheParams {
  ceiling_bytes: u64,
  eviction_threshold: f64,
  eviction_factor: f64,
  strict_expiry: bool,
  sweep_interval: u64,
}

impl Default for CacheParams {
  fn default() -> Self {
    Self {
      ceiling_bytes: 10 * 1_048_576,
      eviction_threshold: 0.9,
      eviction_factor: 0.75,
      strict_expiry: true,
      sweep_interval: 6,
    }
  }
}

/// Wire the full pipeline onto an ephemeral port, the way the daemon does.
async fn start_server(params: CacheParams) -> SocketAddr {
  let accountant = MemoryAccountant::new(params.ceiling_bytes, params.eviction_threshold);
  let store = Arc::new(Store::new(accountant, !params.strict_expiry));

  let (out_tx, out_rx) = mpsc::unbounded_channel();
  let bus = Arc::new(EventBus::new());

  let expiry_feed = store.subscribe_changes();
  let eviction_feed = store.subscribe_changes();
  let trigger = store.take_eviction_trigger().unwrap();
  let (shutdown_tx, _) = broadcast::channel(1);

  let expiry = ExpiryEngine::new(params.sweep_interval, params.strict_expiry);
  tokio::spawn(expiry.run(
    store.clone(),
    bus.clone(),
    expiry_feed,
    shutdown_tx.subscribe(),
  ));

  let eviction = EvictionEngine::new(params.eviction_factor);
  tokio::spawn(eviction.run(
    store.clone(),
    bus.clone(),
    eviction_feed,
    trigger,
    shutdown_tx.subscribe(),
  ));

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let ctx = CommandContext { store, bus };
  let shutdown_rx = shutdown_tx.subscribe();
  tokio::spawn(async move {
    // Keep the shutdown sender alive for the server's lifetime.
    let _shutdown_tx = shutdown_tx;
    serve(listener, ctx, out_tx, out_rx, shutdown_rx).await;
  });

  addr
}

struct TestClient {
  stream: TcpStream,
  frames: FrameReader,
}

impl TestClient {
  async fn connect(addr: SocketAddr) -> Self {
    Self {
      stream: TcpStream::connect(addr).await.unwrap(),
      frames: FrameReader::new(),
    }
  }

  async fn send(&mut self, line: &str) {
    self
      .stream
      .write_all(format!("{}\r\n", line).as_bytes())
      .await
      .unwrap();
  }

  async fn recv(&mut self) -> Frame {
    use tokio::io::AsyncReadExt;

    let mut buf = [0u8; 4096];
    loop {
      if let Some(line) = self.frames.next_frame() {
        return serde_json::from_str(&line).unwrap();
      }
      let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
        .await
        .expect("timed out waiting for a frame")
        .unwrap();
      assert!(n > 0, "connection closed while waiting for a frame");
      self.frames.feed(&buf[..n]);
    }
  }

  async fn roundtrip(&mut self, line: &str) -> Frame {
    self.send(line).await;
    self.recv().await
  }
}

// =============================================================================
// End-to-end Scenarios
// =============================================================================

#[tokio::test]
async fn test_create_read_delete_roundtrip() {
  let addr = start_server(CacheParams::default()).await;
  let mut client = TestClient::connect(addr).await;

  let frame = client.roundtrip("r1 CREATE k1 hello").await;
  assert_eq!(frame.code, 200);
  assert_eq!(frame.message, "Created k1");
  assert_eq!(frame.request_id, "r1");

  let frame = client.roundtrip("r2 READ k1").await;
  assert_eq!(frame.code, 200);
  assert_eq!(frame.value.as_deref(), Some("hello"));

  let frame = client.roundtrip("r3 DELETE k1").await;
  assert_eq!(frame.code, 200);
  assert_eq!(frame.message, "Key Deleted Successfully");

  let frame = client.roundtrip("r4 READ k1").await;
  assert_eq!(frame.code, 404);
  assert_eq!(frame.frame_type, FrameType::Error);
}

#[tokio::test]
async fn test_structured_requests_accepted() {
  let addr = start_server(CacheParams::default()).await;
  let mut client = TestClient::connect(addr).await;

  let frame = client
    .roundtrip(r#"{"id":"j1","command":"CREATE","args":["k","spaced value"]}"#)
    .await;
  assert_eq!(frame.code, 200);

  let frame = client
    .roundtrip(r#"{"id":"j2","command":"read","args":["k"]}"#)
    .await;
  assert_eq!(frame.value.as_deref(), Some("spaced value"));
}

#[tokio::test]
async fn test_memory_rejection_on_the_wire() {
  let addr = start_server(CacheParams {
    ceiling_bytes: 64,
    ..CacheParams::default()
  })
  .await;
  let mut client = TestClient::connect(addr).await;

  let frame = client
    .roundtrip(&format!("r1 CREATE a {}", "a".repeat(15)))
    .await;
  assert_eq!(frame.code, 200);
  let frame = client.roundtrip("r2 MEM").await;
  assert_eq!(frame.value.as_deref(), Some("0.000031"));

  let frame = client
    .roundtrip(&format!("r3 CREATE b {}", "b".repeat(21)))
    .await;
  assert_eq!(frame.code, 500);
  assert_eq!(frame.message, "Memory limit exceeded");

  // Accounting unchanged by the rejection.
  let frame = client.roundtrip("r4 MEM").await;
  assert_eq!(frame.value.as_deref(), Some("0.000031"));
}

#[tokio::test]
async fn test_eviction_purges_least_read() {
  let addr = start_server(CacheParams {
    ceiling_bytes: 120,
    eviction_threshold: 0.8,
    eviction_factor: 0.75,
    ..CacheParams::default()
  })
  .await;
  let mut client = TestClient::connect(addr).await;

  // Five 20-byte entries fill 100 of 120 bytes without tripping the
  // 96-byte threshold check, which observes pre-insert usage.
  for key in ["a", "b", "c", "d", "e"] {
    let frame = client
      .roundtrip(&format!("c-{} CREATE {} 123456789", key, key))
      .await;
    assert_eq!(frame.code, 200);
  }

  // Distinct read counts: e hottest, then d, then c.
  client.roundtrip("r1 READ c").await;
  for id in ["r2", "r3"] {
    client.roundtrip(&format!("{} READ d", id)).await;
  }
  for id in ["r4", "r5", "r6"] {
    client.roundtrip(&format!("{} READ e", id)).await;
  }

  // This create observes 100 >= 96 and fires the eviction signal.
  let frame = client.roundtrip("t CREATE f x").await;
  assert_eq!(frame.code, 200);
  tokio::time::sleep(Duration::from_millis(300)).await;

  // The least-read entries are gone, the hottest survive.
  for key in ["a", "b"] {
    let frame = client.roundtrip(&format!("gone-{} READ {}", key, key)).await;
    assert_eq!(frame.code, 404, "expected {} to be evicted", key);
  }
  for key in ["d", "e"] {
    let frame = client.roundtrip(&format!("kept-{} READ {}", key, key)).await;
    assert_eq!(frame.code, 200, "expected {} to survive", key);
  }
}

#[tokio::test]
async fn test_lazy_ttl_expiry() {
  let addr = start_server(CacheParams {
    strict_expiry: false,
    sweep_interval: 1,
    ..CacheParams::default()
  })
  .await;
  let mut client = TestClient::connect(addr).await;

  let frame = client.roundtrip("r1 ADD k v 1").await;
  assert_eq!(frame.code, 200);

  tokio::time::sleep(Duration::from_millis(2600)).await;

  // The sweep only flagged the entry; this read removes it.
  let frame = client.roundtrip("r2 READ k").await;
  assert_eq!(frame.code, 404);

  let frame = client.roundtrip("r3 MEM").await;
  assert_eq!(frame.value.as_deref(), Some("0.000000"));
}

#[tokio::test]
async fn test_strict_ttl_expiry_publishes_delete() {
  let addr = start_server(CacheParams {
    strict_expiry: true,
    sweep_interval: 1,
    ..CacheParams::default()
  })
  .await;
  let mut subscriber = TestClient::connect(addr).await;
  let mut client = TestClient::connect(addr).await;

  let frame = subscriber.roundtrip("s1 SUB DELETE").await;
  assert_eq!(frame.code, 200);

  client.roundtrip("r1 ADD k v 1").await;
  tokio::time::sleep(Duration::from_millis(2600)).await;

  // No read was needed to trigger removal.
  let frame = client.roundtrip("r2 READ k").await;
  assert_eq!(frame.code, 404);

  let event = subscriber.recv().await;
  assert_eq!(event.frame_type, FrameType::Event);
  assert_eq!(event.message, "delete k");
}

#[tokio::test]
async fn test_subscription_fanout() {
  let addr = start_server(CacheParams::default()).await;
  let mut c1 = TestClient::connect(addr).await;
  let mut c2 = TestClient::connect(addr).await;

  let frame = c1.roundtrip("s1 SUB CREATE").await;
  assert_eq!(frame.message, "Subscribed to CREATE");

  let frame = c2.roundtrip("r1 CREATE z 1").await;
  assert_eq!(frame.code, 200);

  let event = c1.recv().await;
  assert_eq!(event.frame_type, FrameType::Event);
  assert!(event.message.contains('z'));
  assert_eq!(event.value.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_own_mutation_response_precedes_event() {
  let addr = start_server(CacheParams::default()).await;
  let mut client = TestClient::connect(addr).await;

  client.roundtrip("s1 SUB CREATE").await;
  client.send("r1 CREATE y 2").await;

  let first = client.recv().await;
  assert_eq!(first.frame_type, FrameType::Response);
  assert_eq!(first.request_id, "r1");

  let second = client.recv().await;
  assert_eq!(second.frame_type, FrameType::Event);
  assert!(second.message.contains('y'));
}

#[tokio::test]
async fn test_unsubscribe_stops_events() {
  let addr = start_server(CacheParams::default()).await;
  let mut c1 = TestClient::connect(addr).await;
  let mut c2 = TestClient::connect(addr).await;

  c1.roundtrip("s1 SUB CREATE").await;
  c1.roundtrip("s2 UNSUB CREATE").await;
  c2.roundtrip("r1 CREATE q 9").await;

  // A follow-up request on c1 must answer before any (wrongly delivered)
  // event frame would.
  let frame = c1.roundtrip("s3 MEM").await;
  assert_eq!(frame.frame_type, FrameType::Response);
  assert_eq!(frame.request_id, "s3");
}

#[tokio::test]
async fn test_bad_frames_answer_without_closing() {
  let addr = start_server(CacheParams::default()).await;
  let mut client = TestClient::connect(addr).await;

  let frame = client.roundtrip("lonely").await;
  assert_eq!(frame.code, 400);
  assert_eq!(frame.request_id, "lonely");

  let frame = client.roundtrip("{broken json").await;
  assert_eq!(frame.code, 400);
  assert_eq!(frame.request_id, "0");

  let frame = client.roundtrip("r1 NOSUCHCMD k").await;
  assert_eq!(frame.code, 400);
  assert!(frame.message.contains("NOSUCHCMD"));

  let frame = client.roundtrip("r2 SUB READ").await;
  assert_eq!(frame.code, 400);

  // The connection survived all of it.
  let frame = client.roundtrip("r3 MEM").await;
  assert_eq!(frame.code, 200);
}

#[tokio::test]
async fn test_duplicate_create_conflicts() {
  let addr = start_server(CacheParams::default()).await;
  let mut client = TestClient::connect(addr).await;

  client.roundtrip("r1 CREATE k v").await;
  let frame = client.roundtrip("r2 CREATE k v").await;
  assert_eq!(frame.code, 409);
  assert_eq!(frame.message, "Key already exists");
}

#[tokio::test]
async fn test_flushall_resets_and_publishes() {
  let addr = start_server(CacheParams::default()).await;
  let mut subscriber = TestClient::connect(addr).await;
  let mut client = TestClient::connect(addr).await;

  subscriber.roundtrip("s1 SUB FLUSHALL").await;
  client.roundtrip("r1 CREATE a 1").await;
  client.roundtrip("r2 CREATE b 2").await;

  let frame = client.roundtrip("r3 FLUSHALL").await;
  assert_eq!(frame.code, 200);

  let frame = client.roundtrip("r4 MEM").await;
  assert_eq!(frame.value.as_deref(), Some("0.000000"));

  let event = subscriber.recv().await;
  assert_eq!(event.frame_type, FrameType::Event);
  assert_eq!(event.message, "flushall");
}
