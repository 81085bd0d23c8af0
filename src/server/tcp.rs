//! TCP request pipeline: listener, per-connection readers, one dispatcher,
//! one writer.
//!
//! Readers split bytes into frames and enqueue parsed requests; a single
//! dispatcher preserves global request order; the writer task owns every
//! client write half, so writer-queue order is delivery order. Event frames
//! from the bus enter the same writer queue.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::commands::{execute, Command, CommandContext};
use crate::events::{EventBus, StoreEvent};
use crate::protocol::{fallback_id, parse_request, Frame, FrameReader, Request, CODE_BAD_ARGS};

/// Messages consumed by the writer task. `Attach` is enqueued before any
/// frame for that client can exist, so queue order keeps writes valid.
#[derive(Debug)]
pub enum WriterCommand {
  Attach { client: Uuid, writer: OwnedWriteHalf },
  Frame { client: Uuid, frame: Frame },
  Close { client: Uuid },
}

/// Accept loop. Spawns one reader per connection and runs until shutdown.
pub async fn serve(
  listener: TcpListener,
  ctx: CommandContext,
  out_tx: mpsc::UnboundedSender<WriterCommand>,
  out_rx: mpsc::UnboundedReceiver<WriterCommand>,
  mut shutdown: broadcast::Receiver<()>,
) {
  let (req_tx, req_rx) = mpsc::unbounded_channel::<(Uuid, Request)>();

  tokio::spawn(run_writer(out_rx, ctx.bus.clone()));
  if let Some(events) = ctx.bus.take_outgoing() {
    tokio::spawn(run_event_forwarder(events, out_tx.clone()));
  }
  tokio::spawn(run_dispatcher(req_rx, ctx, out_tx.clone()));

  loop {
    tokio::select! {
      result = listener.accept() => match result {
        Ok((socket, peer)) => {
          let client = Uuid::new_v4();
          tracing::debug!("client {} connected from {}", client, peer);

          let (read_half, write_half) = socket.into_split();
          let _ = out_tx.send(WriterCommand::Attach {
            client,
            writer: write_half,
          });
          tokio::spawn(run_reader(read_half, client, req_tx.clone(), out_tx.clone()));
        }
        Err(e) => {
          tracing::error!("accept error: {}", e);
        }
      },
      _ = shutdown.recv() => {
        tracing::info!("listener shutting down");
        break;
      }
    }
  }
}

/// Per-connection reader: splits frames, parses requests, enqueues them.
/// Parse failures answer directly on the writer queue and never close the
/// connection.
async fn run_reader(
  mut read_half: OwnedReadHalf,
  client: Uuid,
  req_tx: mpsc::UnboundedSender<(Uuid, Request)>,
  out_tx: mpsc::UnboundedSender<WriterCommand>,
) {
  let mut frames = FrameReader::new();
  let mut buf = [0u8; 4096];

  loop {
    match read_half.read(&mut buf).await {
      Ok(0) => break,
      Ok(n) => {
        frames.feed(&buf[..n]);
        while let Some(line) = frames.next_frame() {
          match parse_request(&line) {
            Ok(request) => {
              if req_tx.send((client, request)).is_err() {
                return;
              }
            }
            Err(e) => {
              let frame = Frame::error(&fallback_id(&line), CODE_BAD_ARGS, e.to_string());
              let _ = out_tx.send(WriterCommand::Frame { client, frame });
            }
          }
        }
      }
      Err(e) => {
        tracing::debug!("client {} read error: {}", client, e);
        break;
      }
    }
  }

  let _ = out_tx.send(WriterCommand::Close { client });
  tracing::debug!("client {} disconnected", client);
}

/// The single dispatcher: global FIFO over all clients. Responses are
/// enqueued before the mutation event is published, so a client sees its
/// response ahead of any event for its own mutation.
async fn run_dispatcher(
  mut req_rx: mpsc::UnboundedReceiver<(Uuid, Request)>,
  ctx: CommandContext,
  out_tx: mpsc::UnboundedSender<WriterCommand>,
) {
  while let Some((client, request)) = req_rx.recv().await {
    let (frame, event) = match Command::parse(&request) {
      Ok(command) => execute(&ctx, client, &request.id, command),
      Err(message) => (Frame::error(&request.id, CODE_BAD_ARGS, message), None),
    };

    let _ = out_tx.send(WriterCommand::Frame { client, frame });
    if let Some(event) = event {
      ctx.bus.publish(&event);
    }
  }
  tracing::debug!("dispatcher stopped");
}

/// Turns published `(client, event)` records into Event frames on the
/// writer queue. Publication order is preserved, so a client's response is
/// already queued before the event for its own mutation arrives here.
async fn run_event_forwarder(
  mut events: mpsc::UnboundedReceiver<(Uuid, StoreEvent)>,
  out_tx: mpsc::UnboundedSender<WriterCommand>,
) {
  while let Some((client, event)) = events.recv().await {
    let frame = Frame::event(
      Uuid::new_v4().to_string(),
      event.describe(),
      event.new_value().map(str::to_string),
    );
    let _ = out_tx.send(WriterCommand::Frame { client, frame });
  }
  tracing::debug!("event forwarder stopped");
}

/// The single writer: owns every client stream. A write failure closes the
/// handle and purges its subscriptions.
async fn run_writer(mut rx: mpsc::UnboundedReceiver<WriterCommand>, bus: Arc<EventBus>) {
  let mut clients: HashMap<Uuid, OwnedWriteHalf> = HashMap::new();

  while let Some(command) = rx.recv().await {
    match command {
      WriterCommand::Attach { client, writer } => {
        clients.insert(client, writer);
      }
      WriterCommand::Frame { client, frame } => {
        let Some(writer) = clients.get_mut(&client) else {
          continue;
        };
        if let Err(e) = writer.write_all(&frame.encode()).await {
          tracing::debug!("client {} write failed: {}", client, e);
          clients.remove(&client);
          bus.purge(client);
        }
      }
      WriterCommand::Close { client } => {
        clients.remove(&client);
        bus.purge(client);
      }
    }
  }
  tracing::debug!("writer stopped");
}
