//! Command grammar and the single dispatch point

use std::sync::Arc;

use uuid::Uuid;

use crate::events::{EventBus, EventKind, StoreEvent, SubscribeOutcome};
use crate::protocol::{Frame, Request, CODE_DUPLICATE, CODE_NOT_FOUND, CODE_SERVER_ERROR};
use crate::store::{ReadOutcome, Store, StoreError};

/// A typed command; each variant carries exactly what its handler needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
  Create { key: String, value: String },
  Add { key: String, value: String, ttl: u64 },
  Read { key: String },
  Update { key: String, value: String, ttl: Option<u64> },
  Delete { key: String },
  Mem,
  FlushAll,
  Sub(EventKind),
  Unsub(EventKind),
}

fn arity_error(command: &str) -> String {
  format!("wrong number of arguments for '{}'", command)
}

fn key_arg(args: &[String], command: &str) -> Result<String, String> {
  let key = args.first().ok_or_else(|| arity_error(command))?;
  if key.is_empty() {
    return Err("key must not be empty".to_string());
  }
  Ok(key.clone())
}

fn ttl_arg(raw: &str) -> Result<u64, String> {
  raw
    .parse::<u64>()
    .map_err(|_| format!("ttl is not a non-negative integer: {}", raw))
}

fn kind_arg(args: &[String], command: &str) -> Result<EventKind, String> {
  if args.len() != 1 {
    return Err(arity_error(command));
  }
  args[0].parse::<EventKind>()
}

impl Command {
  /// Parse a request into a command. The error string becomes a 400
  /// bad-args (or bad-kind) response message.
  pub fn parse(request: &Request) -> Result<Command, String> {
    let command = request.command.to_uppercase();
    let args = &request.args;

    match command.as_str() {
      "CREATE" => {
        if args.len() != 2 {
          return Err(arity_error("CREATE"));
        }
        Ok(Command::Create {
          key: key_arg(args, "CREATE")?,
          value: args[1].clone(),
        })
      }
      "ADD" => {
        if args.len() != 3 {
          return Err(arity_error("ADD"));
        }
        Ok(Command::Add {
          key: key_arg(args, "ADD")?,
          value: args[1].clone(),
          ttl: ttl_arg(&args[2])?,
        })
      }
      "READ" => {
        if args.len() != 1 {
          return Err(arity_error("READ"));
        }
        Ok(Command::Read {
          key: key_arg(args, "READ")?,
        })
      }
      "UPDATE" => {
        if args.len() != 2 && args.len() != 3 {
          return Err(arity_error("UPDATE"));
        }
        let ttl = match args.get(2) {
          Some(raw) => Some(ttl_arg(raw)?),
          None => None,
        };
        Ok(Command::Update {
          key: key_arg(args, "UPDATE")?,
          value: args[1].clone(),
          ttl,
        })
      }
      "DELETE" => {
        if args.len() != 1 {
          return Err(arity_error("DELETE"));
        }
        Ok(Command::Delete {
          key: key_arg(args, "DELETE")?,
        })
      }
      "MEM" => {
        if !args.is_empty() {
          return Err(arity_error("MEM"));
        }
        Ok(Command::Mem)
      }
      "FLUSHALL" => {
        if !args.is_empty() {
          return Err(arity_error("FLUSHALL"));
        }
        Ok(Command::FlushAll)
      }
      "SUB" => Ok(Command::Sub(kind_arg(args, "SUB")?)),
      "UNSUB" => Ok(Command::Unsub(kind_arg(args, "UNSUB")?)),
      other => Err(format!("unknown command '{}'", other)),
    }
  }
}

/// Shared handles the dispatcher executes against.
pub struct CommandContext {
  pub store: Arc<Store>,
  pub bus: Arc<EventBus>,
}

fn store_error_frame(id: &str, err: StoreError) -> Frame {
  let code = match err {
    StoreError::Duplicate => CODE_DUPLICATE,
    StoreError::NotFound => CODE_NOT_FOUND,
    StoreError::MemoryLimit => CODE_SERVER_ERROR,
  };
  Frame::error(id, code, err.to_string())
}

/// Execute one command, returning the response frame and the mutation event
/// to publish once the response has been enqueued. Publishing after the
/// response keeps a client's response ahead of the event for its own
/// mutation.
pub fn execute(
  ctx: &CommandContext,
  client: Uuid,
  id: &str,
  command: Command,
) -> (Frame, Option<StoreEvent>) {
  match command {
    Command::Create { key, value } => match ctx.store.create(&key, &value, 0) {
      Ok(event) => (Frame::response(id, format!("Created {}", key)), Some(event)),
      Err(err) => (store_error_frame(id, err), None),
    },
    Command::Add { key, value, ttl } => match ctx.store.create(&key, &value, ttl) {
      Ok(event) => (Frame::response(id, format!("Created {}", key)), Some(event)),
      Err(err) => (store_error_frame(id, err), None),
    },
    Command::Read { key } => match ctx.store.read(&key) {
      ReadOutcome::Hit(value) => (
        Frame::response_with_value(id, value.clone(), value),
        None,
      ),
      ReadOutcome::Miss => (store_error_frame(id, StoreError::NotFound), None),
      ReadOutcome::Expired(event) => (store_error_frame(id, StoreError::NotFound), Some(event)),
    },
    Command::Update { key, value, ttl } => match ctx.store.update(&key, &value, ttl) {
      Ok(event) => (Frame::response(id, format!("Updated {}", key)), Some(event)),
      Err(err) => (store_error_frame(id, err), None),
    },
    Command::Delete { key } => match ctx.store.delete(&key) {
      Some(event) => (
        Frame::response(id, "Key Deleted Successfully"),
        Some(event),
      ),
      None => (store_error_frame(id, StoreError::NotFound), None),
    },
    Command::Mem => {
      let mb = format!("{:.6}", ctx.store.accountant().current_mb());
      (Frame::response_with_value(id, mb.clone(), mb), None)
    }
    Command::FlushAll => {
      let event = ctx.store.flush_all();
      (Frame::response(id, "Flushed all keys"), Some(event))
    }
    Command::Sub(kind) => {
      let message = match ctx.bus.subscribe(client, kind) {
        SubscribeOutcome::Added => format!("Subscribed to {}", kind),
        SubscribeOutcome::AlreadyRegistered => format!("Already subscribed to {}", kind),
      };
      (Frame::response(id, message), None)
    }
    Command::Unsub(kind) => {
      ctx.bus.unsubscribe(client, kind);
      (Frame::response(id, format!("Unsubscribed from {}", kind)), None)
    }
  }
}
