//! Shared fixtures for integration tests

#![allow(dead_code)]

use ouroboros_store::backends::kvserver::protocol::{self, Command, Status};
use ouroboros_store::Database;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};

/// In-process KV server speaking the binary protocol
#[derive(Clone, Default)]
pub struct MockKvServer {
    pub data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    /// Writes to these keys are answered with an error status
    pub fail_keys: Arc<Mutex<HashSet<String>>>,
}

impl MockKvServer {
    /// Bind an ephemeral port and serve connections in the background
    pub async fn start() -> (Self, u16) {
        let server = Self::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = server.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = state.clone();
                tokio::spawn(async move { state.serve(stream).await });
            }
        });

        (server, port)
    }

    pub fn fail_on(&self, key: &str) {
        self.fail_keys.lock().insert(key.to_string());
    }

    pub fn raw_get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.lock().get(key).cloned()
    }

    async fn serve(&self, mut stream: TcpStream) {
        while let Ok((tag, payload)) = protocol::read_frame(&mut stream).await {
            let (status, body) = self.handle(tag, &payload);
            if protocol::write_frame(&mut stream, status as u8, &body)
                .await
                .is_err()
            {
                break;
            }
        }
    }

    fn handle(&self, tag: u8, payload: &[u8]) -> (Status, Vec<u8>) {
        let command = match Command::try_from(tag) {
            Ok(command) => command,
            Err(e) => return (Status::Error, e.to_string().into_bytes()),
        };

        match command {
            Command::Ping => (Status::Ok, b"PONG".to_vec()),
            Command::Get => {
                let key = protocol::parse_key(payload).unwrap();
                match self.data.lock().get(&key) {
                    Some(value) => (Status::Ok, protocol::encode_bytes(value)),
                    None => (Status::Null, Vec::new()),
                }
            }
            Command::Set => {
                let (key, value) = protocol::parse_set_payload(payload).unwrap();
                if self.fail_keys.lock().contains(&key) {
                    return (Status::Error, format!("write to {} refused", key).into_bytes());
                }
                self.data.lock().insert(key, value);
                (Status::Ok, Vec::new())
            }
            Command::Del => {
                let key = protocol::parse_key(payload).unwrap();
                if self.fail_keys.lock().contains(&key) {
                    return (Status::Error, format!("delete of {} refused", key).into_bytes());
                }
                let existed = self.data.lock().remove(&key).is_some();
                (Status::Ok, vec![existed as u8])
            }
        }
    }
}

/// A backend under test together with whatever keeps it alive
pub struct Fixture {
    pub db: Database,
    pub settings: Value,
    _dir: Option<TempDir>,
    pub server: Option<MockKvServer>,
}

pub async fn open_memory() -> Fixture {
    let db = Database::new("memory").unwrap();
    db.init(Value::Null).await.unwrap();
    Fixture {
        db,
        settings: Value::Null,
        _dir: None,
        server: None,
    }
}

pub async fn open_disk() -> Fixture {
    let dir = TempDir::new().unwrap();
    let settings = json!({"directory": dir.path(), "sync_on_write": false});
    let db = Database::new("disk").unwrap();
    db.init(settings.clone()).await.unwrap();
    Fixture {
        db,
        settings,
        _dir: Some(dir),
        server: None,
    }
}

pub async fn open_kvserver() -> Fixture {
    let (server, port) = MockKvServer::start().await;
    let settings = json!({"port": port});
    let db = Database::new("kvserver").unwrap();
    db.init(settings.clone()).await.unwrap();
    Fixture {
        db,
        settings,
        _dir: None,
        server: Some(server),
    }
}

/// One fixture per backend that runs without external services
pub async fn all_backends() -> Vec<Fixture> {
    vec![open_memory().await, open_disk().await, open_kvserver().await]
}
