//! Simulated ComfoAir unit on loopback TCP

#![allow(dead_code)]

use bytes::Bytes;
use comfoair::protocol::{
    decode_request, encode_keepalive, encode_push, encode_response, FrameKind, Operation,
    Response, ResultCode, UnitBound,
};
use comfoair::{encode_frame, FrameBuffer, PropertyId, PropertyValue, UnitDescriptor, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

enum Outbound {
    Frame(Bytes),
    Hangup,
}

#[derive(Default)]
struct UnitState {
    pincode: u32,
    values: HashMap<PropertyId, Value>,
    operations: Vec<Operation>,
    keepalives: usize,
    accepted: usize,
    silent_reads: bool,
    split_writes: bool,
    answer_keepalive: bool,
    connections: Vec<mpsc::UnboundedSender<Outbound>>,
}

pub struct MockUnit {
    port: u16,
    state: Arc<Mutex<UnitState>>,
    accept_task: JoinHandle<()>,
}

impl MockUnit {
    /// Start a unit accepting `pincode`
    pub async fn start(pincode: u32) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(UnitState {
            pincode,
            answer_keepalive: true,
            ..UnitState::default()
        }));

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (tx, rx) = mpsc::unbounded_channel();
                {
                    let mut state = accept_state.lock().unwrap();
                    state.accepted += 1;
                    state.connections.push(tx);
                }
                tokio::spawn(serve(stream, accept_state.clone(), rx));
            }
        });

        Self {
            port,
            state,
            accept_task,
        }
    }

    pub fn descriptor(&self) -> UnitDescriptor {
        UnitDescriptor::new("0000000000251010800170b3d54264b4", "127.0.0.1", self.port)
    }

    pub fn set_value(&self, id: PropertyId, value: Value) {
        self.state.lock().unwrap().values.insert(id, value);
    }

    pub fn value(&self, id: PropertyId) -> Option<Value> {
        self.state.lock().unwrap().values.get(&id).cloned()
    }

    /// Stop answering read requests
    pub fn set_silent_reads(&self, silent: bool) {
        self.state.lock().unwrap().silent_reads = silent;
    }

    /// Write every frame in two segments, splitting the length header
    pub fn set_split_writes(&self, split: bool) {
        self.state.lock().unwrap().split_writes = split;
    }

    pub fn set_answer_keepalive(&self, answer: bool) {
        self.state.lock().unwrap().answer_keepalive = answer;
    }

    /// Push a value to every connected client
    pub fn push(&self, value: PropertyValue) {
        let frame = encode_frame(&encode_push(&value).unwrap()).unwrap();
        self.send_all(frame);
    }

    /// Send raw bytes to every connected client
    pub fn send_raw(&self, frame: Bytes) {
        self.send_all(frame);
    }

    /// Drop every open connection
    pub fn hang_up(&self) {
        let connections = std::mem::take(&mut self.state.lock().unwrap().connections);
        for tx in connections {
            let _ = tx.send(Outbound::Hangup);
        }
    }

    /// Stop accepting connections and drop the open ones
    pub fn shut_down(&self) {
        self.accept_task.abort();
        self.hang_up();
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().operations.clone()
    }

    pub fn count(&self, matches: impl Fn(&Operation) -> bool) -> usize {
        self.operations().iter().filter(|op| matches(op)).count()
    }

    pub fn subscribes(&self, id: PropertyId) -> usize {
        self.count(|op| *op == Operation::Subscribe(id))
    }

    pub fn unsubscribes(&self, id: PropertyId) -> usize {
        self.count(|op| *op == Operation::Unsubscribe(id))
    }

    pub fn keepalives(&self) -> usize {
        self.state.lock().unwrap().keepalives
    }

    pub fn accepted(&self) -> usize {
        self.state.lock().unwrap().accepted
    }

    fn send_all(&self, frame: Bytes) {
        let state = self.state.lock().unwrap();
        for tx in &state.connections {
            let _ = tx.send(Outbound::Frame(frame.clone()));
        }
    }
}

impl Drop for MockUnit {
    fn drop(&mut self) {
        self.shut_down();
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<Mutex<UnitState>>,
    mut outbox: mpsc::UnboundedReceiver<Outbound>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = FrameBuffer::new();
    let mut chunk = [0u8; 1024];

    loop {
        tokio::select! {
            read = reader.read(&mut chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buffer.extend(&chunk[..n]);
                while let Ok(Some(body)) = buffer.next_frame() {
                    let Some(reply) = answer(&state, &body) else {
                        continue;
                    };
                    let split = state.lock().unwrap().split_writes;
                    if write_frame(&mut writer, &reply, split).await.is_err() {
                        return;
                    }
                }
            }
            out = outbox.recv() => match out {
                Some(Outbound::Frame(frame)) => {
                    if writer.write_all(&frame).await.is_err() {
                        return;
                    }
                }
                Some(Outbound::Hangup) | None => return,
            }
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8], split: bool) -> std::io::Result<()> {
    if split {
        writer.write_all(&frame[..2]).await?;
        writer.flush().await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.write_all(&frame[2..]).await?;
    } else {
        writer.write_all(frame).await?;
    }
    writer.flush().await
}

/// Build the framed reply to a client frame, if any
fn answer(state: &Arc<Mutex<UnitState>>, body: &[u8]) -> Option<Bytes> {
    let mut state = state.lock().unwrap();

    let (sequence, operation) = match decode_request(body).ok()? {
        UnitBound::Request(sequence, operation) => (sequence, operation),
        UnitBound::KeepAlive => {
            state.keepalives += 1;
            return state
                .answer_keepalive
                .then(|| encode_frame(&encode_keepalive()).unwrap());
        }
        UnitBound::Close => return None,
    };
    state.operations.push(operation.clone());

    let response = match &operation {
        Operation::Handshake => Response::new(FrameKind::HandshakeAck, sequence, ResultCode::Ok),
        Operation::Register { pincode, .. } => {
            let status = if *pincode == state.pincode {
                ResultCode::Ok
            } else {
                ResultCode::NotAllowed
            };
            Response::new(FrameKind::RegisterAck, sequence, status)
        }
        Operation::Read(id) => {
            if state.silent_reads {
                return None;
            }
            match state.values.get(id) {
                Some(value) => Response::new(FrameKind::PropertyReadResponse, sequence, ResultCode::Ok)
                    .with_value(PropertyValue::new(*id, value.clone())),
                None => Response::new(FrameKind::PropertyReadResponse, sequence, ResultCode::NotExist),
            }
        }
        Operation::Write(value) => {
            state.values.insert(value.id, value.value.clone());
            Response::new(FrameKind::PropertyWriteResponse, sequence, ResultCode::Ok)
        }
        Operation::Subscribe(_) => Response::new(FrameKind::SubscribeResponse, sequence, ResultCode::Ok),
        Operation::Unsubscribe(_) => {
            Response::new(FrameKind::UnsubscribeResponse, sequence, ResultCode::Ok)
        }
    };

    Some(encode_frame(&encode_response(&response).unwrap()).unwrap())
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
