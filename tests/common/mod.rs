//! Shared fixtures for integration tests: an in-process engine that speaks the
//! framed wire protocol over TCP.

#![allow(dead_code)]

use giles::tsengine::wire::{self, Command, RawRecord, Request, Response};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};

/// Status the mock returns for requests naming this uuid.
pub const FAILING_UUID: [u8; 16] = [0xff; 16];
/// Requests naming this uuid make the mock drop the connection without replying.
pub const HANGUP_UUID: [u8; 16] = [0xee; 16];
/// Requests naming this uuid are read but never answered.
pub const SILENT_UUID: [u8; 16] = [0xdd; 16];
/// Inserts naming this uuid are answered with a records frame instead of a void one.
pub const MISMATCH_UUID: [u8; 16] = [0xcc; 16];
/// Record responses are split into frames of at most this many records.
pub const RECORDS_PER_FRAME: usize = 2;

#[derive(Default)]
pub struct EngineState {
    pub requests: Vec<Request>,
    pub series: HashMap<[u8; 16], BTreeMap<i64, f64>>,
    pub connections: usize,
    pub frames_sent: usize,
}

pub struct MockEngine {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<EngineState>>,
}

impl MockEngine {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(EngineState::default()));
        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let state = Arc::clone(&shared);
                tokio::spawn(serve_connection(socket, state));
            }
        });
        Self { addr, state }
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    pub fn frames_sent(&self) -> usize {
        self.state.lock().unwrap().frames_sent
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn inserts(&self) -> Vec<(usize, [u8; 16])> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r.command {
                Command::InsertValues { uuid, values, .. } => Some((values.len(), uuid)),
                _ => None,
            })
            .collect()
    }
}

fn command_uuid(command: &Command) -> [u8; 16] {
    match command {
        Command::InsertValues { uuid, .. }
        | Command::QueryStandardValues { uuid, .. }
        | Command::QueryNearestValue { uuid, .. }
        | Command::DeleteValues { uuid, .. } => *uuid,
    }
}

async fn serve_connection(mut socket: TcpStream, state: Arc<Mutex<EngineState>>) {
    state.lock().unwrap().connections += 1;
    let mut frame = Vec::new();
    while wire::read_frame(&mut socket, &mut frame).await.is_ok() {
        let request: Request = match wire::decode(&frame) {
            Ok(request) => request,
            Err(_) => return,
        };
        match command_uuid(&request.command) {
            HANGUP_UUID => return,
            SILENT_UUID => {
                std::future::pending::<()>().await;
            }
            _ => {}
        }
        for response in respond(&state, request) {
            let mut out = Vec::new();
            wire::encode_into(&response, &mut out).unwrap();
            if wire::write_frame(&mut socket, &out).await.is_err() {
                return;
            }
            state.lock().unwrap().frames_sent += 1;
        }
    }
}

/// Splits `records` into frames, flagging only the last one final.
fn record_frames(tag: u64, records: Vec<RawRecord>) -> Vec<Response> {
    if records.is_empty() {
        return vec![Response::records(tag, records, true)];
    }
    let chunks: Vec<Vec<RawRecord>> = records.chunks(RECORDS_PER_FRAME).map(<[RawRecord]>::to_vec).collect();
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| Response::records(tag, chunk, i == last))
        .collect()
}

fn respond(state: &Mutex<EngineState>, request: Request) -> Vec<Response> {
    let mut state = state.lock().unwrap();
    state.requests.push(request.clone());
    let tag = request.echo_tag;
    match request.command {
        Command::InsertValues { uuid, .. } | Command::DeleteValues { uuid, .. }
            if uuid == FAILING_UUID =>
        {
            vec![Response::error(tag, 7)]
        }
        Command::InsertValues { uuid, .. } if uuid == MISMATCH_UUID => {
            vec![Response::records(tag, Vec::new(), true)]
        }
        Command::InsertValues { uuid, values, .. } => {
            let series = state.series.entry(uuid).or_default();
            for v in values {
                series.insert(v.time, v.value);
            }
            vec![Response::void(tag)]
        }
        Command::QueryStandardValues { uuid, start, end } => {
            let records = state
                .series
                .get(&uuid)
                .map(|s| s.range(start..=end).map(|(t, v)| RawRecord { time: *t, value: *v }).collect())
                .unwrap_or_default();
            record_frames(tag, records)
        }
        Command::QueryNearestValue { uuid, time, backward } => {
            let found = state.series.get(&uuid).and_then(|s| {
                if backward {
                    s.range(..time).next_back().map(|(t, v)| (*t, *v))
                } else {
                    s.range(time..).next().map(|(t, v)| (*t, *v))
                }
            });
            let records = found.map(|(time, value)| vec![RawRecord { time, value }]).unwrap_or_default();
            vec![Response::records(tag, records, true)]
        }
        Command::DeleteValues { uuid, start, end } => {
            if let Some(series) = state.series.get_mut(&uuid) {
                series.retain(|t, _| *t < start || *t > end);
            }
            vec![Response::void(tag)]
        }
    }
}
