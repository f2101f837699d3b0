//! In-process NATS server for end-to-end tests.
//!
//! Speaks enough of the protocol to exercise the client: INFO/CONNECT,
//! PING/PONG, SUB with queue groups, UNSUB with a message budget, PUB/HPUB
//! routing and no-responders status replies.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use natswire_client::protocol::{
    Frame, FrameBuffer, HMsg, Headers, Msg, ServerInfo, NO_RESPONDERS_STATUS,
};
use natswire_client::subject;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const TEST_MAX_PAYLOAD: usize = 1024 * 1024;

#[derive(Debug)]
struct Subscription {
    subject: String,
    queue_group: Option<String>,
    max_msgs: Option<u64>,
    delivered: u64,
}

#[derive(Debug)]
struct Peer {
    outbound: mpsc::UnboundedSender<Bytes>,
    no_responders: bool,
    subs: HashMap<String, Subscription>,
}

#[derive(Default)]
struct Routes {
    peers: HashMap<u64, Peer>,
}

pub struct FakeServer {
    pub port: u16,
    routes: Arc<Mutex<Routes>>,
    kill: Arc<Mutex<CancellationToken>>,
    accepted: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl FakeServer {
    pub async fn start() -> Self {
        Self::start_with(TEST_MAX_PAYLOAD).await
    }

    pub async fn start_with(max_payload: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = Self {
            port,
            routes: Arc::new(Mutex::new(Routes::default())),
            kill: Arc::new(Mutex::new(CancellationToken::new())),
            accepted: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        };

        let info = ServerInfo {
            server_id: "FAKE".to_string(),
            server_name: "fake".to_string(),
            version: "2.10.0".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            headers: true,
            max_payload,
            proto: 1,
            ..ServerInfo::default()
        };

        let routes = server.routes.clone();
        let kill = server.kill.clone();
        let accepted = server.accepted.clone();
        let shutdown = server.shutdown.clone();
        tokio::spawn(async move {
            let next_id = AtomicU64::new(1);
            loop {
                let stream = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    accept = listener.accept() => match accept {
                        Ok((stream, _)) => stream,
                        Err(_) => return,
                    },
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                let id = next_id.fetch_add(1, Ordering::SeqCst);
                let cancel = kill.lock().clone();
                tokio::spawn(serve_peer(
                    id,
                    stream,
                    info.clone(),
                    routes.clone(),
                    cancel,
                ));
            }
        });

        server
    }

    /// Drop every open connection. New connections are still accepted.
    pub fn kill_connections(&self) {
        let mut kill = self.kill.lock();
        kill.cancel();
        *kill = CancellationToken::new();
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Live subscriptions across all connections.
    pub fn subscription_count(&self) -> usize {
        self.routes
            .lock()
            .peers
            .values()
            .map(|peer| peer.subs.len())
            .sum()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.kill.lock().cancel();
    }
}

async fn serve_peer(
    id: u64,
    stream: TcpStream,
    info: ServerInfo,
    routes: Arc<Mutex<Routes>>,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let hello = Frame::Info(Box::new(info)).encode().unwrap();
    let _ = tx.send(hello);
    routes.lock().peers.insert(
        id,
        Peer {
            outbound: tx.clone(),
            no_responders: false,
            subs: HashMap::new(),
        },
    );

    let write_cancel = cancel.clone();
    let write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = write_cancel.cancelled() => break,
                bytes = rx.recv() => match bytes {
                    Some(bytes) => {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut buffer = FrameBuffer::new();
    let mut chunk = vec![0u8; 16 * 1024];
    'read: loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut chunk) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        let frames = match buffer.push(&chunk[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                let _ = tx.send(Frame::Err(e.to_string()).encode().unwrap());
                break;
            }
        };
        for frame in frames {
            if !handle_frame(id, frame, &routes, &tx) {
                break 'read;
            }
        }
    }

    routes.lock().peers.remove(&id);
    cancel.cancel();
    let _ = write_task.await;
}

fn handle_frame(
    id: u64,
    frame: Frame,
    routes: &Mutex<Routes>,
    tx: &mpsc::UnboundedSender<Bytes>,
) -> bool {
    match frame {
        Frame::Connect(connect) => {
            if let Some(peer) = routes.lock().peers.get_mut(&id) {
                peer.no_responders = connect.no_responders.unwrap_or(false);
            }
        }
        Frame::Ping => {
            let _ = tx.send(Frame::Pong.encode().unwrap());
        }
        Frame::Pong => {}
        Frame::Sub(sub) => {
            if let Some(peer) = routes.lock().peers.get_mut(&id) {
                peer.subs.entry(sub.sid).or_insert(Subscription {
                    subject: sub.subject,
                    queue_group: sub.queue_group,
                    max_msgs: None,
                    delivered: 0,
                });
            }
        }
        Frame::Unsub(unsub) => {
            if let Some(peer) = routes.lock().peers.get_mut(&id) {
                match unsub.max_msgs {
                    Some(max) => {
                        let exhausted = peer.subs.get_mut(&unsub.sid).is_some_and(|sub| {
                            sub.max_msgs = Some(max);
                            sub.delivered >= max
                        });
                        if exhausted {
                            peer.subs.remove(&unsub.sid);
                        }
                    }
                    None => {
                        peer.subs.remove(&unsub.sid);
                    }
                }
            }
        }
        Frame::Pub(p) => route(id, routes, &p.subject, p.reply_to, None, p.payload),
        Frame::HPub(p) => route(
            id,
            routes,
            &p.subject,
            p.reply_to,
            Some(p.headers),
            p.payload,
        ),
        other => {
            let _ = tx.send(
                Frame::Err(format!("Unknown Protocol Operation {}", other.verb().as_str()))
                    .encode()
                    .unwrap(),
            );
            return false;
        }
    }
    true
}

fn route(
    from: u64,
    routes: &Mutex<Routes>,
    subject_name: &str,
    reply_to: Option<String>,
    headers: Option<Headers>,
    payload: Bytes,
) {
    let mut routes = routes.lock();

    // One delivery per plain subscription, one per queue group.
    let mut targets: Vec<(u64, String)> = Vec::new();
    let mut groups_served: Vec<String> = Vec::new();
    let mut peer_ids: Vec<u64> = routes.peers.keys().copied().collect();
    peer_ids.sort_unstable();
    for peer_id in peer_ids {
        let peer = &routes.peers[&peer_id];
        let mut sids: Vec<&String> = peer.subs.keys().collect();
        sids.sort();
        for sid in sids {
            let sub = &peer.subs[sid];
            if !subject::matches(&sub.subject, subject_name) {
                continue;
            }
            if let Some(group) = &sub.queue_group {
                if groups_served.contains(group) {
                    continue;
                }
                groups_served.push(group.clone());
            }
            targets.push((peer_id, sid.clone()));
        }
    }

    if targets.is_empty() {
        if let Some(reply_to) = reply_to {
            send_no_responders(from, &routes, &reply_to);
        }
        return;
    }

    for (peer_id, sid) in targets {
        let Some(peer) = routes.peers.get_mut(&peer_id) else {
            continue;
        };
        let frame = match &headers {
            Some(headers) => Frame::HMsg(HMsg {
                subject: subject_name.to_string(),
                sid: sid.clone(),
                reply_to: reply_to.clone(),
                headers: headers.clone(),
                payload: payload.clone(),
            }),
            None => Frame::Msg(Msg {
                subject: subject_name.to_string(),
                sid: sid.clone(),
                reply_to: reply_to.clone(),
                payload: payload.clone(),
            }),
        };
        let _ = peer.outbound.send(frame.encode().unwrap());

        let exhausted = peer.subs.get_mut(&sid).is_some_and(|sub| {
            sub.delivered += 1;
            sub.max_msgs.is_some_and(|max| sub.delivered >= max)
        });
        if exhausted {
            peer.subs.remove(&sid);
        }
    }
}

fn send_no_responders(from: u64, routes: &Routes, reply_to: &str) {
    let Some(peer) = routes.peers.get(&from) else {
        return;
    };
    if !peer.no_responders {
        return;
    }
    let Some(sid) = peer
        .subs
        .iter()
        .find(|(_, sub)| subject::matches(&sub.subject, reply_to))
        .map(|(sid, _)| sid.clone())
    else {
        return;
    };
    let frame = Frame::HMsg(HMsg {
        subject: reply_to.to_string(),
        sid,
        reply_to: None,
        headers: Headers::with_status(NO_RESPONDERS_STATUS, None),
        payload: Bytes::new(),
    });
    let _ = peer.outbound.send(frame.encode().unwrap());
}
