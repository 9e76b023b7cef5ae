//! Loopback nodes speaking RESP, used by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::proto::codec::{Decoder, Encoder};
use crate::proto::frame::Frame;

type Handler = Arc<dyn Fn(&[String]) -> Option<Frame> + Send + Sync>;
type Delay = Arc<dyn Fn(&[String]) -> Duration + Send + Sync>;

/// A single-address server answering each request through a handler.
pub(crate) struct MockNode {
    address: String,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
    accepted: Arc<AtomicUsize>,
    kill: watch::Sender<bool>,
}

impl MockNode {
    /// Starts a node replying `handler(command)` to every request.
    pub(crate) async fn start<F>(handler: F) -> Self
    where
        F: Fn(&[String]) -> Frame + Send + Sync + 'static,
    {
        Self::spawn(Arc::new(move |cmd: &[String]| Some(handler(cmd))), no_delay()).await
    }

    /// Like [`start`](MockNode::start), holding each reply back for
    /// `delay(command)`.
    pub(crate) async fn delayed<D, F>(delay: D, handler: F) -> Self
    where
        D: Fn(&[String]) -> Duration + Send + Sync + 'static,
        F: Fn(&[String]) -> Frame + Send + Sync + 'static,
    {
        Self::spawn(
            Arc::new(move |cmd: &[String]| Some(handler(cmd))),
            Arc::new(delay),
        )
        .await
    }

    /// Starts a node that reads requests but never answers.
    pub(crate) async fn silent() -> Self {
        Self::spawn(Arc::new(|_: &[String]| None), no_delay()).await
    }

    async fn spawn(handler: Handler, delay: Delay) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let (kill, mut killed) = watch::channel(false);

        let log = Arc::clone(&commands);
        let count = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let socket = tokio::select! {
                    biased;
                    _ = killed.changed() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, _)) => socket,
                        Err(_) => return,
                    },
                };
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(
                    socket,
                    Arc::clone(&handler),
                    Arc::clone(&delay),
                    Arc::clone(&log),
                    killed.clone(),
                ));
            }
        });

        Self {
            address,
            commands,
            accepted,
            kill,
        }
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    /// Every request received so far, across connections, in arrival order.
    pub(crate) fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    /// Number of accepted connections.
    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Closes every connection and stops listening.
    pub(crate) fn disconnect_all(&self) {
        let _ = self.kill.send(true);
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        let _ = self.kill.send(true);
    }
}

async fn serve(
    mut socket: TcpStream,
    handler: Handler,
    delay: Delay,
    log: Arc<Mutex<Vec<Vec<String>>>>,
    mut killed: watch::Receiver<bool>,
) {
    let mut decoder = Decoder::new();
    let mut encoder = Encoder::new();
    let mut buf = [0u8; 4096];

    loop {
        if *killed.borrow() {
            return;
        }
        let n = tokio::select! {
            biased;
            _ = killed.changed() => return,
            read = socket.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            },
        };
        decoder.append(&buf[..n]);

        while let Ok(Some(frame)) = decoder.decode() {
            let cmd = request_args(frame);
            log.lock().unwrap().push(cmd.clone());
            let pause = delay(&cmd);
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            if let Some(reply) = handler(&cmd) {
                encoder.encode(&reply);
            }
        }
        if !encoder.is_empty() && socket.write_all(&encoder.take()).await.is_err() {
            return;
        }
    }
}

fn request_args(frame: Frame) -> Vec<String> {
    match frame {
        Frame::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Frame::BulkString(Some(data)) => String::from_utf8_lossy(&data).into_owned(),
                other => format!("{:?}", other),
            })
            .collect(),
        other => vec![format!("{:?}", other)],
    }
}

fn no_delay() -> Delay {
    Arc::new(|_: &[String]| Duration::ZERO)
}

/// An address nothing listens on.
pub(crate) async fn unused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Builds a `CLUSTER SLOTS` reply from `(start, end, address)` ranges.
pub(crate) fn cluster_slots_reply(ranges: &[(u16, u16, &str)]) -> Frame {
    Frame::Array(
        ranges
            .iter()
            .map(|(start, end, address)| {
                let (host, port) = address.rsplit_once(':').unwrap();
                Frame::Array(vec![
                    Frame::Integer(i64::from(*start)),
                    Frame::Integer(i64::from(*end)),
                    Frame::Array(vec![
                        Frame::bulk(host.to_string()),
                        Frame::Integer(port.parse().unwrap()),
                        Frame::bulk(format!("id-{}", port)),
                    ]),
                ])
            })
            .collect(),
    )
}
