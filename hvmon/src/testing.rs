//! Scripted fake monitor for unit tests.

#![allow(clippy::unwrap_used, clippy::missing_docs_in_private_items)]

use std::time::Duration;

use hvmon_proto::{ErrorInfo, Event, Greeting, NEGOTIATE, Reply, Request};
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::{Monitor, MonitorBuilder};

/// Peer end of a test connection.
pub(crate) struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    /// Next request from the client.
    pub(crate) async fn recv(&mut self) -> Request {
        hvmon_proto::recv(&mut self.reader).await.unwrap()
    }

    /// Expects a request for `name` and returns its id and arguments.
    pub(crate) async fn expect(&mut self, name: &str) -> (u32, Option<Value>) {
        let req = self.recv().await;
        assert_eq!(req.name(), name);
        (req.id.unwrap().get(), req.arguments)
    }

    /// Expects `name` and answers it with `ret`. Returns the arguments.
    pub(crate) async fn answer(&mut self, name: &str, ret: Value) -> Option<Value> {
        let (id, args) = self.expect(name).await;
        self.reply(id, ret).await;
        args
    }

    /// Expects `name` and fails it.
    pub(crate) async fn reject(&mut self, name: &str, class: &str, desc: &str) -> Option<Value> {
        let (id, args) = self.expect(name).await;
        self.fail(id, class, desc).await;
        args
    }

    pub(crate) async fn reply(&mut self, id: u32, ret: Value) {
        hvmon_proto::send(&mut self.writer, &Reply::ok(id, ret)).await.unwrap();
    }

    pub(crate) async fn fail(&mut self, id: u32, class: &str, desc: &str) {
        let reply = Reply::err(id, ErrorInfo::new(class, desc));
        hvmon_proto::send(&mut self.writer, &reply).await.unwrap();
    }

    pub(crate) async fn event(&mut self, name: &str, data: Value) {
        hvmon_proto::send(&mut self.writer, &Event::new(name, data)).await.unwrap();
    }

    pub(crate) async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Closes the peer's end of the socket.
    pub(crate) fn hang_up(self) {
        drop(self);
    }
}

/// Builder defaults suited to tests: a short poll interval.
pub(crate) fn builder() -> MonitorBuilder {
    Monitor::builder().poll_interval(Duration::from_millis(5))
}

/// Connects a [`Monitor`] to a fresh peer advertising `caps`.
pub(crate) async fn connect(caps: &[&str]) -> (Monitor, Peer) {
    connect_with(builder(), caps).await
}

/// Like [`connect`] with a custom builder.
pub(crate) async fn connect_with(builder: MonitorBuilder, caps: &[&str]) -> (Monitor, Peer) {
    let (client, server) = UnixStream::pair().unwrap();
    let (read, writer) = server.into_split();
    let mut peer = Peer {
        reader: BufReader::new(read),
        writer,
    };

    let greet = async {
        hvmon_proto::send(&mut peer.writer, &Greeting::new("proto", caps))
            .await
            .unwrap();
        peer.answer(NEGOTIATE, Value::Object(serde_json::Map::new())).await;
    };
    let (mon, ()) = tokio::join!(builder.handshake(client), greet);
    (mon.unwrap(), peer)
}
