use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error};

use super::adapter::EventAdapter;
use super::connection::{Connection, ConnectionReader, ConnectionWriter};
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

type Responder = oneshot::Sender<Result<Vec<Frame>>>;

/// A batch of frames written together; one reply is expected per frame.
struct Request {
    frames: Vec<Frame>,
    response_tx: Responder,
}

/// A handle to a multiplexed node connection.
///
/// Cheap to clone. Requests from any number of tasks are written in
/// arrival order and their replies matched back in the same order.
#[derive(Clone)]
pub struct MultiplexedConnection {
    sender: mpsc::Sender<Request>,
    shutdown: Arc<watch::Sender<bool>>,
    finished: Arc<Mutex<mpsc::Receiver<()>>>,
}

impl MultiplexedConnection {
    /// Creates a new multiplexed connection whose I/O tasks run on `adapter`.
    ///
    /// # Arguments
    ///
    /// * `connection` - The underlying connection to multiplex.
    /// * `queue_size` - The maximum number of pending requests.
    /// * `adapter` - Event loop that runs the reader and writer.
    pub fn new<S>(connection: Connection<S>, queue_size: usize, adapter: &dyn EventAdapter) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = connection.split();
        let (request_tx, request_rx) = mpsc::channel(queue_size);
        let (waiter_tx, waiter_rx) = mpsc::channel(queue_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (alive_tx, alive_rx) = mpsc::channel::<()>(1);

        let writer_alive = alive_tx.clone();
        let writer_shutdown = shutdown_rx.clone();
        adapter.spawn(Box::pin(async move {
            run_writer(writer, request_rx, waiter_tx, writer_shutdown).await;
            drop(writer_alive);
        }));

        adapter.spawn(Box::pin(async move {
            run_reader(reader, waiter_rx, shutdown_rx).await;
            drop(alive_tx);
        }));

        Self {
            sender: request_tx,
            shutdown: Arc::new(shutdown_tx),
            finished: Arc::new(Mutex::new(alive_rx)),
        }
    }

    /// Sends a single command and awaits its reply.
    pub async fn send_command(&self, frame: Frame) -> Result<Frame> {
        self.send_pipeline(vec![frame])
            .await?
            .pop()
            .ok_or(Error::Closed)
    }

    /// Writes `frames` back to back and awaits one reply per frame.
    pub async fn send_pipeline(&self, frames: Vec<Frame>) -> Result<Vec<Frame>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.sender
            .send(Request {
                frames,
                response_tx,
            })
            .await
            .map_err(|_| Error::Closed)?;
        response_rx.await.map_err(|_| Error::Closed)?
    }

    /// Returns true once the connection can no longer carry requests.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed() || *self.shutdown.borrow()
    }

    /// Stops both I/O tasks; outstanding requests fail with [`Error::Closed`].
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Resolves once both I/O tasks have exited.
    pub async fn closed(&self) {
        let mut finished = self.finished.lock().await;
        while finished.recv().await.is_some() {}
    }
}

impl fmt::Debug for MultiplexedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexedConnection")
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run_writer<S>(
    mut writer: ConnectionWriter<S>,
    mut request_rx: mpsc::Receiver<Request>,
    waiter_tx: mpsc::Sender<(usize, Responder)>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let req = tokio::select! {
            req = request_rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
            _ = shutdown.wait_for(|closed| *closed) => break,
        };
        debug!(frames = req.frames.len(), "sending frames");
        if let Err(e) = writer.write_frames(&req.frames).await {
            error!(error = %e, "failed to write frames");
            let _ = req.response_tx.send(Err(e));
            break;
        }
        if let Err(mpsc::error::SendError((_, tx))) =
            waiter_tx.send((req.frames.len(), req.response_tx)).await
        {
            let _ = tx.send(Err(Error::Closed));
            break;
        }
    }
    request_rx.close();
    while let Ok(req) = request_rx.try_recv() {
        let _ = req.response_tx.send(Err(Error::Closed));
    }
    writer.shutdown().await;
}

async fn run_reader<S>(
    mut reader: ConnectionReader<S>,
    mut waiter_rx: mpsc::Receiver<(usize, Responder)>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let (count, tx) = tokio::select! {
            waiter = waiter_rx.recv() => match waiter {
                Some(waiter) => waiter,
                None => return,
            },
            _ = shutdown.wait_for(|closed| *closed) => break,
        };

        let read = async {
            let mut replies = Vec::new();
            replies
                .try_reserve_exact(count)
                .map_err(|_| Error::OutOfMemory)?;
            for _ in 0..count {
                replies.push(reader.read_frame().await?);
            }
            Ok::<_, Error>(replies)
        };
        let result = tokio::select! {
            result = read => result,
            _ = shutdown.wait_for(|closed| *closed) => Err(Error::Closed),
        };

        match result {
            Ok(replies) => {
                debug!(replies = replies.len(), "received frames");
                let _ = tx.send(Ok(replies));
            }
            Err(e) => {
                error!(error = %e, "failed to read frames");
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
    waiter_rx.close();
    while let Ok((_, tx)) = waiter_rx.try_recv() {
        let _ = tx.send(Err(Error::Closed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::adapter::TokioAdapter;

    fn echo_server(stream: tokio::io::DuplexStream) {
        tokio::spawn(async move {
            let mut conn = Connection::new(stream);
            while let Ok(frame) = conn.read_frame().await {
                let reply = match frame {
                    Frame::Array(mut args) => args.pop().unwrap_or(Frame::Null),
                    other => other,
                };
                if conn.write_frame(&reply).await.is_err() {
                    return;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_pipeline_replies_in_order() {
        let (client, server) = tokio::io::duplex(4096);
        echo_server(server);
        let adapter = TokioAdapter::current().unwrap();
        let conn = MultiplexedConnection::new(Connection::new(client), 16, &adapter);

        let replies = conn
            .send_pipeline(vec![
                Frame::Array(vec![Frame::bulk("ECHO"), Frame::bulk("a")]),
                Frame::Array(vec![Frame::bulk("ECHO"), Frame::bulk("b")]),
            ])
            .await
            .unwrap();
        assert_eq!(replies, vec![Frame::bulk("a"), Frame::bulk("b")]);
    }

    #[tokio::test]
    async fn test_concurrent_senders() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        echo_server(server);
        let adapter = TokioAdapter::current().unwrap();
        let conn = MultiplexedConnection::new(Connection::new(client), 256, &adapter);

        let mut handles = Vec::new();
        for i in 0..100 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                let reply = conn
                    .send_command(Frame::Array(vec![
                        Frame::bulk("ECHO"),
                        Frame::bulk(i.to_string()),
                    ]))
                    .await
                    .unwrap();
                assert_eq!(reply, Frame::bulk(i.to_string()));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_finishes() {
        let (client, _server) = tokio::io::duplex(1024);
        let adapter = TokioAdapter::current().unwrap();
        let conn = MultiplexedConnection::new(Connection::new(client), 16, &adapter);

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send_command(Frame::Array(vec![Frame::bulk("PING")])).await })
        };
        tokio::task::yield_now().await;
        conn.close();
        assert!(matches!(pending.await.unwrap(), Err(Error::Closed)));
        conn.closed().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_fails_request() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let adapter = TokioAdapter::current().unwrap();
        let conn = MultiplexedConnection::new(Connection::new(client), 16, &adapter);
        assert!(conn
            .send_command(Frame::Array(vec![Frame::bulk("PING")]))
            .await
            .is_err());
    }
}
