// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request/response loop for a single client connection.
//!
//! A session has at most one request in flight: the next frame from its
//! client is not dispatched before the previous one has been answered.
//! While waiting, the session keeps reading so that a departing client
//! abandons its request.

use std::{net::SocketAddr, pin::pin};

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::{
    io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    time::sleep,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    codec::tcp::FrameCodec,
    config::{OnQueueFull, SessionConfig},
    frame::{ExceptionCode, Frame},
    queue::{PendingRequest, RequestQueue, SessionId},
    Error, Result,
};

#[derive(Debug)]
pub(crate) struct Session<T> {
    id: SessionId,
    peer: SocketAddr,
    reader: FramedRead<ReadHalf<T>, FrameCodec>,
    writer: FramedWrite<WriteHalf<T>, FrameCodec>,
    /// Sent by the client before the previous request was answered.
    lookahead: Option<Frame>,
    queue: RequestQueue,
    config: SessionConfig,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        id: SessionId,
        peer: SocketAddr,
        transport: T,
        codec: FrameCodec,
        queue: RequestQueue,
        config: SessionConfig,
    ) -> Self {
        let (read_half, write_half) = split(transport);
        Self {
            id,
            peer,
            reader: FramedRead::new(read_half, codec),
            writer: FramedWrite::new(write_half, codec),
            lookahead: None,
            queue,
            config,
        }
    }

    /// Serve the client until it disconnects or a fatal error occurs.
    pub(crate) async fn run(mut self) -> Result<()> {
        log::info!("Session {}: client {} connected", self.id, self.peer);
        let result = self.process().await;
        match &result {
            Ok(()) => log::info!("Session {}: client {} disconnected", self.id, self.peer),
            Err(err) => log::warn!("Session {}: closing connection to {}: {err}", self.id, self.peer),
        }
        result
    }

    async fn process(&mut self) -> Result<()> {
        while let Some(request) = self.next_request().await? {
            let Some(response) = self.dispatch(request).await? else {
                return Ok(());
            };
            self.writer.send(response).await?;
        }
        Ok(())
    }

    async fn next_request(&mut self) -> Result<Option<Frame>> {
        if let Some(request) = self.lookahead.take() {
            return Ok(Some(request));
        }
        self.reader.next().await.transpose()
    }

    /// Hand the request over to the workers and wait for the outcome.
    ///
    /// Recoverable failures are turned into exception responses. Returns
    /// `None` if the client disconnected in the meantime.
    async fn dispatch(&mut self, request: Frame) -> Result<Option<Frame>> {
        let transaction_id = request.hdr.transaction_id;
        let (pending, mut slot) = PendingRequest::new(self.id, request.clone());
        match self.queue.try_enqueue(pending) {
            Ok(()) => {}
            Err(Error::QueueFull) if self.config.on_queue_full == OnQueueFull::RespondBusy => {
                log::warn!(
                    "Session {}: request queue full, rejecting transaction {transaction_id}",
                    self.id
                );
                return Ok(Some(request.exception(ExceptionCode::ServerDeviceBusy)));
            }
            Err(err) => return Err(err),
        }

        // Returning early drops the slot, so the worker discards the request
        // or its late result
        let mut deadline = pin!(sleep(self.config.timeout));
        let result = loop {
            tokio::select! {
                result = &mut slot => break result,
                () = &mut deadline => {
                    log::warn!(
                        "Session {}: no response for transaction {transaction_id} within {:?}, abandoning",
                        self.id,
                        self.config.timeout
                    );
                    return Ok(Some(request.exception(ExceptionCode::GatewayTargetDevice)));
                }
                next = self.reader.next(), if self.lookahead.is_none() => match next {
                    Some(Ok(frame)) => self.lookahead = Some(frame),
                    Some(Err(err)) => return Err(err),
                    None => {
                        log::info!(
                            "Session {}: client left while transaction {transaction_id} was pending, abandoning",
                            self.id
                        );
                        return Ok(None);
                    }
                },
            }
        };

        match result {
            Ok(response) => Ok(Some(response)),
            Err(err) => {
                let Some(code) = err.exception_code() else {
                    return Err(err);
                };
                log::debug!(
                    "Session {}: transaction {transaction_id} failed: {err}",
                    self.id
                );
                Ok(Some(request.exception(code)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use bytes::Bytes;
    use tokio::io::{duplex, AsyncWriteExt as _, DuplexStream};
    use tokio_util::codec::Framed;

    use super::*;
    use crate::{
        error::FrameError,
        frame::Header,
        queue::{bounded, RequestReceiver},
    };

    struct Client {
        framed: Framed<DuplexStream, FrameCodec>,
    }

    impl Client {
        async fn call(&mut self, request: Frame) -> Option<Frame> {
            self.framed.send(request).await.unwrap();
            self.framed.next().await.map(Result::unwrap)
        }
    }

    fn start_session(
        queue: RequestQueue,
        config: SessionConfig,
    ) -> (Client, tokio::task::JoinHandle<Result<()>>) {
        let (client, server) = duplex(1024);
        let session = Session::new(
            1,
            "127.0.0.1:50200".parse().unwrap(),
            server,
            FrameCodec::default(),
            queue,
            config,
        );
        let task = tokio::spawn(session.run());
        let client = Client {
            framed: Framed::new(client, FrameCodec::default()),
        };
        (client, task)
    }

    fn request(transaction_id: u16) -> Frame {
        Frame::new(
            Header {
                transaction_id,
                unit_id: 1,
            },
            vec![0x03, 0x00, 0x6B, 0x00, 0x03],
        )
    }

    fn response(transaction_id: u16) -> Frame {
        Frame::new(
            Header {
                transaction_id,
                unit_id: 1,
            },
            vec![0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64],
        )
    }

    /// Answers requests like a device would, without an upstream link.
    fn fake_worker(rx: RequestReceiver) {
        tokio::spawn(async move {
            while let Some(req) = rx.dequeue().await {
                let transaction_id = req.frame.hdr.transaction_id;
                req.fulfil(Ok(response(transaction_id)));
            }
        });
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let (queue, rx) = bounded(4);
        fake_worker(rx);
        let (mut client, task) = start_session(queue, SessionConfig::default());

        assert_eq!(client.call(request(7)).await, Some(response(7)));
        assert_eq!(client.call(request(8)).await, Some(response(8)));

        drop(client);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn queue_full_responds_busy() {
        let (queue, _rx) = bounded(1);
        let (blocker, _slot) = PendingRequest::new(99, request(99));
        queue.try_enqueue(blocker).unwrap();
        let (mut client, _task) = start_session(queue, SessionConfig::default());

        let rsp = client.call(request(3)).await.unwrap();
        assert_eq!(rsp.hdr, request(3).hdr);
        assert_eq!(rsp.pdu, Bytes::from_static(&[0x83, 0x06]));
    }

    #[tokio::test]
    async fn queue_full_disconnects() {
        let (queue, _rx) = bounded(1);
        let (blocker, _slot) = PendingRequest::new(99, request(99));
        queue.try_enqueue(blocker).unwrap();
        let config = SessionConfig {
            on_queue_full: OnQueueFull::Disconnect,
            ..Default::default()
        };
        let (mut client, task) = start_session(queue, config);

        assert_eq!(client.call(request(3)).await, None);
        assert!(matches!(task.await.unwrap(), Err(Error::QueueFull)));
    }

    #[tokio::test]
    async fn upstream_failure_becomes_exception() {
        let (queue, rx) = bounded(1);
        tokio::spawn(async move {
            let req = rx.dequeue().await.unwrap();
            req.fulfil(Err(Error::UpstreamUnavailable(
                io::ErrorKind::ConnectionRefused.into(),
            )));
            let req = rx.dequeue().await.unwrap();
            req.fulfil(Err(Error::UpstreamTimeout(Duration::from_secs(1))));
        });
        let (mut client, _task) = start_session(queue, SessionConfig::default());

        let rsp = client.call(request(1)).await.unwrap();
        assert_eq!(rsp.pdu, Bytes::from_static(&[0x83, 0x0A]));
        let rsp = client.call(request(2)).await.unwrap();
        assert_eq!(rsp.hdr.transaction_id, 2);
        assert_eq!(rsp.pdu, Bytes::from_static(&[0x83, 0x0B]));
    }

    #[tokio::test]
    async fn timeout_abandons_request() {
        let (queue, rx) = bounded(4);
        let config = SessionConfig {
            timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (mut client, _task) = start_session(queue, config);

        let rsp = client.call(request(5)).await.unwrap();
        assert_eq!(rsp.pdu, Bytes::from_static(&[0x83, 0x0B]));

        // The late answer goes nowhere
        let req = rx.dequeue().await.unwrap();
        assert!(req.is_abandoned());
        assert!(!req.fulfil(Ok(response(5))));

        // The session keeps serving its client
        fake_worker(rx);
        assert_eq!(client.call(request(6)).await, Some(response(6)));
    }

    #[tokio::test]
    async fn disconnect_abandons_pending_request() {
        let (queue, rx) = bounded(4);
        let (mut client, task) = start_session(queue, SessionConfig::default());

        client.framed.send(request(9)).await.unwrap();
        let req = rx.dequeue().await.unwrap();
        assert!(!req.is_abandoned());

        drop(client);
        let finished = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(finished.is_ok());

        // A worker picking it up now skips it
        assert!(req.is_abandoned());
        assert!(!req.fulfil(Ok(response(9))));
    }

    #[tokio::test]
    async fn requests_sent_ahead_are_answered_in_order() {
        let (queue, rx) = bounded(4);
        let (mut client, _task) = start_session(queue, SessionConfig::default());

        client.framed.send(request(1)).await.unwrap();
        client.framed.send(request(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let first = rx.dequeue().await.unwrap();
        assert_eq!(first.frame.hdr.transaction_id, 1);
        // The second request waits until the first one has been answered
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.dequeue())
                .await
                .is_err()
        );
        assert!(first.fulfil(Ok(response(1))));
        let second = rx.dequeue().await.unwrap();
        assert_eq!(second.frame.hdr.transaction_id, 2);
        assert!(second.fulfil(Ok(response(2))));

        assert_eq!(client.framed.next().await.unwrap().unwrap(), response(1));
        assert_eq!(client.framed.next().await.unwrap().unwrap(), response(2));
    }

    #[tokio::test]
    async fn malformed_frame_closes_session() {
        let (queue, _rx) = bounded(4);
        let (mut client, task) = start_session(queue, SessionConfig::default());

        client
            .framed
            .get_mut()
            .write_all(&[0x00, 0x01, 0x12, 0x34, 0x00, 0x06, 0x01])
            .await
            .unwrap();
        assert!(client.framed.next().await.is_none());
        assert!(matches!(
            task.await.unwrap(),
            Err(Error::Frame(FrameError::InvalidProtocolId(0x1234)))
        ));
    }
}
