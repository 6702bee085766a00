use core::net::SocketAddr;

use anyhow::Error;
use bytes::Bytes;
use http::Request;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1::{self, SendRequest};
use tokio::net::TcpSocket;

use self::io::TokioIo;
use super::{Context, Scenario};
use crate::{stat::Outcome, Produce};

mod io;
pub mod payload;

/// HTTP scenario config.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target endpoint.
    pub addr: SocketAddr,
    /// Expected response status. Anything else fails the iteration's check.
    pub expect_status: u16,
    /// Enable SOCK_NODELAY socket option.
    pub tcp_no_delay: bool,
    /// Request templates, cycled across iterations.
    pub requests: Vec<Request<Empty<Bytes>>>,
}

/// Per-worker HTTP executor.
///
/// Performs one request per iteration over a persistent HTTP/1.1 connection,
/// reconnecting lazily after transport failures, and checks the response
/// status against the expected one.
#[derive(Debug)]
pub struct HttpScenario<D> {
    /// Target endpoint.
    addr: SocketAddr,
    /// Requests to send.
    data: D,
    /// Expected response status.
    expect_status: u16,
    /// Enable SOCK_NODELAY socket option.
    tcp_no_delay: bool,
    /// Currently established connection, if any.
    sender: Option<SendRequest<Empty<Bytes>>>,
}

impl<D> HttpScenario<D> {
    pub fn new(addr: SocketAddr, data: D, expect_status: u16, tcp_no_delay: bool) -> Self {
        Self {
            addr,
            data,
            expect_status,
            tcp_no_delay,
            sender: None,
        }
    }
}

impl<D> HttpScenario<D>
where
    D: Produce<Item = Request<Empty<Bytes>>> + Send,
{
    async fn do_execute(&mut self) -> Outcome {
        let mut sender = match self.curr_conn().await {
            Ok(sender) => sender,
            Err(err) => {
                log::debug!("failed to connect to {}: {err}", self.addr);
                return Outcome::TransportError;
            }
        };

        let code = match self.perform_request(&mut sender).await {
            Ok(code) => code,
            Err(err) => {
                log::debug!("request failed: {err}");
                return Outcome::TransportError;
            }
        };

        // The exchange completed, keep the connection for the next iteration.
        self.sender = Some(sender);

        if code == self.expect_status {
            Outcome::Success
        } else {
            Outcome::CheckFailed
        }
    }

    async fn perform_request(&mut self, sender: &mut SendRequest<Empty<Bytes>>) -> Result<u16, Error> {
        let req = self.data.next();
        let mut resp = sender.send_request(req.clone()).await?;

        let code = resp.status().as_u16();
        while let Some(next) = resp.frame().await {
            next?;
        }

        Ok(code)
    }

    async fn curr_conn(&mut self) -> Result<SendRequest<Empty<Bytes>>, Error> {
        match self.sender.take() {
            Some(sender) if !sender.is_closed() => Ok(sender),
            _ => self.reconnect().await,
        }
    }

    async fn reconnect(&mut self) -> Result<SendRequest<Empty<Bytes>>, Error> {
        let sock = match self.addr {
            SocketAddr::V4(..) => TcpSocket::new_v4()?,
            SocketAddr::V6(..) => TcpSocket::new_v6()?,
        };

        let stream = sock.connect(self.addr).await?;
        if self.tcp_no_delay {
            stream.set_nodelay(true)?;
        }

        let io = TokioIo::new(stream);
        let (sender, conn) = http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("connection closed: {err}");
            }
        });

        Ok(sender)
    }
}

impl<D> Scenario for HttpScenario<D>
where
    D: Produce<Item = Request<Empty<Bytes>>> + Send,
{
    async fn execute(&mut self, _ctx: &Context) -> Outcome {
        self.do_execute().await
    }
}
