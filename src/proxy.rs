//! Typed client for the remote bootstrap service.
//!
//! The coordinator talks to the remote through the [`BootstrapTransport`]
//! trait; [`RemoteBootstrapProxy`] is the gRPC implementation. Connections
//! are made through a [`Messenger`], so tests can substitute an in-process
//! transport.

use std::net::SocketAddr;
use std::time::Duration;

use prost::Message;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;

use crate::error::{BootstrapError, Result};
use crate::pb;
use crate::pb::remote_bootstrap_service_client::RemoteBootstrapServiceClient;

/// The three operations of the remote bootstrap protocol. Each call carries
/// its own deadline; nothing is retained between calls.
#[tonic::async_trait]
pub trait BootstrapTransport: Send {
    async fn begin_session(
        &mut self,
        req: pb::BeginSessionRequest,
        deadline: Duration,
    ) -> Result<pb::BeginSessionResponse>;

    async fn fetch_data(
        &mut self,
        req: pb::FetchDataRequest,
        deadline: Duration,
    ) -> Result<pb::FetchDataResponse>;

    async fn end_session(
        &mut self,
        req: pb::EndSessionRequest,
        deadline: Duration,
    ) -> Result<pb::EndSessionResponse>;
}

/// Connection factory for [`BootstrapTransport`] instances. Connecting is
/// bounded by `deadline` like every other remote operation.
#[tonic::async_trait]
pub trait Messenger: Send + Sync {
    async fn connect(
        &self,
        addr: SocketAddr,
        deadline: Duration,
    ) -> Result<Box<dyn BootstrapTransport>>;
}

/// Messenger producing gRPC-backed transports.
pub struct GrpcMessenger;

#[tonic::async_trait]
impl Messenger for GrpcMessenger {
    async fn connect(
        &self,
        addr: SocketAddr,
        deadline: Duration,
    ) -> Result<Box<dyn BootstrapTransport>> {
        Ok(Box::new(RemoteBootstrapProxy::connect(addr, deadline).await?))
    }
}

/// gRPC client for the remote bootstrap service.
pub struct RemoteBootstrapProxy {
    inner: RemoteBootstrapServiceClient<Channel>,
}

impl RemoteBootstrapProxy {
    pub async fn connect(addr: SocketAddr, deadline: Duration) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}", addr)).map_err(|e| {
            BootstrapError::InvalidArgument(format!("bad endpoint address {}: {}", addr, e))
        })?;
        let channel = match tokio::time::timeout(deadline, endpoint.connect()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                return Err(BootstrapError::Remote(format!(
                    "unable to connect to {}: {}",
                    addr, e
                )))
            }
            Err(_) => {
                return Err(BootstrapError::TimedOut(format!(
                    "connecting to {} timed out after {} ms",
                    addr,
                    deadline.as_millis()
                )))
            }
        };
        Ok(RemoteBootstrapProxy {
            inner: RemoteBootstrapServiceClient::new(channel),
        })
    }
}

#[tonic::async_trait]
impl BootstrapTransport for RemoteBootstrapProxy {
    async fn begin_session(
        &mut self,
        req: pb::BeginSessionRequest,
        deadline: Duration,
    ) -> Result<pb::BeginSessionResponse> {
        let call = self
            .inner
            .begin_remote_bootstrap_session(tonic::Request::new(req));
        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => Err(status_to_error(status)),
            Err(_) => Err(BootstrapError::TimedOut(format!(
                "BeginRemoteBootstrapSession timed out after {} ms",
                deadline.as_millis()
            ))),
        }
    }

    async fn fetch_data(
        &mut self,
        req: pb::FetchDataRequest,
        deadline: Duration,
    ) -> Result<pb::FetchDataResponse> {
        let call = self.inner.fetch_data(tonic::Request::new(req));
        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => Err(status_to_error(status)),
            Err(_) => Err(BootstrapError::TimedOut(format!(
                "FetchData timed out after {} ms",
                deadline.as_millis()
            ))),
        }
    }

    async fn end_session(
        &mut self,
        req: pb::EndSessionRequest,
        deadline: Duration,
    ) -> Result<pb::EndSessionResponse> {
        let call = self
            .inner
            .end_remote_bootstrap_session(tonic::Request::new(req));
        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => Err(status_to_error(status)),
            Err(_) => Err(BootstrapError::TimedOut(format!(
                "EndRemoteBootstrapSession timed out after {} ms",
                deadline.as_millis()
            ))),
        }
    }
}

/// Converts an error response into a final, user-meaningful error.
///
/// A service failure carries a typed [`pb::RemoteBootstrapError`] in the
/// status details; its symbolic code name and message are appended to the
/// outer error text.
pub(crate) fn status_to_error(status: tonic::Status) -> BootstrapError {
    if status.code() == Code::DeadlineExceeded {
        return BootstrapError::TimedOut(status.message().to_string());
    }
    let details = status.details();
    if !details.is_empty() {
        return match pb::RemoteBootstrapError::decode(details) {
            Ok(remote) => BootstrapError::Remote(format!(
                "Received error code {} from remote service: {}",
                remote.code().as_str_name(),
                remote.message
            )),
            Err(e) => BootstrapError::InvalidArgument(format!(
                "Unable to decode remote bootstrap RPC error message: {}: {}",
                status.message(),
                e
            )),
        };
    }
    match status.code() {
        // Connection-level failure, not a response from the service.
        Code::Unavailable => {
            BootstrapError::Remote(format!("transport unavailable: {}", status.message()))
        }
        code => BootstrapError::InvalidArgument(format!(
            "Unable to decode remote bootstrap RPC error message: {:?}: {}",
            code,
            status.message()
        )),
    }
}
