// Adapted from the tonic UDS example: https://github.com/hyperium/tonic/blob/f1275b611e38ec5fe992b2f10552bf95e8448b17/examples/src/uds/client.rs

use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

/// Returns a new UNIX socket channel suitable for use with tonic generated gRPC clients. Instead of
/// using `YourClient::connect`, pass the returned channel to `YourClient::new`
pub async fn socket_channel<P: AsRef<Path>>(path: P) -> Result<Channel, tonic::transport::Error> {
    let path = path.as_ref().to_owned();

    // The URI is required by the endpoint but ignored by the connector
    Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(path.clone())))
        .await
}

/// Dials the socket up to `attempts` times, sleeping `interval` between attempts. Returns the
/// error of the last attempt.
pub async fn dial_with_retries<P: AsRef<Path>>(
    path: P,
    attempts: usize,
    interval: Duration,
) -> Result<Channel, tonic::transport::Error> {
    let path = path.as_ref();
    let mut attempt = 1;
    loop {
        match socket_channel(path).await {
            Ok(channel) => return Ok(channel),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                debug!(socket = ?path, attempt, error = %e, "Socket not reachable yet");
                attempt += 1;
                tokio::time::sleep(interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_missing_socket_fails() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let res = dial_with_retries(dir.path().join("missing.sock"), 3, Duration::from_millis(10)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_dial_bound_socket() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let path = dir.path().join("bound.sock");
        let _socket = super::super::server::Socket::new(&path).expect("should be able to bind");
        assert!(dial_with_retries(&path, 1, Duration::from_millis(10)).await.is_ok());
    }
}
