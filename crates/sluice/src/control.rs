//! Control session dialing and the one-shot control exchange.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use sluice_common::{dial_control, ControlEndpoint, MuxSession, TunnelError};
use sluice_protocol::{
    ControlCodec, ControlRequest, HttpTunnelRequest, HttpTunnelResponse, TcpTunnelRequest,
    TcpTunnelResponse,
};

/// First delay between reconnect attempts
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Upper bound for the delay between reconnect attempts
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Sleep for `delay` unless `cancel` fires first
pub(crate) async fn sleep_or_cancel(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), TunnelError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Dial the control endpoint, retrying transport failures with backoff
///
/// Only returns an error when `cancel` fires.
pub async fn dial_control_with_retry(
    endpoint: &ControlEndpoint,
    cancel: &CancellationToken,
) -> Result<MuxSession, TunnelError> {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            result = dial_control(endpoint) => result,
        };

        match attempt {
            Ok(session) => return Ok(session),
            Err(e) => {
                tracing::warn!(
                    "Failed to reach {}:{}: {} (retrying in {:?})",
                    endpoint.host,
                    endpoint.port,
                    e,
                    backoff
                );
                sleep_or_cancel(backoff, cancel).await?;
                backoff = next_backoff(backoff);
            }
        }
    }
}

/// Send one control request on a fresh stream and read the single response
async fn exchange<Resp>(session: &MuxSession, request: ControlRequest) -> Result<Resp, TunnelError>
where
    Resp: DeserializeOwned,
{
    let stream = session.open_stream().await?;
    let mut framed = Framed::new(stream, ControlCodec::<Resp>::new());

    framed.send(request).await?;

    // The server closes the stream right after answering; a decoded
    // response wins over whatever error the close produces.
    let response = match framed.next().await {
        Some(Ok(response)) => response,
        Some(Err(e)) => return Err(e.into()),
        None => return Err(TunnelError::ConnectionClosed),
    };

    let _ = SinkExt::<ControlRequest>::close(&mut framed).await;
    Ok(response)
}

/// Ask the server for an HTTP tunnel
///
/// A rejection becomes [`TunnelError::Rejected`]; a success without both an
/// id and a URL is [`TunnelError::InvalidResponse`].
pub async fn request_http_tunnel(
    session: &MuxSession,
    request: HttpTunnelRequest,
) -> Result<HttpTunnelResponse, TunnelError> {
    let response: HttpTunnelResponse = exchange(session, ControlRequest::Http(request)).await?;
    let response = response.into_result()?;

    if response.id.trim().is_empty() || response.url.trim().is_empty() {
        return Err(TunnelError::InvalidResponse);
    }
    Ok(response)
}

/// Ask the server for a TCP tunnel and return the assigned public port
pub async fn request_tcp_tunnel(
    session: &MuxSession,
    request: TcpTunnelRequest,
) -> Result<u16, TunnelError> {
    let response: TcpTunnelResponse = exchange(session, ControlRequest::Tcp(request)).await?;
    let response = response.into_result()?;

    if response.remote_port == 0 {
        return Err(TunnelError::InvalidResponse);
    }
    Ok(response.remote_port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_common::Role;
    use sluice_protocol::{ControlError, ErrorKind, RawControlRequest};

    fn pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            MuxSession::new(a, Role::Client),
            MuxSession::new(b, Role::Server),
        )
    }

    /// Answer the next control request with `response`, returning what was asked
    fn answer_once<T>(server: MuxSession, response: T) -> tokio::task::JoinHandle<RawControlRequest>
    where
        T: serde::Serialize + Send + 'static,
    {
        tokio::spawn(async move {
            let stream = server.accept_stream().await.unwrap();
            let mut framed = Framed::new(stream, ControlCodec::<RawControlRequest>::new());
            let request = framed.next().await.unwrap().unwrap();
            framed.send(response).await.unwrap();
            SinkExt::<T>::close(&mut framed).await.unwrap();
            request
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut delay = INITIAL_BACKOFF;
        let mut seen = vec![delay];
        for _ in 0..6 {
            delay = next_backoff(delay);
            seen.push(delay);
        }
        assert_eq!(seen[1], Duration::from_millis(500));
        assert_eq!(seen[4], Duration::from_secs(4));
        assert_eq!(*seen.last().unwrap(), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_http_request_success() {
        let (client, server) = pair();
        let asked = answer_once(
            server,
            HttpTunnelResponse::success("demo", "https://demo.tunnel.example.com"),
        );

        let response = request_http_tunnel(
            &client,
            HttpTunnelRequest {
                authtoken: "secret".to_string(),
                subdomain: "demo".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(response.id, "demo");
        assert_eq!(response.url, "https://demo.tunnel.example.com");

        let asked = asked.await.unwrap();
        assert_eq!(asked.raw_type(), "http");
        assert_eq!(asked.authtoken(), "secret");
    }

    #[tokio::test]
    async fn test_rejection_carries_kind() {
        let (client, server) = pair();
        let _asked = answer_once(
            server,
            TcpTunnelResponse::rejected(&ControlError::new(ErrorKind::PortUnavailable)),
        );

        let err = request_tcp_tunnel(
            &client,
            TcpTunnelRequest {
                authtoken: "secret".to_string(),
                remote_port: 30001,
            },
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "requested port unavailable");
    }

    #[tokio::test]
    async fn test_success_without_identity_is_invalid() {
        let (client, server) = pair();
        let _asked = answer_once(server, HttpTunnelResponse::success("", ""));

        let err = request_http_tunnel(&client, HttpTunnelRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::InvalidResponse));
    }

    #[tokio::test]
    async fn test_dial_retry_stops_on_cancel() {
        // Nothing listens on a port we just released
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = ControlEndpoint::parse(&format!("http://127.0.0.1:{}", port)).unwrap();
        let cancel = CancellationToken::new();
        let dial = tokio::spawn({
            let cancel = cancel.clone();
            async move { dial_control_with_retry(&endpoint, &cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), dial)
            .await
            .expect("dial did not observe cancellation")
            .unwrap();
        assert!(matches!(result, Err(TunnelError::Cancelled)));
    }
}
