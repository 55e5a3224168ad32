//! Session handshake.
//!
//! Outbound is fire-and-forget: dial, send the authentication payload the
//! consensus layer built, and start talking — a server that rejects us
//! closes the stream. Inbound is the strict side: exactly one frame within
//! the ceiling, it must be an authentication message, and the consensus
//! layer must accept it before a session exists.

use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;
use crate::host::PeerHost;
use crate::identity::NodeId;
use crate::message::{parse_network_message, MSG_AUTHENTICATION};
use crate::peer::PeerSession;
use crate::transport::Client;

/// Hard ceiling on the inbound handshake round trip.
pub(crate) const HANDSHAKE_RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Receive and verify the handshake on a fresh inbound stream, yielding
/// the peer's session. The session records the observed remote address,
/// never a self-advertised one.
pub(crate) async fn authenticate_inbound(
    host: &Arc<PeerHost>,
    client: &Arc<dyn Client>,
) -> Result<Arc<PeerSession>, TransportError> {
    let frame = tokio::time::timeout(HANDSHAKE_RECV_TIMEOUT, client.receive())
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;
    let msg = parse_network_message(frame.version, &frame.payload)?;
    if msg.mtype != MSG_AUTHENTICATION {
        return Err(TransportError::Auth(format!(
            "first message has type {}, not authentication",
            msg.mtype
        )));
    }

    let token = host
        .handle
        .authenticate_as(host.id(), &msg.data, host.config.handshake_timeout)
        .await
        .map_err(|e| TransportError::Auth(e.to_string()))?;
    if token.peer_id == host.id() {
        return Err(TransportError::Auth("peer presented our own identity".into()));
    }

    let session = host.new_session(token.peer_id, client.remote_addr(), token.is_relayer);
    session.set_auth_token(token);
    Ok(session)
}

/// Dial `addr` and introduce ourselves to `remote`. No inline reply is
/// expected; rejection shows up as the stream being closed.
pub(crate) async fn authenticate_outbound(
    host: &Arc<PeerHost>,
    remote: NodeId,
    addr: &str,
) -> Result<Arc<dyn Client>, TransportError> {
    let client = host.transport.dial(addr).await?;
    let payload = host.handle.build_authentication_message(remote).await?;
    if let Err(e) = client.send(&payload).await {
        client.close("authentication send failed").await;
        return Err(TransportError::Transport(e));
    }
    Ok(client)
}
