//! Per-connection worker: one authenticate exchange binds the
//! connection to an identity, then requests are dispatched until the
//! peer hangs up. Only framing errors terminate the loop; everything
//! else becomes a status response.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use super::ServerState;
use super::error::StoreError;
use super::users::AuthOutcome;
use crate::wire::{self, FrameError, Kind, Message, Status};

pub(crate) async fn serve<S>(state: Arc<ServerState>, mut stream: S) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(identity) = authenticate(&state, &mut stream).await? else {
        return Ok(());
    };
    tracing::debug!(%identity, "connection authenticated");

    loop {
        let Some(request) = wire::read_request(&mut stream).await? else {
            tracing::debug!(%identity, "peer closed the connection");
            return Ok(());
        };
        let response = super::routes::dispatch(&state, &identity, &request).await;
        wire::write_message(&mut stream, &response).await?;
    }
}

/// Run the single credential exchange that must open every
/// connection. `Ok(None)` means the connection should be closed
/// without serving further requests.
async fn authenticate<S>(
    state: &ServerState,
    stream: &mut S,
) -> Result<Option<String>, FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(request) = wire::read_request(stream).await? else {
        return Ok(None);
    };

    let refuse = |status| Message::response(status, request.correlation_id.clone());

    let Kind::Request { route } = &request.kind else {
        wire::write_message(stream, &refuse(Status::BadRequest)).await?;
        return Ok(None);
    };
    if route != "authenticate" {
        wire::write_message(stream, &refuse(Status::BadRequest)).await?;
        return Ok(None);
    }
    let (Some(id), Some(secret)) = (request.field("id"), request.field("secret")) else {
        wire::write_message(stream, &refuse(Status::BadRequest)).await?;
        return Ok(None);
    };

    let (status, identity) = match state.users.authenticate(id, secret) {
        Ok(AuthOutcome::Accepted) => (Status::Ok, Some(id.to_string())),
        Ok(AuthOutcome::NewUser) => (Status::NewUser, Some(id.to_string())),
        Ok(AuthOutcome::WrongPassword) => {
            tracing::debug!(id, "wrong password");
            (Status::WrongPassword, None)
        }
        Err(StoreError::InvalidName(_)) => (Status::BadRequest, None),
        Err(e) => {
            tracing::warn!(id, "credential check failed: {e}");
            (Status::InternalError, None)
        }
    };

    wire::write_message(stream, &refuse(status)).await?;
    Ok(identity)
}
