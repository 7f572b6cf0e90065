//! Authentication handshake, run on the raw transport halves before the session starts.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tracing::debug;

use crate::codec::{HubCodec, IncomingMessage, OutgoingMessage};
use crate::core::{HubError, HubResult, WsFrame};

fn unexpected(message: &IncomingMessage, stage: &str) -> HubError {
    HubError::InvalidOperation(format!("unexpected {message:?} while {stage}"))
}

async fn next_messages<R>(reader: &mut R, codec: &impl HubCodec) -> HubResult<Vec<IncomingMessage>>
where
    R: Stream<Item = Result<WsFrame, HubError>> + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(WsFrame::Close(_))) | None => {
                return Err(HubError::ConnectionFailed(
                    "hub closed the socket during authentication".to_string(),
                ));
            }
            Some(Ok(frame)) => {
                let messages = codec.decode(&frame)?;
                if !messages.is_empty() {
                    return Ok(messages);
                }
            }
            Some(Err(err)) => return Err(err),
        }
    }
}

/// Wait for `auth_required`, answer with the credential and await the verdict.
///
/// Returns the version banner from `auth_ok` (or `auth_required` when `auth_ok` omits it).
pub(crate) async fn authenticate<R, W, C>(
    reader: &mut R,
    writer: &mut W,
    codec: &C,
    access_token: &str,
) -> HubResult<Option<String>>
where
    R: Stream<Item = Result<WsFrame, HubError>> + Unpin,
    W: Sink<WsFrame, Error = HubError> + Unpin,
    C: HubCodec,
{
    let mut messages = next_messages(reader, codec).await?.into_iter();
    let banner = match messages.next() {
        Some(IncomingMessage::AuthRequired { ha_version }) => ha_version,
        Some(other) => return Err(unexpected(&other, "waiting for auth_required")),
        None => None,
    };
    if let Some(extra) = messages.next() {
        return Err(unexpected(&extra, "waiting for auth_required"));
    }
    debug!(version = ?banner, "hub requested authentication");

    let frame = codec.encode(None, &OutgoingMessage::auth(access_token))?;
    writer.send(frame).await?;

    let mut verdict = next_messages(reader, codec).await?.into_iter();
    match verdict.next() {
        Some(IncomingMessage::AuthOk { ha_version }) => Ok(ha_version.or(banner)),
        Some(IncomingMessage::AuthInvalid { message }) => {
            Err(HubError::AuthenticationFailed { message })
        }
        Some(other) => Err(unexpected(&other, "waiting for auth_ok")),
        None => Err(HubError::InvalidOperation(
            "empty frame while waiting for auth_ok".to_string(),
        )),
    }
}
